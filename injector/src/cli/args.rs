//! CLI argument definitions

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "zygote-injector",
    about = "Inject a payload image into respawning zygote processes",
    after_help = "\
EXAMPLES:
    zygote-injector monitor                  Supervise init's descendants (daemon mode)
    zygote-injector trace 4242               Inject into one already-exec'd pid
    zygote-injector ctl stop                 Ask a running monitor to stop tracing"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Trace the root process's descendant tree and inject on every zygote
    /// respawn
    Monitor {
        /// Directory holding the control socket, payload images and
        /// companion binaries
        #[arg(long, default_value = ".")]
        workdir: PathBuf,

        /// Pid of the process whose fork tree is traced
        #[arg(long, default_value = "1")]
        root_pid: i32,

        /// Map read-only payload segments from a remote file descriptor
        /// instead of copying bytes
        #[arg(long)]
        file_backed: bool,
    },

    /// Seize one freshly-exec'd target pid and perform a single injection
    Trace {
        /// Target pid (must already have exec'd the target program)
        pid: i32,

        /// Payload image to load (defaults to the one under --workdir)
        #[arg(long)]
        payload: Option<PathBuf>,

        #[arg(long, default_value = ".")]
        workdir: PathBuf,

        #[arg(long)]
        file_backed: bool,
    },

    /// Send a control request to a running monitor
    Ctl {
        #[arg(value_enum)]
        op: CtlOp,

        #[arg(long, default_value = ".")]
        workdir: PathBuf,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum CtlOp {
    Start,
    Stop,
    Exit,
}
