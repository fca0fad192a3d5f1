//! # zygote-injector - Main Entry Point
//!
//! Three modes behind one binary: `monitor` runs the long-lived supervisor,
//! `trace` performs a single injection into an already-stopped target (the
//! supervisor spawns the foreign-width sibling this way), and `ctl` sends a
//! request to a running monitor's control socket.

use anyhow::{Context, Result};
use clap::Parser;
use injector_common::ControlMessage;
use log::debug;
use nix::unistd::Pid;

use zygote_injector::cli::{Args, Command, CtlOp};
use zygote_injector::config::Config;
use zygote_injector::injection::Injector;
use zygote_injector::supervisor;

const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_NOPERM: i32 = 77;

fn main() {
    env_logger::init();

    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            exit_code_for(&e)
        }
    });
}

/// Ptrace and /proc access need root (or CAP_SYS_PTRACE); surface that as a
/// distinct exit code so wrappers can tell misconfiguration from failure.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    let msg = format!("{err:#}").to_lowercase();
    if msg.contains("permission denied") || msg.contains("operation not permitted") {
        EXIT_NOPERM
    } else {
        EXIT_ERROR
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Monitor { workdir, root_pid, file_backed } => {
            let workdir = workdir
                .canonicalize()
                .with_context(|| format!("Failed to resolve workdir {}", workdir.display()))?;
            supervisor::run(Config::new(workdir, root_pid, file_backed))
        }
        Command::Trace { pid, payload, workdir, file_backed } => {
            let config = Config::new(workdir, 0, file_backed);
            let payload =
                payload.unwrap_or_else(|| config.payload_path(Config::native_abi()));
            Injector::new(payload, file_backed)
                .trace(Pid::from_raw(pid))
                .with_context(|| format!("Failed to inject into pid {pid}"))?;
            // A monitor may or may not be listening; either way the injection
            // already happened.
            if let Err(err) = ControlMessage::ZygoteInjected(Config::native_abi())
                .send_to(&config.socket_path())
            {
                debug!("no monitor reachable at {}: {err}", config.socket_path().display());
            }
            Ok(())
        }
        Command::Ctl { op, workdir } => {
            let config = Config::new(workdir, 0, false);
            let msg = match op {
                CtlOp::Start => ControlMessage::Start,
                CtlOp::Stop => ControlMessage::Stop,
                CtlOp::Exit => ControlMessage::Exit,
            };
            msg.send_to(&config.socket_path()).with_context(|| {
                format!("Failed to reach a monitor at {}", config.socket_path().display())
            })
        }
    }
}
