//! Runtime configuration
//!
//! One explicit struct built from CLI arguments; every well-known path
//! derives from the work directory. Handlers receive `&Config` instead of
//! consulting globals.

use std::path::{Path, PathBuf};

use injector_common::AbiWidth;

/// Program paths the supervisor watches for. The zygote respawns as one of
/// these depending on ABI width.
pub const TARGET_PROGRAM_64: &str = "/system/bin/app_process64";
pub const TARGET_PROGRAM_32: &str = "/system/bin/app_process32";

/// File name (basename) of the target's C runtime in its memory map.
pub const LIBC_NAME: &str = "libc.so";

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the control socket, status files, payload images
    /// and companion binaries.
    pub workdir: PathBuf,
    /// Pid of the root process whose descendant tree is traced.
    pub root_pid: i32,
    /// Map read-only payload segments from a remotely-opened file descriptor
    /// instead of copying their bytes in.
    pub file_backed_load: bool,
}

impl Config {
    #[must_use]
    pub fn new(workdir: PathBuf, root_pid: i32, file_backed_load: bool) -> Self {
        Self { workdir, root_pid, file_backed_load }
    }

    /// Control datagram socket the supervisor binds.
    #[must_use]
    pub fn socket_path(&self) -> PathBuf {
        self.workdir.join("monitor.sock")
    }

    /// Human-readable one-line status file.
    #[must_use]
    pub fn status_path(&self) -> PathBuf {
        self.workdir.join("module.prop")
    }

    /// Machine-readable state file.
    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.workdir.join("state.json")
    }

    /// The payload image to load into a zygote of the given width.
    #[must_use]
    pub fn payload_path(&self, abi: AbiWidth) -> PathBuf {
        let dir = match abi {
            AbiWidth::Abi64 => "lib64",
            AbiWidth::Abi32 => "lib",
        };
        self.workdir.join(dir).join("libpayload.so")
    }

    /// The companion daemon binary for the given width.
    #[must_use]
    pub fn daemon_path(&self, abi: AbiWidth) -> PathBuf {
        self.workdir.join("bin").join(format!("payloadd{}", abi.suffix()))
    }

    /// The sibling tracer binary for the given width, used when a target's
    /// ABI does not match this process's own.
    #[must_use]
    pub fn tracer_path(&self, abi: AbiWidth) -> PathBuf {
        self.workdir.join("bin").join(format!("zygote-injector{}", abi.suffix()))
    }

    /// Classify an exec'd program path against the known target names.
    #[must_use]
    pub fn target_abi(program: &Path) -> Option<AbiWidth> {
        match program.to_str() {
            Some(TARGET_PROGRAM_64) => Some(AbiWidth::Abi64),
            Some(TARGET_PROGRAM_32) => Some(AbiWidth::Abi32),
            _ => None,
        }
    }

    /// The ABI width this binary was built for.
    #[must_use]
    pub fn native_abi() -> AbiWidth {
        if cfg!(target_pointer_width = "64") {
            AbiWidth::Abi64
        } else {
            AbiWidth::Abi32
        }
    }
}
