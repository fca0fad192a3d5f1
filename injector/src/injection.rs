//! Injection of the payload into one freshly exec'd target
//!
//! Drives a single pid through seize, entry-point interception, remote
//! load, entry invocation, and register restore. The synchronization trick:
//! the auxiliary vector's stored entry-point address is overwritten with an
//! invalid sentinel, so the target's own runtime loader finishes mapping the
//! ordinary library dependencies and then faults exactly once, before any
//! program code runs. At that fault the payload is loaded and invoked, the
//! real entry restored, and the target released.
//!
//! The fault window is loader-revision sensitive; an unexpected stop at any
//! point aborts this one injection and detaches best effort.

use std::fs;
use std::path::PathBuf;

use log::{debug, info, warn};
use nix::sys::ptrace;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;

use crate::config::LIBC_NAME;
use crate::domain::InjectorError;
use crate::image::host_page_size;
use crate::image::loader::{RemoteFns, RemoteLoader};
use crate::image::symbols::RemoteSymbols;
use crate::remote::arch::{CallAbi, NativeAbi, Registers};
use crate::remote::call::call_remote;
use crate::remote::maps::MemoryMap;
use crate::remote::{PtracedProcess, Stop, Tracee};

const WORD: usize = NativeAbi::WORD;

/// Sentinel the stored entry address is replaced with: invalid by
/// construction, with the real entry's mode bit preserved so the fault pc is
/// recognizable on both ISA states.
fn sentinel_for(entry: usize) -> usize {
    ((-0x0f_isize as usize) & !1) | (entry & 1)
}

pub struct Injector {
    payload: PathBuf,
    file_backed: bool,
}

impl Injector {
    #[must_use]
    pub fn new(payload: PathBuf, file_backed: bool) -> Self {
        Self { payload, file_backed }
    }

    /// Seize `pid`, inject, and release it. `pid` must be a group-stopped,
    /// untraced, already exec'd target.
    pub fn trace(&self, pid: Pid) -> Result<(), InjectorError> {
        info!("start tracing {pid}");
        ptrace::seize(pid, seize_options(kernel_at_least(3, 8)))
            .map_err(|e| InjectorError::from_tracee_errno(e, "seize"))?;

        let mut target = PtracedProcess::new(pid);
        let result = self.run(&mut target);
        if let Err(err) = &result {
            warn!("injection into {pid} failed: {err}");
            if let Err(detach_err) = ptrace::detach(pid, None) {
                debug!("detach after failure: {detach_err}");
            }
        }
        result
    }

    fn run(&self, target: &mut PtracedProcess) -> Result<(), InjectorError> {
        let pid = target.pid();
        expect_group_stop(target, Signal::SIGSTOP)?;
        self.inject_on_main(target)?;

        debug!("inject done, releasing {pid}");
        kill(pid, Signal::SIGCONT)
            .map_err(|e| InjectorError::from_tracee_errno(e, "kill SIGCONT"))?;
        target.resume(None)?;
        expect_group_stop(target, Signal::SIGTRAP)?;
        target.resume(None)?;
        match target.wait()? {
            Stop::Signal(Signal::SIGCONT) => {}
            other => {
                return Err(InjectorError::ProtocolMismatch(format!(
                    "expected SIGCONT delivery, got {other:?}"
                )));
            }
        }
        // One syscall step clears the stale ptrace event message that
        // pre-5.16 kernels would otherwise report to a later waitpid.
        ptrace::syscall(pid, None)
            .map_err(|e| InjectorError::from_tracee_errno(e, "syscall step"))?;
        let _ = waitpid(pid, Some(WaitPidFlag::__WALL))
            .map_err(|e| InjectorError::from_tracee_errno(e, "waitpid"))?;
        ptrace::detach(pid, Some(Signal::SIGCONT))
            .map_err(|e| InjectorError::from_tracee_errno(e, "detach"))?;
        info!("released {pid}");
        Ok(())
    }

    /// The core sequence, entered with the target in its initial group-stop.
    fn inject_on_main(&self, target: &mut PtracedProcess) -> Result<(), InjectorError> {
        let pid = target.pid();
        let (entry, entry_slot) = find_entry_slot(target)?;
        debug!("entry {entry:#x} stored at {entry_slot:#x} in {pid}");

        // Corrupt the stored entry so the runtime loader faults right before
        // handing control to the program, then let it run.
        let sentinel = sentinel_for(entry);
        target.write_word(entry_slot, sentinel)?;
        target.resume(None)?;
        match target.wait()? {
            Stop::Signal(Signal::SIGSEGV) => {}
            other => {
                return Err(InjectorError::ProtocolMismatch(format!(
                    "expected fault at sentinel, got {other:?}"
                )));
            }
        }
        let faulted = target.regs()?;
        let pc = NativeAbi::code_addr(NativeAbi::pc(&faulted));
        if pc != NativeAbi::code_addr(sentinel) {
            return Err(InjectorError::ProtocolMismatch(format!(
                "fault at {pc:#x}, expected sentinel {sentinel:#x}"
            )));
        }
        target.write_word(entry_slot, entry)?;
        let backup = faulted;

        // A failed load must not leave the target parked on the sentinel;
        // it resumes at its real entry either way.
        let result = self.load_and_call(target);
        let restored = restore_entry_regs(target, backup, entry);
        result?;
        restored
    }

    fn load_and_call(&self, target: &mut PtracedProcess) -> Result<(), InjectorError> {
        let pid = target.pid();
        // All baseline libraries are mapped now; no program code has run.
        let maps = MemoryMap::snapshot(pid)
            .map_err(|e| InjectorError::Transient(format!("read maps of {pid}: {e}")))?;
        let libc_path = maps
            .module_path(LIBC_NAME)
            .ok_or_else(|| {
                InjectorError::ProtocolMismatch(format!("{LIBC_NAME} not mapped in {pid}"))
            })?
            .to_string();
        let trap = maps.trap_addr(LIBC_NAME).ok_or_else(|| {
            InjectorError::ProtocolMismatch(format!("no usable trap page in {LIBC_NAME}"))
        })?;

        let page_size = host_page_size();
        let mut resolver = RemoteSymbols::new(&maps, page_size);
        let fns = RemoteFns {
            mmap: resolver.resolve_required(&libc_path, "mmap")?,
            mprotect: resolver.resolve_required(&libc_path, "mprotect")?,
            prctl: resolver.resolve_required(&libc_path, "prctl")?,
            open: if self.file_backed {
                Some(resolver.resolve_required(&libc_path, "open")?)
            } else {
                None
            },
            close: if self.file_backed {
                Some(resolver.resolve_required(&libc_path, "close")?)
            } else {
                None
            },
        };

        let loaded =
            RemoteLoader::new(target, fns, trap, page_size).load(&self.payload, &maps)?;
        info!(
            "loaded payload into {pid}: base {:#x} size {:#x} entry {:#x}",
            loaded.base, loaded.size, loaded.entry
        );

        call_remote(target, loaded.entry, trap, &[loaded.base, loaded.size])?;
        Ok(())
    }
}

/// Write back the pre-load register snapshot with the program counter (and
/// mode bit, where the ISA carries one) pointed at the real entry.
fn restore_entry_regs<T: Tracee + ?Sized>(
    target: &mut T,
    mut backup: Registers,
    entry: usize,
) -> Result<(), InjectorError> {
    NativeAbi::set_pc_mode(&mut backup, entry);
    target.set_regs(&backup)
}

/// `PTRACE_O_EXITKILL` and `PTRACE_O_TRACESECCOMP` both appeared in kernel
/// 3.8; older kernels get a bare seize.
fn seize_options(modern: bool) -> ptrace::Options {
    if modern {
        ptrace::Options::PTRACE_O_EXITKILL | ptrace::Options::PTRACE_O_TRACESECCOMP
    } else {
        ptrace::Options::empty()
    }
}

/// Walk the initial stack image: argc, argv, envp, then the auxiliary
/// vector. Returns the real entry address and the auxv slot storing it.
fn find_entry_slot(target: &mut PtracedProcess) -> Result<(usize, usize), InjectorError> {
    let regs = target.regs()?;
    let sp = NativeAbi::sp(&regs);
    let argc = target.read_word(sp)?;
    if argc == 0 || argc > 1024 {
        return Err(InjectorError::ProtocolMismatch(format!(
            "implausible argc {argc} at sp {sp:#x}"
        )));
    }

    let mut cursor = sp + (argc + 2) * WORD; // past argv and its terminator
    while target.read_word(cursor)? != 0 {
        cursor += WORD;
    }
    let mut auxv = cursor + WORD;
    loop {
        let key = target.read_word(auxv)?;
        if key == libc::AT_ENTRY as usize {
            let slot = auxv + WORD;
            return Ok((target.read_word(slot)?, slot));
        }
        if key == libc::AT_NULL as usize {
            return Err(InjectorError::ProtocolMismatch("no AT_ENTRY in auxv".into()));
        }
        auxv += 2 * WORD;
    }
}

fn expect_group_stop(target: &mut PtracedProcess, sig: Signal) -> Result<(), InjectorError> {
    match target.wait()? {
        Stop::Event(s, libc::PTRACE_EVENT_STOP) if s == sig => Ok(()),
        other => Err(InjectorError::ProtocolMismatch(format!(
            "expected {sig} group-stop, got {other:?}"
        ))),
    }
}

fn kernel_at_least(major: u32, minor: u32) -> bool {
    match fs::read_to_string("/proc/version") {
        Ok(text) => parse_kernel_version(&text).is_some_and(|v| v >= (major, minor)),
        Err(_) => false,
    }
}

/// `"Linux version 6.6.30-android15 ..."` to `(6, 6)`.
fn parse_kernel_version(text: &str) -> Option<(u32, u32)> {
    let release = text.split_whitespace().nth(2)?;
    let mut parts = release.split(['.', '-']);
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}
