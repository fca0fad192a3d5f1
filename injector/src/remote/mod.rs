//! Remote process access
//!
//! Everything that touches another process's address space or registers goes
//! through the [`Tracee`] trait: bulk memory transfer, register snapshots,
//! and resume/wait. [`PtracedProcess`] is the real implementation over
//! `process_vm_readv`/`writev` and ptrace; tests substitute a mock.
//!
//! All operations are valid only while the target is in a traced, stopped
//! state.

pub mod arch;
pub mod call;
pub mod maps;
pub mod mem;
pub mod regs;

use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::domain::InjectorError;
use arch::Registers;

/// Why a resumed tracee stopped (or stopped existing).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stop {
    /// Signal-delivery stop.
    Signal(Signal),
    /// Ptrace event stop (`PTRACE_EVENT_*` in the second field).
    Event(Signal, i32),
    /// Syscall-entry/exit stop.
    Syscall,
    /// The process exited or was killed; it no longer exists as a tracee.
    Gone,
}

/// Abstract access to a traced, stopped process.
pub trait Tracee {
    fn read_mem(&mut self, addr: usize, buf: &mut [u8]) -> Result<(), InjectorError>;
    fn write_mem(&mut self, addr: usize, data: &[u8]) -> Result<(), InjectorError>;
    fn regs(&mut self) -> Result<Registers, InjectorError>;
    fn set_regs(&mut self, regs: &Registers) -> Result<(), InjectorError>;
    /// Resume execution, optionally delivering a signal.
    fn resume(&mut self, signal: Option<Signal>) -> Result<(), InjectorError>;
    /// Block until the next stop.
    fn wait(&mut self) -> Result<Stop, InjectorError>;

    /// Read one target word.
    fn read_word(&mut self, addr: usize) -> Result<usize, InjectorError> {
        let mut buf = [0u8; std::mem::size_of::<usize>()];
        self.read_mem(addr, &mut buf)?;
        Ok(usize::from_ne_bytes(buf))
    }

    /// Write one target word.
    fn write_word(&mut self, addr: usize, value: usize) -> Result<(), InjectorError> {
        self.write_mem(addr, &value.to_ne_bytes())
    }
}

/// The real thing: a pid we are currently the tracer of.
pub struct PtracedProcess {
    pid: Pid,
}

impl PtracedProcess {
    #[must_use]
    pub fn new(pid: Pid) -> Self {
        Self { pid }
    }

    #[must_use]
    pub fn pid(&self) -> Pid {
        self.pid
    }
}

impl Tracee for PtracedProcess {
    fn read_mem(&mut self, addr: usize, buf: &mut [u8]) -> Result<(), InjectorError> {
        mem::read_exact(self.pid, addr, buf)
    }

    fn write_mem(&mut self, addr: usize, data: &[u8]) -> Result<(), InjectorError> {
        mem::write_all(self.pid, addr, data)
    }

    fn regs(&mut self) -> Result<Registers, InjectorError> {
        regs::get_regs(self.pid).map_err(|e| InjectorError::from_tracee_errno(e, "get regs"))
    }

    fn set_regs(&mut self, regs: &Registers) -> Result<(), InjectorError> {
        regs::set_regs(self.pid, regs).map_err(|e| InjectorError::from_tracee_errno(e, "set regs"))
    }

    fn resume(&mut self, signal: Option<Signal>) -> Result<(), InjectorError> {
        ptrace::cont(self.pid, signal).map_err(|e| InjectorError::from_tracee_errno(e, "cont"))
    }

    fn wait(&mut self) -> Result<Stop, InjectorError> {
        let status = waitpid(self.pid, Some(WaitPidFlag::__WALL))
            .map_err(|e| InjectorError::from_tracee_errno(e, "waitpid"))?;
        Ok(reduce_status(status))
    }
}

/// Collapse a wait status to the call/injection state machine's view.
#[must_use]
pub fn reduce_status(status: WaitStatus) -> Stop {
    match status {
        WaitStatus::Stopped(_, sig) => Stop::Signal(sig),
        WaitStatus::PtraceEvent(_, sig, event) => Stop::Event(sig, event),
        WaitStatus::PtraceSyscall(_) => Stop::Syscall,
        WaitStatus::Exited(..) | WaitStatus::Signaled(..) => Stop::Gone,
        // Continued/StillAlive cannot occur for a blocking __WALL wait on a
        // stopped tracee, but the type forces a choice.
        _ => Stop::Gone,
    }
}
