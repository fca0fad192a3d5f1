//! Remote function calls
//!
//! Drives one function call inside a stopped tracee: stage the argument
//! frame, aim the return path at a mapped but non-executable trap address,
//! resume, and harvest the return value when the resulting fault lands on
//! the trap. The pre-call register snapshot is restored afterwards whether
//! or not the call succeeded, so a failed call leaves the target resumable.

use nix::sys::signal::Signal;

use crate::domain::InjectorError;
use crate::remote::arch::{CallAbi, NativeAbi};
use crate::remote::{Stop, Tracee};

/// Call `func(args...)` in the tracee and return its integer result.
///
/// `trap` must be a mapped, non-executable address in the target (see
/// [`crate::remote::maps::MemoryMap::trap_addr`]). The target must be in a
/// signal-delivery or group stop when this is called, and is left stopped.
pub fn call_remote<T: Tracee + ?Sized>(
    tracee: &mut T,
    func: usize,
    trap: usize,
    args: &[usize],
) -> Result<usize, InjectorError> {
    let saved = tracee.regs()?;
    let result = drive_call(tracee, &saved, func, trap, args);
    let restored = tracee.set_regs(&saved);
    let value = result?;
    restored?;
    Ok(value)
}

fn drive_call<T: Tracee + ?Sized>(
    tracee: &mut T,
    saved: &crate::remote::arch::Registers,
    func: usize,
    trap: usize,
    args: &[usize],
) -> Result<usize, InjectorError> {
    let mut regs = *saved;
    NativeAbi::setup_call(tracee, &mut regs, func, trap, args)?;
    tracee.set_regs(&regs)?;

    log::trace!("calling {func:#x} with {} args, trap {trap:#x}", args.len());
    tracee.resume(None)?;
    match tracee.wait()? {
        Stop::Signal(Signal::SIGSEGV) => {
            let after = tracee.regs()?;
            let pc = NativeAbi::code_addr(NativeAbi::pc(&after));
            if pc == NativeAbi::code_addr(trap) {
                Ok(NativeAbi::retval(&after))
            } else {
                Err(InjectorError::ProtocolMismatch(format!(
                    "call to {func:#x} faulted at {pc:#x} instead of returning to {trap:#x}"
                )))
            }
        }
        Stop::Signal(sig) => Err(InjectorError::ProtocolMismatch(format!(
            "call to {func:#x} stopped on {sig} instead of returning"
        ))),
        Stop::Gone => {
            Err(InjectorError::Transient(format!("target exited during call to {func:#x}")))
        }
        other => Err(InjectorError::ProtocolMismatch(format!(
            "call to {func:#x} produced unexpected stop {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::remote::arch::blank_registers;
    use crate::remote::arch::Registers;

    enum Behavior {
        /// Emulate the call completing: jump to `to` with `retval` set.
        Return { to: usize, retval: usize },
        /// Emulate a crash somewhere else.
        FaultAt(usize),
        /// Emulate the target dying mid-call.
        Exit,
    }

    struct MockTracee {
        regs: Registers,
        mem: HashMap<usize, u8>,
        behavior: Behavior,
        pending: Option<Stop>,
        regs_at_resume: Option<Registers>,
    }

    impl MockTracee {
        fn new(behavior: Behavior) -> Self {
            let mut regs = blank_registers();
            // A plausible stack pointer so frame setup has room to grow down
            set_sp(&mut regs, 0x7fff_0000);
            Self { regs, mem: HashMap::new(), behavior, pending: None, regs_at_resume: None }
        }
    }

    fn set_sp(regs: &mut Registers, sp: usize) {
        #[cfg(target_arch = "x86_64")]
        {
            regs.rsp = sp as u64;
        }
        #[cfg(target_arch = "aarch64")]
        {
            regs.sp = sp as u64;
        }
        #[cfg(target_arch = "arm")]
        {
            regs.arm_sp = sp as libc::c_ulong;
        }
        #[cfg(target_arch = "x86")]
        {
            regs.esp = sp as i32;
        }
    }

    impl Tracee for MockTracee {
        fn read_mem(&mut self, addr: usize, buf: &mut [u8]) -> Result<(), InjectorError> {
            for (i, b) in buf.iter_mut().enumerate() {
                *b = self.mem.get(&(addr + i)).copied().unwrap_or(0);
            }
            Ok(())
        }

        fn write_mem(&mut self, addr: usize, data: &[u8]) -> Result<(), InjectorError> {
            for (i, &b) in data.iter().enumerate() {
                self.mem.insert(addr + i, b);
            }
            Ok(())
        }

        fn regs(&mut self) -> Result<Registers, InjectorError> {
            Ok(self.regs)
        }

        fn set_regs(&mut self, regs: &Registers) -> Result<(), InjectorError> {
            self.regs = *regs;
            Ok(())
        }

        fn resume(&mut self, _signal: Option<Signal>) -> Result<(), InjectorError> {
            self.regs_at_resume = Some(self.regs);
            self.pending = Some(match self.behavior {
                Behavior::Return { to, retval } => {
                    NativeAbi::set_retval(&mut self.regs, retval);
                    NativeAbi::set_pc(&mut self.regs, to);
                    Stop::Signal(Signal::SIGSEGV)
                }
                Behavior::FaultAt(addr) => {
                    NativeAbi::set_pc(&mut self.regs, addr);
                    Stop::Signal(Signal::SIGSEGV)
                }
                Behavior::Exit => Stop::Gone,
            });
            Ok(())
        }

        fn wait(&mut self) -> Result<Stop, InjectorError> {
            Ok(self.pending.take().expect("wait without resume"))
        }
    }

    const FUNC: usize = 0x4000_1000;
    const TRAP: usize = 0x5000_0000;

    #[test]
    fn test_call_returns_value_and_restores_registers() {
        let mut mock = MockTracee::new(Behavior::Return { to: TRAP, retval: 0x1234 });
        let before = mock.regs;

        let ret = call_remote(&mut mock, FUNC, TRAP, &[7, 8]).unwrap();
        assert_eq!(ret, 0x1234);
        assert_eq!(NativeAbi::pc(&mock.regs), NativeAbi::pc(&before));
        assert_eq!(NativeAbi::sp(&mock.regs), NativeAbi::sp(&before));
    }

    #[test]
    fn test_arguments_reach_the_call_frame() {
        let args = [11usize, 22, 33, 44];
        let mut mock = MockTracee::new(Behavior::Return { to: TRAP, retval: 0 });
        call_remote(&mut mock, FUNC, TRAP, &args).unwrap();

        let staged = mock.regs_at_resume.unwrap();
        assert_eq!(NativeAbi::code_addr(NativeAbi::pc(&staged)), NativeAbi::code_addr(FUNC));
        for (i, &expected) in args.iter().enumerate() {
            if let Some(got) = NativeAbi::arg(&staged, i) {
                assert_eq!(got, expected, "argument {i}");
            }
        }
    }

    #[test]
    fn test_stack_spill_beyond_register_args() {
        // More arguments than any supported convention keeps in registers
        let args: Vec<usize> = (1..=10).map(|v| v * 0x101).collect();
        let mut mock = MockTracee::new(Behavior::Return { to: TRAP, retval: 0 });
        call_remote(&mut mock, FUNC, TRAP, &args).unwrap();

        let staged = mock.regs_at_resume.unwrap();
        let mut sp = NativeAbi::sp(&staged);
        // x86-family conventions park the return address at the stack top
        if NativeAbi::arg(&staged, 0).is_none() || cfg!(any(target_arch = "x86_64", target_arch = "x86")) {
            assert_eq!(mock.read_word(sp).unwrap(), TRAP);
            sp += NativeAbi::WORD;
        }
        // The first stack-carried argument sits right above
        let first_spilled = args.iter().enumerate().find(|(i, _)| NativeAbi::arg(&staged, *i).is_none());
        if let Some((_, &v)) = first_spilled {
            assert_eq!(mock.read_word(sp).unwrap(), v);
        }
    }

    #[test]
    fn test_fault_off_trap_is_protocol_mismatch() {
        let mut mock = MockTracee::new(Behavior::FaultAt(0xbad0_0000));
        let err = call_remote(&mut mock, FUNC, TRAP, &[]).unwrap_err();
        assert!(matches!(err, InjectorError::ProtocolMismatch(_)), "{err}");
    }

    #[test]
    fn test_exit_during_call_is_transient() {
        let mut mock = MockTracee::new(Behavior::Exit);
        let err = call_remote(&mut mock, FUNC, TRAP, &[]).unwrap_err();
        assert!(matches!(err, InjectorError::Transient(_)), "{err}");
    }

    #[test]
    fn test_registers_restored_after_failed_call() {
        let mut mock = MockTracee::new(Behavior::FaultAt(0xbad0_0000));
        let before = mock.regs;
        let _ = call_remote(&mut mock, FUNC, TRAP, &[1]);
        assert_eq!(NativeAbi::pc(&mock.regs), NativeAbi::pc(&before));
        assert_eq!(NativeAbi::sp(&mock.regs), NativeAbi::sp(&before));
    }
}
