//! Per-architecture ABI table
//!
//! Everything architecture-conditional lives here: the register snapshot
//! type, call-frame setup for the remote call engine, and the relocation
//! type classifier. One zero-sized impl per target, selected once at compile
//! time as [`NativeAbi`]. The rest of the crate never branches on
//! `target_arch`.

#![allow(unsafe_code)] // blank_registers() zero-initializes a plain-int libc struct

use crate::domain::InjectorError;
use crate::remote::Tracee;

/// Full general-purpose register snapshot of the traced thread, as consumed
/// by `PTRACE_GETREGSET`/`SETREGSET` with `NT_PRSTATUS`.
#[cfg(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64"))]
pub type Registers = libc::user_regs_struct;
#[cfg(target_arch = "arm")]
pub type Registers = libc::user_regs;

/// An all-zero register snapshot. Only meaningful as a template to overwrite
/// or as a fixture in tests; real snapshots come from the tracee.
#[must_use]
pub fn blank_registers() -> Registers {
    // SAFETY: every field is a plain integer; all-zero is a valid value.
    unsafe { std::mem::zeroed() }
}

/// How a relocation type is applied on the current architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    /// `load_bias + addend`; no symbol involved.
    Relative,
    /// Resolved symbol address, addend ignored in REL format
    /// (GLOB_DAT / JUMP_SLOT).
    Symbol,
    /// Resolved symbol address plus addend; in REL format the addend is the
    /// pre-existing word at the target (ABS32 / ABS64 / direct-64).
    SymbolAbs,
    /// Hard failure: not supported on this architecture.
    Unsupported,
}

/// Calling-convention and register-layout operations for one architecture.
pub trait CallAbi {
    /// Word size of the target, in bytes.
    const WORD: usize;

    fn pc(regs: &Registers) -> usize;
    fn set_pc(regs: &mut Registers, pc: usize);
    fn sp(regs: &Registers) -> usize;
    /// The defined return-value register after a call.
    fn retval(regs: &Registers) -> usize;
    /// Set the return-value register, as a completed call would leave it.
    fn set_retval(regs: &mut Registers, value: usize);
    /// Argument `index` of a pending call, if the convention carries it in a
    /// register. `None` means the argument lives on the stack.
    fn arg(regs: &Registers, index: usize) -> Option<usize>;

    /// Place `args` per the integer-argument convention (spilling to the
    /// stack where they exceed the register count), aim the return path at
    /// `trap`, and point the program counter at `func`. Stack writes go
    /// through the tracee.
    fn setup_call<T: Tracee + ?Sized>(
        tracee: &mut T,
        regs: &mut Registers,
        func: usize,
        trap: usize,
        args: &[usize],
    ) -> Result<(), InjectorError>;

    /// Classify a relocation type from this architecture's `R_*` space.
    fn classify_reloc(rtype: u32) -> RelocKind;

    /// Strip the mode bit from a code address where the ISA carries one.
    fn code_addr(addr: usize) -> usize {
        addr
    }

    /// Point the program counter at `addr`, honoring the mode bit where the
    /// ISA carries one in code addresses.
    fn set_pc_mode(regs: &mut Registers, addr: usize) {
        Self::set_pc(regs, addr);
    }
}

fn write_word<T: Tracee + ?Sized>(
    tracee: &mut T,
    addr: usize,
    value: usize,
) -> Result<(), InjectorError> {
    #[cfg(target_pointer_width = "64")]
    let bytes = (value as u64).to_ne_bytes();
    #[cfg(target_pointer_width = "32")]
    let bytes = (value as u32).to_ne_bytes();
    tracee.write_mem(addr, &bytes)
}

#[cfg(target_arch = "x86_64")]
pub struct X86_64;

#[cfg(target_arch = "x86_64")]
impl CallAbi for X86_64 {
    const WORD: usize = 8;

    fn pc(regs: &Registers) -> usize {
        regs.rip as usize
    }

    fn set_pc(regs: &mut Registers, pc: usize) {
        regs.rip = pc as u64;
    }

    fn sp(regs: &Registers) -> usize {
        regs.rsp as usize
    }

    fn retval(regs: &Registers) -> usize {
        regs.rax as usize
    }

    fn set_retval(regs: &mut Registers, value: usize) {
        regs.rax = value as u64;
    }

    fn arg(regs: &Registers, index: usize) -> Option<usize> {
        let v = match index {
            0 => regs.rdi,
            1 => regs.rsi,
            2 => regs.rdx,
            3 => regs.rcx,
            4 => regs.r8,
            5 => regs.r9,
            _ => return None,
        };
        Some(v as usize)
    }

    fn setup_call<T: Tracee + ?Sized>(
        tracee: &mut T,
        regs: &mut Registers,
        func: usize,
        trap: usize,
        args: &[usize],
    ) -> Result<(), InjectorError> {
        let reg_args = [&mut regs.rdi, &mut regs.rsi, &mut regs.rdx, &mut regs.rcx, &mut regs.r8, &mut regs.r9];
        for (slot, &arg) in reg_args.into_iter().zip(args) {
            *slot = arg as u64;
        }

        let mut sp = (regs.rsp as usize) & !0xF;
        if args.len() > 6 {
            let spill = args.len() - 6;
            sp -= spill.div_ceil(2) * 16;
            for (i, &arg) in args[6..].iter().enumerate() {
                write_word(tracee, sp + i * 8, arg)?;
            }
        }
        // "return" into the trap address
        sp -= 8;
        write_word(tracee, sp, trap)?;

        regs.rsp = sp as u64;
        regs.rip = func as u64;
        Ok(())
    }

    fn classify_reloc(rtype: u32) -> RelocKind {
        use object::elf::{R_X86_64_64, R_X86_64_GLOB_DAT, R_X86_64_JUMP_SLOT, R_X86_64_RELATIVE};
        match rtype {
            R_X86_64_RELATIVE => RelocKind::Relative,
            R_X86_64_GLOB_DAT | R_X86_64_JUMP_SLOT => RelocKind::Symbol,
            R_X86_64_64 => RelocKind::SymbolAbs,
            _ => RelocKind::Unsupported,
        }
    }
}

#[cfg(target_arch = "aarch64")]
pub struct Aarch64;

#[cfg(target_arch = "aarch64")]
impl CallAbi for Aarch64 {
    const WORD: usize = 8;

    fn pc(regs: &Registers) -> usize {
        regs.pc as usize
    }

    fn set_pc(regs: &mut Registers, pc: usize) {
        regs.pc = pc as u64;
    }

    fn sp(regs: &Registers) -> usize {
        regs.sp as usize
    }

    fn retval(regs: &Registers) -> usize {
        regs.regs[0] as usize
    }

    fn set_retval(regs: &mut Registers, value: usize) {
        regs.regs[0] = value as u64;
    }

    fn arg(regs: &Registers, index: usize) -> Option<usize> {
        (index < 8).then(|| regs.regs[index] as usize)
    }

    fn setup_call<T: Tracee + ?Sized>(
        tracee: &mut T,
        regs: &mut Registers,
        func: usize,
        trap: usize,
        args: &[usize],
    ) -> Result<(), InjectorError> {
        for (i, &arg) in args.iter().take(8).enumerate() {
            regs.regs[i] = arg as u64;
        }

        let mut sp = (regs.sp as usize) & !0xF;
        if args.len() > 8 {
            let spill = args.len() - 8;
            sp -= spill.div_ceil(2) * 16;
            for (i, &arg) in args[8..].iter().enumerate() {
                write_word(tracee, sp + i * 8, arg)?;
            }
        }

        regs.sp = sp as u64;
        regs.regs[30] = trap as u64; // link register
        regs.pc = func as u64;
        Ok(())
    }

    fn classify_reloc(rtype: u32) -> RelocKind {
        use object::elf::{R_AARCH64_ABS64, R_AARCH64_GLOB_DAT, R_AARCH64_JUMP_SLOT, R_AARCH64_RELATIVE};
        match rtype {
            R_AARCH64_RELATIVE => RelocKind::Relative,
            R_AARCH64_GLOB_DAT | R_AARCH64_JUMP_SLOT => RelocKind::Symbol,
            R_AARCH64_ABS64 => RelocKind::SymbolAbs,
            _ => RelocKind::Unsupported,
        }
    }
}

#[cfg(target_arch = "arm")]
const CPSR_T: libc::c_ulong = 1 << 5;

#[cfg(target_arch = "arm")]
pub struct Arm;

#[cfg(target_arch = "arm")]
impl CallAbi for Arm {
    const WORD: usize = 4;

    fn pc(regs: &Registers) -> usize {
        regs.arm_pc as usize
    }

    fn set_pc(regs: &mut Registers, pc: usize) {
        regs.arm_pc = pc as libc::c_ulong;
    }

    fn sp(regs: &Registers) -> usize {
        regs.arm_sp as usize
    }

    fn retval(regs: &Registers) -> usize {
        regs.arm_r0 as usize
    }

    fn set_retval(regs: &mut Registers, value: usize) {
        regs.arm_r0 = value as libc::c_ulong;
    }

    fn arg(regs: &Registers, index: usize) -> Option<usize> {
        let v = match index {
            0 => regs.arm_r0,
            1 => regs.arm_r1,
            2 => regs.arm_r2,
            3 => regs.arm_r3,
            _ => return None,
        };
        Some(v as usize)
    }

    fn setup_call<T: Tracee + ?Sized>(
        tracee: &mut T,
        regs: &mut Registers,
        func: usize,
        trap: usize,
        args: &[usize],
    ) -> Result<(), InjectorError> {
        let reg_args = [&mut regs.arm_r0, &mut regs.arm_r1, &mut regs.arm_r2, &mut regs.arm_r3];
        for (slot, &arg) in reg_args.into_iter().zip(args) {
            *slot = arg as libc::c_ulong;
        }

        let mut sp = (regs.arm_sp as usize) & !0x7;
        if args.len() > 4 {
            let spill = args.len() - 4;
            sp -= spill.div_ceil(2) * 8;
            for (i, &arg) in args[4..].iter().enumerate() {
                write_word(tracee, sp + i * 4, arg)?;
            }
        }

        regs.arm_sp = sp as libc::c_ulong;
        regs.arm_lr = trap as libc::c_ulong;
        Self::set_pc_mode(regs, func);
        Ok(())
    }

    fn classify_reloc(rtype: u32) -> RelocKind {
        use object::elf::{R_ARM_ABS32, R_ARM_GLOB_DAT, R_ARM_JUMP_SLOT, R_ARM_RELATIVE};
        match rtype {
            R_ARM_RELATIVE => RelocKind::Relative,
            R_ARM_GLOB_DAT | R_ARM_JUMP_SLOT => RelocKind::Symbol,
            R_ARM_ABS32 => RelocKind::SymbolAbs,
            _ => RelocKind::Unsupported,
        }
    }

    fn code_addr(addr: usize) -> usize {
        addr & !1
    }

    /// Interworking: the low bit of the destination selects Thumb.
    fn set_pc_mode(regs: &mut Registers, addr: usize) {
        regs.arm_pc = (addr & !1) as libc::c_ulong;
        if addr & 1 != 0 {
            regs.arm_cpsr |= CPSR_T;
        } else {
            regs.arm_cpsr &= !CPSR_T;
        }
    }
}

#[cfg(target_arch = "x86")]
pub struct X86;

#[cfg(target_arch = "x86")]
impl CallAbi for X86 {
    const WORD: usize = 4;

    fn pc(regs: &Registers) -> usize {
        regs.eip as usize
    }

    fn set_pc(regs: &mut Registers, pc: usize) {
        regs.eip = pc as i32;
    }

    fn sp(regs: &Registers) -> usize {
        regs.esp as usize
    }

    fn retval(regs: &Registers) -> usize {
        regs.eax as usize
    }

    fn set_retval(regs: &mut Registers, value: usize) {
        regs.eax = value as i32;
    }

    fn arg(_regs: &Registers, _index: usize) -> Option<usize> {
        // cdecl carries every argument on the stack
        None
    }

    fn setup_call<T: Tracee + ?Sized>(
        tracee: &mut T,
        regs: &mut Registers,
        func: usize,
        trap: usize,
        args: &[usize],
    ) -> Result<(), InjectorError> {
        // cdecl: every argument on the stack, return address below them.
        let mut sp = (regs.esp as usize) & !0xF;
        sp -= args.len() * 4;
        for (i, &arg) in args.iter().enumerate() {
            write_word(tracee, sp + i * 4, arg)?;
        }
        sp -= 4;
        write_word(tracee, sp, trap)?;

        regs.esp = sp as i32;
        regs.eip = func as i32;
        Ok(())
    }

    fn classify_reloc(rtype: u32) -> RelocKind {
        use object::elf::{R_386_32, R_386_GLOB_DAT, R_386_JMP_SLOT, R_386_RELATIVE};
        match rtype {
            R_386_RELATIVE => RelocKind::Relative,
            R_386_GLOB_DAT | R_386_JMP_SLOT => RelocKind::Symbol,
            R_386_32 => RelocKind::SymbolAbs,
            _ => RelocKind::Unsupported,
        }
    }
}

#[cfg(target_arch = "x86_64")]
pub type NativeAbi = X86_64;
#[cfg(target_arch = "aarch64")]
pub type NativeAbi = Aarch64;
#[cfg(target_arch = "arm")]
pub type NativeAbi = Arm;
#[cfg(target_arch = "x86")]
pub type NativeAbi = X86;
