//! Register snapshot access
//!
//! `PTRACE_GETREGSET`/`SETREGSET` with `NT_PRSTATUS` is the one regset call
//! that works identically across all four supported architectures, so the
//! raw `libc::ptrace` calls are confined to this module.

#![allow(unsafe_code)]

use nix::errno::Errno;
use nix::unistd::Pid;

use super::arch::{blank_registers, Registers};

pub fn get_regs(pid: Pid) -> Result<Registers, Errno> {
    let mut regs = blank_registers();
    let mut iov = libc::iovec {
        iov_base: std::ptr::addr_of_mut!(regs).cast(),
        iov_len: std::mem::size_of::<Registers>(),
    };
    // SAFETY: iov points at a live, writable Registers of the advertised size.
    let rc = unsafe {
        libc::ptrace(
            libc::PTRACE_GETREGSET,
            pid.as_raw(),
            libc::NT_PRSTATUS as usize,
            std::ptr::addr_of_mut!(iov),
        )
    };
    Errno::result(rc)?;
    Ok(regs)
}

pub fn set_regs(pid: Pid, regs: &Registers) -> Result<(), Errno> {
    let mut copy = *regs;
    let mut iov = libc::iovec {
        iov_base: std::ptr::addr_of_mut!(copy).cast(),
        iov_len: std::mem::size_of::<Registers>(),
    };
    // SAFETY: iov points at a live Registers of the advertised size.
    let rc = unsafe {
        libc::ptrace(
            libc::PTRACE_SETREGSET,
            pid.as_raw(),
            libc::NT_PRSTATUS as usize,
            std::ptr::addr_of_mut!(iov),
        )
    };
    Errno::result(rc)?;
    Ok(())
}
