//! Bulk memory transfer to and from a traced process
//!
//! `process_vm_readv`/`writev` may transfer less than requested; both
//! directions loop until the full count is satisfied. A vanished target
//! surfaces as a `Transient` error.

use std::io::{IoSlice, IoSliceMut};

use nix::sys::uio::{process_vm_readv, process_vm_writev, RemoteIoVec};
use nix::unistd::Pid;

use crate::domain::InjectorError;

pub fn read_exact(pid: Pid, addr: usize, buf: &mut [u8]) -> Result<(), InjectorError> {
    let total = buf.len();
    let mut done = 0;
    while done < total {
        let remote = [RemoteIoVec { base: addr + done, len: total - done }];
        let mut local = [IoSliceMut::new(&mut buf[done..])];
        let n = process_vm_readv(pid, &mut local, &remote)
            .map_err(|e| InjectorError::from_tracee_errno(e, "process_vm_readv"))?;
        if n == 0 {
            return Err(InjectorError::Transient(format!(
                "short read at {:#x} ({done}/{total} bytes)",
                addr + done
            )));
        }
        done += n;
    }
    Ok(())
}

pub fn write_all(pid: Pid, addr: usize, data: &[u8]) -> Result<(), InjectorError> {
    let total = data.len();
    let mut done = 0;
    while done < total {
        let remote = [RemoteIoVec { base: addr + done, len: total - done }];
        let local = [IoSlice::new(&data[done..])];
        let n = process_vm_writev(pid, &local, &remote)
            .map_err(|e| InjectorError::from_tracee_errno(e, "process_vm_writev"))?;
        if n == 0 {
            return Err(InjectorError::Transient(format!(
                "short write at {:#x} ({done}/{total} bytes)",
                addr + done
            )));
        }
        done += n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_own_memory() {
        let marker: u64 = 0x5151_4242_dead_beef;
        let pid = Pid::this();
        let mut buf = [0u8; 8];
        read_exact(pid, std::ptr::addr_of!(marker) as usize, &mut buf).unwrap();
        assert_eq!(u64::from_ne_bytes(buf), marker);
    }

    #[test]
    fn test_read_unmapped_address_fails() {
        let pid = Pid::this();
        let mut buf = [0u8; 8];
        // Page 0 is never mapped
        assert!(read_exact(pid, 8, &mut buf).is_err());
    }
}
