//! Payload image parsing and remote loading
//!
//! The image is always consumed from its on-disk file; nothing here trusts
//! bytes read back from the target. `file` is the bounds-checked access
//! layer, `elf` the typed view over it, `symbols` resolves addresses inside
//! another process's modules, and `loader` reproduces the image's layout in
//! the target.

pub mod elf;
pub mod file;
pub mod loader;
pub mod symbols;

#[must_use]
pub fn page_floor(addr: usize, page_size: usize) -> usize {
    addr & !(page_size - 1)
}

#[must_use]
pub fn page_ceil(addr: usize, page_size: usize) -> usize {
    (addr + page_size - 1) & !(page_size - 1)
}

/// Page size of the running system, with the conventional fallback.
#[must_use]
pub fn host_page_size() -> usize {
    use nix::unistd::{sysconf, SysconfVar};
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(sz)) if sz > 0 => sz as usize,
        _ => 4096,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_rounding() {
        assert_eq!(page_floor(0x1fff, 0x1000), 0x1000);
        assert_eq!(page_ceil(0x1001, 0x1000), 0x2000);
        assert_eq!(page_ceil(0x2000, 0x1000), 0x2000);
    }
}
