//! Remote memory-map snapshots
//!
//! Parses `/proc/<pid>/maps` into an ordered [`MemoryMap`]. A snapshot is
//! only valid until the next operation that can change the target's map (a
//! remote mmap/mprotect); callers re-snapshot at the points the injection
//! flow defines instead of caching.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use nix::unistd::Pid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Perms {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
    pub shared: bool,
}

/// One line of the maps file.
#[derive(Debug, Clone)]
pub struct MapEntry {
    pub start: usize,
    pub end: usize,
    pub perms: Perms,
    pub offset: u64,
    pub dev: (u32, u32),
    pub inode: u64,
    pub path: Option<String>,
}

impl MapEntry {
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Anonymous memory: no backing device or inode.
    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.dev == (0, 0) && self.inode == 0
    }

    fn file_name(&self) -> Option<&str> {
        let path = self.path.as_deref()?;
        Some(path.rsplit('/').next().unwrap_or(path))
    }
}

/// Ordered snapshot of a process's memory map.
#[derive(Debug, Clone, Default)]
pub struct MemoryMap {
    entries: Vec<MapEntry>,
}

impl MemoryMap {
    /// Snapshot the live map of `pid`.
    pub fn snapshot(pid: Pid) -> Result<Self> {
        let maps_path = format!("/proc/{pid}/maps");
        let text = fs::read_to_string(&maps_path).context(format!("Failed to read {maps_path}"))?;
        Self::parse(&text)
    }

    /// Snapshot our own map (for local/remote base comparisons).
    pub fn snapshot_self() -> Result<Self> {
        Self::snapshot(Pid::this())
    }

    /// Parse maps-file text. Lines that do not parse are skipped: the file
    /// format is stable, but a racing unmap can truncate a read mid-line.
    pub fn parse(text: &str) -> Result<Self> {
        let mut entries = Vec::new();
        for line in text.lines() {
            if let Some(entry) = parse_line(line) {
                entries.push(entry);
            }
        }
        Ok(Self { entries })
    }

    #[must_use]
    pub fn from_entries(entries: Vec<MapEntry>) -> Self {
        Self { entries }
    }

    #[must_use]
    pub fn entries(&self) -> &[MapEntry] {
        &self.entries
    }

    /// Full path of a mapped module, found by exact file-name match on the
    /// mapping that covers file offset zero.
    #[must_use]
    pub fn module_path(&self, file_name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.offset == 0 && e.file_name() == Some(file_name))
            .and_then(|e| e.path.as_deref())
    }

    /// Lowest mapped address of the module at `path`.
    #[must_use]
    pub fn module_base(&self, path: &str) -> Option<usize> {
        self.entries.iter().filter(|e| e.path.as_deref() == Some(path)).map(|e| e.start).min()
    }

    /// An address inside the named module that is mapped but not executable.
    /// Transferring control there is guaranteed to fault under trace, which
    /// is exactly what a remote call's return path needs.
    #[must_use]
    pub fn trap_addr(&self, file_name: &str) -> Option<usize> {
        self.entries
            .iter()
            .find(|e| !e.perms.exec && e.file_name() == Some(file_name))
            .map(|e| e.start)
    }

    #[must_use]
    pub fn region_of(&self, addr: usize) -> Option<&MapEntry> {
        self.entries.iter().find(|e| e.contains(addr))
    }

    /// Human-readable description of the region holding `addr`, for logs.
    #[must_use]
    pub fn describe(&self, addr: usize) -> String {
        match self.region_of(addr) {
            Some(e) => {
                let mut out = format!("{:#x}-{:#x}", e.start, e.end);
                if let Some(path) = &e.path {
                    let _ = write!(out, " {path}");
                }
                out
            }
            None => "<unmapped>".to_string(),
        }
    }

    /// Anonymous mappings overlapping `[start, start+len)`.
    #[must_use]
    pub fn anonymous_within(&self, start: usize, len: usize) -> Vec<(usize, usize)> {
        let end = start.saturating_add(len);
        self.entries
            .iter()
            .filter(|e| e.is_anonymous() && e.start < end && e.end > start)
            .map(|e| (e.start, e.end - e.start))
            .collect()
    }
}

fn parse_line(line: &str) -> Option<MapEntry> {
    // start-end perms offset dev inode [path]
    let mut parts = line.splitn(6, ' ').filter(|s| !s.is_empty());
    let range = parts.next()?;
    let perms_str = parts.next()?;
    let offset_str = parts.next()?;
    let dev_str = parts.next()?;
    let inode_str = parts.next()?;
    let path = parts.next().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);

    let (start_str, end_str) = range.split_once('-')?;
    let start = usize::from_str_radix(start_str, 16).ok()?;
    let end = usize::from_str_radix(end_str, 16).ok()?;

    let perms_bytes = perms_str.as_bytes();
    if perms_bytes.len() < 4 {
        return None;
    }
    let perms = Perms {
        read: perms_bytes[0] == b'r',
        write: perms_bytes[1] == b'w',
        exec: perms_bytes[2] == b'x',
        shared: perms_bytes[3] == b's',
    };

    let offset = u64::from_str_radix(offset_str, 16).ok()?;
    let (dev_major, dev_minor) = dev_str.split_once(':')?;
    let dev = (u32::from_str_radix(dev_major, 16).ok()?, u32::from_str_radix(dev_minor, 16).ok()?);
    let inode = inode_str.parse().ok()?;

    Some(MapEntry { start, end, perms, offset, dev, inode, path })
}

/// Read the program path a pid has exec'd, via its `/proc` exe link.
pub fn exe_path(pid: Pid) -> Result<std::path::PathBuf> {
    let link = format!("/proc/{pid}/exe");
    fs::read_link(Path::new(&link)).context(format!("Failed to read {link}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
5a1000000000-5a1000002000 r--p 00000000 fe:09 1401 /system/bin/app_process64
5a1000002000-5a1000008000 r-xp 00002000 fe:09 1401 /system/bin/app_process64
7f0000000000-7f0000004000 r--p 00000000 fe:09 2001 /apex/com.android.runtime/lib64/bionic/libc.so
7f0000004000-7f0000100000 r-xp 00004000 fe:09 2001 /apex/com.android.runtime/lib64/bionic/libc.so
7f0000100000-7f0000108000 rw-p 00000000 00:00 0
7fff00000000-7fff00021000 rw-p 00000000 00:00 0 [stack]
";

    #[test]
    fn test_parse_and_lookup() {
        let map = MemoryMap::parse(SAMPLE).unwrap();
        assert_eq!(map.entries().len(), 6);
        assert_eq!(
            map.module_path("libc.so"),
            Some("/apex/com.android.runtime/lib64/bionic/libc.so")
        );
        assert_eq!(
            map.module_base("/apex/com.android.runtime/lib64/bionic/libc.so"),
            Some(0x7f00_0000_0000)
        );
    }

    #[test]
    fn test_trap_addr_is_non_executable() {
        let map = MemoryMap::parse(SAMPLE).unwrap();
        // The first libc mapping (ELF header page, r--p), not the r-xp one
        assert_eq!(map.trap_addr("libc.so"), Some(0x7f00_0000_0000));
    }

    #[test]
    fn test_anonymous_within() {
        let map = MemoryMap::parse(SAMPLE).unwrap();
        let anon = map.anonymous_within(0x7f00_0000_0000, 0x0000_0000_0200_0000);
        assert_eq!(anon, vec![(0x7f00_0010_0000, 0x8000)]);
    }

    #[test]
    fn test_region_description() {
        let map = MemoryMap::parse(SAMPLE).unwrap();
        assert!(map.describe(0x5a10_0000_0100).contains("app_process64"));
        assert_eq!(map.describe(0x10), "<unmapped>");
    }
}
