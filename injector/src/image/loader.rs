//! Hand-rolled remote load of the payload image
//!
//! Reproduces the image's PT_LOAD layout inside the target through remote
//! mmap/mprotect calls, copies segment bytes over the tracee memory channel,
//! applies relocations, and only then locks each segment down to its
//! declared protection. No page is ever writable and executable at the same
//! time, and nothing resembling code is written anywhere the image itself
//! does not declare.
//!
//! Partial remote state is not rolled back on failure; a target that fails
//! mid-load is abandoned to the crash-loop policy.

use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use log::{debug, trace, warn};
use object::NativeEndian as NE;

use crate::domain::InjectorError;
use crate::image::elf::{split_reloc_info, ElfImage};
use crate::image::symbols::RemoteSymbols;
use crate::image::{page_ceil, page_floor};
use crate::remote::arch::{CallAbi, NativeAbi, RelocKind};
use crate::remote::call::call_remote;
use crate::remote::maps::MemoryMap;
use crate::remote::Tracee;

// Not in every libc crate release yet
const PR_SET_VMA: usize = 0x5356_4d41;
const PR_SET_VMA_ANON_NAME: usize = 0;

/// Unwind-support hooks the image may import without its libraries
/// providing them; they bind to null when absent.
const OPTIONAL_SYMBOLS: [&str; 2] = ["__register_frame", "__deregister_frame"];

/// Remote addresses of the target's own libc entry points.
#[derive(Debug, Clone, Copy)]
pub struct RemoteFns {
    pub mmap: usize,
    pub mprotect: usize,
    pub prctl: usize,
    /// Present only under the file-backed loading strategy.
    pub open: Option<usize>,
    pub close: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
pub struct LoadedImage {
    pub base: usize,
    pub size: usize,
    pub entry: usize,
}

pub struct RemoteLoader<'a, T: Tracee + ?Sized> {
    tracee: &'a mut T,
    fns: RemoteFns,
    trap: usize,
    page_size: usize,
}

impl<'a, T: Tracee + ?Sized> RemoteLoader<'a, T> {
    pub fn new(tracee: &'a mut T, fns: RemoteFns, trap: usize, page_size: usize) -> Self {
        Self { tracee, fns, trap, page_size }
    }

    /// Load the image at `image_path` into the target and return its mapped
    /// base, reservation size, and initialization entry address.
    pub fn load(
        &mut self,
        image_path: &Path,
        maps: &MemoryMap,
    ) -> Result<LoadedImage, InjectorError> {
        let image = ElfImage::open(image_path)?;
        let (span_floor, reserve_size) = image.reserve_span(self.page_size)?;

        let base = self.remote_mmap(
            0,
            reserve_size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )?;
        let load_bias = base - span_floor;
        debug!("reserved {reserve_size:#x} bytes at {base:#x}, load bias {load_bias:#x}");

        let remote_fd = match (self.fns.open, self.fns.close) {
            (Some(_), Some(_)) => Some(self.remote_open(image_path)?),
            _ => None,
        };

        // (addr, len) of every anonymous mapping, for VMA naming afterwards
        let mut anon_ranges = Vec::new();
        // (addr, len, prot) recorded now, applied after relocation
        let mut protections = Vec::new();
        for seg in image.loads() {
            let seg_floor = page_floor(seg.vaddr, self.page_size);
            let seg_end = page_ceil(seg.vaddr + seg.memsz, self.page_size);
            let seg_len = seg_end - seg_floor;
            protections.push((load_bias + seg_floor, seg_len, seg.prot()));

            match remote_fd {
                Some(fd) if !seg.writable() => {
                    let file_end = page_ceil(seg.vaddr + seg.filesz, self.page_size);
                    if file_end > seg_floor {
                        self.remote_mmap(
                            load_bias + seg_floor,
                            file_end - seg_floor,
                            seg.prot(),
                            libc::MAP_PRIVATE | libc::MAP_FIXED,
                            fd as i32,
                            page_floor(seg.offset, self.page_size),
                        )?;
                    }
                    // bss tail past the file bytes stays anonymous
                    if seg_end > file_end {
                        self.remote_mmap(
                            load_bias + file_end,
                            seg_end - file_end,
                            libc::PROT_READ | libc::PROT_WRITE,
                            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
                            -1,
                            0,
                        )?;
                        anon_ranges.push((load_bias + file_end, seg_end - file_end));
                    }
                }
                _ => {
                    self.remote_mmap(
                        load_bias + seg_floor,
                        seg_len,
                        libc::PROT_READ | libc::PROT_WRITE,
                        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
                        -1,
                        0,
                    )?;
                    anon_ranges.push((load_bias + seg_floor, seg_len));
                    if seg.filesz > 0 {
                        self.tracee.write_mem(load_bias + seg.vaddr, image.segment_bytes(seg)?)?;
                    }
                }
            }
            trace!(
                "segment vaddr {:#x} memsz {:#x} at {:#x} (prot {:#x})",
                seg.vaddr,
                seg.memsz,
                load_bias + seg_floor,
                seg.prot()
            );
        }
        if let Some(fd) = remote_fd {
            self.remote_close(fd)?;
        }

        // A needed library missing from the target's map only matters if a
        // relocation ends up requiring it.
        let mut needed_paths = Vec::new();
        for name in image.needed_names()? {
            match maps.module_path(name) {
                Some(path) => needed_paths.push(path.to_string()),
                None => debug!("needed library {name} is not mapped in the target"),
            }
        }

        let mut resolver = RemoteSymbols::new(maps, self.page_size);
        let applied =
            self.apply_relocations(&image, load_bias, &needed_paths, &mut resolver)?;
        debug!("applied {applied} relocations");

        for &(addr, len, prot) in &protections {
            self.remote_mprotect(addr, len, prot)?;
        }

        self.name_anonymous_ranges(&image, load_bias, &anon_ranges);

        let entry_value = image
            .lookup_defined("entry")?
            .ok_or_else(|| InjectorError::ImageFormat("image exports no entry symbol".into()))?;
        Ok(LoadedImage { base, size: reserve_size, entry: load_bias + entry_value })
    }

    fn apply_relocations(
        &mut self,
        image: &ElfImage,
        load_bias: usize,
        needed: &[String],
        resolver: &mut RemoteSymbols<'_>,
    ) -> Result<usize, InjectorError> {
        let mut applied = 0usize;
        for table in image.reloc_tables() {
            // (target offset, symbol index, type, explicit addend)
            let entries: Vec<(usize, u32, u32, Option<isize>)> = if table.explicit_addend {
                image
                    .rela_entries(&table)?
                    .iter()
                    .map(|r| {
                        let (sym, rtype) = split_reloc_info(r.r_info.get(NE));
                        (
                            r.r_offset.get(NE) as usize,
                            sym,
                            rtype,
                            Some(r.r_addend.get(NE) as isize),
                        )
                    })
                    .collect()
            } else {
                image
                    .rel_entries(&table)?
                    .iter()
                    .map(|r| {
                        let (sym, rtype) = split_reloc_info(r.r_info.get(NE));
                        (r.r_offset.get(NE) as usize, sym, rtype, None)
                    })
                    .collect()
            };

            for (offset, sym_idx, rtype, addend) in entries {
                let target = load_bias + offset;
                match NativeAbi::classify_reloc(rtype) {
                    RelocKind::Relative => {
                        let addend = match addend {
                            Some(a) => a,
                            None => self.tracee.read_word(target)? as isize,
                        };
                        self.tracee.write_word(target, (load_bias as isize + addend) as usize)?;
                    }
                    RelocKind::Symbol => {
                        let addr =
                            self.resolve_reloc_symbol(image, load_bias, sym_idx, needed, resolver)?;
                        let value = (addr as isize + addend.unwrap_or(0)) as usize;
                        self.tracee.write_word(target, value)?;
                    }
                    RelocKind::SymbolAbs => {
                        let addr =
                            self.resolve_reloc_symbol(image, load_bias, sym_idx, needed, resolver)?;
                        let addend = match addend {
                            Some(a) => a,
                            None => self.tracee.read_word(target)? as isize,
                        };
                        self.tracee.write_word(target, (addr as isize + addend) as usize)?;
                    }
                    RelocKind::Unsupported => {
                        return Err(InjectorError::ImageFormat(format!(
                            "unsupported relocation type {rtype} at offset {offset:#x}"
                        )));
                    }
                }
                applied += 1;
            }
        }
        Ok(applied)
    }

    fn resolve_reloc_symbol(
        &mut self,
        image: &ElfImage,
        load_bias: usize,
        sym_idx: u32,
        needed: &[String],
        resolver: &mut RemoteSymbols<'_>,
    ) -> Result<usize, InjectorError> {
        let sym = image.sym(sym_idx as usize)?;
        if sym.st_shndx.get(NE) != object::elf::SHN_UNDEF {
            return Ok(load_bias + sym.st_value.get(NE) as usize);
        }
        let name = image.sym_name(sym)?;
        for path in needed {
            if let Some(addr) = resolver.resolve(path, name)? {
                return Ok(addr);
            }
        }
        if OPTIONAL_SYMBOLS.contains(&name) {
            trace!("optional symbol {name} unresolved, binding to null");
            return Ok(0);
        }
        Err(InjectorError::ImageFormat(format!(
            "undefined symbol {name} not found in any needed library"
        )))
    }

    /// Best effort: tag every anonymous mapping of the reservation with the
    /// image's exported name string. Kernels without anonymous-VMA naming
    /// reject the prctl and the load stands as is.
    fn name_anonymous_ranges(
        &mut self,
        image: &ElfImage,
        load_bias: usize,
        anon_ranges: &[(usize, usize)],
    ) {
        let name_addr = match image.lookup_defined("vma_name") {
            Ok(Some(value)) => load_bias + value,
            _ => return,
        };
        for &(start, len) in anon_ranges {
            let args = [PR_SET_VMA, PR_SET_VMA_ANON_NAME, start, len, name_addr];
            match call_remote(self.tracee, self.fns.prctl, self.trap, &args) {
                Ok(0) => {}
                Ok(rc) => {
                    debug!("naming VMA {start:#x}+{len:#x} returned {}", rc as isize);
                    return;
                }
                Err(err) => {
                    warn!("naming VMA {start:#x}+{len:#x} failed: {err}");
                    return;
                }
            }
        }
    }

    fn remote_mmap(
        &mut self,
        addr: usize,
        len: usize,
        prot: i32,
        flags: i32,
        fd: i32,
        offset: usize,
    ) -> Result<usize, InjectorError> {
        let args =
            [addr, len, prot as usize, flags as usize, fd as isize as usize, offset];
        let ret = call_remote(self.tracee, self.fns.mmap, self.trap, &args)?;
        // The libc wrapper reports failure as MAP_FAILED, nothing subtler
        if ret == 0 || ret == usize::MAX {
            return Err(InjectorError::Transient(format!(
                "remote mmap({addr:#x}, {len:#x}) returned {ret:#x}"
            )));
        }
        Ok(ret)
    }

    fn remote_mprotect(&mut self, addr: usize, len: usize, prot: i32) -> Result<(), InjectorError> {
        let ret =
            call_remote(self.tracee, self.fns.mprotect, self.trap, &[addr, len, prot as usize])?;
        if ret != 0 {
            return Err(InjectorError::Transient(format!(
                "remote mprotect({addr:#x}, {len:#x}, {prot:#x}) returned {}",
                ret as isize
            )));
        }
        Ok(())
    }

    fn remote_open(&mut self, path: &Path) -> Result<usize, InjectorError> {
        let open_fn = self.fns.open.ok_or_else(|| {
            InjectorError::ProtocolMismatch("file-backed load without a resolved open".into())
        })?;
        let bytes = path.as_os_str().as_bytes();

        // Scratch space well below the stack pointer; the target is parked at
        // its entry point and will never unwind into this region.
        let regs = self.tracee.regs()?;
        let scratch = (NativeAbi::sp(&regs) - 0x100 - bytes.len() - 1) & !0x7;
        self.tracee.write_mem(scratch, bytes)?;
        self.tracee.write_mem(scratch + bytes.len(), &[0])?;

        let flags = (libc::O_RDONLY | libc::O_CLOEXEC) as usize;
        let fd = call_remote(self.tracee, open_fn, self.trap, &[scratch, flags])?;
        if (fd as isize) < 0 {
            return Err(InjectorError::Transient(format!(
                "remote open of {} returned {}",
                path.display(),
                fd as isize
            )));
        }
        Ok(fd)
    }

    fn remote_close(&mut self, fd: usize) -> Result<(), InjectorError> {
        let close_fn = self.fns.close.ok_or_else(|| {
            InjectorError::ProtocolMismatch("file-backed load without a resolved close".into())
        })?;
        let ret = call_remote(self.tracee, close_fn, self.trap, &[fd])?;
        if ret != 0 {
            debug!("remote close({fd}) returned {}", ret as isize);
        }
        Ok(())
    }
}
