//! Typed view over a position-independent payload image
//!
//! Only what the remote loader needs: ident validation for the build's own
//! class and machine, PT_LOAD geometry, a PT_DYNAMIC summary, and
//! dynamic-symbol access. Section headers are never consulted; everything
//! flows from the program headers, the same way the target's own runtime
//! loader would see the file.

use std::mem;
use std::path::Path;

use object::elf;
use object::NativeEndian as NE;

use crate::domain::InjectorError;
use crate::image::file::ImageFile;
use crate::image::{page_ceil, page_floor};

#[cfg(target_pointer_width = "64")]
mod native {
    use object::NativeEndian;
    pub type Ehdr = object::elf::FileHeader64<NativeEndian>;
    pub type Phdr = object::elf::ProgramHeader64<NativeEndian>;
    pub type DynEntry = object::elf::Dyn64<NativeEndian>;
    pub type SymEntry = object::elf::Sym64<NativeEndian>;
    pub type RelEntry = object::elf::Rel64<NativeEndian>;
    pub type RelaEntry = object::elf::Rela64<NativeEndian>;
    pub const CLASS: u8 = object::elf::ELFCLASS64;
}
#[cfg(target_pointer_width = "32")]
mod native {
    use object::NativeEndian;
    pub type Ehdr = object::elf::FileHeader32<NativeEndian>;
    pub type Phdr = object::elf::ProgramHeader32<NativeEndian>;
    pub type DynEntry = object::elf::Dyn32<NativeEndian>;
    pub type SymEntry = object::elf::Sym32<NativeEndian>;
    pub type RelEntry = object::elf::Rel32<NativeEndian>;
    pub type RelaEntry = object::elf::Rela32<NativeEndian>;
    pub const CLASS: u8 = object::elf::ELFCLASS32;
}

pub use native::{DynEntry, Ehdr, Phdr, RelEntry, RelaEntry, SymEntry};

#[cfg(target_arch = "x86_64")]
const MACHINE: u16 = elf::EM_X86_64;
#[cfg(target_arch = "aarch64")]
const MACHINE: u16 = elf::EM_AARCH64;
#[cfg(target_arch = "arm")]
const MACHINE: u16 = elf::EM_ARM;
#[cfg(target_arch = "x86")]
const MACHINE: u16 = elf::EM_386;

/// Split `r_info` into (symbol index, relocation type).
#[cfg(target_pointer_width = "64")]
#[must_use]
pub fn split_reloc_info(info: u64) -> (u32, u32) {
    ((info >> 32) as u32, info as u32)
}
#[cfg(target_pointer_width = "32")]
#[must_use]
pub fn split_reloc_info(info: u32) -> (u32, u32) {
    (info >> 8, info & 0xff)
}

/// One PT_LOAD entry, reduced to what layout and protection need.
#[derive(Debug, Clone, Copy)]
pub struct LoadSegment {
    pub vaddr: usize,
    pub filesz: usize,
    pub memsz: usize,
    pub offset: usize,
    pub flags: u32,
}

impl LoadSegment {
    /// The segment's declared final protection as `PROT_*` bits.
    #[must_use]
    pub fn prot(&self) -> i32 {
        let mut prot = libc::PROT_NONE;
        if self.flags & elf::PF_R != 0 {
            prot |= libc::PROT_READ;
        }
        if self.flags & elf::PF_W != 0 {
            prot |= libc::PROT_WRITE;
        }
        if self.flags & elf::PF_X != 0 {
            prot |= libc::PROT_EXEC;
        }
        prot
    }

    #[must_use]
    pub fn writable(&self) -> bool {
        self.flags & elf::PF_W != 0
    }
}

/// A REL, RELA, or PLT relocation table from PT_DYNAMIC.
#[derive(Debug, Clone, Copy)]
pub struct RelocTable {
    pub vaddr: usize,
    pub size: usize,
    /// True when entries carry an explicit addend.
    pub explicit_addend: bool,
}

/// Parsed payload image: header-validated file plus its dynamic summary.
#[derive(Debug)]
pub struct ElfImage {
    file: ImageFile,
    loads: Vec<LoadSegment>,
    symtab_off: usize,
    strtab_off: usize,
    strsz: usize,
    nsyms: usize,
    rel: Option<RelocTable>,
    rela: Option<RelocTable>,
    jmprel: Option<RelocTable>,
    needed: Vec<usize>,
}

impl ElfImage {
    pub fn open(path: &Path) -> Result<Self, InjectorError> {
        Self::parse(ImageFile::open(path)?)
    }

    pub fn parse(file: ImageFile) -> Result<Self, InjectorError> {
        let header: &Ehdr = file.pod_at(0)?;
        let ident = header.e_ident;
        if ident.magic != elf::ELFMAG {
            return Err(InjectorError::ImageFormat("bad ELF magic".into()));
        }
        if ident.class != native::CLASS {
            return Err(InjectorError::ImageFormat(format!(
                "ELF class {} does not match this address-space width",
                ident.class
            )));
        }
        if ident.data != elf::ELFDATA2LSB {
            return Err(InjectorError::ImageFormat("big-endian image".into()));
        }
        if header.e_machine.get(NE) != MACHINE {
            return Err(InjectorError::ImageFormat(format!(
                "machine {:#x} does not match this architecture",
                header.e_machine.get(NE)
            )));
        }
        if usize::from(header.e_phentsize.get(NE)) != mem::size_of::<Phdr>() {
            return Err(InjectorError::ImageFormat("unexpected program header size".into()));
        }

        let phoff = header.e_phoff.get(NE) as usize;
        let phnum = usize::from(header.e_phnum.get(NE));
        let phdrs: &[Phdr] = file.pod_slice_at(phoff, phnum)?;

        let mut loads = Vec::new();
        let mut dynamic = None;
        for ph in phdrs {
            match ph.p_type.get(NE) {
                elf::PT_LOAD => {
                    let flags = ph.p_flags.get(NE);
                    // Never mapped writable and executable at once, so the
                    // declaration must not ask for it either
                    if flags & (elf::PF_W | elf::PF_X) == (elf::PF_W | elf::PF_X) {
                        return Err(InjectorError::ImageFormat(
                            "segment declares both write and execute".into(),
                        ));
                    }
                    loads.push(LoadSegment {
                        vaddr: ph.p_vaddr.get(NE) as usize,
                        filesz: ph.p_filesz.get(NE) as usize,
                        memsz: ph.p_memsz.get(NE) as usize,
                        offset: ph.p_offset.get(NE) as usize,
                        flags,
                    });
                }
                elf::PT_DYNAMIC => {
                    dynamic = Some((ph.p_offset.get(NE) as usize, ph.p_filesz.get(NE) as usize));
                }
                _ => {}
            }
        }
        if loads.is_empty() {
            return Err(InjectorError::ImageFormat("no loadable segments".into()));
        }
        let (dyn_off, dyn_size) =
            dynamic.ok_or_else(|| InjectorError::ImageFormat("no dynamic segment".into()))?;

        let mut image = Self {
            file,
            loads,
            symtab_off: 0,
            strtab_off: 0,
            strsz: 0,
            nsyms: 0,
            rel: None,
            rela: None,
            jmprel: None,
            needed: Vec::new(),
        };
        image.parse_dynamic(dyn_off, dyn_size)?;
        Ok(image)
    }

    fn parse_dynamic(&mut self, dyn_off: usize, dyn_size: usize) -> Result<(), InjectorError> {
        let entries: &[DynEntry] =
            self.file.pod_slice_at(dyn_off, dyn_size / mem::size_of::<DynEntry>())?;

        let mut symtab = None;
        let mut strtab = None;
        let mut strsz = 0usize;
        let mut rel = (None, 0usize);
        let mut rela = (None, 0usize);
        let mut jmprel = (None, 0usize, false);
        let mut gnu_hash = None;
        let mut sysv_hash = None;

        for entry in entries {
            #[allow(clippy::cast_possible_truncation)]
            let tag = entry.d_tag.get(NE) as u32;
            let val = entry.d_val.get(NE) as usize;
            match tag {
                elf::DT_NULL => break,
                elf::DT_SYMTAB => symtab = Some(val),
                elf::DT_STRTAB => strtab = Some(val),
                elf::DT_STRSZ => strsz = val,
                elf::DT_REL => rel.0 = Some(val),
                elf::DT_RELSZ => rel.1 = val,
                elf::DT_RELA => rela.0 = Some(val),
                elf::DT_RELASZ => rela.1 = val,
                elf::DT_JMPREL => jmprel.0 = Some(val),
                elf::DT_PLTRELSZ => jmprel.1 = val,
                elf::DT_PLTREL => jmprel.2 = val == elf::DT_RELA as usize,
                elf::DT_NEEDED => self.needed.push(val),
                elf::DT_GNU_HASH => gnu_hash = Some(val),
                elf::DT_HASH => sysv_hash = Some(val),
                _ => {}
            }
        }

        let symtab =
            symtab.ok_or_else(|| InjectorError::ImageFormat("missing DT_SYMTAB".into()))?;
        let strtab =
            strtab.ok_or_else(|| InjectorError::ImageFormat("missing DT_STRTAB".into()))?;
        self.symtab_off = self.vaddr_to_offset(symtab)?;
        self.strtab_off = self.vaddr_to_offset(strtab)?;
        self.strsz = strsz;
        self.rel = rel.0.map(|vaddr| RelocTable { vaddr, size: rel.1, explicit_addend: false });
        self.rela = rela.0.map(|vaddr| RelocTable { vaddr, size: rela.1, explicit_addend: true });
        self.jmprel =
            jmprel.0.map(|vaddr| RelocTable { vaddr, size: jmprel.1, explicit_addend: jmprel.2 });

        self.nsyms = match gnu_hash {
            Some(vaddr) => self.count_syms_gnu_hash(vaddr)?,
            None => match sysv_hash {
                // Second word of the SysV hash header is nchain == nsyms
                Some(vaddr) => {
                    let off = self.vaddr_to_offset(vaddr)?;
                    let nchain: &object::U32<NE> = self.file.pod_at(off + 4)?;
                    nchain.get(NE) as usize
                }
                // Heuristic of last resort: dynstr conventionally follows dynsym
                None => strtab.saturating_sub(symtab) / mem::size_of::<SymEntry>(),
            },
        };
        Ok(())
    }

    /// Bound the dynamic symbol count by walking the GNU hash buckets to the
    /// highest referenced index, then its chain to the end-of-chain bit.
    fn count_syms_gnu_hash(&self, vaddr: usize) -> Result<usize, InjectorError> {
        let off = self.vaddr_to_offset(vaddr)?;
        let header: &[object::U32<NE>] = self.file.pod_slice_at(off, 4)?;
        let nbuckets = header[0].get(NE) as usize;
        let symoffset = header[1].get(NE) as usize;
        let bloom_size = header[2].get(NE) as usize;

        let buckets_off = off + 16 + bloom_size * mem::size_of::<usize>();
        let buckets: &[object::U32<NE>] = self.file.pod_slice_at(buckets_off, nbuckets)?;
        let mut last = buckets.iter().map(|b| b.get(NE) as usize).max().unwrap_or(0);
        if last < symoffset {
            return Ok(symoffset);
        }

        let chains_off = buckets_off + nbuckets * 4;
        loop {
            let chain: &object::U32<NE> =
                self.file.pod_at(chains_off + (last - symoffset) * 4)?;
            if chain.get(NE) & 1 != 0 {
                return Ok(last + 1);
            }
            last += 1;
        }
    }

    /// Translate an image virtual address to a file offset through PT_LOAD.
    pub fn vaddr_to_offset(&self, vaddr: usize) -> Result<usize, InjectorError> {
        self.loads
            .iter()
            .find(|l| vaddr >= l.vaddr && vaddr < l.vaddr + l.filesz)
            .map(|l| l.offset + (vaddr - l.vaddr))
            .ok_or_else(|| {
                InjectorError::ImageFormat(format!("vaddr {vaddr:#x} not backed by any segment"))
            })
    }

    #[must_use]
    pub fn loads(&self) -> &[LoadSegment] {
        &self.loads
    }

    #[must_use]
    pub fn nsyms(&self) -> usize {
        self.nsyms
    }

    /// Relocation tables in application order: REL, RELA, then PLT.
    #[must_use]
    pub fn reloc_tables(&self) -> impl Iterator<Item = RelocTable> + '_ {
        [self.rel, self.rela, self.jmprel].into_iter().flatten()
    }

    pub fn rel_entries(&self, table: &RelocTable) -> Result<&[RelEntry], InjectorError> {
        let off = self.vaddr_to_offset(table.vaddr)?;
        self.file.pod_slice_at(off, table.size / mem::size_of::<RelEntry>())
    }

    pub fn rela_entries(&self, table: &RelocTable) -> Result<&[RelaEntry], InjectorError> {
        let off = self.vaddr_to_offset(table.vaddr)?;
        self.file.pod_slice_at(off, table.size / mem::size_of::<RelaEntry>())
    }

    /// DT_NEEDED library names, in declaration order.
    pub fn needed_names(&self) -> Result<Vec<&str>, InjectorError> {
        self.needed.iter().map(|&off| self.string_at(off)).collect()
    }

    pub fn sym(&self, index: usize) -> Result<&SymEntry, InjectorError> {
        self.file.pod_at(self.symtab_off + index * mem::size_of::<SymEntry>())
    }

    pub fn sym_name(&self, sym: &SymEntry) -> Result<&str, InjectorError> {
        self.string_at(sym.st_name.get(NE) as usize)
    }

    fn string_at(&self, offset: usize) -> Result<&str, InjectorError> {
        if self.strsz != 0 && offset >= self.strsz {
            return Err(InjectorError::ImageFormat(format!(
                "string offset {offset:#x} outside string table of {:#x} bytes",
                self.strsz
            )));
        }
        self.file.str_at(self.strtab_off + offset)
    }

    /// The recorded value of a defined (non-import) symbol.
    pub fn lookup_defined(&self, name: &str) -> Result<Option<usize>, InjectorError> {
        for index in 0..self.nsyms {
            let sym = self.sym(index)?;
            if sym.st_shndx.get(NE) == elf::SHN_UNDEF {
                continue;
            }
            if self.sym_name(sym)? == name {
                return Ok(Some(sym.st_value.get(NE) as usize));
            }
        }
        Ok(None)
    }

    /// Page-aligned reservation: lowest page and total span across PT_LOAD.
    pub fn reserve_span(&self, page_size: usize) -> Result<(usize, usize), InjectorError> {
        reserve_span(&self.loads, page_size)
    }

    /// Local bytes backing a segment's file range.
    pub fn segment_bytes(&self, seg: &LoadSegment) -> Result<&[u8], InjectorError> {
        self.file.bytes_at(seg.offset, seg.filesz)
    }
}

/// `(page_floor(min vaddr), page_ceil(max vaddr+memsz) - page_floor(min vaddr))`.
pub fn reserve_span(
    loads: &[LoadSegment],
    page_size: usize,
) -> Result<(usize, usize), InjectorError> {
    let min = loads.iter().map(|l| l.vaddr).min();
    let max = loads.iter().map(|l| l.vaddr + l.memsz).max();
    match (min, max) {
        (Some(min), Some(max)) if max > min => {
            let floor = page_floor(min, page_size);
            Ok((floor, page_ceil(max, page_size) - floor))
        }
        _ => Err(InjectorError::ImageFormat("empty load segment set".into())),
    }
}
