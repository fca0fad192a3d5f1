//! End-to-end remote-load tests against an emulated target
//!
//! A mock tracee with a byte-addressed memory image stands in for the real
//! process; remote mmap/mprotect/prctl/open calls are emulated by decoding
//! the staged argument registers. The payload images are synthetic ELF files
//! assembled byte by byte, so every offset the loader consumes is known.

#![cfg(all(target_pointer_width = "64", any(target_arch = "x86_64", target_arch = "aarch64")))]

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use nix::sys::signal::Signal;

use zygote_injector::domain::InjectorError;
use zygote_injector::image::elf::ElfImage;
use zygote_injector::image::loader::{RemoteFns, RemoteLoader};
use zygote_injector::image::page_ceil;
use zygote_injector::remote::arch::{blank_registers, CallAbi, NativeAbi, Registers};
use zygote_injector::remote::maps::{MapEntry, MemoryMap, Perms};
use zygote_injector::remote::{Stop, Tracee};

#[cfg(target_arch = "x86_64")]
mod consts {
    pub const EM: u16 = object::elf::EM_X86_64;
    pub const R_RELATIVE: u32 = object::elf::R_X86_64_RELATIVE;
    pub const R_GLOB_DAT: u32 = object::elf::R_X86_64_GLOB_DAT;
}
#[cfg(target_arch = "aarch64")]
mod consts {
    pub const EM: u16 = object::elf::EM_AARCH64;
    pub const R_RELATIVE: u32 = object::elf::R_AARCH64_RELATIVE;
    pub const R_GLOB_DAT: u32 = object::elf::R_AARCH64_GLOB_DAT;
}
use consts::{EM, R_GLOB_DAT, R_RELATIVE};

const PAGE: usize = 0x1000;
const TRAP: usize = 0x7f00_dead_0000;

const FN_MMAP: usize = 0x7f00_0000_1000;
const FN_MPROTECT: usize = 0x7f00_0000_2000;
const FN_PRCTL: usize = 0x7f00_0000_3000;
const FN_OPEN: usize = 0x7f00_0000_4000;
const FN_CLOSE: usize = 0x7f00_0000_5000;

const PR_SET_VMA: usize = 0x5356_4d41;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MmapCall {
    addr: usize,
    len: usize,
    prot: i32,
    flags: i32,
    fd: i32,
}

/// Emulated target: byte-granular memory plus a libc that answers the five
/// entry points the loader may call.
struct MockTarget {
    regs: Registers,
    mem: HashMap<usize, u8>,
    pending: Option<Stop>,
    next_base: usize,
    mmap_calls: Vec<MmapCall>,
    mprotect_calls: Vec<(usize, usize, i32)>,
    prctl_names: Vec<(usize, usize, String)>,
    prctl_ret: usize,
    opened_paths: Vec<String>,
    closed_fds: Vec<usize>,
}

impl MockTarget {
    fn new() -> Self {
        let mut regs = blank_registers();
        set_sp(&mut regs, 0x7ffd_0000_0000);
        Self {
            regs,
            mem: HashMap::new(),
            pending: None,
            next_base: 0x7a00_0000_0000,
            mmap_calls: Vec::new(),
            mprotect_calls: Vec::new(),
            prctl_names: Vec::new(),
            prctl_ret: 0,
            opened_paths: Vec::new(),
            closed_fds: Vec::new(),
        }
    }

    fn c_string_at(&self, addr: usize) -> String {
        let mut out = Vec::new();
        let mut cur = addr;
        while let Some(&b) = self.mem.get(&cur) {
            if b == 0 {
                break;
            }
            out.push(b);
            cur += 1;
        }
        String::from_utf8(out).unwrap()
    }

    fn emulate_call(&mut self) -> usize {
        let func = NativeAbi::code_addr(NativeAbi::pc(&self.regs));
        let a: Vec<usize> =
            (0..6).map(|i| NativeAbi::arg(&self.regs, i).unwrap()).collect();
        match func {
            FN_MMAP => {
                let call = MmapCall {
                    addr: a[0],
                    len: a[1],
                    prot: a[2] as i32,
                    flags: a[3] as i32,
                    fd: a[4] as i32,
                };
                self.mmap_calls.push(call);
                if call.flags & libc::MAP_FIXED != 0 {
                    call.addr
                } else {
                    let base = self.next_base;
                    self.next_base += page_ceil(call.len, PAGE);
                    base
                }
            }
            FN_MPROTECT => {
                self.mprotect_calls.push((a[0], a[1], a[2] as i32));
                0
            }
            FN_PRCTL => {
                assert_eq!(a[0], PR_SET_VMA);
                let name = self.c_string_at(a[4]);
                self.prctl_names.push((a[2], a[3], name));
                self.prctl_ret
            }
            FN_OPEN => {
                self.opened_paths.push(self.c_string_at(a[0]));
                3
            }
            FN_CLOSE => {
                self.closed_fds.push(a[0]);
                0
            }
            other => panic!("unexpected remote call to {other:#x}"),
        }
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
}

impl Tracee for MockTarget {
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
        let ret = self.emulate_call();
        NativeAbi::set_retval(&mut self.regs, ret);
        NativeAbi::set_pc(&mut self.regs, TRAP);
        self.pending = Some(Stop::Signal(Signal::SIGSEGV));
        Ok(())
    }

    fn wait(&mut self) -> Result<Stop, InjectorError> {
        Ok(self.pending.take().expect("wait without resume"))
    }
}

// ---- synthetic image assembly -------------------------------------------

const EHDR_SIZE: usize = 0x40;
const PHDR_SIZE: usize = 0x38;
const DYN_SIZE: usize = 16;
const SYM_SIZE: usize = 24;
const RELA_SIZE: usize = 24;

const SEG1_VADDR: usize = 0x1000;
const SEG1_FILESZ: usize = 0x900;
const SEG1_MEMSZ: usize = 0xa00;
const FILE_SIZE: usize = SEG1_VADDR + SEG1_FILESZ;

/// File offset past which the builder places nothing, free for relocation
/// targets and data patches.
const SCRATCH_VADDR: usize = 0x1700;

struct SymSpec {
    name: &'static str,
    value: usize,
    defined: bool,
}

struct RelaSpec {
    offset: usize,
    sym: u32,
    rtype: u32,
    addend: i64,
}

struct ImageSpec {
    syms: Vec<SymSpec>,
    needed: Vec<&'static str>,
    relas: Vec<RelaSpec>,
    /// (vaddr, bytes) patched into segment data after assembly.
    patches: Vec<(usize, Vec<u8>)>,
}

fn put(bytes: &mut [u8], off: usize, data: &[u8]) {
    bytes[off..off + data.len()].copy_from_slice(data);
}

fn put16(bytes: &mut [u8], off: usize, v: u16) {
    put(bytes, off, &v.to_le_bytes());
}

fn put32(bytes: &mut [u8], off: usize, v: u32) {
    put(bytes, off, &v.to_le_bytes());
}

fn put64(bytes: &mut [u8], off: usize, v: u64) {
    put(bytes, off, &v.to_le_bytes());
}

/// Assemble a minimal ET_DYN image: an R|X segment holding the headers and an
/// R|W segment holding PT_DYNAMIC, the symbol and string tables, a RELA table
/// and scratch space. Every vaddr equals its file offset.
fn build_image(spec: &ImageSpec) -> Vec<u8> {
    let mut strtab = vec![0u8];
    let name_off = |s: &str, strtab: &mut Vec<u8>| {
        let off = strtab.len();
        strtab.extend_from_slice(s.as_bytes());
        strtab.push(0);
        off
    };
    let sym_names: Vec<usize> = spec.syms.iter().map(|s| name_off(s.name, &mut strtab)).collect();
    let needed_offs: Vec<usize> = spec.needed.iter().map(|n| name_off(n, &mut strtab)).collect();

    let ndyn = spec.needed.len() + 6;
    let dyn_off = SEG1_VADDR;
    let symtab_off = dyn_off + ndyn * DYN_SIZE;
    let nsyms = 1 + spec.syms.len();
    let strtab_off = symtab_off + nsyms * SYM_SIZE;
    let rela_off = (strtab_off + strtab.len() + 7) & !7;
    let rela_end = rela_off + spec.relas.len() * RELA_SIZE;
    assert!(rela_end <= SCRATCH_VADDR, "builder tables overflow into scratch space");

    let mut bytes = vec![0u8; FILE_SIZE];

    // ELF header
    put(&mut bytes, 0, &[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
    put16(&mut bytes, 16, object::elf::ET_DYN);
    put16(&mut bytes, 18, EM);
    put32(&mut bytes, 20, 1);
    put64(&mut bytes, 32, EHDR_SIZE as u64); // e_phoff
    put16(&mut bytes, 52, EHDR_SIZE as u16);
    put16(&mut bytes, 54, PHDR_SIZE as u16);
    put16(&mut bytes, 56, 3); // phnum

    // Program headers: LOAD R|X, LOAD R|W, DYNAMIC
    let phdr = |bytes: &mut [u8], idx: usize, p_type: u32, flags: u32, off: usize, filesz: usize, memsz: usize| {
        let base = EHDR_SIZE + idx * PHDR_SIZE;
        put32(bytes, base, p_type);
        put32(bytes, base + 4, flags);
        put64(bytes, base + 8, off as u64); // p_offset
        put64(bytes, base + 16, off as u64); // p_vaddr
        put64(bytes, base + 32, filesz as u64);
        put64(bytes, base + 40, memsz as u64);
        put64(bytes, base + 48, PAGE as u64);
    };
    phdr(&mut bytes, 0, object::elf::PT_LOAD, object::elf::PF_R | object::elf::PF_X, 0, 0x400, 0x400);
    phdr(
        &mut bytes,
        1,
        object::elf::PT_LOAD,
        object::elf::PF_R | object::elf::PF_W,
        SEG1_VADDR,
        SEG1_FILESZ,
        SEG1_MEMSZ,
    );
    phdr(&mut bytes, 2, object::elf::PT_DYNAMIC, object::elf::PF_R, dyn_off, ndyn * DYN_SIZE, ndyn * DYN_SIZE);

    // Dynamic section
    let mut dyn_idx = 0;
    let mut dyn_entry = |bytes: &mut [u8], tag: u32, val: usize| {
        let base = dyn_off + dyn_idx * DYN_SIZE;
        put64(bytes, base, u64::from(tag));
        put64(bytes, base + 8, val as u64);
        dyn_idx += 1;
    };
    for &off in &needed_offs {
        dyn_entry(&mut bytes, object::elf::DT_NEEDED, off);
    }
    dyn_entry(&mut bytes, object::elf::DT_SYMTAB, symtab_off);
    dyn_entry(&mut bytes, object::elf::DT_STRTAB, strtab_off);
    dyn_entry(&mut bytes, object::elf::DT_STRSZ, strtab.len());
    dyn_entry(&mut bytes, object::elf::DT_RELA, rela_off);
    dyn_entry(&mut bytes, object::elf::DT_RELASZ, spec.relas.len() * RELA_SIZE);
    dyn_entry(&mut bytes, object::elf::DT_NULL, 0);

    // Symbol table (index 0 stays the null symbol)
    for (i, sym) in spec.syms.iter().enumerate() {
        let base = symtab_off + (1 + i) * SYM_SIZE;
        put32(&mut bytes, base, sym_names[i] as u32);
        bytes[base + 4] = 0x12; // GLOBAL FUNC
        put16(&mut bytes, base + 6, if sym.defined { 1 } else { object::elf::SHN_UNDEF });
        put64(&mut bytes, base + 8, sym.value as u64);
    }

    put(&mut bytes, strtab_off, &strtab);

    for (i, rela) in spec.relas.iter().enumerate() {
        let base = rela_off + i * RELA_SIZE;
        put64(&mut bytes, base, rela.offset as u64);
        put64(&mut bytes, base + 8, (u64::from(rela.sym) << 32) | u64::from(rela.rtype));
        put64(&mut bytes, base + 16, rela.addend as u64);
    }

    for (vaddr, data) in &spec.patches {
        put(&mut bytes, *vaddr, data);
    }
    bytes
}

fn basic_spec() -> ImageSpec {
    ImageSpec {
        syms: vec![SymSpec { name: "entry", value: 0x180, defined: true }],
        needed: vec![],
        relas: vec![],
        patches: vec![],
    }
}

fn write_image(dir: &tempfile::TempDir, name: &str, spec: &ImageSpec) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, build_image(spec)).unwrap();
    path
}

fn copy_fns() -> RemoteFns {
    RemoteFns { mmap: FN_MMAP, mprotect: FN_MPROTECT, prctl: FN_PRCTL, open: None, close: None }
}

fn file_entry(start: usize, end: usize, path: &str) -> MapEntry {
    MapEntry {
        start,
        end,
        perms: Perms { read: true, ..Perms::default() },
        offset: 0,
        dev: (0xfe, 9),
        inode: 7,
        path: Some(path.to_string()),
    }
}

// ---- tests ---------------------------------------------------------------

#[test]
fn test_load_reproduces_layout_and_applies_relocations() {
    let dir = tempfile::tempdir().unwrap();
    let mut spec = basic_spec();
    spec.syms.push(SymSpec { name: "vma_name", value: SCRATCH_VADDR, defined: true });
    spec.relas = vec![
        RelaSpec { offset: 0x1800, sym: 0, rtype: R_RELATIVE, addend: 0x180 },
        RelaSpec { offset: 0x1808, sym: 0, rtype: R_RELATIVE, addend: SCRATCH_VADDR as i64 },
    ];
    spec.patches = vec![(SCRATCH_VADDR, b"payload-image\0".to_vec())];
    let path = write_image(&dir, "libpayload.so", &spec);

    let mut target = MockTarget::new();
    let maps = MemoryMap::from_entries(vec![]);
    let loaded =
        RemoteLoader::new(&mut target, copy_fns(), TRAP, PAGE).load(&path, &maps).unwrap();

    // Two pages of PT_LOAD span, reserved in one PROT_NONE mapping
    assert_eq!(loaded.size, 0x2000);
    let base = loaded.base;
    assert_eq!(
        target.mmap_calls[0],
        MmapCall {
            addr: 0,
            len: 0x2000,
            prot: libc::PROT_NONE,
            flags: libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            fd: -1,
        }
    );
    // Both segments land as fixed anonymous RW mappings inside the span
    let fixed: Vec<_> =
        target.mmap_calls[1..].iter().filter(|c| c.flags & libc::MAP_FIXED != 0).collect();
    assert_eq!(fixed.len(), 2);
    assert_eq!((fixed[0].addr, fixed[0].len), (base, PAGE));
    assert_eq!((fixed[1].addr, fixed[1].len), (base + PAGE, PAGE));

    // Segment bytes were copied in: the remote base starts with the header
    let mut magic = [0u8; 4];
    target.read_mem(base, &mut magic).unwrap();
    assert_eq!(&magic, b"\x7fELF");

    // Both relative relocations shifted by the load bias (== base here)
    assert_eq!(target.read_word(base + 0x1800).unwrap(), base + 0x180);
    assert_eq!(target.read_word(base + 0x1808).unwrap(), base + SCRATCH_VADDR);

    // Declared protections applied last, one mprotect per segment
    assert_eq!(
        target.mprotect_calls,
        vec![
            (base, PAGE, libc::PROT_READ | libc::PROT_EXEC),
            (base + PAGE, PAGE, libc::PROT_READ | libc::PROT_WRITE),
        ]
    );

    // Anonymous ranges were named with the image's exported string
    assert_eq!(target.prctl_names.len(), 2);
    for (_, _, name) in &target.prctl_names {
        assert_eq!(name, "payload-image");
    }

    assert_eq!(loaded.entry, base + 0x180);
}

#[test]
fn test_symbol_relocation_through_needed_library() {
    let dir = tempfile::tempdir().unwrap();
    let helper_spec = ImageSpec {
        syms: vec![SymSpec { name: "helper_fn", value: 0x2c0, defined: true }],
        needed: vec![],
        relas: vec![],
        patches: vec![],
    };
    let helper_path = write_image(&dir, "libhelper.so", &helper_spec);

    let mut spec = basic_spec();
    spec.syms.push(SymSpec { name: "helper_fn", value: 0, defined: false });
    spec.needed = vec!["libhelper.so"];
    // Symbol index 2: null, entry, helper_fn
    spec.relas = vec![RelaSpec { offset: 0x1800, sym: 2, rtype: R_GLOB_DAT, addend: 0 }];
    let path = write_image(&dir, "libpayload.so", &spec);

    const HELPER_BASE: usize = 0x7b00_0000_0000;
    let maps = MemoryMap::from_entries(vec![file_entry(
        HELPER_BASE,
        HELPER_BASE + 0x2000,
        helper_path.to_str().unwrap(),
    )]);

    let mut target = MockTarget::new();
    let loaded =
        RemoteLoader::new(&mut target, copy_fns(), TRAP, PAGE).load(&path, &maps).unwrap();

    assert_eq!(target.read_word(loaded.base + 0x1800).unwrap(), HELPER_BASE + 0x2c0);
}

#[test]
fn test_undefined_symbol_is_image_format_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut spec = basic_spec();
    spec.syms.push(SymSpec { name: "missing_fn", value: 0, defined: false });
    spec.relas = vec![RelaSpec { offset: 0x1800, sym: 2, rtype: R_GLOB_DAT, addend: 0 }];
    let path = write_image(&dir, "libpayload.so", &spec);

    let mut target = MockTarget::new();
    let maps = MemoryMap::from_entries(vec![]);
    let err =
        RemoteLoader::new(&mut target, copy_fns(), TRAP, PAGE).load(&path, &maps).unwrap_err();
    assert!(matches!(err, InjectorError::ImageFormat(_)), "{err}");
    assert!(err.to_string().contains("missing_fn"), "{err}");
}

#[test]
fn test_optional_unwind_symbols_bind_to_null() {
    let dir = tempfile::tempdir().unwrap();
    let mut spec = basic_spec();
    spec.syms.push(SymSpec { name: "__register_frame", value: 0, defined: false });
    spec.relas = vec![RelaSpec { offset: 0x1800, sym: 2, rtype: R_GLOB_DAT, addend: 0 }];
    let path = write_image(&dir, "libpayload.so", &spec);

    let mut target = MockTarget::new();
    let maps = MemoryMap::from_entries(vec![]);
    let loaded =
        RemoteLoader::new(&mut target, copy_fns(), TRAP, PAGE).load(&path, &maps).unwrap();
    assert_eq!(target.read_word(loaded.base + 0x1800).unwrap(), 0);
}

#[test]
fn test_missing_entry_symbol_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let spec = ImageSpec {
        syms: vec![SymSpec { name: "unrelated", value: 0x100, defined: true }],
        needed: vec![],
        relas: vec![],
        patches: vec![],
    };
    let path = write_image(&dir, "libpayload.so", &spec);

    let mut target = MockTarget::new();
    let maps = MemoryMap::from_entries(vec![]);
    let err =
        RemoteLoader::new(&mut target, copy_fns(), TRAP, PAGE).load(&path, &maps).unwrap_err();
    assert!(err.to_string().contains("entry"), "{err}");
}

#[test]
fn test_vma_naming_failure_does_not_fail_the_load() {
    let dir = tempfile::tempdir().unwrap();
    let mut spec = basic_spec();
    spec.syms.push(SymSpec { name: "vma_name", value: SCRATCH_VADDR, defined: true });
    spec.patches = vec![(SCRATCH_VADDR, b"payload-image\0".to_vec())];
    let path = write_image(&dir, "libpayload.so", &spec);

    let mut target = MockTarget::new();
    target.prctl_ret = usize::MAX; // kernel without anonymous-VMA naming
    let maps = MemoryMap::from_entries(vec![]);
    assert!(RemoteLoader::new(&mut target, copy_fns(), TRAP, PAGE).load(&path, &maps).is_ok());
}

#[test]
fn test_relocation_application_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let helper_spec = ImageSpec {
        syms: vec![SymSpec { name: "helper_fn", value: 0x2c0, defined: true }],
        needed: vec![],
        relas: vec![],
        patches: vec![],
    };
    let helper_path = write_image(&dir, "libhelper.so", &helper_spec);

    let mut spec = basic_spec();
    spec.syms.push(SymSpec { name: "helper_fn", value: 0, defined: false });
    spec.needed = vec!["libhelper.so"];
    spec.relas = vec![
        RelaSpec { offset: 0x1800, sym: 0, rtype: R_RELATIVE, addend: 0x180 },
        RelaSpec { offset: 0x1808, sym: 2, rtype: R_GLOB_DAT, addend: 0 },
    ];
    let path = write_image(&dir, "libpayload.so", &spec);

    const HELPER_BASE: usize = 0x7b00_0000_0000;
    let maps = MemoryMap::from_entries(vec![file_entry(
        HELPER_BASE,
        HELPER_BASE + 0x2000,
        helper_path.to_str().unwrap(),
    )]);

    // Two fresh targets allocate the same base, so the same load bias; the
    // relocated regions must come out byte for byte identical.
    let mut first = MockTarget::new();
    let loaded_a =
        RemoteLoader::new(&mut first, copy_fns(), TRAP, PAGE).load(&path, &maps).unwrap();
    let mut second = MockTarget::new();
    let loaded_b =
        RemoteLoader::new(&mut second, copy_fns(), TRAP, PAGE).load(&path, &maps).unwrap();

    assert_eq!(loaded_a.base, loaded_b.base);
    assert_eq!(loaded_a.entry, loaded_b.entry);
    let mut bytes_a = vec![0u8; loaded_a.size];
    let mut bytes_b = vec![0u8; loaded_b.size];
    first.read_mem(loaded_a.base, &mut bytes_a).unwrap();
    second.read_mem(loaded_b.base, &mut bytes_b).unwrap();
    assert_eq!(bytes_a, bytes_b);
}

#[test]
fn test_writable_executable_segment_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut bytes = build_image(&basic_spec());
    // Flags field of the second program header
    let flags_off = EHDR_SIZE + PHDR_SIZE + 4;
    bytes[flags_off..flags_off + 4].copy_from_slice(
        &(object::elf::PF_R | object::elf::PF_W | object::elf::PF_X).to_le_bytes(),
    );
    let path = dir.path().join("libpayload.so");
    fs::write(&path, bytes).unwrap();

    let err = ElfImage::open(&path).unwrap_err();
    assert!(matches!(err, InjectorError::ImageFormat(_)), "{err}");
    assert!(err.to_string().contains("write and execute"), "{err}");
}

#[test]
fn test_file_backed_load_maps_instead_of_copying() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_image(&dir, "libpayload.so", &basic_spec());

    let mut target = MockTarget::new();
    let fns = RemoteFns {
        open: Some(FN_OPEN),
        close: Some(FN_CLOSE),
        ..copy_fns()
    };
    let maps = MemoryMap::from_entries(vec![]);
    let loaded = RemoteLoader::new(&mut target, fns, TRAP, PAGE).load(&path, &maps).unwrap();
    let base = loaded.base;

    assert_eq!(target.opened_paths, vec![path.to_str().unwrap().to_string()]);
    assert_eq!(target.closed_fds, vec![3]);

    // The read-only segment came straight from the file descriptor, at its
    // final protection, with no bytes pushed over the memory channel
    let file_mapped: Vec<_> = target.mmap_calls.iter().filter(|c| c.fd == 3).collect();
    assert_eq!(file_mapped.len(), 1);
    assert_eq!(file_mapped[0].addr, base);
    assert_eq!(file_mapped[0].prot, libc::PROT_READ | libc::PROT_EXEC);
    let mut head = [0u8; 4];
    target.read_mem(base, &mut head).unwrap();
    assert_eq!(head, [0, 0, 0, 0]);

    // The writable segment still goes through the anonymous copy path
    let mut dyn_tag = [0u8; 4];
    target.read_mem(base + SEG1_VADDR, &mut dyn_tag).unwrap();
    assert_ne!(dyn_tag, [0, 0, 0, 0]);
}
