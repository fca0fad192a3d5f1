//! Symbol resolution inside another process
//!
//! The target's copy of a module is never parsed remotely. Instead the
//! module's own file is parsed from local disk and the symbol's recorded
//! value is shifted by the module's remote load bias: remote mapped base
//! minus the page-floored minimum PT_LOAD vaddr.

use std::collections::HashMap;
use std::path::Path;

use crate::domain::InjectorError;
use crate::image::elf::ElfImage;
use crate::remote::maps::MemoryMap;

/// One module mapped in the target, with its local parse cached.
pub struct RemoteModule {
    image: ElfImage,
    load_bias: usize,
}

impl RemoteModule {
    pub fn open(path: &str, maps: &MemoryMap, page_size: usize) -> Result<Self, InjectorError> {
        let remote_base = maps.module_base(path).ok_or_else(|| {
            InjectorError::ImageFormat(format!("{path} is not mapped in the target"))
        })?;
        let image = ElfImage::open(Path::new(path))?;
        let (span_floor, _) = image.reserve_span(page_size)?;
        Ok(Self { image, load_bias: remote_base - span_floor })
    }

    /// Remote address of a defined symbol, if the module exports it.
    pub fn resolve(&self, name: &str) -> Result<Option<usize>, InjectorError> {
        Ok(self.image.lookup_defined(name)?.map(|value| self.load_bias + value))
    }
}

/// Resolver over one map snapshot, caching parsed modules by path.
pub struct RemoteSymbols<'m> {
    maps: &'m MemoryMap,
    page_size: usize,
    modules: HashMap<String, RemoteModule>,
}

impl<'m> RemoteSymbols<'m> {
    #[must_use]
    pub fn new(maps: &'m MemoryMap, page_size: usize) -> Self {
        Self { maps, page_size, modules: HashMap::new() }
    }

    #[must_use]
    pub fn maps(&self) -> &'m MemoryMap {
        self.maps
    }

    fn module(&mut self, path: &str) -> Result<&RemoteModule, InjectorError> {
        if !self.modules.contains_key(path) {
            let module = RemoteModule::open(path, self.maps, self.page_size)?;
            self.modules.insert(path.to_string(), module);
        }
        Ok(&self.modules[path])
    }

    /// Remote address of `name` in the module at `path`, if exported there.
    pub fn resolve(&mut self, path: &str, name: &str) -> Result<Option<usize>, InjectorError> {
        self.module(path)?.resolve(name)
    }

    /// Like [`Self::resolve`], but absence is an error.
    pub fn resolve_required(&mut self, path: &str, name: &str) -> Result<usize, InjectorError> {
        self.resolve(path, name)?.ok_or_else(|| {
            InjectorError::ImageFormat(format!("symbol {name} not found in {path}"))
        })
    }
}
