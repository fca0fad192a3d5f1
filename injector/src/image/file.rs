//! Bounds-checked access to an image file
//!
//! The whole file is read once into a word-aligned buffer; every typed
//! access validates its offset and length against the buffer before the
//! `object::pod` cast. Malformed offsets surface as `ImageFormat` errors,
//! never as out-of-bounds reads.

use std::path::Path;
use std::{any, fs, mem, str};

use object::pod::{self, Pod};

use crate::domain::InjectorError;

#[derive(Debug)]
pub struct ImageFile {
    // u64 backing keeps the base aligned for every ELF record type
    backing: Vec<u64>,
    len: usize,
}

impl ImageFile {
    pub fn open(path: &Path) -> Result<Self, InjectorError> {
        let bytes = fs::read(path)?;
        Ok(Self::from_bytes(&bytes))
    }

    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut backing = vec![0u64; bytes.len().div_ceil(mem::size_of::<u64>())];
        pod::bytes_of_slice_mut(&mut backing)[..bytes.len()].copy_from_slice(bytes);
        Self { backing, len: bytes.len() }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &pod::bytes_of_slice(&self.backing)[..self.len]
    }

    pub fn bytes_at(&self, offset: usize, len: usize) -> Result<&[u8], InjectorError> {
        offset
            .checked_add(len)
            .and_then(|end| self.data().get(offset..end))
            .ok_or_else(|| {
                InjectorError::ImageFormat(format!(
                    "range {offset:#x}+{len:#x} outside file of {:#x} bytes",
                    self.len
                ))
            })
    }

    pub fn pod_at<T: Pod>(&self, offset: usize) -> Result<&T, InjectorError> {
        let bytes = self.bytes_at(offset, mem::size_of::<T>())?;
        let (value, _) = pod::from_bytes(bytes).map_err(|()| {
            InjectorError::ImageFormat(format!(
                "misaligned {} at offset {offset:#x}",
                any::type_name::<T>()
            ))
        })?;
        Ok(value)
    }

    pub fn pod_slice_at<T: Pod>(&self, offset: usize, count: usize) -> Result<&[T], InjectorError> {
        let len = count.checked_mul(mem::size_of::<T>()).ok_or_else(|| {
            InjectorError::ImageFormat(format!("table of {count} entries overflows"))
        })?;
        let bytes = self.bytes_at(offset, len)?;
        let (values, _) = pod::slice_from_bytes(bytes, count).map_err(|()| {
            InjectorError::ImageFormat(format!(
                "misaligned {} table at offset {offset:#x}",
                any::type_name::<T>()
            ))
        })?;
        Ok(values)
    }

    /// NUL-terminated string starting at `offset`.
    pub fn str_at(&self, offset: usize) -> Result<&str, InjectorError> {
        let tail = self.data().get(offset..).ok_or_else(|| {
            InjectorError::ImageFormat(format!(
                "string offset {offset:#x} outside file of {:#x} bytes",
                self.len
            ))
        })?;
        let nul = tail.iter().position(|&b| b == 0).ok_or_else(|| {
            InjectorError::ImageFormat(format!("unterminated string at offset {offset:#x}"))
        })?;
        str::from_utf8(&tail[..nul]).map_err(|_| {
            InjectorError::ImageFormat(format!("non-UTF-8 string at offset {offset:#x}"))
        })
    }
}
