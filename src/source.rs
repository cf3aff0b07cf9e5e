//! Random-access, mutable views over a target image.
//!
//! A [`ByteSource`] is either read fully into an owned buffer that is written
//! back as a whole on [`flush`](ByteSource::flush), or memory mapped so writes
//! go straight through the mapping. Callers see the same contract either way.

use crate::error::{Error, Io, Result};
use clap::arg_enum;
use log::{debug, warn};
use memmap2::{Mmap, MmapMut};
use snafu::ResultExt;
use std::fs::{File, OpenOptions};
use std::io::prelude::*;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    ReadOnly,
    ReadWrite,
}

arg_enum! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Backend {
        Buffer,
        Mmap
    }
}

enum Storage {
    #[cfg(test)]
    Memory(Vec<u8>),
    Buffer {
        file: File,
        data: Vec<u8>,
        dirty: bool,
    },
    Mapped(MmapMut),
    MappedReadOnly(Mmap),
    Closed,
}

pub struct ByteSource {
    path: Option<PathBuf>,
    mode: Mode,
    storage: Storage,
}

impl ByteSource {
    pub fn open<P: AsRef<Path>>(path: P, mode: Mode, backend: Backend) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::NotFound {
                path: path.to_path_buf(),
            });
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(mode == Mode::ReadWrite)
            .open(path)
            .map_err(|e| Error::from_open(path, e))?;
        let length = file.metadata().context(Io { path })?.len();

        // Zero-length files cannot be mapped on every platform.
        let backend = if length == 0 { Backend::Buffer } else { backend };
        debug!(
            "Opening {} ({} bytes, {:?}, {:?})",
            path.display(),
            length,
            mode,
            backend
        );

        let storage = match (backend, mode) {
            (Backend::Buffer, _) => {
                let mut data = Vec::with_capacity(length as usize);
                file.read_to_end(&mut data).context(Io { path })?;
                Storage::Buffer {
                    file,
                    data,
                    dirty: false,
                }
            }
            // The image is exclusively owned for the session; nothing else
            // may truncate or rewrite it while mapped.
            (Backend::Mmap, Mode::ReadWrite) => {
                Storage::Mapped(unsafe { MmapMut::map_mut(&file) }.context(Io { path })?)
            }
            (Backend::Mmap, Mode::ReadOnly) => {
                Storage::MappedReadOnly(unsafe { Mmap::map(&file) }.context(Io { path })?)
            }
        };

        Ok(Self {
            path: Some(path.to_path_buf()),
            mode,
            storage,
        })
    }

    /// Wraps bytes already in memory. Nothing is written anywhere on flush.
    #[cfg(test)]
    pub(crate) fn from_vec(data: Vec<u8>, mode: Mode) -> Self {
        Self {
            path: None,
            mode,
            storage: Storage::Memory(data),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.storage {
            #[cfg(test)]
            Storage::Memory(data) => data.as_slice(),
            Storage::Buffer { data, .. } => data.as_slice(),
            Storage::Mapped(map) => &map[..],
            Storage::MappedReadOnly(map) => &map[..],
            Storage::Closed => &[],
        }
    }

    pub fn length(&self) -> usize {
        self.as_slice().len()
    }

    pub fn read_byte(&self, offset: usize) -> Result<u8> {
        let bytes = self.as_slice();
        bytes.get(offset).copied().ok_or(Error::OutOfRange {
            offset,
            length: bytes.len(),
        })
    }

    pub fn write_byte(&mut self, offset: usize, value: u8) -> Result<()> {
        if self.mode == Mode::ReadOnly {
            return Err(Error::ReadOnly { offset });
        }
        let length = self.length();
        let slot = match &mut self.storage {
            #[cfg(test)]
            Storage::Memory(data) => data.get_mut(offset),
            Storage::Buffer { data, dirty, .. } => {
                let slot = data.get_mut(offset);
                *dirty |= slot.is_some();
                slot
            }
            Storage::Mapped(map) => map.get_mut(offset),
            Storage::MappedReadOnly(_) | Storage::Closed => None,
        };
        match slot {
            Some(byte) => {
                *byte = value;
                Ok(())
            }
            None => Err(Error::OutOfRange { offset, length }),
        }
    }

    /// Forces pending writes to stable storage. A no-op when nothing changed.
    pub fn flush(&mut self) -> Result<()> {
        let path = self.path.clone().unwrap_or_default();
        match &mut self.storage {
            Storage::Buffer { file, data, dirty } if *dirty => {
                file.seek(SeekFrom::Start(0)).context(Io { path: &path })?;
                file.write_all(data).context(Io { path: &path })?;
                file.sync_all().context(Io { path: &path })?;
                *dirty = false;
                debug!("Wrote {} bytes back to {}", data.len(), path.display());
            }
            Storage::Mapped(map) => {
                map.flush().context(Io { path: &path })?;
                debug!("Flushed mapping of {}", path.display());
            }
            _ => {}
        }
        Ok(())
    }

    /// Flushes, then releases the file handle or mapping.
    pub fn close(mut self) -> Result<()> {
        self.flush()?;
        self.storage = Storage::Closed;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn into_inner(mut self) -> Vec<u8> {
        match std::mem::replace(&mut self.storage, Storage::Closed) {
            Storage::Memory(data) => data,
            other => {
                self.storage = other;
                self.as_slice().to_vec()
            }
        }
    }
}

impl Drop for ByteSource {
    fn drop(&mut self) {
        if let Storage::Buffer { dirty: true, .. } = self.storage {
            warn!("Image dropped with unflushed writes, flushing now");
            if let Err(e) = self.flush() {
                warn!("{}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn image(bytes: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_missing_file_is_not_found() {
        for backend in &[Backend::Buffer, Backend::Mmap] {
            let result = ByteSource::open("/nonexistent/libvmwarebase.so", Mode::ReadWrite, *backend);
            assert!(matches!(result, Err(Error::NotFound { .. })));
        }
    }

    #[test]
    fn test_writes_reach_disk_after_close() {
        for backend in &[Backend::Buffer, Backend::Mmap] {
            let file = image(&[0u8; 40]);
            let mut source = ByteSource::open(file.path(), Mode::ReadWrite, *backend).unwrap();
            assert_eq!(source.length(), 40);
            source.write_byte(32, 0x01).unwrap();
            source.write_byte(39, 0xff).unwrap();
            source.close().unwrap();

            let on_disk = std::fs::read(file.path()).unwrap();
            assert_eq!(on_disk[32], 0x01);
            assert_eq!(on_disk[39], 0xff);
            assert_eq!(on_disk.iter().filter(|&&b| b != 0).count(), 2, "{:?}", backend);
        }
    }

    #[test]
    fn test_read_only_rejects_writes() {
        for backend in &[Backend::Buffer, Backend::Mmap] {
            let file = image(&[7u8; 8]);
            let mut source = ByteSource::open(file.path(), Mode::ReadOnly, *backend).unwrap();
            assert_eq!(source.read_byte(3).unwrap(), 7);
            assert!(matches!(
                source.write_byte(3, 0),
                Err(Error::ReadOnly { offset: 3 })
            ));
            source.close().unwrap();
        }
    }

    #[test]
    fn test_out_of_range() {
        let mut source = ByteSource::from_vec(vec![0; 4], Mode::ReadWrite);
        assert!(matches!(
            source.read_byte(4),
            Err(Error::OutOfRange {
                offset: 4,
                length: 4
            })
        ));
        assert!(matches!(
            source.write_byte(10, 1),
            Err(Error::OutOfRange { offset: 10, .. })
        ));
    }

    #[test]
    fn test_flush_and_close_without_writes() {
        for backend in &[Backend::Buffer, Backend::Mmap] {
            let file = image(b"untouched");
            let mut source = ByteSource::open(file.path(), Mode::ReadWrite, *backend).unwrap();
            source.flush().unwrap();
            source.flush().unwrap();
            source.close().unwrap();
            assert_eq!(std::fs::read(file.path()).unwrap(), b"untouched");
        }
    }

    #[test]
    fn test_empty_file_opens_with_mmap() {
        let file = image(&[]);
        let source = ByteSource::open(file.path(), Mode::ReadWrite, Backend::Mmap).unwrap();
        assert_eq!(source.length(), 0);
        source.close().unwrap();
    }
}
