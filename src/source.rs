//! Byte sources the decoders read from.
//!
//! Files are memory-mapped so decoders can address any offset without
//! copying; streams are drained into an owned buffer first.

use std::fs::File;
use std::io::Read;
use std::ops::Deref;
use std::path::Path;

use log::debug;
use mmap_rs::{Mmap, MmapOptions};

use crate::error::{Error, Result};

#[derive(Debug)]
pub enum ByteSource {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl ByteSource {
    /// Opens `path`. Anything that stops the file from being read is
    /// reported as [Error::SourceNotFound].
    pub fn open(path: &Path) -> Result<ByteSource> {
        let not_found = |source| Error::SourceNotFound {
            path: path.to_path_buf(),
            source,
        };
        let file = File::open(path).map_err(not_found)?;
        let meta = file.metadata().map_err(not_found)?;
        if !meta.is_file() {
            return Err(not_found(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "not a regular file",
            )));
        }
        let len = meta.len();
        if len == 0 {
            return Ok(ByteSource::Owned(Vec::new()));
        }
        let size = usize::try_from(len).map_err(|_| {
            not_found(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "file too large to map",
            ))
        })?;
        // The mapping is read-only and lives as long as the source; the file
        // must not be truncated underneath it.
        let mapped = MmapOptions::new(size).and_then(|options| unsafe { options.with_file(&file, 0).map() });
        match mapped {
            Ok(map) => Ok(ByteSource::Mapped(map)),
            Err(e) => {
                debug!("mapping {} failed ({e}), reading it instead", path.display());
                let mut buf = Vec::with_capacity(size);
                let mut file = file;
                file.read_to_end(&mut buf).map_err(not_found)?;
                Ok(ByteSource::Owned(buf))
            }
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> ByteSource {
        ByteSource::Owned(bytes)
    }

    pub fn from_reader<R: Read>(mut reader: R) -> Result<ByteSource> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        Ok(ByteSource::Owned(buf))
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            ByteSource::Mapped(map) => map.as_slice(),
            ByteSource::Owned(buf) => buf,
        }
    }
}

impl Deref for ByteSource {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}
