use std::path::PathBuf;

use nom::{Finish, IResult};
use thiserror::Error as ThisError;

use crate::compress::DecompressError;

/// Error returned by a handler hook to stop a decode.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Every way a decode can fail. Any error ends the decode session; events
/// already delivered stay delivered and describe an unusable partial result.
#[derive(Debug, ThisError)]
pub enum Error {
    /// The path does not resolve to a readable byte source.
    #[error("cannot open {}: {source}", path.display())]
    SourceNotFound {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No decoder recognized the leading bytes.
    #[error("unrecognized file format")]
    UnrecognizedFormat,

    /// A structural violation, found at byte `offset` of the source.
    #[error("malformed file at offset {offset:#x}: {detail}")]
    MalformedFile { offset: u64, detail: String },

    /// A recognized variant that this crate does not decode.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// Text could not be converted from the declared encoding.
    #[error("text at offset {offset:#x} is not valid {encoding}")]
    Encoding { encoding: &'static str, offset: u64 },

    /// Reading a stream source failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A handler hook asked to stop.
    #[error("decode aborted by handler: {0}")]
    Aborted(#[source] HandlerError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn malformed(offset: u64, detail: impl Into<String>) -> Error {
        Error::MalformedFile {
            offset,
            detail: detail.into(),
        }
    }

    pub fn unsupported(detail: impl Into<String>) -> Error {
        Error::UnsupportedFeature(detail.into())
    }

    /// A decompression failure is a structural error in the file.
    pub fn decompress(offset: u64, e: DecompressError) -> Error {
        Error::malformed(offset, format!("decompression failed: {e}"))
    }
}

/// Byte offset of `rest` inside `base`, where `rest` is a suffix (or any
/// subslice) of `base`.
pub fn offset_in(base: &[u8], rest: &[u8]) -> u64 {
    (rest.as_ptr() as usize).saturating_sub(base.as_ptr() as usize) as u64
}

/// Turns a nom result over a slice of `base` into a crate result, reporting
/// the offset where the parser stopped.
pub trait DownstreamError<'a, O> {
    fn map_res(self, base: &[u8], what: &str) -> Result<(&'a [u8], O)>;
}

impl<'a, O> DownstreamError<'a, O> for IResult<&'a [u8], O> {
    fn map_res(self, base: &[u8], what: &str) -> Result<(&'a [u8], O)> {
        self.finish()
            .map_err(|e| Error::malformed(offset_in(base, e.input), format!("bad or truncated {what}")))
    }
}
