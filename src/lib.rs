//! Streaming decoders for SPSS (`.sav`, `.zsav`, `.por`), SAS (`.sas7bdat`,
//! `.xpt`) and Stata (`.dta`) data files.
//!
//! A decode sniffs the format from the leading bytes and pushes what it finds
//! to a [Handler]: file metadata, value labels, variables, then every value
//! in row-major order. [Dataset] is a handler that keeps everything in
//! memory; [parquet::write_dataset] writes one out.

use std::io::Read;
use std::path::Path;

use log::debug;

pub mod binary;
pub mod charset;
pub mod classify;
pub mod compress;
pub mod concurrency;
pub mod dataset;
pub mod error;
pub mod handler;
pub mod model;
pub mod options;
pub mod parquet;
pub mod sas;
pub mod sniff;
pub mod source;
pub mod spss;
pub mod stata;
pub mod translate;

pub use dataset::{Dataset, ValueLabelTable};
pub use error::{Error, Result};
pub use handler::{Dispatcher, Handler, HandlerResult};
pub use model::{
    Alignment, ByteOrder, Compression, FileFormat, FileKind, FileMetadata, LabelKey, LabelSetId,
    Measure, MissingValues, StorageType, Value, ValueType, Variable,
};
pub use options::DecodeOptions;
pub use source::ByteSource;

impl FileKind {
    /// Runs the decoder for this kind over `data`.
    pub fn decode<H: Handler + ?Sized>(
        self,
        data: &[u8],
        options: &DecodeOptions,
        out: &mut Dispatcher<H>,
    ) -> Result<()> {
        match self {
            FileKind::Sav | FileKind::Zsav => spss::sav::decode(data, self, options, out),
            FileKind::Por => spss::por::decode(data, options, out),
            FileKind::Sas7bdat => sas::sas7bdat::decode(data, options, out),
            FileKind::Xport => sas::xport::decode(data, options, out),
            FileKind::Dta => stata::file::decode(data, options, out),
        }
    }
}

/// Decodes the file at `path` with default options.
pub fn decode<H: Handler + ?Sized>(path: impl AsRef<Path>, handler: &mut H) -> Result<()> {
    decode_with(path, &DecodeOptions::default(), handler)
}

pub fn decode_with<H: Handler + ?Sized>(
    path: impl AsRef<Path>,
    options: &DecodeOptions,
    handler: &mut H,
) -> Result<()> {
    let path = path.as_ref();
    let source = ByteSource::open(path)?;
    debug!("decoding {} ({} bytes)", path.display(), source.len());
    decode_source(&source, options, handler)
}

/// Drains `reader` into memory, then decodes it.
pub fn decode_reader<R: Read, H: Handler + ?Sized>(
    reader: R,
    options: &DecodeOptions,
    handler: &mut H,
) -> Result<()> {
    let source = ByteSource::from_reader(reader)?;
    decode_source(&source, options, handler)
}

pub fn decode_source<H: Handler + ?Sized>(
    source: &ByteSource,
    options: &DecodeOptions,
    handler: &mut H,
) -> Result<()> {
    let data = source.as_slice();
    let kind = sniff::sniff(data)?;
    let mut out = Dispatcher::new(handler);
    kind.decode(data, options, &mut out).map_err(|e| {
        out.poison();
        e
    })
}
