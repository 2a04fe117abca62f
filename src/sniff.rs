//! Picks the decoder for a file from its leading bytes.
//!
//! Checks run in a fixed order and the first exact match wins:
//! SPSS system file, SAS7BDAT, SAS transport, Stata 117+, Stata 104-115,
//! SPSS portable.

use log::debug;

use crate::error::{Error, Result};
use crate::model::FileKind;
use crate::sas::{sas7bdat, xport};
use crate::spss::por;
use crate::stata::{self, Release};

/// Bytes of the source the sniffer looks at.
pub const SNIFF_LEN: usize = 4096;

/// `$FL2` in EBCDIC.
const EBCDIC_FL2: &[u8; 4] = b"\x5b\xc6\xd3\xf2";

/// Marker SPSS writes after an 8-byte prefix in password-protected files.
const ENCRYPTED: &[u8] = b"ENCRYPTEDSAV";

pub fn sniff(prefix: &[u8]) -> Result<FileKind> {
    let prefix = &prefix[..prefix.len().min(SNIFF_LEN)];
    let kind = sniff_kind(prefix)?;
    debug!("sniffed {kind:?}");
    Ok(kind)
}

fn sniff_kind(prefix: &[u8]) -> Result<FileKind> {
    if prefix.starts_with(b"$FL2") {
        return Ok(FileKind::Sav);
    }
    if prefix.starts_with(b"$FL3") {
        return Ok(FileKind::Zsav);
    }
    if prefix.get(8..20) == Some(ENCRYPTED) {
        return Err(Error::unsupported("encrypted SPSS file"));
    }
    if prefix.starts_with(EBCDIC_FL2) {
        return Err(Error::unsupported("EBCDIC system file"));
    }
    if prefix.starts_with(&sas7bdat::MAGIC) {
        return Ok(FileKind::Sas7bdat);
    }
    if prefix.starts_with(xport::LIBRARY_HEADER) {
        return Ok(FileKind::Xport);
    }
    if prefix.starts_with(xport::LIBRARY_HEADER_V8) {
        return Err(Error::unsupported("SAS transport version 8"));
    }
    if prefix.starts_with(b"<stata_dta>") {
        return Ok(FileKind::Dta);
    }
    if let [release, byteorder, filetype, ..] = *prefix {
        let release = Release(release as u32);
        if stata::RELEASES.contains(&release.0)
            && !release.is_tagged()
            && (byteorder == 1 || byteorder == 2)
            && filetype == 1
        {
            return Ok(FileKind::Dta);
        }
    }
    if por::is_portable(prefix) {
        return Ok(FileKind::Por);
    }
    Err(Error::UnrecognizedFormat)
}
