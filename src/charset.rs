//! Text conversion service: raw bytes plus a source encoding in, UTF-8 out.
//!
//! Everything here is a pure function so concurrent decodes can share it.

use std::borrow::Cow;

use encoding_rs::{
    Encoding, BIG5, EUC_JP, EUC_KR, GB18030, GBK, IBM866, ISO_8859_2, ISO_8859_3, ISO_8859_4,
    ISO_8859_5, ISO_8859_6, ISO_8859_7, ISO_8859_8, KOI8_R, SHIFT_JIS, UTF_8, WINDOWS_1250,
    WINDOWS_1251, WINDOWS_1252, WINDOWS_1253, WINDOWS_1254, WINDOWS_1255, WINDOWS_1256,
    WINDOWS_1257, WINDOWS_1258, WINDOWS_874,
};

use crate::error::{Error, Result};

/// Decodes `bytes`, found at `offset` in the source, as `encoding`.
/// Malformed input is an error rather than being replaced.
pub fn decode_text(bytes: &[u8], encoding: &'static Encoding, offset: u64) -> Result<String> {
    if encoding.is_ascii_compatible() && bytes.is_ascii() {
        // ASCII is valid UTF-8 and means the same in every ASCII-compatible
        // encoding.
        if let Ok(s) = std::str::from_utf8(bytes) {
            return Ok(s.to_owned());
        }
    }
    match encoding.decode_without_bom_handling_and_without_replacement(bytes) {
        Some(Cow::Borrowed(s)) => Ok(s.to_owned()),
        Some(Cow::Owned(s)) => Ok(s),
        None => Err(Error::Encoding {
            encoding: encoding.name(),
            offset,
        }),
    }
}

/// Strips trailing blanks and NULs, the padding of fixed-width text fields.
pub fn trim_padding(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|&b| b != b' ' && b != 0)
        .map_or(0, |i| i + 1);
    &bytes[..end]
}

/// Cuts a NUL-terminated field at its terminator.
pub fn until_nul(bytes: &[u8]) -> &[u8] {
    match bytes.iter().position(|&x| x == 0) {
        Some(n) => &bytes[..n],
        None => bytes,
    }
}

pub fn by_label(label: &str) -> Option<&'static Encoding> {
    Encoding::for_label(label.trim().as_bytes())
}

/// Encoding for an SPSS integer-info character code (a Windows code page
/// number for modern files).
pub fn spss_codepage(code: i32) -> Option<&'static Encoding> {
    let encoding = match code {
        2 | 3 | 1252 | 20127 | 28591 => WINDOWS_1252,
        4 | 932 => SHIFT_JIS,
        65001 => UTF_8,
        866 => IBM866,
        874 => WINDOWS_874,
        936 => GBK,
        949 => EUC_KR,
        950 => BIG5,
        1250 => WINDOWS_1250,
        1251 => WINDOWS_1251,
        1253 => WINDOWS_1253,
        1254 => WINDOWS_1254,
        1255 => WINDOWS_1255,
        1256 => WINDOWS_1256,
        1257 => WINDOWS_1257,
        1258 => WINDOWS_1258,
        20866 => KOI8_R,
        28592 => ISO_8859_2,
        28593 => ISO_8859_3,
        28594 => ISO_8859_4,
        28595 => ISO_8859_5,
        28596 => ISO_8859_6,
        28597 => ISO_8859_7,
        28598 => ISO_8859_8,
        20932 | 51932 => EUC_JP,
        54936 => GB18030,
        _ => return None,
    };
    Some(encoding)
}

/// Encoding for the character set byte of a SAS7BDAT header. Code 0 means
/// the file does not say.
pub fn sas_charset(code: u8) -> Option<&'static Encoding> {
    let encoding = match code {
        0 | 28 | 29 | 62 => WINDOWS_1252,
        20 => UTF_8,
        30 => ISO_8859_2,
        31 => ISO_8859_3,
        32 => ISO_8859_4,
        33 => ISO_8859_5,
        34 => ISO_8859_6,
        35 => ISO_8859_7,
        36 => ISO_8859_8,
        37 | 40 => WINDOWS_1254,
        60 => WINDOWS_1250,
        61 => WINDOWS_1251,
        63 => WINDOWS_1253,
        64 => WINDOWS_1254,
        65 => WINDOWS_1255,
        66 => WINDOWS_1256,
        67 => WINDOWS_1257,
        68 => WINDOWS_1258,
        123 => BIG5,
        125 => GB18030,
        134 => EUC_JP,
        138 => SHIFT_JIS,
        140 => EUC_KR,
        _ => return None,
    };
    Some(encoding)
}
