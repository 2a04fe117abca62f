//! Maps format-specific type codes and flags onto storage types, value
//! types, measurement levels and alignments.
//!
//! Formats without a notion of measurement level (SAS, Stata) always yield
//! [Measure::Unknown].

use crate::model::{Alignment, Measure, StorageType};

/// SPSS variable record width: 0 is numeric, 1 to 255 is a string of that
/// many bytes (very long strings are widened later).
pub fn spss_storage(width: i32) -> Option<StorageType> {
    match width {
        0 => Some(StorageType::Double),
        w if w > 0 => Some(StorageType::Text(w as u32)),
        _ => None,
    }
}

/// SPSS variable display record measure code.
pub fn spss_measure(code: i32) -> Measure {
    match code {
        1 => Measure::Nominal,
        2 => Measure::Ordinal,
        3 => Measure::Scale,
        _ => Measure::Unknown,
    }
}

/// SPSS variable display record alignment code.
pub fn spss_alignment(code: i32) -> Alignment {
    match code {
        0 => Alignment::Left,
        1 => Alignment::Right,
        2 => Alignment::Center,
        _ => Alignment::Unknown,
    }
}

fn spss_format_name(type_code: u32) -> Option<&'static str> {
    let name = match type_code {
        1 => "A",
        2 => "AHEX",
        3 => "COMMA",
        4 => "DOLLAR",
        5 => "F",
        6 => "IB",
        7 => "PIBHEX",
        8 => "P",
        9 => "PIB",
        10 => "PK",
        11 => "RB",
        12 => "RBHEX",
        15 => "Z",
        16 => "N",
        17 => "E",
        20 => "DATE",
        21 => "TIME",
        22 => "DATETIME",
        23 => "ADATE",
        24 => "JDATE",
        25 => "DTIME",
        26 => "WKDAY",
        27 => "MONTH",
        28 => "MOYR",
        29 => "QYR",
        30 => "WKYR",
        31 => "PCT",
        32 => "DOT",
        33 => "CCA",
        34 => "CCB",
        35 => "CCC",
        36 => "CCD",
        37 => "CCE",
        38 => "EDATE",
        39 => "SDATE",
        40 => "MTIME",
        41 => "YMDHMS",
        _ => return None,
    };
    Some(name)
}

/// Renders an SPSS format specification (`type`, `width`, `decimals`), as
/// stored packed in system files or separately in portable files.
pub fn spss_format(type_code: u32, width: u32, decimals: u32) -> Option<String> {
    let name = spss_format_name(type_code)?;
    if decimals > 0 {
        Some(format!("{name}{width}.{decimals}"))
    } else {
        Some(format!("{name}{width}"))
    }
}

/// Unpacks the `type << 16 | width << 8 | decimals` print format word of a
/// system file variable record.
pub fn spss_packed_format(packed: i32) -> Option<String> {
    let packed = packed as u32;
    spss_format((packed >> 16) & 0xff, (packed >> 8) & 0xff, packed & 0xff)
}

/// SAS column type: 1 numeric, 2 character.
pub fn sas_storage(column_type: u8, width: u32) -> Option<StorageType> {
    match column_type {
        1 => Some(StorageType::Double),
        2 => Some(StorageType::Text(width)),
        _ => None,
    }
}

/// Renders a SAS format name with its width and decimals, e.g. `DATE9.` or
/// `8.2`.
pub fn sas_format(name: &str, width: u32, decimals: u32) -> Option<String> {
    let name = name.trim();
    if name.is_empty() && width == 0 {
        return None;
    }
    let mut out = name.to_owned();
    if width > 0 {
        out.push_str(&width.to_string());
    }
    out.push('.');
    if decimals > 0 {
        out.push_str(&decimals.to_string());
    }
    Some(out)
}

/// Stata type byte for releases before 117. Releases before 111 use letters
/// for numeric types and `0x7f + n` for `strN`.
pub fn stata_storage_old(code: u8, release: u32) -> Option<StorageType> {
    if release >= 111 {
        match code {
            1..=244 => Some(StorageType::Text(code as u32)),
            251 => Some(StorageType::Int8),
            252 => Some(StorageType::Int16),
            253 => Some(StorageType::Int32),
            254 => Some(StorageType::Float),
            255 => Some(StorageType::Double),
            _ => None,
        }
    } else {
        match code {
            b'b' => Some(StorageType::Int8),
            b'i' => Some(StorageType::Int16),
            b'l' => Some(StorageType::Int32),
            b'f' => Some(StorageType::Float),
            b'd' => Some(StorageType::Double),
            0x80..=0xff => Some(StorageType::Text((code - 0x7f) as u32)),
            _ => None,
        }
    }
}

/// Stata type word for releases 117 and later.
pub fn stata_storage_new(code: u16) -> Option<StorageType> {
    match code {
        1..=2045 => Some(StorageType::Text(code as u32)),
        32768 => Some(StorageType::LongText),
        65526 => Some(StorageType::Double),
        65527 => Some(StorageType::Float),
        65528 => Some(StorageType::Int32),
        65529 => Some(StorageType::Int16),
        65530 => Some(StorageType::Int8),
        _ => None,
    }
}

/// Alignment implied by a Stata display format: `%-9s` is left aligned,
/// `%~9s` centered, everything else right aligned.
pub fn stata_alignment(format: &str) -> Alignment {
    if format.starts_with("%-") {
        Alignment::Left
    } else if format.starts_with("%~") {
        Alignment::Center
    } else if format.starts_with('%') {
        Alignment::Right
    } else {
        Alignment::Unknown
    }
}

/// SAS transport namestr type: 1 numeric, 2 character.
pub fn xport_storage(ntype: i16, length: u32) -> Option<StorageType> {
    match ntype {
        1 => Some(StorageType::Double),
        2 => Some(StorageType::Text(length)),
        _ => None,
    }
}
