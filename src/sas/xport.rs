//! SAS transport (XPORT version 5) decoder.
//!
//! Everything is laid out in 80-byte card images. Numbers are IBM System/360
//! hexadecimal floats, big endian, 2 to 8 bytes wide. Only the first member
//! of a library is decoded.

use chrono::NaiveDateTime;
use encoding_rs::{Encoding, WINDOWS_1252};
use log::{debug, trace};

use super::missing_from_code;
use crate::binary::{self, PResult};
use crate::charset::{decode_text, trim_padding};
use crate::classify;
use crate::error::{offset_in, DownstreamError, Error, Result};
use crate::handler::{Dispatcher, Handler};
use crate::model::{
    ByteOrder, Compression, FileFormat, FileKind, FileMetadata, StorageType, Value, Variable,
};
use crate::options::DecodeOptions;

pub const LIBRARY_HEADER: &[u8] = b"HEADER RECORD*******LIBRARY HEADER RECORD!!!!!!!";
pub const LIBRARY_HEADER_V8: &[u8] = b"HEADER RECORD*******LIBV8   HEADER RECORD!!!!!!!";
const MEMBER_HEADER: &[u8] = b"HEADER RECORD*******MEMBER  HEADER RECORD!!!!!!!";
const DESCRIPTOR_HEADER: &[u8] = b"HEADER RECORD*******DSCRPTR HEADER RECORD!!!!!!!";
const NAMESTR_HEADER: &[u8] = b"HEADER RECORD*******NAMESTR HEADER RECORD!!!!!!!";
const OBS_HEADER: &[u8] = b"HEADER RECORD*******OBS     HEADER RECORD!!!!!!!";

const RECORD: usize = 80;

/// Converts an IBM hexadecimal float of 2 to 8 bytes. A leading missing
/// code followed by zeros is a missing value.
pub fn ibm_value(bytes: &[u8]) -> Value {
    let mut raw = [0u8; 8];
    let n = bytes.len().min(8);
    raw[..n].copy_from_slice(&bytes[..n]);
    if raw[1..].iter().all(|&b| b == 0) {
        if raw[0] == 0 {
            return Value::Double(0.0);
        }
        if let Some(missing) = missing_from_code(raw[0]) {
            return missing;
        }
    }
    let negative = raw[0] & 0x80 != 0;
    let exponent = (raw[0] & 0x7f) as i32 - 64;
    let mantissa = raw[1..].iter().fold(0u64, |m, &b| (m << 8) | b as u64);
    let x = mantissa as f64 / (1u64 << 56) as f64 * 16f64.powi(exponent);
    Value::Double(if negative { -x } else { x })
}

fn record<'a>(data: &'a [u8], at: usize, what: &str) -> Result<&'a [u8]> {
    data.get(at..at + RECORD)
        .ok_or_else(|| Error::malformed(at as u64, format!("{what} record is truncated")))
}

fn expect_header(data: &[u8], at: usize, header: &[u8], what: &str) -> Result<()> {
    if record(data, at, what)?.starts_with(header) {
        Ok(())
    } else {
        Err(Error::malformed(at as u64, format!("{what} header expected")))
    }
}

/// Integer written in ASCII digits inside a header record.
fn digits(field: &[u8]) -> Option<usize> {
    std::str::from_utf8(field).ok()?.trim().parse().ok()
}

fn timestamp(field: &[u8]) -> Option<NaiveDateTime> {
    let text = std::str::from_utf8(field).ok()?;
    NaiveDateTime::parse_from_str(text.trim(), "%d%b%y:%H:%M:%S").ok()
}

struct Namestr<'a> {
    ntype: i16,
    length: i16,
    name: &'a [u8],
    label: &'a [u8],
    format: &'a [u8],
    format_width: i16,
    format_decimals: i16,
    position: i32,
}

fn namestr(input: &[u8]) -> PResult<Namestr<'_>> {
    let i16p = binary::i16(ByteOrder::MSF);
    let (input, ntype) = i16p(input)?;
    let (input, _hash) = i16p(input)?;
    let (input, length) = i16p(input)?;
    let (input, _varnum) = i16p(input)?;
    let (input, name) = binary::bytes(8)(input)?;
    let (input, label) = binary::bytes(40)(input)?;
    let (input, format) = binary::bytes(8)(input)?;
    let (input, format_width) = i16p(input)?;
    let (input, format_decimals) = i16p(input)?;
    let (input, _justify) = i16p(input)?;
    let (input, _fill) = binary::bytes(2)(input)?;
    let (input, _informat) = binary::bytes(8)(input)?;
    let (input, _informat_width) = i16p(input)?;
    let (input, _informat_decimals) = i16p(input)?;
    let (input, position) = binary::i32(ByteOrder::MSF)(input)?;
    Ok((
        input,
        Namestr {
            ntype,
            length,
            name,
            label,
            format,
            format_width,
            format_decimals,
            position,
        },
    ))
}

struct Column {
    offset: usize,
    width: usize,
    numeric: bool,
}

struct Member {
    variables: Vec<Variable>,
    columns: Vec<Column>,
    row_length: usize,
    data_start: usize,
    data_end: usize,
    name: String,
    label: String,
    created: Option<NaiveDateTime>,
    modified: Option<NaiveDateTime>,
}

fn read_member(data: &[u8], encoding: &'static Encoding) -> Result<Member> {
    let text = |bytes: &[u8], at: usize| decode_text(trim_padding(bytes), encoding, at as u64);

    expect_header(data, 0, LIBRARY_HEADER, "library")?;
    let real_header = record(data, RECORD, "library")?;
    if !real_header.starts_with(b"SAS     SAS     SASLIB") {
        return Err(Error::malformed(RECORD as u64, "library header is not a SAS library"));
    }
    let mut at = 3 * RECORD;
    expect_header(data, at, MEMBER_HEADER, "member")?;
    let namestr_len = digits(&record(data, at, "member")?[74..78]).unwrap_or(140);
    if namestr_len != 140 && namestr_len != 136 {
        return Err(Error::malformed(at as u64 + 74, format!("namestr length {namestr_len}")));
    }
    at += RECORD;
    expect_header(data, at, DESCRIPTOR_HEADER, "descriptor")?;
    at += RECORD;
    let first = record(data, at, "member descriptor")?;
    let name = text(&first[8..16], at + 8)?;
    let created = timestamp(&first[64..80]);
    at += RECORD;
    let second = record(data, at, "member descriptor")?;
    let modified = timestamp(&second[0..16]);
    let label = text(&second[32..72], at + 32)?;
    at += RECORD;

    expect_header(data, at, NAMESTR_HEADER, "namestr")?;
    let count = digits(&record(data, at, "namestr")?[54..58])
        .ok_or_else(|| Error::malformed(at as u64 + 54, "bad variable count"))?;
    at += RECORD;
    debug!("transport member {name:?}: {count} variables");

    let mut variables = Vec::with_capacity(count);
    let mut columns = Vec::with_capacity(count);
    let mut row_length = 0;
    for index in 0..count {
        let start = at + index * namestr_len;
        let input = data.get(start..).unwrap_or_default();
        let (_, ns) = namestr(input).map_res(data, "namestr")?;
        let length = usize::try_from(ns.length)
            .ok()
            .filter(|&n| n > 0)
            .ok_or_else(|| Error::malformed(start as u64 + 4, "bad variable length"))?;
        let storage = classify::xport_storage(ns.ntype, length as u32)
            .ok_or_else(|| Error::malformed(start as u64, format!("unknown variable type {}", ns.ntype)))?;
        let numeric = storage == StorageType::Double;
        if numeric && !(2..=8).contains(&length) {
            return Err(Error::malformed(start as u64 + 4, format!("numeric length {length}")));
        }
        let mut var = Variable::new(index, text(ns.name, start + 8)?, storage);
        let label = text(ns.label, start + 16)?;
        var.label = (!label.is_empty()).then_some(label);
        let format = text(ns.format, start + 56)?;
        var.print_format = classify::sas_format(
            &format,
            ns.format_width.max(0) as u32,
            ns.format_decimals.max(0) as u32,
        );
        trace!("transport variable {} at {} width {length}", var.name, ns.position);
        columns.push(Column {
            offset: ns.position.max(0) as usize,
            width: length,
            numeric,
        });
        row_length = row_length.max(ns.position.max(0) as usize + length);
        variables.push(var);
    }
    at += (count * namestr_len).next_multiple_of(RECORD);

    expect_header(data, at, OBS_HEADER, "observation")?;
    let data_start = at + RECORD;
    let mut data_end = data.len();
    let mut scan = data_start;
    while scan + RECORD <= data.len() {
        if data[scan..].starts_with(MEMBER_HEADER) {
            data_end = scan;
            break;
        }
        scan += RECORD;
    }
    Ok(Member {
        variables,
        columns,
        row_length,
        data_start,
        data_end,
        name,
        label,
        created,
        modified,
    })
}

/// Rows in `section`, not counting the blank fill of the last record.
fn row_count(section: &[u8], row_length: usize) -> u64 {
    if row_length == 0 {
        return 0;
    }
    let mut n = section.len() / row_length;
    while n > 0 {
        let start = (n - 1) * row_length;
        let in_last_record = section.len() - start <= RECORD;
        if in_last_record && section[start..start + row_length].iter().all(|&b| b == b' ') {
            n -= 1;
        } else {
            break;
        }
    }
    n as u64
}

pub fn decode<H: Handler + ?Sized>(
    data: &[u8],
    options: &DecodeOptions,
    out: &mut Dispatcher<H>,
) -> Result<()> {
    let encoding = options.encoding.unwrap_or(WINDOWS_1252);
    let member = read_member(data, encoding)?;
    let section = &data[member.data_start..member.data_end];
    let declared = row_count(section, member.row_length);
    let window = options.window(declared);

    out.metadata(&FileMetadata {
        row_count: window.count(),
        var_count: member.variables.len(),
        encoding: encoding.name().to_owned(),
        format: FileFormat::Sas,
        kind: FileKind::Xport,
        version: 5,
        byteorder: ByteOrder::MSF,
        compressed: false,
        compression: Compression::None,
        created: member.created,
        modified: member.modified,
        file_label: (!member.label.is_empty()).then_some(member.label.clone()),
        table_name: (!member.name.is_empty()).then_some(member.name.clone()),
    })?;
    for var in &member.variables {
        out.variable(var)?;
    }
    out.finalize_variables(member.data_start as u64)?;

    let first = window.end() - window.count();
    for row in 0..window.count() {
        let start = (first + row) as usize * member.row_length;
        let bytes = &section[start..start + member.row_length];
        for (var_index, column) in member.columns.iter().enumerate() {
            let cell = &bytes[column.offset..column.offset + column.width];
            let value = if column.numeric {
                ibm_value(cell)
            } else {
                let offset = offset_in(data, cell);
                Value::Text(decode_text(trim_padding(cell), encoding, offset)?)
            };
            out.value(var_index, row, value)?;
        }
    }
    out.finalize_values(member.data_end as u64)
}
