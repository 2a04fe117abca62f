//! Stata `.dta` decoder.
//!
//! Releases 104 to 115 start with a fixed binary header and keep the value
//! label tables after the data. Releases 117 to 119 wrap every section in
//! `<tag>`s and list section offsets in a map, with strLs in their own GSO
//! section. Both layouts are read into a [File] of slices borrowing from the
//! source before any event is delivered.

use std::collections::{HashMap, HashSet};

use chrono::NaiveDateTime;
use encoding_rs::Encoding;
use indexmap::IndexSet;
use log::{debug, trace, warn};
use nom::{bytes::complete::tag as nom_tag, multi::count};

use super::{values, Release, RELEASES};
use crate::binary::{self, PResult};
use crate::charset::{decode_text, until_nul};
use crate::classify;
use crate::error::{offset_in, DownstreamError, Error, Result};
use crate::handler::{Dispatcher, Handler};
use crate::model::{
    ByteOrder, Compression, FileFormat, FileKind, FileMetadata, LabelSetId, StorageType, Value,
    Variable,
};
use crate::options::DecodeOptions;

/// GSO type of a NUL-terminated string; 129 is binary.
const GSO_STRING: u8 = 130;

struct File<'a> {
    release: Release,
    order: ByteOrder,
    nobs: u64,
    label: &'a [u8],
    timestamp: &'a [u8],
    types: Vec<StorageType>,
    names: Vec<&'a [u8]>,
    formats: Vec<&'a [u8]>,
    label_names: Vec<&'a [u8]>,
    variable_labels: Vec<&'a [u8]>,
    /// Exactly `nobs` rows.
    rows: &'a [u8],
    strls: &'a [u8],
    value_labels: &'a [u8],
}

struct LabelTable<'a> {
    name: &'a [u8],
    entries: Vec<(Value, &'a [u8])>,
}

fn tag<'a>(base: &[u8], input: &'a [u8], name: &str) -> Result<&'a [u8]> {
    let parsed: PResult<&[u8]> = nom_tag(name.as_bytes())(input);
    Ok(parsed.map_res(base, name)?.0)
}

fn row_size(types: &[StorageType]) -> usize {
    types.iter().map(|t| t.width().unwrap_or(8)).sum()
}

/// The first `nobs` rows of `input`.
fn take_rows<'a>(base: &[u8], input: &'a [u8], nobs: u64, row_size: usize) -> Result<&'a [u8]> {
    let len = usize::try_from(nobs)
        .ok()
        .and_then(|n| n.checked_mul(row_size))
        .filter(|&len| len <= input.len())
        .ok_or_else(|| {
            Error::malformed(
                offset_in(base, input) + input.len() as u64,
                format!("{nobs} observations of {row_size} bytes declared but data is shorter"),
            )
        })?;
    Ok(&input[..len])
}

fn check_release(release: u32) -> Result<Release> {
    if RELEASES.contains(&release) {
        Ok(Release(release))
    } else {
        Err(Error::unsupported(format!("Stata release {release}")))
    }
}

fn read_binary(data: &[u8]) -> Result<File<'_>> {
    let (input, release) = binary::u8(data).map_res(data, "release")?;
    let release = check_release(release as u32)?;
    let (input, byteorder) = binary::u8(input).map_res(data, "byte order")?;
    let order = match byteorder {
        1 => ByteOrder::MSF,
        2 => ByteOrder::LSF,
        other => return Err(Error::malformed(1, format!("byte order code {other}"))),
    };
    let (input, _filetype) = binary::u8(input).map_res(data, "file type")?;
    let (input, _unused) = binary::u8(input).map_res(data, "header")?;
    let (input, nvar) = binary::u16(order)(input).map_res(data, "variable count")?;
    let nvar = nvar as usize;
    let (input, nobs) = binary::u32(order)(input).map_res(data, "observation count")?;
    let (input, label) = binary::bytes(release.data_label_len())(input).map_res(data, "data label")?;
    let (input, timestamp) =
        binary::bytes(release.timestamp_len())(input).map_res(data, "timestamp")?;

    let (input, codes) = count(binary::bytes(1), nvar)(input).map_res(data, "type list")?;
    let types = codes
        .iter()
        .map(|code| {
            classify::stata_storage_old(code[0], release.0).ok_or_else(|| {
                Error::malformed(offset_in(data, code), format!("unknown type code {}", code[0]))
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let (input, names) = count(binary::bytes(release.name_len()), nvar)(input).map_res(data, "variable names")?;
    let (input, _sortlist) = binary::bytes(2 * (nvar + 1))(input).map_res(data, "sort list")?;
    let (input, formats) = count(binary::bytes(release.format_len()), nvar)(input).map_res(data, "formats")?;
    let (input, label_names) =
        count(binary::bytes(release.name_len()), nvar)(input).map_res(data, "value label names")?;
    let (mut input, variable_labels) =
        count(binary::bytes(release.variable_label_len()), nvar)(input).map_res(data, "variable labels")?;

    if release.0 >= 105 {
        loop {
            let (rest, kind) = binary::u8(input).map_res(data, "expansion field")?;
            let (rest, len) = if release.expansion_len_size() == 2 {
                let (rest, len) = binary::u16(order)(rest).map_res(data, "expansion field")?;
                (rest, len as usize)
            } else {
                let (rest, len) = binary::u32(order)(rest).map_res(data, "expansion field")?;
                (rest, len as usize)
            };
            if kind == 0 && len == 0 {
                input = rest;
                break;
            }
            trace!("skipping expansion field of type {kind}, {len} bytes");
            (input, _) = binary::bytes(len)(rest).map_res(data, "expansion field")?;
        }
    }

    let rows = take_rows(data, input, nobs as u64, row_size(&types))?;
    Ok(File {
        release,
        order,
        nobs: nobs as u64,
        label,
        timestamp,
        types,
        names,
        formats,
        label_names,
        variable_labels,
        rows,
        strls: &[],
        value_labels: &input[rows.len()..],
    })
}

/// Body of the section between map offsets `start` and `end`, without its
/// enclosing tags.
fn section<'a>(data: &'a [u8], start: u64, end: u64, name: &str) -> Result<&'a [u8]> {
    let range = usize::try_from(start)
        .ok()
        .zip(usize::try_from(end).ok())
        .filter(|(s, e)| s <= e && *e <= data.len())
        .ok_or_else(|| Error::malformed(start, format!("map points {name} outside the file")))?;
    let body = tag(data, &data[range.0..range.1], &format!("<{name}>"))?;
    let close = format!("</{name}>");
    body.strip_suffix(close.as_bytes())
        .ok_or_else(|| Error::malformed(end.saturating_sub(close.len() as u64), format!("expected {close}")))
}

fn read_tagged(data: &[u8]) -> Result<File<'_>> {
    let input = tag(data, data, "<stata_dta>")?;
    let input = tag(data, input, "<header>")?;
    let input = tag(data, input, "<release>")?;
    let (input, digits) = binary::bytes(3)(input).map_res(data, "release")?;
    let release = std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .ok_or_else(|| Error::malformed(offset_in(data, digits), "release is not a number"))?;
    let release = check_release(release)?;
    let input = tag(data, input, "</release>")?;

    let input = tag(data, input, "<byteorder>")?;
    let (input, byteorder) = binary::bytes(3)(input).map_res(data, "byte order")?;
    let order = match byteorder {
        b"LSF" => ByteOrder::LSF,
        b"MSF" => ByteOrder::MSF,
        _ => return Err(Error::malformed(offset_in(data, byteorder), "byte order is neither LSF nor MSF")),
    };
    let input = tag(data, input, "</byteorder>")?;

    let input = tag(data, input, "<K>")?;
    let (input, nvar) = if release.0 >= 119 {
        let (input, k) = binary::u32(order)(input).map_res(data, "variable count")?;
        (input, k as usize)
    } else {
        let (input, k) = binary::u16(order)(input).map_res(data, "variable count")?;
        (input, k as usize)
    };
    let input = tag(data, input, "</K>")?;

    let input = tag(data, input, "<N>")?;
    let (input, nobs) = if release.0 == 117 {
        let (input, n) = binary::u32(order)(input).map_res(data, "observation count")?;
        (input, n as u64)
    } else {
        binary::u64(order)(input).map_res(data, "observation count")?
    };
    let input = tag(data, input, "</N>")?;

    let input = tag(data, input, "<label>")?;
    let (input, label_len) = if release.0 == 117 {
        let (input, n) = binary::u8(input).map_res(data, "data label length")?;
        (input, n as usize)
    } else {
        let (input, n) = binary::u16(order)(input).map_res(data, "data label length")?;
        (input, n as usize)
    };
    let (input, label) = binary::bytes(label_len)(input).map_res(data, "data label")?;
    let input = tag(data, input, "</label>")?;

    let input = tag(data, input, "<timestamp>")?;
    let (input, ts_len) = binary::u8(input).map_res(data, "timestamp length")?;
    let (input, timestamp) = binary::bytes(ts_len as usize)(input).map_res(data, "timestamp")?;
    let input = tag(data, input, "</timestamp>")?;
    let input = tag(data, input, "</header>")?;

    let input = tag(data, input, "<map>")?;
    let (input, map) = count(binary::u64(order), 14)(input).map_res(data, "map")?;
    let input = tag(data, input, "</map>")?;

    let input = tag(data, input, "<variable_types>")?;
    let (input, codes) = count(binary::bytes(2), nvar)(input).map_res(data, "variable types")?;
    let types = codes
        .iter()
        .map(|code| {
            let value = binary::u16_at(order, code, 0).unwrap_or_default();
            classify::stata_storage_new(value).ok_or_else(|| {
                Error::malformed(offset_in(data, code), format!("unknown type code {value}"))
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let input = tag(data, input, "</variable_types>")?;

    let input = tag(data, input, "<varnames>")?;
    let (input, names) = count(binary::bytes(release.name_len()), nvar)(input).map_res(data, "variable names")?;
    let input = tag(data, input, "</varnames>")?;

    let input = tag(data, input, "<sortlist>")?;
    let sort_width = if release.0 >= 119 { 4 } else { 2 };
    let (input, _sortlist) = binary::bytes(sort_width * (nvar + 1))(input).map_res(data, "sort list")?;
    let input = tag(data, input, "</sortlist>")?;

    let input = tag(data, input, "<formats>")?;
    let (input, formats) = count(binary::bytes(release.format_len()), nvar)(input).map_res(data, "formats")?;
    let input = tag(data, input, "</formats>")?;

    let input = tag(data, input, "<value_label_names>")?;
    let (input, label_names) =
        count(binary::bytes(release.name_len()), nvar)(input).map_res(data, "value label names")?;
    let input = tag(data, input, "</value_label_names>")?;

    let input = tag(data, input, "<variable_labels>")?;
    let (input, variable_labels) =
        count(binary::bytes(release.variable_label_len()), nvar)(input).map_res(data, "variable labels")?;
    tag(data, input, "</variable_labels>")?;

    let body = section(data, map[9], map[10], "data")?;
    let rows = take_rows(data, body, nobs, row_size(&types))?;
    Ok(File {
        release,
        order,
        nobs,
        label,
        timestamp,
        types,
        names,
        formats,
        label_names,
        variable_labels,
        rows,
        strls: section(data, map[10], map[11], "strls")?,
        value_labels: section(data, map[11], map[12], "value_labels")?,
    })
}

/// The body of one value-label table: counts, text offsets, values, text.
fn label_entries<'a>(
    data: &[u8],
    table: &'a [u8],
    release: Release,
    order: ByteOrder,
) -> Result<Vec<(Value, &'a [u8])>> {
    let (input, n) = binary::u32(order)(table).map_res(data, "label count")?;
    let (input, txt_len) = binary::u32(order)(input).map_res(data, "label text length")?;
    let (input, offsets) = count(binary::u32(order), n as usize)(input).map_res(data, "label offsets")?;
    let (input, raw_values) = count(binary::i32(order), n as usize)(input).map_res(data, "label values")?;
    let (_, text) = binary::bytes(txt_len as usize)(input).map_res(data, "label text")?;
    offsets
        .iter()
        .zip(raw_values)
        .map(|(&off, raw)| {
            let label = text.get(off as usize..).ok_or_else(|| {
                Error::malformed(offset_in(data, text), format!("label text offset {off} out of range"))
            })?;
            let value = if release.has_extended_missing() {
                values::long(raw, release)
            } else {
                Value::Int32(raw)
            };
            Ok((value, until_nul(label)))
        })
        .collect()
}

fn read_label_tables<'a>(data: &[u8], file: &File<'a>) -> Result<Vec<LabelTable<'a>>> {
    let (release, order) = (file.release, file.order);
    let mut input = file.value_labels;
    let mut tables = Vec::new();
    while !input.is_empty() {
        if release.has_old_value_labels() {
            let (rest, n) = binary::u16(order)(input).map_res(data, "label count")?;
            let (rest, name) = binary::bytes(9)(rest).map_res(data, "label table name")?;
            let (rest, _pad) = binary::u8(rest).map_res(data, "label table")?;
            let (rest, raw_values) = count(binary::i16(order), n as usize)(rest).map_res(data, "label values")?;
            let (rest, texts) = count(binary::bytes(8), n as usize)(rest).map_res(data, "label text")?;
            let entries = raw_values
                .into_iter()
                .zip(texts)
                .map(|(v, text)| (Value::Int16(v), until_nul(text)))
                .collect();
            tables.push(LabelTable { name, entries });
            input = rest;
            continue;
        }
        let rest = if release.is_tagged() {
            tag(data, input, "<lbl>")?
        } else {
            input
        };
        let (rest, len) = binary::u32(order)(rest).map_res(data, "label table length")?;
        let (rest, name) = binary::bytes(release.name_len())(rest).map_res(data, "label table name")?;
        let (rest, _pad) = binary::bytes(3)(rest).map_res(data, "label table")?;
        let (rest, table) = binary::bytes(len as usize)(rest).map_res(data, "label table")?;
        let entries = label_entries(data, table, release, order)?;
        tables.push(LabelTable { name, entries });
        input = if release.is_tagged() {
            tag(data, rest, "</lbl>")?
        } else {
            rest
        };
    }
    Ok(tables)
}

/// GSO entries by `(variable, observation)`, with their type byte.
fn read_strls<'a>(data: &[u8], file: &File<'a>) -> Result<HashMap<(u32, u64), (u8, &'a [u8])>> {
    let order = file.order;
    let mut input = file.strls;
    let mut strls = HashMap::new();
    while !input.is_empty() {
        let rest = tag(data, input, "GSO")?;
        let (rest, v) = binary::u32(order)(rest).map_res(data, "strL variable")?;
        let (rest, o) = if file.release.0 == 117 {
            let (rest, o) = binary::u32(order)(rest).map_res(data, "strL observation")?;
            (rest, o as u64)
        } else {
            binary::u64(order)(rest).map_res(data, "strL observation")?
        };
        let (rest, kind) = binary::u8(rest).map_res(data, "strL type")?;
        let (rest, len) = binary::u32(order)(rest).map_res(data, "strL length")?;
        let (rest, body) = binary::bytes(len as usize)(rest).map_res(data, "strL")?;
        strls.insert((v, o), (kind, body));
        input = rest;
    }
    debug!("{} strLs", strls.len());
    Ok(strls)
}

fn timestamp(bytes: &[u8]) -> Option<NaiveDateTime> {
    let text = std::str::from_utf8(until_nul(bytes)).ok()?;
    NaiveDateTime::parse_from_str(text.trim(), "%d %b %Y %H:%M").ok()
}

/// Width of a display format such as `%-12s` or `%9.2f`.
fn format_width(format: &str) -> Option<u32> {
    let digits: String = format
        .trim_start_matches('%')
        .trim_start_matches(['-', '~'])
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

fn text(data: &[u8], bytes: &[u8], encoding: &'static Encoding) -> Result<String> {
    decode_text(until_nul(bytes), encoding, offset_in(data, bytes))
}

pub fn decode<H: Handler + ?Sized>(
    data: &[u8],
    options: &DecodeOptions,
    out: &mut Dispatcher<H>,
) -> Result<()> {
    let file = if data.starts_with(b"<stata_dta>") {
        read_tagged(data)?
    } else {
        read_binary(data)?
    };
    let (release, order) = (file.release, file.order);
    let encoding = options.encoding.unwrap_or_else(|| release.encoding());
    debug!(
        "Stata release {} {order:?}: {} variables, {} observations, text as {}",
        release.0,
        file.types.len(),
        file.nobs,
        encoding.name()
    );

    let tables = read_label_tables(data, &file)?;
    let strls = read_strls(data, &file)?;

    let present: HashSet<&[u8]> = tables.iter().map(|t| until_nul(t.name)).collect();
    let mut label_sets: IndexSet<&[u8]> = IndexSet::new();
    let mut variables = Vec::with_capacity(file.types.len());
    for (index, &storage) in file.types.iter().enumerate() {
        let mut var = Variable::new(index, text(data, file.names[index], encoding)?, storage);
        let label = text(data, file.variable_labels[index], encoding)?;
        var.label = (!label.is_empty()).then_some(label);
        let format = text(data, file.formats[index], encoding)?;
        var.alignment = classify::stata_alignment(&format);
        var.display_width = format_width(&format);
        var.print_format = (!format.is_empty()).then_some(format);
        let set_name = until_nul(file.label_names[index]);
        if !set_name.is_empty() {
            if present.contains(set_name) {
                let (id, _) = label_sets.insert_full(set_name);
                var.label_set = Some(LabelSetId(id as u32));
            } else {
                debug!(
                    "variable {} names missing label table {}",
                    var.name,
                    String::from_utf8_lossy(set_name)
                );
            }
        }
        variables.push(var);
    }

    let window = options.window(file.nobs);
    let label = text(data, file.label, encoding)?;
    out.metadata(&FileMetadata {
        row_count: window.count(),
        var_count: variables.len(),
        encoding: encoding.name().to_owned(),
        format: FileFormat::Stata,
        kind: FileKind::Dta,
        version: release.0,
        byteorder: order,
        compressed: false,
        compression: Compression::None,
        created: timestamp(file.timestamp),
        modified: None,
        file_label: (!label.is_empty()).then_some(label),
        table_name: None,
    })?;

    for table in &tables {
        let name = until_nul(table.name);
        let Some(id) = label_sets.get_index_of(name) else {
            warn!(
                "dropping value label table {} that no variable uses",
                String::from_utf8_lossy(name)
            );
            continue;
        };
        for (value, label) in &table.entries {
            let label = decode_text(label, encoding, offset_in(data, label))?;
            out.value_label(LabelSetId(id as u32), value, &label)?;
        }
    }
    for var in &variables {
        out.variable(var)?;
    }
    let rows_start = offset_in(data, file.rows);
    out.finalize_variables(rows_start)?;

    let row_size = row_size(&file.types);
    let first = window.end() - window.count();
    for row in 0..window.count() {
        let start = (first + row) as usize * row_size;
        let mut at = start;
        for (var_index, &storage) in file.types.iter().enumerate() {
            let width = storage.width().unwrap_or(8);
            let cell = &file.rows[at..at + width];
            at += width;
            let value = match storage {
                StorageType::Text(_) => Value::Text(text(data, cell, encoding)?),
                StorageType::LongText => {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(cell);
                    strl(data, cell, values::strl_ref(raw, release, order), &strls, encoding)?
                }
                numeric => values::numeric(numeric, release, order, cell).unwrap_or(Value::SystemMissing),
            };
            out.value(var_index, row, value)?;
        }
    }
    out.finalize_values(rows_start + file.rows.len() as u64)
}

fn strl(
    data: &[u8],
    cell: &[u8],
    key: (u32, u64),
    strls: &HashMap<(u32, u64), (u8, &[u8])>,
    encoding: &'static Encoding,
) -> Result<Value> {
    if key == (0, 0) {
        return Ok(Value::Text(String::new()));
    }
    let &(kind, body) = strls.get(&key).ok_or_else(|| {
        Error::malformed(offset_in(data, cell), format!("strL ({}, {}) is not in the table", key.0, key.1))
    })?;
    let s = if kind == GSO_STRING {
        decode_text(until_nul(body), encoding, offset_in(data, body))?
    } else {
        String::from_utf8_lossy(body).into_owned()
    };
    Ok(Value::Text(s))
}
