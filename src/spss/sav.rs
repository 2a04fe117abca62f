//! SPSS system file decoder.
//!
//! The dictionary is read in one pass into raw records that borrow from the
//! source, the character encoding is settled from the extension records, and
//! only then is any text decoded. Values are streamed row-major.

use std::collections::HashMap;

use chrono::NaiveDateTime;
use encoding_rs::{Encoding, WINDOWS_1252};
use log::{debug, trace, warn};
use nom::{
    error::{Error as NomError, ErrorKind},
    multi::count,
};

use super::SYSMIS;
use crate::binary::{self, PResult};
use crate::charset::{self, decode_text, trim_padding};
use crate::classify;
use crate::compress::{inflate_into, Bytecode, ChunkReader, DecompressError, SliceChunks};
use crate::error::{offset_in, DownstreamError, Error, Result};
use crate::handler::{Dispatcher, Handler};
use crate::model::{
    ByteOrder, Compression, FileFormat, FileKind, FileMetadata, LabelSetId, MissingValues, Value,
    Variable,
};
use crate::options::DecodeOptions;

const HEADER_LEN: usize = 176;

struct Header {
    order: ByteOrder,
    nominal_case_size: i32,
    compression: Compression,
    n_cases: i32,
    bias: f64,
    creation_date: [u8; 9],
    creation_time: [u8; 8],
    file_label: [u8; 64],
}

fn parse_header(data: &[u8], kind: FileKind) -> Result<Header> {
    if data.len() < HEADER_LEN {
        return Err(Error::malformed(data.len() as u64, "file header is truncated"));
    }
    let layout = [data[64], data[65], data[66], data[67]];
    let order = if matches!(u32::from_le_bytes(layout), 2 | 3) {
        ByteOrder::LSF
    } else if matches!(u32::from_be_bytes(layout), 2 | 3) {
        ByteOrder::MSF
    } else {
        return Err(Error::malformed(64, "unrecognized layout code"));
    };
    let i32p = binary::i32(order);
    let input = &data[68..];
    let (input, nominal_case_size) = i32p(input).map_res(data, "nominal case size")?;
    let (input, compression_code) = i32p(input).map_res(data, "compression code")?;
    let (input, _weight_index) = i32p(input).map_res(data, "weight index")?;
    let (input, n_cases) = i32p(input).map_res(data, "case count")?;
    let (input, bias) = binary::f64(order)(input).map_res(data, "compression bias")?;
    let (input, creation_date) = binary::array::<9>(input).map_res(data, "creation date")?;
    let (input, creation_time) = binary::array::<8>(input).map_res(data, "creation time")?;
    let (_, file_label) = binary::array::<64>(input).map_res(data, "file label")?;

    let compression = match (kind, compression_code) {
        (FileKind::Zsav, 2) => Compression::Zlib,
        (FileKind::Sav, 0) => Compression::None,
        (FileKind::Sav, 1) => Compression::Bytecode,
        (_, code) => {
            return Err(Error::unsupported(format!(
                "system file compression code {code}"
            )))
        }
    };
    debug!(
        "system file: {order:?}, {nominal_case_size} slots, {compression:?}, {n_cases} cases, bias {bias}"
    );
    Ok(Header {
        order,
        nominal_case_size,
        compression,
        n_cases,
        bias,
        creation_date,
        creation_time,
        file_label,
    })
}

struct RawVariable<'a> {
    offset: u64,
    width: i32,
    name: &'a [u8],
    label: Option<&'a [u8]>,
    missing_code: i32,
    missing: Vec<[u8; 8]>,
    print: i32,
}

struct RawLabels<'a> {
    offset: u64,
    labels: Vec<([u8; 8], &'a [u8])>,
    /// 1-based slot indexes of the variables the labels apply to.
    slots: Vec<i32>,
}

struct Extension<'a> {
    offset: u64,
    subtype: i32,
    count: u32,
    data: &'a [u8],
}

#[derive(Default)]
struct Records<'a> {
    variables: Vec<RawVariable<'a>>,
    labels: Vec<RawLabels<'a>>,
    extensions: Vec<Extension<'a>>,
    /// Offset of the dictionary termination record.
    end_offset: u64,
    data_start: usize,
}

impl<'a> Records<'a> {
    fn extension(&self, subtype: i32) -> Option<&Extension<'a>> {
        self.extensions.iter().find(|e| e.subtype == subtype)
    }
}

fn padding(len: usize, align: usize) -> usize {
    (align - len % align) % align
}

fn fail<O>(input: &[u8]) -> PResult<O> {
    Err(nom::Err::Failure(NomError::new(input, ErrorKind::Verify)))
}

fn variable_record(input: &[u8], order: ByteOrder, offset: u64) -> PResult<RawVariable<'_>> {
    let i32p = binary::i32(order);
    let (input, width) = i32p(input)?;
    let (input, has_label) = i32p(input)?;
    let (input, missing_code) = i32p(input)?;
    let (input, print) = i32p(input)?;
    let (input, _write) = i32p(input)?;
    let (input, name) = binary::bytes(8)(input)?;
    let (input, label) = if has_label == 1 {
        let (input, len) = binary::u32(order)(input)?;
        let len = len as usize;
        let (input, label) = binary::bytes(len)(input)?;
        let (input, _) = binary::bytes(padding(len, 4))(input)?;
        (input, Some(label))
    } else {
        (input, None)
    };
    let n_missing = match missing_code {
        0..=3 => missing_code as usize,
        -2 => 2,
        -3 => 3,
        _ => return fail(input),
    };
    let (input, missing) = count(binary::array::<8>, n_missing)(input)?;
    Ok((
        input,
        RawVariable {
            offset,
            width,
            name,
            label,
            missing_code,
            missing,
            print,
        },
    ))
}

fn value_label_record(input: &[u8], order: ByteOrder) -> PResult<Vec<([u8; 8], &[u8])>> {
    let (mut input, n) = binary::u32(order)(input)?;
    let mut labels = Vec::with_capacity(n.min(1024) as usize);
    for _ in 0..n {
        let (rest, value) = binary::array::<8>(input)?;
        let (rest, len) = binary::u8(rest)?;
        let (rest, label) = binary::bytes(len as usize)(rest)?;
        let (rest, _) = binary::bytes(padding(len as usize + 1, 8))(rest)?;
        labels.push((value, label));
        input = rest;
    }
    Ok((input, labels))
}

fn index_record(input: &[u8], order: ByteOrder) -> PResult<Vec<i32>> {
    let (input, n) = binary::u32(order)(input)?;
    count(binary::i32(order), n as usize)(input)
}

fn extension_record(input: &[u8], order: ByteOrder, offset: u64) -> PResult<Extension<'_>> {
    let (input, subtype) = binary::i32(order)(input)?;
    let (input, size) = binary::u32(order)(input)?;
    let (input, n) = binary::u32(order)(input)?;
    let Some(len) = (size as usize).checked_mul(n as usize) else {
        return fail(input);
    };
    let (input, data) = binary::bytes(len)(input)?;
    Ok((
        input,
        Extension {
            offset,
            subtype,
            count: n,
            data,
        },
    ))
}

fn read_records(data: &[u8], order: ByteOrder) -> Result<Records<'_>> {
    let i32p = binary::i32(order);
    let mut input = &data[HEADER_LEN..];
    let mut records = Records::default();
    loop {
        let offset = offset_in(data, input);
        let (rest, rec_type) = i32p(input).map_res(data, "record type")?;
        input = match rec_type {
            2 => {
                let (rest, var) = variable_record(rest, order, offset).map_res(data, "variable record")?;
                trace!("variable record at {offset:#x}, width {}", var.width);
                records.variables.push(var);
                rest
            }
            3 => {
                let (rest, labels) = value_label_record(rest, order).map_res(data, "value label record")?;
                let index_offset = offset_in(data, rest);
                let (rest, next) = i32p(rest).map_res(data, "record type")?;
                if next != 4 {
                    return Err(Error::malformed(
                        index_offset,
                        "value labels not followed by a variable index record",
                    ));
                }
                let (rest, slots) = index_record(rest, order).map_res(data, "variable index record")?;
                records.labels.push(RawLabels {
                    offset: index_offset,
                    labels,
                    slots,
                });
                rest
            }
            4 => {
                return Err(Error::malformed(
                    offset,
                    "variable index record without value labels",
                ))
            }
            6 => {
                let (rest, n_lines) = binary::u32(order)(rest).map_res(data, "document record")?;
                let len = (n_lines as usize).saturating_mul(80);
                let (rest, _) = binary::bytes(len)(rest).map_res(data, "document record")?;
                rest
            }
            7 => {
                let (rest, ext) = extension_record(rest, order, offset).map_res(data, "extension record")?;
                trace!("extension record {} at {offset:#x}", ext.subtype);
                records.extensions.push(ext);
                rest
            }
            999 => {
                let (rest, _) = i32p(rest).map_res(data, "dictionary termination record")?;
                records.end_offset = offset;
                records.data_start = offset_in(data, rest) as usize;
                return Ok(records);
            }
            other => {
                return Err(Error::malformed(offset, format!("unknown record type {other}")))
            }
        };
    }
}

/// A variable record that starts a variable, as opposed to a string
/// continuation.
struct DictVar {
    record: usize,
    slot: usize,
    slots: usize,
    continuations: usize,
}

/// Lays the variable records out over the 8-byte slots of a case.
fn layout(records: &Records) -> Result<(Vec<DictVar>, usize)> {
    let mut dict: Vec<DictVar> = Vec::new();
    let mut n_slots = 0;
    for (i, raw) in records.variables.iter().enumerate() {
        match raw.width {
            -1 => match dict.last_mut() {
                Some(var) if var.continuations > 0 => {
                    var.continuations -= 1;
                    var.slots += 1;
                    n_slots += 1;
                }
                _ => {
                    return Err(Error::malformed(
                        raw.offset,
                        "string continuation record without a string variable",
                    ))
                }
            },
            0..=255 => {
                if let Some(prev) = dict.last() {
                    if prev.continuations > 0 {
                        return Err(Error::malformed(
                            raw.offset,
                            "string variable is missing continuation records",
                        ));
                    }
                }
                let width = raw.width as usize;
                dict.push(DictVar {
                    record: i,
                    slot: n_slots,
                    slots: 1,
                    continuations: width.div_ceil(8).saturating_sub(1),
                });
                n_slots += 1;
            }
            w => return Err(Error::malformed(raw.offset, format!("invalid variable width {w}"))),
        }
    }
    if dict.last().is_some_and(|v| v.continuations > 0) {
        return Err(Error::malformed(
            records.end_offset,
            "string variable is missing continuation records",
        ));
    }
    Ok((dict, n_slots))
}

fn choose_encoding(
    records: &Records,
    order: ByteOrder,
    options: &DecodeOptions,
) -> Result<&'static Encoding> {
    if let Some(encoding) = options.encoding {
        return Ok(encoding);
    }
    if let Some(ext) = records.extension(20) {
        let name = String::from_utf8_lossy(ext.data);
        return charset::by_label(&name)
            .ok_or_else(|| Error::unsupported(format!("character encoding {name:?}")));
    }
    // Character code is the last of the eight integer info fields.
    let code = records
        .extension(3)
        .and_then(|ext| binary::u32_at(order, ext.data, 28))
        .map(|code| code as i32);
    if let Some(code) = code {
        match charset::spss_codepage(code) {
            Some(encoding) => return Ok(encoding),
            None => warn!("unknown character code {code}, assuming windows-1252"),
        }
    }
    Ok(WINDOWS_1252)
}

/// How a variable's bytes are gathered from the slots of a case.
struct Segment {
    slot: usize,
    bytes: usize,
}

struct Column {
    dict: usize,
    width: usize,
    segments: Vec<Segment>,
}

/// Parses `KEY=VALUE` pairs separated by any of `separators`.
fn key_values<'s>(text: &'s str, separators: &'s [char]) -> impl Iterator<Item = (&'s str, &'s str)> {
    text.split(separators)
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim(), v.trim_end_matches('\0')))
}

struct Dictionary {
    columns: Vec<Column>,
    variables: Vec<Variable>,
    label_sets: Vec<(LabelSetId, Vec<(Value, String)>)>,
    sysmis: f64,
    n_cases_64: Option<i64>,
    n_slots: usize,
}

fn build_dictionary(
    records: &Records,
    order: ByteOrder,
    encoding: &'static Encoding,
) -> Result<Dictionary> {
    let (dict, n_slots) = layout(records)?;
    let decode = |bytes: &[u8], offset: u64| decode_text(trim_padding(bytes), encoding, offset);

    let mut short_names = Vec::with_capacity(dict.len());
    for var in &dict {
        let raw = &records.variables[var.record];
        short_names.push(decode(raw.name, raw.offset)?.to_uppercase());
    }

    let mut long_names = HashMap::new();
    if let Some(ext) = records.extension(13) {
        let text = decode_text(ext.data, encoding, ext.offset)?;
        for (short, long) in key_values(&text, &['\t']) {
            long_names.insert(short.to_uppercase(), long.to_owned());
        }
    }

    let mut very_long = HashMap::new();
    if let Some(ext) = records.extension(14) {
        let text = decode_text(ext.data, encoding, ext.offset)?;
        for (short, width) in key_values(&text, &['\t', '\0']) {
            match width.trim().parse::<usize>() {
                Ok(w) => {
                    very_long.insert(short.to_uppercase(), w);
                }
                Err(_) => {
                    return Err(Error::malformed(
                        ext.offset,
                        format!("bad very long string width {width:?}"),
                    ))
                }
            }
        }
    }

    // Merge very long string segments into single columns.
    let mut columns = Vec::new();
    let mut dict_to_column = vec![None; dict.len()];
    let mut i = 0;
    while i < dict.len() {
        let raw = &records.variables[dict[i].record];
        let width = raw.width as usize;
        let (width, n_segments) = match very_long.get(&short_names[i]) {
            Some(&w) if w > 255 => (w, w.div_ceil(252)),
            _ => (width, 1),
        };
        if i + n_segments > dict.len() {
            return Err(Error::malformed(
                raw.offset,
                "very long string variable is missing segments",
            ));
        }
        let mut segments = Vec::with_capacity(n_segments);
        if width == 0 {
            segments.push(Segment {
                slot: dict[i].slot,
                bytes: 8,
            });
        } else {
            let mut remaining = width;
            for seg in &dict[i..i + n_segments] {
                let seg_width = records.variables[seg.record].width as usize;
                if seg_width == 0 {
                    return Err(Error::malformed(
                        records.variables[seg.record].offset,
                        "numeric variable inside a very long string",
                    ));
                }
                let bytes = remaining.min(seg_width);
                segments.push(Segment {
                    slot: seg.slot,
                    bytes,
                });
                remaining -= bytes;
            }
        }
        dict_to_column[i] = Some(columns.len());
        columns.push(Column {
            dict: i,
            width,
            segments,
        });
        i += n_segments;
    }

    let mut variables = Vec::with_capacity(columns.len());
    for (index, column) in columns.iter().enumerate() {
        let raw = &records.variables[dict[column.dict].record];
        let short = &short_names[column.dict];
        let name = long_names.get(short).cloned().unwrap_or_else(|| short.clone());
        let storage = i32::try_from(column.width)
            .ok()
            .and_then(classify::spss_storage)
            .ok_or_else(|| Error::malformed(raw.offset, "invalid variable width"))?;
        let mut var = Variable::new(index, name, storage);
        var.label = match raw.label {
            Some(label) => Some(decode_text(label, encoding, raw.offset)?),
            None => None,
        };
        var.print_format = classify::spss_packed_format(raw.print);
        var.missing = missing_values(raw, order, encoding, column.width == 0)?;
        variables.push(var);
    }

    if let Some(ext) = records.extension(11) {
        apply_display(ext, order, &dict_to_column, &mut variables);
    }

    let sysmis = match records.extension(4) {
        Some(ext) => binary::f64(order)(ext.data).map(|(_, x)| x).unwrap_or(SYSMIS),
        None => SYSMIS,
    };
    let n_cases_64 = records
        .extension(16)
        .and_then(|ext| binary::i64(order)(ext.data.get(8..)?).ok())
        .map(|(_, n)| n);

    // Slot number to column, for the index records that follow value labels.
    let mut slot_to_column = vec![None; n_slots];
    for (d, var) in dict.iter().enumerate() {
        slot_to_column[var.slot] = dict_to_column[d];
    }

    let mut label_sets = Vec::new();
    for raw in &records.labels {
        let mut targets = Vec::with_capacity(raw.slots.len());
        for &slot in &raw.slots {
            let column = usize::try_from(slot)
                .ok()
                .and_then(|s| s.checked_sub(1))
                .and_then(|s| slot_to_column.get(s).copied().flatten())
                .ok_or_else(|| {
                    Error::malformed(raw.offset, format!("value labels refer to invalid variable index {slot}"))
                })?;
            if !targets.contains(&column) {
                targets.push(column);
            }
        }
        let Some(&first) = targets.first() else {
            warn!("value label record at {:#x} applies to no variables", raw.offset);
            continue;
        };
        let numeric = columns[first].width == 0;
        if targets.iter().any(|&c| (columns[c].width == 0) != numeric) {
            return Err(Error::malformed(
                raw.offset,
                "value labels apply to both numeric and string variables",
            ));
        }
        let id = LabelSetId(label_sets.len() as u32);
        let mut labels = Vec::with_capacity(raw.labels.len());
        for (value, label) in &raw.labels {
            let value = if numeric {
                Value::Double(binary::f64_from(order, *value))
            } else {
                Value::Text(decode(&value[..], raw.offset)?)
            };
            labels.push((value, decode_text(label, encoding, raw.offset)?));
        }
        for &c in &targets {
            attach(&mut variables[c], id);
        }
        label_sets.push((id, labels));
    }

    if let Some(ext) = records.extension(21) {
        long_string_labels(ext, order, encoding, &mut variables, &mut label_sets)?;
    }

    Ok(Dictionary {
        columns,
        variables,
        label_sets,
        sysmis,
        n_cases_64,
        n_slots,
    })
}

fn attach(var: &mut Variable, id: LabelSetId) {
    if let Some(old) = var.label_set.replace(id) {
        warn!("{} has value label sets {old} and {id}; using {id}", var.name);
    }
}

fn missing_values(
    raw: &RawVariable,
    order: ByteOrder,
    encoding: &'static Encoding,
    numeric: bool,
) -> Result<MissingValues> {
    let mut missing = MissingValues::default();
    let mut discrete = &raw.missing[..];
    if numeric && raw.missing_code < 0 {
        missing.range = Some((
            binary::f64_from(order, raw.missing[0]),
            binary::f64_from(order, raw.missing[1]),
        ));
        discrete = &raw.missing[2..];
    }
    for value in discrete {
        missing.values.push(if numeric {
            Value::Double(binary::f64_from(order, *value))
        } else {
            Value::Text(decode_text(trim_padding(value), encoding, raw.offset)?)
        });
    }
    Ok(missing)
}

/// Variable display parameters: measure, optionally width, and alignment per
/// variable. Writers differ on whether very long string segments get their
/// own entries, so both layouts are accepted.
fn apply_display(
    ext: &Extension,
    order: ByteOrder,
    dict_to_column: &[Option<usize>],
    variables: &mut [Variable],
) {
    let n = ext.count as usize;
    let by_column: Vec<Option<usize>> = (0..variables.len()).map(Some).collect();
    let (per, targets) = if n == 3 * variables.len() {
        (3, by_column)
    } else if n == 3 * dict_to_column.len() {
        (3, dict_to_column.to_vec())
    } else if n == 2 * variables.len() {
        (2, by_column)
    } else if n == 2 * dict_to_column.len() {
        (2, dict_to_column.to_vec())
    } else {
        warn!("ignoring variable display record with {n} entries");
        return;
    };
    let Ok((_, entries)) = count(binary::i32(order), n)(ext.data) else {
        warn!("ignoring truncated variable display record");
        return;
    };
    for (entry, target) in entries.chunks_exact(per).zip(targets) {
        let Some(c) = target else {
            continue;
        };
        let var = &mut variables[c];
        var.measure = classify::spss_measure(entry[0]);
        if per == 3 {
            var.display_width = u32::try_from(entry[1]).ok();
        }
        var.alignment = classify::spss_alignment(entry[per - 1]);
    }
}

fn long_string_labels(
    ext: &Extension,
    order: ByteOrder,
    encoding: &'static Encoding,
    variables: &mut [Variable],
    label_sets: &mut Vec<(LabelSetId, Vec<(Value, String)>)>,
) -> Result<()> {
    fn counted(input: &[u8], order: ByteOrder) -> PResult<&[u8]> {
        let (input, len) = binary::u32(order)(input)?;
        binary::bytes(len as usize)(input)
    }
    fn entry(input: &[u8], order: ByteOrder) -> PResult<(&[u8], Vec<(&[u8], &[u8])>)> {
        let (input, name) = counted(input, order)?;
        let (input, _width) = binary::u32(order)(input)?;
        let (mut input, n) = binary::u32(order)(input)?;
        let mut labels = Vec::with_capacity(n.min(1024) as usize);
        for _ in 0..n {
            let (rest, value) = counted(input, order)?;
            let (rest, label) = counted(rest, order)?;
            labels.push((value, label));
            input = rest;
        }
        Ok((input, (name, labels)))
    }

    let mut input = ext.data;
    while !input.is_empty() {
        let (rest, (name, labels)) = entry(input, order).map_res(ext.data, "long string value labels")?;
        input = rest;
        let name = decode_text(name, encoding, ext.offset)?;
        let Some(var) = variables
            .iter_mut()
            .find(|v| v.name.eq_ignore_ascii_case(&name))
        else {
            return Err(Error::malformed(
                ext.offset,
                format!("value labels for unknown variable {name}"),
            ));
        };
        let id = LabelSetId(label_sets.len() as u32);
        let mut set = Vec::with_capacity(labels.len());
        for (value, label) in labels {
            set.push((
                Value::Text(decode_text(trim_padding(value), encoding, ext.offset)?),
                decode_text(label, encoding, ext.offset)?,
            ));
        }
        attach(var, id);
        label_sets.push((id, set));
    }
    Ok(())
}

fn creation_time(header: &Header) -> Option<NaiveDateTime> {
    let date = std::str::from_utf8(&header.creation_date).ok()?;
    let time = std::str::from_utf8(&header.creation_time).ok()?;
    NaiveDateTime::parse_from_str(&format!("{date} {time}"), "%d %b %y %H:%M:%S").ok()
}

#[derive(Clone, Copy)]
struct ZBlock {
    compressed_ofs: u64,
    uncompressed_size: u32,
    compressed_size: u32,
}

/// Bytecode chunks out of the zlib blocks of a ZSAV file, each block
/// inflated into one reused scratch buffer.
struct ZlibChunks<'a> {
    data: &'a [u8],
    blocks: Vec<ZBlock>,
    next_block: usize,
    scratch: Vec<u8>,
    pos: usize,
    block_offset: u64,
}

impl ChunkReader for ZlibChunks<'_> {
    fn next_chunk(&mut self) -> std::result::Result<Option<[u8; 8]>, DecompressError> {
        while self.pos >= self.scratch.len() {
            let Some(block) = self.blocks.get(self.next_block).copied() else {
                return Ok(None);
            };
            self.next_block += 1;
            self.block_offset = block.compressed_ofs;
            let start = block.compressed_ofs as usize;
            let payload = self
                .data
                .get(start..start + block.compressed_size as usize)
                .ok_or(DecompressError::Truncated)?;
            inflate_into(&mut self.scratch, payload, block.uncompressed_size as usize)?;
            self.pos = 0;
        }
        let chunk = self
            .scratch
            .get(self.pos..self.pos + 8)
            .ok_or(DecompressError::Truncated)?;
        self.pos += 8;
        let mut out = [0u8; 8];
        out.copy_from_slice(chunk);
        Ok(Some(out))
    }

    fn offset(&self) -> u64 {
        self.block_offset
    }
}

fn zlib_blocks(data: &[u8], data_start: usize, order: ByteOrder, bias: f64) -> Result<Vec<ZBlock>> {
    let u64p = binary::u64(order);
    let input = &data[data_start..];
    let (input, zheader_ofs) = u64p(input).map_res(data, "zlib header")?;
    let (input, ztrailer_ofs) = u64p(input).map_res(data, "zlib header")?;
    let (_, ztrailer_len) = u64p(input).map_res(data, "zlib header")?;
    if zheader_ofs != data_start as u64 {
        return Err(Error::malformed(
            data_start as u64,
            format!("zlib header claims offset {zheader_ofs:#x}"),
        ));
    }
    let trailer = usize::try_from(ztrailer_ofs)
        .ok()
        .and_then(|ofs| data.get(ofs..))
        .ok_or_else(|| Error::malformed(data_start as u64 + 8, "zlib trailer is past end of file"))?;
    let (input, int_bias) = binary::i64(order)(trailer).map_res(data, "zlib trailer")?;
    let (input, _zero) = binary::i64(order)(input).map_res(data, "zlib trailer")?;
    let (input, _block_size) = binary::u32(order)(input).map_res(data, "zlib trailer")?;
    let (mut input, n_blocks) = binary::u32(order)(input).map_res(data, "zlib trailer")?;
    if int_bias as f64 != -bias {
        warn!("zlib trailer bias {int_bias} does not match header bias {bias}");
    }
    if ztrailer_len != 24 * (n_blocks as u64 + 1) {
        return Err(Error::malformed(
            ztrailer_ofs,
            format!("zlib trailer of {ztrailer_len} bytes cannot hold {n_blocks} blocks"),
        ));
    }
    let mut blocks = Vec::with_capacity(n_blocks as usize);
    for _ in 0..n_blocks {
        let (rest, _uncompressed_ofs) = u64p(input).map_res(data, "zlib block descriptor")?;
        let (rest, compressed_ofs) = u64p(rest).map_res(data, "zlib block descriptor")?;
        let (rest, uncompressed_size) = binary::u32(order)(rest).map_res(data, "zlib block descriptor")?;
        let (rest, compressed_size) = binary::u32(order)(rest).map_res(data, "zlib block descriptor")?;
        blocks.push(ZBlock {
            compressed_ofs,
            uncompressed_size,
            compressed_size,
        });
        input = rest;
    }
    debug!("zlib data in {n_blocks} blocks");
    Ok(blocks)
}

/// Source of the 8-byte slots of successive cases.
enum Slots<'a> {
    Raw(SliceChunks<'a>),
    Bytecode(Bytecode, SliceChunks<'a>),
    Zlib(Bytecode, ZlibChunks<'a>),
}

impl Slots<'_> {
    fn next(&mut self) -> std::result::Result<Option<[u8; 8]>, DecompressError> {
        match self {
            Slots::Raw(chunks) => chunks.next_chunk(),
            Slots::Bytecode(bc, chunks) => bc.next_value(chunks),
            Slots::Zlib(bc, chunks) => bc.next_value(chunks),
        }
    }

    fn offset(&self) -> u64 {
        match self {
            Slots::Raw(chunks) | Slots::Bytecode(_, chunks) => chunks.offset(),
            Slots::Zlib(_, chunks) => chunks.offset(),
        }
    }

    /// Fills `row` with the next case. `false` at a clean end of data.
    fn read_case(&mut self, row: &mut [u8]) -> Result<bool> {
        for (i, slot) in row.chunks_exact_mut(8).enumerate() {
            match self.next().map_err(|e| Error::decompress(self.offset(), e))? {
                Some(value) => slot.copy_from_slice(&value),
                None if i == 0 => return Ok(false),
                None => {
                    return Err(Error::malformed(
                        self.offset(),
                        "data ends in the middle of a case",
                    ))
                }
            }
        }
        Ok(true)
    }
}

struct DataSection<'a> {
    data: &'a [u8],
    start: usize,
    order: ByteOrder,
    compression: Compression,
    bias: f64,
    sysmis: f64,
    blocks: Vec<ZBlock>,
}

impl<'a> DataSection<'a> {
    fn slots(&self) -> Slots<'a> {
        let chunks = SliceChunks::new(&self.data[self.start..], self.start as u64);
        match self.compression {
            Compression::Bytecode => {
                Slots::Bytecode(Bytecode::new(self.bias, self.sysmis, self.order), chunks)
            }
            Compression::Zlib => Slots::Zlib(
                Bytecode::new(self.bias, self.sysmis, self.order),
                ZlibChunks {
                    data: self.data,
                    blocks: self.blocks.clone(),
                    next_block: 0,
                    scratch: Vec::new(),
                    pos: 0,
                    block_offset: self.start as u64,
                },
            ),
            _ => Slots::Raw(chunks),
        }
    }

    fn count_cases(&self, n_slots: usize) -> Result<u64> {
        let mut slots = self.slots();
        let mut row = vec![0u8; n_slots * 8];
        let mut n = 0;
        while slots.read_case(&mut row)? {
            n += 1;
        }
        debug!("counted {n} cases");
        Ok(n)
    }
}

pub fn decode<H: Handler + ?Sized>(
    data: &[u8],
    kind: FileKind,
    options: &DecodeOptions,
    out: &mut Dispatcher<H>,
) -> Result<()> {
    let header = parse_header(data, kind)?;
    let order = header.order;
    let records = read_records(data, order)?;
    let encoding = choose_encoding(&records, order, options)?;
    debug!("decoding text as {}", encoding.name());
    let dict = build_dictionary(&records, order, encoding)?;

    if header.nominal_case_size > 0 && header.nominal_case_size as usize > dict.n_slots {
        return Err(Error::malformed(
            records.end_offset,
            format!(
                "header declares {} variable slots but the dictionary has {}",
                header.nominal_case_size, dict.n_slots
            ),
        ));
    }
    if header.nominal_case_size > 0 && (header.nominal_case_size as usize) < dict.n_slots {
        warn!(
            "header declares {} variable slots but the dictionary has {}",
            header.nominal_case_size, dict.n_slots
        );
    }

    let section = DataSection {
        data,
        start: records.data_start,
        order,
        compression: header.compression,
        bias: header.bias,
        sysmis: dict.sysmis,
        blocks: match header.compression {
            Compression::Zlib => zlib_blocks(data, records.data_start, order, header.bias)?,
            _ => Vec::new(),
        },
    };

    let declared = if header.n_cases >= 0 {
        header.n_cases as u64
    } else if let Some(n) = dict.n_cases_64.filter(|&n| n >= 0) {
        n as u64
    } else if dict.n_slots == 0 {
        0
    } else {
        section.count_cases(dict.n_slots)?
    };
    let window = options.window(declared);

    let label = decode_text(trim_padding(&header.file_label), encoding, 109)?;
    out.metadata(&FileMetadata {
        row_count: window.count(),
        var_count: dict.variables.len(),
        encoding: encoding.name().to_owned(),
        format: FileFormat::Spss,
        kind,
        version: if kind == FileKind::Zsav { 3 } else { 2 },
        byteorder: order,
        compressed: header.compression != Compression::None,
        compression: header.compression,
        created: creation_time(&header),
        modified: None,
        file_label: (!label.is_empty()).then_some(label),
        table_name: None,
    })?;

    for (id, labels) in &dict.label_sets {
        for (value, label) in labels {
            out.value_label(*id, value, label)?;
        }
    }
    for var in &dict.variables {
        out.variable(var)?;
    }
    out.finalize_variables(records.end_offset)?;

    let mut slots = section.slots();
    let mut row = vec![0u8; dict.n_slots * 8];
    let mut text = Vec::new();
    let mut source_row = 0u64;
    let mut emitted = 0u64;
    while dict.n_slots > 0 && !window.is_done(source_row) {
        if !slots.read_case(&mut row)? {
            break;
        }
        if let Some(row_index) = window.map(source_row) {
            for (var_index, column) in dict.columns.iter().enumerate() {
                let value = if column.width == 0 {
                    let at = column.segments[0].slot * 8;
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(&row[at..at + 8]);
                    let x = binary::f64_from(order, raw);
                    if x == dict.sysmis {
                        Value::SystemMissing
                    } else {
                        Value::Double(x)
                    }
                } else {
                    text.clear();
                    for seg in &column.segments {
                        let at = seg.slot * 8;
                        text.extend_from_slice(&row[at..at + seg.bytes]);
                    }
                    Value::Text(decode_text(trim_padding(&text), encoding, slots.offset())?)
                };
                out.value(var_index, row_index, value)?;
            }
            emitted += 1;
        }
        source_row += 1;
    }
    if emitted < window.count() {
        return Err(Error::malformed(
            slots.offset(),
            format!("data ends after {source_row} of {declared} cases"),
        ));
    }
    out.finalize_values(slots.offset())
}
