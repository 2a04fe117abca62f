//! SAS7BDAT decoder.
//!
//! A data set is a header followed by fixed-size pages. Metadata lives in
//! subheaders scattered over META and MIX pages, so the first pass walks
//! every page to collect them; the second pass streams rows from DATA pages,
//! MIX pages and compressed row subheaders.

use encoding_rs::Encoding;
use log::{debug, trace, warn};

use super::{datetime, missing_from_nan};
use crate::binary::{self, f64_from};
use crate::charset::{self, decode_text, trim_padding};
use crate::classify;
use crate::compress::{sas_rdc, sas_rle};
use crate::error::{Error, Result};
use crate::handler::{Dispatcher, Handler};
use crate::model::{
    ByteOrder, Compression, FileFormat, FileKind, FileMetadata, StorageType, Value, Variable,
};
use crate::options::DecodeOptions;

pub const MAGIC: [u8; 32] = [
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xc2, 0xea, 0x81, 0x60,
    0xb3, 0x14, 0x11, 0xcf, 0xbd, 0x92, 0x08, 0x00, 0x09, 0xc7, 0x31, 0x8c, 0x18, 0x1f, 0x10, 0x11,
];

const PAGE_TYPE_MASK: u16 = 0x0f00;
const PAGE_META: u16 = 0x0000;
const PAGE_DATA: u16 = 0x0100;
const PAGE_MIX: u16 = 0x0200;
const PAGE_COMP: u16 = 0x9000;

const SIG_ROW_SIZE: u32 = 0xf7f7_f7f7;
const SIG_COLUMN_SIZE: u32 = 0xf6f6_f6f6;
const SIG_COUNTS: u32 = 0xffff_fc00;
const SIG_COLUMN_FORMAT: u32 = 0xffff_fbfe;
const SIG_COLUMN_ATTRS: u32 = 0xffff_fffc;
const SIG_COLUMN_TEXT: u32 = 0xffff_fffd;
const SIG_COLUMN_LIST: u32 = 0xffff_fffe;
const SIG_COLUMN_NAME: u32 = 0xffff_ffff;

const COMPRESSION_NONE: u8 = 0;
const COMPRESSION_TRUNCATED: u8 = 1;
const COMPRESSION_ROW: u8 = 4;

/// Layout facts from the file header.
struct Layout {
    wide: bool,
    order: ByteOrder,
    header_len: usize,
    page_size: usize,
    page_count: u64,
}

impl Layout {
    fn int_size(&self) -> usize {
        if self.wide {
            8
        } else {
            4
        }
    }

    fn page_header(&self) -> usize {
        if self.wide {
            32
        } else {
            16
        }
    }

    fn pointer_size(&self) -> usize {
        if self.wide {
            24
        } else {
            12
        }
    }

    fn word(&self, data: &[u8], offset: usize, base: u64) -> Result<u64> {
        binary::word_at(self.order, self.wide, data, offset)
            .ok_or_else(|| Error::malformed(base + offset as u64, "truncated field"))
    }

    fn u16(&self, data: &[u8], offset: usize, base: u64) -> Result<u16> {
        binary::u16_at(self.order, data, offset)
            .ok_or_else(|| Error::malformed(base + offset as u64, "truncated field"))
    }

    fn u32(&self, data: &[u8], offset: usize, base: u64) -> Result<u32> {
        binary::u32_at(self.order, data, offset)
            .ok_or_else(|| Error::malformed(base + offset as u64, "truncated field"))
    }
}

struct Header<'a> {
    layout: Layout,
    charset: u8,
    name: &'a [u8],
    created: f64,
    modified: f64,
    release: &'a [u8],
}

fn parse_header(data: &[u8]) -> Result<Header<'_>> {
    if data.len() < 288 {
        return Err(Error::malformed(data.len() as u64, "header is truncated"));
    }
    let wide = data[32] == 0x33;
    let a1 = if data[35] == 0x33 { 4 } else { 0 };
    let order = if data[37] == 0x01 {
        ByteOrder::LSF
    } else {
        ByteOrder::MSF
    };
    let mut layout = Layout {
        wide,
        order,
        header_len: 0,
        page_size: 0,
        page_count: 0,
    };
    layout.header_len = layout.u32(data, 196 + a1, 0)? as usize;
    layout.page_size = layout.u32(data, 200 + a1, 0)? as usize;
    layout.page_count = layout.word(data, 204 + a1, 0)?;
    let release_at = 216 + a1 + if wide { 4 } else { 0 };
    let header = Header {
        charset: data[70],
        name: &data[92..156],
        created: binary::f64_at(order, data, 164 + a1).unwrap_or(f64::NAN),
        modified: binary::f64_at(order, data, 172 + a1).unwrap_or(f64::NAN),
        release: data.get(release_at..release_at + 8).unwrap_or_default(),
        layout,
    };
    if header.layout.header_len < 288 || header.layout.header_len > data.len() {
        return Err(Error::malformed(196 + a1 as u64, "bad header length"));
    }
    if header.layout.page_size < 64 {
        return Err(Error::malformed(200 + a1 as u64, "bad page size"));
    }
    debug!(
        "sas7bdat: {}-bit {order:?}, {} pages of {} bytes, charset {}",
        if wide { 64 } else { 32 },
        header.layout.page_count,
        header.layout.page_size,
        header.charset
    );
    Ok(header)
}

/// Reference to a string inside a column text subheader.
#[derive(Debug, Clone, Copy, Default)]
struct TextRef {
    index: u16,
    offset: u16,
    len: u16,
}

impl TextRef {
    fn parse(layout: &Layout, sub: &[u8], at: usize, base: u64) -> Result<TextRef> {
        Ok(TextRef {
            index: layout.u16(sub, at, base)?,
            offset: layout.u16(sub, at + 2, base)?,
            len: layout.u16(sub, at + 4, base)?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct ColumnAttr {
    offset: usize,
    width: usize,
    kind: u8,
}

#[derive(Debug, Clone, Copy, Default)]
struct ColumnFormat {
    name: TextRef,
    label: TextRef,
    width: u16,
    decimals: u16,
}

/// One subheader pointer of a page.
struct Pointer<'a> {
    bytes: &'a [u8],
    offset: u64,
    compression: u8,
    kind: u8,
}

#[derive(Default)]
struct Meta<'a> {
    row_length: usize,
    row_count: u64,
    mix_page_rows: u64,
    column_count: Option<usize>,
    texts: Vec<&'a [u8]>,
    names: Vec<TextRef>,
    attrs: Vec<ColumnAttr>,
    formats: Vec<ColumnFormat>,
    compression: Option<Compression>,
    end_offset: u64,
}

impl<'a> Meta<'a> {
    fn text(&self, r: TextRef, base: u64) -> Result<&'a [u8]> {
        if r.len == 0 {
            return Ok(&[]);
        }
        let start = r.offset as usize;
        self.texts
            .get(r.index as usize)
            .and_then(|t| t.get(start..start + r.len as usize))
            .ok_or_else(|| {
                Error::malformed(
                    base,
                    format!("text reference {}:{}+{} out of range", r.index, r.offset, r.len),
                )
            })
    }

    fn compression(&self) -> Compression {
        self.compression.unwrap_or(Compression::None)
    }
}

fn page_at<'a>(data: &'a [u8], layout: &Layout, index: u64) -> Result<(&'a [u8], u64)> {
    let start = layout.header_len + index as usize * layout.page_size;
    let page = data
        .get(start..start + layout.page_size)
        .ok_or_else(|| Error::malformed(start as u64, format!("page {index} is truncated")))?;
    Ok((page, start as u64))
}

fn page_type(layout: &Layout, page: &[u8], base: u64) -> Result<u16> {
    layout.u16(page, layout.page_header(), base)
}

fn pointers<'a>(layout: &Layout, page: &'a [u8], base: u64) -> Result<Vec<Pointer<'a>>> {
    let count = layout.u16(page, layout.page_header() + 4, base)? as usize;
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let at = layout.page_header() + 8 + i * layout.pointer_size();
        let offset = layout.word(page, at, base)? as usize;
        let len = layout.word(page, at + layout.int_size(), base)? as usize;
        let flags = page
            .get(at + 2 * layout.int_size()..at + 2 * layout.int_size() + 2)
            .ok_or_else(|| Error::malformed(base + at as u64, "truncated subheader pointer"))?;
        if len == 0 || flags[0] == COMPRESSION_TRUNCATED {
            continue;
        }
        let bytes = page.get(offset..offset + len).ok_or_else(|| {
            Error::malformed(base + at as u64, "subheader extends past end of page")
        })?;
        out.push(Pointer {
            bytes,
            offset: base + offset as u64,
            compression: flags[0],
            kind: flags[1],
        });
    }
    Ok(out)
}

fn signature(layout: &Layout, sub: &[u8], base: u64) -> Result<u32> {
    let at = if layout.wide && layout.order == ByteOrder::MSF { 4 } else { 0 };
    layout.u32(sub, at, base)
}

fn read_subheader<'a>(
    layout: &Layout,
    meta: &mut Meta<'a>,
    ptr: &Pointer<'a>,
) -> Result<()> {
    let sub = ptr.bytes;
    let base = ptr.offset;
    let int = layout.int_size();
    match signature(layout, sub, base)? {
        SIG_ROW_SIZE => {
            meta.row_length = layout.word(sub, 5 * int, base)? as usize;
            meta.row_count = layout.word(sub, 6 * int, base)?;
            meta.mix_page_rows = layout.word(sub, 15 * int, base)?;
            debug!(
                "row size subheader: {} rows of {} bytes",
                meta.row_count, meta.row_length
            );
        }
        SIG_COLUMN_SIZE => {
            meta.column_count = Some(layout.word(sub, int, base)? as usize);
        }
        SIG_COLUMN_TEXT => {
            let blob = &sub[int.min(sub.len())..];
            if meta.texts.is_empty() {
                let head = &blob[..blob.len().min(64)];
                if head.windows(8).any(|w| w == b"SASYZCRL") {
                    meta.compression = Some(Compression::Rle);
                } else if head.windows(8).any(|w| w == b"SASYZCR2") {
                    meta.compression = Some(Compression::Rdc);
                }
            }
            meta.texts.push(blob);
        }
        SIG_COLUMN_NAME => {
            let n = sub.len().saturating_sub(2 * int + 12) / 8;
            for i in 0..n {
                meta.names
                    .push(TextRef::parse(layout, sub, int + 8 + i * 8, base)?);
            }
        }
        SIG_COLUMN_ATTRS => {
            let entry = int + 8;
            let n = sub.len().saturating_sub(2 * int + 12) / entry;
            for i in 0..n {
                let at = int + 8 + i * entry;
                meta.attrs.push(ColumnAttr {
                    offset: layout.word(sub, at, base)? as usize,
                    width: layout.u32(sub, at + int, base)? as usize,
                    kind: *sub
                        .get(at + int + 6)
                        .ok_or_else(|| Error::malformed(base, "truncated column attributes"))?,
                });
            }
        }
        SIG_COLUMN_FORMAT => {
            if sub.len() < 34 + 3 * int {
                return Err(Error::malformed(base, "column format subheader is truncated"));
            }
            meta.formats.push(ColumnFormat {
                width: layout.u16(sub, 3 * int, base)?,
                decimals: layout.u16(sub, 3 * int + 2, base)?,
                name: TextRef::parse(layout, sub, 22 + 3 * int, base)?,
                label: TextRef::parse(layout, sub, 28 + 3 * int, base)?,
            });
        }
        SIG_COUNTS | SIG_COLUMN_LIST => (),
        other => trace!("skipping subheader {other:#010x} at {base:#x}"),
    }
    Ok(())
}

/// Whether a subheader holds a row rather than metadata.
fn is_row(layout: &Layout, meta: &Meta, ptr: &Pointer) -> bool {
    if ptr.compression == COMPRESSION_ROW {
        return true;
    }
    ptr.compression == COMPRESSION_NONE
        && ptr.kind == 1
        && meta.compression.is_some()
        && !matches!(
            signature(layout, ptr.bytes, ptr.offset),
            Ok(SIG_ROW_SIZE
                | SIG_COLUMN_SIZE
                | SIG_COUNTS
                | SIG_COLUMN_FORMAT
                | SIG_COLUMN_ATTRS
                | SIG_COLUMN_TEXT
                | SIG_COLUMN_LIST
                | SIG_COLUMN_NAME)
        )
}

fn read_meta<'a>(data: &'a [u8], layout: &Layout) -> Result<Meta<'a>> {
    let mut meta = Meta::default();
    // First pass: collect metadata subheaders, compression name first.
    let mut row_pointers = 0;
    for index in 0..layout.page_count {
        let (page, base) = page_at(data, layout, index)?;
        let kind = page_type(layout, page, base)?;
        if kind & PAGE_COMP == PAGE_COMP {
            continue;
        }
        if !matches!(kind & PAGE_TYPE_MASK, PAGE_META | PAGE_MIX) {
            continue;
        }
        for ptr in pointers(layout, page, base)? {
            if ptr.compression == COMPRESSION_NONE {
                read_subheader(layout, &mut meta, &ptr)?;
            } else {
                row_pointers += 1;
            }
            meta.end_offset = ptr.offset;
        }
    }
    trace!("{row_pointers} compressed row subheaders");
    if meta.row_length == 0 && meta.row_count > 0 {
        return Err(Error::malformed(meta.end_offset, "missing row size subheader"));
    }
    Ok(meta)
}

/// Calls `f` with every row of the data set, in file order, until it
/// returns `false`.
fn for_each_row<'a, F>(data: &'a [u8], layout: &Layout, meta: &Meta<'a>, mut f: F) -> Result<()>
where
    F: FnMut(&[u8], u64) -> Result<bool>,
{
    let row_length = meta.row_length;
    let mut scratch = vec![0u8; row_length];
    let mut remaining = meta.row_count;
    for index in 0..layout.page_count {
        if remaining == 0 {
            break;
        }
        let (page, base) = page_at(data, layout, index)?;
        let kind = page_type(layout, page, base)?;
        if kind & PAGE_COMP == PAGE_COMP {
            continue;
        }
        let first_row = layout.page_header() + 8;
        match kind & PAGE_TYPE_MASK {
            PAGE_META | PAGE_MIX => {
                let ptrs = pointers(layout, page, base)?;
                for ptr in ptrs.iter().filter(|p| is_row(layout, meta, p)) {
                    if remaining == 0 {
                        return Ok(());
                    }
                    let row: &[u8] = if ptr.bytes.len() >= row_length {
                        &ptr.bytes[..row_length]
                    } else {
                        let written = match meta.compression() {
                            Compression::Rdc => sas_rdc(ptr.bytes, &mut scratch),
                            _ => sas_rle(ptr.bytes, &mut scratch),
                        }
                        .map_err(|e| Error::decompress(ptr.offset, e))?;
                        if written != row_length {
                            return Err(Error::malformed(
                                ptr.offset,
                                format!("row expands to {written} bytes, expected {row_length}"),
                            ));
                        }
                        &scratch
                    };
                    remaining -= 1;
                    if !f(row, ptr.offset)? {
                        return Ok(());
                    }
                }
                if kind & PAGE_TYPE_MASK == PAGE_MIX && row_length > 0 {
                    let n_pointers = layout.u16(page, layout.page_header() + 4, base)? as usize;
                    let start = (first_row + n_pointers * layout.pointer_size()).next_multiple_of(8);
                    let fit = (page.len().saturating_sub(start) / row_length) as u64;
                    let n = meta.mix_page_rows.min(fit).min(remaining);
                    for i in 0..n as usize {
                        let at = start + i * row_length;
                        remaining -= 1;
                        if !f(&page[at..at + row_length], base + at as u64)? {
                            return Ok(());
                        }
                    }
                }
            }
            PAGE_DATA if row_length > 0 => {
                let blocks = layout.u16(page, layout.page_header() + 2, base)? as u64;
                let n = blocks.min(remaining);
                for i in 0..n as usize {
                    let at = first_row + i * row_length;
                    let row = page.get(at..at + row_length).ok_or_else(|| {
                        Error::malformed(base + at as u64, "row extends past end of page")
                    })?;
                    remaining -= 1;
                    if !f(row, base + at as u64)? {
                        return Ok(());
                    }
                }
            }
            _ => (),
        }
    }
    if remaining > 0 {
        return Err(Error::malformed(
            data.len() as u64,
            format!("{remaining} of {} rows missing", meta.row_count),
        ));
    }
    Ok(())
}

struct Column {
    offset: usize,
    width: usize,
    numeric: bool,
}

fn numeric(order: ByteOrder, bytes: &[u8]) -> Value {
    let mut raw = [0u8; 8];
    let n = bytes.len().min(8);
    // Truncated numbers keep their most significant bytes.
    match order {
        ByteOrder::LSF => raw[8 - n..].copy_from_slice(&bytes[bytes.len() - n..]),
        ByteOrder::MSF => raw[..n].copy_from_slice(&bytes[..n]),
    }
    let x = f64_from(order, raw);
    if x.is_nan() {
        missing_from_nan(x.to_bits())
    } else {
        Value::Double(x)
    }
}

fn choose_encoding(charset: u8, options: &DecodeOptions) -> Result<&'static Encoding> {
    match (options.encoding, charset::sas_charset(charset)) {
        (Some(encoding), _) => Ok(encoding),
        (None, Some(encoding)) => Ok(encoding),
        (None, None) => Err(Error::unsupported(format!("SAS character set {charset}"))),
    }
}

fn release_number(release: &[u8]) -> u32 {
    release
        .iter()
        .take_while(|b| b.is_ascii_digit())
        .fold(0, |n, &b| n * 10 + (b - b'0') as u32)
}

fn build_variables(
    meta: &Meta,
    encoding: &'static Encoding,
) -> Result<(Vec<Variable>, Vec<Column>)> {
    let count = meta.column_count.unwrap_or(meta.attrs.len());
    let at = meta.end_offset;
    if meta.attrs.len() < count || meta.names.len() < count {
        return Err(Error::malformed(
            at,
            format!(
                "{count} columns declared but {} names and {} attributes present",
                meta.names.len(),
                meta.attrs.len()
            ),
        ));
    }
    let mut variables = Vec::with_capacity(count);
    let mut columns = Vec::with_capacity(count);
    for index in 0..count {
        let attr = meta.attrs[index];
        if attr.offset + attr.width > meta.row_length {
            return Err(Error::malformed(
                at,
                format!("column {index} lies outside the {}-byte row", meta.row_length),
            ));
        }
        let storage = classify::sas_storage(attr.kind, attr.width as u32)
            .ok_or_else(|| Error::malformed(at, format!("column {index} has unknown type {}", attr.kind)))?;
        let name = decode_text(trim_padding(meta.text(meta.names[index], at)?), encoding, at)?;
        let mut var = Variable::new(index, name, storage);
        if let Some(format) = meta.formats.get(index) {
            let name = decode_text(trim_padding(meta.text(format.name, at)?), encoding, at)?;
            var.print_format = classify::sas_format(&name, format.width as u32, format.decimals as u32);
            let label = decode_text(trim_padding(meta.text(format.label, at)?), encoding, at)?;
            var.label = (!label.is_empty()).then_some(label);
            var.display_width = (format.width > 0).then_some(format.width as u32);
        }
        columns.push(Column {
            offset: attr.offset,
            width: attr.width,
            numeric: storage == StorageType::Double,
        });
        variables.push(var);
    }
    Ok((variables, columns))
}

pub fn decode<H: Handler + ?Sized>(
    data: &[u8],
    options: &DecodeOptions,
    out: &mut Dispatcher<H>,
) -> Result<()> {
    let header = parse_header(data)?;
    let layout = &header.layout;
    let encoding = choose_encoding(header.charset, options)?;
    let meta = read_meta(data, layout)?;
    let (variables, columns) = build_variables(&meta, encoding)?;
    let window = options.window(meta.row_count);

    let name = decode_text(trim_padding(header.name), encoding, 92)?;
    let compression = meta.compression();
    out.metadata(&FileMetadata {
        row_count: window.count(),
        var_count: variables.len(),
        encoding: encoding.name().to_owned(),
        format: FileFormat::Sas,
        kind: FileKind::Sas7bdat,
        version: release_number(header.release),
        byteorder: layout.order,
        compressed: compression != Compression::None,
        compression,
        created: datetime(header.created),
        modified: datetime(header.modified),
        file_label: None,
        table_name: (!name.is_empty()).then_some(name),
    })?;
    for var in &variables {
        out.variable(var)?;
    }
    out.finalize_variables(meta.end_offset)?;

    if variables.is_empty() && window.count() > 0 {
        warn!("data set has rows but no columns");
    }
    let mut source_row = 0u64;
    let mut last_offset = meta.end_offset;
    if !window.is_done(0) {
        for_each_row(data, layout, &meta, |row, offset| {
            last_offset = offset;
            if let Some(row_index) = window.map(source_row) {
                for (var_index, column) in columns.iter().enumerate() {
                    let bytes = &row[column.offset..column.offset + column.width];
                    let value = if column.numeric {
                        numeric(layout.order, bytes)
                    } else {
                        Value::Text(decode_text(trim_padding(bytes), encoding, offset)?)
                    };
                    out.value(var_index, row_index, value)?;
                }
            }
            source_row += 1;
            Ok(!window.is_done(source_row))
        })?;
    }
    out.finalize_values(last_offset)
}
