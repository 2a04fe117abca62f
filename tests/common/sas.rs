//! SAS data set (`.sas7bdat`) and transport (`.xpt`) writers.
//!
//! Data sets come out 32-bit, little endian, with one META page followed by
//! DATA pages, or with every row as an RLE-compressed subheader on the META
//! page.

use chrono::{NaiveDate, NaiveDateTime};
use stat2pqt::sas::sas7bdat::MAGIC;

use super::{created, fixed, Cell, Column, Table};

/// Bits of the NaN SAS writes for `.`.
pub const SAS_MISSING: u64 = 0xFFFF_FE00_0000_0000;

const PAGE_HEADER: usize = 16;
const POINTER: usize = 12;

#[derive(Debug, Clone)]
pub struct SasLayout {
    pub page_size: usize,
    /// Character set byte of the header.
    pub charset: u8,
    /// Column count subheader value instead of the real count.
    pub declared_columns: Option<usize>,
    /// Store rows as RLE-compressed subheaders.
    pub rle: bool,
}

impl Default for SasLayout {
    fn default() -> Self {
        SasLayout {
            page_size: 1024,
            charset: 20,
            declared_columns: None,
            rle: false,
        }
    }
}

pub fn sas_seconds(t: NaiveDateTime) -> f64 {
    let epoch = NaiveDate::from_ymd_opt(1960, 1, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap();
    (t - epoch).num_seconds() as f64
}

fn put_u16(buf: &mut [u8], at: usize, v: u16) {
    buf[at..at + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

/// Byte offset of each column in a row, and the row length.
fn row_layout(table: &Table) -> (Vec<usize>, usize) {
    let mut offsets = Vec::new();
    let mut at = 0;
    for col in &table.columns {
        offsets.push(at);
        at += col.text_width();
    }
    (offsets, at)
}

fn row_bytes(table: &Table, row: usize) -> Vec<u8> {
    let mut out = Vec::new();
    for col in &table.columns {
        match &col.cells[row] {
            Cell::Num(Some(x)) => out.extend_from_slice(&x.to_le_bytes()),
            Cell::Num(None) | Cell::Tagged(_) => {
                out.extend_from_slice(&f64::from_bits(SAS_MISSING).to_le_bytes())
            }
            Cell::Str(s) => out.extend_from_slice(&fixed(s, col.text_width(), b' ')),
        }
    }
    out
}

/// RLE with two commands: runs of zeros and literal copies.
pub fn rle(row: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut literal: Vec<u8> = Vec::new();
    let flush = |out: &mut Vec<u8>, literal: &mut Vec<u8>| {
        for chunk in literal.chunks(16) {
            out.push(0x80 | (chunk.len() as u8 - 1));
            out.extend_from_slice(chunk);
        }
        literal.clear();
    };
    let mut i = 0;
    while i < row.len() {
        let zeros = row[i..].iter().take(17).take_while(|&&b| b == 0).count();
        if zeros >= 2 {
            flush(&mut out, &mut literal);
            out.push(0xf0 | (zeros as u8 - 2));
            i += zeros;
        } else {
            literal.push(row[i]);
            i += 1;
        }
    }
    flush(&mut out, &mut literal);
    out
}

/// Strings of the column text subheader.
struct Texts {
    blob: Vec<u8>,
}

impl Texts {
    /// `(offset, len)` of `s` inside the blob.
    fn add(&mut self, s: &str) -> (u16, u16) {
        if s.is_empty() {
            return (0, 0);
        }
        let at = self.blob.len();
        self.blob.extend_from_slice(s.as_bytes());
        self.blob.resize(self.blob.len().next_multiple_of(4), b' ');
        (at as u16, s.len() as u16)
    }
}

fn text_ref(sub: &mut [u8], at: usize, (offset, len): (u16, u16)) {
    put_u16(sub, at, 0);
    put_u16(sub, at + 2, offset);
    put_u16(sub, at + 4, len);
}

fn format_name(col: &Column) -> &'static str {
    if col.is_numeric() {
        "BEST"
    } else {
        "$"
    }
}

fn subheaders(table: &Table, layout: &SasLayout) -> Vec<Vec<u8>> {
    let (offsets, row_length) = row_layout(table);
    let n = table.columns.len();
    let mut texts = Texts {
        blob: if layout.rle {
            b"\0\0\0\0SASYZCRL".to_vec()
        } else {
            vec![0; 4]
        },
    };
    let names: Vec<_> = table.columns.iter().map(|c| texts.add(c.name)).collect();
    let labels: Vec<_> = table
        .columns
        .iter()
        .map(|c| texts.add(c.label.unwrap_or("")))
        .collect();
    let formats: Vec<_> = table.columns.iter().map(|c| texts.add(format_name(c))).collect();

    let mut row_size = vec![0u8; 64];
    put_u32(&mut row_size, 0, 0xf7f7_f7f7);
    put_u32(&mut row_size, 20, row_length as u32);
    put_u32(&mut row_size, 24, table.rows() as u32);

    let mut column_size = vec![0u8; 12];
    put_u32(&mut column_size, 0, 0xf6f6_f6f6);
    put_u32(&mut column_size, 4, layout.declared_columns.unwrap_or(n) as u32);

    let mut text = 0xffff_fffdu32.to_le_bytes().to_vec();
    text.extend_from_slice(&texts.blob);

    let mut name_sub = vec![0u8; 20 + 8 * n];
    put_u32(&mut name_sub, 0, 0xffff_ffff);
    for (i, &r) in names.iter().enumerate() {
        text_ref(&mut name_sub, 12 + 8 * i, r);
    }

    let mut attrs = vec![0u8; 20 + 12 * n];
    put_u32(&mut attrs, 0, 0xffff_fffc);
    for (i, col) in table.columns.iter().enumerate() {
        let at = 12 + 12 * i;
        put_u32(&mut attrs, at, offsets[i] as u32);
        put_u32(&mut attrs, at + 4, col.text_width() as u32);
        attrs[at + 10] = if col.is_numeric() { 1 } else { 2 };
    }

    let mut out = vec![row_size, column_size, text, name_sub, attrs];
    for (i, col) in table.columns.iter().enumerate() {
        let mut format = vec![0u8; 52];
        put_u32(&mut format, 0, 0xffff_fbfe);
        let width = if col.is_numeric() { 12 } else { col.text_width() };
        put_u16(&mut format, 12, width as u16);
        text_ref(&mut format, 34, formats[i]);
        text_ref(&mut format, 40, labels[i]);
        out.push(format);
    }
    out
}

/// A page holding `subs`, the last `rows` of them compressed rows.
fn meta_page(page_size: usize, subs: &[Vec<u8>], rows: usize) -> Vec<u8> {
    let mut page = vec![0u8; page_size];
    put_u16(&mut page, PAGE_HEADER, 0);
    put_u16(&mut page, PAGE_HEADER + 2, subs.len() as u16);
    put_u16(&mut page, PAGE_HEADER + 4, subs.len() as u16);
    let mut at = (PAGE_HEADER + 8 + subs.len() * POINTER).next_multiple_of(8);
    for (i, sub) in subs.iter().enumerate() {
        let ptr = PAGE_HEADER + 8 + i * POINTER;
        put_u32(&mut page, ptr, at as u32);
        put_u32(&mut page, ptr + 4, sub.len() as u32);
        if i >= subs.len() - rows {
            page[ptr + 8] = 4;
            page[ptr + 9] = 1;
        }
        page[at..at + sub.len()].copy_from_slice(sub);
        at += sub.len();
    }
    page
}

pub fn sas7bdat(table: &Table) -> Vec<u8> {
    sas7bdat_with(table, &SasLayout::default())
}

pub fn sas7bdat_with(table: &Table, layout: &SasLayout) -> Vec<u8> {
    let (_, row_length) = row_layout(table);
    let mut subs = subheaders(table, layout);
    let mut pages = Vec::new();
    if layout.rle {
        let n = table.rows();
        subs.extend((0..n).map(|row| rle(&row_bytes(table, row))));
        pages.push(meta_page(layout.page_size, &subs, n));
    } else {
        pages.push(meta_page(layout.page_size, &subs, 0));
        let per_page = (layout.page_size - PAGE_HEADER - 8) / row_length;
        let rows: Vec<usize> = (0..table.rows()).collect();
        for chunk in rows.chunks(per_page) {
            let mut page = vec![0u8; layout.page_size];
            put_u16(&mut page, PAGE_HEADER, 0x0100);
            put_u16(&mut page, PAGE_HEADER + 2, chunk.len() as u16);
            for (i, &row) in chunk.iter().enumerate() {
                let at = PAGE_HEADER + 8 + i * row_length;
                page[at..at + row_length].copy_from_slice(&row_bytes(table, row));
            }
            pages.push(page);
        }
    }

    let header_len = 1024;
    let mut out = vec![0u8; header_len];
    out[..32].copy_from_slice(&MAGIC);
    out[32] = 0x22;
    out[35] = 0x22;
    out[37] = 0x01;
    out[70] = layout.charset;
    out[92..156].copy_from_slice(&fixed(table.name, 64, b' '));
    out[164..172].copy_from_slice(&sas_seconds(created()).to_le_bytes());
    out[172..180].copy_from_slice(&(sas_seconds(created()) + 3600.0).to_le_bytes());
    put_u32(&mut out, 196, header_len as u32);
    put_u32(&mut out, 200, layout.page_size as u32);
    put_u32(&mut out, 204, pages.len() as u32);
    out[216..224].copy_from_slice(b"9.0401M0");
    for page in pages {
        out.extend_from_slice(&page);
    }
    out
}

// ============================================================================
// Transport files
// ============================================================================

/// IBM System/360 hexadecimal float, big endian.
pub fn ibm(x: f64) -> [u8; 8] {
    if x == 0.0 {
        return [0; 8];
    }
    let sign = if x < 0.0 { 0x80 } else { 0 };
    let mut m = x.abs();
    let mut e = 0i32;
    while m >= 1.0 {
        m /= 16.0;
        e += 1;
    }
    while m < 1.0 / 16.0 {
        m *= 16.0;
        e -= 1;
    }
    let mantissa = (m * (1u64 << 56) as f64) as u64;
    let mut out = [0u8; 8];
    out[0] = sign | (e + 64) as u8;
    out[1..].copy_from_slice(&mantissa.to_be_bytes()[1..]);
    out
}

fn card(out: &mut Vec<u8>, text: &str) {
    out.extend_from_slice(&fixed(text, 80, b' '));
}

fn pad_record(out: &mut Vec<u8>) {
    out.resize(out.len().next_multiple_of(80), b' ');
}

fn namestr(col: &Column, index: usize, position: usize) -> Vec<u8> {
    let mut ns = Vec::with_capacity(140);
    let i16be = |ns: &mut Vec<u8>, v: i16| ns.extend_from_slice(&v.to_be_bytes());
    i16be(&mut ns, if col.is_numeric() { 1 } else { 2 });
    i16be(&mut ns, 0);
    i16be(&mut ns, col.text_width() as i16);
    i16be(&mut ns, index as i16 + 1);
    ns.extend_from_slice(&fixed(col.name, 8, b' '));
    ns.extend_from_slice(&fixed(col.label.unwrap_or(""), 40, b' '));
    ns.extend_from_slice(&fixed(format_name(col), 8, b' '));
    i16be(&mut ns, if col.is_numeric() { 12 } else { col.text_width() as i16 });
    i16be(&mut ns, 0);
    i16be(&mut ns, 0);
    ns.extend_from_slice(&[0, 0]);
    ns.extend_from_slice(&[b' '; 8]);
    i16be(&mut ns, 0);
    i16be(&mut ns, 0);
    ns.extend_from_slice(&(position as i32).to_be_bytes());
    ns.resize(140, 0);
    ns
}

pub fn xpt(table: &Table) -> Vec<u8> {
    let stamp = "16FEB24:10:30:00";
    let mut out = Vec::new();
    card(&mut out, "HEADER RECORD*******LIBRARY HEADER RECORD!!!!!!!000000000000000000000000000000");
    card(
        &mut out,
        &format!("SAS     SAS     SASLIB  6.06    bsd4.2{:24}{stamp}", ""),
    );
    card(&mut out, stamp);
    card(&mut out, "HEADER RECORD*******MEMBER  HEADER RECORD!!!!!!!000000000000000001600000000140");
    card(&mut out, "HEADER RECORD*******DSCRPTR HEADER RECORD!!!!!!!000000000000000000000000000000");
    card(
        &mut out,
        &format!("SAS     {:8}SASDATA 6.06    bsd4.2  {:24}{stamp}", table.name, ""),
    );
    card(&mut out, &format!("{stamp}{:16}{:40}", "", table.label));
    card(
        &mut out,
        &format!(
            "HEADER RECORD*******NAMESTR HEADER RECORD!!!!!!!000000{:04}00000000000000000000",
            table.columns.len()
        ),
    );
    let mut position = 0;
    for (i, col) in table.columns.iter().enumerate() {
        out.extend_from_slice(&namestr(col, i, position));
        position += col.text_width();
    }
    pad_record(&mut out);
    card(&mut out, "HEADER RECORD*******OBS     HEADER RECORD!!!!!!!000000000000000000000000000000");
    for row in 0..table.rows() {
        for col in &table.columns {
            match &col.cells[row] {
                Cell::Num(Some(x)) => out.extend_from_slice(&ibm(*x)),
                Cell::Num(None) | Cell::Tagged(_) => {
                    out.extend_from_slice(&[b'.', 0, 0, 0, 0, 0, 0, 0])
                }
                Cell::Str(s) => out.extend_from_slice(&fixed(s, col.text_width(), b' ')),
            }
        }
    }
    pad_record(&mut out);
    out
}
