//! SPSS system (`.sav`, `.zsav`) and portable (`.por`) file writers.

use std::io::Write;

use flate2::write::ZlibEncoder;
use stat2pqt::Compression;

use super::{fixed, Cell, Column, Table};

pub const BIAS: f64 = 100.0;
pub const SYSMIS: f64 = -f64::MAX;

/// Knobs for building broken or unusual system files.
#[derive(Debug, Clone)]
pub struct SavLayout {
    pub compression: Compression,
    /// Header compression code instead of the one `compression` implies.
    pub compression_code: Option<i32>,
    /// Header slot count instead of the real one.
    pub nominal_case_size: Option<i32>,
    /// Character encoding record; `None` leaves it out.
    pub encoding: Option<&'static str>,
    /// Character code of the integer info record.
    pub codepage: i32,
}

impl Default for SavLayout {
    fn default() -> Self {
        SavLayout {
            compression: Compression::None,
            compression_code: None,
            nominal_case_size: None,
            encoding: Some("UTF-8"),
            codepage: 65001,
        }
    }
}

impl SavLayout {
    pub fn compressed(compression: Compression) -> Self {
        SavLayout {
            compression,
            ..Default::default()
        }
    }
}

fn i32le(out: &mut Vec<u8>, v: i32) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// Widths of the dictionary variables behind a column. Text wider than 255
/// bytes is split into 255-byte segments, one per 252 bytes of width.
fn segments(col: &Column) -> Vec<usize> {
    if col.is_numeric() {
        return vec![0];
    }
    let width = col.text_width();
    if width <= 255 {
        return vec![width];
    }
    let n = width.div_ceil(252);
    let mut widths = vec![255; n];
    widths[n - 1] = width - (n - 1) * 252;
    widths
}

fn segment_slots(width: usize) -> usize {
    width.div_ceil(8).max(1)
}

fn slots(col: &Column) -> usize {
    segments(col).into_iter().map(segment_slots).sum()
}

fn short_name(col: &Column) -> Vec<u8> {
    fixed(&col.name.to_uppercase(), 8, b' ')
}

fn segment_name(col: &Column, segment: usize) -> Vec<u8> {
    if segment == 0 {
        return short_name(col);
    }
    let stem: String = col.name.to_uppercase().chars().take(5).collect();
    fixed(&format!("{stem}{segment}"), 8, b' ')
}

fn packed_format(width: usize) -> i32 {
    if width == 0 {
        (5 << 16) | (8 << 8) | 2
    } else {
        (1 << 16) | ((width as i32) << 8)
    }
}

fn variable_records(out: &mut Vec<u8>, col: &Column) {
    for (segment, width) in segments(col).into_iter().enumerate() {
        let label = col.label.filter(|_| segment == 0);
        i32le(out, 2);
        i32le(out, width as i32);
        i32le(out, label.is_some() as i32);
        i32le(out, 0);
        i32le(out, packed_format(width));
        i32le(out, packed_format(width));
        out.extend_from_slice(&segment_name(col, segment));
        if let Some(label) = label {
            out.extend_from_slice(&(label.len() as u32).to_le_bytes());
            out.extend_from_slice(label.as_bytes());
            out.resize(out.len() + (4 - label.len() % 4) % 4, b' ');
        }
        for _ in 1..segment_slots(width) {
            i32le(out, 2);
            i32le(out, -1);
            for _ in 0..4 {
                i32le(out, 0);
            }
            out.extend_from_slice(b"        ");
        }
    }
}

fn cell_bytes(cell: &Cell) -> [u8; 8] {
    let mut raw = [b' '; 8];
    match cell {
        Cell::Num(x) => raw = x.unwrap_or(SYSMIS).to_le_bytes(),
        Cell::Tagged(_) => raw = SYSMIS.to_le_bytes(),
        Cell::Str(s) => {
            let n = s.len().min(8);
            raw[..n].copy_from_slice(&s.as_bytes()[..n]);
        }
    }
    raw
}

fn label_records(out: &mut Vec<u8>, col: &Column, first_slot: usize) {
    i32le(out, 3);
    out.extend_from_slice(&(col.value_labels.len() as u32).to_le_bytes());
    for (value, label) in &col.value_labels {
        out.extend_from_slice(&cell_bytes(value));
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
        out.resize(out.len() + (8 - (label.len() + 1) % 8) % 8, b' ');
    }
    i32le(out, 4);
    out.extend_from_slice(&1u32.to_le_bytes());
    i32le(out, first_slot as i32 + 1);
}

fn extension(out: &mut Vec<u8>, subtype: i32, size: u32, data: &[u8]) {
    i32le(out, 7);
    i32le(out, subtype);
    out.extend_from_slice(&size.to_le_bytes());
    out.extend_from_slice(&(data.len() as u32 / size).to_le_bytes());
    out.extend_from_slice(data);
}

/// One case as 8-byte slots, text padded with blanks.
fn case_slots(table: &Table, row: usize) -> Vec<Slot> {
    let mut out = Vec::new();
    for col in &table.columns {
        match &col.cells[row] {
            Cell::Num(x) => out.push(Slot::Number(*x)),
            Cell::Tagged(_) => out.push(Slot::Number(None)),
            Cell::Str(s) => {
                let text = fixed(s, col.text_width(), b' ');
                let mut at = 0;
                for width in segments(col) {
                    let take = (text.len() - at).min(width);
                    let mut bytes = text[at..at + take].to_vec();
                    at += take;
                    bytes.resize(segment_slots(width) * 8, b' ');
                    for chunk in bytes.chunks_exact(8) {
                        let mut raw = [0u8; 8];
                        raw.copy_from_slice(chunk);
                        out.push(Slot::Raw(raw));
                    }
                }
            }
        }
    }
    out
}

enum Slot {
    Number(Option<f64>),
    Raw([u8; 8]),
}

/// Bias compression of a stream of slots, ending with the end-of-data code.
fn bytecode(slots: impl Iterator<Item = Slot>) -> Vec<u8> {
    let mut out = Vec::new();
    let mut codes = Vec::with_capacity(8);
    let mut literals: Vec<[u8; 8]> = Vec::new();
    let flush = |out: &mut Vec<u8>, codes: &mut Vec<u8>, literals: &mut Vec<[u8; 8]>| {
        codes.resize(8, 0);
        out.extend_from_slice(&codes[..]);
        for lit in literals.drain(..) {
            out.extend_from_slice(&lit);
        }
        codes.clear();
    };
    for slot in slots {
        let code = match slot {
            Slot::Number(None) => 255,
            Slot::Number(Some(x)) if x.fract() == 0.0 && (1.0..=251.0).contains(&(x + BIAS)) => {
                (x + BIAS) as u8
            }
            Slot::Number(Some(x)) => {
                literals.push(x.to_le_bytes());
                253
            }
            Slot::Raw(raw) if raw == [b' '; 8] => 254,
            Slot::Raw(raw) => {
                literals.push(raw);
                253
            }
        };
        codes.push(code);
        if codes.len() == 8 {
            flush(&mut out, &mut codes, &mut literals);
        }
    }
    codes.push(252);
    flush(&mut out, &mut codes, &mut literals);
    out
}

pub fn sav(table: &Table) -> Vec<u8> {
    sav_with(table, &SavLayout::default())
}

pub fn sav_with(table: &Table, layout: &SavLayout) -> Vec<u8> {
    let zlib = layout.compression == Compression::Zlib;
    let n_slots: usize = table.columns.iter().map(slots).sum();
    let code = layout.compression_code.unwrap_or(match layout.compression {
        Compression::Bytecode => 1,
        Compression::Zlib => 2,
        _ => 0,
    });

    let mut out = Vec::new();
    out.extend_from_slice(if zlib { b"$FL3" } else { b"$FL2" });
    out.extend_from_slice(&fixed("@(#) SPSS DATA FILE stat2pqt tests", 60, b' '));
    i32le(&mut out, 2);
    i32le(&mut out, layout.nominal_case_size.unwrap_or(n_slots as i32));
    i32le(&mut out, code);
    i32le(&mut out, 0);
    i32le(&mut out, table.rows() as i32);
    out.extend_from_slice(&BIAS.to_le_bytes());
    out.extend_from_slice(b"16 Feb 24");
    out.extend_from_slice(b"10:30:00");
    out.extend_from_slice(&fixed(table.label, 64, b' '));
    out.extend_from_slice(&[0; 3]);
    assert_eq!(out.len(), 176);

    for col in &table.columns {
        variable_records(&mut out, col);
    }
    let mut slot = 0;
    for col in &table.columns {
        if !col.value_labels.is_empty() {
            label_records(&mut out, col, slot);
        }
        slot += slots(col);
    }

    let mut info = Vec::new();
    for v in [20, 0, 0, -1, 1, 1, 2, layout.codepage] {
        info.extend_from_slice(&v.to_le_bytes());
    }
    extension(&mut out, 3, 4, &info);
    let mut display = Vec::new();
    for col in &table.columns {
        let align = if col.is_numeric() { 1 } else { 0 };
        for _ in segments(col) {
            for v in [col.measure, 8, align] {
                display.extend_from_slice(&v.to_le_bytes());
            }
        }
    }
    extension(&mut out, 11, 4, &display);
    let long_names: Vec<String> = table
        .columns
        .iter()
        .map(|c| format!("{}={}", c.name.to_uppercase(), c.name))
        .collect();
    extension(&mut out, 13, 1, long_names.join("\t").as_bytes());
    let very_long: String = table
        .columns
        .iter()
        .filter(|c| segments(c).len() > 1)
        .map(|c| format!("{}={:05}\0\t", c.name.to_uppercase(), c.text_width()))
        .collect();
    if !very_long.is_empty() {
        extension(&mut out, 14, 1, very_long.as_bytes());
    }
    if let Some(encoding) = layout.encoding {
        extension(&mut out, 20, 1, encoding.as_bytes());
    }
    i32le(&mut out, 999);
    i32le(&mut out, 0);

    let cases = (0..table.rows()).flat_map(|row| case_slots(table, row));
    match layout.compression {
        Compression::Bytecode => out.extend_from_slice(&bytecode(cases)),
        Compression::Zlib => {
            let data_start = out.len() as u64;
            let stream = bytecode(cases);
            let mut enc = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            enc.write_all(&stream).unwrap();
            let block = enc.finish().unwrap();
            let trailer_ofs = data_start + 24 + block.len() as u64;
            out.extend_from_slice(&data_start.to_le_bytes());
            out.extend_from_slice(&trailer_ofs.to_le_bytes());
            out.extend_from_slice(&48u64.to_le_bytes());
            out.extend_from_slice(&block);
            out.extend_from_slice(&(-(BIAS as i64)).to_le_bytes());
            out.extend_from_slice(&0i64.to_le_bytes());
            out.extend_from_slice(&0x3ff000u32.to_le_bytes());
            out.extend_from_slice(&1u32.to_le_bytes());
            out.extend_from_slice(&data_start.to_le_bytes());
            out.extend_from_slice(&(data_start + 24).to_le_bytes());
            out.extend_from_slice(&(stream.len() as u32).to_le_bytes());
            out.extend_from_slice(&(block.len() as u32).to_le_bytes());
        }
        _ => {
            for slot in cases {
                match slot {
                    Slot::Number(x) => out.extend_from_slice(&x.unwrap_or(SYSMIS).to_le_bytes()),
                    Slot::Raw(raw) => out.extend_from_slice(&raw),
                }
            }
        }
    }
    out
}

// ============================================================================
// Portable files
// ============================================================================

/// The portable character set in windows-1252, position by position.
const PORTABLE: &[u8; 256] = b"                                                                \
0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz .\
<(+|&[]!$*);^-/|,%_>?`:#@'=\"  \xb1 \xb0\x86~\x96   0\xb9\xb2\xb3456789   \x97() {}\\\xa2\x95                                                                   ";

#[derive(Debug, Clone)]
pub struct PorLayout {
    /// Variable count record instead of the real count.
    pub var_count: Option<usize>,
    pub version: u8,
}

impl Default for PorLayout {
    fn default() -> Self {
        PorLayout {
            var_count: None,
            version: b'A',
        }
    }
}

fn digit(d: u32) -> u8 {
    char::from_digit(d, 30).unwrap().to_ascii_uppercase() as u8
}

/// Base 30 with a trailing slash; `None` is the system missing marker.
pub fn por_number(x: Option<f64>) -> Vec<u8> {
    let Some(x) = x else {
        return b"*.".to_vec();
    };
    let mut out = Vec::new();
    if x < 0.0 {
        out.push(b'-');
    }
    let x = x.abs();
    let mut int = x.trunc() as u64;
    let mut digits = Vec::new();
    loop {
        digits.push(digit((int % 30) as u32));
        int /= 30;
        if int == 0 {
            break;
        }
    }
    digits.reverse();
    out.extend_from_slice(&digits);
    let mut frac = x.fract();
    if frac > 0.0 {
        out.push(b'.');
        for _ in 0..10 {
            frac *= 30.0;
            let d = frac.trunc();
            out.push(digit(d as u32));
            frac -= d;
            if frac == 0.0 {
                break;
            }
        }
    }
    out.push(b'/');
    out
}

fn por_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&por_number(Some(s.len() as f64)));
    out.extend_from_slice(s.as_bytes());
}

fn por_int(out: &mut Vec<u8>, n: usize) {
    out.extend_from_slice(&por_number(Some(n as f64)));
}

fn por_cell(out: &mut Vec<u8>, cell: &Cell) {
    match cell {
        Cell::Num(x) => out.extend_from_slice(&por_number(*x)),
        Cell::Tagged(_) => out.extend_from_slice(&por_number(None)),
        Cell::Str(s) => por_string(out, s),
    }
}

/// Wraps `body` into 80-column lines, filling the last with `Z`.
fn por_lines(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    for line in body.chunks(80) {
        out.extend_from_slice(line);
        if line.len() < 80 {
            out.resize(out.len() + 80 - line.len(), b'Z');
        }
        out.extend_from_slice(b"\r\n");
    }
    out
}

pub fn por(table: &Table) -> Vec<u8> {
    por_with(table, &PorLayout::default())
}

pub fn por_with(table: &Table, layout: &PorLayout) -> Vec<u8> {
    let mut body = Vec::new();
    for _ in 0..5 {
        body.extend_from_slice(&fixed("ASCII SPSS PORT FILE", 40, b' '));
    }
    let mut charset = *PORTABLE;
    charset[..64].fill(b'0');
    body.extend_from_slice(&charset);
    body.extend_from_slice(b"SPSSPORT");

    body.push(layout.version);
    por_string(&mut body, "20240216");
    por_string(&mut body, "103000");
    body.push(b'1');
    por_string(&mut body, "stat2pqt tests");
    body.push(b'4');
    por_int(&mut body, layout.var_count.unwrap_or(table.columns.len()));
    body.push(b'5');
    por_int(&mut body, 11);

    for col in &table.columns {
        body.push(b'7');
        let (width, format) = if col.is_numeric() {
            (0, [5, 8, 2])
        } else {
            let w = col.text_width();
            (w, [1, w, 0])
        };
        por_int(&mut body, width);
        por_string(&mut body, col.name);
        for _ in 0..2 {
            for f in format {
                por_int(&mut body, f);
            }
        }
        if let Some(label) = col.label {
            body.push(b'C');
            por_string(&mut body, label);
        }
    }
    for col in table.columns.iter().filter(|c| !c.value_labels.is_empty()) {
        body.push(b'D');
        por_int(&mut body, 1);
        por_string(&mut body, col.name);
        por_int(&mut body, col.value_labels.len());
        for (value, label) in &col.value_labels {
            por_cell(&mut body, value);
            por_string(&mut body, label);
        }
    }

    body.push(b'F');
    for row in 0..table.rows() {
        for col in &table.columns {
            por_cell(&mut body, &col.cells[row]);
        }
    }
    body.push(b'Z');
    por_lines(&body)
}
