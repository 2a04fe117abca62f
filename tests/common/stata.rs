//! Stata `.dta` writer: tagged layout for 117 to 119, binary for earlier
//! releases. Numeric columns with value labels are stored as `long`, other
//! numeric columns as `double`. Little endian throughout.

use stat2pqt::stata::Release;

use super::{fixed, Cell, Column, Kind, Table};

pub const DOUBLE_MISSING: u64 = 0x7fe0_0000_0000_0000;
pub const LONG_MISSING: i32 = 2_147_483_621;
const GSO_STRING: u8 = 130;

/// Distance of `.a` to `.z` from the system missing code.
fn tag(c: char) -> u8 {
    c as u8 - b'a' + 1
}

fn long_value(cell: &Cell) -> i32 {
    match cell {
        Cell::Tagged(c) => LONG_MISSING + tag(*c) as i32,
        _ => cell.num().map_or(LONG_MISSING, |x| x as i32),
    }
}

#[derive(Debug, Clone)]
pub struct DtaLayout {
    pub release: u32,
    /// Variable count in the header instead of the real one.
    pub declared_vars: Option<usize>,
}

impl DtaLayout {
    pub fn release(release: u32) -> Self {
        DtaLayout {
            release,
            declared_vars: None,
        }
    }
}

fn is_long(col: &Column) -> bool {
    col.is_numeric() && !col.value_labels.is_empty()
}

fn label_name(col: &Column) -> String {
    if is_long(col) {
        format!("{}_lbl", col.name)
    } else {
        String::new()
    }
}

fn display_format(col: &Column) -> String {
    match col.kind {
        Kind::Number if is_long(col) => "%8.0g".into(),
        Kind::Number => "%9.0g".into(),
        Kind::Text(w) => format!("%-{w}s"),
        Kind::LongText => "%9s".into(),
    }
}

fn width(col: &Column, release: Release) -> usize {
    match col.kind {
        Kind::Number if is_long(col) => 4,
        Kind::Number => 8,
        Kind::LongText if release.is_tagged() => 8,
        _ => col.text_width(),
    }
}

fn type_code_tagged(col: &Column) -> u16 {
    match col.kind {
        Kind::Number if is_long(col) => 65528,
        Kind::Number => 65526,
        Kind::Text(w) => w as u16,
        Kind::LongText => 32768,
    }
}

fn type_code_binary(col: &Column) -> u8 {
    match col.kind {
        Kind::Number if is_long(col) => 253,
        Kind::Number => 255,
        _ => col.text_width() as u8,
    }
}

/// `(v, o)` of a strL cell; empty strings use `(0, 0)`.
fn strl_key(var: usize, row: usize, s: &str) -> (u64, u64) {
    if s.is_empty() {
        (0, 0)
    } else {
        (var as u64 + 1, row as u64 + 1)
    }
}

fn strl_cell(release: Release, (v, o): (u64, u64)) -> [u8; 8] {
    let v_len = match release.0 {
        ..=117 => 4,
        118 => 2,
        _ => 3,
    };
    let mut out = [0u8; 8];
    out[..v_len].copy_from_slice(&v.to_le_bytes()[..v_len]);
    out[v_len..].copy_from_slice(&o.to_le_bytes()[..8 - v_len]);
    out
}

fn rows(table: &Table, release: Release) -> Vec<u8> {
    let mut out = Vec::new();
    for row in 0..table.rows() {
        for (i, col) in table.columns.iter().enumerate() {
            match &col.cells[row] {
                cell @ (Cell::Num(_) | Cell::Tagged(_)) if is_long(col) => {
                    out.extend_from_slice(&long_value(cell).to_le_bytes());
                }
                Cell::Num(x) => {
                    let v = x.unwrap_or(f64::from_bits(DOUBLE_MISSING));
                    out.extend_from_slice(&v.to_le_bytes());
                }
                Cell::Tagged(c) => {
                    let v = f64::from_bits(DOUBLE_MISSING + ((tag(*c) as u64) << 40));
                    out.extend_from_slice(&v.to_le_bytes());
                }
                Cell::Str(s) if col.kind == Kind::LongText && release.is_tagged() => {
                    out.extend_from_slice(&strl_cell(release, strl_key(i, row, s)));
                }
                Cell::Str(s) => out.extend_from_slice(&fixed(s, width(col, release), 0)),
            }
        }
    }
    out
}

fn strls(table: &Table, release: Release) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, col) in table.columns.iter().enumerate() {
        if col.kind != Kind::LongText {
            continue;
        }
        for (row, cell) in col.cells.iter().enumerate() {
            let s = cell.text();
            let (v, o) = strl_key(i, row, s);
            if v == 0 {
                continue;
            }
            out.extend_from_slice(b"GSO");
            out.extend_from_slice(&(v as u32).to_le_bytes());
            if release.0 == 117 {
                out.extend_from_slice(&(o as u32).to_le_bytes());
            } else {
                out.extend_from_slice(&o.to_le_bytes());
            }
            out.push(GSO_STRING);
            out.extend_from_slice(&(s.len() as u32 + 1).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
            out.push(0);
        }
    }
    out
}

/// Value-label table body: counts, text offsets, values, text.
pub fn label_table(entries: &[(i32, &str)]) -> Vec<u8> {
    let mut text = Vec::new();
    let mut offsets = Vec::new();
    for (_, label) in entries {
        offsets.push(text.len() as u32);
        text.extend_from_slice(label.as_bytes());
        text.push(0);
    }
    let mut out = Vec::new();
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    out.extend_from_slice(&(text.len() as u32).to_le_bytes());
    for off in offsets {
        out.extend_from_slice(&off.to_le_bytes());
    }
    for (value, _) in entries {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out.extend_from_slice(&text);
    out
}

fn value_labels(table: &Table, release: Release) -> Vec<u8> {
    let mut out = Vec::new();
    for col in table.columns.iter().filter(|c| is_long(c)) {
        let entries: Vec<(i32, &str)> = col
            .value_labels
            .iter()
            .filter(|(v, _)| !matches!(v, Cell::Str(_)))
            .map(|(v, l)| (long_value(v), *l))
            .collect();
        let body = label_table(&entries);
        if release.is_tagged() {
            out.extend_from_slice(b"<lbl>");
        }
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&fixed(&label_name(col), release.name_len(), 0));
        out.extend_from_slice(&[0; 3]);
        out.extend_from_slice(&body);
        if release.is_tagged() {
            out.extend_from_slice(b"</lbl>");
        }
    }
    out
}

const TIMESTAMP: &str = "16 Feb 2024 10:30";

pub fn dta(table: &Table) -> Vec<u8> {
    dta_with(table, &DtaLayout::release(118))
}

pub fn dta_with(table: &Table, layout: &DtaLayout) -> Vec<u8> {
    let release = Release(layout.release);
    if release.is_tagged() {
        tagged(table, layout, release)
    } else {
        binary(table, layout, release)
    }
}

fn each_column(out: &mut Vec<u8>, table: &Table, len: usize, f: impl Fn(&Column) -> String) {
    for col in &table.columns {
        out.extend_from_slice(&fixed(&f(col), len, 0));
    }
}

fn tagged(table: &Table, layout: &DtaLayout, release: Release) -> Vec<u8> {
    let k = layout.declared_vars.unwrap_or(table.columns.len());
    let n = table.rows();
    let mut out = Vec::new();
    out.extend_from_slice(b"<stata_dta><header><release>");
    out.extend_from_slice(release.0.to_string().as_bytes());
    out.extend_from_slice(b"</release><byteorder>LSF</byteorder><K>");
    if release.0 >= 119 {
        out.extend_from_slice(&(k as u32).to_le_bytes());
    } else {
        out.extend_from_slice(&(k as u16).to_le_bytes());
    }
    out.extend_from_slice(b"</K><N>");
    if release.0 == 117 {
        out.extend_from_slice(&(n as u32).to_le_bytes());
    } else {
        out.extend_from_slice(&(n as u64).to_le_bytes());
    }
    out.extend_from_slice(b"</N><label>");
    if release.0 == 117 {
        out.push(table.label.len() as u8);
    } else {
        out.extend_from_slice(&(table.label.len() as u16).to_le_bytes());
    }
    out.extend_from_slice(table.label.as_bytes());
    out.extend_from_slice(b"</label><timestamp>");
    out.push(TIMESTAMP.len() as u8);
    out.extend_from_slice(TIMESTAMP.as_bytes());
    out.extend_from_slice(b"</timestamp></header>");

    let mut map = [0u64; 14];
    map[1] = out.len() as u64;
    out.extend_from_slice(b"<map>");
    let map_at = out.len();
    out.resize(map_at + 14 * 8, 0);
    out.extend_from_slice(b"</map>");

    map[2] = out.len() as u64;
    out.extend_from_slice(b"<variable_types>");
    for col in &table.columns {
        out.extend_from_slice(&type_code_tagged(col).to_le_bytes());
    }
    out.extend_from_slice(b"</variable_types>");
    map[3] = out.len() as u64;
    out.extend_from_slice(b"<varnames>");
    each_column(&mut out, table, release.name_len(), |c| c.name.into());
    out.extend_from_slice(b"</varnames>");
    map[4] = out.len() as u64;
    out.extend_from_slice(b"<sortlist>");
    let sort_width = if release.0 >= 119 { 4 } else { 2 };
    out.resize(out.len() + sort_width * (table.columns.len() + 1), 0);
    out.extend_from_slice(b"</sortlist>");
    map[5] = out.len() as u64;
    out.extend_from_slice(b"<formats>");
    each_column(&mut out, table, release.format_len(), display_format);
    out.extend_from_slice(b"</formats>");
    map[6] = out.len() as u64;
    out.extend_from_slice(b"<value_label_names>");
    each_column(&mut out, table, release.name_len(), label_name);
    out.extend_from_slice(b"</value_label_names>");
    map[7] = out.len() as u64;
    out.extend_from_slice(b"<variable_labels>");
    each_column(&mut out, table, release.variable_label_len(), |c| {
        c.label.unwrap_or("").into()
    });
    out.extend_from_slice(b"</variable_labels>");
    map[8] = out.len() as u64;
    out.extend_from_slice(b"<characteristics></characteristics>");

    map[9] = out.len() as u64;
    out.extend_from_slice(b"<data>");
    out.extend_from_slice(&rows(table, release));
    out.extend_from_slice(b"</data>");
    map[10] = out.len() as u64;
    out.extend_from_slice(b"<strls>");
    out.extend_from_slice(&strls(table, release));
    out.extend_from_slice(b"</strls>");
    map[11] = out.len() as u64;
    out.extend_from_slice(b"<value_labels>");
    out.extend_from_slice(&value_labels(table, release));
    out.extend_from_slice(b"</value_labels>");
    map[12] = out.len() as u64;
    out.extend_from_slice(b"</stata_dta>");
    map[13] = out.len() as u64;

    for (i, entry) in map.iter().enumerate() {
        out[map_at + 8 * i..map_at + 8 * (i + 1)].copy_from_slice(&entry.to_le_bytes());
    }
    out
}

fn binary(table: &Table, layout: &DtaLayout, release: Release) -> Vec<u8> {
    let nvar = layout.declared_vars.unwrap_or(table.columns.len());
    let mut out = vec![release.0 as u8, 2, 1, 0];
    out.extend_from_slice(&(nvar as u16).to_le_bytes());
    out.extend_from_slice(&(table.rows() as u32).to_le_bytes());
    out.extend_from_slice(&fixed(table.label, release.data_label_len(), 0));
    out.extend_from_slice(&fixed(TIMESTAMP, release.timestamp_len(), 0));
    for col in &table.columns {
        out.push(type_code_binary(col));
    }
    each_column(&mut out, table, release.name_len(), |c| c.name.into());
    out.resize(out.len() + 2 * (table.columns.len() + 1), 0);
    each_column(&mut out, table, release.format_len(), display_format);
    each_column(&mut out, table, release.name_len(), label_name);
    each_column(&mut out, table, release.variable_label_len(), |c| {
        c.label.unwrap_or("").into()
    });
    out.push(0);
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&rows(table, release));
    out.extend_from_slice(&value_labels(table, release));
    out
}
