//! SPSS portable file decoder.
//!
//! A portable file is text: lines are wrapped at 80 columns, every byte goes
//! through the character table stored in the header, numbers are written in
//! base 30 and each field ends with `/`.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use encoding_rs::{Encoding, WINDOWS_1252};
use log::{debug, trace, warn};

use crate::charset::{decode_text, trim_padding};
use crate::classify;
use crate::error::{Error, Result};
use crate::handler::{Dispatcher, Handler};
use crate::model::{
    ByteOrder, Compression, FileFormat, FileKind, FileMetadata, LabelSetId, MissingValues,
    StorageType, Value, Variable,
};
use crate::options::DecodeOptions;

/// Portable character set, by position, in windows-1252. Blanks are
/// positions with no counterpart.
static PORTABLE_TO_WINDOWS_1252: &[u8; 256] = b"                                                                \
0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz .\
<(+|&[]!$*);^-/|,%_>?`:#@'=\"  \xb1 \xb0\x86~\x96   0\xb9\xb2\xb3456789   \x97() {}\\\xa2\x95                                                                   ";

const VENDOR_LEN: usize = 200;
const SIGNATURE: &[u8; 8] = b"SPSSPORT";

/// Maps file bytes to windows-1252, built from the character table in the
/// file header.
struct Translation([u8; 256]);

impl Translation {
    fn new(character_set: &[u8; 256]) -> Translation {
        // The first 64 positions are control characters, usually all written
        // as '0', which would shadow the real digit.
        let mut table = [0u8; 256];
        for (portable, &c) in character_set.iter().enumerate().skip(64) {
            if table[c as usize] == 0 {
                table[c as usize] = PORTABLE_TO_WINDOWS_1252[portable];
            }
        }
        Translation(table)
    }
}

/// Reads a portable file as one unwrapped stream: `\r` is dropped, and a
/// `\n` ending a short line reads as blanks up to column 80.
#[derive(Clone)]
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
    line_len: usize,
    padding: bool,
    table: Option<&'a Translation>,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Cursor<'a> {
        Cursor {
            data,
            pos: 0,
            line_len: 0,
            padding: false,
            table: None,
        }
    }

    fn offset(&self) -> u64 {
        self.pos as u64
    }

    fn raw(&mut self) -> Option<u8> {
        if self.padding {
            self.line_len += 1;
            if self.line_len >= 80 {
                self.padding = false;
                self.line_len = 0;
            }
            return Some(b' ');
        }
        loop {
            let c = *self.data.get(self.pos)?;
            self.pos += 1;
            match c {
                b'\r' => continue,
                b'\n' if self.line_len >= 80 => {
                    self.line_len = 0;
                }
                b'\n' if self.line_len == 79 => {
                    self.line_len = 0;
                    return Some(b' ');
                }
                b'\n' => {
                    self.padding = true;
                    self.line_len += 1;
                    return Some(b' ');
                }
                _ => {
                    self.line_len += 1;
                    return Some(c);
                }
            }
        }
    }

    fn next(&mut self) -> Option<u8> {
        let c = self.raw()?;
        Some(match self.table {
            Some(table) => table.0[c as usize],
            None => c,
        })
    }

    fn byte(&mut self) -> Result<u8> {
        self.next()
            .ok_or_else(|| Error::malformed(self.offset(), "portable file ends early"))
    }

    fn fill<const N: usize>(&mut self) -> Option<[u8; N]> {
        let mut out = [0u8; N];
        for b in out.iter_mut() {
            *b = self.next()?;
        }
        Some(out)
    }

    /// A base-30 number, or `None` for system missing (`*.`).
    fn number(&mut self) -> Result<Option<f64>> {
        let start = self.offset();
        let mut c = self.byte()?;
        while c == b' ' {
            c = self.byte()?;
        }
        if c == b'*' {
            self.byte()?;
            return Ok(None);
        }
        let negative = c == b'-';
        if negative {
            c = self.byte()?;
        }
        let mut significand = 0u64;
        let mut exponent = 0i32;
        let mut seen_dot = false;
        let mut seen_digit = false;
        // First digit that did not fit the significand, for rounding.
        let mut dropped: Option<u32> = None;
        loop {
            if let Some(digit) = (c as char).to_digit(30) {
                seen_digit = true;
                if significand > MAX_SIGNIFICAND {
                    dropped.get_or_insert(digit);
                    exponent += 1;
                } else {
                    significand = significand * 30 + digit as u64;
                }
                if seen_dot {
                    exponent -= 1;
                }
            } else if c == b'.' && !seen_dot {
                seen_dot = true;
            } else {
                break;
            }
            c = self.byte()?;
        }
        if !seen_digit {
            return Err(Error::malformed(start, "number expected"));
        }
        if c == b'+' || c == b'-' {
            let sign = c;
            let mut exp = 0i32;
            c = self.byte()?;
            while let Some(digit) = (c as char).to_digit(30) {
                exp = exp.saturating_mul(30).saturating_add(digit as i32);
                c = self.byte()?;
            }
            exponent = if sign == b'+' {
                exponent.saturating_add(exp)
            } else {
                exponent.saturating_sub(exp)
            };
        }
        if c != b'/' {
            return Err(Error::malformed(self.offset(), "number is missing its '/'"));
        }
        if dropped.is_some_and(|d| d >= 15) {
            significand += 1;
        }
        let x = scale(significand as f64, exponent);
        let x = if x.is_infinite() { f64::MAX } else { x };
        Ok(Some(if negative { -x } else { x }))
    }

    fn float(&mut self) -> Result<f64> {
        let offset = self.offset();
        self.number()?
            .ok_or_else(|| Error::malformed(offset, "unexpected system missing value"))
    }

    fn integer(&mut self) -> Result<usize> {
        let offset = self.offset();
        let x = self.float()?;
        if x.trunc() != x || x < 0.0 || x > u32::MAX as f64 {
            return Err(Error::malformed(offset, format!("{x} is not a valid count")));
        }
        Ok(x as usize)
    }

    fn string(&mut self) -> Result<Vec<u8>> {
        let n = self.integer()?;
        let mut s = Vec::with_capacity(n);
        for _ in 0..n {
            s.push(self.byte()?);
        }
        Ok(s)
    }
}

/// Whether `prefix` starts a portable file.
pub fn is_portable(prefix: &[u8]) -> bool {
    header(prefix).is_some()
}

fn header(data: &[u8]) -> Option<(Translation, Cursor<'_>)> {
    let mut cursor = Cursor::new(data);
    for _ in 0..VENDOR_LEN {
        cursor.raw()?;
    }
    let character_set = cursor.fill::<256>()?;
    let table = Translation::new(&character_set);
    let mut ahead = cursor.clone();
    ahead.table = Some(&table);
    if &ahead.fill::<8>()? != SIGNATURE {
        return None;
    }
    Some((table, cursor))
}

fn creation_time(date: &[u8], time: &[u8]) -> Option<NaiveDateTime> {
    let date = std::str::from_utf8(date).ok()?;
    let date = NaiveDate::parse_from_str(date.trim(), "%Y%m%d").ok()?;
    let time = std::str::from_utf8(time)
        .ok()
        .and_then(|t| NaiveTime::parse_from_str(t.trim(), "%H%M%S").ok())
        .unwrap_or_default();
    Some(NaiveDateTime::new(date, time))
}

struct Dictionary {
    variables: Vec<Variable>,
    label_sets: Vec<(LabelSetId, Vec<(Value, String)>)>,
    created: Option<NaiveDateTime>,
    product: Option<String>,
}

fn value(cursor: &mut Cursor, numeric: bool, encoding: &'static Encoding) -> Result<Value> {
    if numeric {
        Ok(match cursor.number()? {
            Some(x) => Value::Double(x),
            None => Value::SystemMissing,
        })
    } else {
        let offset = cursor.offset();
        let s = cursor.string()?;
        Ok(Value::Text(decode_text(trim_padding(&s), encoding, offset)?))
    }
}

fn text(cursor: &mut Cursor, encoding: &'static Encoding) -> Result<String> {
    let offset = cursor.offset();
    let s = cursor.string()?;
    decode_text(&s, encoding, offset)
}

fn read_dictionary(cursor: &mut Cursor, encoding: &'static Encoding) -> Result<Dictionary> {
    let offset = cursor.offset();
    let tag = cursor.byte()?;
    if tag != b'A' {
        return Err(Error::unsupported(format!(
            "portable file version {:?}",
            tag as char
        )));
    }
    let date = cursor.string()?;
    let time = cursor.string()?;
    let created = creation_time(&date, &time);
    if created.is_none() {
        warn!("portable file at {offset:#x} has no valid creation date");
    }

    let mut tag = cursor.byte()?;
    let mut product = None;
    if tag == b'1' {
        product = Some(text(cursor, encoding)?);
        tag = cursor.byte()?;
    }
    for optional in [b'2', b'3'] {
        if tag == optional {
            cursor.string()?;
            tag = cursor.byte()?;
        }
    }

    if tag != b'4' {
        return Err(Error::malformed(cursor.offset(), "variable count record expected"));
    }
    let n_vars = cursor.integer()?;
    tag = cursor.byte()?;
    if tag == b'5' {
        cursor.integer()?;
        tag = cursor.byte()?;
    }
    if tag == b'6' {
        cursor.string()?;
        tag = cursor.byte()?;
    }

    let mut variables = Vec::with_capacity(n_vars.min(4096));
    for index in 0..n_vars {
        if tag != b'7' {
            return Err(Error::malformed(
                cursor.offset(),
                format!("{n_vars} variables declared but only {index} present"),
            ));
        }
        let width = cursor.integer()?;
        let name = text(cursor, encoding)?;
        let print = [cursor.integer()?, cursor.integer()?, cursor.integer()?];
        let _write = [cursor.integer()?, cursor.integer()?, cursor.integer()?];
        let storage = i32::try_from(width)
            .ok()
            .and_then(classify::spss_storage)
            .ok_or_else(|| Error::malformed(cursor.offset(), "invalid variable width"))?;
        let numeric = width == 0;
        let mut var = Variable::new(index, name, storage);
        var.print_format = classify::spss_format(print[0] as u32, print[1] as u32, print[2] as u32);

        tag = cursor.byte()?;
        let mut missing = MissingValues::default();
        match tag {
            b'B' => {
                missing.range = Some((cursor.float()?, cursor.float()?));
                tag = cursor.byte()?;
            }
            b'A' => {
                missing.range = Some((cursor.float()?, f64::INFINITY));
                tag = cursor.byte()?;
            }
            b'9' => {
                missing.range = Some((f64::NEG_INFINITY, cursor.float()?));
                tag = cursor.byte()?;
            }
            _ => (),
        }
        while tag == b'8' {
            missing.values.push(value(cursor, numeric, encoding)?);
            tag = cursor.byte()?;
        }
        var.missing = missing;
        if tag == b'C' {
            var.label = Some(text(cursor, encoding)?);
            tag = cursor.byte()?;
        }
        trace!("portable variable {} width {width}", var.name);
        variables.push(var);
    }

    let mut label_sets = Vec::new();
    while tag == b'D' {
        let offset = cursor.offset();
        let n = cursor.integer()?;
        let mut targets = Vec::with_capacity(n);
        for _ in 0..n {
            let name = text(cursor, encoding)?;
            let Some(i) = variables.iter().position(|v| v.name.eq_ignore_ascii_case(&name)) else {
                return Err(Error::malformed(
                    offset,
                    format!("value labels for unknown variable {name}"),
                ));
            };
            targets.push(i);
        }
        let Some(&first) = targets.first() else {
            return Err(Error::malformed(offset, "value labels apply to no variables"));
        };
        let numeric = variables[first].storage == StorageType::Double;
        if targets
            .iter()
            .any(|&i| (variables[i].storage == StorageType::Double) != numeric)
        {
            return Err(Error::malformed(
                offset,
                "value labels apply to both numeric and string variables",
            ));
        }
        let n_labels = cursor.integer()?;
        let mut labels = Vec::with_capacity(n_labels.min(4096));
        for _ in 0..n_labels {
            let v = value(cursor, numeric, encoding)?;
            labels.push((v, text(cursor, encoding)?));
        }
        let id = LabelSetId(label_sets.len() as u32);
        for &i in &targets {
            if let Some(old) = variables[i].label_set.replace(id) {
                warn!("{} has value label sets {old} and {id}; using {id}", variables[i].name);
            }
        }
        label_sets.push((id, labels));
        tag = cursor.byte()?;
    }

    if tag == b'E' {
        let n_lines = cursor.integer()?;
        for _ in 0..n_lines {
            cursor.string()?;
        }
        tag = cursor.byte()?;
    }
    if tag != b'F' {
        return Err(Error::malformed(cursor.offset(), "data record expected"));
    }
    Ok(Dictionary {
        variables,
        label_sets,
        created,
        product,
    })
}

/// Whether the data ends at `cursor`: a `Z` or the end of the file.
fn at_end(cursor: &Cursor) -> bool {
    let mut ahead = cursor.clone();
    loop {
        match ahead.next() {
            Some(b' ') => continue,
            Some(b'Z') | None => return true,
            Some(_) => return false,
        }
    }
}

fn skip_row(cursor: &mut Cursor, variables: &[Variable]) -> Result<()> {
    for var in variables {
        if var.storage == StorageType::Double {
            cursor.number()?;
        } else {
            cursor.string()?;
        }
    }
    Ok(())
}

pub fn decode<H: Handler + ?Sized>(
    data: &[u8],
    options: &DecodeOptions,
    out: &mut Dispatcher<H>,
) -> Result<()> {
    let (table, mut cursor) = header(data)
        .ok_or_else(|| Error::malformed(0, "portable file header is truncated or unsigned"))?;
    cursor.table = Some(&table);
    let _signature = cursor.fill::<8>();
    let encoding = options.encoding.unwrap_or(WINDOWS_1252);
    let dict = read_dictionary(&mut cursor, encoding)?;
    let dictionary_end = cursor.offset();

    let mut declared = 0u64;
    if !dict.variables.is_empty() {
        let mut counter = cursor.clone();
        while !at_end(&counter) {
            skip_row(&mut counter, &dict.variables)?;
            declared += 1;
        }
    }
    debug!(
        "portable file: {} variables, {declared} cases, written by {:?}",
        dict.variables.len(),
        dict.product
    );
    let window = options.window(declared);

    out.metadata(&FileMetadata {
        row_count: window.count(),
        var_count: dict.variables.len(),
        encoding: encoding.name().to_owned(),
        format: FileFormat::Spss,
        kind: FileKind::Por,
        version: 1,
        byteorder: ByteOrder::MSF,
        compressed: false,
        compression: Compression::None,
        created: dict.created,
        modified: None,
        file_label: None,
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
    out.finalize_variables(dictionary_end)?;

    let mut row = 0u64;
    while !window.is_done(row) {
        match window.map(row) {
            Some(row_index) => {
                for (var_index, var) in dict.variables.iter().enumerate() {
                    let v = value(&mut cursor, var.storage == StorageType::Double, encoding)?;
                    out.value(var_index, row_index, v)?;
                }
            }
            None => skip_row(&mut cursor, &dict.variables)?,
        }
        row += 1;
    }
    out.finalize_values(cursor.offset())
}

/// Largest significand that still takes another digit without leaving the
/// integers an `f64` holds exactly.
const MAX_SIGNIFICAND: u64 = (1 << 53) / 30 - 1;

/// `x * 30^exponent`. Negative exponents divide by an exact power, in
/// steps small enough that the divisor stays finite.
fn scale(x: f64, exponent: i32) -> f64 {
    if exponent >= 0 {
        return x * 30f64.powi(exponent);
    }
    let mut x = x;
    let mut left = exponent.unsigned_abs();
    while left > 0 && x != 0.0 {
        let step = left.min(200);
        x /= 30f64.powi(step as i32);
        left -= step;
    }
    x
}
