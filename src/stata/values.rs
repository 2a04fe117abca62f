//! Cell decoding: numeric types with their missing-value encodings, and
//! strL references.

use crate::binary;
use crate::model::{ByteOrder, StorageType, Value};

use super::Release;

const BYTE_MISSING: i8 = 101;
const INT_MISSING: i16 = 32741;
const LONG_MISSING: i32 = 2_147_483_621;
const FLOAT_MISSING: u32 = 0x7f00_0000;
const DOUBLE_MISSING: u64 = 0x7fe0_0000_0000_0000;

/// `.` for code 0, `.a` to `.z` for codes 1 to 26.
fn missing(code: u64) -> Value {
    match code {
        1..=26 => Value::TaggedMissing((b'a' + code as u8 - 1) as char),
        _ => Value::SystemMissing,
    }
}

pub fn byte(v: i8, release: Release) -> Value {
    if !release.has_extended_missing() {
        return if v == i8::MAX { Value::SystemMissing } else { Value::Int8(v) };
    }
    if v >= BYTE_MISSING {
        missing((v - BYTE_MISSING) as u64)
    } else {
        Value::Int8(v)
    }
}

pub fn int(v: i16, release: Release) -> Value {
    if !release.has_extended_missing() {
        return if v == i16::MAX { Value::SystemMissing } else { Value::Int16(v) };
    }
    if v >= INT_MISSING {
        missing((v - INT_MISSING) as u64)
    } else {
        Value::Int16(v)
    }
}

pub fn long(v: i32, release: Release) -> Value {
    if !release.has_extended_missing() {
        return if v == i32::MAX { Value::SystemMissing } else { Value::Int32(v) };
    }
    if v >= LONG_MISSING {
        missing((v - LONG_MISSING) as u64)
    } else {
        Value::Int32(v)
    }
}

pub fn float(v: f32, release: Release) -> Value {
    let bits = v.to_bits();
    if bits & 0x8000_0000 != 0 || bits < FLOAT_MISSING {
        return Value::Float(v);
    }
    if release.has_extended_missing() {
        missing(((bits - FLOAT_MISSING) >> 11) as u64)
    } else {
        Value::SystemMissing
    }
}

pub fn double(v: f64, release: Release) -> Value {
    let bits = v.to_bits();
    if bits & 0x8000_0000_0000_0000 != 0 || bits < DOUBLE_MISSING {
        return Value::Double(v);
    }
    if release.has_extended_missing() {
        missing((bits - DOUBLE_MISSING) >> 40)
    } else {
        Value::SystemMissing
    }
}

/// Decodes a numeric cell. `bytes` holds at least the storage width.
pub fn numeric(storage: StorageType, release: Release, order: ByteOrder, bytes: &[u8]) -> Option<Value> {
    Some(match storage {
        StorageType::Int8 => byte(*bytes.first()? as i8, release),
        StorageType::Int16 => int(binary::u16_at(order, bytes, 0)? as i16, release),
        StorageType::Int32 => long(binary::u32_at(order, bytes, 0)? as i32, release),
        StorageType::Float => float(f32::from_bits(binary::u32_at(order, bytes, 0)?), release),
        StorageType::Double => double(binary::f64_at(order, bytes, 0)?, release),
        StorageType::Text(_) | StorageType::LongText => return None,
    })
}

/// Splits an 8-byte strL reference into its `(v, o)` pair: variable and
/// observation in 117, then 2+6 bytes in 118 and 3+5 bytes in 119.
pub fn strl_ref(bytes: [u8; 8], release: Release, order: ByteOrder) -> (u32, u64) {
    let v_len = match release.0 {
        ..=117 => 4,
        118 => 2,
        _ => 3,
    };
    let (v, o) = bytes.split_at(v_len);
    (uint(v, order) as u32, uint(o, order))
}

fn uint(bytes: &[u8], order: ByteOrder) -> u64 {
    let fold = |n: u64, &b: &u8| (n << 8) | b as u64;
    match order {
        ByteOrder::MSF => bytes.iter().fold(0, fold),
        ByteOrder::LSF => bytes.iter().rev().fold(0, fold),
    }
}
