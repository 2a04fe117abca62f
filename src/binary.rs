//! Byte-order aware number parsers shared by the decoders: nom parsers for
//! sequential sections, and bounds-checked reads at absolute offsets for
//! page-structured files.

use nom::{bytes::complete::take, number::complete as num, IResult};

use crate::model::ByteOrder;

pub type PResult<'a, O> = IResult<&'a [u8], O>;

macro_rules! ordered {
    ($($name:ident: $ty:ty),*) => {
        $(
            pub fn $name(order: ByteOrder) -> impl Fn(&[u8]) -> PResult<$ty> {
                move |input| num::$name(order.nom())(input)
            }
        )*
    };
}

ordered!(u16: u16, i16: i16, u32: u32, i32: i32, u64: u64, i64: i64, f32: f32, f64: f64);

pub fn u8(input: &[u8]) -> PResult<u8> {
    num::u8(input)
}

pub fn i8(input: &[u8]) -> PResult<i8> {
    num::i8(input)
}

pub fn bytes(n: usize) -> impl Fn(&[u8]) -> PResult<&[u8]> {
    move |input| take(n)(input)
}

/// `N` bytes as an array.
pub fn array<const N: usize>(input: &[u8]) -> PResult<[u8; N]> {
    let (rest, b) = take(N)(input)?;
    let mut out = [0u8; N];
    out.copy_from_slice(b);
    Ok((rest, out))
}

fn at<const N: usize>(data: &[u8], offset: usize) -> Option<[u8; N]> {
    let b = data.get(offset..offset.checked_add(N)?)?;
    let mut out = [0u8; N];
    out.copy_from_slice(b);
    Some(out)
}

pub fn u8_at(data: &[u8], offset: usize) -> Option<u8> {
    data.get(offset).copied()
}

pub fn u16_at(order: ByteOrder, data: &[u8], offset: usize) -> Option<u16> {
    at(data, offset).map(|b| match order {
        ByteOrder::LSF => u16::from_le_bytes(b),
        ByteOrder::MSF => u16::from_be_bytes(b),
    })
}

pub fn u32_at(order: ByteOrder, data: &[u8], offset: usize) -> Option<u32> {
    at(data, offset).map(|b| match order {
        ByteOrder::LSF => u32::from_le_bytes(b),
        ByteOrder::MSF => u32::from_be_bytes(b),
    })
}

pub fn u64_at(order: ByteOrder, data: &[u8], offset: usize) -> Option<u64> {
    at(data, offset).map(|b| match order {
        ByteOrder::LSF => u64::from_le_bytes(b),
        ByteOrder::MSF => u64::from_be_bytes(b),
    })
}

pub fn f64_at(order: ByteOrder, data: &[u8], offset: usize) -> Option<f64> {
    u64_at(order, data, offset).map(f64::from_bits)
}

/// Reads a 4- or 8-byte unsigned integer, as sized by a 32/64-bit layout.
pub fn word_at(order: ByteOrder, wide: bool, data: &[u8], offset: usize) -> Option<u64> {
    if wide {
        u64_at(order, data, offset)
    } else {
        u32_at(order, data, offset).map(u64::from)
    }
}

/// An 8-byte value in file byte order as a double.
pub fn f64_from(order: ByteOrder, raw: [u8; 8]) -> f64 {
    match order {
        ByteOrder::LSF => f64::from_le_bytes(raw),
        ByteOrder::MSF => f64::from_be_bytes(raw),
    }
}
