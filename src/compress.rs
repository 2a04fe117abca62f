//! Decompression service: compressed bytes in, raw bytes out.
//!
//! The SAS row codecs and zlib inflation are pure functions writing into a
//! caller-owned buffer, so one scratch buffer serves every row of a file.
//! The SPSS bytecode decoder carries its pending command block between rows
//! and is owned by a single decode.

use std::io::Read;

use flate2::read::ZlibDecoder;
use log::trace;
use thiserror::Error as ThisError;

use crate::model::ByteOrder;

#[derive(Debug, ThisError)]
pub enum DecompressError {
    #[error("unknown command byte {0:#04x}")]
    BadCommand(u8),
    #[error("compressed data ends early")]
    Truncated,
    #[error("decompressed data overflows {0} bytes")]
    Overflow(usize),
    #[error("back reference before start of output")]
    BadReference,
    #[error("inflated to {found} bytes instead of {expected}")]
    SizeMismatch { expected: usize, found: usize },
    #[error("zlib: {0}")]
    Zlib(#[from] std::io::Error),
}

type Result<T> = std::result::Result<T, DecompressError>;

/// Inflates a zlib stream into `output`, which ends up exactly
/// `expected_size` bytes long.
pub fn inflate_into(output: &mut Vec<u8>, payload: &[u8], expected_size: usize) -> Result<()> {
    trace!("inflating {} bytes to {expected_size}", payload.len());
    output.clear();
    output.reserve(expected_size);
    let mut decoder = ZlibDecoder::new(payload);
    decoder.read_to_end(output)?;
    if output.len() != expected_size {
        return Err(DecompressError::SizeMismatch {
            expected: expected_size,
            found: output.len(),
        });
    }
    Ok(())
}

/// Source of the 8-byte units SPSS bytecode compression works in.
pub trait ChunkReader {
    /// Next unit, or `None` at a clean end of data.
    fn next_chunk(&mut self) -> Result<Option<[u8; 8]>>;

    /// Position in the source file, for error reports.
    fn offset(&self) -> u64;
}

/// Chunks read straight out of a slice that starts at `base` in the file.
pub struct SliceChunks<'a> {
    data: &'a [u8],
    pos: usize,
    base: u64,
}

impl<'a> SliceChunks<'a> {
    pub fn new(data: &'a [u8], base: u64) -> Self {
        SliceChunks { data, pos: 0, base }
    }
}

impl ChunkReader for SliceChunks<'_> {
    fn next_chunk(&mut self) -> Result<Option<[u8; 8]>> {
        let rest = &self.data[self.pos..];
        if rest.is_empty() {
            return Ok(None);
        }
        let Some(chunk) = rest.get(..8) else {
            return Err(DecompressError::Truncated);
        };
        self.pos += 8;
        let mut out = [0u8; 8];
        out.copy_from_slice(chunk);
        Ok(Some(out))
    }

    fn offset(&self) -> u64 {
        self.base + self.pos as u64
    }
}

/// SPSS bias compression. Each command block holds eight one-byte codes:
/// 0 is padding, 1 to 251 encode the number `code - bias`, 252 ends the
/// data, 253 means the value follows uncompressed, 254 is eight spaces and
/// 255 is system missing.
pub struct Bytecode {
    bias: f64,
    sysmis: f64,
    byteorder: ByteOrder,
    codes: [u8; 8],
    next: usize,
    finished: bool,
}

impl Bytecode {
    pub fn new(bias: f64, sysmis: f64, byteorder: ByteOrder) -> Self {
        Bytecode {
            bias,
            sysmis,
            byteorder,
            codes: [0; 8],
            next: 8,
            finished: false,
        }
    }

    fn number(&self, x: f64) -> [u8; 8] {
        match self.byteorder {
            ByteOrder::LSF => x.to_le_bytes(),
            ByteOrder::MSF => x.to_be_bytes(),
        }
    }

    /// Next 8-byte value in file byte order, or `None` once the data ends.
    pub fn next_value<R: ChunkReader>(&mut self, reader: &mut R) -> Result<Option<[u8; 8]>> {
        loop {
            if self.finished {
                return Ok(None);
            }
            if self.next == 8 {
                match reader.next_chunk()? {
                    Some(codes) => {
                        self.codes = codes;
                        self.next = 0;
                    }
                    None => {
                        self.finished = true;
                        return Ok(None);
                    }
                }
            }
            let code = self.codes[self.next];
            self.next += 1;
            match code {
                0 => (),
                252 => {
                    self.finished = true;
                    return Ok(None);
                }
                253 => {
                    return reader.next_chunk()?.map(Some).ok_or(DecompressError::Truncated);
                }
                254 => return Ok(Some([b' '; 8])),
                255 => return Ok(Some(self.number(self.sysmis))),
                code => return Ok(Some(self.number(code as f64 - self.bias))),
            }
        }
    }
}

/// Expands a SAS `SASYZCRL` compressed row into `output`, returning the
/// number of bytes written.
pub fn sas_rle(input: &[u8], output: &mut [u8]) -> Result<usize> {
    let out_len = output.len();
    let mut ipos = 0;
    let mut opos = 0;
    let byte = |ipos: &mut usize| -> Result<u8> {
        let b = *input.get(*ipos).ok_or(DecompressError::Truncated)?;
        *ipos += 1;
        Ok(b)
    };
    while ipos < input.len() {
        let control = byte(&mut ipos)?;
        let command = control >> 4;
        let low = (control & 0x0f) as usize;
        let mut copy = 0usize;
        let mut insert = 0usize;
        let mut fill = 0u8;
        match command {
            0x0 => copy = byte(&mut ipos)? as usize + 64 + low * 256,
            0x1 => copy = byte(&mut ipos)? as usize + 64 + low * 256 + 4096,
            0x2 => copy = low + 96,
            0x4 => {
                insert = byte(&mut ipos)? as usize + 18 + low * 256;
                fill = byte(&mut ipos)?;
            }
            0x5 => {
                insert = byte(&mut ipos)? as usize + 17 + low * 256;
                fill = b'@';
            }
            0x6 => {
                insert = byte(&mut ipos)? as usize + 17 + low * 256;
                fill = b' ';
            }
            0x7 => {
                insert = byte(&mut ipos)? as usize + 17 + low * 256;
                fill = 0;
            }
            0x8 => copy = low + 1,
            0x9 => copy = low + 17,
            0xa => copy = low + 33,
            0xb => copy = low + 49,
            0xc => {
                fill = byte(&mut ipos)?;
                insert = low + 3;
            }
            0xd => {
                fill = b'@';
                insert = low + 2;
            }
            0xe => {
                fill = b' ';
                insert = low + 2;
            }
            0xf => {
                fill = 0;
                insert = low + 2;
            }
            _ => return Err(DecompressError::BadCommand(control)),
        }
        if copy > 0 {
            let src = input.get(ipos..ipos + copy).ok_or(DecompressError::Truncated)?;
            let dst = output
                .get_mut(opos..opos + copy)
                .ok_or(DecompressError::Overflow(out_len))?;
            dst.copy_from_slice(src);
            ipos += copy;
            opos += copy;
        }
        if insert > 0 {
            output
                .get_mut(opos..opos + insert)
                .ok_or(DecompressError::Overflow(out_len))?
                .fill(fill);
            opos += insert;
        }
    }
    Ok(opos)
}

/// Expands a SAS `SASYZCR2` (Ross data compression) row into `output`,
/// returning the number of bytes written.
pub fn sas_rdc(input: &[u8], output: &mut [u8]) -> Result<usize> {
    let out_len = output.len();
    let mut ipos = 0;
    let mut opos = 0;
    let next = |ipos: &mut usize| -> Result<usize> {
        let b = *input.get(*ipos).ok_or(DecompressError::Truncated)?;
        *ipos += 1;
        Ok(b as usize)
    };
    while ipos < input.len() {
        let control = (next(&mut ipos)? << 8) | next(&mut ipos)?;
        for bit in (0..16).rev() {
            if ipos >= input.len() {
                break;
            }
            if control & (1 << bit) == 0 {
                *output.get_mut(opos).ok_or(DecompressError::Overflow(out_len))? =
                    input[ipos];
                ipos += 1;
                opos += 1;
                continue;
            }
            let head = next(&mut ipos)?;
            let command = head >> 4;
            let count = head & 0x0f;
            match command {
                0 => {
                    let len = count + 3;
                    let fill = next(&mut ipos)? as u8;
                    output
                        .get_mut(opos..opos + len)
                        .ok_or(DecompressError::Overflow(out_len))?
                        .fill(fill);
                    opos += len;
                }
                1 => {
                    let len = count + (next(&mut ipos)? << 4) + 19;
                    let fill = next(&mut ipos)? as u8;
                    output
                        .get_mut(opos..opos + len)
                        .ok_or(DecompressError::Overflow(out_len))?
                        .fill(fill);
                    opos += len;
                }
                _ => {
                    let back = count + 3 + (next(&mut ipos)? << 4);
                    let len = if command == 2 {
                        next(&mut ipos)? + 16
                    } else {
                        command
                    };
                    if back > opos {
                        return Err(DecompressError::BadReference);
                    }
                    if opos + len > output.len() {
                        return Err(DecompressError::Overflow(out_len));
                    }
                    // Source and destination may overlap; copy forward byte
                    // by byte.
                    for i in 0..len {
                        output[opos + i] = output[opos - back + i];
                    }
                    opos += len;
                }
            }
        }
    }
    Ok(opos)
}
