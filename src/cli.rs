use std::path::PathBuf;

use clap::Parser;
use encoding_rs::Encoding;
use nom::bytes::complete as nombc;
use nom::character::complete as nomcc;
use nom::error::{Error as NomError, ErrorKind};
use parquet::basic::{BrotliLevel, Compression, GzipLevel, ZstdLevel};

use stat2pqt::charset;
use stat2pqt::DecodeOptions;

const DEFAULT_GZIP_LEVEL: u32 = 6;
const DEFAULT_ZSTD_LEVEL: i32 = 3;
const DEFAULT_BROTLI_LEVEL: u32 = 4;

///Convert SPSS, SAS and Stata data files to parquet
#[derive(Parser, Debug)]
#[command(version)]
pub struct Args {
    ///Input files (.sav, .zsav, .por, .sas7bdat, .xpt, .dta)
    #[arg(required = true)]
    pub infiles: Vec<PathBuf>,
    ///Directory for the parquet files [default: next to each input]
    #[arg(short, long)]
    pub outdir: Option<PathBuf>,
    ///Parquet compression: snappy, lzo, lz4, lz4_raw, gzip[(level)], zstd[(level)], brotli[(level)]
    #[arg(short, long, value_parser = compression_parser, default_value = "snappy")]
    pub compression: Compression,
    ///Decode text with this encoding instead of the file's own
    #[arg(long, value_parser = encoding_parser)]
    pub encoding: Option<&'static Encoding>,
    ///Skip this many leading rows
    #[arg(long, default_value_t = 0)]
    pub row_offset: u64,
    ///Convert at most this many rows
    #[arg(long)]
    pub row_limit: Option<u64>,
    ///Files converted at once [default: available parallelism]
    #[arg(short, long)]
    pub jobs: Option<usize>,
    ///Print metadata and variables instead of converting
    #[arg(long)]
    pub info: bool,
}

impl Args {
    pub fn decode_options(&self) -> DecodeOptions {
        DecodeOptions {
            encoding: self.encoding,
            row_offset: self.row_offset,
            row_limit: self.row_limit,
        }
    }
}

fn encoding_parser(s: &str) -> Result<&'static Encoding, String> {
    charset::by_label(s).ok_or_else(|| format!("unknown encoding {s:?}"))
}

fn compression_parser(s: &str) -> Result<Compression, &'static str> {
    match p_compress(s) {
        Ok((_, c)) => Ok(c),
        Err(_) => Err("Invalid compression parameter"),
    }
}

fn p_compress(s: &str) -> nom::IResult<&str, Compression> {
    let (s, c) = nom::branch::alt((
        p_snappy, p_lz4_raw, p_lzo, p_lz4, p_gzip, p_zstd, p_brotli,
    ))(s)?;
    let (s, _) = nom::combinator::eof(s)?;
    Ok((s, c))
}

fn p_snappy(s: &str) -> nom::IResult<&str, Compression> {
    let (s, _) = nombc::tag_no_case("snappy")(s)?;
    Ok((s, Compression::SNAPPY))
}

fn p_lzo(s: &str) -> nom::IResult<&str, Compression> {
    let (s, _) = nombc::tag_no_case("lzo")(s)?;
    Ok((s, Compression::LZO))
}

fn p_lz4(s: &str) -> nom::IResult<&str, Compression> {
    let (s, _) = nombc::tag_no_case("lz4")(s)?;
    Ok((s, Compression::LZ4))
}

fn p_lz4_raw(s: &str) -> nom::IResult<&str, Compression> {
    let (s, _) = nombc::tag_no_case("lz4_raw")(s)?;
    Ok((s, Compression::LZ4_RAW))
}

/// A level the codec refuses is a hard failure, not a reason to try the
/// next alternative.
fn bad_level(s: &str) -> nom::Err<NomError<&str>> {
    nom::Err::Failure(NomError::new(s, ErrorKind::Verify))
}

fn p_gzip(s: &str) -> nom::IResult<&str, Compression> {
    let (s, _) = nombc::tag_no_case("gzip")(s)?;
    let (s, lvl) = p_optno(s, nomcc::u32, DEFAULT_GZIP_LEVEL)?;
    let lvl = GzipLevel::try_new(lvl).map_err(|_| bad_level(s))?;
    Ok((s, Compression::GZIP(lvl)))
}

fn p_zstd(s: &str) -> nom::IResult<&str, Compression> {
    let (s, _) = nombc::tag_no_case("zstd")(s)?;
    let (s, lvl) = p_optno(s, nomcc::i32, DEFAULT_ZSTD_LEVEL)?;
    let lvl = ZstdLevel::try_new(lvl).map_err(|_| bad_level(s))?;
    Ok((s, Compression::ZSTD(lvl)))
}

fn p_brotli(s: &str) -> nom::IResult<&str, Compression> {
    let (s, _) = nombc::tag_no_case("brotli")(s)?;
    let (s, lvl) = p_optno(s, nomcc::u32, DEFAULT_BROTLI_LEVEL)?;
    let lvl = BrotliLevel::try_new(lvl).map_err(|_| bad_level(s))?;
    Ok((s, Compression::BROTLI(lvl)))
}

/// `(n)` or nothing, in which case `default`.
fn p_optno<'a, N: Clone>(
    s: &'a str,
    number: fn(&'a str) -> nom::IResult<&'a str, N>,
    default: N,
) -> nom::IResult<&'a str, N> {
    nom::branch::alt((
        nom::sequence::delimited(nombc::tag("("), number, nombc::tag(")")),
        nom::combinator::value(default, nom::combinator::eof),
    ))(s)
}
