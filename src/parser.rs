use nom::bytes::complete::tag;
use nom::character::complete::{digit1, hex_digit1, space0};
use nom::combinator::map_res;
use nom::error::{ErrorKind, FromExternalError, ParseError};
use nom::multi::count;
use nom::number::complete::le_u32;
use nom::sequence::{separated_pair, tuple};
use nom::Err::Error;
use nom::IResult;

use crate::{FmtType, PacketFormat};

/// Number of DWORDs in every TLP header on the streaming interface.
pub const HDR_DWORDS: usize = 8;

#[derive(Debug, PartialEq)]
pub enum CustomError<I> {
    InvalidHeader,
    BadNumber,
    Nom(I, ErrorKind),
}

impl<I> ParseError<I> for CustomError<I> {
    fn from_error_kind(input: I, kind: ErrorKind) -> Self {
        CustomError::Nom(input, kind)
    }

    fn append(_: I, _: ErrorKind, other: Self) -> Self {
        other
    }
}

impl<I, E> FromExternalError<I, E> for CustomError<I> {
    fn from_external_error(_: I, _: ErrorKind, _: E) -> Self {
        CustomError::BadNumber
    }
}

type ParseResult<I, O> = IResult<I, O, CustomError<I>>;

/// The eight little-endian header DWORDs at the start of a tdata image.
pub fn header_dwords(i: &[u8]) -> ParseResult<&[u8], [u32; HDR_DWORDS]> {
    let (i, dws) = count(le_u32, HDR_DWORDS)(i)?;
    let mut hdr = [0u32; HDR_DWORDS];
    hdr.copy_from_slice(&dws);
    Ok((i, hdr))
}

/// The fmt/type byte lives in bits 31:24 of DW0.
pub fn packet_format(i: &[u8]) -> ParseResult<&[u8], (FmtType, PacketFormat)> {
    let (i, dw0) = le_u32(i)?;
    let fmt_type = FmtType((dw0 >> 24) as u8);
    let format = fmt_type
        .packet_format()
        .map_err(|_| Error(CustomError::InvalidHeader))?;
    Ok((i, (fmt_type, format)))
}

/// `n` payload DWORDs.
pub fn payload_dwords(i: &[u8], n: usize) -> ParseResult<&[u8], Vec<u32>> {
    count(le_u32, n)(i)
}

fn hex_u64(i: &str) -> ParseResult<&str, u64> {
    map_res(hex_digit1, |s| u64::from_str_radix(s, 16))(i)
}

/// `<start>-<end> perms ...` header line of a `/proc/<pid>/smaps` entry.
pub fn smaps_range(i: &str) -> ParseResult<&str, (u64, u64)> {
    separated_pair(hex_u64, tag("-"), hex_u64)(i)
}

/// `KernelPageSize:       4 kB`, yielding the size in kB.
pub fn kernel_page_size(i: &str) -> ParseResult<&str, u64> {
    let (i, (_, _, kb, _, _)) = tuple((
        tag("KernelPageSize:"),
        space0,
        map_res(digit1, |s: &str| s.parse::<u64>()),
        space0,
        tag("kB"),
    ))(i)?;
    Ok((i, kb))
}
