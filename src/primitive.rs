//! Primitive codec (spec.md §4.A). Unsigned LEB128 and zig-zag+LEB128 integers, little-endian
//! IEEE-754 floats, length-prefixed UTF-8 strings and byte arrays (length -1 marks null), a
//! 64-bit tick count + kind byte for date/time, and the defining 128-bit layout for decimal.
//!
//! Grounded on `utilities.rs`'s `read_pod_from_stream`/`FromByteStream` style: small, inlined,
//! side-effect-free-but-for-the-stream helper functions.

use std::io::{Read, Write};

use crate::error::ReadError;

#[inline]
pub fn write_bool<W: Write>(w: &mut W, value: bool) -> std::io::Result<()> {
	w.write_all(&[value as u8])
}

#[inline]
pub fn read_bool<R: Read>(r: &mut R) -> Result<bool, ReadError> {
	let mut byte = [0u8; 1];
	r.read_exact(&mut byte)?;
	match byte[0] {
		0 => Ok(false),
		1 => Ok(true),
		_ => Err(ReadError::StreamCorrupted("boolean byte was neither 0 nor 1")),
	}
}

/// Unsigned LEB128: 7 value bits per byte, high bit set while more bytes follow.
pub fn write_uvarint<W: Write>(w: &mut W, mut value: u64) -> std::io::Result<()> {
	loop {
		let byte = (value & 0x7F) as u8;
		value >>= 7;
		if value == 0 {
			w.write_all(&[byte])?;
			return Ok(());
		}
		w.write_all(&[byte | 0x80])?;
	}
}

pub fn read_uvarint<R: Read>(r: &mut R) -> Result<u64, ReadError> {
	let mut result = 0u64;
	let mut shift = 0u32;
	loop {
		if shift >= 64 {
			return Err(ReadError::StreamCorrupted("varint overflowed 64 bits"));
		}
		let mut byte = [0u8; 1];
		r.read_exact(&mut byte)?;
		let byte = byte[0];
		result |= ((byte & 0x7F) as u64) << shift;
		if byte & 0x80 == 0 {
			return Ok(result);
		}
		shift += 7;
	}
}

#[inline]
fn zigzag_encode(value: i64) -> u64 {
	((value << 1) ^ (value >> 63)) as u64
}

#[inline]
fn zigzag_decode(value: u64) -> i64 {
	((value >> 1) as i64) ^ -((value & 1) as i64)
}

pub fn write_ivarint<W: Write>(w: &mut W, value: i64) -> std::io::Result<()> {
	write_uvarint(w, zigzag_encode(value))
}

pub fn read_ivarint<R: Read>(r: &mut R) -> Result<i64, ReadError> {
	Ok(zigzag_decode(read_uvarint(r)?))
}

pub fn write_f32<W: Write>(w: &mut W, value: f32) -> std::io::Result<()> {
	w.write_all(&value.to_le_bytes())
}

pub fn read_f32<R: Read>(r: &mut R) -> Result<f32, ReadError> {
	let mut bytes = [0u8; 4];
	r.read_exact(&mut bytes)?;
	Ok(f32::from_le_bytes(bytes))
}

pub fn write_f64<W: Write>(w: &mut W, value: f64) -> std::io::Result<()> {
	w.write_all(&value.to_le_bytes())
}

pub fn read_f64<R: Read>(r: &mut R) -> Result<f64, ReadError> {
	let mut bytes = [0u8; 8];
	r.read_exact(&mut bytes)?;
	Ok(f64::from_le_bytes(bytes))
}

/// `None` is encoded as a length of -1 (zig-zagged), matching spec.md §4.A's null-string sentinel.
pub fn write_string<W: Write>(w: &mut W, value: Option<&str>) -> std::io::Result<()> {
	match value {
		None => write_ivarint(w, -1),
		Some(s) => {
			write_ivarint(w, s.len() as i64)?;
			w.write_all(s.as_bytes())
		},
	}
}

pub fn read_string<R: Read>(r: &mut R) -> Result<Option<String>, ReadError> {
	let len = read_ivarint(r)?;
	if len == -1 {
		return Ok(None);
	}
	if len < 0 {
		return Err(ReadError::StreamCorrupted("negative string length"));
	}
	let mut bytes = vec![0u8; len as usize];
	r.read_exact(&mut bytes)?;
	String::from_utf8(bytes).map(Some).map_err(|_| ReadError::StreamCorrupted("string was not valid utf-8"))
}

pub fn write_bytes<W: Write>(w: &mut W, value: Option<&[u8]>) -> std::io::Result<()> {
	match value {
		None => write_ivarint(w, -1),
		Some(bytes) => {
			write_ivarint(w, bytes.len() as i64)?;
			w.write_all(bytes)
		},
	}
}

pub fn read_bytes<R: Read>(r: &mut R) -> Result<Option<Vec<u8>>, ReadError> {
	let len = read_ivarint(r)?;
	if len == -1 {
		return Ok(None);
	}
	if len < 0 {
		return Err(ReadError::StreamCorrupted("negative byte-array length"));
	}
	let mut bytes = vec![0u8; len as usize];
	r.read_exact(&mut bytes)?;
	Ok(bytes)
}

/// Mirrors `System.DateTimeKind`: the kind byte distinguishes unspecified/UTC/local ticks.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum DateTimeKind {
	Unspecified = 0,
	Utc = 1,
	Local = 2,
}

impl DateTimeKind {
	fn from_byte(byte: u8) -> Result<Self, ReadError> {
		match byte {
			0 => Ok(DateTimeKind::Unspecified),
			1 => Ok(DateTimeKind::Utc),
			2 => Ok(DateTimeKind::Local),
			_ => Err(ReadError::StreamCorrupted("invalid DateTimeKind byte")),
		}
	}
}

pub fn write_datetime<W: Write>(w: &mut W, ticks: i64, kind: DateTimeKind) -> std::io::Result<()> {
	w.write_all(&ticks.to_le_bytes())?;
	w.write_all(&[kind as u8])
}

pub fn read_datetime<R: Read>(r: &mut R) -> Result<(i64, DateTimeKind), ReadError> {
	let mut ticks = [0u8; 8];
	r.read_exact(&mut ticks)?;
	let mut kind = [0u8; 1];
	r.read_exact(&mut kind)?;
	Ok((i64::from_le_bytes(ticks), DateTimeKind::from_byte(kind[0])?))
}

/// The defining 128-bit layout of `System.Decimal`, carried opaquely.
pub fn write_decimal<W: Write>(w: &mut W, value: [u8; 16]) -> std::io::Result<()> {
	w.write_all(&value)
}

pub fn read_decimal<R: Read>(r: &mut R) -> Result<[u8; 16], ReadError> {
	let mut bytes = [0u8; 16];
	r.read_exact(&mut bytes)?;
	Ok(bytes)
}
