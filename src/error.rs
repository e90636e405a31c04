//! Error taxonomy (spec.md §7). A plain enum with manual `From`/`Display` impls, in the
//! teacher's style (`schema/errors.rs::ReadError`) rather than a derive-macro-based crate.

use std::fmt::{Display, Formatter};
use std::io;

use crate::ids::ObjectId;

/// Errors surfaced while reading a stream.
#[derive(Debug)]
pub enum ReadError {
	Io(io::Error),
	WrongMagic,
	WrongVersion { expected: u8, found: u8 },
	WrongStreamConfiguration { reason: &'static str },
	MetadataCorrupted,
	StreamTruncated,
	StreamCorrupted(&'static str),
	TypeStructureChanged { type_name: String, reason: String },
	InvalidOperation(&'static str),
	UnregisteredType(String),
	UnresolvedObjectId(ObjectId),
}

impl From<io::Error> for ReadError {
	fn from(value: io::Error) -> Self {
		match value.kind() {
			io::ErrorKind::UnexpectedEof => ReadError::StreamTruncated,
			_ => ReadError::Io(value),
		}
	}
}

impl Display for ReadError {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			ReadError::Io(e) => write!(f, "i/o error: {e}"),
			ReadError::WrongMagic => write!(f, "stream does not begin with the fathom magic"),
			ReadError::WrongVersion { expected, found } => {
				write!(f, "wrong stream version: expected {expected}, found {found}")
			},
			ReadError::WrongStreamConfiguration { reason } => {
				write!(f, "stream configuration mismatch: {reason}")
			},
			ReadError::MetadataCorrupted => write!(f, "metadata block checksum/length invalid"),
			ReadError::StreamTruncated => write!(f, "stream ended before a value was fully decoded"),
			ReadError::StreamCorrupted(reason) => write!(f, "stream corrupted: {reason}"),
			ReadError::TypeStructureChanged { type_name, reason } => {
				write!(f, "type `{type_name}` structure changed beyond configured tolerance: {reason}")
			},
			ReadError::InvalidOperation(reason) => write!(f, "invalid operation: {reason}"),
			ReadError::UnregisteredType(name) => write!(f, "no local type registered for `{name}`"),
			ReadError::UnresolvedObjectId(id) => write!(f, "object id {id:?} was referenced before it was reserved"),
		}
	}
}

impl std::error::Error for ReadError {}

/// Errors surfaced while writing a stream.
#[derive(Debug)]
pub enum WriteError {
	Io(io::Error),
	InvalidOperation(&'static str),
	ArgumentOutOfRange(&'static str),
}

impl From<io::Error> for WriteError {
	fn from(value: io::Error) -> Self {
		WriteError::Io(value)
	}
}

impl Display for WriteError {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			WriteError::Io(e) => write!(f, "i/o error: {e}"),
			WriteError::InvalidOperation(reason) => write!(f, "invalid operation: {reason}"),
			WriteError::ArgumentOutOfRange(reason) => write!(f, "argument out of range: {reason}"),
		}
	}
}

impl std::error::Error for WriteError {}
