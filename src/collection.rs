//! Collection framing (spec.md §4.H). A collection field is written as a kind tag, an element
//! (or key/value) count, and then the elements themselves — the element codec lives in
//! `writer.rs`/`reader.rs` since encoding a [`crate::value::Field`] can recurse into references,
//! which only those modules have the context (reference table, type table) to resolve.
//!
//! Grounded on the `gob-rs` port's slice/map framing (`other_examples/.../src-writer.rs.rs`),
//! adapted from its `Value` enum to this crate's `Field` enum.

use std::io::{Read, Write};

use crate::error::ReadError;
use crate::primitive::{read_uvarint, write_uvarint};

/// The three collection shapes spec.md §4.H distinguishes. `Set` is wire-identical to
/// `Sequence` (a length-prefixed run of elements) but is kept distinct so
/// [`crate::descriptor::FieldKind`] round-trips without ambiguity and so a future reader could
/// special-case set semantics (deduplication, order-independence) without a wire change.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CollectionKind {
	Sequence,
	Mapping,
	Set,
}

impl CollectionKind {
	fn wire_tag(self) -> u8 {
		match self {
			CollectionKind::Sequence => 0,
			CollectionKind::Mapping => 1,
			CollectionKind::Set => 2,
		}
	}

	fn from_wire_tag(tag: u8) -> Result<Self, ReadError> {
		match tag {
			0 => Ok(CollectionKind::Sequence),
			1 => Ok(CollectionKind::Mapping),
			2 => Ok(CollectionKind::Set),
			_ => Err(ReadError::StreamCorrupted("unknown collection kind tag")),
		}
	}
}

/// An upper bound on element counts accepted on read, purely as a sanity backstop against a
/// corrupted or adversarial length prefix causing an unbounded allocation before the stream is
/// even validated further.
const MAX_ELEMENT_COUNT: u64 = 64 * 1024 * 1024;

pub fn write_preamble<W: Write>(w: &mut W, kind: CollectionKind, len: usize) -> std::io::Result<()> {
	w.write_all(&[kind.wire_tag()])?;
	write_uvarint(w, len as u64)
}

/// Reads the kind tag and element count, checking the count against [`MAX_ELEMENT_COUNT`].
/// `expected` (when given) additionally checks the tag matches the field's declared kind,
/// surfacing a `TypeStructureChanged`-adjacent mismatch as plain stream corruption instead of
/// silently reinterpreting the payload as a different shape.
pub fn read_preamble<R: Read>(r: &mut R, expected: Option<CollectionKind>) -> Result<(CollectionKind, usize), ReadError> {
	let mut tag = [0u8; 1];
	r.read_exact(&mut tag)?;
	let kind = CollectionKind::from_wire_tag(tag[0])?;
	if let Some(expected) = expected {
		if expected != kind {
			return Err(ReadError::StreamCorrupted("collection kind tag did not match the declared field kind"));
		}
	}
	let len = read_uvarint(r)?;
	if len > MAX_ELEMENT_COUNT {
		return Err(ReadError::StreamCorrupted("collection element count exceeds the sanity bound"));
	}
	Ok((kind, len as usize))
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Cursor;

	#[test]
	fn preamble_round_trips() {
		let mut buf = Vec::new();
		write_preamble(&mut buf, CollectionKind::Mapping, 3).unwrap();
		let mut cursor = Cursor::new(buf);
		let (kind, len) = read_preamble(&mut cursor, None).unwrap();
		assert_eq!(kind, CollectionKind::Mapping);
		assert_eq!(len, 3);
	}

	#[test]
	fn mismatched_expected_kind_is_rejected() {
		let mut buf = Vec::new();
		write_preamble(&mut buf, CollectionKind::Sequence, 0).unwrap();
		let mut cursor = Cursor::new(buf);
		assert!(matches!(
			read_preamble(&mut cursor, Some(CollectionKind::Set)),
			Err(ReadError::StreamCorrupted(_))
		));
	}

	#[test]
	fn absurd_length_is_rejected_before_allocation() {
		let mut buf = Vec::new();
		buf.push(CollectionKind::Sequence.wire_tag());
		write_uvarint(&mut buf, MAX_ELEMENT_COUNT + 1).unwrap();
		let mut cursor = Cursor::new(buf);
		assert!(matches!(read_preamble(&mut cursor, None), Err(ReadError::StreamCorrupted(_))));
	}
}
