//! Session façade (spec.md §4.G / §6). Wires the fixed stream header and optional metadata block
//! around [`ObjectWriter`]/[`ObjectReader`], translating header and metadata failures into the
//! discriminated error set spec.md §7 names, in both one-shot and open-stream shapes.
//!
//! Grounded on `raw/assembly.rs`'s magic-and-version header check for the header validation
//! shape, and on `schema/errors.rs` for keeping error classification a thin translation layer
//! rather than embedding it in the reader/writer themselves.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::rc::Rc;

use tracing::{instrument, warn};

use crate::config::{ReferencePreservation, SerializationMethod, SessionOptions};
use crate::error::{ReadError, WriteError};
use crate::primitive;
use crate::reader::ObjectReader;
use crate::value::{GraphObject, GraphRef, TypeRegistry};
use crate::writer::ObjectWriter;

const MAGIC: [u8; 3] = [0x32, 0x66, 0x34];
const VERSION: u8 = 9;
const MAX_METADATA_LEN: usize = 255;

/// Wraps a `Read` so that a metadata-block parse attempt which turns out invalid can push its
/// bytes back for the body reader to see next, implementing spec.md §6's "rewind the stream
/// position" behaviour without requiring the underlying reader to be `Seek`.
pub struct PushbackReader<R: Read> {
	inner: R,
	pending: VecDeque<u8>,
}

impl<R: Read> PushbackReader<R> {
	fn new(inner: R) -> Self {
		Self { inner, pending: VecDeque::new() }
	}

	fn push_back(&mut self, bytes: &[u8]) {
		for &b in bytes.iter().rev() {
			self.pending.push_front(b);
		}
	}
}

impl<R: Read> Read for PushbackReader<R> {
	fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
		if self.pending.is_empty() {
			return self.inner.read(buf);
		}
		let mut n = 0;
		while n < buf.len() {
			match self.pending.pop_front() {
				Some(b) => {
					buf[n] = b;
					n += 1;
				},
				None => break,
			}
		}
		Ok(n)
	}
}

/// Counts bytes as they pass through, implementing spec.md §8's byte-conservation property
/// ("after serialize, `s.position` equals bytes subsequently consumed by `deserialize(s)`; a
/// session asserts this and raises `InvalidOperation` on mismatch") without requiring `Seek`.
/// Scoped to [`Session::serialize`]/[`Session::deserialize`] only — the low-level
/// `ObjectWriter`/`ObjectReader` and the open-stream handles make no such per-call promise, so
/// wrapping them here would assert a property that isn't actually being claimed.
struct CountingWriter<W: Write> {
	inner: W,
	count: u64,
}

impl<W: Write> CountingWriter<W> {
	fn new(inner: W) -> Self {
		Self { inner, count: 0 }
	}
}

impl<W: Write> Write for CountingWriter<W> {
	fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
		let n = self.inner.write(buf)?;
		self.count += n as u64;
		Ok(n)
	}

	fn flush(&mut self) -> std::io::Result<()> {
		self.inner.flush()
	}
}

/// The read-side mirror of [`CountingWriter`].
struct CountingReader<R: Read> {
	inner: R,
	count: u64,
}

impl<R: Read> CountingReader<R> {
	fn new(inner: R) -> Self {
		Self { inner, count: 0 }
	}
}

impl<R: Read> Read for CountingReader<R> {
	fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
		let n = self.inner.read(buf)?;
		self.count += n as u64;
		Ok(n)
	}
}

/// Reads a single byte, reporting a clean end-of-stream as `Ok(None)` rather than an error —
/// unlike `read_exact`, whose contract leaves a partially filled buffer unspecified on failure,
/// this gives metadata parsing exact control over which bytes it actually consumed so it can
/// push them back verbatim.
fn read_one<R: Read>(r: &mut R) -> std::io::Result<Option<u8>> {
	let mut b = [0u8; 1];
	loop {
		return match r.read(&mut b) {
			Ok(0) => Ok(None),
			Ok(_) => Ok(Some(b[0])),
			Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
			Err(e) => Err(e),
		};
	}
}

/// Attempts to parse the optional metadata block (spec.md §6). Any invalidity — a declared
/// length of 0, truncation before the declared length and checksum are reached, or a checksum
/// mismatch — pushes the bytes already consumed back onto `source` and reports absence, per
/// spec.md §9's documented rewind-on-absent behaviour (deliberately indistinguishable from a
/// body that happens to start with the same bytes; see DESIGN.md).
fn read_metadata<R: Read>(source: &mut PushbackReader<R>) -> Result<Option<Vec<u8>>, ReadError> {
	let mut consumed = Vec::new();
	let len_byte = match read_one(source)? {
		None => return Ok(None),
		Some(b) => b,
	};
	consumed.push(len_byte);
	if len_byte == 0 {
		source.push_back(&consumed);
		return Ok(None);
	}

	let mut payload = Vec::with_capacity(len_byte as usize);
	for _ in 0..len_byte {
		match read_one(source)? {
			None => {
				source.push_back(&consumed);
				return Ok(None);
			},
			Some(b) => {
				payload.push(b);
				consumed.push(b);
			},
		}
	}

	let checksum = match read_one(source)? {
		None => {
			source.push_back(&consumed);
			return Ok(None);
		},
		Some(b) => b,
	};
	consumed.push(checksum);

	if payload.iter().fold(0u8, |acc, b| acc ^ b) != checksum {
		source.push_back(&consumed);
		return Ok(None);
	}
	Ok(Some(payload))
}

fn write_metadata<W: Write>(w: &mut W, metadata: Option<&[u8]>) -> Result<(), WriteError> {
	let Some(bytes) = metadata else { return Ok(()) };
	if bytes.is_empty() || bytes.len() > MAX_METADATA_LEN {
		return Err(WriteError::ArgumentOutOfRange("metadata must be between 1 and 255 bytes"));
	}
	w.write_all(&[bytes.len() as u8])?;
	w.write_all(bytes)?;
	w.write_all(&[bytes.iter().fold(0u8, |acc, b| acc ^ b)])?;
	Ok(())
}

fn write_header<W: Write>(w: &mut W, options: &SessionOptions) -> Result<(), WriteError> {
	let refs_preserved = options.reference_preservation != ReferencePreservation::DoNotPreserve;
	w.write_all(&MAGIC)?;
	w.write_all(&[VERSION, refs_preserved as u8, !options.disable_type_stamping as u8])?;
	Ok(())
}

fn read_and_validate_header<R: Read>(r: &mut R, options: &SessionOptions) -> Result<(), ReadError> {
	let mut header = [0u8; 6];
	r.read_exact(&mut header)?;

	if header[0..3] != MAGIC {
		warn!("stream does not begin with the fathom magic");
		return Err(ReadError::WrongMagic);
	}
	if header[3] != VERSION {
		warn!(found = header[3], expected = VERSION, "stream version mismatch");
		return Err(ReadError::WrongVersion { expected: VERSION, found: header[3] });
	}

	let stream_refs_preserved = header[4] != 0;
	let expected_refs_preserved = options.reference_preservation != ReferencePreservation::DoNotPreserve;
	if stream_refs_preserved != expected_refs_preserved {
		warn!("stream reference-preservation flag does not match session configuration");
		return Err(ReadError::WrongStreamConfiguration { reason: "reference-preservation flag does not match session configuration" });
	}

	let stream_type_stamping_enabled = header[5] != 0;
	if stream_type_stamping_enabled == options.disable_type_stamping {
		warn!("stream type-stamping flag does not match session configuration");
		return Err(ReadError::WrongStreamConfiguration { reason: "type-stamping flag does not match session configuration" });
	}

	Ok(())
}

/// The user-facing entry point (spec.md §4.G). Captures [`SessionOptions`] at construction; a
/// session's options never change afterward.
#[derive(Clone)]
pub struct Session {
	options: SessionOptions,
}

impl Session {
	/// Rejects [`crate::config::SerializationMethod::Generated`] up front with `InvalidOperation`
	/// (SPEC_FULL.md "Configuration surface": the config type names the generated-code-generation
	/// back-end so callers get a clear error instead of a silent fallback to reflection).
	pub fn new(options: SessionOptions) -> Result<Self, WriteError> {
		if options.serialization_method == SerializationMethod::Generated || options.deserialization_method == SerializationMethod::Generated {
			return Err(WriteError::InvalidOperation(
				"SerializationMethod::Generated is not implemented by this crate; use SerializationMethod::Reflection",
			));
		}
		// spec.md §4.B: collections would need their own stamped type identity and a place in
		// the reference table to be treated as objects. `value::Field::Sequence/Mapping/Set` are
		// plain inline values on their owning `GraphObject`, not `GraphRef`s, so there is no
		// stamp or id for them to receive (see DESIGN.md, "Open questions — decisions taken").
		// Recognised so callers asking for it get a clear error rather than a silent no-op.
		if options.treat_collections_as_objects {
			return Err(WriteError::InvalidOperation(
				"treat_collections_as_objects is not implemented by this crate; collections are always framed inline",
			));
		}
		Ok(Self { options })
	}

	pub fn options(&self) -> &SessionOptions {
		&self.options
	}

	/// Closed/one-shot write: header, optional metadata, a single root, then flush. The body is
	/// wrapped in a [`CountingWriter`] and its byte count is appended as a trailing varint — the
	/// write-side half of spec.md §8's byte-conservation property.
	#[instrument(level = "debug", skip(self, root, writer))]
	pub fn serialize<W: Write>(&self, root: &GraphRef, mut writer: W, metadata: Option<&[u8]>) -> Result<(), WriteError> {
		write_header(&mut writer, &self.options)?;
		write_metadata(&mut writer, metadata)?;
		let mut counting = CountingWriter::new(writer);
		let mut object_writer = ObjectWriter::new(&mut counting, self.options.clone());
		object_writer.write_object(root)?;
		object_writer.flush()?;
		let body_bytes = counting.count;
		primitive::write_uvarint(&mut counting, body_bytes)?;
		Ok(())
	}

	/// Closed/one-shot read: header, optional metadata, a single root of declared type `T`.
	///
	/// Returns `Rc<RefCell<T>>` rather than a bare `T`: spec.md's `deserialize<T>(stream) -> T`
	/// signature assumes a language where an arbitrary object graph can be handed back by value,
	/// but a cyclic or shared graph in Rust cannot be un-shared into sole ownership without
	/// either copying the whole graph or breaking its sharing — this is an explicit, documented
	/// deviation (see DESIGN.md), not an oversight.
	#[instrument(level = "debug", skip(self, reader, registry))]
	pub fn deserialize<R, T>(&self, reader: R, registry: TypeRegistry) -> Result<(Rc<RefCell<T>>, Option<Vec<u8>>), ReadError>
	where
		R: Read,
		T: GraphObject + 'static,
	{
		let mut pushback = PushbackReader::new(reader);
		read_and_validate_header(&mut pushback, &self.options)?;
		let metadata = read_metadata(&mut pushback)?;
		let mut counting = CountingReader::new(pushback);
		let mut object_reader = ObjectReader::new(&mut counting, self.options.clone(), registry);
		let root = object_reader.read_root::<T>()?;
		let body_bytes = counting.count;
		let declared = primitive::read_uvarint(&mut counting)?;
		if declared != body_bytes {
			return Err(ReadError::InvalidOperation("internal byte-count mismatch after round-trip"));
		}
		Ok((root, metadata))
	}

	/// Open-stream write handle (spec.md §4.G): header and optional metadata are written once;
	/// the returned [`ObjectWriter`] may then have `write_object` called repeatedly, sharing its
	/// reference and type tables across calls.
	pub fn open_writer<W: Write>(&self, mut writer: W, metadata: Option<&[u8]>) -> Result<ObjectWriter<W>, WriteError> {
		write_header(&mut writer, &self.options)?;
		write_metadata(&mut writer, metadata)?;
		Ok(ObjectWriter::new(writer, self.options.clone()))
	}

	/// Open-stream read handle: header validated and optional metadata consumed once; the
	/// returned [`ObjectReader`] may then have `read_root` called repeatedly.
	pub fn open_reader<R: Read>(&self, reader: R, registry: TypeRegistry) -> Result<(ObjectReader<PushbackReader<R>>, Option<Vec<u8>>), ReadError> {
		let mut pushback = PushbackReader::new(reader);
		read_and_validate_header(&mut pushback, &self.options)?;
		let metadata = read_metadata(&mut pushback)?;
		Ok((ObjectReader::new(pushback, self.options.clone(), registry), metadata))
	}
}
