//! The writer (spec.md §4.E). Walks a graph breadth-first from a root: the root is discovered,
//! queued, and from then on the writer repeatedly pulls the next not-yet-written object off the
//! reference table's queue and writes its header (type-id, stamping it on first sight) and body
//! (its fields, in ascending-name order) — any reference a body mentions is itself queued the
//! moment it is first seen, so sharing and cycles resolve without recursion blowing the stack.
//!
//! Grounded on `raw/assembly.rs`'s instrumented top-level entry points for the `tracing` usage,
//! and on `schema/type.rs::TypePool`'s lazy, first-sight-wins population for the write-once
//! type/object tables.

use std::io::{BufWriter, Write};

use derivative::Derivative;
use tracing::instrument;

use crate::collection::{self, CollectionKind};
use crate::config::{ReferencePreservation, SessionOptions};
use crate::descriptor::{FieldKind, WriterTypeTable};
use crate::error::WriteError;
use crate::ids::ObjectId;
use crate::primitive;
use crate::reftable::WriterRefTable;
use crate::surrogate::{SurrogateTable, WriteSurrogate};
use crate::value::{Field, GraphRef};

enum Sink<W: Write> {
	Direct(W),
	Buffered(BufWriter<W>),
}

impl<W: Write> Write for Sink<W> {
	fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
		match self {
			Sink::Direct(w) => w.write(buf),
			Sink::Buffered(w) => w.write(buf),
		}
	}

	fn flush(&mut self) -> std::io::Result<()> {
		match self {
			Sink::Direct(w) => w.flush(),
			Sink::Buffered(w) => w.flush(),
		}
	}
}

/// A null object-id sentinel for reference sites: the wire value is the real id plus one, so
/// that zero is free to mean "no object" without colliding with [`crate::ids::ROOT_OBJECT_ID`].
fn write_ref_site<W: Write>(w: &mut W, id: Option<ObjectId>) -> std::io::Result<()> {
	match id {
		None => primitive::write_uvarint(w, 0),
		Some(id) => primitive::write_uvarint(w, id.0 as u64 + 1),
	}
}

/// Writes a stream of reference-typed objects and their transitive closure (spec.md §4.E).
/// Reference and type tables persist across calls to [`ObjectWriter::write_object`], so values
/// shared across consecutive writes still deduplicate.
///
/// `Debug` is hand-narrowed (`derivative`, in the teacher's `schema/type.rs::Type` style): the
/// sink, reference table, and surrogate registry hold trait objects and an arbitrary `W` with no
/// useful or even available `Debug` impl, so they are skipped rather than forcing a `W: Debug`
/// bound onto every caller of this type.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct ObjectWriter<W: Write> {
	#[derivative(Debug = "ignore")]
	sink: Sink<W>,
	options: SessionOptions,
	#[derivative(Debug = "ignore")]
	ref_table: WriterRefTable,
	type_table: WriterTypeTable,
	#[derivative(Debug = "ignore")]
	surrogates: SurrogateTable<Box<dyn WriteSurrogate>>,
	/// spec.md §9 open question, decided in DESIGN.md: with type stamping disabled there is no
	/// per-object type channel at all, so the writer holds the graph to the first type it ever
	/// saw rather than silently letting a heterogeneous graph corrupt a reader that assumes one
	/// declared type throughout.
	homogeneous_type: Option<&'static str>,
}

impl<W: Write> ObjectWriter<W> {
	pub fn new(writer: W, options: SessionOptions) -> Self {
		let sink = if options.use_buffering { Sink::Buffered(BufWriter::new(writer)) } else { Sink::Direct(writer) };
		let use_weak = options.reference_preservation == ReferencePreservation::UseWeakReference;
		Self {
			sink,
			options,
			ref_table: WriterRefTable::with_weak_references(use_weak),
			type_table: WriterTypeTable::new(),
			surrogates: SurrogateTable::new(),
			homogeneous_type: None,
		}
	}

	/// Registers a surrogate consulted ahead of an object's own `GraphObject` implementation.
	/// Fails once this writer has already written its first object (spec.md §4.D).
	pub fn register_surrogate(&mut self, surrogate: Box<dyn WriteSurrogate>) -> Result<(), WriteError> {
		self.surrogates.register(surrogate)
	}

	/// Explicitly opts `type_name` out of substitution, blocking it from inheriting a base
	/// type's registered surrogate (spec.md §4.D rule 4).
	pub fn register_no_surrogate(&mut self, type_name: &'static str) -> Result<(), WriteError> {
		self.surrogates.register_none(type_name)
	}

	/// Writes `root` and its full transitive closure of not-yet-seen references.
	#[instrument(level = "trace", skip(self, root))]
	pub fn write_object(&mut self, root: &GraphRef) -> Result<(), WriteError> {
		let (_, _) = self.ref_table.assign_or_fetch(root);
		while let Some((id, obj)) = self.ref_table.take_next_unwritten() {
			// `None` only arises under `ReferencePreservation::UseWeakReference`: the caller
			// let go of every strong handle to an object between it being discovered and the
			// writer reaching it in the queue. There is no value left to write.
			let obj = obj.ok_or(WriteError::InvalidOperation(
				"a weakly-referenced object was dropped before the writer could serialize it",
			))?;
			self.write_body(id, &obj)?;
		}
		Ok(())
	}

	fn write_body(&mut self, id: ObjectId, obj: &GraphRef) -> Result<(), WriteError> {
		let _ = id;
		let borrowed = obj.borrow();
		borrowed.dyn_on_pre_serialize();
		let schema = borrowed.dyn_schema();

		// SPEC_FULL.md "Built-in surrogates": a legacy/XML contract is checked ahead of the
		// general surrogate registry, since it applies by trait capability rather than by a
		// registered type name. Either is stamped with a dedicated synthetic schema
		// (`value::legacy_bag_schema`/`xml_bag_schema`) rather than the wrapped type's own — the
		// bag's shape has nothing to do with the concrete type's declared fields, so reusing that
		// schema would demand a field literally named "data"/"xml" of the right kind to exist.
		// Reference sites still stamp the real type (`write_object_ref`), so shells keep
		// resolving by the object's actual type name.
		let legacy_bag = self.options.support_legacy_contracts.then(|| borrowed.dyn_as_legacy_contract()).flatten().map(|lc| lc.get_object_data());
		let xml_text = (legacy_bag.is_none())
			.then(|| self.options.support_legacy_contracts.then(|| borrowed.dyn_as_xml_contract()).flatten())
			.flatten()
			.map(|xc| xc.write_xml());

		let (effective_schema, body_fields): (&'static crate::descriptor::TypeSchema, Vec<(String, Field)>) = if let Some(bag) = legacy_bag {
			(crate::value::legacy_bag_schema(), vec![("data".to_string(), Field::Bag(bag))])
		} else if let Some(xml) = xml_text {
			(crate::value::xml_bag_schema(), vec![("xml".to_string(), Field::String(xml))])
		} else {
			let bases: Vec<&str> = schema.bases.iter().map(|b| b.name).collect();
			let substitute = self.surrogates.find(schema.type_name, &bases).map(|s| s.substitute(obj));
			let fields = substitute.unwrap_or_else(|| borrowed.dyn_get_fields());
			(schema, fields.into_iter().map(|(name, value)| (name.to_string(), value)).collect())
		};

		if self.options.disable_type_stamping {
			match self.homogeneous_type {
				None => self.homogeneous_type = Some(effective_schema.type_name),
				Some(expected) if expected != effective_schema.type_name => {
					return Err(WriteError::InvalidOperation(
						"graph contains more than one runtime type but type stamping is disabled",
					));
				},
				Some(_) => {},
			}
		}
		drop(borrowed);

		if !self.options.disable_type_stamping {
			self.type_table.write_type_header(&mut self.sink, effective_schema)?;
		}

		self.write_fields(effective_schema, body_fields)?;

		obj.borrow().dyn_on_post_serialize();
		Ok(())
	}

	/// Writes field values in ascending-name order, matching the order the stamp records them in.
	fn write_fields(&mut self, schema: &'static crate::descriptor::TypeSchema, fields: Vec<(String, Field)>) -> Result<(), WriteError> {
		for descriptor in schema.sorted_fields() {
			let value = fields
				.iter()
				.find(|(name, _)| name == descriptor.name)
				.map(|(_, v)| v)
				.ok_or(WriteError::InvalidOperation("fields did not provide a declared field"))?;
			self.write_field(&descriptor.kind, value)?;
		}
		Ok(())
	}

	fn write_field(&mut self, kind: &FieldKind, value: &Field) -> Result<(), WriteError> {
		match (kind, value) {
			(FieldKind::Primitive(_), Field::Bool(v)) => primitive::write_bool(&mut self.sink, *v).map_err(Into::into),
			(FieldKind::Primitive(_), Field::I8(v)) => self.sink.write_all(&v.to_le_bytes()).map_err(Into::into),
			(FieldKind::Primitive(_), Field::U8(v)) => self.sink.write_all(&v.to_le_bytes()).map_err(Into::into),
			(FieldKind::Primitive(_), Field::I16(v)) => primitive::write_ivarint(&mut self.sink, *v as i64).map_err(Into::into),
			(FieldKind::Primitive(_), Field::U16(v)) => primitive::write_uvarint(&mut self.sink, *v as u64).map_err(Into::into),
			(FieldKind::Primitive(_), Field::I32(v)) => primitive::write_ivarint(&mut self.sink, *v as i64).map_err(Into::into),
			(FieldKind::Primitive(_), Field::U32(v)) => primitive::write_uvarint(&mut self.sink, *v as u64).map_err(Into::into),
			(FieldKind::Primitive(_), Field::I64(v)) => primitive::write_ivarint(&mut self.sink, *v).map_err(Into::into),
			(FieldKind::Primitive(_), Field::U64(v)) => primitive::write_uvarint(&mut self.sink, *v).map_err(Into::into),
			(FieldKind::Primitive(_), Field::F32(v)) => primitive::write_f32(&mut self.sink, *v).map_err(Into::into),
			(FieldKind::Primitive(_), Field::F64(v)) => primitive::write_f64(&mut self.sink, *v).map_err(Into::into),
			(FieldKind::Primitive(_), Field::String(v)) => primitive::write_string(&mut self.sink, Some(v)).map_err(Into::into),
			(FieldKind::Primitive(_), Field::Bytes(v)) => primitive::write_bytes(&mut self.sink, Some(v)).map_err(Into::into),
			(FieldKind::Primitive(_), Field::DateTime(ticks, kind)) => primitive::write_datetime(&mut self.sink, *ticks, *kind).map_err(Into::into),
			(FieldKind::Primitive(_), Field::Decimal(bytes)) => primitive::write_decimal(&mut self.sink, *bytes).map_err(Into::into),

			(FieldKind::Object(_), Field::Ref(r)) => self.write_object_ref(r, false),
			(FieldKind::Object(_), Field::Null) => self.write_object_ref(&None, false),
			(FieldKind::Dynamic, Field::Ref(r)) => self.write_object_ref(r, true),
			(FieldKind::Dynamic, Field::Null) => self.write_object_ref(&None, true),

			(FieldKind::Sequence(inner), Field::Sequence(items)) => self.write_collection(CollectionKind::Sequence, inner, items),
			(FieldKind::Set(inner), Field::Set(items)) => self.write_collection(CollectionKind::Set, inner, items),
			(FieldKind::Mapping(key_kind, value_kind), Field::Mapping(entries)) => {
				collection::write_preamble(&mut self.sink, CollectionKind::Mapping, entries.len())?;
				for (k, v) in entries {
					self.write_field(key_kind, k)?;
					self.write_field(value_kind, v)?;
				}
				Ok(())
			},
			(FieldKind::Delegate, Field::Delegate(slots)) => {
				primitive::write_uvarint(&mut self.sink, slots.len() as u64)?;
				for (target, method) in slots {
					self.write_object_ref(target, true)?;
					primitive::write_string(&mut self.sink, Some(method))?;
				}
				Ok(())
			},
			(FieldKind::Bag, Field::Bag(entries)) => self.write_bag(entries),

			_ => Err(WriteError::InvalidOperation("field value did not match its declared kind")),
		}
	}

	/// Writes a [`Field::Bag`]: a count, then each entry as (name, self-describing kind, value).
	/// Unlike [`Self::write_fields`], there is no declared schema to walk in order — the bag's
	/// own entries, in whatever order the contract produced them, are the order of record.
	fn write_bag(&mut self, entries: &[(String, Field)]) -> Result<(), WriteError> {
		primitive::write_uvarint(&mut self.sink, entries.len() as u64)?;
		for (name, value) in entries {
			primitive::write_string(&mut self.sink, Some(name))?;
			let kind = crate::value::runtime_field_kind(value);
			kind.wire_write(&mut self.sink)?;
			self.write_field(&kind, value)?;
		}
		Ok(())
	}

	fn write_collection(&mut self, kind: CollectionKind, inner: &FieldKind, items: &[Field]) -> Result<(), WriteError> {
		collection::write_preamble(&mut self.sink, kind, items.len())?;
		for item in items {
			self.write_field(inner, item)?;
		}
		Ok(())
	}

	/// A reference site: object-id first (with a null sentinel, so nullity is always
	/// unambiguous before anything else is decoded), then — whenever type stamping is enabled and
	/// the reference is non-null — the *actual runtime* type header of the referenced object, not
	/// the field's statically declared type. spec.md:100 ("If the field is a reference... emit the
	/// target's type-id") is unconditional on the field being `Dynamic`; a statically `Object`-typed
	/// field can still point at a subtype with its own schema (the object's body is always stamped
	/// under its own `dyn_schema()`, never the field's declared one — see `write_body`), so the
	/// reference site has to carry the same type-id the reader will need to allocate the right
	/// shell, exactly as a `Dynamic` field already does. `requires_stamping` distinguishes only the
	/// fallback when type stamping is disabled entirely: a `Dynamic` field has no declared type name
	/// to fall back to and must reject outright, while an `Object` field can still fall back to
	/// trusting its statically declared name (the writer's `homogeneous_type` check already rejects
	/// any graph that would make that fallback ambiguous).
	fn write_object_ref(&mut self, value: &Option<GraphRef>, requires_stamping: bool) -> Result<(), WriteError> {
		match value {
			None => write_ref_site(&mut self.sink, None).map_err(Into::into),
			Some(obj) => {
				let (id, is_new) = self.ref_table.assign_or_fetch(obj);
				// spec.md §9 open question, decided in DESIGN.md: `DoNotPreserve` has no id
				// system capable of expressing a repeat reference, so a shared or cyclic
				// reference under that mode is rejected instead of being silently re-inlined
				// (which, for a cycle, is exactly what made the original implementation
				// overflow its stack).
				if !is_new && self.options.reference_preservation == ReferencePreservation::DoNotPreserve {
					return Err(WriteError::InvalidOperation(
						"reference preservation is disabled but the graph contains a shared or cyclic reference",
					));
				}
				write_ref_site(&mut self.sink, Some(id))?;
				if self.options.disable_type_stamping {
					if requires_stamping {
						return Err(WriteError::InvalidOperation("dynamic-typed fields require type stamping to be enabled"));
					}
				} else {
					let schema = obj.borrow().dyn_schema();
					self.type_table.write_type_header(&mut self.sink, schema)?;
				}
				Ok(())
			},
		}
	}

	pub fn flush(&mut self) -> Result<(), WriteError> {
		self.sink.flush().map_err(Into::into)
	}

	/// Swaps in a new underlying stream, preserving the reference and type tables so that
	/// values already written to a previous stream still deduplicate (spec.md §4.E).
	pub fn reuse_with_new_stream(&mut self, writer: W) -> W {
		let new_sink = if self.options.use_buffering { Sink::Buffered(BufWriter::new(writer)) } else { Sink::Direct(writer) };
		match std::mem::replace(&mut self.sink, new_sink) {
			Sink::Direct(w) => w,
			Sink::Buffered(w) => {
				let (inner, pending) = w.into_parts();
				if pending.is_ok_and(|buf| !buf.is_empty()) {
					tracing::warn!("reuse_with_new_stream dropped unflushed buffered bytes; call flush() first");
				}
				inner
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::descriptor::{FieldDescriptor, PrimitiveKind, TypeSchema};
	use crate::value::GraphObject;
	use std::cell::RefCell;
	use std::rc::Rc;

	#[derive(Default)]
	struct Leaf {
		value: i32,
	}

	impl GraphObject for Leaf {
		fn schema(&self) -> &'static TypeSchema {
			static FIELDS: &[FieldDescriptor] =
				&[FieldDescriptor { name: "value", declaring_type: "Leaf", kind: FieldKind::Primitive(PrimitiveKind::I32) }];
			static SCHEMA: TypeSchema = TypeSchema { type_name: "Leaf", module: uuid::Uuid::nil(), bases: &[], fields: FIELDS };
			&SCHEMA
		}
		fn get_fields(&self) -> Vec<(&'static str, Field)> {
			vec![("value", Field::I32(self.value))]
		}
		fn shell() -> Self {
			Self::default()
		}
		fn set_field(&mut self, name: &str, value: Field) {
			if name == "value" {
				if let Field::I32(v) = value {
					self.value = v;
				}
			}
		}
	}

	fn sink_len<W: Write>(writer: &ObjectWriter<W>) -> usize
	where
		W: AsRef<[u8]>,
	{
		match &writer.sink {
			Sink::Direct(w) => w.as_ref().len(),
			Sink::Buffered(_) => unreachable!("tests do not enable buffering"),
		}
	}

	#[test]
	fn writing_a_leaf_emits_non_empty_bytes() {
		let leaf: GraphRef = Rc::new(RefCell::new(Leaf { value: 42 }));
		let mut writer = ObjectWriter::new(Vec::new(), SessionOptions::default());
		writer.write_object(&leaf).unwrap();
		assert!(sink_len(&writer) > 0);
	}

	#[test]
	fn sharing_the_same_rc_writes_the_object_body_only_once() {
		let leaf: GraphRef = Rc::new(RefCell::new(Leaf { value: 1 }));
		let mut writer = ObjectWriter::new(Vec::new(), SessionOptions::default());
		writer.write_object(&leaf).unwrap();
		let first_len = sink_len(&writer);
		writer.write_object(&leaf).unwrap();
		let second_len = sink_len(&writer);
		assert_eq!(first_len, second_len, "re-writing the same object must not append any new bytes");
	}

	#[derive(Default)]
	struct Node {
		next: Option<GraphRef>,
	}

	impl GraphObject for Node {
		fn schema(&self) -> &'static TypeSchema {
			static FIELDS: &[FieldDescriptor] =
				&[FieldDescriptor { name: "next", declaring_type: "Node", kind: FieldKind::Object(std::borrow::Cow::Borrowed("Node")) }];
			static SCHEMA: TypeSchema = TypeSchema { type_name: "Node", module: uuid::Uuid::nil(), bases: &[], fields: FIELDS };
			&SCHEMA
		}
		fn get_fields(&self) -> Vec<(&'static str, Field)> {
			vec![("next", Field::Ref(self.next.clone()))]
		}
		fn shell() -> Self {
			Self::default()
		}
		fn set_field(&mut self, name: &str, value: Field) {
			if name == "next" {
				if let Field::Ref(r) = value {
					self.next = r;
				}
			}
		}
	}

	#[test]
	fn do_not_preserve_rejects_a_cycle_instead_of_overflowing() {
		let a: GraphRef = Rc::new(RefCell::new(Node::default()));
		let b: GraphRef = Rc::new(RefCell::new(Node { next: Some(a.clone()) }));
		a.borrow_mut().next = Some(b.clone());

		let options = SessionOptions { reference_preservation: crate::config::ReferencePreservation::DoNotPreserve, ..SessionOptions::default() };
		let mut writer = ObjectWriter::new(Vec::new(), options);
		let err = writer.write_object(&a).unwrap_err();
		assert!(matches!(err, WriteError::InvalidOperation(_)));
	}

	#[test]
	fn heterogeneous_graph_is_rejected_when_type_stamping_is_disabled() {
		#[derive(Default)]
		struct Other;
		impl GraphObject for Other {
			fn schema(&self) -> &'static TypeSchema {
				static SCHEMA: TypeSchema = TypeSchema { type_name: "Other", module: uuid::Uuid::nil(), bases: &[], fields: &[] };
				&SCHEMA
			}
			fn get_fields(&self) -> Vec<(&'static str, Field)> {
				vec![]
			}
			fn shell() -> Self {
				Self::default()
			}
			fn set_field(&mut self, _name: &str, _value: Field) {}
		}

		let options = SessionOptions { disable_type_stamping: true, ..SessionOptions::default() };
		let mut writer = ObjectWriter::new(Vec::new(), options);
		let leaf: GraphRef = Rc::new(RefCell::new(Leaf { value: 1 }));
		let other: GraphRef = Rc::new(RefCell::new(Other));
		writer.write_object(&leaf).unwrap();
		let err = writer.write_object(&other).unwrap_err();
		assert!(matches!(err, WriteError::InvalidOperation(_)));
	}
}
