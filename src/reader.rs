//! The reader (spec.md §4.F). Mirrors `writer.rs`'s queue-driven shape: the root is reserved at
//! [`crate::ids::ROOT_OBJECT_ID`], and the reader then repeatedly pulls the next reserved-but-
//! unpopulated shell off the reference table's queue, reads its type-id (resolving a fresh stamp
//! the first time that type-id is seen) and body, and fills it in place — a forward or back
//! reference to an id not yet populated gets the same shell `Rc`, so cycles resolve without any
//! second pass.
//!
//! Grounded the same way as `writer.rs`: `raw/assembly.rs`'s instrumented top-level read entry
//! points, and `schema/type.rs::TypePool`'s first-sight-wins population for the type table.

use std::borrow::Cow;
use std::cell::RefCell;
use std::io::{BufReader, Read};
use std::rc::Rc;

use derivative::Derivative;
use fxhash::FxHashMap;
use tracing::instrument;

use crate::collection::{self, CollectionKind};
use crate::config::SessionOptions;
use crate::descriptor::{self, FieldKind, FieldMap, FieldPlan, PrimitiveKind, ReaderTypeTable};
use crate::error::ReadError;
use crate::ids::{ObjectId, TypeId};
use crate::primitive;
use crate::reftable::ReaderRefTable;
use crate::surrogate::{ReadSurrogate, SurrogateTable};
use crate::value::{Field, GraphObject, GraphRef, TypeRegistry};

enum Source<R: Read> {
	Direct(R),
	Buffered(BufReader<R>),
}

impl<R: Read> Read for Source<R> {
	fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
		match self {
			Source::Direct(r) => r.read(buf),
			Source::Buffered(r) => r.read(buf),
		}
	}
}

/// A null-object-id reference site, mirroring `writer.rs::write_ref_site`'s `id + 1` encoding.
fn read_ref_site<R: Read>(r: &mut R) -> Result<Option<ObjectId>, ReadError> {
	let raw = primitive::read_uvarint(r)?;
	if raw == 0 {
		return Ok(None);
	}
	Ok(Some(ObjectId((raw - 1) as u32)))
}

fn field_from_ref(value: Option<GraphRef>) -> Field {
	Field::Ref(value)
}

/// Reads a stream of reference-typed objects written by [`crate::writer::ObjectWriter`].
/// Reference, type, and surrogate tables persist across calls to [`ObjectReader::read_root`], so
/// a later root can still resolve a back-reference into an earlier one (spec.md §4.F).
///
/// `Debug` is hand-narrowed the same way as `writer::ObjectWriter` (`derivative`, grounded on
/// `schema/type.rs::Type`'s `#[derivative(Debug="ignore")]`): the source, reference table, type
/// registry, surrogate registry, and per-type field-map cache all either hold trait objects with
/// no `Debug` impl or would otherwise dump the entire decoded graph on one format call.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct ObjectReader<R: Read> {
	#[derivative(Debug = "ignore")]
	source: Source<R>,
	options: SessionOptions,
	#[derivative(Debug = "ignore")]
	ref_table: ReaderRefTable,
	type_table: ReaderTypeTable,
	#[derivative(Debug = "ignore")]
	registry: TypeRegistry,
	#[derivative(Debug = "ignore")]
	surrogates: SurrogateTable<Box<dyn ReadSurrogate>>,
	#[derivative(Debug = "ignore")]
	field_maps: FxHashMap<TypeId, FieldMap>,
	/// Mirrors `ObjectWriter::homogeneous_type` for the `disable_type_stamping` open question
	/// (spec.md §9, decided in DESIGN.md): the first local type seen pins the whole stream.
	homogeneous_type: Option<&'static str>,
}

impl<R: Read> ObjectReader<R> {
	pub fn new(reader: R, options: SessionOptions, registry: TypeRegistry) -> Self {
		let source = if options.use_buffering { Source::Buffered(BufReader::new(reader)) } else { Source::Direct(reader) };
		Self {
			source,
			options,
			ref_table: ReaderRefTable::new(),
			type_table: ReaderTypeTable::new(),
			registry,
			surrogates: SurrogateTable::new(),
			field_maps: FxHashMap::default(),
			homogeneous_type: None,
		}
	}

	/// Registers a surrogate consulted ahead of an object's own `GraphObject::set_field`. Fails
	/// once this reader has already read its first object (spec.md §4.D).
	pub fn register_surrogate(&mut self, surrogate: Box<dyn ReadSurrogate>) -> Result<(), ReadError> {
		self.surrogates.register(surrogate)
	}

	/// Explicitly opts `type_name` out of substitution, blocking it from inheriting a base
	/// type's registered surrogate (spec.md §4.D rule 4).
	pub fn register_no_surrogate(&mut self, type_name: &'static str) -> Result<(), ReadError> {
		self.surrogates.register_none(type_name)
	}

	/// Decodes exactly one root of declared type `T`, using the reference/type tables built up
	/// by any prior call on this reader (spec.md §4.F).
	#[instrument(level = "trace", skip(self))]
	pub fn read_root<T>(&mut self) -> Result<Rc<RefCell<T>>, ReadError>
	where
		T: GraphObject + 'static,
	{
		let typed: Rc<RefCell<T>> = Rc::new(RefCell::new(T::shell()));
		let erased: GraphRef = typed.clone();
		let root_id = self.ref_table.reserve_next(erased);
		let completed = self.drain_queue(root_id)?;
		for obj in completed {
			obj.borrow_mut().dyn_on_post_deserialize();
		}
		Ok(typed)
	}

	/// Drains every shell reserved but not yet populated, in id order, returning them (also in
	/// id order) so the caller can fire post-deserialization hooks only once every object in
	/// this call's closure has its final field values (spec.md §4.F step 5).
	fn drain_queue(&mut self, _root_id: ObjectId) -> Result<Vec<GraphRef>, ReadError> {
		let mut completed = Vec::new();
		while let Some((id, obj)) = self.ref_table.take_next_unpopulated() {
			self.read_body(id, &obj)?;
			completed.push(obj);
		}
		Ok(completed)
	}

	fn read_body(&mut self, _id: ObjectId, obj: &GraphRef) -> Result<(), ReadError> {
		let local_schema = obj.borrow().dyn_schema();

		// SPEC_FULL.md "Built-in surrogates": mirrors `writer.rs::write_body` — a legacy/XML
		// contract is stamped with a dedicated synthetic schema rather than the wrapped type's
		// own, so reconciliation is driven off that schema instead of `local_schema` whenever it
		// applies. The reference site (`read_object_ref`) still resolves shells by the real type
		// name, independent of this.
		let legacy_applies = self.options.support_legacy_contracts && obj.borrow().dyn_as_legacy_contract().is_some();
		let xml_applies = !legacy_applies && self.options.support_legacy_contracts && obj.borrow().dyn_as_xml_contract().is_some();
		let effective_schema =
			if legacy_applies { crate::value::legacy_bag_schema() } else if xml_applies { crate::value::xml_bag_schema() } else { local_schema };

		if self.options.disable_type_stamping {
			match self.homogeneous_type {
				None => self.homogeneous_type = Some(effective_schema.type_name),
				Some(expected) if expected != effective_schema.type_name => {
					return Err(ReadError::InvalidOperation(
						"graph contains more than one runtime type but type stamping is disabled",
					));
				},
				Some(_) => {},
			}
			let plans = effective_schema
				.sorted_fields()
				.iter()
				.map(|f| FieldPlan::ReadLocal { local_name: f.name, stream_kind: f.kind.clone(), local_kind: f.kind.clone() })
				.collect();
			let decoded = self.decode_fields(&FieldMap { plans })?;
			return self.apply_decoded_fields(obj, decoded, legacy_applies, xml_applies);
		}

		let raw_type_id = primitive::read_uvarint(&mut self.source)?;
		if raw_type_id == 0 {
			return Err(ReadError::StreamCorrupted("object body is missing its type id"));
		}
		let type_id = TypeId(raw_type_id as u32);
		let stream_type = self.type_table.resolve_or_read(&mut self.source, type_id)?.clone();

		if !self.field_maps.contains_key(&type_id) {
			let map = descriptor::reconcile(&stream_type, effective_schema, self.options.version_tolerance, self.options.force_stamp_verification)?;
			self.field_maps.insert(type_id, map);
		}
		let field_map = self.field_maps.get(&type_id).expect("just inserted").clone();
		let decoded = self.decode_fields(&field_map)?;
		self.apply_decoded_fields(obj, decoded, legacy_applies, xml_applies)
	}

	fn decode_fields(&mut self, field_map: &FieldMap) -> Result<Vec<(&'static str, Field)>, ReadError> {
		let mut decoded: Vec<(&'static str, Field)> = Vec::with_capacity(field_map.plans.len());
		for plan in &field_map.plans {
			match plan {
				FieldPlan::ReadLocal { local_name, stream_kind, local_kind } => {
					let value = self.read_field(stream_kind)?;
					decoded.push((local_name, coerce_primitive(value, local_kind)));
				},
				FieldPlan::Skip { stream_kind } => {
					self.skip_field(stream_kind)?;
				},
				FieldPlan::DefaultInit { .. } => {},
			}
		}
		Ok(decoded)
	}

	/// Dispatches decoded fields to their destination: a legacy/XML contract's own setter (the
	/// bag's single entry), a restoring surrogate, or plain `GraphObject::set_field` calls.
	fn apply_decoded_fields(
		&mut self, obj: &GraphRef, decoded: Vec<(&'static str, Field)>, legacy_applies: bool, xml_applies: bool,
	) -> Result<(), ReadError> {
		if legacy_applies {
			let bag = decoded
				.into_iter()
				.find(|(name, _)| *name == "data")
				.and_then(|(_, v)| match v {
					Field::Bag(entries) => Some(entries),
					_ => None,
				})
				.unwrap_or_default();
			obj.borrow_mut().dyn_as_legacy_contract_mut().expect("checked in read_body").set_object_data(bag);
			return Ok(());
		}
		if xml_applies {
			let xml = decoded
				.into_iter()
				.find(|(name, _)| *name == "xml")
				.and_then(|(_, v)| match v {
					Field::String(s) => Some(s),
					_ => None,
				})
				.unwrap_or_default();
			obj.borrow_mut().dyn_as_xml_contract_mut().expect("checked in read_body").read_xml(&xml);
			return Ok(());
		}

		let bases: Vec<&str> = obj.borrow().dyn_schema().bases.iter().map(|b| b.name).collect();
		let type_name = obj.borrow().dyn_schema().type_name;
		// `find` is called unconditionally, even with no surrogates registered, so that the
		// table's lock-on-first-use gate (spec.md §4.D) engages on the first object read
		// regardless of whether any surrogate ever matches — mirroring
		// `writer::ObjectWriter::write_body`'s unconditional `self.surrogates.find` call.
		let restored = self.surrogates.find(type_name, &bases).map(|s| s.restore(decoded.iter().map(|(n, v)| (n.to_string(), v.clone())).collect()));

		let mut target = obj.borrow_mut();
		if let Some(bag) = restored {
			for (name, value) in bag {
				target.dyn_set_field(&name, value);
			}
		} else {
			for (name, value) in decoded {
				target.dyn_set_field(name, value);
			}
		}
		Ok(())
	}

	fn read_primitive(&mut self, kind: PrimitiveKind) -> Result<Field, ReadError> {
		Ok(match kind {
			PrimitiveKind::Bool => Field::Bool(primitive::read_bool(&mut self.source)?),
			PrimitiveKind::I8 => {
				let mut b = [0u8; 1];
				self.source.read_exact(&mut b)?;
				Field::I8(i8::from_le_bytes(b))
			},
			PrimitiveKind::U8 => {
				let mut b = [0u8; 1];
				self.source.read_exact(&mut b)?;
				Field::U8(u8::from_le_bytes(b))
			},
			PrimitiveKind::I16 => Field::I16(primitive::read_ivarint(&mut self.source)? as i16),
			PrimitiveKind::U16 => Field::U16(primitive::read_uvarint(&mut self.source)? as u16),
			PrimitiveKind::I32 => Field::I32(primitive::read_ivarint(&mut self.source)? as i32),
			PrimitiveKind::U32 => Field::U32(primitive::read_uvarint(&mut self.source)? as u32),
			PrimitiveKind::I64 => Field::I64(primitive::read_ivarint(&mut self.source)?),
			PrimitiveKind::U64 => Field::U64(primitive::read_uvarint(&mut self.source)?),
			PrimitiveKind::F32 => Field::F32(primitive::read_f32(&mut self.source)?),
			PrimitiveKind::F64 => Field::F64(primitive::read_f64(&mut self.source)?),
			PrimitiveKind::String => {
				Field::String(primitive::read_string(&mut self.source)?.ok_or(ReadError::StreamCorrupted("string field was null"))?)
			},
			PrimitiveKind::Bytes => {
				Field::Bytes(primitive::read_bytes(&mut self.source)?.ok_or(ReadError::StreamCorrupted("byte-array field was null"))?)
			},
			PrimitiveKind::DateTime => {
				let (ticks, kind) = primitive::read_datetime(&mut self.source)?;
				Field::DateTime(ticks, kind)
			},
			PrimitiveKind::Decimal => Field::Decimal(primitive::read_decimal(&mut self.source)?),
		})
	}

	fn read_field(&mut self, kind: &FieldKind) -> Result<Field, ReadError> {
		match kind {
			FieldKind::Primitive(p) => self.read_primitive(*p),
			FieldKind::Object(name) => Ok(field_from_ref(self.read_object_ref(Some(name.as_ref()))?)),
			FieldKind::Dynamic => Ok(field_from_ref(self.read_object_ref(None)?)),
			FieldKind::Sequence(inner) => {
				let (_, len) = collection::read_preamble(&mut self.source, Some(CollectionKind::Sequence))?;
				let mut items = Vec::with_capacity(len);
				for _ in 0..len {
					items.push(self.read_field(inner)?);
				}
				Ok(Field::Sequence(items))
			},
			FieldKind::Set(inner) => {
				let (_, len) = collection::read_preamble(&mut self.source, Some(CollectionKind::Set))?;
				let mut items = Vec::with_capacity(len);
				for _ in 0..len {
					items.push(self.read_field(inner)?);
				}
				Ok(Field::Set(items))
			},
			FieldKind::Mapping(key_kind, value_kind) => {
				let (_, len) = collection::read_preamble(&mut self.source, Some(CollectionKind::Mapping))?;
				let mut entries = Vec::with_capacity(len);
				for _ in 0..len {
					let k = self.read_field(key_kind)?;
					let v = self.read_field(value_kind)?;
					entries.push((k, v));
				}
				Ok(Field::Mapping(entries))
			},
			FieldKind::Delegate => {
				let len = primitive::read_uvarint(&mut self.source)?;
				let mut slots = Vec::with_capacity(len as usize);
				for _ in 0..len {
					let target = self.read_object_ref(None)?;
					let method = primitive::read_string(&mut self.source)?.ok_or(ReadError::StreamCorrupted("delegate slot had a null method name"))?;
					slots.push((target, method));
				}
				Ok(Field::Delegate(slots))
			},
			FieldKind::Bag => Ok(Field::Bag(self.read_bag()?)),
		}
	}

	/// Reads a [`Field::Bag`]: a count, then each entry as (name, self-describing kind, value) —
	/// the mirror of `writer.rs::ObjectWriter::write_bag`.
	fn read_bag(&mut self) -> Result<Vec<(String, Field)>, ReadError> {
		let len = primitive::read_uvarint(&mut self.source)?;
		let mut entries = Vec::with_capacity(len as usize);
		for _ in 0..len {
			let name = primitive::read_string(&mut self.source)?.ok_or(ReadError::StreamCorrupted("bag entry had a null field name"))?;
			let kind = FieldKind::wire_read(&mut self.source)?;
			let value = self.read_field(&kind)?;
			entries.push((name, value));
		}
		Ok(entries)
	}

	/// Skips (decodes and discards) a field the local type no longer declares (spec.md §4.F
	/// `skipField`). Reference-typed skipped fields still advance the reference/type tables —
	/// the object they point at may be mentioned again elsewhere in the stream.
	fn skip_field(&mut self, kind: &FieldKind) -> Result<(), ReadError> {
		self.read_field(kind).map(|_| ())
	}

	/// A reference site: reads the object-id (or null sentinel); then, whenever type stamping is
	/// enabled, the concrete runtime type-id *always* follows, regardless of whether the field is
	/// statically `Object`-typed or `Dynamic` — the referenced object's body is stamped under its
	/// own `dyn_schema()` (see `write_body`), which can differ from a field's declared type for any
	/// `Object` field pointing at a subtype, so the declared name alone isn't enough to allocate the
	/// right shell (mirroring `writer.rs::write_object_ref`). Only when stamping is disabled does the
	/// declared name become load-bearing: a `Dynamic` field has none to fall back to and errors out,
	/// while an `Object` field trusts it (sound only because the writer's `homogeneous_type` check
	/// already rejects any graph that would make that fallback ambiguous).
	fn read_object_ref(&mut self, declared_name: Option<&str>) -> Result<Option<GraphRef>, ReadError> {
		let id = match read_ref_site(&mut self.source)? {
			None => return Ok(None),
			Some(id) => id,
		};
		if self.ref_table.is_reserved(id) {
			return self.ref_table.resolve(id).map(Some);
		}

		let type_name: Cow<str> = if self.options.disable_type_stamping {
			match declared_name {
				Some(name) => Cow::Borrowed(name),
				None => return Err(ReadError::InvalidOperation("dynamic-typed fields require type stamping to be enabled")),
			}
		} else {
			let raw_type_id = primitive::read_uvarint(&mut self.source)?;
			if raw_type_id == 0 {
				return Err(ReadError::StreamCorrupted("reference site carried an object id but a null type id"));
			}
			let type_id = TypeId(raw_type_id as u32);
			let stream_type = self.type_table.resolve_or_read(&mut self.source, type_id)?;
			Cow::Owned(stream_type.type_name.clone())
		};

		let shell = self.registry.shell_of(&type_name)?;
		self.ref_table.reserve(id, shell.clone());
		Ok(Some(shell))
	}

	/// Swaps in a new underlying stream, preserving the reference, type, and surrogate tables
	/// (spec.md §4.F).
	pub fn reuse_with_new_stream(&mut self, reader: R) {
		self.source = if self.options.use_buffering { Source::Buffered(BufReader::new(reader)) } else { Source::Direct(reader) };
	}
}

/// Widens a decoded stream-side primitive into the local field's declared width (spec.md §4.B:
/// "widening between integer widths of the same signedness"). A no-op unless the two primitive
/// kinds actually differ, which `reconcile` only ever allows for a compatible widening pair.
fn coerce_primitive(value: Field, local_kind: &FieldKind) -> Field {
	let FieldKind::Primitive(target) = local_kind else { return value };
	match (value, target) {
		(Field::I8(v), PrimitiveKind::I16) => Field::I16(v as i16),
		(Field::I8(v), PrimitiveKind::I32) => Field::I32(v as i32),
		(Field::I8(v), PrimitiveKind::I64) => Field::I64(v as i64),
		(Field::I16(v), PrimitiveKind::I32) => Field::I32(v as i32),
		(Field::I16(v), PrimitiveKind::I64) => Field::I64(v as i64),
		(Field::I32(v), PrimitiveKind::I64) => Field::I64(v as i64),
		(Field::U8(v), PrimitiveKind::U16) => Field::U16(v as u16),
		(Field::U8(v), PrimitiveKind::U32) => Field::U32(v as u32),
		(Field::U8(v), PrimitiveKind::U64) => Field::U64(v as u64),
		(Field::U16(v), PrimitiveKind::U32) => Field::U32(v as u32),
		(Field::U16(v), PrimitiveKind::U64) => Field::U64(v as u64),
		(Field::U32(v), PrimitiveKind::U64) => Field::U64(v as u64),
		(other, _) => other,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::descriptor::{FieldDescriptor, TypeSchema};
	use crate::value::{Field, GraphObject};
	use crate::writer::ObjectWriter;

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

	#[derive(Default)]
	struct Node {
		value: i32,
		next: Option<GraphRef>,
	}

	impl GraphObject for Node {
		fn schema(&self) -> &'static TypeSchema {
			static FIELDS: &[FieldDescriptor] = &[
				FieldDescriptor { name: "value", declaring_type: "Node", kind: FieldKind::Primitive(PrimitiveKind::I32) },
				FieldDescriptor { name: "next", declaring_type: "Node", kind: FieldKind::Object(Cow::Borrowed("Node")) },
			];
			static SCHEMA: TypeSchema = TypeSchema { type_name: "Node", module: uuid::Uuid::nil(), bases: &[], fields: FIELDS };
			&SCHEMA
		}
		fn get_fields(&self) -> Vec<(&'static str, Field)> {
			vec![("value", Field::I32(self.value)), ("next", Field::Ref(self.next.clone()))]
		}
		fn shell() -> Self {
			Self::default()
		}
		fn set_field(&mut self, name: &str, value: Field) {
			match (name, value) {
				("value", Field::I32(v)) => self.value = v,
				("next", Field::Ref(r)) => self.next = r,
				_ => {},
			}
		}
	}

	fn registry_with_node() -> TypeRegistry {
		let mut registry = TypeRegistry::new();
		registry.register::<Node>();
		registry.register::<Leaf>();
		registry
	}

	/// spec.md §4.D: "registration is only legal before the first... deserialisation." The gate
	/// must engage on the first object read even when no surrogate is ever registered (the
	/// common case) — `SurrogateTable::find` has to be called unconditionally for that, not only
	/// when a surrogate happens to be present (see `reader::ObjectReader::apply_decoded_fields`).
	#[test]
	fn registering_a_surrogate_after_the_first_read_is_rejected_even_with_none_previously_registered() {
		let leaf: GraphRef = Rc::new(RefCell::new(Leaf { value: 1 }));
		let mut writer = ObjectWriter::new(Vec::new(), SessionOptions::default());
		writer.write_object(&leaf).unwrap();
		writer.flush().unwrap();
		let bytes = writer.reuse_with_new_stream(Vec::new());

		struct NoopSurrogate;
		impl ReadSurrogate for NoopSurrogate {
			fn type_name(&self) -> &'static str {
				"Leaf"
			}
			fn restore(&self, fields: Vec<(String, Field)>) -> Vec<(String, Field)> {
				fields
			}
		}

		let mut reader = ObjectReader::new(bytes.as_slice(), SessionOptions::default(), registry_with_node());
		reader.read_root::<Leaf>().unwrap();
		let err = reader.register_surrogate(Box::new(NoopSurrogate)).unwrap_err();
		assert!(matches!(err, ReadError::InvalidOperation(_)));
	}

	#[test]
	fn leaf_value_round_trips() {
		let leaf: GraphRef = Rc::new(RefCell::new(Leaf { value: 42 }));
		let mut writer = ObjectWriter::new(Vec::new(), SessionOptions::default());
		writer.write_object(&leaf).unwrap();
		writer.flush().unwrap();
		let bytes = writer.reuse_with_new_stream(Vec::new());

		let mut reader = ObjectReader::new(bytes.as_slice(), SessionOptions::default(), registry_with_node());
		let result = reader.read_root::<Leaf>().unwrap();
		assert_eq!(result.borrow().value, 42);
	}

	/// `A.next = C` and `B.next = C`, written as two separate roots on the same writer: the
	/// reference table persists across both `write_object` calls (and across both `read_root`
	/// calls on the reader), so `C` is written once and both fields resolve to the same `Rc`.
	#[test]
	fn shared_leaf_resolves_to_the_same_instance_across_two_roots() {
		let c: GraphRef = Rc::new(RefCell::new(Node { value: 7, next: None }));
		let a: GraphRef = Rc::new(RefCell::new(Node { value: 1, next: Some(c.clone()) }));
		let b: GraphRef = Rc::new(RefCell::new(Node { value: 2, next: Some(c.clone()) }));

		let mut writer = ObjectWriter::new(Vec::new(), SessionOptions::default());
		writer.write_object(&a).unwrap();
		writer.write_object(&b).unwrap();
		writer.flush().unwrap();
		let bytes = writer.reuse_with_new_stream(Vec::new());

		let mut reader = ObjectReader::new(bytes.as_slice(), SessionOptions::default(), registry_with_node());
		let a_prime = reader.read_root::<Node>().unwrap();
		let b_prime = reader.read_root::<Node>().unwrap();
		let c_via_a = a_prime.borrow().next.clone().unwrap();
		let c_via_b = b_prime.borrow().next.clone().unwrap();
		assert!(Rc::ptr_eq(&c_via_a, &c_via_b));
	}

	#[test]
	fn cycle_round_trips() {
		let a: GraphRef = Rc::new(RefCell::new(Node { value: 1, next: None }));
		let b: GraphRef = Rc::new(RefCell::new(Node { value: 2, next: Some(a.clone()) }));
		a.borrow_mut().next = Some(b.clone());

		let mut writer = ObjectWriter::new(Vec::new(), SessionOptions::default());
		writer.write_object(&a).unwrap();
		writer.flush().unwrap();
		let bytes = writer.reuse_with_new_stream(Vec::new());

		let mut reader = ObjectReader::new(bytes.as_slice(), SessionOptions::default(), registry_with_node());
		let a_prime = reader.read_root::<Node>().unwrap();
		let b_prime = a_prime.borrow().next.clone().unwrap();
		let b_prime_node = b_prime.borrow();
		let next_of_b = b_prime_node.as_any().downcast_ref::<Node>().unwrap().next.clone().unwrap();
		assert!(Rc::ptr_eq(&next_of_b, &(a_prime.clone() as GraphRef)));
	}

	#[test]
	fn added_field_is_defaulted() {
		// Write a `Leaf` (one field: value), read it back as a type declaring an extra field.
		let leaf: GraphRef = Rc::new(RefCell::new(Leaf { value: 9 }));
		let mut writer = ObjectWriter::new(Vec::new(), SessionOptions::default());
		writer.write_object(&leaf).unwrap();
		writer.flush().unwrap();
		let bytes = writer.reuse_with_new_stream(Vec::new());

		#[derive(Default)]
		struct LeafV2 {
			value: i32,
			label: String,
		}
		impl GraphObject for LeafV2 {
			fn schema(&self) -> &'static TypeSchema {
				static FIELDS: &[FieldDescriptor] = &[
					FieldDescriptor { name: "value", declaring_type: "Leaf", kind: FieldKind::Primitive(PrimitiveKind::I32) },
					FieldDescriptor { name: "label", declaring_type: "Leaf", kind: FieldKind::Primitive(PrimitiveKind::String) },
				];
				static SCHEMA: TypeSchema = TypeSchema { type_name: "Leaf", module: uuid::Uuid::nil(), bases: &[], fields: FIELDS };
				&SCHEMA
			}
			fn get_fields(&self) -> Vec<(&'static str, Field)> {
				vec![("value", Field::I32(self.value)), ("label", Field::String(self.label.clone()))]
			}
			fn shell() -> Self {
				Self::default()
			}
			fn set_field(&mut self, name: &str, value: Field) {
				match (name, value) {
					("value", Field::I32(v)) => self.value = v,
					("label", Field::String(s)) => self.label = s,
					_ => {},
				}
			}
		}

		let mut registry = TypeRegistry::new();
		registry.register::<LeafV2>();
		let mut reader = ObjectReader::new(bytes.as_slice(), SessionOptions::default(), registry);
		let result = reader.read_root::<LeafV2>().unwrap();
		assert_eq!(result.borrow().value, 9);
		assert_eq!(result.borrow().label, "");
	}

	#[test]
	fn wrong_version_tolerance_rejects_removed_field() {
		#[derive(Default)]
		struct Wide {
			x: i32,
			y: String,
		}
		impl GraphObject for Wide {
			fn schema(&self) -> &'static TypeSchema {
				static FIELDS: &[FieldDescriptor] = &[
					FieldDescriptor { name: "x", declaring_type: "Wide", kind: FieldKind::Primitive(PrimitiveKind::I32) },
					FieldDescriptor { name: "y", declaring_type: "Wide", kind: FieldKind::Primitive(PrimitiveKind::String) },
				];
				static SCHEMA: TypeSchema = TypeSchema { type_name: "Wide", module: uuid::Uuid::nil(), bases: &[], fields: FIELDS };
				&SCHEMA
			}
			fn get_fields(&self) -> Vec<(&'static str, Field)> {
				vec![("x", Field::I32(self.x)), ("y", Field::String(self.y.clone()))]
			}
			fn shell() -> Self {
				Self::default()
			}
			fn set_field(&mut self, name: &str, value: Field) {
				match (name, value) {
					("x", Field::I32(v)) => self.x = v,
					("y", Field::String(s)) => self.y = s,
					_ => {},
				}
			}
		}
		#[derive(Default)]
		struct Narrow {
			x: i32,
		}
		impl GraphObject for Narrow {
			fn schema(&self) -> &'static TypeSchema {
				static FIELDS: &[FieldDescriptor] =
					&[FieldDescriptor { name: "x", declaring_type: "Wide", kind: FieldKind::Primitive(PrimitiveKind::I32) }];
				static SCHEMA: TypeSchema = TypeSchema { type_name: "Wide", module: uuid::Uuid::nil(), bases: &[], fields: FIELDS };
				&SCHEMA
			}
			fn get_fields(&self) -> Vec<(&'static str, Field)> {
				vec![("x", Field::I32(self.x))]
			}
			fn shell() -> Self {
				Self::default()
			}
			fn set_field(&mut self, name: &str, value: Field) {
				if let ("x", Field::I32(v)) = (name, value) {
					self.x = v;
				}
			}
		}

		let wide: GraphRef = Rc::new(RefCell::new(Wide { x: 1, y: "hi".to_string() }));
		let mut writer = ObjectWriter::new(Vec::new(), SessionOptions::default());
		writer.write_object(&wide).unwrap();
		writer.flush().unwrap();
		let bytes = writer.reuse_with_new_stream(Vec::new());

		let options = SessionOptions { version_tolerance: crate::config::VersionTolerance::empty(), ..SessionOptions::default() };
		let mut registry = TypeRegistry::new();
		registry.register::<Narrow>();
		let mut reader = ObjectReader::new(bytes.as_slice(), options, registry);
		let err = reader.read_root::<Narrow>().unwrap_err();
		assert!(matches!(err, ReadError::TypeStructureChanged { .. }));
	}
}
