//! Type descriptor & stamp protocol (spec.md §4.B). A stamp is written eagerly, inline, the
//! first time a type is seen; later occurrences carry only its type-id. Reconciliation between
//! a stream-side stamp and a local [`TypeSchema`] produces a [`FieldMap`] the reader walks.
//!
//! Grounded on `schema/type.rs` (`Type`/`TypeData::Init` field list) for the shape of a stamped
//! type and on `raw/heaps/guid.rs` for the module-GUID concept. The wire grammar carries
//! declaring-type and field-type information inline by name rather than through a second,
//! recursive type-id indirection (see DESIGN.md, "Open questions — decisions taken"); spec.md's
//! non-goal of cross-implementation interop means the exact byte layout is ours to choose as
//! long as the structural guarantees it describes hold.

use std::borrow::Cow;
use std::io::{Read, Write};

use fxhash::{FxHashMap, FxHasher};
use std::hash::Hasher;
use uuid::Uuid;

use crate::config::VersionTolerance;
use crate::error::ReadError;
use crate::ids::TypeId;
use crate::primitive;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum PrimitiveKind {
	Bool,
	I8,
	U8,
	I16,
	U16,
	I32,
	U32,
	I64,
	U64,
	F32,
	F64,
	String,
	Bytes,
	DateTime,
	Decimal,
}

impl PrimitiveKind {
	fn wire_tag(self) -> u8 {
		match self {
			PrimitiveKind::Bool => 0,
			PrimitiveKind::I8 => 1,
			PrimitiveKind::U8 => 2,
			PrimitiveKind::I16 => 3,
			PrimitiveKind::U16 => 4,
			PrimitiveKind::I32 => 5,
			PrimitiveKind::U32 => 6,
			PrimitiveKind::I64 => 7,
			PrimitiveKind::U64 => 8,
			PrimitiveKind::F32 => 9,
			PrimitiveKind::F64 => 10,
			PrimitiveKind::String => 11,
			PrimitiveKind::Bytes => 12,
			PrimitiveKind::DateTime => 13,
			PrimitiveKind::Decimal => 14,
		}
	}

	fn from_wire_tag(tag: u8) -> Result<Self, ReadError> {
		Ok(match tag {
			0 => PrimitiveKind::Bool,
			1 => PrimitiveKind::I8,
			2 => PrimitiveKind::U8,
			3 => PrimitiveKind::I16,
			4 => PrimitiveKind::U16,
			5 => PrimitiveKind::I32,
			6 => PrimitiveKind::U32,
			7 => PrimitiveKind::I64,
			8 => PrimitiveKind::U64,
			9 => PrimitiveKind::F32,
			10 => PrimitiveKind::F64,
			11 => PrimitiveKind::String,
			12 => PrimitiveKind::Bytes,
			13 => PrimitiveKind::DateTime,
			14 => PrimitiveKind::Decimal,
			_ => return Err(ReadError::StreamCorrupted("unknown primitive wire tag")),
		})
	}

	/// spec.md §4.B: "widening between integer widths of the same signedness" is the only
	/// primitive-level compatibility beyond exact match.
	pub fn widens_into(self, target: PrimitiveKind) -> bool {
		use PrimitiveKind::*;
		matches!(
			(self, target),
			(I8, I16) | (I8, I32) | (I8, I64) |
			(I16, I32) | (I16, I64) |
			(I32, I64) |
			(U8, U16) | (U8, U32) | (U8, U64) |
			(U16, U32) | (U16, U64) |
			(U32, U64)
		)
	}
}

/// The declared shape of a field, descriptive only: object-typed and dynamic fields do not
/// carry a nested recursive stamp here (the referenced object gets its own type-id/stamp the
/// first time an instance of it is actually written, per spec.md §3 "Type identity").
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
	Primitive(PrimitiveKind),
	/// A reference to a specific, statically-known user type.
	Object(Cow<'static, str>),
	/// An untyped reference slot (the CLR's `System.Object` fields): the concrete type is
	/// resolved per-occurrence from the inline type-id written at that reference site.
	Dynamic,
	Sequence(Box<FieldKind>),
	Mapping(Box<FieldKind>, Box<FieldKind>),
	Set(Box<FieldKind>),
	/// spec.md §4.E / SPEC_FULL.md "Delegate serialization".
	Delegate,
	/// SPEC_FULL.md "Built-in surrogates": a self-describing named-field bag, used only for the
	/// legacy/XML contract representations (`value::legacy_bag_schema`/`xml_bag_schema`) — each
	/// entry carries its own [`FieldKind`] inline rather than relying on a declared schema, since
	/// the bag's shape is only known at the wrapped object's own runtime, not at compile time.
	Bag,
}

impl FieldKind {
	pub(crate) fn wire_write<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
		match self {
			FieldKind::Primitive(p) => w.write_all(&[p.wire_tag()]),
			FieldKind::Object(name) => {
				w.write_all(&[15])?;
				primitive::write_string(w, Some(name.as_ref()))
			},
			FieldKind::Dynamic => w.write_all(&[16]),
			FieldKind::Sequence(inner) => {
				w.write_all(&[17])?;
				inner.wire_write(w)
			},
			FieldKind::Mapping(key, value) => {
				w.write_all(&[18])?;
				key.wire_write(w)?;
				value.wire_write(w)
			},
			FieldKind::Set(inner) => {
				w.write_all(&[19])?;
				inner.wire_write(w)
			},
			FieldKind::Delegate => w.write_all(&[20]),
			FieldKind::Bag => w.write_all(&[21]),
		}
	}

	pub(crate) fn wire_read<R: Read>(r: &mut R) -> Result<FieldKind, ReadError> {
		let mut tag = [0u8; 1];
		r.read_exact(&mut tag)?;
		Ok(match tag[0] {
			15 => {
				let name = primitive::read_string(r)?.ok_or(ReadError::StreamCorrupted("null object field-type name"))?;
				FieldKind::Object(Cow::Owned(name))
			},
			16 => FieldKind::Dynamic,
			17 => FieldKind::Sequence(Box::new(FieldKind::wire_read(r)?)),
			18 => {
				let key = FieldKind::wire_read(r)?;
				let value = FieldKind::wire_read(r)?;
				FieldKind::Mapping(Box::new(key), Box::new(value))
			},
			19 => FieldKind::Set(Box::new(FieldKind::wire_read(r)?)),
			20 => FieldKind::Delegate,
			21 => FieldKind::Bag,
			tag => FieldKind::Primitive(PrimitiveKind::from_wire_tag(tag)?),
		})
	}

	/// A canonical, order-sensitive signature used for structural fingerprinting.
	fn describe(&self, out: &mut String) {
		match self {
			FieldKind::Primitive(p) => out.push_str(&format!("{p:?}")),
			FieldKind::Object(name) => out.push_str(&format!("Object({name})")),
			FieldKind::Dynamic => out.push_str("Dynamic"),
			FieldKind::Sequence(inner) => {
				out.push_str("Sequence(");
				inner.describe(out);
				out.push(')');
			},
			FieldKind::Mapping(key, value) => {
				out.push_str("Mapping(");
				key.describe(out);
				out.push(',');
				value.describe(out);
				out.push(')');
			},
			FieldKind::Set(inner) => {
				out.push_str("Set(");
				inner.describe(out);
				out.push(')');
			},
			FieldKind::Delegate => out.push_str("Delegate"),
			FieldKind::Bag => out.push_str("Bag"),
		}
	}

	/// Is a value declared as `self` acceptable where `target` is locally expected?
	pub fn is_compatible_with(&self, target: &FieldKind) -> bool {
		match (self, target) {
			(FieldKind::Primitive(a), FieldKind::Primitive(b)) => a == b || a.widens_into(*b),
			(FieldKind::Object(a), FieldKind::Object(b)) => a == b,
			(FieldKind::Dynamic, FieldKind::Dynamic) => true,
			(FieldKind::Sequence(a), FieldKind::Sequence(b)) => a.is_compatible_with(b),
			(FieldKind::Set(a), FieldKind::Set(b)) => a.is_compatible_with(b),
			(FieldKind::Mapping(ak, av), FieldKind::Mapping(bk, bv)) => {
				ak.is_compatible_with(bk) && av.is_compatible_with(bv)
			},
			(FieldKind::Delegate, FieldKind::Delegate) => true,
			(FieldKind::Bag, FieldKind::Bag) => true,
			_ => false,
		}
	}
}

/// A field, as declared on a [`TypeSchema`].
#[derive(Debug, Clone)]
pub struct FieldDescriptor {
	pub name: &'static str,
	pub declaring_type: &'static str,
	pub kind: FieldKind,
}

/// A lightweight base-type entry: name and module only, no nested field list (spec.md §3:
/// "ordered list of base types up to the root").
#[derive(Debug, Copy, Clone)]
pub struct TypeReference {
	pub name: &'static str,
	pub module: Uuid,
}

/// The compiled-in, "local" structural description of a type.
#[derive(Debug, Clone)]
pub struct TypeSchema {
	pub type_name: &'static str,
	pub module: Uuid,
	pub bases: &'static [TypeReference],
	pub fields: &'static [FieldDescriptor],
}

impl TypeSchema {
	/// spec.md §3: "Field order is ascending by name, independent of source declaration order."
	pub fn sorted_fields(&self) -> Vec<&FieldDescriptor> {
		let mut fields: Vec<&FieldDescriptor> = self.fields.iter().collect();
		fields.sort_by_key(|f| f.name);
		fields
	}

	pub fn fingerprint(&self) -> u64 {
		let mut hasher = FxHasher::default();
		for field in self.sorted_fields() {
			let mut signature = String::new();
			signature.push_str(field.name);
			signature.push('|');
			signature.push_str(field.declaring_type);
			signature.push('|');
			field.kind.describe(&mut signature);
			hasher.write(signature.as_bytes());
			hasher.write_u8(0xFF);
		}
		hasher.finish()
	}
}

/// The stream-side mirror of [`FieldDescriptor`], decoded off the wire.
#[derive(Debug, Clone)]
pub struct StreamField {
	pub name: String,
	pub declaring_type: String,
	pub kind: FieldKind,
}

/// The stream-side mirror of [`TypeSchema`], decoded off the wire. May or may not match the
/// receiver's local schema for the same type name.
#[derive(Debug, Clone)]
pub struct StreamType {
	pub type_name: String,
	pub module: Uuid,
	pub bases: Vec<(String, Uuid)>,
	/// Always in ascending-by-name order: the writer never emits them any other way.
	pub fields: Vec<StreamField>,
}

impl StreamType {
	pub fn fingerprint(&self) -> u64 {
		let mut hasher = FxHasher::default();
		for field in &self.fields {
			let mut signature = String::new();
			signature.push_str(&field.name);
			signature.push('|');
			signature.push_str(&field.declaring_type);
			signature.push('|');
			field.kind.describe(&mut signature);
			hasher.write(signature.as_bytes());
			hasher.write_u8(0xFF);
		}
		hasher.finish()
	}

	fn wire_write<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
		primitive::write_string(w, Some(&self.type_name))?;
		w.write_all(self.module.as_bytes())?;
		primitive::write_uvarint(w, self.bases.len() as u64)?;
		for (name, module) in &self.bases {
			primitive::write_string(w, Some(name))?;
			w.write_all(module.as_bytes())?;
		}
		primitive::write_uvarint(w, self.fields.len() as u64)?;
		for field in &self.fields {
			primitive::write_string(w, Some(&field.name))?;
			primitive::write_string(w, Some(&field.declaring_type))?;
			field.kind.wire_write(w)?;
		}
		Ok(())
	}

	fn wire_read<R: Read>(r: &mut R) -> Result<StreamType, ReadError> {
		let type_name = primitive::read_string(r)?.ok_or(ReadError::StreamCorrupted("null type name in stamp"))?;
		let mut module_bytes = [0u8; 16];
		r.read_exact(&mut module_bytes)?;
		let module = Uuid::from_bytes(module_bytes);

		let base_count = primitive::read_uvarint(r)?;
		let mut bases = Vec::with_capacity(base_count as usize);
		for _ in 0..base_count {
			let name = primitive::read_string(r)?.ok_or(ReadError::StreamCorrupted("null base type name"))?;
			let mut base_module_bytes = [0u8; 16];
			r.read_exact(&mut base_module_bytes)?;
			bases.push((name, Uuid::from_bytes(base_module_bytes)));
		}

		let field_count = primitive::read_uvarint(r)?;
		if field_count > 1_000_000 {
			return Err(ReadError::StreamCorrupted("implausible field count"));
		}
		let mut fields = Vec::with_capacity(field_count as usize);
		for _ in 0..field_count {
			let name = primitive::read_string(r)?.ok_or(ReadError::StreamCorrupted("null field name"))?;
			let declaring_type = primitive::read_string(r)?.ok_or(ReadError::StreamCorrupted("null declaring type"))?;
			let kind = FieldKind::wire_read(r)?;
			fields.push(StreamField { name, declaring_type, kind });
		}

		Ok(StreamType { type_name, module, bases, fields })
	}
}

fn schema_to_stream_type(schema: &TypeSchema) -> StreamType {
	StreamType {
		type_name: schema.type_name.to_string(),
		module: schema.module,
		bases: schema.bases.iter().map(|b| (b.name.to_string(), b.module)).collect(),
		fields: schema
			.sorted_fields()
			.into_iter()
			.map(|f| StreamField { name: f.name.to_string(), declaring_type: f.declaring_type.to_string(), kind: f.kind.clone() })
			.collect(),
	}
}

/// One reconciliation instruction per stream-side field, in stream order, plus trailing
/// default-inits for local fields the stream never mentioned (spec.md §4.F step 3).
#[derive(Debug, Clone)]
pub enum FieldPlan {
	/// `stream_kind` is how the value is laid out on the wire; `local_kind` is what the local
	/// field declares. They differ only under an integer-widening change (spec.md §4.B), in
	/// which case the reader decodes per `stream_kind` and widens into `local_kind` before
	/// handing the value to [`crate::value::GraphObject::set_field`].
	ReadLocal { local_name: &'static str, stream_kind: FieldKind, local_kind: FieldKind },
	Skip { stream_kind: FieldKind },
	DefaultInit { local_name: &'static str },
}

#[derive(Debug, Clone, Default)]
pub struct FieldMap {
	pub plans: Vec<FieldPlan>,
}

/// spec.md §4.B reconciliation: exact fingerprint match uses the local layout directly;
/// otherwise a field-by-field map is built, honoring `tolerance`.
pub fn reconcile(stream: &StreamType, local: &TypeSchema, tolerance: VersionTolerance, force_verification: bool) -> Result<FieldMap, ReadError> {
	if !force_verification && stream.fingerprint() == local.fingerprint() {
		let plans = local
			.sorted_fields()
			.into_iter()
			.map(|f| FieldPlan::ReadLocal { local_name: f.name, stream_kind: f.kind.clone(), local_kind: f.kind.clone() })
			.collect();
		return Ok(FieldMap { plans });
	}

	if stream.type_name != local.type_name && !tolerance.contains(VersionTolerance::ALLOW_TYPE_NAME_CHANGE) {
		return Err(ReadError::TypeStructureChanged {
			type_name: local.type_name.to_string(),
			reason: format!("stream type name `{}` does not match", stream.type_name),
		});
	}
	if stream.module != local.module && !tolerance.contains(VersionTolerance::ALLOW_GUID_CHANGE) {
		return Err(ReadError::TypeStructureChanged {
			type_name: local.type_name.to_string(),
			reason: "module guid changed".to_string(),
		});
	}
	let local_base_names: Vec<&str> = local.bases.iter().map(|b| b.name).collect();
	for (name, _) in &stream.bases {
		if !local_base_names.contains(&name.as_str()) {
			return Err(ReadError::TypeStructureChanged {
				type_name: local.type_name.to_string(),
				reason: format!("base type `{name}` is missing locally"),
			});
		}
	}

	let local_fields = local.sorted_fields();
	let mut consumed = vec![false; local_fields.len()];
	let mut plans = Vec::with_capacity(stream.fields.len().max(local_fields.len()));

	for stream_field in &stream.fields {
		let local_match = local_fields.iter().position(|f| f.name == stream_field.name);
		match local_match {
			None => {
				if !tolerance.contains(VersionTolerance::ALLOW_FIELD_REMOVAL) {
					return Err(ReadError::TypeStructureChanged {
						type_name: local.type_name.to_string(),
						reason: format!("field `{}` was removed locally", stream_field.name),
					});
				}
				plans.push(FieldPlan::Skip { stream_kind: stream_field.kind.clone() });
			},
			Some(idx) => {
				let local_field = local_fields[idx];
				if !stream_field.kind.is_compatible_with(&local_field.kind) {
					return Err(ReadError::TypeStructureChanged {
						type_name: local.type_name.to_string(),
						reason: format!("field `{}` changed to an incompatible type", stream_field.name),
					});
				}
				if stream_field.declaring_type != local_field.declaring_type && !tolerance.contains(VersionTolerance::ALLOW_FIELD_MOVE) {
					return Err(ReadError::TypeStructureChanged {
						type_name: local.type_name.to_string(),
						reason: format!("field `{}` moved between base and derived", stream_field.name),
					});
				}
				consumed[idx] = true;
				plans.push(FieldPlan::ReadLocal {
					local_name: local_field.name,
					stream_kind: stream_field.kind.clone(),
					local_kind: local_field.kind.clone(),
				});
			},
		}
	}

	for (idx, field) in local_fields.iter().enumerate() {
		if !consumed[idx] {
			if !tolerance.contains(VersionTolerance::ALLOW_FIELD_ADDITION) {
				return Err(ReadError::TypeStructureChanged {
					type_name: local.type_name.to_string(),
					reason: format!("field `{}` was added locally", field.name),
				});
			}
			plans.push(FieldPlan::DefaultInit { local_name: field.name });
		}
	}

	Ok(FieldMap { plans })
}

/// Writer-side type-id assignment: one id per distinct type name, stamp written on first sight.
#[derive(Debug, Default)]
pub struct WriterTypeTable {
	ids: FxHashMap<&'static str, TypeId>,
	next_id: TypeId,
}

impl WriterTypeTable {
	pub fn new() -> Self {
		Self { ids: FxHashMap::default(), next_id: TypeId(1) }
	}

	/// Writes the type-id varint, and — on first sight — the full stamp body immediately after.
	pub fn write_type_header<W: Write>(&mut self, w: &mut W, schema: &TypeSchema) -> Result<TypeId, crate::error::WriteError> {
		if let Some(id) = self.ids.get(schema.type_name) {
			primitive::write_uvarint(w, id.0 as u64)?;
			return Ok(*id);
		}
		let id = self.next_id;
		self.next_id = self.next_id.next();
		self.ids.insert(schema.type_name, id);
		primitive::write_uvarint(w, id.0 as u64)?;
		schema_to_stream_type(schema).wire_write(w)?;
		Ok(id)
	}
}

/// Reader-side mirror: stamps are decoded on first sight and kept indexed by type-id.
#[derive(Debug, Default)]
pub struct ReaderTypeTable {
	types: Vec<StreamType>,
}

impl ReaderTypeTable {
	pub fn new() -> Self {
		Self { types: Vec::new() }
	}

	/// Reads a type-id varint (assumed already known to be non-null by the caller) and, if it
	/// is being seen for the first time, the stamp that must immediately follow it.
	pub fn resolve_or_read<R: Read>(&mut self, r: &mut R, id: TypeId) -> Result<&StreamType, ReadError> {
		let index = id.0 as usize;
		if index == 0 {
			return Err(ReadError::StreamCorrupted("type id 0 is reserved for null"));
		}
		if index <= self.types.len() {
			return Ok(&self.types[index - 1]);
		}
		if index != self.types.len() + 1 {
			return Err(ReadError::StreamCorrupted("type id skipped ahead of the high-water mark"));
		}
		let stream_type = StreamType::wire_read(r)?;
		self.types.push(stream_type);
		Ok(&self.types[index - 1])
	}
}
