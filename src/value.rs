//! The reflection substrate (SPEC_FULL.md "Reflection substrate"). Rust has no runtime field
//! reflection, so every type the engine can write/read implements [`GraphObject`], exposing its
//! fields as an ordered `(name, Field)` list — this *is* the "per-type descriptor table... with
//! a pair of function values (writer/reader)" spec.md §9 calls for, discovered at compile time.
//!
//! Grounded on `utilities.rs`'s `FromByteStream` trait (a per-type trait supplying read
//! behaviour behind a declarative macro) and, for the dynamic name-keyed field model, on the
//! `gob-rs` port's `Value::Struct(name, Vec<(String, Value)>)` representation.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use crate::descriptor::TypeSchema;
use crate::error::ReadError;
use crate::primitive::DateTimeKind;

/// A reference-typed value in the graph. Shared `Rc` + `RefCell` gives both the pointer
/// identity the reference table keys on (spec.md §4.C) and the interior mutability needed to
/// populate a pre-allocated shell (spec.md §3 "Lifecycle").
pub type GraphRef = Rc<RefCell<dyn DynGraphObject>>;

/// Any value a field can hold on the wire: spec.md §4.A primitives, a reference to another
/// graph object, or one of the three collection shapes (§4.H).
#[derive(Clone)]
pub enum Field {
	Null,
	Bool(bool),
	I8(i8),
	U8(u8),
	I16(i16),
	U16(u16),
	I32(i32),
	U32(u32),
	I64(i64),
	U64(u64),
	F32(f32),
	F64(f64),
	String(String),
	Bytes(Vec<u8>),
	DateTime(i64, DateTimeKind),
	Decimal([u8; 16]),
	/// A reference-typed field; `None` is the null reference (spec.md §3 invariant 4).
	Ref(Option<GraphRef>),
	Sequence(Vec<Field>),
	Mapping(Vec<(Field, Field)>),
	Set(Vec<Field>),
	/// SPEC_FULL.md "Delegate serialization": ordered (target, method name) invocation slots.
	Delegate(Vec<(Option<GraphRef>, String)>),
	/// SPEC_FULL.md "Built-in surrogates": a self-describing named-field bag. Each entry's
	/// [`crate::descriptor::FieldKind`] is derived from the value itself ([`runtime_field_kind`])
	/// rather than looked up on a declared schema, since the bag's shape is only known at the
	/// wrapped object's own runtime.
	Bag(Vec<(String, Field)>),
}

impl Field {
	pub fn as_ref_value(&self) -> Option<&Option<GraphRef>> {
		match self {
			Field::Ref(r) => Some(r),
			_ => None,
		}
	}
}

/// Derives the [`crate::descriptor::FieldKind`] a bag entry's value would be written with. Used
/// only for [`Field::Bag`] entries, whose shape is not known at compile time.
pub fn runtime_field_kind(value: &Field) -> crate::descriptor::FieldKind {
	use crate::descriptor::{FieldKind, PrimitiveKind};
	match value {
		// `Null` stands for a null reference (the alternative to `Ref(None)`, per
		// `GraphObject::get_fields`'s contract) — `Dynamic` is the only kind that can carry a
		// null reference without also claiming a concrete declared type it doesn't have.
		Field::Null => FieldKind::Dynamic,
		Field::Bool(_) => FieldKind::Primitive(PrimitiveKind::Bool),
		Field::I8(_) => FieldKind::Primitive(PrimitiveKind::I8),
		Field::U8(_) => FieldKind::Primitive(PrimitiveKind::U8),
		Field::I16(_) => FieldKind::Primitive(PrimitiveKind::I16),
		Field::U16(_) => FieldKind::Primitive(PrimitiveKind::U16),
		Field::I32(_) => FieldKind::Primitive(PrimitiveKind::I32),
		Field::U32(_) => FieldKind::Primitive(PrimitiveKind::U32),
		Field::I64(_) => FieldKind::Primitive(PrimitiveKind::I64),
		Field::U64(_) => FieldKind::Primitive(PrimitiveKind::U64),
		Field::F32(_) => FieldKind::Primitive(PrimitiveKind::F32),
		Field::F64(_) => FieldKind::Primitive(PrimitiveKind::F64),
		Field::String(_) => FieldKind::Primitive(PrimitiveKind::String),
		Field::Bytes(_) => FieldKind::Primitive(PrimitiveKind::Bytes),
		Field::DateTime(_, _) => FieldKind::Primitive(PrimitiveKind::DateTime),
		Field::Decimal(_) => FieldKind::Primitive(PrimitiveKind::Decimal),
		Field::Ref(_) => FieldKind::Dynamic,
		Field::Sequence(items) => {
			let inner = items.first().map(runtime_field_kind).unwrap_or(FieldKind::Dynamic);
			FieldKind::Sequence(Box::new(inner))
		},
		Field::Mapping(entries) => {
			let (key, value) = entries
				.first()
				.map(|(k, v)| (runtime_field_kind(k), runtime_field_kind(v)))
				.unwrap_or((FieldKind::Dynamic, FieldKind::Dynamic));
			FieldKind::Mapping(Box::new(key), Box::new(value))
		},
		Field::Set(items) => {
			let inner = items.first().map(runtime_field_kind).unwrap_or(FieldKind::Dynamic);
			FieldKind::Set(Box::new(inner))
		},
		Field::Delegate(_) => FieldKind::Delegate,
		Field::Bag(_) => FieldKind::Bag,
	}
}

/// The trait every serializable user type implements. Mirrors `Serialize`/`Deserialize` in
/// spirit but carries the extra semantics spec.md demands: named fields (for stamp
/// reconciliation), pre/post hooks, and an explicit "shell" constructor for cyclic references.
pub trait GraphObject: Any {
	fn schema(&self) -> &'static TypeSchema;

	/// Snapshot this object's fields as `(declared name, value)` pairs, in any order — the
	/// writer re-sorts by name per spec.md §3.
	fn get_fields(&self) -> Vec<(&'static str, Field)>;

	/// An empty/default instance, allocated without running user construction logic, used to
	/// reify cyclic references (spec.md §3 invariant 3, glossary "Shell").
	fn shell() -> Self
	where
		Self: Sized;

	/// Apply one decoded field by name. Unknown names (can happen only through caller error,
	/// never through `reconcile`, which only ever requests known local names) are a no-op.
	fn set_field(&mut self, name: &str, value: Field);

	fn on_pre_serialize(&self) {}
	fn on_post_serialize(&self) {}
	fn on_post_deserialize(&mut self) {}

	/// Overridden by types opting into the legacy `ISerializable`-style contract
	/// (SPEC_FULL.md "Built-in surrogates"). Mirrors the optional-capability pattern of
	/// `std::error::Error::source` rather than a second, separately-downcastable trait object.
	fn as_legacy_contract(&self) -> Option<&dyn LegacyContract> {
		None
	}
	fn as_legacy_contract_mut(&mut self) -> Option<&mut dyn LegacyContract> {
		None
	}

	/// Overridden by types opting into the `IXmlSerializable`-style contract.
	fn as_xml_contract(&self) -> Option<&dyn XmlContract> {
		None
	}
	fn as_xml_contract_mut(&mut self) -> Option<&mut dyn XmlContract> {
		None
	}
}

/// Object-safe counterpart of [`GraphObject`], implemented automatically for every `T:
/// GraphObject`. The engine only ever touches `dyn DynGraphObject` once a graph has been
/// type-erased at its root (see `Session::write_object`'s `T: GraphObject` entry point).
pub trait DynGraphObject: Any {
	fn as_any(&self) -> &dyn Any;
	fn as_any_mut(&mut self) -> &mut dyn Any;
	fn dyn_schema(&self) -> &'static TypeSchema;
	fn dyn_get_fields(&self) -> Vec<(&'static str, Field)>;
	fn dyn_set_field(&mut self, name: &str, value: Field);
	fn dyn_on_pre_serialize(&self);
	fn dyn_on_post_serialize(&self);
	fn dyn_on_post_deserialize(&mut self);
	fn dyn_as_legacy_contract(&self) -> Option<&dyn LegacyContract>;
	fn dyn_as_legacy_contract_mut(&mut self) -> Option<&mut dyn LegacyContract>;
	fn dyn_as_xml_contract(&self) -> Option<&dyn XmlContract>;
	fn dyn_as_xml_contract_mut(&mut self) -> Option<&mut dyn XmlContract>;
}

impl<T: GraphObject + 'static> DynGraphObject for T {
	fn as_any(&self) -> &dyn Any {
		self
	}
	fn as_any_mut(&mut self) -> &mut dyn Any {
		self
	}
	fn dyn_schema(&self) -> &'static TypeSchema {
		self.schema()
	}
	fn dyn_get_fields(&self) -> Vec<(&'static str, Field)> {
		self.get_fields()
	}
	fn dyn_set_field(&mut self, name: &str, value: Field) {
		self.set_field(name, value)
	}
	fn dyn_on_pre_serialize(&self) {
		self.on_pre_serialize()
	}
	fn dyn_on_post_serialize(&self) {
		self.on_post_serialize()
	}
	fn dyn_on_post_deserialize(&mut self) {
		self.on_post_deserialize()
	}
	fn dyn_as_legacy_contract(&self) -> Option<&dyn LegacyContract> {
		self.as_legacy_contract()
	}
	fn dyn_as_legacy_contract_mut(&mut self) -> Option<&mut dyn LegacyContract> {
		self.as_legacy_contract_mut()
	}
	fn dyn_as_xml_contract(&self) -> Option<&dyn XmlContract> {
		self.as_xml_contract()
	}
	fn dyn_as_xml_contract_mut(&mut self) -> Option<&mut dyn XmlContract> {
		self.as_xml_contract_mut()
	}
}

/// A factory that allocates a shell of a specific concrete type, type-erased to [`GraphRef`].
pub type ShellFactory = fn() -> GraphRef;

/// Locally-known types, keyed by the name their [`TypeSchema`] declares. The reader consults
/// this to reconcile a stream stamp against a local schema and to allocate shells (spec.md
/// §4.F); the writer does not need it (the concrete type is always known statically at each
/// `get_fields` call site).
#[derive(Default)]
pub struct TypeRegistry {
	entries: fxhash::FxHashMap<&'static str, (&'static TypeSchema, ShellFactory)>,
}

impl TypeRegistry {
	pub fn new() -> Self {
		Self { entries: fxhash::FxHashMap::default() }
	}

	pub fn register<T>(&mut self)
	where
		T: GraphObject + Default + 'static,
	{
		fn make_shell<T: GraphObject + 'static>() -> GraphRef {
			Rc::new(RefCell::new(T::shell()))
		}
		let schema = T::shell().schema();
		self.entries.insert(schema.type_name, (schema, make_shell::<T>));
	}

	pub fn schema_of(&self, type_name: &str) -> Option<&'static TypeSchema> {
		self.entries.get(type_name).map(|(schema, _)| *schema)
	}

	pub fn shell_of(&self, type_name: &str) -> Result<GraphRef, ReadError> {
		self.entries
			.get(type_name)
			.map(|(_, factory)| factory())
			.ok_or_else(|| ReadError::UnregisteredType(type_name.to_string()))
	}
}

/// A legacy `ISerializable`-style contract: objects expose a flat key/value bag instead of a
/// compile-time field list (SPEC_FULL.md "Built-in surrogates").
pub trait LegacyContract {
	fn get_object_data(&self) -> Vec<(String, Field)>;
	fn set_object_data(&mut self, data: Vec<(String, Field)>);
}

/// An `IXmlSerializable`-style contract: objects serialize to/from a single XML-text blob.
pub trait XmlContract {
	fn write_xml(&self) -> String;
	fn read_xml(&mut self, xml: &str);
}

/// The synthetic schema a [`LegacyContract`] object is stamped with on the wire, instead of its
/// own declared schema — a single `Bag`-typed field, mirroring how a `.NET` `ISerializable` type
/// is captured as a `SerializationInfo` bag rather than walked field-by-field. Every legacy
/// object, regardless of its concrete Rust type, shares this one schema: the body only needs to
/// round-trip through reconciliation, not to tell one legacy type from another (that's still
/// carried at reference sites by the object's real type name).
pub fn legacy_bag_schema() -> &'static crate::descriptor::TypeSchema {
	use std::sync::OnceLock;
	static SCHEMA: OnceLock<crate::descriptor::TypeSchema> = OnceLock::new();
	SCHEMA.get_or_init(|| {
		static FIELDS: &[crate::descriptor::FieldDescriptor] = &[crate::descriptor::FieldDescriptor {
			name: "data",
			declaring_type: "LegacyContract",
			kind: crate::descriptor::FieldKind::Bag,
		}];
		crate::descriptor::TypeSchema { type_name: "LegacyContract", module: uuid::Uuid::nil(), bases: &[], fields: FIELDS }
	})
}

/// The synthetic schema an [`XmlContract`] object is stamped with on the wire: a single
/// `String`-typed field holding the serialized XML text.
pub fn xml_bag_schema() -> &'static crate::descriptor::TypeSchema {
	use std::sync::OnceLock;
	static SCHEMA: OnceLock<crate::descriptor::TypeSchema> = OnceLock::new();
	SCHEMA.get_or_init(|| {
		static FIELDS: &[crate::descriptor::FieldDescriptor] = &[crate::descriptor::FieldDescriptor {
			name: "xml",
			declaring_type: "XmlContract",
			kind: crate::descriptor::FieldKind::Primitive(crate::descriptor::PrimitiveKind::String),
		}];
		crate::descriptor::TypeSchema { type_name: "XmlContract", module: uuid::Uuid::nil(), bases: &[], fields: FIELDS }
	})
}

/// Reduces the boilerplate of implementing [`GraphObject`] for a plain struct, in the spirit of
/// the teacher's own `impl_from_byte_stream!` declarative macro (`utilities.rs`).
///
/// ```ignore
/// declare_graph_object! {
///     struct Node {
///         value: FieldKind::Primitive(PrimitiveKind::I32)
///             => |n: &Node| Field::I32(n.value), |n: &mut Node, v| if let Field::I32(x) = v { n.value = x };
///     }
/// }
/// ```
///
/// Field kinds are embedded in a `static`, so only non-allocating [`crate::descriptor::FieldKind`]
/// variants (`Primitive`, `Object`, `Dynamic`, `Delegate`) can be named this way; a type with a
/// `Sequence`/`Mapping`/`Set` field implements [`GraphObject`] by hand instead.
#[macro_export]
macro_rules! declare_graph_object {
	(
		$(#[$meta:meta])*
		struct $name:ident { $($field:ident : $kind:expr => $get:expr, $set:expr);* $(;)? }
	) => {
		impl $crate::value::GraphObject for $name {
			fn schema(&self) -> &'static $crate::descriptor::TypeSchema {
				use std::sync::OnceLock;
				static SCHEMA: OnceLock<$crate::descriptor::TypeSchema> = OnceLock::new();
				SCHEMA.get_or_init(|| $crate::descriptor::TypeSchema {
					type_name: stringify!($name),
					module: uuid::Uuid::nil(),
					bases: &[],
					fields: {
						static FIELDS: &[$crate::descriptor::FieldDescriptor] = &[
							$($crate::descriptor::FieldDescriptor {
								name: stringify!($field),
								declaring_type: stringify!($name),
								kind: $kind,
							}),*
						];
						FIELDS
					},
				})
			}

			fn get_fields(&self) -> Vec<(&'static str, $crate::value::Field)> {
				vec![$((stringify!($field), ($get)(self))),*]
			}

			fn shell() -> Self {
				Self::default()
			}

			fn set_field(&mut self, name: &str, value: $crate::value::Field) {
				match name {
					$(stringify!($field) => ($set)(self, value),)*
					_ => {},
				}
			}
		}

		impl $name {
			/// Pastes a `with_<field>` builder method per declared field, in the spirit of the
			/// teacher's `paste!`-based identifier generation (`raw/indices.rs`'s
			/// `[<$id Token>]`). Chains the macro's own `$set` closure, so it stays consistent
			/// with `set_field` by construction rather than duplicating field-assignment logic.
			$(
				::paste::paste! {
					#[allow(dead_code)]
					pub fn [<with_ $field>](mut self, value: $crate::value::Field) -> Self {
						($set)(&mut self, value);
						self
					}
				}
			)*
		}
	};
}
