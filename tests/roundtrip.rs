//! End-to-end scenarios from spec.md §8, driven entirely through the public `Session` façade
//! rather than the lower-level `ObjectWriter`/`ObjectReader` (those have their own unit tests
//! alongside their implementations).

use std::cell::RefCell;
use std::rc::Rc;

use fathom::descriptor::{FieldDescriptor, FieldKind, PrimitiveKind, TypeSchema};
use fathom::{Field, GraphObject, GraphRef, LegacyContract, ReadError, Session, SessionOptions, TypeRegistry, VersionTolerance, XmlContract};

#[derive(Default)]
struct Node {
	value: i32,
	next: Option<GraphRef>,
}

impl GraphObject for Node {
	fn schema(&self) -> &'static TypeSchema {
		static FIELDS: &[FieldDescriptor] = &[
			FieldDescriptor { name: "value", declaring_type: "Node", kind: FieldKind::Primitive(PrimitiveKind::I32) },
			FieldDescriptor { name: "next", declaring_type: "Node", kind: FieldKind::Object(std::borrow::Cow::Borrowed("Node")) },
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

fn registry() -> TypeRegistry {
	let mut r = TypeRegistry::new();
	r.register::<Node>();
	r
}

/// Surfaces the `tracing::instrument` spans on `ObjectWriter`/`ObjectReader`/`Session` when a
/// test is run under `RUST_LOG`; a no-op otherwise. Safe to call from every test since a second
/// `try_init` after the first just fails silently.
fn init_tracing() {
	let _ = tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).with_test_writer().try_init();
}

#[test]
fn shared_leaf_resolves_to_one_instance_across_two_independently_written_roots() {
	init_tracing();
	// Two roots, written and read on the same open-stream handle, both pointing at the same leaf:
	// the reference table persists across both calls, so the leaf is written once and both roots'
	// resolved references are the same `Rc` (spec.md §8 "shared leaf").
	let leaf: GraphRef = Rc::new(RefCell::new(Node { value: 3, next: None }));
	let a: GraphRef = Rc::new(RefCell::new(Node { value: 1, next: Some(leaf.clone()) }));
	let b: GraphRef = Rc::new(RefCell::new(Node { value: 2, next: Some(leaf.clone()) }));

	let session = Session::new(SessionOptions::default()).unwrap();
	let mut writer = session.open_writer(Vec::new(), None).unwrap();
	writer.write_object(&a).unwrap();
	writer.write_object(&b).unwrap();
	writer.flush().unwrap();
	let bytes = writer.reuse_with_new_stream(Vec::new());

	let (mut reader, _) = session.open_reader(bytes.as_slice(), registry()).unwrap();
	let a_prime = reader.read_root::<Node>().unwrap();
	let b_prime = reader.read_root::<Node>().unwrap();
	let leaf_via_a = a_prime.borrow().next.clone().unwrap();
	let leaf_via_b = b_prime.borrow().next.clone().unwrap();
	assert!(Rc::ptr_eq(&leaf_via_a, &leaf_via_b));
}

#[test]
fn a_cycle_round_trips_without_recursing_forever() {
	init_tracing();
	let a: GraphRef = Rc::new(RefCell::new(Node { value: 1, next: None }));
	let b: GraphRef = Rc::new(RefCell::new(Node { value: 2, next: Some(a.clone()) }));
	a.borrow_mut().next = Some(b.clone());

	let session = Session::new(SessionOptions::default()).unwrap();
	let mut bytes = Vec::new();
	session.serialize(&a, &mut bytes, None).unwrap();

	let (a_prime, _) = session.deserialize::<_, Node>(bytes.as_slice(), registry()).unwrap();
	let b_prime = a_prime.borrow().next.clone().unwrap();
	let next_of_b = b_prime.borrow().as_any().downcast_ref::<Node>().unwrap().next.clone().unwrap();
	assert!(Rc::ptr_eq(&next_of_b, &(a_prime.clone() as GraphRef)));
}

#[derive(Default)]
struct TaggedLeaf {
	tag: i32,
}

impl GraphObject for TaggedLeaf {
	fn schema(&self) -> &'static TypeSchema {
		static FIELDS: &[FieldDescriptor] = &[FieldDescriptor { name: "tag", declaring_type: "TaggedLeaf", kind: FieldKind::Primitive(PrimitiveKind::I32) }];
		static SCHEMA: TypeSchema = TypeSchema { type_name: "TaggedLeaf", module: uuid::Uuid::nil(), bases: &[], fields: FIELDS };
		&SCHEMA
	}
	fn get_fields(&self) -> Vec<(&'static str, Field)> {
		vec![("tag", Field::I32(self.tag))]
	}
	fn shell() -> Self {
		Self::default()
	}
	fn set_field(&mut self, name: &str, value: Field) {
		if let ("tag", Field::I32(v)) = (name, value) {
			self.tag = v;
		}
	}
}

#[test]
fn a_statically_object_typed_field_pointing_at_a_different_runtime_type_round_trips() {
	init_tracing();
	// `Node::next` is declared `FieldKind::Object("Node")`, but nothing stops the runtime value
	// behind it from being some other `GraphObject` impl with its own distinct schema — the field
	// only constrains what Rust type the slot holds (`GraphRef` is `Rc<RefCell<dyn DynGraphObject>>`),
	// not what concrete type populates it. The reference site has to carry the real type-id for the
	// reader to allocate the right shell, exactly like a `Dynamic` field would.
	let leaf: GraphRef = Rc::new(RefCell::new(TaggedLeaf { tag: 42 }));
	let root: GraphRef = Rc::new(RefCell::new(Node { value: 1, next: Some(leaf) }));

	let session = Session::new(SessionOptions::default()).unwrap();
	let mut bytes = Vec::new();
	session.serialize(&root, &mut bytes, None).unwrap();

	let mut registry = TypeRegistry::new();
	registry.register::<Node>();
	registry.register::<TaggedLeaf>();
	let (result, _) = session.deserialize::<_, Node>(bytes.as_slice(), registry).unwrap();
	let next = result.borrow().next.clone().unwrap();
	assert_eq!(next.borrow().as_any().downcast_ref::<TaggedLeaf>().unwrap().tag, 42);
}

#[derive(Default)]
struct NodeWithLabel {
	value: i32,
	label: String,
}

impl GraphObject for NodeWithLabel {
	fn schema(&self) -> &'static TypeSchema {
		static FIELDS: &[FieldDescriptor] = &[
			FieldDescriptor { name: "value", declaring_type: "Node", kind: FieldKind::Primitive(PrimitiveKind::I32) },
			FieldDescriptor { name: "label", declaring_type: "Node", kind: FieldKind::Primitive(PrimitiveKind::String) },
		];
		static SCHEMA: TypeSchema = TypeSchema { type_name: "Node", module: uuid::Uuid::nil(), bases: &[], fields: FIELDS };
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

#[test]
fn a_field_added_since_the_stream_was_written_defaults_under_lenient_tolerance() {
	// `Node` (value, next) written to the stream; read back as `NodeWithLabel` (value, label) —
	// `next` was removed and `label` was added, both tolerated under the default LENIENT policy.
	let node: GraphRef = Rc::new(RefCell::new(Node { value: 5, next: None }));
	let session = Session::new(SessionOptions::default()).unwrap();
	let mut bytes = Vec::new();
	session.serialize(&node, &mut bytes, None).unwrap();

	let mut registry = TypeRegistry::new();
	registry.register::<NodeWithLabel>();
	let (result, _) = session.deserialize::<_, NodeWithLabel>(bytes.as_slice(), registry).unwrap();
	assert_eq!(result.borrow().value, 5);
	assert_eq!(result.borrow().label, "");
}

#[test]
fn a_field_removed_since_the_stream_was_written_is_skipped_under_lenient_tolerance() {
	// `NodeWithLabel` (value, label) written; read back as a bare `value`-only type.
	#[derive(Default)]
	struct JustValue {
		value: i32,
	}
	impl GraphObject for JustValue {
		fn schema(&self) -> &'static TypeSchema {
			static FIELDS: &[FieldDescriptor] = &[FieldDescriptor { name: "value", declaring_type: "Node", kind: FieldKind::Primitive(PrimitiveKind::I32) }];
			static SCHEMA: TypeSchema = TypeSchema { type_name: "Node", module: uuid::Uuid::nil(), bases: &[], fields: FIELDS };
			&SCHEMA
		}
		fn get_fields(&self) -> Vec<(&'static str, Field)> {
			vec![("value", Field::I32(self.value))]
		}
		fn shell() -> Self {
			Self::default()
		}
		fn set_field(&mut self, name: &str, value: Field) {
			if let ("value", Field::I32(v)) = (name, value) {
				self.value = v;
			}
		}
	}

	let node: GraphRef = Rc::new(RefCell::new(NodeWithLabel { value: 11, label: "ignored".to_string() }));
	let session = Session::new(SessionOptions::default()).unwrap();
	let mut bytes = Vec::new();
	session.serialize(&node, &mut bytes, None).unwrap();

	let mut registry = TypeRegistry::new();
	registry.register::<JustValue>();
	let (result, _) = session.deserialize::<_, JustValue>(bytes.as_slice(), registry).unwrap();
	assert_eq!(result.borrow().value, 11);
}

#[test]
fn field_removal_is_rejected_when_tolerance_does_not_allow_it() {
	let node: GraphRef = Rc::new(RefCell::new(NodeWithLabel { value: 1, label: "x".to_string() }));
	let session = Session::new(SessionOptions::default()).unwrap();
	let mut bytes = Vec::new();
	session.serialize(&node, &mut bytes, None).unwrap();

	#[derive(Default)]
	struct JustValue {
		value: i32,
	}
	impl GraphObject for JustValue {
		fn schema(&self) -> &'static TypeSchema {
			static FIELDS: &[FieldDescriptor] = &[FieldDescriptor { name: "value", declaring_type: "Node", kind: FieldKind::Primitive(PrimitiveKind::I32) }];
			static SCHEMA: TypeSchema = TypeSchema { type_name: "Node", module: uuid::Uuid::nil(), bases: &[], fields: FIELDS };
			&SCHEMA
		}
		fn get_fields(&self) -> Vec<(&'static str, Field)> {
			vec![("value", Field::I32(self.value))]
		}
		fn shell() -> Self {
			Self::default()
		}
		fn set_field(&mut self, name: &str, value: Field) {
			if let ("value", Field::I32(v)) = (name, value) {
				self.value = v;
			}
		}
	}

	let strict_session = Session::new(SessionOptions { version_tolerance: VersionTolerance::empty(), ..SessionOptions::default() }).unwrap();
	let mut registry = TypeRegistry::new();
	registry.register::<JustValue>();
	let err = strict_session.deserialize::<_, JustValue>(bytes.as_slice(), registry).unwrap_err();
	assert!(matches!(err, ReadError::TypeStructureChanged { .. }));
}

#[test]
fn a_header_with_the_wrong_version_byte_is_rejected() {
	let session = Session::new(SessionOptions::default()).unwrap();
	let mut bytes = vec![0x32, 0x66, 0x34, 0x01, 0x01, 0x01];
	bytes.extend_from_slice(&[0; 8]);
	let err = session.deserialize::<_, Node>(bytes.as_slice(), registry()).unwrap_err();
	assert!(matches!(err, ReadError::WrongVersion { expected: 9, found: 1 }));
}

#[test]
fn metadata_truncated_before_its_declared_length_is_rewound_and_treated_as_absent() {
	let node: GraphRef = Rc::new(RefCell::new(Node { value: 4, next: None }));
	let session = Session::new(SessionOptions::default()).unwrap();
	let mut body = Vec::new();
	session.serialize(&node, &mut body, None).unwrap();

	// Splice a truncated metadata block in between a freshly written header and the real body.
	let mut spliced = body[..6].to_vec();
	spliced.push(20); // claims 20 bytes of metadata payload
	spliced.extend_from_slice(&[9, 9, 9]); // only 3 actually follow before the real body resumes
	spliced.extend_from_slice(&body[6..]);

	// The reader rewinds the bogus metadata attempt and tries to read the 4 pushed-back bytes as
	// the start of the body, which does not line up with the real body that follows — it is
	// guaranteed to fail, though not necessarily with a `StreamTruncated`/`MetadataCorrupted`
	// distinction (spec.md §9 explicitly leaves this ambiguous). What matters for this scenario is
	// that it does not silently succeed with the wrong value.
	let result = session.deserialize::<_, Node>(spliced.as_slice(), registry());
	assert!(result.is_err());
}

#[test]
fn metadata_present_and_checksum_valid_round_trips_alongside_the_body() {
	let node: GraphRef = Rc::new(RefCell::new(Node { value: 77, next: None }));
	let session = Session::new(SessionOptions::default()).unwrap();
	let mut bytes = Vec::new();
	session.serialize(&node, &mut bytes, Some(b"v1.0")).unwrap();

	let (result, metadata) = session.deserialize::<_, Node>(bytes.as_slice(), registry()).unwrap();
	assert_eq!(result.borrow().value, 77);
	assert_eq!(metadata.as_deref(), Some(&b"v1.0"[..]));
}

/// A type exposing the legacy `ISerializable`-style contract instead of a compile-time field
/// list. Its `schema()` carries no fields of its own — under `support_legacy_contracts`, the
/// wire body is a `value::legacy_bag_schema` bag keyed by runtime-chosen names, not the fields
/// this schema declares.
#[derive(Default)]
struct LegacyBox {
	data: Vec<(String, Field)>,
}

impl GraphObject for LegacyBox {
	fn schema(&self) -> &'static TypeSchema {
		static SCHEMA: TypeSchema = TypeSchema { type_name: "LegacyBox", module: uuid::Uuid::nil(), bases: &[], fields: &[] };
		&SCHEMA
	}
	fn get_fields(&self) -> Vec<(&'static str, Field)> {
		vec![]
	}
	fn shell() -> Self {
		Self::default()
	}
	fn set_field(&mut self, _name: &str, _value: Field) {}
	fn as_legacy_contract(&self) -> Option<&dyn LegacyContract> {
		Some(self)
	}
	fn as_legacy_contract_mut(&mut self) -> Option<&mut dyn LegacyContract> {
		Some(self)
	}
}

impl LegacyContract for LegacyBox {
	fn get_object_data(&self) -> Vec<(String, Field)> {
		self.data.clone()
	}
	fn set_object_data(&mut self, data: Vec<(String, Field)>) {
		self.data = data;
	}
}

#[test]
fn a_legacy_contract_object_round_trips_through_the_built_in_bag_surrogate() {
	let obj: GraphRef = Rc::new(RefCell::new(LegacyBox {
		data: vec![("count".to_string(), Field::I32(3)), ("label".to_string(), Field::String("x".to_string()))],
	}));

	let options = SessionOptions { support_legacy_contracts: true, ..SessionOptions::default() };
	let session = Session::new(options).unwrap();
	let mut bytes = Vec::new();
	session.serialize(&obj, &mut bytes, None).unwrap();

	let mut registry = TypeRegistry::new();
	registry.register::<LegacyBox>();
	let (result, _) = session.deserialize::<_, LegacyBox>(bytes.as_slice(), registry).unwrap();
	let data = result.borrow().data.clone();
	assert_eq!(data.len(), 2);
	assert!(matches!(data.iter().find(|(n, _)| n == "count").map(|(_, v)| v), Some(Field::I32(3))));
	assert!(matches!(data.iter().find(|(n, _)| n == "label").map(|(_, v)| v), Some(Field::String(s)) if s == "x"));
}

/// A type exposing the `IXmlSerializable`-style contract.
#[derive(Default)]
struct XmlBox {
	text: String,
}

impl GraphObject for XmlBox {
	fn schema(&self) -> &'static TypeSchema {
		static SCHEMA: TypeSchema = TypeSchema { type_name: "XmlBox", module: uuid::Uuid::nil(), bases: &[], fields: &[] };
		&SCHEMA
	}
	fn get_fields(&self) -> Vec<(&'static str, Field)> {
		vec![]
	}
	fn shell() -> Self {
		Self::default()
	}
	fn set_field(&mut self, _name: &str, _value: Field) {}
	fn as_xml_contract(&self) -> Option<&dyn XmlContract> {
		Some(self)
	}
	fn as_xml_contract_mut(&mut self) -> Option<&mut dyn XmlContract> {
		Some(self)
	}
}

impl XmlContract for XmlBox {
	fn write_xml(&self) -> String {
		self.text.clone()
	}
	fn read_xml(&mut self, xml: &str) {
		self.text = xml.to_string();
	}
}

#[test]
fn an_xml_contract_object_round_trips_through_the_built_in_bag_surrogate() {
	let obj: GraphRef = Rc::new(RefCell::new(XmlBox { text: "<a>1</a>".to_string() }));

	let options = SessionOptions { support_legacy_contracts: true, ..SessionOptions::default() };
	let session = Session::new(options).unwrap();
	let mut bytes = Vec::new();
	session.serialize(&obj, &mut bytes, None).unwrap();

	let mut registry = TypeRegistry::new();
	registry.register::<XmlBox>();
	let (result, _) = session.deserialize::<_, XmlBox>(bytes.as_slice(), registry).unwrap();
	assert_eq!(result.borrow().text, "<a>1</a>");
}
