//! Configuration surface (spec.md §6), promoted to real types. Grounded on
//! `raw/assembly.rs::RuntimeFlags` for the bitset pattern.

use bitflags::bitflags;

/// How shared/cyclic references are handled on write.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum ReferencePreservation {
	/// No reference table is consulted for deduplication; cycles are rejected outright
	/// (spec.md §9 open question — the source allows `DoNotPreserve` + cycles and overflows
	/// the stack; we detect and reject instead).
	DoNotPreserve,
	/// The default: every reference-typed value gets a stable id, shared references and
	/// cycles round-trip.
	#[default]
	Preserve,
	/// Like `Preserve`, but the writer-side table holds weak references so that objects not
	/// otherwise reachable are not kept alive purely by having been serialized once.
	UseWeakReference,
}

/// Which implementation strategy drives (de)serialization.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum SerializationMethod {
	/// The only strategy this crate implements: per-type `GraphObject` impls walked at
	/// runtime (spec.md §1 calls this "the reflection-based reference implementation").
	#[default]
	Reflection,
	/// A hypothetical specialised-code-generation back-end. Recognised so callers get a clear
	/// `InvalidOperation` instead of silent fallback; spec.md §1 scopes it out of the core.
	Generated,
}

bitflags! {
	/// Bitset over the tolerances spec.md §4.B / §6 enumerates for stamp reconciliation.
	#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
	pub struct VersionTolerance: u32 {
		const ALLOW_FIELD_ADDITION          = 0x01;
		const ALLOW_FIELD_REMOVAL           = 0x02;
		const ALLOW_FIELD_MOVE              = 0x04;
		const ALLOW_ASSEMBLY_VERSION_CHANGE = 0x08;
		const ALLOW_GUID_CHANGE             = 0x10;
		const ALLOW_TYPE_NAME_CHANGE        = 0x20;
	}
}

impl VersionTolerance {
	/// The permissive default most embedders want: field addition/removal/move tolerated,
	/// identity-affecting changes (name, module, assembly version) are not.
	pub const LENIENT: VersionTolerance = VersionTolerance::ALLOW_FIELD_ADDITION
		.union(VersionTolerance::ALLOW_FIELD_REMOVAL)
		.union(VersionTolerance::ALLOW_FIELD_MOVE);
}

/// Session-wide configuration. Construction-time only: a [`crate::session::Session`] captures
/// its options at `new` and they do not change afterward.
#[derive(Debug, Clone)]
pub struct SessionOptions {
	pub reference_preservation: ReferencePreservation,
	pub serialization_method: SerializationMethod,
	pub deserialization_method: SerializationMethod,
	pub treat_collections_as_objects: bool,
	pub use_buffering: bool,
	pub disable_type_stamping: bool,
	pub force_stamp_verification: bool,
	pub version_tolerance: VersionTolerance,
	pub support_legacy_contracts: bool,
}

impl Default for SessionOptions {
	fn default() -> Self {
		Self {
			reference_preservation: ReferencePreservation::Preserve,
			serialization_method: SerializationMethod::Reflection,
			deserialization_method: SerializationMethod::Reflection,
			treat_collections_as_objects: false,
			use_buffering: false,
			disable_type_stamping: false,
			force_stamp_verification: false,
			version_tolerance: VersionTolerance::LENIENT,
			support_legacy_contracts: false,
		}
	}
}

impl SessionOptions {
	pub fn builder() -> SessionOptions {
		SessionOptions::default()
	}

	pub fn with_version_tolerance(mut self, tolerance: VersionTolerance) -> Self {
		self.version_tolerance = tolerance;
		self
	}

	pub fn with_reference_preservation(mut self, mode: ReferencePreservation) -> Self {
		self.reference_preservation = mode;
		self
	}

	pub fn with_buffering(mut self, enabled: bool) -> Self {
		self.use_buffering = enabled;
		self
	}

	pub fn with_type_stamping_disabled(mut self, disabled: bool) -> Self {
		self.disable_type_stamping = disabled;
		self
	}

	pub fn with_legacy_contracts(mut self, enabled: bool) -> Self {
		self.support_legacy_contracts = enabled;
		self
	}
}
