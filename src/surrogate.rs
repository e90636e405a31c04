//! Surrogate substitution (spec.md §4.D). A surrogate stands in for an object's own
//! `GraphObject` implementation at write/read time — the object never knows it was
//! substituted. Surrogates are tried in registration order, exact type name first, then each
//! base type name in declaration order (the "most-derived registered surrogate wins" rule);
//! a type can also be registered explicitly "blocked" (spec.md §4.D rule 4's "registered
//! callback of explicit null"), which resolves to no surrogate for that exact type without
//! falling through to a base type's registration. The table locks the moment it is first
//! consulted, so mid-stream re-registration — which would make the choice depend on *when* an
//! object was written rather than *what* it is — is rejected outright.
//!
//! Grounded on `structured/resolver.rs::DefaultAssemblyResolver`'s registry-with-fallback-chain
//! shape; SPEC_FULL.md's "Built-in surrogates" (legacy/XML contracts) are handled separately in
//! `writer.rs`/`reader.rs` via [`crate::value::GraphObject::as_legacy_contract`] and
//! `as_xml_contract`, ahead of anything registered here, since they apply by trait capability
//! rather than by registered type name.
//!
//! spec.md §4.D rule 3 ("open-generic templates... a fresh closed surrogate is synthesised by
//! substituting the runtime generic arguments") has no counterpart here: Rust monomorphises
//! generics at compile time, so every closed instantiation a program actually uses is already a
//! distinct, nameable `GraphObject` impl with its own `TypeSchema` — there is no runtime
//! generic-type-definition for a template to match against the way a CLR open generic is
//! matched. A caller with a generic wrapper type registers one concrete [`WriteSurrogate`]/
//! [`ReadSurrogate`] per monomorphisation it actually serializes, which `find`'s ordinary
//! exact-type-name lookup already covers.

use crate::error::{ReadError, WriteError};
use crate::value::{Field, GraphRef};

/// Replaces an object's own field snapshot with an alternate one at write time.
pub trait WriteSurrogate {
	fn type_name(&self) -> &'static str;
	fn substitute(&self, obj: &GraphRef) -> Vec<(&'static str, Field)>;
}

/// Rebuilds the field values to apply to an object from the substituted values actually found
/// on the wire, at read time. Mirrors [`WriteSurrogate::substitute`] rather than allocating a
/// new object outright: since a surrogate here never changes an object's stamped type (only the
/// values written under it, matching `ObjectWriter::write_body`'s behaviour), there is nothing
/// to re-point an already-resolved reference at, so `restore` hands back a plain field list that
/// the reader applies to the already-shelled instance via `GraphObject::set_field`.
pub trait ReadSurrogate {
	fn type_name(&self) -> &'static str;
	fn restore(&self, fields: Vec<(String, Field)>) -> Vec<(String, Field)>;
}

/// An ordered, lock-on-first-use registry of surrogates, generic over which side
/// ([`WriteSurrogate`] or [`ReadSurrogate`]) it holds.
pub struct SurrogateTable<S> {
	entries: Vec<S>,
	/// Exact type names registered with an explicit null surrogate (spec.md §4.D rule 4):
	/// looking one up resolves to "no surrogate" without falling through to a base type.
	blocked: Vec<&'static str>,
	locked: bool,
}

impl<S> SurrogateTable<S> {
	pub fn new() -> Self {
		Self { entries: Vec::new(), blocked: Vec::new(), locked: false }
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// Registers `type_name` as explicitly opted out of surrogate substitution, even if a base
	/// type of it has one registered (spec.md §4.D rule 4). Subject to the same lock-on-first-
	/// use gate as [`SurrogateTable::register`] on either specialization.
	fn block(&mut self, type_name: &'static str) -> Result<(), &'static str> {
		if self.locked {
			return Err("surrogates cannot be registered after the table has been consulted");
		}
		self.blocked.push(type_name);
		Ok(())
	}
}

impl<S> Default for SurrogateTable<S> {
	fn default() -> Self {
		Self::new()
	}
}

impl SurrogateTable<Box<dyn WriteSurrogate>> {
	pub fn register(&mut self, surrogate: Box<dyn WriteSurrogate>) -> Result<(), WriteError> {
		if self.locked {
			return Err(WriteError::InvalidOperation("surrogates cannot be registered after the first object has been written"));
		}
		self.entries.push(surrogate);
		Ok(())
	}

	pub fn register_none(&mut self, type_name: &'static str) -> Result<(), WriteError> {
		self.block(type_name).map_err(WriteError::InvalidOperation)
	}

	/// `bases` lists ancestor type names nearest-first. Locks the table as a side effect.
	pub fn find(&mut self, type_name: &str, bases: &[&str]) -> Option<&dyn WriteSurrogate> {
		self.locked = true;
		find_by_name(&self.entries, &self.blocked, type_name, bases, |s| s.type_name())
	}
}

impl SurrogateTable<Box<dyn ReadSurrogate>> {
	pub fn register(&mut self, surrogate: Box<dyn ReadSurrogate>) -> Result<(), ReadError> {
		if self.locked {
			return Err(ReadError::InvalidOperation("surrogates cannot be registered after the first object has been read"));
		}
		self.entries.push(surrogate);
		Ok(())
	}

	pub fn register_none(&mut self, type_name: &'static str) -> Result<(), ReadError> {
		self.block(type_name).map_err(ReadError::InvalidOperation)
	}

	pub fn find(&mut self, type_name: &str, bases: &[&str]) -> Option<&dyn ReadSurrogate> {
		self.locked = true;
		find_by_name(&self.entries, &self.blocked, type_name, bases, |s| s.type_name())
	}
}

fn find_by_name<'a, S>(entries: &'a [S], blocked: &[&'static str], type_name: &str, bases: &[&str], name_of: impl Fn(&S) -> &'static str) -> Option<&'a S> {
	if blocked.iter().any(|b| *b == type_name) {
		return None;
	}
	if let Some(s) = entries.iter().find(|s| name_of(s) == type_name) {
		return Some(s);
	}
	for base in bases {
		if let Some(s) = entries.iter().find(|s| name_of(s) == *base) {
			return Some(s);
		}
	}
	None
}
