//! The reference table (spec.md §4.C). Gives every reference-typed value a stream-local
//! [`ObjectId`], preserving sharing and cycles across a write/read pass. Both sides key on
//! pointer identity rather than structural equality — two distinct objects that happen to
//! compare equal still get distinct ids.
//!
//! Grounded on `schema/type.rs::TypePool`'s `HashMap<*const Type, _, BuildNoHashHasher<usize>>`
//! for the "pointer as hash key" pattern; the writer/reader split (a fill-as-you-go queue vs. an
//! index-addressable vector) is this crate's own design, sized to spec.md §3's lifecycle: an
//! object is discovered once, queued once, and its body is written/populated exactly once.

use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};

use nohash_hasher::BuildNoHashHasher;

use crate::error::ReadError;
use crate::ids::{ObjectId, ROOT_OBJECT_ID};
use crate::value::{DynGraphObject, GraphRef};

fn identity_of(obj: &GraphRef) -> usize {
	Rc::as_ptr(obj) as *const () as usize
}

/// A queued object held either by a strong or a weak handle, depending on the session's
/// [`crate::config::ReferencePreservation`] mode.
enum QueuedRef {
	Strong(GraphRef),
	/// `ReferencePreservation::UseWeakReference`: the table does not itself keep the object
	/// alive past the point the caller's own graph stops referencing it — spec.md §6 describes
	/// this as a distinct mode from `Preserve`, and `config.rs` documents the rationale.
	Weak(Weak<std::cell::RefCell<dyn DynGraphObject>>),
}

impl QueuedRef {
	fn upgrade(&self) -> Option<GraphRef> {
		match self {
			QueuedRef::Strong(obj) => Some(obj.clone()),
			QueuedRef::Weak(weak) => weak.upgrade(),
		}
	}
}

/// Writer-side object → id map plus a FIFO of objects discovered but not yet written.
///
/// Persists across multiple `write_object` calls on the same session (spec.md §4.E: "the
/// reference table... persist between calls, enabling deduplication across consecutive
/// writes"), so only the very first object ever assigned by a session receives [`ROOT_OBJECT_ID`].
pub struct WriterRefTable {
	ids: HashMap<usize, ObjectId, BuildNoHashHasher<usize>>,
	queue: VecDeque<(ObjectId, QueuedRef)>,
	next_id: ObjectId,
	use_weak: bool,
}

impl WriterRefTable {
	pub fn new() -> Self {
		Self::with_weak_references(false)
	}

	pub fn with_weak_references(use_weak: bool) -> Self {
		Self { ids: HashMap::default(), queue: VecDeque::new(), next_id: ROOT_OBJECT_ID, use_weak }
	}

	/// Returns the id for `obj`, assigning a fresh one and queuing it for body-writing if this
	/// is the first time this exact object has been seen. The `bool` is `true` on first sight.
	pub fn assign_or_fetch(&mut self, obj: &GraphRef) -> (ObjectId, bool) {
		let key = identity_of(obj);
		if let Some(id) = self.ids.get(&key) {
			return (*id, false);
		}
		let id = self.next_id;
		self.next_id = self.next_id.next();
		self.ids.insert(key, id);
		let queued = if self.use_weak { QueuedRef::Weak(Rc::downgrade(obj)) } else { QueuedRef::Strong(obj.clone()) };
		self.queue.push_back((id, queued));
		(id, true)
	}

	/// Dequeues the next object awaiting its body write, in discovery order. `Some((id, None))`
	/// means a weakly-held object was dropped by the caller before the writer could reach it
	/// (`UseWeakReference` only — a strongly-held queue entry always upgrades).
	pub fn take_next_unwritten(&mut self) -> Option<(ObjectId, Option<GraphRef>)> {
		let (id, queued) = self.queue.pop_front()?;
		Some((id, queued.upgrade()))
	}

	pub fn is_empty_queue(&self) -> bool {
		self.queue.is_empty()
	}
}

impl Default for WriterRefTable {
	fn default() -> Self {
		Self::new()
	}
}

/// Reader-side id → shell map plus a FIFO of reserved-but-unpopulated shells awaiting their
/// field data (spec.md §4.F: a shell is allocated the moment its id is first referenced, and
/// populated only once its body is actually read off the stream).
pub struct ReaderRefTable {
	objects: HashMap<u32, GraphRef, BuildNoHashHasher<u32>>,
	queue: VecDeque<ObjectId>,
	high_water_mark: u32,
	next_id: ObjectId,
}

impl ReaderRefTable {
	pub fn new() -> Self {
		Self { objects: HashMap::default(), queue: VecDeque::new(), high_water_mark: 0, next_id: ROOT_OBJECT_ID }
	}

	/// Registers `shell` under `id`, queuing it for body population. No-op if `id` is already
	/// reserved (a backward reference arriving a second time, e.g. through a cycle). `id` comes
	/// from an explicit reference-site byte sequence, so this also advances the counter
	/// [`Self::reserve_next`] draws from, keeping it in lockstep with the writer's.
	pub fn reserve(&mut self, id: ObjectId, shell: GraphRef) {
		if self.objects.contains_key(&id.0) {
			return;
		}
		self.objects.insert(id.0, shell);
		if id.0 >= self.high_water_mark {
			self.high_water_mark = id.0 + 1;
		}
		if id.next() > self.next_id {
			self.next_id = id.next();
		}
		self.queue.push_back(id);
	}

	/// Synthesizes the id for an object the stream never names explicitly — the root of a
	/// `read_object` call, which the writer likewise never writes a reference site for (see
	/// `writer.rs::ObjectWriter::write_object`). Valid only because both sides allocate from the
	/// same monotonic counter in the same discovery order.
	pub fn reserve_next(&mut self, shell: GraphRef) -> ObjectId {
		let id = self.next_id;
		self.reserve(id, shell);
		id
	}

	pub fn is_reserved(&self, id: ObjectId) -> bool {
		self.objects.contains_key(&id.0)
	}

	/// Fetches the shell registered under `id`. Spec.md §4.F: referencing an id beyond the
	/// high-water mark is a stream corruption, not a lazy-allocation opportunity — ids are only
	/// ever minted by the writer in discovery order.
	pub fn resolve(&self, id: ObjectId) -> Result<GraphRef, ReadError> {
		self.objects.get(&id.0).cloned().ok_or(ReadError::UnresolvedObjectId(id))
	}

	/// Dequeues the next reserved shell awaiting body population, in reservation order —
	/// this is also the order spec.md §4.F requires `on_post_deserialize` hooks to fire in.
	pub fn take_next_unpopulated(&mut self) -> Option<(ObjectId, GraphRef)> {
		let id = self.queue.pop_front()?;
		let obj = self.objects.get(&id.0).cloned()?;
		Some((id, obj))
	}
}

impl Default for ReaderRefTable {
	fn default() -> Self {
		Self::new()
	}
}
