//! Object identifiers, value identifiers, and the object registry.
//!
//! Every live object touched by an exploration gets a stable `ObjectId`.
//! Values flowing through the event structure are `ValueId`s: either null,
//! a primitive embedded by value, or an object reference by id. Primitives
//! compare by value, objects by identity (their id).
//!
//! The registry maps live object references to ids and back. Objects
//! created *before* the test starts are "external": they are registered
//! against the root initialization event and survive exploration resets.
//! Everything else is re-registered during replay, when the allocation
//! events are replayed with their original ids.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::event::EventId;

/// Identifies a shared object. Allocated sequentially by [`ObjectRegistry`].
pub type ObjectId = u64;

/// The null reference.
pub const NULL_OBJECT_ID: ObjectId = 0;
/// Pseudo-object owning all static fields.
pub const STATIC_OBJECT_ID: ObjectId = 1;
/// Sentinel for uninitialized id slots.
pub const INVALID_OBJECT_ID: ObjectId = u64::MAX;

const FIRST_ALLOCATED_ID: ObjectId = 2;

/// A primitive value with its exact width preserved.
///
/// Floats are stored as raw bits so the type stays `Eq + Hash`; two floats
/// are equal exactly when their bit patterns are.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PrimitiveValue {
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    Char(char),
    F32(u32),
    F64(u64),
}

impl PrimitiveValue {
    pub fn from_f32(v: f32) -> Self {
        PrimitiveValue::F32(v.to_bits())
    }

    pub fn from_f64(v: f64) -> Self {
        PrimitiveValue::F64(v.to_bits())
    }

    pub fn as_f32(self) -> Option<f32> {
        match self {
            PrimitiveValue::F32(bits) => Some(f32::from_bits(bits)),
            _ => None,
        }
    }

    pub fn as_f64(self) -> Option<f64> {
        match self {
            PrimitiveValue::F64(bits) => Some(f64::from_bits(bits)),
            _ => None,
        }
    }

    /// Widen to i64 for arithmetic, if this is an integer.
    pub fn as_int(self) -> Option<i64> {
        match self {
            PrimitiveValue::I8(v) => Some(v as i64),
            PrimitiveValue::I16(v) => Some(v as i64),
            PrimitiveValue::I32(v) => Some(v as i64),
            PrimitiveValue::I64(v) => Some(v),
            _ => None,
        }
    }
}

/// A value as recorded in event labels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueId {
    Null,
    Primitive(PrimitiveValue),
    Object(ObjectId),
}

impl ValueId {
    pub fn int(v: i64) -> Self {
        ValueId::Primitive(PrimitiveValue::I64(v))
    }

    pub fn i32(v: i32) -> Self {
        ValueId::Primitive(PrimitiveValue::I32(v))
    }

    pub fn bool(v: bool) -> Self {
        ValueId::Primitive(PrimitiveValue::Bool(v))
    }

    pub fn as_int(self) -> Option<i64> {
        match self {
            ValueId::Primitive(p) => p.as_int(),
            _ => None,
        }
    }

    pub fn as_bool(self) -> Option<bool> {
        match self {
            ValueId::Primitive(PrimitiveValue::Bool(b)) => Some(b),
            _ => None,
        }
    }
}

/// An opaque reference to a live object under test.
pub type ObjectRef = Arc<dyn Any + Send + Sync>;

fn identity_key(value: &ObjectRef) -> usize {
    // Identity is the Arc data pointer; the vtable half is irrelevant.
    Arc::as_ptr(value) as *const () as usize
}

/// Registry entry for one live object.
pub struct ObjectEntry {
    pub id: ObjectId,
    pub value: ObjectRef,
    /// The event that allocated this object (the root for externals).
    pub allocation: EventId,
    /// True if the object predates the test start.
    pub external: bool,
}

/// Monotonic allocator of [`ObjectId`]s with value→id and id→entry maps.
#[derive(Default)]
pub struct ObjectRegistry {
    next: ObjectId,
    by_identity: HashMap<usize, ObjectId>,
    entries: HashMap<ObjectId, ObjectEntry>,
}

/// Result of [`ObjectRegistry::compute_value_id`] for an object input.
pub struct ComputedId {
    pub value: ValueId,
    /// True if this call registered a previously unseen (external) object.
    pub newly_external: bool,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self {
            next: FIRST_ALLOCATED_ID,
            by_identity: HashMap::new(),
            entries: HashMap::new(),
        }
    }

    /// Register an object allocated by the test at `allocation`.
    ///
    /// Used on the fresh-allocation path; replayed allocations go through
    /// [`ObjectRegistry::register_replayed`] with their original id.
    pub fn register_allocation(&mut self, value: ObjectRef, allocation: EventId) -> ObjectId {
        let id = self.next;
        self.next += 1;
        self.insert(id, value, allocation, false);
        id
    }

    /// Re-register a replayed allocation under its original id, binding it
    /// to the fresh live object of the current run.
    pub fn register_replayed(&mut self, id: ObjectId, value: ObjectRef, allocation: EventId) {
        debug_assert!(id < self.next, "replayed id was never allocated");
        self.insert(id, value, allocation, false);
    }

    /// Register an object that predates the test start.
    pub fn register_external(&mut self, value: ObjectRef, root: EventId) -> ObjectId {
        let id = self.next;
        self.next += 1;
        self.insert(id, value, root, true);
        id
    }

    fn insert(&mut self, id: ObjectId, value: ObjectRef, allocation: EventId, external: bool) {
        self.by_identity.insert(identity_key(&value), id);
        self.entries.insert(
            id,
            ObjectEntry {
                id,
                value,
                allocation,
                external,
            },
        );
    }

    /// Map a runtime value to its [`ValueId`].
    ///
    /// Null and primitives embed directly. A known object resolves to its
    /// cached id; an unknown object must have been created before the test
    /// started, so it is registered as external against `root`.
    pub fn compute_value_id(&mut self, value: Option<&ObjectRef>, root: EventId) -> ComputedId {
        let Some(obj) = value else {
            return ComputedId {
                value: ValueId::Null,
                newly_external: false,
            };
        };
        if let Some(&id) = self.by_identity.get(&identity_key(obj)) {
            return ComputedId {
                value: ValueId::Object(id),
                newly_external: false,
            };
        }
        let id = self.register_external(Arc::clone(obj), root);
        ComputedId {
            value: ValueId::Object(id),
            newly_external: true,
        }
    }

    /// Resolve an id back to its entry.
    pub fn get(&self, id: ObjectId) -> Option<&ObjectEntry> {
        self.entries.get(&id)
    }

    /// Resolve an id back to the live object.
    pub fn get_value(&self, id: ObjectId) -> Option<&ObjectRef> {
        self.entries.get(&id).map(|e| &e.value)
    }

    /// The allocation event of an object, if registered.
    pub fn allocation_of(&self, id: ObjectId) -> Option<EventId> {
        self.entries.get(&id).map(|e| e.allocation)
    }

    /// Fix up the allocation event of an entry registered before its
    /// allocation event existed.
    pub fn set_allocation(&mut self, id: ObjectId, allocation: EventId) {
        if let Some(e) = self.entries.get_mut(&id) {
            e.allocation = allocation;
        }
    }

    /// Drop all entries not matching the predicate. Used on backtracking to
    /// drop every non-external entry; replay re-registers them.
    pub fn retain(&mut self, mut keep: impl FnMut(&ObjectEntry) -> bool) {
        let by_identity = &mut self.by_identity;
        self.entries.retain(|_, e| {
            let keep = keep(e);
            if !keep {
                by_identity.remove(&identity_key(&e.value));
            }
            keep
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
