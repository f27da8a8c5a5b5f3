//! Memory locations and the backing store.
//!
//! A [`MemoryLocation`] is the uniform handle for every shared memory cell
//! the engine intercepts: a static field, an instance field, an array
//! element, or the cell of an atomic wrapper object. Equality is structural
//! over the variant and its fields, so the engine can index accesses per
//! location.
//!
//! [`MemoryStore`] is the value mapper behind the locations: it resolves an
//! `ObjectId` back to live slots and performs the actual reads and writes.
//! Field lookup first hits the object's own slot table directly and only
//! then falls back to a class-hierarchy walk, which tolerates renamed
//! classes by dot-suffix matching (a loader may have prefixed the name).

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::value::{ObjectId, ValueId, STATIC_OBJECT_ID};

/// A shared memory cell.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum MemoryLocation {
    StaticField {
        class: Arc<str>,
        field: Arc<str>,
    },
    ObjectField {
        object: ObjectId,
        class: Arc<str>,
        field: Arc<str>,
    },
    ArrayElement {
        object: ObjectId,
        index: usize,
    },
    AtomicPrimitive {
        object: ObjectId,
    },
}

impl MemoryLocation {
    /// Convenience constructor for a static field location.
    pub fn static_field(class: &str, field: &str) -> Self {
        MemoryLocation::StaticField {
            class: Arc::from(class),
            field: Arc::from(field),
        }
    }

    /// Convenience constructor for an instance field location.
    pub fn object_field(object: ObjectId, class: &str, field: &str) -> Self {
        MemoryLocation::ObjectField {
            object,
            class: Arc::from(class),
            field: Arc::from(field),
        }
    }

    /// The object owning this cell ([`STATIC_OBJECT_ID`] for statics).
    pub fn object_id(&self) -> ObjectId {
        match self {
            MemoryLocation::StaticField { .. } => STATIC_OBJECT_ID,
            MemoryLocation::ObjectField { object, .. }
            | MemoryLocation::ArrayElement { object, .. }
            | MemoryLocation::AtomicPrimitive { object } => *object,
        }
    }

    /// Read this location through the given store.
    pub fn read(&self, store: &MemoryStore) -> Result<ValueId, StoreError> {
        store.read(self)
    }

    /// Write this location through the given store.
    pub fn write(&self, store: &mut MemoryStore, value: ValueId) -> Result<(), StoreError> {
        store.write(self, value)
    }
}

impl std::fmt::Display for MemoryLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryLocation::StaticField { class, field } => write!(f, "{class}.{field}"),
            MemoryLocation::ObjectField {
                object,
                class,
                field,
            } => write!(f, "{class}@{object}.{field}"),
            MemoryLocation::ArrayElement { object, index } => write!(f, "@{object}[{index}]"),
            MemoryLocation::AtomicPrimitive { object } => write!(f, "atomic@{object}"),
        }
    }
}

/// Errors from resolving or accessing a memory location.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown object {0}")]
    UnknownObject(ObjectId),

    #[error("unknown class '{0}'")]
    UnknownClass(String),

    #[error("no field '{field}' in class '{class}' or its ancestors")]
    UnknownField { class: String, field: String },

    #[error("index {index} out of bounds for array @{object} of length {len}")]
    IndexOutOfBounds {
        object: ObjectId,
        index: usize,
        len: usize,
    },

    #[error("object @{0} is not an array")]
    NotAnArray(ObjectId),

    #[error("object @{0} is not an atomic cell")]
    NotAtomic(ObjectId),

    #[error("object @{0} has no fields")]
    NotAnObject(ObjectId),
}

/// Class metadata: name, superclass, declared fields.
#[derive(Clone, Debug)]
pub struct ClassDescriptor {
    pub name: Arc<str>,
    pub parent: Option<Arc<str>>,
    pub fields: Vec<Arc<str>>,
}

enum ObjectData {
    Plain {
        class: Arc<str>,
        fields: HashMap<Arc<str>, ValueId>,
    },
    Array {
        elements: Vec<ValueId>,
    },
    Atomic {
        cell: ValueId,
    },
}

/// Returns true if the class names refer to the same class, tolerating a
/// loader-added dotted prefix on either side.
fn class_names_match(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    let suffix_of = |long: &str, short: &str| {
        long.len() > short.len()
            && long.ends_with(short)
            && long.as_bytes()[long.len() - short.len() - 1] == b'.'
    };
    suffix_of(a, b) || suffix_of(b, a)
}

/// The live memory behind [`MemoryLocation`]s.
#[derive(Default)]
pub struct MemoryStore {
    classes: Vec<ClassDescriptor>,
    statics: HashMap<(Arc<str>, Arc<str>), ValueId>,
    objects: HashMap<ObjectId, ObjectData>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a class with its superclass and declared fields.
    pub fn register_class(&mut self, name: &str, parent: Option<&str>, fields: &[&str]) {
        self.classes.push(ClassDescriptor {
            name: Arc::from(name),
            parent: parent.map(Arc::from),
            fields: fields.iter().map(|f| Arc::from(*f)).collect(),
        });
    }

    /// Register a plain object of the given class.
    pub fn insert_object(&mut self, object: ObjectId, class: &str) {
        self.objects.insert(
            object,
            ObjectData::Plain {
                class: Arc::from(class),
                fields: HashMap::new(),
            },
        );
    }

    /// Register an array object with `len` elements initialized to `init`.
    pub fn insert_array(&mut self, object: ObjectId, len: usize, init: ValueId) {
        self.objects.insert(
            object,
            ObjectData::Array {
                elements: vec![init; len],
            },
        );
    }

    /// Register an atomic wrapper object.
    pub fn insert_atomic(&mut self, object: ObjectId, init: ValueId) {
        self.objects.insert(object, ObjectData::Atomic { cell: init });
    }

    /// Find a registered class by (possibly renamed) name. Exact matches
    /// win over suffix matches.
    fn find_class(&self, name: &str) -> Option<&ClassDescriptor> {
        self.classes
            .iter()
            .find(|c| &*c.name == name)
            .or_else(|| self.classes.iter().find(|c| class_names_match(&c.name, name)))
    }

    /// Walk the class chain starting at `class` until a class declaring
    /// `field` is found. Returns the declaring class name.
    fn resolve_field(&self, class: &str, field: &str) -> Result<Arc<str>, StoreError> {
        let mut current = self
            .find_class(class)
            .ok_or_else(|| StoreError::UnknownClass(class.to_owned()))?;
        loop {
            if current.fields.iter().any(|f| &**f == field) {
                return Ok(Arc::clone(&current.name));
            }
            match &current.parent {
                Some(parent) => {
                    current = self
                        .find_class(parent)
                        .ok_or_else(|| StoreError::UnknownClass(parent.to_string()))?;
                }
                None => {
                    return Err(StoreError::UnknownField {
                        class: class.to_owned(),
                        field: field.to_owned(),
                    })
                }
            }
        }
    }

    pub fn read(&self, location: &MemoryLocation) -> Result<ValueId, StoreError> {
        match location {
            MemoryLocation::StaticField { class, field } => {
                let declaring = self.resolve_field(class, field)?;
                Ok(self
                    .statics
                    .get(&(declaring, Arc::clone(field)))
                    .copied()
                    .unwrap_or(ValueId::Null))
            }
            MemoryLocation::ObjectField {
                object,
                class,
                field,
            } => match self.objects.get(object) {
                Some(ObjectData::Plain { fields, .. }) => {
                    // Fast path: the slot already exists under the plain
                    // field name. The hierarchy walk is the fallback.
                    if let Some(v) = fields.get(field) {
                        return Ok(*v);
                    }
                    self.resolve_field(class, field)?;
                    Ok(ValueId::Null)
                }
                Some(_) => Err(StoreError::NotAnObject(*object)),
                None => Err(StoreError::UnknownObject(*object)),
            },
            MemoryLocation::ArrayElement { object, index } => match self.objects.get(object) {
                Some(ObjectData::Array { elements }) => {
                    elements
                        .get(*index)
                        .copied()
                        .ok_or(StoreError::IndexOutOfBounds {
                            object: *object,
                            index: *index,
                            len: elements.len(),
                        })
                }
                Some(_) => Err(StoreError::NotAnArray(*object)),
                None => Err(StoreError::UnknownObject(*object)),
            },
            MemoryLocation::AtomicPrimitive { object } => match self.objects.get(object) {
                Some(ObjectData::Atomic { cell }) => Ok(*cell),
                Some(_) => Err(StoreError::NotAtomic(*object)),
                None => Err(StoreError::UnknownObject(*object)),
            },
        }
    }

    pub fn write(&mut self, location: &MemoryLocation, value: ValueId) -> Result<(), StoreError> {
        match location {
            MemoryLocation::StaticField { class, field } => {
                let declaring = self.resolve_field(class, field)?;
                self.statics.insert((declaring, Arc::clone(field)), value);
                Ok(())
            }
            MemoryLocation::ObjectField {
                object,
                class,
                field,
            } => {
                // Resolution must succeed before mutating, so a bad class
                // name never creates a phantom slot.
                match self.objects.get(object) {
                    Some(ObjectData::Plain { fields, .. }) if fields.contains_key(field) => {}
                    Some(ObjectData::Plain { .. }) => {
                        self.resolve_field(class, field)?;
                    }
                    Some(_) => return Err(StoreError::NotAnObject(*object)),
                    None => return Err(StoreError::UnknownObject(*object)),
                }
                let Some(ObjectData::Plain { fields, .. }) = self.objects.get_mut(object) else {
                    unreachable!("checked above");
                };
                fields.insert(Arc::clone(field), value);
                Ok(())
            }
            MemoryLocation::ArrayElement { object, index } => match self.objects.get_mut(object) {
                Some(ObjectData::Array { elements }) => {
                    let len = elements.len();
                    let slot = elements.get_mut(*index).ok_or(StoreError::IndexOutOfBounds {
                        object: *object,
                        index: *index,
                        len,
                    })?;
                    *slot = value;
                    Ok(())
                }
                Some(_) => Err(StoreError::NotAnArray(*object)),
                None => Err(StoreError::UnknownObject(*object)),
            },
            MemoryLocation::AtomicPrimitive { object } => match self.objects.get_mut(object) {
                Some(ObjectData::Atomic { cell }) => {
                    *cell = value;
                    Ok(())
                }
                Some(_) => Err(StoreError::NotAtomic(*object)),
                None => Err(StoreError::UnknownObject(*object)),
            },
        }
    }
}
