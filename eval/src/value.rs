use alloc::vec::Vec;
use core::fmt;

use cranelift_entity::{PrimaryMap, entity_impl};

/// A reference to an [Object] allocated in a [Heap]
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u32);
entity_impl!(ObjectId, "obj");

/// The runtime value representation used by the evaluator
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Value {
    /// The value of nodes which do not produce one, e.g. guards
    Void,
    Int(i64),
    Bool(bool),
    Ref(ObjectId),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_ref(&self) -> Option<ObjectId> {
        match self {
            Self::Ref(id) => Some(*id),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int(value as i64)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<ObjectId> for Value {
    fn from(value: ObjectId) -> Self {
        Self::Ref(value)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Void => f.write_str("void"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Ref(id) => write!(f, "{id}"),
        }
    }
}

/// A heap object: an array of integers tagged with a type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Object {
    pub type_id: u32,
    pub elements: Vec<i64>,
}

/// The objects visible to an evaluation
#[derive(Debug, Default, Clone)]
pub struct Heap {
    objects: PrimaryMap<ObjectId, Object>,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an array of type `type_id` holding `elements`
    pub fn alloc(&mut self, type_id: u32, elements: impl IntoIterator<Item = i64>) -> Value {
        let id = self.objects.push(Object {
            type_id,
            elements: elements.into_iter().collect(),
        });
        Value::Ref(id)
    }

    #[inline]
    pub fn get(&self, id: ObjectId) -> Option<&Object> {
        self.objects.get(id)
    }

    #[inline]
    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut Object> {
        self.objects.get_mut(id)
    }
}
