//! Arena for heap-allocated runtime objects.
//!
//! Values that don't fit in a machine word (containers, functions, cells,
//! big integers, exception instances) live in a [`Heap`] owned by one
//! interpreter, addressed by copyable [`HeapId`] handles. The arena is
//! append-only: entries stay live for the lifetime of the interpreter, so
//! handles never dangle and values stay `Copy`.

use std::sync::Arc;

use indexmap::IndexMap;
use num_bigint::BigInt;

use crate::{
    bytecode::Code,
    exception::ExcType,
    intern::StringId,
    namespace::NamespaceId,
    value::{HashKey, Value},
};

/// Index into the heap arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct HeapId(u32);

impl HeapId {
    /// Returns the raw index value.
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A user-level function: compiled code plus captured state.
#[derive(Debug, Clone)]
pub struct Function {
    /// The compiled body, shared with every frame executing it.
    pub code: Arc<Code>,
    /// Qualified name, e.g. `outer.<locals>.<lambda>`.
    pub qualname: StringId,
    /// Default values for trailing positional parameters.
    pub defaults: Vec<Value>,
    /// Default values for keyword-only parameters.
    pub kwdefaults: Vec<(StringId, Value)>,
    /// Captured cells, one per free variable of `code`.
    pub closure: Vec<HeapId>,
    /// The module globals the function was defined under.
    pub globals: NamespaceId,
}

/// A raised exception instance.
#[derive(Debug, Clone)]
pub struct ExcInstance {
    /// The exception class.
    pub exc_type: ExcType,
    /// Constructor arguments (exposed as the `args` attribute).
    pub args: Vec<Value>,
    /// Explicit cause set by `raise ... from ...`.
    pub cause: Option<Value>,
}

/// Heap-allocated object payloads.
#[derive(Debug, Clone)]
pub enum HeapData {
    /// Integer that overflowed the inline `i64` representation.
    LongInt(BigInt),
    Tuple(Vec<Value>),
    List(Vec<Value>),
    /// Insertion-ordered set; the map value is the original element, kept for
    /// iteration and repr.
    Set(IndexMap<HashKey, Value>),
    /// Insertion-ordered dict; map values are `(key, value)` pairs so repr
    /// can show the original key object.
    Dict(IndexMap<HashKey, (Value, Value)>),
    Slice {
        start: Value,
        stop: Value,
        step: Value,
    },
    Function(Function),
    /// A closure cell; `None` until first assignment.
    Cell(Option<Value>),
    /// A code object materialized as a runtime value (`LOAD_CONST` of a
    /// nested function body, consumed by `MAKE_FUNCTION`).
    Code(Arc<Code>),
    Exception(ExcInstance),
}

/// Append-only object arena owned by one interpreter.
#[derive(Debug, Default)]
pub struct Heap {
    entries: Vec<HeapData>,
}

impl Heap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a new entry and returns its handle.
    pub fn allocate(&mut self, data: HeapData) -> HeapId {
        let id = HeapId(u32::try_from(self.entries.len()).expect("heap exceeded u32 capacity"));
        self.entries.push(data);
        id
    }

    /// Returns the entry for a handle.
    ///
    /// # Panics
    ///
    /// Panics if the handle did not come from this heap.
    #[must_use]
    pub fn get(&self, id: HeapId) -> &HeapData {
        &self.entries[id.index()]
    }

    /// Returns a mutable reference to the entry for a handle.
    #[must_use]
    pub fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        &mut self.entries[id.index()]
    }
}
