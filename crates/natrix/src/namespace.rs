//! Name-to-value dictionaries shared between frames.
//!
//! Frames reference their locals, globals, and builtins dictionaries by
//! [`NamespaceId`] into a central arena rather than holding the maps
//! directly. A module frame aliases locals and globals to the same id, and
//! every function defined in a module shares that module's globals id, all
//! without aliased `&mut` access.

use ahash::AHashMap;

use crate::{intern::StringId, value::Value};

/// Handle to one namespace in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct NamespaceId(u32);

impl NamespaceId {
    /// Returns the raw index value.
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Storage for all namespaces of one interpreter.
#[derive(Debug, Default)]
pub struct Namespaces {
    spaces: Vec<AHashMap<StringId, Value>>,
}

impl Namespaces {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh empty namespace.
    pub fn allocate(&mut self) -> NamespaceId {
        let id = NamespaceId(u32::try_from(self.spaces.len()).expect("namespace arena exceeded u32 capacity"));
        self.spaces.push(AHashMap::new());
        id
    }

    /// Looks up a name.
    #[must_use]
    pub fn get(&self, ns: NamespaceId, name: StringId) -> Option<Value> {
        self.spaces[ns.index()].get(&name).copied()
    }

    /// Binds a name.
    pub fn set(&mut self, ns: NamespaceId, name: StringId, value: Value) {
        self.spaces[ns.index()].insert(name, value);
    }

    /// Unbinds a name, returning whether it was bound.
    pub fn remove(&mut self, ns: NamespaceId, name: StringId) -> bool {
        self.spaces[ns.index()].remove(&name).is_some()
    }

    /// Iterates the bindings of one namespace.
    pub fn iter(&self, ns: NamespaceId) -> impl Iterator<Item = (StringId, Value)> + '_ {
        self.spaces[ns.index()].iter().map(|(&k, &v)| (k, v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_remove() {
        let mut namespaces = Namespaces::new();
        let ns = namespaces.allocate();
        let name = StringId::from_index(3);
        assert_eq!(namespaces.get(ns, name), None);
        namespaces.set(ns, name, Value::Int(1));
        assert_eq!(namespaces.get(ns, name), Some(Value::Int(1)));
        assert!(namespaces.remove(ns, name));
        assert!(!namespaces.remove(ns, name));
    }

    #[test]
    fn namespaces_are_independent() {
        let mut namespaces = Namespaces::new();
        let a = namespaces.allocate();
        let b = namespaces.allocate();
        let name = StringId::from_index(1);
        namespaces.set(a, name, Value::Int(1));
        assert_eq!(namespaces.get(b, name), None);
    }
}
