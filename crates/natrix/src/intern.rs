//! String interning for identifiers and string values.
//!
//! All guest-visible strings (identifiers, names, string literals, and
//! strings produced at runtime) are stored once in an [`Interns`] table and
//! referred to by [`StringId`]. Comparing two interned strings is an integer
//! comparison, and bytecode operands can address names with a plain index.
//!
//! Well-known strings are pre-seeded by [`StaticStrings`] so code can refer
//! to them without a lookup: their ids equal the enum discriminant.

use ahash::AHashMap;
use strum::{EnumCount, IntoEnumIterator};

/// Index into the string interner's storage.
///
/// Uses `u32` to save space. Ids are only meaningful together with the
/// `Interns` table that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
pub struct StringId(u32);

impl StringId {
    /// Reconstructs a StringId from a bytecode operand.
    ///
    /// The caller is responsible for ensuring the index is valid for the
    /// interner the bytecode was compiled against.
    #[inline]
    #[must_use]
    pub fn from_index(index: u32) -> Self {
        Self(index)
    }

    /// Returns the raw index value.
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// String values which are known at compile time and pre-seeded into every
/// interner. `StringId::from(static_string)` is the id of the spelling.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::EnumCount,
    strum::EnumIter,
    strum::IntoStaticStr,
    strum::Display,
)]
#[strum(serialize_all = "snake_case")]
pub enum StaticStrings {
    #[strum(serialize = "")]
    EmptyString,
    #[strum(serialize = "<module>")]
    Module,
    #[strum(serialize = "<lambda>")]
    Lambda,
    #[strum(serialize = "_")]
    Underscore,
    #[strum(serialize = "__doc__")]
    DunderDoc,
    #[strum(serialize = "__name__")]
    DunderName,
    #[strum(serialize = "__qualname__")]
    DunderQualname,
    #[strum(serialize = "args")]
    Args,
    #[strum(serialize = "sep")]
    Sep,
    #[strum(serialize = "end")]
    End,
    AssertionError,
}

impl From<StaticStrings> for StringId {
    fn from(s: StaticStrings) -> Self {
        StringId(s as u32)
    }
}

/// Interned string storage owned by one interpreter.
///
/// The table grows monotonically; nothing is ever removed. Two interpreters
/// never share a table, so ids must not cross interpreter boundaries.
#[derive(Debug)]
pub struct Interns {
    strings: Vec<String>,
    ids: AHashMap<String, StringId>,
}

impl Interns {
    /// Creates a new interner pre-seeded with every [`StaticStrings`] entry.
    #[must_use]
    pub fn new() -> Self {
        let mut interns = Self {
            strings: Vec::with_capacity(StaticStrings::COUNT + 16),
            ids: AHashMap::with_capacity(StaticStrings::COUNT + 16),
        };
        for s in StaticStrings::iter() {
            let text: &'static str = s.into();
            let id = interns.intern(text);
            debug_assert_eq!(id, StringId::from(s), "static string id out of order");
        }
        interns
    }

    /// Interns a string, returning the existing id if it is already present.
    pub fn intern(&mut self, s: &str) -> StringId {
        if let Some(&id) = self.ids.get(s) {
            return id;
        }
        let id = StringId(u32::try_from(self.strings.len()).expect("interner exceeded u32 capacity"));
        self.strings.push(s.to_owned());
        self.ids.insert(s.to_owned(), id);
        id
    }

    /// Interns an owned string without an extra copy on the miss path.
    pub fn intern_owned(&mut self, s: String) -> StringId {
        if let Some(&id) = self.ids.get(s.as_str()) {
            return id;
        }
        let id = StringId(u32::try_from(self.strings.len()).expect("interner exceeded u32 capacity"));
        self.strings.push(s.clone());
        self.ids.insert(s, id);
        id
    }

    /// Returns the text for an id.
    ///
    /// # Panics
    ///
    /// Panics if the id did not come from this interner.
    #[must_use]
    pub fn get_str(&self, id: StringId) -> &str {
        &self.strings[id.index()]
    }

    /// Looks up the id for a string without interning it.
    #[must_use]
    pub fn lookup(&self, s: &str) -> Option<StringId> {
        self.ids.get(s).copied()
    }
}

impl Default for Interns {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_strings_are_pre_seeded() {
        let interns = Interns::new();
        assert_eq!(interns.get_str(StaticStrings::Module.into()), "<module>");
        assert_eq!(interns.get_str(StaticStrings::Lambda.into()), "<lambda>");
        assert_eq!(interns.get_str(StaticStrings::EmptyString.into()), "");
    }

    #[test]
    fn intern_dedups() {
        let mut interns = Interns::new();
        let a = interns.intern("spam");
        let b = interns.intern("spam");
        let c = interns.intern("eggs");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(interns.get_str(a), "spam");
    }

    #[test]
    fn static_string_lookup_matches_intern() {
        let mut interns = Interns::new();
        assert_eq!(interns.intern("AssertionError"), StaticStrings::AssertionError.into());
    }
}
