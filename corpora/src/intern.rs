//! String interning.
//!
//! Author identities, label names and ref names repeat across millions
//! of mutations; the intern table canonicalizes them to one shared
//! allocation each. Interning happens during apply, while the corpus's
//! exclusive lock is already held, so the table itself needs no
//! synchronization.

use std::collections::HashSet;
use std::sync::Arc;

/// A table of canonical, shared, immutable strings.
///
/// Handles are [`Arc<str>`]: callers share the canonical value by
/// reference and can never mutate it. Entries live as long as the
/// owning corpus; the table never evicts.
#[derive(Debug, Default)]
pub struct Intern {
    strings: HashSet<Arc<str>>,
}

impl Intern {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the canonical handle for `value`, inserting it on first
    /// sight.
    pub fn intern(&mut self, value: &str) -> Arc<str> {
        if let Some(canonical) = self.strings.get(value) {
            return canonical.clone();
        }
        let canonical: Arc<str> = Arc::from(value);
        self.strings.insert(canonical.clone());

        canonical
    }

    /// Number of distinct interned values.
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}
