//! String interning for document object names
//!
//! Object names recur in every path, binding key, and back-link entry.
//! Interning stores each unique name once and hands out shared `Arc<str>`
//! handles: cloning a name is a refcount bump, and equal names share storage.

use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;

/// Global name interner
static INTERNER: Lazy<Interner> = Lazy::new(Interner::new);

/// Thread-safe string interner backed by DashMap
pub struct Interner {
    names: DashMap<Arc<str>, ()>,
}

impl Interner {
    pub fn new() -> Self {
        Self {
            names: DashMap::new(),
        }
    }

    /// Intern a name, returning a shared `Arc<str>`
    ///
    /// Returns the existing Arc if the name was interned before.
    pub fn intern(&self, name: &str) -> Arc<str> {
        if let Some(existing) = self.names.get(name) {
            return Arc::clone(existing.key());
        }

        let key: Arc<str> = Arc::from(name);
        self.names.insert(Arc::clone(&key), ());
        key
    }

    /// Number of interned names
    #[allow(dead_code)] // Used in tests
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Check if empty
    #[allow(dead_code)] // Used in tests
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl Default for Interner {
    fn default() -> Self {
        Self::new()
    }
}

/// Intern an object name using the global interner
#[inline]
pub fn intern(name: &str) -> Arc<str> {
    INTERNER.intern(name)
}
