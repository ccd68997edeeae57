//! Host document graph
//!
//! The engine binds expressions onto properties of named objects inside a
//! `Document`. This module carries the graph bookkeeping the engine relies
//! on:
//! - JSON-valued properties with nested read/write through path segments
//! - a back-link registry (reverse edges: referenced object -> owner)
//! - the transitive in-list closure used for object-level cycle checks
//! - rename, delete, and replace-with-alias object lifecycle

use std::collections::VecDeque;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;

use crate::interner::intern;
use crate::path::{PathError, PropertyPath, Segment};

/// A single property: a JSON value plus status flags
#[derive(Debug, Clone)]
pub struct Property {
    value: Value,
    output: bool,
    touched: bool,
}

impl Property {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            output: false,
            touched: false,
        }
    }

    /// Property carrying the Output status flag
    pub fn output(value: Value) -> Self {
        Self {
            value,
            output: true,
            touched: false,
        }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn is_output(&self) -> bool {
        self.output
    }

    pub fn is_touched(&self) -> bool {
        self.touched
    }

    pub fn clear_touched(&mut self) {
        self.touched = false;
    }

    /// Read a nested value through sub-path segments
    pub fn get_path_value(&self, subpath: &[Segment]) -> Option<Value> {
        let mut current = self.value.clone();
        for segment in subpath {
            current = match segment {
                Segment::Field(name) => current.get(name)?.clone(),
                Segment::Index(idx) => current.get(*idx)?.clone(),
            };
        }
        Some(current)
    }

    /// Write a nested value through sub-path segments, marking the
    /// property touched. Returns false when an intermediate segment is
    /// missing.
    pub fn set_path_value(&mut self, subpath: &[Segment], value: Value) -> bool {
        if subpath.is_empty() {
            self.value = value;
            self.touched = true;
            return true;
        }

        let mut current = &mut self.value;
        for segment in &subpath[..subpath.len() - 1] {
            current = match segment {
                Segment::Field(name) => match current.get_mut(name) {
                    Some(v) => v,
                    None => return false,
                },
                Segment::Index(idx) => match current.get_mut(*idx) {
                    Some(v) => v,
                    None => return false,
                },
            };
        }

        let target = match &subpath[subpath.len() - 1] {
            Segment::Field(name) => current.get_mut(name.as_str()),
            Segment::Index(idx) => current.get_mut(*idx),
        };
        match target {
            Some(slot) => {
                *slot = value;
                self.touched = true;
                true
            }
            None => false,
        }
    }
}

/// A named object in the document: properties plus link bookkeeping
#[derive(Debug, Clone)]
pub struct DocumentObject {
    name: Arc<str>,
    properties: FxHashMap<String, Property>,
    /// Reverse-edge cache: owner name -> registration count
    back_links: FxHashMap<Arc<str>, usize>,
    touched: bool,
}

impl DocumentObject {
    fn new(name: Arc<str>) -> Self {
        Self {
            name,
            properties: FxHashMap::default(),
            back_links: FxHashMap::default(),
            touched: false,
        }
    }

    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// Insert a plain property
    pub fn add_property(&mut self, name: &str, value: Value) -> &mut Self {
        self.properties.insert(name.to_string(), Property::new(value));
        self
    }

    /// Insert a property carrying the Output flag
    pub fn add_output_property(&mut self, name: &str, value: Value) -> &mut Self {
        self.properties
            .insert(name.to_string(), Property::output(value));
        self
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.get(name)
    }

    pub fn property_mut(&mut self, name: &str) -> Option<&mut Property> {
        self.properties.get_mut(name)
    }

    /// Register a back-link from `owner` (multiset: counts registrations)
    pub fn add_back_link(&mut self, owner: &Arc<str>) {
        *self.back_links.entry(Arc::clone(owner)).or_insert(0) += 1;
    }

    /// Withdraw one back-link registration from `owner`
    pub fn remove_back_link(&mut self, owner: &Arc<str>) {
        if let Some(count) = self.back_links.get_mut(owner) {
            *count -= 1;
            if *count == 0 {
                self.back_links.remove(owner);
            }
        }
    }

    /// Current registration count for `owner`
    pub fn back_link_count(&self, owner: &str) -> usize {
        self.back_links.get(owner).copied().unwrap_or(0)
    }

    /// Total registrations across all owners
    pub fn back_links_total(&self) -> usize {
        self.back_links.values().sum()
    }

    pub fn touch(&mut self) {
        self.touched = true;
    }

    pub fn is_touched(&self) -> bool {
        self.touched
    }
}

/// The host document: named objects plus replacement aliases
#[derive(Debug, Default)]
pub struct Document {
    objects: FxHashMap<Arc<str>, DocumentObject>,
    /// Replaced-object redirects consumed by link adjustment
    aliases: FxHashMap<Arc<str>, Arc<str>>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an empty object, returning it for property population
    pub fn add_object(&mut self, name: &str) -> &mut DocumentObject {
        let name = intern(name);
        self.objects
            .entry(Arc::clone(&name))
            .or_insert_with(|| DocumentObject::new(name))
    }

    pub fn contains_object(&self, name: &str) -> bool {
        self.objects.contains_key(name)
    }

    pub fn object(&self, name: &str) -> Option<&DocumentObject> {
        self.objects.get(name)
    }

    pub fn object_mut(&mut self, name: &str) -> Option<&mut DocumentObject> {
        self.objects.get_mut(name)
    }

    /// Delete an object outright
    pub fn remove_object(&mut self, name: &str) -> Option<DocumentObject> {
        self.objects.remove(name)
    }

    /// Rename an object in place, keeping properties and back-links
    pub fn rename_object(&mut self, old: &str, new: &str) -> bool {
        let Some(mut object) = self.objects.remove(old) else {
            return false;
        };
        let new_name = intern(new);
        object.name = Arc::clone(&new_name);
        self.objects.insert(new_name, object);
        true
    }

    /// Remove an object and record a redirect to its replacement
    ///
    /// Expressions still referencing the removed object are rewired by the
    /// engine's link adjustment pass, which follows the alias.
    pub fn replace_object(&mut self, old: &str, new: &str) {
        self.objects.remove(old);
        self.aliases.insert(intern(old), intern(new));
    }

    /// Follow the alias chain from `name` to a live object, if any
    pub fn resolve_alias(&self, name: &str) -> Option<Arc<str>> {
        let mut current = self.aliases.get(name)?;
        // Chains are short; the hop cap only guards a malformed alias loop
        for _ in 0..self.aliases.len() {
            match self.aliases.get(current.as_ref()) {
                Some(next) => current = next,
                None => break,
            }
        }
        self.objects.contains_key(current.as_ref()).then(|| Arc::clone(current))
    }

    /// Reverse-link closure of `name`: every object that depends on it
    /// through a back-link, expanded transitively when requested
    pub fn in_list(&self, name: &str, transitive: bool) -> FxHashSet<Arc<str>> {
        let mut result: FxHashSet<Arc<str>> = FxHashSet::default();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(name);

        while let Some(current) = queue.pop_front() {
            let Some(object) = self.objects.get(current) else {
                continue;
            };
            for owner in object.back_links.keys() {
                if result.insert(Arc::clone(owner)) && transitive {
                    queue.push_back(owner.as_ref());
                }
            }
        }
        result
    }

    /// Parse a user-form path string against this document's object names
    pub fn parse_path(&self, path: &str) -> Result<PropertyPath, PathError> {
        PropertyPath::parse(path, |name| self.objects.contains_key(name))
    }

    /// Resolve a canonical path to its property
    pub fn property_at(&self, path: &PropertyPath) -> Option<&Property> {
        let object = self.objects.get(path.object()?.as_ref())?;
        object.property(path.property())
    }

    /// Read the value a canonical path points at
    pub fn get_path_value(&self, path: &PropertyPath) -> Option<Value> {
        self.property_at(path)?.get_path_value(path.subpath())
    }

    /// Write through a canonical path, touching property and object
    pub fn set_path_value(&mut self, path: &PropertyPath, value: Value) -> bool {
        let Some(object_name) = path.object() else {
            return false;
        };
        let Some(object) = self.objects.get_mut(object_name.as_ref()) else {
            return false;
        };
        let Some(property) = object.properties.get_mut(path.property()) else {
            return false;
        };
        if !property.set_path_value(path.subpath(), value) {
            return false;
        }
        object.touched = true;
        true
    }
}
