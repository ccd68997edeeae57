//! The property expression engine
//!
//! Binds expressions onto canonical property paths of its owning document
//! object and recomputes them in dependency order:
//! - `set_value` installs/erases bindings behind validation and back-link
//!   bookkeeping
//! - `validate_expression` checks a candidate against the owner's
//!   reverse-link closure and a hypothetical dependency graph
//! - `execute` drives every binding in topological order, writing results
//!   back through the paths
//! - maintenance handlers keep the store consistent under host mutation
//!   (rename, delete, replace, path rehousing) and across save/restore

use std::cell::Cell;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::change_log::{AtomicChange, ChangeLog};
use crate::dep_graph::{DepGraph, OutputFilter};
use crate::document::Document;
use crate::error::EngineError;
use crate::expr::Expr;
use crate::interner::intern;
use crate::parser::parse_expression;
use crate::path::PropertyPath;
use crate::xml;

/// Caller-supplied validation hook; a non-empty diagnostic rejects the
/// binding before any engine-level checks run
pub type Validator = Arc<dyn Fn(&PropertyPath, &Expr) -> Option<String>>;

/// One stored binding: the expression plus a free-form comment
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub expression: Expr,
    pub comment: String,
}

/// Clears the execute re-entrancy flag on every exit path
struct RunningGuard<'a>(&'a Cell<bool>);

impl<'a> RunningGuard<'a> {
    fn new(flag: &'a Cell<bool>) -> Self {
        flag.set(true);
        Self(flag)
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// Expression bindings over one document object's properties
pub struct ExpressionEngine {
    owner: Option<Arc<str>>,
    bindings: FxHashMap<PropertyPath, Binding>,
    /// Staged during restore, drained on the document-restored signal
    restored: FxHashMap<PropertyPath, Binding>,
    running: Cell<bool>,
    touched: Cell<bool>,
    validator: Option<Validator>,
    signals: ChangeLog,
}

impl ExpressionEngine {
    /// Engine not yet inside a document object
    pub fn new() -> Self {
        Self {
            owner: None,
            bindings: FxHashMap::default(),
            restored: FxHashMap::default(),
            running: Cell::new(false),
            touched: Cell::new(false),
            validator: None,
            signals: ChangeLog::new(),
        }
    }

    /// Engine owned by the named document object
    pub fn attached(owner: &str) -> Self {
        let mut engine = Self::new();
        engine.owner = Some(intern(owner));
        engine
    }

    /// Place the engine inside a document object
    pub fn attach(&mut self, owner: &str) {
        self.owner = Some(intern(owner));
    }

    pub fn owner(&self) -> Option<&Arc<str>> {
        self.owner.as_ref()
    }

    /// The change log this engine signals through
    pub fn change_log(&self) -> &ChangeLog {
        &self.signals
    }

    pub fn set_validator(&mut self, validator: Option<Validator>) {
        self.validator = validator;
    }

    /// Engine-level touch marker (set when a referenced object is deleted)
    pub fn is_touched(&self) -> bool {
        self.touched.get()
    }

    pub fn touch(&self) {
        self.touched.set(true);
    }

    fn require_owner(&self, doc: &Document) -> Result<Arc<str>, EngineError> {
        match &self.owner {
            Some(owner) if doc.contains_object(owner.as_ref()) => Ok(Arc::clone(owner)),
            _ => Err(EngineError::NotOwned),
        }
    }

    fn canonicalize(
        &self,
        doc: &Document,
        owner: &Arc<str>,
        path: &PropertyPath,
    ) -> Result<PropertyPath, EngineError> {
        let canonical = path.canonical(owner);
        let property = doc
            .property_at(&canonical)
            .ok_or_else(|| EngineError::PathInvalid {
                path: canonical.to_string(),
                reason: canonical.resolve_error(),
            })?;
        // The target must accept path-style reads down the sub-path
        if property.get_path_value(canonical.subpath()).is_none() {
            return Err(EngineError::PathInvalid {
                path: canonical.to_string(),
                reason: "property does not accept the sub-path".to_string(),
            });
        }
        Ok(canonical)
    }

    /// Canonical form of `path`, resolved against the live document
    pub fn canonical_path(
        &self,
        doc: &Document,
        path: &PropertyPath,
    ) -> Result<PropertyPath, EngineError> {
        let owner = self.require_owner(doc)?;
        self.canonicalize(doc, &owner, path)
    }

    /// Look up the binding for `path` (any form)
    pub fn get_value(
        &self,
        doc: &Document,
        path: &PropertyPath,
    ) -> Result<Option<&Binding>, EngineError> {
        let canonical = self.canonical_path(doc, path)?;
        Ok(self.bindings.get(&canonical))
    }

    pub fn num_bindings(&self) -> usize {
        self.bindings.len()
    }

    /// Immutable snapshot of the store, ordered by path
    pub fn bindings(&self) -> Vec<(PropertyPath, Binding)> {
        self.sorted_bindings()
            .into_iter()
            .map(|(path, binding)| (path.clone(), binding.clone()))
            .collect()
    }

    fn sorted_bindings(&self) -> Vec<(&PropertyPath, &Binding)> {
        let mut pairs: Vec<_> = self.bindings.iter().collect();
        pairs.sort_by(|a, b| a.0.cmp(b.0));
        pairs
    }

    /// Install, replace, or erase (expr = None) the binding at `path`
    ///
    /// Validation runs before any state is mutated; back-links on external
    /// dependency objects are withdrawn and re-registered symmetrically.
    pub fn set_value(
        &mut self,
        doc: &mut Document,
        path: &PropertyPath,
        expr: Option<&Expr>,
        comment: &str,
    ) -> Result<(), EngineError> {
        let owner = self.require_owner(doc)?;
        let canonical = self.canonicalize(doc, &owner, path)?;

        match expr {
            Some(expr) => {
                if let Some(existing) = self.bindings.get(&canonical) {
                    if existing.expression == *expr {
                        return Ok(());
                    }
                }

                if let Some(message) = self.validate(doc, &owner, &canonical, expr)? {
                    return Err(EngineError::ValidationFailed(message));
                }

                let _scope = AtomicChange::new(&self.signals);
                if let Some(prior) = self.bindings.get(&canonical) {
                    withdraw_back_links(doc, &owner, &prior.expression);
                }
                let binding = Binding {
                    expression: expr.clone(),
                    comment: comment.to_string(),
                };
                register_back_links(doc, &owner, &binding.expression);
                self.bindings.insert(canonical.clone(), binding);
                self.signals.changed(&canonical);
            }
            None => {
                let _scope = AtomicChange::new(&self.signals);
                if let Some(prior) = self.bindings.remove(&canonical) {
                    withdraw_back_links(doc, &owner, &prior.expression);
                }
                self.signals.changed(&canonical);
            }
        }
        Ok(())
    }

    /// Validate `expr` as a candidate binding for `path`
    ///
    /// `Ok(None)` means valid; `Ok(Some(diagnostic))` carries the reason a
    /// caller would surface as `ValidationFailed`.
    pub fn validate_expression(
        &self,
        doc: &Document,
        path: &PropertyPath,
        expr: &Expr,
    ) -> Result<Option<String>, EngineError> {
        let owner = self.require_owner(doc)?;
        let canonical = self.canonicalize(doc, &owner, path)?;
        self.validate(doc, &owner, &canonical, expr)
    }

    fn validate(
        &self,
        doc: &Document,
        owner: &Arc<str>,
        canonical: &PropertyPath,
        expr: &Expr,
    ) -> Result<Option<String>, EngineError> {
        if let Some(validator) = &self.validator {
            if let Some(message) = validator(canonical, expr) {
                if !message.is_empty() {
                    return Ok(Some(message));
                }
            }
        }

        // Object-level cycle: no dependency may sit in the reverse-link
        // closure of the path's host object
        let host = canonical
            .object()
            .cloned()
            .unwrap_or_else(|| Arc::clone(owner));
        let in_list = doc.in_list(host.as_ref(), true);
        for dep in expr.dep_objects(owner) {
            if in_list.contains(&dep) {
                return Ok(Some(format!("cyclic reference to {}", dep)));
            }
        }

        // Hypothetical graph over current bindings plus the candidate
        let mut pairs: Vec<(&PropertyPath, &Expr)> = self
            .bindings
            .iter()
            .filter(|(key, _)| *key != canonical)
            .map(|(key, binding)| (key, &binding.expression))
            .collect();
        pairs.push((canonical, expr));
        pairs.sort_by(|a, b| a.0.cmp(b.0));

        let graph = DepGraph::build(doc, owner, pairs, OutputFilter::All)?;
        if let Err(error) = graph.validate_acyclic() {
            return Ok(Some(error.to_string()));
        }
        Ok(None)
    }

    /// Re-evaluate every admitted binding in topological order, writing
    /// each result through its path
    ///
    /// A nested call (e.g. triggered transitively by a property write)
    /// returns success immediately. Write errors are fatal to the whole
    /// call; already-written properties are not rolled back.
    pub fn execute(&self, doc: &mut Document, filter: OutputFilter) -> Result<(), EngineError> {
        let owner = self.require_owner(doc)?;

        if self.running.get() {
            return Ok(());
        }
        let _guard = RunningGuard::new(&self.running);

        let pairs = self.sorted_bindings();
        let graph = DepGraph::build(
            doc,
            &owner,
            pairs.iter().map(|(path, binding)| (*path, &binding.expression)),
            filter,
        )?;
        graph.validate_acyclic()?;
        let order = graph.evaluation_order();
        debug!(bindings = order.len(), owner = %owner, "executing expression bindings");

        for path in &order {
            if doc.property_at(path).is_none() {
                return Err(EngineError::PathInvalid {
                    path: path.to_string(),
                    reason: path.resolve_error(),
                });
            }
            if path.object() != Some(&owner) {
                return Err(EngineError::ForeignProperty {
                    path: path.to_string(),
                });
            }
            let Some(binding) = self.bindings.get(path) else {
                continue;
            };
            let value = binding.expression.eval(doc, &owner)?;
            if !doc.set_path_value(path, value) {
                return Err(EngineError::PathInvalid {
                    path: path.to_string(),
                    reason: "value write through sub-path failed".to_string(),
                });
            }
        }
        Ok(())
    }

    /// A referenced object was renamed: rewrite references in place
    pub fn on_object_renamed(&mut self, doc: &Document, old: &str, new: &str) {
        let Some(owner) = &self.owner else { return };
        if !doc.contains_object(owner.as_ref()) {
            return;
        }
        let new_name = intern(new);
        let keys: Vec<PropertyPath> = self.bindings.keys().cloned().collect();
        for key in keys {
            if let Some(binding) = self.bindings.get_mut(&key) {
                if binding.expression.rename_object(old, &new_name) {
                    self.signals.changed(&key);
                }
            }
        }
    }

    /// A referenced object was deleted: mark the engine (and its owner)
    /// for recompute so the dangling reference surfaces as an error there.
    /// Bindings are left untouched.
    pub fn on_object_deleted(&mut self, doc: &mut Document, name: &str) {
        let Some(owner) = self.owner.clone() else { return };
        if !doc.contains_object(owner.as_ref()) {
            return;
        }
        let referenced = self
            .bindings
            .values()
            .any(|binding| binding.expression.references_object(name));
        if referenced {
            self.touched.set(true);
            if let Some(object) = doc.object_mut(owner.as_ref()) {
                object.touch();
            }
        }
    }

    /// Rehouse bindings whose key appears in `map`
    ///
    /// Keys on both sides are canonicalized; `changed` fires for every
    /// final key inside a single atomic change scope.
    pub fn rename_paths(
        &mut self,
        doc: &Document,
        map: &FxHashMap<PropertyPath, PropertyPath>,
    ) -> Result<(), EngineError> {
        let owner = self.require_owner(doc)?;

        let mut canonical_map: FxHashMap<PropertyPath, PropertyPath> = FxHashMap::default();
        for (from, to) in map {
            canonical_map.insert(
                self.canonicalize(doc, &owner, from)?,
                self.canonicalize(doc, &owner, to)?,
            );
        }

        let _scope = AtomicChange::new(&self.signals);
        let old = std::mem::take(&mut self.bindings);
        for (key, binding) in old {
            let new_key = canonical_map.get(&key).cloned().unwrap_or(key);
            self.bindings.insert(new_key, binding);
        }
        for key in self.bindings.keys() {
            self.signals.changed(key);
        }
        Ok(())
    }

    /// Rewrite references *inside* expressions by map lookup; store keys
    /// are unaffected
    pub fn rename_object_identifiers(&mut self, map: &FxHashMap<PropertyPath, PropertyPath>) {
        for binding in self.bindings.values_mut() {
            binding.expression.rename_paths(map);
        }
    }

    /// Drop every binding that depends on one of `objects`
    pub fn break_dependency(
        &mut self,
        doc: &mut Document,
        objects: &[&str],
    ) -> Result<(), EngineError> {
        let deps = self.document_object_deps();
        for name in objects {
            if !deps.contains(*name) {
                continue;
            }
            let paths: Vec<PropertyPath> = self
                .bindings
                .iter()
                .filter(|(_, binding)| binding.expression.references_object(name))
                .map(|(key, _)| key.clone())
                .collect();
            for path in paths {
                self.set_value(doc, &path, None, "")?;
            }
        }
        Ok(())
    }

    /// Rewire bindings referencing replaced objects in `in_list`
    ///
    /// Back-links are withdrawn, the expression adjusted through the
    /// document's alias table, and back-links re-registered; everything
    /// runs under one atomic change scope. Returns true iff at least one
    /// binding was adjusted.
    pub fn adjust_links(
        &mut self,
        doc: &mut Document,
        in_list: &FxHashSet<Arc<str>>,
    ) -> Result<bool, EngineError> {
        let Some(owner) = self.owner.clone() else {
            return Ok(false);
        };

        let mut scope: Option<AtomicChange> = None;
        let keys: Vec<PropertyPath> = self.bindings.keys().cloned().collect();

        for key in keys {
            let Some(binding) = self.bindings.get_mut(&key) else {
                continue;
            };
            let dep_objects = binding.expression.dep_objects(&owner);
            let needs_adjust = dep_objects
                .iter()
                .any(|dep| *dep != owner && in_list.contains(dep));
            if !needs_adjust {
                continue;
            }

            if scope.is_none() {
                scope = Some(AtomicChange::new(&self.signals));
            }

            for dep in &dep_objects {
                if *dep != owner {
                    if let Some(object) = doc.object_mut(dep.as_ref()) {
                        object.remove_back_link(&owner);
                    }
                }
            }

            if let Err(error) = binding.expression.adjust_links(doc, in_list) {
                return Err(EngineError::AdjustLinkFailed(format!(
                    "failed to adjust link for {} in expression {}: {}",
                    owner, binding.expression, error
                )));
            }

            for dep in binding.expression.dep_objects(&owner) {
                if dep != owner {
                    if let Some(object) = doc.object_mut(dep.as_ref()) {
                        object.add_back_link(&owner);
                    }
                }
            }
            debug!(path = %key, "adjusted expression links");
            self.signals.changed(&key);
        }
        Ok(scope.is_some())
    }

    /// True iff any bound expression reports its dependencies touched
    pub fn deps_are_touched(&self, doc: &Document) -> bool {
        let Some(owner) = &self.owner else {
            return false;
        };
        self.bindings
            .values()
            .any(|binding| binding.expression.is_touched(doc, owner))
    }

    /// Every document object the bindings depend on, excluding the owner
    pub fn document_object_deps(&self) -> FxHashSet<Arc<str>> {
        let Some(owner) = &self.owner else {
            return FxHashSet::default();
        };
        let mut deps = FxHashSet::default();
        for binding in self.bindings.values() {
            for dep in binding.expression.dep_objects(owner) {
                if dep != *owner {
                    deps.insert(dep);
                }
            }
        }
        deps
    }

    /// Every referenced path grouped under `object` across all bindings
    pub fn paths_to_document_object(&self, object: &str) -> Vec<PropertyPath> {
        let Some(owner) = &self.owner else {
            return Vec::new();
        };
        if owner.as_ref() == object {
            return Vec::new();
        }
        let mut paths = Vec::new();
        for binding in self.bindings.values() {
            let deps = binding.expression.deps(owner);
            if let Some(groups) = deps.get(object) {
                for group in groups.values() {
                    paths.extend(group.iter().cloned());
                }
            }
        }
        paths.sort();
        paths.dedup();
        paths
    }

    /// Clone the binding set and validator into a detached engine
    pub fn copy(&self) -> Self {
        let mut engine = Self::new();
        engine.bindings = self.bindings.clone();
        engine.validator = self.validator.clone();
        engine
    }

    /// Replace the whole store by deep copies from `other`
    pub fn paste(&mut self, doc: &mut Document, other: &ExpressionEngine) {
        let _scope = AtomicChange::new(&self.signals);

        if let Some(owner) = self.owner.clone() {
            for binding in self.bindings.values() {
                withdraw_back_links(doc, &owner, &binding.expression);
            }
        }
        self.bindings.clear();

        for (path, binding) in other.sorted_bindings() {
            self.bindings.insert(path.clone(), binding.clone());
            if let Some(owner) = self.owner.clone() {
                register_back_links(doc, &owner, &binding.expression);
            }
            self.signals.changed(path);
        }
        self.validator = other.validator.clone();
    }

    /// Persisted representation (`<ExpressionEngine count="N">`)
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "<ExpressionEngine count=\"{}\">\n",
            self.bindings.len()
        ));
        for (path, binding) in self.sorted_bindings() {
            out.push_str(&format!(
                "  <Expression path=\"{}\" expression=\"{}\"",
                xml::escape_attribute(&path.to_string()),
                xml::escape_attribute(&binding.expression.to_string()),
            ));
            if !binding.comment.is_empty() {
                out.push_str(&format!(
                    " comment=\"{}\"",
                    xml::escape_attribute(&binding.comment)
                ));
            }
            out.push_str("/>\n");
        }
        out.push_str("</ExpressionEngine>\n");
        out
    }

    /// Parse a persisted representation into the restored staging store
    ///
    /// The live store is untouched until `on_document_restored` drains
    /// the staged bindings.
    pub fn restore(&mut self, doc: &Document, text: &str) -> Result<(), EngineError> {
        let owner = self.require_owner(doc)?;

        let tags = xml::scan(text).map_err(|e| EngineError::Restore(e.to_string()))?;
        let mut iter = tags.into_iter();

        let root = iter
            .next()
            .ok_or_else(|| EngineError::Restore("missing <ExpressionEngine>".to_string()))?;
        if root.name != "ExpressionEngine" || root.kind != xml::TagKind::Open {
            return Err(EngineError::Restore(
                "missing <ExpressionEngine>".to_string(),
            ));
        }
        let count_text = root
            .attr("count")
            .ok_or_else(|| EngineError::Restore("missing count attribute".to_string()))?;
        let count: usize = count_text
            .parse()
            .map_err(|_| EngineError::Restore(format!("bad count '{}'", count_text)))?;

        self.restored.clear();
        for _ in 0..count {
            let tag = iter.next().ok_or_else(|| {
                EngineError::Restore("count exceeds <Expression> children".to_string())
            })?;
            if tag.name != "Expression" || tag.kind != xml::TagKind::SelfClose {
                return Err(EngineError::Restore("expected <Expression/>".to_string()));
            }
            let path_text = tag
                .attr("path")
                .ok_or_else(|| EngineError::Restore("missing path attribute".to_string()))?;
            let expr_text = tag
                .attr("expression")
                .ok_or_else(|| EngineError::Restore("missing expression attribute".to_string()))?;

            let path = doc.parse_path(path_text)?;
            let expression = parse_expression(doc, &owner, expr_text)?;
            let comment = tag.attr("comment").unwrap_or("").to_string();

            self.restored.insert(
                path.canonical(&owner),
                Binding {
                    expression,
                    comment,
                },
            );
        }

        match iter.next() {
            Some(tag) if tag.name == "ExpressionEngine" && tag.kind == xml::TagKind::Close => {
                Ok(())
            }
            _ => Err(EngineError::Restore(
                "count does not match <Expression> children".to_string(),
            )),
        }
    }

    /// The document finished restoring: drain staged bindings into the
    /// live store through `set_value` (validation plus back-link setup)
    pub fn on_document_restored(&mut self, doc: &mut Document) -> Result<(), EngineError> {
        let _scope = AtomicChange::new(&self.signals);
        let mut staged: Vec<(PropertyPath, Binding)> =
            std::mem::take(&mut self.restored).into_iter().collect();
        staged.sort_by(|a, b| a.0.cmp(&b.0));
        for (path, binding) in staged {
            self.set_value(doc, &path, Some(&binding.expression), &binding.comment)?;
        }
        Ok(())
    }

    /// Scripting view: (path, expression) renderings, ordered by path
    pub fn script_items(&self) -> Vec<(String, String)> {
        self.sorted_bindings()
            .into_iter()
            .map(|(path, binding)| (path.to_string(), binding.expression.to_string()))
            .collect()
    }

    /// Scripting writes are rejected
    pub fn script_set_items(&mut self, _items: &[(String, String)]) -> Result<(), EngineError> {
        Err(EngineError::ReadOnly)
    }
}

impl Default for ExpressionEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn register_back_links(doc: &mut Document, owner: &Arc<str>, expr: &Expr) {
    for dep in expr.dep_objects(owner) {
        if dep != *owner {
            if let Some(object) = doc.object_mut(dep.as_ref()) {
                object.add_back_link(owner);
            }
        }
    }
}

fn withdraw_back_links(doc: &mut Document, owner: &Arc<str>, expr: &Expr) {
    for dep in expr.dep_objects(owner) {
        if dep != *owner {
            if let Some(object) = doc.object_mut(dep.as_ref()) {
                object.remove_back_link(owner);
            }
        }
    }
}
