//! Change signalling for binding mutations
//!
//! Two primitives back the engine's notification contract:
//! - `changed(path)`: fired after an individual binding is added, removed,
//!   or visibly rewritten
//! - the atomic change scope (`AtomicChange`): the outer mutation bracket
//!   that coalesces `changed` notifications from multi-binding operations
//!
//! The log is append-only and cloneable; clones share the same underlying
//! storage so observers see every emission. Scopes nest additively: only
//! the outermost release flushes the queued notifications, deduplicated in
//! first-queued order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::path::PropertyPath;

/// Single entry in the change log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEvent {
    /// Monotonic sequence ID (for ordering)
    pub id: u64,
    /// Event type and data
    pub kind: ChangeKind,
}

/// All change notification kinds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeKind {
    /// A binding was added, removed, or rewritten
    BindingChanged { path: String },
    /// Outermost atomic change scope opened (aboutToSetValue)
    ScopeOpened,
    /// Outermost atomic change scope released (hasSetValue)
    ScopeClosed,
}

impl ChangeKind {
    /// Extract the path for binding-level events
    pub fn path(&self) -> Option<&str> {
        match self {
            Self::BindingChanged { path } => Some(path),
            Self::ScopeOpened | Self::ScopeClosed => None,
        }
    }
}

#[derive(Default)]
struct ScopeState {
    depth: usize,
    /// Paths queued while a scope is open; first-queued order, deduplicated
    pending: Vec<String>,
}

/// Append-only, cloneable change log
#[derive(Clone)]
pub struct ChangeLog {
    events: Arc<RwLock<Vec<ChangeEvent>>>,
    scope: Arc<RwLock<ScopeState>>,
    next_id: Arc<AtomicU64>,
}

impl ChangeLog {
    pub fn new() -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            scope: Arc::new(RwLock::new(ScopeState::default())),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    fn emit(&self, kind: ChangeKind) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.events.write().push(ChangeEvent { id, kind });
    }

    /// Signal that the binding at `path` changed
    ///
    /// Inside an open scope the notification is queued and coalesced;
    /// outside it fires immediately.
    pub fn changed(&self, path: &PropertyPath) {
        let rendered = path.to_string();
        let mut scope = self.scope.write();
        if scope.depth > 0 {
            if !scope.pending.contains(&rendered) {
                scope.pending.push(rendered);
            }
        } else {
            drop(scope);
            self.emit(ChangeKind::BindingChanged { path: rendered });
        }
    }

    fn open_scope(&self) {
        let mut scope = self.scope.write();
        scope.depth += 1;
        if scope.depth == 1 {
            drop(scope);
            self.emit(ChangeKind::ScopeOpened);
        }
    }

    fn close_scope(&self) {
        let mut scope = self.scope.write();
        scope.depth -= 1;
        if scope.depth > 0 {
            return;
        }
        let pending = std::mem::take(&mut scope.pending);
        drop(scope);
        for path in pending {
            self.emit(ChangeKind::BindingChanged { path });
        }
        self.emit(ChangeKind::ScopeClosed);
    }

    /// Get all events (cloned)
    pub fn events(&self) -> Vec<ChangeEvent> {
        self.events.read().clone()
    }

    /// Number of `BindingChanged` events recorded for `path`
    pub fn changed_count(&self, path: &PropertyPath) -> usize {
        let rendered = path.to_string();
        self.events
            .read()
            .iter()
            .filter(|e| e.kind.path() == Some(rendered.as_str()))
            .count()
    }

    /// Serialize to JSON for persistence/debugging
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self.events()).unwrap_or(Value::Null)
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ChangeLog {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ChangeLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeLog").field("len", &self.len()).finish()
    }
}

/// Scoped atomic change bracket (aboutToSetValue / hasSetValue)
///
/// Opens a scope on construction and releases it on drop, so the bracket
/// unwinds on every exit path, including errors.
pub struct AtomicChange {
    log: ChangeLog,
}

impl AtomicChange {
    pub fn new(log: &ChangeLog) -> Self {
        log.open_scope();
        Self { log: log.clone() }
    }
}

impl Drop for AtomicChange {
    fn drop(&mut self) {
        self.log.close_scope();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(text: &str) -> PropertyPath {
        PropertyPath::new("Calc", text)
    }

    #[test]
    fn changed_outside_scope_fires_immediately() {
        let log = ChangeLog::new();
        log.changed(&path("A"));

        let events = log.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind.path(), Some("Calc.A"));
    }

    #[test]
    fn scope_coalesces_and_dedups_notifications() {
        let log = ChangeLog::new();
        {
            let _scope = AtomicChange::new(&log);
            log.changed(&path("A"));
            log.changed(&path("B"));
            log.changed(&path("A"));
            // Nothing flushed while the scope is open
            assert_eq!(log.len(), 1); // ScopeOpened only
        }

        let kinds: Vec<ChangeKind> = log.events().into_iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ChangeKind::ScopeOpened,
                ChangeKind::BindingChanged { path: "Calc.A".into() },
                ChangeKind::BindingChanged { path: "Calc.B".into() },
                ChangeKind::ScopeClosed,
            ]
        );
    }

    #[test]
    fn nested_scopes_release_at_outermost() {
        let log = ChangeLog::new();
        {
            let _outer = AtomicChange::new(&log);
            {
                let _inner = AtomicChange::new(&log);
                log.changed(&path("A"));
            }
            // Inner release must not flush
            assert_eq!(log.changed_count(&path("A")), 0);
        }
        assert_eq!(log.changed_count(&path("A")), 1);
    }

    #[test]
    fn scope_releases_on_unwind() {
        let log = ChangeLog::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _scope = AtomicChange::new(&log);
            log.changed(&path("A"));
            panic!("mutation failed");
        }));
        assert!(result.is_err());

        // The bracket closed and flushed despite the panic
        assert_eq!(log.changed_count(&path("A")), 1);
        let kinds: Vec<ChangeKind> = log.events().into_iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&ChangeKind::ScopeClosed));
    }

    #[test]
    fn clones_share_storage() {
        let log = ChangeLog::new();
        let observer = log.clone();
        log.changed(&path("A"));
        assert_eq!(observer.len(), 1);
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let log = ChangeLog::new();
        log.changed(&path("A"));

        let json = log.to_json();
        assert_eq!(json[0]["kind"]["type"], "binding_changed");
        assert_eq!(json[0]["kind"]["path"], "Calc.A");
    }

    #[test]
    fn ids_are_monotonic() {
        let log = ChangeLog::new();
        log.changed(&path("A"));
        log.changed(&path("B"));
        let events = log.events();
        assert!(events[0].id < events[1].id);
    }
}
