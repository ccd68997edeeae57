//! Propwire - reactive expression bindings over a host document graph
//!
//! ## Architecture
//!
//! - `engine`: binding store, setValue protocol, topological execute,
//!   maintenance handlers, save/restore
//! - `dep_graph`: dense-index dependency graph with cycle detection and
//!   evaluation ordering
//! - `expr`: expression AST with dependency queries, evaluation, and
//!   transformation passes
//! - `parser`: expression string parser (context of a host object)
//! - `path`: property paths with a canonical form
//! - `document`: host graph with back-link bookkeeping
//! - `change_log`: change signalling with coalescing atomic scopes
//! - `xml`: minimal element scanner for the persisted representation
//! - `error`: engine errors with fix suggestions
//! - `interner`: string interning for object names

pub mod change_log;
pub mod dep_graph;
pub mod document;
pub mod engine;
pub mod error;
pub mod expr;
pub mod interner;
pub mod parser;
pub mod path;
pub mod xml;

pub use change_log::{AtomicChange, ChangeEvent, ChangeKind, ChangeLog};
pub use dep_graph::{DepGraph, OutputFilter};
pub use document::{Document, DocumentObject, Property};
pub use engine::{Binding, ExpressionEngine, Validator};
pub use error::{EngineError, FixSuggestion};
pub use expr::{BinaryOp, Expr, ExprError, Func, UnaryOp};
pub use parser::{parse_expression, ParseError};
pub use path::{PathError, PropertyPath, Segment};
