//! Engine error types with fix suggestions
//!
//! One `thiserror` enum for everything the engine surfaces, wrapping the
//! module-level errors (path, parser, expression) where they bubble up.
//! The `FixSuggestion` trait gives callers an actionable hint to show next
//! to the error message.

use thiserror::Error;

use crate::expr::ExprError;
use crate::parser::ParseError;
use crate::path::PathError;

/// Trait for errors that can provide fix suggestions
pub trait FixSuggestion {
    /// Get a fix suggestion for this error, if available
    fn fix_suggestion(&self) -> Option<&str>;
}

/// Top-level error type for the expression engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Engine is not currently inside a host object
    #[error("expression engine is not owned by a document object")]
    NotOwned,

    /// Path does not resolve to a writable property
    #[error("invalid path '{path}': {reason}")]
    PathInvalid { path: String, reason: String },

    /// validateExpression produced a diagnostic
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// A cycle was detected during validation or graph build
    #[error("{0}")]
    CyclicDependency(String),

    /// During execute, a target property's container is not the owner
    #[error("property '{path}' belongs to a foreign object")]
    ForeignProperty { path: String },

    /// Script write attempt
    #[error("property is read-only")]
    ReadOnly,

    /// expression.adjustLinks failed; wrapped with context
    #[error("{0}")]
    AdjustLinkFailed(String),

    /// Malformed persisted representation
    #[error("restore failed: {0}")]
    Restore(String),

    /// Expression evaluation error
    #[error("{0}")]
    Expr(#[from] ExprError),

    /// Expression parse error
    #[error("{0}")]
    Parse(#[from] ParseError),

    /// Path parse error
    #[error("{0}")]
    Path(#[from] PathError),
}

impl FixSuggestion for EngineError {
    fn fix_suggestion(&self) -> Option<&str> {
        Some(match self {
            EngineError::NotOwned => {
                "Attach the engine to a document object before using it"
            }
            EngineError::PathInvalid { .. } => {
                "Check that the object and property exist and the sub-path matches the value shape"
            }
            EngineError::ValidationFailed(_) => {
                "Review the expression: it references something the binding may not depend on"
            }
            EngineError::CyclicDependency(_) => {
                "Remove the reference that closes the loop, or bind the value in one place only"
            }
            EngineError::ForeignProperty { .. } => {
                "Bind foreign properties from their own object's engine"
            }
            EngineError::ReadOnly => {
                "Set expressions through setValue; the scripting view is read-only"
            }
            EngineError::AdjustLinkFailed(_) => {
                "Replace or remove bindings that reference the dropped object"
            }
            EngineError::Restore(_) => {
                "Check the <ExpressionEngine> element: count must match its children"
            }
            EngineError::Expr(_) => {
                "Check that referenced properties exist and operand types match"
            }
            EngineError::Parse(_) => "Check the expression syntax",
            EngineError::Path(_) => {
                "Use object.Property with optional .field and [index] segments"
            }
        })
    }
}

/// Format an error with its fix suggestion for display
pub fn format_error_with_suggestion<E: std::error::Error + FixSuggestion>(error: &E) -> String {
    let mut result = error.to_string();
    if let Some(suggestion) = error.fix_suggestion() {
        result.push_str("\n  Fix: ");
        result.push_str(suggestion);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_variants_have_suggestions() {
        let errors = vec![
            EngineError::NotOwned,
            EngineError::PathInvalid {
                path: "Box.Nope".into(),
                reason: "missing".into(),
            },
            EngineError::ValidationFailed("cyclic reference to Box".into()),
            EngineError::CyclicDependency("Box.Height".into()),
            EngineError::ForeignProperty {
                path: "Other.Width".into(),
            },
            EngineError::ReadOnly,
            EngineError::AdjustLinkFailed("failed".into()),
            EngineError::Restore("bad count".into()),
        ];
        for error in errors {
            assert!(
                error.fix_suggestion().is_some(),
                "Missing fix suggestion for: {:?}",
                error
            );
        }
    }

    #[test]
    fn format_appends_suggestion() {
        let error = EngineError::ReadOnly;
        let formatted = format_error_with_suggestion(&error);
        assert!(formatted.contains("read-only"));
        assert!(formatted.contains("Fix:"));
    }

    #[test]
    fn wrapped_errors_render_transparently() {
        let error: EngineError = PathError::Empty.into();
        assert_eq!(error.to_string(), "empty path");
        assert!(error.fix_suggestion().is_some());
    }
}
