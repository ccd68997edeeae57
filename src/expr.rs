//! Expression trees bound to properties
//!
//! A tagged-variant AST over the node kinds the engine needs: literals,
//! variable references (property paths), unary/binary operators, a small
//! builtin function set, and conditionals. The engine consumes expressions
//! through a narrow surface:
//! - deep copy (`Clone`)
//! - dependency query: referenced objects, and referenced paths grouped
//!   object -> property -> paths (an empty property name marks a
//!   whole-object dependency)
//! - evaluation against the document, producing a JSON value
//! - in-place transformation passes (rename, link adjustment)
//! - a touched query over the referenced properties

use std::fmt;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use thiserror::Error;

use crate::document::Document;
use crate::path::PropertyPath;

/// Dependency grouping: object -> property name -> referenced paths
pub type DepMap = FxHashMap<Arc<str>, FxHashMap<String, Vec<PropertyPath>>>;

/// Expression evaluation / transformation failure
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExprError {
    #[error("unresolved reference '{path}'")]
    Unresolved { path: String },
    #[error("type error: {context}")]
    Type { context: String },
    #[error("wrong number of arguments to {func}()")]
    Arity { func: &'static str },
    #[error("no replacement for referenced object '{object}'")]
    AdjustLink { object: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Mod => "%",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::And => "&&",
            Self::Or => "||",
        }
    }

    /// Precedence level for rendering (higher binds tighter)
    fn precedence(self) -> u8 {
        match self {
            Self::Or => 2,
            Self::And => 3,
            Self::Eq | Self::Ne => 4,
            Self::Lt | Self::Le | Self::Gt | Self::Ge => 5,
            Self::Add | Self::Sub => 6,
            Self::Mul | Self::Div | Self::Mod => 7,
        }
    }
}

/// Builtin function set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    Min,
    Max,
    Abs,
    Floor,
    Ceil,
    Round,
    Sqrt,
    Pow,
}

impl Func {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "min" => Self::Min,
            "max" => Self::Max,
            "abs" => Self::Abs,
            "floor" => Self::Floor,
            "ceil" => Self::Ceil,
            "round" => Self::Round,
            "sqrt" => Self::Sqrt,
            "pow" => Self::Pow,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Min => "min",
            Self::Max => "max",
            Self::Abs => "abs",
            Self::Floor => "floor",
            Self::Ceil => "ceil",
            Self::Round => "round",
            Self::Sqrt => "sqrt",
            Self::Pow => "pow",
        }
    }

    pub fn arity(self) -> usize {
        match self {
            Self::Min | Self::Max | Self::Pow => 2,
            _ => 1,
        }
    }
}

/// Expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Str(String),
    Bool(bool),
    /// Variable reference: a property path into the document
    Var(PropertyPath),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call {
        func: Func,
        args: Vec<Expr>,
    },
    Cond {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
}

impl Expr {
    /// Visit every variable path, leaves first
    pub fn for_each_var(&self, f: &mut impl FnMut(&PropertyPath)) {
        match self {
            Expr::Var(path) => f(path),
            Expr::Unary { operand, .. } => operand.for_each_var(f),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.for_each_var(f);
                rhs.for_each_var(f);
            }
            Expr::Call { args, .. } => {
                for arg in args {
                    arg.for_each_var(f);
                }
            }
            Expr::Cond {
                cond,
                then,
                otherwise,
            } => {
                cond.for_each_var(f);
                then.for_each_var(f);
                otherwise.for_each_var(f);
            }
            Expr::Number(_) | Expr::Str(_) | Expr::Bool(_) => {}
        }
    }

    /// Mutable variant of [`for_each_var`](Self::for_each_var)
    pub fn for_each_var_mut(&mut self, f: &mut impl FnMut(&mut PropertyPath)) {
        match self {
            Expr::Var(path) => f(path),
            Expr::Unary { operand, .. } => operand.for_each_var_mut(f),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.for_each_var_mut(f);
                rhs.for_each_var_mut(f);
            }
            Expr::Call { args, .. } => {
                for arg in args {
                    arg.for_each_var_mut(f);
                }
            }
            Expr::Cond {
                cond,
                then,
                otherwise,
            } => {
                cond.for_each_var_mut(f);
                then.for_each_var_mut(f);
                otherwise.for_each_var_mut(f);
            }
            Expr::Number(_) | Expr::Str(_) | Expr::Bool(_) => {}
        }
    }

    /// Referenced paths grouped object -> property -> paths
    ///
    /// Unqualified paths are canonicalized against `owner` first. A
    /// whole-object reference lands under the empty property name; the
    /// graph builder skips those entries (no path-level edge).
    pub fn deps(&self, owner: &Arc<str>) -> DepMap {
        let mut deps: DepMap = FxHashMap::default();
        self.for_each_var(&mut |path| {
            let canonical = path.canonical(owner);
            let Some(object) = canonical.object().cloned() else {
                return;
            };
            deps.entry(object)
                .or_default()
                .entry(canonical.property().to_string())
                .or_default()
                .push(canonical);
        });
        deps
    }

    /// Set of referenced document objects
    pub fn dep_objects(&self, owner: &Arc<str>) -> FxHashSet<Arc<str>> {
        let mut objects = FxHashSet::default();
        self.for_each_var(&mut |path| {
            if let Some(object) = path.canonical(owner).object().cloned() {
                objects.insert(object);
            }
        });
        objects
    }

    /// True if any variable references the named object
    pub fn references_object(&self, name: &str) -> bool {
        let mut found = false;
        self.for_each_var(&mut |path| {
            if path.object().map(|o| o.as_ref()) == Some(name) {
                found = true;
            }
        });
        found
    }

    /// Rewrite references to a renamed object. Returns true on change.
    pub fn rename_object(&mut self, old: &str, new: &Arc<str>) -> bool {
        let mut changed = false;
        self.for_each_var_mut(&mut |path| {
            if path.object().map(|o| o.as_ref()) == Some(old) {
                path.set_object(Arc::clone(new));
                changed = true;
            }
        });
        changed
    }

    /// Rewrite whole variable paths by map lookup. Returns true on change.
    pub fn rename_paths(&mut self, map: &FxHashMap<PropertyPath, PropertyPath>) -> bool {
        let mut changed = false;
        self.for_each_var_mut(&mut |path| {
            if let Some(replacement) = map.get(path) {
                *path = replacement.clone();
                changed = true;
            }
        });
        changed
    }

    /// Rewire references to replaced objects in `in_list` through the
    /// document's alias table. Returns true if anything was rewritten;
    /// fails when a referenced object is gone and no replacement exists.
    pub fn adjust_links(
        &mut self,
        doc: &Document,
        in_list: &FxHashSet<Arc<str>>,
    ) -> Result<bool, ExprError> {
        match self {
            Expr::Var(path) => {
                let Some(object) = path.object().cloned() else {
                    return Ok(false);
                };
                if !in_list.contains(&object) || doc.contains_object(object.as_ref()) {
                    return Ok(false);
                }
                match doc.resolve_alias(object.as_ref()) {
                    Some(replacement) => {
                        path.set_object(replacement);
                        Ok(true)
                    }
                    None => Err(ExprError::AdjustLink {
                        object: object.to_string(),
                    }),
                }
            }
            Expr::Unary { operand, .. } => operand.adjust_links(doc, in_list),
            Expr::Binary { lhs, rhs, .. } => {
                let a = lhs.adjust_links(doc, in_list)?;
                let b = rhs.adjust_links(doc, in_list)?;
                Ok(a || b)
            }
            Expr::Call { args, .. } => {
                let mut changed = false;
                for arg in args {
                    changed |= arg.adjust_links(doc, in_list)?;
                }
                Ok(changed)
            }
            Expr::Cond {
                cond,
                then,
                otherwise,
            } => {
                let a = cond.adjust_links(doc, in_list)?;
                let b = then.adjust_links(doc, in_list)?;
                let c = otherwise.adjust_links(doc, in_list)?;
                Ok(a || b || c)
            }
            Expr::Number(_) | Expr::Str(_) | Expr::Bool(_) => Ok(false),
        }
    }

    /// True if any referenced property (or object, for whole-object
    /// references) reports touched
    pub fn is_touched(&self, doc: &Document, owner: &Arc<str>) -> bool {
        let mut touched = false;
        self.for_each_var(&mut |path| {
            if touched {
                return;
            }
            let canonical = path.canonical(owner);
            if canonical.is_object_only() {
                touched = canonical
                    .object()
                    .and_then(|o| doc.object(o.as_ref()))
                    .is_some_and(|o| o.is_touched());
            } else {
                touched = doc
                    .property_at(&canonical)
                    .is_some_and(|p| p.is_touched());
            }
        });
        touched
    }

    /// Evaluate against the document, producing a JSON value
    ///
    /// Unqualified variable paths resolve relative to `owner`.
    pub fn eval(&self, doc: &Document, owner: &Arc<str>) -> Result<Value, ExprError> {
        match self {
            Expr::Number(n) => number_value(*n),
            Expr::Str(s) => Ok(Value::String(s.clone())),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Var(path) => {
                let canonical = path.canonical(owner);
                if canonical.is_object_only() {
                    // Whole-object reference evaluates to the object name
                    match canonical.object() {
                        Some(object) if doc.contains_object(object.as_ref()) => {
                            return Ok(Value::String(object.to_string()))
                        }
                        _ => {
                            return Err(ExprError::Unresolved {
                                path: canonical.to_string(),
                            })
                        }
                    }
                }
                doc.get_path_value(&canonical)
                    .ok_or_else(|| ExprError::Unresolved {
                        path: canonical.to_string(),
                    })
            }
            Expr::Unary { op, operand } => {
                let value = operand.eval(doc, owner)?;
                match op {
                    UnaryOp::Neg => number_value(-as_number(&value, "unary '-'")?),
                    UnaryOp::Not => Ok(Value::Bool(!as_bool(&value, "unary '!'")?)),
                }
            }
            Expr::Binary { op, lhs, rhs } => {
                let left = lhs.eval(doc, owner)?;
                let right = rhs.eval(doc, owner)?;
                eval_binary(*op, left, right)
            }
            Expr::Call { func, args } => {
                if args.len() != func.arity() {
                    return Err(ExprError::Arity { func: func.name() });
                }
                let mut numbers = Vec::with_capacity(args.len());
                for arg in args {
                    let value = arg.eval(doc, owner)?;
                    numbers.push(as_number(&value, func.name())?);
                }
                let result = match func {
                    Func::Min => numbers[0].min(numbers[1]),
                    Func::Max => numbers[0].max(numbers[1]),
                    Func::Abs => numbers[0].abs(),
                    Func::Floor => numbers[0].floor(),
                    Func::Ceil => numbers[0].ceil(),
                    Func::Round => numbers[0].round(),
                    Func::Sqrt => numbers[0].sqrt(),
                    Func::Pow => numbers[0].powf(numbers[1]),
                };
                number_value(result)
            }
            Expr::Cond {
                cond,
                then,
                otherwise,
            } => {
                let picked = as_bool(&cond.eval(doc, owner)?, "condition")?;
                if picked {
                    then.eval(doc, owner)
                } else {
                    otherwise.eval(doc, owner)
                }
            }
        }
    }
}

fn eval_binary(op: BinaryOp, left: Value, right: Value) -> Result<Value, ExprError> {
    use BinaryOp::*;
    match op {
        // String concatenation rides on '+'
        Add => {
            if let (Value::String(a), Value::String(b)) = (&left, &right) {
                return Ok(Value::String(format!("{}{}", a, b)));
            }
            number_value(as_number(&left, "'+'")? + as_number(&right, "'+'")?)
        }
        Sub => number_value(as_number(&left, "'-'")? - as_number(&right, "'-'")?),
        Mul => number_value(as_number(&left, "'*'")? * as_number(&right, "'*'")?),
        Div => number_value(as_number(&left, "'/'")? / as_number(&right, "'/'")?),
        Mod => number_value(as_number(&left, "'%'")? % as_number(&right, "'%'")?),
        Eq => Ok(Value::Bool(left == right)),
        Ne => Ok(Value::Bool(left != right)),
        Lt => Ok(Value::Bool(as_number(&left, "'<'")? < as_number(&right, "'<'")?)),
        Le => Ok(Value::Bool(
            as_number(&left, "'<='")? <= as_number(&right, "'<='")?,
        )),
        Gt => Ok(Value::Bool(as_number(&left, "'>'")? > as_number(&right, "'>'")?)),
        Ge => Ok(Value::Bool(
            as_number(&left, "'>='")? >= as_number(&right, "'>='")?,
        )),
        And => Ok(Value::Bool(
            as_bool(&left, "'&&'")? && as_bool(&right, "'&&'")?,
        )),
        Or => Ok(Value::Bool(
            as_bool(&left, "'||'")? || as_bool(&right, "'||'")?,
        )),
    }
}

fn as_number(value: &Value, context: &str) -> Result<f64, ExprError> {
    value.as_f64().ok_or_else(|| ExprError::Type {
        context: format!("{} expects a number, got {}", context, value),
    })
}

fn as_bool(value: &Value, context: &str) -> Result<bool, ExprError> {
    value.as_bool().ok_or_else(|| ExprError::Type {
        context: format!("{} expects a boolean, got {}", context, value),
    })
}

fn number_value(n: f64) -> Result<Value, ExprError> {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .ok_or_else(|| ExprError::Type {
            context: format!("non-finite result {}", n),
        })
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_prec(self, 0, f)
    }
}

/// Render with minimal parentheses: wrap when a child binds looser than
/// its context requires
fn fmt_prec(expr: &Expr, min_prec: u8, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match expr {
        Expr::Number(n) => write!(f, "{}", n),
        Expr::Str(s) => write!(f, "\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")),
        Expr::Bool(b) => write!(f, "{}", b),
        Expr::Var(path) => write!(f, "{}", path),
        Expr::Unary { op, operand } => {
            match op {
                UnaryOp::Neg => write!(f, "-")?,
                UnaryOp::Not => write!(f, "!")?,
            }
            fmt_prec(operand, 8, f)
        }
        Expr::Binary { op, lhs, rhs } => {
            let prec = op.precedence();
            let parens = prec < min_prec;
            if parens {
                write!(f, "(")?;
            }
            fmt_prec(lhs, prec, f)?;
            write!(f, " {} ", op.symbol())?;
            fmt_prec(rhs, prec + 1, f)?;
            if parens {
                write!(f, ")")?;
            }
            Ok(())
        }
        Expr::Call { func, args } => {
            write!(f, "{}(", func.name())?;
            for (i, arg) in args.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                fmt_prec(arg, 0, f)?;
            }
            write!(f, ")")
        }
        Expr::Cond {
            cond,
            then,
            otherwise,
        } => {
            let parens = min_prec > 1;
            if parens {
                write!(f, "(")?;
            }
            fmt_prec(cond, 2, f)?;
            write!(f, " ? ")?;
            fmt_prec(then, 2, f)?;
            write!(f, " : ")?;
            fmt_prec(otherwise, 1, f)?;
            if parens {
                write!(f, ")")?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interner::intern;
    use serde_json::json;

    fn doc() -> Document {
        let mut doc = Document::new();
        doc.add_object("Box")
            .add_property("Height", json!(10.0))
            .add_property("Label", json!("box"));
        doc.add_object("Pad").add_property("Length", json!(4.0));
        doc
    }

    fn var(path: &str, doc: &Document) -> Expr {
        Expr::Var(doc.parse_path(path).unwrap())
    }

    #[test]
    fn eval_arithmetic_over_vars() {
        let doc = doc();
        let owner = intern("Pad");

        // Box.Height * 2 + Length  (Length is owner-relative)
        let expr = Expr::Binary {
            op: BinaryOp::Add,
            lhs: Box::new(Expr::Binary {
                op: BinaryOp::Mul,
                lhs: Box::new(var("Box.Height", &doc)),
                rhs: Box::new(Expr::Number(2.0)),
            }),
            rhs: Box::new(var("Length", &doc)),
        };
        assert_eq!(expr.eval(&doc, &owner).unwrap(), json!(24.0));
    }

    #[test]
    fn eval_unresolved_reference_fails() {
        let doc = doc();
        let owner = intern("Pad");
        let expr = var("Box.Missing", &doc);

        let err = expr.eval(&doc, &owner).unwrap_err();
        assert_eq!(
            err,
            ExprError::Unresolved {
                path: "Box.Missing".to_string()
            }
        );
    }

    #[test]
    fn eval_string_concat_and_object_ref() {
        let doc = doc();
        let owner = intern("Pad");

        // "in " + Box  (whole-object reference renders the name)
        let expr = Expr::Binary {
            op: BinaryOp::Add,
            lhs: Box::new(Expr::Str("in ".to_string())),
            rhs: Box::new(var("Box", &doc)),
        };
        assert_eq!(expr.eval(&doc, &owner).unwrap(), json!("in Box"));
    }

    #[test]
    fn eval_conditional_and_builtin() {
        let doc = doc();
        let owner = intern("Pad");

        // Box.Height > 5 ? min(Box.Height, Length) : 0
        let expr = Expr::Cond {
            cond: Box::new(Expr::Binary {
                op: BinaryOp::Gt,
                lhs: Box::new(var("Box.Height", &doc)),
                rhs: Box::new(Expr::Number(5.0)),
            }),
            then: Box::new(Expr::Call {
                func: Func::Min,
                args: vec![var("Box.Height", &doc), var("Length", &doc)],
            }),
            otherwise: Box::new(Expr::Number(0.0)),
        };
        assert_eq!(expr.eval(&doc, &owner).unwrap(), json!(4.0));
    }

    #[test]
    fn deps_group_by_object_then_property() {
        let doc = doc();
        let owner = intern("Pad");
        let expr = Expr::Binary {
            op: BinaryOp::Add,
            lhs: Box::new(var("Box.Height", &doc)),
            rhs: Box::new(var("Length", &doc)),
        };

        let deps = expr.deps(&owner);
        assert!(deps["Box"].contains_key("Height"));
        // Owner-relative reference canonicalized under the owner
        assert!(deps["Pad"].contains_key("Length"));

        let objects = expr.dep_objects(&owner);
        assert!(objects.contains("Box") && objects.contains("Pad"));
    }

    #[test]
    fn whole_object_dep_lands_under_empty_property() {
        let doc = doc();
        let owner = intern("Pad");
        let expr = var("Box", &doc);

        let deps = expr.deps(&owner);
        assert!(deps["Box"].contains_key(""));
    }

    #[test]
    fn rename_object_rewrites_references() {
        let doc = doc();
        let mut expr = Expr::Binary {
            op: BinaryOp::Add,
            lhs: Box::new(var("Box.Height", &doc)),
            rhs: Box::new(Expr::Number(1.0)),
        };

        let renamed = intern("Crate");
        assert!(expr.rename_object("Box", &renamed));
        assert_eq!(expr.to_string(), "Crate.Height + 1");
        // Second pass finds nothing left to rewrite
        assert!(!expr.rename_object("Box", &renamed));
    }

    #[test]
    fn adjust_links_follows_alias_and_fails_when_dangling() {
        let mut doc = doc();
        let owner = intern("Pad");
        let mut expr = var("Box.Height", &doc);

        doc.add_object("Crate").add_property("Height", json!(2.0));
        doc.replace_object("Box", "Crate");

        let in_list: FxHashSet<Arc<str>> = [intern("Box")].into_iter().collect();
        assert!(expr.adjust_links(&doc, &in_list).unwrap());
        assert_eq!(expr.eval(&doc, &owner).unwrap(), json!(2.0));

        // Dangling: replacement removed without a further alias
        let mut stale = Expr::Var(PropertyPath::new("Box", "Height"));
        doc.remove_object("Crate");
        let err = stale.adjust_links(&doc, &in_list).unwrap_err();
        assert!(matches!(err, ExprError::AdjustLink { .. }));
    }

    #[test]
    fn touched_follows_referenced_property() {
        let mut doc = doc();
        let owner = intern("Pad");
        let expr = var("Box.Height", &doc);

        assert!(!expr.is_touched(&doc, &owner));
        let path = doc.parse_path("Box.Height").unwrap();
        doc.set_path_value(&path, json!(11.0));
        assert!(expr.is_touched(&doc, &owner));
    }

    #[test]
    fn display_inserts_minimal_parentheses() {
        let doc = doc();
        let h = || Box::new(var("Box.Height", &doc));

        // (Height + 1) * 2 keeps its parentheses; 2 * Height + 1 needs none
        let grouped = Expr::Binary {
            op: BinaryOp::Mul,
            lhs: Box::new(Expr::Binary {
                op: BinaryOp::Add,
                lhs: h(),
                rhs: Box::new(Expr::Number(1.0)),
            }),
            rhs: Box::new(Expr::Number(2.0)),
        };
        assert_eq!(grouped.to_string(), "(Box.Height + 1) * 2");

        let flat = Expr::Binary {
            op: BinaryOp::Add,
            lhs: Box::new(Expr::Binary {
                op: BinaryOp::Mul,
                lhs: Box::new(Expr::Number(2.0)),
                rhs: h(),
            }),
            rhs: Box::new(Expr::Number(1.0)),
        };
        assert_eq!(flat.to_string(), "2 * Box.Height + 1");
    }
}
