//! Property paths with a canonical form
//!
//! A `PropertyPath` names a location in the host document graph:
//! an optional object segment, a property, and sub-path segments.
//!
//! Supports:
//! - `Box.Height` (object-qualified)
//! - `Height` (owner-relative, canonicalizes to an explicit object)
//! - `Box.Shape.points[0].x` (array index)
//! - `Box.Shape.points.0.x` (numeric dot segment, same as `[0]`)
//!
//! Does NOT support:
//! - Wildcards: `Box.points[*]`
//! - Slices: `Box.points[0:5]`
//! - Quoted segments

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::interner::intern;

/// A parsed sub-path segment below the property
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Segment {
    /// Object field access: `.field`
    Field(String),
    /// Array index access: `[0]`
    Index(usize),
}

/// Path parse failure
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("empty path")]
    Empty,
    #[error("unsupported path syntax: '{path}'")]
    Unsupported { path: String },
}

/// A symbolic reference to a property (or sub-property) of a document object
///
/// Two forms exist: the user form, where the object segment may be omitted
/// (owner-relative), and the canonical form, where it is always explicit.
/// Canonicalization is idempotent, and any two paths naming the same
/// location canonicalize to equal values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PropertyPath {
    /// Owning object; `None` in the owner-relative user form
    object: Option<Arc<str>>,
    /// Property name; empty for a whole-object reference
    property: String,
    /// Segments below the property
    subpath: Vec<Segment>,
}

impl PropertyPath {
    /// Path to a named property of a named object
    pub fn new(object: &str, property: &str) -> Self {
        Self {
            object: Some(intern(object)),
            property: property.to_string(),
            subpath: Vec::new(),
        }
    }

    /// Owner-relative path to a property (user form)
    pub fn relative(property: &str) -> Self {
        Self {
            object: None,
            property: property.to_string(),
            subpath: Vec::new(),
        }
    }

    /// Whole-object reference (empty property)
    pub fn object_ref(object: &str) -> Self {
        Self {
            object: Some(intern(object)),
            property: String::new(),
            subpath: Vec::new(),
        }
    }

    /// Append sub-path segments
    pub fn with_subpath(mut self, subpath: Vec<Segment>) -> Self {
        self.subpath = subpath;
        self
    }

    /// Parse a user-form path string
    ///
    /// `is_object` decides whether a leading segment names a document
    /// object; if it does, the segment becomes the object qualifier,
    /// otherwise the whole path is owner-relative.
    pub fn parse(path: &str, mut is_object: impl FnMut(&str) -> bool) -> Result<Self, PathError> {
        if path.is_empty() {
            return Err(PathError::Empty);
        }

        let mut segments = Vec::new();
        for part in path.split('.') {
            if part.is_empty() {
                return Err(PathError::Unsupported {
                    path: path.to_string(),
                });
            }
            parse_segment(part, path, &mut segments)?;
        }

        let mut iter = segments.into_iter();

        // Leading segment: object qualifier or owner-relative property
        let first = match iter.next() {
            Some(Segment::Field(name)) => name,
            _ => {
                return Err(PathError::Unsupported {
                    path: path.to_string(),
                })
            }
        };

        let (object, property) = if is_object(&first) {
            match iter.next() {
                Some(Segment::Field(prop)) => (Some(intern(&first)), prop),
                // Bare object name: whole-object reference
                None => return Ok(Self::object_ref(&first)),
                Some(Segment::Index(_)) => {
                    return Err(PathError::Unsupported {
                        path: path.to_string(),
                    })
                }
            }
        } else {
            (None, first)
        };

        Ok(Self {
            object,
            property,
            subpath: iter.collect(),
        })
    }

    /// Canonical form: the object segment made explicit against `owner`
    ///
    /// Idempotent; paths already carrying an object are returned unchanged.
    pub fn canonical(&self, owner: &Arc<str>) -> Self {
        match self.object {
            Some(_) => self.clone(),
            None => Self {
                object: Some(Arc::clone(owner)),
                property: self.property.clone(),
                subpath: self.subpath.clone(),
            },
        }
    }

    /// True once the object segment is explicit
    pub fn is_canonical(&self) -> bool {
        self.object.is_some()
    }

    /// Owning object name, if explicit
    pub fn object(&self) -> Option<&Arc<str>> {
        self.object.as_ref()
    }

    /// Rewrite the object segment (rename passes)
    pub fn set_object(&mut self, object: Arc<str>) {
        self.object = Some(object);
    }

    /// Property name; empty for whole-object references
    pub fn property(&self) -> &str {
        &self.property
    }

    /// Segments below the property
    pub fn subpath(&self) -> &[Segment] {
        &self.subpath
    }

    /// True for whole-object references (no property segment)
    pub fn is_object_only(&self) -> bool {
        self.property.is_empty()
    }

    /// Human-readable description of why this path failed to resolve
    pub fn resolve_error(&self) -> String {
        format!("path '{}' does not resolve to a property", self)
    }
}

/// Parse one dot-separated part into field/index segments
fn parse_segment(part: &str, full: &str, out: &mut Vec<Segment>) -> Result<(), PathError> {
    let unsupported = || PathError::Unsupported {
        path: full.to_string(),
    };

    if let Some(bracket) = part.find('[') {
        let field = &part[..bracket];
        if !field.is_empty() {
            out.push(Segment::Field(field.to_string()));
        }
        if !part.ends_with(']') {
            return Err(unsupported());
        }
        let index: usize = part[bracket + 1..part.len() - 1]
            .parse()
            .map_err(|_| unsupported())?;
        out.push(Segment::Index(index));
    } else if let Ok(index) = part.parse::<usize>() {
        // Numeric segment treated as array index ("points.0")
        out.push(Segment::Index(index));
    } else {
        out.push(Segment::Field(part.to_string()));
    }
    Ok(())
}

impl fmt::Display for PropertyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.object, self.property.is_empty()) {
            (Some(obj), true) => return write!(f, "{}", obj),
            (Some(obj), false) => write!(f, "{}.{}", obj, self.property)?,
            (None, _) => write!(f, "{}", self.property)?,
        }
        for segment in &self.subpath {
            match segment {
                Segment::Field(name) => write!(f, ".{}", name)?,
                Segment::Index(idx) => write!(f, "[{}]", idx)?,
            }
        }
        Ok(())
    }
}
