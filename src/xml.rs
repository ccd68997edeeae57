//! Minimal XML element scanner for the persisted engine representation
//!
//! The engine persists one element shape:
//!
//! ```text
//! <ExpressionEngine count="N">
//!   <Expression path="P" expression="E" comment="C"/>
//! </ExpressionEngine>
//! ```
//!
//! Supports:
//! - open / self-closing / closing tags with `name="value"` attributes
//! - attribute encoding of `& " < >`
//!
//! Does NOT support:
//! - text nodes, comments, processing instructions, CDATA
//! - single-quoted attributes

use rustc_hash::FxHashMap;
use thiserror::Error;

/// Scan failure
#[derive(Debug, Error, PartialEq, Eq)]
pub enum XmlError {
    #[error("malformed XML at offset {pos}: {reason}")]
    Malformed { pos: usize, reason: String },
    #[error("unknown entity '&{entity};'")]
    UnknownEntity { entity: String },
}

/// How a scanned tag was written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    Open,
    SelfClose,
    Close,
}

/// One scanned tag with its decoded attributes
#[derive(Debug, Clone)]
pub struct Tag {
    pub name: String,
    pub kind: TagKind,
    pub attrs: FxHashMap<String, String>,
}

impl Tag {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }
}

/// Attribute-encode `& " < >`
pub fn escape_attribute(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            other => out.push(other),
        }
    }
    out
}

/// Decode attribute entities
pub fn unescape_attribute(text: &str) -> Result<String, XmlError> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.char_indices();
    while let Some((pos, ch)) = chars.next() {
        if ch != '&' {
            out.push(ch);
            continue;
        }
        let rest = &text[pos + 1..];
        let Some(end) = rest.find(';') else {
            return Err(XmlError::Malformed {
                pos,
                reason: "unterminated entity".to_string(),
            });
        };
        let entity = &rest[..end];
        out.push(match entity {
            "amp" => '&',
            "quot" => '"',
            "lt" => '<',
            "gt" => '>',
            other => {
                return Err(XmlError::UnknownEntity {
                    entity: other.to_string(),
                })
            }
        });
        // Skip the entity body and trailing ';'
        for _ in 0..=end {
            chars.next();
        }
    }
    Ok(out)
}

/// Scan every tag in `text`, ignoring whitespace between tags
pub fn scan(text: &str) -> Result<Vec<Tag>, XmlError> {
    let mut tags = Vec::new();
    let bytes = text.as_bytes();
    let mut pos = 0;

    while pos < bytes.len() {
        if bytes[pos].is_ascii_whitespace() {
            pos += 1;
            continue;
        }
        if bytes[pos] != b'<' {
            return Err(XmlError::Malformed {
                pos,
                reason: "expected '<'".to_string(),
            });
        }
        let close = text[pos..].find('>').ok_or_else(|| XmlError::Malformed {
            pos,
            reason: "unterminated tag".to_string(),
        })? + pos;
        tags.push(parse_tag(&text[pos + 1..close], pos)?);
        pos = close + 1;
    }
    Ok(tags)
}

fn parse_tag(body: &str, offset: usize) -> Result<Tag, XmlError> {
    let malformed = |reason: &str| XmlError::Malformed {
        pos: offset,
        reason: reason.to_string(),
    };

    let (body, kind_hint) = match body.strip_prefix('/') {
        Some(rest) => (rest, TagKind::Close),
        None => (body, TagKind::Open),
    };
    let (body, kind) = match body.strip_suffix('/') {
        Some(rest) if kind_hint == TagKind::Open => (rest, TagKind::SelfClose),
        Some(_) => return Err(malformed("closing tag cannot self-close")),
        None => (body, kind_hint),
    };

    let body = body.trim();
    let name_end = body
        .find(|c: char| c.is_whitespace())
        .unwrap_or(body.len());
    let name = &body[..name_end];
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(malformed("bad tag name"));
    }

    let mut attrs = FxHashMap::default();
    let mut rest = body[name_end..].trim_start();
    while !rest.is_empty() {
        if kind == TagKind::Close {
            return Err(malformed("closing tag cannot carry attributes"));
        }
        let eq = rest.find('=').ok_or_else(|| malformed("expected '='"))?;
        let attr_name = rest[..eq].trim_end();
        if attr_name.is_empty() {
            return Err(malformed("empty attribute name"));
        }
        let after_eq = rest[eq + 1..].trim_start();
        let Some(stripped) = after_eq.strip_prefix('"') else {
            return Err(malformed("expected '\"' after '='"));
        };
        let end_quote = stripped
            .find('"')
            .ok_or_else(|| malformed("unterminated attribute value"))?;
        attrs.insert(
            attr_name.to_string(),
            unescape_attribute(&stripped[..end_quote])?,
        );
        rest = stripped[end_quote + 1..].trim_start();
    }

    Ok(Tag {
        name: name.to_string(),
        kind,
        attrs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_round_trips() {
        let raw = r#"a < b && c > "d""#;
        let escaped = escape_attribute(raw);
        assert!(!escaped.contains('"'));
        assert!(!escaped.contains('<'));
        assert_eq!(unescape_attribute(&escaped).unwrap(), raw);
    }

    #[test]
    fn unknown_entity_rejected() {
        assert_eq!(
            unescape_attribute("&bogus;"),
            Err(XmlError::UnknownEntity {
                entity: "bogus".to_string()
            })
        );
    }

    #[test]
    fn scan_engine_element() {
        let text = r#"
<ExpressionEngine count="2">
  <Expression path="Calc.A" expression="Calc.B + 1"/>
  <Expression path="Calc.B" expression="2 * 3" comment="doubled"/>
</ExpressionEngine>
"#;
        let tags = scan(text).unwrap();
        assert_eq!(tags.len(), 4);

        assert_eq!(tags[0].name, "ExpressionEngine");
        assert_eq!(tags[0].kind, TagKind::Open);
        assert_eq!(tags[0].attr("count"), Some("2"));

        assert_eq!(tags[1].kind, TagKind::SelfClose);
        assert_eq!(tags[1].attr("path"), Some("Calc.A"));
        assert_eq!(tags[2].attr("comment"), Some("doubled"));

        assert_eq!(tags[3].kind, TagKind::Close);
        assert_eq!(tags[3].name, "ExpressionEngine");
    }

    #[test]
    fn scan_decodes_escaped_attributes() {
        let text = r#"<Expression path="Calc.A" expression="Calc.B &lt; 2 ? &quot;x&quot; : &quot;y&quot;"/>"#;
        let tags = scan(text).unwrap();
        assert_eq!(
            tags[0].attr("expression"),
            Some(r#"Calc.B < 2 ? "x" : "y""#)
        );
    }

    #[test]
    fn scan_rejects_malformed_input() {
        assert!(scan("plain text").is_err());
        assert!(scan("<Unterminated").is_err());
        assert!(scan(r#"<Tag attr='single'/>"#).is_err());
        assert!(scan(r#"<Tag attr="unclosed/>"#).is_err());
        assert!(scan(r#"</Close attr="x"/>"#).is_err());
    }
}
