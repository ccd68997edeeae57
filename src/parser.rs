//! Expression parser
//!
//! Hand-rolled tokenizer plus recursive descent over the operator
//! precedence ladder. Parses in the context of a host object: a leading
//! path segment naming a document object becomes the object qualifier,
//! anything else resolves relative to the owner.
//!
//! Supports:
//! - arithmetic: `+ - * / %`, unary `-`, parentheses
//! - comparison and logic: `== != < <= > >= && || !`
//! - conditional: `cond ? a : b`
//! - builtin calls: `min(a, b)`, `abs(x)`, ...
//! - string literals: `"..."` with backslash escapes
//! - variable paths: `Box.Height`, `Shape.points[0].x`

use std::iter::Peekable;
use std::str::CharIndices;
use std::sync::Arc;

use thiserror::Error;

use crate::document::Document;
use crate::expr::{BinaryOp, Expr, Func, UnaryOp};
use crate::path::{PathError, PropertyPath};

/// Expression parse failure
#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("unexpected character '{ch}' at offset {pos}")]
    UnexpectedChar { pos: usize, ch: char },
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unexpected token '{token}' at offset {pos}")]
    UnexpectedToken { pos: usize, token: String },
    #[error("unknown function '{name}'")]
    UnknownFunction { name: String },
    #[error("{func}() takes {expected} argument(s), got {got}")]
    Arity {
        func: String,
        expected: usize,
        got: usize,
    },
    #[error("malformed number at offset {pos}")]
    BadNumber { pos: usize },
    #[error("unterminated string literal at offset {pos}")]
    UnterminatedString { pos: usize },
    #[error(transparent)]
    BadPath(#[from] PathError),
}

/// Parse an expression string in the context of a host object
///
/// Variable paths are canonicalized against `owner` so the resulting tree
/// carries fully-qualified references.
pub fn parse_expression(
    doc: &Document,
    owner: &Arc<str>,
    text: &str,
) -> Result<Expr, ParseError> {
    let tokens = tokenize(text)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        doc,
        owner,
    };
    let expr = parser.conditional()?;
    match parser.peek() {
        None => Ok(expr),
        Some((pos, token)) => Err(ParseError::UnexpectedToken {
            pos: *pos,
            token: token.render(),
        }),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    /// Identifier or dotted/bracketed path text
    Word(String),
    LParen,
    RParen,
    Comma,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Question,
    Colon,
    Bang,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    Ne,
    AndAnd,
    OrOr,
}

impl Token {
    fn render(&self) -> String {
        match self {
            Token::Number(n) => n.to_string(),
            Token::Str(s) => format!("\"{}\"", s),
            Token::Word(w) => w.clone(),
            Token::LParen => "(".into(),
            Token::RParen => ")".into(),
            Token::Comma => ",".into(),
            Token::Plus => "+".into(),
            Token::Minus => "-".into(),
            Token::Star => "*".into(),
            Token::Slash => "/".into(),
            Token::Percent => "%".into(),
            Token::Question => "?".into(),
            Token::Colon => ":".into(),
            Token::Bang => "!".into(),
            Token::Lt => "<".into(),
            Token::Le => "<=".into(),
            Token::Gt => ">".into(),
            Token::Ge => ">=".into(),
            Token::EqEq => "==".into(),
            Token::Ne => "!=".into(),
            Token::AndAnd => "&&".into(),
            Token::OrOr => "||".into(),
        }
    }
}

fn tokenize(text: &str) -> Result<Vec<(usize, Token)>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = text.char_indices().peekable();

    while let Some(&(pos, ch)) = chars.peek() {
        match ch {
            c if c.is_whitespace() => {
                chars.next();
            }
            '0'..='9' => tokens.push((pos, lex_number(&mut chars, text, pos)?)),
            '"' => tokens.push((pos, lex_string(&mut chars, pos)?)),
            c if c.is_ascii_alphabetic() || c == '_' => {
                tokens.push((pos, lex_word(&mut chars, text, pos)));
            }
            '(' => push_single(&mut chars, &mut tokens, pos, Token::LParen),
            ')' => push_single(&mut chars, &mut tokens, pos, Token::RParen),
            ',' => push_single(&mut chars, &mut tokens, pos, Token::Comma),
            '+' => push_single(&mut chars, &mut tokens, pos, Token::Plus),
            '-' => push_single(&mut chars, &mut tokens, pos, Token::Minus),
            '*' => push_single(&mut chars, &mut tokens, pos, Token::Star),
            '/' => push_single(&mut chars, &mut tokens, pos, Token::Slash),
            '%' => push_single(&mut chars, &mut tokens, pos, Token::Percent),
            '?' => push_single(&mut chars, &mut tokens, pos, Token::Question),
            ':' => push_single(&mut chars, &mut tokens, pos, Token::Colon),
            '<' => push_comparison(&mut chars, &mut tokens, pos, Token::Lt, Token::Le),
            '>' => push_comparison(&mut chars, &mut tokens, pos, Token::Gt, Token::Ge),
            '=' => {
                chars.next();
                if chars.peek().map(|(_, c)| *c) == Some('=') {
                    chars.next();
                    tokens.push((pos, Token::EqEq));
                } else {
                    return Err(ParseError::UnexpectedChar { pos, ch: '=' });
                }
            }
            '!' => {
                chars.next();
                if chars.peek().map(|(_, c)| *c) == Some('=') {
                    chars.next();
                    tokens.push((pos, Token::Ne));
                } else {
                    tokens.push((pos, Token::Bang));
                }
            }
            '&' => {
                chars.next();
                if chars.peek().map(|(_, c)| *c) == Some('&') {
                    chars.next();
                    tokens.push((pos, Token::AndAnd));
                } else {
                    return Err(ParseError::UnexpectedChar { pos, ch: '&' });
                }
            }
            '|' => {
                chars.next();
                if chars.peek().map(|(_, c)| *c) == Some('|') {
                    chars.next();
                    tokens.push((pos, Token::OrOr));
                } else {
                    return Err(ParseError::UnexpectedChar { pos, ch: '|' });
                }
            }
            other => return Err(ParseError::UnexpectedChar { pos, ch: other }),
        }
    }

    Ok(tokens)
}

fn push_single(
    chars: &mut Peekable<CharIndices>,
    tokens: &mut Vec<(usize, Token)>,
    pos: usize,
    token: Token,
) {
    chars.next();
    tokens.push((pos, token));
}

fn push_comparison(
    chars: &mut Peekable<CharIndices>,
    tokens: &mut Vec<(usize, Token)>,
    pos: usize,
    bare: Token,
    with_eq: Token,
) {
    chars.next();
    if chars.peek().map(|(_, c)| *c) == Some('=') {
        chars.next();
        tokens.push((pos, with_eq));
    } else {
        tokens.push((pos, bare));
    }
}

fn lex_number(
    chars: &mut Peekable<CharIndices>,
    text: &str,
    start: usize,
) -> Result<Token, ParseError> {
    let mut end = start;
    let mut seen_dot = false;
    while let Some(&(pos, ch)) = chars.peek() {
        match ch {
            '0'..='9' => {
                end = pos + ch.len_utf8();
                chars.next();
            }
            '.' if !seen_dot => {
                // Only a fraction if a digit follows; "1.x" is path syntax
                let mut ahead = chars.clone();
                ahead.next();
                match ahead.peek() {
                    Some((_, c)) if c.is_ascii_digit() => {
                        seen_dot = true;
                        end = pos + 1;
                        chars.next();
                    }
                    _ => break,
                }
            }
            _ => break,
        }
    }
    text[start..end]
        .parse::<f64>()
        .map(Token::Number)
        .map_err(|_| ParseError::BadNumber { pos: start })
}

fn lex_string(chars: &mut Peekable<CharIndices>, start: usize) -> Result<Token, ParseError> {
    chars.next(); // opening quote
    let mut out = String::new();
    while let Some((_, ch)) = chars.next() {
        match ch {
            '"' => return Ok(Token::Str(out)),
            '\\' => match chars.next() {
                Some((_, escaped)) => out.push(escaped),
                None => return Err(ParseError::UnterminatedString { pos: start }),
            },
            other => out.push(other),
        }
    }
    Err(ParseError::UnterminatedString { pos: start })
}

/// Consume an identifier and any trailing `.segment` / `[index]` path text
fn lex_word(chars: &mut Peekable<CharIndices>, text: &str, start: usize) -> Token {
    let mut end = start;

    let mut consume_segment = |chars: &mut Peekable<CharIndices>, end: &mut usize| {
        while let Some(&(pos, ch)) = chars.peek() {
            if ch.is_ascii_alphanumeric() || ch == '_' {
                *end = pos + ch.len_utf8();
                chars.next();
            } else {
                break;
            }
        }
    };

    consume_segment(chars, &mut end);

    loop {
        match chars.peek().copied() {
            Some((pos, '.')) => {
                // Path continues only into another segment character
                let mut ahead = chars.clone();
                ahead.next();
                match ahead.peek() {
                    Some((_, c)) if c.is_ascii_alphanumeric() || *c == '_' => {
                        end = pos + 1;
                        chars.next();
                        consume_segment(chars, &mut end);
                    }
                    _ => break,
                }
            }
            Some((pos, '[')) => {
                // Bracketed index: consume through the closing bracket
                let mut ahead = chars.clone();
                ahead.next();
                let mut ok = false;
                let mut close = pos;
                while let Some(&(p, c)) = ahead.peek() {
                    if c.is_ascii_digit() {
                        ahead.next();
                    } else if c == ']' {
                        ok = p > pos + 1;
                        close = p;
                        break;
                    } else {
                        break;
                    }
                }
                if !ok {
                    break;
                }
                while let Some(&(p, _)) = chars.peek() {
                    chars.next();
                    if p == close {
                        break;
                    }
                }
                end = close + 1;
            }
            _ => break,
        }
    }

    Token::Word(text[start..end].to_string())
}

struct Parser<'a> {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    doc: &'a Document,
    owner: &'a Arc<str>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&(usize, Token)> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<(usize, Token)> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek().map(|(_, t)| t) == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token) -> Result<(), ParseError> {
        match self.next() {
            Some((_, token)) if token == expected => Ok(()),
            Some((pos, token)) => Err(ParseError::UnexpectedToken {
                pos,
                token: token.render(),
            }),
            None => Err(ParseError::UnexpectedEnd),
        }
    }

    fn conditional(&mut self) -> Result<Expr, ParseError> {
        let cond = self.logic_or()?;
        if !self.eat(&Token::Question) {
            return Ok(cond);
        }
        let then = self.conditional()?;
        self.expect(Token::Colon)?;
        let otherwise = self.conditional()?;
        Ok(Expr::Cond {
            cond: Box::new(cond),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        })
    }

    fn logic_or(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.logic_and()?;
        while self.eat(&Token::OrOr) {
            let rhs = self.logic_and()?;
            expr = binary(BinaryOp::Or, expr, rhs);
        }
        Ok(expr)
    }

    fn logic_and(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.equality()?;
        while self.eat(&Token::AndAnd) {
            let rhs = self.equality()?;
            expr = binary(BinaryOp::And, expr, rhs);
        }
        Ok(expr)
    }

    fn equality(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.comparison()?;
        loop {
            let op = match self.peek() {
                Some((_, Token::EqEq)) => BinaryOp::Eq,
                Some((_, Token::Ne)) => BinaryOp::Ne,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.comparison()?;
            expr = binary(op, expr, rhs);
        }
        Ok(expr)
    }

    fn comparison(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.additive()?;
        loop {
            let op = match self.peek() {
                Some((_, Token::Lt)) => BinaryOp::Lt,
                Some((_, Token::Le)) => BinaryOp::Le,
                Some((_, Token::Gt)) => BinaryOp::Gt,
                Some((_, Token::Ge)) => BinaryOp::Ge,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.additive()?;
            expr = binary(op, expr, rhs);
        }
        Ok(expr)
    }

    fn additive(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.term()?;
        loop {
            let op = match self.peek() {
                Some((_, Token::Plus)) => BinaryOp::Add,
                Some((_, Token::Minus)) => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.term()?;
            expr = binary(op, expr, rhs);
        }
        Ok(expr)
    }

    fn term(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.unary()?;
        loop {
            let op = match self.peek() {
                Some((_, Token::Star)) => BinaryOp::Mul,
                Some((_, Token::Slash)) => BinaryOp::Div,
                Some((_, Token::Percent)) => BinaryOp::Mod,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.unary()?;
            expr = binary(op, expr, rhs);
        }
        Ok(expr)
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        if self.eat(&Token::Minus) {
            let operand = self.unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                operand: Box::new(operand),
            });
        }
        if self.eat(&Token::Bang) {
            let operand = self.unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, ParseError> {
        match self.next() {
            Some((_, Token::Number(n))) => Ok(Expr::Number(n)),
            Some((_, Token::Str(s))) => Ok(Expr::Str(s)),
            Some((_, Token::LParen)) => {
                let inner = self.conditional()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some((_, Token::Word(word))) => self.word(word),
            Some((pos, token)) => Err(ParseError::UnexpectedToken {
                pos,
                token: token.render(),
            }),
            None => Err(ParseError::UnexpectedEnd),
        }
    }

    fn word(&mut self, word: String) -> Result<Expr, ParseError> {
        match word.as_str() {
            "true" => return Ok(Expr::Bool(true)),
            "false" => return Ok(Expr::Bool(false)),
            _ => {}
        }

        // Function call
        if self.peek().map(|(_, t)| t) == Some(&Token::LParen) {
            let Some(func) = Func::from_name(&word) else {
                return Err(ParseError::UnknownFunction { name: word });
            };
            self.pos += 1; // consume '('
            let mut args = Vec::new();
            if !self.eat(&Token::RParen) {
                loop {
                    args.push(self.conditional()?);
                    if self.eat(&Token::Comma) {
                        continue;
                    }
                    self.expect(Token::RParen)?;
                    break;
                }
            }
            if args.len() != func.arity() {
                return Err(ParseError::Arity {
                    func: func.name().to_string(),
                    expected: func.arity(),
                    got: args.len(),
                });
            }
            return Ok(Expr::Call { func, args });
        }

        let path = self.doc.parse_path(&word)?;
        Ok(Expr::Var(path.canonical(self.owner)))
    }
}

fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
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
            .add_property("Shape", json!({"points": [{"x": 1.5}]}));
        doc.add_object("Pad").add_property("Length", json!(4.0));
        doc
    }

    fn parse(text: &str) -> Expr {
        let doc = doc();
        let owner = intern("Pad");
        parse_expression(&doc, &owner, text).unwrap()
    }

    fn eval(text: &str) -> serde_json::Value {
        let doc = doc();
        let owner = intern("Pad");
        let expr = parse_expression(&doc, &owner, text).unwrap();
        expr.eval(&doc, &owner).unwrap()
    }

    #[test]
    fn parse_precedence() {
        assert_eq!(eval("1 + 2 * 3"), json!(7.0));
        assert_eq!(eval("(1 + 2) * 3"), json!(9.0));
        assert_eq!(eval("-2 * 3"), json!(-6.0));
        assert_eq!(eval("10 % 4 + 1"), json!(3.0));
    }

    #[test]
    fn parse_variable_paths() {
        assert_eq!(eval("Box.Height + Length"), json!(14.0));
        assert_eq!(eval("Box.Shape.points[0].x"), json!(1.5));
        assert_eq!(eval("Box.Shape.points.0.x"), json!(1.5));
    }

    #[test]
    fn relative_path_canonicalized_to_owner() {
        let expr = parse("Length * 2");
        let doc = doc();
        let owner = intern("Pad");
        let deps = expr.deps(&owner);
        assert!(deps["Pad"].contains_key("Length"));
        assert_eq!(expr.to_string(), "Pad.Length * 2");
    }

    #[test]
    fn parse_conditional_and_comparison() {
        assert_eq!(eval("Box.Height > 5 ? 1 : 2"), json!(1.0));
        assert_eq!(eval("Box.Height < 5 ? 1 : 2"), json!(2.0));
        assert_eq!(eval("Box.Height == 10 && true"), json!(true));
        assert_eq!(eval("!(1 > 2) || false"), json!(true));
    }

    #[test]
    fn parse_builtin_calls() {
        assert_eq!(eval("min(Box.Height, Length)"), json!(4.0));
        assert_eq!(eval("pow(2, 10)"), json!(1024.0));
        assert_eq!(eval("abs(-3.5)"), json!(3.5));
    }

    #[test]
    fn parse_string_literals() {
        assert_eq!(eval(r#""a" + "b""#), json!("ab"));
        assert_eq!(eval(r#""say \"hi\"""#), json!("say \"hi\""));
    }

    #[test]
    fn unknown_function_rejected() {
        let doc = doc();
        let owner = intern("Pad");
        let err = parse_expression(&doc, &owner, "frobnicate(1)").unwrap_err();
        assert_eq!(
            err,
            ParseError::UnknownFunction {
                name: "frobnicate".to_string()
            }
        );
    }

    #[test]
    fn arity_mismatch_rejected() {
        let doc = doc();
        let owner = intern("Pad");
        let err = parse_expression(&doc, &owner, "min(1)").unwrap_err();
        assert!(matches!(err, ParseError::Arity { expected: 2, got: 1, .. }));
    }

    #[test]
    fn trailing_garbage_rejected() {
        let doc = doc();
        let owner = intern("Pad");
        assert!(parse_expression(&doc, &owner, "1 + 2 )").is_err());
        assert!(parse_expression(&doc, &owner, "1 @ 2").is_err());
        assert!(parse_expression(&doc, &owner, "").is_err());
    }

    #[test]
    fn display_round_trips_through_parse() {
        let doc = doc();
        let owner = intern("Pad");
        for text in [
            "Box.Height + 1",
            "(Box.Height + 1) * 2",
            "min(Box.Height, Pad.Length) / 2",
            "Box.Height > 5 ? Pad.Length : 0",
        ] {
            let expr = parse_expression(&doc, &owner, text).unwrap();
            let rendered = expr.to_string();
            let reparsed = parse_expression(&doc, &owner, &rendered).unwrap();
            assert_eq!(reparsed, expr, "render: {}", rendered);
        }
    }
}
