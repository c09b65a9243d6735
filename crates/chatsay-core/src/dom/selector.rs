//! CSS selector subset used by site profiles.
//!
//! Supported: type selectors, `*`, `#id`, `.class`, attribute selectors
//! (`[a]`, `[a=v]`, `[a^=v]`, `[a$=v]`, `[a*=v]`), descendant and `>` child
//! combinators, and `,` selector lists.

use crate::{ChatsayError, Result};
use chatsay_types::NodeId;
use std::fmt;
use std::str::FromStr;

/// Read access to element data needed for matching.
pub(crate) trait ElementView {
    fn tag_of(&self, node: NodeId) -> Option<&str>;
    fn attribute_of(&self, node: NodeId, name: &str) -> Option<&str>;
    fn parent_element_of(&self, node: NodeId) -> Option<NodeId>;
}

/// A parsed selector list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    source: String,
    alternatives: Vec<Complex>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Complex {
    /// Compounds left to right; each combinator relates a compound to the
    /// one before it (the first combinator is unused).
    parts: Vec<(Combinator, Compound)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Combinator {
    Descendant,
    Child,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Compound {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
    attributes: Vec<AttributeMatch>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct AttributeMatch {
    name: String,
    op: AttributeOp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum AttributeOp {
    Exists,
    Equals(String),
    Prefix(String),
    Suffix(String),
    Contains(String),
}

impl Selector {
    pub fn parse(source: &str) -> Result<Self> {
        let alternatives = Parser::new(source).parse_list()?;
        Ok(Self {
            source: source.trim().to_string(),
            alternatives,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub(crate) fn matches(&self, view: &impl ElementView, node: NodeId) -> bool {
        if view.tag_of(node).is_none() {
            return false;
        }
        self.alternatives
            .iter()
            .any(|complex| matches_parts(view, node, &complex.parts))
    }
}

impl FromStr for Selector {
    type Err = ChatsayError;

    fn from_str(s: &str) -> Result<Self> {
        Selector::parse(s)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn matches_parts(view: &impl ElementView, node: NodeId, parts: &[(Combinator, Compound)]) -> bool {
    let Some(((combinator, last), rest)) = parts.split_last() else {
        return false;
    };
    if !last.matches(view, node) {
        return false;
    }
    if rest.is_empty() {
        return true;
    }

    match combinator {
        Combinator::Child => view
            .parent_element_of(node)
            .is_some_and(|parent| matches_parts(view, parent, rest)),
        Combinator::Descendant => {
            let mut current = view.parent_element_of(node);
            while let Some(ancestor) = current {
                if matches_parts(view, ancestor, rest) {
                    return true;
                }
                current = view.parent_element_of(ancestor);
            }
            false
        }
    }
}

impl Compound {
    fn is_empty(&self) -> bool {
        self.tag.is_none() && self.id.is_none() && self.classes.is_empty() && self.attributes.is_empty()
    }

    fn matches(&self, view: &impl ElementView, node: NodeId) -> bool {
        let Some(tag) = view.tag_of(node) else {
            return false;
        };
        if let Some(expected) = &self.tag {
            if !expected.eq_ignore_ascii_case(tag) {
                return false;
            }
        }
        if let Some(id) = &self.id {
            if view.attribute_of(node, "id") != Some(id.as_str()) {
                return false;
            }
        }
        if !self.classes.is_empty() {
            let class_attr = view.attribute_of(node, "class").unwrap_or("");
            let classes: Vec<&str> = class_attr.split_whitespace().collect();
            if !self.classes.iter().all(|wanted| classes.contains(&wanted.as_str())) {
                return false;
            }
        }
        self.attributes.iter().all(|m| {
            let value = view.attribute_of(node, &m.name);
            match (&m.op, value) {
                (_, None) => false,
                (AttributeOp::Exists, Some(_)) => true,
                (AttributeOp::Equals(v), Some(actual)) => actual == v,
                (AttributeOp::Prefix(v), Some(actual)) => !v.is_empty() && actual.starts_with(v.as_str()),
                (AttributeOp::Suffix(v), Some(actual)) => !v.is_empty() && actual.ends_with(v.as_str()),
                (AttributeOp::Contains(v), Some(actual)) => !v.is_empty() && actual.contains(v.as_str()),
            }
        })
    }
}

struct Parser<'a> {
    source: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.chars().collect(),
            pos: 0,
        }
    }

    fn error(&self, reason: impl Into<String>) -> ChatsayError {
        ChatsayError::InvalidSelector {
            selector: self.source.to_string(),
            reason: reason.into(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn skip_whitespace(&mut self) -> bool {
        let start = self.pos;
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
        self.pos > start
    }

    fn parse_list(&mut self) -> Result<Vec<Complex>> {
        let mut alternatives = Vec::new();
        loop {
            self.skip_whitespace();
            alternatives.push(self.parse_complex()?);
            self.skip_whitespace();
            match self.bump() {
                None => break,
                Some(',') => continue,
                Some(c) => return Err(self.error(format!("unexpected '{}'", c))),
            }
        }
        Ok(alternatives)
    }

    fn parse_complex(&mut self) -> Result<Complex> {
        let mut parts = vec![(Combinator::Descendant, self.parse_compound()?)];
        loop {
            let had_whitespace = self.skip_whitespace();
            let combinator = match self.peek() {
                None | Some(',') => break,
                Some('>') => {
                    self.pos += 1;
                    self.skip_whitespace();
                    Combinator::Child
                }
                Some(_) if had_whitespace => Combinator::Descendant,
                Some(c) => return Err(self.error(format!("unexpected '{}'", c))),
            };
            parts.push((combinator, self.parse_compound()?));
        }
        Ok(Complex { parts })
    }

    fn parse_compound(&mut self) -> Result<Compound> {
        let mut compound = Compound::default();
        let mut universal = false;

        match self.peek() {
            Some('*') => {
                self.pos += 1;
                universal = true;
            }
            Some(c) if is_ident_char(c) => {
                compound.tag = Some(self.parse_ident()?.to_ascii_lowercase());
            }
            _ => {}
        }

        loop {
            match self.peek() {
                Some('#') => {
                    self.pos += 1;
                    compound.id = Some(self.parse_ident()?);
                }
                Some('.') => {
                    self.pos += 1;
                    compound.classes.push(self.parse_ident()?);
                }
                Some('[') => {
                    self.pos += 1;
                    compound.attributes.push(self.parse_attribute()?);
                }
                _ => break,
            }
        }

        if compound.is_empty() && !universal {
            return Err(self.error("expected a selector"));
        }
        Ok(compound)
    }

    fn parse_attribute(&mut self) -> Result<AttributeMatch> {
        self.skip_whitespace();
        let name = self.parse_ident()?.to_ascii_lowercase();
        self.skip_whitespace();

        let op = match self.bump() {
            Some(']') => return Ok(AttributeMatch { name, op: AttributeOp::Exists }),
            Some('=') => AttributeOp::Equals(String::new()),
            Some(c @ ('^' | '$' | '*')) => {
                if self.bump() != Some('=') {
                    return Err(self.error(format!("expected '=' after '{}'", c)));
                }
                match c {
                    '^' => AttributeOp::Prefix(String::new()),
                    '$' => AttributeOp::Suffix(String::new()),
                    _ => AttributeOp::Contains(String::new()),
                }
            }
            Some(c) => return Err(self.error(format!("unexpected '{}' in attribute selector", c))),
            None => return Err(self.error("unterminated attribute selector")),
        };

        self.skip_whitespace();
        let value = self.parse_value()?;
        self.skip_whitespace();
        if self.bump() != Some(']') {
            return Err(self.error("expected ']'"));
        }

        let op = match op {
            AttributeOp::Equals(_) => AttributeOp::Equals(value),
            AttributeOp::Prefix(_) => AttributeOp::Prefix(value),
            AttributeOp::Suffix(_) => AttributeOp::Suffix(value),
            AttributeOp::Contains(_) => AttributeOp::Contains(value),
            AttributeOp::Exists => AttributeOp::Exists,
        };
        Ok(AttributeMatch { name, op })
    }

    fn parse_value(&mut self) -> Result<String> {
        match self.peek() {
            Some(quote @ ('"' | '\'')) => {
                self.pos += 1;
                let mut value = String::new();
                loop {
                    match self.bump() {
                        Some(c) if c == quote => return Ok(value),
                        Some(c) => value.push(c),
                        None => return Err(self.error("unterminated string")),
                    }
                }
            }
            _ => self.parse_ident(),
        }
    }

    fn parse_ident(&mut self) -> Result<String> {
        let start = self.pos;
        while self.peek().is_some_and(is_ident_char) {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(self.error("expected an identifier"));
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '-' || c == '_'
}
