//! Lenient parser and serializer for the HTML subset chat pages render.

use crate::{ChatsayError, Result};
use once_cell::sync::Lazy;
use regex::Regex;

/// Elements that never have children or a closing tag.
pub(crate) const VOID_ELEMENTS: &[&str] = &[
    "area", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "wbr",
];

static ATTRIBUTE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"([A-Za-z_:@][-A-Za-z0-9_:.@]*)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'=<>`]+)))?"#)
        .unwrap()
});

/// A node parsed from a markup fragment, not yet part of any document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedNode {
    Element {
        tag: String,
        attributes: Vec<(String, String)>,
        children: Vec<ParsedNode>,
    },
    Text(String),
}

struct OpenElement {
    tag: String,
    attributes: Vec<(String, String)>,
    children: Vec<ParsedNode>,
}

impl OpenElement {
    fn close(self) -> ParsedNode {
        ParsedNode::Element {
            tag: self.tag,
            attributes: self.attributes,
            children: self.children,
        }
    }
}

/// Parse a markup fragment.
///
/// Unclosed elements are closed at the end of input and stray closing tags
/// are ignored, the way a browser would recover.
pub fn parse_fragment(html: &str) -> Result<Vec<ParsedNode>> {
    let mut top: Vec<ParsedNode> = Vec::new();
    let mut stack: Vec<OpenElement> = Vec::new();
    let mut rest = html;

    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix("<!--") {
            let end = after
                .find("-->")
                .ok_or_else(|| ChatsayError::MarkupError("unterminated comment".into()))?;
            rest = &after[end + 3..];
            continue;
        }

        if let Some(after) = rest.strip_prefix("</") {
            let end = after
                .find('>')
                .ok_or_else(|| ChatsayError::MarkupError("unterminated closing tag".into()))?;
            let tag = after[..end].trim().to_ascii_lowercase();
            rest = &after[end + 1..];
            close_element(&mut stack, &mut top, &tag);
            continue;
        }

        if rest.starts_with('<') && rest[1..].starts_with(|c: char| c.is_ascii_alphabetic()) {
            let end = find_tag_end(rest)
                .ok_or_else(|| ChatsayError::MarkupError("unterminated start tag".into()))?;
            let inner = rest[1..end].trim_end();
            rest = &rest[end + 1..];

            let self_closing = inner.ends_with('/');
            let inner = inner.trim_end_matches('/');
            let name_end = inner.find(char::is_whitespace).unwrap_or(inner.len());
            let tag = inner[..name_end].to_ascii_lowercase();
            let attributes = parse_attributes(&inner[name_end..]);

            if self_closing || VOID_ELEMENTS.contains(&tag.as_str()) {
                current_children(&mut stack, &mut top).push(ParsedNode::Element {
                    tag,
                    attributes,
                    children: Vec::new(),
                });
            } else {
                stack.push(OpenElement {
                    tag,
                    attributes,
                    children: Vec::new(),
                });
            }
            continue;
        }

        let end = if rest.starts_with('<') {
            rest[1..].find('<').map_or(rest.len(), |i| i + 1)
        } else {
            rest.find('<').unwrap_or(rest.len())
        };
        let text = decode_entities(&rest[..end]);
        rest = &rest[end..];
        push_text(current_children(&mut stack, &mut top), text);
    }

    while let Some(open) = stack.pop() {
        let node = open.close();
        current_children(&mut stack, &mut top).push(node);
    }

    Ok(top)
}

fn current_children<'s>(
    stack: &'s mut [OpenElement],
    top: &'s mut Vec<ParsedNode>,
) -> &'s mut Vec<ParsedNode> {
    match stack.last_mut() {
        Some(open) => &mut open.children,
        None => top,
    }
}

fn push_text(children: &mut Vec<ParsedNode>, text: String) {
    if text.is_empty() {
        return;
    }
    if let Some(ParsedNode::Text(previous)) = children.last_mut() {
        previous.push_str(&text);
    } else {
        children.push(ParsedNode::Text(text));
    }
}

fn close_element(stack: &mut Vec<OpenElement>, top: &mut Vec<ParsedNode>, tag: &str) {
    if !stack.iter().any(|open| open.tag == tag) {
        return;
    }
    while let Some(open) = stack.pop() {
        let matched = open.tag == tag;
        let node = open.close();
        current_children(stack, top).push(node);
        if matched {
            break;
        }
    }
}

/// Index of the `>` ending the tag at the start of `s`, ignoring quoted `>`.
fn find_tag_end(s: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (i, c) in s.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '"' || c == '\'' => quote = Some(c),
            None if c == '>' => return Some(i),
            None => {}
        }
    }
    None
}

fn parse_attributes(s: &str) -> Vec<(String, String)> {
    let mut attributes: Vec<(String, String)> = Vec::new();
    for caps in ATTRIBUTE_RE.captures_iter(s) {
        let name = caps[1].to_ascii_lowercase();
        let value = caps
            .get(2)
            .or_else(|| caps.get(3))
            .or_else(|| caps.get(4))
            .map(|m| decode_entities(m.as_str()))
            .unwrap_or_default();
        if !attributes.iter().any(|(existing, _)| *existing == name) {
            attributes.push((name, value));
        }
    }
    attributes
}

pub(crate) fn decode_entities(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&nbsp;", "\u{a0}")
        .replace("&amp;", "&")
}

pub(crate) fn escape_text(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

pub(crate) fn escape_attribute(s: &str) -> String {
    s.replace('&', "&amp;").replace('"', "&quot;")
}
