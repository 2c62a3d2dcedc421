//! Minimal KeePass XML tree.
//!
//! The whole document is read into a small element tree before any record
//! is interpreted, because protected values must be unmasked in document
//! order even inside parts that are never imported (history, recycle bin).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use zeroize::Zeroizing;

use keyward_common::{Error, Result};

use super::stream::InnerStream;

/// Nesting limit for the element tree.
const MAX_DEPTH: usize = 64;

/// One XML element with its text content.
#[derive(Default)]
pub(crate) struct Node {
    pub name: String,
    pub protected: bool,
    text: Zeroizing<String>,
    pub children: Vec<Node>,
}

impl Node {
    fn open(start: &BytesStart<'_>) -> Result<Self> {
        let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let protected = match start.try_get_attribute("Protected").map_err(xml_error)? {
            Some(attr) => attr.value.as_ref().eq_ignore_ascii_case(b"true"),
            None => false,
        };
        Ok(Self {
            name,
            protected,
            ..Self::default()
        })
    }

    /// Text content; empty for container elements.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// First direct child named `name`.
    pub fn child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Text of the first direct child named `name`.
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(Node::text)
    }

    /// Direct children named `name`.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    fn close(&mut self, stream: &mut InnerStream) -> Result<()> {
        if !self.children.is_empty() {
            // Mixed content only ever carries formatting whitespace.
            self.text = Zeroizing::new(String::new());
            return Ok(());
        }
        if self.protected {
            let mut masked = Zeroizing::new(
                BASE64
                    .decode(self.text.trim())
                    .map_err(|_| Error::Corruption("Protected value is not base64".to_string()))?,
            );
            stream.unprotect(masked.as_mut_slice());
            self.text = Zeroizing::new(String::from_utf8_lossy(&masked).into_owned());
        }
        Ok(())
    }
}

fn xml_error(e: impl std::fmt::Display) -> Error {
    Error::Corruption(format!("Invalid KDBX XML: {}", e))
}

/// Parse `xml` into a tree, unmasking protected values with `stream`.
///
/// # Errors
/// - `Corruption` for malformed XML, a DOCTYPE declaration, an unknown entity
///   reference, or nesting deeper than the limit
pub(crate) fn parse(xml: &[u8], stream: &mut InnerStream) -> Result<Node> {
    let text = std::str::from_utf8(xml).map_err(|_| xml_error("document is not UTF-8"))?;
    let mut reader = Reader::from_str(text);
    reader.expand_empty_elements(true);
    reader.check_end_names(true);

    let mut stack: Vec<Node> = Vec::new();
    let mut root: Option<Node> = None;

    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::DocType(_) => {
                return Err(xml_error("DOCTYPE declarations are not accepted"));
            }
            Event::Start(start) => {
                if stack.len() >= MAX_DEPTH {
                    return Err(xml_error("document nests too deeply"));
                }
                if root.is_some() {
                    return Err(xml_error("content after the root element"));
                }
                stack.push(Node::open(&start)?);
            }
            Event::End(_) => {
                let mut node = stack
                    .pop()
                    .ok_or_else(|| xml_error("unbalanced end tag"))?;
                node.close(stream)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None => root = Some(node),
                }
            }
            Event::Text(content) => {
                if let Some(node) = stack.last_mut() {
                    let unescaped = content.unescape().map_err(xml_error)?;
                    node.text.push_str(&unescaped);
                }
            }
            Event::CData(content) => {
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(&String::from_utf8_lossy(&content));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(xml_error("unterminated element"));
    }
    root.ok_or_else(|| xml_error("empty document"))
}
