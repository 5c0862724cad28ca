//! Incremental XML stream tokenizer.
//!
//! Bytes arrive in arbitrary chunks; [`StreamParser`] buffers them and yields
//! the stream opening tag, each complete top-level element, and the stream
//! close tag as they become available. Incomplete trailing data stays in the
//! buffer until the next read completes it.

use bytes::{Buf, BytesMut};
use quick_xml::errors::SyntaxError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::borrow::Cow;
use tracing::trace;

use crate::element::{Element, Node};
use crate::error::WireError;

/// Default cap on buffered, not yet complete input
pub const DEFAULT_MAX_STANZA_SIZE: usize = 1024 * 1024;

const STREAM_CLOSE: &[u8] = b"</stream:stream>";

/// One unit of an XML stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamToken {
    /// Opening `<stream:stream>` tag (as an element without children)
    Open(Element),
    /// A complete top-level element
    Stanza(Element),
    /// Closing `</stream:stream>` tag
    Close,
}

/// Namespace bindings in scope: `(prefix, uri)` where `None` is the default namespace
type Scope = Vec<(Option<String>, String)>;

enum Boundary {
    Open { start: usize, end: usize },
    Stanza { start: usize, end: usize },
    Close { end: usize },
    Skip { end: usize },
}

/// Buffers stream bytes and splits them into [`StreamToken`]s
#[derive(Debug)]
pub struct StreamParser {
    buffer: BytesMut,
    stream_scope: Scope,
    max_size: usize,
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamParser {
    /// Create a parser with the default size limit
    pub fn new() -> Self {
        Self::with_max_size(DEFAULT_MAX_STANZA_SIZE)
    }

    /// Create a parser that rejects more than `max_size` buffered bytes
    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
            stream_scope: Vec::new(),
            max_size,
        }
    }

    /// Append raw bytes
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Direct access to the read buffer, for `AsyncReadExt::read_buf`
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Number of buffered bytes not yet consumed
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Forget buffered bytes and stream namespaces (after a transport upgrade)
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.stream_scope.clear();
    }

    /// Pull the next complete token, or `None` if more input is needed
    pub fn next_token(&mut self) -> Result<Option<StreamToken>, WireError> {
        loop {
            let boundary = match scan(&self.buffer)? {
                Some(boundary) => boundary,
                None => {
                    if self.buffer.len() > self.max_size {
                        return Err(WireError::Size(self.buffer.len()));
                    }
                    return Ok(None);
                }
            };

            match boundary {
                Boundary::Skip { end } => {
                    self.buffer.advance(end);
                    if self.buffer.is_empty() {
                        return Ok(None);
                    }
                }
                Boundary::Close { end } => {
                    self.buffer.advance(end);
                    return Ok(Some(StreamToken::Close));
                }
                Boundary::Open { start, end } => {
                    let header = parse_stream_header(&self.buffer[start..end])?;
                    self.stream_scope = declarations(&header);
                    self.buffer.advance(end);
                    trace!("Parsed stream header <{}>", header.qualified_name());
                    return Ok(Some(StreamToken::Open(header)));
                }
                Boundary::Stanza { start, end } => {
                    let stanza = parse_fragment(&self.buffer[start..end], &self.stream_scope)?;
                    self.buffer.advance(end);
                    return Ok(Some(StreamToken::Stanza(stanza)));
                }
            }
        }
    }
}

/// Parse one complete XML element outside of any stream context
pub fn parse_element(xml: &str) -> Result<Element, WireError> {
    parse_fragment(xml.as_bytes(), &Vec::new())
}

fn is_stream_tag(qname: &[u8]) -> bool {
    qname == b"stream:stream"
}

fn is_incomplete(err: &quick_xml::Error) -> bool {
    matches!(
        err,
        quick_xml::Error::Syntax(
            SyntaxError::UnclosedTag
                | SyntaxError::UnclosedComment
                | SyntaxError::UnclosedCData
                | SyntaxError::UnclosedDoctype
                | SyntaxError::UnclosedPIOrXmlDecl
        )
    )
}

/// Locate the next token boundary without materializing anything
fn scan(buffer: &[u8]) -> Result<Option<Boundary>, WireError> {
    let lead = buffer
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(buffer.len());
    if buffer[lead..].starts_with(STREAM_CLOSE) {
        return Ok(Some(Boundary::Close {
            end: lead + STREAM_CLOSE.len(),
        }));
    }

    let mut reader = Reader::from_reader(buffer);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;

    let mut depth: usize = 0;
    let mut stanza_start: usize = 0;
    // Offset up to which everything seen is ignorable (whitespace, declarations)
    let mut idle_end: usize = 0;

    loop {
        let pos = reader.buffer_position() as usize;
        let event = match reader.read_event() {
            Ok(event) => event,
            Err(err) if is_incomplete(&err) => {
                return Ok((idle_end > 0).then_some(Boundary::Skip { end: idle_end }));
            }
            Err(err) => return Err(err.into()),
        };
        let end = reader.buffer_position() as usize;

        match event {
            Event::Start(e) => {
                if depth == 0 && is_stream_tag(e.name().as_ref()) {
                    return Ok(Some(Boundary::Open { start: pos, end }));
                }
                if depth == 0 {
                    stanza_start = pos;
                }
                depth += 1;
            }
            Event::Empty(e) => {
                if depth == 0 {
                    if is_stream_tag(e.name().as_ref()) {
                        return Ok(Some(Boundary::Open { start: pos, end }));
                    }
                    return Ok(Some(Boundary::Stanza { start: pos, end }));
                }
            }
            Event::End(e) => {
                if depth == 0 {
                    if is_stream_tag(e.name().as_ref()) {
                        return Ok(Some(Boundary::Close { end }));
                    }
                    return Err(WireError::Unbalanced(
                        String::from_utf8_lossy(e.name().as_ref()).into_owned(),
                    ));
                }
                depth -= 1;
                if depth == 0 {
                    return Ok(Some(Boundary::Stanza {
                        start: stanza_start,
                        end,
                    }));
                }
            }
            Event::Eof => {
                return Ok((depth == 0 && end > 0).then_some(Boundary::Skip { end }));
            }
            _ => {
                if depth == 0 {
                    idle_end = end;
                }
            }
        }
    }
}

fn parse_stream_header(bytes: &[u8]) -> Result<Element, WireError> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().check_end_names = false;
    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) => {
                let mut scopes = vec![Vec::new()];
                return open_element(&e, &mut scopes);
            }
            Event::Eof => return Err(WireError::Malformed("missing stream header")),
            _ => {}
        }
    }
}

fn parse_fragment(bytes: &[u8], stream_scope: &Scope) -> Result<Element, WireError> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(false);

    let mut scopes: Vec<Scope> = vec![stream_scope.clone()];
    let mut stack: Vec<Element> = Vec::new();

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let element = open_element(&e, &mut scopes)?;
                stack.push(element);
            }
            Event::Empty(e) => {
                let element = open_element(&e, &mut scopes)?;
                scopes.pop();
                match stack.last_mut() {
                    Some(parent) => parent.push_child(element),
                    None => return Ok(element),
                }
            }
            Event::End(_) => {
                scopes.pop();
                let element = stack.pop().ok_or(WireError::Malformed("unexpected end tag"))?;
                match stack.last_mut() {
                    Some(parent) => parent.push_child(element),
                    None => return Ok(element),
                }
            }
            Event::Text(t) => {
                if let Some(parent) = stack.last_mut() {
                    let text = t.unescape()?;
                    if !text.is_empty() {
                        parent.push_node(Node::Text(text.into_owned()));
                    }
                }
            }
            Event::CData(c) => {
                if let Some(parent) = stack.last_mut() {
                    let raw = c.into_inner();
                    let text = std::str::from_utf8(&raw)?;
                    parent.push_node(Node::Text(text.to_string()));
                }
            }
            Event::Eof => return Err(WireError::Malformed("truncated element")),
            _ => {}
        }
    }
}

/// Build an element from a start tag and push its namespace declarations
fn open_element(start: &BytesStart<'_>, scopes: &mut Vec<Scope>) -> Result<Element, WireError> {
    let qname = std::str::from_utf8(start.name().into_inner())?.to_string();
    let (prefix, local) = match qname.split_once(':') {
        Some((p, l)) => (Some(p.to_string()), l.to_string()),
        None => (None, qname.clone()),
    };

    let mut attrs = Vec::new();
    let mut declared: Scope = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        let key = std::str::from_utf8(attr.key.as_ref())?.to_string();
        let value: Cow<'_, str> = attr.unescape_value()?;
        if key == "xmlns" {
            declared.push((None, value.to_string()));
        } else if let Some(bound) = key.strip_prefix("xmlns:") {
            declared.push((Some(bound.to_string()), value.to_string()));
        }
        attrs.push((key, value.into_owned()));
    }
    scopes.push(declared);

    let ns = resolve(scopes, prefix.as_deref());
    Ok(Element::from_parts(prefix, local, ns, attrs))
}

fn resolve(scopes: &[Scope], prefix: Option<&str>) -> Option<String> {
    scopes.iter().rev().find_map(|scope| {
        scope
            .iter()
            .find(|(bound, _)| bound.as_deref() == prefix)
            .map(|(_, uri)| uri.clone())
    })
}

fn declarations(header: &Element) -> Scope {
    header
        .attrs()
        .filter_map(|(key, value)| {
            if key == "xmlns" {
                Some((None, value.to_string()))
            } else {
                key.strip_prefix("xmlns:")
                    .map(|bound| (Some(bound.to_string()), value.to_string()))
            }
        })
        .collect()
}
