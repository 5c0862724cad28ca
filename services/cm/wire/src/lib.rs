//! XML stream framing, element model and stream-level builders for the
//! connection manager.
//!
//! This crate provides the low-level wire layer shared by client and backend
//! streams: an owned element tree, an incremental tokenizer that turns raw
//! bytes into stream tokens, and the fixed vocabulary (namespaces, stream
//! errors, headers) both sides speak.
//!
//! ## Stream shape
//!
//! ```text
//! <stream:stream ...>      -> StreamToken::Open
//!   <message>...</message> -> StreamToken::Stanza
//!   <iq/>                  -> StreamToken::Stanza
//! </stream:stream>         -> StreamToken::Close
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod element;
pub mod error;
pub mod parser;
pub mod stream;

// Re-export main types
pub use element::{escape, Element, Node};
pub use error::WireError;
pub use parser::{parse_element, StreamParser, StreamToken, DEFAULT_MAX_STANZA_SIZE};
pub use stream::{
    client_stream_header, component_stream_header, is_stream_header, ns, stanza_error_reply,
    StreamErrorCondition, XmppVersion, STREAM_CLOSE, XML_DECLARATION,
};
