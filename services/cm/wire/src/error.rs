//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// XML syntax error reported by the reader
    #[error("xml syntax: {0}")]
    Xml(#[from] quick_xml::Error),

    /// Invalid UTF-8 inside an element or text node
    #[error("invalid utf-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    /// Buffered input exceeded the configured limit
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// End tag without a matching start tag, or a mismatched end tag
    #[error("unbalanced end tag </{0}>")]
    Unbalanced(String),

    /// Input parsed but did not contain the expected element
    #[error("malformed element: {0}")]
    Malformed(&'static str),
}
