//! Stream-level vocabulary: namespaces, version negotiation, stream headers,
//! stream errors and stanza error replies.

use std::fmt;

use crate::element::{escape, Element};

/// Namespace URIs used on client and backend streams
pub mod ns {
    /// Stream framing namespace bound to the `stream` prefix
    pub const STREAMS: &str = "http://etherx.jabber.org/streams";
    /// Default namespace of client streams
    pub const CLIENT: &str = "jabber:client";
    /// Default namespace of backend streams
    pub const CONNECTION_MANAGER: &str = "jabber:connectionmanager";
    /// Session management payloads exchanged with the backend
    pub const CM_SESSION: &str = "http://jabber.org/protocol/connectionmanager";
    /// STARTTLS negotiation
    pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    /// SASL negotiation
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    /// Stream compression negotiation
    pub const COMPRESS_PROTOCOL: &str = "http://jabber.org/protocol/compress";
    /// Stream compression feature advertisement
    pub const COMPRESS_FEATURE: &str = "http://jabber.org/features/compress";
    /// Non-SASL authentication feature
    pub const IQ_AUTH: &str = "http://jabber.org/features/iq-auth";
    /// In-band registration feature
    pub const IQ_REGISTER: &str = "http://jabber.org/features/iq-register";
    /// Resource binding feature
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    /// Session establishment feature
    pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
    /// Stream error conditions
    pub const STREAM_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
    /// Stanza error conditions
    pub const STANZA_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    /// HTTP binding body wrapper
    pub const HTTPBIND: &str = "http://jabber.org/protocol/httpbind";
    /// XMPP-over-BOSH attributes
    pub const XBOSH: &str = "urn:xmpp:xbosh";
}

/// Closing tag of a stream
pub const STREAM_CLOSE: &str = "</stream:stream>";

/// XML declaration written before every stream header
pub const XML_DECLARATION: &str = "<?xml version='1.0' encoding='UTF-8'?>";

/// XMPP stream version `major.minor`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct XmppVersion {
    /// Major version
    pub major: u32,
    /// Minor version
    pub minor: u32,
}

impl XmppVersion {
    /// Highest version this manager speaks
    pub const MAX: XmppVersion = XmppVersion { major: 1, minor: 0 };

    /// Create a version
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Parse a `version` attribute; anything missing or malformed is 0.0
    pub fn parse(value: Option<&str>) -> Self {
        let Some(value) = value else {
            return Self::default();
        };
        let mut parts = value.trim().splitn(2, '.');
        let major = parts.next().and_then(|p| p.parse().ok());
        let minor = parts.next().and_then(|p| p.parse().ok());
        match (major, minor) {
            (Some(major), Some(minor)) => Self { major, minor },
            (Some(major), None) => Self { major, minor: 0 },
            _ => Self::default(),
        }
    }

    /// Negotiate a client-requested version against `server_max`.
    ///
    /// A higher major is clamped to `server_max` entirely; an equal major with
    /// a higher minor clamps only the minor; anything else is used verbatim.
    pub fn negotiate(requested: XmppVersion, server_max: XmppVersion) -> XmppVersion {
        if requested.major > server_max.major {
            server_max
        } else if requested.major == server_max.major && requested.minor > server_max.minor {
            XmppVersion::new(requested.major, server_max.minor)
        } else {
            requested
        }
    }
}

impl fmt::Display for XmppVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Stream error conditions emitted by the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorCondition {
    /// Stream tag prefix or namespace not accepted
    BadNamespacePrefix,
    /// Element arrived where the stream state does not allow it
    BadFormat,
    /// Connection idle for too long
    ConnectionTimeout,
    /// `to` does not name a served domain
    HostUnknown,
    /// Internal failure
    InternalServerError,
    /// Action requires a secured or authenticated stream
    NotAuthorized,
    /// Server is shutting down
    SystemShutdown,
    /// Input could not be parsed
    NotWellFormed,
}

impl StreamErrorCondition {
    /// Condition element name
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamErrorCondition::BadNamespacePrefix => "bad-namespace-prefix",
            StreamErrorCondition::BadFormat => "bad-format",
            StreamErrorCondition::ConnectionTimeout => "connection-timeout",
            StreamErrorCondition::HostUnknown => "host-unknown",
            StreamErrorCondition::InternalServerError => "internal-server-error",
            StreamErrorCondition::NotAuthorized => "not-authorized",
            StreamErrorCondition::SystemShutdown => "system-shutdown",
            StreamErrorCondition::NotWellFormed => "not-well-formed",
        }
    }

    /// `<stream:error>` element carrying this condition
    pub fn to_element(&self) -> Element {
        Element::new("stream:error").child(Element::with_ns(self.as_str(), ns::STREAM_ERRORS))
    }
}

impl fmt::Display for StreamErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Header sent to a client when its stream opens or restarts
pub fn client_stream_header(
    server_name: &str,
    stream_id: &str,
    language: &str,
    version: XmppVersion,
) -> String {
    let mut header = String::with_capacity(256);
    header.push_str(XML_DECLARATION);
    header.push_str("<stream:stream xmlns:stream=\"");
    header.push_str(ns::STREAMS);
    header.push_str("\" xmlns=\"");
    header.push_str(ns::CLIENT);
    header.push_str("\" from=\"");
    header.push_str(&escape(server_name));
    header.push_str("\" id=\"");
    header.push_str(&escape(stream_id));
    header.push_str("\" xml:lang=\"");
    header.push_str(&escape(language));
    header.push('"');
    if version.major > 0 {
        header.push_str(" version=\"");
        header.push_str(&version.to_string());
        header.push('"');
    }
    header.push('>');
    header
}

/// Header a worker sends to open its stream with the backend
pub fn component_stream_header(to: &str) -> String {
    format!(
        "{}<stream:stream xmlns:stream=\"{}\" xmlns=\"{}\" to=\"{}\" version=\"{}\">",
        XML_DECLARATION,
        ns::STREAMS,
        ns::CONNECTION_MANAGER,
        escape(to),
        XmppVersion::MAX
    )
}

/// True if an element is the expected `stream:stream` opening tag
pub fn is_stream_header(header: &Element) -> bool {
    header.prefix() == Some("stream") && header.is("stream", ns::STREAMS)
}

/// Build a stanza error reply: a copy of `stanza` with `type=error`,
/// swapped addressing and an `<error>` child carrying `condition`.
pub fn stanza_error_reply(stanza: &Element, error_type: &str, condition: &str) -> Element {
    let mut reply = stanza.clone();
    let from = reply.remove_attr("from");
    let to = reply.remove_attr("to");
    if let Some(from) = from {
        reply.set_attr("to", from);
    }
    if let Some(to) = to {
        reply.set_attr("from", to);
    }
    reply.set_attr("type", "error");
    reply.push_child(
        Element::new("error")
            .attr("type", error_type)
            .child(Element::with_ns(condition, ns::STANZA_ERRORS)),
    );
    reply
}
