//! `<body/>` wrapper parsing and rendering.

use cm_wire::{ns, parse_element, Element};

use crate::error::BoshError;

/// Largest rid a client may use (2^53 - 1)
pub const MAX_RID: u64 = (1 << 53) - 1;

/// A parsed HTTP-binding request
#[derive(Debug, Clone, PartialEq)]
pub struct BoshRequest {
    /// Session id; absent on the creation request
    pub sid: Option<String>,
    /// Request id
    pub rid: u64,
    /// Requested `wait` (creation only)
    pub wait: Option<u32>,
    /// Requested `hold` (creation only)
    pub hold: Option<u32>,
    /// Highest response id the client has seen
    pub ack: Option<u64>,
    /// `xml:lang`
    pub language: Option<String>,
    /// Target domain (creation only)
    pub to: Option<String>,
    /// `type='terminate'`
    pub terminate: bool,
    /// Requested pause in seconds
    pub pause: Option<u32>,
    /// `xmpp:restart='true'`
    pub restart: bool,
    /// Stanzas to forward, in document order
    pub payload: Vec<Element>,
}

impl BoshRequest {
    /// Parse a request body
    pub fn parse(xml: &str) -> Result<Self, BoshError> {
        let body = parse_element(xml).map_err(|_| BoshError::BadRequest)?;
        if body.name() != "body" || body.ns().is_some_and(|uri| uri != ns::HTTPBIND) {
            return Err(BoshError::BadRequest);
        }

        let rid = body
            .get_attr("rid")
            .and_then(|rid| rid.trim().parse::<u64>().ok())
            .filter(|rid| *rid <= MAX_RID)
            .ok_or(BoshError::BadRequest)?;
        let number = |key: &str| body.get_attr(key).and_then(|v| v.trim().parse::<u32>().ok());

        Ok(Self {
            sid: body.get_attr("sid").map(str::to_string),
            rid,
            wait: number("wait"),
            hold: number("hold"),
            ack: body.get_attr("ack").and_then(|v| v.trim().parse().ok()),
            language: body
                .get_attr("xml:lang")
                .filter(|lang| !lang.is_empty())
                .map(str::to_string),
            to: body.get_attr("to").map(str::to_string),
            terminate: body.get_attr("type") == Some("terminate"),
            pause: number("pause"),
            restart: body.get_attr("xmpp:restart") == Some("true"),
            payload: body.into_children().collect(),
        })
    }
}

/// Response carrying `stanzas`, acknowledging `ack`
pub fn answer_body(ack: u64, stanzas: &[Element]) -> String {
    let mut body = Element::with_ns("body", ns::HTTPBIND).attr("ack", ack.to_string());
    for stanza in stanzas {
        body.push_child(stanza.clone());
    }
    body.to_xml()
}

/// Terminating response, with a condition when the session ends in error
pub fn terminate_body(error: Option<BoshError>) -> String {
    let mut body = Element::with_ns("body", ns::HTTPBIND).attr("type", "terminate");
    if let Some(error) = error {
        body.set_attr("condition", error.condition());
    }
    body.to_xml()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_creation_request() {
        let request = BoshRequest::parse(
            "<body xmlns='http://jabber.org/protocol/httpbind' rid='1573741820' wait='60' hold='1' \
             to='example.com' xml:lang='en' xmpp:version='1.0' xmlns:xmpp='urn:xmpp:xbosh'/>",
        )
        .unwrap();
        assert_eq!(request.sid, None);
        assert_eq!(request.rid, 1573741820);
        assert_eq!(request.wait, Some(60));
        assert_eq!(request.hold, Some(1));
        assert_eq!(request.to.as_deref(), Some("example.com"));
        assert!(request.payload.is_empty());
    }

    #[test]
    fn test_parse_payload_keeps_order() {
        let request = BoshRequest::parse(
            "<body xmlns='http://jabber.org/protocol/httpbind' sid='s1' rid='7'>\
               <message xmlns='jabber:client' id='a'/>\
               <presence xmlns='jabber:client'/>\
               <iq xmlns='jabber:client' type='get' id='b'/>\
             </body>",
        )
        .unwrap();
        let names: Vec<&str> = request.payload.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["message", "presence", "iq"]);
        assert_eq!(request.payload[0].ns(), Some("jabber:client"));
    }

    #[test]
    fn test_parse_rejects_missing_rid_and_wrong_root() {
        assert_eq!(
            BoshRequest::parse("<body xmlns='http://jabber.org/protocol/httpbind' sid='x'/>"),
            Err(BoshError::BadRequest)
        );
        assert_eq!(
            BoshRequest::parse("<message rid='1'/>"),
            Err(BoshError::BadRequest)
        );
        assert_eq!(BoshRequest::parse("<body"), Err(BoshError::BadRequest));
    }

    #[test]
    fn test_parse_bounds_rid() {
        let request = BoshRequest::parse(&format!(
            "<body xmlns='http://jabber.org/protocol/httpbind' sid='s' rid='{}' ack='12'/>",
            MAX_RID
        ))
        .unwrap();
        assert_eq!(request.rid, MAX_RID);
        assert_eq!(request.ack, Some(12));

        assert_eq!(
            BoshRequest::parse(&format!(
                "<body xmlns='http://jabber.org/protocol/httpbind' sid='s' rid='{}'/>",
                MAX_RID + 1
            )),
            Err(BoshError::BadRequest)
        );
        assert_eq!(
            BoshRequest::parse(
                "<body xmlns='http://jabber.org/protocol/httpbind' sid='s' rid='18446744073709551615'/>"
            ),
            Err(BoshError::BadRequest)
        );
    }

    #[test]
    fn test_terminate_flags() {
        let request = BoshRequest::parse(
            "<body xmlns='http://jabber.org/protocol/httpbind' sid='s' rid='3' type='terminate' pause='20'/>",
        )
        .unwrap();
        assert!(request.terminate);
        assert_eq!(request.pause, Some(20));
        assert!(!request.restart);
    }

    #[test]
    fn test_rendered_bodies() {
        assert_eq!(
            answer_body(4, &[]),
            r#"<body xmlns="http://jabber.org/protocol/httpbind" ack="4"/>"#
        );
        assert_eq!(
            terminate_body(Some(BoshError::PolicyViolation)),
            r#"<body xmlns="http://jabber.org/protocol/httpbind" type="terminate" condition="policy-violation"/>"#
        );
    }
}
