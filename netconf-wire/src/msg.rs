//! NETCONF message model: classification, hello, and envelope building.
//!
//! A whole framed document classifies by its root element into hello, rpc,
//! rpc-reply, or notification. The builders here render the protocol
//! envelopes; operation bodies are supplied by the caller.

use crate::error::WireError;
use crate::xml::XmlElement;

/// NETCONF base protocol namespace.
pub const NS_BASE: &str = "urn:ietf:params:xml:ns:netconf:base:1.0";

/// NETCONF event notification namespace.
pub const NS_NOTIF: &str = "urn:ietf:params:xml:ns:netconf:notification:1.0";

/// Classification of a whole received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    /// `<hello>` in the base namespace.
    Hello,
    /// `<rpc>` in the base namespace.
    Rpc,
    /// `<rpc-reply>` in the base namespace.
    Reply,
    /// `<notification>` in the notification namespace.
    Notification,
    /// Anything else.
    Unknown,
}

/// Classify a parsed message by its root element and namespace.
pub fn classify(root: &XmlElement) -> MsgType {
    let ns = root.namespace.as_deref().or_else(|| root.attr("xmlns"));
    match (ns, root.name.as_str()) {
        (Some(NS_BASE), "hello") => MsgType::Hello,
        (Some(NS_BASE), "rpc") => MsgType::Rpc,
        (Some(NS_BASE), "rpc-reply") => MsgType::Reply,
        (Some(NS_NOTIF), "notification") => MsgType::Notification,
        _ => MsgType::Unknown,
    }
}

/// Numeric `message-id` attribute of an rpc or rpc-reply, if present.
pub fn message_id(root: &XmlElement) -> Option<u64> {
    root.attr("message-id").and_then(|v| v.parse().ok())
}

/// Content of a received `<hello>`.
#[derive(Debug, Clone)]
pub struct HelloInfo {
    /// Advertised capability URIs.
    pub capabilities: Vec<String>,
    /// Session id, present in the server's hello only.
    pub session_id: Option<u32>,
}

/// Build a `<hello>` message. Servers pass their assigned session id.
pub fn build_hello(capabilities: &[String], session_id: Option<u32>) -> XmlElement {
    let mut caps = XmlElement::new("capabilities");
    for cap in capabilities {
        caps.children
            .push(XmlElement::new("capability").with_text(cap.clone()));
    }
    let mut hello = XmlElement::new("hello").with_ns(NS_BASE).with_child(caps);
    if let Some(id) = session_id {
        hello
            .children
            .push(XmlElement::new("session-id").with_text(id.to_string()));
    }
    hello
}

/// Parse a received `<hello>` into its capability list and session id.
pub fn parse_hello(root: &XmlElement) -> Result<HelloInfo, WireError> {
    let caps = root
        .child("capabilities")
        .ok_or(WireError::Hello("missing <capabilities>"))?;

    let mut capabilities = Vec::new();
    for cap in caps.children_named("capability") {
        if cap.text.is_empty() {
            return Err(WireError::Hello("empty <capability>"));
        }
        capabilities.push(cap.text.clone());
    }
    if capabilities.is_empty() {
        return Err(WireError::Hello("no capabilities advertised"));
    }

    let session_id = match root.child("session-id") {
        Some(el) => Some(
            el.text
                .parse::<u32>()
                .map_err(|_| WireError::Hello("invalid <session-id>"))?,
        ),
        None => None,
    };

    Ok(HelloInfo {
        capabilities,
        session_id,
    })
}

/// Build an `<rpc>` envelope around an operation body.
///
/// `message-id` is rendered first so the envelope bytes match what peers
/// conventionally emit; extra caller attributes follow the namespace.
pub fn build_rpc(message_id: u64, body: XmlElement, attrs: &[(String, String)]) -> XmlElement {
    let mut rpc = XmlElement::new("rpc")
        .with_attr("message-id", message_id.to_string())
        .with_ns(NS_BASE);
    for (k, v) in attrs {
        rpc = rpc.with_attr(k.clone(), v.clone());
    }
    rpc.with_child(body)
}

/// Build an `<rpc-reply>` envelope echoing the request's message-id.
pub fn build_reply(message_id: &str, children: Vec<XmlElement>) -> XmlElement {
    let mut reply = XmlElement::new("rpc-reply")
        .with_attr("message-id", message_id.to_string())
        .with_ns(NS_BASE);
    reply.children = children;
    reply
}

/// Build a `<notification>` wrapping an event with its time.
pub fn build_notification(event_time: &str, event: XmlElement) -> XmlElement {
    XmlElement::new("notification")
        .with_ns(NS_NOTIF)
        .with_child(XmlElement::new("eventTime").with_text(event_time))
        .with_child(event)
}

/// Classification of an `<rpc-reply>` body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// `<ok/>`.
    Ok,
    /// `<data>` payload.
    Data,
    /// One or more `<rpc-error>` elements.
    Error,
    /// Operation-specific reply content.
    Other,
}

/// Classify a reply by its first child.
pub fn reply_kind(reply: &XmlElement) -> ReplyKind {
    if reply.child("rpc-error").is_some() {
        ReplyKind::Error
    } else if reply.child("ok").is_some() {
        ReplyKind::Ok
    } else if reply.child("data").is_some() {
        ReplyKind::Data
    } else {
        ReplyKind::Other
    }
}

/// Parsed `<rpc-error>` content.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RpcError {
    /// `<error-type>`: transport, rpc, protocol, or application.
    pub error_type: String,
    /// `<error-tag>`.
    pub tag: String,
    /// `<error-severity>`.
    pub severity: String,
    /// `<error-message>`, if reported.
    pub message: Option<String>,
    /// `<error-path>`, if reported.
    pub path: Option<String>,
}

/// Extract the first `<rpc-error>` of an error reply.
pub fn parse_rpc_error(reply: &XmlElement) -> Option<RpcError> {
    let err = reply.child("rpc-error")?;
    Some(RpcError {
        error_type: err.child("error-type").map(|e| e.text.clone()).unwrap_or_default(),
        tag: err.child("error-tag").map(|e| e.text.clone()).unwrap_or_default(),
        severity: err
            .child("error-severity")
            .map(|e| e.text.clone())
            .unwrap_or_default(),
        message: err.child("error-message").map(|e| e.text.clone()),
        path: err.child("error-path").map(|e| e.text.clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_by_root_and_namespace() {
        let rpc = XmlElement::parse(&format!("<rpc xmlns=\"{NS_BASE}\"/>")).unwrap();
        assert_eq!(classify(&rpc), MsgType::Rpc);

        let reply = XmlElement::parse(&format!("<rpc-reply xmlns=\"{NS_BASE}\"/>")).unwrap();
        assert_eq!(classify(&reply), MsgType::Reply);

        let hello = XmlElement::parse(&format!("<hello xmlns=\"{NS_BASE}\"/>")).unwrap();
        assert_eq!(classify(&hello), MsgType::Hello);

        let notif =
            XmlElement::parse(&format!("<notification xmlns=\"{NS_NOTIF}\"/>")).unwrap();
        assert_eq!(classify(&notif), MsgType::Notification);

        // Wrong namespace or unknown root are both unclassified.
        let other = XmlElement::parse("<rpc xmlns=\"urn:example\"/>").unwrap();
        assert_eq!(classify(&other), MsgType::Unknown);
        let bogus = XmlElement::parse(&format!("<frob xmlns=\"{NS_BASE}\"/>")).unwrap();
        assert_eq!(classify(&bogus), MsgType::Unknown);
    }

    #[test]
    fn test_hello_roundtrip_preserves_capability_set() {
        let caps = vec![
            "urn:ietf:params:netconf:base:1.1".to_string(),
            "urn:ietf:params:netconf:capability:candidate:1.0".to_string(),
        ];
        let hello = build_hello(&caps, Some(77));
        let parsed = XmlElement::parse(&hello.to_xml()).unwrap();
        assert_eq!(classify(&parsed), MsgType::Hello);

        let info = parse_hello(&parsed).unwrap();
        assert_eq!(info.capabilities, caps);
        assert_eq!(info.session_id, Some(77));
    }

    #[test]
    fn test_hello_without_session_id() {
        let hello = build_hello(&["urn:ietf:params:netconf:base:1.0".to_string()], None);
        let info = parse_hello(&hello).unwrap();
        assert_eq!(info.session_id, None);
    }

    #[test]
    fn test_hello_rejects_empty_capabilities() {
        let hello = XmlElement::new("hello")
            .with_ns(NS_BASE)
            .with_child(XmlElement::new("capabilities"));
        assert!(parse_hello(&hello).is_err());
        assert!(parse_hello(&XmlElement::new("hello").with_ns(NS_BASE)).is_err());
    }

    #[test]
    fn test_rpc_envelope_bytes() {
        let body = XmlElement::new("lock")
            .with_child(XmlElement::new("target").with_child(XmlElement::new("running")));
        let rpc = build_rpc(1000, body, &[]);
        assert_eq!(
            rpc.to_xml(),
            "<rpc message-id=\"1000\" xmlns=\"urn:ietf:params:xml:ns:netconf:base:1.0\">\
             <lock><target><running/></target></lock></rpc>"
        );
        assert_eq!(message_id(&rpc), Some(1000));
    }

    #[test]
    fn test_reply_kind() {
        let ok = build_reply("5", vec![XmlElement::new("ok")]);
        assert_eq!(reply_kind(&ok), ReplyKind::Ok);

        let data = build_reply("5", vec![XmlElement::new("data")]);
        assert_eq!(reply_kind(&data), ReplyKind::Data);

        let err = build_reply("5", vec![XmlElement::new("rpc-error")]);
        assert_eq!(reply_kind(&err), ReplyKind::Error);
    }

    #[test]
    fn test_parse_rpc_error_fields() {
        let reply = XmlElement::parse(&format!(
            "<rpc-reply message-id=\"3\" xmlns=\"{NS_BASE}\"><rpc-error>\
             <error-type>protocol</error-type>\
             <error-tag>lock-denied</error-tag>\
             <error-severity>error</error-severity>\
             <error-message>lock held</error-message>\
             </rpc-error></rpc-reply>"
        ))
        .unwrap();
        let err = parse_rpc_error(&reply).unwrap();
        assert_eq!(err.error_type, "protocol");
        assert_eq!(err.tag, "lock-denied");
        assert_eq!(err.severity, "error");
        assert_eq!(err.message.as_deref(), Some("lock held"));
        assert_eq!(err.path, None);
    }
}
