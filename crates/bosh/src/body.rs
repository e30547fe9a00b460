//! `<body/>` wrappers exchanged with the client.
//!
//! Stanzas are opaque serialized XML. The session layer never looks inside
//! them; it only wraps them for delivery.

use std::collections::HashMap;
use std::fmt;

use crate::stream_id::StreamId;

/// Namespace of the HTTP binding wrapper element.
pub const HTTPBIND_NS: &str = "http://jabber.org/protocol/httpbind";
/// Resource binding feature namespace.
pub const BIND_NS: &str = "urn:ietf:params:xml:ns:xmpp-bind";
/// Session establishment feature namespace.
pub const SESSION_NS: &str = "urn:ietf:params:xml:ns:xmpp-session";

/// Default `xml:lang` when the client does not send one.
pub const DEFAULT_LANGUAGE: &str = "en";

/// One opaque protocol payload unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stanza(String);

impl Stanza {
    pub fn new(xml: impl Into<String>) -> Self {
        Self(xml.into())
    }

    pub fn as_xml(&self) -> &str {
        &self.0
    }

    pub fn into_xml(self) -> String {
        self.0
    }
}

impl fmt::Display for Stanza {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Stanza {
    fn from(xml: &str) -> Self {
        Self(xml.to_string())
    }
}

impl From<String> for Stanza {
    fn from(xml: String) -> Self {
        Self(xml)
    }
}

/// An inbound `<body/>`: its attributes and the stanzas it carries.
///
/// Parsing the HTTP request into this shape is the transport's job.
#[derive(Debug, Clone, Default)]
pub struct RequestBody {
    attributes: HashMap<String, String>,
    payload: Vec<Stanza>,
}

impl RequestBody {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_stanza(mut self, stanza: impl Into<Stanza>) -> Self {
        self.payload.push(stanza.into());
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn payload(&self) -> &[Stanza] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<Stanza> {
        self.payload
    }

    /// A body without stanzas only solicits buffered data.
    pub fn is_poll(&self) -> bool {
        self.payload.is_empty()
    }

    /// `xml:lang`, falling back to English.
    pub fn language(&self) -> &str {
        match self.attribute("xml:lang") {
            Some(lang) if !lang.is_empty() => lang,
            _ => DEFAULT_LANGUAGE,
        }
    }

    /// Client request id, if present and numeric.
    pub fn rid(&self) -> Option<u64> {
        self.attribute("rid").and_then(|v| v.trim().parse().ok())
    }

    /// Numeric attribute; missing, empty, negative or garbage values yield `default`.
    ///
    /// Used for counts and durations, where a negative value has no meaning.
    /// `hold` gives negatives a meaning and has its own reader, [`Self::hold`].
    pub fn int_attribute(&self, name: &str, default: u32) -> u32 {
        self.attribute(name)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    /// Client `hold`. Zero or negative means no bound; missing, empty or
    /// garbage values yield `Some(default)`.
    pub fn hold(&self, default: u32) -> Option<u32> {
        match self.attribute("hold").and_then(|v| v.trim().parse::<i64>().ok()) {
            Some(hold) if hold <= 0 => None,
            Some(hold) => Some(u32::try_from(hold).unwrap_or(u32::MAX)),
            None => Some(default),
        }
    }
}

/// Values echoed in the session creation response.
#[derive(Debug, Clone)]
pub struct CreationResponse<'a> {
    pub stream_id: &'a StreamId,
    pub requests: u32,
    pub inactivity: u64,
    pub polling: u64,
    pub wait: u32,
    /// Feature negotiation fragment from the messaging server.
    pub features: &'a str,
}

impl CreationResponse<'_> {
    pub fn to_xml(&self) -> String {
        let sid = escape_attr(self.stream_id.as_str());
        let mut out = String::with_capacity(256 + self.features.len());

        out.push_str(&format!("<body xmlns='{}'", HTTPBIND_NS));
        out.push_str(&format!(" authid='{}' sid='{}' secure='true'", sid, sid));
        out.push_str(&format!(" requests='{}'", self.requests));
        out.push_str(&format!(" inactivity='{}'", self.inactivity));
        out.push_str(&format!(" polling='{}'", self.polling));
        out.push_str(&format!(" wait='{}'>", self.wait));
        out.push_str("<stream:features>");
        out.push_str(self.features);
        out.push_str(&format!("<bind xmlns=\"{}\"/>", BIND_NS));
        out.push_str(&format!("<session xmlns=\"{}\"/>", SESSION_NS));
        out.push_str("</stream:features>");
        out.push_str("</body>");

        out
    }
}

/// Wrap stanzas, in order, into one delivery payload.
pub fn deliverable<'a, I>(stanzas: I) -> String
where
    I: IntoIterator<Item = &'a Stanza>,
{
    let mut out = format!("<body xmlns='{}'>", HTTPBIND_NS);
    for stanza in stanzas {
        out.push_str(stanza.as_xml());
    }
    out.push_str("</body>");
    out
}

/// Payload for a held request that ends with nothing to deliver.
pub fn empty_body() -> String {
    format!("<body xmlns='{}'/>", HTTPBIND_NS)
}

/// Payload telling the client the session is over.
pub fn terminate_body(condition: Option<&str>) -> String {
    match condition {
        Some(condition) => format!(
            "<body type='terminate' condition='{}' xmlns='{}'/>",
            escape_attr(condition),
            HTTPBIND_NS
        ),
        None => format!("<body type='terminate' xmlns='{}'/>", HTTPBIND_NS),
    }
}

fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}
