//! Minimal XMPP wire handling for the CCS dialect.
//!
//! CCS speaks a narrow slice of RFC 6120: one stream header each way, a
//! handful of handshake stanzas, then `<message>` stanzas whose only
//! interesting content is the JSON inside a `gcm` element. Keepalives are
//! a single whitespace byte between stanzas. [`StanzaStream`] turns the
//! raw TLS byte stream into complete [`WireItem`]s; the free functions
//! build the outbound side of the handshake.

use crate::Error;
use bytes::{Buf, BytesMut};
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};

pub const CCS_DOMAIN: &str = "gcm.googleapis.com";
pub const GCM_NAMESPACE: &str = "google:mobile:data";
pub const STREAM_END: &str = "</stream:stream>";

/// One complete item read off the wire.
#[derive(Debug)]
pub enum WireItem {
    /// Single whitespace byte between stanzas.
    Heartbeat,
    /// The server's opening `<stream:stream ...>` header (never closed
    /// until the stream ends, so it is consumed as a lone tag).
    StreamHeader,
    /// `</stream:stream>` - orderly end of stream.
    StreamEnd,
    /// A complete top-level stanza.
    Stanza(Element),
}

/// A parsed XML element. Namespace prefixes are kept in `name`; matching
/// is done on local names, which is as much namespace handling as the
/// CCS dialect needs.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Element>,
    pub text: String,
}

impl Element {
    pub fn local_name(&self) -> &str {
        self.name.rsplit(':').next().unwrap_or(&self.name)
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn child(&self, local: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.local_name() == local)
    }

    pub fn children_named<'a>(&'a self, local: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter(move |c| c.local_name() == local)
    }
}

pub fn escape_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];
        let known = [
            ("&amp;", '&'),
            ("&lt;", '<'),
            ("&gt;", '>'),
            ("&quot;", '"'),
            ("&apos;", '\''),
        ]
        .iter()
        .find(|(entity, _)| rest.starts_with(entity));
        match known {
            Some((entity, ch)) => {
                out.push(*ch);
                rest = &rest[entity.len()..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// The opening stream header. Sent once after TLS and again after SASL
/// success (stream restart, RFC 6120 section 4.3.3).
pub fn stream_header() -> String {
    format!(
        "<stream:stream to=\"{CCS_DOMAIN}\" version=\"1.0\" \
         xmlns=\"jabber:client\" \
         xmlns:stream=\"http://etherx.jabber.org/streams\">"
    )
}

/// SASL PLAIN: base64 of `\0<server_id>@<domain>\0<server_key>`.
pub fn auth_stanza(server_id: &str, server_key: &str) -> String {
    use base64::Engine;

    let authzid = format!("{server_id}@{CCS_DOMAIN}");
    let mut plain = Vec::with_capacity(authzid.len() + server_key.len() + 2);
    plain.push(0);
    plain.extend_from_slice(authzid.as_bytes());
    plain.push(0);
    plain.extend_from_slice(server_key.as_bytes());
    let encoded = base64::engine::general_purpose::STANDARD.encode(plain);

    format!(
        "<auth mechanism=\"PLAIN\" \
         xmlns=\"urn:ietf:params:xml:ns:xmpp-sasl\">{encoded}</auth>"
    )
}

pub fn bind_stanza() -> &'static str {
    "<iq type=\"set\"><bind xmlns=\"urn:ietf:params:xml:ns:xmpp-bind\"/></iq>"
}

/// Wrap an FCM JSON document for sending.
pub fn message_stanza(payload: &serde_json::Value) -> String {
    let json = escape_text(&payload.to_string());
    format!("<message id=\"\"><gcm xmlns=\"{GCM_NAMESPACE}\">{json}</gcm></message>")
}

/// Index of the `>` closing the tag that starts at `from`, honouring
/// quoted attribute values. `None` means the tag is not complete yet.
fn find_tag_end(buf: &[u8], from: usize) -> Option<usize> {
    let mut quote: Option<u8> = None;
    for (i, &b) in buf.iter().enumerate().skip(from + 1) {
        match quote {
            Some(q) => {
                if b == q {
                    quote = None;
                }
            }
            None => match b {
                b'"' | b'\'' => quote = Some(b),
                b'>' => return Some(i),
                _ => {}
            },
        }
    }
    None
}

fn tag_name(tag: &[u8]) -> &[u8] {
    let inner = tag
        .strip_prefix(b"</")
        .or_else(|| tag.strip_prefix(b"<"))
        .unwrap_or(tag);
    let end = inner
        .iter()
        .position(|&b| b.is_ascii_whitespace() || b == b'>' || b == b'/')
        .unwrap_or(inner.len());
    &inner[..end]
}

/// Byte length of the complete top-level element starting at `buf[0]`,
/// or `None` if more data is needed.
fn find_stanza_end(buf: &[u8]) -> Result<Option<usize>, Error> {
    let mut pos = 0;
    let mut depth: i32 = 0;
    loop {
        let lt = match buf[pos..].iter().position(|&b| b == b'<') {
            Some(off) => pos + off,
            None => return Ok(None),
        };
        if buf[lt..].starts_with(b"<!--") {
            match buf[lt..]
                .windows(3)
                .position(|w| w == b"-->")
            {
                Some(off) => {
                    pos = lt + off + 3;
                    continue;
                }
                None => return Ok(None),
            }
        }
        let gt = match find_tag_end(buf, lt) {
            Some(gt) => gt,
            None => return Ok(None),
        };
        let tag = &buf[lt..=gt];
        if tag.starts_with(b"</") {
            depth -= 1;
            if depth < 0 {
                return Err(Error::Protocol("unbalanced closing tag".into()));
            }
        } else if tag.starts_with(b"<?") || tag.starts_with(b"<!") {
            // declarations carry no depth
        } else if !tag.ends_with(b"/>") {
            depth += 1;
        }
        pos = gt + 1;
        if depth == 0 {
            return Ok(Some(pos));
        }
    }
}

/// Pull the next complete [`WireItem`] off the front of `buf`, or return
/// `Ok(None)` when more bytes are needed.
pub fn try_extract(buf: &mut BytesMut) -> Result<Option<WireItem>, Error> {
    loop {
        let Some(&first) = buf.first() else {
            return Ok(None);
        };
        if first.is_ascii_whitespace() {
            buf.advance(1);
            return Ok(Some(WireItem::Heartbeat));
        }
        if first != b'<' {
            return Err(Error::Protocol(format!(
                "unexpected byte 0x{first:02x} outside stanza"
            )));
        }
        if buf.starts_with(b"<?") {
            match buf.windows(2).position(|w| w == b"?>") {
                Some(off) => {
                    buf.advance(off + 2);
                    continue;
                }
                None => return Ok(None),
            }
        }
        let Some(tag_end) = find_tag_end(buf, 0) else {
            return Ok(None);
        };
        if buf.starts_with(b"</") {
            // the only close tag valid at the top level
            buf.advance(tag_end + 1);
            return Ok(Some(WireItem::StreamEnd));
        }
        if tag_name(&buf[..=tag_end]) == b"stream:stream" {
            buf.advance(tag_end + 1);
            return Ok(Some(WireItem::StreamHeader));
        }
        let Some(end) = find_stanza_end(buf)? else {
            return Ok(None);
        };
        let raw = buf.split_to(end);
        let text = std::str::from_utf8(&raw)
            .map_err(|_| Error::Protocol("stanza is not valid utf-8".into()))?;
        let element = parse_element(text)?;
        return Ok(Some(WireItem::Stanza(element)));
    }
}

/// Parse one complete element (as delimited by [`find_stanza_end`]).
pub fn parse_element(input: &str) -> Result<Element, Error> {
    let mut parser = ElementParser {
        bytes: input.as_bytes(),
        pos: 0,
    };
    parser.skip_whitespace();
    let element = parser.element()?;
    Ok(element)
}

struct ElementParser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ElementParser<'a> {
    fn truncated() -> Error {
        Error::Protocol("truncated stanza".into())
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while self
            .peek()
            .map(|b| b.is_ascii_whitespace())
            .unwrap_or(false)
        {
            self.pos += 1;
        }
    }

    fn take_until(&mut self, stop: impl Fn(u8) -> bool) -> &'a str {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if stop(b) {
                break;
            }
            self.pos += 1;
        }
        // slices always fall on ascii delimiters, so this cannot split a
        // utf-8 sequence
        std::str::from_utf8(&self.bytes[start..self.pos]).unwrap_or("")
    }

    fn expect(&mut self, b: u8) -> Result<(), Error> {
        if self.peek() == Some(b) {
            self.pos += 1;
            Ok(())
        } else {
            Err(Error::Protocol(format!(
                "expected '{}' at offset {}",
                b as char, self.pos
            )))
        }
    }

    fn element(&mut self) -> Result<Element, Error> {
        self.expect(b'<')?;
        let name = self
            .take_until(|b| b.is_ascii_whitespace() || b == b'>' || b == b'/')
            .to_string();
        if name.is_empty() {
            return Err(Error::Protocol("empty element name".into()));
        }

        let mut element = Element {
            name,
            attrs: Vec::new(),
            children: Vec::new(),
            text: String::new(),
        };

        // attributes
        loop {
            self.skip_whitespace();
            match self.peek().ok_or_else(Self::truncated)? {
                b'/' => {
                    self.pos += 1;
                    self.expect(b'>')?;
                    return Ok(element);
                }
                b'>' => {
                    self.pos += 1;
                    break;
                }
                _ => {
                    let key = self
                        .take_until(|b| b == b'=' || b.is_ascii_whitespace())
                        .to_string();
                    self.skip_whitespace();
                    self.expect(b'=')?;
                    self.skip_whitespace();
                    let quote = self.peek().ok_or_else(Self::truncated)?;
                    if quote != b'"' && quote != b'\'' {
                        return Err(Error::Protocol("unquoted attribute value".into()));
                    }
                    self.pos += 1;
                    let value = self.take_until(|b| b == quote);
                    let value = unescape_text(value);
                    self.expect(quote)?;
                    element.attrs.push((key, value));
                }
            }
        }

        // content
        loop {
            match self.peek().ok_or_else(Self::truncated)? {
                b'<' => {
                    if self.bytes[self.pos..].starts_with(b"</") {
                        self.pos += 2;
                        let close = self.take_until(|b| b == b'>' || b.is_ascii_whitespace());
                        if close != element.name {
                            return Err(Error::Protocol(format!(
                                "mismatched close tag </{close}> for <{}>",
                                element.name
                            )));
                        }
                        self.skip_whitespace();
                        self.expect(b'>')?;
                        return Ok(element);
                    }
                    element.children.push(self.element()?);
                }
                _ => {
                    let text = self.take_until(|b| b == b'<');
                    element.text.push_str(&unescape_text(text));
                }
            }
        }
    }
}

pin_project! {
    /// Incremental stanza reader over any async byte stream.
    pub struct StanzaStream<T> {
        #[pin]
        inner: T,
        receive_buffer: BytesMut,
    }
}

impl<T> StanzaStream<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            receive_buffer: BytesMut::with_capacity(1024),
        }
    }
}

impl<T> tokio_stream::Stream for StanzaStream<T>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    type Item = Result<WireItem, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        use std::future::Future;
        use tokio::io::AsyncReadExt;

        loop {
            match try_extract(&mut self.receive_buffer) {
                Ok(Some(item)) => return Poll::Ready(Some(Ok(item))),
                Ok(None) => {}
                Err(e) => {
                    self.receive_buffer.clear();
                    return Poll::Ready(Some(Err(e)));
                }
            }

            // insufficient data in the buffer, fill from inner
            let mut that = self.as_mut().project();
            let task = that.inner.read_buf(that.receive_buffer);
            tokio::pin!(task);
            match task.poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => {
                    self.receive_buffer.clear();
                    return Poll::Ready(Some(Err(Error::Socket(e))));
                }
                Poll::Ready(Ok(0)) => {
                    // whatever incomplete stanza we have buffered will
                    // just have to be chucked
                    self.receive_buffer.clear();
                    return Poll::Ready(None);
                }
                Poll::Ready(Ok(_)) => {}
            }
        }
    }
}

impl<T> std::ops::Deref for StanzaStream<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<T> std::ops::DerefMut for StanzaStream<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract_all(input: &str) -> Vec<WireItem> {
        let mut buf = BytesMut::from(input.as_bytes());
        let mut items = Vec::new();
        while let Some(item) = try_extract(&mut buf).expect("extract") {
            items.push(item);
        }
        items
    }

    #[test]
    fn heartbeat_is_a_single_whitespace_byte() {
        let items = extract_all(" ");
        assert!(matches!(items.as_slice(), [WireItem::Heartbeat]));
    }

    #[test]
    fn stream_header_is_consumed_as_a_lone_tag() {
        let items = extract_all(
            "<?xml version=\"1.0\"?>\
             <stream:stream id=\"abc\" from=\"gcm.googleapis.com\" \
             xmlns=\"jabber:client\">",
        );
        assert!(matches!(items.as_slice(), [WireItem::StreamHeader]));
    }

    #[test]
    fn stream_end_is_recognised() {
        let items = extract_all("</stream:stream>");
        assert!(matches!(items.as_slice(), [WireItem::StreamEnd]));
    }

    #[test]
    fn incomplete_stanza_waits_for_more_bytes() {
        let mut buf = BytesMut::from(&b"<message><gcm xmlns=\"google:mobile:data\">{"[..]);
        assert!(try_extract(&mut buf).expect("extract").is_none());
        buf.extend_from_slice(b"}</gcm></message>");
        let item = try_extract(&mut buf).expect("extract").expect("complete");
        match item {
            WireItem::Stanza(el) => {
                assert_eq!(el.local_name(), "message");
                assert_eq!(el.child("gcm").expect("gcm child").text, "{}");
            }
            other => panic!("unexpected item {other:?}"),
        }
    }

    #[test]
    fn features_with_mechanisms_parse() {
        let items = extract_all(
            "<stream:features>\
             <mechanisms xmlns=\"urn:ietf:params:xml:ns:xmpp-sasl\">\
             <mechanism>X-OAUTH2</mechanism>\
             <mechanism>PLAIN</mechanism>\
             </mechanisms>\
             </stream:features>",
        );
        let WireItem::Stanza(features) = &items[0] else {
            panic!("expected stanza");
        };
        assert_eq!(features.local_name(), "features");
        let mechanisms = features.child("mechanisms").expect("mechanisms");
        let names: Vec<&str> = mechanisms
            .children_named("mechanism")
            .map(|m| m.text.as_str())
            .collect();
        assert_eq!(names, ["X-OAUTH2", "PLAIN"]);
    }

    #[test]
    fn self_closing_stanza_completes_immediately() {
        let items = extract_all("<stream:features><bind xmlns=\"urn:ietf:params:xml:ns:xmpp-bind\"/><session xmlns=\"urn:ietf:params:xml:ns:xmpp-session\"/></stream:features>");
        let WireItem::Stanza(features) = &items[0] else {
            panic!("expected stanza");
        };
        assert!(features.child("bind").is_some());
        assert!(features.child("session").is_some());
    }

    #[test]
    fn quoted_attribute_may_contain_angle_bracket() {
        let items = extract_all("<message id=\"a>b\"><gcm xmlns=\"google:mobile:data\">{}</gcm></message>");
        let WireItem::Stanza(el) = &items[0] else {
            panic!("expected stanza");
        };
        assert_eq!(el.attr("id"), Some("a>b"));
    }

    #[test]
    fn character_data_is_unescaped() {
        let items = extract_all(
            "<message><gcm xmlns=\"google:mobile:data\">\
             {&quot;data&quot;:{&quot;k&quot;:&quot;a&amp;b&lt;c&quot;}}\
             </gcm></message>",
        );
        let WireItem::Stanza(el) = &items[0] else {
            panic!("expected stanza");
        };
        let json: serde_json::Value =
            serde_json::from_str(&el.child("gcm").expect("gcm").text).expect("json");
        assert_eq!(json["data"]["k"], "a&b<c");
    }

    #[test]
    fn namespace_prefixed_gcm_element_matches_by_local_name() {
        let items = extract_all(
            "<message><data:gcm xmlns:data=\"google:mobile:data\">\
             {\"message_type\":\"control\",\"control_type\":\"CONNECTION_DRAINING\"}\
             </data:gcm></message>",
        );
        let WireItem::Stanza(el) = &items[0] else {
            panic!("expected stanza");
        };
        let gcm = el.child("gcm").expect("prefixed gcm child");
        let json: serde_json::Value = serde_json::from_str(&gcm.text).expect("json");
        assert_eq!(json["control_type"], "CONNECTION_DRAINING");
    }

    #[test]
    fn escape_round_trips() {
        let original = "{\"a\":\"x<y>&z\"}";
        assert_eq!(unescape_text(&escape_text(original)), original);
    }

    #[test]
    fn unknown_entity_passes_through() {
        assert_eq!(unescape_text("a&nbsp;b"), "a&nbsp;b");
    }

    #[test]
    fn auth_stanza_encodes_null_separated_credentials() {
        use base64::Engine;

        let stanza = auth_stanza("sender-1", "key-1");
        let start = stanza.find('>').unwrap() + 1;
        let end = stanza.rfind('<').unwrap();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&stanza[start..end])
            .expect("valid base64");
        assert_eq!(decoded, b"\0sender-1@gcm.googleapis.com\0key-1");
    }

    #[test]
    fn message_stanza_escapes_payload() {
        let payload = serde_json::json!({"data": {"html": "<b>&</b>"}});
        let stanza = message_stanza(&payload);
        assert!(!stanza.contains("<b>"));
        // and it parses back to the same document
        let mut buf = BytesMut::from(stanza.as_bytes());
        let item = try_extract(&mut buf).expect("extract").expect("complete");
        let WireItem::Stanza(el) = item else {
            panic!("expected stanza");
        };
        let parsed: serde_json::Value =
            serde_json::from_str(&el.child("gcm").expect("gcm").text).expect("json");
        assert_eq!(parsed, payload);
    }
}
