//! HTTP/1.1 messages with Content-Length framing.
//!
//! Chunked transfer encoding is not modelled: a message body is exactly
//! `Content-Length` bytes, or empty when the header is absent.

use bytes::{BufMut, Bytes};

use crate::{
    codec::owned,
    errors::{ProtocolError, Result},
    value::Overridable,
};

const CRLF: &[u8] = b"\r\n";
const HEADER_END: &[u8] = b"\r\n\r\n";

/// One header field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpHeader {
    /// Field name
    pub name: Overridable<String>,
    /// Field value
    pub value: Overridable<String>,
}

impl HttpHeader {
    /// Creates a header with both parts set.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: Overridable::computed(name.into()),
            value: Overridable::computed(value.into()),
        }
    }

    /// Returns true if the resolved name matches `name` case-insensitively.
    #[must_use]
    pub fn is(&self, name: &str) -> bool {
        self.name.get().is_some_and(|n| n.eq_ignore_ascii_case(name))
    }
}

/// HTTP/1.1 request or response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpMessage {
    /// Request line or status line, without CRLF
    pub start_line: Overridable<String>,
    /// Header fields in wire order
    pub headers: Vec<HttpHeader>,
    /// Message body
    pub body: Overridable<Bytes>,
}

impl HttpMessage {
    /// Creates a request for `target` using `method`.
    pub fn request(method: &str, target: &str) -> Self {
        Self {
            start_line: Overridable::computed(format!("{method} {target} HTTP/1.1")),
            headers: Vec::new(),
            body: Overridable::computed(Bytes::new()),
        }
    }

    /// Creates a response with the given status.
    pub fn response(status: u16, reason: &str) -> Self {
        Self {
            start_line: Overridable::computed(format!("HTTP/1.1 {status} {reason}")),
            headers: Vec::new(),
            body: Overridable::computed(Bytes::new()),
        }
    }

    /// Appends a header.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push(HttpHeader::new(name, value));
        self
    }

    /// Sets the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body.set_computed(body.into());
        self
    }

    /// First header named `name`, case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&HttpHeader> {
        self.headers.iter().find(|h| h.is(name))
    }

    /// Mutable access to the first header named `name`, inserting an unset
    /// one at the end if absent.
    pub fn header_mut(&mut self, name: &str) -> &mut HttpHeader {
        let index = match self.headers.iter().position(|h| h.is(name)) {
            Some(index) => index,
            None => {
                self.headers.push(HttpHeader {
                    name: Overridable::computed(name.to_string()),
                    value: Overridable::Unset,
                });
                self.headers.len() - 1
            },
        };
        &mut self.headers[index]
    }

    /// Returns true if the start line is a status line.
    #[must_use]
    pub fn is_response(&self) -> bool {
        self.start_line.get().is_some_and(|line| line.starts_with("HTTP/"))
    }

    /// Status code parsed from a status line.
    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        let line = self.start_line.get().filter(|_| self.is_response())?;
        line.split(' ').nth(1)?.parse().ok()
    }

    /// Writes the message.
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        dst.put_slice(self.start_line.resolve("http.start_line")?.as_bytes());
        dst.put_slice(CRLF);
        for header in &self.headers {
            dst.put_slice(header.name.resolve("http.header.name")?.as_bytes());
            dst.put_slice(b": ");
            dst.put_slice(header.value.resolve("http.header.value")?.as_bytes());
            dst.put_slice(CRLF);
        }
        dst.put_slice(CRLF);
        dst.put_slice(self.body.resolve("http.body")?);
        Ok(())
    }

    /// Decodes one message from the front of `bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Incomplete`] until the header block and the
    /// announced body are buffered, and [`ProtocolError::Parse`] for
    /// non-UTF-8 header text, header lines without a colon or an invalid
    /// `Content-Length`.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        let Some(head_len) = bytes.windows(HEADER_END.len()).position(|w| w == HEADER_END) else {
            return Err(ProtocolError::Incomplete { needed: 1 });
        };
        let head = std::str::from_utf8(&bytes[..head_len]).map_err(|e| {
            ProtocolError::parse(format!("header block is not UTF-8: {e}"), e.valid_up_to())
        })?;

        let mut lines = head.split("\r\n");
        let start_line = lines.next().unwrap_or_default();
        let mut headers = Vec::new();
        let mut offset = start_line.len() + CRLF.len();
        for line in lines {
            let Some((name, value)) = line.split_once(':') else {
                let reason = format!("header line without colon: {line:?}");
                return Err(ProtocolError::parse(reason, offset));
            };
            headers.push(HttpHeader::new(name, value.trim_start()));
            offset += line.len() + CRLF.len();
        }

        let mut message = Self {
            start_line: Overridable::computed(start_line.to_string()),
            headers,
            body: Overridable::Unset,
        };

        let body_start = head_len + HEADER_END.len();
        let body_len = match message.header("content-length").and_then(|h| h.value.get()) {
            Some(value) => value.trim().parse::<usize>().map_err(|_| {
                ProtocolError::parse(format!("invalid content-length {value:?}"), head_len)
            })?,
            None => 0,
        };
        let total = body_start + body_len;
        if bytes.len() < total {
            return Err(ProtocolError::Incomplete { needed: total - bytes.len() });
        }

        message.body = Overridable::computed(owned(&bytes[body_start..total]));
        Ok((message, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_encodes_in_order() {
        let request = HttpMessage::request("GET", "/").with_header("Host", "example.test");
        let mut out = Vec::new();
        request.encode(&mut out).unwrap();
        assert_eq!(out, b"GET / HTTP/1.1\r\nHost: example.test\r\n\r\n");
    }

    #[test]
    fn response_with_body_decodes() {
        let bytes = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhelloEXTRA";
        let (message, used) = HttpMessage::decode(bytes).unwrap();
        assert_eq!(used, bytes.len() - 5);
        assert_eq!(message.status_code(), Some(200));
        assert_eq!(message.body.get().map(|b| &b[..]), Some(&b"hello"[..]));
    }

    #[test]
    fn partial_body_is_incomplete() {
        let bytes = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhe";
        assert_eq!(HttpMessage::decode(bytes), Err(ProtocolError::Incomplete { needed: 3 }));
        assert!(HttpMessage::decode(b"HTTP/1.1 200 OK\r\n").unwrap_err().is_incomplete());
    }

    #[test]
    fn malformed_header_line_is_parse_error() {
        let bytes = b"GET / HTTP/1.1\r\nno-colon-here\r\n\r\n";
        assert!(matches!(HttpMessage::decode(bytes), Err(ProtocolError::Parse { .. })));
    }

    #[test]
    fn header_mut_inserts_once() {
        let mut message = HttpMessage::request("GET", "/");
        message.header_mut("Content-Length").value.set_computed("0".into());
        message.header_mut("content-length").value.set_computed("1".into());
        assert_eq!(message.headers.len(), 1);
        assert_eq!(message.headers[0].value.get().map(String::as_str), Some("1"));
    }
}
