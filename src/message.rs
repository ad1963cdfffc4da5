// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Request and response models

use std::fmt::{self, Display};
use std::io::{self, Write};

use crate::buffer::ContentInputStream;

/// Representation of the HTTP request method
/// [IETF RFC 9110 Section 9](https://www.rfc-editor.org/rfc/rfc9110#section-9)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// RFC 9110 9.3.1
    Get,
    /// RFC 9110 9.3.2
    Head,
    /// RFC 9110 9.3.3
    Post,
    /// RFC 9110 9.3.4
    Put,
    /// RFC 9110 9.3.5
    Delete,
    /// RFC 9110 9.3.6
    Connect,
    /// RFC 9110 9.3.7
    Options,
    /// RFC 9110 9.3.8
    Trace,
}

impl Method {
    /// Wire form of the method.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Connect => "CONNECT",
            Self::Options => "OPTIONS",
            Self::Trace => "TRACE",
        }
    }
}

impl Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Representation of the HTTP version of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    /// HTTP/1.0
    H1_0,
    /// HTTP/1.1
    H1_1,
}

impl Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::H1_0 => "HTTP/1.0",
            Self::H1_1 => "HTTP/1.1",
        })
    }
}

/// A single message header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Header name.
    pub name: String,
    /// Header value.
    pub value: String,
}

impl Header {
    /// Creates a header from name and value.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Ordered header collection with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<Header>);

impl Headers {
    /// Creates an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a header, keeping any existing headers of the same name.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push(Header::new(name, value));
    }

    /// Replaces all headers of `name` with a single value.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.0.retain(|h| !h.name.eq_ignore_ascii_case(name));
        self.0.push(Header::new(name, value));
    }

    /// First value stored under `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// Whether a header of `name` is present.
    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Iterates headers in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.0.iter()
    }
}

/// Framing of a request body on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    /// Body of a known length, sent with `Content-Length`.
    Length(u64),
    /// Body of unknown length, sent with `Transfer-Encoding: chunked`.
    Chunked,
}

/// Produces a request body by writing it into a blocking byte sink.
///
/// The sink is a shared output buffer drained concurrently by the I/O
/// thread; writes block while the buffer is full.
pub trait BodyProducer: Send {
    /// Writes the entire body into `sink`.
    fn produce(&mut self, sink: &mut dyn Write) -> io::Result<()>;
}

struct BytesProducer(Vec<u8>);

impl BodyProducer for BytesProducer {
    fn produce(&mut self, sink: &mut dyn Write) -> io::Result<()> {
        sink.write_all(&self.0)
    }
}

impl<F> BodyProducer for F
where
    F: FnMut(&mut dyn Write) -> io::Result<()> + Send,
{
    fn produce(&mut self, sink: &mut dyn Write) -> io::Result<()> {
        (self)(sink)
    }
}

/// A request body: its wire framing plus the producer that writes it.
pub struct RequestBody {
    kind: BodyKind,
    producer: Box<dyn BodyProducer>,
}

impl RequestBody {
    /// Body backed by an in-memory byte vector, framed by length.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let kind = BodyKind::Length(bytes.len() as u64);
        Self {
            kind,
            producer: Box::new(BytesProducer(bytes)),
        }
    }

    /// Body written by an arbitrary producer with the given framing.
    pub fn streaming(kind: BodyKind, producer: impl BodyProducer + 'static) -> Self {
        Self {
            kind,
            producer: Box::new(producer),
        }
    }

    /// Wire framing of this body.
    #[inline]
    pub fn kind(&self) -> BodyKind {
        self.kind
    }

    pub(crate) fn into_producer(self) -> Box<dyn BodyProducer> {
        self.producer
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestBody").field("kind", &self.kind).finish()
    }
}

/// Request line and headers of an outgoing request.
#[derive(Debug, Clone)]
pub struct RequestHead {
    /// Request method.
    pub method: Method,
    /// Request target, in origin form.
    pub target: String,
    /// Protocol version.
    pub version: Version,
    /// Request headers.
    pub headers: Headers,
}

/// An outgoing HTTP request.
#[derive(Debug)]
pub struct HttpRequest {
    /// Request line and headers.
    pub head: RequestHead,
    /// Request body, if the request encloses one.
    pub body: Option<RequestBody>,
}

impl HttpRequest {
    /// Creates a bodyless HTTP/1.1 request.
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            head: RequestHead {
                method,
                target: target.into(),
                version: Version::H1_1,
                headers: Headers::new(),
            },
            body: None,
        }
    }

    /// Adds a header and returns the request for chaining.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.head.headers.add(name, value);
        self
    }

    /// Attaches a body and returns the request for chaining.
    pub fn body(mut self, body: RequestBody) -> Self {
        self.body = Some(body);
        self
    }

    /// Whether the request encloses a body and asks the server for a
    /// `100 Continue` before it is sent.
    pub fn expects_continue(&self) -> bool {
        self.body.is_some()
            && self
                .head
                .headers
                .get("Expect")
                .map(|v| v.eq_ignore_ascii_case("100-continue"))
                .unwrap_or(false)
    }

    /// Wire framing of the enclosed body, if any.
    #[inline]
    pub fn body_kind(&self) -> Option<BodyKind> {
        self.body.as_ref().map(|b| b.kind())
    }
}

/// Status line and headers of a received response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    /// Protocol version.
    pub version: Version,
    /// Status code.
    pub status: u16,
    /// Reason phrase, possibly empty.
    pub reason: String,
    /// Response headers.
    pub headers: Headers,
}

impl ResponseHead {
    /// `Content-Length` header parsed as a byte count.
    pub fn content_length(&self) -> Option<u64> {
        self.headers.get("Content-Length")?.trim().parse().ok()
    }

    /// Whether the message body uses chunked transfer coding.
    pub fn is_chunked(&self) -> bool {
        self.headers
            .get("Transfer-Encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }
}

/// Body of a received response: a blocking stream over the shared input
/// buffer the I/O thread fills as bytes are decoded off the wire.
pub struct ResponseBody {
    length: Option<u64>,
    stream: ContentInputStream,
}

impl ResponseBody {
    pub(crate) fn new(length: Option<u64>, stream: ContentInputStream) -> Self {
        Self { length, stream }
    }

    /// Declared content length, if the response carried one.
    #[inline]
    pub fn length(&self) -> Option<u64> {
        self.length
    }
}

impl io::Read for ResponseBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseBody")
            .field("length", &self.length)
            .finish()
    }
}

/// A received HTTP response.
#[derive(Debug)]
pub struct HttpResponse {
    /// Status line and headers.
    pub head: ResponseHead,
    /// Response body, absent when the exchange cannot carry one.
    pub body: Option<ResponseBody>,
}

impl HttpResponse {
    /// Status code of the response.
    #[inline]
    pub fn status(&self) -> u16 {
        self.head.status
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn headers_lookup_is_case_insensitive() {
        let mut headers = Headers::new();
        headers.add("Content-Length", "5");
        assert_eq!(Some("5"), headers.get("content-length"));
        assert!(headers.contains("CONTENT-LENGTH"));
    }

    #[test]
    fn headers_set_replaces_all_values_of_name() {
        let mut headers = Headers::new();
        headers.add("Accept", "text/html");
        headers.add("accept", "text/plain");
        headers.set("Accept", "*/*");
        assert_eq!(1, headers.iter().count());
        assert_eq!(Some("*/*"), headers.get("accept"));
    }

    #[test]
    fn request_without_expect_header_does_not_expect_continue() {
        let req = HttpRequest::new(Method::Post, "/x").body(RequestBody::from_bytes(vec![1]));
        assert!(!req.expects_continue());
    }

    #[test]
    fn request_with_expect_header_and_body_expects_continue() {
        let req = HttpRequest::new(Method::Post, "/x")
            .header("Expect", "100-continue")
            .body(RequestBody::from_bytes(vec![1]));
        assert!(req.expects_continue());
    }

    #[test]
    fn bodyless_request_never_expects_continue() {
        let req = HttpRequest::new(Method::Get, "/").header("Expect", "100-continue");
        assert!(!req.expects_continue());
    }

    #[test]
    fn response_head_parses_content_length() {
        let mut headers = Headers::new();
        headers.add("Content-Length", " 42 ");
        let head = ResponseHead {
            version: Version::H1_1,
            status: 200,
            reason: "OK".into(),
            headers,
        };
        assert_eq!(Some(42), head.content_length());
        assert!(!head.is_chunked());
    }

    #[test]
    fn response_head_detects_chunked_coding() {
        let mut headers = Headers::new();
        headers.add("Transfer-Encoding", "Chunked");
        let head = ResponseHead {
            version: Version::H1_1,
            status: 200,
            reason: String::new(),
            headers,
        };
        assert!(head.is_chunked());
    }
}
