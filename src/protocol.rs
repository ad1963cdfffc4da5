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

//! Protocol collaborator ports and their default implementations

use std::any::Any;
use std::io;

use tracing::{error, info};

use crate::conn::ClientConnection;
use crate::context::{ExchangeContext, TargetHost, HTTP_REQUEST, HTTP_TARGET_HOST};
use crate::error::ProtocolError;
use crate::message::{BodyKind, HttpRequest, HttpResponse, Method, RequestHead, Version};

/// Interceptor invoked once on each outgoing request before submission
/// and once on each incoming response before handler dispatch.
pub trait HttpProcessor: Send + Sync {
    /// Processes an outgoing request in place.
    fn process_request(
        &self,
        request: &mut HttpRequest,
        ctx: &ExchangeContext,
    ) -> Result<(), ProtocolError>;

    /// Processes an incoming response in place.
    fn process_response(
        &self,
        response: &mut HttpResponse,
        ctx: &ExchangeContext,
    ) -> Result<(), ProtocolError>;
}

/// Source of requests and sink of responses for a connection.
///
/// `submit_request` runs on the I/O thread and must not block;
/// `handle_response` runs on a worker and may read the response body with
/// ordinary blocking semantics.
pub trait RequestExecutionHandler: Send + Sync {
    /// Populates the freshly created context of a new connection.
    fn initialize_context(&self, ctx: &ExchangeContext, attachment: Option<Box<dyn Any + Send>>);

    /// Returns the next request to execute, or `None` when there is
    /// nothing to send yet. When requests become available later, wake
    /// the connection with `request_output`.
    fn submit_request(&self, ctx: &ExchangeContext) -> Option<HttpRequest>;

    /// Consumes a response. The body, when present, streams from the
    /// shared input buffer while the I/O thread keeps filling it.
    fn handle_response(&self, response: HttpResponse, ctx: &ExchangeContext);
}

/// Policy deciding whether a connection stays open after an exchange.
pub trait ReuseStrategy: Send + Sync {
    /// Whether the connection may carry another exchange after `response`.
    fn keep_alive(&self, response: &HttpResponse, ctx: &ExchangeContext) -> bool;
}

/// Default HTTP/1.x reuse policy.
///
/// `Connection: close` forbids reuse; HTTP/1.0 requires an explicit
/// `keep-alive`; a response body delimited only by end of stream forces a
/// close because the connection cannot be re-synchronized after it.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultReuseStrategy;

impl DefaultReuseStrategy {
    fn response_delimited(&self, response: &HttpResponse, ctx: &ExchangeContext) -> bool {
        let head = &response.head;
        if head.status < 200 || head.status == 204 || head.status == 304 {
            return true;
        }
        if let Some(request) = ctx.get::<RequestHead>(HTTP_REQUEST) {
            if request.method == Method::Head {
                return true;
            }
        }
        head.is_chunked() || head.content_length().is_some()
    }
}

impl ReuseStrategy for DefaultReuseStrategy {
    fn keep_alive(&self, response: &HttpResponse, ctx: &ExchangeContext) -> bool {
        if let Some(connection) = response.head.headers.get("Connection") {
            if connection
                .split(',')
                .any(|t| t.trim().eq_ignore_ascii_case("close"))
            {
                return false;
            }
            if connection
                .split(',')
                .any(|t| t.trim().eq_ignore_ascii_case("keep-alive"))
            {
                return self.response_delimited(response, ctx);
            }
        }
        match response.head.version {
            Version::H1_0 => false,
            Version::H1_1 => self.response_delimited(response, ctx),
        }
    }
}

/// Default request/response interceptor.
///
/// Fills in `Host` from the context's target host and the body framing
/// headers (`Content-Length` or `Transfer-Encoding: chunked`) when the
/// caller did not set them. Responses pass through untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultProcessor;

impl HttpProcessor for DefaultProcessor {
    fn process_request(
        &self,
        request: &mut HttpRequest,
        ctx: &ExchangeContext,
    ) -> Result<(), ProtocolError> {
        if !request.head.headers.contains("Host") {
            let target = ctx
                .get::<TargetHost>(HTTP_TARGET_HOST)
                .ok_or(ProtocolError::Violation("target host unknown"))?;
            request.head.headers.set("Host", target.to_string());
        }
        match request.body_kind() {
            Some(BodyKind::Length(len)) => {
                if !request.head.headers.contains("Content-Length") {
                    request.head.headers.set("Content-Length", len.to_string());
                }
            }
            Some(BodyKind::Chunked) => {
                if !request.head.headers.contains("Transfer-Encoding") {
                    request.head.headers.set("Transfer-Encoding", "chunked");
                }
            }
            None => {}
        }
        Ok(())
    }

    fn process_response(
        &self,
        _response: &mut HttpResponse,
        _ctx: &ExchangeContext,
    ) -> Result<(), ProtocolError> {
        Ok(())
    }
}

/// Observer of connection lifecycle and fatal errors. All methods default
/// to no-ops so implementations override only what they watch.
pub trait EventListener: Send + Sync {
    /// A connection finished its transport handshake and is usable.
    fn connection_open(&self, _conn: &dyn ClientConnection) {}

    /// A connection closed.
    fn connection_closed(&self, _conn: &dyn ClientConnection) {}

    /// A connection timed out and is being closed.
    fn connection_timeout(&self, _conn: &dyn ClientConnection) {}

    /// An I/O failure tore the connection down.
    fn fatal_io_error(&self, _err: &io::Error, _conn: &dyn ClientConnection) {}

    /// A protocol violation caused the connection to close.
    fn fatal_protocol_error(&self, _err: &ProtocolError, _conn: &dyn ClientConnection) {}
}

/// Listener that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventListener;

impl EventListener for NullEventListener {}

/// Listener reporting lifecycle events and failures through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingEventListener;

impl EventListener for LoggingEventListener {
    fn connection_open(&self, conn: &dyn ClientConnection) {
        info!(remote = ?conn.remote_addr(), "connection open");
    }

    fn connection_closed(&self, conn: &dyn ClientConnection) {
        info!(remote = ?conn.remote_addr(), "connection closed");
    }

    fn connection_timeout(&self, conn: &dyn ClientConnection) {
        info!(remote = ?conn.remote_addr(), "connection timed out");
    }

    fn fatal_io_error(&self, err: &io::Error, conn: &dyn ClientConnection) {
        error!(remote = ?conn.remote_addr(), %err, "fatal I/O error");
    }

    fn fatal_protocol_error(&self, err: &ProtocolError, conn: &dyn ClientConnection) {
        error!(remote = ?conn.remote_addr(), %err, "fatal protocol error");
    }
}
