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

//! Non-blocking connection and flow-control ports

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::context::ExchangeContext;
use crate::message::{HttpRequest, HttpResponse};

/// Capability to suspend and resume readiness events on the socket a
/// shared buffer is attached to.
///
/// Held by the shared buffers; valid for the buffer's lifetime because
/// the connection outlives its buffers. All methods may be called from
/// any thread and never block.
pub trait IoControl: Send + Sync {
    /// Asks the reactor to deliver read-readiness events again.
    fn request_input(&self);

    /// Asks the reactor to stop delivering read-readiness events.
    fn suspend_input(&self);

    /// Asks the reactor to deliver write-readiness events.
    fn request_output(&self);

    /// Tells the reactor nothing is waiting to be written.
    fn suspend_output(&self);
}

/// A non-blocking client-side HTTP/1.x connection.
///
/// Implemented by the reactor; the handler core only ever talks to this
/// port, which keeps it independent of the transport underneath.
pub trait ClientConnection: IoControl {
    /// Execution context tied to this connection.
    fn context(&self) -> &ExchangeContext;

    /// Owned handle to this connection's flow-control capability.
    fn io_control(&self) -> Arc<dyn IoControl>;

    /// Submits a request for transmission: the head is serialized and,
    /// when a body is declared, an encoder matching its framing becomes
    /// current.
    fn submit_request(&self, request: &HttpRequest) -> io::Result<()>;

    /// Takes the most recently received response head, if one is pending
    /// delivery.
    fn take_response(&self) -> Option<HttpResponse>;

    /// Discards any in-progress response decoding state.
    fn reset_input(&self);

    /// Discards any in-progress request encoding state; a submitted but
    /// unsent body will not be sent.
    fn reset_output(&self);

    /// Overrides the idle socket timeout. Zero disables it.
    fn set_socket_timeout(&self, ms: u64);

    /// Currently effective idle socket timeout in milliseconds.
    fn socket_timeout(&self) -> u64;

    /// Address of the remote endpoint.
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Whether the connection is open.
    fn is_open(&self) -> bool;

    /// Closes the connection gracefully, flushing pending output first.
    fn close(&self);

    /// Closes the connection immediately, discarding pending output.
    fn shutdown(&self);
}

/// Shared reference to a connection as seen by the handler and workers.
pub type ConnRef = Arc<dyn ClientConnection>;
