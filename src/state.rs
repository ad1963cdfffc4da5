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

//! Per-connection exchange state
//!
//! One [`ConnState`] exists per live connection. It owns the two shared
//! content buffers and a monitor (mutex plus condition variable) guarding
//! the phase variables and the in-flight messages. Every mutation under
//! the monitor wakes all waiters.

use std::fmt;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::buffer::{SharedInputBuffer, SharedOutputBuffer};
use crate::conn::IoControl;
use crate::error::interrupted;
use crate::message::{BodyProducer, HttpRequest, HttpResponse};

/// Progress of the output (request) side of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputPhase {
    /// No request in flight; a new one may be submitted.
    Ready,
    /// Request head submitted to the connection.
    RequestSent,
    /// Waiting for a `100 Continue` before sending the body.
    ExpectContinue,
    /// Request body is being encoded onto the wire.
    BodyStream,
    /// Request body fully encoded.
    BodyDone,
    /// Connection torn down; no further output.
    Shutdown,
}

/// Progress of the input (response) side of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputPhase {
    /// No response expected yet.
    Ready,
    /// Final response head received.
    ResponseReceived,
    /// Response body is being decoded off the wire.
    BodyStream,
    /// Response fully received: body decoded, or no body at all.
    ResponseDone,
    /// Connection torn down; no further input.
    Shutdown,
}

pub(crate) struct StateInner {
    pub(crate) input_phase: InputPhase,
    pub(crate) output_phase: OutputPhase,
    pub(crate) request: Option<HttpRequest>,
    pub(crate) response: Option<HttpResponse>,
    pub(crate) saved_timeout: Option<u64>,
    pub(crate) reuse: bool,
}

/// State of one connection, shared between the I/O thread and workers.
pub struct ConnState {
    inbuffer: Arc<SharedInputBuffer>,
    outbuffer: Arc<SharedOutputBuffer>,
    monitor: Mutex<StateInner>,
    cond: Condvar,
}

impl ConnState {
    /// Allocates state with two content buffers of `capacity` bytes each,
    /// attached to the connection's flow-control port.
    pub fn new(capacity: usize, io: Arc<dyn IoControl>) -> Self {
        Self {
            inbuffer: Arc::new(SharedInputBuffer::new(capacity, io.clone())),
            outbuffer: Arc::new(SharedOutputBuffer::new(capacity, io)),
            monitor: Mutex::new(StateInner {
                input_phase: InputPhase::Ready,
                output_phase: OutputPhase::Ready,
                request: None,
                response: None,
                saved_timeout: None,
                reuse: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Shared input buffer carrying response content.
    pub fn inbuffer(&self) -> &Arc<SharedInputBuffer> {
        &self.inbuffer
    }

    /// Shared output buffer carrying request content.
    pub fn outbuffer(&self) -> &Arc<SharedOutputBuffer> {
        &self.outbuffer
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, StateInner> {
        self.monitor.lock().expect("connection state lock poisoned")
    }

    /// Wakes every thread waiting on this state's monitor. Must be called
    /// after each mutation made under the monitor.
    pub(crate) fn notify_all(&self) {
        self.cond.notify_all();
    }

    /// Current phases, read under the monitor.
    pub fn phases(&self) -> (InputPhase, OutputPhase) {
        let inner = self.lock();
        (inner.input_phase, inner.output_phase)
    }

    /// Restores the input side to [`InputPhase::Ready`], dropping the
    /// in-flight response and any residual buffered content.
    pub fn reset_input(&self) {
        {
            let mut inner = self.lock();
            if inner.input_phase != InputPhase::Shutdown {
                inner.input_phase = InputPhase::Ready;
            }
            inner.response = None;
            self.notify_all();
        }
        self.inbuffer.reset();
    }

    /// Restores the output side to [`OutputPhase::Ready`], dropping the
    /// in-flight request and any residual buffered content.
    pub fn reset_output(&self) {
        {
            let mut inner = self.lock();
            if inner.output_phase != OutputPhase::Shutdown {
                inner.output_phase = OutputPhase::Ready;
            }
            inner.request = None;
            inner.saved_timeout = None;
            self.notify_all();
        }
        self.outbuffer.reset();
    }

    /// Marks both sides shut down and shuts down both buffers, unblocking
    /// every producer and consumer with an interrupted-I/O failure.
    pub fn shutdown(&self) {
        {
            let mut inner = self.lock();
            inner.input_phase = InputPhase::Shutdown;
            inner.output_phase = OutputPhase::Shutdown;
            self.notify_all();
        }
        self.inbuffer.shutdown();
        self.outbuffer.shutdown();
    }

    /// Whether the state has been shut down.
    pub fn is_shutdown(&self) -> bool {
        self.lock().input_phase == InputPhase::Shutdown
    }

    /// Blocks until the response is fully received or the state shuts
    /// down; shutdown surfaces as interrupted-I/O.
    pub fn await_response_done(&self) -> io::Result<()> {
        let mut inner = self.lock();
        loop {
            match inner.input_phase {
                InputPhase::ResponseDone => return Ok(()),
                InputPhase::Shutdown => return Err(interrupted("connection shut down")),
                _ => {
                    inner = self
                        .cond
                        .wait(inner)
                        .expect("connection state lock poisoned");
                }
            }
        }
    }

    pub(crate) fn take_response(&self) -> Option<HttpResponse> {
        let mut inner = self.lock();
        let response = inner.response.take();
        self.notify_all();
        response
    }

    pub(crate) fn take_body_producer(&self) -> Option<Box<dyn BodyProducer>> {
        let mut inner = self.lock();
        let producer = inner
            .request
            .as_mut()
            .and_then(|req| req.body.take())
            .map(|body| body.into_producer());
        self.notify_all();
        producer
    }
}

impl fmt::Debug for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("ConnState")
            .field("input_phase", &inner.input_phase)
            .field("output_phase", &inner.output_phase)
            .field("reuse", &inner.reuse)
            .finish()
    }
}
