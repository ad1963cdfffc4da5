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

//! Single-thread I/O dispatcher
//!
//! Owns the poll instance and every live socket. Readiness events and
//! cross-thread port calls (delivered over a command channel plus waker)
//! drive the connection handler's event entry points. The reactor thread
//! never blocks on anything but the poll call itself.

use std::any::Any;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use tracing::{debug, trace, warn};

use crate::conn::{ClientConnection, ConnRef, IoControl};
use crate::context::ExchangeContext;
use crate::handler::ClientHandler;
use crate::message::{BodyKind, HttpRequest, HttpResponse, Method, RequestHead};
use crate::wire::{
    encode_request_head, parse_response_head, StagingBuf, TransferDecoder, TransferEncoder,
    WireDecoder, WireEncoder,
};

const WAKE_TOKEN: Token = Token(usize::MAX);

// staging bounds per session; content backpressure lives in the shared
// buffers, these only smooth the socket edge. The head limit must stay
// below the staging limit so an oversized head errors instead of
// stalling the fill loop.
const SESSION_BUFFER_LIMIT: usize = 16 * 1024;
const HEAD_LIMIT: usize = 8 * 1024;

const CLOSE_NONE: u8 = 0;
const CLOSE_GRACEFUL: u8 = 1;
const CLOSE_IMMEDIATE: u8 = 2;

enum Command {
    Connect {
        addr: SocketAddr,
        attachment: Option<Box<dyn Any + Send>>,
    },
    Sync(usize),
    Stop,
}

struct PendingRequest {
    head: RequestHead,
    body: Option<BodyKind>,
}

/// Shared side of one connection: the state the port methods may touch
/// from any thread. The reactor reads it when a sync command arrives.
struct ConnShared {
    token: usize,
    cmd: Sender<Command>,
    waker: Arc<Waker>,
    ctx: ExchangeContext,
    remote: SocketAddr,
    open: AtomicBool,
    timeout_ms: AtomicU64,
    want_input: AtomicBool,
    want_output: AtomicBool,
    reset_input: AtomicBool,
    reset_output: AtomicBool,
    close_request: AtomicU8,
    pending: Mutex<Option<PendingRequest>>,
    response: Mutex<Option<HttpResponse>>,
}

impl ConnShared {
    fn sync(&self) {
        let _ = self.cmd.send(Command::Sync(self.token));
        let _ = self.waker.wake();
    }
}

impl IoControl for ConnShared {
    fn request_input(&self) {
        self.want_input.store(true, Ordering::SeqCst);
        self.sync();
    }

    fn suspend_input(&self) {
        self.want_input.store(false, Ordering::SeqCst);
    }

    fn request_output(&self) {
        self.want_output.store(true, Ordering::SeqCst);
        self.sync();
    }

    fn suspend_output(&self) {
        self.want_output.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone)]
struct ConnHandle(Arc<ConnShared>);

impl IoControl for ConnHandle {
    fn request_input(&self) {
        self.0.request_input();
    }

    fn suspend_input(&self) {
        self.0.suspend_input();
    }

    fn request_output(&self) {
        self.0.request_output();
    }

    fn suspend_output(&self) {
        self.0.suspend_output();
    }
}

impl ClientConnection for ConnHandle {
    fn context(&self) -> &ExchangeContext {
        &self.0.ctx
    }

    fn io_control(&self) -> Arc<dyn IoControl> {
        self.0.clone()
    }

    fn submit_request(&self, request: &HttpRequest) -> io::Result<()> {
        if !self.is_open() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection is closed",
            ));
        }
        *self.0.pending.lock().expect("pending lock poisoned") = Some(PendingRequest {
            head: request.head.clone(),
            body: request.body_kind(),
        });
        self.0.want_output.store(true, Ordering::SeqCst);
        self.0.sync();
        Ok(())
    }

    fn take_response(&self) -> Option<HttpResponse> {
        self.0.response.lock().expect("response lock poisoned").take()
    }

    fn reset_input(&self) {
        self.0.reset_input.store(true, Ordering::SeqCst);
        self.0.sync();
    }

    fn reset_output(&self) {
        self.0.reset_output.store(true, Ordering::SeqCst);
        self.0.sync();
    }

    fn set_socket_timeout(&self, ms: u64) {
        self.0.timeout_ms.store(ms, Ordering::SeqCst);
        self.0.sync();
    }

    fn socket_timeout(&self) -> u64 {
        self.0.timeout_ms.load(Ordering::SeqCst)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.0.remote)
    }

    fn is_open(&self) -> bool {
        self.0.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.0.open.store(false, Ordering::SeqCst);
        self.0
            .close_request
            .fetch_max(CLOSE_GRACEFUL, Ordering::SeqCst);
        self.0.sync();
    }

    fn shutdown(&self) {
        self.0.open.store(false, Ordering::SeqCst);
        self.0.close_request.store(CLOSE_IMMEDIATE, Ordering::SeqCst);
        self.0.sync();
    }
}

/// One socket and its codec state, owned by the reactor.
struct IoSession {
    stream: TcpStream,
    shared: Arc<ConnShared>,
    conn: ConnRef,
    rd: StagingBuf,
    wr: StagingBuf,
    decoder: Option<TransferDecoder>,
    encoder: Option<TransferEncoder>,
    expecting_head: bool,
    head_request: bool,
    connected: bool,
    attachment: Option<Box<dyn Any + Send>>,
    peer_closed: bool,
    closing: bool,
    last_activity: Instant,
}

impl IoSession {
    fn apply_resets(&mut self) {
        if self.shared.reset_input.swap(false, Ordering::SeqCst) {
            self.decoder = None;
        }
        if self.shared.reset_output.swap(false, Ordering::SeqCst) {
            self.encoder = None;
        }
    }

    fn deadline(&self) -> Option<Instant> {
        let ms = self.shared.timeout_ms.load(Ordering::SeqCst);
        if ms == 0 {
            return None;
        }
        Some(self.last_activity + Duration::from_millis(ms))
    }
}

/// Handle for opening connections and stopping the reactor from other
/// threads.
#[derive(Debug, Clone)]
pub struct ReactorHandle {
    cmd: Sender<Command>,
    waker: Arc<Waker>,
}

impl ReactorHandle {
    /// Opens a non-blocking connection to `addr`. The attachment is handed
    /// to the execution handler when the connection is established.
    pub fn connect(
        &self,
        addr: SocketAddr,
        attachment: Option<Box<dyn Any + Send>>,
    ) -> io::Result<()> {
        self.cmd
            .send(Command::Connect { addr, attachment })
            .map_err(|_| io::Error::new(io::ErrorKind::NotConnected, "reactor stopped"))?;
        self.waker.wake()
    }

    /// Stops the reactor's event loop.
    pub fn stop(&self) -> io::Result<()> {
        self.cmd
            .send(Command::Stop)
            .map_err(|_| io::Error::new(io::ErrorKind::NotConnected, "reactor stopped"))?;
        self.waker.wake()
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect { addr, .. } => f.debug_struct("Connect").field("addr", addr).finish(),
            Self::Sync(token) => f.debug_tuple("Sync").field(token).finish(),
            Self::Stop => f.write_str("Stop"),
        }
    }
}

/// Single-thread I/O event dispatcher for client connections.
pub struct Reactor {
    poll: Poll,
    num_events: usize,
    sessions: Slab<IoSession>,
    handler: Arc<ClientHandler>,
    cmd_tx: Sender<Command>,
    cmd_rx: Receiver<Command>,
    waker: Arc<Waker>,
}

impl Reactor {
    /// Creates a reactor dispatching events to `handler`.
    pub fn new(handler: ClientHandler) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let (cmd_tx, cmd_rx) = unbounded();
        Ok(Self {
            poll,
            num_events: 1024,
            sessions: Slab::new(),
            handler: Arc::new(handler),
            cmd_tx,
            cmd_rx,
            waker,
        })
    }

    /// Handle for use from other threads.
    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            cmd: self.cmd_tx.clone(),
            waker: self.waker.clone(),
        }
    }

    /// Runs the event loop until [`ReactorHandle::stop`] is called.
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(self.num_events);

        loop {
            let timeout = self.next_deadline().map(|deadline| {
                deadline.saturating_duration_since(Instant::now())
            });
            match self.poll.poll(&mut events, timeout) {
                Ok(()) => {}
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }

            for event in events.iter() {
                match event.token() {
                    WAKE_TOKEN => {}
                    token => self.session_event(
                        token.0,
                        event.is_readable() || event.is_error(),
                        event.is_writable() || event.is_error(),
                    ),
                }
            }

            loop {
                match self.cmd_rx.try_recv() {
                    Ok(Command::Connect { addr, attachment }) => {
                        if let Err(err) = self.connect(addr, attachment) {
                            warn!(%addr, %err, "connect failed");
                        }
                    }
                    Ok(Command::Sync(token)) => self.sync_session(token),
                    Ok(Command::Stop) => return Ok(()),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return Ok(()),
                }
            }

            self.check_timeouts();
        }
    }

    fn connect(
        &mut self,
        addr: SocketAddr,
        attachment: Option<Box<dyn Any + Send>>,
    ) -> io::Result<()> {
        let mut stream = TcpStream::connect(addr)?;
        let entry = self.sessions.vacant_entry();
        let token = entry.key();
        self.poll.registry().register(
            &mut stream,
            Token(token),
            Interest::READABLE | Interest::WRITABLE,
        )?;

        let shared = Arc::new(ConnShared {
            token,
            cmd: self.cmd_tx.clone(),
            waker: self.waker.clone(),
            ctx: ExchangeContext::new(),
            remote: addr,
            open: AtomicBool::new(true),
            timeout_ms: AtomicU64::new(self.handler.default_socket_timeout_ms()),
            want_input: AtomicBool::new(true),
            want_output: AtomicBool::new(false),
            reset_input: AtomicBool::new(false),
            reset_output: AtomicBool::new(false),
            close_request: AtomicU8::new(CLOSE_NONE),
            pending: Mutex::new(None),
            response: Mutex::new(None),
        });
        let conn: ConnRef = Arc::new(ConnHandle(shared.clone()));
        entry.insert(IoSession {
            stream,
            shared,
            conn,
            rd: StagingBuf::new(),
            wr: StagingBuf::new(),
            decoder: None,
            encoder: None,
            expecting_head: false,
            head_request: false,
            connected: false,
            attachment,
            peer_closed: false,
            closing: false,
            last_activity: Instant::now(),
        });
        debug!(%addr, token, "connection initiated");
        Ok(())
    }

    fn session_event(&mut self, token: usize, readable: bool, writable: bool) {
        if !self.sessions.contains(token) {
            return;
        }
        let connected = self.sessions[token].connected;
        if !connected {
            if writable || readable {
                self.finish_connect(token);
            }
            return;
        }
        if readable {
            self.fill(token);
            self.process_input(token);
        }
        if writable {
            self.process_output(token);
        }
        self.finish_close(token);
    }

    fn finish_connect(&mut self, token: usize) {
        let established = {
            let Some(session) = self.sessions.get_mut(token) else {
                return;
            };
            match session.stream.take_error() {
                Ok(Some(err)) => Err(err),
                Ok(None) => match session.stream.peer_addr() {
                    Ok(_) => Ok(true),
                    // the handshake is still pending
                    Err(ref err)
                        if err.kind() == io::ErrorKind::NotConnected
                            || err.kind() == io::ErrorKind::WouldBlock =>
                    {
                        Ok(false)
                    }
                    Err(err) => Err(err),
                },
                Err(err) => Err(err),
            }
        };

        match established {
            Ok(false) => {}
            Ok(true) => {
                let conn = {
                    let session = &mut self.sessions[token];
                    session.connected = true;
                    session.last_activity = Instant::now();
                    session.conn.clone()
                };
                let attachment = self.sessions[token].attachment.take();
                debug!(token, "connection established");
                self.handler.connected(&conn, attachment);
                self.sync_session(token);
            }
            Err(err) => self.fail_io(token, err),
        }
    }

    fn fill(&mut self, token: usize) {
        let mut fatal = None;
        {
            let Some(session) = self.sessions.get_mut(token) else {
                return;
            };
            if session.peer_closed || !session.shared.want_input.load(Ordering::SeqCst) {
                return;
            }
            let mut tmp = [0u8; 4096];
            while session.rd.len() < SESSION_BUFFER_LIMIT {
                match session.stream.read(&mut tmp) {
                    Ok(0) => {
                        session.peer_closed = true;
                        break;
                    }
                    Ok(n) => {
                        session.rd.push_slice(&tmp[..n]);
                        session.last_activity = Instant::now();
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                    Err(err) => {
                        fatal = Some(err);
                        break;
                    }
                }
            }
        }
        if let Some(err) = fatal {
            self.fail_io(token, err);
        }
    }

    fn process_input(&mut self, token: usize) {
        let handler = self.handler.clone();
        loop {
            let Some(session) = self.sessions.get_mut(token) else {
                return;
            };
            session.apply_resets();

            if let Some(decoder) = &session.decoder {
                let runnable = !session.rd.is_empty()
                    || session.peer_closed
                    || decoder.is_completed();
                if !runnable || !session.shared.want_input.load(Ordering::SeqCst) {
                    break;
                }
                let before = session.rd.len();
                let conn = session.conn.clone();
                let peer_closed = session.peer_closed;
                let mut view = WireDecoder {
                    coder: session.decoder.as_mut().expect("decoder present"),
                    src: &mut session.rd,
                    peer_closed,
                };
                handler.input_ready(&conn, &mut view);
                let session = &mut self.sessions[token];
                let completed = session
                    .decoder
                    .as_ref()
                    .map(|d| d.is_completed())
                    .unwrap_or(true);
                let progressed = session.rd.len() != before || completed;
                if completed {
                    session.decoder = None;
                }
                if !progressed {
                    break;
                }
            } else if session.expecting_head {
                if session.rd.is_empty() {
                    break;
                }
                match parse_response_head(&mut session.rd, HEAD_LIMIT) {
                    Ok(None) => break,
                    Ok(Some(head)) => {
                        let status = head.status;
                        trace!(token, status, "response head received");
                        if status >= 200 {
                            session.expecting_head = false;
                            session.decoder = if session.head_request
                                || status == 204
                                || status == 304
                            {
                                None
                            } else if head.is_chunked() {
                                Some(TransferDecoder::chunked())
                            } else if let Some(len) = head.content_length() {
                                Some(TransferDecoder::length(len))
                            } else {
                                Some(TransferDecoder::until_close())
                            };
                        }
                        *session
                            .shared
                            .response
                            .lock()
                            .expect("response lock poisoned") =
                            Some(HttpResponse { head, body: None });
                        let conn = session.conn.clone();
                        handler.response_received(&conn);
                    }
                    Err(err) => {
                        let conn = session.conn.clone();
                        handler.protocol_error(&conn, err);
                        break;
                    }
                }
            } else {
                break;
            }
        }
        self.handle_eof(token);
    }

    fn handle_eof(&mut self, token: usize) {
        let action = {
            let Some(session) = self.sessions.get(token) else {
                return;
            };
            if !session.peer_closed {
                return;
            }
            if session.expecting_head {
                // the peer went away mid-response
                Some(Err(io::Error::from(io::ErrorKind::UnexpectedEof)))
            } else if let Some(decoder) = &session.decoder {
                let stuck = !decoder.is_completed()
                    && !matches!(decoder, TransferDecoder::UntilClose { .. })
                    && session.rd.is_empty();
                if stuck {
                    Some(Err(io::Error::from(io::ErrorKind::UnexpectedEof)))
                } else {
                    None
                }
            } else {
                // idle connection closed by the peer
                Some(Ok(()))
            }
        };
        match action {
            None => {}
            Some(Ok(())) => self.do_close(token),
            Some(Err(err)) => self.fail_io(token, err),
        }
    }

    fn process_output(&mut self, token: usize) {
        self.flush(token);
        let handler = self.handler.clone();
        loop {
            let Some(session) = self.sessions.get_mut(token) else {
                return;
            };
            session.apply_resets();
            if !session.connected {
                return;
            }

            if session.wr.len() >= SESSION_BUFFER_LIMIT {
                break;
            }

            let pending = session
                .shared
                .pending
                .lock()
                .expect("pending lock poisoned")
                .take();
            if let Some(request) = pending {
                trace!(token, uri = %request.head.target, "request head staged");
                encode_request_head(&request.head, &mut session.wr);
                session.head_request = request.head.method == Method::Head;
                session.encoder = request.body.map(|kind| match kind {
                    BodyKind::Length(len) => TransferEncoder::length(len),
                    BodyKind::Chunked => TransferEncoder::chunked(),
                });
                session.expecting_head = true;
                continue;
            }

            if session.encoder.is_some() {
                if !session.shared.want_output.load(Ordering::SeqCst) {
                    break;
                }
                let before = session.wr.len();
                let conn = session.conn.clone();
                let mut view = WireEncoder {
                    coder: session.encoder.as_mut().expect("encoder present"),
                    dst: &mut session.wr,
                    limit: SESSION_BUFFER_LIMIT,
                };
                handler.output_ready(&conn, &mut view);
                let session = &mut self.sessions[token];
                let completed = session
                    .encoder
                    .as_ref()
                    .map(|e| e.is_completed())
                    .unwrap_or(true);
                if completed {
                    session.encoder = None;
                }
                if session.wr.len() == before && !completed {
                    break;
                }
                continue;
            }

            // no request in flight: a pending output request means the
            // handler should be offered the chance to submit one
            if session.shared.want_output.swap(false, Ordering::SeqCst) {
                let conn = session.conn.clone();
                handler.request_ready(&conn);
                continue;
            }
            break;
        }
        self.flush(token);
    }

    fn flush(&mut self, token: usize) {
        let mut fatal = None;
        {
            let Some(session) = self.sessions.get_mut(token) else {
                return;
            };
            while !session.wr.is_empty() {
                match session.stream.write(session.wr.as_slice()) {
                    Ok(0) => {
                        fatal = Some(io::Error::from(io::ErrorKind::WriteZero));
                        break;
                    }
                    Ok(n) => {
                        session.wr.consume(n);
                        session.last_activity = Instant::now();
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                    Err(err) => {
                        fatal = Some(err);
                        break;
                    }
                }
            }
        }
        if let Some(err) = fatal {
            self.fail_io(token, err);
        }
    }

    fn sync_session(&mut self, token: usize) {
        if !self.sessions.contains(token) {
            return;
        }
        match self.sessions[token].shared.close_request.load(Ordering::SeqCst) {
            CLOSE_IMMEDIATE => {
                self.do_close(token);
                return;
            }
            CLOSE_GRACEFUL => {
                self.sessions[token].closing = true;
            }
            _ => {}
        }
        if self.sessions[token].connected {
            self.process_output(token);
            if self.sessions.contains(token) {
                self.fill(token);
                self.process_input(token);
            }
        }
        self.finish_close(token);
    }

    fn finish_close(&mut self, token: usize) {
        let Some(session) = self.sessions.get(token) else {
            return;
        };
        if session.closing
            && session.wr.is_empty()
            && session.encoder.is_none()
            && session
                .shared
                .pending
                .lock()
                .expect("pending lock poisoned")
                .is_none()
        {
            self.do_close(token);
        }
    }

    fn do_close(&mut self, token: usize) {
        if !self.sessions.contains(token) {
            return;
        }
        let mut session = self.sessions.remove(token);
        session.shared.open.store(false, Ordering::SeqCst);
        let _ = self.poll.registry().deregister(&mut session.stream);
        let conn = session.conn.clone();
        drop(session);
        debug!(token, "connection closed");
        self.handler.closed(&conn);
    }

    fn fail_io(&mut self, token: usize, err: io::Error) {
        let Some(session) = self.sessions.get(token) else {
            return;
        };
        let conn = session.conn.clone();
        debug!(token, %err, "I/O failure");
        self.handler.io_error(&conn, err);
        self.do_close(token);
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.sessions
            .iter()
            .filter_map(|(_, session)| session.deadline())
            .min()
    }

    fn check_timeouts(&mut self) {
        let now = Instant::now();
        let expired: Vec<usize> = self
            .sessions
            .iter()
            .filter_map(|(token, session)| match session.deadline() {
                Some(deadline) if deadline <= now => Some(token),
                _ => None,
            })
            .collect();
        for token in expired {
            let (conn, connected) = {
                let Some(session) = self.sessions.get_mut(token) else {
                    continue;
                };
                session.last_activity = now;
                (session.conn.clone(), session.connected)
            };
            if connected {
                debug!(token, "socket timeout");
                self.handler.timeout(&conn);
                self.sync_session(token);
            } else {
                self.fail_io(token, io::Error::from(io::ErrorKind::TimedOut));
            }
        }
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("sessions", &self.sessions.len())
            .finish()
    }
}
