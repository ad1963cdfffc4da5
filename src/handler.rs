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

//! Client-side connection handler
//!
//! The handler reacts to readiness events delivered by the I/O thread and
//! coordinates them with the worker tasks producing request bodies and
//! consuming responses. All shared state lives in the per-connection
//! [`ConnState`]; every event entry point runs on the I/O thread and takes
//! that state's monitor for its duration.

use std::any::Any;
use std::fmt;
use std::io;
use std::sync::Arc;

use tracing::trace;

use crate::buffer::{ContentInputStream, ContentOutputStream};
use crate::codec::{ContentDecoder, ContentEncoder};
use crate::config::Config;
use crate::conn::ConnRef;
use crate::context::{
    TargetHost, CONN_STATE, HTTP_CONNECTION, HTTP_REQUEST, HTTP_RESPONSE, HTTP_TARGET_HOST,
};
use crate::error::{ConfigError, ProtocolError};
use crate::executor::Executor;
use crate::message::{Method, RequestHead, ResponseBody};
use crate::protocol::{
    DefaultProcessor, DefaultReuseStrategy, EventListener, HttpProcessor, NullEventListener,
    RequestExecutionHandler, ReuseStrategy,
};
use crate::state::{ConnState, InputPhase, OutputPhase};

/// Event-driven HTTP/1.x client connection handler.
///
/// One instance serves any number of connections; per-connection state is
/// kept in the connection's execution context.
pub struct ClientHandler {
    execution: Arc<dyn RequestExecutionHandler>,
    processor: Arc<dyn HttpProcessor>,
    reuse: Arc<dyn ReuseStrategy>,
    executor: Arc<dyn Executor>,
    listener: Arc<dyn EventListener>,
    buffer_size: usize,
    wait_for_continue_ms: u64,
    socket_timeout_ms: u64,
}

/// Assembles a [`ClientHandler`], validating configuration and required
/// collaborators.
pub struct ClientHandlerBuilder {
    execution: Option<Arc<dyn RequestExecutionHandler>>,
    processor: Arc<dyn HttpProcessor>,
    reuse: Arc<dyn ReuseStrategy>,
    executor: Option<Arc<dyn Executor>>,
    listener: Arc<dyn EventListener>,
    config: Config,
}

impl ClientHandlerBuilder {
    /// Sets the request execution handler. Required.
    pub fn execution_handler(mut self, handler: impl RequestExecutionHandler + 'static) -> Self {
        self.execution = Some(Arc::new(handler));
        self
    }

    /// Sets the worker dispatcher. Required.
    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Replaces the default protocol processor.
    pub fn processor(mut self, processor: impl HttpProcessor + 'static) -> Self {
        self.processor = Arc::new(processor);
        self
    }

    /// Replaces the default connection reuse strategy.
    pub fn reuse_strategy(mut self, reuse: impl ReuseStrategy + 'static) -> Self {
        self.reuse = Arc::new(reuse);
        self
    }

    /// Replaces the default (silent) event listener.
    pub fn event_listener(mut self, listener: impl EventListener + 'static) -> Self {
        self.listener = Arc::new(listener);
        self
    }

    /// Supplies the configuration parameter store.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Builds the handler, rejecting invalid configuration and missing
    /// collaborators.
    pub fn build(self) -> Result<ClientHandler, ConfigError> {
        let execution = self
            .execution
            .ok_or(ConfigError::Missing("request execution handler"))?;
        let executor = self
            .executor
            .ok_or(ConfigError::Missing("worker dispatcher"))?;
        let buffer_size = self.config.content_buffer_size()?;
        let wait_for_continue_ms = self.config.wait_for_continue()?.as_millis() as u64;
        let socket_timeout_ms = self.config.socket_timeout_ms()?;
        Ok(ClientHandler {
            execution,
            processor: self.processor,
            reuse: self.reuse,
            executor,
            listener: self.listener,
            buffer_size,
            wait_for_continue_ms,
            socket_timeout_ms,
        })
    }
}

impl ClientHandler {
    /// Starts assembling a handler.
    pub fn builder() -> ClientHandlerBuilder {
        ClientHandlerBuilder {
            execution: None,
            processor: Arc::new(DefaultProcessor),
            reuse: Arc::new(DefaultReuseStrategy),
            executor: None,
            listener: Arc::new(NullEventListener),
            config: Config::new(),
        }
    }

    pub(crate) fn default_socket_timeout_ms(&self) -> u64 {
        self.socket_timeout_ms
    }

    fn state_of(&self, conn: &ConnRef) -> Option<Arc<ConnState>> {
        let state = conn.context().get::<Arc<ConnState>>(CONN_STATE)?;
        Some(state.as_ref().clone())
    }

    fn can_response_have_body(request: Option<&RequestHead>, status: u16) -> bool {
        if let Some(request) = request {
            if request.method == Method::Head {
                return false;
            }
        }
        status >= 200 && status != 204 && status != 304
    }

    /// The transport handshake finished; the connection is usable.
    pub fn connected(&self, conn: &ConnRef, attachment: Option<Box<dyn Any + Send>>) {
        let ctx = conn.context();
        if !ctx.contains(HTTP_TARGET_HOST) {
            if let Some(addr) = conn.remote_addr() {
                ctx.set(HTTP_TARGET_HOST, TargetHost::from_addr(addr));
            }
        }
        ctx.set(HTTP_CONNECTION, conn.clone());
        self.execution.initialize_context(ctx, attachment);
        let state = Arc::new(ConnState::new(self.buffer_size, conn.io_control()));
        ctx.set(CONN_STATE, state);
        self.listener.connection_open(conn.as_ref());
        self.request_ready(conn);
    }

    /// The connection can accept a new request.
    pub fn request_ready(&self, conn: &ConnRef) {
        if !conn.is_open() {
            return;
        }
        let Some(state) = self.state_of(conn) else { return };
        let mut inner = state.lock();
        if inner.output_phase != OutputPhase::Ready {
            return;
        }
        let ctx = conn.context();
        // nothing to send yet; the execution handler wakes the connection
        // with request_output once a request becomes available
        let Some(mut request) = self.execution.submit_request(ctx) else {
            return;
        };
        if let Err(err) = self.processor.process_request(&mut request, ctx) {
            drop(inner);
            self.protocol_error(conn, err);
            return;
        }
        ctx.set(HTTP_REQUEST, request.head.clone());
        if let Err(err) = conn.submit_request(&request) {
            drop(inner);
            self.io_error(conn, err);
            return;
        }
        trace!(uri = %request.head.target, "request submitted");
        inner.output_phase = OutputPhase::RequestSent;
        let has_body = request.body.is_some();
        let expects_continue = request.expects_continue();
        inner.request = Some(request);
        state.notify_all();
        conn.request_input();

        if !has_body {
            return;
        }
        if expects_continue {
            inner.saved_timeout = Some(conn.socket_timeout());
            inner.output_phase = OutputPhase::ExpectContinue;
            state.notify_all();
            conn.set_socket_timeout(self.wait_for_continue_ms);
        } else {
            drop(inner);
            self.dispatch_body_task(conn, &state);
        }
    }

    /// The socket can take request content; drain the output buffer into
    /// the current encoder.
    pub fn output_ready(&self, conn: &ConnRef, encoder: &mut dyn ContentEncoder) {
        let Some(state) = self.state_of(conn) else { return };
        let mut inner = state.lock();
        if inner.output_phase == OutputPhase::ExpectContinue {
            conn.suspend_output();
            return;
        }
        match state.outbuffer().produce_content(encoder) {
            Ok(_) => {
                if matches!(
                    inner.output_phase,
                    OutputPhase::RequestSent | OutputPhase::BodyStream | OutputPhase::BodyDone
                ) {
                    inner.output_phase = if encoder.is_completed() {
                        OutputPhase::BodyDone
                    } else {
                        OutputPhase::BodyStream
                    };
                    state.notify_all();
                }
            }
            Err(err) => {
                drop(inner);
                if err.kind() != io::ErrorKind::Interrupted {
                    self.io_error(conn, err);
                }
            }
        }
    }

    /// A response head arrived.
    pub fn response_received(&self, conn: &ConnRef) {
        let Some(state) = self.state_of(conn) else { return };
        let Some(mut response) = conn.take_response() else { return };
        let ctx = conn.context();
        let status = response.status();

        if status < 200 {
            // 100 while waiting resumes the request body; any other
            // interim response is ignored
            if status == 100 {
                self.continue_request(conn, &state);
            }
            return;
        }

        ctx.set(HTTP_RESPONSE, response.head.clone());
        let mut inner = state.lock();
        if inner.output_phase == OutputPhase::ExpectContinue {
            // the final response arrived first: the body will not be sent
            let saved = inner.saved_timeout.take();
            inner.output_phase = OutputPhase::BodyDone;
            state.notify_all();
            if let Some(ms) = saved {
                conn.set_socket_timeout(ms);
            }
            conn.reset_output();
        }
        inner.input_phase = InputPhase::ResponseReceived;
        state.notify_all();

        let request_head = ctx.get::<RequestHead>(HTTP_REQUEST);
        let can_have_body = Self::can_response_have_body(request_head.as_deref(), status);
        if can_have_body {
            let length = response.head.content_length();
            response.body = Some(ResponseBody::new(
                length,
                ContentInputStream::new(state.inbuffer().clone()),
            ));
        } else {
            conn.reset_input();
            response.body = None;
            inner.input_phase = InputPhase::ResponseDone;
            state.notify_all();
        }

        if let Err(err) = self.processor.process_response(&mut response, ctx) {
            drop(inner);
            self.protocol_error(conn, err);
            return;
        }

        let reuse = self.reuse.keep_alive(&response, ctx);
        inner.reuse = reuse;
        inner.response = Some(response);
        state.notify_all();
        drop(inner);

        if !can_have_body && !reuse {
            conn.close();
        }
        self.dispatch_response_task(conn, &state);
    }

    /// Decoded response content is available; fill the input buffer from
    /// the current decoder.
    pub fn input_ready(&self, conn: &ConnRef, decoder: &mut dyn ContentDecoder) {
        let Some(state) = self.state_of(conn) else { return };
        let mut inner = state.lock();
        match state.inbuffer().consume_from(decoder) {
            Ok(_) => {
                if !matches!(
                    inner.input_phase,
                    InputPhase::ResponseReceived | InputPhase::BodyStream
                ) {
                    return;
                }
                if decoder.is_completed() {
                    inner.input_phase = InputPhase::ResponseDone;
                    let reuse = inner.reuse;
                    state.notify_all();
                    drop(inner);
                    if !reuse {
                        conn.close();
                    }
                } else {
                    inner.input_phase = InputPhase::BodyStream;
                    state.notify_all();
                }
            }
            Err(err) => {
                drop(inner);
                if err.kind() != io::ErrorKind::Interrupted {
                    self.io_error(conn, err);
                }
            }
        }
    }

    /// The socket timed out. A pending expect-continue wait resumes the
    /// request body first; the connection is then closed.
    pub fn timeout(&self, conn: &ConnRef) {
        if let Some(state) = self.state_of(conn) {
            self.continue_request(conn, &state);
        }
        conn.close();
        self.listener.connection_timeout(conn.as_ref());
    }

    /// The connection closed; tear down its state so blocked workers
    /// unwind.
    pub fn closed(&self, conn: &ConnRef) {
        if let Some(state) = self.state_of(conn) {
            state.shutdown();
        }
        // drop the context's back-references so the connection can free
        conn.context().remove(HTTP_CONNECTION);
        conn.context().remove(CONN_STATE);
        self.listener.connection_closed(conn.as_ref());
    }

    /// An I/O failure tore the connection down: hard close, buffers shut,
    /// listener notified.
    pub fn io_error(&self, conn: &ConnRef, err: io::Error) {
        self.shutdown_connection(conn);
        self.listener.fatal_io_error(&err, conn.as_ref());
    }

    /// A protocol violation: graceful close, listener notified.
    pub fn protocol_error(&self, conn: &ConnRef, err: ProtocolError) {
        conn.close();
        self.listener.fatal_protocol_error(&err, conn.as_ref());
    }

    fn shutdown_connection(&self, conn: &ConnRef) {
        conn.shutdown();
        if let Some(state) = self.state_of(conn) {
            state.shutdown();
        }
    }

    /// Leaves the expect-continue wait: restores the saved socket timeout
    /// and dispatches the body task. No-op outside the wait.
    fn continue_request(&self, conn: &ConnRef, state: &Arc<ConnState>) {
        let saved = {
            let mut inner = state.lock();
            if inner.output_phase != OutputPhase::ExpectContinue {
                return;
            }
            inner.output_phase = OutputPhase::RequestSent;
            let saved = inner.saved_timeout.take();
            state.notify_all();
            saved
        };
        if let Some(ms) = saved {
            conn.set_socket_timeout(ms);
        }
        self.dispatch_body_task(conn, state);
    }

    fn dispatch_body_task(&self, conn: &ConnRef, state: &Arc<ConnState>) {
        let conn = conn.clone();
        let state = state.clone();
        let listener = self.listener.clone();
        self.executor.execute(Box::new(move || {
            let Some(mut producer) = state.take_body_producer() else {
                return;
            };
            let mut sink = ContentOutputStream::new(state.outbuffer().clone());
            let result = producer.produce(&mut sink).and_then(|_| io::Write::flush(&mut sink));
            match result {
                Ok(()) => sink.close(),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                    // the connection is already being torn down
                }
                Err(err) => {
                    conn.shutdown();
                    state.shutdown();
                    listener.fatal_io_error(&err, conn.as_ref());
                }
            }
        }));
    }

    fn dispatch_response_task(&self, conn: &ConnRef, state: &Arc<ConnState>) {
        let conn = conn.clone();
        let state = state.clone();
        let execution = self.execution.clone();
        self.executor.execute(Box::new(move || {
            let Some(response) = state.take_response() else {
                return;
            };
            execution.handle_response(response, conn.context());
            match state.await_response_done() {
                Ok(()) => {
                    state.reset_input();
                    state.reset_output();
                    conn.context().remove(HTTP_REQUEST);
                    conn.context().remove(HTTP_RESPONSE);
                    if conn.is_open() {
                        conn.request_output();
                    }
                }
                Err(_) => {
                    // interrupted while awaiting completion: make sure the
                    // connection tears down and unwind
                    conn.shutdown();
                }
            }
        }));
    }
}

impl fmt::Debug for ClientHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandler")
            .field("buffer_size", &self.buffer_size)
            .field("wait_for_continue_ms", &self.wait_for_continue_ms)
            .finish()
    }
}

impl fmt::Debug for ClientHandlerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandlerBuilder")
            .field("has_execution", &self.execution.is_some())
            .field("has_executor", &self.executor.is_some())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::collections::VecDeque;
    use std::io::Read;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;

    use crossbeam_channel::{unbounded, Receiver, Sender};

    use super::*;
    use crate::config::CONTENT_BUFFER_SIZE;
    use crate::conn::{ClientConnection, IoControl};
    use crate::context::ExchangeContext;
    use crate::message::{
        BodyKind, Headers, HttpRequest, HttpResponse, RequestBody, ResponseHead, Version,
    };
    use crate::executor::Task;

    struct MockConn {
        ctx: ExchangeContext,
        remote: SocketAddr,
        open: AtomicBool,
        timeout_ms: AtomicU64,
        submitted: Mutex<Vec<(RequestHead, Option<BodyKind>)>>,
        response: Mutex<Option<HttpResponse>>,
        close_calls: AtomicUsize,
        shutdown_calls: AtomicUsize,
        reset_input_calls: AtomicUsize,
        reset_output_calls: AtomicUsize,
        request_input_calls: AtomicUsize,
        request_output_calls: AtomicUsize,
    }

    impl MockConn {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                ctx: ExchangeContext::new(),
                remote: "127.0.0.1:8080".parse().unwrap(),
                open: AtomicBool::new(true),
                timeout_ms: AtomicU64::new(0),
                submitted: Mutex::new(Vec::new()),
                response: Mutex::new(None),
                close_calls: AtomicUsize::new(0),
                shutdown_calls: AtomicUsize::new(0),
                reset_input_calls: AtomicUsize::new(0),
                reset_output_calls: AtomicUsize::new(0),
                request_input_calls: AtomicUsize::new(0),
                request_output_calls: AtomicUsize::new(0),
            })
        }

        fn set_response(&self, response: HttpResponse) {
            *self.response.lock().unwrap() = Some(response);
        }
    }

    impl IoControl for MockConn {
        fn request_input(&self) {
            self.request_input_calls.fetch_add(1, Ordering::SeqCst);
        }
        fn suspend_input(&self) {}
        fn request_output(&self) {
            self.request_output_calls.fetch_add(1, Ordering::SeqCst);
        }
        fn suspend_output(&self) {}
    }

    #[derive(Clone)]
    struct MockHandle(Arc<MockConn>);

    impl IoControl for MockHandle {
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

    impl ClientConnection for MockHandle {
        fn context(&self) -> &ExchangeContext {
            &self.0.ctx
        }
        fn io_control(&self) -> Arc<dyn IoControl> {
            self.0.clone()
        }
        fn submit_request(&self, request: &HttpRequest) -> io::Result<()> {
            self.0
                .submitted
                .lock()
                .unwrap()
                .push((request.head.clone(), request.body_kind()));
            Ok(())
        }
        fn take_response(&self) -> Option<HttpResponse> {
            self.0.response.lock().unwrap().take()
        }
        fn reset_input(&self) {
            self.0.reset_input_calls.fetch_add(1, Ordering::SeqCst);
        }
        fn reset_output(&self) {
            self.0.reset_output_calls.fetch_add(1, Ordering::SeqCst);
        }
        fn set_socket_timeout(&self, ms: u64) {
            self.0.timeout_ms.store(ms, Ordering::SeqCst);
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
            self.0.close_calls.fetch_add(1, Ordering::SeqCst);
        }
        fn shutdown(&self) {
            self.0.open.store(false, Ordering::SeqCst);
            self.0.shutdown_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct ThreadExecutor;

    impl Executor for ThreadExecutor {
        fn execute(&self, task: Task) {
            thread::spawn(move || task());
        }
    }

    #[derive(Default)]
    struct Counters {
        opened: AtomicUsize,
        closed: AtomicUsize,
        timeouts: AtomicUsize,
        io_errors: AtomicUsize,
        protocol_errors: AtomicUsize,
    }

    struct RecordingListener(Arc<Counters>);

    impl EventListener for RecordingListener {
        fn connection_open(&self, _conn: &dyn ClientConnection) {
            self.0.opened.fetch_add(1, Ordering::SeqCst);
        }
        fn connection_closed(&self, _conn: &dyn ClientConnection) {
            self.0.closed.fetch_add(1, Ordering::SeqCst);
        }
        fn connection_timeout(&self, _conn: &dyn ClientConnection) {
            self.0.timeouts.fetch_add(1, Ordering::SeqCst);
        }
        fn fatal_io_error(&self, _err: &io::Error, _conn: &dyn ClientConnection) {
            self.0.io_errors.fetch_add(1, Ordering::SeqCst);
        }
        fn fatal_protocol_error(&self, _err: &ProtocolError, _conn: &dyn ClientConnection) {
            self.0.protocol_errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct ScriptedHandler {
        requests: Mutex<VecDeque<HttpRequest>>,
        completed: Sender<(u16, Vec<u8>)>,
    }

    impl RequestExecutionHandler for ScriptedHandler {
        fn initialize_context(
            &self,
            _ctx: &ExchangeContext,
            _attachment: Option<Box<dyn Any + Send>>,
        ) {
        }

        fn submit_request(&self, _ctx: &ExchangeContext) -> Option<HttpRequest> {
            self.requests.lock().unwrap().pop_front()
        }

        fn handle_response(&self, response: HttpResponse, _ctx: &ExchangeContext) {
            let status = response.status();
            let mut data = Vec::new();
            if let Some(mut body) = response.body {
                let _ = body.read_to_end(&mut data);
            }
            let _ = self.completed.send((status, data));
        }
    }

    struct SliceDecoder {
        data: Vec<u8>,
        pos: usize,
        completes: bool,
    }

    impl SliceDecoder {
        fn new(data: &[u8], completes: bool) -> Self {
            Self {
                data: data.to_vec(),
                pos: 0,
                completes,
            }
        }
    }

    impl ContentDecoder for SliceDecoder {
        fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
            let n = dst.len().min(self.data.len() - self.pos);
            dst[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }

        fn is_completed(&self) -> bool {
            self.completes && self.pos == self.data.len()
        }
    }

    struct VecEncoder {
        out: Vec<u8>,
        completed: bool,
        max_per_write: usize,
    }

    impl VecEncoder {
        fn new(max_per_write: usize) -> Self {
            Self {
                out: Vec::new(),
                completed: false,
                max_per_write,
            }
        }
    }

    impl ContentEncoder for VecEncoder {
        fn write(&mut self, src: &[u8]) -> io::Result<usize> {
            let n = src.len().min(self.max_per_write);
            self.out.extend_from_slice(&src[..n]);
            Ok(n)
        }

        fn complete(&mut self) -> io::Result<()> {
            self.completed = true;
            Ok(())
        }

        fn is_completed(&self) -> bool {
            self.completed
        }
    }

    fn response(status: u16, headers: &[(&str, &str)]) -> HttpResponse {
        let mut hs = Headers::new();
        for (name, value) in headers {
            hs.add(*name, *value);
        }
        HttpResponse {
            head: ResponseHead {
                version: Version::H1_1,
                status,
                reason: String::new(),
                headers: hs,
            },
            body: None,
        }
    }

    fn build_handler(
        requests: Vec<HttpRequest>,
        config: Config,
    ) -> (ClientHandler, Receiver<(u16, Vec<u8>)>, Arc<Counters>) {
        let (tx, rx) = unbounded();
        let counters = Arc::new(Counters::default());
        let handler = ClientHandler::builder()
            .execution_handler(ScriptedHandler {
                requests: Mutex::new(requests.into()),
                completed: tx,
            })
            .executor(Arc::new(ThreadExecutor))
            .event_listener(RecordingListener(counters.clone()))
            .config(config)
            .build()
            .unwrap();
        (handler, rx, counters)
    }

    fn state_of(conn: &ConnRef) -> Arc<ConnState> {
        conn.context()
            .get::<Arc<ConnState>>(CONN_STATE)
            .unwrap()
            .as_ref()
            .clone()
    }

    fn wait_until(what: &str, cond: impl Fn() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("timed out waiting for {what}");
    }

    #[test]
    fn builder_requires_a_worker_dispatcher() {
        let (tx, _rx) = unbounded();
        let result = ClientHandler::builder()
            .execution_handler(ScriptedHandler {
                requests: Mutex::new(VecDeque::new()),
                completed: tx,
            })
            .build();
        assert!(matches!(
            result,
            Err(ConfigError::Missing("worker dispatcher"))
        ));
    }

    #[test]
    fn builder_rejects_negative_buffer_size() {
        let (tx, _rx) = unbounded();
        let mut config = Config::new();
        config.set_int(CONTENT_BUFFER_SIZE, -1);
        let result = ClientHandler::builder()
            .execution_handler(ScriptedHandler {
                requests: Mutex::new(VecDeque::new()),
                completed: tx,
            })
            .executor(Arc::new(ThreadExecutor))
            .config(config)
            .build();
        assert!(matches!(result, Err(ConfigError::InvalidParam { .. })));
    }

    #[test]
    fn simple_get_delivers_body_and_resets_phases() {
        let (handler, rx, counters) =
            build_handler(vec![HttpRequest::new(Method::Get, "/a")], Config::new());
        let mock = MockConn::new();
        let conn: ConnRef = Arc::new(MockHandle(mock.clone()));

        handler.connected(&conn, None);
        assert_eq!(1, mock.submitted.lock().unwrap().len());
        assert_eq!(
            (InputPhase::Ready, OutputPhase::RequestSent),
            state_of(&conn).phases()
        );

        mock.set_response(response(200, &[("Content-Length", "5")]));
        handler.response_received(&conn);
        let mut decoder = SliceDecoder::new(b"hello", true);
        handler.input_ready(&conn, &mut decoder);

        let (status, body) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(200, status);
        assert_eq!(b"hello".to_vec(), body);

        let state = state_of(&conn);
        wait_until("phases to reset", || {
            state.phases() == (InputPhase::Ready, OutputPhase::Ready)
        });
        assert!(conn.is_open());
        assert_eq!(0, counters.io_errors.load(Ordering::SeqCst));
        assert_eq!(0, counters.protocol_errors.load(Ordering::SeqCst));
        assert_eq!(1, counters.opened.load(Ordering::SeqCst));
    }

    #[test]
    fn post_streams_large_body_through_bounded_buffer() {
        let body = vec![b'A'; 65536];
        let request = HttpRequest::new(Method::Post, "/x").body(RequestBody::from_bytes(body));
        let (handler, _rx, counters) = build_handler(vec![request], Config::new());
        let mock = MockConn::new();
        let conn: ConnRef = Arc::new(MockHandle(mock.clone()));

        handler.connected(&conn, None);
        let state = state_of(&conn);
        assert_eq!(
            Some(Some(BodyKind::Length(65536))),
            mock.submitted.lock().unwrap().first().map(|(_, kind)| *kind)
        );

        // act as the I/O thread: drain whenever the worker has content
        let mut encoder = VecEncoder::new(4096);
        let mut idle = 0;
        while !encoder.completed && idle < 5000 {
            let before = encoder.out.len();
            handler.output_ready(&conn, &mut encoder);
            assert!(state.outbuffer().len() <= 20480);
            if encoder.out.len() == before && !encoder.completed {
                idle += 1;
                thread::sleep(Duration::from_millis(1));
            } else {
                idle = 0;
            }
        }
        assert!(encoder.completed);
        assert_eq!(65536, encoder.out.len());
        assert!(encoder.out.iter().all(|&b| b == b'A'));
        assert_eq!((InputPhase::Ready, OutputPhase::BodyDone), state.phases());
        assert_eq!(0, counters.io_errors.load(Ordering::SeqCst));
    }

    #[test]
    fn expect_continue_interim_response_resumes_body() {
        let request = HttpRequest::new(Method::Post, "/x")
            .header("Expect", "100-continue")
            .body(RequestBody::from_bytes(b"hello".to_vec()));
        let (handler, rx, counters) = build_handler(vec![request], Config::new());
        let mock = MockConn::new();
        mock.timeout_ms.store(30_000, Ordering::SeqCst);
        let conn: ConnRef = Arc::new(MockHandle(mock.clone()));

        handler.connected(&conn, None);
        let state = state_of(&conn);
        assert_eq!(
            (InputPhase::Ready, OutputPhase::ExpectContinue),
            state.phases()
        );
        assert_eq!(3000, conn.socket_timeout());

        mock.set_response(response(100, &[]));
        handler.response_received(&conn);
        assert_eq!(30_000, conn.socket_timeout());
        assert_eq!(
            (InputPhase::Ready, OutputPhase::RequestSent),
            state.phases()
        );

        let mut encoder = VecEncoder::new(4096);
        let mut idle = 0;
        while !encoder.completed && idle < 5000 {
            let before = encoder.out.len();
            handler.output_ready(&conn, &mut encoder);
            if encoder.out.len() == before && !encoder.completed {
                idle += 1;
                thread::sleep(Duration::from_millis(1));
            } else {
                idle = 0;
            }
        }
        assert_eq!(b"hello".to_vec(), encoder.out);

        mock.set_response(response(200, &[("Content-Length", "0")]));
        handler.response_received(&conn);
        let mut decoder = SliceDecoder::new(b"", true);
        handler.input_ready(&conn, &mut decoder);

        let (status, body) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(200, status);
        assert!(body.is_empty());
        wait_until("phases to reset", || {
            state.phases() == (InputPhase::Ready, OutputPhase::Ready)
        });
        assert_eq!(0, counters.timeouts.load(Ordering::SeqCst));
    }

    #[test]
    fn expect_continue_timeout_sends_body_and_closes() {
        let request = HttpRequest::new(Method::Post, "/x")
            .header("Expect", "100-continue")
            .body(RequestBody::from_bytes(b"hello".to_vec()));
        let (handler, _rx, counters) = build_handler(vec![request], Config::new());
        let mock = MockConn::new();
        mock.timeout_ms.store(30_000, Ordering::SeqCst);
        let conn: ConnRef = Arc::new(MockHandle(mock.clone()));

        handler.connected(&conn, None);
        handler.timeout(&conn);

        assert_eq!(30_000, conn.socket_timeout());
        assert_eq!(1, mock.close_calls.load(Ordering::SeqCst));
        assert_eq!(1, counters.timeouts.load(Ordering::SeqCst));

        // the body task still ran and closed the sink
        let state = state_of(&conn);
        wait_until("body to be staged", || state.outbuffer().is_eos());
        assert_eq!(0, counters.io_errors.load(Ordering::SeqCst));
    }

    #[test]
    fn head_response_with_content_length_carries_no_body() {
        let (handler, rx, _counters) =
            build_handler(vec![HttpRequest::new(Method::Head, "/")], Config::new());
        let mock = MockConn::new();
        let conn: ConnRef = Arc::new(MockHandle(mock.clone()));

        handler.connected(&conn, None);
        mock.set_response(response(200, &[("Content-Length", "100")]));
        handler.response_received(&conn);

        let (status, body) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(200, status);
        assert!(body.is_empty());
        assert_eq!(1, mock.reset_input_calls.load(Ordering::SeqCst));
        assert_eq!(0, mock.close_calls.load(Ordering::SeqCst));

        let state = state_of(&conn);
        wait_until("phases to reset", || {
            state.phases() == (InputPhase::Ready, OutputPhase::Ready)
        });
    }

    #[test]
    fn connection_close_header_closes_and_stops_submitting() {
        let requests = vec![
            HttpRequest::new(Method::Get, "/a"),
            HttpRequest::new(Method::Get, "/b"),
        ];
        let (handler, rx, _counters) = build_handler(requests, Config::new());
        let mock = MockConn::new();
        let conn: ConnRef = Arc::new(MockHandle(mock.clone()));

        handler.connected(&conn, None);
        mock.set_response(response(
            200,
            &[("Content-Length", "5"), ("Connection", "close")],
        ));
        handler.response_received(&conn);
        let mut decoder = SliceDecoder::new(b"hello", true);
        handler.input_ready(&conn, &mut decoder);

        let (_, body) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(b"hello".to_vec(), body);
        wait_until("connection to close", || !conn.is_open());

        // a closed connection honors no further request_ready
        handler.request_ready(&conn);
        assert_eq!(1, mock.submitted.lock().unwrap().len());
        assert_eq!(0, mock.request_output_calls.load(Ordering::SeqCst));
    }

    #[test]
    fn shutdown_while_awaiting_completion_unblocks_worker() {
        let (handler, rx, _counters) =
            build_handler(vec![HttpRequest::new(Method::Get, "/a")], Config::new());
        let mock = MockConn::new();
        let conn: ConnRef = Arc::new(MockHandle(mock.clone()));

        handler.connected(&conn, None);
        mock.set_response(response(200, &[("Content-Length", "5")]));
        handler.response_received(&conn);

        // worker is handling the response, blocked reading the body;
        // tear the connection down underneath it
        let state = state_of(&conn);
        thread::sleep(Duration::from_millis(50));
        handler.io_error(&conn, io::Error::new(io::ErrorKind::ConnectionReset, "reset"));

        // the response handler returns an empty body read error, then the
        // worker observes shutdown
        wait_until("worker to unblock", || {
            rx.recv_timeout(Duration::from_millis(100)).is_ok()
        });
        assert!(state.is_shutdown());
        assert!(mock.shutdown_calls.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn protocol_error_closes_gracefully_and_notifies() {
        let (handler, _rx, counters) =
            build_handler(vec![HttpRequest::new(Method::Get, "/a")], Config::new());
        let mock = MockConn::new();
        let conn: ConnRef = Arc::new(MockHandle(mock.clone()));

        handler.connected(&conn, None);
        handler.protocol_error(&conn, ProtocolError::Version);
        assert_eq!(1, mock.close_calls.load(Ordering::SeqCst));
        assert_eq!(0, mock.shutdown_calls.load(Ordering::SeqCst));
        assert_eq!(1, counters.protocol_errors.load(Ordering::SeqCst));
    }
}
