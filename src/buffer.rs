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

//! Shared content buffers bridging the I/O thread and worker threads
//!
//! Each connection owns one input and one output buffer. The I/O thread
//! side never blocks; the worker side blocks with ordinary stream
//! semantics. Both buffers are bounded, so a connection's resident memory
//! stays flat no matter how large the bodies flowing through it are, with
//! backpressure signalled through the connection's flow-control port.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::codec::{ContentDecoder, ContentEncoder};
use crate::conn::IoControl;
use crate::error::interrupted;

/// Fixed-capacity byte ring. Writes land at the tail, reads consume from
/// the head; both expose the largest contiguous region so callers can
/// copy straight in or out.
#[derive(Debug)]
struct ByteRing {
    buf: Box<[u8]>,
    read: usize,
    len: usize,
}

impl ByteRing {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity].into_boxed_slice(),
            read: 0,
            len: 0,
        }
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    fn len(&self) -> usize {
        self.len
    }

    #[inline]
    fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn is_full(&self) -> bool {
        self.len == self.buf.len()
    }

    /// Largest contiguous writable region. Empty when the ring is full.
    fn free_slice(&mut self) -> &mut [u8] {
        let cap = self.buf.len();
        let write = (self.read + self.len) % cap;
        let end = if write >= self.read && self.len < cap {
            cap
        } else {
            self.read
        };
        &mut self.buf[write..end]
    }

    fn advance_write(&mut self, n: usize) {
        debug_assert!(self.len + n <= self.buf.len());
        self.len += n;
    }

    /// Largest contiguous readable region. Empty when the ring is empty.
    fn filled_slice(&self) -> &[u8] {
        let end = (self.read + self.len).min(self.buf.len());
        &self.buf[self.read..end]
    }

    fn advance_read(&mut self, n: usize) {
        debug_assert!(n <= self.len);
        self.read = (self.read + n) % self.buf.len();
        self.len -= n;
        if self.len == 0 {
            self.read = 0;
        }
    }

    fn write_from_slice(&mut self, src: &[u8]) -> usize {
        let mut copied = 0;
        while copied < src.len() {
            let free = self.free_slice();
            if free.is_empty() {
                break;
            }
            let n = free.len().min(src.len() - copied);
            free[..n].copy_from_slice(&src[copied..copied + n]);
            self.advance_write(n);
            copied += n;
        }
        copied
    }

    fn read_into_slice(&mut self, dst: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < dst.len() {
            let filled = self.filled_slice();
            if filled.is_empty() {
                break;
            }
            let n = filled.len().min(dst.len() - copied);
            dst[copied..copied + n].copy_from_slice(&filled[..n]);
            self.advance_read(n);
            copied += n;
        }
        copied
    }

    fn clear(&mut self) {
        self.read = 0;
        self.len = 0;
    }
}

struct InputInner {
    ring: ByteRing,
    eos: bool,
    closed: bool,
}

/// Bounded buffer carrying decoded response content from the I/O thread
/// to a worker.
///
/// The I/O thread fills it from a [`ContentDecoder`]; a worker drains it
/// as a blocking byte source. When the ring fills up the buffer suspends
/// socket input through its flow-control port, and requests it again once
/// the worker frees space.
pub struct SharedInputBuffer {
    inner: Mutex<InputInner>,
    cond: Condvar,
    io: Arc<dyn IoControl>,
}

impl SharedInputBuffer {
    /// Creates a buffer of `capacity` bytes attached to a flow-control port.
    pub fn new(capacity: usize, io: Arc<dyn IoControl>) -> Self {
        Self {
            inner: Mutex::new(InputInner {
                ring: ByteRing::with_capacity(capacity),
                eos: false,
                closed: false,
            }),
            cond: Condvar::new(),
            io,
        }
    }

    fn lock(&self) -> MutexGuard<'_, InputInner> {
        self.inner.lock().expect("input buffer lock poisoned")
    }

    /// Fills the buffer with whatever `decoder` currently has available.
    /// Called by the I/O thread only; never blocks.
    ///
    /// Suspends socket input when the ring is full, and records
    /// end-of-stream once the decoder reports completion.
    pub fn consume_from(&self, decoder: &mut dyn ContentDecoder) -> io::Result<usize> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(interrupted("buffer shut down"));
        }
        let mut total = 0;
        loop {
            if inner.ring.is_full() {
                self.io.suspend_input();
                break;
            }
            let n = {
                let free = inner.ring.free_slice();
                decoder.read(free)?
            };
            if n == 0 {
                break;
            }
            inner.ring.advance_write(n);
            total += n;
        }
        if decoder.is_completed() {
            inner.eos = true;
        }
        if total > 0 || inner.eos {
            self.cond.notify_all();
        }
        Ok(total)
    }

    /// Blocking read of decoded content. Called by workers only.
    ///
    /// Returns `Ok(0)` at end of stream. Buffered bytes remain readable
    /// after shutdown; a read that would have to block fails with
    /// [`io::ErrorKind::Interrupted`] instead.
    pub fn read(&self, dst: &mut [u8]) -> io::Result<usize> {
        if dst.is_empty() {
            return Ok(0);
        }
        let mut inner = self.lock();
        loop {
            if !inner.ring.is_empty() {
                break;
            }
            if inner.eos {
                return Ok(0);
            }
            if inner.closed {
                return Err(interrupted("buffer shut down"));
            }
            inner = self.cond.wait(inner).expect("input buffer lock poisoned");
        }
        let n = inner.ring.read_into_slice(dst);
        if !inner.eos && !inner.closed {
            self.io.request_input();
        }
        Ok(n)
    }

    /// Discards residual bytes and clears the end-of-stream marker, ready
    /// for the next exchange on a kept-alive connection.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.ring.clear();
        inner.eos = false;
        self.cond.notify_all();
    }

    /// Unblocks every pending read with an interrupted-I/O failure.
    pub fn shutdown(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        self.cond.notify_all();
    }

    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        self.lock().ring.len()
    }

    /// Whether no bytes are currently buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether end-of-stream has been recorded.
    pub fn is_eos(&self) -> bool {
        self.lock().eos
    }
}

impl fmt::Debug for SharedInputBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("SharedInputBuffer")
            .field("len", &inner.ring.len())
            .field("capacity", &inner.ring.capacity())
            .field("eos", &inner.eos)
            .field("closed", &inner.closed)
            .finish()
    }
}

/// Blocking [`Read`] view over a shared input buffer, handed to response
/// handlers as the response body stream.
pub struct ContentInputStream(Arc<SharedInputBuffer>);

impl ContentInputStream {
    pub(crate) fn new(buffer: Arc<SharedInputBuffer>) -> Self {
        Self(buffer)
    }
}

impl Read for ContentInputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl fmt::Debug for ContentInputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ContentInputStream").field(&self.0).finish()
    }
}

struct OutputInner {
    ring: ByteRing,
    eos: bool,
    closed: bool,
}

/// Bounded buffer carrying request body content from a worker to the I/O
/// thread.
///
/// A worker fills it as a blocking byte sink; the I/O thread drains it
/// into the current [`ContentEncoder`]. Writes block while the ring is
/// full; closing the sink marks end-of-stream, after which the I/O thread
/// finalizes the encoder.
pub struct SharedOutputBuffer {
    inner: Mutex<OutputInner>,
    cond: Condvar,
    io: Arc<dyn IoControl>,
}

impl SharedOutputBuffer {
    /// Creates a buffer of `capacity` bytes attached to a flow-control port.
    pub fn new(capacity: usize, io: Arc<dyn IoControl>) -> Self {
        Self {
            inner: Mutex::new(OutputInner {
                ring: ByteRing::with_capacity(capacity),
                eos: false,
                closed: false,
            }),
            cond: Condvar::new(),
            io,
        }
    }

    fn lock(&self) -> MutexGuard<'_, OutputInner> {
        self.inner.lock().expect("output buffer lock poisoned")
    }

    /// Blocking write of body content. Called by workers only.
    ///
    /// Blocks while the ring is full; fails with
    /// [`io::ErrorKind::Interrupted`] once the buffer is shut down, and
    /// with [`io::ErrorKind::BrokenPipe`] after the sink was closed.
    pub fn write(&self, src: &[u8]) -> io::Result<usize> {
        if src.is_empty() {
            return Ok(0);
        }
        let mut inner = self.lock();
        loop {
            if inner.closed {
                return Err(interrupted("buffer shut down"));
            }
            if inner.eos {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "content sink already closed",
                ));
            }
            if !inner.ring.is_full() {
                break;
            }
            self.io.request_output();
            inner = self.cond.wait(inner).expect("output buffer lock poisoned");
        }
        let n = inner.ring.write_from_slice(src);
        self.io.request_output();
        Ok(n)
    }

    /// Marks end-of-stream from the producing side.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.eos = true;
        self.cond.notify_all();
        self.io.request_output();
    }

    /// Drains buffered content into `encoder`. Called by the I/O thread
    /// only; never blocks.
    ///
    /// Finalizes the encoder once the buffer is drained after the sink was
    /// closed; suspends write-readiness when there is nothing to send yet.
    pub fn produce_content(&self, encoder: &mut dyn ContentEncoder) -> io::Result<usize> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(interrupted("buffer shut down"));
        }
        let mut total = 0;
        loop {
            if inner.ring.is_empty() {
                break;
            }
            let n = encoder.write(inner.ring.filled_slice())?;
            if n == 0 {
                break;
            }
            inner.ring.advance_read(n);
            total += n;
        }
        if total > 0 {
            self.cond.notify_all();
        }
        if inner.ring.is_empty() {
            if inner.eos {
                if !encoder.is_completed() {
                    encoder.complete()?;
                }
            } else {
                self.io.suspend_output();
            }
        }
        Ok(total)
    }

    /// Discards residual bytes and clears the end-of-stream marker, ready
    /// for the next exchange on a kept-alive connection.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.ring.clear();
        inner.eos = false;
        self.cond.notify_all();
    }

    /// Unblocks every pending write with an interrupted-I/O failure.
    pub fn shutdown(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        self.cond.notify_all();
    }

    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        self.lock().ring.len()
    }

    /// Whether no bytes are currently buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the producing side has closed the sink.
    pub fn is_eos(&self) -> bool {
        self.lock().eos
    }
}

impl fmt::Debug for SharedOutputBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("SharedOutputBuffer")
            .field("len", &inner.ring.len())
            .field("capacity", &inner.ring.capacity())
            .field("eos", &inner.eos)
            .field("closed", &inner.closed)
            .finish()
    }
}

/// Blocking [`Write`] view over a shared output buffer, handed to body
/// producers as the request body sink.
pub struct ContentOutputStream(Arc<SharedOutputBuffer>);

impl ContentOutputStream {
    pub(crate) fn new(buffer: Arc<SharedOutputBuffer>) -> Self {
        Self(buffer)
    }

    /// Marks end-of-stream; subsequent writes fail.
    pub fn close(&self) {
        self.0.close();
    }
}

impl Write for ContentOutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl fmt::Debug for ContentOutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ContentOutputStream").field(&self.0).finish()
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[derive(Default)]
    struct RecordingIo {
        request_input: AtomicUsize,
        suspend_input: AtomicUsize,
        request_output: AtomicUsize,
        suspend_output: AtomicUsize,
    }

    impl IoControl for RecordingIo {
        fn request_input(&self) {
            self.request_input.fetch_add(1, Ordering::SeqCst);
        }
        fn suspend_input(&self) {
            self.suspend_input.fetch_add(1, Ordering::SeqCst);
        }
        fn request_output(&self) {
            self.request_output.fetch_add(1, Ordering::SeqCst);
        }
        fn suspend_output(&self) {
            self.suspend_output.fetch_add(1, Ordering::SeqCst);
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

    #[test]
    fn byte_ring_preserves_order_across_wrap() {
        let mut ring = ByteRing::with_capacity(4);
        assert_eq!(3, ring.write_from_slice(b"abc"));
        let mut out = [0u8; 2];
        assert_eq!(2, ring.read_into_slice(&mut out));
        assert_eq!(b"ab", &out);
        assert_eq!(3, ring.write_from_slice(b"def"));
        assert!(ring.is_full());
        let mut rest = [0u8; 4];
        assert_eq!(4, ring.read_into_slice(&mut rest));
        assert_eq!(b"cdef", &rest);
        assert!(ring.is_empty());
    }

    #[test]
    fn input_buffer_delivers_decoded_bytes_in_order() {
        let io = Arc::new(RecordingIo::default());
        let buffer = SharedInputBuffer::new(8, io);
        let mut decoder = SliceDecoder::new(b"hello", true);
        assert_eq!(5, buffer.consume_from(&mut decoder).unwrap());
        assert!(buffer.is_eos());

        let mut out = [0u8; 8];
        assert_eq!(5, buffer.read(&mut out).unwrap());
        assert_eq!(b"hello", &out[..5]);
        assert_eq!(0, buffer.read(&mut out).unwrap());
    }

    #[test]
    fn input_buffer_suspends_input_when_full_and_requests_when_drained() {
        let io = Arc::new(RecordingIo::default());
        let buffer = SharedInputBuffer::new(4, io.clone());
        let mut decoder = SliceDecoder::new(b"abcdef", false);
        assert_eq!(4, buffer.consume_from(&mut decoder).unwrap());
        assert_eq!(1, io.suspend_input.load(Ordering::SeqCst));

        let mut out = [0u8; 2];
        assert_eq!(2, buffer.read(&mut out).unwrap());
        assert_eq!(1, io.request_input.load(Ordering::SeqCst));
    }

    #[test]
    fn input_buffer_read_blocks_until_producer_appends() {
        let io = Arc::new(RecordingIo::default());
        let buffer = Arc::new(SharedInputBuffer::new(8, io));
        let reader = {
            let buffer = buffer.clone();
            thread::spawn(move || {
                let mut out = [0u8; 4];
                let n = buffer.read(&mut out).unwrap();
                out[..n].to_vec()
            })
        };

        thread::sleep(Duration::from_millis(50));
        let mut decoder = SliceDecoder::new(b"ab", false);
        buffer.consume_from(&mut decoder).unwrap();
        assert_eq!(b"ab".to_vec(), reader.join().unwrap());
    }

    #[test]
    fn input_buffer_shutdown_unblocks_reader_with_interrupted() {
        let io = Arc::new(RecordingIo::default());
        let buffer = Arc::new(SharedInputBuffer::new(8, io));
        let reader = {
            let buffer = buffer.clone();
            thread::spawn(move || buffer.read(&mut [0u8; 4]).unwrap_err().kind())
        };

        thread::sleep(Duration::from_millis(50));
        buffer.shutdown();
        assert_eq!(io::ErrorKind::Interrupted, reader.join().unwrap());
    }

    #[test]
    fn input_buffer_serves_buffered_bytes_after_shutdown() {
        let io = Arc::new(RecordingIo::default());
        let buffer = SharedInputBuffer::new(8, io);
        let mut decoder = SliceDecoder::new(b"tail", false);
        buffer.consume_from(&mut decoder).unwrap();
        buffer.shutdown();

        let mut out = [0u8; 8];
        assert_eq!(4, buffer.read(&mut out).unwrap());
        assert_eq!(b"tail", &out[..4]);
        assert_eq!(
            io::ErrorKind::Interrupted,
            buffer.read(&mut out).unwrap_err().kind()
        );
    }

    #[test]
    fn input_buffer_reset_discards_residual_bytes_and_eos() {
        let io = Arc::new(RecordingIo::default());
        let buffer = SharedInputBuffer::new(8, io);
        let mut decoder = SliceDecoder::new(b"junk", true);
        buffer.consume_from(&mut decoder).unwrap();
        buffer.reset();
        assert_eq!(0, buffer.len());
        assert!(!buffer.is_eos());
    }

    #[test]
    fn output_buffer_drains_written_bytes_into_encoder() {
        let io = Arc::new(RecordingIo::default());
        let buffer = SharedOutputBuffer::new(8, io);
        assert_eq!(5, buffer.write(b"hello").unwrap());
        buffer.close();

        let mut encoder = VecEncoder::new(usize::MAX);
        buffer.produce_content(&mut encoder).unwrap();
        assert_eq!(b"hello".to_vec(), encoder.out);
        assert!(encoder.completed);
    }

    #[test]
    fn output_buffer_write_blocks_until_io_thread_drains() {
        let io = Arc::new(RecordingIo::default());
        let buffer = Arc::new(SharedOutputBuffer::new(4, io));
        assert_eq!(4, buffer.write(b"abcd").unwrap());

        let writer = {
            let buffer = buffer.clone();
            thread::spawn(move || buffer.write(b"ef").unwrap())
        };

        thread::sleep(Duration::from_millis(50));
        let mut encoder = VecEncoder::new(usize::MAX);
        buffer.produce_content(&mut encoder).unwrap();
        assert_eq!(2, writer.join().unwrap());
        buffer.close();
        buffer.produce_content(&mut encoder).unwrap();
        assert_eq!(b"abcdef".to_vec(), encoder.out);
    }

    #[test]
    fn output_buffer_respects_partial_encoder_writes() {
        let io = Arc::new(RecordingIo::default());
        let buffer = SharedOutputBuffer::new(8, io);
        buffer.write(b"abcdef").unwrap();
        let mut encoder = VecEncoder::new(2);
        // encoder accepts two bytes per call; drain loop keeps going
        assert_eq!(6, buffer.produce_content(&mut encoder).unwrap());
        assert_eq!(b"abcdef".to_vec(), encoder.out);
    }

    #[test]
    fn output_buffer_suspends_output_when_empty_and_open() {
        let io = Arc::new(RecordingIo::default());
        let buffer = SharedOutputBuffer::new(8, io.clone());
        let mut encoder = VecEncoder::new(usize::MAX);
        buffer.produce_content(&mut encoder).unwrap();
        assert_eq!(1, io.suspend_output.load(Ordering::SeqCst));
        assert!(!encoder.completed);
    }

    #[test]
    fn output_buffer_shutdown_unblocks_writer_with_interrupted() {
        let io = Arc::new(RecordingIo::default());
        let buffer = Arc::new(SharedOutputBuffer::new(2, io));
        buffer.write(b"ab").unwrap();
        let writer = {
            let buffer = buffer.clone();
            thread::spawn(move || buffer.write(b"cd").unwrap_err().kind())
        };

        thread::sleep(Duration::from_millis(50));
        buffer.shutdown();
        assert_eq!(io::ErrorKind::Interrupted, writer.join().unwrap());
    }

    #[test]
    fn output_buffer_rejects_write_after_close() {
        let io = Arc::new(RecordingIo::default());
        let buffer = SharedOutputBuffer::new(8, io);
        buffer.close();
        assert_eq!(
            io::ErrorKind::BrokenPipe,
            buffer.write(b"x").unwrap_err().kind()
        );
    }
}
