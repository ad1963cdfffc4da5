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

//! HTTP/1.x wire codec: response head parsing, request head encoding,
//! and the transfer codings bridging staging buffers to the content
//! ports.

use std::io::{self, Write};

use crate::codec::{ContentDecoder, ContentEncoder};
use crate::error::ProtocolError;
use crate::message::{Headers, RequestHead, ResponseHead, Version};

/// Growable byte buffer staging raw socket data. Bytes are appended at
/// the tail and consumed from the head; consumed space is reclaimed once
/// it dominates the allocation.
#[derive(Debug, Default)]
pub(crate) struct StagingBuf {
    buf: Vec<u8>,
    read: usize,
}

impl StagingBuf {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.buf.len() - self.read
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.buf[self.read..]
    }

    pub(crate) fn push_slice(&mut self, src: &[u8]) {
        self.buf.extend_from_slice(src);
    }

    pub(crate) fn consume(&mut self, n: usize) {
        self.read = (self.read + n).min(self.buf.len());
        if self.read == self.buf.len() {
            self.buf.clear();
            self.read = 0;
        } else if self.read > 4096 && self.read * 2 >= self.buf.len() {
            self.buf.drain(..self.read);
            self.read = 0;
        }
    }
}

impl Write for StagingBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.push_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[inline]
fn is_header_name_byte(b: u8) -> bool {
    matches!(b,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' | b'^' | b'_'
        | b'`' | b'|' | b'~')
        || b.is_ascii_alphanumeric()
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn parse_status_line(line: &[u8]) -> Result<(Version, u16, String), ProtocolError> {
    let version = if line.starts_with(b"HTTP/1.1") {
        Version::H1_1
    } else if line.starts_with(b"HTTP/1.0") {
        Version::H1_0
    } else {
        return Err(ProtocolError::Version);
    };

    let rest = &line[8..];
    if rest.first() != Some(&b' ') {
        return Err(ProtocolError::Status);
    }
    let rest = &rest[1..];
    if rest.len() < 3 || !rest[..3].iter().all(u8::is_ascii_digit) {
        return Err(ProtocolError::Status);
    }
    let status = (rest[0] - b'0') as u16 * 100 + (rest[1] - b'0') as u16 * 10 + (rest[2] - b'0') as u16;
    if status < 100 {
        return Err(ProtocolError::Status);
    }

    let reason = match rest.get(3) {
        None => String::new(),
        Some(b' ') => String::from_utf8_lossy(&rest[4..]).into_owned(),
        Some(_) => return Err(ProtocolError::Status),
    };
    Ok((version, status, reason))
}

fn parse_header_lines(mut section: &[u8]) -> Result<Headers, ProtocolError> {
    let mut headers = Headers::new();
    while !section.is_empty() {
        let end = section
            .windows(2)
            .position(|w| w == b"\r\n")
            .ok_or(ProtocolError::NewLine)?;
        let line = &section[..end];
        section = &section[end + 2..];

        if line.is_empty() {
            continue;
        }
        // obs-fold continuation lines are obsolete and not accepted
        if line[0] == b' ' || line[0] == b'\t' {
            return Err(ProtocolError::HeaderName);
        }
        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or(ProtocolError::HeaderName)?;
        let name = &line[..colon];
        if name.is_empty() || !name.iter().all(|&b| is_header_name_byte(b)) {
            return Err(ProtocolError::HeaderName);
        }
        let value = &line[colon + 1..];
        if value.iter().any(|&b| b == 0 || b == b'\r' || b == b'\n') {
            return Err(ProtocolError::HeaderValue);
        }
        let name = String::from_utf8_lossy(name).into_owned();
        let value = String::from_utf8_lossy(value).trim().to_owned();
        headers.add(name, value);
    }
    Ok(headers)
}

/// Parses one response head from `buf`, consuming it on success.
///
/// Returns `Ok(None)` while the head is still incomplete; fails with
/// [`ProtocolError::HeadTooLarge`] once more than `limit` bytes arrived
/// without completing it.
pub(crate) fn parse_response_head(
    buf: &mut StagingBuf,
    limit: usize,
) -> Result<Option<ResponseHead>, ProtocolError> {
    let data = buf.as_slice();
    let head_end = match find_head_end(data) {
        Some(end) => end,
        None => {
            if data.len() > limit {
                return Err(ProtocolError::HeadTooLarge);
            }
            return Ok(None);
        }
    };
    if head_end > limit {
        return Err(ProtocolError::HeadTooLarge);
    }

    let head = &data[..head_end - 4];
    let line_end = head
        .windows(2)
        .position(|w| w == b"\r\n")
        .unwrap_or(head.len());
    let (version, status, reason) = parse_status_line(&head[..line_end])?;
    let headers = if line_end < head.len() {
        parse_header_lines(&head[line_end + 2..])?
    } else {
        Headers::new()
    };

    buf.consume(head_end);
    Ok(Some(ResponseHead {
        version,
        status,
        reason,
        headers,
    }))
}

/// Serializes a request head into the write staging buffer.
pub(crate) fn encode_request_head(head: &RequestHead, dst: &mut StagingBuf) {
    // writes into a StagingBuf cannot fail
    let _ = write!(dst, "{} {} {}\r\n", head.method, head.target, head.version);
    for header in head.headers.iter() {
        let _ = write!(dst, "{}: {}\r\n", header.name, header.value);
    }
    dst.push_slice(b"\r\n");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChunkState {
    Size,
    Data { remaining: u64 },
    DataEnd,
    Trailer,
    Done,
}

/// Decodes response body framing into plain content bytes.
#[derive(Debug)]
pub(crate) enum TransferDecoder {
    /// `Content-Length` delimited body.
    Length { remaining: u64 },
    /// `Transfer-Encoding: chunked` body.
    Chunked { state: ChunkState },
    /// Body delimited by the peer closing the connection.
    UntilClose { done: bool },
}

impl TransferDecoder {
    pub(crate) fn length(len: u64) -> Self {
        Self::Length { remaining: len }
    }

    pub(crate) fn chunked() -> Self {
        Self::Chunked {
            state: ChunkState::Size,
        }
    }

    pub(crate) fn until_close() -> Self {
        Self::UntilClose { done: false }
    }

    pub(crate) fn is_completed(&self) -> bool {
        match self {
            Self::Length { remaining } => *remaining == 0,
            Self::Chunked { state } => *state == ChunkState::Done,
            Self::UntilClose { done } => *done,
        }
    }

    fn decode(
        &mut self,
        src: &mut StagingBuf,
        peer_closed: bool,
        dst: &mut [u8],
    ) -> io::Result<usize> {
        match self {
            Self::Length { remaining } => {
                let n = (dst.len() as u64)
                    .min(*remaining)
                    .min(src.len() as u64) as usize;
                dst[..n].copy_from_slice(&src.as_slice()[..n]);
                src.consume(n);
                *remaining -= n as u64;
                Ok(n)
            }
            Self::Chunked { state } => decode_chunked(state, src, dst),
            Self::UntilClose { done } => {
                let n = dst.len().min(src.len());
                dst[..n].copy_from_slice(&src.as_slice()[..n]);
                src.consume(n);
                if n == 0 && peer_closed {
                    *done = true;
                }
                Ok(n)
            }
        }
    }
}

fn invalid_chunk() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, ProtocolError::Chunk.to_string())
}

fn decode_chunked(state: &mut ChunkState, src: &mut StagingBuf, dst: &mut [u8]) -> io::Result<usize> {
    let mut written = 0;
    loop {
        match state {
            ChunkState::Size => {
                let data = src.as_slice();
                let end = match data.windows(2).position(|w| w == b"\r\n") {
                    Some(end) => end,
                    None => return Ok(written),
                };
                let line = &data[..end];
                let digits = line
                    .iter()
                    .position(|&b| b == b';')
                    .map(|p| &line[..p])
                    .unwrap_or(line);
                if digits.is_empty() || !digits.iter().all(u8::is_ascii_hexdigit) {
                    return Err(invalid_chunk());
                }
                let mut size: u64 = 0;
                for &b in digits {
                    let digit = (b as char).to_digit(16).ok_or_else(invalid_chunk)? as u64;
                    size = size
                        .checked_mul(16)
                        .and_then(|s| s.checked_add(digit))
                        .ok_or_else(invalid_chunk)?;
                }
                src.consume(end + 2);
                *state = if size == 0 {
                    ChunkState::Trailer
                } else {
                    ChunkState::Data { remaining: size }
                };
            }
            ChunkState::Data { remaining } => {
                let n = ((dst.len() - written) as u64)
                    .min(*remaining)
                    .min(src.len() as u64) as usize;
                dst[written..written + n].copy_from_slice(&src.as_slice()[..n]);
                src.consume(n);
                *remaining -= n as u64;
                written += n;
                if *remaining == 0 {
                    *state = ChunkState::DataEnd;
                } else {
                    // out of source bytes or destination space
                    return Ok(written);
                }
            }
            ChunkState::DataEnd => {
                if src.len() < 2 {
                    return Ok(written);
                }
                if &src.as_slice()[..2] != b"\r\n" {
                    return Err(invalid_chunk());
                }
                src.consume(2);
                *state = ChunkState::Size;
            }
            ChunkState::Trailer => {
                let data = src.as_slice();
                let end = match data.windows(2).position(|w| w == b"\r\n") {
                    Some(end) => end,
                    None => return Ok(written),
                };
                src.consume(end + 2);
                if end == 0 {
                    *state = ChunkState::Done;
                }
            }
            ChunkState::Done => return Ok(written),
        }
    }
}

/// Non-blocking decoder view handed to the handler: transfer coding state
/// plus the read staging buffer it drains.
pub(crate) struct WireDecoder<'a> {
    pub(crate) coder: &'a mut TransferDecoder,
    pub(crate) src: &'a mut StagingBuf,
    pub(crate) peer_closed: bool,
}

impl ContentDecoder for WireDecoder<'_> {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        self.coder.decode(self.src, self.peer_closed, dst)
    }

    fn is_completed(&self) -> bool {
        self.coder.is_completed()
    }
}

/// Encodes request body content with its wire framing.
#[derive(Debug)]
pub(crate) enum TransferEncoder {
    /// `Content-Length` delimited body.
    Length { remaining: u64 },
    /// `Transfer-Encoding: chunked` body.
    Chunked { completed: bool },
}

impl TransferEncoder {
    pub(crate) fn length(len: u64) -> Self {
        Self::Length { remaining: len }
    }

    pub(crate) fn chunked() -> Self {
        Self::Chunked { completed: false }
    }

    pub(crate) fn is_completed(&self) -> bool {
        match self {
            Self::Length { remaining } => *remaining == 0,
            Self::Chunked { completed } => *completed,
        }
    }
}

// room kept for the chunk size line and surrounding CRLFs
const CHUNK_OVERHEAD: usize = 32;

/// Non-blocking encoder view handed to the handler: transfer coding state
/// plus the write staging buffer it fills, bounded by `limit`.
pub(crate) struct WireEncoder<'a> {
    pub(crate) coder: &'a mut TransferEncoder,
    pub(crate) dst: &'a mut StagingBuf,
    pub(crate) limit: usize,
}

impl ContentEncoder for WireEncoder<'_> {
    fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        let space = self.limit.saturating_sub(self.dst.len());
        match self.coder {
            TransferEncoder::Length { remaining } => {
                let n = (src.len() as u64).min(*remaining).min(space as u64) as usize;
                self.dst.push_slice(&src[..n]);
                *remaining -= n as u64;
                Ok(n)
            }
            TransferEncoder::Chunked { .. } => {
                if space <= CHUNK_OVERHEAD {
                    return Ok(0);
                }
                let n = src.len().min(space - CHUNK_OVERHEAD);
                if n == 0 {
                    return Ok(0);
                }
                let _ = write!(self.dst, "{n:x}\r\n");
                self.dst.push_slice(&src[..n]);
                self.dst.push_slice(b"\r\n");
                Ok(n)
            }
        }
    }

    fn complete(&mut self) -> io::Result<()> {
        match self.coder {
            TransferEncoder::Length { remaining } => {
                if *remaining > 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "request body shorter than declared length",
                    ));
                }
                Ok(())
            }
            TransferEncoder::Chunked { completed } => {
                if !*completed {
                    self.dst.push_slice(b"0\r\n\r\n");
                    *completed = true;
                }
                Ok(())
            }
        }
    }

    fn is_completed(&self) -> bool {
        self.coder.is_completed()
    }
}
