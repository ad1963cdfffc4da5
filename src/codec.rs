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

//! Content transfer ports between the wire and the shared buffers

use std::io;

/// Decodes response body bytes off the wire.
///
/// Implementations are driven by the I/O thread and must never block:
/// `read` returns `Ok(0)` when no further bytes are currently available.
pub trait ContentDecoder {
    /// Copies decoded content into `dst`, returning the number of bytes
    /// written. `Ok(0)` means no content is available right now; check
    /// [`ContentDecoder::is_completed`] to distinguish end of content.
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize>;

    /// Whether the decoder has produced the complete message body.
    fn is_completed(&self) -> bool;
}

/// Encodes request body bytes onto the wire.
///
/// Implementations are driven by the I/O thread and must never block:
/// `write` may accept fewer bytes than offered, or none at all, when the
/// underlying transport cannot take more.
pub trait ContentEncoder {
    /// Encodes content from `src`, returning the number of bytes accepted.
    fn write(&mut self, src: &[u8]) -> io::Result<usize>;

    /// Terminates the body, emitting any trailing framing.
    fn complete(&mut self) -> io::Result<()>;

    /// Whether the body has been fully encoded and terminated.
    fn is_completed(&self) -> bool;
}
