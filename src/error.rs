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

//! Error types

use std::fmt::Display;
use std::io;

/// Represents violations of the HTTP protocol, either on the wire or
/// raised by a protocol processor.
#[derive(Debug, PartialEq, Eq)]
pub enum ProtocolError {
    /// Invalid HTTP version in the status line.
    Version,
    /// Invalid status code.
    Status,
    /// Invalid byte in a header name.
    HeaderName,
    /// Invalid byte in a header value.
    HeaderValue,
    /// Invalid or missing new line.
    NewLine,
    /// Invalid chunk framing in a chunked body.
    Chunk,
    /// Message head exceeds the staging limit.
    HeadTooLarge,
    /// A protocol processor rejected the message.
    Violation(&'static str),
}

impl Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Version => f.write_str("invalid HTTP version"),
            Self::Status => f.write_str("invalid status code"),
            Self::HeaderName => f.write_str("invalid byte in header name"),
            Self::HeaderValue => f.write_str("invalid byte in header value"),
            Self::NewLine => f.write_str("invalid or missing new line"),
            Self::Chunk => f.write_str("invalid chunk framing"),
            Self::HeadTooLarge => f.write_str("message head too large"),
            Self::Violation(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Represents invalid configuration, rejected when the handler is built.
#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// A named parameter holds a value outside its valid range.
    InvalidParam {
        /// Parameter name.
        name: &'static str,
        /// Rejected value.
        value: i64,
    },
    /// A required collaborator was not supplied to the builder.
    Missing(&'static str),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidParam { name, value } => {
                write!(f, "invalid value {value} for parameter {name}")
            }
            Self::Missing(what) => write!(f, "missing required collaborator: {what}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Failure surfaced to producers and consumers blocked on a shared buffer
/// when the owning connection shuts down.
#[inline]
pub(crate) fn interrupted(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, msg)
}
