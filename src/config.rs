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

//! Connection handler configuration

use std::collections::HashMap;
use std::time::Duration;

use crate::error::ConfigError;

/// Capacity in bytes of the shared content buffers (one input, one output)
/// allocated per connection.
pub const CONTENT_BUFFER_SIZE: &str = "content-buffer-size";

/// Milliseconds to wait for a `100 Continue` interim response before
/// sending the request body anyway.
pub const WAIT_FOR_CONTINUE: &str = "wait-for-continue";

/// Idle socket timeout in milliseconds. Zero disables the timeout.
pub const SOCKET_TIMEOUT: &str = "socket-timeout";

const DEFAULT_CONTENT_BUFFER_SIZE: i64 = 20480;
const DEFAULT_WAIT_FOR_CONTINUE: i64 = 3000;
const DEFAULT_SOCKET_TIMEOUT: i64 = 0;

/// Parameter store keyed by name. Unset parameters fall back to their
/// documented defaults; range validation happens when the handler is
/// built, not when a value is stored.
#[derive(Debug, Clone, Default)]
pub struct Config {
    params: HashMap<&'static str, i64>,
}

impl Config {
    /// Creates a store holding only defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an integer parameter under `name`.
    pub fn set_int(&mut self, name: &'static str, value: i64) -> &mut Self {
        self.params.insert(name, value);
        self
    }

    /// Reads an integer parameter, falling back to `default`.
    #[inline]
    pub fn get_int(&self, name: &str, default: i64) -> i64 {
        self.params.get(name).copied().unwrap_or(default)
    }

    /// Validated capacity of the shared content buffers.
    pub fn content_buffer_size(&self) -> Result<usize, ConfigError> {
        let value = self.get_int(CONTENT_BUFFER_SIZE, DEFAULT_CONTENT_BUFFER_SIZE);
        if value <= 0 {
            return Err(ConfigError::InvalidParam {
                name: CONTENT_BUFFER_SIZE,
                value,
            });
        }
        Ok(value as usize)
    }

    /// Validated wait-for-continue interval.
    pub fn wait_for_continue(&self) -> Result<Duration, ConfigError> {
        let value = self.get_int(WAIT_FOR_CONTINUE, DEFAULT_WAIT_FOR_CONTINUE);
        if value <= 0 {
            return Err(ConfigError::InvalidParam {
                name: WAIT_FOR_CONTINUE,
                value,
            });
        }
        Ok(Duration::from_millis(value as u64))
    }

    /// Validated idle socket timeout in milliseconds. Zero means no timeout.
    pub fn socket_timeout_ms(&self) -> Result<u64, ConfigError> {
        let value = self.get_int(SOCKET_TIMEOUT, DEFAULT_SOCKET_TIMEOUT);
        if value < 0 {
            return Err(ConfigError::InvalidParam {
                name: SOCKET_TIMEOUT,
                value,
            });
        }
        Ok(value as u64)
    }
}
