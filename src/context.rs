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

//! Per-connection execution context

use std::any::Any;
use std::collections::HashMap;
use std::fmt::{self, Display};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

/// Attribute holding the connection the exchange runs on.
pub const HTTP_CONNECTION: &str = "http.connection";

/// Attribute holding the [`TargetHost`] of the exchange.
pub const HTTP_TARGET_HOST: &str = "http.target-host";

/// Attribute holding the head of the in-flight request.
pub const HTTP_REQUEST: &str = "http.request";

/// Attribute holding the head of the in-flight response.
pub const HTTP_RESPONSE: &str = "http.response";

/// Private attribute holding the connection state.
pub(crate) const CONN_STATE: &str = "conn.state";

/// Origin server an exchange targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetHost {
    /// Host name or literal address.
    pub host: String,
    /// Port number.
    pub port: u16,
}

impl TargetHost {
    /// Builds a target from a resolved socket address.
    pub fn from_addr(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

impl Display for TargetHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            80 => f.write_str(&self.host),
            port => write!(f, "{}:{}", self.host, port),
        }
    }
}

/// Name-keyed attribute map shared between the I/O thread and workers for
/// the lifetime of one connection.
///
/// Values are stored behind `Arc` so both sides can hold on to an
/// attribute without keeping the map locked.
#[derive(Default)]
pub struct ExchangeContext {
    attrs: Mutex<HashMap<&'static str, Arc<dyn Any + Send + Sync>>>,
}

impl ExchangeContext {
    /// Creates an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `name`, replacing any previous value.
    pub fn set<T: Any + Send + Sync>(&self, name: &'static str, value: T) {
        self.attrs
            .lock()
            .expect("context lock poisoned")
            .insert(name, Arc::new(value));
    }

    /// Reads the attribute stored under `name`, if present and of type `T`.
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        let attrs = self.attrs.lock().expect("context lock poisoned");
        attrs.get(name).cloned()?.downcast::<T>().ok()
    }

    /// Removes the attribute stored under `name`.
    pub fn remove(&self, name: &str) {
        self.attrs.lock().expect("context lock poisoned").remove(name);
    }

    /// Whether an attribute is stored under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.attrs
            .lock()
            .expect("context lock poisoned")
            .contains_key(name)
    }
}

impl fmt::Debug for ExchangeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let attrs = self.attrs.lock().expect("context lock poisoned");
        let mut keys: Vec<_> = attrs.keys().collect();
        keys.sort();
        f.debug_struct("ExchangeContext").field("attrs", &keys).finish()
    }
}
