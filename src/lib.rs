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

#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_imports
)]
// Disallow warnings in examples.
#![doc(test(attr(deny(warnings))))]

//! sluse is a low-level non-blocking HTTP/1.x client intended for personal
//! learning purposes.
//!
//! A single I/O thread ([`reactor::Reactor`]) reacts to socket readiness
//! events and never blocks; a pool of workers ([`executor::WorkerPool`])
//! produces request bodies and consumes response bodies with ordinary
//! blocking stream semantics. The two regimes meet in a pair of bounded
//! shared buffers per connection ([`buffer`]), whose backpressure keeps a
//! connection's memory flat no matter how large the bodies are, and in the
//! per-connection state machine driven by [`handler::ClientHandler`].
//!
//! ## Examples
//!
//! A complete fetch can be found in the `demos` directory of the source
//! code.

pub mod buffer;
pub mod codec;
pub mod config;
pub mod conn;
pub mod context;
pub mod error;
pub mod executor;
pub mod handler;
pub mod message;
pub mod protocol;
pub mod reactor;
pub mod state;
mod wire;
