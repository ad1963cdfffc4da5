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

//! Worker dispatch
//!
//! Workers execute request-body and response-handler tasks, which block
//! on the shared buffers with ordinary stream semantics. Any executor
//! works as long as a blocked task does not prevent tasks for other
//! connections from running.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use tracing::{error, trace};

/// A unit of work dispatched to a worker.
pub type Task = Box<dyn FnOnce() + Send>;

/// Executes submitted tasks. Tasks for different connections must be able
/// to proceed in parallel; FIFO order per connection is not required.
pub trait Executor: Send + Sync {
    /// Queues `task` for execution.
    fn execute(&self, task: Task);
}

/// Pool of named OS threads draining a shared task channel.
pub struct WorkerPool {
    tasks: Sender<Task>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `threads` workers. At least two are required so a blocked
    /// request-body task cannot starve the response-handler task of the
    /// same connection.
    pub fn new(threads: usize) -> Self {
        let threads = threads.max(2);
        let (tasks, queue) = unbounded::<Task>();
        let mut workers = Vec::with_capacity(threads);
        for n in 0..threads {
            let queue = queue.clone();
            let handle = thread::Builder::new()
                .name(format!("sluse-worker-{n}"))
                .spawn(move || {
                    // recv error means the pool dropped its sender and is
                    // shutting down.
                    while let Ok(task) = queue.recv() {
                        if catch_unwind(AssertUnwindSafe(task)).is_err() {
                            error!("worker task panicked");
                        }
                    }
                    trace!("worker exiting");
                })
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }
        Self { tasks, workers }
    }
}

impl Executor for WorkerPool {
    fn execute(&self, task: Task) {
        if self.tasks.send(task).is_err() {
            error!("task dropped: worker pool is shut down");
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the channel lets each worker drain and exit.
        let (closed, _) = unbounded();
        self.tasks = closed;
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.len())
            .finish()
    }
}
