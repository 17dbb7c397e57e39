// Strand
// Copyright (C) 2025 Strandworks

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! The dispatch queue capability and its host-independent implementations.
//! Hosts contribute further implementations (priority pool facets,
//! worker-local fast paths) in the runtime crate.

use std::any::Any;
use std::sync::Arc;

use strand_common::DispatchResult;

use crate::env::TaskEnv;
use crate::item::WorkItem;
use crate::promise::Promise;

pub mod context;
pub mod immediate;
pub mod serial;

pub use context::{ContextBoundQueue, SyncContext};
pub use immediate::ImmediateQueue;
pub use serial::SerialQueue;

/// Capability for submitting work items.
///
/// Submission never blocks the caller beyond bounded bookkeeping. An accepted
/// item runs exactly once unless the process terminates first.
pub trait DispatchQueue: Send + Sync + 'static {
    /// Submit a work item, surfacing saturation and lifecycle refusals.
    fn try_submit(&self, item: WorkItem) -> DispatchResult<()>;

    /// Submit a work item; refusals are logged and reported as `false`.
    fn submit(&self, item: WorkItem) -> bool {
        match self.try_submit(item) {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!(%error, "dispatch queue refused a work item");
                false
            }
        }
    }

    /// Identity hook so fast paths can recognize a concrete queue behind the
    /// trait object.
    fn as_any(&self) -> &dyn Any;
}

pub type DispatchQueueRef = Arc<dyn DispatchQueue>;

/// Environment-aware submission helpers: thin wrappers over
/// [`TaskEnv::bind`] and the queue's `try_submit`.
pub trait SubmitExt {
    /// Submit with an explicit environment; the environment's current queue
    /// is pointed at this queue for the duration of the item.
    fn submit_with_env<T, F>(&self, callback: F, env: TaskEnv, promise: Option<Promise<T>>) -> DispatchResult<()>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static;

    /// Submit sharing the caller's current environment (a fresh one when the
    /// caller has none).
    fn submit_with_current_env<T, F>(&self, callback: F, promise: Option<Promise<T>>) -> DispatchResult<()>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static;

    /// Submit with a snapshot of the caller's current environment.
    fn submit_with_cloned_env<T, F>(&self, callback: F, promise: Option<Promise<T>>) -> DispatchResult<()>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static;
}

impl SubmitExt for DispatchQueueRef {
    fn submit_with_env<T, F>(&self, callback: F, env: TaskEnv, promise: Option<Promise<T>>) -> DispatchResult<()>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        env.set_current_queue(Some(Arc::clone(self)));
        self.try_submit(env.bind(callback, promise))
    }

    fn submit_with_current_env<T, F>(&self, callback: F, promise: Option<Promise<T>>) -> DispatchResult<()>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let env = TaskEnv::current().unwrap_or_default();
        self.submit_with_env(callback, env, promise)
    }

    fn submit_with_cloned_env<T, F>(&self, callback: F, promise: Option<Promise<T>>) -> DispatchResult<()>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let env = TaskEnv::current().map(|e| e.snapshot()).unwrap_or_default();
        self.submit_with_env(callback, env, promise)
    }
}
