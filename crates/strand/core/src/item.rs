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

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};

use strand_common::{DispatchError, DispatchResult};

use crate::env::{EnvGuard, TaskEnv};

/// An opaque unit of pending work: a callback plus the task environment
/// captured at submission. Immutable once enqueued.
pub struct WorkItem {
    callback: Box<dyn FnOnce() + Send + 'static>,
    env: Option<TaskEnv>,
}

impl WorkItem {
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            callback: Box::new(callback),
            env: None,
        }
    }

    pub fn with_env<F>(callback: F, env: TaskEnv) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            callback: Box::new(callback),
            env: Some(env),
        }
    }

    pub fn env(&self) -> Option<&TaskEnv> {
        self.env.as_ref()
    }

    /// Execute the item under its environment bracket: install the captured
    /// environment into the thread-local slot, run the callback, restore the
    /// prior environment, and drain the environment's cleanup actions in
    /// reverse order. Cleanups run even when the callback panics; the panic
    /// is reported as [`DispatchError::Panicked`].
    pub fn run(self) -> DispatchResult<()> {
        let WorkItem { callback, env } = self;
        let guard = EnvGuard::install(env);
        let outcome = catch_unwind(AssertUnwindSafe(callback));
        drop(guard);
        outcome.map_err(|payload| DispatchError::Panicked(describe_panic(&*payload)))
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem").field("env", &self.env.is_some()).finish()
    }
}

/// Render a panic payload for logging; panics carry either `&str` or
/// `String` in practice.
pub fn describe_panic(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_run_executes_callback() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let item = WorkItem::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(item.run().is_ok());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panic_is_reported_not_propagated() {
        let item = WorkItem::new(|| panic!("boom"));
        match item.run() {
            Err(DispatchError::Panicked(message)) => assert_eq!(message, "boom"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_cleanups_run_on_panic_in_reverse_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let env = TaskEnv::new();
        for tag in ["first", "second"] {
            let order = Arc::clone(&order);
            env.attach_cleanup(move || order.lock().unwrap().push(tag));
        }

        let item = WorkItem::with_env(|| panic!("boom"), env);
        assert!(item.run().is_err());
        assert_eq!(*order.lock().unwrap(), vec!["second", "first"]);
    }
}
