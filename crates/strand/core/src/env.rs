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
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use strand_common::DispatchError;

use crate::item::{WorkItem, describe_panic};
use crate::promise::Promise;
use crate::queue::DispatchQueueRef;

thread_local! {
    static CURRENT_ENV: RefCell<Option<TaskEnv>> = const { RefCell::new(None) };
}

/// Values in the environment's state bag
pub type StateValue = Arc<dyn Any + Send + Sync>;

/// A unique identifier for task environments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnvId(pub u64);

impl EnvId {
    /// Generate a new unique environment ID
    pub fn new() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for EnvId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "env-{}", self.0)
    }
}

struct EnvInner {
    id: EnvId,
    state: Mutex<HashMap<String, StateValue>>,
    queue: Mutex<Option<DispatchQueueRef>>,
    cleanups: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

/// Ambient context that travels with every work item: a small state bag, a
/// reference to the current dispatch queue, and cleanup actions that run when
/// a bound execution finishes.
///
/// Cloning the handle shares the environment; [`TaskEnv::snapshot`] makes a
/// logical copy.
#[derive(Clone)]
pub struct TaskEnv {
    inner: Arc<EnvInner>,
}

impl TaskEnv {
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn with_queue(queue: DispatchQueueRef) -> Self {
        Self::build(Some(queue))
    }

    fn build(queue: Option<DispatchQueueRef>) -> Self {
        Self {
            inner: Arc::new(EnvInner {
                id: EnvId::new(),
                state: Mutex::new(HashMap::new()),
                queue: Mutex::new(queue),
                cleanups: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The environment installed on the calling thread, if any.
    pub fn current() -> Option<TaskEnv> {
        CURRENT_ENV.with(|slot| slot.borrow().clone())
    }

    pub fn id(&self) -> EnvId {
        self.inner.id
    }

    /// Logical copy: duplicates the state bag and the queue reference under
    /// a fresh id. Cleanup actions are single-run and are not copied.
    pub fn snapshot(&self) -> TaskEnv {
        let copy = Self::build(self.current_queue());
        {
            let source = self.inner.state.lock();
            let mut target = copy.inner.state.lock();
            target.extend(source.iter().map(|(k, v)| (k.clone(), Arc::clone(v))));
        }
        copy
    }

    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.inner.state.lock().insert(key.into(), Arc::new(value));
    }

    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let state = self.inner.state.lock();
        state.get(key).cloned().and_then(|v| v.downcast::<T>().ok())
    }

    pub fn remove(&self, key: &str) -> Option<StateValue> {
        self.inner.state.lock().remove(key)
    }

    pub fn current_queue(&self) -> Option<DispatchQueueRef> {
        self.inner.queue.lock().clone()
    }

    pub fn set_current_queue(&self, queue: Option<DispatchQueueRef>) {
        *self.inner.queue.lock() = queue;
    }

    /// Register an action to run when the current bound execution exits,
    /// normally or not. Actions run in reverse registration order.
    pub fn attach_cleanup<F>(&self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.cleanups.lock().push(Box::new(action));
    }

    fn take_cleanups(&self) -> Vec<Box<dyn FnOnce() + Send>> {
        std::mem::take(&mut *self.inner.cleanups.lock())
    }

    /// Wrap a callback so that running the produced work item installs this
    /// environment, executes the callback, and, when a promise is supplied,
    /// completes it with the callback's value, or fails it if the callback
    /// panics. Without a promise a panic propagates to the work item bracket,
    /// which logs and swallows it.
    pub fn bind<T, F>(&self, callback: F, promise: Option<Promise<T>>) -> WorkItem
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        match promise {
            None => WorkItem::with_env(
                move || {
                    callback();
                },
                self.clone(),
            ),
            Some(promise) => WorkItem::with_env(
                move || match catch_unwind(AssertUnwindSafe(callback)) {
                    Ok(value) => {
                        if promise.complete(value).is_err() {
                            tracing::warn!("bound promise was already completed");
                        }
                    }
                    Err(payload) => {
                        let message = describe_panic(&*payload);
                        let _ = promise.fail(DispatchError::Panicked(message));
                    }
                },
                self.clone(),
            ),
        }
    }
}

impl Default for TaskEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TaskEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskEnv")
            .field("id", &self.inner.id)
            .field("keys", &self.inner.state.lock().len())
            .finish()
    }
}

/// Scope guard bracketing a work item execution: installs an environment into
/// the thread-local slot and, on drop, restores the previous environment and
/// drains the installed environment's cleanup actions in reverse order.
pub(crate) struct EnvGuard {
    installed: Option<TaskEnv>,
    previous: Option<TaskEnv>,
}

impl EnvGuard {
    pub(crate) fn install(env: Option<TaskEnv>) -> Self {
        let previous = CURRENT_ENV.with(|slot| slot.replace(env.clone()));
        Self { installed: env, previous }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        CURRENT_ENV.with(|slot| {
            *slot.borrow_mut() = self.previous.take();
        });
        if let Some(env) = self.installed.take() {
            for action in env.take_cleanups().into_iter().rev() {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(action)) {
                    tracing::warn!(panic = %describe_panic(&*payload), "cleanup action panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_is_empty_outside_a_bracket() {
        assert!(TaskEnv::current().is_none());
    }

    #[test]
    fn test_bound_execution_installs_and_restores() {
        let env = TaskEnv::new();
        env.set("request-id", 7usize);
        let id = env.id();

        let item = env.bind(
            move || {
                let current = TaskEnv::current().expect("environment should be installed");
                assert_eq!(current.id(), id);
                assert_eq!(*current.get::<usize>("request-id").unwrap(), 7);
            },
            None::<Promise<()>>,
        );
        item.run().unwrap();
        assert!(TaskEnv::current().is_none());
    }

    #[test]
    fn test_snapshot_is_isolated() {
        let env = TaskEnv::new();
        env.set("key", 1u32);
        let copy = env.snapshot();
        assert_ne!(copy.id(), env.id());
        assert_eq!(*copy.get::<u32>("key").unwrap(), 1);

        copy.set("key", 2u32);
        assert_eq!(*env.get::<u32>("key").unwrap(), 1);
    }

    #[test]
    fn test_bind_completes_promise_with_value() {
        let env = TaskEnv::new();
        let promise = Promise::new();
        env.bind(|| 41 + 1, Some(promise.clone())).run().unwrap();
        assert_eq!(promise.wait(None).unwrap(), 42);
    }

    #[test]
    fn test_bind_fails_promise_on_panic() {
        let env = TaskEnv::new();
        let promise: Promise<()> = Promise::new();
        env.bind(|| panic!("broken"), Some(promise.clone())).run().unwrap();
        match promise.wait(None) {
            Err(DispatchError::Panicked(message)) => assert_eq!(message, "broken"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_nested_brackets_restore_outer_env() {
        let outer = TaskEnv::new();
        let inner = TaskEnv::new();
        let outer_id = outer.id();
        let inner_id = inner.id();

        let nested = inner.bind(
            move || {
                assert_eq!(TaskEnv::current().unwrap().id(), inner_id);
            },
            None::<Promise<()>>,
        );
        let item = outer.bind(
            move || {
                assert_eq!(TaskEnv::current().unwrap().id(), outer_id);
                nested.run().unwrap();
                assert_eq!(TaskEnv::current().unwrap().id(), outer_id);
            },
            None::<Promise<()>>,
        );
        item.run().unwrap();
    }
}
