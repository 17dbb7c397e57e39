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

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use strand_common::{DispatchError, DispatchResult};

use crate::env::TaskEnv;

type Continuation<T> = Box<dyn FnOnce(Promise<T>) + Send>;

enum PromiseState<T> {
    Pending,
    // Option so `wait` can move the value out exactly once
    Returned(Option<T>),
    Thrown(DispatchError),
}

struct PromiseShared<T> {
    state: PromiseState<T>,
    continuation: Option<Continuation<T>>,
    env: Option<TaskEnv>,
}

struct PromiseInner<T> {
    shared: Mutex<PromiseShared<T>>,
    done: Condvar,
}

/// Single-shot result handle: `pending` until exactly one `complete` or
/// `fail`, after which re-completion is refused. At most one continuation may
/// be attached; it fires exactly once: inline on the completing thread, or,
/// when the promise carries a task environment with a current queue, bound to that
/// environment and submitted to its queue.
pub struct Promise<T> {
    inner: Arc<PromiseInner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> Promise<T> {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A promise whose continuation will run under `env`, dispatched through
    /// the environment's current queue.
    pub fn with_env(env: TaskEnv) -> Self {
        Self::build(Some(env))
    }

    fn build(env: Option<TaskEnv>) -> Self {
        Self {
            inner: Arc::new(PromiseInner {
                shared: Mutex::new(PromiseShared {
                    state: PromiseState::Pending,
                    continuation: None,
                    env,
                }),
                done: Condvar::new(),
            }),
        }
    }

    /// Complete with a value. Fails with `ResultAlreadyCompleted` if the
    /// promise is already terminal.
    pub fn complete(&self, value: T) -> DispatchResult<()> {
        self.transition(PromiseState::Returned(Some(value)))
    }

    /// Complete with an error. Fails with `ResultAlreadyCompleted` if the
    /// promise is already terminal.
    pub fn fail(&self, error: DispatchError) -> DispatchResult<()> {
        self.transition(PromiseState::Thrown(error))
    }

    fn transition(&self, terminal: PromiseState<T>) -> DispatchResult<()> {
        let continuation = {
            let mut shared = self.inner.shared.lock();
            if !matches!(shared.state, PromiseState::Pending) {
                return Err(DispatchError::ResultAlreadyCompleted);
            }
            shared.state = terminal;
            self.inner.done.notify_all();
            shared.continuation.take()
        };
        if let Some(continuation) = continuation {
            self.dispatch_continuation(continuation);
        }
        Ok(())
    }

    /// Attach the single allowed continuation. If the promise is already
    /// terminal the continuation fires immediately.
    pub fn when_done<F>(&self, continuation: F) -> DispatchResult<()>
    where
        F: FnOnce(Promise<T>) + Send + 'static,
    {
        let fire_now = {
            let mut shared = self.inner.shared.lock();
            if matches!(shared.state, PromiseState::Pending) {
                if shared.continuation.is_some() {
                    return Err(DispatchError::InvalidArgument("result already has a continuation"));
                }
                shared.continuation = Some(Box::new(continuation));
                None
            } else {
                Some(Box::new(continuation) as Continuation<T>)
            }
        };
        if let Some(continuation) = fire_now {
            self.dispatch_continuation(continuation);
        }
        Ok(())
    }

    fn dispatch_continuation(&self, continuation: Continuation<T>) {
        let env = self.inner.shared.lock().env.clone();
        let queue = env.as_ref().and_then(|e| e.current_queue());
        match (env, queue) {
            (Some(env), Some(queue)) => {
                let this = self.clone();
                let item = env.bind(move || continuation(this), None::<Promise<()>>);
                if !queue.submit(item) {
                    tracing::warn!("continuation queue refused the submission; continuation dropped");
                }
            }
            _ => continuation(self.clone()),
        }
    }

    /// Wait for the promise to become terminal without consuming its value.
    pub fn block(&self, timeout: Option<Duration>) -> DispatchResult<()> {
        let mut shared = self.inner.shared.lock();
        while matches!(shared.state, PromiseState::Pending) {
            match timeout {
                None => self.inner.done.wait(&mut shared),
                Some(limit) => {
                    if self.inner.done.wait_for(&mut shared, limit).timed_out() {
                        return Err(DispatchError::Timeout(limit));
                    }
                }
            }
        }
        Ok(())
    }

    /// Wait for completion and take the value. A thrown completion re-raises
    /// its error; the value can be taken exactly once.
    pub fn wait(&self, timeout: Option<Duration>) -> DispatchResult<T> {
        self.block(timeout)?;
        let mut shared = self.inner.shared.lock();
        match &mut shared.state {
            PromiseState::Returned(value) => value
                .take()
                .ok_or(DispatchError::InvalidArgument("result value already taken")),
            PromiseState::Thrown(error) => Err(error.clone()),
            PromiseState::Pending => unreachable!("block returned while pending"),
        }
    }

    pub fn is_done(&self) -> bool {
        !matches!(self.inner.shared.lock().state, PromiseState::Pending)
    }

    pub fn has_value(&self) -> bool {
        matches!(self.inner.shared.lock().state, PromiseState::Returned(_))
    }

    pub fn has_error(&self) -> bool {
        matches!(self.inner.shared.lock().state, PromiseState::Thrown(_))
    }

    /// The terminal error, if the promise failed.
    pub fn error(&self) -> Option<DispatchError> {
        match &self.inner.shared.lock().state {
            PromiseState::Thrown(error) => Some(error.clone()),
            _ => None,
        }
    }

    pub fn env(&self) -> Option<TaskEnv> {
        self.inner.shared.lock().env.clone()
    }

    pub fn set_env(&self, env: Option<TaskEnv>) {
        self.inner.shared.lock().env = env;
    }
}

impl<T: Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.inner.shared.lock();
        let state = match &shared.state {
            PromiseState::Pending => "pending",
            PromiseState::Returned(_) => "returned",
            PromiseState::Thrown(_) => "thrown",
        };
        f.debug_struct("Promise").field("state", &state).finish()
    }
}
