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

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;

use strand_common::{DispatchError, DispatchResult};
use strand_core::{DispatchQueueRef, Promise, TaskEnv, WorkItem};

use crate::tick::{GlobalTick, TickRegistration};

const STATE_IDLE: u8 = 0;
const STATE_SCHEDULED: u8 = 1;
const STATE_FIRED: u8 = 2;

/// Observable state of a task timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Idle,
    Scheduled,
    Fired,
}

struct TimerShared {
    id: u64,
    state: AtomicU8,
    deadline: Mutex<Option<Instant>>,
    callback: Arc<dyn Fn() + Send + Sync>,
    queue: DispatchQueueRef,
    env: Option<TaskEnv>,
}

struct FactoryShared {
    tick: GlobalTick,
    timers: DashMap<u64, Arc<TimerShared>>,
    registration: Mutex<Option<TickRegistration>>,
    disposed: AtomicBool,
    next_id: AtomicU64,
}

/// One-shot timers driven by the global tick. When a timer's deadline passes
/// (against the tick's virtual `now`), its callback is submitted to the
/// timer's dispatch queue with the captured environment installed.
pub struct TaskTimerFactory {
    shared: Arc<FactoryShared>,
}

/// Handle to a scheduled timer. Dropping the handle does not cancel the
/// timer; use [`TaskTimer::change`] with `None` or [`TaskTimer::dispose`].
pub struct TaskTimer {
    shared: Arc<TimerShared>,
    factory: Weak<FactoryShared>,
}

impl TaskTimerFactory {
    pub fn new(tick: &GlobalTick) -> Self {
        let shared = Arc::new(FactoryShared {
            tick: tick.clone(),
            timers: DashMap::new(),
            registration: Mutex::new(None),
            disposed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        });

        let driver = Arc::downgrade(&shared);
        let registration = tick.add("task-timers", move |now, _elapsed| {
            if let Some(shared) = driver.upgrade() {
                shared.fire_due(now);
            }
        });
        *shared.registration.lock() = Some(registration);

        Self { shared }
    }

    /// Create a timer. `deadline` of `None` leaves it idle until
    /// [`TaskTimer::change`] arms it.
    pub fn schedule<F>(
        &self,
        deadline: Option<Instant>,
        callback: F,
        queue: DispatchQueueRef,
        env: Option<TaskEnv>,
    ) -> DispatchResult<TaskTimer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        if self.shared.disposed.load(Ordering::Acquire) {
            return Err(DispatchError::Disposed("task timer factory"));
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let state = if deadline.is_some() { STATE_SCHEDULED } else { STATE_IDLE };
        let timer = Arc::new(TimerShared {
            id,
            state: AtomicU8::new(state),
            deadline: Mutex::new(deadline),
            callback: Arc::new(callback),
            queue,
            env,
        });
        self.shared.timers.insert(id, Arc::clone(&timer));

        Ok(TaskTimer {
            shared: timer,
            factory: Arc::downgrade(&self.shared),
        })
    }

    pub fn pending_timers(&self) -> usize {
        self.shared.timers.len()
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }

    /// Unregister from the tick and drop every timer. Timers due after this
    /// point are dropped, not fired.
    pub fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(registration) = self.shared.registration.lock().take() {
            self.shared.tick.remove(registration);
        }
        self.shared.timers.clear();
    }
}

impl Drop for TaskTimerFactory {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl FactoryShared {
    fn fire_due(&self, now: Instant) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }

        let due: Vec<Arc<TimerShared>> = self
            .timers
            .iter()
            .filter(|entry| entry.value().is_due(now))
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for timer in due {
            if timer
                .state
                .compare_exchange(STATE_SCHEDULED, STATE_FIRED, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            // Someone may have re-armed or canceled since the scan
            match *timer.deadline.lock() {
                Some(at) if at <= now => {}
                Some(_) => {
                    timer.state.store(STATE_SCHEDULED, Ordering::Release);
                    continue;
                }
                None => {
                    timer.state.store(STATE_IDLE, Ordering::Release);
                    continue;
                }
            }

            let callback = Arc::clone(&timer.callback);
            let item = match &timer.env {
                Some(env) => env.bind(move || callback(), None::<Promise<()>>),
                None => WorkItem::new(move || callback()),
            };
            if !timer.queue.submit(item) {
                tracing::warn!(timer = timer.id, "timer's dispatch queue refused the callback");
            }
        }
    }
}

impl TimerShared {
    fn is_due(&self, now: Instant) -> bool {
        self.state.load(Ordering::Acquire) == STATE_SCHEDULED && self.deadline.lock().is_some_and(|at| at <= now)
    }
}

impl TaskTimer {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn state(&self) -> TimerState {
        match self.shared.state.load(Ordering::Acquire) {
            STATE_SCHEDULED => TimerState::Scheduled,
            STATE_FIRED => TimerState::Fired,
            _ => TimerState::Idle,
        }
    }

    /// Re-arm for a new deadline, or cancel with `None`. A firing already
    /// handed to the dispatch queue cannot be recalled.
    pub fn change(&self, deadline: Option<Instant>) {
        if self.factory.upgrade().is_none_or(|f| f.disposed.load(Ordering::Acquire)) {
            tracing::debug!(timer = self.shared.id, "change on a timer of a disposed factory ignored");
            return;
        }
        let mut slot = self.shared.deadline.lock();
        *slot = deadline;
        let next = if deadline.is_some() { STATE_SCHEDULED } else { STATE_IDLE };
        self.shared.state.store(next, Ordering::Release);
    }

    /// Remove the timer from its factory. An in-flight firing still runs.
    pub fn dispose(&self) {
        self.shared.state.store(STATE_IDLE, Ordering::Release);
        if let Some(factory) = self.factory.upgrade() {
            factory.timers.remove(&self.shared.id);
        }
    }
}
