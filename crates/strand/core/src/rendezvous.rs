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
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use strand_common::{DispatchError, DispatchResult};

use crate::item::WorkItem;
use crate::queue::DispatchQueueRef;

const EMPTY: u8 = 0;
const TOKEN: u8 = 1;
const ACTION: u8 = 2;
const USED: u8 = 3;
const ABANDONED: u8 = 4;

static PENDING: AtomicUsize = AtomicUsize::new(0);

/// Number of rendezvous events created but not yet fired or abandoned,
/// process-wide.
pub fn pending_rendezvous_count() -> usize {
    PENDING.load(Ordering::Acquire)
}

fn next_event_id() -> u64 {
    static NEXT_ID: AtomicU64 = AtomicU64::new(1);
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

#[cfg(feature = "rendezvous-capture")]
mod capture {
    use dashmap::DashMap;
    use std::sync::OnceLock;

    fn map() -> &'static DashMap<u64, String> {
        static CAPTURED: OnceLock<DashMap<u64, String>> = OnceLock::new();
        CAPTURED.get_or_init(DashMap::new)
    }

    pub(super) fn record(id: u64, site: &std::panic::Location<'_>) {
        map().insert(id, site.to_string());
    }

    // Removal happens after the firing transition, so an entry can briefly
    // (or, when the process races teardown, permanently) outlive its event.
    // The pending counter, not this map, is authoritative.
    pub(super) fn forget(id: u64) {
        map().remove(&id);
    }

    /// Creation sites of events still present in the capture map.
    pub fn captured_sites() -> Vec<(u64, String)> {
        map().iter().map(|entry| (*entry.key(), entry.value().clone())).collect()
    }
}

#[cfg(feature = "rendezvous-capture")]
pub use capture::captured_sites;

struct RendezvousInner {
    id: u64,
    state: AtomicU8,
    // Transitions are serialized by this lock; the atomic state supports
    // lock-free inspection.
    slot: Mutex<Option<WorkItem>>,
    queue: Option<DispatchQueueRef>,
}

impl Drop for RendezvousInner {
    fn drop(&mut self) {
        match self.state.load(Ordering::Acquire) {
            USED | ABANDONED => {}
            _ => {
                PENDING.fetch_sub(1, Ordering::AcqRel);
                #[cfg(feature = "rendezvous-capture")]
                capture::forget(self.id);
            }
        }
    }
}

/// Single-use, order-independent rendezvous between one signaler and one
/// waiter. Whichever of `signal` and `wait` arrives second fires the waiting
/// action exactly once, either inline or on the pinned dispatch queue.
#[derive(Clone)]
pub struct RendezvousEvent {
    inner: Arc<RendezvousInner>,
}

impl RendezvousEvent {
    #[track_caller]
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Pin the fired action to a dispatch queue instead of running it inline
    /// on the second-arriving thread.
    #[track_caller]
    pub fn with_queue(queue: DispatchQueueRef) -> Self {
        Self::build(Some(queue))
    }

    #[track_caller]
    fn build(queue: Option<DispatchQueueRef>) -> Self {
        let id = next_event_id();
        PENDING.fetch_add(1, Ordering::AcqRel);
        #[cfg(feature = "rendezvous-capture")]
        capture::record(id, std::panic::Location::caller());
        Self {
            inner: Arc::new(RendezvousInner {
                id,
                state: AtomicU8::new(EMPTY),
                slot: Mutex::new(None),
                queue,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// True once both sides have rendezvoused.
    pub fn is_used(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == USED
    }

    /// Deposit the token. If a waiter is already registered, its action fires
    /// now. A second signal fails with `RendezvousAlreadyBound`.
    pub fn signal(&self) -> DispatchResult<()> {
        let action = {
            let mut slot = self.inner.slot.lock();
            match self.inner.state.load(Ordering::Acquire) {
                EMPTY => {
                    self.inner.state.store(TOKEN, Ordering::Release);
                    return Ok(());
                }
                ACTION => {
                    self.inner.state.store(USED, Ordering::Release);
                    slot.take().expect("waiting rendezvous must hold an action")
                }
                TOKEN | USED => return Err(DispatchError::RendezvousAlreadyBound),
                _ => return Err(DispatchError::Disposed("rendezvous event")),
            }
        };
        self.fire(action);
        Ok(())
    }

    /// Register the waiting action. If the token is already present, the
    /// action fires now. A second waiter fails with
    /// `RendezvousAlreadyBound`.
    pub fn wait(&self, action: WorkItem) -> DispatchResult<()> {
        self.rendezvous_wait(action).map(|_| ())
    }

    /// Like [`RendezvousEvent::wait`], reporting whether the action fired
    /// immediately because the token was already present.
    pub fn is_ready_or_wait(&self, action: WorkItem) -> DispatchResult<bool> {
        self.rendezvous_wait(action)
    }

    fn rendezvous_wait(&self, action: WorkItem) -> DispatchResult<bool> {
        let action = {
            let mut slot = self.inner.slot.lock();
            match self.inner.state.load(Ordering::Acquire) {
                EMPTY => {
                    *slot = Some(action);
                    self.inner.state.store(ACTION, Ordering::Release);
                    return Ok(false);
                }
                TOKEN => {
                    self.inner.state.store(USED, Ordering::Release);
                    action
                }
                ACTION | USED => return Err(DispatchError::RendezvousAlreadyBound),
                _ => return Err(DispatchError::Disposed("rendezvous event")),
            }
        };
        self.fire(action);
        Ok(true)
    }

    /// Clear an unpaired rendezvous, releasing its pending count. Abandoning
    /// a used event is a no-op.
    pub fn abandon(&self) {
        let mut slot = self.inner.slot.lock();
        match self.inner.state.load(Ordering::Acquire) {
            USED | ABANDONED => {}
            _ => {
                *slot = None;
                self.inner.state.store(ABANDONED, Ordering::Release);
                PENDING.fetch_sub(1, Ordering::AcqRel);
                #[cfg(feature = "rendezvous-capture")]
                capture::forget(self.inner.id);
            }
        }
    }

    fn fire(&self, action: WorkItem) {
        PENDING.fetch_sub(1, Ordering::AcqRel);
        #[cfg(feature = "rendezvous-capture")]
        capture::forget(self.inner.id);

        match &self.inner.queue {
            Some(queue) => {
                if !queue.submit(action) {
                    tracing::warn!(event = self.inner.id, "rendezvous queue refused the action");
                }
            }
            None => {
                if let Err(error) = action.run() {
                    tracing::warn!(event = self.inner.id, %error, "rendezvous action failed");
                }
            }
        }
    }
}

impl Default for RendezvousEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RendezvousEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.inner.state.load(Ordering::Acquire) {
            EMPTY => "empty",
            TOKEN => "signaled",
            ACTION => "waiting",
            USED => "used",
            _ => "abandoned",
        };
        f.debug_struct("RendezvousEvent")
            .field("id", &self.inner.id)
            .field("state", &state)
            .finish()
    }
}
