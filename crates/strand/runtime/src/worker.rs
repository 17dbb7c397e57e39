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

use std::cell::RefCell;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use strand_core::containers::{WorkDeque, WorkStealer};
use strand_core::item::describe_panic;
use strand_core::{DispatchQueueRef, Promise, WorkItem};

use crate::broker::{BrokerShared, ThreadVelocity};

/// A work item paired with the dispatch queue the executing worker should
/// install as current. This is what completes a worker's pending result.
pub struct DispatchJob {
    pub item: WorkItem,
    pub queue: DispatchQueueRef,
}

impl fmt::Debug for DispatchJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchJob").finish_non_exhaustive()
    }
}

/// A scheduling entity that owns a priority inbox and a dynamic set of
/// workers. Workers call [`WorkerHost::request_work_item`] when their local
/// deque runs dry; the broker steers thread counts through
/// [`WorkerHost::throttle`].
pub trait WorkerHost: Send + Sync {
    /// Provide the worker's next job, park it, or remove it from the host.
    /// Must complete `pending` or hand it (with the worker) back to the host
    /// reserve or the broker.
    fn request_work_item(&self, worker: &Arc<DispatchWorker>, pending: Promise<DispatchJob>);

    /// Accept items recovered from a dying worker's deque.
    fn surface_items(&self, items: Vec<WorkItem>);

    fn pending_items(&self) -> usize;

    fn thread_count(&self) -> usize;

    /// Advisory thread-count directive from the broker's feedback loop.
    fn throttle(&self, velocity: ThreadVelocity);
}

/// A unique identifier for dispatch workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dispatch-worker-{}", self.0)
    }
}

const STATE_UNASSIGNED: u8 = 0;
const STATE_ASSIGNED: u8 = 1;
const STATE_SHUTTING_DOWN: u8 = 2;

/// Observable state of a worker thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Unassigned,
    Assigned,
    ShuttingDown,
}

/// Shared view of a long-lived worker thread. The deque's owner handle lives
/// in the thread's local state; everyone else sees the stealer, the state
/// word, and the weak host/broker references.
pub struct DispatchWorker {
    id: WorkerId,
    stealer: WorkStealer<WorkItem>,
    state: AtomicU8,
    host: Mutex<Weak<dyn WorkerHost>>,
    current_queue: Mutex<Option<DispatchQueueRef>>,
    pub(crate) broker: Weak<BrokerShared>,
}

impl DispatchWorker {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Approximate number of items in the worker's local deque.
    pub fn queued_items(&self) -> usize {
        self.stealer.len()
    }

    /// Steal one item from this worker's deque; used by siblings of the same
    /// host.
    pub fn try_steal(&self) -> Option<WorkItem> {
        self.stealer.steal()
    }

    pub fn current_queue(&self) -> Option<DispatchQueueRef> {
        self.current_queue.lock().clone()
    }

    pub fn host(&self) -> Option<Arc<dyn WorkerHost>> {
        self.host.lock().upgrade()
    }

    pub fn state(&self) -> WorkerState {
        match self.state.load(Ordering::Acquire) {
            STATE_ASSIGNED => WorkerState::Assigned,
            STATE_SHUTTING_DOWN => WorkerState::ShuttingDown,
            _ => WorkerState::Unassigned,
        }
    }

    pub(crate) fn set_host(&self, host: Option<&Arc<dyn WorkerHost>>) {
        let mut slot = self.host.lock();
        match host {
            Some(host) => {
                *slot = Arc::downgrade(host);
                self.state.store(STATE_ASSIGNED, Ordering::Release);
            }
            None => {
                *slot = Weak::<crate::pool::PoolShared>::new();
                self.state.store(STATE_UNASSIGNED, Ordering::Release);
            }
        }
    }

    pub(crate) fn set_current_queue(&self, queue: Option<DispatchQueueRef>) {
        *self.current_queue.lock() = queue;
    }

    fn mark_shutting_down(&self) {
        self.state.store(STATE_SHUTTING_DOWN, Ordering::Release);
    }
}

impl fmt::Debug for DispatchWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchWorker")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("queued_items", &self.queued_items())
            .finish()
    }
}

struct LocalWorker {
    worker: Arc<DispatchWorker>,
    deque: WorkDeque<WorkItem>,
}

thread_local! {
    static LOCAL_WORKER: RefCell<Option<LocalWorker>> = const { RefCell::new(None) };
}

/// The worker executing on the calling thread, if the calling thread is a
/// dispatch worker.
pub fn current_worker() -> Option<Arc<DispatchWorker>> {
    LOCAL_WORKER.with(|slot| slot.borrow().as_ref().map(|local| Arc::clone(&local.worker)))
}

/// Push onto the calling worker's local deque; hands the item back when the
/// calling thread is not a dispatch worker.
pub(crate) fn local_push(item: WorkItem) -> Result<(), WorkItem> {
    LOCAL_WORKER.with(|slot| match slot.borrow().as_ref() {
        Some(local) => {
            local.deque.push(item);
            Ok(())
        }
        None => Err(item),
    })
}

fn local_pop() -> Option<WorkItem> {
    LOCAL_WORKER.with(|slot| slot.borrow().as_ref().and_then(|local| local.deque.pop()))
}

/// Pop up to `limit` items from the calling worker's deque and re-submit
/// them to its current dispatch queue. The thread-local worker slot is
/// cleared for the duration so the re-submissions do not fast-path straight
/// back onto this deque. Returns the number of items moved.
pub fn evict_work_items(limit: usize) -> usize {
    let Some(local) = LOCAL_WORKER.with(|slot| slot.borrow_mut().take()) else {
        return 0;
    };
    let mut evicted = 0;
    if let Some(queue) = local.worker.current_queue() {
        while evicted < limit {
            let Some(item) = local.deque.pop() else { break };
            if queue.submit(item) {
                evicted += 1;
            } else {
                tracing::warn!(worker = %local.worker.id(), "eviction target refused an item; keeping it local");
                break;
            }
        }
    }
    LOCAL_WORKER.with(|slot| *slot.borrow_mut() = Some(local));
    evicted
}

/// Spawn a worker thread parked on a fresh pending job. The pair is what the
/// broker keeps in its reserve.
pub(crate) fn spawn(broker: Weak<BrokerShared>, id: u64) -> (Arc<DispatchWorker>, Promise<DispatchJob>) {
    let deque = WorkDeque::new();
    let worker = Arc::new(DispatchWorker {
        id: WorkerId(id),
        stealer: deque.stealer(),
        state: AtomicU8::new(STATE_UNASSIGNED),
        host: Mutex::new(Weak::<crate::pool::PoolShared>::new()),
        current_queue: Mutex::new(None),
        broker,
    });
    let pending: Promise<DispatchJob> = Promise::new();

    let thread_worker = Arc::clone(&worker);
    let first = pending.clone();
    std::thread::Builder::new()
        .name(worker.id.to_string())
        .spawn(move || run_worker(thread_worker, deque, first))
        .expect("could not spawn dispatch worker thread");

    (worker, pending)
}

fn run_worker(worker: Arc<DispatchWorker>, deque: WorkDeque<WorkItem>, first: Promise<DispatchJob>) {
    LOCAL_WORKER.with(|slot| {
        *slot.borrow_mut() = Some(LocalWorker {
            worker: Arc::clone(&worker),
            deque,
        });
    });

    let outcome = catch_unwind(AssertUnwindSafe(|| worker_loop(&worker, first)));
    if let Err(payload) = outcome {
        tracing::error!(worker = %worker.id(), panic = %describe_panic(&*payload), "worker loop aborted");
    }

    // Surface stranded items so an aborted loop loses no work
    let leftovers: Vec<WorkItem> = LOCAL_WORKER
        .with(|slot| slot.borrow_mut().take())
        .map(|local| std::iter::from_fn(|| local.deque.pop()).collect())
        .unwrap_or_default();
    if !leftovers.is_empty() {
        match worker.host() {
            Some(host) => host.surface_items(leftovers),
            None => tracing::error!(
                worker = %worker.id(),
                count = leftovers.len(),
                "stranded work items lost: worker has no host"
            ),
        }
    }

    worker.mark_shutting_down();
    if let Some(broker) = worker.broker.upgrade() {
        broker.worker_exited(&worker);
    }
    tracing::debug!(worker = %worker.id(), "worker thread exited");
}

fn worker_loop(worker: &Arc<DispatchWorker>, mut pending: Promise<DispatchJob>) {
    loop {
        let job = match pending.wait(None) {
            Ok(job) => job,
            Err(error) if error.is_shutdown() => {
                tracing::debug!(worker = %worker.id(), "worker received shutdown signal");
                return;
            }
            Err(error) => {
                tracing::warn!(worker = %worker.id(), %error, "worker's pending result failed");
                return;
            }
        };

        worker.set_current_queue(Some(Arc::clone(&job.queue)));
        execute(worker, job.item);
        while let Some(item) = local_pop() {
            execute(worker, item);
        }

        let next: Promise<DispatchJob> = Promise::new();
        match worker.host() {
            Some(host) => host.request_work_item(worker, next.clone()),
            None => match worker.broker.upgrade() {
                Some(broker) => broker.release_thread(worker, next.clone()),
                None => return,
            },
        }
        pending = next;
    }
}

fn execute(worker: &Arc<DispatchWorker>, item: WorkItem) {
    if let Err(error) = item.run() {
        tracing::warn!(worker = %worker.id(), %error, "work item failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_worker_thread_has_no_local_worker() {
        assert!(current_worker().is_none());
        assert_eq!(evict_work_items(16), 0);
    }

    #[test]
    fn test_local_push_refused_off_worker() {
        let item = WorkItem::new(|| {});
        assert!(local_push(item).is_err());
    }
}
