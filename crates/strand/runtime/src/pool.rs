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
use std::sync::atomic::{AtomicBool, AtomicI8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use strand_common::{DispatchError, DispatchResult};
use strand_core::containers::{BoundedStack, PriorityQueue};
use strand_core::queue::DispatchQueue;
use strand_core::{DispatchQueueRef, Promise, WorkItem};

use crate::broker::{Parked, ThreadBroker, ThreadVelocity};
use crate::worker::{self, DispatchJob, DispatchWorker, WorkerHost};

/// Shape of an elastic priority thread pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Workers the pool keeps parked for itself even when idle
    pub min_reserved: usize,
    /// Upper bound on concurrently assigned workers
    pub max_parallel: usize,
    /// Highest priority level; the pool exposes `max_priority + 1` queues
    pub max_priority: usize,
    /// Total items the priority inbox will hold before refusing
    pub inbox_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_reserved: 0,
            max_parallel: num_cpus::get(),
            max_priority: 0,
            inbox_capacity: 100_000,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> DispatchResult<()> {
        if self.max_parallel == 0 {
            return Err(DispatchError::InvalidArgument("max_parallel must be at least 1"));
        }
        if self.min_reserved > self.max_parallel {
            return Err(DispatchError::InvalidArgument("min_reserved exceeds max_parallel"));
        }
        if self.inbox_capacity == 0 {
            return Err(DispatchError::InvalidArgument("inbox_capacity must be at least 1"));
        }
        Ok(())
    }
}

/// Relaxed counters describing pool traffic.
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Accepted submissions across all paths
    pub submitted: AtomicUsize,
    /// Submissions pushed straight onto the submitting worker's deque
    pub fast_path: AtomicUsize,
    /// Submissions handed directly to a parked reserve worker
    pub direct_dispatch: AtomicUsize,
    /// Submissions that went through the priority inbox
    pub enqueued: AtomicUsize,
    /// Items stolen between this pool's workers
    pub stolen: AtomicUsize,
    /// Items recovered from dying workers
    pub surfaced: AtomicUsize,
    /// Submissions refused by a saturated inbox
    pub saturated: AtomicUsize,
}

pub(crate) struct PoolShared {
    config: PoolConfig,
    broker: ThreadBroker,
    inbox: PriorityQueue<WorkItem>,
    reserve: BoundedStack<Parked>,
    active: Mutex<Vec<Option<Arc<DispatchWorker>>>>,
    thread_count: AtomicUsize,
    velocity: AtomicI8,
    disposed: AtomicBool,
    facets: OnceLock<Vec<Arc<PoolFacet>>>,
    stats: PoolStats,
    self_weak: Weak<PoolShared>,
}

/// One priority level of a pool, presented as a dispatch queue.
pub struct PoolFacet {
    pool: Weak<PoolShared>,
    priority: usize,
}

impl PoolFacet {
    pub fn priority(&self) -> usize {
        self.priority
    }
}

impl DispatchQueue for PoolFacet {
    fn try_submit(&self, item: WorkItem) -> DispatchResult<()> {
        match self.pool.upgrade() {
            Some(pool) => pool.try_submit(self.priority, item),
            None => Err(DispatchError::Disposed("priority thread pool")),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Elastic priority thread pool: one host multiplexing `max_priority + 1`
/// dispatch queues over a dynamic set of work-stealing workers obtained from
/// the broker.
pub struct PriorityThreadPool {
    shared: Arc<PoolShared>,
}

impl PriorityThreadPool {
    pub fn new(broker: &ThreadBroker, config: PoolConfig) -> DispatchResult<Self> {
        config.validate()?;

        let shared = Arc::new_cyclic(|self_weak| PoolShared {
            inbox: PriorityQueue::new(config.max_priority + 1, config.inbox_capacity),
            reserve: BoundedStack::new(config.min_reserved),
            active: Mutex::new(Vec::new()),
            thread_count: AtomicUsize::new(0),
            velocity: AtomicI8::new(0),
            disposed: AtomicBool::new(false),
            facets: OnceLock::new(),
            stats: PoolStats::default(),
            broker: broker.clone(),
            config,
            self_weak: self_weak.clone(),
        });

        let facets: Vec<Arc<PoolFacet>> = (0..=shared.config.max_priority)
            .map(|priority| {
                Arc::new(PoolFacet {
                    pool: Arc::downgrade(&shared),
                    priority,
                })
            })
            .collect();
        let _ = shared.facets.set(facets);

        let host: Arc<dyn WorkerHost> = Arc::clone(&shared) as Arc<dyn WorkerHost>;
        broker.register_host(&host);

        // Populate the host reserve up front; failure here is fatal for the
        // pool, per the guaranteed-request contract.
        if shared.config.min_reserved > 0 {
            let reserve_shared = Arc::clone(&shared);
            broker.request_thread(shared.config.min_reserved, &mut |worker, pending| {
                let host: Arc<dyn WorkerHost> = Arc::clone(&reserve_shared) as Arc<dyn WorkerHost>;
                worker.set_host(Some(&host));
                if let Err(parked) = reserve_shared.reserve.try_push(Parked { worker, pending }) {
                    reserve_shared.broker.release_thread(&parked.worker, parked.pending);
                }
            })?;
        }

        Ok(Self { shared })
    }

    /// The dispatch queue for one priority level.
    pub fn queue(&self, priority: usize) -> DispatchResult<DispatchQueueRef> {
        let facets = self.shared.facets.get().expect("facets are set at construction");
        facets
            .get(priority)
            .map(|facet| Arc::clone(facet) as DispatchQueueRef)
            .ok_or(DispatchError::InvalidArgument("priority out of range"))
    }

    pub fn thread_count(&self) -> usize {
        self.shared.thread_count.load(Ordering::Acquire)
    }

    pub fn reserved_workers(&self) -> usize {
        self.shared.reserve.len()
    }

    pub fn pending_items(&self) -> usize {
        self.shared.inbox.len()
    }

    pub fn stats(&self) -> &PoolStats {
        &self.shared.stats
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }

    /// Stop accepting work, release reserved workers, and wait (with bounded
    /// back-off) for active workers to drain back to the broker. Items still
    /// in the inbox are dropped. Fails with `Timeout` if workers are still
    /// assigned when `timeout` expires.
    pub fn dispose(&self, timeout: Duration) -> DispatchResult<()> {
        if self.shared.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shared.velocity.store(-1, Ordering::Release);

        while let Some(parked) = self.shared.reserve.pop() {
            self.shared.broker.release_thread(&parked.worker, parked.pending);
        }

        let deadline = Instant::now() + timeout;
        let mut backoff = Duration::from_millis(1);
        while self.shared.thread_count.load(Ordering::Acquire) != 0 {
            if Instant::now() >= deadline {
                return Err(DispatchError::Timeout(timeout));
            }
            std::thread::sleep(backoff);
            backoff = (backoff * 2).min(Duration::from_millis(100));
        }

        let dropped = self.shared.inbox.len();
        if dropped > 0 {
            tracing::warn!(dropped, "pool disposed with items still queued");
        }

        let host: Arc<dyn WorkerHost> = Arc::clone(&self.shared) as Arc<dyn WorkerHost>;
        self.shared.broker.unregister_host(&host);
        Ok(())
    }
}

impl PoolShared {
    fn facet(&self, priority: usize) -> DispatchQueueRef {
        let facets = self.facets.get().expect("facets are set at construction");
        Arc::clone(&facets[priority]) as DispatchQueueRef
    }

    fn try_submit(&self, priority: usize, item: WorkItem) -> DispatchResult<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(DispatchError::Disposed("priority thread pool"));
        }

        // Fast path: a worker of this pool submitting to the queue it is
        // already running for keeps the item on its own deque.
        let item = if self.current_thread_matches(priority) {
            match worker::local_push(item) {
                Ok(()) => {
                    self.stats.submitted.fetch_add(1, Ordering::Relaxed);
                    self.stats.fast_path.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(item) => item,
            }
        } else {
            item
        };

        // A parked reserve worker takes the item without touching the inbox
        if let Some(parked) = self.reserve.pop() {
            self.register_worker(&parked.worker);
            self.stats.submitted.fetch_add(1, Ordering::Relaxed);
            self.stats.direct_dispatch.fetch_add(1, Ordering::Relaxed);
            self.complete_job(parked.pending, priority, item);
            return Ok(());
        }

        match self.inbox.try_enqueue(priority, item) {
            Ok(()) => {
                self.stats.submitted.fetch_add(1, Ordering::Relaxed);
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                if self.thread_count.load(Ordering::Acquire) == 0 {
                    self.increase_thread_count();
                }
                Ok(())
            }
            Err(_refused) => {
                self.stats.saturated.fetch_add(1, Ordering::Relaxed);
                Err(DispatchError::QueueSaturated)
            }
        }
    }

    fn current_thread_matches(&self, priority: usize) -> bool {
        let Some(current_worker) = worker::current_worker() else {
            return false;
        };
        let Some(current_queue) = current_worker.current_queue() else {
            return false;
        };
        current_queue
            .as_any()
            .downcast_ref::<PoolFacet>()
            .is_some_and(|facet| facet.priority == priority && Weak::ptr_eq(&facet.pool, &self.self_weak))
    }

    fn complete_job(&self, pending: Promise<DispatchJob>, priority: usize, item: WorkItem) {
        let job = DispatchJob {
            item,
            queue: self.facet(priority),
        };
        if pending.complete(job).is_err() {
            tracing::error!("worker's pending result was already completed; item lost");
        }
    }

    fn register_worker(&self, worker: &Arc<DispatchWorker>) {
        let host: Arc<dyn WorkerHost> = self
            .self_weak
            .upgrade()
            .expect("pool is alive while registering workers") as Arc<dyn WorkerHost>;
        worker.set_host(Some(&host));

        let mut active = self.active.lock();
        let worker = Arc::clone(worker);
        if let Some(slot) = active.iter_mut().find(|slot| slot.is_none()) {
            *slot = Some(worker);
        } else {
            active.push(Some(worker));
        }
        self.thread_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Detach a worker whose deque has run dry. It parks in the host reserve
    /// when there is room, otherwise it goes back to the broker.
    fn remove_worker(&self, worker: &Arc<DispatchWorker>, pending: Promise<DispatchJob>) {
        debug_assert_eq!(worker.queued_items(), 0, "removed worker must have an empty deque");

        {
            let mut active = self.active.lock();
            if let Some(slot) = active
                .iter_mut()
                .find(|slot| slot.as_ref().is_some_and(|candidate| candidate.id() == worker.id()))
            {
                *slot = None;
                self.thread_count.fetch_sub(1, Ordering::AcqRel);
            }
        }

        if !self.disposed.load(Ordering::Acquire) {
            worker.set_current_queue(None);
            match self.reserve.try_push(Parked {
                worker: Arc::clone(worker),
                pending,
            }) {
                Ok(()) => return,
                Err(parked) => {
                    self.broker.release_thread(&parked.worker, parked.pending);
                }
            }
        } else {
            self.broker.release_thread(worker, pending);
        }
    }

    /// Ask for one more worker, preferring the host reserve over the broker.
    /// A no-op while growth is already in flight or the pool is at
    /// `max_parallel`.
    fn increase_thread_count(&self) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        if self.thread_count.load(Ordering::Acquire) >= self.config.max_parallel {
            return;
        }
        if self.velocity.swap(1, Ordering::AcqRel) > 0 {
            return;
        }

        if let Some(parked) = self.reserve.pop() {
            self.thread_ready(parked.worker, parked.pending);
            return;
        }

        let pool = self.self_weak.clone();
        let delivered = self
            .broker
            .request_thread(0, &mut |worker, pending| {
                if let Some(pool) = pool.upgrade() {
                    pool.thread_ready(worker, pending);
                }
            })
            .unwrap_or(0);
        if delivered == 0 {
            let _ = self.velocity.compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire);
        }
    }

    /// A worker became available for this pool: put it to work if there is
    /// any, otherwise hand it back unchanged.
    fn thread_ready(&self, worker: Arc<DispatchWorker>, pending: Promise<DispatchJob>) {
        if !self.disposed.load(Ordering::Acquire)
            && self.velocity.load(Ordering::Acquire) >= 0
            && self.thread_count.load(Ordering::Acquire) < self.config.max_parallel
        {
            if let Some((priority, item)) = self.inbox.try_dequeue() {
                self.register_worker(&worker);
                let _ = self.velocity.compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire);
                self.complete_job(pending, priority, item);
                return;
            }
        }
        let _ = self.velocity.compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire);
        // No work after all; keep the reserve floor topped up before falling
        // back to the broker.
        if self.disposed.load(Ordering::Acquire) {
            self.broker.release_thread(&worker, pending);
            return;
        }
        match self.reserve.try_push(Parked { worker, pending }) {
            Ok(()) => {}
            Err(parked) => self.broker.release_thread(&parked.worker, parked.pending),
        }
    }
}

impl WorkerHost for PoolShared {
    fn request_work_item(&self, worker: &Arc<DispatchWorker>, pending: Promise<DispatchJob>) {
        if self.disposed.load(Ordering::Acquire) {
            self.remove_worker(worker, pending);
            return;
        }

        // Consume one decrease directive by letting this worker go
        if self.velocity.load(Ordering::Acquire) < 0 {
            self.velocity.store(0, Ordering::Release);
            self.remove_worker(worker, pending);
            return;
        }

        if let Some((priority, item)) = self.inbox.try_dequeue() {
            self.complete_job(pending, priority, item);
            return;
        }

        // Steal from a sibling
        let victims: Vec<Arc<DispatchWorker>> = self.active.lock().iter().flatten().cloned().collect();
        for victim in victims {
            if victim.id() == worker.id() {
                continue;
            }
            if let Some(item) = victim.try_steal() {
                self.stats.stolen.fetch_add(1, Ordering::Relaxed);
                let queue = victim.current_queue().unwrap_or_else(|| self.facet(0));
                let job = DispatchJob { item, queue };
                if pending.complete(job).is_err() {
                    tracing::error!("worker's pending result was already completed; stolen item lost");
                }
                return;
            }
        }

        // A producer may have raced the steal scan
        if let Some((priority, item)) = self.inbox.try_dequeue() {
            self.complete_job(pending, priority, item);
            return;
        }

        self.remove_worker(worker, pending);
    }

    fn surface_items(&self, items: Vec<WorkItem>) {
        let priority = self.config.max_priority;
        for item in items {
            if self.inbox.try_enqueue(priority, item).is_err() {
                tracing::error!("inbox refused a surfaced item; work lost");
            } else {
                self.stats.surfaced.fetch_add(1, Ordering::Relaxed);
            }
        }
        if !self.inbox.is_empty() && self.thread_count.load(Ordering::Acquire) == 0 {
            self.increase_thread_count();
        }
    }

    fn pending_items(&self) -> usize {
        self.inbox.len()
    }

    fn thread_count(&self) -> usize {
        self.thread_count.load(Ordering::Acquire)
    }

    fn throttle(&self, velocity: ThreadVelocity) {
        match velocity {
            ThreadVelocity::Increase => self.increase_thread_count(),
            ThreadVelocity::Maintain => self.velocity.store(0, Ordering::Release),
            ThreadVelocity::Decrease => self.velocity.store(-1, Ordering::Release),
        }
    }
}

impl Drop for PriorityThreadPool {
    fn drop(&mut self) {
        if !self.shared.disposed.load(Ordering::Acquire) {
            if let Err(error) = self.dispose(Duration::from_secs(5)) {
                tracing::warn!(%error, "pool disposal on drop did not finish cleanly");
            }
        }
    }
}
