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

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sysinfo::System;

use strand_common::{DispatchConfig, DispatchError, DispatchResult};
use strand_core::Promise;

use crate::tick::{GlobalTick, TickRegistration};
use crate::worker::{self, DispatchJob, DispatchWorker, WorkerHost};

/// Advisory per-host thread-count directive emitted by the broker's CPU
/// feedback loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadVelocity {
    Decrease,
    Maintain,
    Increase,
}

/// A parked worker with the pending result its thread is blocked on.
/// Completing the result hands the worker its next job; failing it with
/// `WorkerShutdown` retires the thread.
pub(crate) struct Parked {
    pub(crate) worker: Arc<DispatchWorker>,
    pub(crate) pending: Promise<DispatchJob>,
}

struct BrokerInner {
    reserve: VecDeque<Parked>,
    hosts: Vec<Weak<dyn WorkerHost>>,
    allocated: usize,
    next_worker_id: u64,
}

struct CpuSampler {
    system: System,
    smoothed: f32,
}

impl CpuSampler {
    fn new() -> Self {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            tracing::warn!("CPU sampling unsupported on this platform; load will read as 0%");
        }
        Self {
            system: System::new(),
            smoothed: 0.0,
        }
    }

    fn sample(&mut self) -> f32 {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return 0.0;
        }
        self.system.refresh_cpu_usage();
        let raw = self.system.global_cpu_usage();
        self.smoothed = 0.7 * self.smoothed + 0.3 * raw;
        self.smoothed
    }
}

pub(crate) struct BrokerShared {
    config: DispatchConfig,
    inner: Mutex<BrokerInner>,
    sampler: Mutex<CpuSampler>,
    load_override: Mutex<Option<f32>>,
    // percent * 100, for lock-free reads
    smoothed_load: AtomicU32,
    last_activity: Mutex<Instant>,
    saturated_since: Mutex<Option<Instant>>,
    registration: Mutex<Option<TickRegistration>>,
    tick: GlobalTick,
    self_weak: Weak<BrokerShared>,
}

/// Process-wide allocator of dispatch worker threads.
///
/// The broker enforces the `max_threads` cap, keeps a reserve of parked
/// workers for fast allocation, and, from its global-tick callback, trims
/// an idle reserve and pushes CPU-load directives into every registered
/// host.
#[derive(Clone)]
pub struct ThreadBroker {
    shared: Arc<BrokerShared>,
}

impl ThreadBroker {
    pub fn new(config: DispatchConfig, tick: &GlobalTick) -> DispatchResult<Self> {
        config.validate()?;
        let shared = Arc::new_cyclic(|self_weak| BrokerShared {
            config,
            inner: Mutex::new(BrokerInner {
                reserve: VecDeque::new(),
                hosts: Vec::new(),
                allocated: 0,
                next_worker_id: 0,
            }),
            sampler: Mutex::new(CpuSampler::new()),
            load_override: Mutex::new(None),
            smoothed_load: AtomicU32::new(0),
            last_activity: Mutex::new(Instant::now()),
            saturated_since: Mutex::new(None),
            registration: Mutex::new(None),
            tick: tick.clone(),
            self_weak: self_weak.clone(),
        });

        let feedback = Arc::downgrade(&shared);
        let registration = tick.add("dispatch-broker", move |now, elapsed| {
            if let Some(shared) = feedback.upgrade() {
                shared.on_tick(now, elapsed);
            }
        });
        *shared.registration.lock() = Some(registration);

        Ok(Self { shared })
    }

    /// Obtain worker threads. With `min_required == 0` this is a
    /// best-effort single-thread request; otherwise exactly `min_required`
    /// threads are guaranteed or `InsufficientResources` is returned without
    /// delivering any. Returns the number of `(worker, pending)` pairs
    /// handed to `on_ready`.
    pub fn request_thread(
        &self,
        min_required: usize,
        on_ready: &mut dyn FnMut(Arc<DispatchWorker>, Promise<DispatchJob>),
    ) -> DispatchResult<usize> {
        self.shared.request_thread(min_required, on_ready)
    }

    /// Detach a worker from its host and park it in the reserve.
    pub fn release_thread(&self, worker: &Arc<DispatchWorker>, pending: Promise<DispatchJob>) {
        self.shared.release_thread(worker, pending);
    }

    pub fn register_host(&self, host: &Arc<dyn WorkerHost>) {
        let mut inner = self.shared.inner.lock();
        inner.hosts.push(Arc::downgrade(host));
    }

    pub fn unregister_host(&self, host: &Arc<dyn WorkerHost>) {
        let mut inner = self.shared.inner.lock();
        inner.hosts.retain(|candidate| match candidate.upgrade() {
            Some(existing) => !Arc::ptr_eq(&existing, host),
            None => false,
        });
    }

    pub fn allocated_threads(&self) -> usize {
        self.shared.inner.lock().allocated
    }

    pub fn reserve_size(&self) -> usize {
        self.shared.inner.lock().reserve.len()
    }

    pub fn host_count(&self) -> usize {
        self.shared.inner.lock().hosts.iter().filter(|h| h.upgrade().is_some()).count()
    }

    /// Smoothed CPU load in percent, as last sampled by the feedback loop.
    pub fn cpu_load(&self) -> f32 {
        self.shared.smoothed_load.load(Ordering::Acquire) as f32 / 100.0
    }

    /// Pin the load the feedback loop sees instead of sampling the system.
    /// Intended for tests and load drills.
    pub fn set_cpu_load_override(&self, load: Option<f32>) {
        *self.shared.load_override.lock() = load;
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.shared.config
    }

    /// Retire every parked worker and wait for the worker population to
    /// drain. Hosts must be disposed first; assigned workers keep their
    /// threads alive and will push this wait to its timeout.
    pub fn shutdown(&self, timeout: Duration) -> DispatchResult<()> {
        if let Some(registration) = self.shared.registration.lock().take() {
            self.shared.tick.remove(registration);
        }

        let deadline = Instant::now() + timeout;
        let mut backoff = Duration::from_millis(1);
        loop {
            loop {
                let parked = self.shared.inner.lock().reserve.pop_front();
                match parked {
                    Some(parked) => self.shared.shutdown_worker(parked),
                    None => break,
                }
            }
            if self.shared.inner.lock().allocated == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                let remaining = self.shared.inner.lock().allocated;
                tracing::warn!(remaining, "broker shutdown timed out with workers still allocated");
                return Err(DispatchError::Timeout(timeout));
            }
            std::thread::sleep(backoff);
            backoff = (backoff * 2).min(Duration::from_millis(100));
        }
    }
}

impl BrokerShared {
    fn request_thread(
        &self,
        min_required: usize,
        on_ready: &mut dyn FnMut(Arc<DispatchWorker>, Promise<DispatchJob>),
    ) -> DispatchResult<usize> {
        let mut ready = Vec::new();
        {
            let mut inner = self.inner.lock();
            if min_required > 0 && inner.allocated + min_required > self.config.max_threads {
                return Err(DispatchError::InsufficientResources {
                    requested: min_required,
                    limit: self.config.max_threads,
                });
            }

            let want = min_required.max(1);
            for _ in 0..want {
                if let Some(parked) = inner.reserve.pop_front() {
                    ready.push(parked);
                } else if inner.allocated < self.config.max_threads {
                    let parked = self.spawn_worker(&mut inner);
                    ready.push(parked);
                } else {
                    break;
                }
            }

            // Lazily refill the reserve toward its floor
            while inner.reserve.len() < self.config.min_reserved_dispatch_threads
                && inner.allocated < self.config.max_threads
            {
                let parked = self.spawn_worker(&mut inner);
                inner.reserve.push_back(parked);
            }

            *self.last_activity.lock() = Instant::now();
        }

        let delivered = ready.len();
        for parked in ready {
            on_ready(parked.worker, parked.pending);
        }
        Ok(delivered)
    }

    fn spawn_worker(&self, inner: &mut BrokerInner) -> Parked {
        inner.next_worker_id += 1;
        let (worker, pending) = worker::spawn(self.self_weak.clone(), inner.next_worker_id);
        inner.allocated += 1;
        tracing::debug!(worker = %worker.id(), allocated = inner.allocated, "spawned dispatch worker");
        Parked { worker, pending }
    }

    pub(crate) fn release_thread(&self, worker: &Arc<DispatchWorker>, pending: Promise<DispatchJob>) {
        worker.set_host(None);
        worker.set_current_queue(None);
        let mut inner = self.inner.lock();
        inner.reserve.push_back(Parked {
            worker: Arc::clone(worker),
            pending,
        });
        *self.last_activity.lock() = Instant::now();
    }

    pub(crate) fn worker_exited(&self, worker: &Arc<DispatchWorker>) {
        let mut inner = self.inner.lock();
        inner.allocated = inner.allocated.saturating_sub(1);
        tracing::debug!(worker = %worker.id(), allocated = inner.allocated, "dispatch worker retired");
    }

    fn shutdown_worker(&self, parked: Parked) {
        if parked.pending.fail(DispatchError::WorkerShutdown).is_err() {
            tracing::warn!(worker = %parked.worker.id(), "parked worker's result was already completed");
        }
    }

    fn on_tick(&self, now: Instant, _elapsed: Duration) {
        self.trim_idle_reserve(now);

        let load = {
            let overridden = *self.load_override.lock();
            overridden.unwrap_or_else(|| self.sampler.lock().sample())
        };
        self.smoothed_load.store((load * 100.0) as u32, Ordering::Release);

        let hosts: Vec<Arc<dyn WorkerHost>> = {
            let mut inner = self.inner.lock();
            inner.hosts.retain(|host| host.upgrade().is_some());
            inner.hosts.iter().filter_map(Weak::upgrade).collect()
        };
        if hosts.is_empty() {
            return;
        }

        if load >= self.config.cpu_saturation {
            let saturated_long_enough = {
                let mut since = self.saturated_since.lock();
                let started = *since.get_or_insert(now);
                now.duration_since(started) > self.config.saturation_limit
            };
            if saturated_long_enough {
                for host in hosts {
                    if host.pending_items() > 0 && host.thread_count() == 0 {
                        host.throttle(ThreadVelocity::Increase);
                    } else if host.thread_count() > 1 {
                        host.throttle(ThreadVelocity::Decrease);
                    }
                }
            }
        } else if load >= self.config.cpu_maintain {
            for host in hosts {
                if host.pending_items() > 0 && host.thread_count() == 0 {
                    host.throttle(ThreadVelocity::Increase);
                } else {
                    host.throttle(ThreadVelocity::Maintain);
                }
            }
        } else {
            *self.saturated_since.lock() = None;
            for host in hosts {
                if host.pending_items() > 0 {
                    host.throttle(ThreadVelocity::Increase);
                }
            }
        }
    }

    fn trim_idle_reserve(&self, now: Instant) {
        let idle = now.duration_since(*self.last_activity.lock());
        if idle <= self.config.idle_limit {
            return;
        }
        let parked = {
            let mut inner = self.inner.lock();
            if inner.reserve.len() > self.config.reserved_dispatch_threads {
                inner.reserve.pop_front()
            } else {
                None
            }
        };
        if let Some(parked) = parked {
            tracing::debug!(worker = %parked.worker.id(), "trimming idle reserve worker");
            self.shutdown_worker(parked);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config() -> DispatchConfig {
        DispatchConfig {
            max_threads: 8,
            reserved_dispatch_threads: 2,
            min_reserved_dispatch_threads: 1,
            tick_interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    fn start_broker(config: DispatchConfig) -> (GlobalTick, ThreadBroker) {
        let tick = GlobalTick::start(config.tick_interval);
        let broker = ThreadBroker::new(config, &tick).unwrap();
        (tick, broker)
    }

    #[test]
    fn test_rejects_invalid_config() {
        let tick = GlobalTick::start(Duration::from_millis(10));
        let config = DispatchConfig {
            max_threads: 0,
            ..Default::default()
        };
        assert!(ThreadBroker::new(config, &tick).is_err());
        tick.shutdown(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_request_thread_delivers_and_tops_up_reserve() {
        let (tick, broker) = start_broker(test_config());
        let mut delivered = Vec::new();
        let count = broker
            .request_thread(0, &mut |worker, pending| delivered.push((worker, pending)))
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(delivered.len(), 1);
        // The reserve was topped up to its floor
        assert!(broker.reserve_size() >= 1);
        assert!(broker.allocated_threads() >= 2);

        for (worker, pending) in delivered {
            broker.release_thread(&worker, pending);
        }
        broker.shutdown(Duration::from_secs(5)).unwrap();
        tick.shutdown(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_guaranteed_request_beyond_cap_fails() {
        let (tick, broker) = start_broker(test_config());
        let mut on_ready = |_worker: Arc<DispatchWorker>, _pending: Promise<DispatchJob>| {
            panic!("nothing should be delivered");
        };
        let result = broker.request_thread(9, &mut on_ready);
        assert_eq!(
            result,
            Err(DispatchError::InsufficientResources {
                requested: 9,
                limit: 8
            })
        );
        broker.shutdown(Duration::from_secs(5)).unwrap();
        tick.shutdown(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_shutdown_retires_reserve() {
        let (tick, broker) = start_broker(test_config());
        let mut handed = Vec::new();
        broker.request_thread(2, &mut |worker, pending| handed.push((worker, pending))).unwrap();
        for (worker, pending) in handed {
            broker.release_thread(&worker, pending);
        }
        assert!(broker.allocated_threads() >= 2);
        broker.shutdown(Duration::from_secs(5)).unwrap();
        assert_eq!(broker.allocated_threads(), 0);
        assert_eq!(broker.reserve_size(), 0);
        tick.shutdown(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_cpu_load_override_is_reported() {
        let (tick, broker) = start_broker(test_config());
        broker.set_cpu_load_override(Some(99.0));
        let deadline = Instant::now() + Duration::from_secs(2);
        while broker.cpu_load() < 98.0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!((broker.cpu_load() - 99.0).abs() < 0.5);
        broker.shutdown(Duration::from_secs(5)).unwrap();
        tick.shutdown(Duration::from_secs(1)).unwrap();
    }
}
