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

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, bounded};
use parking_lot::{Condvar, Mutex, RwLock};

use strand_common::{DispatchError, DispatchResult};
use strand_core::item::describe_panic;

/// Handle returned by [`GlobalTick::add`]; pass it to [`GlobalTick::remove`]
/// to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickRegistration(u64);

type TickHandler = Arc<dyn Fn(Instant, Duration) + Send + Sync>;

struct TickEntry {
    id: u64,
    name: String,
    handler: TickHandler,
}

struct TickShared {
    interval: Duration,
    // Copy-on-write list: registration replaces the Arc under the write
    // lock, the tick thread clones it under the read lock and iterates
    // without holding anything.
    handlers: RwLock<Arc<Vec<TickEntry>>>,
    next_id: AtomicU64,
    offset_micros: AtomicU64,
    stop: AtomicBool,
    sleeper: Mutex<()>,
    wake: Condvar,
    done: Mutex<Option<Receiver<()>>>,
}

impl TickShared {
    fn now(&self) -> Instant {
        Instant::now() + Duration::from_micros(self.offset_micros.load(Ordering::Acquire))
    }
}

/// The process time source: a dedicated thread that fires every registered
/// callback with `(now, elapsed_since_last_tick)` at a fixed cadence.
///
/// Callbacks run serially on the tick thread; a panicking callback is logged
/// and swallowed and later callbacks still run. `now` is wall time plus the
/// virtual-time offset accumulated by [`GlobalTick::fast_forward`].
#[derive(Clone)]
pub struct GlobalTick {
    shared: Arc<TickShared>,
}

impl GlobalTick {
    pub fn start(interval: Duration) -> Self {
        let (done_tx, done_rx) = bounded(0);
        let shared = Arc::new(TickShared {
            interval,
            handlers: RwLock::new(Arc::new(Vec::new())),
            next_id: AtomicU64::new(1),
            offset_micros: AtomicU64::new(0),
            stop: AtomicBool::new(false),
            sleeper: Mutex::new(()),
            wake: Condvar::new(),
            done: Mutex::new(Some(done_rx)),
        });

        let tick_shared = Arc::clone(&shared);
        std::thread::Builder::new()
            .name("global-tick".to_string())
            .spawn(move || {
                run_tick_loop(&tick_shared);
                drop(done_tx);
            })
            .expect("could not spawn global tick thread");

        Self { shared }
    }

    /// Register a named callback. Names are informational only; no
    /// uniqueness check is made.
    pub fn add<F>(&self, name: &str, handler: F) -> TickRegistration
    where
        F: Fn(Instant, Duration) + Send + Sync + 'static,
    {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let mut handlers = self.shared.handlers.write();
        let mut next: Vec<TickEntry> = Vec::with_capacity(handlers.len() + 1);
        next.extend(handlers.iter().map(|e| TickEntry {
            id: e.id,
            name: e.name.clone(),
            handler: Arc::clone(&e.handler),
        }));
        next.push(TickEntry {
            id,
            name: name.to_string(),
            handler: Arc::new(handler),
        });
        *handlers = Arc::new(next);
        TickRegistration(id)
    }

    pub fn remove(&self, registration: TickRegistration) {
        let mut handlers = self.shared.handlers.write();
        let next: Vec<TickEntry> = handlers
            .iter()
            .filter(|e| e.id != registration.0)
            .map(|e| TickEntry {
                id: e.id,
                name: e.name.clone(),
                handler: Arc::clone(&e.handler),
            })
            .collect();
        *handlers = Arc::new(next);
    }

    /// Wall time plus the accumulated virtual-time offset.
    pub fn now(&self) -> Instant {
        self.shared.now()
    }

    pub fn interval(&self) -> Duration {
        self.shared.interval
    }

    pub fn handler_count(&self) -> usize {
        self.shared.handlers.read().len()
    }

    /// Advance virtual time. The next tick observes the jump in both `now`
    /// and `elapsed`; the tick thread is woken so the jump is seen promptly.
    pub fn fast_forward(&self, duration: Duration) {
        self.shared.offset_micros.fetch_add(duration.as_micros() as u64, Ordering::AcqRel);
        self.shared.wake.notify_all();
    }

    /// Stop the tick thread and join it within `timeout`.
    pub fn shutdown(&self, timeout: Duration) -> DispatchResult<()> {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.wake.notify_all();
        let Some(done) = self.shared.done.lock().take() else {
            return Ok(());
        };
        match done.recv_timeout(timeout) {
            Ok(()) => unreachable!("tick thread never sends on the done channel"),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => Ok(()),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                *self.shared.done.lock() = Some(done);
                Err(DispatchError::Timeout(timeout))
            }
        }
    }
}

impl Drop for TickShared {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.wake.notify_all();
    }
}

fn run_tick_loop(shared: &Arc<TickShared>) {
    let mut last = shared.now();
    loop {
        {
            let mut guard = shared.sleeper.lock();
            if shared.stop.load(Ordering::Acquire) {
                return;
            }
            shared.wake.wait_for(&mut guard, shared.interval);
        }
        if shared.stop.load(Ordering::Acquire) {
            return;
        }

        let now = shared.now();
        let elapsed = now.duration_since(last);
        last = now;

        let snapshot = Arc::clone(&*shared.handlers.read());
        for entry in snapshot.iter() {
            let handler = entry.handler.as_ref();
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler(now, elapsed))) {
                tracing::error!(
                    callback = %entry.name,
                    panic = %describe_panic(&*payload),
                    "tick callback panicked"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn fast_tick() -> GlobalTick {
        GlobalTick::start(Duration::from_millis(5))
    }

    fn wait_until(deadline: Duration, predicate: impl Fn() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if predicate() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        predicate()
    }

    #[test]
    fn test_callbacks_fire_periodically() {
        let tick = fast_tick();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        tick.add("counter", move |_, _| {
            f.fetch_add(1, Ordering::SeqCst);
        });

        assert!(wait_until(Duration::from_secs(2), || fired.load(Ordering::SeqCst) >= 3));
        tick.shutdown(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_remove_stops_a_callback() {
        let tick = fast_tick();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let registration = tick.add("removable", move |_, _| {
            f.fetch_add(1, Ordering::SeqCst);
        });

        assert!(wait_until(Duration::from_secs(2), || fired.load(Ordering::SeqCst) >= 1));
        tick.remove(registration);
        assert_eq!(tick.handler_count(), 0);

        let settled = fired.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        // One in-flight firing may land after removal, no more
        assert!(fired.load(Ordering::SeqCst) <= settled + 1);
        tick.shutdown(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_panicking_callback_does_not_stop_others() {
        let tick = fast_tick();
        let fired = Arc::new(AtomicUsize::new(0));
        tick.add("broken", |_, _| panic!("callback bug"));
        let f = Arc::clone(&fired);
        tick.add("healthy", move |_, _| {
            f.fetch_add(1, Ordering::SeqCst);
        });

        assert!(wait_until(Duration::from_secs(2), || fired.load(Ordering::SeqCst) >= 2));
        tick.shutdown(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_fast_forward_moves_now_and_elapsed() {
        let tick = fast_tick();
        let base = tick.now();
        let jump = Duration::from_secs(3600);

        let observed = Arc::new(Mutex::new(Vec::new()));
        let o = Arc::clone(&observed);
        tick.add("observer", move |now, elapsed| {
            o.lock().push((now, elapsed));
        });

        tick.fast_forward(jump);
        assert!(tick.now() >= base + jump);

        assert!(wait_until(Duration::from_secs(2), || {
            observed.lock().iter().any(|(now, _)| *now >= base + jump)
        }));
        // Some firing observed the jump in its elapsed delta
        assert!(observed.lock().iter().any(|(_, elapsed)| *elapsed >= jump));
        tick.shutdown(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let tick = fast_tick();
        tick.shutdown(Duration::from_secs(1)).unwrap();
        tick.shutdown(Duration::from_secs(1)).unwrap();
    }
}
