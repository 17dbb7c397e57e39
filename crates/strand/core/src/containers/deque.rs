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

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_deque::{Steal, Stealer, Worker};

/// Shared side-channel so both ends of the deque can report an approximate
/// length without touching the deque itself.
#[derive(Debug, Default)]
struct DequeShared {
    len: AtomicUsize,
}

/// Owner end of a per-worker work-stealing deque.
///
/// The owner pushes and pops at the bottom (LIFO); siblings steal from the
/// top through [`WorkStealer`]. Not `Sync`: the owner handle lives in the
/// worker thread's local state, only the stealer is shared.
pub struct WorkDeque<T> {
    worker: Worker<T>,
    shared: Arc<DequeShared>,
}

/// Thief end of a [`WorkDeque`], freely cloneable across threads.
pub struct WorkStealer<T> {
    stealer: Stealer<T>,
    shared: Arc<DequeShared>,
}

impl<T> WorkDeque<T> {
    pub fn new() -> Self {
        Self {
            worker: Worker::new_lifo(),
            shared: Arc::new(DequeShared::default()),
        }
    }

    /// Create the shared thief handle. May be called more than once.
    pub fn stealer(&self) -> WorkStealer<T> {
        WorkStealer {
            stealer: self.worker.stealer(),
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn push(&self, item: T) {
        self.shared.len.fetch_add(1, Ordering::Release);
        self.worker.push(item);
    }

    /// Pop the most recently pushed item. May transiently observe empty
    /// while a steal is in flight.
    pub fn pop(&self) -> Option<T> {
        let item = self.worker.pop();
        if item.is_some() {
            self.shared.len.fetch_sub(1, Ordering::Release);
        }
        item
    }

    pub fn len(&self) -> usize {
        self.shared.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for WorkDeque<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkStealer<T> {
    /// Steal one item from the top of the deque. Returns `None` both when
    /// the deque is empty and when the steal lost a race.
    pub fn steal(&self) -> Option<T> {
        loop {
            match self.stealer.steal() {
                Steal::Success(item) => {
                    self.shared.len.fetch_sub(1, Ordering::Release);
                    return Some(item);
                }
                Steal::Retry => continue,
                Steal::Empty => return None,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.shared.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Clone for WorkStealer<T> {
    fn clone(&self) -> Self {
        Self {
            stealer: self.stealer.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_owner_pops_lifo() {
        let deque = WorkDeque::new();
        deque.push(1);
        deque.push(2);
        deque.push(3);
        assert_eq!(deque.len(), 3);
        assert_eq!(deque.pop(), Some(3));
        assert_eq!(deque.pop(), Some(2));
        assert_eq!(deque.pop(), Some(1));
        assert_eq!(deque.pop(), None);
        assert!(deque.is_empty());
    }

    #[test]
    fn test_steal_takes_from_the_top() {
        let deque = WorkDeque::new();
        let stealer = deque.stealer();
        deque.push(1);
        deque.push(2);
        // Thieves see the oldest item first
        assert_eq!(stealer.steal(), Some(1));
        assert_eq!(deque.pop(), Some(2));
        assert_eq!(stealer.steal(), None);
    }

    #[test]
    fn test_concurrent_steals_lose_nothing() {
        let deque = WorkDeque::new();
        for i in 0..1000 {
            deque.push(i);
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let stealer = deque.stealer();
                thread::spawn(move || {
                    let mut taken = Vec::new();
                    while let Some(v) = stealer.steal() {
                        taken.push(v);
                    }
                    taken
                })
            })
            .collect();

        let mut seen: Vec<i32> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        while let Some(v) = deque.pop() {
            seen.push(v);
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..1000).collect::<Vec<_>>());
        assert_eq!(deque.len(), 0);
    }
}
