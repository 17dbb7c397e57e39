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

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_queue::SegQueue;

/// Lock-free priority inbox: one FIFO slot per priority level.
///
/// Higher numeric priority dequeues first; ties are FIFO within a level.
/// Admission is bounded by an atomic counter shared across all levels.
pub struct PriorityQueue<T> {
    levels: Vec<SegQueue<T>>,
    len: AtomicUsize,
    capacity: usize,
}

impl<T> PriorityQueue<T> {
    /// `levels` is `max_priority + 1`; `capacity` bounds the total number of
    /// queued items across all levels.
    pub fn new(levels: usize, capacity: usize) -> Self {
        Self {
            levels: (0..levels).map(|_| SegQueue::new()).collect(),
            len: AtomicUsize::new(0),
            capacity,
        }
    }

    /// Enqueue at the given priority. Refuses (returning the item) when the
    /// priority is out of range or the queue is saturated.
    pub fn try_enqueue(&self, priority: usize, item: T) -> Result<(), T> {
        if priority >= self.levels.len() {
            return Err(item);
        }

        let mut len = self.len.load(Ordering::Acquire);
        loop {
            if len >= self.capacity {
                return Err(item);
            }
            match self.len.compare_exchange_weak(len, len + 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => break,
                Err(observed) => len = observed,
            }
        }

        self.levels[priority].push(item);
        Ok(())
    }

    /// Dequeue the oldest item of the highest non-empty priority.
    pub fn try_dequeue(&self) -> Option<(usize, T)> {
        for priority in (0..self.levels.len()).rev() {
            if let Some(item) = self.levels[priority].pop() {
                self.len.fetch_sub(1, Ordering::Release);
                return Some((priority, item));
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_higher_priority_first() {
        let queue = PriorityQueue::new(3, 64);
        queue.try_enqueue(0, "a").unwrap();
        queue.try_enqueue(2, "b").unwrap();
        queue.try_enqueue(1, "c").unwrap();

        assert_eq!(queue.try_dequeue(), Some((2, "b")));
        assert_eq!(queue.try_dequeue(), Some((1, "c")));
        assert_eq!(queue.try_dequeue(), Some((0, "a")));
        assert_eq!(queue.try_dequeue(), None);
    }

    #[test]
    fn test_fifo_within_a_level() {
        let queue = PriorityQueue::new(1, 64);
        for i in 0..10 {
            queue.try_enqueue(0, i).unwrap();
        }
        let drained: Vec<i32> = std::iter::from_fn(|| queue.try_dequeue().map(|(_, v)| v)).collect();
        assert_eq!(drained, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_out_of_range_priority_refused() {
        let queue = PriorityQueue::new(2, 64);
        assert_eq!(queue.try_enqueue(2, 1), Err(1));
    }

    #[test]
    fn test_saturation_refusal() {
        let queue = PriorityQueue::new(2, 2);
        queue.try_enqueue(0, 1).unwrap();
        queue.try_enqueue(1, 2).unwrap();
        assert_eq!(queue.try_enqueue(0, 3), Err(3));

        queue.try_dequeue().unwrap();
        assert!(queue.try_enqueue(0, 3).is_ok());
    }

    #[test]
    fn test_concurrent_producers() {
        let queue = Arc::new(PriorityQueue::new(4, usize::MAX));
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..250 {
                        queue.try_enqueue(p, (p, i)).unwrap();
                    }
                })
            })
            .collect();
        for h in producers {
            h.join().unwrap();
        }

        assert_eq!(queue.len(), 1000);
        let mut last_priority = usize::MAX;
        let mut count = 0;
        while let Some((priority, _)) = queue.try_dequeue() {
            // With producers quiescent, priorities come out non-increasing
            assert!(priority <= last_priority);
            last_priority = priority;
            count += 1;
        }
        assert_eq!(count, 1000);
    }

    proptest! {
        #[test]
        fn prop_dequeue_order_is_priority_then_fifo(items in prop::collection::vec((0usize..4, 0u32..1000), 0..64)) {
            let queue = PriorityQueue::new(4, 1024);
            for &(priority, value) in &items {
                prop_assert!(queue.try_enqueue(priority, value).is_ok());
            }

            let mut expected: Vec<(usize, u32)> = Vec::new();
            for priority in (0..4).rev() {
                expected.extend(items.iter().copied().filter(|&(p, _)| p == priority));
            }
            let drained: Vec<(usize, u32)> = std::iter::from_fn(|| queue.try_dequeue()).collect();
            prop_assert_eq!(drained, expected);
        }
    }
}
