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

use std::mem::ManuallyDrop;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_epoch::{self as epoch, Atomic, Owned, Shared};

struct Node<T> {
    data: ManuallyDrop<T>,
    // Immutable once the node is published
    next: *const Node<T>,
}

/// Bounded lock-free LIFO stack (Treiber) with epoch-based reclamation.
///
/// Capacity admission is a separate atomic counter, so `try_push` may refuse
/// slightly early under contention; it never admits beyond `capacity`.
/// A capacity of zero is legal and makes every push refuse.
pub struct BoundedStack<T> {
    head: Atomic<Node<T>>,
    len: AtomicUsize,
    capacity: usize,
}

unsafe impl<T: Send> Send for BoundedStack<T> {}
unsafe impl<T: Send> Sync for BoundedStack<T> {}

impl<T> BoundedStack<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            head: Atomic::null(),
            len: AtomicUsize::new(0),
            capacity,
        }
    }

    /// Push unless the stack is at capacity; on refusal the value is handed
    /// back to the caller.
    pub fn try_push(&self, value: T) -> Result<(), T> {
        // Reserve a slot first
        let mut len = self.len.load(Ordering::Acquire);
        loop {
            if len >= self.capacity {
                return Err(value);
            }
            match self.len.compare_exchange_weak(len, len + 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => break,
                Err(observed) => len = observed,
            }
        }

        let guard = epoch::pin();
        let mut node = Owned::new(Node {
            data: ManuallyDrop::new(value),
            next: ptr::null(),
        });
        loop {
            let head = self.head.load(Ordering::Relaxed, &guard);
            node.next = head.as_raw();
            match self.head.compare_exchange(head, node, Ordering::Release, Ordering::Relaxed, &guard) {
                Ok(_) => return Ok(()),
                Err(err) => node = err.new,
            }
        }
    }

    /// Pop the most recently pushed value.
    pub fn pop(&self) -> Option<T> {
        let guard = epoch::pin();
        loop {
            let head = self.head.load(Ordering::Acquire, &guard);
            let node = unsafe { head.as_ref() }?;
            let next = Shared::from(node.next);
            if self
                .head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire, &guard)
                .is_ok()
            {
                self.len.fetch_sub(1, Ordering::Release);
                unsafe {
                    let value = ptr::read(&*node.data);
                    guard.defer_destroy(head);
                    return Some(value);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T> Drop for BoundedStack<T> {
    fn drop(&mut self) {
        // &mut self: no concurrent access remains
        let guard = unsafe { epoch::unprotected() };
        let mut head = self.head.load(Ordering::Relaxed, guard);
        while !head.is_null() {
            unsafe {
                let mut node = head.into_owned();
                head = Shared::from(node.next);
                ManuallyDrop::drop(&mut node.data);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_lifo_order() {
        let stack = BoundedStack::new(8);
        stack.try_push(1).unwrap();
        stack.try_push(2).unwrap();
        stack.try_push(3).unwrap();
        assert_eq!(stack.pop(), Some(3));
        assert_eq!(stack.pop(), Some(2));
        assert_eq!(stack.pop(), Some(1));
        assert_eq!(stack.pop(), None);
    }

    #[test]
    fn test_capacity_refusal() {
        let stack = BoundedStack::new(2);
        assert!(stack.try_push(1).is_ok());
        assert!(stack.try_push(2).is_ok());
        assert_eq!(stack.try_push(3), Err(3));
        assert_eq!(stack.len(), 2);

        stack.pop().unwrap();
        assert!(stack.try_push(3).is_ok());
    }

    #[test]
    fn test_zero_capacity_always_refuses() {
        let stack = BoundedStack::new(0);
        assert_eq!(stack.try_push(1), Err(1));
        assert_eq!(stack.pop(), None);
    }

    #[test]
    fn test_concurrent_push_pop() {
        let stack = Arc::new(BoundedStack::new(usize::MAX));
        let producers: Vec<_> = (0..4)
            .map(|t| {
                let stack = Arc::clone(&stack);
                thread::spawn(move || {
                    for i in 0..500 {
                        stack.try_push(t * 1000 + i).unwrap();
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let stack = Arc::clone(&stack);
                thread::spawn(move || {
                    let mut taken = Vec::new();
                    while let Some(v) = stack.pop() {
                        taken.push(v);
                    }
                    taken
                })
            })
            .collect();

        let mut seen: Vec<usize> = consumers.into_iter().flat_map(|c| c.join().unwrap()).collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 2000);
        assert!(stack.is_empty());
    }

    #[test]
    fn test_drop_releases_remaining_values() {
        let value = Arc::new(());
        {
            let stack = BoundedStack::new(4);
            stack.try_push(Arc::clone(&value)).unwrap();
            stack.try_push(Arc::clone(&value)).unwrap();
        }
        // Epoch reclamation may be deferred, but the stack's own Drop drains
        // synchronously.
        assert_eq!(Arc::strong_count(&value), 1);
    }
}
