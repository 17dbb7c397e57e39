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
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_queue::SegQueue;

use strand_common::DispatchResult;

use crate::item::WorkItem;
use crate::queue::{DispatchQueue, DispatchQueueRef};

/// FIFO serializer: accepted items run one at a time, in submission order,
/// on whatever threads the inner queue provides. The backlog is drained by a
/// single claimed drain pass at a time.
pub struct SerialQueue {
    inner: DispatchQueueRef,
    pending: SegQueue<WorkItem>,
    draining: AtomicBool,
    this: Weak<SerialQueue>,
}

impl SerialQueue {
    pub fn new(inner: DispatchQueueRef) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            inner,
            pending: SegQueue::new(),
            draining: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    pub fn pending_items(&self) -> usize {
        self.pending.len()
    }

    fn schedule_drain(&self) {
        if self.draining.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(this) = self.this.upgrade() else {
            self.draining.store(false, Ordering::Release);
            return;
        };
        let drain = WorkItem::new(move || this.drain());
        if self.inner.try_submit(drain).is_err() {
            // Inner queue refused; keep the backlog moving on the caller.
            tracing::warn!("serial queue's inner queue refused the drain pass; draining inline");
            self.drain();
        }
    }

    fn drain(&self) {
        loop {
            while let Some(item) = self.pending.pop() {
                if let Err(error) = item.run() {
                    tracing::warn!(%error, "serialized work item failed");
                }
            }
            self.draining.store(false, Ordering::Release);
            // A producer may have enqueued between the last pop and the
            // release; reclaim the drain if nobody else has.
            if self.pending.is_empty() || self.draining.swap(true, Ordering::AcqRel) {
                return;
            }
        }
    }
}

impl DispatchQueue for SerialQueue {
    fn try_submit(&self, item: WorkItem) -> DispatchResult<()> {
        self.pending.push(item);
        self.schedule_drain();
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::ImmediateQueue;
    use std::sync::Mutex;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let serial = SerialQueue::new(Arc::new(ImmediateQueue));
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let order = Arc::clone(&order);
            serial.try_submit(WorkItem::new(move || order.lock().unwrap().push(i))).unwrap();
        }
        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
        assert_eq!(serial.pending_items(), 0);
    }

    #[test]
    fn test_one_at_a_time_across_threads() {
        let serial = SerialQueue::new(Arc::new(ImmediateQueue));
        let running = Arc::new(AtomicBool::new(false));
        let overlapped = Arc::new(AtomicBool::new(false));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let serial = Arc::clone(&serial);
                let running = Arc::clone(&running);
                let overlapped = Arc::clone(&overlapped);
                thread::spawn(move || {
                    for _ in 0..50 {
                        let running = Arc::clone(&running);
                        let overlapped = Arc::clone(&overlapped);
                        serial
                            .try_submit(WorkItem::new(move || {
                                if running.swap(true, Ordering::SeqCst) {
                                    overlapped.store(true, Ordering::SeqCst);
                                }
                                running.store(false, Ordering::SeqCst);
                            }))
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert!(!overlapped.load(Ordering::SeqCst));
        assert_eq!(serial.pending_items(), 0);
    }
}
