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
use std::sync::Arc;

use strand_common::DispatchResult;
use strand_core::queue::DispatchQueue;
use strand_core::{DispatchQueueRef, WorkItem};

use crate::worker;

/// Memoizing fast-path wrapper: when the calling thread is a dispatch worker
/// currently running for the wrapped queue, submissions land directly on that
/// worker's deque and skip the host inbox. Everything else delegates.
pub struct WorkerLocalQueue {
    inner: DispatchQueueRef,
}

impl WorkerLocalQueue {
    pub fn new(inner: DispatchQueueRef) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &DispatchQueueRef {
        &self.inner
    }
}

impl DispatchQueue for WorkerLocalQueue {
    fn try_submit(&self, item: WorkItem) -> DispatchResult<()> {
        if let Some(current_worker) = worker::current_worker() {
            let matches = current_worker
                .current_queue()
                .is_some_and(|current| Arc::ptr_eq(&current, &self.inner));
            if matches {
                match worker::local_push(item) {
                    Ok(()) => return Ok(()),
                    Err(item) => return self.inner.try_submit(item),
                }
            }
        }
        self.inner.try_submit(item)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use strand_core::queue::ImmediateQueue;

    #[test]
    fn test_delegates_off_worker() {
        let queue = WorkerLocalQueue::new(Arc::new(ImmediateQueue));
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        queue
            .try_submit(WorkItem::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
