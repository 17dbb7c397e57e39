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

use crate::item::WorkItem;
use crate::queue::DispatchQueue;

/// A synchronization context that serializes posted callbacks (a UI loop, a
/// single-threaded executor, a test harness channel).
pub trait SyncContext: Send + Sync {
    fn post(&self, callback: Box<dyn FnOnce() + Send>);
}

/// Dispatch queue delegating to a [`SyncContext`]; ordering and threading are
/// whatever the context guarantees.
pub struct ContextBoundQueue {
    context: Arc<dyn SyncContext>,
}

impl ContextBoundQueue {
    pub fn new(context: Arc<dyn SyncContext>) -> Self {
        Self { context }
    }
}

impl DispatchQueue for ContextBoundQueue {
    fn try_submit(&self, item: WorkItem) -> DispatchResult<()> {
        self.context.post(Box::new(move || {
            if let Err(error) = item.run() {
                tracing::warn!(%error, "context-bound work item failed");
            }
        }));
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{Receiver, Sender, unbounded};

    struct ChannelContext {
        sender: Sender<Box<dyn FnOnce() + Send>>,
    }

    impl SyncContext for ChannelContext {
        fn post(&self, callback: Box<dyn FnOnce() + Send>) {
            self.sender.send(callback).expect("context consumer is gone");
        }
    }

    fn channel_context() -> (Arc<ChannelContext>, Receiver<Box<dyn FnOnce() + Send>>) {
        let (sender, receiver) = unbounded();
        (Arc::new(ChannelContext { sender }), receiver)
    }

    #[test]
    fn test_callbacks_run_in_post_order() {
        let (context, receiver) = channel_context();
        let queue = ContextBoundQueue::new(context);

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for tag in ["a", "b", "c"] {
            let order = Arc::clone(&order);
            queue.try_submit(WorkItem::new(move || order.lock().unwrap().push(tag))).unwrap();
        }

        // Drain the context serially, as a real context would
        while let Ok(callback) = receiver.try_recv() {
            callback();
        }
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }
}
