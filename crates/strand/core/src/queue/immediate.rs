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

use strand_common::DispatchResult;

use crate::item::WorkItem;
use crate::queue::DispatchQueue;

/// Runs submitted items synchronously on the calling thread. Callback
/// failures are logged and swallowed.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateQueue;

impl DispatchQueue for ImmediateQueue {
    fn try_submit(&self, item: WorkItem) -> DispatchResult<()> {
        if let Err(error) = item.run() {
            tracing::warn!(%error, "immediate work item failed");
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_runs_synchronously() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let queue = ImmediateQueue;
        queue
            .try_submit(WorkItem::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_swallows_panics() {
        let queue = ImmediateQueue;
        assert!(queue.try_submit(WorkItem::new(|| panic!("boom"))).is_ok());
    }
}
