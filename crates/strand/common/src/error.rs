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

use std::time::Duration;

use thiserror::Error;

/// Result type for dispatch operations
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Error taxonomy of the dispatch core.
///
/// Submission errors surface synchronously to the caller; errors inside a
/// work item surface only through an attached [`crate::DispatchResult`]
/// promise and are otherwise logged and swallowed by the executing worker.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// A bounded structure refused the submission
    #[error("dispatch queue saturated")]
    QueueSaturated,

    /// The broker cannot guarantee the required worker count
    #[error("insufficient dispatch resources: requested {requested}, limit {limit}")]
    InsufficientResources { requested: usize, limit: usize },

    /// The target object has been disposed
    #[error("{0} has been disposed")]
    Disposed(&'static str),

    /// Lifecycle signal completing a worker's pending result; not a failure
    #[error("dispatch worker received shutdown signal")]
    WorkerShutdown,

    /// A second signaler or waiter tried to bind an occupied rendezvous slot
    #[error("rendezvous event is already bound")]
    RendezvousAlreadyBound,

    /// `complete`/`fail` called on an already terminal result
    #[error("result has already been completed")]
    ResultAlreadyCompleted,

    /// Null callback, zero or negative size, or other caller mistake
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A bounded wait expired
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// A work item or tick callback panicked
    #[error("work item panicked: {0}")]
    Panicked(String),
}

impl DispatchError {
    /// True for the dedicated worker lifecycle signal, which tests and the
    /// worker loop must distinguish from genuine failures.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, DispatchError::WorkerShutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_is_not_a_failure_kind() {
        assert!(DispatchError::WorkerShutdown.is_shutdown());
        assert!(!DispatchError::QueueSaturated.is_shutdown());
    }

    #[test]
    fn test_display_messages() {
        let err = DispatchError::InsufficientResources { requested: 4, limit: 2 };
        assert_eq!(err.to_string(), "insufficient dispatch resources: requested 4, limit 2");
        assert_eq!(DispatchError::Disposed("priority pool").to_string(), "priority pool has been disposed");
    }
}
