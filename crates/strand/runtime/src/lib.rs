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

//! The threaded half of the Strand dispatch core: the global tick loop, task
//! timers, worker threads, the process-wide thread broker, and the elastic
//! priority thread pool host.

pub mod broker;
pub mod pool;
pub mod runtime;
pub mod tick;
pub mod timer;
pub mod worker;
pub mod worker_local;

pub use broker::{ThreadBroker, ThreadVelocity};
pub use pool::{PoolConfig, PoolStats, PriorityThreadPool};
pub use runtime::DispatchRuntime;
pub use tick::{GlobalTick, TickRegistration};
pub use timer::{TaskTimer, TaskTimerFactory};
pub use worker::{DispatchJob, DispatchWorker, WorkerHost, WorkerId};
pub use worker_local::WorkerLocalQueue;

pub use strand_core::rendezvous::pending_rendezvous_count;
pub use strand_core::{
    DispatchConfig, DispatchError, DispatchQueue, DispatchQueueRef, DispatchResult, Promise, RendezvousEvent, SubmitExt,
    TaskEnv, WorkItem,
};
