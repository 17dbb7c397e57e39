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

//! Host-independent primitives of the Strand dispatch core: lock-free work
//! containers, work items, the propagated task environment, single-shot
//! promises, rendezvous events, and the dispatch queue contract.

pub mod containers;
pub mod env;
pub mod item;
pub mod promise;
pub mod queue;
pub mod rendezvous;

pub use env::TaskEnv;
pub use item::WorkItem;
pub use promise::Promise;
pub use queue::{DispatchQueue, DispatchQueueRef, SubmitExt};
pub use rendezvous::RendezvousEvent;
pub use strand_common::{DispatchConfig, DispatchError, DispatchResult};
