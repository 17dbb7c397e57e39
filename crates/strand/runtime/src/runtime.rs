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

use strand_common::{DispatchConfig, DispatchResult};

use crate::broker::ThreadBroker;
use crate::pool::{PoolConfig, PriorityThreadPool};
use crate::tick::GlobalTick;
use crate::timer::TaskTimerFactory;

/// Explicit assembly of the dispatch core: global tick, thread broker, and
/// timer factory, created at startup and shut down at teardown. Nothing here
/// is a hidden process global; pass the runtime (or the pieces) where they
/// are needed.
pub struct DispatchRuntime {
    config: DispatchConfig,
    tick: GlobalTick,
    broker: ThreadBroker,
    timers: TaskTimerFactory,
}

impl DispatchRuntime {
    pub fn start(config: DispatchConfig) -> DispatchResult<Self> {
        config.validate()?;
        let tick = GlobalTick::start(config.tick_interval);
        let broker = ThreadBroker::new(config.clone(), &tick)?;
        let timers = TaskTimerFactory::new(&tick);
        Ok(Self {
            config,
            tick,
            broker,
            timers,
        })
    }

    /// Start with defaults plus `STRAND_*` environment overrides.
    pub fn from_env() -> DispatchResult<Self> {
        Self::start(DispatchConfig::from_env())
    }

    pub fn new_pool(&self, config: PoolConfig) -> DispatchResult<PriorityThreadPool> {
        PriorityThreadPool::new(&self.broker, config)
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn tick(&self) -> &GlobalTick {
        &self.tick
    }

    pub fn broker(&self) -> &ThreadBroker {
        &self.broker
    }

    pub fn timers(&self) -> &TaskTimerFactory {
        &self.timers
    }

    /// Orderly teardown: timers first, then the worker population, then the
    /// tick thread. Pools should be disposed before calling this.
    pub fn shutdown(self, timeout: Duration) -> DispatchResult<()> {
        self.timers.dispose();
        self.broker.shutdown(timeout)?;
        self.tick.shutdown(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_and_shutdown() {
        let config = DispatchConfig {
            reserved_dispatch_threads: 2,
            min_reserved_dispatch_threads: 0,
            tick_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let runtime = DispatchRuntime::start(config).unwrap();
        assert_eq!(runtime.broker().allocated_threads(), 0);
        runtime.shutdown(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_invalid_config_is_fatal() {
        let config = DispatchConfig {
            max_threads: 0,
            ..Default::default()
        };
        assert!(DispatchRuntime::start(config).is_err());
    }
}
