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

use crate::error::{DispatchError, DispatchResult};

/// Process-wide dispatch configuration.
///
/// Bad configuration is fatal at initialization: the runtime refuses to start
/// rather than limp along with a zero-sized pool.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    /// Hard cap on the process-wide worker thread population
    pub max_threads: usize,
    /// Target size of the broker's parked reserve
    pub reserved_dispatch_threads: usize,
    /// Reserve floor below which the broker lazily spawns new workers
    pub min_reserved_dispatch_threads: usize,
    /// Global tick cadence
    pub tick_interval: Duration,
    /// Reserve trimming starts after this much broker inactivity
    pub idle_limit: Duration,
    /// CPU load (percent) below which hosts with pending work may grow
    pub cpu_maintain: f32,
    /// CPU load (percent) treated as saturation
    pub cpu_saturation: f32,
    /// Saturation must persist this long before hosts are told to shrink
    pub saturation_limit: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_threads: 1000,
            reserved_dispatch_threads: 20,
            min_reserved_dispatch_threads: 10,
            tick_interval: Duration::from_millis(100),
            idle_limit: Duration::from_secs(6),
            cpu_maintain: 90.0,
            cpu_saturation: 98.0,
            saturation_limit: Duration::from_secs(3),
        }
    }
}

impl DispatchConfig {
    /// Build a configuration from defaults with `STRAND_*` environment
    /// variable overrides. Unparseable values are ignored with a warning on
    /// stderr so a bad deployment knob cannot take the process down here;
    /// `validate` still rejects inconsistent results.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = read_env_usize("STRAND_MAX_THREADS") {
            config.max_threads = v;
        }
        if let Some(v) = read_env_usize("STRAND_RESERVED_THREADS") {
            config.reserved_dispatch_threads = v;
            config.min_reserved_dispatch_threads = v / 2;
        }
        if let Some(v) = read_env_usize("STRAND_MIN_RESERVED_THREADS") {
            config.min_reserved_dispatch_threads = v;
        }
        if let Some(v) = read_env_usize("STRAND_TICK_INTERVAL_MS") {
            config.tick_interval = Duration::from_millis(v as u64);
        }

        config
    }

    /// Reject configurations the broker cannot honor.
    pub fn validate(&self) -> DispatchResult<()> {
        if self.max_threads == 0 {
            return Err(DispatchError::InvalidArgument("max_threads must be at least 1"));
        }
        if self.reserved_dispatch_threads > self.max_threads {
            return Err(DispatchError::InvalidArgument("reserved threads exceed max_threads"));
        }
        if self.min_reserved_dispatch_threads > self.reserved_dispatch_threads {
            return Err(DispatchError::InvalidArgument("reserve floor exceeds reserve target"));
        }
        if self.tick_interval.is_zero() {
            return Err(DispatchError::InvalidArgument("tick_interval must be non-zero"));
        }
        if !(0.0..=100.0).contains(&self.cpu_maintain) || !(0.0..=100.0).contains(&self.cpu_saturation) {
            return Err(DispatchError::InvalidArgument("cpu thresholds must be percentages"));
        }
        if self.cpu_maintain > self.cpu_saturation {
            return Err(DispatchError::InvalidArgument("cpu_maintain must not exceed cpu_saturation"));
        }
        Ok(())
    }
}

fn read_env_usize(key: &str) -> Option<usize> {
    let raw = std::env::var(key).ok()?;
    match raw.parse::<usize>() {
        Ok(v) => Some(v),
        Err(_) => {
            eprintln!("Warning: ignoring unparseable {key}='{raw}'");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DispatchConfig::default();
        assert_eq!(config.max_threads, 1000);
        assert_eq!(config.reserved_dispatch_threads, 20);
        assert_eq!(config.min_reserved_dispatch_threads, 10);
        assert_eq!(config.tick_interval, Duration::from_millis(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_threads() {
        let config = DispatchConfig {
            max_threads: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(DispatchError::InvalidArgument(_))));
    }

    #[test]
    fn test_validate_rejects_inverted_reserve() {
        let config = DispatchConfig {
            reserved_dispatch_threads: 4,
            min_reserved_dispatch_threads: 8,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_cpu_bands() {
        let config = DispatchConfig {
            cpu_maintain: 99.0,
            cpu_saturation: 90.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
