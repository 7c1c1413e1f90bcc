//! Pool sizing and timing options.
//!
//! [`PoolOptions`] is the partial form supplied at `init`/`define_database`
//! time: each absent field falls back to the pool's current value.
//! [`PoolSettings`] is the fully resolved form a pool runs with.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Resolved sizing and timing for a single pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PoolSettings {
    /// Connections `warm_up` keeps open (default: 0).
    pub min: usize,
    /// Hard cap on free + used connections; 0 means unlimited (default: 0).
    pub max: usize,
    /// Free connections `warm_up` keeps ready (default: 0).
    pub min_spare: usize,
    /// Cap on the free set; 0 means unlimited (default: 0).
    pub max_spare: usize,
    /// Connections created per `warm_up` call, at least 1 (default: 1).
    pub grow: usize,
    /// Free connections idle longer are closed by `check_pool`; zero
    /// disables expiry (default: 300s).
    #[serde(with = "secs")]
    pub idle_timeout: Duration,
    /// Free connections not pinged for longer are pinged by `check_pool`;
    /// zero disables keepalive (default: 30s).
    #[serde(with = "secs")]
    pub keepalive: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min: 0,
            max: 0,
            min_spare: 0,
            max_spare: 0,
            grow: 1,
            idle_timeout: Duration::from_secs(300),
            keepalive: Duration::from_secs(30),
        }
    }
}

impl PoolSettings {
    /// Return a copy with every field present in `options` overridden.
    pub fn merged(&self, options: &PoolOptions) -> Self {
        Self {
            min: options.min.unwrap_or(self.min),
            max: options.max.unwrap_or(self.max),
            min_spare: options.min_spare.unwrap_or(self.min_spare),
            max_spare: options.max_spare.unwrap_or(self.max_spare),
            grow: options.grow.unwrap_or(self.grow).max(1),
            idle_timeout: options.timeout.unwrap_or(self.idle_timeout),
            keepalive: options.keepalive.unwrap_or(self.keepalive),
        }
    }

    /// Whether `total` connections leave no room for another.
    pub fn at_capacity(&self, total: usize) -> bool {
        self.max > 0 && total >= self.max
    }
}

/// Partial pool options; `None` keeps the current value.
///
/// In configuration files `timeout` and `keepalive` are whole seconds.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolOptions {
    pub min: Option<usize>,
    pub max: Option<usize>,
    #[serde(alias = "minspare")]
    pub min_spare: Option<usize>,
    #[serde(alias = "maxspare")]
    pub max_spare: Option<usize>,
    pub grow: Option<usize>,
    #[serde(default, with = "opt_secs")]
    pub timeout: Option<Duration>,
    #[serde(default, with = "opt_secs")]
    pub keepalive: Option<Duration>,
}

impl PoolOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min(self, min: usize) -> Self {
        Self { min: Some(min), ..self }
    }

    pub fn with_max(self, max: usize) -> Self {
        Self { max: Some(max), ..self }
    }

    pub fn with_min_spare(self, min_spare: usize) -> Self {
        Self { min_spare: Some(min_spare), ..self }
    }

    pub fn with_max_spare(self, max_spare: usize) -> Self {
        Self { max_spare: Some(max_spare), ..self }
    }

    pub fn with_grow(self, grow: usize) -> Self {
        Self { grow: Some(grow), ..self }
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self { timeout: Some(timeout), ..self }
    }

    pub fn with_keepalive(self, keepalive: Duration) -> Self {
        Self { keepalive: Some(keepalive), ..self }
    }
}

mod secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }
}

mod opt_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
    }
}
