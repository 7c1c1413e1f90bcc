//! Read-only status snapshots for operational inspection.

use std::collections::BTreeMap;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::options::PoolSettings;

/// Whether a connection sits in the free set or is lent out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Free,
    Used,
}

/// Per-connection entry of a [`PoolStatus`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub id: u64,
    pub state: ConnectionState,
    /// Hex fingerprint of the parameters the connection was created with.
    pub hash: String,
    /// Unix seconds of the last successful ping.
    pub last_ping: u64,
    /// Unix seconds of the last return to the free set (or creation).
    pub last_use: u64,
}

/// Snapshot of a single pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub id: u32,
    pub name: String,
    /// Hex fingerprint of the configured parameters; `None` before `init`.
    pub hash: Option<String>,
    pub free: usize,
    pub used: usize,
    pub settings: PoolSettings,
    pub connections: Vec<ConnectionStatus>,
}

/// Snapshot of every pool in a registry, keyed by pool id.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStatus {
    pub pools: BTreeMap<u32, PoolStatus>,
}

impl RegistryStatus {
    pub fn total_free(&self) -> usize {
        self.pools.values().map(|p| p.free).sum()
    }

    pub fn total_used(&self) -> usize {
        self.pools.values().map(|p| p.used).sum()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Convert a monotonic timestamp into approximate Unix seconds.
pub(crate) fn unix_secs(at: Instant) -> u64 {
    SystemTime::now()
        .checked_sub(at.elapsed())
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .unwrap_or_default()
        .as_secs()
}
