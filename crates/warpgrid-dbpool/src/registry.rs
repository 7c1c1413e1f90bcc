//! Pool registry: many [`DbPool`]s addressed by integer id and unique name.
//!
//! # Architecture
//!
//! ```text
//! PoolRegistry
//!   ├── id index:   BTreeMap<u32, DbPool>   (registration order = id order)
//!   ├── name index: HashMap<String, u32>
//!   ├── defaults:   PoolSettings copied into newly defined pools
//!   └── MaintenanceThread → check_pool() → DbPool::check_pool() per pool
//! ```
//!
//! The registry mutex is never held while a pool's sweep or a `get` runs;
//! it is only taken to resolve a pool and to advance iteration.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, info};

use crate::connection::{Connection, ConnectionFactory, PooledConnection};
use crate::error::{PoolError, PoolResult, ReturnError};
use crate::maintenance::MaintenanceThread;
use crate::options::{PoolOptions, PoolSettings};
use crate::params::ConnectParams;
use crate::pool::{CheckReport, DbPool};
use crate::status::RegistryStatus;

/// Id of the default pool.
pub const DEFAULT_POOL_ID: u32 = 0;

static NEXT_REGISTRY_UID: AtomicU64 = AtomicU64::new(1);

/// Address of a pool within a registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolRef<'a> {
    Id(u32),
    Name(&'a str),
}

impl From<u32> for PoolRef<'_> {
    fn from(id: u32) -> Self {
        PoolRef::Id(id)
    }
}

impl<'a> From<&'a str> for PoolRef<'a> {
    fn from(name: &'a str) -> Self {
        PoolRef::Name(name)
    }
}

impl<'a> From<&'a String> for PoolRef<'a> {
    fn from(name: &'a String) -> Self {
        PoolRef::Name(name.as_str())
    }
}

impl fmt::Display for PoolRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolRef::Id(id) => write!(f, "id {id}"),
            PoolRef::Name(name) => write!(f, "name `{name}`"),
        }
    }
}

struct RegisteredPool<C: Connection> {
    pool: DbPool<C>,
    /// Sweep round in which this pool was last checked.
    last_check: u64,
}

struct RegistryState<C: Connection> {
    defaults: PoolSettings,
    pools: BTreeMap<u32, RegisteredPool<C>>,
    names: HashMap<String, u32>,
    check_round: u64,
}

impl<C: Connection> RegistryState<C> {
    fn resolve(&self, target: PoolRef<'_>) -> Option<&DbPool<C>> {
        let id = match target {
            PoolRef::Id(id) => id,
            PoolRef::Name(name) => *self.names.get(name)?,
        };
        self.pools.get(&id).map(|entry| &entry.pool)
    }
}

struct RegistryShared<C: Connection> {
    uid: u64,
    state: Mutex<RegistryState<C>>,
}

impl<C: Connection> RegistryShared<C> {
    fn lock(&self) -> MutexGuard<'_, RegistryState<C>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sweep every pool once, in id order, without holding the registry
    /// lock during a pool's sweep. Pools defined mid-sweep are picked up;
    /// pools already swept this round are not revisited.
    fn check_pools(&self) -> CheckReport {
        let round = {
            let mut state = self.lock();
            state.check_round += 1;
            state.check_round
        };

        let mut report = CheckReport::default();
        loop {
            let next = {
                let mut state = self.lock();
                state
                    .pools
                    .values_mut()
                    .find(|entry| entry.last_check != round)
                    .map(|entry| {
                        entry.last_check = round;
                        entry.pool.clone()
                    })
            };
            match next {
                Some(pool) => report += pool.check_pool(),
                None => break,
            }
        }

        if report != CheckReport::default() {
            debug!(
                round,
                expired = report.expired,
                pinged = report.pinged,
                dead = report.dead,
                "pool maintenance sweep"
            );
        }
        report
    }
}

/// A set of connection pools sharing one connection factory.
pub struct PoolRegistry<C: Connection> {
    shared: Arc<RegistryShared<C>>,
    factory: Arc<dyn ConnectionFactory<Connection = C>>,
    /// Serializes define/delete; taken before the registry lock.
    defining: Mutex<()>,
    maintenance: Mutex<Option<MaintenanceThread>>,
}

impl<C: Connection> PoolRegistry<C> {
    /// Create an empty registry using the default pool settings as template.
    pub fn new(factory: Arc<dyn ConnectionFactory<Connection = C>>) -> Self {
        Self::with_defaults(factory, PoolSettings::default())
    }

    /// Create an empty registry with explicit template settings.
    pub fn with_defaults(
        factory: Arc<dyn ConnectionFactory<Connection = C>>,
        defaults: PoolSettings,
    ) -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                uid: NEXT_REGISTRY_UID.fetch_add(1, Ordering::Relaxed),
                state: Mutex::new(RegistryState {
                    defaults,
                    pools: BTreeMap::new(),
                    names: HashMap::new(),
                    check_round: 0,
                }),
            }),
            factory,
            defining: Mutex::new(()),
            maintenance: Mutex::new(None),
        }
    }

    /// Template settings applied to pools defined from now on.
    pub fn defaults(&self) -> PoolSettings {
        self.shared.lock().defaults.clone()
    }

    /// Merge `options` into the template. Existing pools are unaffected.
    pub fn set_defaults(&self, options: &PoolOptions) {
        let mut state = self.shared.lock();
        state.defaults = state.defaults.merged(options);
    }

    pub fn len(&self) -> usize {
        self.shared.lock().pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.lock().pools.is_empty()
    }

    pub fn ids(&self) -> Vec<u32> {
        self.shared.lock().pools.keys().copied().collect()
    }

    /// Look up a pool by id or name.
    pub fn pool<'a>(&self, target: impl Into<PoolRef<'a>>) -> Option<DbPool<C>> {
        self.shared.lock().resolve(target.into()).cloned()
    }

    /// Define a new pool or reconfigure an existing one.
    ///
    /// A new pool starts from the registry defaults and is registered only
    /// if its `init` succeeds. For an existing id the pool is renamed and
    /// re-initialized in place, which discards its free connections when
    /// the connect parameters changed. Fails with `DuplicateName` when
    /// `name` is already bound to a different id.
    pub fn define_database(
        &self,
        id: u32,
        name: &str,
        params: ConnectParams,
        options: &PoolOptions,
    ) -> PoolResult<()> {
        if name.is_empty() {
            return Err(PoolError::InvalidArgument("pool name must not be empty".to_string()));
        }

        let _defining = self.defining.lock().unwrap_or_else(PoisonError::into_inner);
        let (existing, defaults) = {
            let state = self.shared.lock();
            let dupname = state.names.get(name).copied();
            if let Some(owner) = dupname.filter(|owner| *owner != id) {
                return Err(PoolError::DuplicateName {
                    name: name.to_string(),
                    existing: owner,
                });
            }
            let existing = state.pools.get(&id).map(|entry| entry.pool.clone());
            (existing, state.defaults.clone())
        };

        // `init` may close stale connections, so it runs without the
        // registry lock; `defining` keeps the indexes stable meanwhile.
        match existing {
            None => {
                let pool = DbPool::new(id, name, Arc::clone(&self.factory), defaults);
                pool.init(params, options, None)?;

                let mut state = self.shared.lock();
                state.names.try_reserve(1)?;
                state.names.insert(name.to_string(), id);
                state.pools.insert(id, RegisteredPool { pool, last_check: 0 });
                info!(id, name, pools = state.pools.len(), "database pool defined");
            }
            Some(pool) => {
                let old_name = pool.name();
                if old_name != name {
                    self.shared.lock().names.try_reserve(1)?;
                }
                pool.init(params, options, Some(name))?;

                let mut state = self.shared.lock();
                if old_name != name {
                    state.names.remove(&old_name);
                    state.names.insert(name.to_string(), id);
                }
                info!(id, name, old_name = %old_name, "database pool redefined");
            }
        }
        Ok(())
    }

    /// Remove a pool, closing its free connections and revoking lent ones.
    pub fn delete_database(&self, id: u32) -> PoolResult<()> {
        let _defining = self.defining.lock().unwrap_or_else(PoisonError::into_inner);
        let pool = {
            let mut state = self.shared.lock();
            let entry = state
                .pools
                .remove(&id)
                .ok_or_else(|| PoolError::NotFound(PoolRef::Id(id).to_string()))?;
            let name = entry.pool.name();
            state.names.remove(&name);
            info!(id, name = %name, pools = state.pools.len(), "database pool deleted");
            entry.pool
        };
        pool.shutdown();
        Ok(())
    }

    /// Check out a connection from the pool addressed by `target`.
    pub fn get<'a>(
        &self,
        target: impl Into<PoolRef<'a>>,
        wait: bool,
        timeout: Duration,
    ) -> PoolResult<PooledConnection<C>> {
        let target = target.into();
        let pool = self
            .pool(target)
            .ok_or_else(|| PoolError::NotFound(target.to_string()))?;
        let mut conn = pool.get(wait, timeout)?;
        conn.stamp_registry(self.shared.uid);
        Ok(conn)
    }

    /// Check out a connection from the default pool (id 0).
    pub fn get_default(&self, wait: bool, timeout: Duration) -> PoolResult<PooledConnection<C>> {
        self.get(DEFAULT_POOL_ID, wait, timeout)
    }

    /// Return a connection obtained from this registry to its pool.
    pub fn release(&self, conn: PooledConnection<C>) -> Result<(), ReturnError<C>> {
        let pool = self.owning_pool(&conn);
        match pool {
            Ok(pool) => pool.release(conn),
            Err(error) => Err(ReturnError::new(error, conn)),
        }
    }

    /// Close a connection obtained from this registry without recycling it.
    pub fn destroy(&self, conn: PooledConnection<C>) -> Result<(), ReturnError<C>> {
        let pool = self.owning_pool(&conn);
        match pool {
            Ok(pool) => pool.destroy(conn),
            Err(error) => Err(ReturnError::new(error, conn)),
        }
    }

    fn owning_pool(&self, conn: &PooledConnection<C>) -> PoolResult<DbPool<C>> {
        if conn.registry() != Some(self.shared.uid) {
            return Err(PoolError::WrongOwner("this registry".to_string()));
        }
        conn.lender()
            .map(DbPool::from_shared)
            .ok_or_else(|| PoolError::WrongOwner("a live pool".to_string()))
    }

    /// Clear the free and/or used sets of every pool, closing connections.
    pub fn clear_pools(&self, clear_free: bool, clear_used: bool) {
        let state = self.shared.lock();
        for entry in state.pools.values() {
            if clear_free {
                entry.pool.clear_free_pool(true);
            }
            if clear_used {
                entry.pool.clear_used_pool(true);
            }
        }
    }

    /// Run one maintenance sweep over every pool.
    pub fn check_pool(&self) -> CheckReport {
        self.shared.check_pools()
    }

    /// Start the background sweep, or change its interval if already running.
    pub fn start_pool_check(&self, interval: Duration) -> PoolResult<()> {
        if interval.is_zero() {
            return Err(PoolError::InvalidArgument(
                "pool check interval must be positive".to_string(),
            ));
        }
        let mut slot = self.maintenance.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(thread) = slot.as_ref().filter(|thread| thread.is_running()) {
            thread.set_interval(interval);
            debug!(interval_ms = interval.as_millis() as u64, "pool check interval updated");
            return Ok(());
        }

        let shared = Arc::downgrade(&self.shared);
        let thread = MaintenanceThread::spawn("dbpool-check", interval, move || {
            match shared.upgrade() {
                Some(shared) => {
                    shared.check_pools();
                    ControlFlow::Continue(())
                }
                None => ControlFlow::Break(()),
            }
        })?;
        *slot = Some(thread);
        Ok(())
    }

    /// Stop the background sweep, waiting for an in-progress sweep to end.
    pub fn stop_pool_check(&self) {
        let thread = self
            .maintenance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut thread) = thread {
            thread.stop();
        }
    }

    pub fn is_checking(&self) -> bool {
        self.maintenance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(MaintenanceThread::is_running)
    }

    /// Status of every pool, keyed by id.
    pub fn get_status(&self) -> RegistryStatus {
        let pools: Vec<DbPool<C>> = self
            .shared
            .lock()
            .pools
            .values()
            .map(|entry| entry.pool.clone())
            .collect();
        RegistryStatus {
            pools: pools.iter().map(|pool| (pool.id(), pool.get_status())).collect(),
        }
    }

    /// Log counts for every pool at `tracing::info` level.
    pub fn log_status(&self) {
        for (id, pool) in self.get_status().pools {
            info!(
                id,
                name = %pool.name,
                hash = pool.hash.as_deref().unwrap_or("-"),
                free = pool.free,
                used = pool.used,
                max = pool.settings.max,
                "pool statistics"
            );
        }
    }
}

impl<C: Connection> Drop for PoolRegistry<C> {
    fn drop(&mut self) {
        self.stop_pool_check();
        let pools: Vec<DbPool<C>> = {
            let mut state = self.shared.lock();
            state.names.clear();
            std::mem::take(&mut state.pools)
                .into_values()
                .map(|entry| entry.pool)
                .collect()
        };
        for pool in &pools {
            pool.shutdown();
        }
    }
}

impl<C: Connection> fmt::Debug for PoolRegistry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("PoolRegistry")
            .field("uid", &self.shared.uid)
            .field("pools", &state.pools.keys().collect::<Vec<_>>())
            .field("defaults", &state.defaults)
            .finish_non_exhaustive()
    }
}
