//! Single-target connection pool.
//!
//! A [`DbPool`] manages connections for one set of connect parameters. It
//! owns two collections behind one mutex: the free set (idle, validated
//! connections) and the used set (connections lent to callers).
//!
//! # Locking
//!
//! The pool mutex is never held across `ping`, `connect`, or `close`. A free
//! connection about to be pinged is moved into the `Checking` slot state,
//! the lock is dropped, and the outcome is applied after re-locking. Every
//! scan skips `Checking` entries and looks entries up again by id after
//! re-locking, since the free set may have changed in between.
//!
//! Connections being created count against `max` through the `pending`
//! reservation, so `free + used` never exceeds `max` when it is set.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionFactory, PooledConnection};
use crate::error::{PoolError, PoolResult, ReturnError};
use crate::options::{PoolOptions, PoolSettings};
use crate::params::{ConnectParams, Fingerprint};
use crate::status::{ConnectionState, ConnectionStatus, PoolStatus, unix_secs};

/// Upper bound on one sleep while waiting for capacity.
const WAIT_SLICE: Duration = Duration::from_millis(10);

/// Per-entry state of an idle connection.
enum Slot<C> {
    /// Ready for checkout.
    Ready(C),
    /// Taken out for a ping by `get` or `check_pool`; skipped by scanners.
    Checking,
}

struct IdleConnection<C> {
    id: u64,
    slot: Slot<C>,
    fingerprint: Fingerprint,
    last_use: Instant,
    last_ping: Instant,
}

impl<C> IdleConnection<C> {
    fn is_ready(&self) -> bool {
        matches!(self.slot, Slot::Ready(_))
    }

    /// Take the connection out for a ping, leaving the entry in place.
    fn begin_check(&mut self) -> Option<(u64, C)> {
        match std::mem::replace(&mut self.slot, Slot::Checking) {
            Slot::Ready(conn) => Some((self.id, conn)),
            Slot::Checking => None,
        }
    }

    fn into_connection(self) -> Option<C> {
        match self.slot {
            Slot::Ready(conn) => Some(conn),
            Slot::Checking => None,
        }
    }
}

/// Bookkeeping for a lent connection. The connection itself lives in the
/// caller's [`PooledConnection`].
struct LentConnection {
    fingerprint: Fingerprint,
    last_use: Instant,
    last_ping: Instant,
}

struct PoolState<C> {
    id: u32,
    name: String,
    settings: PoolSettings,
    /// `None` until the first successful `init`, and again after `shutdown`.
    params: Option<ConnectParams>,
    fingerprint: Option<Fingerprint>,
    free: Vec<IdleConnection<C>>,
    used: HashMap<u64, LentConnection>,
    /// Connections being created outside the lock.
    pending: usize,
    /// Lent connections dropped from the used set by `clear_used_pool(true)`;
    /// they are closed when they come back.
    revoked: HashSet<u64>,
    next_conn_id: u64,
}

impl<C> PoolState<C> {
    fn total(&self) -> usize {
        self.free.len() + self.used.len() + self.pending
    }

    fn at_capacity(&self) -> bool {
        self.settings.at_capacity(self.total())
    }

    fn position(&self, id: u64) -> Option<usize> {
        self.free.iter().position(|entry| entry.id == id)
    }

    fn allocate_id(&mut self) -> u64 {
        self.next_conn_id += 1;
        self.next_conn_id
    }

    fn exhausted(&self, timed_out: bool) -> PoolError {
        PoolError::PoolExhausted {
            pool: self.name.clone(),
            max: self.settings.max,
            timed_out,
        }
    }

    fn drain_free(&mut self) -> Vec<C> {
        self.free.drain(..).filter_map(IdleConnection::into_connection).collect()
    }
}

pub(crate) struct PoolShared<C: Connection> {
    factory: Arc<dyn ConnectionFactory<Connection = C>>,
    state: Mutex<PoolState<C>>,
    /// Signalled whenever a slot or a free connection may have become available.
    available: Condvar,
}

impl<C: Connection> PoolShared<C> {
    fn lock(&self) -> MutexGuard<'_, PoolState<C>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove a lent connection that was dropped without being returned.
    pub(crate) fn discard(&self, id: u64, mut conn: C) {
        {
            let mut state = self.lock();
            let tracked = state.used.remove(&id).is_some();
            state.revoked.remove(&id);
            warn!(
                pool = %state.name,
                conn = id,
                tracked,
                "pooled connection dropped without release, discarding"
            );
        }
        self.available.notify_one();
        conn.close();
    }
}

impl<C: Connection> Drop for PoolShared<C> {
    fn drop(&mut self) {
        // Lent handles close themselves once their back-reference is dead.
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        let idle = state.drain_free();
        if !idle.is_empty() {
            debug!(pool = %state.name, closed = idle.len(), "pool dropped, closing idle connections");
        }
        close_all(idle);
    }
}

/// Outcome of one [`DbPool::check_pool`] sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CheckReport {
    /// Free connections closed for exceeding the idle timeout.
    pub expired: usize,
    /// Free connections pinged successfully by the keepalive pass.
    pub pinged: usize,
    /// Free connections closed because their keepalive ping failed.
    pub dead: usize,
}

impl std::ops::AddAssign for CheckReport {
    fn add_assign(&mut self, other: Self) {
        self.expired += other.expired;
        self.pinged += other.pinged;
        self.dead += other.dead;
    }
}

/// Connection pool for a single database target.
///
/// Cheap to clone; clones share the same connections.
pub struct DbPool<C: Connection> {
    shared: Arc<PoolShared<C>>,
}

impl<C: Connection> Clone for DbPool<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Connection> DbPool<C> {
    /// Create an uninitialized pool seeded with `settings`.
    ///
    /// The pool refuses `get` until [`init`](Self::init) succeeds.
    pub fn new(
        id: u32,
        name: impl Into<String>,
        factory: Arc<dyn ConnectionFactory<Connection = C>>,
        settings: PoolSettings,
    ) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                factory,
                state: Mutex::new(PoolState {
                    id,
                    name: name.into(),
                    settings,
                    params: None,
                    fingerprint: None,
                    free: Vec::new(),
                    used: HashMap::new(),
                    pending: 0,
                    revoked: HashSet::new(),
                    next_conn_id: 0,
                }),
                available: Condvar::new(),
            }),
        }
    }

    pub fn id(&self) -> u32 {
        self.shared.lock().id
    }

    pub fn name(&self) -> String {
        self.shared.lock().name.clone()
    }

    pub fn settings(&self) -> PoolSettings {
        self.shared.lock().settings.clone()
    }

    /// Fingerprint of the configured connect parameters, once initialized.
    pub fn fingerprint(&self) -> Option<Fingerprint> {
        self.shared.lock().fingerprint
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.lock().fingerprint.is_some()
    }

    pub fn free_count(&self) -> usize {
        self.shared.lock().free.len()
    }

    pub fn used_count(&self) -> usize {
        self.shared.lock().used.len()
    }

    pub(crate) fn from_shared(shared: Arc<PoolShared<C>>) -> Self {
        Self { shared }
    }

    /// Configure (or reconfigure) the target and sizing of the pool.
    ///
    /// Fields absent from `options` keep their current value. If the
    /// fingerprint of `params` differs from the current one, every free
    /// connection is closed before this returns; lent connections are
    /// closed when they are released.
    pub fn init(
        &self,
        params: ConnectParams,
        options: &PoolOptions,
        name: Option<&str>,
    ) -> PoolResult<()> {
        if params.is_empty() {
            return Err(PoolError::InvalidArgument(
                "connect params must not be empty".to_string(),
            ));
        }
        let fingerprint = params.fingerprint();

        let stale = {
            let mut state = self.shared.lock();
            if let Some(name) = name {
                state.name = name.to_string();
            }
            let stale = match state.fingerprint {
                Some(current) if current != fingerprint => state.drain_free(),
                _ => Vec::new(),
            };
            state.params = Some(params);
            state.fingerprint = Some(fingerprint);
            state.settings = state.settings.merged(options);
            info!(
                pool = %state.name,
                id = state.id,
                hash = %fingerprint,
                max = state.settings.max,
                discarded = stale.len(),
                "pool initialized"
            );
            stale
        };

        // Capacity or the free set may have changed for waiters.
        self.shared.available.notify_all();
        close_all(stale);
        Ok(())
    }

    /// Check out a connection.
    ///
    /// Free connections are pinged before being handed out; dead ones are
    /// closed and the scan restarts. With the free set exhausted a new
    /// connection is created, unless the pool is at `max`: then this fails
    /// immediately when `wait` is false, or waits for capacity. `timeout`
    /// bounds the wait, counted from when it began; zero waits forever.
    pub fn get(&self, wait: bool, timeout: Duration) -> PoolResult<PooledConnection<C>> {
        let mut wait_started: Option<Instant> = None;
        let mut state = self.shared.lock();

        loop {
            let Some(fingerprint) = state.fingerprint else {
                return Err(PoolError::NotInitialized(state.name.clone()));
            };

            let candidate = state
                .free
                .iter_mut()
                .find(|entry| entry.is_ready())
                .and_then(IdleConnection::begin_check);

            if let Some((id, mut conn)) = candidate {
                drop(state);
                let alive = conn.ping();
                state = self.shared.lock();

                match state.position(id) {
                    Some(index) if alive => {
                        if let Err(e) = state.used.try_reserve(1) {
                            state.free[index].slot = Slot::Ready(conn);
                            return Err(e.into());
                        }
                        let entry = state.free.swap_remove(index);
                        state.used.insert(
                            id,
                            LentConnection {
                                fingerprint: entry.fingerprint,
                                last_use: entry.last_use,
                                last_ping: Instant::now(),
                            },
                        );
                        debug!(pool = %state.name, conn = id, "reused free connection");
                        return Ok(PooledConnection::new(
                            id,
                            conn,
                            entry.fingerprint,
                            &self.shared,
                        ));
                    }
                    Some(index) => {
                        state.free.swap_remove(index);
                        debug!(pool = %state.name, conn = id, "free connection failed ping, discarding");
                    }
                    None => {
                        debug!(pool = %state.name, conn = id, "free connection discarded while pinging");
                    }
                }

                drop(state);
                self.shared.available.notify_one();
                conn.close();
                state = self.shared.lock();
                continue;
            }

            if state.at_capacity() {
                if !wait {
                    return Err(state.exhausted(false));
                }
                let started = *wait_started.get_or_insert_with(Instant::now);
                let waited = started.elapsed();
                let slice = if timeout.is_zero() {
                    WAIT_SLICE
                } else if waited >= timeout {
                    debug!(pool = %state.name, ?waited, "timed out waiting for a connection");
                    return Err(state.exhausted(true));
                } else {
                    (timeout - waited).min(WAIT_SLICE)
                };
                state = match self.shared.available.wait_timeout(state, slice) {
                    Ok((guard, _)) => guard,
                    Err(poisoned) => poisoned.into_inner().0,
                };
                continue;
            }

            let Some(params) = state.params.clone() else {
                return Err(PoolError::NotInitialized(state.name.clone()));
            };
            state.pending += 1;
            drop(state);

            let created = self.shared.factory.connect(&params);

            state = self.shared.lock();
            state.pending -= 1;
            let mut conn = match created {
                Ok(conn) => conn,
                Err(e) => {
                    drop(state);
                    self.shared.available.notify_one();
                    return Err(PoolError::Factory(e));
                }
            };

            if let Err(e) = state.used.try_reserve(1) {
                drop(state);
                self.shared.available.notify_one();
                conn.close();
                return Err(e.into());
            }
            let id = state.allocate_id();
            let now = Instant::now();
            state.used.insert(
                id,
                LentConnection {
                    fingerprint,
                    last_use: now,
                    last_ping: now,
                },
            );
            debug!(
                pool = %state.name,
                conn = id,
                free = state.free.len(),
                used = state.used.len(),
                "created new connection"
            );
            return Ok(PooledConnection::new(id, conn, fingerprint, &self.shared));
        }
    }

    /// Return a connection to the free set.
    ///
    /// The connection is pinged first. A dead connection, one created with
    /// connect parameters that have since changed, or one that would exceed
    /// `max_spare` is closed instead of recycled; all of these still return
    /// `Ok`. Fails only when the handle belongs to another pool, in which
    /// case it is handed back untouched.
    pub fn release(&self, mut conn: PooledConnection<C>) -> Result<(), ReturnError<C>> {
        if !conn.belongs_to(&self.shared) {
            let error = PoolError::WrongOwner(format!("pool `{}`", self.name()));
            return Err(ReturnError::new(error, conn));
        }
        let id = conn.id();
        let fingerprint = conn.fingerprint();
        let Some(mut inner) = conn.take() else {
            return Ok(());
        };

        let alive = inner.ping();

        let mut state = self.shared.lock();
        let tracked = state.used.remove(&id).is_some();
        let revoked = state.revoked.remove(&id);

        let reason = if !alive {
            Some("ping failed")
        } else if revoked {
            Some("revoked")
        } else if state.fingerprint != Some(fingerprint) {
            Some("connect parameters changed")
        } else if state.settings.max_spare > 0 && state.free.len() >= state.settings.max_spare {
            Some("spare limit reached")
        } else if !tracked && state.at_capacity() {
            Some("pool full")
        } else if state.free.try_reserve(1).is_err() {
            Some("out of memory")
        } else {
            None
        };

        match reason {
            None => {
                let now = Instant::now();
                state.free.push(IdleConnection {
                    id,
                    slot: Slot::Ready(inner),
                    fingerprint,
                    last_use: now,
                    last_ping: now,
                });
                debug!(
                    pool = %state.name,
                    conn = id,
                    adopted = !tracked,
                    free = state.free.len(),
                    "returned connection to pool"
                );
                drop(state);
                self.shared.available.notify_one();
            }
            Some(reason) => {
                debug!(pool = %state.name, conn = id, reason, "closing connection on release");
                drop(state);
                self.shared.available.notify_one();
                inner.close();
            }
        }
        Ok(())
    }

    /// Close a lent connection without recycling it.
    pub fn destroy(&self, mut conn: PooledConnection<C>) -> Result<(), ReturnError<C>> {
        if !conn.belongs_to(&self.shared) {
            let error = PoolError::WrongOwner(format!("pool `{}`", self.name()));
            return Err(ReturnError::new(error, conn));
        }
        let id = conn.id();
        let Some(mut inner) = conn.take() else {
            return Ok(());
        };

        {
            let mut state = self.shared.lock();
            state.used.remove(&id);
            state.revoked.remove(&id);
            debug!(pool = %state.name, conn = id, "destroyed connection");
        }
        self.shared.available.notify_one();
        inner.close();
        Ok(())
    }

    /// Forget every lent connection.
    ///
    /// Only meant for shutdown: the connections are still in callers' hands.
    /// With `destroy`, each is closed when it comes back; without, a returned
    /// connection is adopted into the free set if it still fits.
    pub fn clear_used_pool(&self, destroy: bool) {
        {
            let mut state = self.shared.lock();
            if !state.used.is_empty() {
                warn!(
                    pool = %state.name,
                    used = state.used.len(),
                    destroy,
                    "clearing connections that are still in use"
                );
            }
            let ids: Vec<u64> = state.used.drain().map(|(id, _)| id).collect();
            if destroy {
                state.revoked.extend(ids);
            }
        }
        self.shared.available.notify_all();
    }

    /// Empty the free set.
    ///
    /// With `destroy` the connections are closed and an empty vector is
    /// returned; otherwise ownership of the still-open connections passes
    /// to the caller.
    pub fn clear_free_pool(&self, destroy: bool) -> Vec<C> {
        let drained = {
            let mut state = self.shared.lock();
            let drained = state.drain_free();
            debug!(pool = %state.name, cleared = drained.len(), destroy, "cleared free connections");
            drained
        };
        self.shared.available.notify_all();
        if destroy {
            close_all(drained);
            Vec::new()
        } else {
            drained
        }
    }

    /// Close everything and return to the uninitialized state.
    ///
    /// Waiters in `get` wake up and fail with `NotInitialized`.
    pub fn shutdown(&self) {
        self.clear_used_pool(true);
        let stale = {
            let mut state = self.shared.lock();
            state.params = None;
            state.fingerprint = None;
            info!(pool = %state.name, id = state.id, "pool shut down");
            state.drain_free()
        };
        self.shared.available.notify_all();
        close_all(stale);
    }

    /// Maintenance sweep: expire long-idle free connections, then ping at
    /// most one free connection whose keepalive is due.
    ///
    /// Pinging a single candidate per call keeps the sweep bounded by one
    /// ping latency; a large idle set is covered over successive calls.
    pub fn check_pool(&self) -> CheckReport {
        let mut report = CheckReport::default();
        let now = Instant::now();

        let (expired, candidate) = {
            let mut state = self.shared.lock();
            if state.fingerprint.is_none() {
                return report;
            }

            let idle_timeout = state.settings.idle_timeout;
            let mut expired = Vec::new();
            if !idle_timeout.is_zero() {
                let mut index = 0;
                while index < state.free.len() {
                    let entry = &state.free[index];
                    if entry.is_ready() && now.saturating_duration_since(entry.last_use) > idle_timeout {
                        expired.extend(state.free.swap_remove(index).into_connection());
                    } else {
                        index += 1;
                    }
                }
            }

            let keepalive = state.settings.keepalive;
            let candidate = if keepalive.is_zero() {
                None
            } else {
                state
                    .free
                    .iter_mut()
                    .find(|entry| {
                        entry.is_ready() && now.saturating_duration_since(entry.last_ping) > keepalive
                    })
                    .and_then(IdleConnection::begin_check)
            };

            if !expired.is_empty() {
                info!(
                    pool = %state.name,
                    expired = expired.len(),
                    remaining_free = state.free.len(),
                    "expired idle connections"
                );
            }
            (expired, candidate)
        };

        report.expired = expired.len();
        if report.expired > 0 {
            self.shared.available.notify_all();
        }
        close_all(expired);

        if let Some((id, mut conn)) = candidate {
            let alive = conn.ping();
            let mut state = self.shared.lock();
            match state.position(id) {
                Some(index) if alive => {
                    let entry = &mut state.free[index];
                    entry.last_ping = Instant::now();
                    entry.slot = Slot::Ready(conn);
                    report.pinged = 1;
                    drop(state);
                    self.shared.available.notify_one();
                }
                Some(index) => {
                    state.free.swap_remove(index);
                    info!(pool = %state.name, conn = id, "removed dead idle connection");
                    drop(state);
                    self.shared.available.notify_one();
                    conn.close();
                    report.dead = 1;
                }
                None => {
                    drop(state);
                    conn.close();
                }
            }
        }

        report
    }

    /// Pre-create connections until the pool holds `min` connections and
    /// `min_spare` free ones, creating at most `grow` per call and never
    /// exceeding `max`. Returns how many were created.
    pub fn warm_up(&self) -> PoolResult<usize> {
        let mut created = 0;
        loop {
            let mut state = self.shared.lock();
            let Some(fingerprint) = state.fingerprint else {
                return Err(PoolError::NotInitialized(state.name.clone()));
            };
            let settings = &state.settings;
            let short = state.total() < settings.min || state.free.len() < settings.min_spare;
            if created >= settings.grow || !short || state.at_capacity() {
                if created > 0 {
                    info!(pool = %state.name, created, free = state.free.len(), "pool warmed");
                }
                return Ok(created);
            }
            let Some(params) = state.params.clone() else {
                return Err(PoolError::NotInitialized(state.name.clone()));
            };
            state.pending += 1;
            drop(state);

            let result = self.shared.factory.connect(&params);

            let mut state = self.shared.lock();
            state.pending -= 1;
            let mut conn = match result {
                Ok(conn) => conn,
                Err(e) => {
                    drop(state);
                    self.shared.available.notify_one();
                    return Err(PoolError::Factory(e));
                }
            };
            // Parameters may have changed while connecting.
            if state.fingerprint != Some(fingerprint) || state.free.try_reserve(1).is_err() {
                drop(state);
                conn.close();
                continue;
            }
            let id = state.allocate_id();
            let now = Instant::now();
            state.free.push(IdleConnection {
                id,
                slot: Slot::Ready(conn),
                fingerprint,
                last_use: now,
                last_ping: now,
            });
            created += 1;
            drop(state);
            self.shared.available.notify_one();
        }
    }

    /// Snapshot of counts and per-connection state.
    pub fn get_status(&self) -> PoolStatus {
        let state = self.shared.lock();
        let free = state.free.iter().map(|entry| ConnectionStatus {
            id: entry.id,
            state: ConnectionState::Free,
            hash: entry.fingerprint.to_hex(),
            last_ping: unix_secs(entry.last_ping),
            last_use: unix_secs(entry.last_use),
        });
        let used = state.used.iter().map(|(id, lent)| ConnectionStatus {
            id: *id,
            state: ConnectionState::Used,
            hash: lent.fingerprint.to_hex(),
            last_ping: unix_secs(lent.last_ping),
            last_use: unix_secs(lent.last_use),
        });
        let mut connections: Vec<ConnectionStatus> = free.chain(used).collect();
        connections.sort_by_key(|c| c.id);

        PoolStatus {
            id: state.id,
            name: state.name.clone(),
            hash: state.fingerprint.map(|fp| fp.to_hex()),
            free: state.free.len(),
            used: state.used.len(),
            settings: state.settings.clone(),
            connections,
        }
    }
}

impl<C: Connection> std::fmt::Debug for DbPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("DbPool")
            .field("id", &state.id)
            .field("name", &state.name)
            .field("free", &state.free.len())
            .field("used", &state.used.len())
            .finish_non_exhaustive()
    }
}

fn close_all<C: Connection>(conns: Vec<C>) {
    for mut conn in conns {
        conn.close();
    }
}
