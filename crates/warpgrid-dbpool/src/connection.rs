//! Connection and factory contracts, and the handle lent out by a pool.
//!
//! The pool knows nothing about the wire protocol behind a connection. It
//! only needs to create one, probe it, and close it:
//!
//! ```text
//! ConnectionFactory::connect(params) → Connection
//! Connection::ping()                 → alive?
//! Connection::close()                → called exactly once by the pool
//! ```

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};

use crate::params::{ConnectParams, Fingerprint};
use crate::pool::PoolShared;

/// A live connection owned by a pool while idle and by a caller while lent.
///
/// Both methods may block on network I/O; the pool never calls them while
/// holding its own lock.
pub trait Connection: Send + 'static {
    /// Non-destructive liveness probe. Returns `true` if the connection is alive.
    fn ping(&mut self) -> bool;
    /// Close the underlying transport.
    fn close(&mut self);
}

impl<C: Connection + ?Sized> Connection for Box<C> {
    fn ping(&mut self) -> bool {
        (**self).ping()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// Creates connections for a pool. Called without any pool lock held.
pub trait ConnectionFactory: Send + Sync {
    type Connection: Connection;

    /// Establish a new connection to the target described by `params`.
    fn connect(&self, params: &ConnectParams) -> anyhow::Result<Self::Connection>;
}

/// A connection checked out of a [`DbPool`](crate::DbPool).
///
/// Hand it back with `release` (recycle) or `destroy` (discard). A handle
/// dropped without either is discarded by its pool so the slot is not lost.
pub struct PooledConnection<C: Connection> {
    /// Identifier unique within the owning pool.
    id: u64,
    /// Taken by the pool when the handle is returned.
    conn: Option<C>,
    /// Fingerprint of the connect parameters this connection was created with.
    fingerprint: Fingerprint,
    /// Back-reference to the lending pool. Used for ownership checks only.
    pool: Weak<PoolShared<C>>,
    /// Set when the handle was obtained through a registry.
    registry: Option<u64>,
}

impl<C: Connection> PooledConnection<C> {
    pub(crate) fn new(
        id: u64,
        conn: C,
        fingerprint: Fingerprint,
        pool: &Arc<PoolShared<C>>,
    ) -> Self {
        Self {
            id,
            conn: Some(conn),
            fingerprint,
            pool: Arc::downgrade(pool),
            registry: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub(crate) fn belongs_to(&self, pool: &Arc<PoolShared<C>>) -> bool {
        std::ptr::eq(self.pool.as_ptr(), Arc::as_ptr(pool))
    }

    pub(crate) fn lender(&self) -> Option<Arc<PoolShared<C>>> {
        self.pool.upgrade()
    }

    pub(crate) fn registry(&self) -> Option<u64> {
        self.registry
    }

    pub(crate) fn stamp_registry(&mut self, registry: u64) {
        self.registry = Some(registry);
    }

    pub(crate) fn take(&mut self) -> Option<C> {
        self.conn.take()
    }

    fn inner(&self) -> &C {
        // Only the pool empties `conn`, and it consumes the handle when it does.
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after being returned"),
        }
    }

    fn inner_mut(&mut self) -> &mut C {
        match &mut self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after being returned"),
        }
    }
}

impl<C: Connection> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.inner()
    }
}

impl<C: Connection> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        self.inner_mut()
    }
}

impl<C: Connection> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        match self.pool.upgrade() {
            Some(pool) => pool.discard(self.id, conn),
            None => conn.close(),
        }
    }
}

impl<C: Connection> std::fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("fingerprint", &self.fingerprint)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
