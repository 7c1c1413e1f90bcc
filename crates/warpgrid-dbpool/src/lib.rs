//! warpgrid-dbpool — database connection pooling for WarpGrid.
//!
//! Keeps a bounded set of reusable connections per logical database,
//! validates them with a ping before reuse, expires idle ones, and
//! addresses many pools by id or name through a registry. Connection
//! establishment is delegated to a [`ConnectionFactory`]; the pools never
//! speak a database protocol themselves.
//!
//! # Architecture
//!
//! ```text
//! PoolRegistry (id ↔ name index, template PoolSettings)
//!   ├── DbPool  "main"    (id 0)
//!   │   ├── free: [IdleConnection …]   pinged before reuse
//!   │   ├── used: {id → LentConnection}
//!   │   └── ConnectionFactory::connect(ConnectParams)
//!   ├── DbPool  "reports" (id 3)
//!   └── MaintenanceThread → check_pool()
//!         ├── close free connections idle past `timeout`
//!         └── ping one connection unpinged past `keepalive`
//! ```
//!
//! # Connection lifecycle
//!
//! `get` hands out a [`PooledConnection`] that remembers its pool. It goes
//! back through `release` (pinged, then recycled or closed) or `destroy`
//! (always closed). A handle dropped without either is discarded by its
//! pool so the capacity slot is never leaked.
//!
//! Connections are interchangeable only when their [`ConnectParams`]
//! share a [`Fingerprint`]: re-initializing a pool with different
//! parameters drops its free connections, and lent ones are closed on
//! return instead of recycled.

pub mod config;
pub mod connection;
pub mod error;
pub mod maintenance;
pub mod options;
pub mod params;
pub mod pool;
pub mod registry;
pub mod status;
pub mod tcp;

pub use config::{DatabaseConfig, DefaultsConfig, RegistryConfig};
pub use connection::{Connection, ConnectionFactory, PooledConnection};
pub use error::{PoolError, PoolResult, ReturnError};
pub use maintenance::MaintenanceThread;
pub use options::{PoolOptions, PoolSettings};
pub use params::{ConnectParams, FINGERPRINT_KEYS, Fingerprint};
pub use pool::{CheckReport, DbPool};
pub use registry::{DEFAULT_POOL_ID, PoolRef, PoolRegistry};
pub use status::{ConnectionState, ConnectionStatus, PoolStatus, RegistryStatus};
pub use tcp::{TcpConnection, TcpConnectionFactory};
