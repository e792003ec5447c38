//! Connection pooling for mysqlwire sessions.
//!
//! A [`Pool`] hands each session to one borrower at a time. When a
//! [`PooledConnection`] is dropped the session is reset with
//! COM_RESET_CONNECTION before it goes back to the idle list; a session that
//! fails the reset is closed instead.
//!
//! Pools are kept in an explicit [`PoolRegistry`] value owned by the
//! application. There is no process-wide pool state.
//!
//! # Example
//!
//! ```rust,ignore
//! use mysqlwire::MySqlConfig;
//! use mysqlwire_pool::{MySqlManager, PoolConfig, PoolRegistry};
//!
//! let registry = PoolRegistry::new();
//! let config = MySqlConfig::from_url("mysql://root@localhost/test")?;
//! registry.create("main", MySqlManager::new(config), PoolConfig::new(8))?;
//!
//! let pool = registry.get("main").expect("registered above");
//! let mut conn = pool.acquire()?;
//! conn.query_all("SELECT 1", &[])?;
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use mysqlwire::{MySqlConfig, MySqlConnection};
use mysqlwire_core::{Error, Result, TransportErrorKind, UsageErrorKind};

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Minimum number of connections to maintain
    pub min_connections: usize,
    /// Maximum number of connections allowed
    pub max_connections: usize,
    /// Connection idle timeout in milliseconds
    pub idle_timeout_ms: u64,
    /// Maximum time to wait for a connection in milliseconds
    pub acquire_timeout_ms: u64,
    /// Maximum lifetime of a connection in milliseconds
    pub max_lifetime_ms: u64,
    /// Test connections before giving them out
    pub test_on_checkout: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 10,
            idle_timeout_ms: 600_000,   // 10 minutes
            acquire_timeout_ms: 30_000, // 30 seconds
            max_lifetime_ms: 1_800_000, // 30 minutes
            test_on_checkout: true,
        }
    }
}

impl PoolConfig {
    /// Create a pool configuration with the given max connections.
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            ..Default::default()
        }
    }

    pub fn min_connections(mut self, n: usize) -> Self {
        self.min_connections = n;
        self
    }

    pub fn idle_timeout(mut self, ms: u64) -> Self {
        self.idle_timeout_ms = ms;
        self
    }

    pub fn acquire_timeout(mut self, ms: u64) -> Self {
        self.acquire_timeout_ms = ms;
        self
    }

    pub fn max_lifetime(mut self, ms: u64) -> Self {
        self.max_lifetime_ms = ms;
        self
    }

    /// Ping idle connections before handing them out.
    pub fn test_on_checkout(mut self, enabled: bool) -> Self {
        self.test_on_checkout = enabled;
        self
    }

    #[allow(clippy::result_large_err)]
    fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(Error::config("max_connections must be at least 1"));
        }
        if self.min_connections > self.max_connections {
            return Err(Error::config(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        Ok(())
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total number of connections, idle or borrowed
    pub total_connections: usize,
    /// Connections waiting in the idle list
    pub idle_connections: usize,
    /// Connections currently borrowed
    pub active_connections: usize,
    /// Callers blocked in `acquire`
    pub pending_requests: usize,
}

/// The pool boundary of a session type: how to open, recycle, check and
/// close one.
pub trait ConnectionManager: Send + Sync + 'static {
    type Connection: Send;

    #[allow(clippy::result_large_err)]
    fn open(&self) -> Result<Self::Connection>;

    /// Bring a returned connection back to a clean state.
    #[allow(clippy::result_large_err)]
    fn reset(&self, conn: &mut Self::Connection) -> Result<()>;

    fn is_healthy(&self, conn: &mut Self::Connection) -> bool;

    fn close(&self, conn: Self::Connection);
}

/// Opens blocking [`MySqlConnection`]s from a config.
#[derive(Debug, Clone)]
pub struct MySqlManager {
    config: MySqlConfig,
}

impl MySqlManager {
    pub fn new(config: MySqlConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MySqlConfig {
        &self.config
    }
}

impl ConnectionManager for MySqlManager {
    type Connection = MySqlConnection;

    fn open(&self) -> Result<MySqlConnection> {
        MySqlConnection::connect(self.config.clone())
    }

    fn reset(&self, conn: &mut MySqlConnection) -> Result<()> {
        conn.reset()
    }

    fn is_healthy(&self, conn: &mut MySqlConnection) -> bool {
        conn.is_healthy()
    }

    fn close(&self, conn: MySqlConnection) {
        if let Err(e) = conn.close() {
            debug!(error = %e, "Error while closing pooled connection");
        }
    }
}

struct Idle<C> {
    conn: C,
    created: Instant,
    returned: Instant,
}

struct PoolState<C> {
    idle: VecDeque<Idle<C>>,
    /// Idle plus borrowed plus being opened
    total: usize,
    closed: bool,
}

/// A connection pool.
pub struct Pool<M: ConnectionManager = MySqlManager> {
    config: PoolConfig,
    manager: M,
    state: Mutex<PoolState<M::Connection>>,
    available: Condvar,
    pending: AtomicUsize,
}

impl<M: ConnectionManager> std::fmt::Debug for Pool<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl<M: ConnectionManager> Pool<M> {
    /// Create a pool and open `min_connections` connections up front.
    #[allow(clippy::result_large_err)]
    pub fn open(manager: M, config: PoolConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let pool = Arc::new(Self {
            config,
            manager,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                total: 0,
                closed: false,
            }),
            available: Condvar::new(),
            pending: AtomicUsize::new(0),
        });
        for _ in 0..pool.config.min_connections {
            let conn = pool.manager.open()?;
            let now = Instant::now();
            let mut state = pool.lock();
            state.total += 1;
            state.idle.push_back(Idle {
                conn,
                created: now,
                returned: now,
            });
        }
        debug!(
            min = pool.config.min_connections,
            max = pool.config.max_connections,
            "Opened connection pool"
        );
        Ok(pool)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn manager(&self) -> &M {
        &self.manager
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            total_connections: state.total,
            idle_connections: state.idle.len(),
            active_connections: state.total - state.idle.len(),
            pending_requests: self.pending.load(Ordering::Relaxed),
        }
    }

    pub fn at_capacity(&self) -> bool {
        self.lock().total >= self.config.max_connections
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<M::Connection>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn expired(&self, entry: &Idle<M::Connection>) -> bool {
        let lifetime = Duration::from_millis(self.config.max_lifetime_ms);
        let idle = Duration::from_millis(self.config.idle_timeout_ms);
        entry.created.elapsed() >= lifetime || entry.returned.elapsed() >= idle
    }

    /// Give up one slot of `total` and wake a waiter.
    fn forget_one(&self) {
        let mut state = self.lock();
        state.total = state.total.saturating_sub(1);
        drop(state);
        self.available.notify_one();
    }

    fn discard(&self, conn: M::Connection) {
        self.manager.close(conn);
        self.forget_one();
    }

    /// Borrow a connection, waiting up to `acquire_timeout_ms` for one to
    /// come back when the pool is at capacity.
    #[allow(clippy::result_large_err)]
    pub fn acquire(self: &Arc<Self>) -> Result<PooledConnection<M>> {
        let deadline = Instant::now() + Duration::from_millis(self.config.acquire_timeout_ms);
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(Error::usage(UsageErrorKind::Closed, "connection pool is closed"));
            }

            if let Some(entry) = state.idle.pop_front() {
                drop(state);
                if self.expired(&entry) {
                    debug!("Retiring expired pooled connection");
                    self.discard(entry.conn);
                    state = self.lock();
                    continue;
                }
                let mut conn = entry.conn;
                if self.config.test_on_checkout && !self.manager.is_healthy(&mut conn) {
                    warn!("Dropping pooled connection that failed its health check");
                    self.discard(conn);
                    state = self.lock();
                    continue;
                }
                return Ok(PooledConnection::new(Arc::clone(self), conn, entry.created));
            }

            if state.total < self.config.max_connections {
                state.total += 1;
                drop(state);
                return match self.manager.open() {
                    Ok(conn) => {
                        debug!("Opened pooled connection");
                        Ok(PooledConnection::new(Arc::clone(self), conn, Instant::now()))
                    }
                    Err(e) => {
                        self.forget_one();
                        Err(e)
                    }
                };
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::transport(
                    TransportErrorKind::Timeout,
                    format!(
                        "timed out after {}ms waiting for a pooled connection",
                        self.config.acquire_timeout_ms
                    ),
                ));
            }
            self.pending.fetch_add(1, Ordering::Relaxed);
            let (guard, _) = self
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            self.pending.fetch_sub(1, Ordering::Relaxed);
            state = guard;
        }
    }

    fn recycle(&self, mut conn: M::Connection, created: Instant) {
        if self.lock().closed {
            self.discard(conn);
            return;
        }
        if let Err(e) = self.manager.reset(&mut conn) {
            warn!(error = %e, "Closing pooled connection that failed to reset");
            self.discard(conn);
            return;
        }
        let mut state = self.lock();
        if state.closed {
            drop(state);
            self.discard(conn);
            return;
        }
        state.idle.push_back(Idle {
            conn,
            created,
            returned: Instant::now(),
        });
        drop(state);
        self.available.notify_one();
    }

    /// Close every idle connection and refuse further acquires. Borrowed
    /// connections are closed as they come back.
    pub fn close(&self) {
        let idle: Vec<_> = {
            let mut state = self.lock();
            state.closed = true;
            let idle: Vec<_> = state.idle.drain(..).collect();
            state.total -= idle.len();
            idle
        };
        let count = idle.len();
        for entry in idle {
            self.manager.close(entry.conn);
        }
        self.available.notify_all();
        debug!(closed = count, "Closed connection pool");
    }
}

/// A connection borrowed from the pool.
///
/// Dereferences to the session. Dropping it resets the session and returns
/// it to the pool.
pub struct PooledConnection<M: ConnectionManager = MySqlManager> {
    pool: Arc<Pool<M>>,
    conn: Option<M::Connection>,
    created: Instant,
}

impl<M: ConnectionManager> PooledConnection<M> {
    fn new(pool: Arc<Pool<M>>, conn: M::Connection, created: Instant) -> Self {
        Self {
            pool,
            conn: Some(conn),
            created,
        }
    }

    /// Take the connection out of the pool for good.
    pub fn into_inner(mut self) -> M::Connection {
        let conn = self.conn.take();
        self.pool.forget_one();
        match conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection already released"),
        }
    }

    /// Close the connection instead of returning it, e.g. after an error
    /// that left it unusable.
    pub fn discard(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.discard(conn);
        }
    }

    pub fn pool(&self) -> &Arc<Pool<M>> {
        &self.pool
    }
}

impl<M: ConnectionManager> std::fmt::Debug for PooledConnection<M>
where
    M::Connection: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .finish_non_exhaustive()
    }
}

impl<M: ConnectionManager> std::ops::Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection already released"),
        }
    }
}

impl<M: ConnectionManager> std::ops::DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection already released"),
        }
    }
}

impl<M: ConnectionManager> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.recycle(conn, self.created);
        }
    }
}

/// Named pools owned by the application.
pub struct PoolRegistry<M: ConnectionManager = MySqlManager> {
    pools: Mutex<HashMap<String, Arc<Pool<M>>>>,
}

impl<M: ConnectionManager> Default for PoolRegistry<M> {
    fn default() -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
        }
    }
}

impl<M: ConnectionManager> std::fmt::Debug for PoolRegistry<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("pools", &self.names())
            .finish()
    }
}

impl<M: ConnectionManager> PoolRegistry<M> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Pool<M>>>> {
        self.pools.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a pool and register it under `name`. Fails if the name is taken.
    #[allow(clippy::result_large_err)]
    pub fn create(&self, name: &str, manager: M, config: PoolConfig) -> Result<Arc<Pool<M>>> {
        if self.lock().contains_key(name) {
            return Err(Error::usage(
                UsageErrorKind::InvalidArgument,
                format!("a pool named '{name}' already exists"),
            ));
        }
        let pool = Pool::open(manager, config)?;
        let mut pools = self.lock();
        if pools.contains_key(name) {
            drop(pools);
            pool.close();
            return Err(Error::usage(
                UsageErrorKind::InvalidArgument,
                format!("a pool named '{name}' already exists"),
            ));
        }
        pools.insert(name.to_string(), Arc::clone(&pool));
        debug!(pool = name, "Registered connection pool");
        Ok(pool)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Pool<M>>> {
        self.lock().get(name).cloned()
    }

    /// Close and unregister a pool. Returns false if there was none.
    pub fn close(&self, name: &str) -> bool {
        let removed = self.lock().remove(name);
        match removed {
            Some(pool) => {
                pool.close();
                true
            }
            None => false,
        }
    }

    pub fn close_all(&self) {
        let pools: Vec<_> = self.lock().drain().map(|(_, pool)| pool).collect();
        for pool in pools {
            pool.close();
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }
}
