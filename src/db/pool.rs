//! Single-target connection pool.
//!
//! A [`SimpleConnectionPool`] keeps a bounded set of reusable connections to
//! one database. Its connections are partitioned into *in-use* and *idle*;
//! both sets live behind one mutex and are only touched by `check_out`,
//! `check_in` and `discard`. The mutex is never held across an await point:
//! slow work (connecting, validating, closing) happens after a slot has been
//! reserved in the in-use set, so `|in-use| <= max_connections` holds even
//! while a connection is still being opened.
//!
//! # Checkout order
//!
//! 1. Pool at capacity: return `None` immediately.
//! 2. Destroy every idle entry older than `idle_expiration`.
//! 3. Take an idle entry, validate it, and return it; invalid entries are
//!    destroyed and the scan continues.
//! 4. Nothing reusable: open a new connection through the [`Connector`].

use crate::db::driver::{Connector, DriverConnector};
use crate::error::{DbError, DbResult};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const DEFAULT_MAX_CONNECTIONS: usize = 25;
pub const DEFAULT_IDLE_EXPIRATION_SECS: u64 = 30;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Pool sizing and lifetime policy, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolPolicy {
    pub max_connections: usize,
    /// Idle connections older than this are destroyed instead of reused.
    pub idle_expiration: Duration,
    pub connect_timeout: Duration,
}

impl Default for PoolPolicy {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            idle_expiration: Duration::from_secs(DEFAULT_IDLE_EXPIRATION_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique identity of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A connection checked out of a pool.
///
/// Exclusively owned by whoever checked it out until it is handed back with
/// `check_in`. Dereferences to the underlying driver connection.
pub struct PooledConnection<T> {
    id: ConnectionId,
    /// Alias of the pool that created this connection.
    origin: String,
    conn: T,
}

impl<T> PooledConnection<T> {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Unwrap the driver connection, leaving the pool's bookkeeping behind.
    pub fn into_inner(self) -> T {
        self.conn
    }
}

impl<T> Deref for PooledConnection<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.conn
    }
}

impl<T> DerefMut for PooledConnection<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.conn
    }
}

impl<T> std::fmt::Debug for PooledConnection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

/// An idle connection and the time it was last handed back.
struct PoolEntry<T> {
    conn: PooledConnection<T>,
    last_activity: Instant,
}

struct PoolState<T> {
    /// Checked-out connections (and slots reserved for connections being
    /// opened), keyed by id, with their checkout time.
    in_use: HashMap<ConnectionId, Instant>,
    idle: Vec<PoolEntry<T>>,
}

/// Point-in-time connection counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// In-use plus idle.
    pub open: usize,
    /// `max_connections - in-use`.
    pub available: usize,
    /// In-use.
    pub unavailable: usize,
}

/// Bounded pool of reusable connections to one database.
pub struct SimpleConnectionPool<C: Connector = DriverConnector> {
    alias: String,
    policy: PoolPolicy,
    connector: C,
    state: Mutex<PoolState<C::Connection>>,
}

impl<C: Connector> SimpleConnectionPool<C> {
    /// Create an empty pool. No connection is opened until the first checkout.
    pub fn new(alias: impl Into<String>, policy: PoolPolicy, connector: C) -> Self {
        let alias = alias.into();
        debug!(
            alias = %alias,
            max_connections = policy.max_connections,
            idle_expiration_secs = policy.idle_expiration.as_secs(),
            "Connection pool initialized"
        );
        Self {
            alias,
            policy,
            connector,
            state: Mutex::new(PoolState {
                in_use: HashMap::new(),
                idle: Vec::new(),
            }),
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn policy(&self) -> &PoolPolicy {
        &self.policy
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState<C::Connection>> {
        // A panic while holding the lock cannot leave the partition half-updated:
        // every critical section is a handful of map/vec operations.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check out a connection.
    ///
    /// Returns `Ok(None)` when the pool is at capacity; the caller decides
    /// whether to wait and retry. Fails with `DatabaseUnavailable` when a new
    /// connection cannot be opened. `for_write` is accepted for parity with
    /// clustered pools and does not change single-target behavior.
    pub async fn check_out(
        &self,
        for_write: bool,
    ) -> DbResult<Option<PooledConnection<C::Connection>>> {
        loop {
            let (candidate, expired, slot) = {
                let mut state = self.lock_state();

                if state.in_use.len() >= self.policy.max_connections {
                    debug!(
                        alias = %self.alias,
                        in_use = state.in_use.len(),
                        "Max connections reached"
                    );
                    return Ok(None);
                }

                let now = Instant::now();
                let idle_expiration = self.policy.idle_expiration;
                let (expired, fresh): (Vec<_>, Vec<_>) = std::mem::take(&mut state.idle)
                    .into_iter()
                    .partition(|entry| now.duration_since(entry.last_activity) > idle_expiration);
                state.idle = fresh;

                let candidate = state.idle.pop().map(|entry| entry.conn);
                let slot = candidate
                    .as_ref()
                    .map_or_else(ConnectionId::next, |conn| conn.id);
                state.in_use.insert(slot, now);
                (candidate, expired, slot)
            };
            // Everything below may be cancelled at an await point; the
            // reservation gives the slot back unless it is kept.
            let reservation = SlotReservation::new(self, slot);

            for entry in expired {
                debug!(alias = %self.alias, connection = %entry.conn.id, "Idle connection expired");
                self.connector.close(entry.conn.into_inner()).await;
            }

            if let Some(mut conn) = candidate {
                if self.connector.is_alive(&mut conn.conn).await {
                    reservation.keep();
                    debug!(
                        alias = %self.alias,
                        connection = %conn.id,
                        for_write,
                        "Connection checked out"
                    );
                    return Ok(Some(conn));
                }

                debug!(alias = %self.alias, connection = %conn.id, "Connection failed validation");
                drop(reservation);
                self.connector.close(conn.into_inner()).await;
                continue;
            }

            let conn = self.connector.connect().await?;
            reservation.keep();
            debug!(alias = %self.alias, connection = %slot, for_write, "New connection created");
            return Ok(Some(PooledConnection {
                id: slot,
                origin: self.alias.clone(),
                conn,
            }));
        }
    }

    /// Return a connection to the idle set with a refreshed timestamp.
    ///
    /// A connection this pool does not have checked out is logged and dropped.
    pub fn check_in(&self, conn: PooledConnection<C::Connection>) {
        let mut state = self.lock_state();
        if state.in_use.remove(&conn.id).is_none() {
            warn!(
                alias = %self.alias,
                connection = %conn.id,
                origin = %conn.origin,
                "Checked in a connection this pool did not check out; dropping it"
            );
            return;
        }

        debug!(alias = %self.alias, connection = %conn.id, "Connection checked in");
        state.idle.push(PoolEntry {
            conn,
            last_activity: Instant::now(),
        });
    }

    /// Release the in-use slot of a connection that will not come back.
    pub fn discard(&self, id: ConnectionId) {
        if self.lock_state().in_use.remove(&id).is_some() {
            warn!(alias = %self.alias, connection = %id, "Connection discarded");
        }
    }

    /// Total connections: in-use plus idle.
    pub fn open_count(&self) -> usize {
        let state = self.lock_state();
        state.in_use.len() + state.idle.len()
    }

    /// Remaining checkout capacity.
    pub fn available_count(&self) -> usize {
        self.policy
            .max_connections
            .saturating_sub(self.lock_state().in_use.len())
    }

    /// Connections currently checked out.
    pub fn unavailable_count(&self) -> usize {
        self.lock_state().in_use.len()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock_state();
        PoolStats {
            open: state.in_use.len() + state.idle.len(),
            available: self.policy.max_connections.saturating_sub(state.in_use.len()),
            unavailable: state.in_use.len(),
        }
    }

    /// Close every idle connection. Checked-out connections are unaffected.
    pub async fn close_idle(&self) -> usize {
        let idle = std::mem::take(&mut self.lock_state().idle);
        let closed = idle.len();
        for entry in idle {
            self.connector.close(entry.conn.into_inner()).await;
        }
        if closed > 0 {
            debug!(alias = %self.alias, closed, "Closed idle connections");
        }
        closed
    }

    /// Open, validate and close one connection without touching the pool.
    pub async fn probe(&self) -> DbResult<()> {
        let mut conn = self.connector.connect().await?;
        let alive = self.connector.is_alive(&mut conn).await;
        self.connector.close(conn).await;
        if alive {
            Ok(())
        } else {
            Err(DbError::database_unavailable(
                &self.alias,
                "connection failed validation",
            ))
        }
    }
}

/// An in-use slot held while a checkout is still in progress.
///
/// Dropping it releases the slot; [`SlotReservation::keep`] hands it over to
/// the connection being returned.
struct SlotReservation<'p, C: Connector> {
    pool: &'p SimpleConnectionPool<C>,
    id: Option<ConnectionId>,
}

impl<'p, C: Connector> SlotReservation<'p, C> {
    fn new(pool: &'p SimpleConnectionPool<C>, id: ConnectionId) -> Self {
        Self { pool, id: Some(id) }
    }

    fn keep(mut self) {
        self.id = None;
    }
}

impl<C: Connector> Drop for SlotReservation<'_, C> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.pool.lock_state().in_use.remove(&id);
            debug!(alias = %self.pool.alias, connection = %id, "Released checkout slot");
        }
    }
}

impl<C: Connector> std::fmt::Debug for SimpleConnectionPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimpleConnectionPool")
            .field("alias", &self.alias)
            .field("policy", &self.policy)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
