//! Read/write-splitting pool over several single-target pools.
//!
//! Writes always go to one designated pool. Reads are spread round-robin over
//! an ordered list of read targets; when a target is exhausted or cannot open
//! a connection the next one is tried, at most once per target per checkout.
//! Every handed-out connection is recorded against the alias of the pool that
//! produced it so `check_in` can route it home.

use crate::db::driver::{Connector, DriverConnector};
use crate::db::pool::{ConnectionId, PooledConnection, SimpleConnectionPool};
use crate::error::{DbError, DbResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

struct Routing {
    /// Next read target, as an index into `read_aliases`.
    cursor: usize,
    /// Which member pool each outstanding connection came from.
    checked_out: HashMap<ConnectionId, String>,
}

pub struct ClusteredConnectionPool<C: Connector = DriverConnector> {
    alias: String,
    members: HashMap<String, Arc<SimpleConnectionPool<C>>>,
    write_alias: String,
    read_aliases: Vec<String>,
    routing: Mutex<Routing>,
}

impl<C: Connector> ClusteredConnectionPool<C> {
    /// Assemble a cluster. The write target may also appear among the readers.
    pub fn new(
        alias: impl Into<String>,
        write_target: Arc<SimpleConnectionPool<C>>,
        read_targets: Vec<Arc<SimpleConnectionPool<C>>>,
    ) -> DbResult<Self> {
        let alias = alias.into();
        if read_targets.is_empty() {
            return Err(DbError::config(format!(
                "Cluster '{}' has no read targets",
                alias
            )));
        }

        let write_alias = write_target.alias().to_string();
        let read_aliases: Vec<String> = read_targets
            .iter()
            .map(|pool| pool.alias().to_string())
            .collect();

        let mut members = HashMap::new();
        members.insert(write_alias.clone(), write_target);
        for pool in read_targets {
            members.insert(pool.alias().to_string(), pool);
        }

        debug!(
            alias = %alias,
            write_to = %write_alias,
            read_from = ?read_aliases,
            "Cluster initialized"
        );

        Ok(Self {
            alias,
            members,
            write_alias,
            read_aliases,
            routing: Mutex::new(Routing {
                cursor: 0,
                checked_out: HashMap::new(),
            }),
        })
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn write_alias(&self) -> &str {
        &self.write_alias
    }

    pub fn read_aliases(&self) -> &[String] {
        &self.read_aliases
    }

    /// Distinct member pools.
    pub fn members(&self) -> impl Iterator<Item = &Arc<SimpleConnectionPool<C>>> {
        self.members.values()
    }

    fn lock_routing(&self) -> MutexGuard<'_, Routing> {
        self.routing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn member(&self, alias: &str) -> DbResult<&Arc<SimpleConnectionPool<C>>> {
        self.members
            .get(alias)
            .ok_or_else(|| DbError::internal(format!("Cluster '{}' has no member '{}'", self.alias, alias)))
    }

    fn track(&self, conn: &PooledConnection<C::Connection>, member: &str) {
        self.lock_routing()
            .checked_out
            .insert(conn.id(), member.to_string());
    }

    /// Check out a connection.
    ///
    /// Writes go to the write target with no failover. Reads walk the read
    /// targets from the shared cursor. `Ok(None)` means at least one read
    /// target was at capacity; when every target failed, the last error is
    /// returned.
    pub async fn check_out(
        &self,
        for_write: bool,
    ) -> DbResult<Option<PooledConnection<C::Connection>>> {
        if for_write {
            let pool = self.member(&self.write_alias)?;
            let conn = pool.check_out(true).await?;
            if let Some(conn) = &conn {
                self.track(conn, &self.write_alias);
            }
            return Ok(conn);
        }

        let targets = self.read_aliases.len();
        let mut last_error = None;
        let mut any_full = false;
        for _ in 0..targets {
            let target = {
                let mut routing = self.lock_routing();
                let idx = routing.cursor % targets;
                routing.cursor = (idx + 1) % targets;
                &self.read_aliases[idx]
            };

            let pool = self.member(target)?;
            match pool.check_out(false).await {
                Ok(Some(conn)) => {
                    debug!(cluster = %self.alias, target = %target, "Read connection checked out");
                    self.track(&conn, target);
                    return Ok(Some(conn));
                }
                Ok(None) => {
                    any_full = true;
                    debug!(cluster = %self.alias, target = %target, "Read target exhausted, failing over");
                }
                Err(e) => {
                    warn!(
                        cluster = %self.alias,
                        target = %target,
                        error = %e,
                        "Read target unavailable, failing over"
                    );
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if !any_full => Err(e),
            _ => {
                debug!(cluster = %self.alias, "All read targets exhausted");
                Ok(None)
            }
        }
    }

    /// Return a connection to the member pool it came from.
    pub fn check_in(&self, conn: PooledConnection<C::Connection>) {
        let origin = self.lock_routing().checked_out.remove(&conn.id());
        match origin.as_deref().and_then(|alias| self.members.get(alias)) {
            Some(pool) => pool.check_in(conn),
            None => warn!(
                cluster = %self.alias,
                connection = %conn.id(),
                "Checked in a connection this cluster did not check out; dropping it"
            ),
        }
    }

    /// Release the slot of a connection that will not come back.
    pub fn discard(&self, id: ConnectionId) {
        let origin = self.lock_routing().checked_out.remove(&id);
        if let Some(pool) = origin.as_deref().and_then(|alias| self.members.get(alias)) {
            pool.discard(id);
        }
    }

    /// Connections currently checked out through this cluster.
    pub fn outstanding(&self) -> usize {
        self.lock_routing().checked_out.len()
    }

    /// Close idle connections of every member.
    pub async fn close_idle(&self) -> usize {
        let mut closed = 0;
        for pool in self.members.values() {
            closed += pool.close_idle().await;
        }
        closed
    }
}

impl<C: Connector> std::fmt::Debug for ClusteredConnectionPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusteredConnectionPool")
            .field("alias", &self.alias)
            .field("write_alias", &self.write_alias)
            .field("read_aliases", &self.read_aliases)
            .finish_non_exhaustive()
    }
}
