//! Alias-to-pool registry.
//!
//! Requests name a pool by alias. An alias resolves to either a single-target
//! pool or a cluster, and both answer the same `check_out`/`check_in`
//! protocol through [`ConnectionPool`]. The registry is filled once at
//! startup and read-only afterwards.

use crate::config::GatewayConfig;
use crate::db::cluster::ClusteredConnectionPool;
use crate::db::driver::{Connector, DriverConnector};
use crate::db::pool::{ConnectionId, PooledConnection, SimpleConnectionPool};
use crate::error::{DbError, DbResult};
use crate::models::masked_dsn;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};

/// Either kind of pool, behind one checkout protocol.
pub enum ConnectionPool<C: Connector = DriverConnector> {
    Simple(Arc<SimpleConnectionPool<C>>),
    Clustered(ClusteredConnectionPool<C>),
}

impl<C: Connector> ConnectionPool<C> {
    pub fn alias(&self) -> &str {
        match self {
            Self::Simple(pool) => pool.alias(),
            Self::Clustered(cluster) => cluster.alias(),
        }
    }

    /// Check out a connection; `Ok(None)` means no capacity right now.
    pub async fn check_out(
        &self,
        for_write: bool,
    ) -> DbResult<Option<PooledConnection<C::Connection>>> {
        match self {
            Self::Simple(pool) => pool.check_out(for_write).await,
            Self::Clustered(cluster) => cluster.check_out(for_write).await,
        }
    }

    pub fn check_in(&self, conn: PooledConnection<C::Connection>) {
        match self {
            Self::Simple(pool) => pool.check_in(conn),
            Self::Clustered(cluster) => cluster.check_in(conn),
        }
    }

    pub fn discard(&self, id: ConnectionId) {
        match self {
            Self::Simple(pool) => pool.discard(id),
            Self::Clustered(cluster) => cluster.discard(id),
        }
    }

    pub async fn close_idle(&self) -> usize {
        match self {
            Self::Simple(pool) => pool.close_idle().await,
            Self::Clustered(cluster) => cluster.close_idle().await,
        }
    }
}

impl<C: Connector> std::fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Simple(pool) => pool.fmt(f),
            Self::Clustered(cluster) => cluster.fmt(f),
        }
    }
}

pub struct PoolRegistry<C: Connector = DriverConnector> {
    pools: HashMap<String, Arc<ConnectionPool<C>>>,
    /// Single-target pools, also usable as cluster members.
    simple: HashMap<String, Arc<SimpleConnectionPool<C>>>,
}

impl<C: Connector> Default for PoolRegistry<C> {
    fn default() -> Self {
        Self {
            pools: HashMap::new(),
            simple: HashMap::new(),
        }
    }
}

impl<C: Connector> PoolRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_free(&self, alias: &str) -> DbResult<()> {
        if self.pools.contains_key(alias) {
            return Err(DbError::alias_already_defined(alias));
        }
        Ok(())
    }

    /// Register a single-target pool under its own alias.
    pub fn register_simple(
        &mut self,
        pool: SimpleConnectionPool<C>,
    ) -> DbResult<Arc<SimpleConnectionPool<C>>> {
        self.ensure_free(pool.alias())?;

        let alias = pool.alias().to_string();
        let pool = Arc::new(pool);
        self.simple.insert(alias.clone(), Arc::clone(&pool));
        self.pools
            .insert(alias, Arc::new(ConnectionPool::Simple(Arc::clone(&pool))));
        Ok(pool)
    }

    /// Register a cluster over already-registered single-target pools.
    pub fn register_cluster(
        &mut self,
        alias: &str,
        write_to: &str,
        read_from: &[String],
    ) -> DbResult<()> {
        self.ensure_free(alias)?;

        let member = |name: &str| {
            self.simple.get(name).cloned().ok_or_else(|| {
                DbError::config(format!(
                    "Cluster '{}' references unknown db alias '{}'",
                    alias, name
                ))
            })
        };
        let write_target = member(write_to)?;
        let read_targets = read_from
            .iter()
            .map(|name| member(name))
            .collect::<DbResult<Vec<_>>>()?;

        let cluster = ClusteredConnectionPool::new(alias, write_target, read_targets)?;
        self.pools.insert(
            alias.to_string(),
            Arc::new(ConnectionPool::Clustered(cluster)),
        );
        Ok(())
    }

    /// Resolve an alias.
    pub fn get(&self, alias: &str) -> DbResult<Arc<ConnectionPool<C>>> {
        self.pools
            .get(alias)
            .cloned()
            .ok_or_else(|| DbError::unknown_alias(alias))
    }

    pub fn contains(&self, alias: &str) -> bool {
        self.pools.contains_key(alias)
    }

    /// Registered aliases, sorted.
    pub fn aliases(&self) -> Vec<String> {
        let mut aliases: Vec<String> = self.pools.keys().cloned().collect();
        aliases.sort();
        aliases
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Open and validate one connection per single-target pool.
    pub async fn probe_all(&self) -> DbResult<()> {
        for (alias, pool) in &self.simple {
            if let Err(e) = pool.probe().await {
                error!(alias = %alias, error = %e, "Connection check failed");
                return Err(e);
            }
            info!(alias = %alias, "Connection check passed");
        }
        Ok(())
    }

    /// Close idle connections of every pool. Used at shutdown.
    pub async fn close_all(&self) -> usize {
        let mut closed = 0;
        for pool in self.simple.values() {
            closed += pool.close_idle().await;
        }
        closed
    }
}

impl PoolRegistry<DriverConnector> {
    /// Build every configured pool and cluster.
    pub fn from_config(config: &GatewayConfig) -> DbResult<Self> {
        let mut registry = Self::new();

        for alias_config in &config.db_aliases {
            let db_type = alias_config.db_type()?;
            let policy = alias_config.policy();
            let connector = DriverConnector::new(
                &alias_config.alias,
                db_type,
                &alias_config.dsn,
                alias_config.username.as_deref(),
                alias_config.password.as_deref(),
                policy.connect_timeout,
            )?;

            info!(
                alias = %alias_config.alias,
                db_type = %db_type,
                dsn = %masked_dsn(&alias_config.dsn),
                max_connections = policy.max_connections,
                "Registering connection pool"
            );
            registry.register_simple(SimpleConnectionPool::new(
                &alias_config.alias,
                policy,
                connector,
            ))?;
        }

        for cluster in &config.clusters {
            info!(
                alias = %cluster.alias,
                write_to = %cluster.write_to,
                read_from = ?cluster.read_from,
                "Registering cluster"
            );
            registry.register_cluster(&cluster.alias, &cluster.write_to, &cluster.read_from)?;
        }

        Ok(registry)
    }
}

impl<C: Connector> std::fmt::Debug for PoolRegistry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("aliases", &self.aliases())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::pool::testing::{MockConnector, mock_pool};

    fn registry() -> PoolRegistry<MockConnector> {
        let mut registry = PoolRegistry::new();
        registry.register_simple(mock_pool("primary", 2)).unwrap();
        registry.register_simple(mock_pool("replica", 2)).unwrap();
        registry
            .register_cluster("main", "primary", &["replica".to_string()])
            .unwrap();
        registry
    }

    #[test]
    fn test_get_unknown_alias() {
        let err = registry().get("nope").unwrap_err();
        assert_eq!(err.to_string(), "Alias 'nope' is missing");
    }

    #[test]
    fn test_duplicate_simple_alias_rejected() {
        let mut registry = registry();
        let err = registry.register_simple(mock_pool("primary", 1)).unwrap_err();
        assert!(matches!(err, DbError::AliasAlreadyDefined { .. }));
    }

    #[test]
    fn test_duplicate_cluster_alias_rejected() {
        let mut registry = registry();
        let err = registry
            .register_cluster("primary", "primary", &["replica".to_string()])
            .unwrap_err();
        assert!(matches!(err, DbError::AliasAlreadyDefined { .. }));

        let err = registry
            .register_cluster("main", "primary", &["replica".to_string()])
            .unwrap_err();
        assert!(matches!(err, DbError::AliasAlreadyDefined { .. }));
    }

    #[test]
    fn test_cluster_with_unknown_member_rejected() {
        let mut registry = registry();
        let err = registry
            .register_cluster("other", "primary", &["ghost".to_string()])
            .unwrap_err();
        assert!(err.to_string().contains("ghost"));
        assert!(!registry.contains("other"));
    }

    #[test]
    fn test_aliases_sorted() {
        assert_eq!(registry().aliases(), vec!["main", "primary", "replica"]);
    }

    #[tokio::test]
    async fn test_connection_pool_dispatch() {
        let registry = registry();
        let main = registry.get("main").unwrap();
        assert_eq!(main.alias(), "main");

        let read = main.check_out(false).await.unwrap().unwrap();
        assert_eq!(read.origin(), "replica");
        let write = main.check_out(true).await.unwrap().unwrap();
        assert_eq!(write.origin(), "primary");
        main.check_in(read);
        main.check_in(write);

        let primary = registry.get("primary").unwrap();
        let conn = primary.check_out(false).await.unwrap().unwrap();
        primary.check_in(conn);
        assert_eq!(registry.close_all().await, 2);
    }

    #[tokio::test]
    async fn test_probe_all() {
        registry().probe_all().await.unwrap();

        let mut registry = PoolRegistry::new();
        registry
            .register_simple(SimpleConnectionPool::new(
                "down",
                crate::db::pool::testing::policy(1),
                MockConnector::failing(),
            ))
            .unwrap();
        assert!(registry.probe_all().await.is_err());
    }
}
