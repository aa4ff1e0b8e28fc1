//! Statement batch execution.
//!
//! A batch runs on exactly one connection checked out from the alias's pool
//! and always handed back afterwards, whatever the outcome.
//!
//! # Modes
//!
//! - **Query**: statements run one by one and each produces its own result.
//!   A failing statement yields an error entry and the rest still run.
//! - **Update**: the whole batch runs in one transaction. A single statement
//!   executes directly; several statements are grouped so that identical
//!   parameterized texts share one prepared statement, followed by the raw
//!   statements. Any failure rolls everything back and the batch reports one
//!   error entry; success reports one empty success entry.

use crate::db::driver::{Connector, DriverConnector};
use crate::db::macro_cache::{MacroResolver, expand_macros};
use crate::db::params::{ParamValue, bind_params};
use crate::db::pool::PooledConnection;
use crate::db::registry::ConnectionPool;
use crate::db::types::{column_names, column_types, row_values};
use crate::error::{DbError, DbResult};
use crate::models::{
    BatchMode, BatchRequest, BatchResult, StatementResult, StatementSpec, encode_batch_result,
    error_body,
};
use sqlx::{Any, AnyConnection, Connection, Executor, Row};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const DEFAULT_CHECKOUT_TIMEOUT_SECS: u64 = 30;

const INITIAL_BACKOFF: Duration = Duration::from_millis(5);
const MAX_BACKOFF: Duration = Duration::from_millis(100);

/// Runs statement batches against a pool.
pub struct StatementExecutor {
    checkout_timeout: Duration,
    macros: Option<Arc<dyn MacroResolver>>,
}

impl StatementExecutor {
    /// Create an executor with default settings.
    pub fn new() -> Self {
        Self {
            checkout_timeout: Duration::from_secs(DEFAULT_CHECKOUT_TIMEOUT_SECS),
            macros: None,
        }
    }

    /// Create an executor that gives up waiting for a connection after `timeout`.
    pub fn with_checkout_timeout(timeout: Duration) -> Self {
        Self {
            checkout_timeout: timeout,
            ..Self::new()
        }
    }

    /// Expand `$name` statements through `resolver` before execution.
    pub fn with_macros(mut self, resolver: Arc<dyn MacroResolver>) -> Self {
        self.macros = Some(resolver);
        self
    }

    pub fn checkout_timeout(&self) -> Duration {
        self.checkout_timeout
    }

    /// Parse a JSON statement array and expand macros.
    pub fn prepare(&self, json: &str, mode: BatchMode) -> DbResult<BatchRequest> {
        let mut request = BatchRequest::parse(json, mode)?;
        if let Some(macros) = &self.macros {
            expand_macros(&mut request, macros.as_ref())?;
        }
        Ok(request)
    }

    /// Execute a JSON statement array and encode the results.
    ///
    /// Never fails: request, pool and statement errors all come back as error
    /// entries in the encoded result.
    pub async fn execute_json(&self, pool: &ConnectionPool, json: &str, update: bool) -> String {
        let results = match self.prepare(json, BatchMode::from_update_flag(update)) {
            Ok(request) => self.execute(pool, &request).await,
            Err(e) => {
                warn!(alias = %pool.alias(), error = %e, "Rejected malformed batch");
                vec![StatementResult::from(&e)]
            }
        };

        encode_batch_result(&results).unwrap_or_else(|e| error_body(&e.to_string()))
    }

    /// Execute a parsed batch.
    pub async fn execute(&self, pool: &ConnectionPool, request: &BatchRequest) -> BatchResult {
        let start = Instant::now();
        debug!(
            alias = %pool.alias(),
            mode = %request.mode,
            statements = request.len(),
            "Executing batch"
        );

        let conn = match self.acquire(pool, request.mode.is_update()).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(alias = %pool.alias(), error = %e, "No connection for batch");
                return vec![StatementResult::from(&e)];
            }
        };

        let mut lease = Lease::new(pool, conn);
        let results = match lease.connection() {
            Ok(conn) => match request.mode {
                BatchMode::Query => run_queries(conn, &request.statements).await,
                BatchMode::Update => run_update(conn, &request.statements).await,
            },
            Err(e) => vec![StatementResult::from(&e)],
        };
        lease.release();

        debug!(
            alias = %pool.alias(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Batch complete"
        );
        results
    }

    /// Check out a connection, waiting with backoff while the pool is full.
    ///
    /// Connection creation failures surface immediately; only retryable
    /// exhaustion is waited on, up to the checkout timeout.
    async fn acquire<C: Connector>(
        &self,
        pool: &ConnectionPool<C>,
        for_write: bool,
    ) -> DbResult<PooledConnection<C::Connection>> {
        let start = Instant::now();
        let mut backoff = INITIAL_BACKOFF;

        loop {
            let attempt = pool.check_out(for_write).await.and_then(|conn| {
                conn.ok_or_else(|| DbError::connection_unavailable(pool.alias()))
            });
            match attempt {
                Ok(conn) => return Ok(conn),
                Err(e) if e.is_retryable() => {}
                Err(e) => return Err(e),
            }

            let waited = start.elapsed();
            if waited >= self.checkout_timeout {
                let waited_ms = waited.as_millis() as u64;
                warn!(alias = %pool.alias(), waited_ms, "Timed out waiting for a connection");
                return Err(DbError::pool_timeout(pool.alias(), waited_ms));
            }

            tokio::time::sleep(backoff.min(self.checkout_timeout - waited)).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }
}

impl Default for StatementExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StatementExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatementExecutor")
            .field("checkout_timeout", &self.checkout_timeout)
            .field("macros", &self.macros.is_some())
            .finish()
    }
}

/// A checked-out connection that goes back to its pool when dropped.
///
/// If the holder panics the connection's state is unknown, so its slot is
/// released and the connection itself is dropped instead of reused.
struct Lease<'p, C: Connector = DriverConnector> {
    pool: &'p ConnectionPool<C>,
    conn: Option<PooledConnection<C::Connection>>,
}

impl<'p, C: Connector> Lease<'p, C> {
    fn new(pool: &'p ConnectionPool<C>, conn: PooledConnection<C::Connection>) -> Self {
        Self {
            pool,
            conn: Some(conn),
        }
    }

    fn connection(&mut self) -> DbResult<&mut C::Connection> {
        self.conn
            .as_deref_mut()
            .ok_or_else(|| DbError::internal("connection already released"))
    }

    fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.check_in(conn);
        }
    }
}

impl<C: Connector> Drop for Lease<'_, C> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if std::thread::panicking() {
            self.pool.discard(conn.id());
        } else {
            self.pool.check_in(conn);
        }
    }
}

// =============================================================================
// Query mode
// =============================================================================

async fn run_queries(conn: &mut AnyConnection, statements: &[StatementSpec]) -> BatchResult {
    let mut results = Vec::with_capacity(statements.len());
    for (idx, stmt) in statements.iter().enumerate() {
        let result = match run_query(conn, stmt).await {
            Ok(result) => result,
            Err(e) => {
                debug!(statement = idx, error = %e, "Query failed");
                StatementResult::error(format!("Couldn't execute query: {}", e))
            }
        };
        results.push(result);
    }
    results
}

async fn run_query(conn: &mut AnyConnection, stmt: &StatementSpec) -> DbResult<StatementResult> {
    debug!(sql = %stmt.query_text, prepared = stmt.is_prepared(), "Executing query");

    let rows = match &stmt.parameters {
        Some(tokens) => {
            let params = ParamValue::infer_all(tokens);
            bind_params(sqlx::query::<Any>(&stmt.query_text), &params)
                .fetch_all(&mut *conn)
                .await?
        }
        None => (&mut *conn).fetch_all(stmt.query_text.as_str()).await?,
    };

    let (columns, types) = match rows.first() {
        Some(row) => (column_names(row.columns()), column_types(row.columns())),
        // No rows to read metadata from; ask the database instead.
        None => match (&mut *conn).describe(&stmt.query_text).await {
            Ok(describe) => (
                column_names(describe.columns()),
                column_types(describe.columns()),
            ),
            Err(e) => {
                debug!(error = %e, "Cannot describe statement");
                (Vec::new(), Vec::new())
            }
        },
    };

    let rows = rows.iter().map(row_values).collect();
    Ok(StatementResult::with_rows(columns, types, rows))
}

// =============================================================================
// Update mode
// =============================================================================

async fn run_update(conn: &mut AnyConnection, statements: &[StatementSpec]) -> BatchResult {
    match update_in_transaction(conn, statements).await {
        Ok(()) => vec![StatementResult::success()],
        Err(e) => vec![StatementResult::error(format!(
            "Rolling back update(s): {}",
            e
        ))],
    }
}

async fn update_in_transaction(
    conn: &mut AnyConnection,
    statements: &[StatementSpec],
) -> DbResult<()> {
    let mut tx = conn.begin().await?;

    let outcome = match statements {
        [single] => execute_statement(&mut *tx, single).await,
        _ => execute_plan(&mut *tx, &UpdatePlan::from_statements(statements)).await,
    };

    match outcome {
        Ok(()) => {
            tx.commit().await?;
            debug!(statements = statements.len(), "Update committed");
            Ok(())
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "Rollback failed");
            }
            debug!(error = %e, "Update rolled back");
            Err(e)
        }
    }
}

async fn execute_statement(conn: &mut AnyConnection, stmt: &StatementSpec) -> DbResult<()> {
    debug!(sql = %stmt.query_text, prepared = stmt.is_prepared(), "Executing update");
    match &stmt.parameters {
        Some(tokens) => {
            let params = ParamValue::infer_all(tokens);
            bind_params(sqlx::query::<Any>(&stmt.query_text), &params)
                .execute(&mut *conn)
                .await?;
        }
        None => {
            (&mut *conn).execute(stmt.query_text.as_str()).await?;
        }
    }
    Ok(())
}

async fn execute_plan(conn: &mut AnyConnection, plan: &UpdatePlan<'_>) -> DbResult<()> {
    for group in &plan.groups {
        debug!(
            sql = %group.query_text,
            batch_size = group.parameter_sets.len(),
            "Executing prepared batch"
        );
        for params in &group.parameter_sets {
            bind_params(sqlx::query::<Any>(group.query_text), params)
                .execute(&mut *conn)
                .await?;
        }
    }

    if !plan.raw.is_empty() {
        debug!(statements = plan.raw.len(), "Executing raw batch");
    }
    for sql in &plan.raw {
        (&mut *conn).execute(*sql).await?;
    }
    Ok(())
}

/// Execution order of a multi-statement update.
#[derive(Debug, Default, PartialEq)]
struct UpdatePlan<'a> {
    /// One group per distinct parameterized text, in first-seen order.
    groups: Vec<PreparedGroup<'a>>,
    /// Raw statements in request order, run after every group.
    raw: Vec<&'a str>,
}

#[derive(Debug, PartialEq)]
struct PreparedGroup<'a> {
    query_text: &'a str,
    parameter_sets: Vec<Vec<ParamValue>>,
}

impl<'a> UpdatePlan<'a> {
    fn from_statements(statements: &'a [StatementSpec]) -> Self {
        let mut plan = Self::default();
        let mut index: HashMap<&'a str, usize> = HashMap::new();

        for stmt in statements {
            let Some(tokens) = &stmt.parameters else {
                plan.raw.push(&stmt.query_text);
                continue;
            };

            let params = ParamValue::infer_all(tokens);
            match index.get(stmt.query_text.as_str()) {
                Some(&group) => plan.groups[group].parameter_sets.push(params),
                None => {
                    index.insert(&stmt.query_text, plan.groups.len());
                    plan.groups.push(PreparedGroup {
                        query_text: &stmt.query_text,
                        parameter_sets: vec![params],
                    });
                }
            }
        }
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::cluster::ClusteredConnectionPool;
    use crate::db::pool::SimpleConnectionPool;
    use crate::db::pool::testing::{MockConnector, mock_pool, policy};
    use crate::db::macro_cache::MacroCache;

    fn simple(pool: SimpleConnectionPool<MockConnector>) -> ConnectionPool<MockConnector> {
        ConnectionPool::Simple(Arc::new(pool))
    }

    #[test]
    fn test_update_plan_groups_identical_texts() {
        let statements = vec![
            StatementSpec::prepared("insert into t values (?)", vec!["1".into()]),
            StatementSpec::raw("delete from u"),
            StatementSpec::prepared("update t set a = ?", vec!["x".into()]),
            StatementSpec::prepared("insert into t values (?)", vec!["2.5".into()]),
            StatementSpec::raw("delete from v"),
        ];
        let plan = UpdatePlan::from_statements(&statements);

        assert_eq!(plan.groups.len(), 2);
        assert_eq!(plan.groups[0].query_text, "insert into t values (?)");
        assert_eq!(
            plan.groups[0].parameter_sets,
            vec![vec![ParamValue::Int(1)], vec![ParamValue::Float(2.5)]]
        );
        assert_eq!(plan.groups[1].query_text, "update t set a = ?");
        assert_eq!(plan.raw, vec!["delete from u", "delete from v"]);
    }

    #[test]
    fn test_update_plan_raw_only() {
        let statements = vec![StatementSpec::raw("a"), StatementSpec::raw("a")];
        let plan = UpdatePlan::from_statements(&statements);
        assert!(plan.groups.is_empty());
        assert_eq!(plan.raw, vec!["a", "a"]);
    }

    #[test]
    fn test_prepare_expands_macros() {
        let macros = Arc::new(MacroCache::new());
        macros.put("$one", "select 1");
        let executor = StatementExecutor::new().with_macros(macros);

        let request = executor
            .prepare(r#"[{"query":"$one"}]"#, BatchMode::Query)
            .unwrap();
        assert_eq!(request.statements[0].query_text, "select 1");

        let err = executor
            .prepare(r#"[{"query":"$two"}]"#, BatchMode::Query)
            .unwrap_err();
        assert!(matches!(err, DbError::MalformedRequest { .. }));
    }

    #[test]
    fn test_prepare_without_macros_keeps_text() {
        let request = StatementExecutor::new()
            .prepare(r#"[{"query":"$one"}]"#, BatchMode::Update)
            .unwrap();
        assert_eq!(request.statements[0].query_text, "$one");
        assert_eq!(request.mode, BatchMode::Update);
    }

    #[tokio::test]
    async fn test_acquire_times_out_on_exhausted_pool() {
        let pool = simple(mock_pool("db", 1));
        let _held = pool.check_out(false).await.unwrap().unwrap();

        let executor = StatementExecutor::with_checkout_timeout(Duration::from_millis(50));
        let start = Instant::now();
        let err = executor.acquire(&pool, false).await.unwrap_err();

        assert!(matches!(err, DbError::PoolTimeout { .. }));
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_acquire_waits_for_check_in() {
        let pool = Arc::new(simple(mock_pool("db", 1)));
        let held = pool.check_out(false).await.unwrap().unwrap();

        let releaser = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                pool.check_in(held);
            })
        };

        let executor = StatementExecutor::with_checkout_timeout(Duration::from_secs(2));
        let conn = executor.acquire(pool.as_ref(), false).await.unwrap();
        assert_eq!(conn.serial, 1);
        releaser.await.unwrap();
    }

    #[tokio::test]
    async fn test_acquire_surfaces_database_unavailable() {
        let pool = simple(SimpleConnectionPool::new(
            "down",
            policy(1),
            MockConnector::failing(),
        ));
        let executor = StatementExecutor::with_checkout_timeout(Duration::from_secs(5));
        let start = Instant::now();
        let err = executor.acquire(&pool, true).await.unwrap_err();

        assert!(matches!(err, DbError::DatabaseUnavailable { .. }));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_acquire_surfaces_cluster_read_failure() {
        let writer = Arc::new(mock_pool("w", 1));
        let reader = Arc::new(SimpleConnectionPool::new(
            "r",
            policy(1),
            MockConnector::failing(),
        ));
        let pool = ConnectionPool::Clustered(
            ClusteredConnectionPool::new("c", writer, vec![reader]).unwrap(),
        );
        let executor = StatementExecutor::with_checkout_timeout(Duration::from_secs(5));
        let start = Instant::now();
        let err = executor.acquire(&pool, false).await.unwrap_err();

        assert!(matches!(err, DbError::DatabaseUnavailable { .. }));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_lease_checks_in_on_drop() {
        let inner = Arc::new(mock_pool("db", 1));
        let pool = ConnectionPool::Simple(Arc::clone(&inner));
        let conn = pool.check_out(false).await.unwrap().unwrap();

        {
            let mut lease = Lease::new(&pool, conn);
            assert!(lease.connection().is_ok());
        }
        assert_eq!(inner.unavailable_count(), 0);
        assert_eq!(inner.open_count(), 1);
    }

    #[tokio::test]
    async fn test_lease_release() {
        let inner = Arc::new(mock_pool("db", 1));
        let pool = ConnectionPool::Simple(Arc::clone(&inner));
        let conn = pool.check_out(false).await.unwrap().unwrap();

        Lease::new(&pool, conn).release();
        assert_eq!(inner.unavailable_count(), 0);
        assert_eq!(inner.open_count(), 1);
    }

    #[test]
    fn test_lease_discards_on_panic() {
        let inner = Arc::new(mock_pool("db", 1));
        let pool = ConnectionPool::Simple(Arc::clone(&inner));
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let conn = runtime.block_on(pool.check_out(false)).unwrap().unwrap();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _lease = Lease::new(&pool, conn);
            panic!("statement handler panicked");
        }));

        assert!(result.is_err());
        assert_eq!(inner.unavailable_count(), 0);
        assert_eq!(inner.open_count(), 0);
    }
}
