//! Integration tests for the HTTP front end.
//!
//! Requests are driven straight through the router with `oneshot`, against
//! SQLite-backed aliases and a cluster over two SQLite files.

use axum::body::{Body, to_bytes};
use axum::http::header::{CACHE_CONTROL, CONTENT_ENCODING, CONTENT_TYPE};
use axum::http::{Request, StatusCode};
use axum::response::Response;
use db_http_gateway::db::{MacroCache, PoolRegistry, StatementExecutor};
use db_http_gateway::models::{StatementResult, StatementStatus};
use db_http_gateway::transport::{HttpSettings, HttpTransport};
use db_http_gateway::GatewayConfig;
use serde_json::json;
use std::io::Read;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

struct Gateway {
    _dir: TempDir,
    transport: HttpTransport,
    macro_dir: std::path::PathBuf,
}

fn gateway(use_gzip: bool) -> Gateway {
    let dir = tempfile::tempdir().unwrap();
    let dsn = |name: &str| format!("sqlite:{}?mode=rwc", dir.path().join(name).display());
    let macro_dir = dir.path().join("macros");
    std::fs::create_dir_all(macro_dir.join("reports")).unwrap();
    std::fs::write(macro_dir.join("reports/one.macro"), "select 1 as one").unwrap();

    let config = json!({
        "serverPort": 8080,
        "maxConcurrentRequests": 2,
        "useGzip": use_gzip,
        "dbAliases": [
            {"alias": "main", "dsn": dsn("main.db")},
            {"alias": "primary", "dsn": dsn("primary.db")},
            {"alias": "replica", "dsn": dsn("replica.db")}
        ],
        "clusters": [{"alias": "shop", "writeTo": "primary", "readFrom": ["replica"]}]
    });
    let config = GatewayConfig::from_json(&config.to_string()).unwrap();

    let registry = Arc::new(PoolRegistry::from_config(&config).unwrap());
    let macros = Arc::new(MacroCache::with_root(&macro_dir));
    let executor = Arc::new(StatementExecutor::new().with_macros(macros.clone()));
    let transport = HttpTransport::new(
        registry,
        executor,
        macros,
        HttpSettings {
            host: config.server_host.clone(),
            port: config.server_port,
            use_gzip: config.use_gzip,
            max_concurrent_requests: config.max_concurrent_requests,
        },
    );

    Gateway {
        _dir: dir,
        transport,
        macro_dir,
    }
}

fn query_string(pairs: &[(&str, &str)]) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}

async fn get(gateway: &Gateway, path: &str, pairs: &[(&str, &str)]) -> Response {
    let uri = format!("{}?{}", path, query_string(pairs));
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    gateway.transport.router().oneshot(request).await.unwrap()
}

async fn post(gateway: &Gateway, pairs: &[(&str, &str)]) -> Response {
    let request = Request::builder()
        .method("POST")
        .uri("/")
        .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(query_string(pairs)))
        .unwrap();
    gateway.transport.router().oneshot(request).await.unwrap()
}

async fn body_text(response: Response) -> String {
    let gzipped = response
        .headers()
        .get(CONTENT_ENCODING)
        .is_some_and(|v| v == "gzip");
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    if !gzipped {
        return String::from_utf8(bytes.to_vec()).unwrap();
    }
    let mut out = String::new();
    flate2::read::GzDecoder::new(bytes.as_ref())
        .read_to_string(&mut out)
        .unwrap();
    out
}

async fn results(response: Response) -> Vec<StatementResult> {
    serde_json::from_str(&body_text(response).await).unwrap()
}

#[tokio::test]
async fn test_get_query() {
    let gateway = gateway(false);
    let response = get(
        &gateway,
        "/",
        &[("alias", "main"), ("json", r#"[{"query":"select 1 as a"}]"#)],
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response.headers()[CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/plain")
    );
    assert_eq!(response.headers()[CACHE_CONTROL], "no-cache");

    let entries = results(response).await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].rows, vec![vec![Some("1".to_string())]]);
}

#[tokio::test]
async fn test_cache_header() {
    let gateway = gateway(false);
    let response = get(
        &gateway,
        "/",
        &[
            ("alias", "main"),
            ("json", r#"[{"query":"select 1"}]"#),
            ("cache", "120"),
        ],
    )
    .await;
    assert_eq!(response.headers()[CACHE_CONTROL], "public, max-age=120");

    let response = get(
        &gateway,
        "/",
        &[
            ("alias", "main"),
            ("json", r#"[{"query":"create table t (x int)"}]"#),
            ("update", "Y"),
            ("cache", "120"),
        ],
    )
    .await;
    assert_eq!(response.headers()[CACHE_CONTROL], "no-cache");
}

#[tokio::test]
async fn test_post_update_then_query() {
    let gateway = gateway(false);
    let response = post(
        &gateway,
        &[
            ("alias", "main"),
            ("update", "true"),
            (
                "json",
                r#"[{"query":"create table t (x int)"},{"query":"insert into t values (?)","values":["7"]}]"#,
            ),
        ],
    )
    .await;
    let entries = results(response).await;
    assert_eq!(entries, vec![StatementResult::success()]);

    let response = post(
        &gateway,
        &[("alias", "main"), ("json", r#"[{"query":"select x from t"}]"#)],
    )
    .await;
    let entries = results(response).await;
    assert_eq!(entries[0].rows, vec![vec![Some("7".to_string())]]);
}

#[tokio::test]
async fn test_malformed_request() {
    let gateway = gateway(false);

    let response = get(&gateway, "/", &[("alias", "main")]).await;
    assert_eq!(response.status(), StatusCode::OK);
    let entries = results(response).await;
    assert_eq!(entries[0].status, StatementStatus::Error);
    assert_eq!(entries[0].message, "Malformed request");

    let response = get(&gateway, "/", &[("json", "[]")]).await;
    let entries = results(response).await;
    assert_eq!(entries[0].message, "Malformed request");
}

#[tokio::test]
async fn test_unknown_alias() {
    let gateway = gateway(false);
    let response = get(
        &gateway,
        "/",
        &[("alias", "nope"), ("json", r#"[{"query":"select 1"}]"#)],
    )
    .await;
    let entries = results(response).await;
    assert_eq!(entries[0].status, StatementStatus::Error);
    assert_eq!(entries[0].message, "Alias 'nope' is missing");
}

#[tokio::test]
async fn test_gzip_responses() {
    let gateway = gateway(true);
    let response = get(
        &gateway,
        "/",
        &[("alias", "main"), ("json", r#"[{"query":"select 'zipped' as z"}]"#)],
    )
    .await;
    assert_eq!(response.headers()[CONTENT_ENCODING], "gzip");
    let entries = results(response).await;
    assert_eq!(entries[0].rows, vec![vec![Some("zipped".to_string())]]);

    let response = get(&gateway, "/", &[]).await;
    assert_eq!(response.headers()[CONTENT_ENCODING], "gzip");
    let entries = results(response).await;
    assert_eq!(entries[0].message, "Malformed request");
}

#[tokio::test]
async fn test_cluster_splits_reads_and_writes() {
    let gateway = gateway(false);

    let response = get(
        &gateway,
        "/",
        &[
            ("alias", "shop"),
            ("update", "1"),
            ("json", r#"[{"query":"create table origin (name text)"},{"query":"insert into origin values ('primary')"}]"#),
        ],
    )
    .await;
    assert_eq!(results(response).await, vec![StatementResult::success()]);

    // Reads go to the replica, which never saw the write.
    let response = get(
        &gateway,
        "/",
        &[("alias", "shop"), ("json", r#"[{"query":"select name from origin"}]"#)],
    )
    .await;
    let read = results(response).await;
    assert_eq!(read[0].status, StatementStatus::Error);

    let response = get(
        &gateway,
        "/",
        &[("alias", "primary"), ("json", r#"[{"query":"select name from origin"}]"#)],
    )
    .await;
    let direct = results(response).await;
    assert_eq!(direct[0].rows, vec![vec![Some("primary".to_string())]]);
}

#[tokio::test]
async fn test_macro_and_flush_cache() {
    let gateway = gateway(false);

    let response = get(&gateway, "/flushCache", &[]).await;
    let flushed = results(response).await;
    assert!(flushed[0].is_success());
    assert!(flushed[0].message.contains("1 macros"));

    let response = get(
        &gateway,
        "/",
        &[("alias", "main"), ("json", r#"[{"query":"$reports.one"}]"#)],
    )
    .await;
    let results_before = results(response).await;
    assert_eq!(results_before[0].columns, vec!["one"]);

    std::fs::write(gateway.macro_dir.join("two.macro"), "select 2 as two").unwrap();
    let response = get(&gateway, "/flushCache", &[]).await;
    assert!(results(response).await[0].message.contains("2 macros"));

    let response = get(
        &gateway,
        "/",
        &[("alias", "main"), ("json", r#"[{"query":"$two"}]"#)],
    )
    .await;
    let results_after = results(response).await;
    assert_eq!(results_after[0].rows, vec![vec![Some("2".to_string())]]);
}
