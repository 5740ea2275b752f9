//! Integration tests for sync runs
//!
//! These tests use wiremock for the data source and a scripted browser so
//! the full run cycle (admission, fetch chain, escalation, health) is
//! exercised end-to-end against a real SQLite store.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use steady_harvest::config::{parse_config, Config};
use steady_harvest::fetch::{
    BrowserError, BrowserHandle, BrowserLauncher, BrowserPage, HeaderProfile, HttpTransport,
    RawResponse,
};
use steady_harvest::storage::{lock_store, HealthStatus, SqliteStorage, Storage, TaskStatus};
use steady_harvest::sync::{run_sync, SyncRun};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Creates a test configuration pointed at the mock server
fn create_test_config(base_url: &str, extra: &str) -> Config {
    parse_config(&format!(
        r#"
[source]
detail-url-template = "{}/items/{{id}}"
terminal-field = "closes_at"

[fetch]
max-lightweight-attempts = 2
request-timeout-ms = 5000

[pacing]
min-delay-ms = 0
max-delay-ms = 0

[backoff]
quarantine-ms = 0
short-base-ms = 0

[circuit-breaker]
enabled = false

[storage]
database-path = ":memory:"

{}
"#,
        base_url, extra
    ))
    .expect("test config should parse")
}

#[derive(Default)]
struct BrowserCounters {
    launches: AtomicUsize,
    navigations: AtomicUsize,
    pages_closed: AtomicUsize,
    browsers_closed: AtomicUsize,
}

/// A browser that answers every navigation with the same response
struct ScriptedLauncher {
    response: RawResponse,
    counters: Arc<BrowserCounters>,
}

struct ScriptedBrowser {
    response: RawResponse,
    counters: Arc<BrowserCounters>,
}

struct ScriptedPage {
    response: RawResponse,
    counters: Arc<BrowserCounters>,
}

#[async_trait]
impl BrowserLauncher for ScriptedLauncher {
    async fn launch(&self) -> Result<Box<dyn BrowserHandle>, BrowserError> {
        self.counters.launches.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedBrowser {
            response: self.response.clone(),
            counters: Arc::clone(&self.counters),
        }))
    }
}

#[async_trait]
impl BrowserHandle for ScriptedBrowser {
    async fn open_page(&self) -> Result<Box<dyn BrowserPage>, BrowserError> {
        Ok(Box::new(ScriptedPage {
            response: self.response.clone(),
            counters: Arc::clone(&self.counters),
        }))
    }

    async fn close(&mut self) -> Result<(), BrowserError> {
        self.counters.browsers_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl BrowserPage for ScriptedPage {
    async fn navigate(
        &mut self,
        _url: &str,
        _headers: &HeaderProfile,
        _timeout: Duration,
    ) -> Result<RawResponse, BrowserError> {
        self.counters.navigations.fetch_add(1, Ordering::SeqCst);
        Ok(self.response.clone())
    }

    async fn close(self: Box<Self>) -> Result<(), BrowserError> {
        self.counters.pages_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn scripted_browser(status: u16, content_type: &str, body: &str) -> (Arc<ScriptedLauncher>, Arc<BrowserCounters>) {
    let counters = Arc::new(BrowserCounters::default());
    let launcher = Arc::new(ScriptedLauncher {
        response: RawResponse {
            status,
            content_type: Some(content_type.to_string()),
            body: body.to_string(),
        },
        counters: Arc::clone(&counters),
    });
    (launcher, counters)
}

fn create_run(config: Config, launcher: Option<Arc<ScriptedLauncher>>) -> SyncRun {
    SyncRun::with_components(
        config,
        "test-hash".to_string(),
        SqliteStorage::new_in_memory().expect("in-memory store"),
        Arc::new(HttpTransport::new().expect("http client")),
        launcher.map(|l| l as Arc<dyn BrowserLauncher>),
    )
}

fn health_statuses(store: &Arc<Mutex<SqliteStorage>>) -> Vec<HealthStatus> {
    let mut entries = lock_store(store)
        .recent_health_entries("detail_sync", 100)
        .unwrap();
    entries.reverse();
    entries.into_iter().map(|entry| entry.status).collect()
}

fn json_response(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "application/json")
        .set_body_string(body)
}

#[tokio::test]
async fn test_full_sync_then_fresh_skip() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/items/A"))
        .respond_with(json_response(
            r#"{"id": "A", "title": "Pumps", "closes_at": "2099-06-01 12:00:00"}"#,
        ))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/items/B"))
        .respond_with(json_response(r#"{"id": "B", "title": "Valves"}"#))
        .expect(1)
        .mount(&mock_server)
        .await;

    let config = create_test_config(&mock_server.uri(), "");
    let run = create_run(config, None);
    let ids = vec!["A".to_string(), "B".to_string()];

    let summary = run.run(&ids).await.expect("run should complete");
    assert_eq!(summary.admitted, 2);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 0);

    let store = run.store();
    {
        let storage = lock_store(&store);
        assert_eq!(storage.count_records().unwrap(), 2);
        let payload = storage.get_payload("A").unwrap().unwrap();
        assert_eq!(payload["title"], "Pumps");
        let record = storage.get_record("A").unwrap().unwrap();
        assert_eq!(
            record.terminal_at.map(|t| t.to_rfc3339()),
            Some("2099-06-01T12:00:00+00:00".to_string())
        );
    }

    // Both items are inside the freshness window now
    let second = run.run(&ids).await.expect("run should complete");
    assert_eq!(second.admitted, 0);
    assert_eq!(second.skipped_fresh, 2);

    assert_eq!(health_statuses(&store), vec![HealthStatus::Ok, HealthStatus::Ok]);
}

#[tokio::test]
async fn test_blocked_item_recovers_through_browser() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/items/C"))
        .respond_with(
            ResponseTemplate::new(403)
                .insert_header("content-type", "text/html")
                .set_body_string("<html><title>Attention Required! | Cloudflare</title></html>"),
        )
        .expect(2)
        .mount(&mock_server)
        .await;

    let (launcher, counters) = scripted_browser(200, "application/json", r#"{"id": "C"}"#);
    let config = create_test_config(&mock_server.uri(), "");
    let run = create_run(config, Some(launcher));

    let summary = run.run(&["C".to_string()]).await.unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.via_heavyweight, 1);
    assert_eq!(summary.escalated, 0);

    assert_eq!(counters.launches.load(Ordering::SeqCst), 1);
    assert_eq!(counters.navigations.load(Ordering::SeqCst), 1);
    assert_eq!(counters.pages_closed.load(Ordering::SeqCst), 1);
    assert_eq!(counters.browsers_closed.load(Ordering::SeqCst), 1);

    let blocks = run.block_snapshot();
    assert_eq!(blocks.metrics.blocks_total, 2);

    let store = run.store();
    let storage = lock_store(&store);
    assert_eq!(storage.get_payload("C").unwrap(), Some(serde_json::json!({"id": "C"})));
    assert_eq!(storage.count_open_tasks("detail", "C").unwrap(), 0);
}

#[tokio::test]
async fn test_exhausted_item_escalates_and_alerts() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/items/X"))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .expect(4)
        .mount(&mock_server)
        .await;

    let (launcher, counters) = scripted_browser(
        200,
        "text/html",
        "<html><body><div class=\"g-recaptcha\"></div></body></html>",
    );
    let config = create_test_config(&mock_server.uri(), "[health]\nalert-window = 2\n");
    let run = create_run(config, Some(launcher));
    let ids = vec!["X".to_string()];

    let first = run.run(&ids).await.unwrap();
    assert_eq!(first.failed, 1);
    assert_eq!(first.escalated, 1);
    assert!(first.is_failure());
    assert_eq!(first.failures[0].kind, "block");
    assert_eq!(first.failures[0].reason, "exhausted:recaptcha");

    // Never synced, so the next run admits it again and bumps the same task
    let second = run.run(&ids).await.unwrap();
    assert_eq!(second.escalated, 1);

    let store = run.store();
    {
        let storage = lock_store(&store);
        assert_eq!(storage.count_open_tasks("detail", "X").unwrap(), 1);
        let tasks = storage.list_pending_tasks(Some("detail"), 10).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].attempts, 2);
        assert_eq!(tasks[0].status, TaskStatus::Pending);
        assert!(tasks[0].url.ends_with("/items/X"));
        assert_eq!(tasks[0].context["attempts"], 3);
        assert_eq!(tasks[0].context["block_signal"], "recaptcha");
    }

    // One browser per run, closed at the end of each
    assert_eq!(counters.launches.load(Ordering::SeqCst), 2);
    assert_eq!(counters.browsers_closed.load(Ordering::SeqCst), 2);

    assert_eq!(
        health_statuses(&store),
        vec![HealthStatus::Fail, HealthStatus::Fail, HealthStatus::Alert]
    );
}

#[tokio::test]
async fn test_non_retryable_status_is_not_escalated() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/items/gone"))
        .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let (launcher, counters) = scripted_browser(200, "application/json", "{}");
    let config = create_test_config(&mock_server.uri(), "");
    let run = create_run(config, Some(launcher));

    let summary = run.run(&["gone".to_string()]).await.unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.escalated, 0);
    assert_eq!(summary.failures[0].reason, "http_404");

    // The browser was never needed, so it was never launched
    assert_eq!(counters.launches.load(Ordering::SeqCst), 0);

    let store = run.store();
    assert!(lock_store(&store)
        .list_pending_tasks(None, 10)
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_transient_error_is_retried() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/items/T"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/items/T"))
        .respond_with(json_response(r#"{"id": "T"}"#))
        .expect(1)
        .mount(&mock_server)
        .await;

    let config = create_test_config(&mock_server.uri(), "");
    let run = create_run(config, None);

    let summary = run.run(&["T".to_string()]).await.unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.via_heavyweight, 0);
}

#[tokio::test]
async fn test_run_sync_persists_to_file() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/items/F"))
        .respond_with(json_response(r#"{"id": "F"}"#))
        .mount(&mock_server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("harvest.db");
    let config = parse_config(&format!(
        r#"
[source]
detail-url-template = "{}/items/{{id}}"
identifiers = ["F"]

[fetch]
heavyweight-enabled = false

[pacing]
min-delay-ms = 0
max-delay-ms = 0

[storage]
database-path = "{}"
"#,
        mock_server.uri(),
        db_path.display()
    ))
    .unwrap();

    let summary = run_sync(config, "file-hash".to_string(), &[]).await.unwrap();
    assert_eq!(summary.succeeded, 1);

    let storage = SqliteStorage::new(&db_path).unwrap();
    assert_eq!(storage.get_payload("F").unwrap(), Some(serde_json::json!({"id": "F"})));

    let health = storage.recent_health_entries("detail_sync", 5).unwrap();
    assert_eq!(health.len(), 1);
    assert_eq!(health[0].status, HealthStatus::Ok);
    assert_eq!(health[0].meta.as_ref().unwrap()["config_hash"], "file-hash");
}
