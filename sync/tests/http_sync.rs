//! End-to-end sync against a stand-in content API.

use std::time::Duration;

use haven_config::{Settings, StoreSettings, SyncSettings};
use haven_store::Store;
use haven_sync::retry::RetryConfig;
use haven_sync::{
    ConnectivityFlag, ContentCache, HttpContentSource, LastSync, Reconciler, ReconcilerOptions, SkipReason,
    SyncFailure, SyncOutcome, SyncScheduler,
};
use haven_types::LocalEditPolicy;
use serde_json::{Value, json};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const RESOURCES: &str = "/v1/resources.json";

struct Harness {
    dir: TempDir,
    server: MockServer,
    online: ConnectivityFlag,
}

impl Harness {
    async fn start() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            server: MockServer::start().await,
            online: ConnectivityFlag::new(true),
        }
    }

    fn cache_path(&self) -> std::path::PathBuf {
        self.dir.path().join("content.db")
    }

    fn store(&self) -> Store {
        Store::open_content(self.cache_path(), &StoreSettings::default()).unwrap()
    }

    fn sync_settings(&self, max_body_bytes: usize) -> SyncSettings {
        SyncSettings {
            endpoint: Some(format!("{}{RESOURCES}", self.server.uri())),
            timeout: Duration::from_secs(5),
            max_body_bytes,
            ..SyncSettings::default()
        }
    }

    fn reconciler_with(
        &self,
        max_body_bytes: usize,
        policy: LocalEditPolicy,
    ) -> Reconciler<HttpContentSource, ConnectivityFlag> {
        let source = HttpContentSource::from_settings(&self.sync_settings(max_body_bytes))
            .unwrap()
            .with_retry(RetryConfig {
                max_retries: 2,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                jitter_factor: 0.0,
            });
        let mut settings = Settings::default();
        settings.policy.local_edit_policy = policy;
        let cache = ContentCache::open(&self.cache_path(), &StoreSettings::default()).unwrap();
        Reconciler::new(
            cache,
            source,
            self.online.clone(),
            ReconcilerOptions::from_settings(&settings),
        )
    }

    fn reconciler(&self) -> Reconciler<HttpContentSource, ConnectivityFlag> {
        self.reconciler_with(1024 * 1024, LocalEditPolicy::KeepLocal)
    }

    async fn serve(&self, items: Value) {
        self.server.reset().await;
        Mock::given(method("GET"))
            .and(path(RESOURCES))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "items": items })))
            .mount(&self.server)
            .await;
    }
}

fn resources() -> Value {
    json!([
        { "id": "box-breathing", "title": "Box breathing", "body": "In for four.\nHold for four." },
        { "id": "crisis-line", "title": "Crisis line", "body": "Call or text any time.",
          "url": "https://help.example.org/line" },
    ])
}

fn updated(outcome: SyncOutcome) -> haven_sync::SyncReport {
    match outcome {
        SyncOutcome::Updated(report) => report,
        other => panic!("expected Updated, got {other:?}"),
    }
}

#[tokio::test]
async fn caches_remote_content() {
    let h = Harness::start().await;
    h.serve(resources()).await;

    let report = updated(h.reconciler().sync().await);
    assert_eq!(report.received, 2);
    assert_eq!(report.written, 2);

    let store = h.store();
    let line = store.content("crisis-line").unwrap().unwrap();
    assert_eq!(line.content.title, "Crisis line");
    assert_eq!(line.content.url.as_deref(), Some("https://help.example.org/line"));
}

#[tokio::test]
async fn repeated_syncs_write_once() {
    let h = Harness::start().await;
    h.serve(resources()).await;
    let reconciler = h.reconciler();

    let mut writes = 0;
    for _ in 0..5 {
        writes += updated(reconciler.sync().await).writes();
    }
    assert_eq!(writes, 2, "one write per item across all runs");
}

#[tokio::test]
async fn offline_makes_no_request() {
    let h = Harness::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&h.server)
        .await;
    h.online.set_online(false);

    let outcome = h.reconciler().sync().await;
    assert!(matches!(outcome, SyncOutcome::Skipped(SkipReason::Offline)));
}

#[tokio::test]
async fn hostile_items_are_dropped_individually() {
    let h = Harness::start().await;
    h.serve(json!([
        {
            "id": "ok",
            "title": "Ground\u{1b}[31ming",
            "body": "Five things\u{1b}]0;x\u{07} you see",
        },
        { "id": "../../etc", "title": "t", "body": "b" },
        { "id": "http", "title": "t", "body": "b", "url": "http://plain.example.org" },
        { "id": 7, "title": "t", "body": "b" },
    ]))
    .await;

    let report = updated(h.reconciler().sync().await);
    assert_eq!(report.received, 4);
    assert_eq!(report.rejected, 3);
    assert_eq!(report.written, 1);

    let ok = h.store().content("ok").unwrap().unwrap();
    assert_eq!(ok.content.title, "Grounding");
    assert_eq!(ok.content.body, "Five things you see");
}

#[tokio::test]
async fn server_errors_fail_without_touching_the_cache() {
    let h = Harness::start().await;
    h.serve(resources()).await;
    let reconciler = h.reconciler();
    updated(reconciler.sync().await);

    h.server.reset().await;
    Mock::given(method("GET"))
        .and(path(RESOURCES))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&h.server)
        .await;

    match reconciler.sync().await {
        SyncOutcome::Failed(SyncFailure::HttpStatus { status }) => assert_eq!(status, 503),
        other => panic!("expected HTTP failure, got {other:?}"),
    }
    assert_eq!(h.store().content_entries().unwrap().len(), 2);
}

#[tokio::test]
async fn oversized_body_is_refused() {
    let h = Harness::start().await;
    h.serve(resources()).await;

    let outcome = h
        .reconciler_with(64, LocalEditPolicy::KeepLocal)
        .sync()
        .await;
    assert!(matches!(
        outcome,
        SyncOutcome::Failed(SyncFailure::PayloadTooLarge { limit: 64 })
    ));
    assert!(h.store().content_entries().unwrap().is_empty());
}

#[tokio::test]
async fn malformed_envelope_is_a_payload_failure() {
    let h = Harness::start().await;
    Mock::given(method("GET"))
        .and(path(RESOURCES))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .mount(&h.server)
        .await;

    let outcome = h.reconciler().sync().await;
    assert!(matches!(outcome, SyncOutcome::Failed(SyncFailure::Payload(_))));
}

#[tokio::test]
async fn local_edit_keeps_remote_update_out() {
    let h = Harness::start().await;
    h.serve(resources()).await;
    let reconciler = h.reconciler();
    updated(reconciler.sync().await);

    reconciler.cache().mark_local_edit("box-breathing").unwrap();
    h.serve(json!([
        { "id": "box-breathing", "title": "Box breathing", "body": "Rewritten remotely." },
    ]))
    .await;

    let report = updated(reconciler.sync().await);
    assert_eq!(report.kept_local, 1);
    let row = h.store().content("box-breathing").unwrap().unwrap();
    assert_eq!(row.content.body, "In for four.\nHold for four.");
}

#[tokio::test]
async fn scheduler_publishes_status_and_cancels() {
    let h = Harness::start().await;
    h.serve(resources()).await;

    let scheduler = SyncScheduler::spawn(h.reconciler(), Duration::from_secs(3600));
    let mut status = scheduler.subscribe();
    tokio::time::timeout(
        Duration::from_secs(10),
        status.wait_for(|s| s.runs >= 1 && !s.running),
    )
    .await
    .unwrap()
    .unwrap();

    let current = scheduler.status();
    assert!(matches!(current.last, Some(LastSync::Updated(report)) if report.written == 2));
    assert!(current.last_success_at.is_some());

    h.online.set_online(false);
    scheduler.sync_now();
    tokio::time::timeout(Duration::from_secs(10), status.wait_for(|s| s.runs >= 2))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        scheduler.status().last,
        Some(LastSync::Skipped(SkipReason::Offline))
    );

    scheduler.cancel();
    assert_eq!(h.store().content_entries().unwrap().len(), 2);
}
