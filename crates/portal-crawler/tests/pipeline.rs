use std::path::Path;
use std::sync::Arc;

use portal_crawler::{
    CancellationToken, ErrorKind, Event, EventSink, FetchConfig, FieldValue, ListingConfig,
    OnError, Outcome, Pipeline, PipelineConfig, RecordFilter, RunState, Stage,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config(data_dir: &Path) -> PipelineConfig {
    PipelineConfig {
        data_dir: data_dir.to_path_buf(),
        fetch: FetchConfig {
            max_concurrency: 4,
            max_retries: 3,
            backoff_base_ms: 1,
            backoff_max_ms: 5,
            jitter: false,
            min_interval_ms: 0,
            timeout_ms: 2_000,
            ..Default::default()
        },
        listing: ListingConfig {
            hint_attr: Some("data-updated".into()),
            next_page_selector: Some("a.next".into()),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn index(items: &[(&str, &str)], next: Option<&str>) -> String {
    let items: String = items
        .iter()
        .map(|(href, updated)| {
            format!(r#"<li class="collection-item"><a href="{href}" data-updated="{updated}">{href}</a></li>"#)
        })
        .collect();
    let next = next
        .map(|href| format!(r#"<a class="next" href="{href}">次へ</a>"#))
        .unwrap_or_default();
    format!("<html><body><ul>{items}</ul>{next}</body></html>")
}

fn catalog(files: &[&str]) -> String {
    let rows: String = files
        .iter()
        .map(|file| {
            format!(
                r##"<tr><td>全国</td><td>令和5年</td><td>{file}</td>
                   <td><a href="#" onclick="javascript:DownLd('1MB','{file}','/data/{file}',this);">DL</a></td></tr>"##
            )
        })
        .collect();
    format!(
        r#"<html><body><table class="responsive-table">
           <tr><th>地域</th><th>年度</th><th>ファイル名</th><th>ダウンロード</th></tr>
           {rows}</table></body></html>"#
    )
}

async fn serve(server: &MockServer, route: &str, status: u16, body: String) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(status).set_body_string(body))
        .mount(server)
        .await;
}

fn root(server: &MockServer) -> String {
    format!("{}/ksj/index.html", server.uri())
}

#[tokio::test]
async fn end_to_end_with_flaky_and_missing_resources() {
    let server = MockServer::start().await;
    serve(
        &server,
        "/ksj/index.html",
        200,
        index(&[("a.html", "1"), ("b.html", "1"), ("c.html", "1")], None),
    )
    .await;
    serve(&server, "/ksj/a.html", 200, catalog(&["A-1.zip", "A-2.zip"])).await;
    Mock::given(method("GET"))
        .and(path("/ksj/b.html"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(3)
        .expect(3)
        .mount(&server)
        .await;
    serve(&server, "/ksj/b.html", 200, catalog(&["B-1.zip"])).await;
    Mock::given(method("GET"))
        .and(path("/ksj/c.html"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let pipeline = Pipeline::open(config(dir.path())).unwrap();
    let outcome = pipeline.run(&root(&server), CancellationToken::new()).await;

    assert_eq!(outcome.state, RunState::Done);
    let report = &outcome.report;
    assert_eq!(report.discovered, 3);
    assert_eq!(report.fetched, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.parsed, 3);
    assert_eq!(report.stored, 3);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].url, format!("{}/ksj/c.html", server.uri()));
    assert_eq!(report.failures[0].kind, ErrorKind::Client);
    assert_eq!(report.failures[0].attempts, 1);

    let stored = pipeline.records().get("A-1.zip").unwrap();
    assert_eq!(stored.field("年度"), Some(&FieldValue::Number(2023.0)));
    assert_eq!(
        stored.field("link"),
        Some(&FieldValue::Text(format!("{}/data/A-1.zip", server.uri())))
    );
    assert!(pipeline.content().contains(&stored.source_content_hash));
    assert_eq!(pipeline.records().len(), 3);
}

#[tokio::test]
async fn second_run_skips_unchanged_resources() {
    let server = MockServer::start().await;
    serve(
        &server,
        "/ksj/index.html",
        200,
        index(&[("a.html", "2024-01-01"), ("b.html", "2024-02-01")], None),
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/ksj/a.html"))
        .respond_with(ResponseTemplate::new(200).set_body_string(catalog(&["A-1.zip"])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/ksj/b.html"))
        .respond_with(ResponseTemplate::new(200).set_body_string(catalog(&["B-1.zip"])))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();

    let first = Pipeline::open(config(dir.path()))
        .unwrap()
        .run(&root(&server), CancellationToken::new())
        .await;
    assert_eq!(first.state, RunState::Done);
    assert_eq!(first.report.fetched, 2);

    let pipeline = Pipeline::open(config(dir.path())).unwrap();
    let second = pipeline.run(&root(&server), CancellationToken::new()).await;
    assert_eq!(second.state, RunState::Done);
    assert_eq!(second.report.fetched, 0);
    assert_eq!(second.report.skipped, second.report.discovered);
    assert_eq!(second.report.discovered, 2);
    assert_eq!(pipeline.records().len(), 2);
}

#[tokio::test]
async fn broken_listing_page_is_isolated() {
    let server = MockServer::start().await;
    serve(
        &server,
        "/ksj/index.html",
        200,
        index(&[("a.html", "1")], Some("page2.html")),
    )
    .await;
    serve(&server, "/ksj/page2.html", 404, String::new()).await;
    serve(&server, "/ksj/a.html", 200, catalog(&["A-1.zip"])).await;

    let dir = tempfile::tempdir().unwrap();
    let pipeline = Pipeline::open(config(dir.path())).unwrap();
    let outcome = pipeline.run(&root(&server), CancellationToken::new()).await;

    assert_eq!(outcome.state, RunState::Done);
    assert_eq!(outcome.report.listing_errors, 1);
    assert_eq!(outcome.report.stored, 1);
}

#[tokio::test]
async fn unreachable_root_fails_the_run() {
    let server = MockServer::start().await;
    serve(&server, "/ksj/index.html", 404, String::new()).await;

    let dir = tempfile::tempdir().unwrap();
    let pipeline = Pipeline::open(config(dir.path())).unwrap();
    let outcome = pipeline.run(&root(&server), CancellationToken::new()).await;

    assert!(matches!(
        outcome.state,
        RunState::Failed {
            stage: Stage::Discover,
            ..
        }
    ));
    assert_eq!(outcome.report.discovered, 0);
}

#[tokio::test]
async fn unparseable_resource_is_a_per_resource_failure() {
    let server = MockServer::start().await;
    serve(
        &server,
        "/ksj/index.html",
        200,
        index(&[("a.html", "1"), ("b.html", "1")], None),
    )
    .await;
    serve(&server, "/ksj/a.html", 200, catalog(&["A-1.zip"])).await;
    serve(&server, "/ksj/b.html", 200, "<p>メンテナンス中</p>".into()).await;

    let dir = tempfile::tempdir().unwrap();
    let outcome = Pipeline::open(config(dir.path()))
        .unwrap()
        .run(&root(&server), CancellationToken::new())
        .await;

    assert_eq!(outcome.state, RunState::Done);
    assert_eq!(outcome.report.fetched, 2);
    assert_eq!(outcome.report.failed, 1);
    assert_eq!(outcome.report.failures[0].kind, ErrorKind::Parse);

    let strict = PipelineConfig {
        on_parse_error: OnError::Fail,
        ..config(dir.path())
    };
    let outcome = Pipeline::open(strict)
        .unwrap()
        .run(&root(&server), CancellationToken::new())
        .await;
    assert!(matches!(
        outcome.state,
        RunState::Failed {
            stage: Stage::Parse,
            ..
        }
    ));
}

#[tokio::test]
async fn dry_run_plans_without_fetching() {
    let server = MockServer::start().await;
    serve(
        &server,
        "/ksj/index.html",
        200,
        index(&[("a.html", "1"), ("b.html", "1")], None),
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/ksj/a.html"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let pipeline = Pipeline::open(PipelineConfig {
        dry_run: true,
        ..config(dir.path())
    })
    .unwrap();
    let outcome = pipeline.run(&root(&server), CancellationToken::new()).await;

    assert_eq!(outcome.state, RunState::Done);
    assert_eq!(outcome.report.discovered, 2);
    assert_eq!(outcome.report.fetched, 0);
    assert_eq!(outcome.report.planned.len(), 2);
    assert!(pipeline.records().is_empty());
    assert!(!dir.path().join("hints.json").exists());
}

#[tokio::test]
async fn mirror_downloads_links_once() {
    let server = MockServer::start().await;
    serve(&server, "/ksj/index.html", 200, index(&[("a.html", "1")], None)).await;
    serve(&server, "/ksj/a.html", 200, catalog(&["A-1.zip", "A-2.zip"])).await;
    Mock::given(method("GET"))
        .and(path("/data/A-1.zip"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"PK first".to_vec()))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/data/A-2.zip"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let pipeline = Pipeline::open(config(dir.path())).unwrap();
    let outcome = pipeline.run(&root(&server), CancellationToken::new()).await;
    assert_eq!(outcome.state, RunState::Done);

    let records: Vec<_> = pipeline.records().list(&RecordFilter::default()).collect();
    let report = pipeline
        .mirror(records.clone(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.requested, 2);
    assert_eq!(report.downloaded, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.objects[0].record_id, "A-1.zip");
    assert_eq!(
        pipeline.content().get(&report.objects[0].content_hash).unwrap(),
        b"PK first"
    );

    let again = pipeline.mirror(records, CancellationToken::new()).await.unwrap();
    assert_eq!(again.downloaded, 0);
    assert_eq!(again.skipped, 1);
}

#[tokio::test]
async fn cancelled_run_still_reports() {
    let server = MockServer::start().await;
    serve(&server, "/ksj/index.html", 200, index(&[("a.html", "1")], None)).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let dir = tempfile::tempdir().unwrap();
    let outcome = Pipeline::open(config(dir.path()))
        .unwrap()
        .run(&root(&server), cancel)
        .await;

    assert!(outcome.state.is_terminal());
    assert_ne!(outcome.state, RunState::Done);
}

/// Cancels its token once the first resource is stored.
struct CancelAfterFirstStore(CancellationToken);

impl EventSink for CancelAfterFirstStore {
    fn emit(&self, event: &Event) {
        if event.stage == Stage::Store && event.outcome == Outcome::Success {
            self.0.cancel();
        }
    }
}

#[tokio::test]
async fn cancelling_mid_run_skips_pending_resources() {
    let server = MockServer::start().await;
    serve(
        &server,
        "/ksj/index.html",
        200,
        index(&[("a.html", "1"), ("b.html", "1"), ("c.html", "1")], None),
    )
    .await;
    serve(&server, "/ksj/a.html", 200, catalog(&["A-1.zip"])).await;
    for route in ["/ksj/b.html", "/ksj/c.html"] {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_string(catalog(&["X.zip"])))
            .expect(0)
            .mount(&server)
            .await;
    }

    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let mut conf = config(dir.path());
    conf.fetch.max_concurrency = 1;
    let pipeline = Pipeline::open(conf)
        .unwrap()
        .with_sink(Arc::new(CancelAfterFirstStore(cancel.clone())));
    let outcome = pipeline.run(&root(&server), cancel).await;

    assert_eq!(
        outcome.state,
        RunState::Failed {
            stage: Stage::Store,
            reason: "cancelled".into(),
        }
    );
    let report = &outcome.report;
    assert_eq!(report.discovered, 3);
    assert_eq!(report.fetched, 1);
    assert_eq!(report.stored, 1);
    assert_eq!(report.skipped, 2);
    assert_eq!(report.failed, 0);
    assert_eq!(pipeline.records().len(), 1);
    assert!(pipeline.records().get("A-1.zip").is_ok());
}

#[tokio::test]
async fn unsaved_hints_fail_the_run() {
    let server = MockServer::start().await;
    serve(&server, "/ksj/index.html", 200, index(&[("a.html", "1")], None)).await;
    serve(&server, "/ksj/a.html", 200, catalog(&["A-1.zip"])).await;

    let dir = tempfile::tempdir().unwrap();
    let pipeline = Pipeline::open(config(dir.path())).unwrap();
    std::fs::create_dir(dir.path().join("hints.json")).unwrap();
    let outcome = pipeline.run(&root(&server), CancellationToken::new()).await;

    assert!(matches!(
        outcome.state,
        RunState::Failed {
            stage: Stage::Store,
            ..
        }
    ));
    assert!(!outcome.is_success());
    assert_eq!(outcome.report.stored, 1);
}

#[tokio::test]
async fn root_is_not_loaded_twice() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(index(&[("ksj/a.html", "1")], Some("/"))),
        )
        .expect(1)
        .mount(&server)
        .await;
    serve(&server, "/ksj/a.html", 200, catalog(&["A-1.zip"])).await;

    let dir = tempfile::tempdir().unwrap();
    let outcome = Pipeline::open(config(dir.path()))
        .unwrap()
        .run(&server.uri(), CancellationToken::new())
        .await;

    assert_eq!(outcome.state, RunState::Done);
    assert_eq!(outcome.report.listing_errors, 0);
    assert_eq!(outcome.report.stored, 1);
}
