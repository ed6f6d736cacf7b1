//! HTTP session and full live runs against a mock registry
use futures::TryStreamExt;
use std::sync::Arc;
use std::time::Duration;

use guarantee_collector_lib::crawling::Dispatcher;
use guarantee_collector_lib::domain::{ErrorKind, FileHandle, FileStatus, ItemId, ItemStatus};
use guarantee_collector_lib::infrastructure::config::{
    CollectorConfig, IdSelection, PacingConfig, RunMode, SessionOptions, UrlTemplates,
};
use guarantee_collector_lib::domain::FileEntry;
use guarantee_collector_lib::infrastructure::output_sink::{FILES_TABLE, METADATA_TABLE, MetadataRow, read_table};
use guarantee_collector_lib::infrastructure::session::{BrowserSession, HttpSession, HttpSessionFactory, SessionError};
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const GENERAL: &str = r#"<html><body><div class="cardMainInfo">
    <div class="cardMainInfo__status"><span class="cardMainInfo__title">Размещено</span></div>
    </div></body></html>"#;

const DOCUMENTS: &str = r#"<html><body><div class="card-attachments__block">
    <div class="title">Информация о банковской гарантии</div>
    <div class="attachment">
      <div class="attachment__value">Информация о банковской гарантии № 55-X от 01.01.2024</div>
      <div class="attachment__text">Прикрепленные файлы</div>
      <div class="attachment__value">
        <a href="/filestore/download?uid=1">Гарантия</a>
        <a href="/filestore/download?uid=2">Broken.pdf</a>
      </div>
    </div></div></body></html>"#;

fn session() -> HttpSession {
    HttpSession::new(&SessionOptions::default(), 0).unwrap()
}

fn live_config(server: &MockServer, dir: &std::path::Path, id: u64) -> CollectorConfig {
    CollectorConfig {
        mode: RunMode::Live,
        selection: IdSelection::Explicit(vec![ItemId::new(id)]),
        data_dir: dir.to_path_buf(),
        pacing: PacingConfig::none(),
        urls: UrlTemplates {
            general: format!("{}/generalInformation.html?guaranteeInfoId={{id}}", server.uri()),
            documents: format!("{}/document-info.html?guaranteeInfoId={{id}}", server.uri()),
        },
        ..CollectorConfig::default()
    }
}

#[tokio::test]
async fn fetch_returns_markup_and_reports_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/page"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<p>ok</p>"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let mut session = session();
    let body = session
        .fetch(&format!("{}/page", server.uri()), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(body, "<p>ok</p>");

    let err = session
        .fetch(&format!("{}/gone", server.uri()), Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Status { status: 404, .. }));
}

#[tokio::test]
async fn slow_pages_time_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;

    let err = session()
        .fetch(&server.uri(), Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Timeout(_)));
}

#[tokio::test]
async fn click_follows_links_relative_to_the_current_page() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/card/index.html"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"<a class="next" href="docs.html">docs</a>"#))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/card/docs.html"))
        .respond_with(ResponseTemplate::new(200).set_body_string("documents"))
        .mount(&server)
        .await;

    let mut session = session();
    session
        .fetch(&format!("{}/card/index.html", server.uri()), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(session.click("a.next").await.unwrap(), "documents");
    assert!(matches!(session.click("a.missing").await, Err(SessionError::NoMatch(_))));

    session.close().await;
    assert!(matches!(
        session.fetch(&server.uri(), Duration::from_secs(1)).await,
        Err(SessionError::Closed)
    ));
}

#[tokio::test]
async fn downloads_stream_with_the_announced_name() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/file"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-disposition", r#"attachment; filename="scan.pdf""#)
                .set_body_bytes(b"%PDF".to_vec()),
        )
        .mount(&server)
        .await;

    let mut session = session();
    let stream = session
        .wait_for_download(&FileHandle::Url(format!("{}/file", server.uri())))
        .await
        .unwrap();
    assert_eq!(stream.suggested_name.as_deref(), Some("scan.pdf"));
    let chunks: Vec<bytes::Bytes> = stream.chunks.try_collect().await.unwrap();
    assert_eq!(chunks.concat(), b"%PDF");
}

#[tokio::test]
async fn live_run_collects_pages_and_attachments() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/generalInformation.html"))
        .and(query_param("guaranteeInfoId", "21"))
        .respond_with(ResponseTemplate::new(200).set_body_string(GENERAL))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/document-info.html"))
        .and(query_param("guaranteeInfoId", "21"))
        .respond_with(ResponseTemplate::new(200).set_body_string(DOCUMENTS))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/filestore/download"))
        .and(query_param("uid", "1"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-disposition", "attachment; filename*=UTF-8''guarantee.docx")
                .set_body_bytes(b"PK\x03\x04 body".to_vec()),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/filestore/download"))
        .and(query_param("uid", "2"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let config = live_config(&server, dir.path(), 21);

    let summary = Dispatcher::new(config.clone(), Arc::new(HttpSessionFactory::new(config.session.clone())))
        .run(1, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.stats.success, 1);
    assert_eq!(summary.stats.files_downloaded, 1);
    assert_eq!(summary.stats.files_failed, 1);

    let processed = dir.path().join("processed");
    let rows: Vec<MetadataRow> = read_table(&processed.join(METADATA_TABLE)).await.unwrap();
    assert_eq!(rows[0].status, ItemStatus::Success);

    let files: Vec<FileEntry> = read_table(&processed.join(FILES_TABLE)).await.unwrap();
    assert_eq!(files[0].status, FileStatus::Downloaded);
    assert_eq!(files[0].stored_filename, "21_1.docx");
    assert_eq!(files[0].document_number, "55-X");
    assert_eq!(files[1].status, FileStatus::Failed);
    assert!(files[1].error.contains("500"));

    let stored = dir.path().join("raw").join("attachments").join("21").join("21_1.docx");
    assert_eq!(tokio::fs::read(stored).await.unwrap(), b"PK\x03\x04 body");
}

#[tokio::test]
async fn gone_notice_is_skipped_and_never_queued() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let config = live_config(&server, dir.path(), 77);
    let summary = Dispatcher::new(config.clone(), Arc::new(HttpSessionFactory::new(config.session.clone())))
        .run(1, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.stats.skipped, 1);
    assert_eq!(summary.stats.requeued, 0);
    assert_eq!(summary.retry_queue_len, 0);

    let rows: Vec<MetadataRow> = read_table(&dir.path().join("processed").join(METADATA_TABLE))
        .await
        .unwrap();
    assert_eq!(rows[0].status, ItemStatus::Skipped);
    assert_eq!(rows[0].error_kind, Some(ErrorKind::MissingPage));
}
