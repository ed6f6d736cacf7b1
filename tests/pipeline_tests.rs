//! End-to-end runs of the collection pipeline over offline samples
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use guarantee_collector_lib::crawling::{Dispatcher, RunSummary};
use guarantee_collector_lib::domain::{AttributeEntry, ErrorKind, FileEntry, FileStatus, ItemId, ItemStatus, PageKind};
use guarantee_collector_lib::infrastructure::config::{CollectorConfig, IdSelection};
use guarantee_collector_lib::infrastructure::output_sink::{
    ATTRIBUTES_TABLE, FILES_TABLE, METADATA_TABLE, MetadataRow, read_table,
};
use guarantee_collector_lib::infrastructure::session::OfflineSessionFactory;
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

fn config(dir: &Path, ids: &[u64]) -> CollectorConfig {
    CollectorConfig {
        selection: IdSelection::Explicit(ids.iter().copied().map(ItemId::new).collect()),
        data_dir: dir.to_path_buf(),
        retry_backoff: Duration::ZERO,
        ..CollectorConfig::default()
    }
}

fn general_page(fields: &[(&str, &str)]) -> String {
    let sections: String = fields
        .iter()
        .map(|(key, value)| {
            format!(
                r#"<div class="cardMainInfo__section"><span class="cardMainInfo__title">{key}</span><span class="cardMainInfo__content">{value}</span></div>"#
            )
        })
        .collect();
    format!(r#"<html><body><div class="cardMainInfo">{sections}</div></body></html>"#)
}

fn documents_page(files: &[&str]) -> String {
    let links: String = files
        .iter()
        .enumerate()
        .map(|(i, name)| format!(r#"<a href="/44fz/filestore/public/1.0/download/priz/file.html?uid={i}">{name}</a>"#))
        .collect();
    format!(
        r#"<html><body><div class="card-attachments__block"><div class="title">Информация о банковской гарантии</div>
        <div class="attachment"><div class="attachment__text">Прикрепленные файлы</div><div class="attachment__value">{links}</div></div>
        </div></body></html>"#
    )
}

async fn write_sample(data_dir: &Path, id: u64, kind: PageKind, markup: &str) {
    let samples = data_dir.join("samples");
    tokio::fs::create_dir_all(&samples).await.unwrap();
    tokio::fs::write(samples.join(kind.snapshot_name(ItemId::new(id))), markup)
        .await
        .unwrap();
}

async fn write_notice(data_dir: &Path, id: u64, fields: &[(&str, &str)], files: &[&str]) {
    write_sample(data_dir, id, PageKind::GeneralInfo, &general_page(fields)).await;
    write_sample(data_dir, id, PageKind::Documents, &documents_page(files)).await;
}

async fn write_attachment(data_dir: &Path, id: u64, name: &str, body: &[u8]) {
    let dir = data_dir.join("samples").join("attachments").join(id.to_string());
    tokio::fs::create_dir_all(&dir).await.unwrap();
    tokio::fs::write(dir.join(name), body).await.unwrap();
}

async fn run(config: CollectorConfig, run_id: u64) -> RunSummary {
    Dispatcher::new(config, Arc::new(OfflineSessionFactory))
        .run(run_id, CancellationToken::new())
        .await
        .unwrap()
}

fn table(data_dir: &Path, name: &str) -> PathBuf {
    data_dir.join("processed").join(name)
}

async fn metadata(data_dir: &Path) -> Vec<MetadataRow> {
    read_table(&table(data_dir, METADATA_TABLE)).await.unwrap()
}

async fn attributes(data_dir: &Path) -> Vec<AttributeEntry> {
    read_table(&table(data_dir, ATTRIBUTES_TABLE)).await.unwrap()
}

async fn files(data_dir: &Path) -> Vec<FileEntry> {
    read_table(&table(data_dir, FILES_TABLE)).await.unwrap()
}

#[tokio::test]
async fn repeated_runs_leave_tables_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path();
    write_notice(data, 1, &[("Статус", "Размещено")], &[]).await;
    write_notice(data, 2, &[("Статус", "Аннулировано")], &[]).await;

    let first = run(config(data, &[1, 2]), 1).await;
    assert_eq!(first.stats.success, 2);

    let mut before = Vec::new();
    for name in [METADATA_TABLE, ATTRIBUTES_TABLE, FILES_TABLE] {
        before.push(tokio::fs::read(table(data, name)).await.unwrap());
    }

    let second = run(config(data, &[1, 2]), 2).await;
    assert_eq!(second.planned, 0);
    assert_eq!(second.stats.processed, 0);

    for (name, expected) in [METADATA_TABLE, ATTRIBUTES_TABLE, FILES_TABLE].into_iter().zip(before) {
        assert_eq!(tokio::fs::read(table(data, name)).await.unwrap(), expected, "{name} changed");
    }
}

#[tokio::test]
async fn restart_processes_only_unfinished_ids() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path();
    write_notice(data, 1, &[("a", "1")], &[]).await;
    write_notice(data, 2, &[("a", "2")], &[]).await;

    let first = run(config(data, &[1, 2, 3]), 1).await;
    assert_eq!(first.stats.success, 2);
    assert_eq!(first.stats.requeued, 1);
    assert_eq!(first.retry_queue_len, 1);

    let rows = metadata(data).await;
    let failed = rows.iter().find(|row| row.id == ItemId::new(3)).unwrap();
    assert_eq!(failed.status, ItemStatus::Failed);
    assert_eq!(failed.error_kind, Some(ErrorKind::SampleNotFound));

    write_notice(data, 3, &[("a", "3")], &[]).await;
    let second = run(config(data, &[1, 2, 3, 4]), 2).await;
    assert_eq!(second.planned, 2);
    assert_eq!(second.retries_planned, 1);
    assert_eq!(second.stats.success, 1);
    assert_eq!(second.stats.requeued, 1);

    let rows = metadata(data).await;
    let ids: Vec<u64> = rows.iter().map(|row| row.id.get()).collect();
    assert_eq!(ids, vec![1, 2, 3, 4]);
    assert_eq!(rows[2].status, ItemStatus::Success);
    assert_eq!(rows[2].run_id, 2);
    assert_eq!(rows[0].run_id, 1);
}

#[tokio::test]
async fn retryable_failures_become_terminal_after_max_retries() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path();
    let mut cfg = config(data, &[9]);
    cfg.max_retries = 2;

    for run_id in 1..=2 {
        let summary = run(cfg.clone(), run_id).await;
        assert_eq!(summary.stats.requeued, 1, "run {run_id}");
        assert_eq!(summary.retry_queue_len, 1);
    }

    let third = run(cfg.clone(), 3).await;
    assert_eq!(third.stats.failed, 1);
    assert_eq!(third.retry_queue_len, 0);

    let fourth = run(cfg, 4).await;
    assert_eq!(fourth.planned, 0);

    let rows = metadata(data).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, ItemStatus::Failed);
    assert_eq!(rows[0].run_id, 3);

    let log = tokio::fs::read_to_string(data.join("state").join("processed_ids.txt"))
        .await
        .unwrap();
    assert_eq!(log, "9\n");
}

#[tokio::test]
async fn one_failed_attachment_does_not_fail_the_notice() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path();
    write_notice(data, 5, &[("a", "1")], &["Гарантия.pdf", "Договор.docx", "Пусто.pdf"]).await;
    write_attachment(data, 5, "Гарантия.pdf", b"%PDF-1.4 guarantee").await;
    write_attachment(data, 5, "Договор.docx", b"PK contract").await;
    write_attachment(data, 5, "Пусто.pdf", b"").await;

    let summary = run(config(data, &[5]), 1).await;
    assert_eq!(summary.stats.success, 1);
    assert_eq!(summary.stats.files_downloaded, 2);
    assert_eq!(summary.stats.files_failed, 1);

    let rows = metadata(data).await;
    assert_eq!(rows[0].status, ItemStatus::Success);

    let entries = files(data).await;
    let statuses: Vec<FileStatus> = entries.iter().map(|entry| entry.status).collect();
    assert_eq!(statuses, vec![FileStatus::Downloaded, FileStatus::Downloaded, FileStatus::Failed]);
    assert_eq!(entries[0].stored_filename, "5_1.pdf");
    assert_eq!(entries[1].stored_filename, "5_2.docx");
    assert!(entries[0].sha256.is_some());
    assert_eq!(entries[0].byte_size, 18);
    assert!(entries[2].sha256.is_none());

    let stored = data.join("raw").join("attachments").join("5");
    assert_eq!(tokio::fs::read(stored.join("5_2.docx")).await.unwrap(), b"PK contract");
    assert!(!stored.join("5_3.pdf").exists());
}

#[tokio::test]
async fn failed_attachment_can_fail_the_notice_on_request() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path();
    write_notice(data, 6, &[("a", "1")], &["ok.pdf", "empty.pdf"]).await;
    write_attachment(data, 6, "ok.pdf", b"data").await;
    write_attachment(data, 6, "empty.pdf", b"").await;

    let mut cfg = config(data, &[6]);
    cfg.fail_on_download_error = true;
    let summary = run(cfg, 1).await;
    assert_eq!(summary.stats.requeued, 1);

    let rows = metadata(data).await;
    assert_eq!(rows[0].status, ItemStatus::Failed);
    assert_eq!(rows[0].error_kind, Some(ErrorKind::Download));
    // Rows are still written for the attempt
    assert_eq!(files(data).await.len(), 2);
}

#[tokio::test]
async fn attachments_without_local_copy_are_skipped_offline() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path();
    write_notice(data, 7, &[("a", "1")], &["remote.pdf"]).await;

    let summary = run(config(data, &[7]), 1).await;
    assert_eq!(summary.stats.success, 1);
    assert_eq!(summary.stats.files_skipped, 1);

    let entries = files(data).await;
    assert_eq!(entries[0].status, FileStatus::Skipped);
    assert!(entries[0].download_url.starts_with("https://zakupki.gov.ru/44fz/filestore/"));
}

#[tokio::test]
async fn schema_union_grows_across_notices() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path();
    write_notice(data, 1, &[("x", "1"), ("y", "2")], &[]).await;
    write_notice(data, 2, &[("y", "3"), ("z", "4")], &[]).await;

    let summary = run(config(data, &[1, 2]), 1).await;
    assert_eq!(summary.schema_keys, 3);
    assert_eq!(attributes(data).await.len(), 4);

    let schema: serde_json::Value = serde_json::from_str(
        &tokio::fs::read_to_string(data.join("processed").join("discovered_schema.json"))
            .await
            .unwrap(),
    )
    .unwrap();
    assert_eq!(schema["keys"], serde_json::json!(["x", "y", "z"]));
}

#[tokio::test]
async fn missing_page_is_skipped_and_never_queued() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path();
    write_sample(
        data,
        11,
        PageKind::GeneralInfo,
        "<html><body><h1>Запрашиваемая страница не существует</h1></body></html>",
    )
    .await;

    let summary = run(config(data, &[11]), 1).await;
    assert_eq!(summary.stats.skipped, 1);
    assert_eq!(summary.retry_queue_len, 0);

    let rows = metadata(data).await;
    assert_eq!(rows[0].status, ItemStatus::Skipped);
    assert_eq!(rows[0].error_kind, Some(ErrorKind::MissingPage));
    // Non-success outcomes keep nothing but the metadata row
    assert!(attributes(data).await.is_empty());
}

#[tokio::test]
async fn missing_document_page_keeps_general_attributes() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path();
    write_sample(data, 12, PageKind::GeneralInfo, &general_page(&[("a", "1")])).await;
    write_sample(
        data,
        12,
        PageKind::Documents,
        "<html><body>Запрашиваемая страница не существует</body></html>",
    )
    .await;

    let summary = run(config(data, &[12]), 1).await;
    assert_eq!(summary.stats.skipped, 1);

    let rows = metadata(data).await;
    assert_eq!(rows[0].error_kind, Some(ErrorKind::MissingDocumentPage));
    assert_eq!(attributes(data).await.len(), 1);
    assert!(
        data.join("raw")
            .join("html")
            .join("generalInformation_12.html")
            .exists()
    );
}

#[tokio::test]
async fn forced_run_replaces_prior_rows() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path();
    write_notice(data, 4, &[("Сумма", "old")], &["scan.pdf"]).await;
    write_attachment(data, 4, "scan.pdf", b"first").await;
    run(config(data, &[4]), 1).await;

    write_notice(data, 4, &[("Сумма", "new")], &["scan.pdf"]).await;
    write_attachment(data, 4, "scan.pdf", b"second").await;

    let unforced = run(config(data, &[4]), 2).await;
    assert_eq!(unforced.planned, 0);
    assert_eq!(attributes(data).await[0].value, "old");

    let mut forced = config(data, &[4]);
    forced.force = true;
    let summary = run(forced, 3).await;
    assert_eq!(summary.stats.success, 1);

    let rows = metadata(data).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].run_id, 3);

    let attrs = attributes(data).await;
    assert_eq!(attrs.len(), 1);
    assert_eq!(attrs[0].value, "new");

    let entries = files(data).await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, FileStatus::Downloaded);
    let stored = data.join("raw").join("attachments").join("4").join("4_1.pdf");
    assert_eq!(tokio::fs::read(stored).await.unwrap(), b"second");
}

#[tokio::test]
async fn work_is_split_across_workers_without_overlap() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path();
    for id in 1..=6 {
        write_notice(data, id, &[("n", id.to_string().as_str())], &[]).await;
    }
    let mut cfg = config(data, &[1, 2, 3, 4, 5, 6]);
    cfg.workers = 3;

    let summary = run(cfg, 1).await;
    assert_eq!(summary.stats.success, 6);

    let mut rows = metadata(data).await;
    rows.sort_by_key(|row| row.id);
    let owners: Vec<usize> = rows.iter().map(|row| row.worker_id).collect();
    assert_eq!(owners, vec![0, 1, 2, 0, 1, 2]);
}
