use harvest_core::chunk::{Chunk, ChunkId, ChunkStatus};
use harvest_core::config::RunMode;
use harvest_core::models::{ResultRecord, WorkItem};
use harvest_core::testutil::{MockExtractor, MockReporter};
use harvest_core::{AppError, ChunkLedger, Pipeline, ResultSink, WorkSource};
use harvest_ledger::{Database, PgChunkLedger, PgResultSink, PgWorkSource};
use tokio_util::sync::CancellationToken;

use crate::integration::common::{fast_config, setup_test_db};

fn columns() -> Vec<String> {
    vec!["platform".into(), "url".into()]
}

fn items(n: u64) -> Vec<WorkItem> {
    (0..n)
        .map(|i| {
            let url = format!("https://example.com/{i}");
            WorkItem::new(i, "Generic", url.clone())
                .with_field("platform", "Generic")
                .with_field("url", url)
        })
        .collect()
}

#[tokio::test]
async fn import_is_idempotent_and_readable() {
    let (pool, _container) = setup_test_db().await;

    let inserted = PgWorkSource::import(&pool, "sheet", &columns(), &items(12)).await.unwrap();
    assert_eq!(inserted, 12);
    let again = PgWorkSource::import(&pool, "sheet", &columns(), &items(12)).await.unwrap();
    assert_eq!(again, 0);

    let source = Database::from_pool(pool).work_source("sheet").await.unwrap();
    assert_eq!(source.total().await.unwrap(), 12);
    assert_eq!(source.columns(), columns());

    let range = source.get_range(3, 7).await.unwrap();
    assert_eq!(range.iter().map(|i| i.index).collect::<Vec<_>>(), vec![3, 4, 5, 6]);
    assert_eq!(range[0].target, "https://example.com/3");
    assert_eq!(range[0].field("platform"), Some("Generic"));
    assert!(source.get(12).await.is_err());
}

#[tokio::test]
async fn import_rejects_different_columns() {
    let (pool, _container) = setup_test_db().await;
    PgWorkSource::import(&pool, "sheet", &columns(), &items(1)).await.unwrap();

    let err = PgWorkSource::import(&pool, "sheet", &["url".to_string()], &[])
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::ConfigError(_)));
}

#[tokio::test]
async fn unknown_work_ledger_is_config_error() {
    let (pool, _container) = setup_test_db().await;
    let err = PgWorkSource::open(pool, "missing").await.err().unwrap();
    assert!(matches!(err, AppError::ConfigError(_)));
}

#[tokio::test]
async fn sink_append_is_idempotent_by_index() {
    let (pool, _container) = setup_test_db().await;
    let sink = PgResultSink::new(pool, "out");
    let headers: Vec<String> = ["platform", "url", "status"].map(String::from).to_vec();

    sink.ensure_schema(&headers).await.unwrap();
    sink.ensure_schema(&headers).await.unwrap();

    let item = items(1).remove(0);
    let ok = ResultRecord::succeeded(item.clone(), Default::default(), 1);
    sink.append(&ok).await.unwrap();
    sink.append(&ok).await.unwrap();
    assert_eq!(sink.count().await.unwrap(), 1);

    let failed = ResultRecord::failed(
        WorkItem::new(1, "Generic", ""),
        &AppError::InvalidItem("empty URL".into()),
        1,
    );
    sink.append(&failed).await.unwrap();

    let stored = sink.records(0, 10).await.unwrap();
    assert_eq!(stored.len(), 2);
    assert!(stored[0].is_success());
    assert!(!stored[1].is_success());
    assert_eq!(stored[1].column("error"), failed.column("error"));

    let err = sink
        .ensure_schema(&["url".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::ConfigError(_)));
}

#[tokio::test]
async fn chunk_ledger_upserts_status() {
    let (pool, _container) = setup_test_db().await;
    let ledger = PgChunkLedger::new(pool.clone(), "out");
    let other = PgChunkLedger::new(pool, "other");

    assert_eq!(ledger.status(ChunkId::from_start(0)).await.unwrap(), None);
    ledger
        .set_status(&Chunk::new(0, 10), ChunkStatus::InProgress)
        .await
        .unwrap();
    ledger.mark_done(&Chunk::new(0, 10)).await.unwrap();
    ledger
        .set_status(&Chunk::new(10, 15), ChunkStatus::Failed)
        .await
        .unwrap();

    assert!(ledger.is_done(ChunkId::from_start(0)).await.unwrap());
    assert!(!other.is_done(ChunkId::from_start(0)).await.unwrap());

    let entries = ledger.entries().await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1].id, "chunk-000000000010");
    assert_eq!(entries[1].status, ChunkStatus::Failed);
}

#[tokio::test]
async fn chunk_ledger_marks_batch_done() {
    let (pool, _container) = setup_test_db().await;
    let ledger = PgChunkLedger::new(pool, "out");
    ledger
        .set_status(&Chunk::new(20, 30), ChunkStatus::Failed)
        .await
        .unwrap();

    let chunks: Vec<Chunk> = (0..50).map(|i| Chunk::new(i * 10, i * 10 + 10)).collect();
    ledger.mark_all_done(&chunks).await.unwrap();
    ledger.mark_all_done(&chunks[..3]).await.unwrap();

    let entries = ledger.entries().await.unwrap();
    assert_eq!(entries.len(), 50);
    assert!(entries.iter().all(|e| e.status == ChunkStatus::Done));
    assert_eq!(entries[49].chunk(), Chunk::new(490, 500));
}

#[tokio::test]
async fn chunked_pipeline_over_postgres_resumes() {
    let (pool, _container) = setup_test_db().await;
    PgWorkSource::import(&pool, "sheet", &columns(), &items(40)).await.unwrap();
    let db = Database::from_pool(pool);
    let config = fast_config()
        .with_mode(RunMode::ChunkedParallel)
        .with_chunk_size(6)
        .with_concurrency(3);

    let cancel = CancellationToken::new();
    let summary = Pipeline::new(
        db.work_source("sheet").await.unwrap(),
        db.result_sink("out"),
        MockExtractor::new().cancel_after(15, cancel.clone()),
        config.clone(),
    )
    .with_chunk_ledger(db.chunk_ledger("out"))
    .run(cancel, &MockReporter::new())
    .await
    .unwrap();
    assert!(summary.interrupted);

    let sink = db.result_sink("out");
    let committed = sink.count().await.unwrap();
    let stored = sink.records(0, 100).await.unwrap();
    assert_eq!(
        stored.iter().map(|r| r.index).collect::<Vec<_>>(),
        (0..committed).collect::<Vec<_>>()
    );

    let extractor = MockExtractor::new();
    let summary = Pipeline::new(
        db.work_source("sheet").await.unwrap(),
        db.result_sink("out"),
        extractor.clone(),
        config,
    )
    .with_chunk_ledger(db.chunk_ledger("out"))
    .run(CancellationToken::new(), &MockReporter::new())
    .await
    .unwrap();

    assert!(summary.is_complete());
    assert!(extractor.calls().iter().all(|&i| i >= committed));
    assert_eq!(db.result_sink("out").count().await.unwrap(), 40);
    let entries = db.chunk_ledger("out").entries().await.unwrap();
    assert_eq!(entries.len(), 7);
    assert!(entries.iter().all(|e| e.status == ChunkStatus::Done));
}
