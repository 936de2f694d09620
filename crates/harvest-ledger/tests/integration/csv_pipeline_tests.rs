use std::fs::OpenOptions;
use std::io::Write;

use harvest_core::chunk::ChunkStatus;
use harvest_core::config::RunMode;
use harvest_core::testutil::{MockExtractor, MockReporter};
use harvest_core::{AppError, Pipeline, ResultSink};
use harvest_ledger::{ColumnMapping, CsvResultSink, CsvWorkSource, FileChunkLedger};
use tokio_util::sync::CancellationToken;

use crate::integration::common::{fast_config, write_input};

fn output_urls(path: &std::path::Path) -> Vec<String> {
    let mut reader = csv::Reader::from_path(path).unwrap();
    let at = reader
        .headers()
        .unwrap()
        .iter()
        .position(|h| h == "url")
        .unwrap();
    reader
        .records()
        .map(|r| r.unwrap()[at].to_string())
        .collect()
}

fn expected_urls(n: u64) -> Vec<String> {
    (0..n).map(|i| format!("https://example.com/{i}")).collect()
}

#[tokio::test]
async fn csv_run_then_rerun_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), 25);
    let output = dir.path().join("output.csv");

    let source = CsvWorkSource::open(&input, ColumnMapping::default()).await.unwrap();
    let sink = CsvResultSink::open(&output).await.unwrap();
    let summary = Pipeline::new(source, sink, MockExtractor::new(), fast_config().with_concurrency(3))
        .run(CancellationToken::new(), &MockReporter::new())
        .await
        .unwrap();
    assert!(summary.is_complete());
    assert_eq!(summary.succeeded, 25);
    assert_eq!(output_urls(&output), expected_urls(25));

    let extractor = MockExtractor::new();
    let reporter = MockReporter::new();
    let source = CsvWorkSource::open(&input, ColumnMapping::default()).await.unwrap();
    let sink = CsvResultSink::open(&output).await.unwrap();
    let summary = Pipeline::new(source, sink, extractor.clone(), fast_config())
        .run(CancellationToken::new(), &reporter)
        .await
        .unwrap();

    assert_eq!(summary.attempted, 0);
    assert!(extractor.calls().is_empty());
    assert_eq!(reporter.count("AlreadyComplete"), 1);
}

#[tokio::test]
async fn interrupted_csv_run_resumes_without_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), 20);
    let output = dir.path().join("output.csv");

    let cancel = CancellationToken::new();
    let source = CsvWorkSource::open(&input, ColumnMapping::default()).await.unwrap();
    let sink = CsvResultSink::open(&output).await.unwrap();
    let summary = Pipeline::new(
        source,
        sink,
        MockExtractor::new().cancel_after(6, cancel.clone()),
        fast_config().with_concurrency(2),
    )
    .run(cancel, &MockReporter::new())
    .await
    .unwrap();
    assert!(summary.interrupted);
    let first_pass = output_urls(&output);
    assert!(first_pass.len() < 20);
    assert_eq!(first_pass, expected_urls(first_pass.len() as u64));

    let extractor = MockExtractor::new();
    let source = CsvWorkSource::open(&input, ColumnMapping::default()).await.unwrap();
    let sink = CsvResultSink::open(&output).await.unwrap();
    let summary = Pipeline::new(source, sink, extractor.clone(), fast_config())
        .run(CancellationToken::new(), &MockReporter::new())
        .await
        .unwrap();

    assert_eq!(summary.start_index, first_pass.len() as u64);
    assert!(summary.is_complete());
    assert!(extractor.calls().iter().all(|&i| i >= first_pass.len() as u64));
    assert_eq!(output_urls(&output), expected_urls(20));
}

#[tokio::test]
async fn torn_last_row_is_dropped_and_redone() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), 10);
    let output = dir.path().join("output.csv");

    let cancel = CancellationToken::new();
    let source = CsvWorkSource::open(&input, ColumnMapping::default()).await.unwrap();
    let sink = CsvResultSink::open(&output).await.unwrap();
    Pipeline::new(
        source,
        sink,
        MockExtractor::new().cancel_after(4, cancel.clone()),
        fast_config().with_concurrency(1),
    )
    .run(cancel, &MockReporter::new())
    .await
    .unwrap();
    let committed = output_urls(&output).len() as u64;

    let mut file = OpenOptions::new().append(true).open(&output).unwrap();
    write!(file, "Generic,https://example.com/{committed},,Tit").unwrap();
    drop(file);

    let sink = CsvResultSink::open(&output).await.unwrap();
    assert_eq!(sink.count().await.unwrap(), committed);

    let source = CsvWorkSource::open(&input, ColumnMapping::default()).await.unwrap();
    let summary = Pipeline::new(source, sink, MockExtractor::new(), fast_config())
        .run(CancellationToken::new(), &MockReporter::new())
        .await
        .unwrap();
    assert!(summary.is_complete());
    assert_eq!(output_urls(&output), expected_urls(10));
}

#[tokio::test]
async fn chunked_csv_run_records_chunks_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), 23);
    let output = dir.path().join("output.csv");
    let chunks = dir.path().join("output.chunks.json");

    let source = CsvWorkSource::open(&input, ColumnMapping::default()).await.unwrap();
    let sink = CsvResultSink::open(&output).await.unwrap();
    let ledger = FileChunkLedger::open(&chunks).await.unwrap();
    let config = fast_config()
        .with_mode(RunMode::ChunkedParallel)
        .with_chunk_size(5)
        .with_concurrency(3);

    let summary = Pipeline::new(source, sink, MockExtractor::new(), config)
        .with_chunk_ledger(ledger)
        .run(CancellationToken::new(), &MockReporter::new())
        .await
        .unwrap();
    assert!(summary.is_complete());
    assert_eq!(summary.chunks_completed, 5);
    assert_eq!(output_urls(&output), expected_urls(23));

    let entries = FileChunkLedger::open(&chunks).await.unwrap().entries();
    let starts: Vec<u64> = entries.iter().map(|e| e.start).collect();
    assert_eq!(starts, vec![0, 5, 10, 15, 20]);
    assert_eq!(entries.last().unwrap().end, 23);
    assert!(entries.iter().all(|e| e.status == ChunkStatus::Done));
}

#[tokio::test]
async fn longer_output_than_input_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("output.csv");
    {
        let big = write_input(dir.path(), 8);
        let source = CsvWorkSource::open(&big, ColumnMapping::default()).await.unwrap();
        let sink = CsvResultSink::open(&output).await.unwrap();
        Pipeline::new(source, sink, MockExtractor::new(), fast_config())
            .run(CancellationToken::new(), &MockReporter::new())
            .await
            .unwrap();
    }
    let small = write_input(dir.path(), 5);

    let extractor = MockExtractor::new();
    let source = CsvWorkSource::open(&small, ColumnMapping::default()).await.unwrap();
    let sink = CsvResultSink::open(&output).await.unwrap();
    let err = Pipeline::new(source, sink, extractor.clone(), fast_config())
        .run(CancellationToken::new(), &MockReporter::new())
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::ConsistencyError(_)));
    assert!(extractor.calls().is_empty());
}
