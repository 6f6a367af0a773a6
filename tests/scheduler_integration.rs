//! Integration tests for the batch scheduler against a mock HTTP server.

use std::path::Path;
use std::time::Duration;

use bulkget_core::download::JobRequest;
use bulkget_core::{BatchScheduler, EngineConfig, FailureClass, JobResult};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

#[macro_use]
mod support;
use support::range_server::{RangeResponder, mount_file, payload};

fn config(output: &Path) -> EngineConfig {
    EngineConfig {
        output_folder: output.to_path_buf(),
        retry_base_delay_ms: 50,
        retry_max_delay_ms: 400,
        progress_interval_ms: 20,
        ..EngineConfig::default()
    }
}

#[tokio::test]
async fn test_three_jobs_respect_concurrency_limit() {
    let server = require_mock_server!();
    let dir = TempDir::new().unwrap();
    for name in ["a", "b", "c"] {
        let responder = RangeResponder::new(payload(2048)).with_delay(Duration::from_millis(150));
        mount_file(&server, &format!("/{name}"), responder).await;
    }

    let scheduler = BatchScheduler::from_config(&EngineConfig {
        max_concurrent: 2,
        ..config(dir.path())
    })
    .unwrap();
    let jobs: Vec<JobRequest> = ["a", "b", "c"]
        .iter()
        .map(|name| JobRequest::new(format!("{}/{name}", server.uri())))
        .collect();

    let (outcomes, summary) = scheduler.run_to_completion(jobs).await.unwrap();

    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.iter().all(|o| o.downloaded()), "{outcomes:?}");
    assert_eq!(summary.succeeded, 3);
    assert_eq!(summary.bytes, 3 * 2048);
    let peak = scheduler.limiter().peak_in_flight();
    assert!((1..=2).contains(&peak), "peak in flight was {peak}");
    for outcome in &outcomes {
        let bytes = std::fs::read(outcome.path().unwrap()).unwrap();
        assert_eq!(bytes, payload(2048));
    }
}

#[tokio::test]
async fn test_two_server_errors_then_success_retries_twice() {
    let server = require_mock_server!();
    let dir = TempDir::new().unwrap();
    let responder = RangeResponder::new(payload(1000)).failing_first(2);
    mount_file(&server, "/flaky", responder.clone()).await;

    let scheduler = BatchScheduler::from_config(&config(dir.path())).unwrap();
    let (outcomes, summary) = scheduler
        .run_to_completion(vec![JobRequest::new(format!("{}/flaky", server.uri()))])
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 1, "{outcomes:?}");
    assert_eq!(scheduler.stats().retried(), 2);

    let seen = responder.seen();
    assert!(seen.len() >= 3);
    let first_wait = seen[1].at - seen[0].at;
    let second_wait = seen[2].at - seen[1].at;
    assert!(first_wait >= Duration::from_millis(50), "{first_wait:?}");
    assert!(second_wait >= Duration::from_millis(100), "{second_wait:?}");
    assert!(second_wait > first_wait);
}

#[tokio::test]
async fn test_large_file_is_fetched_in_four_segments() {
    let server = require_mock_server!();
    let dir = TempDir::new().unwrap();
    let size = 10 * 1024 * 1024;
    let body = payload(size);
    let responder = RangeResponder::new(body.clone()).with_etag("v1");
    mount_file(&server, "/big.bin", responder.clone()).await;

    let scheduler = BatchScheduler::from_config(&EngineConfig {
        workers_per_job: 4,
        chunk_size_bytes: 64 * 1024,
        ..config(dir.path())
    })
    .unwrap();
    let destination = dir.path().join("big.bin");
    let (outcomes, _) = scheduler
        .run_to_completion(vec![
            JobRequest::new(format!("{}/big.bin", server.uri())).with_destination(&destination),
        ])
        .await
        .unwrap();

    assert!(outcomes[0].downloaded(), "{outcomes:?}");
    assert_eq!(std::fs::metadata(&destination).unwrap().len(), size as u64);
    assert_eq!(std::fs::read(&destination).unwrap(), body);
    assert!(!dir.path().join("big.bin.temp").exists());
    assert!(!dir.path().join("big.bin.temp.json").exists());
    assert_eq!(scheduler.stats().published(), 1);

    // The probe asks for `bytes=0-`; each segment asks for a bounded range.
    let quarter = size / 4;
    let mut segment_ranges: Vec<String> = responder
        .ranges()
        .into_iter()
        .flatten()
        .filter(|r| !r.ends_with('-'))
        .collect();
    segment_ranges.sort();
    let mut expected: Vec<String> = (0..4)
        .map(|i| format!("bytes={}-{}", i * quarter, (i + 1) * quarter - 1))
        .collect();
    expected.sort();
    assert_eq!(segment_ranges, expected);
}

#[tokio::test]
async fn test_cancel_mid_batch_stops_in_flight_and_skips_pending() {
    let server = require_mock_server!();
    let dir = TempDir::new().unwrap();
    let responder = RangeResponder::new(payload(4096)).with_delay(Duration::from_secs(10));
    for i in 0..7 {
        mount_file(&server, &format!("/slow{i}"), responder.clone()).await;
    }

    let scheduler = BatchScheduler::from_config(&EngineConfig {
        max_concurrent: 2,
        ..config(dir.path())
    })
    .unwrap();
    let jobs: Vec<JobRequest> = (0..7)
        .map(|i| {
            JobRequest::new(format!("{}/slow{i}", server.uri()))
                .with_destination(dir.path().join(format!("slow{i}")))
        })
        .collect();
    let mut run = scheduler.run(jobs);

    let limiter = scheduler.limiter();
    tokio::time::timeout(Duration::from_secs(5), async {
        while limiter.in_flight() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    scheduler.cancellation_token().cancel();

    let mut outcomes = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(outcome) = run.outcomes.recv().await {
            outcomes.push(outcome);
        }
    })
    .await
    .unwrap();
    let summary = run.handle.await.unwrap();

    assert_eq!(outcomes.len(), 2, "{outcomes:?}");
    for outcome in &outcomes {
        assert!(
            matches!(
                outcome.result,
                JobResult::Failed {
                    class: FailureClass::Cancelled,
                    ..
                }
            ),
            "{outcome:?}"
        );
    }
    assert_eq!(summary.cancelled, 2);
    assert!(responder.hits() <= 2);
    for i in 0..7 {
        assert!(!dir.path().join(format!("slow{i}")).exists());
    }
}

#[tokio::test]
async fn test_existing_destination_is_not_downloaded_again() {
    let server = require_mock_server!();
    let dir = TempDir::new().unwrap();
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let destination = dir.path().join("present.txt");
    std::fs::write(&destination, b"already here").unwrap();

    let scheduler = BatchScheduler::from_config(&config(dir.path())).unwrap();
    let (outcomes, summary) = scheduler
        .run_to_completion(vec![
            JobRequest::new(format!("{}/present.txt", server.uri())).with_destination(&destination),
        ])
        .await
        .unwrap();

    assert_eq!(
        outcomes[0].result,
        JobResult::Success {
            path: destination.clone(),
            bytes: 0,
            already_existed: true,
        }
    );
    assert_eq!(summary.bytes, 0);
    assert_eq!(std::fs::read(&destination).unwrap(), b"already here");
}

#[tokio::test]
async fn test_not_found_fails_permanently_without_retry() {
    let server = require_mock_server!();
    let dir = TempDir::new().unwrap();
    Mock::given(method("HEAD"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let scheduler = BatchScheduler::from_config(&config(dir.path())).unwrap();
    let (outcomes, summary) = scheduler
        .run_to_completion(vec![JobRequest::new(format!("{}/missing", server.uri()))])
        .await
        .unwrap();

    assert!(matches!(
        outcomes[0].result,
        JobResult::Failed {
            class: FailureClass::Permanent,
            ..
        }
    ));
    assert_eq!(summary.failed, 1);
    assert_eq!(scheduler.stats().retried(), 0);
}

#[tokio::test]
async fn test_derived_destination_uses_hash_and_basename() {
    let server = require_mock_server!();
    let dir = TempDir::new().unwrap();
    mount_file(&server, "/docs/report%20final.pdf", RangeResponder::new(payload(10))).await;

    let scheduler = BatchScheduler::from_config(&config(dir.path())).unwrap();
    let url = format!("{}/docs/report%20final.pdf", server.uri());
    let (outcomes, _) = scheduler
        .run_to_completion(vec![JobRequest::new(url.clone())])
        .await
        .unwrap();

    let path = outcomes[0].path().unwrap();
    assert_eq!(path.parent().unwrap(), dir.path());
    let name = path.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.ends_with("_report_final.pdf"), "{name}");
    assert_eq!(
        name,
        format!(
            "{}_report_final.pdf",
            bulkget_core::download::filename::url_hash(&url)
        )
    );
}
