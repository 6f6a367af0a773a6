//! Resume and validator behavior across separate scheduler runs.

use std::path::Path;

use bulkget_core::download::job::ValidatorToken;
use bulkget_core::download::resume::{self, ResumeRecord};
use bulkget_core::download::{JobRequest, Segment};
use bulkget_core::{BatchScheduler, EngineConfig};
use tempfile::TempDir;

#[macro_use]
mod support;
use support::range_server::{RangeResponder, mount_file, payload};

const MIB: usize = 1024 * 1024;

fn config(output: &Path) -> EngineConfig {
    EngineConfig {
        output_folder: output.to_path_buf(),
        retry_base_delay_ms: 20,
        retry_max_delay_ms: 100,
        ..EngineConfig::default()
    }
}

async fn leave_partial(destination: &Path, url: &str, etag: &str, data: &[u8], total: usize) {
    std::fs::write(resume::temp_path(destination), data).unwrap();
    ResumeRecord {
        url: url.to_string(),
        validator: ValidatorToken::from_etag(etag),
        total_size: Some(total as u64),
        segments: Vec::new(),
    }
    .store(destination)
    .await
    .unwrap();
}

#[tokio::test]
async fn test_single_stream_resumes_from_sidecar_offset() {
    let server = require_mock_server!();
    let dir = TempDir::new().unwrap();
    let body = payload(5000);
    let responder = RangeResponder::new(body.clone()).with_etag("v1");
    mount_file(&server, "/doc.pdf", responder.clone()).await;

    let url = format!("{}/doc.pdf", server.uri());
    let destination = dir.path().join("doc.pdf");
    leave_partial(&destination, &url, "\"v1\"", &body[..1200], body.len()).await;

    let scheduler = BatchScheduler::from_config(&config(dir.path())).unwrap();
    let (outcomes, _) = scheduler
        .run_to_completion(vec![JobRequest::new(url).with_destination(&destination)])
        .await
        .unwrap();

    assert!(outcomes[0].downloaded(), "{outcomes:?}");
    assert_eq!(std::fs::read(&destination).unwrap(), body);
    // Probe, then the continuation from the stored offset.
    assert_eq!(
        responder.ranges(),
        vec![Some("bytes=0-".to_string()), Some("bytes=1200-".to_string())]
    );
    assert!(!resume::sidecar_path(&destination).exists());
}

#[tokio::test]
async fn test_changed_validator_discards_partial_and_restarts() {
    let server = require_mock_server!();
    let dir = TempDir::new().unwrap();
    let body = payload(3000);
    let responder = RangeResponder::new(body.clone()).with_etag("v2");
    mount_file(&server, "/doc.pdf", responder.clone()).await;

    let url = format!("{}/doc.pdf", server.uri());
    let destination = dir.path().join("doc.pdf");
    // Stale bytes written against an older version.
    leave_partial(&destination, &url, "\"v1\"", &[0xAA; 1000], body.len()).await;

    let scheduler = BatchScheduler::from_config(&config(dir.path())).unwrap();
    let (outcomes, _) = scheduler
        .run_to_completion(vec![JobRequest::new(url).with_destination(&destination)])
        .await
        .unwrap();

    assert!(outcomes[0].downloaded(), "{outcomes:?}");
    assert_eq!(std::fs::read(&destination).unwrap(), body);
    assert!(
        responder
            .ranges()
            .iter()
            .flatten()
            .all(|r| r.starts_with("bytes=0-")),
        "{:?}",
        responder.ranges()
    );
}

#[tokio::test]
async fn test_partial_without_range_support_restarts_from_zero() {
    let server = require_mock_server!();
    let dir = TempDir::new().unwrap();
    let body = payload(2500);
    let responder = RangeResponder::new(body.clone()).without_ranges();
    mount_file(&server, "/plain.txt", responder.clone()).await;

    let url = format!("{}/plain.txt", server.uri());
    let destination = dir.path().join("plain.txt");
    std::fs::write(resume::temp_path(&destination), [0x55; 700]).unwrap();

    let scheduler = BatchScheduler::from_config(&config(dir.path())).unwrap();
    let (outcomes, _) = scheduler
        .run_to_completion(vec![JobRequest::new(url).with_destination(&destination)])
        .await
        .unwrap();

    assert!(outcomes[0].downloaded(), "{outcomes:?}");
    assert_eq!(std::fs::read(&destination).unwrap(), body);
}

#[tokio::test]
async fn test_segmented_resume_fetches_only_missing_ranges() {
    let server = require_mock_server!();
    let dir = TempDir::new().unwrap();
    let total = 2 * MIB;
    let body = payload(total);
    let responder = RangeResponder::new(body.clone()).with_etag("seg");
    mount_file(&server, "/big.bin", responder.clone()).await;

    let url = format!("{}/big.bin", server.uri());
    let destination = dir.path().join("big.bin");

    // First segment finished, second half-way.
    let done_in_second = MIB / 2;
    let mut temp = vec![0u8; total];
    temp[..MIB].copy_from_slice(&body[..MIB]);
    temp[MIB..MIB + done_in_second].copy_from_slice(&body[MIB..MIB + done_in_second]);
    std::fs::write(resume::temp_path(&destination), &temp).unwrap();
    ResumeRecord {
        url: url.clone(),
        validator: ValidatorToken::from_etag("\"seg\""),
        total_size: Some(total as u64),
        segments: vec![
            Segment {
                start: 0,
                end: MIB as u64,
                written: MIB as u64,
            },
            Segment {
                start: MIB as u64,
                end: total as u64,
                written: done_in_second as u64,
            },
        ],
    }
    .store(&destination)
    .await
    .unwrap();

    let scheduler = BatchScheduler::from_config(&EngineConfig {
        workers_per_job: 2,
        ..config(dir.path())
    })
    .unwrap();
    let (outcomes, summary) = scheduler
        .run_to_completion(vec![JobRequest::new(url).with_destination(&destination)])
        .await
        .unwrap();

    assert!(outcomes[0].downloaded(), "{outcomes:?}");
    assert_eq!(std::fs::read(&destination).unwrap(), body);
    let fetched: Vec<String> = responder
        .ranges()
        .into_iter()
        .flatten()
        .filter(|r| !r.ends_with('-'))
        .collect();
    assert_eq!(
        fetched,
        vec![format!("bytes={}-{}", MIB + done_in_second, total - 1)]
    );
    assert_eq!(summary.bytes, (total - MIB - done_in_second) as u64);
}

#[tokio::test]
async fn test_bandwidth_cap_throttles_transfer() {
    let server = require_mock_server!();
    let dir = TempDir::new().unwrap();
    let body = payload(128 * 1024);
    mount_file(&server, "/capped", RangeResponder::new(body.clone())).await;

    // 0.05 MiB/s: one second of burst, then about 1.5 s of refill for the rest.
    let scheduler = BatchScheduler::from_config(&EngineConfig {
        max_bandwidth_mbps: 0.05,
        chunk_size_bytes: 4096,
        ..config(dir.path())
    })
    .unwrap();
    let destination = dir.path().join("capped");
    let started = std::time::Instant::now();
    let (outcomes, summary) = scheduler
        .run_to_completion(vec![
            JobRequest::new(format!("{}/capped", server.uri())).with_destination(&destination),
        ])
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(outcomes[0].downloaded(), "{outcomes:?}");
    assert_eq!(std::fs::read(&destination).unwrap(), body);
    assert_eq!(summary.bytes, body.len() as u64);
    assert!(
        elapsed >= std::time::Duration::from_millis(1200),
        "capped transfer took only {elapsed:?}"
    );
}
