//! HttpDownloader against a mock file server.

use capture_batch::collaborators::{Downloader, HttpDownloader};
use capture_batch::error_code::ErrorClass;
use capture_batch::pool::{HttpClientFactory, LeasePool, PoolConfig};
use capture_batch::resilience::retry::{RetryConfig, RetryPolicy};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

fn downloader(max_retries: u32) -> (HttpDownloader, Arc<LeasePool<reqwest::Client>>) {
    let config = PoolConfig::new().with_max_handles(2);
    let policy = RetryPolicy::new(
        RetryConfig::new()
            .with_delays(Duration::from_millis(1), Duration::from_millis(5))
            .with_jitter(false),
    );
    let pool = Arc::new(LeasePool::new(
        config.clone(),
        Arc::new(HttpClientFactory::new(config)),
        policy,
    ));
    (
        HttpDownloader::new(pool.clone()).with_max_retries(max_retries),
        pool,
    )
}

#[tokio::test]
async fn fetches_payload_and_reuses_the_pooled_client() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/cards/1.jpg")
        .with_status(200)
        .with_body("jpeg-bytes")
        .expect(2)
        .create_async()
        .await;
    let (downloader, pool) = downloader(2);
    let url = format!("{}/cards/1.jpg", server.url());

    let first = assert_ok!(downloader.fetch(&url).await);
    let second = assert_ok!(downloader.fetch(&url).await);
    assert_eq!(first.as_ref(), b"jpeg-bytes");
    assert_eq!(second, first);

    mock.assert_async().await;
    let stats = pool.stats();
    assert_eq!(stats.created, 1);
    assert_eq!(stats.idle, 1);
}

#[tokio::test]
async fn not_found_is_permanent_and_not_retried() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/missing.jpg")
        .with_status(404)
        .expect(1)
        .create_async()
        .await;
    let (downloader, pool) = downloader(3);

    let err = downloader
        .fetch(&format!("{}/missing.jpg", server.url()))
        .await
        .unwrap_err();

    assert_eq!(err.class(), ErrorClass::InvalidInput);
    assert!(!err.is_fallbackable());
    mock.assert_async().await;
    assert_eq!(pool.stats().retries, 0);
}

#[tokio::test]
async fn server_errors_are_retried_until_the_budget_runs_out() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/flaky.jpg")
        .with_status(503)
        .expect(3)
        .create_async()
        .await;
    let (downloader, pool) = downloader(2);

    let err = downloader
        .fetch(&format!("{}/flaky.jpg", server.url()))
        .await
        .unwrap_err();

    assert_eq!(err.class(), ErrorClass::Transient);
    assert!(err.is_fallbackable());
    mock.assert_async().await;
    assert_eq!(pool.stats().retries, 2);
}

#[tokio::test]
async fn oversized_payload_is_rejected_without_retry() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/huge.jpg")
        .with_status(200)
        .with_body("jpeg-bytes")
        .expect(1)
        .create_async()
        .await;
    let (downloader, pool) = downloader(3);
    let downloader = downloader.with_max_bytes(4);

    let err = assert_err!(downloader.fetch(&format!("{}/huge.jpg", server.url())).await);

    assert_eq!(err.class(), ErrorClass::InvalidInput);
    assert!(err.to_string().contains("payload too large: 10 bytes (max 4)"), "{err}");
    mock.assert_async().await;
    assert_eq!(pool.stats().retries, 0);
}

#[tokio::test]
async fn payload_at_the_size_cap_is_accepted() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/exact.jpg")
        .with_status(200)
        .with_body("jpeg-bytes")
        .create_async()
        .await;
    let (downloader, _pool) = downloader(0);
    let downloader = downloader.with_max_bytes(10);

    let body = assert_ok!(downloader.fetch(&format!("{}/exact.jpg", server.url())).await);
    assert_eq!(body.as_ref(), b"jpeg-bytes");
}

#[tokio::test]
async fn malformed_reference_is_invalid_input() {
    let (downloader, _pool) = downloader(1);
    let err = assert_err!(downloader.fetch("not a url").await);
    assert_eq!(err.class(), ErrorClass::InvalidInput);
}
