//! Single-flight fetch tests
//!
//! Concurrent requests for one identifier share a single external fetch;
//! failures publish nothing and do not block later attempts.

mod common;

use common::{coordinator, partial_files, settings, ScriptedFetcher};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use video_cache_proxy::cache_key::derive_key;
use video_cache_proxy::ProxyError;

const SOURCE: &str = "https://www.youtube.com/watch?v=abc";

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_share_one_fetch() {
    let temp_dir = TempDir::new().unwrap();
    let fetcher = Arc::new(
        ScriptedFetcher::writing(vec![7u8; 1000]).with_delay(Duration::from_millis(200)),
    );
    let coordinator = coordinator(
        temp_dir.path(),
        fetcher.clone(),
        settings(Duration::from_secs(10), Duration::from_secs(10)),
    )
    .await;

    let mut handles = Vec::new();
    for _ in 0..32 {
        let coordinator = coordinator.clone();
        handles.push(tokio::spawn(async move {
            coordinator.retrieve_blocking(SOURCE).await
        }));
    }

    for handle in handles {
        let entry = handle.await.unwrap().unwrap();
        assert_eq!(entry.size, 1000);
        assert_eq!(entry.key, derive_key(SOURCE));
    }

    assert_eq!(fetcher.calls(), 1, "exactly one external fetch");
    let stats = coordinator.stats();
    assert_eq!(stats.fetches_started, 1);
    assert_eq!(stats.fetches_succeeded, 1);
    assert_eq!(coordinator.in_flight_count(), 0);
    assert!(partial_files(temp_dir.path()).is_empty());
}

#[tokio::test]
async fn test_cached_entry_is_served_without_fetching() {
    let temp_dir = TempDir::new().unwrap();
    let fetcher = Arc::new(ScriptedFetcher::writing(b"video".to_vec()));
    let coordinator = coordinator(
        temp_dir.path(),
        fetcher.clone(),
        settings(Duration::from_secs(5), Duration::from_secs(5)),
    )
    .await;

    let first = coordinator.retrieve_blocking(SOURCE).await.unwrap();
    let second = coordinator.retrieve_blocking(SOURCE).await.unwrap();

    assert_eq!(first.path, second.path);
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(coordinator.stats().cache_hits, 1);
    assert_eq!(std::fs::read(&second.path).unwrap(), b"video");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_distinct_identifiers_fetch_independently() {
    let temp_dir = TempDir::new().unwrap();
    let fetcher = Arc::new(
        ScriptedFetcher::writing(b"clip".to_vec()).with_delay(Duration::from_millis(300)),
    );
    let coordinator = coordinator(
        temp_dir.path(),
        fetcher.clone(),
        settings(Duration::from_secs(5), Duration::from_secs(5)),
    )
    .await;

    let a = "https://www.youtube.com/watch?v=one";
    let b = "https://www.youtube.com/watch?v=two";
    let started = std::time::Instant::now();
    let (first, second) = tokio::join!(
        coordinator.retrieve_blocking(a),
        coordinator.retrieve_blocking(b)
    );
    let elapsed = started.elapsed();

    // Serialized fetches would need at least 600ms
    assert!(
        elapsed < Duration::from_millis(550),
        "distinct keys were fetched one after another: {:?}",
        elapsed
    );

    let (first, second) = (first.unwrap(), second.unwrap());
    assert_ne!(first.path, second.path);
    assert_eq!(fetcher.calls(), 2);

    let mut sources = fetcher.sources();
    sources.sort();
    assert_eq!(sources, vec![a.to_string(), b.to_string()]);
}

#[tokio::test]
async fn test_failed_fetch_publishes_nothing_and_is_retried() {
    let temp_dir = TempDir::new().unwrap();
    let fetcher = Arc::new(ScriptedFetcher::writing(vec![1u8; 64]).failing_first(1));
    let coordinator = coordinator(
        temp_dir.path(),
        fetcher.clone(),
        settings(Duration::from_secs(5), Duration::from_secs(5)),
    )
    .await;

    let result = coordinator.retrieve_blocking(SOURCE).await;
    assert!(matches!(result, Err(ProxyError::FetchError(_))));

    let entry_path = coordinator.layout().entry_path(&derive_key(SOURCE));
    assert!(!entry_path.exists(), "failed fetch must not publish");
    assert!(partial_files(temp_dir.path()).is_empty());

    // The next request starts a fresh attempt
    let entry = coordinator.retrieve_blocking(SOURCE).await.unwrap();
    assert_eq!(entry.size, 64);
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_all_waiters_receive_the_failure() {
    let temp_dir = TempDir::new().unwrap();
    let fetcher = Arc::new(
        ScriptedFetcher::writing(vec![1u8; 8])
            .with_delay(Duration::from_millis(150))
            .failing_first(1),
    );
    let coordinator = coordinator(
        temp_dir.path(),
        fetcher.clone(),
        settings(Duration::from_secs(5), Duration::from_secs(5)),
    )
    .await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let coordinator = coordinator.clone();
        handles.push(tokio::spawn(async move {
            coordinator.retrieve_blocking(SOURCE).await
        }));
    }

    for handle in handles {
        let result = handle.await.unwrap();
        match result {
            Err(ProxyError::FetchError(msg)) => assert!(msg.contains("simulated")),
            other => panic!("expected fetch error, got {:?}", other),
        }
    }
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn test_waiter_gives_up_after_wait_timeout() {
    let temp_dir = TempDir::new().unwrap();
    let fetcher = Arc::new(
        ScriptedFetcher::writing(b"slow".to_vec()).with_delay(Duration::from_secs(2)),
    );
    let coordinator = coordinator(
        temp_dir.path(),
        fetcher.clone(),
        settings(Duration::from_millis(100), Duration::from_secs(10)),
    )
    .await;

    let result = coordinator.retrieve_blocking(SOURCE).await;
    assert!(matches!(result, Err(ProxyError::LockTimeout(_))));

    // The fetch keeps running for later requests
    assert_eq!(coordinator.in_flight_count(), 1);
    assert!(coordinator.drain(Duration::from_secs(5)).await);
    assert!(coordinator
        .layout()
        .entry_path(&derive_key(SOURCE))
        .exists());
}

#[tokio::test]
async fn test_fetch_deadline_aborts_and_cleans_up() {
    let temp_dir = TempDir::new().unwrap();
    let fetcher = Arc::new(ScriptedFetcher::hanging());
    let coordinator = coordinator(
        temp_dir.path(),
        fetcher.clone(),
        settings(Duration::from_secs(5), Duration::from_millis(100)),
    )
    .await;

    let result = coordinator.retrieve_blocking(SOURCE).await;
    match result {
        Err(ProxyError::FetchError(msg)) => assert!(msg.contains("deadline")),
        other => panic!("expected deadline error, got {:?}", other),
    }
    assert_eq!(coordinator.in_flight_count(), 0);
    assert!(partial_files(temp_dir.path()).is_empty());
}

#[tokio::test]
async fn test_stale_partials_removed_on_initialize() {
    let temp_dir = TempDir::new().unwrap();
    let partial_dir = temp_dir.path().join(".partial");
    std::fs::create_dir_all(&partial_dir).unwrap();
    std::fs::write(partial_dir.join("leftover.1234.mp4"), b"half").unwrap();
    std::fs::write(partial_dir.join("leftover.1234.mp4.ytdl"), b"state").unwrap();

    let fetcher = Arc::new(ScriptedFetcher::writing(b"x".to_vec()));
    let _coordinator = coordinator(
        temp_dir.path(),
        fetcher,
        settings(Duration::from_secs(1), Duration::from_secs(1)),
    )
    .await;

    assert!(partial_files(temp_dir.path()).is_empty());
}
