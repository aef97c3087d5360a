use std::sync::Arc;
use std::time::Duration;

use hll_container::container::now;
use hll_container::hash::{HashFunction, Murmur3};
use hll_container::{Backend, Config, Container, Error, MemoryBackend, RetryPolicy, Sketch};

fn config() -> Config {
    Config {
        save_interval: Duration::from_millis(10),
        retry: RetryPolicy {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        },
        ..Config::default()
    }
}

async fn open(backend: &Arc<MemoryBackend>, config: Config) -> Container {
    Container::builder()
        .config(config)
        .backend(backend.clone())
        .open()
        .await
        .unwrap()
}

fn encoded(values: usize) -> Vec<u8> {
    let sketch = Sketch::new("tmp", 0, 0);
    for i in 0..values {
        sketch.add_hash(Murmur3.hash32(format!("v{}", i).as_bytes()));
    }
    sketch.to_bytes()
}

#[tokio::test]
async fn test_restart_restores_estimates() {
    let backend = Arc::new(MemoryBackend::new());
    let first = open(&backend, config()).await;
    let values: Vec<String> = (0..500).map(|i| format!("v{}", i)).collect();
    first.add_multi_log("a", &values, 3_600);
    first.add_log("b", Some(b"x".as_slice()), 0);
    let (a, b) = (first.get_cardinality("a"), first.get_cardinality("b"));
    let expiry = first.expiry("a").unwrap();
    first.shutdown().await.unwrap();

    assert!(backend.is_stopped());
    assert_eq!(backend.len(), 2);
    assert_eq!(backend.get_expiry("a").await.unwrap(), Some(expiry));

    backend.reopen();
    let second = open(&backend, config()).await;
    assert_eq!(second.key_count(), 2);
    assert_eq!(second.get_cardinality("a"), a);
    assert_eq!(second.get_cardinality("b"), b);
    assert_eq!(second.expiry("a"), Some(expiry));
    second.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_expired_records_are_deleted_on_restore() {
    let backend = Arc::new(MemoryBackend::new());
    backend.insert("old", now() - 10, encoded(3));
    backend.insert("live", now() + 3_600, encoded(3));
    backend.insert("forever", 0, encoded(3));

    let container = open(&backend, config()).await;
    assert!(!container.contains("old"));
    assert!(container.contains("live"));
    assert!(container.contains("forever"));
    assert!(!backend.contains("old"));
    assert_eq!(backend.deleted_keys(), vec!["old"]);
    container.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_corrupt_records_are_skipped() {
    let backend = Arc::new(MemoryBackend::new());
    backend.insert("bad", 0, vec![3, 1]);
    backend.insert("good", 0, encoded(10));

    let container = open(&backend, config()).await;
    assert!(!container.contains("bad"));
    assert_eq!(container.key_count(), 1);
    assert!(container.get_cardinality("good") > 0);
    container.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_updates_reach_backend_in_background() {
    let backend = Arc::new(MemoryBackend::new());
    let container = open(&backend, config()).await;
    container.add_log("k", Some(b"v".as_slice()), 0);

    for _ in 0..200 {
        if backend.contains("k") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(backend.contains("k"));
    assert_eq!(container.pending_writes(), 0);
    container.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_delete_waits_for_backend() {
    let backend = Arc::new(MemoryBackend::new());
    let container = open(&backend, config()).await;
    container.add_log("k", Some(b"v".as_slice()), 60);

    assert_eq!(container.del_log("k").await, Ok(true));
    assert!(!backend.contains("k"));
    assert!(backend.deleted_keys().contains(&"k".to_string()));
    assert!(backend.flushes() >= 1);
    assert_eq!(container.del_log("k").await, Ok(false));
    container.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_delete_times_out() {
    let backend = Arc::new(MemoryBackend::new());
    let container = open(
        &backend,
        Config {
            save_interval: Duration::from_secs(3_600),
            delete_timeout: Duration::from_millis(50),
            ..config()
        },
    )
    .await;
    container.add_log("k", Some(b"v".as_slice()), 0);

    let result = container.del_log("k").await;
    assert!(matches!(result, Err(Error::DeleteTimeout { .. })));
    assert!(!container.contains("k"));

    // the deletion still reaches the backend on shutdown
    container.shutdown().await.unwrap();
    assert!(backend.deleted_keys().contains(&"k".to_string()));
}

#[tokio::test]
async fn test_delete_reports_backend_failure() {
    let backend = Arc::new(MemoryBackend::new());
    let container = open(&backend, config()).await;
    container.add_log("k", Some(b"v".as_slice()), 0);
    backend.fail_next(2);

    let result = container.del_log("k").await;
    assert!(matches!(result, Err(Error::Backend(_))));
    container.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_expired_keys_are_deleted_from_backend() {
    let backend = Arc::new(MemoryBackend::new());
    let container = open(&backend, config()).await;
    container.add_log("k", Some(b"v".as_slice()), 10);
    assert_eq!(container.sweep_expired(now() + 1_000), 1);

    container.shutdown().await.unwrap();
    assert!(!backend.contains("k"));
    assert!(backend.deleted_keys().contains(&"k".to_string()));
}

#[tokio::test]
async fn test_failed_restore_delete_is_retried_by_writer() {
    let backend = Arc::new(MemoryBackend::new());
    backend.insert("old", now() - 10, encoded(3));
    backend.fail_next(2);

    let container = open(&backend, config()).await;
    assert!(!container.contains("old"));
    assert!(backend.contains("old"));

    container.shutdown().await.unwrap();
    assert!(!backend.contains("old"));
    assert_eq!(backend.deleted_keys(), vec!["old"]);
}

#[tokio::test]
async fn test_recreated_key_survives_failed_delete() {
    let backend = Arc::new(MemoryBackend::new());
    backend.insert("k", 0, encoded(3));
    let container = Arc::new(
        open(
            &backend,
            Config {
                retry: RetryPolicy {
                    max_attempts: 2,
                    initial_backoff: Duration::from_millis(200),
                    max_backoff: Duration::from_millis(200),
                },
                ..config()
            },
        )
        .await,
    );

    backend.fail_next(2);
    let deleting = {
        let container = container.clone();
        tokio::spawn(async move { container.del_log("k").await })
    };
    // recreate the key while the writer is still retrying the delete
    tokio::time::sleep(Duration::from_millis(50)).await;
    container.add_log("k", Some(b"new".as_slice()), 0);

    let result = deleting.await.unwrap();
    assert!(matches!(result, Err(Error::Backend(_))));

    container.shutdown().await.unwrap();
    assert!(container.contains("k"));
    assert!(backend.contains("k"));

    backend.reopen();
    let restarted = open(&backend, config()).await;
    assert_eq!(restarted.get_cardinality("k"), 1);
    restarted.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_delete_after_shutdown_fails_fast() {
    let backend = Arc::new(MemoryBackend::new());
    let container = open(&backend, config()).await;
    container.add_log("k", Some(b"v".as_slice()), 0);
    container.shutdown().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(1), container.del_log("k")).await;
    assert!(matches!(result, Ok(Err(Error::DeleteAborted { .. }))));
    assert!(container.contains("k"));
}
