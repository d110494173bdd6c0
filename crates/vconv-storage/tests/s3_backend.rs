//! S3 backend integration tests.
//!
//! These run against a real bucket configured through the environment
//! (`BUCKET_NAME`, `S3_ENDPOINT_URL`, AWS credentials).

use uuid::Uuid;
use vconv_storage::{Backend, CreateOutcome, S3Backend};

async fn backend() -> S3Backend {
    dotenvy::dotenv().ok();
    S3Backend::from_env().await.expect("Failed to create S3 backend")
}

/// Conditional create must reject a second writer.
#[tokio::test]
#[ignore = "requires S3"]
async fn test_s3_create_if_absent() {
    let backend = backend().await;
    let key = format!("vconv-tests/{}/update.lock", Uuid::new_v4());

    let first = backend.create_if_absent(&key, b"a".to_vec()).await.unwrap();
    let second = backend.create_if_absent(&key, b"b".to_vec()).await.unwrap();

    assert_eq!(first, CreateOutcome::Created);
    assert_eq!(second, CreateOutcome::AlreadyExists);
    assert_eq!(backend.get(&key).await.unwrap(), b"a");

    backend.delete(&key).await.unwrap();
    backend.delete(&key).await.unwrap();
    assert!(backend.get(&key).await.unwrap_err().is_not_found());
}

/// Listing filters media files under the prefix.
#[tokio::test]
#[ignore = "requires S3"]
async fn test_s3_list_media() {
    let backend = backend().await;
    let prefix = format!("vconv-tests/{}/", Uuid::new_v4());

    for name in ["a.mp4", "b.MOV", "c.txt"] {
        backend
            .put(&format!("{}{}", prefix, name), b"x".to_vec())
            .await
            .unwrap();
    }

    let mut items = backend.list(&prefix).await.unwrap();
    items.sort();
    assert_eq!(items, [format!("{}a.mp4", prefix), format!("{}b.MOV", prefix)]);

    for key in backend.list_keys(&prefix).await.unwrap() {
        backend.delete(&key).await.unwrap();
    }
}
