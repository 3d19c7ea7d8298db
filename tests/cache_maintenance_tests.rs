use std::collections::BTreeMap;
use std::sync::Arc;

use s3tlsproxy::cache::CacheEngine;
use s3tlsproxy::config::Config;
use s3tlsproxy::metadata::{FileMeta, MetadataStore};
use s3tlsproxy::origin::OriginClient;

fn test_config(cache_dir: &str, db_filename: &str) -> Config {
    let toml = format!(
        r#"
        cacheDir = "{cache_dir}"
        DBFilename = "{db_filename}"
        secretKey = "topsecret"

        [hosts."example.org"]
        bucket = "example-bucket"
        accessKey = "ak"
        secretKey = "sk"
        "#
    );
    Config::parse(&toml).unwrap()
}

async fn seed(cache_dir: &std::path::Path, metadata: &MetadataStore, filename: &str, created_at: i64, size: usize) {
    let full = cache_dir.join(filename);
    if let Some(parent) = full.parent() {
        tokio::fs::create_dir_all(parent).await.unwrap();
    }
    tokio::fs::write(&full, vec![b'x'; size]).await.unwrap();

    let meta = FileMeta {
        filename: filename.to_string(),
        size: size as i64,
        mod_time: created_at,
        status_code: 200,
        header: BTreeMap::new(),
        created_at,
    };
    metadata.put(&meta).unwrap();
}

#[tokio::test]
async fn purge_prefix_removes_matching_entries_and_files() {
    let cache_dir = tempfile::tempdir().unwrap();
    let db_dir = tempfile::tempdir().unwrap();
    let config = Arc::new(test_config(
        cache_dir.path().to_str().unwrap(),
        db_dir.path().to_str().unwrap(),
    ));

    let metadata = Arc::new(MetadataStore::open(db_dir.path()).await.unwrap());
    seed(cache_dir.path(), &metadata, "example.org/assets/a.css", 1, 10).await;
    seed(cache_dir.path(), &metadata, "example.org/assets/b.css", 2, 10).await;
    seed(cache_dir.path(), &metadata, "example.org/index.html", 3, 10).await;

    let origin = Arc::new(OriginClient::new().unwrap());
    let cache = CacheEngine::new(config, metadata.clone(), origin);

    let purged = cache.purge_prefix("example.org/assets/").await.unwrap();
    assert_eq!(purged, 2);
    assert!(metadata.get("example.org/assets/a.css").unwrap().is_none());
    assert!(metadata.get("example.org/index.html").unwrap().is_some());
    assert!(!cache_dir.path().join("example.org/assets/a.css").exists());
}

#[tokio::test]
async fn shrink_to_deletes_oldest_entries_first() {
    let cache_dir = tempfile::tempdir().unwrap();
    let db_dir = tempfile::tempdir().unwrap();
    let config = Arc::new(test_config(
        cache_dir.path().to_str().unwrap(),
        db_dir.path().to_str().unwrap(),
    ));

    let metadata = Arc::new(MetadataStore::open(db_dir.path()).await.unwrap());
    seed(cache_dir.path(), &metadata, "example.org/a", 1, 100).await;
    seed(cache_dir.path(), &metadata, "example.org/b", 2, 100).await;
    seed(cache_dir.path(), &metadata, "example.org/c", 3, 100).await;

    let origin = Arc::new(OriginClient::new().unwrap());
    let cache = CacheEngine::new(config, metadata.clone(), origin);

    let deleted = cache.shrink_to(150).await.unwrap();
    assert_eq!(deleted, 2);
    assert!(metadata.get("example.org/a").unwrap().is_none());
    assert!(metadata.get("example.org/b").unwrap().is_none());
    assert!(metadata.get("example.org/c").unwrap().is_some());
}

#[tokio::test]
async fn purge_prefix_on_empty_cache_is_a_no_op() {
    let cache_dir = tempfile::tempdir().unwrap();
    let db_dir = tempfile::tempdir().unwrap();
    let config = Arc::new(test_config(
        cache_dir.path().to_str().unwrap(),
        db_dir.path().to_str().unwrap(),
    ));
    let metadata = Arc::new(MetadataStore::open(db_dir.path()).await.unwrap());
    let origin = Arc::new(OriginClient::new().unwrap());
    let cache = CacheEngine::new(config, metadata, origin);

    assert_eq!(cache.purge_prefix("example.org/nothing").await.unwrap(), 0);
}
