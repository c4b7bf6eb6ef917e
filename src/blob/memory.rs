//! In-process bucket used by tests and local development.

use std::collections::HashMap;
use std::io::Cursor;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use parking_lot::Mutex;
use tokio::io::AsyncWrite;

use crate::operation::Checker;

use super::{validate_key, BlobError, BlobReader, BlobWriter, Bucket, Filter, Object};

static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<MemoryBucket>>>> = OnceLock::new();

/// Buckets opened through `mem://<name>` URLs are shared per process so that
/// components wired together in one binary observe the same objects.
pub(super) fn shared(name: &str) -> Arc<MemoryBucket> {
    let registry = REGISTRY.get_or_init(|| Mutex::new(HashMap::new()));
    Arc::clone(
        registry
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryBucket::new(name))),
    )
}

struct StoredObject {
    data: Vec<u8>,
    last_modified: DateTime<Utc>,
}

/// A bucket holding its objects in process memory.
pub struct MemoryBucket {
    name: String,
    objects: Arc<Mutex<HashMap<String, StoredObject>>>,
}

impl MemoryBucket {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            objects: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Backdate an object, for exercising age-based filters in tests.
    pub fn set_last_modified(&self, key: &str, last_modified: DateTime<Utc>) {
        if let Some(stored) = self.objects.lock().get_mut(key) {
            stored.last_modified = last_modified;
        }
    }
}

#[async_trait]
impl Checker for MemoryBucket {
    fn name(&self) -> String {
        format!("mem://{}", self.name)
    }

    async fn check(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Bucket for MemoryBucket {
    async fn open_reader(&self, key: &str) -> Result<BlobReader, BlobError> {
        validate_key(key)?;

        let objects = self.objects.lock();
        let stored = objects.get(key).ok_or(BlobError::NotExist)?;

        Ok(Box::new(Cursor::new(stored.data.clone())))
    }

    async fn open_writer(&self, key: &str) -> Result<Box<dyn BlobWriter>, BlobError> {
        validate_key(key)?;

        Ok(Box::new(MemoryWriter {
            key: key.to_string(),
            buffer: Vec::new(),
            objects: Arc::clone(&self.objects),
        }))
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        validate_key(key)?;

        match self.objects.lock().remove(key) {
            Some(_) => Ok(()),
            None => Err(BlobError::NotExist),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, BlobError> {
        validate_key(key)?;

        Ok(self.objects.lock().contains_key(key))
    }

    fn list(&self, filter: Filter) -> BoxStream<'static, Result<Object, BlobError>> {
        let mut objects: Vec<Object> = self
            .objects
            .lock()
            .iter()
            .map(|(key, stored)| Object {
                key: key.clone(),
                size: stored.data.len() as u64,
                last_modified: stored.last_modified,
            })
            .filter(|object| filter.matches(object))
            .collect();

        objects.sort_by(|a, b| a.key.cmp(&b.key));

        Box::pin(futures::stream::iter(objects.into_iter().map(Ok)))
    }
}

struct MemoryWriter {
    key: String,
    buffer: Vec<u8>,
    objects: Arc<Mutex<HashMap<String, StoredObject>>>,
}

impl AsyncWrite for MemoryWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.get_mut().buffer.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl BlobWriter for MemoryWriter {
    async fn close(self: Box<Self>) -> Result<(), BlobError> {
        self.objects.lock().insert(
            self.key,
            StoredObject {
                data: self.buffer,
                last_modified: Utc::now(),
            },
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    async fn put(bucket: &MemoryBucket, key: &str, data: &[u8]) {
        let mut writer = bucket.open_writer(key).await.expect("writer");
        writer.write_all(data).await.expect("write");
        writer.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let bucket = MemoryBucket::new("test");
        put(&bucket, "svc1/staging/1", b"profile data").await;

        let mut reader = bucket.open_reader("svc1/staging/1").await.expect("reader");
        let mut contents = Vec::new();
        reader.read_to_end(&mut contents).await.expect("read");
        assert_eq!(contents, b"profile data");
    }

    #[tokio::test]
    async fn test_not_visible_before_close() {
        let bucket = MemoryBucket::new("test");

        let mut writer = bucket.open_writer("svc1/staging/1").await.expect("writer");
        writer.write_all(b"partial").await.expect("write");

        assert!(!bucket.exists("svc1/staging/1").await.expect("exists"));

        writer.close().await.expect("close");
        assert!(bucket.exists("svc1/staging/1").await.expect("exists"));
    }

    #[tokio::test]
    async fn test_read_missing_is_not_exist() {
        let bucket = MemoryBucket::new("test");
        let result = bucket.open_reader("svc1/default.pgo").await;
        assert!(matches!(result, Err(BlobError::NotExist)));
    }

    #[tokio::test]
    async fn test_delete() {
        let bucket = MemoryBucket::new("test");
        put(&bucket, "svc1/default.pgo", b"x").await;

        bucket.delete("svc1/default.pgo").await.expect("delete");
        let err = bucket.delete("svc1/default.pgo").await.expect_err("gone");
        assert!(matches!(err, BlobError::NotExist));
    }

    #[tokio::test]
    async fn test_list_filtered() {
        let bucket = MemoryBucket::new("test");
        put(&bucket, "svc1/default.pgo", b"abc").await;
        put(&bucket, "svc1/staging/1", b"d").await;
        put(&bucket, "svc2/default.pgo", b"e").await;

        let filter = Filter::new(|o| o.key.starts_with("svc1/"));
        let objects: Vec<_> = bucket
            .list(filter)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<_, _>>()
            .expect("list");

        let keys: Vec<_> = objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["svc1/default.pgo", "svc1/staging/1"]);
        assert_eq!(objects[0].size, 3);
    }
}
