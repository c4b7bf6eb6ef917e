//! Local filesystem bucket. Keys map to paths beneath a root directory;
//! writes are staged in a hidden directory and renamed into place on close.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::operation::Checker;

use super::{validate_key, BlobError, BlobReader, BlobWriter, Bucket, Filter, Object};

const STAGING_DIR: &str = ".staging";

/// A bucket rooted at a directory on the local filesystem.
pub struct FsBucket {
    root: PathBuf,
}

impl FsBucket {
    /// Open a bucket rooted at the given directory, creating it if needed.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();

        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("creating bucket root {}", root.display()))?;
        tokio::fs::create_dir_all(root.join(STAGING_DIR))
            .await
            .context("creating staging directory")?;

        Ok(Self { root })
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl Checker for FsBucket {
    fn name(&self) -> String {
        format!("file://{}", self.root.display())
    }

    async fn check(&self) -> Result<()> {
        let meta = tokio::fs::metadata(&self.root)
            .await
            .with_context(|| format!("statting {}", self.root.display()))?;

        anyhow::ensure!(meta.is_dir(), "{} is not a directory", self.root.display());
        Ok(())
    }
}

#[async_trait]
impl Bucket for FsBucket {
    async fn open_reader(&self, key: &str) -> Result<BlobReader, BlobError> {
        validate_key(key)?;

        match tokio::fs::File::open(self.object_path(key)).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(BlobError::NotExist),
            Err(e) => Err(BlobError::other(e)),
        }
    }

    async fn open_writer(&self, key: &str) -> Result<Box<dyn BlobWriter>, BlobError> {
        validate_key(key)?;

        let staging_path = self
            .root
            .join(STAGING_DIR)
            .join(Uuid::new_v4().to_string());

        let file = tokio::fs::File::create(&staging_path)
            .await
            .map_err(BlobError::other)?;

        Ok(Box::new(FsWriter {
            file,
            staging_path,
            final_path: self.object_path(key),
        }))
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        validate_key(key)?;

        match tokio::fs::remove_file(self.object_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(BlobError::NotExist),
            Err(e) => Err(BlobError::other(e)),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, BlobError> {
        validate_key(key)?;

        match tokio::fs::metadata(self.object_path(key)).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(BlobError::other(e)),
        }
    }

    fn list(&self, filter: Filter) -> BoxStream<'static, Result<Object, BlobError>> {
        let root = self.root.clone();

        let collected = async move {
            match collect_objects(&root).await {
                Ok(mut objects) => {
                    objects.sort_by(|a, b| a.key.cmp(&b.key));
                    objects
                        .into_iter()
                        .filter(|object| filter.matches(object))
                        .map(Ok)
                        .collect::<Vec<_>>()
                }
                Err(e) => vec![Err(BlobError::other(e))],
            }
        };

        Box::pin(
            futures::stream::once(collected)
                .map(futures::stream::iter)
                .flatten(),
        )
    }
}

/// Walk the bucket root, returning metadata for every regular file. Hidden
/// directories (the staging area) are skipped.
async fn collect_objects(root: &Path) -> Result<Vec<Object>> {
    let mut objects = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("reading directory {}", dir.display()))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("reading directory {}", dir.display()))?
        {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with('.') {
                continue;
            }

            let meta = entry.metadata().await.context("reading metadata")?;
            if meta.is_dir() {
                pending.push(entry.path());
                continue;
            }

            let relative = entry
                .path()
                .strip_prefix(root)
                .context("stripping bucket root")?
                .to_path_buf();

            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");

            let modified: DateTime<Utc> = meta
                .modified()
                .context("reading modification time")?
                .into();

            objects.push(Object {
                key,
                size: meta.len(),
                last_modified: modified,
            });
        }
    }

    Ok(objects)
}

struct FsWriter {
    file: tokio::fs::File,
    staging_path: PathBuf,
    final_path: PathBuf,
}

impl AsyncWrite for FsWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().file).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_shutdown(cx)
    }
}

#[async_trait]
impl BlobWriter for FsWriter {
    async fn close(mut self: Box<Self>) -> Result<(), BlobError> {
        self.file.flush().await.map_err(BlobError::other)?;
        self.file.sync_all().await.map_err(BlobError::other)?;

        if let Some(parent) = self.final_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(BlobError::other)?;
        }

        tokio::fs::rename(&self.staging_path, &self.final_path)
            .await
            .map_err(BlobError::other)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use tokio::io::AsyncReadExt;

    use super::*;

    async fn bucket() -> (tempfile::TempDir, FsBucket) {
        let dir = tempfile::tempdir().expect("tempdir");
        let bucket = FsBucket::open(dir.path()).await.expect("bucket");
        (dir, bucket)
    }

    async fn put(bucket: &FsBucket, key: &str, data: &[u8]) {
        let mut writer = bucket.open_writer(key).await.expect("writer");
        writer.write_all(data).await.expect("write");
        writer.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (_dir, bucket) = bucket().await;
        put(&bucket, "svc1/staging/42", b"profile data").await;

        let mut reader = bucket.open_reader("svc1/staging/42").await.expect("reader");
        let mut contents = Vec::new();
        reader.read_to_end(&mut contents).await.expect("read");
        assert_eq!(contents, b"profile data");
    }

    #[tokio::test]
    async fn test_not_visible_before_close() {
        let (_dir, bucket) = bucket().await;

        let mut writer = bucket.open_writer("svc1/default.pgo").await.expect("writer");
        writer.write_all(b"partial").await.expect("write");
        assert!(!bucket.exists("svc1/default.pgo").await.expect("exists"));

        writer.close().await.expect("close");
        assert!(bucket.exists("svc1/default.pgo").await.expect("exists"));
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_exist() {
        let (_dir, bucket) = bucket().await;
        let err = bucket.delete("svc1/default.pgo").await.expect_err("missing");
        assert!(matches!(err, BlobError::NotExist));
    }

    #[tokio::test]
    async fn test_list_skips_staging_area() {
        let (_dir, bucket) = bucket().await;
        put(&bucket, "svc1/default.pgo", b"abc").await;
        put(&bucket, "svc2/staging/7", b"defg").await;

        // An unclosed writer leaves data in the staging area only.
        let mut writer = bucket.open_writer("svc3/default.pgo").await.expect("writer");
        writer.write_all(b"partial").await.expect("write");
        drop(writer);

        let objects: Vec<_> = bucket
            .list(Filter::all([]))
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<_, _>>()
            .expect("list");

        let keys: Vec<_> = objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["svc1/default.pgo", "svc2/staging/7"]);
        assert_eq!(objects[1].size, 4);
    }

    #[tokio::test]
    async fn test_overwrite_is_last_writer_wins() {
        let (_dir, bucket) = bucket().await;
        put(&bucket, "svc1/default.pgo", b"first").await;
        put(&bucket, "svc1/default.pgo", b"second").await;

        let mut reader = bucket.open_reader("svc1/default.pgo").await.expect("reader");
        let mut contents = Vec::new();
        reader.read_to_end(&mut contents).await.expect("read");
        assert_eq!(contents, b"second");
    }
}
