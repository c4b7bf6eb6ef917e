//! Narrow abstraction over blob storage providers.
//!
//! The scraper, server and worker need only a small slice of object store
//! semantics, which keeps drivers swappable without touching the core. Keys
//! are `/`-separated paths; writes become visible atomically when the writer
//! is closed, with last-writer-wins semantics.

mod fs;
mod memory;
#[cfg(feature = "aws")]
mod s3;

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use tokio::io::{AsyncRead, AsyncWrite};

pub use fs::FsBucket;
pub use memory::MemoryBucket;
#[cfg(feature = "aws")]
pub use s3::S3Bucket;

use crate::operation::Checker;

/// The error given when performing an action against blob storage.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    /// The object at the requested key does not exist.
    #[error("does not exist")]
    NotExist,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BlobError {
    pub(crate) fn other(err: impl Into<anyhow::Error>) -> Self {
        Self::Other(err.into())
    }
}

/// Metadata on an object within the blob store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Object {
    /// The object's key.
    pub key: String,
    /// The object's size in bytes.
    pub size: u64,
    /// When the object was last modified.
    pub last_modified: DateTime<Utc>,
}

/// Programmatically filters the results of [`Bucket::list`].
#[derive(Clone)]
pub struct Filter(Arc<dyn Fn(&Object) -> bool + Send + Sync>);

impl Filter {
    pub fn new(f: impl Fn(&Object) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn matches(&self, object: &Object) -> bool {
        (self.0)(object)
    }

    /// The conjunction of the given filters. With no filters this matches
    /// every object.
    pub fn all(filters: impl IntoIterator<Item = Filter>) -> Filter {
        let filters: Vec<Filter> = filters.into_iter().collect();
        Filter::new(move |object| filters.iter().all(|f| f.matches(object)))
    }

    /// The disjunction of the given filters.
    pub fn any(filters: impl IntoIterator<Item = Filter>) -> Filter {
        let filters: Vec<Filter> = filters.into_iter().collect();
        Filter::new(move |object| filters.iter().any(|f| f.matches(object)))
    }
}

/// A streaming reader over an object's content. Must be dropped to release
/// the underlying connection.
pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

/// A writer that stages data for a key. Nothing becomes visible until
/// [`BlobWriter::close`] returns successfully.
#[async_trait]
pub trait BlobWriter: AsyncWrite + Send + Unpin {
    /// Commit the written data, making it visible at its key.
    async fn close(self: Box<Self>) -> Result<(), BlobError>;
}

/// Keyed object CRUD plus filtered listing over a storage provider.
#[async_trait]
pub trait Bucket: Checker {
    /// Open a reader over the object at the given key. Returns
    /// [`BlobError::NotExist`] if no object exists there.
    async fn open_reader(&self, key: &str) -> Result<BlobReader, BlobError>;

    /// Open a writer that will store data under the given key once closed.
    async fn open_writer(&self, key: &str) -> Result<Box<dyn BlobWriter>, BlobError>;

    /// Remove the object at the given key. Returns [`BlobError::NotExist`]
    /// if no object exists there.
    async fn delete(&self, key: &str) -> Result<(), BlobError>;

    /// Returns true if an object exists at the given key.
    async fn exists(&self, key: &str) -> Result<bool, BlobError>;

    /// Lazily list objects matching the filter. Errors may be interleaved
    /// with results and must be checked on every item.
    fn list(&self, filter: Filter) -> BoxStream<'static, Result<Object, BlobError>>;
}

/// Open a bucket described by a provider URL.
///
/// Supported schemes: `mem://<name>` (in-process, for tests and local
/// development), `file://<path>` (local filesystem) and, with the `aws`
/// feature, `s3://<bucket>`.
pub async fn open_bucket(url: &str) -> Result<Arc<dyn Bucket>> {
    let (scheme, rest) = split_url(url)?;

    match scheme {
        "mem" => Ok(memory::shared(rest)),
        "file" => Ok(Arc::new(FsBucket::open(rest).await?)),
        #[cfg(feature = "aws")]
        "s3" => Ok(Arc::new(S3Bucket::open(rest).await?)),
        _ => bail!("unsupported blob store scheme {scheme:?} in {url:?}"),
    }
}

pub(crate) fn split_url(url: &str) -> Result<(&str, &str)> {
    match url.split_once("://") {
        Some((scheme, rest)) if !scheme.is_empty() && !rest.is_empty() => Ok((scheme, rest)),
        _ => bail!("malformed provider url {url:?}"),
    }
}

/// Rejects keys that could escape a path-based driver's root.
pub(crate) fn validate_key(key: &str) -> Result<(), BlobError> {
    if key.is_empty()
        || key.starts_with('/')
        || key.split('/').any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(BlobError::Other(anyhow::anyhow!("invalid object key {key:?}")));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(key: &str) -> Object {
        Object {
            key: key.to_string(),
            size: 0,
            last_modified: Utc::now(),
        }
    }

    #[test]
    fn test_filter_combinators() {
        let starts = Filter::new(|o| o.key.starts_with("svc1/"));
        let ends = Filter::new(|o| o.key.ends_with(".pgo"));

        let both = Filter::all([starts.clone(), ends.clone()]);
        assert!(both.matches(&object("svc1/default.pgo")));
        assert!(!both.matches(&object("svc1/staging/123")));

        let either = Filter::any([starts, ends]);
        assert!(either.matches(&object("svc2/default.pgo")));
        assert!(!either.matches(&object("svc2/staging/123")));
    }

    #[test]
    fn test_empty_all_matches_everything() {
        assert!(Filter::all([]).matches(&object("anything")));
        assert!(!Filter::any([]).matches(&object("anything")));
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("svc1/staging/123").is_ok());
        assert!(validate_key("svc1/default.pgo").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("/absolute").is_err());
        assert!(validate_key("a//b").is_err());
        assert!(validate_key("a/../b").is_err());
        assert!(validate_key("./a").is_err());
    }

    #[test]
    fn test_split_url() {
        assert_eq!(split_url("mem://bucket").expect("valid"), ("mem", "bucket"));
        assert_eq!(
            split_url("file:///var/profiles").expect("valid"),
            ("file", "/var/profiles"),
        );
        assert!(split_url("not-a-url").is_err());
        assert!(split_url("mem://").is_err());
    }
}
