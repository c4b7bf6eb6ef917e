//! S3-backed bucket driver.

use std::pin::Pin;
use std::task::{Context, Poll};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use chrono::{TimeZone, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::io::AsyncWrite;

use crate::operation::Checker;

use super::{validate_key, BlobError, BlobReader, BlobWriter, Bucket, Filter, Object};

/// A bucket backed by an S3 bucket. Credentials and region resolve through
/// the standard AWS environment.
pub struct S3Bucket {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3Bucket {
    /// Open the named S3 bucket using ambient AWS configuration.
    pub async fn open(bucket: &str) -> Result<Self> {
        let config = aws_config::load_defaults(BehaviorVersion::latest()).await;

        let this = Self {
            client: aws_sdk_s3::Client::new(&config),
            bucket: bucket.to_string(),
        };

        this.check()
            .await
            .with_context(|| format!("bucket {bucket} is not accessible"))?;

        Ok(this)
    }
}

#[async_trait]
impl Checker for S3Bucket {
    fn name(&self) -> String {
        format!("s3://{}", self.bucket)
    }

    async fn check(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .with_context(|| format!("heading bucket {}", self.bucket))?;

        Ok(())
    }
}

#[async_trait]
impl Bucket for S3Bucket {
    async fn open_reader(&self, key: &str) -> Result<BlobReader, BlobError> {
        validate_key(key)?;

        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let service_error = e.into_service_error();
                if service_error.is_no_such_key() {
                    BlobError::NotExist
                } else {
                    BlobError::other(service_error)
                }
            })?;

        Ok(Box::new(output.body.into_async_read()))
    }

    async fn open_writer(&self, key: &str) -> Result<Box<dyn BlobWriter>, BlobError> {
        validate_key(key)?;

        Ok(Box::new(S3Writer {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key: key.to_string(),
            buffer: Vec::new(),
        }))
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        validate_key(key)?;

        // S3 deletes are idempotent, so absence has to be detected up front.
        if !self.exists(key).await? {
            return Err(BlobError::NotExist);
        }

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(BlobError::other)?;

        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, BlobError> {
        validate_key(key)?;

        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    Ok(false)
                } else {
                    Err(BlobError::other(service_error))
                }
            }
        }
    }

    fn list(&self, filter: Filter) -> BoxStream<'static, Result<Object, BlobError>> {
        let pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .into_paginator()
            .send();

        let pages = futures::stream::unfold(pages, |mut pages| async move {
            pages.next().await.map(|page| (page, pages))
        });

        pages
            .flat_map(move |page| match page {
                Ok(output) => {
                    let objects: Vec<_> = output
                        .contents
                        .unwrap_or_default()
                        .into_iter()
                        .filter_map(to_object)
                        .filter(|object| filter.matches(object))
                        .map(Ok)
                        .collect();

                    futures::stream::iter(objects)
                }
                Err(e) => futures::stream::iter(vec![Err(BlobError::other(e))]),
            })
            .boxed()
    }
}

fn to_object(entry: aws_sdk_s3::types::Object) -> Option<Object> {
    let key = entry.key?;

    let last_modified = entry
        .last_modified
        .and_then(|t| Utc.timestamp_opt(t.secs(), t.subsec_nanos()).single())
        .unwrap_or_default();

    Some(Object {
        key,
        size: entry.size.unwrap_or_default().max(0) as u64,
        last_modified,
    })
}

struct S3Writer {
    client: aws_sdk_s3::Client,
    bucket: String,
    key: String,
    buffer: Vec<u8>,
}

impl AsyncWrite for S3Writer {
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
impl BlobWriter for S3Writer {
    async fn close(self: Box<Self>) -> Result<(), BlobError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .body(self.buffer.into())
            .content_type("application/octet-stream")
            .send()
            .await
            .map_err(BlobError::other)?;

        Ok(())
    }
}
