//! Targets loaded from a JSON file on disk, reloaded on SIGHUP.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::operation::Checker;

use super::{Target, TargetSource};

/// A source of targets loaded from a JSON file containing an array of
/// [`Target`] values. Sending the process SIGHUP re-reads the file; if the
/// reload fails the previous list is preserved.
pub struct FileSource {
    location: PathBuf,
    targets: Arc<RwLock<Vec<Target>>>,
}

impl FileSource {
    pub async fn new(location: impl Into<PathBuf>, cancel: &CancellationToken) -> Result<Self> {
        let location = location.into();
        let targets = Arc::new(RwLock::new(read_targets(&location).await?));

        let source = Self {
            location: location.clone(),
            targets: Arc::clone(&targets),
        };

        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = watch_reloads(&location, &targets, cancel).await {
                error!(error = %e, "target reload watcher failed");
            }
        });

        Ok(source)
    }
}

async fn watch_reloads(
    location: &Path,
    targets: &RwLock<Vec<Target>>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut hangup = signal(SignalKind::hangup()).context("registering SIGHUP handler")?;

    loop {
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            _ = hangup.recv() => {
                match read_targets(location).await {
                    Ok(updated) => {
                        *targets.write() = updated;
                        debug!(file = %location.display(), "targets updated");
                    }
                    Err(e) => {
                        error!(
                            file = %location.display(),
                            error = %e,
                            "failed to read updated targets",
                        );
                    }
                }
            }
        }
    }
}

async fn read_targets(location: &Path) -> Result<Vec<Target>> {
    let data = tokio::fs::read(location)
        .await
        .with_context(|| format!("reading targets file {}", location.display()))?;

    serde_json::from_slice(&data)
        .with_context(|| format!("parsing targets file {}", location.display()))
}

#[async_trait]
impl Checker for FileSource {
    fn name(&self) -> String {
        format!("file://{}", self.location.display())
    }

    async fn check(&self) -> Result<()> {
        tokio::fs::metadata(&self.location)
            .await
            .with_context(|| format!("statting {}", self.location.display()))?;

        Ok(())
    }
}

#[async_trait]
impl TargetSource for FileSource {
    async fn list(&self) -> Result<Vec<Target>> {
        Ok(self.targets.read().clone())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn targets_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(contents.as_bytes()).expect("write");
        file.flush().expect("flush");
        file
    }

    #[tokio::test]
    async fn test_loads_targets() {
        let file = targets_file(
            r#"[
                {"address": "http://10.0.0.1:8080"},
                {"address": "http://10.0.0.2:8080", "path": "/custom"}
            ]"#,
        );

        let cancel = CancellationToken::new();
        let source = FileSource::new(file.path(), &cancel).await.expect("source");

        let targets = source.list().await.expect("list");
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].address, "http://10.0.0.1:8080");
        assert_eq!(targets[1].path, "/custom");

        // Repeated listings are stable between reloads.
        assert_eq!(source.list().await.expect("list"), targets);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_rejects_malformed_file() {
        let file = targets_file("not json");
        let cancel = CancellationToken::new();
        assert!(FileSource::new(file.path(), &cancel).await.is_err());
    }

    #[tokio::test]
    async fn test_check_reports_missing_file() {
        let file = targets_file("[]");
        let cancel = CancellationToken::new();
        let source = FileSource::new(file.path(), &cancel).await.expect("source");

        source.check().await.expect("file still present");

        let path = file.path().to_path_buf();
        drop(file);
        assert!(!path.exists());
        assert!(source.check().await.is_err());
        cancel.cancel();
    }
}
