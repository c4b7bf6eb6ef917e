//! The event-driven worker that merges staged profiles into base profiles
//! and garbage-collects staged objects once merged.

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::blob::{BlobError, Bucket};
use crate::event::{unmarshal, Envelope, EventHandler, Writer};
use crate::metrics::Metrics;
use crate::pprof::Profile;

use super::{
    base_profile_key, MergedEvent, UploadedEvent, EVENT_TYPE_MERGED, EVENT_TYPE_UPLOADED,
};

/// Pruning rules for a single application.
#[derive(Debug, Clone, Deserialize)]
pub struct PruneConfig {
    /// The application whose profiles should be pruned.
    pub app: String,
    /// The pruning rules to apply, in order.
    pub rules: Vec<PruneRule>,
}

/// A single pruning action performed on a merged profile.
#[derive(Debug, Clone, Deserialize)]
pub struct PruneRule {
    /// Nodes matching this expression are dropped, along with everything
    /// beneath them.
    #[serde(default, deserialize_with = "deserialize_rule_regex")]
    pub drop: Option<Regex>,
    /// Nodes matching drop that also match this expression are kept.
    #[serde(default, deserialize_with = "deserialize_rule_regex")]
    pub keep: Option<Regex>,
}

/// Empty strings are treated as an absent expression; invalid expressions
/// are rejected at load time.
fn deserialize_rule_regex<'de, D>(deserializer: D) -> Result<Option<Regex>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;

    match raw.as_deref() {
        None | Some("") => Ok(None),
        Some(pattern) => Regex::new(pattern)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Load pruning configuration from a JSON file containing an array of
/// [`PruneConfig`] values. A missing file yields no rules.
pub fn load_prune_config(location: Option<&Path>) -> Result<Vec<PruneConfig>> {
    let Some(location) = location else {
        return Ok(Vec::new());
    };

    let data = match std::fs::read(location) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).with_context(|| {
                format!("reading prune config {}", location.display())
            });
        }
    };

    let configs: Vec<PruneConfig> = serde_json::from_slice(&data)
        .with_context(|| format!("parsing prune config {}", location.display()))?;

    for config in &configs {
        for (index, rule) in config.rules.iter().enumerate() {
            if rule.drop.is_none() && rule.keep.is_none() {
                bail!(
                    "prune rule {index} for {} must set at least one of drop or keep",
                    config.app,
                );
            }
        }
    }

    Ok(configs)
}

/// Handles profile events, merging uploaded profiles into a single base
/// profile per application and deleting staged profiles once merged.
///
/// Handler errors propagate to the subscription, which nacks the message
/// and exits its read loop; process supervision is expected to restart the
/// worker. Duplicate deliveries of an uploaded event double-count that
/// profile's samples, an accepted trade-off for a statistical input.
pub struct Worker {
    blobs: Arc<dyn Bucket>,
    events: Arc<Writer>,
    pruning: Vec<PruneConfig>,
    metrics: Arc<Metrics>,
}

impl Worker {
    pub fn new(
        blobs: Arc<dyn Bucket>,
        events: Arc<Writer>,
        pruning: Vec<PruneConfig>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            blobs,
            events,
            pruning,
            metrics,
        }
    }

    /// The event types the worker subscribes to.
    pub fn event_types() -> [&'static str; 2] {
        [EVENT_TYPE_UPLOADED, EVENT_TYPE_MERGED]
    }

    async fn read_object(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut reader = match self.blobs.open_reader(key).await {
            Ok(reader) => reader,
            Err(BlobError::NotExist) => return Ok(None),
            Err(e) => return Err(anyhow!(e)).context(format!("failed to read profile at {key}")),
        };

        let mut data = Vec::new();
        reader
            .read_to_end(&mut data)
            .await
            .with_context(|| format!("failed to read profile at {key}"))?;

        Ok(Some(data))
    }

    async fn handle_uploaded(&self, envelope: &Envelope) -> Result<()> {
        let payload: UploadedEvent = unmarshal(envelope).context("invalid payload")?;

        // The staged object may already have been cleaned up by an earlier
        // delivery of this event.
        let Some(staged) = self.read_object(&payload.profile_key).await? else {
            return Ok(());
        };

        let base_key = base_profile_key(&payload.app);
        let base = self.read_object(&base_key).await?;

        let staged = Profile::parse(&staged)
            .with_context(|| format!("failed to parse profile at {}", payload.profile_key))?;

        let mut profiles = vec![staged];
        match base {
            Some(data) => {
                debug!(
                    key = %payload.profile_key,
                    app = %payload.app,
                    "merging upload with base profile",
                );

                profiles.push(
                    Profile::parse(&data)
                        .with_context(|| format!("failed to parse profile at {base_key}"))?,
                );
            }
            None => {
                debug!(app = %payload.app, "app has no base profile, upload will be used");
            }
        }

        let mut merged = Profile::merge(profiles).with_context(|| {
            format!("failed to merge profiles {} and {base_key}", payload.profile_key)
        })?;

        if let Some(config) = self.pruning.iter().find(|p| p.app == payload.app) {
            for rule in &config.rules {
                debug!(
                    app = %payload.app,
                    drop = rule.drop.as_ref().map(Regex::as_str).unwrap_or_default(),
                    keep = rule.keep.as_ref().map(Regex::as_str).unwrap_or_default(),
                    "pruning profile",
                );

                merged.prune(rule.drop.as_ref(), rule.keep.as_ref());
            }
        }

        let encoded = merged
            .encode()
            .context("failed to encode merged profile")?;

        let mut writer = self
            .blobs
            .open_writer(&base_key)
            .await
            .context("failed to open writer")?;

        writer
            .write_all(&encoded)
            .await
            .context("failed to write merged profile")?;

        writer
            .close()
            .await
            .context("failed to write merged profile")?;

        self.metrics.profiles_merged.inc();

        let result = self
            .events
            .write(&MergedEvent {
                app: payload.app,
                profile_key: payload.profile_key,
                merged_key: base_key,
            })
            .await;

        if result.is_ok() {
            self.metrics.events_published.inc();
        }

        result
    }

    async fn handle_merged(&self, envelope: &Envelope) -> Result<()> {
        let payload: MergedEvent = unmarshal(envelope).context("invalid payload")?;

        match self.blobs.delete(&payload.profile_key).await {
            // A duplicate merged event observes the staged object already
            // gone.
            Ok(()) | Err(BlobError::NotExist) => Ok(()),
            Err(e) => Err(anyhow!(e)
                .context(format!("failed to delete profile at {}", payload.profile_key))),
        }
    }
}

#[async_trait]
impl EventHandler for Worker {
    async fn handle(&self, envelope: &Envelope) -> Result<()> {
        let result = match envelope.event_type.as_str() {
            EVENT_TYPE_UPLOADED => self.handle_uploaded(envelope).await,
            EVENT_TYPE_MERGED => self.handle_merged(envelope).await,
            _ => Ok(()),
        };

        if result.is_err() {
            self.metrics.handler_errors.inc();
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use crate::blob::MemoryBucket;
    use crate::event::{wrap, MemorySubscription, MemoryTopic, Message, Payload, Subscription};
    use crate::pprof::ProfileBuilder;

    use super::*;

    struct Fixture {
        bucket: Arc<MemoryBucket>,
        subscription: MemorySubscription,
        worker: Worker,
    }

    fn fixture(pruning: Vec<PruneConfig>) -> Fixture {
        let bucket = Arc::new(MemoryBucket::new("worker-test"));
        let topic = Arc::new(MemoryTopic::new("worker-test"));
        let subscription = MemorySubscription::new(Arc::clone(&topic));
        let writer = Arc::new(Writer::new(topic as _));
        let metrics = Arc::new(Metrics::new().expect("metrics"));

        let worker = Worker::new(Arc::clone(&bucket) as _, writer, pruning, metrics);

        Fixture {
            bucket,
            subscription,
            worker,
        }
    }

    async fn put(bucket: &MemoryBucket, key: &str, data: &[u8]) {
        let mut writer = bucket.open_writer(key).await.expect("writer");
        writer.write_all(data).await.expect("write");
        writer.close().await.expect("close");
    }

    async fn read(bucket: &MemoryBucket, key: &str) -> Vec<u8> {
        let mut reader = bucket.open_reader(key).await.expect("reader");
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await.expect("read");
        data
    }

    fn envelope<P: Payload>(payload: &P) -> Envelope {
        wrap(payload).expect("wrap")
    }

    fn cpu_profile(stack: &[&str], value: i64) -> Vec<u8> {
        ProfileBuilder::new()
            .sample_type("samples", "count")
            .sample(stack, &[value])
            .build()
            .encode()
            .expect("encode")
    }

    #[tokio::test]
    async fn test_uploaded_without_base_creates_base() {
        let f = fixture(Vec::new());
        put(&f.bucket, "svc1/staging/1", &cpu_profile(&["main.work", "main.main"], 100)).await;

        f.worker
            .handle(&envelope(&UploadedEvent {
                app: "svc1".to_string(),
                profile_key: "svc1/staging/1".to_string(),
            }))
            .await
            .expect("handle");

        let base = Profile::parse(&read(&f.bucket, "svc1/default.pgo").await).expect("parse");
        assert_eq!(base.value_for("main.work", 0), 100);

        // A merged event for the staged key is published.
        let message = f.subscription.receive().await.expect("receive");
        let envelope: Envelope = serde_json::from_slice(message.body()).expect("envelope");
        assert_eq!(envelope.event_type, EVENT_TYPE_MERGED);

        let merged: MergedEvent = unmarshal(&envelope).expect("payload");
        assert_eq!(merged.profile_key, "svc1/staging/1");
        assert_eq!(merged.merged_key, "svc1/default.pgo");
        message.ack().await.expect("ack");
    }

    #[tokio::test]
    async fn test_uploaded_with_base_accumulates() {
        let f = fixture(Vec::new());
        put(&f.bucket, "svc1/default.pgo", &cpu_profile(&["main.work", "main.main"], 100)).await;
        put(&f.bucket, "svc1/staging/2", &cpu_profile(&["main.work", "main.main"], 50)).await;

        f.worker
            .handle(&envelope(&UploadedEvent {
                app: "svc1".to_string(),
                profile_key: "svc1/staging/2".to_string(),
            }))
            .await
            .expect("handle");

        let base = Profile::parse(&read(&f.bucket, "svc1/default.pgo").await).expect("parse");
        assert_eq!(base.value_for("main.work", 0), 150);
    }

    #[tokio::test]
    async fn test_uploaded_missing_staged_is_acked() {
        let f = fixture(Vec::new());

        f.worker
            .handle(&envelope(&UploadedEvent {
                app: "svc1".to_string(),
                profile_key: "svc1/staging/404".to_string(),
            }))
            .await
            .expect("missing staged object is not an error");

        assert!(!f.bucket.exists("svc1/default.pgo").await.expect("exists"));
    }

    #[tokio::test]
    async fn test_uploaded_applies_prune_rules() {
        let pruning = load_prune_config_from_str(
            r#"[{"app": "svc1", "rules": [{"drop": "^github\\.com/aws/.*", "keep": ""}]}]"#,
        );

        let f = fixture(pruning);
        put(
            &f.bucket,
            "svc1/staging/3",
            &cpu_profile(
                &["github.com/aws/aws-sdk-go.request", "main.fetch", "main.main"],
                7,
            ),
        )
        .await;

        f.worker
            .handle(&envelope(&UploadedEvent {
                app: "svc1".to_string(),
                profile_key: "svc1/staging/3".to_string(),
            }))
            .await
            .expect("handle");

        let base = Profile::parse(&read(&f.bucket, "svc1/default.pgo").await).expect("parse");
        let names = base.sampled_function_names();
        assert!(!names.contains("github.com/aws/aws-sdk-go.request"));
        assert!(names.contains("main.fetch"));
    }

    #[tokio::test]
    async fn test_prune_rules_for_other_apps_ignored() {
        let pruning = load_prune_config_from_str(
            r#"[{"app": "other", "rules": [{"drop": ".*", "keep": ""}]}]"#,
        );

        let f = fixture(pruning);
        put(&f.bucket, "svc1/staging/4", &cpu_profile(&["main.work", "main.main"], 1)).await;

        f.worker
            .handle(&envelope(&UploadedEvent {
                app: "svc1".to_string(),
                profile_key: "svc1/staging/4".to_string(),
            }))
            .await
            .expect("handle");

        let base = Profile::parse(&read(&f.bucket, "svc1/default.pgo").await).expect("parse");
        assert!(base.sampled_function_names().contains("main.work"));
    }

    #[tokio::test]
    async fn test_merged_deletes_staged_object() {
        let f = fixture(Vec::new());
        put(&f.bucket, "svc1/staging/5", b"staged").await;

        let payload = MergedEvent {
            app: "svc1".to_string(),
            profile_key: "svc1/staging/5".to_string(),
            merged_key: "svc1/default.pgo".to_string(),
        };

        f.worker.handle(&envelope(&payload)).await.expect("handle");
        assert!(!f.bucket.exists("svc1/staging/5").await.expect("exists"));

        // A duplicate delivery observes the object already gone.
        f.worker
            .handle(&envelope(&payload))
            .await
            .expect("duplicate delete is idempotent");
    }

    #[tokio::test]
    async fn test_unknown_event_type_is_ignored() {
        let f = fixture(Vec::new());

        let mut unknown = envelope(&MergedEvent {
            app: "svc1".to_string(),
            profile_key: "svc1/staging/6".to_string(),
            merged_key: "svc1/default.pgo".to_string(),
        });
        unknown.event_type = "profile.unknown".to_string();

        f.worker.handle(&unknown).await.expect("ignored");
    }

    #[tokio::test]
    async fn test_corrupt_staged_profile_fails_handling() {
        let f = fixture(Vec::new());
        put(&f.bucket, "svc1/staging/7", b"not a profile").await;

        let err = f
            .worker
            .handle(&envelope(&UploadedEvent {
                app: "svc1".to_string(),
                profile_key: "svc1/staging/7".to_string(),
            }))
            .await
            .expect_err("corrupt profile should fail");

        assert!(err.to_string().contains("failed to parse profile"));
    }

    fn load_prune_config_from_str(json: &str) -> Vec<PruneConfig> {
        serde_json::from_str(json).expect("prune config should decode")
    }

    #[test]
    fn test_load_prune_config_missing_file() {
        assert!(load_prune_config(None).expect("no path").is_empty());
        assert!(load_prune_config(Some(Path::new("/does/not/exist.json")))
            .expect("missing file")
            .is_empty());
    }

    #[test]
    fn test_load_prune_config_rejects_invalid_regex() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        std::io::Write::write_all(
            &mut file,
            br#"[{"app": "svc1", "rules": [{"drop": "([unclosed", "keep": ""}]}]"#,
        )
        .expect("write");

        assert!(load_prune_config(Some(file.path())).is_err());
    }

    #[test]
    fn test_load_prune_config_rejects_empty_rule() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        std::io::Write::write_all(
            &mut file,
            br#"[{"app": "svc1", "rules": [{"drop": "", "keep": ""}]}]"#,
        )
        .expect("write");

        assert!(load_prune_config(Some(file.path())).is_err());
    }
}
