//! Periodic bounded-concurrency sampling of discovered targets.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use reqwest::Url;
use serde::Deserialize;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::metrics::Metrics;
use crate::target::{Target, TargetSource};

use super::is_valid_app_name;

/// The profile endpoint used when a target does not specify one.
pub const DEFAULT_PROFILE_PATH: &str = "/debug/pprof/profile";

/// Configuration for the scraper.
#[derive(Debug, Clone, Deserialize)]
pub struct ScrapeConfig {
    /// How many targets to profile per tick.
    pub sample_size: usize,
    /// How long each target is asked to profile for.
    #[serde(with = "humantime_serde")]
    pub profile_duration: Duration,
    /// The period between ticks.
    #[serde(with = "humantime_serde")]
    pub scrape_frequency: Duration,
    /// The application this scraper instance collects profiles for.
    pub app: String,
}

impl ScrapeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sample_size == 0 {
            bail!("sample size must be greater than 0");
        }

        if self.scrape_frequency.is_zero() {
            bail!("scrape frequency must be greater than 0");
        }

        if self.profile_duration.is_zero() {
            bail!("profile duration must be greater than 0");
        }

        if !is_valid_app_name(&self.app) {
            bail!("application name is invalid");
        }

        Ok(())
    }
}

/// The slice of the server client the scraper needs.
#[async_trait]
pub trait ScrapeClient: Send + Sync {
    /// Obtain a profile from the source URL for the given duration and
    /// upload it to the server under the application name.
    async fn profile_and_upload(&self, app: &str, source: &str, duration: Duration)
        -> Result<()>;
}

/// Periodically samples a subset of discovered targets and forwards their
/// profiles to the server.
///
/// Ticks are serial: a tick only completes once every in-flight scrape it
/// started has finished, and a tick that overruns the scrape frequency makes
/// the next one fire immediately on return without bursting. Cancellation
/// surfaces as an error from [`Scraper::run`] once in-flight work unwinds.
pub struct Scraper {
    config: ScrapeConfig,
    client: Arc<dyn ScrapeClient>,
    source: Arc<dyn TargetSource>,
    metrics: Arc<Metrics>,
    rng: Mutex<ChaCha8Rng>,
}

impl Scraper {
    pub fn new(
        client: Arc<dyn ScrapeClient>,
        source: Arc<dyn TargetSource>,
        config: ScrapeConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            client,
            source,
            metrics,
            rng: Mutex::new(ChaCha8Rng::from_entropy()),
        }
    }

    /// Scrape discovered targets until cancelled. In-flight scrapes finish
    /// first, then the cancellation is returned as an error.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.config.scrape_frequency);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // The first interval tick completes immediately; the scraper waits a
        // full period before its first sample.
        ticker.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => bail!("scrape cancelled"),
                _ = ticker.tick() => {}
            }

            let targets = match self.source.list().await {
                Ok(targets) => targets,
                Err(e) => {
                    error!(error = %e, "failed to list targets");
                    continue;
                }
            };

            self.metrics.targets_discovered.set(targets.len() as f64);

            let sampled = {
                let mut rng = self.rng.lock();
                sample_targets(&targets, self.config.sample_size, &mut *rng)
            };

            let mut tasks = JoinSet::new();
            for target in sampled {
                if cancel.is_cancelled() {
                    break;
                }

                let client = Arc::clone(&self.client);
                let metrics = Arc::clone(&self.metrics);
                let app = self.config.app.clone();
                let duration = self.config.profile_duration;

                tasks.spawn(async move {
                    forward_profile(client, metrics, &app, target, duration).await;
                });
            }

            while tasks.join_next().await.is_some() {}

            if cancel.is_cancelled() {
                bail!("scrape cancelled");
            }
        }
    }
}

/// Draw a uniform random subset of at most `sample_size` targets by
/// shuffling a clone of the list.
fn sample_targets(targets: &[Target], sample_size: usize, rng: &mut impl Rng) -> Vec<Target> {
    let mut pool = targets.to_vec();
    pool.shuffle(rng);
    pool.truncate(sample_size.min(targets.len()));
    pool
}

/// Scrape one target and forward the profile. Failures are logged and
/// isolated from other scrapes.
async fn forward_profile(
    client: Arc<dyn ScrapeClient>,
    metrics: Arc<Metrics>,
    app: &str,
    target: Target,
    duration: Duration,
) {
    let mut url = match Url::parse(&target.address) {
        Ok(url) => url,
        Err(e) => {
            metrics.scrape_errors.inc();
            error!(
                address = %target.address,
                error = %e,
                "failed to parse target address",
            );
            return;
        }
    };

    url.set_path(if target.path.is_empty() {
        DEFAULT_PROFILE_PATH
    } else {
        &target.path
    });

    debug!(address = %target.address, app = %app, "profiling target");

    if let Err(e) = client.profile_and_upload(app, url.as_str(), duration).await {
        metrics.scrape_errors.inc();
        error!(
            address = %target.address,
            app = %app,
            error = %e,
            "failed to profile target",
        );
        return;
    }

    metrics.profiles_scraped.inc();
    debug!(address = %target.address, app = %app, "uploaded profile");
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn config() -> ScrapeConfig {
        ScrapeConfig {
            sample_size: 2,
            profile_duration: Duration::from_secs(1),
            scrape_frequency: Duration::from_millis(10),
            app: "svc1".to_string(),
        }
    }

    fn targets(n: usize) -> Vec<Target> {
        (0..n)
            .map(|i| Target {
                address: format!("http://10.0.0.{i}:8080"),
                path: String::new(),
            })
            .collect()
    }

    #[test]
    fn test_config_validation() {
        assert!(config().validate().is_ok());

        let mut invalid = config();
        invalid.sample_size = 0;
        assert!(invalid.validate().is_err());

        let mut invalid = config();
        invalid.scrape_frequency = Duration::ZERO;
        assert!(invalid.validate().is_err());

        let mut invalid = config();
        invalid.profile_duration = Duration::ZERO;
        assert!(invalid.validate().is_err());

        let mut invalid = config();
        invalid.app = "Not Valid".to_string();
        assert!(invalid.validate().is_err());
    }

    #[test]
    fn test_config_decodes_humantime_durations() {
        let config: ScrapeConfig = serde_json::from_str(
            r#"{
                "sample_size": 2,
                "profile_duration": "30s",
                "scrape_frequency": "1m",
                "app": "svc1"
            }"#,
        )
        .expect("config should decode");

        assert_eq!(config.profile_duration, Duration::from_secs(30));
        assert_eq!(config.scrape_frequency, Duration::from_secs(60));
    }

    #[test]
    fn test_sample_is_bounded_subset() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let all = targets(5);

        for _ in 0..100 {
            let sampled = sample_targets(&all, 2, &mut rng);
            assert_eq!(sampled.len(), 2);
            assert_ne!(sampled[0], sampled[1]);
            for target in &sampled {
                assert!(all.contains(target));
            }
        }
    }

    #[test]
    fn test_sample_larger_than_pool_takes_everything_once() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let all = targets(3);

        let mut sampled = sample_targets(&all, 10, &mut rng);
        sampled.sort_by(|a, b| a.address.cmp(&b.address));
        assert_eq!(sampled, all);
    }

    #[test]
    fn test_sample_zero_takes_nothing() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        assert!(sample_targets(&targets(3), 0, &mut rng).is_empty());
    }

    #[test]
    fn test_sampling_is_roughly_uniform() {
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let all = targets(5);
        let mut counts: HashMap<String, usize> = HashMap::new();

        let ticks = 1000;
        for _ in 0..ticks {
            for target in sample_targets(&all, 2, &mut rng) {
                *counts.entry(target.address).or_default() += 1;
            }
        }

        // Each target is expected in 2/5 of ticks.
        for count in counts.values() {
            let frequency = *count as f64 / ticks as f64;
            assert!(
                (frequency - 0.4).abs() < 0.05,
                "expected frequency near 0.4, got {frequency}",
            );
        }
    }

    struct RecordingClient {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ScrapeClient for RecordingClient {
        async fn profile_and_upload(
            &self,
            app: &str,
            source: &str,
            _duration: Duration,
        ) -> Result<()> {
            assert_eq!(app, "svc1");
            assert!(source.ends_with(DEFAULT_PROFILE_PATH));
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct StaticSource(Vec<Target>);

    #[async_trait]
    impl crate::operation::Checker for StaticSource {
        fn name(&self) -> String {
            "static".to_string()
        }

        async fn check(&self) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl TargetSource for StaticSource {
        async fn list(&self) -> Result<Vec<Target>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_run_scrapes_until_cancelled() {
        let client = Arc::new(RecordingClient {
            calls: AtomicUsize::new(0),
        });
        let source = Arc::new(StaticSource(targets(5)));
        let metrics = Arc::new(Metrics::new().expect("metrics"));

        let scraper = Scraper::new(
            Arc::clone(&client) as _,
            source as _,
            config(),
            metrics,
        );

        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            stop.cancel();
        });

        let err = scraper
            .run(&cancel)
            .await
            .expect_err("cancellation should surface as an error");
        assert!(err.to_string().contains("cancelled"));

        let calls = client.calls.load(Ordering::SeqCst);
        assert!(calls >= 2, "expected at least one full tick, got {calls}");
    }
}
