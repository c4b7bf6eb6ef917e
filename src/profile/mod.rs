//! Core domain types for the profile lifecycle: application names, bucket
//! key conventions, event payloads and listing filters.

mod scraper;
mod server;
mod worker;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use scraper::{ScrapeClient, ScrapeConfig, Scraper, DEFAULT_PROFILE_PATH};
pub use server::ProfileController;
pub use worker::{load_prune_config, PruneConfig, PruneRule, Worker};

use crate::blob::Filter;
use crate::event::Payload;

/// Event type emitted by the server once an uploaded profile is durably
/// staged.
pub const EVENT_TYPE_UPLOADED: &str = "profile.uploaded";

/// Event type emitted by the worker once a staged profile has been merged
/// into the base profile.
pub const EVENT_TYPE_MERGED: &str = "profile.merged";

/// File name of the merged base profile within an application's prefix.
pub const MERGED_PROFILE_NAME: &str = "default.pgo";

/// Returns the bucket key of the base profile for an application.
pub fn base_profile_key(app: &str) -> String {
    format!("{app}/{MERGED_PROFILE_NAME}")
}

/// Describes a single profile that has been uploaded and staged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedEvent {
    /// The application the profile relates to.
    pub app: String,
    /// The location of the staged profile within blob storage.
    #[serde(rename = "profileKey")]
    pub profile_key: String,
}

impl Payload for UploadedEvent {
    fn event_type(&self) -> &'static str {
        EVENT_TYPE_UPLOADED
    }

    fn key(&self) -> String {
        self.app.clone()
    }
}

/// Describes a profile that has been merged into the base profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedEvent {
    /// The application the profile relates to.
    pub app: String,
    /// The location of the staged profile within blob storage.
    #[serde(rename = "profileKey")]
    pub profile_key: String,
    /// The location of the base profile that has been written.
    #[serde(rename = "mergedKey")]
    pub merged_key: String,
}

impl Payload for MergedEvent {
    fn event_type(&self) -> &'static str {
        EVENT_TYPE_MERGED
    }

    fn key(&self) -> String {
        self.app.clone()
    }
}

/// Returns false if the application name contains any characters that are
/// not a-z, 0-9 or hyphens.
pub fn is_valid_app_name(app: &str) -> bool {
    app.bytes()
        .all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'-'))
}

/// A filter matching the keys of merged base profiles.
pub fn is_merged_profile() -> Filter {
    Filter::new(|object| object.key.ends_with(MERGED_PROFILE_NAME))
}

/// A filter matching any object key under the given application's prefix.
pub fn is_application(app: &str) -> Filter {
    let prefix = format!("{app}/");
    Filter::new(move |object| object.key.starts_with(&prefix))
}

/// A filter matching objects whose last modification is older than the
/// given duration, relative to the time this function is called. A zero
/// duration matches nothing.
pub fn is_older_than(duration: Duration) -> Filter {
    let now = Utc::now();

    Filter::new(move |object| {
        if duration.is_zero() {
            return false;
        }

        match chrono::Duration::from_std(duration) {
            Ok(age) => object.last_modified + age < now,
            Err(_) => false,
        }
    })
}

/// A filter matching objects larger than the given size in bytes. A zero
/// size matches nothing.
pub fn is_larger_than(size: u64) -> Filter {
    Filter::new(move |object| {
        if size == 0 {
            return false;
        }

        object.size > size
    })
}

/// A profile as reported by the server's list endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredProfile {
    /// The application name the profile belongs to.
    pub key: String,
    /// The profile size in bytes.
    pub size: u64,
    /// When the profile was last modified.
    #[serde(rename = "lastModified")]
    pub last_modified: DateTime<Utc>,
}

/// The response given when a profile has been uploaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    /// The location in blob storage the profile is staged at.
    pub key: String,
}

/// The response given when listing profiles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResponse {
    pub profiles: Vec<StoredProfile>,
}

#[cfg(test)]
mod tests {
    use crate::blob::Object;

    use super::*;

    fn object(key: &str, size: u64, age: Duration) -> Object {
        Object {
            key: key.to_string(),
            size,
            last_modified: Utc::now()
                - chrono::Duration::from_std(age).expect("age should convert"),
        }
    }

    #[test]
    fn test_is_valid_app_name() {
        assert!(is_valid_app_name("svc1"));
        assert!(is_valid_app_name("my-app-2"));
        assert!(is_valid_app_name(""));

        assert!(!is_valid_app_name("My-App"));
        assert!(!is_valid_app_name("svc_1"));
        assert!(!is_valid_app_name("svc.1"));
        assert!(!is_valid_app_name("svc/1"));
        assert!(!is_valid_app_name("svc 1"));
        assert!(!is_valid_app_name("svc\u{e9}"));
    }

    #[test]
    fn test_is_merged_profile() {
        let filter = is_merged_profile();
        assert!(filter.matches(&object("svc1/default.pgo", 1, Duration::ZERO)));
        assert!(!filter.matches(&object("svc1/staging/123", 1, Duration::ZERO)));
    }

    #[test]
    fn test_is_application() {
        let filter = is_application("svc1");
        assert!(filter.matches(&object("svc1/default.pgo", 1, Duration::ZERO)));
        assert!(filter.matches(&object("svc1/staging/123", 1, Duration::ZERO)));
        assert!(!filter.matches(&object("svc10/default.pgo", 1, Duration::ZERO)));
        assert!(!filter.matches(&object("svc2/default.pgo", 1, Duration::ZERO)));
    }

    #[test]
    fn test_is_older_than() {
        let filter = is_older_than(Duration::from_secs(3600));
        assert!(filter.matches(&object("a", 1, Duration::from_secs(7200))));
        assert!(!filter.matches(&object("a", 1, Duration::from_secs(60))));
    }

    #[test]
    fn test_zero_valued_filters_match_nothing() {
        let old = object("a", 10, Duration::from_secs(86400));
        assert!(!is_older_than(Duration::ZERO).matches(&old));
        assert!(!is_larger_than(0).matches(&old));
    }

    #[test]
    fn test_is_larger_than() {
        let filter = is_larger_than(100);
        assert!(filter.matches(&object("a", 101, Duration::ZERO)));
        assert!(!filter.matches(&object("a", 100, Duration::ZERO)));
    }

    #[test]
    fn test_event_payload_wire_format() {
        let payload = MergedEvent {
            app: "svc1".to_string(),
            profile_key: "svc1/staging/123".to_string(),
            merged_key: "svc1/default.pgo".to_string(),
        };

        let encoded = serde_json::to_value(&payload).expect("encode");
        assert_eq!(encoded["app"], "svc1");
        assert_eq!(encoded["profileKey"], "svc1/staging/123");
        assert_eq!(encoded["mergedKey"], "svc1/default.pgo");

        assert_eq!(payload.event_type(), EVENT_TYPE_MERGED);
        assert_eq!(payload.key(), "svc1");
    }
}
