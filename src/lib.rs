//! Automated collection, merging and distribution of pprof CPU profiles for
//! profile-guided optimization.
//!
//! The crate builds a single binary with three long-running components: the
//! scraper samples profiles from a fleet of targets and forwards them to the
//! server, the server stages uploads in blob storage and announces them on an
//! event bus, and the worker merges staged profiles into a per-application
//! base profile that builds can download.

pub mod api;
pub mod blob;
pub mod client;
pub mod cmd;
pub mod event;
pub mod metrics;
pub mod operation;
pub mod pprof;
pub mod profile;
pub mod server;
pub mod target;
