//! Entry points for the CLI subcommands. Each component command wires its
//! providers together, runs its tasks concurrently and propagates shutdown
//! through the root cancellation token.

pub mod clean;
pub mod delete;
pub mod download;
pub mod list;
pub mod scrape;
pub mod server;
pub mod target;
pub mod upload;
pub mod worker;
