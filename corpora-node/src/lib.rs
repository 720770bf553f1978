//! The corpus daemon.
//!
//! In leader mode it opens the durable mutation log, replays it into a
//! [`corpora::Corpus`], runs the sync engine against the configured
//! upstreams, and serves `/logs` to followers. In follower mode it
//! tails a leader instead of syncing.

pub mod config;
pub mod logger;
pub mod runtime;
pub mod serve;
pub mod signals;
pub mod spool;

pub use config::Config;
pub use runtime::Runtime;

/// Program version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
