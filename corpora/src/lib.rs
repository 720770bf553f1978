//! Event-sourced metadata corpus.
//!
//! A corpus is in-memory state deterministically derived from an
//! append-only log of [`mutation::Mutation`]s. Leaders own the durable
//! log, sync upstream systems through [`sync::Engine`], and serve the
//! log to followers; followers rebuild the same state by tailing a
//! leader with [`tail::TailSource`].
#![allow(clippy::collapsible_if)]
#![allow(clippy::collapsible_else_if)]

pub mod cancel;
pub mod corpus;
pub mod git;
pub mod intern;
pub mod issues;
pub mod log;
pub mod mutation;
pub mod reviews;
pub mod singleflight;
pub mod source;
pub mod sync;
pub mod tail;
pub mod wire;

pub use corpus::{Corpus, CorpusRead, LogEntry};
pub use mutation::{Mutation, ProjectId};
pub use source::{MutationSource, StreamEvent};
