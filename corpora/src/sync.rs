//! The sync engine: keeps the corpus current against its upstreams.
//!
//! One worker thread per watched source. Each worker polls its
//! [`Upstream`] in a loop, feeds the resulting mutations through
//! [`Corpus::add_mutation`], and sleeps for the source's interval.
//! Transient poll failures back off exponentially with jitter and
//! never touch the other workers. A corpus error is different: it
//! means the writer path is broken, and the whole engine reports fatal
//! and stops.

use std::collections::HashMap;
use std::error;
use std::thread;
use std::time::Duration;

use crossbeam_channel as chan;
use serde::{Deserialize, Serialize};

use crate::cancel;
use crate::corpus;
use crate::corpus::Corpus;
use crate::mutation::{Mutation, ProjectId};

/// Minimum backoff after the first transient failure.
pub const BACKOFF_BASE: Duration = Duration::from_secs(1);
/// Backoff ceiling.
pub const BACKOFF_MAX: Duration = Duration::from_secs(5 * 60);

/// The kind of system a watched source talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    IssueTracker,
    ReviewSystem,
    Vcs,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IssueTracker => write!(f, "issue-tracker"),
            Self::ReviewSystem => write!(f, "review-system"),
            Self::Vcs => write!(f, "vcs"),
        }
    }
}

/// Descriptor of one upstream the corpus watches. Part of the node
/// configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WatchedSource {
    pub kind: SourceKind,
    pub project: ProjectId,
    /// Seconds between successful polls.
    pub interval_secs: u64,
}

impl WatchedSource {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Stable worker name, eg. `issue-tracker/example/tooling`.
    pub fn label(&self) -> String {
        format!("{}/{}", self.kind, self.project)
    }
}

/// A poll failure.
#[derive(thiserror::Error, Debug)]
pub enum PollError {
    /// Retried with backoff; the worker keeps running.
    #[error("transient: {0}")]
    Transient(#[source] Box<dyn error::Error + Send + Sync>),
    /// The worker gives up on this source. Other sources are
    /// unaffected.
    #[error("fatal: {0}")]
    Fatal(#[source] Box<dyn error::Error + Send + Sync>),
}

impl PollError {
    pub fn transient<E: error::Error + Send + Sync + 'static>(e: E) -> Self {
        Self::Transient(Box::new(e))
    }

    pub fn fatal<E: error::Error + Send + Sync + 'static>(e: E) -> Self {
        Self::Fatal(Box::new(e))
    }
}

/// Talks to one upstream system. A poll reads the corpus to find where
/// it left off, fetches what is new upstream, and returns it as
/// mutations; the engine owns applying them.
pub trait Upstream: Send {
    fn poll(&mut self, corpus: &Corpus) -> Result<Vec<Mutation>, PollError>;
}

/// What the engine reports to its supervisor.
#[derive(Debug)]
pub enum Event {
    /// One source completed a poll; `count` mutations were applied.
    Synced { source: String, count: usize },
    /// One source failed fatally and its worker stopped. The rest of
    /// the engine keeps running.
    SourceFailed { source: String, error: PollError },
    /// The corpus writer path failed. The whole process must stop.
    Fatal(corpus::Error),
}

/// Runs the sync workers. Dropping the handle does not stop them; use
/// the cancellation token given to [`Engine::run`].
pub struct Engine {
    handles: HashMap<String, thread::JoinHandle<()>>,
    events: chan::Receiver<Event>,
}

impl Engine {
    /// Spawn one worker per `(source, upstream)` pair. The worker set
    /// is fixed for the engine's lifetime.
    pub fn run(
        corpus: &std::sync::Arc<Corpus>,
        upstreams: Vec<(WatchedSource, Box<dyn Upstream>)>,
        ctx: &cancel::Token,
    ) -> Self {
        let (tx, events) = chan::unbounded();
        let mut handles = HashMap::new();

        for (source, upstream) in upstreams {
            let label = source.label();
            let corpus = corpus.clone();
            let ctx = ctx.clone();
            let tx = tx.clone();

            let handle = thread::Builder::new()
                .name(label.clone())
                .spawn(move || worker(&corpus, source, upstream, &ctx, &tx))
                .expect("sync: worker thread name is valid");

            handles.insert(label, handle);
        }
        Self { handles, events }
    }

    /// The engine's event stream. Closes when every worker has
    /// stopped.
    pub fn events(&self) -> &chan::Receiver<Event> {
        &self.events
    }

    /// Wait for all workers to stop. Call after cancelling the token
    /// passed to [`Engine::run`].
    pub fn join(self) {
        for (label, handle) in self.handles {
            if handle.join().is_err() {
                ::log::error!(target: "sync", "Worker '{label}' panicked");
            }
        }
    }
}

fn worker(
    corpus: &Corpus,
    source: WatchedSource,
    mut upstream: Box<dyn Upstream>,
    ctx: &cancel::Token,
    events: &chan::Sender<Event>,
) {
    let label = source.label();
    let mut failures = 0u32;

    ::log::info!(target: "sync", "Watching '{label}' every {}s", source.interval_secs);

    loop {
        match upstream.poll(corpus) {
            Ok(mutations) => {
                failures = 0;
                let count = mutations.len();

                for mutation in &mutations {
                    if let Err(e) = corpus.add_mutation(mutation) {
                        ::log::error!(target: "sync", "Corpus write failed: {e}");
                        events.send(Event::Fatal(e)).ok();

                        return;
                    }
                }
                if count > 0 {
                    ::log::debug!(target: "sync", "Synced {count} mutation(s) from '{label}'");
                }
                events
                    .send(Event::Synced {
                        source: label.clone(),
                        count,
                    })
                    .ok();

                if ctx.sleep(source.interval()).is_err() {
                    break;
                }
            }
            Err(e @ PollError::Transient(_)) => {
                failures += 1;
                let delay = backoff(failures);
                ::log::warn!(
                    target: "sync",
                    "Poll of '{label}' failed ({e}); retrying in {}s",
                    delay.as_secs()
                );
                if ctx.sleep(delay).is_err() {
                    break;
                }
            }
            Err(e @ PollError::Fatal(_)) => {
                ::log::error!(target: "sync", "Source '{label}' failed: {e}");
                events
                    .send(Event::SourceFailed {
                        source: label.clone(),
                        error: e,
                    })
                    .ok();

                return;
            }
        }
    }
    ::log::debug!(target: "sync", "Worker '{label}' stopped");
}

/// Exponential backoff with full jitter, capped at [`BACKOFF_MAX`].
fn backoff(failures: u32) -> Duration {
    let exp = BACKOFF_BASE.saturating_mul(1u32 << failures.min(16).saturating_sub(1));
    let cap = exp.min(BACKOFF_MAX);

    cap.mul_f64(0.5 + fastrand::f64() / 2.)
}
