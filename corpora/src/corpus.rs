//! The corpus: in-memory aggregate state built by replaying the
//! mutation log.
//!
//! There are two phases. During catch-up, [`Corpus::initialize`]
//! replays a [`MutationSource`] under the exclusive lock until the
//! source reports `End`. After that, the corpus is live: sync tasks
//! (or a tail stream, on a follower) feed new mutations through
//! [`Corpus::add_mutation`], and any number of readers take snapshots
//! through [`Corpus::read`].
//!
//! There is exactly one logical writer path. `add_mutation` serializes
//! on the exclusive lock, applies (CPU only), appends to the durable
//! log, and publishes the entry to live tail subscribers, in that
//! order, still under the lock, so the log order and the apply order
//! are the same total order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};

use crossbeam_channel as chan;

use crate::cancel;
use crate::git::GitStore;
use crate::intern::Intern;
use crate::issues::IssueStore;
use crate::log;
use crate::log::DiskLog;
use crate::mutation::Mutation;
use crate::reviews::ReviewStore;
use crate::source::{MutationSource, SourceError, StreamEvent};
use crate::sync::WatchedSource;

/// A structurally invalid mutation. Fatal during replay and on the
/// writer path: a log we cannot fully apply is a log we cannot trust.
#[derive(thiserror::Error, Debug)]
pub enum ApplyError {
    #[error("mutation names no project")]
    MissingProject,
    #[error("mutation names no issue or change number")]
    MissingNumber,
    #[error("git mutation carries neither commit nor refs")]
    EmptyDelta,
    #[error("ref update with an empty name")]
    EmptyRefName,
}

/// A corpus failure.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Fatal: the mutation cannot be applied.
    #[error("malformed mutation: {0}")]
    Apply(#[from] ApplyError),
    /// Fatal: the mutation could not be durably logged.
    #[error("mutation log: {0}")]
    Log(#[from] log::Error),
    /// The mutation stream failed during initialization.
    #[error("mutation stream: {0}")]
    Stream(#[from] SourceError),
    #[error(transparent)]
    Cancelled(#[from] cancel::Cancelled),
    #[error("corpus is already initialized")]
    AlreadyInitialized,
}

/// One log entry as published to live tail subscribers.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub offset: u64,
    pub mutation: Mutation,
}

/// Publishes applied entries to tail subscribers.
///
/// Emission happens under the corpus's exclusive lock, so subscribers
/// observe entries in log order. Sends never block (the channels are
/// unbounded); subscribers that went away are dropped.
#[derive(Clone, Default)]
struct Emitter {
    subscribers: Arc<Mutex<Vec<chan::Sender<LogEntry>>>>,
}

impl Emitter {
    fn emit(&self, entry: LogEntry) {
        self.subscribers
            .lock()
            .unwrap()
            .retain(|s| s.try_send(entry.clone()).is_ok());
    }

    fn subscribe(&self) -> chan::Receiver<LogEntry> {
        let (sender, receiver) = chan::unbounded();
        self.subscribers.lock().unwrap().push(sender);

        receiver
    }
}

/// Everything behind the reader/writer lock.
struct State {
    issues: IssueStore,
    reviews: ReviewStore,
    git: GitStore,
    intern: Intern,
    watched: Vec<WatchedSource>,
    /// The durable log, if this instance is a leader. Followers hold
    /// no log: their durability is the leader's.
    log: Option<DiskLog>,
    /// Number of mutations applied; equals the log head on a leader.
    applied: u64,
}

impl State {
    fn apply(&mut self, mutation: &Mutation) -> Result<(), ApplyError> {
        match mutation {
            Mutation::Issue(delta) => self.issues.apply(delta, &mut self.intern),
            Mutation::Review(delta) => self.reviews.apply(delta, &mut self.intern),
            Mutation::Git(delta) => self.git.apply(delta, &mut self.intern),
        }
    }
}

/// A read snapshot: holds the shared lock for as long as it lives.
/// Hold one guard across any multi-call sequence that must be
/// snapshot-consistent; drop it promptly, since the single writer
/// waits on it.
pub struct CorpusRead<'a> {
    state: RwLockReadGuard<'a, State>,
}

impl CorpusRead<'_> {
    /// The issue-tracker view.
    pub fn issues(&self) -> &IssueStore {
        &self.state.issues
    }

    /// The review-system view.
    pub fn reviews(&self) -> &ReviewStore {
        &self.state.reviews
    }

    /// The commit graph and refs.
    pub fn git(&self) -> &GitStore {
        &self.state.git
    }

    /// The upstream sources this corpus watches.
    pub fn watched(&self) -> &[WatchedSource] {
        &self.state.watched
    }

    /// Number of mutations applied so far; the last-applied log offset
    /// is this minus one.
    pub fn applied(&self) -> u64 {
        self.state.applied
    }

    /// Number of distinct interned strings.
    pub fn interned(&self) -> usize {
        self.state.intern.len()
    }
}

/// The corpus. See the module documentation.
pub struct Corpus {
    state: RwLock<State>,
    emitter: Emitter,
    /// The live remainder of the initialization stream, if the source
    /// keeps producing after `End` (network tail).
    pending: Mutex<Option<chan::Receiver<StreamEvent>>>,
    initialized: AtomicBool,
}

impl Corpus {
    /// Create an empty corpus. Leaders pass their opened disk log;
    /// followers pass `None`.
    pub fn new(log: Option<DiskLog>) -> Self {
        Self {
            state: RwLock::new(State {
                issues: IssueStore::default(),
                reviews: ReviewStore::default(),
                git: GitStore::default(),
                intern: Intern::new(),
                watched: Vec::new(),
                log,
                applied: 0,
            }),
            emitter: Emitter::default(),
            pending: Mutex::new(None),
            initialized: AtomicBool::new(false),
        }
    }

    /// Register an upstream source to watch. Descriptors are static
    /// configuration: set them up before the sync engine starts.
    pub fn track(&self, source: WatchedSource) {
        self.state.write().unwrap().watched.push(source);
    }

    /// Populate the corpus from a mutation source, blocking until the
    /// source reports `End` (caught up), the stream fails, or `ctx` is
    /// cancelled. Must be called exactly once, before any read.
    ///
    /// Replayed mutations are applied but not re-logged: they either
    /// came from our own log or from a leader that owns durability.
    pub fn initialize(
        &self,
        ctx: &cancel::Token,
        source: &dyn MutationSource,
    ) -> Result<(), Error> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyInitialized);
        }
        let rx = source.mutations(ctx);
        let mut state = self.state.write().unwrap();

        loop {
            chan::select! {
                recv(rx) -> event => match event {
                    Ok(StreamEvent::Mutation(m)) => {
                        state.apply(&m)?;
                        state.applied += 1;
                    }
                    Ok(StreamEvent::End) => break,
                    Ok(StreamEvent::Err(e)) => return Err(Error::Stream(e)),
                    // Producer went away without `End`. A cancelled
                    // producer also closes its channel, and `select!`
                    // may pick this arm over `done`, so check before
                    // treating closure as caught-up.
                    Err(_) => {
                        if ctx.is_cancelled() {
                            return Err(Error::Cancelled(cancel::Cancelled));
                        }
                        break;
                    }
                },
                recv(ctx.done()) -> _ => return Err(Error::Cancelled(cancel::Cancelled)),
            }
        }
        ::log::debug!(target: "corpus", "Initialized with {} mutations", state.applied);
        drop(state);

        *self.pending.lock().unwrap() = Some(rx);

        Ok(())
    }

    /// Keep applying the live remainder of the initialization stream.
    /// Blocks until the stream ends or `ctx` is cancelled; used by
    /// followers whose source keeps producing after catch-up.
    pub fn follow(&self, ctx: &cancel::Token) -> Result<(), Error> {
        let rx = self
            .pending
            .lock()
            .unwrap()
            .take()
            .expect("Corpus::follow: initialize must have succeeded");

        loop {
            chan::select! {
                recv(rx) -> event => match event {
                    Ok(StreamEvent::Mutation(m)) => {
                        self.add_mutation(&m)?;
                    }
                    // Re-caught-up after a tail reconnect.
                    Ok(StreamEvent::End) => continue,
                    Ok(StreamEvent::Err(e)) => return Err(Error::Stream(e)),
                    Err(_) => return Ok(()),
                },
                recv(ctx.done()) -> _ => return Ok(()),
            }
        }
    }

    /// Apply one new mutation and durably log it: the single writer
    /// path. Returns the entry's log offset.
    ///
    /// Errors are fatal to the writer: an unappliable or unloggable
    /// mutation means in-memory state and the log can no longer be
    /// trusted to agree.
    pub fn add_mutation(&self, mutation: &Mutation) -> Result<u64, Error> {
        let mut state = self.state.write().unwrap();

        state.apply(mutation)?;
        let offset = match &mut state.log {
            Some(log) => log.append(mutation)?,
            None => state.applied,
        };
        state.applied += 1;

        // Publish under the lock so subscribers see log order.
        self.emitter.emit(LogEntry {
            offset,
            mutation: mutation.clone(),
        });
        drop(state);

        Ok(offset)
    }

    /// Take a read snapshot. The shared lock is held until the guard
    /// is dropped.
    pub fn read(&self) -> CorpusRead<'_> {
        CorpusRead {
            state: self.state.read().unwrap(),
        }
    }

    /// Subscribe to entries applied after this call. Used by the tail
    /// server: subscribe first, then catch up from the log file, then
    /// drain. Entries seen twice are deduplicated by offset.
    pub fn subscribe(&self) -> chan::Receiver<LogEntry> {
        self.emitter.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{DiskSource, LOG_FILE};
    use crate::mutation::{IssueDelta, Timestamp};

    fn issue_mutation(number: u32, title: &str) -> Mutation {
        Mutation::Issue(IssueDelta {
            project: Some("example/tooling".parse().unwrap()),
            number,
            updated: Some(Timestamp(number as i64)),
            title: Some(title.to_owned()),
            ..Default::default()
        })
    }

    /// An in-memory source over a fixed set of mutations.
    struct FixedSource(Vec<Mutation>);

    impl MutationSource for FixedSource {
        fn mutations(&self, _ctx: &cancel::Token) -> chan::Receiver<StreamEvent> {
            let (tx, rx) = chan::unbounded();
            for m in &self.0 {
                tx.send(StreamEvent::Mutation(m.clone())).unwrap();
            }
            tx.send(StreamEvent::End).unwrap();

            rx
        }
    }

    #[test]
    fn test_initialize_then_read() {
        let corpus = Corpus::new(None);
        let source = FixedSource(vec![
            issue_mutation(1, "first"),
            issue_mutation(2, "second"),
        ]);

        corpus
            .initialize(&cancel::Token::never(), &source)
            .unwrap();

        let read = corpus.read();
        let project = "example/tooling".parse().unwrap();
        assert_eq!(read.applied(), 2);
        assert_eq!(read.issues().issue(&project, 1).unwrap().title, "first");
        assert_eq!(read.issues().issue(&project, 2).unwrap().title, "second");
    }

    #[test]
    fn test_initialize_twice_is_an_error() {
        let corpus = Corpus::new(None);
        let source = FixedSource(Vec::new());

        corpus
            .initialize(&cancel::Token::never(), &source)
            .unwrap();

        assert!(matches!(
            corpus.initialize(&cancel::Token::never(), &source),
            Err(Error::AlreadyInitialized)
        ));
    }

    #[test]
    fn test_initialize_is_cancellable() {
        /// A source that never produces anything.
        struct StuckSource;

        impl MutationSource for StuckSource {
            fn mutations(&self, _ctx: &cancel::Token) -> chan::Receiver<StreamEvent> {
                let (tx, rx) = chan::unbounded();
                // Keep the channel open without sending.
                std::mem::forget(tx);
                rx
            }
        }

        let corpus = Corpus::new(None);
        let (trigger, token) = cancel::channel();

        trigger.cancel();

        assert!(matches!(
            corpus.initialize(&token, &StuckSource),
            Err(Error::Cancelled(_))
        ));
    }

    #[test]
    fn test_cancelled_stream_closure_is_not_caught_up() {
        /// A source that reacts to cancellation the way a network tail
        /// does: it closes its channel without sending `End`.
        struct ClosingSource;

        impl MutationSource for ClosingSource {
            fn mutations(&self, _ctx: &cancel::Token) -> chan::Receiver<StreamEvent> {
                let (tx, rx) = chan::unbounded::<StreamEvent>();
                drop(tx);
                rx
            }
        }

        // With the token already cancelled, a closed channel must
        // report cancellation, never a successful catch-up.
        for _ in 0..16 {
            let corpus = Corpus::new(None);
            let (trigger, token) = cancel::channel();

            trigger.cancel();

            assert!(matches!(
                corpus.initialize(&token, &ClosingSource),
                Err(Error::Cancelled(_))
            ));
        }
    }

    #[test]
    fn test_malformed_mutation_is_fatal_on_replay() {
        let corpus = Corpus::new(None);
        let source = FixedSource(vec![Mutation::Issue(IssueDelta {
            project: None,
            number: 1,
            ..Default::default()
        })]);

        assert!(matches!(
            corpus.initialize(&cancel::Token::never(), &source),
            Err(Error::Apply(ApplyError::MissingProject))
        ));
    }

    #[test]
    fn test_add_mutation_logs_and_replays() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOG_FILE);

        {
            let log = DiskLog::open(&path).unwrap();
            let corpus = Corpus::new(Some(log));
            corpus
                .initialize(&cancel::Token::never(), &DiskSource::new(&path))
                .unwrap();

            assert_eq!(corpus.add_mutation(&issue_mutation(1, "first")).unwrap(), 0);
            assert_eq!(
                corpus.add_mutation(&issue_mutation(2, "second")).unwrap(),
                1
            );
        }

        // A fresh corpus replaying the log sees the same state.
        let log = DiskLog::open(&path).unwrap();
        let corpus = Corpus::new(Some(log));
        corpus
            .initialize(&cancel::Token::never(), &DiskSource::new(&path))
            .unwrap();

        let read = corpus.read();
        let project = "example/tooling".parse().unwrap();
        assert_eq!(read.applied(), 2);
        assert_eq!(read.issues().issue(&project, 2).unwrap().title, "second");
    }

    #[test]
    fn test_subscribers_see_log_order() {
        let corpus = Corpus::new(None);
        corpus
            .initialize(&cancel::Token::never(), &FixedSource(Vec::new()))
            .unwrap();

        let rx = corpus.subscribe();
        for n in 1..=5 {
            corpus.add_mutation(&issue_mutation(n, "t")).unwrap();
        }
        let offsets: Vec<u64> = rx.try_iter().map(|e| e.offset).collect();

        assert_eq!(offsets, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_readers_never_observe_partial_mutations() {
        use std::thread;

        let corpus = Corpus::new(None);
        corpus
            .initialize(&cancel::Token::never(), &FixedSource(Vec::new()))
            .unwrap();

        let project: crate::mutation::ProjectId = "example/tooling".parse().unwrap();

        // A reader that acquired the lock before the write must not
        // see any effect of it; one acquired after sees all of it.
        let before = corpus.read();
        assert!(before.issues().issue(&project, 1).is_none());

        thread::scope(|s| {
            let writer = s.spawn(|| {
                corpus
                    .add_mutation(&Mutation::Issue(IssueDelta {
                        project: Some(project.clone()),
                        number: 1,
                        closed: Some(true),
                        labels_added: vec!["release-blocker".to_owned()],
                        ..Default::default()
                    }))
                    .unwrap();
            });

            // Hold the guard while the writer is blocked on the lock.
            assert!(before.issues().issue(&project, 1).is_none());
            drop(before);

            writer.join().unwrap();
        });

        let after = corpus.read();
        let issue = after.issues().issue(&project, 1).unwrap();
        assert!(issue.closed);
        assert_eq!(issue.labels.len(), 1);
    }
}
