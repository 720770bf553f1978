//! The node runtime: wires the corpus, sync engine, tail server and
//! signal handling together, and owns orderly shutdown.

use std::io;
use std::sync::Arc;
use std::thread;

use crossbeam_channel as chan;

use corpora::corpus;
use corpora::corpus::Corpus;
use corpora::log::{DiskLog, DiskSource};
use corpora::sync;
use corpora::sync::{Engine, Upstream};
use corpora::tail::TailSource;
use corpora::{cancel, log};

use crate::config::Config;
use crate::serve;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("mutation log: {0}")]
    Log(#[from] log::Error),
    #[error("corpus: {0}")]
    Corpus(#[from] corpus::Error),
    #[error("tail server: {0}")]
    Serve(#[from] serve::Error),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("source '{0}' has no upstream implementation")]
    UnknownSource(String),
}

/// A fully initialized node, ready to run.
pub struct Runtime {
    config: Config,
    corpus: Arc<Corpus>,
    upstreams: Vec<(sync::WatchedSource, Box<dyn Upstream>)>,
    signals: chan::Receiver<i32>,
}

impl Runtime {
    /// Initialize the node: open the log (leader) or connect to the
    /// leader (follower), and replay until caught up. Blocks for the
    /// duration of catch-up.
    ///
    /// `upstreams` maps each configured source label to its
    /// implementation; leaders must cover every configured source.
    pub fn init(
        config: Config,
        mut upstreams: Vec<(sync::WatchedSource, Box<dyn Upstream>)>,
        signals: chan::Receiver<i32>,
        ctx: &cancel::Token,
    ) -> Result<Self, Error> {
        let corpus = if let Some(leader) = &config.follow {
            ::log::info!(target: "node", "Following leader at {leader}..");

            let corpus = Arc::new(Corpus::new(None));
            corpus.initialize(ctx, &TailSource::new(leader.clone()))?;
            upstreams.clear();

            corpus
        } else {
            std::fs::create_dir_all(&config.data_dir)?;

            let path = config.log_path();
            let disk = DiskLog::open(&path)?;
            ::log::info!(
                target: "node",
                "Opened mutation log at `{}` with {} entries",
                path.display(),
                disk.head()
            );
            let corpus = Arc::new(Corpus::new(Some(disk)));
            corpus.initialize(ctx, &DiskSource::new(&path))?;

            for source in &config.sources {
                corpus.track(source.clone());
                if !upstreams.iter().any(|(s, _)| s == source) {
                    return Err(Error::UnknownSource(source.label()));
                }
            }
            corpus
        };
        ::log::info!(
            target: "node",
            "Caught up; {} mutations applied",
            corpus.read().applied()
        );

        Ok(Self {
            config,
            corpus,
            upstreams,
            signals,
        })
    }

    /// The corpus, for tooling and tests.
    pub fn corpus(&self) -> &Arc<Corpus> {
        &self.corpus
    }

    /// Run until a signal arrives or a fatal error occurs.
    pub fn run(self, ctx: cancel::Token, trigger: cancel::Trigger) -> Result<(), Error> {
        let listener = serve::bind(self.config.listen)?;
        let server = {
            let corpus = self.corpus.clone();
            // Followers own no log; their `/logs` answers 503.
            let log_path = self
                .config
                .follow
                .is_none()
                .then(|| self.config.log_path());
            let ctx = ctx.clone();

            thread::Builder::new()
                .name("serve".to_owned())
                .spawn(move || serve::listen(listener, corpus, log_path, ctx))?
        };

        let follower = if self.config.follow.is_some() {
            let corpus = self.corpus.clone();
            let ctx = ctx.clone();

            Some(
                thread::Builder::new()
                    .name("follow".to_owned())
                    .spawn(move || corpus.follow(&ctx))?,
            )
        } else {
            None
        };
        let engine = Engine::run(&self.corpus, self.upstreams, &ctx);

        // Supervise until a signal or a fatal engine event.
        let mut result = Ok(());

        loop {
            chan::select! {
                recv(self.signals) -> signal => {
                    match signal {
                        Ok(signal) => {
                            ::log::info!(target: "node", "Received signal {signal}; shutting down..");
                        }
                        Err(_) => {
                            ::log::warn!(target: "node", "Signal channel closed; shutting down..");
                        }
                    }
                    break;
                }
                recv(engine.events()) -> event => match event {
                    Ok(sync::Event::Synced { .. }) => {}
                    Ok(sync::Event::SourceFailed { source, error }) => {
                        ::log::error!(target: "node", "Source '{source}' stopped: {error}");
                    }
                    Ok(sync::Event::Fatal(e)) => {
                        result = Err(Error::Corpus(e));
                        break;
                    }
                    // No sync workers remain. The server (and a
                    // follower's tail) keep running; block on signals.
                    Err(_) => {
                        if let Ok(signal) = self.signals.recv() {
                            ::log::info!(target: "node", "Received signal {signal}; shutting down..");
                        }
                        break;
                    }
                }
            }
        }
        trigger.cancel();

        engine.join();
        if let Some(follower) = follower {
            follower.join().expect("runtime: follower thread").ok();
        }
        server.join().expect("runtime: server thread")?;

        ::log::info!(target: "node", "Shutdown complete");

        result
    }
}
