//! Spool-directory upstream.
//!
//! The built-in ingestion path: producers drop files containing one
//! wire-encoded mutation each into the source's spool directory, and
//! the syncer picks them up on its next poll, in file-name order.
//! Files are removed once the whole batch has decoded; a mutation that
//! has been picked up but
//! not yet applied is not durable until it reaches the log, so a
//! producer that needs certainty re-drops after confirming the corpus
//! advanced.
//!
//! This keeps the daemon runnable without talking to any external
//! service; network connectors plug in through the same
//! [`Upstream`] trait.

use std::fs;
use std::io;
use std::path::PathBuf;

use corpora::corpus::Corpus;
use corpora::mutation::Mutation;
use corpora::sync::{PollError, Upstream};
use corpora::wire;

/// File extension of spooled mutations.
pub const SPOOL_EXT: &str = "mut";

/// Reads mutations spooled to a directory.
pub struct SpoolUpstream {
    dir: PathBuf,
}

impl SpoolUpstream {
    /// A spool rooted at `dir`. The directory is created on first
    /// poll.
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn take(&self) -> io::Result<Vec<Mutation>> {
        fs::create_dir_all(&self.dir)?;

        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == SPOOL_EXT) {
                paths.push(path);
            }
        }
        paths.sort();

        // Decode the whole batch before removing anything: a garbage
        // file must leave its siblings in place for the retry.
        let mut mutations = Vec::with_capacity(paths.len());
        for path in &paths {
            let record = fs::read(path)?;
            let mutation = wire::deserialize::<Mutation>(&record)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

            mutations.push(mutation);
        }
        for path in &paths {
            fs::remove_file(path)?;
        }
        Ok(mutations)
    }
}

impl Upstream for SpoolUpstream {
    fn poll(&mut self, _corpus: &Corpus) -> Result<Vec<Mutation>, PollError> {
        // A bad file is transient: the operator can fix or remove it.
        self.take().map_err(PollError::transient)
    }
}
