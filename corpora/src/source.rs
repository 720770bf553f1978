//! Mutation sources.
//!
//! A [`MutationSource`] replays a mutation log to a consumer, from
//! local durable storage ([`crate::log::DiskSource`]) or over the
//! network from a live server ([`crate::tail::TailSource`]).

use std::io;

use crossbeam_channel as chan;

use crate::cancel;
use crate::mutation::Mutation;
use crate::wire;

/// A terminal failure of a mutation stream.
#[derive(thiserror::Error, Debug)]
pub enum SourceError {
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    #[error("wire: {0}")]
    Wire(#[from] wire::Error),
    #[error("protocol: {0}")]
    Protocol(String),
}

/// One event on a mutation stream. Exactly one meaning per event:
///
/// * `Mutation`: the next entry, in log order.
/// * `Err`: the stream failed; terminal for this stream.
/// * `End`: caught up to the producer's head. **Not** terminal:
///   further mutations may still arrive. This is how a consumer tells
///   bulk catch-up apart from live following.
#[derive(Debug)]
pub enum StreamEvent {
    Mutation(Mutation),
    Err(SourceError),
    End,
}

/// Yields a log of mutations that catch a corpus up to the present,
/// then keeps following if the producer is live.
///
/// The returned channel is closed by the producer when it has nothing
/// further to send (a finite replay) or when `ctx` is cancelled.
pub trait MutationSource {
    fn mutations(&self, ctx: &cancel::Token) -> chan::Receiver<StreamEvent>;
}
