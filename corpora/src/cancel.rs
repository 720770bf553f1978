//! Cooperative cancellation.
//!
//! A [`Token`] is handed to every long-running task; triggering the
//! paired [`Trigger`] (or dropping it) wakes all of them. Tasks observe
//! cancellation either by polling [`Token::is_cancelled`] between units
//! of work, or by sleeping with [`Token::sleep`], or by selecting on
//! [`Token::done`] alongside their own channels.

use std::time::Duration;

use crossbeam_channel as chan;

/// Returned by operations interrupted by cancellation.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("operation cancelled")]
pub struct Cancelled;

/// The cancelling end. Dropping it has the same effect as calling
/// [`Trigger::cancel`], so the owner keeps it alive for the lifetime
/// of the tasks it governs.
pub struct Trigger {
    tx: chan::Sender<()>,
}

impl Trigger {
    /// Cancel all associated tokens.
    pub fn cancel(self) {
        drop(self.tx);
    }
}

/// The observing end. Cheap to clone; all clones observe the same
/// trigger.
#[derive(Clone)]
pub struct Token {
    rx: chan::Receiver<()>,
}

impl Token {
    /// A token that is never cancelled. Useful in tests and one-shot
    /// tools.
    pub fn never() -> Self {
        let (tx, rx) = chan::bounded::<()>(1);
        // Keep the channel open forever.
        std::mem::forget(tx);

        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.rx.try_recv(), Err(chan::TryRecvError::Disconnected))
    }

    /// The channel to select on: it becomes ready when the trigger
    /// fires.
    pub fn done(&self) -> &chan::Receiver<()> {
        &self.rx
    }

    /// Sleep for `duration`, waking early with `Err(Cancelled)` if the
    /// trigger fires first.
    pub fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        match self.rx.recv_timeout(duration) {
            Err(chan::RecvTimeoutError::Timeout) => Ok(()),
            _ => Err(Cancelled),
        }
    }
}

/// Create a connected trigger/token pair.
pub fn channel() -> (Trigger, Token) {
    let (tx, rx) = chan::bounded(1);

    (Trigger { tx }, Token { rx })
}
