//! Unix signal handling.

use std::io;
use std::thread;

use crossbeam_channel as chan;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

/// Install signal handlers. Each `SIGINT` or `SIGTERM` is forwarded to
/// `notify`; sends never block, so a signal delivered while the
/// receiver is busy is dropped rather than queued.
pub fn install(notify: chan::Sender<i32>) -> io::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;

    thread::Builder::new()
        .name("signals".to_owned())
        .spawn(move || {
            for signal in signals.forever() {
                if notify.try_send(signal).is_err() {
                    break;
                }
            }
        })?;

    Ok(())
}
