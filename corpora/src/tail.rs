//! Tailing a remote mutation log over HTTP.
//!
//! A [`TailSource`] connects to a leader's `/logs` endpoint and
//! decodes its framed response body. The server sends every entry from
//! the requested cursor onward, a `caught-up` frame once the reader is
//! at the head, and then keeps the connection open, streaming entries
//! as they are logged.
//!
//! Delivery is at least once. The client tracks only its cursor: on
//! any connection error it reconnects at the cursor with jittered
//! backoff, and a server restart may replay entries the client has
//! already seen. Consumers apply idempotently, so replays are
//! harmless. The stream never reports `Err`: a broken network is a
//! retry, not a failure.

use std::io;
use std::io::Read;
use std::time::Duration;

use byteorder::{NetworkEndian, ReadBytesExt};
use crossbeam_channel as chan;

use crate::cancel;
use crate::mutation::Mutation;
use crate::source::{MutationSource, StreamEvent};
use crate::wire;

/// Frame tag: one log entry follows (`u32` length + record).
pub const FRAME_MUTATION: u8 = 0;
/// Frame tag: the reader is at the log head. Sent once per catch-up,
/// so also after each reconnect.
pub const FRAME_CAUGHT_UP: u8 = 1;

/// Delay before the first reconnect attempt.
pub const RECONNECT_BASE: Duration = Duration::from_secs(1);
/// Reconnect delay ceiling.
pub const RECONNECT_MAX: Duration = Duration::from_secs(60);

/// Follows a remote mutation log.
pub struct TailSource {
    /// Server base URL, eg. `http://corpus.example.com:8383`.
    url: String,
    agent: ureq::Agent,
}

impl TailSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            agent: ureq::AgentBuilder::new()
                .timeout_connect(Duration::from_secs(10))
                .build(),
        }
    }

    fn connect(&self, cursor: u64) -> Result<Box<dyn Read + Send + Sync>, ureq::Error> {
        let response = self
            .agent
            .get(&format!("{}/logs", self.url))
            .query("cursor", &cursor.to_string())
            .call()?;

        Ok(response.into_reader())
    }
}

impl MutationSource for TailSource {
    fn mutations(&self, ctx: &cancel::Token) -> chan::Receiver<StreamEvent> {
        let (tx, rx) = chan::bounded(64);
        let url = self.url.clone();
        let agent = self.agent.clone();
        let ctx = ctx.clone();

        std::thread::Builder::new()
            .name("tail".to_owned())
            .spawn(move || {
                let source = TailSource { url, agent };
                let send = |event: StreamEvent| -> bool {
                    chan::select! {
                        send(tx, event) -> res => res.is_ok(),
                        recv(ctx.done()) -> _ => false,
                    }
                };
                let mut cursor = 0u64;
                let mut attempts = 0u32;

                loop {
                    let body = match source.connect(cursor) {
                        Ok(body) => body,
                        Err(e) => {
                            attempts += 1;
                            let delay = reconnect_delay(attempts);
                            ::log::warn!(
                                target: "tail",
                                "Connection to {} failed ({e}); retrying in {}s",
                                source.url,
                                delay.as_secs()
                            );
                            if ctx.sleep(delay).is_err() {
                                return;
                            }
                            continue;
                        }
                    };
                    ::log::debug!(target: "tail", "Connected to {} at cursor {cursor}", source.url);
                    attempts = 0;

                    match stream(body, &mut cursor, &send) {
                        Ok(()) | Err(_) if ctx.is_cancelled() => return,
                        Ok(()) => {
                            // Server closed the stream cleanly; resume
                            // where we left off.
                        }
                        Err(e) => {
                            ::log::warn!(target: "tail", "Stream broke at cursor {cursor}: {e}");
                        }
                    }
                    attempts += 1;
                    if ctx.sleep(reconnect_delay(attempts)).is_err() {
                        return;
                    }
                }
            })
            .expect("tail: thread name is valid");

        rx
    }
}

/// Decode frames off one connection until it breaks or the consumer
/// goes away. Advances `cursor` past every delivered entry so the
/// next connection resumes correctly.
fn stream<F>(body: Box<dyn Read + Send + Sync>, cursor: &mut u64, send: &F) -> io::Result<()>
where
    F: Fn(StreamEvent) -> bool,
{
    let mut reader = io::BufReader::new(body);

    loop {
        let tag = reader.read_u8()?;

        match tag {
            FRAME_MUTATION => {
                let len = reader.read_u32::<NetworkEndian>()? as usize;
                if len > wire::MAX_SIZE {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("oversized frame of {len} bytes"),
                    ));
                }
                let mut record = vec![0; len];
                reader.read_exact(&mut record)?;

                let mutation = wire::deserialize::<Mutation>(&record)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

                if !send(StreamEvent::Mutation(mutation)) {
                    return Ok(());
                }
                *cursor += 1;
            }
            FRAME_CAUGHT_UP => {
                if !send(StreamEvent::End) {
                    return Ok(());
                }
            }
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown frame tag {other}"),
                ));
            }
        }
    }
}

/// Jittered exponential reconnect delay, capped at [`RECONNECT_MAX`].
fn reconnect_delay(attempts: u32) -> Duration {
    let exp = RECONNECT_BASE.saturating_mul(1u32 << attempts.min(8).saturating_sub(1));

    exp.min(RECONNECT_MAX).mul_f64(0.5 + fastrand::f64() / 2.)
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;
    use std::io::Write;

    use crate::mutation::IssueDelta;

    fn frame(mutation: &Mutation) -> Vec<u8> {
        let record = wire::serialize(mutation);
        let mut buf = Vec::new();

        buf.write_u8(FRAME_MUTATION).unwrap();
        buf.write_u32::<NetworkEndian>(record.len() as u32).unwrap();
        buf.write_all(&record).unwrap();
        buf
    }

    #[test]
    fn test_stream_decodes_frames_and_tracks_cursor() {
        let m1 = Mutation::Issue(IssueDelta {
            project: Some("example/tooling".parse().unwrap()),
            number: 7,
            ..Default::default()
        });
        let mut body = frame(&m1);
        body.push(FRAME_CAUGHT_UP);
        body.extend(frame(&m1));

        let (tx, rx) = chan::unbounded();
        let mut cursor = 3;

        let result = stream(
            Box::new(io::Cursor::new(body)),
            &mut cursor,
            &|e| tx.send(e).is_ok(),
        );

        // The body ends mid-stream, which reads as an i/o error; the
        // caller reconnects at the advanced cursor.
        assert!(result.is_err());
        assert_eq!(cursor, 5);

        assert!(matches!(rx.try_recv().unwrap(), StreamEvent::Mutation(_)));
        assert!(matches!(rx.try_recv().unwrap(), StreamEvent::End));
        assert!(matches!(rx.try_recv().unwrap(), StreamEvent::Mutation(_)));
    }

    #[test]
    fn test_stream_rejects_unknown_tags() {
        let (tx, _rx) = chan::unbounded();
        let mut cursor = 0;

        let result = stream(
            Box::new(io::Cursor::new(vec![0xff])),
            &mut cursor,
            &|e| tx.send(e).is_ok(),
        );

        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::InvalidData);
        assert_eq!(cursor, 0);
    }

    #[test]
    fn test_reconnect_delay_is_bounded() {
        for attempts in 1..32 {
            assert!(reconnect_delay(attempts) <= RECONNECT_MAX);
        }
    }
}
