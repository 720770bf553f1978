//! The tail server.
//!
//! Serves the mutation log over HTTP on a plain TCP listener, one
//! thread per connection. `GET /logs?cursor=N` answers with an
//! unbounded `application/octet-stream` body of framed entries: every
//! durable entry from `N` onward, a `caught-up` frame, then live
//! entries as they are applied, until the client goes away or the node
//! shuts down.
//!
//! The gap between catching up from the file and going live is closed
//! by subscribing *before* reading the file: entries applied during
//! catch-up arrive on the subscription too, and the duplicates are
//! dropped by offset.

use std::io;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::net;
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use byteorder::{NetworkEndian, WriteBytesExt};
use crossbeam_channel as chan;

use corpora::cancel;
use corpora::corpus::{Corpus, LogEntry};
use corpora::tail::{FRAME_CAUGHT_UP, FRAME_MUTATION};
use corpora::{log, wire};

/// How often the accept loop checks for shutdown.
const ACCEPT_POLL: Duration = Duration::from_millis(250);

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to bind listener: {0}")]
    Bind(io::Error),
}

/// Bind the tail server's listener.
pub fn bind(addr: net::SocketAddr) -> Result<TcpListener, Error> {
    let listener = TcpListener::bind(addr).map_err(Error::Bind)?;
    listener.set_nonblocking(true).map_err(Error::Bind)?;

    Ok(listener)
}

/// Run the tail server until `ctx` is cancelled. Blocks; run it on its
/// own thread.
///
/// `log_path` is the durable log backing `/logs` catch-up. A node that
/// owns no log (a follower) passes `None` and serves only the index;
/// `/logs` then answers 503, since this node cannot vouch for history.
pub fn listen(
    listener: TcpListener,
    corpus: Arc<Corpus>,
    log_path: Option<PathBuf>,
    ctx: cancel::Token,
) -> Result<(), Error> {
    ::log::info!(
        target: "serve",
        "Tail server listening on {}..",
        listener.local_addr().map_err(Error::Bind)?
    );

    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                ::log::debug!(target: "serve", "Accepted connection from {peer}..");

                let corpus = corpus.clone();
                let log_path = log_path.clone();
                let ctx = ctx.clone();

                thread::Builder::new()
                    .name(format!("serve/{peer}"))
                    .spawn(move || {
                        if let Err(e) = drain(stream, &corpus, log_path.as_deref(), &ctx) {
                            ::log::debug!(target: "serve", "Connection from {peer} closed: {e}");
                        }
                    })
                    .ok();
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if ctx.sleep(ACCEPT_POLL).is_err() {
                    break;
                }
            }
            Err(e) => {
                ::log::error!(target: "serve", "Failed to accept incoming connection: {e}");
            }
        }
    }
    ::log::debug!(target: "serve", "Exiting accept loop..");

    Ok(())
}

/// One parsed request.
struct Request {
    path: String,
    cursor: u64,
}

#[derive(thiserror::Error, Debug)]
enum DrainError {
    #[error("malformed request: {0}")]
    BadRequest(String),
    #[error("mutation log: {0}")]
    Log(#[from] log::Error),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

fn drain(
    stream: TcpStream,
    corpus: &Corpus,
    log_path: Option<&std::path::Path>,
    ctx: &cancel::Token,
) -> Result<(), DrainError> {
    let request = match read_request(&stream) {
        Ok(request) => request,
        Err(e @ DrainError::BadRequest(_)) => {
            respond(&stream, "400 Bad Request", &format!("{e}\n"))?;
            return Err(e);
        }
        Err(e) => return Err(e),
    };

    match request.path.as_str() {
        "/logs" => match log_path {
            Some(log_path) => serve_logs(stream, corpus, log_path, request.cursor, ctx),
            None => {
                respond(
                    &stream,
                    "503 Service Unavailable",
                    "this node owns no log; tail the leader\n",
                )?;

                Ok(())
            }
        },
        "/" => {
            let read = corpus.read();
            let body = format!(
                "corpora-node {}\nmutations: {}\nsources: {}\n",
                crate::VERSION,
                read.applied(),
                read.watched().len(),
            );
            drop(read);
            respond(&stream, "200 OK", &body)?;

            Ok(())
        }
        other => {
            respond(&stream, "404 Not Found", &format!("no such path: {other}\n"))?;

            Ok(())
        }
    }
}

/// Read and parse the request line, then drain the headers. We serve
/// only simple `GET`s, so the headers are noise.
fn read_request(stream: &TcpStream) -> Result<Request, DrainError> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();

    reader.read_line(&mut line)?;

    let mut parts = line.split_whitespace();
    let (method, target) = match (parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(target), Some(_version)) => (method, target),
        _ => return Err(DrainError::BadRequest(line.trim_end().to_owned())),
    };
    if method != "GET" {
        return Err(DrainError::BadRequest(format!("unsupported method {method}")));
    }
    // Owned, since `line` is reused for the header drain below.
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path.to_owned(), query.to_owned()),
        None => (target.to_owned(), String::new()),
    };
    let mut cursor = 0;

    for pair in query.split('&') {
        if let Some(("cursor", value)) = pair.split_once('=') {
            cursor = value
                .parse()
                .map_err(|_| DrainError::BadRequest(format!("invalid cursor `{value}`")))?;
        }
    }

    // Headers, up to the blank line.
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 || line == "\r\n" || line == "\n" {
            break;
        }
    }
    Ok(Request { path, cursor })
}

fn respond(mut stream: &TcpStream, status: &str, body: &str) -> io::Result<()> {
    write!(
        stream,
        "HTTP/1.1 {status}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )?;
    stream.flush()?;
    stream.shutdown(net::Shutdown::Both).ok();

    Ok(())
}

fn write_frame<W: Write>(writer: &mut W, record: &[u8]) -> io::Result<()> {
    writer.write_u8(FRAME_MUTATION)?;
    writer.write_u32::<NetworkEndian>(record.len() as u32)?;
    writer.write_all(record)
}

fn serve_logs(
    stream: TcpStream,
    corpus: &Corpus,
    log_path: &std::path::Path,
    cursor: u64,
    ctx: &cancel::Token,
) -> Result<(), DrainError> {
    // Subscribe before catching up, so nothing applied in between is
    // missed. Overlap is resolved by offset below.
    let entries = corpus.subscribe();
    let mut writer = BufWriter::new(&stream);

    write!(
        writer,
        "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nConnection: close\r\n\r\n"
    )?;

    // Catch-up: stream the durable log from the cursor.
    let mut next = log::for_each_record(log_path, cursor, |_, record| {
        write_frame(&mut writer, record)
    })?;

    writer.write_u8(FRAME_CAUGHT_UP)?;
    writer.flush()?;

    ::log::debug!(target: "serve", "Caught client up from {cursor} to {next}");

    // Live: forward applied entries, dropping any the catch-up already
    // delivered.
    loop {
        chan::select! {
            recv(entries) -> entry => {
                let Ok(LogEntry { offset, mutation }) = entry else {
                    break;
                };
                if offset < next {
                    continue;
                }
                next = offset + 1;
                write_frame(&mut writer, &wire::serialize(&mutation))?;
                writer.flush()?;
            }
            recv(ctx.done()) -> _ => break,
        }
    }
    stream.shutdown(net::Shutdown::Both).ok();

    Ok(())
}
