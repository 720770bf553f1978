//! The durable mutation log.
//!
//! An append-only file of framed records: a big-endian `u32` length
//! followed by one binary-encoded [`Mutation`]. The log is the single
//! source of truth, and the corpus is a cache of its replay, so appends
//! are synced before they are acknowledged, and append failure is fatal
//! to the writer process.
//!
//! Offsets are record indices, not byte positions: entry 0 is the first
//! mutation ever logged. A truncated final record (a crash mid-append)
//! is "not yet durable", not corruption: readers stop at the last whole
//! record and the next append rewinds over the partial tail.

use std::fs::{File, OpenOptions};
use std::io;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{NetworkEndian, ReadBytesExt, WriteBytesExt};
use crossbeam_channel as chan;

use crate::cancel;
use crate::mutation::Mutation;
use crate::source::{MutationSource, SourceError, StreamEvent};
use crate::wire;

/// Default file name of the log within a data directory.
pub const LOG_FILE: &str = "mutations.log";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    #[error("wire: {0}")]
    Wire(#[from] wire::Error),
    #[error("record size {0} exceeds maximum")]
    OversizedRecord(usize),
}

/// The append-only disk log. There is exactly one writer per log file;
/// readers open the file independently.
pub struct DiskLog {
    path: PathBuf,
    file: File,
    /// Number of whole records on disk.
    head: u64,
    /// Byte length of the durable prefix (everything before a
    /// truncated tail, if any).
    durable_len: u64,
}

impl DiskLog {
    /// Open (or create) the log at `path`, scanning it to find the
    /// durable head. A partial final record is rewound over.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let mut reader = BufReader::new(&mut file);
        let mut head = 0;
        let mut durable_len = 0u64;

        loop {
            let len = match reader.read_u32::<NetworkEndian>() {
                Ok(len) => len as u64,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            };
            if len as usize > wire::MAX_SIZE {
                return Err(Error::OversizedRecord(len as usize));
            }
            match io::copy(&mut (&mut reader).take(len), &mut io::sink()) {
                Ok(n) if n == len => {
                    head += 1;
                    durable_len += 4 + len;
                }
                // Truncated tail: not yet durable.
                Ok(_) => break,
                Err(e) => return Err(e.into()),
            }
        }
        file.seek(SeekFrom::Start(durable_len))?;

        Ok(Self {
            path,
            file,
            head,
            durable_len,
        })
    }

    /// The log file path. Independent readers open it themselves.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of durable records; also the offset the next append
    /// receives.
    pub fn head(&self) -> u64 {
        self.head
    }

    /// Durably append one mutation, returning its offset.
    ///
    /// The record is written over any partial tail left by a previous
    /// crash, flushed and synced before this returns. An error here
    /// means the process must stop: continuing would let in-memory
    /// state diverge from what followers are told is committed.
    pub fn append(&mut self, mutation: &Mutation) -> Result<u64, Error> {
        let record = wire::serialize(mutation);
        if record.len() > wire::MAX_SIZE {
            return Err(Error::OversizedRecord(record.len()));
        }
        self.file.set_len(self.durable_len)?;
        self.file.seek(SeekFrom::Start(self.durable_len))?;

        let mut writer = BufWriter::new(&mut self.file);
        writer.write_u32::<NetworkEndian>(record.len() as u32)?;
        writer.write_all(&record)?;
        writer.flush()?;
        drop(writer);

        self.file.sync_data()?;

        let offset = self.head;
        self.head += 1;
        self.durable_len += 4 + record.len() as u64;

        Ok(offset)
    }
}

/// Iterate the whole records of a log file starting at record index
/// `from`, calling `f(offset, record_bytes)` for each. Stops at the
/// end of the durable prefix and returns the next offset. Errors from
/// `f` propagate.
pub fn for_each_record<P, F>(path: P, from: u64, mut f: F) -> Result<u64, Error>
where
    P: AsRef<Path>,
    F: FnMut(u64, &[u8]) -> io::Result<()>,
{
    let file = match File::open(path.as_ref()) {
        Ok(file) => file,
        // A log that was never written to is empty, not missing.
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(from),
        Err(e) => return Err(e.into()),
    };
    let mut reader = BufReader::new(file);
    let mut offset = 0;
    let mut buf = Vec::new();

    loop {
        let len = match reader.read_u32::<NetworkEndian>() {
            Ok(len) => len as usize,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        };
        if len > wire::MAX_SIZE {
            return Err(Error::OversizedRecord(len));
        }
        buf.resize(len, 0);
        match reader.read_exact(&mut buf) {
            Ok(()) => {}
            // Truncated tail: not yet durable.
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        if offset >= from {
            f(offset, &buf)?;
        }
        offset += 1;
    }
    Ok(offset)
}

/// Replays a log file from disk. Sends every durable record in order,
/// then `End`. There is no live following locally: after `End` the
/// channel closes.
pub struct DiskSource {
    path: PathBuf,
}

impl DiskSource {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl MutationSource for DiskSource {
    fn mutations(&self, ctx: &cancel::Token) -> chan::Receiver<StreamEvent> {
        // Buffered, so decoding overlaps with applying.
        let (tx, rx) = chan::bounded(64);
        let path = self.path.clone();
        let ctx = ctx.clone();

        std::thread::Builder::new()
            .name("replay".to_owned())
            .spawn(move || {
                let send = |event: StreamEvent| -> bool {
                    chan::select! {
                        send(tx, event) -> res => res.is_ok(),
                        recv(ctx.done()) -> _ => false,
                    }
                };
                let result = for_each_record(&path, 0, |_, record| {
                    let mutation = wire::deserialize::<Mutation>(record)
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

                    if !send(StreamEvent::Mutation(mutation)) {
                        return Err(io::Error::new(io::ErrorKind::Interrupted, "cancelled"));
                    }
                    Ok(())
                });
                match result {
                    Ok(_) => {
                        send(StreamEvent::End);
                    }
                    Err(Error::Io(e)) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        send(StreamEvent::Err(SourceError::Protocol(e.to_string())));
                    }
                }
            })
            .expect("log: replay thread name is valid");

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::IssueDelta;

    fn mutation(number: u32) -> Mutation {
        Mutation::Issue(IssueDelta {
            project: Some("example/tooling".parse().unwrap()),
            number,
            ..Default::default()
        })
    }

    #[test]
    fn test_append_and_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOG_FILE);

        let mut log = DiskLog::open(&path).unwrap();
        assert_eq!(log.append(&mutation(1)).unwrap(), 0);
        assert_eq!(log.append(&mutation(2)).unwrap(), 1);
        assert_eq!(log.head(), 2);

        let mut seen = Vec::new();
        let next = for_each_record(&path, 0, |offset, record| {
            seen.push((offset, wire::deserialize::<Mutation>(record).unwrap()));
            Ok(())
        })
        .unwrap();

        assert_eq!(next, 2);
        assert_eq!(seen, vec![(0, mutation(1)), (1, mutation(2))]);
    }

    #[test]
    fn test_replay_from_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOG_FILE);

        let mut log = DiskLog::open(&path).unwrap();
        for n in 1..=5 {
            log.append(&mutation(n)).unwrap();
        }

        let mut offsets = Vec::new();
        for_each_record(&path, 3, |offset, _| {
            offsets.push(offset);
            Ok(())
        })
        .unwrap();

        assert_eq!(offsets, vec![3, 4]);
    }

    #[test]
    fn test_truncated_tail_is_not_durable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOG_FILE);

        {
            let mut log = DiskLog::open(&path).unwrap();
            log.append(&mutation(1)).unwrap();
            log.append(&mutation(2)).unwrap();
        }
        // Chop the last record in half, as a crash mid-append would.
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();

        let mut count = 0;
        let next = for_each_record(&path, 0, |_, _| {
            count += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!((count, next), (1, 1));

        // Re-opening rewinds over the partial tail; the next append
        // lands at offset 1.
        let mut log = DiskLog::open(&path).unwrap();
        assert_eq!(log.head(), 1);
        assert_eq!(log.append(&mutation(3)).unwrap(), 1);

        let mut seen = Vec::new();
        for_each_record(&path, 0, |_, record| {
            seen.push(wire::deserialize::<Mutation>(record).unwrap());
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![mutation(1), mutation(3)]);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let next = for_each_record(dir.path().join("absent.log"), 0, |_, _| Ok(())).unwrap();

        assert_eq!(next, 0);
    }

    #[test]
    fn test_disk_source_sends_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOG_FILE);

        let mut log = DiskLog::open(&path).unwrap();
        log.append(&mutation(1)).unwrap();

        let source = DiskSource::new(&path);
        let rx = source.mutations(&cancel::Token::never());

        assert!(matches!(rx.recv().unwrap(), StreamEvent::Mutation(_)));
        assert!(matches!(rx.recv().unwrap(), StreamEvent::End));
        // Channel closes after `End`: local replay has no live phase.
        assert!(rx.recv().is_err());
    }
}
