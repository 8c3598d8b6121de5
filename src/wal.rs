use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Change;

/// Append-only change log backing one tenant's engine.
///
/// Frame layout, little-endian: `[u32 payload length][bincode Change]
/// [u32 crc32 of the payload]`. Records are staged into a buffer and made
/// durable in one fsync per batch (`commit`, group commit). Replay walks
/// frames from the start and stops at the first short or checksum-failing
/// frame: that is the torn tail of a crash mid-write, and everything before
/// it is intact.
pub struct Wal {
    out: BufWriter<File>,
    path: PathBuf,
    records_since_rewrite: u64,
}

fn frame(change: &Change) -> io::Result<Vec<u8>> {
    let payload =
        bincode::serialize(change).map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;
    let mut buf = Vec::with_capacity(payload.len() + 8);
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&payload);
    buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    Ok(buf)
}

fn hit_eof(read: io::Result<()>) -> io::Result<bool> {
    match read {
        Ok(()) => Ok(false),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(true),
        Err(e) => Err(e),
    }
}

/// Read one frame's payload. `Ok(None)` ends the log: clean EOF, a torn
/// frame, and a checksum mismatch all look the same to the caller.
fn next_payload(reader: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
    let mut word = [0u8; 4];
    if hit_eof(reader.read_exact(&mut word))? {
        return Ok(None);
    }
    let mut payload = vec![0u8; u32::from_le_bytes(word) as usize];
    if hit_eof(reader.read_exact(&mut payload))? {
        return Ok(None);
    }
    if hit_eof(reader.read_exact(&mut word))? {
        return Ok(None);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(Some(payload))
}

fn appender(path: &Path) -> io::Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

fn rewrite_path(path: &Path) -> PathBuf {
    path.with_extension("wal.rewrite")
}

impl Wal {
    /// Open (or create) the log at `path` for appending.
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            out: appender(path)?,
            path: path.to_path_buf(),
            records_since_rewrite: 0,
        })
    }

    /// Stage one record into the write buffer. Nothing is durable until the
    /// next `commit`.
    pub fn stage(&mut self, change: &Change) -> io::Result<()> {
        self.out.write_all(&frame(change)?)?;
        self.records_since_rewrite += 1;
        Ok(())
    }

    /// Flush the buffer and fsync: every staged record is durable on return.
    pub fn commit(&mut self) -> io::Result<()> {
        self.out.flush()?;
        self.out.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records appended since the last rewrite, the compaction trigger.
    pub fn records_since_rewrite(&self) -> u64 {
        self.records_since_rewrite
    }

    /// Compaction phase one: write the minimal change set to a sibling
    /// rewrite file and fsync it. This is the slow I/O half and takes no
    /// lock on the live log.
    pub fn write_rewrite(path: &Path, changes: &[Change]) -> io::Result<()> {
        let mut out = BufWriter::new(File::create(rewrite_path(path))?);
        for change in changes {
            out.write_all(&frame(change)?)?;
        }
        out.flush()?;
        out.get_ref().sync_all()
    }

    /// Compaction phase two: atomically rename the rewrite file over the
    /// live log and reopen for appending. Fast, runs on the writer.
    pub fn install_rewrite(&mut self) -> io::Result<()> {
        fs::rename(rewrite_path(&self.path), &self.path)?;
        self.out = appender(&self.path)?;
        self.records_since_rewrite = 0;
        Ok(())
    }

    /// Reconstruct the change sequence from disk. A missing file is an empty
    /// log; a torn or corrupt tail is silently dropped.
    pub fn replay(path: &Path) -> io::Result<Vec<Change>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut changes = Vec::new();
        while let Some(payload) = next_payload(&mut reader)? {
            match bincode::deserialize(&payload) {
                Ok(change) => changes.push(change),
                Err(_) => break,
            }
        }
        Ok(changes)
    }
}
