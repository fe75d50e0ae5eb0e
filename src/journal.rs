use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::model::JournalEntry;

/// Length prefix plus crc32 suffix around every payload.
const FRAME_OVERHEAD: u64 = 8;

/// What a journal file holds up to its first damaged frame.
#[derive(Debug, Default)]
pub struct Recovered {
    pub entries: Vec<JournalEntry>,
    /// Byte length of the intact prefix.
    pub intact_len: u64,
    pub file_len: u64,
}

impl Recovered {
    /// Bytes of torn or corrupt tail past the last intact entry.
    pub fn discarded(&self) -> u64 {
        self.file_len.saturating_sub(self.intact_len)
    }
}

/// `[u32 len][bincode payload][u32 crc32]`, little endian.
fn frame(entry: &JournalEntry) -> io::Result<Vec<u8>> {
    let payload =
        bincode::serialize(entry).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "journal entry too large"))?;
    let mut buf = Vec::with_capacity(payload.len() + FRAME_OVERHEAD as usize);
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&payload);
    buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    Ok(buf)
}

/// `Ok(false)` when the file ends before `buf` is full.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Next intact entry and its size on disk. `None` at end of file and at the
/// first frame that is short, oversized for what is left, or fails its crc.
fn next_entry(reader: &mut impl Read, remaining: u64) -> io::Result<Option<(JournalEntry, u64)>> {
    let mut word = [0u8; 4];
    if !fill(reader, &mut word)? {
        return Ok(None);
    }
    let size = u64::from(u32::from_le_bytes(word)) + FRAME_OVERHEAD;
    if size > remaining {
        return Ok(None);
    }
    let mut payload = vec![0u8; (size - FRAME_OVERHEAD) as usize];
    if !fill(reader, &mut payload)? || !fill(reader, &mut word)? {
        return Ok(None);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize(&payload).ok().map(|entry| (entry, size)))
}

/// Append-only record journal backing `MemoryStore::open`.
pub struct Journal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Journal {
    /// Recover the journal at `path` (creating it if missing) and open it for
    /// appends. A damaged tail is cut off first, so new entries follow the
    /// last intact one.
    pub fn open(path: &Path) -> io::Result<(Self, Recovered)> {
        let recovered = Self::replay(path)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        if recovered.discarded() > 0 {
            warn!(
                "journal {}: dropping {} damaged bytes after offset {}",
                path.display(),
                recovered.discarded(),
                recovered.intact_len
            );
            file.set_len(recovered.intact_len)?;
            file.sync_all()?;
        }
        let journal = Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        };
        Ok((journal, recovered))
    }

    /// Read every intact entry, stopping at the first damaged frame.
    pub fn replay(path: &Path) -> io::Result<Recovered> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Recovered::default()),
            Err(e) => return Err(e),
        };
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut recovered = Recovered {
            file_len,
            ..Recovered::default()
        };
        while let Some((entry, size)) = next_entry(&mut reader, file_len - recovered.intact_len)? {
            recovered.entries.push(entry);
            recovered.intact_len += size;
        }
        Ok(recovered)
    }

    #[cfg(test)]
    pub fn append(&mut self, entry: &JournalEntry) -> io::Result<()> {
        self.append_buffered(entry)?;
        self.flush_sync()
    }

    /// Buffer an entry without syncing. Follow with `flush_sync()`.
    pub fn append_buffered(&mut self, entry: &JournalEntry) -> io::Result<()> {
        self.writer.write_all(&frame(entry)?)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replace the file with a snapshot: written and synced beside it, then
    /// renamed over it.
    pub fn compact(&mut self, snapshot: &[JournalEntry]) -> io::Result<()> {
        self.flush_sync()?;
        let tmp_path = self.path.with_extension("journal.tmp");
        {
            let mut tmp = BufWriter::new(File::create(&tmp_path)?);
            for entry in snapshot {
                tmp.write_all(&frame(entry)?)?;
            }
            tmp.flush()?;
            tmp.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }
}

// ── Group-commit writer ──────────────────────────────────────────

enum JournalCommand {
    Append {
        entry: JournalEntry,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        entries: Vec<JournalEntry>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Handle to the background task that owns the journal file.
#[derive(Clone)]
pub struct JournalWriter {
    tx: mpsc::Sender<JournalCommand>,
}

impl JournalWriter {
    /// Spawn the writer task. Must be called inside a tokio runtime.
    pub fn spawn(journal: Journal) -> Self {
        let (tx, rx) = mpsc::channel(4096);
        tokio::spawn(writer_loop(journal, rx));
        Self { tx }
    }

    /// Durably append one entry. Resolves once the batch containing it is
    /// fsynced.
    pub async fn append(&self, entry: JournalEntry) -> io::Result<()> {
        let (response, rx) = oneshot::channel();
        self.tx
            .send(JournalCommand::Append { entry, response })
            .await
            .map_err(|_| io::Error::other("journal writer shut down"))?;
        rx.await
            .map_err(|_| io::Error::other("journal writer dropped response"))?
    }

    /// Replace the journal with `entries`.
    pub async fn compact(&self, entries: Vec<JournalEntry>) -> io::Result<()> {
        let (response, rx) = oneshot::channel();
        self.tx
            .send(JournalCommand::Compact { entries, response })
            .await
            .map_err(|_| io::Error::other("journal writer shut down"))?;
        rx.await
            .map_err(|_| io::Error::other("journal writer dropped response"))?
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (response, rx) = oneshot::channel();
        if self
            .tx
            .send(JournalCommand::AppendsSinceCompact { response })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// 1. Block until the first Append arrives.
/// 2. Drain every Append already queued behind it.
/// 3. One flush + fsync for the whole batch, then answer every sender.
async fn writer_loop(mut journal: Journal, mut rx: mpsc::Receiver<JournalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            JournalCommand::Append { entry, response } => {
                let mut batch = vec![(entry, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(JournalCommand::Append { entry, response }) => {
                            batch.push((entry, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::JOURNAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut journal, &batch);
                metrics::histogram!(crate::observability::JOURNAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut journal, other);
                }
            }
            other => handle_non_append(&mut journal, other),
        }
    }
}

fn flush_batch(
    journal: &mut Journal,
    batch: &[(JournalEntry, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err = None;
    for (entry, _) in batch {
        if let Err(e) = journal.append_buffered(entry) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so half-written bytes don't leak into
    // the next batch.
    let flush_err = journal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(
    batch: Vec<(JournalEntry, oneshot::Sender<io::Result<()>>)>,
    result: &io::Result<()>,
) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(journal: &mut Journal, cmd: JournalCommand) {
    match cmd {
        JournalCommand::Compact { entries, response } => {
            let result = journal.compact(&entries);
            let _ = response.send(result);
        }
        JournalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(journal.appends_since_compact());
        }
        JournalCommand::Append { entry, response } => {
            let result = journal
                .append_buffered(&entry)
                .and_then(|()| journal.flush_sync());
            let _ = response.send(result);
        }
    }
}
