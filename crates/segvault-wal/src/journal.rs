//! On-disk journal for one container's durable log.
//!
//! ## File Format
//!
//! A journal is a single append-only file of framed records:
//!
//! ```text
//! [Record Entry 1][Record Entry 2]...[Record Entry N]
//!
//! Record Entry:
//! ┌─────────────┬──────────┬──────────────────┐
//! │ Record Size │ CRC32    │ Payload          │
//! │ (4 bytes)   │(4 bytes) │ (bincode, N b)   │
//! └─────────────┴──────────┴──────────────────┘
//! ```
//!
//! The CRC32 covers the payload only. Recovery reads records sequentially:
//! an incomplete frame at the end of the file is a torn write from a crash
//! and is truncated away; a complete frame whose checksum does not match is
//! corruption and fails recovery.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use segvault_core::{Error, Operation, Result, SegmentSnapshot};

/// Upper bound on a single record; anything larger is treated as corruption
/// rather than allocated.
const MAX_RECORD_SIZE: u32 = 64 * 1024 * 1024;

const FRAME_HEADER_SIZE: usize = 8;

// ============================================================================
// Configuration
// ============================================================================

/// Journal configuration, embedded in the container config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalConfig {
    /// Directory holding journal files (one per container).
    #[serde(default = "default_directory")]
    pub directory: PathBuf,

    /// Sync the file after every committed batch. Disable only for tests and
    /// benchmarks; without it a crash can lose acknowledged operations.
    #[serde(default = "default_sync_on_commit")]
    pub sync_on_commit: bool,
}

fn default_directory() -> PathBuf {
    PathBuf::from("./data/journal")
}

fn default_sync_on_commit() -> bool {
    true
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            sync_on_commit: default_sync_on_commit(),
        }
    }
}

// ============================================================================
// Records
// ============================================================================

/// One durable journal entry. Everything the container must remember across
/// restarts flows through these records, in the order it happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JournalRecord {
    /// A container instance took ownership of the journal. Written once per
    /// successful start; the largest epoch on file plus one is the epoch of
    /// the next instance.
    Epoch { epoch: u64 },

    /// A segment was bound into metadata, either brand new or rehydrated
    /// from durable state after an earlier eviction.
    Map { snapshot: SegmentSnapshot },

    /// A segment binding was removed, by eviction (`deleted = false`) or by
    /// deletion (`deleted = true`).
    Unmap { segment_id: u64, deleted: bool },

    /// A durably ordered segment operation.
    Op { sequence: u64, operation: Operation },
}

// ============================================================================
// Journal
// ============================================================================

/// Append side of the journal. Owned by the log's single applier task;
/// records are staged with [`append`](Journal::append) and become durable at
/// [`commit`](Journal::commit).
pub struct Journal {
    path: PathBuf,
    file: File,
    staged: Vec<u8>,
    sync_on_commit: bool,
    size: u64,
}

impl Journal {
    /// Opens (or creates) the journal for `container_id` and reads every
    /// record currently on disk. A torn frame at the tail is logged and
    /// truncated; the returned journal is positioned to append after the
    /// last complete record.
    pub async fn open(config: &JournalConfig, container_id: u32) -> Result<(Self, Vec<JournalRecord>)> {
        tokio::fs::create_dir_all(&config.directory).await?;
        let path = config.directory.join(format!("container-{container_id}.journal"));

        let (records, valid_len, file_len) = match File::open(&path).await {
            Ok(file) => read_records(file, &path).await?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (Vec::new(), 0, 0),
            Err(e) => return Err(e.into()),
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        if valid_len < file_len {
            warn!(
                path = ?path,
                valid = valid_len,
                total = file_len,
                "Torn record at journal tail, truncating"
            );
            file.set_len(valid_len).await?;
            file.sync_data().await?;
        }

        info!(
            container_id,
            path = ?path,
            size = valid_len,
            records = records.len(),
            "Journal opened"
        );

        Ok((
            Self {
                path,
                file,
                staged: Vec::new(),
                sync_on_commit: config.sync_on_commit,
                size: valid_len,
            },
            records,
        ))
    }

    /// Serializes one record into its framed wire form.
    pub fn encode(record: &JournalRecord) -> Result<Vec<u8>> {
        let payload = bincode::serialize(record)
            .map_err(|e| Error::Serialization(format!("journal record: {e}")))?;
        if payload.len() as u64 > MAX_RECORD_SIZE as u64 {
            return Err(Error::InvalidOperation(format!(
                "journal record of {} bytes exceeds the {} byte limit",
                payload.len(),
                MAX_RECORD_SIZE
            )));
        }
        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Stages an encoded frame. Infallible, so callers can serialize first,
    /// mutate their own state, and only then stage the matching record.
    pub fn stage(&mut self, frame: Vec<u8>) {
        self.staged.extend_from_slice(&frame);
    }

    /// Encode-and-stage convenience. Nothing is durable until
    /// [`commit`](Self::commit).
    pub fn append(&mut self, record: &JournalRecord) -> Result<()> {
        let frame = Self::encode(record)?;
        self.stage(frame);
        Ok(())
    }

    /// Writes every staged record and, when configured, syncs the file. On
    /// return the staged records are durable (group commit).
    pub async fn commit(&mut self) -> Result<()> {
        if self.staged.is_empty() {
            return Ok(());
        }
        let data = std::mem::take(&mut self.staged);
        self.file.write_all(&data).await?;
        if self.sync_on_commit {
            self.file.sync_data().await?;
        }
        self.size += data.len() as u64;
        debug!(path = ?self.path, bytes = data.len(), "Journal commit");
        Ok(())
    }

    /// Bytes of committed records on disk.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Reads records sequentially until the end of the file or a torn tail.
/// Returns the records, the byte length of the valid prefix, and the total
/// file length.
async fn read_records(file: File, path: &Path) -> Result<(Vec<JournalRecord>, u64, u64)> {
    let file_len = file.metadata().await?.len();
    let mut reader = BufReader::new(file);
    let mut records = Vec::new();
    let mut valid_len = 0u64;

    loop {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        match reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }

        let record_size = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let stored_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        if record_size > MAX_RECORD_SIZE {
            return Err(Error::JournalCorrupted(format!(
                "{}: record of {} bytes at offset {} exceeds the {} byte limit",
                path.display(),
                record_size,
                valid_len,
                MAX_RECORD_SIZE
            )));
        }

        let mut payload = vec![0u8; record_size as usize];
        match reader.read_exact(&mut payload).await {
            Ok(_) => {}
            // The frame header made it to disk but the payload did not:
            // torn write, recoverable.
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }

        if crc32fast::hash(&payload) != stored_crc {
            return Err(Error::JournalCorrupted(format!(
                "{}: checksum mismatch at offset {}",
                path.display(),
                valid_len
            )));
        }

        let record: JournalRecord = bincode::deserialize(&payload).map_err(|e| {
            Error::JournalCorrupted(format!(
                "{}: undecodable record at offset {}: {e}",
                path.display(),
                valid_len
            ))
        })?;

        records.push(record);
        valid_len += (FRAME_HEADER_SIZE + record_size as usize) as u64;
    }

    Ok((records, valid_len, file_len))
}

// ============================================================================
// Tests
// ============================================================================
