//! Durable commit journal for a pool table
//!
//! Every committed transaction appends exactly one batch holding the new
//! versions of the rows it changed. A batch is written with a single
//! `write_all` followed by `sync_all`, and carries a length prefix and a
//! checksum, so recovery either sees the whole batch or stops before it.
//!
//! # Format
//!
//! ```text
//! [u32 len][json JournalBatch][u32 checksum]   ← commit 1
//! [u32 len][json JournalBatch][u32 checksum]   ← commit 2
//! ...
//! ```
//!
//! Recovery replays batches in order; the last version of a row wins.
//! Compaction replaces the file with one snapshot batch.

use super::slot::{Slot, SlotId};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const HEADER_LEN: usize = 4;
const TRAILER_LEN: usize = 4;

/// Rows changed by one committed transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalBatch {
    /// Monotonically increasing within one journal file
    pub sequence: u64,
    /// Commit time (milliseconds since epoch)
    pub timestamp_ms: i64,
    pub rows: Vec<Slot>,
}

impl JournalBatch {
    pub fn new(sequence: u64, rows: Vec<Slot>) -> Self {
        Self {
            sequence,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            rows,
        }
    }

    /// Encode as `[len][json][checksum]`
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(self)
            .map_err(|e| Error::Storage(format!("Failed to serialize journal batch: {}", e)))?;
        let len = u32::try_from(json.len())
            .map_err(|_| Error::Storage(format!("Journal batch too large: {} bytes", json.len())))?;

        let mut out = Vec::with_capacity(json.len() + HEADER_LEN + TRAILER_LEN);
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&json);
        out.extend_from_slice(&checksum(&json).to_le_bytes());
        Ok(out)
    }

    /// Decode one record from the front of `bytes`
    ///
    /// Returns the batch and the number of bytes it occupied.
    pub fn from_bytes(bytes: &[u8]) -> Result<(Self, usize)> {
        if bytes.len() < HEADER_LEN + TRAILER_LEN {
            return Err(Error::Storage("Journal record too short".to_string()));
        }

        let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let total = HEADER_LEN + len + TRAILER_LEN;
        if bytes.len() < total {
            return Err(Error::Storage(format!(
                "Incomplete journal record: expected {} bytes, got {}",
                total,
                bytes.len()
            )));
        }

        let json = &bytes[HEADER_LEN..HEADER_LEN + len];
        let trailer = &bytes[HEADER_LEN + len..total];
        let stored = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        if stored != checksum(json) {
            return Err(Error::Storage("Journal checksum mismatch".to_string()));
        }

        let batch = serde_json::from_slice(json)
            .map_err(|e| Error::Storage(format!("Failed to deserialize journal batch: {}", e)))?;
        Ok((batch, total))
    }
}

fn checksum(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(0x811c_9dc5u32, |acc, &b| (acc ^ b as u32).wrapping_mul(0x0100_0193))
}

/// State rebuilt from a journal file
#[derive(Debug, Default)]
pub struct Recovered {
    /// Latest version of every row mentioned in the journal
    pub rows: BTreeMap<SlotId, Slot>,
    pub batches: u64,
}

/// Append-only journal file
pub struct SlotJournal {
    path: PathBuf,
    file: File,
    /// End of the last fully written batch
    len: u64,
    next_sequence: u64,
    batches_since_compact: u64,
    /// Set when the file could not be restored after a failed write; only a
    /// successful compaction clears it
    failed: Option<String>,
}

impl std::fmt::Debug for SlotJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotJournal")
            .field("path", &self.path)
            .field("len", &self.len)
            .field("next_sequence", &self.next_sequence)
            .field("failed", &self.failed)
            .finish()
    }
}

impl SlotJournal {
    /// Open (creating if needed) a journal and replay it
    pub fn open<P: AsRef<Path>>(path: P) -> Result<(Self, Recovered)> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Storage(format!("Failed to create journal dir: {}", e)))?;
        }

        let (recovered, valid_len, next_sequence) = Self::recover(&path)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::Storage(format!("Failed to open journal: {}", e)))?;

        let on_disk = file
            .metadata()
            .map_err(|e| Error::Storage(format!("Failed to stat journal: {}", e)))?
            .len();
        if on_disk > valid_len {
            warn!(
                path = ?path,
                discarded = on_disk - valid_len,
                "Truncating torn journal tail"
            );
            file.set_len(valid_len)
                .map_err(|e| Error::Storage(format!("Failed to truncate journal: {}", e)))?;
        }

        let journal = Self {
            path,
            file,
            len: valid_len,
            next_sequence,
            batches_since_compact: recovered.batches,
            failed: None,
        };
        Ok((journal, recovered))
    }

    fn recover(path: &Path) -> Result<(Recovered, u64, u64)> {
        if !path.exists() {
            info!(path = ?path, "No journal found, starting fresh");
            return Ok((Recovered::default(), 0, 0));
        }

        let bytes = std::fs::read(path)
            .map_err(|e| Error::Storage(format!("Failed to read journal: {}", e)))?;

        let mut recovered = Recovered::default();
        let mut offset = 0usize;
        let mut max_sequence = None;

        while offset < bytes.len() {
            match JournalBatch::from_bytes(&bytes[offset..]) {
                Ok((batch, used)) => {
                    for row in batch.rows {
                        recovered.rows.insert(row.id, row);
                    }
                    max_sequence = Some(max_sequence.map_or(batch.sequence, |m: u64| m.max(batch.sequence)));
                    recovered.batches += 1;
                    offset += used;
                }
                Err(e) => {
                    warn!(path = ?path, offset, error = %e, "Stopping journal replay at corrupt record");
                    break;
                }
            }
        }

        let next_sequence = max_sequence.map_or(0, |m| m + 1);
        info!(
            path = ?path,
            batches = recovered.batches,
            rows = recovered.rows.len(),
            next_sequence,
            "Journal recovery complete"
        );
        Ok((recovered, offset as u64, next_sequence))
    }

    /// Durably append one batch; returns its sequence number
    ///
    /// On failure the file is cut back to the last complete batch, so a
    /// rejected commit never reappears on replay and later batches never
    /// land behind torn bytes.
    pub fn append(&mut self, rows: Vec<Slot>) -> Result<u64> {
        if let Some(reason) = &self.failed {
            return Err(Error::Storage(format!(
                "Journal {} is unusable: {}",
                self.path.display(),
                reason
            )));
        }

        let sequence = self.next_sequence;
        let entries = rows.len();
        let bytes = JournalBatch::new(sequence, rows).to_bytes()?;

        self.discard_torn_tail()?;

        let written = self
            .file
            .write_all(&bytes)
            .map_err(|e| format!("Failed to write journal batch: {}", e))
            .and_then(|()| {
                self.file
                    .sync_all()
                    .map_err(|e| format!("Failed to sync journal: {}", e))
            });
        if let Err(message) = written {
            self.restore_len(&message);
            return Err(Error::Storage(message));
        }

        self.len += bytes.len() as u64;
        self.next_sequence += 1;
        self.batches_since_compact += 1;
        debug!(sequence, entries, "Appended journal batch");
        Ok(sequence)
    }

    /// Drop bytes past the last complete batch left by an earlier failure
    fn discard_torn_tail(&mut self) -> Result<()> {
        let on_disk = self
            .file
            .metadata()
            .map_err(|e| Error::Storage(format!("Failed to stat journal: {}", e)))?
            .len();
        if on_disk != self.len {
            warn!(
                path = ?self.path,
                expected = self.len,
                on_disk,
                "Journal length changed outside a commit, truncating"
            );
            self.file
                .set_len(self.len)
                .and_then(|()| self.file.sync_all())
                .map_err(|e| Error::Storage(format!("Failed to truncate journal: {}", e)))?;
        }
        Ok(())
    }

    /// Cut the file back to the last complete batch after a failed write
    fn restore_len(&mut self, cause: &str) {
        if let Err(e) = self.file.set_len(self.len).and_then(|()| self.file.sync_all()) {
            let reason = format!("{}; rollback to {} bytes failed: {}", cause, self.len, e);
            warn!(path = ?self.path, error = %reason, "Journal marked unusable");
            self.failed = Some(reason);
        }
    }

    /// Replace the journal with a single snapshot batch
    pub fn compact(&mut self, snapshot: Vec<Slot>) -> Result<()> {
        info!(path = ?self.path, rows = snapshot.len(), "Compacting journal");

        let temp_path = self.path.with_extension("journal.tmp");
        let bytes = JournalBatch::new(0, snapshot).to_bytes()?;
        {
            let mut temp = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&temp_path)
                .map_err(|e| Error::Storage(format!("Failed to create compacted journal: {}", e)))?;
            temp.write_all(&bytes)
                .map_err(|e| Error::Storage(format!("Failed to write compacted journal: {}", e)))?;
            temp.sync_all()
                .map_err(|e| Error::Storage(format!("Failed to sync compacted journal: {}", e)))?;
        }

        std::fs::rename(&temp_path, &self.path)
            .map_err(|e| Error::Storage(format!("Failed to replace journal: {}", e)))?;

        // the old handle now points at the unlinked file
        let reopened = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .or_else(|_| OpenOptions::new().append(true).open(&self.path));
        match reopened {
            Ok(file) => self.file = file,
            Err(e) => {
                let reason = format!("Failed to reopen compacted journal: {}", e);
                warn!(path = ?self.path, error = %reason, "Journal marked unusable");
                self.failed = Some(reason.clone());
                return Err(Error::Storage(reason));
            }
        }
        self.len = bytes.len() as u64;
        self.next_sequence = 1;
        self.batches_since_compact = 1;
        self.failed = None;

        info!("Journal compaction complete");
        Ok(())
    }

    /// Whether appends are refused until the next successful compaction
    pub fn is_failed(&self) -> bool {
        self.failed.is_some()
    }

    pub fn batches_since_compact(&self) -> u64 {
        self.batches_since_compact
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
