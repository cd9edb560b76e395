//! Durable FIFO of changes waiting for delivery.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

use offsync_common::{ChangeRecord, Error, Result, SequenceNumber};

/// On-disk format version of the queue file.
const QUEUE_FORMAT_VERSION: u32 = 1;

/// Serialized form of the queue.
#[derive(Debug, Serialize, Deserialize)]
struct QueueFile {
    version: u32,
    next_sequence: SequenceNumber,
    high_water: SequenceNumber,
    records: Vec<ChangeRecord>,
}

/// Ordered queue of changes not yet acknowledged by the remote.
///
/// `enqueue` is the only operation that adds records and
/// `acknowledge_up_to` the only one that removes them, so the queue is always
/// an exact record of work captured but not confirmed delivered. Records are
/// contiguous: they cover `high_water + 1 ..= next_sequence - 1`.
#[derive(Debug)]
pub struct PendingQueue {
    records: VecDeque<ChangeRecord>,
    next_sequence: SequenceNumber,
    high_water: SequenceNumber,
    capacity: usize,
    /// Where the queue is persisted, if anywhere.
    path: Option<PathBuf>,
}

impl PendingQueue {
    /// Create a queue that lives only in memory.
    pub fn in_memory(capacity: usize) -> Self {
        Self {
            records: VecDeque::new(),
            next_sequence: SequenceNumber::FIRST,
            high_water: SequenceNumber::ZERO,
            capacity,
            path: None,
        }
    }

    /// Open a persisted queue, creating an empty one if the file is missing.
    ///
    /// # Errors
    /// - I/O errors reading the file or creating its directory
    /// - `Error::Serialization` if the file is unreadable or inconsistent
    pub async fn open(path: impl AsRef<Path>, capacity: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if !fs::try_exists(&path).await.map_err(Error::Io)? {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent).await.map_err(Error::Io)?;
                }
            }
            debug!("No queue file at {}, starting empty", path.display());
            let mut queue = Self::in_memory(capacity);
            queue.path = Some(path);
            return Ok(queue);
        }

        let content = fs::read_to_string(&path).await.map_err(Error::Io)?;
        let file: QueueFile = serde_json::from_str(&content).map_err(|e| {
            Error::Serialization(format!("Invalid queue file {}: {}", path.display(), e))
        })?;

        if file.version != QUEUE_FORMAT_VERSION {
            return Err(Error::Serialization(format!(
                "Unsupported queue format version {} in {}",
                file.version,
                path.display()
            )));
        }

        Self::validate(&file)
            .map_err(|msg| Error::Serialization(format!("Corrupt queue file {}: {}", path.display(), msg)))?;

        info!(
            "Loaded {} pending changes from {}",
            file.records.len(),
            path.display()
        );

        Ok(Self {
            records: file.records.into(),
            next_sequence: file.next_sequence,
            high_water: file.high_water,
            capacity,
            path: Some(path),
        })
    }

    /// Check the contiguity invariant of a loaded file.
    fn validate(file: &QueueFile) -> std::result::Result<(), String> {
        if file.next_sequence <= file.high_water {
            return Err(format!(
                "next sequence {} is not above high-water mark {}",
                file.next_sequence, file.high_water
            ));
        }
        let mut expected = file.high_water.next();
        for record in &file.records {
            if record.sequence != expected {
                return Err(format!(
                    "expected record {}, found {}",
                    expected, record.sequence
                ));
            }
            expected = expected.next();
        }
        if expected != file.next_sequence {
            return Err(format!(
                "records end before next sequence {}",
                file.next_sequence
            ));
        }
        Ok(())
    }

    /// Append a change and return its sequence number.
    ///
    /// # Errors
    /// - `Error::Capacity` when the queue is full
    /// - I/O errors persisting the queue; the change is not kept in that case
    pub async fn enqueue(&mut self, payload: serde_json::Value) -> Result<SequenceNumber> {
        if self.records.len() >= self.capacity {
            return Err(Error::Capacity(format!(
                "pending queue is full ({} records)",
                self.capacity
            )));
        }

        let sequence = self.next_sequence;
        self.records.push_back(ChangeRecord::new(sequence, payload));
        self.next_sequence = sequence.next();

        if let Err(e) = self.persist().await {
            // Nobody has seen this sequence number yet, so it can be handed out again.
            self.records.pop_back();
            self.next_sequence = sequence;
            return Err(e);
        }

        debug!("Enqueued change {}", sequence);
        Ok(sequence)
    }

    /// Copy of every undelivered record, lowest sequence first.
    pub fn snapshot(&self) -> Vec<ChangeRecord> {
        self.records.iter().cloned().collect()
    }

    /// Remove every record with sequence <= `sequence`.
    ///
    /// Returns how many records were removed. Acknowledging a range that is
    /// already cleared is a no-op. The high-water mark never moves backwards
    /// and never passes the last assigned sequence number.
    pub async fn acknowledge_up_to(&mut self, sequence: SequenceNumber) -> Result<usize> {
        let sequence = sequence.min(self.next_sequence.prev());
        if sequence <= self.high_water {
            return Ok(0);
        }

        let mut removed = 0;
        while self
            .records
            .front()
            .is_some_and(|record| record.sequence <= sequence)
        {
            self.records.pop_front();
            removed += 1;
        }
        self.high_water = sequence;

        self.persist().await?;
        debug!("Acknowledged {} changes up to {}", removed, sequence);
        Ok(removed)
    }

    /// Number of undelivered records.
    pub fn size(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Highest sequence number known to be delivered.
    pub fn high_water(&self) -> SequenceNumber {
        self.high_water
    }

    /// Sequence number the next enqueued record will get.
    pub fn next_sequence(&self) -> SequenceNumber {
        self.next_sequence
    }

    /// Backing file, if the queue is persisted.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Write the queue to disk via a temporary file and rename.
    async fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let file = QueueFile {
            version: QUEUE_FORMAT_VERSION,
            next_sequence: self.next_sequence,
            high_water: self.high_water,
            records: self.records.iter().cloned().collect(),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| Error::Serialization(e.to_string()))?;

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json).await.map_err(Error::Io)?;
        fs::rename(&tmp, path).await.map_err(Error::Io)
    }
}
