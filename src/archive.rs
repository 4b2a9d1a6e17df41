//! Best-effort record of finished work, written after the live state has moved on.
//!
//! Rooms hand records to an [`Archive`] without waiting. A writer task drains them
//! into a [`GameArchive`] backend; a failed write is logged and dropped, so the
//! realtime path never depends on storage.

use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::types::GameType;
use crate::validation::Payload;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("persistence failure: {0}")]
    PersistenceFailure(#[from] std::io::Error),
    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One persisted fact, keyed by room code and round number.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ArchiveRecord {
    GameStarted {
        room_code: String,
        game_type: GameType,
        /// Absent for open games, which have no round flow.
        total_rounds: Option<u32>,
        state: serde_json::Value,
        at: u64,
    },
    Submission {
        room_code: String,
        round: u32,
        prompt: Option<String>,
        player_name: String,
        content: Payload,
        at: u64,
    },
    Vote {
        room_code: String,
        round: u32,
        voter_name: String,
        ballot: Payload,
        at: u64,
    },
    RoundAdvanced {
        room_code: String,
        current_round: u32,
        state: serde_json::Value,
        at: u64,
    },
}

/// Storage backend for archive records.
pub trait GameArchive: Send + Sync {
    fn store(&self, record: ArchiveRecord) -> BoxFuture<'static, Result<(), ArchiveError>>;
}

/// Appends one JSON document per line to a file.
pub struct JsonlArchive {
    path: PathBuf,
}

impl JsonlArchive {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl GameArchive for JsonlArchive {
    fn store(&self, record: ArchiveRecord) -> BoxFuture<'static, Result<(), ArchiveError>> {
        let path = self.path.clone();
        Box::pin(async move {
            let mut line = serde_json::to_vec(&record)?;
            line.push(b'\n');
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            file.write_all(&line).await?;
            file.flush().await?;
            Ok(())
        })
    }
}

/// Cheap, cloneable sender side handed to every room.
#[derive(Clone, Default)]
pub struct Archive {
    tx: Option<mpsc::UnboundedSender<ArchiveRecord>>,
}

impl Archive {
    /// An archive that discards everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Start the writer task for `backend`. Must be called inside a tokio runtime.
    pub fn spawn(backend: Arc<dyn GameArchive>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<ArchiveRecord>();
        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                if let Err(err) = backend.store(record).await {
                    warn!(error = %err, "archive write failed; continuing in-memory");
                }
            }
            debug!("archive writer stopped");
        });
        Self { tx: Some(tx) }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Queue a record. Never blocks and never fails the caller.
    pub fn record(&self, record: ArchiveRecord) {
        if let Some(tx) = &self.tx {
            if tx.send(record).is_err() {
                warn!("archive writer is gone; dropping record");
            }
        }
    }
}
