//! Append-only action log used for post-session analysis.
//!
//! The relay hands entries to an [`ActionSink`] and moves on. Writes happen
//! on a background task; a failing write is reported to the operational log
//! and never reaches the relay's control flow.

use log::{error, info};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

/// One recorded action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionEntry {
    pub session_id: String,
    pub round_num: Option<u32>,
    pub player_id: String,
    pub action_type: String,
    pub action_data: Value,
    pub game_instance: String,
    pub timestamp_ms: u64,
}

/// Write-only destination for action entries. Must not block.
pub trait ActionSink: Send {
    fn record(&self, entry: ActionEntry);
}

/// Discards every entry
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ActionSink for NullSink {
    fn record(&self, _entry: ActionEntry) {}
}

/// Keeps entries in memory, for inspection
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    entries: Arc<Mutex<Vec<ActionEntry>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<ActionEntry> {
        match self.entries.lock() {
            Ok(entries) => entries.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Entries whose action type is `action_type`
    pub fn of_type(&self, action_type: &str) -> Vec<ActionEntry> {
        self.entries()
            .into_iter()
            .filter(|entry| entry.action_type == action_type)
            .collect()
    }
}

impl ActionSink for MemorySink {
    fn record(&self, entry: ActionEntry) {
        match self.entries.lock() {
            Ok(mut entries) => entries.push(entry),
            Err(poisoned) => poisoned.into_inner().push(entry),
        }
    }
}

/// Appends entries as JSON lines to a file from a background task
#[derive(Debug, Clone)]
pub struct JsonLinesSink {
    tx: mpsc::UnboundedSender<ActionEntry>,
}

impl JsonLinesSink {
    /// Spawns the writer task. Must be called from within a tokio runtime.
    pub fn spawn(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_entries(path, rx));
        Self { tx }
    }
}

impl ActionSink for JsonLinesSink {
    fn record(&self, entry: ActionEntry) {
        if self.tx.send(entry).is_err() {
            error!("Action log writer has stopped, dropping entry");
        }
    }
}

async fn write_entries(path: PathBuf, mut rx: mpsc::UnboundedReceiver<ActionEntry>) {
    let mut file = match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
    {
        Ok(file) => {
            info!("Writing action log to {}", path.display());
            file
        }
        Err(e) => {
            error!("Failed to open action log {}: {}", path.display(), e);
            // Keep draining so senders never observe the failure.
            while rx.recv().await.is_some() {}
            return;
        }
    };

    while let Some(entry) = rx.recv().await {
        let mut line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to serialize action entry: {}", e);
                continue;
            }
        };
        line.push('\n');

        if let Err(e) = file.write_all(line.as_bytes()).await {
            error!("Action log write failed: {}", e);
            continue;
        }
        if let Err(e) = file.flush().await {
            error!("Failed to flush action log: {}", e);
        }
    }
}
