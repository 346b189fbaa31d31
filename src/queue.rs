//! In-memory message registry for interactive work items.
//!
//! Every `POST /message` allocates a monotonic id and appends an entry here.
//! Entries are mutated only by the worker control loop and kept for the life
//! of the server process so `GET /message/:id` can answer long after
//! completion. Nothing is persisted across restarts.

use serde::{Deserialize, Serialize};

use crate::runner::RunOutcome;

/// Lifecycle of one interactive work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Queued,
    Processing,
    Done,
    Error,
}

/// One submitted prompt and its outcome.
#[derive(Debug, Clone, Serialize)]
pub struct MessageEntry {
    pub id: u64,
    pub prompt: String,
    pub status: MessageStatus,
    pub result: Option<RunOutcome>,
    pub error: Option<String>,
}

/// Monotonic-id FIFO queue plus a registry of every message ever submitted.
#[derive(Debug, Default)]
pub struct MessageQueue {
    next_id: u64,
    entries: Vec<MessageEntry>,
    pending: std::collections::VecDeque<u64>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            entries: Vec::new(),
            pending: std::collections::VecDeque::new(),
        }
    }

    /// Enqueue a prompt, returning its id.
    pub fn submit(&mut self, prompt: String) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(MessageEntry {
            id,
            prompt,
            status: MessageStatus::Queued,
            result: None,
            error: None,
        });
        self.pending.push_back(id);
        id
    }

    /// Pop the oldest queued message and mark it processing.
    pub fn take_next(&mut self) -> Option<MessageEntry> {
        let id = self.pending.pop_front()?;
        let entry = self.entry_mut(id)?;
        entry.status = MessageStatus::Processing;
        Some(entry.clone())
    }

    pub fn complete(&mut self, id: u64, result: RunOutcome) {
        if let Some(entry) = self.entry_mut(id) {
            entry.status = MessageStatus::Done;
            entry.result = Some(result);
        }
    }

    pub fn fail(&mut self, id: u64, error: String) {
        if let Some(entry) = self.entry_mut(id) {
            entry.status = MessageStatus::Error;
            entry.error = Some(error);
        }
    }

    pub fn get(&self, id: u64) -> Option<&MessageEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Number of messages still waiting to be processed.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn entry_mut(&mut self, id: u64) -> Option<&mut MessageEntry> {
        self.entries.iter_mut().find(|e| e.id == id)
    }
}
