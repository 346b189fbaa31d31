//! Durable FIFO of background work groups.
//!
//! A group names a strategy document and a list of jobs; the worker consumes
//! one group at a time when no interactive message is queued. The backing
//! store is a single JSON document rewritten on each dequeue. Groups that
//! never signal completion are retried a bounded number of times and then
//! dequeued anyway so one stuck group cannot block the backlog forever.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Retries before a group that never signals completion is skipped.
pub const MAX_GROUP_RETRIES: u32 = 3;

/// Sentinel the agent must emit in its result text to mark a group done.
pub const COMPLETION_SENTINEL: &str = "ALL JOBS COMPLETE";

/// One batch of background jobs plus the strategy document that guides them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Group {
    pub strategy: String,
    pub jobs: Vec<String>,
    pub timestamp: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BacklogFile {
    groups: Vec<Group>,
}

/// File-backed group queue. Missing file reads as empty.
#[derive(Debug)]
pub struct Backlog {
    path: PathBuf,
}

impl Backlog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The oldest group, without removing it.
    pub fn peek(&self) -> Result<Option<Group>> {
        Ok(self.read()?.groups.into_iter().next())
    }

    /// Remove and return the oldest group.
    pub fn dequeue(&self) -> Result<Option<Group>> {
        let mut file = self.read()?;
        if file.groups.is_empty() {
            return Ok(None);
        }
        let group = file.groups.remove(0);
        self.write(&file)?;
        Ok(Some(group))
    }

    /// Append a group to the end of the queue.
    pub fn enqueue(&self, group: Group) -> Result<()> {
        let mut file = self.read()?;
        file.groups.push(group);
        self.write(&file)
    }

    pub fn pending(&self) -> Result<usize> {
        Ok(self.read()?.groups.len())
    }

    fn read(&self) -> Result<BacklogFile> {
        if !self.path.exists() {
            return Ok(BacklogFile::default());
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read backlog {}", self.path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse backlog {}", self.path.display()))
    }

    fn write(&self, file: &BacklogFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(file)?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("Failed to write backlog {}", self.path.display()))
    }
}

/// Build the single prompt instructing the agent to complete all jobs in a
/// group and signal completion with the sentinel.
pub fn group_prompt(group: &Group) -> String {
    let mut prompt = format!(
        "Follow the strategy in {} and complete every job below.\n",
        group.strategy
    );
    for (i, job) in group.jobs.iter().enumerate() {
        prompt.push_str(&format!("{}. {}\n", i + 1, job));
    }
    prompt.push_str(&format!(
        "\nWhen every job is finished, end your final message with the exact text: {COMPLETION_SENTINEL}"
    ));
    prompt
}

/// Whether a result text carries the completion sentinel.
pub fn signals_completion(result: &str) -> bool {
    result.to_uppercase().contains(COMPLETION_SENTINEL)
}
