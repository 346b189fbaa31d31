//! Persisted environment state: the single-environment state file and the
//! append-only multi-environment registry log.
//!
//! The registry is newline-delimited JSON, one record per environment ever
//! started. A stop rewrites the matching record in place. Every
//! read-modify-write runs under an exclusive `fs2` lock so concurrent CLI
//! invocations serialize instead of corrupting a line. The `stopped_at`
//! field is declared state only; liveness is re-verified by probing before
//! the registry is trusted (entries go stale when probing was skipped).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

/// How a client reaches the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Local,
    Remote,
}

/// Identity of one running execution environment. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentState {
    pub name: String,
    pub transport: Transport,
    pub base_url: String,
    /// Transport-specific routing token (machine instance id for remote).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing_token: Option<String>,
}

/// One registry record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    #[serde(flatten)]
    pub state: AgentState,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
}

impl RegistryEntry {
    pub fn live(&self) -> bool {
        self.stopped_at.is_none()
    }
}

/// Append-only NDJSON registry with locked in-place stop rewrites.
#[derive(Debug, Clone)]
pub struct Registry {
    path: PathBuf,
}

impl Registry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record for a freshly started environment.
    pub fn append(&self, state: &AgentState) -> Result<()> {
        let entry = RegistryEntry {
            state: state.clone(),
            started_at: Utc::now(),
            stopped_at: None,
        };
        let mut file = self.open_locked()?;
        file.seek(SeekFrom::End(0))?;
        let line = serde_json::to_string(&entry)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// Every record, oldest first. Unparseable lines are skipped (a torn
    /// write from a crashed process must not poison the whole registry).
    pub fn entries(&self) -> Result<Vec<RegistryEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let mut file = self.open_locked()?;
        Ok(read_entries(&mut file)?)
    }

    /// Entries started within `window` that are not marked stopped.
    pub fn recent_live(&self, window: Duration) -> Result<Vec<RegistryEntry>> {
        let cutoff = Utc::now() - window;
        Ok(self
            .entries()?
            .into_iter()
            .filter(|e| e.live() && e.started_at >= cutoff)
            .collect())
    }

    /// Mark the most recent un-stopped entry for `name` (or the most recent
    /// entry overall when `name` is None) as stopped, rewriting its record
    /// in place. Returns the updated entry, or None if nothing matched.
    pub fn mark_stopped(&self, name: Option<&str>) -> Result<Option<RegistryEntry>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let mut file = self.open_locked()?;
        let mut entries = read_entries(&mut file)?;

        let index = match name {
            Some(name) => entries
                .iter()
                .rposition(|e| e.live() && e.state.name == name),
            None => (!entries.is_empty()).then(|| entries.len() - 1),
        };
        let Some(index) = index else {
            return Ok(None);
        };
        if entries[index].stopped_at.is_some() {
            return Ok(Some(entries[index].clone()));
        }
        entries[index].stopped_at = Some(Utc::now());

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        for entry in &entries {
            writeln!(file, "{}", serde_json::to_string(entry)?)?;
        }
        Ok(Some(entries[index].clone()))
    }

    fn open_locked(&self) -> Result<File> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .with_context(|| format!("Failed to open registry {}", self.path.display()))?;
        file.lock_exclusive()
            .context("Failed to lock registry file")?;
        Ok(file)
    }
}

fn read_entries(file: &mut File) -> Result<Vec<RegistryEntry>> {
    let mut content = String::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_string(&mut content)?;
    Ok(content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}

/// Single-environment convenience state: overwritten on start, deleted on
/// stop, read by the `status` command.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn save(&self, state: &AgentState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(state)?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("Failed to write state file {}", self.path.display()))
    }

    pub fn load(&self) -> Result<Option<AgentState>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read state file {}", self.path.display()))?;
        Ok(Some(serde_json::from_str(&content).with_context(|| {
            format!("Failed to parse state file {}", self.path.display())
        })?))
    }

    pub fn clear(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)
                .with_context(|| format!("Failed to remove {}", self.path.display()))?;
        }
        Ok(())
    }
}
