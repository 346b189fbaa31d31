//! Redacted log sink: the single choke point for user-visible agent output.
//!
//! Each line is redacted once, then fanned out to the in-memory log buffer
//! (served by `GET /logs`) and to the current log file. At iteration
//! boundaries the worker archives the current file under a timestamped name
//! so historical logs are distinguishable from the in-progress one.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;

use crate::buffer::OffsetBuffer;
use crate::redact::Redactor;

const CURRENT_LOG_NAME: &str = "agent.log";

pub struct LogSink {
    redactor: Redactor,
    buffer: Mutex<OffsetBuffer<String>>,
    log_dir: Option<PathBuf>,
}

impl LogSink {
    /// A sink that writes the redacted stream to `log_dir/agent.log` in
    /// addition to the in-memory buffer.
    pub fn new(redactor: Redactor, log_dir: Option<PathBuf>) -> Result<Self> {
        if let Some(dir) = &log_dir {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
        }
        Ok(Self {
            redactor,
            buffer: Mutex::new(OffsetBuffer::new()),
            log_dir,
        })
    }

    pub fn redactor(&self) -> &Redactor {
        &self.redactor
    }

    /// In-memory only, no file. Used in tests and by client-side tailing.
    pub fn memory(redactor: Redactor) -> Self {
        Self {
            redactor,
            buffer: Mutex::new(OffsetBuffer::new()),
            log_dir: None,
        }
    }

    /// Redact and record one line.
    pub fn line(&self, line: &str) {
        let clean = self.redactor.redact(line);
        if let Some(dir) = &self.log_dir
            && let Err(e) = append_line(&dir.join(CURRENT_LOG_NAME), &clean)
        {
            tracing::warn!("failed to append to log file: {e:#}");
        }
        if let Ok(mut buf) = self.buffer.lock() {
            buf.push(clean);
        }
    }

    /// Read the log stream from `offset`, returning lines and the new cursor.
    pub fn since(&self, offset: usize) -> (Vec<String>, usize) {
        match self.buffer.lock() {
            Ok(buf) => buf.since(offset),
            Err(_) => (Vec::new(), offset),
        }
    }

    /// Rename the current log file to a timestamped name so the next
    /// iteration starts a fresh one. Missing file is fine (nothing logged
    /// yet this iteration).
    pub fn archive(&self) -> Result<()> {
        let Some(dir) = &self.log_dir else {
            return Ok(());
        };
        let current = dir.join(CURRENT_LOG_NAME);
        if !current.exists() {
            return Ok(());
        }
        let stamp = Utc::now().format("%Y%m%dT%H%M%S");
        let archived = dir.join(format!("agent-{stamp}.log"));
        std::fs::rename(&current, &archived)
            .with_context(|| format!("Failed to archive log file to {}", archived.display()))?;
        Ok(())
    }
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")?;
    Ok(())
}
