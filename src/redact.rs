//! Secret redaction for the log pipeline.
//!
//! Every secret value forwarded into the execution environment must be
//! substituted before a line is buffered, displayed, or written to disk.
//! Redaction happens at the single [`crate::logs::LogSink`] choke point, so
//! there is no code path that can leak a configured secret into output.

use serde_json::Value;

const REDACTED: &str = "[REDACTED]";

/// Minimum secret length worth redacting. Shorter values (e.g. "1", "true")
/// would shred unrelated output.
const MIN_SECRET_LEN: usize = 6;

/// Replaces known secret values with a redaction marker.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    secrets: Vec<String>,
}

impl Redactor {
    /// Build a redactor from secret values. Empty and very short values are
    /// ignored; longer secrets are substituted first so a secret that
    /// contains another secret as a substring redacts cleanly.
    pub fn new<I, S>(secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut secrets: Vec<String> = secrets
            .into_iter()
            .map(Into::into)
            .filter(|s| s.len() >= MIN_SECRET_LEN)
            .collect();
        secrets.sort();
        secrets.dedup();
        secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));
        Self { secrets }
    }

    /// Substitute every configured secret in `line` with `[REDACTED]`.
    /// Idempotent: redacting an already-redacted line is a no-op.
    pub fn redact(&self, line: &str) -> String {
        let mut out = line.to_string();
        for secret in &self.secrets {
            out = out.replace(secret.as_str(), REDACTED);
        }
        out
    }

    /// Substitute secrets in every string leaf of a JSON tree, in place.
    /// Buffered events are transmitted verbatim over `/events`, so they get
    /// the same treatment as log lines.
    pub fn redact_value(&self, value: &mut Value) {
        if self.secrets.is_empty() {
            return;
        }
        match value {
            Value::String(s) => {
                if self.secrets.iter().any(|secret| s.contains(secret.as_str())) {
                    *s = self.redact(s);
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.redact_value(item);
                }
            }
            Value::Object(map) => {
                for item in map.values_mut() {
                    self.redact_value(item);
                }
            }
            _ => {}
        }
    }
}
