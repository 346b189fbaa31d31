//! Rendering of raw agent stream events into human-readable log lines.

use serde_json::Value;

/// Render one stream event to a console line, or `None` for events that have
/// no useful human rendering (system notices, empty deltas).
pub fn render_event(value: &Value) -> Option<String> {
    match value.get("type").and_then(|t| t.as_str())? {
        "assistant" => {
            let content = value.get("message")?.get("content")?.as_array()?;
            let mut parts = Vec::new();
            for block in content {
                match block.get("type").and_then(|t| t.as_str()) {
                    Some("text") => {
                        if let Some(text) = block.get("text").and_then(|t| t.as_str())
                            && !text.trim().is_empty()
                        {
                            parts.push(text.trim().to_string());
                        }
                    }
                    Some("tool_use") => {
                        let name = block.get("name").and_then(|n| n.as_str()).unwrap_or("tool");
                        let input = block.get("input").cloned().unwrap_or(Value::Null);
                        parts.push(describe_tool_use(name, &input));
                    }
                    _ => {}
                }
            }
            if parts.is_empty() {
                None
            } else {
                Some(parts.join("\n"))
            }
        }
        "result" => {
            let cost = value
                .get("total_cost_usd")
                .and_then(|c| c.as_f64())
                .unwrap_or(0.0);
            let turns = value.get("num_turns").and_then(|n| n.as_u64()).unwrap_or(0);
            Some(format!("-- result: {turns} turns, ${cost:.4}"))
        }
        _ => None,
    }
}

/// Extract a one-line description from a tool-use block.
pub fn describe_tool_use(name: &str, input: &Value) -> String {
    match name {
        "Read" | "Write" | "Edit" => {
            let path = input
                .get("file_path")
                .and_then(|v| v.as_str())
                .map(shorten_path)
                .unwrap_or_else(|| "file".to_string());
            let verb = match name {
                "Read" => "Reading",
                "Write" => "Writing",
                _ => "Editing",
            };
            format!("{verb}: {path}")
        }
        "Bash" => {
            let cmd = input
                .get("command")
                .and_then(|v| v.as_str())
                .map(|s| truncate_str(s, 60))
                .unwrap_or_else(|| "command".to_string());
            format!("Running: {cmd}")
        }
        "Glob" | "Grep" => {
            let pattern = input
                .get("pattern")
                .and_then(|v| v.as_str())
                .map(|s| truncate_str(s, 40))
                .unwrap_or_else(|| "pattern".to_string());
            format!("Searching: {pattern}")
        }
        _ => name.to_string(),
    }
}

/// Shorten a file path to its last two components.
fn shorten_path(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() <= 2 {
        path.to_string()
    } else {
        parts[parts.len() - 2..].join("/")
    }
}

/// Truncate a string with an ellipsis.
pub fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}

/// Derive a bounded one-line commit summary from a prompt or group label.
pub fn commit_summary(label: &str) -> String {
    let first_line = label.lines().next().unwrap_or(label).trim();
    truncate_str(first_line, 72)
}
