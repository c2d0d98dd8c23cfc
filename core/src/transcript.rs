//! Turn extraction from a structured agent transcript.
//!
//! The host agent records each session as line-delimited JSON. Only plain
//! user/assistant text survives extraction; tool calls, tool results,
//! thinking blocks, and sidechain records are discarded.

use std::io::BufRead;
use std::io::BufReader;
use std::path::Path;

use serde_json::Value;
use tracing::debug;

use crate::error::MemoryBankError;
use crate::error::Result;
use crate::models::SpeakerRole;

/// One kept transcript record: who said it, what they said, and when.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEntry {
    pub role: SpeakerRole,
    pub text: String,
    /// Seconds since epoch; 0.0 when the transcript carries no timestamps.
    pub timestamp: f64,
}

/// User content beginning with one of these is host-agent plumbing, not a
/// message the user typed.
const WRAPPER_PREFIXES: &[&str] = &[
    "<command-",
    "<local-command-",
    "<task-notification>",
    "<system-reminder>",
    "<bash-input>",
    "<bash-stdout>",
    "<bash-stderr>",
];

/// Parse a transcript file into ordered entries.
///
/// Fails with [`MemoryBankError::TranscriptMalformed`] when a non-empty file
/// yields no usable text records. An empty file yields an empty list.
pub fn extract_entries(path: &Path) -> Result<Vec<TranscriptEntry>> {
    let file = std::fs::File::open(path)?;
    let reader = BufReader::new(file);

    let mut entries: Vec<TranscriptEntry> = Vec::new();
    let mut saw_content = false;
    let mut last_ts = 0.0f64;

    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        saw_content = true;

        let record: Value = match serde_json::from_str(trimmed) {
            Ok(value) => value,
            Err(_) => {
                debug!("skipping malformed transcript line in {}", path.display());
                continue;
            }
        };

        let role = match record.get("type").and_then(Value::as_str) {
            Some("user") => SpeakerRole::User,
            Some("assistant") => SpeakerRole::Assistant,
            _ => continue,
        };

        // Subagent sidechains and expanded prompt wrappers are not
        // conversation content.
        if record
            .get("isSidechain")
            .and_then(Value::as_bool)
            .unwrap_or(false)
            || record.get("isMeta").and_then(Value::as_bool).unwrap_or(false)
        {
            continue;
        }

        if let Some(ts) = record.get("timestamp").and_then(Value::as_str)
            && let Some(parsed) = parse_timestamp(ts)
        {
            last_ts = parsed;
        }

        let content = record.get("message").and_then(|m| m.get("content"));
        let text = match role {
            SpeakerRole::User => extract_user_text(content),
            _ => extract_assistant_text(content),
        };

        if let Some(text) = text {
            entries.push(TranscriptEntry {
                role,
                text,
                timestamp: last_ts,
            });
        }
    }

    if saw_content && entries.is_empty() {
        return Err(MemoryBankError::TranscriptMalformed {
            path: path.to_path_buf(),
            detail: "no user or assistant text records".to_string(),
        });
    }

    Ok(entries)
}

fn keep_user_text(text: &str) -> bool {
    if WRAPPER_PREFIXES.iter().any(|p| text.starts_with(p)) {
        return false;
    }
    !text.to_lowercase().contains("request interrupted by user")
}

fn extract_user_text(content: Option<&Value>) -> Option<String> {
    match content? {
        Value::String(s) => {
            let text = s.trim();
            (!text.is_empty() && keep_user_text(text)).then(|| text.to_string())
        }
        Value::Array(items) => {
            let texts: Vec<&str> = items
                .iter()
                .filter(|item| item.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|item| item.get("text").and_then(Value::as_str))
                .map(str::trim)
                .filter(|text| !text.is_empty() && keep_user_text(text))
                .collect();
            (!texts.is_empty()).then(|| texts.join("\n\n"))
        }
        _ => None,
    }
}

fn extract_assistant_text(content: Option<&Value>) -> Option<String> {
    match content? {
        Value::String(s) => {
            let text = s.trim();
            (!text.is_empty()).then(|| text.to_string())
        }
        Value::Array(items) => {
            // `tool_use` and `thinking` parts carry other type tags and fall
            // through the filter.
            let texts: Vec<&str> = items
                .iter()
                .filter(|item| item.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|item| item.get("text").and_then(Value::as_str))
                .map(str::trim)
                .filter(|text| !text.is_empty())
                .collect();
            (!texts.is_empty()).then(|| texts.join("\n\n"))
        }
        _ => None,
    }
}

/// Parse an ISO-8601 timestamp into epoch seconds.
pub fn parse_timestamp(value: &str) -> Option<f64> {
    chrono::DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.timestamp_millis() as f64 / 1000.0)
}
