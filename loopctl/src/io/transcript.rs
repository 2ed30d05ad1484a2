//! Extract the agent's latest output from a JSONL session transcript.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::debug;

/// Text of the last assistant message, or `None` when the transcript has none.
///
/// Lines that are not JSON, or not assistant messages, are skipped.
pub fn last_assistant_text(path: &Path) -> Result<Option<String>> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read transcript {}", path.display()))?;
    let found = contents
        .lines()
        .rev()
        .filter_map(|line| serde_json::from_str::<Value>(line.trim()).ok())
        .find_map(|entry| assistant_text(&entry));
    debug!(path = %path.display(), found = found.is_some(), "transcript scanned");
    Ok(found)
}

fn assistant_text(entry: &Value) -> Option<String> {
    let is_assistant = entry.get("type").and_then(Value::as_str) == Some("assistant")
        || entry.get("role").and_then(Value::as_str) == Some("assistant");
    if !is_assistant {
        return None;
    }
    let message = entry.get("message").unwrap_or(entry);
    let text = match message.get("content")? {
        Value::String(text) => text.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => return None,
    };
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_last_assistant_message() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("t.jsonl");
        let lines = [
            r#"{"type":"user","message":{"role":"user","content":"go"}}"#,
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"first"}]}}"#,
            "not json",
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"x"},{"type":"text","text":"second"}]}}"#,
            r#"{"type":"user","message":{"content":"tool result"}}"#,
        ];
        fs::write(&path, lines.join("\n")).expect("write");
        assert_eq!(
            last_assistant_text(&path).expect("scan"),
            Some("second".to_string())
        );
    }

    #[test]
    fn tool_only_messages_are_skipped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("t.jsonl");
        let lines = [
            r#"{"role":"assistant","content":"plain string"}"#,
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"x"}]}}"#,
        ];
        fs::write(&path, lines.join("\n")).expect("write");
        assert_eq!(
            last_assistant_text(&path).expect("scan"),
            Some("plain string".to_string())
        );
    }

    #[test]
    fn missing_transcript_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(last_assistant_text(&temp.path().join("nope.jsonl")).is_err());
    }
}
