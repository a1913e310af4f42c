//! Transcript parser (§4.B).
//!
//! Streams one JSON record per line from a transcript file, discarding
//! blank lines and malformed JSON, and normalizes the three envelope shapes
//! a record can take into a uniform [`Message`] stream. A first pass
//! associates `tool_result` items with the `tool_use_id` of the `tool_use`
//! that produced them, so callers see `(message, tool_output)` pairs
//! without re-reading the file.

use std::collections::HashMap;
use std::io::BufRead;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
    Tool,
    UserReflection,
    Other(String),
}

impl Role {
    fn from_str(s: &str) -> Role {
        match s {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            "tool" => Role::Tool,
            "user_reflection" => Role::UserReflection,
            other => Role::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolUse {
    pub id: Option<String>,
    pub name: String,
    pub input: Value,
}

#[derive(Debug, Clone)]
pub struct ToolResult {
    pub tool_use_id: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone)]
pub enum ContentItem {
    Text(String),
    ToolUse(ToolUse),
    ToolResult(ToolResult),
}

#[derive(Debug, Clone)]
pub enum Content {
    Text(String),
    Items(Vec<ContentItem>),
}

#[derive(Debug, Clone)]
pub struct Message {
    pub role: Role,
    pub content: Content,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Message {
    /// Joins all `text` items, the way the metadata extractor's full-text
    /// reconstruction does; `tool_use`/`tool_result` items are skipped here
    /// (they are handled by the metadata extractor separately).
    pub fn text(&self) -> String {
        match &self.content {
            Content::Text(s) => s.clone(),
            Content::Items(items) => items
                .iter()
                .filter_map(|i| match i {
                    ContentItem::Text(t) => Some(t.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn tool_uses(&self) -> Vec<&ToolUse> {
        match &self.content {
            Content::Items(items) => items
                .iter()
                .filter_map(|i| match i {
                    ContentItem::ToolUse(t) => Some(t),
                    _ => None,
                })
                .collect(),
            Content::Text(_) => Vec::new(),
        }
    }
}

/// Parses one raw JSON line into a [`Message`], accepting all three
/// envelope shapes: `{message:{role,content}}`, `{role,content}`, or a bare
/// event that is skipped (returns `None`).
fn parse_line(raw: &Value) -> Option<Message> {
    let envelope = raw.get("message").unwrap_or(raw);
    let role = envelope.get("role")?.as_str()?;
    let content_val = envelope.get("content")?;
    let timestamp = raw
        .get("timestamp")
        .or_else(|| envelope.get("timestamp"))
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));

    let content = parse_content(content_val);

    Some(Message {
        role: Role::from_str(role),
        content,
        timestamp,
    })
}

fn parse_content(val: &Value) -> Content {
    match val {
        Value::String(s) => Content::Text(s.clone()),
        Value::Array(items) => {
            let parsed = items.iter().filter_map(parse_content_item).collect();
            Content::Items(parsed)
        }
        other => Content::Text(other.to_string()),
    }
}

fn parse_content_item(item: &Value) -> Option<ContentItem> {
    let kind = item.get("type")?.as_str()?;
    match kind {
        "text" => item
            .get("text")
            .and_then(|v| v.as_str())
            .map(|t| ContentItem::Text(t.to_string())),
        "tool_use" => {
            let name = item.get("name")?.as_str()?.to_string();
            let id = item.get("id").and_then(|v| v.as_str()).map(String::from);
            let input = item.get("input").cloned().unwrap_or(Value::Null);
            Some(ContentItem::ToolUse(ToolUse { id, name, input }))
        }
        "tool_result" => {
            let tool_use_id = item
                .get("tool_use_id")
                .and_then(|v| v.as_str())
                .map(String::from);
            let content = match item.get("content") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            };
            Some(ContentItem::ToolResult(ToolResult {
                tool_use_id,
                content,
            }))
        }
        _ => None,
    }
}

/// Streams every message in a transcript file, tolerating malformed lines
/// (skipped, logged at debug) and very large individual lines.
pub fn stream_messages<R: BufRead>(reader: R) -> impl Iterator<Item = Message> {
    reader.lines().filter_map(|line| {
        let line = line.ok()?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(val) => parse_line(&val).or_else(|| {
                debug!("transcript line parsed as JSON but missing role/content, skipping");
                None
            }),
            Err(e) => {
                debug!("malformed transcript line, skipping: {e}");
                None
            }
        }
    })
}

/// A first pass over a file's messages, building a map from `tool_use_id`
/// to its `tool_result` content so the second pass can associate outputs
/// with the call that produced them.
pub fn index_tool_outputs(messages: &[Message]) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for msg in messages {
        if let Content::Items(items) = &msg.content {
            for item in items {
                if let ContentItem::ToolResult(result) = item {
                    if let Some(id) = &result.tool_use_id {
                        map.insert(id.clone(), result.content.clone());
                    }
                }
            }
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn parses_direct_role_content_envelope() {
        let line = r#"{"role":"user","content":"hello"}"#;
        let msgs: Vec<_> = stream_messages(Cursor::new(line.as_bytes())).collect();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].role, Role::User);
        assert_eq!(msgs[0].text(), "hello");
    }

    #[test]
    fn parses_nested_message_envelope() {
        let line = r#"{"message":{"role":"assistant","content":"hi there"}}"#;
        let msgs: Vec<_> = stream_messages(Cursor::new(line.as_bytes())).collect();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].role, Role::Assistant);
    }

    #[test]
    fn parses_structured_content_items() {
        let line = r#"{"role":"assistant","content":[
            {"type":"tool_use","id":"tu_1","name":"Edit","input":{"file_path":"/p/config.py"}},
            {"type":"text","text":"Done."}
        ]}"#;
        let msgs: Vec<_> = stream_messages(Cursor::new(line.as_bytes())).collect();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].text(), "Done.");
        let uses = msgs[0].tool_uses();
        assert_eq!(uses.len(), 1);
        assert_eq!(uses[0].name, "Edit");
    }

    #[test]
    fn skips_blank_lines() {
        let data = "\n\n{\"role\":\"user\",\"content\":\"x\"}\n\n";
        let msgs: Vec<_> = stream_messages(Cursor::new(data.as_bytes())).collect();
        assert_eq!(msgs.len(), 1);
    }

    #[test]
    fn skips_malformed_json_without_aborting_stream() {
        let data = "not json at all\n{\"role\":\"user\",\"content\":\"ok\"}\n";
        let msgs: Vec<_> = stream_messages(Cursor::new(data.as_bytes())).collect();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].text(), "ok");
    }

    #[test]
    fn skips_bare_events_without_role() {
        let data = "{\"event\":\"ping\"}\n{\"role\":\"user\",\"content\":\"x\"}\n";
        let msgs: Vec<_> = stream_messages(Cursor::new(data.as_bytes())).collect();
        assert_eq!(msgs.len(), 1);
    }

    #[test]
    fn indexes_tool_outputs_by_tool_use_id() {
        let line = r#"{"role":"tool","content":[
            {"type":"tool_result","tool_use_id":"tu_1","content":"file contents"}
        ]}"#;
        let msgs: Vec<_> = stream_messages(Cursor::new(line.as_bytes())).collect();
        let index = index_tool_outputs(&msgs);
        assert_eq!(index.get("tu_1"), Some(&"file contents".to_string()));
    }
}
