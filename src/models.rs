//! Core data models used throughout recall.
//!
//! These types represent the projects, sessions, and transcript entries that
//! flow through the ingestion and retrieval pipeline. They are the common
//! currency between store adapters, the ingester, and the search service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Separator between the source tag and a store-native id in a scoped id.
pub const SCOPE_SEP: char = ':';

/// Suffix shared by every session transcript file.
pub const SESSION_FILE_SUFFIX: &str = ".jsonl";

/// Compose the scoped project id used as the `projects` primary key.
///
/// Store-native project ids are only unique within one source; prefixing the
/// source tag keeps rows from different vendors from colliding.
pub fn scoped_project_id(source: &str, project_id: &str) -> String {
    format!("{}{}{}", source, SCOPE_SEP, project_id)
}

/// A project as enumerated by a store adapter.
#[derive(Debug, Clone)]
pub struct Project {
    /// Store-native identifier, unique within `source`.
    pub id: String,
    /// Directory holding the project's session files.
    pub path: String,
    pub display_name: String,
    /// Source tag of the store that produced this project.
    pub source: String,
    pub workspace_id: String,
}

impl Project {
    pub fn scoped_id(&self) -> String {
        scoped_project_id(&self.source, &self.id)
    }
}

/// Session metadata as enumerated by a store adapter.
///
/// `model` and `first_prompt` may be left empty by stores that only look at
/// file metadata; the ingester fills them in from parsed entries.
#[derive(Debug, Clone)]
pub struct SessionMeta {
    /// Store-native session identifier, unique within `source`.
    pub id: String,
    pub project_scoped_id: String,
    pub full_path: String,
    pub model: String,
    pub first_prompt: String,
    pub entry_count: i64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub file_size: i64,
    pub source: String,
    pub workspace_id: String,
    pub git_branch: String,
}

/// Role of a transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryRole {
    User,
    Assistant,
    System,
    Summary,
    Progress,
    Checkpoint,
    Tool,
}

impl EntryRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryRole::User => "user",
            EntryRole::Assistant => "assistant",
            EntryRole::System => "system",
            EntryRole::Summary => "summary",
            EntryRole::Progress => "progress",
            EntryRole::Checkpoint => "checkpoint",
            EntryRole::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<EntryRole> {
        match s {
            "user" => Some(EntryRole::User),
            "assistant" => Some(EntryRole::Assistant),
            "system" => Some(EntryRole::System),
            "summary" => Some(EntryRole::Summary),
            "progress" => Some(EntryRole::Progress),
            "checkpoint" => Some(EntryRole::Checkpoint),
            "tool" => Some(EntryRole::Tool),
            _ => None,
        }
    }
}

/// Token usage reported on assistant entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
}

/// One block of an entry's content.
///
/// Modeled as a tagged variant on the JSON `type` field. Tags outside the
/// known set pass through as [`ContentBlock::Opaque`] so new vendor block
/// kinds survive a round trip without being understood.
#[derive(Debug, Clone)]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_result: String,
        is_error: bool,
    },
    Image,
    Document,
    Opaque(serde_json::Value),
}

impl ContentBlock {
    /// Parse one content block from its JSON value.
    pub fn from_value(value: serde_json::Value) -> ContentBlock {
        let tag = value.get("type").and_then(|t| t.as_str()).unwrap_or("");
        match tag {
            "text" => ContentBlock::Text {
                text: str_field(&value, "text"),
            },
            "thinking" => ContentBlock::Thinking {
                thinking: str_field(&value, "thinking"),
            },
            "tool_use" => ContentBlock::ToolUse {
                name: str_field(&value, "name"),
                input: value
                    .get("input")
                    .cloned()
                    .unwrap_or(serde_json::Value::Null),
            },
            "tool_result" => ContentBlock::ToolResult {
                tool_result: tool_result_text(&value),
                is_error: value
                    .get("is_error")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
            },
            "image" => ContentBlock::Image,
            "document" => ContentBlock::Document,
            _ => ContentBlock::Opaque(value),
        }
    }
}

fn str_field(value: &serde_json::Value, key: &str) -> String {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

/// Tool results carry either a plain string or a nested list of text blocks.
fn tool_result_text(value: &serde_json::Value) -> String {
    match value.get("content") {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

/// One line of a session transcript: a single turn or event.
#[derive(Debug, Clone)]
pub struct Entry {
    /// Globally unique within the source. Empty means "not a message line";
    /// such entries are dropped before they reach the index.
    pub uuid: String,
    pub parent_uuid: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub role: EntryRole,
    pub text: String,
    pub content_blocks: Vec<ContentBlock>,
    pub usage: Option<Usage>,
    pub model: String,
    pub git_branch: String,
    pub cwd: String,
    pub is_sidechain: bool,
    pub is_checkpoint: bool,
    pub source: String,
    pub workspace_id: String,
}

impl Entry {
    /// Name of the first tool invoked in this entry, if any.
    pub fn tool_name(&self) -> Option<&str> {
        self.content_blocks.iter().find_map(|b| match b {
            ContentBlock::ToolUse { name, .. } if !name.is_empty() => Some(name.as_str()),
            _ => None,
        })
    }

    /// Whether any tool result in this entry reported an error.
    pub fn has_error(&self) -> bool {
        self.content_blocks.iter().any(|b| match b {
            ContentBlock::ToolResult { is_error, .. } => *is_error,
            _ => false,
        })
    }

    /// Total length of thinking blocks, in characters.
    pub fn thinking_len(&self) -> i64 {
        self.content_blocks
            .iter()
            .map(|b| match b {
                ContentBlock::Thinking { thinking } => thinking.chars().count() as i64,
                _ => 0,
            })
            .sum()
    }
}

/// Coarse category of extracted text, kept in the embedding row id so the
/// two tiers of the same entry never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// User prompts and assistant prose.
    Conversation,
    /// Assistant thinking and tool output.
    Reasoning,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Conversation => "conversation",
            Tier::Reasoning => "reasoning",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scoped_project_id() {
        assert_eq!(scoped_project_id("claude", "p1"), "claude:p1");
    }

    #[test]
    fn test_content_block_known_tags() {
        let b = ContentBlock::from_value(json!({"type": "text", "text": "hi"}));
        assert!(matches!(b, ContentBlock::Text { text } if text == "hi"));

        let b = ContentBlock::from_value(json!({"type": "thinking", "thinking": "hmm"}));
        assert!(matches!(b, ContentBlock::Thinking { thinking } if thinking == "hmm"));

        let b = ContentBlock::from_value(json!({"type": "tool_use", "name": "Bash", "input": {}}));
        assert!(matches!(b, ContentBlock::ToolUse { name, .. } if name == "Bash"));
    }

    #[test]
    fn test_content_block_unknown_tag_is_opaque() {
        let raw = json!({"type": "server_tool_use", "weird": true});
        let b = ContentBlock::from_value(raw.clone());
        match b {
            ContentBlock::Opaque(v) => assert_eq!(v, raw),
            other => panic!("expected opaque block, got {:?}", other),
        }
    }

    #[test]
    fn test_tool_result_string_and_blocks() {
        let b = ContentBlock::from_value(json!({"type": "tool_result", "content": "ok"}));
        assert!(matches!(b, ContentBlock::ToolResult { tool_result, .. } if tool_result == "ok"));

        let b = ContentBlock::from_value(json!({
            "type": "tool_result",
            "content": [{"type": "text", "text": "a"}, {"type": "text", "text": "b"}],
            "is_error": true
        }));
        match b {
            ContentBlock::ToolResult {
                tool_result,
                is_error,
            } => {
                assert_eq!(tool_result, "a\nb");
                assert!(is_error);
            }
            other => panic!("expected tool result, got {:?}", other),
        }
    }

    #[test]
    fn test_role_roundtrip() {
        for role in [
            EntryRole::User,
            EntryRole::Assistant,
            EntryRole::System,
            EntryRole::Summary,
            EntryRole::Progress,
            EntryRole::Checkpoint,
            EntryRole::Tool,
        ] {
            assert_eq!(EntryRole::parse(role.as_str()), Some(role));
        }
        assert_eq!(EntryRole::parse("alien"), None);
    }
}
