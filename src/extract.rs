//! Per-entry text extraction and the sliding-window chunker.
//!
//! The extractor turns a heterogeneous [`Entry`] into the text a reader
//! would consider "what was said": user prompts, assistant prose and
//! thinking, tool output. Structural blocks (tool_use, images, documents)
//! are omitted. The chunker then splits extracted text into bounded-length,
//! overlapping windows suitable for embedding.

use crate::models::{ContentBlock, Entry, EntryRole, Tier};

/// Default chunk window, in characters.
pub const DEFAULT_MAX_CHARS: usize = 2000;
/// Default overlap between consecutive chunks, in characters.
pub const DEFAULT_OVERLAP: usize = 200;

/// Extracted text shorter than this carries no signal worth embedding.
const MIN_EXTRACT_LEN: usize = 8;

/// Extract the user-visible text of an entry as one string.
///
/// Returns an empty string for checkpoint entries and for anything shorter
/// than the minimum useful length.
pub fn entry_text(entry: &Entry) -> String {
    if entry.is_checkpoint || entry.role == EntryRole::Checkpoint {
        return String::new();
    }

    let text = match entry.role {
        EntryRole::User => text_or_first_block(entry),
        EntryRole::Assistant => {
            let mut parts = Vec::new();
            for block in &entry.content_blocks {
                match block {
                    ContentBlock::Text { text } if !text.is_empty() => parts.push(text.as_str()),
                    ContentBlock::Thinking { thinking } if !thinking.is_empty() => {
                        parts.push(thinking.as_str())
                    }
                    _ => {}
                }
            }
            parts.join("\n")
        }
        EntryRole::Tool => entry
            .content_blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolResult { tool_result, .. } if !tool_result.is_empty() => {
                    Some(tool_result.as_str())
                }
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => text_or_first_block(entry),
    };

    if text.chars().count() < MIN_EXTRACT_LEN {
        return String::new();
    }
    text
}

/// Extract text split into tiers: assistant prose and user prompts are
/// `conversation`; thinking and tool output are `reasoning`.
///
/// Pieces below the minimum length are dropped per tier, not pooled.
pub fn entry_text_tiered(entry: &Entry) -> Vec<(Tier, String)> {
    if entry.is_checkpoint || entry.role == EntryRole::Checkpoint {
        return Vec::new();
    }

    let mut conversation = Vec::new();
    let mut reasoning = Vec::new();

    match entry.role {
        EntryRole::User => {
            let text = text_or_first_block(entry);
            if !text.is_empty() {
                conversation.push(text);
            }
        }
        EntryRole::Assistant => {
            for block in &entry.content_blocks {
                match block {
                    ContentBlock::Text { text } if !text.is_empty() => {
                        conversation.push(text.clone())
                    }
                    ContentBlock::Thinking { thinking } if !thinking.is_empty() => {
                        reasoning.push(thinking.clone())
                    }
                    _ => {}
                }
            }
        }
        EntryRole::Tool => {
            for block in &entry.content_blocks {
                if let ContentBlock::ToolResult { tool_result, .. } = block {
                    if !tool_result.is_empty() {
                        reasoning.push(tool_result.clone());
                    }
                }
            }
        }
        _ => {
            let text = text_or_first_block(entry);
            if !text.is_empty() {
                conversation.push(text);
            }
        }
    }

    let mut out = Vec::new();
    let conversation = conversation.join("\n");
    if conversation.chars().count() >= MIN_EXTRACT_LEN {
        out.push((Tier::Conversation, conversation));
    }
    let reasoning = reasoning.join("\n");
    if reasoning.chars().count() >= MIN_EXTRACT_LEN {
        out.push((Tier::Reasoning, reasoning));
    }
    out
}

fn text_or_first_block(entry: &Entry) -> String {
    if !entry.text.is_empty() {
        return entry.text.clone();
    }
    entry
        .content_blocks
        .iter()
        .find_map(|b| match b {
            ContentBlock::Text { text } if !text.is_empty() => Some(text.clone()),
            _ => None,
        })
        .unwrap_or_default()
}

/// Split `text` into windows of at most `max_chars` characters, each
/// overlapping its predecessor by `overlap` characters.
///
/// Splits fall on Unicode scalar boundaries. Text at or under `max_chars`
/// comes back as a single chunk; empty input yields no chunks. For
/// consecutive chunks, the last `overlap` characters of one equal the
/// first `overlap` characters of the next.
pub fn chunk_text(text: &str, max_chars: usize, overlap: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    debug_assert!(overlap < max_chars);

    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + max_chars).min(chars.len());
        chunks.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start = end - overlap;
    }
    chunks
}

/// Number of whitespace-separated words in a string.
pub fn word_count(text: &str) -> i64 {
    text.split_whitespace().count() as i64
}
