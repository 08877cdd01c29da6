//! Message types and content blocks.
//!
//! The transcript model is deliberately small: two roles, three content
//! block variants. Tool results are always carried inside a *user* message;
//! there is no separate tool role at the transcript level.

use serde::{Deserialize, Serialize};

// ============================================================================
// Messages
// ============================================================================

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
    /// Milliseconds since the Unix epoch. Monotonic per session.
    pub timestamp: i64,
}

/// Message content - either plain text or an ordered block sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// A content block in a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        name: String,
        content: String,
    },
}

impl Message {
    fn now_millis() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// A plain-text user message stamped with the current time.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
            timestamp: Self::now_millis(),
        }
    }

    /// A block-structured user message (tool results travel this way).
    pub fn user_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Blocks(blocks),
            timestamp: Self::now_millis(),
        }
    }

    /// A block-structured assistant message.
    pub fn assistant_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Blocks(blocks),
            timestamp: Self::now_millis(),
        }
    }

    /// All text content joined with newlines.
    pub fn text(&self) -> String {
        match &self.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Blocks(blocks) => {
                let mut out = String::new();
                for block in blocks {
                    if let ContentBlock::Text { text } = block {
                        if !out.is_empty() {
                            out.push('\n');
                        }
                        out.push_str(text);
                    }
                }
                out
            }
        }
    }

    /// Iterate the blocks of this message; plain-text content yields nothing.
    pub fn blocks(&self) -> &[ContentBlock] {
        match &self.content {
            MessageContent::Text(_) => &[],
            MessageContent::Blocks(blocks) => blocks,
        }
    }

    /// Tool-use blocks carried by this message as `(id, name)` pairs.
    pub fn tool_uses(&self) -> Vec<(&str, &str)> {
        self.blocks()
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, .. } => Some((id.as_str(), name.as_str())),
                _ => None,
            })
            .collect()
    }

    /// IDs answered by tool-result blocks in this message.
    pub fn tool_result_ids(&self) -> Vec<&str> {
        self.blocks()
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
                _ => None,
            })
            .collect()
    }

    /// True for user messages whose blocks include at least one tool result.
    pub fn is_tool_result_carrier(&self) -> bool {
        self.role == Role::User && !self.tool_result_ids().is_empty()
    }

    /// Character size estimate used by the pruner and compactor.
    pub fn char_len(&self) -> usize {
        match &self.content {
            MessageContent::Text(text) => text.len(),
            MessageContent::Blocks(blocks) => blocks.iter().map(ContentBlock::char_len).sum(),
        }
    }
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn tool_result(
        tool_use_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::ToolResult {
            tool_use_id: tool_use_id.into(),
            name: name.into(),
            content: content.into(),
        }
    }

    pub fn char_len(&self) -> usize {
        match self {
            Self::Text { text } => text.len(),
            Self::ToolUse { name, input, .. } => {
                name.len()
                    + serde_json::to_string(input)
                        .map(|s| s.len())
                        .unwrap_or_default()
            }
            Self::ToolResult { content, .. } => content.len(),
        }
    }
}
