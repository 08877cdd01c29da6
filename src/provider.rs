//! LLM provider abstraction layer.
//!
//! The runtime never speaks a wire protocol itself; callers supply an
//! implementation of [`Provider`] that streams completion events into an
//! [`EventStream`] and answers one-shot completion requests for the
//! compactor's summarizer.

use crate::error::Result;
use crate::events::EventStream;
use crate::model::Message;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ============================================================================
// Provider trait
// ============================================================================

/// A provider for LLM completions.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name, used in logs only.
    fn name(&self) -> &str;

    /// Stream a completion. The stream ends with an [`LlmResult`]; mid-stream
    /// failures are reported through `LlmResult::error` so the loop can
    /// classify them by message text.
    async fn stream(
        &self,
        model: &ModelDef,
        context: &Context,
        options: &StreamOptions,
    ) -> Result<EventStream<LlmEvent, LlmResult>>;

    /// One-shot, non-streaming completion used by the compactor's summarizer.
    async fn complete_simple(&self, request: &SummaryRequest) -> Result<String>;
}

// ============================================================================
// Model definition
// ============================================================================

/// A model definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDef {
    pub id: String,
    pub provider: String,
    pub context_window_tokens: u32,
    pub max_output_tokens: u32,
}

impl Default for ModelDef {
    fn default() -> Self {
        Self {
            id: "unknown".to_string(),
            provider: "unknown".to_string(),
            context_window_tokens: 200_000,
            max_output_tokens: 8_192,
        }
    }
}

// ============================================================================
// Request context
// ============================================================================

/// Context for a completion request.
#[derive(Debug, Clone, Default)]
pub struct Context {
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDef>,
}

/// A tool definition surfaced to the model.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool input. Passed through opaquely.
    pub input_schema: serde_json::Value,
}

/// Options for a streaming completion.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub session_key: Option<String>,
}

// ============================================================================
// Stream events
// ============================================================================

/// Streaming event from a provider.
#[derive(Debug, Clone)]
pub enum LlmEvent {
    TextDelta { delta: String },
    TextEnd { content: String },
    /// Announced before arguments stream in; the loop ignores it.
    ToolCallStart { id: String, name: String },
    ToolCallEnd { call: LlmToolCall },
}

/// A completed tool call emitted by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Terminal value of a provider stream.
#[derive(Debug, Clone, Default)]
pub struct LlmResult {
    /// Set when the stream failed; classified by substring in the loop.
    pub error: Option<String>,
}

impl LlmResult {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
        }
    }
}

// ============================================================================
// Summarizer request
// ============================================================================

/// Request for the compactor's summarization call.
#[derive(Debug, Clone)]
pub struct SummaryRequest {
    pub system: String,
    pub user_prompt: String,
    pub max_tokens: u32,
}
