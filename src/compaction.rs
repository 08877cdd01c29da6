//! Context compaction for long sessions.
//!
//! When pruning alone cannot keep the prompt inside the reserve, the
//! messages the pruner dropped are summarized with the LLM and replaced by
//! a single synthetic user message. The session log records a compaction
//! boundary (summary, first kept entry id, pre-compaction token estimate)
//! so later loads can materialize the same view.

use crate::error::Result;
use crate::model::{ContentBlock, Message, MessageContent, Role};
use crate::prune::CHARS_PER_TOKEN_ESTIMATE;
use crate::provider::{Provider, SummaryRequest};
use crate::session::{COMPACTION_SUMMARY_PREFIX, COMPACTION_SUMMARY_SUFFIX};
use std::collections::BTreeSet;
use std::fmt::Write as _;

// ============================================================================
// Settings
// ============================================================================

#[derive(Debug, Clone)]
pub struct CompactionSettings {
    /// Tokens held back for the model's output and system prompt. Compaction
    /// triggers when the history estimate crosses `window - reserve`.
    pub reserve_tokens: u32,
    /// Baseline share of the window a single summarization chunk may use.
    pub chunk_ratio: f64,
    /// Floor the chunk ratio degrades to for oversized messages.
    pub min_chunk_ratio: f64,
    /// Parts to split into when the drop set exceeds the chunk budget.
    pub split_parts: usize,
}

impl Default for CompactionSettings {
    fn default() -> Self {
        Self {
            reserve_tokens: 20_000,
            chunk_ratio: 0.4,
            min_chunk_ratio: 0.15,
            split_parts: 2,
        }
    }
}

/// Output of a compaction pass.
#[derive(Debug, Clone)]
pub struct CompactionOutcome {
    pub summary: String,
    /// The synthetic user message prepended to the pruned history.
    pub summary_message: Message,
    /// Token estimate of the transcript before compaction.
    pub tokens_before: u64,
    pub dropped_messages: usize,
}

// ============================================================================
// Token estimation
// ============================================================================

/// Estimate tokens for a message list (chars / CHARS_PER_TOKEN_ESTIMATE).
pub fn estimate_tokens(messages: &[Message]) -> u64 {
    let chars: usize = messages.iter().map(Message::char_len).sum();
    (chars.div_ceil(CHARS_PER_TOKEN_ESTIMATE)) as u64
}

fn estimate_message_tokens(message: &Message) -> u64 {
    (message.char_len().div_ceil(CHARS_PER_TOKEN_ESTIMATE)) as u64
}

/// Whether the history estimate violates the reserve.
pub fn should_compact(
    messages: &[Message],
    context_window_tokens: u32,
    settings: &CompactionSettings,
) -> bool {
    let window = u64::from(context_window_tokens);
    let reserve = u64::from(settings.reserve_tokens);
    estimate_tokens(messages) > window.saturating_sub(reserve)
}

// ============================================================================
// Summarization prompts
// ============================================================================

const SUMMARIZATION_SYSTEM_PROMPT: &str = "You are a context summarization assistant. Your task is to read a conversation between a user and an AI assistant, then produce a structured summary following the exact format specified.\n\nDo NOT continue the conversation. Do NOT respond to any questions in the conversation. ONLY output the structured summary.";

const SUMMARIZATION_PROMPT: &str = "The messages above are a conversation to summarize. Create a structured context checkpoint summary that another LLM will use to continue the work.\n\nUse this EXACT format:\n\n## Goals\n[What is the user trying to accomplish? Can be multiple items.]\n\n## Constraints & Preferences\n- [Constraints, preferences, or requirements mentioned by the user, or \"(none)\"]\n\n## Progress\n### Completed\n- [x] [Finished tasks/changes]\n\n### In Progress\n- [ ] [Current work]\n\n### Blocked\n- [Issues preventing progress, if any]\n\n## Key Decisions\n- **[Decision]**: [Brief rationale]\n\n## Next Steps\n1. [Ordered list of what should happen next]\n\n## Key Information\n- [Data, examples, or references needed to continue, or \"(none)\"]\n\nKeep each section concise. Preserve exact file paths, function names, and error messages.";

const UPDATE_SUMMARIZATION_PROMPT: &str = "The messages above are NEW conversation messages to incorporate into the existing summary provided in <previous-summary> tags.\n\nUpdate the existing structured summary with new information. RULES:\n- PRESERVE all existing information from the previous summary\n- ADD new progress, decisions, and context from the new messages\n- UPDATE the Progress section: move items from \"In Progress\" to \"Completed\" when finished\n- UPDATE \"Next Steps\" based on what was accomplished\n- PRESERVE exact file paths, function names, and error messages\n- If something is no longer relevant, you may remove it\n\nUse the same section format as the previous summary (Goals / Constraints & Preferences / Progress / Key Decisions / Next Steps / Key Information).\n\nKeep each section concise.";

const MERGE_SUMMARIZATION_PROMPT: &str = "The sections above are partial summaries of consecutive segments of one conversation, oldest first. Merge them into a single structured summary using the same format (Goals / Constraints & Preferences / Progress / Key Decisions / Next Steps / Key Information).\n\nPreserve all file paths, function names, and error messages. Resolve duplicates by keeping the most recent state.";

// ============================================================================
// Conversation serialization
// ============================================================================

fn push_separator(out: &mut String) {
    if !out.is_empty() {
        out.push_str("\n\n");
    }
}

fn append_message(out: &mut String, message: &Message) {
    match (&message.role, &message.content) {
        (Role::User, MessageContent::Text(text)) => {
            if !text.is_empty() {
                push_separator(out);
                out.push_str("[User]: ");
                out.push_str(text);
            }
        }
        (Role::User, MessageContent::Blocks(blocks)) => {
            let mut text = String::new();
            let mut results = String::new();
            for block in blocks {
                match block {
                    ContentBlock::Text { text: t } => {
                        if !text.is_empty() {
                            text.push('\n');
                        }
                        text.push_str(t);
                    }
                    ContentBlock::ToolResult { content, .. } => {
                        if !results.is_empty() {
                            results.push('\n');
                        }
                        results.push_str(content);
                    }
                    ContentBlock::ToolUse { .. } => {}
                }
            }
            if !text.is_empty() {
                push_separator(out);
                out.push_str("[User]: ");
                out.push_str(&text);
            }
            if !results.is_empty() {
                push_separator(out);
                out.push_str("[Tool result]: ");
                out.push_str(&results);
            }
        }
        (Role::Assistant, content) => {
            let text = message.text();
            if !text.is_empty() {
                push_separator(out);
                out.push_str("[Assistant]: ");
                out.push_str(&text);
            }
            if let MessageContent::Blocks(blocks) = content {
                let mut calls = String::new();
                for block in blocks {
                    if let ContentBlock::ToolUse { name, input, .. } = block {
                        if !calls.is_empty() {
                            calls.push_str("; ");
                        }
                        calls.push_str(name);
                        calls.push('(');
                        calls.push_str(&input.to_string());
                        calls.push(')');
                    }
                }
                if !calls.is_empty() {
                    push_separator(out);
                    out.push_str("[Assistant tool calls]: ");
                    out.push_str(&calls);
                }
            }
        }
    }
}

fn serialize_conversation(messages: &[Message]) -> String {
    let mut out = String::new();
    for message in messages {
        append_message(&mut out, message);
    }
    out
}

// ============================================================================
// Chunking
// ============================================================================

fn effective_chunk_ratio(
    dropped: &[Message],
    context_window_tokens: u32,
    settings: &CompactionSettings,
) -> f64 {
    if dropped.is_empty() {
        return settings.chunk_ratio;
    }
    let threshold = f64::from(context_window_tokens) * 0.1;
    let average = estimate_tokens(dropped) as f64 * 1.2 / dropped.len() as f64;
    if average > threshold {
        settings
            .min_chunk_ratio
            .max(settings.chunk_ratio * threshold / average)
    } else {
        settings.chunk_ratio
    }
}

/// Split into `parts` token-balanced consecutive slices.
fn split_balanced(messages: &[Message], parts: usize) -> Vec<Vec<Message>> {
    let parts = parts.max(1);
    if messages.len() <= 1 || parts == 1 {
        return vec![messages.to_vec()];
    }
    let total = estimate_tokens(messages);
    let target = total / parts as u64;

    let mut out: Vec<Vec<Message>> = Vec::new();
    let mut current: Vec<Message> = Vec::new();
    let mut current_tokens = 0u64;
    for message in messages {
        current_tokens += estimate_message_tokens(message);
        current.push(message.clone());
        if current_tokens >= target && out.len() + 1 < parts {
            out.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

// ============================================================================
// File-ops appendix
// ============================================================================

fn escape_tag_text(out: &mut String, s: &str) {
    for ch in s.chars() {
        match ch {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(ch),
        }
    }
}

fn write_file_list(out: &mut String, tag: &str, files: &BTreeSet<String>) {
    out.push('<');
    out.push_str(tag);
    out.push_str(">\n");
    for (i, file) in files.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        escape_tag_text(out, file);
    }
    out.push_str("\n</");
    out.push_str(tag);
    out.push('>');
}

/// Walk assistant `tool_use` blocks for `read`/`write`/`edit` path arguments
/// and render the two file lists as appendix tag blocks.
fn file_operations_appendix(dropped: &[Message]) -> String {
    let mut read: BTreeSet<String> = BTreeSet::new();
    let mut modified: BTreeSet<String> = BTreeSet::new();

    for message in dropped {
        if message.role != Role::Assistant {
            continue;
        }
        for block in message.blocks() {
            let ContentBlock::ToolUse { name, input, .. } = block else {
                continue;
            };
            let Some(path) = input.get("path").and_then(serde_json::Value::as_str) else {
                continue;
            };
            match name.as_str() {
                "read" => {
                    read.insert(path.to_string());
                }
                "write" | "edit" => {
                    modified.insert(path.to_string());
                }
                _ => {}
            }
        }
    }

    let read_only: BTreeSet<String> = read.difference(&modified).cloned().collect();
    if read_only.is_empty() && modified.is_empty() {
        return String::new();
    }

    let mut out = String::from("\n\n");
    if !read_only.is_empty() {
        write_file_list(&mut out, "read-files", &read_only);
    }
    if !modified.is_empty() {
        if !read_only.is_empty() {
            out.push_str("\n\n");
        }
        write_file_list(&mut out, "modified-files", &modified);
    }
    out
}

// ============================================================================
// Summary generation
// ============================================================================

fn summary_max_tokens(settings: &CompactionSettings) -> u32 {
    ((f64::from(settings.reserve_tokens) * 0.8) as u32).max(256)
}

async fn summarize_chunk(
    provider: &dyn Provider,
    conversation_text: &str,
    previous_summary: Option<&str>,
    settings: &CompactionSettings,
) -> Result<String> {
    let prompt = if previous_summary.is_some() {
        UPDATE_SUMMARIZATION_PROMPT
    } else {
        SUMMARIZATION_PROMPT
    };

    let mut user_prompt = format!("<conversation>\n{conversation_text}\n</conversation>\n\n");
    if let Some(previous) = previous_summary {
        let _ = write!(
            user_prompt,
            "<previous-summary>\n{previous}\n</previous-summary>\n\n"
        );
    }
    user_prompt.push_str(prompt);

    provider
        .complete_simple(&SummaryRequest {
            system: SUMMARIZATION_SYSTEM_PROMPT.to_string(),
            user_prompt,
            max_tokens: summary_max_tokens(settings),
        })
        .await
}

async fn merge_partials(
    provider: &dyn Provider,
    partials: &[String],
    settings: &CompactionSettings,
) -> Result<String> {
    let mut user_prompt = String::new();
    for (i, partial) in partials.iter().enumerate() {
        let _ = write!(
            user_prompt,
            "<partial-summary part=\"{}\">\n{partial}\n</partial-summary>\n\n",
            i + 1
        );
    }
    user_prompt.push_str(MERGE_SUMMARIZATION_PROMPT);

    provider
        .complete_simple(&SummaryRequest {
            system: SUMMARIZATION_SYSTEM_PROMPT.to_string(),
            user_prompt,
            max_tokens: summary_max_tokens(settings),
        })
        .await
}

async fn generate_summary(
    provider: &dyn Provider,
    dropped: &[Message],
    previous_summary: Option<&str>,
    context_window_tokens: u32,
    settings: &CompactionSettings,
) -> Result<String> {
    let ratio = effective_chunk_ratio(dropped, context_window_tokens, settings);
    let chunk_budget = (f64::from(context_window_tokens) * ratio) as u64;

    if estimate_tokens(dropped) <= chunk_budget || dropped.len() <= 1 {
        return summarize_chunk(
            provider,
            &serialize_conversation(dropped),
            previous_summary,
            settings,
        )
        .await;
    }

    let parts = split_balanced(dropped, settings.split_parts);
    let mut partials = Vec::with_capacity(parts.len());
    for (i, part) in parts.iter().enumerate() {
        // Only the first part extends the previous summary; later parts are
        // merged afterwards.
        let previous = if i == 0 { previous_summary } else { None };
        partials.push(summarize_chunk(provider, &serialize_conversation(part), previous, settings).await?);
    }
    if partials.len() == 1 {
        return Ok(partials.remove(0));
    }
    merge_partials(provider, &partials, settings).await
}

/// Replace messages too large to summarize with short placeholder notes.
fn filter_oversized(messages: &[Message], context_window_tokens: u32) -> Vec<Message> {
    let limit = u64::from(context_window_tokens) / 2;
    messages
        .iter()
        .map(|message| {
            let tokens = estimate_message_tokens(message);
            if tokens <= limit {
                return message.clone();
            }
            let role = match message.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            let mut note = Message::user_text(format!(
                "[Large {role} message (~{} K tokens) omitted]",
                tokens.div_ceil(1_000)
            ));
            note.timestamp = message.timestamp;
            note
        })
        .collect()
}

// ============================================================================
// Public entry point
// ============================================================================

/// The synthetic user message form of a summary.
pub fn summary_message(summary: &str) -> Message {
    Message::user_text(format!(
        "{COMPACTION_SUMMARY_PREFIX}{summary}{COMPACTION_SUMMARY_SUFFIX}"
    ))
}

/// Summarize the dropped messages into a compaction outcome.
///
/// `tokens_before` is estimated over the full pre-compaction transcript;
/// the drop set is what actually gets summarized. Summarizer failures are
/// retried once with oversized messages filtered out, then degrade to a
/// fixed notice rather than failing the run.
pub async fn compact(
    provider: &dyn Provider,
    all_messages: &[Message],
    dropped: &[Message],
    previous_summary: Option<&str>,
    context_window_tokens: u32,
    settings: &CompactionSettings,
) -> Result<CompactionOutcome> {
    let tokens_before = estimate_tokens(all_messages);

    let mut summary = match generate_summary(
        provider,
        dropped,
        previous_summary,
        context_window_tokens,
        settings,
    )
    .await
    {
        Ok(summary) => summary,
        Err(first_err) => {
            tracing::warn!("summarization failed, retrying with oversized messages filtered: {first_err}");
            let filtered = filter_oversized(dropped, context_window_tokens);
            match generate_summary(
                provider,
                &filtered,
                previous_summary,
                context_window_tokens,
                settings,
            )
            .await
            {
                Ok(summary) => summary,
                Err(second_err) => {
                    tracing::warn!("summarization failed twice, using fallback notice: {second_err}");
                    format!(
                        "Context contained {} messages. Summary unavailable due to size limits.",
                        dropped.len()
                    )
                }
            }
        }
    };

    summary.push_str(&file_operations_appendix(dropped));

    Ok(CompactionOutcome {
        summary_message: summary_message(&summary),
        tokens_before,
        dropped_messages: dropped.len(),
        summary,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::events::EventStream;
    use crate::provider::{Context, LlmEvent, LlmResult, ModelDef, StreamOptions};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Summarizer stub: scripted responses, records prompts.
    #[derive(Default)]
    struct StubSummarizer {
        responses: Mutex<Vec<Result<String>>>,
        prompts: Mutex<Vec<String>>,
        calls: AtomicUsize,
    }

    impl StubSummarizer {
        fn with_responses(responses: Vec<Result<String>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl Provider for StubSummarizer {
        fn name(&self) -> &str {
            "stub"
        }

        async fn stream(
            &self,
            _model: &ModelDef,
            _context: &Context,
            _options: &StreamOptions,
        ) -> Result<EventStream<LlmEvent, LlmResult>> {
            Err(Error::provider("stub does not stream"))
        }

        async fn complete_simple(&self, request: &SummaryRequest) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().unwrap().push(request.user_prompt.clone());
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok("SUMMARY".to_string())
            } else {
                responses.remove(0)
            }
        }
    }

    fn long_user(text_len: usize) -> Message {
        Message::user_text("u".repeat(text_len))
    }

    #[test]
    fn trigger_respects_reserve() {
        let settings = CompactionSettings::default();
        // 1000-token window with 20k reserve: anything triggers.
        assert!(should_compact(&[long_user(100)], 1_000, &settings));
        // 200k window: small history does not.
        assert!(!should_compact(&[long_user(100)], 200_000, &settings));
        // (200k - 20k) tokens = 720k chars boundary.
        assert!(should_compact(&[long_user(721_000 * 4)], 200_000, &settings));
    }

    #[test]
    fn chunk_ratio_degrades_for_huge_messages() {
        let settings = CompactionSettings::default();
        let small = vec![long_user(400); 10];
        assert!((effective_chunk_ratio(&small, 10_000, &settings) - 0.4).abs() < 1e-9);

        // One message ~9k tokens against a 10k window: avg × 1.2 > 10 %.
        let huge = vec![long_user(36_000)];
        let ratio = effective_chunk_ratio(&huge, 10_000, &settings);
        assert!(ratio < 0.4);
        assert!(ratio >= settings.min_chunk_ratio);
    }

    #[test]
    fn split_is_token_balanced() {
        let messages: Vec<Message> = (0..8).map(|_| long_user(1_000)).collect();
        let parts = split_balanced(&messages, 2);
        assert_eq!(parts.len(), 2);
        let a = estimate_tokens(&parts[0]);
        let b = estimate_tokens(&parts[1]);
        assert_eq!(parts[0].len() + parts[1].len(), 8);
        assert!((a as i64 - b as i64).abs() <= 250);
    }

    #[tokio::test]
    async fn single_chunk_uses_one_call() {
        let provider = StubSummarizer::default();
        let dropped = vec![long_user(100), long_user(100)];
        let outcome = compact(
            &provider,
            &dropped,
            &dropped,
            None,
            200_000,
            &CompactionSettings::default(),
        )
        .await
        .unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.summary, "SUMMARY");
        assert!(outcome.summary_message.text().contains("SUMMARY"));
        assert!(outcome
            .summary_message
            .text()
            .starts_with("The conversation history before this point was compacted"));
        assert_eq!(outcome.dropped_messages, 2);
    }

    #[tokio::test]
    async fn multi_part_summarizes_then_merges() {
        let provider = StubSummarizer::with_responses(vec![
            Ok("PART-1".to_string()),
            Ok("PART-2".to_string()),
            Ok("MERGED".to_string()),
        ]);
        // Window 1000 tokens → chunk budget ≤ 400 tokens; two 300-token
        // messages exceed it and split into two parts.
        let dropped = vec![long_user(1_200), long_user(1_200)];
        let outcome = compact(
            &provider,
            &dropped,
            &dropped,
            None,
            1_000,
            &CompactionSettings::default(),
        )
        .await
        .unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.summary, "MERGED");
        let prompts = provider.prompts.lock().unwrap();
        assert!(prompts[2].contains("<partial-summary part=\"1\">"));
        assert!(prompts[2].contains("PART-1"));
        assert!(prompts[2].contains("PART-2"));
    }

    #[tokio::test]
    async fn update_variant_used_with_previous_summary() {
        let provider = StubSummarizer::default();
        let dropped = vec![long_user(100)];
        compact(
            &provider,
            &dropped,
            &dropped,
            Some("OLD SUMMARY"),
            200_000,
            &CompactionSettings::default(),
        )
        .await
        .unwrap();

        let prompts = provider.prompts.lock().unwrap();
        assert!(prompts[0].contains("<previous-summary>\nOLD SUMMARY\n</previous-summary>"));
        assert!(prompts[0].contains("PRESERVE all existing information"));
    }

    #[tokio::test]
    async fn failure_retries_filtered_then_falls_back() {
        let provider = StubSummarizer::with_responses(vec![
            Err(Error::provider("too big")),
            Err(Error::provider("still too big")),
        ]);
        let dropped = vec![long_user(100), long_user(100), long_user(100)];
        let outcome = compact(
            &provider,
            &dropped,
            &dropped,
            None,
            200_000,
            &CompactionSettings::default(),
        )
        .await
        .unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            outcome.summary,
            "Context contained 3 messages. Summary unavailable due to size limits."
        );
    }

    #[tokio::test]
    async fn retry_filters_oversized_messages() {
        let provider = StubSummarizer::with_responses(vec![
            Err(Error::provider("boom")),
            Ok("FILTERED SUMMARY".to_string()),
        ]);
        // 1000-token window: a 600-token message crosses the 50 % filter.
        let dropped = vec![long_user(2_400), long_user(40)];
        let outcome = compact(
            &provider,
            &dropped,
            &dropped,
            None,
            1_000,
            &CompactionSettings::default(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.summary, "FILTERED SUMMARY");
        let prompts = provider.prompts.lock().unwrap();
        assert!(prompts[1].contains("omitted]"));
    }

    #[tokio::test]
    async fn file_ops_appendix_lists_read_and_modified() {
        let provider = StubSummarizer::default();
        let dropped = vec![
            Message::assistant_blocks(vec![
                ContentBlock::ToolUse {
                    id: "t1".into(),
                    name: "read".into(),
                    input: json!({"path": "src/lib.rs"}),
                },
                ContentBlock::ToolUse {
                    id: "t2".into(),
                    name: "read".into(),
                    input: json!({"path": "src/main.rs"}),
                },
                ContentBlock::ToolUse {
                    id: "t3".into(),
                    name: "edit".into(),
                    input: json!({"path": "src/main.rs"}),
                },
                ContentBlock::ToolUse {
                    id: "t4".into(),
                    name: "write".into(),
                    input: json!({"path": "notes<1>.md"}),
                },
            ]),
        ];
        let outcome = compact(
            &provider,
            &dropped,
            &dropped,
            None,
            200_000,
            &CompactionSettings::default(),
        )
        .await
        .unwrap();

        // Files written/edited win over read-only mentions.
        assert!(outcome.summary.contains("<read-files>\nsrc/lib.rs\n</read-files>"));
        assert!(outcome
            .summary
            .contains("<modified-files>\nnotes&lt;1&gt;.md\nsrc/main.rs\n</modified-files>"));
    }

    #[test]
    fn tokens_estimate_rounds_up() {
        assert_eq!(estimate_tokens(&[Message::user_text("abcde")]), 2);
        assert_eq!(estimate_tokens(&[]), 0);
    }
}
