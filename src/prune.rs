//! Three-layer progressive context pruning.
//!
//! All accounting is done in characters with a fixed chars-per-token
//! estimate; the layers fire in order and each only runs if the previous
//! one did not bring the transcript under its threshold:
//!
//! 1. soft-trim: oversized tool results keep their head and tail
//! 2. hard-clear: tool result bodies become placeholders
//! 3. message-drop: oldest messages fall off, a recent-assistant suffix
//!    stays protected
//!
//! The pruner is pure. It never touches the session log; dropping here is
//! what makes a message eligible for compaction, not deletion.

use crate::model::{ContentBlock, Message, MessageContent, Role};
use crate::tools::ToolPolicy;

/// Approximate characters per token for English prose with current
/// tokenizers. Deliberately a little low so estimates overshoot.
pub const CHARS_PER_TOKEN_ESTIMATE: usize = 4;

/// Tuning for the pruner. Ratios are fractions of the char window
/// (`context_window_tokens * CHARS_PER_TOKEN_ESTIMATE`).
#[derive(Debug, Clone)]
pub struct PruneSettings {
    /// History may occupy at most this share of the window (layer 3 budget).
    pub max_history_share: f64,
    pub soft_trim_ratio: f64,
    /// Tool results larger than this get head/tail trimmed.
    pub soft_trim_max_chars: usize,
    /// Bytes kept at each end by a soft trim.
    pub soft_trim_keep_chars: usize,
    pub hard_clear_ratio: f64,
    /// Hard clear only bothers when at least this much prunable tool-result
    /// content remains.
    pub min_prunable_tool_chars: usize,
    /// Assistant messages protected from the drop layer, counted from the end.
    pub keep_last_assistants: usize,
    /// Which tools' results may be trimmed/cleared. Deny overrides allow;
    /// empty allow means every non-denied tool is prunable.
    pub prunable: ToolPolicy,
}

impl Default for PruneSettings {
    fn default() -> Self {
        Self {
            max_history_share: 0.5,
            soft_trim_ratio: 0.3,
            soft_trim_max_chars: 4_000,
            soft_trim_keep_chars: 1_500,
            hard_clear_ratio: 0.5,
            min_prunable_tool_chars: 50_000,
            keep_last_assistants: 3,
            prunable: ToolPolicy::default(),
        }
    }
}

const HARD_CLEAR_PLACEHOLDER: &str = "[Old tool result removed to free context]";

/// Result of a prune pass.
#[derive(Debug, Clone)]
pub struct PruneOutcome {
    /// Surviving messages, input order.
    pub kept: Vec<Message>,
    /// Dropped messages, input order. Input to the compactor.
    pub dropped: Vec<Message>,
    pub soft_trimmed: usize,
    pub hard_cleared: usize,
    /// The layer-3 char budget that was applied.
    pub budget_chars: usize,
}

/// Fit `messages` into the history budget for a context window.
pub fn prune(
    messages: &[Message],
    context_window_tokens: u32,
    settings: &PruneSettings,
) -> PruneOutcome {
    let char_window = context_window_tokens as usize * CHARS_PER_TOKEN_ESTIMATE;
    let budget_chars = (char_window as f64 * settings.max_history_share) as usize;

    let mut working: Vec<Message> = messages.to_vec();
    let mut soft_trimmed = 0usize;
    let mut hard_cleared = 0usize;

    // Layer 1: soft-trim oversized tool results.
    if ratio(total_chars(&working), char_window) > settings.soft_trim_ratio {
        for message in &mut working {
            soft_trimmed += soft_trim_message(message, settings);
        }
    }

    // Layer 2: hard-clear tool result bodies, oldest first, until under the
    // ratio. Skipped when there isn't enough prunable content to matter.
    let mut total = total_chars(&working);
    if ratio(total, char_window) > settings.hard_clear_ratio
        && prunable_tool_chars(&working, settings) >= settings.min_prunable_tool_chars
    {
        'clear: for message in &mut working {
            let MessageContent::Blocks(blocks) = &mut message.content else {
                continue;
            };
            for block in blocks {
                let ContentBlock::ToolResult { name, content, .. } = block else {
                    continue;
                };
                if !settings.prunable.is_allowed(name) || content == HARD_CLEAR_PLACEHOLDER {
                    continue;
                }
                total = total - content.len() + HARD_CLEAR_PLACEHOLDER.len();
                *content = HARD_CLEAR_PLACEHOLDER.to_string();
                hard_cleared += 1;
                if ratio(total, char_window) <= settings.hard_clear_ratio {
                    break 'clear;
                }
            }
        }
    }

    // Layer 3: drop whole messages against the history budget.
    let keep_mask = drop_layer_mask(&working, budget_chars, settings.keep_last_assistants);

    let mut kept = Vec::new();
    let mut dropped = Vec::new();
    for (message, keep) in working.into_iter().zip(keep_mask) {
        if keep {
            kept.push(message);
        } else {
            dropped.push(message);
        }
    }

    PruneOutcome {
        kept,
        dropped,
        soft_trimmed,
        hard_cleared,
        budget_chars,
    }
}

fn ratio(chars: usize, window: usize) -> f64 {
    if window == 0 {
        return f64::INFINITY;
    }
    chars as f64 / window as f64
}

fn total_chars(messages: &[Message]) -> usize {
    messages.iter().map(Message::char_len).sum()
}

fn prunable_tool_chars(messages: &[Message], settings: &PruneSettings) -> usize {
    messages
        .iter()
        .flat_map(Message::blocks)
        .filter_map(|b| match b {
            ContentBlock::ToolResult { name, content, .. }
                if settings.prunable.is_allowed(name) && content != HARD_CLEAR_PLACEHOLDER =>
            {
                Some(content.len())
            }
            _ => None,
        })
        .sum()
}

fn soft_trim_message(message: &mut Message, settings: &PruneSettings) -> usize {
    let MessageContent::Blocks(blocks) = &mut message.content else {
        return 0;
    };
    let mut trimmed = 0;
    for block in blocks {
        let ContentBlock::ToolResult { name, content, .. } = block else {
            continue;
        };
        if content.len() <= settings.soft_trim_max_chars || !settings.prunable.is_allowed(name) {
            continue;
        }
        let original_len = content.len();
        let head = char_prefix(content, settings.soft_trim_keep_chars);
        let tail = char_suffix(content, settings.soft_trim_keep_chars);
        *content = format!(
            "{head}\n...\n{tail}\n[Trimmed {} characters from the middle of this tool result]",
            original_len - head.len() - tail.len()
        );
        trimmed += 1;
    }
    trimmed
}

/// Keep/drop decision per message for the drop layer. Protects the last
/// `keep_last_assistants` assistant messages and everything after them,
/// then fills backward from that suffix until the budget runs out. When the
/// protected suffix alone exceeds the budget, falls back to a strictly
/// backward fill from the end.
fn drop_layer_mask(messages: &[Message], budget_chars: usize, keep_last_assistants: usize) -> Vec<bool> {
    let total = total_chars(messages);
    if total <= budget_chars {
        return vec![true; messages.len()];
    }

    let protected_start = protected_suffix_start(messages, keep_last_assistants);
    let protected_chars: usize = messages[protected_start..]
        .iter()
        .map(Message::char_len)
        .sum();

    let mut keep = vec![false; messages.len()];

    if protected_chars > budget_chars {
        // Degenerate case: even the protected suffix is too big. Keep the
        // largest fitting suffix, but never return an empty context.
        let mut used = 0usize;
        for (i, message) in messages.iter().enumerate().rev() {
            let len = message.char_len();
            if used + len > budget_chars && used > 0 {
                break;
            }
            keep[i] = true;
            used += len;
        }
        return keep;
    }

    for flag in keep.iter_mut().skip(protected_start) {
        *flag = true;
    }
    let mut used = protected_chars;
    for i in (0..protected_start).rev() {
        let len = messages[i].char_len();
        if used + len > budget_chars {
            break;
        }
        keep[i] = true;
        used += len;
    }
    keep
}

fn protected_suffix_start(messages: &[Message], keep_last_assistants: usize) -> usize {
    if keep_last_assistants == 0 {
        return messages.len();
    }
    let mut seen = 0usize;
    for (i, message) in messages.iter().enumerate().rev() {
        if message.role == Role::Assistant {
            seen += 1;
            if seen == keep_last_assistants {
                return i;
            }
        }
    }
    0
}

fn char_prefix(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut idx = max_bytes;
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    &s[..idx]
}

fn char_suffix(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut idx = s.len() - max_bytes;
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    &s[idx..]
}
