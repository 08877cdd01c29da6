//! Tool-result pairing guard.
//!
//! Every `tool_use` block an assistant message introduces must eventually be
//! answered by a `tool_result` block with the same id in a later user
//! message. Crashes, aborts, and misbehaving models all break that pairing;
//! the guard restores it by synthesizing placeholder results before any
//! append that would otherwise leave a dangling `tool_use`, and again when a
//! run terminates.

use crate::error::Result;
use crate::model::{ContentBlock, Message};
use crate::session::{CompactionEntry, SessionKey, SessionStore};
use std::collections::HashMap;
use std::sync::Mutex;

/// Content of a synthesized tool result.
pub const SYNTHETIC_RESULT_TEXT: &str =
    "Tool execution was interrupted before a result was recorded.";

/// Decorator around [`SessionStore`] that maintains the tool pairing
/// invariant. One guard per store instance; sessions share the guard but
/// each gets its own pending map.
pub struct ToolResultGuard {
    store: SessionStore,
    /// Per session: `(tool_use_id, tool_name)` in emission order.
    pending: Mutex<HashMap<SessionKey, Vec<(String, String)>>>,
}

impl ToolResultGuard {
    pub fn new(store: SessionStore) -> Self {
        Self {
            store,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Append a message, interposing a synthetic result carrier first if the
    /// message would strand pending `tool_use` ids.
    pub fn append(&self, key: &SessionKey, message: &Message) -> Result<String> {
        let carried_ids: Vec<String> = message
            .tool_result_ids()
            .into_iter()
            .map(str::to_string)
            .collect();

        if carried_ids.is_empty() {
            self.flush_pending(key)?;
        } else {
            let mut pending = self.pending.lock().expect("guard pending poisoned");
            if let Some(list) = pending.get_mut(key) {
                list.retain(|(id, _)| !carried_ids.contains(id));
            }
        }

        let entry_id = self.store.append(key, message)?;

        let new_uses = message.tool_uses();
        if !new_uses.is_empty() {
            let mut pending = self.pending.lock().expect("guard pending poisoned");
            let list = pending.entry(key.clone()).or_default();
            for (id, name) in new_uses {
                list.push((id.to_string(), name.to_string()));
            }
        }

        Ok(entry_id)
    }

    /// Synthesize results for any still-pending `tool_use` ids. Called on
    /// every run termination path (success, error, cancellation).
    pub fn flush_pending(&self, key: &SessionKey) -> Result<()> {
        let stranded = {
            let mut pending = self.pending.lock().expect("guard pending poisoned");
            match pending.remove(key) {
                Some(list) if !list.is_empty() => list,
                _ => return Ok(()),
            }
        };

        tracing::warn!(
            session = %key,
            count = stranded.len(),
            "synthesizing results for unanswered tool calls"
        );

        let blocks: Vec<ContentBlock> = stranded
            .into_iter()
            .map(|(id, name)| ContentBlock::tool_result(id, name, SYNTHETIC_RESULT_TEXT))
            .collect();
        self.store.append(key, &Message::user_blocks(blocks))?;
        Ok(())
    }

    /// Pending ids for a session (test and introspection hook).
    pub fn pending_ids(&self, key: &SessionKey) -> Vec<String> {
        self.pending
            .lock()
            .expect("guard pending poisoned")
            .get(key)
            .map(|list| list.iter().map(|(id, _)| id.clone()).collect())
            .unwrap_or_default()
    }

    // Store passthroughs; the guard is the only handle the controller holds.

    pub fn load(&self, key: &SessionKey) -> Result<Vec<Message>> {
        self.store.load(key)
    }

    pub fn list(&self) -> Result<Vec<SessionKey>> {
        self.store.list()
    }

    pub fn clear(&self, key: &SessionKey) -> Result<()> {
        self.pending
            .lock()
            .expect("guard pending poisoned")
            .remove(key);
        self.store.clear(key)
    }

    pub fn append_compaction(
        &self,
        key: &SessionKey,
        summary: &str,
        first_kept_entry_id: &str,
        tokens_before: u64,
    ) -> Result<String> {
        self.store
            .append_compaction(key, summary, first_kept_entry_id, tokens_before)
    }

    pub fn latest_compaction(&self, key: &SessionKey) -> Result<Option<CompactionEntry>> {
        self.store.latest_compaction(key)
    }

    pub fn resolve_message_entry_id(
        &self,
        key: &SessionKey,
        message: &Message,
    ) -> Result<Option<String>> {
        self.store.resolve_message_entry_id(key, message)
    }
}

/// Check the pairing invariant over a transcript: every `tool_use` id has a
/// matching `tool_result` in some later user message.
pub fn verify_tool_pairing(messages: &[Message]) -> bool {
    let mut open: Vec<&str> = Vec::new();
    for message in messages {
        for id in message.tool_result_ids() {
            open.retain(|&o| o != id);
        }
        for (id, _) in message.tool_uses() {
            open.push(id);
        }
    }
    open.is_empty()
}
