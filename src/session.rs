//! Append-only session transcripts.
//!
//! One JSONL file per session key: a header line followed by entry records,
//! one per line. The store only ever appends; compaction writes a boundary
//! record rather than rewriting history. Loads tolerate a truncated final
//! line (interrupted write) and skip undecodable lines with a warning.

use crate::error::{Error, Result};
use crate::model::{Message, MessageContent, Role};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

const SESSION_VERSION: u8 = 1;

pub(crate) const COMPACTION_SUMMARY_PREFIX: &str =
    "The conversation history before this point was compacted into the following summary:\n\n<summary>\n";
pub(crate) const COMPACTION_SUMMARY_SUFFIX: &str = "\n</summary>";

// ============================================================================
// Session keys
// ============================================================================

/// A normalized session key of the shape `agent:<agentId>:<tail>`.
///
/// The tail is `main`, a caller-supplied id, or `subagent:<uuid>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    /// Normalize caller input into a session key.
    ///
    /// `None` defaults to the agent's main session. A value that already
    /// looks like a full key (`agent:...`) is validated as-is; anything else
    /// is treated as a bare session id under this agent.
    pub fn normalize(agent_id: &str, input: Option<&str>) -> Result<Self> {
        let key = match input {
            None => format!("agent:{agent_id}:main"),
            Some(raw) if raw.starts_with("agent:") => raw.to_string(),
            Some(raw) => format!("agent:{agent_id}:{raw}"),
        };

        let parts: Vec<&str> = key.split(':').collect();
        let well_formed = parts.len() >= 3
            && parts[0] == "agent"
            && parts.iter().all(|p| !p.is_empty())
            && parts
                .iter()
                .all(|p| p.chars().all(|c| c.is_ascii_alphanumeric() || "-_.".contains(c)));
        if !well_formed {
            return Err(Error::InvalidSessionKey(key));
        }
        Ok(Self(key))
    }

    /// A fresh subagent key under this agent.
    pub fn subagent(agent_id: &str) -> Self {
        Self(format!(
            "agent:{agent_id}:subagent:{}",
            uuid::Uuid::new_v4()
        ))
    }

    pub fn is_subagent(&self) -> bool {
        self.0.splitn(3, ':').nth(2).is_some_and(|tail| tail.starts_with("subagent:"))
    }

    pub fn is_main(&self) -> bool {
        self.0.splitn(3, ':').nth(2) == Some("main")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// On-disk records
// ============================================================================

/// First line of every session file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHeader {
    pub r#type: String,
    pub version: u8,
    pub key: String,
    pub timestamp: String,
}

impl SessionHeader {
    fn new(key: &SessionKey) -> Self {
        Self {
            r#type: "session".to_string(),
            version: SESSION_VERSION,
            key: key.as_str().to_string(),
            timestamp: now_rfc3339(),
        }
    }
}

/// Base fields shared by every entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryBase {
    pub id: String,
    pub timestamp: String,
}

impl EntryBase {
    fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: now_rfc3339(),
        }
    }
}

/// A session entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEntry {
    Message(MessageEntry),
    Compaction(CompactionEntry),
}

impl SessionEntry {
    pub const fn base(&self) -> &EntryBase {
        match self {
            Self::Message(e) => &e.base,
            Self::Compaction(e) => &e.base,
        }
    }

    pub fn id(&self) -> &str {
        &self.base().id
    }
}

/// Message entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEntry {
    #[serde(flatten)]
    pub base: EntryBase,
    pub message: Message,
}

/// Compaction boundary record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionEntry {
    #[serde(flatten)]
    pub base: EntryBase,
    pub summary: String,
    pub first_kept_entry_id: String,
    pub tokens_before: u64,
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// The synthetic user message a compaction summary materializes as on load.
pub(crate) fn compaction_summary_message(summary: &str, timestamp_rfc3339: &str) -> Message {
    let timestamp = chrono::DateTime::parse_from_rfc3339(timestamp_rfc3339)
        .map(|dt| dt.timestamp_millis())
        .unwrap_or_else(|_| chrono::Utc::now().timestamp_millis());
    Message {
        role: Role::User,
        content: MessageContent::Text(format!(
            "{COMPACTION_SUMMARY_PREFIX}{summary}{COMPACTION_SUMMARY_SUFFIX}"
        )),
        timestamp,
    }
}

// ============================================================================
// Store
// ============================================================================

/// Append-only JSONL store, one file per session key.
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn file_path(&self, key: &SessionKey) -> PathBuf {
        let sanitized: String = key
            .as_str()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || "-_.".contains(c) {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        self.dir.join(format!("{sanitized}.jsonl"))
    }

    fn append_entry(&self, key: &SessionKey, entry: &SessionEntry) -> Result<String> {
        let path = self.file_path(key);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;

        if file.metadata()?.len() == 0 {
            let header = serde_json::to_string(&SessionHeader::new(key))?;
            file.write_all(header.as_bytes())?;
            file.write_all(b"\n")?;
        }

        let line = serde_json::to_string(entry)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        file.sync_data()?;
        Ok(entry.id().to_string())
    }

    /// Append a message. Durable before return; returns the entry id.
    pub fn append(&self, key: &SessionKey, message: &Message) -> Result<String> {
        self.append_entry(
            key,
            &SessionEntry::Message(MessageEntry {
                base: EntryBase::new(),
                message: message.clone(),
            }),
        )
    }

    /// Record a compaction boundary.
    pub fn append_compaction(
        &self,
        key: &SessionKey,
        summary: &str,
        first_kept_entry_id: &str,
        tokens_before: u64,
    ) -> Result<String> {
        self.append_entry(
            key,
            &SessionEntry::Compaction(CompactionEntry {
                base: EntryBase::new(),
                summary: summary.to_string(),
                first_kept_entry_id: first_kept_entry_id.to_string(),
                tokens_before,
            }),
        )
    }

    /// Read all entries for a session. Missing files yield an empty list.
    /// A truncated or corrupt line is skipped, not fatal.
    pub fn load_entries(&self, key: &SessionKey) -> Result<Vec<SessionEntry>> {
        let path = self.file_path(key);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&path)?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        let mut lines = reader.lines().enumerate().peekable();

        // Header line; legacy files without one fall through to entry parsing.
        if let Some((_, Ok(first))) = lines.peek() {
            if serde_json::from_str::<SessionHeader>(first).is_ok() {
                lines.next();
            }
        }

        while let Some((line_num, line)) = lines.next() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<SessionEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(err) => {
                    if lines.peek().is_none() {
                        // Partial last line from an interrupted append.
                        tracing::debug!(
                            session = %key,
                            line = line_num + 1,
                            "skipping truncated final session line: {err}"
                        );
                    } else {
                        tracing::warn!(
                            session = %key,
                            line = line_num + 1,
                            "skipping undecodable session line: {err}"
                        );
                    }
                }
            }
        }

        Ok(entries)
    }

    /// Load the transcript: messages after the last compaction cut, with the
    /// compaction summary (if any) materialized as a leading user message.
    pub fn load(&self, key: &SessionKey) -> Result<Vec<Message>> {
        let entries = self.load_entries(key)?;
        Ok(materialize(&entries))
    }

    /// The most recent compaction boundary, if any.
    pub fn latest_compaction(&self, key: &SessionKey) -> Result<Option<CompactionEntry>> {
        let entries = self.load_entries(key)?;
        Ok(entries.into_iter().rev().find_map(|e| match e {
            SessionEntry::Compaction(c) => Some(c),
            SessionEntry::Message(_) => None,
        }))
    }

    /// All known session keys, read from file headers.
    pub fn list(&self) -> Result<Vec<SessionKey>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("jsonl") {
                continue;
            }
            if let Some(key) = read_header_key(&path) {
                keys.push(SessionKey(key));
            }
        }
        keys.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(keys)
    }

    /// Delete a session transcript. Missing sessions are fine.
    pub fn clear(&self, key: &SessionKey) -> Result<()> {
        let path = self.file_path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Find the entry id of a persisted message by role, timestamp, and text.
    pub fn resolve_message_entry_id(
        &self,
        key: &SessionKey,
        message: &Message,
    ) -> Result<Option<String>> {
        let entries = self.load_entries(key)?;
        Ok(entries.iter().find_map(|e| match e {
            SessionEntry::Message(m)
                if m.message.role == message.role
                    && m.message.timestamp == message.timestamp
                    && m.message.text() == message.text() =>
            {
                Some(m.base.id.clone())
            }
            _ => None,
        }))
    }
}

/// Project entries onto the message list the loop works with.
pub(crate) fn materialize(entries: &[SessionEntry]) -> Vec<Message> {
    let last_compaction = entries.iter().enumerate().rev().find_map(|(i, e)| match e {
        SessionEntry::Compaction(c) => Some((i, c)),
        SessionEntry::Message(_) => None,
    });

    let Some((compaction_index, compaction)) = last_compaction else {
        return entries
            .iter()
            .filter_map(|e| match e {
                SessionEntry::Message(m) => Some(m.message.clone()),
                SessionEntry::Compaction(_) => None,
            })
            .collect();
    };

    // Keep from the first-kept entry onward; if the id is gone (should not
    // happen), fall back to everything after the boundary record.
    let start = entries
        .iter()
        .position(|e| e.id() == compaction.first_kept_entry_id)
        .unwrap_or(compaction_index + 1);

    let mut messages = vec![compaction_summary_message(
        &compaction.summary,
        &compaction.base.timestamp,
    )];
    messages.extend(entries[start..].iter().filter_map(|e| match e {
        SessionEntry::Message(m) => Some(m.message.clone()),
        SessionEntry::Compaction(_) => None,
    }));
    messages
}

fn read_header_key(path: &Path) -> Option<String> {
    let file = File::open(path).ok()?;
    let mut reader = BufReader::new(file);
    let mut first = String::new();
    reader.read_line(&mut first).ok()?;
    serde_json::from_str::<SessionHeader>(&first)
        .ok()
        .map(|h| h.key)
}
