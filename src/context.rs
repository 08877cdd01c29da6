//! Workspace bootstrap context.
//!
//! A known set of markdown files in the workspace is injected into the
//! system prompt. Oversized files are truncated head+tail with a marker so
//! one runaway file cannot eat the prompt budget.

use std::fs;
use std::path::Path;

/// Bootstrap files read from the workspace, in injection order.
pub const BOOTSTRAP_FILES: &[&str] = &[
    "AGENTS.md",
    "SOUL.md",
    "USER.md",
    "MEMORY.md",
    "HEARTBEAT.md",
    "IDENTITY.md",
    "TOOLS.md",
    "BOOTSTRAP.md",
];

/// Files loaded for subagent sessions: task-scoped workers get operating
/// instructions and tool notes, not persona or memory files.
const SUBAGENT_FILES: &[&str] = &["AGENTS.md", "TOOLS.md"];

/// Per-file size cap before head+tail truncation kicks in.
pub const MAX_BOOTSTRAP_FILE_CHARS: usize = 20_000;

/// What kind of session a context is being assembled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Main,
    /// Caller-keyed sessions behave like main.
    Custom,
    Subagent,
}

/// Assemble the Project Context block for the system prompt. Returns `None`
/// when no bootstrap file exists or all are empty.
pub fn load_project_context(workspace_dir: &Path, kind: SessionKind) -> Option<String> {
    let files: &[&str] = match kind {
        SessionKind::Main | SessionKind::Custom => BOOTSTRAP_FILES,
        SessionKind::Subagent => SUBAGENT_FILES,
    };

    let mut sections = Vec::new();
    for name in files {
        let path = workspace_dir.join(name);
        let Ok(raw) = fs::read_to_string(&path) else {
            continue;
        };
        if raw.trim().is_empty() {
            continue;
        }
        let content = truncate_head_tail(&raw, MAX_BOOTSTRAP_FILE_CHARS);
        sections.push(format!("## {name}\n\n{content}"));
    }

    if sections.is_empty() {
        return None;
    }
    Some(format!("# Project Context\n\n{}", sections.join("\n\n")))
}

/// Keep the head and tail of oversized content with an elision marker.
pub fn truncate_head_tail(content: &str, max_chars: usize) -> String {
    if content.len() <= max_chars {
        return content.to_string();
    }
    let keep = max_chars / 2;
    let head = floor_boundary(content, keep);
    let tail = ceil_boundary(content, content.len() - keep);
    format!(
        "{}\n\n[... {} characters truncated ...]\n\n{}",
        &content[..head],
        content[head..tail].chars().count(),
        &content[tail..]
    )
}

fn floor_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_boundary(s: &str, mut idx: usize) -> usize {
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn loads_files_in_declared_order() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("SOUL.md"), "persona").unwrap();
        fs::write(dir.path().join("AGENTS.md"), "rules").unwrap();

        let context = load_project_context(dir.path(), SessionKind::Main).unwrap();
        let agents = context.find("## AGENTS.md").unwrap();
        let soul = context.find("## SOUL.md").unwrap();
        assert!(agents < soul);
        assert!(context.starts_with("# Project Context"));
    }

    #[test]
    fn missing_and_empty_files_are_skipped() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("USER.md"), "  \n").unwrap();
        assert!(load_project_context(dir.path(), SessionKind::Main).is_none());
    }

    #[test]
    fn subagents_get_reduced_file_set() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("SOUL.md"), "persona").unwrap();
        fs::write(dir.path().join("AGENTS.md"), "rules").unwrap();

        let context = load_project_context(dir.path(), SessionKind::Subagent).unwrap();
        assert!(context.contains("AGENTS.md"));
        assert!(!context.contains("SOUL.md"));
    }

    #[test]
    fn oversized_content_keeps_head_and_tail() {
        let content = format!("START{}END", "m".repeat(50_000));
        let truncated = truncate_head_tail(&content, 1_000);
        assert!(truncated.starts_with("START"));
        assert!(truncated.ends_with("END"));
        assert!(truncated.contains("characters truncated"));
        assert!(truncated.len() < 1_200);
    }

    #[test]
    fn small_content_is_untouched() {
        assert_eq!(truncate_head_tail("short", 1_000), "short");
    }

    #[test]
    fn truncation_respects_utf8() {
        // Two-byte chars: 10k chars = 20k bytes. keep = 50 bytes per end,
        // which is 25 chars, so 9_950 chars fall in the elided middle.
        let content = "é".repeat(10_000);
        let truncated = truncate_head_tail(&content, 100);
        assert!(truncated.contains("[... 9950 characters truncated ...]"));
    }
}
