//! Tool trait, registry, and name-based execution policy.
//!
//! The runtime is polymorphic over tools: it forwards each tool's JSON
//! Schema to the model and hands back the model-supplied input without
//! inspecting it. Concrete tool implementations (file I/O, shell, grep)
//! live with the embedding application, not here.

use crate::error::Result;
use crate::provider::ToolDef;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Tool trait
// ============================================================================

/// A tool that can be executed by the agent.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name as surfaced to the model.
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema of the tool input.
    fn input_schema(&self) -> serde_json::Value;

    /// Execute the tool. Errors become tool-result content strings; they are
    /// never thrown into the turn loop.
    async fn execute(&self, input: serde_json::Value, ctx: &ToolContext) -> Result<String>;
}

/// Execution context handed to every tool call.
pub struct ToolContext {
    /// Combined cancellation: run-level ∪ tool-level. Tools are expected to
    /// observe it at their own suspension points and release resources.
    pub cancel: CancellationToken,
    pub workspace_dir: PathBuf,
    pub tool_use_id: String,
    pub session_key: String,
}

// ============================================================================
// Registry
// ============================================================================

/// An ordered collection of tools, addressable by name.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    by_name: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new(tools: Vec<Arc<dyn Tool>>) -> Self {
        let mut registry = Self::default();
        for tool in tools {
            registry.push(tool);
        }
        registry
    }

    pub fn push(&mut self, tool: Arc<dyn Tool>) {
        self.by_name.insert(tool.name().to_string(), self.tools.len());
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.by_name.get(name).map(|&i| &self.tools[i])
    }

    pub fn tools(&self) -> &[Arc<dyn Tool>] {
        &self.tools
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tool definitions for the provider context.
    pub fn tool_defs(&self) -> Vec<ToolDef> {
        self.tools
            .iter()
            .map(|t| ToolDef {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    /// Keep only tools passing every policy layer.
    pub fn filtered(&self, policies: &[&ToolPolicy]) -> Self {
        Self::new(
            self.tools
                .iter()
                .filter(|t| policies.iter().all(|p| p.is_allowed(t.name())))
                .map(Arc::clone)
                .collect(),
        )
    }
}

// ============================================================================
// Policy
// ============================================================================

/// Glob-based allow/deny policy over tool names. Deny overrides allow; an
/// empty allow list permits everything not denied.
#[derive(Debug, Clone, Default)]
pub struct ToolPolicy {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

impl ToolPolicy {
    pub fn deny_only(deny: Vec<String>) -> Self {
        Self {
            allow: Vec::new(),
            deny,
        }
    }

    pub fn is_allowed(&self, tool: &str) -> bool {
        if self.deny.iter().any(|p| glob_matches(p, tool)) {
            return false;
        }
        if self.allow.is_empty() {
            return true;
        }
        self.allow.iter().any(|p| glob_matches(p, tool))
    }
}

fn glob_matches(pattern: &str, name: &str) -> bool {
    glob::Pattern::new(pattern).is_ok_and(|p| p.matches(name))
}

// ============================================================================
// Sandbox
// ============================================================================

/// Sandbox switches that translate into a deny-only tool policy.
#[derive(Debug, Clone, Copy)]
pub struct SandboxSettings {
    pub enabled: bool,
    pub allow_exec: bool,
    pub allow_write: bool,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            allow_exec: true,
            allow_write: true,
        }
    }
}

impl SandboxSettings {
    /// Deny-only policy derived from the sandbox switches. Inactive sandboxes
    /// deny nothing.
    pub fn derived_policy(&self) -> ToolPolicy {
        let mut deny = Vec::new();
        if self.enabled {
            if !self.allow_exec {
                deny.push("exec".to_string());
            }
            if !self.allow_write {
                deny.push("write".to_string());
                deny.push("edit".to_string());
            }
        }
        ToolPolicy::deny_only(deny)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echo the input back"
        }
        fn input_schema(&self) -> serde_json::Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }
        async fn execute(&self, input: serde_json::Value, _ctx: &ToolContext) -> Result<String> {
            Ok(input["text"].as_str().unwrap_or_default().to_string())
        }
    }

    #[test]
    fn empty_allow_permits_everything_not_denied() {
        let policy = ToolPolicy::default();
        assert!(policy.is_allowed("read"));
        assert!(policy.is_allowed("anything"));
    }

    #[test]
    fn deny_overrides_allow() {
        let policy = ToolPolicy {
            allow: vec!["*".to_string()],
            deny: vec!["exec".to_string()],
        };
        assert!(policy.is_allowed("read"));
        assert!(!policy.is_allowed("exec"));
    }

    #[test]
    fn glob_patterns_match_tool_families() {
        let policy = ToolPolicy {
            allow: vec!["fs_*".to_string()],
            deny: vec!["fs_delete".to_string()],
        };
        assert!(policy.is_allowed("fs_read"));
        assert!(policy.is_allowed("fs_write"));
        assert!(!policy.is_allowed("fs_delete"));
        assert!(!policy.is_allowed("exec"));
    }

    #[test]
    fn invalid_pattern_matches_nothing() {
        let policy = ToolPolicy {
            allow: vec!["[".to_string()],
            deny: Vec::new(),
        };
        assert!(!policy.is_allowed("read"));
    }

    #[test]
    fn sandbox_derives_deny_only_policy() {
        let sandbox = SandboxSettings {
            enabled: true,
            allow_exec: false,
            allow_write: false,
        };
        let policy = sandbox.derived_policy();
        assert!(!policy.is_allowed("exec"));
        assert!(!policy.is_allowed("write"));
        assert!(!policy.is_allowed("edit"));
        assert!(policy.is_allowed("read"));

        let inactive = SandboxSettings::default().derived_policy();
        assert!(inactive.is_allowed("exec"));
    }

    #[test]
    fn registry_filters_through_policy_intersection() {
        let registry = ToolRegistry::new(vec![Arc::new(EchoTool)]);
        let allow_all = ToolPolicy::default();
        let deny_echo = ToolPolicy::deny_only(vec!["echo".to_string()]);

        assert_eq!(registry.filtered(&[&allow_all]).tools().len(), 1);
        // A tool passes only if it passes every layer.
        assert!(registry.filtered(&[&allow_all, &deny_echo]).is_empty());
    }

    #[tokio::test]
    async fn registry_lookup_and_defs() {
        let registry = ToolRegistry::new(vec![Arc::new(EchoTool)]);
        assert!(registry.get("echo").is_some());
        assert!(registry.get("nope").is_none());

        let defs = registry.tool_defs();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "echo");
    }
}
