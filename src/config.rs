//! Agent configuration.

use crate::compaction::CompactionSettings;
use crate::heartbeat::HeartbeatSettings;
use crate::provider::ModelDef;
use crate::prune::PruneSettings;
use crate::tools::{SandboxSettings, ToolPolicy};
use std::path::PathBuf;
use std::time::Duration;

/// Warn when the configured context window drops below this many tokens.
pub const CONTEXT_TOKENS_WARN_FLOOR: u32 = 8_000;
/// Refuse to run below this many tokens.
pub const CONTEXT_TOKENS_HARD_FLOOR: u32 = 1_000;

/// Retry behavior for rate-limited LLM calls.
#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fractional jitter applied either way around the computed delay.
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay_ms: 300,
            max_delay_ms: 30_000,
            jitter: 0.1,
        }
    }
}

/// Feature switches for the optional collaborator subsystems.
#[derive(Debug, Clone, Copy)]
pub struct FeatureFlags {
    pub enable_memory: bool,
    pub enable_context: bool,
    pub enable_skills: bool,
    pub enable_heartbeat: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            enable_memory: false,
            enable_context: true,
            enable_skills: true,
            enable_heartbeat: false,
        }
    }
}

/// Construction-time configuration for an [`Agent`](crate::agent::Agent).
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub agent_id: String,
    pub model: ModelDef,
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    /// Inner-loop iterations before a run is cut off.
    pub max_turns: usize,
    /// Context window budget in tokens.
    pub context_tokens: u32,
    /// Global lane width: concurrent runs across all sessions.
    pub max_concurrent_runs: usize,
    pub session_dir: PathBuf,
    pub workspace_dir: PathBuf,
    pub memory_dir: Option<PathBuf>,
    /// Skill directories in precedence order (later wins on collision).
    pub skill_dirs: Vec<PathBuf>,
    pub tool_policy: Option<ToolPolicy>,
    pub sandbox: SandboxSettings,
    pub features: FeatureFlags,
    pub retry: RetrySettings,
    pub prune: PruneSettings,
    pub compaction: CompactionSettings,
    pub heartbeat_interval: Option<Duration>,
}

impl AgentConfig {
    /// A config with the standard defaults for the given agent id. The
    /// session store lands under the workspace unless overridden.
    pub fn new(agent_id: impl Into<String>, workspace_dir: impl Into<PathBuf>) -> Self {
        let workspace_dir = workspace_dir.into();
        Self {
            agent_id: agent_id.into(),
            model: ModelDef::default(),
            system_prompt: None,
            temperature: None,
            max_turns: 20,
            context_tokens: 200_000,
            max_concurrent_runs: 4,
            session_dir: workspace_dir.join("sessions"),
            workspace_dir,
            memory_dir: None,
            skill_dirs: Vec::new(),
            tool_policy: None,
            sandbox: SandboxSettings::default(),
            features: FeatureFlags::default(),
            retry: RetrySettings::default(),
            prune: PruneSettings::default(),
            compaction: CompactionSettings::default(),
            heartbeat_interval: None,
        }
    }

    /// Default skill directory layout under a workspace: global and managed
    /// locations first, workspace last so it wins collisions.
    pub fn default_skill_dirs(&self) -> Vec<PathBuf> {
        if !self.skill_dirs.is_empty() {
            return self.skill_dirs.clone();
        }
        vec![
            self.workspace_dir.join(".skills/global"),
            self.workspace_dir.join(".skills/managed"),
            self.workspace_dir.join("skills"),
        ]
    }

    /// Heartbeat settings derived from this config.
    pub fn heartbeat_settings(&self) -> HeartbeatSettings {
        let mut settings = HeartbeatSettings {
            workspace_dir: self.workspace_dir.clone(),
            ..HeartbeatSettings::default()
        };
        if let Some(interval) = self.heartbeat_interval {
            settings.interval = interval;
        }
        settings
    }
}
