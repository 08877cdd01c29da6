//! Tiller - an embeddable AI agent runtime.
//!
//! The crate drives a conversation with an LLM, executes tools on the
//! model's behalf, persists session transcripts, keeps the prompt inside
//! the context window, and allows in-flight steering of a running turn.
//! Front-ends (CLI, HTTP) and provider wire adapters live with the
//! embedding application; this crate defines the contracts they plug into.
//!
//! The moving parts:
//! - [`agent::Agent`] - run controller and dual-level turn loop
//! - [`session`] / [`guard`] - append-only transcript with the
//!   tool_use/tool_result pairing guard
//! - [`lanes`] - per-session serial + globally bounded scheduling
//! - [`prune`] / [`compaction`] - progressive trimming and adaptive
//!   chunked summarization
//! - [`skills`] / [`context`] - slash-command routing and workspace
//!   bootstrap files
//! - [`heartbeat`] - coalesced self-rescheduling wakes

#![forbid(unsafe_code)]
#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

pub mod agent;
pub mod compaction;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod guard;
pub mod heartbeat;
pub mod lanes;
pub mod model;
pub mod provider;
pub mod prune;
pub mod session;
pub mod skills;
pub mod tools;

pub use agent::{Agent, RunResult, Subscription};
pub use config::AgentConfig;
pub use error::{Error, Result};
pub use events::AgentEvent;
pub use model::{ContentBlock, Message, MessageContent, Role};
pub use provider::{LlmEvent, LlmResult, ModelDef, Provider};
pub use session::SessionKey;
pub use tools::{Tool, ToolContext, ToolPolicy};
