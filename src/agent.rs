//! The agent runtime: run controller and turn loop.
//!
//! A run flows through two lanes (session serial, global bounded), then the
//! loop proper: load history, route slash commands, append the user
//! message, compact if the reserve is violated, and iterate turns. Each
//! turn prunes the history, streams one LLM response, executes any tool
//! calls serially, and checks the steering queue between tools. An outer
//! loop re-enters with follow-up messages queued while the agent was busy.
//!
//! Callers observe a run twice: as a typed event stream re-emitted to
//! subscribers, and as the awaited result of [`Agent::run`].

use crate::compaction::{self, CompactionOutcome};
use crate::config::{AgentConfig, RetrySettings, CONTEXT_TOKENS_HARD_FLOOR, CONTEXT_TOKENS_WARN_FLOOR};
use crate::context::{load_project_context, SessionKind};
use crate::error::{classify_provider_error, Error, ErrorClass, Result};
use crate::events::{event_stream, AgentEvent, EventSink, EventStream};
use crate::guard::ToolResultGuard;
use crate::heartbeat::{HeartbeatCallback, HeartbeatOutcome, HeartbeatScheduler};
use crate::lanes::{session_lane, EnqueueOptions, LaneRegistry, GLOBAL_LANE};
use crate::model::{ContentBlock, Message};
use crate::provider::{Context, LlmToolCall, Provider, StreamOptions};
use crate::prune::prune;
use crate::session::{SessionKey, SessionStore, COMPACTION_SUMMARY_PREFIX};
use crate::skills::{load_skills, route_input, SkillSet};
use crate::tools::{Tool, ToolContext, ToolRegistry};
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Tool-result content for calls skipped by a steering interrupt.
pub const SKIPPED_TOOL_RESULT_TEXT: &str = "Skipped due to queued user message.";

/// Queue waits longer than this log a warning.
const LANE_WARN_AFTER: Duration = Duration::from_secs(10);

/// Cap on the sub-agent summary excerpt appended to the parent session.
const SUBAGENT_SUMMARY_CHARS: usize = 600;

const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful AI agent. Use the available tools to complete the user's request, then reply with a concise final answer.";

const MEMORY_GUIDANCE: &str = "# Memory\n\nA persistent memory directory is available. Consult it for relevant prior context with your read tool, and record durable facts worth keeping with your write tool.";

// ============================================================================
// Results
// ============================================================================

/// Result of one completed run.
#[derive(Debug, Clone, Default)]
pub struct RunResult {
    pub run_id: String,
    pub text: String,
    pub turns: usize,
    pub tool_calls: usize,
    pub skill_triggered: Option<String>,
    pub memories_used: Option<Vec<String>>,
    /// Set when the run failed; [`Agent::run`] rejects with this text.
    pub error: Option<String>,
}

/// Handle returned by [`Agent::subscribe`].
pub struct Subscription {
    id: u64,
    inner: Weak<AgentInner>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(inner) = self.inner.upgrade() {
            inner
                .subscribers
                .lock()
                .expect("subscribers poisoned")
                .retain(|(id, _)| *id != self.id);
        }
    }
}

type Listener = Arc<dyn Fn(&AgentEvent) + Send + Sync>;

// ============================================================================
// Agent
// ============================================================================

struct AgentInner {
    config: AgentConfig,
    provider: Arc<dyn Provider>,
    tools: ToolRegistry,
    guard: ToolResultGuard,
    lanes: LaneRegistry,
    skills: SkillSet,
    heartbeat: HeartbeatScheduler,
    steering: Mutex<HashMap<SessionKey, VecDeque<String>>>,
    aborts: Mutex<HashMap<String, CancellationToken>>,
    subscribers: Mutex<Vec<(u64, Listener)>>,
    next_subscriber_id: AtomicU64,
}

/// The agent runtime. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl Agent {
    /// Construct an agent. Validates the context budget: refuses below the
    /// hard floor, warns below the soft floor.
    pub fn new(
        config: AgentConfig,
        provider: Arc<dyn Provider>,
        tools: Vec<Arc<dyn Tool>>,
    ) -> Result<Self> {
        if config.context_tokens < CONTEXT_TOKENS_HARD_FLOOR {
            return Err(Error::config(format!(
                "context_tokens {} below minimum {CONTEXT_TOKENS_HARD_FLOOR}",
                config.context_tokens
            )));
        }
        if config.context_tokens < CONTEXT_TOKENS_WARN_FLOOR {
            tracing::warn!(
                context_tokens = config.context_tokens,
                "context budget is very small; expect aggressive pruning"
            );
        }

        let store = SessionStore::new(&config.session_dir)?;
        let lanes = LaneRegistry::new();
        lanes.ensure_lane(GLOBAL_LANE, config.max_concurrent_runs);

        let skills = if config.features.enable_skills {
            load_skills(&config.default_skill_dirs())
        } else {
            SkillSet::default()
        };

        let heartbeat = HeartbeatScheduler::new(config.heartbeat_settings());

        let inner = Arc::new(AgentInner {
            guard: ToolResultGuard::new(store),
            tools: ToolRegistry::new(tools),
            provider,
            skills,
            heartbeat,
            lanes: lanes.clone(),
            config,
            steering: Mutex::new(HashMap::new()),
            aborts: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            next_subscriber_id: AtomicU64::new(1),
        });

        // The heartbeat defers to in-flight or queued runs.
        let probe_lanes = lanes;
        inner.heartbeat.set_busy_probe(Some(Arc::new(move || {
            probe_lanes.active_count(GLOBAL_LANE) > 0 || probe_lanes.queued_count(GLOBAL_LANE) > 0
        })));

        Ok(Self { inner })
    }

    // ------------------------------------------------------------------
    // Public API
    // ------------------------------------------------------------------

    /// Run one user message against a session. `session` is a session id or
    /// a full `agent:<id>:<tail>` key.
    pub async fn run(&self, session: &str, user_message: &str) -> Result<RunResult> {
        let key = SessionKey::normalize(&self.inner.config.agent_id, Some(session))?;
        self.run_on_key(key, user_message.to_string()).await
    }

    /// Run against the agent's main session.
    pub async fn run_main(&self, user_message: &str) -> Result<RunResult> {
        let key = SessionKey::normalize(&self.inner.config.agent_id, None)?;
        self.run_on_key(key, user_message.to_string()).await
    }

    /// Subscribe to run events. Events from all runs are delivered in push
    /// order.
    pub fn subscribe(
        &self,
        listener: impl Fn(&AgentEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .subscribers
            .lock()
            .expect("subscribers poisoned")
            .push((id, Arc::new(listener)));
        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Cancel one run, or every active run.
    pub fn abort(&self, run_id: Option<&str>) {
        let aborts = self.inner.aborts.lock().expect("aborts poisoned");
        match run_id {
            Some(run_id) => {
                if let Some(token) = aborts.get(run_id) {
                    token.cancel();
                }
            }
            None => {
                for token in aborts.values() {
                    token.cancel();
                }
            }
        }
    }

    /// Queue steering text for a session. Consumed at the loop's designated
    /// checkpoints only.
    pub fn steer(&self, session: &str, text: &str) -> Result<()> {
        let key = SessionKey::normalize(&self.inner.config.agent_id, Some(session))?;
        self.inner
            .steering
            .lock()
            .expect("steering poisoned")
            .entry(key)
            .or_default()
            .push_back(text.to_string());
        Ok(())
    }

    /// Delete a session transcript.
    pub fn reset(&self, session: &str) -> Result<()> {
        let key = SessionKey::normalize(&self.inner.config.agent_id, Some(session))?;
        self.inner.guard.clear(&key)?;
        self.inner.lanes.delete_lane(&session_lane(&key));
        Ok(())
    }

    /// The transcript for a session, compaction summary materialized.
    pub fn get_history(&self, session: &str) -> Result<Vec<Message>> {
        let key = SessionKey::normalize(&self.inner.config.agent_id, Some(session))?;
        self.inner.guard.load(&key)
    }

    pub fn list_sessions(&self) -> Result<Vec<SessionKey>> {
        self.inner.guard.list()
    }

    /// Start the heartbeat timer, optionally installing a callback first.
    pub fn start_heartbeat(&self, callback: Option<HeartbeatCallback>) {
        if !self.inner.config.features.enable_heartbeat {
            tracing::debug!("heartbeat disabled by feature flag");
            return;
        }
        if callback.is_some() {
            self.inner.heartbeat.set_callback(callback);
        }
        self.inner.heartbeat.start();
    }

    pub fn stop_heartbeat(&self) {
        self.inner.heartbeat.stop();
    }

    /// Run the heartbeat policy layer immediately.
    pub async fn trigger_heartbeat(&self) -> Result<HeartbeatOutcome> {
        self.inner.heartbeat.trigger("manual").await
    }

    // ------------------------------------------------------------------
    // Run orchestration
    // ------------------------------------------------------------------

    async fn run_on_key(&self, key: SessionKey, user_message: String) -> Result<RunResult> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        self.inner
            .aborts
            .lock()
            .expect("aborts poisoned")
            .insert(run_id.clone(), cancel.clone());

        let result = self
            .run_through_lanes(key, run_id.clone(), cancel, user_message)
            .await;

        self.inner
            .aborts
            .lock()
            .expect("aborts poisoned")
            .remove(&run_id);
        result
    }

    async fn run_through_lanes(
        &self,
        key: SessionKey,
        run_id: String,
        cancel: CancellationToken,
        user_message: String,
    ) -> Result<RunResult> {
        let lane = session_lane(&key);
        let agent = self.clone();
        let key_for_log = key.clone();

        let session_slot = self.inner.lanes.enqueue(
            &lane,
            EnqueueOptions {
                warn_after: Some(LANE_WARN_AFTER),
                on_wait: Some(Box::new(move |waited| {
                    tracing::warn!(session = %key_for_log, ?waited, "run queued behind session lane");
                })),
            },
            async move {
                let inner_agent = agent.clone();
                agent
                    .inner
                    .lanes
                    .enqueue(GLOBAL_LANE, EnqueueOptions::default(), async move {
                        inner_agent
                            .execute_run(key, run_id, cancel, user_message)
                            .await
                    })
                    .await
            },
        );

        session_slot.await??
    }

    /// Drive the loop's event stream to completion, re-emitting every event
    /// to subscribers, then settle the public result.
    async fn execute_run(
        &self,
        key: SessionKey,
        run_id: String,
        cancel: CancellationToken,
        user_message: String,
    ) -> Result<RunResult> {
        let mut stream = run_loop(LoopParams {
            agent: self.clone(),
            key,
            run_id,
            cancel,
            user_message,
        });
        let result_handle = stream.result_handle();

        while let Some(event) = stream.next().await {
            self.emit(&event);
        }

        let result = result_handle.wait().await;
        match result.error {
            Some(error) => Err(Error::provider(error)),
            None => Ok(result),
        }
    }

    fn emit(&self, event: &AgentEvent) {
        let listeners: Vec<Listener> = self
            .inner
            .subscribers
            .lock()
            .expect("subscribers poisoned")
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(event);
        }
    }

    fn drain_steering(&self, key: &SessionKey) -> Vec<String> {
        self.inner
            .steering
            .lock()
            .expect("steering poisoned")
            .get_mut(key)
            .map(|queue| queue.drain(..).collect())
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // System prompt and tool resolution
    // ------------------------------------------------------------------

    fn session_kind(key: &SessionKey) -> SessionKind {
        if key.is_subagent() {
            SessionKind::Subagent
        } else if key.is_main() {
            SessionKind::Main
        } else {
            SessionKind::Custom
        }
    }

    fn assemble_system_prompt(&self, kind: SessionKind) -> String {
        let config = &self.inner.config;
        let mut parts = vec![config
            .system_prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string())];

        if config.features.enable_context {
            if let Some(context) = load_project_context(&config.workspace_dir, kind) {
                parts.push(context);
            }
        }

        if config.features.enable_skills {
            let block = self.inner.skills.prompt_block();
            if !block.is_empty() {
                parts.push(block);
            }
        }

        if config.features.enable_memory {
            if let Some(dir) = &config.memory_dir {
                parts.push(format!("{MEMORY_GUIDANCE}\n\nMemory directory: {}", dir.display()));
            }
        }

        if config.sandbox.enabled {
            let mut note = String::from("# Sandbox\n\nYou are operating in a sandboxed workspace.");
            if !config.sandbox.allow_exec {
                note.push_str(" Command execution is disabled.");
            }
            if !config.sandbox.allow_write {
                note.push_str(" File writes are disabled.");
            }
            parts.push(note);
        }

        parts.join("\n\n")
    }

    /// Tools for a run: the configured registry plus the subagent spawner
    /// (parents only), filtered through every policy layer.
    fn resolve_tools(&self, kind: SessionKind) -> ToolRegistry {
        let mut registry = self.inner.tools.clone();
        if kind != SessionKind::Subagent {
            registry.push(Arc::new(SubagentTool {
                agent: Arc::downgrade(&self.inner),
            }));
        }

        let sandbox_policy = self.inner.config.sandbox.derived_policy();
        match &self.inner.config.tool_policy {
            Some(policy) => registry.filtered(&[policy, &sandbox_policy]),
            None => registry.filtered(&[&sandbox_policy]),
        }
    }

    // ------------------------------------------------------------------
    // Compaction
    // ------------------------------------------------------------------

    /// Summarize what the pruner would drop and record the boundary. With
    /// `force` (context overflow), falls back to summarizing everything but
    /// the newest message even when the pruner is satisfied.
    async fn compact_session(
        &self,
        key: &SessionKey,
        current: &mut Vec<Message>,
        previous_summary: Option<&str>,
        force: bool,
        sink: &EventSink<AgentEvent, RunResult>,
    ) -> Result<Option<CompactionOutcome>> {
        let config = &self.inner.config;
        let outcome = prune(current, config.context_tokens, &config.prune);

        let (kept, dropped) = if !outcome.dropped.is_empty() {
            (outcome.kept, outcome.dropped)
        } else if force {
            if current.len() > 1 {
                let split = current.len() - 1;
                (current[split..].to_vec(), current[..split].to_vec())
            } else {
                // Degenerate overflow with nothing to drop: summarize the
                // history in place so the retry still gets a summary.
                (current.clone(), current.clone())
            }
        } else {
            return Ok(None);
        };

        let compacted = compaction::compact(
            self.inner.provider.as_ref(),
            current,
            &dropped,
            previous_summary,
            config.context_tokens,
            &config.compaction,
        )
        .await?;

        // A previous summary message is superseded by the new one.
        let mut kept = kept;
        kept.retain(|m| !is_compaction_summary_message(m));

        match kept
            .iter()
            .find_map(|m| self.inner.guard.resolve_message_entry_id(key, m).ok().flatten())
        {
            Some(first_kept_id) => {
                self.inner.guard.append_compaction(
                    key,
                    &compacted.summary,
                    &first_kept_id,
                    compacted.tokens_before,
                )?;
            }
            None => {
                tracing::warn!(session = %key, "no persisted entry for compaction boundary; record skipped");
            }
        }

        sink.push(AgentEvent::Compaction {
            summary_chars: compacted.summary.len(),
            dropped_messages: compacted.dropped_messages,
        });

        *current = kept;
        Ok(Some(compacted))
    }

    // ------------------------------------------------------------------
    // LLM streaming with retry
    // ------------------------------------------------------------------

    async fn stream_turn(
        &self,
        system_prompt: &str,
        messages: &[Message],
        tools: &ToolRegistry,
        cancel: &CancellationToken,
        sink: &EventSink<AgentEvent, RunResult>,
    ) -> Result<TurnOutput> {
        let config = &self.inner.config;
        let retry = &config.retry;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            // Accumulators reset on every attempt.
            let mut content: Vec<ContentBlock> = Vec::new();
            let mut tool_calls: Vec<LlmToolCall> = Vec::new();
            let mut message_started = false;

            let context = Context {
                system_prompt: Some(system_prompt.to_string()),
                messages: messages.to_vec(),
                tools: tools.tool_defs(),
            };
            let options = StreamOptions {
                temperature: config.temperature,
                max_tokens: Some(config.model.max_output_tokens),
                session_key: None,
            };

            let error = match self
                .inner
                .provider
                .stream(&config.model, &context, &options)
                .await
            {
                Err(err) => Some(err.to_string()),
                Ok(mut stream) => {
                    let mut interrupted = false;
                    loop {
                        let event = tokio::select! {
                            () = cancel.cancelled() => {
                                interrupted = true;
                                break;
                            }
                            event = stream.next() => event,
                        };
                        let Some(event) = event else { break };
                        match event {
                            crate::provider::LlmEvent::TextDelta { delta } => {
                                if !message_started {
                                    sink.push(AgentEvent::MessageStart);
                                    message_started = true;
                                }
                                sink.push(AgentEvent::MessageDelta { delta });
                            }
                            crate::provider::LlmEvent::TextEnd { content: text } => {
                                content.push(ContentBlock::text(text));
                            }
                            crate::provider::LlmEvent::ToolCallStart { .. } => {}
                            crate::provider::LlmEvent::ToolCallEnd { call } => {
                                content.push(ContentBlock::ToolUse {
                                    id: call.id.clone(),
                                    name: call.name.clone(),
                                    input: call.arguments.clone(),
                                });
                                tool_calls.push(call);
                            }
                        }
                    }
                    if interrupted {
                        return Ok(TurnOutput {
                            content,
                            tool_calls,
                            cancelled: true,
                        });
                    }
                    let result_handle = stream.result_handle();
                    let result = tokio::select! {
                        () = cancel.cancelled() => {
                            return Ok(TurnOutput {
                                content,
                                tool_calls,
                                cancelled: true,
                            });
                        }
                        result = result_handle.wait() => result,
                    };
                    result.error
                }
            };

            let Some(error) = error else {
                return Ok(TurnOutput {
                    content,
                    tool_calls,
                    cancelled: false,
                });
            };

            match classify_provider_error(&error) {
                ErrorClass::ContextOverflow => return Err(Error::ContextOverflow(error)),
                ErrorClass::RateLimit if attempt < retry.attempts && !cancel.is_cancelled() => {
                    let delay = backoff_delay(retry, attempt);
                    sink.push(AgentEvent::Retry {
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                        error,
                    });
                    tokio::select! {
                        () = cancel.cancelled() => {
                            return Ok(TurnOutput {
                                content: Vec::new(),
                                tool_calls: Vec::new(),
                                cancelled: true,
                            });
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                _ => return Err(Error::Provider(error)),
            }
        }
    }

    // ------------------------------------------------------------------
    // Tool execution
    // ------------------------------------------------------------------

    async fn execute_tool(
        &self,
        tools: &ToolRegistry,
        call: &LlmToolCall,
        run_cancel: &CancellationToken,
        key: &SessionKey,
    ) -> (String, bool) {
        let Some(tool) = tools.get(&call.name) else {
            return (format!("Error: Tool '{}' not found", call.name), true);
        };

        let ctx = ToolContext {
            cancel: run_cancel.child_token(),
            workspace_dir: self.inner.config.workspace_dir.clone(),
            tool_use_id: call.id.clone(),
            session_key: key.as_str().to_string(),
        };

        tokio::select! {
            () = run_cancel.cancelled() => ("Tool execution aborted".to_string(), true),
            result = tool.execute(call.arguments.clone(), &ctx) => match result {
                Ok(output) => (output, false),
                Err(err) => (format!("Error: {err}"), true),
            },
        }
    }
}

fn is_compaction_summary_message(message: &Message) -> bool {
    message.text().starts_with(COMPACTION_SUMMARY_PREFIX)
}

fn backoff_delay(retry: &RetrySettings, attempt: u32) -> Duration {
    let shift = (attempt.saturating_sub(1)).min(20);
    let exponential = retry.base_delay_ms.saturating_mul(1u64 << shift);
    let capped = exponential.min(retry.max_delay_ms);
    let span = (capped as f64 * retry.jitter) as i64;
    let offset = if span > 0 {
        rand::thread_rng().gen_range(-span..=span)
    } else {
        0
    };
    Duration::from_millis((capped as i64 + offset).max(0) as u64)
}

struct TurnOutput {
    content: Vec<ContentBlock>,
    tool_calls: Vec<LlmToolCall>,
    cancelled: bool,
}

// ============================================================================
// Turn loop
// ============================================================================

struct LoopParams {
    agent: Agent,
    key: SessionKey,
    run_id: String,
    cancel: CancellationToken,
    user_message: String,
}

/// Start the loop task and return its event stream synchronously. The guard
/// flush runs on every exit path before the stream closes.
fn run_loop(params: LoopParams) -> EventStream<AgentEvent, RunResult> {
    let (sink, stream) = event_stream(Some(AgentEvent::is_terminal));

    tokio::spawn(async move {
        let agent = params.agent.clone();
        let key = params.key.clone();
        let run_id = params.run_id.clone();

        let outcome = drive_loop(params, &sink).await;

        if let Err(err) = agent.inner.guard.flush_pending(&key) {
            tracing::warn!(session = %key, "guard flush failed: {err}");
        }

        match outcome {
            Ok(result) => {
                sink.push(AgentEvent::AgentEnd {
                    run_id: run_id.clone(),
                });
                sink.end(result);
            }
            Err(err) => {
                let error = err.to_string();
                sink.push(AgentEvent::AgentError {
                    run_id: run_id.clone(),
                    error: error.clone(),
                });
                sink.end(RunResult {
                    run_id,
                    error: Some(error),
                    ..RunResult::default()
                });
            }
        }
    });

    stream
}

#[allow(clippy::too_many_lines)]
async fn drive_loop(
    params: LoopParams,
    sink: &EventSink<AgentEvent, RunResult>,
) -> Result<RunResult> {
    let LoopParams {
        agent,
        key,
        run_id,
        cancel,
        user_message,
    } = params;
    let config = &agent.inner.config;

    sink.push(AgentEvent::AgentStart {
        run_id: run_id.clone(),
        session_key: key.as_str().to_string(),
    });

    // History plus the previous summary for update-style compaction.
    let mut current = agent.inner.guard.load(&key)?;
    let mut previous_summary = agent
        .inner
        .guard
        .latest_compaction(&key)?
        .map(|c| c.summary);

    // Slash-command rewrite happens before persistence.
    let mut skill_triggered = None;
    let text = if config.features.enable_skills {
        match route_input(&user_message, &agent.inner.skills) {
            Some(invocation) => {
                skill_triggered = Some(invocation.skill_name);
                invocation.rewritten
            }
            None => user_message,
        }
    } else {
        user_message
    };

    let user_msg = Message::user_text(text);
    agent.inner.guard.append(&key, &user_msg)?;
    current.push(user_msg);

    // Reserve check before the first model call.
    let mut compaction_summary: Option<Message> = None;
    if compaction::should_compact(&current, config.context_tokens, &config.compaction) {
        if let Some(outcome) = agent
            .compact_session(&key, &mut current, previous_summary.as_deref(), false, sink)
            .await?
        {
            previous_summary = Some(outcome.summary.clone());
            compaction_summary = Some(outcome.summary_message);
        }
    }

    let kind = Agent::session_kind(&key);
    let system_prompt = agent.assemble_system_prompt(kind);
    let tools = agent.resolve_tools(kind);

    let mut turns = 0usize;
    let mut total_tool_calls = 0usize;
    let mut final_text = String::new();
    let mut overflow_compaction_attempted = false;

    // Anything steered while the caller was setting up.
    let mut pending: Vec<String> = agent.drain_steering(&key);

    'outer: loop {
        let mut has_more_tool_calls = true;

        while has_more_tool_calls || !pending.is_empty() {
            if turns >= config.max_turns || cancel.is_cancelled() {
                break 'outer;
            }
            turns += 1;
            sink.push(AgentEvent::TurnStart { turn: turns });

            // Iteration-start steering checkpoint.
            pending.extend(agent.drain_steering(&key));
            for text in std::mem::take(&mut pending) {
                let message = Message::user_text(text);
                agent.inner.guard.append(&key, &message)?;
                current.push(message);
            }

            let pruned = prune(&current, config.context_tokens, &config.prune);
            let mut messages_for_model = pruned.kept;
            if let Some(summary) = &compaction_summary {
                messages_for_model.insert(0, summary.clone());
            }

            let turn = match agent
                .stream_turn(&system_prompt, &messages_for_model, &tools, &cancel, sink)
                .await
            {
                Ok(turn) => turn,
                Err(Error::ContextOverflow(message)) if !overflow_compaction_attempted => {
                    overflow_compaction_attempted = true;
                    sink.push(AgentEvent::ContextOverflowCompact {
                        error: message.clone(),
                    });
                    if let Some(outcome) = agent
                        .compact_session(&key, &mut current, previous_summary.as_deref(), true, sink)
                        .await?
                    {
                        previous_summary = Some(outcome.summary.clone());
                        compaction_summary = Some(outcome.summary_message);
                    }
                    // The retried turn is not charged.
                    turns -= 1;
                    continue;
                }
                Err(err) => return Err(err),
            };

            if turn.cancelled {
                if !turn.content.is_empty() {
                    let message = Message::assistant_blocks(turn.content);
                    agent.inner.guard.append(&key, &message)?;
                    let text = message.text();
                    current.push(message.clone());
                    sink.push(AgentEvent::MessageEnd { message, text });
                }
                break 'outer;
            }

            let assistant = Message::assistant_blocks(turn.content);
            agent.inner.guard.append(&key, &assistant)?;
            current.push(assistant.clone());
            sink.push(AgentEvent::MessageEnd {
                text: assistant.text(),
                message: assistant.clone(),
            });

            if turn.tool_calls.is_empty() {
                final_text = assistant.text();
                has_more_tool_calls = false;
                sink.push(AgentEvent::TurnEnd { turn: turns });
                pending = agent.drain_steering(&key);
                continue;
            }

            // Serial tool execution with post-tool steering checkpoints.
            total_tool_calls += turn.tool_calls.len();
            let mut result_blocks: Vec<ContentBlock> = Vec::new();
            let mut steering_after: Option<Vec<String>> = None;
            let calls = turn.tool_calls;
            let mut index = 0;

            while index < calls.len() {
                let call = &calls[index];
                sink.push(AgentEvent::ToolExecutionStart {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    args: call.arguments.clone(),
                });
                let (content, is_error) = agent.execute_tool(&tools, call, &cancel, &key).await;
                sink.push(AgentEvent::ToolExecutionEnd {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    result: content.clone(),
                    is_error,
                });
                result_blocks.push(ContentBlock::tool_result(&call.id, &call.name, content));
                index += 1;

                if cancel.is_cancelled() {
                    break;
                }

                let steering = agent.drain_steering(&key);
                if !steering.is_empty() {
                    for skipped in &calls[index..] {
                        sink.push(AgentEvent::ToolSkipped {
                            id: skipped.id.clone(),
                            name: skipped.name.clone(),
                        });
                        result_blocks.push(ContentBlock::tool_result(
                            &skipped.id,
                            &skipped.name,
                            SKIPPED_TOOL_RESULT_TEXT,
                        ));
                    }
                    sink.push(AgentEvent::Steering {
                        pending_count: steering.len(),
                    });
                    steering_after = Some(steering);
                    break;
                }
            }

            // One user message carries every result of this turn.
            let results = Message::user_blocks(result_blocks);
            agent.inner.guard.append(&key, &results)?;
            current.push(results);
            sink.push(AgentEvent::TurnEnd { turn: turns });

            if cancel.is_cancelled() {
                break 'outer;
            }
            if let Some(steering) = steering_after {
                pending = steering;
            }
        }

        // Idle: follow-up messages restart the inner loop.
        let follow_ups = agent.drain_steering(&key);
        if follow_ups.is_empty() {
            break;
        }
        pending = follow_ups;
    }

    Ok(RunResult {
        run_id,
        text: final_text,
        turns,
        tool_calls: total_tool_calls,
        skill_triggered,
        memories_used: None,
        error: None,
    })
}

// ============================================================================
// Subagent tool
// ============================================================================

/// Tool-invokable subagent spawner. Fire-and-forget: the child run proceeds
/// independently and reports back into the parent session when done.
struct SubagentTool {
    agent: Weak<AgentInner>,
}

#[async_trait::async_trait]
impl Tool for SubagentTool {
    fn name(&self) -> &str {
        "spawn_subagent"
    }

    fn description(&self) -> &str {
        "Start an independent sub-agent on a task. Returns immediately; a summary is appended to this session when the sub-agent finishes."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "task": {"type": "string", "description": "The task for the sub-agent"},
                "label": {"type": "string", "description": "Optional display label"},
                "cleanup": {"type": "boolean", "description": "Delete the sub-agent session afterwards"}
            },
            "required": ["task"]
        })
    }

    async fn execute(&self, input: serde_json::Value, ctx: &ToolContext) -> Result<String> {
        let Some(inner) = self.agent.upgrade() else {
            return Err(Error::tool("spawn_subagent", "agent is shutting down"));
        };
        let agent = Agent { inner };

        let parent_key =
            SessionKey::normalize(&agent.inner.config.agent_id, Some(&ctx.session_key))?;
        if parent_key.is_subagent() {
            return Err(Error::tool(
                "spawn_subagent",
                "subagents may not spawn further subagents",
            ));
        }

        let task = input
            .get("task")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| Error::tool("spawn_subagent", "missing required field: task"))?
            .to_string();
        let label = input
            .get("label")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string);
        let cleanup = input
            .get("cleanup")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);

        let child_key = SessionKey::subagent(&agent.inner.config.agent_id);
        let child_key_str = child_key.as_str().to_string();

        let spawned = agent.clone();
        tokio::spawn(async move {
            let child = child_key.clone();
            match spawned.run(child.as_str(), &task).await {
                Ok(result) => {
                    let mut summary = result.text;
                    if summary.len() > SUBAGENT_SUMMARY_CHARS {
                        let mut cut = SUBAGENT_SUMMARY_CHARS;
                        while cut > 0 && !summary.is_char_boundary(cut) {
                            cut -= 1;
                        }
                        summary.truncate(cut);
                    }
                    spawned.emit(&AgentEvent::SubagentSummary {
                        child_key: child.as_str().to_string(),
                        label: label.clone(),
                        summary: summary.clone(),
                    });
                    // Serialize the parent append behind any active run.
                    let appender = spawned.clone();
                    let parent = parent_key.clone();
                    let enqueue = spawned.inner.lanes.enqueue(
                        &session_lane(&parent_key),
                        EnqueueOptions::default(),
                        async move {
                            appender.inner.guard.append(
                                &parent,
                                &Message::user_text(format!("[Sub-agent summary] {summary}")),
                            )
                        },
                    );
                    if let Err(err) = enqueue.await.and_then(|r| r.map_err(Into::into)) {
                        tracing::warn!("failed to append sub-agent summary: {err}");
                    }
                    if cleanup {
                        if let Err(err) = spawned.inner.guard.clear(&child) {
                            tracing::warn!("failed to clean up sub-agent session: {err}");
                        }
                    }
                }
                Err(err) => {
                    spawned.emit(&AgentEvent::SubagentError {
                        child_key: child.as_str().to_string(),
                        label,
                        error: err.to_string(),
                    });
                }
            }
        });

        Ok(format!("Started sub-agent (session {child_key_str})"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::provider::{LlmEvent, LlmResult, ModelDef, SummaryRequest};
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct SilentProvider;

    #[async_trait]
    impl Provider for SilentProvider {
        fn name(&self) -> &str {
            "silent"
        }
        async fn stream(
            &self,
            _model: &ModelDef,
            _context: &Context,
            _options: &StreamOptions,
        ) -> Result<EventStream<LlmEvent, LlmResult>> {
            let (sink, stream) = event_stream(None);
            sink.push(LlmEvent::TextEnd {
                content: "ok".to_string(),
            });
            sink.end(LlmResult::ok());
            Ok(stream)
        }
        async fn complete_simple(&self, _request: &SummaryRequest) -> Result<String> {
            Ok("summary".to_string())
        }
    }

    fn agent_in(dir: &TempDir) -> Agent {
        let config = AgentConfig::new("a1", dir.path());
        Agent::new(config, Arc::new(SilentProvider), Vec::new()).unwrap()
    }

    #[test]
    fn rejects_tiny_context_budget() {
        let dir = TempDir::new().unwrap();
        let mut config = AgentConfig::new("a1", dir.path());
        config.context_tokens = 500;
        assert!(Agent::new(config, Arc::new(SilentProvider), Vec::new()).is_err());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let retry = RetrySettings::default();
        let first = backoff_delay(&retry, 1).as_millis() as u64;
        assert!((270..=330).contains(&first), "attempt 1 delay {first}");

        let late = backoff_delay(&retry, 12).as_millis() as u64;
        assert!(late <= 33_000, "capped delay {late}");
        assert!(late >= 27_000, "capped delay {late}");
    }

    #[test]
    fn system_prompt_layers_assemble_in_order() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("AGENTS.md"), "project rules").unwrap();
        let mut config = AgentConfig::new("a1", dir.path());
        config.system_prompt = Some("BASE".to_string());
        config.sandbox.enabled = true;
        config.sandbox.allow_exec = false;
        let agent = Agent::new(config, Arc::new(SilentProvider), Vec::new()).unwrap();

        let prompt = agent.assemble_system_prompt(SessionKind::Main);
        let base = prompt.find("BASE").unwrap();
        let project = prompt.find("project rules").unwrap();
        let sandbox = prompt.find("# Sandbox").unwrap();
        assert!(base < project && project < sandbox);
        assert!(prompt.contains("Command execution is disabled."));
    }

    #[test]
    fn subagent_sessions_lose_spawn_tool() {
        let dir = TempDir::new().unwrap();
        let agent = agent_in(&dir);
        let parent_tools = agent.resolve_tools(SessionKind::Main);
        assert!(parent_tools.get("spawn_subagent").is_some());
        let child_tools = agent.resolve_tools(SessionKind::Subagent);
        assert!(child_tools.get("spawn_subagent").is_none());
    }

    #[test]
    fn sandbox_policy_filters_run_tools() {
        let dir = TempDir::new().unwrap();
        let mut config = AgentConfig::new("a1", dir.path());
        config.sandbox.enabled = true;
        config.sandbox.allow_write = false;

        struct NamedTool(&'static str);
        #[async_trait]
        impl Tool for NamedTool {
            fn name(&self) -> &str {
                self.0
            }
            fn description(&self) -> &str {
                "x"
            }
            fn input_schema(&self) -> serde_json::Value {
                serde_json::json!({"type": "object"})
            }
            async fn execute(&self, _input: serde_json::Value, _ctx: &ToolContext) -> Result<String> {
                Ok(String::new())
            }
        }

        let agent = Agent::new(
            config,
            Arc::new(SilentProvider),
            vec![Arc::new(NamedTool("read")), Arc::new(NamedTool("write"))],
        )
        .unwrap();
        let tools = agent.resolve_tools(SessionKind::Main);
        assert!(tools.get("read").is_some());
        assert!(tools.get("write").is_none());
    }

    #[tokio::test]
    async fn run_records_transcript_and_result() {
        let dir = TempDir::new().unwrap();
        let agent = agent_in(&dir);
        let result = agent.run("s", "hi").await.unwrap();
        assert_eq!(result.text, "ok");
        assert_eq!(result.turns, 1);
        assert_eq!(result.tool_calls, 0);

        let history = agent.get_history("s").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].text(), "hi");
        assert_eq!(history[1].text(), "ok");
    }

    #[tokio::test]
    async fn reset_clears_session_and_lane() {
        let dir = TempDir::new().unwrap();
        let agent = agent_in(&dir);
        agent.run("s", "hi").await.unwrap();
        assert_eq!(agent.list_sessions().unwrap().len(), 1);
        agent.reset("s").unwrap();
        assert!(agent.get_history("s").unwrap().is_empty());
    }

    #[tokio::test]
    async fn subscription_can_unsubscribe() {
        let dir = TempDir::new().unwrap();
        let agent = agent_in(&dir);
        let seen = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&seen);
        let sub = agent.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        agent.run("s", "one").await.unwrap();
        let after_first = seen.load(Ordering::SeqCst);
        assert!(after_first > 0);

        sub.unsubscribe();
        agent.run("s", "two").await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), after_first);
    }
}
