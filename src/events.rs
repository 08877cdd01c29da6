//! Typed push/pull event streams and the agent event taxonomy.
//!
//! The turn loop returns an [`EventStream`] synchronously and then drives it
//! from a detached task: the producer half pushes events and finally closes
//! the stream with a result value; the consumer half pulls events in push
//! order and any number of observers may await the result.

use serde::Serialize;
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tokio::sync::Notify;

// ============================================================================
// EventStream
// ============================================================================

struct Shared<E, R> {
    result: OnceLock<R>,
    done: Notify,
    terminal: Option<fn(&E) -> bool>,
}

/// Producer half of an event stream.
pub struct EventSink<E, R> {
    tx: mpsc::UnboundedSender<E>,
    shared: Arc<Shared<E, R>>,
}

/// Consumer half of an event stream. Single-consumer: `next` takes `&mut self`.
pub struct EventStream<E, R> {
    rx: mpsc::UnboundedReceiver<E>,
    shared: Arc<Shared<E, R>>,
    finished: bool,
}

/// Awaitable handle for the stream's final result. Cloneable; every clone
/// resolves to the same value once the producer calls `end`.
pub struct ResultHandle<E, R> {
    shared: Arc<Shared<E, R>>,
}

impl<E, R> Clone for ResultHandle<E, R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Create a connected sink/stream pair.
///
/// `terminal` flags event types after which the consumer iterator stops
/// yielding even if the producer keeps pushing (the loop uses this for
/// `agent_end` / `agent_error`).
pub fn event_stream<E, R>(
    terminal: Option<fn(&E) -> bool>,
) -> (EventSink<E, R>, EventStream<E, R>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        result: OnceLock::new(),
        done: Notify::new(),
        terminal,
    });
    (
        EventSink {
            tx,
            shared: Arc::clone(&shared),
        },
        EventStream {
            rx,
            shared,
            finished: false,
        },
    )
}

impl<E, R> EventSink<E, R> {
    /// Append an event. Non-blocking; silently dropped once the consumer is gone.
    pub fn push(&self, event: E) {
        let _ = self.tx.send(event);
    }

    /// Close the stream with its result. Non-blocking, idempotent (the first
    /// result wins).
    pub fn end(&self, result: R) {
        let _ = self.shared.result.set(result);
        self.shared.done.notify_waiters();
    }

    pub fn result_handle(&self) -> ResultHandle<E, R> {
        ResultHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<E, R> EventStream<E, R> {
    /// Pull the next event in push order. Returns `None` after a terminal
    /// event has been yielded or the producer hung up.
    pub async fn next(&mut self) -> Option<E> {
        if self.finished {
            return None;
        }
        let event = self.rx.recv().await;
        if let Some(event) = &event {
            if self.shared.terminal.is_some_and(|f| f(event)) {
                self.finished = true;
            }
        }
        event
    }

    pub fn result_handle(&self) -> ResultHandle<E, R> {
        ResultHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<E, R: Clone> ResultHandle<E, R> {
    /// Wait for the producer to close the stream, then return the result.
    pub async fn wait(&self) -> R {
        loop {
            let notified = self.shared.done.notified();
            tokio::pin!(notified);
            // Register with the notifier before re-checking, otherwise an
            // `end` landing between check and await would be lost.
            notified.as_mut().enable();
            if let Some(result) = self.shared.result.get() {
                return result.clone();
            }
            notified.await;
        }
    }

    /// Result if already available, without waiting.
    pub fn try_get(&self) -> Option<R> {
        self.shared.result.get().cloned()
    }
}

// ============================================================================
// Agent events
// ============================================================================

/// Events emitted by the agent during a run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum AgentEvent {
    AgentStart {
        run_id: String,
        session_key: String,
    },
    AgentEnd {
        run_id: String,
    },
    AgentError {
        run_id: String,
        error: String,
    },
    TurnStart {
        turn: usize,
    },
    TurnEnd {
        turn: usize,
    },
    /// Emitted when the first text delta of an assistant message arrives.
    MessageStart,
    MessageDelta {
        delta: String,
    },
    MessageEnd {
        #[serde(skip)]
        message: crate::model::Message,
        text: String,
    },
    ToolExecutionStart {
        id: String,
        name: String,
        args: serde_json::Value,
    },
    ToolExecutionEnd {
        id: String,
        name: String,
        result: String,
        is_error: bool,
    },
    ToolSkipped {
        id: String,
        name: String,
    },
    Steering {
        pending_count: usize,
    },
    Compaction {
        summary_chars: usize,
        dropped_messages: usize,
    },
    ContextOverflowCompact {
        error: String,
    },
    Retry {
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    SubagentSummary {
        child_key: String,
        label: Option<String>,
        summary: String,
    },
    SubagentError {
        child_key: String,
        label: Option<String>,
        error: String,
    },
}

impl AgentEvent {
    /// Terminal events close the consumer side of the run stream.
    pub const fn is_terminal(event: &Self) -> bool {
        matches!(event, Self::AgentEnd { .. } | Self::AgentError { .. })
    }

    /// Stable label used in logs and test assertions.
    pub const fn label(&self) -> &'static str {
        match self {
            Self::AgentStart { .. } => "agent_start",
            Self::AgentEnd { .. } => "agent_end",
            Self::AgentError { .. } => "agent_error",
            Self::TurnStart { .. } => "turn_start",
            Self::TurnEnd { .. } => "turn_end",
            Self::MessageStart => "message_start",
            Self::MessageDelta { .. } => "message_delta",
            Self::MessageEnd { .. } => "message_end",
            Self::ToolExecutionStart { .. } => "tool_execution_start",
            Self::ToolExecutionEnd { .. } => "tool_execution_end",
            Self::ToolSkipped { .. } => "tool_skipped",
            Self::Steering { .. } => "steering",
            Self::Compaction { .. } => "compaction",
            Self::ContextOverflowCompact { .. } => "context_overflow_compact",
            Self::Retry { .. } => "retry",
            Self::SubagentSummary { .. } => "subagent_summary",
            Self::SubagentError { .. } => "subagent_error",
        }
    }
}
