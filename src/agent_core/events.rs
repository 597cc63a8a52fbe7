//! Turn events and the sinks that consume them.
//!
//! The orchestrator emits one ordered event sequence per turn. Logging and
//! user-facing output are independent sinks over that sequence, so tests
//! can capture it through a [`ChannelSink`] without touching stdout.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::inference::InvocationDirective;
use crate::mcp_client::InvocationResult;

/// Where a turn is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Prompting,
    StreamingResponse,
    DirectivesFound,
    Dispatching,
    StreamingFinal,
    Done,
}

/// Which completion call a text fragment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponsePhase {
    /// The first call, answering or requesting tools.
    Initial,
    /// The synthesis call after tools ran.
    Final,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    StateChanged { state: TurnState },
    TextFragment { phase: ResponsePhase, text: String },
    DirectiveFound { directive: InvocationDirective },
    CallResult { result: InvocationResult },
    Failed { error: String },
    Completed { answer: String },
}

/// Consumer of turn events. Must not block.
pub trait TurnSink: Send + Sync {
    fn emit(&self, event: &TurnEvent);
}

// ─── LogSink ─────────────────────────────────────────────────────────────────

/// Writes every event to `tracing`. The orchestrator runs each turn inside a
/// `turn` span carrying the turn id, so these lines are attributable.
#[derive(Debug, Default)]
pub struct LogSink;

impl TurnSink for LogSink {
    fn emit(&self, event: &TurnEvent) {
        match event {
            TurnEvent::StateChanged { state } => tracing::debug!(?state, "turn state"),
            TurnEvent::TextFragment { phase, text } => {
                tracing::trace!(?phase, fragment = %text, "text fragment")
            }
            TurnEvent::DirectiveFound { directive } => tracing::info!(
                procedure = %directive.procedure_name,
                arguments = ?directive.arguments,
                "directive found"
            ),
            TurnEvent::CallResult { result } => tracing::info!(
                procedure = %result.procedure_name,
                success = result.is_success(),
                execution_time_ms = result.execution_time_ms,
                "call result"
            ),
            TurnEvent::Failed { error } => tracing::warn!(error = %error, "turn failed"),
            TurnEvent::Completed { answer } => {
                tracing::debug!(answer = %answer, "=== FINAL ANSWER ===")
            }
        }
    }
}

// ─── ChannelSink ─────────────────────────────────────────────────────────────

/// Forwards clones of every event to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: UnboundedSender<TurnEvent>,
}

impl ChannelSink {
    pub fn new(tx: UnboundedSender<TurnEvent>) -> Self {
        Self { tx }
    }
}

impl TurnSink for ChannelSink {
    fn emit(&self, event: &TurnEvent) {
        // A dropped receiver just means nobody is listening any more.
        let _ = self.tx.send(event.clone());
    }
}

// ─── StdoutSink ──────────────────────────────────────────────────────────────

/// Streams model text to stdout as it arrives, with one-line notes for
/// tool calls. Prints the final answer only if it was not already streamed
/// (fallback summaries, error strings).
#[derive(Debug, Default)]
pub struct StdoutSink {
    answer_streamed: AtomicBool,
}

impl StdoutSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TurnSink for StdoutSink {
    fn emit(&self, event: &TurnEvent) {
        let mut out = std::io::stdout().lock();
        match event {
            TurnEvent::StateChanged { state } => match state {
                TurnState::Prompting | TurnState::StreamingFinal => {
                    self.answer_streamed.store(false, Ordering::Relaxed);
                }
                TurnState::DirectivesFound => {
                    let _ = writeln!(out);
                }
                _ => {}
            },
            TurnEvent::TextFragment { text, .. } => {
                self.answer_streamed.store(true, Ordering::Relaxed);
                let _ = write!(out, "{text}");
            }
            TurnEvent::DirectiveFound { directive } => {
                let _ = writeln!(
                    out,
                    "[calling {} {:?}]",
                    directive.procedure_name, directive.arguments
                );
            }
            TurnEvent::CallResult { result } => {
                let _ = writeln!(out, "[{}]", result.summary_line());
            }
            TurnEvent::Failed { error } => {
                let _ = writeln!(std::io::stderr(), "error: {error}");
            }
            TurnEvent::Completed { answer } => {
                if !self.answer_streamed.load(Ordering::Relaxed) {
                    let _ = write!(out, "{answer}");
                }
                let _ = writeln!(out);
            }
        }
        let _ = out.flush();
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_sink_forwards_events() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let sink = ChannelSink::new(tx);
        sink.emit(&TurnEvent::StateChanged {
            state: TurnState::Prompting,
        });
        sink.emit(&TurnEvent::Completed {
            answer: "done".to_string(),
        });

        assert_eq!(
            rx.try_recv().unwrap(),
            TurnEvent::StateChanged {
                state: TurnState::Prompting
            }
        );
        assert!(matches!(rx.try_recv().unwrap(), TurnEvent::Completed { .. }));
    }

    #[test]
    fn test_channel_sink_tolerates_closed_receiver() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        drop(rx);
        ChannelSink::new(tx).emit(&TurnEvent::Failed {
            error: "x".to_string(),
        });
    }

    #[test]
    fn test_event_serialization_tag() {
        let json = serde_json::to_value(TurnEvent::TextFragment {
            phase: ResponsePhase::Final,
            text: "hi".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "text_fragment");
        assert_eq!(json["phase"], "final");
    }
}
