//! Agent Core: drives a conversation turn over the provider hub.
//!
//! Submodules:
//! - `orchestrator`: prompt → directives → dispatch → synthesis
//! - `events`: the per-turn event sequence and its sinks
//! - `errors`: Agent-level error types

pub mod errors;
pub mod events;
pub mod orchestrator;

// Re-exports for convenience
pub use errors::AgentError;
pub use events::{ChannelSink, LogSink, ResponsePhase, StdoutSink, TurnEvent, TurnSink, TurnState};
pub use orchestrator::{ConversationOrchestrator, TurnOutcome};
