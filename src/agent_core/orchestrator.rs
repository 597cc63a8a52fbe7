//! Conversation orchestrator: one user turn from question to answer.
//!
//! Flow:
//! 1. **Prompt**: the question goes to the completion engine together with
//!    the tool catalog and the directive format.
//! 2. **Dispatch**: directives found in the response are invoked one at a
//!    time, in source order, through the [`ProviderHub`].
//! 3. **Synthesize**: a second completion call turns the collected results
//!    into the user-facing answer.
//!
//! A response without directives is the answer as-is. Engine failures are
//! reported inside the answer; `run_turn` itself never fails.

use std::sync::Arc;

use futures::StreamExt;
use serde::Serialize;
use tracing::Instrument;
use uuid::Uuid;

use super::errors::AgentError;
use super::events::{LogSink, ResponsePhase, TurnEvent, TurnSink, TurnState};
use crate::inference::{extract_directives, ChatMessage, CompletionEngine, InvocationDirective};
use crate::mcp_client::registry::ToolDirectory;
use crate::mcp_client::{InvocationResult, ProviderHub};

// ─── Types ──────────────────────────────────────────────────────────────────

/// Everything a turn produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TurnOutcome {
    /// Text for the user. Never empty once directives were found.
    pub answer: String,
    pub directives: Vec<InvocationDirective>,
    /// One entry per directive, same order.
    pub results: Vec<InvocationResult>,
}

impl TurnOutcome {
    fn answered(answer: String) -> Self {
        Self {
            answer,
            directives: Vec::new(),
            results: Vec::new(),
        }
    }
}

// ─── Orchestrator ───────────────────────────────────────────────────────────

pub struct ConversationOrchestrator {
    engine: Arc<dyn CompletionEngine>,
    sinks: Vec<Arc<dyn TurnSink>>,
}

impl ConversationOrchestrator {
    /// An orchestrator that reports to [`LogSink`] only.
    pub fn new(engine: Arc<dyn CompletionEngine>) -> Self {
        Self {
            engine,
            sinks: vec![Arc::new(LogSink)],
        }
    }

    /// Add a sink that receives every subsequent turn event.
    pub fn with_sink(mut self, sink: Arc<dyn TurnSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Answer one question.
    pub async fn run_turn(&self, hub: &mut ProviderHub, question: &str) -> TurnOutcome {
        let turn_id = Uuid::new_v4();
        let span = tracing::info_span!("turn", turn_id = %turn_id);
        self.drive(hub, question).instrument(span).await
    }

    async fn drive(&self, hub: &mut ProviderHub, question: &str) -> TurnOutcome {
        tracing::info!(
            model = self.engine.model_name(),
            tools = hub.directory().len(),
            "turn started"
        );
        self.set_state(TurnState::Prompting);

        let system_prompt = build_system_prompt(hub.directory());
        tracing::debug!(prompt = %system_prompt, "=== SYSTEM PROMPT ===");
        let messages = vec![ChatMessage::system(system_prompt), ChatMessage::user(question)];

        self.set_state(TurnState::StreamingResponse);
        let response = match self.collect(messages, ResponsePhase::Initial).await {
            Ok(text) => text,
            Err(e) => return self.finish(TurnOutcome::answered(self.report_failure(e))),
        };
        tracing::debug!(response = %response, "=== INITIAL RESPONSE ===");

        let directives = extract_directives(&response);
        if directives.is_empty() {
            return self.finish(TurnOutcome::answered(response));
        }

        tracing::info!(count = directives.len(), "directives extracted");
        self.set_state(TurnState::DirectivesFound);
        for directive in &directives {
            self.emit(TurnEvent::DirectiveFound {
                directive: directive.clone(),
            });
        }

        // Sequential on purpose: later calls may depend on earlier effects.
        self.set_state(TurnState::Dispatching);
        let mut results = Vec::with_capacity(directives.len());
        for directive in &directives {
            let result = hub
                .dispatch(&directive.procedure_name, &directive.arguments)
                .await;
            self.emit(TurnEvent::CallResult {
                result: result.clone(),
            });
            results.push(result);
        }

        let summary = results_summary(&results);
        tracing::debug!(summary = %summary, "=== TOOL RESULTS ===");

        self.set_state(TurnState::StreamingFinal);
        let messages = build_synthesis_messages(question, &response, &summary);
        let answer = match self.collect(messages, ResponsePhase::Final).await {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => {
                tracing::warn!("synthesis produced empty response, using tool results");
                summary
            }
            Err(e) => format!("{}\n{summary}", self.report_failure(e)),
        };

        self.finish(TurnOutcome {
            answer,
            directives,
            results,
        })
    }

    /// Stream one completion to the sinks and return the full text.
    ///
    /// A stream that breaks after producing text keeps what arrived; one
    /// that breaks before counts as a failed call.
    async fn collect(
        &self,
        messages: Vec<ChatMessage>,
        phase: ResponsePhase,
    ) -> Result<String, AgentError> {
        let mut stream = self.engine.stream_completion(messages).await?;

        let mut full_text = String::new();
        while let Some(fragment) = stream.next().await {
            match fragment {
                Ok(text) => {
                    full_text.push_str(&text);
                    self.emit(TurnEvent::TextFragment { phase, text });
                }
                Err(e) if full_text.is_empty() => return Err(e.into()),
                Err(e) => {
                    tracing::warn!(error = %e, ?phase, "completion stream broke, keeping partial text");
                    break;
                }
            }
        }
        Ok(full_text)
    }

    fn report_failure(&self, error: AgentError) -> String {
        let message = error.to_string();
        self.emit(TurnEvent::Failed {
            error: message.clone(),
        });
        message
    }

    fn finish(&self, outcome: TurnOutcome) -> TurnOutcome {
        self.set_state(TurnState::Done);
        self.emit(TurnEvent::Completed {
            answer: outcome.answer.clone(),
        });
        tracing::info!(
            directives = outcome.directives.len(),
            failed_calls = outcome.results.iter().filter(|r| !r.is_success()).count(),
            "turn finished"
        );
        outcome
    }

    fn set_state(&self, state: TurnState) {
        self.emit(TurnEvent::StateChanged { state });
    }

    fn emit(&self, event: TurnEvent) {
        for sink in &self.sinks {
            sink.emit(&event);
        }
    }
}

// ─── Prompts ────────────────────────────────────────────────────────────────

fn build_system_prompt(directory: &ToolDirectory) -> String {
    format!(
        "You are a helpful assistant with access to tools.\n\n\
         Available tools:\n{catalog}\n\n\
         Guidelines:\n\
         1. Decide whether the request needs a tool.\n\
         2. To call a tool, reply using exactly this format:\n\
         <function_calls>\n\
         <invoke name=\"TOOL_NAME\">\n\
         <parameter name=\"PARAMETER_NAME\">VALUE</parameter>\n\
         </invoke>\n\
         </function_calls>\n\
         3. Otherwise answer directly and naturally.",
        catalog = directory.catalog_prompt()
    )
}

fn results_summary(results: &[InvocationResult]) -> String {
    results
        .iter()
        .map(InvocationResult::summary_line)
        .collect::<Vec<_>>()
        .join("\n")
}

fn build_synthesis_messages(question: &str, response: &str, summary: &str) -> Vec<ChatMessage> {
    let system = format!(
        "You are a helpful assistant. You just called tools to answer the user's question.\n\n\
         Original response: {response}\n\
         Tool results:\n{summary}\n\n\
         Answer the user's original question from these results. Reproduce the data the \
         tools returned exactly; do not add to or alter it. If a tool failed, say so."
    );
    vec![
        ChatMessage::system(system),
        ChatMessage::user(format!("User question: {question}")),
    ]
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_core::events::ChannelSink;
    use crate::mcp_client::InvocationOutcome;
    use crate::testing::{hub_with, FakeConnector, ScriptedEngine};

    const LOCATION: &str = "Employee D0001 sits in Building 3, Room 301";

    const LOCATION_DIRECTIVE: &str = r#"Let me look that up.
<function_calls>
<invoke name="get_location">
<parameter name="employee_id">D0001</parameter>
</invoke>
</function_calls>"#;

    fn location_connector() -> FakeConnector {
        FakeConnector::new()
            .with_tool("loc_server", "get_location", "Look up where an employee sits")
            .with_result("get_location", LOCATION)
    }

    async fn location_hub(connector: FakeConnector) -> (ProviderHub, tempfile::TempDir) {
        let (mut hub, tmp) = hub_with(&["loc_server"], &["loc_server"], connector);
        hub.refresh_directory().await;
        (hub, tmp)
    }

    #[tokio::test]
    async fn test_no_directives_returns_raw_response() {
        let engine = ScriptedEngine::new().reply("Hello! How can I help?");
        let (mut hub, _tmp) = location_hub(location_connector()).await;
        let orchestrator = ConversationOrchestrator::new(Arc::new(engine.clone()));

        let outcome = orchestrator.run_turn(&mut hub, "hi").await;
        assert_eq!(outcome.answer, "Hello! How can I help?");
        assert!(outcome.directives.is_empty());
        assert!(outcome.results.is_empty());
        assert_eq!(engine.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_location_lookup_end_to_end() {
        let connector = location_connector();
        let engine = ScriptedEngine::new()
            .reply(LOCATION_DIRECTIVE)
            .reply(&format!("According to the directory: {LOCATION}."));
        let (mut hub, _tmp) = location_hub(connector.clone()).await;
        let orchestrator = ConversationOrchestrator::new(Arc::new(engine.clone()));

        let outcome = orchestrator.run_turn(&mut hub, "where is D0001").await;

        assert_eq!(outcome.directives.len(), 1);
        assert_eq!(outcome.directives[0].procedure_name, "get_location");
        assert_eq!(outcome.directives[0].arguments["employee_id"], "D0001");
        assert_eq!(
            outcome.results[0].outcome,
            InvocationOutcome::Success(LOCATION.to_string())
        );
        assert!(outcome.answer.contains(LOCATION));

        let calls = connector.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, "get_location");

        let requests = engine.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[0][0].content.contains("get_location"));
        assert!(requests[0][0].content.contains("<function_calls>"));
        assert!(requests[1][0]
            .content
            .contains(&format!("tool get_location returned: {LOCATION}")));
        assert_eq!(requests[1][1].content, "User question: where is D0001");
    }

    #[tokio::test]
    async fn test_unknown_procedure_still_answers() {
        let engine = ScriptedEngine::new().reply(
            "<function_calls><invoke name=\"teleport\"><parameter name=\"to\">Mars</parameter></invoke></function_calls>",
        );
        let (mut hub, _tmp) = location_hub(location_connector()).await;
        let orchestrator = ConversationOrchestrator::new(Arc::new(engine));

        let outcome = orchestrator.run_turn(&mut hub, "beam me up").await;
        assert_eq!(outcome.results.len(), 1);
        assert!(!outcome.results[0].is_success());
        // Synthesis script is exhausted, so the answer falls back to the summary.
        assert!(outcome.answer.contains("tool teleport failed"));
    }

    #[tokio::test]
    async fn test_engine_failure_becomes_answer() {
        let engine = ScriptedEngine::new().fail("connection refused");
        let (mut hub, _tmp) = location_hub(location_connector()).await;
        let orchestrator = ConversationOrchestrator::new(Arc::new(engine));

        let outcome = orchestrator.run_turn(&mut hub, "hi").await;
        assert!(outcome.answer.starts_with("completion engine failed"));
        assert!(outcome.answer.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_synthesis_failure_keeps_results() {
        let engine = ScriptedEngine::new()
            .reply(LOCATION_DIRECTIVE)
            .fail("rate limited");
        let (mut hub, _tmp) = location_hub(location_connector()).await;
        let orchestrator = ConversationOrchestrator::new(Arc::new(engine));

        let outcome = orchestrator.run_turn(&mut hub, "where is D0001").await;
        assert!(outcome.answer.contains("rate limited"));
        assert!(outcome.answer.contains(LOCATION));
    }

    #[tokio::test]
    async fn test_event_sequence() {
        let engine = ScriptedEngine::new()
            .reply(LOCATION_DIRECTIVE)
            .reply("Room 301.");
        let (mut hub, _tmp) = location_hub(location_connector()).await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let orchestrator = ConversationOrchestrator::new(Arc::new(engine))
            .with_sink(Arc::new(ChannelSink::new(tx)));

        orchestrator.run_turn(&mut hub, "where is D0001").await;

        let mut states = Vec::new();
        let mut kinds = Vec::new();
        let mut final_text = String::new();
        while let Ok(event) = rx.try_recv() {
            match &event {
                TurnEvent::StateChanged { state } => states.push(*state),
                TurnEvent::TextFragment {
                    phase: ResponsePhase::Final,
                    text,
                } => final_text.push_str(text),
                _ => {}
            }
            kinds.push(std::mem::discriminant(&event));
        }

        assert_eq!(
            states,
            vec![
                TurnState::Prompting,
                TurnState::StreamingResponse,
                TurnState::DirectivesFound,
                TurnState::Dispatching,
                TurnState::StreamingFinal,
                TurnState::Done,
            ]
        );
        assert_eq!(final_text, "Room 301.");
        assert!(kinds.contains(&std::mem::discriminant(&TurnEvent::Completed {
            answer: String::new()
        })));
    }

    #[test]
    fn test_system_prompt_lists_catalog_and_format() {
        let prompt = build_system_prompt(&ToolDirectory::new());
        assert!(prompt.contains("No tools are currently available."));
        assert!(prompt.contains("<invoke name=\"TOOL_NAME\">"));
        assert!(prompt.contains("</function_calls>"));
    }
}
