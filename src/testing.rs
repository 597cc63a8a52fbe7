//! Test doubles shared by the unit tests of several modules.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tempfile::TempDir;

use crate::inference::{ChatMessage, CompletionEngine, InferenceError, TextStream};
use crate::mcp_client::config::{ProviderConfig, ProviderRegistry, ProviderStatus, TransportKind};
use crate::mcp_client::errors::McpError;
use crate::mcp_client::lifecycle::{Supervisor, SupervisorSettings};
use crate::mcp_client::probe::LivenessProbe;
use crate::mcp_client::transport::ProviderConnector;
use crate::mcp_client::types::{Arguments, McpToolDefinition};
use crate::mcp_client::ProviderHub;

// ─── StaticProbe ─────────────────────────────────────────────────────────────

/// Probe with a fixed set of reachable URLs.
pub(crate) struct StaticProbe {
    reachable: HashSet<String>,
}

impl StaticProbe {
    pub(crate) fn reachable<'a>(urls: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            reachable: urls.into_iter().map(String::from).collect(),
        }
    }

    pub(crate) fn none() -> Self {
        Self {
            reachable: HashSet::new(),
        }
    }
}

#[async_trait]
impl LivenessProbe for StaticProbe {
    async fn is_reachable(&self, url: &str, _timeout: Duration) -> bool {
        self.reachable.contains(url)
    }
}

// ─── FakeConnector ───────────────────────────────────────────────────────────

#[derive(Default)]
struct FakeState {
    tools: BTreeMap<String, Vec<McpToolDefinition>>,
    results: BTreeMap<String, String>,
    failures: BTreeMap<String, String>,
    unreachable: HashSet<String>,
    calls: Vec<(String, String, Arguments)>,
}

/// In-memory providers. Clones share state, so a test can keep a handle
/// after moving one into a hub.
#[derive(Clone, Default)]
pub(crate) struct FakeConnector {
    state: Arc<Mutex<FakeState>>,
}

impl FakeConnector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// `provider` advertises `tool`, taking a required `employee_id`.
    pub(crate) fn with_tool(self, provider: &str, tool: &str, description: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .tools
            .entry(provider.to_string())
            .or_default()
            .push(McpToolDefinition {
                name: tool.to_string(),
                description: description.to_string(),
                params_schema: serde_json::json!({
                    "type": "object",
                    "properties": { "employee_id": { "type": "string" } },
                    "required": ["employee_id"]
                }),
            });
        self
    }

    pub(crate) fn with_result(self, tool: &str, text: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .results
            .insert(tool.to_string(), text.to_string());
        self
    }

    pub(crate) fn failing_call(self, tool: &str, reason: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(tool.to_string(), reason.to_string());
        self
    }

    /// Catalog requests to `provider` fail.
    pub(crate) fn unreachable(self, provider: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .unreachable
            .insert(provider.to_string());
        self
    }

    /// Every `call_tool` so far as `(provider, tool, arguments)`.
    pub(crate) fn calls(&self) -> Vec<(String, String, Arguments)> {
        self.state.lock().unwrap().calls.clone()
    }
}

#[async_trait]
impl ProviderConnector for FakeConnector {
    async fn list_tools(&self, provider: &ProviderConfig) -> Result<Vec<McpToolDefinition>, McpError> {
        let state = self.state.lock().unwrap();
        if state.unreachable.contains(&provider.name) {
            return Err(McpError::ProviderUnreachable {
                name: provider.name.clone(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(state.tools.get(&provider.name).cloned().unwrap_or_default())
    }

    async fn call_tool(
        &self,
        provider: &ProviderConfig,
        name: &str,
        arguments: &Arguments,
    ) -> Result<String, McpError> {
        let mut state = self.state.lock().unwrap();
        state
            .calls
            .push((provider.name.clone(), name.to_string(), arguments.clone()));
        if let Some(reason) = state.failures.get(name) {
            return Err(McpError::TransportError {
                server: provider.name.clone(),
                reason: reason.clone(),
            });
        }
        Ok(state
            .results
            .get(name)
            .cloned()
            .unwrap_or_else(|| "ok".to_string()))
    }
}

// ─── Providers and hubs ──────────────────────────────────────────────────────

/// A connection provider whose url is `http://{name}.invalid/sse`.
pub(crate) fn provider(name: &str) -> ProviderConfig {
    ProviderConfig {
        name: name.to_string(),
        description: format!("{name} for tests"),
        transport: TransportKind::PersistentConnection,
        command: None,
        url: Some(fake_url(name)),
        port: None,
        working_directory: None,
        env_vars: BTreeMap::new(),
        auto_start: false,
        health_check_endpoint: None,
        pid: None,
        status: ProviderStatus::Unknown,
    }
}

fn fake_url(name: &str) -> String {
    format!("http://{name}.invalid/sse")
}

/// A hub over `names`, of which `reachable` answer the liveness probe.
pub(crate) fn hub_with(
    names: &[&str],
    reachable: &[&str],
    connector: FakeConnector,
) -> (ProviderHub, TempDir) {
    let tmp = TempDir::new().unwrap();
    let mut registry = ProviderRegistry::new(tmp.path().join("mcp_servers.json"));
    for name in names {
        registry.upsert(provider(name)).unwrap();
    }

    let urls: Vec<String> = reachable.iter().map(|n| fake_url(n)).collect();
    let probe = Arc::new(StaticProbe::reachable(urls.iter().map(String::as_str)));
    let settings = SupervisorSettings {
        settle: Duration::from_millis(10),
        shutdown_timeout: Duration::from_millis(200),
        probe_timeout: Duration::from_millis(50),
    };

    let supervisor = Supervisor::new(registry, probe, settings);
    (ProviderHub::new(supervisor, Arc::new(connector)), tmp)
}

// ─── ScriptedEngine ──────────────────────────────────────────────────────────

enum Scripted {
    Reply(String),
    Fail(String),
}

/// Completion engine that plays back queued replies, one per request.
/// Replies stream in small fragments. An exhausted script streams nothing.
#[derive(Clone, Default)]
pub(crate) struct ScriptedEngine {
    script: Arc<Mutex<VecDeque<Scripted>>>,
    requests: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
}

impl ScriptedEngine {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn reply(self, text: impl Into<String>) -> Self {
        self.script
            .lock()
            .unwrap()
            .push_back(Scripted::Reply(text.into()));
        self
    }

    pub(crate) fn fail(self, reason: &str) -> Self {
        self.script
            .lock()
            .unwrap()
            .push_back(Scripted::Fail(reason.to_string()));
        self
    }

    /// Message lists received so far, in order.
    pub(crate) fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().unwrap().clone()
    }
}

fn fragments(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars.chunks(7).map(|c| c.iter().collect()).collect()
}

#[async_trait]
impl CompletionEngine for ScriptedEngine {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn stream_completion(&self, messages: Vec<ChatMessage>) -> Result<TextStream, InferenceError> {
        self.requests.lock().unwrap().push(messages);
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Scripted::Reply(text)) => {
                Ok(stream::iter(fragments(&text).into_iter().map(Ok::<_, InferenceError>)).boxed())
            }
            Some(Scripted::Fail(reason)) => Err(InferenceError::ConnectionFailed {
                endpoint: "scripted".to_string(),
                reason,
            }),
            None => Ok(stream::empty::<Result<String, InferenceError>>().boxed()),
        }
    }
}
