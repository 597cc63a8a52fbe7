//! Provider hub: the context object tying supervision to tool routing.
//!
//! Owns the supervisor (and through it the registry and process table), the
//! tool directory and the connector. One hub exists per orchestrator; it is
//! passed explicitly to whatever needs it.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use super::config::ProviderStatus;
use super::errors::InvocationError;
use super::lifecycle::Supervisor;
use super::registry::{RefreshReport, ToolDirectory};
use super::transport::ProviderConnector;
use super::types::Arguments;

/// Result text of one invocation, or the reason it failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "text", rename_all = "snake_case")]
pub enum InvocationOutcome {
    Success(String),
    Failure(String),
}

/// One dispatched directive and what came back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvocationResult {
    pub procedure_name: String,
    pub arguments: Arguments,
    pub outcome: InvocationOutcome,
    pub execution_time_ms: u64,
}

impl InvocationResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, InvocationOutcome::Success(_))
    }

    /// One summary line for the synthesis prompt.
    pub fn summary_line(&self) -> String {
        match &self.outcome {
            InvocationOutcome::Success(text) => {
                format!("tool {} returned: {}", self.procedure_name, text)
            }
            InvocationOutcome::Failure(reason) => {
                format!("tool {} failed: {}", self.procedure_name, reason)
            }
        }
    }
}

pub struct ProviderHub {
    supervisor: Supervisor,
    directory: ToolDirectory,
    connector: Arc<dyn ProviderConnector>,
}

impl ProviderHub {
    pub fn new(supervisor: Supervisor, connector: Arc<dyn ProviderConnector>) -> Self {
        Self {
            supervisor,
            directory: ToolDirectory::new(),
            connector,
        }
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn supervisor_mut(&mut self) -> &mut Supervisor {
        &mut self.supervisor
    }

    pub fn directory(&self) -> &ToolDirectory {
        &self.directory
    }

    /// Rebuild the tool directory from the providers that are live right now.
    pub async fn refresh_directory(&mut self) -> RefreshReport {
        let live = self.supervisor.live_providers().await;
        self.directory.refresh(self.connector.as_ref(), &live).await
    }

    /// Route one call to the provider that owns `name`.
    ///
    /// Each call opens its own session. Transport failures come back as
    /// [`InvocationError::CallFailed`].
    pub async fn invoke(&mut self, name: &str, arguments: &Arguments) -> Result<String, InvocationError> {
        let owner = self
            .directory
            .owner_of(name)
            .ok_or_else(|| InvocationError::UnknownProcedure {
                name: name.to_string(),
            })?
            .to_string();

        let status = self
            .supervisor
            .status(&owner)
            .await
            .unwrap_or(ProviderStatus::Unknown);
        if status != ProviderStatus::Running {
            return Err(InvocationError::ProviderUnavailable {
                procedure: name.to_string(),
                provider: owner,
                status: status.to_string(),
            });
        }

        let Some(config) = self.supervisor.registry().get(&owner).cloned() else {
            return Err(InvocationError::ProviderUnavailable {
                procedure: name.to_string(),
                provider: owner,
                status: "deregistered".to_string(),
            });
        };

        self.connector
            .call_tool(&config, name, arguments)
            .await
            .map_err(|e| InvocationError::CallFailed {
                procedure: name.to_string(),
                reason: e.to_string(),
            })
    }

    /// [`invoke`](Self::invoke), folded into an [`InvocationResult`].
    pub async fn dispatch(&mut self, name: &str, arguments: &Arguments) -> InvocationResult {
        let start = Instant::now();
        let outcome = match self.invoke(name, arguments).await {
            Ok(text) => InvocationOutcome::Success(text),
            Err(e) => {
                tracing::warn!(tool = name, error = %e, "invocation failed");
                InvocationOutcome::Failure(e.to_string())
            }
        };
        let execution_time_ms = start.elapsed().as_millis() as u64;

        tracing::info!(
            tool = name,
            success = matches!(outcome, InvocationOutcome::Success(_)),
            execution_time_ms,
            "invocation finished"
        );

        InvocationResult {
            procedure_name: name.to_string(),
            arguments: arguments.clone(),
            outcome,
            execution_time_ms,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
