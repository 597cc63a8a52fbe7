//! Tool Directory: global procedure name → owning provider index.
//!
//! The directory is rebuilt from scratch on every refresh and swapped in
//! whole, so it never reflects a half-applied earlier sweep. Names are
//! global: when two providers advertise the same name the one refreshed
//! later wins, and a warning names both.

use std::collections::BTreeMap;

use serde::Serialize;

use super::config::ProviderConfig;
use super::transport::ProviderConnector;
use super::types::McpToolDefinition;

/// One procedure in the directory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments, as advertised.
    pub parameter_schema: serde_json::Value,
    /// Name of the provider that serves this procedure (not owned).
    pub owner_provider: String,
}

impl ToolDescriptor {
    fn from_definition(owner: &str, def: McpToolDefinition) -> Self {
        Self {
            name: def.name,
            description: def.description,
            parameter_schema: def.params_schema,
            owner_provider: owner.to_string(),
        }
    }
}

/// Outcome of one refresh sweep.
#[derive(Debug, Default, Clone)]
pub struct RefreshReport {
    /// `(provider, procedures advertised)` for each provider that answered.
    pub loaded: Vec<(String, usize)>,
    /// `(provider, reason)` for each provider that was skipped.
    pub skipped: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default)]
pub struct ToolDirectory {
    tools: BTreeMap<String, ToolDescriptor>,
}

impl ToolDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the directory from every provider in `live`.
    ///
    /// A provider that cannot be reached or answers garbage is logged and
    /// skipped; the others are still indexed.
    pub async fn refresh(
        &mut self,
        connector: &dyn ProviderConnector,
        live: &[ProviderConfig],
    ) -> RefreshReport {
        let mut tools = BTreeMap::new();
        let mut report = RefreshReport::default();

        for provider in live {
            match connector.list_tools(provider).await {
                Ok(defs) => {
                    let count = defs.len();
                    for def in defs {
                        insert(&mut tools, ToolDescriptor::from_definition(&provider.name, def));
                    }
                    tracing::info!(provider = %provider.name, tools = count, "loaded provider catalog");
                    report.loaded.push((provider.name.clone(), count));
                }
                Err(e) => {
                    tracing::warn!(provider = %provider.name, error = %e, "skipping provider during refresh");
                    report.skipped.push((provider.name.clone(), e.to_string()));
                }
            }
        }

        self.tools = tools;
        tracing::info!(
            tools = self.tools.len(),
            providers = report.loaded.len(),
            skipped = report.skipped.len(),
            "tool directory rebuilt"
        );
        report
    }

    /// Look up a procedure by name.
    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name)
    }

    /// Provider that serves a procedure.
    pub fn owner_of(&self, name: &str) -> Option<&str> {
        self.tools.get(name).map(|t| t.owner_provider.as_str())
    }

    /// All descriptors, sorted by name.
    pub fn all(&self) -> Vec<&ToolDescriptor> {
        self.tools.values().collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// How many procedures a provider contributes.
    pub fn tools_for_provider(&self, provider: &str) -> usize {
        self.tools
            .values()
            .filter(|t| t.owner_provider == provider)
            .count()
    }

    /// Distinct provider names, sorted.
    pub fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools
            .values()
            .map(|t| t.owner_provider.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Tool listing for the system prompt: name, description, parameter
    /// schema and provider of every procedure.
    pub fn catalog_prompt(&self) -> String {
        if self.is_empty() {
            return "No tools are currently available.".to_string();
        }

        self.tools
            .values()
            .map(|tool| {
                let schema = serde_json::to_string_pretty(&tool.parameter_schema)
                    .unwrap_or_else(|_| tool.parameter_schema.to_string());
                format!(
                    "- {}: {} (server: {})\n  parameters: {}",
                    tool.name,
                    tool.description,
                    tool.owner_provider,
                    schema.replace('\n', "\n  ")
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn insert(tools: &mut BTreeMap<String, ToolDescriptor>, descriptor: ToolDescriptor) {
    if let Some(previous) = tools.get(&descriptor.name) {
        if previous.owner_provider != descriptor.owner_provider {
            tracing::warn!(
                tool = %descriptor.name,
                previous = %previous.owner_provider,
                replacement = %descriptor.owner_provider,
                "duplicate tool name, later provider wins"
            );
        }
    }
    tools.insert(descriptor.name.clone(), descriptor);
}

// ─── Tests ───────────────────────────────────────────────────────────────────
