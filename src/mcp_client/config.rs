//! Provider Registry: the persisted provider document and its in-memory form.
//!
//! The document is a JSON object keyed by provider name. It is rewritten as a
//! whole on every save (temp file + rename) and is the single source of truth
//! for provider identity. Status values in it are informational only: every
//! load resets them to [`ProviderStatus::Unknown`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::errors::McpError;

/// Name prefix for providers created by the discovery scanner.
pub const DISCOVERED_PREFIX: &str = "discovered_server_";

/// Name of the built-in provider written when no document exists.
pub const DEFAULT_PROVIDER: &str = "weather_server";

// ─── Provider Types ──────────────────────────────────────────────────────────

/// How the orchestrator talks to a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportKind {
    /// Long-lived event-stream connection at a known URL. Records without a
    /// `transport_type` are treated as this.
    #[serde(rename = "sse")]
    #[default]
    PersistentConnection,
    /// Locally spawned process speaking over stdin/stdout.
    #[serde(rename = "stdio")]
    ChildProcess,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PersistentConnection => write!(f, "sse"),
            Self::ChildProcess => write!(f, "stdio"),
        }
    }
}

/// Last computed status of a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderStatus {
    Running,
    Stopped,
    #[default]
    Unknown,
    Error,
}

impl std::fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Unknown => "unknown",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// One provider record. Serialized field names match the persisted document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Unique key; stored as the document key, not inside the record.
    #[serde(skip)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "transport_type", default)]
    pub transport: TransportKind,
    /// Launch command. Required for `stdio`, optional for `sse`.
    #[serde(default)]
    pub command: Option<String>,
    /// Event-stream URL for `sse` providers.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
    #[serde(default = "default_auto_start")]
    pub auto_start: bool,
    /// Path (joined onto `url`) or absolute URL used by the liveness probe.
    #[serde(default)]
    pub health_check_endpoint: Option<String>,
    /// Last known OS process id of a process this supervisor launched.
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub status: ProviderStatus,
}

fn default_auto_start() -> bool {
    true
}

impl ProviderConfig {
    /// The built-in weather provider used when no document exists.
    pub fn builtin_default() -> Self {
        let cwd = std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| ".".to_string());
        Self {
            name: DEFAULT_PROVIDER.to_string(),
            description: "weather query MCP server".to_string(),
            transport: TransportKind::PersistentConnection,
            command: Some("python weather_server.py".to_string()),
            url: Some("http://127.0.0.1:8000/sse".to_string()),
            port: Some(8000),
            working_directory: Some(cwd),
            env_vars: BTreeMap::new(),
            auto_start: true,
            health_check_endpoint: Some("/sse".to_string()),
            pid: None,
            status: ProviderStatus::Unknown,
        }
    }

    /// Record for a responder found by the discovery scanner.
    pub fn discovered(port: u16) -> Self {
        Self {
            name: format!("{DISCOVERED_PREFIX}{port}"),
            description: format!("auto-discovered MCP server (port {port})"),
            transport: TransportKind::PersistentConnection,
            command: None,
            url: Some(local_sse_url(port)),
            port: Some(port),
            working_directory: None,
            env_vars: BTreeMap::new(),
            auto_start: false,
            health_check_endpoint: None,
            pid: None,
            status: ProviderStatus::Running,
        }
    }

    /// Whether this record was synthesized by the discovery scanner.
    pub fn is_discovered(&self) -> bool {
        self.name.starts_with(DISCOVERED_PREFIX)
    }

    /// Contact URL: the configured `url`, else the local SSE URL for `port`.
    pub fn endpoint(&self) -> Option<String> {
        match (&self.url, self.port) {
            (Some(url), _) => Some(url.clone()),
            (None, Some(port)) => Some(local_sse_url(port)),
            (None, None) => None,
        }
    }

    /// URL the liveness probe should hit.
    pub fn health_url(&self) -> Option<String> {
        let endpoint = self.endpoint();
        match (&self.health_check_endpoint, endpoint) {
            (Some(target), _) if target.starts_with("http://") || target.starts_with("https://") => {
                Some(target.clone())
            }
            (Some(target), Some(base)) => reqwest::Url::parse(&base)
                .and_then(|b| b.join(target))
                .map(|u| u.to_string())
                .ok()
                .or(Some(base)),
            (None, endpoint) => endpoint,
            (Some(_), None) => None,
        }
    }
}

/// `http://127.0.0.1:<port>/sse`
pub fn local_sse_url(port: u16) -> String {
    format!("http://127.0.0.1:{port}/sse")
}

/// Normalized `(host, port)` identity of an address; `localhost` and
/// `127.0.0.1` compare equal.
pub fn endpoint_key(address: &str) -> Option<(String, u16)> {
    let url = reqwest::Url::parse(address).ok()?;
    let host = url.host_str()?.to_ascii_lowercase();
    let host = match host.as_str() {
        "localhost" | "[::1]" | "::1" => "127.0.0.1".to_string(),
        _ => host,
    };
    Some((host, url.port_or_known_default()?))
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// In-memory provider records plus the path of their persisted document.
#[derive(Debug)]
pub struct ProviderRegistry {
    path: PathBuf,
    providers: BTreeMap<String, ProviderConfig>,
    /// Records that failed to deserialize; written back verbatim on save.
    unreadable: BTreeMap<String, serde_json::Value>,
}

impl ProviderRegistry {
    /// Empty registry bound to `path`. Nothing is read or written.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            providers: BTreeMap::new(),
            unreadable: BTreeMap::new(),
        }
    }

    /// Load the document at `path`.
    ///
    /// A missing document, or one that is not a JSON object at all, is
    /// replaced by the built-in default, which is written back immediately.
    /// Individual records that fail to deserialize are skipped with a
    /// warning and preserved on disk. Loading never fails.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut registry = Self::new(&path);

        match read_document(&path) {
            Ok(document) => {
                tracing::info!(
                    path = %path.display(),
                    count = document.providers.len(),
                    skipped = document.unreadable.len(),
                    "loaded provider document"
                );
                registry.providers = document.providers;
                registry.unreadable = document.unreadable;
            }
            Err(e) => {
                match &e {
                    McpError::ConfigurationMissing { .. } => {
                        tracing::info!(error = %e, "writing default provider document");
                    }
                    _ => {
                        tracing::warn!(error = %e, "provider document unusable, regenerating default");
                    }
                }
                let default = ProviderConfig::builtin_default();
                registry.providers.insert(default.name.clone(), default);
                if let Err(e) = registry.save() {
                    tracing::warn!(error = %e, "failed to write default provider document");
                }
            }
        }

        registry
    }

    /// Atomically rewrite the whole document.
    pub fn save(&self) -> Result<(), McpError> {
        let io_err = |path: &Path, source| McpError::Io {
            path: path.display().to_string(),
            source,
        };

        let serialize_err = |e: serde_json::Error| McpError::ConfigError {
            reason: format!("failed to serialize provider document: {e}"),
        };

        let mut document = serde_json::Map::new();
        for (name, raw) in &self.unreadable {
            if !self.providers.contains_key(name) {
                document.insert(name.clone(), raw.clone());
            }
        }
        for (name, config) in &self.providers {
            document.insert(name.clone(), serde_json::to_value(config).map_err(serialize_err)?);
        }
        let body = serde_json::to_string_pretty(&document).map_err(serialize_err)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        std::fs::write(&tmp, body).map_err(|e| io_err(&tmp, e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| io_err(&self.path, e))?;

        tracing::debug!(path = %self.path.display(), count = self.providers.len(), "saved provider document");
        Ok(())
    }

    /// Insert or replace a record and persist.
    pub fn upsert(&mut self, config: ProviderConfig) -> Result<(), McpError> {
        if config.name.is_empty() {
            return Err(McpError::ConfigError {
                reason: "provider name must not be empty".to_string(),
            });
        }
        tracing::info!(provider = %config.name, transport = %config.transport, "provider registered");
        self.providers.insert(config.name.clone(), config);
        self.save()
    }

    /// Remove a record and persist. Callers stop the provider first
    /// (see `Supervisor::remove`).
    pub(crate) fn remove_entry(&mut self, name: &str) -> Result<Option<ProviderConfig>, McpError> {
        let removed = self.providers.remove(name);
        if removed.is_some() {
            self.save()?;
        }
        Ok(removed)
    }

    /// Provider claiming `address`, comparing by host and port.
    ///
    /// A manually configured provider wins over an auto-discovered one for the
    /// same endpoint.
    pub fn find_by_endpoint(&self, address: &str) -> Option<&ProviderConfig> {
        let key = endpoint_key(address)?;
        let mut discovered = None;

        for config in self.providers.values() {
            let claims = config
                .endpoint()
                .and_then(|e| endpoint_key(&e))
                .is_some_and(|k| k == key);
            if !claims {
                continue;
            }
            if !config.is_discovered() {
                return Some(config);
            }
            discovered.get_or_insert(config);
        }

        discovered
    }

    pub fn get(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ProviderConfig> {
        self.providers.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    /// Provider names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProviderConfig> {
        self.providers.values()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Parsed document: usable records plus the raw form of the ones that were not.
struct Document {
    providers: BTreeMap<String, ProviderConfig>,
    unreadable: BTreeMap<String, serde_json::Value>,
}

/// Read and parse the document record by record, resetting every status to
/// `Unknown`.
fn read_document(path: &Path) -> Result<Document, McpError> {
    if !path.exists() {
        return Err(McpError::ConfigurationMissing {
            path: path.display().to_string(),
        });
    }

    let content = std::fs::read_to_string(path).map_err(|e| McpError::Io {
        path: path.display().to_string(),
        source: e,
    })?;

    let raw: BTreeMap<String, serde_json::Value> =
        serde_json::from_str(&content).map_err(|e| McpError::ConfigError {
            reason: format!("failed to parse {}: {e}", path.display()),
        })?;

    let mut document = Document {
        providers: BTreeMap::new(),
        unreadable: BTreeMap::new(),
    };

    for (name, value) in raw {
        match serde_json::from_value::<ProviderConfig>(value.clone()) {
            Ok(mut config) => {
                config.name = name.clone();
                config.status = ProviderStatus::Unknown;
                document.providers.insert(name, config);
            }
            Err(e) => {
                tracing::warn!(provider = %name, error = %e, "skipping unreadable provider record");
                document.unreadable.insert(name, value);
            }
        }
    }

    Ok(document)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
