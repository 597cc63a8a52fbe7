//! MCP Client: provider supervision, discovery and tool routing.
//!
//! This module handles:
//! - The persisted provider registry (`mcp_servers.json`)
//! - Starting, stopping and health-checking provider processes
//! - Scanning a local port range for unregistered providers
//! - JSON-RPC 2.0 sessions over stdio or an SSE connection
//! - Aggregating every running provider's tools into one directory
//! - Routing a tool call to its owning provider
//!
//! `ProviderHub` is the entry point the conversation orchestrator uses.

pub mod client;
pub mod config;
pub mod discovery;
pub mod errors;
pub mod lifecycle;
pub mod probe;
pub mod process;
pub mod registry;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use client::{InvocationOutcome, InvocationResult, ProviderHub};
pub use config::{ProviderConfig, ProviderRegistry, ProviderStatus, TransportKind};
pub use discovery::{DiscoveryScanner, DiscoverySettings, ScanReport};
pub use errors::{InvocationError, McpError};
pub use lifecycle::{ProcessOwnership, ProviderStatusReport, Supervisor, SupervisorSettings};
pub use probe::{HttpProbe, LivenessProbe};
pub use registry::{RefreshReport, ToolDescriptor, ToolDirectory};
pub use transport::{McpConnector, McpSession, ProviderConnector};
pub use types::{Arguments, McpToolDefinition};
