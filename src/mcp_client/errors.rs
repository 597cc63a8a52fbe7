//! Provider supervision and invocation error types.

use thiserror::Error;

/// Errors raised while supervising providers or talking to them.
///
/// None of these abort a bulk operation: the supervisor and the tool
/// directory catch them where they occur and turn them into a status value
/// or a skipped entry.
#[derive(Debug, Error)]
pub enum McpError {
    /// A provider process failed to start.
    #[error("failed to spawn provider '{name}': {reason}")]
    SpawnFailed {
        name: String,
        reason: String,
    },

    /// The initialization handshake failed.
    #[error("provider '{name}' initialization failed: {reason}")]
    InitFailed {
        name: String,
        reason: String,
    },

    /// JSON-RPC communication error (malformed message, I/O error, closed stream).
    #[error("transport error for provider '{server}': {reason}")]
    TransportError {
        server: String,
        reason: String,
    },

    /// Provider returned a JSON-RPC error response.
    #[error("provider error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// A request did not complete in time.
    #[error("'{operation}' timed out after {timeout_ms}ms")]
    Timeout {
        operation: String,
        timeout_ms: u64,
    },

    /// Probe or spawn did not yield a live responder within the settle window.
    #[error("provider '{name}' is unreachable: {reason}")]
    ProviderUnreachable {
        name: String,
        reason: String,
    },

    /// No persisted provider document exists at the given path.
    #[error("no provider document at {path}")]
    ConfigurationMissing {
        path: String,
    },

    /// The provider document or a provider record is unusable.
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },

    /// No provider with that name is registered.
    #[error("unknown provider: '{name}'")]
    UnknownProvider {
        name: String,
    },

    /// Filesystem error while persisting the provider document.
    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Typed outcome of a failed procedure invocation.
///
/// Returned to the orchestrator, which folds the message into the final
/// answer instead of aborting the turn.
#[derive(Debug, Error)]
pub enum InvocationError {
    /// The procedure is not in the tool directory.
    #[error("unknown procedure: '{name}'")]
    UnknownProcedure {
        name: String,
    },

    /// The procedure is known but its provider is not running.
    #[error("provider '{provider}' for '{procedure}' is not running (status: {status})")]
    ProviderUnavailable {
        procedure: String,
        provider: String,
        status: String,
    },

    /// Transport or remote-side error during the call.
    #[error("call to '{procedure}' failed: {reason}")]
    CallFailed {
        procedure: String,
        reason: String,
    },
}
