//! Provider transports and sessions.
//!
//! - [`StdioTransport`]: line-delimited JSON-RPC over a child's stdin/stdout.
//! - [`SseTransport`]: JSON-RPC POSTed to the endpoint announced on an SSE
//!   stream, with responses read back from that stream.
//! - [`McpSession`]: one handshaken session over either transport.
//! - [`ProviderConnector`]: the seam the tool directory and the router use;
//!   [`McpConnector`] opens a fresh session per operation.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::config::{ProviderConfig, TransportKind};
use super::errors::McpError;
use super::types::{
    call_params, error_codes, initialize_params, Arguments, CallToolResult, InitializeResult,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ListToolsResult, McpToolDefinition,
};
use crate::sse::{event_stream, SseEvent};

/// Default bound on a single request (handshake, list, call).
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Buffered SSE events awaiting a reader.
const EVENT_CHANNEL_CAPACITY: usize = 64;

// ─── Stdio Transport ─────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    server_name: String,
    writer: Mutex<ChildStdin>,
    reader: Mutex<BufReader<ChildStdout>>,
    next_id: AtomicU64,
}

impl StdioTransport {
    /// Create a new transport from a child process's stdin/stdout.
    pub fn new(server_name: &str, stdin: ChildStdin, stdout: ChildStdout) -> Self {
        Self {
            server_name: server_name.to_string(),
            writer: Mutex::new(stdin),
            reader: Mutex::new(BufReader::new(stdout)),
            next_id: AtomicU64::new(1),
        }
    }

    fn transport_error(&self, reason: String) -> McpError {
        McpError::TransportError {
            server: self.server_name.clone(),
            reason,
        }
    }

    async fn write_line(&self, json: String) -> Result<(), McpError> {
        let mut writer = self.writer.lock().await;
        writer
            .write_all(json.as_bytes())
            .await
            .map_err(|e| self.transport_error(format!("failed to write to stdin: {e}")))?;
        writer
            .write_all(b"\n")
            .await
            .map_err(|e| self.transport_error(format!("failed to write to stdin: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| self.transport_error(format!("failed to flush stdin: {e}")))
    }

    /// Send a request and read lines until the response with the same id.
    ///
    /// Lines that are not JSON-RPC responses (provider log output,
    /// notifications) are skipped.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = JsonRpcRequest::new(id, method, params);
        let json = serde_json::to_string(&req)
            .map_err(|e| self.transport_error(format!("failed to serialize request: {e}")))?;
        self.write_line(json).await?;

        let mut line_buf = String::new();
        let mut reader = self.reader.lock().await;

        loop {
            line_buf.clear();
            let bytes_read = reader
                .read_line(&mut line_buf)
                .await
                .map_err(|e| self.transport_error(format!("failed to read from stdout: {e}")))?;

            if bytes_read == 0 {
                return Err(self.transport_error(
                    "provider stdout closed (process may have exited)".into(),
                ));
            }

            let trimmed = line_buf.trim();
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                Ok(resp) if resp.id == id => return Ok(resp),
                _ => continue,
            }
        }
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let json = serde_json::to_string(&JsonRpcNotification::new(method, params))
            .map_err(|e| self.transport_error(format!("failed to serialize notification: {e}")))?;
        self.write_line(json).await
    }
}

// ─── SSE Transport ───────────────────────────────────────────────────────────

type EventStream = Pin<Box<dyn Stream<Item = Result<SseEvent, String>> + Send>>;

/// JSON-RPC over an SSE connection.
///
/// The stream is read by a background task that forwards events into a
/// channel; the task is aborted when the transport is dropped.
pub struct SseTransport {
    server_name: String,
    http: reqwest::Client,
    post_url: reqwest::Url,
    events: Mutex<mpsc::Receiver<SseEvent>>,
    reader_task: JoinHandle<()>,
    next_id: AtomicU64,
}

impl SseTransport {
    /// Open the event stream and wait for the `endpoint` announcement.
    /// `timeout` bounds the whole handshake, response headers included.
    pub async fn connect(server_name: &str, url: &str, timeout: Duration) -> Result<Self, McpError> {
        let transport_error = |reason: String| McpError::TransportError {
            server: server_name.to_string(),
            reason,
        };

        let base = reqwest::Url::parse(url)
            .map_err(|e| transport_error(format!("invalid url '{url}': {e}")))?;

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .no_proxy()
            .build()
            .map_err(|e| transport_error(format!("failed to build HTTP client: {e}")))?;

        let handshake = async {
            let response = http
                .get(base.clone())
                .header(reqwest::header::ACCEPT, "text/event-stream")
                .send()
                .await
                .map_err(|e| format!("failed to open event stream: {e}"))?;

            if !response.status().is_success() {
                return Err(format!("event stream returned HTTP {}", response.status()));
            }

            let mut stream: EventStream = Box::pin(event_stream(response.bytes_stream()));
            let endpoint = wait_for_endpoint(&mut stream).await?;
            Ok::<_, String>((stream, endpoint))
        };

        let (mut stream, endpoint) = tokio::time::timeout(timeout, handshake)
            .await
            .map_err(|_| McpError::Timeout {
                operation: format!("{server_name}: endpoint announcement"),
                timeout_ms: timeout.as_millis() as u64,
            })?
            .map_err(transport_error)?;

        let post_url = base
            .join(endpoint.trim())
            .map_err(|e| transport_error(format!("invalid endpoint '{endpoint}': {e}")))?;

        tracing::debug!(provider = server_name, post_url = %post_url, "sse session established");

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let name = server_name.to_string();
        let reader_task = tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(provider = %name, error = %e, "sse stream ended");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            server_name: server_name.to_string(),
            http,
            post_url,
            events: Mutex::new(rx),
            reader_task,
            next_id: AtomicU64::new(1),
        })
    }

    fn transport_error(&self, reason: String) -> McpError {
        McpError::TransportError {
            server: self.server_name.clone(),
            reason,
        }
    }

    async fn post(&self, body: &impl serde::Serialize) -> Result<(), McpError> {
        let response = self
            .http
            .post(self.post_url.clone())
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(format!("POST failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.transport_error(format!("POST returned HTTP {status}: {body}")));
        }
        Ok(())
    }

    /// POST a request and wait for the `message` event carrying its response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.post(&JsonRpcRequest::new(id, method, params)).await?;

        let mut events = self.events.lock().await;
        loop {
            let Some(event) = events.recv().await else {
                return Err(self.transport_error("event stream closed".into()));
            };
            if event.kind() != "message" {
                continue;
            }
            match serde_json::from_str::<JsonRpcResponse>(&event.data) {
                Ok(resp) if resp.id == id => return Ok(resp),
                _ => continue,
            }
        }
    }

    /// POST a notification.
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        self.post(&JsonRpcNotification::new(method, params)).await
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

async fn wait_for_endpoint(stream: &mut EventStream) -> Result<String, String> {
    while let Some(item) = stream.next().await {
        let event = item?;
        if event.kind() == "endpoint" {
            return Ok(event.data);
        }
    }
    Err("event stream ended before an endpoint was announced".into())
}

// ─── Session ─────────────────────────────────────────────────────────────────

enum Channel {
    Stdio {
        transport: StdioTransport,
        child: Child,
    },
    Sse(SseTransport),
}

/// One initialized session with a provider.
pub struct McpSession {
    name: String,
    channel: Channel,
    timeout: Duration,
    info: InitializeResult,
}

impl McpSession {
    /// Connect (or spawn) according to the provider's transport and run the
    /// initialization handshake.
    pub async fn open(config: &ProviderConfig, timeout: Duration) -> Result<Self, McpError> {
        let name = config.name.clone();
        let channel = match config.transport {
            TransportKind::ChildProcess => {
                let (transport, child) = spawn_stdio(config)?;
                Channel::Stdio { transport, child }
            }
            TransportKind::PersistentConnection => {
                let url = config.endpoint().ok_or_else(|| McpError::ConfigError {
                    reason: format!("provider '{name}' has no url or port"),
                })?;
                Channel::Sse(SseTransport::connect(&name, &url, timeout).await?)
            }
        };

        let mut session = Self {
            name,
            channel,
            timeout,
            info: InitializeResult {
                protocol_version: None,
                capabilities: serde_json::Value::Null,
                server_info: None,
            },
        };
        session.info = session.initialize().await?;
        Ok(session)
    }

    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        let fut = async {
            match &self.channel {
                Channel::Stdio { transport, .. } => transport.request(method, params).await,
                Channel::Sse(transport) => transport.request(method, params).await,
            }
        };
        let response = tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| McpError::Timeout {
                operation: format!("{}: {method}", self.name),
                timeout_ms: self.timeout.as_millis() as u64,
            })??;
        extract_result(response)
    }

    async fn notify(&self, method: &str) -> Result<(), McpError> {
        match &self.channel {
            Channel::Stdio { transport, .. } => transport.notify(method, None).await,
            Channel::Sse(transport) => transport.notify(method, None).await,
        }
    }

    async fn initialize(&self) -> Result<InitializeResult, McpError> {
        let result = self
            .request("initialize", Some(initialize_params()))
            .await
            .map_err(|e| McpError::InitFailed {
                name: self.name.clone(),
                reason: e.to_string(),
            })?;

        let info: InitializeResult =
            serde_json::from_value(result).map_err(|e| McpError::InitFailed {
                name: self.name.clone(),
                reason: format!("failed to parse initialize response: {e}"),
            })?;

        self.notify("notifications/initialized").await?;

        tracing::debug!(
            provider = %self.name,
            protocol = ?info.protocol_version,
            server = ?info.server_info.as_ref().and_then(|s| s.name.clone()),
            "session initialized"
        );
        Ok(info)
    }

    /// Handshake result reported by the provider.
    pub fn server_info(&self) -> &InitializeResult {
        &self.info
    }

    /// `tools/list`
    pub async fn list_tools(&self) -> Result<Vec<McpToolDefinition>, McpError> {
        let result = self.request("tools/list", None).await?;
        let list: ListToolsResult =
            serde_json::from_value(result).map_err(|e| McpError::TransportError {
                server: self.name.clone(),
                reason: format!("malformed tools/list result: {e}"),
            })?;
        Ok(list.tools)
    }

    /// `tools/call`
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: &Arguments,
    ) -> Result<CallToolResult, McpError> {
        let result = self
            .request("tools/call", Some(call_params(name, arguments)))
            .await?;
        serde_json::from_value(result).map_err(|e| McpError::TransportError {
            server: self.name.clone(),
            reason: format!("malformed tools/call result: {e}"),
        })
    }

    /// End the session. A spawned stdio provider is killed.
    pub async fn close(self) {
        if let Channel::Stdio { transport, mut child } = self.channel {
            drop(transport);
            if tokio::time::timeout(Duration::from_millis(500), child.wait())
                .await
                .is_err()
            {
                let _ = child.kill().await;
            }
        }
    }
}

/// Spawn a stdio provider for one session.
fn spawn_stdio(config: &ProviderConfig) -> Result<(StdioTransport, Child), McpError> {
    let name = config.name.as_str();
    let spawn_failed = |reason: String| McpError::SpawnFailed {
        name: name.to_string(),
        reason,
    };

    let command_line = config.command.as_deref().unwrap_or_default();
    let mut parts = command_line.split_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| spawn_failed("no launch command configured".into()))?;

    let mut cmd = Command::new(program);
    cmd.args(parts);
    cmd.envs(&config.env_vars);
    if let Some(dir) = config.working_directory.as_deref() {
        cmd.current_dir(dir);
    }

    #[cfg(target_os = "windows")]
    {
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::null());
    cmd.kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| spawn_failed(format!("{command_line}: {e}")))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| spawn_failed("failed to capture stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| spawn_failed("failed to capture stdout".into()))?;

    Ok((StdioTransport::new(name, stdin, stdout), child))
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Connector ───────────────────────────────────────────────────────────────

/// Opens provider sessions on behalf of the tool directory and the router.
#[async_trait]
pub trait ProviderConnector: Send + Sync {
    /// Retrieve a provider's procedure catalog.
    async fn list_tools(&self, provider: &ProviderConfig) -> Result<Vec<McpToolDefinition>, McpError>;

    /// Invoke one procedure and return its text payload.
    async fn call_tool(
        &self,
        provider: &ProviderConfig,
        name: &str,
        arguments: &Arguments,
    ) -> Result<String, McpError>;
}

/// Real connector: a fresh MCP session per operation, no pooling.
pub struct McpConnector {
    timeout: Duration,
}

impl McpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for McpConnector {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

#[async_trait]
impl ProviderConnector for McpConnector {
    async fn list_tools(&self, provider: &ProviderConfig) -> Result<Vec<McpToolDefinition>, McpError> {
        let session = McpSession::open(provider, self.timeout).await?;
        let server = session
            .server_info()
            .server_info
            .as_ref()
            .and_then(|s| s.name.clone())
            .unwrap_or_else(|| provider.name.clone());
        let tools = session.list_tools().await;
        if let Ok(list) = &tools {
            tracing::info!(provider = %provider.name, server = %server, count = list.len(), "catalog received");
        }
        session.close().await;
        tools
    }

    async fn call_tool(
        &self,
        provider: &ProviderConfig,
        name: &str,
        arguments: &Arguments,
    ) -> Result<String, McpError> {
        let session = McpSession::open(provider, self.timeout).await?;
        let result = session.call_tool(name, arguments).await;
        session.close().await;

        let result = result?;
        if result.is_error {
            return Err(McpError::ServerError {
                code: error_codes::INTERNAL_ERROR,
                message: result.text(),
                data: None,
            });
        }
        Ok(result.text())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::types::JsonRpcError;

    #[test]
    fn test_extract_result_success() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: 1,
            result: Some(serde_json::json!({"tools": []})),
            error: None,
        };
        let result = extract_result(resp).unwrap();
        assert!(result["tools"].is_array());
    }

    #[test]
    fn test_extract_result_error() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: 1,
            result: None,
            error: Some(JsonRpcError {
                code: -32601,
                message: "Method not found".into(),
                data: None,
            }),
        };
        match extract_result(resp).unwrap_err() {
            McpError::ServerError { code, message, .. } => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Method not found");
            }
            other => panic!("expected ServerError, got {other:?}"),
        }
    }

    #[test]
    fn test_extract_result_missing_both() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: 1,
            result: None,
            error: None,
        };
        assert!(matches!(
            extract_result(resp).unwrap_err(),
            McpError::ServerError { .. }
        ));
    }

    #[tokio::test]
    async fn test_sse_connect_refused_is_transport_error() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let url = format!("http://127.0.0.1:{port}/sse");
        let err = SseTransport::connect("ghost", &url, Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, McpError::TransportError { .. }));
    }

    #[tokio::test]
    async fn test_sse_connect_silent_server_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let held = tokio::spawn(async move {
            let mut sockets = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                sockets.push(socket);
            }
        });

        let url = format!("http://127.0.0.1:{port}/sse");
        let started = std::time::Instant::now();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            SseTransport::connect("silent", &url, Duration::from_millis(300)),
        )
        .await
        .expect("connect must honour its own timeout");

        assert!(matches!(result.err().unwrap(), McpError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
        held.abort();
    }

    /// A scripted stdio provider: answers initialize (id 1), swallows the
    /// initialized notification, prints a log line, then answers the next
    /// request (id 2) with a fixed payload.
    #[cfg(unix)]
    fn scripted_provider(dir: &std::path::Path, second_reply: &str) -> ProviderConfig {
        let script = format!(
            "read line\n\
             echo '{{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{{\"protocolVersion\":\"2024-11-05\",\"capabilities\":{{}},\"serverInfo\":{{\"name\":\"loc\"}}}}}}'\n\
             read line\n\
             read line\n\
             echo 'starting up...'\n\
             echo '{second_reply}'\n"
        );
        std::fs::write(dir.join("provider.sh"), script).unwrap();

        ProviderConfig {
            name: "loc_server".to_string(),
            description: String::new(),
            transport: TransportKind::ChildProcess,
            command: Some("sh provider.sh".to_string()),
            url: None,
            port: None,
            working_directory: Some(dir.display().to_string()),
            env_vars: Default::default(),
            auto_start: false,
            health_check_endpoint: None,
            pid: None,
            status: Default::default(),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdio_session_lists_tools() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = scripted_provider(
            tmp.path(),
            r#"{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"get_location","description":"Where an employee sits","inputSchema":{"type":"object"}}]}}"#,
        );

        let tools = McpConnector::new(Duration::from_secs(5))
            .list_tools(&config)
            .await
            .unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "get_location");
        assert_eq!(tools[0].params_schema["type"], "object");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdio_call_returns_text_and_maps_is_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let ok = scripted_provider(
            tmp.path(),
            r#"{"jsonrpc":"2.0","id":2,"result":{"content":[{"type":"text","text":"Room 301"}],"isError":false}}"#,
        );
        let connector = McpConnector::new(Duration::from_secs(5));
        let mut args = Arguments::new();
        args.insert("employee_id".into(), "D0001".into());

        let text = connector.call_tool(&ok, "get_location", &args).await.unwrap();
        assert_eq!(text, "Room 301");

        let failing = scripted_provider(
            tmp.path(),
            r#"{"jsonrpc":"2.0","id":2,"result":{"content":[{"type":"text","text":"no such employee"}],"isError":true}}"#,
        );
        let err = connector.call_tool(&failing, "get_location", &args).await.unwrap_err();
        assert!(err.to_string().contains("no such employee"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdio_provider_exit_is_transport_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = scripted_provider(tmp.path(), "");
        std::fs::write(tmp.path().join("provider.sh"), "exit 0\n").unwrap();

        let err = McpConnector::new(Duration::from_secs(5))
            .list_tools(&config)
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::InitFailed { .. }));
    }
}
