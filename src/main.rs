//! `mcp-switchboard`: answer one question with the help of MCP tool providers.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;

use mcp_switchboard::agent_core::{ConversationOrchestrator, StdoutSink};
use mcp_switchboard::config::{load_app_config, load_or_default, AppConfig};
use mcp_switchboard::inference::InferenceClient;
use mcp_switchboard::mcp_client::{
    DiscoveryScanner, HttpProbe, LivenessProbe, McpConnector, ProviderHub, ProviderRegistry,
    Supervisor,
};

#[derive(Parser, Debug)]
#[command(name = "mcp-switchboard")]
#[command(about = "Start MCP tool providers and answer a question using their tools")]
#[command(version)]
struct Cli {
    /// The question to answer
    question: Vec<String>,

    /// Scan the local port range for unregistered providers first
    #[arg(long)]
    scan: bool,

    /// Print the provider status report as JSON and exit
    #[arg(long)]
    status: bool,

    /// Settings file (default: search for switchboard.yaml)
    #[arg(short, long, env = "SWITCHBOARD_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let log_file = mcp_switchboard::init_tracing();

    let settings = load_settings(cli.config.as_deref())?;
    let question = cli.question.join(" ");
    if question.trim().is_empty() && !cli.status && !cli.scan {
        bail!("no question given (try: mcp-switchboard \"what is the weather in Beijing?\")");
    }

    let probe: Arc<dyn LivenessProbe> = Arc::new(HttpProbe::new());
    let mut registry = ProviderRegistry::load(settings.providers_path());

    if cli.scan {
        let report = DiscoveryScanner::new(probe.clone(), settings.discovery_settings())
            .scan(&mut registry)
            .await;
        println!(
            "scan: {} existing provider(s) confirmed, {} new provider(s) registered",
            report.updated.len(),
            report.registered.len()
        );
    }

    let mut supervisor = Supervisor::new(registry, probe, settings.supervisor_settings());

    if cli.status {
        let report = supervisor.status_report().await;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    if question.trim().is_empty() {
        return Ok(());
    }

    for (name, status) in supervisor.start_all().await {
        tracing::info!(provider = %name, %status, "auto-start");
    }

    let connector = Arc::new(McpConnector::new(settings.call_timeout()));
    let mut hub = ProviderHub::new(supervisor, connector);
    let refresh = hub.refresh_directory().await;
    for (provider, reason) in &refresh.skipped {
        eprintln!("warning: provider '{provider}' skipped: {reason}");
    }
    let directory = hub.directory();
    for provider in directory.provider_names() {
        tracing::info!(provider = %provider, tools = directory.tools_for_provider(&provider), "tools available");
    }

    let engine = InferenceClient::new(settings.model.clone()).context("building completion client")?;
    let orchestrator =
        ConversationOrchestrator::new(Arc::new(engine)).with_sink(Arc::new(StdoutSink::new()));

    orchestrator.run_turn(&mut hub, &question).await;

    hub.supervisor_mut().stop_all().await;
    if let Some(path) = log_file {
        tracing::info!(log_file = %path.display(), "=== mcp-switchboard finished ===");
    }
    Ok(())
}

fn load_settings(explicit: Option<&std::path::Path>) -> anyhow::Result<AppConfig> {
    match explicit {
        Some(path) => load_app_config(path).with_context(|| format!("loading {}", path.display())),
        None => {
            let cwd = std::env::current_dir().context("reading current directory")?;
            Ok(load_or_default(&cwd)?)
        }
    }
}
