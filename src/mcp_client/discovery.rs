//! Discovery Scanner: find MCP servers listening on local ports.
//!
//! Best-effort: each port gets one short-timeout probe and silence is not an
//! error. A responder on an endpoint that a configured provider already
//! claims updates that provider instead of creating a duplicate.

use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};

use super::config::{local_sse_url, ProviderConfig, ProviderRegistry, ProviderStatus};
use super::probe::LivenessProbe;

/// Sweep parameters.
#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub ports: RangeInclusive<u16>,
    pub probe_timeout: Duration,
    /// Probes in flight at once.
    pub concurrency: usize,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            ports: 8000..=8999,
            probe_timeout: Duration::from_secs(2),
            concurrency: 32,
        }
    }
}

/// What a sweep changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanReport {
    /// Existing providers whose status was set to Running.
    pub updated: Vec<String>,
    /// Newly registered `discovered_server_<port>` entries.
    pub registered: Vec<String>,
}

pub struct DiscoveryScanner {
    probe: Arc<dyn LivenessProbe>,
    settings: DiscoverySettings,
}

impl DiscoveryScanner {
    pub fn new(probe: Arc<dyn LivenessProbe>, settings: DiscoverySettings) -> Self {
        Self { probe, settings }
    }

    /// Probe every port in range and reconcile responders into `registry`.
    pub async fn scan(&self, registry: &mut ProviderRegistry) -> ScanReport {
        let timeout = self.settings.probe_timeout;
        let probe = &self.probe;

        let alive: Vec<u16> = stream::iter(self.settings.ports.clone())
            .map(|port| async move {
                let reachable = probe.is_reachable(&local_sse_url(port), timeout).await;
                (port, reachable)
            })
            .buffered(self.settings.concurrency.max(1))
            .filter_map(|(port, reachable)| async move { reachable.then_some(port) })
            .collect()
            .await;

        let mut report = ScanReport::default();

        for port in alive {
            let url = local_sse_url(port);
            let existing = registry.find_by_endpoint(&url).map(|c| c.name.clone());

            match existing {
                Some(name) => {
                    if let Some(config) = registry.get_mut(&name) {
                        config.status = ProviderStatus::Running;
                    }
                    tracing::info!(provider = %name, port, "discovered responder belongs to known provider");
                    report.updated.push(name);
                }
                None => {
                    let config = ProviderConfig::discovered(port);
                    let name = config.name.clone();
                    if let Err(e) = registry.upsert(config) {
                        tracing::warn!(provider = %name, error = %e, "failed to register discovered provider");
                        continue;
                    }
                    report.registered.push(name);
                }
            }
        }

        if !report.updated.is_empty() {
            if let Err(e) = registry.save() {
                tracing::warn!(error = %e, "failed to persist discovery results");
            }
        }

        tracing::info!(
            ports = ?self.settings.ports,
            updated = report.updated.len(),
            registered = report.registered.len(),
            "discovery scan finished"
        );
        report
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::config::DEFAULT_PROVIDER;
    use crate::testing::StaticProbe;
    use tempfile::TempDir;

    fn scanner(probe: StaticProbe) -> DiscoveryScanner {
        DiscoveryScanner::new(
            Arc::new(probe),
            DiscoverySettings {
                ports: 8000..=8005,
                probe_timeout: Duration::from_millis(50),
                concurrency: 4,
            },
        )
    }

    #[tokio::test]
    async fn test_configured_endpoint_is_not_duplicated() {
        let tmp = TempDir::new().unwrap();
        let mut registry = ProviderRegistry::new(tmp.path().join("p.json"));
        registry.upsert(ProviderConfig::builtin_default()).unwrap();

        let report = scanner(StaticProbe::reachable(["http://127.0.0.1:8000/sse"]))
            .scan(&mut registry)
            .await;

        assert_eq!(report.updated, vec![DEFAULT_PROVIDER.to_string()]);
        assert!(report.registered.is_empty());
        assert!(!registry.contains("discovered_server_8000"));
        assert_eq!(
            registry.get(DEFAULT_PROVIDER).unwrap().status,
            ProviderStatus::Running
        );
    }

    #[tokio::test]
    async fn test_unknown_responder_is_registered() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("p.json");
        let mut registry = ProviderRegistry::new(&path);
        registry.upsert(ProviderConfig::builtin_default()).unwrap();

        let report = scanner(StaticProbe::reachable(["http://127.0.0.1:8003/sse"]))
            .scan(&mut registry)
            .await;

        assert_eq!(report.registered, vec!["discovered_server_8003".to_string()]);
        let found = registry.get("discovered_server_8003").unwrap();
        assert!(!found.auto_start);
        assert_eq!(found.status, ProviderStatus::Running);
        assert_eq!(found.port, Some(8003));

        let reloaded = ProviderRegistry::load(&path);
        assert!(reloaded.contains("discovered_server_8003"));
    }

    #[tokio::test]
    async fn test_rescan_does_not_duplicate_discovered_entry() {
        let tmp = TempDir::new().unwrap();
        let mut registry = ProviderRegistry::new(tmp.path().join("p.json"));
        let scanner = scanner(StaticProbe::reachable(["http://127.0.0.1:8002/sse"]));

        scanner.scan(&mut registry).await;
        let second = scanner.scan(&mut registry).await;

        assert!(second.registered.is_empty());
        assert_eq!(second.updated, vec!["discovered_server_8002".to_string()]);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_silence_changes_nothing() {
        let tmp = TempDir::new().unwrap();
        let mut registry = ProviderRegistry::new(tmp.path().join("p.json"));
        let report = scanner(StaticProbe::none()).scan(&mut registry).await;
        assert_eq!(report, ScanReport::default());
        assert!(registry.is_empty());
    }
}
