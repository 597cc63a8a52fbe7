//! Liveness Prober: "is anything answering at this address right now?"

use std::time::Duration;

use async_trait::async_trait;

/// Connect timeout applied inside every probe request.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Lightweight connectivity check against a provider address.
///
/// Implementations must swallow every failure and answer `false`: absence of
/// a responder is an expected state, not an error.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn is_reachable(&self, url: &str, timeout: Duration) -> bool;
}

/// Probe that issues an HTTP `HEAD` and treats any 2xx status as alive.
pub struct HttpProbe {
    http: reqwest::Client,
}

impl HttpProbe {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .no_proxy()
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "failed to build probe client, using defaults");
                reqwest::Client::new()
            });
        Self { http }
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LivenessProbe for HttpProbe {
    async fn is_reachable(&self, url: &str, timeout: Duration) -> bool {
        match self.http.head(url).timeout(timeout).send().await {
            Ok(resp) => {
                let alive = resp.status().is_success();
                tracing::debug!(url, status = %resp.status(), alive, "liveness probe");
                alive
            }
            Err(e) => {
                tracing::trace!(url, error = %e, "liveness probe failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_closed_port_is_unreachable() {
        // Bind then drop to get a local port with nothing listening.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let probe = HttpProbe::new();
        let url = format!("http://127.0.0.1:{port}/sse");
        assert!(!probe.is_reachable(&url, Duration::from_millis(500)).await);
    }

    #[tokio::test]
    async fn test_malformed_url_is_unreachable() {
        let probe = HttpProbe::new();
        assert!(!probe.is_reachable("not a url", Duration::from_millis(100)).await);
    }
}
