// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Panel Contributors

// Tunnel Panel - Status Aggregation
// Joins the configured tunnels with their current state, taken either from
// the local tunnel logs or from a remote status endpoint.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config_store::ConfigStore;
use crate::error::{Error, Result};
use crate::fingerprint::FingerprintProtocol;
use crate::log_classifier;
use crate::types::{
    LinkState, StatusResponse, Tunnel, TunnelConfig, TunnelReport, TunnelState,
};

pub const STATUS_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Default timeout for remote status polling
pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_millis(2000);

/// Pause between the stop and start halves of a restart
pub const RESTART_DELAY: Duration = Duration::from_secs(1);

/// Control request forwarded to the tunnel runner
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TunnelAction {
    Start,
    Stop,
    /// Stop, wait `RESTART_DELAY`, then start
    Restart,
}

impl TunnelAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelAction::Start => "start",
            TunnelAction::Stop => "stop",
            TunnelAction::Restart => "restart",
        }
    }
}

impl fmt::Display for TunnelAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TunnelAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "start" => Ok(TunnelAction::Start),
            "stop" => Ok(TunnelAction::Stop),
            "restart" => Ok(TunnelAction::Restart),
            other => Err(format!(
                "unknown action '{}' (expected start, stop or restart)",
                other
            )),
        }
    }
}

/// Source of tunnel state
#[async_trait]
pub trait StatusProvider: Send + Sync {
    /// Produce one report per tunnel, in the order given. Never fails.
    async fn reports(&self, tunnels: &[Tunnel], protocol: FingerprintProtocol) -> Vec<TunnelReport>;
}

/// Local mode: classify each tunnel's log file
#[derive(Debug, Clone)]
pub struct LogStatusProvider {
    logs_dir: PathBuf,
}

impl LogStatusProvider {
    pub fn new(logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            logs_dir: logs_dir.into(),
        }
    }

    fn report_for(&self, tunnel: &Tunnel, protocol: FingerprintProtocol) -> TunnelReport {
        let fingerprint = protocol.fingerprint(tunnel);
        let log_path = fingerprint.log_path(&self.logs_dir);
        let mut classification = log_classifier::classify(&log_path);

        if classification.message == log_classifier::MSG_LOG_NOT_FOUND {
            if let Some(other) = self.mismatched_protocol(tunnel, protocol) {
                warn!(
                    "No {} log for tunnel '{}', but a {} log exists; check the fingerprint protocol setting",
                    protocol, tunnel.name, other
                );
                classification.message = format!(
                    "log not found for fingerprint protocol {}; a {} log exists (fingerprint protocol mismatch)",
                    protocol, other
                );
            }
        }

        debug!(
            "Tunnel '{}' ({}): {} - {}",
            tunnel.name, fingerprint, classification.state, classification.message
        );

        TunnelReport {
            tunnel: tunnel.clone(),
            log_id: fingerprint.value,
            status: TunnelState::Link(classification.state),
            last_update: classification.last_update,
            message: classification.message,
        }
    }

    /// Another protocol whose log file for this tunnel exists
    fn mismatched_protocol(
        &self,
        tunnel: &Tunnel,
        configured: FingerprintProtocol,
    ) -> Option<FingerprintProtocol> {
        FingerprintProtocol::ALL
            .into_iter()
            .filter(|p| *p != configured)
            .find(|p| p.fingerprint(tunnel).log_path(&self.logs_dir).exists())
    }
}

#[async_trait]
impl StatusProvider for LogStatusProvider {
    async fn reports(&self, tunnels: &[Tunnel], protocol: FingerprintProtocol) -> Vec<TunnelReport> {
        let provider = self.clone();
        let owned = tunnels.to_vec();

        let joined = tokio::task::spawn_blocking(move || {
            owned
                .iter()
                .map(|tunnel| provider.report_for(tunnel, protocol))
                .collect::<Vec<_>>()
        })
        .await;

        match joined {
            Ok(reports) => reports,
            Err(e) => {
                warn!("Log classification task failed: {}", e);
                tunnels
                    .iter()
                    .map(|tunnel| TunnelReport {
                        tunnel: tunnel.clone(),
                        log_id: protocol.fingerprint(tunnel).value,
                        status: TunnelState::Link(LinkState::Unknown),
                        last_update: None,
                        message: format!("log classification failed: {}", e),
                    })
                    .collect()
            }
        }
    }
}

/// One entry of the remote `/status` list
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteTunnelStatus {
    pub name: String,
    pub status: String,
}

/// Remote mode: poll `{base_url}/status` and join by tunnel name
#[derive(Debug, Clone)]
pub struct RemoteStatusProvider {
    client: Client,
    base_url: Option<String>,
    api_key: Option<String>,
    restart_delay: Duration,
}

impl RemoteStatusProvider {
    pub fn new(base_url: Option<String>, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build status client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.filter(|url| !url.trim().is_empty()),
            api_key: api_key.filter(|key| !key.is_empty()),
            restart_delay: RESTART_DELAY,
        })
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    fn base_url(&self) -> Result<&str> {
        self.base_url
            .as_deref()
            .map(|url| url.trim_end_matches('/'))
            .ok_or_else(|| Error::RemoteUnavailable("status endpoint not configured".to_string()))
    }

    /// Ask the tunnel runner to start, stop or restart the tunnel with `log_id`
    pub async fn control(&self, action: TunnelAction, log_id: &str) -> Result<()> {
        match action {
            TunnelAction::Restart => {
                self.send_control("stop", log_id).await?;
                tokio::time::sleep(self.restart_delay).await;
                self.send_control("start", log_id).await
            }
            other => self.send_control(other.as_str(), log_id).await,
        }
    }

    async fn send_control(&self, verb: &str, log_id: &str) -> Result<()> {
        let url = format!("{}/{}/{}", self.base_url()?, verb, log_id);

        let mut request = self.client.post(&url);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::RemoteUnavailable(format!("POST {} failed: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(Error::RemoteUnavailable(format!(
                "POST {} returned {}",
                url,
                response.status()
            )));
        }

        info!("Sent {} for tunnel {}", verb, log_id);
        Ok(())
    }

    /// Fetch the remote status list
    pub async fn poll(&self) -> Result<Vec<RemoteTunnelStatus>> {
        let url = format!("{}/status", self.base_url()?);

        let mut request = self.client.get(&url);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::RemoteUnavailable(format!("GET {} failed: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(Error::RemoteUnavailable(format!(
                "GET {} returned {}",
                url,
                response.status()
            )));
        }

        response
            .json::<Vec<RemoteTunnelStatus>>()
            .await
            .map_err(|e| Error::RemoteUnavailable(format!("invalid status list from {}: {}", url, e)))
    }
}

#[async_trait]
impl StatusProvider for RemoteStatusProvider {
    async fn reports(&self, tunnels: &[Tunnel], protocol: FingerprintProtocol) -> Vec<TunnelReport> {
        let polled = self.poll().await.map_err(|e| {
            warn!("{}", e);
            e.to_string()
        });

        tunnels
            .iter()
            .map(|tunnel| {
                let (status, message) = match &polled {
                    Err(reason) => (TunnelState::Unavailable, reason.clone()),
                    Ok(list) => match list.iter().find(|s| s.name == tunnel.name) {
                        Some(remote) => (
                            TunnelState::from(remote.status.clone()),
                            "reported by status endpoint".to_string(),
                        ),
                        None => (
                            TunnelState::Stopped,
                            "not reported by status endpoint".to_string(),
                        ),
                    },
                };

                TunnelReport {
                    tunnel: tunnel.clone(),
                    log_id: protocol.fingerprint(tunnel).value,
                    status,
                    last_update: None,
                    message,
                }
            })
            .collect()
    }
}

/// Builds status responses from the stored config and a provider
#[derive(Clone)]
pub struct StatusAggregator {
    provider: Arc<dyn StatusProvider>,
    protocol: FingerprintProtocol,
}

impl StatusAggregator {
    pub fn new(provider: Arc<dyn StatusProvider>, protocol: FingerprintProtocol) -> Self {
        Self { provider, protocol }
    }

    pub fn protocol(&self) -> FingerprintProtocol {
        self.protocol
    }

    /// Load the config and report on every tunnel
    ///
    /// Only a config load failure is an error; status problems are reported
    /// per tunnel.
    pub async fn report(&self, store: &Arc<ConfigStore>) -> Result<StatusResponse> {
        let config = store.spawn_load().await?;
        Ok(self.report_for(&config).await)
    }

    pub async fn report_for(&self, config: &TunnelConfig) -> StatusResponse {
        let tunnels = self.provider.reports(&config.tunnels, self.protocol).await;

        StatusResponse {
            tunnels,
            timestamp: chrono::Local::now().format(STATUS_TIMESTAMP_FORMAT).to_string(),
            fingerprint_protocol: self.protocol.tag().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Direction;
    use std::fs;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn tunnel(name: &str, local_port: u16) -> Tunnel {
        Tunnel {
            name: name.to_string(),
            remote_host: "db.example.com".to_string(),
            remote_port: 5432,
            local_port,
            direction: Direction::RemoteToLocal,
            interactive: None,
        }
    }

    /// Serve a single canned HTTP response on a local port
    async fn serve_once(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let request_len = socket.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..request_len]).to_string();
            assert!(request.starts_with("GET /status "));

            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });

        format!("http://{}", addr)
    }

    /// Answer `count` requests with `status_line`, returning each request head
    async fn serve_recording(
        count: usize,
        status_line: &'static str,
    ) -> (String, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let mut heads = Vec::new();
            for _ in 0..count {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = [0u8; 4096];
                let len = socket.read(&mut buf).await.unwrap();
                heads.push(String::from_utf8_lossy(&buf[..len]).to_string());

                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                    status_line
                );
                socket.write_all(response.as_bytes()).await.unwrap();
            }
            heads
        });

        (format!("http://{}", addr), handle)
    }

    #[tokio::test]
    async fn test_log_provider_classifies_each_tunnel() {
        let temp_dir = TempDir::new().unwrap();
        let db = tunnel("db", 15432);
        let web = tunnel("web", 8080);
        let db_log = FingerprintProtocol::V1.fingerprint(&db).log_path(temp_dir.path());
        fs::write(&db_log, "[2024-01-01 10:00:00] Connection established\n").unwrap();

        let provider = LogStatusProvider::new(temp_dir.path());
        let reports = provider
            .reports(&[db.clone(), web.clone()], FingerprintProtocol::V1)
            .await;

        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].tunnel, db);
        assert_eq!(reports[0].log_id, "31c125d9");
        assert_eq!(reports[0].status, TunnelState::Link(LinkState::Connected));
        assert_eq!(reports[0].last_update.as_deref(), Some("2024-01-01 10:00:00"));
        assert_eq!(reports[1].status, TunnelState::Link(LinkState::Disconnected));
        assert_eq!(reports[1].message, log_classifier::MSG_LOG_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_log_provider_flags_protocol_mismatch() {
        let temp_dir = TempDir::new().unwrap();
        let db = tunnel("db", 15432);
        let v2_log = FingerprintProtocol::V2.fingerprint(&db).log_path(temp_dir.path());
        fs::write(&v2_log, "Starting tunnel db\n").unwrap();

        let provider = LogStatusProvider::new(temp_dir.path());
        let reports = provider.reports(&[db], FingerprintProtocol::V1).await;

        assert_eq!(reports[0].status, TunnelState::Link(LinkState::Disconnected));
        assert!(reports[0].message.contains("fingerprint protocol mismatch"));
    }

    #[tokio::test]
    async fn test_remote_without_base_url_is_unavailable() {
        let provider = RemoteStatusProvider::new(None, None, DEFAULT_REMOTE_TIMEOUT).unwrap();
        let reports = provider
            .reports(&[tunnel("a", 1), tunnel("b", 2)], FingerprintProtocol::V1)
            .await;

        assert!(reports.iter().all(|r| r.status == TunnelState::Unavailable));
        assert!(reports[0].message.contains("not configured"));
    }

    #[tokio::test]
    async fn test_remote_unreachable_is_unavailable() {
        // Bind and drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let provider = RemoteStatusProvider::new(
            Some(format!("http://{}", addr)),
            None,
            Duration::from_millis(500),
        )
        .unwrap();
        let reports = provider.reports(&[tunnel("a", 1)], FingerprintProtocol::V1).await;

        assert_eq!(reports[0].status, TunnelState::Unavailable);
        assert_eq!(reports[0].log_id, FingerprintProtocol::V1.fingerprint(&tunnel("a", 1)).value);
    }

    #[tokio::test]
    async fn test_remote_joins_by_name() {
        let base_url = serve_once(
            "200 OK",
            r#"[{"name":"a","status":"running","pid":42},{"name":"zzz","status":"dead"}]"#,
        )
        .await;

        let provider =
            RemoteStatusProvider::new(Some(format!("{}/", base_url)), None, DEFAULT_REMOTE_TIMEOUT)
                .unwrap();
        let reports = provider
            .reports(&[tunnel("a", 1), tunnel("b", 2)], FingerprintProtocol::V1)
            .await;

        assert_eq!(reports[0].status, TunnelState::Reported("running".to_string()));
        assert_eq!(reports[1].status, TunnelState::Stopped);
        assert_eq!(serde_json::to_value(&reports[1]).unwrap()["status"], "STOPPED");
    }

    #[tokio::test]
    async fn test_remote_error_status_is_unavailable() {
        let base_url = serve_once("503 Service Unavailable", "[]").await;

        let provider =
            RemoteStatusProvider::new(Some(base_url), None, DEFAULT_REMOTE_TIMEOUT).unwrap();
        let reports = provider.reports(&[tunnel("a", 1)], FingerprintProtocol::V1).await;

        assert_eq!(reports[0].status, TunnelState::Unavailable);
        assert!(reports[0].message.contains("503"));
    }

    #[tokio::test]
    async fn test_remote_timeout_is_unavailable() {
        // Accept the connection but never answer
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let provider = RemoteStatusProvider::new(
            Some(format!("http://{}", addr)),
            None,
            Duration::from_millis(300),
        )
        .unwrap();

        let started = std::time::Instant::now();
        let reports = provider
            .reports(&[tunnel("a", 1)], FingerprintProtocol::V1)
            .await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(reports[0].status, TunnelState::Unavailable);
    }

    #[test]
    fn test_tunnel_action_parsing() {
        assert_eq!("restart".parse::<TunnelAction>(), Ok(TunnelAction::Restart));
        assert_eq!(TunnelAction::Stop.to_string(), "stop");
        assert!("reload".parse::<TunnelAction>().is_err());
    }

    #[tokio::test]
    async fn test_control_posts_with_bearer_key() {
        let (base_url, requests) = serve_recording(1, "200 OK").await;
        let provider = RemoteStatusProvider::new(
            Some(format!("{}/", base_url)),
            Some("secret".to_string()),
            DEFAULT_REMOTE_TIMEOUT,
        )
        .unwrap();

        provider.control(TunnelAction::Start, "31c125d9").await.unwrap();

        let heads = requests.await.unwrap();
        assert!(heads[0].starts_with("POST /start/31c125d9 "));
        assert!(heads[0].to_ascii_lowercase().contains("authorization: bearer secret"));
    }

    #[tokio::test]
    async fn test_restart_stops_then_starts() {
        let (base_url, requests) = serve_recording(2, "200 OK").await;
        let provider = RemoteStatusProvider::new(Some(base_url), None, DEFAULT_REMOTE_TIMEOUT)
            .unwrap()
            .with_restart_delay(Duration::from_millis(10));

        provider.control(TunnelAction::Restart, "31c125d9").await.unwrap();

        let heads = requests.await.unwrap();
        assert!(heads[0].starts_with("POST /stop/31c125d9 "));
        assert!(heads[1].starts_with("POST /start/31c125d9 "));
    }

    #[tokio::test]
    async fn test_failed_stop_aborts_restart() {
        let (base_url, requests) = serve_recording(1, "500 Internal Server Error").await;
        let provider = RemoteStatusProvider::new(Some(base_url), None, DEFAULT_REMOTE_TIMEOUT)
            .unwrap()
            .with_restart_delay(Duration::from_millis(10));

        let err = provider
            .control(TunnelAction::Restart, "31c125d9")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RemoteUnavailable(_)));
        assert!(err.to_string().contains("500"));
        assert_eq!(requests.await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_control_without_base_url_fails() {
        let provider = RemoteStatusProvider::new(None, None, DEFAULT_REMOTE_TIMEOUT).unwrap();
        let err = provider.control(TunnelAction::Stop, "31c125d9").await.unwrap_err();
        assert!(matches!(err, Error::RemoteUnavailable(_)));
    }

    #[tokio::test]
    async fn test_aggregator_reports_stored_tunnels() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(ConfigStore::new(
            temp_dir.path().join("config.yaml"),
            temp_dir.path().join("backups"),
        ));
        store
            .save(&TunnelConfig::new(vec![tunnel("db", 15432)]))
            .unwrap();

        let aggregator = StatusAggregator::new(
            Arc::new(LogStatusProvider::new(temp_dir.path().join("logs"))),
            FingerprintProtocol::V1,
        );
        let response = aggregator.report(&store).await.unwrap();

        assert_eq!(response.fingerprint_protocol, "v1");
        assert_eq!(response.tunnels.len(), 1);
        assert_eq!(response.tunnels[0].tunnel.name, "db");
        assert_eq!(response.timestamp.len(), "2024-01-01 10:00:00".len());
    }

    #[tokio::test]
    async fn test_aggregator_surfaces_parse_errors() {
        let temp_dir = TempDir::new().unwrap();
        let config_file = temp_dir.path().join("config.yaml");
        fs::write(&config_file, "tunnels: {{{").unwrap();
        let store = Arc::new(ConfigStore::new(config_file, temp_dir.path().join("backups")));

        let aggregator = StatusAggregator::new(
            Arc::new(LogStatusProvider::new(temp_dir.path())),
            FingerprintProtocol::V1,
        );
        assert!(matches!(aggregator.report(&store).await, Err(Error::Parse { .. })));
    }
}
