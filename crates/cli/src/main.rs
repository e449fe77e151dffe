// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Panel Contributors

// Tunnel Panel - CLI Client
// Command-line interface for the tunnel panel daemon

mod config;

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use comfy_table::{Attribute, Cell, Color, ContentArrangement, Table};
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use tunnel_panel_common::{
    parse_document, BackupEntry, Direction, FingerprintProtocol, LinkState, StatusResponse,
    Tunnel, TunnelAction, TunnelEntry, TunnelReport, TunnelState,
};

use config::CliConfig;

#[derive(Parser)]
#[command(name = "tunnel-panel")]
#[command(about = "Tunnel Panel CLI", long_about = None)]
#[command(version)]
struct Cli {
    /// Daemon URL (overrides cli.toml)
    #[arg(long, global = true)]
    daemon_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured tunnels
    List {
        /// Output as JSON for scripting
        #[arg(short, long)]
        json: bool,
    },

    /// Show tunnel status
    Status {
        /// Tunnel name (optional, shows all if not specified)
        name: Option<String>,

        /// Output as JSON for scripting
        #[arg(short, long)]
        json: bool,
    },

    /// Compute the log id of a tunnel without contacting the daemon
    Fingerprint {
        /// Remote host
        #[arg(short = 'H', long)]
        remote_host: String,

        /// Remote port
        #[arg(short = 'P', long)]
        remote_port: u16,

        /// Local port
        #[arg(short = 'l', long)]
        local_port: u16,

        /// remote_to_local or local_to_remote
        #[arg(short, long, default_value = "remote_to_local")]
        direction: Direction,

        /// Tunnel name (v2 only)
        #[arg(short, long, default_value = "")]
        name: String,

        /// Mark the tunnel interactive (v2 only)
        #[arg(short, long)]
        interactive: bool,

        /// v1 or v2 (default: show both)
        #[arg(long)]
        protocol: Option<FingerprintProtocol>,
    },

    /// Replace the daemon's tunnel list with a YAML document
    Apply {
        /// Path to the YAML document
        file: PathBuf,
    },

    /// List backups of earlier tunnel lists
    Backups,

    /// Start a tunnel (remote status mode)
    Start {
        /// Tunnel name
        name: String,
    },

    /// Stop a tunnel (remote status mode)
    Stop {
        /// Tunnel name
        name: String,
    },

    /// Stop and start a tunnel (remote status mode)
    Restart {
        /// Tunnel name
        name: String,
    },

    /// Show the tail of a tunnel's log
    Logs {
        /// Tunnel name
        name: String,

        /// Number of lines to show
        #[arg(short = 'n', long, default_value = "200")]
        lines: usize,
    },
}

#[derive(Deserialize)]
struct ConfigListing {
    tunnels: Vec<TunnelEntry>,
}

#[derive(Deserialize)]
struct SaveResult {
    backup: Option<String>,
}

#[derive(Deserialize)]
struct BackupListing {
    backups: Vec<BackupEntry>,
}

#[derive(Deserialize)]
struct ControlResult {
    log_id: String,
}

#[derive(Deserialize)]
struct LogTail {
    log: String,
}

#[derive(Deserialize)]
struct ApiError {
    error: String,
}

/// HTTP access to the daemon
struct DaemonClient {
    client: Client,
    base_url: String,
}

impl DaemonClient {
    fn new(daemon_url: Option<String>) -> Result<Self> {
        let mut cli_config = CliConfig::load()?;
        if let Some(url) = daemon_url {
            cli_config.daemon_url = url;
        }

        Ok(Self {
            client: cli_config.create_client()?,
            base_url: cli_config.daemon_base_url()?,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        decode(self.send_get(path).await?).await
    }

    /// Like `get`, but a 404 yields `None`
    async fn get_optional<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let response = self.send_get(path).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        decode(response).await.map(Some)
    }

    async fn send_get(&self, path: &str) -> Result<reqwest::Response> {
        let url = self.url(path);
        debug!("GET {}", url);
        self.client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to connect to daemon at {}", self.base_url))
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: &serde_json::Value) -> Result<T> {
        let url = Url::parse(&self.url(path)).context("Invalid daemon URL")?;
        self.post_url(url, body).await
    }

    async fn post_url<T: DeserializeOwned>(&self, url: Url, body: &serde_json::Value) -> Result<T> {
        debug!("POST {}", url);
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to connect to daemon at {}", self.base_url))?;
        decode(response).await
    }
}

/// Decode a daemon response, turning `{error}` bodies into errors
async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    let body = response
        .text()
        .await
        .context("Failed to read daemon response")?;

    if !status.is_success() {
        let message = serde_json::from_str::<ApiError>(&body)
            .map(|e| e.error)
            .unwrap_or(body);
        anyhow::bail!("Daemon returned {}: {}", status, message);
    }

    serde_json::from_str(&body).context("Failed to parse daemon response")
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::List { json } => {
            list_tunnels(&DaemonClient::new(cli.daemon_url)?, json).await?;
        }
        Commands::Status { name, json } => {
            show_status(&DaemonClient::new(cli.daemon_url)?, name, json).await?;
        }
        Commands::Fingerprint {
            remote_host,
            remote_port,
            local_port,
            direction,
            name,
            interactive,
            protocol,
        } => {
            let tunnel = Tunnel {
                name,
                remote_host,
                remote_port,
                local_port,
                direction,
                interactive: Some(interactive),
            };
            print_fingerprints(&tunnel, protocol);
        }
        Commands::Apply { file } => {
            apply_document(&DaemonClient::new(cli.daemon_url)?, file).await?;
        }
        Commands::Backups => {
            list_backups(&DaemonClient::new(cli.daemon_url)?).await?;
        }
        Commands::Start { name } => {
            control_tunnel(&DaemonClient::new(cli.daemon_url)?, &name, TunnelAction::Start).await?;
        }
        Commands::Stop { name } => {
            control_tunnel(&DaemonClient::new(cli.daemon_url)?, &name, TunnelAction::Stop).await?;
        }
        Commands::Restart { name } => {
            control_tunnel(&DaemonClient::new(cli.daemon_url)?, &name, TunnelAction::Restart)
                .await?;
        }
        Commands::Logs { name, lines } => {
            show_logs(&DaemonClient::new(cli.daemon_url)?, &name, lines).await?;
        }
    }

    Ok(())
}

fn header_cell(title: &str) -> Cell {
    Cell::new(title)
        .add_attribute(Attribute::Bold)
        .fg(Color::Cyan)
}

/// One-line description of where a tunnel forwards
fn route(tunnel: &Tunnel) -> String {
    match tunnel.direction {
        Direction::RemoteToLocal => format!(
            "localhost:{} → {}:{}",
            tunnel.local_port, tunnel.remote_host, tunnel.remote_port
        ),
        Direction::LocalToRemote => format!(
            "{}:{} → localhost:{}",
            tunnel.remote_host, tunnel.remote_port, tunnel.local_port
        ),
    }
}

fn state_color(state: &TunnelState) -> Color {
    match state {
        TunnelState::Link(LinkState::Connected) => Color::Green,
        TunnelState::Link(LinkState::Disconnected) | TunnelState::Stopped => Color::Yellow,
        TunnelState::Link(LinkState::Error) => Color::Red,
        _ => Color::DarkGrey,
    }
}

/// Reports for `name`, or all of them when no name is given
fn select_reports(reports: Vec<TunnelReport>, name: Option<&str>) -> Result<Vec<TunnelReport>> {
    match name {
        None => Ok(reports),
        Some(name) => {
            let selected: Vec<_> = reports
                .into_iter()
                .filter(|report| report.tunnel.name == name)
                .collect();
            if selected.is_empty() {
                anyhow::bail!("Tunnel '{}' not found", name);
            }
            Ok(selected)
        }
    }
}

async fn list_tunnels(daemon: &DaemonClient, json: bool) -> Result<()> {
    let listing: ConfigListing = daemon.get("/api/config").await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&listing.tunnels)?);
        return Ok(());
    }

    if listing.tunnels.is_empty() {
        println!("{}", "No tunnels configured.".yellow());
        println!("Add some with: {}", "tunnel-panel apply <file>".cyan());
        return Ok(());
    }

    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        header_cell("Name"),
        header_cell("Route"),
        header_cell("Direction"),
        header_cell("Log id"),
    ]);

    for entry in &listing.tunnels {
        table.add_row(vec![
            Cell::new(&entry.tunnel.name).fg(Color::Green),
            Cell::new(route(&entry.tunnel)),
            Cell::new(entry.tunnel.direction),
            Cell::new(&entry.hash).fg(Color::DarkGrey),
        ]);
    }

    println!();
    println!("{}", table);
    println!();
    println!("{} tunnel(s) configured", listing.tunnels.len().to_string().cyan());
    println!();

    Ok(())
}

async fn show_status(daemon: &DaemonClient, name: Option<String>, json: bool) -> Result<()> {
    let mut response: StatusResponse = daemon.get("/api/status").await?;
    response.tunnels = select_reports(response.tunnels, name.as_deref())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    if response.tunnels.is_empty() {
        println!("{}", "No tunnels configured.".yellow());
        return Ok(());
    }

    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        header_cell("Name"),
        header_cell("Route"),
        header_cell("Status"),
        header_cell("Last update"),
        header_cell("Message"),
    ]);

    for report in &response.tunnels {
        table.add_row(vec![
            Cell::new(&report.tunnel.name).fg(Color::Green),
            Cell::new(route(&report.tunnel)),
            Cell::new(&report.status)
                .fg(state_color(&report.status))
                .add_attribute(Attribute::Bold),
            Cell::new(report.last_update.as_deref().unwrap_or("-")),
            Cell::new(&report.message).fg(Color::DarkGrey),
        ]);
    }

    let connected = response
        .tunnels
        .iter()
        .filter(|report| report.status.is_connected())
        .count();

    println!();
    println!("{}", table);
    println!();
    println!(
        "{}/{} connected (fingerprint {}, as of {})",
        connected.to_string().green(),
        response.tunnels.len(),
        response.fingerprint_protocol.cyan(),
        response.timestamp.dimmed()
    );
    println!();

    Ok(())
}

fn print_fingerprints(tunnel: &Tunnel, protocol: Option<FingerprintProtocol>) {
    let protocols = match protocol {
        Some(protocol) => vec![protocol],
        None => FingerprintProtocol::ALL.to_vec(),
    };

    println!();
    for protocol in protocols {
        let fingerprint = protocol.fingerprint(tunnel);
        let default_marker = if protocol == FingerprintProtocol::default() {
            " (default)"
        } else {
            ""
        };
        println!(
            "{}{}",
            format!("{}:", protocol).bold(),
            default_marker.dimmed()
        );
        println!("  Input:    {}", protocol.canonical_input(tunnel).dimmed());
        println!("  Log id:   {}", fingerprint.as_str().cyan());
        println!("  Log file: {}", fingerprint.log_file_name());
    }
    println!();
}

async fn apply_document(daemon: &DaemonClient, file: PathBuf) -> Result<()> {
    let contents = fs::read_to_string(&file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let config = parse_document(&contents)
        .with_context(|| format!("Failed to parse {}", file.display()))?;
    config
        .validate()
        .with_context(|| format!("{} is not a valid tunnel list", file.display()))?;

    let result: SaveResult = daemon
        .post("/api/config", &json!({ "tunnels": config.tunnels }))
        .await?;

    println!();
    println!(
        "{}",
        format!("✓ Applied {} tunnel(s)", config.tunnels.len())
            .green()
            .bold()
    );
    match result.backup {
        Some(backup) => println!("  Previous list saved as: {}", backup.dimmed()),
        None => println!("  {}", "No previous list to back up".dimmed()),
    }
    println!();

    Ok(())
}

async fn list_backups(daemon: &DaemonClient) -> Result<()> {
    let listing: BackupListing = daemon.get("/api/config/backups").await?;

    if listing.backups.is_empty() {
        println!("{}", "No backups yet.".yellow());
        return Ok(());
    }

    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![header_cell("Backup"), header_cell("Size")]);

    for backup in &listing.backups {
        table.add_row(vec![
            Cell::new(&backup.file_name),
            Cell::new(format!("{} bytes", backup.size_bytes)).fg(Color::DarkGrey),
        ]);
    }

    println!();
    println!("{}", table);
    println!();
    println!("{} backup(s) found", listing.backups.len().to_string().cyan());
    println!();

    Ok(())
}

/// `{base_url}/api/tunnels/{name}/{action}` with the name percent-encoded
fn tunnel_control_url(base_url: &str, name: &str, action: TunnelAction) -> Result<Url> {
    let mut url = Url::parse(base_url).context("Invalid daemon URL")?;
    url.path_segments_mut()
        .map_err(|_| anyhow::anyhow!("Daemon URL cannot carry a path: {}", base_url))?
        .pop_if_empty()
        .extend(["api", "tunnels", name, action.as_str()]);
    Ok(url)
}

async fn control_tunnel(daemon: &DaemonClient, name: &str, action: TunnelAction) -> Result<()> {
    let url = tunnel_control_url(&daemon.base_url, name, action)?;

    if action == TunnelAction::Restart {
        println!("{}", format!("Restarting '{}'...", name).dimmed());
    }

    let result: ControlResult = daemon.post_url(url, &json!({})).await?;

    println!(
        "{}",
        format!("✓ {} sent for '{}' ({})", action, name, result.log_id)
            .green()
            .bold()
    );
    Ok(())
}

async fn show_logs(daemon: &DaemonClient, name: &str, lines: usize) -> Result<()> {
    // Resolve the name through the daemon so its fingerprint protocol is used
    let listing: ConfigListing = daemon.get("/api/config").await?;
    let entry = listing
        .tunnels
        .iter()
        .find(|entry| entry.tunnel.name == name)
        .ok_or_else(|| anyhow::anyhow!("Tunnel '{}' not found", name))?;

    let path = format!("/api/logs/{}?lines={}", entry.hash, lines);
    let Some(tail) = daemon.get_optional::<LogTail>(&path).await? else {
        println!(
            "{}",
            format!("No log yet for '{}' ({})", name, entry.hash).yellow()
        );
        return Ok(());
    };

    println!("{}", format!("==> {} ({}) <==", name, entry.hash).bold());
    println!("{}", tail.log);

    Ok(())
}
