// Common types for Tunnel Panel

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result};

/// Forwarding direction of a tunnel
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Remote port is exposed locally (ssh -L)
    #[default]
    RemoteToLocal,
    /// Local port is exposed on the remote side (ssh -R)
    LocalToRemote,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::RemoteToLocal => "remote_to_local",
            Direction::LocalToRemote => "local_to_remote",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "remote_to_local" => Ok(Direction::RemoteToLocal),
            "local_to_remote" => Ok(Direction::LocalToRemote),
            other => Err(format!(
                "unknown direction '{}' (expected remote_to_local or local_to_remote)",
                other
            )),
        }
    }
}

/// A single configured forwarding rule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tunnel {
    /// Operator-chosen display name, unique within a config
    pub name: String,
    pub remote_host: String,
    #[serde(deserialize_with = "deserialize_port")]
    pub remote_port: u16,
    #[serde(deserialize_with = "deserialize_port")]
    pub local_port: u16,
    /// Missing, null or empty values load as `remote_to_local`
    #[serde(default, deserialize_with = "deserialize_direction")]
    pub direction: Direction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interactive: Option<bool>,
}

/// The persisted tunnel list
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelConfig {
    #[serde(default, deserialize_with = "deserialize_tunnel_list")]
    pub tunnels: Vec<Tunnel>,
}

impl TunnelConfig {
    pub fn new(tunnels: Vec<Tunnel>) -> Self {
        Self { tunnels }
    }

    /// Find a tunnel by its display name
    pub fn find(&self, name: &str) -> Option<&Tunnel> {
        self.tunnels.iter().find(|t| t.name == name)
    }

    /// Validate the tunnel list before it is persisted
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for (index, tunnel) in self.tunnels.iter().enumerate() {
            if tunnel.name.trim().is_empty() {
                return Err(Error::Validation(format!(
                    "tunnel #{} has an empty name",
                    index + 1
                )));
            }
            if !seen.insert(tunnel.name.as_str()) {
                return Err(Error::Validation(format!(
                    "duplicate tunnel name '{}'",
                    tunnel.name
                )));
            }
            if tunnel.remote_host.trim().is_empty() {
                return Err(Error::Validation(format!(
                    "tunnel '{}' has an empty remote host",
                    tunnel.name
                )));
            }
            if tunnel.remote_port == 0 || tunnel.local_port == 0 {
                return Err(Error::Validation(format!(
                    "tunnel '{}': ports must be greater than 0",
                    tunnel.name
                )));
            }
        }
        Ok(())
    }
}

/// Verdict inferred from a tunnel's log tail
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Connected,
    Disconnected,
    Error,
    /// Log exists but nothing in it was conclusive
    Unknown,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Connected => "connected",
            LinkState::Disconnected => "disconnected",
            LinkState::Error => "error",
            LinkState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of the log classifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub state: LinkState,
    pub last_update: Option<String>,
    pub message: String,
}

impl Classification {
    pub fn new(state: LinkState, last_update: Option<String>, message: impl Into<String>) -> Self {
        Self {
            state,
            last_update,
            message: message.into(),
        }
    }
}

/// Status reported for a tunnel, serialized as a plain string
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TunnelState {
    /// Inferred from the local log
    Link(LinkState),
    /// Remote status endpoint does not list the tunnel
    Stopped,
    /// Remote status could not be fetched
    Unavailable,
    /// Passed through verbatim from the remote status endpoint
    Reported(String),
}

pub const STOPPED_MARKER: &str = "STOPPED";
pub const UNAVAILABLE_MARKER: &str = "N/A";

impl TunnelState {
    pub fn as_str(&self) -> &str {
        match self {
            TunnelState::Link(state) => state.as_str(),
            TunnelState::Stopped => STOPPED_MARKER,
            TunnelState::Unavailable => UNAVAILABLE_MARKER,
            TunnelState::Reported(value) => value,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, TunnelState::Link(LinkState::Connected))
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for TunnelState {
    fn from(value: String) -> Self {
        match value.as_str() {
            "connected" => TunnelState::Link(LinkState::Connected),
            "disconnected" => TunnelState::Link(LinkState::Disconnected),
            "error" => TunnelState::Link(LinkState::Error),
            "unknown" => TunnelState::Link(LinkState::Unknown),
            STOPPED_MARKER => TunnelState::Stopped,
            UNAVAILABLE_MARKER => TunnelState::Unavailable,
            _ => TunnelState::Reported(value),
        }
    }
}

impl From<TunnelState> for String {
    fn from(state: TunnelState) -> Self {
        match state {
            TunnelState::Reported(value) => value,
            other => other.as_str().to_string(),
        }
    }
}

/// A tunnel's configuration joined with its current status
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelReport {
    #[serde(flatten)]
    pub tunnel: Tunnel,
    /// Fingerprint naming the tunnel's log file
    pub log_id: String,
    pub status: TunnelState,
    pub last_update: Option<String>,
    pub message: String,
}

/// Response of a status request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub tunnels: Vec<TunnelReport>,
    /// Local time the report was produced
    pub timestamp: String,
    /// Fingerprint protocol tag used to name log files
    pub fingerprint_protocol: String,
}

/// A tunnel as returned by the config API, with its fingerprint attached
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelEntry {
    #[serde(flatten)]
    pub tunnel: Tunnel,
    pub hash: String,
}

fn deserialize_port<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    // The web editor submits ports as strings
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PortRepr {
        Number(u16),
        Text(String),
    }

    match PortRepr::deserialize(deserializer)? {
        PortRepr::Number(port) => Ok(port),
        PortRepr::Text(text) => text
            .trim()
            .parse::<u16>()
            .map_err(|_| de::Error::custom(format!("invalid port '{}'", text))),
    }
}

fn deserialize_tunnel_list<'de, D>(deserializer: D) -> std::result::Result<Vec<Tunnel>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<Tunnel>>::deserialize(deserializer)?.unwrap_or_default())
}

fn deserialize_direction<'de, D>(deserializer: D) -> std::result::Result<Direction, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(Direction::default()),
        Some(value) => value.parse().map_err(de::Error::custom),
    }
}
