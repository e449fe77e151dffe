// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Panel Contributors

// Log file fingerprints
//
// The tunnel runner names each log file after a hash of the tunnel's
// identity fields. Both sides must compute the exact same string, so the
// field order, separator, hash and length of every protocol below are
// frozen. Add a new variant instead of changing an existing one.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::Tunnel;

/// Hex characters kept from the V1 digest
pub const V1_FINGERPRINT_LEN: usize = 8;

/// Versioned contract with the process that writes tunnel logs
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FingerprintProtocol {
    /// `remote_host:remote_port:local_port:direction`, MD5, first 8 hex chars
    #[default]
    V1,
    /// `name|remote_host|remote_port|local_port|direction|interactive`, full SHA-256 hex
    V2,
}

impl FingerprintProtocol {
    pub const ALL: [FingerprintProtocol; 2] = [FingerprintProtocol::V1, FingerprintProtocol::V2];

    pub fn tag(&self) -> &'static str {
        match self {
            FingerprintProtocol::V1 => "v1",
            FingerprintProtocol::V2 => "v2",
        }
    }

    /// The exact string that gets hashed
    pub fn canonical_input(&self, tunnel: &Tunnel) -> String {
        match self {
            FingerprintProtocol::V1 => format!(
                "{}:{}:{}:{}",
                tunnel.remote_host, tunnel.remote_port, tunnel.local_port, tunnel.direction
            ),
            FingerprintProtocol::V2 => format!(
                "{}|{}|{}|{}|{}|{}",
                tunnel.name,
                tunnel.remote_host,
                tunnel.remote_port,
                tunnel.local_port,
                tunnel.direction,
                if tunnel.interactive.unwrap_or(false) {
                    "true"
                } else {
                    "false"
                }
            ),
        }
    }

    pub fn fingerprint(&self, tunnel: &Tunnel) -> Fingerprint {
        let input = self.canonical_input(tunnel);
        let value = match self {
            FingerprintProtocol::V1 => {
                let digest = to_hex(&Md5::digest(input.as_bytes()));
                digest[..V1_FINGERPRINT_LEN].to_string()
            }
            FingerprintProtocol::V2 => to_hex(&Sha256::digest(input.as_bytes())),
        };

        Fingerprint {
            protocol: *self,
            value,
        }
    }
}

impl fmt::Display for FingerprintProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for FingerprintProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "v1" => Ok(FingerprintProtocol::V1),
            "v2" => Ok(FingerprintProtocol::V2),
            other => Err(format!("unknown fingerprint protocol '{}'", other)),
        }
    }
}

/// Identifier of a tunnel's log stream, tagged with the protocol that made it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub protocol: FingerprintProtocol,
    pub value: String,
}

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn log_file_name(&self) -> String {
        log_file_name(&self.value)
    }

    pub fn log_path(&self, logs_dir: &Path) -> PathBuf {
        logs_dir.join(self.log_file_name())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

/// Fingerprint under the default protocol
pub fn fingerprint(tunnel: &Tunnel) -> String {
    FingerprintProtocol::default().fingerprint(tunnel).value
}

/// Log file name for a fingerprint value
pub fn log_file_name(log_id: &str) -> String {
    format!("tunnel_{}.log", log_id)
}

/// Check that a string could be a fingerprint (lowercase hex, bounded length)
pub fn is_valid_log_id(log_id: &str) -> bool {
    !log_id.is_empty()
        && log_id.len() <= 64
        && log_id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Direction;

    fn postgres() -> Tunnel {
        Tunnel {
            name: "postgres".to_string(),
            remote_host: "db.example.com".to_string(),
            remote_port: 5432,
            local_port: 15432,
            direction: Direction::RemoteToLocal,
            interactive: None,
        }
    }

    #[test]
    fn test_v1_known_vector() {
        let tunnel = postgres();
        assert_eq!(
            FingerprintProtocol::V1.canonical_input(&tunnel),
            "db.example.com:5432:15432:remote_to_local"
        );
        assert_eq!(fingerprint(&tunnel), "31c125d9");
    }

    #[test]
    fn test_v1_depends_on_direction_not_name() {
        let mut tunnel = postgres();
        tunnel.direction = Direction::LocalToRemote;
        assert_eq!(fingerprint(&tunnel), "3067b0a5");

        let mut renamed = postgres();
        renamed.name = "something-else".to_string();
        renamed.interactive = Some(true);
        assert_eq!(fingerprint(&renamed), fingerprint(&postgres()));
    }

    #[test]
    fn test_v2_known_vectors() {
        let mut tunnel = postgres();
        let fp = FingerprintProtocol::V2.fingerprint(&tunnel);
        assert_eq!(
            fp.value,
            "152e63573c59e4e33561fd90e7ce702a71152ed51a074b337c73a7ecb25c2c6c"
        );

        // Unset and explicit false render the same literal
        tunnel.interactive = Some(false);
        assert_eq!(FingerprintProtocol::V2.fingerprint(&tunnel), fp);

        tunnel.interactive = Some(true);
        assert_eq!(
            FingerprintProtocol::V2.fingerprint(&tunnel).value,
            "bf1b1f0fab73ac5dad6ab7b61b30275a31811893dbb21012f6f16f3742a561c0"
        );
    }

    #[test]
    fn test_fingerprint_is_pure() {
        let tunnel = postgres();
        for protocol in FingerprintProtocol::ALL {
            let first = protocol.fingerprint(&tunnel);
            let second = protocol.fingerprint(&tunnel.clone());
            assert_eq!(first, second);
            assert_eq!(first.protocol, protocol);
        }
    }

    #[test]
    fn test_log_path() {
        let fp = FingerprintProtocol::V1.fingerprint(&postgres());
        assert_eq!(fp.log_file_name(), "tunnel_31c125d9.log");
        assert_eq!(
            fp.log_path(Path::new("/var/log/tunnels")),
            PathBuf::from("/var/log/tunnels/tunnel_31c125d9.log")
        );
    }

    #[test]
    fn test_protocol_parsing() {
        assert_eq!("v1".parse::<FingerprintProtocol>().unwrap(), FingerprintProtocol::V1);
        assert_eq!("V2".parse::<FingerprintProtocol>().unwrap(), FingerprintProtocol::V2);
        assert!("v3".parse::<FingerprintProtocol>().is_err());
    }

    #[test]
    fn test_is_valid_log_id() {
        assert!(is_valid_log_id("31c125d9"));
        assert!(!is_valid_log_id(""));
        assert!(!is_valid_log_id("../etc/passwd"));
        assert!(!is_valid_log_id("31C125D9"));
        assert!(!is_valid_log_id(&"a".repeat(65)));
    }
}
