// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Panel Contributors

// Tunnel Panel - Common Library
// Tunnel model, log fingerprints, log classification, config storage and status aggregation

pub mod config_store;
pub mod error;
pub mod fingerprint;
pub mod log_classifier;
pub mod network;
pub mod status;
pub mod types;

pub use config_store::{parse_document, render_document, BackupEntry, ConfigStore, SaveOutcome};
pub use error::{Error, Result};
pub use fingerprint::{fingerprint, is_valid_log_id, log_file_name, Fingerprint, FingerprintProtocol};
pub use log_classifier::{classify, read_tail_lines, TAIL_WINDOW};
pub use network::{is_loopback_address, is_loopback_bind_address};
pub use status::{
    LogStatusProvider, RemoteStatusProvider, RemoteTunnelStatus, StatusAggregator, StatusProvider,
    TunnelAction, DEFAULT_REMOTE_TIMEOUT, RESTART_DELAY,
};
pub use types::{
    Classification, Direction, LinkState, StatusResponse, Tunnel, TunnelConfig, TunnelEntry,
    TunnelReport, TunnelState,
};
