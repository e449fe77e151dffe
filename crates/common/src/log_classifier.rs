// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Panel Contributors

// Tunnel Panel - Log Classifier
// Infers a tunnel's connectivity from the tail of the log written by the tunnel runner.
// The log format is not ours, so this is a heuristic: anything ambiguous is Unknown.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use tracing::debug;

use crate::types::{Classification, LinkState};

/// Number of most recent lines that may decide a verdict
pub const TAIL_WINDOW: usize = 20;

const CHUNK_SIZE: u64 = 8 * 1024;

pub const MSG_LOG_NOT_FOUND: &str = "log not found - tunnel may not be running";
pub const MSG_LOG_EMPTY: &str = "log is empty";
pub const MSG_TUNNEL_RUNNING: &str = "tunnel running";
pub const MSG_CONNECTED: &str = "connected";
pub const MSG_DISCONNECTED: &str = "disconnected";
pub const MSG_NO_DATA: &str = "no log data available";

const RUNNING_MARKERS: &[&str] = &["Starting tunnel"];
const CONNECTED_MARKERS: &[&str] = &["Connection established", "Authenticated to"];
const DISCONNECTED_MARKERS: &[&str] = &["Connection closed", "Connection reset"];
const ERROR_MARKERS: &[&str] = &[
    "Permission denied",
    "Connection refused",
    "Could not resolve hostname",
];

/// Classify the log at `path`
pub fn classify(path: &Path) -> Classification {
    let lines = match read_tail_lines(path, TAIL_WINDOW) {
        Ok(lines) => lines,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("No log at {}", path.display());
            return Classification::new(LinkState::Disconnected, None, MSG_LOG_NOT_FOUND);
        }
        Err(e) => {
            debug!("Failed to read log {}: {}", path.display(), e);
            return Classification::new(
                LinkState::Error,
                None,
                format!("failed to read log: {}", e),
            );
        }
    };

    if lines.is_empty() {
        return Classification::new(LinkState::Disconnected, None, MSG_LOG_EMPTY);
    }

    classify_lines(&lines)
}

/// Classify lines given in file order (oldest first)
pub fn classify_lines<S: AsRef<str>>(lines: &[S]) -> Classification {
    let start = lines.len().saturating_sub(TAIL_WINDOW);
    let mut last_update = None;

    for line in lines[start..].iter().rev() {
        let line = line.as_ref();

        if let Some(stamp) = bracketed(line) {
            last_update = Some(stamp.to_string());
        }

        if contains_any(line, RUNNING_MARKERS) {
            return Classification::new(LinkState::Connected, last_update, MSG_TUNNEL_RUNNING);
        }
        if contains_any(line, CONNECTED_MARKERS) {
            return Classification::new(LinkState::Connected, last_update, MSG_CONNECTED);
        }
        if contains_any(line, DISCONNECTED_MARKERS) {
            return Classification::new(LinkState::Disconnected, last_update, MSG_DISCONNECTED);
        }
        if contains_any(line, ERROR_MARKERS) {
            return Classification::new(LinkState::Error, last_update, line);
        }
    }

    // Something is still writing timestamped lines
    if last_update.is_some() {
        return Classification::new(LinkState::Connected, last_update, MSG_TUNNEL_RUNNING);
    }

    Classification::new(LinkState::Unknown, None, MSG_NO_DATA)
}

/// Read the last `max_lines` lines of a file, in file order
///
/// The file is read backward in fixed-size chunks, so the cost depends on
/// the size of the tail rather than the size of the log.
pub fn read_tail_lines(path: &Path, max_lines: usize) -> io::Result<Vec<String>> {
    let mut file = File::open(path)?;
    let metadata = file.metadata()?;
    if !metadata.is_file() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "not a regular file",
        ));
    }
    let len = metadata.len();

    let mut pos = len;
    let mut buf: Vec<u8> = Vec::new();

    while pos > 0 {
        let step = CHUNK_SIZE.min(pos);
        pos -= step;
        file.seek(SeekFrom::Start(pos))?;

        let mut chunk = vec![0u8; step as usize];
        file.read_exact(&mut chunk)?;
        chunk.extend_from_slice(&buf);
        buf = chunk;

        // max_lines complete lines need max_lines separators before the trailing one
        let body = buf.strip_suffix(b"\n").unwrap_or(&buf);
        if body.iter().filter(|&&b| b == b'\n').count() >= max_lines {
            break;
        }
    }

    let text = String::from_utf8_lossy(&buf);
    let mut lines: Vec<String> = text.lines().map(str::to_string).collect();
    let keep_from = lines.len().saturating_sub(max_lines);
    Ok(lines.split_off(keep_from))
}

/// Text between the first '[' and the first ']', when they appear in that order
fn bracketed(line: &str) -> Option<&str> {
    let start = line.find('[')?;
    let end = line.find(']')?;
    if end > start {
        Some(&line[start + 1..end])
    } else {
        None
    }
}

fn contains_any(line: &str, markers: &[&str]) -> bool {
    markers.iter().any(|m| line.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_log(dir: &TempDir, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join("tunnel_31c125d9.log");
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_missing_log_is_disconnected() {
        let temp_dir = TempDir::new().unwrap();
        let result = classify(&temp_dir.path().join("tunnel_nothere.log"));
        assert_eq!(result.state, LinkState::Disconnected);
        assert_eq!(result.last_update, None);
        assert!(result.message.starts_with("log not found"));
    }

    #[test]
    fn test_empty_log() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_log(&temp_dir, "");
        assert_eq!(
            classify(&path),
            Classification::new(LinkState::Disconnected, None, "log is empty")
        );
    }

    #[test]
    fn test_unreadable_path_is_error() {
        let temp_dir = TempDir::new().unwrap();
        let result = classify(temp_dir.path());
        assert_eq!(result.state, LinkState::Error);
        assert!(result.message.starts_with("failed to read log:"));
    }

    #[test]
    fn test_connection_established_with_timestamp() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_log(
            &temp_dir,
            "[2024-01-01 09:59:58] Starting ssh\n[2024-01-01 10:00:00] Connection established\n",
        );
        assert_eq!(
            classify(&path),
            Classification::new(
                LinkState::Connected,
                Some("2024-01-01 10:00:00".to_string()),
                "connected"
            )
        );
    }

    #[test]
    fn test_error_message_is_line_verbatim() {
        let lines = [
            "[2024-01-01 10:00:00] Connection established",
            "Permission denied for user x",
        ];
        let result = classify_lines(&lines);
        assert_eq!(result.state, LinkState::Error);
        assert_eq!(result.message, "Permission denied for user x");
        // The scan stopped on the newest line, which carries no timestamp
        assert_eq!(result.last_update, None);
    }

    #[test]
    fn test_newest_decisive_line_wins() {
        let lines = [
            "[t1] Connection refused",
            "[t2] Starting tunnel db",
            "[t3] Connection closed by remote host",
        ];
        let result = classify_lines(&lines);
        assert_eq!(result.state, LinkState::Disconnected);
        assert_eq!(result.message, "disconnected");
        assert_eq!(result.last_update.as_deref(), Some("t3"));
    }

    #[test]
    fn test_starting_tunnel_means_running() {
        let result = classify_lines(&["[10:00] Starting tunnel postgres"]);
        assert_eq!(result.state, LinkState::Connected);
        assert_eq!(result.message, "tunnel running");
    }

    #[test]
    fn test_timestamp_without_verdict_assumes_running() {
        let lines = ["[2024-01-01 09:00:00] debug1: keepalive", "noise"];
        let result = classify_lines(&lines);
        assert_eq!(result.state, LinkState::Connected);
        assert_eq!(result.message, "tunnel running");
        assert_eq!(result.last_update.as_deref(), Some("2024-01-01 09:00:00"));
    }

    #[test]
    fn test_oldest_timestamp_in_scan_is_kept() {
        let lines = ["[older] noise", "[newer] noise"];
        let result = classify_lines(&lines);
        assert_eq!(result.last_update.as_deref(), Some("older"));
    }

    #[test]
    fn test_no_signal_is_unknown() {
        let result = classify_lines(&["hello", "world ] ["]);
        assert_eq!(
            result,
            Classification::new(LinkState::Unknown, None, "no log data available")
        );
    }

    #[test]
    fn test_lines_outside_window_are_ignored() {
        let mut lines = vec!["Connection established".to_string()];
        lines.extend((0..TAIL_WINDOW).map(|i| format!("line {}", i)));
        assert_eq!(classify_lines(&lines).state, LinkState::Unknown);

        // One line fewer brings the decisive line into the window
        lines.remove(1);
        assert_eq!(classify_lines(&lines).state, LinkState::Connected);
    }

    #[test]
    fn test_window_applies_to_files() {
        let temp_dir = TempDir::new().unwrap();
        let mut contents = String::from("Could not resolve hostname nowhere\n");
        for i in 0..TAIL_WINDOW {
            contents.push_str(&format!("plain line {}\n", i));
        }
        let path = write_log(&temp_dir, &contents);
        assert_eq!(classify(&path).state, LinkState::Unknown);
    }

    #[test]
    fn test_read_tail_lines_large_file() {
        let temp_dir = TempDir::new().unwrap();
        let mut contents = String::new();
        for i in 0..5000 {
            contents.push_str(&format!("[{}] some fairly long log line to fill the chunk\r\n", i));
        }
        contents.push_str("unterminated last line");
        let path = write_log(&temp_dir, &contents);

        let lines = read_tail_lines(&path, 3).unwrap();
        assert_eq!(
            lines,
            vec![
                "[4998] some fairly long log line to fill the chunk",
                "[4999] some fairly long log line to fill the chunk",
                "unterminated last line",
            ]
        );
    }

    #[test]
    fn test_read_tail_lines_short_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_log(&temp_dir, "one\ntwo\n");
        assert_eq!(read_tail_lines(&path, 20).unwrap(), vec!["one", "two"]);
    }
}
