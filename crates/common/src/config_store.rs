// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Panel Contributors

// Tunnel Panel - Config Store
// Loads and saves the tunnel list document. Every save moves the previous
// document into the backup directory and keeps the file's owner and mode.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{chown, MetadataExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::types::TunnelConfig;

/// Mode used when there is no previous document to copy it from
pub const DEFAULT_FILE_MODE: u32 = 0o600;

const BACKUP_TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Result of a successful save
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveOutcome {
    /// Where the previous document was moved, if there was one
    pub backup: Option<PathBuf>,
}

/// A timestamped snapshot of an earlier document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupEntry {
    pub file_name: String,
    #[serde(skip)]
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Owner and permission bits carried from one document generation to the next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileAttributes {
    owner: Option<(u32, u32)>,
    mode: u32,
}

impl FileAttributes {
    /// Read the attributes of `path`, or `None` if it does not exist
    fn capture(path: &Path) -> Result<Option<Self>> {
        match fs::metadata(path) {
            Ok(metadata) => Ok(Some(Self {
                owner: Some((metadata.uid(), metadata.gid())),
                mode: metadata.permissions().mode() & 0o7777,
            })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io("read ownership and permissions", path, e)),
        }
    }

    fn for_directory(self) -> Self {
        Self {
            owner: self.owner,
            mode: self.mode | 0o100,
        }
    }

    fn apply(&self, path: &Path) -> Result<()> {
        if let Some((uid, gid)) = self.owner {
            chown(path, Some(uid), Some(gid)).map_err(|e| Error::io("chown", path, e))?;
        }
        fs::set_permissions(path, fs::Permissions::from_mode(self.mode))
            .map_err(|e| Error::io("chmod", path, e))?;
        debug!("Applied mode {:o} to {}", self.mode, path.display());
        Ok(())
    }
}

/// Exclusive advisory lock held for the duration of a save
struct SaveLock {
    file: File,
}

impl SaveLock {
    fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|e| Error::io("open save lock", path, e))?;

        loop {
            // SAFETY: the descriptor belongs to `file`, which outlives the call
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if rc == 0 {
                break;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(Error::io("acquire save lock", path, err));
            }
        }

        Ok(Self { file })
    }
}

impl Drop for SaveLock {
    fn drop(&mut self) {
        // SAFETY: the descriptor is still open; closing `file` afterwards also drops the lock
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

/// Persistent storage of the tunnel list
#[derive(Debug)]
pub struct ConfigStore {
    config_file: PathBuf,
    backup_dir: PathBuf,
    save_guard: Mutex<()>,
}

impl ConfigStore {
    pub fn new(config_file: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_file: config_file.into(),
            backup_dir: backup_dir.into(),
            save_guard: Mutex::new(()),
        }
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Load the tunnel list; a missing document is an empty list
    pub fn load(&self) -> Result<TunnelConfig> {
        let contents = match fs::read_to_string(&self.config_file) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(
                    "Config document does not exist: {}",
                    self.config_file.display()
                );
                return Ok(TunnelConfig::default());
            }
            Err(e) => return Err(Error::io("read config", &self.config_file, e)),
        };

        parse_document(&contents).map_err(|source| Error::Parse {
            path: self.config_file.clone(),
            source,
        })
    }

    /// Replace the stored document with `config`
    ///
    /// The previous document, if any, is renamed into the backup directory.
    /// Saves are serialized within this process and, through an advisory
    /// lock file, across processes.
    pub fn save(&self, config: &TunnelConfig) -> Result<SaveOutcome> {
        let _guard = self
            .save_guard
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let _lock = SaveLock::acquire(&self.lock_path())?;

        let document = render_document(config)?;

        let existing = FileAttributes::capture(&self.config_file)?;
        let attributes = existing.unwrap_or(FileAttributes {
            owner: None,
            mode: DEFAULT_FILE_MODE,
        });

        self.ensure_backup_dir(attributes)?;

        let temp_path = self.temp_path();
        if let Err(e) = write_new_generation(&temp_path, document.as_bytes(), attributes) {
            let _ = fs::remove_file(&temp_path);
            return Err(e);
        }

        let backup = if existing.is_some() {
            let timestamp = chrono::Local::now().format(BACKUP_TIMESTAMP_FORMAT).to_string();
            let backup_path = self.backup_path_for(&timestamp);
            if let Err(e) = fs::rename(&self.config_file, &backup_path) {
                let _ = fs::remove_file(&temp_path);
                return Err(Error::io("back up config", &self.config_file, e));
            }
            debug!("Moved previous config to {}", backup_path.display());
            Some(backup_path)
        } else {
            None
        };

        // No rollback of the backup rename if this fails
        install_new_generation(&temp_path, &self.config_file)?;

        info!(
            "Saved {} tunnel(s) to {}",
            config.tunnels.len(),
            self.config_file.display()
        );

        Ok(SaveOutcome { backup })
    }

    /// `load` on the blocking pool
    pub async fn spawn_load(self: &Arc<Self>) -> Result<TunnelConfig> {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || store.load()).await?
    }

    /// `list_backups` on the blocking pool
    pub async fn spawn_list_backups(self: &Arc<Self>) -> Result<Vec<BackupEntry>> {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || store.list_backups()).await?
    }

    /// Backups of this document, oldest first
    pub fn list_backups(&self) -> Result<Vec<BackupEntry>> {
        let entries = match fs::read_dir(&self.backup_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io("list backups", &self.backup_dir, e)),
        };

        let (stem, extension) = self.name_parts();
        let prefix = format!("{}_", stem);
        let suffix = extension.map(|ext| format!(".{}", ext));

        let mut backups = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::io("list backups", &self.backup_dir, e))?;
            let file_name = entry.file_name().to_string_lossy().into_owned();

            if !file_name.starts_with(&prefix) {
                continue;
            }
            if let Some(suffix) = &suffix {
                if !file_name.ends_with(suffix.as_str()) {
                    continue;
                }
            }

            let metadata = entry
                .metadata()
                .map_err(|e| Error::io("list backups", entry.path(), e))?;
            if !metadata.is_file() {
                continue;
            }

            backups.push(BackupEntry {
                file_name,
                path: entry.path(),
                size_bytes: metadata.len(),
            });
        }

        backups.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        Ok(backups)
    }

    fn ensure_backup_dir(&self, attributes: FileAttributes) -> Result<()> {
        if self.backup_dir.is_dir() {
            return Ok(());
        }

        fs::create_dir_all(&self.backup_dir)
            .map_err(|e| Error::io("create backup directory", &self.backup_dir, e))?;
        attributes.for_directory().apply(&self.backup_dir)?;
        info!("Created backup directory: {}", self.backup_dir.display());
        Ok(())
    }

    /// First free backup name for `timestamp`
    fn backup_path_for(&self, timestamp: &str) -> PathBuf {
        let (stem, extension) = self.name_parts();
        let name = |suffix: String| match &extension {
            Some(ext) => format!("{}_{}{}.{}", stem, timestamp, suffix, ext),
            None => format!("{}_{}{}", stem, timestamp, suffix),
        };

        let mut candidate = self.backup_dir.join(name(String::new()));
        let mut counter = 1;
        while candidate.exists() {
            candidate = self.backup_dir.join(name(format!("_{}", counter)));
            counter += 1;
        }
        candidate
    }

    fn name_parts(&self) -> (String, Option<String>) {
        let stem = self
            .config_file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "config".to_string());
        let extension = self
            .config_file
            .extension()
            .map(|s| s.to_string_lossy().into_owned());
        (stem, extension)
    }

    fn file_name(&self) -> String {
        self.config_file
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "config".to_string())
    }

    fn temp_path(&self) -> PathBuf {
        self.config_file
            .with_file_name(format!(".{}.tmp", self.file_name()))
    }

    fn lock_path(&self) -> PathBuf {
        self.config_file
            .with_file_name(format!("{}.lock", self.file_name()))
    }
}

fn write_new_generation(path: &Path, contents: &[u8], attributes: FileAttributes) -> Result<()> {
    let mut file = File::create(path).map_err(|e| Error::io("write config", path, e))?;
    file.write_all(contents)
        .map_err(|e| Error::io("write config", path, e))?;
    file.sync_all()
        .map_err(|e| Error::io("write config", path, e))?;
    attributes.apply(path)
}

/// Rename the written temp file over the primary document, removing it on failure
fn install_new_generation(temp_path: &Path, target: &Path) -> Result<()> {
    if let Err(e) = fs::rename(temp_path, target) {
        let _ = fs::remove_file(temp_path);
        return Err(Error::io("write config", target, e));
    }
    Ok(())
}

/// Parse a tunnel list document; blank documents are an empty list
pub fn parse_document(contents: &str) -> std::result::Result<TunnelConfig, serde_yaml::Error> {
    if contents.trim().is_empty() {
        return Ok(TunnelConfig::default());
    }

    let value: serde_yaml::Value = serde_yaml::from_str(contents)?;
    if value.is_null() {
        return Ok(TunnelConfig::default());
    }
    serde_yaml::from_value(value)
}

/// Render a tunnel list as a document
pub fn render_document(config: &TunnelConfig) -> Result<String> {
    Ok(serde_yaml::to_string(config)?)
}
