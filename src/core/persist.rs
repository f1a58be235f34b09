// src/core/persist.rs

//! Persisted daemon state: default-printer bookkeeping and per-queue option
//! defaults, kept as small files in the configured cache directory.

use crate::core::errors::BridgeError;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

const LOCAL_DEFAULT_FILE: &str = "local-default-printer";
const REMOTE_DEFAULT_FILE: &str = "remote-default-printer";

/// Handle on the cache directory.
#[derive(Debug, Clone)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates the cache directory if it does not exist yet.
    pub async fn ensure(&self) -> Result<(), BridgeError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| BridgeError::StateFile(format!("cannot create {:?}: {e}", self.root)))
    }

    fn options_path(&self, queue: &str) -> PathBuf {
        // Queue names are spooler-legal and contain no path separators.
        self.root.join(format!("options-{queue}"))
    }

    async fn read_name_file(&self, file: &str) -> Option<String> {
        let path = self.root.join(file);
        match fs::read_to_string(&path).await {
            Ok(contents) => {
                let name = contents.trim().to_string();
                (!name.is_empty()).then_some(name)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!("Failed to read {path:?}: {e}");
                None
            }
        }
    }

    async fn write_name_file(&self, file: &str, name: &str) -> Result<(), BridgeError> {
        let path = self.root.join(file);
        fs::write(&path, format!("{name}\n"))
            .await
            .map_err(|e| BridgeError::StateFile(format!("cannot write {path:?}: {e}")))
    }

    async fn remove_file(&self, file: &str) {
        let path = self.root.join(file);
        if let Err(e) = fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove {path:?}: {e}");
            }
        }
    }

    /// The local queue that was default before one of ours took over.
    pub async fn read_local_default(&self) -> Option<String> {
        self.read_name_file(LOCAL_DEFAULT_FILE).await
    }

    pub async fn write_local_default(&self, name: &str) -> Result<(), BridgeError> {
        self.write_name_file(LOCAL_DEFAULT_FILE, name).await
    }

    pub async fn clear_local_default(&self) {
        self.remove_file(LOCAL_DEFAULT_FILE).await;
    }

    /// The daemon-controlled queue that was default when it disappeared.
    pub async fn read_remote_default(&self) -> Option<String> {
        self.read_name_file(REMOTE_DEFAULT_FILE).await
    }

    pub async fn write_remote_default(&self, name: &str) -> Result<(), BridgeError> {
        self.write_name_file(REMOTE_DEFAULT_FILE, name).await
    }

    pub async fn clear_remote_default(&self) {
        self.remove_file(REMOTE_DEFAULT_FILE).await;
    }

    /// Reads the recorded option defaults for a queue. A missing file is an
    /// empty set.
    pub async fn read_options(&self, queue: &str) -> BTreeMap<String, String> {
        let path = self.options_path(queue);
        let contents = match fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
            Err(e) => {
                warn!("Failed to read {path:?}: {e}");
                return BTreeMap::new();
            }
        };

        let mut options = BTreeMap::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.split_once('=') {
                Some((key, value)) if !key.is_empty() => {
                    options.insert(key.to_string(), value.to_string());
                }
                _ => debug!("Skipping malformed option line in {path:?}: '{line}'"),
            }
        }
        options
    }

    /// Records the option defaults for a queue; called before the queue is
    /// removed or released so nothing the daemon wrote is lost.
    pub async fn write_options(
        &self,
        queue: &str,
        options: &BTreeMap<String, String>,
    ) -> Result<(), BridgeError> {
        let path = self.options_path(queue);
        if options.is_empty() {
            self.remove_file(&format!("options-{queue}")).await;
            return Ok(());
        }
        let mut contents = String::new();
        for (key, value) in options {
            contents.push_str(key);
            contents.push('=');
            contents.push_str(value);
            contents.push('\n');
        }
        fs::write(&path, contents)
            .await
            .map_err(|e| BridgeError::StateFile(format!("cannot write {path:?}: {e}")))
    }

    pub async fn remove_options(&self, queue: &str) {
        self.remove_file(&format!("options-{queue}")).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn options_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::new(dir.path());

        let mut options = BTreeMap::new();
        options.insert("media".to_string(), "iso_a4_210x297mm".to_string());
        options.insert("sides".to_string(), "two-sided-long-edge".to_string());

        state.write_options("Office", &options).await.unwrap();
        let read = state.read_options("Office").await;
        assert_eq!(read, options);

        state.remove_options("Office").await;
        assert!(state.read_options("Office").await.is_empty());
    }

    #[tokio::test]
    async fn default_name_files() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::new(dir.path());

        assert_eq!(state.read_local_default().await, None);
        state.write_local_default("deskjet").await.unwrap();
        assert_eq!(state.read_local_default().await, Some("deskjet".into()));
        state.clear_local_default().await;
        assert_eq!(state.read_local_default().await, None);
    }
}
