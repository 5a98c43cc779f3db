use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use stride_core::SyncConfig;

/// User-editable settings persisted as `config.json` in the data directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Base URL of the document server, e.g. `http://127.0.0.1:8080`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
    /// Bearer key sent to the document server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// The signed-in principal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub sync: SyncConfig,
}

pub struct Config {
    pub db_path: PathBuf,
    pub data_dir: PathBuf,
    pub settings: Settings,
}

impl Config {
    pub fn load() -> Result<Self> {
        let proj_dirs =
            ProjectDirs::from("", "", "stride").context("Could not determine home directory")?;
        Self::load_from(proj_dirs.data_dir())
    }

    pub fn load_from(data_dir: &Path) -> Result<Self> {
        let data_dir = data_dir.to_path_buf();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

        let db_path = data_dir.join("stride.db");
        let settings_path = data_dir.join("config.json");
        let settings = if settings_path.exists() {
            let text = std::fs::read_to_string(&settings_path)
                .with_context(|| format!("Failed to read {}", settings_path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("Invalid config file: {}", settings_path.display()))?
        } else {
            Settings::default()
        };

        Ok(Config {
            db_path,
            data_dir,
            settings,
        })
    }

    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join("config.json")
    }

    /// Database served by `stride serve`, kept apart from the local store.
    pub fn server_db_path(&self) -> PathBuf {
        self.data_dir.join("remote.db")
    }

    /// Write the settings back. The file may hold an API key, so it is
    /// readable by the owner only.
    pub fn save(&self) -> Result<()> {
        let path = self.settings_path();
        let text = serde_json::to_string_pretty(&self.settings)?;
        std::fs::write(&path, text)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                .context("Failed to set config file permissions")?;
        }
        Ok(())
    }

    /// Load the server's API key from disk, or generate a new one.
    ///
    /// Returns `(key, newly_created)` where `newly_created` is true when a
    /// fresh key was just generated (first run).
    pub fn load_or_create_api_key(&self) -> Result<(String, bool)> {
        use rand::Rng;
        use std::fmt::Write;

        let path = self.data_dir.join("server_api_key");

        if path.exists() {
            let key = std::fs::read_to_string(&path).context("Failed to read API key file")?;
            let key = key.trim().to_string();
            if !key.is_empty() {
                return Ok((key, false));
            }
        }

        let bytes: [u8; 32] = rand::rng().random();
        let key = bytes
            .iter()
            .fold(String::with_capacity(64), |mut acc: String, b| {
                let _ = write!(acc, "{b:02x}");
                acc
            });
        std::fs::write(&path, &key).context("Failed to write API key file")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                .context("Failed to set API key file permissions")?;
        }
        eprintln!("Generated new API key: {key}");
        eprintln!("Clients connect with: stride login <user-id> --remote <url> --api-key {key}");
        Ok((key, true))
    }
}
