// ============================================
// RTA Builder - config.rs
// ============================================
// Settings for the builder, stored as TOML.
//
// Every field has a default, so an empty (or missing) file is valid.
// Example rtabuilder.toml:
//
//   archiver_paths = ['D:\Portable\7-Zip\7z.exe']
//   mount_attempts = 20
//   progress_every = 50
//   tool_idle_timeout_secs = 600
//   default_hostname = "rta-01"
//
// The app directory mirrors the layout the launcher has always used:
//
//   ~/RTA_Builder/
//   ├── downloads/     # downloaded source images
//   ├── tools/         # content items and bundled helpers
//   └── logs/
// ============================================

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Name of the settings file looked up in the working directory
pub const CONFIG_FILE_NAME: &str = "rtabuilder.toml";

/// Default source image offered by `rtabuilder download`
pub const DEFAULT_ISO_URL: &str =
    "https://cdimage.kali.org/kali-2023.1/kali-linux-2023.1-installer-amd64.iso";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BuilderConfig {
    // ============================================
    // TOOL LOCATIONS (searched before the built-in ones)
    // ============================================
    pub archiver_paths: Vec<PathBuf>,
    pub masterer_paths: Vec<PathBuf>,
    pub script_host_paths: Vec<PathBuf>,

    // ============================================
    // MOUNTING
    // ============================================
    pub mount_attempts: u32,
    pub mount_poll_interval_ms: u64,

    // ============================================
    // PROGRESS / SUBPROCESSES
    // ============================================
    /// Emit bulk-copy progress every N files
    pub progress_every: u64,
    /// Kill a tool that prints nothing for this long (0 = wait forever)
    pub tool_idle_timeout_secs: u64,

    // ============================================
    // BUILD DEFAULTS
    // ============================================
    pub default_volume_label: String,
    pub default_hostname: String,
    pub output_folder: PathBuf,
    pub tools_folder: Option<PathBuf>,
    pub catalog_path: PathBuf,
    pub keep_workspace: bool,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            archiver_paths: Vec::new(),
            masterer_paths: Vec::new(),
            script_host_paths: Vec::new(),
            mount_attempts: 10,
            mount_poll_interval_ms: 500,
            progress_every: 100,
            tool_idle_timeout_secs: 0,
            default_volume_label: "KALI_RTA".to_string(),
            default_hostname: "kali-rta".to_string(),
            output_folder: home_dir().join("RTA_Builder_Output"),
            tools_folder: None,
            catalog_path: PathBuf::from("tools_config.json"),
            keep_workspace: false,
        }
    }
}

impl BuilderConfig {
    /// Read settings from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: BuilderConfig = toml::from_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Load an explicit file, or `rtabuilder.toml` if it exists, or defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let local = Path::new(CONFIG_FILE_NAME);
                if local.exists() {
                    Self::load(local)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.mount_attempts == 0 {
            anyhow::bail!("mount_attempts must be at least 1");
        }
        if self.default_volume_label.trim().is_empty() {
            anyhow::bail!("default_volume_label must not be empty");
        }
        Ok(())
    }

    pub fn mount_poll_interval(&self) -> Duration {
        Duration::from_millis(self.mount_poll_interval_ms)
    }

    pub fn tool_idle_timeout(&self) -> Option<Duration> {
        (self.tool_idle_timeout_secs > 0).then(|| Duration::from_secs(self.tool_idle_timeout_secs))
    }
}

fn home_dir() -> PathBuf {
    std::env::var_os("USERPROFILE")
        .or_else(|| std::env::var_os("HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Folder next to the running executable (bundled helpers live under tools/)
pub fn get_app_directory() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// ~/RTA_Builder
pub fn app_data_dir() -> PathBuf {
    home_dir().join("RTA_Builder")
}

/// Create the app directory and its downloads/tools/logs folders
pub fn ensure_app_dirs(root: &Path) -> Result<()> {
    for sub in ["downloads", "tools", "logs"] {
        let dir = root.join(sub);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    Ok(())
}
