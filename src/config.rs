//! Configuration loading for sctl-shell.
//!
//! Configuration is resolved from three fallback sources (tried in order):
//!
//! 1. **JSON file** via `--config <path>` CLI flag
//! 2. **JSON file** via `SCTL_CONFIG` environment variable
//! 3. **Environment variables**: `SCTL_URL` + `SCTL_API_KEY` (creates
//!    a single "default" device)
//!
//! The JSON format is the same device file the other sctl clients read, with
//! an optional per-device `default_shell`:
//!
//! ```json
//! {
//!   "config_version": 1,
//!   "default_device": "router",
//!   "devices": {
//!     "router": { "url": "http://192.168.1.1:1337", "api_key": "secret" },
//!     "lab": { "url": "https://lab.example.com", "api_key": "k", "default_shell": "/bin/bash" }
//!   }
//! }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::warn;

use crate::error::ShellError;

/// Bump this when the config format changes (new required fields, renamed keys, etc.).
pub const CONFIG_VERSION: u32 = 1;

/// CLI arguments parsed by `clap`.
#[derive(Parser, Debug)]
#[command(name = "sctl-shell", version, about = "Interactive shell on an sctl device")]
pub struct Cli {
    /// Path to devices config file (JSON)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Device to connect to. Omit to use the default device.
    #[arg(long)]
    pub device: Option<String>,

    /// Log level used when `RUST_LOG` is not set.
    #[arg(long, default_value = "warn")]
    pub log_level: String,

    /// Write logs to this file instead of stderr.
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Launch an interactive shell on the device (default).
    ///
    /// Without an argument the device user's login shell is started.
    Shell {
        /// Alternative command to run instead of the login shell.
        command: Option<String>,
    },
}

impl Cli {
    /// The command argument of `shell [command]` (no subcommand means `shell`).
    pub fn shell_command(&self) -> Option<&str> {
        match &self.command {
            Some(Commands::Shell { command }) => command.as_deref(),
            None => None,
        }
    }
}

/// Raw JSON config file structure.
#[derive(Deserialize)]
pub struct DevicesConfig {
    /// Config format version: checked against `CONFIG_VERSION` to detect stale files.
    pub config_version: Option<u32>,
    pub devices: HashMap<String, DeviceEntry>,
    pub default_device: Option<String>,
}

/// A single device entry in the config file.
#[derive(Deserialize, Clone, Debug)]
pub struct DeviceEntry {
    pub url: String,
    pub api_key: String,
    /// Command launched by `shell` when no argument is given.
    pub default_shell: Option<String>,
}

/// Validated configuration.
#[derive(Debug)]
pub struct ResolvedConfig {
    pub devices: HashMap<String, DeviceEntry>,
    pub default_device: String,
}

impl ResolvedConfig {
    /// Look up a device by name, falling back to the default device.
    pub fn device(&self, name: Option<&str>) -> Result<(&str, &DeviceEntry), ShellError> {
        let name = name.unwrap_or(&self.default_device);
        self.devices
            .get_key_value(name)
            .map(|(k, v)| (k.as_str(), v))
            .ok_or_else(|| ShellError::Config(format!("Unknown device: '{name}'")))
    }
}

/// Load and validate configuration from CLI args, env vars, or config file.
pub fn load_config(cli: &Cli) -> Result<ResolvedConfig, ShellError> {
    if let Some(path) = &cli.config {
        load_from_file(&expand_tilde(path))
    } else if let Ok(path) = std::env::var("SCTL_CONFIG") {
        load_from_file(&expand_tilde(Path::new(&path)))
    } else {
        load_from_env()
    }
}

/// Expand a leading `~` to `$HOME`.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    path.to_path_buf()
}

pub fn load_from_file(path: &Path) -> Result<ResolvedConfig, ShellError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        ShellError::Config(format!("Failed to read config file {}: {e}", path.display()))
    })?;

    let config: DevicesConfig = serde_json::from_str(&contents).map_err(|e| {
        ShellError::Config(format!("Failed to parse config file {}: {e}", path.display()))
    })?;

    match config.config_version {
        None => warn!(
            "{} has no config_version field (expected {CONFIG_VERSION})",
            path.display()
        ),
        Some(v) if v < CONFIG_VERSION => warn!(
            "{} has config_version {v} but sctl-shell expects {CONFIG_VERSION}",
            path.display()
        ),
        _ => {}
    }

    validate(config)
}

fn validate(config: DevicesConfig) -> Result<ResolvedConfig, ShellError> {
    if config.devices.is_empty() {
        return Err(ShellError::Config("Config file contains no devices".into()));
    }

    for (name, entry) in &config.devices {
        if entry.url.is_empty() {
            return Err(ShellError::Config(format!("Device '{name}' has empty url")));
        }
        if entry.api_key.is_empty() {
            return Err(ShellError::Config(format!("Device '{name}' has empty api_key")));
        }
    }

    let default_device = match (&config.default_device, config.devices.len()) {
        (Some(d), _) if !config.devices.contains_key(d) => {
            return Err(ShellError::Config(format!(
                "default_device '{d}' not found in devices"
            )));
        }
        (Some(d), _) => d.clone(),
        (None, 1) => config.devices.keys().next().cloned().unwrap_or_default(),
        (None, _) => {
            return Err(ShellError::Config(
                "Multiple devices configured but no default_device specified".into(),
            ));
        }
    };

    Ok(ResolvedConfig {
        devices: config.devices,
        default_device,
    })
}

fn load_from_env() -> Result<ResolvedConfig, ShellError> {
    let url = std::env::var("SCTL_URL")
        .map_err(|_| ShellError::Config("No config file and SCTL_URL not set".into()))?;
    let api_key = std::env::var("SCTL_API_KEY")
        .map_err(|_| ShellError::Config("No config file and SCTL_API_KEY not set".into()))?;

    from_url(url, api_key)
}

fn from_url(url: String, api_key: String) -> Result<ResolvedConfig, ShellError> {
    if url.is_empty() {
        return Err(ShellError::Config("SCTL_URL is empty".into()));
    }
    if api_key.is_empty() {
        return Err(ShellError::Config("SCTL_API_KEY is empty".into()));
    }

    let mut devices = HashMap::new();
    devices.insert(
        "default".to_string(),
        DeviceEntry {
            url,
            api_key,
            default_shell: None,
        },
    );

    Ok(ResolvedConfig {
        devices,
        default_device: "default".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn single_device_becomes_default() {
        let file = write_config(
            r#"{ "config_version": 1,
                 "devices": { "router": { "url": "http://10.0.0.1:1337", "api_key": "k" } } }"#,
        );
        let config = load_from_file(file.path()).unwrap();
        assert_eq!(config.default_device, "router");
        let (name, entry) = config.device(None).unwrap();
        assert_eq!(name, "router");
        assert_eq!(entry.url, "http://10.0.0.1:1337");
        assert!(entry.default_shell.is_none());
    }

    #[test]
    fn explicit_device_and_default_shell() {
        let file = write_config(
            r#"{ "config_version": 1, "default_device": "a",
                 "devices": {
                   "a": { "url": "http://a", "api_key": "1" },
                   "b": { "url": "http://b", "api_key": "2", "default_shell": "/bin/bash" }
                 } }"#,
        );
        let config = load_from_file(file.path()).unwrap();
        let (_, b) = config.device(Some("b")).unwrap();
        assert_eq!(b.default_shell.as_deref(), Some("/bin/bash"));
        assert!(config.device(Some("missing")).is_err());
    }

    #[test]
    fn multiple_devices_require_default() {
        let file = write_config(
            r#"{ "devices": {
                   "a": { "url": "http://a", "api_key": "1" },
                   "b": { "url": "http://b", "api_key": "2" } } }"#,
        );
        let err = load_from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("no default_device"));
    }

    #[test]
    fn unknown_default_device_rejected() {
        let file = write_config(
            r#"{ "default_device": "zz",
                 "devices": { "a": { "url": "http://a", "api_key": "1" } } }"#,
        );
        assert!(load_from_file(file.path()).is_err());
    }

    #[test]
    fn empty_api_key_rejected() {
        let file = write_config(r#"{ "devices": { "a": { "url": "http://a", "api_key": "" } } }"#);
        let err = load_from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("empty api_key"));
    }

    #[test]
    fn env_style_config_creates_default_device() {
        let config = from_url("http://dev:1337".into(), "key".into()).unwrap();
        assert_eq!(config.default_device, "default");
        assert!(from_url(String::new(), "key".into()).is_err());
    }

    #[test]
    fn missing_subcommand_means_shell() {
        let cli = Cli::parse_from(["sctl-shell"]);
        assert_eq!(cli.shell_command(), None);

        let cli = Cli::parse_from(["sctl-shell", "--device", "lab", "shell", "/bin/zsh"]);
        assert_eq!(cli.device.as_deref(), Some("lab"));
        assert_eq!(cli.shell_command(), Some("/bin/zsh"));
    }
}
