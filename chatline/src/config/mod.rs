//! Configuration for the stream controller and the `chatline` demo.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/chatline/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    stream: StreamFileConfig,
    demo: DemoFileConfig,
}

/// `[stream]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct StreamFileConfig {
    page_size: Option<usize>,
    event_buffer: Option<usize>,
}

/// `[demo]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct DemoFileConfig {
    user_id: Option<String>,
    channel_id: Option<String>,
    seed_messages: Option<usize>,
    timestamp_format: Option<String>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Stream controller settings (used by `MessageStream::builder`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    /// Messages requested per page fetch.
    pub page_size: usize,
    /// Buffer for channel subscribers and the live-event pump.
    pub event_buffer: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            page_size: 20,
            event_buffer: 64,
        }
    }
}

/// Fully resolved demo configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Stream controller settings.
    pub stream: StreamConfig,
    /// Identity of the local user.
    pub user_id: String,
    /// Channel the demo view opens.
    pub channel_id: String,
    /// Number of historical messages seeded into the in-memory backend.
    pub seed_messages: usize,
    /// Timestamp display format string (chrono).
    pub timestamp_format: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            stream: StreamConfig::default(),
            user_id: "alice".to_string(),
            channel_id: "general".to_string(),
            seed_messages: 45,
            timestamp_format: "%H:%M".to_string(),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an
    /// error. Otherwise the default path (`~/.config/chatline/config.toml`)
    /// is tried and silently ignored if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            stream: StreamConfig {
                page_size: cli
                    .page_size
                    .or(file.stream.page_size)
                    .unwrap_or(defaults.stream.page_size),
                event_buffer: file
                    .stream
                    .event_buffer
                    .unwrap_or(defaults.stream.event_buffer),
            },
            user_id: cli
                .user_id
                .clone()
                .or_else(|| file.demo.user_id.clone())
                .unwrap_or(defaults.user_id),
            channel_id: cli
                .channel_id
                .clone()
                .or_else(|| file.demo.channel_id.clone())
                .unwrap_or(defaults.channel_id),
            seed_messages: cli
                .seed_messages
                .or(file.demo.seed_messages)
                .unwrap_or(defaults.seed_messages),
            timestamp_format: cli
                .timestamp_format
                .clone()
                .or_else(|| file.demo.timestamp_format.clone())
                .unwrap_or(defaults.timestamp_format),
        }
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Scripted walkthrough of a paginated, optimistic message stream")]
pub struct CliArgs {
    /// Path to config file (default: `~/.config/chatline/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Local user identity.
    #[arg(long, env = "CHATLINE_USER")]
    pub user_id: Option<String>,

    /// Channel to open.
    #[arg(long, env = "CHATLINE_CHANNEL")]
    pub channel_id: Option<String>,

    /// Messages requested per page.
    #[arg(long)]
    pub page_size: Option<usize>,

    /// Number of historical messages to seed.
    #[arg(long)]
    pub seed_messages: Option<usize>,

    /// Timestamp display format (chrono format string).
    #[arg(long)]
    pub timestamp_format: Option<String>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "CHATLINE_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/chatline.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and a missing
/// file is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    }

    let Some(config_dir) = dirs::config_dir() else {
        return Ok(ConfigFile::default());
    };
    let path = config_dir.join("chatline").join("config.toml");

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
