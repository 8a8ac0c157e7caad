//! Configuration for the `kupid` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/kupid/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use kupid_proto::message::ActorId;

use crate::api::ThreadQuery;
use crate::chat::ChannelConfig;
use crate::session::SessionConfig;
use crate::threads::ThreadConfig;

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

    /// A server URL is not valid.
    #[error("invalid {field} URL {value:?}: {source}")]
    InvalidUrl {
        /// Setting that holds the URL.
        field: &'static str,
        /// The rejected value.
        value: String,
        /// Parser error.
        source: url::ParseError,
    },

    /// A period or timeout that must be positive is zero.
    #[error("{field} must be greater than zero")]
    ZeroDuration {
        /// Setting that holds the value.
        field: &'static str,
    },
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    server: ServerFileConfig,
    identity: IdentityFileConfig,
    chat: ChatFileConfig,
    threads: ThreadsFileConfig,
    presence: PresenceFileConfig,
}

/// `[server]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    api_base: Option<String>,
    ws_base: Option<String>,
}

/// `[identity]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct IdentityFileConfig {
    actor_id: Option<i64>,
}

/// `[chat]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ChatFileConfig {
    history_limit: Option<u32>,
    typing_timeout_ms: Option<u64>,
    reconnect_initial_ms: Option<u64>,
    reconnect_max_ms: Option<u64>,
    event_buffer: Option<usize>,
    connect_timeout_secs: Option<u64>,
}

/// `[threads]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ThreadsFileConfig {
    debounce_ms: Option<u64>,
    poll_secs: Option<u64>,
    limit: Option<u32>,
    include_global: Option<bool>,
}

/// `[presence]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct PresenceFileConfig {
    heartbeat_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    // -- Server --
    /// REST API base URL, always ending in `/`.
    pub api_base: Url,
    /// WebSocket base URL, always ending in `/`.
    pub ws_base: Url,

    // -- Identity --
    /// The signed-in member.
    pub actor: Option<ActorId>,
    /// Conversation to open at startup.
    pub peer: Option<ActorId>,

    // -- Chat --
    /// Past messages fetched when a conversation opens.
    pub history_limit: u32,
    /// Silence after which the peer stops typing.
    pub typing_timeout: Duration,
    /// First reconnect delay.
    pub reconnect_initial: Duration,
    /// Reconnect delay cap.
    pub reconnect_max: Duration,
    /// Capacity of the channel event broadcast.
    pub event_buffer: usize,
    /// WebSocket handshake timeout.
    pub connect_timeout: Duration,

    // -- Threads --
    /// Refresh coalescing window.
    pub thread_debounce: Duration,
    /// Thread polling period.
    pub thread_poll: Duration,
    /// Maximum thread rows fetched.
    pub thread_limit: u32,
    /// Whether global rooms appear in the inbox.
    pub include_global: bool,

    // -- Presence --
    /// Heartbeat period.
    pub heartbeat: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base: default_url("http://localhost:8000/"),
            ws_base: default_url("ws://localhost:8000/"),
            actor: None,
            peer: None,
            history_limit: 200,
            typing_timeout: Duration::from_millis(1500),
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
            event_buffer: 256,
            connect_timeout: Duration::from_secs(10),
            thread_debounce: Duration::from_millis(100),
            thread_poll: Duration::from_secs(60),
            thread_limit: 50,
            include_global: false,
            heartbeat: Duration::from_secs(25),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an
    /// error. Otherwise the default path is tried and silently ignored if
    /// missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed,
    /// or if a server URL is invalid.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Self::resolve(cli, &file)
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let api_base = match cli.api_base.as_ref().or(file.server.api_base.as_ref()) {
            Some(raw) => parse_base("api_base", raw)?,
            None => defaults.api_base,
        };
        let ws_base = match cli.ws_base.as_ref().or(file.server.ws_base.as_ref()) {
            Some(raw) => parse_base("ws_base", raw)?,
            None => defaults.ws_base,
        };

        let config = Self {
            api_base,
            ws_base,
            actor: cli
                .actor
                .or(file.identity.actor_id)
                .map(ActorId::new),
            peer: cli.peer.map(ActorId::new),
            history_limit: file.chat.history_limit.unwrap_or(defaults.history_limit),
            typing_timeout: file
                .chat
                .typing_timeout_ms
                .map_or(defaults.typing_timeout, Duration::from_millis),
            reconnect_initial: file
                .chat
                .reconnect_initial_ms
                .map_or(defaults.reconnect_initial, Duration::from_millis),
            reconnect_max: file
                .chat
                .reconnect_max_ms
                .map_or(defaults.reconnect_max, Duration::from_millis),
            event_buffer: file.chat.event_buffer.unwrap_or(defaults.event_buffer),
            connect_timeout: file
                .chat
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            thread_debounce: file
                .threads
                .debounce_ms
                .map_or(defaults.thread_debounce, Duration::from_millis),
            thread_poll: file
                .threads
                .poll_secs
                .map_or(defaults.thread_poll, Duration::from_secs),
            thread_limit: file.threads.limit.unwrap_or(defaults.thread_limit),
            include_global: file
                .threads
                .include_global
                .unwrap_or(defaults.include_global),
            heartbeat: file
                .presence
                .heartbeat_secs
                .map_or(defaults.heartbeat, Duration::from_secs),
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects zero periods and timeouts.
    fn validate(&self) -> Result<(), ConfigError> {
        let timers = [
            ("chat.typing_timeout_ms", self.typing_timeout),
            ("chat.reconnect_initial_ms", self.reconnect_initial),
            ("chat.reconnect_max_ms", self.reconnect_max),
            ("chat.connect_timeout_secs", self.connect_timeout),
            ("threads.poll_secs", self.thread_poll),
            ("presence.heartbeat_secs", self.heartbeat),
        ];
        match timers.into_iter().find(|(_, value)| value.is_zero()) {
            Some((field, _)) => Err(ConfigError::ZeroDuration { field }),
            None => Ok(()),
        }
    }

    /// Settings for the conversation channel.
    #[must_use]
    pub const fn to_channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            typing_timeout: self.typing_timeout,
            reconnect_initial: self.reconnect_initial,
            reconnect_max: self.reconnect_max,
            event_buffer: self.event_buffer,
        }
    }

    /// Settings for the thread aggregator.
    #[must_use]
    pub const fn to_thread_config(&self) -> ThreadConfig {
        ThreadConfig {
            debounce: self.thread_debounce,
            poll: self.thread_poll,
            query: ThreadQuery {
                limit: self.thread_limit,
                include_global: self.include_global,
            },
        }
    }

    /// Settings for a whole chat session.
    #[must_use]
    pub const fn to_session_config(&self) -> SessionConfig {
        SessionConfig {
            channel: self.to_channel_config(),
            threads: self.to_thread_config(),
            history_limit: self.history_limit,
            heartbeat: self.heartbeat,
        }
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Terminal client for Kupid chat")]
pub struct CliArgs {
    /// REST API base URL.
    #[arg(long, env = "KUPID_API_BASE")]
    pub api_base: Option<String>,

    /// WebSocket base URL.
    #[arg(long, env = "KUPID_WS_BASE")]
    pub ws_base: Option<String>,

    /// Your member id.
    #[arg(long, env = "KUPID_ACTOR_ID")]
    pub actor: Option<i64>,

    /// Member id to chat with (negative ids are global rooms).
    #[arg(long, allow_hyphen_values = true)]
    pub peer: Option<i64>,

    /// Path to config file (default: `~/.config/kupid/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "KUPID_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/kupid.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Parses a base URL, adding the trailing `/` that `Url::join` needs to
/// keep the last path segment.
fn parse_base(field: &'static str, raw: &str) -> Result<Url, ConfigError> {
    let mut url = Url::parse(raw).map_err(|source| ConfigError::InvalidUrl {
        field,
        value: raw.to_string(),
        source,
    })?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn default_url(raw: &str) -> Url {
    Url::parse(raw).unwrap_or_else(|_| unreachable!("built-in URL {raw} is valid"))
}

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("kupid").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
