use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::listener::ListenAddr;

// =============================================================================
// File config (figment-deserialized from defaults / dotshare.toml / env vars)
// =============================================================================
//
//   dotshare.toml:   [server]
//                    max_unauthenticated = 10
//
//   env var:         DOTSHARE_SERVER__MAX_UNAUTHENTICATED=10
//
// Double underscore nests into a section; single underscores stay in the
// field name.

/// Top-level configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub auth: AuthFileConfig,
    #[serde(default)]
    pub display: DisplayFileConfig,
    #[serde(default)]
    pub core: CoreFileConfig,
}

/// Protocol server knobs (`[server]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    /// `tcp:HOST:PORT` or `unix:PATH`
    #[serde(default = "default_listen")]
    pub listen: Vec<String>,
    /// Largest accepted packet payload in bytes.
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    #[serde(default = "default_max_unauthenticated")]
    pub max_unauthenticated: usize,
    #[serde(default = "default_auth_timeout_secs")]
    pub auth_timeout_secs: u64,
    /// Per-connection outbound queue depth.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_packet_size: default_max_packet_size(),
            max_unauthenticated: default_max_unauthenticated(),
            auth_timeout_secs: default_auth_timeout_secs(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethodConfig {
    #[default]
    None,
    Keyfile,
}

/// Client authentication (`[auth]`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AuthFileConfig {
    #[serde(default)]
    pub method: AuthMethodConfig,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
}

/// The display device (`[display]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DisplayFileConfig {
    #[serde(default = "default_columns")]
    pub columns: u32,
    #[serde(default = "default_rows")]
    pub rows: u32,
    #[serde(default = "default_driver_name")]
    pub driver_name: String,
    #[serde(default = "default_model")]
    pub model: String,
}

impl Default for DisplayFileConfig {
    fn default() -> Self {
        Self {
            columns: default_columns(),
            rows: default_rows(),
            driver_name: default_driver_name(),
            model: default_model(),
        }
    }
}

/// Core loop and rendering (`[core]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoreFileConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_cursor_dots")]
    pub cursor_dots: u8,
    /// 0 keeps the cursor steady.
    #[serde(default)]
    pub cursor_blink_ms: u32,
    /// Top-level tty that starts out focused.
    #[serde(default = "default_root_focus")]
    pub root_focus: Option<u32>,
}

impl Default for CoreFileConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            cursor_dots: default_cursor_dots(),
            cursor_blink_ms: 0,
            root_focus: default_root_focus(),
        }
    }
}

fn default_listen() -> Vec<String> {
    vec!["tcp:127.0.0.1:4101".to_string()]
}
fn default_max_packet_size() -> usize {
    512
}
fn default_max_unauthenticated() -> usize {
    5
}
fn default_auth_timeout_secs() -> u64 {
    30
}
fn default_outbound_queue() -> usize {
    64
}
fn default_columns() -> u32 {
    40
}
fn default_rows() -> u32 {
    1
}
fn default_driver_name() -> String {
    "virtual".to_string()
}
fn default_model() -> String {
    "VirtualDisplay".to_string()
}
fn default_poll_interval_ms() -> u64 {
    40
}
fn default_cursor_dots() -> u8 {
    0xC0
}
fn default_root_focus() -> Option<u32> {
    Some(1)
}

/// Build a figment that layers: defaults → dotshare.toml → DOTSHARE_* env vars.
///
///   `DOTSHARE_AUTH__METHOD=keyfile`  →  `auth.method = "keyfile"`
///   `DOTSHARE_DISPLAY__COLUMNS=80`   →  `display.columns = 80`
pub fn load_config(config_file: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_file))
        .merge(Env::prefixed("DOTSHARE_").split("__"))
}

// =============================================================================
// Runtime config (derived from FileConfig, used throughout the server)
// =============================================================================

/// Protocol server configuration (runtime view).
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub max_packet_size: usize,
    pub max_unauthenticated: usize,
    /// Measured from when the transport was accepted.
    pub auth_timeout: Duration,
    pub outbound_queue: usize,
    pub cursor_dots: u8,
    pub cursor_blink: Duration,
    pub root_focus: Option<u32>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_file(&FileConfig::default())
    }
}

impl ServerConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            max_packet_size: fc.server.max_packet_size,
            max_unauthenticated: fc.server.max_unauthenticated,
            auth_timeout: Duration::from_secs(fc.server.auth_timeout_secs),
            outbound_queue: fc.server.outbound_queue.max(1),
            cursor_dots: fc.core.cursor_dots,
            cursor_blink: Duration::from_millis(u64::from(fc.core.cursor_blink_ms)),
            root_focus: fc.core.root_focus,
        }
    }
}

/// Everything the binary needs, resolved.
#[derive(Clone, Debug)]
pub struct DotshareConfig {
    pub server: ServerConfig,
    pub listen: Vec<ListenAddr>,
    pub auth: AuthFileConfig,
    pub display: DisplayFileConfig,
    pub poll_interval: Duration,
}

impl DotshareConfig {
    pub fn from_file(fc: &FileConfig) -> Result<Self, crate::error::ServerError> {
        let listen = fc
            .server
            .listen
            .iter()
            .map(|s| s.parse())
            .collect::<Result<Vec<ListenAddr>, _>>()?;
        Ok(Self {
            server: ServerConfig::from_file(fc),
            listen,
            auth: fc.auth.clone(),
            display: fc.display.clone(),
            poll_interval: Duration::from_millis(fc.core.poll_interval_ms.max(1)),
        })
    }
}
