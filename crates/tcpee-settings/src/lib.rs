//! TOML configuration for tcpee proxy instances.
//!
//! The top level of the config file is a map keyed by proxy instance name;
//! each table holds that instance's knobs and its `"src -> dst"` routes:
//!
//! ```toml
//! [web]
//! client-timeout = "30s"
//! server-timeout = "30s"
//! server-keepalive = "-1s"      # negative disables keep-alive
//! proxy = ["0.0.0.0:8443 -> 10.0.0.1:443"]
//! proxy-proto = true
//!
//! [smtp]
//! proxy = [
//!     "0.0.0.0:25 -> 10.0.0.2:25",
//!     "0.0.0.0:587 -> 10.0.0.2:587",
//! ]
//! transparent = true
//! ```
//!
//! Durations use Go-style strings (`150ms`, `1s`, `30m`, `1h30m`). Absent
//! keys fall back to their defaults; a malformed duration or route is a
//! fatal configuration error.

mod duration;

pub use duration::{DurationError, DurationKnob};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The config file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A duration key holds an unparseable value.
    #[error("invalid {key} {value:?}: {source}")]
    Duration {
        key: &'static str,
        value: String,
        #[source]
        source: DurationError,
    },

    /// A route entry is not of the form `"src -> dst"`.
    #[error("bad proxy route {entry:?}, expected \"src -> dst\"")]
    Route { entry: String },
}

/// One `src -> dst` forwarding pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub src: String,
    pub dst: String,
}

impl FromStr for Route {
    type Err = SettingsError;

    fn from_str(entry: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = entry.split(" -> ").collect();
        match parts.as_slice() {
            [src, dst] if !src.is_empty() && !dst.is_empty() => Ok(Route {
                src: (*src).to_string(),
                dst: (*dst).to_string(),
            }),
            _ => Err(SettingsError::Route {
                entry: entry.to_string(),
            }),
        }
    }
}

/// Raw per-instance table, exactly as written in the file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct InstanceSettings {
    /// Idle write budget on the front-side socket.
    #[serde(default)]
    pub server_timeout: Option<String>,

    /// Idle read budget on the front-side socket.
    #[serde(default)]
    pub client_timeout: Option<String>,

    /// Back-end keep-alive period (0 default, negative off).
    #[serde(default)]
    pub server_keepalive: Option<String>,

    /// Front-end keep-alive period (0 default, negative off).
    #[serde(default)]
    pub client_keepalive: Option<String>,

    /// Maximum time a back-end dial may take.
    #[serde(default)]
    pub dial_timeout: Option<String>,

    /// `"src -> dst"` pairs served by this instance.
    #[serde(default)]
    pub proxy: Vec<String>,

    /// Enable the transparent-proxy socket hook.
    #[serde(default)]
    pub transparent: bool,

    /// Emit a PROXY protocol v1 header per session.
    #[serde(default)]
    pub proxy_proto: bool,
}

/// Typed view of an instance's duration keys, validated in one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstanceKnobs {
    pub server_timeout: DurationKnob,
    pub client_timeout: DurationKnob,
    pub server_keepalive: DurationKnob,
    pub client_keepalive: DurationKnob,
    pub dial_timeout: DurationKnob,
}

impl InstanceSettings {
    /// Parse and validate all duration keys.
    pub fn knobs(&self) -> Result<InstanceKnobs, SettingsError> {
        Ok(InstanceKnobs {
            server_timeout: knob_field("server-timeout", &self.server_timeout)?,
            client_timeout: knob_field("client-timeout", &self.client_timeout)?,
            server_keepalive: knob_field("server-keepalive", &self.server_keepalive)?,
            client_keepalive: knob_field("client-keepalive", &self.client_keepalive)?,
            dial_timeout: knob_field("dial-timeout", &self.dial_timeout)?,
        })
    }

    /// Parse and validate the route list.
    pub fn routes(&self) -> Result<Vec<Route>, SettingsError> {
        self.proxy.iter().map(|entry| entry.parse()).collect()
    }
}

fn knob_field(
    key: &'static str,
    value: &Option<String>,
) -> Result<DurationKnob, SettingsError> {
    match value {
        None => Ok(DurationKnob::Default),
        Some(raw) => duration::parse_knob(raw).map_err(|source| SettingsError::Duration {
            key,
            value: raw.clone(),
            source,
        }),
    }
}

/// The whole configuration file: instances keyed by name.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct Config {
    pub instances: BTreeMap<String, InstanceSettings>,
}

impl Config {
    /// Parse a config from a TOML string.
    ///
    /// # Errors
    /// `SettingsError::Parse` on malformed TOML or unrecognised keys.
    pub fn parse(raw: &str) -> Result<Self, SettingsError> {
        Ok(toml::from_str(raw)?)
    }

    /// Load a config from a file on disk.
    ///
    /// # Errors
    /// `SettingsError::Io` on read failure, `SettingsError::Parse` on
    /// malformed content.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let contents = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents)
    }
}
