//! Config loader (A1): `BridgeConfig` deserialized from a JSON document,
//! written out with documented defaults if absent, plus a separate
//! `SecretsFile` for QRZ credentials.
//!
//! Grounded on `original_source/gtbridge.py`'s `DEFAULT_CONFIG` and
//! `load_config`, restated in the teacher's `serde`-derive idiom.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tracing::warn;

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("could not read config file {path}: {source}"))]
    Read { path: String, source: std::io::Error },

    #[snafu(display("could not write default config file {path}: {source}"))]
    Write { path: String, source: std::io::Error },

    #[snafu(display("config file {path} is not valid JSON: {source}"))]
    Parse { path: String, source: serde_json::Error },

    #[snafu(display("could not serialize default config: {source}"))]
    Serialize { source: serde_json::Error },

    #[snafu(display("secrets file {path} is not valid JSON: {source}"))]
    SecretsParse { path: String, source: serde_json::Error },

    #[snafu(display("secrets file {path} could not be read: {source}"))]
    SecretsRead { path: String, source: std::io::Error },

    #[snafu(display("secrets file password field is not valid base64: {source}"))]
    SecretsBase64 { source: base64::DecodeError },

    #[snafu(display("config is missing a required field: {field}"))]
    MissingField { field: String },

    #[snafu(display("could not open log file {path}: {source}"))]
    LogFileOpen { path: String, source: std::io::Error },
}

type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    #[serde(default)]
    pub login_commands: Vec<String>,
}

fn default_udp_host() -> String {
    "127.0.0.1".to_string()
}
fn default_udp_port() -> u16 {
    2237
}
fn default_heartbeat_interval() -> u64 {
    15
}
fn default_cycle_interval() -> u64 {
    10
}
fn default_spot_ttl() -> u64 {
    1800
}
fn default_grace_ttl() -> u64 {
    300
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_telnet_port() -> u16 {
    7300
}
fn default_pota_poll_interval() -> u64 {
    60
}
fn default_sota_poll_interval() -> u64 {
    60
}
fn default_flex_port() -> u16 {
    4992
}
fn default_n1mm_port() -> u16 {
    12060
}
fn default_client_id() -> String {
    "GTB".to_string()
}

/// `BridgeConfig` mirrors the documented JSON keys from spec §6 /
/// `original_source/gtbridge.py`'s `DEFAULT_CONFIG`. Every optional key
/// has a `#[serde(default)]` so an operator's trimmed-down config file
/// still loads; unknown keys are tolerated by `serde`'s ordinary
/// struct deserialization (unrecognized fields are simply ignored).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub callsign: String,
    #[serde(default)]
    pub grid: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_udp_host")]
    pub udp_host: String,
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,
    #[serde(default = "default_cycle_interval")]
    pub cycle_interval: u64,
    #[serde(default = "default_spot_ttl")]
    pub spot_ttl: u64,
    #[serde(default = "default_grace_ttl")]
    pub grace_ttl: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_file: Option<String>,
    #[serde(default)]
    pub mode_filter: Vec<String>,
    #[serde(default)]
    pub band_filter: Vec<String>,
    #[serde(default = "default_region")]
    pub region: u8,
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
    #[serde(default)]
    pub telnet_server: bool,
    #[serde(default = "default_telnet_port")]
    pub telnet_port: u16,
    #[serde(default)]
    pub pota_spots: bool,
    #[serde(default)]
    pub sota_spots: bool,
    #[serde(default = "default_pota_poll_interval")]
    pub pota_poll_interval: u64,
    #[serde(default = "default_sota_poll_interval")]
    pub sota_poll_interval: u64,
    #[serde(default)]
    pub qrz_skimmer_only: bool,
    #[serde(default)]
    pub flex_radio: bool,
    #[serde(default)]
    pub flex_host: String,
    #[serde(default = "default_flex_port")]
    pub flex_port: u16,
    #[serde(default)]
    pub flex_slice: Option<u32>,
    #[serde(default)]
    pub n1mm_listen: bool,
    #[serde(default = "default_n1mm_port")]
    pub n1mm_port: u16,
    #[serde(default)]
    pub secrets_file: Option<String>,
}

fn default_region() -> u8 {
    2
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            callsign: String::new(),
            grid: String::new(),
            client_id: default_client_id(),
            udp_host: default_udp_host(),
            udp_port: default_udp_port(),
            heartbeat_interval: default_heartbeat_interval(),
            cycle_interval: default_cycle_interval(),
            spot_ttl: default_spot_ttl(),
            grace_ttl: default_grace_ttl(),
            log_level: default_log_level(),
            log_file: None,
            mode_filter: Vec::new(),
            band_filter: Vec::new(),
            region: default_region(),
            clusters: Vec::new(),
            telnet_server: false,
            telnet_port: default_telnet_port(),
            pota_spots: false,
            sota_spots: false,
            pota_poll_interval: default_pota_poll_interval(),
            sota_poll_interval: default_sota_poll_interval(),
            qrz_skimmer_only: true,
            flex_radio: false,
            flex_host: String::new(),
            flex_port: default_flex_port(),
            flex_slice: None,
            n1mm_listen: false,
            n1mm_port: default_n1mm_port(),
            secrets_file: None,
        }
    }
}

impl BridgeConfig {
    /// Load the config at `path`, writing the documented defaults and
    /// warning the operator if the file does not exist yet.
    pub fn load(path: &Path) -> Result<Self> {
        let path_str = path.display().to_string();
        if !path.exists() {
            warn!(path = %path_str, "config file not found, writing defaults; edit `callsign` and `grid` before running again");
            let defaults = BridgeConfig::default();
            let bytes = serde_json::to_vec_pretty(&defaults).context(SerializeSnafu)?;
            std::fs::write(path, bytes).context(WriteSnafu { path: path_str.clone() })?;
            return Ok(defaults);
        }

        let bytes = std::fs::read(path).context(ReadSnafu { path: path_str.clone() })?;
        let config: BridgeConfig = serde_json::from_slice(&bytes).context(ParseSnafu { path: path_str })?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.callsign.trim().is_empty() {
            return MissingFieldSnafu { field: "callsign" }.fail();
        }
        Ok(())
    }
}

/// QRZ credentials, loaded from a separate JSON file so they never
/// land in the main config (and thus never in a committed config
/// template).
#[derive(Debug, Clone, Deserialize)]
pub struct SecretsFile {
    #[serde(default)]
    pub qrz_username: Option<String>,
    #[serde(default)]
    pub qrz_password: Option<String>,
}

impl SecretsFile {
    /// Resolve the secrets file path: the config's `secrets_file` key,
    /// falling back to the `GTBRIDGE_SECRETS_FILE` env var.
    pub fn resolve_path(config: &BridgeConfig) -> Option<PathBuf> {
        config
            .secrets_file
            .clone()
            .or_else(|| std::env::var("GTBRIDGE_SECRETS_FILE").ok())
            .map(PathBuf::from)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let path_str = path.display().to_string();
        let bytes = std::fs::read(path).context(SecretsReadSnafu { path: path_str.clone() })?;
        let secrets: SecretsFile = serde_json::from_slice(&bytes).context(SecretsParseSnafu { path: path_str })?;
        Ok(secrets)
    }

    /// Decode a `b64:`-prefixed password field. This is obfuscation,
    /// not encryption — documented as such, never treated as a
    /// security boundary.
    pub fn decode_password(&self) -> Result<Option<String>> {
        let Some(raw) = &self.qrz_password else {
            return Ok(None);
        };
        if let Some(encoded) = raw.strip_prefix("b64:") {
            use base64::Engine;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .context(SecretsBase64Snafu)?;
            Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
        } else {
            Ok(Some(raw.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_port_defaults() {
        let cfg = BridgeConfig::default();
        assert_eq!(cfg.udp_port, 2237);
        assert_eq!(cfg.flex_port, 4992);
        assert_eq!(cfg.n1mm_port, 12060);
        assert_eq!(cfg.region, 2);
    }

    #[test]
    fn validate_rejects_empty_callsign() {
        let cfg = BridgeConfig::default();
        assert!(matches!(cfg.validate(), Err(ConfigError::MissingField { .. })));
    }

    #[test]
    fn validate_accepts_populated_callsign() {
        let mut cfg = BridgeConfig::default();
        cfg.callsign = "W1AW".to_string();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn plain_password_passes_through_unchanged() {
        let secrets = SecretsFile {
            qrz_username: Some("user".to_string()),
            qrz_password: Some("hunter2".to_string()),
        };
        assert_eq!(secrets.decode_password().unwrap(), Some("hunter2".to_string()));
    }

    #[test]
    fn b64_prefixed_password_is_decoded() {
        let secrets = SecretsFile {
            qrz_username: Some("user".to_string()),
            qrz_password: Some("b64:aHVudGVyMg==".to_string()),
        };
        assert_eq!(secrets.decode_password().unwrap(), Some("hunter2".to_string()));
    }

    #[test]
    fn missing_password_is_none() {
        let secrets = SecretsFile {
            qrz_username: None,
            qrz_password: None,
        };
        assert_eq!(secrets.decode_password().unwrap(), None);
    }

    #[test]
    fn unknown_keys_are_tolerated() {
        let json = r#"{"callsign":"W1AW","totally_unknown_key":42}"#;
        let cfg: BridgeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.callsign, "W1AW");
    }
}
