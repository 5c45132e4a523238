use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{DaqError, Result};

/// Rate multipliers accepted by the facility timing system.
pub const ALLOWED_RATE_MULTIPLICATORS: &[u64] = &[1, 2, 4, 8, 10, 20, 40, 50, 100];

/// Parameter keys that every interactive acquisition must carry.
pub const REQUIRED_PARAMETERS: &[&str] = &[
    "general/created",
    "general/user",
    "general/process",
    "general/instrument",
    "output_file",
];

/// Channels ending with this suffix are image channels served by the image backend.
pub const IMAGE_CHANNEL_SUFFIX: &str = ":FPICTURE";

/// Timestamp format of audit trail lines: `[20180608-140451] ` is an 18-byte prefix.
pub const AUDIT_TIME_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Wall-clock format stored in run manifests (`request_time`).
pub const REQUEST_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Event fields requested from the dispatching layer.
pub const EVENT_FIELDS: &[&str] = &["channel", "pulseId", "value", "shape", "globalDate"];

/// Config fields requested from the dispatching layer.
pub const CONFIG_FIELDS: &[&str] = &["type", "shape"];

/// Map a caller IP to its beamline by the fixed facility prefix table.
pub fn beamline_for_ip(remote_ip: &str) -> Option<&'static str> {
    let prefix = {
        let mut parts = remote_ip.splitn(4, '.');
        let a = parts.next()?;
        let b = parts.next()?;
        let c = parts.next()?;
        parts.next()?;
        format!("{a}.{b}.{c}")
    };

    match prefix.as_str() {
        "129.129.242" => Some("alvra"),
        "129.129.243" => Some("bernina"),
        "129.129.246" => Some("maloja"),
        _ => None,
    }
}

/// Top-level configuration, loadable from a TOML file.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct DaqConfig {
    /// Broker process settings.
    #[serde(default)]
    pub broker: BrokerSettings,
    /// Writer process settings.
    #[serde(default)]
    pub writer: WriterSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    /// Port the outbound write-request stream binds to.
    #[serde(default = "default_output_port")]
    pub output_port: u16,
    /// Port for the REST api.
    #[serde(default = "default_rest_port")]
    pub rest_port: u16,
    /// Bounded depth of the outbound write-request queue.
    #[serde(default = "default_queue_length")]
    pub queue_length: usize,
    /// Timeout applied when the outbound queue is full.
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,
    /// Audit trail file for dispatched write requests.
    #[serde(default = "default_audit_file")]
    pub audit_file: PathBuf,
    /// Root of the facility data tree (`/sf` in production).
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,
    /// Emit image channels as separate write requests / output files.
    #[serde(default = "default_true")]
    pub separate_camera_channels: bool,
    /// Bunch all image channels into one IMAGES file instead of one per camera.
    #[serde(default)]
    pub group_camera_channels: bool,
    #[serde(default = "default_channels_limit")]
    pub channels_limit: usize,
    #[serde(default = "default_picture_channels_limit")]
    pub picture_channels_limit: usize,
    /// Backend hint for plain bsread channels.
    #[serde(default = "default_data_backend")]
    pub data_backend: String,
    /// Backend hint for image channels.
    #[serde(default = "default_image_backend")]
    pub image_backend: String,
    /// External detector retrieval command.
    #[serde(default = "default_detector_command")]
    pub detector_command: String,
    /// Epics writer URL to notify for new acquisitions (empty = disabled).
    #[serde(default)]
    pub epics_writer_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WriterSettings {
    /// Dispatching layer query endpoint.
    #[serde(default = "default_data_api_url")]
    pub data_api_url: String,
    /// Seconds the upstream ring buffer needs before a range is retrievable.
    #[serde(default = "default_retrieval_delay")]
    pub data_retrieval_delay_secs: u64,
    /// Receive timeout of the inbound queue, milliseconds.
    #[serde(default = "default_receive_timeout")]
    pub receive_timeout_ms: u64,
    /// Abort the write when a channel returned no events.
    #[serde(default)]
    pub error_if_no_data: bool,
    /// Retry with a timestamp-range query when the pulse-id query fails.
    #[serde(default = "default_true")]
    pub pulse_id_to_timestamp_fallback: bool,
    /// Facility-local UTC offset used in timestamp-range queries.
    #[serde(default = "default_timezone_offset")]
    pub timezone_offset: String,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            output_port: default_output_port(),
            rest_port: default_rest_port(),
            queue_length: default_queue_length(),
            send_timeout_secs: default_send_timeout(),
            audit_file: default_audit_file(),
            data_root: default_data_root(),
            separate_camera_channels: default_true(),
            group_camera_channels: false,
            channels_limit: default_channels_limit(),
            picture_channels_limit: default_picture_channels_limit(),
            data_backend: default_data_backend(),
            image_backend: default_image_backend(),
            detector_command: default_detector_command(),
            epics_writer_url: None,
        }
    }
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self {
            data_api_url: default_data_api_url(),
            data_retrieval_delay_secs: default_retrieval_delay(),
            receive_timeout_ms: default_receive_timeout(),
            error_if_no_data: false,
            pulse_id_to_timestamp_fallback: default_true(),
            timezone_offset: default_timezone_offset(),
        }
    }
}

fn default_output_port() -> u16 { 10001 }
fn default_rest_port() -> u16 { 10002 }
fn default_queue_length() -> usize { 100 }
fn default_send_timeout() -> u64 { 10 }
fn default_audit_file() -> PathBuf { PathBuf::from("audit_trail.log") }
fn default_data_root() -> PathBuf { PathBuf::from("/sf") }
fn default_true() -> bool { true }
fn default_channels_limit() -> usize { 600 }
fn default_picture_channels_limit() -> usize { 10 }
fn default_data_backend() -> String { "sf-databuffer".to_string() }
fn default_image_backend() -> String { "sf-imagebuffer".to_string() }
fn default_detector_command() -> String { "detector_retrieve".to_string() }
fn default_data_api_url() -> String { "http://localhost:8080/sf/query".to_string() }
fn default_retrieval_delay() -> u64 { 60 }
fn default_receive_timeout() -> u64 { 1000 }
fn default_timezone_offset() -> String { "+02:00".to_string() }

impl DaqConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DaqError::Config(format!("Cannot read config file: {e}")))?;
        let config: DaqConfig = toml::from_str(&content)
            .map_err(|e| DaqError::Config(format!("Invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.broker.queue_length == 0 {
            return Err(DaqError::Config("queue_length must be > 0".into()));
        }
        if self.broker.channels_limit == 0 {
            return Err(DaqError::Config("channels_limit must be > 0".into()));
        }
        if self.writer.receive_timeout_ms == 0 {
            return Err(DaqError::Config("receive_timeout_ms must be > 0".into()));
        }
        parse_utc_offset(&self.writer.timezone_offset).map_err(DaqError::Config)?;
        Ok(())
    }
}

/// Parse a `"+HH:MM"` / `"-HH:MM"` offset into a chrono [`chrono::FixedOffset`].
pub fn parse_utc_offset(offset: &str) -> std::result::Result<chrono::FixedOffset, String> {
    let bad = || format!("Invalid UTC offset '{offset}', expected e.g. +02:00");

    let (sign, rest) = match offset.as_bytes().first() {
        Some(b'+') => (1i32, &offset[1..]),
        Some(b'-') => (-1i32, &offset[1..]),
        _ => return Err(bad()),
    };

    let (h, m) = rest.split_once(':').ok_or_else(bad)?;
    let hours: i32 = h.parse().map_err(|_| bad())?;
    let minutes: i32 = m.parse().map_err(|_| bad())?;
    if hours > 23 || minutes > 59 {
        return Err(bad());
    }

    chrono::FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(bad)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beamline_table() {
        assert_eq!(beamline_for_ip("129.129.242.5"), Some("alvra"));
        assert_eq!(beamline_for_ip("129.129.243.17"), Some("bernina"));
        assert_eq!(beamline_for_ip("129.129.246.200"), Some("maloja"));
        assert_eq!(beamline_for_ip("10.0.0.1"), None);
        assert_eq!(beamline_for_ip("not-an-ip"), None);
    }

    #[test]
    fn defaults_are_valid() {
        let config = DaqConfig::default();
        config.validate().expect("default config validates");
        assert_eq!(config.broker.rest_port, 10002);
        assert_eq!(config.writer.data_retrieval_delay_secs, 60);
    }

    #[test]
    fn utc_offset_parsing() {
        assert!(parse_utc_offset("+02:00").is_ok());
        assert!(parse_utc_offset("-05:30").is_ok());
        assert!(parse_utc_offset("02:00").is_err());
        assert!(parse_utc_offset("+2").is_err());
    }
}
