// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Wire data model: acquisition requests from clients, data-api requests to
//! the dispatching layer, and the write requests handed to the writer.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::channels::is_image_channel;
use crate::config::{ALLOWED_RATE_MULTIPLICATORS, CONFIG_FIELDS, EVENT_FIELDS};
use crate::error::{DaqError, Result};

// ─────────────────────────── dispatching layer ───────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendChannel {
    pub name: String,
    pub backend: String,
}

/// Query range: pulse-id based, or date based for the timestamp fallback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum QueryRange {
    Pulse {
        #[serde(rename = "startPulseId")]
        start_pulse_id: u64,
        #[serde(rename = "endPulseId")]
        end_pulse_id: u64,
    },
    Date {
        #[serde(rename = "startDate")]
        start_date: String,
        #[serde(rename = "endDate")]
        end_date: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseFormat {
    pub format: String,
    pub compression: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataApiRequest {
    pub channels: Vec<BackendChannel>,
    pub range: QueryRange,
    pub response: ResponseFormat,
    #[serde(rename = "eventFields")]
    pub event_fields: Vec<String>,
    #[serde(rename = "configFields")]
    pub config_fields: Vec<String>,
}

/// One event of one channel as returned by the dispatching layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelEvent {
    #[serde(rename = "pulseId")]
    pub pulse_id: u64,
    pub value: Value,
    #[serde(rename = "globalDate", default)]
    pub global_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<Vec<u64>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChannelConfig {
    #[serde(rename = "type", default)]
    pub channel_type: Option<String>,
    #[serde(default)]
    pub shape: Option<Vec<u64>>,
}

/// Per-channel slice of a dispatching layer response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelData {
    pub channel: BackendChannel,
    #[serde(default)]
    pub configs: Vec<ChannelConfig>,
    #[serde(default)]
    pub data: Vec<ChannelEvent>,
}

// ─────────────────────────── write requests ──────────────────────────────────

/// Immutable unit of work for the writer process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteRequest {
    pub data_api_request: DataApiRequest,
    pub parameters: Map<String, Value>,
    /// Creation wall clock, seconds since the unix epoch.
    pub timestamp: f64,
}

impl WriteRequest {
    pub fn output_file(&self) -> Option<&str> {
        self.parameters.get("output_file").and_then(Value::as_str)
    }
}

pub fn wall_clock_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Build a write request for `[start_pulse_id, stop_pulse_id]`.
///
/// `parameters["channels"]`, when present, overrides the roster for the
/// data-api request. Image channels are routed to the image backend.
pub fn get_writer_request(
    channels: &[String],
    parameters: &Map<String, Value>,
    start_pulse_id: u64,
    stop_pulse_id: u64,
    data_backend: &str,
    image_backend: &str,
) -> WriteRequest {
    let override_channels: Option<Vec<String>> = parameters.get("channels").and_then(|v| {
        v.as_array().map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
    });

    let channels: Vec<BackendChannel> = override_channels
        .as_deref()
        .unwrap_or(channels)
        .iter()
        .map(|name| BackendChannel {
            name: name.clone(),
            backend: if is_image_channel(name) {
                image_backend.to_string()
            } else {
                data_backend.to_string()
            },
        })
        .collect();

    WriteRequest {
        data_api_request: DataApiRequest {
            channels,
            range: QueryRange::Pulse {
                start_pulse_id,
                end_pulse_id: stop_pulse_id,
            },
            response: ResponseFormat {
                format: "json".to_string(),
                compression: "none".to_string(),
            },
            event_fields: EVENT_FIELDS.iter().map(|s| s.to_string()).collect(),
            config_fields: CONFIG_FIELDS.iter().map(|s| s.to_string()).collect(),
        },
        parameters: parameters.clone(),
        timestamp: wall_clock_timestamp(),
    }
}

/// Output file for image channels split away from `output_file`.
///
/// Non-grouped: `<stem>.<CAMERA>.IMAGES.h5` per camera; grouped: one
/// `<stem>.IMAGES.h5` for all cameras.
pub fn images_output_file(output_file: &str, camera: Option<&str>) -> String {
    let stem = output_file.strip_suffix(".h5").unwrap_or(output_file);

    match camera {
        Some(name) => {
            let base = name
                .strip_suffix(crate::config::IMAGE_CHANNEL_SUFFIX)
                .unwrap_or(name);
            format!("{stem}.{base}.IMAGES.h5")
        }
        None => format!("{stem}.IMAGES.h5"),
    }
}

/// Split one write request into per-sink requests.
///
/// Non-image channels stay bunched in a single request with the original
/// output path. Image channels go to IMAGES files: one request per camera,
/// or a single grouped request when `group_cameras` is set.
pub fn split_write_request(write_request: WriteRequest, group_cameras: bool) -> Vec<WriteRequest> {
    let (image_channels, data_channels): (Vec<BackendChannel>, Vec<BackendChannel>) = write_request
        .data_api_request
        .channels
        .iter()
        .cloned()
        .partition(|c| is_image_channel(&c.name));

    if image_channels.is_empty() {
        return vec![write_request];
    }

    let output_file = write_request.output_file().unwrap_or_default().to_string();
    let mut requests = Vec::new();

    if !data_channels.is_empty() {
        let mut request = write_request.clone();
        request.data_api_request.channels = data_channels;
        requests.push(request);
    }

    if group_cameras {
        let mut request = write_request.clone();
        request.data_api_request.channels = image_channels;
        request.parameters.insert(
            "output_file".to_string(),
            Value::String(images_output_file(&output_file, None)),
        );
        requests.push(request);
    } else {
        for camera in image_channels {
            let mut request = write_request.clone();
            request.parameters.insert(
                "output_file".to_string(),
                Value::String(images_output_file(&output_file, Some(&camera.name))),
            );
            request.data_api_request.channels = vec![camera];
            requests.push(request);
        }
    }

    requests
}

// ─────────────────────────── acquisition requests ────────────────────────────

/// Validated one-shot acquisition request.
///
/// The selector set is closed: bsread channels, cameras, slow-control PVs
/// and detectors. The raw JSON body is kept verbatim for the run manifest.
#[derive(Debug, Clone)]
pub struct AcquisitionRequest {
    pub pgroup: String,
    pub start_pulseid: u64,
    pub stop_pulseid: u64,
    pub rate_multiplicator: u64,
    pub directory_name: Option<String>,
    pub channels_list: Option<Vec<String>>,
    pub camera_list: Option<Vec<String>>,
    pub pv_list: Option<Vec<String>>,
    pub detectors: Option<Map<String, Value>>,
    pub scan_info: Option<Value>,
}

impl AcquisitionRequest {
    /// Schema-driven parse with the validation rules of the retrieve contract.
    pub fn parse(body: &Value) -> Result<Self> {
        let object = body
            .as_object()
            .ok_or_else(|| DaqError::Validation("request body must be a JSON object".into()))?;

        let pgroup = object
            .get("pgroup")
            .and_then(Value::as_str)
            .ok_or_else(|| DaqError::Validation("no pgroup in request".into()))?
            .to_string();

        if !valid_pgroup(&pgroup) {
            return Err(DaqError::Validation(format!(
                "pgroup '{pgroup}' does not match the expected p<digits> format"
            )));
        }

        let start_pulseid = pulse_id_field(object, "start_pulseid")?;
        let stop_pulseid = pulse_id_field(object, "stop_pulseid")?;

        if start_pulseid > stop_pulseid {
            return Err(DaqError::Validation(format!(
                "start_pulseid {start_pulseid} is after stop_pulseid {stop_pulseid}"
            )));
        }

        let rate_multiplicator = match object.get("rate_multiplicator") {
            None | Some(Value::Null) => 1,
            Some(value) => value.as_u64().ok_or_else(|| {
                DaqError::Validation("rate_multiplicator is not an integer".into())
            })?,
        };

        if !ALLOWED_RATE_MULTIPLICATORS.contains(&rate_multiplicator) {
            return Err(DaqError::Validation(format!(
                "rate_multiplicator {rate_multiplicator} not in allowed set {ALLOWED_RATE_MULTIPLICATORS:?}"
            )));
        }

        let directory_name = match object.get("directory_name") {
            None | Some(Value::Null) => None,
            Some(value) => {
                let name = value.as_str().ok_or_else(|| {
                    DaqError::Validation("directory_name is not a string".into())
                })?;
                if name.starts_with('/') || name.split('/').any(|part| part == "..") {
                    return Err(DaqError::Validation(format!(
                        "directory_name '{name}' escapes the pgroup raw directory"
                    )));
                }
                Some(name.to_string())
            }
        };

        let detectors = match object.get("detectors") {
            None | Some(Value::Null) => None,
            Some(value) => Some(
                value
                    .as_object()
                    .ok_or_else(|| DaqError::Validation("detectors is not a mapping".into()))?
                    .clone(),
            ),
        };

        Ok(Self {
            pgroup,
            start_pulseid,
            stop_pulseid,
            rate_multiplicator,
            directory_name,
            channels_list: string_list_field(object, "channels_list")?,
            camera_list: string_list_field(object, "camera_list")?,
            pv_list: string_list_field(object, "pv_list")?,
            detectors,
            scan_info: object.get("scan_info").filter(|v| !v.is_null()).cloned(),
        })
    }

    /// Whether any data selector is present (a materializing call).
    pub fn has_data_selector(&self) -> bool {
        self.channels_list.as_ref().is_some_and(|l| !l.is_empty())
            || self.camera_list.as_ref().is_some_and(|l| !l.is_empty())
            || self.pv_list.as_ref().is_some_and(|l| !l.is_empty())
            || self.detectors.as_ref().is_some_and(|d| !d.is_empty())
    }
}

fn valid_pgroup(pgroup: &str) -> bool {
    let Some(digits) = pgroup.strip_prefix('p') else {
        return false;
    };
    digits.len() >= 5 && digits.bytes().all(|b| b.is_ascii_digit())
}

/// Pulse ids arrive as JSON numbers or numeric strings; both must cast.
fn pulse_id_field(object: &Map<String, Value>, key: &str) -> Result<u64> {
    let value = object
        .get(key)
        .filter(|v| !v.is_null())
        .ok_or_else(|| DaqError::Validation(format!("no {key} in request")))?;

    match value {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| DaqError::Validation(format!("{key} is not a positive integer"))),
        Value::String(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| DaqError::Validation(format!("{key} '{s}' is not castable to integer"))),
        _ => Err(DaqError::Validation(format!("{key} is not an integer"))),
    }
}

fn string_list_field(object: &Map<String, Value>, key: &str) -> Result<Option<Vec<String>>> {
    match object.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => {
            let mut list = Vec::with_capacity(items.len());
            for item in items {
                let s = item.as_str().ok_or_else(|| {
                    DaqError::Validation(format!("{key} contains a non-string entry"))
                })?;
                list.push(s.to_string());
            }
            Ok(Some(list))
        }
        Some(_) => Err(DaqError::Validation(format!("{key} is not a list"))),
    }
}
