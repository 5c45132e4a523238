// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! File materialization — converts sparse per-channel event streams into
//! aligned, presence-annotated datasets.
//!
//! Two layouts:
//!  - *Extended* (default): every channel spans the sorted union of all
//!    observed pulse ids; absent events are zero-filled and masked out in
//!    `is_data_present`.
//!  - *Compact*: one row per received event, `is_data_present` all ones.
//!
//! Multi-dimensional values are stored with the axis order reversed
//! relative to the bsread shape declaration, so a declared `[1024]` scalar
//! array lands as dataset shape `[n, 1024]`.

use std::collections::HashMap;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::error::{DaqError, Result};
use crate::request::{ChannelData, ChannelEvent};
use crate::storage::container::{encode_strings, ContainerWriter, DType};

/// On-disk representation selected per write request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileLayout {
    Extended,
    Compact,
}

impl FileLayout {
    /// `parameters["output_file_format"] == "compact"` selects the compact layout.
    pub fn from_parameters(parameters: &Map<String, Value>) -> Self {
        match parameters.get("output_file_format").and_then(Value::as_str) {
            Some("compact") => FileLayout::Compact,
            _ => FileLayout::Extended,
        }
    }
}

/// Materialize one retrieval result into `output_file`.
pub fn write_output_file(
    output_file: &Path,
    parameters: &Map<String, Value>,
    channels: &[ChannelData],
    error_if_no_data: bool,
) -> Result<()> {
    let layout = FileLayout::from_parameters(parameters);
    info!(file = ?output_file, layout = ?layout, channels = channels.len(), "Writing output file");

    let mut writer = ContainerWriter::create(output_file)?;
    write_general(&mut writer, parameters)?;

    match layout {
        FileLayout::Extended => write_extended(&mut writer, channels, error_if_no_data)?,
        FileLayout::Compact => write_compact(&mut writer, channels, error_if_no_data)?,
    }

    writer.finish()
}

/// The four `/general` parameter strings.
fn write_general(writer: &mut ContainerWriter, parameters: &Map<String, Value>) -> Result<()> {
    for key in ["created", "instrument", "process", "user"] {
        let value = parameters
            .get(&format!("general/{key}"))
            .and_then(Value::as_str)
            .unwrap_or("");
        writer.write_string_scalar(&format!("/general/{key}"), value)?;
    }
    Ok(())
}

// ─────────────────────────────── extended ────────────────────────────────────

fn write_extended(
    writer: &mut ContainerWriter,
    channels: &[ChannelData],
    error_if_no_data: bool,
) -> Result<()> {
    // Union of observed pulse ids across all channels, ascending.
    let mut union: Vec<u64> = channels
        .iter()
        .flat_map(|c| c.data.iter().map(|e| e.pulse_id))
        .collect();
    union.sort_unstable();
    union.dedup();

    let index: HashMap<u64, usize> = union
        .iter()
        .enumerate()
        .map(|(i, pid)| (*pid, i))
        .collect();
    let n = union.len();
    let pulse_ids: Vec<i64> = union.iter().map(|p| *p as i64).collect();

    for channel in channels {
        let name = &channel.channel.name;
        check_no_data(channel, error_if_no_data)?;

        let def = ChannelDefinition::resolve(channel);
        let group = format!("/data/{name}");

        let mut presence = vec![0u8; n];
        let mut dates = vec![String::new(); n];

        match def.dtype {
            DType::Str => {
                let mut values = vec![String::new(); n * def.row_elems];
                for event in &channel.data {
                    let Some(&row) = index.get(&event.pulse_id) else { continue };
                    fill_string_row(&mut values[row * def.row_elems..][..def.row_elems], event);
                    mark(&mut presence, &mut dates, row, event);
                }
                writer.write_dataset(
                    &format!("{group}/data"),
                    DType::Str,
                    &def.dims(n),
                    &encode_strings(&values),
                )?;
            }
            dtype => {
                let row_bytes = def.row_elems * fixed_elem_size(dtype);
                let mut payload = vec![0u8; n * row_bytes];
                for event in &channel.data {
                    let Some(&row) = index.get(&event.pulse_id) else { continue };
                    fill_numeric_row(&mut payload[row * row_bytes..][..row_bytes], dtype, event);
                    mark(&mut presence, &mut dates, row, event);
                }
                writer.write_dataset(&format!("{group}/data"), dtype, &def.dims(n), &payload)?;
            }
        }

        writer.write_i64s(&format!("{group}/pulse_id"), &pulse_ids)?;
        writer.write_bools(&format!("{group}/is_data_present"), &presence)?;
        writer.write_strings(&format!("{group}/global_date"), &dates)?;
    }

    Ok(())
}

// ─────────────────────────────── compact ─────────────────────────────────────

fn write_compact(
    writer: &mut ContainerWriter,
    channels: &[ChannelData],
    error_if_no_data: bool,
) -> Result<()> {
    for channel in channels {
        let name = &channel.channel.name;
        check_no_data(channel, error_if_no_data)?;

        let def = ChannelDefinition::resolve(channel);
        let group = format!("/data/{name}");
        let n = channel.data.len();

        let pulse_ids: Vec<i64> = channel.data.iter().map(|e| e.pulse_id as i64).collect();
        let presence = vec![1u8; n];
        let dates: Vec<String> = channel
            .data
            .iter()
            .map(|e| e.global_date.clone().unwrap_or_default())
            .collect();

        match def.dtype {
            DType::Str => {
                let mut values = vec![String::new(); n * def.row_elems];
                for (row, event) in channel.data.iter().enumerate() {
                    fill_string_row(&mut values[row * def.row_elems..][..def.row_elems], event);
                }
                writer.write_dataset(
                    &format!("{group}/data"),
                    DType::Str,
                    &def.dims(n),
                    &encode_strings(&values),
                )?;
            }
            dtype => {
                let row_bytes = def.row_elems * fixed_elem_size(dtype);
                let mut payload = vec![0u8; n * row_bytes];
                for (row, event) in channel.data.iter().enumerate() {
                    fill_numeric_row(&mut payload[row * row_bytes..][..row_bytes], dtype, event);
                }
                writer.write_dataset(&format!("{group}/data"), dtype, &def.dims(n), &payload)?;
            }
        }

        writer.write_i64s(&format!("{group}/pulse_id"), &pulse_ids)?;
        writer.write_bools(&format!("{group}/is_data_present"), &presence)?;
        writer.write_strings(&format!("{group}/global_date"), &dates)?;
    }

    Ok(())
}

// ─────────────────────────────── helpers ─────────────────────────────────────

fn check_no_data(channel: &ChannelData, error_if_no_data: bool) -> Result<()> {
    if channel.data.is_empty() {
        if error_if_no_data {
            return Err(DaqError::Retrieval(format!(
                "channel '{}' returned no events",
                channel.channel.name
            )));
        }
        warn!(channel = channel.channel.name, "Channel returned no events");
    }
    Ok(())
}

/// Resolved dtype and declared shape of one channel.
struct ChannelDefinition {
    dtype: DType,
    /// bsread-declared shape, e.g. `[1]` or `[1024]` or `[width, height]`.
    declared_shape: Vec<u64>,
    row_elems: usize,
}

impl ChannelDefinition {
    fn resolve(channel: &ChannelData) -> Self {
        let config = channel.configs.first();
        let dtype = DType::from_bsread(
            config.and_then(|c| c.channel_type.as_deref()),
        );

        let declared_shape = config
            .and_then(|c| c.shape.clone())
            .or_else(|| channel.data.iter().find_map(|e| e.shape.clone()))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| vec![1]);

        let row_elems = declared_shape.iter().product::<u64>() as usize;

        Self {
            dtype,
            declared_shape,
            row_elems,
        }
    }

    /// Dataset dims: leading event axis plus the declared shape reversed.
    fn dims(&self, rows: usize) -> Vec<u64> {
        let mut dims = Vec::with_capacity(1 + self.declared_shape.len());
        dims.push(rows as u64);
        dims.extend(self.declared_shape.iter().rev());
        dims
    }
}

fn mark(presence: &mut [u8], dates: &mut [String], row: usize, event: &ChannelEvent) {
    presence[row] = 1;
    if let Some(date) = &event.global_date {
        dates[row] = date.clone();
    }
}

/// Flatten a (possibly nested) JSON value into its scalar leaves.
fn flatten<'a>(value: &'a Value, out: &mut Vec<&'a Value>) {
    match value {
        Value::Array(items) => {
            for item in items {
                flatten(item, out);
            }
        }
        other => out.push(other),
    }
}

/// Element size of the fixed-width dtypes; strings never take this path.
fn fixed_elem_size(dtype: DType) -> usize {
    dtype.size().unwrap_or(0)
}

fn fill_numeric_row(row: &mut [u8], dtype: DType, event: &ChannelEvent) {
    let mut leaves = Vec::new();
    flatten(&event.value, &mut leaves);

    let elem_size = fixed_elem_size(dtype);
    for (i, leaf) in leaves.iter().enumerate() {
        let Some(slot) = row.get_mut(i * elem_size..(i + 1) * elem_size) else {
            warn!("event value holds more elements than the declared shape");
            break;
        };
        encode_scalar(slot, dtype, leaf);
    }
}

fn fill_string_row(row: &mut [String], event: &ChannelEvent) {
    let mut leaves = Vec::new();
    flatten(&event.value, &mut leaves);

    for (slot, leaf) in row.iter_mut().zip(leaves) {
        *slot = match leaf {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
    }
}

fn encode_scalar(out: &mut [u8], dtype: DType, value: &Value) {
    match dtype {
        DType::U8 => out[0] = value.as_u64().unwrap_or(0) as u8,
        DType::U16 => LittleEndian::write_u16(out, value.as_u64().unwrap_or(0) as u16),
        DType::U32 => LittleEndian::write_u32(out, value.as_u64().unwrap_or(0) as u32),
        DType::U64 => LittleEndian::write_u64(out, value.as_u64().unwrap_or(0)),
        DType::I8 => out[0] = value.as_i64().unwrap_or(0) as u8,
        DType::I16 => LittleEndian::write_i16(out, value.as_i64().unwrap_or(0) as i16),
        DType::I32 => LittleEndian::write_i32(out, value.as_i64().unwrap_or(0) as i32),
        DType::I64 => LittleEndian::write_i64(out, value.as_i64().unwrap_or(0)),
        DType::F32 => LittleEndian::write_f32(out, value.as_f64().unwrap_or(0.0) as f32),
        DType::F64 => LittleEndian::write_f64(out, value.as_f64().unwrap_or(0.0)),
        DType::Bool => out[0] = value.as_bool().map(u8::from).unwrap_or(0),
        // Strings take the string path and never land here.
        DType::Str => {}
    }
}
