// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Scan manifest — append-only per-scan step journal.
//!
//! Each acquisition that carries `scan_info` appends one step to
//! `<raw>/scan_info/<scan_name>.json`: its readbacks, set values, raw
//! readbacks, step info, output file list and the `[start, stop]` pulse-id
//! pair. The read-modify-write runs under a per-scan advisory lock so
//! concurrent retrieve calls on the same scan serialize.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use fd_lock::RwLock;
use serde_json::{json, Map, Value};
use tracing::info;

use crate::error::{DaqError, Result};

const STEP_FIELDS: &[&str] = &[
    "scan_readbacks",
    "scan_values",
    "scan_readbacks_raw",
    "scan_step_info",
];

/// Append one scan step. Returns the manifest path.
pub fn append_scan_step(
    raw_dir: &Path,
    scan_info: &Map<String, Value>,
    scan_files: Vec<String>,
    start_pulseid: u64,
    stop_pulseid: u64,
) -> Result<PathBuf> {
    let scan_name = scan_info
        .get("scan_name")
        .and_then(Value::as_str)
        .ok_or_else(|| DaqError::Validation("scan_info carries no scan_name".into()))?;

    let scan_dir = raw_dir.join("scan_info");
    std::fs::create_dir_all(&scan_dir)?;
    let path = scan_dir.join(format!("{scan_name}.json"));

    let lock_file = File::create(scan_dir.join(format!("{scan_name}.json.lock")))?;
    let mut lock = RwLock::new(lock_file);
    let _guard = lock
        .write()
        .map_err(|e| DaqError::Io(std::io::Error::other(format!("scan lock: {e}"))))?;

    let mut manifest = read_manifest(&path)?;

    // Motor identity is set by the first step and never rewritten.
    if manifest.get("scan_parameters").is_none_or(Value::is_null) {
        manifest.insert(
            "scan_parameters".to_string(),
            scan_info.get("scan_parameters").cloned().unwrap_or(Value::Null),
        );
    }

    for field in STEP_FIELDS {
        push_step(&mut manifest, field, scan_info.get(*field).cloned().unwrap_or(Value::Null));
    }
    push_step(&mut manifest, "scan_files", Value::Array(
        scan_files.into_iter().map(Value::String).collect(),
    ));
    push_step(&mut manifest, "pulseIds", json!([start_pulseid, stop_pulseid]));

    let tmp_path = path.with_extension("json.tmp");
    {
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(serde_json::to_string_pretty(&manifest).unwrap_or_default().as_bytes())?;
        tmp.sync_all()?;
    }
    std::fs::rename(&tmp_path, &path)?;

    info!(scan = scan_name, path = ?path, "Scan step appended");
    Ok(path)
}

fn read_manifest(path: &Path) -> Result<Map<String, Value>> {
    match std::fs::read_to_string(path) {
        Ok(content) => serde_json::from_str::<Map<String, Value>>(&content)
            .map_err(|e| DaqError::Validation(format!("scan manifest {path:?} is not valid JSON: {e}"))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Map::new()),
        Err(e) => Err(e.into()),
    }
}

fn push_step(manifest: &mut Map<String, Value>, field: &str, value: Value) {
    match manifest.get_mut(field) {
        Some(Value::Array(steps)) => steps.push(value),
        _ => {
            manifest.insert(field.to_string(), Value::Array(vec![value]));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_info(readback: f64) -> Map<String, Value> {
        let value = json!({
            "scan_name": "motor_sweep",
            "scan_parameters": {"Id": ["MOTOR_X"], "name": ["x"], "offset": [0.0]},
            "scan_readbacks": [readback],
            "scan_values": [readback],
            "scan_readbacks_raw": [readback * 1000.0],
            "scan_step_info": {"step": readback},
        });
        value.as_object().expect("object").clone()
    }

    #[test]
    fn steps_accumulate_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");

        let path = append_scan_step(
            dir.path(),
            &scan_info(0.1),
            vec!["run_000001.BSREAD.h5".into()],
            100,
            200,
        )
        .expect("first step");
        append_scan_step(
            dir.path(),
            &scan_info(0.2),
            vec!["run_000002.BSREAD.h5".into()],
            300,
            400,
        )
        .expect("second step");

        let manifest: Map<String, Value> =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("json");

        assert_eq!(manifest["scan_files"].as_array().expect("files").len(), 2);
        assert_eq!(manifest["pulseIds"], json!([[100, 200], [300, 400]]));
        assert_eq!(manifest["scan_readbacks"], json!([[0.1], [0.2]]));
        // Identity of the scanned motor comes from the first step only.
        assert_eq!(manifest["scan_parameters"]["Id"], json!(["MOTOR_X"]));
    }

    #[test]
    fn missing_scan_name_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = append_scan_step(dir.path(), &Map::new(), vec![], 0, 1).unwrap_err();
        assert!(err.to_string().contains("scan_name"));
    }
}
