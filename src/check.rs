// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Consistency checker — verifies produced files against a run manifest.
//!
//! Reconstructs the expected beam-aligned pulse-id sequence from the
//! manifest and checks, per selector file, that the file exists, every
//! requested channel is present, the pulse-id axis has the expected count
//! and boundaries with no gaps, and detector frames are readable.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{Map, Value};

use crate::pulse::enumerate_aligned;
use crate::storage::container::ContainerFile;

/// Outcome of one consistency check.
#[derive(Debug, Serialize)]
pub struct CheckReport {
    pub check: bool,
    pub reason: CheckReason,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum CheckReason {
    Summary(String),
    Problems(Vec<String>),
}

impl CheckReport {
    fn passed() -> Self {
        Self {
            check: true,
            reason: CheckReason::Summary("all tests passed".to_string()),
        }
    }

    fn failed(problems: Vec<String>) -> Self {
        Self {
            check: false,
            reason: CheckReason::Problems(problems),
        }
    }

    pub fn problems(&self) -> Vec<String> {
        match &self.reason {
            CheckReason::Summary(_) => Vec::new(),
            CheckReason::Problems(problems) => problems.clone(),
        }
    }
}

/// Check one run. `rate_multiplicator_override` of 0 or `None` defers to the
/// manifest; `data_root` is `/sf` in production.
pub fn check_consistency(
    run_file: &Path,
    rate_multiplicator_override: Option<u64>,
    data_root: &Path,
) -> CheckReport {
    let mut problems = Vec::new();

    let content = match std::fs::read_to_string(run_file) {
        Ok(content) => content,
        Err(_) => {
            problems.push(format!("{} does not exist", run_file.display()));
            return CheckReport::failed(problems);
        }
    };
    let manifest: Map<String, Value> = match serde_json::from_str(&content) {
        Ok(manifest) => manifest,
        Err(_) => {
            problems.push("Can't read provided run file, may be not json?".to_string());
            return CheckReport::failed(problems);
        }
    };

    let required_u64 = |key: &str, problems: &mut Vec<String>| -> Option<u64> {
        let value = manifest.get(key).and_then(Value::as_u64);
        if value.is_none() {
            problems.push(format!("run file carries no usable '{key}'"));
        }
        value
    };

    let Some(start_pulse_id) = required_u64("start_pulseid", &mut problems) else {
        return CheckReport::failed(problems);
    };
    let Some(stop_pulse_id) = required_u64("stop_pulseid", &mut problems) else {
        return CheckReport::failed(problems);
    };
    let Some(run_number) = required_u64("run_number", &mut problems) else {
        return CheckReport::failed(problems);
    };

    let rate_multiplicator = match rate_multiplicator_override {
        Some(rate) if rate > 0 => rate,
        _ => manifest
            .get("rate_multiplicator")
            .and_then(Value::as_u64)
            .unwrap_or(1),
    };

    let (Some(pgroup), Some(beamline)) = (
        manifest.get("pgroup").and_then(Value::as_str),
        manifest.get("beamline").and_then(Value::as_str),
    ) else {
        problems.push("run file carries no pgroup/beamline".to_string());
        return CheckReport::failed(problems);
    };

    let mut full_directory = data_root
        .join(beamline)
        .join("data")
        .join(pgroup)
        .join("raw");
    if let Some(directory) = manifest.get("directory_name").and_then(Value::as_str) {
        full_directory = full_directory.join(directory);
    }

    let expected = enumerate_aligned(start_pulse_id, stop_pulse_id, rate_multiplicator);
    let selector_file = |selector: &str| -> PathBuf {
        full_directory.join(format!("run_{run_number:06}.{selector}.h5"))
    };

    if let Some(channels) = manifest.get("channels_list").and_then(Value::as_array) {
        check_series_file(
            &selector_file("BSREAD"),
            "bsread",
            channels.iter().filter_map(Value::as_str),
            &expected,
            rate_multiplicator,
            &mut problems,
        );
    }

    if let Some(cameras) = manifest.get("camera_list").and_then(Value::as_array) {
        check_series_file(
            &selector_file("CAMERAS"),
            "camera",
            cameras.iter().filter_map(Value::as_str),
            &expected,
            rate_multiplicator,
            &mut problems,
        );
    }

    if let Some(detectors) = manifest.get("detectors").and_then(Value::as_object) {
        for detector in detectors.keys() {
            check_detector_file(&selector_file(detector), detector, &expected, &mut problems);
        }
    }

    if problems.is_empty() {
        CheckReport::passed()
    } else {
        CheckReport::failed(problems)
    }
}

// ──────────────── per-file checks ─────────────────────────────────────────

fn check_series_file<'a>(
    path: &Path,
    kind: &str,
    requested: impl Iterator<Item = &'a str>,
    expected: &[u64],
    rate_multiplicator: u64,
    problems: &mut Vec<String>,
) {
    if !path.exists() {
        problems.push(format!("{kind} file {} does not exist", path.display()));
        return;
    }

    let file = match ContainerFile::open(path) {
        Ok(file) => file,
        Err(_) => {
            problems.push(format!(
                "Can not read from {kind} file {} may be too early",
                path.display()
            ));
            return;
        }
    };

    let present = file.group_children("/data");

    for channel in requested {
        if !present.iter().any(|name| name == channel) {
            problems.push(format!(
                "{kind} channel {channel} requested but not present in {kind} file"
            ));
            continue;
        }

        check_channel_series(&file, channel, expected, rate_multiplicator, problems);

        // Every recorded frame of the data dataset must be readable.
        let n_rows = file
            .dataset(&format!("/data/{channel}/pulse_id"))
            .map(|d| d.rows())
            .unwrap_or(0);
        match file.dataset(&format!("/data/{channel}/data")) {
            Some(data) if data.rows() != n_rows => problems.push(format!(
                "{channel} data rows differ from pulse_id entries: {} vs {n_rows}",
                data.rows()
            )),
            Some(_) => {}
            None => problems.push(format!("{channel} has no data dataset")),
        }
    }
}

/// Presence-filtered aligned pulse ids of one channel against the expectation.
fn check_channel_series(
    file: &ContainerFile,
    channel: &str,
    expected: &[u64],
    rate_multiplicator: u64,
    problems: &mut Vec<String>,
) {
    let group = format!("/data/{channel}");

    let raw_pulse_ids = match file.dataset(&format!("{group}/pulse_id")).map(|d| d.as_i64()) {
        Some(Ok(pids)) => pids,
        _ => {
            problems.push(format!("{channel} has no readable pulse_id dataset"));
            return;
        }
    };
    let presence = match file
        .dataset(&format!("{group}/is_data_present"))
        .map(|d| d.as_u8())
    {
        Some(Ok(presence)) => presence,
        _ => vec![1u8; raw_pulse_ids.len()],
    };

    let pulse_ids: Vec<u64> = raw_pulse_ids
        .iter()
        .zip(presence.iter().chain(std::iter::repeat(&0)))
        .filter(|(pid, &present)| present != 0 && **pid as u64 % rate_multiplicator == 0)
        .map(|(pid, _)| *pid as u64)
        .collect();

    if pulse_ids.len() != expected.len() {
        problems.push(format!(
            "{channel} number of pulse_id is different from expected : {} vs {}",
            pulse_ids.len(),
            expected.len()
        ));
        return;
    }
    if expected.is_empty() {
        return;
    }

    if pulse_ids[0] != expected[0] || pulse_ids[pulse_ids.len() - 1] != expected[expected.len() - 1]
    {
        problems.push(format!(
            "{channel} start/stop pulse_id are not the one which are requested \
             (requested: {},{}, got: {},{})",
            expected[0],
            expected[expected.len() - 1],
            pulse_ids[0],
            pulse_ids[pulse_ids.len() - 1]
        ));
    }

    if pulse_ids != expected {
        problems.push(format!("{channel} pulse_id are not monotonic"));
    }
}

fn check_detector_file(path: &Path, detector: &str, expected: &[u64], problems: &mut Vec<String>) {
    if !path.exists() {
        problems.push(format!("detector file {} does not exist", path.display()));
        return;
    }

    let file = match ContainerFile::open(path) {
        Ok(file) => file,
        Err(_) => {
            problems.push(format!(
                "Can not read from detector file {} may be too early",
                path.display()
            ));
            return;
        }
    };

    let group = format!("/data/{detector}");
    let pulse_ids = match file.dataset(&format!("{group}/pulse_id")).map(|d| d.as_i64()) {
        Some(Ok(pids)) => pids,
        _ => {
            problems.push(format!("{detector} has no readable pulse_id dataset"));
            return;
        }
    };
    let n_pulse_id = pulse_ids.len();

    // Converted data may omit the per-frame bookkeeping datasets.
    let optional_series = |name: &str, default: u8| -> Vec<u8> {
        match file.dataset(&format!("{group}/{name}")) {
            Some(dataset) => dataset.as_u8().unwrap_or_else(|_| {
                // Non-byte dtype: only its length matters here.
                vec![default; dataset.rows() as usize]
            }),
            None => vec![default; n_pulse_id],
        }
    };
    let frame_index = optional_series("frame_index", 0);
    let is_good_frame = optional_series("is_good_frame", 1);
    let daq_rec = optional_series("daq_rec", 0);

    if frame_index.len() != n_pulse_id
        || is_good_frame.len() != n_pulse_id
        || daq_rec.len() != n_pulse_id
    {
        problems.push(format!(
            "{detector} length of frame_index,is_good_frame,daq_rec is not consistent with pulse_id"
        ));
    }

    if n_pulse_id != expected.len() {
        problems.push(format!(
            "{detector} number of pulse_id is different from expected : {n_pulse_id} vs {}",
            expected.len()
        ));
        return;
    }
    if expected.is_empty() {
        return;
    }

    if pulse_ids[0] as u64 != expected[0]
        || pulse_ids[n_pulse_id - 1] as u64 != expected[expected.len() - 1]
    {
        problems.push(format!(
            "{detector} start/stop pulse_id are not the one which are requested"
        ));
    }

    let n_frames_bad = is_good_frame.iter().filter(|&&good| good != 1).count();
    if n_frames_bad != 0 {
        problems.push(format!(
            "{detector} there are bad frames : {n_frames_bad} out of {n_pulse_id}"
        ));
    }

    let sequence_ok = pulse_ids
        .iter()
        .zip(is_good_frame.iter())
        .zip(expected.iter())
        .filter(|((_, &good), _)| good == 1)
        .all(|((pid, _), exp)| *pid as u64 == *exp);
    if !sequence_ok {
        problems.push(format!("{detector} pulse_id are not monotonic"));
    }

    // Frames must be readable: the data dataset has one row per pulse.
    match file.dataset(&format!("{group}/data")) {
        Some(data) if data.rows() as usize != n_pulse_id => problems.push(format!(
            "{detector} {} frames (from {n_pulse_id}) missing, can not read them",
            n_pulse_id as i64 - data.rows() as i64
        )),
        Some(_) => {}
        None => problems.push(format!("{detector} has no data dataset")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::container::ContainerWriter;
    use serde_json::json;

    fn write_series_file(path: &Path, channels: &[&str], pids: &[i64], presence: &[u8]) {
        let mut writer = ContainerWriter::create(path).expect("create");
        for channel in channels {
            let group = format!("/data/{channel}");
            writer.write_i64s(&format!("{group}/pulse_id"), pids).expect("pids");
            writer
                .write_bools(&format!("{group}/is_data_present"), presence)
                .expect("mask");
            let payload = vec![0u8; pids.len() * 8];
            writer
                .write_dataset(
                    &format!("{group}/data"),
                    crate::storage::container::DType::F64,
                    &[pids.len() as u64, 1],
                    &payload,
                )
                .expect("data");
        }
        writer.finish().expect("finish");
    }

    fn manifest(dir: &Path, body: Value) -> PathBuf {
        let path = dir.join("run_000007.json");
        std::fs::write(&path, serde_json::to_string(&body).expect("json")).expect("write");
        path
    }

    #[test]
    fn complete_file_passes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let raw = dir.path().join("alvra/data/p12345/raw");
        std::fs::create_dir_all(&raw).expect("raw dir");

        let pids: Vec<i64> = (0..51).map(|i| 100 + 2 * i).collect();
        write_series_file(
            &raw.join("run_000007.BSREAD.h5"),
            &["CH1", "CH2"],
            &pids,
            &vec![1u8; pids.len()],
        );

        let run_file = manifest(
            dir.path(),
            json!({
                "pgroup": "p12345",
                "beamline": "alvra",
                "run_number": 7,
                "start_pulseid": 100,
                "stop_pulseid": 200,
                "rate_multiplicator": 2,
                "channels_list": ["CH1", "CH2"],
            }),
        );

        let report = check_consistency(&run_file, None, dir.path());
        assert!(report.check, "problems: {:?}", report.problems());
    }

    #[test]
    fn missing_channel_and_short_axis_are_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let raw = dir.path().join("alvra/data/p12345/raw");
        std::fs::create_dir_all(&raw).expect("raw dir");

        // CH2 requested but absent; CH1 axis too short (gap at the end).
        let pids: Vec<i64> = (0..50).map(|i| 100 + 2 * i).collect();
        write_series_file(
            &raw.join("run_000007.BSREAD.h5"),
            &["CH1"],
            &pids,
            &vec![1u8; pids.len()],
        );

        let run_file = manifest(
            dir.path(),
            json!({
                "pgroup": "p12345",
                "beamline": "alvra",
                "run_number": 7,
                "start_pulseid": 100,
                "stop_pulseid": 200,
                "rate_multiplicator": 2,
                "channels_list": ["CH1", "CH2"],
            }),
        );

        let report = check_consistency(&run_file, None, dir.path());
        assert!(!report.check);
        let problems = report.problems();
        assert!(problems.iter().any(|p| p.contains("CH2") && p.contains("not present")));
        assert!(problems.iter().any(|p| p.contains("CH1") && p.contains("50 vs 51")));
    }

    #[test]
    fn missing_file_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("alvra/data/p12345/raw")).expect("raw dir");

        let run_file = manifest(
            dir.path(),
            json!({
                "pgroup": "p12345",
                "beamline": "alvra",
                "run_number": 7,
                "start_pulseid": 100,
                "stop_pulseid": 104,
                "camera_list": ["CAM1:FPICTURE"],
            }),
        );

        let report = check_consistency(&run_file, None, dir.path());
        assert!(!report.check);
        assert!(report.problems().iter().any(|p| p.contains("CAMERAS")));
    }

    #[test]
    fn detector_bookkeeping_lengths_checked() {
        let dir = tempfile::tempdir().expect("tempdir");
        let raw = dir.path().join("alvra/data/p12345/raw");
        std::fs::create_dir_all(&raw).expect("raw dir");

        let pids: Vec<i64> = vec![100, 101, 102];
        let path = raw.join("run_000007.JF06.h5");
        let mut writer = ContainerWriter::create(&path).expect("create");
        writer.write_i64s("/data/JF06/pulse_id", &pids).expect("pids");
        // Mismatched bookkeeping length and one bad frame.
        writer.write_bools("/data/JF06/is_good_frame", &[1, 0]).expect("good");
        writer
            .write_dataset(
                "/data/JF06/data",
                crate::storage::container::DType::U16,
                &[3, 2, 2],
                &vec![0u8; 3 * 4 * 2],
            )
            .expect("frames");
        writer.finish().expect("finish");

        let run_file = manifest(
            dir.path(),
            json!({
                "pgroup": "p12345",
                "beamline": "alvra",
                "run_number": 7,
                "start_pulseid": 100,
                "stop_pulseid": 102,
                "detectors": {"JF06": {}},
            }),
        );

        let report = check_consistency(&run_file, None, dir.path());
        assert!(!report.check);
        let problems = report.problems();
        assert!(problems.iter().any(|p| p.contains("not consistent with pulse_id")));
        assert!(problems.iter().any(|p| p.contains("bad frames")));
    }
}
