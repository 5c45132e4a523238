//! Detector retrieval subprocess — spawn-and-forget per-detector export.
//!
//! Large-area detector data is pulled from its buffer by an external
//! command. The broker tees the child's output to a per-run log file and
//! never waits for completion; a detached task reaps the child and logs its
//! exit status.

use std::path::Path;
use std::process::Stdio;

use serde_json::Value;
use tracing::{error, info};

use crate::error::{DaqError, Result};

/// Conversion or compression requested for this detector.
fn export_requested(options: &Value) -> bool {
    ["conversion", "compression"]
        .iter()
        .any(|key| options.get(key).and_then(Value::as_bool).unwrap_or(false))
}

/// Spawn the retrieval command for one detector.
///
/// Arguments handed to the command, in order: detector name, first and last
/// beam-aligned pulse id, output file, rate multiplier, export flag,
/// run manifest path, raw export file name.
#[allow(clippy::too_many_arguments)]
pub fn spawn_detector_retrieval(
    command: &str,
    detector: &str,
    options: &Value,
    det_start_pulseid: u64,
    det_stop_pulseid: u64,
    output_file: &Path,
    rate_multiplicator: u64,
    manifest_path: &Path,
    raw_file_name: &Path,
    log_path: &Path,
) -> Result<()> {
    let export_flag = u8::from(export_requested(options));

    let log_file = std::fs::File::create(log_path)
        .map_err(|e| DaqError::Io(std::io::Error::other(format!("detector log {log_path:?}: {e}"))))?;
    let log_file_err = log_file.try_clone()?;

    let mut child = tokio::process::Command::new(command)
        .arg(detector)
        .arg(det_start_pulseid.to_string())
        .arg(det_stop_pulseid.to_string())
        .arg(output_file)
        .arg(rate_multiplicator.to_string())
        .arg(export_flag.to_string())
        .arg(manifest_path)
        .arg(raw_file_name)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log_file))
        .stderr(Stdio::from(log_file_err))
        .spawn()
        .map_err(|e| DaqError::Io(std::io::Error::other(format!("spawn {command}: {e}"))))?;

    info!(
        detector,
        det_start_pulseid,
        det_stop_pulseid,
        log = ?log_path,
        "Detector retrieval spawned"
    );

    // Reap without blocking the acquisition path.
    let detector = detector.to_string();
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) if status.success() => {
                info!(detector, "Detector retrieval finished");
            }
            Ok(status) => {
                error!(detector, status = %status, "Detector retrieval failed");
            }
            Err(e) => {
                error!(detector, error = %e, "Cannot reap detector retrieval process");
            }
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn export_flag_tracks_conversion_and_compression() {
        assert!(!export_requested(&json!({})));
        assert!(!export_requested(&json!({"conversion": false})));
        assert!(export_requested(&json!({"conversion": true})));
        assert!(export_requested(&json!({"compression": true})));
        assert!(export_requested(&json!({"conversion": false, "compression": true})));
    }

    #[tokio::test]
    async fn spawn_tees_output_to_the_log_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log_path = dir.path().join("run_000001.JF06.log");

        spawn_detector_retrieval(
            "echo",
            "JF06",
            &json!({}),
            100,
            200,
            &dir.path().join("run_000001.JF06.h5"),
            1,
            &dir.path().join("run_000001.json"),
            &dir.path().join("RAW_DATA/run_000001.JF06.h5"),
            &log_path,
        )
        .expect("spawn");

        // Give the echo child a moment to finish and flush.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let log = std::fs::read_to_string(&log_path).expect("log exists");
        assert!(log.starts_with("JF06 100 200"), "log was: {log}");
    }

    #[test]
    fn missing_command_is_an_error() {
        let runtime = tokio::runtime::Runtime::new().expect("runtime");
        let _guard = runtime.enter();

        let dir = tempfile::tempdir().expect("tempdir");
        let result = spawn_detector_retrieval(
            "definitely-not-a-command",
            "JF06",
            &json!({}),
            0,
            1,
            &dir.path().join("out.h5"),
            1,
            &dir.path().join("run.json"),
            &dir.path().join("raw.h5"),
            &dir.path().join("log.txt"),
        );
        assert!(result.is_err());
    }
}
