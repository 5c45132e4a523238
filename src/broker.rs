// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Broker manager — orchestrates the acquisition lifecycle.
//!
//! Two entry styles:
//!  - interactive `set_parameters → start_writer → stop_writer`, driven by a
//!    beamline session through the REST facade;
//!  - one-shot `retrieve`, driven by an authenticated console request, which
//!    allocates a run, persists the manifest and fans out one write request
//!    per sink (bsread, cameras, PVs, detectors).
//!
//! Every dispatched write request is appended to the audit trail before it
//! is enqueued.

use std::path::PathBuf;

use chrono::Local;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{error, info, warn};

use crate::audit::audit_write_request;
use crate::channels::ChannelRoster;
use crate::config::{beamline_for_ip, BrokerSettings, REQUEST_TIME_FORMAT, REQUIRED_PARAMETERS};
use crate::detector::spawn_detector_retrieval;
use crate::error::{DaqError, Result};
use crate::pulse;
use crate::registry::RunRegistry;
use crate::request::{get_writer_request, split_write_request, AcquisitionRequest, WriteRequest};
use crate::scan::append_scan_step;
use crate::sender::SenderHandle;

/// Reply of the one-shot retrieve entry point.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RetrieveOutcome {
    pub status: &'static str,
    pub message: String,
}

impl RetrieveOutcome {
    fn ok(run_number: u64) -> Self {
        Self { status: "ok", message: run_number.to_string() }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self { status: "failed", message: message.into() }
    }

    fn pass(message: impl Into<String>) -> Self {
        Self { status: "pass", message: message.into() }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BrokerStatistics {
    pub n_processed_requests: u64,
    pub process_startup_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sent_write_request: Option<WriteRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sent_write_request_time: Option<String>,
}

pub struct BrokerManager {
    settings: BrokerSettings,
    roster: ChannelRoster,
    sender: SenderHandle,
    audit_trail_only: bool,

    current_parameters: Option<Map<String, Value>>,
    current_start_pulse_id: Option<u64>,
    last_stop_pulse_id: Option<u64>,

    statistics: BrokerStatistics,
}

impl BrokerManager {
    pub fn new(
        settings: BrokerSettings,
        roster: ChannelRoster,
        sender: SenderHandle,
        audit_trail_only: bool,
    ) -> Self {
        info!(audit_file = ?settings.audit_file, "Writing requests audit log");
        info!(channels = roster.channels().len(), "Starting broker manager");
        if audit_trail_only {
            info!("Starting broker manager with audit_trail_only");
        }

        Self {
            settings,
            roster,
            sender,
            audit_trail_only,
            current_parameters: None,
            current_start_pulse_id: None,
            last_stop_pulse_id: None,
            statistics: BrokerStatistics {
                n_processed_requests: 0,
                process_startup_time: Local::now().format(REQUEST_TIME_FORMAT).to_string(),
                last_sent_write_request: None,
                last_sent_write_request_time: None,
            },
        }
    }

    // ──────────────── interactive session ─────────────────────────────────

    pub fn set_parameters(&mut self, parameters: Map<String, Value>) -> Result<()> {
        let missing = REQUIRED_PARAMETERS
            .iter()
            .any(|key| !parameters.contains_key(*key));
        if missing {
            return Err(DaqError::MissingRequiredParameter {
                required: REQUIRED_PARAMETERS.iter().map(|s| s.to_string()).collect(),
                received: parameters.keys().cloned().collect(),
            });
        }

        self.current_parameters = Some(parameters);
        Ok(())
    }

    pub fn get_parameters(&self) -> Option<&Map<String, Value>> {
        self.current_parameters.as_ref()
    }

    pub fn get_status(&self) -> &'static str {
        if self.current_start_pulse_id.is_some() && self.current_parameters.is_some() {
            return "receiving";
        }
        if self.current_parameters.is_some() {
            return "configured";
        }
        "stopped"
    }

    pub fn get_statistics(&self) -> &BrokerStatistics {
        &self.statistics
    }

    /// Reset to stopped without emitting a write request.
    pub fn stop(&mut self) {
        info!("Stopping broker session");
        self.current_parameters = None;
        self.current_start_pulse_id = None;
    }

    pub fn start_writer(&mut self, start_pulse_id: u64) {
        if let Some(current) = self.current_start_pulse_id {
            // The same start pulse id can be posted multiple times.
            if current == start_pulse_id {
                return;
            }

            warn!(
                current_start_pulse_id = current,
                new_start_pulse_id = start_pulse_id,
                "Previous acquisition was still running. The previous run will not be processed."
            );
        }

        info!(start_pulse_id, "Set start_pulse_id");
        self.current_start_pulse_id = Some(start_pulse_id);
    }

    /// Close the acquisition window and emit the write request(s).
    pub async fn stop_writer(&mut self, stop_pulse_id: u64) {
        let Some(start_pulse_id) = self.current_start_pulse_id else {
            // Multiple stop requests with the same pulse id are allowed.
            if self.last_stop_pulse_id == Some(stop_pulse_id) {
                return;
            }
            warn!(stop_pulse_id, "No acquisition started. Ignoring stop request.");
            return;
        };
        let Some(parameters) = self.current_parameters.take() else {
            warn!(stop_pulse_id, "No parameters configured. Ignoring stop request.");
            return;
        };

        info!(stop_pulse_id, "Set stop_pulse_id");

        if let Err(e) = self.roster.refresh() {
            warn!(error = %e, "Channel roster refresh failed, using the previous list");
        }

        let write_request = get_writer_request(
            self.roster.channels(),
            &parameters,
            start_pulse_id,
            stop_pulse_id,
            &self.settings.data_backend,
            &self.settings.image_backend,
        );

        self.current_start_pulse_id = None;
        self.last_stop_pulse_id = Some(stop_pulse_id);

        let parts = if self.settings.separate_camera_channels {
            split_write_request(write_request.clone(), self.settings.group_camera_channels)
        } else {
            vec![write_request.clone()]
        };

        // Notify the epics writer once per acquisition, on the first emission.
        for (i, part) in parts.into_iter().enumerate() {
            self.process_write_request(part, i == 0).await;
        }

        self.statistics.last_sent_write_request = Some(write_request);
        self.statistics.last_sent_write_request_time =
            Some(Local::now().format(REQUEST_TIME_FORMAT).to_string());
        self.statistics.n_processed_requests += 1;
    }

    async fn process_write_request(&mut self, request: WriteRequest, forward_to_epics: bool) {
        audit_write_request(&self.settings.audit_file, &request);

        if self.audit_trail_only {
            warn!("Writing request to audit trail only (broker running with --audit-trail-only).");
            return;
        }

        self.sender.send(request, forward_to_epics).await;
    }

    // ──────────────── one-shot retrieve ───────────────────────────────────

    /// Retrieve an acquisition window from the facility buffers.
    ///
    /// Validation and filesystem failures return `status: "failed"`;
    /// a request without data selectors short-circuits with `"pass"`.
    /// After run allocation, detector spawns and the scan-info merge are
    /// best effort and cannot fail the call.
    pub async fn retrieve(
        &mut self,
        body: &Value,
        remote_ip: &str,
        beamline_force: Option<&str>,
    ) -> RetrieveOutcome {
        let beamline = match beamline_force {
            Some(beamline) => beamline.to_string(),
            None => match beamline_for_ip(remote_ip) {
                Some(beamline) => beamline.to_string(),
                None => {
                    return RetrieveOutcome::failed(format!(
                        "can not determine from which beamline the request came from (ip {remote_ip})"
                    ));
                }
            },
        };

        let request = match AcquisitionRequest::parse(body) {
            Ok(request) => request,
            Err(e) => return RetrieveOutcome::failed(e.to_string()),
        };

        let raw_dir = self
            .settings
            .data_root
            .join(&beamline)
            .join("data")
            .join(&request.pgroup)
            .join("raw");
        let registry = RunRegistry::new(&raw_dir, &request.pgroup);
        if let Err(e) = registry.ensure_open() {
            return RetrieveOutcome::failed(e.to_string());
        }

        if !request.has_data_selector() {
            return RetrieveOutcome::pass("no data source requested, nothing to do".to_string());
        }

        let channels_list = request.channels_list.clone().map(|mut list| {
            list.sort();
            list.dedup();
            list
        });

        let run_number = match registry.allocate() {
            Ok(run_number) => run_number,
            Err(e) => return RetrieveOutcome::failed(e.to_string()),
        };

        let output_dir = match &request.directory_name {
            Some(directory) => raw_dir.join(directory),
            None => raw_dir.clone(),
        };
        let output_file = |selector: &str| -> PathBuf {
            output_dir.join(format!("run_{run_number:06}.{selector}.h5"))
        };

        let mut output_files: Vec<PathBuf> = Vec::new();
        if request.pv_list.is_some() {
            output_files.push(output_file("PVCHANNELS"));
        }
        if channels_list.is_some() {
            output_files.push(output_file("BSREAD"));
        }
        if request.camera_list.is_some() {
            output_files.push(output_file("CAMERAS"));
        }
        if let Some(detectors) = &request.detectors {
            for detector in detectors.keys() {
                output_files.push(output_file(detector));
            }
        }

        // Manifest: the request verbatim, enriched. Written once, never mutated.
        let mut manifest = body.as_object().cloned().unwrap_or_default();
        manifest.insert("beamline".into(), Value::String(beamline.clone()));
        manifest.insert("run_number".into(), Value::from(run_number));
        manifest.insert(
            "request_time".into(),
            Value::String(Local::now().format(REQUEST_TIME_FORMAT).to_string()),
        );
        if let Some(channels) = &channels_list {
            manifest.insert("channels_list".into(), serde_json::json!(channels));
        }
        manifest.insert(
            "output_files".into(),
            serde_json::json!(output_files
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect::<Vec<_>>()),
        );

        let manifest_path = match registry.write_manifest(run_number, &Value::Object(manifest)) {
            Ok(path) => path,
            Err(e) => return RetrieveOutcome::failed(e.to_string()),
        };

        // The dispatching layer range is widened so aligned boundaries sit
        // strictly inside the half-open window.
        let (start, stop) = pulse::expand(
            request.start_pulseid,
            request.stop_pulseid,
            request.rate_multiplicator,
        );

        let mut parameters = Map::new();
        parameters.insert(
            "general/created".into(),
            Value::String(Local::now().format(REQUEST_TIME_FORMAT).to_string()),
        );
        parameters.insert(
            "general/user".into(),
            Value::String(request.pgroup[1..6].to_string()),
        );
        parameters.insert("general/process".into(), Value::String(module_path!().to_string()));
        parameters.insert("general/instrument".into(), Value::String(beamline.clone()));

        // PV channels go to the epics writer only, never through the queue.
        if let Some(pv_list) = &request.pv_list {
            let mut pv_parameters = parameters.clone();
            pv_parameters.insert(
                "output_file".into(),
                Value::String(output_file("PVCHANNELS").to_string_lossy().into_owned()),
            );
            pv_parameters.insert("channels".into(), serde_json::json!(pv_list));
            let pv_request = get_writer_request(
                pv_list,
                &pv_parameters,
                start,
                stop,
                &self.settings.data_backend,
                &self.settings.image_backend,
            );
            audit_write_request(&self.settings.audit_file, &pv_request);
            self.sender.forward_to_epics(&pv_request);
        }

        // Queue emissions in fixed order: BSREAD before CAMERAS.
        if let Some(channels) = &channels_list {
            let mut bs_parameters = parameters.clone();
            bs_parameters.insert(
                "output_file".into(),
                Value::String(output_file("BSREAD").to_string_lossy().into_owned()),
            );
            let bs_request = get_writer_request(
                channels,
                &bs_parameters,
                start,
                stop,
                &self.settings.data_backend,
                &self.settings.image_backend,
            );
            self.process_write_request(bs_request, false).await;
        }

        if let Some(cameras) = &request.camera_list {
            let mut cam_parameters = parameters.clone();
            cam_parameters.insert(
                "output_file".into(),
                Value::String(output_file("CAMERAS").to_string_lossy().into_owned()),
            );
            let cam_request = get_writer_request(
                cameras,
                &cam_parameters,
                start,
                stop,
                &self.settings.data_backend,
                &self.settings.image_backend,
            );
            self.process_write_request(cam_request, false).await;
        }

        // Detector exports run as detached subprocesses; failures are logged
        // and do not fail the acquisition.
        if let Some(detectors) = &request.detectors {
            match pulse::aligned_bounds(
                request.start_pulseid,
                request.stop_pulseid,
                request.rate_multiplicator,
            ) {
                Some((det_start, det_stop)) => {
                    for (detector, options) in detectors {
                        let raw_file = raw_dir
                            .join("RAW_DATA")
                            .join(request.directory_name.as_deref().unwrap_or(""))
                            .join(format!("run_{run_number:06}.{detector}.h5"));
                        if let Err(e) = spawn_detector_retrieval(
                            &self.settings.detector_command,
                            detector,
                            options,
                            det_start,
                            det_stop,
                            &output_file(detector),
                            request.rate_multiplicator,
                            &manifest_path,
                            &raw_file,
                            &registry.detector_log_path(run_number, detector),
                        ) {
                            error!(detector, error = %e, "Detector retrieval spawn failed");
                        }
                    }
                }
                None => warn!("No beam-aligned pulses in range, detectors skipped"),
            }
        }

        if let Some(scan_info) = request.scan_info.as_ref().and_then(Value::as_object) {
            let files: Vec<String> = output_files
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect();
            if let Err(e) = append_scan_step(
                &raw_dir,
                scan_info,
                files,
                request.start_pulseid,
                request.stop_pulseid,
            ) {
                error!(error = %e, "Scan info merge failed");
            }
        }

        self.statistics.n_processed_requests += 1;
        RetrieveOutcome::ok(run_number)
    }
}
