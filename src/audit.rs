// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Append-only audit trail of dispatched write requests.
//!
//! Every request is journaled as `[<timestamp>] <json>` before it is handed
//! to the outbound queue. The trail is best effort: a failed append is
//! logged and swallowed so it never blocks an acquisition.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use chrono::Local;
use tracing::{error, info};

use crate::config::AUDIT_TIME_FORMAT;
use crate::request::WriteRequest;

/// Append one write request to the audit trail file.
pub fn audit_write_request(filename: &Path, write_request: &WriteRequest) {
    info!(file = ?filename, "Writing request to audit trail file");

    if let Err(e) = try_append(filename, write_request) {
        error!(file = ?filename, error = %e, "Error while appending request to audit trail");
    }
}

fn try_append(filename: &Path, write_request: &WriteRequest) -> std::io::Result<()> {
    let json = serde_json::to_string(write_request)
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    let current_time = Local::now().format(AUDIT_TIME_FORMAT);

    let mut audit_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(filename)?;
    writeln!(audit_file, "[{current_time}] {json}")?;

    Ok(())
}
