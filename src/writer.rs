// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Writer core — consumes write requests, retrieves the event streams from
//! the dispatching layer and materializes one output file per request.
//!
//! Per request: honor the retrieval-delay contract (the upstream ring
//! buffer needs time to contain the range), POST the pulse-id query, fall
//! back to a timestamp-range query when that fails, and write the file.
//! Failures are recorded as `<output_file>.err` and the loop continues.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Local, TimeZone, Utc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tracing::{error, info, warn};

use crate::config::{parse_utc_offset, WriterSettings, AUDIT_TIME_FORMAT};
use crate::error::{DaqError, Result};
use crate::request::{ChannelData, DataApiRequest, QueryRange, WriteRequest};
use crate::storage::layout::write_output_file;

const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Blocking receive loop. Connects to the broker's output stream and
/// processes one write request at a time; never returns under normal
/// operation.
pub async fn process_requests(stream_address: &str, settings: &WriterSettings) -> Result<()> {
    let address = strip_scheme(stream_address);
    let client = reqwest::Client::new();

    info!(address, "Connecting to broker output stream");

    loop {
        let stream = match TcpStream::connect(address).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, address, "Broker not reachable, retrying");
                tokio::time::sleep(RECONNECT_BACKOFF).await;
                continue;
            }
        };
        info!(address, "Connected to broker output stream");

        let mut lines = BufReader::new(stream).lines();
        let receive_timeout = Duration::from_millis(settings.receive_timeout_ms);

        loop {
            let line = match tokio::time::timeout(receive_timeout, lines.next_line()).await {
                // Receive timeout: null message, keep polling.
                Err(_) => continue,
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => {
                    warn!("Broker closed the stream, reconnecting");
                    break;
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "Stream receive failed, reconnecting");
                    break;
                }
            };

            let request: WriteRequest = match serde_json::from_str(&line) {
                Ok(request) => request,
                Err(e) => {
                    error!(error = %e, "Cannot decode write request, skipped");
                    continue;
                }
            };

            if let Err(e) = process_write_request(&client, &request, settings).await {
                audit_failed_write_request(&request);
                error!(error = %e, "Error while trying to write a requested data range");
            }
        }
    }
}

fn strip_scheme(stream_address: &str) -> &str {
    stream_address
        .strip_prefix("tcp://")
        .unwrap_or(stream_address)
}

/// Handle one write request end to end.
pub async fn process_write_request(
    client: &reqwest::Client,
    request: &WriteRequest,
    settings: &WriterSettings,
) -> Result<()> {
    let output_file = request
        .output_file()
        .ok_or_else(|| DaqError::Validation("write request carries no output_file".into()))?
        .to_string();

    if output_file == "/dev/null" {
        info!("Output file /dev/null requested, skipping");
        return Ok(());
    }

    if let QueryRange::Pulse { start_pulse_id, end_pulse_id } = &request.data_api_request.range {
        info!(
            output_file,
            start_pulse_id, end_pulse_id, "Received request to write file"
        );
    }

    let delay = adjusted_retrieval_delay(request.timestamp, settings.data_retrieval_delay_secs);
    if !delay.is_zero() {
        info!(delay_secs = delay.as_secs_f64(), "Waiting for the buffer to cover the range");
        tokio::time::sleep(delay).await;
    }

    let start_time = std::time::Instant::now();
    let channels = retrieve_channels(client, request, settings).await?;
    info!(secs = start_time.elapsed().as_secs_f64(), "Data retrieval took");

    let start_time = std::time::Instant::now();
    write_output_file(
        Path::new(&output_file),
        &request.parameters,
        &channels,
        settings.error_if_no_data,
    )?;
    info!(secs = start_time.elapsed().as_secs_f64(), "Data writing took");

    Ok(())
}

/// Remaining share of the retrieval delay, measured from request creation.
pub fn adjusted_retrieval_delay(request_timestamp: f64, data_retrieval_delay_secs: u64) -> Duration {
    let now = crate::request::wall_clock_timestamp();
    let elapsed = (now - request_timestamp).max(0.0);
    let remaining = data_retrieval_delay_secs as f64 - elapsed;

    if remaining > 0.0 {
        Duration::from_secs_f64(remaining)
    } else {
        Duration::ZERO
    }
}

async fn retrieve_channels(
    client: &reqwest::Client,
    request: &WriteRequest,
    settings: &WriterSettings,
) -> Result<Vec<ChannelData>> {
    match get_data_from_buffer(client, &settings.data_api_url, &request.data_api_request).await {
        Ok(channels) => Ok(channels),
        Err(e) => {
            let QueryRange::Pulse { start_pulse_id, end_pulse_id } =
                &request.data_api_request.range
            else {
                return Err(e);
            };
            let (start_pulse_id, end_pulse_id) = (*start_pulse_id, *end_pulse_id);
            if !settings.pulse_id_to_timestamp_fallback {
                return Err(e);
            }

            warn!(error = %e, "Pulse-id query failed, retrying with a timestamp range");

            let fallback = timestamp_range_request(
                &request.data_api_request,
                request.timestamp,
                &settings.timezone_offset,
            )?;
            let mut channels =
                get_data_from_buffer(client, &settings.data_api_url, &fallback).await?;
            filter_channels_to_range(&mut channels, start_pulse_id, end_pulse_id);
            Ok(channels)
        }
    }
}

/// POST one query to the dispatching layer.
pub async fn get_data_from_buffer(
    client: &reqwest::Client,
    data_api_url: &str,
    data_api_request: &DataApiRequest,
) -> Result<Vec<ChannelData>> {
    let response = client
        .post(data_api_url)
        .json(data_api_request)
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        return Err(DaqError::Retrieval(format!(
            "Error while trying to get data from the dispatching layer: {status} {text}"
        )));
    }

    Ok(response.json().await?)
}

/// Derive the timestamp window of the fallback query.
///
/// `end = ceil(timestamp) + 1 s`; `start = end − ((stop − start)/100 + 10) s`.
/// Dates are formatted in the facility-local fixed offset.
pub fn timestamp_range_request(
    data_api_request: &DataApiRequest,
    request_timestamp: f64,
    timezone_offset: &str,
) -> Result<DataApiRequest> {
    let QueryRange::Pulse { start_pulse_id, end_pulse_id } = &data_api_request.range else {
        return Err(DaqError::Retrieval(
            "timestamp fallback needs a pulse-id range".into(),
        ));
    };
    let (start_pulse_id, end_pulse_id) = (*start_pulse_id, *end_pulse_id);

    let offset = parse_utc_offset(timezone_offset).map_err(DaqError::Retrieval)?;

    let end_secs = request_timestamp.ceil() + 1.0;
    // 100 Hz pulse clock plus a safety margin.
    let span_secs = (end_pulse_id - start_pulse_id) as f64 / 100.0 + 10.0;
    let start_secs = end_secs - span_secs;

    let format_date = |secs: f64| -> Result<String> {
        let utc: DateTime<Utc> = Utc
            .timestamp_opt(secs as i64, 0)
            .single()
            .ok_or_else(|| DaqError::Retrieval(format!("timestamp {secs} out of range")))?;
        Ok(utc
            .with_timezone(&offset)
            .format("%Y-%m-%dT%H:%M:%S%.6f%:z")
            .to_string())
    };

    let mut fallback = data_api_request.clone();
    fallback.range = QueryRange::Date {
        start_date: format_date(start_secs)?,
        end_date: format_date(end_secs)?,
    };
    Ok(fallback)
}

/// Trim every channel's events to `[start_pid, stop_pid]`.
///
/// Events arrive ordered by pulse id; a forward scan finds the first event
/// inside the window and a backward scan the last.
pub fn filter_channels_to_range(channels: &mut [ChannelData], start_pid: u64, stop_pid: u64) {
    for channel in channels {
        let first = channel.data.iter().position(|e| e.pulse_id >= start_pid);
        let last = channel.data.iter().rposition(|e| e.pulse_id <= stop_pid);

        match (first, last) {
            (Some(first), Some(last)) if first <= last => {
                channel.data.truncate(last + 1);
                channel.data.drain(..first);
            }
            _ => channel.data.clear(),
        }
    }
}

/// Record a failed write request next to its intended output file.
pub fn audit_failed_write_request(request: &WriteRequest) {
    let Some(output_file) = request.output_file() else {
        error!("Failed write request carries no output_file, not audited");
        return;
    };
    let filename = format!("{output_file}.err");

    let result = serde_json::to_string(request).map_err(std::io::Error::other).and_then(|json| {
        let current_time = Local::now().format(AUDIT_TIME_FORMAT);
        std::fs::write(&filename, format!("[{current_time}] {json}\n"))
    });

    if let Err(e) = result {
        error!(file = filename, error = %e, "Error while trying to record the failed request");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{BackendChannel, ChannelEvent, ResponseFormat};
    use serde_json::json;

    fn pulse_request(start: u64, stop: u64) -> DataApiRequest {
        DataApiRequest {
            channels: vec![BackendChannel {
                name: "CH1".into(),
                backend: "sf-databuffer".into(),
            }],
            range: QueryRange::Pulse { start_pulse_id: start, end_pulse_id: stop },
            response: ResponseFormat { format: "json".into(), compression: "none".into() },
            event_fields: vec![],
            config_fields: vec![],
        }
    }

    #[test]
    fn adjusted_delay_subtracts_elapsed_time() {
        // Request created 9 seconds ago with a 10 second delay: ~1 s remains.
        let timestamp = crate::request::wall_clock_timestamp() - 9.0;
        let delay = adjusted_retrieval_delay(timestamp, 10);
        assert!(delay <= Duration::from_secs(2), "delay was {delay:?}");
        assert!(delay >= Duration::from_millis(500), "delay was {delay:?}");

        // Older than the delay: no sleeping at all.
        let timestamp = crate::request::wall_clock_timestamp() - 100.0;
        assert_eq!(adjusted_retrieval_delay(timestamp, 10), Duration::ZERO);
    }

    #[test]
    fn fallback_window_has_the_documented_span() {
        let request = pulse_request(100, 1100);
        let fallback = timestamp_range_request(&request, 1528459491.2, "+02:00").expect("fallback");

        let QueryRange::Date { start_date, end_date } = fallback.range else {
            panic!("expected a date range");
        };
        assert!(start_date.ends_with("+02:00"), "start was {start_date}");
        assert!(end_date.ends_with("+02:00"), "end was {end_date}");

        // (1100-100)/100 + 10 = 20 seconds of window.
        let start = DateTime::parse_from_rfc3339(&start_date).expect("start parses");
        let end = DateTime::parse_from_rfc3339(&end_date).expect("end parses");
        assert_eq!((end - start).num_seconds(), 20);
    }

    #[test]
    fn range_filter_is_a_two_pointer_trim() {
        let events: Vec<ChannelEvent> = [95u64, 100, 105, 110, 115]
            .iter()
            .map(|&pid| ChannelEvent {
                pulse_id: pid,
                value: json!(0),
                global_date: None,
                shape: None,
            })
            .collect();
        let mut channels = vec![ChannelData {
            channel: BackendChannel { name: "CH1".into(), backend: "db".into() },
            configs: vec![],
            data: events,
        }];

        filter_channels_to_range(&mut channels, 100, 110);
        let pids: Vec<u64> = channels[0].data.iter().map(|e| e.pulse_id).collect();
        assert_eq!(pids, vec![100, 105, 110]);

        filter_channels_to_range(&mut channels, 200, 300);
        assert!(channels[0].data.is_empty());
    }

    #[test]
    fn failed_requests_land_next_to_the_output_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let output = dir.path().join("run_000001.BSREAD.h5");

        let mut parameters = serde_json::Map::new();
        parameters.insert("output_file".into(), json!(output.to_string_lossy()));
        let request = WriteRequest {
            data_api_request: pulse_request(100, 200),
            parameters,
            timestamp: 1234.5,
        };

        audit_failed_write_request(&request);

        let err_file = format!("{}.err", output.to_string_lossy());
        let content = std::fs::read_to_string(&err_file).expect(".err written");
        // `[YYYYMMDD-HHMMSS] ` prefix is 18 bytes, the rest is the request.
        let recorded: WriteRequest = serde_json::from_str(&content[18..]).expect("decodes");
        assert_eq!(recorded.timestamp, 1234.5);
        assert_eq!(
            recorded.data_api_request.range,
            QueryRange::Pulse { start_pulse_id: 100, end_pulse_id: 200 }
        );
    }
}
