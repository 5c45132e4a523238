// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Writer integration tests against a stub dispatching layer: extended and
//! compact materialization, the adjusted retrieval delay and the
//! timestamp-range fallback.

use std::time::{Duration, Instant};

use axum::extract::Json;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use serde_json::{json, Map, Value};
use tempfile::TempDir;

use sfdaq::config::WriterSettings;
use sfdaq::request::{
    BackendChannel, ChannelConfig, ChannelData, ChannelEvent, DataApiRequest, QueryRange,
    ResponseFormat, WriteRequest,
};
use sfdaq::storage::container::{ContainerFile, DType};
use sfdaq::writer::process_write_request;

const SCALAR_MAX: &str = "SAROP21-CVME-PBPS2:Lnk9Ch6-DATA-MAX";
const SCALAR_MIN: &str = "SAROP21-CVME-PBPS2:Lnk9Ch6-DATA-MIN";
const ARRAY_CALIBRATED: &str = "SAROP21-CVME-PBPS2:Lnk9Ch6-DATA-CALIBRATED";

/// Serve one canned dispatching-layer response on an ephemeral port.
/// With `reject_pulse_queries`, pulse-id ranges get a 500 and only the
/// timestamp fallback succeeds.
async fn spawn_dispatching_layer(data: Value, reject_pulse_queries: bool) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stub");
    let addr = listener.local_addr().expect("stub addr");

    let app = Router::new().route(
        "/sf/query",
        post(move |Json(body): Json<Value>| {
            let data = data.clone();
            async move {
                if reject_pulse_queries && body["range"].get("startPulseId").is_some() {
                    return (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(json!({"error": "pulse-id queries disabled"})),
                    );
                }
                (StatusCode::OK, Json(data))
            }
        }),
    );

    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("stub server");
    });

    format!("http://{addr}/sf/query")
}

fn scalar_channel(name: &str, ty: &str, events: Vec<ChannelEvent>) -> ChannelData {
    ChannelData {
        channel: BackendChannel { name: name.to_string(), backend: "sf-databuffer".to_string() },
        configs: vec![ChannelConfig {
            channel_type: Some(ty.to_string()),
            shape: Some(vec![1]),
        }],
        data: events,
    }
}

fn event(pulse_id: u64, value: Value) -> ChannelEvent {
    ChannelEvent {
        pulse_id,
        value,
        global_date: Some(format!("2018-06-08T14:04:51.{pulse_id}+02:00")),
        shape: None,
    }
}

/// Three fully populated channels over 36 pulses, one sparse, one empty.
fn sample_channels(pulse_ids: &[u64]) -> Vec<ChannelData> {
    let scalar_events = |scale: f64| -> Vec<ChannelEvent> {
        pulse_ids
            .iter()
            .enumerate()
            .map(|(i, &pid)| event(pid, json!(i as f64 * scale)))
            .collect()
    };

    let waveform: Vec<f32> = (0..1024).map(|i| i as f32 * 0.25).collect();
    let array_events: Vec<ChannelEvent> = pulse_ids
        .iter()
        .map(|&pid| event(pid, json!(waveform)))
        .collect();

    vec![
        ChannelData {
            channel: BackendChannel {
                name: ARRAY_CALIBRATED.to_string(),
                backend: "sf-databuffer".to_string(),
            },
            configs: vec![ChannelConfig {
                channel_type: Some("float32".to_string()),
                shape: Some(vec![1024]),
            }],
            data: array_events,
        },
        scalar_channel(SCALAR_MAX, "float32", scalar_events(2.0)),
        scalar_channel(SCALAR_MIN, "float32", scalar_events(1.0)),
        scalar_channel(
            "SCALAR_MISSING_DATA",
            "float64",
            vec![event(pulse_ids[8], json!(1.25)), event(pulse_ids[20], json!(2.5))],
        ),
        scalar_channel("SCALAR_NO_DATA", "float64", vec![]),
    ]
}

fn write_request(output_file: &str, start: u64, stop: u64, channels: &[&str]) -> WriteRequest {
    let mut parameters = Map::new();
    parameters.insert("general/created".into(), json!("test"));
    parameters.insert("general/user".into(), json!("tester"));
    parameters.insert("general/process".into(), json!("test_process"));
    parameters.insert("general/instrument".into(), json!("mac"));
    parameters.insert("output_file".into(), json!(output_file));

    WriteRequest {
        data_api_request: DataApiRequest {
            channels: channels
                .iter()
                .map(|name| BackendChannel {
                    name: name.to_string(),
                    backend: "sf-databuffer".to_string(),
                })
                .collect(),
            range: QueryRange::Pulse { start_pulse_id: start, end_pulse_id: stop },
            response: ResponseFormat { format: "json".into(), compression: "none".into() },
            event_fields: vec![],
            config_fields: vec![],
        },
        parameters,
        timestamp: sfdaq::request::wall_clock_timestamp(),
    }
}

fn settings(data_api_url: String) -> WriterSettings {
    let mut settings = WriterSettings::default();
    settings.data_api_url = data_api_url;
    settings.data_retrieval_delay_secs = 0;
    settings
}

#[tokio::test]
async fn extended_layout_end_to_end() {
    let dir = TempDir::new().expect("tempdir");
    let output = dir.path().join("ignore_output.h5");

    let pulse_ids: Vec<u64> = (0..36).map(|i| 100 + 2 * i).collect();
    let channels = sample_channels(&pulse_ids);
    let url = spawn_dispatching_layer(serde_json::to_value(&channels).expect("canned"), false).await;

    let request = write_request(
        &output.to_string_lossy(),
        100,
        200,
        &[ARRAY_CALIBRATED, SCALAR_MAX, SCALAR_MIN, "SCALAR_MISSING_DATA", "SCALAR_NO_DATA"],
    );

    let client = reqwest::Client::new();
    process_write_request(&client, &request, &settings(url))
        .await
        .expect("write");

    let file = ContainerFile::open(&output).expect("open output");

    // Every channel spans the 36-pulse union axis.
    for name in [
        ARRAY_CALIBRATED,
        SCALAR_MAX,
        SCALAR_MIN,
        "SCALAR_MISSING_DATA",
        "SCALAR_NO_DATA",
    ] {
        assert_eq!(
            file.dataset(&format!("/data/{name}/pulse_id")).expect("pids").rows(),
            36,
            "{name}"
        );
        assert_eq!(
            file.dataset(&format!("/data/{name}/is_data_present")).expect("mask").rows(),
            36
        );
        assert_eq!(
            file.dataset(&format!("/data/{name}/data")).expect("data").rows(),
            36
        );
        assert_eq!(
            file.dataset(&format!("/data/{name}/global_date")).expect("dates").rows(),
            36
        );
    }

    let presence_sum = |name: &str| -> u64 {
        file.dataset(&format!("/data/{name}/is_data_present"))
            .expect("mask")
            .as_u8()
            .expect("u8")
            .iter()
            .map(|&b| b as u64)
            .sum()
    };
    assert_eq!(presence_sum(ARRAY_CALIBRATED), 36);
    assert_eq!(presence_sum(SCALAR_MAX), 36);
    assert_eq!(presence_sum(SCALAR_MIN), 36);
    assert_eq!(presence_sum("SCALAR_MISSING_DATA"), 2);
    assert_eq!(presence_sum("SCALAR_NO_DATA"), 0);

    // Scalar datasets land as (36, 1) float32, arrays as (36, 1024).
    let scalar = file.dataset(&format!("/data/{SCALAR_MIN}/data")).expect("scalar");
    assert_eq!(scalar.shape, vec![36, 1]);
    assert_eq!(scalar.dtype, DType::F32);

    let array = file.dataset(&format!("/data/{ARRAY_CALIBRATED}/data")).expect("array");
    assert_eq!(array.shape, vec![36, 1024]);
    assert_eq!(array.dtype, DType::F32);

    // The four parameter strings.
    assert_eq!(
        file.dataset("/general/user").expect("user").as_strings().expect("strings"),
        vec!["tester"]
    );

    // Sparse events land at their union index.
    let sparse = file
        .dataset("/data/SCALAR_MISSING_DATA/data")
        .expect("sparse")
        .as_f64()
        .expect("f64");
    assert_eq!(sparse[8], 1.25);
    assert_eq!(sparse[20], 2.5);

    let date = file
        .dataset(&format!("/data/{SCALAR_MAX}/global_date"))
        .expect("dates")
        .as_strings()
        .expect("strings");
    assert!(date[0].starts_with("2018-06-08T"));
}

#[tokio::test]
async fn compact_layout_end_to_end() {
    let dir = TempDir::new().expect("tempdir");
    let output = dir.path().join("compact_output.h5");

    let pulse_ids: Vec<u64> = (0..36).map(|i| 100 + 2 * i).collect();
    let channels = sample_channels(&pulse_ids);
    let url = spawn_dispatching_layer(serde_json::to_value(&channels).expect("canned"), false).await;

    let mut request = write_request(
        &output.to_string_lossy(),
        100,
        200,
        &[SCALAR_MIN, "SCALAR_MISSING_DATA", "SCALAR_NO_DATA"],
    );
    request
        .parameters
        .insert("output_file_format".into(), json!("compact"));

    let client = reqwest::Client::new();
    process_write_request(&client, &request, &settings(url))
        .await
        .expect("write");

    let file = ContainerFile::open(&output).expect("open output");

    // One row per received event.
    assert_eq!(
        file.dataset(&format!("/data/{SCALAR_MIN}/pulse_id")).expect("pids").rows(),
        36
    );
    let sparse_pids = file
        .dataset("/data/SCALAR_MISSING_DATA/pulse_id")
        .expect("pids")
        .as_i64()
        .expect("i64");
    assert_eq!(sparse_pids, vec![116, 140]);
    assert_eq!(
        file.dataset("/data/SCALAR_MISSING_DATA/is_data_present")
            .expect("mask")
            .as_u8()
            .expect("u8"),
        vec![1, 1]
    );

    // Empty channels keep zero-length datasets of correct rank.
    let empty = file.dataset("/data/SCALAR_NO_DATA/data").expect("data");
    assert_eq!(empty.shape, vec![0, 1]);
}

#[tokio::test]
async fn adjusted_delay_subtracts_request_age() {
    let dir = TempDir::new().expect("tempdir");
    let output = dir.path().join("delayed_output.h5");

    let pulse_ids: Vec<u64> = (0..4).map(|i| 100 + i).collect();
    let channels = vec![scalar_channel(
        SCALAR_MIN,
        "float32",
        pulse_ids.iter().map(|&pid| event(pid, json!(1.0))).collect(),
    )];
    let url = spawn_dispatching_layer(serde_json::to_value(&channels).expect("canned"), false).await;

    let mut request = write_request(&output.to_string_lossy(), 100, 103, &[SCALAR_MIN]);
    // As if the request was created 9 seconds ago, against a 10 second delay.
    request.timestamp = sfdaq::request::wall_clock_timestamp() - 9.0;

    let mut settings = settings(url);
    settings.data_retrieval_delay_secs = 10;

    let client = reqwest::Client::new();
    let start = Instant::now();
    process_write_request(&client, &request, &settings)
        .await
        .expect("write");

    // Only ~1 second of the delay should remain.
    assert!(start.elapsed() < Duration::from_secs(3), "took {:?}", start.elapsed());
    assert!(output.exists());
}

#[tokio::test]
async fn timestamp_fallback_filters_to_the_requested_range() {
    let dir = TempDir::new().expect("tempdir");
    let output = dir.path().join("fallback_output.h5");

    // The stub rejects pulse-id queries; the date query returns a wider
    // window than requested.
    let wide_pids: Vec<u64> = (90..=120).collect();
    let channels = vec![scalar_channel(
        SCALAR_MIN,
        "float32",
        wide_pids.iter().map(|&pid| event(pid, json!(pid as f64))).collect(),
    )];
    let url = spawn_dispatching_layer(serde_json::to_value(&channels).expect("canned"), true).await;

    let request = write_request(&output.to_string_lossy(), 100, 110, &[SCALAR_MIN]);

    let client = reqwest::Client::new();
    process_write_request(&client, &request, &settings(url))
        .await
        .expect("write via fallback");

    let file = ContainerFile::open(&output).expect("open output");
    let pids = file
        .dataset(&format!("/data/{SCALAR_MIN}/pulse_id"))
        .expect("pids")
        .as_i64()
        .expect("i64");
    let expected: Vec<i64> = (100..=110).collect();
    assert_eq!(pids, expected);
}

#[tokio::test]
async fn fallback_disabled_surfaces_the_retrieval_error() {
    let dir = TempDir::new().expect("tempdir");
    let output = dir.path().join("failing_output.h5");

    let url = spawn_dispatching_layer(json!([]), true).await;
    let request = write_request(&output.to_string_lossy(), 100, 110, &[SCALAR_MIN]);

    let mut settings = settings(url);
    settings.pulse_id_to_timestamp_fallback = false;

    let client = reqwest::Client::new();
    let err = process_write_request(&client, &request, &settings)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("dispatching layer"));
    assert!(!output.exists());
}

#[tokio::test]
async fn dev_null_requests_are_skipped() {
    // The dispatching layer is never contacted; an unreachable URL proves it.
    let request = write_request("/dev/null", 100, 110, &[SCALAR_MIN]);
    let settings = settings("http://127.0.0.1:1/sf/query".to_string());

    let client = reqwest::Client::new();
    process_write_request(&client, &request, &settings)
        .await
        .expect("skipped without contacting the backend");
}
