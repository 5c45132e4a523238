//! Request sender — bounded outbound queue to the writer process plus the
//! fire-and-forget epics-writer forwarder.
//!
//! ```text
//! BrokerManager ──send()──→ mpsc queue ──→ push task ──TCP json-lines──→ writer
//!                     │
//!                     └──forward_to_epics──→ detached HTTP PUT (best effort)
//! ```
//!
//! The queue is non-blocking up to `queue_length`; a full queue applies
//! `send_timeout` and then drops the request with an error log. The audit
//! trail written before the send is the durable record. Forwarder failures
//! are logged and never propagate.

use std::time::Duration;

use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::request::WriteRequest;

/// Epics writer PUT timeout.
const EPICS_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle through which the broker manager emits write requests.
#[derive(Clone)]
pub struct SenderHandle {
    tx: mpsc::Sender<WriteRequest>,
    send_timeout: Duration,
    epics: Option<EpicsForwarder>,
}

impl SenderHandle {
    /// Handle over a raw queue, no epics forwarding. Used by tests and by
    /// audit-trail-only setups that still want the queue plumbing.
    pub fn detached(tx: mpsc::Sender<WriteRequest>, send_timeout: Duration) -> Self {
        Self {
            tx,
            send_timeout,
            epics: None,
        }
    }

    pub fn with_epics_writer(mut self, epics_writer_url: Option<String>) -> Self {
        self.epics = epics_writer_url
            .filter(|url| !url.is_empty())
            .map(EpicsForwarder::new);
        self
    }

    /// Notify the epics writer without touching the queue (PV-only requests).
    pub fn forward_to_epics(&self, write_request: &WriteRequest) {
        match &self.epics {
            Some(epics) => epics.forward(write_request),
            None => warn!("No epics writer configured, PV request not forwarded"),
        }
    }

    /// Enqueue one write request; optionally notify the epics writer.
    pub async fn send(&self, write_request: WriteRequest, forward_to_epics: bool) {
        info!(
            output_file = write_request.output_file().unwrap_or("<unset>"),
            "Sending write request"
        );

        if forward_to_epics {
            if let Some(epics) = &self.epics {
                epics.forward(&write_request);
            }
        }

        match tokio::time::timeout(self.send_timeout, self.tx.send(write_request)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => error!("Write request queue closed, request dropped"),
            Err(_) => error!(
                timeout_secs = self.send_timeout.as_secs(),
                "Write request queue full, request dropped after timeout"
            ),
        }
    }
}

/// Create the outbound queue and spawn the TCP push task.
///
/// The task binds `output_port` and writes each queued request as one JSON
/// line to the connected writer process, waiting for a (re)connect whenever
/// the peer is absent.
pub fn spawn_sender(
    output_port: u16,
    queue_length: usize,
    send_timeout: Duration,
    epics_writer_url: Option<String>,
) -> (SenderHandle, JoinHandle<()>) {
    info!(
        output_port,
        queue_length,
        send_timeout_secs = send_timeout.as_secs(),
        epics_writer_url = epics_writer_url.as_deref().unwrap_or("<disabled>"),
        "Starting stream request sender"
    );

    let (tx, rx) = mpsc::channel::<WriteRequest>(queue_length);
    let handle = SenderHandle::detached(tx, send_timeout).with_epics_writer(epics_writer_url);

    let task = tokio::spawn(async move {
        push_loop(output_port, rx).await;
    });

    (handle, task)
}

async fn push_loop(output_port: u16, mut rx: mpsc::Receiver<WriteRequest>) {
    let addr = format!("0.0.0.0:{output_port}");
    let listener = match TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, addr, "Failed to bind output stream");
            return;
        }
    };
    info!(addr, "Output stream bound");

    let mut client: Option<TcpStream> = None;

    while let Some(request) = rx.recv().await {
        let mut line = match serde_json::to_string(&request) {
            Ok(json) => json,
            Err(e) => {
                error!(error = %e, "Cannot serialize write request, dropped");
                continue;
            }
        };
        line.push('\n');

        // Deliver to the connected writer, re-accepting on failure.
        loop {
            if client.is_none() {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        info!(peer = %peer, "Writer connected");
                        client = Some(stream);
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed, retrying");
                        continue;
                    }
                }
            }
            let Some(stream) = client.as_mut() else { continue };

            match stream.write_all(line.as_bytes()).await {
                Ok(()) => {
                    debug!(bytes = line.len(), "Write request pushed");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Writer connection lost, waiting for reconnect");
                    client = None;
                }
            }
        }
    }

    info!("Stream request sender shutting down (queue closed)");
}

// ─────────────────────────── epics forwarder ─────────────────────────────────

#[derive(Clone)]
struct EpicsForwarder {
    client: reqwest::Client,
    url: String,
}

impl EpicsForwarder {
    fn new(url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(EPICS_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client, url }
    }

    /// Detached PUT carrying `{range, parameters, channels}`.
    fn forward(&self, write_request: &WriteRequest) {
        let channels: Vec<&str> = write_request
            .data_api_request
            .channels
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        let body = json!({
            "range": write_request.data_api_request.range,
            "parameters": write_request.parameters,
            "channels": channels,
        });

        let client = self.client.clone();
        let url = self.url.clone();
        tokio::spawn(async move {
            info!(url, "Sending epics writer request");
            match client.put(&url).json(&body).send().await {
                Ok(response) if response.status().is_success() => {}
                Ok(response) => error!(
                    status = %response.status(),
                    "Epics writer rejected the forwarded request"
                ),
                Err(e) => error!(
                    error = %e,
                    "Error while trying to forward the write request to the epics writer"
                ),
            }
        });
    }
}
