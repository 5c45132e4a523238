// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! sfdaq — data acquisition broker and writer.
//!
//! Usage:
//!   sfdaq broker --channels-file channels.txt
//!   sfdaq writer tcp://sf-daq-1:10001
//!   sfdaq check  --run-file run_info/000000/run_000042.json

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sfdaq::api;
use sfdaq::broker::BrokerManager;
use sfdaq::channels::{verify_channels, ChannelRoster};
use sfdaq::check::check_consistency;
use sfdaq::config::DaqConfig;
use sfdaq::sender::spawn_sender;
use sfdaq::writer;

#[derive(Parser)]
#[command(name = "sfdaq", about = "Data acquisition broker and writer", version)]
struct Cli {
    /// Log level to use.
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Optional TOML settings file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the acquisition broker (REST api + outbound write-request stream).
    Broker {
        /// Text file with the channels to acquire, one per line.
        #[arg(short, long)]
        channels_file: PathBuf,
        /// Port to bind the output stream to.
        #[arg(short, long)]
        output_port: Option<u16>,
        /// Depth of the outbound request queue.
        #[arg(short, long)]
        queue_length: Option<usize>,
        /// Port for the REST api.
        #[arg(long)]
        rest_port: Option<u16>,
        /// Do not send data to the writer. Write audit trail only.
        #[arg(long)]
        audit_trail_only: bool,
        /// Epics writer URL to notify for new acquisitions.
        #[arg(long)]
        epics_writer_url: Option<String>,
    },
    /// Start the writer process.
    Writer {
        /// Address of the broker output stream, e.g. tcp://sf-daq-1:10001.
        stream_address: String,
    },
    /// Check consistency of the files produced for one run.
    Check {
        /// Run manifest JSON written by the broker.
        #[arg(short, long)]
        run_file: PathBuf,
        /// Beam rate override; 0 takes the rate from the run file.
        #[arg(long, default_value_t = 0)]
        rate_multiplicator: u64,
        /// Root of the facility data tree.
        #[arg(long, default_value = "/sf")]
        data_root: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone())),
        )
        .init();

    let config = match &cli.config {
        Some(path) => match DaqConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "Failed to load config");
                std::process::exit(1);
            }
        },
        None => DaqConfig::default(),
    };

    match cli.command {
        Command::Broker {
            channels_file,
            output_port,
            queue_length,
            rest_port,
            audit_trail_only,
            epics_writer_url,
        } => {
            let mut settings = config.broker;
            if let Some(port) = output_port {
                settings.output_port = port;
            }
            if let Some(length) = queue_length {
                settings.queue_length = length;
            }
            if let Some(port) = rest_port {
                settings.rest_port = port;
            }
            if epics_writer_url.is_some() {
                settings.epics_writer_url = epics_writer_url;
            }

            run_broker(settings, channels_file, audit_trail_only).await;
        }
        Command::Writer { stream_address } => {
            if let Err(e) = writer::process_requests(&stream_address, &config.writer).await {
                error!(error = %e, "Writer failed");
                std::process::exit(1);
            }
        }
        Command::Check {
            run_file,
            rate_multiplicator,
            data_root,
        } => {
            let rate = (rate_multiplicator > 0).then_some(rate_multiplicator);
            let report = check_consistency(&run_file, rate, &data_root);

            println!("Result of consistency check (summary) : {}", report.check);
            match report.check {
                true => println!("    OK : all tests passed"),
                false => {
                    for reason in report.problems() {
                        println!("    Reason : {reason}");
                    }
                }
            }
        }
    }
}

async fn run_broker(
    settings: sfdaq::config::BrokerSettings,
    channels_file: PathBuf,
    audit_trail_only: bool,
) {
    info!(file = ?channels_file, "Loading channels list file");

    let roster = match ChannelRoster::load(&channels_file) {
        Ok(roster) => roster,
        Err(e) => {
            error!(error = %e, "Failed to load channels file");
            std::process::exit(1);
        }
    };

    // Limit violations fail loudly at configuration load.
    if let Err(e) = verify_channels(
        roster.channels(),
        settings.channels_limit,
        settings.picture_channels_limit,
    ) {
        error!(error = %e, "Channel list rejected");
        std::process::exit(1);
    }

    let (sender, _sender_task) = spawn_sender(
        settings.output_port,
        settings.queue_length,
        Duration::from_secs(settings.send_timeout_secs),
        settings.epics_writer_url.clone(),
    );

    let rest_port = settings.rest_port;
    let manager = BrokerManager::new(settings, roster, sender, audit_trail_only);

    info!("Broker started.");

    let state = Arc::new(api::AppState {
        manager: tokio::sync::Mutex::new(manager),
    });
    api::start_server(state, rest_port).await;
}
