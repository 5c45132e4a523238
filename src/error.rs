// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Missing mandatory parameters. Mandatory parameters {required:?} but received {received:?}.")]
    MissingRequiredParameter {
        required: Vec<String>,
        received: Vec<String>,
    },

    #[error("Run registry for '{pgroup}' is closed for new allocations")]
    RegistryClosed { pgroup: String },

    #[error("Run registry unavailable: {0}")]
    RegistryUnavailable(String),

    #[error("Too many {kind} channels. configured/limit: {count}/{limit}.")]
    ChannelLimitExceeded {
        kind: &'static str,
        count: usize,
        limit: usize,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Container error: {0}")]
    Container(String),

    #[error("Data retrieval error: {0}")]
    Retrieval(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, DaqError>;
