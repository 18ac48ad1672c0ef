mod client;
mod payload;
mod signer;

pub use client::{RetryPolicy, WeatherLinkClient};
pub use payload::{RawPayload, SensorBlock};

use reqwest::StatusCode;
use std::fmt;
use thiserror::Error;

pub const DEFAULT_API_BASE: &str = "https://api.weatherlink.com/v2/";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Current,
    Historical,
}

impl Endpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::Current => "current",
            Endpoint::Historical => "historical",
        }
    }

    fn path_segment(&self) -> &'static str {
        match self {
            Endpoint::Current => "current",
            Endpoint::Historical => "historic",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Error)]
pub enum ApiFailure {
    #[error("{endpoint} request rejected credentials (status {status})")]
    Auth {
        endpoint: Endpoint,
        status: StatusCode,
    },
    #[error("{endpoint} request failed after {attempts} attempts: {message}")]
    Transient {
        endpoint: Endpoint,
        attempts: usize,
        message: String,
    },
    #[error("{endpoint} response could not be decoded: {message}")]
    Malformed { endpoint: Endpoint, message: String },
    #[error("{endpoint} request rejected with status {status}")]
    Rejected {
        endpoint: Endpoint,
        status: StatusCode,
    },
}

impl ApiFailure {
    pub fn kind(&self) -> &'static str {
        match self {
            ApiFailure::Auth { .. } => "auth",
            ApiFailure::Transient { .. } => "transient",
            ApiFailure::Malformed { .. } => "malformed",
            ApiFailure::Rejected { .. } => "rejected",
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, ApiFailure::Auth { .. })
    }
}
