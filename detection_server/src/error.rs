use crate::detector::DetectionError;
use frame_codec::CodecError;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to set up detector: {0}")]
    DetectorSetup(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure of a single request/response exchange. Always ends with the
/// connection being closed, never with the server stopping.
#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("Framing error: {0}")]
    Codec(#[from] CodecError),
    #[error("Detection failed: {0}")]
    Detection(#[from] DetectionError),
    #[error("Exchange timed out after {0:?}")]
    Timeout(Duration),
}
