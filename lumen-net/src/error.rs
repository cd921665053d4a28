//! Failure taxonomy for dispatching messages.

use std::path::PathBuf;
use std::sync::Arc;

use lumen_core::{FrameEncodeError, Header, TargetError};

use crate::result::Reply;

/// Every way a dispatch can fail. `Clone` so one memoized resolution can hand
/// the same failure to every caller waiting on it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    #[error("timed out waiting for reply to packet type {pkt_type} (serial {serial}, source {source_id}, sequence {sequence})")]
    TimedOut {
        serial: String,
        pkt_type: u16,
        source_id: u32,
        sequence: u8,
    },
    #[error("packet type {pkt_type} to {serial} was cancelled (source {source_id}, sequence {sequence})")]
    MessageCancelled {
        serial: String,
        pkt_type: u16,
        source_id: u32,
        sequence: u8,
    },
    #[error("devices not found: {}", .missing.join(", "))]
    DevicesNotFound { missing: Vec<String> },
    #[error("no known transport for device {serial}")]
    FailedToFindDevice { serial: String },
    #[error("found no devices")]
    FoundNoDevices,
    #[error("no usable service for device {serial}")]
    NoDesiredService { serial: String },
    #[error("invalid serial: {0}")]
    InvalidSerial(#[from] TargetError),
    #[error("invalid serials file {path}: {reason}")]
    InvalidSerialsFile { path: PathBuf, reason: String },
    #[error("device resolution was cancelled")]
    Cancelled,
    #[error("producer panicked: {0}")]
    Panicked(String),
    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),
    #[error("failed to encode packet: {0}")]
    Encode(String),
    #[error("{} errors: {}", .0.len(), join_errors(.0))]
    Multiple(Vec<DispatchError>),
}

fn join_errors(errors: &[DispatchError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl DispatchError {
    pub fn timed_out(header: &Header) -> Self {
        DispatchError::TimedOut {
            serial: serial_of(header),
            pkt_type: header.pkt_type,
            source_id: header.source,
            sequence: header.sequence,
        }
    }

    pub fn cancelled(header: &Header) -> Self {
        DispatchError::MessageCancelled {
            serial: serial_of(header),
            pkt_type: header.pkt_type,
            source_id: header.source,
            sequence: header.sequence,
        }
    }

    /// Flatten nested aggregates into their leaf errors.
    pub fn into_errors(self) -> Vec<DispatchError> {
        match self {
            DispatchError::Multiple(errors) => {
                errors.into_iter().flat_map(|e| e.into_errors()).collect()
            }
            other => vec![other],
        }
    }
}

fn serial_of(header: &Header) -> String {
    header
        .target
        .map(|t| t.serial())
        .unwrap_or_else(|| "000000000000".to_string())
}

impl From<std::io::Error> for DispatchError {
    fn from(e: std::io::Error) -> Self {
        DispatchError::Io(Arc::new(e))
    }
}

impl From<FrameEncodeError> for DispatchError {
    fn from(e: FrameEncodeError) -> Self {
        DispatchError::Encode(e.to_string())
    }
}

/// Collected replies alongside the errors that stopped the run from being
/// clean.
#[derive(Debug, thiserror::Error)]
#[error("run finished with {} error(s) and {} result(s)", .errors.len(), .results.len())]
pub struct BadRunWithResults {
    pub results: Vec<Reply>,
    pub errors: Vec<DispatchError>,
}
