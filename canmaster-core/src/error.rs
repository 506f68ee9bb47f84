//! Error taxonomy for the master.
//!
//! One enum carries every fallible outcome core components can produce. SDO
//! aborts keep the remote (or locally synthesized) abort code attached so a
//! driver can match on it; everything else carries just enough context to be
//! logged usefully.

use crate::abort::AbortCode;
use std::path::PathBuf;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CanOpenError {
    #[error("SDO aborted: {0}")]
    SdoAbort(AbortCode),

    #[error("SDO job for node {node_id} timed out after {timeout_ms}ms")]
    Timeout { node_id: u8, timeout_ms: u64 },

    #[error("SDO queue for node {node_id} is full (capacity {capacity})")]
    QueueFull { node_id: u8, capacity: usize },

    #[error("CAN transport error: {reason}")]
    TransportError { reason: String },

    #[error("failed to parse EDS file {path}:{line}: {reason}")]
    EdsParseError {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("invalid configuration: {reason}")]
    ConfigError { reason: String },

    #[error("node id {node_id} is out of the addressable range [1,127]")]
    InvalidNodeId { node_id: u8 },

    #[error("COB-ID 0x{cob_id:03x} does not fit an 11-bit CANopen arbitration id")]
    InvalidCobId { cob_id: u32 },

    #[error("CAN data length {length} exceeds 8 bytes")]
    InvalidDataLength { length: usize },

    #[error("a second SDO job for node {node_id} was submitted while one was already in flight")]
    AlreadyInFlight { node_id: u8 },
}

pub type Result<T> = std::result::Result<T, CanOpenError>;
