//! Endpoint I/O seam between the scripted transfers and the host USB stack
use std::fmt::{Display, Formatter};
use thiserror::Error;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

impl Display for Direction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::In => write!(f, "in"),
            Direction::Out => write!(f, "out"),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EndpointKind {
    Bulk,
    Interrupt,
}

/// Completion status of a transfer that did not finish with "ok"
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    Stall,
    Babble,
    Timeout,
    Cancelled,
    Disconnected,
    Other(String),
}

impl Display for TransferStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferStatus::Stall => write!(f, "stall"),
            TransferStatus::Babble => write!(f, "babble"),
            TransferStatus::Timeout => write!(f, "timeout"),
            TransferStatus::Cancelled => write!(f, "cancelled"),
            TransferStatus::Disconnected => write!(f, "disconnected"),
            TransferStatus::Other(status) => write!(f, "{}", status),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Transfer {direction} failed with status \"{status}\"")]
pub struct TransferError {
    pub direction: Direction,
    pub status: TransferStatus,
}

impl TransferError {
    pub fn new(direction: Direction, status: TransferStatus) -> Self {
        Self { direction, status }
    }
}

/// An IN endpoint: one call issues one transfer bounded to `max_len` bytes.
pub trait EndpointIn {
    async fn transfer_in(&mut self, max_len: usize) -> Result<Vec<u8>, TransferError>;
}

/// An OUT endpoint: one call issues one transfer and reports the bytes written.
pub trait EndpointOut {
    async fn transfer_out(&mut self, data: &[u8]) -> Result<usize, TransferError>;
}
