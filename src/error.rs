use crate::snapshot::FieldGroup;
use std::{
    fmt,
    time::Duration,
};
use thiserror::Error;

/// Why a single read against the ledger did not produce a value.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReadError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("read timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Machine-readable part of a relay rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStatus {
    Http(u16),
    Unreachable,
}

impl fmt::Display for RelayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayStatus::Http(code) => write!(f, "HTTP {code}"),
            RelayStatus::Unreachable => write!(f, "unreachable"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// Retried on the next cadence tick; the stale value stays in the snapshot.
    #[error("transient read failure for {group}: {source}")]
    TransientReadFailure { group: FieldGroup, source: ReadError },
    #[error("sponsorship relay rejected the action ({status}): {detail}")]
    RelayRejection { status: RelayStatus, detail: String },
    #[error("ledger reverted the action: {reason}")]
    LedgerRevert { reason: String },
    /// Never shown to users.
    #[error("stale {group} read discarded (seq {seq}, already applied {applied})")]
    StaleSnapshotRead {
        group: FieldGroup,
        seq: u64,
        applied: u64,
    },
    #[error("submission cancelled before the relay accepted it")]
    Cancelled,
    #[error("no finality within {0:?}")]
    ConfirmationTimeout(Duration),
}
