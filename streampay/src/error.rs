//! Error types for the stream ledger.

use crate::escrow::EscrowError;
use crate::ledger::{Address, StreamId};

/// Errors returned by ledger operations.
///
/// Ledger errors represent caller misuse or state violations; callers must
/// surface them rather than retry automatically.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Stream creation was requested with non-positive amount or duration.
    #[error("invalid stream terms: {0}")]
    InvalidTerms(String),

    /// The sender's escrow deposit could not be taken.
    #[error("escrow authorization failed: {0}")]
    InsufficientAuthorization(#[source] EscrowError),

    /// No stream exists with the given id.
    #[error("unknown stream {0}")]
    UnknownStream(StreamId),

    /// The caller is not a party allowed to perform the operation.
    #[error("{caller} may not {action} stream {id}")]
    Unauthorized {
        /// The stream the operation targeted.
        id: StreamId,
        /// The caller that was rejected.
        caller: Address,
        /// The operation that was attempted.
        action: &'static str,
    },

    /// The stream was already cancelled.
    #[error("stream {0} is already cancelled")]
    AlreadyCancelled(StreamId),

    /// A payout-side escrow transfer failed; the operation may be retried
    /// by the caller once the substrate recovers.
    #[error("escrow transfer failed: {0}")]
    Escrow(#[source] EscrowError),
}
