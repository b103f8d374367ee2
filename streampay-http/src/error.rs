//! Error types for the HTTP transport layer.

use streampay::LedgerError;

/// Errors that can occur during HTTP header encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Base64 decoding failed.
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Errors surfaced by the client-side payment negotiator.
///
/// Transport-level failures are not represented here; they propagate
/// unchanged through the middleware stack.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The 402 response did not carry usable payment terms.
    #[error("malformed payment terms: {0}")]
    MalformedPaymentTerms(String),

    /// The provider demanded a payment mode other than streaming.
    #[error("unsupported payment mode '{0}': only 'streaming' is supported")]
    UnsupportedPaymentMode(String),

    /// Funding the stream would exceed the configured spending limit.
    #[error("funding limit exceeded: requested {requested}, already funded {funded}, limit {limit}")]
    FundingLimitExceeded {
        /// Base units the new stream would escrow.
        requested: u64,
        /// Base units already escrowed by this negotiator.
        funded: u64,
        /// The configured cap.
        limit: u64,
    },

    /// Stream creation failed at the ledger; surfaced as-is, never retried.
    #[error("stream funding failed: {0}")]
    Ledger(#[from] LedgerError),

    /// The request body cannot be cloned for the payment retry.
    #[error("request cannot be retried: body is not cloneable")]
    RequestNotCloneable,
}
