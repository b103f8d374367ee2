//! Wire format types for payment negotiation.
//!
//! When a provider answers a request with 402 Payment Required, it
//! describes how to pay in a [`PaymentRequired`] message carrying
//! [`PaymentTerms`]. The client opens a stream matching those terms and
//! retries the request with the stream id attached.
//!
//! All types serialize to JSON using camelCase field names.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::amount::{self, AmountError, DEFAULT_DECIMALS};

/// The payment mode demanded by a provider.
///
/// Only [`PaymentMode::Streaming`] is supported; anything else round-trips
/// as [`PaymentMode::Other`] so the client can fail fast naming the mode
/// rather than silently approximating it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentMode {
    /// Continuous time-proportional payment through a stream.
    Streaming,
    /// A mode this implementation does not support.
    Other(String),
}

impl PaymentMode {
    /// The wire value of the streaming mode: `"streaming"`.
    pub const STREAMING: &'static str = "streaming";

    /// Returns `true` for the streaming mode.
    #[must_use]
    pub const fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming)
    }

    /// Returns the wire value of this mode.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Streaming => Self::STREAMING,
            Self::Other(s) => s,
        }
    }
}

impl std::fmt::Display for PaymentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for PaymentMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for PaymentMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s == Self::STREAMING {
            Ok(Self::Streaming)
        } else {
            Ok(Self::Other(s))
        }
    }
}

/// Payment terms published by a provider.
///
/// `contract` names the settlement target the stream must be created
/// against, and `payTo` the party the stream pays. The recipient is a
/// dedicated field on purpose: it is never inferred from the asset
/// identifier.
///
/// # JSON Format
///
/// ```json
/// {
///   "mode": "streaming",
///   "rate": "0.0001",
///   "asset": "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913",
///   "decimals": 18,
///   "contract": "0xStreamLedger",
///   "payTo": "0xProvider"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentTerms {
    /// Required payment mode.
    pub mode: PaymentMode,

    /// Value per second as a human-readable decimal string.
    pub rate: String,

    /// Optional asset/token identifier; the ledger may resolve a default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset: Option<String>,

    /// Decimal places of the asset; defaults to 18 when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decimals: Option<u8>,

    /// Settlement target (stream ledger/contract) identifier.
    pub contract: String,

    /// The party streams must pay.
    pub pay_to: String,
}

impl PaymentTerms {
    /// Returns the asset decimal places, applying the default.
    #[must_use]
    pub fn decimals(&self) -> u8 {
        self.decimals.unwrap_or(DEFAULT_DECIMALS)
    }

    /// Parses the per-second rate into integer base units.
    ///
    /// # Errors
    ///
    /// Returns [`AmountError`] if the rate is not a non-negative decimal
    /// representable in 64-bit base units.
    pub fn rate_base_units(&self) -> Result<u64, AmountError> {
        amount::base_units(&self.rate, self.decimals())
    }
}

/// Body of a 402 Payment Required response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequired {
    /// Optional human-readable reason the request was refused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// The terms under which the provider will serve the request.
    pub terms: PaymentTerms,
}

impl PaymentRequired {
    /// Wraps terms in a payment-required message with no error text.
    #[must_use]
    pub const fn new(terms: PaymentTerms) -> Self {
        Self { error: None, terms }
    }
}
