//! Human-readable decimal amount parsing.
//!
//! Payment rates travel on the wire as decimal strings (`"0.0001"`), while
//! the ledger accounts exclusively in integer base units of the asset.
//! [`base_units`] converts between the two given the asset's decimal
//! places, truncating any precision beyond them.

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::str::FromStr;

/// Decimal places assumed when payment terms do not specify any.
pub const DEFAULT_DECIMALS: u8 = 18;

/// Errors from decimal amount parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AmountError {
    /// The value is not a valid decimal number.
    #[error("invalid decimal amount: {0}")]
    Invalid(String),

    /// Negative amounts have no meaning in the ledger.
    #[error("amount must not be negative")]
    Negative,

    /// The asset's decimal places cannot be represented in 64 bits.
    #[error("unsupported asset decimals: {0}")]
    UnsupportedDecimals(u8),

    /// The scaled value does not fit in a `u64`.
    #[error("amount overflows 64-bit base units")]
    Overflow,
}

/// Parses a decimal string into integer base units of an asset with the
/// given number of decimal places.
///
/// Precision beyond `decimals` is truncated toward zero.
///
/// # Errors
///
/// Returns [`AmountError`] if the string is not a decimal number, is
/// negative, or does not fit in a `u64` once scaled.
pub fn base_units(value: &str, decimals: u8) -> Result<u64, AmountError> {
    let parsed =
        Decimal::from_str(value.trim()).map_err(|e| AmountError::Invalid(e.to_string()))?;
    if parsed.is_sign_negative() {
        return Err(AmountError::Negative);
    }
    let scale = 10u64
        .checked_pow(u32::from(decimals))
        .ok_or(AmountError::UnsupportedDecimals(decimals))?;
    let scaled = parsed
        .checked_mul(Decimal::from(scale))
        .ok_or(AmountError::Overflow)?;
    scaled.trunc().to_u64().ok_or(AmountError::Overflow)
}
