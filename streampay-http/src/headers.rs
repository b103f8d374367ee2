//! HTTP header encoding and decoding for negotiation messages.
//!
//! Payment terms are JSON, base64-encoded so they survive header
//! transport untouched by proxies and header-casing middleboxes.

use base64::prelude::*;
use streampay::proto::PaymentRequired;

use crate::error::HttpError;

/// Encodes a [`PaymentRequired`] as a base64 string for the
/// `Payment-Stream-Terms` header.
///
/// # Errors
///
/// Returns [`HttpError::Serialize`] if JSON serialization fails.
pub fn encode_payment_required(required: &PaymentRequired) -> Result<String, HttpError> {
    let json = serde_json::to_vec(required)?;
    Ok(BASE64_STANDARD.encode(&json))
}

/// Decodes a `Payment-Stream-Terms` header value into a
/// [`PaymentRequired`].
///
/// # Errors
///
/// Returns [`HttpError`] on base64 or JSON decode failure.
pub fn decode_payment_required(header_value: &str) -> Result<PaymentRequired, HttpError> {
    let bytes = BASE64_STANDARD.decode(header_value.trim())?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use streampay::proto::{PaymentMode, PaymentTerms};

    fn sample() -> PaymentRequired {
        PaymentRequired::new(PaymentTerms {
            mode: PaymentMode::Streaming,
            rate: "0.0001".into(),
            asset: Some("0xToken".into()),
            decimals: None,
            contract: "0xLedger".into(),
            pay_to: "0xProvider".into(),
        })
    }

    #[test]
    fn test_header_roundtrip() {
        let encoded = encode_payment_required(&sample()).unwrap();
        let decoded = decode_payment_required(&encoded).unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn test_decode_rejects_invalid_base64() {
        assert!(matches!(
            decode_payment_required("not base64!!!"),
            Err(HttpError::Base64(_))
        ));
    }

    #[test]
    fn test_decode_rejects_wrong_json_shape() {
        let encoded = BASE64_STANDARD.encode(b"{\"surprise\": true}");
        assert!(matches!(
            decode_payment_required(&encoded),
            Err(HttpError::Serialize(_))
        ));
    }
}
