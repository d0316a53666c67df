//! Base64 payment-header encoding.
//!
//! Payment assertions travel in the `X-PAYMENT` request header as
//! Base64-encoded JSON. An optional `base64:` prefix is tolerated on
//! decode for compatibility with older caller SDKs.

use base64::prelude::*;

use crate::ProtocolError;
use crate::payments::PaymentPayload;

/// Encodes a [`PaymentPayload`] for the `X-PAYMENT` header.
///
/// # Errors
///
/// Returns [`ProtocolError::Json`] if serialization fails.
pub fn encode_payment_header(payload: &PaymentPayload) -> Result<String, ProtocolError> {
    let json = serde_json::to_vec(payload)?;
    Ok(BASE64_STANDARD.encode(&json))
}

/// Decodes an `X-PAYMENT` header value into a [`PaymentPayload`].
///
/// # Errors
///
/// Returns [`ProtocolError`] on Base64 or JSON decode failure, or when the
/// payload advertises an unsupported protocol version.
pub fn decode_payment_header(header_value: &str) -> Result<PaymentPayload, ProtocolError> {
    let trimmed = header_value.trim();
    let trimmed = trimmed.strip_prefix("base64:").unwrap_or(trimmed);
    let bytes = BASE64_STANDARD.decode(trimmed)?;
    let payload: PaymentPayload = serde_json::from_slice(&bytes)?;
    if payload.x402_version != crate::X402_VERSION {
        return Err(ProtocolError::InvalidVersion(payload.x402_version));
    }
    Ok(payload)
}
