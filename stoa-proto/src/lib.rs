#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Wire format types for the Stoa per-call payment protocol.
//!
//! This crate defines the serialization-level data structures exchanged
//! between callers, the Stoa gateway, and the payment facilitator when a
//! service invocation is paid for over HTTP 402. It has minimal
//! dependencies and is intended to be the shared "lingua franca" between
//! the gateway and any Rust caller SDK.
//!
//! # Flow
//!
//! A caller requests a priced service without payment and receives a 402
//! response carrying a [`PaymentRequired`] challenge. The caller signs a
//! payment authorization for one of the challenge's [`PaymentRequirements`]
//! and retries with a [`PaymentPayload`] attached. The gateway forwards the
//! payload to a facilitator for verification ([`VerifyResponse`]) and
//! settlement ([`SettleResponse`]), and only then executes the call.
//!
//! # Modules
//!
//! - [`amount`] — Fixed-point USDC amounts (6 decimals)
//! - [`payments`] — Challenge and payload types (`PaymentRequirements`, `PaymentPayload`, …)
//! - [`responses`] — Facilitator responses (`VerifyResponse`, `SettleResponse`, …)
//! - [`encoding`] — Base64 payment-header encoding

pub mod amount;
pub mod encoding;
pub mod payments;
pub mod responses;

pub use amount::UsdcAmount;
pub use payments::{
    PaymentPayload, PaymentRequired, PaymentRequirements, ResourceInfo, SettleRequest,
    VerifyRequest,
};
pub use responses::{SettleResponse, SupportedKind, SupportedResponse, VerifyResponse};

/// Current protocol version.
pub const X402_VERSION: u32 = 2;

/// The payment scheme used for per-call pricing: the caller authorizes a
/// transfer of the exact listed amount.
pub const EXACT_SCHEME: &str = "exact";

/// CAIP-2 format network identifier (e.g., `"eip155:84532"`).
pub type Network = String;

/// Errors that can occur when parsing protocol messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The `x402Version` field has an unsupported value.
    #[error("unsupported x402Version: {0}")]
    InvalidVersion(u32),

    /// A required field is missing from the JSON data.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// Base64 decoding of a header value failed.
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    /// JSON deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
