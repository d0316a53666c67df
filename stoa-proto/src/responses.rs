//! Facilitator response types.
//!
//! These types carry the facilitator's answers during payment verification
//! and settlement, and its capability advertisement used by the gateway's
//! readiness probe.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Network;

/// Response from payment verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    /// Whether the payment assertion is valid.
    pub is_valid: bool,

    /// Machine-readable reason for invalidity (if `is_valid` is false).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<String>,

    /// Human-readable message for invalidity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_message: Option<String>,

    /// The payer's address (if known).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
}

impl VerifyResponse {
    /// Creates a valid verification response.
    #[must_use]
    pub fn valid(payer: impl Into<String>) -> Self {
        Self {
            is_valid: true,
            invalid_reason: None,
            invalid_message: None,
            payer: Some(payer.into()),
        }
    }

    /// Creates an invalid verification response.
    #[must_use]
    pub fn invalid(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            invalid_reason: Some(reason.into()),
            invalid_message: Some(message.into()),
            payer: None,
        }
    }
}

/// Response from payment settlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleResponse {
    /// Whether settlement was successful.
    pub success: bool,

    /// Machine-readable reason for failure (if `success` is false).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,

    /// Human-readable message for failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// The payer's address (if known).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,

    /// On-chain transaction hash; empty on failure.
    pub transaction: String,

    /// Network where settlement occurred.
    pub network: Network,
}

impl SettleResponse {
    /// Creates a successful settlement response.
    #[must_use]
    pub fn success(
        transaction: impl Into<String>,
        network: impl Into<String>,
        payer: impl Into<String>,
    ) -> Self {
        Self {
            success: true,
            error_reason: None,
            error_message: None,
            payer: Some(payer.into()),
            transaction: transaction.into(),
            network: network.into(),
        }
    }

    /// Creates a failed settlement response.
    #[must_use]
    pub fn error(
        reason: impl Into<String>,
        message: impl Into<String>,
        network: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            error_reason: Some(reason.into()),
            error_message: Some(message.into()),
            payer: None,
            transaction: String::new(),
            network: network.into(),
        }
    }
}

/// A supported payment configuration: one (version, scheme, network) triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportedKind {
    /// Protocol version for this kind.
    pub x402_version: u32,

    /// Payment scheme identifier (e.g., `"exact"`).
    pub scheme: String,

    /// CAIP-2 network identifier.
    pub network: Network,

    /// Additional scheme-specific data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

/// Capability advertisement from a facilitator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportedResponse {
    /// List of supported payment kinds.
    pub kinds: Vec<SupportedKind>,

    /// Map of CAIP family pattern to signer addresses.
    #[serde(default)]
    pub signers: HashMap<String, Vec<String>>,
}

impl SupportedResponse {
    /// Returns `true` if the facilitator supports the given scheme on the
    /// given network.
    #[must_use]
    pub fn supports(&self, scheme: &str, network: &str) -> bool {
        self.kinds
            .iter()
            .any(|k| k.scheme == scheme && k.network == network)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_response_wire_shape() {
        let ok = VerifyResponse::valid("0xPayer");
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["isValid"], true);
        assert_eq!(json["payer"], "0xPayer");
        assert!(json.get("invalidReason").is_none());

        let bad = VerifyResponse::invalid("insufficient_funds", "balance too low");
        let json = serde_json::to_value(&bad).unwrap();
        assert_eq!(json["isValid"], false);
        assert_eq!(json["invalidReason"], "insufficient_funds");
    }

    #[test]
    fn settle_response_wire_shape() {
        let ok = SettleResponse::success("0xabc123", "eip155:84532", "0xPayer");
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["transaction"], "0xabc123");

        let err = SettleResponse::error("transfer_reverted", "nonce already used", "eip155:84532");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["errorReason"], "transfer_reverted");
        assert_eq!(json["transaction"], "");
    }

    #[test]
    fn supported_lookup() {
        let supported = SupportedResponse {
            kinds: vec![SupportedKind {
                x402_version: 2,
                scheme: "exact".into(),
                network: "eip155:84532".into(),
                extra: None,
            }],
            signers: HashMap::new(),
        };
        assert!(supported.supports("exact", "eip155:84532"));
        assert!(!supported.supports("exact", "eip155:8453"));
    }
}
