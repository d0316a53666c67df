//! Challenge and payload types for the per-call payment protocol.
//!
//! A 402 response carries a [`PaymentRequired`] challenge describing the
//! accepted payment option(s) for one specific call. The caller answers
//! with a [`PaymentPayload`] whose `accepted` field echoes the chosen
//! requirements — including the call nonce — which is what binds the
//! assertion to a single (service, price, nonce) tuple.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Network;
use crate::amount::UsdcAmount;

/// Describes the resource (service call) being paid for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInfo {
    /// The URL of the resource, e.g. `https://gateway.example/services/{id}/call`.
    pub url: String,

    /// Optional human-readable description (typically the service name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Optional MIME type of the resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Payment requirements for a single service call.
///
/// The `resource` and `nonce` fields scope an eventual payment assertion
/// to exactly one call; a settled nonce cannot be spent again.
///
/// # JSON Format
///
/// ```json
/// {
///   "scheme": "exact",
///   "network": "eip155:84532",
///   "asset": "0x036CbD53842c5426634e7929541eC2318f3dCF7e",
///   "amount": "50000",
///   "payTo": "0x...",
///   "maxTimeoutSeconds": 60,
///   "resource": "https://gateway.example/services/1b.../call",
///   "nonce": "7f4df3e0-...",
///   "extra": {}
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    /// Payment scheme identifier (e.g., `"exact"`).
    pub scheme: String,

    /// CAIP-2 network identifier (e.g., `"eip155:84532"`).
    pub network: Network,

    /// Asset address/identifier (the USDC contract address).
    pub asset: String,

    /// Exact price of the call in micro-USDC.
    pub amount: UsdcAmount,

    /// Recipient address (the service owner).
    pub pay_to: String,

    /// Maximum time in seconds for the payment authorization to remain valid.
    pub max_timeout_seconds: u64,

    /// URL of the service call this payment is for.
    pub resource: String,

    /// Single-use value binding the assertion to one call.
    pub nonce: String,

    /// Additional scheme-specific data (e.g., EIP-712 domain params).
    #[serde(default = "default_empty_object")]
    pub extra: Value,
}

/// Body of a 402 Payment Required response.
///
/// # JSON Format
///
/// ```json
/// {
///   "x402Version": 2,
///   "error": "Payment required",
///   "resource": { "url": "...", "description": "Chest X-Ray Analysis" },
///   "accepts": [{ "scheme": "exact", "network": "eip155:84532", ... }]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequired {
    /// Protocol version.
    #[serde(default = "default_version")]
    pub x402_version: u32,

    /// Optional error message explaining why payment is required.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Information about the resource being paid for.
    pub resource: ResourceInfo,

    /// List of accepted payment requirements.
    pub accepts: Vec<PaymentRequirements>,
}

/// Payment assertion sent by the caller to fulfill a challenge.
///
/// The `accepted` field echoes the requirements the caller chose from the
/// challenge; the opaque `payload` carries the scheme-specific signed
/// authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload {
    /// Protocol version.
    #[serde(default = "default_version")]
    pub x402_version: u32,

    /// Scheme-specific payload data (signature, authorization, …).
    pub payload: Value,

    /// The payment requirements being fulfilled.
    pub accepted: PaymentRequirements,
}

impl PaymentPayload {
    /// Returns the payment scheme from the accepted requirements.
    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.accepted.scheme
    }

    /// Returns the network from the accepted requirements.
    #[must_use]
    pub fn network(&self) -> &str {
        &self.accepted.network
    }

    /// Returns the call nonce this assertion is bound to.
    #[must_use]
    pub fn nonce(&self) -> &str {
        &self.accepted.nonce
    }
}

/// Request to verify a payment against the facilitator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    /// The payment payload to verify.
    pub payment_payload: PaymentPayload,

    /// The requirements to verify against.
    pub payment_requirements: PaymentRequirements,
}

/// Request to settle a verified payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleRequest {
    /// The payment payload to settle.
    pub payment_payload: PaymentPayload,

    /// The requirements for settlement.
    pub payment_requirements: PaymentRequirements,
}

impl From<VerifyRequest> for SettleRequest {
    fn from(value: VerifyRequest) -> Self {
        Self {
            payment_payload: value.payment_payload,
            payment_requirements: value.payment_requirements,
        }
    }
}

const fn default_version() -> u32 {
    crate::X402_VERSION
}

fn default_empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn requirements() -> PaymentRequirements {
        PaymentRequirements {
            scheme: "exact".into(),
            network: "eip155:84532".into(),
            asset: "0x036CbD53842c5426634e7929541eC2318f3dCF7e".into(),
            amount: UsdcAmount::from_micros(50_000),
            pay_to: "0xOwner".into(),
            max_timeout_seconds: 60,
            resource: "https://gateway.example/services/abc/call".into(),
            nonce: "7f4df3e0-8d2c-4a61-9e0f-1f2a3b4c5d6e".into(),
            extra: Value::Object(serde_json::Map::new()),
        }
    }

    #[test]
    fn challenge_uses_camel_case_wire_names() {
        let challenge = PaymentRequired {
            x402_version: crate::X402_VERSION,
            error: Some("Payment required".into()),
            resource: ResourceInfo {
                url: "https://gateway.example/services/abc/call".into(),
                description: Some("Chest X-Ray Analysis".into()),
                mime_type: Some("application/json".into()),
            },
            accepts: vec![requirements()],
        };
        let json = serde_json::to_value(&challenge).unwrap();
        assert_eq!(json["x402Version"], 2);
        assert_eq!(json["accepts"][0]["payTo"], "0xOwner");
        assert_eq!(json["accepts"][0]["maxTimeoutSeconds"], 60);
        assert_eq!(json["accepts"][0]["amount"], "50000");
        assert_eq!(json["resource"]["mimeType"], "application/json");
    }

    #[test]
    fn payload_round_trips_and_exposes_binding() {
        let payload = PaymentPayload {
            x402_version: crate::X402_VERSION,
            payload: serde_json::json!({ "signature": "0xsig" }),
            accepted: requirements(),
        };
        let json = serde_json::to_string(&payload).unwrap();
        let back: PaymentPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
        assert_eq!(back.scheme(), "exact");
        assert_eq!(back.nonce(), "7f4df3e0-8d2c-4a61-9e0f-1f2a3b4c5d6e");
    }
}
