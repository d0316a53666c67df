//! API-key → caller identity resolution.
//!
//! Key issuance and account management live outside the gateway; this
//! module only resolves a presented `X-Stoa-Key` header to a stored
//! caller. Keys are compared by SHA-256 digest — the raw secret is never
//! stored or logged.

use sha2::{Digest, Sha256};

use crate::catalog::{Caller, CatalogStore};
use crate::error::ApiError;

/// Name of the caller-identity header.
pub const API_KEY_HEADER: &str = "X-Stoa-Key";

/// SHA-256 hex digest of an API key, as stored in the catalog.
#[must_use]
pub fn hash_api_key(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

/// Resolves the caller identified by the request's `X-Stoa-Key` header.
///
/// # Errors
///
/// Returns [`ApiError::Auth`] when the header is missing or no caller
/// matches, [`ApiError::Store`] on storage failure.
pub async fn resolve_caller(
    store: &dyn CatalogStore,
    headers: &http::HeaderMap,
) -> Result<Caller, ApiError> {
    let key = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or(ApiError::Auth("missing X-Stoa-Key header"))?;

    let caller = store
        .caller_by_key_hash(&hash_api_key(key))
        .await?
        .ok_or(ApiError::Auth("invalid API key"))?;
    Ok(caller)
}
