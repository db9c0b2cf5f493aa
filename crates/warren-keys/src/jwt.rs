//! JWT issue and verification helpers.
//!
//! Two algorithms are in play: HS256 under the gateway's own auth-key
//! secret for short-lived activation claims, and EdDSA under per-user
//! signing keys for bearer tokens. Unverified decoding is provided for
//! the bearer flow, which must learn the claimed issuer before it can
//! select the verification key.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use warren_core::{Error, Result};

/// Claims carried by gateway-issued and gateway-verified tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: an account name
    pub sub: String,
    /// Email being activated, on activation claims
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Expiry, seconds since epoch
    pub exp: u64,
    /// Issued at, seconds since epoch
    pub iat: u64,
}

/// Current time in seconds since the epoch.
pub fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Sign claims with HS256 under a shared secret, stamping the keyid.
pub fn sign_hs256(claims: &Claims, secret: &str, kid: &str) -> Result<String> {
    let mut header = Header::new(Algorithm::HS256);
    header.kid = Some(kid.to_string());
    jsonwebtoken::encode(&header, claims, &EncodingKey::from_secret(secret.as_bytes()))
        .map_err(|e| Error::internal(format!("token signing: {e}")))
}

/// Verify an HS256 token under a shared secret. Enforces expiry.
pub fn verify_hs256(token: &str, secret: &str) -> Result<Claims> {
    let validation = Validation::new(Algorithm::HS256);
    jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|e| Error::unauthorized(format!("invalid token: {e}")))
}

/// Verify an EdDSA token against a prepared verification key. Enforces
/// expiry.
pub fn verify_eddsa(token: &str, key: &DecodingKey) -> Result<Claims> {
    let validation = Validation::new(Algorithm::EdDSA);
    jsonwebtoken::decode::<Claims>(token, key, &validation)
        .map(|data| data.claims)
        .map_err(|e| Error::unauthorized(format!("invalid token: {e}")))
}

/// Decode a token header without verification.
pub fn decode_header(token: &str) -> Result<Header> {
    jsonwebtoken::decode_header(token)
        .map_err(|e| Error::unauthorized(format!("undecodable token header: {e}")))
}

/// Decode token claims without verification. Used only to learn the
/// claimed issuer for key selection; never trust these claims.
pub fn decode_claims_unverified(token: &str) -> Result<Claims> {
    let mut parts = token.split('.');
    let payload = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(payload), Some(_), None) => payload,
        _ => return Err(Error::unauthorized("token must have three parts")),
    };
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| Error::unauthorized(format!("undecodable token payload: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| Error::unauthorized(format!("unreadable token claims: {e}")))
}
