//! # Warren Keys
//!
//! Credential material for the Warren gateway: shared-secret
//! authorization keys and the pluggable store that mints and pings them,
//! per-user Ed25519 signing keys with sealed private halves, JWT helpers
//! for both the HS256 (gateway-secret) and EdDSA (user-key) flows, and
//! the two-layer activation token scheme.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod activation;
pub mod auth_key;
pub mod jwt;
pub mod user_key;

pub use activation::{Activation, ACTIVATION_TTL_SECS};
pub use auth_key::{AuthKey, AuthKeyDetail, DomainKeyStore, KeyStore, OwnedIdSource};
pub use jwt::Claims;
pub use user_key::{AuthKeyConfig, KeyPairConfig, UserKey, UserKeyConfig, USER_KEY_TYPE};
