//! The gateway's own identity.

use warren_core::{Iri, Result};
use warren_keys::{AuthKey, AuthKeyConfig, KeyPairConfig, UserKey, UserKeyConfig};

/// The gateway's principal: its authorization key and signing pair,
/// used for the root account, activation claims, and write attribution
/// in signature-enabled sub-domains.
pub struct GatewayPrincipal {
    /// Absolute IRI of the principal, `http://<domain>/`
    pub iri: Iri,
    auth_key: AuthKey,
    user_key: UserKey,
}

impl GatewayPrincipal {
    /// Construct from configuration. When no signing pair is configured
    /// a fresh one is generated, so the principal can always sign.
    pub fn new(domain: &str, auth_key: AuthKey, pair: Option<&KeyPairConfig>) -> Result<Self> {
        let user_key = match pair {
            Some(pair) => UserKey::from_config(&UserKeyConfig {
                auth: AuthKeyConfig {
                    key: auth_key.to_string(),
                },
                key: Some(pair.clone()),
            })?,
            None => UserKey::generate(&auth_key)?,
        };
        Ok(Self {
            iri: format!("http://{domain}/"),
            auth_key,
            user_key,
        })
    }

    /// The principal's authorization key.
    pub fn auth_key(&self) -> &AuthKey {
        &self.auth_key
    }

    /// The principal's signing pair.
    pub fn user_key(&self) -> &UserKey {
        &self.user_key
    }

    /// Detached-sign data as this principal.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.user_key.sign(data, &self.auth_key)
    }

    /// The client configuration for this principal's credentials.
    pub fn to_config(&self) -> UserKeyConfig {
        self.user_key.to_config(&self.auth_key)
    }
}
