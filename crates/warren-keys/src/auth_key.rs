//! Shared-secret authorization keys and the pluggable key store.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use warren_core::{Error, OwnedId, Result};

/// An authorization key with app, keyid and secret components.
///
/// Canonical string form is `<app>.<keyid>:<secret>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthKey {
    /// Application id, scoping keys on multi-app gateways
    pub app_id: String,
    /// Key id, scoped to the app; safe to appear in identifiers
    pub keyid: String,
    /// Secret material
    pub secret: String,
}

impl FromStr for AuthKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parsed = s
            .split_once(':')
            .and_then(|(key_name, secret)| {
                let (app_id, keyid) = key_name.split_once('.')?;
                Some(Self {
                    app_id: app_id.to_string(),
                    keyid: keyid.to_string(),
                    secret: secret.to_string(),
                })
            })
            .ok_or_else(|| Error::bad_request(format!("{s:?} is not a valid authorization key")))?;
        // Round-trip check traps stray delimiters in the components
        if parsed.to_string() != s {
            return Err(Error::bad_request(format!(
                "{s:?} is not a valid authorization key"
            )));
        }
        Ok(parsed)
    }
}

impl fmt::Display for AuthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}:{}", self.app_id, self.keyid, self.secret)
    }
}

/// Full details of an authorization key, as held by a key store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthKeyDetail {
    /// The complete key including secret
    pub key: AuthKey,
    /// Friendly name, e.g. `account@gateway`
    pub name: String,
    /// Revocation status
    pub revoked: bool,
}

/// Lazy source of the account-owned ids relevant to a key, consulted by
/// stores that track fine-grained capabilities.
#[async_trait]
pub trait OwnedIdSource: Send + Sync {
    /// The ids the pinged key's account currently owns.
    async fn owned_ids(&self) -> Result<Vec<OwnedId>>;
}

/// A persistent store of authorization keys.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Mint a new authorization key with the given friendly name.
    async fn mint_key(&self, name: &str) -> Result<AuthKeyDetail>;

    /// Ping the given keyid. This checks that the key exists and may update
    /// its privileges from the owned-id source. Returns `None` if this
    /// store does not track revocation for the key, in which case locally
    /// held key material should be trusted.
    async fn ping_key(
        &self,
        keyid: &str,
        owned: &dyn OwnedIdSource,
    ) -> Result<Option<AuthKeyDetail>>;
}

/// A key store scoped to a gateway domain that mints random key material
/// and does not track revocation.
#[derive(Debug, Clone)]
pub struct DomainKeyStore {
    app_id: String,
}

impl DomainKeyStore {
    /// Create a store for the given gateway domain name. The app id is a
    /// short stable digest of the domain.
    pub fn new(domain: &str) -> Self {
        let digest = Sha256::digest(domain.as_bytes());
        Self {
            app_id: hex::encode(&digest[..4]),
        }
    }

    /// The app id stamped on every minted key.
    pub fn app_id(&self) -> &str {
        &self.app_id
    }
}

#[async_trait]
impl KeyStore for DomainKeyStore {
    async fn mint_key(&self, name: &str) -> Result<AuthKeyDetail> {
        let mut material = [0u8; 40];
        rand::thread_rng().fill_bytes(&mut material);
        let key = AuthKey {
            app_id: self.app_id.clone(),
            keyid: hex::encode(&material[..4]),
            secret: {
                use base64::engine::general_purpose::URL_SAFE_NO_PAD;
                use base64::Engine;
                URL_SAFE_NO_PAD.encode(&material[4..])
            },
        };
        Ok(AuthKeyDetail {
            key,
            name: name.to_string(),
            revoked: false,
        })
    }

    async fn ping_key(
        &self,
        _keyid: &str,
        _owned: &dyn OwnedIdSource,
    ) -> Result<Option<AuthKeyDetail>> {
        // No revocation status stored
        Ok(None)
    }
}
