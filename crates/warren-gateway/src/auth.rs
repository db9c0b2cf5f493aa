//! Request credential verification.
//!
//! Two strategies, selected by the credential scheme a request
//! presents: a shared authorization key, or a bearer token signed with
//! a registered user key. Both resolve to a [`Who`] — a verified
//! `(account, keyid)` pair that downstream operations use without
//! re-checking credentials.

use warren_core::{Error, OwnedId, Result};
use warren_keys::{jwt, AuthKey};

use crate::account::{AccessRequest, Account};
use crate::gateway::Gateway;

/// A verified caller: the account and the keyid that vouched for it.
pub struct Who<'g> {
    /// The verified account
    pub account: Account<'g>,
    /// The keyid credentials were verified against
    pub keyid: String,
}

impl std::fmt::Debug for Who<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Who")
            .field("account", &self.account.name)
            .field("keyid", &self.keyid)
            .finish()
    }
}

/// Credentials presented with a request.
#[derive(Debug, Clone)]
pub enum Authorization {
    /// Shared-secret authorization: user name plus key string
    Key {
        /// Claimed account name
        user: String,
        /// Presented authorization key, `app.keyid:secret`
        key: String,
    },
    /// Bearer token signed with a registered user key
    Bearer {
        /// The presented token
        jwt: String,
    },
}

impl Authorization {
    /// Shared-key credentials, e.g. from HTTP Basic.
    pub fn key(user: impl Into<String>, key: impl Into<String>) -> Self {
        Self::Key {
            user: user.into(),
            key: key.into(),
        }
    }

    /// Bearer-token credentials.
    pub fn bearer(jwt: impl Into<String>) -> Self {
        Self::Bearer { jwt: jwt.into() }
    }

    /// Verify these credentials against the gateway, optionally
    /// checking an access request in the same step.
    pub async fn verify<'g>(
        &self,
        gateway: &'g Gateway,
        access: Option<AccessRequest>,
    ) -> Result<Who<'g>> {
        match self {
            Self::Key { user, key } => {
                let account = user_account(gateway, user).await?;
                let auth_key: AuthKey = key
                    .parse()
                    .map_err(|_| Error::unauthorized("malformed authorization key"))?;
                let user_key = account.authorise(&auth_key.keyid, access.as_ref()).await?;
                // Guard against keyid/secret substitution
                if !user_key.matches(&auth_key) {
                    return Err(Error::unauthorized("key mismatch"));
                }
                Ok(Who {
                    keyid: auth_key.keyid,
                    account,
                })
            }
            Self::Bearer { jwt } => {
                // Decode (not yet verify) to learn the claimed account
                let claims = jwt::decode_claims_unverified(jwt)?;
                let account = user_account(gateway, &claims.sub).await?;
                let keyid = jwt::decode_header(jwt)?
                    .kid
                    .ok_or_else(|| Error::unauthorized("token names no key"))?;
                // Authorization and verification happen in the same
                // step, so a revoked or foreign key cannot validate a
                // token
                let user_key = account.authorise(&keyid, access.as_ref()).await?;
                jwt::verify_eddsa(jwt, &user_key.decoding_key()?)?;
                Ok(Who { account, keyid })
            }
        }
    }
}

async fn user_account<'g>(gateway: &'g Gateway, user: &str) -> Result<Account<'g>> {
    if !OwnedId::is_component_id(user) {
        return Err(Error::unauthorized(format!("bad user {user:?}")));
    }
    gateway
        .account(user, false)
        .await?
        .ok_or_else(|| Error::unauthorized(format!("not found: {user}")))
}
