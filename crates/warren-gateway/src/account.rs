//! Tenant accounts and the access-control decision function.
//!
//! An [`Account`] is the in-memory view of an `Account` subject in the
//! tenant registry. Instances are ephemeral, reconstructed on demand
//! for a single operation and never cached beyond it — the registry is
//! the only durable record.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use warren_core::{reference, Error, Iri, OwnedId, Result, Subject};
use warren_keys::{AuthKeyDetail, KeyStore, OwnedIdSource, UserKey, UserKeyConfig};
use warren_replica::{Pattern, Replica, WriteRequest, SUBDOMAIN_TYPE};

use crate::principal::GatewayPrincipal;
use crate::statements::{
    user_is_admin, ACCOUNT_TYPE, EMAIL_PROP, KEY_PROP, NAMING_PROP, PRIMARY_ACCOUNTABLE,
    REMOTES_AUTH_PROP, SUBDOMAIN_PROP,
};

/// What an account needs from its gateway.
pub trait AccountContext: Send + Sync {
    /// The gateway domain name.
    fn domain_name(&self) -> &str;
    /// The name of the account bound to the gateway's own key.
    fn root_account_name(&self) -> &str;
    /// The gateway's own principal.
    fn principal(&self) -> &GatewayPrincipal;
    /// The tenant registry replica.
    fn registry(&self) -> &Arc<dyn Replica>;
    /// The authorization key store.
    fn key_store(&self) -> &dyn KeyStore;
    /// The owned-type catalog and read-sharing policy.
    fn policy(&self) -> &dyn AccessPolicy;
}

/// An access being requested during authorization.
#[derive(Debug, Clone)]
pub struct AccessRequest {
    /// The id access is requested for
    pub id: OwnedId,
    /// Owned-entity type requested for write; `None` is read-only
    pub for_write: Option<String>,
}

impl AccessRequest {
    /// Read-only access to an id.
    pub fn read(id: OwnedId) -> Self {
        Self {
            id,
            for_write: None,
        }
    }

    /// Write access to an id of the given owned type.
    pub fn write(id: OwnedId, typ: impl Into<String>) -> Self {
        Self {
            id,
            for_write: Some(typ.into()),
        }
    }
}

/// Owned-entity catalog and read-sharing policy. The default recognizes
/// sub-domains only and shares nothing; a richer application can add
/// owned types and a sharing policy without touching the core decision
/// function.
#[async_trait]
pub trait AccessPolicy: Send + Sync {
    /// The owned-entity types accounts can hold. Each type is used
    /// lower-cased as a multi-valued account property holding the owned
    /// references.
    fn owned_types(&self) -> Vec<String> {
        vec![SUBDOMAIN_TYPE.to_string()]
    }

    /// Whether a read of `iri` is allowed for an account that does not
    /// own it. `owned` gives the requester's owned ids per type.
    async fn check_read_access(
        &self,
        registry: &Arc<dyn Replica>,
        iri: &str,
        owned: &BTreeMap<String, BTreeSet<Iri>>,
    ) -> Result<bool> {
        let (_, _, _) = (registry, iri, owned);
        Ok(false)
    }
}

/// The default policy: sub-domains only, no read sharing.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultAccessPolicy;

#[async_trait]
impl AccessPolicy for DefaultAccessPolicy {}

/// Allowed sub-domain naming schemes for an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubdomainNaming {
    /// Any valid name may be created explicitly
    Any,
    /// UUID names may be created on first access
    Uuid,
}

/// Allowed authorization schemes for remote replica connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemotesAuthType {
    /// No authentication
    Anon,
    /// Shared authorization key
    Key,
    /// Signed bearer token
    Jwt,
}

impl FromStr for SubdomainNaming {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "any" => Ok(Self::Any),
            "uuid" => Ok(Self::Uuid),
            other => Err(Error::bad_request(format!("unknown naming scheme {other:?}"))),
        }
    }
}

impl fmt::Display for SubdomainNaming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Any => "any",
            Self::Uuid => "uuid",
        })
    }
}

impl FromStr for RemotesAuthType {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "anon" => Ok(Self::Anon),
            "key" => Ok(Self::Key),
            "jwt" => Ok(Self::Jwt),
            other => Err(Error::bad_request(format!("unknown auth scheme {other:?}"))),
        }
    }
}

impl fmt::Display for RemotesAuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Anon => "anon",
            Self::Key => "key",
            Self::Jwt => "jwt",
        })
    }
}

/// A validated patch of mutable account details.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountPatch {
    /// A verified email address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// A naming scheme allowance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub naming: Option<SubdomainNaming>,
    /// A remotes auth scheme allowance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remotes_auth: Option<RemotesAuthType>,
}

impl AccountPatch {
    fn is_empty(&self) -> bool {
        self.email.is_none() && self.naming.is_none() && self.remotes_auth.is_none()
    }

    fn to_subject(&self, account: &str) -> Result<Subject> {
        let mut subject = Subject::new(account);
        if let Some(email) = &self.email {
            check_email(email)?;
            subject.insert_value(EMAIL_PROP, email.clone().into());
        }
        if let Some(naming) = &self.naming {
            subject.insert_value(NAMING_PROP, naming.to_string().into());
        }
        if let Some(auth) = &self.remotes_auth {
            subject.insert_value(REMOTES_AUTH_PROP, auth.to_string().into());
        }
        Ok(subject)
    }
}

/// An insert/delete pair of account patches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountUpdate {
    /// Details to remove
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete: Option<AccountPatch>,
    /// Details to add
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insert: Option<AccountPatch>,
}

fn check_email(email: &str) -> Result<()> {
    let valid = email
        .split_once('@')
        .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
    if valid {
        Ok(())
    } else {
        Err(Error::bad_request(format!("invalid email {email:?}")))
    }
}

/// Options for [`Account::generate_key`].
#[derive(Debug, Clone, Default)]
pub struct KeyOptions {
    /// Email to register alongside the new key
    pub email: Option<String>,
    /// Whether the returned config carries the signing pair
    pub include_signing: bool,
}

/// In-memory view of an account subject in the tenant registry.
pub struct Account<'g> {
    context: &'g dyn AccountContext,
    /// Plain account name, unique on the gateway
    pub name: String,
    /// Verifiable account identities
    pub emails: BTreeSet<String>,
    /// Registered per-device key ids
    pub keyids: BTreeSet<String>,
    /// Administrator (primary accountable) IRIs
    pub admins: BTreeSet<Iri>,
    /// Directly-owned sub-domain IRIs
    pub subdomains: Vec<Iri>,
    /// Allowed naming schemes
    pub naming: Vec<SubdomainNaming>,
    /// Allowed remote connection auth schemes
    pub remotes_auth: Vec<RemotesAuthType>,
}

impl<'g> Account<'g> {
    /// A freshly created, empty account.
    pub fn new(context: &'g dyn AccountContext, name: impl Into<String>) -> Self {
        Self {
            context,
            name: name.into(),
            emails: BTreeSet::new(),
            keyids: BTreeSet::new(),
            admins: BTreeSet::new(),
            subdomains: Vec::new(),
            naming: Vec::new(),
            remotes_auth: Vec::new(),
        }
    }

    /// Reconstruct from a registry subject.
    pub fn from_subject(context: &'g dyn AccountContext, subject: &Subject) -> Self {
        let keyids = subject
            .references(KEY_PROP)
            .iter()
            .filter_map(|iri| match UserKey::keyid_from_ref(iri) {
                Ok(keyid) => Some(keyid),
                Err(e) => {
                    tracing::warn!(account = %subject.id, error = %e, "ignoring malformed key reference");
                    None
                }
            })
            .collect();
        Self {
            context,
            name: subject.id.clone(),
            emails: subject.strings(EMAIL_PROP).into_iter().collect(),
            keyids,
            admins: subject.references(PRIMARY_ACCOUNTABLE).into_iter().collect(),
            subdomains: subject.references(SUBDOMAIN_PROP),
            naming: parse_all(&subject.strings(NAMING_PROP)),
            remotes_auth: parse_all(&subject.strings(REMOTES_AUTH_PROP)),
        }
    }

    /// Render as a registry subject.
    pub fn to_subject(&self) -> Subject {
        let mut subject = Subject::new(&self.name).with_type(ACCOUNT_TYPE);
        for email in &self.emails {
            subject.insert_value(EMAIL_PROP, email.clone().into());
        }
        for keyid in &self.keyids {
            subject.insert_value(KEY_PROP, UserKey::ref_from_keyid(keyid, None));
        }
        for admin in &self.admins {
            subject.insert_value(PRIMARY_ACCOUNTABLE, reference(admin.clone()));
        }
        for subdomain in &self.subdomains {
            subject.insert_value(SUBDOMAIN_PROP, reference(subdomain.clone()));
        }
        for naming in &self.naming {
            subject.insert_value(NAMING_PROP, naming.to_string().into());
        }
        for auth in &self.remotes_auth {
            subject.insert_value(REMOTES_AUTH_PROP, auth.to_string().into());
        }
        subject
    }

    /// Checks that the keyid belongs to this account and returns the
    /// corresponding user key from the registry. The root account's key
    /// resolves directly from the gateway principal.
    pub async fn key(&self, keyid: &str) -> Result<UserKey> {
        if !self.keyids.contains(keyid) {
            return Err(Error::unauthorized(format!(
                "key {keyid} does not belong to account {}",
                self.name
            )));
        }
        if self.name == self.context.root_account_name() {
            return Ok(self.context.principal().user_key().clone());
        }
        let subject = self
            .context
            .registry()
            .get(&format!(".{keyid}"))
            .await?
            .ok_or_else(|| Error::internal(format!("user key {keyid} not found in registry")))?;
        UserKey::from_subject(&subject)
    }

    /// Verify a keyid against this account, optionally checking an
    /// access request, and return the verified key.
    ///
    /// The key store's answer is authoritative for revocation; the root
    /// account's own key is resolved locally without a store round
    /// trip.
    pub async fn authorise(&self, keyid: &str, access: Option<&AccessRequest>) -> Result<UserKey> {
        let user_key = self.key(keyid).await?;
        if user_key.revoked {
            return Err(Error::unauthorized("key revoked"));
        }
        if let Some(access) = access {
            if !self.has_access(access).await? {
                return Err(Error::forbidden(format!(
                    "{} may not access {}",
                    self.name, access.id
                )));
            }
        }
        if self.name == self.context.root_account_name() {
            return Ok(self.context.principal().user_key().clone());
        }
        let detail: Option<AuthKeyDetail> = self
            .context
            .key_store()
            .ping_key(keyid, &AccountOwned { account: self })
            .await
            .map_err(|e| Error::unauthorized(format!("key {keyid} not pingable: {e}")))?;
        if detail.is_some_and(|d| d.revoked) {
            return Err(Error::unauthorized("key revoked"));
        }
        Ok(user_key)
    }

    /// The access-control decision function.
    pub async fn has_access(&self, access: &AccessRequest) -> Result<bool> {
        let iri = access.id.to_relative_iri();
        let owned_types = self.context.policy().owned_types();
        if let Some(for_write) = &access.for_write {
            if !owned_types.contains(for_write) {
                return Err(Error::bad_request(format!(
                    "not a recognised type: {for_write}"
                )));
            }
        }
        let mut writable = BTreeMap::new();
        for typ in &owned_types {
            writable.insert(typ.clone(), self.load_all_owned(typ).await?);
        }
        let registry = self.context.registry();
        let exists = registry.ask(&Pattern::id(&iri)).await?;
        if let (Some(for_write), false) = (&access.for_write, exists) {
            // Creating: requires write access to the parent account
            if !self.has_write_access(&access.id.account).await? {
                return Ok(false);
            }
            // OK to create; provisionally owned for the rest of the check
            if let Some(owned) = writable.get_mut(for_write) {
                owned.insert(iri);
            }
            Ok(true)
        } else if !writable.values().any(|owned| owned.contains(&iri)) {
            if access.for_write.is_some() {
                // A foreign existing entity is never writable
                Ok(false)
            } else {
                self.context
                    .policy()
                    .check_read_access(registry, &iri, &writable)
                    .await
            }
        } else {
            Ok(true)
        }
    }

    /// Whether this account may write into `to_account`'s namespace:
    /// its own, or an organization registering it as an administrator.
    async fn has_write_access(&self, to_account: &str) -> Result<bool> {
        if to_account == self.name {
            return Ok(true);
        }
        self.context
            .registry()
            .ask(&user_is_admin(&self.name, to_account))
            .await
    }

    /// All ids of a type this account owns, directly or via
    /// organizations where it is an administrator.
    pub async fn load_all_owned(&self, typ: &str) -> Result<BTreeSet<Iri>> {
        let mut owned: BTreeSet<Iri> = if typ == SUBDOMAIN_TYPE {
            self.subdomains.iter().cloned().collect()
        } else {
            BTreeSet::new()
        };
        let orgs = self
            .context
            .registry()
            .query(
                &Pattern::typ(ACCOUNT_TYPE)
                    .containing(PRIMARY_ACCOUNTABLE, reference(&self.name)),
            )
            .await?;
        for org in orgs {
            owned.extend(org.references(&typ.to_lowercase()));
        }
        Ok(owned)
    }

    /// The owned sub-domain identities, for key-store pings.
    pub async fn all_subdomain_ids(&self) -> Result<Vec<OwnedId>> {
        Ok(self
            .load_all_owned(SUBDOMAIN_TYPE)
            .await?
            .iter()
            .map(|iri| OwnedId::from_iri(iri, Some(self.context.domain_name())))
            .collect())
    }

    /// Mint a brand-new key for this account — one key per device or
    /// activation, never reused — registering it and the optional email
    /// in the registry. The returned config never carries revocation
    /// status: a distributed key is assumed valid until the store says
    /// otherwise.
    pub async fn generate_key(&mut self, opts: KeyOptions) -> Result<UserKeyConfig> {
        if let Some(email) = &opts.email {
            check_email(email)?;
        }
        let detail = self
            .context
            .key_store()
            .mint_key(&format!("{}@{}", self.name, self.context.domain_name()))
            .await?;
        let user_key = UserKey::generate(&detail.key)?;

        let mut patch = Subject::new(&self.name)
            .with_type(ACCOUNT_TYPE)
            .with(KEY_PROP, UserKey::ref_from_keyid(&detail.key.keyid, None));
        if let Some(email) = &opts.email {
            patch.insert_value(EMAIL_PROP, email.clone().into());
        }
        self.context
            .registry()
            .apply(
                WriteRequest::insert(user_key.to_subject(false)).with_insert(patch),
            )
            .await?;

        self.keyids.insert(detail.key.keyid.clone());
        if let Some(email) = opts.email {
            self.emails.insert(email);
        }

        let mut config = user_key.to_config(&detail.key);
        if !opts.include_signing {
            config.key = None;
        }
        Ok(config)
    }

    /// Apply a validated detail patch to this account in the registry.
    pub async fn update(&self, update: &AccountUpdate) -> Result<()> {
        let mut request = WriteRequest::default();
        if let Some(delete) = &update.delete {
            if !delete.is_empty() {
                request.delete.push(delete.to_subject(&self.name)?);
            }
        }
        if let Some(insert) = &update.insert {
            if !insert.is_empty() {
                request.insert.push(insert.to_subject(&self.name)?);
            }
        }
        if request.is_empty() {
            return Err(Error::bad_request("empty account update"));
        }
        self.context.registry().apply(request).await?;
        Ok(())
    }
}

impl fmt::Debug for Account<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("name", &self.name)
            .field("emails", &self.emails)
            .field("keyids", &self.keyids)
            .field("admins", &self.admins)
            .field("subdomains", &self.subdomains)
            .finish()
    }
}

/// Lazy owned-id source handed to key-store pings.
struct AccountOwned<'a, 'g> {
    account: &'a Account<'g>,
}

#[async_trait]
impl OwnedIdSource for AccountOwned<'_, '_> {
    async fn owned_ids(&self) -> Result<Vec<OwnedId>> {
        self.account.all_subdomain_ids().await
    }
}

fn parse_all<T: FromStr>(values: &[String]) -> Vec<T> {
    values.iter().filter_map(|v| v.parse().ok()).collect()
}
