//! Gateway orchestration.
//!
//! The [`Gateway`] owns the root tenant-registry replica, creates and
//! locates accounts, creates, locates and evicts sub-domain clones
//! through the bounded cache, reacts to registry changes, and issues
//! transport configuration to client clones.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinHandle;
use uuid::Uuid;

use warren_core::{Error, OwnedId, Result, Subject};
use warren_keys::{activation, Activation, KeyStore, UserKey};
use warren_replica::{
    CloneFactory, Pattern, Replica, ReplicaConfig, ReplicaUpdate, SubdomainCache, SubdomainClone,
    SubdomainSpec, TransportConfig, WriteRequest,
};

use crate::account::{AccessPolicy, Account, AccountContext, DefaultAccessPolicy, SubdomainNaming};
use crate::auth::Who;
use crate::config::GatewayConfig;
use crate::principal::GatewayPrincipal;
use crate::statements::{
    account_has_subdomain, ACCOUNT_TYPE, GATEWAY_TYPE, KEY_PROP, SUBDOMAIN_PROP,
};

/// The top-level tenant and sub-domain lifecycle orchestrator.
pub struct Gateway {
    config: GatewayConfig,
    me: GatewayPrincipal,
    root_account: String,
    registry: Arc<dyn Replica>,
    factory: Arc<dyn CloneFactory>,
    key_store: Arc<dyn KeyStore>,
    policy: Arc<dyn AccessPolicy>,
    cache: tokio::sync::Mutex<SubdomainCache>,
    watch: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Gateway {
    /// Open the gateway: load the root registry replica, ensure the
    /// root account exists bound to the gateway's own key, enliven
    /// sub-domains already registered, and begin following registry
    /// changes.
    pub async fn create(
        config: GatewayConfig,
        factory: Arc<dyn CloneFactory>,
        key_store: Arc<dyn KeyStore>,
    ) -> Result<Arc<Self>> {
        Self::create_with_policy(config, factory, key_store, Arc::new(DefaultAccessPolicy)).await
    }

    /// As [`Gateway::create`], with an application-supplied owned-type
    /// catalog and read-sharing policy.
    pub async fn create_with_policy(
        config: GatewayConfig,
        factory: Arc<dyn CloneFactory>,
        key_store: Arc<dyn KeyStore>,
        policy: Arc<dyn AccessPolicy>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let auth_key = config.parsed_auth_key()?;
        let me = GatewayPrincipal::new(&config.domain, auth_key, config.key.as_ref())?;

        let id = Uuid::new_v4().to_string();
        tracing::info!(domain = %config.domain, %id, "opening gateway registry");
        let registry = factory
            .create(
                &ReplicaConfig {
                    id,
                    domain: config.domain.clone(),
                    genesis: config.genesis,
                    reusable: config.transport.clone(),
                },
                &config.data_dir.join("gw"),
            )
            .await?;
        registry.online().await?;

        let cache_size = config.subdomain_cache_size;
        let root_account = me.auth_key().app_id.to_lowercase();
        let gateway = Arc::new(Self {
            config,
            me,
            root_account,
            registry,
            factory,
            key_store,
            policy,
            cache: tokio::sync::Mutex::new(SubdomainCache::new(cache_size)),
            watch: parking_lot::Mutex::new(None),
        });
        gateway.initialise().await?;
        Ok(gateway)
    }

    async fn initialise(self: &Arc<Self>) -> Result<()> {
        // The gateway account, bound to our key
        let mut root = Account::new(self.as_ref(), self.root_account_name());
        root.keyids.insert(self.me.auth_key().keyid.clone());
        let mut request = WriteRequest::insert(root.to_subject());
        let key_ref = format!(".{}", self.me.auth_key().keyid);
        if self.registry.get(&key_ref).await?.is_none() {
            request = request.with_insert(self.me.user_key().to_subject(false));
        }
        self.registry.apply(request).await?;

        // Enliven sub-domains already declared in the registry
        let accounts = self.registry.query(&Pattern::typ(ACCOUNT_TYPE)).await?;
        for account in accounts {
            for iri in account.references(SUBDOMAIN_PROP) {
                self.subdomain_added(self.owned_ref_as_id(&iri)).await;
            }
        }

        // Watch for sub-domains appearing and disappearing
        let mut updates = self.registry.follow();
        let weak = Arc::downgrade(self);
        let watch = tokio::spawn(async move {
            while let Some(update) = updates.recv().await {
                let Some(gateway) = weak.upgrade() else { break };
                gateway.on_registry_update(update).await;
            }
        });
        *self.watch.lock() = Some(watch);
        Ok(())
    }

    /// The gateway's own principal.
    pub fn me(&self) -> &GatewayPrincipal {
        &self.me
    }

    /// The gateway configuration.
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// An owned id under this gateway's domain.
    pub fn owned_id(&self, account: &str, name: &str) -> OwnedId {
        OwnedId::new(&self.config.domain, account, name)
    }

    /// Resolve a possibly domain-relative owned reference.
    pub fn owned_ref_as_id(&self, iri: &str) -> OwnedId {
        OwnedId::from_iri(iri, Some(&self.config.domain))
    }

    /// Get an account, optionally creating a fresh empty one. Creation
    /// happens under the registry write lock, so concurrent creators
    /// converge on one subject.
    pub async fn account(&self, name: &str, or_create: bool) -> Result<Option<Account<'_>>> {
        if let Some(subject) = self.registry.get(name).await? {
            return Ok(Some(Account::from_subject(self, &subject)));
        }
        if !or_create {
            return Ok(None);
        }
        let tx = self.registry.lock().await?;
        // Re-check under the lock; someone may have won the race
        if let Some(subject) = self.registry.get(name).await? {
            return Ok(Some(Account::from_subject(self, &subject)));
        }
        let account = Account::new(self, name);
        self.registry
            .apply_locked(&tx, WriteRequest::insert(account.to_subject()))
            .await?;
        Ok(Some(account))
    }

    /// Create-or-attach a named sub-domain for a verified caller,
    /// returning the transport configuration for the caller's own
    /// clone.
    ///
    /// Runs under a registry write transaction, guaranteeing at most
    /// one concurrent creator per name. The signature policy of an
    /// existing sub-domain is immutable: a request that contradicts it
    /// fails `Conflict`, and a removed name can never be re-created.
    pub async fn ensure_named_subdomain(
        &self,
        spec: &SubdomainSpec,
        who: &Who<'_>,
    ) -> Result<TransportConfig> {
        let id = spec.owned_id(&self.config.domain).validate()?;
        let domain = id.to_domain();

        let tx = self.registry.lock().await?;
        let mut cache = self.cache.lock().await;

        let registered = self.registry.get(&id.to_relative_iri()).await?;
        let existing = match cache.get(&domain) {
            Some(sdc) => Some(sdc.spec().clone()),
            None => registered
                .as_ref()
                .map(SubdomainSpec::from_subject)
                .transpose()?,
        };
        if let Some(existing) = &existing {
            if existing.use_signatures != spec.use_signatures {
                return Err(Error::conflict(format!(
                    "sub-domain {id} already exists with a different signature policy"
                )));
            }
        }

        let sdc = match cache.get(&domain) {
            Some(sdc) => sdc,
            None => {
                let genesis = existing.is_none();
                if genesis && self.tombstone_exists(&id).await {
                    return Err(Error::conflict(format!(
                        "sub-domain {id} was removed and its name cannot be reused"
                    )));
                }
                let sdc = self.clone_subdomain(spec.clone(), &id, genesis).await?;
                // Ensure the clone is usable before the client races us
                sdc.replica().online().await?;
                if genesis {
                    self.registry
                        .apply_locked(
                            &tx,
                            WriteRequest::insert(account_has_subdomain(&id))
                                .with_insert(spec.to_subject()),
                        )
                        .await?;
                    tracing::info!(%id, "created sub-domain");
                }
                cache.insert(domain.clone(), sdc.clone());
                sdc
            }
        };

        if spec.use_signatures {
            // The caller's verification key goes into the sub-domain so
            // write attributions can be checked without a registry round
            // trip
            let user_key = who.account.key(&who.keyid).await?;
            self.write_principal_to_subdomain(&sdc, &who.account.name, ACCOUNT_TYPE, &user_key)
                .await?;
        }

        drop(cache);
        drop(tx);
        Ok(TransportConfig {
            domain,
            genesis: false, // definitely not genesis for the client
            reusable: self.factory.reusable_config(),
        })
    }

    /// Transport configuration for a client to replicate a sub-domain
    /// independently. When genesis is not already known it is resolved
    /// from registry membership; an unregistered UUID-named sub-domain
    /// is genesis only for accounts allowing UUID naming, otherwise the
    /// automatic creation is refused `NotFound`.
    pub async fn subdomain_config(
        &self,
        id: &OwnedId,
        genesis: Option<bool>,
    ) -> Result<TransportConfig> {
        let genesis = match genesis {
            Some(genesis) => genesis,
            None => {
                let registered = self.registry.get(&id.to_relative_iri()).await?.is_some();
                if registered {
                    false
                } else if self.uuid_subdomains_allowed(id).await? {
                    true
                } else {
                    return Err(Error::not_found(format!("no such sub-domain {id}")));
                }
            }
        };
        Ok(TransportConfig {
            domain: id.to_domain(),
            genesis,
            reusable: self.factory.reusable_config(),
        })
    }

    async fn uuid_subdomains_allowed(&self, id: &OwnedId) -> Result<bool> {
        if Uuid::try_parse(&id.name).is_err() {
            return Ok(false);
        }
        let Some(account) = self.account(&id.account, false).await? else {
            return Ok(false);
        };
        Ok(account.naming.contains(&SubdomainNaming::Uuid))
    }

    /// Produce an activation for a user email: a signed claim encrypted
    /// under a one-time code. If the account already exists the email
    /// must be registered to it.
    pub async fn activation(&self, user: &str, email: &str) -> Result<Activation> {
        if let Some(account) = self.account(user, false).await? {
            if !account.emails.contains(email) {
                return Err(Error::unauthorized(format!(
                    "email {email} not registered to account {user}"
                )));
            }
        }
        let auth_key = self.me.auth_key();
        activation::issue(&auth_key.secret, &auth_key.keyid, user, email)
    }

    /// Verify an activation created by this gateway, returning the
    /// `(user, email)` it vouches for.
    pub fn verify_activation(&self, code: &str, jwe: &str) -> Result<(String, String)> {
        let claims = activation::redeem(&self.me.auth_key().secret, code, jwe)?;
        OwnedId::check_component_id(&claims.sub)?;
        let email = claims
            .email
            .ok_or_else(|| Error::unauthorized("activation names no email"))?;
        Ok((claims.sub, email))
    }

    /// Tenant-initiated removal: un-register the sub-domain from the
    /// registry. The registry watch completes the teardown (close,
    /// data removal, tombstone) asynchronously.
    pub async fn remove_subdomain(&self, id: &OwnedId) -> Result<()> {
        let tx = self.registry.lock().await?;
        let mut request = WriteRequest::delete(account_has_subdomain(id));
        if let Some(subject) = self.registry.get(&id.to_relative_iri()).await? {
            request.delete.push(subject);
        }
        self.registry.apply_locked(&tx, request).await?;
        Ok(())
    }

    /// A live clone of a sub-domain, if one is cached.
    pub async fn cached_subdomain(&self, id: &OwnedId) -> Option<Arc<SubdomainClone>> {
        self.cache.lock().await.get(&id.to_domain())
    }

    /// Stop watching, close every live clone and the registry.
    pub async fn close(&self) -> Result<()> {
        if let Some(watch) = self.watch.lock().take() {
            watch.abort();
        }
        self.cache.lock().await.clear().await;
        self.registry.close().await
    }

    async fn on_registry_update(&self, update: ReplicaUpdate) {
        for subject in &update.delete {
            for iri in subject.references(SUBDOMAIN_PROP) {
                self.subdomain_removed(self.owned_ref_as_id(&iri)).await;
            }
        }
        for subject in &update.insert {
            for iri in subject.references(SUBDOMAIN_PROP) {
                self.subdomain_added(self.owned_ref_as_id(&iri)).await;
            }
        }
    }

    /// Enliven a declared sub-domain. Failures are tolerated — the
    /// clone will be retried when it is asked for.
    async fn subdomain_added(&self, id: OwnedId) {
        let domain = id.to_domain();
        let mut cache = self.cache.lock().await;
        if cache.contains(&domain) {
            return;
        }
        let spec = match self.registered_spec(&id).await {
            Ok(Some(spec)) => spec,
            Ok(None) => SubdomainSpec::new(&id.account, &id.name, false),
            Err(e) => {
                tracing::warn!(%id, error = %e, "failed to read declared sub-domain");
                return;
            }
        };
        match self.clone_subdomain(spec, &id, false).await {
            Ok(sdc) => {
                cache.insert(domain, sdc);
                tracing::info!(%id, "loaded declared sub-domain");
            }
            Err(e) => {
                tracing::warn!(%id, error = %e, "failed to load declared sub-domain");
            }
        }
    }

    /// Tear down a removed sub-domain: close the clone, delete its
    /// data, and leave a tombstone preventing silent re-creation. All
    /// best-effort — removal is driven by an async watch with no caller
    /// to report to.
    async fn subdomain_removed(&self, id: OwnedId) {
        let domain = id.to_domain();
        if let Some(sdc) = self.cache.lock().await.remove(&domain) {
            if let Err(e) = sdc.close().await {
                tracing::warn!(%id, error = %e, "error closing removed sub-domain");
            }
        }
        let path = self.data_path(&id);
        if let Err(e) = tokio::fs::remove_dir_all(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(%id, error = %e, "error removing sub-domain data");
            }
        }
        if let Err(e) = self.write_tombstone(&id).await {
            tracing::warn!(%id, error = %e, "error writing sub-domain tombstone");
        }
        tracing::info!(%id, "removed declared sub-domain");
    }

    async fn registered_spec(&self, id: &OwnedId) -> Result<Option<SubdomainSpec>> {
        self.registry
            .get(&id.to_relative_iri())
            .await?
            .as_ref()
            .map(SubdomainSpec::from_subject)
            .transpose()
    }

    async fn clone_subdomain(
        &self,
        spec: SubdomainSpec,
        id: &OwnedId,
        genesis: bool,
    ) -> Result<Arc<SubdomainClone>> {
        let data_dir = self.data_path(id);
        tokio::fs::create_dir_all(&data_dir).await?;
        let clone_id = Uuid::new_v4().to_string();
        tracing::info!(%id, %clone_id, genesis, "cloning sub-domain");
        let replica = self
            .factory
            .create(
                &ReplicaConfig {
                    id: clone_id,
                    domain: id.to_domain(),
                    genesis,
                    reusable: self.config.transport.clone(),
                },
                &data_dir,
            )
            .await?;
        let sdc = Arc::new(SubdomainClone::new(
            spec,
            replica,
            &data_dir.join("queue.redb"),
            self.config.lock_timeout(),
        )?);
        if genesis && sdc.spec().use_signatures {
            // Our own verification key, so the sub-domain can check the
            // gateway's write attributions
            self.write_principal_to_subdomain(&sdc, "/", GATEWAY_TYPE, self.me.user_key())
                .await?;
        }
        Ok(sdc)
    }

    /// Write a principal's public key into a sub-domain for signature
    /// verification there.
    async fn write_principal_to_subdomain(
        &self,
        sdc: &SubdomainClone,
        iri: &str,
        typ: &str,
        key: &UserKey,
    ) -> Result<()> {
        let subject = Subject::new(self.absolute_id(iri)).with_type(typ).with(
            KEY_PROP,
            serde_json::to_value(key.to_subject(true))?,
        );
        sdc.write(Some(WriteRequest::insert(subject))).await?;
        sdc.unlock().await
    }

    fn absolute_id(&self, iri: &str) -> String {
        format!(
            "http://{}/{}",
            self.config.domain,
            iri.trim_start_matches('/')
        )
    }

    fn data_path(&self, id: &OwnedId) -> PathBuf {
        self.config
            .data_dir
            .join("domain")
            .join(&id.account)
            .join(&id.name)
    }

    fn tombstone_path(&self, id: &OwnedId) -> PathBuf {
        self.data_path(id).with_extension("rip")
    }

    async fn tombstone_exists(&self, id: &OwnedId) -> bool {
        tokio::fs::try_exists(self.tombstone_path(id))
            .await
            .unwrap_or(false)
    }

    async fn write_tombstone(&self, id: &OwnedId) -> Result<()> {
        let path = self.tombstone_path(id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, b"").await?;
        Ok(())
    }
}

impl AccountContext for Gateway {
    fn domain_name(&self) -> &str {
        &self.config.domain
    }

    fn root_account_name(&self) -> &str {
        &self.root_account
    }

    fn principal(&self) -> &GatewayPrincipal {
        &self.me
    }

    fn registry(&self) -> &Arc<dyn Replica> {
        &self.registry
    }

    fn key_store(&self) -> &dyn KeyStore {
        self.key_store.as_ref()
    }

    fn policy(&self) -> &dyn AccessPolicy {
        self.policy.as_ref()
    }
}
