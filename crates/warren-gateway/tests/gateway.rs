//! End-to-end gateway behavior over the in-process replica engine.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use warren_core::{reference, Error, Result, Subject};
use warren_gateway::statements::PRIMARY_ACCOUNTABLE;
use warren_gateway::{
    AccessRequest, AccountContext, AccountPatch, AccountUpdate, Authorization, Gateway,
    GatewayConfig, KeyOptions, SubdomainNaming, Who,
};
use warren_keys::{jwt, AuthKey, AuthKeyDetail, DomainKeyStore, KeyStore, OwnedIdSource, UserKey};
use warren_replica::{MemoryCloneFactory, Replica, SubdomainSpec, WriteRequest, SUBDOMAIN_TYPE};

/// Key store that tracks revocation, so tests can flip it.
struct RevokableKeyStore {
    inner: DomainKeyStore,
    minted: Mutex<HashMap<String, AuthKeyDetail>>,
    revoked: Mutex<HashSet<String>>,
}

impl RevokableKeyStore {
    fn new(domain: &str) -> Self {
        Self {
            inner: DomainKeyStore::new(domain),
            minted: Mutex::new(HashMap::new()),
            revoked: Mutex::new(HashSet::new()),
        }
    }

    fn revoke(&self, keyid: &str) {
        self.revoked.lock().insert(keyid.to_string());
    }
}

#[async_trait]
impl KeyStore for RevokableKeyStore {
    async fn mint_key(&self, name: &str) -> Result<AuthKeyDetail> {
        let detail = self.inner.mint_key(name).await?;
        self.minted
            .lock()
            .insert(detail.key.keyid.clone(), detail.clone());
        Ok(detail)
    }

    async fn ping_key(
        &self,
        keyid: &str,
        owned: &dyn OwnedIdSource,
    ) -> Result<Option<AuthKeyDetail>> {
        // A real store would refresh fine-grained privileges from these
        let _ = owned.owned_ids().await?;
        Ok(self.minted.lock().get(keyid).map(|detail| AuthKeyDetail {
            revoked: self.revoked.lock().contains(keyid),
            ..detail.clone()
        }))
    }
}

struct Fixture {
    gateway: Arc<Gateway>,
    factory: Arc<MemoryCloneFactory>,
    key_store: Arc<RevokableKeyStore>,
    config: GatewayConfig,
    _dir: tempfile::TempDir,
}

async fn fixture() -> Fixture {
    fixture_with_cache_size(100).await
}

async fn fixture_with_cache_size(cache_size: usize) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let config = GatewayConfig {
        domain: "ex.org".into(),
        address: "https://ex.org".into(),
        auth_key: "gw.rootkey1:gwsecret".into(),
        key: None,
        data_dir: dir.path().to_path_buf(),
        genesis: true,
        subdomain_cache_size: cache_size,
        lock_timeout_ms: Some(5_000),
        smtp: None,
        transport: Default::default(),
    };
    let factory = Arc::new(MemoryCloneFactory::new());
    let key_store = Arc::new(RevokableKeyStore::new("ex.org"));
    let gateway = Gateway::create(config.clone(), factory.clone(), key_store.clone())
        .await
        .unwrap();
    Fixture {
        gateway,
        factory,
        key_store,
        config,
        _dir: dir,
    }
}

/// Register an account with one key; returns its auth key.
async fn registered_account(gateway: &Gateway, name: &str) -> AuthKey {
    let mut account = gateway.account(name, true).await.unwrap().unwrap();
    let config = account
        .generate_key(KeyOptions {
            email: Some(format!("{name}@mail.ex.org")),
            include_signing: true,
        })
        .await
        .unwrap();
    config.auth.key.parse().unwrap()
}

async fn verified<'g>(gateway: &'g Gateway, name: &str, auth_key: &AuthKey) -> Who<'g> {
    Authorization::key(name, auth_key.to_string())
        .verify(gateway, None)
        .await
        .unwrap()
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_root_account_exists_after_initialise() {
    let f = fixture().await;
    let root = f.gateway.account("gw", false).await.unwrap().unwrap();
    assert!(root.keyids.contains("rootkey1"));
}

#[tokio::test]
async fn test_authorise_is_idempotent_until_revoked() {
    let f = fixture().await;
    let auth_key = registered_account(&f.gateway, "acme").await;

    let account = f.gateway.account("acme", false).await.unwrap().unwrap();
    let first = account.authorise(&auth_key.keyid, None).await.unwrap();
    let second = account.authorise(&auth_key.keyid, None).await.unwrap();
    assert_eq!(first.keyid, second.keyid);
    assert_eq!(first.public_bytes(), second.public_bytes());

    // Once the store reports revocation, the next check fails
    f.key_store.revoke(&auth_key.keyid);
    let err = account.authorise(&auth_key.keyid, None).await.unwrap_err();
    assert!(matches!(err, Error::Unauthorized { .. }));
}

#[tokio::test]
async fn test_unregistered_key_is_unauthorized_regardless_of_access() {
    let f = fixture().await;
    let account = f.gateway.account("acme", true).await.unwrap().unwrap();
    let access = AccessRequest::write(f.gateway.owned_id("acme", "proj1"), SUBDOMAIN_TYPE);
    let err = account.authorise("k1", Some(&access)).await.unwrap_err();
    assert!(matches!(err, Error::Unauthorized { .. }));
}

#[tokio::test]
async fn test_org_admin_creates_on_behalf_of_org() {
    let f = fixture().await;
    let auth_key = registered_account(&f.gateway, "acme").await;
    f.gateway.account("org1", true).await.unwrap().unwrap();
    // org1 registers acme as primary accountable
    f.gateway
        .registry()
        .apply(WriteRequest::insert(
            Subject::new("org1").with(PRIMARY_ACCOUNTABLE, reference("acme")),
        ))
        .await
        .unwrap();

    let id = f.gateway.owned_id("org1", "ts1");
    let access = AccessRequest::write(id.clone(), SUBDOMAIN_TYPE);
    let who = Authorization::key("acme", auth_key.to_string())
        .verify(&f.gateway, Some(access))
        .await
        .unwrap();

    f.gateway
        .ensure_named_subdomain(&SubdomainSpec::new("org1", "ts1", false), &who)
        .await
        .unwrap();

    // org1/ts1 is owned by acme thereafter, via the organization
    let account = f.gateway.account("acme", false).await.unwrap().unwrap();
    assert!(account
        .has_access(&AccessRequest::write(id, SUBDOMAIN_TYPE))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_foreign_subdomain_is_not_writable_or_readable() {
    let f = fixture().await;
    let acme_key = registered_account(&f.gateway, "acme").await;
    let other_key = registered_account(&f.gateway, "other").await;

    let who = verified(&f.gateway, "acme", &acme_key).await;
    f.gateway
        .ensure_named_subdomain(&SubdomainSpec::new("acme", "sd1", false), &who)
        .await
        .unwrap();

    let id = f.gateway.owned_id("acme", "sd1");
    let other = f.gateway.account("other", false).await.unwrap().unwrap();
    let write_err = other
        .authorise(
            &other_key.keyid,
            Some(&AccessRequest::write(id.clone(), SUBDOMAIN_TYPE)),
        )
        .await
        .unwrap_err();
    assert!(matches!(write_err, Error::Forbidden { .. }));
    // Default read policy shares nothing
    let read_err = other
        .authorise(&other_key.keyid, Some(&AccessRequest::read(id)))
        .await
        .unwrap_err();
    assert!(matches!(read_err, Error::Forbidden { .. }));
}

#[tokio::test]
async fn test_key_authorization_rejects_wrong_secret() {
    let f = fixture().await;
    let auth_key = registered_account(&f.gateway, "acme").await;

    let who = verified(&f.gateway, "acme", &auth_key).await;
    assert_eq!(who.account.name, "acme");
    assert_eq!(who.keyid, auth_key.keyid);

    let mut wrong = auth_key.clone();
    wrong.secret = "forged".into();
    let err = Authorization::key("acme", wrong.to_string())
        .verify(&f.gateway, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Unauthorized { .. }));

    let err = Authorization::key("Not A User!", auth_key.to_string())
        .verify(&f.gateway, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Unauthorized { .. }));
}

#[tokio::test]
async fn test_bearer_authorization_verifies_and_respects_revocation() {
    let f = fixture().await;
    let mut account = f.gateway.account("acme", true).await.unwrap().unwrap();
    let config = account
        .generate_key(KeyOptions {
            email: None,
            include_signing: true,
        })
        .await
        .unwrap();
    let auth_key: AuthKey = config.auth.key.parse().unwrap();
    let user_key = UserKey::from_config(&config).unwrap();

    let claims = warren_keys::Claims {
        sub: "acme".into(),
        email: None,
        exp: jwt::now() + 600,
        iat: jwt::now(),
    };
    let token = user_key.sign_jwt(&claims, &auth_key).unwrap();

    let who = Authorization::bearer(&token)
        .verify(&f.gateway, None)
        .await
        .unwrap();
    assert_eq!(who.account.name, "acme");
    assert_eq!(who.keyid, auth_key.keyid);

    // A token for an unknown issuer never validates
    let foreign = warren_keys::Claims {
        sub: "ghost".into(),
        ..claims.clone()
    };
    let foreign_token = user_key.sign_jwt(&foreign, &auth_key).unwrap();
    let err = Authorization::bearer(&foreign_token)
        .verify(&f.gateway, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Unauthorized { .. }));

    // A revoked key cannot validate a token
    f.key_store.revoke(&auth_key.keyid);
    let err = Authorization::bearer(&token)
        .verify(&f.gateway, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Unauthorized { .. }));
}

#[tokio::test]
async fn test_signature_policy_is_immutable() {
    let f = fixture().await;
    let auth_key = registered_account(&f.gateway, "acme").await;
    let who = verified(&f.gateway, "acme", &auth_key).await;

    let signed = SubdomainSpec::new("acme", "sd1", true);
    let config = f
        .gateway
        .ensure_named_subdomain(&signed, &who)
        .await
        .unwrap();
    assert_eq!(config.domain, "sd1.acme.ex.org");
    assert!(!config.genesis);

    // Idempotent re-request succeeds
    f.gateway
        .ensure_named_subdomain(&signed, &who)
        .await
        .unwrap();

    // Changing the policy is a conflict
    let err = f
        .gateway
        .ensure_named_subdomain(&SubdomainSpec::new("acme", "sd1", false), &who)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict { .. }));
}

#[tokio::test]
async fn test_signature_subdomain_holds_verification_keys() {
    let f = fixture().await;
    let auth_key = registered_account(&f.gateway, "acme").await;
    let who = verified(&f.gateway, "acme", &auth_key).await;

    f.gateway
        .ensure_named_subdomain(&SubdomainSpec::new("acme", "sd1", true), &who)
        .await
        .unwrap();

    let id = f.gateway.owned_id("acme", "sd1");
    let sdc = f.gateway.cached_subdomain(&id).await.unwrap();
    // Both the gateway's and the account's principals are present for
    // signature checking, public halves only
    let gw = sdc.get("http://ex.org/").await.unwrap().unwrap();
    let acme = sdc.get("http://ex.org/acme").await.unwrap().unwrap();
    for principal in [gw, acme] {
        let key: Subject =
            serde_json::from_value(principal.first("key").unwrap().clone()).unwrap();
        let user_key = UserKey::from_subject(&key).unwrap();
        assert!(!user_key.has_private());
    }
}

#[tokio::test]
async fn test_removed_name_is_permanently_blocked() {
    let f = fixture().await;
    let auth_key = registered_account(&f.gateway, "acme").await;
    let who = verified(&f.gateway, "acme", &auth_key).await;
    let spec = SubdomainSpec::new("acme", "sd2", false);
    let id = f.gateway.owned_id("acme", "sd2");

    f.gateway.ensure_named_subdomain(&spec, &who).await.unwrap();
    f.gateway.remove_subdomain(&id).await.unwrap();
    settle().await;

    assert!(f.gateway.cached_subdomain(&id).await.is_none());
    let err = f
        .gateway
        .ensure_named_subdomain(&spec, &who)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict { .. }));

    // The tombstone survives a gateway restart
    f.gateway.close().await.unwrap();
    let restarted = Gateway::create(f.config.clone(), f.factory.clone(), f.key_store.clone())
        .await
        .unwrap();
    let auth_key = registered_account(&restarted, "acme2").await;
    let who = verified(&restarted, "acme2", &auth_key).await;
    let err = restarted
        .ensure_named_subdomain(&SubdomainSpec::new("acme", "sd2", false), &who)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict { .. }));
}

#[tokio::test]
async fn test_subdomain_config_resolves_genesis() {
    let f = fixture().await;
    let auth_key = registered_account(&f.gateway, "acme").await;
    let who = verified(&f.gateway, "acme", &auth_key).await;

    f.gateway
        .ensure_named_subdomain(&SubdomainSpec::new("acme", "sd1", false), &who)
        .await
        .unwrap();

    // Registered: definitely not genesis
    let config = f
        .gateway
        .subdomain_config(&f.gateway.owned_id("acme", "sd1"), None)
        .await
        .unwrap();
    assert!(!config.genesis);

    // Unregistered, non-UUID: no automatic creation
    let err = f
        .gateway
        .subdomain_config(&f.gateway.owned_id("acme", "nope"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));

    // Unregistered UUID name requires the account-level allowance
    let uuid_name = "8f7c2e1a-1234-4abc-9def-a1b2c3d4e5f6";
    let err = f
        .gateway
        .subdomain_config(&f.gateway.owned_id("acme", uuid_name), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));

    let account = f.gateway.account("acme", false).await.unwrap().unwrap();
    account
        .update(&AccountUpdate {
            delete: None,
            insert: Some(AccountPatch {
                email: None,
                naming: Some(SubdomainNaming::Uuid),
                remotes_auth: None,
            }),
        })
        .await
        .unwrap();

    let config = f
        .gateway
        .subdomain_config(&f.gateway.owned_id("acme", uuid_name), None)
        .await
        .unwrap();
    assert!(config.genesis);
}

#[tokio::test]
async fn test_activation_round_trip() {
    let f = fixture().await;

    // Unknown account: any email may start an activation
    let activation = f
        .gateway
        .activation("newuser", "n@mail.ex.org")
        .await
        .unwrap();
    let (user, email) = f
        .gateway
        .verify_activation(&activation.code, &activation.jwe)
        .unwrap();
    assert_eq!(user, "newuser");
    assert_eq!(email, "n@mail.ex.org");

    // A wrong code never verifies
    let wrong = if activation.code == "111111" {
        "111112"
    } else {
        "111111"
    };
    assert!(f.gateway.verify_activation(wrong, &activation.jwe).is_err());

    // An existing account only activates registered emails
    registered_account(&f.gateway, "acme").await;
    assert!(f
        .gateway
        .activation("acme", "acme@mail.ex.org")
        .await
        .is_ok());
    let err = f
        .gateway
        .activation("acme", "imposter@mail.ex.org")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Unauthorized { .. }));
}

#[tokio::test]
async fn test_cache_bound_evicts_and_closes() {
    let f = fixture_with_cache_size(1).await;
    let auth_key = registered_account(&f.gateway, "acme").await;
    let who = verified(&f.gateway, "acme", &auth_key).await;

    f.gateway
        .ensure_named_subdomain(&SubdomainSpec::new("acme", "sd1", false), &who)
        .await
        .unwrap();
    let sd1 = f
        .gateway
        .cached_subdomain(&f.gateway.owned_id("acme", "sd1"))
        .await
        .unwrap();

    f.gateway
        .ensure_named_subdomain(&SubdomainSpec::new("acme", "sd2", false), &who)
        .await
        .unwrap();
    settle().await;

    assert!(f
        .gateway
        .cached_subdomain(&f.gateway.owned_id("acme", "sd1"))
        .await
        .is_none());
    // The evicted clone has been shut down, best-effort
    assert!(sd1.replica().online().await.is_err());

    // Re-ensuring re-clones without conflict: the name was not removed
    f.gateway
        .ensure_named_subdomain(&SubdomainSpec::new("acme", "sd1", false), &who)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_account_update_validates() {
    let f = fixture().await;
    registered_account(&f.gateway, "acme").await;
    let account = f.gateway.account("acme", false).await.unwrap().unwrap();

    let err = account.update(&AccountUpdate::default()).await.unwrap_err();
    assert!(matches!(err, Error::BadRequest { .. }));

    let err = account
        .update(&AccountUpdate {
            delete: None,
            insert: Some(AccountPatch {
                email: Some("not-an-email".into()),
                naming: None,
                remotes_auth: None,
            }),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BadRequest { .. }));
}
