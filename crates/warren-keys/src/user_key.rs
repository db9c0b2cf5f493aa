//! Per-user asymmetric signing keys.
//!
//! A [`UserKey`] is an Ed25519 key pair bound to an authorization keyid.
//! It appears in three places with three shapes:
//!
//! 1. The gateway registry, with all details including the sealed private
//!    half;
//! 2. Sub-domain replicas, public half only, for signature verification;
//! 3. Client credential configuration, without revocation status (a
//!    distributed key is assumed valid until the key store says
//!    otherwise).
//!
//! The private half at rest is always sealed with ChaCha20-Poly1305 under
//! a key derived from the owning [`AuthKey`] secret, so possession of the
//! registry record alone is not possession of the signing capability.

use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, KeyInit, Nonce};
use ed25519_dalek::pkcs8::EncodePrivateKey;
use ed25519_dalek::{
    Signature, Signer, SigningKey as Ed25519SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH,
};
use hkdf::Hkdf;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

use warren_core::{reference, Error, Result, Subject};

use crate::auth_key::AuthKey;

/// Registry subject type for user keys.
pub const USER_KEY_TYPE: &str = "UserKey";

const SEAL_SALT_LEN: usize = 16;
const SEAL_NONCE_LEN: usize = 12;
const SEAL_INFO: &[u8] = b"warren.user-key.seal";

/// A user signing key: Ed25519 pair bound to an authorization keyid.
/// The private half may be absent (verification-only copies).
#[derive(Debug, Clone)]
pub struct UserKey {
    /// The bound authorization keyid
    pub keyid: String,
    /// Friendly name, if recorded
    pub name: Option<String>,
    /// Revocation status; `false` in client and sub-domain copies
    pub revoked: bool,
    public: VerifyingKey,
    sealed_private: Option<Vec<u8>>,
}

/// Client credential configuration for a user key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserKeyConfig {
    /// The full authorization key string
    pub auth: AuthKeyConfig,
    /// The signing pair, when per-user signing is in use
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<KeyPairConfig>,
}

/// The authorization part of client credential configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthKeyConfig {
    /// Canonical `app.keyid:secret` form
    pub key: String,
}

/// Base64 form of a signing pair for configuration transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyPairConfig {
    /// Raw Ed25519 public key, standard base64
    pub public: String,
    /// Sealed private half, standard base64; absent for verify-only copies
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private: Option<String>,
}

impl UserKey {
    /// Generate a fresh pair under the given authorization key, sealing
    /// the private half immediately.
    pub fn generate(auth_key: &AuthKey) -> Result<Self> {
        let signing = Ed25519SigningKey::generate(&mut rand::rngs::OsRng);
        let sealed = seal(&signing.to_bytes(), auth_key)?;
        Ok(Self {
            keyid: auth_key.keyid.clone(),
            name: None,
            revoked: false,
            public: signing.verifying_key(),
            sealed_private: Some(sealed),
        })
    }

    /// Raw public key bytes.
    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Whether this key has a private half.
    pub fn has_private(&self) -> bool {
        self.sealed_private.is_some()
    }

    /// `false` if the auth key does not correspond to this user key.
    /// Proves possession of the auth key secret by unsealing the private
    /// half with it.
    pub fn matches(&self, auth_key: &AuthKey) -> bool {
        auth_key.keyid == self.keyid && self.unseal(auth_key).is_ok()
    }

    /// Produce a detached signature `<keyid>:<signature-bytes>`.
    pub fn sign(&self, data: &[u8], auth_key: &AuthKey) -> Result<Vec<u8>> {
        let signing = self.signing_key(auth_key)?;
        let sig: Signature = signing.sign(data);
        let mut out = Vec::with_capacity(self.keyid.len() + 1 + Signature::BYTE_SIZE);
        out.extend_from_slice(self.keyid.as_bytes());
        out.push(b':');
        out.extend_from_slice(&sig.to_bytes());
        Ok(out)
    }

    /// Split a detached signature into its keyid and raw signature parts.
    /// Returns `None` when no plausible keyid prefix is present.
    pub fn split_signature(data: &[u8]) -> Option<(&str, &[u8])> {
        let delim = data.iter().position(|&b| b == b':')?;
        if delim < 5 {
            return None;
        }
        let keyid = std::str::from_utf8(&data[..delim]).ok()?;
        Some((keyid, &data[delim + 1..]))
    }

    /// Verify a detached signature against this key.
    pub fn verify(&self, sig: &[u8], data: &[u8]) -> bool {
        let Some((keyid, raw)) = Self::split_signature(sig) else {
            return false;
        };
        if keyid != self.keyid {
            return false;
        }
        let Ok(signature) = Signature::from_slice(raw) else {
            return false;
        };
        self.public.verify(data, &signature).is_ok()
    }

    /// Sign a JWT with this key (EdDSA, `kid` header set to the keyid).
    pub fn sign_jwt<C: Serialize>(&self, claims: &C, auth_key: &AuthKey) -> Result<String> {
        let signing = self.signing_key(auth_key)?;
        let der = signing
            .to_pkcs8_der()
            .map_err(|e| Error::internal(format!("signing key encoding: {e}")))?;
        let mut header = Header::new(Algorithm::EdDSA);
        header.kid = Some(self.keyid.clone());
        jsonwebtoken::encode(&header, claims, &EncodingKey::from_ed_der(der.as_bytes()))
            .map_err(|e| Error::internal(format!("token signing: {e}")))
    }

    /// The verification key in `jsonwebtoken` form.
    pub fn decoding_key(&self) -> Result<DecodingKey> {
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;
        use base64::Engine;
        DecodingKey::from_ed_components(&URL_SAFE_NO_PAD.encode(self.public.to_bytes()))
            .map_err(|e| Error::internal(format!("verification key: {e}")))
    }

    /// Registry reference `.{keyid}` for this key.
    pub fn to_ref(&self) -> serde_json::Value {
        Self::ref_from_keyid(&self.keyid, None)
    }

    /// Reference for a keyid, absolute when a domain is given.
    pub fn ref_from_keyid(keyid: &str, domain: Option<&str>) -> serde_json::Value {
        match domain {
            Some(domain) => reference(format!("http://{domain}/.{keyid}")),
            None => reference(format!(".{keyid}")),
        }
    }

    /// Extract the keyid from a key reference IRI.
    pub fn keyid_from_ref(iri: &str) -> Result<String> {
        let id = match iri.find("//") {
            // Absolute: take the path part after the authority
            Some(at) => iri[at + 2..]
                .split_once('/')
                .map(|(_, path)| path)
                .unwrap_or_default(),
            None => iri,
        };
        let keyid = id.strip_prefix('.').unwrap_or_default();
        if keyid.len() >= 5
            && keyid
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            Ok(keyid.to_string())
        } else {
            Err(Error::bad_request(format!(
                "unexpected user key identity format {id:?}"
            )))
        }
    }

    /// Render as a registry subject. With `exclude_private`, the sealed
    /// private half is omitted (the form replicated into sub-domains).
    pub fn to_subject(&self, exclude_private: bool) -> Subject {
        let mut subject = Subject::new(format!(".{}", self.keyid))
            .with_type(USER_KEY_TYPE)
            .with("public", Subject::bytes_value(&self.public.to_bytes()))
            .with("revoked", self.revoked.into());
        if let Some(name) = &self.name {
            subject = subject.with("name", name.clone().into());
        }
        if !exclude_private {
            if let Some(sealed) = &self.sealed_private {
                subject = subject.with("private", Subject::bytes_value(sealed));
            }
        }
        subject
    }

    /// Reconstruct from a registry subject.
    pub fn from_subject(subject: &Subject) -> Result<Self> {
        let keyid = Self::keyid_from_ref(&subject.id)?;
        let public_bytes = subject
            .bytes("public")
            .ok_or_else(|| Error::internal(format!("user key {keyid} has no public half")))?;
        let public = VerifyingKey::try_from(public_bytes.as_slice())
            .map_err(|e| Error::internal(format!("user key {keyid}: {e}")))?;
        Ok(Self {
            keyid,
            name: subject.string("name"),
            revoked: subject.boolean("revoked").unwrap_or(false),
            public,
            sealed_private: subject.bytes("private"),
        })
    }

    /// Client configuration for this key. Revocation status is never
    /// included by convention.
    pub fn to_config(&self, auth_key: &AuthKey) -> UserKeyConfig {
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine;
        UserKeyConfig {
            auth: AuthKeyConfig {
                key: auth_key.to_string(),
            },
            key: Some(KeyPairConfig {
                public: BASE64.encode(self.public.to_bytes()),
                private: self.sealed_private.as_ref().map(|s| BASE64.encode(s)),
            }),
        }
    }

    /// Reconstruct from client configuration.
    pub fn from_config(config: &UserKeyConfig) -> Result<Self> {
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine;
        let auth_key: AuthKey = config.auth.key.parse()?;
        let pair = config
            .key
            .as_ref()
            .ok_or_else(|| Error::bad_request("configuration carries no signing pair"))?;
        let public_bytes = BASE64
            .decode(&pair.public)
            .map_err(|e| Error::bad_request(format!("public key encoding: {e}")))?;
        let public = VerifyingKey::try_from(public_bytes.as_slice())
            .map_err(|e| Error::bad_request(format!("public key: {e}")))?;
        let sealed_private = pair
            .private
            .as_ref()
            .map(|p| BASE64.decode(p))
            .transpose()
            .map_err(|e| Error::bad_request(format!("private key encoding: {e}")))?;
        Ok(Self {
            keyid: auth_key.keyid,
            name: None,
            revoked: false,
            public,
            sealed_private,
        })
    }

    fn signing_key(&self, auth_key: &AuthKey) -> Result<Ed25519SigningKey> {
        let secret = self.unseal(auth_key)?;
        if secret.len() != SECRET_KEY_LENGTH {
            return Err(Error::internal("sealed private key has the wrong length"));
        }
        let mut bytes = [0u8; SECRET_KEY_LENGTH];
        bytes.copy_from_slice(&secret);
        Ok(Ed25519SigningKey::from_bytes(&bytes))
    }

    fn unseal(&self, auth_key: &AuthKey) -> Result<Zeroizing<Vec<u8>>> {
        let sealed = self
            .sealed_private
            .as_ref()
            .ok_or_else(|| Error::internal(format!("user key {} has no private half", self.keyid)))?;
        if sealed.len() <= SEAL_SALT_LEN + SEAL_NONCE_LEN {
            return Err(Error::internal("sealed private key is truncated"));
        }
        let (salt, rest) = sealed.split_at(SEAL_SALT_LEN);
        let (nonce, ciphertext) = rest.split_at(SEAL_NONCE_LEN);
        let cipher = ChaCha20Poly1305::new_from_slice(&derive_seal_key(salt, auth_key))
            .map_err(|e| Error::internal(format!("seal key: {e}")))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::unauthorized("auth key does not match signing key"))?;
        Ok(Zeroizing::new(plaintext))
    }
}

fn seal(secret: &[u8; SECRET_KEY_LENGTH], auth_key: &AuthKey) -> Result<Vec<u8>> {
    let mut rng = rand::thread_rng();
    let mut salt = [0u8; SEAL_SALT_LEN];
    rng.fill_bytes(&mut salt);
    let mut nonce = [0u8; SEAL_NONCE_LEN];
    rng.fill_bytes(&mut nonce);
    let cipher = ChaCha20Poly1305::new_from_slice(&derive_seal_key(&salt, auth_key))
        .map_err(|e| Error::internal(format!("seal key: {e}")))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), secret.as_slice())
        .map_err(|e| Error::internal(format!("sealing: {e}")))?;
    let mut out = Vec::with_capacity(SEAL_SALT_LEN + SEAL_NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn derive_seal_key(salt: &[u8], auth_key: &AuthKey) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(salt), auth_key.secret.as_bytes());
    let mut okm = [0u8; 32];
    // Expand cannot fail for a 32-byte output
    let _ = hk.expand(SEAL_INFO, &mut okm);
    okm
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth_key() -> AuthKey {
        "app.keyid1:topsecret".parse().unwrap()
    }

    #[test]
    fn test_generate_and_match() {
        let ak = auth_key();
        let key = UserKey::generate(&ak).unwrap();
        assert_eq!(key.keyid, "keyid1");
        assert!(key.matches(&ak));
    }

    #[test]
    fn test_wrong_secret_does_not_match() {
        let key = UserKey::generate(&auth_key()).unwrap();
        let wrong: AuthKey = "app.keyid1:othersecret".parse().unwrap();
        assert!(!key.matches(&wrong));
        let foreign: AuthKey = "app.keyid2:topsecret".parse().unwrap();
        assert!(!key.matches(&foreign));
    }

    #[test]
    fn test_sign_and_verify_detached() {
        let ak = auth_key();
        let key = UserKey::generate(&ak).unwrap();
        let sig = key.sign(b"attributed data", &ak).unwrap();
        let (keyid, _) = UserKey::split_signature(&sig).unwrap();
        assert_eq!(keyid, "keyid1");
        assert!(key.verify(&sig, b"attributed data"));
        assert!(!key.verify(&sig, b"tampered data"));
    }

    #[test]
    fn test_verify_rejects_foreign_keyid() {
        let ak = auth_key();
        let key = UserKey::generate(&ak).unwrap();
        let other_ak: AuthKey = "app.keyid2:topsecret".parse().unwrap();
        let other = UserKey::generate(&other_ak).unwrap();
        let sig = other.sign(b"data", &other_ak).unwrap();
        assert!(!key.verify(&sig, b"data"));
    }

    #[test]
    fn test_subject_round_trip() {
        let ak = auth_key();
        let key = UserKey::generate(&ak).unwrap();
        let restored = UserKey::from_subject(&key.to_subject(false)).unwrap();
        assert_eq!(restored.keyid, key.keyid);
        assert!(restored.matches(&ak));

        // Public-only copy verifies but cannot sign
        let public_only = UserKey::from_subject(&key.to_subject(true)).unwrap();
        assert!(!public_only.has_private());
        let sig = key.sign(b"data", &ak).unwrap();
        assert!(public_only.verify(&sig, b"data"));
        assert!(public_only.sign(b"data", &ak).is_err());
    }

    #[test]
    fn test_keyid_from_ref() {
        assert_eq!(UserKey::keyid_from_ref(".abcde1").unwrap(), "abcde1");
        assert_eq!(
            UserKey::keyid_from_ref("http://gw.net/.abcde1").unwrap(),
            "abcde1"
        );
        assert!(UserKey::keyid_from_ref("abcde1").is_err());
        assert!(UserKey::keyid_from_ref(".ab").is_err());
        assert!(UserKey::keyid_from_ref(".bad key").is_err());
    }

    #[test]
    fn test_config_round_trip() {
        let ak = auth_key();
        let key = UserKey::generate(&ak).unwrap();
        let config = key.to_config(&ak);
        let restored = UserKey::from_config(&config).unwrap();
        assert_eq!(restored.keyid, key.keyid);
        assert!(restored.matches(&ak));
    }

    #[test]
    fn test_jwt_round_trip() {
        #[derive(serde::Serialize, serde::Deserialize)]
        struct Claims {
            sub: String,
            exp: u64,
        }
        let ak = auth_key();
        let key = UserKey::generate(&ak).unwrap();
        let claims = Claims {
            sub: "acme".into(),
            exp: now_plus(600),
        };
        let token = key.sign_jwt(&claims, &ak).unwrap();

        let header = jsonwebtoken::decode_header(&token).unwrap();
        assert_eq!(header.kid.as_deref(), Some("keyid1"));

        let decoded = jsonwebtoken::decode::<Claims>(
            &token,
            &key.decoding_key().unwrap(),
            &jsonwebtoken::Validation::new(Algorithm::EdDSA),
        )
        .unwrap();
        assert_eq!(decoded.claims.sub, "acme");
    }

    fn now_plus(secs: u64) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs()
            + secs
    }
}
