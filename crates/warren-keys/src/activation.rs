//! Account activation tokens.
//!
//! Activation is a two-factor indirection: a short-lived signed claim
//! `{sub, email}` is produced under the gateway's own key, then
//! symmetrically encrypted under a random human-presentable numeric
//! code. The out-of-band channel (email) carries only the low-entropy
//! code; the token itself never needs to be memorized or retyped.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hkdf::Hkdf;
use rand::{Rng, RngCore};
use sha2::Sha256;

use warren_core::{Error, Result};

use crate::jwt::{self, Claims};

/// Lifetime of an activation claim.
pub const ACTIVATION_TTL_SECS: u64 = 600;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const CODE_INFO: &[u8] = b"warren.activation.code";

/// An issued activation: the encrypted token and its one-time code.
#[derive(Debug, Clone)]
pub struct Activation {
    /// Six-digit human-presentable code
    pub code: String,
    /// Encrypted claim, `base64(salt ‖ nonce ‖ ciphertext)`
    pub jwe: String,
}

/// Issue an activation for the given user and email, signed under the
/// gateway secret and encrypted under a fresh numeric code.
pub fn issue(secret: &str, kid: &str, user: &str, email: &str) -> Result<Activation> {
    let iat = jwt::now();
    let claims = Claims {
        sub: user.to_string(),
        email: Some(email.to_string()),
        exp: iat + ACTIVATION_TTL_SECS,
        iat,
    };
    let token = jwt::sign_hs256(&claims, secret, kid)?;
    let code = rand::thread_rng().gen_range(111_111..1_000_000).to_string();
    let jwe = encrypt(&code, token.as_bytes())?;
    Ok(Activation { code, jwe })
}

/// Reverse both layers of an activation: decrypt under the presented
/// code, then verify the inner claim under the gateway secret. Expiry is
/// enforced by the claim verification.
pub fn redeem(secret: &str, code: &str, jwe: &str) -> Result<Claims> {
    let token = decrypt(code, jwe)?;
    let token = String::from_utf8(token)
        .map_err(|_| Error::unauthorized("activation token is not valid text"))?;
    jwt::verify_hs256(&token, secret)
}

fn encrypt(code: &str, plaintext: &[u8]) -> Result<String> {
    let mut rng = rand::thread_rng();
    let mut salt = [0u8; SALT_LEN];
    rng.fill_bytes(&mut salt);
    let mut nonce = [0u8; NONCE_LEN];
    rng.fill_bytes(&mut nonce);
    let cipher = Aes256Gcm::new_from_slice(&derive_key(code, &salt))
        .map_err(|e| Error::internal(format!("activation key: {e}")))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| Error::internal(format!("activation encryption: {e}")))?;
    let mut out = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(out))
}

fn decrypt(code: &str, jwe: &str) -> Result<Vec<u8>> {
    let data = BASE64
        .decode(jwe)
        .map_err(|e| Error::unauthorized(format!("undecodable activation: {e}")))?;
    if data.len() <= SALT_LEN + NONCE_LEN {
        return Err(Error::unauthorized("activation token is truncated"));
    }
    let (salt, rest) = data.split_at(SALT_LEN);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(&derive_key(code, salt))
        .map_err(|e| Error::internal(format!("activation key: {e}")))?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::unauthorized("invalid activation code"))
}

fn derive_key(code: &str, salt: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(salt), code.as_bytes());
    let mut okm = [0u8; 32];
    // Expand cannot fail for a 32-byte output
    let _ = hk.expand(CODE_INFO, &mut okm);
    okm
}
