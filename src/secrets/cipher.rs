//! AES-256-GCM sealing with an Argon2id password-derived key.
//!
//! Sealed payload layout: `salt(16) || nonce(12) || ciphertext`, base64
//! encoded and wrapped at 76 columns.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use argon2::Argon2;
use base64::{engine::general_purpose, Engine as _};
use rand::{thread_rng, Rng};
use zeroize::Zeroizing;

use super::SecretsError;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const LINE_WIDTH: usize = 76;

fn derive_key(password: &str, salt: &[u8]) -> Result<Zeroizing<[u8; KEY_LEN]>, SecretsError> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    Argon2::default()
        .hash_password_into(password.as_bytes(), salt, key.as_mut_slice())
        .map_err(|e| SecretsError::KeyDerivation(e.to_string()))?;
    Ok(key)
}

/// Encrypt `plaintext` and return the wrapped base64 text.
pub fn seal(password: &str, plaintext: &[u8]) -> Result<String, SecretsError> {
    let mut salt = [0u8; SALT_LEN];
    let mut nonce_bytes = [0u8; NONCE_LEN];
    thread_rng().fill(&mut salt);
    thread_rng().fill(&mut nonce_bytes);

    let key = derive_key(password, &salt)?;
    let cipher = Aes256Gcm::new_from_slice(key.as_slice()).map_err(|_| SecretsError::Encrypt)?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| SecretsError::Encrypt)?;

    let mut payload = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
    payload.extend_from_slice(&salt);
    payload.extend_from_slice(&nonce_bytes);
    payload.extend_from_slice(&ciphertext);

    Ok(wrap(&general_purpose::STANDARD.encode(payload)))
}

/// Decrypt text produced by [`seal`]. Line breaks are ignored.
pub fn open(password: &str, sealed: &str) -> Result<Zeroizing<Vec<u8>>, SecretsError> {
    let joined: String = sealed.split_whitespace().collect();
    let payload = general_purpose::STANDARD
        .decode(joined)
        .map_err(|e| SecretsError::Payload(e.to_string()))?;
    if payload.len() < SALT_LEN + NONCE_LEN {
        return Err(SecretsError::Payload("payload too short".to_string()));
    }

    let (salt, rest) = payload.split_at(SALT_LEN);
    let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);
    let key = derive_key(password, salt)?;
    let cipher = Aes256Gcm::new_from_slice(key.as_slice()).map_err(|_| SecretsError::Decrypt)?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| SecretsError::Decrypt)?;
    Ok(Zeroizing::new(plaintext))
}

fn wrap(encoded: &str) -> String {
    let mut out = String::with_capacity(encoded.len() + encoded.len() / LINE_WIDTH + 1);
    for chunk in encoded.as_bytes().chunks(LINE_WIDTH) {
        // base64 output is ASCII
        out.push_str(&String::from_utf8_lossy(chunk));
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_then_open() {
        let sealed = seal("pw", b"servers = []\n").unwrap();
        assert!(sealed.lines().all(|l| l.len() <= LINE_WIDTH));

        let opened = open("pw", &sealed).unwrap();
        assert_eq!(opened.as_slice(), b"servers = []\n");
    }

    #[test]
    fn test_wrong_password_fails() {
        let sealed = seal("right", b"secret").unwrap();
        assert!(matches!(open("wrong", &sealed), Err(SecretsError::Decrypt)));
    }

    #[test]
    fn test_salt_makes_output_unique() {
        let a = seal("pw", b"same").unwrap();
        let b = seal("pw", b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_garbage_payload_rejected() {
        assert!(matches!(open("pw", "!!!"), Err(SecretsError::Payload(_))));
        assert!(matches!(open("pw", "AAAA"), Err(SecretsError::Payload(_))));
    }
}
