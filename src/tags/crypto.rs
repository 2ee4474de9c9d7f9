//! Symmetric sealing for tag blocks
//!
//! ChaCha20-Poly1305 AEAD with a PBKDF2-HMAC-SHA256 derived key. The
//! sealed layout is `salt(16) || rounds(u32 BE) || nonce(12) || ciphertext`
//! where the ciphertext carries the 16-byte Poly1305 tag. A failed tag
//! check is reported as an authentication error, never as garbage output.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hmac::Hmac;
use rand::RngCore;
use sha2::Sha256;

use crate::error::{EngineError, EngineResult};

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const DEFAULT_ROUNDS: u32 = 60_000;
const HEADER_LEN: usize = SALT_LEN + 4 + NONCE_LEN;

fn derive_key(password: &str, salt: &[u8], rounds: u32) -> EngineResult<[u8; KEY_LEN]> {
    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2::<Hmac<Sha256>>(password.as_bytes(), salt, rounds, &mut key)
        .map_err(|e| EngineError::auth(format!("key derivation failed: {e}")))?;
    Ok(key)
}

/// Seals `plaintext` under `password` with a fresh salt and nonce.
pub fn seal(plaintext: &[u8], password: &str) -> EngineResult<Vec<u8>> {
    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let key = derive_key(password, &salt, DEFAULT_ROUNDS)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| EngineError::format("encryption failed"))?;

    let mut out = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&DEFAULT_ROUNDS.to_be_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Opens a sealed blob. Wrong password (or tampered data) is `AuthError`;
/// a blob too short to carry the header is `FormatError`.
pub fn open(sealed: &[u8], password: &str) -> EngineResult<Vec<u8>> {
    if sealed.len() < HEADER_LEN {
        return Err(EngineError::format("encrypted tag block truncated"));
    }
    let salt = &sealed[..SALT_LEN];
    let rounds = u32::from_be_bytes(
        sealed[SALT_LEN..SALT_LEN + 4]
            .try_into()
            .expect("slice length checked"),
    );
    if rounds == 0 || rounds > 10_000_000 {
        return Err(EngineError::format(format!(
            "implausible key derivation round count {rounds}"
        )));
    }
    let nonce = &sealed[SALT_LEN + 4..HEADER_LEN];
    let ciphertext = &sealed[HEADER_LEN..];

    let key = derive_key(password, salt, rounds)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| EngineError::auth("wrong password or corrupted tag block"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let sealed = seal(b"hello", "pw").unwrap();
        assert_eq!(open(&sealed, "pw").unwrap(), b"hello");
    }

    #[test]
    fn wrong_password_fails_auth() {
        let sealed = seal(b"hello", "pw").unwrap();
        assert!(matches!(
            open(&sealed, "other"),
            Err(EngineError::Auth(_))
        ));
    }

    #[test]
    fn tampering_fails_auth() {
        let mut sealed = seal(b"hello", "pw").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(open(&sealed, "pw"), Err(EngineError::Auth(_))));
    }

    #[test]
    fn truncated_blob_is_format_error() {
        assert!(matches!(
            open(&[0u8; 8], "pw"),
            Err(EngineError::Format(_))
        ));
    }
}
