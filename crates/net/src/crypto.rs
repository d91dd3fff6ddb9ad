//! Cryptographic primitives
//!
//! RSA (OAEP, SHA-256) bootstraps the key exchange; AES-256-CBC with PKCS#7
//! padding protects all post-handshake traffic. Every AES encryption uses a
//! fresh random IV, prepended to the ciphertext.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::error::{Error, Result};

/// Size in bytes of AES keys.
pub(crate) const KEY_SIZE: usize = 32;

/// Size in bytes of AES IVs.
pub(crate) const IV_SIZE: usize = 16;

/// Default RSA modulus length in bits.
pub(crate) const DEFAULT_RSA_BITS: usize = 4096;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Generate a fresh RSA key pair.
///
/// Key generation is CPU-bound; async callers should run this on a blocking
/// task.
pub(crate) fn new_rsa_keys(bits: usize) -> Result<(RsaPrivateKey, RsaPublicKey)> {
    let private_key = RsaPrivateKey::new(&mut OsRng, bits)
        .map_err(|e| Error::Crypto(format!("RSA key generation failed: {e}")))?;
    let public_key = RsaPublicKey::from(&private_key);
    Ok((private_key, public_key))
}

/// Encrypt a small payload (a session key, not bulk data) with RSA.
pub(crate) fn rsa_encrypt(public_key: &RsaPublicKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    public_key
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), plaintext)
        .map_err(|e| Error::Crypto(format!("RSA encryption failed: {e}")))
}

/// Decrypt an RSA-encrypted payload. Fails on a wrong key or corrupt input.
pub(crate) fn rsa_decrypt(private_key: &RsaPrivateKey, ciphertext: &[u8]) -> Result<Vec<u8>> {
    private_key
        .decrypt(Oaep::new::<Sha256>(), ciphertext)
        .map_err(|e| Error::Crypto(format!("RSA decryption failed: {e}")))
}

/// Generate a random AES-256 key.
pub(crate) fn new_aes_key() -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    key
}

/// Encrypt with AES-256-CBC, returning `iv ‖ ciphertext`.
pub(crate) fn aes_encrypt(key: &[u8; KEY_SIZE], plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut iv = [0u8; IV_SIZE];
    OsRng.fill_bytes(&mut iv);

    let cipher = Aes256CbcEnc::new_from_slices(key, &iv)
        .map_err(|_| Error::Crypto("invalid AES key or IV length".into()))?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut sealed = Vec::with_capacity(IV_SIZE + ciphertext.len());
    sealed.extend_from_slice(&iv);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Decrypt an `iv ‖ ciphertext` blob produced by [`aes_encrypt`].
///
/// A wrong key surfaces as a padding error rather than silently returning
/// garbage.
pub(crate) fn aes_decrypt(key: &[u8; KEY_SIZE], sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < IV_SIZE {
        return Err(Error::Crypto(format!(
            "ciphertext too short: {} bytes",
            sealed.len()
        )));
    }

    let (iv, ciphertext) = sealed.split_at(IV_SIZE);
    let cipher = Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|_| Error::Crypto("invalid AES key or IV length".into()))?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| Error::Crypto("AES decryption failed".into()))
}
