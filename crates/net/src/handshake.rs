//! One-time key exchange run at the start of every connection
//!
//! The accepting side issues a fresh RSA public key (SPKI PEM, unframed, one
//! write); the peer answers with the RSA-encrypted AES session key (unframed,
//! one write of exactly the modulus size). Both writes are matched by exactly
//! one read. All traffic after the exchange is framed and AES-encrypted.

use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::RsaPublicKey;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task;
use tracing::debug;

use crate::crypto::{self, KEY_SIZE};
use crate::error::{Error, Result};

/// Upper bound on the PEM-encoded public key read by the requesting side.
const PUBLIC_KEY_BUFFER_SIZE: usize = 8192;

/// Run the exchange as the key issuer (the accepting side).
///
/// Generates a fresh RSA pair, publishes the public key, and decrypts the
/// session key the peer sends back. The RSA pair is dropped on return.
pub(crate) async fn issue_key<S>(stream: &mut S, key_bits: usize) -> Result<[u8; KEY_SIZE]>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Keygen is CPU-bound; keep it off the runtime threads.
    let (private_key, public_key) = task::spawn_blocking(move || crypto::new_rsa_keys(key_bits))
        .await
        .map_err(|e| Error::Crypto(format!("RSA key generation task failed: {e}")))??;

    let pem = public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| Error::Crypto(format!("public key encoding failed: {e}")))?;
    stream.write_all(pem.as_bytes()).await?;
    stream.flush().await?;

    // The reply is RSA ciphertext, always exactly the modulus size.
    let mut wrapped = vec![0u8; public_key.size()];
    stream.read_exact(&mut wrapped).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::ConnectionClosed
        } else {
            Error::Io(e)
        }
    })?;

    let key = crypto::rsa_decrypt(&private_key, &wrapped)?;
    let key: [u8; KEY_SIZE] = key
        .try_into()
        .map_err(|_| Error::Crypto("unexpected session key length".into()))?;

    debug!("Key exchange complete (issuer)");
    Ok(key)
}

/// Run the exchange as the key requester (the connecting side).
///
/// Reads the issuer's public key, generates a random AES session key, and
/// sends it back RSA-encrypted.
pub(crate) async fn request_key<S>(stream: &mut S) -> Result<[u8; KEY_SIZE]>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; PUBLIC_KEY_BUFFER_SIZE];
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        return Err(Error::ConnectionClosed);
    }

    let pem = std::str::from_utf8(&buf[..n])
        .map_err(|_| Error::Crypto("public key is not valid UTF-8".into()))?;
    let public_key = RsaPublicKey::from_public_key_pem(pem)
        .map_err(|e| Error::Crypto(format!("invalid public key: {e}")))?;

    let key = crypto::new_aes_key();
    let wrapped = crypto::rsa_encrypt(&public_key, &key)?;
    stream.write_all(&wrapped).await?;
    stream.flush().await?;

    debug!("Key exchange complete (requester)");
    Ok(key)
}
