//! Per-connection session state
//!
//! A session owns the write half of one socket, the AES session key, and the
//! connection's activity flag. It exists only once the handshake has
//! completed; a failed handshake yields an error, never a session. The owner
//! (client handle or server registry entry) keeps the read half and drives a
//! `MessageStream` with the chunks it reads.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use zeroize::Zeroizing;

use crate::crypto::{self, KEY_SIZE};
use crate::error::{Error, Result};
use crate::frame::{encode_message_size, LEN_SIZE};

/// Size of the buffer used by read loops feeding a `MessageStream`.
pub(crate) const READ_BUFFER_SIZE: usize = 4096;

pub(crate) struct Session {
    /// Writer is held behind a mutex so concurrent sends on one session
    /// never interleave frame bytes on the wire.
    writer: Mutex<WriteHalf<TcpStream>>,
    /// Session key, wiped when the session is dropped.
    key: Zeroizing<[u8; KEY_SIZE]>,
    active: AtomicBool,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

impl Session {
    pub(crate) fn new(
        writer: WriteHalf<TcpStream>,
        key: [u8; KEY_SIZE],
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Self {
        Self {
            writer: Mutex::new(writer),
            key: Zeroizing::new(key),
            active: AtomicBool::new(true),
            local_addr,
            peer_addr,
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Encrypt a payload and write it as one length-prefixed frame.
    ///
    /// Completes only when the write has been handed to the OS; fails with
    /// `NotConnected` once the session has closed.
    pub(crate) async fn send(&self, plaintext: &[u8]) -> Result<()> {
        if !self.is_active() {
            return Err(Error::NotConnected);
        }

        let sealed = crypto::aes_encrypt(&self.key, plaintext)?;
        let mut frame = Vec::with_capacity(LEN_SIZE + sealed.len());
        frame.extend_from_slice(&encode_message_size(sealed.len() as u64));
        frame.extend_from_slice(&sealed);

        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Decrypt one complete framed message body.
    pub(crate) fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        crypto::aes_decrypt(&self.key, sealed)
    }

    /// Deactivate the session and half-close the socket. Idempotent.
    pub(crate) async fn close(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            let _ = self.writer.lock().await.shutdown().await;
        }
    }
}
