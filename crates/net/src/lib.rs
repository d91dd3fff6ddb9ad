//! Cloak Network Library
//!
//! Encrypted, message-oriented transport over TCP. A [`Server`] accepts many
//! concurrent clients; a [`Client`] connects to one server; either side
//! exchanges discrete, arbitrarily-sized messages without reasoning about
//! TCP's lack of message boundaries.
//!
//! # Architecture
//!
//! - **Handshake**: each connection starts with a one-shot RSA exchange that
//!   establishes a per-connection AES-256 session key
//! - **Framing**: every message is a 5-byte big-endian length prefix followed
//!   by the AES-CBC ciphertext (fresh IV per message, prepended)
//! - **Events**: received messages, connects, and disconnects surface through
//!   `next_event()` streams per role
//!
//! # Usage
//!
//! ```ignore
//! // Host starts a server
//! let mut server: Server<String, String> = Server::new();
//! server.start(Endpoint::default()).await?;
//!
//! // Client connects
//! let mut client: Client<String, String> = Client::new();
//! client.connect(Endpoint::default()).await?;
//! client.send(&"hello".to_string()).await?;
//!
//! // Process events
//! while let Some(event) = server.next_event().await {
//!     match event {
//!         ServerEvent::Receive { client_id, data } => { /* handle */ }
//!         _ => {}
//!     }
//! }
//! ```

pub mod client;
mod crypto;
pub mod error;
mod frame;
mod handshake;
pub mod server;
mod session;
pub mod wait;

pub use client::{Client, ClientEvent};
pub use error::{Error, Result};
pub use server::{Server, ServerEvent};
pub use wait::WaitGroup;

/// Default bind host for servers.
pub const DEFAULT_SERVER_HOST: &str = "0.0.0.0";

/// Default target host for clients.
pub const DEFAULT_CLIENT_HOST: &str = "127.0.0.1";

/// Default port for cloak servers and clients.
pub const DEFAULT_PORT: u16 = 29275;

/// Listen backlog for servers.
pub const BACKLOG: u32 = 16;

/// Optional address for `connect` and `start`.
///
/// Unset fields fall back to the role's defaults: servers bind
/// [`DEFAULT_SERVER_HOST`], clients target [`DEFAULT_CLIENT_HOST`], and both
/// use [`DEFAULT_PORT`].
#[derive(Debug, Clone, Default)]
pub struct Endpoint {
    pub host: Option<String>,
    pub port: Option<u16>,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: Some(host.into()),
            port: Some(port),
        }
    }

    pub fn with_host(host: impl Into<String>) -> Self {
        Self {
            host: Some(host.into()),
            port: None,
        }
    }

    pub fn with_port(port: u16) -> Self {
        Self {
            host: None,
            port: Some(port),
        }
    }

    /// Fill unset fields with the caller's defaults.
    pub(crate) fn resolve(&self, default_host: &str, default_port: u16) -> (String, u16) {
        (
            self.host.clone().unwrap_or_else(|| default_host.to_string()),
            self.port.unwrap_or(default_port),
        )
    }
}
