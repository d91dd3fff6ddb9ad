//! TCP client for connecting to a cloak server

use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, ReadHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::frame::MessageStream;
use crate::handshake;
use crate::session::{Session, READ_BUFFER_SIZE};
use crate::{Endpoint, DEFAULT_CLIENT_HOST, DEFAULT_PORT};

/// Event surfaced by the client.
#[derive(Debug)]
pub enum ClientEvent<R> {
    /// A message arrived from the server.
    Receive { data: R },
    /// The server closed the connection (or it failed fatally). Emitted
    /// exactly once per connection, and never for a local `disconnect`.
    Disconnected,
}

/// A socket client. `S` is the type of data sent, `R` the type received.
///
/// Holds at most one connection at a time.
pub struct Client<S, R> {
    session: Option<Arc<Session>>,
    reader: Option<JoinHandle<()>>,
    event_rx: Option<mpsc::Receiver<ClientEvent<R>>>,
    _marker: PhantomData<fn(S)>,
}

impl<S, R> Client<S, R>
where
    S: Serialize,
    R: DeserializeOwned + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            session: None,
            reader: None,
            event_rx: None,
            _marker: PhantomData,
        }
    }

    /// Connect to a server and run the key exchange.
    ///
    /// Unset endpoint fields default to `127.0.0.1` and port 29275. Fails if
    /// a connection is already live.
    pub async fn connect(&mut self, endpoint: Endpoint) -> Result<()> {
        if self.is_connected() {
            return Err(Error::AlreadyConnected);
        }

        let (host, port) = endpoint.resolve(DEFAULT_CLIENT_HOST, DEFAULT_PORT);
        info!(host = %host, port = port, "Connecting to server");

        let mut stream = TcpStream::connect((host.as_str(), port)).await?;
        let key = handshake::request_key(&mut stream).await?;

        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        let (reader, writer) = tokio::io::split(stream);
        let session = Arc::new(Session::new(writer, key, local_addr, peer_addr));

        let (event_tx, event_rx) = mpsc::channel(64);
        let reader_task = tokio::spawn(read_loop(reader, session.clone(), event_tx));

        self.session = Some(session);
        self.reader = Some(reader_task);
        self.event_rx = Some(event_rx);

        info!(addr = %peer_addr, "Connected");
        Ok(())
    }

    /// Disconnect from the server. Fails if not connected.
    pub async fn disconnect(&mut self) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }

        // Abort the read loop before closing so a local disconnect never
        // surfaces a Disconnected event.
        if let Some(task) = self.reader.take() {
            task.abort();
        }
        if let Some(session) = self.session.take() {
            session.close().await;
        }
        self.event_rx = None;

        info!("Disconnected");
        Ok(())
    }

    /// Send a message to the server.
    pub async fn send(&self, data: &S) -> Result<()> {
        let session = match &self.session {
            Some(session) if session.is_active() => session,
            _ => return Err(Error::NotConnected),
        };

        let payload = serde_json::to_vec(data)
            .map_err(|e| Error::Protocol(format!("serialization failed: {e}")))?;
        session.send(&payload).await
    }

    pub fn is_connected(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.is_active())
    }

    /// The local address of the live connection.
    ///
    /// Fails with `NotConnected` when never connected, and with
    /// `ConnectionClosed` when the connection existed but has since closed.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        match &self.session {
            Some(session) if session.is_active() => Ok(session.local_addr()),
            Some(_) => Err(Error::ConnectionClosed),
            None => Err(Error::NotConnected),
        }
    }

    /// The server's address, with the same failure modes as [`local_addr`].
    ///
    /// [`local_addr`]: Client::local_addr
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        match &self.session {
            Some(session) if session.is_active() => Ok(session.peer_addr()),
            Some(_) => Err(Error::ConnectionClosed),
            None => Err(Error::NotConnected),
        }
    }

    /// The next event from the connection, or `None` once the event stream
    /// has ended.
    pub async fn next_event(&mut self) -> Option<ClientEvent<R>> {
        match self.event_rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }
}

impl<S, R> Default for Client<S, R>
where
    S: Serialize,
    R: DeserializeOwned + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<S, R> Drop for Client<S, R> {
    fn drop(&mut self) {
        if let Some(task) = self.reader.take() {
            task.abort();
        }
    }
}

/// Read loop: reassemble frames, decrypt, decode, surface events.
async fn read_loop<R>(
    mut reader: ReadHalf<TcpStream>,
    session: Arc<Session>,
    event_tx: mpsc::Sender<ClientEvent<R>>,
) where
    R: DeserializeOwned + Send + 'static,
{
    let mut stream = MessageStream::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    'conn: loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("Server closed connection");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Read error");
                break;
            }
        };

        for sealed in stream.received(&buf[..n]) {
            let opened = session.open(&sealed).and_then(|plain| {
                serde_json::from_slice::<R>(&plain)
                    .map_err(|e| Error::Protocol(format!("invalid payload: {e}")))
            });
            match opened {
                Ok(data) => {
                    if event_tx.send(ClientEvent::Receive { data }).await.is_err() {
                        break 'conn;
                    }
                }
                Err(e) => {
                    // Protocol errors are fatal to the connection.
                    warn!(error = %e, "Failed to open message");
                    break 'conn;
                }
            }
        }
    }

    session.close().await;
    let _ = event_tx.send(ClientEvent::Disconnected).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{Server, ServerEvent};
    use std::time::Duration;
    use tokio::time::timeout;

    // Small RSA keys keep per-connection keygen fast in debug builds.
    const TEST_KEY_BITS: usize = 1024;

    async fn started_server() -> Server<String, String> {
        let mut server = Server::with_key_size(TEST_KEY_BITS);
        server
            .start(Endpoint::new("127.0.0.1", 0))
            .await
            .unwrap();
        server
    }

    async fn client_event(client: &mut Client<String, String>) -> ClientEvent<String> {
        timeout(Duration::from_secs(10), client.next_event())
            .await
            .unwrap()
            .unwrap()
    }

    async fn server_event(server: &mut Server<String, String>) -> ServerEvent<String> {
        timeout(Duration::from_secs(10), server.next_event())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let mut server = started_server().await;
        let port = server.addr().unwrap().port();

        let mut client: Client<String, String> = Client::new();
        assert!(!client.is_connected());
        client.connect(Endpoint::new("127.0.0.1", port)).await.unwrap();
        assert!(client.is_connected());

        match server_event(&mut server).await {
            ServerEvent::Connect { client_id } => assert_eq!(client_id, 0),
            other => panic!("expected connect event, got {other:?}"),
        }

        client.send(&"Hello, server!".to_string()).await.unwrap();
        match server_event(&mut server).await {
            ServerEvent::Receive { client_id, data } => {
                assert_eq!(client_id, 0);
                assert_eq!(data, "Hello, server!");
            }
            other => panic!("expected receive event, got {other:?}"),
        }

        server.send(&"Hello, client!".to_string(), &[]).await.unwrap();
        match client_event(&mut client).await {
            ClientEvent::Receive { data } => assert_eq!(data, "Hello, client!"),
            other => panic!("expected receive event, got {other:?}"),
        }

        client.disconnect().await.unwrap();
        assert!(!client.is_connected());
        match server_event(&mut server).await {
            ServerEvent::Disconnect { client_id } => assert_eq!(client_id, 0),
            other => panic!("expected disconnect event, got {other:?}"),
        }

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_state_errors() {
        let mut client: Client<String, String> = Client::new();

        assert!(matches!(
            client.send(&"nope".to_string()).await,
            Err(Error::NotConnected)
        ));
        assert!(matches!(client.disconnect().await, Err(Error::NotConnected)));
        assert!(matches!(client.local_addr(), Err(Error::NotConnected)));
        assert!(matches!(client.peer_addr(), Err(Error::NotConnected)));

        let mut server = started_server().await;
        let port = server.addr().unwrap().port();
        client.connect(Endpoint::new("127.0.0.1", port)).await.unwrap();

        assert!(matches!(
            client.connect(Endpoint::new("127.0.0.1", port)).await,
            Err(Error::AlreadyConnected)
        ));

        client.disconnect().await.unwrap();
        assert!(matches!(client.disconnect().await, Err(Error::NotConnected)));
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_addresses() {
        let mut server = started_server().await;
        let server_addr = server.addr().unwrap();

        let mut client: Client<String, String> = Client::new();
        client
            .connect(Endpoint::new("127.0.0.1", server_addr.port()))
            .await
            .unwrap();

        assert_eq!(client.peer_addr().unwrap().port(), server_addr.port());
        let local = client.local_addr().unwrap();
        assert!(local.port() > 0);

        match server_event(&mut server).await {
            ServerEvent::Connect { client_id } => {
                let seen = server.client_addr(client_id).await.unwrap();
                assert_eq!(seen, local);
            }
            other => panic!("expected connect event, got {other:?}"),
        }

        client.disconnect().await.unwrap();
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_server_stop_disconnects_client() {
        let mut server = started_server().await;
        let port = server.addr().unwrap().port();

        let mut client: Client<String, String> = Client::new();
        client.connect(Endpoint::new("127.0.0.1", port)).await.unwrap();
        match server_event(&mut server).await {
            ServerEvent::Connect { client_id } => assert_eq!(client_id, 0),
            other => panic!("expected connect event, got {other:?}"),
        }

        server.stop().await.unwrap();

        // Exactly one Disconnected, and no Receive events before it.
        match client_event(&mut client).await {
            ClientEvent::Disconnected => {}
            other => panic!("expected disconnected event, got {other:?}"),
        }
        assert!(!client.is_connected());
        assert!(matches!(client.local_addr(), Err(Error::ConnectionClosed)));
    }
}
