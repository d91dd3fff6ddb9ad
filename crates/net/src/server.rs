//! TCP server hosting many encrypted client connections
//!
//! Each accepted connection gets a sequential client id and its own key
//! exchange, session, and read-loop task. Outbound sends fan out across the
//! chosen clients concurrently and are joined with a [`WaitGroup`].

use std::collections::HashMap;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, ReadHalf};
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::crypto::DEFAULT_RSA_BITS;
use crate::error::{Error, Result};
use crate::frame::MessageStream;
use crate::handshake;
use crate::session::{Session, READ_BUFFER_SIZE};
use crate::wait::WaitGroup;
use crate::{Endpoint, BACKLOG, DEFAULT_PORT, DEFAULT_SERVER_HOST};

/// Event surfaced by the server.
#[derive(Debug)]
pub enum ServerEvent<R> {
    /// A client completed the key exchange and was registered.
    Connect { client_id: usize },
    /// A message arrived from a client.
    Receive { client_id: usize, data: R },
    /// A client's connection closed; the registry entry is already gone.
    Disconnect { client_id: usize },
}

/// One registered connection.
struct ClientHandle {
    session: Arc<Session>,
    reader: Option<JoinHandle<()>>,
}

type Registry = Arc<RwLock<HashMap<usize, ClientHandle>>>;

/// Pause before retrying after a failed `accept`, so a persistent error
/// (fd exhaustion, say) does not spin the loop hot.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// A socket server. `S` is the type of data sent, `R` the type received.
pub struct Server<S, R> {
    serving: Arc<AtomicBool>,
    clients: Registry,
    /// Monotone within one serve cycle; ids are never reused until the next
    /// `start` after a `stop`.
    next_client_id: Arc<AtomicUsize>,
    key_bits: usize,
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    accept_task: Option<JoinHandle<()>>,
    event_rx: Option<mpsc::Receiver<ServerEvent<R>>>,
    _marker: PhantomData<fn(S)>,
}

impl<S, R> Server<S, R>
where
    S: Serialize,
    R: DeserializeOwned + Send + 'static,
{
    pub fn new() -> Self {
        Self::with_key_size(DEFAULT_RSA_BITS)
    }

    /// A server whose per-connection RSA bootstrap keys are `key_bits` long.
    pub fn with_key_size(key_bits: usize) -> Self {
        Self {
            serving: Arc::new(AtomicBool::new(false)),
            clients: Arc::new(RwLock::new(HashMap::new())),
            next_client_id: Arc::new(AtomicUsize::new(0)),
            key_bits,
            local_addr: None,
            shutdown_tx: None,
            accept_task: None,
            event_rx: None,
            _marker: PhantomData,
        }
    }

    /// Bind and begin accepting connections.
    ///
    /// Unset endpoint fields default to `0.0.0.0` and port 29275. Fails if
    /// already serving. Resets the client-id counter to 0.
    pub async fn start(&mut self, endpoint: Endpoint) -> Result<()> {
        if self.is_serving() {
            return Err(Error::AlreadyServing);
        }

        let (host, port) = endpoint.resolve(DEFAULT_SERVER_HOST, DEFAULT_PORT);
        let addr = lookup_host((host.as_str(), port))
            .await?
            .next()
            .ok_or_else(|| Error::InvalidAddress(host.clone()))?;

        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.bind(addr)?;
        let listener = socket.listen(BACKLOG)?;
        let bound_addr = listener.local_addr()?;

        info!(addr = %bound_addr, "Server started");

        self.next_client_id.store(0, Ordering::SeqCst);
        // Fresh flag per serve cycle: a handshake task spawned by an earlier
        // cycle still holds that cycle's flag, which stays false forever, so
        // it can never register into this cycle's registry.
        self.serving = Arc::new(AtomicBool::new(true));

        let (event_tx, event_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            self.serving.clone(),
            self.clients.clone(),
            self.next_client_id.clone(),
            event_tx,
            shutdown_rx,
            self.key_bits,
        ));

        self.local_addr = Some(bound_addr);
        self.shutdown_tx = Some(shutdown_tx);
        self.accept_task = Some(accept_task);
        self.event_rx = Some(event_rx);
        Ok(())
    }

    /// Stop serving: close every live session, clear the registry, drop the
    /// listener. Fails if not serving.
    pub async fn stop(&mut self) -> Result<()> {
        if !self.is_serving() {
            return Err(Error::NotServing);
        }
        self.serving.store(false, Ordering::SeqCst);

        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }

        let mut clients = self.clients.write().await;
        for (_, handle) in clients.drain() {
            if let Some(reader) = handle.reader {
                reader.abort();
            }
            handle.session.close().await;
        }
        drop(clients);

        self.local_addr = None;
        info!("Server stopped");
        Ok(())
    }

    /// Send a message to the given clients, or to every registered client if
    /// `client_ids` is empty.
    ///
    /// Fails immediately with `UnknownClient` if a named id is not
    /// registered. Otherwise the writes run concurrently, are joined with a
    /// WaitGroup, and the first write error (if any) is returned after every
    /// target has finished.
    pub async fn send(&self, data: &S, client_ids: &[usize]) -> Result<()> {
        if !self.is_serving() {
            return Err(Error::NotServing);
        }

        let payload = serde_json::to_vec(data)
            .map_err(|e| Error::Protocol(format!("serialization failed: {e}")))?;

        let targets: Vec<Arc<Session>> = {
            let clients = self.clients.read().await;
            if client_ids.is_empty() {
                clients.values().map(|handle| handle.session.clone()).collect()
            } else {
                let mut targets = Vec::with_capacity(client_ids.len());
                for client_id in client_ids {
                    let handle = clients
                        .get(client_id)
                        .ok_or(Error::UnknownClient(*client_id))?;
                    targets.push(handle.session.clone());
                }
                targets
            }
        };

        let wg = Arc::new(WaitGroup::new());
        let first_error = Arc::new(Mutex::new(None));

        for session in targets {
            wg.add(1);
            let wg = wg.clone();
            let first_error = first_error.clone();
            let payload = payload.clone();
            tokio::spawn(async move {
                if let Err(e) = session.send(&payload).await {
                    let mut slot = first_error.lock().await;
                    if slot.is_none() {
                        *slot = Some(e);
                    }
                }
                wg.done(1);
            });
        }

        wg.wait().await;
        let mut slot = first_error.lock().await;
        match slot.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn is_serving(&self) -> bool {
        self.serving.load(Ordering::SeqCst)
    }

    /// The listener's bound address. Fails if not serving.
    pub fn addr(&self) -> Result<SocketAddr> {
        if !self.is_serving() {
            return Err(Error::NotServing);
        }
        self.local_addr.ok_or(Error::NotServing)
    }

    /// The remote address of a registered client.
    pub async fn client_addr(&self, client_id: usize) -> Result<SocketAddr> {
        if !self.is_serving() {
            return Err(Error::NotServing);
        }
        let clients = self.clients.read().await;
        let handle = clients.get(&client_id).ok_or(Error::UnknownClient(client_id))?;
        Ok(handle.session.peer_addr())
    }

    /// Forcibly close one client's session and drop it from the registry.
    ///
    /// No `Disconnect` event is emitted for a server-initiated removal.
    pub async fn remove_client(&self, client_id: usize) -> Result<()> {
        if !self.is_serving() {
            return Err(Error::NotServing);
        }
        let handle = self
            .clients
            .write()
            .await
            .remove(&client_id)
            .ok_or(Error::UnknownClient(client_id))?;

        if let Some(reader) = handle.reader {
            reader.abort();
        }
        handle.session.close().await;

        info!(client_id = client_id, "Client removed");
        Ok(())
    }

    /// The next server event, or `None` once the event stream has ended.
    pub async fn next_event(&mut self) -> Option<ServerEvent<R>> {
        match self.event_rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }
}

impl<S, R> Default for Server<S, R>
where
    S: Serialize,
    R: DeserializeOwned + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<S, R> Drop for Server<S, R> {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

/// Accept incoming connections until shutdown.
async fn accept_loop<R>(
    listener: TcpListener,
    serving: Arc<AtomicBool>,
    clients: Registry,
    next_client_id: Arc<AtomicUsize>,
    event_tx: mpsc::Sender<ServerEvent<R>>,
    mut shutdown_rx: broadcast::Receiver<()>,
    key_bits: usize,
) where
    R: DeserializeOwned + Send + 'static,
{
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        debug!(addr = %addr, "New connection");
                        let client_id = next_client_id.fetch_add(1, Ordering::SeqCst);
                        tokio::spawn(handle_connection(
                            stream,
                            client_id,
                            serving.clone(),
                            clients.clone(),
                            event_tx.clone(),
                            key_bits,
                        ));
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Accept loop shutting down");
                break;
            }
        }
    }
}

/// Run the key exchange for one accepted connection, register the session,
/// and hand off to the read loop.
async fn handle_connection<R>(
    mut stream: TcpStream,
    client_id: usize,
    serving: Arc<AtomicBool>,
    clients: Registry,
    event_tx: mpsc::Sender<ServerEvent<R>>,
    key_bits: usize,
) where
    R: DeserializeOwned + Send + 'static,
{
    let key = match handshake::issue_key(&mut stream, key_bits).await {
        Ok(key) => key,
        Err(e) => {
            // Handshake failure never yields a registered session.
            warn!(client_id = client_id, error = %e, "Key exchange failed");
            return;
        }
    };

    let (local_addr, peer_addr) = match (stream.local_addr(), stream.peer_addr()) {
        (Ok(local), Ok(peer)) => (local, peer),
        _ => {
            warn!(client_id = client_id, "Connection lost before registration");
            return;
        }
    };

    let (reader, writer) = tokio::io::split(stream);
    let session = Arc::new(Session::new(writer, key, local_addr, peer_addr));

    {
        // Checked under the registry lock: stop() flips the flag before it
        // drains, so a key exchange finishing after stop lands here and the
        // connection is dropped instead of registered.
        let mut clients = clients.write().await;
        if !serving.load(Ordering::SeqCst) {
            debug!(client_id = client_id, "Server stopped during key exchange");
            return;
        }
        clients.insert(
            client_id,
            ClientHandle {
                session: session.clone(),
                reader: None,
            },
        );
    }
    info!(client_id = client_id, addr = %peer_addr, "Client connected");
    let _ = event_tx.send(ServerEvent::Connect { client_id }).await;

    let task = tokio::spawn(read_loop(reader, session, client_id, clients.clone(), event_tx));

    // If the read loop already tore the entry down, the task has finished;
    // otherwise record its handle so removal can abort it.
    if let Some(handle) = clients.write().await.get_mut(&client_id) {
        handle.reader = Some(task);
    }
}

/// Read loop for one client: reassemble frames, decrypt, decode, surface
/// events, and deregister on close.
async fn read_loop<R>(
    mut reader: ReadHalf<TcpStream>,
    session: Arc<Session>,
    client_id: usize,
    clients: Registry,
    event_tx: mpsc::Sender<ServerEvent<R>>,
) where
    R: DeserializeOwned + Send + 'static,
{
    let mut stream = MessageStream::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    'conn: loop {
        if !session.is_active() {
            break;
        }

        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                debug!(client_id = client_id, "Connection closed");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                warn!(client_id = client_id, error = %e, "Read error");
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
                    let event = ServerEvent::Receive { client_id, data };
                    if event_tx.send(event).await.is_err() {
                        break 'conn;
                    }
                }
                Err(e) => {
                    warn!(client_id = client_id, error = %e, "Failed to open message");
                    break 'conn;
                }
            }
        }
    }

    // Automatic deregistration. Stays silent if remove_client or stop won
    // the race; the entry is already gone and the notification was theirs
    // to skip.
    if clients.write().await.remove(&client_id).is_some() {
        session.close().await;
        let _ = event_tx.send(ServerEvent::Disconnect { client_id }).await;
        info!(client_id = client_id, "Client disconnected");
    }
}
