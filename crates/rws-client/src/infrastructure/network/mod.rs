//! Network infrastructure: the websocket transport and its lifecycle driver.
//!
//! Architecture:
//! - [`Connection`] owns the lifecycle state machine ([`state::Lifecycle`])
//!   and, while connected, the write half of the TCP stream.
//! - Every established transport gets a *generation* number.  One supervisor
//!   task per `connect()` runs the read loop for the current generation,
//!   decides whether to reconnect when it ends, and runs the reconnect loop.
//! - Inbound frames are classified and forwarded on an `mpsc` channel as
//!   [`NetworkEvent`]s, in arrival order, to the application layer.
//! - Outbound frames go through a single `tokio::sync::Mutex` around the
//!   write half, so concurrent senders never interleave bytes.
//!
//! # Why generations? (for beginners)
//!
//! After a reconnect the old TCP stream is gone and a new one has taken its
//! place.  Anything that captured "the connection" earlier (a
//! [`ConnectionHandle`], the old read task) must not accidentally act on the
//! new stream.  Comparing generation numbers makes that check explicit.

pub mod state;

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use rws_core::protocol::handshake::{find_head_end, MAX_RESPONSE_HEAD};
use rws_core::{
    encode_control, encode_text, validate_upgrade, Frame, FrameDecoder, HandshakeError, Opcode,
    ProtocolError, UpgradeRequest, UpgradeResponse, WsUrl,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{tcp::OwnedReadHalf, TcpStream},
    sync::{mpsc, oneshot, watch, Mutex},
    time,
};
use tracing::{debug, error, info, warn};

use crate::error::ClientError;
use state::{CloseDecision, ConnectionState, Lifecycle};

/// Capacity of the network → application event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 128;

/// Size of a single socket read.
const READ_CHUNK: usize = 8 * 1024;

/// Static settings for a [`Connection`].
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub url: WsUrl,
    pub subprotocols: Vec<String>,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

/// Events emitted by the network layer to the application layer.
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    /// A transport was established and the upgrade validated.
    Connected {
        generation: u64,
        socket_id: u64,
        subprotocol: Option<String>,
    },
    /// Payload of a TEXT frame.
    Text(String),
    /// A TEXT frame whose payload could not be turned into a string.
    Undecodable(String),
    Ping,
    Pong,
    /// The relay sent a CLOSE frame.
    ClosedByServer,
    /// The transport is gone.  `reconnecting` tells whether a reconnect has
    /// been scheduled.
    Disconnected { reconnecting: bool },
    /// A transport error that suppressed reconnection.
    TransportError(String),
}

/// Why a read loop ended.
#[derive(Debug)]
pub enum ReadOutcome {
    /// EOF or a CLOSE frame from the relay.
    PeerClosed,
    /// `disconnect()` / `shutdown()` stopped the loop.
    LocalClose,
    /// The inbound byte stream violated the framing rules.
    Protocol(ProtocolError),
    Io(io::Error),
}

/// Result of a successful opening handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeOutcome {
    pub socket_id: u64,
    pub subprotocol: Option<String>,
    /// Bytes that arrived after the response head (already frame data).
    pub leftover: Vec<u8>,
}

// ── Handshake ─────────────────────────────────────────────────────────────────

/// Sends the upgrade request on `stream` and validates the relay's answer.
///
/// # Errors
///
/// - [`ClientError::Transport`] for I/O failures, including the relay closing
///   the stream before the response head is complete.
/// - [`ClientError::Handshake`] when the response is malformed or fails
///   validation.
pub async fn perform_handshake<S>(
    stream: &mut S,
    request: &UpgradeRequest,
) -> Result<HandshakeOutcome, ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&request.to_bytes()).await?;
    stream.flush().await?;

    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    let head_len = loop {
        if let Some(end) = find_head_end(&buf) {
            break end;
        }
        if buf.len() > MAX_RESPONSE_HEAD {
            return Err(HandshakeError::MalformedResponse("response head too large".to_string()).into());
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ClientError::Transport(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "relay closed the connection during the upgrade",
            )));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let response = UpgradeResponse::parse(&buf[..head_len])?;
    let subprotocol = validate_upgrade(&response, request.key(), request.protocols())?;
    let socket_id = match response.socket_id() {
        Some(id) => id,
        None => {
            warn!("relay did not assign a socket id, using 0");
            0
        }
    };

    Ok(HandshakeOutcome {
        socket_id,
        subprotocol,
        leftover: buf[head_len..].to_vec(),
    })
}

// ── Read loop ─────────────────────────────────────────────────────────────────

/// Reads frames until the transport ends, forwarding them on `events`.
///
/// `decoder` may already hold bytes that arrived together with the upgrade
/// response.  The loop ends on EOF, a CLOSE frame, a framing error, an I/O
/// error or when `stop` fires (or its sender is dropped).
pub async fn read_frames<R>(
    mut reader: R,
    mut decoder: FrameDecoder,
    mut stop: oneshot::Receiver<()>,
    events: &mpsc::Sender<NetworkEvent>,
) -> ReadOutcome
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => {
                    if let Some(outcome) = handle_frame(frame, events).await {
                        return outcome;
                    }
                }
                Ok(None) => break,
                Err(e) => return ReadOutcome::Protocol(e),
            }
        }

        tokio::select! {
            _ = &mut stop => return ReadOutcome::LocalClose,
            read = reader.read(&mut buf) => match read {
                Ok(0) => return ReadOutcome::PeerClosed,
                Ok(n) => decoder.extend(&buf[..n]),
                Err(e) => return ReadOutcome::Io(e),
            },
        }
    }
}

async fn handle_frame(frame: Frame, events: &mpsc::Sender<NetworkEvent>) -> Option<ReadOutcome> {
    let event = match frame.opcode {
        Opcode::Text => match frame.into_text() {
            Ok(text) => NetworkEvent::Text(text),
            Err(e) => NetworkEvent::Undecodable(e.to_string()),
        },
        Opcode::Ping => NetworkEvent::Ping,
        Opcode::Pong => NetworkEvent::Pong,
        Opcode::Close => {
            debug!("CLOSE frame received");
            forward(events, NetworkEvent::ClosedByServer).await;
            return Some(ReadOutcome::PeerClosed);
        }
        Opcode::Continuation => return Some(ReadOutcome::Protocol(ProtocolError::FragmentedFrame)),
    };
    forward(events, event).await;
    None
}

async fn forward(events: &mpsc::Sender<NetworkEvent>, event: NetworkEvent) {
    if events.send(event).await.is_err() {
        debug!("event receiver dropped");
    }
}

// ── Connection ────────────────────────────────────────────────────────────────

/// Write half of the transport.  Boxed so tests can swap in a mock stream.
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct ActiveTransport {
    generation: u64,
    writer: BoxedWriter,
    stop: Option<oneshot::Sender<()>>,
}

struct Established {
    generation: u64,
    reader: OwnedReadHalf,
    leftover: Vec<u8>,
    stop: oneshot::Receiver<()>,
}

struct Shared {
    settings: ConnectionSettings,
    lifecycle: StdMutex<Lifecycle>,
    transport: Mutex<Option<ActiveTransport>>,
    socket_id: AtomicU64,
    subprotocol: StdMutex<Option<String>>,
    events: mpsc::Sender<NetworkEvent>,
    shutdown: watch::Sender<bool>,
}

/// The client's websocket connection.  Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Creates a disconnected connection and the receiver for its events.
    pub fn new(settings: ConnectionSettings) -> (Self, mpsc::Receiver<NetworkEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        let shared = Shared {
            lifecycle: StdMutex::new(Lifecycle::new(settings.reconnect_attempts)),
            settings,
            transport: Mutex::new(None),
            socket_id: AtomicU64::new(0),
            subprotocol: StdMutex::new(None),
            events: tx,
            shutdown,
        };
        (
            Self {
                shared: Arc::new(shared),
            },
            rx,
        )
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lifecycle().state()
    }

    pub fn attempt(&self) -> u32 {
        self.shared.lifecycle().attempt()
    }

    pub fn generation(&self) -> u64 {
        self.shared.lifecycle().generation()
    }

    /// Socket id assigned by the relay (0 until known).
    pub fn socket_id(&self) -> u64 {
        self.shared.socket_id.load(Ordering::Relaxed)
    }

    pub fn set_socket_id(&self, id: u64) {
        self.shared.socket_id.store(id, Ordering::Relaxed);
    }

    /// Subprotocol negotiated on the current (or last) transport.
    pub fn subprotocol(&self) -> Option<String> {
        self.shared
            .subprotocol
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Receiver that flips to `true` when [`shutdown`](Self::shutdown) runs.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shared.shutdown.subscribe()
    }

    /// A handle bound to the current transport, if connected.
    pub fn handle(&self) -> Option<ConnectionHandle> {
        let lc = self.shared.lifecycle();
        (lc.state() == ConnectionState::Connected).then(|| ConnectionHandle {
            generation: lc.generation(),
            shared: Arc::clone(&self.shared),
        })
    }

    /// Opens the TCP connection, performs the upgrade and starts the read
    /// loop.
    ///
    /// # Errors
    ///
    /// - [`ClientError::InvalidState`] unless the connection is
    ///   `Disconnected` (or after shutdown).
    /// - [`ClientError::Transport`] when the relay is unreachable.
    /// - [`ClientError::Handshake`] when the upgrade is refused.
    ///
    /// A failed `connect()` leaves the connection `Disconnected` and does not
    /// schedule a reconnect.
    pub async fn connect(&self) -> Result<ConnectionHandle, ClientError> {
        self.shared.lifecycle().begin_connect()?;
        info!("connecting to {}", self.shared.settings.url.socket_addr());

        match self.shared.establish().await {
            Ok(established) => {
                let handle = ConnectionHandle {
                    generation: established.generation,
                    shared: Arc::clone(&self.shared),
                };
                tokio::spawn(Arc::clone(&self.shared).supervise(established));
                Ok(handle)
            }
            Err(e) => {
                self.shared.lifecycle().connect_failed();
                warn!("connect failed: {e}");
                Err(e)
            }
        }
    }

    /// Sends a CLOSE frame, closes the transport and suppresses reconnection.
    /// Emits `Disconnected { reconnecting: false }` before returning, so the
    /// event is never lost to a `connect()` that follows right away.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidState`] unless the connection is
    /// `Connected`.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        let mut transport = self.shared.transport.lock().await;
        let generation = self.shared.lifecycle().begin_close()?;
        info!(generation, "disconnecting");

        if let Some(mut active) = transport.take() {
            if let Err(e) = active.writer.write_all(&encode_control(Opcode::Close)).await {
                debug!("could not send CLOSE frame: {e}");
            }
            if let Err(e) = active.writer.shutdown().await {
                debug!("could not shut down write half: {e}");
            }
            if let Some(stop) = active.stop.take() {
                let _ = stop.send(());
            }
        }

        self.shared.lifecycle().finish_close();
        drop(transport);
        self.shared
            .emit(NetworkEvent::Disconnected { reconnecting: false })
            .await;
        Ok(())
    }

    /// Stops everything for good: cancels a pending reconnect, signals
    /// background tasks and disconnects if connected.  Idempotent.
    pub async fn shutdown(&self) {
        if !self.shared.lifecycle().shut_down() {
            return;
        }
        info!("shutting down connection");
        self.shared.shutdown.send_replace(true);

        if self.state() == ConnectionState::Connected {
            if let Err(e) = self.disconnect().await {
                debug!("disconnect during shutdown: {e}");
            }
        }
    }

    /// Sends `text` as one TEXT frame on the current transport.  Dropped with
    /// a debug log when not connected.
    ///
    /// # Errors
    ///
    /// [`ClientError::Protocol`] for payloads over 65 535 bytes and
    /// [`ClientError::Transport`] for write failures.
    pub async fn send_text(&self, text: &str) -> Result<(), ClientError> {
        let bytes = encode_text(text)?;
        self.shared.write_frame(&bytes, None).await
    }

    /// Sends a zero-length PING, PONG or CLOSE frame.
    ///
    /// # Errors
    ///
    /// [`ClientError::Transport`] for write failures.
    pub async fn send_control(&self, opcode: Opcode) -> Result<(), ClientError> {
        self.shared.write_frame(&encode_control(opcode), None).await
    }
}

/// A send-capable reference to one specific transport generation.
#[derive(Clone)]
pub struct ConnectionHandle {
    generation: u64,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("generation", &self.generation)
            .finish()
    }
}

impl ConnectionHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// `true` once the transport this handle was issued for has been
    /// replaced by a reconnect.
    pub fn is_stale(&self) -> bool {
        self.shared.lifecycle().generation() != self.generation
    }

    /// # Errors
    ///
    /// [`ClientError::StaleHandle`] after a reconnect,
    /// [`ClientError::NotConnected`] once this handle's transport is closed.
    pub async fn send_text(&self, text: &str) -> Result<(), ClientError> {
        let bytes = encode_text(text)?;
        self.shared.write_frame(&bytes, Some(self.generation)).await
    }

    /// # Errors
    ///
    /// Same as [`send_text`](Self::send_text).
    pub async fn send_control(&self, opcode: Opcode) -> Result<(), ClientError> {
        self.shared
            .write_frame(&encode_control(opcode), Some(self.generation))
            .await
    }
}

impl Shared {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn emit(&self, event: NetworkEvent) {
        forward(&self.events, event).await;
    }

    /// Writes one encoded frame.  A write failure is fatal: the transport is
    /// torn down, reconnection is suppressed and `TransportError` followed by
    /// `Disconnected { reconnecting: false }` is emitted.
    async fn write_frame(&self, bytes: &[u8], expected_generation: Option<u64>) -> Result<(), ClientError> {
        let mut transport = self.transport.lock().await;
        let active = match (transport.as_mut(), expected_generation) {
            (Some(active), Some(handle)) if active.generation != handle => {
                return Err(ClientError::StaleHandle {
                    handle,
                    current: active.generation,
                });
            }
            (Some(active), _) => active,
            (None, Some(handle)) => {
                let current = self.lifecycle().generation();
                return if current != handle {
                    Err(ClientError::StaleHandle { handle, current })
                } else {
                    Err(ClientError::NotConnected)
                };
            }
            (None, None) => {
                debug!(len = bytes.len(), "not connected, dropping outbound frame");
                return Ok(());
            }
        };

        let generation = active.generation;
        let Err(e) = active.writer.write_all(bytes).await else {
            return Ok(());
        };
        error!(generation, "write failed, dropping connection: {e}");

        if let Some(stop) = transport.take().and_then(|mut t| t.stop.take()) {
            let _ = stop.send(());
        }
        let decision = {
            let mut lc = self.lifecycle();
            if lc.generation() == generation {
                lc.suppress_reconnect();
            }
            lc.transport_closed(generation)
        };
        drop(transport);

        if decision != CloseDecision::Stale {
            self.emit(NetworkEvent::TransportError(e.to_string())).await;
            self.emit(NetworkEvent::Disconnected { reconnecting: false }).await;
        }
        Err(ClientError::Transport(e))
    }

    /// TCP connect + upgrade.  On success the writer is installed, the state
    /// is `Connected` and a `Connected` event has been emitted.
    async fn establish(&self) -> Result<Established, ClientError> {
        let request = UpgradeRequest::new(self.settings.url.clone(), self.settings.subprotocols.clone());
        let mut stream = TcpStream::connect(self.settings.url.socket_addr()).await?;
        stream.set_nodelay(true)?;
        self.lifecycle().tcp_connected();

        let handshake = perform_handshake(&mut stream, &request).await?;
        let (reader, writer) = stream.into_split();
        let (stop_tx, stop_rx) = oneshot::channel();

        let generation = {
            let mut transport = self.transport.lock().await;
            let generation = {
                let mut lc = self.lifecycle();
                if lc.is_shut_down() {
                    None
                } else {
                    Some(lc.upgrade_complete())
                }
            };
            let Some(generation) = generation else {
                return Err(ClientError::InvalidState {
                    operation: "connect",
                    state: ConnectionState::Disconnected,
                });
            };
            *transport = Some(ActiveTransport {
                generation,
                writer: Box::new(writer),
                stop: Some(stop_tx),
            });
            generation
        };

        self.socket_id.store(handshake.socket_id, Ordering::Relaxed);
        *self.subprotocol.lock().unwrap_or_else(PoisonError::into_inner) = handshake.subprotocol.clone();
        info!(
            generation,
            socket_id = handshake.socket_id,
            "connected to {}",
            self.settings.url.socket_addr()
        );
        self.emit(NetworkEvent::Connected {
            generation,
            socket_id: handshake.socket_id,
            subprotocol: handshake.subprotocol,
        })
        .await;

        Ok(Established {
            generation,
            reader,
            leftover: handshake.leftover,
            stop: stop_rx,
        })
    }

    /// Runs read loops and reconnects until the connection is finished.
    async fn supervise(self: Arc<Self>, mut current: Established) {
        loop {
            let generation = current.generation;
            let mut decoder = FrameDecoder::new();
            decoder.extend(&current.leftover);

            let outcome = read_frames(current.reader, decoder, current.stop, &self.events).await;
            if !self.transport_ended(generation, outcome).await {
                return;
            }
            match self.reconnect().await {
                Some(next) => current = next,
                None => return,
            }
        }
    }

    /// Cleans up after a read loop and returns whether to reconnect.
    ///
    /// When the transport was already closed locally (`disconnect()` or a
    /// failed write) that path has emitted the events and this stays quiet.
    async fn transport_ended(&self, generation: u64, outcome: ReadOutcome) -> bool {
        {
            let mut transport = self.transport.lock().await;
            if transport.as_ref().map(|t| t.generation) == Some(generation) {
                *transport = None;
            }
        }

        let mut fatal_error = None;
        match outcome {
            ReadOutcome::PeerClosed => info!(generation, "connection closed by relay"),
            ReadOutcome::LocalClose => debug!(generation, "connection closed locally"),
            ReadOutcome::Protocol(e) => warn!(generation, "protocol error, dropping connection: {e}"),
            ReadOutcome::Io(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                warn!(generation, "connection refused: {e}")
            }
            ReadOutcome::Io(e) => {
                error!(generation, "transport error: {e}");
                fatal_error = Some(e.to_string());
            }
        }

        let (was_connected, decision) = {
            let mut lc = self.lifecycle();
            let current = lc.generation() == generation;
            if fatal_error.is_some() && current {
                lc.suppress_reconnect();
            }
            let was_connected = current && lc.state() == ConnectionState::Connected;
            (was_connected, lc.transport_closed(generation))
        };

        if decision == CloseDecision::Stale || !was_connected {
            return false;
        }
        if let Some(message) = fatal_error {
            self.emit(NetworkEvent::TransportError(message)).await;
        }
        let reconnecting = decision == CloseDecision::Reconnect;
        self.emit(NetworkEvent::Disconnected { reconnecting }).await;
        reconnecting
    }

    /// Sleeps, retries and returns the next transport, or `None` when
    /// reconnection gave up or was cancelled.
    async fn reconnect(&self) -> Option<Established> {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let (attempt, max) = {
                let lc = self.lifecycle();
                (lc.attempt() + 1, lc.max_attempts())
            };
            info!(
                "reconnecting in {:?} (attempt {attempt} of {max})",
                self.settings.reconnect_delay
            );
            tokio::select! {
                _ = time::sleep(self.settings.reconnect_delay) => {}
                _ = shutdown.wait_for(|stopped| *stopped) => {}
            }

            if !self.lifecycle().begin_reconnect_attempt() {
                debug!("reconnect cancelled");
                self.emit(NetworkEvent::Disconnected { reconnecting: false }).await;
                return None;
            }

            match self.establish().await {
                Ok(established) => return Some(established),
                Err(e) => {
                    warn!("reconnect attempt {attempt} failed: {e}");
                    let retry = self.lifecycle().reconnect_failed(e.is_fatal_for_reconnect());
                    if !retry {
                        if let Some(io) = e.transport_failure() {
                            self.emit(NetworkEvent::TransportError(io.to_string())).await;
                        }
                        self.emit(NetworkEvent::Disconnected { reconnecting: false }).await;
                        return None;
                    }
                }
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rws_core::compute_accept_key;
    use tokio_test::io::Builder;

    const KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

    fn request() -> UpgradeRequest {
        let url = WsUrl::parse("ws://127.0.0.1:3211/").unwrap();
        UpgradeRequest::with_key(url, KEY.to_string(), vec!["jsonRWS".to_string()])
    }

    fn ok_response(socket_id: Option<u64>) -> String {
        let mut head = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\
             Sec-WebSocket-Version: 13\r\n\
             Sec-WebSocket-Protocol: jsonRWS\r\n",
            compute_accept_key(KEY)
        );
        if let Some(id) = socket_id {
            head.push_str(&format!("Sec-WebSocket-Socketid: {id}\r\n"));
        }
        head.push_str("\r\n");
        head
    }

    fn drain(rx: &mut mpsc::Receiver<NetworkEvent>) -> Vec<NetworkEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    // ── perform_handshake ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_handshake_returns_socket_id_and_leftover_bytes() {
        // Arrange – the first frame arrives in the same read as the response
        let req = request();
        let frame = encode_text("early").unwrap();
        let mut inbound = ok_response(Some(42)).into_bytes();
        inbound.extend_from_slice(&frame);
        let mut mock = Builder::new().write(&req.to_bytes()).read(&inbound).build();

        // Act
        let outcome = perform_handshake(&mut mock, &req).await.unwrap();

        // Assert
        assert_eq!(outcome.socket_id, 42);
        assert_eq!(outcome.subprotocol.as_deref(), Some("jsonRWS"));
        assert_eq!(outcome.leftover, frame);
    }

    #[tokio::test]
    async fn test_handshake_response_split_across_reads() {
        let req = request();
        let response = ok_response(Some(7));
        let (a, b) = response.as_bytes().split_at(20);
        let mut mock = Builder::new().write(&req.to_bytes()).read(a).read(b).build();

        let outcome = perform_handshake(&mut mock, &req).await.unwrap();

        assert_eq!(outcome.socket_id, 7);
        assert!(outcome.leftover.is_empty());
    }

    #[tokio::test]
    async fn test_handshake_without_socket_id_uses_zero() {
        let req = request();
        let mut mock = Builder::new()
            .write(&req.to_bytes())
            .read(ok_response(None).as_bytes())
            .build();

        let outcome = perform_handshake(&mut mock, &req).await.unwrap();

        assert_eq!(outcome.socket_id, 0);
    }

    #[tokio::test]
    async fn test_handshake_rejects_non_101_status() {
        let req = request();
        let mut mock = Builder::new()
            .write(&req.to_bytes())
            .read(b"HTTP/1.1 401 Unauthorized\r\n\r\n")
            .build();

        let result = perform_handshake(&mut mock, &req).await;

        assert!(matches!(
            result,
            Err(ClientError::Handshake(HandshakeError::UnexpectedStatus(401)))
        ));
    }

    #[tokio::test]
    async fn test_handshake_eof_is_a_transport_error() {
        let req = request();
        let mut mock = Builder::new().write(&req.to_bytes()).build();

        let result = perform_handshake(&mut mock, &req).await;

        assert!(matches!(result, Err(ClientError::Transport(ref e)) if e.kind() == io::ErrorKind::UnexpectedEof));
    }

    // ── read_frames ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_read_loop_forwards_frames_in_order_until_eof() {
        // Arrange
        let mut wire = encode_text(r#"{"cmd":"a"}"#).unwrap();
        wire.extend(encode_control(Opcode::Ping));
        wire.extend(encode_control(Opcode::Pong));
        let (a, b) = wire.split_at(5);
        let reader = Builder::new().read(a).read(b).build();
        let (tx, mut rx) = mpsc::channel(16);
        let (_stop_tx, stop_rx) = oneshot::channel();

        // Act
        let outcome = read_frames(reader, FrameDecoder::new(), stop_rx, &tx).await;

        // Assert
        assert!(matches!(outcome, ReadOutcome::PeerClosed));
        assert_eq!(
            drain(&mut rx),
            vec![
                NetworkEvent::Text(r#"{"cmd":"a"}"#.to_string()),
                NetworkEvent::Ping,
                NetworkEvent::Pong,
            ]
        );
    }

    #[tokio::test]
    async fn test_read_loop_uses_bytes_buffered_during_handshake() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&encode_text("leftover").unwrap());
        let reader = Builder::new().build();
        let (tx, mut rx) = mpsc::channel(16);
        let (_stop_tx, stop_rx) = oneshot::channel();

        read_frames(reader, decoder, stop_rx, &tx).await;

        assert_eq!(drain(&mut rx), vec![NetworkEvent::Text("leftover".to_string())]);
    }

    #[tokio::test]
    async fn test_close_frame_emits_closed_by_server_and_stops() {
        let reader = Builder::new().read(&encode_control(Opcode::Close)).build();
        let (tx, mut rx) = mpsc::channel(16);
        let (_stop_tx, stop_rx) = oneshot::channel();

        let outcome = read_frames(reader, FrameDecoder::new(), stop_rx, &tx).await;

        assert!(matches!(outcome, ReadOutcome::PeerClosed));
        assert_eq!(drain(&mut rx), vec![NetworkEvent::ClosedByServer]);
    }

    #[tokio::test]
    async fn test_read_loop_keeps_going_after_receiver_is_dropped() {
        // Arrange
        let mut wire = encode_text("nobody listens").unwrap();
        wire.extend(encode_control(Opcode::Close));
        let reader = Builder::new().read(&wire).build();
        let (tx, rx) = mpsc::channel(16);
        drop(rx);
        let (_stop_tx, stop_rx) = oneshot::channel();

        // Act
        let outcome = read_frames(reader, FrameDecoder::new(), stop_rx, &tx).await;

        // Assert – the CLOSE after the undeliverable TEXT is still honoured
        assert!(matches!(outcome, ReadOutcome::PeerClosed));
    }

    #[tokio::test]
    async fn test_masked_frame_is_a_protocol_error() {
        let reader = Builder::new().read(&[0x81, 0x80, 1, 2, 3, 4]).build();
        let (tx, _rx) = mpsc::channel(16);
        let (_stop_tx, stop_rx) = oneshot::channel();

        let outcome = read_frames(reader, FrameDecoder::new(), stop_rx, &tx).await;

        assert!(matches!(outcome, ReadOutcome::Protocol(ProtocolError::MaskedFrame)));
    }

    #[tokio::test]
    async fn test_invalid_utf8_does_not_stop_the_loop() {
        // Arrange – a TEXT frame with a lone continuation byte, then valid text
        let mut wire = vec![0x81, 0x01, 0x80];
        wire.extend(encode_text("ok").unwrap());
        let reader = Builder::new().read(&wire).build();
        let (tx, mut rx) = mpsc::channel(16);
        let (_stop_tx, stop_rx) = oneshot::channel();

        // Act
        read_frames(reader, FrameDecoder::new(), stop_rx, &tx).await;

        // Assert
        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], NetworkEvent::Undecodable(_)));
        assert_eq!(events[1], NetworkEvent::Text("ok".to_string()));
    }

    #[tokio::test]
    async fn test_stop_signal_ends_an_idle_loop() {
        // Arrange – the peer end stays open but silent
        let (_peer, local) = tokio::io::duplex(64);
        let (tx, _rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = oneshot::channel();

        // Act
        stop_tx.send(()).unwrap();
        let outcome = read_frames(local, FrameDecoder::new(), stop_rx, &tx).await;

        // Assert
        assert!(matches!(outcome, ReadOutcome::LocalClose));
    }

    // ── Connection without a relay ────────────────────────────────────────────

    fn settings(url: &str) -> ConnectionSettings {
        ConnectionSettings {
            url: WsUrl::parse(url).unwrap(),
            subprotocols: vec!["jsonRWS".to_string()],
            reconnect_attempts: 3,
            reconnect_delay: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_send_while_disconnected_is_dropped() {
        let (conn, _rx) = Connection::new(settings("ws://127.0.0.1:1"));
        assert!(conn.send_text("hello").await.is_ok());
        assert!(conn.send_control(Opcode::Ping).await.is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_when_not_connected_is_invalid_state() {
        let (conn, _rx) = Connection::new(settings("ws://127.0.0.1:1"));
        assert!(matches!(
            conn.disconnect().await,
            Err(ClientError::InvalidState {
                operation: "disconnect",
                state: ConnectionState::Disconnected
            })
        ));
    }

    #[tokio::test]
    async fn test_refused_connect_returns_error_and_stays_disconnected() {
        // Arrange – bind then drop a listener to get a port nobody listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let (conn, _rx) = Connection::new(settings(&format!("ws://127.0.0.1:{port}")));

        // Act
        let result = conn.connect().await;

        // Assert
        assert!(matches!(result, Err(ClientError::Transport(_))));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.generation(), 0);
    }

    /// Puts `conn` into `Connected` with `writer` as the transport's write half.
    async fn install_transport(conn: &Connection, writer: BoxedWriter) -> oneshot::Receiver<()> {
        let generation = {
            let mut lc = conn.shared.lifecycle();
            lc.begin_connect().unwrap();
            lc.tcp_connected();
            lc.upgrade_complete()
        };
        let (stop_tx, stop_rx) = oneshot::channel();
        *conn.shared.transport.lock().await = Some(ActiveTransport {
            generation,
            writer,
            stop: Some(stop_tx),
        });
        stop_rx
    }

    #[tokio::test]
    async fn test_write_failure_tears_down_transport_and_stops_reconnecting() {
        // Arrange
        let (conn, mut rx) = Connection::new(settings("ws://127.0.0.1:1"));
        let writer = Builder::new()
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"))
            .build();
        let stop = install_transport(&conn, Box::new(writer)).await;

        // Act
        let result = conn.send_text("hello").await;

        // Assert
        assert!(matches!(result, Err(ClientError::Transport(ref e)) if e.kind() == io::ErrorKind::BrokenPipe));
        assert!(conn.attempt() > 3, "reconnection must be suppressed");
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(conn.shared.transport.lock().await.is_none());
        assert!(stop.await.is_ok(), "read loop must be told to stop");
        assert_eq!(
            drain(&mut rx),
            vec![
                NetworkEvent::TransportError("pipe closed".to_string()),
                NetworkEvent::Disconnected { reconnecting: false },
            ]
        );
    }

    #[tokio::test]
    async fn test_read_loop_ending_after_failed_write_stays_quiet() {
        // Arrange
        let (conn, mut rx) = Connection::new(settings("ws://127.0.0.1:1"));
        let writer = Builder::new()
            .write_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        install_transport(&conn, Box::new(writer)).await;
        let generation = conn.generation();
        let _ = conn.send_control(Opcode::Ping).await;
        drain(&mut rx);

        // Act
        let reconnect = conn.shared.transport_ended(generation, ReadOutcome::LocalClose).await;

        // Assert
        assert!(!reconnect);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_emits_disconnected_before_returning() {
        // Arrange
        let (conn, mut rx) = Connection::new(settings("ws://127.0.0.1:1"));
        let writer = Builder::new().write(&encode_control(Opcode::Close)).build();
        let stop = install_transport(&conn, Box::new(writer)).await;

        // Act
        conn.disconnect().await.unwrap();

        // Assert
        assert!(stop.await.is_ok());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(drain(&mut rx), vec![NetworkEvent::Disconnected { reconnecting: false }]);
        assert!(conn.shared.lifecycle().begin_connect().is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_blocks_later_connects() {
        let (conn, _rx) = Connection::new(settings("ws://127.0.0.1:1"));

        conn.shutdown().await;
        conn.shutdown().await;

        assert!(*conn.shutdown_signal().borrow());
        assert!(matches!(conn.connect().await, Err(ClientError::InvalidState { .. })));
    }
}
