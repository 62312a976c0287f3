//! `RwsClient`: the public face of the jsonRWS client.
//!
//! # How the pieces fit together
//!
//! ```text
//!   relay ──TCP──▶ Connection (read loop) ──NetworkEvent──▶ event pump
//!                                                              │
//!                              ┌───────────────────────────────┤
//!                              ▼                               ▼
//!                     QuestionCorrelator            EventDistributor ──▶ subscribers
//!                     (answers to question())      (Message, Route, Ping, …)
//! ```
//!
//! Outbound operations build an [`Envelope`] (`id` from the message id
//! generator, `from` = our socket id) and write it as one TEXT frame.  When
//! the client is not connected the frame is dropped and logged at debug
//! level, so fire-and-forget sends never fail just because a reconnect is in
//! progress.

use std::sync::Arc;
use std::time::Duration;

use rws_core::{
    decode_envelope, encode_envelope, Command, DispatchOutcome, Envelope, EnvelopeError,
    MessageIdGenerator, Opcode, Recipient, RouteError, Router, WsUrl,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, warn};

use super::correlator::QuestionCorrelator;
use super::events::{ClientEvent, EventDistributor};
use crate::error::ClientError;
use crate::infrastructure::network::state::ConnectionState;
use crate::infrastructure::network::{Connection, ConnectionHandle, ConnectionSettings, NetworkEvent};
use crate::infrastructure::storage::config::ConnectionConfig;

/// One entry of `info/room/list` and `info/room/listmy` answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub name: String,
    #[serde(rename = "socketIds", default)]
    pub socket_ids: Vec<u64>,
}

/// The jsonRWS websocket client.
pub struct RwsClient {
    connection: Connection,
    correlator: Arc<QuestionCorrelator>,
    events: Arc<EventDistributor>,
    ids: MessageIdGenerator,
    question_timeout: Duration,
}

impl RwsClient {
    /// Builds a disconnected client and starts its event pump.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Handshake`] if `config.url` is not a valid
    /// `ws://` URL.
    pub fn new(config: &ConnectionConfig) -> Result<Self, ClientError> {
        let settings = ConnectionSettings {
            url: WsUrl::parse(&config.url)?,
            subprotocols: config.subprotocols.clone(),
            reconnect_attempts: config.reconnect_attempts,
            reconnect_delay: config.reconnect_delay(),
        };
        let (connection, network_events) = Connection::new(settings);
        let correlator = Arc::new(QuestionCorrelator::new());
        let events = Arc::new(EventDistributor::new());

        tokio::spawn(pump_events(
            network_events,
            Arc::clone(&correlator),
            Arc::clone(&events),
        ));

        Ok(Self {
            connection,
            correlator,
            events,
            ids: MessageIdGenerator::new(),
            question_timeout: config.question_timeout(),
        })
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// See [`Connection::connect`].
    ///
    /// # Errors
    ///
    /// [`ClientError::InvalidState`], [`ClientError::Transport`] or
    /// [`ClientError::Handshake`].
    pub async fn connect(&self) -> Result<ConnectionHandle, ClientError> {
        self.connection.connect().await
    }

    /// See [`Connection::disconnect`].
    ///
    /// # Errors
    ///
    /// [`ClientError::InvalidState`] unless connected.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        self.connection.disconnect().await
    }

    /// Stops reconnection and background ping tasks and disconnects.
    pub async fn shutdown(&self) {
        self.connection.shutdown().await;
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn attempt(&self) -> u32 {
        self.connection.attempt()
    }

    pub fn socket_id(&self) -> u64 {
        self.connection.socket_id()
    }

    pub fn subprotocol(&self) -> Option<String> {
        self.connection.subprotocol()
    }

    /// Handle bound to the current transport, if connected.
    pub fn handle(&self) -> Option<ConnectionHandle> {
        self.connection.handle()
    }

    /// Registers an event subscriber.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Number of questions still waiting for an answer.
    pub fn pending_questions(&self) -> usize {
        self.correlator.pending_count()
    }

    // ── Questions ─────────────────────────────────────────────────────────────

    /// Sends `cmd` to the relay and waits for the first envelope with the
    /// same command.
    ///
    /// # Errors
    ///
    /// [`ClientError::Timeout`] when no answer arrives within the configured
    /// question timeout (also when disconnected, since the question is then
    /// never sent).
    pub async fn question(&self, cmd: Command) -> Result<Envelope, ClientError> {
        let pending = self.correlator.register(cmd.as_str());
        self.carry_out(cmd, Recipient::Socket(self.socket_id()), None)
            .await?;
        self.correlator.wait(pending, self.question_timeout).await
    }

    /// Asks the relay for our socket id and remembers it.
    ///
    /// # Errors
    ///
    /// See [`question`](Self::question); [`ClientError::Envelope`] if the
    /// answer is not a number.
    pub async fn info_socket_id(&self) -> Result<u64, ClientError> {
        let answer = self.question(Command::InfoSocketId).await?;
        let id = match &answer.payload {
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        }
        .ok_or_else(|| EnvelopeError::UnexpectedPayload {
            cmd: answer.cmd.clone(),
            expected: "a numeric socket id",
        })?;
        self.connection.set_socket_id(id);
        Ok(id)
    }

    /// Socket ids of every client connected to the relay.
    ///
    /// # Errors
    ///
    /// See [`question`](Self::question).
    pub async fn info_socket_list(&self) -> Result<Vec<u64>, ClientError> {
        self.question_payload(Command::InfoSocketList).await
    }

    /// Every room on the relay.
    ///
    /// # Errors
    ///
    /// See [`question`](Self::question).
    pub async fn info_room_list(&self) -> Result<Vec<RoomInfo>, ClientError> {
        self.question_payload(Command::InfoRoomList).await
    }

    /// Rooms this client has entered.
    ///
    /// # Errors
    ///
    /// See [`question`](Self::question).
    pub async fn info_room_list_my(&self) -> Result<Vec<RoomInfo>, ClientError> {
        self.question_payload(Command::InfoRoomListMy).await
    }

    async fn question_payload<T>(&self, cmd: Command) -> Result<T, ClientError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let answer = self.question(cmd).await?;
        let payload = answer.payload.unwrap_or(Value::Null);
        serde_json::from_value(payload)
            .map_err(|e| ClientError::Envelope(EnvelopeError::Json(e)))
    }

    // ── Messaging ─────────────────────────────────────────────────────────────

    /// `socket/sendone`: one message to one client.
    ///
    /// # Errors
    ///
    /// [`ClientError::Transport`] on write failure.
    pub async fn send_one(&self, to: u64, payload: Value) -> Result<(), ClientError> {
        self.carry_out(Command::SocketSendOne, Recipient::Socket(to), Some(payload))
            .await
    }

    /// `socket/send`: one message to several clients.
    ///
    /// # Errors
    ///
    /// [`ClientError::Transport`] on write failure.
    pub async fn send(&self, to: &[u64], payload: Value) -> Result<(), ClientError> {
        self.carry_out(Command::SocketSend, Recipient::Sockets(to.to_vec()), Some(payload))
            .await
    }

    /// `socket/broadcast`: every client except this one.
    ///
    /// # Errors
    ///
    /// [`ClientError::Transport`] on write failure.
    pub async fn broadcast(&self, payload: Value) -> Result<(), ClientError> {
        self.carry_out(Command::SocketBroadcast, Recipient::RELAY, Some(payload))
            .await
    }

    /// `socket/sendall`: every client including this one.
    ///
    /// # Errors
    ///
    /// [`ClientError::Transport`] on write failure.
    pub async fn send_all(&self, payload: Value) -> Result<(), ClientError> {
        self.carry_out(Command::SocketSendAll, Recipient::RELAY, Some(payload))
            .await
    }

    /// `socket/nick`: sets this client's nickname on the relay.
    ///
    /// # Errors
    ///
    /// [`ClientError::Transport`] on write failure.
    pub async fn set_nick(&self, nick: &str) -> Result<(), ClientError> {
        self.carry_out(Command::SocketNick, Recipient::RELAY, Some(json!(nick)))
            .await
    }

    /// # Errors
    ///
    /// [`ClientError::Transport`] on write failure.
    pub async fn room_enter(&self, room: &str) -> Result<(), ClientError> {
        self.carry_out(Command::RoomEnter, Recipient::RELAY, Some(json!(room)))
            .await
    }

    /// # Errors
    ///
    /// [`ClientError::Transport`] on write failure.
    pub async fn room_exit(&self, room: &str) -> Result<(), ClientError> {
        self.carry_out(Command::RoomExit, Recipient::RELAY, Some(json!(room)))
            .await
    }

    /// # Errors
    ///
    /// [`ClientError::Transport`] on write failure.
    pub async fn room_exit_all(&self) -> Result<(), ClientError> {
        self.carry_out(Command::RoomExitAll, Recipient::RELAY, None).await
    }

    /// `room/send`: one message to every member of `room`.
    ///
    /// # Errors
    ///
    /// [`ClientError::Transport`] on write failure.
    pub async fn room_send(&self, room: &str, payload: Value) -> Result<(), ClientError> {
        self.carry_out(Command::RoomSend, Recipient::Room(room.to_string()), Some(payload))
            .await
    }

    /// `route`: asks the relay to deliver `{uri, body}` as a route message.
    ///
    /// # Errors
    ///
    /// [`ClientError::Transport`] on write failure.
    pub async fn route(&self, uri: &str, body: Option<Value>) -> Result<(), ClientError> {
        let mut payload = json!({ "uri": uri });
        if let Some(body) = body {
            payload["body"] = body;
        }
        self.carry_out(Command::Route, Recipient::RELAY, Some(payload))
            .await
    }

    /// Sends `text` as a TEXT frame without wrapping it in an envelope.
    ///
    /// # Errors
    ///
    /// [`ClientError::Protocol`] for text over 65 535 bytes,
    /// [`ClientError::Transport`] on write failure.
    pub async fn send_raw(&self, text: &str) -> Result<(), ClientError> {
        self.connection.send_text(text).await
    }

    // ── Control frames ────────────────────────────────────────────────────────

    /// Sends a PING every `interval`, `count` times (forever when `None`).
    /// The task stops early on [`shutdown`](Self::shutdown).
    pub fn ping(&self, interval: Duration, count: Option<u32>) -> JoinHandle<()> {
        let connection = self.connection.clone();
        let mut shutdown = connection.shutdown_signal();
        tokio::spawn(async move {
            let mut sent = 0u32;
            while count.map_or(true, |max| sent < max) {
                tokio::select! {
                    _ = time::sleep(interval) => {}
                    _ = shutdown.wait_for(|stopped| *stopped) => break,
                }
                if let Err(e) = connection.send_control(Opcode::Ping).await {
                    warn!("ping failed: {e}");
                }
                sent += 1;
            }
            debug!(sent, "ping task finished");
        })
    }

    /// Sends one PONG frame.
    ///
    /// # Errors
    ///
    /// [`ClientError::Transport`] on write failure.
    pub async fn pong(&self) -> Result<(), ClientError> {
        self.connection.send_control(Opcode::Pong).await
    }

    // ── Routing ───────────────────────────────────────────────────────────────

    /// Runs `router` for a `route` envelope, using `payload.uri` and
    /// `payload.body`.
    ///
    /// # Errors
    ///
    /// [`RouteError::MalformedRoute`] when the envelope is not a route message
    /// or has no string `uri`; otherwise whatever the handler returns.
    pub async fn dispatch_route<C: Send + 'static>(
        router: &Router<C>,
        envelope: &Envelope,
        context: C,
    ) -> Result<DispatchOutcome, RouteError> {
        if !envelope.is_route() {
            return Err(RouteError::MalformedRoute(format!(
                "expected cmd 'route', got '{}'",
                envelope.cmd
            )));
        }
        let payload = envelope.payload.as_ref();
        let uri = payload
            .and_then(|p| p.get("uri"))
            .and_then(Value::as_str)
            .ok_or_else(|| RouteError::MalformedRoute("payload has no string 'uri'".to_string()))?;
        let body = payload.and_then(|p| p.get("body")).cloned();
        router.dispatch(uri, body, context).await
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    async fn carry_out(&self, cmd: Command, to: Recipient, payload: Option<Value>) -> Result<(), ClientError> {
        let envelope = Envelope {
            id: self.ids.next_id(),
            from: self.socket_id(),
            to,
            cmd: cmd.as_str().to_string(),
            payload,
        };
        let text = encode_envelope(&envelope)?;
        debug!(%cmd, id = envelope.id, "sending envelope");
        self.connection.send_text(&text).await
    }
}

/// Turns network events into client events: decodes envelopes, lets the
/// correlator claim answers, and fans the rest out.  Ends when the
/// connection is dropped.
async fn pump_events(
    mut network_events: mpsc::Receiver<NetworkEvent>,
    correlator: Arc<QuestionCorrelator>,
    events: Arc<EventDistributor>,
) {
    while let Some(event) = network_events.recv().await {
        let client_event = match event {
            NetworkEvent::Connected {
                socket_id,
                subprotocol,
                ..
            } => ClientEvent::Connected {
                socket_id,
                subprotocol,
            },
            NetworkEvent::Text(text) => match decode_envelope(&text) {
                Ok(envelope) => {
                    if correlator.resolve(&envelope) {
                        continue;
                    }
                    if envelope.is_route() {
                        ClientEvent::Route(envelope)
                    } else {
                        ClientEvent::Message(envelope)
                    }
                }
                Err(e) => {
                    warn!("could not decode inbound message: {e}");
                    ClientEvent::MessageError {
                        raw: text,
                        error: e.to_string(),
                    }
                }
            },
            NetworkEvent::Undecodable(error) => ClientEvent::MessageError {
                raw: String::new(),
                error,
            },
            NetworkEvent::Ping => ClientEvent::Ping,
            NetworkEvent::Pong => ClientEvent::Pong,
            NetworkEvent::ClosedByServer => ClientEvent::ClosedByServer,
            NetworkEvent::Disconnected { reconnecting } => ClientEvent::Disconnected { reconnecting },
            NetworkEvent::TransportError(message) => ClientEvent::TransportError(message),
        };
        events.emit(client_event);
    }
    debug!("event pump finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use rws_core::RouteTransaction;
    use std::sync::Mutex;

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            url: "ws://127.0.0.1:1".to_string(),
            question_timeout_ms: 50,
            ..ConnectionConfig::default()
        }
    }

    fn route_envelope(payload: Value) -> Envelope {
        Envelope::new(1, 2, 0u64, Command::Route, Some(payload))
    }

    #[tokio::test]
    async fn test_invalid_url_is_rejected() {
        let cfg = ConnectionConfig {
            url: "http://example.com".to_string(),
            ..ConnectionConfig::default()
        };
        assert!(matches!(RwsClient::new(&cfg), Err(ClientError::Handshake(_))));
    }

    #[tokio::test]
    async fn test_question_while_disconnected_times_out_cleanly() {
        // Arrange
        let client = RwsClient::new(&config()).unwrap();

        // Act
        let result = client.question(Command::InfoSocketId).await;

        // Assert
        assert!(matches!(result, Err(ClientError::Timeout { ref cmd }) if cmd == "info/socket/id"));
        assert_eq!(client.pending_questions(), 0);
    }

    #[tokio::test]
    async fn test_sends_while_disconnected_are_dropped_without_error() {
        let client = RwsClient::new(&config()).unwrap();

        assert!(client.send_one(5, json!("hi")).await.is_ok());
        assert!(client.room_send("lobby", json!({"a": 1})).await.is_ok());
        assert!(client.route("/a/b", None).await.is_ok());
        assert!(client.pong().await.is_ok());
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_ping_task_with_count_finishes() {
        let client = RwsClient::new(&config()).unwrap();

        let task = client.ping(Duration::from_millis(1), Some(3));

        assert!(task.await.is_ok());
    }

    #[tokio::test]
    async fn test_unbounded_ping_task_stops_on_shutdown() {
        let client = RwsClient::new(&config()).unwrap();
        let task = client.ping(Duration::from_secs(60), None);

        client.shutdown().await;

        assert!(time::timeout(Duration::from_secs(1), task).await.is_ok());
    }

    #[tokio::test]
    async fn test_dispatch_route_extracts_uri_and_body() {
        // Arrange
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let mut router: Router<()> = Router::new();
        router
            .register("/returned/back/:n", move |trx: RouteTransaction<()>| {
                let sink = Arc::clone(&sink);
                async move {
                    *sink.lock().unwrap() = Some((trx.params, trx.body));
                    Ok::<(), RouteError>(())
                }
            })
            .unwrap();
        let env = route_envelope(json!({"uri": "/returned/back/42", "body": {"x": 1}}));

        // Act
        let outcome = RwsClient::dispatch_route(&router, &env, ()).await.unwrap();

        // Assert
        assert_eq!(outcome, DispatchOutcome::Matched("/returned/back/:n".to_string()));
        let (params, body) = seen.lock().unwrap().clone().unwrap();
        assert_eq!(params.get("n").map(String::as_str), Some("42"));
        assert_eq!(body, Some(json!({"x": 1})));
    }

    #[tokio::test]
    async fn test_dispatch_route_without_uri_is_malformed() {
        let router: Router<()> = Router::new();
        let env = route_envelope(json!({"body": 1}));

        let result = RwsClient::dispatch_route(&router, &env, ()).await;

        assert!(matches!(result, Err(RouteError::MalformedRoute(_))));
    }

    #[tokio::test]
    async fn test_event_pump_routes_answers_messages_and_errors() {
        // Arrange
        let (tx, rx) = mpsc::channel(16);
        let correlator = Arc::new(QuestionCorrelator::new());
        let events = Arc::new(EventDistributor::new());
        let mut sub = events.subscribe();
        let question = correlator.register("info/socket/id");
        let pump = tokio::spawn(pump_events(rx, Arc::clone(&correlator), Arc::clone(&events)));

        // Act
        tx.send(NetworkEvent::Text(r#"{"cmd":"info/socket/id","payload":9}"#.to_string()))
            .await
            .unwrap();
        tx.send(NetworkEvent::Text(r#"{"cmd":"socket/sendone","payload":"hi"}"#.to_string()))
            .await
            .unwrap();
        tx.send(NetworkEvent::Text(r#"{"cmd":"route","payload":{"uri":"/x"}}"#.to_string()))
            .await
            .unwrap();
        tx.send(NetworkEvent::Text("not json".to_string())).await.unwrap();
        drop(tx);
        pump.await.unwrap();

        // Assert – the answer went to the question, not to subscribers
        let answer = correlator.wait(question, Duration::from_secs(1)).await.unwrap();
        assert_eq!(answer.payload, Some(json!(9)));
        assert!(matches!(sub.try_recv().unwrap(), ClientEvent::Message(ref e) if e.cmd == "socket/sendone"));
        assert!(matches!(sub.try_recv().unwrap(), ClientEvent::Route(_)));
        assert!(matches!(sub.try_recv().unwrap(), ClientEvent::MessageError { ref raw, .. } if raw == "not json"));
        assert!(sub.try_recv().is_err());
    }
}
