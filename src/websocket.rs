//! WebSocket transport to an sctl daemon.
//!
//! [`DaemonConnection`] holds one WebSocket to `GET /api/ws?token=<api_key>`.
//! A background I/O task owns the socket: it serializes outgoing JSON
//! messages, answers requests by their echoed `request_id`, and routes
//! per-session output to the [`ShellSession`] that owns it.
//!
//! ## Message mapping
//!
//! | Relay operation      | Sent                 | Answer                                 |
//! |----------------------|----------------------|----------------------------------------|
//! | `spawn`              | `session.start`      | `session.started` / `error`            |
//! | `open` (foreign id)  | `session.attach`     | `session.attached` / `error`           |
//! | `write`              | `session.stdin`      | (none, `error` on failure)             |
//! | `resize`             | `session.resize`     | `session.resize.ack`                   |
//! | `close` / drop       | `session.kill`       | `session.closed`                       |
//!
//! Output arrives as `session.stdout` / `session.stderr` with a per-session
//! `seq`; replays after an attach are de-duplicated on it. The daemon reports
//! a process exit as a `session.system` entry ("Process exited with code N"),
//! which ends the session. So do `session.closed`, `session.destroyed`, a
//! fatal session `error`, and loss of the socket. There is no reconnect: a
//! dropped socket ends every session on it.
//!
//! A session that ends before `open` claims it keeps its route, so the
//! output and close reason it collected are still delivered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::ShellError;
use crate::session::{
    CloseReason, SessionCommand, SessionEvent, SessionToken, ShellSession, WindowSize,
};
use crate::transport::Transport;

/// How long a request waits for the daemon's answer.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Persistent WebSocket connection to a sctl daemon.
pub struct DaemonConnection {
    hostname: String,
    sender: mpsc::Sender<Value>,
    shared: Arc<Shared>,
    connected: Arc<AtomicBool>,
}

/// State shared between the connection handle, the I/O task and the
/// per-session forwarders.
#[derive(Default)]
struct Shared {
    routes: Mutex<HashMap<String, SessionRoute>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Value>>>,
}

impl Shared {
    /// End every session and fail every outstanding request.
    async fn fail_all(&self) {
        self.routes.lock().await.retain(|id, route| {
            debug!("session {id}: transport lost");
            !route.close(CloseReason::TransportLost)
        });
        self.pending.lock().await.clear();
    }

    async fn close_route(&self, session_id: &str, reason: CloseReason) {
        close_in(&mut *self.routes.lock().await, session_id, reason);
    }
}

/// Close one route in an already locked route table.
fn close_in(routes: &mut HashMap<String, SessionRoute>, session_id: &str, reason: CloseReason) {
    let Some(route) = routes.get_mut(session_id) else {
        return;
    };
    if route.closed {
        return;
    }
    info!("session {session_id}: {reason}");
    if route.close(reason) {
        routes.remove(session_id);
    }
}

/// Delivery state for one session on this connection.
struct SessionRoute {
    events: mpsc::UnboundedSender<SessionEvent>,
    /// The session side, waiting for `open` to claim it.
    parked: Option<(ShellSession, mpsc::UnboundedReceiver<SessionCommand>)>,
    last_seq: u64,
    closed: bool,
}

impl SessionRoute {
    /// A route for a freshly started session, parked until `open` claims it.
    fn parked(token: SessionToken) -> Self {
        let (session, handle) = ShellSession::pair(token);
        Self {
            events: handle.events,
            parked: Some((session, handle.commands)),
            last_seq: 0,
            closed: false,
        }
    }

    fn live(events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            events,
            parked: None,
            last_seq: 0,
            closed: false,
        }
    }

    /// Record a sequence number. Returns `false` for a replayed duplicate.
    fn observe(&mut self, session_id: &str, seq: u64) -> bool {
        if seq == 0 {
            return true;
        }
        if seq <= self.last_seq {
            return false;
        }
        if self.last_seq > 0 && seq > self.last_seq + 1 {
            warn!(
                "session {session_id}: {} output entries dropped by the daemon buffer",
                seq - self.last_seq - 1
            );
        }
        self.last_seq = seq;
        true
    }

    fn push_output(&mut self, session_id: &str, seq: u64, data: String) {
        if self.closed {
            return;
        }
        if !self.observe(session_id, seq) {
            debug!("session {session_id}: skipping replayed entry {seq}");
            return;
        }
        if !data.is_empty() {
            let _ = self.events.send(SessionEvent::Data(data.into_bytes()));
        }
    }

    /// Deliver `Closed` once. Returns whether the route can be forgotten:
    /// a parked route has to stay until `open` claims it.
    fn close(&mut self, reason: CloseReason) -> bool {
        if !self.closed {
            self.closed = true;
            let _ = self.events.send(SessionEvent::Closed(reason));
        }
        self.parked.is_none()
    }
}

impl DaemonConnection {
    /// Connect to a sctl daemon's WebSocket endpoint.
    ///
    /// `hostname` is the name the daemon is known by locally (device name);
    /// `url` is its HTTP base URL.
    pub async fn connect(hostname: &str, url: &str, api_key: &str) -> Result<Self, ShellError> {
        let ws_url = build_ws_url(url, api_key)?;
        let mut request = ws_url
            .as_str()
            .into_client_request()
            .map_err(|e| ShellError::Connection(format!("invalid WebSocket URL: {e}")))?;
        request
            .headers_mut()
            .insert("x-sctl-client", HeaderValue::from_static("shell"));

        let (ws_stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| ShellError::Connection(format!("cannot reach {hostname}: {e}")))?;
        info!("connected to {hostname}");

        Ok(Self::from_stream(hostname, ws_stream))
    }

    fn from_stream<S>(hostname: &str, ws_stream: tokio_tungstenite::WebSocketStream<S>) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let shared = Arc::new(Shared::default());
        let connected = Arc::new(AtomicBool::new(true));
        let (out_tx, out_rx) = mpsc::channel::<Value>(256);

        tokio::spawn(ws_io_loop(
            ws_stream,
            out_rx,
            Arc::clone(&shared),
            Arc::clone(&connected),
        ));

        Self {
            hostname: hostname.to_string(),
            sender: out_tx,
            shared,
            connected,
        }
    }

    /// Check whether the WebSocket is still up.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, message: Value) -> Result<(), ShellError> {
        if !self.is_connected() {
            return Err(ShellError::Connection("connection to daemon closed".into()));
        }
        self.sender
            .send(message)
            .await
            .map_err(|_| ShellError::Connection("connection to daemon closed".into()))
    }

    /// Send a message tagged with a fresh `request_id` and wait for the
    /// daemon's answer to it. `error` answers become [`ShellError::Daemon`].
    async fn request(&self, mut message: Value) -> Result<Value, ShellError> {
        let kind = message["type"].as_str().unwrap_or("request").to_string();
        let request_id = uuid::Uuid::new_v4().to_string();
        message["request_id"] = json!(request_id);

        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .await
            .insert(request_id.clone(), tx);

        if let Err(e) = self.send(message).await {
            self.shared.pending.lock().await.remove(&request_id);
            return Err(e);
        }

        let reply = match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => {
                return Err(ShellError::Connection(format!(
                    "connection lost while waiting for {kind} response"
                )))
            }
            Err(_) => {
                self.shared.pending.lock().await.remove(&request_id);
                return Err(ShellError::Connection(format!(
                    "timeout waiting for {kind} response"
                )));
            }
        };

        if reply["type"].as_str() == Some("error") {
            return Err(ShellError::from_daemon_message(&reply));
        }
        Ok(reply)
    }

    /// Attach to a session this connection did not spawn.
    async fn attach(
        &self,
        token: &SessionToken,
    ) -> Result<(ShellSession, mpsc::UnboundedReceiver<SessionCommand>), ShellError> {
        let (session, handle) = ShellSession::pair(token.clone());
        self.shared
            .routes
            .lock()
            .await
            .insert(token.as_str().to_string(), SessionRoute::live(handle.events));

        let reply = self
            .request(json!({
                "type": "session.attach",
                "session_id": token.as_str(),
                "since": 0,
            }))
            .await;

        match reply {
            Ok(_) => Ok((session, handle.commands)),
            Err(e) => {
                self.shared.routes.lock().await.remove(token.as_str());
                Err(ShellError::Connection(format!(
                    "cannot attach to session {token}: {e}"
                )))
            }
        }
    }
}

impl Transport for DaemonConnection {
    fn hostname(&self) -> &str {
        &self.hostname
    }

    async fn spawn(
        &self,
        command: Option<&str>,
        size: Option<WindowSize>,
    ) -> Result<SessionToken, ShellError> {
        let mut msg = json!({
            "type": "session.start",
            "pty": true,
            "persistent": false,
        });
        if let Some(c) = command {
            msg["shell"] = json!(c);
        }
        if let Some(s) = size {
            msg["rows"] = json!(s.rows);
            msg["cols"] = json!(s.cols);
        }

        let reply = self.request(msg).await?;
        let session_id = reply["session_id"]
            .as_str()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ShellError::Protocol("session.started without session_id".into()))?;
        debug!(
            "spawned session {session_id} on {} (pid {})",
            self.hostname,
            reply["pid"].as_u64().unwrap_or(0)
        );
        Ok(SessionToken::new(session_id))
    }

    async fn open(&self, token: &SessionToken) -> Result<ShellSession, ShellError> {
        let parked = {
            let mut routes = self.shared.routes.lock().await;
            let claimed = match routes.get_mut(token.as_str()) {
                Some(route) => {
                    let parked = route.parked.take().ok_or_else(|| {
                        ShellError::Connection(format!("session {token} is already attached"))
                    })?;
                    Some((parked, route.closed))
                }
                None => None,
            };
            claimed.map(|(parked, closed)| {
                if closed {
                    routes.remove(token.as_str());
                }
                parked
            })
        };

        let (session, commands) = match parked {
            Some(parked) => parked,
            None => self.attach(token).await?,
        };

        tokio::spawn(forward_commands(
            token.clone(),
            commands,
            self.sender.clone(),
            Arc::clone(&self.shared),
        ));
        debug!("session {token} opened on {}", self.hostname);
        Ok(session)
    }
}

/// Forward a session's commands onto the socket until the session is dropped.
///
/// When the relay drops its [`ShellSession`] while the daemon still runs the
/// process, the process is killed so it does not outlive the relay.
async fn forward_commands(
    token: SessionToken,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    out: mpsc::Sender<Value>,
    shared: Arc<Shared>,
) {
    let session_id = token.as_str();
    let mut encoder = StdinEncoder::default();
    let mut kill_sent = false;

    while let Some(command) = commands.recv().await {
        let msg = match command {
            SessionCommand::Input(bytes) => {
                let data = encoder.encode(&bytes);
                if data.is_empty() {
                    continue;
                }
                json!({
                    "type": "session.stdin",
                    "session_id": session_id,
                    "data": data,
                })
            }
            SessionCommand::Resize(size) => json!({
                "type": "session.resize",
                "session_id": session_id,
                "rows": size.rows,
                "cols": size.cols,
            }),
            SessionCommand::Close => {
                kill_sent = true;
                json!({ "type": "session.kill", "session_id": session_id })
            }
        };
        if out.send(msg).await.is_err() {
            return;
        }
    }

    let still_running = shared.routes.lock().await.remove(session_id).is_some();
    if still_running && !kill_sent {
        debug!("session {session_id} released while running, killing it");
        let _ = out
            .send(json!({ "type": "session.kill", "session_id": session_id }))
            .await;
    }
}

/// Build the WebSocket URL from the HTTP base URL.
fn build_ws_url(base_url: &str, api_key: &str) -> Result<String, ShellError> {
    let base = base_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_string()
    } else {
        return Err(ShellError::Config(format!("Invalid URL scheme: {base}")));
    };
    Ok(format!("{ws_base}/api/ws?token={api_key}"))
}

/// Parse a session output message into `(session_id, seq, data)`.
fn parse_output_entry(msg: &Value) -> Option<(&str, u64, String)> {
    match msg["type"].as_str()? {
        "session.stdout" | "session.stderr" => {}
        _ => return None,
    }
    Some((
        msg["session_id"].as_str()?,
        msg["seq"].as_u64().unwrap_or(0),
        msg["data"].as_str().unwrap_or("").to_string(),
    ))
}

/// The close reason a daemon `system` entry stands for, if it ends the
/// session: the exit watcher reports "Process exited with code N" or
/// "Process wait error: ...".
fn system_close_reason(text: &str) -> Option<CloseReason> {
    if let Some(code) = text.strip_prefix("Process exited with code ") {
        return Some(CloseReason::Exited {
            code: code.trim().parse().ok(),
        });
    }
    text.starts_with("Process wait error:")
        .then(|| CloseReason::Error {
            message: text.to_string(),
        })
}

/// Errors after which the daemon no longer serves the session.
fn is_fatal_session_error(code: &str) -> bool {
    matches!(code, "SESSION_NOT_FOUND" | "SESSION_ERROR")
}

type WsSink<S> = futures_util::stream::SplitSink<tokio_tungstenite::WebSocketStream<S>, Message>;

async fn send_json<S>(sink: &mut WsSink<S>, value: &Value) -> Result<(), ShellError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let text = serde_json::to_string(value).unwrap_or_default();
    sink.send(Message::Text(text))
        .await
        .map_err(|e| ShellError::Connection(format!("WebSocket send failed: {e}")))
}

/// Main I/O loop: reads from the socket, dispatches to sessions and pending
/// requests, and writes outgoing messages. Ends every session on exit.
async fn ws_io_loop<S>(
    ws_stream: tokio_tungstenite::WebSocketStream<S>,
    mut out_rx: mpsc::Receiver<Value>,
    shared: Arc<Shared>,
    connected: Arc<AtomicBool>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut ws_sink, mut ws_reader) = ws_stream.split();

    loop {
        tokio::select! {
            msg = ws_reader.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let parsed = match serde_json::from_str::<Value>(&text) {
                            Ok(v) => v,
                            Err(e) => {
                                warn!("ignoring malformed message from daemon: {e}");
                                continue;
                            }
                        };
                        if let Some(reply) = dispatch_message(&parsed, &shared).await {
                            if let Err(e) = send_json(&mut ws_sink, &reply).await {
                                warn!("{e}");
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("daemon closed the WebSocket");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error: {e}");
                        break;
                    }
                    Some(Ok(_)) => {} // Binary/Ping/Pong
                }
            }
            msg = out_rx.recv() => {
                match msg {
                    Some(value) => {
                        if let Err(e) = send_json(&mut ws_sink, &value).await {
                            warn!("{e}");
                            break;
                        }
                    }
                    None => {
                        // Every handle dropped, shutting down
                        let _ = ws_sink.close().await;
                        break;
                    }
                }
            }
        }
    }

    connected.store(false, Ordering::SeqCst);
    shared.fail_all().await;
}

/// Apply an incoming message to the session routes, then hand it to the
/// request waiting for it (if any). Returns a message to send back.
async fn dispatch_message(msg: &Value, shared: &Shared) -> Option<Value> {
    let msg_type = msg["type"].as_str().unwrap_or("");
    let waiter = match msg["request_id"].as_str() {
        Some(rid) => shared.pending.lock().await.remove(rid),
        None => None,
    };
    let mut reply = None;

    match msg_type {
        "session.stdout" | "session.stderr" => {
            if let Some((session_id, seq, data)) = parse_output_entry(msg) {
                if let Some(route) = shared.routes.lock().await.get_mut(session_id) {
                    route.push_output(session_id, seq, data);
                }
            }
        }
        "session.system" => {
            let session_id = msg["session_id"].as_str().unwrap_or("");
            let data = msg["data"].as_str().unwrap_or("");
            debug!("session {session_id}: {data}");

            let mut routes = shared.routes.lock().await;
            let fresh = routes
                .get_mut(session_id)
                .is_some_and(|route| route.observe(session_id, msg["seq"].as_u64().unwrap_or(0)));
            if let Some(reason) = system_close_reason(data).filter(|_| fresh) {
                close_in(&mut routes, session_id, reason);
            }
        }
        "session.started" => {
            match msg["session_id"].as_str().filter(|id| !id.is_empty()) {
                Some(session_id) if waiter.is_some() => {
                    shared.routes.lock().await.insert(
                        session_id.to_string(),
                        SessionRoute::parked(SessionToken::new(session_id)),
                    );
                }
                Some(session_id) => {
                    warn!("session {session_id} started without a waiting request, killing it");
                    reply = Some(json!({ "type": "session.kill", "session_id": session_id }));
                }
                None => warn!("daemon started a session without an id"),
            }
        }
        "session.attached" => {
            let session_id = msg["session_id"].as_str().unwrap_or("");
            let mut routes = shared.routes.lock().await;
            let mut ended = None;
            if let Some(route) = routes.get_mut(session_id) {
                if let Some(dropped) = msg["dropped"].as_u64().filter(|d| *d > 0) {
                    warn!("session {session_id}: {dropped} entries dropped before attach");
                }
                for entry in msg["entries"].as_array().into_iter().flatten() {
                    if let Some((_, seq, data)) = parse_output_entry(entry) {
                        route.push_output(session_id, seq, data);
                    } else if route.observe(session_id, entry["seq"].as_u64().unwrap_or(0))
                        && entry["type"].as_str() == Some("session.system")
                    {
                        ended = ended.or(system_close_reason(entry["data"].as_str().unwrap_or("")));
                    }
                }
            }
            if let Some(reason) = ended {
                close_in(&mut routes, session_id, reason);
            }
        }
        "session.exited" => {
            let session_id = msg["session_id"].as_str().unwrap_or("");
            let code = msg["exit_code"].as_i64().map(|c| c as i32);
            shared
                .close_route(session_id, CloseReason::Exited { code })
                .await;
        }
        "session.closed" | "session.destroyed" => {
            let session_id = msg["session_id"].as_str().unwrap_or("");
            let reason = msg["reason"].as_str().unwrap_or("closed").to_string();
            shared
                .close_route(session_id, CloseReason::Closed { reason })
                .await;
        }
        "error" => {
            let code = msg["code"].as_str().unwrap_or("");
            let message = msg["message"].as_str().unwrap_or("unknown").to_string();
            warn!("daemon error {code}: {message}");
            if let Some(session_id) = msg["session_id"].as_str() {
                if is_fatal_session_error(code) {
                    shared
                        .close_route(session_id, CloseReason::Error { message })
                        .await;
                }
            }
        }
        _ => {} // pong, acks, broadcasts for other sessions
    }

    if let Some(waiter) = waiter {
        let _ = waiter.send(msg.clone());
    }
    reply
}

/// Turns keystroke bytes into the UTF-8 strings `session.stdin` carries.
///
/// A multi-byte character split across reads is held back until its last
/// byte arrives. Bytes that can never form valid UTF-8 become U+FFFD.
#[derive(Default)]
struct StdinEncoder {
    pending: Vec<u8>,
}

impl StdinEncoder {
    fn encode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        let mut rest: &[u8] = &self.pending;

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    // `valid_up_to` marks the end of a valid prefix.
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        self.pending = rest.to_vec();
        out
    }
}
