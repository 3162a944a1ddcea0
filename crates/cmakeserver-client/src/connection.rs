//! Connection lifecycle and inbound dispatch.
//!
//! A [`Connection`] owns one transport. Opening it splits the transport and
//! spawns two tasks:
//!
//! - the read loop, which feeds the stream framer and dispatches every
//!   decoded message in arrival order;
//! - the writer, which drains a queue of encoded frames.
//!
//! All pending-table access goes through one mutex. `issue` registers the
//! pending entry and queues the frame under that lock, so a reply can never
//! be dispatched before its entry exists.
//!
//! When the transport goes away, for whatever reason, `connection_lost`
//! runs once: it sets the closing flag, fails every pending request, then
//! publishes `Closing` followed by `Disconnected`.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use cmakeserver_protocol::{Message, ProtocolVersion, Request, StreamFramer, encode_frame};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::callbacks::{Callback, CallbackRunner, RequestCallbacks};
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::pending::{PendingTable, ReplyReceiver};
use crate::transport::Transport;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport, or the transport has gone away.
    Disconnected,
    /// Transport is up, the handshake has not completed yet.
    AwaitingHandshake,
    /// Handshake done; the server accepts requests.
    Connected,
    /// Teardown has started.
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::AwaitingHandshake => "awaiting handshake",
            Self::Connected => "connected",
            Self::Closing => "closing",
        };
        f.write_str(label)
    }
}

/// Connection-wide hook for `signal` messages.
pub(crate) type SignalHook = Arc<RwLock<Option<Callback>>>;

struct Inner {
    table: PendingTable,
    outbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
    /// Cookie of the handshake in flight, answered inline by dispatch.
    handshake_cookie: Option<String>,
    /// Set once a handshake reply arrived; survives a later disconnect.
    handshake_completed: bool,
    handshake_error: Option<String>,
}

impl Inner {
    fn take_handshake(&mut self, cookie: &str) -> bool {
        if self.handshake_cookie.as_deref() == Some(cookie) {
            self.handshake_cookie = None;
            true
        } else {
            false
        }
    }
}

struct Shared {
    inner: Mutex<Inner>,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Sender<bool>,
    config: ClientConfig,
    signal_hook: SignalHook,
    callbacks: CallbackRunner,
}

/// One live transport plus its pending requests.
pub(crate) struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Takes ownership of the transport and starts the read and write tasks.
    pub(crate) fn open<T: Transport>(
        transport: T,
        config: ClientConfig,
        signal_hook: SignalHook,
    ) -> ClientResult<Self> {
        let callbacks = CallbackRunner::spawn()?;
        let framer = StreamFramer::with_options(config.framer_options());
        let (reader, writer) = tokio::io::split(transport);
        let (outbound, queue) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::AwaitingHandshake);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                table: PendingTable::new(),
                outbound: Some(outbound),
                handshake_cookie: None,
                handshake_completed: false,
                handshake_error: None,
            }),
            state,
            shutdown,
            config,
            signal_hook,
            callbacks,
        });

        tokio::spawn(write_loop(writer, queue, Arc::downgrade(&shared)));
        tokio::spawn(read_loop(reader, framer, shutdown_rx, Arc::clone(&shared)));
        debug!("transport established, awaiting hello");

        Ok(Self { shared })
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub(crate) fn pending(&self) -> usize {
        self.shared.lock().table.len()
    }

    /// Registers and transmits a request.
    pub(crate) fn issue(
        &self,
        request: Request,
        callbacks: RequestCallbacks,
    ) -> ClientResult<PendingReply> {
        self.shared.issue(request, callbacks)
    }

    /// Waits until the handshake completes or the connection goes away.
    ///
    /// A handshake that completed before the transport closed still counts
    /// as success.
    pub(crate) async fn wait_connected(&self) -> ClientResult<()> {
        let mut state = self.shared.state.subscribe();
        let reached = match state
            .wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Disconnected))
            .await
        {
            Ok(reached) => *reached,
            Err(_) => ConnectionState::Disconnected,
        };

        if reached == ConnectionState::Connected {
            return Ok(());
        }
        let inner = self.shared.lock();
        match &inner.handshake_error {
            Some(message) => Err(ClientError::Handshake {
                message: message.clone(),
            }),
            None if inner.handshake_completed => Ok(()),
            None => Err(ClientError::connection_lost(
                "connection closed before the handshake completed",
            )),
        }
    }

    pub(crate) async fn wait_disconnected(&self) {
        let mut state = self.shared.state.subscribe();
        let _ = state
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await;
    }

    /// Starts teardown and waits for it to finish.
    pub(crate) async fn close(&self) {
        self.shared.begin_close();
        self.wait_disconnected().await;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.shutdown.send_replace(true);
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn issue(
        self: &Arc<Self>,
        request: Request,
        callbacks: RequestCallbacks,
    ) -> ClientResult<PendingReply> {
        let kind = request.kind.clone();
        let mut inner = self.lock();
        let cookie = inner.table.allocate_cookie();

        if inner.table.is_closing() {
            debug!(cookie = %cookie, kind = %kind, "refusing request, connection is closing");
            return Err(ClientError::Closing);
        }
        let Some(outbound) = inner.outbound.clone() else {
            return Err(ClientError::Closing);
        };

        let frame = encode_frame(&request.with_cookie(cookie.as_str()))?;
        let reply = inner.table.register(cookie.clone(), callbacks);
        if outbound.send(frame).is_err() {
            inner.table.cancel(&cookie);
            return Err(ClientError::connection_lost("writer task stopped"));
        }
        drop(inner);

        trace!(cookie = %cookie, kind = %kind, "request queued");
        Ok(PendingReply {
            cookie,
            reply,
            done: false,
            shared: Arc::downgrade(self),
        })
    }

    fn dispatch(self: &Arc<Self>, value: Value) {
        let message = match Message::from_value(value) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "dropping malformed message");
                return;
            }
        };

        match message {
            Message::Hello {
                supported_protocol_versions,
                ..
            } => self.on_hello(&supported_protocol_versions),
            Message::Signal { name, body } => {
                let hook = self
                    .signal_hook
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                match hook {
                    Some(callback) => self.callbacks.submit("signal", callback, body),
                    None => debug!(name = ?name, "signal received without a handler"),
                }
            }
            Message::Progress { cookie, body } => {
                let callback = self
                    .lock()
                    .table
                    .callbacks_for(&cookie)
                    .and_then(|c| c.progress().cloned());
                self.notify("progress", &cookie, callback, body);
            }
            Message::Message { cookie, body } => {
                let callback = self
                    .lock()
                    .table
                    .callbacks_for(&cookie)
                    .and_then(|c| c.message().cloned());
                self.notify("message", &cookie, callback, body);
            }
            Message::Reply { cookie, body } => {
                let mut inner = self.lock();
                if inner.take_handshake(&cookie) {
                    inner.handshake_completed = true;
                    // Published under the lock: begin_close sets closing first.
                    let connected = !inner.table.is_closing()
                        && self.state.send_if_modified(|state| {
                            if *state == ConnectionState::AwaitingHandshake {
                                *state = ConnectionState::Connected;
                                true
                            } else {
                                false
                            }
                        });
                    drop(inner);
                    if connected {
                        info!(cookie = %cookie, "handshake complete");
                    }
                    return;
                }
                let payload = cmakeserver_protocol::strip_envelope(body);
                if inner.table.resolve(&cookie, payload) {
                    trace!(cookie = %cookie, "request resolved");
                } else {
                    debug!(cookie = %cookie, "reply for unknown cookie");
                }
            }
            Message::Error {
                cookie,
                error_message,
                ..
            } => {
                let mut inner = self.lock();
                if inner.take_handshake(&cookie) {
                    drop(inner);
                    self.fail_handshake(error_message);
                    return;
                }
                let error = ClientError::server(cookie.as_str(), error_message);
                if inner.table.reject(&cookie, error) {
                    debug!(cookie = %cookie, "request rejected by server");
                } else {
                    debug!(cookie = %cookie, "error for unknown cookie");
                }
            }
            Message::Unknown { kind, .. } => {
                warn!(kind = %kind, "ignoring message of unknown type");
            }
        }
    }

    fn notify(&self, kind: &'static str, cookie: &str, callback: Option<Callback>, body: Value) {
        match callback {
            Some(callback) => self.callbacks.submit(kind, callback, body),
            None if self.lock().table.contains(cookie) => {
                trace!(cookie, kind, "no callback registered");
            }
            None => debug!(cookie, kind, "notification for unknown cookie"),
        }
    }

    fn on_hello(self: &Arc<Self>, supported: &[ProtocolVersion]) {
        if *self.state.borrow() == ConnectionState::Closing {
            debug!("ignoring hello during teardown");
            return;
        }
        {
            let mut inner = self.lock();
            inner.table.set_closing(false);
            inner.handshake_cookie = None;
            inner.handshake_error = None;
        }
        self.state.send_replace(ConnectionState::AwaitingHandshake);

        let Some(version) = ProtocolVersion::select(supported, self.config.protocol_major) else {
            self.fail_handshake("server advertised no protocol versions".to_string());
            return;
        };
        debug!(version = %version, "hello received, sending handshake");

        let request = self.config.handshake(version).into_request();
        if let Err(e) = self.send_handshake(request) {
            self.fail_handshake(e.to_string());
        }
    }

    /// Queues the handshake without a pending entry; dispatch answers it.
    fn send_handshake(&self, request: Request) -> ClientResult<()> {
        let mut inner = self.lock();
        let cookie = inner.table.allocate_cookie();
        let outbound = inner.outbound.clone().ok_or(ClientError::Closing)?;
        let frame = encode_frame(&request.with_cookie(cookie.as_str()))?;
        inner.handshake_cookie = Some(cookie.clone());
        if outbound.send(frame).is_err() {
            inner.handshake_cookie = None;
            return Err(ClientError::connection_lost("writer task stopped"));
        }
        trace!(cookie = %cookie, "handshake queued");
        Ok(())
    }

    fn fail_handshake(&self, message: String) {
        warn!(error = %message, "handshake failed");
        self.lock().handshake_error = Some(message);
        self.begin_close();
    }

    fn begin_close(&self) {
        self.lock().table.set_closing(true);
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                false
            } else {
                *state = ConnectionState::Closing;
                true
            }
        });
        self.shutdown.send_replace(true);
    }

    /// Terminal teardown shared by local and remote closes.
    fn connection_lost(&self, reason: &str) {
        let failed = {
            let mut inner = self.lock();
            inner.table.set_closing(true);
            let failed = inner.table.fail_all(reason);
            inner.handshake_cookie = None;
            inner.outbound = None;
            failed
        };
        self.state.send_replace(ConnectionState::Closing);
        self.state.send_replace(ConnectionState::Disconnected);
        info!(reason, failed, "connection lost");
    }
}

async fn read_loop<T: Transport>(
    mut reader: ReadHalf<T>,
    mut framer: StreamFramer,
    mut shutdown: watch::Receiver<bool>,
    shared: Arc<Shared>,
) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let reason = loop {
        let read = tokio::select! {
            read = reader.read(&mut buf) => read,
            _ = shutdown.wait_for(|closed| *closed) => break "connection closed locally".to_string(),
        };
        match read {
            Ok(0) => break "connection closed by server".to_string(),
            Ok(n) => {
                trace!(bytes = n, "RX");
                for value in framer.feed(&buf[..n]) {
                    shared.dispatch(value);
                }
            }
            Err(e) => break format!("read failed: {e}"),
        }
    };
    shared.connection_lost(&reason);
}

async fn write_loop<T: Transport>(
    mut writer: WriteHalf<T>,
    mut queue: mpsc::UnboundedReceiver<Vec<u8>>,
    shared: Weak<Shared>,
) {
    while let Some(frame) = queue.recv().await {
        trace!(bytes = frame.len(), "TX");
        let written = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            warn!(error = %e, "write failed");
            if let Some(shared) = shared.upgrade() {
                shared.begin_close();
            }
            return;
        }
    }
    let _ = writer.shutdown().await;
    debug!("writer stopped");
}

/// Handle to an issued request.
///
/// Dropping the handle before the request completes removes its pending
/// entry; a reply arriving later is ignored.
#[must_use = "a request is cancelled when its PendingReply is dropped"]
pub struct PendingReply {
    cookie: String,
    reply: ReplyReceiver,
    done: bool,
    shared: Weak<Shared>,
}

impl PendingReply {
    /// The cookie assigned to the request.
    pub fn cookie(&self) -> &str {
        &self.cookie
    }

    /// Waits for the reply payload.
    pub async fn wait(mut self) -> ClientResult<Value> {
        let result = match (&mut self.reply).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::connection_lost("connection dropped")),
        };
        self.done = true;
        result
    }

    /// Waits for the reply, giving up after `after`.
    ///
    /// On timeout the request is removed from the pending table.
    pub async fn wait_timeout(self, after: Duration) -> ClientResult<Value> {
        let operation = format!("request {}", self.cookie);
        match tokio::time::timeout(after, self.wait()).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::timeout(operation, after)),
        }
    }
}

impl fmt::Debug for PendingReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingReply")
            .field("cookie", &self.cookie)
            .field("done", &self.done)
            .finish()
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Some(shared) = self.shared.upgrade() {
            if shared.lock().table.cancel(&self.cookie) {
                debug!(cookie = %self.cookie, "request cancelled");
            }
        }
    }
}
