//! High-level client for a CMake server.

#[cfg(unix)]
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cmakeserver_protocol::Request;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::callbacks::RequestCallbacks;
use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionState, PendingReply, SignalHook};
use crate::error::{ClientError, ClientResult};
use crate::transport::Transport;

/// Client for one CMake server session at a time.
///
/// Methods take `&self`, so one client can be shared (e.g. in an `Arc`)
/// between tasks issuing requests concurrently.
pub struct CmakeClient {
    config: ClientConfig,
    signal_hook: SignalHook,
    connection: Mutex<Option<Arc<Connection>>>,
}

impl CmakeClient {
    /// Creates a disconnected client.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            signal_hook: SignalHook::default(),
            connection: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Installs the handler for `signal` messages, replacing any previous one.
    ///
    /// The handler receives the whole signal object and runs off the read
    /// loop; it stays installed across reconnects.
    pub fn set_signal_handler<F>(&self, handler: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        *self
            .signal_hook
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    pub fn clear_signal_handler(&self) {
        *self
            .signal_hook
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Takes over `transport` and waits for the handshake to complete.
    ///
    /// # Errors
    ///
    /// `AlreadyConnected` if a previous connection is still live,
    /// `Handshake` if the server rejects the handshake, `Timeout` after
    /// [`ClientConfig::connect_timeout`], `ConnectionLost` if the transport
    /// closes first.
    pub async fn connect<T: Transport>(&self, transport: T) -> ClientResult<()> {
        self.config.validate()?;

        let connection = {
            let mut slot = self.slot();
            if let Some(existing) = slot.as_ref() {
                if existing.state() != ConnectionState::Disconnected {
                    return Err(ClientError::AlreadyConnected);
                }
            }
            let connection = Arc::new(Connection::open(
                transport,
                self.config.clone(),
                Arc::clone(&self.signal_hook),
            )?);
            *slot = Some(Arc::clone(&connection));
            connection
        };

        let timeout = self.config.connect_timeout();
        match tokio::time::timeout(timeout, connection.wait_connected()).await {
            Ok(Ok(())) => {
                info!(
                    source = %self.config.source_directory.display(),
                    build = %self.config.build_directory.display(),
                    "connected to cmake server"
                );
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                connection.close().await;
                Err(ClientError::timeout("handshake", timeout))
            }
        }
    }

    /// Connects to a server listening on a Unix pipe.
    #[cfg(unix)]
    pub async fn connect_unix(&self, path: impl AsRef<Path>) -> ClientResult<()> {
        let stream =
            crate::transport::connect_unix(path.as_ref(), self.config.connect_timeout()).await?;
        self.connect(stream).await
    }

    /// Connects to the configured pipe, or the default one.
    #[cfg(unix)]
    pub async fn connect_pipe(&self) -> ClientResult<()> {
        let path = self
            .config
            .pipe_path
            .clone()
            .unwrap_or_else(crate::transport::default_pipe_path);
        self.connect_unix(path).await
    }

    pub fn state(&self) -> ConnectionState {
        self.current()
            .map(|connection| connection.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Number of requests awaiting a reply.
    pub fn pending_requests(&self) -> usize {
        self.current()
            .map(|connection| connection.pending())
            .unwrap_or(0)
    }

    /// Sends a request and returns a handle to its reply.
    ///
    /// The configured request timeout does not apply to the handle; use
    /// [`PendingReply::wait_timeout`].
    pub fn start(&self, request: Request, callbacks: RequestCallbacks) -> ClientResult<PendingReply> {
        let connection = self.current().ok_or(ClientError::NotConnected)?;
        connection.issue(request, callbacks)
    }

    /// Sends a request and waits for its reply payload.
    ///
    /// The payload is the reply object without its `type` and `cookie`
    /// fields. CMake puts reply data at the top level, so a `cache` reply
    /// resolves with `{"inReplyTo": "cache", "cache": [...]}`; nothing is
    /// unwrapped from a nested `value` field.
    pub async fn issue(&self, request: Request) -> ClientResult<Value> {
        self.issue_with(request, RequestCallbacks::default()).await
    }

    /// Like [`issue`](Self::issue), with progress and message callbacks.
    pub async fn issue_with(
        &self,
        request: Request,
        callbacks: RequestCallbacks,
    ) -> ClientResult<Value> {
        let pending = self.start(request, callbacks)?;
        match self.config.request_timeout() {
            Some(after) => pending.wait_timeout(after).await,
            None => pending.wait().await,
        }
    }

    /// Closes the connection and waits for teardown to finish.
    ///
    /// Requests still pending fail with `ConnectionLost`.
    pub async fn disconnect(&self) -> ClientResult<()> {
        let connection = self.current().ok_or(ClientError::NotConnected)?;
        debug!("disconnecting");
        connection.close().await;
        Ok(())
    }

    /// Waits until the current connection has gone away.
    pub async fn wait_disconnected(&self) {
        if let Some(connection) = self.current() {
            connection.wait_disconnected().await;
        }
    }

    /// Fetches the server's global settings.
    pub async fn global_settings(&self) -> ClientResult<Value> {
        self.issue(Request::global_settings()).await
    }

    /// Changes global settings such as `debugOutput` or `warnUnused`.
    pub async fn set_global_settings(&self, settings: Map<String, Value>) -> ClientResult<()> {
        self.issue(Request::set_global_settings(settings))
            .await
            .map(drop)
    }

    /// Runs the configure step.
    pub async fn configure(&self, callbacks: RequestCallbacks) -> ClientResult<()> {
        self.issue_with(Request::configure(), callbacks)
            .await
            .map(drop)
    }

    /// Runs the configure step with extra `-D`-style cache arguments.
    pub async fn configure_with_cache_arguments<I, S>(
        &self,
        arguments: I,
        callbacks: RequestCallbacks,
    ) -> ClientResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.issue_with(Request::configure_with_cache_arguments(arguments), callbacks)
            .await
            .map(drop)
    }

    /// Runs the generate step.
    pub async fn compute(&self, callbacks: RequestCallbacks) -> ClientResult<()> {
        self.issue_with(Request::compute(), callbacks)
            .await
            .map(drop)
    }

    pub async fn codemodel(&self) -> ClientResult<Value> {
        self.issue(Request::codemodel()).await
    }

    pub async fn cmake_inputs(&self) -> ClientResult<Value> {
        self.issue(Request::cmake_inputs()).await
    }

    pub async fn cache(&self) -> ClientResult<Value> {
        self.issue(Request::cache()).await
    }

    pub async fn file_system_watchers(&self) -> ClientResult<Value> {
        self.issue(Request::file_system_watchers()).await
    }

    pub async fn ctest_info(&self) -> ClientResult<Value> {
        self.issue(Request::ctest_info()).await
    }

    fn slot(&self) -> MutexGuard<'_, Option<Arc<Connection>>> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current(&self) -> Option<Arc<Connection>> {
        self.slot().clone()
    }
}

impl std::fmt::Debug for CmakeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CmakeClient")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_disconnected() {
        let client = CmakeClient::new(ClientConfig::new("/src", "/build"));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(!client.is_connected());
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn requests_need_a_connection() {
        let client = CmakeClient::new(ClientConfig::new("/src", "/build"));
        let err = client.global_settings().await.unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
        let err = client.disconnect().await.unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
    }

    #[tokio::test]
    async fn connect_validates_config() {
        let client = CmakeClient::new(ClientConfig::default());
        let (transport, _server) = tokio::io::duplex(1024);
        let err = client.connect(transport).await.unwrap_err();
        assert!(matches!(err, ClientError::Config { .. }));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn signal_handler_can_be_replaced_and_cleared() {
        let client = CmakeClient::new(ClientConfig::new("/src", "/build"));
        client.set_signal_handler(|_| {});
        assert!(client.signal_hook.read().unwrap().is_some());
        client.clear_signal_handler();
        assert!(client.signal_hook.read().unwrap().is_none());
    }

    #[test]
    fn debug_output() {
        let client = CmakeClient::new(ClientConfig::new("/src", "/build"));
        let debug = format!("{client:?}");
        assert!(debug.contains("CmakeClient"));
        assert!(debug.contains("Disconnected"));
    }
}
