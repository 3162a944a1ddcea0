//! Asynchronous client for the CMake server protocol.
//!
//! [`CmakeClient`] drives a `cmake -E server` session over any duplex byte
//! stream: it answers the server's `hello` with a handshake, correlates
//! requests and replies by cookie, routes progress and message notifications
//! to per-request callbacks, and fails every outstanding request if the
//! transport goes away.
//!
//! ```no_run
//! use cmakeserver_client::{ClientConfig, CmakeClient, RequestCallbacks};
//!
//! # async fn run() -> cmakeserver_client::ClientResult<()> {
//! let config = ClientConfig::new("/src/project", "/src/project/build").with_generator("Ninja");
//! let client = CmakeClient::new(config);
//! client.connect_unix("/tmp/cmake.pipe").await?;
//!
//! let progress = RequestCallbacks::new().on_progress(|p| println!("{}", p["progressMessage"]));
//! client.configure(progress).await?;
//! client.compute(RequestCallbacks::new()).await?;
//! let model = client.codemodel().await?;
//! println!("{model}");
//! client.disconnect().await
//! # }
//! ```

mod callbacks;
mod client;
pub mod config;
mod connection;
pub mod error;
mod pending;
pub mod transport;

pub use callbacks::{Callback, RequestCallbacks};
pub use client::CmakeClient;
pub use config::ClientConfig;
pub use connection::{ConnectionState, PendingReply};
pub use error::{ClientError, ClientResult};
pub use transport::Transport;

pub use cmakeserver_protocol as protocol;
