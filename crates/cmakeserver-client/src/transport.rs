//! Transport boundary.
//!
//! The client runs over any duplex byte stream. CMake itself listens on a
//! named pipe, which on Unix is a Unix domain socket.

use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncWrite};

/// A duplex byte stream the client can own.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Returns the default server pipe path.
///
/// Uses `$XDG_RUNTIME_DIR/cmake-server.pipe` if available, otherwise the
/// system temporary directory.
pub fn default_pipe_path() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("cmake-server.pipe")
}

#[cfg(unix)]
pub use unix::connect_unix;

#[cfg(unix)]
mod unix {
    use std::path::Path;
    use std::time::Duration;

    use tokio::net::UnixStream;
    use tracing::debug;

    use crate::error::{ClientError, ClientResult};

    /// Connects to a server pipe, giving up after `timeout`.
    pub async fn connect_unix(path: &Path, timeout: Duration) -> ClientResult<UnixStream> {
        debug!(pipe = %path.display(), "connecting to server");
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| ClientError::timeout(format!("connecting to {}", path.display()), timeout))?
            .map_err(|e| {
                ClientError::Io(std::io::Error::new(
                    e.kind(),
                    format!("failed to connect to {}: {}", path.display(), e),
                ))
            })?;
        Ok(stream)
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_transport<T: Transport>() {}

    #[test]
    fn duplex_stream_is_a_transport() {
        assert_transport::<tokio::io::DuplexStream>();
    }

    #[test]
    fn default_pipe_path_format() {
        let path = default_pipe_path();
        assert!(path.ends_with("cmake-server.pipe"));
    }
}
