//! Client configuration.
//!
//! Settings can be built in code with the `with_*` methods or read from a
//! `config.toml` file, by default `~/.config/cmakeserver/config.toml`:
//!
//! ```toml
//! source_directory = "/src/project"
//! build_directory = "/src/project/build"
//! generator = "Ninja"
//! request_timeout_secs = 120
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use cmakeserver_protocol::{DEFAULT_MAX_FRAME_SIZE, FramerOptions, Handshake, ProtocolVersion};
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, ClientResult};

/// Generator used when none is configured.
pub const DEFAULT_GENERATOR: &str = "Unix Makefiles";

/// Configuration for a [`CmakeClient`](crate::CmakeClient).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Project source tree sent in the handshake.
    pub source_directory: PathBuf,

    /// Build tree sent in the handshake.
    pub build_directory: PathBuf,

    /// CMake generator name.
    pub generator: String,

    /// Extra generator (e.g. "CodeBlocks").
    pub extra_generator: Option<String>,

    /// Generator platform.
    pub platform: Option<String>,

    /// Generator toolset.
    pub toolset: Option<String>,

    /// Preferred protocol major version.
    pub protocol_major: Option<u32>,

    /// Pipe the server listens on (`cmake -E server --pipe=...`).
    pub pipe_path: Option<PathBuf>,

    /// Seconds allowed for connecting and completing the handshake.
    pub connect_timeout_secs: u64,

    /// Seconds a request may stay unanswered. No limit when unset.
    pub request_timeout_secs: Option<u64>,

    /// Largest frame accepted from the server, in bytes.
    pub max_frame_size: usize,

    /// Skip ahead to the next head marker on framing errors.
    pub resync_on_head_mismatch: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            source_directory: PathBuf::new(),
            build_directory: PathBuf::new(),
            generator: DEFAULT_GENERATOR.to_string(),
            extra_generator: None,
            platform: None,
            toolset: None,
            protocol_major: None,
            pipe_path: None,
            connect_timeout_secs: 10,
            request_timeout_secs: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            resync_on_head_mismatch: false,
        }
    }
}

impl ClientConfig {
    /// Creates a configuration for the given source and build trees.
    pub fn new(source_directory: impl Into<PathBuf>, build_directory: impl Into<PathBuf>) -> Self {
        Self {
            source_directory: source_directory.into(),
            build_directory: build_directory.into(),
            ..Self::default()
        }
    }

    /// Builder: set the generator.
    pub fn with_generator(mut self, generator: impl Into<String>) -> Self {
        self.generator = generator.into();
        self
    }

    /// Builder: set the extra generator.
    pub fn with_extra_generator(mut self, extra: impl Into<String>) -> Self {
        self.extra_generator = Some(extra.into());
        self
    }

    /// Builder: set the generator platform.
    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    /// Builder: set the generator toolset.
    pub fn with_toolset(mut self, toolset: impl Into<String>) -> Self {
        self.toolset = Some(toolset.into());
        self
    }

    /// Builder: prefer a protocol major version.
    pub fn with_protocol_major(mut self, major: u32) -> Self {
        self.protocol_major = Some(major);
        self
    }

    /// Builder: set the server pipe path.
    pub fn with_pipe_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.pipe_path = Some(path.into());
        self
    }

    /// Builder: set the connect timeout.
    ///
    /// Timeouts are kept in whole seconds: a fractional duration rounds up,
    /// so `1500ms` becomes two seconds and anything below a second becomes one.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_secs = whole_seconds(timeout);
        self
    }

    /// Builder: set the request timeout, rounded up to whole seconds like
    /// [`with_connect_timeout`](Self::with_connect_timeout).
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_secs = Some(whole_seconds(timeout));
        self
    }

    /// Builder: set the framer limits.
    pub fn with_framer_options(mut self, options: FramerOptions) -> Self {
        self.max_frame_size = options.max_frame_size;
        self.resync_on_head_mismatch = options.resync_on_head_mismatch;
        self
    }

    /// Connect plus handshake timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Per-request timeout, if any.
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    pub fn framer_options(&self) -> FramerOptions {
        FramerOptions::default()
            .with_max_frame_size(self.max_frame_size)
            .with_resync(self.resync_on_head_mismatch)
    }

    /// Builds the handshake for the negotiated protocol version.
    pub fn handshake(&self, version: ProtocolVersion) -> Handshake {
        let mut handshake = Handshake::new(
            version,
            self.source_directory.to_string_lossy(),
            self.build_directory.to_string_lossy(),
            self.generator.clone(),
        );
        handshake.extra_generator = self.extra_generator.clone();
        handshake.platform = self.platform.clone();
        handshake.toolset = self.toolset.clone();
        handshake
    }

    /// Checks the fields the handshake cannot do without.
    pub fn validate(&self) -> ClientResult<()> {
        if self.source_directory.as_os_str().is_empty() {
            return Err(ClientError::config("source_directory is not set"));
        }
        if self.build_directory.as_os_str().is_empty() {
            return Err(ClientError::config("build_directory is not set"));
        }
        if self.generator.trim().is_empty() {
            return Err(ClientError::config("generator must not be empty"));
        }
        if self.max_frame_size == 0 {
            return Err(ClientError::config("max_frame_size must be positive"));
        }
        Ok(())
    }

    /// Loads configuration from the default path, or defaults if absent.
    pub fn load() -> ClientResult<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Loads configuration from a specific path.
    pub fn load_from(path: &Path) -> ClientResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ClientError::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        toml::from_str(&content).map_err(|e| {
            ClientError::config(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    /// Returns the default configuration file path.
    pub fn default_path() -> PathBuf {
        Self::default_config_dir().join("config.toml")
    }

    /// Returns the default configuration directory.
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cmakeserver")
    }
}

fn whole_seconds(timeout: Duration) -> u64 {
    let secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
    secs.max(1)
}
