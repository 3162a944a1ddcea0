//! Wire framing and message types for the CMake server protocol.
//!
//! The CMake server speaks JSON over a single duplex stream. Every message
//! is wrapped between two fixed marker lines:
//!
//! ```text
//! \n[== "CMake Server" ==[\n
//! {"type":"hello","supportedProtocolVersions":[{"major":1,"minor":0}]}
//! \n]== "CMake Server" ==]\n
//! ```
//!
//! There is no length prefix, so a reader has to accumulate bytes until a
//! tail marker shows up. [`StreamFramer`] does that and turns an arbitrarily
//! chunked byte stream into decoded JSON objects, which [`Message`] then
//! classifies by their `type` tag.
//!
//! # Example
//!
//! ```rust
//! use cmakeserver_protocol::{encode_frame, Message, Request, StreamFramer};
//!
//! let bytes = encode_frame(&Request::global_settings().with_cookie("0")).unwrap();
//!
//! let mut framer = StreamFramer::new();
//! let decoded: Vec<_> = framer.feed(&bytes).collect();
//! assert_eq!(decoded.len(), 1);
//! assert_eq!(decoded[0]["type"], "globalSettings");
//! ```

mod codec;
mod error;
mod framer;
mod message;

pub use codec::{decode_body, decode_frame, encode_frame, HEAD_MARKER, TAIL_MARKER};
pub use error::{ProtocolError, ProtocolResult};
pub use framer::{FramerOptions, FramerStats, Frames, StreamFramer};
pub use message::{Handshake, Message, ProgressInfo, ProtocolVersion, Request, strip_envelope};

/// Default upper bound on a single buffered frame (64 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;
