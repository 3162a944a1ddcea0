//! Stream framer for marker-delimited messages.
//!
//! Bytes arrive from the transport in arbitrary chunks: a frame may be split
//! across many reads, or several frames may arrive in one read. The
//! [`StreamFramer`] accumulates bytes and carves out complete frames:
//!
//! 1. Fewer bytes than the head marker: wait for more.
//! 2. Buffer does not begin with the head marker: framing error, the whole
//!    buffer is discarded (see [`FramerOptions::resync_on_head_mismatch`]).
//! 3. No tail marker yet: wait for more, keeping the partial frame.
//! 4. Tail found: decode the body. A body that is not UTF-8 JSON is dropped
//!    together with its markers, and extraction continues.
//!
//! Malformed input is logged and counted, never returned to the caller and
//! never fatal.

use bytes::{Buf, BytesMut};
use serde_json::Value;
use tracing::{trace, warn};

use crate::DEFAULT_MAX_FRAME_SIZE;
use crate::codec::{HEAD_MARKER, TAIL_MARKER, decode_body, find};
use crate::error::ProtocolError;

/// Tuning knobs for a [`StreamFramer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramerOptions {
    /// A head-matched frame still lacking its tail once the buffer exceeds
    /// this many bytes is discarded as a framing error.
    pub max_frame_size: usize,

    /// On head mismatch, skip ahead to the next head marker instead of
    /// dropping the whole buffer. Off by default.
    pub resync_on_head_mismatch: bool,
}

impl Default for FramerOptions {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            resync_on_head_mismatch: false,
        }
    }
}

impl FramerOptions {
    /// Builder: set max_frame_size.
    pub fn with_max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }

    /// Builder: set resync_on_head_mismatch.
    pub fn with_resync(mut self, resync: bool) -> Self {
        self.resync_on_head_mismatch = resync;
        self
    }
}

/// Counters describing what a framer has seen so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FramerStats {
    /// Frames decoded and emitted.
    pub frames: u64,
    /// Head mismatches and oversized frames.
    pub framing_errors: u64,
    /// Delimited frames whose body failed UTF-8 or JSON decoding.
    pub decode_errors: u64,
    /// Total bytes thrown away by error recovery.
    pub discarded_bytes: u64,
}

/// Outcome of a single extraction attempt.
enum Step {
    Frame(Value),
    Discarded,
    NeedMore,
}

/// Accumulates stream bytes and yields decoded JSON objects.
#[derive(Debug, Default)]
pub struct StreamFramer {
    buffer: BytesMut,
    /// Body bytes of the current frame already searched for the tail marker.
    scanned: usize,
    options: FramerOptions,
    stats: FramerStats,
}

impl StreamFramer {
    /// Creates a framer with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a framer with the given options.
    pub fn with_options(options: FramerOptions) -> Self {
        Self {
            buffer: BytesMut::new(),
            scanned: 0,
            options,
            stats: FramerStats::default(),
        }
    }

    /// Appends bytes and returns a lazy iterator over the messages that can
    /// now be extracted.
    ///
    /// Bytes left unconsumed when the iterator is dropped early remain
    /// buffered and are picked up by the next call.
    pub fn feed(&mut self, data: &[u8]) -> Frames<'_> {
        self.buffer.extend_from_slice(data);
        Frames { framer: self }
    }

    /// Extracts the next complete message from the buffer, if any.
    pub fn next_message(&mut self) -> Option<Value> {
        loop {
            match self.extract() {
                Step::Frame(value) => return Some(value),
                Step::Discarded => continue,
                Step::NeedMore => return None,
            }
        }
    }

    /// Number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the error and throughput counters.
    pub fn stats(&self) -> FramerStats {
        self.stats
    }

    /// Returns the options this framer was built with.
    pub fn options(&self) -> &FramerOptions {
        &self.options
    }

    /// Drops any buffered bytes, e.g. when the transport is replaced.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.scanned = 0;
    }

    fn extract(&mut self) -> Step {
        if self.buffer.len() < HEAD_MARKER.len() {
            return Step::NeedMore;
        }

        if !self.buffer.starts_with(HEAD_MARKER) {
            return self.recover_head_mismatch();
        }

        // Resume the tail search where the last one stopped, backing up far
        // enough to catch a marker split across deliveries.
        let body_start = HEAD_MARKER.len();
        let resume = self.scanned.saturating_sub(TAIL_MARKER.len() - 1);
        let found = find(&self.buffer[body_start + resume..], TAIL_MARKER);
        let Some(tail_offset) = found.map(|offset| resume + offset) else {
            self.scanned = self.buffer.len() - body_start;
            if self.buffer.len() > self.options.max_frame_size {
                let err = ProtocolError::FrameTooLarge {
                    size: self.buffer.len(),
                    max: self.options.max_frame_size,
                };
                warn!(error = %err, "discarding unterminated frame");
                self.stats.framing_errors += 1;
                self.discard(self.buffer.len());
            }
            return Step::NeedMore;
        };

        let body_end = body_start + tail_offset;
        let frame_end = body_end + TAIL_MARKER.len();
        let decoded = decode_body(&self.buffer[body_start..body_end]);
        match decoded {
            Ok(value) => {
                self.buffer.advance(frame_end);
                self.scanned = 0;
                self.stats.frames += 1;
                trace!(bytes = frame_end, "frame decoded");
                Step::Frame(value)
            }
            Err(err) => {
                warn!(error = %err, bytes = frame_end, "discarding undecodable frame");
                self.stats.decode_errors += 1;
                self.discard(frame_end);
                Step::Discarded
            }
        }
    }

    fn recover_head_mismatch(&mut self) -> Step {
        self.stats.framing_errors += 1;

        if !self.options.resync_on_head_mismatch {
            warn!(
                bytes = self.buffer.len(),
                "buffer does not start with the head marker, discarding"
            );
            self.discard(self.buffer.len());
            return Step::NeedMore;
        }

        match find(&self.buffer[1..], HEAD_MARKER) {
            Some(offset) => {
                warn!(bytes = offset + 1, "skipping to next head marker");
                self.discard(offset + 1);
                Step::Discarded
            }
            None => {
                let keep = partial_head_suffix(&self.buffer);
                warn!(
                    bytes = self.buffer.len() - keep,
                    "no head marker in buffer, discarding"
                );
                self.discard(self.buffer.len() - keep);
                Step::NeedMore
            }
        }
    }

    fn discard(&mut self, count: usize) {
        self.buffer.advance(count);
        self.scanned = 0;
        self.stats.discarded_bytes += count as u64;
    }
}

/// Length of the longest buffer suffix that could still grow into a head marker.
fn partial_head_suffix(buffer: &[u8]) -> usize {
    let max = buffer.len().min(HEAD_MARKER.len() - 1);
    (1..=max)
        .rev()
        .find(|&len| HEAD_MARKER.starts_with(&buffer[buffer.len() - len..]))
        .unwrap_or(0)
}

/// Lazy iterator over messages extracted by [`StreamFramer::feed`].
pub struct Frames<'a> {
    framer: &'a mut StreamFramer,
}

impl Iterator for Frames<'_> {
    type Item = Value;

    fn next(&mut self) -> Option<Self::Item> {
        self.framer.next_message()
    }
}
