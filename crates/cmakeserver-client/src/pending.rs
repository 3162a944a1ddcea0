//! Pending request table.
//!
//! Maps cookies to the one-shot result cell of the request awaiting them.
//! The table is a plain struct; the connection keeps it behind its single
//! mutex so cookie allocation, registration and lookups never interleave.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::callbacks::RequestCallbacks;
use crate::error::{ClientError, ClientResult};

/// Receiving half of a request's result cell.
pub(crate) type ReplyReceiver = oneshot::Receiver<ClientResult<Value>>;

struct PendingRequest {
    reply: oneshot::Sender<ClientResult<Value>>,
    callbacks: RequestCallbacks,
}

#[derive(Default)]
pub(crate) struct PendingTable {
    next_cookie: u64,
    closing: bool,
    entries: HashMap<String, PendingRequest>,
}

impl PendingTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns the next cookie: "0", "1", "2", ...
    pub(crate) fn allocate_cookie(&mut self) -> String {
        let cookie = self.next_cookie.to_string();
        self.next_cookie += 1;
        cookie
    }

    /// Inserts a pending entry and returns its result receiver.
    pub(crate) fn register(&mut self, cookie: String, callbacks: RequestCallbacks) -> ReplyReceiver {
        let (reply, receiver) = oneshot::channel();
        let previous = self
            .entries
            .insert(cookie, PendingRequest { reply, callbacks });
        debug_assert!(previous.is_none(), "cookie registered twice");
        receiver
    }

    /// Completes a request with its reply payload.
    pub(crate) fn resolve(&mut self, cookie: &str, payload: Value) -> bool {
        self.complete(cookie, Ok(payload))
    }

    /// Completes a request with a failure.
    pub(crate) fn reject(&mut self, cookie: &str, error: ClientError) -> bool {
        self.complete(cookie, Err(error))
    }

    fn complete(&mut self, cookie: &str, result: ClientResult<Value>) -> bool {
        match self.entries.remove(cookie) {
            Some(entry) => {
                if entry.reply.send(result).is_err() {
                    debug!(cookie, "requester stopped waiting before completion");
                }
                true
            }
            None => false,
        }
    }

    pub(crate) fn callbacks_for(&self, cookie: &str) -> Option<&RequestCallbacks> {
        self.entries.get(cookie).map(|entry| &entry.callbacks)
    }

    /// Drops an entry without completing it.
    pub(crate) fn cancel(&mut self, cookie: &str) -> bool {
        self.entries.remove(cookie).is_some()
    }

    /// Fails every pending request with `ConnectionLost`. Returns how many.
    pub(crate) fn fail_all(&mut self, reason: &str) -> usize {
        let drained: Vec<_> = self.entries.drain().collect();
        let count = drained.len();
        for (cookie, entry) in drained {
            if entry
                .reply
                .send(Err(ClientError::connection_lost(reason)))
                .is_err()
            {
                debug!(cookie = %cookie, "requester gone during connection loss");
            }
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn contains(&self, cookie: &str) -> bool {
        self.entries.contains_key(cookie)
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing
    }

    pub(crate) fn set_closing(&mut self, closing: bool) {
        self.closing = closing;
    }
}
