//! Pending request table.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;
use upptalk_core::RpcError;

/// Single-use completion for an outbound request.
pub type ResponseCallback = Box<dyn FnOnce(Result<Value, RpcError>) + Send>;

/// Outstanding requests keyed by id.
///
/// Every entry leaves the table exactly once: via [`take`](Self::take) when
/// its response arrives, or via [`drain`](Self::drain) when the connection
/// closes. Callbacks are always invoked outside the lock.
#[derive(Default)]
pub struct PendingRequests {
    entries: Mutex<HashMap<String, ResponseCallback>>,
}

impl PendingRequests {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the callback for `id`. Ids are never reused, so an existing
    /// entry is a caller bug; the old callback is returned in that case.
    pub fn insert(&self, id: String, callback: ResponseCallback) -> Option<ResponseCallback> {
        self.entries.lock().insert(id, callback)
    }

    /// Remove and return the callback for `id`.
    pub fn take(&self, id: &str) -> Option<ResponseCallback> {
        self.entries.lock().remove(id)
    }

    /// Remove every entry.
    pub fn drain(&self) -> Vec<(String, ResponseCallback)> {
        self.entries.lock().drain().collect()
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no request is outstanding.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Complete the request `id`. Returns `false` on a correlation miss.
    pub fn complete(&self, id: &str, outcome: Result<Value, RpcError>) -> bool {
        match self.take(id) {
            Some(callback) => {
                callback(outcome);
                true
            }
            None => false,
        }
    }

    /// Fail every outstanding request with `error`.
    pub fn fail_all(&self, error: &RpcError) -> usize {
        let drained = self.drain();
        let count = drained.len();
        for (_, callback) in drained {
            callback(Err(error.clone()));
        }
        count
    }
}

impl std::fmt::Debug for PendingRequests {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequests")
            .field("len", &self.len())
            .finish()
    }
}
