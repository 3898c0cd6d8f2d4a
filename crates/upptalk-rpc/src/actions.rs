//! Named actions merged into a connection at construction.
//!
//! An [`ActionRegistry`] is plain configuration: build one, register
//! actions, and hand it to [`Connection::new`]. Two connections never share
//! registration state.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tracing::instrument;
use upptalk_core::RpcError;

use crate::connection::Connection;
use crate::handler::{Handled, Handler, Inbound};

/// Upload progress: `(bytes_sent, bytes_total)`.
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Arguments passed to an action.
#[derive(Clone, Default)]
pub struct ActionInput {
    /// RPC payload.
    pub payload: Option<Value>,
    /// Binary body for side-channel uploads.
    pub attachment: Option<Bytes>,
    /// Progress callback for long transfers.
    pub progress: Option<ProgressFn>,
}

impl ActionInput {
    /// Input carrying only a payload.
    pub fn payload(payload: Value) -> Self {
        Self {
            payload: Some(payload),
            ..Self::default()
        }
    }

    /// Attach a binary body.
    #[must_use]
    pub fn with_attachment(mut self, attachment: impl Into<Bytes>) -> Self {
        self.attachment = Some(attachment.into());
        self
    }

    /// Attach a progress callback.
    #[must_use]
    pub fn with_progress(mut self, progress: impl Fn(u64, u64) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(progress));
        self
    }
}

impl std::fmt::Debug for ActionInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionInput")
            .field("payload", &self.payload)
            .field("attachment", &self.attachment.as_ref().map(Bytes::len))
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// A named operation with typed arguments.
#[async_trait]
pub trait Action: Send + Sync {
    /// Run the action; the result becomes the RPC result.
    async fn run(&self, conn: &Connection, input: ActionInput) -> Result<Value, RpcError>;

    /// Whether inbound messages with this name are routed to the action.
    /// Outbound-only actions (reachable through
    /// [`Connection::perform`]) return `false`.
    fn serves_inbound(&self) -> bool {
        true
    }
}

/// Registry mapping action names to actions.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl ActionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action under `name`, replacing any previous one.
    pub fn register(&mut self, name: &str, action: impl Action + 'static) {
        let _ = self.actions.insert(name.to_owned(), Arc::new(action));
    }

    /// Builder form of [`register`](Self::register).
    #[must_use]
    pub fn with(mut self, name: &str, action: impl Action + 'static) -> Self {
        self.register(name, action);
        self
    }

    /// Look up an action.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(name).cloned()
    }

    /// Whether `name` is registered.
    pub fn has_action(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    /// All registered names (sorted).
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.actions.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.names())
            .finish()
    }
}

/// Exposes an action to inbound dispatch under its own name.
pub(crate) struct ActionHandler {
    pub(crate) name: String,
    pub(crate) action: Arc<dyn Action>,
}

#[async_trait]
impl Handler for ActionHandler {
    #[instrument(skip_all, fields(action = %self.name))]
    async fn handle(&self, inbound: Inbound, conn: &Connection) -> Handled<Inbound> {
        match inbound {
            Inbound::Request(request, responder) => {
                let outcome = self
                    .action
                    .run(conn, ActionInput {
                        payload: request.payload,
                        ..ActionInput::default()
                    })
                    .await;
                let _ = responder.respond(outcome);
            }
            Inbound::Notification(notification) => {
                if let Err(e) = self
                    .action
                    .run(conn, ActionInput {
                        payload: notification.payload,
                        ..ActionInput::default()
                    })
                    .await
                {
                    tracing::debug!(error = %e, "action failed for notification");
                }
            }
        }
        Handled::Yes
    }
}
