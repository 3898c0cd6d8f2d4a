//! Inbound handler chain.
//!
//! Handlers are consulted in registration order. For a request, each
//! matching handler may claim it ([`Handled::Yes`]) or pass it on
//! ([`Handled::No`]); a request nobody claims is answered with
//! `"Method not found"`. A notification is delivered to every matching
//! handler.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::warn;
use upptalk_core::{Notification, Request, Response, RpcError};

use crate::connection::Connection;
use crate::errors::ConnectionError;

/// Whether a handler claimed a message.
#[derive(Debug)]
pub enum Handled<T> {
    /// Claimed. It will not be offered to later handlers.
    Yes,
    /// Not claimed; the (possibly changed) message goes to the next handler.
    No(T),
}

/// An inbound message offered to a handler.
#[derive(Debug)]
pub enum Inbound {
    /// A request and the means to answer it.
    Request(Request, Responder),
    /// A notification.
    Notification(Notification),
}

impl Inbound {
    /// Method name.
    pub fn method(&self) -> &str {
        match self {
            Self::Request(request, _) => &request.method,
            Self::Notification(notification) => &notification.method,
        }
    }

    /// Payload, if any.
    pub fn payload(&self) -> Option<&Value> {
        match self {
            Self::Request(request, _) => request.payload.as_ref(),
            Self::Notification(notification) => notification.payload.as_ref(),
        }
    }
}

/// Answers one inbound request, exactly once.
///
/// Dropping an unanswered responder sends an internal error so the remote
/// side is never left waiting.
#[derive(Debug)]
pub struct Responder {
    conn: Connection,
    id: String,
    answered: bool,
}

impl Responder {
    pub(crate) fn new(conn: Connection, id: String) -> Self {
        Self {
            conn,
            id,
            answered: false,
        }
    }

    /// Id of the request being answered.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Send the response.
    pub fn respond(mut self, outcome: Result<Value, RpcError>) -> Result<(), ConnectionError> {
        self.answered = true;
        let response = match outcome {
            Ok(result) => Response::success(self.id.clone(), result),
            Err(error) => Response::failure(self.id.clone(), error.to_wire()),
        };
        self.conn.send_response(response)
    }

    /// Send a success response.
    pub fn ok(self, result: Value) -> Result<(), ConnectionError> {
        self.respond(Ok(result))
    }

    /// Send a failure response.
    pub fn err(self, error: RpcError) -> Result<(), ConnectionError> {
        self.respond(Err(error))
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if self.answered {
            return;
        }
        warn!(id = %self.id, "request dropped without a response");
        let error = RpcError::internal("request dropped without a response");
        let _ = self
            .conn
            .send_response(Response::failure(self.id.clone(), error.to_wire()));
    }
}

/// Inbound message handler.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Claim or pass on `inbound`.
    async fn handle(&self, inbound: Inbound, conn: &Connection) -> Handled<Inbound>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Inbound, Connection) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Handled<Inbound>> + Send + 'static,
{
    async fn handle(&self, inbound: Inbound, conn: &Connection) -> Handled<Inbound> {
        (self)(inbound, conn.clone()).await
    }
}

/// Method predicate for [`Route::Matcher`].
pub type MethodMatcher = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Which methods an entry is offered.
#[derive(Clone)]
pub enum Route {
    /// Exactly this method.
    Method(String),
    /// Any method the predicate accepts.
    Matcher(MethodMatcher),
}

impl Route {
    /// Whether `method` is routed to this entry.
    pub fn matches(&self, method: &str) -> bool {
        match self {
            Self::Method(name) => name == method,
            Self::Matcher(predicate) => predicate(method),
        }
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Method(name) => f.debug_tuple("Method").field(name).finish(),
            Self::Matcher(_) => f.write_str("Matcher(..)"),
        }
    }
}

#[derive(Clone)]
struct Entry {
    route: Route,
    handler: Arc<dyn Handler>,
}

/// Ordered list of (route, handler) entries.
#[derive(Default)]
pub struct HandlerChain {
    entries: RwLock<Vec<Entry>>,
}

impl HandlerChain {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry.
    pub fn push(&self, route: Route, handler: Arc<dyn Handler>) {
        self.entries.write().push(Entry { route, handler });
    }

    /// Handlers routed to `method`, in registration order.
    ///
    /// Returned as a snapshot so no lock is held while they run.
    pub fn matching(&self, method: &str) -> Vec<Arc<dyn Handler>> {
        self.entries
            .read()
            .iter()
            .filter(|entry| entry.route.matches(method))
            .map(|entry| entry.handler.clone())
            .collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the chain is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl std::fmt::Debug for HandlerChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let routes: Vec<Route> = self.entries.read().iter().map(|e| e.route.clone()).collect();
        f.debug_struct("HandlerChain").field("routes", &routes).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Claim;

    #[async_trait]
    impl Handler for Claim {
        async fn handle(&self, _inbound: Inbound, _conn: &Connection) -> Handled<Inbound> {
            Handled::Yes
        }
    }

    #[test]
    fn method_route_matches_exact_name() {
        let route = Route::Method("chat".into());
        assert!(route.matches("chat"));
        assert!(!route.matches("chat.send"));
    }

    #[test]
    fn matcher_route_uses_predicate() {
        let route = Route::Matcher(Arc::new(|m: &str| m.starts_with("contact")));
        assert!(route.matches("contacts"));
        assert!(!route.matches("chat"));
    }

    #[test]
    fn matching_preserves_registration_order() {
        let chain = HandlerChain::new();
        let first: Arc<dyn Handler> = Arc::new(Claim);
        let second: Arc<dyn Handler> = Arc::new(Claim);
        chain.push(Route::Method("ping".into()), first.clone());
        chain.push(Route::Method("chat".into()), Arc::new(Claim));
        chain.push(Route::Matcher(Arc::new(|_: &str| true)), second.clone());

        let matched = chain.matching("ping");
        assert_eq!(matched.len(), 2);
        assert!(Arc::ptr_eq(&matched[0], &first));
        assert!(Arc::ptr_eq(&matched[1], &second));
        assert_eq!(chain.len(), 3);
    }

    #[test]
    fn inbound_accessors() {
        let inbound = Inbound::Notification(Notification {
            method: "presence".into(),
            payload: Some(serde_json::json!({"user": "bob"})),
        });
        assert_eq!(inbound.method(), "presence");
        assert_eq!(inbound.payload().unwrap()["user"], "bob");
    }
}
