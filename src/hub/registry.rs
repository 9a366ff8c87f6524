//! Registries for pending invocations and client-bound methods.
//!
//! A pending invocation is co-owned by the registry and the send path
//! until its terminal event is delivered exactly once: from a completion
//! message, from a local write failure, or from connection close.

use std::collections::HashMap;

use futures_channel::{mpsc, oneshot};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::HubError;

/// An invocation awaiting its terminal event from the server.
pub enum PendingInvocation {
    /// Awaiting a single completion.
    Single(oneshot::Sender<Result<Option<Value>, HubError>>),
    /// Receiving stream items until a completion.
    Stream(mpsc::UnboundedSender<Result<Value, HubError>>),
}

impl PendingInvocation {
    /// Delivers a server completion.
    fn complete(self, result: Option<Value>, error: Option<String>) {
        match self {
            Self::Single(sender) => {
                let outcome = match error {
                    Some(message) => Err(HubError::HubInvocationError(message)),
                    None => Ok(result),
                };
                let _ = sender.send(outcome);
            }
            Self::Stream(sender) => {
                if let Some(message) = error {
                    let _ = sender.unbounded_send(Err(HubError::HubInvocationError(message)));
                }
                // Dropping the sender ends the stream
            }
        }
    }

    /// Aborts the invocation with a local error.
    fn fail(self, error: HubError) {
        match self {
            Self::Single(sender) => {
                let _ = sender.send(Err(error));
            }
            Self::Stream(sender) => {
                let _ = sender.unbounded_send(Err(error));
            }
        }
    }
}

/// Handler for a server-to-client method call.
pub type ClientMethodHandler =
    std::sync::Arc<dyn Fn(ArgumentExtractor) -> Result<(), HubError> + Send + Sync>;

/// Sequential typed access to the arguments of a client-bound invocation.
pub struct ArgumentExtractor {
    arguments: std::vec::IntoIter<Value>,
}

impl ArgumentExtractor {
    pub fn new(arguments: Vec<Value>) -> Self {
        Self {
            arguments: arguments.into_iter(),
        }
    }

    /// Decodes the next argument.
    pub fn argument<T: DeserializeOwned>(&mut self) -> Result<T, HubError> {
        let value = self
            .arguments
            .next()
            .ok_or_else(|| HubError::InvalidOperation("no more arguments".into()))?;
        serde_json::from_value(value)
            .map_err(|e| HubError::InvalidOperation(format!("argument decode failed: {e}")))
    }

    pub fn remaining(&self) -> usize {
        self.arguments.len()
    }
}

/// Pending calls keyed by invocation ID, and client methods keyed by
/// target name.
#[derive(Default)]
pub struct InvocationRegistry {
    pending: HashMap<String, PendingInvocation>,
    methods: HashMap<String, ClientMethodHandler>,
}

impl InvocationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a pending invocation. The ID must be unique and the
    /// handler must be in place before the outbound frame is written.
    pub fn register(&mut self, invocation_id: String, handler: PendingInvocation) {
        self.pending.insert(invocation_id, handler);
    }

    /// Removes a pending invocation, e.g. after a failed write.
    pub fn take(&mut self, invocation_id: &str) -> Option<PendingInvocation> {
        self.pending.remove(invocation_id)
    }

    /// Resolves a pending invocation from a completion message.
    pub fn complete(&mut self, invocation_id: &str, result: Option<Value>, error: Option<String>) {
        match self.pending.remove(invocation_id) {
            Some(handler) => handler.complete(result, error),
            None => debug!(invocation_id, "completion for an unknown invocation"),
        }
    }

    /// Feeds one item to a streaming invocation; the handler stays
    /// registered until its completion arrives.
    pub fn deliver_stream_item(&mut self, invocation_id: &str, item: Value) {
        match self.pending.get(invocation_id) {
            Some(PendingInvocation::Stream(sender)) => {
                if sender.unbounded_send(Ok(item)).is_err() {
                    debug!(invocation_id, "stream receiver dropped, discarding handler");
                    self.pending.remove(invocation_id);
                }
            }
            Some(PendingInvocation::Single(_)) => {
                warn!(invocation_id, "stream item for a non-streaming invocation");
                if let Some(handler) = self.pending.remove(invocation_id) {
                    handler.fail(HubError::InvalidOperation(
                        "received a stream item for a non-streaming invocation".into(),
                    ));
                }
            }
            None => debug!(invocation_id, "stream item for an unknown invocation"),
        }
    }

    /// Aborts every pending invocation with `error`.
    pub fn abort_all(&mut self, error: HubError) {
        for (_, handler) in self.pending.drain() {
            handler.fail(error.clone());
        }
    }

    /// Registers a client-bound method handler, replacing (with a
    /// warning) any existing one.
    pub fn register_method(&mut self, method: String, handler: ClientMethodHandler) {
        if self.methods.contains_key(&method) {
            warn!(%method, "replacing an existing client method handler");
        }
        self.methods.insert(method, handler);
    }

    pub fn method(&self, method: &str) -> Option<ClientMethodHandler> {
        self.methods.get(method).cloned()
    }

    #[cfg(test)]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use serde_json::json;

    #[tokio::test]
    async fn single_invocation_resolves_once_with_its_result() {
        let mut registry = InvocationRegistry::new();
        let (tx, rx) = oneshot::channel();
        registry.register("1".into(), PendingInvocation::Single(tx));

        registry.complete("1", Some(json!(3)), None);
        assert_eq!(rx.await.unwrap().unwrap(), Some(json!(3)));
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn completion_error_is_delivered_as_an_error() {
        let mut registry = InvocationRegistry::new();
        let (tx, rx) = oneshot::channel();
        registry.register("1".into(), PendingInvocation::Single(tx));

        registry.complete("1", None, Some("boom".into()));
        assert!(matches!(
            rx.await.unwrap(),
            Err(HubError::HubInvocationError(message)) if message == "boom"
        ));
    }

    #[test]
    fn completion_for_unknown_invocation_is_ignored() {
        let mut registry = InvocationRegistry::new();
        registry.complete("nope", Some(json!(1)), None);
    }

    #[tokio::test]
    async fn stream_receives_items_then_ends_on_completion() {
        let mut registry = InvocationRegistry::new();
        let (tx, mut rx) = mpsc::unbounded();
        registry.register("2".into(), PendingInvocation::Stream(tx));

        registry.deliver_stream_item("2", json!(1));
        registry.deliver_stream_item("2", json!(2));
        registry.complete("2", None, None);

        assert_eq!(rx.next().await.unwrap().unwrap(), json!(1));
        assert_eq!(rx.next().await.unwrap().unwrap(), json!(2));
        assert!(rx.next().await.is_none());
    }

    #[tokio::test]
    async fn stream_completion_with_error_delivers_the_error() {
        let mut registry = InvocationRegistry::new();
        let (tx, mut rx) = mpsc::unbounded();
        registry.register("2".into(), PendingInvocation::Stream(tx));

        registry.complete("2", None, Some("stream failed".into()));
        assert!(matches!(
            rx.next().await.unwrap(),
            Err(HubError::HubInvocationError(message)) if message == "stream failed"
        ));
        assert!(rx.next().await.is_none());
    }

    #[tokio::test]
    async fn abort_all_fails_every_pending_invocation() {
        let mut registry = InvocationRegistry::new();
        let (single_tx, single_rx) = oneshot::channel();
        let (stream_tx, mut stream_rx) = mpsc::unbounded();
        registry.register("1".into(), PendingInvocation::Single(single_tx));
        registry.register("2".into(), PendingInvocation::Stream(stream_tx));

        registry.abort_all(HubError::HubInvocationCancelled);
        assert!(matches!(
            single_rx.await.unwrap(),
            Err(HubError::HubInvocationCancelled)
        ));
        assert!(matches!(
            stream_rx.next().await.unwrap(),
            Err(HubError::HubInvocationCancelled)
        ));
        assert_eq!(registry.pending_count(), 0);
    }

    #[test]
    fn re_registering_a_method_replaces_the_handler() {
        let mut registry = InvocationRegistry::new();
        registry.register_method("Echo".into(), std::sync::Arc::new(|_| Ok(())));
        registry.register_method(
            "Echo".into(),
            std::sync::Arc::new(|_| Err(HubError::InvalidState)),
        );
        let handler = registry.method("Echo").unwrap();
        assert!(handler(ArgumentExtractor::new(vec![])).is_err());
    }

    #[test]
    fn argument_extractor_decodes_in_order() {
        let mut extractor = ArgumentExtractor::new(vec![json!(1), json!("two")]);
        assert_eq!(extractor.remaining(), 2);
        assert_eq!(extractor.argument::<i64>().unwrap(), 1);
        assert_eq!(extractor.argument::<String>().unwrap(), "two");
        assert!(extractor.argument::<i64>().is_err());
    }

    #[test]
    fn argument_extractor_reports_type_mismatches() {
        let mut extractor = ArgumentExtractor::new(vec![json!("nan")]);
        assert!(matches!(
            extractor.argument::<i64>(),
            Err(HubError::InvalidOperation(_))
        ));
    }
}
