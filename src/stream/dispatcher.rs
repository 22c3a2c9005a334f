//! Event fan-out to registered async handlers.
//!
//! Ordering is relaxed: handlers for one event are launched in registration
//! order but complete in any order, and separate events are independent
//! units that may finish out of arrival order.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use thiserror::Error;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, trace, warn};

use crate::retry::with_timeout;
use crate::stream::proto::{EventEnvelope, EventError, EventType, StreamEvent};

/// Error type handlers may return.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

type Listener =
    Arc<dyn Fn(StreamEvent) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;
type ErrorHandler =
    Arc<dyn Fn(DispatchError) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// A per-event failure contained by the dispatcher.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to decode event: {0}")]
    Decode(#[from] EventError),

    #[error("{event_type} handler failed: {source}")]
    Handler {
        event_type: EventType,
        #[source]
        source: HandlerError,
    },

    #[error("{event_type} handler panicked: {message}")]
    HandlerPanicked {
        event_type: EventType,
        message: String,
    },

    #[error("{event_type} handler timed out after {timeout:?}")]
    HandlerTimedOut {
        event_type: EventType,
        timeout: Duration,
    },
}

#[derive(Clone, Debug, Default)]
pub struct DispatcherOptions {
    /// Upper bound on a single handler invocation. `None` lets handlers run
    /// indefinitely.
    pub handler_timeout: Option<Duration>,
}

/// Per-event-type handler registry. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct EventDispatcher {
    inner: Arc<DispatcherInner>,
}

#[derive(Default)]
struct DispatcherInner {
    listeners: RwLock<HashMap<EventType, Vec<Listener>>>,
    error_handler: RwLock<Option<ErrorHandler>>,
    options: DispatcherOptions,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: DispatcherOptions) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                options,
                ..DispatcherInner::default()
            }),
        }
    }

    /// Appends a handler for `event_type`. Handlers cannot be removed.
    pub fn register_listener<F, Fut>(&self, event_type: EventType, handler: F)
    where
        F: Fn(StreamEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let listener: Listener = Arc::new(move |event| handler(event).boxed());
        if let Ok(mut listeners) = self.inner.listeners.write() {
            listeners.entry(event_type).or_default().push(listener);
        }
    }

    /// Sets the handler that receives contained failures, one per failing
    /// event, replacing any previous one.
    ///
    /// It runs as a detached task; if it fails itself the failure is logged
    /// and dropped.
    pub fn register_error_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(DispatchError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let handler: ErrorHandler = Arc::new(move |failure| handler(failure).boxed());
        if let Ok(mut slot) = self.inner.error_handler.write() {
            *slot = Some(handler);
        }
    }

    pub fn listener_count(&self, event_type: EventType) -> usize {
        self.inner
            .listeners
            .read()
            .map(|listeners| listeners.get(&event_type).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// Decodes `envelope` and runs its handlers on a new task.
    ///
    /// Returns immediately. The handle resolves once every handler of the
    /// batch finished; awaiting it is optional.
    pub fn dispatch(&self, envelope: EventEnvelope) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.process(envelope).await })
    }

    /// Routes a failure to the error handler, or logs it when none is set.
    ///
    /// Also used for frames that never became an envelope.
    pub fn report(&self, failure: DispatchError) {
        let Some(handler) = self.error_handler() else {
            error!(
                event = "stream_event_failed",
                error = %failure,
                trace = %error_chain(&failure)
            );
            return;
        };

        tokio::spawn(async move {
            if let Err(err) = handler(failure).await {
                warn!(event = "error_handler_failed", error = %err);
            }
        });
    }

    async fn process(&self, envelope: EventEnvelope) {
        let event = match envelope.decode() {
            Ok(event) => event,
            Err(err) => {
                self.report(DispatchError::Decode(err));
                return;
            }
        };

        let event_type = event.event_type();
        let listeners = self.listeners_for(event_type);
        if listeners.is_empty() {
            trace!(event = "stream_event_unhandled", event_type = %event_type);
            return;
        }

        let timeout = self.inner.options.handler_timeout;
        let mut batch = JoinSet::new();
        for listener in listeners {
            let event = event.clone();
            batch.spawn(async move { run_listener(listener, event, timeout).await });
        }

        // One report per event: the first failure to complete wins and the
        // rest of the batch still runs to completion.
        let mut first_failure = None;
        while let Some(joined) = batch.join_next().await {
            let failure = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(failure)) => failure,
                Err(join_error) if join_error.is_panic() => DispatchError::HandlerPanicked {
                    event_type,
                    message: panic_message(join_error.into_panic()),
                },
                Err(_) => continue,
            };
            if first_failure.is_none() {
                first_failure = Some(failure);
            } else {
                debug!(
                    event = "stream_handler_failure_suppressed",
                    event_type = %event_type,
                    error = %failure
                );
            }
        }

        if let Some(failure) = first_failure {
            self.report(failure);
        }
    }

    fn listeners_for(&self, event_type: EventType) -> Vec<Listener> {
        self.inner
            .listeners
            .read()
            .map(|listeners| listeners.get(&event_type).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    fn error_handler(&self) -> Option<ErrorHandler> {
        self.inner
            .error_handler
            .read()
            .map(|slot| slot.clone())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: Vec<(EventType, usize)> = EventType::ALL
            .into_iter()
            .map(|event_type| (event_type, self.listener_count(event_type)))
            .filter(|(_, count)| *count > 0)
            .collect();
        f.debug_struct("EventDispatcher")
            .field("listeners", &counts)
            .field("has_error_handler", &self.error_handler().is_some())
            .field("options", &self.inner.options)
            .finish()
    }
}

async fn run_listener(
    listener: Listener,
    event: StreamEvent,
    timeout: Option<Duration>,
) -> Result<(), DispatchError> {
    let event_type = event.event_type();
    let outcome = match timeout {
        Some(timeout) => with_timeout(timeout, listener(event))
            .await
            .map_err(|_| DispatchError::HandlerTimedOut {
                event_type,
                timeout,
            })?,
        None => listener(event).await,
    };
    outcome.map_err(|source| DispatchError::Handler { event_type, source })
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "non-string panic payload".to_string()
}

fn error_chain(error: &dyn std::error::Error) -> String {
    let mut chain = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        chain.push_str(": ");
        chain.push_str(&cause.to_string());
        source = cause.source();
    }
    chain
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc;

    use super::{DispatchError, DispatcherOptions, EventDispatcher, HandlerError};
    use crate::stream::proto::{EventEnvelope, EventError, EventType, StreamEvent};

    fn envelope(tag: &str, data: serde_json::Value) -> EventEnvelope {
        EventEnvelope {
            event_type: tag.to_string(),
            data,
        }
    }

    fn counting_listener(
        dispatcher: &EventDispatcher,
        event_type: EventType,
    ) -> Arc<AtomicUsize> {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        dispatcher.register_listener(event_type, move |_event| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), HandlerError>(())
            }
        });
        calls
    }

    fn capture_failures(dispatcher: &EventDispatcher) -> mpsc::UnboundedReceiver<DispatchError> {
        let (tx, rx) = mpsc::unbounded_channel();
        dispatcher.register_error_handler(move |failure| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(failure);
                Ok::<(), HandlerError>(())
            }
        });
        rx
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn every_listener_runs_once_even_when_one_fails() {
        let dispatcher = EventDispatcher::new();
        dispatcher.register_listener(EventType::DomainCreate, |_event| async {
            Err::<(), HandlerError>("listener exploded".into())
        });
        let calls = counting_listener(&dispatcher, EventType::DomainCreate);
        let mut failures = capture_failures(&dispatcher);

        dispatcher
            .dispatch(envelope("domain_create", json!({"domain": "evil.example"})))
            .await
            .expect("dispatch task joins");

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let failure = tokio::time::timeout(Duration::from_secs(1), failures.recv())
            .await
            .expect("failure routed")
            .expect("channel open");
        match failure {
            DispatchError::Handler { event_type, source } => {
                assert_eq!(event_type, EventType::DomainCreate);
                assert_eq!(source.to_string(), "listener exploded");
            }
            other => panic!("unexpected failure: {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn error_handler_runs_once_per_failing_event() {
        let dispatcher = EventDispatcher::new();
        for reason in ["first listener failed", "second listener failed"] {
            dispatcher.register_listener(EventType::DomainCreate, move |_event| async move {
                Err::<(), HandlerError>(reason.into())
            });
        }
        let calls = counting_listener(&dispatcher, EventType::DomainCreate);
        let mut failures = capture_failures(&dispatcher);

        dispatcher
            .dispatch(envelope("domain_create", json!({"domain": "evil.example"})))
            .await
            .expect("dispatch task joins");

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        match failures.recv().await.expect("failure routed") {
            DispatchError::Handler { event_type, source } => {
                assert_eq!(event_type, EventType::DomainCreate);
                assert!(source.to_string().ends_with("listener failed"));
            }
            other => panic!("unexpected failure: {other:?}"),
        }
        let extra = tokio::time::timeout(Duration::from_millis(100), failures.recv()).await;
        assert!(extra.is_err(), "error handler invoked more than once");
    }

    #[tokio::test]
    async fn listeners_run_concurrently() {
        let dispatcher = EventDispatcher::new();
        let barrier = Arc::new(tokio::sync::Barrier::new(2));
        for _ in 0..2 {
            let barrier = Arc::clone(&barrier);
            dispatcher.register_listener(EventType::UrlDelete, move |_event| {
                let barrier = Arc::clone(&barrier);
                async move {
                    barrier.wait().await;
                    Ok::<(), HandlerError>(())
                }
            });
        }

        // Sequential execution would deadlock on the barrier.
        tokio::time::timeout(
            Duration::from_secs(1),
            dispatcher.dispatch(envelope("url_delete", json!({"url": "https://x.example"}))),
        )
        .await
        .expect("both listeners reached the barrier")
        .expect("dispatch task joins");
    }

    #[tokio::test]
    async fn listeners_only_see_their_event_type() {
        let dispatcher = EventDispatcher::new();
        let creates = counting_listener(&dispatcher, EventType::DomainCreate);
        let deletes = counting_listener(&dispatcher, EventType::DomainDelete);

        dispatcher
            .dispatch(envelope("domain_delete", json!({"domain": "a.example"})))
            .await
            .expect("dispatch task joins");
        dispatcher
            .dispatch(envelope("url_update", json!({"url": "https://b.example"})))
            .await
            .expect("unhandled event is a no-op");

        assert_eq!(creates.load(Ordering::SeqCst), 0);
        assert_eq!(deletes.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.listener_count(EventType::DomainCreate), 1);
        assert_eq!(dispatcher.listener_count(EventType::UrlUpdate), 0);
    }

    #[tokio::test]
    async fn decode_failures_skip_listeners_and_reach_error_handler() {
        let dispatcher = EventDispatcher::new();
        let calls = counting_listener(&dispatcher, EventType::UrlCreate);
        let mut failures = capture_failures(&dispatcher);

        dispatcher
            .dispatch(envelope("url_create", json!({})))
            .await
            .expect("dispatch task joins");
        dispatcher
            .dispatch(envelope("bogus_tag", json!({})))
            .await
            .expect("dispatch task joins");

        let first = failures.recv().await.expect("malformed routed");
        assert!(matches!(
            first,
            DispatchError::Decode(EventError::MalformedEvent { .. })
        ));
        let second = failures.recv().await.expect("unknown routed");
        match second {
            DispatchError::Decode(EventError::UnknownEventType(tag)) => {
                assert_eq!(tag, "bogus_tag")
            }
            other => panic!("unexpected failure: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    #[allow(unreachable_code)]
    async fn panicking_listener_is_contained() {
        let dispatcher = EventDispatcher::new();
        dispatcher.register_listener(EventType::DomainUpdate, |_event: StreamEvent| async {
            panic!("handler bug");
            Ok::<(), HandlerError>(())
        });
        let calls = counting_listener(&dispatcher, EventType::DomainUpdate);
        let mut failures = capture_failures(&dispatcher);

        dispatcher
            .dispatch(envelope("domain_update", json!({"domain": "a.example"})))
            .await
            .expect("dispatch task survives the panic");

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        match failures.recv().await.expect("panic routed") {
            DispatchError::HandlerPanicked { message, .. } => assert_eq!(message, "handler bug"),
            other => panic!("unexpected failure: {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_listener_times_out() {
        let dispatcher = EventDispatcher::with_options(DispatcherOptions {
            handler_timeout: Some(Duration::from_millis(20)),
        });
        dispatcher.register_listener(EventType::DomainDelete, |_event| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<(), HandlerError>(())
        });
        let mut failures = capture_failures(&dispatcher);

        dispatcher
            .dispatch(envelope("domain_delete", json!({"domain": "a.example"})))
            .await
            .expect("dispatch task joins");

        assert!(matches!(
            failures.recv().await.expect("timeout routed"),
            DispatchError::HandlerTimedOut { timeout, .. } if timeout == Duration::from_millis(20)
        ));
    }

    #[tokio::test]
    async fn last_error_handler_wins_and_its_failure_is_swallowed() {
        let dispatcher = EventDispatcher::new();
        let replaced = Arc::new(AtomicUsize::new(0));
        {
            let replaced = Arc::clone(&replaced);
            dispatcher.register_error_handler(move |_failure| {
                let replaced = Arc::clone(&replaced);
                async move {
                    replaced.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), HandlerError>(())
                }
            });
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.register_error_handler(move |failure| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(failure.to_string());
                Err::<(), HandlerError>("error handler also failed".into())
            }
        });

        dispatcher
            .dispatch(envelope("nope", json!({})))
            .await
            .expect("dispatch task joins");

        let seen = rx.recv().await.expect("second handler invoked");
        assert!(seen.contains("nope"));
        assert_eq!(replaced.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failures_without_error_handler_are_logged() {
        let dispatcher = EventDispatcher::new();
        dispatcher.register_listener(EventType::UrlUpdate, |_event| async {
            Err::<(), HandlerError>("no handler registered".into())
        });
        let calls = counting_listener(&dispatcher, EventType::UrlUpdate);

        dispatcher
            .dispatch(envelope("url_update", json!({"url": "https://a.example"})))
            .await
            .expect("logged failure does not poison the task");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
