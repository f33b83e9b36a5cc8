//! # Message Bus
//!
//! In-process routing of events and requests.
//!
//! * **Events** fan out to every handler registered for their type. Each
//!   handler runs concurrently in its own background task and unit of work,
//!   under its own retry policy.
//! * **Requests** go to exactly one handler and the caller awaits the response.
//! * **Publishers** are long-running tasks that feed events into the bus.
//!
//! Events published from a [`Ctx`] reach the bus only after that unit of work
//! has committed, so handlers never observe effects of an action that failed.

mod handler;
mod policy;

pub use handler::{EventHandler, EventPublisher, EventSink, RequestHandler};
pub use policy::{IgnoreErrors, IndefiniteBackoff, RetryPolicy, DEFAULT_FIRST_RETRY};

use crate::domain::{Event, Request, Subdomain};
use crate::error::{catch_panic, Error, Result};
use crate::notify::Notifier;
use crate::repository::Storage;
use crate::uow::{Ctx, CtxFactory};
use handler::{ErasedEventHandler, TypedEventHandler};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// A published event on its way to the handlers.
#[derive(Clone)]
pub(crate) struct Envelope {
    name: &'static str,
    repr: String,
    event: Arc<dyn Any + Send + Sync>,
}

impl Envelope {
    pub(crate) fn new<E: Event>(event: E) -> Self {
        Self {
            name: E::NAME,
            repr: format!("{event:?}"),
            event: Arc::new(event),
        }
    }
}

type PolicyFactory = Arc<dyn Fn() -> Box<dyn RetryPolicy> + Send + Sync>;

#[derive(Clone)]
struct EventRoute {
    subdomain: Subdomain,
    handler: Arc<dyn ErasedEventHandler>,
    policy: PolicyFactory,
}

struct RequestRoute<R: Request> {
    subdomain: Subdomain,
    handler: Arc<dyn RequestHandler<R>>,
}

/// Collects handler registrations and produces a running [`Bus`].
pub struct BusBuilder {
    storage: Arc<dyn Storage>,
    notifier: Notifier,
    events: HashMap<&'static str, Vec<EventRoute>>,
    requests: HashMap<&'static str, Arc<dyn Any + Send + Sync>>,
    publishers: Vec<Arc<dyn EventPublisher>>,
}

impl std::fmt::Debug for BusBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusBuilder").finish_non_exhaustive()
    }
}

impl BusBuilder {
    /// Registers `handler` for events of type `E`.
    ///
    /// `policy` is called once per delivered event, e.g. `IgnoreErrors::default`
    /// or `|| IndefiniteBackoff::new(first_retry)`.
    pub fn add_event_handler<E, H, P, F>(&mut self, subdomain: Subdomain, handler: H, policy: F) -> &mut Self
    where
        E: Event,
        H: EventHandler<E>,
        P: RetryPolicy,
        F: Fn() -> P + Send + Sync + 'static,
    {
        let handler: Arc<dyn ErasedEventHandler> = Arc::new(TypedEventHandler::<E, H>::new(handler));
        info!(event = E::NAME, handler = handler.name(), %subdomain, "Registered event handler");

        self.events.entry(E::NAME).or_default().push(EventRoute {
            subdomain,
            handler,
            policy: Arc::new(move || Box::new(policy()) as Box<dyn RetryPolicy>),
        });
        self
    }

    /// Registers the single handler for requests of type `R`.
    ///
    /// Registering a second handler for the same request type is an error.
    pub fn add_request_handler<R, H>(&mut self, subdomain: Subdomain, handler: H) -> Result<&mut Self>
    where
        R: Request,
        H: RequestHandler<R>,
    {
        if self.requests.contains_key(R::NAME) {
            return Err(Error::Config(format!("can't register second handler for {}", R::NAME)));
        }
        info!(request = R::NAME, handler = handler.name(), %subdomain, "Registered request handler");

        let route: RequestRoute<R> = RequestRoute {
            subdomain,
            handler: Arc::new(handler),
        };
        self.requests.insert(R::NAME, Arc::new(route));
        Ok(self)
    }

    pub fn add_event_publisher(&mut self, publisher: impl EventPublisher) -> &mut Self {
        self.publishers.push(Arc::new(publisher));
        self
    }

    /// Freezes the routing table and starts the publishers.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> Bus {
        let cancel = CancellationToken::new();
        let bus = Bus {
            inner: Arc::new(BusInner {
                storage: self.storage,
                notifier: self.notifier,
                events: self.events,
                requests: self.requests,
                handlers: TaskTracker::new(),
                publishers: TaskTracker::new(),
                publishers_cancel: cancel.child_token(),
                cancel,
                closing: Mutex::new(()),
            }),
        };

        for publisher in self.publishers {
            bus.start_publisher(publisher);
        }

        bus
    }
}

struct BusInner {
    storage: Arc<dyn Storage>,
    notifier: Notifier,
    events: HashMap<&'static str, Vec<EventRoute>>,
    requests: HashMap<&'static str, Arc<dyn Any + Send + Sync>>,
    handlers: TaskTracker,
    publishers: TaskTracker,
    cancel: CancellationToken,
    publishers_cancel: CancellationToken,
    /// Orders `drain` reopening the handler tracker against `shutdown` closing it.
    closing: Mutex<()>,
}

/// Handle to the message bus. Cloning is cheap.
///
/// # Architecture Note
/// All background work of the bus lives in two task trackers, one for
/// publishers and one for handler deliveries. [`shutdown`](Bus::shutdown)
/// cancels publishers first so no new events arrive while in-flight handlers
/// are being cancelled.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    pub fn builder(storage: Arc<dyn Storage>, notifier: Notifier) -> BusBuilder {
        BusBuilder {
            storage,
            notifier,
            events: HashMap::new(),
            requests: HashMap::new(),
            publishers: Vec::new(),
        }
    }

    /// Creates a factory of units of work bound to `subdomain`.
    pub fn ctx_factory(&self, subdomain: Subdomain) -> CtxFactory {
        CtxFactory::new(self.clone(), subdomain)
    }

    /// Publishes an event directly, outside of any unit of work.
    pub fn publish<E: Event>(&self, event: E) {
        self.dispatch(Envelope::new(event));
    }

    /// Routes a request to its handler and awaits the response.
    ///
    /// The handler runs in a fresh unit of work that commits before the
    /// response is returned. Failures are propagated without retries.
    pub async fn request<R: Request>(&self, request: R) -> Result<R::Response> {
        let route = self
            .inner
            .requests
            .get(R::NAME)
            .cloned()
            .ok_or(Error::NoRequestHandler(R::NAME))?
            .downcast::<RequestRoute<R>>()
            .map_err(|_| Error::Config(format!("{} registered with a different type", R::NAME)))?;

        let ctx = Ctx::new(self.clone(), route.subdomain, route.handler.name());
        debug!(request = ?request, handler = route.handler.name(), "Handling request");
        let result = catch_panic(route.handler.handle(&ctx, request)).await;
        ctx.finish(result).await
    }

    /// Waits until every in-flight event delivery has finished.
    ///
    /// Publishers keep running; events they emit meanwhile extend the wait.
    /// After [`Bus::shutdown`] has begun the handler tracker stays closed.
    pub async fn drain(&self) {
        self.inner.handlers.close();
        self.inner.handlers.wait().await;

        let _closing = self.inner.closing.lock();
        if !self.inner.cancel.is_cancelled() {
            self.inner.handlers.reopen();
        }
    }

    /// Cancels publishers, then in-flight handlers, and waits for both.
    pub async fn shutdown(&self) {
        info!("Stopping event publishers");
        self.inner.publishers_cancel.cancel();
        self.inner.publishers.close();
        self.inner.publishers.wait().await;

        info!(in_flight = self.inner.handlers.len(), "Stopping event handlers");
        {
            let _closing = self.inner.closing.lock();
            self.inner.cancel.cancel();
            self.inner.handlers.close();
        }
        self.inner.handlers.wait().await;
        info!("Message bus stopped");
    }

    pub(crate) fn storage(&self) -> Arc<dyn Storage> {
        self.inner.storage.clone()
    }

    /// Logs a warning and forwards it to the notification channel.
    pub(crate) fn warn(&self, component: &str, msg: &str) {
        warn!(component, "{msg}");
        self.inner.notifier.notify(format!("{component}: {msg}"));
    }

    pub(crate) fn dispatch(&self, envelope: Envelope) {
        let Some(routes) = self.inner.events.get(envelope.name) else {
            debug!(event = envelope.name, "No handlers for event");
            return;
        };

        for route in routes {
            let bus = self.clone();
            let route = route.clone();
            let envelope = envelope.clone();
            self.spawn_handler(async move { bus.deliver(route, envelope).await });
        }
    }

    fn spawn_handler<F>(&self, delivery: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.inner.cancel.clone();
        self.inner.handlers.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = delivery => {}
            }
        });
    }

    async fn deliver(&self, route: EventRoute, envelope: Envelope) {
        let name = route.handler.name().to_string();
        let mut policy = (route.policy)();
        let mut attempt = 1;

        loop {
            let ctx = Ctx::new(self.clone(), route.subdomain, name.clone());
            let result = catch_panic(route.handler.handle(&ctx, envelope.event.as_ref())).await;

            match ctx.finish(result).await {
                Ok(()) => {
                    debug!(handler = %name, event = envelope.name, attempt, "Event handled");
                    return;
                }
                Err(err) => {
                    self.warn(
                        &name,
                        &format!("can't handle {} in {attempt} attempt with {err}", envelope.repr),
                    );
                    if !policy.should_retry(attempt, &err).await {
                        return;
                    }
                    attempt += 1;
                }
            }
        }
    }

    fn start_publisher(&self, publisher: Arc<dyn EventPublisher>) {
        let bus = self.clone();
        let cancel = self.inner.publishers_cancel.clone();

        self.inner.publishers.spawn(async move {
            let name = publisher.name().to_string();
            info!(publisher = %name, "Publisher started");

            let sink = EventSink { bus: bus.clone() };
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(publisher = %name, "Publisher stopped");
                }
                result = catch_panic(publisher.run(sink)) => {
                    if let Err(err) = result {
                        bus.warn(&name, &format!("publisher failed with {err}"));
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Component;
    use crate::repository::MemoryStorage;
    use crate::notify::LogSink;
    use std::time::Duration;

    #[derive(Debug)]
    struct Ping;

    impl Component for Ping {
        const NAME: &'static str = "Ping";
    }

    impl Request for Ping {
        type Response = &'static str;
    }

    struct Pong;

    #[async_trait::async_trait]
    impl RequestHandler<Ping> for Pong {
        async fn handle(&self, _ctx: &Ctx, _request: Ping) -> Result<&'static str> {
            Ok("pong")
        }
    }

    #[derive(Debug)]
    struct Tick;

    impl Component for Tick {
        const NAME: &'static str = "Tick";
    }

    impl Event for Tick {}

    struct SlowHandler;

    #[async_trait::async_trait]
    impl EventHandler<Tick> for SlowHandler {
        async fn handle(&self, _ctx: &Ctx, _event: &Tick) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
    }

    fn builder() -> BusBuilder {
        let (notifier, _worker) = Notifier::new(Arc::new(LogSink), Duration::from_secs(1));
        Bus::builder(Arc::new(MemoryStorage::new()), notifier)
    }

    const TEST: Subdomain = Subdomain::new("test");

    #[tokio::test]
    async fn second_request_handler_is_rejected() {
        let mut builder = builder();
        builder.add_request_handler::<Ping, _>(TEST, Pong).unwrap();
        let err = builder.add_request_handler::<Ping, _>(TEST, Pong).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn request_without_handler_fails() {
        let bus = builder().build();
        let err = bus.request(Ping).await.unwrap_err();
        assert!(matches!(err, Error::NoRequestHandler("Ping")));
    }

    #[tokio::test]
    async fn request_reaches_its_handler() {
        let mut builder = builder();
        builder.add_request_handler::<Ping, _>(TEST, Pong).unwrap();
        let bus = builder.build();
        assert_eq!(bus.request(Ping).await.unwrap(), "pong");
        bus.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn drain_racing_shutdown_leaves_bus_closed() {
        let mut builder = builder();
        builder.add_event_handler(TEST, SlowHandler, IgnoreErrors::default);
        let bus = builder.build();
        bus.publish(Tick);

        let draining = tokio::spawn({
            let bus = bus.clone();
            async move { bus.drain().await }
        });
        tokio::task::yield_now().await;

        tokio::time::timeout(Duration::from_secs(1), bus.shutdown())
            .await
            .expect("shutdown must not wait for the slow handler");
        draining.await.unwrap();
        assert!(bus.inner.handlers.is_closed());

        bus.drain().await;
        assert!(bus.inner.handlers.is_closed());
    }
}
