use super::Bus;
use crate::domain::{short_type_name, Event, Request};
use crate::error::{Error, Result};
use crate::uow::Ctx;
use async_trait::async_trait;
use std::any::Any;
use std::marker::PhantomData;

/// Reacts to events of type `E`.
///
/// Each delivery runs in its own [`Ctx`]; returning an error discards that
/// unit of work and hands the failure to the registration's retry policy.
#[async_trait]
pub trait EventHandler<E: Event>: Send + Sync + 'static {
    async fn handle(&self, ctx: &Ctx, event: &E) -> Result<()>;

    fn name(&self) -> &str {
        short_type_name::<Self>()
    }
}

/// Answers requests of type `R`. At most one handler per request type.
#[async_trait]
pub trait RequestHandler<R: Request>: Send + Sync + 'static {
    async fn handle(&self, ctx: &Ctx, request: R) -> Result<R::Response>;

    fn name(&self) -> &str {
        short_type_name::<Self>()
    }
}

/// Long-running source of events, started by [`BusBuilder::build`](super::BusBuilder::build)
/// and cancelled first on shutdown.
#[async_trait]
pub trait EventPublisher: Send + Sync + 'static {
    async fn run(&self, sink: EventSink) -> Result<()>;

    fn name(&self) -> &str {
        short_type_name::<Self>()
    }
}

/// Publishing end handed to [`EventPublisher`]s.
#[derive(Clone)]
pub struct EventSink {
    pub(super) bus: Bus,
}

impl EventSink {
    pub fn publish<E: Event>(&self, event: E) {
        self.bus.publish(event);
    }
}

#[async_trait]
pub(super) trait ErasedEventHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, ctx: &Ctx, event: &(dyn Any + Send + Sync)) -> Result<()>;
}

pub(super) struct TypedEventHandler<E, H> {
    handler: H,
    _event: PhantomData<fn() -> E>,
}

impl<E, H> TypedEventHandler<E, H> {
    pub(super) fn new(handler: H) -> Self {
        Self {
            handler,
            _event: PhantomData,
        }
    }
}

#[async_trait]
impl<E: Event, H: EventHandler<E>> ErasedEventHandler for TypedEventHandler<E, H> {
    fn name(&self) -> &str {
        self.handler.name()
    }

    async fn handle(&self, ctx: &Ctx, event: &(dyn Any + Send + Sync)) -> Result<()> {
        let Some(event) = event.downcast_ref::<E>() else {
            return Err(Error::Config(format!("{} routed to wrong handler", E::NAME)));
        };
        self.handler.handle(ctx, event).await
    }
}
