//! # Pipeline Core
//!
//! Building blocks for long-running, in-process data pipelines.
//!
//! ## Architecture Overview
//!
//! 1. **Repository** ([`repository`]) - versioned documents with optimistic concurrency
//! 2. **Unit of Work** ([`Ctx`]) - identity map, atomic commit and publish-after-commit
//! 3. **Message Bus** ([`Bus`]) - events fan out with retry policies, requests have one handler
//! 4. **Orchestration** ([`Dag`], [`Fsm`], [`Runner`]) - dependency graphs, state machines and
//!    supervised background tasks
//!
//! Every piece of application logic (event handler, request handler, DAG node,
//! task action) runs inside its own [`Ctx`]. Changes to entities become visible
//! to others only when that scope commits, and events published from it are
//! released to the bus only after a successful commit.
//!
//! ## Example
//!
//! ```rust
//! use pipeline_core::{Bus, Ctx, Dag, DagOptions, NodeAction, Result, Subdomain};
//! use pipeline_core::notify::{LogSink, Notifier};
//! use pipeline_core::repository::MemoryStorage;
//! use async_trait::async_trait;
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicU32, Ordering};
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! struct Count;
//!
//! #[async_trait]
//! impl NodeAction<AtomicU32> for Count {
//!     async fn run(&self, _ctx: &Ctx, state: &AtomicU32) -> Result<bool> {
//!         state.fetch_add(1, Ordering::SeqCst);
//!         Ok(true)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let (notifier, _worker) = Notifier::new(Arc::new(LogSink), Duration::from_secs(1));
//!     let bus = Bus::builder(Arc::new(MemoryStorage::new()), notifier).build();
//!
//!     let dag = Dag::new(bus.ctx_factory(Subdomain::new("data")), AtomicU32::new(0), DagOptions::default());
//!     let first = dag.add_node_ignore_errors(Count, &[])?;
//!     dag.add_node_ignore_errors(Count, &[first])?;
//!
//!     let state = dag.run(&CancellationToken::new()).await?;
//!     assert_eq!(state.load(Ordering::SeqCst), 2);
//!
//!     bus.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod bus;
pub mod dag;
pub mod domain;
pub mod error;
pub mod fsm;
pub mod mock;
pub mod notify;
pub mod repository;
pub mod runner;
pub mod telemetry;
pub mod uow;

pub use bus::{Bus, BusBuilder, EventHandler, EventPublisher, EventSink, IgnoreErrors, IndefiniteBackoff, RequestHandler};
pub use dag::{Dag, DagOptions, DagStatus, NodeAction, NodeUid};
pub use domain::{Component, Entity, Event, Request, Revision, Subdomain, Uid};
pub use error::{gather, Error, ErrorGroup, Result};
pub use fsm::{Fsm, FsmBuilder, FsmState, StateAction, StateSender};
pub use runner::{Action, Runner, RunnerOptions, TaskHandle};
pub use uow::{Ctx, CtxFactory, Shared};
