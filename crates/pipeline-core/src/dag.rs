//! # DAG Scheduler
//!
//! Runs a directed acyclic graph of [`NodeAction`]s over a shared state.
//!
//! A node starts once all of its parents have finished successfully. Nodes
//! with retry enabled are restarted after a failure with exponentially
//! growing pauses; other nodes simply give up, and their descendants never
//! run. A panicking node is reported like any other failure but is never
//! retried. A node may also succeed but decline to start its children by
//! returning `false`.
//!
//! The graph can only grow while idle, and it runs at most once.

use crate::backoff::Backoff;
use crate::domain::short_type_name;
use crate::error::{catch_panic, Error, Result};
use crate::uow::{Ctx, CtxFactory};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

static NEXT_DAG_ID: AtomicU64 = AtomicU64::new(1);

/// Work performed by one node.
///
/// The state is shared by all nodes of the graph; parallel nodes must guard
/// whatever part of it they write with their own locks. Returning `Ok(false)`
/// marks the node as successful without starting its children.
#[async_trait]
pub trait NodeAction<S>: Send + Sync + 'static {
    async fn run(&self, ctx: &Ctx, state: &S) -> Result<bool>;

    fn name(&self) -> &str {
        short_type_name::<Self>()
    }
}

#[derive(Debug, Clone)]
pub struct DagOptions {
    /// Pause after the first failure of a retrying node.
    pub first_retry: Duration,
}

impl Default for DagOptions {
    fn default() -> Self {
        Self {
            first_retry: Duration::from_secs(1),
        }
    }
}

/// Identifier of a node, unique across all graphs of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeUid {
    dag: u64,
    node: usize,
}

impl fmt::Display for NodeUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.dag, self.node)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DagStatus {
    Idle,
    Running,
    Stopping,
}

struct Node<S> {
    uid: NodeUid,
    action: Arc<dyn NodeAction<S>>,
    retry: Option<Mutex<Backoff>>,
    pending_parents: AtomicUsize,
    children: Mutex<Vec<usize>>,
}

struct DagInner<S> {
    id: u64,
    factory: CtxFactory,
    state: Arc<S>,
    options: DagOptions,
    status: Mutex<DagStatus>,
    nodes: Mutex<Vec<Arc<Node<S>>>>,
    tracker: TaskTracker,
    stopping: CancellationToken,
}

/// A graph of actions over a shared state `S`.
///
/// # Architecture Note
/// Each node keeps a counter of parents that have not finished yet. A parent
/// that succeeds decrements the counters of its children, and whoever brings a
/// counter to zero starts that child. This guarantees every node runs exactly
/// once per successful set of parents, even when several parents finish at the
/// same moment.
///
/// Node tasks, and the timers waiting to retry them, all live in one task
/// tracker. The run is over when the tracker is empty.
pub struct Dag<S> {
    inner: Arc<DagInner<S>>,
}

impl<S: Send + Sync + 'static> Dag<S> {
    pub fn new(factory: CtxFactory, state: S, options: DagOptions) -> Self {
        Self {
            inner: Arc::new(DagInner {
                id: NEXT_DAG_ID.fetch_add(1, Ordering::Relaxed),
                factory,
                state: Arc::new(state),
                options,
                status: Mutex::new(DagStatus::Idle),
                nodes: Mutex::new(Vec::new()),
                tracker: TaskTracker::new(),
                stopping: CancellationToken::new(),
            }),
        }
    }

    pub fn status(&self) -> DagStatus {
        *self.inner.status.lock()
    }

    pub fn state(&self) -> Arc<S> {
        self.inner.state.clone()
    }

    /// Adds a node that runs after all of `depends` have succeeded.
    pub fn add_node(&self, action: impl NodeAction<S>, retry: bool, depends: &[NodeUid]) -> Result<NodeUid> {
        let status = self.inner.status.lock();
        if *status != DagStatus::Idle {
            return Err(Error::Config(format!("can't add node to {:?} dag", *status)));
        }

        let mut nodes = self.inner.nodes.lock();
        for parent in depends {
            if parent.dag != self.inner.id || parent.node >= nodes.len() {
                return Err(Error::Config(format!("dag {} has no node {parent}", self.inner.id)));
            }
        }

        let uid = NodeUid {
            dag: self.inner.id,
            node: nodes.len(),
        };
        let node = Node {
            uid,
            action: Arc::new(action),
            retry: retry.then(|| Mutex::new(Backoff::new(self.inner.options.first_retry))),
            pending_parents: AtomicUsize::new(depends.len()),
            children: Mutex::new(Vec::new()),
        };
        debug!(node = %uid, action = node.action.name(), parents = depends.len(), "Added dag node");

        for parent in depends {
            nodes[parent.node].children.lock().push(uid.node);
        }
        nodes.push(Arc::new(node));

        Ok(uid)
    }

    pub fn add_node_with_retry(&self, action: impl NodeAction<S>, depends: &[NodeUid]) -> Result<NodeUid> {
        self.add_node(action, true, depends)
    }

    pub fn add_node_ignore_errors(&self, action: impl NodeAction<S>, depends: &[NodeUid]) -> Result<NodeUid> {
        self.add_node(action, false, depends)
    }

    /// Runs the graph until no node can make further progress and returns
    /// the shared state.
    ///
    /// Cancelling `cancel` stops new nodes and pending retries from starting
    /// and waits for running nodes to finish. Dropping the returned future has
    /// the same effect on the graph without the wait.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<Arc<S>> {
        {
            let mut status = self.inner.status.lock();
            if *status != DagStatus::Idle {
                return Err(Error::Config(format!("can't run {:?} dag", *status)));
            }
            *status = DagStatus::Running;
        }

        let roots: Vec<_> = self
            .inner
            .nodes
            .lock()
            .iter()
            .filter(|node| node.pending_parents.load(Ordering::Acquire) == 0)
            .cloned()
            .collect();
        info!(dag = self.inner.id, roots = roots.len(), "Starting dag");

        let guard = StopOnDrop(&*self.inner);
        for node in roots {
            spawn_node(&self.inner, node);
        }
        self.inner.tracker.close();

        tokio::select! {
            _ = self.inner.tracker.wait() => {}
            _ = cancel.cancelled() => {
                info!(dag = self.inner.id, "Stopping dag");
                self.inner.stop();
                self.inner.tracker.wait().await;
            }
        }

        drop(guard);
        info!(dag = self.inner.id, "Dag finished");
        Ok(self.inner.state.clone())
    }
}

impl<S> DagInner<S> {
    fn stop(&self) {
        *self.status.lock() = DagStatus::Stopping;
        self.stopping.cancel();
    }

    fn is_stopping(&self) -> bool {
        self.stopping.is_cancelled()
    }
}

struct StopOnDrop<'a, S>(&'a DagInner<S>);

impl<S> Drop for StopOnDrop<'_, S> {
    fn drop(&mut self) {
        self.0.stop();
    }
}

fn spawn_node<S: Send + Sync + 'static>(inner: &Arc<DagInner<S>>, node: Arc<Node<S>>) {
    inner.tracker.spawn(run_node(inner.clone(), node));
}

fn run_node<S: Send + Sync + 'static>(
    inner: Arc<DagInner<S>>,
    node: Arc<Node<S>>,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        if inner.is_stopping() {
            return;
        }

        let name = node.action.name().to_string();
        let ctx = inner.factory.create(name.as_str());
        let result = catch_panic(node.action.run(&ctx, &inner.state)).await;

        match ctx.finish(result).await {
            Ok(true) => {
                inner.factory.info(&name, "finished");
                if !inner.is_stopping() {
                    release_children(&inner, &node);
                }
            }
            Ok(false) => inner.factory.info(&name, "finished without next call"),
            Err(err) => {
                inner.factory.warn(&name, format!("failed - {err}"));
                schedule_retry(&inner, node, &err);
            }
        }
    })
}

fn release_children<S: Send + Sync + 'static>(inner: &Arc<DagInner<S>>, node: &Node<S>) {
    let children = node.children.lock().clone();
    let nodes = inner.nodes.lock().clone();

    for child in children {
        let child = nodes[child].clone();
        if child.pending_parents.fetch_sub(1, Ordering::AcqRel) == 1 {
            debug!(node = %child.uid, "All parents finished");
            spawn_node(inner, child);
        }
    }
}

fn schedule_retry<S: Send + Sync + 'static>(inner: &Arc<DagInner<S>>, node: Arc<Node<S>>, err: &Error) {
    let Some(backoff) = &node.retry else {
        return;
    };
    if !err.is_recoverable() || inner.is_stopping() {
        return;
    }

    let delay = backoff.lock().next_delay();
    inner
        .factory
        .info(node.action.name(), format!("waiting {delay:?} before next attempt"));

    let retry_inner = inner.clone();
    inner.tracker.spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(delay) => spawn_node(&retry_inner, node),
            _ = retry_inner.stopping.cancelled() => {}
        }
    });
}
