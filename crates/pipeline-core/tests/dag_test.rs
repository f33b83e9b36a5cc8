mod common;

use async_trait::async_trait;
use common::{builder, stored_counter, Counter, DATA};
use parking_lot::Mutex;
use pipeline_core::repository::MemoryStorage;
use pipeline_core::{Ctx, CtxFactory, Dag, DagOptions, DagStatus, Error, NodeAction, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Shared state: independent fields, each behind its own lock.
#[derive(Default)]
struct Prices {
    log: Mutex<Vec<&'static str>>,
    raw: Mutex<Vec<f64>>,
    stats: Mutex<BTreeMap<&'static str, f64>>,
    merged: Mutex<Option<f64>>,
}

struct Step(&'static str);

#[async_trait]
impl NodeAction<Prices> for Step {
    async fn run(&self, _ctx: &Ctx, state: &Prices) -> Result<bool> {
        state.log.lock().push(self.0);
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(true)
    }

    fn name(&self) -> &str {
        self.0
    }
}

/// Fails a given number of times before loading the prices.
struct Load {
    failures_left: AtomicU32,
    attempts: Arc<Mutex<Vec<Instant>>>,
}

#[async_trait]
impl NodeAction<Prices> for Load {
    async fn run(&self, ctx: &Ctx, state: &Prices) -> Result<bool> {
        self.attempts.lock().push(Instant::now());
        ctx.get::<Counter>("loads", true).await?.lock().await.value += 1;

        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(Error::domain("moex timeout"));
        }
        *state.raw.lock() = vec![1.0, 2.0, 3.0, 6.0];
        Ok(true)
    }
}

struct Mean;

#[async_trait]
impl NodeAction<Prices> for Mean {
    async fn run(&self, _ctx: &Ctx, state: &Prices) -> Result<bool> {
        let raw = state.raw.lock().clone();
        let mean = raw.iter().sum::<f64>() / raw.len() as f64;
        state.stats.lock().insert("mean", mean);
        Ok(true)
    }
}

struct Max;

#[async_trait]
impl NodeAction<Prices> for Max {
    async fn run(&self, _ctx: &Ctx, state: &Prices) -> Result<bool> {
        let max = state.raw.lock().iter().copied().fold(f64::MIN, f64::max);
        state.stats.lock().insert("max", max);
        Ok(true)
    }
}

struct Merge;

#[async_trait]
impl NodeAction<Prices> for Merge {
    async fn run(&self, _ctx: &Ctx, state: &Prices) -> Result<bool> {
        let stats = state.stats.lock().clone();
        *state.merged.lock() = Some(stats["max"] - stats["mean"]);
        state.log.lock().push("merge");
        Ok(true)
    }
}

struct Fail;

#[async_trait]
impl NodeAction<Prices> for Fail {
    async fn run(&self, _ctx: &Ctx, state: &Prices) -> Result<bool> {
        state.log.lock().push("fail");
        Err(Error::domain("always broken"))
    }
}

struct Stop;

#[async_trait]
impl NodeAction<Prices> for Stop {
    async fn run(&self, _ctx: &Ctx, state: &Prices) -> Result<bool> {
        state.log.lock().push("stop");
        Ok(false)
    }
}

/// Takes the first raw price; panics when nothing was loaded.
struct FirstPrice;

#[async_trait]
impl NodeAction<Prices> for FirstPrice {
    async fn run(&self, _ctx: &Ctx, state: &Prices) -> Result<bool> {
        state.log.lock().push("first");
        let first = state.raw.lock()[0];
        state.stats.lock().insert("first", first);
        Ok(true)
    }
}

/// Saves a value after a long computation.
struct SlowSave;

#[async_trait]
impl NodeAction<Prices> for SlowSave {
    async fn run(&self, ctx: &Ctx, state: &Prices) -> Result<bool> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        ctx.get::<Counter>("slow", true).await?.lock().await.value = 7;
        state.log.lock().push("slow");
        Ok(true)
    }
}

fn factory(storage: Arc<MemoryStorage>) -> CtxFactory {
    let (builder, _) = builder(storage);
    builder.build().ctx_factory(DATA)
}

fn dag() -> Dag<Prices> {
    Dag::new(factory(Arc::new(MemoryStorage::new())), Prices::default(), DagOptions::default())
}

#[tokio::test]
async fn diamond_runs_each_node_once_after_its_parents() {
    let dag = dag();
    let a = dag.add_node_ignore_errors(Step("a"), &[]).unwrap();
    let b = dag.add_node_ignore_errors(Step("b"), &[a]).unwrap();
    let c = dag.add_node_ignore_errors(Step("c"), &[a]).unwrap();
    dag.add_node_ignore_errors(Step("d"), &[b, c]).unwrap();

    let state = dag.run(&CancellationToken::new()).await.unwrap();

    let log = state.log.lock().clone();
    assert_eq!(log.len(), 4);
    assert_eq!(log[0], "a");
    assert_eq!(log[3], "d");
    assert!(log[1..3].contains(&"b") && log[1..3].contains(&"c"));
    assert_eq!(dag.status(), DagStatus::Stopping);
}

#[tokio::test(start_paused = true)]
async fn failed_load_is_retried_with_growing_pauses() {
    let storage = Arc::new(MemoryStorage::new());
    let dag = Dag::new(factory(storage.clone()), Prices::default(), DagOptions::default());
    let attempts = Arc::new(Mutex::new(Vec::new()));

    let load = dag
        .add_node_with_retry(
            Load {
                failures_left: AtomicU32::new(2),
                attempts: attempts.clone(),
            },
            &[],
        )
        .unwrap();
    let mean = dag.add_node_ignore_errors(Mean, &[load]).unwrap();
    let max = dag.add_node_ignore_errors(Max, &[load]).unwrap();
    dag.add_node_ignore_errors(Merge, &[mean, max]).unwrap();

    let state = dag.run(&CancellationToken::new()).await.unwrap();

    let attempts = attempts.lock().clone();
    assert_eq!(attempts.len(), 3);
    let (first_gap, second_gap) = (attempts[1] - attempts[0], attempts[2] - attempts[1]);
    assert!(first_gap >= Duration::from_secs(1));
    assert!(second_gap >= Duration::from_secs(2));
    assert!(second_gap > first_gap);

    assert_eq!(*state.merged.lock(), Some(3.0));
    assert_eq!(*state.log.lock(), vec!["merge"]);
    // Only the successful attempt committed its write.
    assert_eq!(stored_counter(storage.as_ref(), "loads").await, Some((1, 1)));
}

#[tokio::test]
async fn failure_without_retry_stops_the_branch() {
    let dag = dag();
    let root = dag.add_node_ignore_errors(Step("root"), &[]).unwrap();
    let broken = dag.add_node_ignore_errors(Fail, &[root]).unwrap();
    dag.add_node_ignore_errors(Step("after broken"), &[broken]).unwrap();
    dag.add_node_ignore_errors(Step("sibling"), &[root]).unwrap();

    let state = dag.run(&CancellationToken::new()).await.unwrap();

    let mut log = state.log.lock().clone();
    log.sort();
    assert_eq!(log, vec!["fail", "root", "sibling"]);
}

#[tokio::test]
async fn node_can_decline_next_call() {
    let dag = dag();
    let stop = dag.add_node_ignore_errors(Stop, &[]).unwrap();
    dag.add_node_ignore_errors(Step("child"), &[stop]).unwrap();

    let state = dag.run(&CancellationToken::new()).await.unwrap();
    assert_eq!(*state.log.lock(), vec!["stop"]);
}

#[tokio::test]
async fn dag_runs_only_once() {
    let dag = dag();
    dag.add_node_ignore_errors(Step("a"), &[]).unwrap();
    dag.run(&CancellationToken::new()).await.unwrap();

    assert!(matches!(dag.run(&CancellationToken::new()).await, Err(Error::Config(_))));
    assert!(matches!(dag.add_node_ignore_errors(Step("late"), &[]), Err(Error::Config(_))));
}

#[tokio::test]
async fn dependency_from_other_dag_is_rejected() {
    let first = dag();
    let second = dag();
    let foreign = first.add_node_ignore_errors(Step("a"), &[]).unwrap();

    assert!(matches!(
        second.add_node_ignore_errors(Step("b"), &[foreign]),
        Err(Error::Config(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn cancellation_abandons_pending_retries() {
    let dag = dag();
    let attempts = Arc::new(Mutex::new(Vec::new()));
    let load = dag
        .add_node_with_retry(
            Load {
                failures_left: AtomicU32::new(u32::MAX),
                attempts: attempts.clone(),
            },
            &[],
        )
        .unwrap();
    dag.add_node_ignore_errors(Step("never"), &[load]).unwrap();

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(3500)).await;
        stopper.cancel();
    });

    let state = dag.run(&cancel).await.unwrap();

    // Attempts at 0s, 1s and 3s; the 7s retry is abandoned.
    assert_eq!(attempts.lock().len(), 3);
    assert!(state.log.lock().is_empty());
    assert_eq!(dag.status(), DagStatus::Stopping);
}

#[tokio::test(start_paused = true)]
async fn cancellation_waits_for_running_node() {
    let storage = Arc::new(MemoryStorage::new());
    let dag = Dag::new(factory(storage.clone()), Prices::default(), DagOptions::default());
    let slow = dag.add_node_ignore_errors(SlowSave, &[]).unwrap();
    dag.add_node_ignore_errors(Step("report"), &[slow]).unwrap();

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        stopper.cancel();
    });

    let start = Instant::now();
    let state = dag.run(&cancel).await.unwrap();

    assert!(start.elapsed() >= Duration::from_secs(5));
    assert_eq!(*state.log.lock(), vec!["slow"]);
    assert_eq!(stored_counter(storage.as_ref(), "slow").await, Some((1, 7)));
    assert_eq!(dag.status(), DagStatus::Stopping);
}

#[tokio::test]
async fn panicking_node_is_reported_and_stops_its_branch() {
    let (builder, sink) = builder(Arc::new(MemoryStorage::new()));
    let dag = Dag::new(builder.build().ctx_factory(DATA), Prices::default(), DagOptions::default());
    let first = dag.add_node_with_retry(FirstPrice, &[]).unwrap();
    dag.add_node_ignore_errors(Step("after first"), &[first]).unwrap();
    dag.add_node_ignore_errors(Step("sibling"), &[]).unwrap();

    let state = dag.run(&CancellationToken::new()).await.unwrap();

    let mut log = state.log.lock().clone();
    log.sort();
    assert_eq!(log, vec!["first", "sibling"]);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let warnings = sink.messages();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].starts_with("FirstPrice: failed - task failed: index out of bounds"));
}
