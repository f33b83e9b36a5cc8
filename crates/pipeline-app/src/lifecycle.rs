use crate::config::Config;
use crate::data::{update_dag, BACKUP_COLLECTIONS};
use crate::market::MarketSource;
use crate::model::{APP, DATA, EVOLUTION};
use crate::portfolio::{RecordValue, ViewPortfolio};
use crate::states::{build_fsm, DataUpdateAction, EvolutionAction, OptimizationAction, States};
use crate::uptime::{AppStarted, CountStart, HeartbeatPublisher, TouchUptime};
use anyhow::{Context, Result};
use pipeline_core::notify::{LogSink, NotificationSink, Notifier};
use pipeline_core::repository::{Backup, MemoryStorage, SqliteStorage, Storage};
use pipeline_core::{Bus, DagOptions, IgnoreErrors, IndefiniteBackoff, Runner, RunnerOptions, StateSender};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// The running pipeline: storage, bus, task runner and the state machine.
///
/// # Architecture
///
/// - **Bus**: routes `AppStarted`, `Heartbeat` and `PortfolioRevalued` events
///   and answers `PortfolioValue` requests
/// - **Runner**: runs evolution and optimization tasks
/// - **FSM**: cycles through data update, evolution and optimization
///
/// # Example
///
/// ```ignore
/// let system = PipelineSystem::start(&config, market).await?;
/// tokio::signal::ctrl_c().await?;
/// system.shutdown().await?;
/// ```
pub struct PipelineSystem {
    pub bus: Bus,
    states: StateSender<States>,
    runner: Arc<Runner>,
    fsm_cancel: CancellationToken,
    notifier_cancel: CancellationToken,
    fsm: JoinHandle<pipeline_core::Result<()>>,
    notifier: JoinHandle<()>,
}

fn open_storage(config: &Config) -> Result<Arc<dyn Storage>> {
    let storage: Arc<dyn Storage> = match &config.db_path {
        Some(path) => Arc::new(
            SqliteStorage::open(path).with_context(|| format!("can't open storage at {}", path.display()))?,
        ),
        None => {
            info!("PIPELINE_DB is not set, data is kept in memory");
            Arc::new(MemoryStorage::new())
        }
    };
    Ok(storage)
}

impl PipelineSystem {
    /// Wires every component and starts the state machine.
    pub async fn start(config: &Config, market: Arc<dyn MarketSource>) -> Result<Self> {
        Self::start_with(config, market, open_storage(config)?, Arc::new(LogSink)).await
    }

    /// Like [`start`](Self::start) with explicit storage and notification sink.
    /// Data missing from `storage` is restored from the backup directory first.
    pub async fn start_with(
        config: &Config,
        market: Arc<dyn MarketSource>,
        storage: Arc<dyn Storage>,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Self> {
        config.validate()?;

        // 0. Backup
        let backup = match &config.backup_dir {
            Some(dir) => {
                let backup = Backup::new(storage.clone(), dir);
                let restored = backup
                    .restore(DATA, &BACKUP_COLLECTIONS)
                    .await
                    .context("can't restore data backup")?;
                if restored > 0 {
                    info!(restored, "Data restored from {}", dir.display());
                }
                Some(backup)
            }
            None => None,
        };

        // 1. Notifications
        let notifier_cancel = CancellationToken::new();
        let (notifier, worker) = Notifier::new(sink, config.notify_interval);
        let notifier_handle = tokio::spawn(worker.run(notifier_cancel.clone()));

        // 2. Bus with handlers and publishers
        let retry = config.retry;
        let mut builder = Bus::builder(storage, notifier);
        builder
            .add_event_handler(APP, CountStart, move || IndefiniteBackoff::new(retry))
            .add_event_handler(APP, TouchUptime, IgnoreErrors::default)
            .add_event_handler(APP, RecordValue, move || IndefiniteBackoff::new(retry))
            .add_event_publisher(HeartbeatPublisher {
                interval: config.heartbeat,
            })
            .add_request_handler(DATA, ViewPortfolio)?;
        let bus = builder.build();

        // 3. Runner and state machine
        let runner = Arc::new(Runner::new(
            bus.ctx_factory(EVOLUTION),
            RunnerOptions {
                first_retry: config.retry,
            },
        ));
        let fsm_cancel = CancellationToken::new();
        let fsm = build_fsm(
            DataUpdateAction {
                factory: bus.ctx_factory(DATA),
                market,
                options: DagOptions {
                    first_retry: config.dag_retry,
                },
                cancel: fsm_cancel.clone(),
                backup,
            },
            EvolutionAction {
                runner: runner.clone(),
                factory: bus.ctx_factory(EVOLUTION),
                step: config.evolution_step,
            },
            OptimizationAction {
                runner: runner.clone(),
                factory: bus.ctx_factory(EVOLUTION),
            },
        )?;
        let states = fsm.sender();
        let fsm_handle = tokio::spawn(fsm.run(fsm_cancel.clone()));

        bus.publish(AppStarted {
            version: env!("CARGO_PKG_VERSION"),
        });
        info!("Pipeline started");

        Ok(Self {
            bus,
            states,
            runner,
            fsm_cancel,
            notifier_cancel,
            fsm: fsm_handle,
            notifier: notifier_handle,
        })
    }

    /// Requests a state change, e.g. an immediate data update.
    pub fn push_state(&self, state: States) {
        self.states.push(state);
    }

    /// Stops the state machine, then the runner, then the bus (publishers
    /// before handlers) and finally the notifier.
    ///
    /// The state machine and the runner are cancelled together, so a running
    /// state finishes early where it can. Its work, such as the nodes of a
    /// data update, completes before this returns.
    ///
    /// Returns an error if any background task panicked.
    pub async fn shutdown(self) -> Result<()> {
        info!("Shutting down pipeline...");

        self.fsm_cancel.cancel();
        self.runner.cancel();
        match self.fsm.await {
            Ok(result) => result.context("state machine failed")?,
            Err(err) => {
                error!("State machine task failed: {err:?}");
                return Err(err).context("state machine task failed");
            }
        }

        self.runner.shutdown().await;
        self.bus.shutdown().await;

        self.notifier_cancel.cancel();
        self.notifier.await.context("notifier task failed")?;

        info!("Pipeline shutdown complete.");
        Ok(())
    }
}

/// Runs a single data update outside of the state machine.
pub async fn update_once(
    config: &Config,
    bus: &Bus,
    market: Arc<dyn MarketSource>,
    day: chrono::NaiveDate,
) -> Result<()> {
    let dag = update_dag(
        bus.ctx_factory(DATA),
        market,
        day,
        DagOptions {
            first_retry: config.dag_retry,
        },
    )?;
    dag.run(&CancellationToken::new()).await?;
    Ok(())
}
