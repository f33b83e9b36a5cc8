//! # Pipeline States
//!
//! The top-level state machine:
//!
//! | From            | To                                                  |
//! |-----------------|-----------------------------------------------------|
//! | `DataUpdate`    | `Optimization` after new data, else `EvolutionStep` |
//! | `EvolutionStep` | `Optimization` now and then, else `DataUpdate`      |
//! | `Optimization`  | `EvolutionStep`                                     |

use crate::data::{update_dag, TradingDay, BACKUP_COLLECTIONS};
use crate::evolution::{EvolveStep, Optimize};
use crate::market::MarketSource;
use crate::model::DATA;
use async_trait::async_trait;
use chrono::NaiveDate;
use pipeline_core::repository::Backup;
use pipeline_core::{CtxFactory, DagOptions, Error, Fsm, FsmBuilder, Result, Runner, StateAction, Uid};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum States {
    DataUpdate,
    EvolutionStep,
    Optimization,
}

/// Chance of optimizing the portfolio after an evolution step.
const OPTIMIZATION_PROBABILITY: f64 = 0.1;

/// Checks for a new trading day and, if there is one, runs the update DAG.
/// A completed update is backed up when `backup` is set.
pub struct DataUpdateAction {
    pub factory: CtxFactory,
    pub market: Arc<dyn MarketSource>,
    pub options: DagOptions,
    pub cancel: CancellationToken,
    pub backup: Option<Backup>,
}

impl DataUpdateAction {
    async fn update_day(&self) -> Result<Option<NaiveDate>> {
        let day = self.market.last_trading_day().await?;
        let ctx = self.factory.create("DataUpdate");
        let trading_day = ctx.get::<TradingDay>(Uid::singleton::<TradingDay>(), false).await?;
        let needs_update = trading_day.lock().await.needs_update(day);
        Ok(needs_update.then_some(day))
    }

    async fn update(&self) -> Result<States> {
        let Some(day) = self.update_day().await? else {
            return Ok(States::EvolutionStep);
        };

        let dag = update_dag(self.factory.clone(), self.market.clone(), day, self.options.clone())?;
        dag.run(&self.cancel).await?;
        if self.cancel.is_cancelled() {
            return Ok(States::EvolutionStep);
        }

        if let Some(backup) = &self.backup {
            if let Err(err) = backup.backup(DATA, &BACKUP_COLLECTIONS).await {
                self.factory.warn("DataUpdate", format!("backup failed - {err}"));
            }
        }
        Ok(States::Optimization)
    }
}

#[async_trait]
impl StateAction<States> for DataUpdateAction {
    async fn enter(&self) -> States {
        match self.update().await {
            Ok(next) => next,
            Err(err) => {
                self.factory.warn("DataUpdate", format!("failed - {err}"));
                States::EvolutionStep
            }
        }
    }
}

/// The runner warns about every failed attempt itself. A task that died
/// outside of an attempt is reported here.
fn report_lost_task<R>(factory: &CtxFactory, task: &str, result: Result<R>) {
    if let Err(err @ Error::Panicked(_)) = result {
        factory.warn(task, format!("task died - {err}"));
    }
}

pub struct EvolutionAction {
    pub runner: Arc<Runner>,
    pub factory: CtxFactory,
    pub step: Duration,
}

#[async_trait]
impl StateAction<States> for EvolutionAction {
    async fn enter(&self) -> States {
        let step = EvolveStep { duration: self.step };
        let result = self.runner.run_with_retry(step, ()).join().await;
        report_lost_task(&self.factory, "EvolveStep", result);

        if rand::thread_rng().gen_bool(OPTIMIZATION_PROBABILITY) {
            States::Optimization
        } else {
            States::DataUpdate
        }
    }
}

pub struct OptimizationAction {
    pub runner: Arc<Runner>,
    pub factory: CtxFactory,
}

#[async_trait]
impl StateAction<States> for OptimizationAction {
    async fn enter(&self) -> States {
        let result = self.runner.run_shielded(Optimize, ()).join().await;
        report_lost_task(&self.factory, "Optimize", result);
        States::EvolutionStep
    }
}

pub fn build_fsm(
    data_update: DataUpdateAction,
    evolution: EvolutionAction,
    optimization: OptimizationAction,
) -> Result<Fsm<States>> {
    let mut builder = FsmBuilder::new();
    builder
        .state(
            States::DataUpdate,
            data_update,
            [States::EvolutionStep, States::Optimization],
        )
        .state(
            States::EvolutionStep,
            evolution,
            [States::DataUpdate, States::Optimization],
        )
        .state(States::Optimization, optimization, [States::EvolutionStep]);
    builder.build()
}
