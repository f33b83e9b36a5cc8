//! # Model Evolution
//!
//! Background work done between data updates: a step of the model search and
//! the portfolio optimization that uses its results.

use crate::portfolio::PortfolioValue;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pipeline_core::{Action, Ctx, Result, Revision, Uid};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Progress of the model search.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Evolution {
    pub rev: Revision,
    pub timestamp: DateTime<Utc>,
    pub generation: u64,
    pub best_score: Option<f64>,
}

crate::entity!(Evolution);

/// Trains and scores one candidate model. Returns the generation number.
pub struct EvolveStep {
    pub duration: Duration,
}

#[async_trait]
impl Action<(), u64> for EvolveStep {
    async fn call(&self, ctx: &Ctx, _args: ()) -> Result<u64> {
        tokio::time::sleep(self.duration).await;
        let score: f64 = rand::thread_rng().gen_range(0.0..1.0);

        let evolution = ctx.get::<Evolution>(Uid::singleton::<Evolution>(), true).await?;
        let mut evolution = evolution.lock().await;
        evolution.generation += 1;
        if evolution.best_score.map_or(true, |best| score > best) {
            evolution.best_score = Some(score);
            ctx.info(format!("new best score {score:.4} in generation {}", evolution.generation));
        }
        Ok(evolution.generation)
    }
}

/// Minimal weight change worth suggesting.
const MIN_TRADE: f64 = 0.01;

/// Compares current weights with an equal-weight target and suggests trades.
pub struct Optimize;

#[async_trait]
impl Action<(), Vec<String>> for Optimize {
    async fn call(&self, ctx: &Ctx, _args: ()) -> Result<Vec<String>> {
        let view = ctx.request(PortfolioValue).await?;
        if view.prices.is_empty() {
            ctx.info("no quotes yet, nothing to optimize");
            return Ok(Vec::new());
        }

        let target = 1.0 / view.prices.len() as f64;
        let suggestions: Vec<String> = view
            .prices
            .keys()
            .filter_map(|ticker| {
                let current = view.weights.get(ticker).copied().unwrap_or_default();
                let change = target - current;
                if change.abs() < MIN_TRADE {
                    return None;
                }
                let side = if change > 0.0 { "buy" } else { "sell" };
                Some(format!("{side} {ticker} {:.1}%", change.abs() * 100.0))
            })
            .collect();

        for suggestion in &suggestions {
            ctx.info(suggestion);
        }
        Ok(suggestions)
    }
}
