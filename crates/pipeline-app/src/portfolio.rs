//! # Portfolio
//!
//! The portfolio entity, the request other subdomains use to look at it, and
//! the handler that keeps a history of its value.

use crate::model::day_start;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use pipeline_core::{Ctx, Error, Event, EventHandler, Request, RequestHandler, Result, Revision, Uid};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

pub const INITIAL_CASH: f64 = 1_000_000.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Portfolio {
    pub rev: Revision,
    pub timestamp: DateTime<Utc>,
    pub day: Option<NaiveDate>,
    pub cash: f64,
    pub positions: BTreeMap<String, u64>,
    pub prices: BTreeMap<String, f64>,
    pub value: f64,
}

crate::entity!(Portfolio);

impl Default for Portfolio {
    fn default() -> Self {
        Self {
            rev: Revision::default(),
            timestamp: DateTime::<Utc>::default(),
            day: None,
            cash: INITIAL_CASH,
            positions: BTreeMap::new(),
            prices: BTreeMap::new(),
            value: INITIAL_CASH,
        }
    }
}

impl Portfolio {
    /// Prices every position with the closes of `day` and returns the total value.
    pub fn revalue(&mut self, day: NaiveDate, closes: &BTreeMap<String, f64>) -> Result<f64> {
        let mut value = self.cash;
        for (ticker, shares) in &self.positions {
            let close = closes
                .get(ticker)
                .or_else(|| self.prices.get(ticker))
                .ok_or_else(|| Error::domain(format!("no price for {ticker}")))?;
            value += *shares as f64 * close;
        }

        self.prices.extend(closes.iter().map(|(ticker, close)| (ticker.clone(), *close)));
        self.value = value;
        self.day = Some(day);
        self.timestamp = day_start(day);
        Ok(value)
    }

    pub fn weights(&self) -> BTreeMap<String, f64> {
        if self.value <= 0.0 {
            return BTreeMap::new();
        }
        self.positions
            .iter()
            .filter_map(|(ticker, shares)| {
                let price = self.prices.get(ticker)?;
                Some((ticker.clone(), *shares as f64 * price / self.value))
            })
            .collect()
    }
}

/// Published after the portfolio was revalued with fresh quotes.
#[derive(Debug, Clone)]
pub struct PortfolioRevalued {
    pub day: NaiveDate,
    pub value: f64,
    pub ver: u64,
}

crate::component!(PortfolioRevalued);

impl Event for PortfolioRevalued {}

/// Asks for the current state of the portfolio.
#[derive(Debug)]
pub struct PortfolioValue;

crate::component!(PortfolioValue);

impl Request for PortfolioValue {
    type Response = PortfolioView;
}

#[derive(Debug, Clone, PartialEq)]
pub struct PortfolioView {
    pub day: Option<NaiveDate>,
    pub cash: f64,
    pub value: f64,
    pub prices: BTreeMap<String, f64>,
    pub weights: BTreeMap<String, f64>,
}

pub struct ViewPortfolio;

#[async_trait]
impl RequestHandler<PortfolioValue> for ViewPortfolio {
    async fn handle(&self, ctx: &Ctx, _request: PortfolioValue) -> Result<PortfolioView> {
        let portfolio = ctx.get::<Portfolio>(Uid::singleton::<Portfolio>(), false).await?;
        let portfolio = portfolio.lock().await;

        Ok(PortfolioView {
            day: portfolio.day,
            cash: portfolio.cash,
            value: portfolio.value,
            prices: portfolio.prices.clone(),
            weights: portfolio.weights(),
        })
    }
}

/// Value of the portfolio per trading day.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValueHistory {
    pub rev: Revision,
    pub timestamp: DateTime<Utc>,
    pub values: BTreeMap<NaiveDate, f64>,
}

crate::entity!(ValueHistory);

pub struct RecordValue;

#[async_trait]
impl EventHandler<PortfolioRevalued> for RecordValue {
    async fn handle(&self, ctx: &Ctx, event: &PortfolioRevalued) -> Result<()> {
        let history = ctx.get::<ValueHistory>(Uid::singleton::<ValueHistory>(), true).await?;
        let mut history = history.lock().await;

        debug!(day = %event.day, value = event.value, "Recording portfolio value");
        history.values.insert(event.day, event.value);
        history.timestamp = history.timestamp.max(day_start(event.day));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revalue_uses_fresh_closes_then_known_prices() {
        let day = NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();
        let mut portfolio = Portfolio {
            cash: 100.0,
            ..Portfolio::default()
        };
        portfolio.positions.insert("SBER".into(), 10);
        portfolio.positions.insert("GAZP".into(), 5);
        portfolio.prices.insert("GAZP".into(), 20.0);

        let closes = BTreeMap::from([("SBER".to_string(), 30.0)]);
        assert_eq!(portfolio.revalue(day, &closes).unwrap(), 100.0 + 300.0 + 100.0);
        assert_eq!(portfolio.weights()["SBER"], 0.6);
        assert_eq!(portfolio.timestamp, day_start(day));
    }

    #[test]
    fn revalue_fails_without_any_price() {
        let mut portfolio = Portfolio::default();
        portfolio.positions.insert("LKOH".into(), 1);
        let day = NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();
        assert!(portfolio.revalue(day, &BTreeMap::new()).is_err());
    }
}
