//! # Market Data Update
//!
//! Entities of the `data` subdomain and the DAG that refreshes them once per
//! trading day.
//!
//! ```text
//! cpi (ignore errors)
//! indexes ───────────────────────────────┐
//! securities ─┬─ quotes ── portfolio ────┼── trading day
//! usd ────────┴─ dividends ──────────────┘
//! ```

mod nodes;

pub use nodes::{
    UpdateCpi, UpdateDividends, UpdateIndex, UpdatePortfolio, UpdateQuotes, UpdateSecurities, UpdateTradingDay,
    UpdateUsd,
};

use crate::market::MarketSource;
use crate::model::{day_start, Bar};
use crate::portfolio::Portfolio;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use pipeline_core::{Component, CtxFactory, Dag, DagOptions, Result, Revision};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Last trading day for which all data was loaded.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingDay {
    pub rev: Revision,
    pub timestamp: DateTime<Utc>,
    pub last: Option<NaiveDate>,
}

crate::entity!(TradingDay);

impl TradingDay {
    /// Whether data for `day` still has to be loaded.
    pub fn needs_update(&self, day: NaiveDate) -> bool {
        self.last.map_or(true, |last| last < day)
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Securities {
    pub rev: Revision,
    pub timestamp: DateTime<Utc>,
    pub tickers: Vec<String>,
}

crate::entity!(Securities);

/// Daily closes of one ticker, index or currency.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Quotes {
    pub rev: Revision,
    pub timestamp: DateTime<Utc>,
    pub bars: Vec<Bar>,
}

crate::entity!(Quotes);

impl Quotes {
    pub fn last_close(&self) -> Option<f64> {
        self.bars.last().map(|bar| bar.close)
    }

    /// Appends a close for a day later than any stored one.
    pub fn append(&mut self, day: NaiveDate, close: f64) {
        if self.bars.last().is_some_and(|bar| bar.day >= day) {
            return;
        }
        self.bars.push(Bar { day, close });
        self.timestamp = day_start(day);
    }
}

/// Yearly dividend per share in rubles.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Dividends {
    pub rev: Revision,
    pub timestamp: DateTime<Utc>,
    pub yearly: f64,
}

crate::entity!(Dividends);

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Cpi {
    pub rev: Revision,
    pub timestamp: DateTime<Utc>,
    pub monthly: Option<f64>,
}

crate::entity!(Cpi);

/// Collections of the data subdomain that are backed up after each update.
pub const BACKUP_COLLECTIONS: [&str; 6] = [
    TradingDay::NAME,
    Securities::NAME,
    Quotes::NAME,
    Dividends::NAME,
    Cpi::NAME,
    Portfolio::NAME,
];

/// Scratch state shared by the nodes of one update run.
///
/// Every field has its own lock: nodes that run in parallel touch disjoint
/// fields.
#[derive(Debug)]
pub struct UpdateState {
    pub day: NaiveDate,
    pub tickers: Mutex<Vec<String>>,
    pub usd: Mutex<Option<f64>>,
    pub closes: Mutex<BTreeMap<String, f64>>,
    pub dividends: Mutex<BTreeMap<String, f64>>,
}

impl UpdateState {
    pub fn new(day: NaiveDate) -> Self {
        Self {
            day,
            tickers: Mutex::default(),
            usd: Mutex::default(),
            closes: Mutex::default(),
            dividends: Mutex::default(),
        }
    }
}

/// Wires the update graph for `day`.
pub fn update_dag(
    factory: CtxFactory,
    market: Arc<dyn MarketSource>,
    day: NaiveDate,
    options: DagOptions,
) -> Result<Dag<UpdateState>> {
    let dag = Dag::new(factory, UpdateState::new(day), options);

    dag.add_node_ignore_errors(UpdateCpi(market.clone()), &[])?;
    let index = dag.add_node_with_retry(UpdateIndex(market.clone()), &[])?;
    let securities = dag.add_node_with_retry(UpdateSecurities(market.clone()), &[])?;
    let usd = dag.add_node_with_retry(UpdateUsd(market.clone()), &[])?;

    let quotes = dag.add_node_with_retry(UpdateQuotes(market.clone()), &[securities])?;
    let dividends = dag.add_node_with_retry(UpdateDividends(market), &[securities, usd])?;

    let portfolio = dag.add_node_with_retry(UpdatePortfolio, &[quotes])?;

    dag.add_node_with_retry(UpdateTradingDay, &[index, dividends, portfolio])?;

    Ok(dag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_never_go_back_in_time() {
        let day = NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();
        let mut quotes = Quotes::default();
        quotes.append(day, 10.0);
        quotes.append(day, 11.0);
        quotes.append(day.pred_opt().unwrap(), 9.0);

        assert_eq!(quotes.bars, vec![Bar { day, close: 10.0 }]);
        assert_eq!(quotes.timestamp, day_start(day));
    }

    #[test]
    fn trading_day_needs_update_for_later_days() {
        let day = NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();
        let mut trading_day = TradingDay::default();
        assert!(trading_day.needs_update(day));

        trading_day.last = Some(day);
        assert!(!trading_day.needs_update(day));
        assert!(trading_day.needs_update(day.succ_opt().unwrap()));
    }
}
