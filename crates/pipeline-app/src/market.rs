//! # Market Data Source
//!
//! The pipeline pulls everything it knows about the market through the
//! [`MarketSource`] trait. Production deployments plug in an exchange client;
//! the bundled [`SyntheticMarket`] generates a random walk so the pipeline can
//! run offline.

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Utc, Weekday};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;

pub const INDEX_TICKER: &str = "MCFTRR";
pub const USD_TICKER: &str = "USD000UTSTOM";

#[derive(Debug, thiserror::Error)]
pub enum MarketError {
    #[error("{0} is unavailable")]
    Unavailable(&'static str),
    #[error("no quotes for {ticker} on {day}")]
    NoQuotes { ticker: String, day: NaiveDate },
}

impl From<MarketError> for pipeline_core::Error {
    fn from(err: MarketError) -> Self {
        pipeline_core::Error::domain(err)
    }
}

/// Yearly dividend of one security.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dividend {
    pub amount: f64,
    pub in_usd: bool,
}

#[async_trait]
pub trait MarketSource: Send + Sync + 'static {
    async fn last_trading_day(&self) -> Result<NaiveDate, MarketError>;

    async fn securities(&self) -> Result<Vec<String>, MarketError>;

    async fn close(&self, ticker: &str, day: NaiveDate) -> Result<f64, MarketError>;

    async fn dividend(&self, ticker: &str) -> Result<Dividend, MarketError>;

    /// Latest monthly consumer price index change.
    async fn cpi(&self) -> Result<f64, MarketError>;
}

/// Offline market: a random walk per ticker and occasional outages.
pub struct SyntheticMarket {
    tickers: Vec<String>,
    outage_rate: f64,
    prices: Mutex<HashMap<String, f64>>,
}

impl SyntheticMarket {
    pub fn new(tickers: Vec<String>, outage_rate: f64) -> Self {
        Self {
            tickers,
            outage_rate: outage_rate.clamp(0.0, 1.0),
            prices: Mutex::default(),
        }
    }

    fn check(&self, source: &'static str) -> Result<(), MarketError> {
        if rand::thread_rng().gen_bool(self.outage_rate) {
            return Err(MarketError::Unavailable(source));
        }
        Ok(())
    }
}

/// Last weekday not later than today.
fn last_weekday(mut day: NaiveDate) -> NaiveDate {
    while matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
        day = day.pred_opt().unwrap_or(day);
    }
    day
}

#[async_trait]
impl MarketSource for SyntheticMarket {
    async fn last_trading_day(&self) -> Result<NaiveDate, MarketError> {
        self.check("trading calendar")?;
        Ok(last_weekday(Utc::now().date_naive()))
    }

    async fn securities(&self) -> Result<Vec<String>, MarketError> {
        self.check("securities list")?;
        Ok(self.tickers.clone())
    }

    async fn close(&self, ticker: &str, day: NaiveDate) -> Result<f64, MarketError> {
        self.check("quotes")?;
        if matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
            return Err(MarketError::NoQuotes {
                ticker: ticker.to_string(),
                day,
            });
        }

        let step: f64 = rand::thread_rng().gen_range(-0.03..0.03);
        let mut prices = self.prices.lock();
        let price = prices.entry(ticker.to_string()).or_insert(100.0);
        *price *= 1.0 + step;
        Ok(*price)
    }

    async fn dividend(&self, ticker: &str) -> Result<Dividend, MarketError> {
        self.check("dividends")?;
        let mut rng = rand::thread_rng();
        Ok(Dividend {
            amount: rng.gen_range(0.0..10.0),
            in_usd: ticker.len() % 2 == 0,
        })
    }

    async fn cpi(&self) -> Result<f64, MarketError> {
        self.check("cpi")?;
        Ok(rand::thread_rng().gen_range(0.99..1.02))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weekends_roll_back_to_friday() {
        let sunday = NaiveDate::from_ymd_opt(2024, 6, 9).unwrap();
        assert_eq!(last_weekday(sunday), NaiveDate::from_ymd_opt(2024, 6, 7).unwrap());
    }

    #[tokio::test]
    async fn synthetic_market_without_outages_always_answers() {
        let market = SyntheticMarket::new(vec!["SBER".into()], 0.0);
        let monday = NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();
        assert!(market.close("SBER", monday).await.unwrap() > 0.0);
        assert_eq!(market.securities().await.unwrap(), vec!["SBER"]);
    }
}
