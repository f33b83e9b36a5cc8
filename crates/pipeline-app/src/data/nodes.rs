use super::{Cpi, Dividends, Quotes, Securities, TradingDay, UpdateState};
use crate::market::{MarketSource, INDEX_TICKER, USD_TICKER};
use crate::model::day_start;
use crate::portfolio::{Portfolio, PortfolioRevalued};
use async_trait::async_trait;
use pipeline_core::{gather, Ctx, Entity, Error, NodeAction, Result, Uid};
use std::sync::Arc;

async fn append_close(ctx: &Ctx, ticker: &str, state: &UpdateState, close: f64) -> Result<()> {
    let quotes = ctx.get::<Quotes>(ticker, true).await?;
    quotes.lock().await.append(state.day, close);
    Ok(())
}

pub struct UpdateCpi(pub Arc<dyn MarketSource>);

#[async_trait]
impl NodeAction<UpdateState> for UpdateCpi {
    async fn run(&self, ctx: &Ctx, state: &UpdateState) -> Result<bool> {
        let monthly = self.0.cpi().await?;
        let cpi = ctx.get::<Cpi>(Uid::singleton::<Cpi>(), true).await?;
        let mut cpi = cpi.lock().await;
        cpi.monthly = Some(monthly);
        cpi.timestamp = cpi.timestamp.max(day_start(state.day));
        Ok(true)
    }
}

pub struct UpdateIndex(pub Arc<dyn MarketSource>);

#[async_trait]
impl NodeAction<UpdateState> for UpdateIndex {
    async fn run(&self, ctx: &Ctx, state: &UpdateState) -> Result<bool> {
        let close = self.0.close(INDEX_TICKER, state.day).await?;
        append_close(ctx, INDEX_TICKER, state, close).await?;
        Ok(true)
    }
}

pub struct UpdateUsd(pub Arc<dyn MarketSource>);

#[async_trait]
impl NodeAction<UpdateState> for UpdateUsd {
    async fn run(&self, ctx: &Ctx, state: &UpdateState) -> Result<bool> {
        let rate = self.0.close(USD_TICKER, state.day).await?;
        append_close(ctx, USD_TICKER, state, rate).await?;
        *state.usd.lock() = Some(rate);
        Ok(true)
    }
}

pub struct UpdateSecurities(pub Arc<dyn MarketSource>);

#[async_trait]
impl NodeAction<UpdateState> for UpdateSecurities {
    async fn run(&self, ctx: &Ctx, state: &UpdateState) -> Result<bool> {
        let tickers = self.0.securities().await?;
        if tickers.is_empty() {
            return Err(Error::domain("securities list is empty"));
        }

        let securities = ctx.get::<Securities>(Uid::singleton::<Securities>(), true).await?;
        let mut securities = securities.lock().await;
        securities.tickers = tickers.clone();
        securities.timestamp = securities.timestamp.max(day_start(state.day));

        *state.tickers.lock() = tickers;
        Ok(true)
    }
}

pub struct UpdateQuotes(pub Arc<dyn MarketSource>);

#[async_trait]
impl NodeAction<UpdateState> for UpdateQuotes {
    async fn run(&self, ctx: &Ctx, state: &UpdateState) -> Result<bool> {
        let tickers = state.tickers.lock().clone();
        let market = &self.0;

        let futures: Vec<_> = tickers
            .iter()
            .map(|ticker| async move {
                let close = market.close(ticker, state.day).await?;
                append_close(ctx, ticker, state, close).await?;
                Ok::<_, Error>((ticker.clone(), close))
            })
            .collect();
        let closes = gather(futures).await?;

        ctx.info(format!("{} quotes updated for {}", closes.len(), state.day));
        state.closes.lock().extend(closes);
        Ok(true)
    }
}

pub struct UpdateDividends(pub Arc<dyn MarketSource>);

#[async_trait]
impl NodeAction<UpdateState> for UpdateDividends {
    async fn run(&self, ctx: &Ctx, state: &UpdateState) -> Result<bool> {
        let usd = state
            .usd
            .lock()
            .ok_or_else(|| Error::domain("usd rate is missing"))?;
        let tickers = state.tickers.lock().clone();
        let market = &self.0;

        let futures: Vec<_> = tickers
            .iter()
            .map(|ticker| async move {
                let dividend = market.dividend(ticker).await?;
                let rub = if dividend.in_usd { dividend.amount * usd } else { dividend.amount };

                let dividends = ctx.get::<Dividends>(ticker.as_str(), true).await?;
                let mut dividends = dividends.lock().await;
                dividends.yearly = rub;
                dividends.timestamp = dividends.timestamp.max(day_start(state.day));
                Ok::<_, Error>((ticker.clone(), rub))
            })
            .collect();
        let yearly = gather(futures).await?;

        state.dividends.lock().extend(yearly);
        Ok(true)
    }
}

pub struct UpdatePortfolio;

#[async_trait]
impl NodeAction<UpdateState> for UpdatePortfolio {
    async fn run(&self, ctx: &Ctx, state: &UpdateState) -> Result<bool> {
        let closes = state.closes.lock().clone();
        let portfolio = ctx.get::<Portfolio>(Uid::singleton::<Portfolio>(), true).await?;
        let mut portfolio = portfolio.lock().await;

        let value = portfolio.revalue(state.day, &closes)?;
        ctx.publish(PortfolioRevalued {
            day: state.day,
            value,
            ver: portfolio.ver() + 1,
        });
        Ok(true)
    }
}

pub struct UpdateTradingDay;

#[async_trait]
impl NodeAction<UpdateState> for UpdateTradingDay {
    async fn run(&self, ctx: &Ctx, state: &UpdateState) -> Result<bool> {
        let trading_day = ctx.get::<TradingDay>(Uid::singleton::<TradingDay>(), true).await?;
        let mut trading_day = trading_day.lock().await;
        trading_day.last = Some(state.day);
        trading_day.timestamp = day_start(state.day);
        ctx.info(format!("data updated for {}", state.day));
        Ok(true)
    }
}
