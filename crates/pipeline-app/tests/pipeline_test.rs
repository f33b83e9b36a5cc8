use async_trait::async_trait;
use chrono::NaiveDate;
use pipeline_app::config::Config;
use pipeline_app::data::{Quotes, TradingDay};
use pipeline_app::evolution::Evolution;
use pipeline_app::lifecycle::{update_once, PipelineSystem};
use pipeline_app::market::{Dividend, MarketError, MarketSource, INDEX_TICKER, USD_TICKER};
use pipeline_app::model::{APP, DATA};
use pipeline_app::portfolio::{PortfolioValue, RecordValue, ValueHistory, ViewPortfolio, INITIAL_CASH};
use pipeline_app::states::{DataUpdateAction, States};
use pipeline_core::mock::{recording_notifier, RecordingSink};
use pipeline_core::repository::{MemoryStorage, Storage};
use pipeline_core::{Bus, Component, DagOptions, IgnoreErrors, StateAction, Uid};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 6, 10).unwrap()
}

/// Deterministic market: the securities list fails a few times, CPI never works.
struct FakeMarket {
    securities_failures: AtomicU32,
    securities_calls: AtomicU32,
    close_delay: Duration,
}

impl FakeMarket {
    fn new(securities_failures: u32) -> Arc<Self> {
        Arc::new(Self {
            securities_failures: AtomicU32::new(securities_failures),
            securities_calls: AtomicU32::new(0),
            close_delay: Duration::ZERO,
        })
    }

    /// Every close price takes `delay` to arrive.
    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            securities_failures: AtomicU32::new(0),
            securities_calls: AtomicU32::new(0),
            close_delay: delay,
        })
    }
}

#[async_trait]
impl MarketSource for FakeMarket {
    async fn last_trading_day(&self) -> Result<NaiveDate, MarketError> {
        Ok(day())
    }

    async fn securities(&self) -> Result<Vec<String>, MarketError> {
        self.securities_calls.fetch_add(1, Ordering::SeqCst);
        let left = self.securities_failures.load(Ordering::SeqCst);
        if left > 0 {
            self.securities_failures.store(left - 1, Ordering::SeqCst);
            return Err(MarketError::Unavailable("securities list"));
        }
        Ok(vec!["SBER".into(), "GAZP".into()])
    }

    async fn close(&self, ticker: &str, _day: NaiveDate) -> Result<f64, MarketError> {
        tokio::time::sleep(self.close_delay).await;
        Ok(match ticker {
            "SBER" => 300.0,
            "GAZP" => 150.0,
            USD_TICKER => 90.0,
            INDEX_TICKER => 6000.0,
            _ => 1.0,
        })
    }

    async fn dividend(&self, ticker: &str) -> Result<Dividend, MarketError> {
        Ok(Dividend {
            amount: if ticker == "SBER" { 30.0 } else { 1.0 },
            in_usd: ticker == "GAZP",
        })
    }

    async fn cpi(&self) -> Result<f64, MarketError> {
        Err(MarketError::Unavailable("cpi"))
    }
}

async fn load_field(storage: &dyn Storage, subdomain: &str, collection: &str, uid: &str) -> Option<serde_json::Value> {
    storage
        .load(subdomain, collection, &Uid::new(uid))
        .await
        .unwrap()
        .map(|doc| serde_json::Value::Object(doc.fields))
}

fn test_bus(storage: Arc<dyn Storage>) -> Bus {
    let (notifier, _) = recording_notifier(CancellationToken::new());
    let mut builder = Bus::builder(storage, notifier);
    builder
        .add_event_handler(APP, RecordValue, IgnoreErrors::default)
        .add_request_handler(DATA, ViewPortfolio)
        .unwrap();
    builder.build()
}

#[tokio::test(start_paused = true)]
async fn update_dag_loads_data_and_revalues_portfolio() {
    let storage = Arc::new(MemoryStorage::new());
    let bus = test_bus(storage.clone());
    let market = FakeMarket::new(2);

    update_once(&Config::default(), &bus, market.clone(), day()).await.unwrap();
    bus.drain().await;

    assert_eq!(market.securities_calls.load(Ordering::SeqCst), 3);

    let trading_day = load_field(storage.as_ref(), "data", TradingDay::NAME, TradingDay::NAME).await.unwrap();
    assert_eq!(trading_day["last"], "2024-06-10");

    let sber = load_field(storage.as_ref(), "data", Quotes::NAME, "SBER").await.unwrap();
    assert_eq!(sber["bars"][0]["close"], 300.0);
    assert!(load_field(storage.as_ref(), "data", Quotes::NAME, USD_TICKER).await.is_some());

    let gazp_dividends = load_field(storage.as_ref(), "data", "Dividends", "GAZP").await.unwrap();
    assert_eq!(gazp_dividends["yearly"], 90.0);

    // CPI is ignored when it fails.
    assert!(load_field(storage.as_ref(), "data", "Cpi", "Cpi").await.is_none());

    let view = bus.request(PortfolioValue).await.unwrap();
    assert_eq!(view.day, Some(day()));
    assert_eq!(view.value, INITIAL_CASH);
    assert_eq!(view.prices.len(), 2);

    let history = load_field(storage.as_ref(), "app", ValueHistory::NAME, ValueHistory::NAME).await.unwrap();
    assert_eq!(history["values"]["2024-06-10"], INITIAL_CASH);
    bus.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn data_update_runs_once_per_trading_day() {
    let storage = Arc::new(MemoryStorage::new());
    let bus = test_bus(storage.clone());
    let action = DataUpdateAction {
        factory: bus.ctx_factory(DATA),
        market: FakeMarket::new(0),
        options: DagOptions::default(),
        cancel: CancellationToken::new(),
        backup: None,
    };

    assert_eq!(action.enter().await, States::Optimization);
    assert_eq!(action.enter().await, States::EvolutionStep);
    bus.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_trading_day_check_moves_on_to_evolution() {
    struct Closed;

    #[async_trait]
    impl MarketSource for Closed {
        async fn last_trading_day(&self) -> Result<NaiveDate, MarketError> {
            Err(MarketError::Unavailable("trading calendar"))
        }
        async fn securities(&self) -> Result<Vec<String>, MarketError> {
            unreachable!()
        }
        async fn close(&self, _: &str, _: NaiveDate) -> Result<f64, MarketError> {
            unreachable!()
        }
        async fn dividend(&self, _: &str) -> Result<Dividend, MarketError> {
            unreachable!()
        }
        async fn cpi(&self) -> Result<f64, MarketError> {
            unreachable!()
        }
    }

    let bus = test_bus(Arc::new(MemoryStorage::new()));
    let action = DataUpdateAction {
        factory: bus.ctx_factory(DATA),
        market: Arc::new(Closed),
        options: DagOptions::default(),
        cancel: CancellationToken::new(),
        backup: None,
    };
    assert_eq!(action.enter().await, States::EvolutionStep);
}

#[tokio::test(start_paused = true)]
async fn system_cycles_and_shuts_down_cleanly() {
    let storage = Arc::new(MemoryStorage::new());
    let sink = RecordingSink::default();
    let config = Config {
        evolution_step: Duration::from_secs(1),
        heartbeat: Duration::from_secs(1),
        ..Config::default()
    };

    let system = PipelineSystem::start_with(&config, FakeMarket::new(0), storage.clone(), Arc::new(sink))
        .await
        .unwrap();
    system.push_state(States::EvolutionStep);
    tokio::time::sleep(Duration::from_secs(10)).await;

    let view = system.bus.request(PortfolioValue).await.unwrap();
    assert_eq!(view.day, Some(day()));
    system.shutdown().await.unwrap();

    let uptime = load_field(storage.as_ref(), "app", "Uptime", "Uptime").await.unwrap();
    assert_eq!(uptime["starts"], 1);
    assert!(!uptime["last_heartbeat"].is_null());

    let evolution = load_field(storage.as_ref(), "evolution", Evolution::NAME, Evolution::NAME).await.unwrap();
    assert!(evolution["generation"].as_u64().unwrap() >= 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_waits_for_running_data_update() {
    let storage = Arc::new(MemoryStorage::new());
    let market = FakeMarket::slow(Duration::from_secs(5));
    let system = PipelineSystem::start_with(
        &Config::default(),
        market,
        storage.clone(),
        Arc::new(RecordingSink::default()),
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    let started = tokio::time::Instant::now();
    system.shutdown().await.unwrap();
    assert!(started.elapsed() >= Duration::from_secs(4));

    // Nodes that were running finished and committed, their dependents never started.
    let index = load_field(storage.as_ref(), "data", Quotes::NAME, INDEX_TICKER).await.unwrap();
    assert_eq!(index["bars"][0]["close"], 6000.0);
    assert!(load_field(storage.as_ref(), "data", TradingDay::NAME, TradingDay::NAME).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn updated_data_is_backed_up_and_restored_into_fresh_storage() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        backup_dir: Some(dir.path().to_path_buf()),
        ..Config::default()
    };

    let storage = Arc::new(MemoryStorage::new());
    let system = PipelineSystem::start_with(&config, FakeMarket::new(0), storage.clone(), Arc::new(RecordingSink::default()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;
    system.shutdown().await.unwrap();
    assert!(dir.path().join("data").join("Quotes.json").exists());

    let fresh = Arc::new(MemoryStorage::new());
    let system = PipelineSystem::start_with(&config, FakeMarket::new(0), fresh.clone(), Arc::new(RecordingSink::default()))
        .await
        .unwrap();
    system.shutdown().await.unwrap();

    let trading_day = load_field(fresh.as_ref(), "data", TradingDay::NAME, TradingDay::NAME).await.unwrap();
    assert_eq!(trading_day["last"], "2024-06-10");
    let sber = load_field(fresh.as_ref(), "data", Quotes::NAME, "SBER").await.unwrap();
    assert_eq!(sber["bars"][0]["close"], 300.0);
}

#[tokio::test]
async fn zero_notify_interval_is_rejected_at_start() {
    let config = Config {
        notify_interval: Duration::ZERO,
        ..Config::default()
    };
    let result = PipelineSystem::start_with(
        &config,
        FakeMarket::new(0),
        Arc::new(MemoryStorage::new()),
        Arc::new(RecordingSink::default()),
    )
    .await;
    assert!(result.is_err());
}
