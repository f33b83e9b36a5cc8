use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite file; in-memory storage when unset.
    pub db_path: Option<PathBuf>,
    /// Directory of data backups; backups are off when unset.
    pub backup_dir: Option<PathBuf>,
    pub log_level: String,
    pub retry: Duration,
    pub dag_retry: Duration,
    pub notify_interval: Duration,
    pub evolution_step: Duration,
    pub heartbeat: Duration,
    pub tickers: Vec<String>,
    /// Probability of a simulated market outage per call.
    pub outage_rate: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: None,
            backup_dir: None,
            log_level: "info".to_string(),
            retry: Duration::from_secs(30),
            dag_retry: Duration::from_secs(1),
            notify_interval: Duration::from_millis(1000),
            evolution_step: Duration::from_secs(60),
            heartbeat: Duration::from_secs(60),
            tickers: ["SBER", "GAZP", "LKOH", "MOEX"].map(String::from).to_vec(),
            outage_rate: 0.05,
        }
    }
}

fn var<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("{name} has invalid value {value:?}")),
        _ => Ok(None),
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();
        let defaults = Self::default();

        let config = Self {
            db_path: var::<PathBuf>("PIPELINE_DB")?,
            backup_dir: var::<PathBuf>("PIPELINE_BACKUP_DIR")?,
            log_level: var("PIPELINE_LOG")?.unwrap_or(defaults.log_level),
            retry: var("PIPELINE_RETRY_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.retry),
            dag_retry: var("PIPELINE_DAG_RETRY_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.dag_retry),
            notify_interval: var("PIPELINE_NOTIFY_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.notify_interval),
            evolution_step: var("PIPELINE_STEP_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.evolution_step),
            heartbeat: var("PIPELINE_HEARTBEAT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat),
            tickers: var::<String>("PIPELINE_TICKERS")?
                .map(|list| list.split(',').map(|t| t.trim().to_uppercase()).filter(|t| !t.is_empty()).collect())
                .unwrap_or(defaults.tickers),
            outage_rate: var("PIPELINE_OUTAGE_RATE")?.unwrap_or(defaults.outage_rate),
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the pipeline can't run with.
    pub fn validate(&self) -> Result<()> {
        let periods = [
            ("PIPELINE_RETRY_SECS", self.retry),
            ("PIPELINE_DAG_RETRY_SECS", self.dag_retry),
            ("PIPELINE_NOTIFY_INTERVAL_MS", self.notify_interval),
            ("PIPELINE_HEARTBEAT_SECS", self.heartbeat),
        ];
        for (name, period) in periods {
            if period.is_zero() {
                bail!("{name} must be positive");
            }
        }

        if !(0.0..=1.0).contains(&self.outage_rate) {
            bail!("PIPELINE_OUTAGE_RATE must be between 0 and 1, got {}", self.outage_rate);
        }
        if self.tickers.is_empty() {
            bail!("PIPELINE_TICKERS lists no tickers");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn zero_periods_are_rejected() {
        let config = Config {
            notify_interval: Duration::ZERO,
            ..Config::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.to_string(), "PIPELINE_NOTIFY_INTERVAL_MS must be positive");

        let config = Config {
            heartbeat: Duration::from_secs(0),
            ..Config::default()
        };
        assert!(config.validate().unwrap_err().to_string().contains("PIPELINE_HEARTBEAT_SECS"));
    }

    #[test]
    fn outage_rate_is_a_probability() {
        let config = Config {
            outage_rate: 1.5,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
