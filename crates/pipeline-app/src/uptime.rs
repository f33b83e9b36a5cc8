//! Application liveness: a start event, a periodic heartbeat and the entity
//! that remembers both.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pipeline_core::{Ctx, Event, EventHandler, EventPublisher, EventSink, Result, Revision, Uid};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct AppStarted {
    pub version: &'static str,
}

crate::component!(AppStarted);

impl Event for AppStarted {}

#[derive(Debug, Clone)]
pub struct Heartbeat {
    pub at: DateTime<Utc>,
}

crate::component!(Heartbeat);

impl Event for Heartbeat {}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Uptime {
    pub rev: Revision,
    pub timestamp: DateTime<Utc>,
    pub starts: u32,
    pub version: String,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

crate::entity!(Uptime);

pub struct CountStart;

#[async_trait]
impl EventHandler<AppStarted> for CountStart {
    async fn handle(&self, ctx: &Ctx, event: &AppStarted) -> Result<()> {
        let uptime = ctx.get::<Uptime>(Uid::singleton::<Uptime>(), true).await?;
        let mut uptime = uptime.lock().await;
        uptime.starts += 1;
        uptime.version = event.version.to_string();
        ctx.info(format!("start #{} of version {}", uptime.starts, event.version));
        Ok(())
    }
}

pub struct TouchUptime;

#[async_trait]
impl EventHandler<Heartbeat> for TouchUptime {
    async fn handle(&self, ctx: &Ctx, event: &Heartbeat) -> Result<()> {
        let uptime = ctx.get::<Uptime>(Uid::singleton::<Uptime>(), true).await?;
        let mut uptime = uptime.lock().await;
        uptime.last_heartbeat = Some(event.at);
        uptime.timestamp = uptime.timestamp.max(event.at);
        Ok(())
    }
}

/// Publishes a [`Heartbeat`] every `interval`, starting one interval after launch.
pub struct HeartbeatPublisher {
    pub interval: Duration,
}

#[async_trait]
impl EventPublisher for HeartbeatPublisher {
    async fn run(&self, sink: EventSink) -> Result<()> {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        loop {
            ticker.tick().await;
            sink.publish(Heartbeat { at: Utc::now() });
        }
    }
}
