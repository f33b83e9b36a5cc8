#![allow(dead_code)]

use chrono::{DateTime, Utc};
use pipeline_core::mock::{recording_notifier, RecordingSink};
use pipeline_core::repository::Storage;
use pipeline_core::{Bus, BusBuilder, Component, Entity, Revision, Subdomain, Uid};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const DATA: Subdomain = Subdomain::new("data");

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Counter {
    pub rev: Revision,
    pub timestamp: DateTime<Utc>,
    pub value: i64,
}

impl Component for Counter {
    const NAME: &'static str = "Counter";
}

impl Entity for Counter {
    fn rev(&self) -> &Revision {
        &self.rev
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

pub fn builder(storage: Arc<dyn Storage>) -> (BusBuilder, RecordingSink) {
    let (notifier, sink) = recording_notifier(CancellationToken::new());
    (Bus::builder(storage, notifier), sink)
}

pub async fn stored_counter(storage: &dyn Storage, uid: &str) -> Option<(u64, i64)> {
    storage
        .load(DATA.as_str(), Counter::NAME, &Uid::new(uid))
        .await
        .unwrap()
        .map(|doc| (doc.ver, doc.fields["value"].as_i64().unwrap()))
}
