//! Shared vocabulary of the sample pipeline: subdomains, the entity macro and
//! small value types.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use pipeline_core::Subdomain;
use serde::{Deserialize, Serialize};

pub const DATA: Subdomain = Subdomain::new("data");
pub const EVOLUTION: Subdomain = Subdomain::new("evolution");
pub const APP: Subdomain = Subdomain::new("app");

/// Implements `Component` and `Entity` for a struct with `rev` and
/// `timestamp` fields. The component name is the struct name.
#[macro_export]
macro_rules! entity {
    ($name:ident) => {
        impl pipeline_core::Component for $name {
            const NAME: &'static str = stringify!($name);
        }

        impl pipeline_core::Entity for $name {
            fn rev(&self) -> &pipeline_core::Revision {
                &self.rev
            }

            fn timestamp(&self) -> chrono::DateTime<chrono::Utc> {
                self.timestamp
            }
        }
    };
}

/// Implements `Component` for an event or request type.
#[macro_export]
macro_rules! component {
    ($name:ident) => {
        impl pipeline_core::Component for $name {
            const NAME: &'static str = stringify!($name);
        }
    };
}

/// Timestamp of data that is valid as of the given trading day.
pub fn day_start(day: NaiveDate) -> DateTime<Utc> {
    day.and_time(NaiveTime::MIN).and_utc()
}

/// Closing value of a series on one trading day.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub day: NaiveDate,
    pub close: f64,
}
