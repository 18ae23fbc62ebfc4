//! Request and response bodies. Field aliases accepted from older clients
//! are resolved here; the services only see canonical names.

mod fees;
mod finance;

pub use fees::*;
pub use finance::*;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;

/// A payment date given either as an RFC 3339 timestamp or a bare date.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
pub enum DateInput {
    Timestamp(DateTime<Utc>),
    Date(NaiveDate),
}

impl DateInput {
    /// Bare dates resolve to midnight UTC.
    pub fn into_utc(self) -> DateTime<Utc> {
        match self {
            DateInput::Timestamp(ts) => ts,
            DateInput::Date(date) => date.and_time(chrono::NaiveTime::MIN).and_utc(),
        }
    }
}

fn default_true() -> bool {
    true
}
