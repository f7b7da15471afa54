//! Where the next fetch of an instance starts

use chrono::{DateTime, Duration, Utc};

use crate::storage::schema::CollectorStatus;

/// Lower bound of the next history fetch
///
/// One second after the last stored row, or no bound for an instance that
/// has never been stored.
pub fn fetch_start(status: Option<&CollectorStatus>) -> Option<DateTime<Utc>> {
    status?
        .last_insert
        .map(|last_insert| last_insert + Duration::seconds(1))
}
