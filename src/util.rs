//! Shared utility functions.

use std::future::Future;
use std::time::Duration;

use tokio::time::timeout;

use crate::{Error, Result};

/// Await `fut`, failing with `Error::Timeout` once `deadline` elapses.
///
/// `None` waits indefinitely.
pub async fn with_deadline<F, T>(deadline: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match deadline {
        Some(duration) => match timeout(duration, fut).await {
            Ok(inner) => inner,
            Err(_) => Err(Error::Timeout(duration)),
        },
        None => fut.await,
    }
}

/// `start` moved forward by `secs`, rounded to the millisecond.
///
/// # Errors
/// `Validation` when `secs` is not finite or the result leaves chrono's range.
pub fn offset_secs(
    start: chrono::DateTime<chrono::Utc>,
    secs: f64,
) -> Result<chrono::DateTime<chrono::Utc>> {
    let out_of_range = || Error::Validation(format!("{} seconds from {} is out of range", secs, start));
    if !secs.is_finite() {
        return Err(out_of_range());
    }
    chrono::Duration::try_milliseconds((secs * 1000.0).round() as i64)
        .and_then(|delta| start.checked_add_signed(delta))
        .ok_or_else(out_of_range)
}

/// Seconds between two timestamps, clamped at zero.
pub fn elapsed_secs(
    start: chrono::DateTime<chrono::Utc>,
    end: chrono::DateTime<chrono::Utc>,
) -> f64 {
    let millis = (end - start).num_milliseconds();
    (millis.max(0) as f64) / 1000.0
}
