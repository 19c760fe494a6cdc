use chrono::Utc;
use metrics::counter;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::events::{Event, EventSender};

/// Runs a side effect whose failure must not affect the primary operation.
///
/// The future is bounded by `timeout`. Errors and timeouts are logged, counted
/// and reported on the event channel, then swallowed as `None`.
pub async fn best_effort<T, E, F>(
    name: &'static str,
    timeout: Duration,
    events: Option<&EventSender>,
    fut: F,
) -> Option<T>
where
    E: Display,
    F: Future<Output = Result<T, E>>,
{
    let error = match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => return Some(value),
        Ok(Err(e)) => e.to_string(),
        Err(_) => format!("timed out after {} ms", timeout.as_millis()),
    };

    warn!(side_effect = name, %error, "side effect failed; continuing");
    counter!("remitflow.side_effect.failed", 1, "name" => name);
    if let Some(events) = events {
        events.emit(Event::SideEffectFailed {
            name: name.to_string(),
            error,
            timestamp: Utc::now(),
        });
    }
    None
}
