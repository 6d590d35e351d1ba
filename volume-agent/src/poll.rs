//! Retry-until-predicate helper for waiting on asynchronous status changes.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio::time::sleep;
use tracing::debug;

/// Default pause between attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Default overall deadline.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub timeout: Duration,
    pub interval: Duration,
}

impl PollSettings {
    pub const fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_TIMEOUT, DEFAULT_POLL_INTERVAL)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PollError<E> {
    #[error("condition not met after {attempts} attempts ({elapsed:?})")]
    Timeout { elapsed: Duration, attempts: u32 },

    /// The fetch itself failed. Never retried.
    #[error(transparent)]
    Fetch(E),
}

impl<E> PollError<E> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, PollError::Timeout { .. })
    }
}

/// Call `fetch` until `predicate` accepts its value or `settings.timeout`
/// elapses.
///
/// `fetch` runs at least once. A fetch error ends the poll immediately and
/// is returned unchanged inside [`PollError::Fetch`].
pub async fn poll_until<T, E, F, Fut, P>(
    mut fetch: F,
    mut predicate: P,
    settings: PollSettings,
) -> Result<T, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&T) -> bool,
{
    let start = Instant::now();
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        let value = fetch().await.map_err(PollError::Fetch)?;
        if predicate(&value) {
            return Ok(value);
        }

        let elapsed = start.elapsed();
        if elapsed >= settings.timeout {
            return Err(PollError::Timeout { elapsed, attempts });
        }

        let remaining = settings.timeout - elapsed;
        debug!(attempts, ?remaining, "Condition not met yet, polling again");
        sleep(settings.interval.min(remaining)).await;
    }
}
