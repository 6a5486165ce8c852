//! Bounded polling. Every "wait until X" in the lifecycle is a `poll_until` with an explicit
//! interval and deadline, so no wait can run forever.
use std::future::Future;
use tokio::time::{sleep, Duration, Instant};
use tracing::{event, Level};

/// How a bounded poll ended.
#[derive(Debug, PartialEq, Eq)]
pub enum PollOutcome<T, E> {
    /// The check produced a value before the deadline.
    Ready(T),
    /// The deadline passed; carries the time actually spent.
    Timeout { elapsed: Duration },
    /// The check failed in a way that should not be retried.
    Error(E),
}

impl<T, E> PollOutcome<T, E> {
    pub fn is_ready(&self) -> bool {
        matches!(self, PollOutcome::Ready(_))
    }
}

/// Runs `check` every `interval` until it yields `Some`, fails, or `timeout` elapses.
///
/// The check always runs at least once. A poll never sleeps past its deadline.
pub async fn poll_until<T, E, F, Fut>(
    what: &str,
    interval: Duration,
    timeout: Duration,
    mut check: F,
) -> PollOutcome<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let start = Instant::now();
    let deadline = start + timeout;
    loop {
        match check().await {
            Ok(Some(value)) => return PollOutcome::Ready(value),
            Ok(None) => {}
            Err(err) => return PollOutcome::Error(err),
        }

        let now = Instant::now();
        if now >= deadline {
            let elapsed = now - start;
            event!(Level::WARN, what, elapsed = ?elapsed, "Timed out waiting.");
            return PollOutcome::Timeout { elapsed };
        }
        event!(Level::DEBUG, what, "Condition not met yet, polling again.");
        sleep(std::cmp::min(interval, deadline - now)).await;
    }
}
