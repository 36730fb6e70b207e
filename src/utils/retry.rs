//! Retry utilities: backoff builders and transient-failure retries.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::future::Future;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use tracing::warn;

/// Backoff for transport connection retries.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: `max_times`
/// - Jitter enabled
pub fn connection_backoff(max_times: usize) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(max_times)
        .with_jitter()
}

/// Runs `operation` until it succeeds, fails permanently, or the backoff is exhausted.
pub async fn retry_transient<T, E, F, Fut>(
    what: &str,
    backoff: impl BackoffBuilder,
    is_transient: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut delays = backoff.build();
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if is_transient(&e) => match delays.next() {
                Some(delay) => {
                    warn!(
                        what,
                        attempt,
                        error = %e,
                        backoff_ms = %delay.as_millis(),
                        "Transient failure, retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => return Err(e),
            },
            Err(e) => return Err(e),
        }
    }
}
