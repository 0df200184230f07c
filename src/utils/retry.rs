//! Retry backoff builders.
//!
//! The relay core never retries on its own. These are for hosts that want
//! to re-initialize or re-subscribe after a failure.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Backoff for bus connection retries at startup.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 30
/// - Jitter enabled
pub fn connection_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(30)
        .with_jitter()
}

/// Backoff for re-establishing a dropped subscription.
///
/// - Min delay: 500ms
/// - Max delay: 30s
/// - No attempt limit
/// - Jitter enabled
pub fn resubscribe_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(500))
        .with_max_delay(Duration::from_secs(30))
        .without_max_times()
        .with_jitter()
}
