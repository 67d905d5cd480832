use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::PipelineError;

/// Exponential backoff with full jitter: uniform over `0..=base * 2^attempt`.
pub fn backoff_delay(attempt: u32, base: Duration) -> Duration {
    let cap_ms = base.as_millis() as u64 * 2u64.saturating_pow(attempt);
    let jittered = rand::thread_rng().gen_range(0..=cap_ms);
    Duration::from_millis(jittered)
}

/// Run `op` up to `max_attempts` times, sleeping with jittered backoff after
/// each transient failure. Permanent errors return immediately; a transient
/// error on the last attempt is propagated as-is (the caller treats it as
/// permanent from there).
pub async fn with_backoff<T, F, Fut>(
    what: &str,
    max_attempts: u32,
    base: Duration,
    mut op: F,
) -> Result<T, PipelineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PipelineError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt + 1 < max_attempts => {
                let delay = backoff_delay(attempt, base);
                warn!(
                    "{} failed (attempt {}/{}), backing off {:.1}s: {}",
                    what,
                    attempt + 1,
                    max_attempts,
                    delay.as_secs_f64(),
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
