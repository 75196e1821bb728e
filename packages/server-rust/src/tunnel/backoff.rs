//! Bounded exponential backoff with jitter, and the retry driver built on it.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::TunnelError;

/// Exponential backoff policy.
///
/// The delay before retry `step` (0-based) is
/// `duration * factor^step * (1 + jitter * u)` with `u` drawn from `[-1, 1)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// Maximum number of attempts.
    pub steps: u32,
    /// Delay before the first retry.
    pub duration: Duration,
    /// Multiplier applied per step.
    pub factor: f64,
    /// Relative jitter; `0.1` spreads each delay by ±10%.
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            steps: 5,
            duration: Duration::from_millis(100),
            factor: 2.0,
            jitter: 0.1,
        }
    }
}

impl Backoff {
    /// Delay for `step` without jitter.
    #[must_use]
    pub fn base_delay(&self, step: u32) -> Duration {
        let exponent = i32::try_from(step).unwrap_or(i32::MAX);
        secs_to_duration(self.duration.as_secs_f64() * self.factor.powi(exponent))
    }

    /// Delay for `step` with jitter drawn from `rng`.
    pub fn delay<R: Rng + ?Sized>(&self, step: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(step).as_secs_f64();
        if self.jitter <= 0.0 {
            return secs_to_duration(base);
        }
        let u: f64 = rng.random_range(-1.0..1.0);
        secs_to_duration(base * (1.0 + self.jitter * u))
    }
}

fn secs_to_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
}

/// Runs `attempt` until it succeeds, the policy is exhausted, or
/// `cancellation` fires.
///
/// At most `backoff.steps` attempts are made (at least one). Sleeps between
/// attempts race the token. When the budget runs out the last attempt's
/// error is returned as is.
pub async fn retry<T, F, Fut, R>(
    backoff: &Backoff,
    rng: &mut R,
    cancellation: &CancellationToken,
    mut attempt: F,
) -> Result<T, TunnelError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, TunnelError>>,
    R: Rng + ?Sized,
{
    let steps = backoff.steps.max(1);
    let mut step = 0;
    loop {
        if cancellation.is_cancelled() {
            return Err(TunnelError::Cancelled);
        }

        let err = match attempt(step).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if cancellation.is_cancelled() {
            return Err(TunnelError::Cancelled);
        }
        if err.is_terminal() {
            return Err(err);
        }

        step += 1;
        debug!(attempt = step, max_attempts = steps, error = %err, "attempt failed");
        if step >= steps {
            return Err(err);
        }

        let delay = backoff.delay(step - 1, rng);
        tokio::select! {
            biased;
            () = cancellation.cancelled() => return Err(TunnelError::Cancelled),
            () = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tokio::time::Instant;

    use super::*;

    #[test]
    fn default_policy() {
        let backoff = Backoff::default();
        assert_eq!(backoff.steps, 5);
        assert_eq!(backoff.base_delay(0), Duration::from_millis(100));
        assert_eq!(backoff.base_delay(3), Duration::from_millis(800));
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let backoff = Backoff {
            jitter: 0.0,
            ..Backoff::default()
        };
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(backoff.delay(2, &mut rng), Duration::from_millis(400));
    }

    #[test]
    fn same_seed_same_delays() {
        let backoff = Backoff::default();
        let mut a = StdRng::seed_from_u64(42);
        let mut b = StdRng::seed_from_u64(42);
        for step in 0..5 {
            assert_eq!(backoff.delay(step, &mut a), backoff.delay(step, &mut b));
        }
    }

    proptest! {
        #[test]
        fn jittered_delay_stays_within_bounds(
            seed in any::<u64>(),
            step in 0u32..8,
            jitter in 0.0f64..1.0,
        ) {
            let backoff = Backoff { jitter, ..Backoff::default() };
            let mut rng = StdRng::seed_from_u64(seed);
            let base = backoff.base_delay(step).as_secs_f64();
            let delay = backoff.delay(step, &mut rng).as_secs_f64();
            prop_assert!(delay >= base * (1.0 - jitter) - 1e-8);
            prop_assert!(delay <= base * (1.0 + jitter) + 1e-8);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_budget_and_returns_last_error() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let mut rng = StdRng::seed_from_u64(7);
        let started = Instant::now();

        let result: Result<(), _> = retry(
            &Backoff::default(),
            &mut rng,
            &CancellationToken::new(),
            |step| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Err(TunnelError::Dial(anyhow::anyhow!("refused #{step}"))) }
            },
        )
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 5);
        let err = result.unwrap_err();
        assert_eq!(err.to_string(), "dial error: refused #4");
        // Four sleeps of roughly 100 + 200 + 400 + 800 ms.
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(1350), "{waited:?}");
        assert!(waited <= Duration::from_millis(1650), "{waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn success_stops_retrying() {
        let mut rng = StdRng::seed_from_u64(7);
        let value = retry(&Backoff::default(), &mut rng, &CancellationToken::new(), |step| async move {
            if step < 2 {
                Err(TunnelError::Dial(anyhow::anyhow!("not yet")))
            } else {
                Ok(step)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff_wins() {
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let mut rng = StdRng::seed_from_u64(7);
        let result: Result<(), _> = retry(&Backoff::default(), &mut rng, &token, |_| async {
            Err(TunnelError::Dial(anyhow::anyhow!("refused")))
        })
        .await;
        assert!(result.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn terminal_errors_are_not_retried() {
        let attempts = AtomicU32::new(0);
        let mut rng = StdRng::seed_from_u64(7);
        let result: Result<(), _> = retry(&Backoff::default(), &mut rng, &CancellationToken::new(), |_| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async {
                Err(TunnelError::InvalidAddress {
                    addr: String::new(),
                    reason: "empty".to_string(),
                })
            }
        })
        .await;
        assert!(matches!(result, Err(TunnelError::InvalidAddress { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
