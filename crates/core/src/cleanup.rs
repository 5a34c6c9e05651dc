//! Background task reclaiming expired quota counters.

use crate::quota::QuotaLimiter;
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Spawn the periodic quota cleanup task.
///
/// Returns a `JoinHandle`; abort it to stop the task.
pub fn spawn_cleanup_task(
    limiter: Arc<QuotaLimiter>,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = interval(every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            run_cleanup_cycle(&limiter).await;
        }
    })
}

/// One cleanup pass. Failures are logged and retried next cycle.
pub async fn run_cleanup_cycle(limiter: &QuotaLimiter) -> usize {
    match limiter.cleanup().await {
        Ok(reclaimed) => reclaimed,
        Err(e) => {
            tracing::warn!("quota cleanup failed, will retry next cycle: {}", e);
            0
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use deskvault_common::MockClock;
    use deskvault_config::{QuotaConfig, QuotaLimit};
    use deskvault_storage::{Backend, ChaosBackend, ChaosConfig, MemoryBackend};

    const T0: u64 = 1_709_251_200_000;

    fn config() -> QuotaConfig {
        let mut config = QuotaConfig::default();
        config.limits.insert(
            "send_mail".to_string(),
            QuotaLimit {
                per_minute: 10,
                per_day: 100,
            },
        );
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_reclaims_on_schedule() {
        let backend = Arc::new(MemoryBackend::new(8192));
        let clock = Arc::new(MockClock::at_ms(T0));
        let limiter = Arc::new(QuotaLimiter::new(backend.clone(), &config(), clock.clone()));
        limiter.check_and_consume("send_mail").await.unwrap();
        clock.advance(Duration::from_secs(25 * 3600));

        let handle = spawn_cleanup_task(limiter, Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(backend.is_empty().await, "counters should be reclaimed");
        handle.abort();
    }

    #[tokio::test]
    async fn test_cycle_survives_backend_failure() {
        let inner = Arc::new(MemoryBackend::new(8192));
        let chaos = Arc::new(ChaosBackend::wrap(inner.clone(), ChaosConfig::default()));
        let clock = Arc::new(MockClock::at_ms(T0));
        let limiter = QuotaLimiter::new(chaos.clone(), &config(), clock.clone());
        limiter.check_and_consume("send_mail").await.unwrap();
        clock.advance(Duration::from_secs(25 * 3600));

        chaos.fail_prefix("quota:").await;
        assert_eq!(run_cleanup_cycle(&limiter).await, 0);
        assert!(inner.list_keys().await.unwrap().len() > 1);

        chaos.recover_prefix("quota:").await;
        assert_eq!(run_cleanup_cycle(&limiter).await, 2);
        assert!(inner.is_empty().await);
    }
}
