//! Fixed-window quota accounting.
//!
//! Each configured operation has a per-minute and a per-day counter in the
//! backing store. A call is admitted only if both are below their ceilings,
//! in which case both are incremented under the quota lock. The store has
//! no TTL, so before counting, each increment files its counter in a small
//! cleanup bucket keyed by the minute it expires. [`QuotaLimiter::cleanup`]
//! walks those buckets through a per-operation cursor.

use crate::error::CoreError;
use crate::keyspace::{QuotaWindow, StoreKey, WindowKind, CLEANUP_PREFIX, QUOTA_PREFIX};
use crate::lock::GlobalLock;
use deskvault_common::Clock;
use deskvault_config::{QuotaConfig, QuotaLimit};
use deskvault_storage::Backend;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

/// Grace after the minute window opens before its counter is reclaimable.
const MINUTE_COUNTER_TTL_MS: u64 = 2 * 60_000;
const DAY_COUNTER_TTL_MS: u64 = 24 * 60 * 60_000;

/// Usage of one window at the time of a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowUsage {
    pub window: WindowKind,
    pub start_ms: u64,
    pub count: u64,
    pub limit: u64,
}

impl WindowUsage {
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.count)
    }

    /// When the next window of this kind opens.
    pub fn resets_at_ms(&self) -> u64 {
        self.start_ms + self.window.len_ms()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub op: String,
    pub minute: WindowUsage,
    pub day: WindowUsage,
}

/// Counter keys of one operation that expire at the same minute. Holds at
/// most one minute and one day counter, so it stays far below the value
/// ceiling however long cleanup is behind.
type Bucket = BTreeSet<String>;

/// Due minutes of one operation that may still hold buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Cursor {
    next_due_ms: u64,
    last_due_ms: u64,
}

pub struct QuotaLimiter {
    backend: Arc<dyn Backend>,
    limits: BTreeMap<String, QuotaLimit>,
    lock: GlobalLock,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for QuotaLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaLimiter")
            .field("limits", &self.limits)
            .field("lock", &self.lock)
            .finish_non_exhaustive()
    }
}

impl QuotaLimiter {
    pub fn new(backend: Arc<dyn Backend>, config: &QuotaConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            limits: config.limits.clone(),
            lock: GlobalLock::new("quota", Duration::from_millis(config.lock_timeout_ms)),
            clock,
        }
    }

    pub fn limit(&self, op: &str) -> Option<QuotaLimit> {
        self.limits.get(op).copied()
    }

    /// Admit one call of `op`, or fail with [`CoreError::QuotaExceeded`]
    /// without counting it.
    ///
    /// Returns the usage after this call, or `None` for operations with no
    /// configured limit, which are admitted without accounting.
    pub async fn check_and_consume(&self, op: &str) -> Result<Option<QuotaUsage>, CoreError> {
        let Some(limit) = self.limit(op) else {
            return Ok(None);
        };
        let _guard = self.lock.acquire().await?;
        let now = self.clock.now_ms();
        let mut usage = self.read_usage(op, limit, now).await?;

        for window in [usage.minute, usage.day] {
            if window.count >= window.limit {
                let label = window.window.to_string();
                deskvault_metrics::metrics()
                    .quota_rejections
                    .with_label_values(&[op, label.as_str()])
                    .inc();
                tracing::debug!(
                    "quota for {} exhausted in {} window: {}/{}",
                    op,
                    window.window,
                    window.count,
                    window.limit
                );
                return Err(CoreError::QuotaExceeded {
                    op: op.to_string(),
                    window: window.window,
                    current: window.count,
                    limit: window.limit,
                });
            }
        }

        let minute_key = self.counter_key(op, usage.minute)?;
        let day_key = self.counter_key(op, usage.day)?;

        // Schedule before counting, so a counter never exists without an
        // entry that will reclaim it. Expiry runs from the window start so
        // repeated calls in one window do not keep pushing it out.
        let minute_due = usage.minute.start_ms + MINUTE_COUNTER_TTL_MS;
        let day_due = usage.day.start_ms + DAY_COUNTER_TTL_MS;
        self.schedule_expiry(op, &minute_key, minute_due).await?;
        self.schedule_expiry(op, &day_key, day_due).await?;
        self.extend_cursor(op, minute_due.min(day_due), minute_due.max(day_due))
            .await?;

        usage.minute.count += 1;
        usage.day.count += 1;
        self.backend
            .set(&minute_key, &usage.minute.count.to_string())
            .await?;
        if let Err(e) = self.backend.set(&day_key, &usage.day.count.to_string()).await {
            self.restore_counter(&minute_key, usage.minute.count - 1).await;
            return Err(e.into());
        }

        Ok(Some(usage))
    }

    /// Current usage of `op` without consuming anything.
    pub async fn status(&self, op: &str) -> Result<Option<QuotaUsage>, CoreError> {
        let Some(limit) = self.limit(op) else {
            return Ok(None);
        };
        let now = self.clock.now_ms();
        Ok(Some(self.read_usage(op, limit, now).await?))
    }

    /// Delete every counter whose scheduled expiry has passed. Returns how
    /// many counters were reclaimed.
    ///
    /// Each configured operation keeps a cursor over the due minutes it
    /// still has buckets for; a pass walks those buckets up to now. A
    /// corrupt cursor or bucket is rebuilt by scanning the keyspace for
    /// that operation's counters, expiring each by its window start.
    pub async fn cleanup(&self) -> Result<usize, CoreError> {
        let _guard = self.lock.acquire().await?;
        let now = self.clock.now_ms();

        let mut reclaimed = 0;
        for op in self.limits.keys() {
            reclaimed += match self.sweep(op, now).await {
                Ok(n) => n,
                Err(e) if e.is_data_integrity() => {
                    tracing::warn!("quota cleanup schedule for {} unreadable ({}); rebuilding", op, e);
                    self.rebuild_schedule(op, now).await?
                }
                Err(e) => return Err(e),
            };
        }

        if reclaimed > 0 {
            deskvault_metrics::metrics()
                .quota_counters_reclaimed
                .inc_by(reclaimed as u64);
            tracing::info!("quota cleanup reclaimed {} counters", reclaimed);
        }
        Ok(reclaimed)
    }

    async fn read_usage(&self, op: &str, limit: QuotaLimit, now: u64) -> Result<QuotaUsage, CoreError> {
        let minute = QuotaWindow::containing(WindowKind::Minute, now);
        let day = QuotaWindow::containing(WindowKind::Day, now);
        Ok(QuotaUsage {
            op: op.to_string(),
            minute: WindowUsage {
                window: WindowKind::Minute,
                start_ms: minute.start_ms,
                count: self.read_counter(op, minute).await?,
                limit: limit.per_minute,
            },
            day: WindowUsage {
                window: WindowKind::Day,
                start_ms: day.start_ms,
                count: self.read_counter(op, day).await?,
                limit: limit.per_day,
            },
        })
    }

    async fn read_counter(&self, op: &str, window: QuotaWindow) -> Result<u64, CoreError> {
        let key = StoreKey::quota(op, window)?.to_string();
        match self.backend.get(&key).await? {
            None => Ok(0),
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .map_err(|e| CoreError::corrupt(&key, format!("quota counter {:?}: {}", raw, e))),
        }
    }

    fn counter_key(&self, op: &str, usage: WindowUsage) -> Result<String, CoreError> {
        let window = QuotaWindow {
            kind: usage.window,
            start_ms: usage.start_ms,
        };
        Ok(StoreKey::quota(op, window)?.to_string())
    }

    async fn load_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CoreError> {
        match self.backend.get(key).await? {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| CoreError::corrupt(key, e)),
        }
    }

    async fn schedule_expiry(&self, op: &str, counter: &str, due_ms: u64) -> Result<(), CoreError> {
        let key = StoreKey::cleanup_bucket(op, due_ms)?.to_string();
        let mut bucket: Bucket = self.load_json(&key).await?.unwrap_or_default();
        if !bucket.contains(counter) {
            bucket.insert(counter.to_string());
            self.backend.set(&key, &serde_json::to_string(&bucket)?).await?;
        }
        Ok(())
    }

    async fn extend_cursor(&self, op: &str, first_due_ms: u64, last_due_ms: u64) -> Result<(), CoreError> {
        let key = StoreKey::cleanup_schedule(op)?.to_string();
        let current: Option<Cursor> = self.load_json(&key).await?;
        let wanted = match current {
            None => Cursor {
                next_due_ms: first_due_ms,
                last_due_ms,
            },
            Some(c) => Cursor {
                next_due_ms: c.next_due_ms.min(first_due_ms),
                last_due_ms: c.last_due_ms.max(last_due_ms),
            },
        };
        if current != Some(wanted) {
            self.backend.set(&key, &serde_json::to_string(&wanted)?).await?;
        }
        Ok(())
    }

    /// Undo a minute increment whose day counterpart could not be written.
    async fn restore_counter(&self, key: &str, prior: u64) {
        let result = if prior == 0 {
            self.backend.delete(key).await
        } else {
            self.backend.set(key, &prior.to_string()).await
        };
        if let Err(e) = result {
            tracing::warn!("could not restore quota counter {}: {}", key, e);
        }
    }

    /// Drain every bucket of `op` due at or before `now`.
    async fn sweep(&self, op: &str, now: u64) -> Result<usize, CoreError> {
        let cursor_key = StoreKey::cleanup_schedule(op)?.to_string();
        let Some(cursor) = self.load_json::<Cursor>(&cursor_key).await? else {
            return Ok(0);
        };
        let step = WindowKind::Minute.len_ms();
        let end = cursor.last_due_ms.min(now - now % step);

        let mut reclaimed = 0;
        let mut due = cursor.next_due_ms - cursor.next_due_ms % step;
        while due <= end {
            let key = StoreKey::cleanup_bucket(op, due)?.to_string();
            if let Some(bucket) = self.load_json::<Bucket>(&key).await? {
                for counter in &bucket {
                    self.backend.delete(counter).await?;
                }
                self.backend.delete(&key).await?;
                reclaimed += bucket.len();
            }
            due += step;
        }

        if due > cursor.last_due_ms {
            self.backend.delete(&cursor_key).await?;
        } else if due != cursor.next_due_ms {
            let advanced = Cursor {
                next_due_ms: due,
                ..cursor
            };
            self.backend
                .set(&cursor_key, &serde_json::to_string(&advanced)?)
                .await?;
        }
        Ok(reclaimed)
    }

    /// Rebuild `op`'s schedule from the counters actually stored, deleting
    /// those already expired.
    async fn rebuild_schedule(&self, op: &str, now: u64) -> Result<usize, CoreError> {
        let mut buckets: BTreeMap<u64, Bucket> = BTreeMap::new();
        let mut reclaimed = 0;
        for key in self.backend.list_keys().await? {
            if !key.starts_with(QUOTA_PREFIX) && !key.starts_with(CLEANUP_PREFIX) {
                continue;
            }
            match key.parse::<StoreKey>() {
                Ok(StoreKey::Quota { op: owner, window }) if owner == op => {
                    let due = window.start_ms + counter_ttl_ms(window.kind);
                    if due <= now {
                        self.backend.delete(&key).await?;
                        reclaimed += 1;
                    } else {
                        buckets.entry(due).or_default().insert(key);
                    }
                }
                Ok(StoreKey::CleanupBucket { op: owner, .. }) if owner == op => {
                    self.backend.delete(&key).await?;
                }
                Ok(StoreKey::CleanupSchedule(owner)) if owner == op => {
                    self.backend.delete(&key).await?;
                }
                _ => {}
            }
        }

        for (due, bucket) in &buckets {
            let key = StoreKey::cleanup_bucket(op, *due)?.to_string();
            self.backend.set(&key, &serde_json::to_string(bucket)?).await?;
        }
        if let (Some(first), Some(last)) = (buckets.keys().next(), buckets.keys().next_back()) {
            self.extend_cursor(op, *first, *last).await?;
        }
        Ok(reclaimed)
    }
}

fn counter_ttl_ms(kind: WindowKind) -> u64 {
    match kind {
        WindowKind::Minute => MINUTE_COUNTER_TTL_MS,
        WindowKind::Day => DAY_COUNTER_TTL_MS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deskvault_common::MockClock;
    use deskvault_storage::{ChaosBackend, ChaosConfig, MemoryBackend};

    // 2024-03-01T00:00:00Z
    const T0: u64 = 1_709_251_200_000;

    fn limiter(per_minute: u64, per_day: u64) -> (Arc<MemoryBackend>, Arc<MockClock>, QuotaLimiter) {
        let backend = Arc::new(MemoryBackend::new(8192));
        let clock = Arc::new(MockClock::at_ms(T0));
        let mut config = QuotaConfig::default();
        config.limits.insert(
            "send_mail".to_string(),
            QuotaLimit {
                per_minute,
                per_day,
            },
        );
        let limiter = QuotaLimiter::new(backend.clone(), &config, clock.clone());
        (backend, clock, limiter)
    }

    #[tokio::test]
    async fn test_unconfigured_op_is_unlimited() {
        let (backend, _, limiter) = limiter(1, 1);
        for _ in 0..10 {
            assert!(limiter.check_and_consume("read_mail").await.unwrap().is_none());
        }
        assert!(backend.is_empty().await);
        assert!(limiter.status("read_mail").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_minute_ceiling_rejects_without_counting() {
        let (_, clock, limiter) = limiter(3, 100);
        for i in 1..=3 {
            let usage = limiter.check_and_consume("send_mail").await.unwrap().unwrap();
            assert_eq!(usage.minute.count, i);
        }

        let err = limiter.check_and_consume("send_mail").await.unwrap_err();
        match &err {
            CoreError::QuotaExceeded {
                op,
                window,
                current,
                limit,
            } => {
                assert_eq!(op, "send_mail");
                assert_eq!(*window, WindowKind::Minute);
                assert_eq!((*current, *limit), (3, 3));
            }
            other => panic!("expected QuotaExceeded, got {:?}", other),
        }
        assert!(err.is_retryable());
        assert!(!err.is_data_integrity());

        let status = limiter.status("send_mail").await.unwrap().unwrap();
        assert_eq!(status.minute.count, 3);
        assert_eq!(status.day.count, 3);

        clock.advance(Duration::from_secs(60));
        let usage = limiter.check_and_consume("send_mail").await.unwrap().unwrap();
        assert_eq!(usage.minute.count, 1);
        assert_eq!(usage.day.count, 4);
    }

    #[tokio::test]
    async fn test_day_ceiling() {
        let (_, clock, limiter) = limiter(10, 2);
        limiter.check_and_consume("send_mail").await.unwrap();
        clock.advance(Duration::from_secs(90));
        limiter.check_and_consume("send_mail").await.unwrap();
        clock.advance(Duration::from_secs(90));

        let err = limiter.check_and_consume("send_mail").await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::QuotaExceeded {
                window: WindowKind::Day,
                current: 2,
                limit: 2,
                ..
            }
        ));

        clock.advance(Duration::from_secs(24 * 3600));
        assert!(limiter.check_and_consume("send_mail").await.is_ok());
    }

    #[tokio::test]
    async fn test_corrupt_counter_is_fatal() {
        let (backend, _, limiter) = limiter(5, 5);
        let key = StoreKey::quota("send_mail", QuotaWindow::containing(WindowKind::Minute, T0))
            .unwrap()
            .to_string();
        backend.set(&key, "lots").await.unwrap();

        let err = limiter.check_and_consume("send_mail").await.unwrap_err();
        assert!(err.is_data_integrity(), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_cleanup_reclaims_expired_counters() {
        let (backend, clock, limiter) = limiter(5, 50);
        limiter.check_and_consume("send_mail").await.unwrap();
        assert_eq!(
            backend.len().await,
            5,
            "two counters, a bucket for each and the cursor"
        );

        assert_eq!(limiter.cleanup().await.unwrap(), 0);

        clock.advance(Duration::from_secs(120));
        assert_eq!(limiter.cleanup().await.unwrap(), 1, "minute counter expired");
        assert_eq!(backend.len().await, 3);

        clock.advance(Duration::from_secs(24 * 3600));
        assert_eq!(limiter.cleanup().await.unwrap(), 1, "day counter expired");
        assert!(backend.is_empty().await, "cursor removed once nothing is due");
    }

    #[tokio::test]
    async fn test_cleanup_rebuilds_corrupt_schedule() {
        let (backend, clock, limiter) = limiter(5, 50);
        limiter.check_and_consume("send_mail").await.unwrap();
        clock.advance(Duration::from_secs(3 * 60));
        limiter.check_and_consume("send_mail").await.unwrap();
        backend
            .set(
                &StoreKey::cleanup_schedule("send_mail").unwrap().to_string(),
                "garbage",
            )
            .await
            .unwrap();

        assert_eq!(limiter.cleanup().await.unwrap(), 1, "first minute counter");
        let status = limiter.status("send_mail").await.unwrap().unwrap();
        assert_eq!((status.minute.count, status.day.count), (1, 2));

        clock.advance(Duration::from_secs(25 * 3600));
        assert_eq!(limiter.cleanup().await.unwrap(), 2);
        assert!(backend.is_empty().await);
    }

    #[tokio::test]
    async fn test_schedule_stays_small_without_cleanup() {
        let (backend, clock, limiter) = limiter(100, 100_000);
        for _ in 0..300 {
            limiter.check_and_consume("send_mail").await.unwrap();
            clock.advance(Duration::from_secs(60));
        }

        let status = limiter.status("send_mail").await.unwrap().unwrap();
        assert_eq!(status.day.count, 300);
        for key in backend.list_keys().await.unwrap() {
            let value = backend.get(&key).await.unwrap().unwrap();
            assert!(value.len() < 512, "{} is {} bytes", key, value.len());
        }

        // Calls at minutes 0..300, now at minute 300: windows 0..=298 are
        // past their two-minute grace.
        assert_eq!(limiter.cleanup().await.unwrap(), 299);
        let counters = backend
            .list_keys()
            .await
            .unwrap()
            .into_iter()
            .filter(|k| k.starts_with(QUOTA_PREFIX))
            .count();
        assert_eq!(counters, 2, "last minute counter and the day counter");
    }

    #[tokio::test]
    async fn test_failed_schedule_write_counts_nothing() {
        let inner = Arc::new(MemoryBackend::new(8192));
        let chaos = Arc::new(ChaosBackend::wrap(inner.clone(), ChaosConfig::default()));
        let mut config = QuotaConfig::default();
        config.limits.insert(
            "send_mail".to_string(),
            QuotaLimit {
                per_minute: 5,
                per_day: 50,
            },
        );
        let limiter = QuotaLimiter::new(chaos.clone(), &config, Arc::new(MockClock::at_ms(T0)));

        chaos.fail_prefix(CLEANUP_PREFIX).await;
        let err = limiter.check_and_consume("send_mail").await.unwrap_err();
        assert!(matches!(err, CoreError::Backend(_)), "got {:?}", err);
        assert!(inner.is_empty().await);
        chaos.recover_prefix(CLEANUP_PREFIX).await;

        chaos.fail_prefix("quota:send_mail:day").await;
        assert!(limiter.check_and_consume("send_mail").await.is_err());
        let status = limiter.status("send_mail").await.unwrap().unwrap();
        assert_eq!((status.minute.count, status.day.count), (0, 0));
        chaos.recover_prefix("quota:send_mail:day").await;

        let usage = limiter.check_and_consume("send_mail").await.unwrap().unwrap();
        assert_eq!((usage.minute.count, usage.day.count), (1, 1));
    }
}
