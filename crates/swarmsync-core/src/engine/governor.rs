//! Bandwidth governor - shared token budgets per traffic class
//!
//! Each traffic class owns a budget that a background tick refills every
//! period with `rate * period` tokens (one token = one byte). Budgets are
//! capped at one period's worth so idle classes cannot build up bursts.
//!
//! Fairness policy: first-ready-wins. When a tick refills a budget every
//! waiter is woken and whichever reaches the budget lock first takes what it
//! needs. No FIFO or round-robin order is kept between waiters, but every
//! waiter is eligible on every tick so none waits forever while tokens flow.
//!
//! A rate of 0 means unlimited, as does a class that was never configured or
//! has been removed. Such requests are granted in full without waiting.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use swarmsync_types::{BandwidthStat, TrafficClass};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const DEFAULT_TICK_PERIOD: Duration = Duration::from_millis(100);

/// Shared bandwidth pool, cheap to clone
#[derive(Clone)]
pub struct BandwidthGovernor {
    inner: Arc<GovernorInner>,
}

struct GovernorInner {
    period: Duration,
    classes: Mutex<HashMap<TrafficClass, Budget>>,
    /// Bumped after every replenish or configuration change
    generation: watch::Sender<u64>,
    stats_tx: broadcast::Sender<BandwidthStat>,
    shutdown: CancellationToken,
}

struct Budget {
    /// Bytes per second, 0 = unlimited
    rate: u64,
    available: u64,
    /// Fractional tokens carried into the next period
    carry: f64,
    /// Tokens available right after the last replenish
    initial: u64,
    /// Tokens handed out since the last replenish
    granted: u64,
    /// Tokens handed out during the previous full period
    last_granted: u64,
}

impl Budget {
    fn new(rate: u64, period: Duration) -> Self {
        let cap = period_cap(rate, period);
        Self {
            rate,
            available: cap,
            carry: 0.0,
            initial: cap,
            granted: 0,
            last_granted: 0,
        }
    }

    fn take(&mut self, amount: u64) -> u64 {
        let granted = amount.min(self.available);
        self.available -= granted;
        self.granted += granted;
        granted
    }
}

/// One period's worth of tokens, never less than one
fn period_cap(rate: u64, period: Duration) -> u64 {
    ((rate as f64 * period.as_secs_f64()).ceil() as u64).max(1)
}

impl BandwidthGovernor {
    pub fn new(period: Duration) -> Self {
        let (generation, _) = watch::channel(0);
        let (stats_tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(GovernorInner {
                period: if period.is_zero() {
                    DEFAULT_TICK_PERIOD
                } else {
                    period
                },
                classes: Mutex::new(HashMap::new()),
                generation,
                stats_tx,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn period(&self) -> Duration {
        self.inner.period
    }

    /// Spawn the replenish cycle. The task ends on `shutdown()` or when the
    /// last governor handle is dropped.
    pub fn start(&self) -> JoinHandle<()> {
        let weak: Weak<GovernorInner> = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();
        let period = self.inner.period;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        inner.replenish();
                    }
                }
            }
            debug!("Bandwidth governor tick stopped");
        })
    }

    /// Stop replenishing and release every waiter with its full request
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.bump();
    }

    /// Configure a class. `bytes_per_second == 0` makes it unlimited.
    pub fn set_rate(&self, class: TrafficClass, bytes_per_second: u64) {
        {
            let mut classes = self.inner.classes.lock();
            match classes.get_mut(&class) {
                Some(budget) => {
                    budget.rate = bytes_per_second;
                    if bytes_per_second > 0 {
                        let cap = period_cap(bytes_per_second, self.inner.period);
                        budget.available = budget.available.min(cap);
                    }
                }
                None => {
                    classes.insert(class, Budget::new(bytes_per_second, self.inner.period));
                }
            }
        }
        info!("Bandwidth for {} set to {} B/s", class.as_str(), bytes_per_second);
        // Waiters re-check, a class that became unlimited releases them
        self.inner.bump();
    }

    /// Remove a class; current and future waiters get their full request
    pub fn remove_class(&self, class: TrafficClass) -> bool {
        let removed = self.inner.classes.lock().remove(&class).is_some();
        if removed {
            info!("Bandwidth class {} removed", class.as_str());
            self.inner.bump();
        }
        removed
    }

    /// Configured rate, `None` for classes never configured
    pub fn rate(&self, class: TrafficClass) -> Option<u64> {
        self.inner.classes.lock().get(&class).map(|b| b.rate)
    }

    /// Bytes per second granted to the class over the last full period
    pub fn usage(&self, class: TrafficClass) -> u64 {
        let classes = self.inner.classes.lock();
        classes
            .get(&class)
            .map(|b| (b.last_granted as f64 / self.inner.period.as_secs_f64()) as u64)
            .unwrap_or(0)
    }

    /// Per-tick statistics of every limited class
    pub fn subscribe_stats(&self) -> broadcast::Receiver<BandwidthStat> {
        self.inner.stats_tx.subscribe()
    }

    /// Take up to `amount` tokens without waiting. Unlimited classes grant
    /// everything.
    pub fn try_request_tokens(&self, class: TrafficClass, amount: u64) -> u64 {
        if self.inner.shutdown.is_cancelled() {
            return amount;
        }
        let mut classes = self.inner.classes.lock();
        match classes.get_mut(&class) {
            Some(budget) if budget.rate > 0 => budget.take(amount),
            _ => amount,
        }
    }

    /// Wait until at least one token is available, then take up to `amount`.
    ///
    /// Never returns more than requested and never returns 0 for a non-zero
    /// request.
    pub async fn request_tokens(&self, class: TrafficClass, amount: u64) -> u64 {
        if amount == 0 {
            return 0;
        }

        loop {
            let mut changed = {
                if self.inner.shutdown.is_cancelled() {
                    return amount;
                }
                let mut classes = self.inner.classes.lock();
                match classes.get_mut(&class) {
                    Some(budget) if budget.rate > 0 => {
                        if budget.available > 0 {
                            return budget.take(amount);
                        }
                    }
                    _ => return amount,
                }
                // Subscribed while holding the lock so a replenish that
                // happens after we saw an empty budget cannot be missed
                self.inner.generation.subscribe()
            };

            if changed.changed().await.is_err() {
                return amount;
            }
        }
    }
}

impl GovernorInner {
    fn bump(&self) {
        self.generation.send_modify(|g| *g = g.wrapping_add(1));
    }

    fn replenish(&self) {
        let mut stats = Vec::new();
        {
            let mut classes = self.classes.lock();
            let now = Utc::now();
            for (class, budget) in classes.iter_mut() {
                if budget.rate == 0 {
                    continue;
                }

                stats.push(BandwidthStat {
                    class: *class,
                    initial: budget.initial,
                    residual: budget.available,
                    granted: budget.granted,
                    at: now,
                });

                let exact = budget.rate as f64 * self.period.as_secs_f64() + budget.carry;
                let whole = exact.floor();
                budget.carry = exact - whole;
                let cap = period_cap(budget.rate, self.period);
                budget.available = budget.available.saturating_add(whole as u64).min(cap);
                budget.initial = budget.available;
                budget.last_granted = budget.granted;
                budget.granted = 0;
            }
        }

        self.bump();
        for stat in stats {
            let _ = self.stats_tx.send(stat);
        }
    }
}

impl Default for BandwidthGovernor {
    fn default() -> Self {
        Self::new(DEFAULT_TICK_PERIOD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::time::Instant;

    #[tokio::test]
    async fn test_unlimited_never_blocks() {
        let governor = BandwidthGovernor::default();
        governor.set_rate(TrafficClass::WanInput, 0);

        // No tick task is running, so any wait would hang
        let granted = governor
            .request_tokens(TrafficClass::WanInput, u64::MAX / 2)
            .await;
        assert_eq!(granted, u64::MAX / 2);

        let granted = governor.request_tokens(TrafficClass::LanOutput, 4096).await;
        assert_eq!(granted, 4096);
    }

    #[tokio::test]
    async fn test_never_grants_more_than_requested() {
        let governor = BandwidthGovernor::default();
        governor.set_rate(TrafficClass::WanInput, 10_000);

        assert_eq!(governor.request_tokens(TrafficClass::WanInput, 100).await, 100);
        // Budget starts with one period (1000 tokens), 900 left
        assert_eq!(governor.request_tokens(TrafficClass::WanInput, 5000).await, 900);
        assert_eq!(governor.try_request_tokens(TrafficClass::WanInput, 10), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_granted_tokens_respect_rate() {
        let governor = BandwidthGovernor::new(Duration::from_millis(100));
        governor.set_rate(TrafficClass::WanInput, 50_000);
        let ticker = governor.start();

        let total = Arc::new(AtomicU64::new(0));
        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let governor = governor.clone();
            let total = Arc::clone(&total);
            handles.push(tokio::spawn(async move {
                let mut mine = 0;
                while mine < 25_000 {
                    let got = governor.request_tokens(TrafficClass::WanInput, 1_000).await;
                    mine += got;
                    total.fetch_add(got, Ordering::Relaxed);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let elapsed = start.elapsed();
        let periods = (elapsed.as_millis() / 100) as u64;
        // 200_000 tokens at 5_000 per period, plus one period of slack
        assert!(total.load(Ordering::Relaxed) <= 5_000 * (periods + 1));
        assert!(elapsed >= Duration::from_millis(3_800), "took {:?}", elapsed);

        governor.shutdown();
        ticker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_many_consumers_terminate() {
        let governor = BandwidthGovernor::new(Duration::from_millis(100));
        governor.set_rate(TrafficClass::LanInput, 400_000);
        let _ticker = governor.start();

        let mut handles = Vec::new();
        for _ in 0..400 {
            let governor = governor.clone();
            handles.push(tokio::spawn(async move {
                let mut remaining = 1_000u64;
                while remaining > 0 {
                    remaining -= governor.request_tokens(TrafficClass::LanInput, remaining).await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[test]
    fn test_empty_budget_waits_for_replenish() {
        let governor = BandwidthGovernor::new(Duration::from_millis(100));
        governor.set_rate(TrafficClass::WanInput, 10_000);
        assert_eq!(governor.try_request_tokens(TrafficClass::WanInput, 1_000), 1_000);

        let mut waiter =
            tokio_test::task::spawn(governor.request_tokens(TrafficClass::WanInput, 500));
        tokio_test::assert_pending!(waiter.poll());

        governor.inner.replenish();
        assert!(waiter.is_woken());
        assert_eq!(tokio_test::assert_ready!(waiter.poll()), 500);
    }

    #[tokio::test]
    async fn test_remove_class_releases_waiters() {
        let governor = BandwidthGovernor::default();
        governor.set_rate(TrafficClass::WanOutput, 10);
        // Drain the initial budget
        assert_eq!(governor.try_request_tokens(TrafficClass::WanOutput, 10), 1);

        let waiter = {
            let governor = governor.clone();
            tokio::spawn(async move { governor.request_tokens(TrafficClass::WanOutput, 777).await })
        };
        tokio::task::yield_now().await;
        assert!(governor.remove_class(TrafficClass::WanOutput));

        assert_eq!(waiter.await.unwrap(), 777);
        assert_eq!(governor.rate(TrafficClass::WanOutput), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_report_initial_and_residual() {
        let governor = BandwidthGovernor::new(Duration::from_millis(100));
        governor.set_rate(TrafficClass::WanInput, 10_000);
        let mut stats = governor.subscribe_stats();
        let _ticker = governor.start();

        assert_eq!(governor.try_request_tokens(TrafficClass::WanInput, 300), 300);
        let stat = stats.recv().await.unwrap();
        assert_eq!(stat.class, TrafficClass::WanInput);
        assert_eq!(stat.initial, 1_000);
        assert_eq!(stat.residual, 700);
        assert_eq!(stat.granted, 300);
        assert_eq!(governor.usage(TrafficClass::WanInput), 3_000);
    }
}
