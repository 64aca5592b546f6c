//! Explicit timer values.
//!
//! Each timer is a field of the component that arms it. An unarmed timer's
//! future never resolves, so it can sit in a `select!` unconditionally and
//! dropping or cancelling it is all the teardown it needs.

use std::future::pending;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep, interval_at, sleep_until};

/// One-shot, re-armable deadline.
#[derive(Debug, Default)]
pub struct ScheduledTimer {
    sleep: Option<Pin<Box<Sleep>>>,
}

impl ScheduledTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) for `deadline`.
    pub fn schedule_at(&mut self, deadline: Instant) {
        match &mut self.sleep {
            Some(sleep) => sleep.as_mut().reset(deadline),
            None => self.sleep = Some(Box::pin(sleep_until(deadline))),
        }
    }

    pub fn schedule_in(&mut self, delay: Duration) {
        self.schedule_at(Instant::now() + delay);
    }

    pub fn cancel(&mut self) {
        self.sleep = None;
    }

    pub fn is_armed(&self) -> bool {
        self.sleep.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.sleep.as_ref().map(|s| s.deadline())
    }

    /// Resolves once at the deadline, then disarms.
    pub async fn fired(&mut self) {
        match &mut self.sleep {
            Some(sleep) => {
                sleep.as_mut().await;
                self.sleep = None;
            }
            None => pending::<()>().await,
        }
    }
}

/// Fixed-period ticker. The first tick lands one full period after `start`.
#[derive(Debug, Default)]
pub struct PeriodicTimer {
    interval: Option<Interval>,
}

impl PeriodicTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, period: Duration) {
        self.start_at(Instant::now(), period);
    }

    pub fn start_at(&mut self, now: Instant, period: Duration) {
        let mut interval = interval_at(now + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.interval = Some(interval);
    }

    pub fn stop(&mut self) {
        self.interval = None;
    }

    pub fn is_running(&self) -> bool {
        self.interval.is_some()
    }

    pub async fn tick(&mut self) -> Instant {
        match &mut self.interval {
            Some(interval) => interval.tick().await,
            None => pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[tokio::test(start_paused = true)]
    async fn unarmed_timer_never_fires() {
        let mut timer = ScheduledTimer::new();
        let mut fut = task::spawn(timer.fired());
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_pending!(fut.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_timer_fires_once_then_disarms() {
        let mut timer = ScheduledTimer::new();
        timer.schedule_in(Duration::from_millis(500));
        assert!(timer.is_armed());

        timer.fired().await;
        assert!(!timer.is_armed());

        let mut again = task::spawn(timer.fired());
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_pending!(again.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_moves_the_deadline() {
        let start = Instant::now();
        let mut timer = ScheduledTimer::new();
        timer.schedule_in(Duration::from_secs(10));
        timer.schedule_in(Duration::from_secs(2));
        timer.fired().await;
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_does_not_fire() {
        let mut timer = ScheduledTimer::new();
        timer.schedule_in(Duration::from_millis(10));
        timer.cancel();
        let mut fut = task::spawn(timer.fired());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_pending!(fut.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_timer_ticks_after_one_period() {
        let start = Instant::now();
        let mut timer = PeriodicTimer::new();
        timer.start(Duration::from_secs(1));
        let first = timer.tick().await;
        assert_eq!(first - start, Duration::from_secs(1));
        let second = timer.tick().await;
        assert_eq!(second - start, Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_periodic_timer_is_pending() {
        let mut timer = PeriodicTimer::new();
        timer.start(Duration::from_millis(5));
        timer.stop();
        let mut fut = task::spawn(timer.tick());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_pending!(fut.poll());
        drop(fut);
        timer.start(Duration::from_millis(5));
        let mut fut = task::spawn(timer.tick());
        tokio::time::advance(Duration::from_millis(5)).await;
        assert_ready!(fut.poll());
    }
}
