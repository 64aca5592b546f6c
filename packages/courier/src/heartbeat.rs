//! Heartbeat-based liveness monitoring.
//!
//! The monitor decides; the connection actor acts. `check_timeout` is pure
//! bookkeeping over an explicit instant, and the two timers the monitor owns
//! only tell the actor when to ask.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::timer::PeriodicTimer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// How often a probe is sent.
    pub interval: Duration,
    /// Silence longer than this counts as a missed beat.
    pub timeout: Duration,
    /// Consecutive misses before the connection is declared dead.
    pub max_missed: u32,
    /// How often `check_timeout` runs.
    pub check_interval: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(30_000),
            timeout: Duration::from_millis(90_000),
            max_missed: 3,
            check_interval: Duration::from_millis(1_000),
        }
    }
}

/// Outcome of one liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Not monitoring.
    Idle,
    Healthy,
    /// A beat was missed. `reconnect` is set on the first miss of a streak.
    Missed { missed: u32, reconnect: bool },
    /// `max_missed` reached; the monitor has stopped itself.
    Dead { missed: u32 },
}

/// Which of the monitor's timers fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatTick {
    SendProbe,
    Check,
}

#[derive(Debug)]
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    running: bool,
    last_ack: Instant,
    missed: u32,
    recovery_requested: bool,
    probe_timer: PeriodicTimer,
    check_timer: PeriodicTimer,
}

impl HeartbeatMonitor {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            running: false,
            last_ack: Instant::now(),
            missed: 0,
            recovery_requested: false,
            probe_timer: PeriodicTimer::new(),
            check_timer: PeriodicTimer::new(),
        }
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }

    /// Start monitoring a fresh connection: clears any streak.
    pub fn reset(&mut self, now: Instant) {
        self.missed = 0;
        self.recovery_requested = false;
        self.start(now);
    }

    /// Start monitoring a connection opened to recover from a missed beat.
    /// The streak survives until the peer answers.
    pub fn resume(&mut self, now: Instant) {
        self.start(now);
    }

    fn start(&mut self, now: Instant) {
        self.running = true;
        self.last_ack = now;
        self.probe_timer.start_at(now, self.config.interval);
        self.check_timer.start_at(now, self.config.check_interval);
    }

    /// Stop both timers. Bookkeeping is kept for a later `resume`.
    pub fn stop(&mut self) {
        self.running = false;
        self.probe_timer.stop();
        self.check_timer.stop();
    }

    /// The peer sent a heartbeat.
    pub fn record_ack(&mut self, now: Instant) {
        if self.missed > 0 {
            debug!(missed = self.missed, "heartbeat streak ended");
        }
        self.last_ack = now;
        self.missed = 0;
        self.recovery_requested = false;
    }

    pub fn check_timeout(&mut self, now: Instant) -> Liveness {
        if !self.running {
            return Liveness::Idle;
        }
        if now.saturating_duration_since(self.last_ack) < self.config.timeout {
            return Liveness::Healthy;
        }

        self.missed += 1;
        self.last_ack = now;

        if self.missed >= self.config.max_missed {
            warn!(missed = self.missed, "heartbeat lost, giving up on connection");
            self.stop();
            return Liveness::Dead {
                missed: self.missed,
            };
        }

        let reconnect = !self.recovery_requested;
        self.recovery_requested = true;
        warn!(missed = self.missed, reconnect, "missed heartbeat");
        Liveness::Missed {
            missed: self.missed,
            reconnect,
        }
    }

    /// Wait for the next probe or check. Pending forever while stopped.
    pub async fn tick(&mut self) -> HeartbeatTick {
        tokio::select! {
            biased;
            _ = self.check_timer.tick() => HeartbeatTick::Check,
            _ = self.probe_timer.tick() => HeartbeatTick::SendProbe,
        }
    }
}
