//! Progress accounting for long-running requests

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Weight given to the newest throughput sample
const BPS_SMOOTHING: f64 = 0.3;

/// Payload of the `Progress` notification
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressNotification {
    /// Completion in `[0, 1]`
    pub progress: f64,
    /// Estimated seconds left, 0 when unknown
    pub eta: f64,
    /// Bytes per second, 0 when unknown
    pub bps: f64,
}

#[derive(Debug)]
pub struct ProgressTracker {
    initial: f64,
    progress: f64,
    total_bytes: Option<u64>,
    started_at: Instant,
    /// Time spent paused so far, excluding an ongoing pause
    paused_for: Duration,
    paused_at: Option<Instant>,
    /// Last sample used for throughput: (when, progress)
    last_sample: Option<(Instant, f64)>,
    bps: Option<f64>,
}

impl ProgressTracker {
    pub fn new(initial: f64, total_bytes: Option<u64>) -> Self {
        Self::starting_at(initial, total_bytes, Instant::now())
    }

    pub fn starting_at(initial: f64, total_bytes: Option<u64>, now: Instant) -> Self {
        let initial = initial.clamp(0.0, 1.0);
        Self {
            initial,
            progress: initial,
            total_bytes: total_bytes.filter(|&n| n > 0),
            started_at: now,
            paused_for: Duration::ZERO,
            paused_at: None,
            last_sample: Some((now, initial)),
            bps: None,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused_at.is_some()
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }

    pub fn set_progress(&mut self, alpha: f64) -> ProgressNotification {
        self.set_progress_at(alpha, Instant::now())
    }

    pub fn set_progress_at(&mut self, alpha: f64, now: Instant) -> ProgressNotification {
        self.progress = alpha.clamp(0.0, 1.0);

        if !self.is_paused() {
            self.sample_throughput(now);
        }

        ProgressNotification {
            progress: self.progress,
            eta: self.eta_at(now).map(|d| d.as_secs_f64()).unwrap_or(0.0),
            bps: self.bps.unwrap_or(0.0),
        }
    }

    pub fn pause(&mut self) {
        self.pause_at(Instant::now())
    }

    pub fn pause_at(&mut self, now: Instant) {
        if self.paused_at.is_none() {
            self.paused_at = Some(now);
        }
    }

    pub fn resume(&mut self) {
        self.resume_at(Instant::now())
    }

    pub fn resume_at(&mut self, now: Instant) {
        if let Some(paused_at) = self.paused_at.take() {
            self.paused_for += now.saturating_duration_since(paused_at);
            // Progress made while paused is not throughput
            self.last_sample = Some((now, self.progress));
        }
    }

    /// Wall-clock time spent actively working
    fn active_elapsed(&self, now: Instant) -> Duration {
        let paused = self.paused_for
            + self
                .paused_at
                .map(|at| now.saturating_duration_since(at))
                .unwrap_or_default();
        now.saturating_duration_since(self.started_at)
            .saturating_sub(paused)
    }

    fn eta_at(&self, now: Instant) -> Option<Duration> {
        let done = self.progress - self.initial;
        let elapsed = self.active_elapsed(now).as_secs_f64();
        if done <= 0.0 || elapsed <= 0.0 {
            return None;
        }
        let rate = done / elapsed;
        Some(Duration::from_secs_f64((1.0 - self.progress) / rate))
    }

    fn sample_throughput(&mut self, now: Instant) {
        let Some(total) = self.total_bytes else {
            return;
        };
        let Some((then, before)) = self.last_sample else {
            self.last_sample = Some((now, self.progress));
            return;
        };

        let dt = now.saturating_duration_since(then).as_secs_f64();
        if dt <= 0.0 {
            return;
        }
        let bytes = (self.progress - before).max(0.0) * total as f64;
        let sample = bytes / dt;
        self.bps = Some(match self.bps {
            Some(bps) => bps + BPS_SMOOTHING * (sample - bps),
            None => sample,
        });
        self.last_sample = Some((now, self.progress));
    }
}
