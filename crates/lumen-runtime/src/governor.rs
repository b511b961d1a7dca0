//! Adaptive frame rate and log rate limiting.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Tracks budget overruns over a sliding window of frames and lowers the
/// target rate when the loop cannot keep up.
///
/// When more than `ratio` of a full window overran, the rate drops by a
/// quarter (never below `min_fps`) and the window restarts. A full window
/// with no overruns steps the rate back up toward the configured target.
#[derive(Debug)]
pub struct FrameGovernor {
    configured_fps: f32,
    min_fps: f32,
    current_fps: f32,
    window: VecDeque<bool>,
    capacity: usize,
    ratio: f32,
    overruns_in_window: usize,
    warn: LogThrottle,
}

impl FrameGovernor {
    pub fn new(target_fps: f32, min_fps: f32, window: usize, ratio: f32) -> Self {
        let min_fps = min_fps.min(target_fps);
        let capacity = window.max(1);
        Self {
            configured_fps: target_fps,
            min_fps,
            current_fps: target_fps,
            window: VecDeque::with_capacity(capacity),
            capacity,
            ratio,
            overruns_in_window: 0,
            warn: LogThrottle::new(Duration::from_secs(10)),
        }
    }

    pub fn current_fps(&self) -> f32 {
        self.current_fps
    }

    pub fn configured_fps(&self) -> f32 {
        self.configured_fps
    }

    pub fn frame_budget(&self) -> Duration {
        Duration::from_secs_f32(1.0 / self.current_fps)
    }

    pub fn overruns_in_window(&self) -> usize {
        self.overruns_in_window
    }

    /// Record whether the last frame overran. Returns the new rate when it
    /// changed.
    pub fn record(&mut self, overran: bool) -> Option<f32> {
        if self.window.len() == self.capacity && self.window.pop_front() == Some(true) {
            self.overruns_in_window -= 1;
        }
        self.window.push_back(overran);
        if overran {
            self.overruns_in_window += 1;
        }
        if self.window.len() < self.capacity {
            return None;
        }

        let share = self.overruns_in_window as f32 / self.capacity as f32;
        if share > self.ratio && self.current_fps > self.min_fps {
            let next = (self.current_fps * 0.75).max(self.min_fps);
            if self.warn.allow() {
                tracing::warn!(
                    "{:.0}% of the last {} frames overran their budget, lowering target from {:.1} to {:.1} fps",
                    share * 100.0,
                    self.capacity,
                    self.current_fps,
                    next
                );
            }
            return Some(self.retarget(next));
        }
        if self.overruns_in_window == 0 && self.current_fps < self.configured_fps {
            let next = (self.current_fps / 0.75).min(self.configured_fps);
            tracing::info!("frame budget met, raising target to {next:.1} fps");
            return Some(self.retarget(next));
        }
        None
    }

    fn retarget(&mut self, fps: f32) -> f32 {
        self.current_fps = fps;
        self.window.clear();
        self.overruns_in_window = 0;
        fps
    }
}

/// Lets at most one event through per interval and counts what it held back.
#[derive(Debug)]
pub struct LogThrottle {
    interval: Duration,
    last: Option<Instant>,
    suppressed: u64,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
            suppressed: 0,
        }
    }

    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }

    pub fn allow_at(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.interval => {
                self.suppressed += 1;
                false
            }
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    /// Events held back since the last call.
    pub fn take_suppressed(&mut self) -> u64 {
        std::mem::take(&mut self.suppressed)
    }
}
