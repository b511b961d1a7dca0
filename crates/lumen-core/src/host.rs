//! Host resource readings for the feature vector.
//!
//! Readings change slowly compared to the frame rate, so [`HostCache`]
//! memoizes them for a short TTL. A sampler that cannot read a value reports
//! `None` and the extractor falls back to the slot's neutral value.

use std::fs;
use std::time::{Duration, Instant};

/// One reading of host load. Every field is normalized to [0, 1].
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct HostSample {
    /// 1-minute load average divided by the number of CPUs.
    pub cpu_load: Option<f32>,
    /// Fraction of physical memory in use.
    pub memory_used: Option<f32>,
    /// Position of uptime within the current 24 hours.
    pub uptime_phase: Option<f32>,
    /// Runnable tasks over total tasks.
    pub runnable_ratio: Option<f32>,
}

pub trait HostSampler: Send {
    fn sample(&mut self) -> HostSample;
}

/// Reads `/proc`. On systems without it every field is `None`.
#[derive(Debug, Default)]
pub struct ProcHostSampler;

impl ProcHostSampler {
    fn loadavg() -> (Option<f32>, Option<f32>) {
        let Ok(content) = fs::read_to_string("/proc/loadavg") else {
            return (None, None);
        };
        parse_loadavg(&content, cpu_count())
    }

    fn memory_used() -> Option<f32> {
        let content = fs::read_to_string("/proc/meminfo").ok()?;
        parse_meminfo(&content)
    }

    fn uptime_phase() -> Option<f32> {
        let content = fs::read_to_string("/proc/uptime").ok()?;
        let secs: f64 = content.split_whitespace().next()?.parse().ok()?;
        Some(((secs % 86_400.0) / 86_400.0) as f32)
    }
}

impl HostSampler for ProcHostSampler {
    fn sample(&mut self) -> HostSample {
        let (cpu_load, runnable_ratio) = Self::loadavg();
        HostSample {
            cpu_load,
            memory_used: Self::memory_used(),
            uptime_phase: Self::uptime_phase(),
            runnable_ratio,
        }
    }
}

/// Sampler that reports nothing, for deterministic runs.
#[derive(Debug, Default)]
pub struct AbsentHostSampler;

impl HostSampler for AbsentHostSampler {
    fn sample(&mut self) -> HostSample {
        HostSample::default()
    }
}

fn cpu_count() -> f32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as f32)
        .unwrap_or(1.0)
}

/// `0.52 0.58 0.59 3/812 12345` → (load / cpus, runnable / total)
fn parse_loadavg(content: &str, cpus: f32) -> (Option<f32>, Option<f32>) {
    let mut fields = content.split_whitespace();
    let load = fields
        .next()
        .and_then(|s| s.parse::<f32>().ok())
        .map(|l| (l / cpus.max(1.0)).clamp(0.0, 1.0));
    let runnable = fields.nth(2).and_then(|s| {
        let (running, total) = s.split_once('/')?;
        let running: f32 = running.parse().ok()?;
        let total: f32 = total.parse().ok()?;
        (total > 0.0).then(|| (running / total).clamp(0.0, 1.0))
    });
    (load, runnable)
}

fn parse_meminfo(content: &str) -> Option<f32> {
    let field = |name: &str| -> Option<f64> {
        content
            .lines()
            .find(|l| l.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total <= 0.0 {
        return None;
    }
    Some((1.0 - available / total).clamp(0.0, 1.0) as f32)
}

/// Memoizes a sampler for `ttl`.
pub struct HostCache {
    sampler: Box<dyn HostSampler>,
    ttl: Duration,
    last: Option<(Instant, HostSample)>,
}

impl HostCache {
    pub fn new(sampler: Box<dyn HostSampler>, ttl: Duration) -> Self {
        Self {
            sampler,
            ttl,
            last: None,
        }
    }

    pub fn get(&mut self) -> HostSample {
        if let Some((at, sample)) = self.last
            && at.elapsed() < self.ttl
        {
            return sample;
        }
        let sample = self.sampler.sample();
        self.last = Some((Instant::now(), sample));
        sample
    }
}
