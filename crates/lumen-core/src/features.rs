//! Snapshot → fixed-length feature vector.
//!
//! The slot layout is a versioned contract ([`FEATURE_LAYOUT_VERSION`]):
//!
//! | category    | offset | len | source                                  |
//! |-------------|--------|-----|-----------------------------------------|
//! | environment | 0      | 16  | `environment.*`                         |
//! | interaction | 16     | 16  | `interaction.*`                         |
//! | threat      | 32     | 8   | `threat.*`                              |
//! | cognitive   | 40     | 24  | `cognitive.*`                           |
//! | audio       | 64     | 16  | `audio.bands[0..16]`                    |
//! | motion      | 80     | 16  | `motion.*`                              |
//! | host        | 96     | 8   | memoized host sample                     |
//! | time        | 104    | 8   | `clock.unix_secs`                       |
//! | reserved    | 112    | 8   | always neutral                          |
//!
//! A slot whose source is missing, non-finite, the wrong type, or (for
//! already-normalized inputs) outside [0, 1] gets its neutral value: 0.0 for
//! presence flags and band energies, 0.5 for everything else.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::constants::{EXTRACT_BUDGET_MICROS, FEATURE_COUNT, FEATURE_LAYOUT_VERSION, HOST_CACHE_MS};
use crate::host::{HostCache, HostSample, HostSampler, ProcHostSampler};
use crate::state::StateSnapshot;

/// Well-known slot indices read by later stages.
pub mod slots {
    pub const TEMPERATURE: usize = 0;
    pub const LIGHT: usize = 2;
    pub const USER_PRESENT: usize = 16;
    pub const SPEAKING: usize = 17;
    pub const ENGAGEMENT: usize = 22;
    pub const THREAT_LEVEL: usize = 32;
    pub const VALENCE: usize = 40;
    pub const AROUSAL: usize = 41;
    pub const ATTENTION: usize = 42;
    pub const AUDIO_BANDS: usize = 64;
    pub const AUDIO_BAND_COUNT: usize = 16;
    pub const CPU_LOAD: usize = 96;
}

/// Contiguous block of slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Category {
    pub name: &'static str,
    pub offset: usize,
    pub len: usize,
}

pub const CATEGORIES: [Category; 9] = [
    Category { name: "environment", offset: 0, len: 16 },
    Category { name: "interaction", offset: 16, len: 16 },
    Category { name: "threat", offset: 32, len: 8 },
    Category { name: "cognitive", offset: 40, len: 24 },
    Category { name: "audio", offset: 64, len: 16 },
    Category { name: "motion", offset: 80, len: 16 },
    Category { name: "host", offset: 96, len: 8 },
    Category { name: "time", offset: 104, len: 8 },
    Category { name: "reserved", offset: 112, len: 8 },
];

/// How a raw reading becomes a [0, 1] value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Transform {
    /// Producer already normalized. Out-of-range input counts as missing.
    Unit,
    /// Linear map of [min, max], saturating outside.
    Range { min: f64, max: f64 },
    /// Linear map of [-span, span], saturating outside.
    Bipolar { span: f64 },
    /// Boolean presence.
    Flag,
}

impl Transform {
    fn apply(self, raw: f64) -> Option<f32> {
        if !raw.is_finite() {
            return None;
        }
        let v = match self {
            Transform::Unit => {
                if !(0.0..=1.0).contains(&raw) {
                    return None;
                }
                raw
            }
            Transform::Range { min, max } => ((raw - min) / (max - min)).clamp(0.0, 1.0),
            Transform::Bipolar { span } => ((raw / span) * 0.5 + 0.5).clamp(0.0, 1.0),
            Transform::Flag => {
                if raw != 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
        };
        Some(v as f32)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum HostField {
    CpuLoad,
    MemoryUsed,
    UptimePhase,
    RunnableRatio,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TimeField {
    HourSin,
    HourCos,
    DayPhase,
    WeekPhase,
}

/// Where a slot's value comes from.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Source {
    Path(&'static str, Transform),
    /// Element `i` of the `audio.bands` list.
    Band(usize),
    Host(HostField),
    Time(TimeField),
    Reserved,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FeatureSpec {
    pub name: String,
    pub source: Source,
    pub neutral: f32,
}

/// Ordered slot table.
#[derive(Clone, Debug)]
pub struct FeatureLayout {
    specs: Vec<FeatureSpec>,
}

fn path(p: &'static str, t: Transform) -> (String, Source, f32) {
    let neutral = if t == Transform::Flag { 0.0 } else { 0.5 };
    (p.to_string(), Source::Path(p, t), neutral)
}

fn fill(category: Category, mut entries: Vec<(String, Source, f32)>) -> Vec<FeatureSpec> {
    debug_assert!(entries.len() <= category.len, "{} overflows", category.name);
    let used = entries.len();
    for i in used..category.len {
        entries.push((format!("{}.reserved{}", category.name, i), Source::Reserved, 0.5));
    }
    entries
        .into_iter()
        .map(|(name, source, neutral)| FeatureSpec {
            name,
            source,
            neutral,
        })
        .collect()
}

impl FeatureLayout {
    /// Layout version 1.
    pub fn standard() -> Self {
        use Transform::*;
        let [env, inter, threat, cog, audio, motion, host, time, reserved] = CATEGORIES;

        let mut specs = Vec::with_capacity(FEATURE_COUNT);
        specs.extend(fill(
            env,
            vec![
                path("environment.temperature", Unit),
                path("environment.humidity", Unit),
                path("environment.light", Unit),
                path("environment.noise", Unit),
                path("environment.pressure_hpa", Range { min: 950.0, max: 1050.0 }),
                path("environment.air_quality", Unit),
                path("environment.co2_ppm", Range { min: 400.0, max: 2000.0 }),
                path("environment.occupancy", Range { min: 0.0, max: 10.0 }),
                path("environment.raining", Flag),
                path("environment.mapping_active", Flag),
            ],
        ));
        specs.extend(fill(
            inter,
            vec![
                path("interaction.user_present", Flag),
                path("interaction.speaking", Flag),
                path("interaction.listening", Flag),
                path("interaction.gaze", Unit),
                path("interaction.distance_m", Range { min: 0.0, max: 5.0 }),
                path("interaction.gesture_energy", Unit),
                path("interaction.engagement", Unit),
                path("interaction.sentiment", Bipolar { span: 1.0 }),
                path("interaction.turn_count", Range { min: 0.0, max: 50.0 }),
            ],
        ));
        specs.extend(fill(
            threat,
            vec![
                path("threat.level", Unit),
                path("threat.proximity", Unit),
                path("threat.active", Flag),
                path("threat.confidence", Unit),
            ],
        ));
        specs.extend(fill(
            cog,
            vec![
                path("cognitive.valence", Bipolar { span: 1.0 }),
                path("cognitive.arousal", Unit),
                path("cognitive.attention", Unit),
                path("cognitive.curiosity", Unit),
                path("cognitive.confidence", Unit),
                path("cognitive.fatigue", Unit),
                path("cognitive.processing", Flag),
                path("cognitive.load", Unit),
                path("cognitive.surprise", Unit),
            ],
        ));
        specs.extend(fill(
            audio,
            (0..slots::AUDIO_BAND_COUNT)
                .map(|i| (format!("audio.bands[{i}]"), Source::Band(i), 0.0))
                .collect(),
        ));
        specs.extend(fill(
            motion,
            vec![
                path("motion.accel.x", Bipolar { span: 2.0 }),
                path("motion.accel.y", Bipolar { span: 2.0 }),
                path("motion.accel.z", Bipolar { span: 2.0 }),
                path("motion.gyro.x", Bipolar { span: 250.0 }),
                path("motion.gyro.y", Bipolar { span: 250.0 }),
                path("motion.gyro.z", Bipolar { span: 250.0 }),
                path("motion.heading_deg", Range { min: 0.0, max: 360.0 }),
                path("motion.speed_mps", Range { min: 0.0, max: 3.0 }),
            ],
        ));
        specs.extend(fill(
            host,
            vec![
                ("host.cpu_load".into(), Source::Host(HostField::CpuLoad), 0.5),
                ("host.memory_used".into(), Source::Host(HostField::MemoryUsed), 0.5),
                ("host.uptime_phase".into(), Source::Host(HostField::UptimePhase), 0.5),
                ("host.runnable_ratio".into(), Source::Host(HostField::RunnableRatio), 0.5),
            ],
        ));
        specs.extend(fill(
            time,
            vec![
                ("time.hour_sin".into(), Source::Time(TimeField::HourSin), 0.5),
                ("time.hour_cos".into(), Source::Time(TimeField::HourCos), 0.5),
                ("time.day_phase".into(), Source::Time(TimeField::DayPhase), 0.5),
                ("time.week_phase".into(), Source::Time(TimeField::WeekPhase), 0.5),
            ],
        ));
        specs.extend(fill(reserved, Vec::new()));

        debug_assert_eq!(specs.len(), FEATURE_COUNT);
        Self { specs }
    }

    pub fn version(&self) -> u32 {
        FEATURE_LAYOUT_VERSION
    }

    pub fn specs(&self) -> &[FeatureSpec] {
        &self.specs
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.specs.iter().position(|s| s.name == name)
    }

    /// Every slot at its neutral value.
    pub fn neutral_vector(&self) -> FeatureVector {
        let mut values = [0.5; FEATURE_COUNT];
        for (slot, spec) in values.iter_mut().zip(&self.specs) {
            *slot = spec.neutral;
        }
        FeatureVector { values }
    }
}

impl Default for FeatureLayout {
    fn default() -> Self {
        Self::standard()
    }
}

/// Fixed-length normalized feature vector. Every element is in [0, 1].
#[derive(Clone, Copy, PartialEq)]
pub struct FeatureVector {
    values: [f32; FEATURE_COUNT],
}

impl FeatureVector {
    /// Build from raw values, clamping into range and replacing NaN with 0.5.
    pub fn from_values(values: [f32; FEATURE_COUNT]) -> Self {
        Self {
            values: values.map(|v| if v.is_nan() { 0.5 } else { v.clamp(0.0, 1.0) }),
        }
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    pub fn get(&self, slot: usize) -> f32 {
        self.values[slot]
    }

    pub fn category(&self, name: &str) -> Option<&[f32]> {
        CATEGORIES
            .iter()
            .find(|c| c.name == name)
            .map(|c| &self.values[c.offset..c.offset + c.len])
    }

    /// Mean of the audio band energies.
    pub fn audio_energy(&self) -> f32 {
        let bands = &self.values[slots::AUDIO_BANDS..slots::AUDIO_BANDS + slots::AUDIO_BAND_COUNT];
        bands.iter().sum::<f32>() / bands.len() as f32
    }

    pub fn len(&self) -> usize {
        FEATURE_COUNT
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

impl fmt::Debug for FeatureVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureVector")
            .field("len", &FEATURE_COUNT)
            .field("head", &&self.values[..8])
            .finish()
    }
}

/// Turns snapshots into feature vectors.
pub struct FeatureExtractor {
    layout: Arc<FeatureLayout>,
    host: HostCache,
}

impl FeatureExtractor {
    pub fn new() -> Self {
        Self::with_sampler(Box::new(ProcHostSampler), Duration::from_millis(HOST_CACHE_MS))
    }

    pub fn with_sampler(sampler: Box<dyn HostSampler>, host_ttl: Duration) -> Self {
        Self {
            layout: Arc::new(FeatureLayout::standard()),
            host: HostCache::new(sampler, host_ttl),
        }
    }

    pub fn layout(&self) -> &FeatureLayout {
        &self.layout
    }

    /// Extract every slot. Never fails: undeterminable slots are neutral.
    pub fn extract(&mut self, snapshot: &StateSnapshot) -> FeatureVector {
        let started = Instant::now();
        let host = self.host.get();
        let unix_secs = snapshot.get_f64("clock.unix_secs").filter(|s| s.is_finite() && *s >= 0.0);
        let bands = snapshot.value("audio.bands").and_then(|v| v.as_list());

        let mut values = [0.0f32; FEATURE_COUNT];
        for (i, spec) in self.layout.specs.iter().enumerate() {
            let read = match spec.source {
                Source::Path(p, transform) => match snapshot.value(p) {
                    Some(v) => {
                        let out = v.as_f64().and_then(|raw| transform.apply(raw));
                        if out.is_none() {
                            tracing::debug!("feature {p}: unusable value {v:?}, using neutral");
                        }
                        out
                    }
                    None => None,
                },
                Source::Band(b) => bands
                    .and_then(|list| list.get(b))
                    .and_then(|v| v.as_f64())
                    .and_then(|raw| Transform::Unit.apply(raw)),
                Source::Host(field) => host_value(&host, field),
                Source::Time(field) => unix_secs.map(|s| time_value(s, field)),
                Source::Reserved => None,
            };
            values[i] = read.unwrap_or(spec.neutral);
        }

        for (i, v) in values.iter_mut().enumerate() {
            debug_assert!(
                (0.0..=1.0).contains(v),
                "feature {} out of range: {v}",
                self.layout.specs[i].name
            );
            *v = v.clamp(0.0, 1.0);
        }

        let elapsed = started.elapsed();
        if elapsed.as_micros() > EXTRACT_BUDGET_MICROS {
            tracing::debug!("feature extraction took {elapsed:?}");
        }
        FeatureVector { values }
    }
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::new()
    }
}

fn host_value(sample: &HostSample, field: HostField) -> Option<f32> {
    let v = match field {
        HostField::CpuLoad => sample.cpu_load,
        HostField::MemoryUsed => sample.memory_used,
        HostField::UptimePhase => sample.uptime_phase,
        HostField::RunnableRatio => sample.runnable_ratio,
    };
    v.filter(|x| x.is_finite()).map(|x| x.clamp(0.0, 1.0))
}

fn time_value(unix_secs: f64, field: TimeField) -> f32 {
    let day_secs = unix_secs.rem_euclid(86_400.0);
    let hour_angle = std::f64::consts::TAU * day_secs / 86_400.0;
    let v = match field {
        TimeField::HourSin => 0.5 + 0.5 * hour_angle.sin(),
        TimeField::HourCos => 0.5 + 0.5 * hour_angle.cos(),
        TimeField::DayPhase => day_secs / 86_400.0,
        TimeField::WeekPhase => {
            // 1970-01-01 was a Thursday; shift so Monday starts the week.
            let days = (unix_secs / 86_400.0).floor();
            ((days + 3.0).rem_euclid(7.0)) / 7.0
        }
    };
    v.clamp(0.0, 1.0) as f32
}
