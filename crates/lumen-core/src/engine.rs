//! Feature vector → raw particle positions.
//!
//! [`InferenceEngine`] fronts two predictors with one output contract: an
//! accelerated quantized path and a software fallback. The engine itself
//! never fails a frame. Any accelerator problem degrades to the fallback.

use std::fmt;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::accelerator::{AcceleratorWorker, BackendFactory, QuantizedPredictor};
use crate::constants::WARMUP_RUNS;
use crate::fallback::FallbackPredictor;
use crate::features::FeatureVector;
use crate::modes::{ModeCatalog, VisualizationMode};
use crate::particle::RawParticleArray;

#[derive(Debug)]
pub enum BackendError {
    Init(String),
    Invoke(String),
    Timeout(Duration),
    Disconnected,
    OutputShape { expected: usize, got: usize },
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Init(msg) => write!(f, "accelerator init failed: {msg}"),
            BackendError::Invoke(msg) => write!(f, "accelerator invoke failed: {msg}"),
            BackendError::Timeout(d) => write!(f, "accelerator did not answer within {d:?}"),
            BackendError::Disconnected => write!(f, "accelerator worker is gone"),
            BackendError::OutputShape { expected, got } => {
                write!(f, "accelerator returned {got} values, expected {expected}")
            }
        }
    }
}

impl std::error::Error for BackendError {}

/// Shared contract of the accelerated and fallback paths: `3 × count`
/// coordinates, each within ±`WORKING_RADIUS`.
pub trait ParticlePredictor {
    fn name(&self) -> &str;

    fn predict(
        &mut self,
        features: &FeatureVector,
        mode: VisualizationMode,
        count: usize,
    ) -> Result<RawParticleArray, BackendError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Uninitialized,
    Accelerated,
    Fallback,
}

impl EngineState {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineState::Uninitialized => "uninitialized",
            EngineState::Accelerated => "accelerated",
            EngineState::Fallback => "fallback",
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Longest a frame waits on the accelerator.
    pub inference_timeout: Duration,
    /// Recovery retry cadence while in fallback. `None` disables retries.
    pub retry_interval: Option<Duration>,
    pub warmup_runs: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            inference_timeout: Duration::from_millis(20),
            retry_interval: Some(Duration::from_secs(10)),
            warmup_runs: WARMUP_RUNS,
        }
    }
}

type RetryResult = Result<AcceleratorWorker, BackendError>;

pub struct InferenceEngine {
    state: EngineState,
    config: EngineConfig,
    factory: Option<BackendFactory>,
    accelerated: Option<QuantizedPredictor>,
    fallback: FallbackPredictor,
    retry: Option<Receiver<RetryResult>>,
    next_retry_at: Option<Instant>,
    failure_logged: bool,
}

impl InferenceEngine {
    pub fn new(catalog: Arc<ModeCatalog>, factory: Option<BackendFactory>, config: EngineConfig) -> Self {
        Self {
            state: EngineState::Uninitialized,
            config,
            factory,
            accelerated: None,
            fallback: FallbackPredictor::new(catalog),
            retry: None,
            next_retry_at: None,
            failure_logged: false,
        }
    }

    /// Engine with no accelerator at all.
    pub fn fallback_only(catalog: Arc<ModeCatalog>) -> Self {
        Self::new(catalog, None, EngineConfig::default())
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn is_accelerated(&self) -> bool {
        self.state == EngineState::Accelerated
    }

    /// Bring up the accelerator (with warm-up) or settle on the fallback.
    /// Called lazily by the first `predict` if not called explicitly.
    pub fn initialize(&mut self) -> EngineState {
        if self.state != EngineState::Uninitialized {
            return self.state;
        }
        let Some(factory) = self.factory.clone() else {
            tracing::info!("no accelerator configured, using software fallback");
            self.state = EngineState::Fallback;
            return self.state;
        };
        match factory().and_then(|b| AcceleratorWorker::start(b, self.config.warmup_runs)) {
            Ok(worker) => self.promote(worker),
            Err(e) => self.demote(e),
        }
        self.state
    }

    /// Always returns `3 × count` in-range coordinates.
    pub fn predict(
        &mut self,
        features: &FeatureVector,
        mode: VisualizationMode,
        count: usize,
    ) -> RawParticleArray {
        if self.state == EngineState::Uninitialized {
            self.initialize();
        }
        self.poll_retry();

        if let Some(accel) = self.accelerated.as_mut() {
            match accel.predict(features, mode, count) {
                Ok(raw) => return raw,
                Err(BackendError::Timeout(d)) => {
                    tracing::debug!("accelerator over budget ({d:?}), fallback for this frame");
                }
                Err(e) => self.demote(e),
            }
        }

        match self.fallback.predict(features, mode, count) {
            Ok(raw) => raw,
            Err(e) => {
                // Fallback only fails on impossible shapes; emit a collapsed cloud.
                tracing::error!("fallback predictor failed: {e}");
                RawParticleArray::new(vec![0.0; count * 3])
            }
        }
    }

    fn promote(&mut self, worker: AcceleratorWorker) {
        tracing::info!("inference engine accelerated via '{}'", worker.name());
        self.accelerated = Some(QuantizedPredictor::new(worker, self.config.inference_timeout));
        self.state = EngineState::Accelerated;
        self.failure_logged = false;
        self.next_retry_at = None;
    }

    fn demote(&mut self, cause: BackendError) {
        if !self.failure_logged {
            tracing::warn!("accelerator unavailable, switching to fallback: {cause}");
            self.failure_logged = true;
        } else {
            tracing::debug!("accelerator still unavailable: {cause}");
        }
        // Never wait on a backend that just misbehaved; it may be wedged.
        if let Some(mut accel) = self.accelerated.take() {
            accel.detach();
        }
        self.state = EngineState::Fallback;
        self.next_retry_at = self.config.retry_interval.map(|i| Instant::now() + i);
    }

    /// Collect a finished retry, or launch one when due. Never blocks.
    fn poll_retry(&mut self) {
        if self.state != EngineState::Fallback {
            return;
        }
        if let Some(rx) = &self.retry {
            match rx.try_recv() {
                Ok(Ok(worker)) => {
                    self.retry = None;
                    self.promote(worker);
                    return;
                }
                Ok(Err(e)) => {
                    tracing::debug!("accelerator retry failed: {e}");
                    self.retry = None;
                    self.next_retry_at = self.config.retry_interval.map(|i| Instant::now() + i);
                }
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => self.retry = None,
            }
        }
        let (Some(factory), Some(due)) = (self.factory.clone(), self.next_retry_at) else {
            return;
        };
        if Instant::now() < due {
            return;
        }
        self.next_retry_at = None;
        let warmup = self.config.warmup_runs;
        let (tx, rx) = mpsc::channel();
        let spawned = thread::Builder::new()
            .name("lumen-accelerator-retry".to_string())
            .spawn(move || {
                let _ = tx.send(factory().and_then(|b| AcceleratorWorker::start(b, warmup)));
            });
        match spawned {
            Ok(_) => self.retry = Some(rx),
            Err(e) => {
                tracing::debug!("could not spawn accelerator retry: {e}");
                self.next_retry_at = self.config.retry_interval.map(|i| Instant::now() + i);
            }
        }
    }

    /// Release the accelerator. The engine keeps working on the fallback.
    pub fn shutdown(&mut self) {
        if let Some(mut accel) = self.accelerated.take() {
            accel.shutdown();
        }
        self.retry = None;
        self.next_retry_at = None;
        if self.state == EngineState::Accelerated {
            self.state = EngineState::Fallback;
        }
    }
}

impl Drop for InferenceEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
