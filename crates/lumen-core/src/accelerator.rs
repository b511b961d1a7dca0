//! Quantized inference on a dedicated worker thread.
//!
//! The backend is moved into the worker at start and never touched by any
//! other thread. The caller waits at most `timeout` per request; a late reply
//! is recognized by its sequence number and discarded on a later call.

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::constants::FEATURE_COUNT;
use crate::engine::{BackendError, ParticlePredictor};
use crate::features::FeatureVector;
use crate::modes::VisualizationMode;
use crate::particle::RawParticleArray;
use crate::quantize::{dequantize_output, quantize_input};

/// An integer inference backend.
///
/// `invoke` reads `FEATURE_COUNT` u8 codes and fills `output` with
/// `3 × count` i8 codes for `mode`.
pub trait AcceleratorBackend: Send {
    fn name(&self) -> &str;

    fn initialize(&mut self) -> Result<(), BackendError>;

    fn invoke(
        &mut self,
        mode: VisualizationMode,
        input: &[u8],
        output: &mut [i8],
    ) -> Result<(), BackendError>;

    /// Free device resources. Called exactly once, on the worker thread.
    fn release(&mut self);
}

/// Builds a fresh backend, used at startup and by recovery retries.
pub type BackendFactory =
    Arc<dyn Fn() -> Result<Box<dyn AcceleratorBackend>, BackendError> + Send + Sync>;

/// Particles requested per warm-up run.
const WARMUP_PARTICLES: usize = 64;

/// Upper bound on backend initialization plus warm-up.
const INIT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long shutdown waits for the worker before detaching it.
const JOIN_TIMEOUT: Duration = Duration::from_secs(1);

struct Request {
    seq: u64,
    mode: VisualizationMode,
    input: Vec<u8>,
    count: usize,
}

enum Command {
    Infer(Request),
    Stop,
}

struct Reply {
    seq: u64,
    result: Result<Vec<i8>, BackendError>,
}

/// Owns the worker thread that owns the backend.
pub struct AcceleratorWorker {
    name: String,
    commands: Option<SyncSender<Command>>,
    replies: Receiver<Reply>,
    handle: Option<JoinHandle<()>>,
    next_seq: u64,
}

impl AcceleratorWorker {
    /// Move `backend` onto a new thread, initialize it and run `warmup_runs`
    /// throwaway inferences (at least one). Returns once the backend is ready.
    pub fn start(
        mut backend: Box<dyn AcceleratorBackend>,
        warmup_runs: usize,
    ) -> Result<Self, BackendError> {
        let warmup_runs = warmup_runs.max(1);
        let name = backend.name().to_string();
        let (cmd_tx, cmd_rx) = mpsc::sync_channel::<Command>(1);
        let (reply_tx, reply_rx) = mpsc::channel::<Reply>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), BackendError>>();

        let handle = thread::Builder::new()
            .name("lumen-accelerator".to_string())
            .spawn(move || {
                let ready = backend.initialize().and_then(|()| warm_up(&mut *backend, warmup_runs));
                let failed = ready.is_err();
                let _ = ready_tx.send(ready);
                if !failed {
                    serve(&mut *backend, &cmd_rx, &reply_tx);
                }
                backend.release();
            })
            .map_err(|e| BackendError::Init(format!("failed to spawn accelerator thread: {e}")))?;

        let ready = match ready_rx.recv_timeout(INIT_TIMEOUT) {
            Ok(r) => r,
            Err(RecvTimeoutError::Timeout) => Err(BackendError::Timeout(INIT_TIMEOUT)),
            Err(RecvTimeoutError::Disconnected) => Err(BackendError::Disconnected),
        };

        let mut worker = Self {
            name,
            commands: Some(cmd_tx),
            replies: reply_rx,
            handle: Some(handle),
            next_seq: 0,
        };
        match ready {
            Ok(()) => {
                tracing::info!("accelerator '{}' ready after {warmup_runs} warm-up runs", worker.name);
                Ok(worker)
            }
            Err(e) => {
                worker.shutdown();
                Err(e)
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run one inference, waiting at most `timeout` for the answer.
    pub fn infer(
        &mut self,
        mode: VisualizationMode,
        input: Vec<u8>,
        count: usize,
        timeout: Duration,
    ) -> Result<Vec<i8>, BackendError> {
        let commands = self.commands.as_ref().ok_or(BackendError::Disconnected)?;
        self.next_seq += 1;
        let seq = self.next_seq;
        match commands.try_send(Command::Infer(Request {
            seq,
            mode,
            input,
            count,
        })) {
            Ok(()) => {}
            // Still chewing on an earlier request that already timed out.
            Err(TrySendError::Full(_)) => return Err(BackendError::Timeout(timeout)),
            Err(TrySendError::Disconnected(_)) => return Err(BackendError::Disconnected),
        }

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.replies.recv_timeout(remaining) {
                Ok(reply) if reply.seq == seq => return reply.result,
                Ok(stale) => {
                    tracing::trace!("discarding late accelerator reply #{}", stale.seq);
                }
                Err(RecvTimeoutError::Timeout) => return Err(BackendError::Timeout(timeout)),
                Err(RecvTimeoutError::Disconnected) => return Err(BackendError::Disconnected),
            }
        }
    }

    fn request_stop(&mut self) {
        if let Some(commands) = self.commands.take() {
            // A full queue is fine: dropping the sender disconnects the worker
            // once it finishes the request in flight.
            let _ = commands.try_send(Command::Stop);
        }
    }

    /// Ask the worker to stop and return at once. The backend is released
    /// on the worker thread whenever it gets there.
    pub fn detach(&mut self) {
        self.request_stop();
        if self.handle.take().is_some() {
            tracing::debug!("accelerator '{}' detached", self.name);
        }
    }

    /// Stop the worker and wait (bounded) for it to release the backend.
    pub fn shutdown(&mut self) {
        self.request_stop();
        let Some(handle) = self.handle.take() else {
            return;
        };
        let deadline = Instant::now() + JOIN_TIMEOUT;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        if handle.is_finished() {
            if handle.join().is_err() {
                tracing::warn!("accelerator '{}' worker panicked", self.name);
            }
        } else {
            tracing::warn!(
                "accelerator '{}' did not stop within {JOIN_TIMEOUT:?}, detaching",
                self.name
            );
        }
    }
}

impl Drop for AcceleratorWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn warm_up(backend: &mut dyn AcceleratorBackend, runs: usize) -> Result<(), BackendError> {
    let input = vec![128u8; FEATURE_COUNT];
    let mut output = vec![0i8; WARMUP_PARTICLES * 3];
    for run in 0..runs {
        backend
            .invoke(VisualizationMode::Idle, &input, &mut output)
            .map_err(|e| BackendError::Init(format!("warm-up run {} failed: {e}", run + 1)))?;
    }
    Ok(())
}

fn serve(backend: &mut dyn AcceleratorBackend, commands: &Receiver<Command>, replies: &mpsc::Sender<Reply>) {
    while let Ok(Command::Infer(req)) = commands.recv() {
        let mut output = vec![0i8; req.count * 3];
        let result = backend
            .invoke(req.mode, &req.input, &mut output)
            .map(|()| output);
        if replies.send(Reply { seq: req.seq, result }).is_err() {
            break;
        }
    }
}

/// [`ParticlePredictor`] that quantizes features, runs them through an
/// [`AcceleratorWorker`] and dequantizes the result.
pub struct QuantizedPredictor {
    worker: AcceleratorWorker,
    timeout: Duration,
    coords: Vec<f32>,
}

impl QuantizedPredictor {
    pub fn new(worker: AcceleratorWorker, timeout: Duration) -> Self {
        Self {
            worker,
            timeout,
            coords: Vec::new(),
        }
    }

    pub fn shutdown(&mut self) {
        self.worker.shutdown();
    }

    /// Drop the accelerator without blocking the caller.
    pub fn detach(&mut self) {
        self.worker.detach();
    }
}

impl ParticlePredictor for QuantizedPredictor {
    fn name(&self) -> &str {
        self.worker.name()
    }

    fn predict(
        &mut self,
        features: &FeatureVector,
        mode: VisualizationMode,
        count: usize,
    ) -> Result<RawParticleArray, BackendError> {
        let mut input = Vec::with_capacity(FEATURE_COUNT);
        quantize_input(features.as_slice(), &mut input);
        let codes = self.worker.infer(mode, input, count, self.timeout)?;
        if codes.len() != count * 3 {
            return Err(BackendError::OutputShape {
                expected: count * 3,
                got: codes.len(),
            });
        }
        dequantize_output(&codes, &mut self.coords);
        Ok(RawParticleArray::new(self.coords.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::WORKING_RADIUS;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default, Clone)]
    struct Tally {
        invokes: Arc<AtomicUsize>,
        released: Arc<AtomicBool>,
    }

    struct Echo {
        tally: Tally,
        delay: Duration,
        fail_init: bool,
    }

    impl AcceleratorBackend for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn initialize(&mut self) -> Result<(), BackendError> {
            if self.fail_init {
                return Err(BackendError::Init("no device".into()));
            }
            Ok(())
        }

        fn invoke(
            &mut self,
            _mode: VisualizationMode,
            input: &[u8],
            output: &mut [i8],
        ) -> Result<(), BackendError> {
            self.tally.invokes.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            output.fill((input[0] / 2) as i8);
            Ok(())
        }

        fn release(&mut self) {
            self.tally.released.store(true, Ordering::SeqCst);
        }
    }

    fn echo(tally: &Tally, delay: Duration) -> Box<dyn AcceleratorBackend> {
        Box::new(Echo {
            tally: tally.clone(),
            delay,
            fail_init: false,
        })
    }

    #[test]
    fn test_warm_up_is_never_skipped() {
        let tally = Tally::default();
        let mut worker = AcceleratorWorker::start(echo(&tally, Duration::ZERO), 0).unwrap();
        assert_eq!(tally.invokes.load(Ordering::SeqCst), 1);
        worker.shutdown();
    }

    #[test]
    fn test_detach_returns_while_worker_is_busy() {
        let tally = Tally::default();
        let mut worker = AcceleratorWorker::start(echo(&tally, Duration::from_millis(300)), 1).unwrap();
        let late = worker.infer(VisualizationMode::Idle, vec![0; FEATURE_COUNT], 1, Duration::from_millis(5));
        assert!(matches!(late, Err(BackendError::Timeout(_))));

        let started = Instant::now();
        worker.detach();
        assert!(started.elapsed() < Duration::from_millis(100));
        let deadline = Instant::now() + Duration::from_secs(5);
        while !tally.released.load(Ordering::SeqCst) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(tally.released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_start_runs_warmup_and_shutdown_releases() {
        let tally = Tally::default();
        let mut worker = AcceleratorWorker::start(echo(&tally, Duration::ZERO), 3).unwrap();
        assert_eq!(tally.invokes.load(Ordering::SeqCst), 3);
        worker.shutdown();
        assert!(tally.released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_failed_init_releases_and_reports() {
        let tally = Tally::default();
        let backend = Box::new(Echo {
            tally: tally.clone(),
            delay: Duration::ZERO,
            fail_init: true,
        });
        let err = AcceleratorWorker::start(backend, 3).err().unwrap();
        assert!(matches!(err, BackendError::Init(_)));
        assert_eq!(tally.invokes.load(Ordering::SeqCst), 0);
        assert!(tally.released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_infer_returns_codes() {
        let tally = Tally::default();
        let mut worker = AcceleratorWorker::start(echo(&tally, Duration::ZERO), 0).unwrap();
        let codes = worker
            .infer(VisualizationMode::Idle, vec![100; FEATURE_COUNT], 4, Duration::from_secs(1))
            .unwrap();
        assert_eq!(codes, vec![50i8; 12]);
    }

    #[test]
    fn test_timeout_then_late_reply_discarded() {
        let tally = Tally::default();
        let mut worker = AcceleratorWorker::start(echo(&tally, Duration::from_millis(60)), 0).unwrap();
        let first = worker.infer(VisualizationMode::Idle, vec![2; FEATURE_COUNT], 1, Duration::from_millis(5));
        assert!(matches!(first, Err(BackendError::Timeout(_))));

        // Let the first request finish so its reply is queued.
        thread::sleep(Duration::from_millis(120));
        let second = worker
            .infer(VisualizationMode::Idle, vec![20; FEATURE_COUNT], 1, Duration::from_secs(1))
            .unwrap();
        assert_eq!(second, vec![10i8; 3]);
    }

    /// Answers every request with the lowest i8 code.
    struct Floor;

    impl AcceleratorBackend for Floor {
        fn name(&self) -> &str {
            "floor"
        }

        fn initialize(&mut self) -> Result<(), BackendError> {
            Ok(())
        }

        fn invoke(&mut self, _: VisualizationMode, _: &[u8], output: &mut [i8]) -> Result<(), BackendError> {
            output.fill(i8::MIN);
            Ok(())
        }

        fn release(&mut self) {}
    }

    #[test]
    fn test_lowest_code_is_clamped_to_working_volume() {
        let worker = AcceleratorWorker::start(Box::new(Floor), 1).unwrap();
        let mut predictor = QuantizedPredictor::new(worker, Duration::from_secs(1));
        let features = FeatureVector::from_values([0.5; FEATURE_COUNT]);
        let raw = predictor.predict(&features, VisualizationMode::Environment, 4).unwrap();
        assert_eq!(raw.particle_count(), 4);
        assert!(raw.within(WORKING_RADIUS));
        assert!(raw.as_slice().iter().all(|v| *v == -WORKING_RADIUS));
        predictor.shutdown();
    }

    #[test]
    fn test_quantized_predictor_dequantizes() {
        let tally = Tally::default();
        let worker = AcceleratorWorker::start(echo(&tally, Duration::ZERO), 0).unwrap();
        let mut predictor = QuantizedPredictor::new(worker, Duration::from_secs(1));
        let features = FeatureVector::from_values([0.0; FEATURE_COUNT]);
        let raw = predictor.predict(&features, VisualizationMode::Alert, 10).unwrap();
        assert_eq!(raw.particle_count(), 10);
        assert!(raw.as_slice().iter().all(|v| *v == 0.0));
        predictor.shutdown();
        assert!(tally.released.load(Ordering::SeqCst));
    }
}
