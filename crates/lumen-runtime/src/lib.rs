//! Runtime around the `lumen-core` stages: configuration, the frame loop
//! thread, frame sinks, recordings and the health report.

pub mod config;
pub mod daemon;
pub mod error;
pub mod governor;
pub mod metrics;
pub mod pipeline;
pub mod recording;
pub mod sink;

pub use config::{CONFIG_ENV, LumenConfig};
pub use daemon::{DaemonHandle, DaemonSettings, DaemonState, PipelineDaemon};
pub use error::{Result, RuntimeError};
pub use governor::{FrameGovernor, LogThrottle};
pub use metrics::{HealthReport, MetricsRegistry, StageTimings};
pub use pipeline::{FrameOutput, FramePipeline, FrameProducer};
pub use recording::{RecorderSink, RecordingReader};
pub use sink::{ChannelSink, FanoutSink, FrameBytes, FrameSink, NullSink, Offer, UdpSink};
