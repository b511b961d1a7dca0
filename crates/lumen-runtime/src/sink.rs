//! Frame sinks.
//!
//! A sink receives encoded frames from the frame loop. `offer` must never
//! block: a sink that cannot take a frame right now drops it and says so.

use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};

use crate::error::{Result, RuntimeError};

/// Encoded frame shared between sinks without copying.
pub type FrameBytes = Arc<[u8]>;

/// Largest payload a single UDP datagram can carry.
pub const MAX_DATAGRAM: usize = 65_507;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Offer {
    Delivered,
    Dropped,
}

pub trait FrameSink: Send {
    fn name(&self) -> &str;

    fn offer(&mut self, frame: FrameBytes) -> Offer;
}

/// Accepts and discards everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl FrameSink for NullSink {
    fn name(&self) -> &str {
        "null"
    }

    fn offer(&mut self, _frame: FrameBytes) -> Offer {
        Offer::Delivered
    }
}

/// Bounded in-process queue. Full or disconnected means dropped.
pub struct ChannelSink {
    tx: SyncSender<FrameBytes>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, Receiver<FrameBytes>) {
        let (tx, rx) = mpsc::sync_channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl FrameSink for ChannelSink {
    fn name(&self) -> &str {
        "channel"
    }

    fn offer(&mut self, frame: FrameBytes) -> Offer {
        match self.tx.try_send(frame) {
            Ok(()) => Offer::Delivered,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => Offer::Dropped,
        }
    }
}

/// Fire-and-forget UDP mirror, one frame per datagram.
pub struct UdpSink {
    socket: UdpSocket,
    target: String,
    oversize_warned: bool,
}

impl UdpSink {
    pub fn connect(target: &str) -> Result<Self> {
        let addr = target
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| RuntimeError::Config(format!("'{target}' resolves to no address")))?;
        let bind = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind)?;
        socket.connect(addr)?;
        socket.set_nonblocking(true)?;
        tracing::info!("mirroring frames to udp://{addr}");
        Ok(Self {
            socket,
            target: target.to_string(),
            oversize_warned: false,
        })
    }

    /// Warn up front when frames of `max_frame_bytes` cannot fit a datagram.
    /// Returns whether they fit.
    pub fn check_frame_size(&mut self, max_frame_bytes: usize) -> bool {
        if max_frame_bytes <= MAX_DATAGRAM {
            return true;
        }
        tracing::warn!(
            "frames up to {max_frame_bytes} bytes exceed a UDP datagram ({MAX_DATAGRAM}); oversize frames will not reach {} (reduce particle counts or use position attributes)",
            self.target
        );
        self.oversize_warned = true;
        false
    }
}

impl FrameSink for UdpSink {
    fn name(&self) -> &str {
        "udp"
    }

    fn offer(&mut self, frame: FrameBytes) -> Offer {
        if frame.len() > MAX_DATAGRAM {
            if !self.oversize_warned {
                tracing::warn!(
                    "frame of {} bytes exceeds a UDP datagram, not sending to {} (reduce particle counts or use position attributes)",
                    frame.len(),
                    self.target
                );
                self.oversize_warned = true;
            }
            return Offer::Dropped;
        }
        match self.socket.send(&frame) {
            Ok(_) => Offer::Delivered,
            Err(e) => {
                tracing::debug!("udp send to {} failed: {e}", self.target);
                Offer::Dropped
            }
        }
    }
}

/// Offers each frame to every inner sink. Delivered if any of them took it.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn FrameSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sink: Box<dyn FrameSink>) {
        self.sinks.push(sink);
    }

    pub fn with(mut self, sink: Box<dyn FrameSink>) -> Self {
        self.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl FrameSink for FanoutSink {
    fn name(&self) -> &str {
        "fanout"
    }

    fn offer(&mut self, frame: FrameBytes) -> Offer {
        let mut delivered = false;
        for sink in &mut self.sinks {
            if sink.offer(Arc::clone(&frame)) == Offer::Delivered {
                delivered = true;
            }
        }
        if delivered { Offer::Delivered } else { Offer::Dropped }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(n: u8) -> FrameBytes {
        Arc::from(vec![n; 4])
    }

    #[test]
    fn test_channel_sink_drops_when_full() {
        let (mut sink, rx) = ChannelSink::new(2);
        assert_eq!(sink.offer(frame(1)), Offer::Delivered);
        assert_eq!(sink.offer(frame(2)), Offer::Delivered);
        assert_eq!(sink.offer(frame(3)), Offer::Dropped);
        assert_eq!(rx.recv().unwrap()[0], 1);
        assert_eq!(sink.offer(frame(4)), Offer::Delivered);
        drop(rx);
        assert_eq!(sink.offer(frame(5)), Offer::Dropped);
    }

    #[test]
    fn test_fanout_delivered_if_any() {
        let (full, _rx) = ChannelSink::new(1);
        let mut fanout = FanoutSink::new().with(Box::new(full));
        assert_eq!(fanout.offer(frame(1)), Offer::Delivered);
        assert_eq!(fanout.offer(frame(2)), Offer::Dropped);
        fanout.push(Box::new(NullSink));
        assert_eq!(fanout.offer(frame(3)), Offer::Delivered);
        assert_eq!(fanout.len(), 2);
        assert_eq!(FanoutSink::new().offer(frame(0)), Offer::Dropped);
    }

    #[test]
    fn test_udp_sink_sends_datagram() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .unwrap();
        let addr = receiver.local_addr().unwrap().to_string();
        let mut sink = UdpSink::connect(&addr).unwrap();
        assert_eq!(sink.offer(frame(7)), Offer::Delivered);
        let mut buf = [0u8; 16];
        let n = receiver.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[7, 7, 7, 7]);
    }

    #[test]
    fn test_udp_sink_drops_oversize() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut sink = UdpSink::connect(&receiver.local_addr().unwrap().to_string()).unwrap();
        let big: FrameBytes = Arc::from(vec![0u8; MAX_DATAGRAM + 1]);
        assert_eq!(sink.offer(big), Offer::Dropped);
    }

    #[test]
    fn test_udp_sink_frame_size_check() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut sink = UdpSink::connect(&receiver.local_addr().unwrap().to_string()).unwrap();
        assert!(sink.check_frame_size(MAX_DATAGRAM));
        assert!(!sink.oversize_warned);
        assert!(!sink.check_frame_size(MAX_DATAGRAM + 1));
        assert!(sink.oversize_warned);
    }
}
