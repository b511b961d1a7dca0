//! Binary frame format.
//!
//! ```text
//! offset  size  field
//! 0       1     version (PROTOCOL_VERSION)
//! 1       1     attributes per particle: 3 = xyz, 8 = xyz rgb size glow
//! 2       1     mode id
//! 3       1     flags: bit0 accelerated engine, bit1 blending
//! 4       4     frame_id (u32)
//! 8       8     timestamp_ms (u64, since daemon start)
//! 16      4     particle_count (u32)
//! 20      4     fps (f32)
//! 24      4     inference_ms (f32)
//! 28      4     total_ms (f32)
//! 32      ...   particle_count × k × f32, particle-major
//! ```
//!
//! Everything is little-endian.

use std::fmt;
use std::str::FromStr;

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::constants::{HEADER_SIZE, PROTOCOL_VERSION};
use crate::modes::VisualizationMode;
use crate::particle::ParticleSet;

pub const FLAG_ACCELERATED: u8 = 0b01;
pub const FLAG_BLENDING: u8 = 0b10;

#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    TooShort { len: usize },
    UnsupportedVersion(u8),
    UnknownAttributeCount(u8),
    PayloadLength { expected: usize, got: usize },
    TooManyParticles(usize),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::TooShort { len } => {
                write!(f, "frame of {len} bytes is shorter than the {HEADER_SIZE}-byte header")
            }
            ProtocolError::UnsupportedVersion(v) => write!(f, "unsupported protocol version {v}"),
            ProtocolError::UnknownAttributeCount(k) => {
                write!(f, "unknown attribute count {k} (expected 3 or 8)")
            }
            ProtocolError::PayloadLength { expected, got } => {
                write!(f, "payload is {got} bytes, header implies {expected}")
            }
            ProtocolError::TooManyParticles(n) => write!(f, "{n} particles do not fit a frame"),
        }
    }
}

impl std::error::Error for ProtocolError {}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Which per-particle attributes go on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeLayout {
    Position,
    #[default]
    Full,
}

impl AttributeLayout {
    pub const fn k(self) -> usize {
        match self {
            AttributeLayout::Position => 3,
            AttributeLayout::Full => 8,
        }
    }

    pub fn from_k(k: u8) -> Option<Self> {
        match k {
            3 => Some(AttributeLayout::Position),
            8 => Some(AttributeLayout::Full),
            _ => None,
        }
    }
}

impl FromStr for AttributeLayout {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "position" | "xyz" => Ok(AttributeLayout::Position),
            "full" => Ok(AttributeLayout::Full),
            other => Err(format!("unknown attribute layout '{other}' (position|full)")),
        }
    }
}

/// Per-frame metadata supplied by the daemon.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameMeta {
    pub frame_id: u32,
    pub timestamp_ms: u64,
    pub mode: VisualizationMode,
    pub accelerated: bool,
    pub blending: bool,
    pub fps: f32,
    pub inference_ms: f32,
    pub total_ms: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct FrameHeader {
    pub version: u8,
    pub layout: AttributeLayout,
    pub mode_id: u8,
    pub flags: u8,
    pub frame_id: u32,
    pub timestamp_ms: u64,
    pub particle_count: u32,
    pub fps: f32,
    pub inference_ms: f32,
    pub total_ms: f32,
}

impl FrameHeader {
    pub const SIZE: usize = HEADER_SIZE;

    fn write(&self, out: &mut [u8]) {
        out[0] = self.version;
        out[1] = self.layout.k() as u8;
        out[2] = self.mode_id;
        out[3] = self.flags;
        LittleEndian::write_u32(&mut out[4..8], self.frame_id);
        LittleEndian::write_u64(&mut out[8..16], self.timestamp_ms);
        LittleEndian::write_u32(&mut out[16..20], self.particle_count);
        LittleEndian::write_f32(&mut out[20..24], self.fps);
        LittleEndian::write_f32(&mut out[24..28], self.inference_ms);
        LittleEndian::write_f32(&mut out[28..32], self.total_ms);
    }

    /// Parse the header only. The payload is not checked.
    pub fn peek(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(ProtocolError::TooShort { len: bytes.len() });
        }
        if bytes[0] != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(bytes[0]));
        }
        let layout = AttributeLayout::from_k(bytes[1]).ok_or(ProtocolError::UnknownAttributeCount(bytes[1]))?;
        Ok(Self {
            version: bytes[0],
            layout,
            mode_id: bytes[2],
            flags: bytes[3],
            frame_id: LittleEndian::read_u32(&bytes[4..8]),
            timestamp_ms: LittleEndian::read_u64(&bytes[8..16]),
            particle_count: LittleEndian::read_u32(&bytes[16..20]),
            fps: LittleEndian::read_f32(&bytes[20..24]),
            inference_ms: LittleEndian::read_f32(&bytes[24..28]),
            total_ms: LittleEndian::read_f32(&bytes[28..32]),
        })
    }

    pub fn mode(&self) -> Option<VisualizationMode> {
        VisualizationMode::from_wire_id(self.mode_id)
    }

    pub fn is_accelerated(&self) -> bool {
        self.flags & FLAG_ACCELERATED != 0
    }

    pub fn is_blending(&self) -> bool {
        self.flags & FLAG_BLENDING != 0
    }

    pub fn payload_len(&self) -> usize {
        self.particle_count as usize * self.layout.k() * 4
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ProtocolEncoder {
    layout: AttributeLayout,
}

impl ProtocolEncoder {
    pub fn new(layout: AttributeLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> AttributeLayout {
        self.layout
    }

    pub fn encode(&self, particles: &ParticleSet, meta: &FrameMeta) -> Result<Vec<u8>> {
        let count = u32::try_from(particles.len()).map_err(|_| ProtocolError::TooManyParticles(particles.len()))?;
        let k = self.layout.k();
        let mut flags = 0;
        if meta.accelerated {
            flags |= FLAG_ACCELERATED;
        }
        if meta.blending {
            flags |= FLAG_BLENDING;
        }
        let header = FrameHeader {
            version: PROTOCOL_VERSION,
            layout: self.layout,
            mode_id: meta.mode.wire_id(),
            flags,
            frame_id: meta.frame_id,
            timestamp_ms: meta.timestamp_ms,
            particle_count: count,
            fps: meta.fps,
            inference_ms: meta.inference_ms,
            total_ms: meta.total_ms,
        };

        let mut out = vec![0u8; HEADER_SIZE + header.payload_len()];
        header.write(&mut out[..HEADER_SIZE]);

        for (p, chunk) in particles.iter().zip(out[HEADER_SIZE..].chunks_exact_mut(k * 4)) {
            let [x, y, z] = p.position.to_array();
            let [r, g, b] = p.color;
            let attrs = [x, y, z, r, g, b, p.size, p.glow];
            LittleEndian::write_f32_into(&attrs[..k], chunk);
        }
        Ok(out)
    }
}

/// A parsed frame.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedFrame {
    pub header: FrameHeader,
    /// `particle_count × k` floats in wire order.
    pub values: Vec<f32>,
}

impl DecodedFrame {
    pub fn particle_count(&self) -> usize {
        self.header.particle_count as usize
    }

    /// Attributes of particle `i`, or `None` past the end.
    pub fn particle(&self, i: usize) -> Option<&[f32]> {
        let k = self.header.layout.k();
        self.values.get(i * k..(i + 1) * k)
    }

    pub fn positions(&self) -> impl Iterator<Item = [f32; 3]> + '_ {
        let k = self.header.layout.k();
        self.values.chunks_exact(k).map(|c| [c[0], c[1], c[2]])
    }
}

pub fn decode(bytes: &[u8]) -> Result<DecodedFrame> {
    let header = FrameHeader::peek(bytes)?;
    let expected = header.payload_len();
    let got = bytes.len() - HEADER_SIZE;
    if got != expected {
        return Err(ProtocolError::PayloadLength { expected, got });
    }
    let mut values = vec![0f32; expected / 4];
    LittleEndian::read_f32_into(&bytes[HEADER_SIZE..], &mut values);
    Ok(DecodedFrame { header, values })
}
