//! Frame recordings: a flat file of `u32` little-endian length prefixes,
//! each followed by one encoded frame.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Result, RuntimeError};
use crate::sink::{FrameBytes, FrameSink, Offer};

/// Sink that appends every frame to a recording.
pub struct RecorderSink<W: Write + Send = BufWriter<File>> {
    out: W,
    frames: u64,
    failed: bool,
}

impl RecorderSink {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        tracing::info!("recording frames to {}", path.display());
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write + Send> RecorderSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            frames: 0,
            failed: false,
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        let len = u32::try_from(frame.len())
            .map_err(|_| io::Error::new(ErrorKind::InvalidInput, "frame larger than 4 GiB"))?;
        self.out.write_u32::<LittleEndian>(len)?;
        self.out.write_all(frame)?;
        self.frames += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }

    pub fn into_inner(mut self) -> io::Result<W> {
        self.out.flush()?;
        Ok(self.out)
    }
}

impl<W: Write + Send> FrameSink for RecorderSink<W> {
    fn name(&self) -> &str {
        "recorder"
    }

    fn offer(&mut self, frame: FrameBytes) -> Offer {
        if self.failed {
            return Offer::Dropped;
        }
        match self.write_frame(&frame) {
            Ok(()) => Offer::Delivered,
            Err(e) => {
                tracing::error!("recording stopped after {} frames: {e}", self.frames);
                self.failed = true;
                Offer::Dropped
            }
        }
    }
}

/// Reads frames back out of a recording.
pub struct RecordingReader<R: Read = BufReader<File>> {
    input: R,
    done: bool,
}

impl RecordingReader {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(BufReader::new(File::open(path)?)))
    }
}

impl<R: Read> RecordingReader<R> {
    pub fn new(input: R) -> Self {
        Self { input, done: false }
    }

    fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let len = match self.input.read_u32::<LittleEndian>() {
            Ok(len) => len as usize,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut frame = vec![0u8; len];
        self.input.read_exact(&mut frame).map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => {
                RuntimeError::Recording(format!("truncated frame: expected {len} bytes"))
            }
            _ => RuntimeError::Io(e),
        })?;
        Ok(Some(frame))
    }
}

impl<R: Read> Iterator for RecordingReader<R> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_frame() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::Arc;

    #[test]
    fn test_write_then_read_back() {
        let mut sink = RecorderSink::new(Vec::new());
        assert_eq!(sink.offer(Arc::from(vec![1u8, 2, 3])), Offer::Delivered);
        assert_eq!(sink.offer(Arc::from(Vec::<u8>::new())), Offer::Delivered);
        assert_eq!(sink.frames(), 2);
        let bytes = sink.into_inner().unwrap();
        assert_eq!(&bytes[..4], &3u32.to_le_bytes());

        let frames: Vec<Vec<u8>> = RecordingReader::new(Cursor::new(bytes))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(frames, vec![vec![1, 2, 3], vec![]]);
    }

    #[test]
    fn test_truncated_recording_errors_once() {
        let mut bytes = 10u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0; 4]);
        let mut reader = RecordingReader::new(Cursor::new(bytes));
        assert!(matches!(reader.next(), Some(Err(RuntimeError::Recording(_)))));
        assert!(reader.next().is_none());
    }
}
