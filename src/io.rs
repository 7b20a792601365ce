//! Output seam for encoded rows.
//!
//! The encoder never owns a socket or a file. It renders complete rows and
//! hands them, one at a time, to a [`RowSink`]. The sink answers with a
//! [`WriteFlow`] so a slow consumer can push back between rows; the encoder
//! keeps undelivered rows queued and retries on the next pump.

use std::io::Write;

use crate::error::Result;

/// Flow-control answer from a sink after accepting one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteFlow {
    /// The sink can take more rows right now.
    Ready,
    /// The row was accepted, but the sink wants a pause. The encoder stops
    /// draining and resumes on a later pump.
    Full,
}

/// Destination for encoded rows.
///
/// A row handed to `write_row` is always a complete frame; sinks never see
/// partial rows and must not split them across transport boundaries that
/// cannot be reassembled in order.
pub trait RowSink {
    /// Accepts one complete row.
    fn write_row(&mut self, row: &[u8]) -> Result<WriteFlow>;

    /// Called once after the final row of a session.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Sink that concatenates rows into memory.
#[derive(Debug, Default)]
pub struct VecSink {
    buf: Vec<u8>,
    closed: bool,
}

impl VecSink {
    /// An empty in-memory sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// The bytes written so far.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// True once the encoder has closed the session.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Consumes the sink, returning the accumulated bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

impl RowSink for VecSink {
    fn write_row(&mut self, row: &[u8]) -> Result<WriteFlow> {
        self.buf.extend_from_slice(row);
        Ok(WriteFlow::Ready)
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Adapter running any [`std::io::Write`] as a row sink.
///
/// Reports `Ready` unconditionally; byte-level backpressure is left to the
/// wrapped writer's own blocking behavior.
#[derive(Debug)]
pub struct IoSink<W: Write> {
    writer: W,
}

impl<W: Write> IoSink<W> {
    /// Wraps a writer.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Unwraps the inner writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> RowSink for IoSink<W> {
    fn write_row(&mut self, row: &[u8]) -> Result<WriteFlow> {
        self.writer.write_all(row)?;
        Ok(WriteFlow::Ready)
    }

    fn close(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}
