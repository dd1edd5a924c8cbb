//! side-band-64k multiplexing.
//!
//! Each packet carries a one-byte band number followed by up to
//! [`MAX_BAND_DATA`] bytes: band 1 is pack or report data, band 2 progress
//! text, band 3 a fatal error message.

use crate::pktline::{PktLine, MAX_PKT_DATA};
use std::io::{self, Write};

/// Payload bytes per side-band packet after the band byte.
pub const MAX_BAND_DATA: usize = MAX_PKT_DATA - 1;

/// Side-band channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    /// Primary data.
    Data = 1,
    /// Progress messages.
    Progress = 2,
    /// Fatal error.
    Error = 3,
}

/// Wraps everything written to it in band-1 packets.
///
/// Writes are buffered up to one full packet so small writes from the pack
/// encoder do not each become a packet. [`SidebandWriter::finish`] flushes
/// the tail and writes the closing flush packet.
pub struct SidebandWriter<W: Write> {
    inner: W,
    pending: Vec<u8>,
}

impl<W: Write> SidebandWriter<W> {
    /// Wraps `inner`.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            pending: Vec::with_capacity(MAX_BAND_DATA),
        }
    }

    /// Flushes buffered data, writes the final flush packet and returns the
    /// inner writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.emit_pending()?;
        self.inner.write_all(&PktLine::Flush.encode())?;
        self.inner.flush()?;
        Ok(self.inner)
    }

    fn emit_pending(&mut self) -> io::Result<()> {
        if !self.pending.is_empty() {
            write_band(&mut self.inner, Band::Data, &self.pending)?;
            self.pending.clear();
        }
        Ok(())
    }
}

impl<W: Write> Write for SidebandWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let room = MAX_BAND_DATA - self.pending.len();
        let n = buf.len().min(room);
        self.pending.extend_from_slice(&buf[..n]);
        if self.pending.len() == MAX_BAND_DATA {
            self.emit_pending()?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.emit_pending()?;
        self.inner.flush()
    }
}

/// Writes `data` on `band`, split into as many packets as needed.
pub fn write_band<W: Write>(out: &mut W, band: Band, data: &[u8]) -> io::Result<()> {
    for chunk in data.chunks(MAX_BAND_DATA) {
        out.write_all(format!("{:04x}", chunk.len() + 5).as_bytes())?;
        out.write_all(&[band as u8])?;
        out.write_all(chunk)?;
    }
    Ok(())
}
