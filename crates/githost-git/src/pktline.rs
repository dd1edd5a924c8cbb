//! Git pkt-line format implementation.
//!
//! The pkt-line format is used for all git protocol communication.
//! Each line is prefixed with a 4-character hex length that counts the
//! prefix itself, or one of the special packets `0000` (flush), `0001`
//! (delimiter) and `0002` (response-end).

use crate::{GitError, Result};
use std::io::{self, Read, Write};

/// Largest packet on the wire, prefix included.
pub const MAX_PKT_LEN: usize = 65520;

/// Largest payload a single data packet can carry.
pub const MAX_PKT_DATA: usize = MAX_PKT_LEN - 4;

/// A pkt-line packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine {
    /// Data line with content.
    Data(Vec<u8>),
    /// Flush packet (0000).
    Flush,
    /// Delimiter packet (0001).
    Delimiter,
    /// Response-end packet (0002).
    ResponseEnd,
}

impl PktLine {
    /// Creates a data packet from a string slice.
    pub fn from_string(s: &str) -> Self {
        Self::Data(s.as_bytes().to_vec())
    }

    /// Creates a data packet from bytes.
    pub fn from_bytes(b: impl Into<Vec<u8>>) -> Self {
        Self::Data(b.into())
    }

    /// Encodes the packet to bytes.
    ///
    /// Callers are responsible for keeping data within [`MAX_PKT_DATA`];
    /// [`PktLineWriter`] enforces it.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Data(data) => {
                let mut result = format!("{:04x}", data.len() + 4).into_bytes();
                result.extend_from_slice(data);
                result
            }
            Self::Flush => b"0000".to_vec(),
            Self::Delimiter => b"0001".to_vec(),
            Self::ResponseEnd => b"0002".to_vec(),
        }
    }

    /// Returns true if this is a flush packet.
    pub fn is_flush(&self) -> bool {
        matches!(self, Self::Flush)
    }

    /// Returns the data content, or None for special packets.
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            Self::Data(data) => Some(data),
            _ => None,
        }
    }

    /// Returns the data as a string, trimming any trailing newline.
    pub fn as_str(&self) -> Option<&str> {
        self.data()
            .and_then(|d| std::str::from_utf8(d).ok())
            .map(|s| s.trim_end_matches('\n'))
    }
}

/// Parses a 4-byte length prefix. Both hex cases are accepted on input.
fn parse_len(prefix: &[u8; 4]) -> Result<usize> {
    let mut len = 0usize;
    for &b in prefix {
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => {
                return Err(GitError::protocol(format!(
                    "invalid pkt-line length {:?}",
                    String::from_utf8_lossy(prefix)
                )))
            }
        };
        len = (len << 4) | digit as usize;
    }
    Ok(len)
}

/// Reader for pkt-line format.
///
/// Reads exactly the bytes of each packet from the underlying reader, so
/// whatever follows the last packet (a pack stream) is left untouched.
pub struct PktLineReader<R> {
    reader: R,
}

impl<R: Read> PktLineReader<R> {
    /// Creates a new pkt-line reader.
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Reads the next packet. Returns `None` at a clean end of input.
    pub fn read(&mut self) -> Result<Option<PktLine>> {
        let mut len_buf = [0u8; 4];
        let got = read_full(&mut self.reader, &mut len_buf)?;
        if got == 0 {
            return Ok(None);
        }
        if got < len_buf.len() {
            return Err(GitError::protocol("truncated pkt-line length"));
        }

        match parse_len(&len_buf)? {
            0 => Ok(Some(PktLine::Flush)),
            1 => Ok(Some(PktLine::Delimiter)),
            2 => Ok(Some(PktLine::ResponseEnd)),
            3 => Err(GitError::protocol("pkt-line length 3 is reserved")),
            len if len > MAX_PKT_LEN => Err(GitError::protocol(format!(
                "pkt-line length {} exceeds {}",
                len, MAX_PKT_LEN
            ))),
            len => {
                let mut data = vec![0u8; len - 4];
                if read_full(&mut self.reader, &mut data)? < data.len() {
                    return Err(GitError::protocol("truncated pkt-line payload"));
                }
                Ok(Some(PktLine::Data(data)))
            }
        }
    }

    /// Reads all packets until a flush packet.
    pub fn read_until_flush(&mut self) -> Result<Vec<PktLine>> {
        let mut packets = Vec::new();
        loop {
            match self.read()? {
                Some(PktLine::Flush) | None => break,
                Some(pkt) => packets.push(pkt),
            }
        }
        Ok(packets)
    }

    /// Consumes the reader and returns the inner reader.
    pub fn into_inner(self) -> R {
        self.reader
    }
}

/// Fills `buf` as far as the input allows; returns how many bytes were read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

/// Writer for pkt-line format.
pub struct PktLineWriter<W> {
    writer: W,
}

impl<W: Write> PktLineWriter<W> {
    /// Creates a new pkt-line writer.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Writes a packet.
    pub fn write(&mut self, pkt: &PktLine) -> Result<()> {
        if let PktLine::Data(data) = pkt {
            if data.len() > MAX_PKT_DATA {
                return Err(GitError::protocol(format!(
                    "pkt-line payload of {} bytes exceeds {}",
                    data.len(),
                    MAX_PKT_DATA
                )));
            }
        }
        self.writer.write_all(&pkt.encode())?;
        Ok(())
    }

    /// Writes a data line.
    pub fn write_data(&mut self, data: &[u8]) -> Result<()> {
        self.write(&PktLine::Data(data.to_vec()))
    }

    /// Writes a string line (with newline).
    pub fn write_line(&mut self, s: &str) -> Result<()> {
        let mut data = s.as_bytes().to_vec();
        if !s.ends_with('\n') {
            data.push(b'\n');
        }
        self.write(&PktLine::Data(data))
    }

    /// Writes a flush packet.
    pub fn flush_pkt(&mut self) -> Result<()> {
        self.write(&PktLine::Flush)
    }

    /// Flushes the underlying writer.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Returns the inner writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}
