//! pkt-line framing for the smart protocol.
//!
//! Every line of the smart protocol is prefixed with a 4-character hex length
//! that includes the prefix itself. `0000` is a flush packet, `0001` and
//! `0002` are the delimiter and response-end packets.

use crate::{FetchError, Result};
use std::io::Write;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest pkt-line on the wire, prefix included.
pub const MAX_PKT_LEN: usize = 65520;

/// A pkt-line packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine {
    /// Payload bytes, newline included if the sender added one.
    Data(Vec<u8>),
    /// Flush packet (0000).
    Flush,
    /// `0001`, separates sections in protocol v2.
    Delimiter,
    /// `0002`, ends a stateless response.
    ResponseEnd,
}

impl PktLine {
    /// Data packet holding `s` as-is.
    pub fn from_string(s: &str) -> Self {
        Self::Data(s.as_bytes().to_vec())
    }

    /// Data packet holding `b`.
    pub fn from_bytes(b: impl Into<Vec<u8>>) -> Self {
        Self::Data(b.into())
    }

    /// Wire form, length prefix included.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Data(data) => {
                let len = data.len() + 4;
                let mut out = format!("{len:04x}").into_bytes();
                out.extend_from_slice(data);
                out
            }
            Self::Flush => b"0000".to_vec(),
            Self::Delimiter => b"0001".to_vec(),
            Self::ResponseEnd => b"0002".to_vec(),
        }
    }

    pub fn is_flush(&self) -> bool {
        matches!(self, Self::Flush)
    }

    /// Payload of a data packet.
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            Self::Data(data) => Some(data),
            _ => None,
        }
    }

    /// Payload as UTF-8 without its trailing newline.
    pub fn as_str(&self) -> Option<&str> {
        self.data()
            .and_then(|d| std::str::from_utf8(d).ok())
            .map(|s| s.trim_end_matches('\n'))
    }
}

/// Reader for pkt-line format over an async byte stream.
///
/// The reader never buffers past the packet it returns, so the inner reader
/// can be taken back with [`PktLineReader::into_inner`] to continue with raw
/// bytes (a pack sent without side-band).
pub struct PktLineReader<R> {
    reader: R,
}

impl<R: AsyncRead + Unpin> PktLineReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Reads the next packet.
    ///
    /// Returns `None` when the stream ends cleanly between packets.
    pub async fn read(&mut self) -> Result<Option<PktLine>> {
        let mut len_buf = [0u8; 4];
        let mut filled = 0;
        while filled < len_buf.len() {
            let n = self
                .reader
                .read(&mut len_buf[filled..])
                .await
                .map_err(|e| FetchError::from_read(e, "reading pkt-line length"))?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        match filled {
            0 => return Ok(None),
            4 => {}
            _ => return Err(FetchError::truncated("stream ended inside a pkt-line length")),
        }

        let len_str = std::str::from_utf8(&len_buf)
            .map_err(|_| FetchError::protocol("invalid pkt-line length prefix"))?;

        match len_str {
            "0000" => Ok(Some(PktLine::Flush)),
            "0001" => Ok(Some(PktLine::Delimiter)),
            "0002" => Ok(Some(PktLine::ResponseEnd)),
            _ => {
                let len = u16::from_str_radix(len_str, 16).map_err(|_| {
                    FetchError::protocol(format!("invalid pkt-line length {len_str:?}"))
                })? as usize;

                if len < 4 {
                    return Err(FetchError::protocol(format!(
                        "pkt-line length {len} too small"
                    )));
                }
                if len > MAX_PKT_LEN {
                    return Err(FetchError::protocol(format!(
                        "pkt-line length {len} exceeds {MAX_PKT_LEN}"
                    )));
                }

                let mut data = vec![0u8; len - 4];
                self.reader
                    .read_exact(&mut data)
                    .await
                    .map_err(|e| FetchError::from_read(e, "inside a pkt-line"))?;

                Ok(Some(PktLine::Data(data)))
            }
        }
    }

    /// Collects packets up to the next flush.
    ///
    /// Fails with [`FetchError::TruncatedPack`] if the stream ends first.
    pub async fn read_until_flush(&mut self) -> Result<Vec<PktLine>> {
        let mut packets = Vec::new();
        loop {
            match self.read().await? {
                Some(PktLine::Flush) => break,
                Some(pkt) => packets.push(pkt),
                None => return Err(FetchError::truncated("stream ended before flush-pkt")),
            }
        }
        Ok(packets)
    }

    /// Underlying reader, for data that follows the pkt-line section.
    pub fn inner_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

/// Appends pkt-lines to a synchronous writer, usually a request body buffer.
pub struct PktLineWriter<W> {
    writer: W,
}

impl<W: Write> PktLineWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Writes a packet.
    pub fn write(&mut self, pkt: &PktLine) -> std::io::Result<()> {
        self.writer.write_all(&pkt.encode())
    }

    /// Writes a data line.
    pub fn write_data(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.write(&PktLine::Data(data.to_vec()))
    }

    /// Writes `s`, appending `\n` when missing.
    pub fn write_line(&mut self, s: &str) -> std::io::Result<()> {
        let mut data = s.as_bytes().to_vec();
        if !s.ends_with('\n') {
            data.push(b'\n');
        }
        self.write(&PktLine::Data(data))
    }

    /// Writes `0000`.
    pub fn flush_pkt(&mut self) -> std::io::Result<()> {
        self.write(&PktLine::Flush)
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}
