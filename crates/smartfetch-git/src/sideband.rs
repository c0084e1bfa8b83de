//! Side-band demultiplexing of the pack response.
//!
//! With `side-band` or `side-band-64k` every pkt-line of the pack section
//! starts with a channel byte and the section ends with a flush-pkt. Without
//! side-band the rest of the response body is the raw pack.

use crate::pktline::{PktLine, PktLineReader};
use crate::{FetchError, Result};
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Callback receiving progress text from the server, verbatim.
pub type Progress = Arc<dyn Fn(&str) + Send + Sync>;

/// Read size for a pack sent without side-band.
const RAW_CHUNK: usize = 64 * 1024;

/// Side-band channel numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Pack data.
    Data = 1,
    /// Progress messages.
    Progress = 2,
    /// Fatal error message; the server stops after it.
    Error = 3,
}

impl Channel {
    /// Maps a channel byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Data),
            2 => Some(Self::Progress),
            3 => Some(Self::Error),
            _ => None,
        }
    }
}

/// Source of pack bytes, demultiplexed when side-band is in use.
pub(crate) struct PackSource<R> {
    reader: PktLineReader<R>,
    side_band: bool,
    progress: Option<Progress>,
    done: bool,
}

impl<R> fmt::Debug for PackSource<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackSource")
            .field("side_band", &self.side_band)
            .field("progress", &self.progress.is_some())
            .field("done", &self.done)
            .finish()
    }
}

impl<R: AsyncRead + Unpin> PackSource<R> {
    pub(crate) fn new(reader: PktLineReader<R>, side_band: bool, progress: Option<Progress>) -> Self {
        Self {
            reader,
            side_band,
            progress,
            done: false,
        }
    }

    /// Returns the next chunk of pack bytes, or `None` at the end of the pack
    /// section.
    pub(crate) async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        if self.done {
            return Ok(None);
        }
        if !self.side_band {
            return self.next_raw().await;
        }

        loop {
            let data = match self.reader.read().await? {
                Some(PktLine::Data(data)) => data,
                Some(PktLine::Flush) => {
                    self.done = true;
                    return Ok(None);
                }
                Some(other) => {
                    return Err(FetchError::protocol(format!(
                        "unexpected {other:?} in side-band stream"
                    )))
                }
                None => {
                    return Err(FetchError::truncated(
                        "side-band stream ended before flush-pkt",
                    ))
                }
            };

            let (&channel, payload) = data
                .split_first()
                .ok_or_else(|| FetchError::protocol("empty side-band packet"))?;

            match Channel::from_byte(channel) {
                Some(Channel::Data) => {
                    if payload.is_empty() {
                        continue;
                    }
                    return Ok(Some(payload.to_vec()));
                }
                Some(Channel::Progress) => {
                    if let Some(progress) = &self.progress {
                        progress(&String::from_utf8_lossy(payload));
                    }
                }
                Some(Channel::Error) => {
                    let message = String::from_utf8_lossy(payload);
                    return Err(FetchError::RemoteError(message.trim_end().to_string()));
                }
                None => {
                    return Err(FetchError::protocol(format!(
                        "unknown side-band channel {channel}"
                    )))
                }
            }
        }
    }

    async fn next_raw(&mut self) -> Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; RAW_CHUNK];
        let n = self
            .reader
            .inner_mut()
            .read(&mut buf)
            .await
            .map_err(|e| FetchError::from_read(e, "reading pack"))?;
        if n == 0 {
            self.done = true;
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pktline::PktLineWriter;
    use parking_lot::Mutex;

    fn side_band(packets: &[(u8, &[u8])], flush: bool) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut writer = PktLineWriter::new(&mut buf);
        for (channel, payload) in packets {
            let mut data = vec![*channel];
            data.extend_from_slice(payload);
            writer.write_data(&data).unwrap();
        }
        if flush {
            writer.flush_pkt().unwrap();
        }
        buf
    }

    async fn drain<R: AsyncRead + Unpin>(source: &mut PackSource<R>) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = source.next_chunk().await? {
            out.extend(chunk);
        }
        Ok(out)
    }

    #[tokio::test]
    async fn test_demultiplex_data_and_progress() {
        let body = side_band(
            &[
                (2, b"Counting objects: 1\r"),
                (1, b"PA"),
                (2, b"done.\n"),
                (1, b"CK"),
            ],
            true,
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let progress: Progress = Arc::new(move |text: &str| sink.lock().push(text.to_string()));

        let mut source = PackSource::new(PktLineReader::new(body.as_slice()), true, Some(progress));
        assert_eq!(drain(&mut source).await.unwrap(), b"PACK");
        assert_eq!(
            *seen.lock(),
            vec!["Counting objects: 1\r".to_string(), "done.\n".to_string()]
        );
        assert_eq!(source.next_chunk().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_error_channel() {
        let body = side_band(&[(1, b"PA"), (3, b"pack-objects died\n")], true);
        let mut source = PackSource::new(PktLineReader::new(body.as_slice()), true, None);
        let result = drain(&mut source).await;
        assert!(matches!(result, Err(FetchError::RemoteError(m)) if m == "pack-objects died"));
    }

    #[tokio::test]
    async fn test_missing_flush_is_truncation() {
        let body = side_band(&[(1, b"PACK")], false);
        let mut source = PackSource::new(PktLineReader::new(body.as_slice()), true, None);
        assert!(matches!(
            drain(&mut source).await,
            Err(FetchError::TruncatedPack(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_channel() {
        let body = side_band(&[(7, b"??")], true);
        let mut source = PackSource::new(PktLineReader::new(body.as_slice()), true, None);
        assert!(matches!(
            drain(&mut source).await,
            Err(FetchError::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_raw_stream() {
        let body = b"PACK raw bytes".to_vec();
        let mut source = PackSource::new(PktLineReader::new(body.as_slice()), false, None);
        assert_eq!(drain(&mut source).await.unwrap(), body);
    }

    #[test]
    fn test_channel_from_byte() {
        assert_eq!(Channel::from_byte(1), Some(Channel::Data));
        assert_eq!(Channel::from_byte(3), Some(Channel::Error));
        assert_eq!(Channel::from_byte(0), None);
    }
}
