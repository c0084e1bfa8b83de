//! Ref advertisement parsing.
//!
//! Parses the body of `GET {url}/info/refs?service=git-upload-pack`:
//!
//! ```text
//! 001e# service=git-upload-pack\n
//! 0000
//! 00..<hex> HEAD\0<capabilities>\n
//! 00..<hex> refs/heads/main\n
//! 0000
//! ```
//!
//! See: https://git-scm.com/docs/http-protocol

use crate::capabilities::Capabilities;
use crate::pktline::{PktLine, PktLineReader};
use crate::{FetchError, Result};
use serde::Serialize;
use smartfetch_storage::ObjectId;
use tokio::io::AsyncRead;

/// Name used in the placeholder line of an empty repository.
const NO_REFS_MARKER: &str = "capabilities^{}";

/// A ref advertised by the remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ref {
    /// Full ref name, e.g. `refs/heads/main`.
    pub name: String,
    /// Object the ref points at.
    pub id: ObjectId,
}

/// The parsed `info/refs` response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefAdvertisement {
    /// Capabilities from the first line.
    pub capabilities: Capabilities,
    /// Refs in the order the server sent them.
    pub refs: Vec<Ref>,
}

impl RefAdvertisement {
    /// Looks up a ref by name.
    pub fn get(&self, name: &str) -> Option<&Ref> {
        self.refs.iter().find(|r| r.name == name)
    }
}

/// Parses a smart-HTTP ref advertisement for `service`.
///
/// Truncated or malformed input fails with [`FetchError::ProtocolViolation`].
/// A repository without refs is valid and yields an empty list.
pub async fn parse_advertisement<R: AsyncRead + Unpin>(
    reader: R,
    service: &str,
) -> Result<RefAdvertisement> {
    let mut reader = PktLineReader::new(reader);

    let announcement = next_packet(&mut reader).await?;
    let line = announcement
        .as_str()
        .ok_or_else(|| FetchError::protocol("expected service announcement"))?;
    check_remote_error(line)?;
    match line.strip_prefix("# service=") {
        Some(name) if name == service => {}
        Some(name) => {
            return Err(FetchError::protocol(format!(
                "expected service {service}, server announced {name}"
            )))
        }
        None => {
            return Err(FetchError::protocol(format!(
                "expected service announcement, got {line:?}"
            )))
        }
    }

    let mut advertisement = RefAdvertisement::default();
    let mut skip_flush = true;
    let mut lines = 0usize;

    loop {
        let data = match next_packet(&mut reader).await? {
            PktLine::Flush if skip_flush && lines == 0 => {
                skip_flush = false;
                continue;
            }
            PktLine::Flush => break,
            PktLine::Data(data) => data,
            other => {
                return Err(FetchError::protocol(format!(
                    "unexpected {other:?} in ref advertisement"
                )))
            }
        };

        let (head, caps) = match data.iter().position(|&b| b == 0) {
            Some(pos) => (&data[..pos], Some(&data[pos + 1..])),
            None => (&data[..], None),
        };

        if lines == 0 {
            if let Some(caps) = caps {
                let caps = std::str::from_utf8(caps)
                    .map_err(|_| FetchError::protocol("capabilities are not utf-8"))?;
                advertisement.capabilities = Capabilities::parse(caps.trim_end_matches('\n'));
            }
        }
        lines += 1;

        let head = std::str::from_utf8(head)
            .map_err(|_| FetchError::protocol("ref line is not utf-8"))?
            .trim_end_matches('\n');
        check_remote_error(head)?;

        let (hex, name) = head
            .split_once(' ')
            .ok_or_else(|| FetchError::protocol(format!("ref line without separator: {head:?}")))?;
        let id = ObjectId::from_hex(hex)
            .map_err(|e| FetchError::protocol(format!("bad ref line {head:?}: {e}")))?;

        if name == NO_REFS_MARKER || name.ends_with("^{}") {
            continue;
        }
        if name.is_empty() {
            return Err(FetchError::protocol(format!("ref line without name: {head:?}")));
        }

        advertisement.refs.push(Ref {
            name: name.to_string(),
            id,
        });
    }

    tracing::debug!(
        refs = advertisement.refs.len(),
        capabilities = advertisement.capabilities.len(),
        "Parsed ref advertisement"
    );
    Ok(advertisement)
}

async fn next_packet<R: AsyncRead + Unpin>(reader: &mut PktLineReader<R>) -> Result<PktLine> {
    match reader.read().await {
        Ok(Some(pkt)) => Ok(pkt),
        Ok(None) => Err(FetchError::protocol(
            "ref advertisement ended before flush-pkt",
        )),
        Err(FetchError::TruncatedPack(message)) => Err(FetchError::ProtocolViolation(message)),
        Err(e) => Err(e),
    }
}

fn check_remote_error(line: &str) -> Result<()> {
    match line.strip_prefix("ERR ") {
        Some(message) => Err(FetchError::RemoteError(message.to_string())),
        None => Ok(()),
    }
}
