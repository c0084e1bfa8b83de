//! `git-upload-pack` request bodies.

use crate::capabilities::Capabilities;
use crate::negotiation::NegotiationRequest;
use crate::pktline::PktLineWriter;
use crate::{FetchError, Result};
use bytes::Bytes;

/// Encodes one negotiation round as a pkt-line request body.
///
/// ```text
/// want <id> <capabilities>
/// want <id>
/// shallow <id>
/// deepen <n>
/// 0000
/// have <id>
/// done          (or 0000 for a non-final round)
/// ```
///
/// Fails with [`FetchError::InvalidRequest`] when there is nothing to want.
pub fn compose_request(
    request: &NegotiationRequest,
    capabilities: &Capabilities,
    progress: bool,
) -> Result<Bytes> {
    let (first, rest) = request
        .wants
        .split_first()
        .ok_or_else(|| FetchError::invalid_request("no objects to fetch"))?;

    let tokens = capabilities.fetch_tokens(request.expects_shallow_info(), progress);

    let mut writer = PktLineWriter::new(Vec::new());
    let mut write = |line: String| -> Result<()> {
        writer
            .write_line(&line)
            .map_err(|e| FetchError::invalid_request(format!("encoding request: {e}")))
    };

    if tokens.is_empty() {
        write(format!("want {first}"))?;
    } else {
        write(format!("want {} {}", first, tokens.join(" ")))?;
    }
    for id in rest {
        write(format!("want {id}"))?;
    }
    for id in &request.shallows {
        write(format!("shallow {id}"))?;
    }
    if let Some(depth) = request.depth {
        write(format!("deepen {depth}"))?;
    }

    writer
        .flush_pkt()
        .map_err(|e| FetchError::invalid_request(format!("encoding request: {e}")))?;

    for id in &request.haves {
        writer
            .write_line(&format!("have {id}"))
            .map_err(|e| FetchError::invalid_request(format!("encoding request: {e}")))?;
    }

    let end = if request.done {
        writer.write_line("done")
    } else {
        writer.flush_pkt()
    };
    end.map_err(|e| FetchError::invalid_request(format!("encoding request: {e}")))?;

    Ok(Bytes::from(writer.into_inner()))
}
