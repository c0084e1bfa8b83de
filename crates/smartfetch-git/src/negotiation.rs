//! Want/have negotiation.
//!
//! [`Negotiator`] is a pure state machine: it hands out one
//! [`NegotiationRequest`] per round and is fed the server's acknowledgements
//! in between. It performs no I/O, so the same engine drives real HTTP
//! round-trips and unit tests alike.
//!
//! Smart HTTP is stateless, so every round repeats the wants, the shallow
//! lines, the depth and every have the server already acknowledged as common.
//! New haves are added in windows that double each round up to
//! [`NegotiationConfig::max_window`]. The last round always carries `done`,
//! either because the server said `ready`, the haves ran out, or the round
//! budget was spent.

use crate::pktline::{PktLine, PktLineReader};
use crate::{FetchError, Result};
use serde::{Deserialize, Serialize};
use smartfetch_storage::ObjectId;
use std::collections::{HashSet, VecDeque};
use tokio::io::AsyncRead;

/// Tunables for the negotiation loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    /// Haves sent in the first round.
    pub initial_window: usize,
    /// Upper bound for the doubling window.
    pub max_window: usize,
    /// Rounds before falling back to `done`.
    pub max_rounds: usize,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            initial_window: 16,
            max_window: 256,
            max_rounds: 8,
        }
    }
}

/// Everything the engine needs to know about both sides.
#[derive(Debug, Clone, Default)]
pub struct NegotiationInput {
    /// Ids advertised by the remote.
    pub remote: Vec<ObjectId>,
    /// Ids the local object store already has. Doubles as the have list.
    pub local: Vec<ObjectId>,
    /// Ids selected by the refspecs.
    pub wanted: Vec<ObjectId>,
    /// Current shallow boundaries.
    pub shallows: Vec<ObjectId>,
    /// Requested history depth.
    pub depth: Option<u32>,
    /// Fetch the full history behind the current shallow boundaries.
    pub unshallow: bool,
}

/// One round of negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationRequest {
    /// Objects to fetch.
    pub wants: Vec<ObjectId>,
    /// Objects the client already has.
    pub haves: Vec<ObjectId>,
    /// Local shallow boundaries.
    pub shallows: Vec<ObjectId>,
    /// `deepen` argument.
    pub depth: Option<u32>,
    /// Final round; the server answers with a pack.
    pub done: bool,
}

impl NegotiationRequest {
    /// Returns true if the server will answer with a shallow-info section.
    pub fn expects_shallow_info(&self) -> bool {
        self.depth.is_some() || !self.shallows.is_empty()
    }
}

/// A server acknowledgement line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    /// `NAK`: nothing in common (yet).
    Nak,
    /// `ACK <id>`: final acknowledgement, the pack follows.
    Ack(ObjectId),
    /// `ACK <id> common`.
    Common(ObjectId),
    /// `ACK <id> ready`: the server can build a good pack now.
    Ready(ObjectId),
    /// `ACK <id> continue` (plain `multi_ack`).
    Continue(ObjectId),
}

impl Acknowledgement {
    /// Parses an acknowledgement line (without trailing newline).
    pub fn parse(line: &str) -> Result<Self> {
        if line == "NAK" {
            return Ok(Self::Nak);
        }
        if let Some(message) = line.strip_prefix("ERR ") {
            return Err(FetchError::RemoteError(message.to_string()));
        }

        let rest = line
            .strip_prefix("ACK ")
            .ok_or_else(|| FetchError::protocol(format!("expected ACK or NAK, got {line:?}")))?;
        let (hex, status) = match rest.split_once(' ') {
            Some((hex, status)) => (hex, Some(status)),
            None => (rest, None),
        };
        let id = ObjectId::from_hex(hex)
            .map_err(|e| FetchError::protocol(format!("bad ACK line {line:?}: {e}")))?;

        match status {
            None => Ok(Self::Ack(id)),
            Some("common") => Ok(Self::Common(id)),
            Some("ready") => Ok(Self::Ready(id)),
            Some("continue") => Ok(Self::Continue(id)),
            Some(other) => Err(FetchError::protocol(format!(
                "unknown ACK status {other:?}"
            ))),
        }
    }

    /// Returns true for lines that end the acknowledgement section of a
    /// final response.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Nak | Self::Ack(_))
    }

    /// Returns the acknowledged id, if any.
    pub fn id(&self) -> Option<ObjectId> {
        match self {
            Self::Nak => None,
            Self::Ack(id) | Self::Common(id) | Self::Ready(id) | Self::Continue(id) => Some(*id),
        }
    }
}

/// The negotiation state machine.
#[derive(Debug, Clone)]
pub struct Negotiator {
    wants: Vec<ObjectId>,
    shallows: Vec<ObjectId>,
    depth: Option<u32>,
    pending: VecDeque<ObjectId>,
    sent: Vec<ObjectId>,
    common: Vec<ObjectId>,
    window: usize,
    config: NegotiationConfig,
    rounds: usize,
    ready: bool,
    finished: bool,
}

impl Negotiator {
    /// Builds the engine from both sides' state.
    pub fn new(input: NegotiationInput, config: NegotiationConfig) -> Self {
        let local: HashSet<ObjectId> = input.local.iter().copied().collect();
        let wanted: HashSet<ObjectId> = input.wanted.iter().copied().collect();
        // A shallow tip is present locally but its history is not.
        let refetch_present = input.unshallow && !input.shallows.is_empty();

        let mut seen = HashSet::new();
        let wants: Vec<ObjectId> = input
            .remote
            .iter()
            .copied()
            .filter(|id| wanted.contains(id))
            .filter(|id| refetch_present || !local.contains(id))
            .filter(|id| seen.insert(*id))
            .collect();

        let (shallows, depth, pending) = if input.unshallow {
            (Vec::new(), None, VecDeque::new())
        } else {
            let mut seen = HashSet::new();
            let haves = input
                .local
                .iter()
                .copied()
                .filter(|id| seen.insert(*id))
                .collect();
            (input.shallows, input.depth, haves)
        };

        Self {
            wants,
            shallows,
            depth,
            pending,
            sent: Vec::new(),
            common: Vec::new(),
            window: config.initial_window.max(1),
            config,
            rounds: 0,
            ready: false,
            finished: false,
        }
    }

    /// Objects that will be requested.
    pub fn wants(&self) -> &[ObjectId] {
        &self.wants
    }

    /// Returns true if there is anything to fetch.
    pub fn has_wants(&self) -> bool {
        !self.wants.is_empty()
    }

    /// Haves acknowledged as common so far.
    pub fn common(&self) -> &[ObjectId] {
        &self.common
    }

    /// Number of requests handed out.
    pub fn rounds(&self) -> usize {
        self.rounds
    }

    /// Returns true once the `done` request was handed out.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Returns true if responses carry a shallow-info section.
    pub fn expects_shallow_info(&self) -> bool {
        self.depth.is_some() || !self.shallows.is_empty()
    }

    /// Produces the next request, or `None` when negotiation is over.
    pub fn next_request(&mut self) -> Option<NegotiationRequest> {
        if self.finished || self.wants.is_empty() {
            return None;
        }

        let take = self.window.min(self.pending.len());
        let batch: Vec<ObjectId> = self.pending.drain(..take).collect();
        self.sent.extend_from_slice(&batch);
        self.rounds += 1;

        let done = self.ready
            || self.pending.is_empty()
            || self.rounds >= self.config.max_rounds.max(1);

        let haves = if self.common.is_empty() {
            if done {
                self.sent.clone()
            } else {
                batch
            }
        } else {
            let mut haves = self.common.clone();
            haves.extend(batch.into_iter().filter(|id| !self.common.contains(id)));
            haves
        };

        if done {
            self.finished = true;
        } else {
            self.window = (self.window * 2).min(self.config.max_window.max(1));
        }

        tracing::debug!(
            round = self.rounds,
            wants = self.wants.len(),
            haves = haves.len(),
            common = self.common.len(),
            done,
            "Negotiation round"
        );

        Some(NegotiationRequest {
            wants: self.wants.clone(),
            haves,
            shallows: self.shallows.clone(),
            depth: self.depth,
            done,
        })
    }

    /// Feeds the acknowledgements of a non-final round back into the engine.
    pub fn receive(&mut self, acks: &[Acknowledgement]) {
        for ack in acks {
            if let Acknowledgement::Ready(_) = ack {
                self.ready = true;
            }
            if let Some(id) = ack.id() {
                if !self.common.contains(&id) {
                    self.common.push(id);
                }
            }
        }
    }
}

/// Reads acknowledgement lines up to and including the final `NAK` or `ACK`.
pub(crate) async fn read_acknowledgements<R: AsyncRead + Unpin>(
    reader: &mut PktLineReader<R>,
) -> Result<Vec<Acknowledgement>> {
    let mut acks = Vec::new();
    loop {
        let pkt = reader
            .read()
            .await?
            .ok_or_else(|| FetchError::truncated("response ended before NAK or ACK"))?;
        let line = match &pkt {
            PktLine::Data(_) => pkt
                .as_str()
                .ok_or_else(|| FetchError::protocol("non-text acknowledgement line"))?,
            other => {
                return Err(FetchError::protocol(format!(
                    "unexpected {other:?} among acknowledgements"
                )))
            }
        };
        let ack = Acknowledgement::parse(line)?;
        acks.push(ack);
        if ack.is_final() {
            return Ok(acks);
        }
    }
}
