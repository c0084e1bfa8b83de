//! Capability parsing and selection.

use std::collections::BTreeMap;

/// Agent string sent with the first want line.
pub const AGENT: &str = concat!("smartfetch/", env!("CARGO_PKG_VERSION"));

/// A single advertised capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    /// A bare token such as `ofs-delta`.
    Flag,
    /// A `key=value` token such as `agent=git/2.43.0`.
    Value(String),
}

/// Capabilities advertised by the server on the first ref line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    caps: BTreeMap<String, Capability>,
}

impl Capabilities {
    /// Creates an empty capability set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a space-separated capability list.
    ///
    /// Repeated keys (several `symref=` tokens) keep their first value.
    pub fn parse(s: &str) -> Self {
        let mut caps = BTreeMap::new();
        for token in s.split_whitespace() {
            let (key, value) = match token.split_once('=') {
                Some((key, value)) => (key, Capability::Value(value.to_string())),
                None => (token, Capability::Flag),
            };
            caps.entry(key.to_string()).or_insert(value);
        }
        Self { caps }
    }

    /// Returns true if the server advertised `name`, with or without a value.
    pub fn has(&self, name: &str) -> bool {
        self.caps.contains_key(name)
    }

    /// Returns the value of a `key=value` capability.
    pub fn value(&self, name: &str) -> Option<&str> {
        match self.caps.get(name) {
            Some(Capability::Value(value)) => Some(value),
            _ => None,
        }
    }

    /// Returns the number of capabilities.
    pub fn len(&self) -> usize {
        self.caps.len()
    }

    /// Returns true if nothing was advertised.
    pub fn is_empty(&self) -> bool {
        self.caps.is_empty()
    }

    /// Iterates over capabilities in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Capability)> {
        self.caps.iter().map(|(name, cap)| (name.as_str(), cap))
    }

    /// Returns true if the server will multiplex the pack over side-band.
    pub fn uses_side_band(&self) -> bool {
        self.has("side-band-64k") || self.has("side-band")
    }

    /// Returns true if acknowledgements carry `common`/`ready` detail.
    pub fn uses_multi_ack(&self) -> bool {
        self.has("multi_ack_detailed") || self.has("multi_ack")
    }

    /// Selects the client tokens for the first want line.
    ///
    /// Only tokens the server advertised are requested. `shallow` is added when
    /// the request carries shallow or deepen lines, `no-progress` when nobody
    /// listens to progress output.
    pub fn fetch_tokens(&self, shallow: bool, progress: bool) -> Vec<String> {
        let mut tokens = Vec::new();

        if self.has("multi_ack_detailed") {
            tokens.push("multi_ack_detailed".to_string());
        } else if self.has("multi_ack") {
            tokens.push("multi_ack".to_string());
        }

        if self.has("side-band-64k") {
            tokens.push("side-band-64k".to_string());
        } else if self.has("side-band") {
            tokens.push("side-band".to_string());
        }

        for flag in ["thin-pack", "ofs-delta"] {
            if self.has(flag) {
                tokens.push(flag.to_string());
            }
        }

        if shallow && self.has("shallow") {
            tokens.push("shallow".to_string());
        }

        if !progress && self.has("no-progress") {
            tokens.push("no-progress".to_string());
        }

        if self.has("agent") {
            tokens.push(format!("agent={AGENT}"));
        }
        tokens
    }
}
