//! Fetch refspecs (`[+]<src>:<dst>`).

use crate::advertisement::Ref;
use crate::{FetchError, Result};
use smartfetch_storage::ObjectId;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Refspec used when the caller does not pass one.
pub const DEFAULT_REFSPEC: &str = "refs/heads/*:refs/remotes/origin/*";

/// A fetch refspec mapping remote ref names to local ones.
///
/// Either side may contain a single `*`; if one side does, both must.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Refspec {
    /// Whether the spec started with `+`.
    ///
    /// Kept for display only. The fetcher overwrites tracking refs either way
    /// and never checks for fast-forwards.
    pub force: bool,
    src: String,
    dst: String,
}

impl Refspec {
    /// Maps a remote ref name to its local name, if this spec matches it.
    pub fn map(&self, remote: &str) -> Option<String> {
        match self.src.split_once('*') {
            None => (remote == self.src).then(|| self.dst.clone()),
            Some((prefix, suffix)) => {
                if remote.len() < prefix.len() + suffix.len()
                    || !remote.starts_with(prefix)
                    || !remote.ends_with(suffix)
                {
                    return None;
                }
                let matched = &remote[prefix.len()..remote.len() - suffix.len()];
                Some(self.dst.replacen('*', matched, 1))
            }
        }
    }

    /// Source side of the spec.
    pub fn source(&self) -> &str {
        &self.src
    }

    /// Destination side of the spec.
    pub fn destination(&self) -> &str {
        &self.dst
    }
}

impl FromStr for Refspec {
    type Err = FetchError;

    fn from_str(s: &str) -> Result<Self> {
        let (force, spec) = match s.strip_prefix('+') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let (src, dst) = spec
            .split_once(':')
            .ok_or_else(|| FetchError::invalid_request(format!("refspec {s:?} has no ':'")))?;

        if src.is_empty() || dst.is_empty() {
            return Err(FetchError::invalid_request(format!(
                "refspec {s:?} has an empty side"
            )));
        }

        let src_globs = src.matches('*').count();
        let dst_globs = dst.matches('*').count();
        if src_globs > 1 || src_globs != dst_globs {
            return Err(FetchError::invalid_request(format!(
                "refspec {s:?} must use one '*' on both sides or none"
            )));
        }

        Ok(Self {
            force,
            src: src.to_string(),
            dst: dst.to_string(),
        })
    }
}

impl fmt::Display for Refspec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.force {
            f.write_str("+")?;
        }
        write!(f, "{}:{}", self.src, self.dst)
    }
}

/// A remote ref selected by a refspec, with the local name it updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedRef {
    /// Remote ref name.
    pub remote: String,
    /// Local tracking ref name.
    pub local: String,
    /// Object the remote ref points at.
    pub id: ObjectId,
}

/// Parses a list of refspec strings, falling back to [`DEFAULT_REFSPEC`].
pub fn parse_refspecs<S: AsRef<str>>(specs: &[S]) -> Result<Vec<Refspec>> {
    if specs.is_empty() {
        return Ok(vec![DEFAULT_REFSPEC.parse()?]);
    }
    specs.iter().map(|s| s.as_ref().parse()).collect()
}

/// Selects the advertised refs the refspecs ask for.
///
/// Advertisement order is kept. The first matching spec wins for a remote
/// ref, and the first remote ref wins for a local name.
pub fn map_refs(refspecs: &[Refspec], refs: &[Ref]) -> Vec<MappedRef> {
    let mut seen = HashSet::new();
    let mut mapped = Vec::new();

    for remote in refs {
        let Some(local) = refspecs.iter().find_map(|spec| spec.map(&remote.name)) else {
            continue;
        };
        if seen.insert(local.clone()) {
            mapped.push(MappedRef {
                remote: remote.name.clone(),
                local,
                id: remote.id,
            });
        }
    }

    mapped
}
