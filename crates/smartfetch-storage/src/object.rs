//! Git object ids, types, and the loose-object encoding.

use crate::{Result, StorageError};
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};
use std::fmt;
use std::str::FromStr;

/// SHA-1 name of a git object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 20]);

impl Serialize for ObjectId {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ObjectId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

impl ObjectId {
    /// Length of an id in bytes.
    pub const LEN: usize = 20;

    /// Length of an id rendered as hex.
    pub const HEX_LEN: usize = 40;

    /// The all-zero id git uses as a placeholder.
    pub const ZERO: ObjectId = ObjectId([0u8; 20]);

    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Creates an ObjectId from a raw 20-byte slice.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; 20] = bytes.try_into().map_err(|_| {
            StorageError::InvalidObjectId(format!("expected 20 bytes, got {}", bytes.len()))
        })?;
        Ok(Self(bytes))
    }

    /// Parses 40 hex digits.
    pub fn from_hex(hex: &str) -> Result<Self> {
        if hex.len() != Self::HEX_LEN {
            return Err(StorageError::InvalidObjectId(format!(
                "invalid object id length: {}",
                hex.len()
            )));
        }
        let mut bytes = [0u8; 20];
        hex::decode_to_slice(hex, &mut bytes)
            .map_err(|e| StorageError::InvalidObjectId(format!("{hex}: {e}")))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Lowercase hex, as git prints it.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Returns true for the all-zero placeholder id.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }

    /// Hashes a loose-object encoding (`"<type> <len>\0<content>"`).
    pub fn hash_raw(raw: &[u8]) -> Self {
        let digest = Sha1::digest(raw);
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }
}

impl FromStr for ObjectId {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Git object types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    /// File content.
    Blob,
    /// Directory listing.
    Tree,
    /// Commit object.
    Commit,
    /// Annotated tag.
    Tag,
}

impl ObjectType {
    /// Name used in loose object headers.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blob => "blob",
            Self::Tree => "tree",
            Self::Commit => "commit",
            Self::Tag => "tag",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "blob" => Ok(Self::Blob),
            "tree" => Ok(Self::Tree),
            "commit" => Ok(Self::Commit),
            "tag" => Ok(Self::Tag),
            _ => Err(StorageError::InvalidObject(format!(
                "unknown object type: {}",
                s
            ))),
        }
    }

    /// Pack entry type code (1 to 4).
    pub fn pack_type(&self) -> u8 {
        match self {
            Self::Commit => 1,
            Self::Tree => 2,
            Self::Blob => 3,
            Self::Tag => 4,
        }
    }

    /// Parses an object type from a pack file type code.
    ///
    /// Delta codes (6 and 7) are not object types and are rejected.
    pub fn from_pack_type(code: u8) -> Result<Self> {
        match code {
            1 => Ok(Self::Commit),
            2 => Ok(Self::Tree),
            3 => Ok(Self::Blob),
            4 => Ok(Self::Tag),
            _ => Err(StorageError::InvalidObject(format!(
                "unknown pack type: {}",
                code
            ))),
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An object's type and uncompressed content.
///
/// The store keys objects by the SHA-1 of their loose encoding
/// `"<type> <len>\0<content>"`, which is what [`RawObject::encode`] produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawObject {
    /// The type of object.
    pub kind: ObjectType,
    /// The object content, without header.
    pub content: Bytes,
}

impl RawObject {
    /// Creates a raw object.
    pub fn new(kind: ObjectType, content: impl Into<Bytes>) -> Self {
        Self {
            kind,
            content: content.into(),
        }
    }

    pub fn blob(content: impl Into<Bytes>) -> Self {
        Self::new(ObjectType::Blob, content)
    }

    /// Minimal commit with the same author and committer line.
    pub fn commit(tree_id: &ObjectId, parents: &[ObjectId], author: &str, message: &str) -> Self {
        let mut content = format!("tree {}\n", tree_id);
        for parent in parents {
            content.push_str(&format!("parent {}\n", parent));
        }
        content.push_str(&format!("author {}\n", author));
        content.push_str(&format!("committer {}\n", author));
        content.push_str(&format!("\n{}", message));
        Self::new(ObjectType::Commit, content.into_bytes())
    }

    /// Returns the loose-object encoding.
    pub fn encode(&self) -> Bytes {
        let header = format!("{} {}\0", self.kind.as_str(), self.content.len());
        let mut raw = Vec::with_capacity(header.len() + self.content.len());
        raw.extend_from_slice(header.as_bytes());
        raw.extend_from_slice(&self.content);
        Bytes::from(raw)
    }

    /// Returns the object id.
    pub fn id(&self) -> ObjectId {
        let header = format!("{} {}\0", self.kind.as_str(), self.content.len());
        let mut hasher = Sha1::new();
        hasher.update(header.as_bytes());
        hasher.update(&self.content);
        let result = hasher.finalize();
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&result);
        ObjectId::from_bytes(bytes)
    }

    /// Parses a loose-object encoding.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        let null_pos = raw.iter().position(|&b| b == 0).ok_or_else(|| {
            StorageError::InvalidObject("missing null byte in header".to_string())
        })?;

        let header = std::str::from_utf8(&raw[..null_pos])
            .map_err(|_| StorageError::InvalidObject("header is not utf-8".to_string()))?;
        let (kind, size) = header
            .split_once(' ')
            .ok_or_else(|| StorageError::InvalidObject(format!("invalid header: {}", header)))?;

        let kind = ObjectType::parse(kind)?;
        let size: usize = size
            .parse()
            .map_err(|_| StorageError::InvalidObject("invalid size".to_string()))?;

        let content = &raw[null_pos + 1..];
        if content.len() != size {
            return Err(StorageError::InvalidObject(format!(
                "header declares {} bytes, found {}",
                size,
                content.len()
            )));
        }

        Ok(Self::new(kind, Bytes::copy_from_slice(content)))
    }
}
