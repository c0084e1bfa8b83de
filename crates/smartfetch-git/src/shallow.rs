//! Shallow boundaries.
//!
//! A shallow repository records the commits whose parents were not fetched.
//! The set lives in the `shallow` metadata entry as newline-joined hashes.

use crate::pktline::{PktLine, PktLineReader};
use crate::{FetchError, Result};
use bytes::Bytes;
use smartfetch_storage::{ObjectId, ObjectStore};
use std::collections::BTreeSet;
use tokio::io::AsyncRead;

/// Metadata key of the shallow set.
pub const SHALLOW_KEY: &str = "shallow";

/// A line of the shallow-info section of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShallowUpdate {
    /// The commit is now a boundary.
    Shallow(ObjectId),
    /// The commit's parents are now present.
    Unshallow(ObjectId),
}

impl ShallowUpdate {
    /// Parses a `shallow <id>` or `unshallow <id>` line.
    pub fn parse(line: &str) -> Result<Self> {
        let (kind, hex) = line
            .split_once(' ')
            .ok_or_else(|| FetchError::protocol(format!("bad shallow-info line {line:?}")))?;
        let id = ObjectId::from_hex(hex)
            .map_err(|e| FetchError::protocol(format!("bad shallow-info line {line:?}: {e}")))?;
        match kind {
            "shallow" => Ok(Self::Shallow(id)),
            "unshallow" => Ok(Self::Unshallow(id)),
            _ => Err(FetchError::protocol(format!(
                "bad shallow-info line {line:?}"
            ))),
        }
    }
}

/// Reads the shallow-info section up to its flush-pkt.
pub(crate) async fn read_shallow_info<R: AsyncRead + Unpin>(
    reader: &mut PktLineReader<R>,
) -> Result<Vec<ShallowUpdate>> {
    let mut updates = Vec::new();
    loop {
        match reader.read().await? {
            Some(PktLine::Flush) => return Ok(updates),
            Some(pkt) => {
                let line = pkt
                    .as_str()
                    .ok_or_else(|| FetchError::protocol("non-text shallow-info line"))?;
                if let Some(message) = line.strip_prefix("ERR ") {
                    return Err(FetchError::RemoteError(message.to_string()));
                }
                updates.push(ShallowUpdate::parse(line)?);
            }
            None => {
                return Err(FetchError::truncated(
                    "response ended inside shallow-info section",
                ))
            }
        }
    }
}

/// The set of shallow boundary commits of a repository.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShallowSet {
    ids: BTreeSet<ObjectId>,
}

impl ShallowSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses the stored form. Blank lines are ignored.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|_| FetchError::protocol("shallow metadata is not utf-8"))?;
        let ids = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| ObjectId::from_hex(line).map_err(FetchError::from))
            .collect::<Result<_>>()?;
        Ok(Self { ids })
    }

    /// Encodes the set as newline-joined hashes in sorted order.
    pub fn encode(&self) -> Bytes {
        let hexes: Vec<String> = self.ids.iter().map(ObjectId::to_hex).collect();
        Bytes::from(hexes.join("\n"))
    }

    /// Loads the set from the store; a missing entry is an empty set.
    pub async fn load<S: ObjectStore + ?Sized>(store: &S) -> Result<Self> {
        match store.load_metadata(SHALLOW_KEY).await? {
            Some(data) => Self::parse(&data),
            None => Ok(Self::new()),
        }
    }

    /// Writes the set to the store.
    pub async fn persist<S: ObjectStore + ?Sized>(&self, store: &S) -> Result<()> {
        store.save_metadata(SHALLOW_KEY, self.encode()).await?;
        Ok(())
    }

    /// Applies a server update and returns true if the set changed.
    pub fn apply(&mut self, update: &ShallowUpdate) -> bool {
        match update {
            ShallowUpdate::Shallow(id) => self.ids.insert(*id),
            ShallowUpdate::Unshallow(id) => self.ids.remove(id),
        }
    }

    /// Adds a boundary.
    pub fn insert(&mut self, id: ObjectId) -> bool {
        self.ids.insert(id)
    }

    /// Returns true if `id` is a boundary.
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.ids.contains(id)
    }

    /// Removes every boundary.
    pub fn clear(&mut self) {
        self.ids.clear();
    }

    /// Number of boundaries.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns true for a complete repository.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Boundaries in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &ObjectId> {
        self.ids.iter()
    }

    /// Boundaries as a vector, in sorted order.
    pub fn to_vec(&self) -> Vec<ObjectId> {
        self.ids.iter().copied().collect()
    }
}

impl FromIterator<ObjectId> for ShallowSet {
    fn from_iter<I: IntoIterator<Item = ObjectId>>(iter: I) -> Self {
        Self {
            ids: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pktline::PktLineWriter;
    use proptest::prelude::*;
    use smartfetch_storage::MemoryRepository;

    fn id(n: u8) -> ObjectId {
        ObjectId::from_bytes([n; 20])
    }

    #[test]
    fn test_encode_is_sorted_without_trailing_newline() {
        let set: ShallowSet = [id(2), id(1)].into_iter().collect();
        let encoded = set.encode();
        assert_eq!(encoded, Bytes::from(format!("{}\n{}", id(1), id(2))));
        assert_eq!(ShallowSet::parse(&encoded).unwrap(), set);
    }

    #[test]
    fn test_parse_tolerates_trailing_newline() {
        let set = ShallowSet::parse(format!("{}\n\n", id(3)).as_bytes()).unwrap();
        assert_eq!(set.to_vec(), vec![id(3)]);
        assert!(ShallowSet::parse(b"").unwrap().is_empty());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ShallowSet::parse(b"not a hash").is_err());
    }

    #[test]
    fn test_apply_updates() {
        let mut set = ShallowSet::new();
        assert!(set.apply(&ShallowUpdate::Shallow(id(1))));
        assert!(!set.apply(&ShallowUpdate::Shallow(id(1))));
        assert!(set.contains(&id(1)));
        assert!(set.apply(&ShallowUpdate::Unshallow(id(1))));
        assert!(!set.apply(&ShallowUpdate::Unshallow(id(1))));
        assert!(set.is_empty());
    }

    #[test]
    fn test_parse_update_lines() {
        let line = format!("unshallow {}", id(4));
        assert_eq!(
            ShallowUpdate::parse(&line).unwrap(),
            ShallowUpdate::Unshallow(id(4))
        );
        assert!(ShallowUpdate::parse("deepen 1").is_err());
        assert!(ShallowUpdate::parse("shallow xyz").is_err());
    }

    #[tokio::test]
    async fn test_load_missing_is_empty() {
        let repo = MemoryRepository::new();
        assert!(ShallowSet::load(&repo).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_persist_load_persist_is_stable() {
        let repo = MemoryRepository::new();
        let set: ShallowSet = [id(9), id(5), id(7)].into_iter().collect();
        set.persist(&repo).await.unwrap();
        let first = repo.load_metadata(SHALLOW_KEY).await.unwrap().unwrap();

        let loaded = ShallowSet::load(&repo).await.unwrap();
        loaded.persist(&repo).await.unwrap();
        let second = repo.load_metadata(SHALLOW_KEY).await.unwrap().unwrap();

        assert_eq!(loaded, set);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_read_shallow_info_section() {
        let mut buf = Vec::new();
        let mut writer = PktLineWriter::new(&mut buf);
        writer.write_line(&format!("shallow {}", id(1))).unwrap();
        writer.write_line(&format!("unshallow {}", id(2))).unwrap();
        writer.flush_pkt().unwrap();
        writer.write_line("NAK").unwrap();

        let mut reader = PktLineReader::new(buf.as_slice());
        let updates = read_shallow_info(&mut reader).await.unwrap();
        assert_eq!(
            updates,
            vec![ShallowUpdate::Shallow(id(1)), ShallowUpdate::Unshallow(id(2))]
        );
        assert_eq!(reader.read().await.unwrap().unwrap().as_str(), Some("NAK"));
    }

    #[tokio::test]
    async fn test_read_shallow_info_truncated() {
        let buf = PktLine::from_string(&format!("shallow {}\n", id(1))).encode();
        let mut reader = PktLineReader::new(buf.as_slice());
        assert!(matches!(
            read_shallow_info(&mut reader).await,
            Err(FetchError::TruncatedPack(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_encode_parse_identity(bytes in proptest::collection::vec(any::<[u8; 20]>(), 0..20)) {
            let set: ShallowSet = bytes.into_iter().map(ObjectId::from_bytes).collect();
            let encoded = set.encode();
            let parsed = ShallowSet::parse(&encoded).unwrap();
            prop_assert_eq!(&parsed, &set);
            prop_assert_eq!(parsed.encode(), encoded);
        }
    }
}
