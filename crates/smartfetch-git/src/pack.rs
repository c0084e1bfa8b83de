//! Streaming pack ingestion.
//!
//! Consumes the response to the final `git-upload-pack` round: the optional
//! shallow-info section, the acknowledgements, and the pack itself. Objects are
//! produced one at a time, so memory stays bounded by a single object and its
//! delta base no matter how large the pack is.
//!
//! See: https://git-scm.com/docs/pack-format

use crate::delta::apply_delta;
use crate::negotiation::{read_acknowledgements, Acknowledgement};
use crate::pktline::PktLineReader;
use crate::shallow::{read_shallow_info, ShallowUpdate};
use crate::sideband::{PackSource, Progress};
use crate::{FetchError, Result};
use bytes::{Buf, Bytes, BytesMut};
use flate2::{Decompress, FlushDecompress, Status};
use futures::Stream;
use sha1::{Digest, Sha1};
use smartfetch_storage::{ObjectId, ObjectStore, ObjectType, RawObject};
use std::collections::HashMap;
use std::fmt;
use tokio::io::AsyncRead;

/// Magic bytes at the start of a pack file.
const PACK_SIGNATURE: &[u8; 4] = b"PACK";
/// Length of the pack header and of the trailing checksum.
const HEADER_LEN: usize = 12;
const TRAILER_LEN: usize = 20;

const OBJ_OFS_DELTA: u8 = 6;
const OBJ_REF_DELTA: u8 = 7;

/// Upper bound for the up-front allocation of an inflated entry.
const MAX_PREALLOC: usize = 1 << 20;

/// How the response is framed.
#[derive(Clone, Default)]
pub struct PackIngestOptions {
    /// A shallow-info section precedes the acknowledgements.
    pub expects_shallow_info: bool,
    /// The pack is multiplexed over side-band.
    pub side_band: bool,
    /// Receives side-band progress text.
    pub progress: Option<Progress>,
}

impl fmt::Debug for PackIngestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackIngestOptions")
            .field("expects_shallow_info", &self.expects_shallow_info)
            .field("side_band", &self.side_band)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// A fully resolved object from the pack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRecord {
    /// SHA-1 of `body`.
    pub id: ObjectId,
    /// Object type.
    pub kind: ObjectType,
    /// Loose encoding, `"<type> <len>\0<content>"`.
    pub body: Bytes,
}

/// Pull-based reader over a pack response.
pub struct PackIngestor<R> {
    source: PackSource<R>,
    buf: BytesMut,
    hasher: Sha1,
    offset: u64,
    offsets: HashMap<u64, ObjectId>,
    acknowledgements: Vec<Acknowledgement>,
    shallow_updates: Vec<ShallowUpdate>,
    object_count: u32,
    remaining: u32,
    finished: bool,
}

impl<R> fmt::Debug for PackIngestor<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackIngestor")
            .field("offset", &self.offset)
            .field("object_count", &self.object_count)
            .field("remaining", &self.remaining)
            .field("finished", &self.finished)
            .finish()
    }
}

impl<R: AsyncRead + Unpin> PackIngestor<R> {
    /// Reads everything up to and including the pack header.
    pub async fn start(reader: R, options: PackIngestOptions) -> Result<Self> {
        let mut reader = PktLineReader::new(reader);

        let shallow_updates = if options.expects_shallow_info {
            read_shallow_info(&mut reader).await?
        } else {
            Vec::new()
        };
        let acknowledgements = read_acknowledgements(&mut reader).await?;

        let mut ingestor = Self {
            source: PackSource::new(reader, options.side_band, options.progress),
            buf: BytesMut::new(),
            hasher: Sha1::new(),
            offset: 0,
            offsets: HashMap::new(),
            acknowledgements,
            shallow_updates,
            object_count: 0,
            remaining: 0,
            finished: false,
        };
        ingestor.read_header().await?;

        tracing::debug!(
            objects = ingestor.object_count,
            shallow_updates = ingestor.shallow_updates.len(),
            "Receiving pack"
        );
        Ok(ingestor)
    }

    /// Returns the next object, or `None` once the pack has been verified.
    ///
    /// Delta bases are looked up in `store`, so every record must be saved
    /// before the next one is requested.
    pub async fn next_object<S: ObjectStore + ?Sized>(
        &mut self,
        store: &S,
    ) -> Result<Option<ObjectRecord>> {
        if self.remaining == 0 {
            if !self.finished {
                self.finish().await?;
            }
            return Ok(None);
        }

        let entry_offset = self.offset;
        let (type_code, size) = self.read_entry_header().await?;

        let object = match type_code {
            1..=4 => {
                let kind = ObjectType::from_pack_type(type_code)
                    .map_err(|e| FetchError::protocol(e.to_string()))?;
                RawObject::new(kind, self.inflate(size).await?)
            }
            OBJ_OFS_DELTA => {
                let distance = self.read_ofs_distance().await?;
                let base_id = entry_offset
                    .checked_sub(distance)
                    .filter(|_| distance > 0)
                    .and_then(|base| self.offsets.get(&base).copied())
                    .ok_or_else(|| {
                        FetchError::protocol(format!(
                            "ofs-delta at {entry_offset} points to no entry (distance {distance})"
                        ))
                    })?;
                let delta = self.inflate(size).await?;
                resolve_delta(store, &base_id, &delta).await?
            }
            OBJ_REF_DELTA => {
                let base = self.take(ObjectId::LEN).await?;
                let base_id = ObjectId::from_slice(&base)
                    .map_err(|e| FetchError::protocol(e.to_string()))?;
                let delta = self.inflate(size).await?;
                resolve_delta(store, &base_id, &delta).await?
            }
            other => {
                return Err(FetchError::protocol(format!(
                    "unknown pack object type {other} at offset {entry_offset}"
                )))
            }
        };

        let body = object.encode();
        let id = ObjectId::hash_raw(&body);
        self.offsets.insert(entry_offset, id);
        self.remaining -= 1;

        tracing::trace!(%id, kind = %object.kind, size = object.content.len(), "Unpacked object");

        Ok(Some(ObjectRecord {
            id,
            kind: object.kind,
            body,
        }))
    }

    /// Exposes [`PackIngestor::next_object`] as a stream.
    ///
    /// The consumer must store each record before polling for the next one.
    pub fn stream<'a, S>(&'a mut self, store: &'a S) -> impl Stream<Item = Result<ObjectRecord>> + 'a
    where
        S: ObjectStore + ?Sized,
        R: 'a,
    {
        futures::stream::try_unfold(self, move |ingestor| async move {
            let record = ingestor.next_object(store).await?;
            Ok::<_, FetchError>(record.map(|record| (record, ingestor)))
        })
    }

    /// Acknowledgements that preceded the pack.
    pub fn acknowledgements(&self) -> &[Acknowledgement] {
        &self.acknowledgements
    }

    /// Commits that became shallow boundaries.
    pub fn shallow(&self) -> Result<Vec<ObjectId>> {
        self.check_finished()?;
        Ok(self
            .shallow_updates
            .iter()
            .filter_map(|update| match update {
                ShallowUpdate::Shallow(id) => Some(*id),
                ShallowUpdate::Unshallow(_) => None,
            })
            .collect())
    }

    /// Commits that stopped being shallow boundaries.
    pub fn unshallow(&self) -> Result<Vec<ObjectId>> {
        self.check_finished()?;
        Ok(self
            .shallow_updates
            .iter()
            .filter_map(|update| match update {
                ShallowUpdate::Unshallow(id) => Some(*id),
                ShallowUpdate::Shallow(_) => None,
            })
            .collect())
    }

    /// All shallow-info lines, in order.
    pub fn shallow_updates(&self) -> Result<&[ShallowUpdate]> {
        self.check_finished()?;
        Ok(&self.shallow_updates)
    }

    /// Number of entries the pack contained.
    pub fn object_count(&self) -> Result<u32> {
        self.check_finished()?;
        Ok(self.object_count)
    }

    /// Returns true once the trailer has been verified.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn check_finished(&self) -> Result<()> {
        if self.finished {
            Ok(())
        } else {
            Err(FetchError::IngestNotFinished)
        }
    }

    async fn read_header(&mut self) -> Result<()> {
        let header = self.take(HEADER_LEN).await?;
        if &header[0..4] != PACK_SIGNATURE {
            return Err(FetchError::protocol("invalid pack signature"));
        }

        let version = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        if version != 2 && version != 3 {
            return Err(FetchError::protocol(format!(
                "unsupported pack version: {version}"
            )));
        }

        self.object_count = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);
        self.remaining = self.object_count;
        Ok(())
    }

    /// Reads the type and size of an entry.
    ///
    /// First byte: (MSB=more bytes) (3 bits type) (4 bits size), then 7 bits
    /// of size per byte.
    async fn read_entry_header(&mut self) -> Result<(u8, usize)> {
        let first = self.take_byte().await?;
        let type_code = (first >> 4) & 0x07;
        let mut size = (first & 0x0f) as usize;
        let mut shift = 4u32;
        let mut byte = first;

        while byte & 0x80 != 0 {
            byte = self.take_byte().await?;
            if shift >= usize::BITS - 7 {
                return Err(FetchError::protocol("pack entry size overflows"));
            }
            size |= ((byte & 0x7f) as usize) << shift;
            shift += 7;
        }

        Ok((type_code, size))
    }

    /// Reads the big-endian, offset-by-one distance of an ofs-delta.
    async fn read_ofs_distance(&mut self) -> Result<u64> {
        let mut byte = self.take_byte().await?;
        let mut value = (byte & 0x7f) as u64;
        while byte & 0x80 != 0 {
            byte = self.take_byte().await?;
            value = value
                .checked_add(1)
                .and_then(|v| v.checked_mul(128))
                .ok_or_else(|| FetchError::protocol("ofs-delta distance overflows"))?
                | (byte & 0x7f) as u64;
        }
        Ok(value)
    }

    /// Inflates one zlib stream that must produce exactly `size` bytes.
    async fn inflate(&mut self, size: usize) -> Result<Vec<u8>> {
        let mut decompress = Decompress::new(true);
        let mut out = Vec::with_capacity(size.min(MAX_PREALLOC) + 1);

        loop {
            if self.buf.is_empty() && !self.fill().await? {
                return Err(FetchError::truncated("pack ended inside a compressed entry"));
            }
            if out.len() == out.capacity() {
                out.reserve(out.capacity().max(1024));
            }

            let in_before = decompress.total_in();
            let out_before = out.len();
            let status = decompress
                .decompress_vec(&self.buf, &mut out, FlushDecompress::None)
                .map_err(|e| FetchError::protocol(format!("corrupt zlib stream: {e}")))?;
            let consumed = (decompress.total_in() - in_before) as usize;
            self.consume(consumed);

            if out.len() > size {
                return Err(FetchError::protocol(format!(
                    "pack entry inflates past its declared {size} bytes"
                )));
            }

            match status {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => {
                    if consumed == 0 && out.len() == out_before && !self.fill().await? {
                        return Err(FetchError::truncated(
                            "pack ended inside a compressed entry",
                        ));
                    }
                }
            }
        }

        if out.len() != size {
            return Err(FetchError::protocol(format!(
                "pack entry inflated to {} bytes, header says {size}",
                out.len()
            )));
        }
        Ok(out)
    }

    /// Verifies the trailer and drains the rest of the pack section.
    async fn finish(&mut self) -> Result<()> {
        self.ensure(TRAILER_LEN).await?;
        let computed = std::mem::take(&mut self.hasher).finalize();
        if computed.as_slice() != &self.buf[..TRAILER_LEN] {
            return Err(FetchError::protocol("pack checksum mismatch"));
        }
        self.buf.advance(TRAILER_LEN);

        if !self.buf.is_empty() || self.fill().await? {
            return Err(FetchError::protocol("unexpected data after pack trailer"));
        }

        self.finished = true;
        tracing::debug!(objects = self.object_count, bytes = self.offset, "Pack verified");
        Ok(())
    }

    async fn fill(&mut self) -> Result<bool> {
        match self.source.next_chunk().await? {
            Some(chunk) => {
                self.buf.extend_from_slice(&chunk);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ensure(&mut self, n: usize) -> Result<()> {
        while self.buf.len() < n {
            if !self.fill().await? {
                return Err(FetchError::truncated(format!(
                    "pack ended at offset {} while {n} bytes were needed",
                    self.offset + self.buf.len() as u64
                )));
            }
        }
        Ok(())
    }

    /// Hashes and drops `n` buffered bytes.
    fn consume(&mut self, n: usize) {
        self.hasher.update(&self.buf[..n]);
        self.buf.advance(n);
        self.offset += n as u64;
    }

    async fn take(&mut self, n: usize) -> Result<Vec<u8>> {
        self.ensure(n).await?;
        let bytes = self.buf[..n].to_vec();
        self.consume(n);
        Ok(bytes)
    }

    async fn take_byte(&mut self) -> Result<u8> {
        self.ensure(1).await?;
        let byte = self.buf[0];
        self.consume(1);
        Ok(byte)
    }
}

async fn resolve_delta<S: ObjectStore + ?Sized>(
    store: &S,
    base_id: &ObjectId,
    delta: &[u8],
) -> Result<RawObject> {
    let raw = store
        .load_raw(base_id)
        .await?
        .ok_or_else(|| FetchError::protocol(format!("delta base {base_id} not found")))?;
    let base = RawObject::decode(&raw)?;
    let content = apply_delta(&base.content, delta)?;
    Ok(RawObject::new(base.kind, content))
}
