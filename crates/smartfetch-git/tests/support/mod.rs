//! Scripted smart-HTTP remote for integration tests.
//!
//! `MockRemote` holds a small object graph and answers `info/refs` and
//! `git-upload-pack` requests the way a v0 stateless-RPC server would,
//! with hooks to inject faults into the pack response.

#![allow(dead_code)]

use async_trait::async_trait;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use smartfetch_git::{
    FetchError, HttpRequest, HttpResponse, Method, PktLine, Result, Transport,
};
use smartfetch_storage::{MemoryRepository, ObjectId, ObjectType, RawObject};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Write;

pub const URL: &str = "https://example.com/repo.git";

pub const FULL_CAPS: &str =
    "multi_ack_detailed side-band-64k thin-pack ofs-delta shallow no-progress agent=git/2.43.0";

// ============================================================================
// Pack building
// ============================================================================

/// Builds a version 2 pack of whole objects.
#[derive(Default)]
pub struct PackBuilder {
    objects: Vec<RawObject>,
}

impl PackBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, object: RawObject) {
        self.objects.push(object);
    }

    pub fn build(self) -> Vec<u8> {
        let mut pack = b"PACK".to_vec();
        pack.extend_from_slice(&2u32.to_be_bytes());
        pack.extend_from_slice(&(self.objects.len() as u32).to_be_bytes());

        for object in &self.objects {
            let size = object.content.len();
            let mut byte = (object.kind.pack_type() << 4) | (size & 0x0f) as u8;
            let mut rest = size >> 4;
            while rest > 0 {
                pack.push(byte | 0x80);
                byte = (rest & 0x7f) as u8;
                rest >>= 7;
            }
            pack.push(byte);

            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&object.content).unwrap();
            pack.extend(encoder.finish().unwrap());
        }

        let checksum = Sha1::digest(&pack);
        pack.extend_from_slice(&checksum);
        pack
    }
}

// ============================================================================
// Object graph helpers
// ============================================================================

/// Encodes a tree with a single file entry.
pub fn tree_with(name: &str, blob: &ObjectId) -> RawObject {
    let mut content = format!("100644 {name}\0").into_bytes();
    content.extend_from_slice(blob.as_bytes());
    RawObject::new(ObjectType::Tree, content)
}

/// Blob, tree and commit making up one commit of a linear history.
///
/// Histories with the same `label` share commit ids.
pub fn commit_objects(label: &str, index: usize, parent: Option<ObjectId>) -> Vec<RawObject> {
    let blob = RawObject::blob(format!("{label}: content of revision {index}\n").into_bytes());
    let tree = tree_with("file.txt", &blob.id());
    let parents: Vec<ObjectId> = parent.into_iter().collect();
    let commit = RawObject::commit(
        &tree.id(),
        &parents,
        "Test <test@example.com> 1700000000 +0000",
        &format!("{label} revision {index}\n"),
    );
    vec![blob, tree, commit]
}

/// A linear history of `len` commits; returns the commit ids, oldest first.
pub fn linear_history(label: &str, len: usize, mut sink: impl FnMut(RawObject)) -> Vec<ObjectId> {
    let mut commits = Vec::with_capacity(len);
    let mut parent = None;
    for index in 0..len {
        let objects = commit_objects(label, index, parent);
        let commit_id = objects[2].id();
        for object in objects {
            sink(object);
        }
        commits.push(commit_id);
        parent = Some(commit_id);
    }
    commits
}

/// Copies every object of `remote` reachable from `tip` into `local`.
pub fn copy_reachable(remote: &MockRemote, tip: &ObjectId, local: &MemoryRepository) {
    for id in remote.reachable(&[*tip], None).0 {
        local.insert(&remote.objects[&id]);
    }
}

// ============================================================================
// Mock remote
// ============================================================================

/// Ways to break the pack response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    None,
    /// Cut the pack in half.
    Truncate,
    /// Flip a byte of the trailing checksum.
    CorruptChecksum,
    /// Send a message on side-band channel 3 instead of the pack.
    RemoteError,
    /// Answer `git-upload-pack` with HTTP 500.
    ServerError,
}

/// A parsed `git-upload-pack` request body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadRequest {
    pub wants: Vec<ObjectId>,
    pub capabilities: Vec<String>,
    pub haves: Vec<ObjectId>,
    pub shallows: Vec<ObjectId>,
    pub depth: Option<u32>,
    pub done: bool,
}

pub struct MockRemote {
    pub objects: HashMap<ObjectId, RawObject>,
    pub refs: Vec<(String, ObjectId)>,
    pub capabilities: String,
    pub fault: Fault,
    /// Answer `ACK <id> ready` once a round finds common commits.
    pub send_ready: bool,
    pub progress_messages: Vec<String>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl MockRemote {
    pub fn new() -> Self {
        Self {
            objects: HashMap::new(),
            refs: Vec::new(),
            capabilities: FULL_CAPS.to_string(),
            fault: Fault::None,
            send_ready: true,
            progress_messages: Vec::new(),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&mut self, object: RawObject) -> ObjectId {
        let id = object.id();
        self.objects.insert(id, object);
        id
    }

    pub fn set_ref(&mut self, name: &str, id: ObjectId) {
        match self.refs.iter_mut().find(|(existing, _)| existing.as_str() == name) {
            Some(entry) => entry.1 = id,
            None => self.refs.push((name.to_string(), id)),
        }
    }

    /// Adds a linear history and returns its commit ids, oldest first.
    pub fn add_history(&mut self, len: usize) -> Vec<ObjectId> {
        self.add_labeled_history("main", len)
    }

    /// Like [`MockRemote::add_history`], with content unrelated to other labels.
    pub fn add_labeled_history(&mut self, label: &str, len: usize) -> Vec<ObjectId> {
        let mut objects = Vec::new();
        let commits = linear_history(label, len, |object| objects.push(object));
        for object in objects {
            self.add(object);
        }
        commits
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    pub fn posts(&self) -> Vec<UploadRequest> {
        self.requests()
            .into_iter()
            .filter(|request| request.method == Method::Post)
            .map(|request| parse_upload_request(request.body.as_deref().unwrap_or_default()))
            .collect()
    }

    /// Objects reachable from `tips`, plus the shallow boundaries when
    /// `depth` limits the commit walk.
    pub fn reachable(
        &self,
        tips: &[ObjectId],
        depth: Option<u32>,
    ) -> (HashSet<ObjectId>, Vec<ObjectId>) {
        let mut seen = HashSet::new();
        let mut boundaries = Vec::new();
        let mut queue: VecDeque<(ObjectId, u32)> = tips.iter().map(|id| (*id, 1)).collect();

        while let Some((id, level)) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            let Some(object) = self.objects.get(&id) else {
                continue;
            };
            match object.kind {
                ObjectType::Commit => {
                    let text = String::from_utf8_lossy(&object.content).into_owned();
                    let mut parents = Vec::new();
                    for line in text.lines() {
                        if let Some(tree) = line.strip_prefix("tree ") {
                            queue.push_back((tree.parse().unwrap(), level));
                        } else if let Some(parent) = line.strip_prefix("parent ") {
                            parents.push(parent.parse::<ObjectId>().unwrap());
                        } else if line.is_empty() {
                            break;
                        }
                    }
                    if depth.is_some_and(|depth| level >= depth) {
                        if !parents.is_empty() {
                            boundaries.push(id);
                        }
                    } else {
                        queue.extend(parents.into_iter().map(|parent| (parent, level + 1)));
                    }
                }
                ObjectType::Tree => {
                    let mut rest = &object.content[..];
                    while let Some(nul) = rest.iter().position(|&b| b == 0) {
                        let entry = ObjectId::from_slice(&rest[nul + 1..nul + 21]).unwrap();
                        queue.push_back((entry, level));
                        rest = &rest[nul + 21..];
                    }
                }
                _ => {}
            }
        }

        (seen, boundaries)
    }

    fn advertisement(&self) -> Vec<u8> {
        let mut body = PktLine::from_string("# service=git-upload-pack\n").encode();
        body.extend(PktLine::Flush.encode());

        if self.refs.is_empty() {
            let line = format!(
                "{} capabilities^{{}}\0{}\n",
                ObjectId::ZERO,
                self.capabilities
            );
            body.extend(PktLine::from_string(&line).encode());
        }
        for (index, (name, id)) in self.refs.iter().enumerate() {
            let line = if index == 0 {
                format!("{id} {name}\0{}\n", self.capabilities)
            } else {
                format!("{id} {name}\n")
            };
            body.extend(PktLine::from_string(&line).encode());
        }
        body.extend(PktLine::Flush.encode());
        body
    }

    fn upload_pack(&self, request: &UploadRequest) -> Vec<u8> {
        let common: Vec<ObjectId> = request
            .haves
            .iter()
            .copied()
            .filter(|id| self.objects.contains_key(id))
            .collect();

        let mut body = Vec::new();
        let (mut objects, boundaries) = self.reachable(&request.wants, request.depth);

        if request.depth.is_some() || !request.shallows.is_empty() {
            for id in &boundaries {
                if !request.shallows.contains(id) {
                    body.extend(PktLine::from_string(&format!("shallow {id}\n")).encode());
                }
            }
            for id in &request.shallows {
                if objects.contains(id) && !boundaries.contains(id) {
                    body.extend(PktLine::from_string(&format!("unshallow {id}\n")).encode());
                }
            }
            body.extend(PktLine::Flush.encode());
        }

        if !request.done {
            for id in &common {
                body.extend(PktLine::from_string(&format!("ACK {id} common\n")).encode());
            }
            if self.send_ready {
                if let Some(last) = common.last() {
                    body.extend(PktLine::from_string(&format!("ACK {last} ready\n")).encode());
                }
            }
            body.extend(PktLine::from_string("NAK\n").encode());
            return body;
        }

        match common.last() {
            Some(last) => body.extend(PktLine::from_string(&format!("ACK {last}\n")).encode()),
            None => body.extend(PktLine::from_string("NAK\n").encode()),
        }

        let (excluded, _) = self.reachable(&common, None);
        objects.retain(|id| !excluded.contains(id) && self.objects.contains_key(id));

        let mut ids: Vec<ObjectId> = objects.into_iter().collect();
        ids.sort();
        let mut builder = PackBuilder::new();
        for id in ids {
            builder.add(self.objects[&id].clone());
        }
        let mut pack = builder.build();

        match self.fault {
            Fault::Truncate => pack.truncate(pack.len() / 2),
            Fault::CorruptChecksum => {
                let last = pack.len() - 1;
                pack[last] ^= 0xff;
            }
            _ => {}
        }

        let side_band = request
            .capabilities
            .iter()
            .any(|cap| cap == "side-band-64k" || cap == "side-band");
        if !side_band {
            body.extend(pack);
            return body;
        }

        let progress = !request.capabilities.iter().any(|cap| cap == "no-progress");
        if progress {
            for message in &self.progress_messages {
                let mut packet = vec![2u8];
                packet.extend_from_slice(message.as_bytes());
                body.extend(PktLine::from_bytes(packet).encode());
            }
        }
        if self.fault == Fault::RemoteError {
            let mut packet = vec![3u8];
            packet.extend_from_slice(b"upload-pack: out of memory\n");
            body.extend(PktLine::from_bytes(packet).encode());
            return body;
        }
        for chunk in pack.chunks(1000) {
            let mut packet = vec![1u8];
            packet.extend_from_slice(chunk);
            body.extend(PktLine::from_bytes(packet).encode());
        }
        if self.fault != Fault::Truncate {
            body.extend(PktLine::Flush.encode());
        }
        body
    }
}

#[async_trait]
impl Transport for MockRemote {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.requests.lock().push(request.clone());

        match request.method {
            Method::Get => {
                assert!(request.url.ends_with("/info/refs?service=git-upload-pack"));
                Ok(HttpResponse::from_bytes(200, self.advertisement()))
            }
            Method::Post => {
                assert!(request.url.ends_with("/git-upload-pack"));
                if self.fault == Fault::ServerError {
                    return Ok(HttpResponse::from_bytes(500, "internal error"));
                }
                let body = request
                    .body
                    .as_deref()
                    .ok_or_else(|| FetchError::InvalidRequest("POST without body".into()))?;
                let parsed = parse_upload_request(body);
                Ok(HttpResponse::from_bytes(200, self.upload_pack(&parsed)))
            }
        }
    }
}

/// Parses a request body the way the server side of upload-pack does.
pub fn parse_upload_request(body: &[u8]) -> UploadRequest {
    let mut packets = Vec::new();
    let mut rest = body;
    while !rest.is_empty() {
        let len = usize::from_str_radix(std::str::from_utf8(&rest[..4]).unwrap(), 16).unwrap();
        if len < 4 {
            rest = &rest[4..];
            continue;
        }
        packets.push(PktLine::from_bytes(rest[4..len].to_vec()));
        rest = &rest[len..];
    }

    let mut request = UploadRequest::default();
    for pkt in packets {
        let Some(line) = pkt.as_str() else {
            continue;
        };
        let mut words = line.split(' ');
        match words.next() {
            Some("want") => {
                request.wants.push(words.next().unwrap().parse().unwrap());
                if request.capabilities.is_empty() {
                    request.capabilities = words.map(str::to_string).collect();
                }
            }
            Some("have") => request.haves.push(words.next().unwrap().parse().unwrap()),
            Some("shallow") => request.shallows.push(words.next().unwrap().parse().unwrap()),
            Some("deepen") => request.depth = Some(words.next().unwrap().parse().unwrap()),
            Some("done") => request.done = true,
            other => panic!("unexpected request line {other:?}"),
        }
    }
    request
}
