//! On-disk repository backed by a regular git directory.
//!
//! Objects are written as zlib-compressed loose objects under
//! `objects/xx/yyyy…`, refs as loose `<hex>\n` files, and metadata blobs
//! (`shallow`) as files directly in the git directory. Every write goes
//! through a temporary file and a rename so a reader never sees a partial
//! file.

use crate::{ObjectId, ObjectStore, RefStore, Result, StorageError};
use async_trait::async_trait;
use bytes::Bytes;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Symbolic refs are followed at most this many times.
const MAX_SYMREF_DEPTH: usize = 5;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A git directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct FsRepository {
    git_dir: PathBuf,
}

impl FsRepository {
    /// Opens an existing repository.
    ///
    /// `path` may be a working tree containing `.git` or a bare git directory.
    /// Only loose objects are read, so a repository with pack files under
    /// `objects/pack` is rejected: its objects would look missing, and thin
    /// packs deltified against them could not be resolved.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let dot_git = path.join(".git");
        let git_dir = if is_dir(&dot_git).await? {
            dot_git
        } else {
            path.to_path_buf()
        };

        if !is_dir(&git_dir.join("objects")).await? {
            return Err(StorageError::Io(std::io::Error::new(
                ErrorKind::NotFound,
                format!("not a git directory: {}", git_dir.display()),
            )));
        }

        if let Some(pack) = find_pack_file(&git_dir.join("objects/pack")).await? {
            return Err(StorageError::Unsupported(format!(
                "packed objects are not supported: {}",
                pack.display()
            )));
        }

        Ok(Self { git_dir })
    }

    /// Creates a bare repository layout at `path` if it does not exist yet.
    pub async fn init(path: impl AsRef<Path>) -> Result<Self> {
        let git_dir = path.as_ref().to_path_buf();
        tokio::fs::create_dir_all(git_dir.join("objects")).await?;
        tokio::fs::create_dir_all(git_dir.join("refs/heads")).await?;
        tokio::fs::create_dir_all(git_dir.join("refs/tags")).await?;

        let head = git_dir.join("HEAD");
        if !tokio::fs::try_exists(&head).await? {
            write_atomic(&head, b"ref: refs/heads/main\n").await?;
        }

        tracing::info!(path = %git_dir.display(), "Initialized repository");
        Ok(Self { git_dir })
    }

    /// Returns the git directory.
    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    fn object_path(&self, id: &ObjectId) -> PathBuf {
        let hex = id.to_hex();
        self.git_dir.join("objects").join(&hex[..2]).join(&hex[2..])
    }

    fn ref_path(&self, name: &str) -> Result<PathBuf> {
        validate_ref_name(name)?;
        Ok(self.git_dir.join(name))
    }

    fn metadata_path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty()
            || key.contains('/')
            || key.contains('\\')
            || key.starts_with('.')
        {
            return Err(StorageError::InvalidName(format!(
                "invalid metadata key: {key:?}"
            )));
        }
        Ok(self.git_dir.join(key))
    }

    async fn packed_refs(&self) -> Result<Vec<(String, ObjectId)>> {
        let contents = match tokio::fs::read_to_string(self.git_dir.join("packed-refs")).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut refs = Vec::new();
        for line in contents.lines() {
            if line.starts_with('#') || line.starts_with('^') || line.is_empty() {
                continue;
            }
            let (hex, name) = line.split_once(' ').ok_or_else(|| {
                StorageError::Corruption(format!("malformed packed-refs line: {line}"))
            })?;
            refs.push((name.to_string(), ObjectId::from_hex(hex)?));
        }
        Ok(refs)
    }

    async fn read_loose_ref(&self, name: &str) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.ref_path(name)?).await {
            Ok(contents) => Ok(Some(contents.trim_end().to_string())),
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::IsADirectory) => {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ObjectStore for FsRepository {
    async fn has_object(&self, id: &ObjectId) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.object_path(id)).await?)
    }

    async fn save_raw(&self, id: &ObjectId, body: Bytes) -> Result<()> {
        let path = self.object_path(id);
        if tokio::fs::try_exists(&path).await? {
            return Ok(());
        }

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&body)
            .map_err(|e| StorageError::Compression(e.to_string()))?;
        let compressed = encoder
            .finish()
            .map_err(|e| StorageError::Compression(e.to_string()))?;

        write_atomic(&path, &compressed).await?;
        tracing::trace!(id = %id, size = body.len(), "Wrote loose object");
        Ok(())
    }

    async fn load_raw(&self, id: &ObjectId) -> Result<Option<Bytes>> {
        let compressed = match tokio::fs::read(self.object_path(id)).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut decoder = ZlibDecoder::new(compressed.as_slice());
        let mut raw = Vec::new();
        decoder
            .read_to_end(&mut raw)
            .map_err(|e| StorageError::Compression(e.to_string()))?;

        if ObjectId::hash_raw(&raw) != *id {
            return Err(StorageError::Corruption(format!(
                "loose object {} does not match its id",
                id
            )));
        }
        Ok(Some(Bytes::from(raw)))
    }

    async fn load_metadata(&self, key: &str) -> Result<Option<Bytes>> {
        match tokio::fs::read(self.metadata_path(key)?).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save_metadata(&self, key: &str, contents: Bytes) -> Result<()> {
        let path = self.metadata_path(key)?;
        // git treats an existing shallow file as "repository is shallow"
        if contents.is_empty() {
            return match tokio::fs::remove_file(&path).await {
                Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            };
        }
        write_atomic(&path, &contents).await
    }
}

#[async_trait]
impl RefStore for FsRepository {
    async fn list_refs(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .packed_refs()
            .await?
            .into_iter()
            .map(|(name, _)| name)
            .collect();

        let mut pending = vec![self.git_dir.join("refs")];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if let Ok(relative) = path.strip_prefix(&self.git_dir) {
                    let name = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    if validate_ref_name(&name).is_ok() {
                        names.push(name);
                    }
                }
            }
        }

        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn get_ref(&self, name: &str) -> Result<Option<ObjectId>> {
        let mut current = name.to_string();
        for _ in 0..MAX_SYMREF_DEPTH {
            match self.read_loose_ref(&current).await? {
                Some(contents) => match contents.strip_prefix("ref: ") {
                    Some(target) => current = target.to_string(),
                    None => return Ok(Some(ObjectId::from_hex(&contents)?)),
                },
                None => {
                    return Ok(self
                        .packed_refs()
                        .await?
                        .into_iter()
                        .find(|(packed, _)| *packed == current)
                        .map(|(_, id)| id))
                }
            }
        }
        Err(StorageError::Corruption(format!(
            "symbolic ref chain too deep at {name}"
        )))
    }

    async fn set_ref(&self, name: &str, id: ObjectId) -> Result<()> {
        let path = self.ref_path(name)?;
        write_atomic(&path, format!("{}\n", id).as_bytes()).await?;
        tracing::debug!(name = %name, id = %id, "Updated ref");
        Ok(())
    }
}

fn validate_ref_name(name: &str) -> Result<()> {
    let valid = name.starts_with("refs/")
        && !name.ends_with('/')
        && !name.ends_with(".lock")
        && !name.contains('\\')
        && name
            .split('/')
            .all(|part| !part.is_empty() && part != "." && part != ".." && !part.starts_with('.'));
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidName(format!("invalid ref name: {name:?}")))
    }
}

async fn is_dir(path: &Path) -> Result<bool> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(meta.is_dir()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

async fn find_pack_file(dir: &Path) -> Result<Option<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "pack") {
            return Ok(Some(path));
        }
    }
    Ok(None)
}

async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| StorageError::InvalidName(format!("no parent for {}", path.display())))?;
    tokio::fs::create_dir_all(parent).await?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = parent.join(format!(
        ".{}.{}.{}.tmp",
        file_name,
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    tokio::fs::write(&temp, contents).await?;
    if let Err(e) = tokio::fs::rename(&temp, path).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e.into());
    }
    Ok(())
}
