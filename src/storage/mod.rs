/// Artifact storage for run outputs
///
/// Intermediate node results and destination files are written through the
/// `ArtifactStorage` trait so the engine never cares whether bytes land on
/// local disk or in an object store. `LocalStorage` is the filesystem
/// implementation used by the server and the tests.

use crate::error::{PipelineError, PipelineResult};
use crate::stream::ByteStream;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};

const COPY_CHUNK_BYTES: usize = 64 * 1024;

/// Prefix of the files holding intermediate node results; reserved for the orchestrator
pub const INTERMEDIATE_PREFIX: &str = "node-";

/// Map anything outside `[A-Za-z0-9_-]` to `_`
pub fn file_safe(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// A file written by `ArtifactStorage::save`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub path: PathBuf,
    pub bytes: u64,
}

#[async_trait]
pub trait ArtifactStorage: Send + Sync + std::fmt::Debug {
    /// Location holding every artifact of one run
    fn run_dir(&self, execution_id: &str) -> PathBuf;

    /// Write a byte stream as `name` under the run's directory
    async fn save(&self, execution_id: &str, name: &str, bytes: ByteStream) -> PipelineResult<StoredArtifact>;

    async fn delete(&self, path: &Path) -> PipelineResult<()>;

    /// Artifacts of one run, sorted by path
    async fn list(&self, execution_id: &str) -> PipelineResult<Vec<PathBuf>>;
}

/// Filesystem-backed storage rooted at `<root>/<execution_id>/`
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

fn validate_name(name: &str) -> PipelineResult<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0');
    if bad {
        return Err(PipelineError::Configuration(format!("invalid artifact name '{}'", name)));
    }
    Ok(())
}

#[async_trait]
impl ArtifactStorage for LocalStorage {
    fn run_dir(&self, execution_id: &str) -> PathBuf {
        self.root.join(execution_id)
    }

    async fn save(&self, execution_id: &str, name: &str, mut bytes: ByteStream) -> PipelineResult<StoredArtifact> {
        validate_name(name)?;
        let dir = self.run_dir(execution_id);
        tokio::fs::create_dir_all(&dir).await?;

        let path = dir.join(name);
        let partial = dir.join(format!(".{}.partial", name));

        let written = async {
            let file = tokio::fs::File::create(&partial).await?;
            let mut writer = BufWriter::new(file);
            let mut total = 0u64;
            while let Some(chunk) = bytes.next().await {
                let chunk = chunk?;
                writer.write_all(&chunk).await?;
                total += chunk.len() as u64;
            }
            writer.flush().await?;
            Ok::<_, PipelineError>(total)
        }
        .await;

        match written {
            Ok(total) => {
                tokio::fs::rename(&partial, &path).await?;
                tracing::debug!("💾 Saved artifact {} ({} bytes)", path.display(), total);
                Ok(StoredArtifact { path, bytes: total })
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                Err(e)
            }
        }
    }

    async fn delete(&self, path: &Path) -> PipelineResult<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, execution_id: &str) -> PipelineResult<Vec<PathBuf>> {
        let dir = self.run_dir(execution_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                paths.push(entry.path());
            }
        }
        paths.sort();
        Ok(paths)
    }
}

/// Read a file as a chunked byte stream
pub fn file_bytes(path: PathBuf) -> ByteStream {
    Box::pin(async_stream::try_stream! {
        let mut file = tokio::fs::File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PipelineError::NotFound(format!("file {} does not exist", path.display()))
            } else {
                PipelineError::Io(e)
            }
        })?;

        let mut buf = vec![0u8; COPY_CHUNK_BYTES];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            yield Bytes::copy_from_slice(&buf[..n]);
        }
    })
}
