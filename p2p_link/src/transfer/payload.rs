//! Payload sources (sender side) and destination sinks (receiver side).

use crate::config::PartialOutput;
use crate::{PayloadKind, TransferMetadata};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWriteExt, BufWriter};

use super::utils::{create_output_file, sanitize_file_name};

/// What a successful session produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    /// Sender side: the payload with this name went out in full.
    Sent { name: String },
    /// Receiver side: a file written to disk.
    File(PathBuf),
    /// Receiver side: a string accumulated in memory.
    Text(String),
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Artifact::Sent { name } => write!(f, "sent {}", name),
            Artifact::File(path) => write!(f, "file {}", path.display()),
            Artifact::Text(text) => write!(f, "text ({} bytes)", text.len()),
        }
    }
}

/// Readable payload with a known total length.
pub struct PayloadSource {
    reader: Pin<Box<dyn AsyncRead + Send>>,
    len: u64,
}

impl PayloadSource {
    pub async fn open_file(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::open(path.as_ref()).await?;
        let len = file.metadata().await?.len();
        Ok(Self::from_reader(file, len))
    }

    /// UTF-8 bytes of `text`.
    pub fn text(text: impl Into<String>) -> Self {
        Self::from_bytes(text.into().into_bytes())
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let len = bytes.len() as u64;
        Self::from_reader(io::Cursor::new(bytes), len)
    }

    /// Any reader; `len` is what it is expected to yield before EOF.
    pub fn from_reader<R>(reader: R, len: u64) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        Self {
            reader: Box::pin(reader),
            len,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn reader(&mut self) -> &mut Pin<Box<dyn AsyncRead + Send>> {
        &mut self.reader
    }
}

impl fmt::Debug for PayloadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadSource").field("len", &self.len).finish()
    }
}

/// Where the receiver should put an incoming payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkTarget {
    /// Create (or truncate) this file.
    File(PathBuf),
    /// Accumulate in memory and finish as a UTF-8 string.
    Text,
}

/// Chooses a destination once the metadata is known.
pub trait SinkFactory: Send + Sync + 'static {
    fn target_for(&self, metadata: &TransferMetadata) -> io::Result<SinkTarget>;
}

impl<F> SinkFactory for F
where
    F: Fn(&TransferMetadata) -> io::Result<SinkTarget> + Send + Sync + 'static,
{
    fn target_for(&self, metadata: &TransferMetadata) -> io::Result<SinkTarget> {
        self(metadata)
    }
}

/// Files go to a download directory under their sanitized name; text stays in memory.
#[derive(Debug, Clone)]
pub struct DownloadDirSinks {
    dir: PathBuf,
}

impl DownloadDirSinks {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl SinkFactory for DownloadDirSinks {
    fn target_for(&self, metadata: &TransferMetadata) -> io::Result<SinkTarget> {
        match metadata.kind {
            PayloadKind::File => Ok(SinkTarget::File(
                self.dir.join(sanitize_file_name(&metadata.name)),
            )),
            PayloadKind::Text => Ok(SinkTarget::Text),
        }
    }
}

/// An opened destination. Only [`finalize`](Sink::finalize) turns it into an
/// [`Artifact`]; any other exit just closes it.
pub(crate) enum Sink {
    File {
        path: PathBuf,
        writer: BufWriter<File>,
    },
    Text(Vec<u8>),
}

impl Sink {
    pub(crate) async fn open(target: SinkTarget) -> io::Result<Self> {
        match target {
            SinkTarget::File(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let file = create_output_file(&path).await?;
                Ok(Sink::File {
                    path,
                    writer: BufWriter::new(file),
                })
            }
            SinkTarget::Text => Ok(Sink::Text(Vec::new())),
        }
    }

    pub(crate) async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        match self {
            Sink::File { writer, .. } => writer.write_all(chunk).await,
            Sink::Text(buf) => {
                buf.extend_from_slice(chunk);
                Ok(())
            }
        }
    }

    pub(crate) async fn finalize(self) -> io::Result<Artifact> {
        match self {
            Sink::File { path, mut writer } => {
                writer.flush().await?;
                writer.into_inner().sync_all().await?;
                Ok(Artifact::File(path))
            }
            Sink::Text(buf) => String::from_utf8(buf)
                .map(Artifact::Text)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
        }
    }
}

/// Apply the partial-output policy to a file left behind by a failed receive.
pub(crate) async fn discard_partial(path: &Path, policy: PartialOutput) {
    match policy {
        PartialOutput::Keep => {
            tracing::info!("Keeping partial output at {}", path.display());
        }
        PartialOutput::Remove => match tokio::fs::remove_file(path).await {
            Ok(()) => tracing::info!("Removed partial output {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Could not remove partial output {}: {}", path.display(), e),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_text_source_len_matches_utf8() {
        let mut source = PayloadSource::text("héllo");
        assert_eq!(source.len(), 6);

        let mut out = Vec::new();
        source.reader().read_to_end(&mut out).await.unwrap();
        assert_eq!(out, "héllo".as_bytes());
    }

    #[tokio::test]
    async fn test_file_source_reports_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        tokio::fs::write(&path, vec![7u8; 4096]).await.unwrap();

        let source = PayloadSource::open_file(&path).await.unwrap();
        assert_eq!(source.len(), 4096);
        assert!(PayloadSource::open_file(dir.path().join("missing")).await.is_err());
    }

    #[test]
    fn test_download_dir_sinks_by_kind() {
        let sinks = DownloadDirSinks::new("/tmp/inbox");
        let file = TransferMetadata::new("../../etc/passwd", PayloadKind::File);
        assert_eq!(
            sinks.target_for(&file).unwrap(),
            SinkTarget::File(PathBuf::from("/tmp/inbox/passwd"))
        );
        let text = TransferMetadata::new("note", PayloadKind::Text);
        assert_eq!(sinks.target_for(&text).unwrap(), SinkTarget::Text);
    }

    #[test]
    fn test_closure_sink_factory() {
        let factory = |meta: &TransferMetadata| -> io::Result<SinkTarget> {
            Ok(SinkTarget::File(PathBuf::from(format!("/out/{}", meta.name))))
        };
        let meta = TransferMetadata::new("x.bin", PayloadKind::File);
        assert_eq!(
            factory.target_for(&meta).unwrap(),
            SinkTarget::File(PathBuf::from("/out/x.bin"))
        );
    }

    #[tokio::test]
    async fn test_file_sink_finalize_and_discard() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.bin");

        let mut sink = Sink::open(SinkTarget::File(path.clone())).await.unwrap();
        sink.write_chunk(b"abc").await.unwrap();
        sink.write_chunk(b"def").await.unwrap();
        let artifact = sink.finalize().await.unwrap();
        assert_eq!(artifact, Artifact::File(path.clone()));
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"abcdef");

        discard_partial(&path, PartialOutput::Keep).await;
        assert!(path.exists());
        discard_partial(&path, PartialOutput::Remove).await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_text_sink_rejects_invalid_utf8() {
        let mut sink = Sink::open(SinkTarget::Text).await.unwrap();
        sink.write_chunk(&[0xff, 0xfe]).await.unwrap();
        let err = sink.finalize().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
