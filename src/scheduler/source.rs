use crate::scheduler::plan::PartRange;
use bytes::{Bytes, BytesMut};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// A local media file being uploaded.
///
/// Holds no open handle; each part read opens the file, so a buffer is owned
/// only by the worker that asked for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSource {
    path: PathBuf,
    file_name: String,
    file_size: u64,
    mime_type: String,
}

impl FileSource {
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }

        let file_name = path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();
        let mime_type = guess_mime_type(&file_name).to_string();

        Ok(Self {
            path,
            file_name,
            file_size: metadata.len(),
            mime_type,
        })
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// Read the bytes of one part.
    pub async fn read_range(&self, range: &PartRange) -> std::io::Result<Bytes> {
        let len = usize::try_from(range.len).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "part too large for memory")
        })?;
        if len == 0 {
            return Ok(Bytes::new());
        }

        let mut file = File::open(&self.path).await?;
        file.seek(SeekFrom::Start(range.offset)).await?;

        let mut buf = BytesMut::zeroed(len);
        file.read_exact(&mut buf).await?;
        Ok(buf.freeze())
    }
}

/// MIME type for common media extensions; anything else is sent as
/// `application/octet-stream`.
pub fn guess_mime_type(file_name: &str) -> &'static str {
    let ext = match file_name.rsplit_once('.') {
        Some((_, ext)) => ext.to_ascii_lowercase(),
        None => return DEFAULT_MIME_TYPE,
    };

    match ext.as_str() {
        "mp4" | "m4v" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "m4a" => "audio/mp4",
        "aac" => "audio/aac",
        "ogg" => "audio/ogg",
        "flac" => "audio/flac",
        _ => DEFAULT_MIME_TYPE,
    }
}
