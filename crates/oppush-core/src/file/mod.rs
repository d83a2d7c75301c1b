//! Resolving shares to readable files.
//!
//! Resolution happens right before a share is sent, so a file that vanished
//! or became unreadable after it was queued fails only that share.

use std::fmt;
use std::io::SeekFrom;

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncSeekExt};

use crate::error::{Error, Result};
use crate::share::ShareInfo;

/// Content type used when nothing better is known.
pub const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// A share ready to be streamed.
pub struct ResolvedFile {
    /// Name sent to the remote
    pub name: String,
    /// MIME type sent to the remote
    pub content_type: String,
    /// Total length in bytes
    pub length: u64,
    /// Open source stream positioned at the start
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl fmt::Debug for ResolvedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedFile")
            .field("name", &self.name)
            .field("content_type", &self.content_type)
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

/// Opens the source of a share and works out what to tell the remote.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileResolver;

impl FileResolver {
    /// Create a resolver.
    pub const fn new() -> Self {
        Self
    }

    /// Open the share's source file.
    ///
    /// The length comes from file metadata; when metadata reports zero the
    /// stream is measured by seeking to its end. The content type is the
    /// share's override, else a guess from the extension, else
    /// [`FALLBACK_CONTENT_TYPE`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileAccess`] if the file cannot be opened or measured.
    pub async fn resolve(&self, share: &ShareInfo) -> Result<ResolvedFile> {
        let path = share.path();
        let path_str = path.display().to_string();

        let mut file = File::open(path)
            .await
            .map_err(|e| Error::file_access(&path_str, e))?;
        let metadata = file
            .metadata()
            .await
            .map_err(|e| Error::file_access(&path_str, e))?;
        if metadata.is_dir() {
            return Err(Error::file_access(&path_str, "is a directory"));
        }

        let mut length = metadata.len();
        if length == 0 {
            length = file
                .seek(SeekFrom::End(0))
                .await
                .map_err(|e| Error::file_access(&path_str, e))?;
            file.seek(SeekFrom::Start(0))
                .await
                .map_err(|e| Error::file_access(&path_str, e))?;
            tracing::debug!("Measured {} by seeking: {} bytes", path_str, length);
        }

        let content_type = share.content_type().map_or_else(
            || {
                mime_guess::from_path(path)
                    .first()
                    .map_or_else(|| FALLBACK_CONTENT_TYPE.to_string(), |m| m.to_string())
            },
            str::to_string,
        );

        Ok(ResolvedFile {
            name: share.display_name(),
            content_type,
            length,
            reader: Box::new(file),
        })
    }
}

/// Format bytes as human-readable size.
#[allow(clippy::cast_precision_loss)]
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}
