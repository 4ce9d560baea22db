//! Upload source resolution.
//!
//! A source is named by URI:
//! - `data:[<media type>][;base64],<data>`: inline bytes
//! - `http://…`, `https://…`: streamed with `reqwest`
//! - `file://…` or a bare path: streamed from disk
//!
//! Resolution yields a byte stream plus whatever metadata the source
//! itself can tell us (name, size, media type).

use std::path::Path;
use std::pin::Pin;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use futures::{Stream, StreamExt, stream};
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::error::TunnelError;
use crate::metadata::{BulkFileMetadata, KEY_CHARSET, KEY_FILENAME, KEY_MIME_TYPE, KEY_SIZE};

/// Default read size for file and inline sources.
pub const DEFAULT_SOURCE_CHUNK_SIZE: usize = 64 * 1024;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TunnelError>> + Send>>;

/// An opened source.
pub struct ResolvedSource {
    pub stream: ByteStream,
    pub metadata: BulkFileMetadata,
}

impl std::fmt::Debug for ResolvedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedSource")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// Open the source named by `uri`.
pub async fn resolve(uri: &str, chunk_size: usize) -> Result<ResolvedSource, TunnelError> {
    let chunk_size = chunk_size.max(1);
    let mut source = if let Some(rest) = uri.strip_prefix("data:") {
        resolve_data_uri(rest, chunk_size)?
    } else if uri.starts_with("http://") || uri.starts_with("https://") {
        resolve_http(uri).await?
    } else if let Some(path) = uri.strip_prefix("file://") {
        resolve_file(Path::new(path), chunk_size).await?
    } else if uri.contains("://") {
        return Err(TunnelError::UnsupportedSource(uri.to_string()));
    } else {
        resolve_file(Path::new(uri), chunk_size).await?
    };
    source.metadata.backfill_inferred();
    debug!(metadata = ?source.metadata, "upload source resolved");
    Ok(source)
}

fn resolve_data_uri(rest: &str, chunk_size: usize) -> Result<ResolvedSource, TunnelError> {
    let (header, data) = rest
        .split_once(',')
        .ok_or_else(|| TunnelError::UnsupportedSource("data URI without ','".into()))?;

    let mut params = header.split(';');
    let media_type = params.next().unwrap_or_default();
    let mut is_base64 = false;
    let mut metadata = BulkFileMetadata::new();
    for param in params {
        if param.eq_ignore_ascii_case("base64") {
            is_base64 = true;
        } else if let Some(charset) = param.strip_prefix("charset=") {
            metadata.insert(KEY_CHARSET, charset);
        }
    }
    if !media_type.is_empty() {
        metadata.insert(KEY_MIME_TYPE, media_type);
    }

    let bytes = if is_base64 {
        Bytes::from(STANDARD.decode(data)?)
    } else {
        Bytes::copy_from_slice(data.as_bytes())
    };
    metadata.insert(KEY_SIZE, bytes.len());

    let chunks: Vec<Result<Bytes, TunnelError>> = (0..bytes.len())
        .step_by(chunk_size)
        .map(|start| Ok(bytes.slice(start..(start + chunk_size).min(bytes.len()))))
        .collect();
    Ok(ResolvedSource {
        stream: Box::pin(stream::iter(chunks)),
        metadata,
    })
}

async fn resolve_http(uri: &str) -> Result<ResolvedSource, TunnelError> {
    let response = reqwest::get(uri).await?.error_for_status()?;

    let mut metadata = BulkFileMetadata::new();
    if let Some(name) = response
        .url()
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
    {
        metadata.insert(KEY_FILENAME, name);
    }
    if let Some(len) = response.content_length() {
        metadata.insert(KEY_SIZE, len);
    }
    if let Some(content_type) = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
    {
        let mut parts = content_type.split(';').map(str::trim);
        if let Some(mime) = parts.next().filter(|m| !m.is_empty()) {
            metadata.insert(KEY_MIME_TYPE, mime);
        }
        if let Some(charset) = parts.find_map(|p| p.strip_prefix("charset=")) {
            metadata.insert(KEY_CHARSET, charset);
        }
    }

    let stream = response.bytes_stream().map(|chunk| chunk.map_err(TunnelError::from));
    Ok(ResolvedSource {
        stream: Box::pin(stream),
        metadata,
    })
}

async fn resolve_file(path: &Path, chunk_size: usize) -> Result<ResolvedSource, TunnelError> {
    let file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();

    let mut metadata = BulkFileMetadata::new().with(KEY_SIZE, len);
    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
        metadata.insert(KEY_FILENAME, name);
    }

    let stream = ReaderStream::with_capacity(file, chunk_size)
        .map(|chunk| chunk.map_err(|e| TunnelError::SourceStream(e.to_string())));
    Ok(ResolvedSource {
        stream: Box::pin(stream),
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(mut stream: ByteStream) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn base64_data_uri() {
        let source = resolve("data:image/png;base64,AAECAw==", 3).await.unwrap();
        assert_eq!(source.metadata.mime_type(), Some("image/png"));
        assert_eq!(source.metadata.size(), Some(4));
        assert_eq!(collect(source.stream).await, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn plain_data_uri() {
        let source = resolve("data:text/plain;charset=ascii,hi there", 4)
            .await
            .unwrap();
        assert_eq!(source.metadata.charset(), Some("ascii"));
        assert_eq!(collect(source.stream).await, b"hi there".to_vec());
    }

    #[tokio::test]
    async fn empty_data_uri() {
        let source = resolve("data:,", 16).await.unwrap();
        assert_eq!(source.metadata.size(), Some(0));
        assert!(collect(source.stream).await.is_empty());
    }

    #[tokio::test]
    async fn file_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.txt");
        std::fs::write(&path, b"line one\nline two\n").unwrap();

        let source = resolve(path.to_str().unwrap(), 5).await.unwrap();
        assert_eq!(source.metadata.filename(), Some("report.txt"));
        assert_eq!(source.metadata.size(), Some(18));
        assert_eq!(source.metadata.mime_type(), Some("text/plain"));
        assert_eq!(collect(source.stream).await, b"line one\nline two\n".to_vec());
    }

    #[tokio::test]
    async fn missing_file_is_io_error() {
        let err = resolve("/definitely/not/here.bin", 16).await.unwrap_err();
        assert!(matches!(err, TunnelError::Io(_)));
    }

    #[tokio::test]
    async fn unknown_scheme_rejected() {
        let err = resolve("ftp://example.com/x", 16).await.unwrap_err();
        assert!(matches!(err, TunnelError::UnsupportedSource(_)));
    }
}
