//! The transfers behind each subcommand.
//!
//! Each one is generic over its byte streams so the binary wires them to
//! stdin/stdout while tests use in-memory buffers.

use std::path::Path;

use amtunnel_core::{
    Action, AppModeHandler, BulkDownloadHandler, BulkFileMetadata, BulkFileUploader, Command,
    Direction, DownloadOptions, DownloadState, HandlerResult, HashChain, LineCodec, PtyReader,
    TunnelError, UploadEvent,
};
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, info};

use crate::storage::FsStorage;

/// Longest stdin line `receive` buffers; metadata blocks share a line
/// with the first frame.
const MAX_INPUT_LINE: usize = 1 << 20;

// ── send ─────────────────────────────────────────────────────────

/// Drive `uploader`, copying everything it writes to the pty channel
/// into `out`. Returns the number of source bytes read.
pub async fn send<W>(
    mut uploader: BulkFileUploader,
    mut events: mpsc::UnboundedReceiver<UploadEvent>,
    mut pty: PtyReader,
    mut out: W,
) -> Result<u64, TunnelError>
where
    W: AsyncWrite + Unpin,
{
    let run = async move {
        let result = uploader.upload().await;
        let total = uploader.uploaded();
        // closes the channel once any trailing lines are written
        drop(uploader);
        result.map(|()| total)
    };
    let pump = async move {
        while let Some(chunk) = pty.recv().await {
            out.write_all(chunk.as_bytes()).await?;
            out.flush().await?;
        }
        Ok::<_, TunnelError>(())
    };
    let progress = async move {
        while let Some(event) = events.recv().await {
            match event {
                UploadEvent::Uploaded(total) => debug!(bytes = total, "read from source"),
                UploadEvent::Finished => info!("upload finished"),
            }
        }
    };

    let (result, pumped, ()) = tokio::join!(run, pump, progress);
    pumped?;
    result
}

// ── receive ──────────────────────────────────────────────────────

/// Feed `input` to a download handler backed by `storage`.
///
/// The start parameter comes from `start` or, when absent, from the
/// first input line. Input the handler gives back on abort is written to
/// `passthrough` as ordinary output. Returns the paths of the files saved.
pub async fn receive<R, W>(
    input: R,
    start: Option<usize>,
    storage: FsStorage,
    options: DownloadOptions,
    mut passthrough: W,
) -> Result<Vec<std::path::PathBuf>, TunnelError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = FramedRead::new(input, LinesCodec::new_with_max_length(MAX_INPUT_LINE));

    let declared = match start {
        Some(n) => n.to_string(),
        None => next_line(&mut lines)
            .await?
            .ok_or_else(|| TunnelError::InvalidStartParams("no start line".into()))?
            .trim()
            .to_string(),
    };

    let mut handler = BulkDownloadHandler::with_options(storage.clone(), options);
    handler.on_created_bulk_file(|file| {
        info!(
            file_id = file.id(),
            filename = file.metadata().filename().unwrap_or("<unnamed>"),
            "bulk file created"
        );
    });

    let result = handler.handle_start(&[declared.as_str()]);
    check(result, &handler, &mut passthrough).await?;
    while let Some(line) = next_line(&mut lines).await? {
        // sink flushes and closes touch the disk
        let mut result = off_runtime(|| handler.handle_data(&format!("{line}\n")));
        while result.action == Action::Pause {
            off_runtime(|| storage.flush())?;
            result = off_runtime(|| handler.handle_drain());
        }
        check(result, &handler, &mut passthrough).await?;
        if handler.state() == DownloadState::Complete {
            break;
        }
    }
    let result = off_runtime(|| handler.handle_stop());
    check(result, &handler, &mut passthrough).await?;
    Ok(storage.saved())
}

/// Run blocking filesystem work without stalling other tasks on a
/// multi-threaded runtime. Inline elsewhere.
fn off_runtime<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current().map(|h| h.runtime_flavor()) {
        Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(f),
        _ => f(),
    }
}

async fn next_line<R>(
    lines: &mut FramedRead<R, LinesCodec>,
) -> Result<Option<String>, TunnelError>
where
    R: AsyncRead + Unpin,
{
    lines
        .next()
        .await
        .transpose()
        .map_err(|e| TunnelError::Other(format!("reading input: {e}")))
}

async fn check<W>(
    result: HandlerResult,
    handler: &BulkDownloadHandler<FsStorage>,
    passthrough: &mut W,
) -> Result<(), TunnelError>
where
    W: AsyncWrite + Unpin,
{
    if !result.is_abort() {
        return Ok(());
    }
    if let Some(rest) = result.remaining_data.filter(|r| !r.is_empty()) {
        debug!(bytes = rest.len(), "passing unconsumed input through");
        passthrough.write_all(rest.as_bytes()).await?;
        passthrough.flush().await?;
    }
    let reason = handler
        .session()
        .and_then(|s| s.failure())
        .map(ToString::to_string)
        .unwrap_or_else(|| "no active transfer".into());
    Err(TunnelError::Aborted(reason))
}

// ── unpack ───────────────────────────────────────────────────────

/// What `unpack` rebuilt.
#[derive(Debug, Clone)]
pub struct UnpackSummary {
    pub metadata: BulkFileMetadata,
    pub bytes: u64,
}

/// Rebuild a file from an upload line stream, verifying the chain.
pub async fn unpack<R>(input: R, out_path: &Path) -> Result<UnpackSummary, TunnelError>
where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(input, LineCodec::new(Direction::Upload));
    let mut chain = HashChain::new();
    let mut out = tokio::fs::File::create(out_path).await?;
    let mut metadata: Option<BulkFileMetadata> = None;
    let mut bytes = 0u64;

    while let Some(frame) = frames.next().await {
        let frame = frame?;
        chain.verify(&frame.payload, &frame.hash)?;
        match frame.command {
            Command::Metadata => {
                if metadata.is_some() {
                    return Err(TunnelError::Framing("repeated metadata line"));
                }
                let json = std::str::from_utf8(&frame.payload)
                    .map_err(|e| TunnelError::MetadataParse(e.to_string()))?;
                let parsed = BulkFileMetadata::parse(json)?;
                info!(
                    filename = parsed.filename().unwrap_or("<unnamed>"),
                    size = parsed.size(),
                    "unpacking"
                );
                metadata = Some(parsed);
            }
            Command::Data => {
                if metadata.is_none() {
                    return Err(TunnelError::Framing("data before metadata"));
                }
                out.write_all(&frame.payload).await?;
                bytes += frame.payload.len() as u64;
            }
            Command::End => {
                out.flush().await?;
                let metadata =
                    metadata.ok_or(TunnelError::Framing("end before metadata"))?;
                return Ok(UnpackSummary { metadata, bytes });
            }
            Command::Abort => {
                return Err(TunnelError::Aborted("sender aborted the upload".into()));
            }
        }
    }
    Err(TunnelError::Incomplete)
}

// ── Tests ────────────────────────────────────────────────────────
