//! One generation, end to end.
//!
//! A task resolves its output path, opens the dual-sink writer, opens the
//! streaming session, and pumps chunks until the stream ends, cancellation
//! is observed, or something fails:
//!
//! ```text
//! Pending ─→ Running ─→ Succeeded   stream ended cleanly; artifact kept
//!                    ─→ Cancelled   stop requested; partial artifact kept
//!                    ─→ Failed      connect/auth/filter/I-O; artifact deleted
//! ```
//!
//! Cancellation is cooperative: session establishment is raced against the
//! token, then the token is polled once per chunk boundary, so latency is
//! bounded by one chunk's receive time. The chunk that triggers the check is
//! dropped, not written. Whatever the outcome, writer and session are
//! released before the result is reported.

use std::future::Future;
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;

use crate::client::{Chunk, ChunkStream, MusicSession};
use crate::config::Settings;
use crate::sink::AudioWriter;
use crate::{Error, Result, artifact};

/// Weight sent with the single prompt of a session.
const PROMPT_WEIGHT: f64 = 1.0;

pub const SUCCESS_MESSAGE: &str = "Music generated successfully.";
pub const STOPPED_MESSAGE: &str = "Generation stopped by user.";

/// What the user asked for. Immutable once submitted.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    /// Directory for the artifact; `None` means a temporary file.
    pub output_dir: Option<PathBuf>,
}

/// Terminal classification of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Cancelled,
    Failed,
}

/// Produced exactly once per task.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub outcome: Outcome,
    pub artifact_path: Option<PathBuf>,
    pub message: String,
}

impl GenerationResult {
    pub(crate) fn failed(error: Error) -> Self {
        Self {
            outcome: Outcome::Failed,
            artifact_path: None,
            message: format!("Error: {error}"),
        }
    }
}

/// Run one generation against the live service.
pub async fn run(
    request: GenerationRequest,
    settings: Settings,
    cancel: CancellationToken,
) -> GenerationResult {
    let path = match artifact::resolve_output_path(request.output_dir.as_deref(), &request.prompt)
    {
        Ok(path) => path,
        Err(error) => return GenerationResult::failed(error),
    };

    let mut writer = match AudioWriter::create(&path, settings.format, settings.live_playback) {
        Ok(writer) => writer,
        Err(error) => {
            remove_artifact(&path);
            return GenerationResult::failed(error);
        }
    };

    let session =
        match establish_or_cancel(open_session(&settings, &request.prompt), &cancel).await {
            Some(Ok(session)) => session,
            Some(Err(error)) => {
                if let Err(close_error) = writer.close() {
                    tracing::warn!(%close_error, "writer close after connect failure");
                }
                remove_artifact(&path);
                return GenerationResult::failed(error);
            }
            None => return cancelled_before_streaming(writer, path),
        };

    stream_session(session, writer, path, cancel).await
}

async fn open_session(settings: &Settings, prompt: &str) -> Result<MusicSession> {
    let mut session = MusicSession::connect(&settings.api_key, &settings.model).await?;
    let ready = match session.set_prompt(prompt, PROMPT_WEIGHT).await {
        Ok(()) => session.start().await,
        Err(error) => Err(error),
    };
    if let Err(error) = ready {
        session.close().await;
        return Err(error);
    }
    Ok(session)
}

/// Race session establishment against the stop token.
///
/// Before the stream exists there is no chunk boundary for a stop to land
/// on, so the whole pre-stream phase is raced instead; losing it drops the
/// half-built session along with its connection.
async fn establish_or_cancel<S, F>(
    establishment: F,
    cancel: &CancellationToken,
) -> Option<Result<S>>
where
    F: Future<Output = Result<S>>,
{
    tokio::select! {
        established = establishment => Some(established),
        () = cancel.cancelled() => None,
    }
}

/// Terminal for a stop that won the establishment race: the artifact is
/// finalized empty and kept, like a cancel at the first chunk boundary.
fn cancelled_before_streaming(mut writer: AudioWriter, path: PathBuf) -> GenerationResult {
    tracing::info!("stop observed while establishing the session");
    if let Err(close_error) = writer.close() {
        tracing::warn!(%close_error, "finalize on cancelled artifact");
    }
    GenerationResult {
        outcome: Outcome::Cancelled,
        artifact_path: Some(path),
        message: STOPPED_MESSAGE.to_string(),
    }
}

/// Pump an already-started source into the writer and classify the end.
///
/// Split from [`run`] so the terminal policy can be driven by scripted
/// sources; the live path enters here with a connected [`MusicSession`].
async fn stream_session<S: ChunkStream>(
    mut source: S,
    mut writer: AudioWriter,
    path: PathBuf,
    cancel: CancellationToken,
) -> GenerationResult {
    tracing::info!(
        path = %path.display(),
        live = writer.has_live_output(),
        "generation running"
    );

    let end = pump(&mut source, &mut writer, &cancel).await;

    // Both sinks are released here, before any result leaves the task.
    let closed = writer.close();
    source.close().await;
    if let Err(close_error) = &closed {
        tracing::warn!(%close_error, "artifact finalize failed");
    }

    match end {
        Err(error) => {
            remove_artifact(&path);
            GenerationResult::failed(error)
        }
        // The partial take is the deliverable; it is never deleted. Even a
        // finalize that failed already released both sinks above.
        Ok(PumpEnd::Cancelled) => GenerationResult {
            outcome: Outcome::Cancelled,
            artifact_path: Some(path),
            message: STOPPED_MESSAGE.to_string(),
        },
        Ok(PumpEnd::Finished) => match closed {
            Ok(()) => GenerationResult {
                outcome: Outcome::Succeeded,
                artifact_path: Some(path),
                message: SUCCESS_MESSAGE.to_string(),
            },
            Err(error) => {
                remove_artifact(&path);
                GenerationResult::failed(error)
            }
        },
    }
}

enum PumpEnd {
    Finished,
    Cancelled,
}

async fn pump<S: ChunkStream>(
    source: &mut S,
    writer: &mut AudioWriter,
    cancel: &CancellationToken,
) -> Result<PumpEnd> {
    loop {
        let Some(chunk) = source.next_chunk().await? else {
            tracing::info!(frames = writer.frames_written(), "stream ended");
            return Ok(PumpEnd::Finished);
        };
        if cancel.is_cancelled() {
            tracing::info!(
                frames = writer.frames_written(),
                "stop observed at chunk boundary"
            );
            return Ok(PumpEnd::Cancelled);
        }
        match chunk {
            Chunk::Audio(bytes) => writer.write(&bytes)?,
            Chunk::Filtered(reason) => return Err(Error::Filtered(reason)),
        }
    }
}

/// Failure-path cleanup. Removal trouble is logged, never escalated.
fn remove_artifact(path: &Path) {
    if !path.exists() {
        return;
    }
    if let Err(error) = std::fs::remove_file(path) {
        tracing::warn!(path = %path.display(), %error, "could not remove partial artifact");
    } else {
        tracing::debug!(path = %path.display(), "partial artifact removed");
    }
}
