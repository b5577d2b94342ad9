//! Foreground controller — the polling state machine a host drives.
//!
//! The host submits a prompt, then ticks the controller on a fixed interval
//! until it settles back to idle; queries expose the in-progress flag, the
//! append-only history log, and the pointer to the most recent artifact.
//! One generation may be outstanding at a time — that is policy here, not a
//! limit of the [`BackgroundEngine`].
//!
//! Terminal reconciliation is driven by the task's reported outcome plus a
//! cheap probe of the artifact on disk: a cancelled take with zero frames is
//! treated as "nothing produced", so the pointer is cleared and the timeline
//! collaborator is not bothered with an empty file.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::engine::{BackgroundEngine, GenerationHandle};
use crate::task::{self, GenerationRequest, GenerationResult, Outcome};
use crate::{Error, Result, artifact};

/// Collaborator that places a finished artifact on the host's timeline.
///
/// Called at most once per generation, and only when the artifact holds
/// audio. Implementations validate the file themselves before import;
/// [`artifact::probe_wav`] is available for that.
pub trait TimelineNotifier {
    fn notify(&mut self, artifact: &Path);
}

enum Phase {
    Idle,
    /// A generation is in flight; the handle lives here and nowhere else.
    Awaiting(GenerationHandle),
}

/// Polling front end over one [`BackgroundEngine`].
pub struct Controller {
    engine: Arc<BackgroundEngine>,
    settings: Settings,
    notifier: Option<Box<dyn TimelineNotifier>>,
    phase: Phase,
    history: Vec<String>,
    last_artifact: Option<PathBuf>,
}

impl Controller {
    pub fn new(engine: Arc<BackgroundEngine>, settings: Settings) -> Self {
        Self {
            engine,
            settings,
            notifier: None,
            phase: Phase::Idle,
            history: Vec::new(),
            last_artifact: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Box<dyn TimelineNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Validate and start a generation.
    ///
    /// Rejection leaves the controller untouched: no history entry, no
    /// pointer change, no task. On acceptance the pointer is cleared, the
    /// prompt is logged, and the controller waits for [`Controller::tick`]
    /// to observe the terminal result.
    pub fn submit(&mut self, prompt: &str, output_dir: Option<&Path>) -> Result<()> {
        if self.is_generating() {
            return Err(Error::Validation(
                "a generation is already in progress".to_string(),
            ));
        }
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(Error::Validation("prompt must not be empty".to_string()));
        }
        if let Some(dir) = output_dir
            && !dir.is_dir()
        {
            return Err(Error::Validation(format!(
                "output directory does not exist: {}",
                dir.display()
            )));
        }
        if self.settings.api_key.trim().is_empty() {
            return Err(Error::Validation(
                "no API key configured in preferences".to_string(),
            ));
        }

        let request = GenerationRequest {
            prompt: prompt.to_string(),
            output_dir: output_dir.map(Path::to_path_buf),
        };
        let settings = self.settings.clone();
        self.submit_with(request, move |request, cancel| {
            task::run(request, settings, cancel)
        })
    }

    /// Acceptance path shared by [`Controller::submit`] and tests, which
    /// drive the state machine with scripted jobs instead of live sessions.
    fn submit_with<F, Fut>(&mut self, request: GenerationRequest, job: F) -> Result<()>
    where
        F: FnOnce(GenerationRequest, CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = GenerationResult> + Send + 'static,
    {
        let prompt = request.prompt.clone();
        let handle = self.engine.submit(move |cancel| job(request, cancel))?;
        self.last_artifact = None;
        self.history.push(format!("Prompt: {prompt}"));
        self.phase = Phase::Awaiting(handle);
        tracing::info!(%prompt, "generation submitted");
        Ok(())
    }

    /// Ask the in-flight generation to stop. The state does not change here;
    /// a later tick observes the cancelled result like any other terminal.
    pub fn request_stop(&self) -> Result<()> {
        let Phase::Awaiting(handle) = &self.phase else {
            return Err(Error::Validation(
                "no generation in progress".to_string(),
            ));
        };
        handle.request_stop();
        tracing::info!("stop requested");
        Ok(())
    }

    /// One poll step. Cheap while the task runs; on completion, reconciles
    /// pointer, history, and the timeline collaborator exactly once.
    pub fn tick(&mut self) {
        let Phase::Awaiting(handle) = &mut self.phase else {
            return;
        };
        let Some(result) = handle.try_result() else {
            return;
        };
        self.phase = Phase::Idle;
        self.reconcile(result);
    }

    pub fn is_generating(&self) -> bool {
        matches!(self.phase, Phase::Awaiting(_))
    }

    pub fn last_artifact_path(&self) -> Option<&Path> {
        self.last_artifact.as_deref()
    }

    /// Oldest first; grows by two per accepted generation.
    pub fn history_entries(&self) -> &[String] {
        &self.history
    }

    fn reconcile(&mut self, result: GenerationResult) {
        let delivered = result
            .artifact_path
            .as_deref()
            .filter(|path| artifact::has_audio(path));

        self.last_artifact = match result.outcome {
            Outcome::Succeeded => result.artifact_path.clone(),
            Outcome::Cancelled => delivered.map(Path::to_path_buf),
            Outcome::Failed => None,
        };
        self.history.push(format!("Composer4U: {}", result.message));
        tracing::info!(
            outcome = ?result.outcome,
            message = %result.message,
            "generation finished"
        );

        if let Some(path) = delivered
            && let Some(notifier) = self.notifier.as_deref_mut()
        {
            notifier.notify(path);
        }
    }
}
