//! Background execution engine.
//!
//! One worker thread hosts a single-threaded async runtime for the life of
//! the engine; generations are submitted onto it and observed from the
//! foreground through [`GenerationHandle`]s. `submit` returns as soon as the
//! task is scheduled — it blocks only for the bounded bootstrap window right
//! after [`BackgroundEngine::start`], while the worker is still publishing
//! its runtime handle. The worker sweeps finished task handles on an
//! interval so its bookkeeping stays bounded.
//!
//! The engine does not ration work: whether more than one generation may be
//! in flight is the caller's policy.

use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread;
use std::time::Duration;

use tokio::runtime;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::task::GenerationResult;
use crate::{Error, Result};

/// One bootstrap retry step; total wait is this times [`BOOTSTRAP_TRIES`].
const BOOTSTRAP_WAIT: Duration = Duration::from_millis(10);
const BOOTSTRAP_TRIES: u32 = 200;

/// How often the supervisor drops handles of finished tasks.
const REAP_INTERVAL: Duration = Duration::from_secs(5);

/// Caller's view of one submitted generation.
///
/// Carries the cancellation token and the one-shot result slot. The result
/// can be read at most once; after [`GenerationHandle::try_result`] returns
/// it, the handle is spent and should be dropped.
#[derive(Debug)]
pub struct GenerationHandle {
    cancel: CancellationToken,
    result: oneshot::Receiver<GenerationResult>,
}

impl GenerationHandle {
    /// Ask the task to stop at its next chunk boundary. Idempotent.
    pub fn request_stop(&self) {
        self.cancel.cancel();
    }

    pub fn stop_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Non-blocking poll for the terminal result.
    ///
    /// `None` while the task is still running. If the task went away without
    /// reporting — a panic, or the engine torn down mid-flight — a failure is
    /// synthesized so the caller always observes a terminal state.
    pub fn try_result(&mut self) -> Option<GenerationResult> {
        match self.result.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(GenerationResult::failed(
                Error::Engine("generation ended without reporting a result".to_string()),
            )),
        }
    }
}

/// Owns the worker thread and schedules generations onto it.
///
/// An explicitly constructed value: create it with [`BackgroundEngine::start`]
/// at activation, stop it with [`BackgroundEngine::shutdown`] (or drop it) at
/// deactivation. Shutdown is abrupt — in-flight generations are dropped, and
/// their handles report a synthesized failure.
pub struct BackgroundEngine {
    runtime_handle: Arc<OnceLock<runtime::Handle>>,
    register_tx: mpsc::UnboundedSender<JoinHandle<()>>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl BackgroundEngine {
    /// Spawn the worker thread and return the engine immediately.
    ///
    /// The runtime inside the worker comes up asynchronously; the first
    /// `submit` waits for it with a bounded spin, so submitting right after
    /// `start` is safe.
    pub fn start() -> Result<Self> {
        let runtime_handle = Arc::new(OnceLock::new());
        let (register_tx, register_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let slot = Arc::clone(&runtime_handle);
        let worker = thread::Builder::new()
            .name("composer4u-engine".to_string())
            .spawn(move || worker_loop(slot, register_rx, shutdown_rx))
            .map_err(|error| Error::Engine(format!("worker thread spawn failed: {error}")))?;

        Ok(Self {
            runtime_handle,
            register_tx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Schedule one generation job and return its handle.
    ///
    /// The job receives a fresh cancellation token; its future runs entirely
    /// on the worker runtime and its result lands in the handle's slot.
    pub fn submit<F, Fut>(&self, job: F) -> Result<GenerationHandle>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = GenerationResult> + Send + 'static,
    {
        if lock_unpoisoned(&self.shutdown_tx).is_none() {
            return Err(Error::Engine("engine is shut down".to_string()));
        }
        let runtime = self.wait_for_runtime()?;

        let cancel = CancellationToken::new();
        let (result_tx, result_rx) = oneshot::channel();
        let task_cancel = cancel.clone();
        let task = runtime.spawn(async move {
            let result = job(task_cancel).await;
            if result_tx.send(result).is_err() {
                tracing::debug!("generation result receiver dropped before completion");
            }
        });
        if self.register_tx.send(task).is_err() {
            // Supervisor already gone; the handle still resolves via the
            // closed oneshot.
            tracing::warn!("task submitted while engine supervisor was stopping");
        }

        Ok(GenerationHandle {
            cancel,
            result: result_rx,
        })
    }

    /// Stop the worker and wait for it to exit. Idempotent.
    pub fn shutdown(&self) {
        let Some(shutdown_tx) = lock_unpoisoned(&self.shutdown_tx).take() else {
            return;
        };
        // The receiver only disappears once the supervisor has already
        // stopped, so a failed send still means "shutting down".
        let _ = shutdown_tx.send(());
        if let Some(worker) = lock_unpoisoned(&self.worker).take() {
            if worker.join().is_err() {
                tracing::error!("engine worker thread panicked");
            }
        }
        tracing::info!("background engine stopped");
    }

    /// Runtime handle once the worker has published it.
    fn wait_for_runtime(&self) -> Result<runtime::Handle> {
        for _ in 0..BOOTSTRAP_TRIES {
            if let Some(handle) = self.runtime_handle.get() {
                return Ok(handle.clone());
            }
            thread::sleep(BOOTSTRAP_WAIT);
        }
        Err(Error::Engine(
            "worker runtime did not come up in time".to_string(),
        ))
    }
}

impl Drop for BackgroundEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Lock that shrugs off poisoning; the guarded state stays usable even if a
/// panicking thread held it.
fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Body of the worker thread: build the runtime, publish its handle, then
/// park in the supervision loop until told to stop.
fn worker_loop(
    slot: Arc<OnceLock<runtime::Handle>>,
    register_rx: mpsc::UnboundedReceiver<JoinHandle<()>>,
    shutdown_rx: oneshot::Receiver<()>,
) {
    let runtime = match runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            // The handle slot stays empty; submits time out with an engine
            // error instead of hanging.
            tracing::error!(%error, "engine runtime build failed");
            return;
        }
    };
    let _ = slot.set(runtime.handle().clone());
    tracing::debug!("engine runtime up");

    runtime.block_on(supervise(register_rx, shutdown_rx));
    // Dropping the runtime here drops any still-running generation.
}

async fn supervise(
    mut register_rx: mpsc::UnboundedReceiver<JoinHandle<()>>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();
    let mut reap = tokio::time::interval(REAP_INTERVAL);

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                tasks.retain(|task| !task.is_finished());
                if !tasks.is_empty() {
                    tracing::warn!(in_flight = tasks.len(), "engine stopping with generations in flight");
                }
                break;
            }
            registered = register_rx.recv() => {
                match registered {
                    Some(task) => tasks.push(task),
                    None => break,
                }
            }
            _ = reap.tick() => {
                let before = tasks.len();
                tasks.retain(|task| !task.is_finished());
                if tasks.len() < before {
                    tracing::debug!(reaped = before - tasks.len(), live = tasks.len(), "swept finished generations");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Outcome;

    fn done(outcome: Outcome, message: &str) -> GenerationResult {
        GenerationResult {
            outcome,
            artifact_path: None,
            message: message.to_string(),
        }
    }

    /// Poll a handle until it reports, with a bounded wait.
    fn wait_result(handle: &mut GenerationHandle) -> GenerationResult {
        for _ in 0..400 {
            if let Some(result) = handle.try_result() {
                return result;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("generation did not report in time");
    }

    #[test]
    fn test_submit_immediately_after_start() {
        let engine = BackgroundEngine::start().unwrap();
        let mut handle = engine
            .submit(|_cancel| async { done(Outcome::Succeeded, "ok") })
            .unwrap();

        let result = wait_result(&mut handle);
        assert_eq!(result.outcome, Outcome::Succeeded);
        assert_eq!(result.message, "ok");
    }

    #[test]
    fn test_try_result_is_none_until_job_finishes() {
        let engine = BackgroundEngine::start().unwrap();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let mut handle = engine
            .submit(move |_cancel| async move {
                let _ = release_rx.await;
                done(Outcome::Succeeded, "released")
            })
            .unwrap();

        assert!(handle.try_result().is_none());
        release_tx.send(()).unwrap();
        assert_eq!(wait_result(&mut handle).message, "released");
    }

    #[test]
    fn test_stop_request_reaches_job_token() {
        let engine = BackgroundEngine::start().unwrap();
        let mut handle = engine
            .submit(|cancel| async move {
                cancel.cancelled().await;
                done(Outcome::Cancelled, "stopped")
            })
            .unwrap();

        assert!(!handle.stop_requested());
        handle.request_stop();
        assert!(handle.stop_requested());

        let result = wait_result(&mut handle);
        assert_eq!(result.outcome, Outcome::Cancelled);
    }

    #[test]
    fn test_shutdown_synthesizes_result_for_inflight_job() {
        let engine = BackgroundEngine::start().unwrap();
        let mut handle = engine
            .submit(|cancel| async move {
                // Parks until cancelled; shutdown drops it instead.
                cancel.cancelled().await;
                done(Outcome::Cancelled, "never sent")
            })
            .unwrap();

        engine.shutdown();
        engine.shutdown(); // second call is a no-op

        let result = wait_result(&mut handle);
        assert_eq!(result.outcome, Outcome::Failed);
        assert!(result.message.starts_with("Error:"));
    }

    #[test]
    fn test_submit_after_shutdown_is_rejected() {
        let engine = BackgroundEngine::start().unwrap();
        engine.shutdown();

        let submitted = engine.submit(|_cancel| async { done(Outcome::Succeeded, "late") });
        assert!(submitted.is_err());
    }

    #[test]
    fn test_two_jobs_run_on_one_engine() {
        // Rationing submissions is the caller's policy, not the engine's.
        let engine = BackgroundEngine::start().unwrap();
        let mut first = engine
            .submit(|_cancel| async { done(Outcome::Succeeded, "first") })
            .unwrap();
        let mut second = engine
            .submit(|_cancel| async { done(Outcome::Succeeded, "second") })
            .unwrap();

        assert_eq!(wait_result(&mut first).message, "first");
        assert_eq!(wait_result(&mut second).message, "second");
    }
}
