//! Composer4U CLI — stream one music generation from the terminal.
//!
//! Plays the host role over the library: submits a prompt, ticks the
//! controller until the generation settles, and maps Ctrl-C to the stop
//! request so an interrupted take survives as a partial WAV.
//!
//! # Output
//!
//! Writes a WAV file into --output-dir (or a temporary file) while playing
//! it on the default audio device. On completion the history log is printed,
//! followed by a one-line JSON summary:
//!
//! ```json
//! {"path":"/tmp/composition_20250101_120000_calm_piano.wav","frames":480000,"sample_rate":48000,"channels":2}
//! ```
//!
//! Exit code 0 when an artifact was produced, non-zero otherwise.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use composer4u::artifact;
use composer4u::config::Settings;
use composer4u::controller::{Controller, TimelineNotifier};
use composer4u::engine::BackgroundEngine;

const TICK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(
    name = "composer4u",
    about = "Stream AI-generated music into a WAV file",
    long_about = "Submit a text prompt to the Lyria realtime service and stream the\n\
                  result into a WAV file, playing it live while it arrives.\n\
                  Press Ctrl-C to stop and keep the partial take."
)]
struct Args {
    /// Text description of the music to generate.
    #[arg(long, short = 'p')]
    prompt: String,

    /// Directory for the artifact. Omit to write a temporary file.
    #[arg(long, short = 'o')]
    output_dir: Option<PathBuf>,

    /// API key for the generation service. Falls back to $GEMINI_API_KEY.
    #[arg(long)]
    api_key: Option<String>,

    /// Disable live device playback; write the file only.
    #[arg(long)]
    no_playback: bool,
}

/// Stand-in for the timeline collaborator: validates the artifact the way
/// an importer would, then reports where it landed.
struct PrintTimeline;

impl TimelineNotifier for PrintTimeline {
    fn notify(&mut self, artifact: &Path) {
        match artifact::probe_wav(artifact) {
            Ok(probe) => tracing::info!(
                path = %artifact.display(),
                frames = probe.frames,
                "artifact ready for timeline insertion"
            ),
            Err(error) => tracing::warn!(%error, "artifact failed the validation probe"),
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let api_key = match args
        .api_key
        .or_else(|| std::env::var("GEMINI_API_KEY").ok())
    {
        Some(key) if !key.trim().is_empty() => key,
        _ => anyhow::bail!("no API key: pass --api-key or set GEMINI_API_KEY"),
    };
    let settings = Settings {
        api_key,
        live_playback: !args.no_playback,
        ..Settings::default()
    };

    let stop_flag = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop_flag);
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))?;

    let engine = Arc::new(
        BackgroundEngine::start().map_err(|e| anyhow::anyhow!("engine start failed: {e}"))?,
    );
    let mut controller =
        Controller::new(Arc::clone(&engine), settings).with_notifier(Box::new(PrintTimeline));

    controller
        .submit(&args.prompt, args.output_dir.as_deref())
        .map_err(|e| anyhow::anyhow!("submit rejected: {e}"))?;
    tracing::info!("generating — press Ctrl-C to stop and keep the partial take");

    let mut stop_sent = false;
    while controller.is_generating() {
        if !stop_sent && stop_flag.load(Ordering::SeqCst) {
            let _ = controller.request_stop();
            stop_sent = true;
        }
        controller.tick();
        std::thread::sleep(TICK_INTERVAL);
    }

    for entry in controller.history_entries() {
        println!("{entry}");
    }

    let Some(path) = controller.last_artifact_path() else {
        anyhow::bail!("no artifact produced");
    };
    let probe =
        artifact::probe_wav(path).map_err(|e| anyhow::anyhow!("artifact unreadable: {e}"))?;

    // Machine-readable summary for the caller, last line on stdout.
    println!(
        r#"{{"path":"{path}","frames":{frames},"sample_rate":{rate},"channels":{channels}}}"#,
        path = path.display(),
        frames = probe.frames,
        rate = probe.sample_rate,
        channels = probe.channels,
    );

    engine.shutdown();
    Ok(())
}
