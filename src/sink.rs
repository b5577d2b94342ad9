//! Dual-sink audio writer: WAV file plus optional live playback.
//!
//! Every chunk of PCM16 bytes is appended to the file sink; if a playback
//! device opened, the same bytes are mirrored there best-effort. Device
//! trouble never aborts the file sink. `close()` finalizes the WAV header so
//! a partially written file stays playable with the frame count that was
//! actually written, and stops the playback thread; both also happen from
//! `Drop` so error and cancellation paths cannot leak them.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::thread;
use std::time::Duration;

use rodio::{OutputStream, Sink, Source};

use crate::config::AudioFormat;
use crate::{Error, Result};

/// Buffers queued ahead of the device. Chunks arrive near realtime, so a
/// deep queue only adds latency between the file and what is heard.
const PLAYBACK_QUEUE_DEPTH: usize = 8;

// ── Playback source ───────────────────────────────────────────────────────

/// Pulls sample buffers from a channel and plays them.
///
/// An empty channel yields silence instead of blocking: the rodio mixer
/// calls `next` from its audio callback and must never wait on the network.
/// A disconnected channel drains what is buffered and then ends the source.
struct ChannelSource {
    rx: Receiver<Vec<f32>>,
    current: Vec<f32>,
    pos: usize,
    channels: u16,
    sample_rate: u32,
}

impl Iterator for ChannelSource {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        loop {
            if self.pos < self.current.len() {
                let sample = self.current[self.pos];
                self.pos += 1;
                return Some(sample);
            }
            match self.rx.try_recv() {
                Ok(buf) => {
                    self.current = buf;
                    self.pos = 0;
                }
                Err(mpsc::TryRecvError::Empty) => return Some(0.0),
                Err(mpsc::TryRecvError::Disconnected) => return None,
            }
        }
    }
}

impl Source for ChannelSource {
    fn current_frame_len(&self) -> Option<usize> {
        None
    }
    fn channels(&self) -> u16 {
        self.channels
    }
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
    fn total_duration(&self) -> Option<std::time::Duration> {
        None
    }
}

// ── Device sink ───────────────────────────────────────────────────────────

/// Live output device fed from a dedicated thread.
///
/// `OutputStream` is not `Send`, so the thread owns the whole rodio stack
/// and the writer only holds the feed channel and a stop flag.
struct PlaybackSink {
    tx: Option<SyncSender<Vec<f32>>>,
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl PlaybackSink {
    fn spawn(format: AudioFormat) -> Result<Self> {
        let (tx, rx) = mpsc::sync_channel::<Vec<f32>>(PLAYBACK_QUEUE_DEPTH);
        let (ready_tx, ready_rx) = mpsc::channel::<std::result::Result<(), String>>();
        let stop = Arc::new(AtomicBool::new(false));

        let thread = thread::Builder::new().name("composer4u-playback".into()).spawn({
            let stop = Arc::clone(&stop);
            move || {
                let (_stream, handle) = match OutputStream::try_default() {
                    Ok(pair) => pair,
                    Err(error) => {
                        let _ = ready_tx.send(Err(error.to_string()));
                        return;
                    }
                };
                let sink = match Sink::try_new(&handle) {
                    Ok(sink) => sink,
                    Err(error) => {
                        let _ = ready_tx.send(Err(error.to_string()));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                sink.append(ChannelSource {
                    rx,
                    current: Vec::new(),
                    pos: 0,
                    channels: format.channels,
                    sample_rate: format.sample_rate,
                });
                // The source ends once the feed disconnects and drains;
                // the flag cuts playback immediately on close.
                while !stop.load(Ordering::Relaxed) && !sink.empty() {
                    thread::sleep(Duration::from_millis(50));
                }
                sink.stop();
            }
        })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                tx: Some(tx),
                stop,
                thread: Some(thread),
            }),
            Ok(Err(reason)) => {
                let _ = thread.join();
                Err(Error::Audio(format!("audio device unavailable: {reason}")))
            }
            Err(_) => {
                let _ = thread.join();
                Err(Error::Audio(
                    "playback thread exited before reporting device state".to_string(),
                ))
            }
        }
    }

    /// Queue samples for the device. A full queue drops the buffer — a
    /// device that cannot keep up must not stall the network loop — and a
    /// dead playback thread disables live output for the rest of the run.
    fn push(&mut self, samples: Vec<f32>) {
        let Some(tx) = &self.tx else { return };
        match tx.try_send(samples) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::trace!("playback queue full, dropping buffer");
            }
            Err(TrySendError::Disconnected(_)) => {
                tracing::warn!("playback thread gone, disabling live output");
                self.tx = None;
            }
        }
    }
}

impl Drop for PlaybackSink {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.tx = None;
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

// ── Writer ────────────────────────────────────────────────────────────────

/// Writer fanning PCM16 chunks out to a WAV file and, if available, the
/// default output device.
pub struct AudioWriter {
    wav: Option<hound::WavWriter<BufWriter<File>>>,
    playback: Option<PlaybackSink>,
    path: PathBuf,
    format: AudioFormat,
    frames_written: u64,
    /// Tail of a frame split across chunks, held until the next write.
    pending: Vec<u8>,
}

impl AudioWriter {
    /// Create the file sink at `path` and, when `live_playback` is set, try
    /// to open the device sink. Device failure logs a warning and the writer
    /// continues file-only.
    pub fn create(path: &Path, format: AudioFormat, live_playback: bool) -> Result<Self> {
        let wav = hound::WavWriter::create(path, format.wav_spec())?;
        let playback = if live_playback {
            match PlaybackSink::spawn(format) {
                Ok(sink) => Some(sink),
                Err(error) => {
                    tracing::warn!(%error, "live playback unavailable, writing file only");
                    None
                }
            }
        } else {
            None
        };
        Ok(Self {
            wav: Some(wav),
            playback,
            path: path.to_path_buf(),
            format,
            frames_written: 0,
            pending: Vec::new(),
        })
    }

    /// Append one chunk of interleaved PCM16LE bytes to both sinks.
    ///
    /// Chunks need not be frame-aligned: whole frames go out, a split frame
    /// is held back until the next chunk completes it, so the header count
    /// always matches the data section.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let Some(wav) = self.wav.as_mut() else {
            return Err(Error::Audio("writer is closed".to_string()));
        };
        let frame_size = self.format.bytes_per_frame();
        let mut buffered = std::mem::take(&mut self.pending);
        buffered.extend_from_slice(bytes);
        let aligned = buffered.len() - buffered.len() % frame_size;
        let (whole, tail) = buffered.split_at(aligned);

        for pair in whole.chunks_exact(2) {
            wav.write_sample(i16::from_le_bytes([pair[0], pair[1]]))?;
        }
        self.frames_written += (aligned / frame_size) as u64;

        if let Some(playback) = self.playback.as_mut()
            && !whole.is_empty()
        {
            playback.push(pcm16_to_f32(whole));
        }
        self.pending = tail.to_vec();
        Ok(())
    }

    /// Finalize the WAV header and release the device. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        // Device first: stop what is audible before touching the file.
        drop(self.playback.take());
        if !self.pending.is_empty() {
            tracing::warn!(
                bytes = self.pending.len(),
                "discarding a trailing partial frame"
            );
            self.pending.clear();
        }
        if let Some(wav) = self.wav.take() {
            wav.finalize()?;
            tracing::debug!(
                path = %self.path.display(),
                frames = self.frames_written,
                "artifact finalized"
            );
        }
        Ok(())
    }

    /// Frames written so far. Frozen once closed.
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn has_live_output(&self) -> bool {
        self.playback.is_some()
    }
}

/// Interleaved PCM16LE bytes to f32 samples in [-1, 1].
fn pcm16_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect()
}
