//! Composer4U — streaming music generation core for a Blender add-on.
//!
//! Streams AI-composed audio from Google's Lyria realtime service over a
//! WebSocket session into a WAV file, with best-effort live playback while
//! the take is still arriving. A polling controller gives the host a
//! start/stop surface, an append-only history log, and a pointer to the
//! most recent artifact for timeline insertion.
//!
//! ## Architecture
//!
//! ```text
//! host tick → Controller ──submit──→ BackgroundEngine (worker thread)
//!                 │                          ↓
//!                 │ poll handle          task::run
//!                 ↓                          ↓
//!         history / pointer    MusicSession ─chunks→ AudioWriter
//!                                                      ├→ WAV file
//!                                                      └→ live device
//! ```
//!
//! ## Modules
//!
//! - [`client`] — WebSocket session against the generation service
//! - [`sink`] — dual-sink writer: WAV file plus best-effort device playback
//! - [`task`] — one generation end to end, with cooperative cancellation
//! - [`engine`] — persistent worker thread hosting the async runtime
//! - [`controller`] — polling state machine the host drives
//! - [`artifact`] — output paths, prompt slugs, WAV probing
//! - [`config`] — service settings and the fixed audio format

pub mod artifact;
pub mod client;
pub mod config;
pub mod controller;
pub mod engine;
pub mod sink;
pub mod task;

mod error;

pub use error::{Error, Result};
