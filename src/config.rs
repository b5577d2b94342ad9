//! Settings and the fixed artifact audio format.
//!
//! The host's preferences surface supplies an API credential; everything
//! else has defaults matching the Lyria realtime service output.

use serde::{Deserialize, Serialize};

/// Model identifier for the realtime music service. Fixed for all sessions.
pub const MODEL_ID: &str = "models/lyria-realtime-exp";

/// PCM layout of every artifact this system produces.
///
/// The service streams interleaved 16-bit little-endian stereo at 48 kHz;
/// the WAV header and the playback device both use these numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub channels: u16,
    pub bits_per_sample: u16,
    pub sample_rate: u32,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            channels: 2,
            bits_per_sample: 16,
            sample_rate: 48_000,
        }
    }
}

impl AudioFormat {
    pub fn wav_spec(&self) -> hound::WavSpec {
        hound::WavSpec {
            channels: self.channels,
            sample_rate: self.sample_rate,
            bits_per_sample: self.bits_per_sample,
            sample_format: hound::SampleFormat::Int,
        }
    }

    /// Bytes per interleaved frame (all channels).
    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * (self.bits_per_sample as usize / 8)
    }
}

/// Settings consumed from the preferences collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// API credential. Submissions are rejected while this is empty.
    pub api_key: String,

    /// Model identifier sent in the session setup frame.
    pub model: String,

    /// Mirror generated audio to the default output device while writing.
    /// The device is best-effort either way; this switch skips the attempt
    /// entirely (daemons, tests, machines without audio).
    pub live_playback: bool,

    /// Artifact PCM layout.
    pub format: AudioFormat,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: MODEL_ID.to_string(),
            live_playback: true,
            format: AudioFormat::default(),
        }
    }
}
