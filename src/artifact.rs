//! Artifact naming and validation.
//!
//! Artifacts are WAV files named `composition_{timestamp}_{slug}.wav` where
//! the slug is a sanitized cut of the prompt. Without an output directory a
//! kept temporary file supplies the path. The probe exists for timeline
//! collaborators that want to check a file actually carries audio before
//! importing it; the generation core itself never gates on it.

use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Prompt characters that survive into the filename.
const SLUG_MAX_CHARS: usize = 30;

/// Filesystem-safe slug from a prompt: first [`SLUG_MAX_CHARS`] characters,
/// non-alphanumerics become `_`, outer underscores trimmed, `music` when
/// nothing survives.
pub fn prompt_slug(prompt: &str) -> String {
    let slug: String = prompt
        .chars()
        .take(SLUG_MAX_CHARS)
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    let slug = slug.trim_matches('_');
    if slug.is_empty() {
        "music".to_string()
    } else {
        slug.to_string()
    }
}

/// Resolve where a generation writes its artifact.
///
/// With a directory: a timestamped, prompt-derived filename inside it.
/// Without: a fresh temporary `.wav` path that survives this process.
pub fn resolve_output_path(output_dir: Option<&Path>, prompt: &str) -> Result<PathBuf> {
    match output_dir {
        Some(dir) => {
            let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
            let slug = prompt_slug(prompt);
            Ok(dir.join(format!("composition_{stamp}_{slug}.wav")))
        }
        None => {
            let file = tempfile::Builder::new()
                .prefix("composer4u_")
                .suffix(".wav")
                .tempfile()?;
            let (_, path) = file.keep().map_err(|e| Error::Io(e.error))?;
            Ok(path)
        }
    }
}

/// Header facts read back from a WAV file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavProbe {
    pub channels: u16,
    pub bits_per_sample: u16,
    pub sample_rate: u32,
    /// Frames per channel actually present in the data section.
    pub frames: u32,
}

/// Open a WAV container and report its header and frame count.
pub fn probe_wav(path: &Path) -> Result<WavProbe> {
    let reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    Ok(WavProbe {
        channels: spec.channels,
        bits_per_sample: spec.bits_per_sample,
        sample_rate: spec.sample_rate,
        frames: reader.duration(),
    })
}

/// True when `path` is a readable WAV with at least one frame.
pub fn has_audio(path: &Path) -> bool {
    probe_wav(path).map(|probe| probe.frames > 0).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AudioFormat;

    #[test]
    fn test_prompt_slug() {
        assert_eq!(prompt_slug("Epic space battle!"), "Epic_space_battle");
        assert_eq!(prompt_slug("  lofi beats  "), "lofi_beats");
        assert_eq!(prompt_slug("!!!"), "music");
        assert_eq!(prompt_slug(""), "music");
        // Interior runs are kept as-is, only the ends are trimmed.
        assert_eq!(prompt_slug("a - b"), "a___b");
        // Truncation counts characters, not bytes.
        let long = "x".repeat(64);
        assert_eq!(prompt_slug(&long).chars().count(), SLUG_MAX_CHARS);
        assert_eq!(prompt_slug("café jazz"), "café_jazz");
    }

    #[test]
    fn test_resolve_into_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = resolve_output_path(Some(dir.path()), "night drive").unwrap();
        assert_eq!(path.parent().unwrap(), dir.path());
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("composition_"));
        assert!(name.ends_with("_night_drive.wav"));
    }

    #[test]
    fn test_resolve_without_directory_keeps_temp_file() {
        let path = resolve_output_path(None, "anything").unwrap();
        assert!(path.exists());
        assert_eq!(path.extension().unwrap(), "wav");
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_probe_and_has_audio() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probe.wav");
        let format = AudioFormat::default();

        let mut writer = hound::WavWriter::create(&path, format.wav_spec()).unwrap();
        for sample in [1i16, -1, 2, -2] {
            writer.write_sample(sample).unwrap();
        }
        writer.finalize().unwrap();

        let probe = probe_wav(&path).unwrap();
        assert_eq!(probe.channels, 2);
        assert_eq!(probe.sample_rate, 48_000);
        assert_eq!(probe.frames, 2);
        assert!(has_audio(&path));

        let empty = dir.path().join("empty.wav");
        let writer = hound::WavWriter::create(&empty, format.wav_spec()).unwrap();
        writer.finalize().unwrap();
        assert!(!has_audio(&empty));
        assert!(!has_audio(&dir.path().join("missing.wav")));
    }
}
