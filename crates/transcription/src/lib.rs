//! Transcription capability via whisper.cpp
//!
//! Extracts the audio track to 16kHz mono PCM with ffmpeg, runs Whisper over
//! it, and returns the transcript with per-segment timing plus a coarse
//! audio-analysis block. A video without a usable audio track yields a
//! transcript with its `error` field set, not a failure: transcription never
//! takes the job down.

use entity_index_common::{AudioAnalysis, Transcript, TranscriptSegment};
use entity_index_core::{CapabilityError, CapabilityResult, Transcriber};
use std::path::Path;
use std::process::Command;
use tracing::{debug, info, warn};
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

/// Speech coverage below this fraction on a non-silent track reads as music
/// or ambient audio rather than narration
const MUSIC_SPEECH_RATIO: f64 = 0.2;

/// Whisper-backed transcriber
pub struct WhisperTranscriber {
    context: WhisperContext,
}

impl WhisperTranscriber {
    /// Load the ggml model; a missing weights file is `Unavailable`
    pub fn new(model_path: &Path) -> CapabilityResult<Self> {
        if !model_path.exists() {
            return Err(CapabilityError::Unavailable(format!(
                "whisper model not found at {}",
                model_path.display()
            )));
        }
        let path_str = model_path
            .to_str()
            .ok_or_else(|| CapabilityError::Unavailable("non-UTF8 model path".to_string()))?;
        info!("Loading whisper model from {path_str}");
        let context = WhisperContext::new_with_params(path_str, WhisperContextParameters::default())
            .map_err(|e| CapabilityError::Unavailable(format!("failed to load model: {e}")))?;
        Ok(Self { context })
    }

    fn run_whisper(&self, samples: &[f32]) -> CapabilityResult<(String, Vec<TranscriptSegment>)> {
        let mut state = self
            .context
            .create_state()
            .map_err(|e| CapabilityError::Runtime(format!("failed to create state: {e}")))?;

        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        params.set_translate(true);
        params.set_language(Some("auto"));
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_special(false);

        state
            .full(params, samples)
            .map_err(|e| CapabilityError::Runtime(format!("transcription failed: {e}")))?;

        let n_segments = state
            .full_n_segments()
            .map_err(|e| CapabilityError::Runtime(e.to_string()))?;

        let mut segments = Vec::with_capacity(n_segments as usize);
        for i in 0..n_segments {
            let text = state
                .full_get_segment_text(i)
                .map_err(|e| CapabilityError::Runtime(e.to_string()))?;
            let t0 = state
                .full_get_segment_t0(i)
                .map_err(|e| CapabilityError::Runtime(e.to_string()))?;
            let t1 = state
                .full_get_segment_t1(i)
                .map_err(|e| CapabilityError::Runtime(e.to_string()))?;
            let text = text.trim().to_string();
            if text.is_empty() {
                continue;
            }
            segments.push(TranscriptSegment {
                segment_id: segments.len(),
                // Whisper reports centiseconds
                start: t0 as f64 / 100.0,
                end: t1 as f64 / 100.0,
                text,
            });
        }

        let language = state
            .full_lang_id()
            .ok()
            .and_then(whisper_rs::get_lang_str)
            .unwrap_or("unknown")
            .to_string();
        Ok((language, segments))
    }
}

impl Transcriber for WhisperTranscriber {
    fn transcribe(&mut self, video_path: &Path, duration_sec: f64) -> CapabilityResult<Transcript> {
        let samples = match extract_audio_samples(video_path) {
            Ok(samples) if !samples.is_empty() => samples,
            Ok(_) => {
                return Ok(no_speech_transcript(
                    "Audio track is empty.",
                    duration_sec,
                ))
            }
            Err(reason) => {
                warn!("Audio extraction failed for {}: {reason}", video_path.display());
                return Ok(no_speech_transcript(&reason, duration_sec));
            }
        };

        let (language, segments) = self.run_whisper(&samples)?;
        let text = segments
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let audio_analysis = Some(analyze_segments(&segments, duration_sec, true));

        if segments.is_empty() {
            return Ok(Transcript {
                language: "unknown".to_string(),
                text: String::new(),
                segments,
                audio_analysis,
                error: Some("No speech detected in the audio track.".to_string()),
            });
        }

        debug!("Transcribed {} segments ({language})", segments.len());
        Ok(Transcript {
            language,
            text,
            segments,
            audio_analysis,
            error: None,
        })
    }
}

/// Build the transcript shape for a companion voice/transcript file supplied
/// at submission time: the text is taken verbatim and no model runs.
#[must_use]
pub fn transcript_from_voice_file(text: &str, duration_sec: f64) -> Transcript {
    Transcript {
        language: "unknown".to_string(),
        text: text.trim().to_string(),
        segments: Vec::new(),
        audio_analysis: Some(analyze_segments(&[], duration_sec, false)),
        error: None,
    }
}

fn no_speech_transcript(reason: &str, duration_sec: f64) -> Transcript {
    Transcript {
        language: "unknown".to_string(),
        text: String::new(),
        segments: Vec::new(),
        audio_analysis: Some(analyze_segments(&[], duration_sec, false)),
        error: Some(reason.to_string()),
    }
}

/// Coarse audio characteristics from segment coverage
#[must_use]
pub fn analyze_segments(
    segments: &[TranscriptSegment],
    duration_sec: f64,
    audio_present: bool,
) -> AudioAnalysis {
    let speech_seconds: f64 = segments.iter().map(|s| (s.end - s.start).max(0.0)).sum();
    let speech_ratio = if duration_sec > 0.0 {
        (speech_seconds / duration_sec).clamp(0.0, 1.0)
    } else {
        0.0
    };
    AudioAnalysis {
        speech_ratio,
        speech_seconds,
        music_detected: audio_present && speech_ratio < MUSIC_SPEECH_RATIO,
        // whisper.cpp runs without an external VAD stage
        vad_available: false,
    }
}

/// Decode the audio track to 16kHz mono f32 samples via ffmpeg + hound
fn extract_audio_samples(video_path: &Path) -> Result<Vec<f32>, String> {
    let temp = tempfile::Builder::new()
        .prefix("entity_index_audio_")
        .suffix(".wav")
        .tempfile()
        .map_err(|e| format!("failed to create temp wav: {e}"))?;

    let video_str = video_path
        .to_str()
        .ok_or_else(|| "non-UTF8 video path".to_string())?;
    let wav_str = temp
        .path()
        .to_str()
        .ok_or_else(|| "non-UTF8 temp path".to_string())?;

    let output = Command::new("ffmpeg")
        .args([
            "-hide_banner",
            "-loglevel",
            "error",
            "-y",
            "-i",
            video_str,
            "-vn",
            "-ac",
            "1",
            "-ar",
            "16000",
            "-f",
            "wav",
            wav_str,
        ])
        .output()
        .map_err(|e| format!("failed to execute ffmpeg: {e}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("no extractable audio track: {}", stderr.trim()));
    }

    let mut reader =
        hound::WavReader::open(temp.path()).map_err(|e| format!("failed to open wav: {e}"))?;
    let spec = reader.spec();

    let samples: Result<Vec<f32>, _> = match spec.sample_format {
        hound::SampleFormat::Int => {
            let max_value = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_value))
                .collect()
        }
        hound::SampleFormat::Float => reader.samples::<f32>().collect(),
    };
    samples.map_err(|e| format!("failed to read samples: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(start: f64, end: f64) -> TranscriptSegment {
        TranscriptSegment {
            segment_id: 0,
            start,
            end,
            text: "contact bearing north".to_string(),
        }
    }

    #[test]
    fn test_speech_ratio() {
        let analysis = analyze_segments(&[segment(0.0, 10.0), segment(20.0, 30.0)], 40.0, true);
        assert!((analysis.speech_seconds - 20.0).abs() < 1e-9);
        assert!((analysis.speech_ratio - 0.5).abs() < 1e-9);
        assert!(!analysis.music_detected);
    }

    #[test]
    fn test_music_heuristic() {
        // Audio present but nearly no speech: reads as music/ambient
        let analysis = analyze_segments(&[segment(0.0, 2.0)], 60.0, true);
        assert!(analysis.music_detected);

        // No audio track at all is not "music"
        let analysis = analyze_segments(&[], 60.0, false);
        assert!(!analysis.music_detected);
    }

    #[test]
    fn test_zero_duration_is_safe() {
        let analysis = analyze_segments(&[segment(0.0, 5.0)], 0.0, true);
        assert_eq!(analysis.speech_ratio, 0.0);
    }

    #[test]
    fn test_voice_file_transcript() {
        let transcript = transcript_from_voice_file("  Convoy sighted at dawn.  ", 30.0);
        assert_eq!(transcript.text, "Convoy sighted at dawn.");
        assert!(transcript.segments.is_empty());
        assert!(transcript.error.is_none());
        assert!(!transcript.audio_analysis.unwrap().vad_available);
    }

    #[test]
    fn test_missing_model_is_unavailable() {
        let err = WhisperTranscriber::new(Path::new("/nonexistent/ggml-base.bin"))
            .err()
            .unwrap();
        assert!(matches!(err, CapabilityError::Unavailable(_)));
    }
}
