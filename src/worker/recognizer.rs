use async_trait::async_trait;

use crate::error::Error;

/// One segment produced by a recognition pass, relative to the session's
/// audio offset in seconds.
#[derive(Debug, Clone)]
pub struct RecognizedSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    pub completed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RecognitionOutput {
    pub segments: Vec<RecognizedSegment>,
    pub language: Option<String>,
}

/// Abstracts the underlying ASR engine so the worker's buffer/capacity/
/// filter logic is testable without a real streaming model (spec §4.3;
/// this repo does not vendor ASR weights, see SPEC_FULL.md §3).
#[async_trait]
pub trait Recognizer: Send + Sync {
    async fn transcribe(
        &self,
        samples: &[f32],
        sample_rate: u32,
        offset_s: f64,
        language: Option<&str>,
    ) -> Result<RecognitionOutput, Error>;
}

/// Deterministic test double: treats the whole window as one final segment
/// whose text is derived from the sample count, so tests can assert on
/// buffer/window accounting without a real model.
pub struct FakeRecognizer;

#[async_trait]
impl Recognizer for FakeRecognizer {
    async fn transcribe(
        &self,
        samples: &[f32],
        sample_rate: u32,
        offset_s: f64,
        language: Option<&str>,
    ) -> Result<RecognitionOutput, Error> {
        if samples.is_empty() {
            return Ok(RecognitionOutput::default());
        }
        let duration_s = samples.len() as f64 / sample_rate as f64;
        Ok(RecognitionOutput {
            segments: vec![RecognizedSegment {
                start: offset_s,
                end: offset_s + duration_s,
                text: format!("[{} samples]", samples.len()),
                completed: true,
            }],
            language: language.map(|s| s.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_recognizer_emits_one_final_segment() {
        let recognizer = FakeRecognizer;
        let samples = vec![0.0f32; 16_000];
        let out = recognizer.transcribe(&samples, 16_000, 0.0, None).await.unwrap();
        assert_eq!(out.segments.len(), 1);
        assert!(out.segments[0].completed);
        assert!((out.segments[0].end - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn empty_window_yields_no_segments() {
        let recognizer = FakeRecognizer;
        let out = recognizer.transcribe(&[], 16_000, 0.0, None).await.unwrap();
        assert!(out.segments.is_empty());
    }
}
