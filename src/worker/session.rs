use std::collections::VecDeque;
use std::time::Instant;

use serde::Serialize;

use crate::config::Settings;
use crate::filter::HallucinationFilter;
use crate::worker::recognizer::{RecognitionOutput, RecognizedSegment};

const MAX_FINALS: usize = 10;
const SAMPLE_RATE: u32 = 16_000;

/// One `{start,end,text,completed,language?}` entry as sent to the client
/// socket and mirrored into the `transcription` stream message (spec §4.3).
#[derive(Debug, Clone, Serialize)]
pub struct WireSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    pub completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// Per-connection audio buffer, finalized/partial segment window, and
/// stall-liveness bookkeeping (spec §4.3's buffer management section).
pub struct SessionBuffer {
    pub samples: Vec<f32>,
    pub offset_s: f64,
    pub accumulated_since_last_segment_s: f64,
    pub finals: VecDeque<RecognizedSegment>,
    pub partial: Option<RecognizedSegment>,
    pub last_output_at: Instant,
    pub last_speaker_activity_at: Option<Instant>,
    pub language: Option<String>,
}

impl SessionBuffer {
    pub fn new(language: Option<String>) -> Self {
        Self {
            samples: Vec::new(),
            offset_s: 0.0,
            accumulated_since_last_segment_s: 0.0,
            finals: VecDeque::with_capacity(MAX_FINALS),
            partial: None,
            last_output_at: Instant::now(),
            last_speaker_activity_at: None,
            language,
        }
    }

    pub fn push_audio(&mut self, bytes: &[u8]) {
        for chunk in bytes.chunks_exact(4) {
            let sample = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            self.samples.push(sample);
        }
    }

    fn duration_s(&self) -> f64 {
        self.samples.len() as f64 / SAMPLE_RATE as f64
    }

    /// Apply the max-buffer-discard and clip-if-no-segment rules, advancing
    /// `offset_s` to keep absolute segment times correct.
    pub fn trim(&mut self, settings: &Settings) {
        if self.duration_s() > settings.max_buffer_s {
            let discard_samples = (settings.discard_buffer_s * SAMPLE_RATE as f64) as usize;
            let discard_samples = discard_samples.min(self.samples.len());
            self.samples.drain(0..discard_samples);
            self.offset_s += discard_samples as f64 / SAMPLE_RATE as f64;
        }

        if self.accumulated_since_last_segment_s >= settings.clip_if_no_segment_s {
            let retain_samples = (settings.clip_retain_s * SAMPLE_RATE as f64) as usize;
            if self.samples.len() > retain_samples {
                let drop = self.samples.len() - retain_samples;
                self.samples.drain(0..drop);
                self.offset_s += drop as f64 / SAMPLE_RATE as f64;
            }
            self.accumulated_since_last_segment_s = 0.0;
        }
    }

    pub fn ready_for_pass(&self, settings: &Settings) -> bool {
        self.duration_s() >= settings.min_audio_s
    }

    /// Fold one recognition pass's output into the final/partial window,
    /// dropping exact hallucination matches (spec §4.3's filter step). The
    /// liveness timestamp updates unconditionally first so a run of pure
    /// hallucinations still counts as activity for the circuit breaker and
    /// self-monitoring checks.
    pub fn apply_recognition(
        &mut self,
        output: RecognitionOutput,
        filter: &HallucinationFilter,
        pass_duration_s: f64,
    ) -> Vec<WireSegment> {
        self.last_output_at = Instant::now();
        if let Some(lang) = output.language {
            self.language = Some(lang);
        }

        let count = output.segments.len();
        let mut produced = false;
        for (i, seg) in output.segments.into_iter().enumerate() {
            if filter.is_hallucination(&seg.text) {
                continue;
            }
            produced = true;
            let is_last = i + 1 == count;
            if is_last && !seg.completed {
                self.partial = Some(seg);
            } else {
                self.finals.push_back(seg);
                while self.finals.len() > MAX_FINALS {
                    self.finals.pop_front();
                }
                if is_last {
                    self.partial = None;
                }
            }
        }

        if produced {
            self.accumulated_since_last_segment_s = 0.0;
        } else {
            self.accumulated_since_last_segment_s += pass_duration_s;
        }

        self.window()
    }

    pub fn window(&self) -> Vec<WireSegment> {
        let mut out: Vec<WireSegment> = self
            .finals
            .iter()
            .map(|s| WireSegment {
                start: s.start,
                end: s.end,
                text: s.text.clone(),
                completed: true,
                language: self.language.clone(),
            })
            .collect();
        if let Some(p) = &self.partial {
            out.push(WireSegment {
                start: p.start,
                end: p.end,
                text: p.text.clone(),
                completed: false,
                language: self.language.clone(),
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        std::env::set_var("MEETING_TOKEN_SECRET", "test-secret");
        Settings::load().unwrap()
    }

    #[test]
    fn push_audio_decodes_le_f32_samples() {
        let mut buf = SessionBuffer::new(None);
        let bytes = 1.0f32.to_le_bytes();
        buf.push_audio(&bytes);
        assert_eq!(buf.samples, vec![1.0f32]);
    }

    #[test]
    fn max_buffer_discard_advances_offset() {
        let mut s = settings();
        s.max_buffer_s = 1.0;
        s.discard_buffer_s = 0.5;
        let mut buf = SessionBuffer::new(None);
        buf.samples = vec![0.0f32; SAMPLE_RATE as usize * 2];
        buf.trim(&s);
        assert!((buf.offset_s - 0.5).abs() < 1e-6);
        assert_eq!(buf.samples.len(), SAMPLE_RATE as usize * 2 - (SAMPLE_RATE as usize / 2));
    }

    #[test]
    fn hallucination_segments_are_dropped_from_window() {
        let empty_filter = HallucinationFilter::empty();
        let output = RecognitionOutput {
            segments: vec![RecognizedSegment {
                start: 0.0,
                end: 1.0,
                text: "thanks for watching".to_string(),
                completed: true,
            }],
            language: None,
        };

        let mut buf = SessionBuffer::new(None);
        let window = buf.apply_recognition(output.clone(), &empty_filter, 1.0);
        assert_eq!(window.len(), 1);

        let filter_with_phrase = HallucinationFilter::from_phrases(["thanks for watching".to_string()]);
        let mut buf2 = SessionBuffer::new(None);
        let window2 = buf2.apply_recognition(output, &filter_with_phrase, 1.0);
        assert!(window2.is_empty());
    }
}
