//! Energy-based Voice Activity Detection (VAD).

use tracing::trace;

use crate::pcm::samples_from_le_bytes;

/// Frame length the detector works on.
pub const FRAME_MS: u64 = 20;

/// Speech boundary reported by [`VadSegmenter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    SpeechStarted,
    SpeechEnded,
}

/// Voice Activity Detector using RMS energy threshold on 16-bit PCM.
pub struct VoiceActivityDetector {
    /// RMS threshold for speech detection.
    threshold: f64,
    /// Minimum consecutive silent frames before declaring speech end.
    min_silent_frames: usize,
    speech_active: bool,
    silent_count: usize,
}

impl VoiceActivityDetector {
    /// Create a new VAD with given RMS threshold and minimum silent frame count.
    pub fn new(threshold: f64, min_silent_frames: usize) -> Self {
        Self {
            threshold,
            min_silent_frames: min_silent_frames.max(1),
            speech_active: false,
            silent_count: 0,
        }
    }

    /// Detector whose end-of-speech window is `stop_ms` of trailing silence.
    pub fn with_stop_ms(threshold: f64, stop_ms: u64) -> Self {
        let frames = stop_ms.div_ceil(FRAME_MS) as usize;
        Self::new(threshold, frames)
    }

    /// Compute RMS energy of a PCM frame.
    pub fn rms(samples: &[i16]) -> f64 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
        (sum / samples.len() as f64).sqrt()
    }

    /// Process a single audio frame, returning a boundary if one was crossed.
    pub fn process_frame(&mut self, pcm: &[i16]) -> Option<VadEvent> {
        let is_speech = Self::rms(pcm) > self.threshold;

        if is_speech {
            self.silent_count = 0;
            if !self.speech_active {
                self.speech_active = true;
                return Some(VadEvent::SpeechStarted);
            }
        } else if self.speech_active {
            self.silent_count += 1;
            if self.silent_count >= self.min_silent_frames {
                self.speech_active = false;
                self.silent_count = 0;
                return Some(VadEvent::SpeechEnded);
            }
        }

        None
    }

    pub fn is_active(&self) -> bool {
        self.speech_active
    }

    pub fn reset(&mut self) {
        self.speech_active = false;
        self.silent_count = 0;
    }
}

/// Cuts an arbitrary-sized PCM byte stream into detector frames.
pub struct VadSegmenter {
    vad: VoiceActivityDetector,
    buffer: Vec<i16>,
    frame_size: usize,
}

impl VadSegmenter {
    pub fn new(vad: VoiceActivityDetector, sample_rate: u32) -> Self {
        let frame_size = ((sample_rate as u64 * FRAME_MS) / 1000).max(1) as usize;
        Self {
            vad,
            buffer: Vec::with_capacity(frame_size),
            frame_size,
        }
    }

    /// Feed little-endian 16-bit PCM and collect every boundary crossed.
    pub fn push(&mut self, pcm: &[u8]) -> Vec<VadEvent> {
        self.buffer.extend(samples_from_le_bytes(pcm));

        let mut events = Vec::new();
        while self.buffer.len() >= self.frame_size {
            let frame: Vec<i16> = self.buffer.drain(..self.frame_size).collect();
            if let Some(event) = self.vad.process_frame(&frame) {
                trace!(?event, "VAD boundary");
                events.push(event);
            }
        }
        events
    }

    pub fn is_speaking(&self) -> bool {
        self.vad.is_active()
    }

    pub fn reset(&mut self) {
        self.vad.reset();
        self.buffer.clear();
    }
}
