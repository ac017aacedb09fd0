//! Audio helpers: voice activity detection and PCM/WAV framing.
//!
//! Audio is opaque to the pipeline; these helpers are used only at the edges
//! (transport input segmentation and provider adapters that need a container).

pub mod pcm;
pub mod vad;
