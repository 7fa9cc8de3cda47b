//! Acoustic echo cancellation for the caller leg.
//!
//! Removes assistant playback bleeding back into the caller microphone.
//! Classic speex-style arrangement: the audio we emit toward the media
//! server is queued as the far-end reference; each captured frame is
//! processed against the matching reference frame through an NLMS
//! adaptive filter. Frames are 20 ms of PCM16 and the filter covers
//! roughly 128 ms of echo tail.

use std::collections::VecDeque;

use super::resampler::BYTES_PER_SAMPLE;

/// Reference frames kept while waiting for the echo to arrive (~200 ms).
const MAX_REFERENCE_FRAMES: usize = 10;

/// NLMS adaptation step.
const NLMS_MU: f64 = 0.3;

/// Regularisation against near-zero reference energy.
const NLMS_EPS: f64 = 1e3;

pub struct EchoCanceller {
    enabled: bool,
    sample_rate: u32,
    /// Samples per frame (20 ms).
    frame_size: usize,
    /// Adaptive filter length in samples (~128 ms).
    filter_len: usize,
    weights: Vec<f64>,
    /// Far-end sample delay line, most recent last.
    far_history: Vec<f64>,
    reference: VecDeque<Vec<i16>>,
    frames_processed: u64,
    frames_with_reference: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EchoCancellerStats {
    pub enabled: bool,
    pub frames_processed: u64,
    pub frames_with_reference: u64,
    pub reference_depth: usize,
    pub frame_size_samples: usize,
    pub filter_length_samples: usize,
}

impl EchoCanceller {
    pub fn new(sample_rate: u32, frame_size_ms: u32, filter_length_ms: u32, enabled: bool) -> Self {
        let frame_size = (sample_rate as usize * frame_size_ms as usize) / 1000;
        let filter_len = (sample_rate as usize * filter_length_ms as usize) / 1000;
        if enabled {
            tracing::info!(
                frame_size,
                filter_len,
                sample_rate,
                "echo canceller initialised"
            );
        }
        Self {
            enabled,
            sample_rate,
            frame_size,
            filter_len,
            weights: vec![0.0; filter_len],
            far_history: vec![0.0; filter_len],
            reference: VecDeque::with_capacity(MAX_REFERENCE_FRAMES),
            frames_processed: 0,
            frames_with_reference: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_size * BYTES_PER_SAMPLE
    }

    /// Queue assistant playback as the far-end reference. Chunks are split
    /// on frame boundaries; a trailing partial frame is zero-padded.
    pub fn add_reference(&mut self, audio: &[u8]) {
        if !self.enabled || audio.is_empty() {
            return;
        }
        let frame_bytes = self.frame_bytes();
        let mut offset = 0;
        while offset + frame_bytes <= audio.len() {
            self.push_reference_frame(&audio[offset..offset + frame_bytes]);
            offset += frame_bytes;
        }
        if offset < audio.len() {
            let mut padded = audio[offset..].to_vec();
            padded.resize(frame_bytes, 0);
            self.push_reference_frame(&padded);
        }
    }

    fn push_reference_frame(&mut self, frame: &[u8]) {
        if self.reference.len() == MAX_REFERENCE_FRAMES {
            self.reference.pop_front();
        }
        self.reference.push_back(
            frame
                .chunks_exact(BYTES_PER_SAMPLE)
                .map(|b| i16::from_le_bytes([b[0], b[1]]))
                .collect(),
        );
    }

    /// Process captured audio, removing echo where a reference frame is
    /// available. Whole frames only; residual bytes pass through untouched.
    pub fn process(&mut self, mic: &[u8]) -> Vec<u8> {
        if !self.enabled || mic.is_empty() {
            return mic.to_vec();
        }

        let frame_bytes = self.frame_bytes();
        let mut out = Vec::with_capacity(mic.len());
        let mut offset = 0;

        while offset + frame_bytes <= mic.len() {
            let mic_frame: Vec<i16> = mic[offset..offset + frame_bytes]
                .chunks_exact(BYTES_PER_SAMPLE)
                .map(|b| i16::from_le_bytes([b[0], b[1]]))
                .collect();

            let far_frame = match self.reference.pop_front() {
                Some(f) => {
                    self.frames_with_reference += 1;
                    f
                }
                // No reference: silence, the filter just idles.
                None => vec![0i16; self.frame_size],
            };

            let clean = self.cancel_frame(&mic_frame, &far_frame);
            for s in clean {
                out.extend_from_slice(&s.to_le_bytes());
            }

            self.frames_processed += 1;
            offset += frame_bytes;

            // Every ~5 seconds of audio.
            if self.frames_processed % 250 == 0 {
                tracing::debug!(
                    frames = self.frames_processed,
                    with_reference = self.frames_with_reference,
                    reference_depth = self.reference.len(),
                    "aec progress"
                );
            }
        }

        if offset < mic.len() {
            out.extend_from_slice(&mic[offset..]);
        }
        out
    }

    /// One NLMS step per sample: predict the echo from the far-end delay
    /// line, subtract, and adapt toward the residual.
    fn cancel_frame(&mut self, mic: &[i16], far: &[i16]) -> Vec<i16> {
        let mut out = Vec::with_capacity(mic.len());
        for i in 0..mic.len() {
            self.far_history.rotate_right(1);
            self.far_history[0] = far[i] as f64;

            let mut estimate = 0.0;
            let mut energy = NLMS_EPS;
            for (w, x) in self.weights.iter().zip(self.far_history.iter()) {
                estimate += w * x;
                energy += x * x;
            }

            let err = mic[i] as f64 - estimate;
            let step = NLMS_MU * err / energy;
            for (w, x) in self.weights.iter_mut().zip(self.far_history.iter()) {
                *w += step * x;
            }

            out.push(err.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16);
        }
        out
    }

    /// Drop adaptation state and queued reference frames.
    pub fn reset(&mut self) {
        self.reference.clear();
        self.weights.iter_mut().for_each(|w| *w = 0.0);
        self.far_history.iter_mut().for_each(|x| *x = 0.0);
    }

    pub fn stats(&self) -> EchoCancellerStats {
        EchoCancellerStats {
            enabled: self.enabled,
            frames_processed: self.frames_processed,
            frames_with_reference: self.frames_with_reference,
            reference_depth: self.reference.len(),
            frame_size_samples: self.frame_size,
            filter_length_samples: self.filter_len,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn disabled_passes_through() {
        let mut aec = EchoCanceller::new(16_000, 20, 128, false);
        let input = pcm(&[1, 2, 3, 4]);
        assert_eq!(aec.process(&input), input);
    }

    #[test]
    fn frame_sizing_matches_rates() {
        let aec = EchoCanceller::new(16_000, 20, 128, true);
        assert_eq!(aec.stats().frame_size_samples, 320);
        assert_eq!(aec.stats().filter_length_samples, 2048);
        assert_eq!(aec.frame_bytes(), 640);
    }

    #[test]
    fn residual_bytes_pass_through_untouched() {
        let mut aec = EchoCanceller::new(16_000, 20, 128, true);
        // One full frame plus 6 residual bytes.
        let mut input = pcm(&vec![0i16; 320]);
        input.extend_from_slice(&[9, 9, 9, 9, 9, 9]);
        let out = aec.process(&input);
        assert_eq!(out.len(), input.len());
        assert_eq!(&out[640..], &[9, 9, 9, 9, 9, 9]);
    }

    #[test]
    fn silence_with_no_reference_stays_silent() {
        let mut aec = EchoCanceller::new(16_000, 20, 128, true);
        let out = aec.process(&pcm(&vec![0i16; 320]));
        assert!(out.iter().all(|&b| b == 0));
        assert_eq!(aec.stats().frames_with_reference, 0);
        assert_eq!(aec.stats().frames_processed, 1);
    }

    #[test]
    fn reference_ring_is_bounded() {
        let mut aec = EchoCanceller::new(16_000, 20, 128, true);
        for _ in 0..MAX_REFERENCE_FRAMES + 5 {
            aec.add_reference(&pcm(&vec![100i16; 320]));
        }
        assert_eq!(aec.stats().reference_depth, MAX_REFERENCE_FRAMES);
    }

    #[test]
    fn partial_reference_frame_is_padded() {
        let mut aec = EchoCanceller::new(16_000, 20, 128, true);
        aec.add_reference(&pcm(&vec![50i16; 100]));
        assert_eq!(aec.stats().reference_depth, 1);
    }

    #[test]
    fn converges_on_pure_echo() {
        let mut aec = EchoCanceller::new(16_000, 20, 128, true);
        // Mic hears exactly the far-end signal (unit echo path, zero delay).
        let mut last_energy = f64::MAX;
        for turn in 0..40 {
            let frame: Vec<i16> = (0..320)
                .map(|i| ((i as f64 * 0.21 + turn as f64).sin() * 6000.0) as i16)
                .collect();
            aec.add_reference(&pcm(&frame));
            let out = aec.process(&pcm(&frame));
            let energy: f64 = out
                .chunks_exact(2)
                .map(|b| {
                    let s = i16::from_le_bytes([b[0], b[1]]) as f64;
                    s * s
                })
                .sum();
            last_energy = energy / 320.0;
        }
        let input_energy = 6000.0f64 * 6000.0 / 2.0;
        assert!(
            last_energy < input_energy / 10.0,
            "echo not attenuated: residual {last_energy} vs input {input_energy}"
        );
    }

    #[test]
    fn reset_clears_state() {
        let mut aec = EchoCanceller::new(16_000, 20, 128, true);
        aec.add_reference(&pcm(&vec![100i16; 320]));
        aec.reset();
        assert_eq!(aec.stats().reference_depth, 0);
    }
}
