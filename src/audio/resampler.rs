//! PCM sample-rate conversion and playback warmup buffering.
//!
//! All audio on the media leg is interleaved 16-bit signed little-endian
//! mono PCM. Each provider declares its own input/output rates (OpenAI
//! 24k/24k, ElevenLabs 16k/16k, Gemini 16k/24k), so a session composes a
//! [`ResamplerPair`] from the media-server rate and whatever the active
//! provider wants on each leg.
//!
//! The resampler is a rational polyphase design: for rates `(in, out)` it
//! interpolates by `up = out/g` and decimates by `down = in/g` where
//! `g = gcd(in, out)`, with a windowed-sinc lowpass at the narrower Nyquist.
//! Equal rates pass chunks through untouched.

use std::f64::consts::PI;

/// Bytes per PCM16 sample.
pub const BYTES_PER_SAMPLE: usize = 2;

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a
}

/// Streaming rational resampler for PCM16 mono chunks.
///
/// Chunk boundaries are arbitrary: filter history carries across calls so
/// concatenated output equals output of the concatenated input.
pub struct Resampler {
    input_rate: u32,
    output_rate: u32,
    up: u32,
    down: u32,
    taps: Vec<f64>,
    /// Trailing input samples kept as filter history between chunks.
    history: Vec<f64>,
    /// Polyphase phase carried across chunk boundaries.
    phase: u64,
}

impl Resampler {
    /// Filter half-width in input samples (per side of the kernel center).
    const HALF_TAPS: usize = 16;

    pub fn new(input_rate: u32, output_rate: u32) -> Self {
        let g = gcd(input_rate, output_rate).max(1);
        let up = output_rate / g;
        let down = input_rate / g;

        let taps = if input_rate == output_rate {
            Vec::new()
        } else {
            Self::design_kernel(up, down)
        };

        tracing::debug!(
            input_rate,
            output_rate,
            up,
            down,
            "resampler created"
        );

        Self {
            input_rate,
            output_rate,
            up,
            down,
            taps,
            history: Vec::new(),
            phase: 0,
        }
    }

    /// Windowed-sinc lowpass evaluated on the upsampled grid.
    ///
    /// Cutoff sits at the narrower of the two Nyquist frequencies, scaled
    /// by `up` so interpolated samples keep unit gain.
    fn design_kernel(up: u32, down: u32) -> Vec<f64> {
        let up = up as f64;
        let down = down as f64;
        // Cutoff relative to the upsampled rate.
        let cutoff = 0.5 / up.max(down);
        let half = (Self::HALF_TAPS as f64 * up.max(down)) as isize;
        let len = (2 * half + 1) as usize;
        let mut taps = Vec::with_capacity(len);
        for i in -half..=half {
            let x = i as f64;
            let sinc = if x == 0.0 {
                2.0 * cutoff
            } else {
                (2.0 * PI * cutoff * x).sin() / (PI * x)
            };
            // Hann window.
            let w = 0.5 + 0.5 * (PI * x / (half as f64 + 1.0)).cos();
            taps.push(sinc * w * up);
        }
        taps
    }

    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    /// Whether this instance changes the rate at all.
    pub fn needs_resample(&self) -> bool {
        self.input_rate != self.output_rate
    }

    /// Resample one PCM16LE chunk. Equal rates return the input unchanged.
    pub fn process(&mut self, audio: &[u8]) -> Vec<u8> {
        if audio.is_empty() || !self.needs_resample() {
            return audio.to_vec();
        }

        let samples: Vec<f64> = audio
            .chunks_exact(BYTES_PER_SAMPLE)
            .map(|b| i16::from_le_bytes([b[0], b[1]]) as f64)
            .collect();
        if samples.is_empty() {
            return Vec::new();
        }

        let out = self.resample_samples(&samples);

        let mut bytes = Vec::with_capacity(out.len() * BYTES_PER_SAMPLE);
        for s in out {
            let clipped = s.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16;
            bytes.extend_from_slice(&clipped.to_le_bytes());
        }
        bytes
    }

    fn resample_samples(&mut self, input: &[f64]) -> Vec<f64> {
        let up = self.up as u64;
        let down = self.down as u64;
        let half = (self.taps.len() / 2) as i64;

        // Work on history + new input; output positions are indexed on the
        // virtual upsampled grid.
        let hist_len = self.history.len();
        let mut work = Vec::with_capacity(hist_len + input.len());
        work.extend_from_slice(&self.history);
        work.extend_from_slice(input);

        let total_up = (work.len() as u64) * up;
        let mut out = Vec::with_capacity((input.len() * self.up as usize) / self.down as usize + 1);

        // Only emit outputs whose kernel support is fully inside `work`;
        // the tail is carried over as history for the next chunk.
        let safe_end = total_up.saturating_sub(half as u64);
        let mut t = self.phase;
        while t < safe_end {
            // Positions left of zero are zero-padding at stream start.
            let mut acc = 0.0;
            let center = t as i64;
            for (k, tap) in self.taps.iter().enumerate() {
                let pos = center - half + k as i64;
                if pos >= 0 && pos % up as i64 == 0 {
                    let idx = (pos / up as i64) as usize;
                    if idx < work.len() {
                        acc += work[idx] * tap;
                    }
                }
            }
            out.push(acc);
            t += down;
        }

        // Keep enough trailing samples to cover the kernel for the next
        // chunk, and rebase the phase onto the kept window.
        let keep = ((2 * half) as u64 / up + 2) as usize;
        let keep = keep.min(work.len());
        let dropped = work.len() - keep;
        self.history = work.split_off(dropped);
        self.phase = t - (dropped as u64) * up;
        out
    }

    /// Drop stream state (history and phase), e.g. between unrelated turns.
    pub fn reset(&mut self) {
        self.history.clear();
        self.phase = 0;
    }
}

/// Accumulates output PCM until a warmup window has arrived, then passes
/// through. Smooths the start of each provider response so playback does
/// not stutter on the first packets.
pub struct WarmupBuffer {
    warmup_bytes: usize,
    sample_rate: u32,
    buffer: Vec<u8>,
    warmup_complete: bool,
    total_buffered: usize,
}

impl WarmupBuffer {
    pub fn new(warmup_ms: u32, sample_rate: u32) -> Self {
        let warmup_bytes =
            (warmup_ms as usize * sample_rate as usize * BYTES_PER_SAMPLE) / 1000;
        tracing::debug!(warmup_ms, warmup_bytes, "warmup buffer created");
        Self {
            warmup_bytes,
            sample_rate,
            buffer: Vec::new(),
            warmup_complete: false,
            total_buffered: 0,
        }
    }

    /// Add audio. During warmup the chunk is absorbed and an empty vec is
    /// returned; once the window fills, the accumulated audio is released
    /// and subsequent chunks pass straight through.
    pub fn add(&mut self, audio: &[u8]) -> Vec<u8> {
        if audio.is_empty() {
            return Vec::new();
        }
        self.total_buffered += audio.len();

        if !self.warmup_complete {
            self.buffer.extend_from_slice(audio);
            if self.buffer.len() >= self.warmup_bytes {
                self.warmup_complete = true;
                let released = std::mem::take(&mut self.buffer);
                tracing::debug!(bytes = released.len(), "warmup complete, flushing");
                return released;
            }
            return Vec::new();
        }

        audio.to_vec()
    }

    /// Release whatever is still buffered (end of a response turn).
    pub fn flush(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    /// Re-arm the warmup window. Must be called at the start of every
    /// provider response turn so each utterance warms up independently.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.warmup_complete = false;
        self.total_buffered = 0;
    }

    pub fn is_warming_up(&self) -> bool {
        !self.warmup_complete
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }

    pub fn buffered_ms(&self) -> f64 {
        let samples = self.buffer.len() as f64 / BYTES_PER_SAMPLE as f64;
        samples / self.sample_rate as f64 * 1000.0
    }
}

/// Input + output resamplers for one session, plus the output warmup buffer.
///
/// Provider input and output rates can differ (Gemini takes 16 kHz and
/// answers at 24 kHz), so the two legs are independent instances.
pub struct ResamplerPair {
    media_rate: u32,
    provider_input_rate: u32,
    provider_output_rate: u32,
    input: Resampler,
    output: Resampler,
    warmup: WarmupBuffer,
}

impl ResamplerPair {
    pub fn new(
        media_rate: u32,
        provider_input_rate: u32,
        provider_output_rate: u32,
        output_warmup_ms: u32,
    ) -> Self {
        tracing::debug!(
            media_rate,
            provider_input_rate,
            provider_output_rate,
            "resampler pair created"
        );
        Self {
            media_rate,
            provider_input_rate,
            provider_output_rate,
            input: Resampler::new(media_rate, provider_input_rate),
            output: Resampler::new(provider_output_rate, media_rate),
            warmup: WarmupBuffer::new(output_warmup_ms, media_rate),
        }
    }

    pub fn media_rate(&self) -> u32 {
        self.media_rate
    }

    pub fn provider_input_rate(&self) -> u32 {
        self.provider_input_rate
    }

    pub fn provider_output_rate(&self) -> u32 {
        self.provider_output_rate
    }

    /// Media server → provider.
    pub fn resample_input(&mut self, audio: &[u8]) -> Vec<u8> {
        self.input.process(audio)
    }

    /// Provider → media server, buffered through warmup.
    pub fn resample_output(&mut self, audio: &[u8]) -> Vec<u8> {
        let resampled = self.output.process(audio);
        self.warmup.add(&resampled)
    }

    /// Release buffered output (end of turn).
    pub fn flush_output(&mut self) -> Vec<u8> {
        self.warmup.flush()
    }

    /// Re-arm warmup for a new response turn.
    pub fn reset_output_buffer(&mut self) {
        self.warmup.reset();
    }

    pub fn is_output_warming_up(&self) -> bool {
        self.warmup.is_warming_up()
    }

    pub fn input_needs_resample(&self) -> bool {
        self.input.needs_resample()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm_bytes(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn pcm_samples(bytes: &[u8]) -> Vec<i16> {
        bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect()
    }

    fn sine(rate: u32, freq: f64, seconds: f64, amplitude: f64) -> Vec<i16> {
        let n = (rate as f64 * seconds) as usize;
        (0..n)
            .map(|i| {
                let t = i as f64 / rate as f64;
                (amplitude * (2.0 * PI * freq * t).sin()) as i16
            })
            .collect()
    }

    #[test]
    fn equal_rates_pass_through() {
        let mut r = Resampler::new(16_000, 16_000);
        let input = pcm_bytes(&[100, -200, 300, -400]);
        assert_eq!(r.process(&input), input);
        assert!(!r.needs_resample());
    }

    #[test]
    fn empty_chunk_returns_empty() {
        let mut r = Resampler::new(16_000, 24_000);
        assert!(r.process(&[]).is_empty());
    }

    #[test]
    fn upsample_ratio_holds_over_stream() {
        let mut r = Resampler::new(16_000, 24_000);
        let input = sine(16_000, 440.0, 0.5, 8000.0);
        let mut total_out = 0usize;
        for chunk in pcm_bytes(&input).chunks(640) {
            total_out += r.process(chunk).len() / BYTES_PER_SAMPLE;
        }
        let expected = input.len() * 3 / 2;
        // Filter latency keeps a tail inside the history window.
        assert!(total_out <= expected);
        assert!(total_out >= expected.saturating_sub(128), "{total_out} vs {expected}");
    }

    #[test]
    fn downsample_ratio_holds() {
        let mut r = Resampler::new(24_000, 16_000);
        let input = sine(24_000, 440.0, 0.5, 8000.0);
        let out = r.process(&pcm_bytes(&input));
        let got = out.len() / BYTES_PER_SAMPLE;
        let expected = input.len() * 2 / 3;
        assert!(got <= expected && got >= expected - 64, "{got} vs {expected}");
    }

    #[test]
    fn output_never_exceeds_i16_range() {
        let mut r = Resampler::new(16_000, 24_000);
        let input: Vec<i16> = std::iter::repeat([i16::MAX, i16::MIN])
            .take(512)
            .flatten()
            .collect();
        let out = r.process(&pcm_bytes(&input));
        for s in pcm_samples(&out) {
            assert!((i16::MIN..=i16::MAX).contains(&s));
        }
    }

    #[test]
    fn round_trip_rms_error_is_bounded() {
        // Band-limited signal well below both Nyquists.
        let original = sine(16_000, 400.0, 1.0, 10_000.0);
        let mut up = Resampler::new(16_000, 24_000);
        let mut down = Resampler::new(24_000, 16_000);

        let mid = up.process(&pcm_bytes(&original));
        let back = pcm_samples(&down.process(&mid));

        // Skip the filter transient at both ends, align on the best lag
        // within the combined group delay.
        let skip = 256usize;
        let usable = back.len().saturating_sub(2 * skip);
        assert!(usable > 8000, "round trip produced too few samples");

        let mut best_rms = f64::MAX;
        for lag in 0..96usize {
            let mut err = 0.0;
            let mut count = 0usize;
            for i in 0..usable {
                let a = original.get(i + skip).copied().unwrap_or(0) as f64;
                let b = back.get(i + skip + lag).copied().unwrap_or(0) as f64;
                err += (a - b) * (a - b);
                count += 1;
            }
            let rms = (err / count as f64).sqrt();
            if rms < best_rms {
                best_rms = rms;
            }
        }
        // 10_000 amplitude sine; demand the error stays well under 5%.
        assert!(best_rms < 500.0, "round-trip rms error {best_rms}");
    }

    #[test]
    fn warmup_accumulates_then_releases() {
        // 100ms @ 16kHz = 3200 bytes.
        let mut w = WarmupBuffer::new(100, 16_000);
        assert!(w.is_warming_up());

        let chunk = vec![1u8; 1600];
        assert!(w.add(&chunk).is_empty());
        assert_eq!(w.buffered_bytes(), 1600);
        assert!((w.buffered_ms() - 50.0).abs() < 0.01);

        let released = w.add(&chunk);
        assert_eq!(released.len(), 3200);
        assert!(!w.is_warming_up());

        // After warmup, pass-through.
        assert_eq!(w.add(&chunk), chunk);
    }

    #[test]
    fn warmup_flush_and_reset() {
        let mut w = WarmupBuffer::new(100, 16_000);
        w.add(&[5u8; 100]);
        assert_eq!(w.flush().len(), 100);
        assert_eq!(w.buffered_bytes(), 0);

        // Reset re-arms the window even after completion.
        let mut w = WarmupBuffer::new(1, 16_000);
        let out = w.add(&[1u8; 64]);
        assert!(!out.is_empty());
        assert!(!w.is_warming_up());
        w.reset();
        assert!(w.is_warming_up());
    }

    #[test]
    fn pair_uses_asymmetric_rates() {
        // Gemini profile: 16k in, 24k out.
        let pair = ResamplerPair::new(16_000, 16_000, 24_000, 200);
        assert!(!pair.input_needs_resample());
        assert_eq!(pair.provider_output_rate(), 24_000);
        assert_eq!(pair.media_rate(), 16_000);
    }

    #[test]
    fn pair_output_goes_through_warmup() {
        let mut pair = ResamplerPair::new(16_000, 24_000, 24_000, 200);
        // 200ms @16k = 6400 bytes required before anything is emitted.
        let chunk = pcm_bytes(&sine(24_000, 440.0, 0.05, 8000.0));
        let first = pair.resample_output(&chunk);
        assert!(first.is_empty(), "warmup must absorb the first chunk");
        assert!(pair.is_output_warming_up());

        let mut released = Vec::new();
        for _ in 0..8 {
            released.extend(pair.resample_output(&chunk));
        }
        assert!(!released.is_empty(), "warmup window should have filled");
    }

    #[test]
    fn pair_reset_rearms_each_turn() {
        let mut pair = ResamplerPair::new(16_000, 16_000, 16_000, 100);
        let chunk = vec![3u8; 3200];
        assert!(!pair.resample_output(&chunk).is_empty());
        pair.reset_output_buffer();
        assert!(pair.is_output_warming_up());
        assert!(pair.resample_output(&vec![3u8; 100]).is_empty());
        assert_eq!(pair.flush_output().len(), 100);
    }
}
