//! Audio primitives for the realtime bridge.
//!
//! - `resampler` — rational PCM16 rate conversion plus the output warmup
//!   buffer that smooths each provider response turn.
//! - `echo` — NLMS echo cancellation using emitted playback as reference.
//! - `pcmu` — G.711 µ-law for the RTP media plane.

pub mod echo;
pub mod pcmu;
pub mod resampler;

pub use echo::{EchoCanceller, EchoCancellerStats};
pub use resampler::{Resampler, ResamplerPair, WarmupBuffer, BYTES_PER_SAMPLE};
