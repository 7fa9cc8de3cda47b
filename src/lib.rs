//! voxbridge — realtime voice-AI bridge for FreeSWITCH.
//!
//! Sits between a SIP media server and a cloud conversational-AI backend
//! and holds, per active phone call, a bidirectional media path: caller
//! PCM in, generated audio out, transcripts and function calls captured,
//! and control events (hangup, DTMF, barge-in, transfer) driven back
//! into the media server over its Event Socket protocol.
//!
//! ## Architecture
//!
//! ```text
//! FreeSWITCH ──ws /stream/{tenant}/{call}──▸ media ─▸ SessionManager
//!     │                                                  │
//!     └──ESL outbound (events/commands)──▸ esl::relay ───┤
//!                                                        ▼
//!                              Session ⇄ providers (OpenAI / ElevenLabs
//!                                │        / Gemini Live / local pipeline)
//!                                ├─ audio (resample, warmup, AEC)
//!                                ├─ transfer (originate + bridge)
//!                                └─ handoff (agents API, recordings)
//! ```

pub mod audio;
pub mod config;
pub mod config_loader;
pub mod esl;
pub mod handoff;
pub mod media;
pub mod metrics;
pub mod providers;
pub mod rate_limit;
pub mod services;
pub mod session;
pub mod store;
pub mod transfer;

pub use config::{AudioMode, Settings};
pub use services::Services;
pub use session::manager::SessionManager;
pub use session::{Session, SessionConfig, SessionError, SessionState, TranscriptEntry};
