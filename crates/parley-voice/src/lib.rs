//! # Parley Voice - Real-Time Duplex Voice Pipeline
//!
//! This crate holds a live, low-latency voice conversation with a remote agent:
//! microphone audio is framed and streamed out continuously while the agent's
//! audio frames are decoded and scheduled gaplessly onto the output device,
//! with interruption cutting in-flight playback cleanly.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Duplex Session                            │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐      │
//! │  │   Audio In   │→ │ PCM Framer   │→ │  Agent Link  │      │
//! │  │    (cpal)    │  │ (PCM16/b64)  │  │ (WebSocket)  │      │
//! │  └──────────────┘  └──────────────┘  └──────────────┘      │
//! │                                              ↓              │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐      │
//! │  │  Audio Out   │← │  Playback    │← │ PCM Decoder  │      │
//! │  │   (rodio)    │  │  Scheduler   │  │              │      │
//! │  └──────────────┘  └──────────────┘  └──────────────┘      │
//! │         ↑ flush on interrupt      Phase Bus → UI            │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod agent;
pub mod audio;
pub mod capture;
pub mod config;
pub mod engine;
pub mod error;
pub mod live_ws;
pub mod narration;
pub mod output;
pub mod pcm;
pub mod phase;
pub mod scheduler;
pub mod session;

pub use agent::{AgentConnector, AgentEvent, AgentLink, InboundAudio, OutboundAudio};
pub use audio::{
    AudioBackend, AudioChunk, AudioConfig, CaptureStream, OutputDevice, PlaybackId,
    SystemAudioBackend,
};
pub use capture::CpalCapture;
pub use config::ParleyConfig;
pub use engine::ParleyEngine;
pub use error::{VoiceError, VoiceResult};
pub use live_ws::{AgentConfig, LiveWsConnector};
pub use narration::{
    HttpNarrationClient, NarratedPlayer, NarrationAudio, NarrationClient, NarrationConfig,
    NarrationOutcome, NarrationSegment, NarrationTicket, VoiceRole,
};
pub use output::RodioOutput;
pub use pcm::{decode_pcm16, decode_pcm16_base64, AudioFrame, DecodedBuffer};
pub use phase::{reduce, Phase, PhaseBus, PhaseSignal, PhaseState};
pub use scheduler::{PlaybackScheduler, ScheduledPlayback};
pub use session::{
    DuplexSessionManager, EndReason, SessionConfig, SessionLifecycle, SessionStats,
};
