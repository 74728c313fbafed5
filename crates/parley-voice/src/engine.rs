//! Parley Engine - The top-level coordination layer
//!
//! Ties the live session manager and the narrated player to one shared
//! phase bus, and decides which of the two holds the output device.

use crate::agent::AgentConnector;
use crate::audio::{AudioBackend, SystemAudioBackend};
use crate::config::ParleyConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::live_ws::LiveWsConnector;
use crate::narration::{
    HttpNarrationClient, NarratedPlayer, NarrationClient, NarrationOutcome, NarrationSegment,
};
use crate::phase::{PhaseBus, PhaseState};
use crate::session::{DuplexSessionManager, SessionLifecycle, SessionStats};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::info;

/// The voice engine
///
/// This coordinates:
/// - Live duplex sessions with the remote agent
/// - One-shot narration playback
/// - Exclusive ownership of the output device between the two
pub struct ParleyEngine {
    phase: PhaseBus,
    session: DuplexSessionManager,
    narration: NarratedPlayer,
    /// Serializes every decision about who owns the output device.
    output_gate: Mutex<()>,
}

impl ParleyEngine {
    /// Build with explicit collaborators.
    pub fn new(
        config: &ParleyConfig,
        backend: Arc<dyn AudioBackend>,
        connector: Arc<dyn AgentConnector>,
        narration: Arc<dyn NarrationClient>,
    ) -> Self {
        let phase = PhaseBus::new();
        let session = DuplexSessionManager::new(
            config.audio.clone(),
            config.session.clone(),
            Arc::clone(&backend),
            connector,
            phase.clone(),
        );
        let narration = NarratedPlayer::new(config.audio.clone(), backend, narration, phase.clone());
        Self {
            phase,
            session,
            narration,
            output_gate: Mutex::new(()),
        }
    }

    /// Build against the system audio devices, the WebSocket agent and the
    /// HTTP narration service.
    pub fn from_config(config: &ParleyConfig) -> VoiceResult<Self> {
        info!("🎭 Initializing Parley engine");
        let connector = LiveWsConnector::new(config.agent.clone(), &config.audio);
        let narration = HttpNarrationClient::new(config.narration.clone())?;
        Ok(Self::new(
            config,
            Arc::new(SystemAudioBackend),
            Arc::new(connector),
            Arc::new(narration),
        ))
    }

    pub fn phase(&self) -> PhaseState {
        self.phase.snapshot()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<PhaseState> {
        self.phase.subscribe()
    }

    pub fn subscribe_lifecycle(&self) -> watch::Receiver<SessionLifecycle> {
        self.session.subscribe_lifecycle()
    }

    pub fn is_live(&self) -> bool {
        self.session.is_active()
    }

    /// Start a live session. Narration in progress is cancelled and its
    /// output device released first.
    ///
    /// No narration can begin until this returns, including while a
    /// previous session is being replaced.
    pub async fn start_live(&self) -> VoiceResult<()> {
        let _gate = self.output_gate.lock().await;
        if self.narration.stop().await {
            info!("Narration cancelled for live session");
        }
        self.narration.released().await;
        self.session.start().await
    }

    /// Idempotent.
    pub async fn stop_live(&self) -> Option<SessionStats> {
        self.session.stop().await
    }

    /// Resolves when the live session has closed, locally or remotely.
    pub async fn live_closed(&self) {
        self.session.closed().await
    }

    /// Play a narration script. Refused while a live session holds the
    /// output device.
    pub async fn play_narration(
        &self,
        segments: &[NarrationSegment],
    ) -> VoiceResult<NarrationOutcome> {
        let ticket = {
            let _gate = self.output_gate.lock().await;
            if self.session.is_active() {
                return Err(VoiceError::OutputBusy(
                    "a live session holds the output device".to_string(),
                ));
            }
            self.narration.begin(segments).await?
        };
        self.narration.run(ticket, segments).await
    }

    pub async fn stop_narration(&self) -> bool {
        self.narration.stop().await
    }

    /// Stop everything.
    pub async fn shutdown(&self) {
        info!("🛑 Shutting down Parley engine");
        self.narration.stop().await;
        self.session.stop().await;
        self.narration.released().await;
    }
}
