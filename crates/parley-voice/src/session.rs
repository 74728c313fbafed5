//! **Duplex session**: one live conversation with the remote agent.
//!
//! `DuplexSessionManager` owns a single session slot. Starting a session
//! acquires the microphone, the output device and the agent link (in that
//! order), then hands all three to one task that processes every event
//! through a single `select!` queue:
//!
//! ```text
//!   mic block ──► encode ──► link.send_audio        (fire and forget)
//!   agent audio ─► decode ──► scheduler.schedule    (gapless)
//!   interrupted ─► scheduler.flush ─► phase Interrupt
//!   turn complete ► phase reflecting ─► auto reset after delay
//!   close / error / stop ──► teardown
//! ```
//!
//! Because one task owns the scheduler, the cursor and active set need no
//! locks, and a flush always lands before the next inbound frame is decoded.

use crate::agent::{AgentConnector, AgentEvent, AgentLink, OutboundAudio};
use crate::audio::{off_runtime, AudioBackend, AudioChunk, AudioConfig, CaptureStream};
use crate::error::{VoiceError, VoiceResult};
use crate::pcm::{decode_pcm16, rms, AudioFrame};
use crate::phase::{Phase, PhaseBus, PhaseSignal};
use crate::scheduler::PlaybackScheduler;
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Scales block RMS into the 0..1 intensity range.
const INTENSITY_GAIN: f32 = 4.0;

/// Session behavior configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Delay after a turn completes before the phase resets to idle (default: 3000ms)
    pub turn_reset_delay_ms: u64,

    /// How often finished playback is reaped from the active set (default: 50ms)
    pub reap_interval_ms: u64,

    /// Intensity shown while reflecting after a turn (default: 0.2)
    pub reflecting_intensity: f32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            turn_reset_delay_ms: 3000,
            reap_interval_ms: 50,
            reflecting_intensity: 0.2,
        }
    }
}

/// Where a session is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionLifecycle {
    Closed,
    Opening,
    Open,
    Closing,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum EndReason {
    /// `stop()` or the manager was dropped.
    LocalStop,
    RemoteClosed(Option<String>),
    ChannelError(String),
    /// The capture stream stopped delivering blocks.
    CaptureEnded,
}

/// Counters for one session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStats {
    pub blocks_sent: u64,
    pub frames_scheduled: u64,
    pub frames_dropped: u64,
    pub interruptions: u64,
    pub turns_completed: u64,
    pub end_reason: Option<EndReason>,
}

/// Everything a session holds open. Released exactly once.
struct SessionResources {
    capture: Option<Box<dyn CaptureStream>>,
    scheduler: Option<PlaybackScheduler>,
    link: Option<AgentLink>,
}

impl SessionResources {
    fn empty() -> Self {
        Self {
            capture: None,
            scheduler: None,
            link: None,
        }
    }

    /// Release in order: playback, microphone, capture context, output
    /// context, agent link. A failing step is logged and the rest still run.
    fn release(&mut self) {
        if let Some(scheduler) = self.scheduler.as_mut() {
            scheduler.flush();
        }
        if let Some(capture) = self.capture.as_mut() {
            if let Err(e) = capture.stop() {
                warn!("Failed to release microphone: {}", e);
            }
        }
        if let Some(mut capture) = self.capture.take() {
            if let Err(e) = capture.close() {
                warn!("Failed to close capture context: {}", e);
            }
        }
        if let Some(mut scheduler) = self.scheduler.take() {
            if let Err(e) = scheduler.close() {
                warn!("Failed to close output context: {}", e);
            }
        }
        if let Some(mut link) = self.link.take() {
            if let Err(e) = link.close() {
                warn!("Failed to close agent link: {}", e);
            }
        }
    }
}

impl SessionResources {
    /// Release on the blocking pool; device threads are joined on close.
    async fn release_off_runtime(mut self) {
        let released = off_runtime(move || {
            self.release();
            Ok(())
        })
        .await;
        if let Err(e) = released {
            warn!("Failed to release session resources: {}", e);
        }
    }
}

impl Drop for SessionResources {
    fn drop(&mut self) {
        self.release();
    }
}

/// Handle to a running session task.
struct SessionHandle {
    id: u64,
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<SessionStats>,
}

impl SessionHandle {
    /// Ask the task to stop and wait for its teardown. Safe if the task has
    /// already ended on its own.
    async fn shutdown(mut self) -> Option<SessionStats> {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(stats) => Some(stats),
            Err(e) => {
                error!(session = self.id, "Session task failed: {}", e);
                None
            }
        }
    }
}

/// Owns the single live-session slot.
pub struct DuplexSessionManager {
    audio: AudioConfig,
    config: SessionConfig,
    backend: Arc<dyn AudioBackend>,
    connector: Arc<dyn AgentConnector>,
    phase: PhaseBus,
    lifecycle: Arc<watch::Sender<SessionLifecycle>>,
    slot: Mutex<Option<SessionHandle>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl DuplexSessionManager {
    pub fn new(
        audio: AudioConfig,
        config: SessionConfig,
        backend: Arc<dyn AudioBackend>,
        connector: Arc<dyn AgentConnector>,
        phase: PhaseBus,
    ) -> Self {
        let (lifecycle, _rx) = watch::channel(SessionLifecycle::Closed);
        Self {
            audio,
            config,
            backend,
            connector,
            phase,
            lifecycle: Arc::new(lifecycle),
            slot: Mutex::new(None),
            next_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    pub fn phase(&self) -> &PhaseBus {
        &self.phase
    }

    pub fn lifecycle(&self) -> SessionLifecycle {
        *self.lifecycle.borrow()
    }

    pub fn subscribe_lifecycle(&self) -> watch::Receiver<SessionLifecycle> {
        self.lifecycle.subscribe()
    }

    /// Opening or open.
    pub fn is_active(&self) -> bool {
        matches!(
            self.lifecycle(),
            SessionLifecycle::Opening | SessionLifecycle::Open
        )
    }

    /// Start a live session, tearing down any previous one first.
    ///
    /// Resolves once the agent handshake completes. On failure nothing is
    /// left open and the phase shows `error`.
    pub async fn start(&self) -> VoiceResult<()> {
        let mut slot = self.slot.lock().await;

        if let Some(previous) = slot.take() {
            info!(session = previous.id, "Replacing active session");
            self.lifecycle.send_replace(SessionLifecycle::Closing);
            previous.shutdown().await;
        }

        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        info!(session = id, "🎙️ Opening live session");
        self.lifecycle.send_replace(SessionLifecycle::Opening);
        self.phase.dispatch(PhaseSignal::Reset);

        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel::<AudioChunk>();
        let resources = match self.open_resources(chunk_tx).await {
            Ok(resources) => resources,
            Err(e) => {
                error!(session = id, "Failed to open live session: {}", e);
                self.phase.dispatch(PhaseSignal::SetPhase(Phase::Error));
                self.lifecycle.send_replace(SessionLifecycle::Closed);
                return Err(e);
            }
        };

        self.phase.dispatch_all([
            PhaseSignal::SetPhase(Phase::Listening),
            PhaseSignal::SetInterruptible(false),
        ]);
        self.lifecycle.send_replace(SessionLifecycle::Open);

        let (stop_tx, stop_rx) = oneshot::channel();
        let session = SessionLoop {
            id,
            resources,
            chunk_rx,
            phase: self.phase.clone(),
            lifecycle: Arc::clone(&self.lifecycle),
            capture_sample_rate: self.audio.capture_sample_rate,
            config: self.config.clone(),
            auto_reset_at: None,
            stats: SessionStats::default(),
        };
        let task = tokio::spawn(session.run(stop_rx));

        *slot = Some(SessionHandle {
            id,
            stop_tx: Some(stop_tx),
            task,
        });
        info!(session = id, "✅ Live session open");
        Ok(())
    }

    async fn open_resources(
        &self,
        chunk_tx: mpsc::UnboundedSender<AudioChunk>,
    ) -> VoiceResult<SessionResources> {
        let backend = Arc::clone(&self.backend);
        let audio = self.audio.clone();
        // Anything acquired so far is released when `resources` drops on error
        let mut resources = off_runtime(move || {
            let mut resources = SessionResources::empty();
            resources.capture = Some(backend.open_capture(&audio, chunk_tx)?);
            let output = backend.open_output(&audio)?;
            resources.scheduler = Some(PlaybackScheduler::new(output));
            Ok(resources)
        })
        .await?;

        match self.connector.connect().await {
            Ok(link) => {
                resources.link = Some(link);
                Ok(resources)
            }
            Err(e) => {
                resources.release_off_runtime().await;
                Err(e)
            }
        }
    }

    /// End the active session. Idempotent: a second call, or a call after the
    /// agent already closed the session, is a no-op.
    pub async fn stop(&self) -> Option<SessionStats> {
        let handle = self.slot.lock().await.take();
        match handle {
            Some(handle) => {
                info!(session = handle.id, "🛑 Stopping live session");
                if self.lifecycle() != SessionLifecycle::Closed {
                    self.lifecycle.send_replace(SessionLifecycle::Closing);
                }
                handle.shutdown().await
            }
            None => {
                debug!("stop requested with no active session");
                None
            }
        }
    }

    /// Wait until the current session (if any) has closed.
    pub async fn closed(&self) {
        let mut rx = self.lifecycle.subscribe();
        let _ = rx.wait_for(|state| *state == SessionLifecycle::Closed).await;
    }
}

struct SessionLoop {
    id: u64,
    resources: SessionResources,
    chunk_rx: mpsc::UnboundedReceiver<AudioChunk>,
    phase: PhaseBus,
    lifecycle: Arc<watch::Sender<SessionLifecycle>>,
    capture_sample_rate: u32,
    config: SessionConfig,
    auto_reset_at: Option<Instant>,
    stats: SessionStats,
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn next_agent_event(link: Option<&mut AgentLink>) -> Option<AgentEvent> {
    match link {
        Some(link) => link.next_event().await,
        None => None,
    }
}

impl SessionLoop {
    async fn run(mut self, mut stop_rx: oneshot::Receiver<()>) -> SessionStats {
        let mut reap = tokio::time::interval(Duration::from_millis(self.config.reap_interval_ms.max(1)));
        reap.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            tokio::select! {
                biased;
                // Err means the manager was dropped
                _ = &mut stop_rx => break EndReason::LocalStop,
                // Mic blocks go first so an inbound burst cannot hold them back
                chunk = self.chunk_rx.recv() => match chunk {
                    Some(chunk) => {
                        if let Err(e) = self.handle_capture_block(chunk) {
                            break EndReason::ChannelError(e.to_string());
                        }
                    }
                    None => break EndReason::CaptureEnded,
                },
                event = next_agent_event(self.resources.link.as_mut()) => match event {
                    Some(event) => {
                        if let Some(reason) = self.handle_agent_event(event) {
                            break reason;
                        }
                    }
                    None => break EndReason::RemoteClosed(None),
                },
                _ = deadline(self.auto_reset_at) => {
                    self.auto_reset_at = None;
                    debug!(session = self.id, "turn settled, resetting phase");
                    self.phase.dispatch(PhaseSignal::Reset);
                }
                _ = reap.tick() => {
                    if let Some(scheduler) = self.resources.scheduler.as_mut() {
                        scheduler.reap_finished();
                    }
                }
            }
        };

        self.teardown(reason).await
    }

    fn handle_capture_block(&mut self, chunk: AudioChunk) -> VoiceResult<()> {
        let link = self.resources.link.as_ref().ok_or(VoiceError::ChannelClosed)?;
        let frame = AudioFrame::from_f32(&chunk.samples, self.capture_sample_rate, 1);
        link.send_audio(OutboundAudio {
            data: frame.to_base64(),
            sample_rate: frame.sample_rate,
        })?;
        self.stats.blocks_sent += 1;

        if self.phase.phase() == Phase::Listening {
            self.phase
                .dispatch(PhaseSignal::SetIntensity(rms(&chunk.samples) * INTENSITY_GAIN));
        }
        Ok(())
    }

    /// Returns `Some` when the event ends the session.
    fn handle_agent_event(&mut self, event: AgentEvent) -> Option<EndReason> {
        match event {
            AgentEvent::Audio(audio) => {
                self.auto_reset_at = None;
                let buffer = match decode_pcm16(&audio.data, audio.sample_rate, audio.channels) {
                    Ok(buffer) => buffer,
                    Err(e) => {
                        self.stats.frames_dropped += 1;
                        warn!(session = self.id, "Dropping inbound frame: {}", e);
                        return None;
                    }
                };
                let scheduler = self.resources.scheduler.as_mut()?;
                match scheduler.schedule(&buffer) {
                    Ok(Some(_)) => {
                        self.stats.frames_scheduled += 1;
                        if self.phase.phase() != Phase::Speaking {
                            self.phase.dispatch_all([
                                PhaseSignal::SetPhase(Phase::Speaking),
                                PhaseSignal::SetInterruptible(true),
                            ]);
                        }
                        self.phase
                            .dispatch(PhaseSignal::SetIntensity(buffer.rms() * INTENSITY_GAIN));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        self.stats.frames_dropped += 1;
                        warn!(session = self.id, "Failed to schedule inbound frame: {}", e);
                    }
                }
                None
            }
            AgentEvent::Interrupted => {
                self.auto_reset_at = None;
                self.stats.interruptions += 1;
                let stopped = self
                    .resources
                    .scheduler
                    .as_mut()
                    .map(PlaybackScheduler::flush)
                    .unwrap_or(0);
                info!(session = self.id, stopped, "⚡ Agent interrupted, playback flushed");
                self.phase.dispatch(PhaseSignal::Interrupt);
                None
            }
            AgentEvent::TurnComplete => {
                self.stats.turns_completed += 1;
                self.phase.dispatch_all([
                    PhaseSignal::SetPhase(Phase::Reflecting),
                    PhaseSignal::SetIntensity(self.config.reflecting_intensity),
                    PhaseSignal::SetInterruptible(false),
                ]);
                self.auto_reset_at =
                    Some(Instant::now() + Duration::from_millis(self.config.turn_reset_delay_ms));
                None
            }
            AgentEvent::InputTranscript { text, partial } => {
                self.auto_reset_at = None;
                self.phase
                    .dispatch(PhaseSignal::SetTranscript { text, partial });
                if partial {
                    if matches!(self.phase.phase(), Phase::Idle | Phase::Reflecting) {
                        self.phase.dispatch(PhaseSignal::SetPhase(Phase::Listening));
                    }
                } else {
                    self.phase.dispatch_all([
                        PhaseSignal::MarkUtterance(Utc::now()),
                        PhaseSignal::SetPhase(Phase::Thinking),
                    ]);
                }
                None
            }
            AgentEvent::OutputTranscript { text } => {
                debug!(session = self.id, %text, "agent transcript");
                None
            }
            AgentEvent::Closed { reason } => Some(EndReason::RemoteClosed(reason)),
            AgentEvent::Error(message) => Some(EndReason::ChannelError(message)),
        }
    }

    async fn teardown(mut self, reason: EndReason) -> SessionStats {
        match &reason {
            EndReason::LocalStop => info!(session = self.id, "Session stopped"),
            EndReason::RemoteClosed(why) => {
                info!(session = self.id, reason = ?why, "Agent closed the session")
            }
            EndReason::ChannelError(e) => error!(session = self.id, "Session channel failed: {}", e),
            EndReason::CaptureEnded => warn!(session = self.id, "Capture stream ended"),
        }

        if *self.lifecycle.borrow() == SessionLifecycle::Open {
            self.lifecycle.send_replace(SessionLifecycle::Closing);
        }
        std::mem::replace(&mut self.resources, SessionResources::empty())
            .release_off_runtime()
            .await;
        self.phase.dispatch(PhaseSignal::Reset);
        self.lifecycle.send_replace(SessionLifecycle::Closed);

        self.stats.end_reason = Some(reason);
        info!(
            session = self.id,
            blocks_sent = self.stats.blocks_sent,
            frames_scheduled = self.stats.frames_scheduled,
            frames_dropped = self.stats.frames_dropped,
            interruptions = self.stats.interruptions,
            "⏹️ Live session closed"
        );
        std::mem::take(&mut self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_config_defaults() {
        let c = SessionConfig::default();
        assert_eq!(c.turn_reset_delay_ms, 3000);
        assert_eq!(c.reap_interval_ms, 50);
        assert!((c.reflecting_intensity - 0.2).abs() < 1e-6);
    }

    #[test]
    fn empty_resources_release_is_noop() {
        let mut resources = SessionResources::empty();
        resources.release();
        resources.release();
    }
}
