//! **Narration**: one-shot rendering of a labeled script.
//!
//! A [`NarrationClient`] turns segments into one PCM payload; the
//! [`NarratedPlayer`] decodes it and schedules it as a single buffer on its
//! own output device. No duplex channel is involved.

use crate::audio::{off_runtime, AudioBackend, AudioConfig};
use crate::error::{VoiceError, VoiceResult};
use crate::pcm::{decode_pcm16, DecodedBuffer};
use crate::phase::{Phase, PhaseBus, PhaseSignal};
use crate::scheduler::PlaybackScheduler;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, error, info, warn};

/// Fixed set of narration voices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoiceRole {
    Narrator,
    Analyst,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarrationSegment {
    pub role: VoiceRole,
    pub text: String,
}

impl NarrationSegment {
    pub fn new(role: VoiceRole, text: impl Into<String>) -> Self {
        Self { role, text: text.into() }
    }
}

/// Synthesized narration, raw PCM16 little-endian.
#[derive(Debug, Clone, PartialEq)]
pub struct NarrationAudio {
    pub data: Vec<u8>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl NarrationAudio {
    pub fn decode(&self) -> VoiceResult<DecodedBuffer> {
        decode_pcm16(&self.data, self.sample_rate, self.channels)
    }
}

/// Narration service configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NarrationConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    /// Requested output rate (default: 24000)
    pub sample_rate: u32,
    pub timeout_secs: u64,
}

impl Default for NarrationConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8765/narrate".to_string(),
            api_key: None,
            sample_rate: 24000,
            timeout_secs: 120,
        }
    }
}

/// Turns a script into audio.
#[async_trait]
pub trait NarrationClient: Send + Sync {
    async fn synthesize(&self, segments: &[NarrationSegment]) -> VoiceResult<NarrationAudio>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NarrationRequest<'a> {
    segments: &'a [NarrationSegment],
    sample_rate: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NarrationResponse {
    audio: String,
    sample_rate: Option<u32>,
    channels: Option<u16>,
}

/// Narration over HTTP (reqwest).
#[derive(Debug, Clone)]
pub struct HttpNarrationClient {
    config: NarrationConfig,
    client: reqwest::Client,
}

impl HttpNarrationClient {
    pub fn new(config: NarrationConfig) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| VoiceError::Narration(e.to_string()))?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl NarrationClient for HttpNarrationClient {
    async fn synthesize(&self, segments: &[NarrationSegment]) -> VoiceResult<NarrationAudio> {
        if segments.is_empty() {
            return Err(VoiceError::Config("narration script is empty".to_string()));
        }

        let body = NarrationRequest {
            segments,
            sample_rate: self.config.sample_rate,
        };
        let mut request = self.client.post(&self.config.endpoint).json(&body);
        if let Some(key) = self.config.api_key.as_deref().filter(|k| !k.is_empty()) {
            request = request.bearer_auth(key);
        }

        debug!(segments = segments.len(), endpoint = %self.config.endpoint, "requesting narration");
        let res = request.send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::Narration(format!(
                "narration API error {}: {}",
                status, body
            )));
        }

        let parsed: NarrationResponse = res.json().await?;
        let sample_rate = parsed.sample_rate.unwrap_or(self.config.sample_rate);
        let channels = parsed.channels.unwrap_or(1);
        let data = base64::Engine::decode(
            &base64::engine::general_purpose::STANDARD,
            parsed.audio.as_bytes(),
        )?;
        let audio = NarrationAudio {
            data,
            sample_rate,
            channels,
        };
        // Reject a payload that would not decode before handing it back
        let buffer = audio.decode()?;
        debug!(seconds = buffer.duration(), "narration received");
        Ok(audio)
    }
}

/// How a narration ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NarrationOutcome {
    /// Played to the end; duration in seconds.
    Completed(f64),
    Cancelled,
}

/// Counts a play as holding the output until dropped, even if the play
/// future itself is dropped mid-way.
struct OutputHold<'a>(&'a watch::Sender<usize>);

impl<'a> OutputHold<'a> {
    fn acquire(holders: &'a watch::Sender<usize>) -> Self {
        holders.send_modify(|n| *n += 1);
        Self(holders)
    }
}

impl Drop for OutputHold<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// A narration that has claimed the player but not started rendering.
///
/// Dropping it without calling [`NarratedPlayer::run`] gives the output back.
pub struct NarrationTicket<'a> {
    id: u64,
    cancel_rx: oneshot::Receiver<()>,
    hold: OutputHold<'a>,
}

/// Plays narration as one scheduled buffer.
pub struct NarratedPlayer {
    audio: AudioConfig,
    backend: Arc<dyn AudioBackend>,
    client: Arc<dyn NarrationClient>,
    phase: PhaseBus,
    current: Mutex<Option<(u64, oneshot::Sender<()>)>>,
    /// Plays that have not yet released their output device.
    holders: watch::Sender<usize>,
    next_id: std::sync::atomic::AtomicU64,
}

impl NarratedPlayer {
    pub fn new(
        audio: AudioConfig,
        backend: Arc<dyn AudioBackend>,
        client: Arc<dyn NarrationClient>,
        phase: PhaseBus,
    ) -> Self {
        Self {
            audio,
            backend,
            client,
            phase,
            current: Mutex::new(None),
            holders: watch::channel(0).0,
            next_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    /// Resolves once no play holds an output device.
    pub async fn released(&self) {
        let mut rx = self.holders.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Claim the player for a new narration: cancel any play in flight and
    /// take an output hold, so [`released`](Self::released) waits for this
    /// play from here on.
    pub async fn begin(&self, segments: &[NarrationSegment]) -> VoiceResult<NarrationTicket<'_>> {
        if segments.is_empty() {
            return Err(VoiceError::Config("narration script is empty".to_string()));
        }

        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        if let Some((previous, tx)) = self.current.lock().await.replace((id, cancel_tx)) {
            debug!(narration = previous, "cancelling previous narration");
            let _ = tx.send(());
        }

        Ok(NarrationTicket {
            id,
            cancel_rx,
            hold: OutputHold::acquire(&self.holders),
        })
    }

    /// Synthesize and play the narration claimed by `ticket`, resolving when
    /// playback ends or is cancelled.
    pub async fn run(
        &self,
        ticket: NarrationTicket<'_>,
        segments: &[NarrationSegment],
    ) -> VoiceResult<NarrationOutcome> {
        // The hold lives until the phase is settled below
        let NarrationTicket {
            id,
            mut cancel_rx,
            hold: _hold,
        } = ticket;

        info!(narration = id, segments = segments.len(), "📖 Starting narration");
        let mut scheduler = None;
        let result = self.render(segments, &mut cancel_rx, &mut scheduler).await;

        if let Some(mut scheduler) = scheduler {
            if let Err(e) = off_runtime(move || scheduler.close()).await {
                warn!(narration = id, "Failed to close output context: {}", e);
            }
        }

        let superseded = {
            let mut current = self.current.lock().await;
            match current.as_ref() {
                Some((cur, _)) if *cur == id => {
                    *current = None;
                    false
                }
                Some(_) => true,
                None => false,
            }
        };
        if superseded {
            // A newer narration owns the phase now
            debug!(narration = id, "narration superseded");
            return result;
        }

        match &result {
            Ok(outcome) => {
                info!(narration = id, ?outcome, "Narration finished");
                self.phase.dispatch(PhaseSignal::Reset);
            }
            Err(e) => {
                error!(narration = id, "Narration failed: {}", e);
                self.phase.dispatch(PhaseSignal::SetPhase(Phase::Error));
            }
        }
        result
    }

    async fn render(
        &self,
        segments: &[NarrationSegment],
        cancel_rx: &mut oneshot::Receiver<()>,
        scheduler: &mut Option<PlaybackScheduler>,
    ) -> VoiceResult<NarrationOutcome> {
        self.phase.dispatch_all([
            PhaseSignal::Reset,
            PhaseSignal::SetPhase(Phase::GeneratingAudio),
            PhaseSignal::SetProgress(0.0),
        ]);

        let audio = tokio::select! {
            _ = &mut *cancel_rx => return Ok(NarrationOutcome::Cancelled),
            audio = self.client.synthesize(segments) => audio?,
        };
        self.phase.dispatch(PhaseSignal::SetProgress(1.0));

        let buffer = audio.decode()?;
        let backend = Arc::clone(&self.backend);
        let config = self.audio.clone();
        let output = off_runtime(move || backend.open_output(&config)).await?;
        let scheduler = scheduler.insert(PlaybackScheduler::new(output));

        let Some(scheduled) = scheduler.schedule(&buffer)? else {
            return Ok(NarrationOutcome::Completed(0.0));
        };
        self.phase.dispatch_all([
            PhaseSignal::SetPhase(Phase::Speaking),
            PhaseSignal::SetInterruptible(true),
        ]);

        let remaining = (scheduled.end_time() - scheduler.now()).max(0.0);
        tokio::select! {
            _ = &mut *cancel_rx => Ok(NarrationOutcome::Cancelled),
            _ = tokio::time::sleep(Duration::from_secs_f64(remaining)) => {
                Ok(NarrationOutcome::Completed(scheduled.duration))
            }
        }
    }

    /// Cancel the narration in flight, if any.
    pub async fn stop(&self) -> bool {
        match self.current.lock().await.take() {
            Some((id, tx)) => {
                info!(narration = id, "🛑 Stopping narration");
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_serialize_lowercase() {
        let segment = NarrationSegment::new(VoiceRole::Analyst, "numbers");
        let json = serde_json::to_string(&segment).unwrap();
        assert_eq!(json, r#"{"role":"analyst","text":"numbers"}"#);
    }

    #[test]
    fn script_parses_from_json() {
        let script: Vec<NarrationSegment> = serde_json::from_str(
            r#"[{"role":"narrator","text":"Once."},{"role":"analyst","text":"Twice."}]"#,
        )
        .unwrap();
        assert_eq!(script.len(), 2);
        assert_eq!(script[0].role, VoiceRole::Narrator);
    }

    #[test]
    fn unknown_role_is_rejected() {
        let parsed: Result<NarrationSegment, _> =
            serde_json::from_str(r#"{"role":"villain","text":"no"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn request_body_shape() {
        let segments = vec![NarrationSegment::new(VoiceRole::Narrator, "hi")];
        let body = NarrationRequest { segments: &segments, sample_rate: 24000 };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["sampleRate"], 24000);
        assert_eq!(json["segments"][0]["role"], "narrator");
    }

    #[tokio::test]
    async fn http_client_rejects_empty_script() {
        let client = HttpNarrationClient::new(NarrationConfig::default()).unwrap();
        let result = client.synthesize(&[]).await;
        assert!(matches!(result, Err(VoiceError::Config(_))));
    }

    #[test]
    fn audio_decodes_to_buffer() {
        let audio = NarrationAudio {
            data: vec![0, 0, 0, 64],
            sample_rate: 24000,
            channels: 1,
        };
        let buffer = audio.decode().unwrap();
        assert_eq!(buffer.frames(), 2);
        assert!((buffer.channel(0).unwrap()[1] - 0.5).abs() < 1e-6);
    }
}
