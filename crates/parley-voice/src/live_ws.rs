//! WebSocket transport for a live audio agent.
//!
//! JSON over a single socket. The client opens with a `setup` message and
//! waits for `setupComplete`; after that it streams `realtimeInput` audio
//! chunks while the server pushes `serverContent` messages carrying audio
//! parts, transcriptions, and the `interrupted` / `turnComplete` flags.

use crate::agent::{AgentConnector, AgentEvent, AgentLink, InboundAudio, OutboundAudio};
use crate::audio::AudioConfig;
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Remote agent endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// WebSocket URL (ws:// or wss://).
    pub url: String,
    /// Model name sent in the setup message.
    pub model: String,
    /// Sent as the `key` query parameter when present.
    pub api_key: Option<String>,
    /// Optional system instruction sent with setup.
    pub system_instruction: Option<String>,
    /// Handshake timeout (default: 10s).
    pub connect_timeout_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8765/live".to_string(),
            model: "live-audio".to_string(),
            api_key: None,
            system_instruction: None,
            connect_timeout_ms: 10_000,
        }
    }
}

/// Connector speaking the live JSON protocol.
#[derive(Debug, Clone)]
pub struct LiveWsConnector {
    agent: AgentConfig,
    capture_sample_rate: u32,
    output_sample_rate: u32,
    output_channels: u16,
}

impl LiveWsConnector {
    pub fn new(agent: AgentConfig, audio: &AudioConfig) -> Self {
        Self {
            agent,
            capture_sample_rate: audio.capture_sample_rate,
            output_sample_rate: audio.output_sample_rate,
            output_channels: audio.output_channels,
        }
    }

    fn endpoint(&self) -> String {
        match self.agent.api_key.as_deref().filter(|k| !k.is_empty()) {
            Some(key) => {
                let sep = if self.agent.url.contains('?') { '&' } else { '?' };
                format!("{}{}key={}", self.agent.url, sep, key)
            }
            None => self.agent.url.clone(),
        }
    }

    fn setup_message(&self) -> String {
        let mut setup = serde_json::json!({
            "setup": {
                "model": self.agent.model,
                "generationConfig": { "responseModalities": ["AUDIO"] },
                "inputAudioTranscription": {},
                "outputAudioTranscription": {},
            }
        });
        if let Some(instruction) = &self.agent.system_instruction {
            setup["setup"]["systemInstruction"] =
                serde_json::json!({ "parts": [{ "text": instruction }] });
        }
        setup.to_string()
    }
}

#[async_trait]
impl AgentConnector for LiveWsConnector {
    async fn connect(&self) -> VoiceResult<AgentLink> {
        let timeout = Duration::from_millis(self.agent.connect_timeout_ms.max(1));
        info!(url = %self.agent.url, model = %self.agent.model, "🔌 Connecting to live agent");

        let (ws, _response) = tokio::time::timeout(
            timeout,
            tokio_tungstenite::connect_async(self.endpoint()),
        )
        .await
        .map_err(|_| VoiceError::Channel("connect timed out".to_string()))??;

        let (mut sink, mut stream) = ws.split();
        sink.send(Message::Text(self.setup_message())).await?;

        tokio::time::timeout(timeout, async {
            while let Some(msg) = stream.next().await {
                let text = match msg? {
                    Message::Text(text) => text,
                    Message::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                    Message::Close(frame) => {
                        return Err(VoiceError::Channel(format!(
                            "agent closed during setup: {}",
                            frame.map(|f| f.reason.to_string()).unwrap_or_default()
                        )))
                    }
                    _ => continue,
                };
                let parsed: ServerMessage = serde_json::from_str(&text)?;
                if parsed.setup_complete.is_some() {
                    return Ok(());
                }
                debug!("ignoring pre-setup message");
            }
            Err(VoiceError::ChannelClosed)
        })
        .await
        .map_err(|_| VoiceError::Channel("setup handshake timed out".to_string()))??;

        info!("✅ Live agent ready");

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutboundAudio>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<AgentEvent>();
        let (close_tx, mut close_rx) = oneshot::channel::<()>();
        let output_rate = self.output_sample_rate;
        let output_channels = self.output_channels;
        let capture_rate = self.capture_sample_rate;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut close_rx => {
                        let _ = sink.send(Message::Close(None)).await;
                        debug!("agent socket closed locally");
                        break;
                    }
                    Some(audio) = out_rx.recv() => {
                        let rate = if audio.sample_rate == 0 { capture_rate } else { audio.sample_rate };
                        if let Err(e) = sink.send(Message::Text(realtime_input(&audio.data, rate))).await {
                            let _ = in_tx.send(AgentEvent::Error(e.to_string()));
                            break;
                        }
                    }
                    msg = stream.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            for event in parse_server_message(&text, output_rate, output_channels) {
                                let _ = in_tx.send(event);
                            }
                        }
                        Some(Ok(Message::Binary(bytes))) => {
                            let text = String::from_utf8_lossy(&bytes);
                            for event in parse_server_message(&text, output_rate, output_channels) {
                                let _ = in_tx.send(event);
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let reason = frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty());
                            let _ = in_tx.send(AgentEvent::Closed { reason });
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            let _ = in_tx.send(AgentEvent::Error(e.to_string()));
                            break;
                        }
                        None => {
                            let _ = in_tx.send(AgentEvent::Closed { reason: None });
                            break;
                        }
                    },
                }
            }
        });

        Ok(AgentLink::new(out_tx, in_rx, close_tx))
    }
}

/// `realtimeInput` message for one PCM16 chunk.
pub fn realtime_input(data: &str, sample_rate: u32) -> String {
    serde_json::json!({
        "realtimeInput": {
            "mediaChunks": [{
                "mimeType": format!("audio/pcm;rate={}", sample_rate),
                "data": data,
            }]
        }
    })
    .to_string()
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
    go_away: Option<serde_json::Value>,
    error: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    interrupted: bool,
    turn_complete: bool,
    input_transcription: Option<Transcription>,
    output_transcription: Option<Transcription>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ModelTurn {
    parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Part {
    inline_data: Option<InlineData>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Transcription {
    text: String,
    finished: Option<bool>,
}

/// Read `rate=` and `channels=` parameters from a PCM mime type.
fn pcm_params(mime_type: &str, default_rate: u32, default_channels: u16) -> (u32, u16) {
    let mut rate = default_rate;
    let mut channels = default_channels;
    for param in mime_type.split(';').skip(1) {
        match param.trim().split_once('=') {
            Some(("rate", v)) => rate = v.trim().parse().unwrap_or(default_rate),
            Some(("channels", v)) => channels = v.trim().parse().unwrap_or(default_channels),
            _ => {}
        }
    }
    (rate, channels)
}

/// Translate one server message into events, in the order the session should
/// apply them: interruption first, then transcripts and audio, then turn end.
pub fn parse_server_message(text: &str, output_rate: u32, output_channels: u16) -> Vec<AgentEvent> {
    let msg: ServerMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("Dropping unparseable agent message: {}", e);
            return Vec::new();
        }
    };

    let mut events = Vec::new();

    if let Some(err) = msg.error {
        events.push(AgentEvent::Error(err.to_string()));
    }

    if let Some(content) = msg.server_content {
        if content.interrupted {
            events.push(AgentEvent::Interrupted);
        }
        if let Some(t) = content.input_transcription.filter(|t| !t.text.is_empty()) {
            events.push(AgentEvent::InputTranscript {
                partial: t.finished != Some(true),
                text: t.text,
            });
        }
        if let Some(turn) = content.model_turn {
            for inline in turn.parts.into_iter().filter_map(|p| p.inline_data) {
                if !inline.mime_type.starts_with("audio/pcm") {
                    debug!(mime = %inline.mime_type, "skipping non-PCM part");
                    continue;
                }
                let (sample_rate, channels) =
                    pcm_params(&inline.mime_type, output_rate, output_channels);
                match B64.decode(inline.data.as_bytes()) {
                    Ok(data) => events.push(AgentEvent::Audio(InboundAudio {
                        data,
                        sample_rate,
                        channels,
                    })),
                    Err(e) => warn!("Dropping audio part with invalid base64: {}", e),
                }
            }
        }
        if let Some(t) = content.output_transcription.filter(|t| !t.text.is_empty()) {
            events.push(AgentEvent::OutputTranscript { text: t.text });
        }
        if content.turn_complete {
            events.push(AgentEvent::TurnComplete);
        }
    }

    if msg.go_away.is_some() {
        events.push(AgentEvent::Closed {
            reason: Some("server requested disconnect".to_string()),
        });
    }

    events
}
