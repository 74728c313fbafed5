//! The remote agent as a typed event source/sink.
//!
//! A connector performs the handshake and hands back an [`AgentLink`]: an
//! unbounded outbound sender (so transmitting a capture block never waits),
//! an inbound event receiver, and a close signal for the transport.

use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// One encoded capture block on its way to the agent.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundAudio {
    /// Base64 PCM16 little-endian.
    pub data: String,
    pub sample_rate: u32,
}

/// Inbound audio payload, still encoded.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundAudio {
    /// Raw PCM16 little-endian bytes.
    pub data: Vec<u8>,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Events the agent can push at any time.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Audio(InboundAudio),
    /// User speech cut off the agent's current utterance.
    Interrupted,
    /// The agent finished its turn.
    TurnComplete,
    /// Transcription of the user's speech.
    InputTranscript { text: String, partial: bool },
    /// Transcription of the agent's speech.
    OutputTranscript { text: String },
    /// The remote side closed the channel.
    Closed { reason: Option<String> },
    /// Unrecoverable transport or protocol failure.
    Error(String),
}

/// An open channel to the agent.
pub struct AgentLink {
    outbound: Option<mpsc::UnboundedSender<OutboundAudio>>,
    inbound: mpsc::UnboundedReceiver<AgentEvent>,
    close_tx: Option<oneshot::Sender<()>>,
}

impl AgentLink {
    pub fn new(
        outbound: mpsc::UnboundedSender<OutboundAudio>,
        inbound: mpsc::UnboundedReceiver<AgentEvent>,
        close_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            outbound: Some(outbound),
            inbound,
            close_tx: Some(close_tx),
        }
    }

    /// Queue a block for transmission. Never waits.
    pub fn send_audio(&self, audio: OutboundAudio) -> VoiceResult<()> {
        match &self.outbound {
            Some(tx) => tx
                .send(audio)
                .map_err(|e| VoiceError::ChannelSend(e.to_string())),
            None => Err(VoiceError::ChannelClosed),
        }
    }

    /// Next inbound event, `None` once the transport is gone.
    pub async fn next_event(&mut self) -> Option<AgentEvent> {
        self.inbound.recv().await
    }

    /// Ask the transport to close. Idempotent.
    pub fn close(&mut self) -> VoiceResult<()> {
        self.outbound = None;
        self.inbound.close();
        match self.close_tx.take() {
            Some(tx) => {
                debug!("closing agent link");
                // The transport may already be gone; that is fine
                let _ = tx.send(());
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for AgentLink {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Opens channels to the agent. Resolves once the handshake completes.
#[async_trait]
pub trait AgentConnector: Send + Sync {
    async fn connect(&self) -> VoiceResult<AgentLink>;
}
