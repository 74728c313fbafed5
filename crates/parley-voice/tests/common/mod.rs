//! In-memory devices, agent and narration service for integration tests.
//!
//! Every fake writes into one shared [`Recorder`] so tests can assert on the
//! order resources were acquired and released.

#![allow(dead_code)]

use async_trait::async_trait;
use parley_voice::{
    AgentConnector, AgentEvent, AgentLink, AudioBackend, AudioChunk, AudioConfig, CaptureStream,
    DecodedBuffer, NarrationAudio, NarrationClient, NarrationSegment, OutboundAudio, OutputDevice,
    PlaybackId, VoiceError, VoiceResult,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub struct Played {
    pub id: PlaybackId,
    pub start_at: f64,
    pub duration: f64,
}

#[derive(Default)]
pub struct Record {
    pub log: Vec<&'static str>,
    pub played: Vec<Played>,
    pub stopped: Vec<PlaybackId>,
    pub chunk_tx: Option<mpsc::UnboundedSender<AudioChunk>>,
    pub fail_capture: bool,
    pub fail_output: bool,
    /// Make the microphone's stop and close both fail.
    pub fail_capture_release: bool,
}

/// Shared view of everything the fakes did.
#[derive(Clone)]
pub struct Recorder {
    inner: Arc<Mutex<Record>>,
    epoch: Instant,
}

impl Recorder {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Record::default())),
            epoch: Instant::now(),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut Record) -> R) -> R {
        f(&mut self.inner.lock().unwrap())
    }

    pub fn log(&self) -> Vec<&'static str> {
        self.with(|r| r.log.clone())
    }

    pub fn count(&self, entry: &str) -> usize {
        self.with(|r| r.log.iter().filter(|e| **e == entry).count())
    }

    pub fn played(&self) -> Vec<Played> {
        self.with(|r| r.played.clone())
    }

    pub fn stopped(&self) -> Vec<PlaybackId> {
        self.with(|r| r.stopped.clone())
    }

    /// Device clock shared by every fake output, in seconds.
    pub fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    /// Push one microphone block as if the capture callback fired.
    pub fn capture(&self, samples: Vec<f32>) {
        let tx = self.with(|r| r.chunk_tx.clone()).expect("capture not open");
        tx.send(AudioChunk {
            samples,
            timestamp: std::time::Instant::now(),
        })
        .expect("session gone");
    }
}

struct FakeCapture {
    rec: Recorder,
}

impl CaptureStream for FakeCapture {
    fn stop(&mut self) -> VoiceResult<()> {
        self.rec.with(|r| {
            if r.fail_capture_release {
                return Err(VoiceError::AudioDevice("microphone stuck".to_string()));
            }
            r.log.push("capture_stop");
            Ok(())
        })
    }

    fn close(&mut self) -> VoiceResult<()> {
        self.rec.with(|r| {
            if r.fail_capture_release {
                return Err(VoiceError::AudioDevice("capture context stuck".to_string()));
            }
            r.log.push("capture_close");
            r.chunk_tx = None;
            Ok(())
        })
    }
}

struct FakeOutput {
    rec: Recorder,
}

impl OutputDevice for FakeOutput {
    fn now(&self) -> f64 {
        self.rec.now()
    }

    fn play(&mut self, id: PlaybackId, buffer: &DecodedBuffer, start_at: f64) -> VoiceResult<()> {
        self.rec.with(|r| {
            r.played.push(Played {
                id,
                start_at,
                duration: buffer.duration(),
            })
        });
        Ok(())
    }

    fn stop(&mut self, id: PlaybackId) -> VoiceResult<()> {
        self.rec.with(|r| r.stopped.push(id));
        Ok(())
    }

    fn release(&mut self, _id: PlaybackId) {}

    fn close(&mut self) -> VoiceResult<()> {
        self.rec.with(|r| r.log.push("output_close"));
        Ok(())
    }
}

pub struct FakeBackend {
    pub rec: Recorder,
}

impl AudioBackend for FakeBackend {
    fn open_capture(
        &self,
        _config: &AudioConfig,
        chunk_tx: mpsc::UnboundedSender<AudioChunk>,
    ) -> VoiceResult<Box<dyn CaptureStream>> {
        self.rec.with(|r| {
            if r.fail_capture {
                return Err(VoiceError::AudioDevice("no microphone".to_string()));
            }
            r.log.push("capture_open");
            r.chunk_tx = Some(chunk_tx);
            Ok(())
        })?;
        Ok(Box::new(FakeCapture { rec: self.rec.clone() }))
    }

    fn open_output(&self, _config: &AudioConfig) -> VoiceResult<Box<dyn OutputDevice>> {
        self.rec.with(|r| {
            if r.fail_output {
                return Err(VoiceError::AudioDevice("no speakers".to_string()));
            }
            r.log.push("output_open");
            Ok(())
        })?;
        Ok(Box::new(FakeOutput { rec: self.rec.clone() }))
    }
}

/// The agent's side of one fake link.
pub struct RemoteAgent {
    pub outbound: mpsc::UnboundedReceiver<OutboundAudio>,
    pub inbound: mpsc::UnboundedSender<AgentEvent>,
    pub closed: oneshot::Receiver<()>,
}

impl RemoteAgent {
    pub fn send(&self, event: AgentEvent) {
        self.inbound.send(event).expect("session dropped its link");
    }
}

#[derive(Default)]
pub struct FakeConnector {
    pub fail: Mutex<bool>,
    remotes: Mutex<Vec<RemoteAgent>>,
}

impl FakeConnector {
    pub fn fail_next(&self) {
        *self.fail.lock().unwrap() = true;
    }

    /// The remote end of the most recent link.
    pub fn take_remote(&self) -> RemoteAgent {
        self.remotes.lock().unwrap().pop().expect("no link opened")
    }
}

#[async_trait]
impl AgentConnector for FakeConnector {
    async fn connect(&self) -> VoiceResult<AgentLink> {
        if std::mem::take(&mut *self.fail.lock().unwrap()) {
            return Err(VoiceError::Channel("handshake refused".to_string()));
        }
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = oneshot::channel();
        self.remotes.lock().unwrap().push(RemoteAgent {
            outbound: out_rx,
            inbound: in_tx,
            closed: close_rx,
        });
        Ok(AgentLink::new(out_tx, in_rx, close_tx))
    }
}

/// Narration service that returns a fixed clip after a delay.
pub struct FakeNarration {
    pub seconds: f64,
    pub latency: Duration,
    pub fail: bool,
}

#[async_trait]
impl NarrationClient for FakeNarration {
    async fn synthesize(&self, segments: &[NarrationSegment]) -> VoiceResult<NarrationAudio> {
        if segments.is_empty() {
            return Err(VoiceError::Config("narration script is empty".to_string()));
        }
        tokio::time::sleep(self.latency).await;
        if self.fail {
            return Err(VoiceError::Narration("service unavailable".to_string()));
        }
        Ok(NarrationAudio {
            data: tone_pcm(self.seconds, 24000),
            sample_rate: 24000,
            channels: 1,
        })
    }
}

/// Mono PCM16 little-endian bytes of a quiet square wave.
pub fn tone_pcm(seconds: f64, sample_rate: u32) -> Vec<u8> {
    let frames = (seconds * sample_rate as f64).round() as usize;
    (0..frames)
        .flat_map(|i| {
            let v: i16 = if (i / 40) % 2 == 0 { 4000 } else { -4000 };
            v.to_le_bytes()
        })
        .collect()
}

pub fn agent_audio(seconds: f64) -> AgentEvent {
    AgentEvent::Audio(parley_voice::InboundAudio {
        data: tone_pcm(seconds, 24000),
        sample_rate: 24000,
        channels: 1,
    })
}

/// Let the session task drain its queue.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
