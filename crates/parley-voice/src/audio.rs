//! Audio device seams: microphone capture and scheduled output.
//!
//! The session loop only ever talks to these traits. `SystemAudioBackend`
//! wires them to CPAL (capture) and Rodio (output); tests swap in fakes.

use crate::capture::CpalCapture;
use crate::error::{VoiceError, VoiceResult};
use crate::output::RodioOutput;
use crate::pcm::DecodedBuffer;
use serde::Deserialize;
use tokio::sync::mpsc;

/// Audio configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Capture sample rate in Hz, the rate the agent expects for input (default: 16000)
    pub capture_sample_rate: u32,

    /// Output sample rate in Hz, the rate the agent renders at (default: 24000)
    pub output_sample_rate: u32,

    /// Samples per capture block (default: 2048, 128ms at 16kHz)
    pub capture_block_size: usize,

    /// Output channel count for inbound frames (default: 1)
    pub output_channels: u16,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            capture_sample_rate: 16000,
            output_sample_rate: 24000,
            capture_block_size: 2048,
            output_channels: 1,
        }
    }
}

/// Audio chunk sent from the capture thread
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Audio samples (f32, normalized to -1.0 to 1.0)
    pub samples: Vec<f32>,

    /// Timestamp when captured
    pub timestamp: std::time::Instant,
}

/// Identifier the scheduler assigns to each buffer handed to an output device.
pub type PlaybackId = u64;

/// An open microphone.
///
/// Blocks arrive on the channel passed to [`AudioBackend::open_capture`].
pub trait CaptureStream: Send {
    /// Stop delivering samples and release the microphone.
    fn stop(&mut self) -> VoiceResult<()>;

    /// Tear down the capture context. Called after `stop`.
    fn close(&mut self) -> VoiceResult<()>;
}

/// An open output device with a monotonic clock.
pub trait OutputDevice: Send {
    /// Current device clock in seconds. Never decreases.
    fn now(&self) -> f64;

    /// Start `buffer` at device time `start_at` (≥ `now()`).
    fn play(&mut self, id: PlaybackId, buffer: &DecodedBuffer, start_at: f64) -> VoiceResult<()>;

    /// Stop a buffer immediately. Unknown or finished ids are a no-op.
    ///
    /// A device that queues buffers back to back may also stop everything
    /// queued with it; the scheduler only stops buffers as a full flush.
    fn stop(&mut self, id: PlaybackId) -> VoiceResult<()>;

    /// Drop resources for a buffer that finished on its own.
    fn release(&mut self, id: PlaybackId);

    /// Close the output context.
    fn close(&mut self) -> VoiceResult<()>;
}

/// Opens capture and output devices.
pub trait AudioBackend: Send + Sync {
    fn open_capture(
        &self,
        config: &AudioConfig,
        chunk_tx: mpsc::UnboundedSender<AudioChunk>,
    ) -> VoiceResult<Box<dyn CaptureStream>>;

    fn open_output(&self, config: &AudioConfig) -> VoiceResult<Box<dyn OutputDevice>>;
}

/// Default host devices via CPAL and Rodio.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAudioBackend;

impl AudioBackend for SystemAudioBackend {
    fn open_capture(
        &self,
        config: &AudioConfig,
        chunk_tx: mpsc::UnboundedSender<AudioChunk>,
    ) -> VoiceResult<Box<dyn CaptureStream>> {
        Ok(Box::new(CpalCapture::open(config, chunk_tx)?))
    }

    fn open_output(&self, config: &AudioConfig) -> VoiceResult<Box<dyn OutputDevice>> {
        Ok(Box::new(RodioOutput::open(config)?))
    }
}

/// Run a blocking device call (open, join, close) on the blocking pool.
pub(crate) async fn off_runtime<T, F>(f: F) -> VoiceResult<T>
where
    F: FnOnce() -> VoiceResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| VoiceError::AudioDevice(format!("device task failed: {}", e)))?
}
