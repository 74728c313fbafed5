//! Microphone capture using CPAL
//!
//! The CPAL stream is `!Send` on some platforms, so it lives on a dedicated
//! thread for its whole life. The session only holds a command handle.

use crate::audio::{AudioChunk, AudioConfig, CaptureStream};
use crate::error::{VoiceError, VoiceResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Stream, StreamConfig};
use std::sync::mpsc as std_mpsc;
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

enum CaptureCommand {
    Pause,
    Shutdown,
}

/// Audio capture system using CPAL
pub struct CpalCapture {
    commands: Option<std_mpsc::Sender<CaptureCommand>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalCapture {
    /// Open the default input device and start delivering blocks of
    /// `capture_block_size` samples to `chunk_tx`.
    ///
    /// Returns once the stream is playing, or with the device error.
    pub fn open(
        config: &AudioConfig,
        chunk_tx: mpsc::UnboundedSender<AudioChunk>,
    ) -> VoiceResult<Self> {
        info!(
            "🎤 Initializing audio capture ({}Hz, {} samples per block)",
            config.capture_sample_rate, config.capture_block_size
        );

        let (ready_tx, ready_rx) = std_mpsc::channel::<VoiceResult<()>>();
        let (cmd_tx, cmd_rx) = std_mpsc::channel::<CaptureCommand>();
        let config = config.clone();

        let thread = thread::Builder::new()
            .name("parley-capture".to_string())
            .spawn(move || {
                let stream = match build_input_stream(&config, chunk_tx) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                // Sender dropped counts as shutdown
                while let Ok(cmd) = cmd_rx.recv() {
                    match cmd {
                        CaptureCommand::Pause => {
                            if let Err(e) = stream.pause() {
                                warn!("Failed to pause capture stream: {}", e);
                            }
                        }
                        CaptureCommand::Shutdown => break,
                    }
                }
                drop(stream);
                debug!("Capture thread exiting");
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!("✅ Audio capture started");
                Ok(Self {
                    commands: Some(cmd_tx),
                    thread: Some(thread),
                })
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(VoiceError::AudioDevice(
                    "capture thread exited during startup".to_string(),
                ))
            }
        }
    }

    /// List available input devices
    pub fn list_input_devices() -> VoiceResult<Vec<String>> {
        let host = cpal::default_host();
        let devices = host.input_devices()?;

        let mut device_names = Vec::new();
        for device in devices {
            if let Ok(name) = device.name() {
                device_names.push(name);
            }
        }

        Ok(device_names)
    }
}

impl CaptureStream for CpalCapture {
    fn stop(&mut self) -> VoiceResult<()> {
        match self.commands.as_ref() {
            Some(tx) => tx
                .send(CaptureCommand::Pause)
                .map_err(|_| VoiceError::AudioStream("capture thread already gone".to_string())),
            None => Ok(()),
        }
    }

    fn close(&mut self) -> VoiceResult<()> {
        if let Some(tx) = self.commands.take() {
            let _ = tx.send(CaptureCommand::Shutdown);
        }
        if let Some(handle) = self.thread.take() {
            handle
                .join()
                .map_err(|_| VoiceError::AudioStream("capture thread panicked".to_string()))?;
            info!("⏹️ Audio capture closed");
        }
        Ok(())
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn build_input_stream(
    config: &AudioConfig,
    chunk_tx: mpsc::UnboundedSender<AudioChunk>,
) -> VoiceResult<Stream> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| VoiceError::AudioDevice("No input device available".to_string()))?;

    info!(
        "📱 Using input device: {}",
        device.name().unwrap_or_else(|_| "Unknown".to_string())
    );

    let default_config = device.default_input_config()?;
    debug!("🔧 Default config: {:?}", default_config);

    let stream_config = StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(config.capture_sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let block_size = config.capture_block_size.max(1);
    let mut block = Vec::with_capacity(block_size);

    let stream = device.build_input_stream(
        &stream_config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            for &sample in data {
                block.push(sample);

                if block.len() >= block_size {
                    let chunk = AudioChunk {
                        samples: std::mem::replace(&mut block, Vec::with_capacity(block_size)),
                        timestamp: std::time::Instant::now(),
                    };
                    // Receiver gone means the session is tearing down
                    if chunk_tx.send(chunk).is_err() {
                        return;
                    }
                }
            }
        },
        move |err| {
            warn!("Audio stream error: {}", err);
        },
        None,
    )?;

    stream.play()?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_devices() {
        // This might fail in CI environments without audio devices
        let result = CpalCapture::list_input_devices();
        if let Ok(devices) = result {
            println!("Available input devices: {:?}", devices);
        }
    }

    #[test]
    #[ignore] // Requires a microphone
    fn test_capture_open_and_close() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut capture = CpalCapture::open(&AudioConfig::default(), tx).unwrap();
        capture.stop().unwrap();
        capture.close().unwrap();
        // Second close is a no-op
        capture.close().unwrap();
    }
}
