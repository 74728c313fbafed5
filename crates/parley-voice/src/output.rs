//! **RodioOutput**: output device for scheduled playback.
//!
//! All buffers go into one `rodio::Sink` in the order they are scheduled, so
//! back-to-back buffers are sample-contiguous. A gap in the schedule is
//! filled with silence. Stopping clears the whole queue and swaps in a fresh
//! sink, which is what interruption needs. The `OutputStream` itself is
//! `!Send` and is parked on a dedicated thread until the device is closed.

use crate::audio::{AudioConfig, OutputDevice, PlaybackId};
use crate::error::{VoiceError, VoiceResult};
use crate::pcm::DecodedBuffer;
use rodio::buffer::SamplesBuffer;
use rodio::source::Zero;
use rodio::{OutputStream, OutputStreamHandle, Sink, Source};
use std::collections::BTreeSet;
use std::sync::mpsc as std_mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Schedule gaps shorter than this are treated as contiguous.
const MIN_GAP_SECS: f64 = 1e-4;

/// Output device on the default host output, clocked from when it was opened.
pub struct RodioOutput {
    handle: OutputStreamHandle,
    sink: Sink,
    /// Buffers appended to `sink` that have not been stopped or released.
    queued: BTreeSet<PlaybackId>,
    /// Device time at which everything appended so far ends.
    tail: f64,
    epoch: Instant,
    shutdown: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl RodioOutput {
    /// Open the default output device.
    pub fn open(config: &AudioConfig) -> VoiceResult<Self> {
        info!(
            "🔊 Initializing audio output ({}Hz, {} channel(s))",
            config.output_sample_rate, config.output_channels
        );

        let (ready_tx, ready_rx) = std_mpsc::channel::<VoiceResult<OutputStreamHandle>>();
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();

        let thread = thread::Builder::new()
            .name("parley-output".to_string())
            .spawn(move || {
                let (stream, handle) = match OutputStream::try_default() {
                    Ok(pair) => pair,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.into()));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(handle));
                // Park until closed (an Err means the owner was dropped)
                let _ = shutdown_rx.recv();
                drop(stream);
                debug!("Output thread exiting");
            })?;

        let handle = match ready_rx.recv() {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(VoiceError::Playback(
                    "output thread exited during startup".to_string(),
                ));
            }
        };

        let sink = match Sink::try_new(&handle) {
            Ok(sink) => sink,
            Err(e) => {
                let _ = shutdown_tx.send(());
                let _ = thread.join();
                return Err(e.into());
            }
        };

        info!("✅ Audio output initialized");

        Ok(Self {
            handle,
            sink,
            queued: BTreeSet::new(),
            tail: 0.0,
            epoch: Instant::now(),
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }
}

impl OutputDevice for RodioOutput {
    fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    fn play(&mut self, id: PlaybackId, buffer: &DecodedBuffer, start_at: f64) -> VoiceResult<()> {
        if self.shutdown.is_none() {
            return Err(VoiceError::Playback("output device is closed".to_string()));
        }
        let channels = buffer.channels();
        let sample_rate = buffer.sample_rate();

        let queue_end = self.tail.max(self.now());
        let gap = start_at - queue_end;
        if gap > MIN_GAP_SECS {
            self.sink.append(
                Zero::<f32>::new(channels, sample_rate).take_duration(Duration::from_secs_f64(gap)),
            );
        }
        self.sink
            .append(SamplesBuffer::new(channels, sample_rate, buffer.interleaved()));
        self.queued.insert(id);
        self.tail = queue_end + gap.max(0.0) + buffer.duration();
        Ok(())
    }

    /// Stops `id` along with everything queued with it.
    fn stop(&mut self, id: PlaybackId) -> VoiceResult<()> {
        if !self.queued.contains(&id) {
            return Ok(());
        }
        self.sink.stop();
        self.sink = Sink::try_new(&self.handle)?;
        debug!(stopped = self.queued.len(), "output queue cleared");
        self.queued.clear();
        self.tail = self.now();
        Ok(())
    }

    fn release(&mut self, id: PlaybackId) {
        self.queued.remove(&id);
    }

    fn close(&mut self) -> VoiceResult<()> {
        self.sink.stop();
        self.queued.clear();
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.thread.take() {
            handle
                .join()
                .map_err(|_| VoiceError::Playback("output thread panicked".to_string()))?;
            info!("⏹️ Audio output closed");
        }
        Ok(())
    }
}

impl Drop for RodioOutput {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close output device: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore] // Requires an output device
    fn test_output_plays_and_closes() {
        let mut output = RodioOutput::open(&AudioConfig::default()).unwrap();
        let buffer = DecodedBuffer::mono(vec![0.0; 2400], 24000).unwrap();
        let start = output.now();
        output.play(1, &buffer, start).unwrap();
        output.play(2, &buffer, start + buffer.duration()).unwrap();
        output.stop(1).unwrap();
        // Already cleared with 1
        output.stop(2).unwrap();
        output.play(3, &buffer, output.now()).unwrap();
        output.close().unwrap();
        assert!(output.play(2, &buffer, output.now()).is_err());
    }
}
