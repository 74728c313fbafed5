//! Gapless playback scheduling with interruption.
//!
//! Inbound frames arrive in bursts that have nothing to do with the output
//! clock. The scheduler keeps a single forward-only cursor, `next_start_time`:
//! each buffer starts at `max(cursor, now)` and pushes the cursor forward by
//! its own duration, so consecutive buffers butt up against each other and
//! never overlap. `flush()` stops everything in flight and pulls the cursor
//! back to `now`; it is the only way playback is interrupted.

use crate::audio::{OutputDevice, PlaybackId};
use crate::error::VoiceResult;
use crate::pcm::DecodedBuffer;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// One buffer handed to the output device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledPlayback {
    pub id: PlaybackId,
    /// Device time the buffer starts, in seconds.
    pub start_time: f64,
    /// Buffer duration in seconds.
    pub duration: f64,
}

impl ScheduledPlayback {
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }
}

/// Owns the output device, the playback cursor and the active set.
pub struct PlaybackScheduler {
    output: Box<dyn OutputDevice>,
    next_start_time: f64,
    active: BTreeMap<PlaybackId, ScheduledPlayback>,
    next_id: PlaybackId,
}

impl PlaybackScheduler {
    pub fn new(output: Box<dyn OutputDevice>) -> Self {
        let next_start_time = output.now();
        Self {
            output,
            next_start_time,
            active: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Device clock, in seconds.
    pub fn now(&self) -> f64 {
        self.output.now()
    }

    /// Where the next buffer would start if nothing else happened.
    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    /// Schedule a buffer right after whatever is already queued.
    ///
    /// Returns `None` for an empty buffer, which is neither played nor moves
    /// the cursor.
    pub fn schedule(&mut self, buffer: &DecodedBuffer) -> VoiceResult<Option<ScheduledPlayback>> {
        self.reap_finished();

        if buffer.is_empty() {
            return Ok(None);
        }

        let now = self.output.now();
        let start_time = self.next_start_time.max(now);
        let id = self.next_id;

        self.output.play(id, buffer, start_time)?;

        let entry = ScheduledPlayback {
            id,
            start_time,
            duration: buffer.duration(),
        };
        self.next_id += 1;
        self.next_start_time = entry.end_time();
        self.active.insert(id, entry);

        debug!(
            id,
            start_time,
            duration = entry.duration,
            lead = start_time - now,
            "scheduled playback"
        );
        Ok(Some(entry))
    }

    /// Stop everything in flight and reset the cursor to `now`.
    ///
    /// Returns how many entries were stopped.
    pub fn flush(&mut self) -> usize {
        let stopped = self.active.len();
        for id in std::mem::take(&mut self.active).into_keys() {
            if let Err(e) = self.output.stop(id) {
                warn!(id, "Failed to stop scheduled playback: {}", e);
            }
        }
        self.next_start_time = self.output.now();
        if stopped > 0 {
            info!(stopped, "⏹️ Playback flushed");
        }
        stopped
    }

    /// Drop entries that have played to the end. Returns how many were removed.
    pub fn reap_finished(&mut self) -> usize {
        let now = self.output.now();
        let finished: Vec<PlaybackId> = self
            .active
            .values()
            .filter(|entry| entry.end_time() <= now)
            .map(|entry| entry.id)
            .collect();
        for id in &finished {
            self.active.remove(id);
            self.output.release(*id);
        }
        finished.len()
    }

    /// Entries still scheduled or playing.
    pub fn active_len(&mut self) -> usize {
        self.reap_finished();
        self.active.len()
    }

    /// Flush and close the output device.
    pub fn close(&mut self) -> VoiceResult<()> {
        self.flush();
        self.output.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VoiceError;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct FakeState {
        now: f64,
        played: Vec<(PlaybackId, f64)>,
        stopped: Vec<PlaybackId>,
        released: Vec<PlaybackId>,
        fail_play: bool,
    }

    #[derive(Clone, Default)]
    struct FakeOutput(Arc<Mutex<FakeState>>);

    impl FakeOutput {
        fn advance(&self, secs: f64) {
            self.0.lock().unwrap().now += secs;
        }
    }

    impl OutputDevice for FakeOutput {
        fn now(&self) -> f64 {
            self.0.lock().unwrap().now
        }
        fn play(&mut self, id: PlaybackId, _buffer: &DecodedBuffer, start_at: f64) -> VoiceResult<()> {
            let mut state = self.0.lock().unwrap();
            if state.fail_play {
                return Err(VoiceError::Playback("device gone".to_string()));
            }
            state.played.push((id, start_at));
            Ok(())
        }
        fn stop(&mut self, id: PlaybackId) -> VoiceResult<()> {
            self.0.lock().unwrap().stopped.push(id);
            Ok(())
        }
        fn release(&mut self, id: PlaybackId) {
            self.0.lock().unwrap().released.push(id);
        }
        fn close(&mut self) -> VoiceResult<()> {
            Ok(())
        }
    }

    fn half_second() -> DecodedBuffer {
        DecodedBuffer::mono(vec![0.1; 12000], 24000).unwrap()
    }

    #[test]
    fn back_to_back_buffers_are_contiguous() {
        let output = FakeOutput::default();
        output.advance(10.0);
        let mut scheduler = PlaybackScheduler::new(Box::new(output.clone()));

        let a = scheduler.schedule(&half_second()).unwrap().unwrap();
        output.advance(0.1);
        let b = scheduler.schedule(&half_second()).unwrap().unwrap();
        let c = scheduler.schedule(&half_second()).unwrap().unwrap();

        assert_eq!(a.start_time, 10.0);
        assert_eq!(b.start_time, a.end_time());
        assert_eq!(c.start_time, b.end_time());
        assert_eq!(scheduler.next_start_time(), 11.5);
    }

    #[test]
    fn active_set_empties_once_the_last_buffer_ends() {
        let output = FakeOutput::default();
        let mut scheduler = PlaybackScheduler::new(Box::new(output.clone()));
        for _ in 0..3 {
            scheduler.schedule(&half_second()).unwrap();
        }
        assert_eq!(scheduler.active_len(), 3);

        output.advance(1.4);
        assert_eq!(scheduler.active_len(), 1);
        output.advance(0.1);
        assert_eq!(scheduler.active_len(), 0);
        assert_eq!(output.0.lock().unwrap().released, vec![1, 2, 3]);
    }

    #[test]
    fn backlog_starts_at_device_time() {
        let output = FakeOutput::default();
        let mut scheduler = PlaybackScheduler::new(Box::new(output.clone()));

        scheduler.schedule(&half_second()).unwrap();
        output.advance(2.0);
        let late = scheduler.schedule(&half_second()).unwrap().unwrap();

        assert_eq!(late.start_time, 2.0);
        assert_eq!(scheduler.active_len(), 1);
    }

    #[test]
    fn empty_buffer_does_not_move_cursor() {
        let output = FakeOutput::default();
        let mut scheduler = PlaybackScheduler::new(Box::new(output.clone()));
        let empty = DecodedBuffer::mono(Vec::new(), 24000).unwrap();

        assert!(scheduler.schedule(&empty).unwrap().is_none());
        assert_eq!(scheduler.next_start_time(), 0.0);
        assert!(output.0.lock().unwrap().played.is_empty());
    }

    #[test]
    fn flush_stops_everything_and_resets_cursor() {
        let output = FakeOutput::default();
        let mut scheduler = PlaybackScheduler::new(Box::new(output.clone()));
        for _ in 0..3 {
            scheduler.schedule(&half_second()).unwrap();
        }
        output.advance(0.7);

        assert_eq!(scheduler.flush(), 3);
        assert_eq!(scheduler.active_len(), 0);
        assert_eq!(scheduler.next_start_time(), 0.7);
        assert_eq!(output.0.lock().unwrap().stopped, vec![1, 2, 3]);

        let next = scheduler.schedule(&half_second()).unwrap().unwrap();
        assert_eq!(next.start_time, 0.7);
    }

    #[test]
    fn flush_on_empty_scheduler_is_noop() {
        let output = FakeOutput::default();
        let mut scheduler = PlaybackScheduler::new(Box::new(output));
        assert_eq!(scheduler.flush(), 0);
        assert_eq!(scheduler.flush(), 0);
    }

    #[test]
    fn finished_entries_are_reaped_and_released() {
        let output = FakeOutput::default();
        let mut scheduler = PlaybackScheduler::new(Box::new(output.clone()));
        scheduler.schedule(&half_second()).unwrap();
        scheduler.schedule(&half_second()).unwrap();

        output.advance(0.5);
        assert_eq!(scheduler.active_len(), 1);
        output.advance(0.5);
        assert_eq!(scheduler.active_len(), 0);
        assert_eq!(output.0.lock().unwrap().released, vec![1, 2]);
    }

    #[test]
    fn failed_play_leaves_cursor_untouched() {
        let output = FakeOutput::default();
        let mut scheduler = PlaybackScheduler::new(Box::new(output.clone()));
        output.0.lock().unwrap().fail_play = true;

        assert!(scheduler.schedule(&half_second()).is_err());
        assert_eq!(scheduler.next_start_time(), 0.0);
        assert_eq!(scheduler.active_len(), 0);
    }
}
