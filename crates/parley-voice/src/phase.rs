//! Session phase: what the system is doing right now.
//!
//! `reduce` is a pure, total function over [`PhaseSignal`]. [`PhaseBus`] holds
//! the current state in a `watch` channel so the session loop, the narrated
//! player and any UI observe the same value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// The closed set of phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    #[default]
    Idle,
    Listening,
    Thinking,
    Synthesizing,
    Speaking,
    Reflecting,
    GeneratingAudio,
    Explaining,
    Error,
}

impl Phase {
    pub const ALL: [Phase; 9] = [
        Phase::Idle,
        Phase::Listening,
        Phase::Thinking,
        Phase::Synthesizing,
        Phase::Speaking,
        Phase::Reflecting,
        Phase::GeneratingAudio,
        Phase::Explaining,
        Phase::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Listening => "listening",
            Phase::Thinking => "thinking",
            Phase::Synthesizing => "synthesizing",
            Phase::Speaking => "speaking",
            Phase::Reflecting => "reflecting",
            Phase::GeneratingAudio => "generating-audio",
            Phase::Explaining => "explaining",
            Phase::Error => "error",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Full phase state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PhaseState {
    pub phase: Phase,
    /// Visual energy, 0.0..=1.0.
    pub intensity: f32,
    pub confidence: f32,
    pub interruptible: bool,
    pub transcript: String,
    pub partial_transcript: String,
    /// Narration synthesis progress, 0.0..=1.0.
    pub synthesis_progress: f32,
    pub last_utterance_ts: Option<DateTime<Utc>>,
}

impl PhaseState {
    /// The idle state every `Reset` returns to.
    pub fn initial() -> Self {
        Self::default()
    }
}

/// Inputs to the reducer.
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseSignal {
    SetPhase(Phase),
    SetIntensity(f32),
    SetConfidence(f32),
    SetTranscript { text: String, partial: bool },
    SetProgress(f32),
    Interrupt,
    Reset,
    SetInterruptible(bool),
    MarkUtterance(DateTime<Utc>),
}

fn unit(v: f32) -> f32 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

/// Apply one signal. Pure and total.
pub fn reduce(state: &PhaseState, signal: PhaseSignal) -> PhaseState {
    let mut next = state.clone();
    match signal {
        PhaseSignal::SetPhase(phase) => next.phase = phase,
        PhaseSignal::SetIntensity(v) => next.intensity = unit(v),
        PhaseSignal::SetConfidence(v) => next.confidence = unit(v),
        PhaseSignal::SetTranscript { text, partial } => {
            if partial {
                next.partial_transcript = text;
            } else {
                next.transcript = text;
                next.partial_transcript.clear();
            }
        }
        PhaseSignal::SetProgress(v) => next.synthesis_progress = unit(v),
        PhaseSignal::Interrupt => {
            next.phase = Phase::Explaining;
            next.intensity = 0.0;
            next.partial_transcript.clear();
        }
        PhaseSignal::Reset => next = PhaseState::initial(),
        PhaseSignal::SetInterruptible(b) => next.interruptible = b,
        PhaseSignal::MarkUtterance(ts) => next.last_utterance_ts = Some(ts),
    }
    next
}

/// Shared, observable phase state.
#[derive(Debug, Clone)]
pub struct PhaseBus {
    tx: Arc<watch::Sender<PhaseState>>,
}

impl PhaseBus {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(PhaseState::initial());
        Self { tx: Arc::new(tx) }
    }

    /// Apply a signal and notify subscribers if anything changed.
    pub fn dispatch(&self, signal: PhaseSignal) {
        self.tx.send_if_modified(|state| {
            let next = reduce(state, signal);
            if next == *state {
                return false;
            }
            if next.phase != state.phase {
                debug!(from = %state.phase, to = %next.phase, "phase transition");
            }
            *state = next;
            true
        });
    }

    /// Dispatch several signals in order.
    pub fn dispatch_all<I: IntoIterator<Item = PhaseSignal>>(&self, signals: I) {
        for signal in signals {
            self.dispatch(signal);
        }
    }

    pub fn snapshot(&self) -> PhaseState {
        self.tx.borrow().clone()
    }

    pub fn phase(&self) -> Phase {
        self.tx.borrow().phase
    }

    pub fn subscribe(&self) -> watch::Receiver<PhaseState> {
        self.tx.subscribe()
    }
}

impl Default for PhaseBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn busy_state() -> PhaseState {
        PhaseState {
            phase: Phase::Speaking,
            intensity: 0.8,
            confidence: 0.6,
            interruptible: true,
            transcript: "hello".to_string(),
            partial_transcript: "wor".to_string(),
            synthesis_progress: 0.4,
            last_utterance_ts: Some(Utc::now()),
        }
    }

    fn all_signals() -> Vec<PhaseSignal> {
        let mut signals: Vec<PhaseSignal> = Phase::ALL.iter().map(|p| PhaseSignal::SetPhase(*p)).collect();
        signals.extend([
            PhaseSignal::SetIntensity(0.3),
            PhaseSignal::SetConfidence(0.9),
            PhaseSignal::SetTranscript { text: "a".to_string(), partial: true },
            PhaseSignal::SetTranscript { text: "b".to_string(), partial: false },
            PhaseSignal::SetProgress(0.5),
            PhaseSignal::Interrupt,
            PhaseSignal::Reset,
            PhaseSignal::SetInterruptible(false),
            PhaseSignal::MarkUtterance(Utc::now()),
        ]);
        signals
    }

    #[test]
    fn set_phase_touches_only_phase() {
        let state = busy_state();
        let next = reduce(&state, PhaseSignal::SetPhase(Phase::Thinking));
        assert_eq!(next.phase, Phase::Thinking);
        assert_eq!(PhaseState { phase: state.phase, ..next }, state);
    }

    #[test]
    fn partial_transcript_keeps_final() {
        let next = reduce(
            &busy_state(),
            PhaseSignal::SetTranscript { text: "world".to_string(), partial: true },
        );
        assert_eq!(next.transcript, "hello");
        assert_eq!(next.partial_transcript, "world");
    }

    #[test]
    fn final_transcript_clears_partial() {
        let next = reduce(
            &busy_state(),
            PhaseSignal::SetTranscript { text: "hello world".to_string(), partial: false },
        );
        assert_eq!(next.transcript, "hello world");
        assert!(next.partial_transcript.is_empty());
    }

    #[test]
    fn interrupt_explains_with_zero_intensity() {
        let state = busy_state();
        let next = reduce(&state, PhaseSignal::Interrupt);
        assert_eq!(next.phase, Phase::Explaining);
        assert_eq!(next.intensity, 0.0);
        assert!(next.partial_transcript.is_empty());
        assert_eq!(next.transcript, state.transcript);
        assert_eq!(next.confidence, state.confidence);
    }

    #[test]
    fn reset_from_any_state_is_initial() {
        for phase in Phase::ALL {
            let state = PhaseState { phase, ..busy_state() };
            assert_eq!(reduce(&state, PhaseSignal::Reset), PhaseState::initial());
        }
    }

    #[test]
    fn reducer_is_total_over_every_pair() {
        for phase in Phase::ALL {
            let state = PhaseState { phase, ..busy_state() };
            for signal in all_signals() {
                let next = reduce(&state, signal);
                assert!(Phase::ALL.contains(&next.phase));
                assert!((0.0..=1.0).contains(&next.intensity));
            }
        }
    }

    #[test]
    fn numeric_inputs_are_clamped() {
        let state = PhaseState::initial();
        assert_eq!(reduce(&state, PhaseSignal::SetIntensity(4.0)).intensity, 1.0);
        assert_eq!(reduce(&state, PhaseSignal::SetConfidence(-1.0)).confidence, 0.0);
        assert_eq!(reduce(&state, PhaseSignal::SetProgress(f32::NAN)).synthesis_progress, 0.0);
    }

    #[test]
    fn phase_names_are_kebab_case() {
        let json = serde_json::to_string(&Phase::GeneratingAudio).unwrap();
        assert_eq!(json, "\"generating-audio\"");
        for phase in Phase::ALL {
            let json = serde_json::to_string(&phase).unwrap();
            assert_eq!(json, format!("\"{}\"", phase.as_str()));
        }
    }

    #[tokio::test]
    async fn bus_notifies_subscribers() {
        let bus = PhaseBus::new();
        let mut rx = bus.subscribe();
        bus.dispatch(PhaseSignal::SetPhase(Phase::Listening));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().phase, Phase::Listening);

        // No-op signals do not wake subscribers
        bus.dispatch(PhaseSignal::SetPhase(Phase::Listening));
        assert!(!rx.has_changed().unwrap());
    }
}
