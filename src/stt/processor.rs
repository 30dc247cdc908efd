//! Per-conversation streaming segmenter.
//!
//! `AudioProcessor` is the synchronous state machine behind each
//! conversation's actor: it assembles fixed VAD windows from arbitrary PCM
//! chunks, keeps a pre-roll ring so the utterance onset isn't clipped,
//! gates on a minimum voiced duration, and emits snapshots for partial and
//! final transcription.
//!
//! State machine per conversation: `Idle` → (voice above threshold) →
//! `Triggered` → (trailing silence ≥ dwell) → utterance submitted, back to
//! `Idle`. Utterances with less voiced audio than the proper-speech gate are
//! discarded as false starts.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::VadConfig;
use crate::stt::pcm_s16le_to_f32;
use crate::vad::{StreamingVad, VadEvent, threshold_for};

/// Events produced while feeding audio into the processor.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessorEvent {
    /// The current utterance crossed the proper-speech gate (once per
    /// utterance). Barge-in decisions key off this.
    ProperSpeechStart,
    /// Snapshot of the growing utterance, due for a partial transcript.
    PartialReady(Vec<f32>),
    /// The utterance ended; submit to ASR for the final transcript.
    UtteranceComplete(Vec<f32>),
    /// Voiced audio ended before the proper-speech gate; discarded.
    FalseStart { voiced_ms: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Triggered,
}

/// Streaming segmenter for one conversation.
pub struct AudioProcessor {
    vad: StreamingVad,
    state: State,
    sample_rate: u32,
    /// Residual samples that don't yet fill a VAD window.
    pending: Vec<f32>,
    /// Ring of pre-trigger audio, prepended to each utterance.
    pre_roll: VecDeque<f32>,
    pre_roll_max: usize,
    utterance: Vec<f32>,
    voiced_samples: usize,
    min_speech_samples: usize,
    proper_speech_announced: bool,
    partial_interval: Duration,
    last_partial_at: Option<Instant>,
}

impl AudioProcessor {
    /// Create a processor. `aggressiveness` comes from the conversation's
    /// config overrides and scales the energy threshold.
    pub fn new(config: &VadConfig, aggressiveness: Option<u8>, partial_interval: Duration) -> Self {
        let mut effective = config.clone();
        effective.threshold = threshold_for(config, aggressiveness);
        let pre_roll_max =
            (config.speech_pad_ms as usize * config.sample_rate as usize) / 1_000;
        let min_speech_samples =
            (config.min_speech_duration_ms as usize * config.sample_rate as usize) / 1_000;
        Self {
            vad: StreamingVad::new(&effective),
            state: State::Idle,
            sample_rate: config.sample_rate,
            pending: Vec::new(),
            pre_roll: VecDeque::with_capacity(pre_roll_max + config.window_samples),
            pre_roll_max,
            utterance: Vec::new(),
            voiced_samples: 0,
            min_speech_samples,
            proper_speech_announced: false,
            partial_interval,
            last_partial_at: None,
        }
    }

    /// Feed raw PCM s16le bytes; returns the events this chunk produced.
    pub fn push_pcm(&mut self, pcm: &[u8]) -> Vec<ProcessorEvent> {
        let samples = pcm_s16le_to_f32(pcm);
        self.push_samples(&samples)
    }

    /// Feed decoded f32 samples.
    pub fn push_samples(&mut self, samples: &[f32]) -> Vec<ProcessorEvent> {
        self.pending.extend_from_slice(samples);

        let window_samples = self.vad.window_samples();
        let mut events = Vec::new();
        while self.pending.len() >= window_samples {
            let window: Vec<f32> = self.pending.drain(..window_samples).collect();
            self.process_window(&window, &mut events);
        }
        events
    }

    fn process_window(&mut self, window: &[f32], events: &mut Vec<ProcessorEvent>) {
        let out = self.vad.process_window(window);

        match self.state {
            State::Idle => {
                if out.event == VadEvent::Start {
                    self.state = State::Triggered;
                    self.utterance.clear();
                    self.utterance.extend(self.pre_roll.iter().copied());
                    self.pre_roll.clear();
                    self.utterance.extend_from_slice(window);
                    self.voiced_samples = window.len();
                    self.proper_speech_announced = false;
                    self.last_partial_at = None;
                } else {
                    self.pre_roll.extend(window.iter().copied());
                    while self.pre_roll.len() > self.pre_roll_max {
                        let _ = self.pre_roll.pop_front();
                    }
                }
            }
            State::Triggered => {
                self.utterance.extend_from_slice(window);
                if out.is_speech {
                    self.voiced_samples += window.len();
                }

                if !self.proper_speech_announced && self.voiced_samples >= self.min_speech_samples
                {
                    self.proper_speech_announced = true;
                    events.push(ProcessorEvent::ProperSpeechStart);
                }

                if out.event == VadEvent::End {
                    self.state = State::Idle;
                    let utterance = std::mem::take(&mut self.utterance);
                    if self.voiced_samples >= self.min_speech_samples {
                        events.push(ProcessorEvent::UtteranceComplete(utterance));
                    } else {
                        events.push(ProcessorEvent::FalseStart {
                            voiced_ms: (self.voiced_samples as u64 * 1_000
                                / self.sample_rate.max(1) as u64)
                                as u32,
                        });
                    }
                    self.voiced_samples = 0;
                    self.last_partial_at = None;
                } else if self.proper_speech_announced && !self.partial_interval.is_zero() {
                    let due = self
                        .last_partial_at
                        .is_none_or(|at| at.elapsed() >= self.partial_interval);
                    if due {
                        self.last_partial_at = Some(Instant::now());
                        events.push(ProcessorEvent::PartialReady(self.utterance.clone()));
                    }
                }
            }
        }
    }

    /// Whether an utterance is currently being accumulated.
    pub fn is_triggered(&self) -> bool {
        self.state == State::Triggered
    }

    /// Drop all in-flight state and return to `Idle`.
    pub fn reset(&mut self) {
        self.vad.reset();
        self.state = State::Idle;
        self.pending.clear();
        self.pre_roll.clear();
        self.utterance.clear();
        self.voiced_samples = 0;
        self.proper_speech_announced = false;
        self.last_partial_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: usize = 160;

    fn fast_config() -> VadConfig {
        VadConfig {
            threshold: 0.01,
            window_samples: WINDOW,
            min_silence_duration_ms: 30,
            speech_pad_ms: 20,
            // Two voiced windows (20 ms) make proper speech in tests.
            min_speech_duration_ms: 20,
            sample_rate: 16_000,
        }
    }

    fn voiced(windows: usize) -> Vec<f32> {
        (0..windows * WINDOW)
            .map(|i| 0.3 * (i as f32 * 0.3).sin())
            .collect()
    }

    fn silent(windows: usize) -> Vec<f32> {
        vec![0.0; windows * WINDOW]
    }

    fn processor() -> AudioProcessor {
        AudioProcessor::new(&fast_config(), None, Duration::ZERO)
    }

    #[test]
    fn utterance_completes_after_silence_dwell() {
        let mut p = processor();
        let mut events = p.push_samples(&voiced(5));
        assert!(events.contains(&ProcessorEvent::ProperSpeechStart));
        assert!(p.is_triggered());

        events = p.push_samples(&silent(4));
        let complete = events
            .iter()
            .find_map(|e| match e {
                ProcessorEvent::UtteranceComplete(samples) => Some(samples.len()),
                _ => None,
            })
            .expect("utterance should complete");
        // Five voiced windows plus the silence appended before the dwell fired.
        assert!(complete >= 5 * WINDOW);
        assert!(!p.is_triggered());
    }

    #[test]
    fn pre_roll_is_prepended() {
        let mut p = processor();
        // Two silent windows fill the pre-roll ring (20 ms = 320 samples > ring).
        assert!(p.push_samples(&silent(2)).is_empty());
        let mut events = p.push_samples(&voiced(5));
        events.extend(p.push_samples(&silent(4)));
        let samples = events
            .iter()
            .find_map(|e| match e {
                ProcessorEvent::UtteranceComplete(s) => Some(s.clone()),
                _ => None,
            })
            .expect("utterance should complete");
        // 20 ms pre-roll = 320 samples of leading near-silence.
        assert!(samples.len() >= 5 * WINDOW + 320);
        assert!(samples[..320].iter().all(|s| s.abs() < 0.01));
    }

    #[test]
    fn short_burst_is_a_false_start() {
        let config = VadConfig {
            min_speech_duration_ms: 100, // 10 voiced windows needed
            ..fast_config()
        };
        let mut p = AudioProcessor::new(&config, None, Duration::ZERO);
        let mut events = p.push_samples(&voiced(2));
        events.extend(p.push_samples(&silent(4)));
        assert!(
            events
                .iter()
                .any(|e| matches!(e, ProcessorEvent::FalseStart { .. }))
        );
        assert!(!events.iter().any(|e| matches!(
            e,
            ProcessorEvent::UtteranceComplete(_) | ProcessorEvent::ProperSpeechStart
        )));
    }

    #[test]
    fn proper_speech_start_fires_once() {
        let mut p = processor();
        let mut starts = 0;
        for _ in 0..10 {
            let events = p.push_samples(&voiced(1));
            starts += events
                .iter()
                .filter(|e| matches!(e, ProcessorEvent::ProperSpeechStart))
                .count();
        }
        assert_eq!(starts, 1);
    }

    #[test]
    fn partials_honor_interval() {
        let mut p = AudioProcessor::new(&fast_config(), None, Duration::from_millis(1));
        let mut partials = 0;
        for _ in 0..6 {
            let events = p.push_samples(&voiced(1));
            partials += events
                .iter()
                .filter(|e| matches!(e, ProcessorEvent::PartialReady(_)))
                .count();
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(partials >= 2, "expected repeated partial snapshots");

        // Zero interval disables partials entirely.
        let mut p = processor();
        for _ in 0..6 {
            assert!(
                !p.push_samples(&voiced(1))
                    .iter()
                    .any(|e| matches!(e, ProcessorEvent::PartialReady(_)))
            );
        }
    }

    #[test]
    fn silence_only_produces_nothing() {
        let mut p = processor();
        for _ in 0..20 {
            assert!(p.push_samples(&silent(1)).is_empty());
        }
    }

    #[test]
    fn reset_returns_to_idle() {
        let mut p = processor();
        let _ = p.push_samples(&voiced(3));
        assert!(p.is_triggered());
        p.reset();
        assert!(!p.is_triggered());
        assert!(p.push_samples(&silent(1)).is_empty());
    }
}
