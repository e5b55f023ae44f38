// scheduler.rs: The synchronous tick (sample → score → lock machine →
// overlay). Never blocks and never touches the network; the async session
// loop in `stream_manager` calls into it.

use std::time::{Duration, Instant};

use crate::capture::motion::{FrameSample, MotionScorer, UNSETTLED_SCORE};
use crate::capture::sampler::{FrameSampler, VideoSource};
use crate::dispatcher::Completion;
use crate::lock::{DispatchToken, LockStateMachine, Phase, SessionState};
use crate::overlay::{self, LocalView, OverlayState};
use crate::settings::SchedulerConfig;

/// What one tick did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickReport {
    pub phase: Phase,
    pub score: f64,
    /// A new sample was taken this tick.
    pub sampled: bool,
    pub dispatch: Option<DispatchToken>,
    pub timed_out: Option<DispatchToken>,
}

/// How a completion was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// Result merged and the in-flight slot released.
    Merged,
    /// Result from an abandoned request: merged, slot untouched.
    MergedLate,
    /// Inference error recorded and slot released.
    Failed,
    /// Encoding failed; slot released, overlay unchanged.
    EncodeFailed,
    /// Error for a request that is no longer outstanding; ignored.
    Stale,
}

pub struct Scheduler {
    sampler: FrameSampler,
    scorer: MotionScorer,
    machine: LockStateMachine,
    state: SessionState,
    /// Most recent sample, kept for exactly one comparison.
    previous: Option<FrameSample>,
    score: f64,
    overlay: OverlayState,
}

impl Scheduler {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            sampler: FrameSampler::new(config.sample_interval(), config.grid_size),
            scorer: MotionScorer::new(config.sensitivity),
            machine: LockStateMachine::new(config),
            state: SessionState::new(),
            previous: None,
            score: UNSETTLED_SCORE,
            overlay: OverlayState::default(),
        }
    }

    /// Pull a sample from `source` (if one is due) and advance the machine.
    pub fn tick(&mut self, source: &mut dyn VideoSource, now: Instant) -> TickReport {
        let sample = self.sampler.sample(source, now);
        self.tick_with_sample(sample, now)
    }

    /// Advance with an already-taken sample. `None` holds the previous score.
    pub fn tick_with_sample(&mut self, sample: Option<FrameSample>, now: Instant) -> TickReport {
        let sampled = sample.is_some();
        if let Some(current) = sample {
            self.score = self.scorer.score(&current, self.previous.as_ref());
            log::trace!("Stability score {:.1}", self.score);
            self.previous = Some(current);
        }

        let transition = self.machine.tick(&mut self.state, self.score, now);
        self.overlay = overlay::refresh_local(&self.overlay, self.view());

        TickReport {
            phase: transition.phase,
            score: self.score,
            sampled,
            dispatch: transition.dispatch,
            timed_out: transition.timed_out,
        }
    }

    /// Fold an exchange's outcome into the session.
    pub fn on_completion(&mut self, completion: &Completion, now: Instant) -> CompletionOutcome {
        let token = completion.token();
        let released = self.machine.complete(&mut self.state, token);

        let outcome = match completion {
            Completion::Result { update, .. } => {
                if update.is_empty() {
                    log::debug!("Result {} carried no overlay fields", token);
                }
                self.overlay = overlay::merge(&self.overlay, update, self.view());
                if released {
                    CompletionOutcome::Merged
                } else {
                    log::info!("Late result for abandoned request {}, merged", token);
                    CompletionOutcome::MergedLate
                }
            }
            Completion::Failed { error, .. } if released => {
                log::warn!("Inference {} failed: {}", token, error);
                if let Some(ms) = error.retry_after_ms() {
                    self.machine
                        .defer(&mut self.state, now, Duration::from_millis(ms));
                }
                self.overlay = overlay::merge_error(&self.overlay, error, self.view());
                CompletionOutcome::Failed
            }
            Completion::EncodeFailed { error, .. } if released => {
                log::warn!("Encoding {} failed: {}", token, error);
                CompletionOutcome::EncodeFailed
            }
            Completion::Failed { .. } | Completion::EncodeFailed { .. } => {
                log::debug!("Ignoring failure for stale request {}", token);
                CompletionOutcome::Stale
            }
        };

        self.overlay = overlay::refresh_local(&self.overlay, self.view());
        outcome
    }

    /// Release `token` without a result, e.g. when no frame could be captured.
    pub fn release(&mut self, token: DispatchToken) -> bool {
        let released = self.machine.complete(&mut self.state, token);
        self.overlay = overlay::refresh_local(&self.overlay, self.view());
        released
    }

    pub fn overlay(&self) -> &OverlayState {
        &self.overlay
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    fn view(&self) -> LocalView {
        LocalView {
            stability: self.score,
            phase: self.state.phase(),
            in_flight: self.state.is_in_flight(),
        }
    }
}
