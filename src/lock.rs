// lock.rs: ACQUIRING / LOCKED / ANALYZING state machine.
//
// All timing decisions live here and take `now` as an argument, so every
// rule can be exercised with synthetic timestamps.

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::settings::SchedulerConfig;

/// Longest backoff honoured from a rate-limit response.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    /// Camera is moving or has not been still long enough.
    #[default]
    Acquiring,
    /// Stable long enough; eligible for dispatch.
    Locked,
    /// A request is in flight.
    Analyzing,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Acquiring => "ACQUIRING",
            Phase::Locked => "LOCKED",
            Phase::Analyzing => "ANALYZING",
        };
        f.write_str(name)
    }
}

/// Correlates one authorized capture with its eventual result or timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DispatchToken(u64);

impl DispatchToken {
    pub fn id(&self) -> u64 {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn from_raw(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for DispatchToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The single in-flight slot. Its `dispatched_at` doubles as the failsafe
/// timer: clearing the slot cancels the timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InFlight {
    pub token: DispatchToken,
    pub dispatched_at: Instant,
}

/// Everything the state machine remembers between ticks.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionState {
    phase: Phase,
    /// When the current unbroken run of stable scores began.
    stable_since: Option<Instant>,
    last_dispatch: Option<Instant>,
    in_flight: Option<InFlight>,
    /// Set by rate-limit errors; no dispatch before this instant.
    retry_not_before: Option<Instant>,
    next_token: u64,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn in_flight(&self) -> Option<InFlight> {
        self.in_flight
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn stable_since(&self) -> Option<Instant> {
        self.stable_since
    }

    pub fn last_dispatch(&self) -> Option<Instant> {
        self.last_dispatch
    }

    fn mint_token(&mut self) -> DispatchToken {
        self.next_token += 1;
        DispatchToken(self.next_token)
    }
}

/// What one tick decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub phase: Phase,
    /// Set when this tick authorized a capture.
    pub dispatch: Option<DispatchToken>,
    /// Set when this tick abandoned a request at the failsafe deadline.
    pub timed_out: Option<DispatchToken>,
}

#[derive(Debug, Clone, Copy)]
pub struct LockStateMachine {
    stability_threshold: f64,
    lock_duration: Duration,
    cooldown: Duration,
    failsafe_timeout: Duration,
}

impl LockStateMachine {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            stability_threshold: config.stability_threshold,
            lock_duration: config.lock_duration(),
            cooldown: config.cooldown(),
            failsafe_timeout: config.failsafe_timeout(),
        }
    }

    pub fn tick(&self, state: &mut SessionState, score: f64, now: Instant) -> Transition {
        // Failsafe: abandon a request that has gone unanswered too long.
        if let Some(flight) = state.in_flight {
            if now.saturating_duration_since(flight.dispatched_at) >= self.failsafe_timeout {
                log::warn!(
                    "Request {} unanswered after {:?}, releasing slot",
                    flight.token,
                    self.failsafe_timeout
                );
                state.in_flight = None;
                state.phase = Phase::Locked;
                return Transition {
                    phase: state.phase,
                    dispatch: None,
                    timed_out: Some(flight.token),
                };
            }
        }

        let stable = score >= self.stability_threshold;

        if state.phase != Phase::Analyzing {
            if !stable {
                state.stable_since = None;
                self.enter(state, Phase::Acquiring);
            } else {
                let since = *state.stable_since.get_or_insert(now);
                if now.saturating_duration_since(since) >= self.lock_duration {
                    self.enter(state, Phase::Locked);
                }
            }
        }

        let mut dispatch = None;
        if state.phase == Phase::Locked && state.in_flight.is_none() && self.cooled_down(state, now)
        {
            let token = state.mint_token();
            state.in_flight = Some(InFlight {
                token,
                dispatched_at: now,
            });
            state.last_dispatch = Some(now);
            self.enter(state, Phase::Analyzing);
            dispatch = Some(token);
        }

        Transition {
            phase: state.phase,
            dispatch,
            timed_out: None,
        }
    }

    /// Release the slot held by `token`. Returns `false` for a token that is
    /// no longer outstanding (already timed out, or from a previous session);
    /// nothing changes in that case.
    pub fn complete(&self, state: &mut SessionState, token: DispatchToken) -> bool {
        match state.in_flight {
            Some(flight) if flight.token == token => {
                state.in_flight = None;
                if state.phase == Phase::Analyzing {
                    self.enter(state, Phase::Locked);
                }
                true
            }
            _ => false,
        }
    }

    /// Hold off the next dispatch until at least `now + retry_after`, capped at
    /// `MAX_RETRY_AFTER`.
    pub fn defer(&self, state: &mut SessionState, now: Instant, retry_after: Duration) {
        let until = now + retry_after.min(MAX_RETRY_AFTER);
        state.retry_not_before = Some(match state.retry_not_before {
            Some(existing) if existing > until => existing,
            _ => until,
        });
    }

    fn cooled_down(&self, state: &SessionState, now: Instant) -> bool {
        let cooldown_ok = state
            .last_dispatch
            .map_or(true, |last| now.saturating_duration_since(last) >= self.cooldown);
        let backoff_ok = state.retry_not_before.map_or(true, |t| now >= t);
        cooldown_ok && backoff_ok
    }

    fn enter(&self, state: &mut SessionState, phase: Phase) {
        if state.phase != phase {
            log::info!("Phase {} -> {}", state.phase, phase);
            state.phase = phase;
        }
    }
}

/// Short machine-readable status shown to the user.
pub fn status_for(phase: Phase, in_flight: bool, degraded: bool) -> &'static str {
    if in_flight {
        "ANALYZING"
    } else if degraded {
        "DEGRADED"
    } else {
        match phase {
            Phase::Acquiring => "SEARCHING",
            Phase::Locked | Phase::Analyzing => "LOCKED",
        }
    }
}

/// Instruction text shown to the user.
pub fn guidance_for(phase: Phase, in_flight: bool) -> &'static str {
    if in_flight {
        return "PROCESSING...";
    }
    match phase {
        Phase::Acquiring => "STABILIZE DEVICE",
        Phase::Locked | Phase::Analyzing => "TARGET LOCKED",
    }
}
