// overlay.rs: The consumer-visible snapshot and the rules for folding
// asynchronous inference results into it.
//
// Local fields (stability, phase, status, guidance, in-flight) are owned by
// the scheduler and recomputed from its state every time. Remote fields come
// only from inference results. A late or stale result can therefore never
// rewind the phase the user sees.

use serde::Serialize;

use crate::ai::{AiError, OverlayUpdate};
use crate::lock::{guidance_for, status_for, Phase};

/// The scheduler's current view, used to recompute local fields.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalView {
    pub stability: f64,
    pub phase: Phase,
    pub in_flight: bool,
}

impl Default for LocalView {
    fn default() -> Self {
        Self {
            stability: 0.0,
            phase: Phase::Acquiring,
            in_flight: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverlayState {
    // ── local ──
    pub stability: f64,
    pub phase: Phase,
    pub status: String,
    pub guidance: String,
    pub in_flight: bool,
    /// The last exchange ended in an error.
    pub degraded: bool,

    // ── remote ──
    pub stress_level: Option<f64>,
    pub critical_warning: Option<String>,
    /// Free-text advice from the model.
    pub advice: Option<String>,
    pub object_count: Option<u32>,
    pub warnings: Vec<String>,
    pub confidence: Option<f64>,
    pub last_error: Option<String>,
    pub results_merged: u64,
}

impl Default for OverlayState {
    fn default() -> Self {
        refresh_local(&OverlayState::blank(), LocalView::default())
    }
}

impl OverlayState {
    fn blank() -> Self {
        Self {
            stability: 0.0,
            phase: Phase::Acquiring,
            status: String::new(),
            guidance: String::new(),
            in_flight: false,
            degraded: false,
            stress_level: None,
            critical_warning: None,
            advice: None,
            object_count: None,
            warnings: Vec::new(),
            confidence: None,
            last_error: None,
            results_merged: 0,
        }
    }
}

/// Recompute the local fields from `view`, keeping every remote field.
pub fn refresh_local(previous: &OverlayState, view: LocalView) -> OverlayState {
    OverlayState {
        stability: view.stability,
        phase: view.phase,
        status: status_for(view.phase, view.in_flight, previous.degraded).to_string(),
        guidance: guidance_for(view.phase, view.in_flight).to_string(),
        in_flight: view.in_flight,
        ..previous.clone()
    }
}

/// Fold an inference result into the overlay.
///
/// Present remote fields overwrite; absent ones keep their previous value.
/// `update.status` is never applied.
pub fn merge(previous: &OverlayState, update: &OverlayUpdate, view: LocalView) -> OverlayState {
    if let Some(remote_status) = &update.status {
        log::debug!("Ignoring remote status '{}'", remote_status);
    }

    let mut next = previous.clone();
    if let Some(v) = update.stress_level {
        next.stress_level = Some(v.clamp(0.0, 100.0));
    }
    if let Some(v) = &update.critical_warning {
        next.critical_warning = Some(v.clone());
    }
    if let Some(v) = &update.guidance {
        next.advice = Some(v.clone());
    }
    if let Some(v) = update.object_count {
        next.object_count = Some(v);
    }
    if let Some(v) = &update.warnings {
        next.warnings = v.clone();
    }
    if let Some(v) = update.confidence {
        next.confidence = Some(v.clamp(0.0, 1.0));
    }
    next.degraded = false;
    next.last_error = None;
    next.results_merged += 1;

    refresh_local(&next, view)
}

/// Record an inference failure: keep the last good remote fields, surface
/// the error, and mark the overlay degraded.
pub fn merge_error(previous: &OverlayState, error: &AiError, view: LocalView) -> OverlayState {
    let next = OverlayState {
        degraded: true,
        last_error: Some(error.to_string()),
        ..previous.clone()
    };
    refresh_local(&next, view)
}
