// stream_manager.rs: Owns one scheduling session: the tick loop, the
// completion inbox, the overlay snapshot channel and the event broadcast.
//
// Consumers hold a `watch::Receiver<OverlayState>` for the latest overlay and
// a `broadcast::Receiver<SessionEvent>` for lifecycle events.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::ai::azure_vision::AzureVisionClient;
use crate::ai::AiProvider;
use crate::capture::encode::{FrameEncoder, JpegFrameEncoder};
use crate::capture::sampler::VideoSource;
use crate::dispatcher::{CaptureDispatcher, Completion};
use crate::lock::{DispatchToken, Phase};
use crate::overlay::OverlayState;
use crate::scheduler::{CompletionOutcome, Scheduler};
use crate::settings::{SchedulerConfig, Settings, SettingsError};

const EVENT_CAPACITY: usize = 64;

/// Lifecycle events, published on the session's broadcast channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionEvent {
    PhaseChanged { from: Phase, to: Phase },
    Dispatched { token: DispatchToken },
    ResultMerged { token: DispatchToken, late: bool },
    InferenceFailed { token: DispatchToken, message: String },
    EncodeFailed { token: DispatchToken, message: String },
    TimedOut { token: DispatchToken },
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("a session is already running")]
    AlreadyRunning,
    #[error("no session is running")]
    NotRunning,
    #[error("session task failed: {0}")]
    Task(String),
}

struct RunningSession {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Everything the loop task needs, cloned out of the manager at `start`.
struct LoopContext {
    config: SchedulerConfig,
    provider: Arc<dyn AiProvider>,
    encoder: Arc<dyn FrameEncoder>,
    system_prompt: Arc<Mutex<String>>,
    overlay: Arc<watch::Sender<OverlayState>>,
    events: broadcast::Sender<SessionEvent>,
}

pub struct StreamManager {
    config: SchedulerConfig,
    provider: Arc<dyn AiProvider>,
    encoder: Arc<dyn FrameEncoder>,
    system_prompt: Arc<Mutex<String>>,
    overlay: Arc<watch::Sender<OverlayState>>,
    events: broadcast::Sender<SessionEvent>,
    session: TokioMutex<Option<RunningSession>>,
}

impl StreamManager {
    pub fn new(
        config: SchedulerConfig,
        provider: Arc<dyn AiProvider>,
        encoder: Arc<dyn FrameEncoder>,
        system_prompt: &str,
    ) -> Self {
        let (overlay, _) = watch::channel(OverlayState::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            provider,
            encoder,
            system_prompt: Arc::new(Mutex::new(system_prompt.to_string())),
            overlay: Arc::new(overlay),
            events,
            session: TokioMutex::new(None),
        }
    }

    /// Build a manager backed by Azure OpenAI and the JPEG encoder.
    pub fn from_settings(settings: &Settings) -> Result<Self, SettingsError> {
        let config = settings.scheduler_config()?;
        let mut client = AzureVisionClient::new(
            settings.endpoint.as_str(),
            settings.api_key.as_str(),
            settings.vision_deployment.as_str(),
        )
        .with_timeout(config.request_timeout());
        if settings.use_bearer {
            client = client.with_bearer();
        }
        let encoder = JpegFrameEncoder::new(config.jpeg_quality, config.max_payload_bytes);
        log::info!(
            "StreamManager: {} via {} (preset '{}', bearer={})",
            settings.vision_deployment,
            settings.endpoint,
            settings.preset,
            settings.use_bearer
        );
        Ok(Self::new(
            config,
            Arc::new(client),
            Arc::new(encoder),
            &settings.vision_prompt,
        ))
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Receiver for the latest overlay snapshot.
    pub fn overlay(&self) -> watch::Receiver<OverlayState> {
        self.overlay.subscribe()
    }

    pub fn snapshot(&self) -> OverlayState {
        self.overlay.borrow().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Replace the prompt used for subsequent dispatches.
    pub fn update_prompt(&self, text: &str) {
        *self.system_prompt.lock().unwrap_or_else(|e| e.into_inner()) = text.to_string();
        log::info!("Vision prompt updated ({} chars)", text.len());
    }

    pub fn prompt(&self) -> String {
        self.system_prompt
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Begin scheduling against `source`.
    pub async fn start(&self, source: Box<dyn VideoSource>) -> Result<(), SessionError> {
        let mut session = self.session.lock().await;
        if let Some(running) = session.as_ref() {
            if !running.handle.is_finished() {
                return Err(SessionError::AlreadyRunning);
            }
        }

        let ctx = LoopContext {
            config: self.config.clone(),
            provider: Arc::clone(&self.provider),
            encoder: Arc::clone(&self.encoder),
            system_prompt: Arc::clone(&self.system_prompt),
            overlay: Arc::clone(&self.overlay),
            events: self.events.clone(),
        };
        let (shutdown, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(run_session(ctx, source, shutdown_rx));

        *session = Some(RunningSession { shutdown, handle });
        log::info!("Session started");
        Ok(())
    }

    /// End the session: abandon any in-flight request and reset the overlay.
    pub async fn stop(&self) -> Result<(), SessionError> {
        let running = self
            .session
            .lock()
            .await
            .take()
            .ok_or(SessionError::NotRunning)?;

        // The loop may have exited on its own; the join below still reports it.
        let _ = running.shutdown.send(());
        running
            .handle
            .await
            .map_err(|e| SessionError::Task(e.to_string()))?;
        log::info!("Session stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .is_some_and(|s| !s.handle.is_finished())
    }
}

async fn run_session(
    ctx: LoopContext,
    mut source: Box<dyn VideoSource>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let (inbox_tx, mut inbox) = mpsc::unbounded_channel();
    let mut dispatcher = CaptureDispatcher::new(
        Arc::clone(&ctx.encoder),
        Arc::clone(&ctx.provider),
        ctx.config.analysis_width,
        ctx.config.request_timeout(),
        inbox_tx,
    );
    let mut scheduler = Scheduler::new(&ctx.config);
    match source.dimensions() {
        Some((w, h)) => log::info!("Session loop running on {}x{} source", w, h),
        None => log::info!("Session loop running, source not ready yet"),
    }
    publish(&ctx.overlay, scheduler.overlay());

    let mut ticker = tokio::time::interval(ctx.config.tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            Some(completion) = inbox.recv() => {
                on_completion(&ctx, &mut scheduler, completion);
            }
            _ = ticker.tick() => {
                on_tick(&ctx, &mut scheduler, &mut dispatcher, source.as_mut());
            }
        }
    }

    dispatcher.abandon();
    drop(scheduler);
    publish(&ctx.overlay, &OverlayState::default());
    let _ = ctx.events.send(SessionEvent::Stopped);
}

fn on_tick(
    ctx: &LoopContext,
    scheduler: &mut Scheduler,
    dispatcher: &mut CaptureDispatcher,
    source: &mut dyn VideoSource,
) {
    let now = Instant::now().into_std();
    let before = scheduler.state().phase();
    let report = scheduler.tick(source, now);

    if let Some(token) = report.timed_out {
        emit(ctx, SessionEvent::TimedOut { token });
    }

    if let Some(token) = report.dispatch {
        match source.current_frame() {
            Some(frame) => {
                let prompt = ctx
                    .system_prompt
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone();
                dispatcher.dispatch(token, frame, prompt);
                emit(ctx, SessionEvent::Dispatched { token });
            }
            None => {
                log::warn!("No frame available for {}, releasing slot", token);
                scheduler.release(token);
            }
        }
    }

    emit_phase_change(ctx, before, scheduler.state().phase());
    publish(&ctx.overlay, scheduler.overlay());
}

fn on_completion(ctx: &LoopContext, scheduler: &mut Scheduler, completion: Completion) {
    let now = Instant::now().into_std();
    let before = scheduler.state().phase();
    let token = completion.token();
    let outcome = scheduler.on_completion(&completion, now);

    let event = match (outcome, completion) {
        (CompletionOutcome::Merged, _) => Some(SessionEvent::ResultMerged { token, late: false }),
        (CompletionOutcome::MergedLate, _) => Some(SessionEvent::ResultMerged { token, late: true }),
        (CompletionOutcome::Failed, Completion::Failed { error, .. }) => {
            Some(SessionEvent::InferenceFailed {
                token,
                message: error.to_string(),
            })
        }
        (CompletionOutcome::EncodeFailed, Completion::EncodeFailed { error, .. }) => {
            Some(SessionEvent::EncodeFailed {
                token,
                message: error.to_string(),
            })
        }
        _ => None,
    };
    if let Some(event) = event {
        emit(ctx, event);
    }

    emit_phase_change(ctx, before, scheduler.state().phase());
    publish(&ctx.overlay, scheduler.overlay());
}

fn emit_phase_change(ctx: &LoopContext, from: Phase, to: Phase) {
    if from != to {
        emit(ctx, SessionEvent::PhaseChanged { from, to });
    }
}

fn emit(ctx: &LoopContext, event: SessionEvent) {
    log::debug!("Session event: {:?}", event);
    // No subscribers is fine.
    let _ = ctx.events.send(event);
}

fn publish(overlay: &watch::Sender<OverlayState>, next: &OverlayState) {
    overlay.send_if_modified(|current| {
        if current == next {
            false
        } else {
            *current = next.clone();
            true
        }
    });
}
