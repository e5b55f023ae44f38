pub mod ai;
pub mod capture;
pub mod dispatcher;
pub mod lock;
pub mod overlay;
pub mod scheduler;
pub mod settings;
pub mod stream_manager;

use std::path::PathBuf;

use capture::replay::{ImageSequenceSource, ReplayError};
use settings::{Settings, SettingsError};
use stream_manager::{SessionError, StreamManager};

pub use lock::Phase;
pub use overlay::OverlayState;
pub use stream_manager::SessionEvent;

/// Options for a headless replay run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub settings_path: PathBuf,
    pub frames_dir: PathBuf,
    pub fps: f64,
    pub looped: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Replay(#[from] ReplayError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("no inference endpoint configured in {0}")]
    NoEndpoint(String),
}

/// Replay a directory of frames through a full session, logging every
/// overlay change, until the sequence ends or Ctrl+C.
pub async fn run(options: RunOptions) -> Result<(), RunError> {
    capture::replay::frame_interval_for(options.fps)?;
    let settings = Settings::load(&options.settings_path)?;
    if !settings.has_endpoint() {
        return Err(RunError::NoEndpoint(
            options.settings_path.display().to_string(),
        ));
    }

    let source = ImageSequenceSource::open(&options.frames_dir, options.fps, options.looped)?;
    // A one-shot replay ends after its last frame; give the final request
    // time to come back before stopping.
    let playback = (!options.looped).then(|| source.playback_length());

    let manager = StreamManager::from_settings(&settings)?;
    let grace = manager.config().failsafe_timeout();
    let mut overlay = manager.overlay();
    let mut events = manager.subscribe();

    manager.start(Box::new(source)).await?;

    let deadline = async {
        match playback {
            Some(d) => tokio::time::sleep(d.saturating_add(grace)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Ctrl+C received");
                break;
            }
            _ = &mut deadline => {
                log::info!("Replay finished");
                break;
            }
            changed = overlay.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = overlay.borrow_and_update().clone();
                match serde_json::to_string(&snapshot) {
                    Ok(json) => log::info!("overlay {}", json),
                    Err(e) => log::warn!("Failed to serialize overlay: {}", e),
                }
            }
            event = events.recv() => {
                match event {
                    Ok(event) => log::debug!("event {:?}", event),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Dropped {} session events", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    manager.stop().await?;
    Ok(())
}
