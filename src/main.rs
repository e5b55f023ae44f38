use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use steadylock_lib::RunOptions;

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "steadylock",
    about = "Replay a directory of frames through a stability-gated vision session"
)]
struct Args {
    /// Settings file (TOML); missing means defaults
    settings: PathBuf,

    /// Directory of .jpg/.jpeg/.png frames, played in file-name order
    frames: PathBuf,

    /// Playback rate in frames per second
    #[arg(default_value_t = 10.0)]
    fps: f64,

    /// Restart from the first frame after the last one
    #[arg(long = "loop")]
    looped: bool,
}

impl From<Args> for RunOptions {
    fn from(args: Args) -> Self {
        RunOptions {
            settings_path: args.settings,
            frames_dir: args.frames,
            fps: args.fps,
            looped: args.looped,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match steadylock_lib::run(args.into()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
