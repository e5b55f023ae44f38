/// The `capture` module covers everything between the camera and the
/// inference payload: throttled sampling, motion scoring, frame encoding,
/// and a replay source for running without a camera.
pub mod encode;
pub mod motion;
pub mod replay;
pub mod sampler;
