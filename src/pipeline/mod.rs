//! Producer/consumer media pipelines.
//!
//! Each pipeline pairs a network-side tokio task with a hardware-side thread
//! over a bounded [`Fifo`]. The hardware thread is parked by a [`WorkerGate`]
//! whenever its session is outside the states that move audio.

pub mod capture;
mod fifo;
mod gate;
pub mod playback;

pub use capture::{
    CaptureEvent, CaptureSession, CaptureState, Recorder, RecorderConfig, RecorderHandle,
};
pub use fifo::Fifo;
pub use gate::WorkerGate;
pub use playback::{
    PlaybackEvent, PlaybackSession, PlaybackState, Player, PlayerConfig, PlayerHandle,
};
