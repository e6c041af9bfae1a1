pub mod controller;
pub mod state;

pub use controller::{Recorder, RecorderSnapshot, SaveReport};
pub use state::{RecorderState, RecorderStatus};
