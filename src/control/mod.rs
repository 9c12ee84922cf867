pub mod controller;
pub mod stall;

pub use controller::{MotionController, MotionWorker, StatusEvent};
pub use stall::{MotionPhase, Outcome};
