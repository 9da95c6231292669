//! The recording service: the API the request layer talks to

mod error;
mod orchestrator;

pub use error::{RecordingError, StopError};
pub use orchestrator::RecordingService;
