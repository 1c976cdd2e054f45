pub mod progress;
pub mod progress_stream;

pub use progress::{format_bytes, format_duration, format_speed, RunCounters, RunStats};
pub use progress_stream::{ProgressCallback, ProgressStream};
