//! Transfer helpers: byte counting and formatting.

pub mod progress;
pub mod progress_stream;

pub use progress::{format_bytes, format_duration};
pub use progress_stream::ProgressReader;
