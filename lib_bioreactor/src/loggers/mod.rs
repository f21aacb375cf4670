/// fern-based console and file logging with rotation.
pub mod logger_file;

pub use logger_file::{parse_level, rotate_logs, setup_logging};
