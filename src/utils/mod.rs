pub mod clock;
pub(crate) mod enums;
pub mod logging;

// Re-export common functions and types
pub use clock::{Clock, ManualClock, SystemClock};
pub use logging::{default_log_file, init_logging};
