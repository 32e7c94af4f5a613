pub mod clock;
pub mod config;
pub mod duration;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::GranaryConfig;
pub use duration::{HumanDuration, parse_duration};
pub use error::ConfigError;
pub use types::*;
