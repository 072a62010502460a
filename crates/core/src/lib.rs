pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod task;
pub mod types;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::SchedulerConfig;
pub use error::*;
pub use events::{topics, SchedulerEvent};
pub use task::*;
pub use types::*;
