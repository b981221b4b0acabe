pub mod bitset;
mod cell;
pub mod engine;
pub mod error;
pub mod hw;
pub mod hw_worker;

pub use error::{DriverError, Result};
#[cfg(target_os = "linux")]
pub use hw::alsa::AlsaCard;
pub use hw::driver::{AudioDriver, CycleOutcome, DriverControls, CLIENT_NAME};
pub use hw::options::DriverConfig;
pub use hw::profile::ClockMode;
