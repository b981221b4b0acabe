#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub device: String,
    pub frames_per_cycle: u32,
    pub sample_rate: u32,
    /// Saturation overrides for the packed sample domain; 0 keeps the
    /// format's own bounds.
    pub min_level: i32,
    pub max_level: i32,
    /// Retry interrupted polls instead of skipping the cycle. Useful when a
    /// debugger keeps firing signals at the audio thread.
    pub poll_retry_on_interrupt: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            device: "hw:0".to_string(),
            frames_per_cycle: 1024,
            sample_rate: 48_000,
            min_level: 0,
            max_level: 0,
            poll_retry_on_interrupt: false,
        }
    }
}
