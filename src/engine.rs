use bitflags::bitflags;
use std::sync::Arc;

bitflags! {
    /// Port registration flags, from the driver's point of view: capture
    /// ports produce data for other clients (output), playback ports consume
    /// it (input).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortFlags: u32 {
        const INPUT = 1 << 0;
        const OUTPUT = 1 << 1;
        const PHYSICAL = 1 << 2;
        const CAN_MONITOR = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockSyncStatus {
    Lock,
    NoLock,
    Sync,
}

/// Process hook a driver client installs with the engine; runs inside the
/// engine's process phase on the audio thread.
pub trait ProcessHandler: Send + Sync {
    fn process(&self, frames: u32) -> i32;
}

/// Monitor-request hook: a client asked for input monitoring on a physical
/// channel.
pub trait MonitorHandler: Send + Sync {
    fn monitor_request(&self, channel: usize, on: bool);
}

/// The audio graph host. The driver pushes timing parameters to it, becomes
/// one of its clients, and invokes `process` once per contiguous span; the
/// engine in turn runs every client, including the driver's own capture
/// hook.
pub trait GraphEngine: Send + Sync {
    fn set_buffer_size(&self, frames: u32);
    fn set_sample_rate(&self, rate: u32);

    /// Run one process phase over `frames` frames. Non-zero is fatal to the
    /// cycle.
    fn process(&self, frames: u32) -> i32;

    /// Whether the engine tolerates in-line xrun recovery.
    fn xruns_recoverable(&self) -> bool {
        true
    }

    fn register_client(&self, name: &str) -> Option<ClientHandle>;
    fn set_process_handler(&self, client: ClientHandle, handler: Arc<dyn ProcessHandler>);
    fn set_monitor_handler(&self, client: ClientHandle, handler: Arc<dyn MonitorHandler>);
    fn activate(&self, client: ClientHandle);

    fn register_port(
        &self,
        client: ClientHandle,
        name: &str,
        flags: PortFlags,
    ) -> Option<PortHandle>;
    fn unregister_port(&self, client: ClientHandle, port: PortHandle);

    /// Buffer backing `port` for the current process phase. Valid for
    /// `frames` samples until the phase ends.
    fn port_buffer(&self, port: PortHandle, frames: u32) -> *mut f32;

    /// Needless data copying is optimized away for ports nobody listens to.
    fn port_connected(&self, port: PortHandle) -> bool;

    fn notify_monitor(&self, channel: usize, on: bool);
    fn notify_clock_sync(&self, channel: usize, status: ClockSyncStatus);
}
