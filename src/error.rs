use crate::hw::card::CardError;
use thiserror::Error;

/// Errors surfaced by the driver. Construction-time variants mean the driver
/// is unusable; cycle-time variants halt the audio thread but leave the
/// driver attached so the engine may stop and restart it.
#[derive(Error, Debug)]
pub enum DriverError {
    /// PCM device could not be opened.
    #[error("ALSA: cannot open {direction} stream on \"{device}\": {source}")]
    Open {
        device: String,
        direction: &'static str,
        source: CardError,
    },

    /// Parameter negotiation failed on one stream.
    #[error("ALSA: cannot configure {stream} stream: {source}")]
    Configure {
        stream: &'static str,
        source: CardError,
    },

    /// Cross-stream or other fatal configuration mismatch.
    #[error("{0}")]
    Config(String),

    /// A sound-interface operation failed during start, stop or the cycle.
    #[error("ALSA-HW: {op} failed: {source}")]
    Io {
        op: &'static str,
        source: CardError,
    },

    /// poll(2) reported a system error or an error revent.
    #[error("ALSA::Device: {0}")]
    Poll(String),

    /// The engine's process callback returned non-zero.
    #[error("ALSA I/O: engine processing error - stopping")]
    EngineProcess,

    /// The engine declared xruns unrecoverable.
    #[error("ALSA I/O: unrecoverable xrun")]
    UnrecoverableXrun,
}

impl DriverError {
    pub(crate) fn io(op: &'static str, source: CardError) -> Self {
        DriverError::Io { op, source }
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;
