use thiserror::Error;

/// A sound-interface operation that failed, carrying the operation name the
/// way alsa-lib error reporting does.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{op} ({msg})")]
pub struct CardError {
    pub op: &'static str,
    pub msg: String,
}

impl CardError {
    pub fn new(op: &'static str, msg: impl Into<String>) -> Self {
        CardError {
            op,
            msg: msg.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    Capture,
    Playback,
}

impl StreamDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamDirection::Capture => "capture",
            StreamDirection::Playback => "playback",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    MmapNonInterleaved,
    MmapInterleaved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    S32Le,
    S16Le,
}

impl SampleFormat {
    pub fn bytes(self) -> usize {
        match self {
            SampleFormat::S32Le => 4,
            SampleFormat::S16Le => 2,
        }
    }

    /// Default saturation bounds for the packed representation.
    pub fn level_bounds(self) -> (i32, i32) {
        match self {
            SampleFormat::S32Le => (i32::MIN, i32::MAX),
            SampleFormat::S16Le => (i16::MIN as i32, i16::MAX as i32),
        }
    }
}

/// Result of `avail_update`: a frame count, or the broken-pipe sentinel
/// signalling an xrun on that stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Avail {
    Frames(u64),
    Xrun,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollWait {
    Ready,
    Timeout,
    Interrupted,
    Error(String),
}

/// One channel of a memory-mapped span. Sample `offset` of the channel lives
/// at `base + (first_bits + step_bits * offset) / 8`.
#[derive(Debug, Clone, Copy)]
pub struct ChannelArea {
    pub base: *mut u8,
    pub first_bits: u64,
    pub step_bits: u64,
}

impl ChannelArea {
    pub fn empty() -> Self {
        ChannelArea {
            base: std::ptr::null_mut(),
            first_bits: 0,
            step_bits: 0,
        }
    }

    /// Address of frame `offset` within this area.
    ///
    /// # Safety
    /// `base` must point into a mapping that covers the addressed frame.
    pub unsafe fn addr_at(&self, offset: u64) -> *mut u8 {
        unsafe {
            self.base
                .add(((self.first_bits + self.step_bits * offset) / 8) as usize)
        }
    }
}

// The base pointer aliases kernel-owned DMA memory; the descriptor itself is
// plain data and moves with the driver onto the audio thread.
unsafe impl Send for ChannelArea {}

/// Software parameters committed after hardware negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwParams {
    pub start_threshold: u64,
    pub stop_threshold: u64,
    pub silence_threshold: u64,
    pub silence_size: u64,
    pub avail_min: u64,
}

/// Never auto-trigger: threshold beyond any reachable fill level.
pub const THRESHOLD_NEVER: u64 = u64::MAX;

/// One PCM stream of the kernel sound interface. Negotiation methods operate
/// on a pending hardware-parameter space seeded by `begin_negotiation` and
/// made effective by `commit_hw_params`; the `current_*` accessors report
/// the committed choices.
pub trait PcmStream {
    fn begin_negotiation(&mut self) -> Result<(), CardError>;
    fn require_integer_periods(&mut self) -> Result<(), CardError>;
    fn try_access(&mut self, access: AccessMode) -> Result<(), CardError>;
    fn try_format(&mut self, format: SampleFormat) -> Result<(), CardError>;
    fn set_rate(&mut self, hz: u32) -> Result<(), CardError>;
    fn channels_max(&self) -> Result<u32, CardError>;
    fn set_channels(&mut self, count: u32) -> Result<(), CardError>;
    fn set_period_frames(&mut self, frames: u64) -> Result<(), CardError>;
    fn set_period_count(&mut self, count: u32) -> Result<(), CardError>;
    fn set_buffer_frames(&mut self, frames: u64) -> Result<(), CardError>;
    fn commit_hw_params(&mut self) -> Result<(), CardError>;
    fn commit_sw_params(&mut self, sw: &SwParams) -> Result<(), CardError>;

    fn current_access(&self) -> Result<AccessMode, CardError>;
    fn current_format(&self) -> Result<SampleFormat, CardError>;
    fn current_channels(&self) -> Result<u32, CardError>;
    fn current_period_frames(&self) -> Result<u64, CardError>;
    fn current_period_count(&self) -> Result<u32, CardError>;

    fn prepare(&mut self) -> Result<(), CardError>;
    fn start(&mut self) -> Result<(), CardError>;
    /// Immediately drop pending frames (snd_pcm_drop).
    fn drop_pending(&mut self) -> Result<(), CardError>;

    fn avail_update(&mut self) -> Result<Avail, CardError>;

    /// Begin a mmap span of at most `want` frames. Fills `areas` (one per
    /// channel) and returns the ring offset and the contiguous frame count
    /// granted.
    fn mmap_begin(&mut self, want: u64, areas: &mut [ChannelArea]) -> Result<(u64, u64), CardError>;
    fn mmap_commit(&mut self, offset: u64, frames: u64) -> Result<(), CardError>;

    fn delay(&mut self) -> Result<i64, CardError>;

    /// Wait for the next period interrupt on this stream's descriptor.
    fn poll_wait(&mut self, timeout_ms: i32) -> PollWait;
}

/// Card-register access used by hardware-specific monitor profiles.
pub trait CardControl: Send {
    fn write_switches(&mut self, element: &str, values: &[bool]) -> Result<(), CardError>;
    fn write_enum(&mut self, element: &str, index: u32) -> Result<(), CardError>;
}

/// A physical device: a factory for its streams and its control interface.
pub trait SoundCard {
    type Stream: PcmStream;
    type Control: CardControl;

    fn open_stream(&mut self, direction: StreamDirection) -> Result<Self::Stream, CardError>;
    fn open_control(&mut self) -> Result<Self::Control, CardError>;

    /// Kernel driver name advertised by the card, used to pick a hardware
    /// profile.
    fn driver_name(&mut self) -> Result<String, CardError>;

    /// Link the two streams for hardware-synced start/stop. An error means
    /// the streams must be prepared and started independently.
    fn link(
        &mut self,
        capture: &mut Self::Stream,
        playback: &mut Self::Stream,
    ) -> Result<(), CardError>;
}
