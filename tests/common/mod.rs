#![allow(dead_code)]

use alsa_io::engine::{
    ClientHandle, ClockSyncStatus, GraphEngine, MonitorHandler, PortFlags, PortHandle,
    ProcessHandler,
};
use alsa_io::hw::card::{
    AccessMode, Avail, CardControl, CardError, ChannelArea, PcmStream, PollWait, SampleFormat,
    SoundCard, StreamDirection, SwParams,
};
use alsa_io::{AudioDriver, DriverConfig};
use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

pub const FRAMES: u32 = 64;
pub const RATE: u32 = 48_000;

// ---------------------------------------------------------------------------
// Fake sound card
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DeviceSpec {
    pub driver_name: String,
    pub capture_channels_max: u32,
    pub playback_channels_max: u32,
    pub accesses: Vec<AccessMode>,
    pub capture_formats: Vec<SampleFormat>,
    pub playback_formats: Vec<SampleFormat>,
    pub linkable: bool,
    pub loopback: bool,
}

impl Default for DeviceSpec {
    fn default() -> Self {
        Self {
            driver_name: "FakeICE".to_string(),
            capture_channels_max: 2,
            playback_channels_max: 2,
            accesses: vec![AccessMode::MmapInterleaved],
            capture_formats: vec![SampleFormat::S16Le],
            playback_formats: vec![SampleFormat::S16Le],
            linkable: true,
            loopback: false,
        }
    }
}

#[derive(Debug, Default)]
struct StreamState {
    pending_access: Option<AccessMode>,
    pending_format: Option<SampleFormat>,
    pending_rate: Option<u32>,
    pending_channels: Option<u32>,
    pending_period: Option<u64>,
    pending_periods: Option<u32>,
    pending_buffer: Option<u64>,

    committed: bool,
    access: Option<AccessMode>,
    format: Option<SampleFormat>,
    channels: u32,
    period_frames: u64,
    periods: u32,
    buffer_frames: u64,
    pub sw: Option<SwParams>,

    regions: Vec<Vec<u8>>,
    appl: u64,
    hw: u64,
    prepared: bool,
    running: bool,
    begun: Option<(u64, u64)>,
    xrun_next_avail: bool,
    commits: Vec<(u64, u64)>,
}

impl StreamState {
    fn sample_bytes(&self) -> usize {
        self.format.map(|f| f.bytes()).unwrap_or(2)
    }

    fn interleaved(&self) -> bool {
        self.access == Some(AccessMode::MmapInterleaved)
    }

    fn frame_bytes(&self) -> usize {
        if self.interleaved() {
            self.sample_bytes() * self.channels as usize
        } else {
            self.sample_bytes()
        }
    }

    fn allocate(&mut self) {
        let bytes_per_region = self.buffer_frames as usize * self.frame_bytes();
        let regions = if self.interleaved() {
            1
        } else {
            self.channels as usize
        };
        self.regions = (0..regions).map(|_| vec![0u8; bytes_per_region]).collect();
        // Generous headroom so recording commits never reallocates while the
        // allocation-counting test is armed.
        self.commits = Vec::with_capacity(1024);
    }

    /// Copy `frames` frames starting at ring position `pos` into a blob:
    /// frame-interleaved for interleaved layout, channel-concatenated
    /// otherwise. The ring holds two periods and positions advance by whole
    /// periods, so spans never wrap.
    fn read_frames(&self, pos: u64, frames: u64) -> Vec<u8> {
        let offset = (pos % self.buffer_frames) as usize;
        let mut blob = Vec::new();
        for region in &self.regions {
            let start = offset * self.frame_bytes();
            let len = frames as usize * self.frame_bytes();
            blob.extend_from_slice(&region[start..start + len]);
        }
        blob
    }

    fn write_frames(&mut self, pos: u64, frames: u64, data: Option<&[u8]>) {
        let offset = (pos % self.buffer_frames) as usize;
        let chunk = frames as usize * self.frame_bytes();
        let start = offset * self.frame_bytes();
        for (idx, region) in self.regions.iter_mut().enumerate() {
            let dst = &mut region[start..start + chunk];
            match data {
                Some(data) if data.len() >= (idx + 1) * chunk => {
                    dst.copy_from_slice(&data[idx * chunk..(idx + 1) * chunk]);
                }
                _ => dst.fill(0),
            }
        }
    }
}

#[derive(Debug)]
pub struct FakeDevice {
    spec: DeviceSpec,
    capture: StreamState,
    playback: StreamState,
    seed_queue: VecDeque<Vec<u8>>,
    loopback_queue: VecDeque<Vec<u8>>,
    poll_script: VecDeque<PollWait>,
    pub linked: bool,
    pub ticks: u64,
    pub capture_delay_frames: i64,
}

impl FakeDevice {
    fn stream(&mut self, direction: StreamDirection) -> &mut StreamState {
        match direction {
            StreamDirection::Capture => &mut self.capture,
            StreamDirection::Playback => &mut self.playback,
        }
    }

    fn formats(&self, direction: StreamDirection) -> &[SampleFormat] {
        match direction {
            StreamDirection::Capture => &self.spec.capture_formats,
            StreamDirection::Playback => &self.spec.playback_formats,
        }
    }

    fn channels_max(&self, direction: StreamDirection) -> u32 {
        match direction {
            StreamDirection::Capture => self.spec.capture_channels_max,
            StreamDirection::Playback => self.spec.playback_channels_max,
        }
    }

    fn playback_avail(&self) -> u64 {
        self.playback.buffer_frames - (self.playback.appl - self.playback.hw)
    }

    fn capture_avail(&self) -> u64 {
        self.capture.hw - self.capture.appl
    }

    /// One period interrupt: the device consumes a committed playback period
    /// and produces a capture period (seeded data, looped-back playback, or
    /// silence).
    fn tick(&mut self) {
        let period = self.playback.period_frames;
        if self.playback.running && self.playback.appl - self.playback.hw >= period {
            if self.spec.loopback {
                let blob = self.playback.read_frames(self.playback.hw, period);
                self.loopback_queue.push_back(blob);
            }
            self.playback.hw += period;
        }

        if self.capture.running {
            let space = self.capture.buffer_frames - (self.capture.hw - self.capture.appl);
            if space >= period {
                let blob = self
                    .seed_queue
                    .pop_front()
                    .or_else(|| self.loopback_queue.pop_front());
                self.capture
                    .write_frames(self.capture.hw, period, blob.as_deref());
                self.capture.hw += period;
            } else {
                // Overrun: the application fell behind.
                self.capture.xrun_next_avail = true;
            }
        }
        self.ticks += 1;
    }

    pub fn playback_commits(&self) -> Vec<(u64, u64)> {
        self.playback.commits.clone()
    }

    pub fn capture_commits(&self) -> Vec<(u64, u64)> {
        self.capture.commits.clone()
    }

    pub fn committed_sw_params(&self, direction: StreamDirection) -> Option<SwParams> {
        match direction {
            StreamDirection::Capture => self.capture.sw,
            StreamDirection::Playback => self.playback.sw,
        }
    }

    pub fn negotiated_channels(&self, direction: StreamDirection) -> u32 {
        match direction {
            StreamDirection::Capture => self.capture.channels,
            StreamDirection::Playback => self.playback.channels,
        }
    }

    /// Raw bytes of one playback channel over the most recently committed
    /// span.
    pub fn playback_channel_bytes(&self, channel: usize, frames: u64) -> Vec<u8> {
        let st = &self.playback;
        let pos = st.appl.saturating_sub(frames);
        let blob = st.read_frames(pos, frames);
        let unit = st.sample_bytes();
        let mut out = Vec::with_capacity(frames as usize * unit);
        if st.interleaved() {
            let stride = st.frame_bytes();
            for frame in 0..frames as usize {
                let at = frame * stride + channel * unit;
                out.extend_from_slice(&blob[at..at + unit]);
            }
        } else {
            let per = frames as usize * unit;
            out.extend_from_slice(&blob[channel * per..(channel + 1) * per]);
        }
        out
    }

    pub fn seed_capture_bytes(&mut self, blob: Vec<u8>) {
        self.seed_queue.push_back(blob);
    }

    pub fn inject_capture_xrun(&mut self) {
        self.capture.xrun_next_avail = true;
    }

    pub fn script_poll(&mut self, outcome: PollWait) {
        self.poll_script.push_back(outcome);
    }
}

#[derive(Clone)]
pub struct FakeCard {
    device: Arc<Mutex<FakeDevice>>,
    control_log: Arc<Mutex<Vec<ControlWrite>>>,
}

impl FakeCard {
    pub fn new(spec: DeviceSpec) -> Self {
        Self {
            device: Arc::new(Mutex::new(FakeDevice {
                spec,
                capture: StreamState::default(),
                playback: StreamState::default(),
                seed_queue: VecDeque::new(),
                loopback_queue: VecDeque::new(),
                poll_script: VecDeque::new(),
                linked: false,
                ticks: 0,
                capture_delay_frames: FRAMES as i64,
            })),
            control_log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn device(&self) -> Arc<Mutex<FakeDevice>> {
        self.device.clone()
    }

    pub fn control_log(&self) -> Arc<Mutex<Vec<ControlWrite>>> {
        self.control_log.clone()
    }
}

pub struct FakeStream {
    direction: StreamDirection,
    device: Arc<Mutex<FakeDevice>>,
}

impl FakeStream {
    fn with<T>(&mut self, f: impl FnOnce(&mut StreamState) -> T) -> T {
        let mut device = self.device.lock().expect("fake device poisoned");
        f(device.stream(self.direction))
    }
}

impl PcmStream for FakeStream {
    fn begin_negotiation(&mut self) -> Result<(), CardError> {
        self.with(|st| {
            *st = StreamState::default();
            Ok(())
        })
    }

    fn require_integer_periods(&mut self) -> Result<(), CardError> {
        Ok(())
    }

    fn try_access(&mut self, access: AccessMode) -> Result<(), CardError> {
        let mut device = self.device.lock().expect("fake device poisoned");
        if !device.spec.accesses.contains(&access) {
            return Err(CardError::new("snd_pcm_hw_params_set_access", "unsupported"));
        }
        device.stream(self.direction).pending_access = Some(access);
        Ok(())
    }

    fn try_format(&mut self, format: SampleFormat) -> Result<(), CardError> {
        let mut device = self.device.lock().expect("fake device poisoned");
        if !device.formats(self.direction).contains(&format) {
            return Err(CardError::new("snd_pcm_hw_params_set_format", "unsupported"));
        }
        device.stream(self.direction).pending_format = Some(format);
        Ok(())
    }

    fn set_rate(&mut self, hz: u32) -> Result<(), CardError> {
        self.with(|st| {
            st.pending_rate = Some(hz);
            Ok(())
        })
    }

    fn channels_max(&self) -> Result<u32, CardError> {
        let device = self.device.lock().expect("fake device poisoned");
        Ok(device.channels_max(self.direction))
    }

    fn set_channels(&mut self, count: u32) -> Result<(), CardError> {
        let mut device = self.device.lock().expect("fake device poisoned");
        if count == 0 || count > device.channels_max(self.direction).max(2) {
            return Err(CardError::new("snd_pcm_hw_params_set_channels", "unsupported"));
        }
        device.stream(self.direction).pending_channels = Some(count);
        Ok(())
    }

    fn set_period_frames(&mut self, frames: u64) -> Result<(), CardError> {
        self.with(|st| {
            st.pending_period = Some(frames);
            Ok(())
        })
    }

    fn set_period_count(&mut self, count: u32) -> Result<(), CardError> {
        self.with(|st| {
            st.pending_periods = Some(count);
            Ok(())
        })
    }

    fn set_buffer_frames(&mut self, frames: u64) -> Result<(), CardError> {
        self.with(|st| {
            st.pending_buffer = Some(frames);
            Ok(())
        })
    }

    fn commit_hw_params(&mut self) -> Result<(), CardError> {
        self.with(|st| {
            let (Some(access), Some(format)) = (st.pending_access, st.pending_format) else {
                return Err(CardError::new("snd_pcm_hw_params", "incomplete configuration"));
            };
            let (Some(channels), Some(period), Some(periods)) =
                (st.pending_channels, st.pending_period, st.pending_periods)
            else {
                return Err(CardError::new("snd_pcm_hw_params", "incomplete configuration"));
            };
            st.access = Some(access);
            st.format = Some(format);
            st.channels = channels;
            st.period_frames = period;
            st.periods = periods;
            st.buffer_frames = st.pending_buffer.unwrap_or(period * periods as u64);
            st.committed = true;
            st.allocate();
            Ok(())
        })
    }

    fn commit_sw_params(&mut self, sw: &SwParams) -> Result<(), CardError> {
        let sw = *sw;
        self.with(|st| {
            st.sw = Some(sw);
            Ok(())
        })
    }

    fn current_access(&self) -> Result<AccessMode, CardError> {
        let mut device = self.device.lock().expect("fake device poisoned");
        device
            .stream(self.direction)
            .access
            .ok_or_else(|| CardError::new("snd_pcm_hw_params_get_access", "not committed"))
    }

    fn current_format(&self) -> Result<SampleFormat, CardError> {
        let mut device = self.device.lock().expect("fake device poisoned");
        device
            .stream(self.direction)
            .format
            .ok_or_else(|| CardError::new("snd_pcm_hw_params_get_format", "not committed"))
    }

    fn current_channels(&self) -> Result<u32, CardError> {
        let mut device = self.device.lock().expect("fake device poisoned");
        Ok(device.stream(self.direction).channels)
    }

    fn current_period_frames(&self) -> Result<u64, CardError> {
        let mut device = self.device.lock().expect("fake device poisoned");
        Ok(device.stream(self.direction).period_frames)
    }

    fn current_period_count(&self) -> Result<u32, CardError> {
        let mut device = self.device.lock().expect("fake device poisoned");
        Ok(device.stream(self.direction).periods)
    }

    fn prepare(&mut self) -> Result<(), CardError> {
        self.with(|st| {
            st.appl = 0;
            st.hw = 0;
            st.begun = None;
            st.prepared = true;
            st.running = false;
            st.xrun_next_avail = false;
            Ok(())
        })
    }

    fn start(&mut self) -> Result<(), CardError> {
        let direction = self.direction;
        let mut device = self.device.lock().expect("fake device poisoned");
        let linked = device.linked;
        let st = device.stream(direction);
        if !st.prepared {
            return Err(CardError::new("snd_pcm_start", "stream not prepared"));
        }
        st.running = true;
        // A linked pair starts together from the playback trigger.
        if linked && direction == StreamDirection::Playback {
            let capture = device.stream(StreamDirection::Capture);
            capture.appl = 0;
            capture.hw = 0;
            capture.prepared = true;
            capture.running = true;
            capture.xrun_next_avail = false;
        }
        Ok(())
    }

    fn drop_pending(&mut self) -> Result<(), CardError> {
        let direction = self.direction;
        let mut device = self.device.lock().expect("fake device poisoned");
        let linked = device.linked;
        let st = device.stream(direction);
        st.running = false;
        st.prepared = false;
        st.appl = 0;
        st.hw = 0;
        st.begun = None;
        st.xrun_next_avail = false;
        if linked && direction == StreamDirection::Playback {
            let capture = device.stream(StreamDirection::Capture);
            capture.running = false;
            capture.prepared = false;
            capture.appl = 0;
            capture.hw = 0;
            capture.begun = None;
            capture.xrun_next_avail = false;
        }
        Ok(())
    }

    fn avail_update(&mut self) -> Result<Avail, CardError> {
        let direction = self.direction;
        let mut device = self.device.lock().expect("fake device poisoned");
        if device.stream(direction).xrun_next_avail {
            device.stream(direction).xrun_next_avail = false;
            return Ok(Avail::Xrun);
        }
        let avail = match direction {
            StreamDirection::Capture => device.capture_avail(),
            StreamDirection::Playback => device.playback_avail(),
        };
        Ok(Avail::Frames(avail))
    }

    fn mmap_begin(
        &mut self,
        want: u64,
        areas: &mut [ChannelArea],
    ) -> Result<(u64, u64), CardError> {
        let direction = self.direction;
        let mut device = self.device.lock().expect("fake device poisoned");
        let avail = match direction {
            StreamDirection::Capture => device.capture_avail(),
            StreamDirection::Playback => device.playback_avail(),
        };
        let st = device.stream(direction);
        let offset = st.appl % st.buffer_frames;
        let contiguous = want.min(avail).min(st.buffer_frames - offset);

        let unit_bits = (st.sample_bytes() * 8) as u64;
        if st.interleaved() {
            let step = unit_bits * st.channels as u64;
            let base = st.regions[0].as_mut_ptr();
            for (chn, area) in areas.iter_mut().enumerate() {
                *area = ChannelArea {
                    base,
                    first_bits: chn as u64 * unit_bits,
                    step_bits: step,
                };
            }
        } else {
            for (chn, area) in areas.iter_mut().enumerate() {
                *area = ChannelArea {
                    base: st.regions[chn].as_mut_ptr(),
                    first_bits: 0,
                    step_bits: unit_bits,
                };
            }
        }
        st.begun = Some((offset, contiguous));
        Ok((offset, contiguous))
    }

    fn mmap_commit(&mut self, offset: u64, frames: u64) -> Result<(), CardError> {
        self.with(|st| {
            match st.begun.take() {
                Some((begun_offset, granted)) if begun_offset == offset && frames <= granted => {}
                _ => {
                    return Err(CardError::new(
                        "snd_pcm_mmap_commit",
                        "commit does not match mmap_begin",
                    ));
                }
            }
            st.appl += frames;
            st.commits.push((offset, frames));
            Ok(())
        })
    }

    fn delay(&mut self) -> Result<i64, CardError> {
        let device = self.device.lock().expect("fake device poisoned");
        Ok(device.capture_delay_frames)
    }

    fn poll_wait(&mut self, _timeout_ms: i32) -> PollWait {
        let mut device = self.device.lock().expect("fake device poisoned");
        if let Some(outcome) = device.poll_script.pop_front() {
            return outcome;
        }
        device.tick();
        PollWait::Ready
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlWrite {
    Switches(String, Vec<bool>),
    Enum(String, u32),
}

pub struct FakeControl {
    log: Arc<Mutex<Vec<ControlWrite>>>,
}

impl CardControl for FakeControl {
    fn write_switches(&mut self, element: &str, values: &[bool]) -> Result<(), CardError> {
        self.log
            .lock()
            .expect("control log poisoned")
            .push(ControlWrite::Switches(element.to_string(), values.to_vec()));
        Ok(())
    }

    fn write_enum(&mut self, element: &str, index: u32) -> Result<(), CardError> {
        self.log
            .lock()
            .expect("control log poisoned")
            .push(ControlWrite::Enum(element.to_string(), index));
        Ok(())
    }
}

impl SoundCard for FakeCard {
    type Stream = FakeStream;
    type Control = FakeControl;

    fn open_stream(&mut self, direction: StreamDirection) -> Result<FakeStream, CardError> {
        Ok(FakeStream {
            direction,
            device: self.device.clone(),
        })
    }

    fn open_control(&mut self) -> Result<FakeControl, CardError> {
        Ok(FakeControl {
            log: self.control_log.clone(),
        })
    }

    fn driver_name(&mut self) -> Result<String, CardError> {
        let device = self.device.lock().expect("fake device poisoned");
        Ok(device.spec.driver_name.clone())
    }

    fn link(
        &mut self,
        _capture: &mut FakeStream,
        _playback: &mut FakeStream,
    ) -> Result<(), CardError> {
        let mut device = self.device.lock().expect("fake device poisoned");
        if device.spec.linkable {
            device.linked = true;
            Ok(())
        } else {
            Err(CardError::new("snd_pcm_link", "not linkable"))
        }
    }
}

// ---------------------------------------------------------------------------
// Fake engine
// ---------------------------------------------------------------------------

struct BufferCell(UnsafeCell<Box<[f32]>>);

unsafe impl Send for BufferCell {}
unsafe impl Sync for BufferCell {}

#[derive(Clone)]
pub struct SharedBuffer(Arc<BufferCell>);

impl SharedBuffer {
    fn new(len: usize) -> Self {
        SharedBuffer(Arc::new(BufferCell(UnsafeCell::new(
            vec![0.0; len].into_boxed_slice(),
        ))))
    }

    fn ptr(&self) -> *mut f32 {
        unsafe { (*self.0 .0.get()).as_mut_ptr() }
    }

    pub fn snapshot(&self) -> Vec<f32> {
        unsafe { (*self.0 .0.get()).to_vec() }
    }

    pub fn fill(&self, data: &[f32]) {
        let buf = unsafe { &mut *self.0 .0.get() };
        for (dst, src) in buf.iter_mut().zip(data.iter()) {
            *dst = *src;
        }
    }
}

struct FakePort {
    name: String,
    flags: PortFlags,
    connected: bool,
    buffer: SharedBuffer,
    registered: bool,
}

struct EngineInner {
    buffer_size: u32,
    sample_rate: u32,
    next_client: u64,
    ports: Vec<FakePort>,
    process_handler: Option<Arc<dyn ProcessHandler>>,
    monitor_handler: Option<Arc<dyn MonitorHandler>>,
    activated: bool,
    process_calls: Vec<u32>,
    process_rc: i32,
    monitor_notifications: Vec<(usize, bool)>,
    clock_notifications: Vec<(usize, ClockSyncStatus)>,
}

type ClientCallback = dyn Fn(&FakeEngine, u32) + Send + Sync;

pub struct FakeEngine {
    inner: Mutex<EngineInner>,
    client_callback: Mutex<Option<Arc<ClientCallback>>>,
    xruns_recoverable: bool,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::with_xrun_policy(true)
    }

    pub fn with_xrun_policy(xruns_recoverable: bool) -> Self {
        FakeEngine {
            inner: Mutex::new(EngineInner {
                buffer_size: 0,
                sample_rate: 0,
                next_client: 1,
                ports: Vec::new(),
                process_handler: None,
                monitor_handler: None,
                activated: false,
                process_calls: Vec::with_capacity(1024),
                process_rc: 0,
                monitor_notifications: Vec::new(),
                clock_notifications: Vec::new(),
            }),
            client_callback: Mutex::new(None),
            xruns_recoverable,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EngineInner> {
        self.inner.lock().expect("fake engine poisoned")
    }

    pub fn on_process(&self, callback: impl Fn(&FakeEngine, u32) + Send + Sync + 'static) {
        *self.client_callback.lock().expect("callback poisoned") = Some(Arc::new(callback));
    }

    pub fn set_process_rc(&self, rc: i32) {
        self.lock().process_rc = rc;
    }

    pub fn port_by_name(&self, name: &str) -> Option<PortHandle> {
        self.lock()
            .ports
            .iter()
            .position(|p| p.name == name && p.registered)
            .map(|idx| PortHandle(idx as u64))
    }

    pub fn port_names(&self) -> Vec<String> {
        self.lock()
            .ports
            .iter()
            .filter(|p| p.registered)
            .map(|p| p.name.clone())
            .collect()
    }

    pub fn port_flags(&self, port: PortHandle) -> PortFlags {
        self.lock().ports[port.0 as usize].flags
    }

    pub fn set_connected(&self, port: PortHandle, connected: bool) {
        self.lock().ports[port.0 as usize].connected = connected;
    }

    pub fn buffer(&self, port: PortHandle) -> SharedBuffer {
        self.lock().ports[port.0 as usize].buffer.clone()
    }

    pub fn process_calls(&self) -> Vec<u32> {
        self.lock().process_calls.clone()
    }

    pub fn monitor_notifications(&self) -> Vec<(usize, bool)> {
        self.lock().monitor_notifications.clone()
    }

    pub fn request_monitor_via_callback(&self, channel: usize, on: bool) {
        let handler = self.lock().monitor_handler.clone();
        if let Some(handler) = handler {
            handler.monitor_request(channel, on);
        }
    }

    pub fn buffer_size(&self) -> u32 {
        self.lock().buffer_size
    }

    pub fn sample_rate(&self) -> u32 {
        self.lock().sample_rate
    }

    pub fn activated(&self) -> bool {
        self.lock().activated
    }
}

impl GraphEngine for FakeEngine {
    fn set_buffer_size(&self, frames: u32) {
        self.lock().buffer_size = frames;
    }

    fn set_sample_rate(&self, rate: u32) {
        self.lock().sample_rate = rate;
    }

    fn process(&self, frames: u32) -> i32 {
        let (handler, rc) = {
            let mut inner = self.lock();
            inner.process_calls.push(frames);
            (inner.process_handler.clone(), inner.process_rc)
        };
        if let Some(handler) = handler {
            let handler_rc = handler.process(frames);
            if handler_rc != 0 {
                return handler_rc;
            }
        }
        let callback = self
            .client_callback
            .lock()
            .expect("callback poisoned")
            .clone();
        if let Some(callback) = callback {
            callback(self, frames);
        }
        rc
    }

    fn xruns_recoverable(&self) -> bool {
        self.xruns_recoverable
    }

    fn register_client(&self, _name: &str) -> Option<ClientHandle> {
        let mut inner = self.lock();
        let id = inner.next_client;
        inner.next_client += 1;
        Some(ClientHandle(id))
    }

    fn set_process_handler(&self, _client: ClientHandle, handler: Arc<dyn ProcessHandler>) {
        self.lock().process_handler = Some(handler);
    }

    fn set_monitor_handler(&self, _client: ClientHandle, handler: Arc<dyn MonitorHandler>) {
        self.lock().monitor_handler = Some(handler);
    }

    fn activate(&self, _client: ClientHandle) {
        self.lock().activated = true;
    }

    fn register_port(
        &self,
        _client: ClientHandle,
        name: &str,
        flags: PortFlags,
    ) -> Option<PortHandle> {
        let mut inner = self.lock();
        let len = inner.buffer_size.max(1) as usize;
        inner.ports.push(FakePort {
            name: name.to_string(),
            flags,
            connected: true,
            buffer: SharedBuffer::new(len),
            registered: true,
        });
        Some(PortHandle(inner.ports.len() as u64 - 1))
    }

    fn unregister_port(&self, _client: ClientHandle, port: PortHandle) {
        self.lock().ports[port.0 as usize].registered = false;
    }

    fn port_buffer(&self, port: PortHandle, _frames: u32) -> *mut f32 {
        self.lock().ports[port.0 as usize].buffer.ptr()
    }

    fn port_connected(&self, port: PortHandle) -> bool {
        let inner = self.lock();
        let port = &inner.ports[port.0 as usize];
        port.registered && port.connected
    }

    fn notify_monitor(&self, channel: usize, on: bool) {
        self.lock().monitor_notifications.push((channel, on));
    }

    fn notify_clock_sync(&self, channel: usize, status: ClockSyncStatus) {
        self.lock().clock_notifications.push((channel, status));
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub fn test_config() -> DriverConfig {
    DriverConfig {
        device: "fake:0".to_string(),
        frames_per_cycle: FRAMES,
        sample_rate: RATE,
        ..DriverConfig::default()
    }
}

pub fn build_driver(spec: DeviceSpec) -> (AudioDriver<FakeStream>, FakeCard) {
    let card = FakeCard::new(spec);
    let driver = AudioDriver::with_card(card.clone(), test_config())
        .expect("driver construction failed");
    (driver, card)
}

/// Interleaved little-endian i16 blob for one stereo period.
pub fn i16_blob(samples: &[i16]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        blob.extend_from_slice(&s.to_le_bytes());
    }
    blob
}

pub fn i16_from_blob(blob: &[u8]) -> Vec<i16> {
    blob.chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}
