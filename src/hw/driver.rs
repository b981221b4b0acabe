use crate::bitset::{AtomicMask, ChannelMask};
use crate::cell::AudioCell;
use crate::engine::{
    ClientHandle, ClockSyncStatus, GraphEngine, MonitorHandler, PortFlags, PortHandle,
    ProcessHandler,
};
use crate::error::{DriverError, Result};
use crate::hw::card::{Avail, ChannelArea, PcmStream, SampleFormat, SoundCard, StreamDirection};
use crate::hw::channels::ChannelMap;
use crate::hw::configure::{self, DuplexSetup};
use crate::hw::convert::SampleIo;
use crate::hw::options::DriverConfig;
use crate::hw::profile::{self, Caps, ClockMode, HardwareProfile};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{error, info};

pub const CLIENT_NAME: &str = "ALSA I/O";

/// Flags and counters written by the engine's control thread and read by
/// the audio thread. Masks and booleans publish with release/acquire; the
/// request counts and the profile are control-thread-only and sit behind
/// mutexes the audio path never blocks on.
pub(crate) struct ControlState {
    pub(crate) input_monitor_mask: AtomicMask,
    pub(crate) silence_pending: AtomicMask,
    pub(crate) all_monitor_in: AtomicBool,
    pub(crate) hw_monitoring: AtomicBool,
    pub(crate) shutdown: AtomicBool,
    pub(crate) monitor_requests: Mutex<Vec<u32>>,
    pub(crate) profile: Mutex<HardwareProfile>,
    pub(crate) engine: Mutex<Option<Arc<dyn GraphEngine>>>,
    pub(crate) max_channels: usize,
    pub(crate) playback_channels: usize,
    pub(crate) frame_rate: AtomicU32,
    pub(crate) epoch: Instant,
    pub(crate) interrupt_us: AtomicU64,
}

impl ControlState {
    fn engine(&self) -> Option<Arc<dyn GraphEngine>> {
        self.engine.lock().expect("engine reference poisoned").clone()
    }

    pub(crate) fn note_interrupt(&self) {
        let now = self.epoch.elapsed().as_micros() as u64;
        self.interrupt_us.store(now, Ordering::Release);
    }
}

/// Cloneable control surface of a driver, safe to use from the engine's
/// control thread while the audio thread is cycling.
#[derive(Clone)]
pub struct DriverControls {
    state: Arc<ControlState>,
}

impl DriverControls {
    pub fn request_monitor_input(&self, channel: usize, on: bool) {
        let st = &*self.state;
        if channel >= st.max_channels {
            return;
        }

        let mut changed = false;
        {
            let mut requests = st
                .monitor_requests
                .lock()
                .expect("monitor requests poisoned");
            if on {
                requests[channel] = requests[channel].saturating_add(1);
                if requests[channel] == 1 && !st.input_monitor_mask.test(channel) {
                    st.input_monitor_mask.set(channel);
                    changed = true;
                }
            } else if requests[channel] > 0 {
                requests[channel] -= 1;
                if requests[channel] == 0 && st.input_monitor_mask.test(channel) {
                    st.input_monitor_mask.clear(channel);
                    changed = true;
                }
            }
        }

        if changed {
            // A channel dropped from software monitoring keeps ringing with
            // the last copied span; schedule a scrub for the next cycle.
            if !on && !st.hw_monitoring.load(Ordering::Acquire) && channel < st.playback_channels
            {
                st.silence_pending.set(channel);
            }
            if let Some(engine) = st.engine() {
                engine.notify_monitor(channel, on);
            }
        }
    }

    pub fn request_all_monitor_input(&self, on: bool) {
        let st = &*self.state;
        if st.hw_monitoring.load(Ordering::Acquire) {
            let mask = if on {
                ChannelMask::all_set(st.max_channels)
            } else {
                let mut mask = ChannelMask::new(st.max_channels);
                st.input_monitor_mask.load_into(&mut mask);
                mask
            };
            let mut profile = st.profile.lock().expect("hardware profile poisoned");
            if let Err(e) = profile.set_input_monitor_mask(&mask) {
                error!("ALSA-HW: cannot set input monitor mask: {e}");
            }
        }
        st.all_monitor_in.store(on, Ordering::Release);
    }

    pub fn set_hw_monitoring(&self, on: bool) {
        let st = &*self.state;
        let mask = if !on {
            ChannelMask::new(st.max_channels)
        } else if st.all_monitor_in.load(Ordering::Acquire) {
            ChannelMask::all_set(st.max_channels)
        } else {
            let mut mask = ChannelMask::new(st.max_channels);
            st.input_monitor_mask.load_into(&mut mask);
            mask
        };
        st.hw_monitoring.store(on, Ordering::Release);
        let mut profile = st.profile.lock().expect("hardware profile poisoned");
        if let Err(e) = profile.set_input_monitor_mask(&mask) {
            error!("ALSA-HW: cannot set input monitor mask: {e}");
        }
    }

    /// Ask the audio thread to write silence to `channel` on its next span.
    pub fn mark_channel_silent(&self, channel: usize) {
        self.state.silence_pending.set(channel);
    }

    pub fn request_stop(&self) {
        self.state.shutdown.store(true, Ordering::Release);
    }

    pub fn stop_requested(&self) -> bool {
        self.state.shutdown.load(Ordering::Acquire)
    }

    /// Frames elapsed since the most recent period interrupt.
    pub fn frames_since_cycle_start(&self) -> u32 {
        let st = &*self.state;
        let now_us = st.epoch.elapsed().as_micros() as u64;
        let at_us = st.interrupt_us.load(Ordering::Acquire);
        let rate = st.frame_rate.load(Ordering::Acquire) as u64;
        (now_us.saturating_sub(at_us) * rate / 1_000_000) as u32
    }

    pub fn monitor_mask_test(&self, channel: usize) -> bool {
        self.state.input_monitor_mask.test(channel)
    }

    pub fn silence_pending(&self, channel: usize) -> bool {
        self.state.silence_pending.test(channel)
    }

    pub fn monitor_requests(&self, channel: usize) -> u32 {
        self.state
            .monitor_requests
            .lock()
            .expect("monitor requests poisoned")
            .get(channel)
            .copied()
            .unwrap_or(0)
    }
}

/// Capture-side state the engine's process hook reads back on the audio
/// thread: base addresses of the current capture span, one per channel.
pub(crate) struct CaptureTap {
    pub(crate) addrs: Vec<*mut u8>,
    pub(crate) ports: Vec<PortHandle>,
    pub(crate) io: SampleIo,
    pub(crate) skip: usize,
    pub(crate) engine: Option<Arc<dyn GraphEngine>>,
}

// Addresses are only dereferenced on the audio thread, inside the span that
// installed them.
unsafe impl Send for CaptureTap {}

/// The driver as an engine client: capture port fill and monitor requests.
struct DriverClient {
    tap: Arc<AudioCell<CaptureTap>>,
    controls: DriverControls,
}

impl ProcessHandler for DriverClient {
    fn process(&self, frames: u32) -> i32 {
        let tap = self.tap.get();
        let Some(engine) = tap.engine.as_ref() else {
            return 0;
        };
        for (channel, port) in tap.ports.iter().enumerate() {
            if !engine.port_connected(*port) {
                continue;
            }
            let addr = tap.addrs[channel];
            if addr.is_null() {
                continue;
            }
            let buf = engine.port_buffer(*port, frames);
            if buf.is_null() {
                continue;
            }
            let dst = unsafe { std::slice::from_raw_parts_mut(buf, frames as usize) };
            unsafe { tap.io.read_samples(dst, addr, tap.skip) };
        }
        0
    }
}

impl MonitorHandler for DriverClient {
    fn monitor_request(&self, channel: usize, on: bool) {
        self.controls.request_monitor_input(channel, on);
    }
}

/// Per-channel span addresses; valid only between mmap begin and commit on
/// the audio thread.
pub(crate) struct AddrTable(pub(crate) Vec<*mut u8>);

unsafe impl Send for AddrTable {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A full cycle ran; the engine processed this many frames.
    Ran(u64),
    /// Nothing to do: poll timed out (paused device) or an xrun was
    /// repaired.
    Idle,
    /// Poll was interrupted by a signal; the cycle was skipped.
    Skipped,
}

pub struct AudioDriver<S: PcmStream> {
    pub(crate) config: DriverConfig,
    pub(crate) setup: DuplexSetup,
    card_driver: String,
    pub(crate) capture: S,
    pub(crate) playback: S,
    pub(crate) io: SampleIo,
    pub(crate) linked: bool,
    has_hw_monitoring: bool,
    has_clock_sync_reporting: bool,
    pub(crate) control: Arc<ControlState>,
    pub(crate) engine: Option<Arc<dyn GraphEngine>>,
    client: Option<ClientHandle>,
    pub(crate) capture_ports: Vec<PortHandle>,
    pub(crate) playback_ports: Vec<PortHandle>,
    pub(crate) tap: Arc<AudioCell<CaptureTap>>,
    pub(crate) chmap: ChannelMap,
    pub(crate) capture_areas: Vec<ChannelArea>,
    pub(crate) playback_areas: Vec<ChannelArea>,
    pub(crate) playback_addrs: AddrTable,
    pub(crate) mask_snapshot: ChannelMask,
    pub(crate) pending_snapshot: ChannelMask,
    all_ones: ChannelMask,
    clock_sync: Vec<ClockSyncStatus>,
    running: bool,
}

impl<S: PcmStream> AudioDriver<S> {
    /// Open both streams on `card`, negotiate a duplex configuration, try to
    /// link the streams, and select a hardware profile by card driver name.
    pub fn with_card<C>(mut card: C, config: DriverConfig) -> Result<Self>
    where
        C: SoundCard<Stream = S>,
        C::Control: 'static,
    {
        info!(
            "creating alsa driver ... {}|{}|{}",
            config.device, config.frames_per_cycle, config.sample_rate
        );

        let mut playback =
            card.open_stream(StreamDirection::Playback)
                .map_err(|source| DriverError::Open {
                    device: config.device.clone(),
                    direction: "playback",
                    source,
                })?;
        let mut capture =
            card.open_stream(StreamDirection::Capture)
                .map_err(|source| DriverError::Open {
                    device: config.device.clone(),
                    direction: "capture",
                    source,
                })?;

        let control_handle = card
            .open_control()
            .map_err(|source| DriverError::io("control open", source))?;
        let card_driver = card
            .driver_name()
            .map_err(|source| DriverError::io("control hardware info", source))?;

        let setup = configure::negotiate_duplex(&mut capture, &mut playback, &config)?;
        let linked = card.link(&mut capture, &mut playback).is_ok();

        let hw_profile = profile::for_card(
            &card_driver,
            setup.max_channels,
            setup.frame_rate,
            control_handle,
        );

        Self::assemble(config, setup, card_driver, capture, playback, linked, hw_profile)
    }

    fn assemble(
        config: DriverConfig,
        setup: DuplexSetup,
        card_driver: String,
        capture: S,
        playback: S,
        linked: bool,
        hw_profile: HardwareProfile,
    ) -> Result<Self> {
        let caps = hw_profile.caps();
        let io = SampleIo::new(setup.format, setup.min_level, setup.max_level);

        let control = Arc::new(ControlState {
            input_monitor_mask: AtomicMask::new(setup.max_channels),
            silence_pending: AtomicMask::new(setup.playback_channels),
            all_monitor_in: AtomicBool::new(false),
            // Capability alone never turns this on; routing through the card
            // is strictly opt-in.
            hw_monitoring: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            monitor_requests: Mutex::new(vec![0; setup.max_channels]),
            profile: Mutex::new(hw_profile),
            engine: Mutex::new(None),
            max_channels: setup.max_channels,
            playback_channels: setup.playback_channels,
            frame_rate: AtomicU32::new(setup.frame_rate),
            epoch: Instant::now(),
            interrupt_us: AtomicU64::new(0),
        });

        let tap = Arc::new(AudioCell::new(CaptureTap {
            addrs: vec![ptr::null_mut(); setup.capture_channels],
            ports: Vec::new(),
            io,
            skip: setup.capture_skip,
            engine: None,
        }));

        Ok(Self {
            config,
            card_driver,
            capture,
            playback,
            io,
            linked,
            has_hw_monitoring: caps.contains(Caps::HARDWARE_MONITORING),
            has_clock_sync_reporting: caps.contains(Caps::CLOCK_LOCK_REPORTING),
            control,
            engine: None,
            client: None,
            capture_ports: Vec::new(),
            playback_ports: Vec::new(),
            tap,
            chmap: ChannelMap::new(setup.playback_channels, setup.buffer_frames),
            capture_areas: vec![ChannelArea::empty(); setup.capture_channels],
            playback_areas: vec![ChannelArea::empty(); setup.playback_channels],
            playback_addrs: AddrTable(vec![ptr::null_mut(); setup.playback_channels]),
            mask_snapshot: ChannelMask::new(setup.max_channels),
            pending_snapshot: ChannelMask::new(setup.playback_channels),
            all_ones: ChannelMask::all_set(setup.max_channels),
            clock_sync: vec![ClockSyncStatus::NoLock; setup.max_channels],
            running: false,
            setup,
        })
    }

    pub fn frames_per_cycle(&self) -> u32 {
        self.setup.frames_per_cycle
    }

    pub fn sample_rate(&self) -> u32 {
        self.setup.frame_rate
    }

    pub fn buffer_frames(&self) -> u64 {
        self.setup.buffer_frames
    }

    pub fn period_interval_ms(&self) -> u64 {
        self.setup.period_interval_ms
    }

    pub fn capture_channels(&self) -> usize {
        self.setup.capture_channels
    }

    pub fn playback_channels(&self) -> usize {
        self.setup.playback_channels
    }

    pub fn interleaved(&self) -> bool {
        self.setup.interleaved
    }

    pub fn sample_format(&self) -> SampleFormat {
        self.setup.format
    }

    pub fn card_driver_name(&self) -> &str {
        &self.card_driver
    }

    pub fn streams_linked(&self) -> bool {
        self.linked
    }

    pub fn has_hw_monitoring(&self) -> bool {
        self.has_hw_monitoring
    }

    pub fn has_clock_sync_reporting(&self) -> bool {
        self.has_clock_sync_reporting
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn controls(&self) -> DriverControls {
        DriverControls {
            state: self.control.clone(),
        }
    }

    /// Become a client of `engine`: push timing parameters, register the
    /// physical ports and the process/monitor hooks, and activate.
    pub fn attach(&mut self, engine: Arc<dyn GraphEngine>) -> Result<()> {
        engine.set_buffer_size(self.setup.frames_per_cycle);
        engine.set_sample_rate(self.setup.frame_rate);

        let Some(client) = engine.register_client(CLIENT_NAME) else {
            return Err(DriverError::Config("ALSA: cannot become client".to_string()));
        };

        let driver_client = Arc::new(DriverClient {
            tap: self.tap.clone(),
            controls: self.controls(),
        });
        engine.set_process_handler(client, driver_client.clone());
        engine.set_monitor_handler(client, driver_client);

        for chn in 0..self.setup.capture_channels {
            let name = format!("Input {}", chn + 1);
            let Some(port) = engine.register_port(
                client,
                &name,
                PortFlags::OUTPUT | PortFlags::PHYSICAL | PortFlags::CAN_MONITOR,
            ) else {
                error!("ALSA: cannot register port for {name}");
                break;
            };
            info!("registered {name}");
            self.capture_ports.push(port);
        }

        for chn in 0..self.setup.playback_channels {
            let name = format!("Output {}", chn + 1);
            let Some(port) =
                engine.register_port(client, &name, PortFlags::INPUT | PortFlags::PHYSICAL)
            else {
                error!("ALSA: cannot register port for {name}");
                break;
            };
            info!("registered {name}");
            self.playback_ports.push(port);
        }

        engine.activate(client);

        // The cycle is quiescent here (attach and wait_cycle both borrow the
        // driver mutably), so the tap may be rewired.
        let tap = self.tap.get();
        tap.ports.clear();
        tap.ports.extend_from_slice(&self.capture_ports);
        tap.engine = Some(engine.clone());

        *self.control.engine.lock().expect("engine reference poisoned") = Some(engine.clone());
        self.engine = Some(engine);
        self.client = Some(client);
        Ok(())
    }

    pub fn detach(&mut self) {
        if let (Some(engine), Some(client)) = (self.engine.take(), self.client.take()) {
            for port in self.capture_ports.drain(..) {
                engine.unregister_port(client, port);
            }
            for port in self.playback_ports.drain(..) {
                engine.unregister_port(client, port);
            }
        }
        let tap = self.tap.get();
        tap.ports.clear();
        tap.engine = None;
        *self.control.engine.lock().expect("engine reference poisoned") = None;
    }

    /// Prepare both streams, push the monitor mask, prefill the whole
    /// playback ring with silence and kick the hardware off.
    pub fn start(&mut self) -> Result<()> {
        self.playback
            .prepare()
            .map_err(|e| DriverError::io("prepare (playback)", e))?;
        if !self.linked {
            self.capture
                .prepare()
                .map_err(|e| DriverError::io("prepare (capture)", e))?;
        }

        if self.control.hw_monitoring.load(Ordering::Acquire) {
            self.control
                .input_monitor_mask
                .load_into(&mut self.mask_snapshot);
            self.push_monitor_mask_snapshot();
        }

        // Fill the playback buffer with zeroes and mark every fragment as
        // carrying data.
        let avail = self
            .playback
            .avail_update()
            .map_err(|e| DriverError::io("avail_update (playback)", e))?;
        let avail = match avail {
            Avail::Frames(n) => n,
            Avail::Xrun => 0,
        };
        if avail != self.setup.buffer_frames {
            return Err(DriverError::Config(
                "ALSA-HW: full buffer not available at start".to_string(),
            ));
        }

        let (offset, granted) = self
            .playback
            .mmap_begin(self.setup.buffer_frames, &mut self.playback_areas)
            .map_err(|e| DriverError::io("mmap areas info", e))?;
        if granted != self.setup.buffer_frames {
            return Err(DriverError::Config(
                "ALSA-HW: full buffer not available at start".to_string(),
            ));
        }
        for chn in 0..self.setup.playback_channels {
            let addr = unsafe { self.playback_areas[chn].addr_at(offset) };
            unsafe {
                self.io
                    .silence(addr, self.setup.buffer_frames as usize, self.setup.playback_skip)
            };
            self.chmap.mark_done(chn);
        }
        self.playback
            .mmap_commit(offset, self.setup.buffer_frames)
            .map_err(|e| DriverError::io("mmap commit (playback)", e))?;

        self.playback
            .start()
            .map_err(|e| DriverError::io("start (playback)", e))?;
        if !self.linked {
            self.capture
                .start()
                .map_err(|e| DriverError::io("start (capture)", e))?;
        }

        let all_in = self.control.all_monitor_in.load(Ordering::Acquire);
        if self.control.hw_monitoring.load(Ordering::Acquire)
            && (all_in || self.control.input_monitor_mask.any())
        {
            if all_in {
                self.mask_snapshot.copy_from(&self.all_ones);
            } else {
                self.control
                    .input_monitor_mask
                    .load_into(&mut self.mask_snapshot);
            }
            self.push_monitor_mask_snapshot();
        }

        self.running = true;
        Ok(())
    }

    /// Drop pending frames on both streams and clear the hardware monitor
    /// mask.
    pub fn stop(&mut self) -> Result<()> {
        self.playback
            .drop_pending()
            .map_err(|e| DriverError::io("channel flush for playback", e))?;
        if !self.linked {
            self.capture
                .drop_pending()
                .map_err(|e| DriverError::io("channel flush for capture", e))?;
        }

        self.mask_snapshot.clear_all();
        self.push_monitor_mask_snapshot();
        self.running = false;
        Ok(())
    }

    fn push_monitor_mask_snapshot(&self) {
        let mut hw_profile = self.control.profile.lock().expect("hardware profile poisoned");
        if let Err(e) = hw_profile.set_input_monitor_mask(&self.mask_snapshot) {
            error!("ALSA-HW: cannot set input monitor mask: {e}");
        }
    }

    /// Renegotiate with a new period size and rate. The device must yield
    /// the same channel counts it was built with; the cross-thread masks are
    /// sized once at construction.
    pub fn reset_parameters(&mut self, frames_per_cycle: u32, rate: u32) -> Result<()> {
        if self.running {
            return Err(DriverError::Config(
                "ALSA I/O: cannot reset parameters while running".to_string(),
            ));
        }

        let mut config = self.config.clone();
        config.frames_per_cycle = frames_per_cycle;
        config.sample_rate = rate;

        let setup = configure::negotiate_duplex(&mut self.capture, &mut self.playback, &config)?;
        if setup.max_channels != self.control.max_channels
            || setup.playback_channels != self.control.playback_channels
            || setup.capture_channels != self.setup.capture_channels
        {
            return Err(DriverError::Config(
                "ALSA I/O: channel counts changed across renegotiation; rebuild the driver"
                    .to_string(),
            ));
        }

        self.config = config;
        self.setup = setup;
        self.io = SampleIo::new(setup.format, setup.min_level, setup.max_level);
        self.chmap = ChannelMap::new(setup.playback_channels, setup.buffer_frames);
        self.capture_areas = vec![ChannelArea::empty(); setup.capture_channels];
        self.playback_areas = vec![ChannelArea::empty(); setup.playback_channels];
        self.playback_addrs = AddrTable(vec![ptr::null_mut(); setup.playback_channels]);

        let tap = self.tap.get();
        tap.io = self.io;
        tap.skip = setup.capture_skip;
        tap.addrs.fill(ptr::null_mut());

        self.control.frame_rate.store(rate, Ordering::Release);
        if let Some(engine) = &self.engine {
            engine.set_buffer_size(frames_per_cycle);
        }
        Ok(())
    }

    pub fn request_monitor_input(&self, channel: usize, on: bool) {
        self.controls().request_monitor_input(channel, on);
    }

    pub fn request_all_monitor_input(&self, on: bool) {
        self.controls().request_all_monitor_input(on);
    }

    pub fn set_hw_monitoring(&self, on: bool) {
        self.controls().set_hw_monitoring(on);
    }

    pub fn mark_channel_silent(&self, channel: usize) {
        self.controls().mark_channel_silent(channel);
    }

    pub fn change_sample_clock(&mut self, mode: ClockMode) -> Result<()> {
        let mut hw_profile = self.control.profile.lock().expect("hardware profile poisoned");
        hw_profile
            .change_sample_clock(mode)
            .map_err(|e| DriverError::io("change sample clock", e))
    }

    pub fn frames_since_cycle_start(&self) -> u32 {
        self.controls().frames_since_cycle_start()
    }

    pub fn set_clock_sync_status(&mut self, channel: usize, status: ClockSyncStatus) {
        if let Some(slot) = self.clock_sync.get_mut(channel) {
            *slot = status;
            if let Some(engine) = &self.engine {
                engine.notify_clock_sync(channel, status);
            }
        }
    }

    pub fn clock_sync_status(&self, _channel: usize) -> ClockSyncStatus {
        // No card profile drives this yet; report lock.
        ClockSyncStatus::Lock
    }

    /// Frames of silence written to `channel` since its last real write,
    /// capped at the ring length.
    pub fn silent_frames(&self, channel: usize) -> u64 {
        self.chmap.silent_frames(channel)
    }
}
