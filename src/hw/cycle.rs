use crate::error::{DriverError, Result};
use crate::hw::card::{Avail, PcmStream, PollWait};
use crate::hw::driver::{AudioDriver, CycleOutcome};
use std::sync::atomic::Ordering;
use tracing::{error, info, warn};

const POLL_TIMEOUT_MS: i32 = 1000;

impl<S: PcmStream> AudioDriver<S> {
    /// One pass of the real-time loop: wait for the period interrupt, then
    /// process every contiguous span both streams have available. Runs on
    /// the audio thread only; the only suspension point is the poll.
    pub fn wait_cycle(&mut self) -> Result<CycleOutcome> {
        loop {
            match self.playback.poll_wait(POLL_TIMEOUT_MS) {
                PollWait::Ready => break,
                PollWait::Timeout => {
                    // Timed out, such as when the device is paused.
                    self.control.note_interrupt();
                    return Ok(CycleOutcome::Idle);
                }
                PollWait::Interrupted => {
                    info!("poll interrupt");
                    if self.config.poll_retry_on_interrupt {
                        continue;
                    }
                    return Ok(CycleOutcome::Skipped);
                }
                PollWait::Error(msg) => return Err(DriverError::Poll(msg)),
            }
        }
        self.control.note_interrupt();

        let mut xrun_detected = false;
        let capture_avail = match self.capture.avail_update() {
            Ok(Avail::Frames(n)) => n,
            Ok(Avail::Xrun) => {
                xrun_detected = true;
                0
            }
            Err(e) => {
                error!("unknown ALSA avail_update return value on capture ({e})");
                0
            }
        };
        let playback_avail = match self.playback.avail_update() {
            Ok(Avail::Frames(n)) => n,
            Ok(Avail::Xrun) => {
                xrun_detected = true;
                0
            }
            Err(e) => {
                error!("unknown ALSA avail_update return value on playback ({e})");
                0
            }
        };

        if xrun_detected {
            self.recover_from_xrun()?;
            return Ok(CycleOutcome::Idle);
        }

        let engine = self.engine.clone();
        let mut avail = capture_avail.min(playback_avail);
        let mut processed = 0u64;

        while avail > 0 {
            let want = avail.min(self.setup.frames_per_cycle as u64);

            let (capture_offset, capture_granted) = self
                .capture
                .mmap_begin(want, &mut self.capture_areas)
                .map_err(|e| DriverError::io("mmap areas info (capture)", e))?;
            let (playback_offset, playback_granted) = self
                .playback
                .mmap_begin(want, &mut self.playback_areas)
                .map_err(|e| DriverError::io("mmap areas info (playback)", e))?;
            let contiguous = capture_granted.min(playback_granted);
            if contiguous == 0 {
                // A zero grant would spin this loop forever.
                break;
            }

            {
                let tap = self.tap.get();
                for (chn, area) in self.capture_areas.iter().enumerate() {
                    tap.addrs[chn] = unsafe { area.addr_at(capture_offset) };
                }
            }
            for (chn, area) in self.playback_areas.iter().enumerate() {
                self.playback_addrs.0[chn] = unsafe { area.addr_at(playback_offset) };
            }

            // Channels whose monitor feed stopped since the last cycle keep
            // ringing with stale samples; scrub them first.
            self.control
                .silence_pending
                .take_into(&mut self.pending_snapshot);
            for chn in self.pending_snapshot.ones() {
                let addr = self.playback_addrs.0[chn];
                unsafe {
                    self.io
                        .silence(addr, contiguous as usize, self.setup.playback_skip)
                };
            }

            self.chmap.begin_cycle();

            let hw_monitoring = self.control.hw_monitoring.load(Ordering::Acquire);
            let all_monitor_in = self.control.all_monitor_in.load(Ordering::Acquire);
            self.control
                .input_monitor_mask
                .load_into(&mut self.mask_snapshot);

            if hw_monitoring && !all_monitor_in {
                // Push a changed mask to the card. Never block the audio
                // thread on the control thread's lock; a contended cycle
                // catches up on the next one.
                if let Ok(mut hw_profile) = self.control.profile.try_lock() {
                    if hw_profile.input_monitor_mask() != &self.mask_snapshot {
                        if let Err(e) = hw_profile.set_input_monitor_mask(&self.mask_snapshot) {
                            error!("ALSA-HW: cannot set input monitor mask: {e}");
                        }
                    }
                }
            }

            if let Some(engine) = engine.as_ref() {
                if engine.process(contiguous as u32) != 0 {
                    error!("ALSA I/O: engine processing error - stopping");
                    return Err(DriverError::EngineProcess);
                }

                // Move data from ports to hardware channels.
                for chn in 0..self.playback_ports.len() {
                    let port = self.playback_ports[chn];
                    if !engine.port_connected(port) {
                        continue;
                    }
                    let buf = engine.port_buffer(port, contiguous as u32);
                    if buf.is_null() {
                        continue;
                    }
                    let src = unsafe { std::slice::from_raw_parts(buf, contiguous as usize) };
                    let addr = self.playback_addrs.0[chn];
                    unsafe {
                        self.io
                            .write_samples(addr, src, self.setup.playback_skip, 1.0)
                    };
                    self.chmap.mark_done(chn);
                }
            }

            // Input monitoring in software when the card is not doing it.
            if !hw_monitoring && (all_monitor_in || self.mask_snapshot.any()) {
                for chn in 0..self.setup.user_channels {
                    if !all_monitor_in && !self.mask_snapshot.test(chn) {
                        continue;
                    }
                    let src = self.tap.get().addrs[chn];
                    let dst = self.playback_addrs.0[chn];
                    unsafe {
                        self.io.copy_samples(
                            dst,
                            src,
                            contiguous as usize,
                            self.setup.playback_skip,
                            self.setup.capture_skip,
                        )
                    };
                    self.chmap.mark_done(chn);
                }
            }

            if self.chmap.any_not_done() {
                let addr_table = &self.playback_addrs.0;
                let io = self.io;
                let skip = self.setup.playback_skip;
                self.chmap.silence_untouched(contiguous, |chn| {
                    let addr = addr_table[chn];
                    unsafe { io.silence(addr, contiguous as usize, skip) };
                });
            }

            self.capture
                .mmap_commit(capture_offset, contiguous)
                .map_err(|e| DriverError::io("mmap commit (capture)", e))?;
            self.playback
                .mmap_commit(playback_offset, contiguous)
                .map_err(|e| DriverError::io("mmap commit (playback)", e))?;

            avail -= contiguous;
            processed += contiguous;
        }

        Ok(CycleOutcome::Ran(processed))
    }

    /// Stop-and-start recovery after a broken-pipe report from either
    /// stream. The interrupted cycle's work is discarded.
    fn recover_from_xrun(&mut self) -> Result<()> {
        let capture_delay = self
            .capture
            .delay()
            .map_err(|e| DriverError::io("cannot determine capture delay", e))?;
        warn!(
            "ALSA I/O: xrun of {} frames ({:.3} msecs)",
            capture_delay,
            capture_delay as f64 / self.setup.frame_rate as f64 * 1000.0
        );

        if let Some(engine) = &self.engine {
            if !engine.xruns_recoverable() {
                return Err(DriverError::UnrecoverableXrun);
            }
        }

        self.stop()?;
        self.start()?;
        Ok(())
    }
}
