use crate::hw::card::{
    AccessMode, Avail, CardControl, CardError, ChannelArea, PcmStream, PollWait, SampleFormat,
    SoundCard, StreamDirection, SwParams,
};
use alsa::hctl::{Elem, HCtl};
use alsa_sys as asys;
use nix::libc;
use std::ffi::{CStr, CString};
use std::os::raw::c_int;
use std::ptr;

fn errstr(code: c_int) -> String {
    unsafe {
        let msg = asys::snd_strerror(code);
        if msg.is_null() {
            format!("error {code}")
        } else {
            CStr::from_ptr(msg).to_string_lossy().into_owned()
        }
    }
}

fn acheck(op: &'static str, rc: c_int) -> Result<c_int, CardError> {
    if rc < 0 {
        Err(CardError::new(op, errstr(rc)))
    } else {
        Ok(rc)
    }
}

fn device_cstr(device: &str) -> Result<CString, CardError> {
    CString::new(device).map_err(|_| CardError::new("snd_pcm_open", "device name contains NUL"))
}

/// One PCM substream with its own hardware- and software-parameter objects,
/// the way alsa-lib hands them out.
pub struct AlsaStream {
    pcm: *mut asys::snd_pcm_t,
    hwp: *mut asys::snd_pcm_hw_params_t,
    swp: *mut asys::snd_pcm_sw_params_t,
    direction: StreamDirection,
    pfd: Option<libc::pollfd>,
}

// The handle moves onto the audio thread; alsa-lib handles may be used from
// one thread at a time, which the driver guarantees.
unsafe impl Send for AlsaStream {}

impl AlsaStream {
    fn open(device: &str, direction: StreamDirection) -> Result<Self, CardError> {
        let name = device_cstr(device)?;
        let stream = match direction {
            StreamDirection::Playback => asys::SND_PCM_STREAM_PLAYBACK,
            StreamDirection::Capture => asys::SND_PCM_STREAM_CAPTURE,
        };
        let mut pcm = ptr::null_mut();
        acheck("snd_pcm_open", unsafe {
            asys::snd_pcm_open(&mut pcm, name.as_ptr(), stream, 0)
        })?;

        let mut hwp = ptr::null_mut();
        if let Err(e) = acheck("snd_pcm_hw_params_malloc", unsafe {
            asys::snd_pcm_hw_params_malloc(&mut hwp)
        }) {
            unsafe { asys::snd_pcm_close(pcm) };
            return Err(e);
        }
        let mut swp = ptr::null_mut();
        if let Err(e) = acheck("snd_pcm_sw_params_malloc", unsafe {
            asys::snd_pcm_sw_params_malloc(&mut swp)
        }) {
            unsafe {
                asys::snd_pcm_hw_params_free(hwp);
                asys::snd_pcm_close(pcm);
            }
            return Err(e);
        }

        Ok(Self {
            pcm,
            hwp,
            swp,
            direction,
            pfd: None,
        })
    }
}

impl Drop for AlsaStream {
    fn drop(&mut self) {
        unsafe {
            asys::snd_pcm_sw_params_free(self.swp);
            asys::snd_pcm_hw_params_free(self.hwp);
            asys::snd_pcm_close(self.pcm);
        }
    }
}

impl PcmStream for AlsaStream {
    fn begin_negotiation(&mut self) -> Result<(), CardError> {
        acheck("snd_pcm_hw_params_any", unsafe {
            asys::snd_pcm_hw_params_any(self.pcm, self.hwp)
        })
        .map(|_| ())
    }

    fn require_integer_periods(&mut self) -> Result<(), CardError> {
        acheck("snd_pcm_hw_params_set_periods_integer", unsafe {
            asys::snd_pcm_hw_params_set_periods_integer(self.pcm, self.hwp)
        })
        .map(|_| ())
    }

    fn try_access(&mut self, access: AccessMode) -> Result<(), CardError> {
        let access = match access {
            AccessMode::MmapInterleaved => asys::SND_PCM_ACCESS_MMAP_INTERLEAVED,
            AccessMode::MmapNonInterleaved => asys::SND_PCM_ACCESS_MMAP_NONINTERLEAVED,
        };
        acheck("snd_pcm_hw_params_set_access", unsafe {
            asys::snd_pcm_hw_params_set_access(self.pcm, self.hwp, access)
        })
        .map(|_| ())
    }

    fn try_format(&mut self, format: SampleFormat) -> Result<(), CardError> {
        let format = match format {
            SampleFormat::S16Le => asys::SND_PCM_FORMAT_S16_LE,
            SampleFormat::S32Le => asys::SND_PCM_FORMAT_S32_LE,
        };
        acheck("snd_pcm_hw_params_set_format", unsafe {
            asys::snd_pcm_hw_params_set_format(self.pcm, self.hwp, format)
        })
        .map(|_| ())
    }

    fn set_rate(&mut self, hz: u32) -> Result<(), CardError> {
        acheck("snd_pcm_hw_params_set_rate", unsafe {
            asys::snd_pcm_hw_params_set_rate(self.pcm, self.hwp, hz, 0)
        })
        .map(|_| ())
    }

    fn channels_max(&self) -> Result<u32, CardError> {
        let mut channels = 0;
        acheck("snd_pcm_hw_params_get_channels_max", unsafe {
            asys::snd_pcm_hw_params_get_channels_max(self.hwp, &mut channels)
        })
        .map(|_| channels)
    }

    fn set_channels(&mut self, count: u32) -> Result<(), CardError> {
        acheck("snd_pcm_hw_params_set_channels", unsafe {
            asys::snd_pcm_hw_params_set_channels(self.pcm, self.hwp, count)
        })
        .map(|_| ())
    }

    fn set_period_frames(&mut self, frames: u64) -> Result<(), CardError> {
        acheck("snd_pcm_hw_params_set_period_size", unsafe {
            asys::snd_pcm_hw_params_set_period_size(
                self.pcm,
                self.hwp,
                frames as asys::snd_pcm_uframes_t,
                0,
            )
        })
        .map(|_| ())
    }

    fn set_period_count(&mut self, count: u32) -> Result<(), CardError> {
        acheck("snd_pcm_hw_params_set_periods", unsafe {
            asys::snd_pcm_hw_params_set_periods(self.pcm, self.hwp, count, 0)
        })
        .map(|_| ())
    }

    fn set_buffer_frames(&mut self, frames: u64) -> Result<(), CardError> {
        acheck("snd_pcm_hw_params_set_buffer_size", unsafe {
            asys::snd_pcm_hw_params_set_buffer_size(
                self.pcm,
                self.hwp,
                frames as asys::snd_pcm_uframes_t,
            )
        })
        .map(|_| ())
    }

    fn commit_hw_params(&mut self) -> Result<(), CardError> {
        acheck("snd_pcm_hw_params", unsafe {
            asys::snd_pcm_hw_params(self.pcm, self.hwp)
        })
        .map(|_| ())
    }

    fn commit_sw_params(&mut self, sw: &SwParams) -> Result<(), CardError> {
        unsafe {
            acheck("snd_pcm_sw_params_current", {
                asys::snd_pcm_sw_params_current(self.pcm, self.swp)
            })?;
            acheck("snd_pcm_sw_params_set_start_threshold", {
                asys::snd_pcm_sw_params_set_start_threshold(
                    self.pcm,
                    self.swp,
                    sw.start_threshold as asys::snd_pcm_uframes_t,
                )
            })?;
            acheck("snd_pcm_sw_params_set_stop_threshold", {
                asys::snd_pcm_sw_params_set_stop_threshold(
                    self.pcm,
                    self.swp,
                    sw.stop_threshold as asys::snd_pcm_uframes_t,
                )
            })?;
            acheck("snd_pcm_sw_params_set_silence_threshold", {
                asys::snd_pcm_sw_params_set_silence_threshold(
                    self.pcm,
                    self.swp,
                    sw.silence_threshold as asys::snd_pcm_uframes_t,
                )
            })?;
            acheck("snd_pcm_sw_params_set_silence_size", {
                asys::snd_pcm_sw_params_set_silence_size(
                    self.pcm,
                    self.swp,
                    sw.silence_size as asys::snd_pcm_uframes_t,
                )
            })?;
            acheck("snd_pcm_sw_params_set_avail_min", {
                asys::snd_pcm_sw_params_set_avail_min(
                    self.pcm,
                    self.swp,
                    sw.avail_min as asys::snd_pcm_uframes_t,
                )
            })?;
            acheck("snd_pcm_sw_params", asys::snd_pcm_sw_params(self.pcm, self.swp)).map(|_| ())
        }
    }

    fn current_access(&self) -> Result<AccessMode, CardError> {
        let mut access = 0;
        acheck("snd_pcm_hw_params_get_access", unsafe {
            asys::snd_pcm_hw_params_get_access(self.hwp, &mut access)
        })?;
        match access {
            asys::SND_PCM_ACCESS_MMAP_INTERLEAVED => Ok(AccessMode::MmapInterleaved),
            asys::SND_PCM_ACCESS_MMAP_NONINTERLEAVED => Ok(AccessMode::MmapNonInterleaved),
            other => Err(CardError::new(
                "snd_pcm_hw_params_get_access",
                format!("unexpected access mode {other}"),
            )),
        }
    }

    fn current_format(&self) -> Result<SampleFormat, CardError> {
        let mut format = 0;
        acheck("snd_pcm_hw_params_get_format", unsafe {
            asys::snd_pcm_hw_params_get_format(self.hwp, &mut format)
        })?;
        match format {
            asys::SND_PCM_FORMAT_S16_LE => Ok(SampleFormat::S16Le),
            asys::SND_PCM_FORMAT_S32_LE => Ok(SampleFormat::S32Le),
            other => Err(CardError::new(
                "snd_pcm_hw_params_get_format",
                format!("unexpected sample format {other}"),
            )),
        }
    }

    fn current_channels(&self) -> Result<u32, CardError> {
        let mut channels = 0;
        acheck("snd_pcm_hw_params_get_channels", unsafe {
            asys::snd_pcm_hw_params_get_channels(self.hwp, &mut channels)
        })
        .map(|_| channels)
    }

    fn current_period_frames(&self) -> Result<u64, CardError> {
        let mut frames: asys::snd_pcm_uframes_t = 0;
        let mut dir = 0;
        acheck("snd_pcm_hw_params_get_period_size", unsafe {
            asys::snd_pcm_hw_params_get_period_size(self.hwp, &mut frames, &mut dir)
        })
        .map(|_| frames as u64)
    }

    fn current_period_count(&self) -> Result<u32, CardError> {
        let mut periods = 0;
        let mut dir = 0;
        acheck("snd_pcm_hw_params_get_periods", unsafe {
            asys::snd_pcm_hw_params_get_periods(self.hwp, &mut periods, &mut dir)
        })
        .map(|_| periods)
    }

    fn prepare(&mut self) -> Result<(), CardError> {
        self.pfd = None;
        acheck("snd_pcm_prepare", unsafe { asys::snd_pcm_prepare(self.pcm) }).map(|_| ())
    }

    fn start(&mut self) -> Result<(), CardError> {
        acheck("snd_pcm_start", unsafe { asys::snd_pcm_start(self.pcm) }).map(|_| ())
    }

    fn drop_pending(&mut self) -> Result<(), CardError> {
        acheck("snd_pcm_drop", unsafe { asys::snd_pcm_drop(self.pcm) }).map(|_| ())
    }

    fn avail_update(&mut self) -> Result<Avail, CardError> {
        let avail = unsafe { asys::snd_pcm_avail_update(self.pcm) };
        if avail == -(libc::EPIPE as asys::snd_pcm_sframes_t) {
            return Ok(Avail::Xrun);
        }
        if avail < 0 {
            return Err(CardError::new("snd_pcm_avail_update", errstr(avail as c_int)));
        }
        Ok(Avail::Frames(avail as u64))
    }

    fn mmap_begin(
        &mut self,
        want: u64,
        areas: &mut [ChannelArea],
    ) -> Result<(u64, u64), CardError> {
        let mut raw_areas: *const asys::snd_pcm_channel_area_t = ptr::null();
        let mut offset: asys::snd_pcm_uframes_t = 0;
        let mut frames: asys::snd_pcm_uframes_t = want as asys::snd_pcm_uframes_t;
        acheck("snd_pcm_mmap_begin", unsafe {
            asys::snd_pcm_mmap_begin(self.pcm, &mut raw_areas, &mut offset, &mut frames)
        })?;
        for (chn, out) in areas.iter_mut().enumerate() {
            let area = unsafe { &*raw_areas.add(chn) };
            *out = ChannelArea {
                base: area.addr as *mut u8,
                first_bits: area.first as u64,
                step_bits: area.step as u64,
            };
        }
        Ok((offset as u64, frames as u64))
    }

    fn mmap_commit(&mut self, offset: u64, frames: u64) -> Result<(), CardError> {
        let committed = unsafe {
            asys::snd_pcm_mmap_commit(
                self.pcm,
                offset as asys::snd_pcm_uframes_t,
                frames as asys::snd_pcm_uframes_t,
            )
        };
        if committed < 0 {
            return Err(CardError::new("snd_pcm_mmap_commit", errstr(committed as c_int)));
        }
        Ok(())
    }

    fn delay(&mut self) -> Result<i64, CardError> {
        let mut frames: asys::snd_pcm_sframes_t = 0;
        acheck("snd_pcm_delay", unsafe {
            asys::snd_pcm_delay(self.pcm, &mut frames)
        })
        .map(|_| frames as i64)
    }

    fn poll_wait(&mut self, timeout_ms: i32) -> PollWait {
        if self.pfd.is_none() {
            let mut pfd: libc::pollfd = unsafe { std::mem::zeroed() };
            let rc = unsafe {
                asys::snd_pcm_poll_descriptors(self.pcm, &mut pfd as *mut libc::pollfd as *mut _, 1)
            };
            if rc != 1 {
                return PollWait::Error(format!("snd_pcm_poll_descriptors returned {rc}"));
            }
            pfd.events = match self.direction {
                StreamDirection::Playback => libc::POLLOUT | libc::POLLERR,
                StreamDirection::Capture => libc::POLLIN | libc::POLLERR,
            };
            self.pfd = Some(pfd);
        }

        let pfd = match self.pfd.as_mut() {
            Some(pfd) => pfd,
            None => return PollWait::Error("no poll descriptor".to_string()),
        };
        pfd.revents = 0;
        let rc = unsafe { libc::poll(pfd, 1, timeout_ms as libc::c_int) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return PollWait::Interrupted;
            }
            return PollWait::Error(format!("poll call failed ({err})"));
        }
        if (pfd.revents & libc::POLLERR) != 0 {
            return PollWait::Error("poll reports error".to_string());
        }
        if pfd.revents == 0 {
            return PollWait::Timeout;
        }
        PollWait::Ready
    }
}

/// Control-interface handle wrapping the card's hctl tree.
pub struct AlsaControl {
    hctl: HCtl,
}

// Serialized behind the driver's profile mutex; never used concurrently.
unsafe impl Send for AlsaControl {}

impl AlsaControl {
    fn open(device: &str) -> Result<Self, CardError> {
        let name = device_cstr(device)?;
        let hctl = HCtl::open(&name, false)
            .map_err(|e| CardError::new("snd_hctl_open", e.to_string()))?;
        hctl.load()
            .map_err(|e| CardError::new("snd_hctl_load", e.to_string()))?;
        Ok(Self { hctl })
    }

    fn find_elem(&self, name: &str) -> Result<Elem<'_>, CardError> {
        self.hctl
            .elem_iter()
            .find(|elem| {
                elem.get_id()
                    .ok()
                    .and_then(|id| id.get_name().map(|n| n == name).ok())
                    .unwrap_or(false)
            })
            .ok_or_else(|| {
                CardError::new("snd_hctl_find_elem", format!("no element \"{name}\""))
            })
    }
}

impl CardControl for AlsaControl {
    fn write_switches(&mut self, element: &str, values: &[bool]) -> Result<(), CardError> {
        let elem = self.find_elem(element)?;
        let mut value = elem
            .read()
            .map_err(|e| CardError::new("snd_hctl_elem_read", e.to_string()))?;
        for (idx, &on) in values.iter().enumerate() {
            // Cards may expose fewer switches than channels; extra writes
            // are simply ignored.
            let _ = value.set_boolean(idx as u32, on);
        }
        elem.write(&value)
            .map_err(|e| CardError::new("snd_hctl_elem_write", e.to_string()))?;
        Ok(())
    }

    fn write_enum(&mut self, element: &str, index: u32) -> Result<(), CardError> {
        let elem = self.find_elem(element)?;
        let mut value = elem
            .read()
            .map_err(|e| CardError::new("snd_hctl_elem_read", e.to_string()))?;
        let _ = value.set_enumerated(0, index);
        elem.write(&value)
            .map_err(|e| CardError::new("snd_hctl_elem_write", e.to_string()))?;
        Ok(())
    }
}

/// A named ALSA device ("hw:0" and friends).
pub struct AlsaCard {
    device: String,
}

impl AlsaCard {
    pub fn new(device: &str) -> Self {
        Self {
            device: device.to_string(),
        }
    }
}

impl SoundCard for AlsaCard {
    type Stream = AlsaStream;
    type Control = AlsaControl;

    fn open_stream(&mut self, direction: StreamDirection) -> Result<AlsaStream, CardError> {
        AlsaStream::open(&self.device, direction)
    }

    fn open_control(&mut self) -> Result<AlsaControl, CardError> {
        AlsaControl::open(&self.device)
    }

    fn driver_name(&mut self) -> Result<String, CardError> {
        let name = device_cstr(&self.device)?;
        let ctl = alsa::Ctl::open(&name, false)
            .map_err(|e| CardError::new("snd_ctl_open", e.to_string()))?;
        let info = ctl
            .card_info()
            .map_err(|e| CardError::new("snd_ctl_card_info", e.to_string()))?;
        let driver = info
            .get_driver()
            .map_err(|e| CardError::new("snd_ctl_card_info_get_driver", e.to_string()))?;
        Ok(driver.to_string())
    }

    fn link(
        &mut self,
        capture: &mut AlsaStream,
        playback: &mut AlsaStream,
    ) -> Result<(), CardError> {
        acheck("snd_pcm_link", unsafe {
            asys::snd_pcm_link(capture.pcm, playback.pcm)
        })
        .map(|_| ())
    }
}
