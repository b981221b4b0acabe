use crate::error::{DriverError, Result};
use crate::hw::card::{AccessMode, CardError, PcmStream, SampleFormat, SwParams, THRESHOLD_NEVER};
use crate::hw::options::DriverConfig;

pub const PERIODS_PER_BUFFER: u32 = 2;

/// Anything above this is the "default" PCM device advertising its
/// up-to-16-million-channel route; clamp such devices to stereo.
const CHANNEL_SANITY_LIMIT: u32 = 1024;
const DEFAULT_DEVICE_CHANNELS: u32 = 2;

#[derive(Debug, Clone, Copy)]
pub struct StreamSetup {
    pub access: AccessMode,
    pub format: SampleFormat,
    pub channels: u32,
    pub period_frames: u64,
    pub periods: u32,
}

/// Negotiated duplex configuration, immutable for the driver's lifetime
/// (until `reset_parameters`).
#[derive(Debug, Clone, Copy)]
pub struct DuplexSetup {
    pub frames_per_cycle: u32,
    pub frame_rate: u32,
    pub nfragments: u32,
    pub buffer_frames: u64,
    pub format: SampleFormat,
    pub sample_bytes: usize,
    pub interleaved: bool,
    pub interleave_unit: usize,
    pub capture_skip: usize,
    pub playback_skip: usize,
    pub capture_channels: usize,
    pub playback_channels: usize,
    pub max_channels: usize,
    pub user_channels: usize,
    pub min_level: i32,
    pub max_level: i32,
    pub period_interval_ms: u64,
}

pub fn configure_stream<S: PcmStream>(
    stream: &mut S,
    name: &'static str,
    frames_per_cycle: u32,
    rate: u32,
) -> Result<StreamSetup> {
    let fail = |source: CardError| DriverError::Configure {
        stream: name,
        source,
    };

    stream.begin_negotiation().map_err(fail)?;
    stream.require_integer_periods().map_err(fail)?;

    if stream.try_access(AccessMode::MmapNonInterleaved).is_err()
        && stream.try_access(AccessMode::MmapInterleaved).is_err()
    {
        return Err(DriverError::Config(format!(
            "ALSA: mmap-based access is not possible for the {name} stream of this audio interface"
        )));
    }

    if stream.try_format(SampleFormat::S32Le).is_err()
        && stream.try_format(SampleFormat::S16Le).is_err()
    {
        return Err(DriverError::Config(format!(
            "ALSA: the {name} stream supports neither of the two usable hardware sample formats (S32_LE, S16_LE)"
        )));
    }

    stream.set_rate(rate).map_err(fail)?;

    let mut channels = stream.channels_max().map_err(fail)?;
    if channels > CHANNEL_SANITY_LIMIT {
        channels = DEFAULT_DEVICE_CHANNELS;
    }
    stream.set_channels(channels).map_err(fail)?;

    stream
        .set_period_frames(frames_per_cycle as u64)
        .map_err(fail)?;
    stream.set_period_count(PERIODS_PER_BUFFER).map_err(fail)?;
    stream
        .set_buffer_frames(PERIODS_PER_BUFFER as u64 * frames_per_cycle as u64)
        .map_err(fail)?;
    stream.commit_hw_params().map_err(fail)?;

    let periods = stream.current_period_count().map_err(fail)?;
    stream
        .commit_sw_params(&SwParams {
            start_threshold: THRESHOLD_NEVER,
            stop_threshold: THRESHOLD_NEVER,
            silence_threshold: 0,
            silence_size: frames_per_cycle as u64 * periods as u64,
            avail_min: frames_per_cycle as u64,
        })
        .map_err(fail)?;

    Ok(StreamSetup {
        access: stream.current_access().map_err(fail)?,
        format: stream.current_format().map_err(fail)?,
        channels: stream.current_channels().map_err(fail)?,
        period_frames: stream.current_period_frames().map_err(fail)?,
        periods,
    })
}

pub fn negotiate_duplex<S: PcmStream>(
    capture: &mut S,
    playback: &mut S,
    config: &DriverConfig,
) -> Result<DuplexSetup> {
    let fpc = config.frames_per_cycle;
    let rate = config.sample_rate;

    let c = configure_stream(capture, "capture", fpc, rate)?;
    let p = configure_stream(playback, "playback", fpc, rate)?;

    // The fragment size is non-negotiable.
    if c.period_frames != fpc as u64 || p.period_frames != fpc as u64 {
        return Err(DriverError::Config(format!(
            "ALSA I/O: requested an interrupt every {fpc} frames but got {}c/{}p frames",
            c.period_frames, p.period_frames
        )));
    }

    if c.periods != p.periods {
        return Err(DriverError::Config(
            "ALSA I/O: different period counts for playback and capture".to_string(),
        ));
    }

    if c.format != p.format {
        return Err(DriverError::Config(format!(
            "ALSA: \"{}\" does not support the same sample format for capture and playback",
            config.device
        )));
    }

    if c.access != p.access {
        return Err(DriverError::Config(
            "ALSA: the playback and capture components of this audio interface differ in their use of channel interleaving"
                .to_string(),
        ));
    }

    let format = p.format;
    let sample_bytes = format.bytes();
    let interleaved = c.access == AccessMode::MmapInterleaved;

    let capture_channels = c.channels as usize;
    let playback_channels = p.channels as usize;

    let (interleave_unit, capture_skip, playback_skip) = if interleaved {
        (
            sample_bytes,
            sample_bytes * capture_channels,
            sample_bytes * playback_channels,
        )
    } else {
        (0, sample_bytes, sample_bytes)
    };

    let (min_default, max_default) = format.level_bounds();

    Ok(DuplexSetup {
        frames_per_cycle: fpc,
        frame_rate: rate,
        nfragments: c.periods,
        buffer_frames: fpc as u64 * c.periods as u64,
        format,
        sample_bytes,
        interleaved,
        interleave_unit,
        capture_skip,
        playback_skip,
        capture_channels,
        playback_channels,
        max_channels: capture_channels.max(playback_channels),
        user_channels: capture_channels.min(playback_channels),
        min_level: if config.min_level != 0 { config.min_level } else { min_default },
        max_level: if config.max_level != 0 { config.max_level } else { max_default },
        period_interval_ms: (fpc as u64 * 1000) / rate as u64,
    })
}
