use crate::bitset::ChannelMask;
use crate::hw::card::{CardControl, CardError};
use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Caps: u32 {
        /// The card can route inputs to outputs without a software copy.
        const HARDWARE_MONITORING = 1 << 0;
        /// The card reports per-channel sample-clock lock status.
        const CLOCK_LOCK_REPORTING = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockMode {
    /// Card generates the sample clock.
    Master,
    /// Card slaves to its digital input.
    AutoSync,
}

/// Card-specific register writes behind the profile. Only cards with real
/// monitoring hardware implement anything here.
pub trait MonitorBackend: Send {
    fn write_monitor_mask(&mut self, mask: &ChannelMask) -> Result<(), CardError>;
    fn write_clock_mode(&mut self, mode: ClockMode) -> Result<(), CardError>;
}

/// Per-card capability profile plus the last monitor mask pushed to the
/// card, so the cycle can skip redundant writes.
pub struct HardwareProfile {
    caps: Caps,
    mask: ChannelMask,
    backend: Box<dyn MonitorBackend>,
}

impl std::fmt::Debug for HardwareProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardwareProfile")
            .field("caps", &self.caps)
            .field("mask", &self.mask)
            .finish()
    }
}

impl HardwareProfile {
    pub fn new(caps: Caps, channels: usize, backend: Box<dyn MonitorBackend>) -> Self {
        Self {
            caps,
            mask: ChannelMask::new(channels),
            backend,
        }
    }

    pub fn caps(&self) -> Caps {
        self.caps
    }

    /// Mask currently active on the card.
    pub fn input_monitor_mask(&self) -> &ChannelMask {
        &self.mask
    }

    pub fn set_input_monitor_mask(&mut self, mask: &ChannelMask) -> Result<(), CardError> {
        self.backend.write_monitor_mask(mask)?;
        self.mask.copy_from(mask);
        Ok(())
    }

    pub fn change_sample_clock(&mut self, mode: ClockMode) -> Result<(), CardError> {
        self.backend.write_clock_mode(mode)
    }
}

/// Cards without monitoring hardware: every write is a no-op.
#[derive(Debug, Default)]
pub struct GenericMonitor;

impl MonitorBackend for GenericMonitor {
    fn write_monitor_mask(&mut self, _mask: &ChannelMask) -> Result<(), CardError> {
        Ok(())
    }

    fn write_clock_mode(&mut self, _mode: ClockMode) -> Result<(), CardError> {
        Ok(())
    }
}

pub const HAMMERFALL_DRIVER: &str = "RME9652";

const HAMMERFALL_THRU_ELEMENT: &str = "Channels Thru";
const HAMMERFALL_CLOCK_ELEMENT: &str = "Sample Clock Source";

/// RME Digi9652 (Hammerfall): per-channel passthru switches and a selectable
/// sample-clock source.
pub struct HammerfallMonitor<C: CardControl> {
    control: C,
    channels: usize,
    rate: u32,
    switches: Vec<bool>,
}

impl<C: CardControl> HammerfallMonitor<C> {
    pub fn new(control: C, channels: usize, rate: u32) -> Self {
        Self {
            control,
            channels,
            rate,
            switches: vec![false; channels],
        }
    }
}

impl<C: CardControl> MonitorBackend for HammerfallMonitor<C> {
    fn write_monitor_mask(&mut self, mask: &ChannelMask) -> Result<(), CardError> {
        for (channel, switch) in self.switches.iter_mut().enumerate() {
            *switch = mask.test(channel);
        }
        self.control
            .write_switches(HAMMERFALL_THRU_ELEMENT, &self.switches)
    }

    fn write_clock_mode(&mut self, mode: ClockMode) -> Result<(), CardError> {
        let index = match mode {
            ClockMode::AutoSync => 0,
            ClockMode::Master => match self.rate {
                44_100 => 1,
                48_000 => 2,
                88_200 => 3,
                96_000 => 4,
                _ => 2,
            },
        };
        self.control.write_enum(HAMMERFALL_CLOCK_ELEMENT, index)
    }
}

/// Select the profile for a card by its advertised kernel driver name.
pub fn for_card<C: CardControl + 'static>(
    driver_name: &str,
    channels: usize,
    rate: u32,
    control: C,
) -> HardwareProfile {
    if driver_name == HAMMERFALL_DRIVER {
        HardwareProfile::new(
            Caps::HARDWARE_MONITORING | Caps::CLOCK_LOCK_REPORTING,
            channels,
            Box::new(HammerfallMonitor::new(control, channels, rate)),
        )
    } else {
        HardwareProfile::new(Caps::empty(), channels, Box::new(GenericMonitor))
    }
}
