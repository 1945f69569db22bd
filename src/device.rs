/// Device profiles. A profile decides the default radio settings for a channel
/// and how the eight byte broadcast payload maps to measurements. As new devices
/// are added to the library, the enums here will be extended for each type of device.
pub mod hrm;
pub mod powermeter;
pub mod weightscale;

use serde::Serialize;
use thiserror::Error;

use crate::message::{bytes_to_u16, combine};

// Current supported devices
use hrm::{HeartRateData, HeartRateMonitor};
use powermeter::{PowerData, PowerMeter};
use weightscale::{WeightData, WeightScale};

/// ANT+ default RF channel, 2457 MHz.
pub const ANT_PLUS_FREQUENCY: u8 = 57;

const COMMON_MANUFACTURER_INFO: u8 = 0x50;
const COMMON_PRODUCT_INFO: u8 = 0x51;
const COMMON_BATTERY_STATUS: u8 = 0x52;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    HeartRate,
    BicyclePower,
    WeightScale,
}

impl Profile {
    /// Profile for a device type. The pairing bit is ignored.
    pub fn from_device_type(device_type: u8) -> Option<Profile> {
        match device_type & 0x7F {
            hrm::DEVICE_TYPE => Some(Profile::HeartRate),
            powermeter::DEVICE_TYPE => Some(Profile::BicyclePower),
            weightscale::DEVICE_TYPE => Some(Profile::WeightScale),
            _ => None,
        }
    }

    pub fn default_period(self) -> u16 {
        match self {
            Profile::HeartRate => hrm::PERIOD,
            Profile::BicyclePower => powermeter::PERIOD,
            Profile::WeightScale => weightscale::PERIOD,
        }
    }

    /// Fresh decoder state for a channel using this profile.
    pub fn device(self) -> Device {
        match self {
            Profile::HeartRate => Device::HeartRateMonitor(HeartRateMonitor::new()),
            Profile::BicyclePower => Device::PowerMeter(PowerMeter::new()),
            Profile::WeightScale => Device::WeightScale(WeightScale::new()),
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("unrecognized data page 0x{page:02X} for {profile:?}")]
pub struct UnrecognizedPage {
    pub profile: Profile,
    pub page: u8,
}

/// Decoder state for one channel.
#[derive(Debug, PartialEq, Clone)]
pub enum Device {
    HeartRateMonitor(HeartRateMonitor),
    PowerMeter(PowerMeter),
    WeightScale(WeightScale),
}

impl Device {
    pub fn profile(&self) -> Profile {
        match self {
            Device::HeartRateMonitor(_) => Profile::HeartRate,
            Device::PowerMeter(_) => Profile::BicyclePower,
            Device::WeightScale(_) => Profile::WeightScale,
        }
    }

    /// Decode one broadcast payload.
    pub fn decode(&mut self, data: &[u8; 8]) -> Result<Decoded, UnrecognizedPage> {
        match self {
            Device::HeartRateMonitor(device) => device.decode_broadcast_data(data),
            Device::PowerMeter(device) => device.decode_broadcast_data(data),
            Device::WeightScale(device) => device.decode_broadcast_data(data),
        }
    }
}

/// A decoded broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub measurement: Measurement,
    pub quality: Quality,
    /// Same sensor event as the previous broadcast.
    pub repeated: bool,
}

impl Decoded {
    pub(crate) fn new(measurement: Measurement) -> Self {
        Decoded {
            measurement,
            quality: Quality::Ok,
            repeated: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Measurement {
    HeartRate(HeartRateData),
    Power(PowerData),
    Weight(WeightData),
    Common(CommonPage),
}

impl Measurement {
    pub fn kind(&self) -> &'static str {
        match self {
            Measurement::HeartRate(_) => "heart_rate",
            Measurement::Power(_) => "power",
            Measurement::Weight(_) => "weight",
            Measurement::Common(_) => "common",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    Ok,
    /// Event counter jumped further than one broadcast period allows.
    DroppedBroadcast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatteryStatus {
    New,
    Good,
    Ok,
    Low,
    Critical,
    Invalid,
}

impl BatteryStatus {
    /// Status from bits 4-6 of the descriptive bit field.
    pub fn from_descriptive(bits: u8) -> Self {
        match (bits >> 4) & 0x07 {
            1 => BatteryStatus::New,
            2 => BatteryStatus::Good,
            3 => BatteryStatus::Ok,
            4 => BatteryStatus::Low,
            5 => BatteryStatus::Critical,
            _ => BatteryStatus::Invalid,
        }
    }
}

/// Battery voltage from the fractional byte and the coarse nibble of the
/// descriptive bit field. A coarse value of 0x0F means not available.
pub(crate) fn battery_voltage(fractional: u8, descriptive: u8) -> Option<f32> {
    let coarse = descriptive & 0x0F;
    if coarse == 0x0F {
        return None;
    }
    Some(coarse as f32 + fractional as f32 / 256.0)
}

/// ANT+ common data pages shared by most profiles.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommonPage {
    Manufacturer {
        hardware_revision: u8,
        manufacturer_id: u16,
        model_number: u16,
    },
    Product {
        software_revision: u8,
        serial_number: Option<u32>,
    },
    Battery {
        operating_time: u32,
        voltage: Option<f32>,
        status: BatteryStatus,
    },
}

/// Decode pages 0x50-0x52. Returns `None` for any other page.
pub(crate) fn decode_common(data: &[u8; 8]) -> Option<CommonPage> {
    match data[0] {
        COMMON_MANUFACTURER_INFO => Some(CommonPage::Manufacturer {
            hardware_revision: data[3],
            manufacturer_id: bytes_to_u16(&data[4..6]),
            model_number: bytes_to_u16(&data[6..8]),
        }),
        COMMON_PRODUCT_INFO => {
            let serial = combine(&data[4..8]);
            Some(CommonPage::Product {
                software_revision: data[3],
                serial_number: if serial == 0xFFFF_FFFF {
                    None
                } else {
                    Some(serial)
                },
            })
        }
        COMMON_BATTERY_STATUS => {
            // Bit 7 selects 2 s or 16 s resolution for the operating time.
            let units = if data[7] & 0x80 == 0x80 { 2 } else { 16 };
            Some(CommonPage::Battery {
                operating_time: combine(&data[3..6]) * units,
                voltage: battery_voltage(data[6], data[7]),
                status: BatteryStatus::from_descriptive(data[7]),
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn profile_from_device_type() {
        assert_eq!(Profile::from_device_type(0x78), Some(Profile::HeartRate));
        assert_eq!(Profile::from_device_type(0xF8), Some(Profile::HeartRate));
        assert_eq!(Profile::from_device_type(0x0B), Some(Profile::BicyclePower));
        assert_eq!(Profile::from_device_type(0x77), Some(Profile::WeightScale));
        assert_eq!(Profile::from_device_type(0x11), None);
    }

    #[test]
    fn device_keeps_profile() {
        for profile in [
            Profile::HeartRate,
            Profile::BicyclePower,
            Profile::WeightScale,
        ]
        .iter()
        {
            assert_eq!(profile.device().profile(), *profile);
        }
    }

    #[test]
    fn battery_status_bits() {
        assert_eq!(BatteryStatus::from_descriptive(0x13), BatteryStatus::New);
        assert_eq!(BatteryStatus::from_descriptive(0x23), BatteryStatus::Good);
        assert_eq!(BatteryStatus::from_descriptive(0x43), BatteryStatus::Low);
        assert_eq!(BatteryStatus::from_descriptive(0x70), BatteryStatus::Invalid);
        assert_eq!(battery_voltage(128, 0x13), Some(3.5));
        assert_eq!(battery_voltage(128, 0x1F), None);
    }

    #[test]
    fn common_manufacturer_page() {
        let page = decode_common(&[0x50, 0xFF, 0xFF, 0x05, 0x01, 0x00, 0x39, 0x30]);
        assert_eq!(
            page,
            Some(CommonPage::Manufacturer {
                hardware_revision: 5,
                manufacturer_id: 1,
                model_number: 12345,
            })
        );
    }

    #[test]
    fn common_product_page() {
        let page = decode_common(&[0x51, 0xFF, 0xFF, 0x0A, 0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(
            page,
            Some(CommonPage::Product {
                software_revision: 10,
                serial_number: None,
            })
        );
    }

    #[test]
    fn common_battery_page() {
        let page = decode_common(&[0x52, 0xFF, 0xFF, 0x0A, 0x00, 0x00, 0x80, 0xA2]);
        assert_eq!(
            page,
            Some(CommonPage::Battery {
                operating_time: 20,
                voltage: Some(2.5),
                status: BatteryStatus::Good,
            })
        );
        assert_eq!(decode_common(&[0x10, 0, 0, 0, 0, 0, 0, 0]), None);
    }
}
