/// Heartrate Monitor device. Each data page contains HR data in bytes 4-7.
/// Legacy devices only have a data page 0. Newer devices have multiple pages
/// with a MSB bit flip every four pages to signify legacy or newer device.
use serde::Serialize;

use super::{
    battery_voltage, BatteryStatus, Decoded, Measurement, Profile, Quality, UnrecognizedPage,
};
use crate::message::{bytes_to_u16, combine};

pub const DEVICE_TYPE: u8 = 0x78;
pub const PERIOD: u16 = 8070;

const PAGE_TOGGLE: u8 = 0x80;
/// Largest beat count increase expected between two broadcasts.
const MAX_BEAT_DELTA: u8 = 2;
/// Beat event time resolution, 1/1024 s.
const BEAT_TIME_UNITS: f32 = 1024.0;

#[derive(Clone, Copy, Debug, PartialEq)]
struct Beat {
    count: u8,
    time: f32,
    prev: Option<f32>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct HeartRateMonitor {
    last: Option<Beat>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HeartRateData {
    pub bpm: u8,
    /// Cumulative beat count, wraps at 256.
    pub beat: u8,
    pub time: BeatTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<HeartRatePage>,
}

/// Beat event times in seconds.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct BeatTime {
    pub cur: f32,
    pub prev: Option<f32>,
}

/// Extra fields carried by the non-default data pages.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HeartRatePage {
    OperatingTime {
        seconds: u32,
    },
    Manufacturer {
        manufacturer_id: u8,
        serial_number: u16,
    },
    Product {
        hardware_version: u8,
        software_version: u8,
        model_number: u8,
    },
    Capabilities {
        supported: u8,
        enabled: u8,
    },
    Battery {
        level: Option<u8>,
        voltage: Option<f32>,
        status: BatteryStatus,
    },
}

impl HeartRateMonitor {
    pub fn new() -> Self {
        HeartRateMonitor::default()
    }

    /// Decode broadcast data received from ANT+ device.
    pub fn decode_broadcast_data(&mut self, data: &[u8; 8]) -> Result<Decoded, UnrecognizedPage> {
        let page = data[0] & !PAGE_TOGGLE;
        let detail = match page {
            // Default, previous heart beat and swim interval pages carry no
            // extra fields worth reporting.
            0x00 | 0x04 | 0x05 => None,
            // Cumulative operating time, 2 s units
            0x01 => Some(HeartRatePage::OperatingTime {
                seconds: combine(&data[1..4]) * 2,
            }),
            0x02 => Some(HeartRatePage::Manufacturer {
                manufacturer_id: data[1],
                serial_number: bytes_to_u16(&data[2..4]),
            }),
            0x03 => Some(HeartRatePage::Product {
                hardware_version: data[1],
                software_version: data[2],
                model_number: data[3],
            }),
            0x06 => Some(HeartRatePage::Capabilities {
                supported: data[2],
                enabled: data[3],
            }),
            0x07 => Some(HeartRatePage::Battery {
                level: if data[1] == 0xFF { None } else { Some(data[1]) },
                voltage: battery_voltage(data[2], data[3]),
                status: BatteryStatus::from_descriptive(data[3]),
            }),
            _ => {
                return Err(UnrecognizedPage {
                    profile: Profile::HeartRate,
                    page,
                })
            }
        };

        let count = data[6];
        let cur = bytes_to_u16(&data[4..6]) as f32 / BEAT_TIME_UNITS;
        let delta = self.last.map(|last| count.wrapping_sub(last.count));
        let prev = if page == 0x04 {
            Some(bytes_to_u16(&data[2..4]) as f32 / BEAT_TIME_UNITS)
        } else {
            match (self.last, delta) {
                (Some(last), Some(0)) => last.prev,
                (Some(last), Some(1)) => Some(last.time),
                _ => None,
            }
        };
        let quality = match delta {
            Some(d) if d > MAX_BEAT_DELTA => Quality::DroppedBroadcast,
            _ => Quality::Ok,
        };
        self.last = Some(Beat {
            count,
            time: cur,
            prev,
        });

        Ok(Decoded {
            measurement: Measurement::HeartRate(HeartRateData {
                bpm: data[7],
                beat: count,
                time: BeatTime { cur, prev },
                detail,
            }),
            quality,
            repeated: delta == Some(0),
        })
    }
}
