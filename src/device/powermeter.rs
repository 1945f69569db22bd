/// Bicycle power meter. Power only sensors send page 0x10; crank based
/// torque sensors interleave page 0x12.
use serde::Serialize;

use super::{decode_common, Decoded, Measurement, Profile, UnrecognizedPage};
use crate::message::bytes_to_u16;

pub const DEVICE_TYPE: u8 = 0x0B;
pub const PERIOD: u16 = 8182;

const STANDARD_POWER_ONLY: u8 = 0x10;
const STANDARD_CRANK_TORQUE: u8 = 0x12;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PowerMeter {
    last_event: Option<(u8, u8)>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PowerData {
    Power {
        event_count: u8,
        /// Right pedal contribution in percent, when the sensor knows it.
        pedal_power: Option<u8>,
        cadence: Option<u8>,
        accumulated_power: u16,
        instantaneous_power: u16,
    },
    CrankTorque {
        event_count: u8,
        crank_ticks: u8,
        cadence: Option<u8>,
        /// 1/2048 s
        accumulated_period: u16,
        /// 1/32 Nm
        accumulated_torque: u16,
    },
}

fn cadence(byte: u8) -> Option<u8> {
    if byte == 0xFF {
        None
    } else {
        Some(byte)
    }
}

impl PowerMeter {
    pub fn new() -> Self {
        PowerMeter::default()
    }

    pub fn decode_broadcast_data(&mut self, data: &[u8; 8]) -> Result<Decoded, UnrecognizedPage> {
        let page = data[0];
        let measurement = match page {
            STANDARD_POWER_ONLY => PowerData::Power {
                event_count: data[1],
                pedal_power: if data[2] == 0xFF {
                    None
                } else {
                    Some(data[2] & 0x7F)
                },
                cadence: cadence(data[3]),
                accumulated_power: bytes_to_u16(&data[4..6]),
                instantaneous_power: bytes_to_u16(&data[6..8]),
            },
            STANDARD_CRANK_TORQUE => PowerData::CrankTorque {
                event_count: data[1],
                crank_ticks: data[2],
                cadence: cadence(data[3]),
                accumulated_period: bytes_to_u16(&data[4..6]),
                accumulated_torque: bytes_to_u16(&data[6..8]),
            },
            _ => {
                return decode_common(data)
                    .map(|common| Decoded::new(Measurement::Common(common)))
                    .ok_or(UnrecognizedPage {
                        profile: Profile::BicyclePower,
                        page,
                    })
            }
        };

        // Event counts are tracked per page since each page has its own counter.
        let repeated = self.last_event == Some((page, data[1]));
        self.last_event = Some((page, data[1]));
        let mut decoded = Decoded::new(Measurement::Power(measurement));
        decoded.repeated = repeated;
        Ok(decoded)
    }
}
