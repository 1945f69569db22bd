/// Weightscale device for reading body weight from the scale.
// TODO: Decode body composition pages 0x02 and 0x03 for scales that send them.
use serde::Serialize;

use super::{decode_common, Decoded, Measurement, Profile, UnrecognizedPage};
use crate::message::bytes_to_u16;

pub const DEVICE_TYPE: u8 = 0x77;
pub const PERIOD: u16 = 8192;

const BODY_WEIGHT: u8 = 0x01;
const WEIGHT_INVALID: u16 = 0xFFFF;
const WEIGHT_COMPUTING: u16 = 0xFFFE;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct WeightScale {
    last_weight: Option<u16>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightStatus {
    Valid,
    Computing,
    Invalid,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WeightData {
    pub user_profile: u16,
    /// Kilograms, present when `status` is `valid`.
    pub weight: Option<f32>,
    pub status: WeightStatus,
}

impl WeightScale {
    pub fn new() -> Self {
        WeightScale::default()
    }

    pub fn decode_broadcast_data(&mut self, data: &[u8; 8]) -> Result<Decoded, UnrecognizedPage> {
        if data[0] != BODY_WEIGHT {
            return decode_common(data)
                .map(|common| Decoded::new(Measurement::Common(common)))
                .ok_or(UnrecognizedPage {
                    profile: Profile::WeightScale,
                    page: data[0],
                });
        }

        let raw = bytes_to_u16(&data[6..8]);
        let (weight, status) = match raw {
            WEIGHT_INVALID => (None, WeightStatus::Invalid),
            WEIGHT_COMPUTING => (None, WeightStatus::Computing),
            _ => (Some(raw as f32 / 100.0), WeightStatus::Valid),
        };
        let repeated = self.last_weight == Some(raw);
        self.last_weight = Some(raw);

        let mut decoded = Decoded::new(Measurement::Weight(WeightData {
            user_profile: bytes_to_u16(&data[1..3]),
            weight,
            status,
        }));
        decoded.repeated = repeated;
        Ok(decoded)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn weight(decoded: &Decoded) -> &WeightData {
        match &decoded.measurement {
            Measurement::Weight(w) => w,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn body_weight() {
        let mut ws = WeightScale::new();
        // 7550 * 0.01 kg
        let decoded = ws
            .decode_broadcast_data(&[0x01, 0x02, 0x00, 0xFF, 0xFF, 0xFF, 0x7E, 0x1D])
            .unwrap();
        let w = weight(&decoded);
        assert_eq!(w.user_profile, 2);
        assert_eq!(w.weight, Some(75.5));
        assert_eq!(w.status, WeightStatus::Valid);
    }

    #[test]
    fn computing_and_invalid() {
        let mut ws = WeightScale::new();
        let computing = ws
            .decode_broadcast_data(&[0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFE, 0xFF])
            .unwrap();
        assert_eq!(weight(&computing).status, WeightStatus::Computing);
        assert_eq!(weight(&computing).weight, None);
        let invalid = ws
            .decode_broadcast_data(&[0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF])
            .unwrap();
        assert_eq!(weight(&invalid).status, WeightStatus::Invalid);
    }

    #[test]
    fn repeated_weight() {
        let mut ws = WeightScale::new();
        let data = [0x01, 0x00, 0x00, 0xFF, 0xFF, 0xFF, 0x7E, 0x1D];
        assert!(!ws.decode_broadcast_data(&data).unwrap().repeated);
        assert!(ws.decode_broadcast_data(&data).unwrap().repeated);
    }

    #[test]
    fn unknown_page() {
        let mut ws = WeightScale::new();
        assert!(ws.decode_broadcast_data(&[0x3A, 0, 0, 0, 0, 0, 0, 0]).is_err());
    }
}
