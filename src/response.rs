/// Responses that can be received from the ANT+ USB device.
///
/// `classify` turns a checksummed frame into one of these. Message ids that
/// are not understood, or that arrive with the wrong payload length, come
/// back as `Unknown` so a newer radio or an odd frame never stops a session.
use std::convert::TryInto;

use log::debug;

use crate::message::{
    bytes_to_u16, Message, MESG_BROADCAST_DATA_ID, MESG_CAPABILITIES_ID, MESG_CHANNEL_ID_ID,
    MESG_EVENT_ID, MESG_RESPONSE_EVENT_ID, MESG_STARTUP_MESG_ID,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Asynchronous channel event (search timeout, channel closed, ...).
    ChannelEvent {
        channel: u8,
        code: ChannelResponseCode,
    },
    /// Answer to a command sent on a channel (or network for the key).
    ChannelResponse {
        channel: u8,
        command_id: u8,
        code: ChannelResponseCode,
    },
    BroadcastData(BroadcastData),
    Capabilities(Capabilities),
    Startup(StartupReason),
    ChannelId(ChannelId),
    Unknown {
        id: u8,
        data: Vec<u8>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupReason {
    PowerOnReset,
    HardwareResetLine,
    WatchDogReset,
    CommandReset,
    SynchronousReset,
    SuspendReset,
    Error,
}

impl From<u8> for StartupReason {
    fn from(reason: u8) -> Self {
        match reason {
            0x00 => StartupReason::PowerOnReset,
            0x01 => StartupReason::HardwareResetLine,
            0x02 => StartupReason::WatchDogReset,
            0x20 => StartupReason::CommandReset,
            0x40 => StartupReason::SynchronousReset,
            0x80 => StartupReason::SuspendReset,
            _ => StartupReason::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelResponseCode {
    ResponseNoError,
    EventRxSearchTimeout,
    EventRxFail,
    EventTx,
    EventTransferRxFailed,
    EventTransferTxCompleted,
    EventTransferTxFailed,
    EventChannelClosed,
    EventRxFailGoToSearch,
    ChannelCollision,
    EventTransferTxStart,
    ChannelInWrongState,
    ChannelNotOpened,
    ChannelIdNotSet,
    CloseAllChannels,
    TransferInProgress,
    InvalidMessage,
    InvalidNetworkNumber,
    Other(u8),
}

impl From<u8> for ChannelResponseCode {
    fn from(code: u8) -> Self {
        match code {
            0x00 => ChannelResponseCode::ResponseNoError,
            0x01 => ChannelResponseCode::EventRxSearchTimeout,
            0x02 => ChannelResponseCode::EventRxFail,
            0x03 => ChannelResponseCode::EventTx,
            0x04 => ChannelResponseCode::EventTransferRxFailed,
            0x05 => ChannelResponseCode::EventTransferTxCompleted,
            0x06 => ChannelResponseCode::EventTransferTxFailed,
            0x07 => ChannelResponseCode::EventChannelClosed,
            0x08 => ChannelResponseCode::EventRxFailGoToSearch,
            0x09 => ChannelResponseCode::ChannelCollision,
            0x0A => ChannelResponseCode::EventTransferTxStart,
            0x15 => ChannelResponseCode::ChannelInWrongState,
            0x16 => ChannelResponseCode::ChannelNotOpened,
            0x18 => ChannelResponseCode::ChannelIdNotSet,
            0x19 => ChannelResponseCode::CloseAllChannels,
            0x1F => ChannelResponseCode::TransferInProgress,
            0x28 => ChannelResponseCode::InvalidMessage,
            0x29 => ChannelResponseCode::InvalidNetworkNumber,
            other => ChannelResponseCode::Other(other),
        }
    }
}

/// Broadcast payload from a paired sensor. `data[0]` is the data page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastData {
    pub channel: u8,
    pub data: [u8; 8],
}

impl BroadcastData {
    pub fn new(channel: u8, data: [u8; 8]) -> Self {
        BroadcastData { channel, data }
    }

    pub fn page(&self) -> u8 {
        self.data[0]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub max_channels: u8,
    pub max_networks: u8,
    pub standard_options: u8,
    pub advanced_options: u8,
}

/// Identity of the device paired on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelId {
    pub channel: u8,
    pub device_number: u16,
    pub device_type: u8,
    pub transmission_type: u8,
}

/// Classify a decoded frame.
pub fn classify(mesg: &Message) -> Response {
    let data = &mesg.data[..];
    let expected = match mesg.id {
        MESG_RESPONSE_EVENT_ID => 3..=3,
        // Extended messages append flag and device fields after the payload.
        MESG_BROADCAST_DATA_ID => 9..=usize::MAX,
        MESG_CAPABILITIES_ID => 4..=usize::MAX,
        MESG_STARTUP_MESG_ID => 1..=1,
        MESG_CHANNEL_ID_ID => 5..=5,
        _ => return unknown(mesg),
    };
    if !expected.contains(&data.len()) {
        debug!(
            "Message 0x{:02X} has {} payload bytes, expected {:?}",
            mesg.id,
            data.len(),
            expected
        );
        return unknown(mesg);
    }

    match mesg.id {
        MESG_RESPONSE_EVENT_ID if data[1] == MESG_EVENT_ID => Response::ChannelEvent {
            channel: data[0],
            code: data[2].into(),
        },
        MESG_RESPONSE_EVENT_ID => Response::ChannelResponse {
            channel: data[0],
            command_id: data[1],
            code: data[2].into(),
        },
        MESG_BROADCAST_DATA_ID => match data[1..9].try_into() {
            Ok(payload) => Response::BroadcastData(BroadcastData::new(data[0], payload)),
            Err(_) => unknown(mesg),
        },
        MESG_CAPABILITIES_ID => Response::Capabilities(Capabilities {
            max_channels: data[0],
            max_networks: data[1],
            standard_options: data[2],
            advanced_options: data[3],
        }),
        MESG_STARTUP_MESG_ID => Response::Startup(data[0].into()),
        MESG_CHANNEL_ID_ID => Response::ChannelId(ChannelId {
            channel: data[0],
            device_number: bytes_to_u16(&data[1..3]),
            device_type: data[3],
            transmission_type: data[4],
        }),
        _ => unknown(mesg),
    }
}

fn unknown(mesg: &Message) -> Response {
    Response::Unknown {
        id: mesg.id,
        data: mesg.data.clone(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::{MESG_ASSIGN_CHANNEL_ID, MESG_OPEN_CHANNEL_ID};

    #[test]
    fn test_startup_message() {
        let mesg = Message::new(MESG_STARTUP_MESG_ID, &[0x20]);
        assert_eq!(
            classify(&mesg),
            Response::Startup(StartupReason::CommandReset)
        );
        assert_eq!(StartupReason::from(0), StartupReason::PowerOnReset);
        assert_eq!(StartupReason::from(0x01), StartupReason::HardwareResetLine);
        assert_eq!(StartupReason::from(0x02), StartupReason::WatchDogReset);
        assert_eq!(StartupReason::from(0x40), StartupReason::SynchronousReset);
        assert_eq!(StartupReason::from(0x80), StartupReason::SuspendReset);
        assert_eq!(StartupReason::from(0x95), StartupReason::Error);
    }

    #[test]
    fn channel_response() {
        let mesg = Message::new(MESG_RESPONSE_EVENT_ID, &[2, MESG_ASSIGN_CHANNEL_ID, 0]);
        assert_eq!(
            classify(&mesg),
            Response::ChannelResponse {
                channel: 2,
                command_id: 0x42,
                code: ChannelResponseCode::ResponseNoError,
            }
        );
        let mesg = Message::new(MESG_RESPONSE_EVENT_ID, &[0, MESG_OPEN_CHANNEL_ID, 0x15]);
        assert_eq!(
            classify(&mesg),
            Response::ChannelResponse {
                channel: 0,
                command_id: 0x4B,
                code: ChannelResponseCode::ChannelInWrongState,
            }
        );
    }

    #[test]
    fn channel_event() {
        let mesg = Message::new(MESG_RESPONSE_EVENT_ID, &[1, MESG_EVENT_ID, 0x01]);
        assert_eq!(
            classify(&mesg),
            Response::ChannelEvent {
                channel: 1,
                code: ChannelResponseCode::EventRxSearchTimeout,
            }
        );
    }

    #[test]
    fn unknown_codes_do_not_panic() {
        assert_eq!(
            ChannelResponseCode::from(0x77),
            ChannelResponseCode::Other(0x77)
        );
    }

    #[test]
    fn broadcast_data() {
        let mesg = Message::new(MESG_BROADCAST_DATA_ID, &[3, 4, 0, 0, 0, 0, 0, 7, 0x3C]);
        match classify(&mesg) {
            Response::BroadcastData(b) => {
                assert_eq!(b.channel, 3);
                assert_eq!(b.page(), 4);
                assert_eq!(b.data, [4, 0, 0, 0, 0, 0, 7, 0x3C]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn extended_broadcast_keeps_standard_payload() {
        let mut data = vec![0, 0, 0, 0, 0, 0, 0, 0, 0x3C];
        data.extend_from_slice(&[0x80, 0x39, 0x30, 0x78, 0x01]);
        let mesg = Message::new(MESG_BROADCAST_DATA_ID, &data);
        assert!(matches!(classify(&mesg), Response::BroadcastData(b) if b.data[7] == 0x3C));
    }

    #[test]
    fn capabilities() {
        let mesg = Message::new(MESG_CAPABILITIES_ID, &[8, 3, 0, 0xBA, 0x36, 0x00]);
        assert_eq!(
            classify(&mesg),
            Response::Capabilities(Capabilities {
                max_channels: 8,
                max_networks: 3,
                standard_options: 0,
                advanced_options: 0xBA,
            })
        );
    }

    #[test]
    fn channel_id() {
        let mesg = Message::new(MESG_CHANNEL_ID_ID, &[0, 0x39, 0x30, 0x78, 0x01]);
        assert_eq!(
            classify(&mesg),
            Response::ChannelId(ChannelId {
                channel: 0,
                device_number: 12345,
                device_type: 0x78,
                transmission_type: 1,
            })
        );
    }

    #[test]
    fn wrong_length_downgrades_to_unknown() {
        let mesg = Message::new(MESG_BROADCAST_DATA_ID, &[0, 1, 2]);
        assert_eq!(
            classify(&mesg),
            Response::Unknown {
                id: MESG_BROADCAST_DATA_ID,
                data: vec![0, 1, 2],
            }
        );
        let mesg = Message::new(MESG_RESPONSE_EVENT_ID, &[0, 1]);
        assert!(matches!(classify(&mesg), Response::Unknown { id: 0x40, .. }));
    }

    #[test]
    fn unknown_message_id() {
        let mesg = Message::new(0xAE, &[1, 2, 3]);
        assert!(matches!(classify(&mesg), Response::Unknown { id: 0xAE, .. }));
    }
}
