/// Message module provides a way for creating messages to send to the ANT+
/// USB device. Every message is framed as
///
/// ```text
/// [sync 0xA4][length][message id][payload .. length bytes][checksum]
/// ```
///
/// where the checksum is the XOR of every preceding byte of the frame.
/// Decoding lives in [`crate::codec`] and classification in [`crate::response`].
use std::fmt;

pub const MESG_TX_SYNC: u8 = 0xA4;
pub const MESG_SYNC_SIZE: usize = 1;
pub const MESG_SIZE_SIZE: usize = 1;
pub const MESG_ID_SIZE: usize = 1;
pub const MESG_CHANNEL_NUM_SIZE: usize = 1;
pub const MESG_EXT_MESG_BF_SIZE: usize = 1;
pub const MESG_CHECKSUM_SIZE: usize = 1;

pub const ANT_STANDARD_DATA_PAYLOAD_SIZE: usize = 8;
pub const ANT_EXT_MESG_DEVICE_ID_FIELD_SIZE: usize = 4;
pub const ANT_EXT_STRING_SIZE: usize = 27;

pub const MESG_MAX_EXT_DATA_SIZE: usize = ANT_EXT_MESG_DEVICE_ID_FIELD_SIZE + ANT_EXT_STRING_SIZE;
pub const MESG_MAX_DATA_SIZE: usize =
    ANT_STANDARD_DATA_PAYLOAD_SIZE + MESG_EXT_MESG_BF_SIZE + MESG_MAX_EXT_DATA_SIZE;
/// Largest value the length byte may carry.
pub const MESG_MAX_SIZE_VALUE: usize = MESG_MAX_DATA_SIZE + MESG_CHANNEL_NUM_SIZE;
pub const MESG_HEADER_SIZE: usize = MESG_SYNC_SIZE + MESG_SIZE_SIZE + MESG_ID_SIZE;
pub const MESG_FRAME_SIZE: usize = MESG_HEADER_SIZE + MESG_CHECKSUM_SIZE;
pub const MESG_MAX_SIZE: usize = MESG_MAX_SIZE_VALUE + MESG_FRAME_SIZE;
pub const MESG_SIZE_OFFSET: usize = MESG_SYNC_SIZE;
pub const MESG_ID_OFFSET: usize = MESG_SYNC_SIZE + MESG_SIZE_SIZE;
pub const MESG_DATA_OFFSET: usize = MESG_HEADER_SIZE;

pub const MESG_EVENT_ID: u8 = 0x01;
pub const MESG_RESPONSE_EVENT_ID: u8 = 0x40;
pub const MESG_UNASSIGN_CHANNEL_ID: u8 = 0x41;
pub const MESG_ASSIGN_CHANNEL_ID: u8 = 0x42;
pub const MESG_CHANNEL_MESG_PERIOD_ID: u8 = 0x43;
pub const MESG_CHANNEL_SEARCH_TIMEOUT_ID: u8 = 0x44;
pub const MESG_CHANNEL_RADIO_FREQ_ID: u8 = 0x45;
pub const MESG_NETWORK_KEY_ID: u8 = 0x46;
pub const MESG_RESET: u8 = 0x4A;
pub const MESG_OPEN_CHANNEL_ID: u8 = 0x4B;
pub const MESG_CLOSE_CHANNEL_ID: u8 = 0x4C;
pub const MESG_REQUEST: u8 = 0x4D;
pub const MESG_BROADCAST_DATA_ID: u8 = 0x4E;
pub const MESG_ACKNOWLEDGE_DATA_ID: u8 = 0x4F;
pub const MESG_CHANNEL_ID_ID: u8 = 0x51;
pub const MESG_CAPABILITIES_ID: u8 = 0x54;
pub const MESG_STARTUP_MESG_ID: u8 = 0x6F;

/// ANT+ managed network key.
pub const ANT_PLUS_NETWORK_KEY: [u8; 8] = [0xB9, 0xA5, 0x21, 0xFB, 0xBD, 0x72, 0xC3, 0x45];

/// A single framed ANT message: the message id and its payload.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    pub id: u8,
    pub data: Vec<u8>,
}

impl Message {
    pub fn new(id: u8, data: &[u8]) -> Message {
        Message {
            id,
            data: data.to_vec(),
        }
    }

    /// Converts a message into a framed buffer that can be written out.
    pub fn encode(&self) -> Vec<u8> {
        let size = self.data.len();
        let total_size = MESG_HEADER_SIZE + size;
        let mut buf: Vec<u8> = vec![0; total_size + MESG_CHECKSUM_SIZE];
        buf[0] = MESG_TX_SYNC;
        buf[MESG_SIZE_OFFSET] = size as u8;
        buf[MESG_ID_OFFSET] = self.id;
        buf[MESG_DATA_OFFSET..total_size].copy_from_slice(&self.data);
        buf[total_size] = checksum(&buf[..total_size]);
        buf
    }

    /// The channel number for channel scoped commands.
    pub fn channel(&self) -> Option<u8> {
        match self.id {
            MESG_RESET | MESG_NETWORK_KEY_ID => None,
            _ => self.data.first().copied(),
        }
    }

    fn id_as_str(&self) -> &'static str {
        match self.id {
            MESG_STARTUP_MESG_ID => "Startup",
            MESG_CAPABILITIES_ID => "Capabilities",
            MESG_RESPONSE_EVENT_ID => "Response Event",
            MESG_BROADCAST_DATA_ID => "Broadcast Data",
            MESG_ACKNOWLEDGE_DATA_ID => "Acknowledged Data",
            MESG_CHANNEL_ID_ID => "Channel ID",
            MESG_RESET => "Reset",
            MESG_NETWORK_KEY_ID => "Set Network Key",
            MESG_REQUEST => "Request",
            MESG_ASSIGN_CHANNEL_ID => "Assign Channel",
            MESG_UNASSIGN_CHANNEL_ID => "Unassign Channel",
            MESG_CHANNEL_MESG_PERIOD_ID => "Channel Period",
            MESG_CHANNEL_SEARCH_TIMEOUT_ID => "Search Timeout",
            MESG_CHANNEL_RADIO_FREQ_ID => "Radio Frequency",
            MESG_OPEN_CHANNEL_ID => "Open Channel",
            MESG_CLOSE_CHANNEL_ID => "Close Channel",
            _ => "Unknown",
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} (0x{:02X}) DATA: {:02X?}",
            self.id_as_str(),
            self.id,
            self.data
        )
    }
}

/// XOR checksum over a slice of frame bytes.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

pub fn reset() -> Message {
    Message::new(MESG_RESET, &[0])
}

pub fn set_network_key(network_number: u8, key: &[u8]) -> Message {
    let mut data = vec![network_number];
    data.extend(key);
    Message::new(MESG_NETWORK_KEY_ID, &data)
}

pub fn get_capabilities() -> Message {
    Message::new(MESG_REQUEST, &[0, MESG_CAPABILITIES_ID])
}

pub fn get_channel_id(channel: u8) -> Message {
    Message::new(MESG_REQUEST, &[channel, MESG_CHANNEL_ID_ID])
}

pub fn assign_channel(channel: u8, channel_type: u8, network: u8) -> Message {
    Message::new(MESG_ASSIGN_CHANNEL_ID, &[channel, channel_type, network])
}

pub fn set_channel_id(
    channel: u8,
    device_number: u16,
    device_type: u8,
    transmission_type: u8,
) -> Message {
    let number = device_number.to_le_bytes();
    Message::new(
        MESG_CHANNEL_ID_ID,
        &[channel, number[0], number[1], device_type, transmission_type],
    )
}

pub fn set_hp_search_timeout(channel: u8, timeout: u8) -> Message {
    Message::new(MESG_CHANNEL_SEARCH_TIMEOUT_ID, &[channel, timeout])
}

pub fn set_channel_period(channel: u8, period: u16) -> Message {
    let period = period.to_le_bytes();
    Message::new(MESG_CHANNEL_MESG_PERIOD_ID, &[channel, period[0], period[1]])
}

pub fn set_channel_frequency(channel: u8, frequency: u8) -> Message {
    Message::new(MESG_CHANNEL_RADIO_FREQ_ID, &[channel, frequency])
}

pub fn open_channel(channel: u8) -> Message {
    Message::new(MESG_OPEN_CHANNEL_ID, &[channel])
}

pub fn close_channel(channel: u8) -> Message {
    Message::new(MESG_CLOSE_CHANNEL_ID, &[channel])
}

pub fn unassign_channel(channel: u8) -> Message {
    Message::new(MESG_UNASSIGN_CHANNEL_ID, &[channel])
}

// combine takes a little endian byte slice of up to four bytes and returns
// the combined value.
pub fn combine(b: &[u8]) -> u32 {
    if b.len() > 4 {
        log::error!("Slice larger than 4. Returning just first four bytes combined");
    }
    b.iter()
        .take(4)
        .enumerate()
        .fold(0, |acc, (i, byte)| acc | (*byte as u32) << (8 * i))
}

// bytes_to_u16 takes a byte slice formatted in [LSB, MSB] and combines the two fields together
// into a single u16.
pub(crate) fn bytes_to_u16(b: &[u8]) -> u16 {
    combine(&b[..b.len().min(2)]) as u16
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_new() {
        let data = vec![0; 5];
        let m = Message::new(0, &data);
        assert_eq!(m.id, 0);
        assert_eq!(m.data, vec![0; 5]);
    }

    #[test]
    fn test_encode() {
        let data = vec![1, 0xac, 2, 0x5c, 3];
        let len = data.len();
        let m = Message::new(MESG_CAPABILITIES_ID, &data);
        let buf = m.encode();
        let total_size = buf.len() - 1;
        let mut checksum = 0;
        for b in &buf[..total_size] {
            checksum ^= b;
        }
        assert_eq!(buf.len(), len + 4);
        assert_eq!(buf[0], MESG_TX_SYNC);
        assert_eq!(buf[1], len as u8);
        //MESG_CAPABILITIES_ID = 0x54
        assert_eq!(buf[2], 0x54);
        assert_eq!(buf[3..8], data[..]);
        assert_eq!(buf[total_size], checksum);
    }

    #[test]
    fn encoded_frame_xors_to_zero() {
        let buf = open_channel(3).encode();
        assert_eq!(checksum(&buf), 0);
    }

    #[test]
    fn combine_little_endian() {
        assert_eq!(combine(&[0x01]), 0x01);
        assert_eq!(combine(&[0x34, 0x12]), 0x1234);
        assert_eq!(combine(&[0x56, 0x34, 0x12]), 0x12_3456);
        assert_eq!(bytes_to_u16(&[0xFF, 0x01, 0x99]), 0x01FF);
    }

    // The following tests test message creation. Since we use constants
    // for the ID, we want to assert against the value of the constant.
    // This way if the value of the constant is changed above, the test will
    // fail without a subsequent change of value here.
    #[test]
    fn test_reset_message() {
        let mesg = reset();
        //MESG_RESET = 0x4A
        assert_eq!(mesg.id, 0x4A);
        assert_eq!(mesg.data[..], [0]);
        assert_eq!(mesg.channel(), None);
    }

    #[test]
    fn test_set_network_key_message() {
        let mesg = set_network_key(0, &ANT_PLUS_NETWORK_KEY);
        // MESG_NETWORK_KEY_ID = 0x46
        assert_eq!(mesg.id, 0x46);
        assert_eq!(mesg.data[0], 0);
        assert_eq!(mesg.data[1..], ANT_PLUS_NETWORK_KEY);
    }

    #[test]
    fn test_get_capabilities_message() {
        let mesg = get_capabilities();
        // MESG_REQUEST = 0x4D
        // MESG_CAPABILITIES_ID = 0x54
        assert_eq!(mesg.id, 0x4D);
        assert_eq!(mesg.data[..], [0, 0x54]);
    }

    #[test]
    fn get_channel_id_message() {
        let mesg = get_channel_id(2);
        // MESG_CHANNEL_ID_ID = 0x51
        assert_eq!(mesg.id, 0x4D);
        assert_eq!(mesg.data[..], [2, 0x51]);
        assert_eq!(mesg.channel(), Some(2));
    }

    #[test]
    fn assign_channel_message() {
        let mesg = assign_channel(1, 0, 0);
        // MESG_ASSIGN_CHANNEL_ID = 0x42
        assert_eq!(mesg.id, 0x42);
        assert_eq!(mesg.data[..], [1, 0, 0]);
    }

    #[test]
    fn set_channel_id_message() {
        let mesg = set_channel_id(0, 1000, 0x78, 0);
        // MESG_CHANNEL_ID_ID = 0x51
        assert_eq!(mesg.id, 0x51);
        assert_eq!(mesg.data[..], [0, 0xE8, 0x03, 0x78, 0]);
    }

    #[test]
    fn set_hp_search_timeout_message() {
        let mesg = set_hp_search_timeout(0, 30);
        // MESG_CHANNEL_SEARCH_TIMEOUT_ID = 0x44
        assert_eq!(mesg.id, 0x44);
        assert_eq!(mesg.data[..], [0, 30]);
    }

    #[test]
    fn set_channel_period_message() {
        let mesg = set_channel_period(0, 8070);
        // MESG_CHANNEL_MESG_PERIOD_ID = 0x43
        assert_eq!(mesg.id, 0x43);
        assert_eq!(mesg.data[..], [0, 0x86, 0x1F]);
    }

    #[test]
    fn set_channel_frequency_message() {
        let mesg = set_channel_frequency(0, 0x39);
        // MESG_CHANNEL_RADIO_FREQ_ID = 0x45
        assert_eq!(mesg.id, 0x45);
        assert_eq!(mesg.data[..], [0, 0x39]);
    }

    #[test]
    fn open_close_unassign_messages() {
        // MESG_OPEN_CHANNEL_ID = 0x4B
        assert_eq!(open_channel(0).id, 0x4B);
        // MESG_CLOSE_CHANNEL_ID = 0x4C
        assert_eq!(close_channel(0).id, 0x4C);
        // MESG_UNASSIGN_CHANNEL_ID = 0x41
        assert_eq!(unassign_channel(0).id, 0x41);
    }
}
