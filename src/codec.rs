/// Incremental decoder for the ANT serial framing.
///
/// Bulk reads from the USB stick do not line up with frame boundaries, so the
/// decoder keeps whatever it has not consumed yet and picks up where it left
/// off on the next call. Bytes before a sync byte are noise and are skipped.
/// A candidate frame with a bad checksum is rejected by dropping its sync byte
/// and scanning on from the next byte.
use log::trace;
use thiserror::Error;

use crate::message::{
    checksum, Message, MESG_DATA_OFFSET, MESG_FRAME_SIZE, MESG_ID_OFFSET, MESG_MAX_SIZE_VALUE,
    MESG_SIZE_OFFSET, MESG_TX_SYNC,
};

/// Recoverable framing problems. The offending bytes have already been
/// discarded when one of these is returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("bad checksum for message 0x{id:02X}: expected 0x{expected:02X}, got 0x{actual:02X}")]
    Checksum { id: u8, expected: u8, actual: u8 },

    #[error("length byte {0} exceeds the largest ANT message")]
    InvalidLength(u8),
}

#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        FrameDecoder::default()
    }

    /// Append freshly read bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Decode the next frame.
    ///
    /// Returns `Ok(None)` when the buffer does not hold a complete frame yet.
    pub fn decode(&mut self) -> Result<Option<Message>, FramingError> {
        match self.buffer.iter().position(|b| *b == MESG_TX_SYNC) {
            Some(0) => {}
            Some(skip) => {
                trace!("Skipping {} bytes before sync", skip);
                self.buffer.drain(..skip);
            }
            None => {
                if !self.buffer.is_empty() {
                    trace!("Dropping {} bytes without sync", self.buffer.len());
                    self.buffer.clear();
                }
                return Ok(None);
            }
        }

        if self.buffer.len() <= MESG_SIZE_OFFSET {
            return Ok(None);
        }
        let size = self.buffer[MESG_SIZE_OFFSET];
        if size as usize > MESG_MAX_SIZE_VALUE {
            self.buffer.drain(..1);
            return Err(FramingError::InvalidLength(size));
        }

        let total = MESG_FRAME_SIZE + size as usize;
        if self.buffer.len() < total {
            return Ok(None);
        }

        let expected = checksum(&self.buffer[..total - 1]);
        let actual = self.buffer[total - 1];
        if expected != actual {
            let id = self.buffer[MESG_ID_OFFSET];
            self.buffer.drain(..1);
            return Err(FramingError::Checksum {
                id,
                expected,
                actual,
            });
        }

        let mesg = Message::new(
            self.buffer[MESG_ID_OFFSET],
            &self.buffer[MESG_DATA_OFFSET..total - 1],
        );
        self.buffer.drain(..total);
        Ok(Some(mesg))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::{self, MESG_BROADCAST_DATA_ID, MESG_STARTUP_MESG_ID};

    fn drain(decoder: &mut FrameDecoder) -> (Vec<Message>, usize) {
        let mut frames = vec![];
        let mut errors = 0;
        loop {
            match decoder.decode() {
                Ok(Some(m)) => frames.push(m),
                Ok(None) => return (frames, errors),
                Err(_) => errors += 1,
            }
        }
    }

    #[test]
    fn round_trip() {
        let mesg = Message::new(MESG_BROADCAST_DATA_ID, &[0, 1, 2, 3, 4, 5, 6, 7, 8]);
        let mut decoder = FrameDecoder::new();
        decoder.extend(&mesg.encode());
        assert_eq!(decoder.decode(), Ok(Some(mesg)));
        assert_eq!(decoder.decode(), Ok(None));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn empty_payload_round_trip() {
        let mesg = Message::new(0x99, &[]);
        let mut decoder = FrameDecoder::new();
        decoder.extend(&mesg.encode());
        assert_eq!(decoder.decode(), Ok(Some(mesg)));
    }

    #[test]
    fn partial_frame_waits_for_more_data() {
        let buf = message::set_channel_period(0, 8070).encode();
        let mut decoder = FrameDecoder::new();
        decoder.extend(&buf[..1]);
        assert_eq!(decoder.decode(), Ok(None));
        decoder.extend(&buf[1..4]);
        assert_eq!(decoder.decode(), Ok(None));
        decoder.extend(&buf[4..]);
        assert_eq!(decoder.decode(), Ok(Some(message::set_channel_period(0, 8070))));
    }

    #[test]
    fn byte_at_a_time() {
        let buf = message::get_capabilities().encode();
        let mut decoder = FrameDecoder::new();
        let mut frames = vec![];
        for b in buf.iter() {
            decoder.extend(&[*b]);
            if let Ok(Some(m)) = decoder.decode() {
                frames.push(m);
            }
        }
        assert_eq!(frames, vec![message::get_capabilities()]);
    }

    #[test]
    fn resyncs_through_noise() {
        let frames = vec![
            Message::new(MESG_STARTUP_MESG_ID, &[0x00]),
            message::open_channel(1),
            Message::new(MESG_BROADCAST_DATA_ID, &[0, 0, 0, 0, 0, 0, 0, 0, 0x3C]),
            message::set_channel_id(2, 0xBEEF, 0x78, 1),
        ];
        let noise: [&[u8]; 4] = [&[0x00, 0x13], &[0xFF], &[0x01, 0x02, 0x03, 0x04], &[0x55]];
        let mut stream = vec![];
        for (frame, noise) in frames.iter().zip(noise.iter()) {
            stream.extend_from_slice(noise);
            stream.extend(frame.encode());
        }
        stream.extend_from_slice(&[0x42, 0x42]);

        let mut decoder = FrameDecoder::new();
        decoder.extend(&stream);
        let (decoded, _) = drain(&mut decoder);
        assert_eq!(decoded, frames);
    }

    #[test]
    fn corrupted_payload_rejects_only_that_frame() {
        let first = message::open_channel(0);
        let second = message::set_channel_frequency(0, 57);
        let third = message::close_channel(0);
        let mut stream = first.encode();
        let mut bad = second.encode();
        bad[4] ^= 0x10;
        stream.extend(bad);
        stream.extend(third.encode());

        let mut decoder = FrameDecoder::new();
        decoder.extend(&stream);
        assert_eq!(decoder.decode(), Ok(Some(first)));
        assert!(matches!(
            decoder.decode(),
            Err(FramingError::Checksum { id: 0x45, .. })
        ));
        let (rest, _) = drain(&mut decoder);
        assert_eq!(rest, vec![third]);
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&[MESG_TX_SYNC, 0xF0, 0x4E]);
        assert_eq!(decoder.decode(), Err(FramingError::InvalidLength(0xF0)));
        decoder.extend(&message::reset().encode());
        let (frames, _) = drain(&mut decoder);
        assert_eq!(frames, vec![message::reset()]);
    }

    #[test]
    fn truncated_sync_then_valid_frame() {
        let mut decoder = FrameDecoder::new();
        let mut stream = vec![MESG_TX_SYNC, 1, 2, 0];
        stream.extend(message::reset().encode());
        decoder.extend(&stream);
        let (frames, errors) = drain(&mut decoder);
        assert_eq!(frames, vec![message::reset()]);
        assert!(errors >= 1);
    }
}
