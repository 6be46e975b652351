//! Exchange header (§6): prepended to the payload after decryption, carried
//! inside a Weave message's secured payload.

use crate::{
    error::{Result, WeaveError},
    ids::{ExchangeId, MessageId, ProfileId},
};
use s2n_codec::{DecoderBuffer, Encoder, EncoderBuffer};

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct ExchangeFlags: u8 {
        const INITIATOR = 0x1;
        const ACK_ID    = 0x2;
        const NEEDS_ACK = 0x4;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ExchangeVersion {
    V1 = 0,
    V2 = 1,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExchangeHeader {
    pub version: ExchangeVersion,
    pub flags: ExchangeFlags,
    pub message_type: u8,
    pub exchange_id: ExchangeId,
    pub profile_id: ProfileId,
    pub ack_message_id: Option<MessageId>,
}

impl ExchangeHeader {
    /// Minimum reserved capacity without an ack id (8 bytes), or with one
    /// (12 bytes) per §4.1.
    pub const MIN_RESERVE: usize = 8;
    pub const MIN_RESERVE_WITH_ACK: usize = 12;

    pub fn required_reserve(&self) -> usize {
        if self.flags.contains(ExchangeFlags::ACK_ID) {
            Self::MIN_RESERVE_WITH_ACK
        } else {
            Self::MIN_RESERVE
        }
    }

    pub fn encoded_len(&self) -> usize {
        self.required_reserve()
    }

    pub fn encode(&self, buf: &mut EncoderBuffer<'_>) {
        debug_assert!(buf.remaining_capacity() >= self.required_reserve());
        let version_and_flags = ((self.version as u8) << 4) | self.flags.bits();
        buf.write_slice(&[version_and_flags, self.message_type]);
        buf.write_slice(&self.exchange_id.as_u16().to_le_bytes());
        buf.write_slice(&self.profile_id.as_u32().to_le_bytes());
        if self.flags.contains(ExchangeFlags::ACK_ID) {
            let ack_id = self
                .ack_message_id
                .expect("AckId flag set implies ack_message_id is Some")
                .as_u32();
            buf.write_slice(&ack_id.to_le_bytes());
        }
    }

    pub fn decode(buffer: DecoderBuffer<'_>) -> Result<(Self, DecoderBuffer<'_>)> {
        let (raw, buffer) = buffer
            .decode_slice(2)
            .map_err(|_| WeaveError::InvalidMessageLength)?;
        let raw = raw.into_less_safe_slice();
        let version_and_flags = raw[0];
        let message_type = raw[1];

        let version = match version_and_flags >> 4 {
            0 => ExchangeVersion::V1,
            1 => ExchangeVersion::V2,
            _ => return Err(WeaveError::UnsupportedMessageVersion),
        };
        let flags = ExchangeFlags::from_bits_truncate(version_and_flags & 0x0F);

        let (raw, buffer) = buffer
            .decode_slice(2)
            .map_err(|_| WeaveError::InvalidMessageLength)?;
        let exchange_id = ExchangeId::new(u16::from_le_bytes(
            raw.into_less_safe_slice()
                .try_into()
                .map_err(|_| WeaveError::InvalidMessageLength)?,
        ));

        let (raw, mut buffer) = buffer
            .decode_slice(4)
            .map_err(|_| WeaveError::InvalidMessageLength)?;
        let profile_id = ProfileId::from_raw(u32::from_le_bytes(
            raw.into_less_safe_slice()
                .try_into()
                .map_err(|_| WeaveError::InvalidMessageLength)?,
        ));

        let ack_message_id = if flags.contains(ExchangeFlags::ACK_ID) {
            let (raw, rest) = buffer
                .decode_slice(4)
                .map_err(|_| WeaveError::InvalidMessageLength)?;
            buffer = rest;
            Some(MessageId::new(u32::from_le_bytes(
                raw.into_less_safe_slice()
                    .try_into()
                    .map_err(|_| WeaveError::InvalidMessageLength)?,
            )))
        } else {
            None
        };

        Ok((
            Self {
                version,
                flags,
                message_type,
                exchange_id,
                profile_id,
                ack_message_id,
            },
            buffer,
        ))
    }

    pub fn is_initiator(&self) -> bool {
        self.flags.contains(ExchangeFlags::INITIATOR)
    }

    pub fn needs_ack(&self) -> bool {
        self.flags.contains(ExchangeFlags::NEEDS_ACK)
    }

    pub fn ack_id(&self) -> Option<MessageId> {
        if self.flags.contains(ExchangeFlags::ACK_ID) {
            self.ack_message_id
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_without_ack() {
        let header = ExchangeHeader {
            version: ExchangeVersion::V1,
            flags: ExchangeFlags::INITIATOR,
            message_type: 0x01,
            exchange_id: ExchangeId::new(0x1234),
            profile_id: ProfileId::new(0, 0x000F),
            ack_message_id: None,
        };
        let mut bytes = vec![0u8; header.encoded_len()];
        let mut encoder = EncoderBuffer::new(&mut bytes);
        header.encode(&mut encoder);

        let (decoded, rest) = ExchangeHeader::decode(DecoderBuffer::new(&bytes)).unwrap();
        assert_eq!(decoded, header);
        assert!(rest.is_empty());
    }

    #[test]
    fn round_trips_with_ack() {
        let header = ExchangeHeader {
            version: ExchangeVersion::V2,
            flags: ExchangeFlags::INITIATOR | ExchangeFlags::ACK_ID,
            message_type: 0x2A,
            exchange_id: ExchangeId::new(0xFFFF),
            profile_id: ProfileId::new(1, 2),
            ack_message_id: Some(MessageId::new(99)),
        };
        let mut bytes = vec![0u8; header.encoded_len()];
        let mut encoder = EncoderBuffer::new(&mut bytes);
        header.encode(&mut encoder);

        let (decoded, rest) = ExchangeHeader::decode(DecoderBuffer::new(&bytes)).unwrap();
        assert_eq!(decoded, header);
        assert!(rest.is_empty());
        assert_eq!(decoded.ack_id(), Some(MessageId::new(99)));
    }

    #[test]
    fn under_run_is_invalid_length() {
        let bytes = [0x10u8];
        assert!(matches!(
            ExchangeHeader::decode(DecoderBuffer::new(&bytes)),
            Err(WeaveError::InvalidMessageLength)
        ));
    }
}
