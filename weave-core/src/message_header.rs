//! Weave message header (§6): the outermost, transport-visible framing.
//!
//! All multi-byte integers are little-endian; callers must not depend on
//! host endianness (DESIGN NOTE, §9).

use crate::{
    error::{Result, WeaveError},
    ids::{KeyId, MessageId, NodeId},
};
use s2n_codec::{DecoderBuffer, Encoder, EncoderBuffer};

/// Message protocol version. `V2` is required by any message using
/// reliability flags (WRMP).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageVersion {
    V1 = 0,
    V2 = 1,
}

impl MessageVersion {
    fn from_raw(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Self::V1),
            1 => Ok(Self::V2),
            _ => Err(WeaveError::UnsupportedMessageVersion),
        }
    }
}

/// Identifies which encryption suite protects the message payload.
///
/// Concrete key derivation/encryption is out of scope (§1); the codec only
/// needs the MIC length to split the trailer off the wire image.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum EncryptionType {
    AesCcm64 = 1,
    AesCcm128 = 2,
}

impl EncryptionType {
    pub fn mic_len(self) -> usize {
        match self {
            Self::AesCcm64 => 8,
            Self::AesCcm128 => 16,
        }
    }

    fn from_raw(v: u8) -> Result<Self> {
        match v {
            1 => Ok(Self::AesCcm64),
            2 => Ok(Self::AesCcm128),
            _ => Err(WeaveError::AuthenticationFailed),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EncryptionMeta {
    pub key_id: KeyId,
    pub enc_type: EncryptionType,
}

bitflags::bitflags! {
    /// Presence bits packed into `version_and_flags`'s low 12 bits.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct MessageFlags: u16 {
        const SOURCE_NODE_PRESENT = 0x0001;
        const DEST_NODE_PRESENT   = 0x0002;
        const ENCRYPTED           = 0x0004;
    }
}

/// The full on-wire Weave message header, decoded up to (but not including)
/// the encrypted payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub version: MessageVersion,
    pub flags: MessageFlags,
    pub message_id: MessageId,
    pub source_node_id: Option<NodeId>,
    pub dest_node_id: Option<NodeId>,
    pub encryption: Option<EncryptionMeta>,
}

impl MessageHeader {
    /// Minimum reserved prefix callers must leave before the payload: two
    /// header bytes plus a 4-byte message id.
    pub const MIN_HEADER_RESERVE: usize = 16;

    pub fn new(message_id: MessageId) -> Self {
        Self {
            version: MessageVersion::V1,
            flags: MessageFlags::empty(),
            message_id,
            source_node_id: None,
            dest_node_id: None,
            encryption: None,
        }
    }

    pub fn with_source(mut self, node: NodeId) -> Self {
        self.flags |= MessageFlags::SOURCE_NODE_PRESENT;
        self.source_node_id = Some(node);
        self
    }

    pub fn with_dest(mut self, node: NodeId) -> Self {
        self.flags |= MessageFlags::DEST_NODE_PRESENT;
        self.dest_node_id = Some(node);
        self
    }

    pub fn with_encryption(mut self, meta: EncryptionMeta) -> Self {
        self.flags |= MessageFlags::ENCRYPTED;
        self.encryption = Some(meta);
        self
    }

    /// Size in bytes of the encoded header (excludes payload and MIC).
    pub fn encoded_len(&self) -> usize {
        let mut len = 2 + 4; // version_and_flags + message_id
        if self.source_node_id.is_some() {
            len += 8;
        }
        if self.dest_node_id.is_some() {
            len += 8;
        }
        if self.encryption.is_some() {
            len += 2 + 1; // key_id + enc_type
        }
        len
    }

    /// Writes the header into `buf`, which must have at least
    /// `encoded_len()` bytes of remaining capacity.
    pub fn encode(&self, buf: &mut EncoderBuffer<'_>) {
        let version_and_flags = ((self.version as u16) << 12) | self.flags.bits();
        buf.write_slice(&version_and_flags.to_le_bytes());
        buf.write_slice(&self.message_id.as_u32().to_le_bytes());
        if let Some(source) = self.source_node_id {
            buf.write_slice(&source.as_u64().to_le_bytes());
        }
        if let Some(dest) = self.dest_node_id {
            buf.write_slice(&dest.as_u64().to_le_bytes());
        }
        if let Some(enc) = self.encryption {
            let key_id = enc.key_id.raw().unwrap_or_default();
            buf.write_slice(&key_id.to_le_bytes());
            buf.write_slice(&[enc.enc_type as u8]);
        }
    }

    /// Decodes a header from the front of `buffer`, returning the header and
    /// the remaining buffer (payload, possibly followed by a MIC trailer).
    pub fn decode(buffer: DecoderBuffer<'_>) -> Result<(Self, DecoderBuffer<'_>)> {
        let (raw, buffer) = buffer
            .decode_slice(2)
            .map_err(|_| WeaveError::InvalidMessageLength)?;
        let version_and_flags = u16::from_le_bytes(
            raw.into_less_safe_slice()
                .try_into()
                .map_err(|_| WeaveError::InvalidMessageLength)?,
        );
        let version = MessageVersion::from_raw((version_and_flags >> 12) as u8)?;
        let flags = MessageFlags::from_bits_truncate(version_and_flags & 0x0FFF);

        let (raw, buffer) = buffer
            .decode_slice(4)
            .map_err(|_| WeaveError::InvalidMessageLength)?;
        let message_id = MessageId::new(u32::from_le_bytes(
            raw.into_less_safe_slice()
                .try_into()
                .map_err(|_| WeaveError::InvalidMessageLength)?,
        ));

        let mut buffer = buffer;
        let source_node_id = if flags.contains(MessageFlags::SOURCE_NODE_PRESENT) {
            let (raw, rest) = buffer
                .decode_slice(8)
                .map_err(|_| WeaveError::InvalidMessageLength)?;
            buffer = rest;
            Some(NodeId::new(u64::from_le_bytes(
                raw.into_less_safe_slice()
                    .try_into()
                    .map_err(|_| WeaveError::InvalidMessageLength)?,
            )))
        } else {
            None
        };

        let dest_node_id = if flags.contains(MessageFlags::DEST_NODE_PRESENT) {
            let (raw, rest) = buffer
                .decode_slice(8)
                .map_err(|_| WeaveError::InvalidMessageLength)?;
            buffer = rest;
            Some(NodeId::new(u64::from_le_bytes(
                raw.into_less_safe_slice()
                    .try_into()
                    .map_err(|_| WeaveError::InvalidMessageLength)?,
            )))
        } else {
            None
        };

        let encryption = if flags.contains(MessageFlags::ENCRYPTED) {
            let (raw, rest) = buffer
                .decode_slice(2)
                .map_err(|_| WeaveError::InvalidMessageLength)?;
            let key_id = u16::from_le_bytes(
                raw.into_less_safe_slice()
                    .try_into()
                    .map_err(|_| WeaveError::InvalidMessageLength)?,
            );
            let (raw, rest) = rest
                .decode_slice(1)
                .map_err(|_| WeaveError::InvalidMessageLength)?;
            let enc_type = EncryptionType::from_raw(raw.into_less_safe_slice()[0])?;
            buffer = rest;
            Some(EncryptionMeta {
                key_id: KeyId::new(key_id),
                enc_type,
            })
        } else {
            None
        };

        Ok((
            Self {
                version,
                flags,
                message_id,
                source_node_id,
                dest_node_id,
                encryption,
            },
            buffer,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_minimal_header() {
        let header = MessageHeader::new(MessageId::new(42));
        let mut bytes = vec![0u8; header.encoded_len()];
        let mut encoder = EncoderBuffer::new(&mut bytes);
        header.encode(&mut encoder);

        let (decoded, rest) = MessageHeader::decode(DecoderBuffer::new(&bytes)).unwrap();
        assert_eq!(decoded, header);
        assert!(rest.is_empty());
    }

    #[test]
    fn round_trips_full_header() {
        let header = MessageHeader::new(MessageId::new(7))
            .with_source(NodeId::new(0x1122334455667788))
            .with_dest(NodeId::new(0xAABBCCDDEEFF0011))
            .with_encryption(EncryptionMeta {
                key_id: KeyId::new(0x55AA),
                enc_type: EncryptionType::AesCcm64,
            });
        let mut bytes = vec![0u8; header.encoded_len() + 3];
        let mut encoder = EncoderBuffer::new(&mut bytes);
        encoder.write_slice(&[0xFF, 0xFF, 0xFF]); // fake payload after header
        let header_start = encoder.len();
        header.encode(&mut encoder);

        let encoded = &bytes[header_start..header_start + header.encoded_len()];
        let (decoded, rest) = MessageHeader::decode(DecoderBuffer::new(encoded)).unwrap();
        assert_eq!(decoded, header);
        assert!(rest.is_empty());
    }

    #[test]
    fn rejects_truncated_header() {
        let bytes = [0u8; 1];
        assert!(matches!(
            MessageHeader::decode(DecoderBuffer::new(&bytes)),
            Err(WeaveError::InvalidMessageLength)
        ));
    }

    #[test]
    fn rejects_unsupported_version() {
        let version_and_flags: u16 = 0xF000; // version 15
        let mut bytes = version_and_flags.to_le_bytes().to_vec();
        bytes.extend_from_slice(&0u32.to_le_bytes());
        assert!(matches!(
            MessageHeader::decode(DecoderBuffer::new(&bytes)),
            Err(WeaveError::UnsupportedMessageVersion)
        ));
    }
}
