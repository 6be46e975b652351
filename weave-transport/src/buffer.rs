//! Reference-counted packet buffers.
//!
//! Wraps `bytes::Bytes`/`BytesMut`, which already implement reference
//! counting for us (§5: "Buffer pools use reference counting"). A buffer
//! handed to the retransmit table (§4.5) is exclusively owned by that entry
//! until the entry is cleared, matching the single-owner invariant in §5.

use bytes::{Bytes, BytesMut};
use weave_core::message_header::MessageHeader;

/// A growable buffer used while assembling an outbound message. Callers
/// reserve `MessageHeader::MIN_HEADER_RESERVE` bytes up front so headers can
/// be prepended without a copy.
pub struct PacketBuffer {
    inner: BytesMut,
    header_reserved: usize,
}

impl PacketBuffer {
    /// Allocates a buffer with the message header's minimum reserved prefix
    /// plus `payload_capacity` bytes for the application payload.
    pub fn with_payload_capacity(payload_capacity: usize) -> Self {
        Self::with_reserve_and_payload_capacity(MessageHeader::MIN_HEADER_RESERVE, payload_capacity)
    }

    /// Allocates a buffer with an explicit header reserve, for callers that
    /// already know the exact encoded length of the headers they'll write
    /// (e.g. once source/dest/encryption presence is known).
    pub fn with_reserve_and_payload_capacity(reserve: usize, payload_capacity: usize) -> Self {
        let mut inner = BytesMut::with_capacity(reserve + payload_capacity);
        inner.resize(reserve, 0);
        Self {
            inner,
            header_reserved: reserve,
        }
    }

    /// Appends application payload bytes after the reserved header prefix.
    pub fn extend_payload(&mut self, data: &[u8]) {
        self.inner.extend_from_slice(data);
    }

    /// The full reserved prefix, available for the codec to write headers
    /// back-to-front into.
    pub fn header_prefix_mut(&mut self) -> &mut [u8] {
        &mut self.inner[..self.header_reserved]
    }

    pub fn header_reserved(&self) -> usize {
        self.header_reserved
    }

    /// Trims unused reserved header bytes down to `used`, shifting the
    /// payload left so the wire image starts at offset 0.
    pub fn finalize(mut self, used: usize) -> Bytes {
        assert!(used <= self.header_reserved);
        let trim = self.header_reserved - used;
        if trim > 0 {
            let _ = self.inner.split_to(trim);
        }
        self.inner.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalize_trims_unused_reserve() {
        let mut buf = PacketBuffer::with_payload_capacity(4);
        buf.extend_payload(&[0xAA, 0xBB]);
        let bytes = buf.finalize(10);
        assert_eq!(bytes.len(), 10 + 2);
        assert_eq!(&bytes[10..], &[0xAA, 0xBB]);
    }
}
