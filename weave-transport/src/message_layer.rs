//! The message layer (C3): wire framing plus routing to/from transport
//! endpoints. Actual socket I/O is an external collaborator (§1 Non-goals);
//! this module only owns the encode/decode/dispatch bookkeeping around it.

use bytes::Bytes;
use std::net::Ipv6Addr;
use weave_core::{
    error::Result,
    exchange_header::ExchangeHeader,
    fabric::FabricState,
    message_header::MessageHeader,
};

use crate::{buffer::PacketBuffer, context::ConnectionId};

/// The Weave-over-UDP default port.
pub const DEFAULT_UDP_PORT: u16 = 11095;

/// Raw datagram transport (UDP), supplied by the embedding application.
pub trait DatagramTransport: Send {
    fn send_to(
        &mut self,
        addr: Ipv6Addr,
        port: u16,
        interface: Option<u32>,
        data: &[u8],
    ) -> Result<()>;
}

/// Raw stream transport (TCP or BLE), addressed by a connection handle the
/// application assigned when the connection was established.
pub trait StreamTransport: Send {
    fn send(&mut self, connection: ConnectionId, data: &[u8]) -> Result<()>;
}

/// Invoked when a message arrives over an unsecured connection with no key
/// id, e.g. during rendezvous/pairing, before any exchange exists for it.
pub type UnsecuredConnectionHandler = Box<dyn FnMut(ConnectionId) + Send>;

/// C3: owns the fabric identity, the transport endpoints, and the single
/// preemptible unsecured-listener slot (§4.6 step 7).
pub struct MessageLayer {
    fabric: FabricState,
    datagram: Box<dyn DatagramTransport>,
    stream: Box<dyn StreamTransport>,
    unsecured_listener: Option<UnsecuredConnectionHandler>,
}

impl MessageLayer {
    pub fn new(
        fabric: FabricState,
        datagram: Box<dyn DatagramTransport>,
        stream: Box<dyn StreamTransport>,
    ) -> Self {
        Self {
            fabric,
            datagram,
            stream,
            unsecured_listener: None,
        }
    }

    pub fn fabric(&self) -> &FabricState {
        &self.fabric
    }

    /// Installs a new unsecured-connection handler. Only one may be active;
    /// installing a second preempts the first, which is returned to the
    /// caller so it can be torn down rather than silently dropped.
    pub fn install_unsecured_listener(
        &mut self,
        handler: UnsecuredConnectionHandler,
    ) -> Option<UnsecuredConnectionHandler> {
        self.unsecured_listener.replace(handler)
    }

    pub fn remove_unsecured_listener(&mut self) -> Option<UnsecuredConnectionHandler> {
        self.unsecured_listener.take()
    }

    pub fn has_unsecured_listener(&self) -> bool {
        self.unsecured_listener.is_some()
    }

    pub fn notify_unsecured_connection(&mut self, connection: ConnectionId) {
        if let Some(handler) = self.unsecured_listener.as_mut() {
            handler(connection);
        }
    }

    /// Encodes a complete wire image: message header, exchange header, and
    /// payload, in that order. The returned `Bytes` is what the retransmit
    /// table stores and what actually goes out over the transport.
    pub fn encode(
        &self,
        message_header: &MessageHeader,
        exchange_header: &ExchangeHeader,
        payload: &[u8],
    ) -> Bytes {
        let header_len = message_header.encoded_len() + exchange_header.encoded_len();
        let mut buf = PacketBuffer::with_reserve_and_payload_capacity(header_len, payload.len());
        buf.extend_payload(payload);

        {
            let mut encoder = s2n_codec::EncoderBuffer::new(buf.header_prefix_mut());
            message_header.encode(&mut encoder);
            exchange_header.encode(&mut encoder);
        }
        buf.finalize(header_len)
    }

    /// Decodes an inbound wire image into its message header, exchange
    /// header, and the remaining application payload.
    pub fn decode(&self, data: &[u8]) -> Result<(MessageHeader, ExchangeHeader, Bytes)> {
        let buffer = s2n_codec::DecoderBuffer::new(data);
        let (message_header, buffer) = MessageHeader::decode(buffer)?;
        let (exchange_header, buffer) = ExchangeHeader::decode(buffer)?;
        let payload = Bytes::copy_from_slice(buffer.into_less_safe_slice());
        Ok((message_header, exchange_header, payload))
    }

    /// Sends `data` to whichever endpoint `identity` names: the connection
    /// if one is attached, otherwise the peer's UDP address and port.
    pub fn send_to_identity(
        &mut self,
        identity: &crate::context::PeerIdentity,
        data: &[u8],
    ) -> Result<()> {
        if let Some(connection) = identity.connection {
            self.send_stream(connection, data)
        } else {
            let addr = identity
                .peer_addr
                .ok_or(weave_core::error::WeaveError::NotConnected)?;
            let port = identity.peer_port.unwrap_or(DEFAULT_UDP_PORT);
            self.send_datagram(addr, port, identity.peer_interface, data)
        }
    }

    pub fn send_datagram(
        &mut self,
        addr: Ipv6Addr,
        port: u16,
        interface: Option<u32>,
        data: &[u8],
    ) -> Result<()> {
        self.datagram.send_to(addr, port, interface, data)
    }

    pub fn send_stream(&mut self, connection: ConnectionId, data: &[u8]) -> Result<()> {
        self.stream.send(connection, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use weave_core::ids::{FabricId, MessageId, NodeId};

    struct RecordingDatagram(Arc<Mutex<Vec<Vec<u8>>>>);
    impl DatagramTransport for RecordingDatagram {
        fn send_to(&mut self, _: Ipv6Addr, _: u16, _: Option<u32>, data: &[u8]) -> Result<()> {
            self.0.lock().unwrap().push(data.to_vec());
            Ok(())
        }
    }
    struct NoopStream;
    impl StreamTransport for NoopStream {
        fn send(&mut self, _: ConnectionId, _: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    fn layer() -> MessageLayer {
        MessageLayer::new(
            FabricState::new(NodeId::new(1), FabricId::new(1), 0),
            Box::new(RecordingDatagram(Arc::new(Mutex::new(Vec::new())))),
            Box::new(NoopStream),
        )
    }

    #[test]
    fn encode_then_decode_round_trips_headers_and_payload() {
        let layer = layer();
        let message_header = MessageHeader::new(MessageId::new(9)).with_source(NodeId::new(7));
        let exchange_header = ExchangeHeader {
            version: weave_core::ExchangeVersion::V1,
            flags: weave_core::ExchangeFlags::INITIATOR,
            message_type: 3,
            exchange_id: weave_core::ExchangeId::new(10),
            profile_id: weave_core::ids::ProfileId::COMMON,
            ack_message_id: None,
        };
        let payload = b"hello weave";
        let wire = layer.encode(&message_header, &exchange_header, payload);

        let (decoded_msg, decoded_exch, decoded_payload) = layer.decode(&wire).unwrap();
        assert_eq!(decoded_msg, message_header);
        assert_eq!(decoded_exch, exchange_header);
        assert_eq!(&decoded_payload[..], payload);
    }

    #[test]
    fn unsecured_listener_install_preempts_previous() {
        let mut layer = layer();
        let seen_a = Arc::new(Mutex::new(0u64));
        let seen_a2 = seen_a.clone();
        let previous = layer.install_unsecured_listener(Box::new(move |c| {
            *seen_a2.lock().unwrap() = c;
        }));
        assert!(previous.is_none());

        let seen_b = Arc::new(Mutex::new(0u64));
        let seen_b2 = seen_b.clone();
        let previous = layer.install_unsecured_listener(Box::new(move |c| {
            *seen_b2.lock().unwrap() = c;
        }));
        assert!(previous.is_some());

        layer.notify_unsecured_connection(42);
        assert_eq!(*seen_a.lock().unwrap(), 0);
        assert_eq!(*seen_b.lock().unwrap(), 42);
    }
}
