//! UDP transport layer

use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{info, trace};

use crate::protocol::{Packet, MAX_DATAGRAM_SIZE};

use super::error::NetworkError;

/// UDP transport for sending and receiving packets
#[derive(Clone)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl UdpTransport {
    /// Bind to a local address with SO_REUSEADDR enabled
    ///
    /// Binding is synchronous so callers learn about port conflicts before any
    /// worker is spawned. Must be called within a tokio runtime context.
    pub fn bind(addr: SocketAddr) -> Result<Self, NetworkError> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

        // Quick rebind after a session stops
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket)?;
        let local_addr = socket.local_addr()?;

        info!(
            "UDP transport bound to {} (SO_REUSEADDR enabled)",
            local_addr
        );

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
        })
    }

    /// Bind to an ephemeral port matching the address family of `peer`
    pub fn bind_ephemeral_for(peer: SocketAddr) -> Result<Self, NetworkError> {
        let local: SocketAddr = if peer.is_ipv4() {
            "0.0.0.0:0".parse()?
        } else {
            "[::]:0".parse()?
        };
        Self::bind(local)
    }

    /// Get the local address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Send a packet to a remote address
    pub async fn send_to(&self, packet: &Packet, addr: SocketAddr) -> Result<(), NetworkError> {
        let data = packet.to_bytes();
        self.send_raw(&data, addr).await
    }

    /// Send raw bytes (STUN requests, hole-punch packets)
    pub async fn send_raw(&self, data: &[u8], addr: SocketAddr) -> Result<(), NetworkError> {
        self.socket.send_to(data, addr).await?;
        trace!("Sent {} bytes to {}", data.len(), addr);
        Ok(())
    }

    /// Receive a packet (returns packet and sender address)
    pub async fn recv_from(&self) -> Result<(Packet, SocketAddr), NetworkError> {
        let (buf, addr) = self.recv_raw().await?;
        let packet = Packet::from_bytes(&buf).ok_or(NetworkError::InvalidPacket)?;
        Ok((packet, addr))
    }

    /// Receive raw bytes without packet parsing
    pub async fn recv_raw(&self) -> Result<(Vec<u8>, SocketAddr), NetworkError> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE * 2];
        let (len, addr) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(len);
        trace!("Received {} bytes from {}", len, addr);
        Ok((buf, addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PacketType;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_transport_bind() {
        let transport = UdpTransport::bind(loopback()).unwrap();
        assert!(transport.local_addr().port() > 0);
    }

    #[tokio::test]
    async fn test_transport_send_receive() {
        let transport1 = UdpTransport::bind(loopback()).unwrap();
        let transport2 = UdpTransport::bind(loopback()).unwrap();

        let packet = Packet::new(PacketType::Control, 1, 100, vec![1, 2, 3, 4]);
        transport1
            .send_to(&packet, transport2.local_addr())
            .await
            .unwrap();

        let (received, from_addr) = transport2.recv_from().await.unwrap();
        assert_eq!(received.packet_type, PacketType::Control);
        assert_eq!(received.sequence, 1);
        assert_eq!(received.timestamp, 100);
        assert_eq!(received.payload, vec![1, 2, 3, 4]);
        assert_eq!(from_addr, transport1.local_addr());
    }

    /// SO_REUSEADDR allows rebinding to the same port after drop
    #[tokio::test]
    async fn test_transport_port_reuse() {
        let transport1 = UdpTransport::bind(loopback()).unwrap();
        let addr = transport1.local_addr();
        drop(transport1);

        for i in 0..3 {
            let transport = UdpTransport::bind(addr);
            assert!(transport.is_ok(), "Rebind attempt {} should succeed", i + 1);
            assert_eq!(transport.unwrap().local_addr().port(), addr.port());
        }
    }

    #[tokio::test]
    async fn test_garbage_datagram_is_invalid_packet() {
        let transport1 = UdpTransport::bind(loopback()).unwrap();
        let transport2 = UdpTransport::bind(loopback()).unwrap();

        transport1
            .send_raw(&[0xde, 0xad], transport2.local_addr())
            .await
            .unwrap();

        let result = transport2.recv_from().await;
        assert!(matches!(result, Err(NetworkError::InvalidPacket)));
    }
}
