//! STUN client for NAT traversal
//!
//! Implements the RFC 5389 binding request to discover the public address a
//! NAT maps us to. The result feeds the rendezvous info sent over signaling.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::error::NetworkError;
use super::transport::UdpTransport;

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_RESPONSE: u16 = 0x0101;

const MAPPED_ADDRESS: u16 = 0x0001;
const XOR_MAPPED_ADDRESS: u16 = 0x0020;

const MAGIC_COOKIE: u32 = 0x2112A442;

/// Default STUN servers
pub const DEFAULT_STUN_SERVERS: &[&str] = &["stun.l.google.com:19302", "stun.cloudflare.com:3478"];

/// Result of a STUN binding request
#[derive(Debug, Clone)]
pub struct StunResult {
    /// Public address as seen by the STUN server
    pub mapped_address: SocketAddr,
    /// STUN server that answered
    pub server: String,
}

/// STUN client for discovering the public address
pub struct StunClient {
    transport: UdpTransport,
    timeout: Duration,
}

impl StunClient {
    /// Create a STUN client on its own ephemeral socket
    pub fn bind(timeout: Duration) -> Result<Self, NetworkError> {
        let transport = UdpTransport::bind("0.0.0.0:0".parse()?)?;
        Ok(Self { transport, timeout })
    }

    /// Try each server in turn until one answers
    pub async fn discover(&self, servers: &[String]) -> Result<StunResult, NetworkError> {
        for server in servers {
            match self.binding_request(server).await {
                Ok(result) => return Ok(result),
                Err(e) => warn!("STUN request to {} failed: {}", server, e),
            }
        }
        Err(NetworkError::Stun("All STUN servers failed".to_string()))
    }

    /// Send a binding request to a specific server
    pub async fn binding_request(&self, server: &str) -> Result<StunResult, NetworkError> {
        let server_addr = tokio::net::lookup_host(server)
            .await
            .map_err(|e| NetworkError::Stun(format!("DNS lookup failed: {}", e)))?
            .find(|a| a.is_ipv4())
            .ok_or_else(|| NetworkError::Stun("No IPv4 address found".to_string()))?;

        debug!("Sending STUN binding request to {}", server_addr);

        let transaction_id: [u8; 12] = rand::random();
        self.transport
            .send_raw(&build_binding_request(&transaction_id), server_addr)
            .await?;

        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let (data, from) = timeout(remaining, self.transport.recv_raw())
                .await
                .map_err(|_| NetworkError::Stun("Timeout".to_string()))??;
            if from != server_addr {
                continue;
            }

            let mapped_address = parse_binding_response(&data, &transaction_id)?;
            info!("STUN discovered public address: {}", mapped_address);
            return Ok(StunResult {
                mapped_address,
                server: server.to_string(),
            });
        }
    }
}

fn build_binding_request(transaction_id: &[u8; 12]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(20);
    msg.extend_from_slice(&BINDING_REQUEST.to_be_bytes());
    msg.extend_from_slice(&0u16.to_be_bytes());
    msg.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    msg.extend_from_slice(transaction_id);
    msg
}

fn parse_binding_response(
    data: &[u8],
    expected_txn_id: &[u8; 12],
) -> Result<SocketAddr, NetworkError> {
    if data.len() < 20 {
        return Err(NetworkError::Stun("Response too short".to_string()));
    }

    let msg_type = u16::from_be_bytes([data[0], data[1]]);
    if msg_type != BINDING_RESPONSE {
        return Err(NetworkError::Stun(format!(
            "Unexpected message type: 0x{:04x}",
            msg_type
        )));
    }

    let cookie = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if cookie != MAGIC_COOKIE {
        return Err(NetworkError::Stun("Invalid magic cookie".to_string()));
    }

    if &data[8..20] != expected_txn_id {
        return Err(NetworkError::Stun("Transaction ID mismatch".to_string()));
    }

    let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    if data.len() < 20 + msg_len {
        return Err(NetworkError::Stun("Message truncated".to_string()));
    }

    let mut fallback = None;
    let mut offset = 20;
    while offset + 4 <= 20 + msg_len {
        let attr_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let attr_len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        if offset + 4 + attr_len > data.len() {
            break;
        }
        let attr = &data[offset + 4..offset + 4 + attr_len];

        match attr_type {
            XOR_MAPPED_ADDRESS => return parse_xor_mapped_address(attr, expected_txn_id),
            MAPPED_ADDRESS => fallback = Some(parse_mapped_address(attr)),
            _ => {}
        }

        // Attributes are padded to 4 bytes
        offset += 4 + ((attr_len + 3) & !3);
    }

    fallback.unwrap_or_else(|| Err(NetworkError::Stun("No mapped address in response".to_string())))
}

fn parse_xor_mapped_address(data: &[u8], txn_id: &[u8; 12]) -> Result<SocketAddr, NetworkError> {
    if data.len() < 8 {
        return Err(NetworkError::Stun("XOR-MAPPED-ADDRESS too short".to_string()));
    }

    let port = u16::from_be_bytes([data[2], data[3]]) ^ ((MAGIC_COOKIE >> 16) as u16);

    match data[1] {
        0x01 => {
            let addr = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) ^ MAGIC_COOKIE;
            Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(addr)), port))
        }
        0x02 => {
            if data.len() < 20 {
                return Err(NetworkError::Stun(
                    "XOR-MAPPED-ADDRESS IPv6 too short".to_string(),
                ));
            }
            let mut mask = [0u8; 16];
            mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            mask[4..].copy_from_slice(txn_id);
            let mut octets = [0u8; 16];
            for (i, octet) in octets.iter_mut().enumerate() {
                *octet = data[4 + i] ^ mask[i];
            }
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        family => Err(NetworkError::Stun(format!(
            "Unknown address family: {}",
            family
        ))),
    }
}

/// Legacy, non-XOR form
fn parse_mapped_address(data: &[u8]) -> Result<SocketAddr, NetworkError> {
    if data.len() < 8 {
        return Err(NetworkError::Stun("MAPPED-ADDRESS too short".to_string()));
    }

    let port = u16::from_be_bytes([data[2], data[3]]);
    match data[1] {
        0x01 => {
            let ip = Ipv4Addr::new(data[4], data[5], data[6], data[7]);
            Ok(SocketAddr::new(ip.into(), port))
        }
        family => Err(NetworkError::Stun(format!(
            "Unsupported address family: {}",
            family
        ))),
    }
}
