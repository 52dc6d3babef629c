//! Minimal STUN binding (RFC 5389 subset).
//!
//! Enough to learn our server-reflexive address: build a binding request,
//! parse the success response, extract XOR-MAPPED-ADDRESS (with the plain
//! MAPPED-ADDRESS fallback some old servers still send).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use canopy_proto::Status;
use tokio::net::UdpSocket;
use tracing::debug;

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;
const MAGIC_COOKIE: u32 = 0x2112_A442;
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

const QUERY_TIMEOUT: Duration = Duration::from_secs(3);

/// Ask the given STUN servers for our reflexive address as seen from
/// `socket`. Servers are tried in order; the first answer wins.
pub async fn discover_reflexive_addr(
    socket: &UdpSocket,
    servers: &[String],
) -> Result<SocketAddr, Status> {
    let transaction_id: [u8; 12] = rand::random();
    let request = build_binding_request(&transaction_id);

    for server in servers {
        let addrs: Vec<SocketAddr> = match tokio::net::lookup_host(server.as_str()).await {
            Ok(addrs) => addrs.collect(),
            Err(e) => {
                debug!(%server, error = %e, "stun: failed resolving server");
                continue;
            }
        };

        for addr in addrs {
            if socket.send_to(&request, addr).await.is_err() {
                continue;
            }
            let mut buf = [0u8; 1024];
            match tokio::time::timeout(QUERY_TIMEOUT, socket.recv_from(&mut buf)).await {
                Ok(Ok((len, _))) => {
                    if let Some(mapped) = parse_binding_response(&buf[..len], &transaction_id) {
                        return Ok(mapped);
                    }
                }
                _ => continue,
            }
        }
    }

    Err(Status::unavailable("no STUN server answered"))
}

fn build_binding_request(transaction_id: &[u8; 12]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(20);
    buf.extend_from_slice(&BINDING_REQUEST.to_be_bytes());
    buf.extend_from_slice(&0u16.to_be_bytes()); // no attributes
    buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    buf.extend_from_slice(transaction_id);
    buf
}

fn parse_binding_response(data: &[u8], expected_txn: &[u8; 12]) -> Option<SocketAddr> {
    if data.len() < 20 {
        return None;
    }
    let msg_type = u16::from_be_bytes([data[0], data[1]]);
    if msg_type != BINDING_SUCCESS {
        return None;
    }
    let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    let cookie = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if cookie != MAGIC_COOKIE || &data[8..20] != expected_txn {
        return None;
    }

    let attrs = &data[20..(20 + msg_len).min(data.len())];
    let mut pos = 0;
    while pos + 4 <= attrs.len() {
        let attr_type = u16::from_be_bytes([attrs[pos], attrs[pos + 1]]);
        let attr_len = u16::from_be_bytes([attrs[pos + 2], attrs[pos + 3]]) as usize;
        pos += 4;
        if pos + attr_len > attrs.len() {
            break;
        }
        let value = &attrs[pos..pos + attr_len];
        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => return parse_xor_mapped(value, &data[4..20]),
            ATTR_MAPPED_ADDRESS => return parse_mapped(value),
            _ => {}
        }
        // Attributes are padded to 4-byte boundaries.
        pos += (attr_len + 3) & !3;
    }
    None
}

/// `xor_block` is magic cookie || transaction id (16 bytes).
fn parse_xor_mapped(value: &[u8], xor_block: &[u8]) -> Option<SocketAddr> {
    if value.len() < 8 {
        return None;
    }
    let family = value[1];
    let port = u16::from_be_bytes([value[2], value[3]]) ^ (MAGIC_COOKIE >> 16) as u16;
    match family {
        0x01 => {
            let ip = Ipv4Addr::new(
                value[4] ^ xor_block[0],
                value[5] ^ xor_block[1],
                value[6] ^ xor_block[2],
                value[7] ^ xor_block[3],
            );
            Some(SocketAddr::new(IpAddr::V4(ip), port))
        }
        0x02 if value.len() >= 20 => {
            let mut octets = [0u8; 16];
            for i in 0..16 {
                octets[i] = value[4 + i] ^ xor_block[i];
            }
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

fn parse_mapped(value: &[u8]) -> Option<SocketAddr> {
    if value.len() < 8 || value[1] != 0x01 {
        return None;
    }
    let port = u16::from_be_bytes([value[2], value[3]]);
    let ip = Ipv4Addr::new(value[4], value[5], value[6], value[7]);
    Some(SocketAddr::new(IpAddr::V4(ip), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xor_response(txn: &[u8; 12], addr: SocketAddr) -> Vec<u8> {
        let magic = MAGIC_COOKIE.to_be_bytes();
        let (ip, port) = match addr {
            SocketAddr::V4(v4) => (v4.ip().octets(), v4.port()),
            SocketAddr::V6(_) => panic!("v4 only in this helper"),
        };
        let xport = port ^ (MAGIC_COOKIE >> 16) as u16;
        let mut attr = vec![0x00, 0x01];
        attr.extend_from_slice(&xport.to_be_bytes());
        for (i, octet) in ip.iter().enumerate() {
            attr.push(octet ^ magic[i]);
        }

        let mut msg = Vec::new();
        msg.extend_from_slice(&BINDING_SUCCESS.to_be_bytes());
        msg.extend_from_slice(&((attr.len() as u16 + 4).to_be_bytes()));
        msg.extend_from_slice(&magic);
        msg.extend_from_slice(txn);
        msg.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
        msg.extend_from_slice(&(attr.len() as u16).to_be_bytes());
        msg.extend_from_slice(&attr);
        msg
    }

    #[test]
    fn parses_xor_mapped_address() {
        let txn = [7u8; 12];
        let addr: SocketAddr = "192.0.2.33:8080".parse().unwrap();
        let response = xor_response(&txn, addr);
        assert_eq!(parse_binding_response(&response, &txn), Some(addr));
    }

    #[test]
    fn rejects_wrong_transaction_id() {
        let txn = [7u8; 12];
        let response = xor_response(&txn, "192.0.2.33:8080".parse().unwrap());
        assert_eq!(parse_binding_response(&response, &[8u8; 12]), None);
    }

    #[test]
    fn rejects_short_and_non_success() {
        let txn = [7u8; 12];
        assert_eq!(parse_binding_response(&[0u8; 8], &txn), None);
        let mut response = xor_response(&txn, "192.0.2.33:8080".parse().unwrap());
        response[0] = 0x00;
        response[1] = 0x11; // not a success class
        assert_eq!(parse_binding_response(&response, &txn), None);
    }

    #[tokio::test]
    async fn discovers_against_local_responder() {
        // A tiny in-process STUN responder.
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            assert!(len >= 20);
            let mut txn = [0u8; 12];
            txn.copy_from_slice(&buf[8..20]);
            let response = xor_response(&txn, from);
            server.send_to(&response, from).await.unwrap();
        });

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local = socket.local_addr().unwrap();
        let mapped = discover_reflexive_addr(&socket, &[server_addr.to_string()])
            .await
            .unwrap();
        assert_eq!(mapped, local);
    }
}
