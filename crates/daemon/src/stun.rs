//! Minimal STUN (RFC 5389) Binding codec used for reflexive address discovery.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Two independent reflectors; symmetric NAT detection needs distinct hosts.
pub const DEFAULT_REFLECTORS: [&str; 2] = ["stun1.l.google.com:19302", "stun2.l.google.com:19302"];

pub const MAGIC_COOKIE: u32 = 0x2112_A442;
const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const HEADER_LEN: usize = 20;

/// Build a Binding Request with no attributes.
pub fn build_binding_request(tx_id: &[u8; 12]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(HEADER_LEN);
    msg.extend_from_slice(&BINDING_REQUEST.to_be_bytes());
    msg.extend_from_slice(&0u16.to_be_bytes());
    msg.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    msg.extend_from_slice(tx_id);
    msg
}

/// Validate a Binding Success Response for `tx_id` and return the mapped address.
///
/// XOR-MAPPED-ADDRESS is preferred; a plain MAPPED-ADDRESS is accepted from
/// older servers.
pub fn parse_binding_response(buf: &[u8], tx_id: &[u8; 12]) -> Result<SocketAddr, String> {
    if buf.len() < HEADER_LEN {
        return Err("response too short".to_string());
    }
    let msg_type = u16::from_be_bytes([buf[0], buf[1]]);
    if msg_type != BINDING_SUCCESS {
        return Err(format!("unexpected message type: 0x{:04x}", msg_type));
    }
    if buf[8..20] != tx_id[..] {
        return Err("transaction ID mismatch".to_string());
    }
    let declared = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    let end = (HEADER_LEN + declared).min(buf.len());

    let mut fallback = None;
    let mut offset = HEADER_LEN;
    while offset + 4 <= end {
        let attr_type = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
        let attr_len = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
        let value_start = offset + 4;
        let value_end = value_start + attr_len;
        if value_end > end {
            break;
        }
        let value = &buf[value_start..value_end];
        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => {
                if let Some(addr) = decode_address(value, Some(tx_id)) {
                    return Ok(addr);
                }
            }
            ATTR_MAPPED_ADDRESS => fallback = decode_address(value, None),
            _ => {}
        }
        // attributes are padded to 4 bytes
        offset = value_start + ((attr_len + 3) & !3);
    }

    fallback.ok_or_else(|| "no mapped address in response".to_string())
}

fn decode_address(value: &[u8], xor_with: Option<&[u8; 12]>) -> Option<SocketAddr> {
    if value.len() < 4 {
        return None;
    }
    let family = value[1];
    let cookie = MAGIC_COOKIE.to_be_bytes();
    let mut port = u16::from_be_bytes([value[2], value[3]]);
    if xor_with.is_some() {
        port ^= (MAGIC_COOKIE >> 16) as u16;
    }

    match family {
        0x01 if value.len() >= 8 => {
            let mut octets = [value[4], value[5], value[6], value[7]];
            if xor_with.is_some() {
                for (b, c) in octets.iter_mut().zip(cookie.iter()) {
                    *b ^= c;
                }
            }
            Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        0x02 if value.len() >= 20 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&value[4..20]);
            if let Some(tx_id) = xor_with {
                let mut key = [0u8; 16];
                key[..4].copy_from_slice(&cookie);
                key[4..].copy_from_slice(tx_id);
                for (b, k) in octets.iter_mut().zip(key.iter()) {
                    *b ^= k;
                }
            }
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

#[cfg(test)]
pub(crate) fn encode_success_response(tx_id: &[u8; 12], mapped: SocketAddr) -> Vec<u8> {
    let cookie = MAGIC_COOKIE.to_be_bytes();
    let mut value = vec![0u8];
    let port = mapped.port() ^ (MAGIC_COOKIE >> 16) as u16;
    match mapped.ip() {
        IpAddr::V4(ip) => {
            value.push(0x01);
            value.extend_from_slice(&port.to_be_bytes());
            for (b, c) in ip.octets().iter().zip(cookie.iter()) {
                value.push(b ^ c);
            }
        }
        IpAddr::V6(ip) => {
            value.push(0x02);
            value.extend_from_slice(&port.to_be_bytes());
            let mut key = [0u8; 16];
            key[..4].copy_from_slice(&cookie);
            key[4..].copy_from_slice(tx_id);
            for (b, k) in ip.octets().iter().zip(key.iter()) {
                value.push(b ^ k);
            }
        }
    }

    let mut msg = Vec::new();
    msg.extend_from_slice(&BINDING_SUCCESS.to_be_bytes());
    msg.extend_from_slice(&((value.len() + 4) as u16).to_be_bytes());
    msg.extend_from_slice(&cookie);
    msg.extend_from_slice(tx_id);
    msg.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
    msg.extend_from_slice(&(value.len() as u16).to_be_bytes());
    msg.extend_from_slice(&value);
    msg
}
