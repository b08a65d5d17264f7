//! Tunnel wire format: `[1 byte type][payload]`
//!
//! Client → server: AUTH(1) carrying the 16-byte device id, DATA(2) carrying
//! one IP packet, PING(3) with no payload. Server → client reuses the type
//! space: AUTH_OK(1) with the assigned IPv4 address, DATA(2), AUTH_FAIL(3),
//! PONG(4).

use mobileproxy_common::{DeviceId, DEVICE_ID_LEN};
use std::net::Ipv4Addr;
use thiserror::Error;

pub const TYPE_AUTH: u8 = 1;
pub const TYPE_DATA: u8 = 2;
pub const TYPE_PING: u8 = 3;

pub const TYPE_AUTH_OK: u8 = 1;
pub const TYPE_AUTH_FAIL: u8 = 3;
pub const TYPE_PONG: u8 = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("unknown frame type {0}")]
    UnknownType(u8),
    #[error("invalid assigned address in AUTH_OK")]
    InvalidAddress,
    #[error("packet of {size} bytes exceeds MTU {mtu}")]
    Oversized { size: usize, mtu: usize },
}

/// Frames the device sends
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame<'a> {
    Auth(DeviceId),
    Data(&'a [u8]),
    Ping,
}

impl ClientFrame<'_> {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Auth(id) => {
                let mut frame = Vec::with_capacity(1 + DEVICE_ID_LEN);
                frame.push(TYPE_AUTH);
                frame.extend_from_slice(id.as_bytes());
                frame
            }
            Self::Data(packet) => {
                let mut frame = Vec::with_capacity(1 + packet.len());
                frame.push(TYPE_DATA);
                frame.extend_from_slice(packet);
                frame
            }
            Self::Ping => vec![TYPE_PING],
        }
    }
}

/// Frames the server sends
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame<'a> {
    AuthOk(Ipv4Addr),
    AuthFail,
    Data(&'a [u8]),
    Pong,
}

impl<'a> ServerFrame<'a> {
    pub fn decode(frame: &'a [u8]) -> Result<Self, FrameError> {
        let (&kind, payload) = frame.split_first().ok_or(FrameError::Empty)?;
        match kind {
            TYPE_AUTH_OK => parse_assigned_ip(payload).map(Self::AuthOk),
            TYPE_DATA => Ok(Self::Data(payload)),
            TYPE_AUTH_FAIL => Ok(Self::AuthFail),
            TYPE_PONG => Ok(Self::Pong),
            other => Err(FrameError::UnknownType(other)),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::AuthOk(ip) => {
                let mut frame = vec![TYPE_AUTH_OK];
                frame.extend_from_slice(&ip.octets());
                frame
            }
            Self::AuthFail => vec![TYPE_AUTH_FAIL],
            Self::Data(packet) => {
                let mut frame = Vec::with_capacity(1 + packet.len());
                frame.push(TYPE_DATA);
                frame.extend_from_slice(packet);
                frame
            }
            Self::Pong => vec![TYPE_PONG],
        }
    }
}

/// The assigned address comes as 4 raw bytes, or as dotted-quad text.
fn parse_assigned_ip(payload: &[u8]) -> Result<Ipv4Addr, FrameError> {
    if payload.len() == 4 {
        return Ok(Ipv4Addr::new(payload[0], payload[1], payload[2], payload[3]));
    }

    std::str::from_utf8(payload)
        .ok()
        .map(|text| text.trim_matches(|c: char| c.is_whitespace() || c == '\0'))
        .and_then(|text| text.parse().ok())
        .ok_or(FrameError::InvalidAddress)
}

/// Checks a packet read from the virtual interface against the MTU.
pub fn check_packet(packet: &[u8], mtu: usize) -> Result<(), FrameError> {
    if packet.len() > mtu {
        return Err(FrameError::Oversized {
            size: packet.len(),
            mtu,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_frame_layout() {
        let id = DeviceId::from_bytes([0xAB; DEVICE_ID_LEN]);
        let frame = ClientFrame::Auth(id).encode();
        assert_eq!(frame.len(), 17);
        assert_eq!(frame[0], TYPE_AUTH);
        assert!(frame[1..].iter().all(|b| *b == 0xAB));
    }

    #[test]
    fn ping_and_data_frames() {
        assert_eq!(ClientFrame::Ping.encode(), vec![3]);
        assert_eq!(ClientFrame::Data(&[0x45, 0x00]).encode(), vec![2, 0x45, 0x00]);
    }

    #[test]
    fn auth_ok_binary_and_text() {
        assert_eq!(
            ServerFrame::decode(&[1, 10, 8, 0, 2]).unwrap(),
            ServerFrame::AuthOk(Ipv4Addr::new(10, 8, 0, 2))
        );
        let mut text = vec![TYPE_AUTH_OK];
        text.extend_from_slice(b"10.8.0.17\n");
        assert_eq!(
            ServerFrame::decode(&text).unwrap(),
            ServerFrame::AuthOk(Ipv4Addr::new(10, 8, 0, 17))
        );
    }

    #[test]
    fn auth_ok_without_address_is_rejected() {
        assert_eq!(ServerFrame::decode(&[1]), Err(FrameError::InvalidAddress));
        assert_eq!(
            ServerFrame::decode(&[1, b'x', b'y']),
            Err(FrameError::InvalidAddress)
        );
    }

    #[test]
    fn server_control_frames() {
        assert_eq!(ServerFrame::decode(&[3]).unwrap(), ServerFrame::AuthFail);
        assert_eq!(ServerFrame::decode(&[4]).unwrap(), ServerFrame::Pong);
        assert_eq!(ServerFrame::decode(&[]), Err(FrameError::Empty));
        assert_eq!(ServerFrame::decode(&[9, 1]), Err(FrameError::UnknownType(9)));
        assert_eq!(
            ServerFrame::decode(&[2, 1, 2, 3]).unwrap(),
            ServerFrame::Data(&[1, 2, 3])
        );
    }

    #[test]
    fn packet_size_limit() {
        assert!(check_packet(&[0u8; 1400], 1400).is_ok());
        assert_eq!(
            check_packet(&[0u8; 1401], 1400),
            Err(FrameError::Oversized { size: 1401, mtu: 1400 })
        );
    }
}
