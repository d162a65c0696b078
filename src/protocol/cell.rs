//! Link-protocol cells
//!
//! Typed representations of every wire message, as a closed sum over the
//! command set. Each variant owns exactly the bytes needed to rebuild its
//! payload; decoding an unknown command is a protocol error, not a
//! catch-all variant.

use crate::error::{Result, TorError};
use crate::protocol::codec::{Reader, Writer, FIXED_PAYLOAD_LEN};
use std::net::IpAddr;

/// Command byte values of the implemented link version.
pub mod command {
    pub const PADDING: u8 = 0;
    pub const RELAY: u8 = 3;
    pub const DESTROY: u8 = 4;
    pub const CREATE_FAST: u8 = 5;
    pub const CREATED_FAST: u8 = 6;
    pub const VERSIONS: u8 = 7;
    pub const NETINFO: u8 = 8;
    pub const RELAY_EARLY: u8 = 9;
    pub const CREATE2: u8 = 10;
    pub const CREATED2: u8 = 11;
    pub const CERTS: u8 = 129;
    pub const AUTH_CHALLENGE: u8 = 130;
}

/// Link versions this client offers.
pub const SUPPORTED_VERSIONS: [u16; 1] = [3];

/// Key material size of the CREATE_FAST handshake.
pub const FAST_KEY_MATERIAL_LEN: usize = 20;

/// ntor handshake type code carried in CREATE2.
pub const HANDSHAKE_TYPE_NTOR: u16 = 2;

/// One certificate from a CERTS cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cert {
    pub cert_type: u8,
    pub certificate: Vec<u8>,
}

/// Address entry of a NETINFO cell: `{type, length, value}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterAddress {
    pub addr_type: u8,
    pub value: Vec<u8>,
}

impl RouterAddress {
    pub fn from_ip(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(v4) => Self {
                addr_type: 4,
                value: v4.octets().to_vec(),
            },
            IpAddr::V6(v6) => Self {
                addr_type: 6,
                value: v6.octets().to_vec(),
            },
        }
    }

    /// Interpret the entry as an IP address, when the type says it is one.
    pub fn to_ip(&self) -> Option<IpAddr> {
        match (self.addr_type, self.value.len()) {
            (4, 4) => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&self.value);
                Some(IpAddr::from(octets))
            }
            (6, 16) => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&self.value);
                Some(IpAddr::from(octets))
            }
            _ => None,
        }
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self> {
        let addr_type = reader.read_u8()?;
        let len = reader.read_u8()? as usize;
        Ok(Self {
            addr_type,
            value: reader.read_bytes(len)?,
        })
    }

    fn write(&self, writer: &mut Writer) {
        writer.write_u8(self.addr_type);
        writer.write_u8(self.value.len() as u8);
        writer.write_bytes(&self.value);
    }
}

/// Payload of a NETINFO cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetInfo {
    /// Sender's clock, seconds since the epoch
    pub timestamp: u32,

    /// The address the sender believes its peer has
    pub other_address: RouterAddress,

    /// Addresses the sender claims for itself
    pub my_addresses: Vec<RouterAddress>,
}

/// A decoded link-protocol cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cell {
    Padding,
    /// Onion-encrypted relay payload, opaque at this layer
    Relay { encrypted: Vec<u8> },
    /// Same framing as RELAY; relays count these for extend abuse limits
    RelayEarly { encrypted: Vec<u8> },
    Destroy { reason: u8 },
    CreateFast { x: [u8; FAST_KEY_MATERIAL_LEN] },
    CreatedFast {
        y: [u8; FAST_KEY_MATERIAL_LEN],
        derivative_key_data: [u8; FAST_KEY_MATERIAL_LEN],
    },
    Create2 {
        handshake_type: u16,
        handshake_data: Vec<u8>,
    },
    Created2 { handshake_data: Vec<u8> },
    Versions { versions: Vec<u16> },
    NetInfo(NetInfo),
    Certs { certs: Vec<Cert> },
    AuthChallenge {
        challenge: [u8; 32],
        methods: Vec<u16>,
    },
}

impl Cell {
    /// Command byte of this cell.
    pub fn command(&self) -> u8 {
        match self {
            Cell::Padding => command::PADDING,
            Cell::Relay { .. } => command::RELAY,
            Cell::RelayEarly { .. } => command::RELAY_EARLY,
            Cell::Destroy { .. } => command::DESTROY,
            Cell::CreateFast { .. } => command::CREATE_FAST,
            Cell::CreatedFast { .. } => command::CREATED_FAST,
            Cell::Create2 { .. } => command::CREATE2,
            Cell::Created2 { .. } => command::CREATED2,
            Cell::Versions { .. } => command::VERSIONS,
            Cell::NetInfo(_) => command::NETINFO,
            Cell::Certs { .. } => command::CERTS,
            Cell::AuthChallenge { .. } => command::AUTH_CHALLENGE,
        }
    }

    /// Decode a frame payload into a typed cell.
    ///
    /// Fixed-size payloads may carry trailing padding, which is ignored;
    /// variable-length payloads must be consumed exactly. An unknown
    /// command byte poisons the connection.
    pub fn decode(command_byte: u8, payload: &[u8]) -> Result<Cell> {
        let mut reader = Reader::new(payload);
        let cell = match command_byte {
            command::PADDING => Cell::Padding,
            command::RELAY => Cell::Relay {
                encrypted: reader.read_bytes(FIXED_PAYLOAD_LEN)?,
            },
            command::RELAY_EARLY => Cell::RelayEarly {
                encrypted: reader.read_bytes(FIXED_PAYLOAD_LEN)?,
            },
            command::DESTROY => Cell::Destroy {
                reason: reader.read_u8()?,
            },
            command::CREATE_FAST => Cell::CreateFast {
                x: reader.read_array()?,
            },
            command::CREATED_FAST => Cell::CreatedFast {
                y: reader.read_array()?,
                derivative_key_data: reader.read_array()?,
            },
            command::CREATE2 => {
                let handshake_type = reader.read_u16()?;
                let len = reader.read_u16()? as usize;
                Cell::Create2 {
                    handshake_type,
                    handshake_data: reader.read_bytes(len)?,
                }
            }
            command::CREATED2 => {
                let len = reader.read_u16()? as usize;
                Cell::Created2 {
                    handshake_data: reader.read_bytes(len)?,
                }
            }
            command::VERSIONS => {
                if payload.len() % 2 != 0 {
                    return Err(TorError::Protocol(
                        "VERSIONS payload length must be even".into(),
                    ));
                }
                let mut versions = Vec::with_capacity(payload.len() / 2);
                while !reader.is_empty() {
                    versions.push(reader.read_u16()?);
                }
                Cell::Versions { versions }
            }
            command::NETINFO => {
                let timestamp = reader.read_u32()?;
                let other_address = RouterAddress::read(&mut reader)?;
                let count = reader.read_u8()?;
                let mut my_addresses = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    my_addresses.push(RouterAddress::read(&mut reader)?);
                }
                Cell::NetInfo(NetInfo {
                    timestamp,
                    other_address,
                    my_addresses,
                })
            }
            command::CERTS => {
                let count = reader.read_u8()?;
                let mut certs = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let cert_type = reader.read_u8()?;
                    let len = reader.read_u16()? as usize;
                    certs.push(Cert {
                        cert_type,
                        certificate: reader.read_bytes(len)?,
                    });
                }
                Cell::Certs { certs }
            }
            command::AUTH_CHALLENGE => {
                let challenge = reader.read_array()?;
                let method_count = reader.read_u16()?;
                let mut methods = Vec::with_capacity(method_count as usize);
                for _ in 0..method_count {
                    methods.push(reader.read_u16()?);
                }
                Cell::AuthChallenge { challenge, methods }
            }
            unknown => {
                return Err(TorError::Protocol(format!(
                    "Unknown cell command: {}",
                    unknown
                )))
            }
        };

        // Fixed-size payloads end in padding; variable-length payloads
        // must be consumed exactly.
        if crate::protocol::codec::TorFrame::is_variable_length(command_byte) && !reader.is_empty()
        {
            return Err(TorError::Protocol(format!(
                "Variable-length cell {} left {} undeclared trailing bytes",
                command_byte,
                reader.remaining()
            )));
        }
        Ok(cell)
    }

    /// Encode into `(command, payload)` for the frame codec. Fixed-length
    /// payloads come back zero-padded to 509 bytes.
    pub fn encode(&self) -> (u8, Vec<u8>) {
        let command_byte = self.command();
        let mut writer = Writer::with_capacity(FIXED_PAYLOAD_LEN);

        match self {
            Cell::Padding => {}
            Cell::Relay { encrypted } | Cell::RelayEarly { encrypted } => {
                writer.write_bytes(encrypted);
            }
            Cell::Destroy { reason } => writer.write_u8(*reason),
            Cell::CreateFast { x } => writer.write_bytes(x),
            Cell::CreatedFast {
                y,
                derivative_key_data,
            } => {
                writer.write_bytes(y);
                writer.write_bytes(derivative_key_data);
            }
            Cell::Create2 {
                handshake_type,
                handshake_data,
            } => {
                writer.write_u16(*handshake_type);
                writer.write_u16(handshake_data.len() as u16);
                writer.write_bytes(handshake_data);
            }
            Cell::Created2 { handshake_data } => {
                writer.write_u16(handshake_data.len() as u16);
                writer.write_bytes(handshake_data);
            }
            Cell::Versions { versions } => {
                for version in versions {
                    writer.write_u16(*version);
                }
            }
            Cell::NetInfo(netinfo) => {
                writer.write_u32(netinfo.timestamp);
                netinfo.other_address.write(&mut writer);
                writer.write_u8(netinfo.my_addresses.len() as u8);
                for address in &netinfo.my_addresses {
                    address.write(&mut writer);
                }
            }
            Cell::Certs { certs } => {
                writer.write_u8(certs.len() as u8);
                for cert in certs {
                    writer.write_u8(cert.cert_type);
                    writer.write_u16(cert.certificate.len() as u16);
                    writer.write_bytes(&cert.certificate);
                }
            }
            Cell::AuthChallenge { challenge, methods } => {
                writer.write_bytes(challenge);
                writer.write_u16(methods.len() as u16);
                for method in methods {
                    writer.write_u16(*method);
                }
            }
        }

        if !crate::protocol::codec::TorFrame::is_variable_length(command_byte) {
            writer.pad_to(FIXED_PAYLOAD_LEN);
        }

        (command_byte, writer.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(cell: Cell) -> Cell {
        let (command_byte, payload) = cell.encode();
        Cell::decode(command_byte, &payload).unwrap()
    }

    #[test]
    fn versions_round_trip_and_odd_length_rejected() {
        let cell = Cell::Versions {
            versions: vec![3, 4, 5],
        };
        assert_eq!(round_trip(cell.clone()), cell);

        assert!(Cell::decode(command::VERSIONS, &[0, 3, 0]).is_err());
    }

    #[test]
    fn create_fast_round_trip_pads_to_fixed_size() {
        let cell = Cell::CreateFast { x: [0xaa; 20] };
        let (command_byte, payload) = cell.encode();
        assert_eq!(command_byte, command::CREATE_FAST);
        assert_eq!(payload.len(), FIXED_PAYLOAD_LEN);
        assert_eq!(Cell::decode(command_byte, &payload).unwrap(), cell);
    }

    #[test]
    fn created_fast_round_trip() {
        let cell = Cell::CreatedFast {
            y: [1; 20],
            derivative_key_data: [2; 20],
        };
        assert_eq!(round_trip(cell.clone()), cell);
    }

    #[test]
    fn certs_round_trip_and_truncation_rejected() {
        let cell = Cell::Certs {
            certs: vec![
                Cert {
                    cert_type: 1,
                    certificate: vec![1, 2, 3],
                },
                Cert {
                    cert_type: 5,
                    certificate: vec![],
                },
            ],
        };
        assert_eq!(round_trip(cell.clone()), cell);

        // Claims one cert but carries no cert body.
        assert!(Cell::decode(command::CERTS, &[1u8, 4]).is_err());
    }

    #[test]
    fn auth_challenge_round_trip() {
        let cell = Cell::AuthChallenge {
            challenge: [7; 32],
            methods: vec![1, 3],
        };
        assert_eq!(round_trip(cell.clone()), cell);
    }

    #[test]
    fn netinfo_round_trip_with_multiple_addresses() {
        let cell = Cell::NetInfo(NetInfo {
            timestamp: 0x61f2_0000,
            other_address: RouterAddress::from_ip("198.51.100.7".parse().unwrap()),
            my_addresses: vec![
                RouterAddress::from_ip("203.0.113.1".parse().unwrap()),
                RouterAddress::from_ip("2001:db8::1".parse().unwrap()),
            ],
        });
        assert_eq!(round_trip(cell.clone()), cell);
    }

    #[test]
    fn router_address_ip_conversion() {
        let v4 = RouterAddress::from_ip("10.0.0.1".parse().unwrap());
        assert_eq!(v4.addr_type, 4);
        assert_eq!(v4.to_ip(), Some("10.0.0.1".parse().unwrap()));

        let v6 = RouterAddress::from_ip("2001:db8::2".parse().unwrap());
        assert_eq!(v6.addr_type, 6);
        assert_eq!(v6.to_ip(), Some("2001:db8::2".parse().unwrap()));

        // Unknown type stays opaque.
        let other = RouterAddress {
            addr_type: 0,
            value: vec![1, 2],
        };
        assert_eq!(other.to_ip(), None);
    }

    #[test]
    fn create2_round_trip() {
        let cell = Cell::Create2 {
            handshake_type: HANDSHAKE_TYPE_NTOR,
            handshake_data: vec![9; 84],
        };
        assert_eq!(round_trip(cell.clone()), cell);
    }

    #[test]
    fn relay_cell_carries_exactly_fixed_payload() {
        let cell = Cell::Relay {
            encrypted: vec![0x11; FIXED_PAYLOAD_LEN],
        };
        let (command_byte, payload) = cell.encode();
        assert_eq!(payload.len(), FIXED_PAYLOAD_LEN);
        assert_eq!(Cell::decode(command_byte, &payload).unwrap(), cell);

        // Short relay payloads are an error, not padding.
        assert!(Cell::decode(command::RELAY, &[0u8; 100]).is_err());
    }

    #[test]
    fn unknown_command_is_protocol_error() {
        match Cell::decode(2, &[0u8; FIXED_PAYLOAD_LEN]) {
            Err(TorError::Protocol(_)) => {}
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[test]
    fn trailing_padding_in_fixed_cells_is_ignored() {
        let mut payload = vec![0u8; FIXED_PAYLOAD_LEN];
        payload[0] = 6; // DESTROY reason
        let cell = Cell::decode(command::DESTROY, &payload).unwrap();
        assert_eq!(cell, Cell::Destroy { reason: 6 });
    }
}
