//! The DHCP options a load-generation client sends and inspects (RFC 2132).
//!
//! Each option is a code byte, a length byte and `length` bytes of data.
//! Options this client has no use for are carried as [`DhcpOption::Unknown`].

use std::fmt;
use std::net::Ipv4Addr;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OptionCode {
    Pad = 0,
    Hostname = 12,
    RequestedIpAddress = 50,
    LeaseTime = 51,
    MessageType = 53,
    ServerIdentifier = 54,
    ParameterRequestList = 55,
    ClientIdentifier = 61,
    RelayAgentInfo = 82,
    End = 255,
}

impl TryFrom<u8> for OptionCode {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Pad),
            12 => Ok(Self::Hostname),
            50 => Ok(Self::RequestedIpAddress),
            51 => Ok(Self::LeaseTime),
            53 => Ok(Self::MessageType),
            54 => Ok(Self::ServerIdentifier),
            55 => Ok(Self::ParameterRequestList),
            61 => Ok(Self::ClientIdentifier),
            82 => Ok(Self::RelayAgentInfo),
            255 => Ok(Self::End),
            other => Err(other),
        }
    }
}

/// DHCP message types (option 53).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl MessageType {
    /// Parses a message type from its name (`Discover`, `DHCP-Request`...)
    /// or its numeric code.
    pub fn from_name(name: &str) -> Option<Self> {
        if let Ok(code) = name.parse::<u8>() {
            return Self::try_from(code).ok();
        }
        let lowered = name.to_ascii_lowercase();
        let bare = lowered.strip_prefix("dhcp-").unwrap_or(&lowered);
        match bare {
            "discover" => Some(Self::Discover),
            "offer" => Some(Self::Offer),
            "request" => Some(Self::Request),
            "decline" => Some(Self::Decline),
            "ack" => Some(Self::Ack),
            "nak" => Some(Self::Nak),
            "release" => Some(Self::Release),
            "inform" => Some(Self::Inform),
            _ => None,
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Discover),
            2 => Ok(Self::Offer),
            3 => Ok(Self::Request),
            4 => Ok(Self::Decline),
            5 => Ok(Self::Ack),
            6 => Ok(Self::Nak),
            7 => Ok(Self::Release),
            8 => Ok(Self::Inform),
            other => Err(other),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Discover => "DHCP-Discover",
            Self::Offer => "DHCP-Offer",
            Self::Request => "DHCP-Request",
            Self::Decline => "DHCP-Decline",
            Self::Ack => "DHCP-Ack",
            Self::Nak => "DHCP-NAK",
            Self::Release => "DHCP-Release",
            Self::Inform => "DHCP-Inform",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpOption {
    Hostname(String),
    RequestedIpAddress(Ipv4Addr),
    LeaseTime(u32),
    MessageType(MessageType),
    ServerIdentifier(Ipv4Addr),
    ParameterRequestList(Vec<u8>),
    ClientIdentifier(Vec<u8>),
    RelayAgentInfo(Vec<u8>),
    Unknown(u8, Vec<u8>),
}

fn ipv4_from(data: &[u8], what: &str) -> Result<Ipv4Addr> {
    let octets: [u8; 4] = data
        .try_into()
        .map_err(|_| Error::InvalidPacket(format!("Invalid {} length: {}", what, data.len())))?;
    Ok(Ipv4Addr::from(octets))
}

impl DhcpOption {
    pub fn code(&self) -> u8 {
        match self {
            Self::Hostname(_) => OptionCode::Hostname as u8,
            Self::RequestedIpAddress(_) => OptionCode::RequestedIpAddress as u8,
            Self::LeaseTime(_) => OptionCode::LeaseTime as u8,
            Self::MessageType(_) => OptionCode::MessageType as u8,
            Self::ServerIdentifier(_) => OptionCode::ServerIdentifier as u8,
            Self::ParameterRequestList(_) => OptionCode::ParameterRequestList as u8,
            Self::ClientIdentifier(_) => OptionCode::ClientIdentifier as u8,
            Self::RelayAgentInfo(_) => OptionCode::RelayAgentInfo as u8,
            Self::Unknown(code, _) => *code,
        }
    }

    /// Decodes one option from its code and data (length byte excluded).
    pub fn parse(code: u8, data: &[u8]) -> Result<Self> {
        let option = match OptionCode::try_from(code) {
            Ok(OptionCode::Hostname) => Self::Hostname(String::from_utf8_lossy(data).into_owned()),
            Ok(OptionCode::RequestedIpAddress) => {
                Self::RequestedIpAddress(ipv4_from(data, "requested IP address")?)
            }
            Ok(OptionCode::LeaseTime) => {
                let bytes: [u8; 4] = data.try_into().map_err(|_| {
                    Error::InvalidPacket(format!("Invalid lease time length: {}", data.len()))
                })?;
                Self::LeaseTime(u32::from_be_bytes(bytes))
            }
            Ok(OptionCode::MessageType) => {
                let [value] = data else {
                    return Err(Error::InvalidPacket(format!(
                        "Invalid message type length: {}",
                        data.len()
                    )));
                };
                let message_type = MessageType::try_from(*value).map_err(|value| {
                    Error::InvalidPacket(format!("Unknown message type: {}", value))
                })?;
                Self::MessageType(message_type)
            }
            Ok(OptionCode::ServerIdentifier) => {
                Self::ServerIdentifier(ipv4_from(data, "server identifier")?)
            }
            Ok(OptionCode::ParameterRequestList) => Self::ParameterRequestList(data.to_vec()),
            Ok(OptionCode::ClientIdentifier) => {
                if data.len() < 2 {
                    return Err(Error::InvalidPacket(
                        "Client identifier must be at least 2 bytes".to_string(),
                    ));
                }
                Self::ClientIdentifier(data.to_vec())
            }
            Ok(OptionCode::RelayAgentInfo) => Self::RelayAgentInfo(data.to_vec()),
            _ => Self::Unknown(code, data.to_vec()),
        };
        Ok(option)
    }

    /// Encodes as code, length, data. Data longer than 255 bytes is truncated.
    pub fn encode(&self) -> Vec<u8> {
        let data: Vec<u8> = match self {
            Self::Hostname(name) => name.as_bytes().to_vec(),
            Self::RequestedIpAddress(ip) | Self::ServerIdentifier(ip) => ip.octets().to_vec(),
            Self::LeaseTime(seconds) => seconds.to_be_bytes().to_vec(),
            Self::MessageType(message_type) => vec![*message_type as u8],
            Self::ParameterRequestList(bytes)
            | Self::ClientIdentifier(bytes)
            | Self::RelayAgentInfo(bytes)
            | Self::Unknown(_, bytes) => bytes.clone(),
        };
        let length = data.len().min(u8::MAX as usize);

        let mut encoded = Vec::with_capacity(2 + length);
        encoded.push(self.code());
        encoded.push(length as u8);
        encoded.extend_from_slice(&data[..length]);
        encoded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_from_name() {
        assert_eq!(MessageType::from_name("Discover"), Some(MessageType::Discover));
        assert_eq!(MessageType::from_name("DHCP-Request"), Some(MessageType::Request));
        assert_eq!(MessageType::from_name("8"), Some(MessageType::Inform));
        assert_eq!(MessageType::from_name("9"), None);
        assert_eq!(MessageType::from_name("bogus"), None);
    }

    #[test]
    fn test_option_encode_then_parse() {
        let options = vec![
            DhcpOption::Hostname("host-1".to_string()),
            DhcpOption::RequestedIpAddress(Ipv4Addr::new(10, 0, 0, 7)),
            DhcpOption::LeaseTime(3600),
            DhcpOption::MessageType(MessageType::Discover),
            DhcpOption::ClientIdentifier(vec![1, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]),
            DhcpOption::Unknown(250, vec![1, 2, 3]),
        ];

        for option in options {
            let encoded = option.encode();
            assert_eq!(encoded[1] as usize, encoded.len() - 2);
            let parsed = DhcpOption::parse(encoded[0], &encoded[2..]).unwrap();
            assert_eq!(parsed, option);
        }
    }

    #[test]
    fn test_option_length_validation() {
        assert!(DhcpOption::parse(50, &[10, 0, 0]).is_err());
        assert!(DhcpOption::parse(51, &[0, 0, 1]).is_err());
        assert!(DhcpOption::parse(53, &[]).is_err());
        assert!(DhcpOption::parse(53, &[42]).is_err());
        assert!(DhcpOption::parse(61, &[1]).is_err());
    }

    #[test]
    fn test_oversized_option_is_truncated() {
        let option = DhcpOption::Hostname("x".repeat(300));
        let encoded = option.encode();
        assert_eq!(encoded[1], 255);
        assert_eq!(encoded.len(), 257);
    }
}
