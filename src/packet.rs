//! Minimal DHCPv4 codec (RFC 2131) for building requests and reading replies.
//!
//! ```text
//!  op | htype | hlen | hops | xid (4) | secs (2) | flags (2) | ciaddr (4)
//!  yiaddr (4) | siaddr (4) | giaddr (4) | chaddr (16) | sname (64) | file (128)
//!  magic cookie (4) = 99.130.83.99 | options (variable)
//! ```
//!
//! The registry only ever looks at the xid (bytes 4..8, big endian); the rest
//! of this module is used by the driver to build payloads and classify replies.

use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::options::{DhcpOption, MessageType, OptionCode};

const DHCP_MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

const XID_OFFSET: usize = 4;
const CHADDR_OFFSET: usize = 28;
const MAGIC_COOKIE_OFFSET: usize = 236;

/// Fixed header plus magic cookie. Anything shorter is a short read.
pub const DHCP_HEADER_SIZE: usize = MAGIC_COOKIE_OFFSET + DHCP_MAGIC_COOKIE.len();

/// BOOTP relay agents expect at least 300 bytes.
const DHCP_MIN_PACKET_SIZE: usize = 300;

pub const BOOTREQUEST: u8 = 1;
pub const BOOTREPLY: u8 = 2;
pub const HTYPE_ETHERNET: u8 = 1;
pub const HLEN_ETHERNET: u8 = 6;

/// Reads the xid of a raw DHCP payload without parsing it.
pub fn peek_xid(data: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = data.get(XID_OFFSET..XID_OFFSET + 4)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

/// Overwrites the xid of an encoded payload. Returns false if the payload is
/// too short to carry one.
pub fn set_xid_in_place(data: &mut [u8], xid: u32) -> bool {
    match data.get_mut(XID_OFFSET..XID_OFFSET + 4) {
        Some(slot) => {
            slot.copy_from_slice(&xid.to_be_bytes());
            true
        }
        None => false,
    }
}

/// Parses `aa:bb:cc:dd:ee:ff` (or `aa-bb-...`) into six octets.
pub fn parse_mac(input: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = input.split([':', '-']);
    for octet in mac.iter_mut() {
        let part = parts.next()?;
        if part.is_empty() || part.len() > 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        *octet = u8::from_str_radix(part, 16).ok()?;
    }
    parts.next().is_none().then_some(mac)
}

pub fn format_mac(mac: &[u8]) -> String {
    mac.iter()
        .map(|byte| format!("{:02x}", byte))
        .collect::<Vec<_>>()
        .join(":")
}

fn parse_hex(input: &str) -> Option<Vec<u8>> {
    let digits: String = input
        .trim_start_matches("0x")
        .chars()
        .filter(|c| *c != ':')
        .collect();
    if digits.is_empty() || digits.len() % 2 != 0 || !digits.is_ascii() {
        return None;
    }
    (0..digits.len())
        .step_by(2)
        .map(|index| u8::from_str_radix(&digits[index..index + 2], 16).ok())
        .collect()
}

fn attribute_ip(name: &str, value: &str) -> Result<Ipv4Addr> {
    Ipv4Addr::from_str(value)
        .map_err(|_| Error::InvalidPacket(format!("{}: invalid IPv4 address '{}'", name, value)))
}

/// A DHCPv4 message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpMessage {
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    pub options: Vec<DhcpOption>,
}

impl Default for DhcpMessage {
    fn default() -> Self {
        Self {
            op: BOOTREQUEST,
            htype: HTYPE_ETHERNET,
            hlen: HLEN_ETHERNET,
            hops: 0,
            xid: 0,
            secs: 0,
            flags: 0,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr: [0; 16],
            options: Vec::new(),
        }
    }
}

impl DhcpMessage {
    /// Parses a DHCP message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPacket`] if the data is shorter than the fixed
    /// header, the magic cookie is wrong, or an option is truncated.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < DHCP_HEADER_SIZE {
            return Err(Error::InvalidPacket(format!(
                "Packet too short: {} bytes (minimum {})",
                data.len(),
                DHCP_HEADER_SIZE
            )));
        }
        if data[MAGIC_COOKIE_OFFSET..DHCP_HEADER_SIZE] != DHCP_MAGIC_COOKIE {
            return Err(Error::InvalidPacket("Invalid magic cookie".to_string()));
        }

        let u16_at = |offset: usize| u16::from_be_bytes([data[offset], data[offset + 1]]);
        let ip_at = |offset: usize| {
            Ipv4Addr::new(data[offset], data[offset + 1], data[offset + 2], data[offset + 3])
        };

        let mut chaddr = [0u8; 16];
        chaddr.copy_from_slice(&data[CHADDR_OFFSET..CHADDR_OFFSET + 16]);

        Ok(Self {
            op: data[0],
            htype: data[1],
            hlen: data[2],
            hops: data[3],
            xid: peek_xid(data).unwrap_or_default(),
            secs: u16_at(8),
            flags: u16_at(10),
            ciaddr: ip_at(12),
            yiaddr: ip_at(16),
            siaddr: ip_at(20),
            giaddr: ip_at(24),
            chaddr,
            options: Self::parse_options(&data[DHCP_HEADER_SIZE..])?,
        })
    }

    fn parse_options(data: &[u8]) -> Result<Vec<DhcpOption>> {
        let mut options = Vec::new();
        let mut index = 0;

        while index < data.len() {
            let code = data[index];
            if code == OptionCode::Pad as u8 {
                index += 1;
                continue;
            }
            if code == OptionCode::End as u8 {
                break;
            }

            let Some(&length) = data.get(index + 1) else {
                return Err(Error::InvalidPacket("Option length missing".to_string()));
            };
            let start = index + 2;
            let end = start + length as usize;
            let Some(option_data) = data.get(start..end) else {
                return Err(Error::InvalidPacket("Option data truncated".to_string()));
            };

            options.push(DhcpOption::parse(code, option_data)?);
            index = end;
        }

        Ok(options)
    }

    /// Encodes the message, padded to at least 300 bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(576);

        packet.extend_from_slice(&[self.op, self.htype, self.hlen, self.hops]);
        packet.extend_from_slice(&self.xid.to_be_bytes());
        packet.extend_from_slice(&self.secs.to_be_bytes());
        packet.extend_from_slice(&self.flags.to_be_bytes());
        for ip in [self.ciaddr, self.yiaddr, self.siaddr, self.giaddr] {
            packet.extend_from_slice(&ip.octets());
        }
        packet.extend_from_slice(&self.chaddr);
        packet.resize(MAGIC_COOKIE_OFFSET, 0);
        packet.extend_from_slice(&DHCP_MAGIC_COOKIE);

        for option in &self.options {
            packet.extend_from_slice(&option.encode());
        }
        packet.push(OptionCode::End as u8);

        if packet.len() < DHCP_MIN_PACKET_SIZE {
            packet.resize(DHCP_MIN_PACKET_SIZE, 0);
        }
        packet
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.options.iter().find_map(|option| match option {
            DhcpOption::MessageType(message_type) => Some(*message_type),
            _ => None,
        })
    }

    pub fn server_identifier(&self) -> Option<Ipv4Addr> {
        self.options.iter().find_map(|option| match option {
            DhcpOption::ServerIdentifier(ip) => Some(*ip),
            _ => None,
        })
    }

    pub fn mac(&self) -> String {
        let len = (self.hlen as usize).min(self.chaddr.len());
        format_mac(&self.chaddr[..len])
    }

    /// Builds a BOOTREQUEST from expanded `(attribute, value)` pairs.
    ///
    /// Attribute names are case-insensitive. A message without an explicit
    /// `message-type` is a DHCP-Discover.
    pub fn from_attributes<'a, I>(attributes: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut message = Self::default();
        let mut message_type = MessageType::Discover;

        for (name, value) in attributes {
            match name.to_ascii_lowercase().as_str() {
                "message-type" => {
                    message_type = MessageType::from_name(value).ok_or_else(|| {
                        Error::InvalidPacket(format!("unknown message type '{}'", value))
                    })?;
                }
                "client-hardware-address" => {
                    let mac = parse_mac(value).ok_or_else(|| {
                        Error::InvalidPacket(format!("{}: invalid MAC address '{}'", name, value))
                    })?;
                    message.chaddr = [0; 16];
                    message.chaddr[..6].copy_from_slice(&mac);
                }
                "client-ip-address" => message.ciaddr = attribute_ip(name, value)?,
                "gateway-ip-address" => message.giaddr = attribute_ip(name, value)?,
                "broadcast-flag" => {
                    if matches!(value, "1" | "true" | "yes") {
                        message.flags |= 0x8000;
                    }
                }
                "requested-ip-address" => message
                    .options
                    .push(DhcpOption::RequestedIpAddress(attribute_ip(name, value)?)),
                "server-identifier" => message
                    .options
                    .push(DhcpOption::ServerIdentifier(attribute_ip(name, value)?)),
                "lease-time" => {
                    let seconds = value.parse::<u32>().map_err(|_| {
                        Error::InvalidPacket(format!("{}: invalid number '{}'", name, value))
                    })?;
                    message.options.push(DhcpOption::LeaseTime(seconds));
                }
                "hostname" => message.options.push(DhcpOption::Hostname(value.to_string())),
                "client-identifier" => {
                    let bytes = parse_hex(value).ok_or_else(|| {
                        Error::InvalidPacket(format!("{}: invalid hex '{}'", name, value))
                    })?;
                    message.options.push(DhcpOption::ClientIdentifier(bytes));
                }
                "parameter-request-list" => {
                    let codes = value
                        .split(',')
                        .map(|code| code.trim().parse::<u8>())
                        .collect::<std::result::Result<Vec<_>, _>>()
                        .map_err(|_| {
                            Error::InvalidPacket(format!("{}: invalid code list '{}'", name, value))
                        })?;
                    message.options.push(DhcpOption::ParameterRequestList(codes));
                }
                other => {
                    return Err(Error::InvalidPacket(format!("unknown attribute '{}'", other)));
                }
            }
        }

        message.options.insert(0, DhcpOption::MessageType(message_type));
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_then_parse() {
        let message = DhcpMessage::from_attributes([
            ("Client-Hardware-Address", "02:00:00:00:00:01"),
            ("Requested-IP-Address", "10.0.0.5"),
            ("Hostname", "client-1"),
        ])
        .unwrap();
        let encoded = message.encode();
        assert!(encoded.len() >= 300);

        let parsed = DhcpMessage::parse(&encoded).unwrap();
        assert_eq!(parsed, message);
        assert_eq!(parsed.message_type(), Some(MessageType::Discover));
        assert_eq!(parsed.mac(), "02:00:00:00:00:01");
    }

    #[test]
    fn test_xid_lives_at_offset_four() {
        let mut encoded = DhcpMessage::default().encode();
        assert!(set_xid_in_place(&mut encoded, 0x0001_0203));
        assert_eq!(&encoded[4..8], &[0x00, 0x01, 0x02, 0x03]);
        assert_eq!(peek_xid(&encoded), Some(0x0001_0203));
        assert_eq!(DhcpMessage::parse(&encoded).unwrap().xid, 0x0001_0203);

        let mut short = [0u8; 6];
        assert!(!set_xid_in_place(&mut short, 1));
        assert_eq!(peek_xid(&short), None);
    }

    #[test]
    fn test_parse_rejects_short_and_bad_cookie() {
        assert!(DhcpMessage::parse(&[0u8; DHCP_HEADER_SIZE - 1]).is_err());

        let mut encoded = DhcpMessage::default().encode();
        encoded[MAGIC_COOKIE_OFFSET] = 0;
        assert!(DhcpMessage::parse(&encoded).is_err());
    }

    #[test]
    fn test_parse_rejects_truncated_option() {
        let mut encoded = DhcpMessage::default().encode();
        encoded.truncate(DHCP_HEADER_SIZE);
        encoded.extend_from_slice(&[12, 10, b'a']);
        assert!(DhcpMessage::parse(&encoded).is_err());
    }

    #[test]
    fn test_from_attributes_fields() {
        let message = DhcpMessage::from_attributes([
            ("message-type", "Request"),
            ("client-ip-address", "10.0.0.9"),
            ("gateway-ip-address", "10.0.0.254"),
            ("broadcast-flag", "yes"),
            ("server-identifier", "10.0.0.1"),
            ("lease-time", "600"),
            ("client-identifier", "01:02:00:00:00:00:01"),
            ("parameter-request-list", "1, 3, 6"),
        ])
        .unwrap();

        assert_eq!(message.message_type(), Some(MessageType::Request));
        assert_eq!(message.ciaddr, Ipv4Addr::new(10, 0, 0, 9));
        assert_eq!(message.giaddr, Ipv4Addr::new(10, 0, 0, 254));
        assert_eq!(message.flags, 0x8000);
        assert_eq!(message.server_identifier(), Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(message.options.contains(&DhcpOption::LeaseTime(600)));
        assert!(
            message
                .options
                .contains(&DhcpOption::ClientIdentifier(vec![1, 2, 0, 0, 0, 0, 1]))
        );
        assert!(
            message
                .options
                .contains(&DhcpOption::ParameterRequestList(vec![1, 3, 6]))
        );
    }

    #[test]
    fn test_from_attributes_rejects_bad_input() {
        assert!(DhcpMessage::from_attributes([("no-such-attribute", "1")]).is_err());
        assert!(DhcpMessage::from_attributes([("client-hardware-address", "123456")]).is_err());
        assert!(DhcpMessage::from_attributes([("requested-ip-address", "10.0.0")]).is_err());
        assert!(DhcpMessage::from_attributes([("message-type", "Bogus")]).is_err());
    }

    #[test]
    fn test_parse_mac() {
        assert_eq!(parse_mac("aa:bb:cc:dd:ee:ff"), Some([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]));
        assert_eq!(parse_mac("aa-bb-cc-dd-ee-0f"), Some([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x0f]));
        assert_eq!(parse_mac("aa:bb:cc:dd:ee"), None);
        assert_eq!(parse_mac("aa:bb:cc:dd:ee:ff:00"), None);
        assert_eq!(parse_mac("aaa:bb:cc:dd:ee:ff"), None);
        assert_eq!(parse_mac("+f:00:00:00:00:01"), None);
        assert_eq!(parse_mac("aa:bb:cc:dd:ee:+1"), None);
        assert_eq!(parse_mac("0f:00:00:00:00:01"), Some([0x0f, 0, 0, 0, 0, 0x01]));
    }
}
