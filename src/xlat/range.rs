//! Range arguments for the built-in generators: `[<lo>][-[<hi>]]`.
//!
//! The text before the first `-` is the lower bound and the text after it
//! the upper bound; an empty or missing side falls back to the generator's
//! default. A lower bound above the upper bound is rejected.

use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::packet::parse_mac;

/// Largest 48-bit value, i.e. `ff:ff:ff:ff:ff:ff`.
pub const ETHADDR_MAX: u64 = (1 << 48) - 1;

fn non_empty(s: &str) -> Option<&str> {
    (!s.is_empty()).then_some(s)
}

fn split_range(input: &str) -> (Option<&str>, Option<&str>) {
    match input.split_once('-') {
        Some((lo, hi)) => (non_empty(lo), non_empty(hi)),
        None => (non_empty(input), None),
    }
}

fn parse_bounds<T, F>(input: &str, defaults: (T, T), what: &str, parse: F) -> Result<(T, T)>
where
    T: PartialOrd + std::fmt::Display + Copy,
    F: Fn(&str) -> Option<T>,
{
    let (lo, hi) = split_range(input);

    let min = match lo {
        Some(text) => parse(text).ok_or_else(|| {
            Error::BadRange(format!("Invalid first {}, in: [{}]", what, input))
        })?,
        None => defaults.0,
    };
    let max = match hi {
        Some(text) => parse(text).ok_or_else(|| {
            Error::BadRange(format!("Invalid second {}, in: [{}]", what, input))
        })?,
        None => defaults.1,
    };

    if min > max {
        return Err(Error::BadRange(format!(
            "Not a valid {} range ({} > {})",
            what, min, max
        )));
    }
    Ok((min, max))
}

/// Parses a `u64` range. Defaults to `0-18446744073709551615`.
pub fn parse_num_range(input: &str) -> Result<(u64, u64)> {
    parse_bounds(input, (0, u64::MAX), "number", |text| text.parse().ok())
}

/// Parses an IPv4 range in host order. Defaults to `0.0.0.1-255.255.255.254`.
pub fn parse_ipaddr_range(input: &str) -> Result<(u32, u32)> {
    let defaults = (u32::from(Ipv4Addr::new(0, 0, 0, 1)), u32::from(Ipv4Addr::new(255, 255, 255, 254)));
    parse_bounds(input, defaults, "ipaddr", |text| {
        Ipv4Addr::from_str(text).ok().map(u32::from)
    })
}

/// Parses an Ethernet address range as 48-bit integers.
/// Defaults to `00:00:00:00:00:01-ff:ff:ff:ff:ff:fe`.
///
/// Bare integers are rejected: only `xx:xx:xx:xx:xx:xx` is accepted.
pub fn parse_ethaddr_range(input: &str) -> Result<(u64, u64)> {
    parse_bounds(input, (1, ETHADDR_MAX - 1), "ethaddr", |text| {
        if text.bytes().all(|byte| byte.is_ascii_digit()) {
            return None;
        }
        parse_mac(text).map(|mac| mac_to_u64(&mac))
    })
}

pub fn mac_to_u64(mac: &[u8; 6]) -> u64 {
    mac.iter().fold(0, |acc, byte| (acc << 8) | u64::from(*byte))
}

pub fn u64_to_mac(value: u64) -> [u8; 6] {
    let bytes = value.to_be_bytes();
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&bytes[2..8]);
    mac
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_num_range_forms() {
        assert_eq!(parse_num_range("10-12").unwrap(), (10, 12));
        assert_eq!(parse_num_range("10").unwrap(), (10, u64::MAX));
        assert_eq!(parse_num_range("10-").unwrap(), (10, u64::MAX));
        assert_eq!(parse_num_range("-12").unwrap(), (0, 12));
        assert_eq!(parse_num_range("").unwrap(), (0, u64::MAX));
        assert_eq!(parse_num_range("-").unwrap(), (0, u64::MAX));
        assert_eq!(parse_num_range("7-7").unwrap(), (7, 7));
    }

    #[test]
    fn test_num_range_errors() {
        assert!(matches!(parse_num_range("12-10"), Err(Error::BadRange(_))));
        assert!(matches!(parse_num_range("abc"), Err(Error::BadRange(_))));
        assert!(matches!(parse_num_range("1-x"), Err(Error::BadRange(_))));
        assert!(matches!(parse_num_range("18446744073709551616"), Err(Error::BadRange(_))));
    }

    #[test]
    fn test_ipaddr_range_forms() {
        let (min, max) = parse_ipaddr_range("10.0.0.1-10.0.0.10").unwrap();
        assert_eq!(Ipv4Addr::from(min), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(Ipv4Addr::from(max), Ipv4Addr::new(10, 0, 0, 10));

        let (min, max) = parse_ipaddr_range("").unwrap();
        assert_eq!(Ipv4Addr::from(min), Ipv4Addr::new(0, 0, 0, 1));
        assert_eq!(Ipv4Addr::from(max), Ipv4Addr::new(255, 255, 255, 254));

        assert!(parse_ipaddr_range("10.0.0.10-10.0.0.1").is_err());
        assert!(parse_ipaddr_range("10.0.0-10.0.0.1").is_err());
    }

    #[test]
    fn test_ethaddr_range_forms() {
        let (min, max) = parse_ethaddr_range("02:00:00:00:00:01-02:00:00:00:01:00").unwrap();
        assert_eq!(min, 0x0200_0000_0001);
        assert_eq!(max, 0x0200_0000_0100);

        assert_eq!(parse_ethaddr_range("").unwrap(), (1, 0xffff_ffff_fffe));
        assert!(parse_ethaddr_range("02:00:00:00:00:02-02:00:00:00:00:01").is_err());
    }

    #[test]
    fn test_ethaddr_rejects_bare_integers() {
        assert!(matches!(parse_ethaddr_range("12345"), Err(Error::BadRange(_))));
        assert!(matches!(
            parse_ethaddr_range("02:00:00:00:00:01-99"),
            Err(Error::BadRange(_))
        ));
        assert!(matches!(
            parse_ethaddr_range("+2:00:00:00:00:01-02:00:00:00:00:09"),
            Err(Error::BadRange(_))
        ));
    }

    #[test]
    fn test_mac_integer_conversion() {
        let mac = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06];
        assert_eq!(mac_to_u64(&mac), 0x0102_0304_0506);
        assert_eq!(u64_to_mac(0x0102_0304_0506), mac);
        assert_eq!(u64_to_mac(ETHADDR_MAX), [0xff; 6]);
    }
}
