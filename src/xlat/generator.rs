//! Generator state and the built-in generators.

use std::fmt;
use std::net::Ipv4Addr;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use crate::error::Result;
use crate::packet::format_mac;
use crate::xlat::range::{parse_ethaddr_range, parse_ipaddr_range, parse_num_range, u64_to_mac};

pub const NUM_RANGE: &str = "num.range";
pub const IPADDR_RANGE: &str = "ipaddr.range";
pub const IPADDR_RAND: &str = "ipaddr.rand";
pub const ETHADDR_RANGE: &str = "ethaddr.range";
pub const ETHADDR_RAND: &str = "ethaddr.rand";

/// Seedable random source shared by every generator of an expander.
///
/// Draws are mapped into `[lo, hi]` as `lo + draw mod (hi - lo + 1)`.
#[derive(Debug, Clone)]
pub struct XlatRng {
    inner: StdRng,
}

impl XlatRng {
    pub fn from_seed(seed: u64) -> Self {
        Self {
            inner: StdRng::seed_from_u64(seed),
        }
    }

    pub fn from_entropy() -> Self {
        Self {
            inner: StdRng::from_entropy(),
        }
    }

    pub fn next_u32(&mut self) -> u32 {
        self.inner.next_u32()
    }

    pub fn next_u64(&mut self) -> u64 {
        self.inner.next_u64()
    }

    pub fn u32_in(&mut self, lo: u32, hi: u32) -> u32 {
        let draw = self.next_u32();
        match (hi - lo).checked_add(1) {
            Some(span) => lo + draw % span,
            None => draw,
        }
    }

    pub fn u64_in(&mut self, lo: u64, hi: u64) -> u64 {
        let draw = self.next_u64();
        match (hi - lo).checked_add(1) {
            Some(span) => lo + draw % span,
            None => draw,
        }
    }
}

/// A user-supplied generator registered by name.
pub trait Generator: Send {
    fn emit(&mut self, rng: &mut XlatRng) -> Result<String>;
}

impl<F> Generator for F
where
    F: FnMut(&mut XlatRng) -> Result<String> + Send,
{
    fn emit(&mut self, rng: &mut XlatRng) -> Result<String> {
        self(rng)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorKind {
    NumRange,
    IpAddrRange,
    IpAddrRand,
    EthAddrRange,
    EthAddrRand,
    Custom,
}

/// Parsed arguments and progress of one template occurrence.
pub enum GeneratorState {
    NumRange { min: u64, max: u64, next: u64 },
    IpAddrRange { min: u32, max: u32, next: u32 },
    IpAddrRand { min: u32, max: u32 },
    EthAddrRange { min: u64, max: u64, next: u64 },
    EthAddrRand { min: u64, max: u64 },
    Custom(Box<dyn Generator>),
}

impl fmt::Debug for GeneratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NumRange { min, max, next } => f
                .debug_struct("NumRange")
                .field("min", min)
                .field("max", max)
                .field("next", next)
                .finish(),
            Self::IpAddrRange { min, max, next } => f
                .debug_struct("IpAddrRange")
                .field("min", &Ipv4Addr::from(*min))
                .field("max", &Ipv4Addr::from(*max))
                .field("next", &Ipv4Addr::from(*next))
                .finish(),
            Self::IpAddrRand { min, max } => f
                .debug_struct("IpAddrRand")
                .field("min", &Ipv4Addr::from(*min))
                .field("max", &Ipv4Addr::from(*max))
                .finish(),
            Self::EthAddrRange { min, max, next } => f
                .debug_struct("EthAddrRange")
                .field("min", &format_mac(&u64_to_mac(*min)))
                .field("max", &format_mac(&u64_to_mac(*max)))
                .field("next", &format_mac(&u64_to_mac(*next)))
                .finish(),
            Self::EthAddrRand { min, max } => f
                .debug_struct("EthAddrRand")
                .field("min", &format_mac(&u64_to_mac(*min)))
                .field("max", &format_mac(&u64_to_mac(*max)))
                .finish(),
            Self::Custom(_) => f.write_str("Custom"),
        }
    }
}

impl GeneratorState {
    pub fn custom(generator: impl Generator + 'static) -> Self {
        Self::Custom(Box::new(generator))
    }

    pub fn kind(&self) -> GeneratorKind {
        match self {
            Self::NumRange { .. } => GeneratorKind::NumRange,
            Self::IpAddrRange { .. } => GeneratorKind::IpAddrRange,
            Self::IpAddrRand { .. } => GeneratorKind::IpAddrRand,
            Self::EthAddrRange { .. } => GeneratorKind::EthAddrRange,
            Self::EthAddrRand { .. } => GeneratorKind::EthAddrRand,
            Self::Custom(_) => GeneratorKind::Custom,
        }
    }

    /// Produces the next value. Ranges wrap back to `min` after `max`.
    pub fn emit(&mut self, rng: &mut XlatRng) -> Result<String> {
        let value = match self {
            Self::NumRange { min, max, next } => {
                let value = next.to_string();
                *next = if *next == *max { *min } else { *next + 1 };
                value
            }
            Self::IpAddrRange { min, max, next } => {
                let value = Ipv4Addr::from(*next).to_string();
                *next = if *next == *max { *min } else { *next + 1 };
                value
            }
            Self::IpAddrRand { min, max } => Ipv4Addr::from(rng.u32_in(*min, *max)).to_string(),
            Self::EthAddrRange { min, max, next } => {
                let value = format_mac(&u64_to_mac(*next));
                *next = if *next == *max { *min } else { *next + 1 };
                value
            }
            Self::EthAddrRand { min, max } => format_mac(&u64_to_mac(rng.u64_in(*min, *max))),
            Self::Custom(generator) => generator.emit(rng)?,
        };
        Ok(value)
    }
}

/// `%{num.range:<lo>-<hi>}`: 10, 11, 12, 10, ...
pub fn num_range(arg: &str) -> Result<GeneratorState> {
    let (min, max) = parse_num_range(arg)?;
    Ok(GeneratorState::NumRange { min, max, next: min })
}

/// `%{ipaddr.range:10.0.0.1-10.0.0.255}`: 10.0.0.1, 10.0.0.2, ...
pub fn ipaddr_range(arg: &str) -> Result<GeneratorState> {
    let (min, max) = parse_ipaddr_range(arg)?;
    Ok(GeneratorState::IpAddrRange { min, max, next: min })
}

/// `%{ipaddr.rand:10.0.0.1-10.0.0.255}`: uniform within the range.
pub fn ipaddr_rand(arg: &str) -> Result<GeneratorState> {
    let (min, max) = parse_ipaddr_range(arg)?;
    Ok(GeneratorState::IpAddrRand { min, max })
}

/// `%{ethaddr.range:02:00:00:00:00:01-02:00:00:00:00:ff}`
pub fn ethaddr_range(arg: &str) -> Result<GeneratorState> {
    let (min, max) = parse_ethaddr_range(arg)?;
    Ok(GeneratorState::EthAddrRange { min, max, next: min })
}

pub fn ethaddr_rand(arg: &str) -> Result<GeneratorState> {
    let (min, max) = parse_ethaddr_range(arg)?;
    Ok(GeneratorState::EthAddrRand { min, max })
}
