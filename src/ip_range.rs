//! Address range arithmetic
//!
//! Ranges are inclusive `[start, end]` pairs over `u128`, which holds both
//! IPv4 and IPv6 addresses. Excluding a set of sub-ranges is exact and
//! order-sensitive: each exclusion is subtracted from the result of the
//! previous one.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::{Error, Result};

/// Inclusive address range
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddrRange {
    /// First address in the range
    pub start: u128,
    /// Last address in the range
    pub end: u128,
}

impl AddrRange {
    /// Build a range; `None` when `start > end`
    pub fn new(start: u128, end: u128) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }
}

/// Where a point falls relative to a range
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Position {
    BeforeStart,
    AtStart,
    Between,
    AtEnd,
    AfterEnd,
}

fn position(point: u128, range: &AddrRange) -> Position {
    if point < range.start {
        Position::BeforeStart
    } else if point == range.start {
        Position::AtStart
    } else if point < range.end {
        Position::Between
    } else if point == range.end {
        Position::AtEnd
    } else {
        Position::AfterEnd
    }
}

fn subtract_one(range: &AddrRange, except: &AddrRange) -> Vec<AddrRange> {
    use Position::*;

    let head = |end: Option<u128>| end.and_then(|end| AddrRange::new(range.start, end));
    let tail = |start: Option<u128>| start.and_then(|start| AddrRange::new(start, range.end));
    let before = except.start.checked_sub(1);
    let after = except.end.checked_add(1);

    let pieces = match (position(except.start, range), position(except.end, range)) {
        (_, BeforeStart) | (AfterEnd, _) => vec![Some(*range)],
        (BeforeStart | AtStart, AtEnd | AfterEnd) => vec![],
        (BeforeStart | AtStart, AtStart | Between) => vec![tail(after)],
        (Between | AtEnd, AtEnd | AfterEnd) => vec![head(before)],
        (Between, Between) => vec![head(before), tail(after)],
        // start > end on the except range; nothing to remove
        _ => vec![Some(*range)],
    };

    pieces.into_iter().flatten().collect()
}

/// Remove `except` from every range in `ranges`.
///
/// Each input range yields zero, one or two sub-ranges. Degenerate results are
/// dropped.
pub fn subtract(ranges: &[AddrRange], except: &AddrRange) -> Vec<AddrRange> {
    ranges
        .iter()
        .flat_map(|range| subtract_one(range, except))
        .collect()
}

/// Remove every range in `excepts` from `range`, one exclusion at a time
pub fn exclude(range: AddrRange, excepts: &[AddrRange]) -> Vec<AddrRange> {
    excepts
        .iter()
        .fold(vec![range], |current, except| subtract(&current, except))
}

/// Address family of a parsed block
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Family {
    /// 32-bit addresses
    V4,
    /// 128-bit addresses
    V6,
}

impl Family {
    fn bits(self) -> u32 {
        match self {
            Family::V4 => 32,
            Family::V6 => 128,
        }
    }

    /// Render a numeric address in this family
    pub fn addr(self, value: u128) -> IpAddr {
        match self {
            Family::V4 => IpAddr::V4(Ipv4Addr::from(value as u32)),
            Family::V6 => IpAddr::V6(Ipv6Addr::from(value)),
        }
    }
}

/// A CIDR block expressed as a range in its family
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Block {
    /// Address family
    pub family: Family,
    /// Covered addresses
    pub range: AddrRange,
}

impl Block {
    /// Parse `a.b.c.d/n`, `x::y/n`, or a bare address (host block)
    pub fn parse(cidr: &str) -> Result<Self> {
        let (addr, prefix) = match cidr.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (cidr, None),
        };
        let addr: IpAddr = addr
            .trim()
            .parse()
            .map_err(|e| Error::validation(format!("invalid address in {cidr:?}: {e}")))?;

        let (family, value) = match addr {
            IpAddr::V4(v4) => (Family::V4, u128::from(u32::from(v4))),
            IpAddr::V6(v6) => (Family::V6, u128::from(v6)),
        };

        let bits = family.bits();
        let prefix = match prefix {
            Some(p) => p
                .trim()
                .parse::<u32>()
                .ok()
                .filter(|p| *p <= bits)
                .ok_or_else(|| Error::validation(format!("invalid prefix length in {cidr:?}")))?,
            None => bits,
        };

        let host_bits = bits - prefix;
        let host_mask = if host_bits == 0 {
            0
        } else if host_bits == 128 {
            u128::MAX
        } else {
            (1u128 << host_bits) - 1
        };
        let start = value & !host_mask;
        Ok(Self {
            family,
            range: AddrRange {
                start,
                end: start | host_mask,
            },
        })
    }

    /// The block minus every `except` block, as printable ranges.
    ///
    /// Excepts of the other family, or outside the block, have no effect.
    pub fn without(&self, excepts: &[Block]) -> Vec<FormattedRange> {
        let same_family: Vec<AddrRange> = excepts
            .iter()
            .filter(|b| b.family == self.family)
            .map(|b| b.range)
            .collect();
        exclude(self.range, &same_family)
            .into_iter()
            .map(|range| FormattedRange {
                family: self.family,
                range,
            })
            .collect()
    }
}

/// Range with its family, for rendering as `a-b` (or `a` for a single address)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FormattedRange {
    /// Address family
    pub family: Family,
    /// Addresses covered
    pub range: AddrRange,
}

impl fmt::Display for FormattedRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.range.start == self.range.end {
            write!(f, "{}", self.family.addr(self.range.start))
        } else {
            write!(
                f,
                "{}-{}",
                self.family.addr(self.range.start),
                self.family.addr(self.range.end)
            )
        }
    }
}
