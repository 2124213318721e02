use std::{collections::BTreeSet, fmt, ops::RangeInclusive, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::{AllocationError, StrategyError};

pub const MIN_PORT: u16 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortRange {
    pub low: u16,
    pub high: u16,
}

impl PortRange {
    pub fn new(low: u16, high: u16) -> Result<Self, StrategyError> {
        if low > high {
            return Err(StrategyError::InvertedRange { low, high });
        }
        if low < MIN_PORT {
            return Err(StrategyError::PortBelowMinimum(low));
        }
        Ok(Self { low, high })
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.low..=self.high).contains(&port)
    }

    pub fn len(&self) -> usize {
        if self.low > self.high {
            return 0;
        }
        usize::from(self.high - self.low) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn iter(&self) -> RangeInclusive<u16> {
        self.low..=self.high
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            low: 8100,
            high: 8199,
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.low, self.high)
    }
}

// `low-high`, e.g. `8100-8199`.
impl FromStr for PortRange {
    type Err = StrategyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (low, high) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| StrategyError::Unparsable(s.to_string()))?;
        let parse = |v: &str| {
            v.trim()
                .parse::<u16>()
                .map_err(|_| StrategyError::Unparsable(s.to_string()))
        };
        Self::new(parse(low)?, parse(high)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PortStrategy {
    Dedicated { port: u16 },
    Range { low: u16, high: u16 },
    List { ports: Vec<u16> },
    /// `start, start + step, ..., start + step * (count - 1)`.
    Stepped { start: u16, step: u16, count: u16 },
    #[default]
    Any,
}

impl PortStrategy {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Dedicated { .. } => "dedicated",
            Self::Range { .. } => "range",
            Self::List { .. } => "list",
            Self::Stepped { .. } => "stepped",
            Self::Any => "any",
        }
    }

    pub fn validate(&self) -> Result<(), StrategyError> {
        match self {
            Self::Dedicated { port } => check_min(*port),
            Self::Range { low, high } => PortRange::new(*low, *high).map(|_| ()),
            Self::List { ports } => {
                if ports.is_empty() {
                    return Err(StrategyError::EmptyList);
                }
                let mut seen = BTreeSet::new();
                for &port in ports {
                    check_min(port)?;
                    if !seen.insert(port) {
                        return Err(StrategyError::DuplicatePort(port));
                    }
                }
                Ok(())
            }
            Self::Stepped { start, step, count } => {
                check_min(*start)?;
                if *step == 0 {
                    return Err(StrategyError::ZeroStep);
                }
                if *count == 0 {
                    return Err(StrategyError::ZeroCount);
                }
                let last = u32::from(*start) + u32::from(*step) * (u32::from(*count) - 1);
                if last > u32::from(u16::MAX) {
                    return Err(StrategyError::SteppedOverflow {
                        start: *start,
                        step: *step,
                        count: *count,
                    });
                }
                Ok(())
            }
            Self::Any => Ok(()),
        }
    }

    /// Valid ports in allocation order.
    pub fn candidates(&self, any: PortRange) -> Candidates<'_> {
        match self {
            Self::Dedicated { port } => Candidates::Single(Some(*port)),
            Self::Range { low, high } => Candidates::Range(*low..=*high),
            Self::List { ports } => Candidates::List(ports.iter()),
            Self::Stepped { start, step, count } => Candidates::Stepped {
                next: u32::from(*start),
                step: u32::from(*step),
                remaining: *count,
            },
            Self::Any => Candidates::Range(any.iter()),
        }
    }

    pub fn contains(&self, port: u16, any: PortRange) -> bool {
        match self {
            Self::Dedicated { port: p } => *p == port,
            Self::Range { low, high } => (*low..=*high).contains(&port),
            Self::List { ports } => ports.contains(&port),
            Self::Stepped { start, step, count } => {
                if port < *start {
                    return false;
                }
                let offset = port - *start;
                if *step == 0 {
                    return offset == 0 && *count > 0;
                }
                offset % *step == 0 && offset / *step < *count
            }
            Self::Any => any.contains(port),
        }
    }

    pub fn valid_ports(&self, any: PortRange) -> Vec<u16> {
        self.candidates(any).collect()
    }

    pub fn capacity(&self, any: PortRange) -> usize {
        match self {
            Self::Dedicated { .. } => 1,
            Self::Range { low, high } => PortRange {
                low: *low,
                high: *high,
            }
            .len(),
            Self::List { ports } => ports.len(),
            Self::Stepped { .. } => self.candidates(any).count(),
            Self::Any => any.len(),
        }
    }
}

fn check_min(port: u16) -> Result<(), StrategyError> {
    if port < MIN_PORT {
        return Err(StrategyError::PortBelowMinimum(port));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub enum Candidates<'a> {
    Single(Option<u16>),
    Range(RangeInclusive<u16>),
    List(std::slice::Iter<'a, u16>),
    Stepped { next: u32, step: u32, remaining: u16 },
}

impl Iterator for Candidates<'_> {
    type Item = u16;

    fn next(&mut self) -> Option<u16> {
        match self {
            Self::Single(port) => port.take(),
            Self::Range(range) => range.next(),
            Self::List(iter) => iter.next().copied(),
            Self::Stepped {
                next,
                step,
                remaining,
            } => {
                if *remaining == 0 {
                    return None;
                }
                // Unvalidated descriptors (e.g. restored from disk) may run past u16.
                let port = u16::try_from(*next).ok()?;
                *remaining -= 1;
                *next = next.saturating_add(*step);
                Some(port)
            }
        }
    }
}

/// First unoccupied candidate in natural order, or exactly `requested` if it is valid
/// and free.
pub fn allocate(
    strategy: &PortStrategy,
    any: PortRange,
    occupied: &BTreeSet<u16>,
    requested: Option<u16>,
) -> Result<u16, AllocationError> {
    if let Some(port) = requested {
        if strategy.contains(port, any) && !occupied.contains(&port) {
            return Ok(port);
        }
        return Err(AllocationError::PortUnavailable(port));
    }

    strategy
        .candidates(any)
        .find(|port| !occupied.contains(port))
        .ok_or(AllocationError::StrategyExhausted)
}
