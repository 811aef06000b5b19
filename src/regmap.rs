//! Classification of memory-mapped register addresses into roles.
//!
//! The map is built once from the configured data and status register
//! ranges and is read-only afterwards. Ranges are inclusive and may not
//! overlap, either across roles or within one role.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Data,
    Status,
}

impl Role {
    /// Numeric code used on the observation board.
    pub fn code(self) -> u32 {
        match self {
            Role::Data => 1,
            Role::Status => 2,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Role::Data),
            2 => Some(Role::Status),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Data => f.write_str("data"),
            Role::Status => f.write_str("status"),
        }
    }
}

/// An inclusive address range `[begin, end]` tagged with its role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegisterDescriptor {
    pub begin: u64,
    pub end: u64,
    pub role: Role,
}

impl RegisterDescriptor {
    /// Single-cell descriptor covering only `address`.
    pub fn single(address: u64, role: Role) -> Self {
        Self { begin: address, end: address, role }
    }

    pub fn range(begin: u64, end: u64, role: Role) -> Result<Self> {
        if end < begin {
            return Err(Error::InvalidRange { begin, end });
        }
        Ok(Self { begin, end, role })
    }

    pub fn contains(&self, address: u64) -> bool {
        self.begin <= address && address <= self.end
    }
}

impl fmt::Display for RegisterDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.begin == self.end {
            write!(f, "{} register {:#x}", self.role, self.begin)
        } else {
            write!(f, "{} register {:#x}-{:#x}", self.role, self.begin, self.end)
        }
    }
}

/// Address range given on the command line or in code, before a role is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    pub begin: u64,
    pub end: u64,
}

impl AddressRange {
    pub fn single(address: u64) -> Self {
        Self { begin: address, end: address }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RegisterMap {
    // keyed by range start; ranges are disjoint so the predecessor lookup is exact
    ranges: BTreeMap<u64, RegisterDescriptor>,
}

impl RegisterMap {
    /// Build the map from data and status register ranges.
    ///
    /// Fails with [`Error::DuplicateAddress`] when any address is covered by
    /// more than one range and with [`Error::InvalidRange`] for a reversed range.
    pub fn new(data: &[AddressRange], status: &[AddressRange]) -> Result<Self> {
        let mut descriptors = Vec::with_capacity(data.len() + status.len());
        for r in data {
            descriptors.push(RegisterDescriptor::range(r.begin, r.end, Role::Data)?);
        }
        for r in status {
            descriptors.push(RegisterDescriptor::range(r.begin, r.end, Role::Status)?);
        }
        Self::from_descriptors(descriptors)
    }

    pub fn from_descriptors(descriptors: impl IntoIterator<Item = RegisterDescriptor>) -> Result<Self> {
        let mut sorted: Vec<RegisterDescriptor> = descriptors.into_iter().collect();
        sorted.sort_by_key(|d| (d.begin, d.end));

        let mut ranges = BTreeMap::new();
        let mut prev: Option<RegisterDescriptor> = None;
        for desc in sorted {
            if desc.end < desc.begin {
                return Err(Error::InvalidRange { begin: desc.begin, end: desc.end });
            }
            if let Some(p) = prev && desc.begin <= p.end {
                return Err(Error::DuplicateAddress { address: desc.begin });
            }
            ranges.insert(desc.begin, desc);
            prev = Some(desc);
        }

        Ok(Self { ranges })
    }

    pub fn classify(&self, address: u64) -> Option<Role> {
        self.descriptor_for(address).map(|d| d.role)
    }

    pub fn descriptor_for(&self, address: u64) -> Option<&RegisterDescriptor> {
        self.ranges
            .range(..=address)
            .next_back()
            .map(|(_, d)| d)
            .filter(|d| d.contains(address))
    }

    /// Descriptors in ascending address order.
    pub fn descriptors(&self) -> impl Iterator<Item = &RegisterDescriptor> {
        self.ranges.values()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn count(&self, role: Role) -> usize {
        self.ranges.values().filter(|d| d.role == role).count()
    }
}
