//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers prevent common bugs like passing a node id where a
//! zone id is expected, and make function signatures more expressive.

use serde::Serialize;
use std::fmt;

/// Physical page frame number
///
/// A linear index over physical memory in page-size units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Pfn(pub u64);

impl fmt::Display for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pfn:{:#x}", self.0)
    }
}

/// NUMA node id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}", self.0)
    }
}

/// Zone index within a node (`ZONE_DMA`, `ZONE_NORMAL`, ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ZoneId(pub u32);

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "zone{}", self.0)
    }
}

/// CPU id
///
/// Represents a possible CPU (0, 1, 2, ...) as numbered by the target kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct CpuId(pub u32);

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

/// Compact stack depot handle as stored by the allocator
///
/// Zero is the kernel's "no stack recorded" value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct DepotHandle(pub u32);

impl DepotHandle {
    /// Returns true if the handle can refer to a record
    #[must_use]
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for DepotHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle:{:#010x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_formats() {
        assert_eq!(Pfn(0x1f).to_string(), "pfn:0x1f");
        assert_eq!(NodeId(1).to_string(), "node1");
        assert_eq!(ZoneId(2).to_string(), "zone2");
        assert_eq!(CpuId(3).to_string(), "cpu3");
        assert_eq!(DepotHandle(0x10).to_string(), "handle:0x00000010");
    }

    #[test]
    fn test_depot_handle_validity() {
        assert!(!DepotHandle(0).is_valid());
        assert!(DepotHandle(1).is_valid());
    }
}
