//! Stack depot handle decoding
//!
//! A depot handle is a 32-bit `union handle_parts`: a pool (slab) index, an
//! offset in `DEPOT_STACK_ALIGN` units and, on most kernels, a valid bit.
//! The record it names holds a `size` and an `entries[]` array of return
//! addresses.

use serde::Serialize;

use crate::domain::{DepotHandle, ModelError};
use crate::memory::{FieldLayout, Reader};
use crate::symbolization::{Resolution, SymbolResolver};

/// Records are aligned to `1 << DEPOT_STACK_ALIGN` bytes
const DEPOT_STACK_ALIGN: u32 = 4;

/// `STACK_ALLOC_ORDER`: pools are 4 pages
const STACK_ALLOC_ORDER: u32 = 2;

/// Refuse records claiming more frames than this
const MAX_FRAMES: u64 = 256;

/// Bit placement of one handle field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BitRange {
    shift: u32,
    bits: u32,
}

impl BitRange {
    fn from_layout(field: &FieldLayout) -> Option<Self> {
        Some(Self { shift: field.bit_offset?, bits: field.bit_size? })
    }

    fn extract(self, value: u32) -> u32 {
        let mask = if self.bits >= 32 { u32::MAX } else { (1u32 << self.bits) - 1 };
        (value >> self.shift) & mask
    }
}

/// How handles split into fields on this kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleGeometry {
    index: BitRange,
    offset: BitRange,
    valid: Option<BitRange>,
    /// Newer kernels store `pool_index + 1` so that 0 is never a valid handle
    index_plus_one: bool,
}

impl HandleGeometry {
    /// Default x86-64 geometry: `slabindex | offset << index_bits | valid`
    #[must_use]
    pub fn default_for(page_shift: u32) -> Self {
        let offset_bits = STACK_ALLOC_ORDER + page_shift - DEPOT_STACK_ALIGN;
        let index_bits = 32 - offset_bits - 1;
        Self {
            index: BitRange { shift: 0, bits: index_bits },
            offset: BitRange { shift: index_bits, bits: offset_bits },
            valid: Some(BitRange { shift: index_bits + offset_bits, bits: 1 }),
            index_plus_one: false,
        }
    }

    fn from_layout(reader: &Reader<'_>) -> Option<Self> {
        const H: &str = "union handle_parts";
        let (name, index) = reader.member_variant(H, &["pool_index_plus_1", "pool_index", "slabindex"]).ok()?;
        let offset = reader.member(H, "offset").ok()?;
        Some(Self {
            index: BitRange::from_layout(&index)?,
            offset: BitRange::from_layout(&offset)?,
            valid: reader.member(H, "valid").ok().and_then(|f| BitRange::from_layout(&f)),
            index_plus_one: name == "pool_index_plus_1",
        })
    }

    /// Split a handle into `(pool index, byte offset)`
    ///
    /// `None` for handles that are structurally invalid.
    #[must_use]
    pub fn decode(&self, handle: DepotHandle) -> Option<(u32, u64)> {
        if !handle.is_valid() {
            return None;
        }
        if let Some(valid) = self.valid {
            if valid.extract(handle.0) == 0 {
                return None;
            }
        }
        let mut index = self.index.extract(handle.0);
        if self.index_plus_one {
            index = index.checked_sub(1)?;
        }
        let offset = u64::from(self.offset.extract(handle.0)) << DEPOT_STACK_ALIGN;
        Some((index, offset))
    }
}

/// Decoder bound to one kernel's depot layout
#[derive(Debug, Clone)]
pub struct StackDepot {
    geometry: HandleGeometry,
    pools: u64,
    size: FieldLayout,
    entries: u64,
}

impl StackDepot {
    /// Resolve the depot layout once
    ///
    /// # Errors
    /// Returns `NotFound` if the kernel has no stack depot, or a lookup
    /// error if `struct stack_record` is not described
    pub fn resolve(reader: &Reader<'_>) -> Result<Self, ModelError> {
        let (_, pools) = reader
            .symbol_variant(&["stack_pools", "stack_slabs"])
            .map_err(|_| ModelError::NotFound("stack depot".to_string()))?;

        let geometry = HandleGeometry::from_layout(reader).unwrap_or_else(|| {
            log::info!("No union handle_parts layout, using default handle geometry");
            HandleGeometry::default_for(reader.arch().page_shift)
        });

        Ok(Self {
            geometry,
            pools,
            size: reader.member("struct stack_record", "size")?,
            entries: reader.offset_of("struct stack_record", "entries")?,
        })
    }

    #[must_use]
    pub fn geometry(&self) -> HandleGeometry {
        self.geometry
    }

    /// Read the record a handle names
    ///
    /// # Errors
    /// Returns `NotFound` for invalid handles or empty pools, `Corruption`
    /// for implausible records, or an access error
    pub fn record(&self, reader: &Reader<'_>, handle: DepotHandle) -> Result<StackRecord, ModelError> {
        let (index, offset) = self
            .geometry
            .decode(handle)
            .ok_or_else(|| ModelError::NotFound(format!("stack depot {handle}")))?;

        let pool = reader.read_ptr(self.pools + u64::from(index) * reader.pointer_size())?;
        if pool == 0 {
            return Err(ModelError::NotFound(format!("stack depot pool {index} for {handle}")));
        }

        let addr = pool + offset;
        let count = reader.read_uint(addr + self.size.offset, self.size.size)?;
        if count > MAX_FRAMES {
            return Err(ModelError::corruption("stack_record", addr, format!("{count} entries")));
        }

        let ptr = reader.pointer_size();
        let entries = (0..count)
            .map(|i| reader.read_ptr(addr + self.entries + i * ptr))
            .collect::<Result<Vec<_>, _>>()?;

        log::debug!("{handle}: record at {addr:#x} with {count} frames");
        Ok(StackRecord { handle, addr, entries })
    }
}

/// A decoded stack depot record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackRecord {
    pub handle: DepotHandle,
    pub addr: u64,
    pub entries: Vec<u64>,
}

impl StackRecord {
    /// Symbolize the entries, innermost frame first
    ///
    /// The returned iterator consumes the record: it runs once, in order, and
    /// ends after the last entry.
    #[must_use]
    pub fn frames<'a>(self, resolver: &'a SymbolResolver, reader: &'a Reader<'a>) -> StackFrames<'a> {
        StackFrames { entries: self.entries.into_iter(), resolver, reader }
    }
}

/// One symbolized return address
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackFrame {
    pub address: u64,
    pub symbol: Resolution,
}

pub struct StackFrames<'a> {
    entries: std::vec::IntoIter<u64>,
    resolver: &'a SymbolResolver,
    reader: &'a Reader<'a>,
}

impl Iterator for StackFrames<'_> {
    type Item = StackFrame;

    fn next(&mut self) -> Option<StackFrame> {
        let address = self.entries.next()?;
        Some(StackFrame { address, symbol: self.resolver.resolve(self.reader, address) })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.entries.size_hint()
    }
}

impl ExactSizeIterator for StackFrames<'_> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_geometry() {
        let g = HandleGeometry::default_for(12);
        // index 3, offset 0x20 units, valid
        let raw = 3 | (0x20 << 21) | (1 << 31);
        assert_eq!(g.decode(DepotHandle(raw)), Some((3, 0x200)));
        assert_eq!(g.decode(DepotHandle(raw & !(1 << 31))), None);
        assert_eq!(g.decode(DepotHandle(0)), None);
    }

    #[test]
    fn test_index_plus_one() {
        let g = HandleGeometry {
            index: BitRange { shift: 0, bits: 16 },
            offset: BitRange { shift: 16, bits: 10 },
            valid: None,
            index_plus_one: true,
        };
        assert_eq!(g.decode(DepotHandle(1 | (2 << 16))), Some((0, 32)));
        // index field 0 means "no pool"
        assert_eq!(g.decode(DepotHandle(2 << 16)), None);
    }
}
