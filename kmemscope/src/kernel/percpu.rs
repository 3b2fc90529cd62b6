//! Per-CPU variable addressing
//!
//! A per-CPU address (static `DEFINE_PER_CPU` symbol or dynamic `__percpu`
//! pointer) becomes a concrete address by adding `__per_cpu_offset[cpu]`.

use crate::domain::{CpuId, Finding};
use crate::kernel::bitmap::{for_each_set_bit, read_bitmap};
use crate::memory::Reader;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerCpu {
    /// Possible CPUs with their offsets, ascending
    offsets: Vec<(CpuId, u64)>,
}

impl PerCpu {
    /// Uniprocessor kernel: one CPU, per-CPU data at its link address
    #[must_use]
    pub fn single() -> Self {
        Self { offsets: vec![(CpuId(0), 0)] }
    }

    #[must_use]
    pub fn from_offsets(offsets: Vec<(CpuId, u64)>) -> Self {
        Self { offsets }
    }

    /// Discover possible CPUs and their offsets
    ///
    /// Missing `nr_cpu_ids` or possible-mask symbols degrade to "every CPU
    /// below the limit" and are recorded in `notes`.
    pub fn discover(reader: &Reader<'_>, notes: &mut Vec<Finding>) -> Self {
        let Ok(offset_table) = reader.symbol("__per_cpu_offset") else {
            log::info!("No __per_cpu_offset, assuming a uniprocessor kernel");
            return Self::single();
        };

        let nr_cpus = match reader.symbol("nr_cpu_ids").and_then(|addr| reader.read_u32(addr)) {
            Ok(n) if n > 0 => n,
            _ => {
                let fallback = reader
                    .constant("NR_CPUS")
                    .and_then(|n| u32::try_from(n).ok())
                    .unwrap_or(1);
                notes.push(Finding::config_default("nr_cpu_ids", fallback));
                fallback
            }
        };

        let possible: Vec<u32> = match reader
            .symbol_variant(&["__cpu_possible_mask", "cpu_possible_bits"])
            .and_then(|(_, addr)| read_bitmap(reader, addr, nr_cpus))
        {
            Ok(words) => for_each_set_bit(&words, reader.arch().bits_per_long(), nr_cpus).collect(),
            Err(_) => {
                notes.push(Finding::config_default("cpu_possible_mask", format!("cpus 0..{nr_cpus}")));
                (0..nr_cpus).collect()
            }
        };

        let ptr = reader.pointer_size();
        let mut offsets = Vec::with_capacity(possible.len());
        for cpu in possible {
            match reader.read_ptr(offset_table + u64::from(cpu) * ptr) {
                Ok(offset) => offsets.push((CpuId(cpu), offset)),
                Err(error) => notes.push(Finding::Unreadable {
                    context: format!("__per_cpu_offset[{cpu}]"),
                    error,
                }),
            }
        }

        log::info!("Found {} possible CPUs", offsets.len());
        Self { offsets }
    }

    pub fn cpus(&self) -> impl Iterator<Item = CpuId> + '_ {
        self.offsets.iter().map(|(cpu, _)| *cpu)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    #[must_use]
    pub fn offset(&self, cpu: CpuId) -> Option<u64> {
        self.offsets.iter().find(|(c, _)| *c == cpu).map(|(_, off)| *off)
    }

    /// Address of `cpu`'s instance of the per-CPU object at `addr`
    #[must_use]
    pub fn ptr(&self, addr: u64, cpu: CpuId) -> Option<u64> {
        self.offset(cpu).map(|off| addr.wrapping_add(off))
    }

    /// `(cpu, address)` for every possible CPU
    pub fn instances(&self, addr: u64) -> impl Iterator<Item = (CpuId, u64)> + '_ {
        self.offsets.iter().map(move |(cpu, off)| (*cpu, addr.wrapping_add(*off)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ArchInfo, SparseImage};

    #[test]
    fn test_discover_sparse_possible_mask() {
        let mut img = SparseImage::new(ArchInfo::x86_64());
        img.map(0x1000, 0x1000);
        img.define_symbol("__per_cpu_offset", 0x1000);
        img.define_symbol("nr_cpu_ids", 0x1100);
        img.define_symbol("__cpu_possible_mask", 0x1200);
        img.write_u64(0x1000, 0x10_0000).unwrap();
        img.write_u64(0x1008, 0x20_0000).unwrap();
        img.write_u64(0x1010, 0x30_0000).unwrap();
        img.write_u32(0x1100, 3).unwrap();
        img.write_u64(0x1200, 0b101).unwrap();

        let reader = Reader::new(&img);
        let mut notes = Vec::new();
        let percpu = PerCpu::discover(&reader, &mut notes);
        assert!(notes.is_empty());
        assert_eq!(percpu.cpus().collect::<Vec<_>>(), vec![CpuId(0), CpuId(2)]);
        assert_eq!(percpu.ptr(0x40, CpuId(2)), Some(0x30_0040));
        assert_eq!(percpu.ptr(0x40, CpuId(1)), None);
    }

    #[test]
    fn test_missing_mask_records_fallback() {
        let mut img = SparseImage::new(ArchInfo::x86_64());
        img.map(0x1000, 0x1000);
        img.define_symbol("__per_cpu_offset", 0x1000);
        img.define_symbol("nr_cpu_ids", 0x1100);
        img.write_u32(0x1100, 2).unwrap();

        let reader = Reader::new(&img);
        let mut notes = Vec::new();
        let percpu = PerCpu::discover(&reader, &mut notes);
        assert_eq!(percpu.len(), 2);
        assert_eq!(notes.len(), 1);
    }

    #[test]
    fn test_uniprocessor() {
        let img = SparseImage::new(ArchInfo::x86_64());
        let reader = Reader::new(&img);
        let percpu = PerCpu::discover(&reader, &mut Vec::new());
        assert_eq!(percpu, PerCpu::single());
    }
}
