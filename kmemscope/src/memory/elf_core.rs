use object::{Object, ObjectSegment};
use std::collections::HashMap;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use super::{ArchInfo, LayoutDb, MemoryAccess, TypeLayout};
use crate::domain::{AccessError, LoadError};

/// One `PT_LOAD` program header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LoadSegment {
    vaddr: u64,
    file_offset: u64,
    file_size: u64,
}

impl LoadSegment {
    fn contains(&self, addr: u64) -> bool {
        addr >= self.vaddr && addr - self.vaddr < self.file_size
    }
}

/// File-backed ELF core: `/proc/kcore` or a kdump vmcore
///
/// The file is never loaded whole (kcore spans the entire kernel address
/// space); program headers are indexed once and reads become positioned file
/// reads.
pub struct ElfCore {
    path: PathBuf,
    file: File,
    /// Sorted by `vaddr`
    segments: Vec<LoadSegment>,
    symbols: HashMap<String, u64>,
    layouts: LayoutDb,
}

impl ElfCore {
    /// Index the loadable segments of an ELF core
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened, is not ELF, or has no
    /// `PT_LOAD` segments
    pub fn open<P: AsRef<Path>>(
        path: P,
        layouts: LayoutDb,
        symbols: HashMap<String, u64>,
    ) -> Result<Self, LoadError> {
        let path = path.as_ref().to_path_buf();
        let parse_error = |reason: String| LoadError::Parse { path: path.display().to_string(), reason };

        let segments = {
            let cache = object::ReadCache::new(File::open(&path)?);
            let obj = object::File::parse(&cache).map_err(|e| parse_error(e.to_string()))?;

            let mut segments: Vec<LoadSegment> = obj
                .segments()
                .filter_map(|seg| {
                    let (file_offset, file_size) = seg.file_range();
                    (file_size > 0).then_some(LoadSegment { vaddr: seg.address(), file_offset, file_size })
                })
                .collect();
            segments.sort_by_key(|s| s.vaddr);
            segments
        };

        if segments.is_empty() {
            return Err(LoadError::NoSegments(path.display().to_string()));
        }

        log::info!("Indexed {} loadable segments of {}", segments.len(), path.display());

        let file = File::open(&path)?;
        Ok(Self { path, file, segments, symbols, layouts })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn segment_for(&self, addr: u64) -> Option<&LoadSegment> {
        let idx = self.segments.partition_point(|s| s.vaddr <= addr);
        idx.checked_sub(1).map(|i| &self.segments[i]).filter(|s| s.contains(addr))
    }
}

impl MemoryAccess for ElfCore {
    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<(), AccessError> {
        let total = buf.len();
        let unreadable = || AccessError::UnreadableMemory { addr, len: total };
        let mut done = 0usize;

        while done < total {
            let cur = addr.wrapping_add(done as u64);
            let seg = self.segment_for(cur).ok_or_else(unreadable)?;
            let in_seg = cur - seg.vaddr;
            let available = usize::try_from(seg.file_size - in_seg).unwrap_or(usize::MAX);
            let chunk = (total - done).min(available);

            self.file
                .read_exact_at(&mut buf[done..done + chunk], seg.file_offset + in_seg)
                .map_err(|_| unreadable())?;
            done += chunk;
        }
        Ok(())
    }

    fn resolve_symbol(&self, name: &str) -> Result<u64, AccessError> {
        self.symbols.get(name).copied().ok_or_else(|| AccessError::SymbolNotFound(name.to_string()))
    }

    fn type_layout(&self, name: &str) -> Result<&TypeLayout, AccessError> {
        self.layouts.get(name).ok_or_else(|| AccessError::TypeNotFound(name.to_string()))
    }

    fn architecture_info(&self) -> ArchInfo {
        self.layouts.arch
    }

    fn constant(&self, name: &str) -> Option<i64> {
        self.layouts.constants.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Minimal little-endian ELF64 core with one PT_LOAD
    fn build_core(vaddr: u64, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        // e_ident
        out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
        out.extend_from_slice(&[0; 8]);
        out.extend_from_slice(&4u16.to_le_bytes()); // ET_CORE
        out.extend_from_slice(&62u16.to_le_bytes()); // EM_X86_64
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes()); // e_entry
        out.extend_from_slice(&64u64.to_le_bytes()); // e_phoff
        out.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&64u16.to_le_bytes()); // e_ehsize
        out.extend_from_slice(&56u16.to_le_bytes()); // e_phentsize
        out.extend_from_slice(&1u16.to_le_bytes()); // e_phnum
        out.extend_from_slice(&64u16.to_le_bytes()); // e_shentsize
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());

        let data_offset = 64u64 + 56;
        out.extend_from_slice(&1u32.to_le_bytes()); // PT_LOAD
        out.extend_from_slice(&4u32.to_le_bytes()); // PF_R
        out.extend_from_slice(&data_offset.to_le_bytes());
        out.extend_from_slice(&vaddr.to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes()); // p_paddr
        out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        out.extend_from_slice(&0x1000u64.to_le_bytes());

        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_reads_through_pt_load() {
        let payload: Vec<u8> = (0u8..64).collect();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&build_core(0xffff_8880_0000_0000, &payload)).unwrap();

        let core = ElfCore::open(file.path(), LayoutDb::default(), HashMap::new()).unwrap();
        let mut buf = [0u8; 4];
        core.read_bytes(0xffff_8880_0000_0010, &mut buf).unwrap();
        assert_eq!(buf, [16, 17, 18, 19]);

        let err = core.read_bytes(0xffff_8880_0000_003e, &mut buf).unwrap_err();
        assert!(matches!(err, AccessError::UnreadableMemory { .. }));
    }

    #[test]
    fn test_rejects_non_elf() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"definitely not an ELF file, just some text").unwrap();
        assert!(ElfCore::open(file.path(), LayoutDb::default(), HashMap::new()).is_err());
    }
}
