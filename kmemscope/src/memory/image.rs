use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use super::{ArchInfo, LayoutDb, MemoryAccess, TypeLayout};
use crate::domain::{AccessError, LoadError};

/// In-memory kernel image made of disjoint segments
///
/// Backs flat `--raw` dumps and the synthetic kernels used in tests. Writes
/// exist only for building an image; the engines see it through
/// [`MemoryAccess`], which is read-only.
#[derive(Debug, Clone, Default)]
pub struct SparseImage {
    segments: BTreeMap<u64, Vec<u8>>,
    symbols: HashMap<String, u64>,
    layouts: LayoutDb,
}

impl SparseImage {
    #[must_use]
    pub fn new(arch: ArchInfo) -> Self {
        Self { segments: BTreeMap::new(), symbols: HashMap::new(), layouts: LayoutDb::new(arch) }
    }

    /// Load a flat dump whose first byte lives at virtual address `base`
    ///
    /// # Errors
    /// Returns an error if the file cannot be read
    pub fn from_raw_file<P: AsRef<Path>>(path: P, base: u64, layouts: LayoutDb) -> Result<Self, LoadError> {
        let bytes = fs::read(path.as_ref())?;
        if bytes.is_empty() {
            return Err(LoadError::NoSegments(path.as_ref().display().to_string()));
        }
        log::info!("Mapped {} bytes of {} at {base:#x}", bytes.len(), path.as_ref().display());

        let mut image = Self { segments: BTreeMap::new(), symbols: HashMap::new(), layouts };
        image.segments.insert(base, bytes);
        Ok(image)
    }

    #[must_use]
    pub fn arch(&self) -> ArchInfo {
        self.layouts.arch
    }

    /// Back `[addr, addr + len)` with zeroed bytes
    ///
    /// Ranges must not overlap an existing segment unless they start at the
    /// same address, in which case the segment is replaced.
    pub fn map(&mut self, addr: u64, len: usize) {
        self.segments.insert(addr, vec![0u8; len]);
    }

    /// Segment containing `addr` and the offset of `addr` inside it
    fn locate(&self, addr: u64) -> Option<(u64, usize)> {
        let (&start, bytes) = self.segments.range(..=addr).next_back()?;
        let offset = usize::try_from(addr - start).ok()?;
        (offset < bytes.len()).then_some((start, offset))
    }

    /// # Errors
    /// Returns `UnreadableMemory` if any byte of the range is unmapped
    pub fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), AccessError> {
        let unreadable = AccessError::UnreadableMemory { addr, len: data.len() };
        let mut done = 0usize;
        while done < data.len() {
            let cur = addr.wrapping_add(done as u64);
            let (start, offset) = self.locate(cur).ok_or_else(|| unreadable.clone())?;
            let seg = self.segments.get_mut(&start).ok_or_else(|| unreadable.clone())?;
            let chunk = (data.len() - done).min(seg.len() - offset);
            seg[offset..offset + chunk].copy_from_slice(&data[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    fn encode(&self, value: u64, size: usize) -> Vec<u8> {
        let le = value.to_le_bytes();
        let mut bytes = le[..size].to_vec();
        if self.layouts.arch.big_endian {
            bytes.reverse();
        }
        bytes
    }

    /// # Errors
    /// Returns `UnreadableMemory` if the byte is unmapped
    pub fn write_u8(&mut self, addr: u64, value: u8) -> Result<(), AccessError> {
        self.write(addr, &[value])
    }

    /// # Errors
    /// Returns `UnreadableMemory` if the range is unmapped
    pub fn write_u16(&mut self, addr: u64, value: u16) -> Result<(), AccessError> {
        let bytes = self.encode(u64::from(value), 2);
        self.write(addr, &bytes)
    }

    /// # Errors
    /// Returns `UnreadableMemory` if the range is unmapped
    pub fn write_u32(&mut self, addr: u64, value: u32) -> Result<(), AccessError> {
        let bytes = self.encode(u64::from(value), 4);
        self.write(addr, &bytes)
    }

    /// # Errors
    /// Returns `UnreadableMemory` if the range is unmapped
    pub fn write_u64(&mut self, addr: u64, value: u64) -> Result<(), AccessError> {
        let bytes = self.encode(value, 8);
        self.write(addr, &bytes)
    }

    /// Write an unsigned value of `size` bytes (1, 2, 4 or 8)
    ///
    /// # Errors
    /// Returns `UnreadableMemory` if the range is unmapped
    pub fn write_uint(&mut self, addr: u64, value: u64, size: u64) -> Result<(), AccessError> {
        let size = match size {
            1 | 2 | 4 | 8 => usize::try_from(size).unwrap_or(8),
            _ => usize::from(self.layouts.arch.pointer_size),
        };
        let bytes = self.encode(value, size);
        self.write(addr, &bytes)
    }

    /// # Errors
    /// Returns `UnreadableMemory` if the range is unmapped
    pub fn write_ptr(&mut self, addr: u64, value: u64) -> Result<(), AccessError> {
        self.write_uint(addr, value, 0)
    }

    pub fn define_symbol(&mut self, name: &str, addr: u64) {
        self.symbols.insert(name.to_string(), addr);
    }

    pub fn define_type(&mut self, name: &str, layout: TypeLayout) {
        self.layouts.insert(name, layout);
    }

    pub fn define_constant(&mut self, name: &str, value: i64) {
        self.layouts.constants.insert(name.to_string(), value);
    }

    /// Replace the symbol table, e.g. with one loaded from System.map
    pub fn set_symbols(&mut self, symbols: HashMap<String, u64>) {
        self.symbols = symbols;
    }

    /// Layout of a defined type, for tests that poke members by name
    ///
    /// # Errors
    /// Returns `TypeNotFound` or `FieldNotFound`
    pub fn member_offset(&self, ty: &str, field: &str) -> Result<u64, AccessError> {
        let layout = self.layouts.get(ty).ok_or_else(|| AccessError::TypeNotFound(ty.to_string()))?;
        layout
            .member(field)
            .map(|f| f.offset)
            .ok_or_else(|| AccessError::FieldNotFound { ty: ty.to_string(), field: field.to_string() })
    }
}

impl MemoryAccess for SparseImage {
    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<(), AccessError> {
        let total = buf.len();
        let unreadable = || AccessError::UnreadableMemory { addr, len: total };
        let mut done = 0usize;
        while done < total {
            let cur = addr.wrapping_add(done as u64);
            let (start, offset) = self.locate(cur).ok_or_else(unreadable)?;
            let seg = &self.segments[&start];
            let chunk = (total - done).min(seg.len() - offset);
            buf[done..done + chunk].copy_from_slice(&seg[offset..offset + chunk]);
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

    #[test]
    fn test_adjacent_segments_read_as_one() {
        let mut img = SparseImage::new(ArchInfo::x86_64());
        img.map(0x1000, 0x10);
        img.map(0x1010, 0x10);
        img.write_u64(0x100c, 0xaabb_ccdd_1122_3344).unwrap();

        let mut buf = [0u8; 8];
        img.read_bytes(0x100c, &mut buf).unwrap();
        assert_eq!(u64::from_le_bytes(buf), 0xaabb_ccdd_1122_3344);
    }

    #[test]
    fn test_gap_is_unreadable() {
        let mut img = SparseImage::new(ArchInfo::x86_64());
        img.map(0x1000, 0x10);
        img.map(0x1020, 0x10);
        let mut buf = [0u8; 0x20];
        let err = img.read_bytes(0x1000, &mut buf).unwrap_err();
        assert_eq!(err, AccessError::UnreadableMemory { addr: 0x1000, len: 0x20 });
    }

    #[test]
    fn test_big_endian_writes() {
        let arch = ArchInfo { big_endian: true, ..ArchInfo::x86_64() };
        let mut img = SparseImage::new(arch);
        img.map(0, 8);
        img.write_u32(0, 0x0102_0304).unwrap();
        let mut buf = [0u8; 4];
        img.read_bytes(0, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn test_from_raw_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0xde, 0xad, 0xbe, 0xef]).unwrap();
        let img = SparseImage::from_raw_file(file.path(), 0xffff_8880_0000_0000, LayoutDb::default()).unwrap();
        let mut buf = [0u8; 2];
        img.read_bytes(0xffff_8880_0000_0002, &mut buf).unwrap();
        assert_eq!(buf, [0xbe, 0xef]);
    }

    #[test]
    fn test_symbols_and_constants() {
        let mut img = SparseImage::new(ArchInfo::x86_64());
        img.define_symbol("max_pfn", 0x2000);
        img.define_constant("SECTION_SIZE_BITS", 27);
        assert_eq!(img.resolve_symbol("max_pfn").unwrap(), 0x2000);
        assert!(img.resolve_symbol("nope").is_err());
        assert_eq!(img.constant("SECTION_SIZE_BITS"), Some(27));
    }
}
