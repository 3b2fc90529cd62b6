// Field sizes are u64 in layouts but always small; offsets fit in usize
#![allow(clippy::cast_possible_truncation)]

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use super::{ArchInfo, FieldLayout, MemoryAccess, TypeLayout};
use crate::domain::AccessError;

/// Upper bound on cached pages before the cache is dropped wholesale
const MAX_CACHED_PAGES: usize = 8192;

/// Longest C string we are willing to chase
pub const MAX_CSTRING: usize = 4096;

/// Typed reader over a [`MemoryAccess`] provider
///
/// Includes a page cache so the many small nested reads of a check pass hit
/// the provider once per page. The cache is short-lived: call
/// [`Reader::begin_pass`] before each pass so stale bytes never leak between
/// unrelated operations.
pub struct Reader<'m> {
    mem: &'m dyn MemoryAccess,
    arch: ArchInfo,
    /// Page address -> page bytes, or `None` if the page is only partially readable
    cache: RefCell<HashMap<u64, Option<Rc<[u8]>>>>,
    caching: Cell<bool>,
}

impl<'m> Reader<'m> {
    pub fn new(mem: &'m dyn MemoryAccess) -> Self {
        Self {
            mem,
            arch: mem.architecture_info(),
            cache: RefCell::new(HashMap::new()),
            caching: Cell::new(true),
        }
    }

    #[must_use]
    pub fn memory(&self) -> &'m dyn MemoryAccess {
        self.mem
    }

    #[must_use]
    pub fn arch(&self) -> ArchInfo {
        self.arch
    }

    #[must_use]
    pub fn pointer_size(&self) -> u64 {
        u64::from(self.arch.pointer_size)
    }

    pub fn set_caching(&self, enabled: bool) {
        self.caching.set(enabled);
        if !enabled {
            self.cache.borrow_mut().clear();
        }
    }

    /// Drop cached bytes; called at the start of every check pass
    pub fn begin_pass(&self) {
        self.cache.borrow_mut().clear();
    }

    fn cached_page(&self, page: u64) -> Option<Rc<[u8]>> {
        if let Some(entry) = self.cache.borrow().get(&page) {
            return entry.clone();
        }

        let mut bytes = vec![0u8; self.arch.page_size as usize];
        let entry = match self.mem.read_bytes(page, &mut bytes) {
            Ok(()) => Some(Rc::from(bytes)),
            Err(_) => None,
        };

        let mut cache = self.cache.borrow_mut();
        if cache.len() >= MAX_CACHED_PAGES {
            cache.clear();
        }
        cache.insert(page, entry.clone());
        entry
    }

    /// Read raw bytes into `buf`
    ///
    /// # Errors
    /// Returns `UnreadableMemory` if any part of the range is not backed
    pub fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), AccessError> {
        if !self.caching.get() || buf.is_empty() {
            return self.mem.read_bytes(addr, buf);
        }

        let page_size = self.arch.page_size;
        let mut done = 0usize;
        while done < buf.len() {
            let cur = addr.wrapping_add(done as u64);
            let page = cur & !(page_size - 1);
            let in_page = (cur - page) as usize;
            let chunk = (buf.len() - done).min(page_size as usize - in_page);

            match self.cached_page(page) {
                Some(bytes) => {
                    buf[done..done + chunk].copy_from_slice(&bytes[in_page..in_page + chunk]);
                }
                // Partially backed page: fall back to an exact read
                None => self.mem.read_bytes(cur, &mut buf[done..done + chunk])?,
            }
            done += chunk;
        }
        Ok(())
    }

    /// # Errors
    /// Returns `UnreadableMemory` if the range is not backed
    pub fn read_vec(&self, addr: u64, len: usize) -> Result<Vec<u8>, AccessError> {
        let mut buf = vec![0u8; len];
        self.read(addr, &mut buf)?;
        Ok(buf)
    }

    /// Decode an unsigned integer of 1, 2, 4 or 8 bytes in target byte order
    #[must_use]
    pub fn decode(&self, bytes: &[u8]) -> u64 {
        decode_uint(bytes, self.arch.big_endian)
    }

    /// Read an unsigned integer of `size` bytes (0 means pointer-sized)
    ///
    /// # Errors
    /// Returns `UnreadableMemory` if the range is not backed
    pub fn read_uint(&self, addr: u64, size: u64) -> Result<u64, AccessError> {
        let size = match size {
            1 | 2 | 4 | 8 => size as usize,
            _ => usize::from(self.arch.pointer_size),
        };
        let mut buf = [0u8; 8];
        self.read(addr, &mut buf[..size])?;
        Ok(self.decode(&buf[..size]))
    }

    /// # Errors
    /// Returns `UnreadableMemory` if the byte is not backed
    pub fn read_u8(&self, addr: u64) -> Result<u8, AccessError> {
        Ok(self.read_uint(addr, 1)? as u8)
    }

    /// # Errors
    /// Returns `UnreadableMemory` if the range is not backed
    pub fn read_u16(&self, addr: u64) -> Result<u16, AccessError> {
        Ok(self.read_uint(addr, 2)? as u16)
    }

    /// # Errors
    /// Returns `UnreadableMemory` if the range is not backed
    pub fn read_u32(&self, addr: u64) -> Result<u32, AccessError> {
        Ok(self.read_uint(addr, 4)? as u32)
    }

    /// # Errors
    /// Returns `UnreadableMemory` if the range is not backed
    #[allow(clippy::cast_possible_wrap)]
    pub fn read_i32(&self, addr: u64) -> Result<i32, AccessError> {
        Ok(self.read_u32(addr)? as i32)
    }

    /// # Errors
    /// Returns `UnreadableMemory` if the range is not backed
    pub fn read_u64(&self, addr: u64) -> Result<u64, AccessError> {
        self.read_uint(addr, 8)
    }

    /// # Errors
    /// Returns `UnreadableMemory` if the range is not backed
    pub fn read_ptr(&self, addr: u64) -> Result<u64, AccessError> {
        self.read_uint(addr, 0)
    }

    /// Read a NUL-terminated string of at most `max` bytes
    ///
    /// # Errors
    /// Returns `UnreadableMemory` if memory runs out before the terminator
    pub fn read_cstring(&self, addr: u64, max: usize) -> Result<String, AccessError> {
        let page_size = self.arch.page_size;
        let mut out = Vec::new();
        let mut cur = addr;

        while out.len() < max {
            let to_page_end = (page_size - (cur & (page_size - 1))) as usize;
            let chunk = to_page_end.min(max - out.len());
            let bytes = self.read_vec(cur, chunk)?;
            if let Some(nul) = bytes.iter().position(|&b| b == 0) {
                out.extend_from_slice(&bytes[..nul]);
                return Ok(String::from_utf8_lossy(&out).into_owned());
            }
            out.extend_from_slice(&bytes);
            cur = cur.wrapping_add(chunk as u64);
        }

        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    // ---- symbols and layouts -------------------------------------------------

    /// # Errors
    /// Returns `SymbolNotFound` if the provider does not know the symbol
    pub fn symbol(&self, name: &str) -> Result<u64, AccessError> {
        self.mem.resolve_symbol(name)
    }

    #[must_use]
    pub fn has_symbol(&self, name: &str) -> bool {
        self.mem.resolve_symbol(name).is_ok()
    }

    /// First symbol of `names` that resolves, with the name that matched
    ///
    /// # Errors
    /// Returns `SymbolNotFound` listing all variants if none resolves
    pub fn symbol_variant(&self, names: &[&'static str]) -> Result<(&'static str, u64), AccessError> {
        names
            .iter()
            .find_map(|name| self.mem.resolve_symbol(name).ok().map(|addr| (*name, addr)))
            .ok_or_else(|| AccessError::SymbolNotFound(names.join("|")))
    }

    #[must_use]
    pub fn constant(&self, name: &str) -> Option<i64> {
        self.mem.constant(name)
    }

    /// # Errors
    /// Returns `TypeNotFound` if the layout is unknown
    pub fn layout(&self, ty: &str) -> Result<&'m TypeLayout, AccessError> {
        let mem: &'m dyn MemoryAccess = self.mem;
        mem.type_layout(ty)
    }

    #[must_use]
    pub fn has_type(&self, ty: &str) -> bool {
        self.mem.type_layout(ty).is_ok()
    }

    /// # Errors
    /// Returns `TypeNotFound` if the layout is unknown
    pub fn size_of(&self, ty: &str) -> Result<u64, AccessError> {
        Ok(self.layout(ty)?.size)
    }

    /// # Errors
    /// Returns `TypeNotFound` or `FieldNotFound`
    pub fn member(&self, ty: &str, field: &str) -> Result<FieldLayout, AccessError> {
        self.layout(ty)?
            .member(field)
            .copied()
            .ok_or_else(|| AccessError::FieldNotFound { ty: ty.to_string(), field: field.to_string() })
    }

    /// # Errors
    /// Returns `TypeNotFound` or `FieldNotFound`
    pub fn offset_of(&self, ty: &str, field: &str) -> Result<u64, AccessError> {
        Ok(self.member(ty, field)?.offset)
    }

    #[must_use]
    pub fn has_member(&self, ty: &str, field: &str) -> bool {
        self.layout(ty).is_ok_and(|l| l.has_member(field))
    }

    /// Resolve the first existing member name out of `variants`
    ///
    /// Kernel versions rename members; callers resolve the concrete name once
    /// at setup and keep the returned layout.
    ///
    /// # Errors
    /// Returns `TypeNotFound`, or `FieldNotFound` listing all variants
    pub fn member_variant(
        &self,
        ty: &str,
        variants: &[&'static str],
    ) -> Result<(&'static str, FieldLayout), AccessError> {
        let layout = self.layout(ty)?;
        variants
            .iter()
            .find_map(|name| layout.member(name).map(|f| (*name, *f)))
            .ok_or_else(|| AccessError::FieldNotFound { ty: ty.to_string(), field: variants.join("|") })
    }

    /// First type name out of `variants` that has a layout
    ///
    /// # Errors
    /// Returns `TypeNotFound` listing all variants
    pub fn type_variant(&self, variants: &[&'static str]) -> Result<&'static str, AccessError> {
        variants
            .iter()
            .copied()
            .find(|ty| self.has_type(ty))
            .ok_or_else(|| AccessError::TypeNotFound(variants.join("|")))
    }

    /// # Errors
    /// Returns `TypeNotFound` or `EnumeratorNotFound`
    pub fn enum_value(&self, ty: &str, name: &str) -> Result<i64, AccessError> {
        self.layout(ty)?
            .enum_value(name)
            .ok_or_else(|| AccessError::EnumeratorNotFound { ty: ty.to_string(), name: name.to_string() })
    }

    /// Read member `field` of the `ty` instance at `base`
    ///
    /// # Errors
    /// Returns lookup errors or `UnreadableMemory`
    pub fn read_member(&self, base: u64, ty: &str, field: &str) -> Result<u64, AccessError> {
        let member = self.member(ty, field)?;
        self.read_uint(base.wrapping_add(member.offset), member.size)
    }

    /// Read a whole structure once so its members can be decoded locally
    ///
    /// # Errors
    /// Returns `TypeNotFound` or `UnreadableMemory`
    pub fn read_struct(&self, addr: u64, ty: &str) -> Result<StructBytes, AccessError> {
        let size = self.size_of(ty)?;
        let bytes = self.read_vec(addr, size as usize)?;
        Ok(StructBytes { addr, bytes, big_endian: self.arch.big_endian })
    }
}

/// Bytes of one structure instance
#[derive(Debug, Clone)]
pub struct StructBytes {
    pub addr: u64,
    bytes: Vec<u8>,
    big_endian: bool,
}

impl StructBytes {
    #[must_use]
    pub fn new(addr: u64, bytes: Vec<u8>, big_endian: bool) -> Self {
        Self { addr, bytes, big_endian }
    }

    /// Unsigned value at `offset`; zero if the range lies outside the struct
    #[must_use]
    pub fn uint(&self, offset: u64, size: u64) -> u64 {
        let start = offset as usize;
        let end = start.saturating_add(size as usize);
        self.bytes.get(start..end).map_or(0, |b| decode_uint(b, self.big_endian))
    }

    #[must_use]
    pub fn member(&self, field: &FieldLayout) -> u64 {
        self.uint(field.offset, field.size)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Decode 1..=8 bytes as an unsigned integer
#[must_use]
pub fn decode_uint(bytes: &[u8], big_endian: bool) -> u64 {
    let mut value = 0u64;
    if big_endian {
        for &b in bytes.iter().take(8) {
            value = (value << 8) | u64::from(b);
        }
    } else {
        for &b in bytes.iter().take(8).rev() {
            value = (value << 8) | u64::from(b);
        }
    }
    value
}

/// Sign-extend the low `bits` of `value`
#[must_use]
#[allow(clippy::cast_possible_wrap)]
pub fn sign_extend(value: u64, bits: u32) -> i64 {
    if bits == 0 || bits >= 64 {
        return value as i64;
    }
    let shift = 64 - bits;
    ((value << shift) as i64) >> shift
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SparseImage;

    fn image() -> SparseImage {
        let mut img = SparseImage::new(ArchInfo::x86_64());
        img.map(0x1000, 0x2000);
        img
    }

    #[test]
    fn test_decode_uint_endianness() {
        assert_eq!(decode_uint(&[0x78, 0x56, 0x34, 0x12], false), 0x1234_5678);
        assert_eq!(decode_uint(&[0x12, 0x34, 0x56, 0x78], true), 0x1234_5678);
        assert_eq!(decode_uint(&[0xff], false), 0xff);
    }

    #[test]
    fn test_sign_extend() {
        assert_eq!(sign_extend(0xffff_ff80, 32), -128);
        assert_eq!(sign_extend(0x7f, 8), 127);
        assert_eq!(sign_extend(0x80, 8), -128);
    }

    #[test]
    fn test_reads_across_page_boundary() {
        let mut img = image();
        img.write_u64(0x1ffc, 0x1122_3344_5566_7788).unwrap();
        let reader = Reader::new(&img);
        assert_eq!(reader.read_u64(0x1ffc).unwrap(), 0x1122_3344_5566_7788);

        reader.set_caching(false);
        assert_eq!(reader.read_u64(0x1ffc).unwrap(), 0x1122_3344_5566_7788);
    }

    #[test]
    fn test_unreadable_reports_error() {
        let img = image();
        let reader = Reader::new(&img);
        let err = reader.read_u64(0x9000).unwrap_err();
        assert!(matches!(err, AccessError::UnreadableMemory { .. }));
    }

    #[test]
    fn test_partially_backed_page_falls_back() {
        let mut img = SparseImage::new(ArchInfo::x86_64());
        img.map(0x1100, 0x20);
        img.write_u32(0x1108, 0xdead_beef).unwrap();
        let reader = Reader::new(&img);
        assert_eq!(reader.read_u32(0x1108).unwrap(), 0xdead_beef);
        assert!(reader.read_u32(0x1120).is_err());
    }

    #[test]
    fn test_read_cstring() {
        let mut img = image();
        img.write(0x1800, b"kmalloc-64\0junk").unwrap();
        let reader = Reader::new(&img);
        assert_eq!(reader.read_cstring(0x1800, 64).unwrap(), "kmalloc-64");
        assert_eq!(reader.read_cstring(0x1800, 4).unwrap(), "kmal");
    }

    #[test]
    fn test_unterminated_name_stops_at_cap() {
        let mut img = image();
        img.write(0x1000, &[b'x'; 0x2000]).unwrap();
        let reader = Reader::new(&img);
        let name = reader.read_cstring(0x1000, crate::memory::MAX_CSTRING).unwrap();
        assert_eq!(name.len(), crate::memory::MAX_CSTRING);
    }

    #[test]
    fn test_member_variants() {
        let mut img = image();
        img.define_type("struct page", TypeLayout::new(64).field("compound_head", 8, 8));
        let reader = Reader::new(&img);
        let (name, field) = reader.member_variant("struct page", &["first_page", "compound_head"]).unwrap();
        assert_eq!(name, "compound_head");
        assert_eq!(field.offset, 8);
        assert!(reader.member_variant("struct page", &["nope"]).is_err());
    }
}
