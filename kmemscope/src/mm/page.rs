//! # Page Frame Descriptors
//!
//! Translation between frame numbers, `struct page` addresses and direct-map
//! linear addresses, plus decoding of the packed `page->flags` word.
//!
//! ## Memory Models
//!
//! ```text
//! Dense:   page = base + pfn * sizeof(struct page)        (vmemmap, FLATMEM)
//! Sparse:  nr      = pfn >> (SECTION_SIZE_BITS - PAGE_SHIFT)
//!          section = mem_section[nr / SECTIONS_PER_ROOT][nr % SECTIONS_PER_ROOT]
//!          page    = (section->section_mem_map & ~MAP_MASK) + pfn * sizeof(struct page)
//! ```
//!
//! The model is picked once, from the kernel config when available and from
//! symbol presence otherwise.
//!
//! ## Flags Word
//!
//! ```text
//! | SECTION | NODE | ZONE | ... | PG_* flags |
//!  ^ bit BITS_PER_LONG-1                    ^ bit 0
//! ```
//!
//! `NODES_WIDTH` comes from `CONFIG_NODES_SHIFT` (default 6), `ZONES_WIDTH`
//! is `ceil(log2(__MAX_NR_ZONES))`. The section field only exists for
//! non-vmemmap sparse memory.
//!
//! ## Compound Pages
//!
//! Three generations of the tail-page ABI, exactly one of which is active:
//!
//! | Strategy     | Tail test                         | Head                       |
//! |--------------|-----------------------------------|----------------------------|
//! | `TailFlag`   | `PG_tail` set                     | head field                 |
//! | `TaggedHead` | `compound_head & 1`               | `compound_head - 1`        |
//! | `FlagCombo`  | `PG_compound` and `PG_reclaim` set | `first_page`               |

use serde::Serialize;
use std::collections::HashMap;

use crate::domain::{Finding, ModelError, NodeId, Pfn, ZoneId};
use crate::kernel::KernelConfig;
use crate::memory::{FieldLayout, Reader, StructBytes};

/// Default x86-64 `vmemmap_base` without KASLR
pub const DEFAULT_VMEMMAP_BASE: u64 = 0xffff_ea00_0000_0000;
/// Default x86-64 `page_offset_base` (4-level paging) without KASLR
pub const DEFAULT_PAGE_OFFSET: u64 = 0xffff_8880_0000_0000;

const DEFAULT_NODES_SHIFT: i64 = 6;
const DEFAULT_MAX_NR_ZONES: i64 = 4;
const DEFAULT_SECTION_SIZE_BITS: i64 = 27;
const DEFAULT_SECTION_MAP_LAST_BIT: i64 = 5;
const DEFAULT_MAX_PHYSMEM_BITS: i64 = 46;

/// `PAGE_MAPPING_ANON`
const PAGE_MAPPING_ANON: u64 = 1;

const DEFAULT_PAGE_TYPE_BASE: u32 = 0xf000_0000;
const DEFAULT_PG_BUDDY_TYPE: u32 = 0x0000_0080;
/// `PAGE_BUDDY_MAPCOUNT_VALUE`
const BUDDY_MAPCOUNT: i32 = -128;

const PAGE: &str = "struct page";

/// How frame numbers map to `struct page` addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MemoryModel {
    /// One contiguous descriptor array
    Dense { base: u64 },
    /// Two-level `mem_section` index
    Sparse {
        mem_section: u64,
        /// `CONFIG_SPARSEMEM_EXTREME`: roots are pointers, not inline arrays
        extreme: bool,
        /// `SECTION_SIZE_BITS - PAGE_SHIFT`
        pfn_section_shift: u32,
        sections_per_root: u64,
        section_size: u64,
        map_offset: u64,
        map_mask: u64,
    },
}

impl MemoryModel {
    /// Section number and `(root, offset)` position of a frame
    #[must_use]
    pub fn section_position(pfn_section_shift: u32, sections_per_root: u64, pfn: u64) -> (u64, u64, u64) {
        let nr = pfn >> pfn_section_shift;
        (nr, nr / sections_per_root, nr % sections_per_root)
    }
}

/// Compound-page ABI generation, chosen once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompoundStrategy {
    /// Dedicated `PG_tail` bit; head from the head field
    TailFlag { tail: u64, head: HeadField },
    /// Tagged low bit in `compound_head`
    TaggedHead { offset: u64 },
    /// `PG_compound | PG_reclaim` both set; head from `first_page`
    FlagCombo { mask: u64, offset: u64 },
}

/// Where a tail page keeps its head
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HeadField {
    /// `compound_head`, tagged with bit 0
    Tagged { offset: u64 },
    /// `first_page`, a plain pointer
    Direct { offset: u64 },
}

/// How to recognise a free buddy page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuddyTest {
    /// `PG_buddy` in `page->flags`
    Flag { mask: u64 },
    /// `page_type` with the buddy bit cleared out of the base pattern
    PageType { offset: u64, base: u32, buddy: u32 },
    /// `_mapcount == PAGE_BUDDY_MAPCOUNT_VALUE`
    Mapcount { offset: u64 },
}

/// Bit layout of the high part of `page->flags`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FlagLayout {
    pub bits_per_long: u32,
    pub sections_width: u32,
    pub nodes_width: u32,
    pub zones_width: u32,
}

fn field_at(flags: u64, shift: u32, width: u32) -> u64 {
    if width == 0 || shift >= 64 {
        return 0;
    }
    let mask = if width >= 64 { u64::MAX } else { (1u64 << width) - 1 };
    (flags >> shift) & mask
}

/// `ceil(log2(n))`, 0 for n <= 1
#[must_use]
pub fn ceil_log2(n: u64) -> u32 {
    if n <= 1 {
        0
    } else {
        64 - (n - 1).leading_zeros()
    }
}

impl FlagLayout {
    fn sections_shift(&self) -> u32 {
        self.bits_per_long - self.sections_width
    }

    fn nodes_shift(&self) -> u32 {
        self.sections_shift() - self.nodes_width
    }

    fn zones_shift(&self) -> u32 {
        self.nodes_shift() - self.zones_width
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn section(&self, flags: u64) -> u64 {
        field_at(flags, self.sections_shift(), self.sections_width)
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn nid(&self, flags: u64) -> NodeId {
        NodeId(field_at(flags, self.nodes_shift(), self.nodes_width) as u32)
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn zid(&self, flags: u64) -> ZoneId {
        ZoneId(field_at(flags, self.zones_shift(), self.zones_width) as u32)
    }

    /// Flags word carrying a given node and zone, for building images
    #[must_use]
    pub fn encode(&self, nid: NodeId, zid: ZoneId) -> u64 {
        let put = |value: u64, shift: u32, width: u32| {
            if width == 0 || shift >= 64 {
                0
            } else {
                (value & ((1u64 << width) - 1)) << shift
            }
        };
        put(u64::from(nid.0), self.nodes_shift(), self.nodes_width)
            | put(u64::from(zid.0), self.zones_shift(), self.zones_width)
    }
}

/// Everything needed to interpret `struct page`, resolved once per session
#[derive(Debug, Clone)]
pub struct PageModel {
    memory: MemoryModel,
    page_size: u64,
    page_shift: u32,
    struct_size: u64,
    direct_map: u64,
    max_pfn: Option<u64>,
    flags: FieldLayout,
    refcount: FieldLayout,
    mapcount: Option<FieldLayout>,
    mapping: FieldLayout,
    private: Option<FieldLayout>,
    lru: Option<FieldLayout>,
    slab_cache: FieldLayout,
    slab_page: FieldLayout,
    compound: CompoundStrategy,
    buddy: BuddyTest,
    layout: FlagLayout,
    pageflags: HashMap<String, u32>,
    nr_pageflags: Option<u32>,
}

/// Optional overrides and facts gathered at setup
#[derive(Debug, Clone, Copy, Default)]
pub struct PageModelOptions {
    pub memory: Option<MemoryModel>,
}

impl PageModel {
    /// Resolve layouts, memory model and strategies
    ///
    /// Fallbacks to documented defaults are appended to `notes`.
    ///
    /// # Errors
    /// Returns `UnsupportedLayout` if no compound-page or buddy strategy
    /// matches, or a lookup error if `struct page` is not described
    pub fn resolve(
        reader: &Reader<'_>,
        config: &KernelConfig,
        options: PageModelOptions,
        notes: &mut Vec<Finding>,
    ) -> Result<Self, ModelError> {
        let arch = reader.arch();
        let struct_size = reader.size_of(PAGE)?;
        let ptr = reader.pointer_size();

        let pageflags: HashMap<String, u32> = reader
            .layout("enum pageflags")?
            .enumerators
            .iter()
            .filter_map(|(name, value)| u32::try_from(*value).ok().map(|v| (name.clone(), v)))
            .collect();
        if !pageflags.contains_key("PG_slab") {
            log::warn!("enum pageflags has no PG_slab; slab pages will not be recognised");
        }

        let (_, refcount) = reader.member_variant(PAGE, &["_refcount", "_count"])?;
        let mapping = reader.member(PAGE, "mapping")?;
        let lru = reader.member(PAGE, "lru").ok();

        let (cache_name, mut slab_cache) = reader.member_variant(PAGE, &["slab_cache", "lru"])?;
        if cache_name == "lru" {
            slab_cache = FieldLayout { offset: slab_cache.offset, size: ptr, ..FieldLayout::default() };
        }
        let (slab_name, mut slab_page) = reader.member_variant(PAGE, &["slab_page", "lru"])?;
        if slab_name == "lru" {
            slab_page = FieldLayout { offset: slab_page.offset + ptr, size: ptr, ..FieldLayout::default() };
        }

        let compound = Self::select_compound(reader, &pageflags)?;
        let buddy = Self::select_buddy(reader, &pageflags)?;
        log::info!("Compound page strategy: {compound:?}, buddy test: {buddy:?}");

        let memory = match options.memory {
            Some(memory) => memory,
            None => Self::select_memory_model(reader, config, notes)?,
        };
        log::info!("Memory model: {memory:?}");

        let sections_width = match memory {
            MemoryModel::Dense { .. } => 0,
            MemoryModel::Sparse { .. } => match reader.constant("SECTIONS_WIDTH") {
                Some(w) => u32::try_from(w).unwrap_or(0),
                None => {
                    let physmem = reader.constant("MAX_PHYSMEM_BITS").unwrap_or_else(|| {
                        notes.push(Finding::config_default("MAX_PHYSMEM_BITS", DEFAULT_MAX_PHYSMEM_BITS));
                        DEFAULT_MAX_PHYSMEM_BITS
                    });
                    let section = Self::section_size_bits(reader, notes);
                    u32::try_from(physmem - section).unwrap_or(0)
                }
            },
        };

        let nodes_width = u32::try_from(config.int_or("NODES_SHIFT", DEFAULT_NODES_SHIFT, notes)).unwrap_or(0);
        let max_zones = match reader.enum_value("enum zone_type", "__MAX_NR_ZONES") {
            Ok(n) => n,
            Err(_) => {
                notes.push(Finding::config_default("__MAX_NR_ZONES", DEFAULT_MAX_NR_ZONES));
                DEFAULT_MAX_NR_ZONES
            }
        };
        let zones_width = ceil_log2(u64::try_from(max_zones).unwrap_or(1));

        let direct_map = match reader.symbol("page_offset_base").and_then(|s| reader.read_ptr(s)) {
            Ok(base) => base,
            Err(_) => {
                notes.push(Finding::config_default("page_offset_base", format!("{DEFAULT_PAGE_OFFSET:#x}")));
                DEFAULT_PAGE_OFFSET
            }
        };
        let max_pfn = reader.symbol("max_pfn").and_then(|s| reader.read_ptr(s)).ok();

        Ok(Self {
            memory,
            page_size: arch.page_size,
            page_shift: arch.page_shift,
            struct_size,
            direct_map,
            max_pfn,
            flags: reader.member(PAGE, "flags")?,
            refcount,
            mapcount: reader.member(PAGE, "_mapcount").ok(),
            mapping,
            private: reader.member(PAGE, "private").ok(),
            lru,
            slab_cache,
            slab_page,
            compound,
            buddy,
            layout: FlagLayout { bits_per_long: arch.bits_per_long(), sections_width, nodes_width, zones_width },
            nr_pageflags: reader
                .enum_value("enum pageflags", "__NR_PAGEFLAGS")
                .ok()
                .and_then(|n| u32::try_from(n).ok()),
            pageflags,
        })
    }

    fn select_compound(reader: &Reader<'_>, pageflags: &HashMap<String, u32>) -> Result<CompoundStrategy, ModelError> {
        let head_field = if let Ok(f) = reader.member(PAGE, "compound_head") {
            Some(HeadField::Tagged { offset: f.offset })
        } else {
            reader.member(PAGE, "first_page").ok().map(|f| HeadField::Direct { offset: f.offset })
        };

        if let Some(&tail) = pageflags.get("PG_tail") {
            let head = head_field.ok_or_else(|| ModelError::unsupported(PAGE, "PG_tail without a head field"))?;
            return Ok(CompoundStrategy::TailFlag { tail: 1 << tail, head });
        }
        match head_field {
            Some(HeadField::Tagged { offset }) => Ok(CompoundStrategy::TaggedHead { offset }),
            Some(HeadField::Direct { offset }) => {
                match (pageflags.get("PG_compound"), pageflags.get("PG_reclaim")) {
                    (Some(&c), Some(&r)) => Ok(CompoundStrategy::FlagCombo { mask: (1 << c) | (1 << r), offset }),
                    _ => Err(ModelError::unsupported(PAGE, "first_page without PG_compound/PG_reclaim")),
                }
            }
            None => Err(ModelError::unsupported(PAGE, "no PG_tail, compound_head or first_page")),
        }
    }

    fn select_buddy(reader: &Reader<'_>, pageflags: &HashMap<String, u32>) -> Result<BuddyTest, ModelError> {
        if let Some(&b) = pageflags.get("PG_buddy") {
            return Ok(BuddyTest::Flag { mask: 1 << b });
        }
        if let Ok(f) = reader.member(PAGE, "page_type") {
            let constant = |name: &str, default: u32| {
                reader.constant(name).and_then(|v| u32::try_from(v).ok()).unwrap_or(default)
            };
            return Ok(BuddyTest::PageType {
                offset: f.offset,
                base: constant("PAGE_TYPE_BASE", DEFAULT_PAGE_TYPE_BASE),
                buddy: constant("PG_buddy", DEFAULT_PG_BUDDY_TYPE),
            });
        }
        if let Ok(f) = reader.member(PAGE, "_mapcount") {
            return Ok(BuddyTest::Mapcount { offset: f.offset });
        }
        Err(ModelError::unsupported(PAGE, "no PG_buddy, page_type or _mapcount"))
    }

    fn section_size_bits(reader: &Reader<'_>, notes: &mut Vec<Finding>) -> i64 {
        reader.constant("SECTION_SIZE_BITS").unwrap_or_else(|| {
            notes.push(Finding::config_default("SECTION_SIZE_BITS", DEFAULT_SECTION_SIZE_BITS));
            DEFAULT_SECTION_SIZE_BITS
        })
    }

    fn select_memory_model(
        reader: &Reader<'_>,
        config: &KernelConfig,
        notes: &mut Vec<Finding>,
    ) -> Result<MemoryModel, ModelError> {
        let vmemmap = || match reader.symbol("vmemmap_base").and_then(|s| reader.read_ptr(s)) {
            Ok(base) => base,
            Err(_) => DEFAULT_VMEMMAP_BASE,
        };

        let sparse = config.enabled("SPARSEMEM") == Some(true) && config.enabled("SPARSEMEM_VMEMMAP") == Some(false);
        if config.enabled("SPARSEMEM_VMEMMAP") == Some(true) || (!sparse && reader.has_symbol("vmemmap_base")) {
            return Ok(MemoryModel::Dense { base: vmemmap() });
        }

        if sparse {
            let mem_section = reader.symbol("mem_section")?;
            let section_size = reader.size_of("struct mem_section")?;
            let extreme = config.enabled("SPARSEMEM_EXTREME") == Some(true);
            let sections_per_root = if extreme { reader.arch().page_size / section_size.max(1) } else { 1 };
            let section_bits = Self::section_size_bits(reader, notes);
            let last_bit = reader.constant("SECTION_MAP_LAST_BIT").unwrap_or_else(|| {
                notes.push(Finding::config_default("SECTION_MAP_LAST_BIT", DEFAULT_SECTION_MAP_LAST_BIT));
                DEFAULT_SECTION_MAP_LAST_BIT
            });
            let pfn_section_shift = u32::try_from(section_bits)
                .ok()
                .and_then(|b| b.checked_sub(reader.arch().page_shift))
                .ok_or_else(|| ModelError::unsupported("SECTION_SIZE_BITS", format!("{section_bits}")))?;
            return Ok(MemoryModel::Sparse {
                mem_section,
                extreme,
                pfn_section_shift,
                sections_per_root,
                section_size,
                map_offset: reader.offset_of("struct mem_section", "section_mem_map")?,
                map_mask: !((1u64 << last_bit.clamp(0, 63)) - 1),
            });
        }

        if let Ok(mem_map) = reader.symbol("mem_map") {
            return Ok(MemoryModel::Dense { base: reader.read_ptr(mem_map)? });
        }

        notes.push(Finding::config_default("memory model", format!("vmemmap at {DEFAULT_VMEMMAP_BASE:#x}")));
        Ok(MemoryModel::Dense { base: vmemmap() })
    }

    // ---- accessors -----------------------------------------------------------

    #[must_use]
    pub fn memory_model(&self) -> MemoryModel {
        self.memory
    }

    #[must_use]
    pub fn compound_strategy(&self) -> CompoundStrategy {
        self.compound
    }

    #[must_use]
    pub fn buddy_test(&self) -> BuddyTest {
        self.buddy
    }

    #[must_use]
    pub fn flag_layout(&self) -> FlagLayout {
        self.layout
    }

    #[must_use]
    pub fn struct_size(&self) -> u64 {
        self.struct_size
    }

    #[must_use]
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    #[must_use]
    pub fn max_pfn(&self) -> Option<u64> {
        self.max_pfn
    }

    /// Offset of `page->lru` (the buddy and pcp list linkage)
    ///
    /// # Errors
    /// Returns `FieldNotFound` if `struct page` has no `lru`
    pub fn lru_offset(&self) -> Result<u64, ModelError> {
        self.lru.map(|f| f.offset).ok_or_else(|| ModelError::unsupported(PAGE, "no lru member"))
    }

    /// Mask of a `PG_*` flag, if this kernel has it
    #[must_use]
    pub fn flag(&self, name: &str) -> Option<u64> {
        self.pageflags.get(name).map(|b| 1u64 << b)
    }

    /// Mask of every flag bit below `__NR_PAGEFLAGS`
    #[must_use]
    pub fn all_flags(&self) -> u64 {
        let n = self.nr_pageflags.unwrap_or_else(|| self.pageflags.values().max().map_or(0, |m| m + 1));
        if n >= 64 {
            u64::MAX
        } else {
            (1u64 << n) - 1
        }
    }

    // ---- translation ---------------------------------------------------------

    /// `struct page` address of a frame
    ///
    /// # Errors
    /// Returns `NotFound` beyond `max_pfn` or in an absent sparse section
    pub fn page_addr(&self, reader: &Reader<'_>, pfn: Pfn) -> Result<u64, ModelError> {
        if self.max_pfn.is_some_and(|max| pfn.0 >= max) {
            return Err(ModelError::NotFound(format!("{pfn} (beyond max_pfn)")));
        }
        let offset = pfn
            .0
            .checked_mul(self.struct_size)
            .ok_or_else(|| ModelError::NotFound(format!("{pfn} (beyond the address space)")))?;
        match self.memory {
            MemoryModel::Dense { base } => Ok(base.wrapping_add(offset)),
            MemoryModel::Sparse { .. } => {
                let map = self.section_map(reader, pfn.0)?;
                Ok(map.wrapping_add(offset))
            }
        }
    }

    /// Decoded `section_mem_map` covering `pfn`
    fn section_map(&self, reader: &Reader<'_>, pfn: u64) -> Result<u64, ModelError> {
        let MemoryModel::Sparse {
            mem_section,
            extreme,
            pfn_section_shift,
            sections_per_root,
            section_size,
            map_offset,
            map_mask,
        } = self.memory
        else {
            return Err(ModelError::unsupported("memory model", "not sparse"));
        };

        let (nr, root, offset) = MemoryModel::section_position(pfn_section_shift, sections_per_root, pfn);
        let section = if extreme {
            let root_ptr = reader.read_ptr(mem_section + root * reader.pointer_size())?;
            if root_ptr == 0 {
                return Err(ModelError::NotFound(format!("memory section {nr}")));
            }
            root_ptr + offset * section_size
        } else {
            mem_section + (root * sections_per_root + offset) * section_size
        };

        let map = reader.read_ptr(section + map_offset)? & map_mask;
        if map == 0 {
            return Err(ModelError::NotFound(format!("memory section {nr}")));
        }
        Ok(map)
    }

    /// Frame number of a `struct page` address
    ///
    /// # Errors
    /// Returns `NotFound` for addresses that are not descriptor-aligned or
    /// lie outside the descriptor table
    pub fn pfn_of_page(&self, reader: &Reader<'_>, addr: u64) -> Result<Pfn, ModelError> {
        let base = match self.memory {
            MemoryModel::Dense { base } => base,
            MemoryModel::Sparse { pfn_section_shift, .. } => {
                let flags = reader.read_uint(addr + self.flags.offset, self.flags.size)?;
                let nr = self.layout.section(flags);
                self.section_map(reader, nr << pfn_section_shift)?
            }
        };
        let delta = addr.wrapping_sub(base);
        if addr < base || delta % self.struct_size != 0 {
            return Err(ModelError::NotFound(format!("page descriptor {addr:#x}")));
        }
        Ok(Pfn(delta / self.struct_size))
    }

    /// Frame containing a direct-map linear address
    #[must_use]
    pub fn pfn_of_linear(&self, addr: u64) -> Option<Pfn> {
        (addr >= self.direct_map).then(|| Pfn((addr - self.direct_map) >> self.page_shift))
    }

    /// Direct-map linear address of a frame
    #[must_use]
    pub fn linear_of_pfn(&self, pfn: Pfn) -> u64 {
        self.direct_map.wrapping_add(pfn.0 << self.page_shift)
    }

    // ---- descriptors ---------------------------------------------------------

    /// Read the descriptor of a frame
    ///
    /// # Errors
    /// Returns `NotFound` or `UnreadableMemory`
    pub fn page(&self, reader: &Reader<'_>, pfn: Pfn) -> Result<Page<'_>, ModelError> {
        let addr = self.page_addr(reader, pfn)?;
        let raw = reader.read_struct(addr, PAGE)?;
        Ok(Page { model: self, pfn, raw })
    }

    /// Read the descriptor at a `struct page` address
    ///
    /// # Errors
    /// Returns `NotFound` or `UnreadableMemory`
    pub fn page_at(&self, reader: &Reader<'_>, addr: u64) -> Result<Page<'_>, ModelError> {
        let pfn = self.pfn_of_page(reader, addr)?;
        let raw = reader.read_struct(addr, PAGE)?;
        Ok(Page { model: self, pfn, raw })
    }

    /// Descriptor of the frame backing a direct-map address
    ///
    /// # Errors
    /// Returns `NotFound` for addresses below the direct map
    pub fn page_of_linear(&self, reader: &Reader<'_>, addr: u64) -> Result<Page<'_>, ModelError> {
        let pfn = self
            .pfn_of_linear(addr)
            .ok_or_else(|| ModelError::NotFound(format!("{addr:#x} is not a direct-map address")))?;
        self.page(reader, pfn)
    }

    /// Head of the compound page `page` belongs to; `page` itself if it is
    /// not a tail
    ///
    /// # Errors
    /// Returns an error if the head descriptor cannot be read
    pub fn compound_head<'p>(&'p self, reader: &Reader<'_>, page: Page<'p>) -> Result<Page<'p>, ModelError> {
        if !page.is_tail() {
            return Ok(page);
        }
        let head = match self.compound {
            CompoundStrategy::TailFlag { head: HeadField::Tagged { offset }, .. }
            | CompoundStrategy::TaggedHead { offset } => page.raw.uint(offset, 8) & !1,
            CompoundStrategy::TailFlag { head: HeadField::Direct { offset }, .. }
            | CompoundStrategy::FlagCombo { offset, .. } => page.raw.uint(offset, 8),
        };
        self.page_at(reader, head)
    }

    /// Resolve the head and verify it is not itself a tail
    ///
    /// # Errors
    /// Returns an error if the head descriptor cannot be read
    pub fn checked_compound_head<'p>(
        &'p self,
        reader: &Reader<'_>,
        page: Page<'p>,
        findings: &mut Vec<Finding>,
    ) -> Result<Page<'p>, ModelError> {
        let pfn = page.pfn;
        let head = self.compound_head(reader, page)?;
        if head.pfn != pfn && head.is_tail() {
            findings.push(Finding::TailOfTail { pfn, head: head.pfn });
        }
        Ok(head)
    }
}

/// One `struct page` as read from the image
#[derive(Debug, Clone)]
pub struct Page<'m> {
    model: &'m PageModel,
    pub pfn: Pfn,
    raw: StructBytes,
}

impl Page<'_> {
    #[must_use]
    pub fn addr(&self) -> u64 {
        self.raw.addr
    }

    #[must_use]
    pub fn flags(&self) -> u64 {
        self.raw.member(&self.model.flags)
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn refcount(&self) -> i64 {
        i64::from(self.raw.member(&self.model.refcount) as i32)
    }

    #[must_use]
    pub fn mapping(&self) -> u64 {
        self.raw.member(&self.model.mapping)
    }

    /// `page->private`; the buddy order of a free head page
    #[must_use]
    pub fn private(&self) -> u64 {
        self.model.private.map_or(0, |f| self.raw.member(&f))
    }

    #[must_use]
    pub fn slab_cache(&self) -> u64 {
        self.raw.member(&self.model.slab_cache)
    }

    #[must_use]
    pub fn slab_page(&self) -> u64 {
        self.raw.member(&self.model.slab_page)
    }

    /// Raw member by offset and size, for engines with their own layouts
    #[must_use]
    pub fn member(&self, field: &FieldLayout) -> u64 {
        self.raw.member(field)
    }

    #[must_use]
    pub fn nid(&self) -> NodeId {
        self.model.layout.nid(self.flags())
    }

    #[must_use]
    pub fn zid(&self) -> ZoneId {
        self.model.layout.zid(self.flags())
    }

    fn has_flag(&self, name: &str) -> bool {
        self.model.flag(name).is_some_and(|mask| self.flags() & mask != 0)
    }

    #[must_use]
    pub fn is_slab(&self) -> bool {
        self.has_flag("PG_slab")
    }

    #[must_use]
    pub fn is_lru(&self) -> bool {
        self.has_flag("PG_lru")
    }

    #[must_use]
    pub fn is_tail(&self) -> bool {
        match self.model.compound {
            CompoundStrategy::TailFlag { tail, .. } => self.flags() & tail != 0,
            CompoundStrategy::TaggedHead { offset } => self.raw.uint(offset, 8) & 1 != 0,
            CompoundStrategy::FlagCombo { mask, .. } => self.flags() & mask == mask,
        }
    }

    #[must_use]
    pub fn is_head(&self) -> bool {
        if self.model.flag("PG_head").is_some() {
            return self.has_flag("PG_head");
        }
        self.has_flag("PG_compound") && !self.is_tail()
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn is_buddy(&self) -> bool {
        match self.model.buddy {
            BuddyTest::Flag { mask } => self.flags() & mask != 0,
            BuddyTest::PageType { offset, base, buddy } => {
                let page_type = self.raw.uint(offset, 4) as u32;
                page_type & (base | buddy) == base
            }
            BuddyTest::Mapcount { offset } => self.raw.uint(offset, 4) as i32 == BUDDY_MAPCOUNT,
        }
    }

    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.mapping() & PAGE_MAPPING_ANON != 0
    }

    /// Decoded view for reports
    #[must_use]
    pub fn summary(&self) -> PageSummary {
        PageSummary {
            pfn: self.pfn,
            addr: self.addr(),
            linear: self.model.linear_of_pfn(self.pfn),
            flags: self.flags(),
            node: self.nid(),
            zone: self.zid(),
            refcount: self.refcount(),
            mapping: self.mapping(),
            private: self.private(),
            slab: self.is_slab(),
            lru: self.is_lru(),
            head: self.is_head(),
            tail: self.is_tail(),
            buddy: self.is_buddy(),
            anonymous: self.is_anonymous(),
        }
    }
}

/// Serializable decoded page
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct PageSummary {
    pub pfn: Pfn,
    pub addr: u64,
    pub linear: u64,
    pub flags: u64,
    pub node: NodeId,
    pub zone: ZoneId,
    pub refcount: i64,
    pub mapping: u64,
    pub private: u64,
    pub slab: bool,
    pub lru: bool,
    pub head: bool,
    pub tail: bool,
    pub buddy: bool,
    pub anonymous: bool,
}
