use serde::Serialize;

use crate::domain::ModelError;
use crate::memory::{FieldLayout, Reader};

/// `CFLGS_OFF_SLAB`: slab management lives in a separate cache
const DEFAULT_OFF_SLAB_FLAG: u64 = 0x8000_0000;

/// `SLAB_OBJ_MIN_SIZE` bound used to size `freelist_idx_t`
const SLAB_OBJ_MIN_SIZE: u64 = 16;

pub(crate) const CACHE: &str = "struct kmem_cache";
pub(crate) const ARRAY_CACHE: &str = "struct array_cache";
pub(crate) const SLAB: &str = "struct slab";
pub(crate) const PAGE: &str = "struct page";

/// Where a cache keeps its per-CPU array caches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CpuCacheRef {
    /// `cpu_cache`: a `__percpu` pointer to one `array_cache` per CPU
    PerCpuPointer { offset: u64 },
    /// `array[NR_CPUS]`: plain pointers indexed by CPU id
    PointerArray { offset: u64 },
}

/// How slab descriptors and their free lists are stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SlabFormat {
    /// Descriptor embedded in the head `struct page`; the free objects are
    /// the indices `freelist[active..num]`
    PageEmbedded { s_mem: FieldLayout, freelist: FieldLayout, active: FieldLayout, link: u64, index_size: u64 },
    /// Separate `struct slab` followed by a `kmem_bufctl_t` array chaining
    /// the free objects from `slab->free` to `BUFCTL_END`
    StructSlab {
        size: u64,
        s_mem: FieldLayout,
        inuse: FieldLayout,
        free: FieldLayout,
        link: u64,
        bufctl_size: u64,
    },
}

impl SlabFormat {
    /// Offset of the list linkage inside the descriptor
    #[must_use]
    pub fn link(&self) -> u64 {
        match self {
            SlabFormat::PageEmbedded { link, .. } | SlabFormat::StructSlab { link, .. } => *link,
        }
    }

    #[must_use]
    pub fn descriptor_type(&self) -> &'static str {
        match self {
            SlabFormat::PageEmbedded { .. } => PAGE,
            SlabFormat::StructSlab { .. } => SLAB,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheLayout {
    pub name: u64,
    pub num: FieldLayout,
    pub size: FieldLayout,
    pub gfporder: FieldLayout,
    pub flags: FieldLayout,
    pub list: u64,
    pub cpu_cache: CpuCacheRef,
    pub node: u64,
    pub freelist_cache: Option<FieldLayout>,
}

/// Per-node slab bookkeeping (`kmem_cache_node`, formerly `kmem_list3`)
#[derive(Debug, Clone, Copy, Serialize)]
pub struct NodeLayout {
    pub ty: &'static str,
    pub partial: u64,
    pub full: u64,
    pub free: u64,
    pub free_objects: FieldLayout,
    pub total_slabs: Option<FieldLayout>,
    pub free_slabs: Option<FieldLayout>,
    pub shared: u64,
    pub alien: u64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ArrayCacheLayout {
    pub avail: FieldLayout,
    pub limit: FieldLayout,
    pub entry: u64,
    /// Offset of the `array_cache` inside an alien slot
    pub alien_ac: u64,
}

/// Every slab-allocator layout decision, made once per session
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SlabLayout {
    pub cache_list: u64,
    pub cache: CacheLayout,
    pub node: NodeLayout,
    pub array: ArrayCacheLayout,
    pub format: SlabFormat,
    pub off_slab_flag: u64,
}

impl SlabLayout {
    /// Resolve member-name variants and the slab format
    ///
    /// # Errors
    /// Returns `NotFound` if the kernel has no SLAB cache list,
    /// `UnsupportedLayout` if neither slab format matches, or a lookup error
    pub fn resolve(reader: &Reader<'_>) -> Result<Self, ModelError> {
        let (list_symbol, cache_list) = reader
            .symbol_variant(&["slab_caches", "cache_chain"])
            .map_err(|_| ModelError::NotFound("slab cache list".to_string()))?;

        let (cpu_name, cpu_field) = reader.member_variant(CACHE, &["cpu_cache", "array"])?;
        let cpu_cache = match cpu_name {
            "cpu_cache" => CpuCacheRef::PerCpuPointer { offset: cpu_field.offset },
            _ => CpuCacheRef::PointerArray { offset: cpu_field.offset },
        };

        let cache = CacheLayout {
            name: reader.offset_of(CACHE, "name")?,
            num: reader.member(CACHE, "num")?,
            size: reader.member_variant(CACHE, &["size", "buffer_size"])?.1,
            gfporder: reader.member(CACHE, "gfporder")?,
            flags: reader.member(CACHE, "flags")?,
            list: reader.member_variant(CACHE, &["list", "next"])?.1.offset,
            cpu_cache,
            node: reader.member_variant(CACHE, &["node", "nodelists"])?.1.offset,
            freelist_cache: reader.member_variant(CACHE, &["freelist_cache", "slabp_cache"]).ok().map(|(_, f)| f),
        };

        let node_ty = reader.type_variant(&["struct kmem_cache_node", "struct kmem_list3"])?;
        let node = NodeLayout {
            ty: node_ty,
            partial: reader.offset_of(node_ty, "slabs_partial")?,
            full: reader.offset_of(node_ty, "slabs_full")?,
            free: reader.offset_of(node_ty, "slabs_free")?,
            free_objects: reader.member(node_ty, "free_objects")?,
            total_slabs: reader.member(node_ty, "total_slabs").ok(),
            free_slabs: reader.member(node_ty, "free_slabs").ok(),
            shared: reader.offset_of(node_ty, "shared")?,
            alien: reader.offset_of(node_ty, "alien")?,
        };

        let array = ArrayCacheLayout {
            avail: reader.member(ARRAY_CACHE, "avail")?,
            limit: reader.member(ARRAY_CACHE, "limit")?,
            entry: reader.offset_of(ARRAY_CACHE, "entry")?,
            alien_ac: reader.offset_of("struct alien_cache", "ac").unwrap_or(0),
        };

        let format = Self::select_format(reader)?;
        let off_slab_flag = reader
            .constant("CFLGS_OFF_SLAB")
            .and_then(|v| u64::try_from(v).ok())
            .unwrap_or(DEFAULT_OFF_SLAB_FLAG);

        log::info!("SLAB layout: cache list {list_symbol}, cpu caches {cpu_cache:?}, format {format:?}");
        Ok(Self { cache_list, cache, node, array, format, off_slab_flag })
    }

    fn select_format(reader: &Reader<'_>) -> Result<SlabFormat, ModelError> {
        if reader.has_member(PAGE, "s_mem") && reader.has_member(PAGE, "active") {
            let index_size = reader.size_of("freelist_idx_t").unwrap_or_else(|_| {
                if reader.arch().page_size >> 8 <= SLAB_OBJ_MIN_SIZE {
                    1
                } else {
                    2
                }
            });
            return Ok(SlabFormat::PageEmbedded {
                s_mem: reader.member(PAGE, "s_mem")?,
                freelist: reader.member(PAGE, "freelist")?,
                active: reader.member(PAGE, "active")?,
                link: reader.member_variant(PAGE, &["slab_list", "lru"])?.1.offset,
                index_size,
            });
        }
        if reader.has_type(SLAB) && reader.has_member(SLAB, "free") {
            return Ok(SlabFormat::StructSlab {
                size: reader.size_of(SLAB)?,
                s_mem: reader.member(SLAB, "s_mem")?,
                inuse: reader.member(SLAB, "inuse")?,
                free: reader.member(SLAB, "free")?,
                link: reader.offset_of(SLAB, "list")?,
                bufctl_size: reader.size_of("kmem_bufctl_t").unwrap_or(4),
            });
        }
        Err(ModelError::unsupported("slab descriptor", "neither page-embedded nor struct slab"))
    }
}
