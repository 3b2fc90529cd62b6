//! Synthetic two-node x86-64 kernel for integration tests
//!
//! Layout summary:
//! - globals and every static kernel object live in one region bumped from
//!   `GLOBALS`
//! - `struct page` array at the default vmemmap base, `NR_PAGES` frames
//! - direct map at the default `page_offset_base`
//! - SLAB with separate `struct slab` descriptors and `kmem_bufctl_t` chains,
//!   or with [`Kernel::page_embedded`] descriptors inside `struct page` and
//!   a byte-wide `freelist_idx_t` array in front of the objects
//! - zones with two migrate types, three orders and one CPU

#![allow(dead_code)]

use kmemscope::domain::{NodeId, ZoneId};
use kmemscope::kernel::config::ConfigSource;
use kmemscope::kernel::KernelConfig;
use kmemscope::memory::{ArchInfo, SparseImage, TypeLayout};
use kmemscope::mm::FlagLayout;
use kmemscope::session::Session;

pub const GLOBALS: u64 = 0xffff_ffff_8200_0000;
const GLOBALS_SIZE: usize = 0x4_0000;
pub const VMEMMAP: u64 = 0xffff_ea00_0000_0000;
pub const DIRECT: u64 = 0xffff_8880_0000_0000;
pub const NR_PAGES: u64 = 64;
pub const PAGE_SIZE: u64 = 4096;

pub const TEXT: u64 = 0xffff_ffff_8100_0000;

// struct page
pub const PAGE_STRUCT: u64 = 64;
const PAGE_LRU: u64 = 8;
const PAGE_MAPPING: u64 = 24;
const PAGE_PRIVATE: u64 = 40;
const PAGE_TYPE: u64 = 48;
const PAGE_REFCOUNT: u64 = 52;
// page-embedded slab descriptor
pub const PAGE_SLAB_CACHE: u64 = 24;
const PAGE_FREELIST: u64 = 32;
const PAGE_S_MEM: u64 = 40;
const PAGE_ACTIVE: u64 = 56;

pub const PG_LOCKED: u32 = 0;
pub const PG_LRU: u32 = 4;
pub const PG_SLAB: u32 = 7;
pub const PG_HEAD: u32 = 16;

/// `page_type` of a free buddy page (type bits clear for the set type)
pub const PAGE_TYPE_BUDDY: u32 = 0xffff_ff7f;
const PAGE_TYPE_NONE: u32 = 0xffff_ffff;

// struct kmem_cache
const CACHE_SIZE: u64 = 0x100;
const CACHE_CPU_CACHE: u64 = 0;
const CACHE_NUM: u64 = 8;
const CACHE_OBJSIZE: u64 = 12;
const CACHE_ORDER: u64 = 16;
const CACHE_FLAGS: u64 = 24;
const CACHE_NAME: u64 = 32;
const CACHE_LIST: u64 = 40;
const CACHE_NODE: u64 = 64;

// struct kmem_cache_node
const KNODE_SIZE: u64 = 0x80;
pub const KNODE_PARTIAL: u64 = 0;
pub const KNODE_FULL: u64 = 16;
pub const KNODE_FREE: u64 = 32;
pub const KNODE_FREE_OBJECTS: u64 = 48;
const KNODE_TOTAL_SLABS: u64 = 56;
const KNODE_FREE_SLABS: u64 = 64;
const KNODE_SHARED: u64 = 72;
const KNODE_ALIEN: u64 = 80;

// struct array_cache, struct alien_cache
const AC_ENTRY: u64 = 16;
const AC_LIMIT: u32 = 16;
const ALIEN_AC: u64 = 8;

// struct slab
pub const SLAB_DESC: u64 = 48;
const SLAB_S_MEM: u64 = 24;
const SLAB_INUSE: u64 = 32;
const SLAB_FREE: u64 = 36;
const BUFCTL_END: u32 = 0xffff_ffff;

// zones
pub const NR_ZONES: u32 = 4;
pub const ZONE_NORMAL: u32 = 2;
const ZONE_SIZE: u64 = 0x100;
const ZONE_PRESENT: u64 = 0;
const ZONE_NAME: u64 = 8;
pub const ZONE_PAGESET: u64 = 16;
const ZONE_VM_STAT: u64 = 24;
const ZONE_FREE_AREA: u64 = 64;
pub const MAX_ORDER: u64 = 3;
pub const MIGRATE_TYPES: u64 = 2;
const FREE_AREA_SIZE: u64 = 40;
const FREE_AREA_NR_FREE: u64 = 32;
const PCP_COUNT: u64 = 0;
const PCP_LISTS: u64 = 16;
const PCP_SIZE: u64 = 48;
const PAGESET_DIFF: u64 = 64;
const PAGESET_SIZE: u64 = 80;
pub const VM_STAT_ITEMS: u64 = 4;
const PGDAT_SIZE: u64 = 0x500;

// stack depot
const RECORD_COUNT: u64 = 8;
const RECORD_HANDLE: u64 = 12;
const RECORD_ENTRIES: u64 = 16;

fn page_layout() -> TypeLayout {
    TypeLayout::new(PAGE_STRUCT)
        .field("flags", 0, 8)
        .field("lru", PAGE_LRU, 16)
        .field("compound_head", PAGE_LRU, 8)
        .field("mapping", PAGE_MAPPING, 8)
        .field("private", PAGE_PRIVATE, 8)
        .field("page_type", PAGE_TYPE, 4)
        .field("_mapcount", PAGE_TYPE, 4)
        .field("_refcount", PAGE_REFCOUNT, 4)
}

pub fn flag_layout() -> FlagLayout {
    FlagLayout { bits_per_long: 64, sections_width: 0, nodes_width: 6, zones_width: 2 }
}

/// `page->flags` for a page of `node`/`zone` with the given `PG_*` bits
pub fn page_flags(node: u32, zone: u32, bits: &[u32]) -> u64 {
    bits.iter().fold(flag_layout().encode(NodeId(node), ZoneId(zone)), |acc, b| acc | (1u64 << b))
}

pub fn page_addr(pfn: u64) -> u64 {
    VMEMMAP + pfn * PAGE_STRUCT
}

pub fn linear(pfn: u64) -> u64 {
    DIRECT + pfn * PAGE_SIZE
}

/// Addresses of one cache fixture
#[derive(Debug, Clone, Copy)]
pub struct CacheFixture {
    pub addr: u64,
    pub nodes: [u64; 2],
    pub cpu_ac: u64,
    pub object_size: u64,
    pub num: u32,
}

impl CacheFixture {
    pub fn list_head(&self, node: usize, offset: u64) -> u64 {
        self.nodes[node] + offset
    }
}

/// Addresses of one on-slab `struct slab`
#[derive(Debug, Clone, Copy)]
pub struct SlabFixture {
    pub addr: u64,
    /// Offset of the slab list linkage inside the descriptor
    pub link: u64,
    pub pfn: u64,
    pub s_mem: u64,
    pub object_size: u64,
}

impl SlabFixture {
    pub fn object(&self, index: u32) -> u64 {
        self.s_mem + u64::from(index) * self.object_size
    }
}

pub struct Kernel {
    pub image: SparseImage,
    bump: u64,
    slab_caches: u64,
    caches: Vec<u64>,
    pub pgdat: [u64; 2],
}

impl Kernel {
    pub fn new() -> Self {
        let mut image = SparseImage::new(ArchInfo::x86_64());
        image.map(GLOBALS, GLOBALS_SIZE);
        image.map(VMEMMAP, (NR_PAGES * PAGE_STRUCT) as usize);
        image.map(DIRECT, (NR_PAGES * PAGE_SIZE) as usize);

        let mut kernel = Self { image, bump: GLOBALS, slab_caches: 0, caches: Vec::new(), pgdat: [0; 2] };
        kernel.define_types();
        kernel.define_globals();
        kernel
    }

    fn define_types(&mut self) {
        let img = &mut self.image;
        img.define_type("struct list_head", TypeLayout::new(16).field("next", 0, 8).field("prev", 8, 8));
        img.define_type("struct page", page_layout());
        img.define_type(
            "enum pageflags",
            TypeLayout::new(4)
                .enumerator("PG_locked", i64::from(PG_LOCKED))
                .enumerator("PG_referenced", 2)
                .enumerator("PG_lru", i64::from(PG_LRU))
                .enumerator("PG_active", 6)
                .enumerator("PG_slab", i64::from(PG_SLAB))
                .enumerator("PG_reserved", 10)
                .enumerator("PG_private", 11)
                .enumerator("PG_writeback", 13)
                .enumerator("PG_head", i64::from(PG_HEAD))
                .enumerator("__NR_PAGEFLAGS", 22),
        );
        img.define_type(
            "enum zone_type",
            TypeLayout::new(4)
                .enumerator("ZONE_DMA", 0)
                .enumerator("ZONE_DMA32", 1)
                .enumerator("ZONE_NORMAL", 2)
                .enumerator("ZONE_MOVABLE", 3)
                .enumerator("__MAX_NR_ZONES", i64::from(NR_ZONES)),
        );

        img.define_type("nodemask_t", TypeLayout::new(8));
        img.define_type("enum node_states", TypeLayout::new(4).enumerator("N_POSSIBLE", 0));

        img.define_type(
            "struct kmem_cache",
            TypeLayout::new(CACHE_SIZE)
                .field("cpu_cache", CACHE_CPU_CACHE, 8)
                .field("num", CACHE_NUM, 4)
                .field("size", CACHE_OBJSIZE, 4)
                .field("gfporder", CACHE_ORDER, 4)
                .field("flags", CACHE_FLAGS, 8)
                .field("name", CACHE_NAME, 8)
                .field("list", CACHE_LIST, 16)
                .field("freelist_cache", 56, 8)
                .field("node", CACHE_NODE, 16),
        );
        img.define_type(
            "struct kmem_cache_node",
            TypeLayout::new(KNODE_SIZE)
                .field("slabs_partial", KNODE_PARTIAL, 16)
                .field("slabs_full", KNODE_FULL, 16)
                .field("slabs_free", KNODE_FREE, 16)
                .field("free_objects", KNODE_FREE_OBJECTS, 8)
                .field("total_slabs", KNODE_TOTAL_SLABS, 8)
                .field("free_slabs", KNODE_FREE_SLABS, 8)
                .field("shared", KNODE_SHARED, 8)
                .field("alien", KNODE_ALIEN, 8),
        );
        img.define_type(
            "struct array_cache",
            TypeLayout::new(AC_ENTRY)
                .field("avail", 0, 4)
                .field("limit", 4, 4)
                .field("batchcount", 8, 4)
                .field("touched", 12, 4)
                .field("entry", AC_ENTRY, 0),
        );
        img.define_type(
            "struct alien_cache",
            TypeLayout::new(ALIEN_AC + AC_ENTRY).field("lock", 0, 4).field("ac", ALIEN_AC, AC_ENTRY),
        );
        img.define_type(
            "struct slab",
            TypeLayout::new(SLAB_DESC)
                .field("list", 0, 16)
                .field("colouroff", 16, 8)
                .field("s_mem", SLAB_S_MEM, 8)
                .field("inuse", SLAB_INUSE, 4)
                .field("free", SLAB_FREE, 4)
                .field("nodeid", 40, 2),
        );
        img.define_type("kmem_bufctl_t", TypeLayout::new(4));

        img.define_type(
            "struct pglist_data",
            TypeLayout::new(PGDAT_SIZE).field("node_zones", 0, ZONE_SIZE * u64::from(NR_ZONES)),
        );
        img.define_type(
            "struct zone",
            TypeLayout::new(ZONE_SIZE)
                .field("present_pages", ZONE_PRESENT, 8)
                .field("name", ZONE_NAME, 8)
                .field("pageset", ZONE_PAGESET, 8)
                .field("vm_stat", ZONE_VM_STAT, VM_STAT_ITEMS * 8)
                .field("free_area", ZONE_FREE_AREA, MAX_ORDER * FREE_AREA_SIZE),
        );
        img.define_type(
            "struct free_area",
            TypeLayout::new(FREE_AREA_SIZE)
                .field("free_list", 0, MIGRATE_TYPES * 16)
                .field("nr_free", FREE_AREA_NR_FREE, 8),
        );
        img.define_type(
            "struct per_cpu_pages",
            TypeLayout::new(PCP_SIZE)
                .field("count", PCP_COUNT, 4)
                .field("high", 4, 4)
                .field("batch", 8, 4)
                .field("lists", PCP_LISTS, MIGRATE_TYPES * 16),
        );
        img.define_type(
            "struct per_cpu_pageset",
            TypeLayout::new(PAGESET_SIZE).field("pcp", 0, PCP_SIZE).field("vm_stat_diff", PAGESET_DIFF, VM_STAT_ITEMS),
        );
        // slot 3 has no enumerator
        img.define_type(
            "enum zone_stat_item",
            TypeLayout::new(4)
                .enumerator("NR_FREE_PAGES", 0)
                .enumerator("NR_ZONE_INACTIVE_ANON", 1)
                .enumerator("NR_ZONE_ACTIVE_ANON", 2)
                .enumerator("NR_VM_ZONE_STAT_ITEMS", 4),
        );

        img.define_type(
            "struct stack_record",
            TypeLayout::new(RECORD_ENTRIES)
                .field("next", 0, 8)
                .field("size", RECORD_COUNT, 4)
                .field("handle", RECORD_HANDLE, 4)
                .field("entries", RECORD_ENTRIES, 0),
        );
    }

    fn define_globals(&mut self) {
        let vmemmap_base = self.alloc(8);
        self.w64(vmemmap_base, VMEMMAP);
        self.image.define_symbol("vmemmap_base", vmemmap_base);

        let page_offset_base = self.alloc(8);
        self.w64(page_offset_base, DIRECT);
        self.image.define_symbol("page_offset_base", page_offset_base);

        let max_pfn = self.alloc(8);
        self.w64(max_pfn, NR_PAGES);
        self.image.define_symbol("max_pfn", max_pfn);

        // every descriptor starts out as an ordinary node 0 page
        for pfn in 0..NR_PAGES {
            self.set_page(pfn, page_flags(0, ZONE_NORMAL, &[]));
        }

        let node_states = self.alloc(8);
        self.w64(node_states, 0b11);
        self.image.define_symbol("node_states", node_states);
        let node_data = self.alloc(16);
        self.image.define_symbol("node_data", node_data);
        for nid in 0..2u64 {
            let pgdat = self.alloc(PGDAT_SIZE);
            self.w64(node_data + nid * 8, pgdat);
            self.pgdat[nid as usize] = pgdat;
        }

        self.slab_caches = self.alloc(16);
        self.write_list(self.slab_caches, &[]);
        self.image.define_symbol("slab_caches", self.slab_caches);
    }

    /// A kernel whose slab descriptors live in the head `struct page`
    pub fn page_embedded() -> Self {
        let mut kernel = Self::new();
        kernel.image.define_type(
            "struct page",
            page_layout()
                .field("slab_list", PAGE_LRU, 16)
                .field("slab_cache", PAGE_SLAB_CACHE, 8)
                .field("freelist", PAGE_FREELIST, 8)
                .field("s_mem", PAGE_S_MEM, 8)
                .field("active", PAGE_ACTIVE, 4),
        );
        kernel
    }

    /// Bump-allocate `size` zeroed bytes, 64-byte aligned
    pub fn alloc(&mut self, size: u64) -> u64 {
        let addr = self.bump;
        self.bump += size.div_ceil(64).max(1) * 64;
        assert!(self.bump <= GLOBALS + GLOBALS_SIZE as u64, "fixture region exhausted");
        addr
    }

    pub fn w64(&mut self, addr: u64, value: u64) {
        self.image.write_u64(addr, value).unwrap();
    }

    pub fn w32(&mut self, addr: u64, value: u32) {
        self.image.write_u32(addr, value).unwrap();
    }

    pub fn string(&mut self, s: &str) -> u64 {
        let addr = self.alloc(s.len() as u64 + 1);
        self.image.write(addr, s.as_bytes()).unwrap();
        addr
    }

    /// Link `nodes` into a circular list hanging off `head`
    pub fn write_list(&mut self, head: u64, nodes: &[u64]) {
        let mut all = vec![head];
        all.extend_from_slice(nodes);
        for (i, &node) in all.iter().enumerate() {
            let next = all[(i + 1) % all.len()];
            let prev = all[(i + all.len() - 1) % all.len()];
            self.w64(node, next);
            self.w64(node + 8, prev);
        }
    }

    // ---- pages ---------------------------------------------------------------

    /// Reset the descriptor of `pfn` to a plain page with `flags`
    pub fn set_page(&mut self, pfn: u64, flags: u64) {
        let page = page_addr(pfn);
        self.image.write(page, &[0u8; PAGE_STRUCT as usize]).unwrap();
        self.w64(page, flags);
        self.w32(page + PAGE_TYPE, PAGE_TYPE_NONE);
        self.w32(page + PAGE_REFCOUNT, 1);
    }

    pub fn set_refcount(&mut self, pfn: u64, refcount: u32) {
        self.w32(page_addr(pfn) + PAGE_REFCOUNT, refcount);
    }

    pub fn set_mapping(&mut self, pfn: u64, mapping: u64) {
        self.w64(page_addr(pfn) + PAGE_MAPPING, mapping);
    }

    /// Make `pfn` a tail page of `head`
    pub fn set_tail(&mut self, pfn: u64, head: u64) {
        self.w64(page_addr(pfn) + PAGE_LRU, page_addr(head) | 1);
    }

    /// A free buddy page: zero refcount, buddy type, order in `private`
    pub fn set_buddy(&mut self, pfn: u64, order: u64) {
        let page = page_addr(pfn);
        self.w32(page + PAGE_TYPE, PAGE_TYPE_BUDDY);
        self.w32(page + PAGE_REFCOUNT, 0);
        self.w64(page + PAGE_PRIVATE, order);
    }

    pub fn lru(pfn: u64) -> u64 {
        page_addr(pfn) + PAGE_LRU
    }

    // ---- slab ----------------------------------------------------------------

    /// A cache with one `kmem_cache_node` per node and an empty per-CPU
    /// array cache; appended to `slab_caches`
    pub fn add_cache(&mut self, name: &str, object_size: u64, num: u32) -> CacheFixture {
        let addr = self.alloc(CACHE_SIZE);
        let name_ptr = self.string(name);
        self.w64(addr + CACHE_NAME, name_ptr);
        self.w32(addr + CACHE_NUM, num);
        self.w32(addr + CACHE_OBJSIZE, u32::try_from(object_size).unwrap());

        let cpu_ac = self.array_cache(&[]);
        self.w64(addr + CACHE_CPU_CACHE, cpu_ac);

        let mut nodes = [0u64; 2];
        for (nid, node) in nodes.iter_mut().enumerate() {
            *node = self.alloc(KNODE_SIZE);
            for list in [KNODE_PARTIAL, KNODE_FULL, KNODE_FREE] {
                self.write_list(*node + list, &[]);
            }
            self.w64(addr + CACHE_NODE + nid as u64 * 8, *node);
        }

        self.caches.push(addr + CACHE_LIST);
        let caches = self.caches.clone();
        self.write_list(self.slab_caches, &caches);
        CacheFixture { addr, nodes, cpu_ac, object_size, num }
    }

    /// An `array_cache` holding `entries`
    pub fn array_cache(&mut self, entries: &[u64]) -> u64 {
        let ac = self.alloc(AC_ENTRY + u64::from(AC_LIMIT) * 8);
        self.fill_array_cache(ac, entries);
        ac
    }

    pub fn fill_array_cache(&mut self, ac: u64, entries: &[u64]) {
        self.w32(ac, u32::try_from(entries.len()).unwrap());
        self.w32(ac + 4, AC_LIMIT);
        for (i, &obj) in entries.iter().enumerate() {
            self.w64(ac + AC_ENTRY + i as u64 * 8, obj);
        }
    }

    pub fn set_shared(&mut self, cache: &CacheFixture, node: usize, entries: &[u64]) {
        let ac = self.array_cache(entries);
        self.w64(cache.nodes[node] + KNODE_SHARED, ac);
    }

    /// Give `node` of `cache` an alien array: slot `target` holds `entries`
    pub fn set_alien(&mut self, cache: &CacheFixture, node: usize, target: usize, entries: &[u64]) {
        let mut array = self.image_read_ptr(cache.nodes[node] + KNODE_ALIEN);
        if array == 0 {
            array = self.alloc(16);
            self.w64(cache.nodes[node] + KNODE_ALIEN, array);
        }
        let alien = self.alloc(ALIEN_AC + AC_ENTRY + u64::from(AC_LIMIT) * 8);
        self.fill_array_cache(alien + ALIEN_AC, entries);
        self.w64(array + target as u64 * 8, alien);
    }

    fn image_read_ptr(&self, addr: u64) -> u64 {
        use kmemscope::memory::MemoryAccess;
        let mut buf = [0u8; 8];
        self.image.read_bytes(addr, &mut buf).unwrap();
        u64::from_le_bytes(buf)
    }

    /// An on-slab `struct slab` in frame `pfn` whose free chain is `free`
    /// (object indices, in chain order) and whose `inuse` is `inuse`
    pub fn add_slab(&mut self, cache: &CacheFixture, pfn: u64, free: &[u32], inuse: u32) -> SlabFixture {
        let addr = linear(pfn);
        let bufctl = addr + SLAB_DESC;
        let s_mem = (bufctl + u64::from(cache.num) * 4).next_multiple_of(64);
        assert!(s_mem + u64::from(cache.num) * cache.object_size <= addr + PAGE_SIZE);

        self.w64(addr + SLAB_S_MEM, s_mem);
        self.w32(addr + SLAB_INUSE, inuse);
        self.set_free_chain(addr, free);

        let page = page_addr(pfn);
        self.w64(page, page_flags(0, ZONE_NORMAL, &[PG_SLAB]));
        self.w64(page + PAGE_LRU, cache.addr);
        self.w64(page + PAGE_LRU + 8, addr);

        SlabFixture { addr, link: 0, pfn, s_mem, object_size: cache.object_size }
    }

    /// A slab described by the `struct page` of `pfn`; the index array sits
    /// at the start of the frame and `free` fills `freelist[active..num]`
    pub fn add_embedded_slab(&mut self, cache: &CacheFixture, pfn: u64, free: &[u8]) -> SlabFixture {
        let freelist = linear(pfn);
        let s_mem = (freelist + u64::from(cache.num)).next_multiple_of(64);
        let active = cache.num - u32::try_from(free.len()).unwrap();
        self.image.write(freelist + u64::from(active), free).unwrap();

        let page = page_addr(pfn);
        self.w64(page, page_flags(0, ZONE_NORMAL, &[PG_SLAB]));
        self.w64(page + PAGE_SLAB_CACHE, cache.addr);
        self.w64(page + PAGE_FREELIST, freelist);
        self.w64(page + PAGE_S_MEM, s_mem);
        self.w32(page + PAGE_ACTIVE, active);

        SlabFixture { addr: page, link: PAGE_LRU, pfn, s_mem, object_size: cache.object_size }
    }

    /// Turn `pages` frames from `head` into a compound slab page
    pub fn set_compound_slab(&mut self, head: u64, pages: u64) {
        self.w64(page_addr(head), page_flags(0, ZONE_NORMAL, &[PG_SLAB, PG_HEAD]));
        for pfn in head + 1..head + pages {
            self.set_tail(pfn, head);
        }
    }

    /// Rewrite the `kmem_bufctl_t` chain of a slab
    pub fn set_free_chain(&mut self, slab: u64, free: &[u32]) {
        let bufctl = slab + SLAB_DESC;
        self.w32(slab + SLAB_FREE, free.first().copied().unwrap_or(BUFCTL_END));
        for pair in free.windows(2) {
            self.w32(bufctl + u64::from(pair[0]) * 4, pair[1]);
        }
        if let Some(&last) = free.last() {
            self.w32(bufctl + u64::from(last) * 4, BUFCTL_END);
        }
    }

    /// Put `slabs` on one list of `node` and set the node counters
    pub fn set_slab_list(&mut self, cache: &CacheFixture, node: usize, list: u64, slabs: &[SlabFixture], free_objects: u64) {
        let addrs: Vec<u64> = slabs.iter().map(|s| s.addr + s.link).collect();
        self.write_list(cache.nodes[node] + list, &addrs);
        self.w64(cache.nodes[node] + KNODE_FREE_OBJECTS, free_objects);
        self.w64(cache.nodes[node] + KNODE_TOTAL_SLABS, slabs.len() as u64);
    }

    // ---- zones ---------------------------------------------------------------

    pub fn zone_addr(&self, node: usize, zid: u32) -> u64 {
        self.pgdat[node] + u64::from(zid) * ZONE_SIZE
    }

    /// Populate a zone: name, present pages, empty free lists and a pageset
    /// with empty pcp lists
    pub fn add_zone(&mut self, node: usize, zid: u32, name: &str, present: u64) -> u64 {
        let zone = self.zone_addr(node, zid);
        let name_ptr = self.string(name);
        self.w64(zone + ZONE_PRESENT, present);
        self.w64(zone + ZONE_NAME, name_ptr);
        for order in 0..MAX_ORDER {
            for mt in 0..MIGRATE_TYPES {
                self.write_list(self.free_list(zone, order, mt), &[]);
            }
        }
        let pageset = self.alloc(PAGESET_SIZE);
        for mt in 0..MIGRATE_TYPES {
            self.write_list(pageset + PCP_LISTS + mt * 16, &[]);
        }
        self.w64(zone + ZONE_PAGESET, pageset);
        zone
    }

    pub fn free_list(&self, zone: u64, order: u64, mt: u64) -> u64 {
        zone + ZONE_FREE_AREA + order * FREE_AREA_SIZE + mt * 16
    }

    pub fn set_nr_free(&mut self, zone: u64, order: u64, nr_free: u64) {
        self.w64(zone + ZONE_FREE_AREA + order * FREE_AREA_SIZE + FREE_AREA_NR_FREE, nr_free);
    }

    /// Link buddy pages of `order` onto one free list, marking each free
    pub fn set_free_pages(&mut self, zone: u64, order: u64, mt: u64, pfns: &[u64]) {
        for &pfn in pfns {
            self.set_buddy(pfn, order);
        }
        let nodes: Vec<u64> = pfns.iter().map(|&p| Self::lru(p)).collect();
        self.write_list(self.free_list(zone, order, mt), &nodes);
    }

    fn pageset(&self, zone: u64) -> u64 {
        self.image_read_ptr(zone + ZONE_PAGESET)
    }

    /// Link pages onto the CPU 0 pcp list `mt` and set its count
    pub fn set_pcp_pages(&mut self, zone: u64, mt: u64, pfns: &[u64], count: u32) {
        let pageset = self.pageset(zone);
        for &pfn in pfns {
            self.set_refcount(pfn, 0);
        }
        let nodes: Vec<u64> = pfns.iter().map(|&p| Self::lru(p)).collect();
        self.write_list(pageset + PCP_LISTS + mt * 16, &nodes);
        self.w32(pageset + PCP_COUNT, count);
    }

    pub fn set_vm_stat(&mut self, zone: u64, values: &[i64], diffs: &[i8]) {
        for (i, &v) in values.iter().enumerate() {
            self.w64(zone + ZONE_VM_STAT + i as u64 * 8, v as u64);
        }
        let pageset = self.pageset(zone);
        let bytes: Vec<u8> = diffs.iter().map(|&d| d as u8).collect();
        self.image.write(pageset + PAGESET_DIFF, &bytes).unwrap();
    }

    // ---- stack depot ---------------------------------------------------------

    /// A depot with one pool holding one record at `offset`; returns the
    /// record's handle under the default x86-64 geometry
    pub fn add_stack(&mut self, pool_index: u32, offset: u64, entries: &[u64]) -> u32 {
        let pools = self.alloc(8 * u64::from(pool_index + 1));
        self.image.define_symbol("stack_pools", pools);
        let pool = self.alloc(offset + RECORD_ENTRIES + entries.len() as u64 * 8);
        self.w64(pools + u64::from(pool_index) * 8, pool);

        let record = pool + offset;
        self.w32(record + RECORD_COUNT, u32::try_from(entries.len()).unwrap());
        for (i, &e) in entries.iter().enumerate() {
            self.w64(record + RECORD_ENTRIES + i as u64 * 8, e);
        }
        // index | offset/16 << 21 | valid
        pool_index | (u32::try_from(offset >> 4).unwrap() << 21) | (1 << 31)
    }

    // ---- session -------------------------------------------------------------

    pub fn config() -> KernelConfig {
        KernelConfig::parse(
            "CONFIG_SLAB=y\nCONFIG_NUMA=y\nCONFIG_NODES_SHIFT=6\nCONFIG_SPARSEMEM=y\nCONFIG_SPARSEMEM_VMEMMAP=y\n",
            ConfigSource::File("test.config".into()),
        )
    }

    pub fn session(&self) -> Session<'_> {
        Session::new(&self.image, Some(Self::config()))
    }
}
