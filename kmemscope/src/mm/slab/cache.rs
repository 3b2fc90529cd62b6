use serde::Serialize;
use std::collections::HashMap;

use super::layout::{CpuCacheRef, SlabLayout};
use super::descriptor::Slab;
use super::SlabEnv;
use crate::domain::{Finding, ModelError, NodeId, SlabList};
use crate::kernel::{walk_with_retry, NodeTopology, DEFAULT_LIST_LIMIT};
use crate::memory::{Reader, MAX_CSTRING};

/// One `struct kmem_cache`
#[derive(Debug, Clone, Serialize)]
pub struct KmemCache {
    pub addr: u64,
    pub name: String,
    /// Object stride (`size`, formerly `buffer_size`)
    pub object_size: u64,
    /// Objects per slab
    pub num: u32,
    pub order: u32,
    pub flags: u64,
    pub off_slab: bool,
    /// Cache holding off-slab descriptors, if any
    pub freelist_cache: u64,
    #[serde(skip)]
    pub(crate) cpu_caches: u64,
}

impl KmemCache {
    /// Read the cache descriptor at `addr`
    ///
    /// # Errors
    /// Returns `UnreadableMemory` if the descriptor or its name cannot be read
    #[allow(clippy::cast_possible_truncation)]
    pub fn read(reader: &Reader<'_>, layout: &SlabLayout, addr: u64) -> Result<Self, ModelError> {
        let c = &layout.cache;
        let raw = reader.read_struct(addr, super::layout::CACHE)?;
        let name_ptr = raw.uint(c.name, reader.pointer_size());
        let name = reader.read_cstring(name_ptr, MAX_CSTRING)?;
        let flags = raw.member(&c.flags);

        let cpu_caches = match c.cpu_cache {
            CpuCacheRef::PerCpuPointer { offset } => raw.uint(offset, reader.pointer_size()),
            CpuCacheRef::PointerArray { offset } => addr + offset,
        };

        Ok(Self {
            addr,
            name,
            object_size: raw.member(&c.size),
            num: raw.member(&c.num) as u32,
            order: raw.member(&c.gfporder) as u32,
            flags,
            off_slab: flags & layout.off_slab_flag != 0,
            freelist_cache: c.freelist_cache.map_or(0, |f| raw.member(&f)),
            cpu_caches,
        })
    }

    /// Bytes spanned by one slab
    #[must_use]
    pub fn slab_bytes(&self, page_size: u64) -> u64 {
        page_size << self.order
    }

    /// `kmem_cache_node` of every node that has one
    #[must_use]
    pub fn node_ptrs(&self, reader: &Reader<'_>, layout: &SlabLayout, nodes: &NodeTopology) -> Vec<(NodeId, u64)> {
        let base = self.addr + layout.cache.node;
        nodes
            .ids()
            .filter_map(|nid| {
                let ptr = reader.read_ptr(base + u64::from(nid.0) * reader.pointer_size()).ok()?;
                (ptr != 0).then_some((nid, ptr))
            })
            .collect()
    }

    /// Slabs on one per-node list, with the walk's findings
    pub fn slabs(&self, env: &SlabEnv<'_, '_>, node: u64, list: SlabList, findings: &mut Vec<Finding>) -> Vec<Slab> {
        let n = &env.layout.node;
        let head = node
            + match list {
                SlabList::Partial => n.partial,
                SlabList::Full => n.full,
                SlabList::Free => n.free,
            };
        let walk = walk_with_retry(env.reader, head, &format!("{} slabs_{list}", self.name), DEFAULT_LIST_LIMIT);
        findings.extend(walk.findings);

        let link = env.layout.format.link();
        walk.nodes.into_iter().map(|entry| Slab::new(self, entry - link)).collect()
    }
}

/// Every cache on the global list, indexed by name and by address
#[derive(Debug, Clone, Default)]
pub struct CacheCatalog {
    caches: Vec<KmemCache>,
    by_name: HashMap<String, usize>,
    by_addr: HashMap<u64, usize>,
    findings: Vec<Finding>,
}

impl CacheCatalog {
    /// Walk `slab_caches` once and read every descriptor on it
    ///
    /// A descriptor that cannot be read is reported and skipped.
    #[must_use]
    pub fn build(reader: &Reader<'_>, layout: &SlabLayout) -> Self {
        let walk = walk_with_retry(reader, layout.cache_list, "slab cache list", DEFAULT_LIST_LIMIT);
        let mut catalog = Self { findings: walk.findings, ..Self::default() };

        for entry in walk.nodes {
            let addr = entry - layout.cache.list;
            match KmemCache::read(reader, layout, addr) {
                Ok(cache) => catalog.insert(cache),
                Err(err) => catalog.findings.push(Finding::from_error(format!("kmem_cache {addr:#x}"), err)),
            }
        }

        log::info!("Cataloged {} slab caches", catalog.caches.len());
        catalog
    }

    fn insert(&mut self, cache: KmemCache) {
        let idx = self.caches.len();
        if self.by_name.insert(cache.name.clone(), idx).is_some() {
            log::debug!("Duplicate cache name {}", cache.name);
        }
        self.by_addr.insert(cache.addr, idx);
        self.caches.push(cache);
    }

    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<&KmemCache> {
        self.by_name.get(name).map(|&i| &self.caches[i])
    }

    #[must_use]
    pub fn by_addr(&self, addr: u64) -> Option<&KmemCache> {
        self.by_addr.get(&addr).map(|&i| &self.caches[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &KmemCache> {
        self.caches.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.caches.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }

    /// Problems met while building the catalog
    #[must_use]
    pub fn findings(&self) -> &[Finding] {
        &self.findings
    }
}
