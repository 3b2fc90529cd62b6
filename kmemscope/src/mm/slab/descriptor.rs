use serde::Serialize;
use std::cell::OnceCell;
use std::collections::BTreeSet;

use super::array_cache::ArrayCacheMap;
use super::cache::{CacheCatalog, KmemCache};
use super::layout::SlabFormat;
use super::SlabEnv;
use crate::domain::{ArrayCacheOrigin, Finding, ModelError};

/// `BUFCTL_END`: terminator of the `kmem_bufctl_t` free chain
pub const BUFCTL_END: u64 = 0xffff_ffff;

/// What `contains_obj` found at an address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObjectStatus {
    /// Not inside this slab's object area
    OutOfRange,
    /// Inside the slot starting at `slot`, but not at its start
    Misaligned { slot: u64 },
    /// On the slab's own free list
    Free,
    /// Freed into an array cache, not yet returned to the slab
    ArrayCached { origin: ArrayCacheOrigin },
    Allocated,
}

/// Contents of a slab descriptor with the free set recomputed from it
#[derive(Debug, Clone)]
pub struct SlabState {
    /// First object
    pub s_mem: u64,
    pub inuse: u32,
    /// Off-slab metadata address: the index array or the `struct slab`
    pub meta: u64,
    pub free: BTreeSet<u64>,
    /// Problems met while reconstructing `free`
    pub findings: Vec<Finding>,
}

/// One slab of a cache
///
/// The free set is recomputed the first time it is needed and cached on
/// this instance only.
#[derive(Debug, Clone)]
pub struct Slab {
    pub addr: u64,
    pub cache: u64,
    cache_name: String,
    num: u32,
    object_size: u64,
    state: OnceCell<SlabState>,
}

impl Slab {
    #[must_use]
    pub fn new(cache: &KmemCache, addr: u64) -> Self {
        Self {
            addr,
            cache: cache.addr,
            cache_name: cache.name.clone(),
            num: cache.num,
            object_size: cache.object_size,
            state: OnceCell::new(),
        }
    }

    /// The cache and slab owning a direct-map object address
    ///
    /// # Errors
    /// Returns `NotFound` if the page is not a slab page or its cache is not
    /// in the catalog
    pub fn for_object<'c>(
        env: &SlabEnv<'_, '_>,
        catalog: &'c CacheCatalog,
        addr: u64,
    ) -> Result<(&'c KmemCache, Slab), ModelError> {
        let page = env.pages.page_of_linear(env.reader, addr)?;
        let head = env.pages.compound_head(env.reader, page)?;
        if !head.is_slab() {
            return Err(ModelError::NotFound(format!("slab page for {addr:#x}")));
        }
        let cache = catalog
            .by_addr(head.slab_cache())
            .ok_or_else(|| ModelError::NotFound(format!("kmem_cache {:#x}", head.slab_cache())))?;
        let slab = match env.layout.format {
            SlabFormat::PageEmbedded { .. } => head.addr(),
            SlabFormat::StructSlab { .. } => head.slab_page(),
        };
        Ok((cache, Slab::new(cache, slab)))
    }

    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.num
    }

    #[must_use]
    pub fn object_size(&self) -> u64 {
        self.object_size
    }

    /// Read the descriptor and rebuild the free set, once
    ///
    /// # Errors
    /// Returns an error if the descriptor itself cannot be read; damage
    /// inside the free list is recorded in [`SlabState::findings`]
    pub fn state(&self, env: &SlabEnv<'_, '_>) -> Result<&SlabState, ModelError> {
        if let Some(state) = self.state.get() {
            return Ok(state);
        }
        let state = self.reconstruct(env)?;
        Ok(self.state.get_or_init(|| state))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn reconstruct(&self, env: &SlabEnv<'_, '_>) -> Result<SlabState, ModelError> {
        let reader = env.reader;
        let mut free = FreeSetBuilder::new(self);

        let (s_mem, inuse, meta) = match env.layout.format {
            SlabFormat::PageEmbedded { s_mem, freelist, active, index_size, .. } => {
                let page = env.pages.page_at(reader, self.addr)?;
                let s_mem = page.member(&s_mem);
                let freelist = page.member(&freelist);
                let active = page.member(&active) as u32;
                for i in active..self.num {
                    let index = reader.read_uint(freelist + u64::from(i) * index_size, index_size)?;
                    free.add(s_mem, index);
                }
                (s_mem, active, freelist)
            }
            SlabFormat::StructSlab { size, s_mem, inuse, free: first, bufctl_size, .. } => {
                let raw = reader.read_struct(self.addr, super::layout::SLAB)?;
                let s_mem = raw.member(&s_mem);
                let bufctl = self.addr + size;
                let mut index = raw.member(&first);
                // a chain longer than the slab must revisit an entry
                for _ in 0..=self.num {
                    if index == BUFCTL_END || !free.add(s_mem, index) {
                        break;
                    }
                    index = reader.read_uint(bufctl + index * bufctl_size, bufctl_size)?;
                }
                (s_mem, raw.member(&inuse) as u32, self.addr)
            }
        };

        log::debug!("{}: slab {:#x} inuse {inuse}, {} free", self.cache_name, self.addr, free.objects.len());
        Ok(SlabState { s_mem, inuse, meta, free: free.objects, findings: free.findings })
    }

    /// Classify `addr` against this slab
    ///
    /// # Errors
    /// Returns an error if the descriptor cannot be read
    pub fn contains_obj(
        &self,
        env: &SlabEnv<'_, '_>,
        addr: u64,
        array_caches: Option<&ArrayCacheMap>,
    ) -> Result<ObjectStatus, ModelError> {
        let state = self.state(env)?;
        let end = state.s_mem + u64::from(self.num) * self.object_size;
        if addr < state.s_mem || addr >= end || self.object_size == 0 {
            return Ok(ObjectStatus::OutOfRange);
        }
        let offset = addr - state.s_mem;
        if offset % self.object_size != 0 {
            return Ok(ObjectStatus::Misaligned { slot: addr - offset % self.object_size });
        }
        if state.free.contains(&addr) {
            return Ok(ObjectStatus::Free);
        }
        if let Some(origin) = array_caches.and_then(|ac| ac.get(addr)) {
            return Ok(ObjectStatus::ArrayCached { origin });
        }
        Ok(ObjectStatus::Allocated)
    }

    /// Address of every object slot
    pub fn objects(&self, s_mem: u64) -> impl Iterator<Item = u64> + '_ {
        (0..u64::from(self.num)).map(move |i| s_mem + i * self.object_size)
    }

    pub(crate) fn cache_name(&self) -> &str {
        &self.cache_name
    }
}

struct FreeSetBuilder<'s> {
    slab: &'s Slab,
    objects: BTreeSet<u64>,
    findings: Vec<Finding>,
}

impl<'s> FreeSetBuilder<'s> {
    fn new(slab: &'s Slab) -> Self {
        Self { slab, objects: BTreeSet::new(), findings: Vec::new() }
    }

    /// Record free index `index`; false once the list is unusable
    #[allow(clippy::cast_possible_truncation)]
    fn add(&mut self, s_mem: u64, index: u64) -> bool {
        let slab = self.slab;
        if index >= u64::from(slab.num) {
            self.findings.push(Finding::BadFreeIndex {
                cache: slab.cache_name.clone(),
                slab: slab.addr,
                index: index as u32,
                capacity: slab.num,
            });
            return false;
        }
        let obj = s_mem + index * slab.object_size;
        if !self.objects.insert(obj) {
            self.findings.push(Finding::DuplicateFreeObject {
                cache: slab.cache_name.clone(),
                slab: slab.addr,
                obj,
            });
            return false;
        }
        true
    }
}
