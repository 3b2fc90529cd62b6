//! # SLAB Allocator Model
//!
//! Reconstructs caches, slabs and array caches of the SLAB allocator and
//! checks them against each other.
//!
//! ```text
//! slab_caches ──► kmem_cache ──┬─► cpu_cache / array[cpu] ──► array_cache { avail, limit, entry[] }
//!                              └─► node[nid] ──► kmem_cache_node
//!                                                 ├─ slabs_partial ─┐
//!                                                 ├─ slabs_full    ─┼─► slab descriptors
//!                                                 ├─ slabs_free    ─┘
//!                                                 ├─ shared ──► array_cache
//!                                                 └─ alien[nid] ──► array_cache
//! ```
//!
//! Two descriptor formats are understood: the descriptor embedded in the
//! head `struct page` with a `freelist_idx_t` index array, and the older
//! separate `struct slab` with a `kmem_bufctl_t` chain. The format and all
//! member-name variants are resolved once into a [`SlabLayout`].
//!
//! Checks never stop at the first problem. A slab that cannot be read is
//! reported and the walk moves on to the next one.

pub mod array_cache;
pub mod cache;
pub mod check;
pub mod descriptor;
pub mod layout;

pub use array_cache::ArrayCacheMap;
pub use cache::{CacheCatalog, KmemCache};
pub use check::{check_array_caches, check_cache, check_slab, find_object, ObjectLookup, RunTracker};
pub use descriptor::{ObjectStatus, Slab, SlabState, BUFCTL_END};
pub use layout::{CpuCacheRef, SlabFormat, SlabLayout};

use super::page::PageModel;
use crate::kernel::{NodeTopology, PerCpu};
use crate::memory::Reader;

/// Everything the slab engine reads through
#[derive(Clone, Copy)]
pub struct SlabEnv<'a, 'm> {
    pub reader: &'a Reader<'m>,
    pub pages: &'a PageModel,
    pub layout: &'a SlabLayout,
    pub cpus: &'a PerCpu,
    pub nodes: &'a NodeTopology,
}
