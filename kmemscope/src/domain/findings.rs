//! Typed diagnostics produced by the consistency checks
//!
//! Every check returns a `Vec<Finding>`; an empty list means the structure
//! was consistent. Findings are values, not errors: a check records them and
//! moves on to the next sibling structure. The caller (CLI, test harness)
//! decides whether to render, export or assert on them.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

use super::errors::{AccessError, ListError};
use super::types::{CpuId, NodeId, Pfn, ZoneId};

/// Coarse classification of a finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// An address or symbol has no mapping (expected, not exceptional)
    NotFound,
    /// A broken invariant, cycle or duplicate entry
    Corruption,
    /// None of the known kernel ABI shapes matched
    UnsupportedLayout,
    /// The memory access boundary failed for a path
    UnreadableMemory,
    /// A documented default was substituted for missing configuration
    ConfigurationUnavailable,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Category::NotFound => "not found",
            Category::Corruption => "corruption",
            Category::UnsupportedLayout => "unsupported layout",
            Category::UnreadableMemory => "unreadable memory",
            Category::ConfigurationUnavailable => "configuration unavailable",
        };
        f.write_str(s)
    }
}

/// Direction of a `list_head` traversal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Forward,
    Reverse,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Forward => "forward",
            Direction::Reverse => "reverse",
        })
    }
}

/// The three per-node slab lists of a cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlabList {
    Partial,
    Full,
    Free,
}

impl SlabList {
    pub const ALL: [SlabList; 3] = [SlabList::Partial, SlabList::Full, SlabList::Free];

    /// Does a slab with `free` free objects out of `capacity` belong on this list?
    #[must_use]
    pub fn accepts(self, free: u32, capacity: u32) -> bool {
        match self {
            SlabList::Full => free == 0,
            SlabList::Partial => free > 0 && free < capacity,
            SlabList::Free => free == capacity,
        }
    }
}

impl fmt::Display for SlabList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SlabList::Partial => "partial",
            SlabList::Full => "full",
            SlabList::Free => "free",
        })
    }
}

/// Where an array-cache entry was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArrayCacheOrigin {
    PerCpu { cpu: CpuId },
    Shared { node: NodeId },
    /// Objects freed on `source` whose home is `target`
    Alien { source: NodeId, target: NodeId },
}

impl fmt::Display for ArrayCacheOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArrayCacheOrigin::PerCpu { cpu } => write!(f, "per-cpu {cpu}"),
            ArrayCacheOrigin::Shared { node } => write!(f, "shared {node}"),
            ArrayCacheOrigin::Alien { source, target } => write!(f, "alien {source}->{target}"),
        }
    }
}

/// A free-page bucket of a zone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FreeArea {
    Buddy { order: u32 },
    Pcp { cpu: CpuId },
}

impl fmt::Display for FreeArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FreeArea::Buddy { order } => write!(f, "free area order {order}"),
            FreeArea::Pcp { cpu } => write!(f, "pcplist {cpu}"),
        }
    }
}

/// What is wrong with a page found on a free list
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PageProblem {
    NonZeroRefcount { refcount: i64 },
    NotBuddy,
    UnexpectedBuddy,
    WrongOrder { expected: u64, found: u64 },
    NonZeroMapping { mapping: u64 },
    DisallowedFlags { flags: u64 },
}

impl fmt::Display for PageProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageProblem::NonZeroRefcount { refcount } => write!(f, "refcount {refcount}"),
            PageProblem::NotBuddy => f.write_str("not marked buddy"),
            PageProblem::UnexpectedBuddy => f.write_str("unexpectedly marked buddy"),
            PageProblem::WrongOrder { expected, found } => {
                write!(f, "order {found}, expected {expected}")
            }
            PageProblem::NonZeroMapping { mapping } => write!(f, "mapping {mapping:#x}"),
            PageProblem::DisallowedFlags { flags } => write!(f, "disallowed flags {flags:#x}"),
        }
    }
}

/// One typed diagnostic
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Finding {
    // ---- not found -------------------------------------------------------
    #[error("{what} not found")]
    Missing { what: String },

    // ---- corruption ------------------------------------------------------
    #[error("{context}: list {head:#x} {direction} walk failed: {error}{}", recovery_note(.recovered))]
    ListCorruption {
        context: String,
        head: u64,
        direction: Direction,
        error: ListError,
        recovered: bool,
    },

    #[error("{cache}: slab {slab:#x} inuse+free != capacity: {inuse}+{free} != {capacity}")]
    InuseFreeMismatch { cache: String, slab: u64, inuse: u32, free: u32, capacity: u32 },

    #[error("{cache}: slab {slab:#x} lists free object {obj:#x} more than once")]
    DuplicateFreeObject { cache: String, slab: u64, obj: u64 },

    #[error("{cache}: slab {slab:#x} free index {index} out of range (capacity {capacity})")]
    BadFreeIndex { cache: String, slab: u64, index: u32, capacity: u32 },

    #[error("{cache}: {node} {list} list has {count} misplaced slab(s) {first:#x}..{last:#x} with {free_min}..={free_max} free objects")]
    SlabListRun {
        cache: String,
        node: NodeId,
        list: SlabList,
        first: u64,
        last: u64,
        count: usize,
        free_min: u32,
        free_max: u32,
    },

    #[error("{cache}: object {obj:#x} of slab {slab:#x} sits on page {page:#x} which is not a slab page")]
    ObjectPageNotSlab { cache: String, slab: u64, obj: u64, page: u64 },

    #[error("{cache}: object {obj:#x} of slab {slab:#x} sits on page {page:#x} owned by cache {found:#x}, expected {expected:#x}")]
    ObjectPageWrongCache { cache: String, slab: u64, obj: u64, page: u64, found: u64, expected: u64 },

    #[error("{cache}: object {obj:#x} sits on page {page:#x} owned by slab {found:#x}, expected {slab:#x}")]
    ObjectPageWrongSlab { cache: String, slab: u64, obj: u64, page: u64, found: u64 },

    #[error("{cache}: off-slab metadata {meta:#x} of slab {slab:#x} {problem}")]
    OffSlabMetadata { cache: String, slab: u64, meta: u64, problem: String },

    #[error("{cache}: {node} {counter} is {declared}, lists hold {counted}")]
    SlabCounterMismatch { cache: String, node: NodeId, counter: String, declared: u64, counted: u64 },

    #[error("{cache}: array cache entry {obj:#x} ({origin}) is also free in its slab")]
    ArrayCacheObjectFree { cache: String, obj: u64, origin: ArrayCacheOrigin },

    #[error("{cache}: array cache entry {obj:#x} ({origin}) {reason}")]
    ArrayCacheForeignObject { cache: String, obj: u64, origin: ArrayCacheOrigin, reason: String },

    #[error("{cache}: {obj:#x} present in both {first} and {second} array caches")]
    DuplicateArrayCacheEntry { cache: String, obj: u64, first: ArrayCacheOrigin, second: ArrayCacheOrigin },

    #[error("{cache}: array cache {addr:#x} ({origin}) avail {avail} exceeds limit {limit}")]
    ArrayCacheOverflow { cache: String, addr: u64, origin: ArrayCacheOrigin, avail: u32, limit: u32 },

    #[error("{node} {zone} {area}: counted {counted} pages, declared {declared}")]
    FreeCountMismatch { node: NodeId, zone: ZoneId, area: FreeArea, counted: u64, declared: u64 },

    #[error("{node} {zone} {area}: page {pfn} {problem}")]
    FreePageState { node: NodeId, zone: ZoneId, area: FreeArea, pfn: Pfn, problem: PageProblem },

    #[error("{node} {zone} {area}: page {pfn} has flags for {page_node} {page_zone}")]
    MisplacedPage { node: NodeId, zone: ZoneId, area: FreeArea, pfn: Pfn, page_node: NodeId, page_zone: ZoneId },

    #[error("tail page {pfn} resolves to head {head} which is itself a tail")]
    TailOfTail { pfn: Pfn, head: Pfn },

    #[error("{what} at {addr:#x}: {detail}")]
    Corrupted { what: String, addr: u64, detail: String },

    // ---- unsupported -----------------------------------------------------
    #[error("unsupported layout for {what}: {detail}")]
    UnsupportedLayout { what: String, detail: String },

    // ---- unreadable ------------------------------------------------------
    #[error("{context}: {error}")]
    Unreadable { context: String, error: AccessError },

    // ---- configuration ---------------------------------------------------
    #[error("{item} unavailable, using {default}")]
    ConfigurationUnavailable { item: String, default: String },
}

fn recovery_note(recovered: &bool) -> &'static str {
    if *recovered {
        " (list recovered by reverse walk)"
    } else {
        ""
    }
}

impl Finding {
    #[must_use]
    pub fn category(&self) -> Category {
        match self {
            Finding::Missing { .. } => Category::NotFound,
            Finding::UnsupportedLayout { .. } => Category::UnsupportedLayout,
            Finding::Unreadable { error, .. }
            | Finding::ListCorruption { error: ListError::Unreadable(error), .. } => {
                if error.is_not_found() {
                    Category::NotFound
                } else {
                    Category::UnreadableMemory
                }
            }
            Finding::ConfigurationUnavailable { .. } => Category::ConfigurationUnavailable,
            _ => Category::Corruption,
        }
    }

    /// Convert an error that aborted one unit of work into a finding
    pub fn from_error(context: impl Into<String>, err: crate::domain::ModelError) -> Self {
        use crate::domain::ModelError;

        match err {
            ModelError::Access(error) => Finding::Unreadable { context: context.into(), error },
            ModelError::NotFound(what) => Finding::Missing { what },
            ModelError::UnsupportedLayout { what, detail } => {
                Finding::UnsupportedLayout { what, detail }
            }
            ModelError::Corruption { what, addr, detail } => {
                Finding::Corrupted { what, addr, detail }
            }
        }
    }

    pub(crate) fn config_default(item: impl Into<String>, default: impl fmt::Display) -> Self {
        Finding::ConfigurationUnavailable { item: item.into(), default: default.to_string() }
    }
}
