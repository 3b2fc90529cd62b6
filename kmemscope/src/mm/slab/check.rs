use serde::Serialize;
use std::collections::{BTreeSet, HashMap};

use super::array_cache::ArrayCacheMap;
use super::cache::{CacheCatalog, KmemCache};
use super::descriptor::{ObjectStatus, Slab};
use super::layout::SlabFormat;
use super::SlabEnv;
use crate::domain::{Finding, ModelError, NodeId, Pfn, SlabList};

/// Collapses consecutive misplaced slabs of one list into a single finding
#[derive(Debug)]
pub struct RunTracker {
    cache: String,
    node: NodeId,
    list: SlabList,
    run: Option<Run>,
    good: usize,
}

#[derive(Debug, Clone, Copy)]
struct Run {
    first: u64,
    last: u64,
    count: usize,
    free_min: u32,
    free_max: u32,
}

impl RunTracker {
    #[must_use]
    pub fn new(cache: &str, node: NodeId, list: SlabList) -> Self {
        Self { cache: cache.to_string(), node, list, run: None, good: 0 }
    }

    /// Feed the next slab in list order
    pub fn observe(&mut self, slab: u64, free: u32, accepted: bool, findings: &mut Vec<Finding>) {
        if accepted {
            self.good += 1;
            self.flush(findings);
            return;
        }
        match &mut self.run {
            Some(run) => {
                run.last = slab;
                run.count += 1;
                run.free_min = run.free_min.min(free);
                run.free_max = run.free_max.max(free);
            }
            None => {
                self.run = Some(Run { first: slab, last: slab, count: 1, free_min: free, free_max: free });
            }
        }
    }

    fn flush(&mut self, findings: &mut Vec<Finding>) {
        if let Some(run) = self.run.take() {
            findings.push(Finding::SlabListRun {
                cache: self.cache.clone(),
                node: self.node,
                list: self.list,
                first: run.first,
                last: run.last,
                count: run.count,
                free_min: run.free_min,
                free_max: run.free_max,
            });
        }
    }

    pub fn finish(mut self, findings: &mut Vec<Finding>) {
        self.flush(findings);
        log::debug!("{} {} {}: {} slabs on the right list", self.cache, self.node, self.list, self.good);
    }
}

/// Check one slab; returns its free count when the descriptor was readable
///
/// Verifies `inuse + free == num`, that every page holding its objects is
/// a slab page of this cache and slab, and that off-slab metadata is a live
/// object of the metadata cache.
#[allow(clippy::cast_possible_truncation)]
pub fn check_slab(
    env: &SlabEnv<'_, '_>,
    catalog: &CacheCatalog,
    cache: &KmemCache,
    slab: &Slab,
    findings: &mut Vec<Finding>,
) -> Option<u32> {
    let state = match slab.state(env) {
        Ok(state) => state,
        Err(err) => {
            findings.push(Finding::from_error(format!("{}: slab {:#x}", cache.name, slab.addr), err));
            return None;
        }
    };
    findings.extend(state.findings.iter().cloned());

    let free = state.free.len() as u32;
    if state.inuse.checked_add(free) != Some(cache.num) {
        findings.push(Finding::InuseFreeMismatch {
            cache: cache.name.clone(),
            slab: slab.addr,
            inuse: state.inuse,
            free,
            capacity: cache.num,
        });
    }

    check_object_pages(env, cache, slab, state.s_mem, findings);

    if cache.off_slab {
        if let Some(problem) = off_slab_problem(env, catalog, cache, state.meta) {
            findings.push(Finding::OffSlabMetadata {
                cache: cache.name.clone(),
                slab: slab.addr,
                meta: state.meta,
                problem,
            });
        }
    }

    Some(free)
}

fn check_object_pages(env: &SlabEnv<'_, '_>, cache: &KmemCache, slab: &Slab, s_mem: u64, findings: &mut Vec<Finding>) {
    let mut seen: BTreeSet<Pfn> = BTreeSet::new();
    for obj in slab.objects(s_mem) {
        let Some(pfn) = env.pages.pfn_of_linear(obj) else {
            findings.push(Finding::Corrupted {
                what: format!("{} slab {:#x}", cache.name, slab.addr),
                addr: obj,
                detail: "object outside the direct map".to_string(),
            });
            return;
        };
        if !seen.insert(pfn) {
            continue;
        }

        let head = env
            .pages
            .page(env.reader, pfn)
            .and_then(|page| env.pages.compound_head(env.reader, page));
        let head = match head {
            Ok(head) => head,
            Err(err) => {
                findings.push(Finding::from_error(format!("{}: page of object {obj:#x}", cache.name), err));
                continue;
            }
        };

        if !head.is_slab() {
            findings.push(Finding::ObjectPageNotSlab {
                cache: cache.name.clone(),
                slab: slab.addr,
                obj,
                page: head.addr(),
            });
            continue;
        }
        if head.slab_cache() != cache.addr {
            findings.push(Finding::ObjectPageWrongCache {
                cache: cache.name.clone(),
                slab: slab.addr,
                obj,
                page: head.addr(),
                found: head.slab_cache(),
                expected: cache.addr,
            });
            continue;
        }
        let owner = match env.layout.format {
            SlabFormat::PageEmbedded { .. } => head.addr(),
            SlabFormat::StructSlab { .. } => head.slab_page(),
        };
        if owner != slab.addr {
            findings.push(Finding::ObjectPageWrongSlab {
                cache: cache.name.clone(),
                slab: slab.addr,
                obj,
                page: head.addr(),
                found: owner,
            });
        }
    }
}

fn off_slab_problem(env: &SlabEnv<'_, '_>, catalog: &CacheCatalog, cache: &KmemCache, meta: u64) -> Option<String> {
    let (meta_cache, meta_slab) = match Slab::for_object(env, catalog, meta) {
        Ok(found) => found,
        Err(err) => return Some(format!("is not a tracked slab object ({err})")),
    };
    if cache.freelist_cache != 0 && meta_cache.addr != cache.freelist_cache {
        return Some(format!("belongs to cache {}, expected {:#x}", meta_cache.name, cache.freelist_cache));
    }
    match meta_slab.contains_obj(env, meta, None) {
        Ok(ObjectStatus::Allocated) => None,
        Ok(ObjectStatus::Free) => Some(format!("is free in {}", meta_cache.name)),
        Ok(ObjectStatus::Misaligned { slot }) => Some(format!("is inside object {slot:#x}")),
        Ok(status) => Some(format!("is not allocated ({status:?})")),
        Err(err) => Some(format!("slab {:#x} unreadable ({err})", meta_slab.addr)),
    }
}

/// Full consistency check of one cache
///
/// Per node, every slab on the partial, full and free lists is checked and
/// the recounted free objects are compared with the node's counters. Then
/// every array-cache entry is validated against the slab owning it.
pub fn check_cache(env: &SlabEnv<'_, '_>, catalog: &CacheCatalog, cache: &KmemCache) -> Vec<Finding> {
    env.reader.begin_pass();
    let mut findings = Vec::new();
    let layout = &env.layout.node;

    for (nid, node) in cache.node_ptrs(env.reader, env.layout, env.nodes) {
        let mut counted_free = 0u64;
        let mut total_slabs = 0u64;
        let mut free_slabs = 0u64;

        for list in SlabList::ALL {
            let mut tracker = RunTracker::new(&cache.name, nid, list);
            for slab in cache.slabs(env, node, list, &mut findings) {
                total_slabs += 1;
                if list == SlabList::Free {
                    free_slabs += 1;
                }
                if let Some(free) = check_slab(env, catalog, cache, &slab, &mut findings) {
                    counted_free += u64::from(free);
                    tracker.observe(slab.addr, free, list.accepts(free, cache.num), &mut findings);
                }
            }
            tracker.finish(&mut findings);
        }

        let mut counter = |name: &str, field: Option<crate::memory::FieldLayout>, counted: u64| {
            let Some(field) = field else { return };
            match env.reader.read_uint(node + field.offset, field.size) {
                Ok(declared) if declared != counted => findings.push(Finding::SlabCounterMismatch {
                    cache: cache.name.clone(),
                    node: nid,
                    counter: name.to_string(),
                    declared,
                    counted,
                }),
                Ok(_) => {}
                Err(err) => findings.push(Finding::from_error(format!("{} {nid} {name}", cache.name), err.into())),
            }
        };
        counter("free_objects", Some(layout.free_objects), counted_free);
        counter("total_slabs", layout.total_slabs, total_slabs);
        counter("free_slabs", layout.free_slabs, free_slabs);
    }

    let array_caches = ArrayCacheMap::build(env, cache);
    check_array_caches(env, catalog, cache, &array_caches, &mut findings);
    findings.extend(array_caches.into_findings());
    findings
}

/// Each array-cache entry must be an allocated-looking object of `cache`
pub fn check_array_caches(
    env: &SlabEnv<'_, '_>,
    catalog: &CacheCatalog,
    cache: &KmemCache,
    array_caches: &ArrayCacheMap,
    findings: &mut Vec<Finding>,
) {
    let mut entries: Vec<_> = array_caches.iter().collect();
    entries.sort_unstable_by_key(|(addr, _)| *addr);
    let mut slabs: HashMap<u64, Slab> = HashMap::new();

    for (obj, origin) in entries {
        let foreign = |reason: String| Finding::ArrayCacheForeignObject {
            cache: cache.name.clone(),
            obj,
            origin,
            reason,
        };
        let slab = match Slab::for_object(env, catalog, obj) {
            Ok((owner, _)) if owner.addr != cache.addr => {
                findings.push(foreign(format!("belongs to cache {}", owner.name)));
                continue;
            }
            Ok((_, slab)) => slabs.entry(slab.addr).or_insert(slab),
            Err(err) => {
                findings.push(foreign(err.to_string()));
                continue;
            }
        };
        match slab.contains_obj(env, obj, None) {
            Ok(ObjectStatus::Allocated | ObjectStatus::ArrayCached { .. }) => {}
            Ok(ObjectStatus::Free) => {
                findings.push(Finding::ArrayCacheObjectFree { cache: cache.name.clone(), obj, origin });
            }
            Ok(ObjectStatus::Misaligned { slot }) => {
                findings.push(foreign(format!("is inside object {slot:#x}")));
            }
            Ok(ObjectStatus::OutOfRange) => {
                findings.push(foreign(format!("is outside slab {:#x}", slab.addr)));
            }
            Err(err) => findings.push(Finding::from_error(format!("{}: slab {:#x}", cache.name, slab.addr), err)),
        }
    }
}

/// Where an address lives in the slab allocator
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectLookup {
    pub addr: u64,
    pub cache: String,
    pub cache_addr: u64,
    pub slab: u64,
    /// Start of the object slot containing `addr`
    pub object: u64,
    pub status: ObjectStatus,
}

/// Resolve an address to its cache, slab, slot and allocation status
///
/// # Errors
/// Returns `NotFound` if the address is not in a slab page of a cataloged
/// cache, or an access error
pub fn find_object(env: &SlabEnv<'_, '_>, catalog: &CacheCatalog, addr: u64) -> Result<ObjectLookup, ModelError> {
    let (cache, slab) = Slab::for_object(env, catalog, addr)?;
    let array_caches = ArrayCacheMap::build(env, cache);
    let status = slab.contains_obj(env, addr, Some(&array_caches))?;
    let object = match status {
        ObjectStatus::Misaligned { slot } => slot,
        _ => addr,
    };
    Ok(ObjectLookup {
        addr,
        cache: slab.cache_name().to_string(),
        cache_addr: cache.addr,
        slab: slab.addr,
        object,
        status,
    })
}
