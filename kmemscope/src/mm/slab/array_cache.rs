use std::collections::HashMap;

use super::cache::KmemCache;
use super::layout::CpuCacheRef;
use super::SlabEnv;
use crate::domain::{ArrayCacheOrigin, Finding, ModelError};

/// `SLAB_OBJ_PFMEMALLOC` is stored in bit 0 of array cache entries
const PFMEMALLOC_TAG: u64 = 1;

/// Every object sitting in one of a cache's array caches
#[derive(Debug, Clone, Default)]
pub struct ArrayCacheMap {
    entries: HashMap<u64, ArrayCacheOrigin>,
    findings: Vec<Finding>,
}

impl ArrayCacheMap {
    /// Merge per-CPU, shared and alien array caches of `cache`
    ///
    /// Null shared or alien pointers are normal (single-node systems, caches
    /// without sharing). An alien slot for the node it belongs to is skipped.
    #[must_use]
    pub fn build(env: &SlabEnv<'_, '_>, cache: &KmemCache) -> Self {
        let mut map = Self::default();
        let reader = env.reader;
        let ptr = reader.pointer_size();

        for cpu in env.cpus.cpus() {
            let ac = match env.layout.cache.cpu_cache {
                CpuCacheRef::PerCpuPointer { .. } => env.cpus.ptr(cache.cpu_caches, cpu),
                CpuCacheRef::PointerArray { .. } => {
                    reader.read_ptr(cache.cpu_caches + u64::from(cpu.0) * ptr).ok().filter(|&p| p != 0)
                }
            };
            if let Some(ac) = ac {
                map.collect(env, cache, ac, ArrayCacheOrigin::PerCpu { cpu });
            }
        }

        for (nid, node) in cache.node_ptrs(reader, env.layout, env.nodes) {
            match reader.read_ptr(node + env.layout.node.shared) {
                Ok(0) => {}
                Ok(shared) => map.collect(env, cache, shared, ArrayCacheOrigin::Shared { node: nid }),
                Err(err) => map.unreadable(cache, "shared array cache", err.into()),
            }

            let alien = match reader.read_ptr(node + env.layout.node.alien) {
                Ok(0) => continue,
                Ok(alien) => alien,
                Err(err) => {
                    map.unreadable(cache, "alien array caches", err.into());
                    continue;
                }
            };
            for target in env.nodes.ids() {
                if target == nid {
                    continue;
                }
                match reader.read_ptr(alien + u64::from(target.0) * ptr) {
                    Ok(0) => {}
                    Ok(slot) => map.collect(
                        env,
                        cache,
                        slot + env.layout.array.alien_ac,
                        ArrayCacheOrigin::Alien { source: nid, target },
                    ),
                    Err(err) => map.unreadable(cache, "alien array cache", err.into()),
                }
            }
        }

        log::debug!("{}: {} objects in array caches", cache.name, map.entries.len());
        map
    }

    fn unreadable(&mut self, cache: &KmemCache, what: &str, err: ModelError) {
        self.findings.push(Finding::from_error(format!("{}: {what}", cache.name), err));
    }

    #[allow(clippy::cast_possible_truncation)]
    fn collect(&mut self, env: &SlabEnv<'_, '_>, cache: &KmemCache, addr: u64, origin: ArrayCacheOrigin) {
        let reader = env.reader;
        let layout = &env.layout.array;
        let header = layout.avail.offset.max(layout.limit.offset) + layout.avail.size.max(layout.limit.size);
        let raw = match reader.read_vec(addr, header as usize) {
            Ok(raw) => raw,
            Err(err) => return self.unreadable(cache, &format!("array cache {addr:#x} ({origin})"), err.into()),
        };
        let field = |f: &crate::memory::FieldLayout| {
            let start = f.offset as usize;
            reader.decode(&raw[start..start + f.size as usize])
        };
        let mut avail = field(&layout.avail) as u32;
        let limit = field(&layout.limit) as u32;

        if avail > limit {
            self.findings.push(Finding::ArrayCacheOverflow { cache: cache.name.clone(), addr, origin, avail, limit });
            avail = limit;
        }

        let ptr = reader.pointer_size();
        for i in 0..u64::from(avail) {
            let obj = match reader.read_ptr(addr + layout.entry + i * ptr) {
                Ok(obj) => obj & !PFMEMALLOC_TAG,
                Err(err) => return self.unreadable(cache, &format!("array cache {addr:#x} ({origin})"), err.into()),
            };
            if obj == 0 {
                continue;
            }
            if let Some(&first) = self.entries.get(&obj) {
                self.findings.push(Finding::DuplicateArrayCacheEntry {
                    cache: cache.name.clone(),
                    obj,
                    first,
                    second: origin,
                });
                continue;
            }
            self.entries.insert(obj, origin);
        }
    }

    #[must_use]
    pub fn get(&self, obj: u64) -> Option<ArrayCacheOrigin> {
        self.entries.get(&obj).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, ArrayCacheOrigin)> + '_ {
        self.entries.iter().map(|(&addr, &origin)| (addr, origin))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Overflows, duplicates and unreadable caches met while merging
    #[must_use]
    pub fn findings(&self) -> &[Finding] {
        &self.findings
    }

    pub(crate) fn into_findings(self) -> Vec<Finding> {
        self.findings
    }
}
