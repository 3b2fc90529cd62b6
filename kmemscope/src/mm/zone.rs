//! Zone free lists and per-CPU pagesets
//!
//! Every `(order, migratetype)` buddy list and every `(cpu, migratetype)`
//! pcp list is walked (forward, reverse once on damage), each page on it is
//! checked for the state a free page must be in, and the number of pages
//! found is compared with the zone's own counters.

use serde::Serialize;
use std::collections::BTreeMap;

use super::page::{Page, PageModel};
use crate::domain::{Finding, FreeArea, ModelError, NodeId, PageProblem, ZoneId};
use crate::kernel::{walk_with_retry, NodeTopology, PerCpu, DEFAULT_LIST_LIMIT};
use crate::memory::{FieldLayout, Reader, MAX_CSTRING};

const ZONE: &str = "struct zone";
const FREE_AREA: &str = "struct free_area";
const PCP: &str = "struct per_cpu_pages";
const LIST_HEAD: &str = "struct list_head";

const DEFAULT_MAX_ORDER: u64 = 11;

/// Filler for `vm_stat` slots without an enumerator
pub const UNKNOWN_STAT: &str = "__UNKNOWN__";

/// Flags that must be clear when a page is freed (`PAGE_FLAGS_CHECK_AT_FREE`)
const FLAGS_CHECK_AT_FREE: [&str; 10] = [
    "PG_lru",
    "PG_locked",
    "PG_private",
    "PG_private_2",
    "PG_writeback",
    "PG_reserved",
    "PG_slab",
    "PG_active",
    "PG_unevictable",
    "PG_mlocked",
];

/// Flags tolerated on a page about to be allocated
const FLAGS_ALLOWED_AT_PREP: [&str; 2] = ["PG_buddy", "PG_hwpoison"];

/// Where per-CPU statistics deltas live
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatDiffs {
    /// `pageset->vm_stat_diff`, next to the pcp lists
    InPageset { offset: u64, size: u64 },
    /// `per_cpu_zonestats->vm_stat_diff`
    Zonestats { pointer: u64, offset: u64, size: u64 },
}

/// Zone-related layouts, resolved once
#[derive(Debug, Clone, Serialize)]
pub struct ZoneLayout {
    node_zones: u64,
    zone_size: u64,
    nr_zones: u32,
    name: Option<u64>,
    present_pages: FieldLayout,
    free_area: u64,
    free_area_size: u64,
    max_order: u32,
    free_list: u64,
    migrate_types: u32,
    nr_free: FieldLayout,
    list_head_size: u64,
    pageset: u64,
    pcp: u64,
    pcp_count: FieldLayout,
    pcp_lists: u64,
    pcp_types: u32,
    vm_stat: Option<u64>,
    stat_diffs: Option<StatDiffs>,
    flags_at_free: u64,
    flags_at_prep: u64,
}

fn count_of(field: FieldLayout, elem: u64) -> u32 {
    u32::try_from(field.size.checked_div(elem).unwrap_or(0)).unwrap_or(0)
}

impl ZoneLayout {
    /// # Errors
    /// Returns a lookup error if `struct zone` or its free areas are not
    /// described
    pub fn resolve(reader: &Reader<'_>, pages: &PageModel, notes: &mut Vec<Finding>) -> Result<Self, ModelError> {
        let pgdat = reader.type_variant(&["struct pglist_data", "pg_data_t"])?;
        let node_zones = reader.member(pgdat, "node_zones")?;
        let zone_size = reader.size_of(ZONE)?;

        let free_area = reader.member(ZONE, "free_area")?;
        let free_area_size = reader.size_of(FREE_AREA)?;
        let free_list = reader.member(FREE_AREA, "free_list")?;
        let list_head_size = reader.size_of(LIST_HEAD).unwrap_or(2 * reader.pointer_size());

        let mut max_order = count_of(free_area, free_area_size);
        if max_order == 0 {
            notes.push(Finding::config_default("MAX_ORDER", DEFAULT_MAX_ORDER));
            max_order = u32::try_from(DEFAULT_MAX_ORDER).unwrap_or(11);
        }

        let (pageset_name, pageset) = reader.member_variant(ZONE, &["per_cpu_pageset", "pageset"])?;
        let (pcp, stat_diffs) = if reader.has_member(ZONE, "per_cpu_zonestats") {
            let diff = reader.member("struct per_cpu_zonestats", "vm_stat_diff").ok();
            (
                0,
                diff.map(|d| StatDiffs::Zonestats {
                    pointer: reader.offset_of(ZONE, "per_cpu_zonestats").unwrap_or(0),
                    offset: d.offset,
                    size: d.size,
                }),
            )
        } else {
            let diff = reader.member("struct per_cpu_pageset", "vm_stat_diff").ok();
            (
                reader.offset_of("struct per_cpu_pageset", "pcp")?,
                diff.map(|d| StatDiffs::InPageset { offset: d.offset, size: d.size }),
            )
        };
        let pcp_lists = reader.member(PCP, "lists")?;

        let mut nr_zones = match reader.enum_value("enum zone_type", "__MAX_NR_ZONES") {
            Ok(n) => u32::try_from(n).unwrap_or(0),
            Err(_) => count_of(node_zones, zone_size),
        };
        if nr_zones == 0 {
            nr_zones = 1 << pages.flag_layout().zones_width;
            notes.push(Finding::config_default("__MAX_NR_ZONES", nr_zones));
        }

        let mask_of = |names: &[&str]| names.iter().filter_map(|n| pages.flag(n)).fold(0, |acc, m| acc | m);
        let flags_at_prep = pages.all_flags() & !mask_of(&FLAGS_ALLOWED_AT_PREP);

        log::info!("Zones: {nr_zones} per node, {max_order} orders, per-CPU lists in {pageset_name}");
        Ok(Self {
            node_zones: node_zones.offset,
            zone_size,
            nr_zones,
            name: reader.offset_of(ZONE, "name").ok(),
            present_pages: reader.member(ZONE, "present_pages")?,
            free_area: free_area.offset,
            free_area_size,
            max_order,
            free_list: free_list.offset,
            migrate_types: count_of(free_list, list_head_size).max(1),
            nr_free: reader.member(FREE_AREA, "nr_free")?,
            list_head_size,
            pageset: pageset.offset,
            pcp,
            pcp_count: reader.member(PCP, "count")?,
            pcp_lists: pcp_lists.offset,
            pcp_types: count_of(pcp_lists, list_head_size).max(1),
            vm_stat: reader.offset_of(ZONE, "vm_stat").ok(),
            stat_diffs,
            flags_at_free: mask_of(&FLAGS_CHECK_AT_FREE),
            flags_at_prep,
        })
    }

    #[must_use]
    pub fn max_order(&self) -> u32 {
        self.max_order
    }

    #[must_use]
    pub fn migrate_types(&self) -> u32 {
        self.migrate_types
    }
}

/// One `struct zone`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Zone {
    pub node: NodeId,
    pub zid: ZoneId,
    pub addr: u64,
    pub name: String,
    pub present_pages: u64,
}

impl Zone {
    #[must_use]
    pub fn is_populated(&self) -> bool {
        self.present_pages != 0
    }
}

/// Everything the zone engine reads through
#[derive(Clone, Copy)]
pub struct ZoneEnv<'a, 'm> {
    pub reader: &'a Reader<'m>,
    pub pages: &'a PageModel,
    pub layout: &'a ZoneLayout,
    pub cpus: &'a PerCpu,
}

/// Every zone of every node; unreadable zones are reported and skipped
pub fn zones(env: &ZoneEnv<'_, '_>, nodes: &NodeTopology, findings: &mut Vec<Finding>) -> Vec<Zone> {
    let layout = env.layout;
    let reader = env.reader;
    let mut out = Vec::new();

    for (node, pgdat) in nodes.iter() {
        for zid in 0..layout.nr_zones {
            let addr = pgdat + layout.node_zones + u64::from(zid) * layout.zone_size;
            let present = reader.read_uint(addr + layout.present_pages.offset, layout.present_pages.size);
            let present_pages = match present {
                Ok(n) => n,
                Err(err) => {
                    findings.push(Finding::from_error(format!("{node} zone{zid}"), err.into()));
                    continue;
                }
            };
            let name = layout
                .name
                .and_then(|off| reader.read_ptr(addr + off).ok())
                .and_then(|ptr| reader.read_cstring(ptr, MAX_CSTRING).ok())
                .unwrap_or_else(|| format!("zone{zid}"));
            out.push(Zone { node, zid: ZoneId(zid), addr, name, present_pages });
        }
    }
    out
}

/// Check every free list and pcp list of `zone`
pub fn check_zone(env: &ZoneEnv<'_, '_>, zone: &Zone) -> Vec<Finding> {
    env.reader.begin_pass();
    let mut findings = Vec::new();
    let layout = env.layout;

    for order in 0..layout.max_order {
        let area = zone.addr + layout.free_area + u64::from(order) * layout.free_area_size;
        let bucket = FreeArea::Buddy { order };
        let mut counted = 0u64;
        for mt in 0..layout.migrate_types {
            let head = area + layout.free_list + u64::from(mt) * layout.list_head_size;
            let context = format!("{} order {order} mt {mt}", zone.name);
            counted += check_list(env, zone, bucket, head, &context, &mut findings);
        }
        declared_counter(env, zone, bucket, area + layout.nr_free.offset, layout.nr_free.size, counted, &mut findings);
    }

    let pageset = match env.reader.read_ptr(zone.addr + layout.pageset) {
        Ok(ptr) => ptr,
        Err(err) => {
            findings.push(Finding::from_error(format!("{} {} pageset", zone.node, zone.name), err.into()));
            return findings;
        }
    };
    for (cpu, pcp) in env.cpus.instances(pageset) {
        let pcp = pcp + layout.pcp;
        let bucket = FreeArea::Pcp { cpu };
        let mut counted = 0u64;
        for mt in 0..layout.pcp_types {
            let head = pcp + layout.pcp_lists + u64::from(mt) * layout.list_head_size;
            let context = format!("{} {cpu} pcp mt {mt}", zone.name);
            counted += check_list(env, zone, bucket, head, &context, &mut findings);
        }
        declared_counter(env, zone, bucket, pcp + layout.pcp_count.offset, layout.pcp_count.size, counted, &mut findings);
    }

    findings
}

fn declared_counter(
    env: &ZoneEnv<'_, '_>,
    zone: &Zone,
    area: FreeArea,
    addr: u64,
    size: u64,
    counted: u64,
    findings: &mut Vec<Finding>,
) {
    match env.reader.read_uint(addr, size) {
        Ok(declared) if declared != counted => {
            findings.push(Finding::FreeCountMismatch { node: zone.node, zone: zone.zid, area, counted, declared });
        }
        Ok(_) => {}
        Err(err) => findings.push(Finding::from_error(format!("{} {} {area} counter", zone.node, zone.name), err.into())),
    }
}

/// Walk one free list, check each page on it, return the number of pages
fn check_list(
    env: &ZoneEnv<'_, '_>,
    zone: &Zone,
    area: FreeArea,
    head: u64,
    context: &str,
    findings: &mut Vec<Finding>,
) -> u64 {
    let lru = match env.pages.lru_offset() {
        Ok(lru) => lru,
        Err(err) => {
            findings.push(Finding::from_error(context, err));
            return 0;
        }
    };
    let walk = walk_with_retry(env.reader, head, context, DEFAULT_LIST_LIMIT);
    findings.extend(walk.findings);

    for entry in &walk.nodes {
        match env.pages.page_at(env.reader, entry - lru) {
            Ok(page) => check_free_page(env, zone, area, &page, findings),
            Err(err) => findings.push(Finding::from_error(format!("{context}: entry {entry:#x}"), err)),
        }
    }
    walk.nodes.len() as u64
}

fn check_free_page(env: &ZoneEnv<'_, '_>, zone: &Zone, area: FreeArea, page: &Page<'_>, findings: &mut Vec<Finding>) {
    let layout = env.layout;
    let mut problem = |problem: PageProblem| {
        findings.push(Finding::FreePageState { node: zone.node, zone: zone.zid, area, pfn: page.pfn, problem });
    };

    let refcount = page.refcount();
    if refcount != 0 {
        problem(PageProblem::NonZeroRefcount { refcount });
    }

    let flags = page.flags();
    match area {
        FreeArea::Buddy { order } => {
            if !page.is_buddy() {
                problem(PageProblem::NotBuddy);
            }
            if page.private() != u64::from(order) {
                problem(PageProblem::WrongOrder { expected: u64::from(order), found: page.private() });
            }
            if flags & layout.flags_at_prep != 0 {
                problem(PageProblem::DisallowedFlags { flags: flags & layout.flags_at_prep });
            }
        }
        FreeArea::Pcp { .. } => {
            if page.is_buddy() {
                problem(PageProblem::UnexpectedBuddy);
            }
            if page.mapping() != 0 {
                problem(PageProblem::NonZeroMapping { mapping: page.mapping() });
            }
            if flags & layout.flags_at_free != 0 {
                problem(PageProblem::DisallowedFlags { flags: flags & layout.flags_at_free });
            }
        }
    }

    let (page_node, page_zone) = (page.nid(), page.zid());
    if page_node != zone.node || page_zone != zone.zid {
        findings.push(Finding::MisplacedPage {
            node: zone.node,
            zone: zone.zid,
            area,
            pfn: page.pfn,
            page_node,
            page_zone,
        });
    }
}

/// Names of the `vm_stat` slots, from `enum zone_stat_item`
///
/// Slots without an enumerator are named [`UNKNOWN_STAT`].
///
/// # Errors
/// Returns a lookup error if the enum or `NR_VM_ZONE_STAT_ITEMS` is missing
pub fn vmstat_names(reader: &Reader<'_>) -> Result<Vec<String>, ModelError> {
    let layout = reader.layout("enum zone_stat_item")?;
    let count = reader.enum_value("enum zone_stat_item", "NR_VM_ZONE_STAT_ITEMS")?;
    let count = usize::try_from(count).map_err(|_| ModelError::unsupported("enum zone_stat_item", "negative count"))?;

    let mut names = vec![UNKNOWN_STAT.to_string(); count];
    for (name, &value) in &layout.enumerators {
        if let Some(slot) = usize::try_from(value).ok().filter(|&v| v < count) {
            names[slot].clone_from(name);
        }
    }
    Ok(names)
}

/// Zone counters with the per-CPU deltas folded in
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ZoneStats {
    pub node: NodeId,
    pub zone: String,
    /// `vm_stat[i].counter`
    pub global: BTreeMap<String, i64>,
    /// Sum of `vm_stat_diff[i]` over all CPUs
    pub diffs: BTreeMap<String, i64>,
}

/// # Errors
/// Returns `UnsupportedLayout` if the zone has no `vm_stat`, or an access
/// error
#[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
pub fn zone_stats(env: &ZoneEnv<'_, '_>, zone: &Zone, names: &[String]) -> Result<ZoneStats, ModelError> {
    let reader = env.reader;
    let layout = env.layout;
    let vm_stat = layout.vm_stat.ok_or_else(|| ModelError::unsupported(ZONE, "no vm_stat"))?;
    let ptr = reader.pointer_size();

    let mut global = BTreeMap::new();
    let mut diff_sums = vec![0i64; names.len()];
    for (i, name) in names.iter().enumerate() {
        let counter = reader.read_uint(zone.addr + vm_stat + i as u64 * ptr, ptr)? as i64;
        *global.entry(name.clone()).or_insert(0) += counter;
    }

    if let Some(diffs) = layout.stat_diffs {
        let (base, offset, size) = match diffs {
            StatDiffs::InPageset { offset, size } => {
                (reader.read_ptr(zone.addr + layout.pageset)?, offset, size)
            }
            StatDiffs::Zonestats { pointer, offset, size } => (reader.read_ptr(zone.addr + pointer)?, offset, size),
        };
        let count = (size as usize).min(names.len());
        for (_, stats) in env.cpus.instances(base) {
            let bytes = reader.read_vec(stats + offset, count)?;
            for (sum, byte) in diff_sums.iter_mut().zip(bytes) {
                *sum += i64::from(byte as i8);
            }
        }
    }

    let mut diffs = BTreeMap::new();
    for (name, sum) in names.iter().zip(diff_sums) {
        *diffs.entry(name.clone()).or_insert(0) += sum;
    }

    Ok(ZoneStats { node: zone.node, zone: zone.name.clone(), global, diffs })
}
