//! Session state: one attached target, its resolved-once layouts and the
//! memoized catalogs
//!
//! Everything here is built lazily on first use and kept until
//! [`Session::reset`] or [`Session::attach`]. Fallbacks taken while building
//! (configuration defaults, missing symbols) are collected as setup findings
//! and reported with every check.

use std::cell::{OnceCell, RefCell};

use crate::domain::{DepotHandle, Finding, ModelError, Pfn};
use crate::kernel::{KernelConfig, NodeTopology, PerCpu};
use crate::memory::{MemoryAccess, Reader};
use crate::mm::slab::{self, CacheCatalog, ObjectLookup, SlabEnv, SlabLayout};
use crate::mm::zone::{self, Zone, ZoneEnv, ZoneLayout, ZoneStats};
use crate::mm::{PageModel, PageModelOptions, PageSummary};
use crate::stack_depot::{StackDepot, StackFrame};
use crate::symbolization::{Resolution, SymbolResolver};

/// Get a memoized value or build it, caching only successes
fn memo<'c, T>(cell: &'c OnceCell<T>, build: impl FnOnce() -> Result<T, ModelError>) -> Result<&'c T, ModelError> {
    if let Some(value) = cell.get() {
        return Ok(value);
    }
    let value = build()?;
    Ok(cell.get_or_init(|| value))
}

pub struct Session<'m> {
    reader: Reader<'m>,
    config: KernelConfig,
    /// Set when the configuration was supplied from outside the image
    config_override: bool,
    notes: RefCell<Vec<Finding>>,

    cpus: OnceCell<PerCpu>,
    nodes: OnceCell<NodeTopology>,
    pages: OnceCell<PageModel>,
    slab_layout: OnceCell<SlabLayout>,
    zone_layout: OnceCell<ZoneLayout>,
    depot: OnceCell<StackDepot>,

    symbols: OnceCell<SymbolResolver>,
    caches: OnceCell<CacheCatalog>,
    vmstat_names: OnceCell<Vec<String>>,
}

impl<'m> Session<'m> {
    /// Attach to a target; `config` overrides the in-image configuration
    #[must_use]
    pub fn new(memory: &'m dyn MemoryAccess, config: Option<KernelConfig>) -> Self {
        let reader = Reader::new(memory);
        let config_override = config.is_some();
        let mut notes = Vec::new();
        let config = config.unwrap_or_else(|| Self::image_config(&reader, &mut notes));

        Self {
            reader,
            config,
            config_override,
            notes: RefCell::new(notes),
            cpus: OnceCell::new(),
            nodes: OnceCell::new(),
            pages: OnceCell::new(),
            slab_layout: OnceCell::new(),
            zone_layout: OnceCell::new(),
            depot: OnceCell::new(),
            symbols: OnceCell::new(),
            caches: OnceCell::new(),
            vmstat_names: OnceCell::new(),
        }
    }

    fn image_config(reader: &Reader<'_>, notes: &mut Vec<Finding>) -> KernelConfig {
        match KernelConfig::from_image(reader) {
            Ok(config) => config,
            Err(err) => {
                log::warn!("No in-image kernel config: {err}");
                notes.push(Finding::config_default("kernel config", "built-in defaults"));
                KernelConfig::unavailable()
            }
        }
    }

    /// Drop every memoized catalog and resolved layout
    pub fn reset(&mut self) {
        self.cpus = OnceCell::new();
        self.nodes = OnceCell::new();
        self.pages = OnceCell::new();
        self.slab_layout = OnceCell::new();
        self.zone_layout = OnceCell::new();
        self.depot = OnceCell::new();
        self.symbols = OnceCell::new();
        self.caches = OnceCell::new();
        self.vmstat_names = OnceCell::new();
        self.notes.borrow_mut().clear();
        self.reader.begin_pass();
        log::debug!("Session reset");
    }

    /// Switch to a new target; an overriding configuration is kept
    pub fn attach(&mut self, memory: &'m dyn MemoryAccess) {
        self.reset();
        self.reader = Reader::new(memory);
        if !self.config_override {
            self.config = Self::image_config(&self.reader, self.notes.get_mut());
        }
    }

    #[must_use]
    pub fn reader(&self) -> &Reader<'m> {
        &self.reader
    }

    #[must_use]
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Fallbacks and problems met while setting up
    #[must_use]
    pub fn setup_findings(&self) -> Vec<Finding> {
        self.notes.borrow().clone()
    }

    /// Preload a symbol table from an external source
    pub fn set_symbols(&mut self, symbols: SymbolResolver) {
        self.symbols = OnceCell::from(symbols);
    }

    // ---- resolved-once setup -------------------------------------------------

    pub fn cpus(&self) -> &PerCpu {
        self.cpus.get_or_init(|| PerCpu::discover(&self.reader, &mut self.notes.borrow_mut()))
    }

    /// # Errors
    /// Returns `NotFound` if neither `node_data` nor `contig_page_data` exists
    pub fn nodes(&self) -> Result<&NodeTopology, ModelError> {
        memo(&self.nodes, || NodeTopology::discover(&self.reader, &mut self.notes.borrow_mut()))
    }

    /// # Errors
    /// Returns an error if `struct page` cannot be interpreted
    pub fn pages(&self) -> Result<&PageModel, ModelError> {
        memo(&self.pages, || {
            PageModel::resolve(&self.reader, &self.config, PageModelOptions::default(), &mut self.notes.borrow_mut())
        })
    }

    /// # Errors
    /// Returns an error if the kallsyms tables cannot be read
    pub fn symbols(&self) -> Result<&SymbolResolver, ModelError> {
        memo(&self.symbols, || SymbolResolver::build(&self.reader, &self.config, &mut self.notes.borrow_mut()))
    }

    /// # Errors
    /// Returns an error if the SLAB layout cannot be resolved
    pub fn slab_env(&self) -> Result<SlabEnv<'_, 'm>, ModelError> {
        let layout = memo(&self.slab_layout, || SlabLayout::resolve(&self.reader))?;
        Ok(SlabEnv { reader: &self.reader, pages: self.pages()?, layout, cpus: self.cpus(), nodes: self.nodes()? })
    }

    /// # Errors
    /// Returns an error if the SLAB layout cannot be resolved
    pub fn caches(&self) -> Result<&CacheCatalog, ModelError> {
        let env = self.slab_env()?;
        memo(&self.caches, || Ok(CacheCatalog::build(env.reader, env.layout)))
    }

    /// # Errors
    /// Returns an error if the zone layout cannot be resolved
    pub fn zone_env(&self) -> Result<ZoneEnv<'_, 'm>, ModelError> {
        let pages = self.pages()?;
        let layout = memo(&self.zone_layout, || ZoneLayout::resolve(&self.reader, pages, &mut self.notes.borrow_mut()))?;
        Ok(ZoneEnv { reader: &self.reader, pages, layout, cpus: self.cpus() })
    }

    /// # Errors
    /// Returns an error if `enum zone_stat_item` is not described
    pub fn vmstat_names(&self) -> Result<&[String], ModelError> {
        memo(&self.vmstat_names, || zone::vmstat_names(&self.reader)).map(Vec::as_slice)
    }

    // ---- operations ----------------------------------------------------------

    /// Resolve a kernel address to `name+offset/size`
    ///
    /// # Errors
    /// Returns an error only if no symbol table can be built at all
    pub fn resolve(&self, addr: u64) -> Result<Resolution, ModelError> {
        Ok(self.symbols()?.resolve(&self.reader, addr))
    }

    /// # Errors
    /// Returns `NotFound` for frames without a descriptor
    pub fn page(&self, pfn: Pfn) -> Result<PageSummary, ModelError> {
        let pages = self.pages()?;
        Ok(pages.page(&self.reader, pfn)?.summary())
    }

    /// Consistency check of one cache by name
    ///
    /// # Errors
    /// Returns `NotFound` if no cache has that name
    pub fn check_cache(&self, name: &str) -> Result<Vec<Finding>, ModelError> {
        let env = self.slab_env()?;
        let catalog = self.caches()?;
        let cache = catalog.by_name(name).ok_or_else(|| ModelError::NotFound(format!("slab cache {name}")))?;
        Ok(slab::check_cache(&env, catalog, cache))
    }

    /// Consistency check of every cache, catalog problems included
    ///
    /// # Errors
    /// Returns an error if the SLAB layout cannot be resolved
    pub fn check_all_caches(&self) -> Result<Vec<Finding>, ModelError> {
        let env = self.slab_env()?;
        let catalog = self.caches()?;
        let mut findings = catalog.findings().to_vec();
        for cache in catalog.iter() {
            findings.extend(slab::check_cache(&env, catalog, cache));
        }
        Ok(findings)
    }

    /// # Errors
    /// Returns `NotFound` if the address is not a slab object
    pub fn find_object(&self, addr: u64) -> Result<ObjectLookup, ModelError> {
        let env = self.slab_env()?;
        slab::find_object(&env, self.caches()?, addr)
    }

    /// All zones, or only the populated ones, with enumeration problems
    ///
    /// # Errors
    /// Returns an error if the zone layout cannot be resolved
    pub fn zones(&self, populated_only: bool) -> Result<(Vec<Zone>, Vec<Finding>), ModelError> {
        let env = self.zone_env()?;
        let mut findings = Vec::new();
        let mut zones = zone::zones(&env, self.nodes()?, &mut findings);
        if populated_only {
            zones.retain(Zone::is_populated);
        }
        Ok((zones, findings))
    }

    /// Free-list check of every populated zone
    ///
    /// # Errors
    /// Returns an error if the zone layout cannot be resolved
    pub fn check_zones(&self) -> Result<Vec<Finding>, ModelError> {
        let env = self.zone_env()?;
        let (zones, mut findings) = self.zones(true)?;
        for zone in &zones {
            findings.extend(zone::check_zone(&env, zone));
        }
        Ok(findings)
    }

    /// `vm_stat` of every populated zone
    ///
    /// A zone whose counters cannot be read is left out and reported.
    ///
    /// # Errors
    /// Returns an error if the statistics layout is unavailable
    pub fn zone_stats(&self) -> Result<(Vec<ZoneStats>, Vec<Finding>), ModelError> {
        let env = self.zone_env()?;
        let names = self.vmstat_names()?;
        let (zones, mut findings) = self.zones(true)?;
        let mut stats = Vec::with_capacity(zones.len());
        for zone in &zones {
            match zone::zone_stats(&env, zone, names) {
                Ok(zone_stats) => stats.push(zone_stats),
                Err(err) => findings.push(Finding::from_error(format!("{} {} vm_stat", zone.node, zone.name), err)),
            }
        }
        Ok((stats, findings))
    }

    /// Decode and symbolize a stack depot handle
    ///
    /// # Errors
    /// Returns `NotFound` for invalid handles or kernels without a depot
    pub fn stack(&self, handle: DepotHandle) -> Result<Vec<StackFrame>, ModelError> {
        let depot = memo(&self.depot, || StackDepot::resolve(&self.reader))?;
        let record = depot.record(&self.reader, handle)?;
        Ok(record.frames(self.symbols()?, &self.reader).collect())
    }
}
