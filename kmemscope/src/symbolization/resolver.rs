use rustc_demangle::demangle;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

use super::kallsyms::{symbol_pos, Kallsyms};
use super::modules::ModuleRegion;
use crate::domain::{Finding, ModelError};
use crate::kernel::KernelConfig;
use crate::memory::Reader;

/// An address resolved to `name+offset/size`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedSymbol {
    pub name: String,
    pub start: u64,
    pub offset: u64,
    pub size: u64,
    /// `size` is a stand-in (no following symbol to bound it)
    pub approximate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
}

impl fmt::Display for ResolvedSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let approx = if self.approximate { "~" } else { "" };
        write!(f, "{}+{:#x}/{approx}{:#x}", self.name, self.offset, self.size)?;
        if let Some(module) = &self.module {
            write!(f, " [{module}]")?;
        }
        Ok(())
    }
}

/// Outcome of a lookup; an unresolvable address is a value, not an error
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resolution {
    Symbol(ResolvedSymbol),
    Unknown { addr: u64 },
}

impl Resolution {
    #[must_use]
    pub fn symbol(&self) -> Option<&ResolvedSymbol> {
        match self {
            Resolution::Symbol(sym) => Some(sym),
            Resolution::Unknown { .. } => None,
        }
    }

    #[must_use]
    pub fn is_unknown(&self) -> bool {
        matches!(self, Resolution::Unknown { .. })
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Symbol(sym) => sym.fmt(f),
            Resolution::Unknown { .. } => f.write_str("<unknown>"),
        }
    }
}

/// Where main-kernel names come from
#[derive(Debug, Clone)]
enum SymbolTable {
    /// In-image compressed table; names decompressed on demand
    Kallsyms(Kallsyms),
    /// Table from `System.map` / `vmlinux`, sorted by address
    Static { addresses: Vec<u64>, names: Vec<String> },
}

impl SymbolTable {
    fn addresses(&self) -> &[u64] {
        match self {
            SymbolTable::Kallsyms(k) => k.addresses(),
            SymbolTable::Static { addresses, .. } => addresses,
        }
    }
}

/// Address -> symbol for the kernel image and its loaded modules
#[derive(Debug, Clone)]
pub struct SymbolResolver {
    table: SymbolTable,
    /// `[start, end)` of the main kernel image
    kernel_range: (u64, u64),
    modules: Vec<ModuleRegion>,
}

/// Demangle Rust kernel symbols; C names pass through unchanged
#[must_use]
pub fn demangle_symbol(symbol: &str) -> String {
    format!("{:#}", demangle(symbol))
}

impl SymbolResolver {
    /// Build from the in-image kallsyms tables and the module list
    ///
    /// Modules that cannot be read are reported in `notes`; a kernel without
    /// modules support simply has none.
    ///
    /// # Errors
    /// Returns an error if the kallsyms tables are missing or unreadable
    pub fn build(reader: &Reader<'_>, config: &KernelConfig, notes: &mut Vec<Finding>) -> Result<Self, ModelError> {
        let kallsyms = Kallsyms::load(reader, config, notes)?;
        let table = SymbolTable::Kallsyms(kallsyms);
        let kernel_range = Self::kernel_range(reader, table.addresses());

        let modules = match super::modules::load_modules(reader, notes) {
            Ok(modules) => modules,
            Err(err) => {
                log::info!("No module symbols: {err}");
                Vec::new()
            }
        };

        Ok(Self { table, kernel_range, modules })
    }

    /// Build from an already-loaded `name -> address` map
    #[must_use]
    pub fn from_symbols(symbols: &HashMap<String, u64>) -> Self {
        let mut entries: Vec<(u64, &str)> = symbols.iter().map(|(n, a)| (*a, n.as_str())).collect();
        entries.sort_unstable();
        let addresses: Vec<u64> = entries.iter().map(|(a, _)| *a).collect();
        let names = entries.into_iter().map(|(_, n)| n.to_string()).collect();

        let start = symbols.get("_text").or_else(|| addresses.first()).copied().unwrap_or(0);
        let end = symbols.get("_end").copied().unwrap_or(u64::MAX);
        Self { table: SymbolTable::Static { addresses, names }, kernel_range: (start, end), modules: Vec::new() }
    }

    fn kernel_range(reader: &Reader<'_>, addresses: &[u64]) -> (u64, u64) {
        let start = reader
            .symbol("_text")
            .ok()
            .or_else(|| addresses.first().copied())
            .unwrap_or(0);
        let end = reader.symbol("_end").unwrap_or(u64::MAX);
        (start, end)
    }

    #[must_use]
    pub fn with_modules(mut self, modules: Vec<ModuleRegion>) -> Self {
        self.modules = modules;
        self
    }

    #[must_use]
    pub fn modules(&self) -> &[ModuleRegion] {
        &self.modules
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.table.addresses().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.addresses().is_empty()
    }

    #[must_use]
    pub fn in_kernel(&self, addr: u64) -> bool {
        addr >= self.kernel_range.0 && addr < self.kernel_range.1
    }

    /// Resolve `addr` to `name+offset/size`
    ///
    /// Module segments never overlap the image, so they are consulted first;
    /// without `_end` the image range is open-ended.
    pub fn resolve(&self, reader: &Reader<'_>, addr: u64) -> Resolution {
        if let Some(hit) = self.resolve_module(addr) {
            return hit;
        }
        if !self.in_kernel(addr) {
            return Resolution::Unknown { addr };
        }

        let Some(pos) = symbol_pos(self.table.addresses(), addr) else {
            return Resolution::Unknown { addr };
        };

        let name = match &self.table {
            SymbolTable::Static { names, .. } => names[pos.index].clone(),
            SymbolTable::Kallsyms(kallsyms) => match kallsyms.name(reader, pos.index) {
                Ok(name) => name,
                Err(err) => {
                    log::warn!("Cannot decompress kallsyms name #{}: {err}", pos.index);
                    return Resolution::Unknown { addr };
                }
            },
        };

        if pos.approximate {
            log::debug!("{name}: no following symbol, size approximated by offset");
        }

        Resolution::Symbol(ResolvedSymbol {
            name: demangle_symbol(&name),
            start: pos.start,
            offset: pos.offset,
            size: pos.size,
            approximate: pos.approximate,
            module: None,
        })
    }

    fn resolve_module(&self, addr: u64) -> Option<Resolution> {
        let hit = self.modules.iter().find_map(|m| m.lookup(addr))?;
        Some(Resolution::Symbol(ResolvedSymbol {
            name: demangle_symbol(&hit.name),
            start: hit.start,
            offset: hit.offset,
            size: hit.size,
            approximate: false,
            module: Some(hit.module),
        }))
    }
}
