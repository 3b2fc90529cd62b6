//! Loadable module regions and their private symbol tables
//!
//! Module symbols are not in `kallsyms_*`; each `struct module` carries its
//! own ELF symbol table. Only addresses outside the main kernel image are
//! looked up here.

use crate::domain::{Finding, ModelError};
use crate::kernel::{walk_with_retry, DEFAULT_LIST_LIMIT};
use crate::memory::Reader;

/// `MODULE_NAME_LEN` on 64-bit kernels
const MODULE_NAME_LEN: usize = 56;

/// `Elf64_Sym`: `st_name` @0, `st_shndx` @6, `st_value` @8, 24 bytes
const ELF64_SYM_SIZE: u64 = 24;
const SHN_UNDEF: u16 = 0;

/// Upper bound on symbols read from one module
const MAX_MODULE_SYMBOLS: u64 = 1 << 20;

/// One address range of a module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub base: u64,
    pub size: u64,
}

impl Segment {
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr - self.base < self.size
    }

    #[must_use]
    pub fn end(&self) -> u64 {
        self.base + self.size
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSymbol {
    pub name: String,
    pub value: u64,
}

/// A loaded module: its init and core segments and its symbols
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRegion {
    pub name: String,
    pub core: Segment,
    pub init: Option<Segment>,
    pub symbols: Vec<ModuleSymbol>,
}

/// A module symbol covering an address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleHit {
    pub module: String,
    pub name: String,
    pub start: u64,
    pub offset: u64,
    pub size: u64,
}

impl ModuleRegion {
    #[must_use]
    pub fn segment_of(&self, addr: u64) -> Option<Segment> {
        if self.core.contains(addr) {
            return Some(self.core);
        }
        self.init.filter(|s| s.contains(addr))
    }

    /// Linear scan for the greatest symbol start <= `addr`
    ///
    /// The size runs to the next start above `addr`, or to the end of the
    /// enclosing segment.
    #[must_use]
    pub fn lookup(&self, addr: u64) -> Option<ModuleHit> {
        let segment = self.segment_of(addr)?;
        let mut best: Option<&ModuleSymbol> = None;
        let mut next_start = segment.end();

        for sym in self.symbols.iter().filter(|s| segment.contains(s.value)) {
            if sym.value <= addr {
                if best.map_or(true, |b| sym.value > b.value) {
                    best = Some(sym);
                }
            } else if sym.value < next_start {
                next_start = sym.value;
            }
        }

        let best = best?;
        Some(ModuleHit {
            module: self.name.clone(),
            name: best.name.clone(),
            start: best.value,
            offset: addr - best.value,
            size: next_start - best.value,
        })
    }
}

/// Member names that changed across kernel versions
#[derive(Debug, Clone, Copy)]
struct ModuleLayout {
    list: u64,
    name: u64,
    core_base: u64,
    core_size: u64,
    init: Option<(u64, u64)>,
    symtab: SymtabLayout,
}

#[derive(Debug, Clone, Copy)]
enum SymtabLayout {
    /// `mod->kallsyms` points at a `struct mod_kallsyms`
    Indirect { ptr: u64, symtab: u64, num: u64, strtab: u64 },
    /// `symtab`, `num_symtab` and `strtab` live in `struct module`
    Direct { symtab: u64, num: u64, strtab: u64 },
}

impl ModuleLayout {
    fn resolve(reader: &Reader<'_>) -> Result<Self, ModelError> {
        const M: &str = "struct module";
        let (_, core_base) = reader.member_variant(M, &["core_layout.base", "module_core"])?;
        let (_, core_size) = reader.member_variant(M, &["core_layout.size", "core_size"])?;
        let init = match (
            reader.member_variant(M, &["init_layout.base", "module_init"]),
            reader.member_variant(M, &["init_layout.size", "init_size"]),
        ) {
            (Ok((_, base)), Ok((_, size))) => Some((base.offset, size.offset)),
            _ => None,
        };

        let symtab = if reader.has_member(M, "kallsyms") {
            const K: &str = "struct mod_kallsyms";
            SymtabLayout::Indirect {
                ptr: reader.offset_of(M, "kallsyms")?,
                symtab: reader.offset_of(K, "symtab")?,
                num: reader.offset_of(K, "num_symtab")?,
                strtab: reader.offset_of(K, "strtab")?,
            }
        } else {
            SymtabLayout::Direct {
                symtab: reader.offset_of(M, "symtab")?,
                num: reader.offset_of(M, "num_symtab")?,
                strtab: reader.offset_of(M, "strtab")?,
            }
        };

        Ok(Self {
            list: reader.offset_of(M, "list")?,
            name: reader.offset_of(M, "name")?,
            core_base: core_base.offset,
            core_size: core_size.offset,
            init,
            symtab,
        })
    }
}

/// Read every module on the global `modules` list
///
/// A module whose header or symbol table cannot be read is reported and
/// skipped; the remaining modules are still returned.
///
/// # Errors
/// Returns an error only if the module list itself cannot be located
pub fn load_modules(reader: &Reader<'_>, notes: &mut Vec<Finding>) -> Result<Vec<ModuleRegion>, ModelError> {
    let head = reader.symbol("modules")?;
    let layout = ModuleLayout::resolve(reader)?;

    let walk = walk_with_retry(reader, head, "modules", DEFAULT_LIST_LIMIT);
    notes.extend(walk.findings);

    let mut modules = Vec::new();
    for node in walk.nodes {
        let module = node - layout.list;
        match read_module(reader, &layout, module) {
            Ok(region) => modules.push(region),
            Err(err) => notes.push(Finding::from_error(format!("module at {module:#x}"), err)),
        }
    }

    log::info!("Loaded {} module regions", modules.len());
    Ok(modules)
}

fn read_module(reader: &Reader<'_>, layout: &ModuleLayout, module: u64) -> Result<ModuleRegion, ModelError> {
    let name = reader.read_cstring(module + layout.name, MODULE_NAME_LEN)?;
    let core = Segment {
        base: reader.read_ptr(module + layout.core_base)?,
        size: u64::from(reader.read_u32(module + layout.core_size)?),
    };
    let init = match layout.init {
        Some((base, size)) => {
            let seg = Segment {
                base: reader.read_ptr(module + base)?,
                size: u64::from(reader.read_u32(module + size)?),
            };
            (seg.base != 0 && seg.size != 0).then_some(seg)
        }
        None => None,
    };

    let (symtab, num, strtab) = match layout.symtab {
        SymtabLayout::Indirect { ptr, symtab, num, strtab } => {
            let kallsyms = reader.read_ptr(module + ptr)?;
            (
                reader.read_ptr(kallsyms + symtab)?,
                u64::from(reader.read_u32(kallsyms + num)?),
                reader.read_ptr(kallsyms + strtab)?,
            )
        }
        SymtabLayout::Direct { symtab, num, strtab } => (
            reader.read_ptr(module + symtab)?,
            u64::from(reader.read_u32(module + num)?),
            reader.read_ptr(module + strtab)?,
        ),
    };

    if num > MAX_MODULE_SYMBOLS {
        return Err(ModelError::corruption(
            format!("module {name}"),
            module,
            format!("implausible symbol count {num}"),
        ));
    }

    let mut symbols = Vec::new();
    for i in 0..num {
        let sym = symtab + i * ELF64_SYM_SIZE;
        if reader.read_u16(sym + 6)? == SHN_UNDEF {
            continue;
        }
        let st_name = reader.read_u32(sym)?;
        let value = reader.read_u64(sym + 8)?;
        let sym_name = reader.read_cstring(strtab + u64::from(st_name), 512)?;
        if !sym_name.is_empty() {
            symbols.push(ModuleSymbol { name: sym_name, value });
        }
    }

    log::debug!("module {name}: core {:#x}+{:#x}, {} symbols", core.base, core.size, symbols.len());
    Ok(ModuleRegion { name, core, init, symbols })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region() -> ModuleRegion {
        ModuleRegion {
            name: "ext4".into(),
            core: Segment { base: 0x1000, size: 0x1000 },
            init: Some(Segment { base: 0x8000, size: 0x100 }),
            symbols: vec![
                ModuleSymbol { name: "ext4_fill_super".into(), value: 0x1200 },
                ModuleSymbol { name: "ext4_init".into(), value: 0x8000 },
                ModuleSymbol { name: "ext4_iget".into(), value: 0x1100 },
                ModuleSymbol { name: "ext4_lookup".into(), value: 0x1800 },
            ],
        }
    }

    #[test]
    fn test_lookup_bounds_by_next_start() {
        let hit = region().lookup(0x1250).unwrap();
        assert_eq!(hit.name, "ext4_fill_super");
        assert_eq!(hit.offset, 0x50);
        assert_eq!(hit.size, 0x600);
        assert_eq!(hit.module, "ext4");
    }

    #[test]
    fn test_lookup_bounds_by_segment_end() {
        let hit = region().lookup(0x1900).unwrap();
        assert_eq!(hit.name, "ext4_lookup");
        assert_eq!(hit.size, 0x800);

        let hit = region().lookup(0x8010).unwrap();
        assert_eq!(hit.name, "ext4_init");
        assert_eq!(hit.size, 0x100);
    }

    #[test]
    fn test_lookup_outside_or_before_first_symbol() {
        assert!(region().lookup(0x5000).is_none());
        assert!(region().lookup(0x1010).is_none());
    }
}
