//! Global symbol sources: `System.map` text or a `vmlinux` symbol table
//!
//! Both loaders relocate by the KASLR offset. Absolute symbols (type `A` in
//! `System.map`, `SHN_ABS` in ELF) are left alone.

use object::{Object, ObjectSymbol, SymbolSection};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::domain::LoadError;

/// Parse `System.map` text: `<hex address> <type> <name>` per line
///
/// Malformed lines are skipped. When a name repeats the first address wins,
/// matching how the kernel's own lookups behave for duplicate local symbols.
#[must_use]
pub fn parse_system_map(text: &str, kaslr_offset: u64) -> HashMap<String, u64> {
    let mut symbols = HashMap::new();

    for line in text.lines() {
        let mut parts = line.split_whitespace();
        let (Some(addr), Some(kind), Some(name)) = (parts.next(), parts.next(), parts.next()) else {
            continue;
        };
        let Ok(addr) = u64::from_str_radix(addr, 16) else {
            continue;
        };
        if kind.len() != 1 {
            continue;
        }

        let absolute = kind.eq_ignore_ascii_case("a");
        let addr = if absolute { addr } else { addr.wrapping_add(kaslr_offset) };
        symbols.entry(name.to_string()).or_insert(addr);
    }

    symbols
}

/// Load and parse a `System.map` file
///
/// # Errors
/// Returns an error if the file cannot be read or holds no symbols
pub fn load_system_map<P: AsRef<Path>>(path: P, kaslr_offset: u64) -> Result<HashMap<String, u64>, LoadError> {
    let text = fs::read_to_string(path.as_ref())?;
    let symbols = parse_system_map(&text, kaslr_offset);
    if symbols.is_empty() {
        return Err(LoadError::Parse {
            path: path.as_ref().display().to_string(),
            reason: "no symbol lines".to_string(),
        });
    }
    log::info!("Loaded {} symbols from {}", symbols.len(), path.as_ref().display());
    Ok(symbols)
}

/// Load defined symbols from the ELF symbol table of a `vmlinux`
///
/// # Errors
/// Returns an error if the file cannot be read or parsed
pub fn load_vmlinux_symbols<P: AsRef<Path>>(
    path: P,
    kaslr_offset: u64,
) -> Result<HashMap<String, u64>, LoadError> {
    let data = fs::read(path.as_ref())?;
    let obj = object::File::parse(&*data).map_err(|e| LoadError::Parse {
        path: path.as_ref().display().to_string(),
        reason: e.to_string(),
    })?;

    let mut symbols = HashMap::new();
    for sym in obj.symbols() {
        if sym.is_undefined() {
            continue;
        }
        let Ok(name) = sym.name() else { continue };
        if name.is_empty() {
            continue;
        }
        let addr = match sym.section() {
            SymbolSection::Absolute => sym.address(),
            _ => sym.address().wrapping_add(kaslr_offset),
        };
        symbols.entry(name.to_string()).or_insert(addr);
    }

    log::info!("Loaded {} symbols from {}", symbols.len(), path.as_ref().display());
    Ok(symbols)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MAP: &str = "\
0000000000000000 A __per_cpu_start
ffffffff81000000 T _text
ffffffff81000000 T _stext
ffffffff82a00000 D slab_caches
garbage line
ffffffff82a00000 d slab_caches
";

    #[test]
    fn test_parse_with_kaslr() {
        let syms = parse_system_map(MAP, 0x1000_0000);
        assert_eq!(syms["_stext"], 0xffff_ffff_9100_0000);
        assert_eq!(syms["__per_cpu_start"], 0);
        assert_eq!(syms["slab_caches"], 0xffff_ffff_92a0_0000);
        assert_eq!(syms.len(), 4);
    }

    #[test]
    fn test_load_system_map_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MAP.as_bytes()).unwrap();
        let syms = load_system_map(file.path(), 0).unwrap();
        assert_eq!(syms["_text"], 0xffff_ffff_8100_0000);
    }

    #[test]
    fn test_empty_system_map_is_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"\n\n").unwrap();
        assert!(load_system_map(file.path(), 0).is_err());
    }
}
