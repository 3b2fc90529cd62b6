// Symbol counts and indexes fit in u32; addresses are u64 throughout
#![allow(clippy::cast_possible_truncation)]

use crate::domain::{AccessError, Finding, ModelError};
use crate::kernel::KernelConfig;
use crate::memory::Reader;

/// Number of names covered by one `kallsyms_markers` entry
const NAMES_PER_MARKER: usize = 256;

/// The 256-entry token dictionary of the compressed name table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenTable {
    tokens: Vec<Vec<u8>>,
}

impl TokenTable {
    #[must_use]
    pub fn new(tokens: Vec<Vec<u8>>) -> Self {
        Self { tokens }
    }

    /// Read `kallsyms_token_table` through `kallsyms_token_index`
    ///
    /// # Errors
    /// Returns `UnreadableMemory` if either table is not backed
    pub fn read(reader: &Reader<'_>, table: u64, index: u64) -> Result<Self, AccessError> {
        let mut tokens = Vec::with_capacity(256);
        for i in 0..256u64 {
            let off = reader.read_u16(index + i * 2)?;
            let token = reader.read_cstring(table + u64::from(off), 64)?;
            tokens.push(token.into_bytes());
        }
        Ok(Self { tokens })
    }

    /// Expand token indices into the stored name, symbol type character included
    #[must_use]
    pub fn expand_raw(&self, encoded: &[u8]) -> Vec<u8> {
        encoded
            .iter()
            .filter_map(|&idx| self.tokens.get(usize::from(idx)))
            .flatten()
            .copied()
            .collect()
    }

    /// Expand token indices into a symbol name
    ///
    /// The first decoded character is the symbol type (`T`, `t`, `D`, ...)
    /// and is not part of the name.
    #[must_use]
    pub fn expand(&self, encoded: &[u8]) -> String {
        let raw = self.expand_raw(encoded);
        String::from_utf8_lossy(raw.get(1..).unwrap_or_default()).into_owned()
    }

    /// Re-derive a token sequence for `raw` by greedy longest match
    ///
    /// Returns `None` if some byte is not covered by any token.
    #[must_use]
    pub fn encode(&self, raw: &[u8]) -> Option<Vec<u8>> {
        let mut out = Vec::new();
        let mut rest = raw;
        while !rest.is_empty() {
            let (idx, len) = self
                .tokens
                .iter()
                .enumerate()
                .filter(|(_, t)| !t.is_empty() && rest.starts_with(t))
                .map(|(i, t)| (i, t.len()))
                .max_by_key(|&(i, len)| (len, std::cmp::Reverse(i)))?;
            out.push(u8::try_from(idx).ok()?);
            rest = &rest[len..];
        }
        Some(out)
    }
}

/// How `kallsyms` stores symbol addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMode {
    /// `kallsyms_addresses[]` holds full addresses
    Absolute,
    /// `kallsyms_offsets[]` relative to `kallsyms_relative_base`
    BaseRelative { base: u64, absolute_percpu: bool },
}

impl AddressMode {
    /// Decode one `kallsyms_offsets` entry
    #[must_use]
    pub fn decode_offset(self, raw: u32) -> u64 {
        match self {
            AddressMode::Absolute => u64::from(raw),
            AddressMode::BaseRelative { base, absolute_percpu } => {
                #[allow(clippy::cast_possible_wrap)]
                let offset = raw as i32;
                if !absolute_percpu {
                    base.wrapping_add(u64::from(raw))
                } else if offset >= 0 {
                    u64::from(raw)
                } else {
                    // base - 1 - offset
                    base.wrapping_sub(1).wrapping_sub(i64::from(offset) as u64)
                }
            }
        }
    }
}

/// Position of an address inside a sorted address table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolPos {
    pub index: usize,
    pub start: u64,
    pub offset: u64,
    pub size: u64,
    /// No distinct successor; `size` is a stand-in equal to `offset`
    pub approximate: bool,
}

/// Find the symbol covering `addr` in a table sorted by address
///
/// Picks the greatest start <= `addr` and, among aliases sharing that start,
/// the first. The size runs to the next distinct address. The last symbol
/// has no such bound and gets `size = offset`, flagged approximate.
#[must_use]
pub fn symbol_pos(addresses: &[u64], addr: u64) -> Option<SymbolPos> {
    let upper = addresses.partition_point(|&a| a <= addr);
    let mut index = upper.checked_sub(1)?;
    let start = addresses[index];
    while index > 0 && addresses[index - 1] == start {
        index -= 1;
    }

    let offset = addr - start;
    match addresses[index..].iter().find(|&&a| a > start) {
        Some(&end) => Some(SymbolPos { index, start, offset, size: end - start, approximate: false }),
        None => Some(SymbolPos { index, start, offset, size: offset, approximate: true }),
    }
}

/// The kernel's compressed symbol table
#[derive(Debug, Clone)]
pub struct Kallsyms {
    mode: AddressMode,
    addresses: Vec<u64>,
    tokens: TokenTable,
    names: u64,
    markers: u64,
}

impl Kallsyms {
    /// Read the address table and token dictionary
    ///
    /// The address mode is chosen once: from `CONFIG_KALLSYMS_BASE_RELATIVE`
    /// and `CONFIG_KALLSYMS_ABSOLUTE_PERCPU` when the config is known,
    /// otherwise from which tables the image carries.
    ///
    /// # Errors
    /// Returns `NotFound` if the kernel has no kallsyms tables, or an access
    /// error if they cannot be read
    pub fn load(reader: &Reader<'_>, config: &KernelConfig, notes: &mut Vec<Finding>) -> Result<Self, ModelError> {
        let num_syms = reader
            .symbol("kallsyms_num_syms")
            .map_err(|_| ModelError::NotFound("kallsyms_num_syms".to_string()))?;
        let count = reader.read_u32(num_syms)? as usize;

        let base_relative = match config.enabled("KALLSYMS_BASE_RELATIVE") {
            Some(enabled) => enabled,
            None => reader.has_symbol("kallsyms_offsets"),
        };

        let addresses = if base_relative {
            let base = reader.read_ptr(reader.symbol("kallsyms_relative_base")?)?;
            let absolute_percpu = config.enabled("KALLSYMS_ABSOLUTE_PERCPU").unwrap_or_else(|| {
                notes.push(Finding::config_default("CONFIG_KALLSYMS_ABSOLUTE_PERCPU", "y"));
                true
            });
            let mode = AddressMode::BaseRelative { base, absolute_percpu };
            let offsets = reader.symbol("kallsyms_offsets")?;
            let raw = reader.read_vec(offsets, count * 4)?;
            let addresses: Vec<u64> = raw
                .chunks_exact(4)
                .map(|c| mode.decode_offset(reader.decode(c) as u32))
                .collect();
            (mode, addresses)
        } else {
            let table = reader.symbol("kallsyms_addresses")?;
            let ptr = reader.pointer_size() as usize;
            let raw = reader.read_vec(table, count * ptr)?;
            (AddressMode::Absolute, raw.chunks_exact(ptr).map(|c| reader.decode(c)).collect())
        };
        let (mode, addresses) = addresses;

        let tokens = TokenTable::read(
            reader,
            reader.symbol("kallsyms_token_table")?,
            reader.symbol("kallsyms_token_index")?,
        )?;

        log::info!("Loaded {count} kallsyms entries ({mode:?})");
        Ok(Self {
            mode,
            addresses,
            tokens,
            names: reader.symbol("kallsyms_names")?,
            markers: reader.symbol("kallsyms_markers")?,
        })
    }

    #[must_use]
    pub fn mode(&self) -> AddressMode {
        self.mode
    }

    #[must_use]
    pub fn addresses(&self) -> &[u64] {
        &self.addresses
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    #[must_use]
    pub fn lookup(&self, addr: u64) -> Option<SymbolPos> {
        symbol_pos(&self.addresses, addr)
    }

    /// Length of the compressed name at `at` and the size of its length prefix
    ///
    /// Names of 128 tokens or more use a two-byte little-endian length with
    /// the high bit of the first byte set.
    fn name_len(reader: &Reader<'_>, at: u64) -> Result<(u64, u64), AccessError> {
        let first = reader.read_u8(at)?;
        if first & 0x80 == 0 {
            return Ok((u64::from(first), 1));
        }
        let second = reader.read_u8(at + 1)?;
        Ok((u64::from(first & 0x7f) | (u64::from(second) << 7), 2))
    }

    /// Address of the compressed name of symbol `index`
    fn name_addr(&self, reader: &Reader<'_>, index: usize) -> Result<u64, AccessError> {
        let marker = reader.read_u32(self.markers + (index / NAMES_PER_MARKER) as u64 * 4)?;
        let mut at = self.names + u64::from(marker);
        for _ in 0..index % NAMES_PER_MARKER {
            let (len, prefix) = Self::name_len(reader, at)?;
            at += prefix + len;
        }
        Ok(at)
    }

    /// The compressed token sequence of symbol `index`
    ///
    /// # Errors
    /// Returns `UnreadableMemory` if the name tables are not backed
    pub fn encoded_name(&self, reader: &Reader<'_>, index: usize) -> Result<Vec<u8>, AccessError> {
        let at = self.name_addr(reader, index)?;
        let (len, prefix) = Self::name_len(reader, at)?;
        reader.read_vec(at + prefix, len as usize)
    }

    /// Decompressed name of symbol `index`
    ///
    /// # Errors
    /// Returns `UnreadableMemory` if the name tables are not backed
    pub fn name(&self, reader: &Reader<'_>, index: usize) -> Result<String, AccessError> {
        Ok(self.tokens.expand(&self.encoded_name(reader, index)?))
    }

    #[must_use]
    pub fn tokens(&self) -> &TokenTable {
        &self.tokens
    }
}
