//! # Memory Access Boundary
//!
//! Everything kmemscope knows about the target kernel arrives through the
//! [`MemoryAccess`] trait: raw byte reads, global symbol addresses, structure
//! layouts and architecture facts. The engines never write to the target.
//!
//! ## Implementations
//!
//! - **[`SparseImage`]**: in-memory segment map. Used for flat `--raw` dumps
//!   and as the builder behind the test fixtures.
//! - **[`ElfCore`]**: file-backed ELF core (`/proc/kcore`, kdump vmcore). Only
//!   `PT_LOAD` program headers are indexed; reads are positioned file reads.
//!
//! ## Typed Reads
//!
//! [`Reader`] wraps a provider and adds typed reads (`u8`..`u64`, pointers,
//! NUL-terminated strings), field reads by `(type, member)` name, and a
//! page-granular read cache. The slab and zone checks issue many small nested
//! reads per structure; the cache turns those into one read per page for the
//! duration of a check pass.
//!
//! ## Layouts
//!
//! Structure layouts come from a JSON [`LayoutDb`] in the spirit of
//! dwarf2json output: type name → size, members (dotted paths for nested
//! members, e.g. `core_layout.base`) and enumerators.

pub mod elf_core;
pub mod image;
pub mod layout;
pub mod reader;
pub mod symbol_file;

use serde::{Deserialize, Serialize};

use crate::domain::AccessError;

pub use elf_core::ElfCore;
pub use image::SparseImage;
pub use layout::{FieldLayout, LayoutDb, TypeLayout};
pub use reader::{Reader, StructBytes, MAX_CSTRING};

/// Architecture facts about the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchInfo {
    /// Pointer / `unsigned long` width in bytes
    pub pointer_size: u8,
    pub page_size: u64,
    pub page_shift: u32,
    #[serde(default)]
    pub big_endian: bool,
}

impl ArchInfo {
    #[must_use]
    pub fn x86_64() -> Self {
        Self { pointer_size: 8, page_size: 4096, page_shift: 12, big_endian: false }
    }

    /// Width of the page flags word in bits
    #[must_use]
    pub fn bits_per_long(&self) -> u32 {
        u32::from(self.pointer_size) * 8
    }
}

impl Default for ArchInfo {
    fn default() -> Self {
        Self::x86_64()
    }
}

/// The read-only view of a kernel memory image
///
/// Implementations own the image bytes, the symbol table and the type
/// layouts. Failures to read are reported as [`AccessError::UnreadableMemory`].
pub trait MemoryAccess {
    /// Fill `buf` with the bytes at virtual address `addr`
    ///
    /// # Errors
    /// Returns `UnreadableMemory` if any byte of the range is not backed.
    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<(), AccessError>;

    /// Resolve a global symbol to its address
    ///
    /// # Errors
    /// Returns `SymbolNotFound` if the symbol is unknown.
    fn resolve_symbol(&self, name: &str) -> Result<u64, AccessError>;

    /// Look up a structure, union or enum layout by its C name
    ///
    /// # Errors
    /// Returns `TypeNotFound` if the layout database does not describe it.
    fn type_layout(&self, name: &str) -> Result<&TypeLayout, AccessError>;

    /// Architecture of the target
    fn architecture_info(&self) -> ArchInfo;

    /// Named compile-time constant (`SECTION_SIZE_BITS`, ...) if known
    fn constant(&self, _name: &str) -> Option<i64> {
        None
    }
}
