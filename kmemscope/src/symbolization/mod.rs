//! # Kernel Symbol Resolution
//!
//! Turns kernel addresses into `name+offset/size` without a debugger and
//! without trusting anything but the memory image.
//!
//! ## Sources of Names
//!
//! ### kallsyms
//!
//! Every kernel built with `CONFIG_KALLSYMS` carries its own symbol table in
//! memory, compressed with a 256-entry token dictionary:
//!
//! ```text
//! kallsyms_names:        [len][tok][tok]...  [len][tok]...   one entry per symbol
//! kallsyms_token_index:  u16[256]   offset of each token in the table
//! kallsyms_token_table:  "Tkmem_\0cache\0_alloc\0..."
//! kallsyms_markers:      u32[]      offset of every 256th name
//! ```
//!
//! A name expands by concatenating its tokens; the first character of the
//! result is the symbol type (`T`, `t`, `D`, ...) and is dropped. Lengths of
//! 128 tokens or more take two bytes (high bit of the first byte set).
//!
//! **Addresses** come in three encodings, chosen once per session:
//! - `kallsyms_addresses[]`: absolute addresses (old kernels)
//! - `kallsyms_offsets[]` + `kallsyms_relative_base` with absolute per-CPU
//!   symbols: non-negative entries are absolute, negative entries encode
//!   `base - 1 - offset`
//! - `kallsyms_offsets[]` relative to the base throughout
//!
//! ### Module symbol tables
//!
//! Modules keep their own `Elf64_Sym` arrays. Addresses outside the main
//! kernel image are looked up by a linear scan of the module whose core or
//! init segment contains them.
//!
//! ### Static tables
//!
//! With `--system-map` or `--vmlinux` the resolver can also run from an
//! external `name -> address` table.
//!
//! ## Lookup Semantics
//!
//! - Binary search for the greatest start <= address; aliases sharing a
//!   start resolve to the first of the run.
//! - Size is the distance to the next *distinct* address. The very last
//!   symbol has no successor; its size is reported equal to the offset and
//!   the result is flagged approximate.
//! - Unresolvable addresses yield [`Resolution::Unknown`], never an error.
//!
//! ## Source Lines
//!
//! [`SourceLocator`] adds `file:line` from DWARF in a `vmlinux` (via
//! `addr2line`, `gimli` and `object`). It is optional enrichment for stack
//! depot frames.

pub mod kallsyms;
pub mod modules;
pub mod resolver;
pub mod source_lines;

pub use kallsyms::{AddressMode, Kallsyms, SymbolPos, TokenTable};
pub use modules::ModuleRegion;
pub use resolver::{demangle_symbol, Resolution, ResolvedSymbol, SymbolResolver};
pub use source_lines::{SourceFrame, SourceLocator};
