//! # kmemscope - Kernel Memory-Management Inspector
//!
//! kmemscope reads a Linux kernel memory image (a kdump `vmcore`,
//! `/proc/kcore`, or a flat dump) and reconstructs the memory-management
//! state inside it: slab caches, page descriptors, zones and their free
//! lists, per-CPU statistics and stack depot records. It then checks that
//! state for the inconsistencies a corrupted kernel leaves behind.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │            Memory image (vmcore, kcore, raw dump)               │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ MemoryAccess: bytes, symbols, layouts
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  memory::Reader   typed reads, field reads, page read cache     │
//! └───────┬───────────────────┬─────────────────────┬───────────────┘
//!         ▼                   ▼                     ▼
//! ┌──────────────┐   ┌──────────────────┐   ┌──────────────────┐
//! │    kernel    │   │        mm        │   │  symbolization   │
//! │ lists, cpus, │──▶│ page, slab, zone │   │ kallsyms, module │
//! │ nodes, config│   │     checks       │   │  symtabs, DWARF  │
//! └──────────────┘   └────────┬─────────┘   └────────┬─────────┘
//!                             │ findings             │ names
//!                             ▼                      ▼
//!                     ┌──────────────┐      ┌──────────────────┐
//!                     │    export    │      │   stack_depot    │
//!                     │ text / JSON  │      │ handle → frames  │
//!                     └──────────────┘      └──────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`memory`]: the [`memory::MemoryAccess`] boundary, ELF core and flat
//!   image providers, the JSON layout database and symbol files
//! - [`kernel`]: generic kernel structures: `list_head` walks with cycle
//!   recovery, CPU and node masks, per-CPU offsets, kernel configuration
//! - [`mm`]: the memory-management model
//!   - `page`: `struct page` addressing under FLATMEM and SPARSEMEM,
//!     compound heads, buddy detection
//!   - `slab`: SLAB caches, slab descriptors, array caches and the
//!     consistency check
//!   - `zone`: zone enumeration, buddy and per-CPU free list checks,
//!     `vm_stat` with per-CPU deltas
//! - [`symbolization`]: address → `name+offset/size`
//! - [`stack_depot`]: decode stack depot handles into symbolized frames
//! - [`session`]: one attached target with memoized catalogs
//! - [`domain`]: identifiers, errors and the [`domain::Finding`] catalogue
//! - [`export`]: findings reports
//! - [`cli`]: command-line arguments
//!
//! ## Findings, Not Failures
//!
//! A corrupted kernel is the expected input. Checks never stop at the first
//! bad pointer: every inconsistency becomes a [`domain::Finding`] and the
//! walk continues where it safely can. Errors are reserved for the cases
//! where nothing can be said at all (no layout for `struct kmem_cache`, no
//! `node_data`).
//!
//! ## Typical Usage
//!
//! ```bash
//! # List slab caches in a crash dump
//! kmemscope --vmcore vmcore --system-map System.map --layout layout.json caches
//!
//! # Full consistency check of one cache, as JSON
//! kmemscope --vmcore vmcore --system-map System.map --layout layout.json slab dentry --check --json
//!
//! # Free-list check of every zone
//! kmemscope --vmcore vmcore --vmlinux vmlinux --layout layout.json zones --check
//! ```

pub mod cli;
pub mod domain;
pub mod export;
pub mod kernel;
pub mod memory;
pub mod mm;
pub mod session;
pub mod stack_depot;
pub mod symbolization;
