//! Kernel plumbing shared by the engines
//!
//! Build configuration, `list_head` traversal, bitmaps, per-CPU variables and
//! the NUMA node table. None of this is consistency logic on its own; the
//! page, slab and zone models build on it.

pub mod bitmap;
pub mod config;
pub mod list;
pub mod node;
pub mod percpu;

pub use config::KernelConfig;
pub use list::{walk_list, walk_with_retry, ListWalk, WalkOutcome, DEFAULT_LIST_LIMIT};
pub use node::NodeTopology;
pub use percpu::PerCpu;
