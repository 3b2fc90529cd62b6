//! Domain model for kmemscope
//!
//! This module contains core domain types, errors and findings that provide:
//! - Compile-time safety via newtype pattern
//! - Self-documenting function signatures
//! - Structured error handling and typed diagnostics

pub mod errors;
pub mod findings;
pub mod types;

// Re-export common types for convenience
pub use types::{CpuId, DepotHandle, NodeId, Pfn, ZoneId};

pub use errors::{AccessError, ListError, LoadError, ModelError};
pub use findings::{ArrayCacheOrigin, Category, Direction, FreeArea, Finding, PageProblem, SlabList};
