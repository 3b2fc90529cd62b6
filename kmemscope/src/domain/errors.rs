//! Structured error types for kmemscope
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! Errors here abort the smallest enclosing unit of work; anything that can be
//! reported and skipped is a [`Finding`](super::Finding) instead.

use serde::Serialize;
use thiserror::Error;

/// Failures of the memory access boundary
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
pub enum AccessError {
    #[error("cannot read {len} bytes at {addr:#x}")]
    UnreadableMemory { addr: u64, len: usize },

    #[error("symbol {0} not found")]
    SymbolNotFound(String),

    #[error("type {0} not found")]
    TypeNotFound(String),

    #[error("{ty} has no member {field}")]
    FieldNotFound { ty: String, field: String },

    #[error("{ty} has no enumerator {name}")]
    EnumeratorNotFound { ty: String, name: String },
}

impl AccessError {
    /// True for the "no mapping" family (symbol, type, member or enumerator)
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        !matches!(self, AccessError::UnreadableMemory { .. })
    }
}

/// Errors raised while reconstructing kernel structures
#[derive(Error, Debug)]
pub enum ModelError {
    #[error(transparent)]
    Access(#[from] AccessError),

    #[error("{0} has no mapping")]
    NotFound(String),

    #[error("unsupported layout for {what}: {detail}")]
    UnsupportedLayout { what: String, detail: String },

    #[error("corrupted {what} at {addr:#x}: {detail}")]
    Corruption { what: String, addr: u64, detail: String },
}

impl ModelError {
    pub(crate) fn unsupported(what: impl Into<String>, detail: impl Into<String>) -> Self {
        ModelError::UnsupportedLayout { what: what.into(), detail: detail.into() }
    }

    pub(crate) fn corruption(what: impl Into<String>, addr: u64, detail: impl Into<String>) -> Self {
        ModelError::Corruption { what: what.into(), addr, detail: detail.into() }
    }
}

/// Structural failures of a `list_head` traversal
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ListError {
    #[error("list head is a NULL pointer")]
    NullHead,

    #[error("{link} pointer is NULL at {node:#x}")]
    NullLink { node: u64, link: String },

    #[error("broken {link} link {prev:#x} -> {node:#x} -{link}-> {found:#x}")]
    BrokenLink { prev: u64, node: u64, found: u64, link: String },

    #[error("cycle detected at {node:#x}")]
    Cycle { node: u64 },

    #[error("more than {limit} entries")]
    TooLong { limit: usize },

    #[error(transparent)]
    Unreadable(#[from] AccessError),
}

/// Errors loading external inputs (cores, layout databases, symbol files)
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("No loadable segments in {0}")]
    NoSegments(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_error_display() {
        let err = AccessError::UnreadableMemory { addr: 0x1000, len: 8 };
        assert_eq!(err.to_string(), "cannot read 8 bytes at 0x1000");
        assert!(!err.is_not_found());
        assert!(AccessError::SymbolNotFound("max_pfn".into()).is_not_found());
    }

    #[test]
    fn test_model_error_wraps_access() {
        let err: ModelError = AccessError::TypeNotFound("struct page".into()).into();
        assert!(err.to_string().contains("struct page"));
    }

    #[test]
    fn test_broken_link_display() {
        let err = ListError::BrokenLink { prev: 0x10, node: 0x20, found: 0x30, link: "prev".into() };
        let msg = err.to_string();
        assert!(msg.contains("0x10"));
        assert!(msg.contains("0x30"));
    }
}
