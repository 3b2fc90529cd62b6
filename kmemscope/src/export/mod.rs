//! Report export
//!
//! Findings are rendered either as one text line per finding or as a JSON
//! document carrying each finding's category, message and typed fields.

pub mod report;

pub use report::Report;
