//! Command-line interface

pub mod args;

pub use args::{parse_number, Args, Command, TargetArgs};
