//! CLI argument definitions

use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

/// Parse `0x`-prefixed hex or decimal
///
/// # Errors
/// Returns a message clap shows as a usage error
pub fn parse_number(s: &str) -> Result<u64, String> {
    let s = s.trim().replace('_', "");
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number {s:?}: {e}"))
}

fn parse_handle(s: &str) -> Result<u32, String> {
    let value = parse_number(s)?;
    u32::try_from(value).map_err(|_| format!("handle {value:#x} does not fit in 32 bits"))
}

#[derive(Parser)]
#[command(
    name = "kmemscope",
    about = "Reconstruct and check kernel memory-management state from a memory image",
    after_help = "\
EXAMPLES:
    kmemscope --vmcore vmcore --layout layout.json caches
    kmemscope --vmcore /proc/kcore --layout layout.json slab dentry --check
    kmemscope --raw dump.bin --base 0xffff888000000000 --layout layout.json zones --check
    kmemscope --vmcore vmcore --layout layout.json sym 0xffffffff81234567"
)]
pub struct Args {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Print findings as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(ClapArgs)]
pub struct TargetArgs {
    /// ELF core file (vmcore or /proc/kcore)
    #[arg(long, value_name = "FILE", conflicts_with = "raw")]
    pub vmcore: Option<PathBuf>,

    /// Flat memory image (requires --base)
    #[arg(long, value_name = "FILE", requires = "base")]
    pub raw: Option<PathBuf>,

    /// Virtual address of the first byte of --raw
    #[arg(long, value_name = "ADDR", value_parser = parse_number)]
    pub base: Option<u64>,

    /// JSON type-layout database
    #[arg(long, value_name = "FILE")]
    pub layout: PathBuf,

    /// System.map for global symbols
    #[arg(long, value_name = "FILE", conflicts_with = "vmlinux")]
    pub system_map: Option<PathBuf>,

    /// vmlinux for global symbols (and source lines with --lines)
    #[arg(long, value_name = "FILE")]
    pub vmlinux: Option<PathBuf>,

    /// KASLR slide added to every symbol address
    #[arg(long, value_name = "ADDR", value_parser = parse_number, default_value = "0")]
    pub kaslr_offset: u64,

    /// Kernel .config to use instead of the in-image configuration
    #[arg(long, value_name = "FILE")]
    pub kconfig: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Resolve an address to name+offset/size
    Sym {
        #[arg(value_parser = parse_number)]
        addr: u64,
    },
    /// List slab caches
    Caches,
    /// Show one slab cache, or check it
    Slab {
        name: String,
        /// Run the full consistency check
        #[arg(long)]
        check: bool,
    },
    /// Check every slab cache
    CheckSlabs,
    /// Locate a slab object
    Obj {
        #[arg(value_parser = parse_number)]
        addr: u64,
    },
    /// Decode a page descriptor
    Page {
        #[arg(value_parser = parse_number)]
        pfn: u64,
    },
    /// List zones, or check their free lists
    Zones {
        #[arg(long)]
        check: bool,
    },
    /// Zone statistics with per-CPU deltas
    Vmstat,
    /// Decode a stack depot handle
    Stack {
        #[arg(value_parser = parse_handle)]
        handle: u32,
        /// Add source lines from --vmlinux
        #[arg(long)]
        lines: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("0x10"), Ok(16));
        assert_eq!(parse_number("0xffff_8880_0000_0000"), Ok(0xffff_8880_0000_0000));
        assert_eq!(parse_number("42"), Ok(42));
        assert!(parse_number("zz").is_err());
        assert!(parse_handle("0x1_0000_0000").is_err());
    }

    #[test]
    fn test_parse_subcommand() {
        let args = Args::try_parse_from([
            "kmemscope", "--vmcore", "vmcore", "--layout", "l.json", "slab", "dentry", "--check", "--json",
        ])
        .unwrap();
        assert!(args.json);
        assert!(matches!(args.command, Command::Slab { ref name, check: true } if name == "dentry"));
    }
}
