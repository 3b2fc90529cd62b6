//! # kmemscope - Main Entry Point
//!
//! Opens one target (ELF core or flat dump), attaches a [`Session`] and runs a
//! single subcommand against it. Checks print a findings report; lookups print
//! the reconstructed object.
//!
//! Exit status: 0 when the command found nothing wrong, 3 when a check
//! reported findings, 2 for usage errors and 1 for anything that stopped the
//! command from running.

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::io::{self, Write};

use kmemscope::cli::{Args, Command, TargetArgs};
use kmemscope::domain::{DepotHandle, Pfn};
use kmemscope::export::Report;
use kmemscope::kernel::KernelConfig;
use kmemscope::memory::symbol_file::{load_system_map, load_vmlinux_symbols};
use kmemscope::memory::{ElfCore, LayoutDb, MemoryAccess, SparseImage};
use kmemscope::session::Session;
use kmemscope::symbolization::{SourceLocator, SymbolResolver};

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_FINDINGS: i32 = 3;

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct UsageError(String);

fn main() {
    env_logger::init();
    let args = Args::parse();
    std::process::exit(match run(&args) {
        Ok(true) => EXIT_SUCCESS,
        Ok(false) => EXIT_FINDINGS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<UsageError>().is_some() {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

/// Global symbols from System.map or vmlinux, with the KASLR slide applied
fn load_symbols(target: &TargetArgs) -> Result<HashMap<String, u64>> {
    if let Some(path) = &target.system_map {
        return load_system_map(path, target.kaslr_offset)
            .with_context(|| format!("Failed to load System.map {}", path.display()));
    }
    if let Some(path) = &target.vmlinux {
        return load_vmlinux_symbols(path, target.kaslr_offset)
            .with_context(|| format!("Failed to load symbols from {}", path.display()));
    }
    Err(UsageError("one of --system-map or --vmlinux is required to locate kernel globals".into()).into())
}

fn open_target(target: &TargetArgs, symbols: HashMap<String, u64>) -> Result<Box<dyn MemoryAccess>> {
    let layouts = LayoutDb::from_path(&target.layout)
        .with_context(|| format!("Failed to load layout database {}", target.layout.display()))?;

    match (&target.vmcore, &target.raw, target.base) {
        (Some(path), None, _) => {
            let core = ElfCore::open(path, layouts, symbols)
                .with_context(|| format!("Failed to open core {}", path.display()))?;
            Ok(Box::new(core))
        }
        (None, Some(path), Some(base)) => {
            let mut image = SparseImage::from_raw_file(path, base, layouts)
                .with_context(|| format!("Failed to read dump {}", path.display()))?;
            image.set_symbols(symbols);
            Ok(Box::new(image))
        }
        _ => Err(UsageError("exactly one of --vmcore or --raw (with --base) is required".into()).into()),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let mut out = io::stdout().lock();
    serde_json::to_writer_pretty(&mut out, value).context("Failed to serialize output")?;
    writeln!(out)?;
    Ok(())
}

/// Findings met while listing go to stderr so stdout stays the listing
fn report_to_stderr(report: &Report, json: bool) -> Result<bool> {
    if !report.is_clean() && !json {
        report.write_text(&mut io::stderr().lock())?;
    }
    Ok(report.is_clean())
}

fn print_report(report: &Report, json: bool) -> Result<bool> {
    let mut out = io::stdout().lock();
    if json {
        report.write_json(&mut out)?;
    } else {
        report.write_text(&mut out)?;
    }
    Ok(report.is_clean())
}

/// Fall back to the external symbol table when kallsyms cannot be read
fn ensure_symbols(session: &mut Session<'_>, symbols: &HashMap<String, u64>) {
    let failure = session.symbols().err();
    if let Some(e) = failure {
        warn!("kallsyms unavailable ({e}), resolving from the external symbol table");
        session.set_symbols(SymbolResolver::from_symbols(symbols));
    }
}

fn run(args: &Args) -> Result<bool> {
    if matches!(args.command, Command::Stack { lines: true, .. }) && args.target.vmlinux.is_none() {
        return Err(UsageError("--lines requires --vmlinux".into()).into());
    }

    let symbols = load_symbols(&args.target)?;
    let config = args
        .target
        .kconfig
        .as_ref()
        .map(|path| KernelConfig::from_file(path).with_context(|| format!("Failed to read {}", path.display())))
        .transpose()?;

    let memory = open_target(&args.target, symbols.clone())?;
    let mut session = Session::new(memory.as_ref(), config);
    info!("Attached, {} global symbols available", symbols.len());

    match &args.command {
        Command::Sym { addr } => {
            ensure_symbols(&mut session, &symbols);
            let resolution = session.resolve(*addr)?;
            if args.json {
                print_json(&resolution)?;
            } else {
                println!("{addr:#x} {resolution}");
            }
            Ok(!resolution.is_unknown())
        }

        Command::Caches => {
            let catalog = session.caches()?;
            if args.json {
                print_json(&catalog.iter().collect::<Vec<_>>())?;
            } else {
                println!("{:<18} {:<28} {:>8} {:>6} {:>5}", "ADDR", "NAME", "OBJSIZE", "NUM", "ORDER");
                for cache in catalog.iter() {
                    println!(
                        "{:#018x} {:<28} {:>8} {:>6} {:>5}",
                        cache.addr, cache.name, cache.object_size, cache.num, cache.order
                    );
                }
            }
            report_to_stderr(&Report::new("caches", session.setup_findings(), catalog.findings().to_vec()), args.json)
        }

        Command::Slab { name, check } => {
            if *check {
                let findings = session.check_cache(name)?;
                return print_report(&Report::new(format!("slab {name}"), session.setup_findings(), findings), args.json);
            }
            let catalog = session.caches()?;
            let cache = catalog.by_name(name).with_context(|| format!("No slab cache named {name}"))?;
            if args.json {
                print_json(cache)?;
            } else {
                println!("{} at {:#x}", cache.name, cache.addr);
                println!("  object size   {}", cache.object_size);
                println!("  objects/slab  {}", cache.num);
                println!("  slab order    {}", cache.order);
                println!("  flags         {:#x}{}", cache.flags, if cache.off_slab { " (off-slab)" } else { "" });
            }
            Ok(true)
        }

        Command::CheckSlabs => {
            let findings = session.check_all_caches()?;
            print_report(&Report::new("all slab caches", session.setup_findings(), findings), args.json)
        }

        Command::Obj { addr } => {
            let lookup = session.find_object(*addr)?;
            if args.json {
                print_json(&lookup)?;
            } else {
                println!("{:#x}: object {:#x} of {} ({:#x})", lookup.addr, lookup.object, lookup.cache, lookup.cache_addr);
                println!("  slab    {:#x}", lookup.slab);
                println!("  status  {:?}", lookup.status);
            }
            Ok(true)
        }

        Command::Page { pfn } => {
            let page = session.page(Pfn(*pfn))?;
            if args.json {
                print_json(&page)?;
            } else {
                println!("{} descriptor {:#x} maps {:#x}", page.pfn, page.addr, page.linear);
                println!("  flags     {:#x}  {} {}", page.flags, page.node, page.zone);
                println!("  refcount  {}", page.refcount);
                println!("  mapping   {:#x}  private {:#x}", page.mapping, page.private);
                let kinds: Vec<&str> = [
                    (page.slab, "slab"),
                    (page.lru, "lru"),
                    (page.head, "head"),
                    (page.tail, "tail"),
                    (page.buddy, "buddy"),
                    (page.anonymous, "anon"),
                ]
                .iter()
                .filter_map(|&(set, name)| set.then_some(name))
                .collect();
                println!("  state     {}", if kinds.is_empty() { "-".to_string() } else { kinds.join(" ") });
            }
            Ok(true)
        }

        Command::Zones { check } => {
            if *check {
                let findings = session.check_zones()?;
                return print_report(&Report::new("zones", session.setup_findings(), findings), args.json);
            }
            let (zones, findings) = session.zones(false)?;
            if args.json {
                print_json(&zones)?;
            } else {
                for zone in &zones {
                    println!("{} {} {:<10} {:#018x} present {}", zone.node, zone.zid, zone.name, zone.addr, zone.present_pages);
                }
            }
            report_to_stderr(&Report::new("zones", session.setup_findings(), findings), args.json)
        }

        Command::Vmstat => {
            let (stats, findings) = session.zone_stats()?;
            if args.json {
                print_json(&stats)?;
            } else {
                for zone in &stats {
                    println!("{} {}", zone.node, zone.zone);
                    for (name, value) in &zone.global {
                        let diff = zone.diffs.get(name).copied().unwrap_or(0);
                        println!("  {name:<32} {value:>14} {diff:>+8}");
                    }
                }
            }
            report_to_stderr(&Report::new("vmstat", session.setup_findings(), findings), args.json)
        }

        Command::Stack { handle, lines } => {
            ensure_symbols(&mut session, &symbols);
            let frames = session.stack(DepotHandle(*handle))?;
            let locator = match (&args.target.vmlinux, *lines) {
                (Some(path), true) => Some(SourceLocator::new(path, args.target.kaslr_offset)?),
                _ => None,
            };

            if args.json {
                print_json(&frames)?;
            } else {
                println!("{}", DepotHandle(*handle));
                for (i, frame) in frames.iter().enumerate() {
                    println!("  #{i:<2} {:#018x} {}", frame.address, frame.symbol);
                    if let Some(locator) = &locator {
                        for source in locator.locate(frame.address) {
                            println!("        {source}");
                        }
                    }
                }
            }
            Ok(true)
        }
    }
}
