use addr2line::Context;
use anyhow::{Context as _, Result};
use gimli::{Dwarf, EndianRcSlice, RunTimeEndian, SectionId};
use object::{Object, ObjectSection};
use serde::Serialize;
use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::rc::Rc;

type Slice = EndianRcSlice<RunTimeEndian>;

/// DWARF line lookup against a `vmlinux` with debug info
///
/// Runtime addresses are shifted back by the KASLR offset before the lookup.
/// Results are cached per address: stack depot records repeat the same
/// allocation paths over and over.
pub struct SourceLocator {
    ctx: Context<Slice>,
    kaslr_offset: u64,
    cache: RefCell<HashMap<u64, Vec<SourceFrame>>>,
}

/// One (possibly inlined) function at an address
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceFrame {
    pub function: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

impl fmt::Display for SourceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.function)?;
        match (&self.file, self.line) {
            (Some(file), Some(line)) => write!(f, " at {file}:{line}"),
            (Some(file), None) => write!(f, " at {file}"),
            _ => Ok(()),
        }
    }
}

/// Every DWARF section of an ELF image; absent sections load empty
fn load_dwarf(elf: &object::File<'_>) -> Result<Dwarf<Slice>, gimli::Error> {
    let endian = if elf.is_little_endian() { RunTimeEndian::Little } else { RunTimeEndian::Big };
    Dwarf::load(|id: SectionId| {
        let bytes = elf
            .section_by_name(id.name())
            .and_then(|section| section.uncompressed_data().ok())
            .unwrap_or(Cow::Borrowed(&[][..]));
        Ok::<_, gimli::Error>(EndianRcSlice::new(Rc::from(&*bytes), endian))
    })
}

impl SourceLocator {
    /// Load DWARF from a `vmlinux`
    ///
    /// # Errors
    /// Returns an error if the file is not a readable ELF image or carries
    /// no usable debug info
    pub fn new<P: AsRef<Path>>(vmlinux: P, kaslr_offset: u64) -> Result<Self> {
        let path = vmlinux.as_ref();
        let data = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let elf = object::File::parse(&*data).with_context(|| format!("{} is not an ELF image", path.display()))?;
        let dwarf = load_dwarf(&elf).context("Failed to load DWARF sections")?;
        let ctx = Context::from_dwarf(dwarf).context("Failed to index DWARF debug information")?;

        log::info!("Loaded DWARF line tables from {}", path.display());
        Ok(Self { ctx, kaslr_offset, cache: RefCell::new(HashMap::new()) })
    }

    /// Source frames for a runtime address, innermost first; empty if unknown
    pub fn locate(&self, addr: u64) -> Vec<SourceFrame> {
        if let Some(cached) = self.cache.borrow().get(&addr) {
            return cached.clone();
        }

        let mut frames = Vec::new();
        let link_addr = addr.wrapping_sub(self.kaslr_offset);
        if let Ok(mut frame_iter) = self.ctx.find_frames(link_addr).skip_all_loads() {
            while let Ok(Some(frame)) = frame_iter.next() {
                let function = frame
                    .function
                    .and_then(|f| f.demangle().ok().map(|s| s.to_string()))
                    .unwrap_or_else(|| "<unknown>".to_string());
                let (file, line) = frame
                    .location
                    .map_or((None, None), |loc| (loc.file.map(std::string::ToString::to_string), loc.line));
                frames.push(SourceFrame { function, file, line });
            }
        }

        self.cache.borrow_mut().insert(addr, frames.clone());
        frames
    }
}
