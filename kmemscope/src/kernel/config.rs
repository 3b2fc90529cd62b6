//! Kernel build configuration (`CONFIG_*`)
//!
//! Taken from the in-image `kernel_config_data` blob when the kernel was
//! built with `CONFIG_IKCONFIG`, or from a `.config` file supplied by the
//! user. Callers that need a value and find none substitute a documented
//! default through [`KernelConfig::int_or`], which records the substitution.

use flate2::read::GzDecoder;
use std::collections::HashMap;
use std::fs;
use std::io::{self, Read};
use std::path::Path;

use crate::domain::{Finding, LoadError, ModelError};
use crate::memory::Reader;

const MAGIC_START: &[u8] = b"IKCFG_ST";

/// Cap on the compressed blob; real configs are well below 100 KiB
const MAX_COMPRESSED: u64 = 1 << 20;

/// Where the configuration came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Image,
    File(String),
    Unavailable,
}

#[derive(Debug, Clone)]
pub struct KernelConfig {
    values: HashMap<String, String>,
    source: ConfigSource,
}

impl KernelConfig {
    /// Parse `.config` text
    ///
    /// `# CONFIG_FOO is not set` lines are comments and leave `FOO` absent.
    #[must_use]
    pub fn parse(text: &str, source: ConfigSource) -> Self {
        let mut values = HashMap::new();
        for line in text.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            let Some(rest) = line.strip_prefix("CONFIG_") else { continue };
            let Some((name, value)) = rest.split_once('=') else { continue };
            values.insert(name.to_string(), value.trim_matches('"').to_string());
        }
        Self { values, source }
    }

    /// # Errors
    /// Returns an error if the file cannot be read
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        let text = fs::read_to_string(path.as_ref())?;
        let config = Self::parse(&text, ConfigSource::File(path.as_ref().display().to_string()));
        log::info!("Loaded {} config options from {}", config.values.len(), path.as_ref().display());
        Ok(config)
    }

    /// Decompress the `IKCFG_ST` gzip blob embedded in the kernel image
    ///
    /// # Errors
    /// Returns `NotFound` if the kernel carries no config blob, `Corruption`
    /// if the blob is malformed
    pub fn from_image(reader: &Reader<'_>) -> Result<Self, ModelError> {
        let addr = reader.symbol("kernel_config_data")?;
        let magic = reader.read_vec(addr, MAGIC_START.len())?;
        if magic != MAGIC_START {
            return Err(ModelError::corruption("kernel_config_data", addr, "missing IKCFG_ST marker"));
        }

        let stream = MemoryStream {
            reader,
            addr: addr + MAGIC_START.len() as u64,
            remaining: MAX_COMPRESSED,
        };
        let mut text = String::new();
        GzDecoder::new(stream)
            .read_to_string(&mut text)
            .map_err(|e| ModelError::corruption("kernel_config_data", addr, e.to_string()))?;

        let config = Self::parse(&text, ConfigSource::Image);
        log::info!("Decoded {} config options from the in-image config", config.values.len());
        Ok(config)
    }

    /// Configuration that answers every lookup with "unknown"
    #[must_use]
    pub fn unavailable() -> Self {
        Self { values: HashMap::new(), source: ConfigSource::Unavailable }
    }

    #[must_use]
    pub fn source(&self) -> &ConfigSource {
        &self.source
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.source != ConfigSource::Unavailable
    }

    /// Raw value; accepts the option name with or without `CONFIG_`
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        let name = name.strip_prefix("CONFIG_").unwrap_or(name);
        self.values.get(name).map(String::as_str)
    }

    /// `Some(true)` for `y`/`m`, `Some(false)` if absent from a known config,
    /// `None` if no configuration is available at all
    #[must_use]
    pub fn enabled(&self, name: &str) -> Option<bool> {
        if !self.is_available() {
            return None;
        }
        Some(matches!(self.get(name), Some("y" | "m")))
    }

    /// Integer value, decimal or `0x` hex
    #[must_use]
    pub fn int(&self, name: &str) -> Option<i64> {
        let value = self.get(name)?;
        match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
            Some(hex) => i64::from_str_radix(hex, 16).ok(),
            None => value.parse().ok(),
        }
    }

    /// Integer value or `default`, recording the fallback in `notes`
    pub fn int_or(&self, name: &str, default: i64, notes: &mut Vec<Finding>) -> i64 {
        if let Some(value) = self.int(name) {
            return value;
        }
        log::warn!("{name} unavailable, using default {default}");
        notes.push(Finding::config_default(name, default));
        default
    }
}

/// Sequential [`Read`] over target memory
struct MemoryStream<'r, 'm> {
    reader: &'r Reader<'m>,
    addr: u64,
    remaining: u64,
}

impl Read for MemoryStream<'_, '_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len = buf.len().min(512).min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        if len == 0 {
            return Ok(0);
        }
        self.reader.read(self.addr, &mut buf[..len]).map_err(io::Error::other)?;
        self.addr += len as u64;
        self.remaining -= len as u64;
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ArchInfo, SparseImage};
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    const TEXT: &str = "\
#
# Automatically generated file; DO NOT EDIT.
#
CONFIG_NODES_SHIFT=6
CONFIG_SLAB=y
# CONFIG_SLUB is not set
CONFIG_KALLSYMS_BASE_RELATIVE=y
CONFIG_LOCALVERSION=\"-test\"
CONFIG_PHYSICAL_START=0x1000000
";

    #[test]
    fn test_parse_config_text() {
        let config = KernelConfig::parse(TEXT, ConfigSource::Image);
        assert_eq!(config.int("NODES_SHIFT"), Some(6));
        assert_eq!(config.int("CONFIG_PHYSICAL_START"), Some(0x100_0000));
        assert_eq!(config.enabled("SLAB"), Some(true));
        assert_eq!(config.enabled("SLUB"), Some(false));
        assert_eq!(config.get("LOCALVERSION"), Some("-test"));
    }

    #[test]
    fn test_unavailable_records_default() {
        let config = KernelConfig::unavailable();
        let mut notes = Vec::new();
        assert_eq!(config.int_or("NODES_SHIFT", 6, &mut notes), 6);
        assert_eq!(config.enabled("SLAB"), None);
        assert_eq!(notes.len(), 1);
        assert!(notes[0].to_string().contains("NODES_SHIFT"));
    }

    #[test]
    fn test_from_image_blob() {
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(TEXT.as_bytes()).unwrap();
        let compressed = gz.finish().unwrap();

        let mut blob = MAGIC_START.to_vec();
        blob.extend_from_slice(&compressed);
        blob.extend_from_slice(b"IKCFG_ED\0");

        let mut img = SparseImage::new(ArchInfo::x86_64());
        img.map(0x10000, 0x4000);
        img.write(0x10000, &blob).unwrap();
        img.define_symbol("kernel_config_data", 0x10000);

        let reader = Reader::new(&img);
        let config = KernelConfig::from_image(&reader).unwrap();
        assert_eq!(config.source(), &ConfigSource::Image);
        assert_eq!(config.int("NODES_SHIFT"), Some(6));
    }

    #[test]
    fn test_from_image_without_marker() {
        let mut img = SparseImage::new(ArchInfo::x86_64());
        img.map(0x10000, 0x100);
        img.define_symbol("kernel_config_data", 0x10000);
        let reader = Reader::new(&img);
        assert!(matches!(KernelConfig::from_image(&reader), Err(ModelError::Corruption { .. })));
    }
}
