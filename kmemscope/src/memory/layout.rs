//! Structure layout database
//!
//! Loaded from a JSON file shaped like this:
//!
//! ```json
//! {
//!   "arch": { "pointer_size": 8, "page_size": 4096, "page_shift": 12 },
//!   "constants": { "SECTION_SIZE_BITS": 27 },
//!   "types": {
//!     "struct page": {
//!       "size": 64,
//!       "fields": { "flags": { "offset": 0, "size": 8 } }
//!     },
//!     "enum pageflags": { "size": 4, "enumerators": { "PG_slab": 9 } }
//!   }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use super::ArchInfo;
use crate::domain::LoadError;

/// Placement of one structure member
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldLayout {
    pub offset: u64,
    pub size: u64,
    /// Bit position inside the storage unit, for bitfields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bit_offset: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bit_size: Option<u32>,
}

/// Layout of one named type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeLayout {
    pub size: u64,
    #[serde(default)]
    pub fields: HashMap<String, FieldLayout>,
    #[serde(default)]
    pub enumerators: HashMap<String, i64>,
}

impl TypeLayout {
    #[must_use]
    pub fn new(size: u64) -> Self {
        Self { size, ..Self::default() }
    }

    /// Builder-style member definition
    #[must_use]
    pub fn field(mut self, name: &str, offset: u64, size: u64) -> Self {
        self.fields.insert(name.to_string(), FieldLayout { offset, size, ..FieldLayout::default() });
        self
    }

    /// Builder-style bitfield definition
    #[must_use]
    pub fn bitfield(mut self, name: &str, offset: u64, size: u64, bit_offset: u32, bits: u32) -> Self {
        self.fields.insert(
            name.to_string(),
            FieldLayout { offset, size, bit_offset: Some(bit_offset), bit_size: Some(bits) },
        );
        self
    }

    /// Builder-style enumerator definition
    #[must_use]
    pub fn enumerator(mut self, name: &str, value: i64) -> Self {
        self.enumerators.insert(name.to_string(), value);
        self
    }

    #[must_use]
    pub fn member(&self, name: &str) -> Option<&FieldLayout> {
        self.fields.get(name)
    }

    #[must_use]
    pub fn has_member(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    #[must_use]
    pub fn enum_value(&self, name: &str) -> Option<i64> {
        self.enumerators.get(name).copied()
    }
}

/// All layouts known for one target kernel
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LayoutDb {
    #[serde(default)]
    pub arch: ArchInfo,
    #[serde(default)]
    pub constants: HashMap<String, i64>,
    #[serde(default)]
    pub types: HashMap<String, TypeLayout>,
}

impl LayoutDb {
    #[must_use]
    pub fn new(arch: ArchInfo) -> Self {
        Self { arch, ..Self::default() }
    }

    /// Load a layout database from a JSON file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or is not valid JSON
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        let text = fs::read_to_string(path.as_ref())?;
        let db: LayoutDb = serde_json::from_str(&text)?;
        log::info!(
            "Loaded {} type layouts from {}",
            db.types.len(),
            path.as_ref().display()
        );
        Ok(db)
    }

    pub fn insert(&mut self, name: &str, layout: TypeLayout) {
        self.types.insert(name.to_string(), layout);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&TypeLayout> {
        self.types.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_layout_json() {
        let json = r#"{
            "arch": { "pointer_size": 8, "page_size": 4096, "page_shift": 12 },
            "constants": { "SECTION_SIZE_BITS": 27 },
            "types": {
                "struct list_head": {
                    "size": 16,
                    "fields": { "next": { "offset": 0, "size": 8 }, "prev": { "offset": 8, "size": 8 } }
                },
                "enum zone_type": { "size": 4, "enumerators": { "__MAX_NR_ZONES": 4 } }
            }
        }"#;
        let db: LayoutDb = serde_json::from_str(json).unwrap();
        assert_eq!(db.arch.page_shift, 12);
        assert_eq!(db.constants["SECTION_SIZE_BITS"], 27);
        let list = db.get("struct list_head").unwrap();
        assert_eq!(list.member("prev").unwrap().offset, 8);
        assert_eq!(db.get("enum zone_type").unwrap().enum_value("__MAX_NR_ZONES"), Some(4));
    }

    #[test]
    fn test_builder() {
        let t = TypeLayout::new(24)
            .field("a", 0, 8)
            .bitfield("b", 8, 4, 3, 5)
            .enumerator("X", 7);
        assert!(t.has_member("a"));
        assert_eq!(t.member("b").unwrap().bit_size, Some(5));
        assert_eq!(t.enum_value("X"), Some(7));
    }
}
