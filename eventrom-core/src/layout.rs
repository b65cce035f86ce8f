use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::Result;

/// Fixed addresses and record shapes of the image being edited.
///
/// Offsets are file offsets unless named `*_base`. Values default to the
/// HiROM layout of the English release; a JSON file may override any subset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RomLayout {
    pub bank_size: usize,
    /// ROM address mapped to file offset 0.
    pub rom_base: usize,

    pub location_table: usize,
    pub location_record_size: usize,
    pub location_count: usize,
    /// Byte offset of the 2-byte event index inside a location record.
    pub event_index_field: usize,
    /// Byte offset of the 2-byte coordinate bounds inside a location record.
    pub bounds_field: usize,

    pub event_pointer_table: usize,
    pub event_pointer_count: usize,

    /// Reclaimable `[start, end)` file ranges known before any edit.
    pub free_ranges: Vec<(usize, usize)>,
}

impl Default for RomLayout {
    fn default() -> Self {
        RomLayout {
            bank_size: 0x1_0000,
            rom_base: 0xC0_0000,
            location_table: 0x36_0000,
            location_record_size: 14,
            location_count: 0x200,
            event_index_field: 8,
            bounds_field: 12,
            event_pointer_table: 0x3C_F9F0,
            event_pointer_count: 0x201,
            free_ranges: Vec::new(),
        }
    }
}

impl RomLayout {
    pub fn from_json_str(src: &str) -> Result<Self> {
        Ok(serde_json::from_str(src)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
