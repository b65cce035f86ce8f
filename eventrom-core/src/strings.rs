use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::rom::RomImage;
use crate::{Result, RomError};

const TERMINATOR: u8 = 0x00;
const MAX_STRINGS: usize = 0x100;

/// Strings referenced by a script's textbox commands.
///
/// On disk a table is a run of 2-byte bank-relative pointers followed by
/// 0x00-terminated strings. Loaded indices may be sparse until the first
/// edit compacts them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct StringTable {
    strings: BTreeMap<usize, Vec<u8>>,
    compacted: bool,
    dirty: bool,
    /// File range of the block the strings came from, when it holds nothing else.
    extent: Option<(usize, usize)>,
}

fn read_terminated(rom: &RomImage, start: usize, limit: usize) -> Result<Vec<u8>> {
    let limit = limit.min(rom.len());
    let bytes = rom.data().get(start..limit).ok_or_else(|| {
        RomError::StringTable(format!("string at {:#X} lies outside its bank", start))
    })?;
    let len = bytes
        .iter()
        .position(|&b| b == TERMINATOR)
        .ok_or_else(|| {
            RomError::StringTable(format!("string at {:#X} is not terminated", start))
        })?;
    Ok(bytes[..len].to_vec())
}

fn check_text(text: &[u8]) -> Result<()> {
    if text.contains(&TERMINATOR) {
        return Err(RomError::InvalidArgument(
            "string contains the 0x00 terminator".to_string(),
        ));
    }
    Ok(())
}

impl StringTable {
    pub(crate) fn from_loaded(strings: BTreeMap<usize, Vec<u8>>, extent: Option<(usize, usize)>) -> Self {
        StringTable {
            strings,
            compacted: false,
            dirty: false,
            extent,
        }
    }

    /// Reads the strings at `used` indices from the table at file offset `table`.
    pub(crate) fn load(rom: &RomImage, table: usize, used: &BTreeSet<usize>) -> Result<Self> {
        let max = match used.iter().next_back() {
            Some(&max) => max,
            None => return Ok(Self::default()),
        };
        let bank_size = rom.layout().bank_size;
        let bank_start = table - table % bank_size;

        let mut strings = BTreeMap::new();
        // Where the next string must start for the block to be a plain
        // table-then-strings layout.
        let mut cursor = Some(table + 2 * (max + 1));
        for &idx in used {
            let slot = table + 2 * idx;
            let ptr = rom.read_u16(slot).map_err(|_| {
                RomError::StringTable(format!("pointer {} at {:#X} is outside the image", idx, slot))
            })? as usize;
            let start = bank_start + ptr;
            let text = read_terminated(rom, start, bank_start + bank_size)?;
            cursor = cursor
                .filter(|&c| c == start)
                .map(|c| c + text.len() + 1);
            strings.insert(idx, text);
        }

        let extent = match cursor {
            Some(end) if used.len() == max + 1 => Some((table, end)),
            _ => {
                debug!(
                    "string table at {:#X} is not a simple contiguous block",
                    table
                );
                None
            }
        };
        Ok(Self::from_loaded(strings, extent))
    }

    pub(crate) fn len(&self) -> usize {
        self.strings.len()
    }

    pub(crate) fn get(&self, idx: usize) -> Option<&[u8]> {
        self.strings.get(&idx).map(Vec::as_slice)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (usize, &[u8])> + '_ {
        self.strings.iter().map(|(&idx, s)| (idx, s.as_slice()))
    }

    pub(crate) fn set(&mut self, idx: usize, text: &[u8]) -> Result<()> {
        check_text(text)?;
        let slot = self
            .strings
            .get_mut(&idx)
            .ok_or(RomError::NoSuchString(idx))?;
        *slot = text.to_vec();
        self.dirty = true;
        Ok(())
    }

    /// Appends a string at the next index.
    pub(crate) fn add(&mut self, text: &[u8]) -> Result<usize> {
        check_text(text)?;
        let idx = self.strings.keys().next_back().map_or(0, |&k| k + 1);
        if idx >= MAX_STRINGS {
            return Err(RomError::StringTable(format!(
                "a script holds at most {} strings",
                MAX_STRINGS
            )));
        }
        self.strings.insert(idx, text.to_vec());
        self.dirty = true;
        Ok(idx)
    }

    pub(crate) fn is_compacted(&self) -> bool {
        self.compacted
    }

    /// Old index to new index, numbering strings by their sorted position.
    pub(crate) fn compaction_map(&self) -> BTreeMap<usize, usize> {
        self.strings
            .keys()
            .enumerate()
            .map(|(new, &old)| (old, new))
            .collect()
    }

    pub(crate) fn compact(&mut self) {
        if self.compacted {
            return;
        }
        let renumbered = self.strings.keys().enumerate().any(|(new, &old)| new != old);
        let strings = std::mem::take(&mut self.strings);
        self.strings = strings.into_values().enumerate().collect();
        self.compacted = true;
        self.dirty |= renumbered;
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn extent(&self) -> Option<(usize, usize)> {
        self.extent
    }

    pub(crate) fn mark_written(&mut self, extent: (usize, usize)) {
        self.extent = Some(extent);
        self.dirty = false;
    }

    pub(crate) fn block_len(&self) -> usize {
        2 * self.strings.len() + self.strings.values().map(|s| s.len() + 1).sum::<usize>()
    }

    /// Lays the table out for file offset `offset`.
    pub(crate) fn serialize(&self, offset: usize, bank_size: usize) -> Result<Vec<u8>> {
        if self.strings.keys().enumerate().any(|(i, &k)| i != k) {
            return Err(RomError::StringTable(
                "cannot write a sparse string table".to_string(),
            ));
        }
        let total = self.block_len();
        if bank_size > 0x1_0000 || offset % bank_size + total > bank_size {
            return Err(RomError::StringTable(format!(
                "string block of {} bytes at {:#X} crosses a bank",
                total, offset
            )));
        }

        let mut pointers = Vec::with_capacity(2 * self.strings.len());
        let mut body = Vec::with_capacity(total);
        let mut cursor = offset + 2 * self.strings.len();
        for text in self.strings.values() {
            pointers.extend_from_slice(&((cursor % bank_size) as u16).to_le_bytes());
            body.extend_from_slice(text);
            body.push(TERMINATOR);
            cursor += text.len() + 1;
        }
        pointers.append(&mut body);
        Ok(pointers)
    }
}
