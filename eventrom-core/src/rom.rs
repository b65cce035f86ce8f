use std::fs;
use std::path::Path;

use tracing::debug;

use crate::freespace::FreeSpace;
use crate::layout::RomLayout;
use crate::{read_le, write_le, Result, RomError};

/// How a write should update the allocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteMode {
    MarkUsed,
    MarkFree,
    NoMark,
}

/// The fields of a location record the script layer cares about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocationRecord {
    pub event_index: u16,
    /// Rightmost and bottommost valid tile coordinates.
    pub bounds: (u8, u8),
}

/// The image bytes paired with the allocator that tracks them.
pub struct RomImage {
    data: Vec<u8>,
    space: FreeSpace,
    layout: RomLayout,
}

impl RomImage {
    pub fn new(data: Vec<u8>, layout: RomLayout) -> Result<Self> {
        let mut space = FreeSpace::new(data.len(), layout.bank_size);
        for &(start, end) in &layout.free_ranges {
            space.mark_free(start, end)?;
        }
        debug!(
            "image of {:#X} bytes, {:#X} bytes initially free",
            data.len(),
            space.free_bytes()
        );
        Ok(RomImage {
            data,
            space,
            layout,
        })
    }

    pub fn load(path: &Path, layout: RomLayout) -> Result<Self> {
        let data = fs::read(path)?;
        Self::new(data, layout)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, &self.data)?;
        Ok(())
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn layout(&self) -> &RomLayout {
        &self.layout
    }

    pub fn space(&self) -> &FreeSpace {
        &self.space
    }

    pub fn space_mut(&mut self) -> &mut FreeSpace {
        &mut self.space
    }

    pub fn to_file_offset(&self, rom_addr: usize) -> Result<usize> {
        rom_addr.checked_sub(self.layout.rom_base).ok_or_else(|| {
            RomError::Format(format!(
                "address {:#08X} lies below ROM base {:#08X}",
                rom_addr, self.layout.rom_base
            ))
        })
    }

    pub fn to_rom_address(&self, offset: usize) -> usize {
        offset + self.layout.rom_base
    }

    pub fn read(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.data
            .get(offset..offset + len)
            .ok_or(RomError::InvalidRange {
                start: offset,
                end: offset + len,
            })
    }

    fn read_width(&self, offset: usize, width: usize) -> Result<usize> {
        read_le(&self.data, offset, width).ok_or(RomError::InvalidRange {
            start: offset,
            end: offset + width,
        })
    }

    pub fn read_u8(&self, offset: usize) -> Result<u8> {
        Ok(self.read_width(offset, 1)? as u8)
    }

    pub fn read_u16(&self, offset: usize) -> Result<u16> {
        Ok(self.read_width(offset, 2)? as u16)
    }

    pub fn read_u24(&self, offset: usize) -> Result<usize> {
        self.read_width(offset, 3)
    }

    /// Writes `bytes` at `offset`, growing the image when the write runs past
    /// its end. Grown bytes are tracked as used.
    pub fn write(&mut self, offset: usize, bytes: &[u8], mode: WriteMode) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let end = offset + bytes.len();
        if end > self.data.len() {
            self.data.resize(end, 0xFF);
            self.space.extend_end(end, false);
        }
        self.data[offset..end].copy_from_slice(bytes);

        match mode {
            WriteMode::MarkUsed => self.space.mark_used(offset, end),
            WriteMode::MarkFree => self.space.mark_free(offset, end),
            WriteMode::NoMark => Ok(()),
        }
    }

    pub fn write_u16(&mut self, offset: usize, value: u16, mode: WriteMode) -> Result<()> {
        self.write(offset, &value.to_le_bytes(), mode)
    }

    pub fn write_u24(&mut self, offset: usize, value: usize, mode: WriteMode) -> Result<()> {
        if value > 0xFF_FFFF {
            return Err(RomError::InvalidArgument(format!(
                "{:#X} does not fit in 24 bits",
                value
            )));
        }
        let mut bytes = [0u8; 3];
        write_le(&mut bytes, 0, 3, value);
        self.write(offset, &bytes, mode)
    }

    /// Reserves `size` bytes inside a single bank.
    pub fn allocate(&mut self, size: usize) -> Result<usize> {
        let offset = self.space.find_free(size, 0)?;
        self.space.mark_used(offset, offset + size)?;
        debug!("allocated {:#X} bytes at {:#X}", size, offset);
        Ok(offset)
    }

    /// Reserves one region per size, all sharing one bank.
    pub fn allocate_same_bank(&mut self, sizes: &[usize]) -> Result<Vec<usize>> {
        let offsets = self.space.find_free_same_bank(sizes)?;
        for (&offset, &size) in offsets.iter().zip(sizes) {
            self.space.mark_used(offset, offset + size)?;
        }
        Ok(offsets)
    }

    pub fn free(&mut self, start: usize, end: usize) -> Result<()> {
        debug!("freeing [{:#X}, {:#X})", start, end);
        self.space.mark_free(start, end)
    }

    pub fn location_record(&self, location: u16) -> Result<LocationRecord> {
        if location as usize >= self.layout.location_count {
            return Err(RomError::UnknownLocation(location));
        }
        let base =
            self.layout.location_table + location as usize * self.layout.location_record_size;
        let event_index = self.read_u16(base + self.layout.event_index_field)?;
        let bounds = self.read(base + self.layout.bounds_field, 2)?;
        Ok(LocationRecord {
            event_index,
            bounds: (bounds[0], bounds[1]),
        })
    }

    fn event_pointer_slot(&self, index: u16) -> Result<usize> {
        if index as usize >= self.layout.event_pointer_count {
            return Err(RomError::Format(format!(
                "event index {:#X} is past the pointer table",
                index
            )));
        }
        Ok(self.layout.event_pointer_table + 3 * index as usize)
    }

    /// ROM address of the compressed script for `index`.
    pub fn event_pointer(&self, index: u16) -> Result<usize> {
        let slot = self.event_pointer_slot(index)?;
        self.read_u24(slot)
    }

    pub fn set_event_pointer(&mut self, index: u16, rom_addr: usize) -> Result<()> {
        let slot = self.event_pointer_slot(index)?;
        self.write_u24(slot, rom_addr, WriteMode::NoMark)
    }
}
