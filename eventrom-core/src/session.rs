use std::collections::hash_map::Entry;
use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::compression::{compress, compressed_length};
use crate::event::EventScript;
use crate::rom::{RomImage, WriteMode};
use crate::Result;

/// New blocks reserved for one write-back, with their bytes.
struct Staged {
    strings: Option<(usize, Vec<u8>)>,
    body: (usize, Vec<u8>),
}

struct CachedScript {
    script: EventScript,
    /// File range currently holding the compressed script.
    block: (usize, usize),
}

/// Event scripts of one image, loaded on first use and written back on commit.
///
/// Scripts are cached per event index, so locations sharing an index share
/// one script.
pub struct EventSession {
    rom: RomImage,
    scripts: HashMap<u16, CachedScript>,
}

impl EventSession {
    pub fn new(rom: RomImage) -> Self {
        EventSession {
            rom,
            scripts: HashMap::new(),
        }
    }

    pub fn image(&self) -> &RomImage {
        &self.rom
    }

    /// The image, for allocations and raw patches made alongside script edits.
    pub fn image_mut(&mut self) -> &mut RomImage {
        &mut self.rom
    }

    /// Releases the image. Edits not yet written back are dropped.
    pub fn into_image(self) -> RomImage {
        self.rom
    }

    fn event_index(&self, location: u16) -> Result<u16> {
        Ok(self.rom.location_record(location)?.event_index)
    }

    fn load(rom: &RomImage, index: u16) -> Result<CachedScript> {
        let addr = rom.event_pointer(index)?;
        let offset = rom.to_file_offset(addr)?;
        let len = compressed_length(rom.data(), offset)?;
        let script = EventScript::load(rom, offset)?;
        debug!(
            "loaded event script {:#X} from {:#X} ({} bytes compressed)",
            index, offset, len
        );
        Ok(CachedScript {
            script,
            block: (offset, offset + len),
        })
    }

    pub fn is_loaded(&self, location: u16) -> Result<bool> {
        let index = self.event_index(location)?;
        Ok(self.scripts.contains_key(&index))
    }

    /// The script of `location`, loading it on first access.
    pub fn get(&mut self, location: u16) -> Result<&mut EventScript> {
        let index = self.event_index(location)?;
        match self.scripts.entry(index) {
            Entry::Occupied(entry) => Ok(&mut entry.into_mut().script),
            Entry::Vacant(entry) => {
                let cached = Self::load(&self.rom, index)?;
                Ok(&mut entry.insert(cached).script)
            }
        }
    }

    /// Compresses and stores `location`'s script if it changed.
    pub fn write_back(&mut self, location: u16) -> Result<()> {
        let index = self.event_index(location)?;
        self.write_back_index(index)
    }

    fn write_back_index(&mut self, index: u16) -> Result<()> {
        let rom = &mut self.rom;
        let entry = match self.scripts.get_mut(&index) {
            Some(entry) if entry.script.is_modified() => entry,
            _ => return Ok(()),
        };

        let mut script = entry.script.clone();
        let mut freed = Vec::new();
        let mut reserved = Vec::new();
        let staged = match Self::reserve(rom, &mut script, entry.block, &mut freed, &mut reserved) {
            Ok(staged) => staged,
            Err(e) => {
                Self::unwind(rom, &reserved, &freed);
                return Err(e);
            }
        };

        if let Some((offset, block)) = &staged.strings {
            rom.write(*offset, block, WriteMode::MarkUsed)?;
            script.mark_strings_written((*offset, offset + block.len()));
        }
        let (offset, body) = &staged.body;
        rom.write(*offset, body, WriteMode::MarkUsed)?;
        let addr = rom.to_rom_address(*offset);
        rom.set_event_pointer(index, addr)?;

        debug!(
            "event script {:#X}: {} bytes at {:#X}, was {} bytes at {:#X}",
            index,
            body.len(),
            offset,
            entry.block.1 - entry.block.0,
            entry.block.0
        );
        script.mark_clean();
        entry.script = script;
        entry.block = (*offset, offset + body.len());
        Ok(())
    }

    /// Frees the old blocks and reserves the new ones without writing any
    /// bytes. Every region touched is recorded in `freed` or `reserved`.
    fn reserve(
        rom: &mut RomImage,
        script: &mut EventScript,
        old_body: (usize, usize),
        freed: &mut Vec<(usize, usize)>,
        reserved: &mut Vec<(usize, usize)>,
    ) -> Result<Staged> {
        let strings = if script.strings_dirty() {
            match script.string_extent() {
                Some((start, end)) => {
                    freed.push((start, end));
                    rom.free(start, end)?;
                }
                None => warn!("previous string block is shared or unknown, leaving it in place"),
            }

            let len = script.string_block_len();
            let offset = rom.allocate(len)?;
            reserved.push((offset, offset + len));
            let block = script.serialize_strings(offset, rom.layout().bank_size)?;
            script.set_string_table_address(rom.to_rom_address(offset))?;
            Some((offset, block))
        } else {
            None
        };

        let body = compress(&script.to_bytes())?;
        freed.push(old_body);
        rom.free(old_body.0, old_body.1)?;
        let offset = rom.allocate(body.len())?;
        reserved.push((offset, offset + body.len()));

        Ok(Staged {
            strings,
            body: (offset, body),
        })
    }

    /// Returns the allocator to its state before [`Self::reserve`].
    fn unwind(rom: &mut RomImage, reserved: &[(usize, usize)], freed: &[(usize, usize)]) {
        let space = rom.space_mut();
        let restored = reserved
            .iter()
            .try_for_each(|&(start, end)| space.mark_free(start, end))
            .and_then(|_| {
                freed
                    .iter()
                    .try_for_each(|&(start, end)| space.mark_used(start, end))
            });
        if let Err(e) = restored {
            warn!("could not restore free space after a failed write-back: {}", e);
        }
    }

    /// Writes back every modified script in ascending event index order.
    /// Returns how many were written.
    pub fn commit(&mut self) -> Result<usize> {
        let mut dirty: Vec<u16> = self
            .scripts
            .iter()
            .filter(|(_, cached)| cached.script.is_modified())
            .map(|(&index, _)| index)
            .collect();
        dirty.sort_unstable();

        for &index in &dirty {
            self.write_back_index(index)?;
        }
        info!(
            "committed {} event scripts, {:#X} bytes free",
            dirty.len(),
            self.rom.space().free_bytes()
        );
        Ok(dirty.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::build_script;
    use crate::layout::RomLayout;
    use crate::opcodes::EventCommand;
    use crate::RomError;

    const RET: u8 = 0x00;

    fn layout(free_ranges: Vec<(usize, usize)>) -> RomLayout {
        RomLayout {
            bank_size: 0x1000,
            rom_base: 0xC0_0000,
            location_table: 0x10,
            location_record_size: 4,
            location_count: 4,
            event_index_field: 0,
            bounds_field: 2,
            event_pointer_table: 0x40,
            event_pointer_count: 4,
            free_ranges,
        }
    }

    /// Location 1 uses event 0 (with strings 2 and 5 from a sparse table at
    /// 0x200); locations 2 and 3 share event 1 (no strings).
    fn image(free_ranges: Vec<(usize, usize)>) -> RomImage {
        let mut data = vec![0u8; 0x1000];
        data[0x14..0x16].copy_from_slice(&[0, 0]);
        data[0x18..0x1A].copy_from_slice(&[1, 0]);
        data[0x1C..0x1E].copy_from_slice(&[1, 0]);

        let with_strings = build_script(&[&[
            &[0xB8, 0x00, 0x02, 0xC0, 0xBB, 0x02, 0xBB, 0x05, RET],
            &[RET],
        ]]);
        let block = compress(&with_strings).unwrap();
        data[0x100..0x100 + block.len()].copy_from_slice(&block);
        data[0x40..0x43].copy_from_slice(&[0x00, 0x01, 0xC0]);

        data[0x204..0x206].copy_from_slice(&[0x20, 0x02]);
        data[0x20A..0x20C].copy_from_slice(&[0x30, 0x02]);
        data[0x220..0x223].copy_from_slice(b"HI\0");
        data[0x230..0x233].copy_from_slice(b"YO\0");

        let plain = build_script(&[&[&[RET]]]);
        let block = compress(&plain).unwrap();
        data[0x180..0x180 + block.len()].copy_from_slice(&block);
        data[0x43..0x46].copy_from_slice(&[0x80, 0x01, 0xC0]);

        RomImage::new(data, layout(free_ranges)).unwrap()
    }

    #[test]
    fn loads_scripts_lazily() {
        let mut session = EventSession::new(image(vec![]));
        assert!(!session.is_loaded(1).unwrap());
        let script = session.get(1).unwrap();
        assert_eq!(script.object_count(), 1);
        assert_eq!(script.string(2).unwrap(), b"HI");
        assert_eq!(script.string(5).unwrap(), b"YO");
        assert!(session.is_loaded(1).unwrap());

        // Locations 2 and 3 share one cached script.
        session.get(2).unwrap().add_string(b"A").unwrap();
        assert!(session.get(3).unwrap().is_modified());

        assert!(matches!(session.get(9), Err(RomError::UnknownLocation(9))));
    }

    #[test]
    fn commit_without_edits_writes_nothing() {
        let rom = image(vec![(0x800, 0x1000)]);
        let before = rom.data().to_vec();
        let mut session = EventSession::new(rom);
        session.get(1).unwrap();
        session.get(2).unwrap();
        assert_eq!(session.commit().unwrap(), 0);
        assert_eq!(session.into_image().into_bytes(), before);
    }

    #[test]
    fn commit_relocates_script_and_strings() {
        let mut session = EventSession::new(image(vec![(0x800, 0x1000)]));
        let old_len = compressed_length(session.image().data(), 0x100).unwrap();
        let script = session.get(1).unwrap();
        let idx = script.add_string(b"NEW").unwrap();
        assert_eq!(idx, 2);
        let end = script.function_end(0, 0).unwrap();
        script
            .insert(end - 1, &EventCommand::textbox(idx as u8).to_bytes())
            .unwrap();
        assert_eq!(session.commit().unwrap(), 1);

        let rom = session.image();
        // Strings first: 3 pointers plus "HI\0YO\0NEW\0".
        assert!(!rom.space().is_free(0x800));
        assert_eq!(rom.read(0x806, 10).unwrap(), b"HI\0YO\0NEW\0");
        let body = rom.to_file_offset(rom.event_pointer(0).unwrap()).unwrap();
        let new_len = compressed_length(rom.data(), body).unwrap();
        // The old body went back to the allocator.
        assert_eq!(rom.space().free_bytes(), 0x800 + old_len - 16 - new_len);
        // The sparse original table may be shared, so it stays.
        assert!(!rom.space().is_free(0x200));

        let rom = session.into_image();
        let mut reopened = EventSession::new(rom);
        let script = reopened.get(1).unwrap();
        assert_eq!(script.string_table_address().unwrap(), Some(0xC0_0800));
        assert_eq!(script.string(0).unwrap(), b"HI");
        assert_eq!(script.string(2).unwrap(), b"NEW");
        let start = script.function_start(0, 0).unwrap();
        let textboxes: Vec<u8> = script
            .commands(start, script.function_end(0, 0).unwrap())
            .map(|c| c.unwrap().1)
            .filter(|c| c.opcode == 0xBB)
            .map(|c| c.args[0])
            .collect();
        assert_eq!(textboxes, vec![0, 1, 2]);
    }

    #[test]
    fn failed_write_back_keeps_old_block() {
        let mut session = EventSession::new(image(vec![(0x800, 0x804)]));
        let script = session.get(2).unwrap();
        let code: Vec<u8> = (0..40u8).flat_map(|i| [0xBB, i]).collect();
        script.insert(script.function_start(0, 0).unwrap(), &code).unwrap();

        assert!(matches!(
            session.write_back(2),
            Err(RomError::OutOfSpace { .. })
        ));
        let rom = session.image();
        assert!(!rom.space().is_free(0x180));
        assert_eq!(rom.event_pointer(1).unwrap(), 0xC0_0180);
    }

    /// Like [`image`], but event 0 uses strings 0 and 1 from a contiguous
    /// block at 0x200..0x20A that only it references.
    fn contiguous_image(free_ranges: Vec<(usize, usize)>) -> RomImage {
        let mut data = image(vec![]).into_bytes();
        let script = build_script(&[&[
            &[0xB8, 0x00, 0x02, 0xC0, 0xBB, 0x00, 0xBB, 0x01, RET],
            &[RET],
        ]]);
        let block = compress(&script).unwrap();
        data[0x100..0x100 + block.len()].copy_from_slice(&block);
        data[0x200..0x20A].copy_from_slice(&[0x04, 0x02, 0x07, 0x02, b'H', b'I', 0, b'Y', b'O', 0]);
        RomImage::new(data, layout(free_ranges)).unwrap()
    }

    #[test]
    fn failed_body_allocation_releases_string_block() {
        // Room for the new string block but not for the grown body.
        let mut session = EventSession::new(contiguous_image(vec![(0x800, 0x810)]));
        let before = session.image().data().to_vec();
        let script = session.get(1).unwrap();
        assert_eq!(script.string(1).unwrap(), b"YO");
        script.add_string(b"NEW").unwrap();
        let code: Vec<u8> = (0..40u8).flat_map(|i| [0xBB, i]).collect();
        script.insert(script.function_start(0, 0).unwrap() + 4, &code).unwrap();

        assert!(matches!(
            session.write_back(1),
            Err(RomError::OutOfSpace { .. })
        ));
        let rom = session.image();
        assert_eq!(rom.data(), &before[..]);
        assert_eq!(rom.event_pointer(0).unwrap(), 0xC0_0100);
        assert!(!rom.space().is_free(0x100));
        assert!(!rom.space().is_free(0x200));
        assert!(!rom.space().is_free(0x209));
        assert!(rom.space().is_free(0x800));
        assert_eq!(rom.space().free_bytes(), 0x10);

        // The edit survives for a later attempt.
        let script = session.get(1).unwrap();
        assert!(script.is_modified());
        assert_eq!(script.string(2).unwrap(), b"NEW");
        assert_eq!(script.string_table_address().unwrap(), Some(0xC0_0200));
    }

    #[test]
    fn contiguous_string_block_is_reclaimed() {
        let mut session = EventSession::new(contiguous_image(vec![(0x800, 0x1000)]));
        session.get(1).unwrap().add_string(b"NEW").unwrap();
        session.commit().unwrap();

        let rom = session.image();
        assert!(rom.space().is_free(0x200));
        assert!(rom.space().is_free(0x209));
        assert_eq!(rom.read(0x806, 10).unwrap(), b"HI\0YO\0NEW\0");
    }

    #[test]
    fn rewritten_block_is_reused() {
        let mut session = EventSession::new(image(vec![]));
        let script = session.get(2).unwrap();
        let start = script.function_start(0, 0).unwrap();
        script.insert(start, &[0xBB, 0x01]).unwrap();
        script.delete(start, 2).unwrap();

        // The freed original is the only space available.
        session.write_back(2).unwrap();
        assert_eq!(session.image().event_pointer(1).unwrap(), 0xC0_0180);
        assert!(!session.get(2).unwrap().is_modified());
    }
}
