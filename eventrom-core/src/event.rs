//! Relocatable event scripts.
//!
//! A decompressed script is `[object count][16 pointers per object][stream]`.
//! Pointers are little-endian offsets counted from the byte after the object
//! count, so the stream begins at `32 * count`. All positions taken and
//! returned by [`EventScript`] use that coordinate system.
//!
//! A function whose pointer equals its predecessor's has no code of its own.
//! Jump distances are measured from the jump's last argument byte.

use std::collections::BTreeSet;

use tracing::{debug, warn};

use crate::compression::decompress;
use crate::opcodes::{command_size, ArgKind, EventCommand, OP_STRING_INDEX};
use crate::rom::RomImage;
use crate::strings::StringTable;
use crate::{read_le, Result, RomError};

pub const FUNCTIONS_PER_OBJECT: usize = 16;
const OBJECT_HEADER_LEN: usize = 2 * FUNCTIONS_PER_OBJECT;
const MAX_OBJECTS: usize = 0xFF;
const MAX_SCRIPT_LEN: usize = 0xFFFF;

/// Which side of an insertion a position equal to the edit point ends up on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Anchor {
    Before,
    After,
}

/// Replacement of `removed` bytes at `at` by `inserted` bytes.
#[derive(Clone, Copy, Debug)]
struct Splice {
    at: usize,
    removed: usize,
    inserted: usize,
    anchor: Anchor,
}

impl Splice {
    fn new(at: usize, removed: usize, inserted: usize, anchor: Anchor) -> Self {
        Splice {
            at,
            removed,
            inserted,
            anchor,
        }
    }

    /// Where a byte that survives the edit ends up.
    fn shift(&self, x: usize) -> usize {
        if x < self.at {
            x
        } else {
            x - self.removed + self.inserted
        }
    }

    /// Where a pointer or jump target ends up. Targets inside the removed
    /// range collapse onto the edit point.
    fn map(&self, x: usize) -> usize {
        let edge = match self.anchor {
            Anchor::Before => self.at,
            Anchor::After => self.at + self.inserted,
        };
        if x < self.at {
            x
        } else if x < self.at + self.removed || x == self.at {
            edge
        } else {
            x - self.removed + self.inserted
        }
    }
}

/// Iterator over the commands in a range of a script's stream.
pub struct Commands<'a> {
    stream: &'a [u8],
    base: usize,
    pos: usize,
    end: usize,
    failed: bool,
}

impl Iterator for Commands<'_> {
    type Item = Result<(usize, EventCommand)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.end {
            return None;
        }
        match EventCommand::decode(self.stream, self.pos - self.base) {
            Ok(cmd) => {
                let at = self.pos;
                self.pos += cmd.len();
                Some(Ok((at, cmd)))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

fn validate_commands(code: &[u8]) -> Result<()> {
    let mut pos = 0;
    while pos < code.len() {
        pos += command_size(code, pos)?;
    }
    Ok(())
}

fn jump_target(pos: usize, cmd: &EventCommand) -> Result<Option<(usize, usize)>> {
    let forward = match cmd.def().kind {
        ArgKind::JumpForward => true,
        ArgKind::JumpBack => false,
        _ => return Ok(None),
    };
    let base = pos + cmd.len() - 1;
    let distance = cmd.args[cmd.args.len() - 1] as usize;
    let target = if forward {
        base + distance
    } else {
        base.checked_sub(distance).ok_or_else(|| {
            RomError::Format(format!("jump at {:#X} lands before the script", pos))
        })?
    };
    Ok(Some((base, target)))
}

#[derive(Clone, Debug)]
pub struct EventScript {
    pointers: Vec<usize>,
    stream: Vec<u8>,
    strings: StringTable,
    modified: bool,
}

impl EventScript {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let (&count, rest) = bytes
            .split_first()
            .ok_or_else(|| RomError::Format("empty script".to_string()))?;
        let header = count as usize * OBJECT_HEADER_LEN;
        if rest.len() < header {
            return Err(RomError::Format(format!(
                "{} objects need a {} byte table, script has {} bytes",
                count,
                header,
                rest.len()
            )));
        }
        if rest.len() > MAX_SCRIPT_LEN {
            return Err(RomError::ScriptTooLarge(bytes.len()));
        }

        let mut pointers = Vec::with_capacity(count as usize * FUNCTIONS_PER_OBJECT);
        for slot in 0..count as usize * FUNCTIONS_PER_OBJECT {
            let ptr = read_le(rest, 2 * slot, 2).unwrap_or(0);
            if ptr < header || ptr > rest.len() {
                return Err(RomError::Format(format!(
                    "object {} function {} points at {:#X}, outside [{:#X}, {:#X}]",
                    slot / FUNCTIONS_PER_OBJECT,
                    slot % FUNCTIONS_PER_OBJECT,
                    ptr,
                    header,
                    rest.len()
                )));
            }
            pointers.push(ptr);
        }

        Ok(EventScript {
            pointers,
            stream: rest[header..].to_vec(),
            strings: StringTable::default(),
            modified: false,
        })
    }

    /// Decompresses the script at file offset `offset` and loads its strings.
    pub fn load(rom: &RomImage, offset: usize) -> Result<Self> {
        let bytes = decompress(rom.data(), offset)?;
        let mut script = Self::parse(&bytes)?;

        if let Some(addr) = script.string_table_address()? {
            let used = script.used_string_indices()?;
            let table = rom.to_file_offset(addr)?;
            script.strings = StringTable::load(rom, table, &used)?;
            debug!(
                "script at {:#X}: {} strings from table at {:#X}",
                offset,
                script.strings.len(),
                table
            );
        }
        Ok(script)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.len());
        out.push(self.object_count() as u8);
        for &ptr in &self.pointers {
            out.extend_from_slice(&(ptr as u16).to_le_bytes());
        }
        out.extend_from_slice(&self.stream);
        out
    }

    pub fn object_count(&self) -> usize {
        self.pointers.len() / FUNCTIONS_PER_OBJECT
    }

    /// Position of the first stream byte.
    pub fn header_len(&self) -> usize {
        2 * self.pointers.len()
    }

    /// Position one past the last stream byte.
    pub fn len(&self) -> usize {
        self.header_len() + self.stream.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stream.is_empty()
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub(crate) fn mark_clean(&mut self) {
        self.modified = false;
    }

    fn slot(&self, obj: usize, func: usize) -> Result<usize> {
        if obj >= self.object_count() {
            return Err(RomError::NoSuchObject(obj));
        }
        if func >= FUNCTIONS_PER_OBJECT {
            return Err(RomError::NoSuchFunction {
                object: obj,
                function: func,
            });
        }
        Ok(obj * FUNCTIONS_PER_OBJECT + func)
    }

    fn slot_is_empty(&self, slot: usize) -> bool {
        slot % FUNCTIONS_PER_OBJECT != 0 && self.pointers[slot] == self.pointers[slot - 1]
    }

    fn slot_end(&self, slot: usize) -> Result<usize> {
        let start = self.pointers[slot];
        let end = self.pointers[slot + 1..]
            .iter()
            .copied()
            .find(|&p| p != start)
            .unwrap_or_else(|| self.len());
        if end < start {
            return Err(RomError::Format(format!(
                "function pointers decrease after {:#X}",
                start
            )));
        }
        Ok(end)
    }

    pub fn function_start(&self, obj: usize, func: usize) -> Result<usize> {
        Ok(self.pointers[self.slot(obj, func)?])
    }

    /// First later pointer that differs from this function's start.
    pub fn function_end(&self, obj: usize, func: usize) -> Result<usize> {
        self.slot_end(self.slot(obj, func)?)
    }

    /// True when the function shares its predecessor's code.
    pub fn is_function_empty(&self, obj: usize, func: usize) -> Result<bool> {
        Ok(self.slot_is_empty(self.slot(obj, func)?))
    }

    pub fn object_start(&self, obj: usize) -> Result<usize> {
        self.function_start(obj, 0)
    }

    pub fn object_end(&self, obj: usize) -> Result<usize> {
        let start = self.object_start(obj)?;
        let end = if obj + 1 < self.object_count() {
            self.object_start(obj + 1)?
        } else {
            self.len()
        };
        if end < start {
            return Err(RomError::Format(format!(
                "object {} ends at {:#X} before it starts at {:#X}",
                obj, end, start
            )));
        }
        Ok(end)
    }

    pub fn get_function(&self, obj: usize, func: usize) -> Result<&[u8]> {
        let start = self.function_start(obj, func)?;
        let end = self.function_end(obj, func)?;
        self.bytes(start, end)
    }

    /// Raw stream bytes in `[start, end)`.
    pub fn bytes(&self, start: usize, end: usize) -> Result<&[u8]> {
        let h = self.header_len();
        if start < h || start > end || end > self.len() {
            return Err(RomError::InvalidRange { start, end });
        }
        Ok(&self.stream[start - h..end - h])
    }

    /// Commands starting in `[start, end)`, clamped to the stream.
    pub fn commands(&self, start: usize, end: usize) -> Commands<'_> {
        let base = self.header_len();
        Commands {
            stream: &self.stream,
            base,
            pos: start.max(base),
            end: end.min(self.len()),
            failed: false,
        }
    }

    pub fn all_commands(&self) -> Commands<'_> {
        self.commands(self.header_len(), self.len())
    }

    pub fn command_at(&self, pos: usize) -> Result<EventCommand> {
        let idx = pos
            .checked_sub(self.header_len())
            .ok_or(RomError::NotOnInstructionBoundary(pos))?;
        EventCommand::decode(&self.stream, idx)
    }

    pub fn find_command_opt(&self, opcodes: &[u8], start: usize, end: usize) -> Result<Option<usize>> {
        for item in self.commands(start, end) {
            let (pos, cmd) = item?;
            if opcodes.contains(&cmd.opcode) {
                return Ok(Some(pos));
            }
        }
        Ok(None)
    }

    pub fn find_command(&self, opcodes: &[u8], start: usize, end: usize) -> Result<usize> {
        self.find_command_opt(opcodes, start, end)?
            .ok_or_else(|| RomError::CommandNotFound {
                opcodes: opcodes.to_vec(),
                start,
                end,
            })
    }

    /// First occurrence of `needle` inside `[start, end)`.
    pub fn find_bytes(&self, needle: &[u8], start: usize, end: usize) -> Option<usize> {
        let h = self.header_len();
        let start = start.max(h);
        let end = end.min(self.len());
        if needle.is_empty() || start >= end {
            return None;
        }
        self.stream[start - h..end - h]
            .windows(needle.len())
            .position(|w| w == needle)
            .map(|i| start + i)
    }

    fn check_boundary(&self, pos: usize) -> Result<()> {
        if pos == self.len() {
            return Ok(());
        }
        for item in self.all_commands() {
            let (at, _) = item?;
            if at == pos {
                return Ok(());
            }
            if at > pos {
                break;
            }
        }
        Err(RomError::NotOnInstructionBoundary(pos))
    }

    /// Applies one splice to the pointers, the jumps and the stream bytes.
    ///
    /// With `replacement` the splice edits the stream. Without it the splice
    /// resizes the pointer table: nothing in the stream moves relative to
    /// its neighbours, and the caller adds or drops the slots afterwards.
    /// Every new value is computed and checked before anything is written.
    fn relocate(&mut self, splice: Splice, replacement: Option<&[u8]>) -> Result<()> {
        let h = self.header_len();
        let old_len = self.len();
        let end = splice.at + splice.removed;

        let new_h = match replacement {
            Some(code) => {
                if splice.at < h || end > old_len || code.len() != splice.inserted {
                    return Err(RomError::InvalidRange {
                        start: splice.at,
                        end,
                    });
                }
                self.check_boundary(splice.at)?;
                self.check_boundary(end)?;
                validate_commands(code)?;
                h
            }
            None => {
                if end > h {
                    return Err(RomError::InvalidRange {
                        start: splice.at,
                        end,
                    });
                }
                h - splice.removed + splice.inserted
            }
        };

        let new_len = old_len - splice.removed + splice.inserted;
        if new_len > MAX_SCRIPT_LEN {
            return Err(RomError::ScriptTooLarge(new_len + 1));
        }

        let pointers: Vec<usize> = self.pointers.iter().map(|&p| splice.map(p)).collect();

        let mut patches: Vec<(usize, u8)> = Vec::new();
        for item in self.all_commands() {
            let (pos, cmd) = item?;
            if replacement.is_some() && pos >= splice.at && pos < end {
                continue;
            }
            let (base, target) = match jump_target(pos, &cmd)? {
                Some(jump) => jump,
                None => continue,
            };
            let new_base = splice.shift(base);
            let new_target = splice.map(target);
            let distance = if cmd.def().kind == ArgKind::JumpForward {
                new_target.checked_sub(new_base)
            } else {
                new_base.checked_sub(new_target)
            };
            match distance {
                Some(d) if d <= 0xFF => {
                    if d != target.abs_diff(base) {
                        patches.push((new_base - new_h, d as u8));
                    }
                }
                Some(d) => return Err(RomError::JumpOutOfRange { pos, distance: d }),
                None => {
                    return Err(RomError::Format(format!(
                        "jump at {:#X} would pass over its target",
                        pos
                    )))
                }
            }
        }

        if let Some(code) = replacement {
            let lo = splice.at - h;
            self.stream
                .splice(lo..lo + splice.removed, code.iter().copied());
        }
        self.pointers = pointers;
        for (idx, distance) in patches {
            self.stream[idx] = distance;
        }
        Ok(())
    }

    /// Runs `op` on a copy and keeps the result only if every step succeeds.
    /// The first edit of a script also compacts its string indices.
    fn edit<T>(&mut self, op: impl FnOnce(&mut EventScript) -> Result<T>) -> Result<T> {
        let mut next = self.clone();
        next.compact_strings()?;
        let out = op(&mut next)?;
        next.modified = true;
        *self = next;
        Ok(out)
    }

    /// Inserts whole commands at `pos`. A pointer or jump target equal to
    /// `pos` keeps pointing at `pos`, so the new code joins what follows.
    pub fn insert(&mut self, pos: usize, code: &[u8]) -> Result<()> {
        self.edit(|s| s.relocate(Splice::new(pos, 0, code.len(), Anchor::Before), Some(code)))
    }

    pub fn insert_command(&mut self, pos: usize, cmd: &EventCommand) -> Result<()> {
        self.insert(pos, &cmd.to_bytes())
    }

    pub fn delete(&mut self, pos: usize, len: usize) -> Result<()> {
        self.edit(|s| s.relocate(Splice::new(pos, len, 0, Anchor::Before), Some(&[])))
    }

    pub fn delete_command(&mut self, pos: usize) -> Result<()> {
        let len = self.command_at(pos)?.len();
        self.delete(pos, len)
    }

    pub fn replace_command(&mut self, pos: usize, cmd: &EventCommand) -> Result<()> {
        let old_len = self.command_at(pos)?.len();
        let code = cmd.to_bytes();
        self.edit(|s| s.relocate(Splice::new(pos, old_len, code.len(), Anchor::Before), Some(&code)))
    }

    /// Replaces a function's code.
    ///
    /// An empty function gets its code placed right after the code it was
    /// sharing, and the empty functions following it in the same object
    /// share the new code instead.
    pub fn set_function(&mut self, obj: usize, func: usize, code: &[u8]) -> Result<()> {
        let slot = self.slot(obj, func)?;
        self.edit(|s| {
            if s.slot_is_empty(slot) {
                let shared = s.pointers[slot];
                let at = s.slot_end(slot - 1)?;
                let object_last = (slot / FUNCTIONS_PER_OBJECT + 1) * FUNCTIONS_PER_OBJECT;
                let trailing: Vec<usize> = (slot..object_last)
                    .take_while(|&t| s.pointers[t] == shared)
                    .collect();

                s.relocate(Splice::new(at, 0, code.len(), Anchor::After), Some(code))?;
                for t in trailing {
                    s.pointers[t] = at;
                }
            } else {
                let start = s.pointers[slot];
                let end = s.slot_end(slot)?;
                s.relocate(
                    Splice::new(start, end - start, code.len(), Anchor::Before),
                    Some(code),
                )?;
            }
            Ok(())
        })
    }

    fn push_object(&mut self, code: &[u8], offsets: &[usize; FUNCTIONS_PER_OBJECT]) -> Result<usize> {
        let id = self.object_count();
        if id >= MAX_OBJECTS {
            return Err(RomError::InvalidArgument(format!(
                "a script holds at most {} objects",
                MAX_OBJECTS
            )));
        }

        let h = self.header_len();
        self.relocate(Splice::new(h, 0, OBJECT_HEADER_LEN, Anchor::After), None)?;
        let end = self.len() + OBJECT_HEADER_LEN;
        self.pointers
            .extend(std::iter::repeat(end).take(FUNCTIONS_PER_OBJECT));

        // Pointers and jump targets at the old end keep pointing there, which
        // is where the new object's code begins.
        let at = self.len();
        self.relocate(Splice::new(at, 0, code.len(), Anchor::Before), Some(code))?;
        for (f, &offset) in offsets.iter().enumerate() {
            self.pointers[id * FUNCTIONS_PER_OBJECT + f] = at + offset;
        }
        debug!("appended object {} with {} bytes of code", id, code.len());
        Ok(id)
    }

    /// Adds an object whose first two functions return immediately and
    /// whose other functions share the second one.
    pub fn append_object(&mut self) -> Result<usize> {
        let code = [
            EventCommand::return_cmd().to_bytes(),
            EventCommand::return_cmd().to_bytes(),
        ]
        .concat();
        let mut offsets = [1; FUNCTIONS_PER_OBJECT];
        offsets[0] = 0;
        self.edit(|s| s.push_object(&code, &offsets))
    }

    /// Adds a copy of object `src` and returns its id.
    pub fn append_copy_of(&mut self, src: usize) -> Result<usize> {
        let start = self.object_start(src)?;
        let end = self.object_end(src)?;

        let mut offsets = [0; FUNCTIONS_PER_OBJECT];
        for (f, offset) in offsets.iter_mut().enumerate() {
            let ptr = self.function_start(src, f)?;
            if ptr < start || ptr > end {
                return Err(RomError::Format(format!(
                    "object {} function {} lies outside the object",
                    src, f
                )));
            }
            *offset = ptr - start;
        }
        for item in self.commands(start, end) {
            let (pos, cmd) = item?;
            if let Some((_, target)) = jump_target(pos, &cmd)? {
                if target < start || target > end {
                    return Err(RomError::Format(format!(
                        "jump at {:#X} leaves object {}",
                        pos, src
                    )));
                }
            }
        }

        let code = self.bytes(start, end)?.to_vec();
        self.edit(|s| s.push_object(&code, &offsets))
    }

    /// Removes an object, its code, and every command that refers to it.
    /// References to later objects are renumbered.
    pub fn remove_object(&mut self, obj: usize) -> Result<()> {
        let start = self.object_start(obj)?;
        let end = self.object_end(obj)?;
        let handle = 2 * obj;

        self.edit(|s| {
            s.relocate(Splice::new(start, end - start, 0, Anchor::Before), Some(&[]))?;

            let table_at = obj * OBJECT_HEADER_LEN;
            s.relocate(Splice::new(table_at, OBJECT_HEADER_LEN, 0, Anchor::Before), None)?;
            let first = obj * FUNCTIONS_PER_OBJECT;
            s.pointers.drain(first..first + FUNCTIONS_PER_OBJECT);

            let h = s.header_len();
            let mut doomed = Vec::new();
            let mut renumber = Vec::new();
            for item in s.all_commands() {
                let (pos, cmd) = item?;
                if cmd.def().kind != ArgKind::ObjectRef {
                    continue;
                }
                let target = cmd.args[0] as usize;
                if target % 2 != 0 {
                    return Err(RomError::Format(format!(
                        "{} at {:#X} names odd object handle {:#04X}",
                        cmd.def().name,
                        pos,
                        target
                    )));
                }
                if target == handle {
                    doomed.push((pos, cmd.len()));
                } else if target > handle {
                    renumber.push(pos + 1 - h);
                }
            }
            for idx in renumber {
                s.stream[idx] -= 2;
            }
            for &(pos, len) in doomed.iter().rev() {
                s.relocate(Splice::new(pos, len, 0, Anchor::Before), Some(&[]))?;
            }
            debug!(
                "removed object {}, dropping {} commands that referred to it",
                obj,
                doomed.len()
            );
            Ok(())
        })
    }

    /// Overwrites argument bytes of the first `opcode` command in a function.
    /// Returns the command's position.
    pub fn patch_command_argument(
        &mut self,
        obj: usize,
        func: usize,
        opcode: u8,
        arg_offset: usize,
        bytes: &[u8],
    ) -> Result<usize> {
        let start = self.function_start(obj, func)?;
        let end = self.function_end(obj, func)?;
        let pos = self.find_command(&[opcode], start, end)?;
        let cmd = self.command_at(pos)?;
        if arg_offset + bytes.len() > cmd.args.len() {
            return Err(RomError::InvalidArgument(format!(
                "{} has {} argument bytes, cannot write {} at {}",
                cmd.def().name,
                cmd.args.len(),
                bytes.len(),
                arg_offset
            )));
        }

        let mut patched = cmd.to_bytes();
        patched[1 + arg_offset..1 + arg_offset + bytes.len()].copy_from_slice(bytes);
        if !matches!(command_size(&patched, 0), Ok(size) if size == patched.len()) {
            return Err(RomError::InvalidArgument(format!(
                "patch would change the size of {} at {:#X}",
                cmd.def().name,
                pos
            )));
        }

        self.edit(|s| {
            let idx = pos - s.header_len();
            s.stream[idx..idx + patched.len()].copy_from_slice(&patched);
            Ok(pos)
        })
    }

    /// Text listing of every object, function and command.
    pub fn disassemble(&self) -> Result<String> {
        let mut out = String::new();
        for obj in 0..self.object_count() {
            out.push_str(&format!("object {}\n", obj));
            for func in 0..FUNCTIONS_PER_OBJECT {
                let slot = obj * FUNCTIONS_PER_OBJECT + func;
                if self.slot_is_empty(slot) {
                    out.push_str(&format!("  function {:2} = function {}\n", func, func - 1));
                    continue;
                }
                let start = self.pointers[slot];
                let end = self.slot_end(slot)?;
                out.push_str(&format!("  function {:2} @ {:04X}\n", func, start));
                for item in self.commands(start, end) {
                    let (pos, cmd) = item?;
                    out.push_str(&format!("    {:04X}  {}\n", pos, cmd));
                }
            }
        }
        for (idx, text) in self.strings.iter() {
            out.push_str(&format!("string {:3}: {:02X?}\n", idx, text));
        }
        Ok(out)
    }

    fn used_string_indices(&self) -> Result<BTreeSet<usize>> {
        let mut used = BTreeSet::new();
        for item in self.all_commands() {
            let (_, cmd) = item?;
            if cmd.def().kind == ArgKind::Textbox {
                used.insert(cmd.args[0] as usize);
            }
        }
        Ok(used)
    }

    fn compact_strings(&mut self) -> Result<()> {
        if self.strings.is_compacted() {
            return Ok(());
        }
        let remap = self.strings.compaction_map();
        let h = self.header_len();
        let mut patches = Vec::new();
        if remap.iter().any(|(old, new)| old != new) {
            for item in self.all_commands() {
                let (pos, cmd) = item?;
                if cmd.def().kind != ArgKind::Textbox {
                    continue;
                }
                match remap.get(&(cmd.args[0] as usize)) {
                    Some(&new) => patches.push((pos + 1 - h, new as u8)),
                    None => warn!(
                        "textbox at {:#X} uses string {} which was never loaded",
                        pos, cmd.args[0]
                    ),
                }
            }
        }
        for (idx, new) in patches {
            self.stream[idx] = new;
        }
        self.strings.compact();
        Ok(())
    }

    pub fn string_count(&self) -> usize {
        self.strings.len()
    }

    pub fn string(&self, idx: usize) -> Result<&[u8]> {
        self.strings.get(idx).ok_or(RomError::NoSuchString(idx))
    }

    /// Appends a string and returns the index textbox commands should use.
    pub fn add_string(&mut self, text: &[u8]) -> Result<usize> {
        self.edit(|s| s.strings.add(text))
    }

    pub fn set_string(&mut self, idx: usize, text: &[u8]) -> Result<()> {
        self.edit(|s| s.strings.set(idx, text))
    }

    /// ROM address of the string table, from object 0's first function.
    pub fn string_table_address(&self) -> Result<Option<usize>> {
        if self.object_count() == 0 {
            return Ok(None);
        }
        let start = self.function_start(0, 0)?;
        let end = self.function_end(0, 0)?;
        match self.find_command_opt(&[OP_STRING_INDEX], start, end)? {
            Some(pos) => {
                let cmd = self.command_at(pos)?;
                Ok(read_le(&cmd.args, 0, 3))
            }
            None => Ok(None),
        }
    }

    /// Points the script at a new string table, adding the command that
    /// names it when the script has none.
    pub(crate) fn set_string_table_address(&mut self, rom_addr: usize) -> Result<()> {
        let cmd = EventCommand::string_index(rom_addr)?;
        let start = self.function_start(0, 0)?;
        let end = self.function_end(0, 0)?;
        match self.find_command_opt(&[OP_STRING_INDEX], start, end)? {
            Some(pos) => self.replace_command(pos, &cmd),
            None => self.insert_command(start, &cmd),
        }
    }

    pub(crate) fn strings_dirty(&self) -> bool {
        self.strings.is_dirty()
    }

    pub(crate) fn string_extent(&self) -> Option<(usize, usize)> {
        self.strings.extent()
    }

    pub(crate) fn string_block_len(&self) -> usize {
        self.strings.block_len()
    }

    pub(crate) fn serialize_strings(&self, offset: usize, bank_size: usize) -> Result<Vec<u8>> {
        self.strings.serialize(offset, bank_size)
    }

    pub(crate) fn mark_strings_written(&mut self, extent: (usize, usize)) {
        self.strings.mark_written(extent);
    }
}

/// Builds a script from per-object function bodies. Functions past the
/// given ones share the last given function's code.
#[cfg(test)]
pub(crate) fn build_script(objects: &[&[&[u8]]]) -> Vec<u8> {
    let header = objects.len() * OBJECT_HEADER_LEN;
    let mut table = Vec::new();
    let mut stream = Vec::new();
    for funcs in objects {
        let mut last = header + stream.len();
        for f in 0..FUNCTIONS_PER_OBJECT {
            if let Some(code) = funcs.get(f) {
                last = header + stream.len();
                stream.extend_from_slice(code);
            }
            table.extend_from_slice(&(last as u16).to_le_bytes());
        }
    }
    let mut out = vec![objects.len() as u8];
    out.extend(table);
    out.extend(stream);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcodes::CallMode;

    const RET: u8 = 0x00;
    const END: u8 = 0xB2;

    fn check_pointers(script: &EventScript) {
        for obj in 0..script.object_count() {
            let mut prev = 0;
            for func in 0..FUNCTIONS_PER_OBJECT {
                let p = script.function_start(obj, func).unwrap();
                assert!(p >= prev, "object {} function {} went backwards", obj, func);
                assert!(p >= script.header_len() && p <= script.len());
                prev = p;
            }
        }
    }

    /// Object 0: function 0 jumps over a textbox, function 1 loops back.
    fn jumpy() -> EventScript {
        let bytes = build_script(&[&[
            // 32: JumpForward 3 -> 36
            &[0x10, 0x03, 0xBB, 0x01, RET],
            // 37: Textbox 2, JumpBack 3 -> 37
            &[0xBB, 0x02, 0x11, 0x03, RET],
        ]]);
        EventScript::parse(&bytes).unwrap()
    }

    #[test]
    fn parses_and_reserializes() {
        let bytes = build_script(&[&[&[0xBB, 0x01, RET], &[RET]], &[&[RET]]]);
        let script = EventScript::parse(&bytes).unwrap();
        assert_eq!(script.object_count(), 2);
        assert_eq!(script.header_len(), 64);
        assert_eq!(script.function_start(0, 0).unwrap(), 64);
        assert_eq!(script.function_end(0, 0).unwrap(), 67);
        assert!(script.is_function_empty(0, 5).unwrap());
        assert!(!script.is_function_empty(0, 1).unwrap());
        assert_eq!(script.get_function(0, 7).unwrap(), &[RET]);
        assert_eq!(script.object_end(0).unwrap(), 68);
        assert_eq!(script.object_end(1).unwrap(), 69);
        assert_eq!(script.to_bytes(), bytes);
        assert!(!script.is_modified());
    }

    #[test]
    fn rejects_bad_tables() {
        assert!(EventScript::parse(&[]).is_err());
        assert!(EventScript::parse(&[1, 0, 0]).is_err());
        let mut bytes = build_script(&[&[&[RET]]]);
        bytes[1] = 0x10;
        assert!(matches!(EventScript::parse(&bytes), Err(RomError::Format(_))));
    }

    #[test]
    fn lookups_check_bounds() {
        let script = jumpy();
        assert!(matches!(script.function_start(1, 0), Err(RomError::NoSuchObject(1))));
        assert!(matches!(
            script.function_start(0, 16),
            Err(RomError::NoSuchFunction { .. })
        ));
    }

    #[test]
    fn insert_grows_crossing_jumps() {
        let mut script = jumpy();
        script.insert(34, &[0xBB, 0x09]).unwrap();
        assert_eq!(script.command_at(32).unwrap(), EventCommand::jump_forward(5));
        assert_eq!(script.function_start(0, 1).unwrap(), 39);
        assert_eq!(script.command_at(41).unwrap(), EventCommand::jump_back(3));
        assert!(script.is_modified());
        check_pointers(&script);
    }

    #[test]
    fn insert_at_function_start_joins_that_function() {
        let mut script = jumpy();
        script.insert(37, &[0xBB, 0x09]).unwrap();
        assert_eq!(script.function_start(0, 1).unwrap(), 37);
        assert_eq!(script.get_function(0, 1).unwrap()[..2], [0xBB, 0x09]);
        // The loop still returns to the top of function 1.
        assert_eq!(script.command_at(41).unwrap(), EventCommand::jump_back(5));
        assert_eq!(script.command_at(32).unwrap(), EventCommand::jump_forward(3));
    }

    #[test]
    fn delete_then_insert_restores_script() {
        let mut script = jumpy();
        let original = script.to_bytes();
        script.delete(37, 2).unwrap();
        assert_eq!(script.command_at(37).unwrap(), EventCommand::jump_back(1));
        script.insert(37, &[0xBB, 0x02]).unwrap();
        assert_eq!(script.to_bytes(), original);
    }

    #[test]
    fn insert_then_delete_is_identity_everywhere() {
        let original = jumpy();
        let boundaries: Vec<usize> = original
            .all_commands()
            .map(|c| c.unwrap().0)
            .chain(std::iter::once(original.len()))
            .collect();
        for pos in boundaries {
            let mut script = original.clone();
            script.insert(pos, &[0xBB, 0x07]).unwrap();
            check_pointers(&script);
            script.delete(pos, 2).unwrap();
            assert_eq!(script.to_bytes(), original.to_bytes(), "at {:#X}", pos);
        }
    }

    #[test]
    fn edits_off_instruction_boundaries_are_rejected() {
        let mut script = jumpy();
        assert!(matches!(
            script.insert(33, &[RET]),
            Err(RomError::NotOnInstructionBoundary(33))
        ));
        assert!(matches!(
            script.delete(32, 1),
            Err(RomError::NotOnInstructionBoundary(33))
        ));
        assert!(script.insert(32, &[0x12, 0x00]).is_err());
        assert!(!script.is_modified());
    }

    #[test]
    fn jump_overflow_leaves_script_untouched() {
        let mut code = vec![0x10, 0xFE];
        code.extend(std::iter::repeat(RET).take(0xFE));
        code.push(END);
        let mut script = EventScript::parse(&build_script(&[&[&code]])).unwrap();
        let before = script.to_bytes();

        assert!(matches!(
            script.insert(40, &[0xBB, 0x00]),
            Err(RomError::JumpOutOfRange { pos: 32, distance: 0x100 })
        ));
        assert_eq!(script.to_bytes(), before);
        assert!(!script.is_modified());
    }

    #[test]
    fn replace_and_delete_commands() {
        let mut script = jumpy();
        script
            .replace_command(34, &EventCommand::new(0x12, vec![1, 2, 3, 4]).unwrap())
            .unwrap();
        assert_eq!(script.command_at(32).unwrap(), EventCommand::jump_forward(6));
        assert_eq!(script.function_start(0, 1).unwrap(), 40);

        script.delete_command(34).unwrap();
        assert_eq!(script.command_at(32).unwrap(), EventCommand::jump_forward(1));
        assert_eq!(script.function_start(0, 1).unwrap(), 35);
    }

    #[test]
    fn set_function_fills_empty_slot() {
        let bytes = build_script(&[&[&[0xBB, 0x01, RET], &[RET]], &[&[RET]]]);
        let mut script = EventScript::parse(&bytes).unwrap();
        script.set_function(0, 3, &[0xBB, 0x04, RET]).unwrap();

        assert_eq!(script.function_start(0, 3).unwrap(), 68);
        assert_eq!(script.get_function(0, 3).unwrap(), &[0xBB, 0x04, RET]);
        assert_eq!(script.get_function(0, 2).unwrap(), &[RET]);
        for func in 4..16 {
            assert!(script.is_function_empty(0, func).unwrap());
            assert_eq!(script.function_start(0, func).unwrap(), 68);
        }
        assert_eq!(script.object_start(1).unwrap(), 71);
        assert_eq!(script.get_function(1, 0).unwrap(), &[RET]);
        check_pointers(&script);
    }

    #[test]
    fn set_function_replaces_code() {
        let mut script = jumpy();
        script.set_function(0, 0, &[0xBB, 0x05, RET]).unwrap();
        assert_eq!(script.get_function(0, 0).unwrap(), &[0xBB, 0x05, RET]);
        assert_eq!(script.function_start(0, 1).unwrap(), 35);
        assert_eq!(script.command_at(37).unwrap(), EventCommand::jump_back(3));
        assert!(script.set_function(0, 0, &[0x12]).is_err());
    }

    #[test]
    fn appended_object_takes_new_function() {
        let bytes = build_script(&[&[&[RET]], &[&[RET]]]);
        let mut script = EventScript::parse(&bytes).unwrap();
        let original_len = script.len();

        let id = script.append_object().unwrap();
        assert_eq!(id, 2);
        assert_eq!(script.object_start(0).unwrap(), 96);
        assert_eq!(script.object_start(1).unwrap(), 97);
        assert_eq!(script.function_start(2, 0).unwrap(), original_len + 32);
        assert!(script.is_function_empty(2, 2).unwrap());

        let code = [
            EventCommand::return_cmd().to_bytes(),
            EventCommand::end_cmd().to_bytes(),
        ]
        .concat();
        script.set_function(id, 0, &code).unwrap();
        let out = script.to_bytes();
        assert_eq!(out[0], 3);
        assert_eq!(script.function_start(2, 0).unwrap(), 98);

        let reparsed = EventScript::parse(&out).unwrap();
        let start = reparsed.function_start(2, 0).unwrap();
        let end = reparsed.function_end(2, 0).unwrap();
        let decoded: Vec<EventCommand> = reparsed
            .commands(start, end)
            .map(|c| c.unwrap().1)
            .collect();
        assert_eq!(decoded, vec![EventCommand::return_cmd(), EventCommand::end_cmd()]);
        check_pointers(&reparsed);
    }

    #[test]
    fn appending_after_codeless_object_keeps_order() {
        let bytes = build_script(&[&[&[RET]], &[]]);
        let mut script = EventScript::parse(&bytes).unwrap();
        assert_eq!(script.object_start(1).unwrap(), script.len());

        let id = script.append_object().unwrap();
        assert_eq!(id, 2);
        assert_eq!(script.object_start(1).unwrap(), 97);
        assert_eq!(script.object_end(1).unwrap(), 97);
        assert_eq!(script.object_start(2).unwrap(), 97);
        assert_eq!(script.function_start(2, 1).unwrap(), 98);
        assert_eq!(script.len(), 99);
        check_pointers(&script);

        let starts: Vec<usize> = (0..script.object_count())
            .map(|obj| script.object_start(obj).unwrap())
            .collect();
        assert!(starts.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn appending_keeps_jumps_to_stream_end() {
        // 33: JumpForward 1 -> 35, the end of the stream.
        let code = [RET, 0x10, 0x01];
        let mut script = EventScript::parse(&build_script(&[&[&code]])).unwrap();
        assert_eq!(script.len(), 35);

        let id = script.append_object().unwrap();
        assert_eq!(script.get_function(0, 0).unwrap(), &code);
        let jump = script.find_command(&[0x11, 0x10], 64, 67).unwrap();
        let (_, target) = jump_target(jump, &script.command_at(jump).unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(target, script.object_start(id).unwrap());
        assert_eq!(script.object_end(0).unwrap(), target);
        check_pointers(&script);
    }

    #[test]
    fn copied_object_keeps_layout() {
        let mut script = jumpy();
        let id = script.append_copy_of(0).unwrap();
        assert_eq!(id, 1);
        for func in 0..16 {
            assert_eq!(
                script.get_function(0, func).unwrap().to_vec(),
                script.get_function(1, func).unwrap().to_vec()
            );
        }
        assert_eq!(
            script.function_start(1, 1).unwrap() - script.object_start(1).unwrap(),
            5
        );
        check_pointers(&script);
    }

    #[test]
    fn removing_an_object_rewrites_references() {
        let call1 = EventCommand::call_obj_function(1, 2, 3, CallMode::Sync).unwrap().to_bytes();
        let call2 = EventCommand::call_obj_function(2, 0, 1, CallMode::Halt).unwrap().to_bytes();
        let show2 = EventCommand::set_object_visibility(2, true).unwrap().to_bytes();
        let hide1 = EventCommand::set_object_visibility(1, false).unwrap().to_bytes();
        // JumpForward 4 skips the call to object 1.
        let obj0 = [vec![0x10, 0x04], call1, call2, show2, vec![RET]].concat();
        let obj2 = [hide1, vec![RET]].concat();
        let bytes = build_script(&[&[&obj0], &[&[RET]], &[&obj2]]);
        let mut script = EventScript::parse(&bytes).unwrap();

        script.remove_object(1).unwrap();
        assert_eq!(script.object_count(), 2);
        assert_eq!(
            script.get_function(0, 0).unwrap(),
            &[0x10, 0x01, 0x04, 0x02, 0x10, 0x7C, 0x02, RET]
        );
        assert_eq!(script.get_function(1, 0).unwrap(), &[RET]);
        assert_eq!(script.object_start(1).unwrap(), 64 + 8);
        check_pointers(&script);

        assert!(matches!(script.remove_object(5), Err(RomError::NoSuchObject(5))));
    }

    #[test]
    fn odd_object_handle_stops_removal() {
        let bytes = build_script(&[&[&[RET]], &[&[0x7C, 0x01, RET]]]);
        let mut script = EventScript::parse(&bytes).unwrap();
        assert!(matches!(script.remove_object(0), Err(RomError::Format(_))));
        assert_eq!(script.to_bytes(), bytes);
        assert!(!script.is_modified());
    }

    #[test]
    fn finds_commands_and_bytes() {
        let script = jumpy();
        assert_eq!(script.find_command(&[0xBB], 32, 42).unwrap(), 34);
        assert_eq!(script.find_command(&[0xBB], 36, 42).unwrap(), 37);
        assert!(matches!(
            script.find_command(&[0xB2], 32, 42),
            Err(RomError::CommandNotFound { .. })
        ));
        assert_eq!(script.find_command_opt(&[0x11], 32, 37).unwrap(), None);
        assert_eq!(script.find_bytes(&[0x02, 0x11], 0, 100), Some(38));
        assert_eq!(script.find_bytes(&[0x77], 0, 100), None);
    }

    #[test]
    fn patches_command_arguments_in_place() {
        let mut script = jumpy();
        assert_eq!(script.patch_command_argument(0, 1, 0xBB, 0, &[0x33]).unwrap(), 37);
        assert_eq!(script.command_at(37).unwrap(), EventCommand::textbox(0x33));
        assert!(script.patch_command_argument(0, 1, 0xBB, 1, &[0]).is_err());
        assert!(matches!(
            script.patch_command_argument(0, 0, 0x88, 0, &[0]),
            Err(RomError::CommandNotFound { .. })
        ));

        let mut effect = EventScript::parse(&build_script(&[&[&[0x88, 0x10, RET]]])).unwrap();
        assert!(effect.patch_command_argument(0, 0, 0x88, 0, &[0x20]).is_err());
        assert!(effect.patch_command_argument(0, 0, 0x88, 0, &[0x01]).is_ok());
    }

    #[test]
    fn first_edit_compacts_string_indices() {
        let mut script = jumpy();
        script.strings = StringTable::from_loaded(
            [(1, b"one".to_vec()), (2, b"two".to_vec())].into_iter().collect(),
            None,
        );
        let idx = script.add_string(b"three").unwrap();
        assert_eq!(idx, 2);
        assert_eq!(script.command_at(34).unwrap(), EventCommand::textbox(0));
        assert_eq!(script.command_at(37).unwrap(), EventCommand::textbox(1));
        assert_eq!(script.string(1).unwrap(), b"two");
        assert!(script.strings_dirty());

        // Later edits leave the numbering alone.
        script.set_string(0, b"uno").unwrap();
        assert_eq!(script.command_at(34).unwrap(), EventCommand::textbox(0));
        assert_eq!(script.string_count(), 3);
    }

    #[test]
    fn string_table_command_is_added_once() {
        let mut script = jumpy();
        assert_eq!(script.string_table_address().unwrap(), None);
        script.set_string_table_address(0xC6_1234).unwrap();
        assert_eq!(script.string_table_address().unwrap(), Some(0xC6_1234));
        assert_eq!(script.command_at(36).unwrap(), EventCommand::jump_forward(3));

        script.set_string_table_address(0xC6_0000).unwrap();
        assert_eq!(script.string_table_address().unwrap(), Some(0xC6_0000));
        assert_eq!(script.len(), jumpy().len() + 4);
    }

    #[test]
    fn disassembles_functions() {
        let text = jumpy().disassemble().unwrap();
        assert!(text.contains("object 0"));
        assert!(text.contains("  function  0 @ 0020"));
        assert!(text.contains("    0020  JumpForward 03"));
        assert!(text.contains("  function  2 = function 1"));
    }
}
