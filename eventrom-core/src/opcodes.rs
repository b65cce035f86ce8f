use std::fmt;

use crate::{Result, RomError};

/// What the arguments of an opcode refer to, where the editor needs to know.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgKind {
    Plain,
    /// Last argument byte is a forward jump distance.
    JumpForward,
    /// Last argument byte is a backward jump distance.
    JumpBack,
    /// First argument byte is an object handle (object id * 2).
    ObjectRef,
    /// First argument byte is a string table index.
    Textbox,
    /// Three-byte ROM address of the string pointer table.
    StringIndex,
    /// Inline data whose length is given by argument bytes 3-4.
    MemCopy,
    /// Size depends on the high nibble of the first argument byte.
    DisplayEffect,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpcodeDef {
    pub name: &'static str,
    /// Total size including the opcode byte; the minimum for variable opcodes.
    pub size: u8,
    pub kind: ArgKind,
}

const fn op(name: &'static str, size: u8, kind: ArgKind) -> OpcodeDef {
    OpcodeDef { name, size, kind }
}

const fn plain(name: &'static str, size: u8) -> OpcodeDef {
    op(name, size, ArgKind::Plain)
}

const fn fwd(name: &'static str, size: u8) -> OpcodeDef {
    op(name, size, ArgKind::JumpForward)
}

const UNKNOWN: OpcodeDef = plain("Unknown", 1);

use ArgKind::*;

pub const OP_RETURN: u8 = 0x00;
pub const OP_CALL_OBJ_FUNC: u8 = 0x02;
pub const OP_CALL_OBJ_FUNC_SYNC: u8 = 0x03;
pub const OP_CALL_OBJ_FUNC_HALT: u8 = 0x04;
pub const OP_REMOVE_OBJECT: u8 = 0x0A;
pub const OP_JUMP_FORWARD: u8 = 0x10;
pub const OP_JUMP_BACK: u8 = 0x11;
pub const OP_MEM_COPY: u8 = 0x4E;
pub const OP_SHOW_OBJECT: u8 = 0x7C;
pub const OP_HIDE_OBJECT: u8 = 0x7D;
pub const OP_DISPLAY_EFFECT: u8 = 0x88;
pub const OP_BREAK: u8 = 0xB1;
pub const OP_END: u8 = 0xB2;
pub const OP_STRING_INDEX: u8 = 0xB8;
pub const OP_TEXTBOX: u8 = 0xBB;

/// Sizes of the display-effect opcode, indexed by the mode nibble.
const DISPLAY_EFFECT_SIZES: [u8; 16] = [2, 2, 4, 4, 6, 6, 6, 6, 3, 3, 3, 3, 3, 3, 3, 3];

static OPCODES: [OpcodeDef; 256] = [
    /* 00 */ plain("Return", 1),
    /* 01 */ UNKNOWN,
    /* 02 */ op("CallObjFunc", 3, ObjectRef),
    /* 03 */ op("CallObjFuncSync", 3, ObjectRef),
    /* 04 */ op("CallObjFuncHalt", 3, ObjectRef),
    /* 05 */ plain("CallPcFunc", 3),
    /* 06 */ plain("CallPcFuncSync", 3),
    /* 07 */ plain("CallPcFuncHalt", 3),
    /* 08 */ plain("ObjectActivatable", 1),
    /* 09 */ plain("ObjectDeactivatable", 1),
    /* 0a */ op("RemoveObject", 2, ObjectRef),
    /* 0b */ op("DisableProcessing", 2, ObjectRef),
    /* 0c */ op("EnableProcessing", 2, ObjectRef),
    /* 0d */ plain("NpcMovementProps", 2),
    /* 0e */ plain("NpcPositioning", 2),
    /* 0f */ UNKNOWN,

    /* 10 */ fwd("JumpForward", 2),
    /* 11 */ op("JumpBack", 2, JumpBack),
    /* 12 */ fwd("IfLocalByte", 5),
    /* 13 */ fwd("IfLocalWord", 6),
    /* 14 */ fwd("IfMemVsMem", 5),
    /* 15 */ fwd("IfMemVsMemWord", 5),
    /* 16 */ fwd("IfMemByte", 5),
    /* 17 */ plain("FaceUp", 1),
    /* 18 */ fwd("IfStoryline", 3),
    /* 19 */ plain("LoadResultToLocal", 2),
    /* 1a */ fwd("IfResult", 3),
    /* 1b */ plain("FaceDown", 1),
    /* 1c */ plain("LoadResultFromLocal", 2),
    /* 1d */ plain("FaceLeft", 1),
    /* 1e */ plain("FaceRight", 1),
    /* 1f */ plain("FaceObject", 2),

    /* 20 */ plain("LoadPcCount", 2),
    /* 21 */ plain("GetObjectCoords", 4),
    /* 22 */ plain("GetPcCoords", 4),
    /* 23 */ plain("GetObjectFacing", 3),
    /* 24 */ plain("GetPcFacing", 3),
    /* 25 */ plain("FacePc", 2),
    /* 26 */ UNKNOWN,
    /* 27 */ fwd("IfObjectVisible", 3),
    /* 28 */ fwd("IfObjectInBattle", 3),
    /* 29 */ plain("LoadEnemyByte", 2),
    /* 2a */ plain("SetBit04", 1),
    /* 2b */ plain("SetBit08", 1),
    /* 2c */ plain("Unknown2C", 3),
    /* 2d */ fwd("IfNoButton", 2),
    /* 2e */ plain("ColorMath", 6),
    /* 2f */ plain("Unknown2F", 3),

    /* 30 */ fwd("IfDashPressed", 2),
    /* 31 */ fwd("IfConfirmPressed", 2),
    /* 32 */ plain("SetBit10", 1),
    /* 33 */ plain("ChangePalette", 2),
    /* 34 */ fwd("IfAPressed", 2),
    /* 35 */ fwd("IfBPressed", 2),
    /* 36 */ fwd("IfXPressed", 2),
    /* 37 */ fwd("IfYPressed", 2),
    /* 38 */ fwd("IfLPressed", 2),
    /* 39 */ fwd("IfRPressed", 2),
    /* 3a */ UNKNOWN,
    /* 3b */ fwd("IfDashNew", 2),
    /* 3c */ fwd("IfConfirmNew", 2),
    /* 3d */ UNKNOWN,
    /* 3e */ UNKNOWN,
    /* 3f */ fwd("IfPcActive", 3),

    /* 40 */ fwd("IfPcRecruited", 3),
    /* 41 */ fwd("IfFlagSet", 3),
    /* 42 */ UNKNOWN,
    /* 43 */ UNKNOWN,
    /* 44 */ plain("SetFlag", 2),
    /* 45 */ UNKNOWN,
    /* 46 */ UNKNOWN,
    /* 47 */ plain("LimitAnimations", 2),
    /* 48 */ plain("LoadMem24", 5),
    /* 49 */ plain("LoadMem24Word", 5),
    /* 4a */ plain("StoreByteMem24", 5),
    /* 4b */ plain("StoreWordMem24", 6),
    /* 4c */ plain("StoreLocalMem24", 5),
    /* 4d */ plain("StoreLocalMem24Word", 5),
    /* 4e */ op("MemCopy", 6, MemCopy),
    /* 4f */ plain("AssignByteLocal", 3),

    /* 50 */ plain("AssignWordLocal", 4),
    /* 51 */ plain("CopyLocal", 3),
    /* 52 */ plain("CopyLocalWord", 3),
    /* 53 */ plain("MemToLocal", 4),
    /* 54 */ plain("MemToLocalWord", 4),
    /* 55 */ plain("GetGold", 2),
    /* 56 */ plain("AssignByteMem", 4),
    /* 57 */ plain("LoadPc0", 1),
    /* 58 */ plain("StoreLocalToMem", 4),
    /* 59 */ plain("StoreLocalToMemWord", 4),
    /* 5a */ plain("AssignLocal", 3),
    /* 5b */ plain("AddToLocal", 3),
    /* 5c */ plain("LoadPc1", 1),
    /* 5d */ plain("AddLocalToLocal", 3),
    /* 5e */ plain("AddLocalToLocalWord", 3),
    /* 5f */ plain("SubtractFromLocal", 3),

    /* 60 */ plain("SubtractFromLocalWord", 4),
    /* 61 */ plain("SubtractLocal", 3),
    /* 62 */ plain("LoadPc2", 1),
    /* 63 */ plain("SetBit", 3),
    /* 64 */ plain("ResetBit", 3),
    /* 65 */ plain("SetBitMem", 4),
    /* 66 */ plain("ResetBitMem", 4),
    /* 67 */ plain("MaskLocal", 3),
    /* 68 */ plain("LoadPc3", 1),
    /* 69 */ plain("OrLocal", 3),
    /* 6a */ plain("LoadPc4", 1),
    /* 6b */ plain("XorLocal", 3),
    /* 6c */ plain("LoadPc5", 1),
    /* 6d */ plain("LoadPc6", 1),
    /* 6e */ UNKNOWN,
    /* 6f */ plain("ShiftLocal", 3),

    /* 70 */ UNKNOWN,
    /* 71 */ plain("IncrementLocal", 2),
    /* 72 */ plain("IncrementLocalWord", 2),
    /* 73 */ plain("DecrementLocal", 2),
    /* 74 */ UNKNOWN,
    /* 75 */ plain("SetLocal", 2),
    /* 76 */ plain("SetLocalWord", 2),
    /* 77 */ plain("ResetLocal", 2),
    /* 78 */ UNKNOWN,
    /* 79 */ UNKNOWN,
    /* 7a */ plain("JumpAnimation", 4),
    /* 7b */ plain("JumpAnimationFull", 5),
    /* 7c */ op("ShowObject", 2, ObjectRef),
    /* 7d */ op("HideObject", 2, ObjectRef),
    /* 7e */ plain("DrawInvisible", 1),
    /* 7f */ plain("LoadRandom", 2),

    /* 80 */ plain("LoadPc", 2),
    /* 81 */ plain("LoadPcInParty", 2),
    /* 82 */ plain("LoadNpc", 2),
    /* 83 */ plain("LoadEnemy", 3),
    /* 84 */ plain("SetSolidity", 2),
    /* 85 */ UNKNOWN,
    /* 86 */ UNKNOWN,
    /* 87 */ plain("SetScriptTiming", 2),
    /* 88 */ op("DisplayEffect", 2, DisplayEffect),
    /* 89 */ plain("SetSpeed", 2),
    /* 8a */ plain("SetSpeedFromLocal", 2),
    /* 8b */ plain("SetCoordinates", 3),
    /* 8c */ plain("SetCoordinatesFromLocal", 3),
    /* 8d */ plain("SetPixelCoordinates", 5),
    /* 8e */ plain("SetSpritePriority", 2),
    /* 8f */ plain("FollowAtDistance", 2),

    /* 90 */ plain("DrawSelf", 1),
    /* 91 */ plain("HideSelf", 1),
    /* 92 */ plain("MoveAtAngle", 3),
    /* 93 */ UNKNOWN,
    /* 94 */ plain("FollowObject", 2),
    /* 95 */ plain("FollowPc", 2),
    /* 96 */ plain("MoveToCoords", 3),
    /* 97 */ plain("MoveToLocalCoords", 3),
    /* 98 */ plain("MoveTowardObject", 3),
    /* 99 */ plain("MoveTowardPc", 3),
    /* 9a */ plain("MoveToCoordsDistance", 4),
    /* 9b */ UNKNOWN,
    /* 9c */ plain("MoveAtAngleDistance", 3),
    /* 9d */ plain("MoveAtAngleFromLocal", 3),
    /* 9e */ plain("MoveToObject", 2),
    /* 9f */ plain("MoveToPc", 2),

    /* a0 */ plain("MoveToCoordsAnimated", 3),
    /* a1 */ plain("MoveToLocalAnimated", 3),
    /* a2 */ UNKNOWN,
    /* a3 */ UNKNOWN,
    /* a4 */ UNKNOWN,
    /* a5 */ UNKNOWN,
    /* a6 */ plain("SetFacing", 2),
    /* a7 */ plain("SetFacingFromLocal", 2),
    /* a8 */ plain("FaceObjectHandle", 2),
    /* a9 */ plain("FacePcHandle", 2),
    /* aa */ plain("PlayAnimationLoop", 2),
    /* ab */ plain("PlayAnimation", 2),
    /* ac */ plain("PlayStaticAnimation", 2),
    /* ad */ plain("Pause", 2),
    /* ae */ plain("ResetAnimation", 1),
    /* af */ plain("WaitForInput", 1),

    /* b0 */ plain("WaitForInputLoop", 1),
    /* b1 */ plain("Break", 1),
    /* b2 */ plain("End", 1),
    /* b3 */ plain("AnimationStand", 1),
    /* b4 */ plain("AnimationWalk", 1),
    /* b5 */ plain("LoopUntilFinished", 2),
    /* b6 */ plain("LoopUntilStopped", 2),
    /* b7 */ plain("LoopAnimation", 3),
    /* b8 */ op("StringIndex", 4, StringIndex),
    /* b9 */ plain("Pause250", 1),
    /* ba */ plain("Pause500", 1),
    /* bb */ op("Textbox", 2, Textbox),
    /* bc */ plain("Pause1000", 1),
    /* bd */ plain("Pause2000", 1),
    /* be */ UNKNOWN,
    /* bf */ UNKNOWN,

    /* c0 */ op("DecisionBox", 3, Textbox),
    /* c1 */ op("TextboxTop", 2, Textbox),
    /* c2 */ op("TextboxBottom", 2, Textbox),
    /* c3 */ op("DecisionBoxTop", 3, Textbox),
    /* c4 */ op("DecisionBoxBottom", 3, Textbox),
    /* c5 */ UNKNOWN,
    /* c6 */ UNKNOWN,
    /* c7 */ plain("AddItemFromLocal", 2),
    /* c8 */ plain("SpecialDialog", 2),
    /* c9 */ fwd("IfHasItem", 3),
    /* ca */ plain("AddItem", 2),
    /* cb */ plain("RemoveItem", 2),
    /* cc */ fwd("IfHasGold", 4),
    /* cd */ plain("AddGold", 3),
    /* ce */ plain("RemoveGold", 3),
    /* cf */ fwd("IfPcInParty", 3),

    /* d0 */ plain("AddPcToReserve", 2),
    /* d1 */ plain("RemovePc", 2),
    /* d2 */ fwd("IfPcActiveAlt", 3),
    /* d3 */ plain("AddPcToParty", 2),
    /* d4 */ plain("MovePcToReserve", 2),
    /* d5 */ plain("EquipItem", 3),
    /* d6 */ plain("RemovePcFromParty", 2),
    /* d7 */ plain("GetItemCount", 3),
    /* d8 */ plain("StartBattle", 3),
    /* d9 */ plain("MovePartyTo", 7),
    /* da */ plain("PartyFollow", 1),
    /* db */ UNKNOWN,
    /* dc */ plain("ChangeLocationInstant", 5),
    /* dd */ plain("ChangeLocationFade", 5),
    /* de */ plain("ChangeLocationBlack", 5),
    /* df */ plain("ChangeLocationWait", 5),

    /* e0 */ plain("ChangeLocation", 5),
    /* e1 */ plain("ChangeLocationAlt", 5),
    /* e2 */ plain("ChangeLocationFromLocal", 5),
    /* e3 */ plain("Explore", 2),
    /* e4 */ plain("CopyTiles", 8),
    /* e5 */ plain("CopyTilesAlt", 8),
    /* e6 */ plain("ScrollLayers", 7),
    /* e7 */ plain("ScrollScreen", 3),
    /* e8 */ plain("PlaySound", 2),
    /* e9 */ UNKNOWN,
    /* ea */ plain("PlaySong", 2),
    /* eb */ plain("SetVolume", 3),
    /* ec */ plain("SoundCommand", 4),
    /* ed */ plain("WaitForSilence", 1),
    /* ee */ plain("WaitForSongEnd", 1),
    /* ef */ UNKNOWN,

    /* f0 */ plain("DarkenScreen", 2),
    /* f1 */ plain("ColorAddition", 3),
    /* f2 */ plain("FadeOut", 1),
    /* f3 */ plain("WaitForBrighten", 1),
    /* f4 */ plain("ShakeScreen", 2),
    /* f5 */ UNKNOWN,
    /* f6 */ UNKNOWN,
    /* f7 */ UNKNOWN,
    /* f8 */ plain("RestoreHpMp", 1),
    /* f9 */ plain("RestoreHp", 1),
    /* fa */ plain("RestoreMp", 1),
    /* fb */ UNKNOWN,
    /* fc */ UNKNOWN,
    /* fd */ UNKNOWN,
    /* fe */ plain("GeometryShift", 18),
    /* ff */ plain("Mode7Scene", 2),
];

pub fn opcode_def(opcode: u8) -> &'static OpcodeDef {
    &OPCODES[opcode as usize]
}

/// Finds an opcode by mnemonic, ignoring case. `OpXX` names any opcode.
pub fn lookup_mnemonic(name: &str) -> Option<u8> {
    if let Some(hex) = name.strip_prefix("Op").or_else(|| name.strip_prefix("OP")) {
        if hex.len() == 2 {
            if let Ok(opcode) = u8::from_str_radix(hex, 16) {
                return Some(opcode);
            }
        }
    }
    OPCODES
        .iter()
        .position(|def| def.name != UNKNOWN.name && def.name.eq_ignore_ascii_case(name))
        .map(|i| i as u8)
}

/// Size of the command starting at `pos`, peeking at its length or mode byte
/// when the opcode needs it.
pub fn command_size(buf: &[u8], pos: usize) -> Result<usize> {
    let opcode = *buf
        .get(pos)
        .ok_or_else(|| RomError::Format(format!("no command at {:#X}", pos)))?;
    let def = opcode_def(opcode);

    let size = match def.kind {
        ArgKind::MemCopy => {
            let len = buf
                .get(pos + 4..pos + 6)
                .map(|b| u16::from_le_bytes([b[0], b[1]]) as usize)
                .ok_or_else(|| RomError::Format(format!("truncated MemCopy at {:#X}", pos)))?;
            if len < 2 {
                return Err(RomError::Format(format!(
                    "MemCopy at {:#X} has length {}",
                    pos, len
                )));
            }
            4 + len
        }
        ArgKind::DisplayEffect => {
            let mode = buf.get(pos + 1).ok_or_else(|| {
                RomError::Format(format!("truncated DisplayEffect at {:#X}", pos))
            })? >> 4;
            DISPLAY_EFFECT_SIZES[mode as usize] as usize
        }
        _ => def.size as usize,
    };

    if pos + size > buf.len() {
        return Err(RomError::Format(format!(
            "{} at {:#X} runs past the end of the stream",
            def.name, pos
        )));
    }
    Ok(size)
}

/// One decoded instruction: an opcode plus its argument bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventCommand {
    pub opcode: u8,
    pub args: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallMode {
    /// Queue the call and continue.
    Continue,
    /// Wait until the called function starts.
    Sync,
    /// Wait until the called function returns.
    Halt,
}

impl EventCommand {
    /// Builds a command, checking the argument count against the opcode.
    pub fn new(opcode: u8, args: Vec<u8>) -> Result<Self> {
        let mut bytes = Vec::with_capacity(args.len() + 1);
        bytes.push(opcode);
        bytes.extend_from_slice(&args);
        let size = command_size(&bytes, 0).map_err(|_| {
            RomError::InvalidArgument(format!(
                "{} cannot take {} argument bytes",
                opcode_def(opcode).name,
                args.len()
            ))
        })?;
        if size != bytes.len() {
            return Err(RomError::InvalidArgument(format!(
                "{} takes {} argument bytes, got {}",
                opcode_def(opcode).name,
                size - 1,
                args.len()
            )));
        }
        Ok(EventCommand { opcode, args })
    }

    pub fn decode(buf: &[u8], pos: usize) -> Result<Self> {
        let size = command_size(buf, pos)?;
        Ok(EventCommand {
            opcode: buf[pos],
            args: buf[pos + 1..pos + size].to_vec(),
        })
    }

    pub fn def(&self) -> &'static OpcodeDef {
        opcode_def(self.opcode)
    }

    pub fn len(&self) -> usize {
        1 + self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        out.push(self.opcode);
        out.extend_from_slice(&self.args);
        out
    }

    pub fn return_cmd() -> Self {
        EventCommand {
            opcode: OP_RETURN,
            args: Vec::new(),
        }
    }

    pub fn end_cmd() -> Self {
        EventCommand {
            opcode: OP_END,
            args: Vec::new(),
        }
    }

    pub fn break_cmd() -> Self {
        EventCommand {
            opcode: OP_BREAK,
            args: Vec::new(),
        }
    }

    pub fn jump_forward(distance: u8) -> Self {
        EventCommand {
            opcode: OP_JUMP_FORWARD,
            args: vec![distance],
        }
    }

    pub fn jump_back(distance: u8) -> Self {
        EventCommand {
            opcode: OP_JUMP_BACK,
            args: vec![distance],
        }
    }

    pub fn call_obj_function(obj: usize, func: usize, priority: u8, mode: CallMode) -> Result<Self> {
        let handle = object_handle(obj)?;
        if func >= 16 {
            return Err(RomError::InvalidArgument(format!(
                "function {} does not fit in 4 bits",
                func
            )));
        }
        if priority >= 8 {
            return Err(RomError::InvalidArgument(format!(
                "priority {} does not fit in 3 bits",
                priority
            )));
        }
        let opcode = match mode {
            CallMode::Continue => OP_CALL_OBJ_FUNC,
            CallMode::Sync => OP_CALL_OBJ_FUNC_SYNC,
            CallMode::Halt => OP_CALL_OBJ_FUNC_HALT,
        };
        Ok(EventCommand {
            opcode,
            args: vec![handle, (priority << 4) | func as u8],
        })
    }

    pub fn set_object_visibility(obj: usize, visible: bool) -> Result<Self> {
        let handle = object_handle(obj)?;
        let opcode = if visible { OP_SHOW_OBJECT } else { OP_HIDE_OBJECT };
        Ok(EventCommand {
            opcode,
            args: vec![handle],
        })
    }

    pub fn remove_object(obj: usize) -> Result<Self> {
        Ok(EventCommand {
            opcode: OP_REMOVE_OBJECT,
            args: vec![object_handle(obj)?],
        })
    }

    pub fn textbox(string_index: u8) -> Self {
        EventCommand {
            opcode: OP_TEXTBOX,
            args: vec![string_index],
        }
    }

    pub fn string_index(rom_addr: usize) -> Result<Self> {
        if rom_addr > 0xFF_FFFF {
            return Err(RomError::InvalidArgument(format!(
                "{:#X} is not a 24-bit address",
                rom_addr
            )));
        }
        Ok(EventCommand {
            opcode: OP_STRING_INDEX,
            args: vec![rom_addr as u8, (rom_addr >> 8) as u8, (rom_addr >> 16) as u8],
        })
    }

    /// Copies `data` to the 24-bit RAM address `dest`.
    pub fn mem_copy(dest: usize, data: &[u8]) -> Result<Self> {
        if dest > 0xFF_FFFF || data.len() + 2 > 0xFFFF {
            return Err(RomError::InvalidArgument(format!(
                "cannot copy {} bytes to {:#X}",
                data.len(),
                dest
            )));
        }
        let len = (data.len() + 2) as u16;
        let mut args = vec![dest as u8, (dest >> 8) as u8, (dest >> 16) as u8];
        args.extend_from_slice(&len.to_le_bytes());
        args.extend_from_slice(data);
        Ok(EventCommand {
            opcode: OP_MEM_COPY,
            args,
        })
    }
}

fn object_handle(obj: usize) -> Result<u8> {
    if obj >= 0x80 {
        return Err(RomError::InvalidArgument(format!(
            "object {} has no 8-bit handle",
            obj
        )));
    }
    Ok((obj * 2) as u8)
}

impl fmt::Display for EventCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let def = self.def();
        if def.name == UNKNOWN.name {
            write!(f, "Op{:02X}", self.opcode)?;
        } else {
            write!(f, "{}", def.name)?;
        }
        for b in &self.args {
            write!(f, " {:02X}", b)?;
        }
        Ok(())
    }
}
