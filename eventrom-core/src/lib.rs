use thiserror::Error;

pub mod compression;
pub mod event;
mod event_compiler;
pub mod freespace;
mod layout;
pub mod opcodes;
pub mod rom;
mod session;
mod strings;

pub use event::EventScript;
pub use event_compiler::{compile_commands_from_str, compile_script_from_str, ScriptCompileError};
pub use freespace::FreeSpace;
pub use layout::RomLayout;
pub use opcodes::{ArgKind, CallMode, EventCommand, OpcodeDef};
pub use rom::{LocationRecord, RomImage, WriteMode};
pub use session::EventSession;

#[derive(Debug, Error)]
pub enum RomError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("layout config error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed compressed block at {offset:#X}: {reason}")]
    Compression { offset: usize, reason: String },

    #[error("malformed event script: {0}")]
    Format(String),

    #[error("no command {opcodes:02X?} between {start:#X} and {end:#X}")]
    CommandNotFound {
        opcodes: Vec<u8>,
        start: usize,
        end: usize,
    },

    #[error("offset {0:#X} is not on an instruction boundary")]
    NotOnInstructionBoundary(usize),

    #[error("string table error: {0}")]
    StringTable(String),

    #[error("location {0:#X} is outside the location table")]
    UnknownLocation(u16),

    #[error("no free region of {size} bytes")]
    OutOfSpace { size: usize },

    #[error("no single bank can hold regions of sizes {sizes:?}")]
    NoSharedBank { sizes: Vec<usize> },

    #[error("script grew to {0} bytes, past the 16-bit offset limit")]
    ScriptTooLarge(usize),

    #[error("jump at {pos:#X} would need a distance of {distance} bytes")]
    JumpOutOfRange { pos: usize, distance: usize },

    #[error("invalid range [{start:#X}, {end:#X})")]
    InvalidRange { start: usize, end: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("object {0} does not exist")]
    NoSuchObject(usize),

    #[error("object {object} has no function {function}")]
    NoSuchFunction { object: usize, function: usize },

    #[error("string {0} does not exist")]
    NoSuchString(usize),

    #[error(transparent)]
    Compile(#[from] ScriptCompileError),
}

pub type Result<T> = std::result::Result<T, RomError>;

/// Reads a little-endian value of `width` bytes (at most 4).
pub(crate) fn read_le(buf: &[u8], pos: usize, width: usize) -> Option<usize> {
    let bytes = buf.get(pos..pos + width)?;
    Some(
        bytes
            .iter()
            .rev()
            .fold(0usize, |acc, &b| (acc << 8) | b as usize),
    )
}

pub(crate) fn write_le(buf: &mut [u8], pos: usize, width: usize, value: usize) {
    for (i, b) in buf[pos..pos + width].iter_mut().enumerate() {
        *b = (value >> (8 * i)) as u8;
    }
}
