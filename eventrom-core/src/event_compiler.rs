use thiserror::Error;

use crate::opcodes::{command_size, lookup_mnemonic, opcode_def, CallMode, EventCommand};

/// Errors that can occur while assembling event-script mnemonics.
#[derive(Debug, Error)]
pub enum ScriptCompileError {
    #[error("unknown opcode '{opcode}' on line {line}")]
    UnknownOpcode { line: usize, opcode: String },

    #[error("wrong argument count for {opcode} on line {line}: expected {expected}, got {got}")]
    WrongArgCount {
        line: usize,
        opcode: String,
        expected: usize,
        got: usize,
    },

    #[error("failed to parse integer '{token}' on line {line}")]
    ParseInt {
        line: usize,
        token: String,
        #[source]
        source: std::num::ParseIntError,
    },

    #[error("value '{token}' on line {line} is out of range for {kind}")]
    ValueOutOfRange {
        line: usize,
        token: String,
        kind: &'static str,
    },

    #[error("invalid {opcode} on line {line}: {reason}")]
    InvalidCommand {
        line: usize,
        opcode: String,
        reason: String,
    },
}

fn parse_int(line: usize, token: &str) -> Result<u32, ScriptCompileError> {
    let t = token.trim_end_matches(',');
    let res = if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        t.parse::<u32>()
    };

    res.map_err(|e| ScriptCompileError::ParseInt {
        line,
        token: t.to_string(),
        source: e,
    })
}

fn parse_bounded(
    line: usize,
    token: &str,
    max: u32,
    kind: &'static str,
) -> Result<u32, ScriptCompileError> {
    let value = parse_int(line, token)?;
    if value > max {
        return Err(ScriptCompileError::ValueOutOfRange {
            line,
            token: token.to_string(),
            kind,
        });
    }
    Ok(value)
}

fn parse_u8(line: usize, token: &str) -> Result<u8, ScriptCompileError> {
    Ok(parse_bounded(line, token, 0xFF, "byte")? as u8)
}

fn expect_args(
    line: usize,
    opcode: &str,
    args: &[&str],
    expected: usize,
) -> Result<(), ScriptCompileError> {
    if args.len() != expected {
        return Err(ScriptCompileError::WrongArgCount {
            line,
            opcode: opcode.to_string(),
            expected,
            got: args.len(),
        });
    }
    Ok(())
}

fn invalid(line: usize, opcode: &str, err: crate::RomError) -> ScriptCompileError {
    ScriptCompileError::InvalidCommand {
        line,
        opcode: opcode.to_string(),
        reason: err.to_string(),
    }
}

/// Assemble event-script mnemonics into commands.
///
/// One command per line; mnemonics are case-insensitive and numbers are
/// decimal or 0x-prefixed hex. A few commands take logical operands:
///
/// - `CallObjFunc obj func priority` (also `CallObjFuncSync`, `CallObjFuncHalt`)
/// - `ShowObject obj` / `HideObject obj` / `RemoveObject obj`
/// - `StringIndex rom_address`
/// - `MemCopy ram_address byte...`
///
/// Every other mnemonic, including the `OpXX` form, is followed by its raw
/// argument bytes. Blank lines and lines starting with `#` or `//` are ignored.
pub fn compile_commands_from_str(src: &str) -> Result<Vec<EventCommand>, ScriptCompileError> {
    let mut out = Vec::new();

    for (idx, raw_line) in src.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
            continue;
        }

        let mut parts = line.split_whitespace();
        let op_tok = match parts.next() {
            Some(tok) => tok,
            None => continue,
        };
        let args: Vec<&str> = parts.collect();
        let mnemonic = op_tok.to_ascii_uppercase();

        let cmd = match mnemonic.as_str() {
            "CALLOBJFUNC" | "CALLOBJFUNCSYNC" | "CALLOBJFUNCHALT" => {
                expect_args(line_no, op_tok, &args, 3)?;
                let obj = parse_bounded(line_no, args[0], 0x7F, "object (0-127)")?;
                let func = parse_bounded(line_no, args[1], 0x0F, "function (0-15)")?;
                let priority = parse_bounded(line_no, args[2], 0x07, "priority (0-7)")?;
                let mode = match mnemonic.as_str() {
                    "CALLOBJFUNC" => CallMode::Continue,
                    "CALLOBJFUNCSYNC" => CallMode::Sync,
                    _ => CallMode::Halt,
                };
                EventCommand::call_obj_function(obj as usize, func as usize, priority as u8, mode)
                    .map_err(|e| invalid(line_no, op_tok, e))?
            }

            "SHOWOBJECT" | "HIDEOBJECT" | "REMOVEOBJECT" => {
                expect_args(line_no, op_tok, &args, 1)?;
                let obj = parse_bounded(line_no, args[0], 0x7F, "object (0-127)")? as usize;
                let built = match mnemonic.as_str() {
                    "SHOWOBJECT" => EventCommand::set_object_visibility(obj, true),
                    "HIDEOBJECT" => EventCommand::set_object_visibility(obj, false),
                    _ => EventCommand::remove_object(obj),
                };
                built.map_err(|e| invalid(line_no, op_tok, e))?
            }

            "STRINGINDEX" => {
                expect_args(line_no, op_tok, &args, 1)?;
                let addr = parse_bounded(line_no, args[0], 0xFF_FFFF, "24-bit address")?;
                EventCommand::string_index(addr as usize).map_err(|e| invalid(line_no, op_tok, e))?
            }

            "MEMCOPY" => {
                if args.is_empty() {
                    return Err(ScriptCompileError::WrongArgCount {
                        line: line_no,
                        opcode: op_tok.to_string(),
                        expected: 1,
                        got: 0,
                    });
                }
                let addr = parse_bounded(line_no, args[0], 0xFF_FFFF, "24-bit address")?;
                let data = args[1..]
                    .iter()
                    .map(|t| parse_u8(line_no, t))
                    .collect::<Result<Vec<u8>, _>>()?;
                EventCommand::mem_copy(addr as usize, &data)
                    .map_err(|e| invalid(line_no, op_tok, e))?
            }

            _ => {
                let opcode = lookup_mnemonic(op_tok).ok_or_else(|| {
                    ScriptCompileError::UnknownOpcode {
                        line: line_no,
                        opcode: op_tok.to_string(),
                    }
                })?;
                let bytes = args
                    .iter()
                    .map(|t| parse_u8(line_no, t))
                    .collect::<Result<Vec<u8>, _>>()?;

                let mut encoded = Vec::with_capacity(bytes.len() + 1);
                encoded.push(opcode);
                encoded.extend_from_slice(&bytes);
                let expected = match command_size(&encoded, 0) {
                    Ok(size) => size,
                    Err(_) => opcode_def(opcode).size as usize,
                };
                expect_args(line_no, op_tok, &args, expected - 1)?;
                EventCommand::new(opcode, bytes).map_err(|e| invalid(line_no, op_tok, e))?
            }
        };

        out.push(cmd);
    }

    Ok(out)
}

/// Assemble event-script mnemonics straight into instruction bytes.
pub fn compile_script_from_str(src: &str) -> Result<Vec<u8>, ScriptCompileError> {
    Ok(compile_commands_from_str(src)?
        .iter()
        .flat_map(EventCommand::to_bytes)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_call_obj_func() {
        let bytes = compile_script_from_str("CallObjFuncHalt 1 3 4").unwrap();
        assert_eq!(bytes, vec![0x04, 0x02, 0x43]);
    }

    #[test]
    fn compiles_generic_mnemonics() {
        let src = "
            # intro
            Textbox 2
            JumpForward 0x05
            IfLocalByte 1 2 3 4
            Op3A
            return
        ";
        let bytes = compile_script_from_str(src).unwrap();
        assert_eq!(
            bytes,
            vec![0xBB, 0x02, 0x10, 0x05, 0x12, 1, 2, 3, 4, 0x3A, 0x00]
        );
    }

    #[test]
    fn compiles_visibility_and_strings() {
        let src = "HideObject 3\nStringIndex 0xC60040\nEnd";
        let bytes = compile_script_from_str(src).unwrap();
        assert_eq!(bytes, vec![0x7D, 0x06, 0xB8, 0x40, 0x00, 0xC6, 0xB2]);
    }

    #[test]
    fn compiles_mem_copy() {
        let bytes = compile_script_from_str("MemCopy 0x7E2000 1 2").unwrap();
        assert_eq!(bytes, vec![0x4E, 0x00, 0x20, 0x7E, 4, 0, 1, 2]);
    }

    #[test]
    fn compiles_variable_display_effect() {
        let bytes = compile_script_from_str("DisplayEffect 0x21 7 8").unwrap();
        assert_eq!(bytes, vec![0x88, 0x21, 7, 8]);
    }

    #[test]
    fn reports_line_numbers() {
        let err = compile_script_from_str("Return\nFrobnicate 1").unwrap_err();
        assert!(matches!(err, ScriptCompileError::UnknownOpcode { line: 2, .. }));

        let err = compile_script_from_str("Textbox").unwrap_err();
        assert!(matches!(
            err,
            ScriptCompileError::WrongArgCount {
                line: 1,
                expected: 1,
                got: 0,
                ..
            }
        ));

        let err = compile_script_from_str("CallObjFunc 1 16 0").unwrap_err();
        assert!(matches!(err, ScriptCompileError::ValueOutOfRange { line: 1, .. }));

        let err = compile_script_from_str("Textbox 0x100").unwrap_err();
        assert!(matches!(err, ScriptCompileError::ValueOutOfRange { .. }));

        let err = compile_script_from_str("Textbox zz").unwrap_err();
        assert!(matches!(err, ScriptCompileError::ParseInt { .. }));
    }
}
