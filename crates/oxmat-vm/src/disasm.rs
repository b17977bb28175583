//! Bytecode disassembler.
//!
//! Produces `(offset, text)` rows, one per decoded instruction, skipping
//! the four header bytes. Re-scanning the code stream must reproduce the
//! offsets exactly; the decoder here and the VM's operand fetchers agree
//! byte for byte.

use crate::opcodes::{Op, Operand};
use crate::unit::{CompiledUnit, HEADER_SIZE};

struct Cursor<'a> {
    unit: &'a CompiledUnit,
    p: usize,
}

impl<'a> Cursor<'a> {
    fn u8(&mut self) -> Result<u8, String> {
        if self.p >= self.unit.code_len() {
            return Err("invalid bytecode: truncated operand".to_string());
        }
        let b = self.unit.byte(self.p);
        self.p += 1;
        Ok(b)
    }

    fn u16(&mut self) -> Result<u16, String> {
        let b0 = self.u8()?;
        let b1 = self.u8()?;
        Ok(u16::from_le_bytes([b0, b1]))
    }

    fn u32(&mut self) -> Result<u32, String> {
        let b0 = self.u8()?;
        let b1 = self.u8()?;
        let b2 = self.u8()?;
        let b3 = self.u8()?;
        Ok(u32::from_le_bytes([b0, b1, b2, b3]))
    }
}

fn push_slot_name(unit: &CompiledUnit, slot: usize, ids: &mut Vec<String>) {
    ids.push(
        unit.names
            .get(slot)
            .cloned()
            .unwrap_or_else(|| "INVALID SLOT".to_string()),
    );
}

/// Decode the whole code stream into `(offset, text)` pairs.
pub fn disassemble(unit: &CompiledUnit) -> Result<Vec<(usize, String)>, String> {
    let mut rows = Vec::new();
    let mut cur = Cursor { unit, p: HEADER_SIZE };
    let mut wide_active = false;

    while cur.p < unit.code_len() {
        let offset = cur.p;
        let byte = cur.u8()?;
        let op = Op::from_u8(byte).ok_or_else(|| format!("unknown op: {byte}"))?;
        let mut text = op.name().to_string();
        let mut ids: Vec<String> = Vec::new();

        if op == Op::Wide {
            rows.push((offset, text));
            wide_active = true;
            continue;
        }

        match op {
            // Variable-length tails first.
            Op::AssignN => {
                let n = cur.u8()?;
                text.push_str(&format!(" {n}"));
                for _ in 0..n {
                    let s = cur.u16()?;
                    text.push_str(&format!(" {s}"));
                    push_slot_name(unit, s as usize, &mut ids);
                }
            }
            Op::GlobalInit => {
                let kind = cur.u8()?;
                text.push_str(if kind == 0 { " 'GLOBAL'" } else { " 'PERSISTENT'" });
                let slot = cur.u16()?;
                text.push_str(&format!(" {slot}"));
                push_slot_name(unit, slot as usize, &mut ids);
                let aux = cur.u16()?;
                text.push_str(&format!(" {aux}"));
                push_slot_name(unit, aux as usize, &mut ids);
                text.push_str(" HAS-TARGET");
                let has_target = cur.u8()?;
                text.push_str(&format!(" {has_target}"));
                if has_target != 0 {
                    text.push_str(" AFTER INIT");
                    let after = cur.u16()?;
                    text.push_str(&format!(" {after}"));
                }
            }
            Op::SetIgnoreOutputs => {
                let n_ignored = cur.u8()?;
                text.push_str(&format!(" {n_ignored}"));
                let n_total = cur.u8()?;
                text.push_str(&format!(" {n_total}"));
                for _ in 0..n_ignored {
                    let idx = cur.u8()?;
                    text.push_str(&format!(" {idx}"));
                }
            }
            Op::ClearIgnoreOutputs => {
                let n = cur.u8()?;
                text.push_str(&format!(" {n}"));
                for _ in 0..n {
                    let s = cur.u16()?;
                    text.push_str(&format!(" {s}"));
                    push_slot_name(unit, s as usize, &mut ids);
                }
            }
            Op::EndXN => {
                let n = cur.u8()?;
                text.push_str(&format!(" {n}"));
                for _ in 0..n {
                    for _ in 0..3 {
                        let b = cur.u8()?;
                        text.push_str(&format!(" {b}"));
                    }
                    let s = cur.u16()?;
                    text.push_str(&format!(" {s}"));
                    push_slot_name(unit, s as usize, &mut ids);
                }
            }
            Op::MatrixUneven => {
                text.push_str(" TYPE");
                let ty = cur.u8()?;
                text.push_str(&format!(" {ty}"));
                if ty == 1 {
                    text.push_str(" ROWS");
                    let r = cur.u32()?;
                    text.push_str(&format!(" {r}"));
                    text.push_str(" COLS");
                    let c = cur.u32()?;
                    text.push_str(&format!(" {c}"));
                } else {
                    text.push_str(" ROWS");
                    let rows = cur.u32()?;
                    text.push_str(&format!(" {rows}"));
                    text.push_str(" COLS");
                    for _ in 0..rows {
                        let c = cur.u32()?;
                        text.push_str(&format!(" {c}"));
                    }
                }
            }
            Op::SubassignChained => {
                let slot = if wide_active { cur.u16()? } else { cur.u8()? as u16 };
                text.push_str(&format!(" {slot}"));
                push_slot_name(unit, slot as usize, &mut ids);
                let opbyte = cur.u8()?;
                text.push_str(&format!(" {opbyte}"));
                let n_chained = cur.u8()?;
                text.push_str(&format!(" {n_chained}"));
                for _ in 0..n_chained {
                    let nargs = cur.u8()?;
                    text.push_str(&format!(" {nargs}"));
                    let kind = cur.u8()?;
                    text.push_str(&format!(" '{}'", kind as char));
                }
            }
            _ => {
                // Fixed operand list from the table.
                let mut wide_left = wide_active;
                for operand in op.operands() {
                    match operand {
                        Operand::Char => {
                            let b = cur.u8()?;
                            text.push_str(&format!(" {b}"));
                        }
                        Operand::CharAsChar => {
                            let b = cur.u8()?;
                            text.push_str(&format!(" '{}'", b as char));
                        }
                        Operand::Short => {
                            let s = cur.u16()?;
                            text.push_str(&format!(" {s}"));
                        }
                        Operand::Int => {
                            let i = cur.u32()?;
                            text.push_str(&format!(" {i}"));
                        }
                        Operand::Slot => {
                            let s = if wide_left {
                                wide_left = false;
                                cur.u16()?
                            } else {
                                cur.u8()? as u16
                            };
                            text.push_str(&format!(" {s}"));
                            push_slot_name(unit, s as usize, &mut ids);
                        }
                        Operand::WSlot => {
                            let s = cur.u16()?;
                            text.push_str(&format!(" {s}"));
                            push_slot_name(unit, s as usize, &mut ids);
                        }
                        Operand::Custom => unreachable!("custom ops handled above"),
                    }
                }
            }
        }

        wide_active = false;
        if !ids.is_empty() {
            text.push_str(" #");
            for id in ids {
                text.push(' ');
                text.push_str(&id);
            }
        }
        rows.push((offset, text));
    }

    Ok(rows)
}
