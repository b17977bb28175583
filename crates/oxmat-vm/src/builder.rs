//! Label-based emission of compiled units.
//!
//! `UnitBuilder` is the low-level assembler the compiler (and the tests)
//! drive: it manages the constant and name pools, resolves forward jump
//! references, tracks unwind regions and source locations, and finishes
//! into a `CompiledUnit`.

use oxmat_builtins::Value;

use crate::opcodes::{Op, Operand};
use crate::unit::{
    ArgNameEntry, CompiledUnit, LocEntry, NestedClosure, PersistentSlot, RegionKind, UnwindData,
    UnwindRegion, ANON_MARKER, HEADER_SIZE,
};

/// A jump target. Created with `label`, placed with `bind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

/// One operand value for `emit`. `L` operands patch to the label's code
/// offset; `C` is an ASCII selector kind.
#[derive(Debug, Clone, Copy)]
pub enum A {
    U(u32),
    L(Label),
    C(char),
}

#[derive(Debug)]
struct ForwardRef {
    /// Offset of the 16-bit placeholder in the code stream.
    at: usize,
    label: Label,
}

#[derive(Debug)]
struct PendingRegion {
    kind: RegionKind,
    start: Label,
    end: Label,
    target: Option<Label>,
    stack_depth: usize,
}

#[derive(Debug)]
pub struct UnitBuilder {
    name: String,
    file: String,
    code: Vec<u8>,
    data: Vec<Value>,
    names: Vec<String>,
    n_returns: i8,
    n_args: i8,
    labels: Vec<Option<usize>>,
    forwards: Vec<ForwardRef>,
    regions: Vec<PendingRegion>,
    loc_marks: Vec<(usize, u32, u32)>,
    arg_name_marks: Vec<(usize, Vec<String>)>,
    persistents: Vec<PersistentSlot>,
    nested: Vec<NestedClosure>,
}

impl UnitBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        UnitBuilder {
            file: String::new(),
            code: vec![0; HEADER_SIZE],
            data: vec![
                Value::Str(name.clone()),
                Value::Str("function".into()),
                Value::Str(name.clone()),
            ],
            names: Vec::new(),
            n_returns: 1,
            n_args: 0,
            labels: Vec::new(),
            forwards: Vec::new(),
            regions: Vec::new(),
            loc_marks: Vec::new(),
            arg_name_marks: Vec::new(),
            persistents: Vec::new(),
            nested: Vec::new(),
            name,
        }
    }

    pub fn set_kind(&mut self, kind: &str) {
        self.data[1] = Value::Str(kind.to_string());
        if kind == "anonymous" {
            self.n_returns = ANON_MARKER;
        }
    }

    pub fn set_file(&mut self, file: &str) {
        self.file = file.to_string();
    }

    /// Raw header values: negative `n_returns` means varargout (`-128`
    /// anonymous), negative `n_args` means varargin. `n_locals` is derived
    /// from the declared slots.
    pub fn set_frame(&mut self, n_returns: i8, n_args: i8) {
        self.n_returns = n_returns;
        self.n_args = n_args;
    }

    // -------- pools --------

    /// Declare the next local slot. Slot 0 must be `%nargout`; declaring
    /// it first is on the caller, the way the compiler lays out frames.
    pub fn declare_slot(&mut self, name: &str) -> u16 {
        self.names.push(name.to_string());
        (self.names.len() - 1) as u16
    }

    pub fn n_slots(&self) -> usize {
        self.names.len()
    }

    /// Intern a literal into the data pool and return its index.
    pub fn const_idx(&mut self, v: Value) -> usize {
        // Dedup the simple literals; composite values always append.
        if let Value::Num(n) = &v {
            for (i, existing) in self.data.iter().enumerate().skip(3) {
                if let Value::Num(e) = existing {
                    if e.to_bits() == n.to_bits() {
                        return i;
                    }
                }
            }
        }
        if let Value::Str(s) = &v {
            for (i, existing) in self.data.iter().enumerate().skip(3) {
                if let Value::Str(e) = existing {
                    if e == s {
                        return i;
                    }
                }
            }
        }
        self.data.push(v);
        self.data.len() - 1
    }

    // -------- labels --------

    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    pub fn bind(&mut self, label: Label) {
        assert!(self.labels[label.0].is_none(), "label bound twice");
        self.labels[label.0] = Some(self.code.len());
    }

    pub fn here(&self) -> usize {
        self.code.len()
    }

    // -------- emission --------

    fn push_u16(&mut self, v: u16) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    fn push_u32(&mut self, v: u32) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    /// Emit an opcode with operands matching its descriptor. Slot
    /// operands over 255 get a `Wide` prefix automatically.
    pub fn emit(&mut self, op: Op, args: &[A]) -> Result<(), String> {
        let descr = op.operands();
        if descr.contains(&Operand::Custom) {
            return Err(format!("{} needs a dedicated emitter", op.name()));
        }
        if descr.len() != args.len() {
            return Err(format!(
                "{} takes {} operands, got {}",
                op.name(),
                descr.len(),
                args.len()
            ));
        }
        let needs_wide = descr.iter().zip(args).any(|(d, a)| {
            matches!(d, Operand::Slot) && matches!(a, A::U(v) if *v > 0xff)
        });
        if needs_wide {
            self.code.push(Op::Wide as u8);
        }
        self.code.push(op as u8);
        let mut wide_left = needs_wide;
        for (d, a) in descr.iter().zip(args) {
            match (d, a) {
                (Operand::Char, A::U(v)) => {
                    if *v > 0xff {
                        return Err(format!("{}: byte operand {v} out of range", op.name()));
                    }
                    self.code.push(*v as u8);
                }
                (Operand::CharAsChar, A::C(c)) => self.code.push(*c as u8),
                (Operand::Short, A::U(v)) => {
                    if *v > 0xffff {
                        return Err(format!("{}: short operand {v} out of range", op.name()));
                    }
                    self.push_u16(*v as u16);
                }
                (Operand::Short, A::L(l)) => {
                    self.forwards.push(ForwardRef { at: self.code.len(), label: *l });
                    self.push_u16(0);
                }
                (Operand::Int, A::U(v)) => self.push_u32(*v),
                (Operand::Slot, A::U(v)) => {
                    if wide_left {
                        self.push_u16(*v as u16);
                        wide_left = false;
                    } else {
                        self.code.push(*v as u8);
                    }
                }
                (Operand::WSlot, A::U(v)) => self.push_u16(*v as u16),
                (d, a) => {
                    return Err(format!(
                        "{}: operand mismatch {d:?} vs {a:?}",
                        op.name()
                    ))
                }
            }
        }
        Ok(())
    }

    /// `LOAD_CST`-family shorthand: pick the near or far form by index.
    pub fn load_const(&mut self, v: Value) -> Result<(), String> {
        let idx = self.const_idx(v);
        if idx <= 0xff {
            self.emit(Op::LoadCst, &[A::U(idx as u32)])
        } else {
            self.emit(Op::LoadFarCst, &[A::U(idx as u32)])
        }
    }

    // -------- custom-tail emitters --------

    pub fn emit_assign_n(&mut self, slots: &[u16]) -> Result<(), String> {
        if slots.len() > 0xff {
            return Err("ASSIGNN: too many targets".to_string());
        }
        self.code.push(Op::AssignN as u8);
        self.code.push(slots.len() as u8);
        for &s in slots {
            self.push_u16(s);
        }
        Ok(())
    }

    pub fn emit_global_init(
        &mut self,
        persistent: bool,
        slot: u16,
        aux_slot: u16,
        after: Option<Label>,
    ) -> Result<(), String> {
        self.code.push(Op::GlobalInit as u8);
        self.code.push(if persistent { 1 } else { 0 });
        self.push_u16(slot);
        self.push_u16(aux_slot);
        match after {
            Some(l) => {
                self.code.push(1);
                self.forwards.push(ForwardRef { at: self.code.len(), label: l });
                self.push_u16(0);
            }
            None => self.code.push(0),
        }
        Ok(())
    }

    pub fn emit_set_ignore_outputs(&mut self, n_total: u8, ignored: &[u8]) -> Result<(), String> {
        self.code.push(Op::SetIgnoreOutputs as u8);
        self.code.push(ignored.len() as u8);
        self.code.push(n_total);
        self.code.extend_from_slice(ignored);
        Ok(())
    }

    pub fn emit_clear_ignore_outputs(&mut self, slots: &[u16]) -> Result<(), String> {
        self.code.push(Op::ClearIgnoreOutputs as u8);
        self.code.push(slots.len() as u8);
        for &s in slots {
            self.push_u16(s);
        }
        Ok(())
    }

    /// `END_X_N` nesting entries: `(is_obj, idx, n_idx, slot)`.
    pub fn emit_end_x_n(&mut self, entries: &[(u8, u8, u8, u16)]) -> Result<(), String> {
        self.code.push(Op::EndXN as u8);
        self.code.push(entries.len() as u8);
        for &(is_obj, idx, n_idx, slot) in entries {
            self.code.push(is_obj);
            self.code.push(idx);
            self.code.push(n_idx);
            self.push_u16(slot);
        }
        Ok(())
    }

    /// Uneven matrix: per-row element counts, rows and columns encoded as
    /// 32-bit ints in the code stream.
    pub fn emit_matrix_uneven(&mut self, row_lengths: &[u32]) -> Result<(), String> {
        self.code.push(Op::MatrixUneven as u8);
        self.code.push(2); // type 2: explicit row lengths
        self.push_u32(row_lengths.len() as u32);
        for &len in row_lengths {
            self.push_u32(len);
        }
        Ok(())
    }

    /// Chained sub-assignment: `levels` are `(nargs, kind)` pairs from the
    /// leftmost link outwards.
    pub fn emit_subassign_chained(
        &mut self,
        slot: u16,
        compound_op: Option<u8>,
        levels: &[(u8, char)],
    ) -> Result<(), String> {
        if slot > 0xff {
            self.code.push(Op::Wide as u8);
        }
        self.code.push(Op::SubassignChained as u8);
        if slot > 0xff {
            self.push_u16(slot);
        } else {
            self.code.push(slot as u8);
        }
        self.code.push(compound_op.map(|c| c + 1).unwrap_or(0));
        self.code.push(levels.len() as u8);
        for &(nargs, kind) in levels {
            self.code.push(nargs);
            self.code.push(kind as u8);
        }
        Ok(())
    }

    // -------- unwind metadata --------

    pub fn region(
        &mut self,
        kind: RegionKind,
        start: Label,
        end: Label,
        target: Option<Label>,
        stack_depth: usize,
    ) {
        self.regions.push(PendingRegion { kind, start, end, target, stack_depth });
    }

    /// Mark the source location of everything emitted from here until the
    /// next mark.
    pub fn loc(&mut self, line: u32, col: u32) {
        self.loc_marks.push((self.code.len(), line, col));
    }

    pub fn arg_names(&mut self, names: &[&str]) {
        self.arg_name_marks
            .push((self.code.len(), names.iter().map(|s| s.to_string()).collect()));
    }

    pub fn persistent_slot(&mut self, slot: u16, offset: usize) {
        self.persistents.push(PersistentSlot { slot, offset });
    }

    pub fn nested_closure(&mut self, depth: u32, parent_slot: u16, nested_slot: u16) {
        self.nested.push(NestedClosure { depth, parent_slot, nested_slot });
    }

    // -------- finish --------

    fn resolve(&self, label: Label) -> Result<usize, String> {
        self.labels[label.0].ok_or_else(|| format!("unbound label {:?}", label))
    }

    pub fn finish(mut self) -> Result<CompiledUnit, String> {
        let n_locals = self.names.len();
        if n_locals > u16::MAX as usize {
            return Err("too many local slots".to_string());
        }
        if n_locals < self.n_returns.unsigned_abs() as usize && self.n_returns != ANON_MARKER {
            return Err("frame smaller than its return count".to_string());
        }
        self.code[0] = self.n_returns as u8;
        self.code[1] = self.n_args as u8;
        self.code[2] = (n_locals & 0xff) as u8;
        self.code[3] = (n_locals >> 8) as u8;

        for fr in &self.forwards {
            let target = self.labels[fr.label.0]
                .ok_or_else(|| format!("unbound label {:?}", fr.label))?;
            if target > u16::MAX as usize {
                return Err("jump target out of 16-bit range".to_string());
            }
            self.code[fr.at..fr.at + 2].copy_from_slice(&(target as u16).to_le_bytes());
        }

        let mut unwind = UnwindData {
            name: self.name.clone(),
            file: self.file.clone(),
            ..UnwindData::default()
        };
        for pr in &self.regions {
            let start = self.resolve(pr.start)?;
            let end = self.resolve(pr.end)?;
            let target = match pr.target {
                Some(l) => self.resolve(l)?,
                None => 0,
            };
            unwind.regions.push(UnwindRegion {
                kind: pr.kind,
                start,
                end,
                target,
                stack_depth: pr.stack_depth,
            });
        }
        for (i, &(start, line, col)) in self.loc_marks.iter().enumerate() {
            let end = self
                .loc_marks
                .get(i + 1)
                .map(|&(s, _, _)| s)
                .unwrap_or(self.code.len());
            unwind.locs.push(LocEntry { ip_start: start, ip_end: end, line, col });
        }
        for (i, (start, names)) in self.arg_name_marks.iter().enumerate() {
            let end = self
                .arg_name_marks
                .get(i + 1)
                .map(|(s, _)| *s)
                .unwrap_or(self.code.len());
            unwind.arg_names.push(ArgNameEntry {
                ip_start: *start,
                ip_end: end,
                arg_names: names.clone(),
            });
        }
        unwind.persistents = self.persistents;
        unwind.nested = self.nested;

        CompiledUnit::new(self.code, self.data, self.names, unwind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_jump_patches() {
        let mut b = UnitBuilder::new("t");
        b.declare_slot("%nargout");
        b.set_frame(1, 0);
        let after = b.label();
        b.emit(Op::Jmp, &[A::L(after)]).unwrap();
        b.emit(Op::PushNil, &[]).unwrap();
        b.bind(after);
        b.emit(Op::Ret, &[]).unwrap();
        let u = b.finish().unwrap();
        // JMP at offset 4, target = offset of RET (4 + 3 + 1 = 8).
        assert_eq!(u.byte(4), Op::Jmp as u8);
        assert_eq!(u.u16_at(5), 8);
    }

    #[test]
    fn wide_prefix_for_big_slots() {
        let mut b = UnitBuilder::new("t");
        for i in 0..300 {
            b.declare_slot(&format!("s{i}"));
        }
        b.set_frame(1, 0);
        b.emit(Op::Assign, &[A::U(299)]).unwrap();
        b.emit(Op::Ret, &[]).unwrap();
        let u = b.finish().unwrap();
        assert_eq!(u.byte(4), Op::Wide as u8);
        assert_eq!(u.byte(5), Op::Assign as u8);
        assert_eq!(u.u16_at(6), 299);
    }

    #[test]
    fn constants_dedup() {
        let mut b = UnitBuilder::new("t");
        let i1 = b.const_idx(Value::Num(3.5));
        let i2 = b.const_idx(Value::Num(3.5));
        let i3 = b.const_idx(Value::Num(4.5));
        assert_eq!(i1, i2);
        assert_ne!(i1, i3);
    }

    #[test]
    fn unbound_label_is_an_error() {
        let mut b = UnitBuilder::new("t");
        b.declare_slot("%nargout");
        b.set_frame(1, 0);
        let l = b.label();
        b.emit(Op::Jmp, &[A::L(l)]).unwrap();
        assert!(b.finish().is_err());
    }

    #[test]
    fn operand_count_validated() {
        let mut b = UnitBuilder::new("t");
        assert!(b.emit(Op::Assign, &[]).is_err());
        assert!(b.emit(Op::AssignN, &[A::U(1)]).is_err());
    }
}
