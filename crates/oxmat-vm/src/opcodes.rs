//! The instruction set.
//!
//! Opcodes are one byte. Most take a one-byte first operand (`arg0`); the
//! remaining immediates are described by `Op::operands` and read straight
//! from the code stream. The `Wide` prefix widens the *first* slot operand
//! of the following opcode from one byte to two.

/// Immediate operand kinds, as consumed by the decoder, the builder and
/// the disassembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// One byte literal.
    Char,
    /// One byte printed as an ASCII char (selector kinds like `(`).
    CharAsChar,
    /// 16-bit little-endian, mostly jump targets.
    Short,
    /// 32-bit little-endian.
    Int,
    /// Slot reference: one byte, or two with a preceding `Wide`.
    Slot,
    /// Slot reference that is always two bytes.
    WSlot,
    /// Variable-length tail; the disassembler decodes it per opcode.
    Custom,
}

macro_rules! opcodes {
    ($($variant:ident = $num:literal, $name:literal, [$($operand:ident),*];)*) => {
        /// One-byte opcodes, numbered by their position in the dispatch
        /// table.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Op {
            $($variant = $num,)*
        }

        impl Op {
            pub fn from_u8(b: u8) -> Option<Op> {
                match b {
                    $($num => Some(Op::$variant),)*
                    _ => None,
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(Op::$variant => $name,)*
                }
            }

            pub fn operands(self) -> &'static [Operand] {
                match self {
                    $(Op::$variant => &[$(Operand::$operand),*],)*
                }
            }
        }
    };
}

opcodes! {
    Pop = 0, "POP", [];
    Dup = 1, "DUP", [];
    LoadCst = 2, "LOAD_CST", [Char];
    Mul = 3, "MUL", [];
    Div = 4, "DIV", [];
    Add = 5, "ADD", [];
    Sub = 6, "SUB", [];
    Ret = 7, "RET", [];
    Assign = 8, "ASSIGN", [Slot];
    JmpIf = 9, "JMP_IF", [Short];
    Jmp = 10, "JMP", [Short];
    JmpIfn = 11, "JMP_IFN", [Short];
    PushSlotNargout0 = 12, "PUSH_SLOT_NARGOUT0", [Slot];
    Le = 13, "LE", [];
    LeEq = 14, "LE_EQ", [];
    Gr = 15, "GR", [];
    GrEq = 16, "GR_EQ", [];
    Eq = 17, "EQ", [];
    Neq = 18, "NEQ", [];
    IndexIdNargout0 = 19, "INDEX_ID_NARGOUT0", [Slot, Char];
    PushSlotIndexed = 20, "PUSH_SLOT_INDEXED", [Slot];
    Pow = 21, "POW", [];
    Ldiv = 22, "LDIV", [];
    ElMul = 23, "EL_MUL", [];
    ElDiv = 24, "EL_DIV", [];
    ElPow = 25, "EL_POW", [];
    ElAnd = 26, "EL_AND", [];
    ElOr = 27, "EL_OR", [];
    ElLdiv = 28, "EL_LDIV", [];
    Not = 29, "NOT", [];
    UAdd = 30, "UADD", [];
    USub = 31, "USUB", [];
    Trans = 32, "TRANS", [];
    Herm = 33, "HERM", [];
    IncrIdPrefix = 34, "INCR_ID_PREFIX", [Slot];
    DecrIdPrefix = 35, "DECR_ID_PREFIX", [Slot];
    IncrIdPostfix = 36, "INCR_ID_POSTFIX", [Slot];
    DecrIdPostfix = 37, "DECR_ID_POSTFIX", [Slot];
    ForSetup = 38, "FOR_SETUP", [];
    ForCond = 39, "FOR_COND", [Slot, Short];
    PopNInts = 40, "POP_N_INTS", [Char];
    PushSlotNargout1 = 41, "PUSH_SLOT_NARGOUT1", [Slot];
    IndexIdNargout1 = 42, "INDEX_ID_NARGOUT1", [Slot, Char];
    PushFcnHandle = 43, "PUSH_FCN_HANDLE", [Slot];
    Colon3 = 44, "COLON3", [];
    Colon2 = 45, "COLON2", [];
    Colon3Cmd = 46, "COLON3_CMD", [];
    Colon2Cmd = 47, "COLON2_CMD", [];
    PushTrue = 48, "PUSH_TRUE", [];
    PushFalse = 49, "PUSH_FALSE", [];
    UnaryTrue = 50, "UNARY_TRUE", [];
    IndexIdN = 51, "INDEX_IDN", [Slot, Char, Char];
    AssignN = 52, "ASSIGNN", [Custom];
    PushSlotNargoutN = 53, "PUSH_SLOT_NARGOUTN", [Slot, Char];
    SubassignId = 54, "SUBASSIGN_ID", [Slot, Char];
    EndId = 55, "END_ID", [Slot, Char, Char];
    Matrix = 56, "MATRIX", [Char, Char];
    TransMul = 57, "TRANS_MUL", [];
    MulTrans = 58, "MUL_TRANS", [];
    HermMul = 59, "HERM_MUL", [];
    MulHerm = 60, "MUL_HERM", [];
    TransLdiv = 61, "TRANS_LDIV", [];
    HermLdiv = 62, "HERM_LDIV", [];
    Wordcmd = 63, "WORDCMD", [Slot, Char, Char];
    HandleSignals = 64, "HANDLE_SIGNALS", [];
    PushCell = 65, "PUSH_CELL", [Char, Char];
    IndexCellIdNargout0 = 66, "INDEX_CELL_ID_NARGOUT0", [Slot, Char];
    IndexCellIdNargout1 = 67, "INDEX_CELL_ID_NARGOUT1", [Slot, Char];
    IndexCellIdNargoutN = 68, "INDEX_CELL_ID_NARGOUTN", [Slot, Char, Char];
    IncrPrefix = 69, "INCR_PREFIX", [];
    Rot = 70, "ROT", [];
    GlobalInit = 71, "GLOBAL_INIT", [Custom];
    AssignCompound = 72, "ASSIGN_COMPOUND", [Slot, Char];
    JmpIfdef = 73, "JMP_IFDEF", [Short];
    JmpIfnCaseMatch = 74, "JMP_IFNCASEMATCH", [Short];
    BraindeadPrecondition = 75, "BRAINDEAD_PRECONDITION", [];
    BraindeadWarning = 76, "BRAINDEAD_WARNING", [Slot, Char];
    ForceAssign = 77, "FORCE_ASSIGN", [Slot];
    PushNil = 78, "PUSH_NIL", [];
    ThrowIfErrObj = 79, "THROW_IFERROBJ", [];
    IndexStructNargoutN = 80, "INDEX_STRUCT_NARGOUTN", [Char, WSlot, WSlot];
    SubassignStruct = 81, "SUBASSIGN_STRUCT", [Slot, WSlot];
    SubassignCellId = 82, "SUBASSIGN_CELL_ID", [Slot, Char];
    IndexObj = 83, "INDEX_OBJ", [Char, Char, WSlot, Char, Char];
    SubassignObj = 84, "SUBASSIGN_OBJ", [Char, Char];
    MatrixUneven = 85, "MATRIX_UNEVEN", [Custom];
    LoadFarCst = 86, "LOAD_FAR_CST", [Int];
    EndObj = 87, "END_OBJ", [Slot, Char, Char];
    SetIgnoreOutputs = 88, "SET_IGNORE_OUTPUTS", [Custom];
    ClearIgnoreOutputs = 89, "CLEAR_IGNORE_OUTPUTS", [Custom];
    SubassignChained = 90, "SUBASSIGN_CHAINED", [Custom];
    SetSlotToStackDepth = 91, "SET_SLOT_TO_STACK_DEPTH", [Slot];
    DupN = 92, "DUPN", [Char, Char];
    Debug = 93, "DEBUG", [];
    IndexStructCall = 94, "INDEX_STRUCT_CALL", [Char, WSlot, Char, CharAsChar];
    EndXN = 95, "END_X_N", [Custom];
    Eval = 96, "EVAL", [Char, Int];
    BindAns = 97, "BIND_ANS", [Slot];
    PushAnonFcnHandle = 98, "PUSH_ANON_FCN_HANDLE", [Int];
    ForComplexSetup = 99, "FOR_COMPLEX_SETUP", [Short];
    ForComplexCond = 100, "FOR_COMPLEX_COND", [Short, WSlot, WSlot];
    PushSlotNargout1Special = 101, "PUSH_SLOT_NARGOUT1_SPECIAL", [Slot];
    Disp = 102, "DISP", [Slot, WSlot];
    PushSlotDisp = 103, "PUSH_SLOT_DISP", [Slot, WSlot];
    LoadCstAlt2 = 104, "LOAD_CST_ALT2", [Char];
    LoadCstAlt3 = 105, "LOAD_CST_ALT3", [Char];
    LoadCstAlt4 = 106, "LOAD_CST_ALT4", [Char];
    Load2Cst = 107, "LOAD_2_CST", [Char];
    MulDbl = 108, "MUL_DBL", [];
    AddDbl = 109, "ADD_DBL", [];
    SubDbl = 110, "SUB_DBL", [];
    DivDbl = 111, "DIV_DBL", [];
    PowDbl = 112, "POW_DBL", [];
    LeDbl = 113, "LE_DBL", [];
    LeEqDbl = 114, "LE_EQ_DBL", [];
    GrDbl = 115, "GR_DBL", [];
    GrEqDbl = 116, "GR_EQ_DBL", [];
    EqDbl = 117, "EQ_DBL", [];
    NeqDbl = 118, "NEQ_DBL", [];
    IndexId1Mat1d = 119, "INDEX_ID1_MAT_1D", [Slot, Char];
    IndexId1Mat2d = 120, "INDEX_ID1_MAT_2D", [Slot, Char];
    PushPi = 121, "PUSH_PI", [Slot];
    IndexId1MathyUfun = 122, "INDEX_ID1_MATHY_UFUN", [Char, Slot, Char];
    SubassignIdMat1d = 123, "SUBASSIGN_ID_MAT_1D", [Slot, Char];
    IncrIdPrefixDbl = 124, "INCR_ID_PREFIX_DBL", [Slot];
    DecrIdPrefixDbl = 125, "DECR_ID_PREFIX_DBL", [Slot];
    IncrIdPostfixDbl = 126, "INCR_ID_POSTFIX_DBL", [Slot];
    DecrIdPostfixDbl = 127, "DECR_ID_POSTFIX_DBL", [Slot];
    PushDbl0 = 128, "PUSH_DBL_0", [];
    PushDbl1 = 129, "PUSH_DBL_1", [];
    PushDbl2 = 130, "PUSH_DBL_2", [];
    JmpIfBool = 131, "JMP_IF_BOOL", [Short];
    JmpIfnBool = 132, "JMP_IFN_BOOL", [Short];
    USubDbl = 133, "USUB_DBL", [];
    NotDbl = 134, "NOT_DBL", [];
    NotBool = 135, "NOT_BOOL", [];
    PushFoldedCst = 136, "PUSH_FOLDED_CST", [Slot, Short];
    SetFoldedCst = 137, "SET_FOLDED_CST", [Slot];
    Wide = 138, "WIDE", [];
    SubassignIdMat2d = 139, "SUBASSIGN_ID_MAT_2D", [Slot, Char];
    EnterScriptFrame = 140, "ENTER_SCRIPT_FRAME", [];
    ExitScriptFrame = 141, "EXIT_SCRIPT_FRAME", [];
    RetAnon = 142, "RET_ANON", [];
    IndexIdNx = 143, "INDEX_IDNX", [Slot, Char];
    IndexCellIdNx = 144, "INDEX_CELL_IDNX", [Slot, Char];
    PushSlotNx = 145, "PUSH_SLOT_NX", [Slot, Char];
    ExtNargout = 146, "EXT_NARGOUT", [];
    WordcmdNx = 147, "WORDCMD_NX", [Slot, Char];
    AnonMaybeSetIgnoreOutputs = 148, "ANON_MAYBE_SET_IGNORE_OUTPUTS", [];
    EnterNestedFrame = 149, "ENTER_NESTED_FRAME", [];
    InstallFunction = 150, "INSTALL_FUNCTION", [Slot, Int];
    DupMove = 151, "DUP_MOVE", [Char];
    MulCstDbl = 152, "MUL_CST_DBL", [Char, Char];
    MulCst = 153, "MUL_CST", [Char, Char];
    AddCstDbl = 154, "ADD_CST_DBL", [Char, Char];
    AddCst = 155, "ADD_CST", [Char, Char];
    DivCstDbl = 156, "DIV_CST_DBL", [Char, Char];
    DivCst = 157, "DIV_CST", [Char, Char];
    SubCstDbl = 158, "SUB_CST_DBL", [Char, Char];
    SubCst = 159, "SUB_CST", [Char, Char];
    LeCstDbl = 160, "LE_CST_DBL", [Char, Char];
    LeCst = 161, "LE_CST", [Char, Char];
    LeEqCstDbl = 162, "LE_EQ_CST_DBL", [Char, Char];
    LeEqCst = 163, "LE_EQ_CST", [Char, Char];
    GrCstDbl = 164, "GR_CST_DBL", [Char, Char];
    GrCst = 165, "GR_CST", [Char, Char];
    GrEqCstDbl = 166, "GR_EQ_CST_DBL", [Char, Char];
    GrEqCst = 167, "GR_EQ_CST", [Char, Char];
    EqCstDbl = 168, "EQ_CST_DBL", [Char, Char];
    EqCst = 169, "EQ_CST", [Char, Char];
    NeqCstDbl = 170, "NEQ_CST_DBL", [Char, Char];
    NeqCst = 171, "NEQ_CST", [Char, Char];
    PowCstDbl = 172, "POW_CST_DBL", [Char, Char];
    PowCst = 173, "POW_CST", [Char, Char];
    PushI = 174, "PUSH_I", [Slot];
    PushE = 175, "PUSH_E", [Slot];
    IndexStructSubcall = 176, "INDEX_STRUCT_SUBCALL", [Char, Char, Char, Char, CharAsChar];
    PushCellBig = 177, "PUSH_CELL_BIG", [Int, Int];
    AppendCell = 178, "APPEND_CELL", [Char];
}

pub const MAX_OPCODE: u8 = Op::AppendCell as u8;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_byte() {
        for b in 0..=MAX_OPCODE {
            let op = Op::from_u8(b).expect("gap in opcode table");
            assert_eq!(op as u8, b);
        }
        assert!(Op::from_u8(MAX_OPCODE + 1).is_none());
    }

    #[test]
    fn names_are_unique() {
        use std::collections::HashSet;
        let mut seen = HashSet::new();
        for b in 0..=MAX_OPCODE {
            let op = Op::from_u8(b).unwrap();
            assert!(seen.insert(op.name()), "duplicate name {}", op.name());
        }
    }

    #[test]
    fn specialized_forms_pair_with_generics() {
        // The inline-cache rewrites swap these opcode bytes in place, so
        // the two forms must agree on their operand layout.
        for (generic, dbl) in [
            (Op::Mul, Op::MulDbl),
            (Op::Add, Op::AddDbl),
            (Op::Sub, Op::SubDbl),
            (Op::Div, Op::DivDbl),
            (Op::Pow, Op::PowDbl),
            (Op::Le, Op::LeDbl),
            (Op::LeEq, Op::LeEqDbl),
            (Op::Gr, Op::GrDbl),
            (Op::GrEq, Op::GrEqDbl),
            (Op::Eq, Op::EqDbl),
            (Op::Neq, Op::NeqDbl),
        ] {
            assert!(generic.operands().is_empty());
            assert!(dbl.operands().is_empty());
        }
    }
}
