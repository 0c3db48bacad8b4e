//! The stack-machine instruction set.
//!
//! Instructions are one byte of opcode, optionally followed by a 16-bit
//! little-endian operand. Opcodes numbered below [`Opcode::HAVE_ARGUMENT`]
//! take no operand. Operands wider than 16 bits are carried by an
//! `EXTENDED_ARG` prefix holding the high bits.
//!
//! Every opcode has a single, consistent stack-depth delta (possibly a
//! function of its operand), so the assembler's depth dataflow can assert
//! equality at merge points. Branching opcodes may apply a different delta
//! on the jump edge than on fallthrough.

/// How a jump operand is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpKind {
    /// Not a jump.
    None,
    /// Operand is a forward distance from the end of this instruction.
    Relative,
    /// Operand is an absolute bytecode offset.
    Absolute,
}

/// One opcode of the Opal virtual machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    // === Stack manipulation ===
    PopTop = 1,
    RotTwo = 2,
    RotThree = 3,
    RotFour = 4,
    DupTop = 5,

    // === Unary operations ===
    UnaryPositive = 10,
    UnaryNegative = 11,
    UnaryNot = 12,
    UnaryInvert = 13,

    // === Binary operations ===
    BinaryPower = 19,
    BinaryMultiply = 20,
    BinaryDivide = 21,
    BinaryModulo = 22,
    BinaryAdd = 23,
    BinarySubtract = 24,
    BinarySubscr = 25,
    BinaryFloorDivide = 26,
    BinaryTrueDivide = 27,
    InplaceFloorDivide = 28,
    InplaceTrueDivide = 29,

    // === Slices (operand-free family; low two bits select lower/upper) ===
    Slice0 = 30,
    Slice1 = 31,
    Slice2 = 32,
    Slice3 = 33,
    StoreSlice0 = 40,
    StoreSlice1 = 41,
    StoreSlice2 = 42,
    StoreSlice3 = 43,
    DeleteSlice0 = 50,
    DeleteSlice1 = 51,
    DeleteSlice2 = 52,
    DeleteSlice3 = 53,

    // === In-place operations ===
    InplaceAdd = 55,
    InplaceSubtract = 56,
    InplaceMultiply = 57,
    InplaceDivide = 58,
    InplaceModulo = 59,
    StoreSubscr = 60,
    DeleteSubscr = 61,
    BinaryLshift = 62,
    BinaryRshift = 63,
    BinaryAnd = 64,
    BinaryXor = 65,
    BinaryOr = 66,
    InplacePower = 67,
    GetIter = 68,
    InplaceLshift = 71,
    InplaceRshift = 72,
    InplaceAnd = 73,
    InplaceXor = 74,
    InplaceOr = 75,

    // === Control / blocks ===
    BreakLoop = 76,
    WithCleanup = 77,
    LoadLocals = 78,
    ReturnValue = 80,
    ImportStar = 81,
    YieldValue = 82,
    PopBlock = 83,
    EndFinally = 84,
    /// Re-raise the exception triple when no except clause matched.
    Reraise = 85,
    BuildClass = 86,
    ListAppend = 87,

    // === Opcodes with a 16-bit operand ===
    StoreName = 90,
    DeleteName = 91,
    UnpackSequence = 92,
    ForIter = 93,
    StoreAttr = 95,
    DeleteAttr = 96,
    StoreGlobal = 97,
    DeleteGlobal = 98,
    DupTopX = 99,
    LoadConst = 100,
    LoadName = 101,
    BuildTuple = 102,
    BuildList = 103,
    BuildMap = 104,
    LoadAttr = 105,
    CompareOp = 106,
    ImportName = 107,
    ImportFrom = 108,
    JumpForward = 110,
    JumpIfFalse = 111,
    JumpIfTrue = 112,
    JumpAbsolute = 113,
    ContinueLoop = 114,
    LoadGlobal = 116,
    SetupLoop = 120,
    SetupExcept = 121,
    SetupFinally = 122,
    LoadFast = 124,
    StoreFast = 125,
    DeleteFast = 126,
    RaiseVarargs = 130,
    CallFunction = 131,
    MakeFunction = 132,
    BuildSlice = 133,
    MakeClosure = 134,
    LoadClosure = 135,
    LoadDeref = 136,
    StoreDeref = 137,
    CallFunctionVar = 140,
    CallFunctionKw = 141,
    CallFunctionVarKw = 142,
    ExtendedArg = 143,
}

/// Operand values for `COMPARE_OP`.
pub mod cmp {
    pub const LT: u32 = 0;
    pub const LE: u32 = 1;
    pub const EQ: u32 = 2;
    pub const NE: u32 = 3;
    pub const GT: u32 = 4;
    pub const GE: u32 = 5;
    pub const IN: u32 = 6;
    pub const NOT_IN: u32 = 7;
    pub const IS: u32 = 8;
    pub const IS_NOT: u32 = 9;
    pub const EXC_MATCH: u32 = 10;
}

impl Opcode {
    /// Opcodes at or above this value carry a 16-bit operand.
    pub const HAVE_ARGUMENT: u8 = 90;

    /// True if this opcode is followed by an operand.
    #[inline]
    pub fn has_arg(self) -> bool {
        self as u8 >= Self::HAVE_ARGUMENT
    }

    /// Size in bytes of one instruction with this opcode (without any
    /// `EXTENDED_ARG` prefix).
    #[inline]
    pub fn size(self) -> usize {
        if self.has_arg() {
            3
        } else {
            1
        }
    }

    /// Decode a raw byte back into an opcode.
    pub fn from_byte(byte: u8) -> Option<Opcode> {
        use Opcode::*;
        Some(match byte {
            1 => PopTop,
            2 => RotTwo,
            3 => RotThree,
            4 => RotFour,
            5 => DupTop,
            10 => UnaryPositive,
            11 => UnaryNegative,
            12 => UnaryNot,
            13 => UnaryInvert,
            19 => BinaryPower,
            20 => BinaryMultiply,
            21 => BinaryDivide,
            22 => BinaryModulo,
            23 => BinaryAdd,
            24 => BinarySubtract,
            25 => BinarySubscr,
            26 => BinaryFloorDivide,
            27 => BinaryTrueDivide,
            28 => InplaceFloorDivide,
            29 => InplaceTrueDivide,
            30 => Slice0,
            31 => Slice1,
            32 => Slice2,
            33 => Slice3,
            40 => StoreSlice0,
            41 => StoreSlice1,
            42 => StoreSlice2,
            43 => StoreSlice3,
            50 => DeleteSlice0,
            51 => DeleteSlice1,
            52 => DeleteSlice2,
            53 => DeleteSlice3,
            55 => InplaceAdd,
            56 => InplaceSubtract,
            57 => InplaceMultiply,
            58 => InplaceDivide,
            59 => InplaceModulo,
            60 => StoreSubscr,
            61 => DeleteSubscr,
            62 => BinaryLshift,
            63 => BinaryRshift,
            64 => BinaryAnd,
            65 => BinaryXor,
            66 => BinaryOr,
            67 => InplacePower,
            68 => GetIter,
            71 => InplaceLshift,
            72 => InplaceRshift,
            73 => InplaceAnd,
            74 => InplaceXor,
            75 => InplaceOr,
            76 => BreakLoop,
            77 => WithCleanup,
            78 => LoadLocals,
            80 => ReturnValue,
            81 => ImportStar,
            82 => YieldValue,
            83 => PopBlock,
            84 => EndFinally,
            85 => Reraise,
            86 => BuildClass,
            87 => ListAppend,
            90 => StoreName,
            91 => DeleteName,
            92 => UnpackSequence,
            93 => ForIter,
            95 => StoreAttr,
            96 => DeleteAttr,
            97 => StoreGlobal,
            98 => DeleteGlobal,
            99 => DupTopX,
            100 => LoadConst,
            101 => LoadName,
            102 => BuildTuple,
            103 => BuildList,
            104 => BuildMap,
            105 => LoadAttr,
            106 => CompareOp,
            107 => ImportName,
            108 => ImportFrom,
            110 => JumpForward,
            111 => JumpIfFalse,
            112 => JumpIfTrue,
            113 => JumpAbsolute,
            114 => ContinueLoop,
            116 => LoadGlobal,
            120 => SetupLoop,
            121 => SetupExcept,
            122 => SetupFinally,
            124 => LoadFast,
            125 => StoreFast,
            126 => DeleteFast,
            130 => RaiseVarargs,
            131 => CallFunction,
            132 => MakeFunction,
            133 => BuildSlice,
            134 => MakeClosure,
            135 => LoadClosure,
            136 => LoadDeref,
            137 => StoreDeref,
            140 => CallFunctionVar,
            141 => CallFunctionKw,
            142 => CallFunctionVarKw,
            143 => ExtendedArg,
            _ => return None,
        })
    }

    /// Jump family of this opcode.
    pub fn jump_kind(self) -> JumpKind {
        use Opcode::*;
        match self {
            JumpForward | JumpIfFalse | JumpIfTrue | ForIter | SetupLoop | SetupExcept
            | SetupFinally => JumpKind::Relative,
            JumpAbsolute | ContinueLoop => JumpKind::Absolute,
            _ => JumpKind::None,
        }
    }

    /// True if control never falls through to the next instruction.
    ///
    /// `BREAK_LOOP` and `CONTINUE_LOOP` unwind through the runtime block
    /// stack, so the depth dataflow does not propagate along their edges.
    pub fn is_terminator(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            ReturnValue
                | RaiseVarargs
                | Reraise
                | JumpForward
                | JumpAbsolute
                | BreakLoop
                | ContinueLoop
        )
    }

    /// Stack-depth delta applied on the fallthrough edge.
    ///
    /// For terminators the value is still meaningful (it describes what the
    /// instruction consumes) but is never propagated.
    pub fn stack_effect(self, arg: u32) -> i32 {
        use Opcode::*;
        let n = arg as i32;
        match self {
            PopTop => -1,
            RotTwo | RotThree | RotFour => 0,
            DupTop => 1,
            UnaryPositive | UnaryNegative | UnaryNot | UnaryInvert => 0,
            BinaryPower | BinaryMultiply | BinaryDivide | BinaryModulo | BinaryAdd
            | BinarySubtract | BinarySubscr | BinaryFloorDivide | BinaryTrueDivide
            | BinaryLshift | BinaryRshift | BinaryAnd | BinaryXor | BinaryOr => -1,
            InplaceFloorDivide | InplaceTrueDivide | InplaceAdd | InplaceSubtract
            | InplaceMultiply | InplaceDivide | InplaceModulo | InplacePower
            | InplaceLshift | InplaceRshift | InplaceAnd | InplaceXor | InplaceOr => -1,
            Slice0 => 0,
            Slice1 | Slice2 => -1,
            Slice3 => -2,
            StoreSlice0 => -2,
            StoreSlice1 | StoreSlice2 => -3,
            StoreSlice3 => -4,
            DeleteSlice0 => -1,
            DeleteSlice1 | DeleteSlice2 => -2,
            DeleteSlice3 => -3,
            StoreSubscr => -3,
            DeleteSubscr => -2,
            GetIter => 0,
            BreakLoop => 0,
            WithCleanup => -1,
            LoadLocals => 1,
            ReturnValue => -1,
            ImportStar => -1,
            YieldValue => 0,
            PopBlock => 0,
            EndFinally => -1,
            Reraise => -3,
            BuildClass => -2,
            ListAppend => -2,
            StoreName => -1,
            DeleteName => 0,
            UnpackSequence => n - 1,
            ForIter => 1,
            StoreAttr => -2,
            DeleteAttr => -1,
            StoreGlobal => -1,
            DeleteGlobal => 0,
            DupTopX => n,
            LoadConst => 1,
            LoadName => 1,
            BuildTuple | BuildList => 1 - n,
            BuildMap => 1 - 2 * n,
            LoadAttr => 0,
            CompareOp => -1,
            ImportName => -1,
            ImportFrom => 1,
            JumpForward | JumpIfFalse | JumpIfTrue | JumpAbsolute => 0,
            ContinueLoop => 0,
            LoadGlobal => 1,
            SetupLoop | SetupExcept | SetupFinally => 0,
            LoadFast => 1,
            StoreFast => -1,
            DeleteFast => 0,
            RaiseVarargs => -n,
            CallFunction => -call_arity(arg),
            MakeFunction => -n,
            BuildSlice => 1 - n,
            MakeClosure => -(n + 1),
            LoadClosure => 1,
            LoadDeref => 1,
            StoreDeref => -1,
            CallFunctionVar | CallFunctionKw => -call_arity(arg) - 1,
            CallFunctionVarKw => -call_arity(arg) - 2,
            ExtendedArg => 0,
        }
    }

    /// Stack-depth delta applied on the jump edge of a branching opcode.
    ///
    /// `SETUP_EXCEPT` targets receive the exception triple; `SETUP_FINALLY`
    /// targets receive one unwind token (an exception, or the `None`
    /// sentinel pushed on normal fallthrough). `FOR_ITER` pops its iterator
    /// when exhausted.
    pub fn branch_effect(self, _arg: u32) -> i32 {
        use Opcode::*;
        match self {
            ForIter => -1,
            SetupExcept => 3,
            SetupFinally => 1,
            _ => 0,
        }
    }

    /// Human-readable name, as shown by the disassembler.
    pub fn name(self) -> &'static str {
        use Opcode::*;
        match self {
            PopTop => "POP_TOP",
            RotTwo => "ROT_TWO",
            RotThree => "ROT_THREE",
            RotFour => "ROT_FOUR",
            DupTop => "DUP_TOP",
            UnaryPositive => "UNARY_POSITIVE",
            UnaryNegative => "UNARY_NEGATIVE",
            UnaryNot => "UNARY_NOT",
            UnaryInvert => "UNARY_INVERT",
            BinaryPower => "BINARY_POWER",
            BinaryMultiply => "BINARY_MULTIPLY",
            BinaryDivide => "BINARY_DIVIDE",
            BinaryModulo => "BINARY_MODULO",
            BinaryAdd => "BINARY_ADD",
            BinarySubtract => "BINARY_SUBTRACT",
            BinarySubscr => "BINARY_SUBSCR",
            BinaryFloorDivide => "BINARY_FLOOR_DIVIDE",
            BinaryTrueDivide => "BINARY_TRUE_DIVIDE",
            InplaceFloorDivide => "INPLACE_FLOOR_DIVIDE",
            InplaceTrueDivide => "INPLACE_TRUE_DIVIDE",
            Slice0 => "SLICE+0",
            Slice1 => "SLICE+1",
            Slice2 => "SLICE+2",
            Slice3 => "SLICE+3",
            StoreSlice0 => "STORE_SLICE+0",
            StoreSlice1 => "STORE_SLICE+1",
            StoreSlice2 => "STORE_SLICE+2",
            StoreSlice3 => "STORE_SLICE+3",
            DeleteSlice0 => "DELETE_SLICE+0",
            DeleteSlice1 => "DELETE_SLICE+1",
            DeleteSlice2 => "DELETE_SLICE+2",
            DeleteSlice3 => "DELETE_SLICE+3",
            InplaceAdd => "INPLACE_ADD",
            InplaceSubtract => "INPLACE_SUBTRACT",
            InplaceMultiply => "INPLACE_MULTIPLY",
            InplaceDivide => "INPLACE_DIVIDE",
            InplaceModulo => "INPLACE_MODULO",
            StoreSubscr => "STORE_SUBSCR",
            DeleteSubscr => "DELETE_SUBSCR",
            BinaryLshift => "BINARY_LSHIFT",
            BinaryRshift => "BINARY_RSHIFT",
            BinaryAnd => "BINARY_AND",
            BinaryXor => "BINARY_XOR",
            BinaryOr => "BINARY_OR",
            InplacePower => "INPLACE_POWER",
            GetIter => "GET_ITER",
            InplaceLshift => "INPLACE_LSHIFT",
            InplaceRshift => "INPLACE_RSHIFT",
            InplaceAnd => "INPLACE_AND",
            InplaceXor => "INPLACE_XOR",
            InplaceOr => "INPLACE_OR",
            BreakLoop => "BREAK_LOOP",
            WithCleanup => "WITH_CLEANUP",
            LoadLocals => "LOAD_LOCALS",
            ReturnValue => "RETURN_VALUE",
            ImportStar => "IMPORT_STAR",
            YieldValue => "YIELD_VALUE",
            PopBlock => "POP_BLOCK",
            EndFinally => "END_FINALLY",
            Reraise => "RERAISE",
            BuildClass => "BUILD_CLASS",
            ListAppend => "LIST_APPEND",
            StoreName => "STORE_NAME",
            DeleteName => "DELETE_NAME",
            UnpackSequence => "UNPACK_SEQUENCE",
            ForIter => "FOR_ITER",
            StoreAttr => "STORE_ATTR",
            DeleteAttr => "DELETE_ATTR",
            StoreGlobal => "STORE_GLOBAL",
            DeleteGlobal => "DELETE_GLOBAL",
            DupTopX => "DUP_TOPX",
            LoadConst => "LOAD_CONST",
            LoadName => "LOAD_NAME",
            BuildTuple => "BUILD_TUPLE",
            BuildList => "BUILD_LIST",
            BuildMap => "BUILD_MAP",
            LoadAttr => "LOAD_ATTR",
            CompareOp => "COMPARE_OP",
            ImportName => "IMPORT_NAME",
            ImportFrom => "IMPORT_FROM",
            JumpForward => "JUMP_FORWARD",
            JumpIfFalse => "JUMP_IF_FALSE",
            JumpIfTrue => "JUMP_IF_TRUE",
            JumpAbsolute => "JUMP_ABSOLUTE",
            ContinueLoop => "CONTINUE_LOOP",
            LoadGlobal => "LOAD_GLOBAL",
            SetupLoop => "SETUP_LOOP",
            SetupExcept => "SETUP_EXCEPT",
            SetupFinally => "SETUP_FINALLY",
            LoadFast => "LOAD_FAST",
            StoreFast => "STORE_FAST",
            DeleteFast => "DELETE_FAST",
            RaiseVarargs => "RAISE_VARARGS",
            CallFunction => "CALL_FUNCTION",
            MakeFunction => "MAKE_FUNCTION",
            BuildSlice => "BUILD_SLICE",
            MakeClosure => "MAKE_CLOSURE",
            LoadClosure => "LOAD_CLOSURE",
            LoadDeref => "LOAD_DEREF",
            StoreDeref => "STORE_DEREF",
            CallFunctionVar => "CALL_FUNCTION_VAR",
            CallFunctionKw => "CALL_FUNCTION_KW",
            CallFunctionVarKw => "CALL_FUNCTION_VAR_KW",
            ExtendedArg => "EXTENDED_ARG",
        }
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Values consumed by a call: positional count in the low byte, keyword
/// pair count in the high byte, plus the callee itself.
#[inline]
fn call_arity(arg: u32) -> i32 {
    let positional = (arg & 0xff) as i32;
    let keyword = ((arg >> 8) & 0xff) as i32;
    positional + 2 * keyword
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_round_trip() {
        for byte in 0..=255u8 {
            if let Some(op) = Opcode::from_byte(byte) {
                assert_eq!(op as u8, byte);
            }
        }
        assert_eq!(Opcode::from_byte(Opcode::LoadConst as u8), Some(Opcode::LoadConst));
        assert_eq!(Opcode::from_byte(0), None);
    }

    #[test]
    fn test_has_arg_threshold() {
        assert!(!Opcode::PopTop.has_arg());
        assert!(!Opcode::ReturnValue.has_arg());
        assert!(Opcode::StoreName.has_arg());
        assert!(Opcode::LoadConst.has_arg());
        assert_eq!(Opcode::PopTop.size(), 1);
        assert_eq!(Opcode::LoadConst.size(), 3);
    }

    #[test]
    fn test_call_effects() {
        // two positional args and one keyword pair, plus the callee
        assert_eq!(Opcode::CallFunction.stack_effect(2 | (1 << 8)), -4);
        assert_eq!(Opcode::CallFunctionVar.stack_effect(1), -2);
        assert_eq!(Opcode::CallFunctionVarKw.stack_effect(0), -2);
    }

    #[test]
    fn test_closure_effects() {
        // MAKE_CLOSURE additionally pops the tuple of cells
        assert_eq!(Opcode::MakeFunction.stack_effect(2), -2);
        assert_eq!(Opcode::MakeClosure.stack_effect(2), -3);
    }

    #[test]
    fn test_branch_effects() {
        assert_eq!(Opcode::ForIter.stack_effect(0), 1);
        assert_eq!(Opcode::ForIter.branch_effect(0), -1);
        assert_eq!(Opcode::SetupExcept.branch_effect(0), 3);
        assert_eq!(Opcode::SetupFinally.branch_effect(0), 1);
        assert_eq!(Opcode::JumpIfFalse.branch_effect(0), 0);
    }

    #[test]
    fn test_jump_kinds() {
        assert_eq!(Opcode::JumpForward.jump_kind(), JumpKind::Relative);
        assert_eq!(Opcode::JumpAbsolute.jump_kind(), JumpKind::Absolute);
        assert_eq!(Opcode::ContinueLoop.jump_kind(), JumpKind::Absolute);
        assert_eq!(Opcode::LoadConst.jump_kind(), JumpKind::None);
    }
}
