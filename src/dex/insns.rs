//! Format-driven decoder for the Dalvik instruction stream.
//!
//! Input is a method's array of 16-bit code units; output is a sequence of
//! typed [`Instruction`]s in offset order. Branch targets are resolved to
//! absolute code-unit offsets and switch / fill-array payload tables are
//! inlined into their parent instruction, so later passes never touch the
//! raw units again.

use crate::dex::opcodes::{
    opcode_info, Format, OpcodeInfo, FILL_ARRAY_DATA_PAYLOAD, PACKED_SWITCH_PAYLOAD,
    SPARSE_SWITCH_PAYLOAD,
};
use crate::error::LiftError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveKind {
    Single,
    Wide,
    Object,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeKind {
    Virtual,
    Super,
    Direct,
    Static,
    Interface,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestKind {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
}

impl TestKind {
    /// Java spelling of the relation.
    pub fn symbol(self) -> &'static str {
        match self {
            TestKind::Eq => "==",
            TestKind::Ne => "!=",
            TestKind::Lt => "<",
            TestKind::Ge => ">=",
            TestKind::Gt => ">",
            TestKind::Le => "<=",
        }
    }

    pub fn negate(self) -> TestKind {
        match self {
            TestKind::Eq => TestKind::Ne,
            TestKind::Ne => TestKind::Eq,
            TestKind::Lt => TestKind::Ge,
            TestKind::Ge => TestKind::Lt,
            TestKind::Gt => TestKind::Le,
            TestKind::Le => TestKind::Gt,
        }
    }
}

/// The three-way comparisons. `l`/`g` name the NaN bias: `cmpl` yields -1
/// on NaN, `cmpg` yields 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpKind {
    CmplFloat,
    CmpgFloat,
    CmplDouble,
    CmpgDouble,
    CmpLong,
}

/// Width/type selector of array and field accessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessWidth {
    Single,
    Wide,
    Object,
    Boolean,
    Byte,
    Char,
    Short,
}

impl AccessWidth {
    fn from_index(i: u8) -> AccessWidth {
        match i {
            0 => AccessWidth::Single,
            1 => AccessWidth::Wide,
            2 => AccessWidth::Object,
            3 => AccessWidth::Boolean,
            4 => AccessWidth::Byte,
            5 => AccessWidth::Char,
            _ => AccessWidth::Short,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arith {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Ushr,
}

impl Arith {
    pub fn symbol(self) -> &'static str {
        match self {
            Arith::Add => "+",
            Arith::Sub => "-",
            Arith::Mul => "*",
            Arith::Div => "/",
            Arith::Rem => "%",
            Arith::And => "&",
            Arith::Or => "|",
            Arith::Xor => "^",
            Arith::Shl => "<<",
            Arith::Shr => ">>",
            Arith::Ushr => ">>>",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumKind {
    Int,
    Long,
    Float,
    Double,
}

impl NumKind {
    pub fn is_wide(self) -> bool {
        matches!(self, NumKind::Long | NumKind::Double)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    NegInt,
    NotInt,
    NegLong,
    NotLong,
    NegFloat,
    NegDouble,
    IntToLong,
    IntToFloat,
    IntToDouble,
    LongToInt,
    LongToFloat,
    LongToDouble,
    FloatToInt,
    FloatToLong,
    FloatToDouble,
    DoubleToInt,
    DoubleToLong,
    DoubleToFloat,
    IntToByte,
    IntToChar,
    IntToShort,
}

const UNOPS: [UnaryOp; 21] = [
    UnaryOp::NegInt,
    UnaryOp::NotInt,
    UnaryOp::NegLong,
    UnaryOp::NotLong,
    UnaryOp::NegFloat,
    UnaryOp::NegDouble,
    UnaryOp::IntToLong,
    UnaryOp::IntToFloat,
    UnaryOp::IntToDouble,
    UnaryOp::LongToInt,
    UnaryOp::LongToFloat,
    UnaryOp::LongToDouble,
    UnaryOp::FloatToInt,
    UnaryOp::FloatToLong,
    UnaryOp::FloatToDouble,
    UnaryOp::DoubleToInt,
    UnaryOp::DoubleToLong,
    UnaryOp::DoubleToFloat,
    UnaryOp::IntToByte,
    UnaryOp::IntToChar,
    UnaryOp::IntToShort,
];

fn binop_from_index(i: u8) -> (Arith, NumKind) {
    const ARITHS: [Arith; 11] = [
        Arith::Add,
        Arith::Sub,
        Arith::Mul,
        Arith::Div,
        Arith::Rem,
        Arith::And,
        Arith::Or,
        Arith::Xor,
        Arith::Shl,
        Arith::Shr,
        Arith::Ushr,
    ];
    match i {
        0..=10 => (ARITHS[i as usize], NumKind::Int),
        11..=21 => (ARITHS[(i - 11) as usize], NumKind::Long),
        22..=26 => (ARITHS[(i - 22) as usize], NumKind::Float),
        _ => (ARITHS[(i - 27) as usize], NumKind::Double),
    }
}

/// One decoded instruction with typed operands.
#[derive(Debug, Clone)]
pub enum Op {
    Nop,
    Move {
        kind: MoveKind,
        dst: u16,
        src: u16,
    },
    MoveResult {
        kind: MoveKind,
        dst: u16,
    },
    MoveException {
        dst: u16,
    },
    ReturnVoid,
    Return {
        kind: MoveKind,
        src: u16,
    },
    Const {
        dst: u16,
        value: i32,
    },
    ConstWide {
        dst: u16,
        value: i64,
    },
    ConstString {
        dst: u16,
        string_idx: u32,
    },
    ConstClass {
        dst: u16,
        type_idx: u32,
    },
    ConstMethodHandle {
        dst: u16,
        handle_idx: u32,
    },
    ConstMethodType {
        dst: u16,
        proto_idx: u32,
    },
    MonitorEnter {
        src: u16,
    },
    MonitorExit {
        src: u16,
    },
    CheckCast {
        reg: u16,
        type_idx: u32,
    },
    InstanceOf {
        dst: u16,
        src: u16,
        type_idx: u32,
    },
    ArrayLength {
        dst: u16,
        src: u16,
    },
    NewInstance {
        dst: u16,
        type_idx: u32,
    },
    NewArray {
        dst: u16,
        size: u16,
        type_idx: u32,
    },
    FilledNewArray {
        type_idx: u32,
        args: Vec<u16>,
    },
    FillArrayData {
        src: u16,
        element_width: u16,
        data: Vec<u8>,
    },
    Throw {
        src: u16,
    },
    Goto {
        target: usize,
    },
    PackedSwitch {
        src: u16,
        cases: Vec<(i32, usize)>,
    },
    SparseSwitch {
        src: u16,
        cases: Vec<(i32, usize)>,
    },
    Cmp {
        kind: CmpKind,
        dst: u16,
        a: u16,
        b: u16,
    },
    If {
        test: TestKind,
        a: u16,
        b: u16,
        target: usize,
    },
    IfZ {
        test: TestKind,
        a: u16,
        target: usize,
    },
    ArrayGet {
        width: AccessWidth,
        dst: u16,
        array: u16,
        index: u16,
    },
    ArrayPut {
        width: AccessWidth,
        src: u16,
        array: u16,
        index: u16,
    },
    InstanceGet {
        width: AccessWidth,
        dst: u16,
        object: u16,
        field_idx: u32,
    },
    InstancePut {
        width: AccessWidth,
        src: u16,
        object: u16,
        field_idx: u32,
    },
    StaticGet {
        width: AccessWidth,
        dst: u16,
        field_idx: u32,
    },
    StaticPut {
        width: AccessWidth,
        src: u16,
        field_idx: u32,
    },
    Invoke {
        kind: InvokeKind,
        method_idx: u32,
        args: Vec<u16>,
    },
    InvokePolymorphic {
        method_idx: u32,
        proto_idx: u32,
        args: Vec<u16>,
    },
    InvokeCustom {
        call_site_idx: u32,
        args: Vec<u16>,
    },
    Unary {
        op: UnaryOp,
        dst: u16,
        src: u16,
    },
    Binary {
        op: Arith,
        kind: NumKind,
        dst: u16,
        a: u16,
        b: u16,
    },
    /// `dst = src op lit` or, when `reverse`, `dst = lit op src` (rsub).
    BinaryLit {
        op: Arith,
        dst: u16,
        src: u16,
        lit: i32,
        reverse: bool,
    },
}

#[derive(Debug, Clone)]
pub struct Instruction {
    /// Code-unit offset of the instruction.
    pub offset: usize,
    pub opcode: u8,
    /// Width in code units.
    pub units: usize,
    pub op: Op,
}

impl Instruction {
    pub fn mnemonic(&self) -> &'static str {
        opcode_info(self.opcode).map(|i| i.name).unwrap_or("?")
    }

    /// Branch/switch successors, not counting fall-through.
    pub fn branch_targets(&self) -> Vec<usize> {
        match &self.op {
            Op::Goto { target } => vec![*target],
            Op::If { target, .. } | Op::IfZ { target, .. } => vec![*target],
            Op::PackedSwitch { cases, .. } | Op::SparseSwitch { cases, .. } => {
                cases.iter().map(|(_, t)| *t).collect()
            }
            _ => vec![],
        }
    }

    /// True when control can flow into the next instruction.
    pub fn falls_through(&self) -> bool {
        !matches!(
            self.op,
            Op::ReturnVoid | Op::Return { .. } | Op::Throw { .. } | Op::Goto { .. }
        )
    }

    pub fn is_terminator(&self) -> bool {
        !self.falls_through()
            || matches!(
                self.op,
                Op::If { .. } | Op::IfZ { .. } | Op::PackedSwitch { .. } | Op::SparseSwitch { .. }
            )
    }
}

impl Op {
    /// The register this instruction writes, if any (low register of a
    /// wide pair).
    pub fn def_reg(&self) -> Option<u16> {
        match self {
            Op::Move { dst, .. }
            | Op::MoveResult { dst, .. }
            | Op::MoveException { dst }
            | Op::Const { dst, .. }
            | Op::ConstWide { dst, .. }
            | Op::ConstString { dst, .. }
            | Op::ConstClass { dst, .. }
            | Op::ConstMethodHandle { dst, .. }
            | Op::ConstMethodType { dst, .. }
            | Op::InstanceOf { dst, .. }
            | Op::ArrayLength { dst, .. }
            | Op::NewInstance { dst, .. }
            | Op::NewArray { dst, .. }
            | Op::Cmp { dst, .. }
            | Op::ArrayGet { dst, .. }
            | Op::InstanceGet { dst, .. }
            | Op::StaticGet { dst, .. }
            | Op::Unary { dst, .. }
            | Op::Binary { dst, .. }
            | Op::BinaryLit { dst, .. } => Some(*dst),
            Op::CheckCast { reg, .. } => Some(*reg),
            _ => None,
        }
    }

    /// Registers this instruction reads, in operand order.
    pub fn src_regs(&self) -> Vec<u16> {
        match self {
            Op::Move { src, .. }
            | Op::Return { src, .. }
            | Op::MonitorEnter { src }
            | Op::MonitorExit { src }
            | Op::FillArrayData { src, .. }
            | Op::Throw { src }
            | Op::PackedSwitch { src, .. }
            | Op::SparseSwitch { src, .. }
            | Op::StaticPut { src, .. }
            | Op::Unary { src, .. } => vec![*src],
            Op::CheckCast { reg, .. } => vec![*reg],
            Op::InstanceOf { src, .. } => vec![*src],
            Op::ArrayLength { src, .. } => vec![*src],
            Op::NewArray { size, .. } => vec![*size],
            Op::FilledNewArray { args, .. }
            | Op::Invoke { args, .. }
            | Op::InvokePolymorphic { args, .. }
            | Op::InvokeCustom { args, .. } => args.clone(),
            Op::Cmp { a, b, .. } | Op::If { a, b, .. } | Op::Binary { a, b, .. } => {
                vec![*a, *b]
            }
            Op::IfZ { a, .. } => vec![*a],
            Op::ArrayGet { array, index, .. } => vec![*array, *index],
            Op::ArrayPut { src, array, index, .. } => vec![*src, *array, *index],
            Op::InstanceGet { object, .. } => vec![*object],
            Op::InstancePut { src, object, .. } => vec![*src, *object],
            Op::BinaryLit { src, .. } => vec![*src],
            _ => vec![],
        }
    }
}

struct Units<'a> {
    insns: &'a [u16],
}

impl<'a> Units<'a> {
    fn get(&self, pc: usize) -> Result<u16, LiftError> {
        self.insns
            .get(pc)
            .copied()
            .ok_or(LiftError::TruncatedCode { offset: pc })
    }

    fn target(&self, pc: usize, rel: i32) -> Result<usize, LiftError> {
        let t = pc as i64 + i64::from(rel);
        if t < 0 || t as usize >= self.insns.len() {
            return Err(LiftError::Cfg {
                offset: pc,
                reason: format!("branch target {t} outside method"),
            });
        }
        Ok(t as usize)
    }
}

/// Units occupied by the payload table starting at `pc`.
fn payload_units(units: &Units, pc: usize) -> Result<usize, LiftError> {
    match units.get(pc)? {
        PACKED_SWITCH_PAYLOAD => {
            let size = units.get(pc + 1)? as usize;
            Ok(4 + size * 2)
        }
        SPARSE_SWITCH_PAYLOAD => {
            let size = units.get(pc + 1)? as usize;
            Ok(2 + size * 4)
        }
        FILL_ARRAY_DATA_PAYLOAD => {
            let width = units.get(pc + 1)? as usize;
            let size =
                units.get(pc + 2)? as usize | ((units.get(pc + 3)? as usize) << 16);
            Ok(4 + (size * width + 1) / 2)
        }
        other => Err(LiftError::BadPayload {
            offset: pc,
            reason: format!("unknown payload ident {other:#06x}"),
        }),
    }
}

fn read_i32(units: &Units, pc: usize) -> Result<i32, LiftError> {
    Ok(units.get(pc)? as i32 | ((units.get(pc + 1)? as i32) << 16))
}

fn invoke_kind(opcode: u8) -> InvokeKind {
    match opcode {
        0x6e | 0x74 => InvokeKind::Virtual,
        0x6f | 0x75 => InvokeKind::Super,
        0x70 | 0x76 => InvokeKind::Direct,
        0x71 | 0x77 => InvokeKind::Static,
        _ => InvokeKind::Interface,
    }
}

/// Argument registers of a 35c-format instruction: up to five nibbles.
fn regs_35c(units: &Units, pc: usize) -> Result<Vec<u16>, LiftError> {
    let unit = units.get(pc)?;
    let count = (unit >> 12) as usize;
    let g = (unit >> 8) & 0xf;
    let nibbles = units.get(pc + 2)?;
    let mut args = vec![
        nibbles & 0xf,
        (nibbles >> 4) & 0xf,
        (nibbles >> 8) & 0xf,
        (nibbles >> 12) & 0xf,
        g,
    ];
    if count > 5 {
        return Err(LiftError::BadPayload {
            offset: pc,
            reason: format!("35c argument count {count} exceeds 5"),
        });
    }
    args.truncate(count);
    Ok(args)
}

/// Argument registers of a 3rc-format instruction: a contiguous range.
fn regs_3rc(units: &Units, pc: usize) -> Result<Vec<u16>, LiftError> {
    let count = (units.get(pc)? >> 8) as u16;
    let first = units.get(pc + 2)?;
    Ok((first..first.wrapping_add(count)).collect())
}

fn switch_cases(
    units: &Units,
    parent_pc: usize,
    payload_pc: usize,
    sparse: bool,
) -> Result<Vec<(i32, usize)>, LiftError> {
    let ident = units.get(payload_pc)?;
    let expected = if sparse {
        SPARSE_SWITCH_PAYLOAD
    } else {
        PACKED_SWITCH_PAYLOAD
    };
    if ident != expected {
        return Err(LiftError::BadPayload {
            offset: payload_pc,
            reason: format!("expected switch payload, found ident {ident:#06x}"),
        });
    }
    let size = units.get(payload_pc + 1)? as usize;
    let mut cases = Vec::with_capacity(size);
    if sparse {
        for i in 0..size {
            let key = read_i32(units, payload_pc + 2 + i * 2)?;
            let rel = read_i32(units, payload_pc + 2 + size * 2 + i * 2)?;
            cases.push((key, units.target(parent_pc, rel)?));
        }
    } else {
        let first_key = read_i32(units, payload_pc + 2)?;
        for i in 0..size {
            let rel = read_i32(units, payload_pc + 4 + i * 2)?;
            cases.push((first_key.wrapping_add(i as i32), units.target(parent_pc, rel)?));
        }
    }
    Ok(cases)
}

fn fill_array_data(
    units: &Units,
    payload_pc: usize,
) -> Result<(u16, Vec<u8>), LiftError> {
    if units.get(payload_pc)? != FILL_ARRAY_DATA_PAYLOAD {
        return Err(LiftError::BadPayload {
            offset: payload_pc,
            reason: "expected fill-array-data payload".to_string(),
        });
    }
    let width = units.get(payload_pc + 1)?;
    let size =
        units.get(payload_pc + 2)? as usize | ((units.get(payload_pc + 3)? as usize) << 16);
    let byte_len = size * width as usize;
    let mut data = Vec::with_capacity(byte_len);
    for i in 0..(byte_len + 1) / 2 {
        let unit = units.get(payload_pc + 4 + i)?;
        data.push((unit & 0xff) as u8);
        data.push((unit >> 8) as u8);
    }
    data.truncate(byte_len);
    Ok((width, data))
}

/// Result of decoding at one position: a real instruction, or a payload
/// table (to be skipped; its contents surface through the parent
/// instruction).
pub enum Decoded {
    Insn(Instruction),
    Payload { units: usize },
}

/// Decodes a full method body. Payload tables embedded in the stream are
/// skipped in place; their contents surface through the parent
/// `packed-switch` / `sparse-switch` / `fill-array-data` instruction.
pub fn decode_method(insns: &[u16]) -> Result<Vec<Instruction>, LiftError> {
    let mut out = Vec::new();
    let mut pc = 0usize;
    while pc < insns.len() {
        match decode_one(insns, pc)? {
            Decoded::Insn(insn) => {
                pc += insn.units;
                out.push(insn);
            }
            Decoded::Payload { units } => pc += units,
        }
    }
    Ok(out)
}

/// Decodes the single instruction (or payload header) at `pc`.
pub fn decode_one(insns: &[u16], pc: usize) -> Result<Decoded, LiftError> {
    let units = Units { insns };
    {
        let unit = units.get(pc)?;
        if unit == PACKED_SWITCH_PAYLOAD
            || unit == SPARSE_SWITCH_PAYLOAD
            || unit == FILL_ARRAY_DATA_PAYLOAD
        {
            return Ok(Decoded::Payload {
                units: payload_units(&units, pc)?,
            });
        }

        let opcode = (unit & 0xff) as u8;
        let info: &OpcodeInfo = opcode_info(opcode).ok_or(LiftError::UnknownOpcode {
            opcode: u16::from(opcode),
            offset: pc,
        })?;
        let width = info.format.units();
        if pc + width > insns.len() {
            return Err(LiftError::TruncatedCode { offset: pc });
        }

        let hi = (unit >> 8) as u16;
        let nib_a = hi & 0xf;
        let nib_b = hi >> 4;

        let op = match opcode {
            0x00 => Op::Nop,

            0x01 | 0x04 | 0x07 => Op::Move {
                kind: move_kind(opcode, 0x01),
                dst: nib_a,
                src: nib_b,
            },
            0x02 | 0x05 | 0x08 => Op::Move {
                kind: move_kind(opcode, 0x02),
                dst: hi,
                src: units.get(pc + 1)?,
            },
            0x03 | 0x06 | 0x09 => Op::Move {
                kind: move_kind(opcode, 0x03),
                dst: units.get(pc + 1)?,
                src: units.get(pc + 2)?,
            },
            0x0a | 0x0b | 0x0c => Op::MoveResult {
                kind: kind_from_index(opcode - 0x0a),
                dst: hi,
            },
            0x0d => Op::MoveException { dst: hi },

            0x0e => Op::ReturnVoid,
            0x0f | 0x10 | 0x11 => Op::Return {
                kind: kind_from_index(opcode - 0x0f),
                src: hi,
            },

            0x12 => Op::Const {
                dst: nib_a,
                value: ((nib_b as i32) << 28) >> 28,
            },
            0x13 => Op::Const {
                dst: hi,
                value: i32::from(units.get(pc + 1)? as i16),
            },
            0x14 => Op::Const {
                dst: hi,
                value: read_i32(&units, pc + 1)?,
            },
            0x15 => Op::Const {
                dst: hi,
                value: i32::from(units.get(pc + 1)? as i16) << 16,
            },
            0x16 => Op::ConstWide {
                dst: hi,
                value: i64::from(units.get(pc + 1)? as i16),
            },
            0x17 => Op::ConstWide {
                dst: hi,
                value: i64::from(read_i32(&units, pc + 1)?),
            },
            0x18 => {
                let mut value: u64 = 0;
                for i in 0..4 {
                    value |= u64::from(units.get(pc + 1 + i)?) << (16 * i);
                }
                Op::ConstWide {
                    dst: hi,
                    value: value as i64,
                }
            }
            0x19 => Op::ConstWide {
                dst: hi,
                value: i64::from(units.get(pc + 1)? as i16) << 48,
            },
            0x1a => Op::ConstString {
                dst: hi,
                string_idx: u32::from(units.get(pc + 1)?),
            },
            0x1b => Op::ConstString {
                dst: hi,
                string_idx: read_i32(&units, pc + 1)? as u32,
            },
            0x1c => Op::ConstClass {
                dst: hi,
                type_idx: u32::from(units.get(pc + 1)?),
            },

            0x1d => Op::MonitorEnter { src: hi },
            0x1e => Op::MonitorExit { src: hi },
            0x1f => Op::CheckCast {
                reg: hi,
                type_idx: u32::from(units.get(pc + 1)?),
            },
            0x20 => Op::InstanceOf {
                dst: nib_a,
                src: nib_b,
                type_idx: u32::from(units.get(pc + 1)?),
            },
            0x21 => Op::ArrayLength {
                dst: nib_a,
                src: nib_b,
            },
            0x22 => Op::NewInstance {
                dst: hi,
                type_idx: u32::from(units.get(pc + 1)?),
            },
            0x23 => Op::NewArray {
                dst: nib_a,
                size: nib_b,
                type_idx: u32::from(units.get(pc + 1)?),
            },
            0x24 => Op::FilledNewArray {
                type_idx: u32::from(units.get(pc + 1)?),
                args: regs_35c(&units, pc)?,
            },
            0x25 => Op::FilledNewArray {
                type_idx: u32::from(units.get(pc + 1)?),
                args: regs_3rc(&units, pc)?,
            },
            0x26 => {
                let payload = units.target(pc, read_i32(&units, pc + 1)?)?;
                let (element_width, data) = fill_array_data(&units, payload)?;
                Op::FillArrayData {
                    src: hi,
                    element_width,
                    data,
                }
            }
            0x27 => Op::Throw { src: hi },

            0x28 => Op::Goto {
                target: units.target(pc, i32::from(hi as u8 as i8))?,
            },
            0x29 => Op::Goto {
                target: units.target(pc, i32::from(units.get(pc + 1)? as i16))?,
            },
            0x2a => Op::Goto {
                target: units.target(pc, read_i32(&units, pc + 1)?)?,
            },
            0x2b => {
                let payload = units.target(pc, read_i32(&units, pc + 1)?)?;
                Op::PackedSwitch {
                    src: hi,
                    cases: switch_cases(&units, pc, payload, false)?,
                }
            }
            0x2c => {
                let payload = units.target(pc, read_i32(&units, pc + 1)?)?;
                Op::SparseSwitch {
                    src: hi,
                    cases: switch_cases(&units, pc, payload, true)?,
                }
            }

            0x2d..=0x31 => {
                let unit2 = units.get(pc + 1)?;
                Op::Cmp {
                    kind: match opcode {
                        0x2d => CmpKind::CmplFloat,
                        0x2e => CmpKind::CmpgFloat,
                        0x2f => CmpKind::CmplDouble,
                        0x30 => CmpKind::CmpgDouble,
                        _ => CmpKind::CmpLong,
                    },
                    dst: hi,
                    a: unit2 & 0xff,
                    b: unit2 >> 8,
                }
            }

            0x32..=0x37 => Op::If {
                test: test_kind(opcode - 0x32),
                a: nib_a,
                b: nib_b,
                target: units.target(pc, i32::from(units.get(pc + 1)? as i16))?,
            },
            0x38..=0x3d => Op::IfZ {
                test: test_kind(opcode - 0x38),
                a: hi,
                target: units.target(pc, i32::from(units.get(pc + 1)? as i16))?,
            },

            0x44..=0x4a => {
                let unit2 = units.get(pc + 1)?;
                Op::ArrayGet {
                    width: AccessWidth::from_index(opcode - 0x44),
                    dst: hi,
                    array: unit2 & 0xff,
                    index: unit2 >> 8,
                }
            }
            0x4b..=0x51 => {
                let unit2 = units.get(pc + 1)?;
                Op::ArrayPut {
                    width: AccessWidth::from_index(opcode - 0x4b),
                    src: hi,
                    array: unit2 & 0xff,
                    index: unit2 >> 8,
                }
            }
            0x52..=0x58 => Op::InstanceGet {
                width: AccessWidth::from_index(opcode - 0x52),
                dst: nib_a,
                object: nib_b,
                field_idx: u32::from(units.get(pc + 1)?),
            },
            0x59..=0x5f => Op::InstancePut {
                width: AccessWidth::from_index(opcode - 0x59),
                src: nib_a,
                object: nib_b,
                field_idx: u32::from(units.get(pc + 1)?),
            },
            0x60..=0x66 => Op::StaticGet {
                width: AccessWidth::from_index(opcode - 0x60),
                dst: hi,
                field_idx: u32::from(units.get(pc + 1)?),
            },
            0x67..=0x6d => Op::StaticPut {
                width: AccessWidth::from_index(opcode - 0x67),
                src: hi,
                field_idx: u32::from(units.get(pc + 1)?),
            },

            0x6e..=0x72 => Op::Invoke {
                kind: invoke_kind(opcode),
                method_idx: u32::from(units.get(pc + 1)?),
                args: regs_35c(&units, pc)?,
            },
            0x74..=0x78 => Op::Invoke {
                kind: invoke_kind(opcode),
                method_idx: u32::from(units.get(pc + 1)?),
                args: regs_3rc(&units, pc)?,
            },

            0x7b..=0x8f => Op::Unary {
                op: UNOPS[(opcode - 0x7b) as usize],
                dst: nib_a,
                src: nib_b,
            },

            0x90..=0xaf => {
                let (arith, kind) = binop_from_index(opcode - 0x90);
                let unit2 = units.get(pc + 1)?;
                Op::Binary {
                    op: arith,
                    kind,
                    dst: hi,
                    a: unit2 & 0xff,
                    b: unit2 >> 8,
                }
            }
            0xb0..=0xcf => {
                let (arith, kind) = binop_from_index(opcode - 0xb0);
                Op::Binary {
                    op: arith,
                    kind,
                    dst: nib_a,
                    a: nib_a,
                    b: nib_b,
                }
            }
            0xd0..=0xd7 => {
                let lit = i32::from(units.get(pc + 1)? as i16);
                let (op, reverse) = lit_arith(opcode - 0xd0);
                Op::BinaryLit {
                    op,
                    dst: nib_a,
                    src: nib_b,
                    lit,
                    reverse,
                }
            }
            0xd8..=0xe2 => {
                let unit2 = units.get(pc + 1)?;
                let lit = i32::from((unit2 >> 8) as u8 as i8);
                let (op, reverse) = lit8_arith(opcode - 0xd8);
                Op::BinaryLit {
                    op,
                    dst: hi,
                    src: unit2 & 0xff,
                    lit,
                    reverse,
                }
            }

            0xfa => Op::InvokePolymorphic {
                method_idx: u32::from(units.get(pc + 1)?),
                proto_idx: u32::from(units.get(pc + 3)?),
                args: regs_35c(&units, pc)?,
            },
            0xfb => Op::InvokePolymorphic {
                method_idx: u32::from(units.get(pc + 1)?),
                proto_idx: u32::from(units.get(pc + 3)?),
                args: regs_3rc(&units, pc)?,
            },
            0xfc => Op::InvokeCustom {
                call_site_idx: u32::from(units.get(pc + 1)?),
                args: regs_35c(&units, pc)?,
            },
            0xfd => Op::InvokeCustom {
                call_site_idx: u32::from(units.get(pc + 1)?),
                args: regs_3rc(&units, pc)?,
            },
            0xfe => Op::ConstMethodHandle {
                dst: hi,
                handle_idx: u32::from(units.get(pc + 1)?),
            },
            0xff => Op::ConstMethodType {
                dst: hi,
                proto_idx: u32::from(units.get(pc + 1)?),
            },

            other => {
                return Err(LiftError::UnknownOpcode {
                    opcode: u16::from(other),
                    offset: pc,
                })
            }
        };

        Ok(Decoded::Insn(Instruction {
            offset: pc,
            opcode,
            units: width,
            op,
        }))
    }
}

/// The move family interleaves kinds with a stride of three opcodes.
fn move_kind(opcode: u8, base: u8) -> MoveKind {
    kind_from_index((opcode - base) / 3)
}

fn kind_from_index(index: u8) -> MoveKind {
    match index {
        0 => MoveKind::Single,
        1 => MoveKind::Wide,
        _ => MoveKind::Object,
    }
}

fn test_kind(index: u8) -> TestKind {
    match index {
        0 => TestKind::Eq,
        1 => TestKind::Ne,
        2 => TestKind::Lt,
        3 => TestKind::Ge,
        4 => TestKind::Gt,
        _ => TestKind::Le,
    }
}

fn lit_arith(index: u8) -> (Arith, bool) {
    match index {
        0 => (Arith::Add, false),
        1 => (Arith::Sub, true), // rsub: lit - reg
        2 => (Arith::Mul, false),
        3 => (Arith::Div, false),
        4 => (Arith::Rem, false),
        5 => (Arith::And, false),
        6 => (Arith::Or, false),
        _ => (Arith::Xor, false),
    }
}

fn lit8_arith(index: u8) -> (Arith, bool) {
    match index {
        0..=7 => lit_arith(index),
        8 => (Arith::Shl, false),
        9 => (Arith::Shr, false),
        _ => (Arith::Ushr, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_return_void() {
        let insns = [0x000e];
        let ops = decode_method(&insns).unwrap();
        assert_eq!(ops.len(), 1);
        assert!(matches!(ops[0].op, Op::ReturnVoid));
        assert_eq!(ops[0].mnemonic(), "return-void");
    }

    #[test]
    fn decode_const4_sign_extension() {
        // const/4 v0, #-1: opcode 0x12, A=0, B=0xf
        let insns = [0xf012, 0x000e];
        let ops = decode_method(&insns).unwrap();
        assert!(matches!(ops[0].op, Op::Const { dst: 0, value: -1 }));
    }

    #[test]
    fn decode_invoke_35c_registers() {
        // invoke-virtual {v1, v2}, method@5
        // unit0: count=2 in A, G=0: 0x2000 | 0x6e
        let insns = [0x206e, 0x0005, 0x0021, 0x000e];
        let ops = decode_method(&insns).unwrap();
        match &ops[0].op {
            Op::Invoke {
                kind,
                method_idx,
                args,
            } => {
                assert_eq!(*kind, InvokeKind::Virtual);
                assert_eq!(*method_idx, 5);
                assert_eq!(args, &vec![1, 2]);
            }
            other => panic!("decoded {other:?}"),
        }
    }

    #[test]
    fn decode_invoke_range() {
        // invoke-static/range {v3..v5}, method@7
        let insns = [0x0377, 0x0007, 0x0003, 0x000e];
        let ops = decode_method(&insns).unwrap();
        match &ops[0].op {
            Op::Invoke { kind, args, .. } => {
                assert_eq!(*kind, InvokeKind::Static);
                assert_eq!(args, &vec![3, 4, 5]);
            }
            other => panic!("decoded {other:?}"),
        }
    }

    #[test]
    fn decode_goto_backwards() {
        // offset 0: nop; offset 1: goto -1
        let insns = [0x0000, 0xff28];
        let ops = decode_method(&insns).unwrap();
        assert!(matches!(ops[1].op, Op::Goto { target: 0 }));
    }

    #[test]
    fn decode_packed_switch() {
        // v0 switch at pc 0, payload at pc 4: keys 10,11 -> targets pc+8, pc+9
        let insns = [
            0x002b, 0x0004, 0x0000, // packed-switch v0, +4
            0x000e, // return-void
            0x0100, 0x0002, // ident, size 2
            0x000a, 0x0000, // first_key 10
            0x0008, 0x0000, // target +8
            0x0009, 0x0000, // target +9
        ];
        let ops = decode_method(&insns).unwrap();
        match &ops[0].op {
            Op::PackedSwitch { src: 0, cases } => {
                assert_eq!(cases, &vec![(10, 8), (11, 9)]);
            }
            other => panic!("decoded {other:?}"),
        }
        // payload skipped: only the two real instructions decode
        assert_eq!(ops.len(), 2);
    }

    #[test]
    fn decode_fill_array_data() {
        let insns = [
            0x0026, 0x0004, 0x0000, // fill-array-data v0, +4
            0x000e, // return-void
            0x0300, 0x0001, // ident, width 1
            0x0003, 0x0000, // size 3
            0x0201, 0x0003, // bytes 1 2 3 (padded)
        ];
        let ops = decode_method(&insns).unwrap();
        match &ops[0].op {
            Op::FillArrayData {
                element_width,
                data,
                ..
            } => {
                assert_eq!(*element_width, 1);
                assert_eq!(data, &vec![1, 2, 3]);
            }
            other => panic!("decoded {other:?}"),
        }
    }

    #[test]
    fn decode_unknown_opcode() {
        let insns = [0x0073];
        assert!(matches!(
            decode_method(&insns),
            Err(LiftError::UnknownOpcode { .. })
        ));
    }

    #[test]
    fn decode_binop_2addr_aliases_dst() {
        // add-int/2addr v1, v2
        let insns = [0x21b0, 0x000e];
        let ops = decode_method(&insns).unwrap();
        match ops[0].op {
            Op::Binary {
                op: Arith::Add,
                kind: NumKind::Int,
                dst,
                a,
                b,
            } => {
                assert_eq!((dst, a, b), (1, 1, 2));
            }
            ref other => panic!("decoded {other:?}"),
        }
    }

    #[test]
    fn decode_rsub_reverses_operands() {
        // rsub-int v0, v1, #5 -> 0xd1, A=0, B=1, lit 5
        let insns = [0x10d1, 0x0005, 0x000e];
        let ops = decode_method(&insns).unwrap();
        match ops[0].op {
            Op::BinaryLit {
                op: Arith::Sub,
                reverse: true,
                dst: 0,
                src: 1,
                lit: 5,
            } => {}
            ref other => panic!("decoded {other:?}"),
        }
    }
}
