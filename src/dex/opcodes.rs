//! The fixed Dalvik opcode table: value -> mnemonic, encoding format,
//! reference kind and behavior flags. Format names follow the DEX
//! instruction-formats document (`10x`, `22c`, `3rc`, ...).

use bitflags::bitflags;
use once_cell::sync::Lazy;

/// Instruction encoding formats. The digit prefix is the size in 16-bit
/// code units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    F10x,
    F12x,
    F11n,
    F11x,
    F10t,
    F20t,
    F20bc,
    F22x,
    F21t,
    F21s,
    F21h,
    F21c,
    F23x,
    F22b,
    F22t,
    F22s,
    F22c,
    F30t,
    F32x,
    F31i,
    F31t,
    F31c,
    F35c,
    F3rc,
    F45cc,
    F4rcc,
    F51l,
}

impl Format {
    /// Instruction width in 16-bit code units.
    pub fn units(self) -> usize {
        match self {
            Format::F10x | Format::F12x | Format::F11n | Format::F11x | Format::F10t => 1,
            Format::F20t
            | Format::F20bc
            | Format::F22x
            | Format::F21t
            | Format::F21s
            | Format::F21h
            | Format::F21c
            | Format::F23x
            | Format::F22b
            | Format::F22t
            | Format::F22s
            | Format::F22c => 2,
            Format::F30t
            | Format::F32x
            | Format::F31i
            | Format::F31t
            | Format::F31c
            | Format::F35c
            | Format::F3rc => 3,
            Format::F45cc | Format::F4rcc => 4,
            Format::F51l => 5,
        }
    }
}

/// What an instruction's constant-pool operand refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceType {
    None,
    String,
    Type,
    Field,
    Method,
    CallSite,
    MethodProto,
    MethodHandle,
}

bitflags! {
    pub struct OpcodeFlags: u32 {
        const CAN_THROW = 0x1;
        const CAN_CONTINUE = 0x2;
        const SETS_REGISTER = 0x4;
        const SETS_WIDE_REGISTER = 0x8;
        const SETS_RESULT = 0x10;
        const BRANCHES = 0x20;
        const SWITCHES = 0x40;
        const RETURNS = 0x80;
    }
}

pub struct OpcodeInfo {
    pub name: &'static str,
    pub format: Format,
    pub reference: ReferenceType,
    pub flags: OpcodeFlags,
}

/// Payload pseudo-op idents, distinguished by the full first code unit.
pub const PACKED_SWITCH_PAYLOAD: u16 = 0x0100;
pub const SPARSE_SWITCH_PAYLOAD: u16 = 0x0200;
pub const FILL_ARRAY_DATA_PAYLOAD: u16 = 0x0300;

const UNOP_NAMES: [&str; 21] = [
    "neg-int",
    "not-int",
    "neg-long",
    "not-long",
    "neg-float",
    "neg-double",
    "int-to-long",
    "int-to-float",
    "int-to-double",
    "long-to-int",
    "long-to-float",
    "long-to-double",
    "float-to-int",
    "float-to-long",
    "float-to-double",
    "double-to-int",
    "double-to-long",
    "double-to-float",
    "int-to-byte",
    "int-to-char",
    "int-to-short",
];

const BINOP_NAMES: [&str; 32] = [
    "add-int",
    "sub-int",
    "mul-int",
    "div-int",
    "rem-int",
    "and-int",
    "or-int",
    "xor-int",
    "shl-int",
    "shr-int",
    "ushr-int",
    "add-long",
    "sub-long",
    "mul-long",
    "div-long",
    "rem-long",
    "and-long",
    "or-long",
    "xor-long",
    "shl-long",
    "shr-long",
    "ushr-long",
    "add-float",
    "sub-float",
    "mul-float",
    "div-float",
    "rem-float",
    "add-double",
    "sub-double",
    "mul-double",
    "div-double",
    "rem-double",
];

const BINOP_2ADDR_NAMES: [&str; 32] = [
    "add-int/2addr",
    "sub-int/2addr",
    "mul-int/2addr",
    "div-int/2addr",
    "rem-int/2addr",
    "and-int/2addr",
    "or-int/2addr",
    "xor-int/2addr",
    "shl-int/2addr",
    "shr-int/2addr",
    "ushr-int/2addr",
    "add-long/2addr",
    "sub-long/2addr",
    "mul-long/2addr",
    "div-long/2addr",
    "rem-long/2addr",
    "and-long/2addr",
    "or-long/2addr",
    "xor-long/2addr",
    "shl-long/2addr",
    "shr-long/2addr",
    "ushr-long/2addr",
    "add-float/2addr",
    "sub-float/2addr",
    "mul-float/2addr",
    "div-float/2addr",
    "rem-float/2addr",
    "add-double/2addr",
    "sub-double/2addr",
    "mul-double/2addr",
    "div-double/2addr",
    "rem-double/2addr",
];

const LIT16_NAMES: [&str; 8] = [
    "add-int/lit16",
    "rsub-int",
    "mul-int/lit16",
    "div-int/lit16",
    "rem-int/lit16",
    "and-int/lit16",
    "or-int/lit16",
    "xor-int/lit16",
];

const LIT8_NAMES: [&str; 11] = [
    "add-int/lit8",
    "rsub-int/lit8",
    "mul-int/lit8",
    "div-int/lit8",
    "rem-int/lit8",
    "and-int/lit8",
    "or-int/lit8",
    "xor-int/lit8",
    "shl-int/lit8",
    "shr-int/lit8",
    "ushr-int/lit8",
];

const IF_NAMES: [&str; 6] = ["if-eq", "if-ne", "if-lt", "if-ge", "if-gt", "if-le"];
const IFZ_NAMES: [&str; 6] = ["if-eqz", "if-nez", "if-ltz", "if-gez", "if-gtz", "if-lez"];

static OPCODES: Lazy<Vec<Option<OpcodeInfo>>> = Lazy::new(|| {
    let mut table: Vec<Option<OpcodeInfo>> = (0..256).map(|_| None).collect();
    {
        let mut def = |value: u8,
                       name: &'static str,
                       format: Format,
                       reference: ReferenceType,
                       flags: OpcodeFlags| {
            table[value as usize] = Some(OpcodeInfo {
                name,
                format,
                reference,
                flags,
            });
        };

        let cont = OpcodeFlags::CAN_CONTINUE;
        let sets = OpcodeFlags::CAN_CONTINUE | OpcodeFlags::SETS_REGISTER;
        let sets_wide = sets | OpcodeFlags::SETS_WIDE_REGISTER;
        let throw_sets = sets | OpcodeFlags::CAN_THROW;

        def(0x00, "nop", Format::F10x, ReferenceType::None, cont);

        def(0x01, "move", Format::F12x, ReferenceType::None, sets);
        def(0x02, "move/from16", Format::F22x, ReferenceType::None, sets);
        def(0x03, "move/16", Format::F32x, ReferenceType::None, sets);
        def(0x04, "move-wide", Format::F12x, ReferenceType::None, sets_wide);
        def(0x05, "move-wide/from16", Format::F22x, ReferenceType::None, sets_wide);
        def(0x06, "move-wide/16", Format::F32x, ReferenceType::None, sets_wide);
        def(0x07, "move-object", Format::F12x, ReferenceType::None, sets);
        def(0x08, "move-object/from16", Format::F22x, ReferenceType::None, sets);
        def(0x09, "move-object/16", Format::F32x, ReferenceType::None, sets);
        def(0x0a, "move-result", Format::F11x, ReferenceType::None, sets);
        def(0x0b, "move-result-wide", Format::F11x, ReferenceType::None, sets_wide);
        def(0x0c, "move-result-object", Format::F11x, ReferenceType::None, sets);
        def(0x0d, "move-exception", Format::F11x, ReferenceType::None, sets);

        let ret = OpcodeFlags::RETURNS;
        def(0x0e, "return-void", Format::F10x, ReferenceType::None, ret);
        def(0x0f, "return", Format::F11x, ReferenceType::None, ret);
        def(0x10, "return-wide", Format::F11x, ReferenceType::None, ret);
        def(0x11, "return-object", Format::F11x, ReferenceType::None, ret);

        def(0x12, "const/4", Format::F11n, ReferenceType::None, sets);
        def(0x13, "const/16", Format::F21s, ReferenceType::None, sets);
        def(0x14, "const", Format::F31i, ReferenceType::None, sets);
        def(0x15, "const/high16", Format::F21h, ReferenceType::None, sets);
        def(0x16, "const-wide/16", Format::F21s, ReferenceType::None, sets_wide);
        def(0x17, "const-wide/32", Format::F31i, ReferenceType::None, sets_wide);
        def(0x18, "const-wide", Format::F51l, ReferenceType::None, sets_wide);
        def(0x19, "const-wide/high16", Format::F21h, ReferenceType::None, sets_wide);
        def(0x1a, "const-string", Format::F21c, ReferenceType::String, throw_sets);
        def(0x1b, "const-string/jumbo", Format::F31c, ReferenceType::String, throw_sets);
        def(0x1c, "const-class", Format::F21c, ReferenceType::Type, throw_sets);

        def(0x1d, "monitor-enter", Format::F11x, ReferenceType::None, cont | OpcodeFlags::CAN_THROW);
        def(0x1e, "monitor-exit", Format::F11x, ReferenceType::None, cont | OpcodeFlags::CAN_THROW);
        def(0x1f, "check-cast", Format::F21c, ReferenceType::Type, throw_sets);
        def(0x20, "instance-of", Format::F22c, ReferenceType::Type, throw_sets);
        def(0x21, "array-length", Format::F12x, ReferenceType::None, throw_sets);
        def(0x22, "new-instance", Format::F21c, ReferenceType::Type, throw_sets);
        def(0x23, "new-array", Format::F22c, ReferenceType::Type, throw_sets);

        let invoke = cont | OpcodeFlags::CAN_THROW | OpcodeFlags::SETS_RESULT;
        def(0x24, "filled-new-array", Format::F35c, ReferenceType::Type, invoke);
        def(0x25, "filled-new-array/range", Format::F3rc, ReferenceType::Type, invoke);
        def(0x26, "fill-array-data", Format::F31t, ReferenceType::None, cont | OpcodeFlags::CAN_THROW);
        def(0x27, "throw", Format::F11x, ReferenceType::None, OpcodeFlags::CAN_THROW);

        let branch = OpcodeFlags::BRANCHES;
        def(0x28, "goto", Format::F10t, ReferenceType::None, branch);
        def(0x29, "goto/16", Format::F20t, ReferenceType::None, branch);
        def(0x2a, "goto/32", Format::F30t, ReferenceType::None, branch);
        def(0x2b, "packed-switch", Format::F31t, ReferenceType::None, cont | OpcodeFlags::SWITCHES);
        def(0x2c, "sparse-switch", Format::F31t, ReferenceType::None, cont | OpcodeFlags::SWITCHES);

        def(0x2d, "cmpl-float", Format::F23x, ReferenceType::None, sets);
        def(0x2e, "cmpg-float", Format::F23x, ReferenceType::None, sets);
        def(0x2f, "cmpl-double", Format::F23x, ReferenceType::None, sets);
        def(0x30, "cmpg-double", Format::F23x, ReferenceType::None, sets);
        def(0x31, "cmp-long", Format::F23x, ReferenceType::None, sets);

        for (i, name) in IF_NAMES.iter().enumerate() {
            def(0x32 + i as u8, name, Format::F22t, ReferenceType::None, cont | branch);
        }
        for (i, name) in IFZ_NAMES.iter().enumerate() {
            def(0x38 + i as u8, name, Format::F21t, ReferenceType::None, cont | branch);
        }

        // 0x3e..0x43 unused

        for i in 0..7u8 {
            let wide = if i == 1 {
                OpcodeFlags::SETS_WIDE_REGISTER
            } else {
                OpcodeFlags::empty()
            };
            let put = cont | OpcodeFlags::CAN_THROW;
            let ix = i as usize;
            def(0x44 + i, AGET_NAMES[ix], Format::F23x, ReferenceType::None, throw_sets | wide);
            def(0x4b + i, APUT_NAMES[ix], Format::F23x, ReferenceType::None, put);
            def(0x52 + i, IGET_NAMES[ix], Format::F22c, ReferenceType::Field, throw_sets | wide);
            def(0x59 + i, IPUT_NAMES[ix], Format::F22c, ReferenceType::Field, put);
            def(0x60 + i, SGET_NAMES[ix], Format::F21c, ReferenceType::Field, throw_sets | wide);
            def(0x67 + i, SPUT_NAMES[ix], Format::F21c, ReferenceType::Field, put);
        }

        def(0x6e, "invoke-virtual", Format::F35c, ReferenceType::Method, invoke);
        def(0x6f, "invoke-super", Format::F35c, ReferenceType::Method, invoke);
        def(0x70, "invoke-direct", Format::F35c, ReferenceType::Method, invoke);
        def(0x71, "invoke-static", Format::F35c, ReferenceType::Method, invoke);
        def(0x72, "invoke-interface", Format::F35c, ReferenceType::Method, invoke);
        // 0x73 unused
        def(0x74, "invoke-virtual/range", Format::F3rc, ReferenceType::Method, invoke);
        def(0x75, "invoke-super/range", Format::F3rc, ReferenceType::Method, invoke);
        def(0x76, "invoke-direct/range", Format::F3rc, ReferenceType::Method, invoke);
        def(0x77, "invoke-static/range", Format::F3rc, ReferenceType::Method, invoke);
        def(0x78, "invoke-interface/range", Format::F3rc, ReferenceType::Method, invoke);
        // 0x79, 0x7a unused

        for (i, name) in UNOP_NAMES.iter().enumerate() {
            let wide = matches!(i, 2 | 3 | 5 | 6 | 8 | 11 | 13 | 14 | 16);
            let flags = if wide { sets_wide } else { sets };
            def(0x7b + i as u8, name, Format::F12x, ReferenceType::None, flags);
        }

        for (i, name) in BINOP_NAMES.iter().enumerate() {
            let wide = (11..22).contains(&i) || (27..32).contains(&i);
            let div = matches!(i, 3 | 4 | 14 | 15);
            let mut flags = if wide { sets_wide } else { sets };
            if div {
                flags |= OpcodeFlags::CAN_THROW;
            }
            def(0x90 + i as u8, name, Format::F23x, ReferenceType::None, flags);
        }
        for (i, name) in BINOP_2ADDR_NAMES.iter().enumerate() {
            let wide = (11..22).contains(&i) || (27..32).contains(&i);
            let div = matches!(i, 3 | 4 | 14 | 15);
            let mut flags = if wide { sets_wide } else { sets };
            if div {
                flags |= OpcodeFlags::CAN_THROW;
            }
            def(0xb0 + i as u8, name, Format::F12x, ReferenceType::None, flags);
        }
        for (i, name) in LIT16_NAMES.iter().enumerate() {
            let mut flags = sets;
            if matches!(i, 3 | 4) {
                flags |= OpcodeFlags::CAN_THROW;
            }
            def(0xd0 + i as u8, name, Format::F22s, ReferenceType::None, flags);
        }
        for (i, name) in LIT8_NAMES.iter().enumerate() {
            let mut flags = sets;
            if matches!(i, 3 | 4) {
                flags |= OpcodeFlags::CAN_THROW;
            }
            def(0xd8 + i as u8, name, Format::F22b, ReferenceType::None, flags);
        }

        // 0xe3..0xf9 unused in current dex versions
        def(0xfa, "invoke-polymorphic", Format::F45cc, ReferenceType::Method, invoke);
        def(0xfb, "invoke-polymorphic/range", Format::F4rcc, ReferenceType::Method, invoke);
        def(0xfc, "invoke-custom", Format::F35c, ReferenceType::CallSite, invoke);
        def(0xfd, "invoke-custom/range", Format::F3rc, ReferenceType::CallSite, invoke);
        def(0xfe, "const-method-handle", Format::F21c, ReferenceType::MethodHandle, throw_sets);
        def(0xff, "const-method-type", Format::F21c, ReferenceType::MethodProto, throw_sets);
    }
    table
});

const AGET_NAMES: [&str; 7] = [
    "aget",
    "aget-wide",
    "aget-object",
    "aget-boolean",
    "aget-byte",
    "aget-char",
    "aget-short",
];
const APUT_NAMES: [&str; 7] = [
    "aput",
    "aput-wide",
    "aput-object",
    "aput-boolean",
    "aput-byte",
    "aput-char",
    "aput-short",
];
const IGET_NAMES: [&str; 7] = [
    "iget",
    "iget-wide",
    "iget-object",
    "iget-boolean",
    "iget-byte",
    "iget-char",
    "iget-short",
];
const IPUT_NAMES: [&str; 7] = [
    "iput",
    "iput-wide",
    "iput-object",
    "iput-boolean",
    "iput-byte",
    "iput-char",
    "iput-short",
];
const SGET_NAMES: [&str; 7] = [
    "sget",
    "sget-wide",
    "sget-object",
    "sget-boolean",
    "sget-byte",
    "sget-char",
    "sget-short",
];
const SPUT_NAMES: [&str; 7] = [
    "sput",
    "sput-wide",
    "sput-object",
    "sput-boolean",
    "sput-byte",
    "sput-char",
    "sput-short",
];

/// Table lookup; `None` for unassigned opcode values.
pub fn opcode_info(value: u8) -> Option<&'static OpcodeInfo> {
    OPCODES[value as usize].as_ref()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_entries() {
        assert_eq!(opcode_info(0x00).unwrap().name, "nop");
        assert_eq!(opcode_info(0x0e).unwrap().name, "return-void");
        assert_eq!(opcode_info(0x6e).unwrap().name, "invoke-virtual");
        assert_eq!(opcode_info(0x6e).unwrap().format, Format::F35c);
        assert_eq!(opcode_info(0xaf).unwrap().name, "rem-double");
        assert_eq!(opcode_info(0xcf).unwrap().name, "rem-double/2addr");
        assert_eq!(opcode_info(0xe2).unwrap().name, "ushr-int/lit8");
        assert_eq!(opcode_info(0xff).unwrap().name, "const-method-type");
    }

    #[test]
    fn unused_values_are_none() {
        for v in [0x3eu8, 0x43, 0x73, 0x79, 0x7a, 0xe3, 0xf9] {
            assert!(opcode_info(v).is_none(), "{v:#04x} should be unassigned");
        }
    }

    #[test]
    fn format_units() {
        assert_eq!(Format::F10x.units(), 1);
        assert_eq!(Format::F21c.units(), 2);
        assert_eq!(Format::F35c.units(), 3);
        assert_eq!(Format::F45cc.units(), 4);
        assert_eq!(Format::F51l.units(), 5);
    }

    #[test]
    fn field_ops_reference_fields() {
        assert_eq!(opcode_info(0x52).unwrap().reference, ReferenceType::Field);
        assert_eq!(opcode_info(0x60).unwrap().reference, ReferenceType::Field);
        assert_eq!(opcode_info(0x1a).unwrap().reference, ReferenceType::String);
    }
}
