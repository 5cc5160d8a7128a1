//! The Dalvik (DEX) container: header, interned pools, class model,
//! opcode table and instruction decoder.

pub mod class;
pub mod header;
pub mod image;
pub mod insns;
pub mod opcodes;
pub mod values;
