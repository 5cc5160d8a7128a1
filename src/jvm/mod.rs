//! The JVM class-file pipeline: container parser, bytecode lifter and
//! source writer. Conceptually the same shape as the DEX pipeline, one
//! class per file and a stack machine instead of registers.

pub mod class_file;
pub mod code;
pub mod source;
