//! Error kinds, layered by blast radius: input errors abort the process,
//! format errors abort one archive entry, lift errors abort one method.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// The input path itself is unusable. Fatal for the whole run.
#[derive(Debug, Error)]
pub enum InputError {
    #[error("cannot open {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{path} is not a valid Java class/JAR/DEX/APK file")]
    UnknownMagic { path: PathBuf },
}

/// A container (DEX or class file) violates its format. Fatal for that
/// entry; sibling entries in an archive keep going.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("unexpected end of data at offset {offset:#x}, needed {needed} more byte(s)")]
    Truncated { offset: usize, needed: usize },

    #[error("bad encoding at offset {offset:#x}: {reason}")]
    BadEncoding { offset: usize, reason: String },

    #[error("bad magic {found:02x?}")]
    BadMagic { found: Vec<u8> },

    #[error("big-endian images are not supported (endian tag {tag:#010x})")]
    WrongEndian { tag: u32 },

    #[error("header size {size:#x}, expected {expected:#x}")]
    BadHeaderSize { size: u32, expected: u32 },

    #[error("{section} section ({count} entries at {offset:#x}) runs past file size {file_size:#x}")]
    SectionBounds {
        section: &'static str,
        offset: u32,
        count: u32,
        file_size: u32,
    },

    #[error("{pool} index {index} out of range (pool size {size})")]
    BadIndex {
        pool: &'static str,
        index: usize,
        size: usize,
    },

    #[error("malformed class file: {0}")]
    ClassFile(String),
}

/// One method could not be lifted. The method becomes a commented stub;
/// the surrounding class keeps going.
#[derive(Debug, Error)]
pub enum LiftError {
    #[error("unknown opcode {opcode:#06x} at code offset {offset:#x}")]
    UnknownOpcode { opcode: u16, offset: usize },

    #[error("instruction stream truncated at code offset {offset:#x}")]
    TruncatedCode { offset: usize },

    #[error("bad payload at code offset {offset:#x}: {reason}")]
    BadPayload { offset: usize, reason: String },

    #[error("inconsistent control flow at code offset {offset:#x}: {reason}")]
    Cfg { offset: usize, reason: String },
}

/// Failure of a single class-level task. Logged; peers continue.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Format(#[from] FormatError),

    #[error(transparent)]
    Io(#[from] io::Error),
}
