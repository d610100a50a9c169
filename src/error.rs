//! Error type shared by every stage, from ELF parsing to live memory access.

use crate::TypeId;

/// Everything that can go wrong while analyzing a binary or touching a live
/// process.
///
/// Only `UnresolvedType` is routinely recovered from (by skipping the field or
/// variable in question); the rest are surfaced to the caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The binary is not an object file we understand, or it has no debug
    /// info to speak of.
    #[error("bad binary format: {0}")]
    Format(String),

    #[error("debug info could not be decoded: {0}")]
    Dwarf(#[from] gimli::Error),

    /// Neither `.symtab` nor `.dynsym` is present.
    #[error("no symbol table (.symtab or .dynsym) in binary")]
    SymbolTableUnavailable,

    #[error("type reference {0:x?} does not resolve")]
    UnresolvedType(TypeId),

    /// A structure contains itself, directly or through other structures or
    /// aliases.
    #[error("type {0:x?} refers back to itself")]
    CyclicType(TypeId),

    #[error("type nesting deeper than {limit} levels at {path}")]
    NestingTooDeep { path: String, limit: usize },

    #[error("no running process named {0:?}")]
    ProcessNotFound(String),

    #[error("{name:?} matches several processes: {pids:?}")]
    AmbiguousProcess { name: String, pids: Vec<u32> },

    /// A line of the memory map listing had an address range we could not
    /// parse. The offending line is included verbatim.
    #[error("malformed memory map line: {line:?}")]
    MapParse { line: String },

    /// The process exists, but nothing in its memory map belongs to the
    /// binary (or the binary has no writable mapping).
    #[error("process {pid} has no writable mapping of {binary:?}")]
    ImageNotFound { pid: u32, binary: String },

    #[error(
        "access of {len} bytes at {addr:#x} is outside the mapped window \
         {start:#x}..{end:#x}"
    )]
    OutOfRange {
        addr: u64,
        len: usize,
        start: u64,
        end: u64,
    },

    /// The remote transfer moved fewer bytes than asked for. Callers may
    /// retry the remainder; nothing here retries on its own.
    #[error("short transfer at {addr:#x}: {transferred} of {requested} bytes")]
    ShortTransfer {
        addr: u64,
        requested: usize,
        transferred: usize,
    },

    /// A value to be written doesn't fit the field's type, or the type isn't
    /// one we can encode.
    #[error("cannot encode {value} as {type_name}")]
    Unencodable { value: String, type_name: String },

    /// Accessor used while closed.
    #[error("memory accessor is not open")]
    NotOpen,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<object::read::Error> for Error {
    fn from(e: object::read::Error) -> Self {
        Self::Format(e.to_string())
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(e: nix::errno::Errno) -> Self {
        Self::Io(e.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
