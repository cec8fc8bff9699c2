pub mod blend;
pub mod cursor;
pub mod dna;
pub mod field;
pub mod primitive;

use nom::error::{ErrorKind, ParseError};
use std::io;
use thiserror::Error;

pub(crate) type NomResult<'a, T> = nom::IResult<&'a [u8], T, BlendError>;

pub type Result<T> = std::result::Result<T, BlendError>;

/// Size of a pointer on the machine used to create the .blend file.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PointerSize {
    Bits32,
    Bits64,
}

impl PointerSize {
    /// Returns the pointer size in bytes.
    pub fn bytes_num(self) -> usize {
        match self {
            PointerSize::Bits32 => 4,
            PointerSize::Bits64 => 8,
        }
    }
}

/// Endianness of the machine used to create the .blend file.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Endianness {
    Little,
    Big,
}

/// Everything that can go wrong while opening or decoding a .blend file.
///
/// All of these are fatal at the point they are raised: there is no retry or
/// partial-import policy. A file that fails to open failed to open.
#[derive(Debug, Error)]
pub enum BlendError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// The file ended before the data being read was complete.
    #[error("unexpected end of data")]
    NotEnoughData,
    /// The 12-byte file header is malformed: wrong magic, an invalid
    /// pointer-size or endianness character, or a truncated header.
    #[error("invalid file header: {0}")]
    FileFormat(String),
    /// The raw bytes were not a valid header and were not valid gzip either.
    #[error("gzip fallback failed: {0}")]
    Decompression(String),
    /// A structural expectation inside the DNA1 block was violated: a tag
    /// mismatch, a non-positive count, an out-of-range table index or a
    /// duplicate structure name.
    #[error("corrupt SDNA block: {0}")]
    SchemaCorruption(String),
    /// A field's declared type is neither a known primitive nor a structure
    /// present in the schema, and the field is not a pointer.
    #[error("field type '{0}' is neither a primitive nor a known structure")]
    UnknownType(String),
    /// A non-null pointer whose address matches no block in the file.
    #[error("no block found at address {0:#x}")]
    InvalidPointer(u64),
    /// Raised by callers that treat a null address as exceptional. The
    /// resolver itself returns an empty sequence for null pointers.
    #[error("attempted to dereference a null pointer")]
    NullPointer,
    /// A `DynamicArray` was indexed with a position of the wrong
    /// dimensionality or with an out-of-range component.
    #[error("array position is out of range: expected {expected}, got {got}")]
    IndexOutOfRange { expected: usize, got: usize },
    /// An operation was called on a value in the wrong state, e.g. reading a
    /// record's old memory address before it was filled, or walking a
    /// `ListBase` on a record of another type.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Structure nesting exceeded the decode depth limit. Real files stay
    /// far below the limit; hitting it means the schema is degenerate.
    #[error("decode recursion limit exceeded")]
    RecursionLimit,
    #[error("parse error: {0:?}")]
    Nom(ErrorKind),
}

impl ParseError<&[u8]> for BlendError {
    fn from_error_kind(_input: &[u8], kind: ErrorKind) -> Self {
        BlendError::Nom(kind)
    }

    fn append(_input: &[u8], _kind: ErrorKind, other: Self) -> Self {
        other
    }
}

impl ParseError<&str> for BlendError {
    fn from_error_kind(_input: &str, kind: ErrorKind) -> Self {
        BlendError::Nom(kind)
    }

    fn append(_input: &str, _kind: ErrorKind, other: Self) -> Self {
        other
    }
}

/// Collapses a nom result into a plain `Result`, discarding leftover input.
pub(crate) fn finish<T>(res: NomResult<T>) -> Result<T> {
    match res {
        Ok((_, v)) => Ok(v),
        Err(nom::Err::Failure(e)) | Err(nom::Err::Error(e)) => Err(e),
        Err(nom::Err::Incomplete(..)) => Err(BlendError::NotEnoughData),
    }
}
