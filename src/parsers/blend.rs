//! The outer layout of a .blend file: the 12-byte file header and the
//! sequence of length-prefixed blocks that follows it.
//!
//! The block scan runs exactly once per opened file. It records where every
//! block's payload lives (the payload itself is decoded lazily, on demand)
//! and builds the address table that pointer resolution relies on. The one
//! block tagged `DNA1` is handed to the schema parser instead of being
//! indexed; the scan stops at the `ENDB` sentinel.

use super::{
    cursor::ByteCursor,
    dna::SchemaCatalog,
    BlendError, Endianness, NomResult, PointerSize, Result,
};
use nom::{
    branch::alt,
    bytes::complete::{tag, take},
    Err,
};
use std::collections::HashMap;

/// Byte length of the file header: 7-byte magic + pointer-size char +
/// endianness char + 3 version digits.
pub const HEADER_LEN: usize = 12;

/// Code of the terminal sentinel block.
pub const CODE_ENDB: [u8; 4] = *b"ENDB";
/// Code of the schema block.
pub const CODE_DNA1: [u8; 4] = *b"DNA1";

/// The decoded file header. Created once at stream construction and
/// immutable thereafter.
#[derive(Debug, Clone)]
pub struct Header {
    /// The size of the pointer on the machine used to save the blend file.
    pub pointer_size: PointerSize,
    /// The endianness on the machine used to save the blend file.
    pub endianness: Endianness,
    /// The version of Blender used to save the blend file, e.g. `*b"279"`.
    pub version: [u8; 3],
}

fn pointer_size_bits32(input: &[u8]) -> NomResult<PointerSize> {
    let (input, _) = tag("_")(input)?;
    Ok((input, PointerSize::Bits32))
}

fn pointer_size_bits64(input: &[u8]) -> NomResult<PointerSize> {
    let (input, _) = tag("-")(input)?;
    Ok((input, PointerSize::Bits64))
}

fn pointer_size(input: &[u8]) -> NomResult<PointerSize> {
    alt((pointer_size_bits32, pointer_size_bits64))(input).map_err(|_: Err<BlendError>| {
        Err::Failure(BlendError::FileFormat(
            "pointer-size flag is neither '_' (4 bytes) nor '-' (8 bytes)".to_owned(),
        ))
    })
}

fn endianness_little(input: &[u8]) -> NomResult<Endianness> {
    let (input, _) = tag("v")(input)?;
    Ok((input, Endianness::Little))
}

fn endianness_big(input: &[u8]) -> NomResult<Endianness> {
    let (input, _) = tag("V")(input)?;
    Ok((input, Endianness::Big))
}

fn endianness(input: &[u8]) -> NomResult<Endianness> {
    alt((endianness_little, endianness_big))(input).map_err(|_: Err<BlendError>| {
        Err::Failure(BlendError::FileFormat(
            "endianness flag is neither 'v' (little) nor 'V' (big)".to_owned(),
        ))
    })
}

fn version(input: &[u8]) -> NomResult<[u8; 3]> {
    let (input, v) = take(3_usize)(input).map_err(|_: Err<BlendError>| {
        Err::Failure(BlendError::FileFormat(
            "header is truncated before the 3-byte version".to_owned(),
        ))
    })?;
    Ok((input, [v[0], v[1], v[2]]))
}

/// Parses the 12-byte file header. Any violation is a fatal
/// [`BlendError::FileFormat`]; the gzip fallback in `ByteCursor` keys off
/// this failure.
pub fn header(input: &[u8]) -> NomResult<Header> {
    let (input, _) = tag("BLENDER")(input).map_err(|_: Err<BlendError>| {
        Err::Failure(BlendError::FileFormat(
            "file does not start with the \"BLENDER\" magic".to_owned(),
        ))
    })?;
    let (input, pointer_size) = pointer_size(input)?;
    let (input, endianness) = endianness(input)?;
    let (input, version) = version(input)?;

    Ok((
        input,
        Header {
            pointer_size,
            endianness,
            version,
        },
    ))
}

/// One length-prefixed record in the file. Only the header fields and the
/// payload's file offset are kept; payload bytes are decoded on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    /// 4-byte block code, e.g. `b"DATA"` or `b"OB\0\0"`.
    pub code: [u8; 4],
    /// Declared payload length in bytes.
    pub size: usize,
    /// The address this block's data lived at in the process that wrote the
    /// file. Pointer fields refer to blocks through these addresses.
    pub old_address: u64,
    /// Index into the schema catalog's structure-template list.
    pub sdna_index: usize,
    /// Number of consecutive records stored in the payload.
    pub count: usize,
    /// File offset where the payload begins.
    pub payload_position: usize,
}

impl Block {
    pub fn is_last(&self) -> bool {
        self.code == CODE_ENDB
    }

    pub fn is_dna(&self) -> bool {
        self.code == CODE_DNA1
    }

    /// Root blocks carry a two-letter code (`"OB"`, `"ME"`, ...) padded with
    /// zero bytes; their `sdna_index` is always valid.
    pub fn is_root(&self) -> bool {
        self.code[2] == 0 && self.code[3] == 0
    }

    /// The two-letter code of a root block.
    pub fn two_letter_code(&self) -> [u8; 2] {
        [self.code[0], self.code[1]]
    }
}

/// The result of the one-shot full-file scan: every block except `DNA1` and
/// `ENDB`, plus a lookup table keyed by old memory address.
#[derive(Debug)]
pub struct BlockIndex {
    blocks: Vec<Block>,
    by_address: HashMap<u64, usize>,
}

impl BlockIndex {
    /// Scans the block sequence from the cursor's current position (just
    /// past the file header) up to the `ENDB` sentinel. The `DNA1` payload
    /// is parsed into the returned [`SchemaCatalog`] in place; every other
    /// payload is skipped over.
    pub fn scan(cursor: &mut ByteCursor) -> Result<(BlockIndex, SchemaCatalog)> {
        let mut blocks = Vec::new();
        let mut by_address = HashMap::new();
        let mut catalog = None;

        loop {
            let code = {
                let raw = cursor.read_bytes(4)?;
                [raw[0], raw[1], raw[2], raw[3]]
            };
            if code == CODE_ENDB {
                break;
            }

            let size = cursor.read_u32()? as usize;
            let old_address = cursor.read_pointer()?;
            let sdna_index = cursor.read_u32()? as usize;
            let count = cursor.read_u32()? as usize;
            let payload_position = cursor.position();

            let block = Block {
                code,
                size,
                old_address,
                sdna_index,
                count,
                payload_position,
            };

            if block.is_dna() {
                if catalog.is_some() {
                    return Err(BlendError::SchemaCorruption(
                        "more than one DNA1 block in file".to_owned(),
                    ));
                }
                catalog = Some(SchemaCatalog::parse(cursor)?);
            } else {
                if old_address != 0
                    && by_address.insert(old_address, blocks.len()).is_some()
                {
                    return Err(BlendError::FileFormat(format!(
                        "two blocks share the old memory address {:#x}",
                        old_address
                    )));
                }
                blocks.push(block);
            }

            cursor.set_position(payload_position + size)?;
        }

        let catalog = catalog.ok_or_else(|| {
            BlendError::SchemaCorruption("no DNA1 block found before ENDB".to_owned())
        })?;

        Ok((
            BlockIndex {
                blocks,
                by_address,
            },
            catalog,
        ))
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Resolves an old memory address to the block written from it.
    pub fn by_address(&self, address: u64) -> Option<&Block> {
        self.by_address.get(&address).map(|&i| &self.blocks[i])
    }
}
