//! A reflective parser for Blender's .blend files.
//!
//! A .blend file is a memory dump: the writing process serializes its data
//! structures verbatim, prefixes each with a small block header, and appends
//! a `DNA1` block describing the layout of every structure in the dump. This
//! crate reads that embedded schema first and then decodes every other block
//! against it, so no Blender version needs to be known at compile time.
//!
//! Opening a file yields a [`Blend`] handle. Blocks are enumerated eagerly
//! but decoded lazily; pointer fields resolve through the block index on
//! demand.
//!
//! ```no_run
//! use blend_dna::Blend;
//!
//! let mut blend = Blend::from_path("scene.blend")?;
//!
//! for block in blend.blocks_by_code(*b"OB") {
//!     let object = blend.decode_block(block)?.remove(0);
//!     // An object's name lives in its nested `ID` struct; the flat
//!     // lookup reaches it.
//!     println!("{:?}: {:?}", object.flat_field("name"), object.get_f32_vec("loc")?);
//! }
//! # Ok::<(), blend_dna::BlendError>(())
//! ```
//!
//! Gzip-compressed files are detected and inflated transparently. Both
//! pointer sizes and both endiannesses are supported; the flags in the file
//! header decide how every multi-byte value is read.

pub mod parsers;
pub mod runtime;

pub use crate::parsers::{
    blend::{Block, Header},
    cursor::ByteCursor,
    dna::SchemaCatalog,
    BlendError, Endianness, PointerSize, Result,
};
pub use crate::runtime::{Blend, DynamicArray, FieldValue, PointerHandle, RecordInstance};
