//! Parser for the decorated field names stored in the DNA names table.
//!
//! A name like `*next` declares one level of pointer indirection, `**mat[4]`
//! declares an array of four pointer-to-pointers, `(*func)()` a function
//! pointer and `mat[4][4]` a two-dimensional array. The residual identifier
//! after stripping the decorations is the name used for field lookup.

use super::BlendError;
use nom::{
    branch::alt,
    bytes::complete::{tag, take_till, take_until},
    combinator::complete,
    multi::{many0, many1},
    sequence::delimited,
    Err, IResult,
};

type Result<'a, T> = IResult<&'a str, T, BlendError>;

/// The shape of a field, derived from its decorated name. A field is exactly
/// one of: a plain value, a fixed-size array of values, a pointer, a
/// fixed-size array of pointers, or a function pointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldShape {
    Value,
    ValueArray {
        dimensions: Vec<usize>,
        /// Product of all dimensions.
        len: usize,
    },
    Pointer {
        /// Number of consecutive `*` decorations.
        level: usize,
    },
    PointerArray {
        level: usize,
        dimensions: Vec<usize>,
        len: usize,
    },
    FnPointer,
}

fn fn_pointer(input: &str) -> Result<(&str, FieldShape)> {
    let (input, name) = delimited(tag("(*"), take_until(")"), tag(")"))(input)?;
    let (input, _) = delimited(tag("("), take_until(")"), tag(")"))(input)?;

    Ok((input, (name, FieldShape::FnPointer)))
}

fn array_dimensions(input: &str) -> Result<Vec<usize>> {
    let (input, raw) = many0(complete(delimited(tag("["), take_until("]"), tag("]"))))(input)?;

    let mut dimensions = Vec::with_capacity(raw.len());
    for dimension in raw {
        match dimension.parse::<usize>() {
            Ok(n) if n > 0 => dimensions.push(n),
            _ => {
                return Err(Err::Failure(BlendError::SchemaCorruption(format!(
                    "invalid array dimension '{}'",
                    dimension
                ))))
            }
        }
    }

    Ok((input, dimensions))
}

fn pointer(input: &str) -> Result<(&str, FieldShape)> {
    let (input, asterisks) = many1(tag("*"))(input)?;
    let (input, name) = take_till(|c| c == '[')(input)?;

    if input.is_empty() {
        let shape = FieldShape::Pointer {
            level: asterisks.len(),
        };
        Ok((input, (name, shape)))
    } else {
        let (input, dimensions) = array_dimensions(input)?;
        let shape = FieldShape::PointerArray {
            level: asterisks.len(),
            len: dimensions.iter().product(),
            dimensions,
        };
        Ok((input, (name, shape)))
    }
}

fn value(input: &str) -> Result<(&str, FieldShape)> {
    let (input, name) = take_till(|c| c == '[')(input)?;

    if input.is_empty() {
        Ok((input, (name, FieldShape::Value)))
    } else {
        let (input, dimensions) = array_dimensions(input)?;
        let shape = FieldShape::ValueArray {
            len: dimensions.iter().product(),
            dimensions,
        };
        Ok((input, (name, shape)))
    }
}

/// Decomposes a decorated name into the bare identifier and its shape.
pub fn parse_field(input: &str) -> Result<(&str, FieldShape)> {
    alt((fn_pointer, pointer, value))(input)
}
