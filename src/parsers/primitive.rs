//! Endianness-aware decoders for the primitive types a .blend file can
//! contain. Every function expects a slice that is at least as long as the
//! primitive being read; `ByteCursor` checks the length before calling in.

use super::Endianness;
use nom::number::complete::{
    be_f32, be_f64, be_i16, be_i32, be_i64, be_u16, be_u32, be_u64, le_f32, le_f64, le_i16, le_i32,
    le_i64, le_u16, le_u32, le_u64,
};

pub fn parse_u8(slice: &[u8], _endianness: Endianness) -> u8 {
    slice[0]
}

pub fn parse_i8(slice: &[u8], _endianness: Endianness) -> i8 {
    slice[0] as i8
}

macro_rules! multi_byte_parser {
    ($name:ident -> $ty:ty, $le:ident, $be:ident) => {
        pub fn $name(slice: &[u8], endianness: Endianness) -> $ty {
            let (_, val) = match endianness {
                Endianness::Little => $le::<()>(slice).expect(stringify!($name)),
                Endianness::Big => $be::<()>(slice).expect(stringify!($name)),
            };
            val
        }
    };
}

multi_byte_parser!(parse_u16 -> u16, le_u16, be_u16);
multi_byte_parser!(parse_i16 -> i16, le_i16, be_i16);
multi_byte_parser!(parse_u32 -> u32, le_u32, be_u32);
multi_byte_parser!(parse_i32 -> i32, le_i32, be_i32);
multi_byte_parser!(parse_u64 -> u64, le_u64, be_u64);
multi_byte_parser!(parse_i64 -> i64, le_i64, be_i64);
multi_byte_parser!(parse_f32 -> f32, le_f32, be_f32);
multi_byte_parser!(parse_f64 -> f64, le_f64, be_f64);
