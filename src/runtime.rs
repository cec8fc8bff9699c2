//! The runtime half of the crate: decoding records against the schema and
//! resolving the pointer graph between blocks.
//!
//! A [`RecordInstance`] is one struct value decoded from the file, with its
//! fields held in declared order. Pointer fields decode to
//! [`PointerHandle`]s; holding a handle does not imply its target has been
//! decoded. Resolution happens lazily through [`Blend::fetch`], which looks
//! the address up in the block index and re-enters the decoder at the
//! target block's payload.
//!
//! Everything here is single-threaded by design: the cursor is the one
//! shared mutable resource, so every decode entry point takes `&mut self`.

use crate::parsers::{
    blend::{Block, BlockIndex, Header},
    cursor::ByteCursor,
    dna::{FieldSpec, SchemaCatalog, StructTemplate},
    field::FieldShape,
    BlendError, Result,
};
use linked_hash_map::LinkedHashMap;
use std::collections::HashSet;
use std::fmt;
use std::io::Read;
use std::path::Path;

/// Ceiling on nested-structure decode depth. Blender's own schemas nest a
/// handful of levels deep; anything past this is a degenerate file.
const MAX_DECODE_DEPTH: usize = 64;

/// A pointer field's decoded value: the address the target lived at in the
/// writing process, plus the declared indirection level. Address `0` is
/// null.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointerHandle {
    pub address: u64,
    /// 1 = pointer to record(s), 2+ = pointer to a pointer array.
    pub level: usize,
    pub is_function: bool,
}

impl PointerHandle {
    pub fn is_null(&self) -> bool {
        self.address == 0
    }
}

/// A flattened fixed-size N-dimensional array with row-major indexing.
#[derive(Debug, Clone, PartialEq)]
pub struct DynamicArray {
    dimensions: Vec<usize>,
    values: Vec<FieldValue>,
}

impl DynamicArray {
    /// Every dimension must be positive and their product must match the
    /// number of supplied values.
    pub fn new(dimensions: Vec<usize>, values: Vec<FieldValue>) -> Result<DynamicArray> {
        if dimensions.is_empty() || dimensions.iter().any(|&d| d == 0) {
            return Err(BlendError::InvalidState(format!(
                "invalid array dimensions {:?}",
                dimensions
            )));
        }
        let total: usize = dimensions.iter().product();
        if total != values.len() {
            return Err(BlendError::InvalidState(format!(
                "array dimensions {:?} do not cover {} values",
                dimensions,
                values.len()
            )));
        }
        Ok(DynamicArray { dimensions, values })
    }

    pub fn dimensions(&self) -> &[usize] {
        &self.dimensions
    }

    /// Total element count.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[FieldValue] {
        &self.values
    }

    /// Row-major lookup: `index = Σ position[i] × product(remaining dims)`.
    /// The position must have exactly one component per dimension.
    pub fn get(&self, position: &[usize]) -> Result<&FieldValue> {
        if position.len() != self.dimensions.len() {
            return Err(BlendError::IndexOutOfRange {
                expected: self.dimensions.len(),
                got: position.len(),
            });
        }

        let mut index = 0;
        for (axis, &component) in position.iter().enumerate() {
            let extent = self.dimensions[axis];
            if component >= extent {
                return Err(BlendError::IndexOutOfRange {
                    expected: extent,
                    got: component,
                });
            }
            let stride: usize = self.dimensions[axis + 1..].iter().product();
            index += component * stride;
        }

        Ok(&self.values[index])
    }
}

/// One decoded field value. `char` is kept as a numeric byte because the
/// format reuses it for byte-sized enums as often as for text.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Char(u8),
    Short(i16),
    UShort(u16),
    Int(i32),
    Long(i64),
    ULong(u64),
    Float(f32),
    Double(f64),
    /// A `void` value field: occupies no storage.
    Void,
    Pointer(PointerHandle),
    Struct(RecordInstance),
    Array(DynamicArray),
}

impl FieldValue {
    pub fn as_u8(&self) -> Option<u8> {
        match *self {
            FieldValue::Char(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i16(&self) -> Option<i16> {
        match *self {
            FieldValue::Short(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match *self {
            FieldValue::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            FieldValue::Long(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            FieldValue::ULong(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match *self {
            FieldValue::Float(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            FieldValue::Double(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_pointer(&self) -> Option<&PointerHandle> {
        match self {
            FieldValue::Pointer(handle) => Some(handle),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&RecordInstance> {
        match self {
            FieldValue::Struct(record) => Some(record),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&DynamicArray> {
        match self {
            FieldValue::Array(array) => Some(array),
            _ => None,
        }
    }
}

/// A structure template bound to concrete field values, plus the address
/// the record lived at in the writing process.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordInstance {
    type_name: String,
    fields: LinkedHashMap<String, FieldValue>,
    /// `None` until the record has been filled from the stream. `Some(0)`
    /// never occurs for block-level records but is representable, keeping
    /// "unfilled" distinct from "null address".
    old_address: Option<u64>,
}

impl RecordInstance {
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Field names and values in declared order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(name, value)| (&name[..], value))
    }

    /// The address this record's bytes lived at in the process that wrote
    /// the file. Fails if the record has not been filled from the stream.
    pub fn old_memory_address(&self) -> Result<u64> {
        self.old_address.ok_or_else(|| {
            BlendError::InvalidState("record has not been filled from the stream".to_owned())
        })
    }

    /// Case-insensitive lookup against this record's own fields only.
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|(field_name, _)| field_name.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    }

    /// Case-insensitive lookup in a single declared-order pass: each field
    /// is checked for a name match and, when it holds a nested structure
    /// value (not a pointer), descended into on the spot. First match wins,
    /// so a name inside an earlier-declared nested struct shadows a later
    /// own-level field.
    pub fn flat_field(&self, name: &str) -> Option<&FieldValue> {
        for (field_name, value) in self.fields.iter() {
            if field_name.eq_ignore_ascii_case(name) {
                return Some(value);
            }
            if let FieldValue::Struct(nested) = value {
                if let Some(found) = nested.flat_field(name) {
                    return Some(found);
                }
            }
        }
        None
    }

    fn typed_field<T>(
        &self,
        name: &str,
        expected: &str,
        extract: impl Fn(&FieldValue) -> Option<T>,
    ) -> Result<T> {
        let value = self.field(name).ok_or_else(|| {
            BlendError::InvalidState(format!(
                "'{}' has no field named '{}'",
                self.type_name, name
            ))
        })?;
        extract(value).ok_or_else(|| {
            BlendError::InvalidState(format!(
                "field '{}' of '{}' is not {}",
                name, self.type_name, expected
            ))
        })
    }

    pub fn get_u8(&self, name: &str) -> Result<u8> {
        self.typed_field(name, "a char", FieldValue::as_u8)
    }

    pub fn get_i16(&self, name: &str) -> Result<i16> {
        self.typed_field(name, "a short", FieldValue::as_i16)
    }

    pub fn get_i32(&self, name: &str) -> Result<i32> {
        self.typed_field(name, "an int", FieldValue::as_i32)
    }

    pub fn get_i64(&self, name: &str) -> Result<i64> {
        self.typed_field(name, "a long", FieldValue::as_i64)
    }

    pub fn get_u64(&self, name: &str) -> Result<u64> {
        self.typed_field(name, "a uint64", FieldValue::as_u64)
    }

    pub fn get_f32(&self, name: &str) -> Result<f32> {
        self.typed_field(name, "a float", FieldValue::as_f32)
    }

    pub fn get_f64(&self, name: &str) -> Result<f64> {
        self.typed_field(name, "a double", FieldValue::as_f64)
    }

    pub fn get_pointer(&self, name: &str) -> Result<PointerHandle> {
        self.typed_field(name, "a pointer", |v| v.as_pointer().copied())
    }

    pub fn get_struct(&self, name: &str) -> Result<&RecordInstance> {
        let value = self.field(name).ok_or_else(|| {
            BlendError::InvalidState(format!(
                "'{}' has no field named '{}'",
                self.type_name, name
            ))
        })?;
        value.as_struct().ok_or_else(|| {
            BlendError::InvalidState(format!(
                "field '{}' of '{}' is not a structure",
                name, self.type_name
            ))
        })
    }

    /// Reads a char array (or single char) as text, stopping at the first
    /// NUL byte.
    pub fn get_string(&self, name: &str) -> Result<String> {
        let value = self.field(name).ok_or_else(|| {
            BlendError::InvalidState(format!(
                "'{}' has no field named '{}'",
                self.type_name, name
            ))
        })?;

        let bytes: Vec<u8> = match value {
            FieldValue::Char(byte) => vec![*byte],
            FieldValue::Array(array) => array
                .values()
                .iter()
                .map(|v| {
                    v.as_u8().ok_or_else(|| {
                        BlendError::InvalidState(format!(
                            "field '{}' of '{}' is not a char array",
                            name, self.type_name
                        ))
                    })
                })
                .collect::<Result<_>>()?,
            _ => {
                return Err(BlendError::InvalidState(format!(
                    "field '{}' of '{}' is not a char array",
                    name, self.type_name
                )))
            }
        };

        Ok(bytes
            .into_iter()
            .take_while(|&b| b != 0)
            .map(|b| b as char)
            .collect())
    }

    pub fn get_f32_vec(&self, name: &str) -> Result<Vec<f32>> {
        self.primitive_vec(name, "a float array", FieldValue::as_f32)
    }

    pub fn get_i32_vec(&self, name: &str) -> Result<Vec<i32>> {
        self.primitive_vec(name, "an int array", FieldValue::as_i32)
    }

    fn primitive_vec<T>(
        &self,
        name: &str,
        expected: &str,
        extract: impl Fn(&FieldValue) -> Option<T>,
    ) -> Result<Vec<T>> {
        let mismatch = || {
            BlendError::InvalidState(format!(
                "field '{}' of '{}' is not {}",
                name, self.type_name, expected
            ))
        };

        match self.field(name) {
            Some(FieldValue::Array(array)) => array
                .values()
                .iter()
                .map(|v| extract(v).ok_or_else(mismatch))
                .collect(),
            // Arrays of one element decay to a bare scalar when decoded.
            Some(value) => Ok(vec![extract(value).ok_or_else(mismatch)?]),
            None => Err(BlendError::InvalidState(format!(
                "'{}' has no field named '{}'",
                self.type_name, name
            ))),
        }
    }
}

fn fmt_value(f: &mut fmt::Formatter, value: &FieldValue, indent: usize) -> fmt::Result {
    match value {
        FieldValue::Char(v) => write!(f, "{}", v),
        FieldValue::Short(v) => write!(f, "{}", v),
        FieldValue::UShort(v) => write!(f, "{}", v),
        FieldValue::Int(v) => write!(f, "{}", v),
        FieldValue::Long(v) => write!(f, "{}", v),
        FieldValue::ULong(v) => write!(f, "{}", v),
        FieldValue::Float(v) => write!(f, "{}", v),
        FieldValue::Double(v) => write!(f, "{}", v),
        FieldValue::Void => write!(f, "void"),
        FieldValue::Pointer(p) if p.is_null() => write!(f, "null"),
        FieldValue::Pointer(p) => write!(f, "(@{:#x})", p.address),
        FieldValue::Struct(record) => fmt_record(f, record, indent),
        FieldValue::Array(array) => {
            // Char arrays read best as strings when they hold text.
            let as_text: Option<String> = array
                .values()
                .iter()
                .map(FieldValue::as_u8)
                .collect::<Option<Vec<u8>>>()
                .and_then(|bytes| {
                    let text: String = bytes
                        .iter()
                        .take_while(|&&b| b != 0)
                        .map(|&b| b as char)
                        .collect();
                    if text.chars().all(|c| !c.is_control()) {
                        Some(text)
                    } else {
                        None
                    }
                });
            if let Some(text) = as_text {
                return write!(f, "\"{}\"", text);
            }

            write!(f, "[")?;
            for (i, element) in array.values().iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                fmt_value(f, element, indent)?;
            }
            write!(f, "]")
        }
    }
}

fn fmt_record(f: &mut fmt::Formatter, record: &RecordInstance, indent: usize) -> fmt::Result {
    let pad: String = "    ".repeat(indent + 1);
    write!(f, "{}", record.type_name)?;
    if let Some(address) = record.old_address {
        write!(f, " (@{:#x})", address)?;
    }
    writeln!(f, " {{")?;
    for (name, value) in record.fields() {
        write!(f, "{}{}: ", pad, name)?;
        fmt_value(f, value, indent + 1)?;
        writeln!(f, ";")?;
    }
    write!(f, "{}}}", "    ".repeat(indent))
}

impl fmt::Display for RecordInstance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt_record(f, self, 0)
    }
}

/// Decodes one field, consuming exactly the bytes its shape implies.
fn decode_field(
    catalog: &SchemaCatalog,
    cursor: &mut ByteCursor,
    spec: &FieldSpec,
    depth: usize,
) -> Result<FieldValue> {
    match &spec.shape {
        FieldShape::FnPointer => Ok(FieldValue::Pointer(PointerHandle {
            address: cursor.read_pointer()?,
            level: 1,
            is_function: true,
        })),
        FieldShape::Pointer { level } => Ok(FieldValue::Pointer(PointerHandle {
            address: cursor.read_pointer()?,
            level: *level,
            is_function: false,
        })),
        FieldShape::PointerArray {
            level,
            dimensions,
            len,
        } => {
            let mut values = Vec::with_capacity(*len);
            for _ in 0..*len {
                values.push(FieldValue::Pointer(PointerHandle {
                    address: cursor.read_pointer()?,
                    level: *level,
                    is_function: false,
                }));
            }
            collapse(dimensions, values)
        }
        FieldShape::Value => decode_scalar(catalog, cursor, spec, depth),
        FieldShape::ValueArray { dimensions, len } => {
            let mut values = Vec::with_capacity(*len);
            for _ in 0..*len {
                values.push(decode_scalar(catalog, cursor, spec, depth)?);
            }
            collapse(dimensions, values)
        }
    }
}

/// An array of one element decays to a bare scalar; larger arrays are
/// wrapped. This asymmetry is part of the field-lookup contract.
fn collapse(dimensions: &[usize], mut values: Vec<FieldValue>) -> Result<FieldValue> {
    if values.len() == 1 {
        Ok(values.remove(0))
    } else {
        Ok(FieldValue::Array(DynamicArray::new(
            dimensions.to_vec(),
            values,
        )?))
    }
}

fn decode_scalar(
    catalog: &SchemaCatalog,
    cursor: &mut ByteCursor,
    spec: &FieldSpec,
    depth: usize,
) -> Result<FieldValue> {
    match &spec.type_name[..] {
        "char" | "uchar" => Ok(FieldValue::Char(cursor.read_u8()?)),
        "short" => Ok(FieldValue::Short(cursor.read_i16()?)),
        "ushort" => Ok(FieldValue::UShort(cursor.read_u16()?)),
        "int" => Ok(FieldValue::Int(cursor.read_i32()?)),
        "long" | "int64_t" => Ok(FieldValue::Long(cursor.read_i64()?)),
        "ulong" | "uint64_t" => Ok(FieldValue::ULong(cursor.read_u64()?)),
        "float" => Ok(FieldValue::Float(cursor.read_f32()?)),
        "double" => Ok(FieldValue::Double(cursor.read_f64()?)),
        "void" => Ok(FieldValue::Void),
        other => match catalog.template_by_name(other) {
            Some(template) => {
                let record = decode_record(catalog, cursor, template, depth + 1)?;
                Ok(FieldValue::Struct(record))
            }
            None => Err(BlendError::UnknownType(other.to_owned())),
        },
    }
}

/// Decodes one record of `template` at the cursor's current position.
///
/// The record's old memory address is re-derived by reading the pointer that
/// sits `8 + pointer_size` bytes before the record start: the old-address
/// slot of the block header that precedes every data payload. The cursor is
/// restored before field decoding begins.
fn decode_record(
    catalog: &SchemaCatalog,
    cursor: &mut ByteCursor,
    template: &StructTemplate,
    depth: usize,
) -> Result<RecordInstance> {
    if depth > MAX_DECODE_DEPTH {
        return Err(BlendError::RecursionLimit);
    }

    let start = cursor.position();
    let back = 8 + cursor.pointer_size().bytes_num();
    let old_address = match start.checked_sub(back) {
        Some(address_position) => {
            cursor.set_position(address_position)?;
            let address = cursor.read_pointer()?;
            cursor.set_position(start)?;
            Some(address)
        }
        None => None,
    };

    let mut fields = LinkedHashMap::with_capacity(template.fields.len());
    for spec in &template.fields {
        let value = decode_field(catalog, cursor, spec, depth)?;
        fields.insert(spec.name.clone(), value);
    }

    Ok(RecordInstance {
        type_name: template.name.clone(),
        fields,
        old_address,
    })
}

/// A ready-to-query .blend file: buffered bytes, schema catalog and block
/// index. All decoding entry points live here because they share the
/// single cursor.
pub struct Blend {
    cursor: ByteCursor,
    catalog: SchemaCatalog,
    index: BlockIndex,
}

impl Blend {
    /// Opens a .blend file from any byte source. A failure at any stage
    /// (header, block scan, schema) aborts the open.
    pub fn from_data<R: Read>(source: R) -> Result<Blend> {
        let mut cursor = ByteCursor::new(source)?;
        let (index, catalog) = BlockIndex::scan(&mut cursor)?;
        Ok(Blend {
            cursor,
            catalog,
            index,
        })
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Blend> {
        let file = std::fs::File::open(path)?;
        Blend::from_data(file)
    }

    pub fn header(&self) -> &Header {
        self.cursor.header()
    }

    pub fn catalog(&self) -> &SchemaCatalog {
        &self.catalog
    }

    /// Every indexed block, in file order. `DNA1` and `ENDB` are consumed
    /// during the scan and never appear here.
    pub fn blocks(&self) -> &[Block] {
        self.index.blocks()
    }

    /// Blocks carrying a two-letter code; these are the file's root
    /// records and always have a valid `sdna_index`.
    pub fn root_blocks(&self) -> Vec<Block> {
        self.index
            .blocks()
            .iter()
            .filter(|block| block.is_root())
            .copied()
            .collect()
    }

    /// Root blocks with a particular two-letter code: `b"OB"` for objects,
    /// `b"ME"` for meshes, `b"CA"` for cameras, and so on.
    pub fn blocks_by_code(&self, code: [u8; 2]) -> Vec<Block> {
        self.index
            .blocks()
            .iter()
            .filter(|block| block.is_root() && block.two_letter_code() == code)
            .copied()
            .collect()
    }

    pub fn block_by_address(&self, address: u64) -> Option<Block> {
        self.index.by_address(address).copied()
    }

    /// Decodes all `count` consecutive records of a block, each one an
    /// independent instance filled from its own position in the payload.
    pub fn decode_block(&mut self, block: Block) -> Result<Vec<RecordInstance>> {
        let catalog = &self.catalog;
        let cursor = &mut self.cursor;

        let template = catalog.template_by_index(block.sdna_index).ok_or_else(|| {
            BlendError::SchemaCorruption(format!(
                "block sdna index {} is out of range",
                block.sdna_index
            ))
        })?;

        cursor.set_position(block.payload_position)?;
        (0..block.count)
            .map(|_| decode_record(catalog, cursor, template, 0))
            .collect()
    }

    /// Resolves a pointer handle to the records it targets.
    ///
    /// A null handle resolves to an empty sequence; callers that consider
    /// null exceptional can test [`PointerHandle::is_null`] first. A
    /// non-null address with no matching block is an error. For handles of
    /// level 2 and above the target payload is read as a flat pointer
    /// array and each non-zero entry is resolved one level down, results
    /// concatenated in array order.
    pub fn fetch(&mut self, handle: &PointerHandle) -> Result<Vec<RecordInstance>> {
        if handle.is_null() {
            return Ok(Vec::new());
        }

        let block = *self
            .index
            .by_address(handle.address)
            .ok_or(BlendError::InvalidPointer(handle.address))?;

        if handle.level > 1 {
            let pointer_size = self.cursor.pointer_size().bytes_num();
            let pointer_count = block.size / pointer_size * block.count;

            self.cursor.set_position(block.payload_position)?;
            let mut addresses = Vec::with_capacity(pointer_count);
            for _ in 0..pointer_count {
                addresses.push(self.cursor.read_pointer()?);
            }

            let mut records = Vec::new();
            for address in addresses {
                if address == 0 {
                    continue;
                }
                let inner = PointerHandle {
                    address,
                    level: handle.level - 1,
                    is_function: false,
                };
                records.extend(self.fetch(&inner)?);
            }
            Ok(records)
        } else {
            self.decode_block(block)
        }
    }

    /// Walks the intrusive doubly-linked list a `ListBase` record heads.
    ///
    /// An empty list (null `first`) resolves to an empty sequence without
    /// entering the walk. The walk follows each node's flat `next` pointer and
    /// stops when the freshly decoded node's old address equals the `last`
    /// pointer's address. A revisited address means the list is cyclic and
    /// fails the walk; a null `next` before `last` ends it.
    pub fn evaluate_list_base(&mut self, list: &RecordInstance) -> Result<Vec<RecordInstance>> {
        if list.type_name() != "ListBase" {
            return Err(BlendError::InvalidState(format!(
                "evaluate_list_base called on a '{}' record",
                list.type_name()
            )));
        }

        let first = list.get_pointer("first")?;
        let last = list.get_pointer("last")?;

        if first.is_null() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        let mut seen = HashSet::new();
        let mut current = first;

        loop {
            if !seen.insert(current.address) {
                return Err(BlendError::InvalidState(format!(
                    "cycle in ListBase at address {:#x}",
                    current.address
                )));
            }

            let node = self
                .fetch(&current)?
                .into_iter()
                .next()
                .ok_or(BlendError::InvalidPointer(current.address))?;
            let node_address = node.old_memory_address()?;

            let next = node
                .flat_field("next")
                .and_then(FieldValue::as_pointer)
                .copied();
            records.push(node);

            if node_address == last.address {
                break;
            }
            match next {
                Some(next) if !next.is_null() => current = next,
                // The chain ended before reaching `last`; return what was
                // collected rather than walking stale memory.
                _ => break,
            }
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsers::blend::HEADER_LEN;

    /// Builds little-endian, 4-byte-pointer .blend fixtures byte by byte.
    struct FileBuilder {
        data: Vec<u8>,
    }

    impl FileBuilder {
        fn new() -> FileBuilder {
            FileBuilder {
                data: b"BLENDER_v279".to_vec(),
            }
        }

        fn block(&mut self, code: [u8; 4], address: u32, sdna: u32, count: u32, payload: &[u8]) {
            self.data.extend_from_slice(&code);
            self.data
                .extend_from_slice(&(payload.len() as u32).to_le_bytes());
            self.data.extend_from_slice(&address.to_le_bytes());
            self.data.extend_from_slice(&sdna.to_le_bytes());
            self.data.extend_from_slice(&count.to_le_bytes());
            self.data.extend_from_slice(payload);
        }

        /// Payload offset the next block's data will land at.
        fn next_payload_position(&self) -> usize {
            self.data.len() + 20
        }

        fn dna(
            &mut self,
            names: &[&str],
            types: &[(&str, u16)],
            structs: &[(u16, &[(u16, u16)])],
        ) {
            let start = self.next_payload_position();

            fn pad(out: &mut Vec<u8>, start: usize) {
                while (start + out.len()) % 4 != 0 {
                    out.push(0);
                }
            }

            let mut payload = Vec::new();
            payload.extend_from_slice(b"SDNA");
            payload.extend_from_slice(b"NAME");
            payload.extend_from_slice(&(names.len() as i32).to_le_bytes());
            for name in names {
                payload.extend_from_slice(name.as_bytes());
                payload.push(0);
            }
            pad(&mut payload, start);

            payload.extend_from_slice(b"TYPE");
            payload.extend_from_slice(&(types.len() as i32).to_le_bytes());
            for (name, _) in types {
                payload.extend_from_slice(name.as_bytes());
                payload.push(0);
            }
            pad(&mut payload, start);

            payload.extend_from_slice(b"TLEN");
            for (_, len) in types {
                payload.extend_from_slice(&len.to_le_bytes());
            }
            pad(&mut payload, start);

            payload.extend_from_slice(b"STRC");
            payload.extend_from_slice(&(structs.len() as i32).to_le_bytes());
            for (type_index, fields) in structs {
                payload.extend_from_slice(&type_index.to_le_bytes());
                payload.extend_from_slice(&(fields.len() as u16).to_le_bytes());
                for (field_type, field_name) in fields.iter() {
                    payload.extend_from_slice(&field_type.to_le_bytes());
                    payload.extend_from_slice(&field_name.to_le_bytes());
                }
            }
            pad(&mut payload, start);

            self.block(*b"DNA1", 0, 0, 1, &payload);
        }

        fn finish(mut self) -> Vec<u8> {
            self.block(*b"ENDB", 0, 0, 0, &[]);
            self.data
        }
    }

    /// A file whose schema defines `Obj { int id; }` plus a linked-list
    /// node type, with a few data blocks to decode.
    fn sample_blend() -> Blend {
        let mut builder = FileBuilder::new();

        // Obj { id = 42 }
        builder.block(*b"DATA", 0x1000, 0, 1, &42i32.to_le_bytes());

        // Three consecutive Obj records in one block.
        let mut triple = Vec::new();
        for id in &[7i32, 8, 9] {
            triple.extend_from_slice(&id.to_le_bytes());
        }
        builder.block(*b"DATA", 0x2000, 0, 3, &triple);

        // A pointer array targeting the two blocks above, with a null hole.
        let mut pointers = Vec::new();
        for address in &[0x1000u32, 0, 0x2000] {
            pointers.extend_from_slice(&address.to_le_bytes());
        }
        builder.block(*b"DATA", 0x3000, 0, 1, &pointers);

        // Node { *next; *prev; int value; } chain of three.
        let node = |next: u32, prev: u32, value: i32| {
            let mut payload = Vec::new();
            payload.extend_from_slice(&next.to_le_bytes());
            payload.extend_from_slice(&prev.to_le_bytes());
            payload.extend_from_slice(&value.to_le_bytes());
            payload
        };
        builder.block(*b"DATA", 0xA0, 1, 1, &node(0xB0, 0, 10));
        builder.block(*b"DATA", 0xB0, 1, 1, &node(0xC0, 0xA0, 20));
        builder.block(*b"DATA", 0xC0, 1, 1, &node(0, 0xB0, 30));

        // ListBase { *first; *last; } heads for the chain and an empty one.
        let list = |first: u32, last: u32| {
            let mut payload = Vec::new();
            payload.extend_from_slice(&first.to_le_bytes());
            payload.extend_from_slice(&last.to_le_bytes());
            payload
        };
        builder.block(*b"DATA", 0xD0, 2, 1, &list(0xA0, 0xC0));
        builder.block(*b"DATA", 0xE0, 2, 1, &list(0, 0));

        builder.dna(
            &["id", "*next", "*prev", "value", "*first", "*last"],
            &[("int", 4), ("Obj", 4), ("Node", 12), ("ListBase", 8)],
            &[
                (1, &[(0, 0)]),                 // Obj { int id; }
                (2, &[(2, 1), (2, 2), (0, 3)]), // Node { Node *next, *prev; int value; }
                (3, &[(2, 4), (2, 5)]),         // ListBase { Node *first, *last; }
            ],
        );

        Blend::from_data(&builder.finish()[..]).expect("fixture should open")
    }

    #[test]
    fn dynamic_array_row_major_indexing() {
        let values: Vec<FieldValue> = (0..6).map(FieldValue::Int).collect();
        let array = DynamicArray::new(vec![2, 3], values).unwrap();

        assert_eq!(array.len(), 6);
        assert_eq!(array.get(&[0, 0]).unwrap().as_i32(), Some(0));
        assert_eq!(array.get(&[1, 2]).unwrap().as_i32(), Some(5));

        assert!(matches!(
            array.get(&[1]),
            Err(BlendError::IndexOutOfRange { expected: 2, got: 1 })
        ));
        assert!(array.get(&[2, 0]).is_err());
    }

    #[test]
    fn dynamic_array_rejects_mismatched_dimensions() {
        assert!(DynamicArray::new(vec![2, 0], vec![]).is_err());
        assert!(DynamicArray::new(vec![3], vec![FieldValue::Int(1)]).is_err());
    }

    fn minimal_catalog() -> SchemaCatalog {
        let mut builder = FileBuilder::new();
        builder.dna(&["id"], &[("int", 4), ("Obj", 4)], &[(1, &[(0, 0)])]);
        let mut cursor = ByteCursor::new(&builder.finish()[..]).unwrap();
        let (_, catalog) = BlockIndex::scan(&mut cursor).unwrap();
        catalog
    }

    fn decode_one(spec: &FieldSpec, payload: &[u8]) -> (FieldValue, usize) {
        let catalog = minimal_catalog();

        let mut data = b"BLENDER_v279".to_vec();
        data.extend_from_slice(payload);
        let mut cursor = ByteCursor::new(&data[..]).unwrap();

        let value = decode_field(&catalog, &mut cursor, spec, 0).unwrap();
        (value, cursor.position() - HEADER_LEN)
    }

    #[test]
    fn two_dimensional_int_array_field() {
        let spec = FieldSpec {
            name: "foo".to_owned(),
            type_name: "int".to_owned(),
            type_index: 0,
            shape: FieldShape::ValueArray {
                dimensions: vec![2, 3],
                len: 6,
            },
        };

        let mut payload = Vec::new();
        for v in 0..6i32 {
            payload.extend_from_slice(&v.to_le_bytes());
        }

        let (value, consumed) = decode_one(&spec, &payload);
        assert_eq!(consumed, 24);

        let array = value.as_array().expect("should decode to an array");
        assert_eq!(array.len(), 6);
        assert_eq!(array.get(&[1, 2]).unwrap().as_i32(), Some(5));
    }

    #[test]
    fn array_of_one_decays_to_scalar() {
        let spec = FieldSpec {
            name: "bar".to_owned(),
            type_name: "float".to_owned(),
            type_index: 0,
            shape: FieldShape::ValueArray {
                dimensions: vec![1],
                len: 1,
            },
        };

        let (value, consumed) = decode_one(&spec, &1.5f32.to_le_bytes());
        assert_eq!(consumed, 4);
        assert_eq!(value.as_f32(), Some(1.5));
        assert!(value.as_array().is_none());
    }

    #[test]
    fn unknown_type_is_fatal() {
        let spec = FieldSpec {
            name: "mystery".to_owned(),
            type_name: "NotAType".to_owned(),
            type_index: 0,
            shape: FieldShape::Value,
        };

        let catalog = minimal_catalog();
        let mut cursor = ByteCursor::new(&b"BLENDER_v279"[..]).unwrap();

        assert!(matches!(
            decode_field(&catalog, &mut cursor, &spec, 0),
            Err(BlendError::UnknownType(name)) if name == "NotAType"
        ));
    }

    #[test]
    fn end_to_end_record_decoding() {
        let mut blend = sample_blend();

        let block = blend.block_by_address(0x1000).expect("block should exist");
        let records = blend.decode_block(block).unwrap();
        assert_eq!(records.len(), 1);

        let record = &records[0];
        assert_eq!(record.type_name(), "Obj");
        assert_eq!(record.get_i32("id").unwrap(), 42);
        assert_eq!(record.old_memory_address().unwrap(), 0x1000);
    }

    #[test]
    fn level_one_fetch_decodes_every_record() {
        let mut blend = sample_blend();

        let handle = PointerHandle {
            address: 0x2000,
            level: 1,
            is_function: false,
        };
        let records = blend.fetch(&handle).unwrap();

        assert_eq!(records.len(), 3);
        let ids: Vec<i32> = records.iter().map(|r| r.get_i32("id").unwrap()).collect();
        assert_eq!(ids, vec![7, 8, 9]);
        // The first record's address comes from the block header slot; the
        // later ones re-derive theirs from their own position.
        assert_eq!(records[0].old_memory_address().unwrap(), 0x2000);
    }

    #[test]
    fn level_two_fetch_peels_one_indirection() {
        let mut blend = sample_blend();

        let handle = PointerHandle {
            address: 0x3000,
            level: 2,
            is_function: false,
        };
        let records = blend.fetch(&handle).unwrap();

        // Null entries in the pointer array are skipped; the rest resolve
        // in array order.
        assert_eq!(records.len(), 4);
        assert_eq!(records[0].get_i32("id").unwrap(), 42);
        assert_eq!(records[1].get_i32("id").unwrap(), 7);
    }

    #[test]
    fn null_pointer_fetch_is_empty() {
        let mut blend = sample_blend();

        let null = PointerHandle {
            address: 0,
            level: 1,
            is_function: false,
        };
        assert!(blend.fetch(&null).unwrap().is_empty());
    }

    #[test]
    fn dangling_pointer_fetch_is_an_error() {
        let mut blend = sample_blend();

        let dangling = PointerHandle {
            address: 0xDEAD_BEEF,
            level: 1,
            is_function: false,
        };
        assert!(matches!(
            blend.fetch(&dangling),
            Err(BlendError::InvalidPointer(0xDEAD_BEEF))
        ));
    }

    #[test]
    fn list_base_walk() {
        let mut blend = sample_blend();

        let head_block = blend.block_by_address(0xD0).unwrap();
        let head = blend.decode_block(head_block).unwrap().remove(0);
        assert_eq!(head.type_name(), "ListBase");

        let nodes = blend.evaluate_list_base(&head).unwrap();
        assert_eq!(nodes.len(), 3);
        let values: Vec<i32> = nodes.iter().map(|n| n.get_i32("value").unwrap()).collect();
        assert_eq!(values, vec![10, 20, 30]);
    }

    #[test]
    fn empty_list_base_short_circuits() {
        let mut blend = sample_blend();

        let head_block = blend.block_by_address(0xE0).unwrap();
        let head = blend.decode_block(head_block).unwrap().remove(0);

        assert!(blend.evaluate_list_base(&head).unwrap().is_empty());
    }

    #[test]
    fn list_base_requires_a_list_base_record() {
        let mut blend = sample_blend();

        let block = blend.block_by_address(0x1000).unwrap();
        let record = blend.decode_block(block).unwrap().remove(0);

        assert!(matches!(
            blend.evaluate_list_base(&record),
            Err(BlendError::InvalidState(..))
        ));
    }

    #[test]
    fn flat_field_reaches_into_nested_structs() {
        // Outer { Inner inner; } / Inner { int value; }
        let mut builder = FileBuilder::new();
        builder.block(*b"DATA", 0x10, 1, 1, &99i32.to_le_bytes());
        builder.dna(
            &["value", "inner"],
            &[("int", 4), ("Inner", 4), ("Outer", 4)],
            &[(1, &[(0, 0)]), (2, &[(1, 1)])],
        );
        let mut blend = Blend::from_data(&builder.finish()[..]).unwrap();

        let block = blend.block_by_address(0x10).unwrap();
        let outer = blend.decode_block(block).unwrap().remove(0);

        assert!(outer.field("value").is_none());
        assert_eq!(outer.flat_field("value").and_then(FieldValue::as_i32), Some(99));
        // Lookup is case-insensitive.
        assert_eq!(outer.flat_field("VALUE").and_then(FieldValue::as_i32), Some(99));
    }

    #[test]
    fn earlier_nested_field_shadows_later_shallow_field() {
        // Outer { Inner a; int x = 2; } / Inner { int x = 1; }: the
        // declared-order walk descends into `a` before reaching `Outer.x`.
        let mut builder = FileBuilder::new();
        let mut payload = Vec::new();
        payload.extend_from_slice(&1i32.to_le_bytes());
        payload.extend_from_slice(&2i32.to_le_bytes());
        builder.block(*b"DATA", 0x10, 1, 1, &payload);
        builder.dna(
            &["x", "a"],
            &[("int", 4), ("Inner", 4), ("Outer", 8)],
            &[(1, &[(0, 0)]), (2, &[(1, 1), (0, 0)])],
        );
        let mut blend = Blend::from_data(&builder.finish()[..]).unwrap();

        let block = blend.block_by_address(0x10).unwrap();
        let outer = blend.decode_block(block).unwrap().remove(0);

        assert_eq!(outer.field("x").and_then(FieldValue::as_i32), Some(2));
        assert_eq!(outer.flat_field("x").and_then(FieldValue::as_i32), Some(1));
    }

    #[test]
    fn self_nesting_schema_hits_the_depth_cap() {
        // S { S inner; } decodes into itself forever without the cap.
        let mut builder = FileBuilder::new();
        builder.block(*b"DATA", 0x10, 0, 1, &[0u8; 4]);
        builder.dna(&["inner"], &[("S", 4)], &[(0, &[(0, 0)])]);
        let mut blend = Blend::from_data(&builder.finish()[..]).unwrap();

        let block = blend.block_by_address(0x10).unwrap();
        assert!(matches!(
            blend.decode_block(block),
            Err(BlendError::RecursionLimit)
        ));
    }

    #[test]
    fn duplicate_block_address_is_rejected() {
        let mut builder = FileBuilder::new();
        builder.block(*b"DATA", 0x10, 0, 1, &1i32.to_le_bytes());
        builder.block(*b"DATA", 0x10, 0, 1, &2i32.to_le_bytes());
        builder.dna(&["id"], &[("int", 4), ("Obj", 4)], &[(1, &[(0, 0)])]);

        assert!(matches!(
            Blend::from_data(&builder.finish()[..]),
            Err(BlendError::FileFormat(..))
        ));
    }

    #[test]
    fn second_dna_block_is_rejected() {
        let mut builder = FileBuilder::new();
        builder.dna(&["id"], &[("int", 4), ("Obj", 4)], &[(1, &[(0, 0)])]);
        builder.dna(&["id"], &[("int", 4), ("Obj", 4)], &[(1, &[(0, 0)])]);

        match Blend::from_data(&builder.finish()[..]) {
            Err(BlendError::SchemaCorruption(msg)) => {
                assert!(msg.contains("DNA1"), "unexpected message: {}", msg)
            }
            other => panic!("expected schema corruption, got {:?}", other.err()),
        }
    }

    #[test]
    fn cyclic_list_base_is_an_error() {
        // Two nodes pointing at each other, with `last` naming a node the
        // chain never reaches.
        let mut builder = FileBuilder::new();
        let node = |next: u32, prev: u32, value: i32| {
            let mut payload = Vec::new();
            payload.extend_from_slice(&next.to_le_bytes());
            payload.extend_from_slice(&prev.to_le_bytes());
            payload.extend_from_slice(&value.to_le_bytes());
            payload
        };
        builder.block(*b"DATA", 0xA0, 1, 1, &node(0xB0, 0, 10));
        builder.block(*b"DATA", 0xB0, 1, 1, &node(0xA0, 0xA0, 20));
        builder.block(*b"DATA", 0xC0, 1, 1, &node(0, 0xB0, 30));

        let mut list = Vec::new();
        list.extend_from_slice(&0xA0u32.to_le_bytes());
        list.extend_from_slice(&0xC0u32.to_le_bytes());
        builder.block(*b"DATA", 0xD0, 2, 1, &list);

        builder.dna(
            &["id", "*next", "*prev", "value", "*first", "*last"],
            &[("int", 4), ("Obj", 4), ("Node", 12), ("ListBase", 8)],
            &[
                (1, &[(0, 0)]),
                (2, &[(2, 1), (2, 2), (0, 3)]),
                (3, &[(2, 4), (2, 5)]),
            ],
        );
        let mut blend = Blend::from_data(&builder.finish()[..]).unwrap();

        let head_block = blend.block_by_address(0xD0).unwrap();
        let head = blend.decode_block(head_block).unwrap().remove(0);

        match blend.evaluate_list_base(&head) {
            Err(BlendError::InvalidState(msg)) => {
                assert!(msg.contains("cycle"), "unexpected message: {}", msg)
            }
            other => panic!("expected a cycle error, got {:?}", other.err()),
        }
    }

    #[test]
    fn root_block_enumeration_by_code() {
        let mut builder = FileBuilder::new();
        builder.block([b'O', b'B', 0, 0], 0x10, 0, 1, &1i32.to_le_bytes());
        builder.block([b'M', b'E', 0, 0], 0x20, 0, 1, &2i32.to_le_bytes());
        builder.block(*b"DATA", 0x30, 0, 1, &3i32.to_le_bytes());
        builder.dna(&["id"], &[("int", 4), ("Obj", 4)], &[(1, &[(0, 0)])]);
        let blend = Blend::from_data(&builder.finish()[..]).unwrap();

        assert_eq!(blend.blocks().len(), 3);
        assert_eq!(blend.root_blocks().len(), 2);

        let objects = blend.blocks_by_code(*b"OB");
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].old_address, 0x10);
    }

    #[test]
    fn record_display_renders_fields() {
        let mut blend = sample_blend();
        let block = blend.block_by_address(0x1000).unwrap();
        let record = blend.decode_block(block).unwrap().remove(0);

        let rendered = format!("{}", record);
        assert!(rendered.contains("Obj"));
        assert!(rendered.contains("id: 42"));
    }
}
