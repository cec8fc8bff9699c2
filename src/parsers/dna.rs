//! Parser for the DNA1 block: the schema the rest of the file is decoded
//! against.
//!
//! A .blend file carries no compile-time schema. The names table, types
//! table, type-lengths table and structure-layout table are read from the
//! file itself and turned into immutable [`StructTemplate`]s. Decoded values
//! never live inside a template; they are held by `RecordInstance`s built
//! from one, so templates can be shared by reference between any number of
//! in-flight decodes.

use super::{
    cursor::ByteCursor,
    field::{parse_field, FieldShape},
    BlendError, Result,
};
use std::collections::HashMap;

/// One entry of the types table: a type name and its byte length for the
/// pointer size the file was written with.
#[derive(Debug, Clone)]
pub struct DnaType {
    pub name: String,
    pub bytes_len: usize,
}

/// One field of a structure layout, with its name decorations already
/// decomposed into a [`FieldShape`].
#[derive(Debug, Clone)]
pub struct FieldSpec {
    /// The residual identifier after stripping `*`, `(...)` and `[n]`
    /// decorations; this is the name used for lookup.
    pub name: String,
    /// Declared type name, e.g. `"int"` or `"Object"`.
    pub type_name: String,
    /// Index into the types table.
    pub type_index: usize,
    pub shape: FieldShape,
}

/// A structure layout: a name plus its fields in declared order.
#[derive(Debug, Clone)]
pub struct StructTemplate {
    pub name: String,
    /// Index of the struct's own type in the types table.
    pub type_index: usize,
    pub fields: Vec<FieldSpec>,
}

/// The parsed schema: every structure layout in the file, queryable by name
/// or by ordinal (SDNA) index.
#[derive(Debug)]
pub struct SchemaCatalog {
    types: Vec<DnaType>,
    templates: Vec<StructTemplate>,
    by_name: HashMap<String, usize>,
}

fn expect_tag(cursor: &mut ByteCursor, expected: &[u8; 4]) -> Result<()> {
    let found = cursor.read_bytes(4)?;
    if found != expected {
        let found = String::from_utf8_lossy(found).into_owned();
        return Err(BlendError::SchemaCorruption(format!(
            "expected tag \"{}\", found \"{}\"",
            String::from_utf8_lossy(expected),
            found
        )));
    }
    Ok(())
}

fn read_count(cursor: &mut ByteCursor, table: &str) -> Result<usize> {
    let count = cursor.read_i32()?;
    if count <= 0 {
        return Err(BlendError::SchemaCorruption(format!(
            "non-positive {} count: {}",
            table, count
        )));
    }
    Ok(count as usize)
}

impl SchemaCatalog {
    /// Parses the DNA1 payload. The cursor must be positioned at the
    /// payload's first byte; table alignment is to absolute file offsets.
    pub fn parse(cursor: &mut ByteCursor) -> Result<SchemaCatalog> {
        expect_tag(cursor, b"SDNA")?;

        expect_tag(cursor, b"NAME")?;
        let name_count = read_count(cursor, "name")?;
        let mut names = Vec::with_capacity(name_count);
        for _ in 0..name_count {
            names.push(cursor.read_string()?);
        }
        cursor.align_position(4)?;

        expect_tag(cursor, b"TYPE")?;
        let type_count = read_count(cursor, "type")?;
        let mut type_names = Vec::with_capacity(type_count);
        for _ in 0..type_count {
            type_names.push(cursor.read_string()?);
        }
        cursor.align_position(4)?;

        expect_tag(cursor, b"TLEN")?;
        let mut types = Vec::with_capacity(type_count);
        for name in type_names {
            let bytes_len = cursor.read_u16()? as usize;
            types.push(DnaType { name, bytes_len });
        }
        cursor.align_position(4)?;

        expect_tag(cursor, b"STRC")?;
        let struct_count = read_count(cursor, "structure")?;
        let mut templates = Vec::with_capacity(struct_count);
        let mut by_name = HashMap::with_capacity(struct_count);

        for _ in 0..struct_count {
            let type_index = cursor.read_u16()? as usize;
            let field_count = cursor.read_u16()? as usize;

            let name = types
                .get(type_index)
                .ok_or_else(|| {
                    BlendError::SchemaCorruption(format!(
                        "structure type index {} is out of range",
                        type_index
                    ))
                })?
                .name
                .clone();

            let mut fields = Vec::with_capacity(field_count);
            for _ in 0..field_count {
                let field_type_index = cursor.read_u16()? as usize;
                let field_name_index = cursor.read_u16()? as usize;

                let type_name = types
                    .get(field_type_index)
                    .ok_or_else(|| {
                        BlendError::SchemaCorruption(format!(
                            "field type index {} is out of range",
                            field_type_index
                        ))
                    })?
                    .name
                    .clone();
                let full_name = names.get(field_name_index).ok_or_else(|| {
                    BlendError::SchemaCorruption(format!(
                        "field name index {} is out of range",
                        field_name_index
                    ))
                })?;

                let (residual, shape) = match parse_field(full_name) {
                    Ok((rest, parsed)) if rest.is_empty() => parsed,
                    _ => {
                        return Err(BlendError::SchemaCorruption(format!(
                            "field name '{}' could not be parsed",
                            full_name
                        )))
                    }
                };

                fields.push(FieldSpec {
                    name: residual.to_owned(),
                    type_name,
                    type_index: field_type_index,
                    shape,
                });
            }

            if by_name.insert(name.clone(), templates.len()).is_some() {
                return Err(BlendError::SchemaCorruption(format!(
                    "duplicate structure name '{}'",
                    name
                )));
            }
            templates.push(StructTemplate {
                name,
                type_index,
                fields,
            });
        }

        let catalog = SchemaCatalog {
            types,
            templates,
            by_name,
        };
        catalog.validate_widths(cursor.pointer_size().bytes_num())?;
        Ok(catalog)
    }

    /// Cross-checks every structure's declared TLEN entry against the sum of
    /// its field widths. A mismatch means the schema cannot be decoded
    /// consistently.
    fn validate_widths(&self, pointer_size: usize) -> Result<()> {
        for template in &self.templates {
            let width: usize = template
                .fields
                .iter()
                .map(|field| match &field.shape {
                    FieldShape::Pointer { .. } | FieldShape::FnPointer => pointer_size,
                    FieldShape::PointerArray { len, .. } => pointer_size * len,
                    FieldShape::Value => self.types[field.type_index].bytes_len,
                    FieldShape::ValueArray { len, .. } => {
                        self.types[field.type_index].bytes_len * len
                    }
                })
                .sum();

            let declared = self.types[template.type_index].bytes_len;
            if width != declared {
                return Err(BlendError::SchemaCorruption(format!(
                    "structure '{}' declares {} bytes but its fields span {}",
                    template.name, declared, width
                )));
            }
        }
        Ok(())
    }

    pub fn types(&self) -> &[DnaType] {
        &self.types
    }

    pub fn templates(&self) -> &[StructTemplate] {
        &self.templates
    }

    pub fn template_by_name(&self, name: &str) -> Option<&StructTemplate> {
        self.by_name.get(name).map(|&i| &self.templates[i])
    }

    pub fn template_by_index(&self, index: usize) -> Option<&StructTemplate> {
        self.templates.get(index)
    }

    pub fn has_structure(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }
}
