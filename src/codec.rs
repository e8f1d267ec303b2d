//! Binary form of instructions and changesets.
//!
//! Every instruction opens with a tag byte. Integers are unsigned LEB128
//! (signed values map through their two's-complement bit pattern), floats
//! are fixed-width IEEE 754 little-endian, strings and binary are
//! length-prefixed raw bytes, and every identifier or string payload is an
//! index into the changeset's interning table. The codec is bit-exact
//! bidirectional: re-encoding a decoded changeset yields identical bytes.
//! Unknown tags fail with `BadFormat`; nothing is ever skipped.

use crate::changeset::Changeset;
use crate::error::{Error, Result};
use crate::instruction::{ColumnSpec, Instruction, PrimaryKeySpec, TableType};
use crate::path::{Path, PathElem};
use crate::value::{
    CollectionKind, ColumnType, ContainerKind, DateTime, GlobalKey, InternString, ObjectId,
    Payload, Uuid,
};
use rust_decimal::Decimal;
use smallvec::SmallVec;

const TAG_ADD_TABLE: u8 = 0x00;
const TAG_ERASE_TABLE: u8 = 0x01;
const TAG_ADD_COLUMN: u8 = 0x02;
const TAG_ERASE_COLUMN: u8 = 0x03;
const TAG_CREATE_OBJECT: u8 = 0x04;
const TAG_ERASE_OBJECT: u8 = 0x05;
const TAG_UPDATE: u8 = 0x06;
const TAG_ADD_INTEGER: u8 = 0x07;
const TAG_ARRAY_INSERT: u8 = 0x08;
const TAG_ARRAY_MOVE: u8 = 0x09;
const TAG_ARRAY_ERASE: u8 = 0x0a;
const TAG_CLEAR: u8 = 0x0b;
const TAG_SET_INSERT: u8 = 0x0c;
const TAG_SET_ERASE: u8 = 0x0d;

const PAYLOAD_NULL: u8 = 0x00;
const PAYLOAD_ERASED: u8 = 0x01;
const PAYLOAD_INT: u8 = 0x02;
const PAYLOAD_BOOL: u8 = 0x03;
const PAYLOAD_FLOAT: u8 = 0x04;
const PAYLOAD_DOUBLE: u8 = 0x05;
const PAYLOAD_STR: u8 = 0x06;
const PAYLOAD_BINARY: u8 = 0x07;
const PAYLOAD_TIMESTAMP: u8 = 0x08;
const PAYLOAD_DECIMAL: u8 = 0x09;
const PAYLOAD_OBJECT_ID: u8 = 0x0a;
const PAYLOAD_UUID: u8 = 0x0b;
const PAYLOAD_LINK: u8 = 0x0c;
const PAYLOAD_LIST: u8 = 0x0d;
const PAYLOAD_DICTIONARY: u8 = 0x0e;
const PAYLOAD_EMBEDDED: u8 = 0x0f;

const KEY_PAIR: u8 = 0x00;
const KEY_INT: u8 = 0x01;
const KEY_STR: u8 = 0x02;
const KEY_UUID: u8 = 0x03;

const ELEM_FIELD: u8 = 0x00;
const ELEM_INDEX: u8 = 0x01;

const TABLE_TOP_LEVEL: u8 = 0x00;
const TABLE_TOP_LEVEL_PK: u8 = 0x01;
const TABLE_EMBEDDED: u8 = 0x02;

fn write_uleb(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn column_type_byte(ty: ColumnType) -> u8 {
    match ty {
        ColumnType::Int => 0,
        ColumnType::Bool => 1,
        ColumnType::Float => 2,
        ColumnType::Double => 3,
        ColumnType::String => 4,
        ColumnType::Binary => 5,
        ColumnType::Timestamp => 6,
        ColumnType::Decimal => 7,
        ColumnType::ObjectId => 8,
        ColumnType::Uuid => 9,
        ColumnType::Mixed => 10,
        ColumnType::Link => 11,
    }
}

fn collection_kind_byte(kind: CollectionKind) -> u8 {
    match kind {
        CollectionKind::Single => 0,
        CollectionKind::List => 1,
        CollectionKind::Dictionary => 2,
        CollectionKind::Set => 3,
    }
}

fn container_kind_byte(kind: ContainerKind) -> u8 {
    match kind {
        ContainerKind::List => 0,
        ContainerKind::Dictionary => 1,
        ContainerKind::Set => 2,
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    strings: usize,
}

impl<'a> Reader<'a> {
    fn bad(&self) -> Error {
        Error::bad_format(self.pos)
    }

    fn byte(&mut self) -> Result<u8> {
        let b = *self.data.get(self.pos).ok_or_else(|| self.bad())?;
        self.pos += 1;
        Ok(b)
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or_else(|| self.bad())?;
        let s = self.data.get(self.pos..end).ok_or_else(|| self.bad())?;
        self.pos = end;
        Ok(s)
    }

    fn uleb(&mut self) -> Result<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.byte()?;
            if shift == 63 && byte > 1 {
                return Err(self.bad());
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift > 63 {
                return Err(self.bad());
            }
        }
    }

    fn u32(&mut self) -> Result<u32> {
        let v = self.uleb()?;
        u32::try_from(v).map_err(|_| self.bad())
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(self.uleb()? as i64)
    }

    fn intern_string(&mut self) -> Result<InternString> {
        let i = self.u32()?;
        if (i as usize) >= self.strings {
            return Err(self.bad());
        }
        Ok(InternString::new(i))
    }

    fn is_at_end(&self) -> bool {
        self.pos == self.data.len()
    }
}

fn encode_key(out: &mut Vec<u8>, key: &GlobalKey) {
    match key {
        GlobalKey::Pair { high, low } => {
            out.push(KEY_PAIR);
            write_uleb(out, *high);
            write_uleb(out, *low);
        }
        GlobalKey::Int(v) => {
            out.push(KEY_INT);
            write_uleb(out, *v as u64);
        }
        GlobalKey::Str(s) => {
            out.push(KEY_STR);
            write_uleb(out, u64::from(s.index()));
        }
        GlobalKey::Uuid(u) => {
            out.push(KEY_UUID);
            out.extend_from_slice(u.as_bytes());
        }
    }
}

fn decode_key(r: &mut Reader) -> Result<GlobalKey> {
    match r.byte()? {
        KEY_PAIR => Ok(GlobalKey::Pair {
            high: r.uleb()?,
            low: r.uleb()?,
        }),
        KEY_INT => Ok(GlobalKey::Int(r.i64()?)),
        KEY_STR => Ok(GlobalKey::Str(r.intern_string()?)),
        KEY_UUID => {
            let bytes = r.bytes(16)?;
            Ok(GlobalKey::Uuid(Uuid::new(bytes.try_into().unwrap())))
        }
        _ => Err(r.bad()),
    }
}

fn encode_path(out: &mut Vec<u8>, path: &Path) {
    write_uleb(out, u64::from(path.table.index()));
    encode_key(out, &path.object);
    write_uleb(out, u64::from(path.field.index()));
    write_uleb(out, path.suffix.len() as u64);
    for elem in &path.suffix {
        match elem {
            PathElem::Field(s) => {
                out.push(ELEM_FIELD);
                write_uleb(out, u64::from(s.index()));
            }
            PathElem::Index(i) => {
                out.push(ELEM_INDEX);
                write_uleb(out, u64::from(*i));
            }
        }
    }
}

fn decode_path(r: &mut Reader) -> Result<Path> {
    let table = r.intern_string()?;
    let object = decode_key(r)?;
    let field = r.intern_string()?;
    let len = r.uleb()? as usize;
    let mut suffix = SmallVec::new();
    for _ in 0..len {
        let elem = match r.byte()? {
            ELEM_FIELD => PathElem::Field(r.intern_string()?),
            ELEM_INDEX => PathElem::Index(r.u32()?),
            _ => return Err(r.bad()),
        };
        suffix.push(elem);
    }
    Ok(Path {
        table,
        object,
        field,
        suffix,
    })
}

fn encode_payload(out: &mut Vec<u8>, value: &Payload) {
    match value {
        Payload::Null => out.push(PAYLOAD_NULL),
        Payload::Erased => out.push(PAYLOAD_ERASED),
        Payload::Int(v) => {
            out.push(PAYLOAD_INT);
            write_uleb(out, *v as u64);
        }
        Payload::Bool(b) => {
            out.push(PAYLOAD_BOOL);
            out.push(u8::from(*b));
        }
        Payload::Float(f) => {
            out.push(PAYLOAD_FLOAT);
            out.extend_from_slice(&f.to_le_bytes());
        }
        Payload::Double(f) => {
            out.push(PAYLOAD_DOUBLE);
            out.extend_from_slice(&f.to_le_bytes());
        }
        Payload::Str(s) => {
            out.push(PAYLOAD_STR);
            write_uleb(out, u64::from(s.index()));
        }
        Payload::Binary(b) => {
            out.push(PAYLOAD_BINARY);
            write_uleb(out, b.len() as u64);
            out.extend_from_slice(b);
        }
        Payload::Timestamp(t) => {
            out.push(PAYLOAD_TIMESTAMP);
            write_uleb(out, t.seconds as u64);
            write_uleb(out, u64::from(t.nanoseconds));
        }
        Payload::Decimal(d) => {
            out.push(PAYLOAD_DECIMAL);
            out.extend_from_slice(&d.serialize());
        }
        Payload::ObjectId(o) => {
            out.push(PAYLOAD_OBJECT_ID);
            out.extend_from_slice(o.as_bytes());
        }
        Payload::Uuid(u) => {
            out.push(PAYLOAD_UUID);
            out.extend_from_slice(u.as_bytes());
        }
        Payload::Link {
            target_table,
            target,
        } => {
            out.push(PAYLOAD_LINK);
            write_uleb(out, u64::from(target_table.index()));
            encode_key(out, target);
        }
        Payload::List => out.push(PAYLOAD_LIST),
        Payload::Dictionary => out.push(PAYLOAD_DICTIONARY),
        Payload::EmbeddedObject => out.push(PAYLOAD_EMBEDDED),
    }
}

fn decode_payload(r: &mut Reader) -> Result<Payload> {
    Ok(match r.byte()? {
        PAYLOAD_NULL => Payload::Null,
        PAYLOAD_ERASED => Payload::Erased,
        PAYLOAD_INT => Payload::Int(r.i64()?),
        PAYLOAD_BOOL => match r.byte()? {
            0 => Payload::Bool(false),
            1 => Payload::Bool(true),
            _ => return Err(r.bad()),
        },
        PAYLOAD_FLOAT => {
            let bytes = r.bytes(4)?;
            Payload::Float(f32::from_le_bytes(bytes.try_into().unwrap()))
        }
        PAYLOAD_DOUBLE => {
            let bytes = r.bytes(8)?;
            Payload::Double(f64::from_le_bytes(bytes.try_into().unwrap()))
        }
        PAYLOAD_STR => Payload::Str(r.intern_string()?),
        PAYLOAD_BINARY => {
            let len = r.uleb()? as usize;
            Payload::Binary(r.bytes(len)?.to_vec())
        }
        PAYLOAD_TIMESTAMP => {
            let seconds = r.i64()?;
            let nanoseconds = r.u32()?;
            Payload::Timestamp(DateTime::new(seconds, nanoseconds))
        }
        PAYLOAD_DECIMAL => {
            let bytes = r.bytes(16)?;
            Payload::Decimal(Decimal::deserialize(bytes.try_into().unwrap()))
        }
        PAYLOAD_OBJECT_ID => {
            let bytes = r.bytes(12)?;
            Payload::ObjectId(ObjectId::new(bytes.try_into().unwrap()))
        }
        PAYLOAD_UUID => {
            let bytes = r.bytes(16)?;
            Payload::Uuid(Uuid::new(bytes.try_into().unwrap()))
        }
        PAYLOAD_LINK => Payload::Link {
            target_table: r.intern_string()?,
            target: decode_key(r)?,
        },
        PAYLOAD_LIST => Payload::List,
        PAYLOAD_DICTIONARY => Payload::Dictionary,
        PAYLOAD_EMBEDDED => Payload::EmbeddedObject,
        _ => Err(r.bad())?,
    })
}

fn decode_column_type(r: &mut Reader) -> Result<ColumnType> {
    Ok(match r.byte()? {
        0 => ColumnType::Int,
        1 => ColumnType::Bool,
        2 => ColumnType::Float,
        3 => ColumnType::Double,
        4 => ColumnType::String,
        5 => ColumnType::Binary,
        6 => ColumnType::Timestamp,
        7 => ColumnType::Decimal,
        8 => ColumnType::ObjectId,
        9 => ColumnType::Uuid,
        10 => ColumnType::Mixed,
        11 => ColumnType::Link,
        _ => return Err(r.bad()),
    })
}

fn decode_bool(r: &mut Reader) -> Result<bool> {
    match r.byte()? {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(r.bad()),
    }
}

/// Encodes one instruction.
pub fn encode_instruction(out: &mut Vec<u8>, instruction: &Instruction) {
    match instruction {
        Instruction::AddTable { table, ty } => {
            out.push(TAG_ADD_TABLE);
            write_uleb(out, u64::from(table.index()));
            match ty {
                TableType::TopLevel { pk: None } => out.push(TABLE_TOP_LEVEL),
                TableType::TopLevel { pk: Some(pk) } => {
                    out.push(TABLE_TOP_LEVEL_PK);
                    write_uleb(out, u64::from(pk.field.index()));
                    out.push(column_type_byte(pk.ty));
                    out.push(u8::from(pk.nullable));
                }
                TableType::Embedded => out.push(TABLE_EMBEDDED),
            }
        }
        Instruction::EraseTable { table } => {
            out.push(TAG_ERASE_TABLE);
            write_uleb(out, u64::from(table.index()));
        }
        Instruction::AddColumn { table, field, spec } => {
            out.push(TAG_ADD_COLUMN);
            write_uleb(out, u64::from(table.index()));
            write_uleb(out, u64::from(field.index()));
            out.push(column_type_byte(spec.ty));
            out.push(u8::from(spec.nullable));
            out.push(collection_kind_byte(spec.collection));
            match spec.link_target {
                None => out.push(0),
                Some(target) => {
                    out.push(1);
                    write_uleb(out, u64::from(target.index()));
                }
            }
        }
        Instruction::EraseColumn { table, field } => {
            out.push(TAG_ERASE_COLUMN);
            write_uleb(out, u64::from(table.index()));
            write_uleb(out, u64::from(field.index()));
        }
        Instruction::CreateObject { table, object } => {
            out.push(TAG_CREATE_OBJECT);
            write_uleb(out, u64::from(table.index()));
            encode_key(out, object);
        }
        Instruction::EraseObject { table, object } => {
            out.push(TAG_ERASE_OBJECT);
            write_uleb(out, u64::from(table.index()));
            encode_key(out, object);
        }
        Instruction::Update {
            path,
            value,
            is_default,
            prior_add,
        } => {
            out.push(TAG_UPDATE);
            encode_path(out, path);
            encode_payload(out, value);
            let mut flags = 0u8;
            if *is_default {
                flags |= 1;
            }
            if prior_add.is_some() {
                flags |= 2;
            }
            out.push(flags);
            if let Some(delta) = prior_add {
                write_uleb(out, *delta as u64);
            }
        }
        Instruction::AddInteger { path, delta } => {
            out.push(TAG_ADD_INTEGER);
            encode_path(out, path);
            write_uleb(out, *delta as u64);
        }
        Instruction::ArrayInsert {
            path,
            value,
            prior_size,
        } => {
            out.push(TAG_ARRAY_INSERT);
            encode_path(out, path);
            encode_payload(out, value);
            write_uleb(out, u64::from(*prior_size));
        }
        Instruction::ArrayMove { path, to } => {
            out.push(TAG_ARRAY_MOVE);
            encode_path(out, path);
            write_uleb(out, u64::from(*to));
        }
        Instruction::ArrayErase { path, prior_size } => {
            out.push(TAG_ARRAY_ERASE);
            encode_path(out, path);
            write_uleb(out, u64::from(*prior_size));
        }
        Instruction::Clear { path, collection } => {
            out.push(TAG_CLEAR);
            encode_path(out, path);
            out.push(container_kind_byte(*collection));
        }
        Instruction::SetInsert { path, value } => {
            out.push(TAG_SET_INSERT);
            encode_path(out, path);
            encode_payload(out, value);
        }
        Instruction::SetErase { path, value } => {
            out.push(TAG_SET_ERASE);
            encode_path(out, path);
            encode_payload(out, value);
        }
    }
}

fn decode_instruction(r: &mut Reader) -> Result<Instruction> {
    Ok(match r.byte()? {
        TAG_ADD_TABLE => {
            let table = r.intern_string()?;
            let ty = match r.byte()? {
                TABLE_TOP_LEVEL => TableType::TopLevel { pk: None },
                TABLE_TOP_LEVEL_PK => TableType::TopLevel {
                    pk: Some(PrimaryKeySpec {
                        field: r.intern_string()?,
                        ty: decode_column_type(r)?,
                        nullable: decode_bool(r)?,
                    }),
                },
                TABLE_EMBEDDED => TableType::Embedded,
                _ => return Err(r.bad()),
            };
            Instruction::AddTable { table, ty }
        }
        TAG_ERASE_TABLE => Instruction::EraseTable {
            table: r.intern_string()?,
        },
        TAG_ADD_COLUMN => {
            let table = r.intern_string()?;
            let field = r.intern_string()?;
            let ty = decode_column_type(r)?;
            let nullable = decode_bool(r)?;
            let collection = match r.byte()? {
                0 => CollectionKind::Single,
                1 => CollectionKind::List,
                2 => CollectionKind::Dictionary,
                3 => CollectionKind::Set,
                _ => return Err(r.bad()),
            };
            let link_target = match r.byte()? {
                0 => None,
                1 => Some(r.intern_string()?),
                _ => return Err(r.bad()),
            };
            Instruction::AddColumn {
                table,
                field,
                spec: ColumnSpec {
                    ty,
                    nullable,
                    collection,
                    link_target,
                },
            }
        }
        TAG_ERASE_COLUMN => Instruction::EraseColumn {
            table: r.intern_string()?,
            field: r.intern_string()?,
        },
        TAG_CREATE_OBJECT => Instruction::CreateObject {
            table: r.intern_string()?,
            object: decode_key(r)?,
        },
        TAG_ERASE_OBJECT => Instruction::EraseObject {
            table: r.intern_string()?,
            object: decode_key(r)?,
        },
        TAG_UPDATE => {
            let path = decode_path(r)?;
            let value = decode_payload(r)?;
            let flags = r.byte()?;
            if flags & !3 != 0 {
                return Err(r.bad());
            }
            let is_default = flags & 1 != 0;
            let prior_add = if flags & 2 != 0 {
                Some(r.i64()?)
            } else {
                None
            };
            Instruction::Update {
                path,
                value,
                is_default,
                prior_add,
            }
        }
        TAG_ADD_INTEGER => Instruction::AddInteger {
            path: decode_path(r)?,
            delta: r.i64()?,
        },
        TAG_ARRAY_INSERT => Instruction::ArrayInsert {
            path: decode_path(r)?,
            value: decode_payload(r)?,
            prior_size: r.u32()?,
        },
        TAG_ARRAY_MOVE => Instruction::ArrayMove {
            path: decode_path(r)?,
            to: r.u32()?,
        },
        TAG_ARRAY_ERASE => Instruction::ArrayErase {
            path: decode_path(r)?,
            prior_size: r.u32()?,
        },
        TAG_CLEAR => Instruction::Clear {
            path: decode_path(r)?,
            collection: match r.byte()? {
                0 => ContainerKind::List,
                1 => ContainerKind::Dictionary,
                2 => ContainerKind::Set,
                _ => return Err(r.bad()),
            },
        },
        TAG_SET_INSERT => Instruction::SetInsert {
            path: decode_path(r)?,
            value: decode_payload(r)?,
        },
        TAG_SET_ERASE => Instruction::SetErase {
            path: decode_path(r)?,
            value: decode_payload(r)?,
        },
        _ => return Err(r.bad()),
    })
}

/// Encodes a changeset: interning table header, then the live
/// instructions in order. Version metadata travels in the enclosing frame
/// or history record, not here, so that concatenating per-changeset
/// encodings reproduces a download message body byte for byte.
pub fn encode_changeset(changeset: &Changeset, out: &mut Vec<u8>) {
    write_uleb(out, changeset.strings().len() as u64);
    for s in changeset.strings().iter() {
        write_uleb(out, s.len() as u64);
        out.extend_from_slice(s.as_bytes());
    }
    write_uleb(out, changeset.iter().count() as u64);
    for (_, instruction) in changeset.iter() {
        encode_instruction(out, instruction);
    }
}

/// Decodes a changeset. Zero-length input is the empty changeset (the
/// form reciprocal transforms of fully-discarded changesets take).
/// Version metadata on the result is zeroed; the caller fills it in from
/// the frame or the history record.
pub fn decode_changeset(data: &[u8]) -> Result<Changeset> {
    let mut changeset = Changeset::new();
    if data.is_empty() {
        return Ok(changeset);
    }
    let mut r = Reader {
        data,
        pos: 0,
        strings: 0,
    };
    let num_strings = r.uleb()? as usize;
    for _ in 0..num_strings {
        let len = r.uleb()? as usize;
        let bytes = r.bytes(len)?;
        let s = std::str::from_utf8(bytes).map_err(|_| Error::bad_format(r.pos))?;
        changeset.intern(s);
    }
    r.strings = num_strings;
    let num_instructions = r.uleb()? as usize;
    for _ in 0..num_instructions {
        let instruction = decode_instruction(&mut r)?;
        changeset.push_raw(instruction);
    }
    if !r.is_at_end() {
        return Err(r.bad());
    }
    Ok(changeset)
}
