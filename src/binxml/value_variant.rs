use std::fmt::{self, Write};

use encoding::EncodingRef;
use jiff::Timestamp;
use log::{trace, warn};
use serde_json::{Value, json};
use winstructs::guid::Guid;
use winstructs::security::Sid;

use crate::err::{DeserializationError, DeserializationResult as Result};
use crate::model::xml::XmlNode;
use crate::utils::{ByteCursor, format_timestamp};

/// A decoded BinXML value. Values own their data so that events outlive the chunk buffer.
#[derive(Debug, PartialEq, Clone)]
pub enum BinXmlValue {
    NullType,
    StringType(String),
    AnsiStringType(String),
    Int8Type(i8),
    UInt8Type(u8),
    Int16Type(i16),
    UInt16Type(u16),
    Int32Type(i32),
    UInt32Type(u32),
    Int64Type(i64),
    UInt64Type(u64),
    Real32Type(f32),
    Real64Type(f64),
    BoolType(bool),
    BinaryType(Vec<u8>),
    GuidType(Guid),
    SizeTType(u64),
    FileTimeType(Timestamp),
    SysTimeType(Timestamp),
    SidType(Sid),
    HexInt32Type(u32),
    HexInt64Type(u64),
    /// An embedded BinXML fragment, already decoded.
    BinXmlType(Vec<XmlNode>),
    StringArrayType(Vec<String>),
    Int8ArrayType(Vec<i8>),
    UInt8ArrayType(Vec<u8>),
    Int16ArrayType(Vec<i16>),
    UInt16ArrayType(Vec<u16>),
    Int32ArrayType(Vec<i32>),
    UInt32ArrayType(Vec<u32>),
    Int64ArrayType(Vec<i64>),
    UInt64ArrayType(Vec<u64>),
    Real32ArrayType(Vec<f32>),
    Real64ArrayType(Vec<f64>),
    BoolArrayType(Vec<bool>),
    GuidArrayType(Vec<Guid>),
    FileTimeArrayType(Vec<Timestamp>),
    SysTimeArrayType(Vec<Timestamp>),
    SidArrayType(Vec<Sid>),
    HexInt32ArrayType(Vec<u32>),
    HexInt64ArrayType(Vec<u64>),
    /// Bytes that could not be interpreted as their declared type.
    Raw { type_code: u8, bytes: Vec<u8> },
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum BinXmlValueType {
    NullType,
    StringType,
    AnsiStringType,
    Int8Type,
    UInt8Type,
    Int16Type,
    UInt16Type,
    Int32Type,
    UInt32Type,
    Int64Type,
    UInt64Type,
    Real32Type,
    Real64Type,
    BoolType,
    BinaryType,
    GuidType,
    SizeTType,
    FileTimeType,
    SysTimeType,
    SidType,
    HexInt32Type,
    HexInt64Type,
    EvtHandle,
    BinXmlType,
    EvtXmlType,
    StringArrayType,
    AnsiStringArrayType,
    Int8ArrayType,
    UInt8ArrayType,
    Int16ArrayType,
    UInt16ArrayType,
    Int32ArrayType,
    UInt32ArrayType,
    Int64ArrayType,
    UInt64ArrayType,
    Real32ArrayType,
    Real64ArrayType,
    BoolArrayType,
    BinaryArrayType,
    GuidArrayType,
    SizeTArrayType,
    FileTimeArrayType,
    SysTimeArrayType,
    SidArrayType,
    HexInt32ArrayType,
    HexInt64ArrayType,
}

impl BinXmlValueType {
    pub fn from_u8(byte: u8) -> Option<BinXmlValueType> {
        use BinXmlValueType::*;
        let value_type = match byte {
            0x00 => NullType,
            0x01 => StringType,
            0x02 => AnsiStringType,
            0x03 => Int8Type,
            0x04 => UInt8Type,
            0x05 => Int16Type,
            0x06 => UInt16Type,
            0x07 => Int32Type,
            0x08 => UInt32Type,
            0x09 => Int64Type,
            0x0a => UInt64Type,
            0x0b => Real32Type,
            0x0c => Real64Type,
            0x0d => BoolType,
            0x0e => BinaryType,
            0x0f => GuidType,
            0x10 => SizeTType,
            0x11 => FileTimeType,
            0x12 => SysTimeType,
            0x13 => SidType,
            0x14 => HexInt32Type,
            0x15 => HexInt64Type,
            0x20 => EvtHandle,
            0x21 => BinXmlType,
            0x23 => EvtXmlType,
            0x81 => StringArrayType,
            0x82 => AnsiStringArrayType,
            0x83 => Int8ArrayType,
            0x84 => UInt8ArrayType,
            0x85 => Int16ArrayType,
            0x86 => UInt16ArrayType,
            0x87 => Int32ArrayType,
            0x88 => UInt32ArrayType,
            0x89 => Int64ArrayType,
            0x8a => UInt64ArrayType,
            0x8b => Real32ArrayType,
            0x8c => Real64ArrayType,
            0x8d => BoolArrayType,
            0x8e => BinaryArrayType,
            0x8f => GuidArrayType,
            0x90 => SizeTArrayType,
            0x91 => FileTimeArrayType,
            0x92 => SysTimeArrayType,
            0x93 => SidArrayType,
            0x94 => HexInt32ArrayType,
            0x95 => HexInt64ArrayType,
            _ => return None,
        };
        Some(value_type)
    }

    /// Whether an instance value declared as `supplied` may fill a placeholder of this type.
    ///
    /// Null always fits. `SizeT` is interchangeable with the hex integer it was read as.
    pub fn accepts(self, supplied: BinXmlValueType) -> bool {
        use BinXmlValueType::*;
        self == supplied
            || supplied == NullType
            || matches!(
                (self, supplied),
                (SizeTType, HexInt32Type | HexInt64Type) | (HexInt32Type | HexInt64Type, SizeTType)
            )
    }
}

fn fixed_array<const N: usize, T>(
    cursor: &mut ByteCursor<'_>,
    size: u16,
    what: &'static str,
    parse: impl Fn([u8; N]) -> T,
) -> Result<Vec<T>> {
    let size = usize::from(size);
    let start = cursor.pos();
    if size % N != 0 {
        return Err(DeserializationError::UnimplementedValueVariant {
            name: format!("{what} (misaligned size)"),
            size: u16::try_from(size).ok(),
            offset: start as u64,
        });
    }
    let raw = cursor.take_bytes(size, what)?;
    Ok(raw
        .chunks_exact(N)
        .map(|chunk| {
            let mut buf = [0_u8; N];
            buf.copy_from_slice(chunk);
            parse(buf)
        })
        .collect())
}

fn sized_vec<T>(
    cursor: &mut ByteCursor<'_>,
    size: u16,
    mut read_one: impl FnMut(&mut ByteCursor<'_>) -> Result<T>,
) -> Result<Vec<T>> {
    let end = cursor.pos() + usize::from(size);
    let mut out = Vec::new();
    while cursor.pos() < end {
        let before = cursor.pos();
        out.push(read_one(cursor)?);
        if cursor.pos() == before {
            break;
        }
    }
    Ok(out)
}

impl BinXmlValue {
    /// Read a value of `value_type`. `size` is known for substitution values and absent for
    /// inline value tokens.
    ///
    /// Embedded BinXML is decoded by the deserializer, which owns the chunk context.
    pub(crate) fn from_cursor(
        value_type: BinXmlValueType,
        cursor: &mut ByteCursor<'_>,
        size: Option<u16>,
        ansi_codec: EncodingRef,
    ) -> Result<BinXmlValue> {
        trace!(
            "Offset `0x{offset:08x} ({offset}): {value_type:?}, {size:?}",
            offset = cursor.position(),
        );

        let unimplemented = |name: &str, offset: u64| DeserializationError::UnimplementedValueVariant {
            name: name.to_owned(),
            size,
            offset,
        };

        let value = match (value_type, size) {
            (BinXmlValueType::NullType, _) => BinXmlValue::NullType,
            (BinXmlValueType::StringType, Some(sz)) => {
                BinXmlValue::StringType(cursor.utf16_by_char_count(usize::from(sz) / 2, "string")?)
            }
            (BinXmlValueType::StringType, None) => {
                BinXmlValue::StringType(cursor.len_prefixed_utf16_string(false, "string")?)
            }
            (BinXmlValueType::AnsiStringType, Some(sz)) => BinXmlValue::AnsiStringType(
                cursor.ansi_string(usize::from(sz), ansi_codec, "ansi string")?,
            ),
            (BinXmlValueType::Int8Type, _) => BinXmlValue::Int8Type(cursor.u8()? as i8),
            (BinXmlValueType::UInt8Type, _) => BinXmlValue::UInt8Type(cursor.u8()?),
            (BinXmlValueType::Int16Type, _) => {
                BinXmlValue::Int16Type(i16::from_le_bytes(cursor.array::<2>("i16")?))
            }
            (BinXmlValueType::UInt16Type, _) => BinXmlValue::UInt16Type(cursor.u16()?),
            (BinXmlValueType::Int32Type, _) => {
                BinXmlValue::Int32Type(i32::from_le_bytes(cursor.array::<4>("i32")?))
            }
            (BinXmlValueType::UInt32Type, _) => BinXmlValue::UInt32Type(cursor.u32()?),
            (BinXmlValueType::Int64Type, _) => {
                BinXmlValue::Int64Type(i64::from_le_bytes(cursor.array::<8>("i64")?))
            }
            (BinXmlValueType::UInt64Type, _) => BinXmlValue::UInt64Type(cursor.u64()?),
            (BinXmlValueType::Real32Type, _) => {
                BinXmlValue::Real32Type(f32::from_le_bytes(cursor.array::<4>("f32")?))
            }
            (BinXmlValueType::Real64Type, _) => {
                BinXmlValue::Real64Type(f64::from_le_bytes(cursor.array::<8>("f64")?))
            }
            (BinXmlValueType::BoolType, _) => {
                let raw = i32::from_le_bytes(cursor.array::<4>("bool")?);
                if raw != 0 && raw != 1 {
                    warn!(
                        "invalid boolean value {} at offset {}; treating as {}",
                        raw,
                        cursor.position(),
                        raw != 0
                    );
                }
                BinXmlValue::BoolType(raw != 0)
            }
            (BinXmlValueType::BinaryType, Some(sz)) => {
                BinXmlValue::BinaryType(cursor.take_bytes(usize::from(sz), "binary")?.to_vec())
            }
            (BinXmlValueType::GuidType, _) => BinXmlValue::GuidType(cursor.guid()?),
            (BinXmlValueType::SizeTType, Some(4)) => BinXmlValue::SizeTType(u64::from(cursor.u32()?)),
            (BinXmlValueType::SizeTType, Some(8) | None) => BinXmlValue::SizeTType(cursor.u64()?),
            (BinXmlValueType::FileTimeType, _) => {
                BinXmlValue::FileTimeType(cursor.filetime("filetime")?)
            }
            (BinXmlValueType::SysTimeType, _) => BinXmlValue::SysTimeType(cursor.systime()?),
            (BinXmlValueType::SidType, _) => BinXmlValue::SidType(cursor.sid()?),
            (BinXmlValueType::HexInt32Type, _) => BinXmlValue::HexInt32Type(cursor.u32()?),
            (BinXmlValueType::HexInt64Type, _) => BinXmlValue::HexInt64Type(cursor.u64()?),

            // Array types are always sized.
            (BinXmlValueType::StringArrayType, Some(sz)) => {
                BinXmlValue::StringArrayType(sized_vec(cursor, sz, |c| {
                    let start = c.pos();
                    let remaining = c.remaining() / 2;
                    let units = c.buf()[start..start + remaining * 2]
                        .chunks_exact(2)
                        .position(|pair| pair[0] == 0 && pair[1] == 0)
                        .map_or(remaining, |nul| nul + 1);
                    c.utf16_by_char_count(units, "string array")
                })?)
            }
            (BinXmlValueType::Int8ArrayType, Some(sz)) => {
                BinXmlValue::Int8ArrayType(fixed_array(cursor, sz, "i8 array", |b: [u8; 1]| {
                    b[0] as i8
                })?)
            }
            (BinXmlValueType::UInt8ArrayType, Some(sz)) => {
                BinXmlValue::UInt8ArrayType(cursor.take_bytes(usize::from(sz), "u8 array")?.to_vec())
            }
            (BinXmlValueType::Int16ArrayType, Some(sz)) => BinXmlValue::Int16ArrayType(
                fixed_array(cursor, sz, "i16 array", i16::from_le_bytes)?,
            ),
            (BinXmlValueType::UInt16ArrayType, Some(sz)) => BinXmlValue::UInt16ArrayType(
                fixed_array(cursor, sz, "u16 array", u16::from_le_bytes)?,
            ),
            (BinXmlValueType::Int32ArrayType, Some(sz)) => BinXmlValue::Int32ArrayType(
                fixed_array(cursor, sz, "i32 array", i32::from_le_bytes)?,
            ),
            (BinXmlValueType::UInt32ArrayType, Some(sz)) => BinXmlValue::UInt32ArrayType(
                fixed_array(cursor, sz, "u32 array", u32::from_le_bytes)?,
            ),
            (BinXmlValueType::Int64ArrayType, Some(sz)) => BinXmlValue::Int64ArrayType(
                fixed_array(cursor, sz, "i64 array", i64::from_le_bytes)?,
            ),
            (BinXmlValueType::UInt64ArrayType, Some(sz)) => BinXmlValue::UInt64ArrayType(
                fixed_array(cursor, sz, "u64 array", u64::from_le_bytes)?,
            ),
            (BinXmlValueType::Real32ArrayType, Some(sz)) => BinXmlValue::Real32ArrayType(
                fixed_array(cursor, sz, "f32 array", f32::from_le_bytes)?,
            ),
            (BinXmlValueType::Real64ArrayType, Some(sz)) => BinXmlValue::Real64ArrayType(
                fixed_array(cursor, sz, "f64 array", f64::from_le_bytes)?,
            ),
            (BinXmlValueType::BoolArrayType, Some(sz)) => {
                BinXmlValue::BoolArrayType(fixed_array(cursor, sz, "bool array", |b| {
                    i32::from_le_bytes(b) != 0
                })?)
            }
            (BinXmlValueType::GuidArrayType, Some(sz)) => {
                if usize::from(sz) % 16 != 0 {
                    return Err(unimplemented("GuidArray (misaligned size)", cursor.position()));
                }
                BinXmlValue::GuidArrayType(sized_vec(cursor, sz, |c| c.guid())?)
            }
            (BinXmlValueType::FileTimeArrayType, Some(sz)) => {
                if usize::from(sz) % 8 != 0 {
                    return Err(unimplemented("FileTimeArray (misaligned size)", cursor.position()));
                }
                BinXmlValue::FileTimeArrayType(sized_vec(cursor, sz, |c| c.filetime("filetime"))?)
            }
            (BinXmlValueType::SysTimeArrayType, Some(sz)) => {
                if usize::from(sz) % 16 != 0 {
                    return Err(unimplemented("SysTimeArray (misaligned size)", cursor.position()));
                }
                BinXmlValue::SysTimeArrayType(sized_vec(cursor, sz, |c| c.systime())?)
            }
            (BinXmlValueType::SidArrayType, Some(sz)) => {
                BinXmlValue::SidArrayType(sized_vec(cursor, sz, |c| c.sid())?)
            }
            (BinXmlValueType::HexInt32ArrayType, Some(sz)) => BinXmlValue::HexInt32ArrayType(
                fixed_array(cursor, sz, "hex32 array", u32::from_le_bytes)?,
            ),
            (BinXmlValueType::HexInt64ArrayType, Some(sz)) => BinXmlValue::HexInt64ArrayType(
                fixed_array(cursor, sz, "hex64 array", u64::from_le_bytes)?,
            ),
            (other, _) => return Err(unimplemented(&format!("{other:?}"), cursor.position())),
        };

        Ok(value)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, BinXmlValue::NullType)
    }

    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            BinXmlValue::Int8Type(v) => u64::try_from(v).ok(),
            BinXmlValue::UInt8Type(v) => Some(u64::from(v)),
            BinXmlValue::Int16Type(v) => u64::try_from(v).ok(),
            BinXmlValue::UInt16Type(v) => Some(u64::from(v)),
            BinXmlValue::Int32Type(v) => u64::try_from(v).ok(),
            BinXmlValue::UInt32Type(v) | BinXmlValue::HexInt32Type(v) => Some(u64::from(v)),
            BinXmlValue::Int64Type(v) => u64::try_from(v).ok(),
            BinXmlValue::UInt64Type(v) | BinXmlValue::HexInt64Type(v) | BinXmlValue::SizeTType(v) => {
                Some(v)
            }
            _ => None,
        }
    }

    pub fn to_json_value(&self) -> Value {
        match self {
            BinXmlValue::NullType => Value::Null,
            BinXmlValue::StringType(s) | BinXmlValue::AnsiStringType(s) => json!(s),
            BinXmlValue::Int8Type(v) => json!(v),
            BinXmlValue::UInt8Type(v) => json!(v),
            BinXmlValue::Int16Type(v) => json!(v),
            BinXmlValue::UInt16Type(v) => json!(v),
            BinXmlValue::Int32Type(v) => json!(v),
            BinXmlValue::UInt32Type(v) => json!(v),
            BinXmlValue::Int64Type(v) => json!(v),
            BinXmlValue::UInt64Type(v) => json!(v),
            BinXmlValue::Real32Type(v) => json!(v),
            BinXmlValue::Real64Type(v) => json!(v),
            BinXmlValue::BoolType(v) => json!(v),
            BinXmlValue::Int8ArrayType(v) => json!(v),
            BinXmlValue::UInt8ArrayType(v) => json!(v),
            BinXmlValue::Int16ArrayType(v) => json!(v),
            BinXmlValue::UInt16ArrayType(v) => json!(v),
            BinXmlValue::Int32ArrayType(v) => json!(v),
            BinXmlValue::UInt32ArrayType(v) => json!(v),
            BinXmlValue::Int64ArrayType(v) => json!(v),
            BinXmlValue::UInt64ArrayType(v) => json!(v),
            BinXmlValue::Real32ArrayType(v) => json!(v),
            BinXmlValue::Real64ArrayType(v) => json!(v),
            BinXmlValue::BoolArrayType(v) => json!(v),
            BinXmlValue::StringArrayType(v) => json!(v),
            BinXmlValue::GuidArrayType(v) => json!(v.iter().map(Guid::to_string).collect::<Vec<_>>()),
            BinXmlValue::FileTimeArrayType(v) | BinXmlValue::SysTimeArrayType(v) => {
                json!(v.iter().map(format_timestamp).collect::<Vec<_>>())
            }
            BinXmlValue::SidArrayType(v) => json!(v.iter().map(Sid::to_string).collect::<Vec<_>>()),
            BinXmlValue::HexInt32ArrayType(v) => {
                json!(v.iter().map(|x| format!("0x{x:x}")).collect::<Vec<_>>())
            }
            BinXmlValue::HexInt64ArrayType(v) => {
                json!(v.iter().map(|x| format!("0x{x:x}")).collect::<Vec<_>>())
            }
            other => json!(other.to_string()),
        }
    }
}

fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02X}");
    }
    f.write_str(&s)
}

fn write_joined<T>(
    f: &mut fmt::Formatter<'_>,
    items: &[T],
    mut item: impl FnMut(&mut fmt::Formatter<'_>, &T) -> fmt::Result,
) -> fmt::Result {
    for (i, v) in items.iter().enumerate() {
        if i > 0 {
            f.write_char(',')?;
        }
        item(f, v)?;
    }
    Ok(())
}

impl fmt::Display for BinXmlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BinXmlValue::NullType | BinXmlValue::BinXmlType(_) => Ok(()),
            BinXmlValue::StringType(s) | BinXmlValue::AnsiStringType(s) => f.write_str(s),
            BinXmlValue::Int8Type(v) => write!(f, "{v}"),
            BinXmlValue::UInt8Type(v) => write!(f, "{v}"),
            BinXmlValue::Int16Type(v) => write!(f, "{v}"),
            BinXmlValue::UInt16Type(v) => write!(f, "{v}"),
            BinXmlValue::Int32Type(v) => write!(f, "{v}"),
            BinXmlValue::UInt32Type(v) => write!(f, "{v}"),
            BinXmlValue::Int64Type(v) => write!(f, "{v}"),
            BinXmlValue::UInt64Type(v) => write!(f, "{v}"),
            BinXmlValue::Real32Type(v) => write!(f, "{v}"),
            BinXmlValue::Real64Type(v) => write!(f, "{v}"),
            BinXmlValue::BoolType(v) => write!(f, "{v}"),
            BinXmlValue::BinaryType(bytes) => write_hex(f, bytes),
            BinXmlValue::GuidType(guid) => write!(f, "{guid}"),
            BinXmlValue::SizeTType(v) | BinXmlValue::HexInt64Type(v) => write!(f, "0x{v:x}"),
            BinXmlValue::HexInt32Type(v) => write!(f, "0x{v:x}"),
            BinXmlValue::FileTimeType(ts) | BinXmlValue::SysTimeType(ts) => {
                f.write_str(&format_timestamp(ts))
            }
            BinXmlValue::SidType(sid) => write!(f, "{sid}"),
            BinXmlValue::StringArrayType(v) => write_joined(f, v, |f, s| f.write_str(s)),
            BinXmlValue::Int8ArrayType(v) => write_joined(f, v, |f, x| write!(f, "{x}")),
            BinXmlValue::UInt8ArrayType(v) => write_joined(f, v, |f, x| write!(f, "{x}")),
            BinXmlValue::Int16ArrayType(v) => write_joined(f, v, |f, x| write!(f, "{x}")),
            BinXmlValue::UInt16ArrayType(v) => write_joined(f, v, |f, x| write!(f, "{x}")),
            BinXmlValue::Int32ArrayType(v) => write_joined(f, v, |f, x| write!(f, "{x}")),
            BinXmlValue::UInt32ArrayType(v) => write_joined(f, v, |f, x| write!(f, "{x}")),
            BinXmlValue::Int64ArrayType(v) => write_joined(f, v, |f, x| write!(f, "{x}")),
            BinXmlValue::UInt64ArrayType(v) => write_joined(f, v, |f, x| write!(f, "{x}")),
            BinXmlValue::Real32ArrayType(v) => write_joined(f, v, |f, x| write!(f, "{x}")),
            BinXmlValue::Real64ArrayType(v) => write_joined(f, v, |f, x| write!(f, "{x}")),
            BinXmlValue::BoolArrayType(v) => write_joined(f, v, |f, x| write!(f, "{x}")),
            BinXmlValue::GuidArrayType(v) => write_joined(f, v, |f, x| write!(f, "{x}")),
            BinXmlValue::FileTimeArrayType(v) | BinXmlValue::SysTimeArrayType(v) => {
                write_joined(f, v, |f, x| f.write_str(&format_timestamp(x)))
            }
            BinXmlValue::SidArrayType(v) => write_joined(f, v, |f, x| write!(f, "{x}")),
            BinXmlValue::HexInt32ArrayType(v) => write_joined(f, v, |f, x| write!(f, "0x{x:x}")),
            BinXmlValue::HexInt64ArrayType(v) => write_joined(f, v, |f, x| write!(f, "0x{x:x}")),
            BinXmlValue::Raw { bytes, .. } => write_hex(f, bytes),
        }
    }
}
