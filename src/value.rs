//! Interpreting the bytes of a leaf field using its debug-info type, and
//! encoding integers to write back.

use crate::layout::unwrap_aliases;
use crate::{Encoding, Error, Result, ScalarKind, Type, TypeDb, TypeId};
use gimli::Reader;
use std::fmt;

/// A decoded leaf value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Unsigned(u64),
    Signed(i64),
    Bool(bool),
    Float(f64),
    Char(u8),
    Pointer(u64),
    /// Anything we know the size of but not how to interpret: arrays,
    /// unions, odd-sized base types.
    Bytes(Vec<u8>),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Unsigned(x) => write!(f, "{}", x),
            Self::Signed(x) => write!(f, "{}", x),
            Self::Bool(x) => write!(f, "{}", x),
            Self::Float(x) => write!(f, "{}", x),
            Self::Char(c) if c.is_ascii_graphic() || *c == b' ' => {
                write!(f, "{:?} ({})", *c as char, c)
            }
            Self::Char(c) => write!(f, "{:#04x}", c),
            Self::Pointer(p) => write!(f, "{:#x}", p),
            Self::Bytes(b) => {
                write!(f, "[")?;
                for (i, byte) in b.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{:02x}", byte)?;
                }
                write!(f, "]")
            }
        }
    }
}

/// Decodes the leading bytes of `buffer` as a value of type `type_id`.
///
/// `buffer` must hold at least as many bytes as the type is big.
pub fn decode(db: &TypeDb, type_id: TypeId, buffer: &[u8]) -> Result<Value> {
    let (_, ty) = unwrap_aliases(db, type_id)?;
    // Flexible array members and the like have no size; they decode to no
    // bytes, matching the zero-size leaf `flatten` gives them.
    let size = ty.byte_size(db).unwrap_or(0);
    let size = usize::try_from(size)
        .map_err(|_| Error::Format(format!("type of {} bytes", size)))?;
    let bytes = buffer.get(..size).ok_or_else(|| {
        Error::Format(format!(
            "{} bytes given for a {}-byte {}",
            buffer.len(),
            size,
            ty.name(db)
        ))
    })?;
    let mut r = gimli::EndianSlice::new(bytes, db.endian());

    let value = match ty {
        Type::Scalar(s) => match (&s.kind, size) {
            (ScalarKind::Base(Encoding::Unsigned), 1 | 2 | 4 | 8) => {
                Value::Unsigned(read_unsigned(&mut r, size)?)
            }
            (ScalarKind::Base(Encoding::Signed), 1 | 2 | 4 | 8)
            | (ScalarKind::Enum, 1 | 2 | 4 | 8) => {
                Value::Signed(read_signed(&mut r, size)?)
            }
            (ScalarKind::Base(Encoding::Boolean), 1 | 2 | 4 | 8) => {
                Value::Bool(read_unsigned(&mut r, size)? != 0)
            }
            (
                ScalarKind::Base(Encoding::UnsignedChar | Encoding::SignedChar),
                1,
            ) => Value::Char(r.read_u8()?),
            (ScalarKind::Base(Encoding::Float), 4) => {
                Value::Float(f64::from(r.read_f32()?))
            }
            (ScalarKind::Base(Encoding::Float), 8) => Value::Float(r.read_f64()?),
            (ScalarKind::Pointer { .. }, 4 | 8) => {
                Value::Pointer(read_unsigned(&mut r, size)?)
            }
            _ => Value::Bytes(bytes.to_vec()),
        },
        Type::Struct(_) | Type::Alias(_) => Value::Bytes(bytes.to_vec()),
    };
    Ok(value)
}

fn read_unsigned(r: &mut gimli::EndianSlice<gimli::RunTimeEndian>, size: usize) -> Result<u64> {
    Ok(match size {
        1 => u64::from(r.read_u8()?),
        2 => u64::from(r.read_u16()?),
        4 => u64::from(r.read_u32()?),
        _ => r.read_u64()?,
    })
}

fn read_signed(r: &mut gimli::EndianSlice<gimli::RunTimeEndian>, size: usize) -> Result<i64> {
    Ok(match size {
        1 => i64::from(r.read_i8()?),
        2 => i64::from(r.read_i16()?),
        4 => i64::from(r.read_i32()?),
        _ => r.read_i64()?,
    })
}

/// Encodes `value` as the integer-like type `type_id` (integers, booleans,
/// chars, enums and pointers), in the program's byte order.
///
/// Fails with `Unencodable` if the type isn't integer-like or the value
/// doesn't fit.
pub fn encode_integer(db: &TypeDb, type_id: TypeId, value: i128) -> Result<Vec<u8>> {
    let (_, ty) = unwrap_aliases(db, type_id)?;
    let unencodable = || Error::Unencodable {
        value: value.to_string(),
        type_name: ty.name(db).into_owned(),
    };
    let signed = match ty {
        Type::Scalar(s) => match &s.kind {
            ScalarKind::Base(Encoding::Signed | Encoding::SignedChar)
            | ScalarKind::Enum => true,
            ScalarKind::Base(
                Encoding::Unsigned | Encoding::UnsignedChar | Encoding::Boolean,
            )
            | ScalarKind::Pointer { .. } => false,
            _ => return Err(unencodable()),
        },
        _ => return Err(unencodable()),
    };
    let size = ty.byte_size(db).ok_or_else(unencodable)?;
    if !matches!(size, 1 | 2 | 4 | 8) {
        return Err(unencodable());
    }
    let bits = size * 8;
    let (min, max) = if signed {
        (-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1)
    } else {
        (0, (1i128 << bits) - 1)
    };
    if value < min || value > max {
        return Err(unencodable());
    }

    let size = size as usize;
    let bytes = match db.endian() {
        gimli::RunTimeEndian::Little => value.to_le_bytes()[..size].to_vec(),
        gimli::RunTimeEndian::Big => value.to_be_bytes()[16 - size..].to_vec(),
    };
    Ok(bytes)
}
