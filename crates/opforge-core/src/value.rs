//! Typed runtime scalars.
//!
//! Scalars are passed to native entry points through 8-byte slots: the
//! value's native-endian bytes occupy the start of the slot, so a pointer to
//! the slot is a valid pointer to the value for every supported type.

use std::fmt;

use crate::types::ScalarType;

/// A scalar call argument or return value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    /// `bool`
    Bool(bool),
    /// `int8_t`
    I8(i8),
    /// `int16_t`
    I16(i16),
    /// `int`
    I32(i32),
    /// `int64_t`
    I64(i64),
    /// `uint8_t`
    U8(u8),
    /// `uint16_t`
    U16(u16),
    /// `uint32_t`
    U32(u32),
    /// `uint64_t`
    U64(u64),
    /// `float`
    F32(f32),
    /// `double`
    F64(f64),
}

enum Num {
    Int(i128),
    Float(f64),
}

impl Scalar {
    /// Type of this value.
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            Scalar::Bool(_) => ScalarType::Bool,
            Scalar::I8(_) => ScalarType::I8,
            Scalar::I16(_) => ScalarType::I16,
            Scalar::I32(_) => ScalarType::I32,
            Scalar::I64(_) => ScalarType::I64,
            Scalar::U8(_) => ScalarType::U8,
            Scalar::U16(_) => ScalarType::U16,
            Scalar::U32(_) => ScalarType::U32,
            Scalar::U64(_) => ScalarType::U64,
            Scalar::F32(_) => ScalarType::F32,
            Scalar::F64(_) => ScalarType::F64,
        }
    }

    fn num(&self) -> Num {
        match *self {
            Scalar::Bool(v) => Num::Int(v as i128),
            Scalar::I8(v) => Num::Int(v as i128),
            Scalar::I16(v) => Num::Int(v as i128),
            Scalar::I32(v) => Num::Int(v as i128),
            Scalar::I64(v) => Num::Int(v as i128),
            Scalar::U8(v) => Num::Int(v as i128),
            Scalar::U16(v) => Num::Int(v as i128),
            Scalar::U32(v) => Num::Int(v as i128),
            Scalar::U64(v) => Num::Int(v as i128),
            Scalar::F32(v) => Num::Float(v as f64),
            Scalar::F64(v) => Num::Float(v),
        }
    }

    /// Convert into `target`.
    ///
    /// Integers convert to integers when the value fits, integers and bools
    /// widen to floats, floats convert to floats, and any integer converts to
    /// `bool` by comparing with zero. Floats never convert to integers.
    /// Returns `None` when the conversion is not allowed.
    pub fn convert(&self, target: ScalarType) -> Option<Scalar> {
        if self.scalar_type() == target {
            return Some(*self);
        }
        match (self.num(), target) {
            (_, ScalarType::Void) => None,
            (Num::Int(v), ScalarType::Bool) => Some(Scalar::Bool(v != 0)),
            (Num::Int(v), ScalarType::I8) => i8::try_from(v).ok().map(Scalar::I8),
            (Num::Int(v), ScalarType::I16) => i16::try_from(v).ok().map(Scalar::I16),
            (Num::Int(v), ScalarType::I32) => i32::try_from(v).ok().map(Scalar::I32),
            (Num::Int(v), ScalarType::I64) => i64::try_from(v).ok().map(Scalar::I64),
            (Num::Int(v), ScalarType::U8) => u8::try_from(v).ok().map(Scalar::U8),
            (Num::Int(v), ScalarType::U16) => u16::try_from(v).ok().map(Scalar::U16),
            (Num::Int(v), ScalarType::U32) => u32::try_from(v).ok().map(Scalar::U32),
            (Num::Int(v), ScalarType::U64) => u64::try_from(v).ok().map(Scalar::U64),
            (Num::Int(v), ScalarType::F32) => Some(Scalar::F32(v as f32)),
            (Num::Int(v), ScalarType::F64) => Some(Scalar::F64(v as f64)),
            (Num::Float(v), ScalarType::F32) => Some(Scalar::F32(v as f32)),
            (Num::Float(v), ScalarType::F64) => Some(Scalar::F64(v)),
            (Num::Float(_), _) => None,
        }
    }

    /// Pack into an argument slot.
    pub fn to_slot(&self) -> u64 {
        let mut bytes = [0u8; 8];
        match *self {
            Scalar::Bool(v) => bytes[0] = v as u8,
            Scalar::I8(v) => bytes[..1].copy_from_slice(&v.to_ne_bytes()),
            Scalar::I16(v) => bytes[..2].copy_from_slice(&v.to_ne_bytes()),
            Scalar::I32(v) => bytes[..4].copy_from_slice(&v.to_ne_bytes()),
            Scalar::I64(v) => bytes.copy_from_slice(&v.to_ne_bytes()),
            Scalar::U8(v) => bytes[0] = v,
            Scalar::U16(v) => bytes[..2].copy_from_slice(&v.to_ne_bytes()),
            Scalar::U32(v) => bytes[..4].copy_from_slice(&v.to_ne_bytes()),
            Scalar::U64(v) => bytes.copy_from_slice(&v.to_ne_bytes()),
            Scalar::F32(v) => bytes[..4].copy_from_slice(&v.to_ne_bytes()),
            Scalar::F64(v) => bytes.copy_from_slice(&v.to_ne_bytes()),
        }
        u64::from_ne_bytes(bytes)
    }

    /// Unpack a value of type `ty` from a slot written by native code.
    pub fn from_slot(ty: ScalarType, slot: u64) -> Option<Scalar> {
        let b = slot.to_ne_bytes();
        let value = match ty {
            ScalarType::Void => return None,
            ScalarType::Bool => Scalar::Bool(b[0] != 0),
            ScalarType::I8 => Scalar::I8(i8::from_ne_bytes([b[0]])),
            ScalarType::I16 => Scalar::I16(i16::from_ne_bytes([b[0], b[1]])),
            ScalarType::I32 => Scalar::I32(i32::from_ne_bytes([b[0], b[1], b[2], b[3]])),
            ScalarType::I64 => Scalar::I64(i64::from_ne_bytes(b)),
            ScalarType::U8 => Scalar::U8(b[0]),
            ScalarType::U16 => Scalar::U16(u16::from_ne_bytes([b[0], b[1]])),
            ScalarType::U32 => Scalar::U32(u32::from_ne_bytes([b[0], b[1], b[2], b[3]])),
            ScalarType::U64 => Scalar::U64(u64::from_ne_bytes(b)),
            ScalarType::F32 => Scalar::F32(f32::from_ne_bytes([b[0], b[1], b[2], b[3]])),
            ScalarType::F64 => Scalar::F64(f64::from_ne_bytes(b)),
        };
        Some(value)
    }

    /// Integer view of the value, if it is an integer or bool.
    pub fn as_i64(&self) -> Option<i64> {
        match self.num() {
            Num::Int(v) => i64::try_from(v).ok(),
            Num::Float(_) => None,
        }
    }

    /// Floating-point view of the value.
    pub fn as_f64(&self) -> f64 {
        match self.num() {
            Num::Int(v) => v as f64,
            Num::Float(v) => v,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(v) => write!(f, "{}", v),
            Scalar::I8(v) => write!(f, "{}", v),
            Scalar::I16(v) => write!(f, "{}", v),
            Scalar::I32(v) => write!(f, "{}", v),
            Scalar::I64(v) => write!(f, "{}", v),
            Scalar::U8(v) => write!(f, "{}", v),
            Scalar::U16(v) => write!(f, "{}", v),
            Scalar::U32(v) => write!(f, "{}", v),
            Scalar::U64(v) => write!(f, "{}", v),
            Scalar::F32(v) => write!(f, "{}", v),
            Scalar::F64(v) => write!(f, "{}", v),
        }
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Scalar {
                fn from(v: $ty) -> Self {
                    Scalar::$variant(v)
                }
            }
        )*
    };
}

impl_from! {
    bool => Bool,
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    f32 => F32,
    f64 => F64,
}
