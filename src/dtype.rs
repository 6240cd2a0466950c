use std::fmt;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::Error;

/// Scalar kind of a [`DataType`]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Int,
    UInt,
    Float,
    BFloat16,
    Float8,
    Handle,
    Bool,
    Void,
}

/// Semantic datatype of an IR value: kind, bit width and vector lanes
///
/// `lanes == 1` denotes a scalar. Handles are always scalar.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DataType {
    pub kind: TypeKind,
    pub bits: u8,
    pub lanes: u16,
}

impl DataType {
    #[must_use]
    pub const fn new(kind: TypeKind, bits: u8, lanes: u16) -> Self {
        Self { kind, bits, lanes }
    }

    #[must_use]
    pub const fn int(bits: u8) -> Self {
        Self::new(TypeKind::Int, bits, 1)
    }

    #[must_use]
    pub const fn uint(bits: u8) -> Self {
        Self::new(TypeKind::UInt, bits, 1)
    }

    #[must_use]
    pub const fn float(bits: u8) -> Self {
        Self::new(TypeKind::Float, bits, 1)
    }

    #[must_use]
    pub const fn i8() -> Self {
        Self::int(8)
    }

    #[must_use]
    pub const fn i16() -> Self {
        Self::int(16)
    }

    #[must_use]
    pub const fn i32() -> Self {
        Self::int(32)
    }

    #[must_use]
    pub const fn i64() -> Self {
        Self::int(64)
    }

    #[must_use]
    pub const fn u8() -> Self {
        Self::uint(8)
    }

    #[must_use]
    pub const fn u16() -> Self {
        Self::uint(16)
    }

    #[must_use]
    pub const fn u32() -> Self {
        Self::uint(32)
    }

    #[must_use]
    pub const fn f16() -> Self {
        Self::float(16)
    }

    #[must_use]
    pub const fn f32() -> Self {
        Self::float(32)
    }

    #[must_use]
    pub const fn f64() -> Self {
        Self::float(64)
    }

    #[must_use]
    pub const fn bf16() -> Self {
        Self::new(TypeKind::BFloat16, 16, 1)
    }

    #[must_use]
    pub const fn handle() -> Self {
        Self::new(TypeKind::Handle, 64, 1)
    }

    #[must_use]
    pub const fn bool() -> Self {
        Self::new(TypeKind::Bool, 1, 1)
    }

    #[must_use]
    pub const fn void() -> Self {
        Self::new(TypeKind::Void, 0, 1)
    }

    #[must_use]
    pub const fn with_lanes(self, lanes: u16) -> Self {
        Self { lanes, ..self }
    }

    /// The scalar element type of a vector
    #[must_use]
    pub const fn element_of(self) -> Self {
        self.with_lanes(1)
    }

    #[must_use]
    pub const fn is_scalar(self) -> bool {
        self.lanes == 1
    }

    #[must_use]
    pub const fn is_vector(self) -> bool {
        self.lanes > 1
    }

    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self.kind, TypeKind::Float)
    }

    #[must_use]
    pub const fn is_int(self) -> bool {
        matches!(self.kind, TypeKind::Int)
    }

    #[must_use]
    pub const fn is_uint(self) -> bool {
        matches!(self.kind, TypeKind::UInt)
    }

    #[must_use]
    pub const fn is_handle(self) -> bool {
        matches!(self.kind, TypeKind::Handle)
    }

    /// Byte width of one scalar element
    #[must_use]
    pub const fn elem_bytes(self) -> i64 {
        ((self.bits as i64) + 7) / 8
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let base = match self.kind {
            TypeKind::Int => "int",
            TypeKind::UInt => "uint",
            TypeKind::Float => "float",
            TypeKind::BFloat16 => "bfloat",
            TypeKind::Float8 => "float8_e",
            TypeKind::Handle => "handle",
            TypeKind::Bool => "bool",
            TypeKind::Void => "void",
        };
        match self.kind {
            TypeKind::Handle | TypeKind::Bool | TypeKind::Void => write!(f, "{base}")?,
            _ => write!(f, "{base}{}", self.bits)?,
        }
        if self.lanes > 1 {
            write!(f, "x{}", self.lanes)?;
        }
        Ok(())
    }
}

/// Spelling of a scalar integer for the default (TPU-flavored) surface
fn int_token(t: DataType) -> Option<String> {
    let u = if t.is_uint() { "u" } else { "" };
    let base = match t.bits {
        1 | 4 => "int".to_string(),
        8 => {
            if t.is_uint() {
                "char".to_string()
            } else {
                "signed char".to_string()
            }
        }
        16 => "short".to_string(),
        32 => "int".to_string(),
        64 => "int64_t".to_string(),
        _ => return None,
    };
    Some(format!("{u}{base}"))
}

/// Map a datatype to its C spelling on the TPU surface.
///
/// Wide vectors with 4 < lanes <= 8 are packed into double-width carriers
/// (`ulonglong{n}` for 32-bit, `uint{n}`/`int{n}` for 16-bit elements); the
/// emitter then goes through element accessors that split each packed lane.
pub fn type_token(t: DataType) -> Result<String, Error> {
    let lanes = t.lanes;
    match t.kind {
        TypeKind::Handle => {
            if t.is_scalar() {
                Ok("void*".to_string())
            } else {
                Err(Error::UnsupportedType(t))
            }
        }
        TypeKind::Void => Ok("void".to_string()),
        TypeKind::Bool => {
            if t.is_scalar() {
                Ok("bool".to_string())
            } else if lanes <= 4 {
                Ok(format!("ushort{lanes}"))
            } else {
                Err(Error::UnsupportedType(t))
            }
        }
        TypeKind::Float => match (t.bits, lanes) {
            (16, 1) => Ok("half_t".to_string()),
            (16, 2..=4) => Ok(format!("half{lanes}")),
            (16, 5..=8) if lanes % 2 == 0 => Ok(format!("uint{}", lanes / 2)),
            (32, 1) => Ok("float".to_string()),
            (32, 2..=4) => Ok(format!("float{lanes}")),
            (32, 5..=8) if lanes % 2 == 0 => Ok(format!("ulonglong{}", lanes / 2)),
            (64, 1) => Ok("double".to_string()),
            (64, 2..=4) => Ok(format!("double{lanes}")),
            _ => Err(Error::UnsupportedType(t)),
        },
        TypeKind::BFloat16 => match lanes {
            1 => Ok("bfloat16_t".to_string()),
            2..=8 if lanes % 2 == 0 => Ok(format!("uint{}", lanes / 2)),
            _ => Err(Error::UnsupportedType(t)),
        },
        TypeKind::Float8 => match lanes {
            1 => Ok("unsigned char".to_string()),
            2 => Ok("unsigned short int".to_string()),
            4 => Ok("unsigned int".to_string()),
            _ => Err(Error::UnsupportedType(t)),
        },
        TypeKind::Int | TypeKind::UInt => {
            let scalar = int_token(t).ok_or(Error::UnsupportedType(t))?;
            match (t.bits, lanes) {
                (_, 1) => Ok(scalar),
                (8, 4) => Ok("int".to_string()),
                (8, 8) => Ok("int2".to_string()),
                (8, 16) => Ok("int4".to_string()),
                (16, 2..=4) => {
                    Ok(format!("{}short{lanes}", if t.is_uint() { "u" } else { "" }))
                }
                (16, 5..=8) if lanes % 2 == 0 => Ok(format!("int{}", lanes / 2)),
                (32, 2..=4) => Ok(format!("{}int{lanes}", if t.is_uint() { "u" } else { "" })),
                (32, 5..=8) if lanes % 2 == 0 => Ok(format!("longlong{}", lanes / 2)),
                (64, 2..=4) => Ok(format!("longlong{lanes}")),
                _ => Err(Error::UnsupportedType(t)),
            }
        }
    }
}

/// Map a datatype to its C spelling on the RVV surface.
///
/// Deviations from [`type_token`]: scalar integers resolve to the
/// `<stdint.h>` spellings and scalar f16 is `_Float16`.
pub fn type_token_rvv(t: DataType) -> Result<String, Error> {
    if t.is_scalar() {
        match t.kind {
            TypeKind::Float if t.bits == 16 => return Ok("_Float16".to_string()),
            TypeKind::Int | TypeKind::UInt if matches!(t.bits, 8 | 16 | 32 | 64) => {
                let u = if t.is_uint() { "u" } else { "" };
                return Ok(format!("{u}int{}_t", t.bits));
            }
            _ => {}
        }
    }
    type_token(t)
}

/// Compact integer dtype code of the TPU runtime's `data_type_t` table.
///
/// Code 1 is a second `DT_FP32` slot in the runtime table and has no
/// variant here; [`helper_table`](DtypeTag::helper_table) fills it in.
#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum DtypeTag {
    Fp32 = 0,
    Fp16 = 2,
    Bfp16 = 3,
    Fp8E5M2 = 4,
    Fp8E4M3 = 5,
    Fp20 = 6,
    Tf32 = 7,
    Int32 = 8,
    Uint32 = 9,
    Int16 = 10,
    Uint16 = 11,
    Int8 = 12,
    Uint8 = 13,
    Int4 = 14,
    Uint4 = 15,
}

impl DtypeTag {
    pub const COUNT: u8 = 16;

    /// The runtime tag spelling, e.g. `DT_FP16`
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Fp32 => "DT_FP32",
            Self::Fp16 => "DT_FP16",
            Self::Bfp16 => "DT_BFP16",
            Self::Fp8E5M2 => "DT_FP8E5M2",
            Self::Fp8E4M3 => "DT_FP8E4M3",
            Self::Fp20 => "DT_FP20",
            Self::Tf32 => "DT_TF32",
            Self::Int32 => "DT_INT32",
            Self::Uint32 => "DT_UINT32",
            Self::Int16 => "DT_INT16",
            Self::Uint16 => "DT_UINT16",
            Self::Int8 => "DT_INT8",
            Self::Uint8 => "DT_UINT8",
            Self::Int4 => "DT_INT4",
            Self::Uint4 => "DT_UINT4",
        }
    }

    /// The `scalar_t` union member carrying a value of this tag
    #[must_use]
    pub fn scalar_field(self) -> &'static str {
        match self {
            Self::Fp32 => "f32",
            Self::Fp16 => "f16",
            Self::Bfp16 => "bf16",
            Self::Int32 => "s32",
            Self::Uint32 => "u32",
            Self::Int16 => "s16",
            Self::Uint16 => "u16",
            Self::Int8 => "s8",
            Self::Uint8 => "u8",
            // Bit-pattern carriers for tags without a dedicated member
            Self::Fp8E5M2 | Self::Fp8E4M3 | Self::Fp20 | Self::Tf32 | Self::Int4 | Self::Uint4 => {
                "u32"
            }
        }
    }

    /// Byte width of one element
    #[must_use]
    pub fn bytes(self) -> i64 {
        match self {
            Self::Fp32 | Self::Tf32 | Self::Fp20 | Self::Int32 | Self::Uint32 => 4,
            Self::Fp16 | Self::Bfp16 | Self::Int16 | Self::Uint16 => 2,
            Self::Fp8E5M2 | Self::Fp8E4M3 | Self::Int8 | Self::Uint8 | Self::Int4 | Self::Uint4 => {
                1
            }
        }
    }

    pub fn from_dtype(t: DataType) -> Result<Self, Error> {
        if !t.is_scalar() {
            return Err(Error::UnsupportedType(t));
        }
        match (t.kind, t.bits) {
            (TypeKind::Float, 16) => Ok(Self::Fp16),
            (TypeKind::Float, 32) => Ok(Self::Fp32),
            (TypeKind::BFloat16, 16) => Ok(Self::Bfp16),
            (TypeKind::Float8, 8) => Ok(Self::Fp8E5M2),
            (TypeKind::Int, 4) => Ok(Self::Int4),
            (TypeKind::Int, 8) => Ok(Self::Int8),
            (TypeKind::Int, 16) => Ok(Self::Int16),
            (TypeKind::Int, 32) => Ok(Self::Int32),
            (TypeKind::UInt, 4) => Ok(Self::Uint4),
            (TypeKind::UInt, 8) => Ok(Self::Uint8),
            (TypeKind::UInt, 16) => Ok(Self::Uint16),
            (TypeKind::UInt, 32) => Ok(Self::Uint32),
            _ => Err(Error::UnsupportedType(t)),
        }
    }

    /// The 16 tag names in code order, for the emitted `__ppl_get_dtype`
    /// lookup table. Unassigned codes alias `DT_FP32`.
    #[must_use]
    pub fn helper_table() -> Vec<&'static str> {
        (0..Self::COUNT)
            .map(|code| Self::try_from(code).map_or("DT_FP32", Self::name))
            .collect()
    }
}
