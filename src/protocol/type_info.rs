use crate::constant::DataType;
use crate::error::{Error, Result};
use crate::protocol::primitive::*;
use crate::value::{FromValue, Value};

/// `max_len` marking a partially length-prefixed (`max`) type
pub const PLP_MAX_LEN: u16 = 0xFFFF;
/// Variable-length null marker of 2-byte length-prefixed values
const USHORT_NULL: u16 = 0xFFFF;
const PLP_NULL: u64 = 0xFFFF_FFFF_FFFF_FFFF;
const PLP_UNKNOWN_LEN: u64 = 0xFFFF_FFFF_FFFF_FFFE;
/// Largest non-`max` byte length of a variable-length type
pub const MAX_VAR_BYTES: u16 = 8000;

/// 5-byte collation of character columns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Collation(pub [u8; 5]);

impl Collation {
    /// SQL_Latin1_General_CP1_CI_AS
    pub const DEFAULT: Self = Self([0x09, 0x04, 0xD0, 0x00, 0x34]);

    fn read<R: WireRead + ?Sized>(r: &mut R) -> Result<Self> {
        let mut raw = [0u8; 5];
        r.read_exact(&mut raw)?;
        Ok(Self(raw))
    }
}

/// TYPE_INFO of a column or parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeInfo {
    /// Fixed-length type without a length prefix
    Fixed(DataType),
    IntN(u8),
    BitN,
    FltN(u8),
    NVarChar { max_len: u16, collation: Collation },
    BigVarChar { max_len: u16, collation: Collation },
    BigVarBinary { max_len: u16 },
}

impl TypeInfo {
    pub fn int() -> Self {
        Self::IntN(4)
    }

    pub fn nvarchar(chars: u16) -> Self {
        Self::NVarChar {
            max_len: chars.saturating_mul(2),
            collation: Collation::DEFAULT,
        }
    }

    pub fn nvarchar_max() -> Self {
        Self::NVarChar {
            max_len: PLP_MAX_LEN,
            collation: Collation::DEFAULT,
        }
    }

    /// Wire type chosen for a parameter value
    pub fn for_value(value: &Value) -> Self {
        match value {
            Value::Null => Self::nvarchar(4000),
            Value::Bit(_) => Self::BitN,
            Value::TinyInt(_) => Self::IntN(1),
            Value::SmallInt(_) => Self::IntN(2),
            Value::Int(_) => Self::IntN(4),
            Value::BigInt(_) => Self::IntN(8),
            Value::Real(_) => Self::FltN(4),
            Value::Float(_) => Self::FltN(8),
            Value::String(s) if ucs2_len(s) <= 4000 => Self::nvarchar(4000),
            Value::String(_) => Self::nvarchar_max(),
            Value::Binary(b) if b.len() <= MAX_VAR_BYTES as usize => Self::BigVarBinary {
                max_len: MAX_VAR_BYTES,
            },
            Value::Binary(_) => Self::BigVarBinary {
                max_len: PLP_MAX_LEN,
            },
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            Self::Fixed(dt) => *dt,
            Self::IntN(_) => DataType::IntN,
            Self::BitN => DataType::BitN,
            Self::FltN(_) => DataType::FltN,
            Self::NVarChar { .. } => DataType::NVarChar,
            Self::BigVarChar { .. } => DataType::BigVarChar,
            Self::BigVarBinary { .. } => DataType::BigVarBinary,
        }
    }

    /// Declared length in bytes, `None` for `max` types
    pub fn declared_len(&self) -> Option<usize> {
        match self {
            Self::Fixed(dt) => dt.fixed_len(),
            Self::IntN(n) | Self::FltN(n) => Some(*n as usize),
            Self::BitN => Some(1),
            Self::NVarChar { max_len, .. }
            | Self::BigVarChar { max_len, .. }
            | Self::BigVarBinary { max_len } => {
                (*max_len != PLP_MAX_LEN).then_some(*max_len as usize)
            }
        }
    }

    pub fn collation(&self) -> Option<Collation> {
        match self {
            Self::NVarChar { collation, .. } | Self::BigVarChar { collation, .. } => {
                Some(*collation)
            }
            _ => None,
        }
    }

    fn is_plp(&self) -> bool {
        self.declared_len().is_none()
            && matches!(
                self,
                Self::NVarChar { .. } | Self::BigVarChar { .. } | Self::BigVarBinary { .. }
            )
    }

    /// Type name used in `sp_executesql` / `sp_cursoropen` declarations
    pub fn sql_decl(&self) -> String {
        match self {
            Self::Fixed(DataType::Int1) | Self::IntN(1) => "tinyint".to_string(),
            Self::Fixed(DataType::Int2) | Self::IntN(2) => "smallint".to_string(),
            Self::Fixed(DataType::Int8) | Self::IntN(8) => "bigint".to_string(),
            Self::Fixed(DataType::Bit) | Self::BitN => "bit".to_string(),
            Self::Fixed(DataType::Flt4) | Self::FltN(4) => "real".to_string(),
            Self::Fixed(DataType::Flt8) | Self::FltN(_) => "float".to_string(),
            Self::Fixed(_) | Self::IntN(_) => "int".to_string(),
            Self::NVarChar { max_len, .. } if *max_len == PLP_MAX_LEN => {
                "nvarchar(max)".to_string()
            }
            Self::NVarChar { max_len, .. } => format!("nvarchar({})", (max_len / 2).max(1)),
            Self::BigVarChar { max_len, .. } if *max_len == PLP_MAX_LEN => {
                "varchar(max)".to_string()
            }
            Self::BigVarChar { max_len, .. } => format!("varchar({})", (*max_len).max(1)),
            Self::BigVarBinary { max_len } if *max_len == PLP_MAX_LEN => {
                "varbinary(max)".to_string()
            }
            Self::BigVarBinary { max_len } => format!("varbinary({})", (*max_len).max(1)),
        }
    }

    pub fn read<R: WireRead + ?Sized>(r: &mut R) -> Result<Self> {
        let tag = r.read_int_1()?;
        let dt = DataType::from_u8(tag).ok_or(Error::UnsupportedType(tag))?;
        match dt {
            DataType::Null
            | DataType::Int1
            | DataType::Bit
            | DataType::Int2
            | DataType::Int4
            | DataType::Flt4
            | DataType::Flt8
            | DataType::Int8 => Ok(Self::Fixed(dt)),
            DataType::IntN => match r.read_int_1()? {
                n @ (1 | 2 | 4 | 8) => Ok(Self::IntN(n)),
                _ => Err(Error::InvalidPacket),
            },
            DataType::BitN => match r.read_int_1()? {
                1 => Ok(Self::BitN),
                _ => Err(Error::InvalidPacket),
            },
            DataType::FltN => match r.read_int_1()? {
                n @ (4 | 8) => Ok(Self::FltN(n)),
                _ => Err(Error::InvalidPacket),
            },
            DataType::NVarChar => {
                let max_len = r.read_int_2()?;
                let collation = Collation::read(r)?;
                Ok(Self::NVarChar { max_len, collation })
            }
            DataType::BigVarChar => {
                let max_len = r.read_int_2()?;
                let collation = Collation::read(r)?;
                Ok(Self::BigVarChar { max_len, collation })
            }
            DataType::BigVarBinary => Ok(Self::BigVarBinary {
                max_len: r.read_int_2()?,
            }),
        }
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        write_int_1(out, self.data_type() as u8);
        match self {
            Self::Fixed(_) => {}
            Self::IntN(n) | Self::FltN(n) => write_int_1(out, *n),
            Self::BitN => write_int_1(out, 1),
            Self::NVarChar { max_len, collation } | Self::BigVarChar { max_len, collation } => {
                write_int_2(out, *max_len);
                out.extend_from_slice(&collation.0);
            }
            Self::BigVarBinary { max_len } => write_int_2(out, *max_len),
        }
    }

    /// Decode one value of this type
    pub fn read_value<R: WireRead + ?Sized>(&self, r: &mut R, scratch: &mut Vec<u8>) -> Result<Value> {
        match self {
            Self::Fixed(DataType::Null) => Ok(Value::Null),
            Self::Fixed(dt) => read_fixed(r, *dt),
            Self::IntN(_) => match r.read_int_1()? {
                0 => Ok(Value::Null),
                1 => read_fixed(r, DataType::Int1),
                2 => read_fixed(r, DataType::Int2),
                4 => read_fixed(r, DataType::Int4),
                8 => read_fixed(r, DataType::Int8),
                _ => Err(Error::InvalidPacket),
            },
            Self::BitN => match r.read_int_1()? {
                0 => Ok(Value::Null),
                1 => read_fixed(r, DataType::Bit),
                _ => Err(Error::InvalidPacket),
            },
            Self::FltN(_) => match r.read_int_1()? {
                0 => Ok(Value::Null),
                4 => read_fixed(r, DataType::Flt4),
                8 => read_fixed(r, DataType::Flt8),
                _ => Err(Error::InvalidPacket),
            },
            Self::NVarChar { .. } | Self::BigVarChar { .. } | Self::BigVarBinary { .. } => {
                scratch.clear();
                let present = if self.is_plp() {
                    read_plp(r, scratch)?
                } else {
                    read_ushort_bytes(r, scratch)?
                };
                if !present {
                    return Ok(Value::Null);
                }
                match self {
                    Self::NVarChar { .. } => decode_ucs2(scratch).map(Value::String),
                    Self::BigVarChar { .. } => Ok(Value::String(decode_single_byte(scratch))),
                    _ => Ok(Value::Binary(scratch.clone())),
                }
            }
        }
    }

    /// Encode `value` as this type
    pub fn write_value(&self, out: &mut Vec<u8>, value: &Value) -> Result<()> {
        match self {
            Self::Fixed(DataType::Null) => Ok(()),
            Self::Fixed(dt) => {
                if value.is_null() {
                    return Err(Error::BadUsageError(format!(
                        "NULL is not representable as fixed {:?}",
                        dt
                    )));
                }
                write_fixed(out, *dt, value)
            }
            Self::IntN(n) => {
                if value.is_null() {
                    write_int_1(out, 0);
                    return Ok(());
                }
                write_int_1(out, *n);
                let dt = match n {
                    1 => DataType::Int1,
                    2 => DataType::Int2,
                    4 => DataType::Int4,
                    _ => DataType::Int8,
                };
                write_fixed(out, dt, value)
            }
            Self::BitN => {
                if value.is_null() {
                    write_int_1(out, 0);
                    return Ok(());
                }
                write_int_1(out, 1);
                write_fixed(out, DataType::Bit, value)
            }
            Self::FltN(n) => {
                if value.is_null() {
                    write_int_1(out, 0);
                    return Ok(());
                }
                write_int_1(out, *n);
                let dt = if *n == 4 { DataType::Flt4 } else { DataType::Flt8 };
                write_fixed(out, dt, value)
            }
            Self::NVarChar { max_len, .. } => {
                let bytes = match value {
                    Value::Null => None,
                    v => {
                        let text = String::from_value(v)?;
                        let mut encoded = Vec::with_capacity(text.len() * 2);
                        write_ucs2(&mut encoded, &text);
                        Some(encoded)
                    }
                };
                self.write_var_bytes(out, *max_len, bytes.as_deref())
            }
            Self::BigVarChar { max_len, .. } => {
                let text = Option::<String>::from_value(value)?;
                self.write_var_bytes(out, *max_len, text.as_deref().map(str::as_bytes))
            }
            Self::BigVarBinary { max_len } => {
                let bytes = Option::<Vec<u8>>::from_value(value)?;
                self.write_var_bytes(out, *max_len, bytes.as_deref())
            }
        }
    }

    fn write_var_bytes(&self, out: &mut Vec<u8>, max_len: u16, bytes: Option<&[u8]>) -> Result<()> {
        if max_len == PLP_MAX_LEN {
            write_plp(out, bytes);
            return Ok(());
        }
        match bytes {
            None => write_int_2(out, USHORT_NULL),
            Some(b) => {
                if b.len() > max_len as usize {
                    return Err(Error::BadUsageError(format!(
                        "value of {} bytes exceeds declared length {}",
                        b.len(),
                        max_len
                    )));
                }
                write_int_2(out, b.len() as u16);
                out.extend_from_slice(b);
            }
        }
        Ok(())
    }
}

fn read_fixed<R: WireRead + ?Sized>(r: &mut R, dt: DataType) -> Result<Value> {
    Ok(match dt {
        DataType::Int1 => Value::TinyInt(r.read_int_1()?),
        DataType::Bit => Value::Bit(r.read_int_1()? != 0),
        DataType::Int2 => Value::SmallInt(r.read_int_2()? as i16),
        DataType::Int4 => Value::Int(r.read_int_4()? as i32),
        DataType::Int8 => Value::BigInt(r.read_int_8()? as i64),
        DataType::Flt4 => Value::Real(f32::from_bits(r.read_int_4()?)),
        DataType::Flt8 => Value::Float(f64::from_bits(r.read_int_8()?)),
        DataType::Null => Value::Null,
        other => return Err(Error::UnsupportedType(other as u8)),
    })
}

fn write_fixed(out: &mut Vec<u8>, dt: DataType, value: &Value) -> Result<()> {
    match dt {
        DataType::Int1 => write_int_1(out, u8::from_value(value)?),
        DataType::Bit => write_int_1(out, u8::from(bool::from_value(value)?)),
        DataType::Int2 => write_int_2(out, i16::from_value(value)? as u16),
        DataType::Int4 => write_i32(out, i32::from_value(value)?),
        DataType::Int8 => write_int_8(out, i64::from_value(value)? as u64),
        DataType::Flt4 => write_int_4(out, f32::from_value(value)?.to_bits()),
        DataType::Flt8 => write_int_8(out, f64::from_value(value)?.to_bits()),
        other => return Err(Error::UnsupportedType(other as u8)),
    }
    Ok(())
}

/// Returns `false` for NULL
fn read_ushort_bytes<R: WireRead + ?Sized>(r: &mut R, out: &mut Vec<u8>) -> Result<bool> {
    let len = r.read_int_2()?;
    if len == USHORT_NULL {
        return Ok(false);
    }
    r.read_bytes(len as usize, out)?;
    Ok(true)
}

/// Read a PLP value chunk by chunk, returns `false` for NULL
fn read_plp<R: WireRead + ?Sized>(r: &mut R, out: &mut Vec<u8>) -> Result<bool> {
    let total = r.read_int_8()?;
    if total == PLP_NULL {
        return Ok(false);
    }
    if total != PLP_UNKNOWN_LEN {
        out.reserve(total.min(1 << 20) as usize);
    }
    loop {
        let chunk = r.read_int_4()? as usize;
        if chunk == 0 {
            break;
        }
        r.read_bytes(chunk, out)?;
    }
    if total != PLP_UNKNOWN_LEN && total != out.len() as u64 {
        return Err(Error::InvalidPacket);
    }
    Ok(true)
}

fn write_plp(out: &mut Vec<u8>, bytes: Option<&[u8]>) {
    match bytes {
        None => write_int_8(out, PLP_NULL),
        Some(b) => {
            write_int_8(out, b.len() as u64);
            if !b.is_empty() {
                write_int_4(out, b.len() as u32);
                out.extend_from_slice(b);
            }
            write_int_4(out, 0);
        }
    }
}

/// Single-byte character data; code pages are not negotiated, so invalid
/// UTF-8 falls back to Latin-1
fn decode_single_byte(bytes: &[u8]) -> String {
    match simdutf8::basic::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => bytes.iter().map(|&b| char::from(b)).collect(),
    }
}
