//! encoded_value / encoded_array readers, used for class static-values and
//! annotation payloads.

use crate::dex::image::DexImage;
use crate::error::FormatError;
use crate::reader::Buffer;

#[derive(Debug, PartialEq, Clone)]
pub enum EncodedValue {
    Byte(i8),
    Short(i16),
    Char(u16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    MethodType(u32),
    MethodHandle(u32),
    String(u32),
    Type(u32),
    Field(u32),
    Method(u32),
    Enum(u32),
    Array(Vec<EncodedValue>),
    Annotation(u32),
    Null,
    Boolean(bool),
}

/// Reads `size` bytes little-endian, zero-extended to u64.
fn read_var_u64(buf: &mut Buffer, size: usize) -> Result<u64, FormatError> {
    let mut value: u64 = 0;
    for i in 0..size {
        value |= u64::from(buf.read_u8()?) << (8 * i);
    }
    Ok(value)
}

/// Reads `size` bytes little-endian, sign-extended from the top byte.
fn read_var_i64(buf: &mut Buffer, size: usize) -> Result<i64, FormatError> {
    let raw = read_var_u64(buf, size)?;
    let shift = 64 - 8 * size as u32;
    Ok(((raw << shift) as i64) >> shift)
}

impl EncodedValue {
    pub fn read(buf: &mut Buffer) -> Result<EncodedValue, FormatError> {
        let start = buf.position();
        let header = buf.read_u8()?;
        let value_arg = (header >> 5) as usize;
        let value_type = header & 0x1f;
        let size = value_arg + 1;

        match value_type {
            0x00 => Ok(EncodedValue::Byte(buf.read_u8()? as i8)),
            0x02 => Ok(EncodedValue::Short(read_var_i64(buf, size)? as i16)),
            0x03 => Ok(EncodedValue::Char(read_var_u64(buf, size)? as u16)),
            0x04 => Ok(EncodedValue::Int(read_var_i64(buf, size)? as i32)),
            0x06 => Ok(EncodedValue::Long(read_var_i64(buf, size)?)),
            // Floating values are stored left-aligned: the bytes present are
            // the most significant ones.
            0x10 => {
                let raw = read_var_u64(buf, size)? << (8 * (4 - size));
                Ok(EncodedValue::Float(f32::from_bits(raw as u32)))
            }
            0x11 => {
                let raw = read_var_u64(buf, size)? << (8 * (8 - size));
                Ok(EncodedValue::Double(f64::from_bits(raw)))
            }
            0x15 => Ok(EncodedValue::MethodType(read_var_u64(buf, size)? as u32)),
            0x16 => Ok(EncodedValue::MethodHandle(read_var_u64(buf, size)? as u32)),
            0x17 => Ok(EncodedValue::String(read_var_u64(buf, size)? as u32)),
            0x18 => Ok(EncodedValue::Type(read_var_u64(buf, size)? as u32)),
            0x19 => Ok(EncodedValue::Field(read_var_u64(buf, size)? as u32)),
            0x1a => Ok(EncodedValue::Method(read_var_u64(buf, size)? as u32)),
            0x1b => Ok(EncodedValue::Enum(read_var_u64(buf, size)? as u32)),
            0x1c => Ok(EncodedValue::Array(read_encoded_array(buf)?)),
            0x1d => {
                // encoded_annotation: keep the type, skip the elements.
                let type_idx = buf.read_uleb128()?;
                let count = buf.read_uleb128()?;
                for _ in 0..count {
                    let _name_idx = buf.read_uleb128()?;
                    EncodedValue::read(buf)?;
                }
                Ok(EncodedValue::Annotation(type_idx))
            }
            0x1e => Ok(EncodedValue::Null),
            0x1f => Ok(EncodedValue::Boolean(value_arg != 0)),
            _ => Err(FormatError::BadEncoding {
                offset: start,
                reason: format!("unknown encoded value type {value_type:#04x}"),
            }),
        }
    }

    /// Java source spelling of the value, resolving indices through the
    /// image's pools.
    pub fn to_java(&self, image: &DexImage) -> String {
        match self {
            EncodedValue::Byte(x) => format!("{x}"),
            EncodedValue::Short(x) => format!("{x}"),
            EncodedValue::Char(x) => match char::from_u32(u32::from(*x)) {
                Some(c) if !c.is_control() => format!("'{c}'"),
                _ => format!("'\\u{x:04x}'"),
            },
            EncodedValue::Int(x) => format!("{x}"),
            EncodedValue::Long(x) => format!("{x}L"),
            EncodedValue::Float(x) => format!("{x}f"),
            EncodedValue::Double(x) => format!("{x}"),
            EncodedValue::String(idx) => match image.string(*idx) {
                Ok(s) => format!("\"{}\"", escape_java_string(s)),
                Err(_) => format!("\"string@{idx}\""),
            },
            EncodedValue::Type(idx) => match image.type_desc(*idx) {
                Ok(t) => format!("{t}.class"),
                Err(_) => format!("type@{idx}"),
            },
            EncodedValue::Field(idx) | EncodedValue::Enum(idx) => match image.field_ref(*idx) {
                Ok(f) => format!("{}.{}", f.class.simple_name(), f.name),
                Err(_) => format!("field@{idx}"),
            },
            EncodedValue::Method(idx) => format!("method@{idx}"),
            EncodedValue::MethodType(idx) => format!("proto@{idx}"),
            EncodedValue::MethodHandle(idx) => format!("handle@{idx}"),
            EncodedValue::Array(values) => {
                let inner: Vec<String> = values.iter().map(|v| v.to_java(image)).collect();
                format!("{{ {} }}", inner.join(", "))
            }
            EncodedValue::Annotation(idx) => format!("annotation@{idx}"),
            EncodedValue::Null => "null".to_string(),
            EncodedValue::Boolean(b) => format!("{b}"),
        }
    }

    /// True when the value prints as the Java default for its type and can
    /// be left off the declaration.
    pub fn is_default(&self) -> bool {
        matches!(
            self,
            EncodedValue::Null
                | EncodedValue::Int(0)
                | EncodedValue::Long(0)
                | EncodedValue::Byte(0)
                | EncodedValue::Short(0)
                | EncodedValue::Char(0)
                | EncodedValue::Boolean(false)
        )
    }
}

/// encoded_array: ULEB count then packed values.
pub fn read_encoded_array(buf: &mut Buffer) -> Result<Vec<EncodedValue>, FormatError> {
    let count = buf.read_uleb128()?;
    let mut values = Vec::with_capacity(count as usize);
    for _ in 0..count {
        values.push(EncodedValue::read(buf)?);
    }
    Ok(values)
}

pub fn escape_java_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::Buffer;

    #[test]
    fn read_small_ints() {
        let bytes = [0x04, 0x04]; // int 4, one byte
        let mut buf = Buffer::new(&bytes);
        assert_eq!(EncodedValue::read(&mut buf).unwrap(), EncodedValue::Int(4));
    }

    #[test]
    fn read_negative_int_sign_extends() {
        let bytes = [0x04, 0xff]; // int -1
        let mut buf = Buffer::new(&bytes);
        assert_eq!(EncodedValue::read(&mut buf).unwrap(), EncodedValue::Int(-1));
    }

    #[test]
    fn read_boolean_from_arg() {
        let bytes = [0x3f]; // value_arg 1, type 0x1f
        let mut buf = Buffer::new(&bytes);
        assert_eq!(
            EncodedValue::read(&mut buf).unwrap(),
            EncodedValue::Boolean(true)
        );
    }

    #[test]
    fn read_float_left_aligned() {
        // 1.0f = 0x3f800000; two significant bytes stored, size 2
        let bytes = [0x30, 0x80, 0x3f];
        let mut buf = Buffer::new(&bytes);
        assert_eq!(
            EncodedValue::read(&mut buf).unwrap(),
            EncodedValue::Float(1.0)
        );
    }

    #[test]
    fn read_array() {
        let bytes = [0x1c, 0x02, 0x04, 0x01, 0x04, 0x02];
        let mut buf = Buffer::new(&bytes);
        assert_eq!(
            EncodedValue::read(&mut buf).unwrap(),
            EncodedValue::Array(vec![EncodedValue::Int(1), EncodedValue::Int(2)])
        );
    }

    #[test]
    fn escape() {
        assert_eq!(escape_java_string("a\"b\n"), "a\\\"b\\n");
    }
}
