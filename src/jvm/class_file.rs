//! JVM `.class` container: constant pool, members, attributes and the
//! `javap`-style structural dump. Class files are big-endian throughout.

use std::io::{self, Write};

use crate::error::FormatError;
use crate::reader::Buffer;
use crate::types::{AccessFlags, FlagContext, MethodSignature, ObjectIdentifier};

pub const CLASS_MAGIC: u32 = 0xCAFEBABE;

#[derive(Debug, Clone)]
pub enum Constant {
    Utf8(String),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class(u16),
    String(u16),
    FieldRef(u16, u16),
    MethodRef(u16, u16),
    InterfaceMethodRef(u16, u16),
    NameAndType(u16, u16),
    MethodHandle(u8, u16),
    MethodType(u16),
    Dynamic(u16, u16),
    InvokeDynamic(u16, u16),
    Module(u16),
    Package(u16),
    /// The phantom second slot of a long/double entry.
    Reserved,
}

#[derive(Debug)]
pub struct AttributeInfo {
    pub name_index: u16,
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub struct MemberInfo {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<AttributeInfo>,
}

#[derive(Debug)]
pub struct ClassFile {
    pub minor_version: u16,
    pub major_version: u16,
    /// 1-indexed as in the format; slot 0 is `Reserved`.
    pub pool: Vec<Constant>,
    pub access_flags: u16,
    pub this_class: u16,
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    pub fields: Vec<MemberInfo>,
    pub methods: Vec<MemberInfo>,
    pub attributes: Vec<AttributeInfo>,
}

/// The Code attribute payload.
#[derive(Debug)]
pub struct CodeAttribute {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    pub exceptions: Vec<ExceptionEntry>,
}

#[derive(Debug, Clone)]
pub struct ExceptionEntry {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    pub catch_type: u16,
}

fn read_attributes(buf: &mut Buffer) -> Result<Vec<AttributeInfo>, FormatError> {
    let count = buf.read_u16_be()?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name_index = buf.read_u16_be()?;
        let len = buf.read_u32_be()? as usize;
        let data = buf.read_bytes(len)?.to_vec();
        out.push(AttributeInfo { name_index, data });
    }
    Ok(out)
}

fn read_member(buf: &mut Buffer) -> Result<MemberInfo, FormatError> {
    Ok(MemberInfo {
        access_flags: buf.read_u16_be()?,
        name_index: buf.read_u16_be()?,
        descriptor_index: buf.read_u16_be()?,
        attributes: read_attributes(buf)?,
    })
}

impl ClassFile {
    pub fn parse(bytes: &[u8]) -> Result<ClassFile, FormatError> {
        let mut buf = Buffer::new(bytes);
        let magic = buf.read_u32_be()?;
        if magic != CLASS_MAGIC {
            return Err(FormatError::BadMagic {
                found: magic.to_be_bytes().to_vec(),
            });
        }
        let minor_version = buf.read_u16_be()?;
        let major_version = buf.read_u16_be()?;

        let pool_count = buf.read_u16_be()? as usize;
        let mut pool = Vec::with_capacity(pool_count);
        pool.push(Constant::Reserved);
        let mut ix = 1;
        while ix < pool_count {
            let tag = buf.read_u8()?;
            let constant = match tag {
                1 => {
                    let len = buf.read_u16_be()? as usize;
                    let raw = buf.read_bytes(len)?;
                    let s = crate::reader::decode_mutf8(raw)?;
                    Constant::Utf8(s)
                }
                3 => Constant::Integer(buf.read_u32_be()? as i32),
                4 => Constant::Float(f32::from_bits(buf.read_u32_be()?)),
                5 => Constant::Long(buf.read_u64_be()? as i64),
                6 => Constant::Double(f64::from_bits(buf.read_u64_be()?)),
                7 => Constant::Class(buf.read_u16_be()?),
                8 => Constant::String(buf.read_u16_be()?),
                9 => Constant::FieldRef(buf.read_u16_be()?, buf.read_u16_be()?),
                10 => Constant::MethodRef(buf.read_u16_be()?, buf.read_u16_be()?),
                11 => Constant::InterfaceMethodRef(buf.read_u16_be()?, buf.read_u16_be()?),
                12 => Constant::NameAndType(buf.read_u16_be()?, buf.read_u16_be()?),
                15 => Constant::MethodHandle(buf.read_u8()?, buf.read_u16_be()?),
                16 => Constant::MethodType(buf.read_u16_be()?),
                17 => Constant::Dynamic(buf.read_u16_be()?, buf.read_u16_be()?),
                18 => Constant::InvokeDynamic(buf.read_u16_be()?, buf.read_u16_be()?),
                19 => Constant::Module(buf.read_u16_be()?),
                20 => Constant::Package(buf.read_u16_be()?),
                other => {
                    return Err(FormatError::ClassFile(format!(
                        "unknown constant pool tag {other} at entry {ix}"
                    )))
                }
            };
            let wide = matches!(constant, Constant::Long(_) | Constant::Double(_));
            pool.push(constant);
            ix += 1;
            if wide {
                pool.push(Constant::Reserved);
                ix += 1;
            }
        }

        let access_flags = buf.read_u16_be()?;
        let this_class = buf.read_u16_be()?;
        let super_class = buf.read_u16_be()?;
        let iface_count = buf.read_u16_be()?;
        let mut interfaces = Vec::with_capacity(iface_count as usize);
        for _ in 0..iface_count {
            interfaces.push(buf.read_u16_be()?);
        }

        let field_count = buf.read_u16_be()?;
        let mut fields = Vec::with_capacity(field_count as usize);
        for _ in 0..field_count {
            fields.push(read_member(&mut buf)?);
        }
        let method_count = buf.read_u16_be()?;
        let mut methods = Vec::with_capacity(method_count as usize);
        for _ in 0..method_count {
            methods.push(read_member(&mut buf)?);
        }
        let attributes = read_attributes(&mut buf)?;

        Ok(ClassFile {
            minor_version,
            major_version,
            pool,
            access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes,
        })
    }

    pub fn utf8(&self, index: u16) -> Result<&str, FormatError> {
        match self.pool.get(index as usize) {
            Some(Constant::Utf8(s)) => Ok(s),
            _ => Err(FormatError::ClassFile(format!(
                "constant {index} is not Utf8"
            ))),
        }
    }

    /// Internal (slash-separated) name behind a Class constant.
    pub fn class_name(&self, index: u16) -> Result<&str, FormatError> {
        match self.pool.get(index as usize) {
            Some(Constant::Class(name_index)) => self.utf8(*name_index),
            _ => Err(FormatError::ClassFile(format!(
                "constant {index} is not a Class"
            ))),
        }
    }

    pub fn this_name(&self) -> Result<ObjectIdentifier, FormatError> {
        Ok(ObjectIdentifier::from_jni_type(&format!(
            "L{};",
            self.class_name(self.this_class)?
        )))
    }

    /// Resolves a Field/Method/InterfaceMethod ref to (class, name,
    /// descriptor).
    pub fn member_ref(&self, index: u16) -> Result<(String, String, String), FormatError> {
        let (class_ix, nat_ix) = match self.pool.get(index as usize) {
            Some(Constant::FieldRef(c, n))
            | Some(Constant::MethodRef(c, n))
            | Some(Constant::InterfaceMethodRef(c, n)) => (*c, *n),
            _ => {
                return Err(FormatError::ClassFile(format!(
                    "constant {index} is not a member reference"
                )))
            }
        };
        let class = self.class_name(class_ix)?.to_string();
        let (name_ix, desc_ix) = match self.pool.get(nat_ix as usize) {
            Some(Constant::NameAndType(n, d)) => (*n, *d),
            _ => {
                return Err(FormatError::ClassFile(format!(
                    "constant {nat_ix} is not NameAndType"
                )))
            }
        };
        Ok((
            class,
            self.utf8(name_ix)?.to_string(),
            self.utf8(desc_ix)?.to_string(),
        ))
    }

    pub fn attribute_name(&self, attr: &AttributeInfo) -> &str {
        self.utf8(attr.name_index).unwrap_or("?")
    }

    /// The Code attribute of a member, when present.
    pub fn code_of(&self, member: &MemberInfo) -> Result<Option<CodeAttribute>, FormatError> {
        for attr in &member.attributes {
            if self.attribute_name(attr) == "Code" {
                let mut buf = Buffer::new(&attr.data);
                let max_stack = buf.read_u16_be()?;
                let max_locals = buf.read_u16_be()?;
                let code_len = buf.read_u32_be()? as usize;
                let code = buf.read_bytes(code_len)?.to_vec();
                let ex_count = buf.read_u16_be()?;
                let mut exceptions = Vec::with_capacity(ex_count as usize);
                for _ in 0..ex_count {
                    exceptions.push(ExceptionEntry {
                        start_pc: buf.read_u16_be()?,
                        end_pc: buf.read_u16_be()?,
                        handler_pc: buf.read_u16_be()?,
                        catch_type: buf.read_u16_be()?,
                    });
                }
                return Ok(Some(CodeAttribute {
                    max_stack,
                    max_locals,
                    code,
                    exceptions,
                }));
            }
        }
        Ok(None)
    }

    /// `javap`-style structural print.
    pub fn dump(&self, out: &mut dyn Write) -> io::Result<()> {
        let this = self
            .class_name(self.this_class)
            .unwrap_or("?")
            .to_string();
        writeln!(out, "class file")?;
        writeln!(
            out,
            "major_version={}, minor_version={}, this_class={}",
            self.major_version, self.minor_version, this
        )?;
        if self.super_class != 0 {
            writeln!(
                out,
                "super_class={}",
                self.class_name(self.super_class).unwrap_or("?")
            )?;
        }
        let flags = AccessFlags::from_u32(u32::from(self.access_flags));
        writeln!(
            out,
            "access_flags={:#06x} ({})",
            self.access_flags,
            flags.smali_modifiers(FlagContext::Class).trim_end()
        )?;
        writeln!(out, "constant_pool_count={}", self.pool.len())?;
        for &i in &self.interfaces {
            writeln!(out, "implements {}", self.class_name(i).unwrap_or("?"))?;
        }
        for f in &self.fields {
            writeln!(
                out,
                "field {} {}",
                self.utf8(f.name_index).unwrap_or("?"),
                self.utf8(f.descriptor_index).unwrap_or("?")
            )?;
        }
        for m in &self.methods {
            let sig = MethodSignature::from_jni(self.utf8(m.descriptor_index).unwrap_or("()V"));
            writeln!(
                out,
                "method {}{} -> {}",
                self.utf8(m.name_index).unwrap_or("?"),
                sig.to_jni(),
                sig.return_type.to_jni()
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::minimal_class_file;

    #[test]
    fn parse_minimal_class() {
        let bytes = minimal_class_file("p/A");
        let class = ClassFile::parse(&bytes).unwrap();
        assert_eq!(class.major_version, 52);
        assert_eq!(class.minor_version, 0);
        assert_eq!(class.class_name(class.this_class).unwrap(), "p/A");
        assert_eq!(class.this_name().unwrap().as_java_type(), "p.A");
    }

    #[test]
    fn dump_contains_version_block() {
        let bytes = minimal_class_file("p/A");
        let class = ClassFile::parse(&bytes).unwrap();
        let mut out = Vec::new();
        class.dump(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("major_version=52, minor_version=0, this_class=p/A"));
    }

    #[test]
    fn rejects_bad_magic() {
        let bytes = [0u8; 16];
        assert!(matches!(
            ClassFile::parse(&bytes),
            Err(FormatError::BadMagic { .. })
        ));
    }
}
