//! The parsed DEX container.
//!
//! Parsing is eager for everything fixed-size (header, id tables, class-def
//! records) and lazy for everything reached through an offset: strings are
//! decoded on first lookup, class-data on first access per class-def. A
//! [`DexImage`] is immutable after parse and is shared read-only by every
//! task decompiling classes out of it; the lazy slots use `OnceCell` so
//! concurrent readers need no lock.

use std::io::{self, Write};

use log::debug;
use once_cell::sync::OnceCell;

use crate::dex::class::{ClassData, ClassDef, CodeItem};
use crate::dex::header::DexHeader;
use crate::dex::values::{read_encoded_array, EncodedValue};
use crate::error::FormatError;
use crate::reader::Buffer;
use crate::types::{AccessFlags, FlagContext, MethodSignature, ObjectIdentifier, TypeSignature};

/// proto_id_item: shorty, return type, parameter list offset.
#[derive(Debug)]
struct ProtoId {
    #[allow(dead_code)]
    shorty_idx: u32,
    return_type_idx: u32,
    parameters_off: u32,
}

/// field_id_item.
#[derive(Debug)]
struct FieldId {
    class_idx: u16,
    type_idx: u16,
    name_idx: u32,
}

/// method_id_item.
#[derive(Debug)]
struct MethodId {
    class_idx: u16,
    proto_idx: u16,
    name_idx: u32,
}

/// A fully joined field descriptor.
#[derive(Debug, Clone)]
pub struct FieldRef {
    pub class: ObjectIdentifier,
    pub name: String,
    pub ty: TypeSignature,
}

/// A fully joined method descriptor.
#[derive(Debug, Clone)]
pub struct MethodRef {
    pub class: ObjectIdentifier,
    pub name: String,
    pub sig: MethodSignature,
}

pub struct DexImage {
    bytes: Vec<u8>,
    pub header: DexHeader,
    string_offs: Vec<u32>,
    type_ids: Vec<u32>,
    protos: Vec<ProtoId>,
    fields: Vec<FieldId>,
    methods: Vec<MethodId>,
    pub class_defs: Vec<ClassDef>,
    strings: Vec<OnceCell<String>>,
    class_data: Vec<OnceCell<Option<ClassData>>>,
}

impl DexImage {
    pub fn parse(bytes: Vec<u8>) -> Result<DexImage, FormatError> {
        let header = {
            let mut buf = Buffer::new(&bytes);
            DexHeader::read(&mut buf)?
        };
        debug!(
            "dex version {} with {} class defs, {} strings",
            header.version(),
            header.class_defs_size,
            header.string_ids_size
        );

        let mut buf = Buffer::new(&bytes);

        buf.seek(header.string_ids_off as usize)?;
        let mut string_offs = Vec::with_capacity(header.string_ids_size as usize);
        for _ in 0..header.string_ids_size {
            string_offs.push(buf.read_u32()?);
        }

        buf.seek(header.type_ids_off as usize)?;
        let mut type_ids = Vec::with_capacity(header.type_ids_size as usize);
        for _ in 0..header.type_ids_size {
            let descriptor_idx = buf.read_u32()?;
            if descriptor_idx >= header.string_ids_size {
                return Err(FormatError::BadIndex {
                    pool: "string",
                    index: descriptor_idx as usize,
                    size: header.string_ids_size as usize,
                });
            }
            type_ids.push(descriptor_idx);
        }

        buf.seek(header.proto_ids_off as usize)?;
        let mut protos = Vec::with_capacity(header.proto_ids_size as usize);
        for _ in 0..header.proto_ids_size {
            protos.push(ProtoId {
                shorty_idx: buf.read_u32()?,
                return_type_idx: buf.read_u32()?,
                parameters_off: buf.read_u32()?,
            });
        }

        buf.seek(header.field_ids_off as usize)?;
        let mut fields = Vec::with_capacity(header.field_ids_size as usize);
        for _ in 0..header.field_ids_size {
            fields.push(FieldId {
                class_idx: buf.read_u16()?,
                type_idx: buf.read_u16()?,
                name_idx: buf.read_u32()?,
            });
        }

        buf.seek(header.method_ids_off as usize)?;
        let mut methods = Vec::with_capacity(header.method_ids_size as usize);
        for _ in 0..header.method_ids_size {
            methods.push(MethodId {
                class_idx: buf.read_u16()?,
                proto_idx: buf.read_u16()?,
                name_idx: buf.read_u32()?,
            });
        }

        buf.seek(header.class_defs_off as usize)?;
        let mut class_defs = Vec::with_capacity(header.class_defs_size as usize);
        for _ in 0..header.class_defs_size {
            class_defs.push(ClassDef::read(&mut buf)?);
        }

        let strings = (0..string_offs.len()).map(|_| OnceCell::new()).collect();
        let class_data = (0..class_defs.len()).map(|_| OnceCell::new()).collect();

        Ok(DexImage {
            bytes,
            header,
            string_offs,
            type_ids,
            protos,
            fields,
            methods,
            class_defs,
            strings,
            class_data,
        })
    }

    /// A cursor over the whole backing file.
    pub fn buffer(&self) -> Buffer<'_> {
        Buffer::new(&self.bytes)
    }

    pub fn string_count(&self) -> usize {
        self.string_offs.len()
    }

    pub fn type_count(&self) -> usize {
        self.type_ids.len()
    }

    pub fn proto_count(&self) -> usize {
        self.protos.len()
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn method_count(&self) -> usize {
        self.methods.len()
    }

    /// String pool lookup; decodes the MUTF-8 bytes on first access.
    pub fn string(&self, idx: u32) -> Result<&str, FormatError> {
        let cell = self
            .strings
            .get(idx as usize)
            .ok_or(FormatError::BadIndex {
                pool: "string",
                index: idx as usize,
                size: self.string_offs.len(),
            })?;
        let s = cell.get_or_try_init(|| {
            let mut buf = self.buffer();
            buf.seek(self.string_offs[idx as usize] as usize)?;
            buf.read_mutf8()
        })?;
        Ok(s.as_str())
    }

    /// Type pool lookup: the JNI descriptor string of type `idx`.
    pub fn type_desc(&self, idx: u32) -> Result<&str, FormatError> {
        let descriptor_idx = *self
            .type_ids
            .get(idx as usize)
            .ok_or(FormatError::BadIndex {
                pool: "type",
                index: idx as usize,
                size: self.type_ids.len(),
            })?;
        self.string(descriptor_idx)
    }

    pub fn type_object(&self, idx: u32) -> Result<ObjectIdentifier, FormatError> {
        Ok(ObjectIdentifier::from_jni_type(self.type_desc(idx)?))
    }

    /// Joins a proto_id into a [`MethodSignature`].
    pub fn proto(&self, idx: u32) -> Result<MethodSignature, FormatError> {
        let proto = self.protos.get(idx as usize).ok_or(FormatError::BadIndex {
            pool: "proto",
            index: idx as usize,
            size: self.protos.len(),
        })?;
        let mut args = vec![];
        if proto.parameters_off != 0 {
            for type_idx in self.type_list(proto.parameters_off)? {
                args.push(TypeSignature::from_jni(self.type_desc(type_idx)?));
            }
        }
        Ok(MethodSignature {
            args,
            return_type: TypeSignature::from_jni(self.type_desc(proto.return_type_idx)?),
        })
    }

    pub fn field_ref(&self, idx: u32) -> Result<FieldRef, FormatError> {
        let field = self.fields.get(idx as usize).ok_or(FormatError::BadIndex {
            pool: "field",
            index: idx as usize,
            size: self.fields.len(),
        })?;
        Ok(FieldRef {
            class: self.type_object(u32::from(field.class_idx))?,
            name: self.string(field.name_idx)?.to_string(),
            ty: TypeSignature::from_jni(self.type_desc(u32::from(field.type_idx))?),
        })
    }

    pub fn method_ref(&self, idx: u32) -> Result<MethodRef, FormatError> {
        let method = self
            .methods
            .get(idx as usize)
            .ok_or(FormatError::BadIndex {
                pool: "method",
                index: idx as usize,
                size: self.methods.len(),
            })?;
        Ok(MethodRef {
            class: self.type_object(u32::from(method.class_idx))?,
            name: self.string(method.name_idx)?.to_string(),
            sig: self.proto(u32::from(method.proto_idx))?,
        })
    }

    /// type_list at `offset`: u32 count then u16 type indices.
    fn type_list(&self, offset: u32) -> Result<Vec<u32>, FormatError> {
        let mut buf = self.buffer();
        buf.seek(offset as usize)?;
        let size = buf.read_u32()?;
        let mut out = Vec::with_capacity(size as usize);
        for _ in 0..size {
            out.push(u32::from(buf.read_u16()?));
        }
        Ok(out)
    }

    /// Interface type indices of a class def.
    pub fn interfaces(&self, def: &ClassDef) -> Result<Vec<u32>, FormatError> {
        if def.interfaces_off == 0 {
            return Ok(vec![]);
        }
        self.type_list(def.interfaces_off)
    }

    /// The packed field/method lists of class-def `def_index`, decoded on
    /// first access and cached.
    pub fn class_data(&self, def_index: usize) -> Result<Option<&ClassData>, FormatError> {
        let cell = self
            .class_data
            .get(def_index)
            .ok_or(FormatError::BadIndex {
                pool: "class_def",
                index: def_index,
                size: self.class_defs.len(),
            })?;
        let data = cell.get_or_try_init(|| -> Result<Option<ClassData>, FormatError> {
            let def = &self.class_defs[def_index];
            if def.class_data_off == 0 {
                return Ok(None);
            }
            let mut buf = self.buffer();
            buf.seek(def.class_data_off as usize)?;
            Ok(Some(ClassData::read(&mut buf)?))
        })?;
        Ok(data.as_ref())
    }

    /// Parses the code item at `offset`. Decoded fresh per call: code items
    /// are per-task scratch, not shared image state.
    pub fn code_item(&self, offset: u32) -> Result<CodeItem, FormatError> {
        let mut buf = self.buffer();
        buf.seek(offset as usize)?;
        CodeItem::read(&mut buf)
    }

    /// Static field initial values of a class def, outermost array unpacked.
    pub fn static_values(&self, def: &ClassDef) -> Result<Vec<EncodedValue>, FormatError> {
        if def.static_values_off == 0 {
            return Ok(vec![]);
        }
        let mut buf = self.buffer();
        buf.seek(def.static_values_off as usize)?;
        read_encoded_array(&mut buf)
    }

    /// All class-def type descriptors, in class-def table order.
    pub fn class_def_names(&self) -> Result<Vec<&str>, FormatError> {
        self.class_defs
            .iter()
            .map(|def| self.type_desc(def.class_idx))
            .collect()
    }

    /// Structural dump in the spirit of `dexdump`.
    pub fn dump(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "DEX version  : {}", self.header.version())?;
        writeln!(out, "file_size    : {}", self.header.file_size)?;
        writeln!(out, "checksum     : {:#010x}", self.header.checksum)?;
        writeln!(out, "strings      : {}", self.string_count())?;
        writeln!(out, "types        : {}", self.type_count())?;
        writeln!(out, "protos       : {}", self.proto_count())?;
        writeln!(out, "fields       : {}", self.field_count())?;
        writeln!(out, "methods      : {}", self.method_count())?;
        writeln!(out, "class defs   : {}", self.class_defs.len())?;

        for (ix, def) in self.class_defs.iter().enumerate() {
            let name = self.type_desc(def.class_idx).unwrap_or("?");
            let flags = AccessFlags::from_u32(def.access_flags);
            writeln!(out)?;
            writeln!(out, "Class #{ix}: {name}")?;
            writeln!(
                out,
                "  access     : {:#06x} ({})",
                def.access_flags,
                flags.smali_modifiers(FlagContext::Class).trim_end()
            )?;
            if def.has_superclass() {
                writeln!(
                    out,
                    "  superclass : {}",
                    self.type_desc(def.superclass_idx).unwrap_or("?")
                )?;
            }
            if let Ok(interfaces) = self.interfaces(def) {
                for i in interfaces {
                    writeln!(out, "  implements : {}", self.type_desc(i).unwrap_or("?"))?;
                }
            }
            if def.has_source_file() {
                writeln!(
                    out,
                    "  source     : {}",
                    self.string(def.source_file_idx).unwrap_or("?")
                )?;
            }
            if let Ok(Some(data)) = self.class_data(ix) {
                for f in data.static_fields.iter().chain(&data.instance_fields) {
                    if let Ok(fr) = self.field_ref(f.field_idx) {
                        writeln!(out, "  field      : {}:{}", fr.name, fr.ty.to_jni())?;
                    }
                }
                for m in data.direct_methods.iter().chain(&data.virtual_methods) {
                    if let Ok(mr) = self.method_ref(m.method_idx) {
                        writeln!(out, "  method     : {}{}", mr.name, mr.sig.to_jni())?;
                    }
                }
            }
        }
        Ok(())
    }
}
