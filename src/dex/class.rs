//! Class-level records of a DEX image: class defs, the packed class-data
//! lists, per-method code items and try/catch tables, plus the inner-class
//! classification that drives scheduling and the [`SourceFile`] output tree.

use std::collections::HashMap;

use crate::dex::header::NO_INDEX;
use crate::dex::image::DexImage;
use crate::error::FormatError;
use crate::reader::Buffer;
use crate::types::ObjectIdentifier;

/// One class_def_item, a fixed 32-byte record.
#[derive(Debug)]
pub struct ClassDef {
    pub class_idx: u32,
    pub access_flags: u32,
    pub superclass_idx: u32,
    pub interfaces_off: u32,
    pub source_file_idx: u32,
    pub annotations_off: u32,
    pub class_data_off: u32,
    pub static_values_off: u32,
}

impl ClassDef {
    pub fn read(buf: &mut Buffer) -> Result<ClassDef, FormatError> {
        Ok(ClassDef {
            class_idx: buf.read_u32()?,
            access_flags: buf.read_u32()?,
            superclass_idx: buf.read_u32()?,
            interfaces_off: buf.read_u32()?,
            source_file_idx: buf.read_u32()?,
            annotations_off: buf.read_u32()?,
            class_data_off: buf.read_u32()?,
            static_values_off: buf.read_u32()?,
        })
    }

    pub fn has_superclass(&self) -> bool {
        self.superclass_idx != NO_INDEX
    }

    pub fn has_source_file(&self) -> bool {
        self.source_file_idx != NO_INDEX
    }
}

#[derive(Debug, Clone)]
pub struct EncodedField {
    pub field_idx: u32,
    pub access_flags: u32,
}

#[derive(Debug, Clone)]
pub struct EncodedMethod {
    pub method_idx: u32,
    pub access_flags: u32,
    pub code_off: u32,
}

/// The decoded class_data_item: field and method lists. Indices in the
/// serialized form are deltas from the previous entry; they are accumulated
/// here so `field_idx`/`method_idx` are absolute.
#[derive(Debug, Default)]
pub struct ClassData {
    pub static_fields: Vec<EncodedField>,
    pub instance_fields: Vec<EncodedField>,
    pub direct_methods: Vec<EncodedMethod>,
    pub virtual_methods: Vec<EncodedMethod>,
}

impl ClassData {
    pub fn read(buf: &mut Buffer) -> Result<ClassData, FormatError> {
        let static_fields_size = buf.read_uleb128()?;
        let instance_fields_size = buf.read_uleb128()?;
        let direct_methods_size = buf.read_uleb128()?;
        let virtual_methods_size = buf.read_uleb128()?;

        let read_fields = |buf: &mut Buffer, n: u32| -> Result<Vec<EncodedField>, FormatError> {
            let mut fields = Vec::with_capacity(n as usize);
            let mut idx = 0u32;
            for _ in 0..n {
                idx = idx.wrapping_add(buf.read_uleb128()?);
                fields.push(EncodedField {
                    field_idx: idx,
                    access_flags: buf.read_uleb128()?,
                });
            }
            Ok(fields)
        };
        let read_methods = |buf: &mut Buffer, n: u32| -> Result<Vec<EncodedMethod>, FormatError> {
            let mut methods = Vec::with_capacity(n as usize);
            let mut idx = 0u32;
            for _ in 0..n {
                idx = idx.wrapping_add(buf.read_uleb128()?);
                methods.push(EncodedMethod {
                    method_idx: idx,
                    access_flags: buf.read_uleb128()?,
                    code_off: buf.read_uleb128()?,
                });
            }
            Ok(methods)
        };

        let static_fields = read_fields(buf, static_fields_size)?;
        let instance_fields = read_fields(buf, instance_fields_size)?;
        let direct_methods = read_methods(buf, direct_methods_size)?;
        let virtual_methods = read_methods(buf, virtual_methods_size)?;

        Ok(ClassData {
            static_fields,
            instance_fields,
            direct_methods,
            virtual_methods,
        })
    }
}

/// One try_item range, addresses in 16-bit code units.
#[derive(Debug, Clone)]
pub struct TryItem {
    pub start_addr: u32,
    pub insn_count: u16,
    /// Index into [`CodeItem::handlers`].
    pub handler_index: usize,
}

/// One encoded_catch_handler: typed catches in order, then an optional
/// catch-all address.
#[derive(Debug, Clone, Default)]
pub struct CatchHandler {
    pub catches: Vec<(u32, u32)>, // (type_idx, handler_addr)
    pub catch_all: Option<u32>,
}

/// A method body: registers, instruction units, try/catch tables.
#[derive(Debug)]
pub struct CodeItem {
    pub registers_size: u16,
    pub ins_size: u16,
    pub outs_size: u16,
    pub debug_info_off: u32,
    pub insns: Vec<u16>,
    pub tries: Vec<TryItem>,
    pub handlers: Vec<CatchHandler>,
}

impl CodeItem {
    pub fn read(buf: &mut Buffer) -> Result<CodeItem, FormatError> {
        let registers_size = buf.read_u16()?;
        let ins_size = buf.read_u16()?;
        let outs_size = buf.read_u16()?;
        let tries_size = buf.read_u16()?;
        let debug_info_off = buf.read_u32()?;
        let insns_size = buf.read_u32()? as usize;
        let mut insns = Vec::with_capacity(insns_size);
        for _ in 0..insns_size {
            insns.push(buf.read_u16()?);
        }

        let mut tries = Vec::with_capacity(tries_size as usize);
        let mut handlers = Vec::new();
        if tries_size > 0 {
            if insns_size % 2 == 1 {
                buf.read_u16()?; // alignment padding
            }
            let mut raw_tries = Vec::with_capacity(tries_size as usize);
            for _ in 0..tries_size {
                let start_addr = buf.read_u32()?;
                let insn_count = buf.read_u16()?;
                let handler_off = buf.read_u16()?;
                raw_tries.push((start_addr, insn_count, handler_off));
            }

            // encoded_catch_handler_list; try handler_off values are byte
            // offsets from the start of this list.
            let list_start = buf.position();
            let handler_count = buf.read_uleb128()?;
            let mut offset_to_index = HashMap::new();
            for _ in 0..handler_count {
                let off = (buf.position() - list_start) as u16;
                offset_to_index.insert(off, handlers.len());
                let size = buf.read_sleb128()?;
                let mut handler = CatchHandler::default();
                for _ in 0..size.unsigned_abs() {
                    let type_idx = buf.read_uleb128()?;
                    let addr = buf.read_uleb128()?;
                    handler.catches.push((type_idx, addr));
                }
                if size <= 0 {
                    handler.catch_all = Some(buf.read_uleb128()?);
                }
                handlers.push(handler);
            }

            for (start_addr, insn_count, handler_off) in raw_tries {
                let handler_index =
                    *offset_to_index
                        .get(&handler_off)
                        .ok_or(FormatError::BadEncoding {
                            offset: list_start,
                            reason: format!("try handler offset {handler_off} matches no handler"),
                        })?;
                tries.push(TryItem {
                    start_addr,
                    insn_count,
                    handler_index,
                });
            }
        }

        Ok(CodeItem {
            registers_size,
            ins_size,
            outs_size,
            debug_info_off,
            insns,
            tries,
            handlers,
        })
    }
}

/// Descriptor of the `dalvik.annotation.InnerClass` system annotation.
const INNER_CLASS_ANNOTATION: &str = "Ldalvik/annotation/InnerClass;";

impl DexImage {
    /// A class is inner when its descriptor contains `$`, when its source
    /// file disagrees with its own name, or when it carries the system
    /// InnerClass annotation.
    pub fn is_inner_class(&self, def: &ClassDef) -> bool {
        let name = match self.type_desc(def.class_idx) {
            Ok(n) => n,
            Err(_) => return false,
        };
        if name.contains('$') {
            return true;
        }
        if def.has_source_file() {
            if let Ok(source) = self.string(def.source_file_idx) {
                let stem = source.strip_suffix(".java").unwrap_or(source);
                let simple = ObjectIdentifier::from_jni_type(name).file_stem();
                if stem != simple {
                    return true;
                }
            }
        }
        self.class_annotation_types(def)
            .map(|types| types.iter().any(|t| t == INNER_CLASS_ANNOTATION))
            .unwrap_or(false)
    }

    /// Anonymous classes have an all-digit tail after the last `$`.
    pub fn is_anonymous_class(&self, def: &ClassDef) -> bool {
        let name = match self.type_desc(def.class_idx) {
            Ok(n) => n,
            Err(_) => return false,
        };
        let trimmed = name.strip_suffix(';').unwrap_or(name);
        match trimmed.rsplit_once('$') {
            Some((_, tail)) => !tail.is_empty() && tail.bytes().all(|b| b.is_ascii_digit()),
            None => false,
        }
    }

    /// Type descriptors (strings) of the class-level annotations. Used for
    /// the InnerClass check; anything else in the annotations directory is
    /// ignored.
    pub fn class_annotation_types(&self, def: &ClassDef) -> Result<Vec<String>, FormatError> {
        if def.annotations_off == 0 {
            return Ok(vec![]);
        }
        let mut buf = self.buffer();
        buf.seek(def.annotations_off as usize)?;
        let class_annotations_off = buf.read_u32()?;
        if class_annotations_off == 0 {
            return Ok(vec![]);
        }
        buf.seek(class_annotations_off as usize)?;
        let size = buf.read_u32()?;
        let mut entry_offs = Vec::with_capacity(size as usize);
        for _ in 0..size {
            entry_offs.push(buf.read_u32()?);
        }
        let mut out = Vec::with_capacity(entry_offs.len());
        for off in entry_offs {
            buf.seek(off as usize)?;
            let _visibility = buf.read_u8()?;
            let type_idx = buf.read_uleb128()?;
            out.push(self.type_desc(type_idx)?.to_string());
        }
        Ok(out)
    }
}

/// One logical output unit: a top-level class plus the inner classes that
/// print inside its file. Children own their own subtrees; the parent link
/// is just the declaring class's name, never a second owner.
pub struct SourceFile<'img> {
    pub image: &'img DexImage,
    pub def_index: usize,
    pub parent: Option<ObjectIdentifier>,
    pub children: Vec<SourceFile<'img>>,
}

impl<'img> SourceFile<'img> {
    /// Builds the tree rooted at `def_index`, attaching every class whose
    /// descriptor nests directly under this one (`Lp/C;` -> `Lp/C$D;`).
    pub fn build(image: &'img DexImage, def_index: usize) -> Result<SourceFile<'img>, FormatError> {
        let by_name: HashMap<&str, usize> = image
            .class_defs
            .iter()
            .enumerate()
            .filter_map(|(i, def)| image.type_desc(def.class_idx).ok().map(|n| (n, i)))
            .collect();
        Self::build_with_index(image, def_index, None, &by_name)
    }

    fn build_with_index(
        image: &'img DexImage,
        def_index: usize,
        parent: Option<ObjectIdentifier>,
        by_name: &HashMap<&str, usize>,
    ) -> Result<SourceFile<'img>, FormatError> {
        let own_desc = image
            .type_desc(image.class_defs[def_index].class_idx)?
            .to_string();
        let own_name = ObjectIdentifier::from_jni_type(&own_desc);
        let prefix = format!("{}$", own_desc.trim_end_matches(';'));

        let mut child_indices: Vec<(usize, &str)> = by_name
            .iter()
            .filter(|(name, _)| {
                name.starts_with(&prefix)
                    && !name[prefix.len()..name.len().saturating_sub(1)].contains('$')
            })
            .map(|(name, ix)| (*ix, *name))
            .collect();
        // Deterministic child order regardless of hash iteration.
        child_indices.sort_by(|a, b| a.1.cmp(b.1));

        let mut children = Vec::with_capacity(child_indices.len());
        for (child_ix, _) in child_indices {
            children.push(Self::build_with_index(
                image,
                child_ix,
                Some(own_name.clone()),
                by_name,
            )?);
        }

        Ok(SourceFile {
            image,
            def_index,
            parent,
            children,
        })
    }

    pub fn class_def(&self) -> &'img ClassDef {
        &self.image.class_defs[self.def_index]
    }

    pub fn name(&self) -> Result<ObjectIdentifier, FormatError> {
        Ok(ObjectIdentifier::from_jni_type(
            self.image.type_desc(self.class_def().class_idx)?,
        ))
    }

    pub fn is_top_level(&self) -> bool {
        self.parent.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::Buffer;

    #[test]
    fn class_data_delta_accumulation() {
        // 0 static fields, 0 instance fields, 3 direct methods, 0 virtual.
        // Method deltas 5, 2, 1 with flags/code_off 0 resolve to 5, 7, 8.
        let bytes = [
            0x00, 0x00, 0x03, 0x00, // list sizes
            0x05, 0x00, 0x00, // method +5
            0x02, 0x00, 0x00, // method +2
            0x01, 0x00, 0x00, // method +1
        ];
        let mut buf = Buffer::new(&bytes);
        let data = ClassData::read(&mut buf).unwrap();
        let ids: Vec<u32> = data.direct_methods.iter().map(|m| m.method_idx).collect();
        assert_eq!(ids, vec![5, 7, 8]);
    }

    #[test]
    fn code_item_with_tries() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&2u16.to_le_bytes()); // registers_size
        bytes.extend_from_slice(&1u16.to_le_bytes()); // ins_size
        bytes.extend_from_slice(&0u16.to_le_bytes()); // outs_size
        bytes.extend_from_slice(&1u16.to_le_bytes()); // tries_size
        bytes.extend_from_slice(&0u32.to_le_bytes()); // debug_info_off
        bytes.extend_from_slice(&3u32.to_le_bytes()); // insns_size (odd)
        bytes.extend_from_slice(&0x0e00u16.to_le_bytes());
        bytes.extend_from_slice(&0x0e00u16.to_le_bytes());
        bytes.extend_from_slice(&0x0e00u16.to_le_bytes());
        bytes.extend_from_slice(&0u16.to_le_bytes()); // padding
        bytes.extend_from_slice(&0u32.to_le_bytes()); // try start_addr
        bytes.extend_from_slice(&2u16.to_le_bytes()); // insn_count
        bytes.extend_from_slice(&1u16.to_le_bytes()); // handler_off
        bytes.push(0x01); // handler list size
        bytes.push(0x01); // handler: 1 typed catch
        bytes.push(0x07); // type_idx 7
        bytes.push(0x02); // addr 2

        let mut buf = Buffer::new(&bytes);
        let code = CodeItem::read(&mut buf).unwrap();
        assert_eq!(code.registers_size, 2);
        assert_eq!(code.insns.len(), 3);
        assert_eq!(code.tries.len(), 1);
        assert_eq!(code.tries[0].handler_index, 0);
        assert_eq!(code.handlers[0].catches, vec![(7, 2)]);
        assert!(code.handlers[0].catch_all.is_none());
    }
}
