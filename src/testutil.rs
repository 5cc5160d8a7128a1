//! Test-only helpers: a small in-memory DEX assembler so container,
//! lifter and end-to-end tests can fabricate images byte by byte without
//! fixture files.

use crate::dex::header::{ENDIAN_CONSTANT, NO_INDEX};
use crate::reader::encode_mutf8;

fn push_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_uleb(out: &mut Vec<u8>, mut v: u32) {
    loop {
        let mut byte = (v & 0x7f) as u8;
        v >>= 7;
        if v != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if v == 0 {
            return;
        }
    }
}

/// One method body to attach to a built method.
#[derive(Clone)]
pub struct CodeBlob {
    pub registers: u16,
    pub ins: u16,
    pub outs: u16,
    pub insns: Vec<u16>,
}

#[derive(Clone)]
struct BuiltMethod {
    method_idx: u32,
    access_flags: u32,
    code: Option<CodeBlob>,
}

#[derive(Clone)]
struct BuiltClass {
    class_type: u32,
    access_flags: u32,
    superclass: u32,
    source_file: u32,
    direct_methods: Vec<BuiltMethod>,
    virtual_methods: Vec<BuiltMethod>,
}

/// Assembles a structurally valid little-endian DEX image.
#[derive(Default)]
pub struct DexBuilder {
    strings: Vec<String>,
    types: Vec<u32>,
    protos: Vec<(u32, u32, Vec<u32>)>,
    fields: Vec<(u16, u16, u32)>,
    methods: Vec<(u16, u16, u32)>,
    classes: Vec<BuiltClass>,
}

impl DexBuilder {
    pub fn new() -> DexBuilder {
        DexBuilder::default()
    }

    pub fn intern_string(&mut self, s: &str) -> u32 {
        if let Some(ix) = self.strings.iter().position(|x| x == s) {
            return ix as u32;
        }
        self.strings.push(s.to_string());
        (self.strings.len() - 1) as u32
    }

    pub fn intern_type(&mut self, descriptor: &str) -> u32 {
        let string_idx = self.intern_string(descriptor);
        if let Some(ix) = self.types.iter().position(|&x| x == string_idx) {
            return ix as u32;
        }
        self.types.push(string_idx);
        (self.types.len() - 1) as u32
    }

    pub fn add_proto(&mut self, shorty: &str, return_desc: &str, params: &[&str]) -> u32 {
        let shorty_idx = self.intern_string(shorty);
        let ret = self.intern_type(return_desc);
        let params: Vec<u32> = params.iter().map(|p| self.intern_type(p)).collect();
        self.protos.push((shorty_idx, ret, params));
        (self.protos.len() - 1) as u32
    }

    pub fn add_field(&mut self, class_desc: &str, type_desc: &str, name: &str) -> u32 {
        let class = self.intern_type(class_desc) as u16;
        let ty = self.intern_type(type_desc) as u16;
        let name = self.intern_string(name);
        self.fields.push((class, ty, name));
        (self.fields.len() - 1) as u32
    }

    pub fn add_method(&mut self, class_desc: &str, proto: u32, name: &str) -> u32 {
        let class = self.intern_type(class_desc) as u16;
        let name = self.intern_string(name);
        self.methods.push((class, proto as u16, name));
        (self.methods.len() - 1) as u32
    }

    pub fn add_class(&mut self, descriptor: &str, access_flags: u32) -> usize {
        let class_type = self.intern_type(descriptor);
        let superclass = self.intern_type("Ljava/lang/Object;");
        self.classes.push(BuiltClass {
            class_type,
            access_flags,
            superclass,
            source_file: NO_INDEX,
            direct_methods: vec![],
            virtual_methods: vec![],
        });
        self.classes.len() - 1
    }

    pub fn set_source_file(&mut self, class: usize, source: &str) {
        let idx = self.intern_string(source);
        self.classes[class].source_file = idx;
    }

    pub fn add_direct_method(
        &mut self,
        class: usize,
        method_idx: u32,
        access_flags: u32,
        code: Option<CodeBlob>,
    ) {
        self.classes[class].direct_methods.push(BuiltMethod {
            method_idx,
            access_flags,
            code,
        });
    }

    pub fn add_virtual_method(
        &mut self,
        class: usize,
        method_idx: u32,
        access_flags: u32,
        code: Option<CodeBlob>,
    ) {
        self.classes[class].virtual_methods.push(BuiltMethod {
            method_idx,
            access_flags,
            code,
        });
    }

    pub fn build(&self) -> Vec<u8> {
        let header_size = 0x70usize;
        let tables_size = self.strings.len() * 4
            + self.types.len() * 4
            + self.protos.len() * 12
            + self.fields.len() * 8
            + self.methods.len() * 8
            + self.classes.len() * 32;
        let data_base = (header_size + tables_size) as u32;

        // Data section, with every offset recorded relative to data_base.
        let mut data: Vec<u8> = Vec::new();
        let align4 = |data: &mut Vec<u8>| {
            while data.len() % 4 != 0 {
                data.push(0);
            }
        };

        let mut string_offs = Vec::with_capacity(self.strings.len());
        for s in &self.strings {
            string_offs.push(data_base + data.len() as u32);
            let encoded = encode_mutf8(s);
            push_uleb(&mut data, s.chars().count() as u32);
            data.extend_from_slice(&encoded);
            data.push(0);
        }

        let mut proto_param_offs = Vec::with_capacity(self.protos.len());
        for (_, _, params) in &self.protos {
            if params.is_empty() {
                proto_param_offs.push(0u32);
            } else {
                align4(&mut data);
                proto_param_offs.push(data_base + data.len() as u32);
                push_u32(&mut data, params.len() as u32);
                for &p in params {
                    push_u16(&mut data, p as u16);
                }
            }
        }

        // Code items first, recording per-method offsets, then class data.
        let mut direct_code_offs: Vec<Vec<u32>> = Vec::with_capacity(self.classes.len());
        let mut virtual_code_offs: Vec<Vec<u32>> = Vec::with_capacity(self.classes.len());
        for class in &self.classes {
            let mut write_codes = |methods: &[BuiltMethod]| -> Vec<u32> {
                methods
                    .iter()
                    .map(|m| match &m.code {
                        Some(blob) => {
                            align4(&mut data);
                            let off = data_base + data.len() as u32;
                            write_code_item(&mut data, blob);
                            off
                        }
                        None => 0,
                    })
                    .collect()
            };
            let direct = write_codes(&class.direct_methods);
            let virt = write_codes(&class.virtual_methods);
            direct_code_offs.push(direct);
            virtual_code_offs.push(virt);
        }

        let mut class_data_offs = Vec::with_capacity(self.classes.len());
        for (cix, class) in self.classes.iter().enumerate() {
            if class.direct_methods.is_empty() && class.virtual_methods.is_empty() {
                class_data_offs.push(0u32);
                continue;
            }
            class_data_offs.push(data_base + data.len() as u32);
            push_uleb(&mut data, 0); // static fields
            push_uleb(&mut data, 0); // instance fields
            push_uleb(&mut data, class.direct_methods.len() as u32);
            push_uleb(&mut data, class.virtual_methods.len() as u32);

            let mut write_list = |data: &mut Vec<u8>, methods: &[BuiltMethod], offs: &[u32]| {
                let mut last = 0u32;
                for (m, &code_off) in methods.iter().zip(offs) {
                    push_uleb(data, m.method_idx - last);
                    last = m.method_idx;
                    push_uleb(data, m.access_flags);
                    push_uleb(data, code_off);
                }
            };
            write_list(&mut data, &class.direct_methods, &direct_code_offs[cix]);
            write_list(&mut data, &class.virtual_methods, &virtual_code_offs[cix]);
        }

        // Header and tables.
        let file_size = data_base as usize + data.len();
        let mut out = Vec::with_capacity(file_size);
        out.extend_from_slice(b"dex\n035\0");
        push_u32(&mut out, 0); // checksum, unchecked
        out.extend_from_slice(&[0u8; 20]); // signature, unchecked
        push_u32(&mut out, file_size as u32);
        push_u32(&mut out, 0x70);
        push_u32(&mut out, ENDIAN_CONSTANT);
        push_u32(&mut out, 0); // link_size
        push_u32(&mut out, 0); // link_off
        push_u32(&mut out, 0); // map_off

        let mut table_off = header_size as u32;
        let mut section = |out: &mut Vec<u8>, count: usize, entry: u32| {
            push_u32(out, count as u32);
            push_u32(out, if count == 0 { 0 } else { table_off });
            table_off += count as u32 * entry;
        };
        section(&mut out, self.strings.len(), 4);
        section(&mut out, self.types.len(), 4);
        section(&mut out, self.protos.len(), 12);
        section(&mut out, self.fields.len(), 8);
        section(&mut out, self.methods.len(), 8);
        section(&mut out, self.classes.len(), 32);
        push_u32(&mut out, data.len() as u32);
        push_u32(&mut out, if data.is_empty() { 0 } else { data_base });

        debug_assert_eq!(out.len(), header_size);

        for off in string_offs {
            push_u32(&mut out, off);
        }
        for &t in &self.types {
            push_u32(&mut out, t);
        }
        for (i, (shorty, ret, _)) in self.protos.iter().enumerate() {
            push_u32(&mut out, *shorty);
            push_u32(&mut out, *ret);
            push_u32(&mut out, proto_param_offs[i]);
        }
        for &(class, ty, name) in &self.fields {
            push_u16(&mut out, class);
            push_u16(&mut out, ty);
            push_u32(&mut out, name);
        }
        for &(class, proto, name) in &self.methods {
            push_u16(&mut out, class);
            push_u16(&mut out, proto);
            push_u32(&mut out, name);
        }
        for (i, class) in self.classes.iter().enumerate() {
            push_u32(&mut out, class.class_type);
            push_u32(&mut out, class.access_flags);
            push_u32(&mut out, class.superclass);
            push_u32(&mut out, 0); // interfaces
            push_u32(&mut out, class.source_file);
            push_u32(&mut out, 0); // annotations
            push_u32(&mut out, class_data_offs[i]);
            push_u32(&mut out, 0); // static values
        }

        out.extend_from_slice(&data);
        out
    }
}

fn write_code_item(data: &mut Vec<u8>, blob: &CodeBlob) {
    push_u16(data, blob.registers);
    push_u16(data, blob.ins);
    push_u16(data, blob.outs);
    push_u16(data, 0); // tries_size
    push_u32(data, 0); // debug_info_off
    push_u32(data, blob.insns.len() as u32);
    for &u in &blob.insns {
        push_u16(data, u);
    }
}

/// A minimal JVM class file: version 52.0, the named class extending
/// Object, no members.
pub fn minimal_class_file(internal_name: &str) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&0xCAFEBABEu32.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes()); // minor
    out.extend_from_slice(&52u16.to_be_bytes()); // major
    out.extend_from_slice(&5u16.to_be_bytes()); // pool count
    out.push(1); // Utf8: class name
    out.extend_from_slice(&(internal_name.len() as u16).to_be_bytes());
    out.extend_from_slice(internal_name.as_bytes());
    out.push(7); // Class -> #1
    out.extend_from_slice(&1u16.to_be_bytes());
    let sup = "java/lang/Object";
    out.push(1); // Utf8: superclass name
    out.extend_from_slice(&(sup.len() as u16).to_be_bytes());
    out.extend_from_slice(sup.as_bytes());
    out.push(7); // Class -> #3
    out.extend_from_slice(&3u16.to_be_bytes());
    out.extend_from_slice(&0x21u16.to_be_bytes()); // access: public super
    out.extend_from_slice(&2u16.to_be_bytes()); // this_class
    out.extend_from_slice(&4u16.to_be_bytes()); // super_class
    out.extend_from_slice(&0u16.to_be_bytes()); // interfaces
    out.extend_from_slice(&0u16.to_be_bytes()); // fields
    out.extend_from_slice(&0u16.to_be_bytes()); // methods
    out.extend_from_slice(&0u16.to_be_bytes()); // attributes
    out
}

/// A class file with a single static method carrying a Code attribute, for
/// driving the bytecode lifter over hand-written instruction sequences.
pub fn class_file_with_code(
    internal_name: &str,
    method_name: &str,
    descriptor: &str,
    access_flags: u16,
    max_stack: u16,
    max_locals: u16,
    code: &[u8],
) -> Vec<u8> {
    let push_u16_be = |out: &mut Vec<u8>, v: u16| out.extend_from_slice(&v.to_be_bytes());
    let push_utf8 = |out: &mut Vec<u8>, s: &str| {
        out.push(1);
        out.extend_from_slice(&(s.len() as u16).to_be_bytes());
        out.extend_from_slice(s.as_bytes());
    };

    let mut out = Vec::new();
    out.extend_from_slice(&0xCAFEBABEu32.to_be_bytes());
    push_u16_be(&mut out, 0); // minor
    push_u16_be(&mut out, 52); // major
    push_u16_be(&mut out, 8); // pool count, entries 1..=7
    push_utf8(&mut out, internal_name); // 1
    out.push(7); // 2: Class -> #1
    push_u16_be(&mut out, 1);
    push_utf8(&mut out, "java/lang/Object"); // 3
    out.push(7); // 4: Class -> #3
    push_u16_be(&mut out, 3);
    push_utf8(&mut out, method_name); // 5
    push_utf8(&mut out, descriptor); // 6
    push_utf8(&mut out, "Code"); // 7

    push_u16_be(&mut out, 0x21); // class access: public super
    push_u16_be(&mut out, 2); // this_class
    push_u16_be(&mut out, 4); // super_class
    push_u16_be(&mut out, 0); // interfaces
    push_u16_be(&mut out, 0); // fields

    push_u16_be(&mut out, 1); // methods
    push_u16_be(&mut out, access_flags);
    push_u16_be(&mut out, 5); // name
    push_u16_be(&mut out, 6); // descriptor
    push_u16_be(&mut out, 1); // attribute count
    push_u16_be(&mut out, 7); // "Code"
    let attr_len = 12 + code.len() as u32; // stack, locals, len, code, 0 ex, 0 attrs
    out.extend_from_slice(&attr_len.to_be_bytes());
    push_u16_be(&mut out, max_stack);
    push_u16_be(&mut out, max_locals);
    out.extend_from_slice(&(code.len() as u32).to_be_bytes());
    out.extend_from_slice(code);
    push_u16_be(&mut out, 0); // exception table
    push_u16_be(&mut out, 0); // code attributes

    push_u16_be(&mut out, 0); // class attributes
    out
}

/// An empty but valid image.
pub fn minimal_dex() -> Vec<u8> {
    DexBuilder::new().build()
}

/// One class `La;` with a single `void m()` whose body is `return-void`,
/// the fixture most scenario tests start from.
pub fn single_class_dex() -> Vec<u8> {
    let mut b = DexBuilder::new();
    let proto = b.add_proto("V", "V", &[]);
    let method = b.add_method("La;", proto, "m");
    let class = b.add_class("La;", 0x1);
    b.add_direct_method(
        class,
        method,
        0x1,
        Some(CodeBlob {
            registers: 1,
            ins: 1,
            outs: 0,
            insns: vec![0x000e],
        }),
    );
    b.build()
}
