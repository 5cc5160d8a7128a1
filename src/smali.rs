//! Smali text emitter: a linear walk over the decoded instructions.
//!
//! Labels are synthesized as `:label_%04x` from the code-unit offset for
//! every branch target and handler start. Switch and array payloads print
//! as trailing data directives referenced by `:switch_data_N` /
//! `:array_data_N` labels. Output is deterministic for a given image.

use std::collections::BTreeSet;
use std::fmt::Write as _;

use crate::dex::class::CodeItem;
use crate::dex::image::DexImage;
use crate::dex::insns::{decode_one, Decoded, Instruction, Op};
use crate::dex::values::escape_java_string;
use crate::error::FormatError;
use crate::types::{AccessFlags, FlagContext};

/// Maps raw register numbers to smali-style names (`vN` / `pN`) based on
/// the method's register count and input size.
struct RegMapper {
    registers_size: u16,
    ins_size: u16,
}

impl RegMapper {
    fn name(&self, raw: u16) -> String {
        let params_base = self.registers_size.saturating_sub(self.ins_size);
        if raw >= params_base {
            format!("p{}", raw - params_base)
        } else {
            format!("v{raw}")
        }
    }

    fn list(&self, regs: &[u16]) -> String {
        let names: Vec<String> = regs.iter().map(|&r| self.name(r)).collect();
        format!("{{{}}}", names.join(", "))
    }

    fn range(&self, regs: &[u16]) -> String {
        match (regs.first(), regs.last()) {
            (Some(&a), Some(&b)) => format!("{{{} .. {}}}", self.name(a), self.name(b)),
            _ => "{}".to_string(),
        }
    }
}

fn label(offset: usize) -> String {
    format!(":label_{offset:04x}")
}

/// Writes a whole class as smali.
pub fn write_class(image: &DexImage, def_index: usize) -> Result<String, FormatError> {
    let def = &image.class_defs[def_index];
    let flags = AccessFlags::from_u32(def.access_flags);
    let mut out = String::new();

    writeln!(
        out,
        ".class {}{}",
        flags.smali_modifiers(FlagContext::Class),
        image.type_desc(def.class_idx)?
    )
    .unwrap();
    if def.has_superclass() {
        writeln!(out, ".super {}", image.type_desc(def.superclass_idx)?).unwrap();
    }
    if def.has_source_file() {
        writeln!(out, ".source \"{}\"", image.string(def.source_file_idx)?).unwrap();
    }

    let interfaces = image.interfaces(def)?;
    if !interfaces.is_empty() {
        out.push_str("\n# interfaces\n");
        for i in interfaces {
            writeln!(out, ".implements {}", image.type_desc(i)?).unwrap();
        }
    }

    if let Some(data) = image.class_data(def_index)? {
        let statics = image.static_values(def)?;
        if !data.static_fields.is_empty() || !data.instance_fields.is_empty() {
            out.push_str("\n# fields\n");
            for (i, f) in data.static_fields.iter().enumerate() {
                let fr = image.field_ref(f.field_idx)?;
                let flags = AccessFlags::from_u32(f.access_flags);
                write!(
                    out,
                    ".field {}{}:{}",
                    flags.smali_modifiers(FlagContext::Field),
                    fr.name,
                    fr.ty.to_jni()
                )
                .unwrap();
                if let Some(v) = statics.get(i) {
                    if !v.is_default() {
                        write!(out, " = {}", v.to_java(image)).unwrap();
                    }
                }
                out.push('\n');
            }
            for f in &data.instance_fields {
                let fr = image.field_ref(f.field_idx)?;
                let flags = AccessFlags::from_u32(f.access_flags);
                writeln!(
                    out,
                    ".field {}{}:{}",
                    flags.smali_modifiers(FlagContext::Field),
                    fr.name,
                    fr.ty.to_jni()
                )
                .unwrap();
            }
        }

        let methods: Vec<_> = data
            .direct_methods
            .iter()
            .chain(&data.virtual_methods)
            .cloned()
            .collect();
        if !methods.is_empty() {
            out.push_str("\n# methods\n");
            for m in methods {
                let mr = image.method_ref(m.method_idx)?;
                let flags = AccessFlags::from_u32(m.access_flags);
                writeln!(
                    out,
                    ".method {}{}{}",
                    flags.smali_modifiers(FlagContext::Method),
                    mr.name,
                    mr.sig.to_jni()
                )
                .unwrap();
                if m.code_off != 0 {
                    let code = image.code_item(m.code_off)?;
                    for line in emit_method_code(image, &code) {
                        writeln!(out, "{line}").unwrap();
                    }
                }
                out.push_str(".end method\n\n");
            }
        }
    }

    Ok(out)
}

/// Emits a method body as indented smali lines. Decoding is lossy: an
/// undecodable unit prints as a comment and the walk continues, so a
/// partially broken method still shows everything around the damage.
pub fn emit_method_code(image: &DexImage, code: &CodeItem) -> Vec<String> {
    let mut lines = vec![format!("    .registers {}", code.registers_size)];
    let mapper = RegMapper {
        registers_size: code.registers_size,
        ins_size: code.ins_size,
    };

    // First pass: decode and collect label targets.
    let mut insns: Vec<Instruction> = Vec::new();
    let mut pc = 0usize;
    let mut bad_units: Vec<usize> = Vec::new();
    while pc < code.insns.len() {
        match decode_one(&code.insns, pc) {
            Ok(Decoded::Insn(insn)) => {
                pc += insn.units;
                insns.push(insn);
            }
            Ok(Decoded::Payload { units }) => pc += units,
            Err(_) => {
                bad_units.push(pc);
                pc += 1;
            }
        }
    }

    let mut targets: BTreeSet<usize> = BTreeSet::new();
    for insn in &insns {
        targets.extend(insn.branch_targets());
    }
    for t in &code.tries {
        let handler = &code.handlers[t.handler_index];
        targets.extend(handler.catches.iter().map(|(_, a)| *a as usize));
        targets.extend(handler.catch_all.map(|a| a as usize));
    }

    // Trailing data directives for switches and array fills.
    let mut data_blocks: Vec<Vec<String>> = Vec::new();

    for insn in &insns {
        if targets.contains(&insn.offset) {
            lines.push(format!("    {}", label(insn.offset)));
        }
        for t in &code.tries {
            if t.start_addr as usize == insn.offset {
                lines.push(format!("    :try_start_{}", t.start_addr));
            }
        }

        lines.push(format!(
            "    {}",
            print_insn(image, insn, &mapper, &mut data_blocks)
        ));

        for t in &code.tries {
            let end = t.start_addr as usize + t.insn_count as usize;
            if insn.offset + insn.units == end {
                lines.push(format!("    :try_end_{}", t.start_addr));
                let handler = &code.handlers[t.handler_index];
                for (type_idx, addr) in &handler.catches {
                    let ty = image.type_desc(*type_idx).unwrap_or("?");
                    lines.push(format!(
                        "    .catch {} {{:try_start_{} .. :try_end_{}}} {}",
                        ty,
                        t.start_addr,
                        t.start_addr,
                        label(*addr as usize)
                    ));
                }
                if let Some(addr) = handler.catch_all {
                    lines.push(format!(
                        "    .catchall {{:try_start_{} .. :try_end_{}}} {}",
                        t.start_addr,
                        t.start_addr,
                        label(addr as usize)
                    ));
                }
            }
        }
    }

    for off in bad_units {
        lines.push(format!(
            "    # undecodable unit {:#06x} at offset {off:#x}",
            code.insns[off]
        ));
    }

    for block in data_blocks {
        lines.extend(block);
    }
    lines
}

fn print_insn(
    image: &DexImage,
    insn: &Instruction,
    m: &RegMapper,
    data_blocks: &mut Vec<Vec<String>>,
) -> String {
    let name = insn.mnemonic();
    let is_range = matches!(insn.opcode, 0x25 | 0x74..=0x78 | 0xfb | 0xfd);
    let type_str = |idx: u32| image.type_desc(idx).unwrap_or("?").to_string();
    let field_str = |idx: u32| match image.field_ref(idx) {
        Ok(f) => format!("{}->{}:{}", f.class.as_jni_type(), f.name, f.ty.to_jni()),
        Err(_) => format!("field@{idx}"),
    };
    let method_str = |idx: u32| match image.method_ref(idx) {
        Ok(mr) => format!("{}->{}{}", mr.class.as_jni_type(), mr.name, mr.sig.to_jni()),
        Err(_) => format!("method@{idx}"),
    };

    match &insn.op {
        Op::Nop => name.to_string(),
        Op::Move { dst, src, .. } => format!("{name} {}, {}", m.name(*dst), m.name(*src)),
        Op::MoveResult { dst, .. } | Op::MoveException { dst } => {
            format!("{name} {}", m.name(*dst))
        }
        Op::ReturnVoid => name.to_string(),
        Op::Return { src, .. }
        | Op::MonitorEnter { src }
        | Op::MonitorExit { src }
        | Op::Throw { src } => format!("{name} {}", m.name(*src)),
        Op::Const { dst, value } => format!("{name} {}, {}", m.name(*dst), hex_i64(*value as i64)),
        Op::ConstWide { dst, value } => format!("{name} {}, {}", m.name(*dst), hex_i64(*value)),
        Op::ConstString { dst, string_idx } => format!(
            "{name} {}, \"{}\"",
            m.name(*dst),
            image
                .string(*string_idx)
                .map(escape_java_string)
                .unwrap_or_else(|_| format!("string@{string_idx}"))
        ),
        Op::ConstClass { dst, type_idx } => {
            format!("{name} {}, {}", m.name(*dst), type_str(*type_idx))
        }
        Op::ConstMethodHandle { dst, handle_idx } => {
            format!("{name} {}, method_handle@{handle_idx}", m.name(*dst))
        }
        Op::ConstMethodType { dst, proto_idx } => {
            format!("{name} {}, proto@{proto_idx}", m.name(*dst))
        }
        Op::CheckCast { reg, type_idx } => {
            format!("{name} {}, {}", m.name(*reg), type_str(*type_idx))
        }
        Op::InstanceOf { dst, src, type_idx } => format!(
            "{name} {}, {}, {}",
            m.name(*dst),
            m.name(*src),
            type_str(*type_idx)
        ),
        Op::ArrayLength { dst, src } => format!("{name} {}, {}", m.name(*dst), m.name(*src)),
        Op::NewInstance { dst, type_idx } => {
            format!("{name} {}, {}", m.name(*dst), type_str(*type_idx))
        }
        Op::NewArray { dst, size, type_idx } => format!(
            "{name} {}, {}, {}",
            m.name(*dst),
            m.name(*size),
            type_str(*type_idx)
        ),
        Op::FilledNewArray { type_idx, args } => {
            let regs = if is_range { m.range(args) } else { m.list(args) };
            format!("{name} {regs}, {}", type_str(*type_idx))
        }
        Op::FillArrayData {
            src,
            element_width,
            data,
        } => {
            let ix = data_blocks.len();
            let mut block = vec![
                format!("    :array_data_{ix}"),
                format!("    .array-data {element_width}"),
            ];
            for chunk in data.chunks(*element_width as usize) {
                let bytes: Vec<String> = chunk.iter().map(|b| format!("{b:#04x}")).collect();
                block.push(format!("        {}", bytes.join(" ")));
            }
            block.push("    .end array-data".to_string());
            data_blocks.push(block);
            format!("{name} {}, :array_data_{ix}", m.name(*src))
        }
        Op::Goto { target } => format!("{name} {}", label(*target)),
        Op::PackedSwitch { src, cases } => {
            let ix = data_blocks.len();
            let first_key = cases.first().map(|(k, _)| *k).unwrap_or(0);
            let mut block = vec![
                format!("    :switch_data_{ix}"),
                format!("    .packed-switch {}", hex_i64(first_key as i64)),
            ];
            for (_, target) in cases {
                block.push(format!("        {}", label(*target)));
            }
            block.push("    .end packed-switch".to_string());
            data_blocks.push(block);
            format!("{name} {}, :switch_data_{ix}", m.name(*src))
        }
        Op::SparseSwitch { src, cases } => {
            let ix = data_blocks.len();
            let mut block = vec![
                format!("    :switch_data_{ix}"),
                "    .sparse-switch".to_string(),
            ];
            for (key, target) in cases {
                block.push(format!(
                    "        {} -> {}",
                    hex_i64(*key as i64),
                    label(*target)
                ));
            }
            block.push("    .end sparse-switch".to_string());
            data_blocks.push(block);
            format!("{name} {}, :switch_data_{ix}", m.name(*src))
        }
        Op::Cmp { dst, a, b, .. } => format!(
            "{name} {}, {}, {}",
            m.name(*dst),
            m.name(*a),
            m.name(*b)
        ),
        Op::If { a, b, target, .. } => format!(
            "{name} {}, {}, {}",
            m.name(*a),
            m.name(*b),
            label(*target)
        ),
        Op::IfZ { a, target, .. } => format!("{name} {}, {}", m.name(*a), label(*target)),
        Op::ArrayGet {
            dst, array, index, ..
        } => format!(
            "{name} {}, {}, {}",
            m.name(*dst),
            m.name(*array),
            m.name(*index)
        ),
        Op::ArrayPut {
            src, array, index, ..
        } => format!(
            "{name} {}, {}, {}",
            m.name(*src),
            m.name(*array),
            m.name(*index)
        ),
        Op::InstanceGet {
            dst,
            object,
            field_idx,
            ..
        } => format!(
            "{name} {}, {}, {}",
            m.name(*dst),
            m.name(*object),
            field_str(*field_idx)
        ),
        Op::InstancePut {
            src,
            object,
            field_idx,
            ..
        } => format!(
            "{name} {}, {}, {}",
            m.name(*src),
            m.name(*object),
            field_str(*field_idx)
        ),
        Op::StaticGet { dst, field_idx, .. } => {
            format!("{name} {}, {}", m.name(*dst), field_str(*field_idx))
        }
        Op::StaticPut { src, field_idx, .. } => {
            format!("{name} {}, {}", m.name(*src), field_str(*field_idx))
        }
        Op::Invoke {
            method_idx, args, ..
        } => {
            let regs = if is_range { m.range(args) } else { m.list(args) };
            format!("{name} {regs}, {}", method_str(*method_idx))
        }
        Op::InvokePolymorphic {
            method_idx,
            proto_idx,
            args,
        } => {
            let regs = if is_range { m.range(args) } else { m.list(args) };
            format!(
                "{name} {regs}, {}, proto@{proto_idx}",
                method_str(*method_idx)
            )
        }
        Op::InvokeCustom {
            call_site_idx,
            args,
        } => {
            let regs = if is_range { m.range(args) } else { m.list(args) };
            format!("{name} {regs}, call_site@{call_site_idx}")
        }
        Op::Unary { dst, src, .. } => format!("{name} {}, {}", m.name(*dst), m.name(*src)),
        Op::Binary { dst, a, b, .. } => {
            if (0xb0..=0xcf).contains(&insn.opcode) {
                format!("{name} {}, {}", m.name(*dst), m.name(*b))
            } else {
                format!("{name} {}, {}, {}", m.name(*dst), m.name(*a), m.name(*b))
            }
        }
        Op::BinaryLit { dst, src, lit, .. } => format!(
            "{name} {}, {}, {}",
            m.name(*dst),
            m.name(*src),
            hex_i64(*lit as i64)
        ),
    }
}

fn hex_i64(v: i64) -> String {
    if v < 0 {
        format!("-{:#x}", v.unsigned_abs())
    } else {
        format!("{v:#x}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_literals() {
        assert_eq!(hex_i64(0), "0x0");
        assert_eq!(hex_i64(16), "0x10");
        assert_eq!(hex_i64(-1), "-0x1");
    }

    #[test]
    fn register_mapping_splits_params() {
        let m = RegMapper {
            registers_size: 3,
            ins_size: 1,
        };
        assert_eq!(m.name(0), "v0");
        assert_eq!(m.name(1), "v1");
        assert_eq!(m.name(2), "p0");
    }

    #[test]
    fn trivial_body() {
        let image = DexImage::parse(crate::testutil::minimal_dex()).unwrap();
        let code = CodeItem {
            registers_size: 1,
            ins_size: 0,
            outs_size: 0,
            debug_info_off: 0,
            insns: vec![0x000e],
            tries: vec![],
            handlers: vec![],
        };
        let lines = emit_method_code(&image, &code);
        assert_eq!(lines, vec!["    .registers 1", "    return-void"]);
    }

    #[test]
    fn branch_targets_get_labels() {
        let image = DexImage::parse(crate::testutil::minimal_dex()).unwrap();
        let code = CodeItem {
            registers_size: 1,
            ins_size: 0,
            outs_size: 0,
            debug_info_off: 0,
            // if-eqz v0, +2; return-void
            insns: vec![0x0038, 0x0002, 0x000e],
            tries: vec![],
            handlers: vec![],
        };
        let lines = emit_method_code(&image, &code);
        assert_eq!(
            lines,
            vec![
                "    .registers 1",
                "    if-eqz v0, :label_0002",
                "    :label_0002",
                "    return-void",
            ]
        );
    }

    #[test]
    fn whole_class_smali() {
        let image = DexImage::parse(crate::testutil::single_class_dex()).unwrap();
        let smali = write_class(&image, 0).unwrap();
        assert!(smali.starts_with(".class public La;\n"));
        assert!(smali.contains(".super Ljava/lang/Object;\n"));
        assert!(smali.contains(".method public m()V\n"));
        assert!(smali.contains("    .registers 1\n    return-void\n"));
        assert!(smali.contains(".end method\n"));
    }
}
