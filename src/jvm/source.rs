//! Java source writer for the class-file pipeline. Rendering of statement
//! trees is shared with the DEX path; only the container walk differs.

use std::fmt::Write as _;

use log::warn;

use crate::arena::ExprArena;
use crate::error::FormatError;
use crate::java::{indent_str, render_stmts, ExprPrinter};
use crate::jvm::class_file::{ClassFile, MemberInfo};
use crate::jvm::code::lift_jvm_method;
use crate::types::{AccessFlags, FlagContext, MethodSignature, ObjectIdentifier, TypeSignature};

/// Decompiles one parsed class file to Java source text.
pub fn decompile_class_file(class: &ClassFile) -> Result<String, FormatError> {
    let name = class.this_name()?;
    let mut arena = ExprArena::new();
    let mut out = String::new();

    let pkg = name.package_name();
    if !pkg.is_empty() {
        writeln!(out, "package {pkg};").unwrap();
        out.push('\n');
    }

    let flags = AccessFlags::from_u32(u32::from(class.access_flags));
    let keyword = if flags.contains(AccessFlags::INTERFACE) {
        "interface"
    } else if flags.contains(AccessFlags::ENUM) {
        "enum"
    } else {
        "class"
    };
    let mut header = format!(
        "{}{keyword} {}",
        flags.java_modifiers(FlagContext::Class),
        name.simple_name()
    );
    if class.super_class != 0 {
        let superclass = class.class_name(class.super_class)?;
        if superclass != "java/lang/Object" && keyword == "class" {
            let _ = write!(
                header,
                " extends {}",
                ObjectIdentifier::from_jni_type(&format!("L{superclass};")).simple_name()
            );
        }
    }
    if !class.interfaces.is_empty() {
        let names: Result<Vec<String>, FormatError> = class
            .interfaces
            .iter()
            .map(|&i| {
                Ok(ObjectIdentifier::from_jni_type(&format!("L{};", class.class_name(i)?))
                    .simple_name())
            })
            .collect();
        let link = if keyword == "interface" { "extends" } else { "implements" };
        let _ = write!(header, " {link} {}", names?.join(", "));
    }
    writeln!(out, "{header} {{").unwrap();

    for f in &class.fields {
        let fflags = AccessFlags::from_u32(u32::from(f.access_flags));
        let ty = TypeSignature::from_jni(class.utf8(f.descriptor_index)?);
        writeln!(
            out,
            "    {}{} {};",
            fflags.java_modifiers(FlagContext::Field),
            ty.to_java(),
            class.utf8(f.name_index)?
        )
        .unwrap();
    }
    if !class.fields.is_empty() {
        out.push('\n');
    }

    for m in &class.methods {
        render_method(class, m, &name, &mut arena, &mut out)?;
    }

    writeln!(out, "}}").unwrap();
    Ok(out)
}

fn render_method(
    class: &ClassFile,
    method: &MemberInfo,
    class_name: &ObjectIdentifier,
    arena: &mut ExprArena,
    out: &mut String,
) -> Result<(), FormatError> {
    let name = class.utf8(method.name_index)?.to_string();
    let sig = MethodSignature::from_jni(class.utf8(method.descriptor_index)?);
    let flags = AccessFlags::from_u32(u32::from(method.access_flags));
    let is_static = flags.contains(AccessFlags::STATIC);
    let pad = indent_str(1);

    let first = if is_static { 0 } else { 1 };
    let params: Vec<String> = sig
        .args
        .iter()
        .enumerate()
        .map(|(i, t)| format!("{} p{}", t.to_java(), first + i))
        .collect();

    let header = if name == "<clinit>" {
        format!("{pad}static")
    } else if name == "<init>" {
        format!(
            "{pad}{}{}({})",
            flags.java_modifiers(FlagContext::Method),
            class_name.simple_name(),
            params.join(", ")
        )
    } else {
        format!(
            "{pad}{}{} {}({})",
            flags.java_modifiers(FlagContext::Method),
            sig.return_type.to_java(),
            name,
            params.join(", ")
        )
    };

    let code = match class.code_of(method)? {
        Some(code) => code,
        None => {
            writeln!(out, "{header};\n").unwrap();
            return Ok(());
        }
    };

    match lift_jvm_method(class, method, &code, arena) {
        Ok(body) => {
            if body.stmts.is_empty() {
                writeln!(out, "{header} {{ }}\n").unwrap();
            } else {
                writeln!(out, "{header} {{").unwrap();
                let printer = ExprPrinter {
                    arena,
                    locals: &body.locals,
                    class: class_name,
                };
                render_stmts(&body.stmts, &printer, 2, out);
                writeln!(out, "{pad}}}\n").unwrap();
            }
        }
        Err(e) => {
            warn!("cannot lift {}.{name}: {e}", class_name.as_java_type());
            writeln!(out, "{header} {{").unwrap();
            writeln!(out, "{pad}    // {e}").unwrap();
            writeln!(out, "{pad}}}\n").unwrap();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::minimal_class_file;

    #[test]
    fn empty_class_renders() {
        let bytes = minimal_class_file("p/A");
        let class = ClassFile::parse(&bytes).unwrap();
        let src = decompile_class_file(&class).unwrap();
        assert!(src.contains("package p;"), "got:\n{src}");
        assert!(src.contains("public class A {"), "got:\n{src}");
    }
}
