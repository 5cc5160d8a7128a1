//! Java source writer: renders a [`SourceFile`] tree and the lifted method
//! bodies into a `.java` file.
//!
//! Inner classes print nested inside their declaring class; a method that
//! fails to lift prints as a commented stub carrying its raw smali so the
//! class around it still comes out whole.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use log::warn;

use crate::arena::ExprArena;
use crate::dex::class::SourceFile;
use crate::dex::insns::InvokeKind;
use crate::error::FormatError;
use crate::lift::expr::{Expr, LValue, LocalInfo, Stmt};
use crate::lift::lift_method;
use crate::smali;
use crate::types::{AccessFlags, FlagContext, ObjectIdentifier};

const OBJECT_DESC: &str = "Ljava/lang/Object;";

/// Filesystem path for a class output file: `<out>/<pkg>/<Name>.<ext>`.
pub fn class_file_path(out_dir: &Path, name: &ObjectIdentifier, ext: &str) -> PathBuf {
    let mut path = out_dir.to_path_buf();
    let pkg = name.package_path();
    if !pkg.is_empty() {
        path.push(pkg);
    }
    path.push(format!("{}.{ext}", name.file_stem()));
    path
}

/// Decompiles a top-level class (and its attached inner classes) to Java
/// source text. `arena` is the calling task's scratch arena.
pub fn decompile_source_file(
    sf: &SourceFile,
    arena: &mut ExprArena,
) -> Result<String, FormatError> {
    let name = sf.name()?;
    let mut out = String::new();
    let pkg = name.package_name();
    if !pkg.is_empty() {
        writeln!(out, "package {pkg};").unwrap();
        out.push('\n');
    }
    render_class(sf, 0, arena, &mut out)?;
    Ok(out)
}

pub(crate) fn indent_str(level: usize) -> String {
    "    ".repeat(level)
}

fn render_class(
    sf: &SourceFile,
    level: usize,
    arena: &mut ExprArena,
    out: &mut String,
) -> Result<(), FormatError> {
    let image = sf.image;
    let def = sf.class_def();
    let def_index = sf.def_index;
    let name = sf.name()?;
    let flags = AccessFlags::from_u32(def.access_flags);
    let pad = indent_str(level);

    let keyword = if flags.contains(AccessFlags::INTERFACE) {
        "interface"
    } else if flags.contains(AccessFlags::ENUM) {
        "enum"
    } else {
        "class"
    };

    let mut header = format!(
        "{pad}{}{keyword} {}",
        flags.java_modifiers(FlagContext::Class),
        name.simple_name()
    );
    if def.has_superclass() {
        let superclass = image.type_desc(def.superclass_idx)?;
        if superclass != OBJECT_DESC && keyword == "class" {
            let _ = write!(
                header,
                " extends {}",
                ObjectIdentifier::from_jni_type(superclass).simple_name()
            );
        }
    }
    let interfaces = image.interfaces(def)?;
    if !interfaces.is_empty() {
        let names: Result<Vec<String>, FormatError> = interfaces
            .iter()
            .map(|&i| Ok(image.type_object(i)?.simple_name()))
            .collect();
        let joined = names?.join(", ");
        let link = if keyword == "interface" { "extends" } else { "implements" };
        let _ = write!(header, " {link} {joined}");
    }
    writeln!(out, "{header} {{").unwrap();

    if let Some(data) = image.class_data(def_index)? {
        let statics = image.static_values(def)?;
        for (i, f) in data.static_fields.iter().enumerate() {
            let fr = image.field_ref(f.field_idx)?;
            let fflags = AccessFlags::from_u32(f.access_flags);
            let mut line = format!(
                "{pad}    {}{} {}",
                fflags.java_modifiers(FlagContext::Field),
                fr.ty.to_java(),
                fr.name
            );
            if let Some(v) = statics.get(i) {
                if !v.is_default() {
                    let _ = write!(line, " = {}", v.to_java(image));
                }
            }
            writeln!(out, "{line};").unwrap();
        }
        for f in &data.instance_fields {
            let fr = image.field_ref(f.field_idx)?;
            let fflags = AccessFlags::from_u32(f.access_flags);
            writeln!(
                out,
                "{pad}    {}{} {};",
                fflags.java_modifiers(FlagContext::Field),
                fr.ty.to_java(),
                fr.name
            )
            .unwrap();
        }
        if !data.static_fields.is_empty() || !data.instance_fields.is_empty() {
            out.push('\n');
        }

        for m in data.direct_methods.iter().chain(&data.virtual_methods) {
            render_method(sf, m.method_idx, m.access_flags, m.code_off, level + 1, arena, out)?;
        }
    }

    for child in &sf.children {
        render_class(child, level + 1, arena, out)?;
    }

    writeln!(out, "{pad}}}").unwrap();
    Ok(())
}

fn render_method(
    sf: &SourceFile,
    method_idx: u32,
    access_flags: u32,
    code_off: u32,
    level: usize,
    arena: &mut ExprArena,
    out: &mut String,
) -> Result<(), FormatError> {
    let image = sf.image;
    let mref = image.method_ref(method_idx)?;
    let flags = AccessFlags::from_u32(access_flags);
    let is_static = flags.contains(AccessFlags::STATIC);
    let pad = indent_str(level);
    let class_name = sf.name()?;

    // Parameter naming mirrors the lifter: p1.. for instance methods,
    // p0.. for static ones.
    let first = if is_static { 0 } else { 1 };
    let params: Vec<String> = mref
        .sig
        .args
        .iter()
        .enumerate()
        .map(|(i, t)| format!("{} p{}", t.to_java(), first + i))
        .collect();

    let header = if mref.name == "<clinit>" {
        format!("{pad}static")
    } else if mref.name == "<init>" {
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
            mref.sig.return_type.to_java(),
            mref.name,
            params.join(", ")
        )
    };

    if code_off == 0 {
        // abstract or native
        writeln!(out, "{header};\n").unwrap();
        return Ok(());
    }

    let code = image.code_item(code_off)?;
    match lift_method(image, &mref, &code, is_static, arena) {
        Ok(body) => {
            if body.stmts.is_empty() {
                writeln!(out, "{header} {{ }}\n").unwrap();
            } else {
                writeln!(out, "{header} {{").unwrap();
                let printer = ExprPrinter {
                    arena,
                    locals: &body.locals,
                    class: &class_name,
                };
                render_stmts(&body.stmts, &printer, level + 1, out);
                writeln!(out, "{pad}}}\n").unwrap();
            }
        }
        Err(e) => {
            // Method-local failure: commented stub with the raw smali body.
            warn!("cannot lift {}->{}: {e}", class_name.as_jni_type(), mref.name);
            writeln!(out, "{header} {{").unwrap();
            writeln!(out, "{pad}    // {e}").unwrap();
            for line in smali::emit_method_code(image, &code) {
                writeln!(out, "{pad}    // {}", line.trim_start()).unwrap();
            }
            writeln!(out, "{pad}}}\n").unwrap();
        }
    }
    Ok(())
}

pub(crate) struct ExprPrinter<'a> {
    pub(crate) arena: &'a ExprArena,
    pub(crate) locals: &'a [LocalInfo],
    pub(crate) class: &'a ObjectIdentifier,
}

impl<'a> ExprPrinter<'a> {
    fn local_name(&self, id: crate::lift::expr::LocalId) -> &str {
        &self.locals[id.0 as usize].name
    }

    fn expr(&self, id: crate::arena::ExprId) -> String {
        match &self.arena[id] {
            Expr::IntLit(v) => format!("{v}"),
            Expr::LongLit(v) => format!("{v}L"),
            Expr::FloatLit(v) => format!("{v}f"),
            Expr::DoubleLit(v) => format!("{v}"),
            Expr::StringLit(s) => {
                format!("\"{}\"", crate::dex::values::escape_java_string(s))
            }
            Expr::ClassLit(t) => format!("{}.class", t.to_java()),
            Expr::Null => "null".to_string(),
            Expr::Local(l) => self.local_name(*l).to_string(),
            Expr::FieldGet {
                object,
                class,
                name,
                ..
            } => match object {
                Some(obj) => format!("{}.{name}", self.receiver(*obj)),
                None if class == self.class => name.clone(),
                None => format!("{}.{name}", class.simple_name()),
            },
            Expr::ArrayGet { array, index } => {
                format!("{}[{}]", self.operand(*array), self.expr(*index))
            }
            Expr::ArrayLength { array } => format!("{}.length", self.operand(*array)),
            Expr::Invoke {
                kind,
                class,
                name,
                receiver,
                args,
                ..
            } => {
                let args = self.arg_list(args);
                match (kind, receiver) {
                    (InvokeKind::Static, _) => {
                        if class == self.class {
                            format!("{name}({args})")
                        } else {
                            format!("{}.{name}({args})", class.simple_name())
                        }
                    }
                    (InvokeKind::Super, Some(_)) => format!("super.{name}({args})"),
                    (_, Some(r)) => {
                        if name == "<init>" {
                            // Unfused constructor chain: this(...) / super(...)
                            if class == self.class {
                                format!("this({args})")
                            } else {
                                format!("super({args})")
                            }
                        } else if self.is_this(*r) {
                            format!("{name}({args})")
                        } else {
                            format!("{}.{name}({args})", self.receiver(*r))
                        }
                    }
                    (_, None) => format!("{name}({args})"),
                }
            }
            Expr::NewInstance { class, args } => {
                format!("new {}({})", class.simple_name(), self.arg_list(args))
            }
            Expr::NewArray { elem, size } => {
                format!("new {}[{}]", elem.to_java(), self.expr(*size))
            }
            Expr::ArrayInit { elem, values } => {
                format!("new {}[] {{ {} }}", elem.to_java(), self.arg_list(values))
            }
            Expr::Binary { op, lhs, rhs, .. } => format!(
                "{} {} {}",
                self.operand(*lhs),
                op.symbol(),
                self.operand(*rhs)
            ),
            Expr::Unary { op, operand } => {
                use crate::dex::insns::UnaryOp::*;
                let inner = self.operand(*operand);
                match op {
                    NegInt | NegLong | NegFloat | NegDouble => format!("-{inner}"),
                    NotInt | NotLong => format!("~{inner}"),
                    IntToLong | FloatToLong | DoubleToLong => format!("(long) {inner}"),
                    IntToFloat | LongToFloat | DoubleToFloat => format!("(float) {inner}"),
                    IntToDouble | LongToDouble | FloatToDouble => format!("(double) {inner}"),
                    LongToInt | FloatToInt | DoubleToInt => format!("(int) {inner}"),
                    IntToByte => format!("(byte) {inner}"),
                    IntToChar => format!("(char) {inner}"),
                    IntToShort => format!("(short) {inner}"),
                }
            }
            Expr::Cmp { kind, lhs, rhs } => {
                use crate::dex::insns::CmpKind::*;
                let l = self.expr(*lhs);
                let r = self.expr(*rhs);
                // cmpl yields -1 and cmpg yields 1 whenever either operand
                // is NaN, regardless of position; Float.compare alone uses
                // the NaN-is-greatest total order and would flip the sign.
                match kind {
                    CmpLong => format!("Long.compare({l}, {r})"),
                    CmplFloat => format!(
                        "((Float.isNaN({l}) || Float.isNaN({r})) ? -1 : Float.compare({l}, {r}))"
                    ),
                    CmpgFloat => format!(
                        "((Float.isNaN({l}) || Float.isNaN({r})) ? 1 : Float.compare({l}, {r}))"
                    ),
                    CmplDouble => format!(
                        "((Double.isNaN({l}) || Double.isNaN({r})) ? -1 : Double.compare({l}, {r}))"
                    ),
                    CmpgDouble => format!(
                        "((Double.isNaN({l}) || Double.isNaN({r})) ? 1 : Double.compare({l}, {r}))"
                    ),
                }
            }
            Expr::Compare { test, lhs, rhs } => format!(
                "{} {} {}",
                self.operand(*lhs),
                test.symbol(),
                self.operand(*rhs)
            ),
            Expr::Cast { ty, operand } => {
                format!("({}) {}", ty.to_java(), self.operand(*operand))
            }
            Expr::InstanceOf { operand, ty } => {
                format!("{} instanceof {}", self.operand(*operand), ty.to_java())
            }
            Expr::OpaqueRef(s) => s.clone(),
        }
    }

    /// Operand position: parenthesize anything that could rebind.
    fn operand(&self, id: crate::arena::ExprId) -> String {
        let needs_parens = matches!(
            self.arena[id],
            Expr::Binary { .. }
                | Expr::Compare { .. }
                | Expr::Cast { .. }
                | Expr::InstanceOf { .. }
                | Expr::Unary { .. }
        );
        if needs_parens {
            format!("({})", self.expr(id))
        } else {
            self.expr(id)
        }
    }

    /// Receiver position: like operand, but also wraps `new` expressions.
    fn receiver(&self, id: crate::arena::ExprId) -> String {
        if matches!(self.arena[id], Expr::NewInstance { .. }) {
            format!("({})", self.expr(id))
        } else {
            self.operand(id)
        }
    }

    fn is_this(&self, id: crate::arena::ExprId) -> bool {
        matches!(&self.arena[id], Expr::Local(l) if self.local_name(*l) == "this")
    }

    fn arg_list(&self, args: &[crate::arena::ExprId]) -> String {
        args.iter()
            .map(|&a| self.expr(a))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

pub(crate) fn render_stmts(stmts: &[Stmt], p: &ExprPrinter, level: usize, out: &mut String) {
    let pad = indent_str(level);
    for stmt in stmts {
        match stmt {
            Stmt::Expr { expr, .. } => writeln!(out, "{pad}{};", p.expr(*expr)).unwrap(),
            Stmt::Assign {
                target,
                value,
                declare,
                ..
            } => {
                let value = p.expr(*value);
                let lhs = match target {
                    LValue::Local(l) => match declare {
                        Some(ty) => format!("{} {}", ty.to_java(), p.local_name(*l)),
                        None => p.local_name(*l).to_string(),
                    },
                    LValue::Field {
                        object,
                        class,
                        name,
                    } => match object {
                        Some(obj) if p.is_this(*obj) => format!("this.{name}"),
                        Some(obj) => format!("{}.{name}", p.receiver(*obj)),
                        None if class == p.class => name.clone(),
                        None => format!("{}.{name}", class.simple_name()),
                    },
                    LValue::Array { array, index } => {
                        format!("{}[{}]", p.operand(*array), p.expr(*index))
                    }
                };
                writeln!(out, "{pad}{lhs} = {value};").unwrap();
            }
            Stmt::If {
                cond,
                then_body,
                else_body,
                ..
            } => {
                writeln!(out, "{pad}if ({}) {{", p.expr(*cond)).unwrap();
                render_stmts(then_body, p, level + 1, out);
                if else_body.is_empty() {
                    writeln!(out, "{pad}}}").unwrap();
                } else {
                    writeln!(out, "{pad}}} else {{").unwrap();
                    render_stmts(else_body, p, level + 1, out);
                    writeln!(out, "{pad}}}").unwrap();
                }
            }
            Stmt::While { cond, body, .. } => {
                writeln!(out, "{pad}while ({}) {{", p.expr(*cond)).unwrap();
                render_stmts(body, p, level + 1, out);
                writeln!(out, "{pad}}}").unwrap();
            }
            Stmt::DoWhile { body, cond, .. } => {
                writeln!(out, "{pad}do {{").unwrap();
                render_stmts(body, p, level + 1, out);
                writeln!(out, "{pad}}} while ({});", p.expr(*cond)).unwrap();
            }
            Stmt::Switch { value, arms, .. } => {
                writeln!(out, "{pad}switch ({}) {{", p.expr(*value)).unwrap();
                for arm in arms {
                    match arm.key {
                        Some(k) => writeln!(
                            out,
                            "{pad}    case {k}: goto label_{:04x};",
                            arm.label
                        )
                        .unwrap(),
                        None => writeln!(
                            out,
                            "{pad}    default: goto label_{:04x};",
                            arm.label
                        )
                        .unwrap(),
                    }
                }
                writeln!(out, "{pad}}}").unwrap();
            }
            Stmt::Label(l) => writeln!(out, "{}label_{l:04x}:", indent_str(level.saturating_sub(1))).unwrap(),
            Stmt::Goto { label, .. } => writeln!(out, "{pad}goto label_{label:04x};").unwrap(),
            Stmt::CondGoto { cond, label, .. } => writeln!(
                out,
                "{pad}if ({}) goto label_{label:04x};",
                p.expr(*cond)
            )
            .unwrap(),
            Stmt::Return { value, .. } => match value {
                Some(v) => writeln!(out, "{pad}return {};", p.expr(*v)).unwrap(),
                None => writeln!(out, "{pad}return;").unwrap(),
            },
            Stmt::Throw { value, .. } => {
                writeln!(out, "{pad}throw {};", p.expr(*value)).unwrap()
            }
            Stmt::Try { body, catches } => {
                writeln!(out, "{pad}try {{").unwrap();
                render_stmts(body, p, level + 1, out);
                for c in catches {
                    let ty = c
                        .exception
                        .as_ref()
                        .map(|t| t.simple_name())
                        .unwrap_or_else(|| "Throwable".to_string());
                    writeln!(out, "{pad}}} catch ({ty} {}) {{", p.local_name(c.var)).unwrap();
                    render_stmts(&c.body, p, level + 1, out);
                }
                writeln!(out, "{pad}}}").unwrap();
            }
            Stmt::Synchronized { monitor, body, .. } => {
                writeln!(out, "{pad}synchronized ({}) {{", p.expr(*monitor)).unwrap();
                render_stmts(body, p, level + 1, out);
                writeln!(out, "{pad}}}").unwrap();
            }
            Stmt::MonitorEnter { monitor, .. } => {
                writeln!(out, "{pad}// monitor-enter {}", p.expr(*monitor)).unwrap()
            }
            Stmt::MonitorExit { monitor, .. } => {
                writeln!(out, "{pad}// monitor-exit {}", p.expr(*monitor)).unwrap()
            }
            Stmt::Comment(text) => writeln!(out, "{pad}// {text}").unwrap(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ExprArena;
    use crate::dex::class::SourceFile;
    use crate::dex::image::DexImage;

    #[test]
    fn class_file_paths() {
        let out = Path::new("/tmp/out");
        let a = ObjectIdentifier::from_jni_type("La;");
        assert_eq!(class_file_path(out, &a, "java"), Path::new("/tmp/out/a.java"));
        let b = ObjectIdentifier::from_jni_type("Lcom/example/Main;");
        assert_eq!(
            class_file_path(out, &b, "smali"),
            Path::new("/tmp/out/com/example/Main.smali")
        );
    }

    #[test]
    fn trivial_class_source() {
        let image = DexImage::parse(crate::testutil::single_class_dex()).unwrap();
        let sf = SourceFile::build(&image, 0).unwrap();
        let mut arena = ExprArena::new();
        let src = decompile_source_file(&sf, &mut arena).unwrap();
        assert!(src.contains("public class a {"), "got:\n{src}");
        assert!(src.contains("public void m() { }"), "got:\n{src}");
        assert!(!src.contains("package "), "default package: got:\n{src}");
    }
}
