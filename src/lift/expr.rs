//! The expression and statement tree the lifter produces.
//!
//! Expressions live in the per-task [`ExprArena`](crate::arena::ExprArena)
//! and reference each other by [`ExprId`]; statements own their child
//! statement lists directly. Every node records the code-unit offset it was
//! lifted from (see the arena's `ExprNode`) so diagnostics can point back
//! into the bytecode.

use crate::arena::ExprId;
use crate::dex::insns::{Arith, CmpKind, InvokeKind, NumKind, TestKind, UnaryOp};
use crate::types::{MethodSignature, ObjectIdentifier, TypeSignature};

/// Handle to a named local variable of the method being lifted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalId(pub u32);

/// A named local: parameters, materialized registers and merge locals all
/// end up here.
#[derive(Debug, Clone)]
pub struct LocalInfo {
    pub name: String,
    pub ty: Option<TypeSignature>,
    /// Set once a declaration statement has been emitted.
    pub declared: bool,
}

#[derive(Debug)]
pub enum Expr {
    IntLit(i32),
    LongLit(i64),
    FloatLit(f32),
    DoubleLit(f64),
    StringLit(String),
    ClassLit(TypeSignature),
    Null,
    Local(LocalId),
    FieldGet {
        /// `None` for static fields.
        object: Option<ExprId>,
        class: ObjectIdentifier,
        name: String,
        ty: TypeSignature,
    },
    ArrayGet {
        array: ExprId,
        index: ExprId,
    },
    ArrayLength {
        array: ExprId,
    },
    Invoke {
        kind: InvokeKind,
        class: ObjectIdentifier,
        name: String,
        sig: MethodSignature,
        /// `None` for static calls.
        receiver: Option<ExprId>,
        args: Vec<ExprId>,
    },
    /// Fused `new-instance` + `invoke-direct <init>`.
    NewInstance {
        class: ObjectIdentifier,
        args: Vec<ExprId>,
    },
    NewArray {
        elem: TypeSignature,
        size: ExprId,
    },
    /// `filled-new-array`, or a `new-array` rewritten by `fill-array-data`.
    ArrayInit {
        elem: TypeSignature,
        values: Vec<ExprId>,
    },
    Binary {
        op: Arith,
        kind: NumKind,
        lhs: ExprId,
        rhs: ExprId,
    },
    Unary {
        op: UnaryOp,
        operand: ExprId,
    },
    /// Three-way comparison producing -1/0/1 with the opcode's NaN bias.
    Cmp {
        kind: CmpKind,
        lhs: ExprId,
        rhs: ExprId,
    },
    /// Boolean relation, the condition of `if`/`while`.
    Compare {
        test: TestKind,
        lhs: ExprId,
        rhs: ExprId,
    },
    Cast {
        ty: TypeSignature,
        operand: ExprId,
    },
    InstanceOf {
        operand: ExprId,
        ty: TypeSignature,
    },
    /// Placeholder for references the source writer prints verbatim
    /// (method handles, method types, call sites).
    OpaqueRef(String),
}

/// Assignment target.
#[derive(Debug)]
pub enum LValue {
    Local(LocalId),
    Field {
        object: Option<ExprId>,
        class: ObjectIdentifier,
        name: String,
    },
    Array {
        array: ExprId,
        index: ExprId,
    },
}

/// Label identified by the code-unit offset it marks.
pub type Label = u32;

#[derive(Debug)]
pub struct CatchArm {
    /// `None` is the catch-all handler.
    pub exception: Option<ObjectIdentifier>,
    pub var: LocalId,
    pub body: Vec<Stmt>,
}

#[derive(Debug)]
pub struct SwitchArm {
    /// `None` is the default arm.
    pub key: Option<i32>,
    pub label: Label,
}

#[derive(Debug)]
pub enum Stmt {
    /// Expression evaluated for effect (a call whose result is unused).
    Expr { expr: ExprId, offset: u32 },
    Assign {
        target: LValue,
        value: ExprId,
        /// Present when this assignment doubles as the declaration.
        declare: Option<TypeSignature>,
        offset: u32,
    },
    If {
        cond: ExprId,
        then_body: Vec<Stmt>,
        else_body: Vec<Stmt>,
        offset: u32,
    },
    While {
        cond: ExprId,
        body: Vec<Stmt>,
        offset: u32,
    },
    DoWhile {
        body: Vec<Stmt>,
        cond: ExprId,
        offset: u32,
    },
    /// Unstructured switch: each arm jumps to a label.
    Switch {
        value: ExprId,
        arms: Vec<SwitchArm>,
        offset: u32,
    },
    Label(Label),
    Goto { label: Label, offset: u32 },
    /// Conditional jump, the pre-structuring form of `if`.
    CondGoto {
        cond: ExprId,
        label: Label,
        offset: u32,
    },
    Return {
        value: Option<ExprId>,
        offset: u32,
    },
    Throw { value: ExprId, offset: u32 },
    Try {
        body: Vec<Stmt>,
        catches: Vec<CatchArm>,
    },
    Synchronized {
        monitor: ExprId,
        body: Vec<Stmt>,
        offset: u32,
    },
    /// Raw monitor ops, kept when enter/exit pairing is not well nested.
    MonitorEnter { monitor: ExprId, offset: u32 },
    MonitorExit { monitor: ExprId, offset: u32 },
    Comment(String),
}

/// Best-effort static type of an expression node. `None` means unknown
/// (e.g. `null`, opaque references).
pub fn infer_type(
    arena: &crate::arena::ExprArena,
    locals: &[LocalInfo],
    id: ExprId,
) -> Option<TypeSignature> {
    use crate::dex::insns::UnaryOp::*;
    match &arena[id] {
        Expr::IntLit(_) => Some(TypeSignature::Int),
        Expr::LongLit(_) => Some(TypeSignature::Long),
        Expr::FloatLit(_) => Some(TypeSignature::Float),
        Expr::DoubleLit(_) => Some(TypeSignature::Double),
        Expr::StringLit(_) => Some(TypeSignature::Object(ObjectIdentifier::from_jni_type(
            "Ljava/lang/String;",
        ))),
        Expr::ClassLit(_) => Some(TypeSignature::Object(ObjectIdentifier::from_jni_type(
            "Ljava/lang/Class;",
        ))),
        Expr::Null => None,
        Expr::Local(lid) => locals.get(lid.0 as usize).and_then(|l| l.ty.clone()),
        Expr::FieldGet { ty, .. } => Some(ty.clone()),
        Expr::ArrayGet { array, .. } => match infer_type(arena, locals, *array) {
            Some(TypeSignature::Array(inner)) => Some(*inner),
            _ => None,
        },
        Expr::ArrayLength { .. } => Some(TypeSignature::Int),
        Expr::Invoke { sig, .. } => match sig.return_type {
            TypeSignature::Void => None,
            ref t => Some(t.clone()),
        },
        Expr::NewInstance { class, .. } => Some(TypeSignature::Object(class.clone())),
        Expr::NewArray { elem, .. } | Expr::ArrayInit { elem, .. } => {
            Some(TypeSignature::Array(Box::new(elem.clone())))
        }
        Expr::Binary { kind, .. } => Some(match kind {
            crate::dex::insns::NumKind::Int => TypeSignature::Int,
            crate::dex::insns::NumKind::Long => TypeSignature::Long,
            crate::dex::insns::NumKind::Float => TypeSignature::Float,
            crate::dex::insns::NumKind::Double => TypeSignature::Double,
        }),
        Expr::Unary { op, .. } => Some(match op {
            NegInt | NotInt | LongToInt | FloatToInt | DoubleToInt => TypeSignature::Int,
            NegLong | NotLong | IntToLong | FloatToLong | DoubleToLong => TypeSignature::Long,
            NegFloat | IntToFloat | LongToFloat | DoubleToFloat => TypeSignature::Float,
            NegDouble | IntToDouble | LongToDouble | FloatToDouble => TypeSignature::Double,
            IntToByte => TypeSignature::Byte,
            IntToChar => TypeSignature::Char,
            IntToShort => TypeSignature::Short,
        }),
        Expr::Cmp { .. } => Some(TypeSignature::Int),
        Expr::Compare { .. } => Some(TypeSignature::Bool),
        Expr::Cast { ty, .. } => Some(ty.clone()),
        Expr::InstanceOf { .. } => Some(TypeSignature::Bool),
        Expr::OpaqueRef(_) => None,
    }
}

impl Stmt {
    /// Labels this statement (tree) jumps to.
    pub fn collect_label_refs(&self, out: &mut Vec<Label>) {
        match self {
            Stmt::Goto { label, .. } | Stmt::CondGoto { label, .. } => out.push(*label),
            Stmt::Switch { arms, .. } => out.extend(arms.iter().map(|a| a.label)),
            Stmt::If {
                then_body,
                else_body,
                ..
            } => {
                for s in then_body.iter().chain(else_body) {
                    s.collect_label_refs(out);
                }
            }
            Stmt::While { body, .. }
            | Stmt::DoWhile { body, .. }
            | Stmt::Synchronized { body, .. } => {
                for s in body {
                    s.collect_label_refs(out);
                }
            }
            Stmt::Try { body, catches } => {
                for s in body {
                    s.collect_label_refs(out);
                }
                for c in catches {
                    for s in &c.body {
                        s.collect_label_refs(out);
                    }
                }
            }
            _ => {}
        }
    }
}
