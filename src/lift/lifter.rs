//! Lifts a decoded Dalvik instruction stream into a structured statement
//! tree.
//!
//! The pipeline per method: partition into basic blocks, decide which
//! registers become named locals, symbolically execute each block in
//! reverse post-order building expressions, lay the blocks back out as a
//! labelled statement list, wrap try/catch ranges, pair monitor regions,
//! then fold conditional-goto patterns into `if`/`while`/`do-while`.
//! Anything the folder cannot recognize stays as an explicit label and
//! goto, which the source writer prints as-is.

use std::collections::{BTreeSet, HashMap};

use log::warn;

use crate::arena::{ExprArena, ExprId};
use crate::dex::class::CodeItem;
use crate::dex::image::{DexImage, MethodRef};
use crate::dex::insns::{decode_method, Arith, Instruction, InvokeKind, NumKind, Op, UnaryOp};
use crate::error::LiftError;
use crate::lift::blocks::{partition, Cfg};
use crate::lift::expr::{
    CatchArm, Expr, LValue, LocalId, LocalInfo, Stmt, SwitchArm,
};
use crate::lift::regs::{cross_block_registers, RegisterFile};
use crate::types::{MethodSignature, ObjectIdentifier, TypeSignature};

/// A lifted method body: the statement tree plus its local table. The
/// expressions referenced from the statements live in the task's arena.
#[derive(Debug)]
pub struct LiftedBody {
    pub stmts: Vec<Stmt>,
    pub locals: Vec<LocalInfo>,
}

/// Block terminator collected during symbolic execution, before layout.
enum Term {
    Fall,
    Goto(usize),
    CondGoto { cond: ExprId, target: usize },
    Switch { value: ExprId, cases: Vec<(i32, usize)> },
    Return(Option<ExprId>),
    Throw(ExprId),
}

struct Lifter<'a, 'img> {
    image: &'img DexImage,
    code: &'a CodeItem,
    insns: Vec<Instruction>,
    cfg: Cfg,
    arena: &'a mut ExprArena,
    locals: Vec<LocalInfo>,
    /// Materialized register -> its local.
    reg_local: HashMap<u16, LocalId>,
    /// Handler entry offset -> exception local.
    catch_vars: HashMap<usize, LocalId>,
}

/// Lifts one method. `is_static` controls parameter naming (`p0` vs
/// `this`).
pub fn lift_method(
    image: &DexImage,
    mref: &MethodRef,
    code: &CodeItem,
    is_static: bool,
    arena: &mut ExprArena,
) -> Result<LiftedBody, LiftError> {
    let insns = decode_method(&code.insns)?;
    let cfg = partition(&insns, code)?;
    let shared = cross_block_registers(&insns, &cfg);

    let mut lifter = Lifter {
        image,
        code,
        insns,
        cfg,
        arena,
        locals: Vec::new(),
        reg_local: HashMap::new(),
        catch_vars: HashMap::new(),
    };
    lifter.seed_parameters(&mref.sig, is_static);
    lifter.seed_shared(&shared);
    lifter.seed_catch_vars();

    let mut stmts = lifter.run()?;
    if mref.sig.return_type == TypeSignature::Void {
        if let Some(Stmt::Return { value: None, .. }) = stmts.last() {
            stmts.pop();
        }
    }
    Ok(LiftedBody {
        stmts,
        locals: lifter.locals,
    })
}

impl<'a, 'img> Lifter<'a, 'img> {
    fn new_local(&mut self, name: String, ty: Option<TypeSignature>, declared: bool) -> LocalId {
        let id = LocalId(self.locals.len() as u32);
        self.locals.push(LocalInfo { name, ty, declared });
        id
    }

    /// Parameters occupy the top `ins_size` registers. Instance methods
    /// spend the first one on `this`.
    fn seed_parameters(&mut self, sig: &MethodSignature, is_static: bool) {
        let mut reg = self.code.registers_size.saturating_sub(self.code.ins_size);
        let mut position = 0u32;
        if !is_static {
            let id = self.new_local("this".to_string(), None, true);
            self.reg_local.insert(reg, id);
            reg += 1;
            position = 1;
        }
        for ty in &sig.args {
            let id = self.new_local(format!("p{position}"), Some(ty.clone()), true);
            self.reg_local.insert(reg, id);
            reg += if ty.is_wide() { 2 } else { 1 };
            position += 1;
        }
    }

    fn seed_shared(&mut self, shared: &BTreeSet<u16>) {
        for &reg in shared {
            if !self.reg_local.contains_key(&reg) {
                let id = self.new_local(format!("v{reg}"), None, false);
                self.reg_local.insert(reg, id);
            }
        }
    }

    fn seed_catch_vars(&mut self) {
        let mut offsets: BTreeSet<usize> = BTreeSet::new();
        for t in &self.code.tries {
            let handler = &self.code.handlers[t.handler_index];
            offsets.extend(handler.catches.iter().map(|(_, a)| *a as usize));
            offsets.extend(handler.catch_all.map(|a| a as usize));
        }
        for (i, off) in offsets.into_iter().enumerate() {
            let id = self.new_local(format!("ex{i}"), None, true);
            self.catch_vars.insert(off, id);
        }
    }

    fn run(&mut self) -> Result<Vec<Stmt>, LiftError> {
        // Lift every block in reverse post-order, then lay them out in
        // offset order.
        let order = self.cfg.reverse_post_order();
        let mut lifted: HashMap<usize, (Vec<Stmt>, Term)> = HashMap::new();
        for bix in order {
            let (stmts, term) = self.lift_block(bix)?;
            lifted.insert(bix, (stmts, term));
        }

        let mut layout: Vec<usize> = lifted.keys().copied().collect();
        layout.sort_by_key(|&b| self.cfg.blocks[b].start);

        let mut out: Vec<Stmt> = Vec::new();
        for (pos, &bix) in layout.iter().enumerate() {
            let block_start = self.cfg.blocks[bix].start;
            let block_end = self.cfg.blocks[bix].end;
            out.push(Stmt::Label(block_start as u32));
            let (stmts, term) = lifted.remove(&bix).expect("lifted above");
            out.extend(stmts);
            let next_start = layout
                .get(pos + 1)
                .map(|&b| self.cfg.blocks[b].start);
            match term {
                Term::Fall => {
                    if next_start != Some(block_end) {
                        if let Some(next) = next_start {
                            out.push(Stmt::Goto {
                                label: next as u32,
                                offset: block_end as u32,
                            });
                        }
                    }
                }
                Term::Goto(target) => {
                    if next_start != Some(target) {
                        out.push(Stmt::Goto {
                            label: target as u32,
                            offset: block_end as u32,
                        });
                    }
                }
                Term::CondGoto { cond, target } => out.push(Stmt::CondGoto {
                    cond,
                    label: target as u32,
                    offset: block_end as u32,
                }),
                Term::Switch { value, cases } => {
                    let mut arms: Vec<SwitchArm> = cases
                        .into_iter()
                        .map(|(k, t)| SwitchArm {
                            key: Some(k),
                            label: t as u32,
                        })
                        .collect();
                    arms.push(SwitchArm {
                        key: None,
                        label: block_end as u32,
                    });
                    out.push(Stmt::Switch {
                        value,
                        arms,
                        offset: block_start as u32,
                    });
                }
                Term::Return(value) => out.push(Stmt::Return {
                    value,
                    offset: block_end as u32,
                }),
                Term::Throw(value) => out.push(Stmt::Throw {
                    value,
                    offset: block_end as u32,
                }),
            }
        }

        let mut out = self.wrap_tries(out)?;
        pair_monitors(&mut out, self.arena);
        // Unreferenced block labels would block pattern recognition.
        strip_unused_labels(&mut out);
        let mut out = fold_patterns(out, self.arena);
        strip_unused_labels(&mut out);
        Ok(out)
    }

    /// Symbolic execution of one basic block.
    fn lift_block(&mut self, bix: usize) -> Result<(Vec<Stmt>, Term), LiftError> {
        let block_insns = self.cfg.blocks[bix].insns.clone();
        let block_start = self.cfg.blocks[bix].start;
        let mut env = RegisterFile::new(self.code.registers_size);
        // Materialized registers are visible at entry; everything else must
        // be defined inside the block before use.
        let reg_local = self.reg_local.clone();
        for (&reg, &lid) in &reg_local {
            let node = self.arena.alloc_from_reg(Expr::Local(lid), block_start as u32, Some(reg));
            env.set(reg, node);
        }

        let mut stmts: Vec<Stmt> = Vec::new();
        let mut term = Term::Fall;
        let mut pending_result: Option<ExprId> = None;
        let mut pending_new: HashMap<u16, ObjectIdentifier> = HashMap::new();

        for (pos, &iix) in block_insns.iter().enumerate() {
            let insn = self.insns[iix].clone();
            let offset = insn.offset as u32;
            let next_is_move_result = block_insns
                .get(pos + 1)
                .map(|&n| matches!(self.insns[n].op, Op::MoveResult { .. }))
                .unwrap_or(false);

            match insn.op {
                Op::Nop => {}

                Op::Move { dst, src, .. } => {
                    let value = self.use_reg(&env, src, insn.offset)?;
                    self.define(&mut env, &mut stmts, dst, value, offset)?;
                }

                Op::MoveResult { dst, .. } => {
                    let value = pending_result.take().ok_or(LiftError::Cfg {
                        offset: insn.offset,
                        reason: "move-result without a preceding invoke".to_string(),
                    })?;
                    self.define(&mut env, &mut stmts, dst, value, offset)?;
                }

                Op::MoveException { dst } => {
                    let var = self
                        .catch_vars
                        .get(&block_start)
                        .copied()
                        .ok_or(LiftError::Cfg {
                            offset: insn.offset,
                            reason: "move-exception outside a handler".to_string(),
                        })?;
                    let value = self.arena.alloc(Expr::Local(var), offset);
                    self.define(&mut env, &mut stmts, dst, value, offset)?;
                }

                Op::ReturnVoid => term = Term::Return(None),
                Op::Return { src, .. } => {
                    term = Term::Return(Some(self.use_reg(&env, src, insn.offset)?))
                }

                Op::Const { dst, value } => {
                    let id = self.arena.alloc_from_reg(Expr::IntLit(value), offset, Some(dst));
                    self.define(&mut env, &mut stmts, dst, id, offset)?;
                }
                Op::ConstWide { dst, value } => {
                    let id = self.arena.alloc_from_reg(Expr::LongLit(value), offset, Some(dst));
                    self.define(&mut env, &mut stmts, dst, id, offset)?;
                }
                Op::ConstString { dst, string_idx } => {
                    let s = self.image.string(string_idx).map_err(|_| LiftError::Cfg {
                        offset: insn.offset,
                        reason: format!("string index {string_idx} unresolvable"),
                    })?;
                    let id = self
                        .arena
                        .alloc_from_reg(Expr::StringLit(s.to_string()), offset, Some(dst));
                    self.define(&mut env, &mut stmts, dst, id, offset)?;
                }
                Op::ConstClass { dst, type_idx } => {
                    let ty = self.type_sig(type_idx, insn.offset)?;
                    let id = self.arena.alloc_from_reg(Expr::ClassLit(ty), offset, Some(dst));
                    self.define(&mut env, &mut stmts, dst, id, offset)?;
                }
                Op::ConstMethodHandle { dst, handle_idx } => {
                    let id = self.arena.alloc_from_reg(
                        Expr::OpaqueRef(format!("handle@{handle_idx}")),
                        offset,
                        Some(dst),
                    );
                    self.define(&mut env, &mut stmts, dst, id, offset)?;
                }
                Op::ConstMethodType { dst, proto_idx } => {
                    let id = self.arena.alloc_from_reg(
                        Expr::OpaqueRef(format!("proto@{proto_idx}")),
                        offset,
                        Some(dst),
                    );
                    self.define(&mut env, &mut stmts, dst, id, offset)?;
                }

                Op::MonitorEnter { src } => {
                    let monitor = self.use_reg(&env, src, insn.offset)?;
                    stmts.push(Stmt::MonitorEnter { monitor, offset });
                }
                Op::MonitorExit { src } => {
                    let monitor = self.use_reg(&env, src, insn.offset)?;
                    stmts.push(Stmt::MonitorExit { monitor, offset });
                }

                Op::CheckCast { reg, type_idx } => {
                    let ty = self.type_sig(type_idx, insn.offset)?;
                    let operand = self.use_reg(&env, reg, insn.offset)?;
                    let id = self
                        .arena
                        .alloc_from_reg(Expr::Cast { ty, operand }, offset, Some(reg));
                    self.define(&mut env, &mut stmts, reg, id, offset)?;
                }
                Op::InstanceOf { dst, src, type_idx } => {
                    let ty = self.type_sig(type_idx, insn.offset)?;
                    let operand = self.use_reg(&env, src, insn.offset)?;
                    let id = self
                        .arena
                        .alloc_from_reg(Expr::InstanceOf { operand, ty }, offset, Some(dst));
                    self.define(&mut env, &mut stmts, dst, id, offset)?;
                }
                Op::ArrayLength { dst, src } => {
                    let array = self.use_reg(&env, src, insn.offset)?;
                    let id = self
                        .arena
                        .alloc_from_reg(Expr::ArrayLength { array }, offset, Some(dst));
                    self.define(&mut env, &mut stmts, dst, id, offset)?;
                }

                Op::NewInstance { dst, type_idx } => {
                    // Emission is deferred to the fusing <init> call.
                    let class = self.type_object(type_idx, insn.offset)?;
                    pending_new.insert(dst, class);
                }
                Op::NewArray { dst, size, type_idx } => {
                    let elem = match self.type_sig(type_idx, insn.offset)? {
                        TypeSignature::Array(inner) => *inner,
                        other => other,
                    };
                    let size = self.use_reg(&env, size, insn.offset)?;
                    let id = self
                        .arena
                        .alloc_from_reg(Expr::NewArray { elem, size }, offset, Some(dst));
                    self.define(&mut env, &mut stmts, dst, id, offset)?;
                }
                Op::FilledNewArray { type_idx, ref args } => {
                    let elem = match self.type_sig(type_idx, insn.offset)? {
                        TypeSignature::Array(inner) => *inner,
                        other => other,
                    };
                    let values = args
                        .iter()
                        .map(|&r| self.use_reg(&env, r, insn.offset))
                        .collect::<Result<Vec<_>, _>>()?;
                    let id = self.arena.alloc(Expr::ArrayInit { elem, values }, offset);
                    if next_is_move_result {
                        pending_result = Some(id);
                    }
                }
                Op::FillArrayData {
                    src,
                    element_width,
                    ref data,
                } => {
                    let target = self.use_reg(&env, src, insn.offset)?;
                    let node = self.resolve_array_node(target, &stmts).ok_or(LiftError::Cfg {
                        offset: insn.offset,
                        reason: "fill-array-data target has no reachable new-array".to_string(),
                    })?;
                    self.attach_array_data(node, element_width, data, offset)?;
                }

                Op::Throw { src } => term = Term::Throw(self.use_reg(&env, src, insn.offset)?),
                Op::Goto { target } => term = Term::Goto(target),
                Op::PackedSwitch { src, ref cases } | Op::SparseSwitch { src, ref cases } => {
                    term = Term::Switch {
                        value: self.use_reg(&env, src, insn.offset)?,
                        cases: cases.clone(),
                    }
                }

                Op::Cmp { kind, dst, a, b } => {
                    let lhs = self.use_reg(&env, a, insn.offset)?;
                    let rhs = self.use_reg(&env, b, insn.offset)?;
                    let id = self
                        .arena
                        .alloc_from_reg(Expr::Cmp { kind, lhs, rhs }, offset, Some(dst));
                    self.define(&mut env, &mut stmts, dst, id, offset)?;
                }

                Op::If { test, a, b, target } => {
                    let lhs = self.use_reg(&env, a, insn.offset)?;
                    let rhs = self.use_reg(&env, b, insn.offset)?;
                    let cond = self.arena.alloc(Expr::Compare { test, lhs, rhs }, offset);
                    term = Term::CondGoto { cond, target };
                }
                Op::IfZ { test, a, target } => {
                    let lhs = self.use_reg(&env, a, insn.offset)?;
                    let zero = if self.is_reference_like(lhs) {
                        self.arena.alloc(Expr::Null, offset)
                    } else {
                        self.arena.alloc(Expr::IntLit(0), offset)
                    };
                    let cond = self.arena.alloc(
                        Expr::Compare {
                            test,
                            lhs,
                            rhs: zero,
                        },
                        offset,
                    );
                    term = Term::CondGoto { cond, target };
                }

                Op::ArrayGet { dst, array, index, .. } => {
                    let array = self.use_reg(&env, array, insn.offset)?;
                    let index = self.use_reg(&env, index, insn.offset)?;
                    let id = self
                        .arena
                        .alloc_from_reg(Expr::ArrayGet { array, index }, offset, Some(dst));
                    self.define(&mut env, &mut stmts, dst, id, offset)?;
                }
                Op::ArrayPut { src, array, index, .. } => {
                    let value = self.use_reg(&env, src, insn.offset)?;
                    let array = self.use_reg(&env, array, insn.offset)?;
                    let index = self.use_reg(&env, index, insn.offset)?;
                    stmts.push(Stmt::Assign {
                        target: LValue::Array { array, index },
                        value,
                        declare: None,
                        offset,
                    });
                }
                Op::InstanceGet {
                    dst,
                    object,
                    field_idx,
                    ..
                } => {
                    let object = self.use_reg(&env, object, insn.offset)?;
                    let f = self.field(field_idx, insn.offset)?;
                    let id = self.arena.alloc_from_reg(
                        Expr::FieldGet {
                            object: Some(object),
                            class: f.0,
                            name: f.1,
                            ty: f.2,
                        },
                        offset,
                        Some(dst),
                    );
                    self.define(&mut env, &mut stmts, dst, id, offset)?;
                }
                Op::InstancePut {
                    src,
                    object,
                    field_idx,
                    ..
                } => {
                    let value = self.use_reg(&env, src, insn.offset)?;
                    let object = self.use_reg(&env, object, insn.offset)?;
                    let f = self.field(field_idx, insn.offset)?;
                    stmts.push(Stmt::Assign {
                        target: LValue::Field {
                            object: Some(object),
                            class: f.0,
                            name: f.1,
                        },
                        value,
                        declare: None,
                        offset,
                    });
                }
                Op::StaticGet { dst, field_idx, .. } => {
                    let f = self.field(field_idx, insn.offset)?;
                    let id = self.arena.alloc_from_reg(
                        Expr::FieldGet {
                            object: None,
                            class: f.0,
                            name: f.1,
                            ty: f.2,
                        },
                        offset,
                        Some(dst),
                    );
                    self.define(&mut env, &mut stmts, dst, id, offset)?;
                }
                Op::StaticPut { src, field_idx, .. } => {
                    let value = self.use_reg(&env, src, insn.offset)?;
                    let f = self.field(field_idx, insn.offset)?;
                    stmts.push(Stmt::Assign {
                        target: LValue::Field {
                            object: None,
                            class: f.0,
                            name: f.1,
                        },
                        value,
                        declare: None,
                        offset,
                    });
                }

                Op::Invoke {
                    kind,
                    method_idx,
                    ref args,
                } => {
                    let mref = self.image.method_ref(method_idx).map_err(|_| LiftError::Cfg {
                        offset: insn.offset,
                        reason: format!("method index {method_idx} unresolvable"),
                    })?;

                    // new-instance + invoke-direct <init> fuse into a
                    // constructor call; the intermediate binding drops.
                    if kind == InvokeKind::Direct && mref.name == "<init>" && !args.is_empty() {
                        if let Some(class) = pending_new.remove(&args[0]) {
                            let ctor_args = self.invoke_args(&env, &mref.sig, &args[1..], insn.offset)?;
                            let id = self.arena.alloc(
                                Expr::NewInstance {
                                    class,
                                    args: ctor_args,
                                },
                                offset,
                            );
                            if next_is_move_result {
                                pending_result = Some(id);
                            } else {
                                self.define(&mut env, &mut stmts, args[0], id, offset)?;
                            }
                            continue;
                        }
                    }

                    let is_static_call = kind == InvokeKind::Static;
                    let (receiver, arg_regs): (Option<ExprId>, &[u16]) = if is_static_call {
                        (None, &args[..])
                    } else {
                        if args.is_empty() {
                            return Err(LiftError::Cfg {
                                offset: insn.offset,
                                reason: "instance invoke without a receiver".to_string(),
                            });
                        }
                        (Some(self.use_reg(&env, args[0], insn.offset)?), &args[1..])
                    };
                    let call_args = self.invoke_args(&env, &mref.sig, arg_regs, insn.offset)?;
                    let returns_value = mref.sig.return_type != TypeSignature::Void;
                    let id = self.arena.alloc(
                        Expr::Invoke {
                            kind,
                            class: mref.class,
                            name: mref.name,
                            sig: mref.sig,
                            receiver,
                            args: call_args,
                        },
                        offset,
                    );
                    if returns_value && next_is_move_result {
                        pending_result = Some(id);
                    } else {
                        stmts.push(Stmt::Expr { expr: id, offset });
                    }
                }
                Op::InvokePolymorphic {
                    method_idx,
                    ref args,
                    ..
                }
                | Op::InvokeCustom {
                    call_site_idx: method_idx,
                    ref args,
                } => {
                    // Rare linkage forms surface as opaque calls.
                    let values = args
                        .iter()
                        .map(|&r| self.use_reg(&env, r, insn.offset))
                        .collect::<Result<Vec<_>, _>>()?;
                    let id = self.arena.alloc(
                        Expr::Invoke {
                            kind: InvokeKind::Static,
                            class: ObjectIdentifier::from_jni_type("Ljava/lang/invoke/MethodHandle;"),
                            name: format!("invoke${method_idx}"),
                            sig: MethodSignature {
                                args: vec![],
                                return_type: TypeSignature::Object(ObjectIdentifier::from_jni_type(
                                    "Ljava/lang/Object;",
                                )),
                            },
                            receiver: None,
                            args: values,
                        },
                        offset,
                    );
                    if next_is_move_result {
                        pending_result = Some(id);
                    } else {
                        stmts.push(Stmt::Expr { expr: id, offset });
                    }
                }

                Op::Unary { op, dst, src } => {
                    let operand = self.use_reg(&env, src, insn.offset)?;
                    let id = self.fold_unary(op, operand, offset, dst);
                    self.define(&mut env, &mut stmts, dst, id, offset)?;
                }
                Op::Binary { op, kind, dst, a, b } => {
                    let lhs = self.use_reg(&env, a, insn.offset)?;
                    let rhs = self.use_reg(&env, b, insn.offset)?;
                    let id = self.fold_binary(op, kind, lhs, rhs, offset, dst);
                    self.define(&mut env, &mut stmts, dst, id, offset)?;
                }
                Op::BinaryLit {
                    op,
                    dst,
                    src,
                    lit,
                    reverse,
                } => {
                    let reg = self.use_reg(&env, src, insn.offset)?;
                    let lit = self.arena.alloc(Expr::IntLit(lit), offset);
                    let (lhs, rhs) = if reverse { (lit, reg) } else { (reg, lit) };
                    let id = self.fold_binary(op, NumKind::Int, lhs, rhs, offset, dst);
                    self.define(&mut env, &mut stmts, dst, id, offset)?;
                }
            }
        }

        if !pending_new.is_empty() {
            warn!(
                "unconsumed new-instance at block {:#06x}; emitting placeholder",
                block_start
            );
            for (reg, class) in pending_new {
                let id = self
                    .arena
                    .alloc(Expr::NewInstance { class, args: vec![] }, block_start as u32);
                self.define(&mut env, &mut stmts, reg, id, block_start as u32)?;
            }
        }

        Ok((stmts, term))
    }

    fn use_reg(&mut self, env: &RegisterFile, reg: u16, offset: usize) -> Result<ExprId, LiftError> {
        env.get(reg).ok_or(LiftError::Cfg {
            offset,
            reason: format!("read of undefined register v{reg}"),
        })
    }

    /// Binds `value` to `reg`: materialized registers get an assignment
    /// statement, block-private ones substitute.
    fn define(
        &mut self,
        env: &mut RegisterFile,
        stmts: &mut Vec<Stmt>,
        reg: u16,
        value: ExprId,
        offset: u32,
    ) -> Result<(), LiftError> {
        if let Some(&lid) = self.reg_local.get(&reg) {
            let declare = if !self.locals[lid.0 as usize].declared {
                self.locals[lid.0 as usize].declared = true;
                let ty = self.locals[lid.0 as usize]
                    .ty
                    .clone()
                    .or_else(|| self.infer_type(value))
                    .unwrap_or(TypeSignature::Object(ObjectIdentifier::from_jni_type(
                        "Ljava/lang/Object;",
                    )));
                self.locals[lid.0 as usize].ty = Some(ty.clone());
                Some(ty)
            } else {
                None
            };
            stmts.push(Stmt::Assign {
                target: LValue::Local(lid),
                value,
                declare,
                offset,
            });
            let node = self.arena.alloc_from_reg(Expr::Local(lid), offset, Some(reg));
            env.set(reg, node);
        } else {
            env.set(reg, value);
        }
        Ok(())
    }

    fn invoke_args(
        &mut self,
        env: &RegisterFile,
        sig: &MethodSignature,
        arg_regs: &[u16],
        offset: usize,
    ) -> Result<Vec<ExprId>, LiftError> {
        // Wide arguments occupy two registers; read only the low one.
        let mut out = Vec::with_capacity(sig.args.len());
        let mut ix = 0usize;
        for ty in &sig.args {
            let reg = *arg_regs.get(ix).ok_or(LiftError::Cfg {
                offset,
                reason: "invoke argument registers shorter than prototype".to_string(),
            })?;
            out.push(env.get(reg).ok_or(LiftError::Cfg {
                offset,
                reason: format!("read of undefined register v{reg}"),
            })?);
            ix += if ty.is_wide() { 2 } else { 1 };
        }
        Ok(out)
    }

    fn type_sig(&self, idx: u32, offset: usize) -> Result<TypeSignature, LiftError> {
        self.image
            .type_desc(idx)
            .map(TypeSignature::from_jni)
            .map_err(|_| LiftError::Cfg {
                offset,
                reason: format!("type index {idx} unresolvable"),
            })
    }

    fn type_object(&self, idx: u32, offset: usize) -> Result<ObjectIdentifier, LiftError> {
        self.image.type_object(idx).map_err(|_| LiftError::Cfg {
            offset,
            reason: format!("type index {idx} unresolvable"),
        })
    }

    fn field(
        &self,
        idx: u32,
        offset: usize,
    ) -> Result<(ObjectIdentifier, String, TypeSignature), LiftError> {
        let f = self.image.field_ref(idx).map_err(|_| LiftError::Cfg {
            offset,
            reason: format!("field index {idx} unresolvable"),
        })?;
        Ok((f.class, f.name, f.ty))
    }

    /// Finds the `new-array` node behind `id`: either directly, or through
    /// the latest assignment when the register was materialized as a local.
    fn resolve_array_node(&self, id: ExprId, stmts: &[Stmt]) -> Option<ExprId> {
        match &self.arena[id] {
            Expr::NewArray { .. } => Some(id),
            Expr::Local(lid) => stmts.iter().rev().find_map(|s| match s {
                Stmt::Assign {
                    target: LValue::Local(l),
                    value,
                    ..
                } if l == lid && matches!(self.arena[*value], Expr::NewArray { .. }) => {
                    Some(*value)
                }
                _ => None,
            }),
            _ => None,
        }
    }

    /// fill-array-data rewrites the register's most recent new-array node
    /// into an array initializer.
    fn attach_array_data(
        &mut self,
        target: ExprId,
        element_width: u16,
        data: &[u8],
        offset: u32,
    ) -> Result<(), LiftError> {
        let elem = match &self.arena[target] {
            Expr::NewArray { elem, .. } => elem.clone(),
            _ => unreachable!("resolved to a new-array node"),
        };

        let mut values = Vec::new();
        let width = element_width as usize;
        for chunk in data.chunks(width.max(1)) {
            let mut raw: u64 = 0;
            for (i, &b) in chunk.iter().enumerate() {
                raw |= u64::from(b) << (8 * i);
            }
            let expr = match width {
                8 => Expr::LongLit(raw as i64),
                _ => {
                    let shift = 64 - 8 * width as u32;
                    Expr::IntLit((((raw << shift) as i64) >> shift) as i32)
                }
            };
            values.push(self.arena.alloc(expr, offset));
        }
        self.arena[target] = Expr::ArrayInit { elem, values };
        Ok(())
    }

    fn is_reference_like(&self, id: ExprId) -> bool {
        matches!(
            self.infer_type(id),
            Some(TypeSignature::Object(_)) | Some(TypeSignature::Array(_))
        )
    }

    fn infer_type(&self, id: ExprId) -> Option<TypeSignature> {
        crate::lift::expr::infer_type(self.arena, &self.locals, id)
    }

    fn fold_unary(&mut self, op: UnaryOp, operand: ExprId, offset: u32, dst: u16) -> ExprId {
        if let Expr::IntLit(v) = &self.arena[operand] {
            let v = *v;
            let folded = match op {
                UnaryOp::NegInt => Some(Expr::IntLit(v.wrapping_neg())),
                UnaryOp::NotInt => Some(Expr::IntLit(!v)),
                UnaryOp::IntToLong => Some(Expr::LongLit(i64::from(v))),
                _ => None,
            };
            if let Some(expr) = folded {
                return self.arena.alloc_from_reg(expr, offset, Some(dst));
            }
        }
        self.arena
            .alloc_from_reg(Expr::Unary { op, operand }, offset, Some(dst))
    }

    /// Bottom-up constant folding and identity collapsing at node-build
    /// time: literal-literal integer arithmetic folds, `x+0`, `x*1`,
    /// `x|0`, `x&-1`, `x^0` and zero shifts collapse to `x`.
    fn fold_binary(
        &mut self,
        op: Arith,
        kind: NumKind,
        lhs: ExprId,
        rhs: ExprId,
        offset: u32,
        dst: u16,
    ) -> ExprId {
        if kind == NumKind::Int {
            if let (Expr::IntLit(a), Expr::IntLit(b)) = (&self.arena[lhs], &self.arena[rhs]) {
                let (a, b) = (*a, *b);
                let folded = match op {
                    Arith::Add => Some(a.wrapping_add(b)),
                    Arith::Sub => Some(a.wrapping_sub(b)),
                    Arith::Mul => Some(a.wrapping_mul(b)),
                    Arith::Div if b != 0 => Some(a.wrapping_div(b)),
                    Arith::Rem if b != 0 => Some(a.wrapping_rem(b)),
                    Arith::And => Some(a & b),
                    Arith::Or => Some(a | b),
                    Arith::Xor => Some(a ^ b),
                    Arith::Shl => Some(a.wrapping_shl(b as u32 & 31)),
                    Arith::Shr => Some(a.wrapping_shr(b as u32 & 31)),
                    Arith::Ushr => Some(((a as u32) >> (b as u32 & 31)) as i32),
                    _ => None,
                };
                if let Some(v) = folded {
                    return self.arena.alloc_from_reg(Expr::IntLit(v), offset, Some(dst));
                }
            }
            if let Expr::IntLit(b) = &self.arena[rhs] {
                let b = *b;
                let identity = matches!(
                    (op, b),
                    (Arith::Add, 0)
                        | (Arith::Sub, 0)
                        | (Arith::Mul, 1)
                        | (Arith::Or, 0)
                        | (Arith::Xor, 0)
                        | (Arith::And, -1)
                        | (Arith::Shl, 0)
                        | (Arith::Shr, 0)
                        | (Arith::Ushr, 0)
                );
                if identity {
                    return lhs;
                }
            }
        }
        if kind == NumKind::Long {
            if let (Expr::LongLit(a), Expr::LongLit(b)) = (&self.arena[lhs], &self.arena[rhs]) {
                let (a, b) = (*a, *b);
                let folded = match op {
                    Arith::Add => Some(a.wrapping_add(b)),
                    Arith::Sub => Some(a.wrapping_sub(b)),
                    Arith::Mul => Some(a.wrapping_mul(b)),
                    Arith::And => Some(a & b),
                    Arith::Or => Some(a | b),
                    Arith::Xor => Some(a ^ b),
                    _ => None,
                };
                if let Some(v) = folded {
                    return self
                        .arena
                        .alloc_from_reg(Expr::LongLit(v), offset, Some(dst));
                }
            }
        }
        self.arena
            .alloc_from_reg(Expr::Binary { op, kind, lhs, rhs }, offset, Some(dst))
    }

    /// Wraps try ranges into `Stmt::Try`, pulling handler spans out of the
    /// linear list as catch bodies.
    fn wrap_tries(&mut self, stmts: Vec<Stmt>) -> Result<Vec<Stmt>, LiftError> {
        if self.code.tries.is_empty() {
            return Ok(stmts);
        }

        // Handler spans end at the next handler start.
        let mut handler_starts: Vec<u32> = self.catch_vars.keys().map(|&o| o as u32).collect();
        handler_starts.sort_unstable();

        let mut out = stmts;
        // Innermost-first keeps nested tries intact; overlapping ranges
        // come out as sequential try blocks, reported as-is.
        let mut tries = self.code.tries.clone();
        tries.sort_by_key(|t| t.insn_count);

        for t in tries {
            let start = t.start_addr;
            let end = t.start_addr + u32::from(t.insn_count);
            let handler = self.code.handlers[t.handler_index].clone();

            let mut catches = Vec::new();
            for (type_idx, addr) in &handler.catches {
                let exception = self
                    .image
                    .type_object(*type_idx)
                    .map_err(|_| LiftError::Cfg {
                        offset: *addr as usize,
                        reason: format!("catch type index {type_idx} unresolvable"),
                    })?;
                catches.push((Some(exception), *addr));
            }
            if let Some(addr) = handler.catch_all {
                catches.push((None, addr));
            }

            let mut arms = Vec::new();
            for (exception, addr) in catches {
                let body = extract_handler_span(&mut out, addr, &handler_starts);
                let var = self.catch_vars[&(addr as usize)];
                arms.push(CatchArm {
                    exception,
                    var,
                    body,
                });
            }

            wrap_try_range(&mut out, start, end, arms);
        }
        Ok(out)
    }
}

pub(crate) fn stmt_offset(stmt: &Stmt) -> Option<u32> {
    match stmt {
        Stmt::Label(l) => Some(*l),
        Stmt::Expr { offset, .. }
        | Stmt::Assign { offset, .. }
        | Stmt::If { offset, .. }
        | Stmt::While { offset, .. }
        | Stmt::DoWhile { offset, .. }
        | Stmt::Switch { offset, .. }
        | Stmt::Goto { offset, .. }
        | Stmt::CondGoto { offset, .. }
        | Stmt::Return { offset, .. }
        | Stmt::Throw { offset, .. }
        | Stmt::Synchronized { offset, .. }
        | Stmt::MonitorEnter { offset, .. }
        | Stmt::MonitorExit { offset, .. } => Some(*offset),
        Stmt::Try { .. } | Stmt::Comment(_) => None,
    }
}

/// Cuts the contiguous run starting at the handler's label out of `stmts`.
pub(crate) fn extract_handler_span(
    stmts: &mut Vec<Stmt>,
    addr: u32,
    handler_starts: &[u32],
) -> Vec<Stmt> {
    let Some(start_ix) = stmts
        .iter()
        .position(|s| matches!(s, Stmt::Label(l) if *l == addr))
    else {
        return vec![];
    };
    let mut end_ix = stmts.len();
    for (ix, s) in stmts.iter().enumerate().skip(start_ix + 1) {
        if let Stmt::Label(l) = s {
            if handler_starts.contains(l) {
                end_ix = ix;
                break;
            }
        }
    }
    stmts.drain(start_ix..end_ix).collect()
}

/// Wraps the statements whose offsets fall in `[start, end)` into a
/// `Stmt::Try`, searching nested try bodies when the range was already
/// swallowed by an inner wrap.
pub(crate) fn wrap_try_range(stmts: &mut Vec<Stmt>, start: u32, end: u32, arms: Vec<CatchArm>) {
    let in_range = |s: &Stmt| stmt_offset(s).map(|o| o >= start && o < end).unwrap_or(false);
    let first = stmts.iter().position(in_range);
    if let Some(first) = first {
        let mut last = first;
        for (ix, s) in stmts.iter().enumerate().skip(first) {
            if in_range(s) || matches!(s, Stmt::Try { .. } | Stmt::Comment(_)) {
                last = ix;
            } else {
                break;
            }
        }
        let body: Vec<Stmt> = stmts.drain(first..=last).collect();
        stmts.insert(
            first,
            Stmt::Try {
                body,
                catches: arms,
            },
        );
        return;
    }
    // Range not at this level: recurse into existing try bodies.
    for s in stmts.iter_mut() {
        if let Stmt::Try { body, .. } = s {
            if body.iter().any(in_range) {
                wrap_try_range(body, start, end, arms);
                return;
            }
        }
    }
}

/// Recognizes the well-nested monitor shape (`monitor-enter` immediately
/// guarding a try whose catch-all rethrows after `monitor-exit`) and folds
/// it into a `synchronized` region; anything else keeps raw enter/exit
/// statements.
pub(crate) fn pair_monitors(stmts: &mut Vec<Stmt>, arena: &ExprArena) {
    let mut ix = 0;
    while ix < stmts.len() {
        let enter = match &stmts[ix] {
            Stmt::MonitorEnter { monitor, offset } => Some((*monitor, *offset)),
            _ => None,
        };
        if let Some((monitor, offset)) = enter {
            let well_nested = matches!(stmts.get(ix + 1), Some(Stmt::Try { catches, .. })
                if catches.len() == 1
                    && catches[0].exception.is_none()
                    && catch_is_exit_rethrow(&catches[0].body));
            if well_nested {
                let Stmt::Try { mut body, .. } = stmts.remove(ix + 1) else {
                    unreachable!("matched above");
                };
                strip_monitor_exits(&mut body, arena, monitor);
                stmts[ix] = Stmt::Synchronized {
                    monitor,
                    body,
                    offset,
                };
            }
        }
        // Recurse into nested bodies.
        match &mut stmts[ix] {
            Stmt::Try { body, catches } => {
                pair_monitors(body, arena);
                for c in catches {
                    pair_monitors(&mut c.body, arena);
                }
            }
            Stmt::If {
                then_body,
                else_body,
                ..
            } => {
                pair_monitors(then_body, arena);
                pair_monitors(else_body, arena);
            }
            Stmt::While { body, .. }
            | Stmt::DoWhile { body, .. }
            | Stmt::Synchronized { body, .. } => pair_monitors(body, arena),
            _ => {}
        }
        ix += 1;
    }
}

fn catch_is_exit_rethrow(body: &[Stmt]) -> bool {
    let significant: Vec<&Stmt> = body
        .iter()
        .filter(|s| !matches!(s, Stmt::Label(_) | Stmt::Comment(_) | Stmt::Assign { .. }))
        .collect();
    matches!(
        significant.as_slice(),
        [Stmt::MonitorExit { .. }, Stmt::Throw { .. }]
    )
}

fn strip_monitor_exits(body: &mut Vec<Stmt>, _arena: &ExprArena, _monitor: ExprId) {
    body.retain(|s| !matches!(s, Stmt::MonitorExit { .. }));
}

fn count_label_refs(stmts: &[Stmt]) -> HashMap<u32, usize> {
    let mut refs = Vec::new();
    for s in stmts {
        s.collect_label_refs(&mut refs);
    }
    let mut counts = HashMap::new();
    for l in refs {
        *counts.entry(l).or_insert(0) += 1;
    }
    counts
}

fn negate_cond(arena: &mut ExprArena, cond: ExprId, offset: u32) -> ExprId {
    if let Expr::Compare { test, lhs, rhs } = &arena[cond] {
        let (test, lhs, rhs) = (test.negate(), *lhs, *rhs);
        arena.alloc(Expr::Compare { test, lhs, rhs }, offset)
    } else {
        cond
    }
}

fn segment_is_foldable(segment: &[Stmt]) -> bool {
    !segment.iter().any(|s| matches!(s, Stmt::Label(_)))
}

/// Folds goto patterns into structured statements until a fixpoint:
/// if / if-else, while (header conditional exiting over the body with a
/// back-edge goto) and do-while (trailing conditional back to the header).
pub(crate) fn fold_patterns(mut stmts: Vec<Stmt>, arena: &mut ExprArena) -> Vec<Stmt> {
    loop {
        let refs = count_label_refs(&stmts);
        let mut changed = false;

        'scan: for ix in 0..stmts.len() {
            // while: Label(L0); CondGoto(c, Lend); body...; Goto L0; Label(Lend)
            if let (Some(Stmt::Label(l0)), Some(Stmt::CondGoto { cond, label, offset })) =
                (stmts.get(ix), stmts.get(ix + 1))
            {
                let (l0, cond, lend, offset) = (*l0, *cond, *label, *offset);
                if let Some(goto_ix) = (ix + 2..stmts.len()).find(|&j| {
                    matches!(stmts.get(j), Some(Stmt::Goto { label, .. }) if *label == l0)
                }) {
                    let closes = matches!(stmts.get(goto_ix + 1), Some(Stmt::Label(l)) if *l == lend);
                    if closes
                        && refs.get(&l0) == Some(&1)
                        && segment_is_foldable(&stmts[ix + 2..goto_ix])
                    {
                        let mut body: Vec<Stmt> = stmts.drain(ix + 2..=goto_ix).collect();
                        body.pop(); // the back-edge goto
                        let body = fold_patterns(body, arena);
                        let cond = negate_cond(arena, cond, offset);
                        stmts[ix + 1] = Stmt::While { cond, body, offset };
                        // Label(L0) at ix stays until cleanup.
                        changed = true;
                        break 'scan;
                    }
                }
            }

            // do-while: Label(L0); body...; CondGoto(c, L0)
            if let Some(Stmt::Label(l0)) = stmts.get(ix) {
                let l0 = *l0;
                if let Some(j) = (ix + 1..stmts.len()).find(|&j| {
                    matches!(stmts.get(j), Some(Stmt::CondGoto { label, .. }) if *label == l0)
                }) {
                    if refs.get(&l0) == Some(&1) && segment_is_foldable(&stmts[ix + 1..j]) {
                        let (cond, offset) = match &stmts[j] {
                            Stmt::CondGoto { cond, offset, .. } => (*cond, *offset),
                            _ => unreachable!("matched above"),
                        };
                        let body: Vec<Stmt> = stmts.drain(ix + 1..j).collect();
                        let body = fold_patterns(body, arena);
                        stmts[ix + 1] = Stmt::DoWhile { body, cond, offset };
                        changed = true;
                        break 'scan;
                    }
                }
            }

            // if / if-else: CondGoto(c, L1); then...; [Goto L2;] Label(L1); [else...; Label(L2)]
            if let Some(Stmt::CondGoto { cond, label, offset }) = stmts.get(ix) {
                let (cond, l1, offset) = (*cond, *label, *offset);
                let Some(l1_ix) = (ix + 1..stmts.len()).find(|&j| {
                    matches!(stmts.get(j), Some(Stmt::Label(l)) if *l == l1)
                }) else {
                    continue;
                };
                if refs.get(&l1) != Some(&1) || !segment_is_foldable(&stmts[ix + 1..l1_ix]) {
                    continue;
                }

                let with_else = if l1_ix > ix + 1 {
                    match stmts.get(l1_ix - 1) {
                        Some(Stmt::Goto { label: l2, .. }) => Some(*l2),
                        _ => None,
                    }
                } else {
                    None
                };

                if let Some(l2) = with_else {
                    if let Some(l2_ix) = (l1_ix + 1..stmts.len()).find(|&j| {
                        matches!(stmts.get(j), Some(Stmt::Label(l)) if *l == l2)
                    }) {
                        if refs.get(&l2) == Some(&1)
                            && segment_is_foldable(&stmts[l1_ix + 1..l2_ix])
                        {
                            let else_body: Vec<Stmt> = stmts.drain(l1_ix + 1..l2_ix).collect();
                            // Drop the Goto L2 and Label(L1).
                            let mut then_body: Vec<Stmt> = stmts.drain(ix + 1..=l1_ix).collect();
                            then_body.pop(); // Label(L1)
                            then_body.pop(); // Goto L2
                            let cond = negate_cond(arena, cond, offset);
                            stmts[ix] = Stmt::If {
                                cond,
                                then_body: fold_patterns(then_body, arena),
                                else_body: fold_patterns(else_body, arena),
                                offset,
                            };
                            changed = true;
                            break 'scan;
                        }
                    }
                }

                // plain if
                let mut then_body: Vec<Stmt> = stmts.drain(ix + 1..=l1_ix).collect();
                then_body.pop(); // Label(L1)
                let cond = negate_cond(arena, cond, offset);
                stmts[ix] = Stmt::If {
                    cond,
                    then_body: fold_patterns(then_body, arena),
                    else_body: vec![],
                    offset,
                };
                changed = true;
                break 'scan;
            }
        }

        if !changed {
            return stmts;
        }
    }
}

/// Drops labels nothing jumps to, recursively.
pub(crate) fn strip_unused_labels(stmts: &mut Vec<Stmt>) {
    let refs = count_label_refs(stmts);
    strip_labels_inner(stmts, &refs);
}

fn strip_labels_inner(stmts: &mut Vec<Stmt>, refs: &HashMap<u32, usize>) {
    stmts.retain(|s| match s {
        Stmt::Label(l) => refs.contains_key(l),
        _ => true,
    });
    for s in stmts.iter_mut() {
        match s {
            Stmt::If {
                then_body,
                else_body,
                ..
            } => {
                strip_labels_inner(then_body, refs);
                strip_labels_inner(else_body, refs);
            }
            Stmt::While { body, .. }
            | Stmt::DoWhile { body, .. }
            | Stmt::Synchronized { body, .. } => strip_labels_inner(body, refs),
            Stmt::Try { body, catches } => {
                strip_labels_inner(body, refs);
                for c in catches {
                    strip_labels_inner(&mut c.body, refs);
                }
            }
            _ => {}
        }
    }
}
