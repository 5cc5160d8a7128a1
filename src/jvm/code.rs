//! JVM bytecode lifter: an operand-stack simulation producing the same
//! expression/statement tree as the Dalvik pipeline, so structuring and
//! source writing are shared.
//!
//! Values that would cross a jump on the operand stack (ternaries mostly)
//! are spilled to synthetic `stack{n}` locals at the branch site and
//! reloaded at the label, which keeps every join consistent without a full
//! data-flow pass.

use std::collections::{HashMap, HashSet};

use crate::arena::{ExprArena, ExprId};
use crate::dex::insns::{Arith, CmpKind, InvokeKind, NumKind, TestKind, UnaryOp};
use crate::error::LiftError;
use crate::jvm::class_file::{ClassFile, CodeAttribute, Constant, MemberInfo};
use crate::lift::expr::{
    infer_type, CatchArm, Expr, LValue, LocalId, LocalInfo, Stmt, SwitchArm,
};
use crate::lift::lifter::{
    extract_handler_span, fold_patterns, pair_monitors, strip_unused_labels, wrap_try_range,
    LiftedBody,
};
use crate::types::{MethodSignature, ObjectIdentifier, TypeSignature};

struct JvmLifter<'a> {
    class: &'a ClassFile,
    code: &'a [u8],
    arena: &'a mut ExprArena,
    locals: Vec<LocalInfo>,
    slot_local: HashMap<u16, LocalId>,
    stack: Vec<ExprId>,
    stmts: Vec<Stmt>,
    /// Uninitialized `new` results awaiting their `<init>` call.
    pending_new: HashSet<u32>,
    /// Spill locals by stack depth.
    spill_locals: HashMap<usize, LocalId>,
    /// Stack depth carried into a label by jumps that spilled.
    label_depth: HashMap<u32, usize>,
    labels: HashSet<u32>,
    handler_vars: HashMap<u32, LocalId>,
}

pub fn lift_jvm_method(
    class: &ClassFile,
    method: &MemberInfo,
    code: &CodeAttribute,
    arena: &mut ExprArena,
) -> Result<LiftedBody, LiftError> {
    let descriptor = class
        .utf8(method.descriptor_index)
        .map_err(|e| LiftError::Cfg {
            offset: 0,
            reason: e.to_string(),
        })?;
    let sig = MethodSignature::from_jni(descriptor);
    let is_static = method.access_flags & 0x8 != 0;

    let mut lifter = JvmLifter {
        class,
        code: &code.code,
        arena,
        locals: Vec::new(),
        slot_local: HashMap::new(),
        stack: Vec::new(),
        stmts: Vec::new(),
        pending_new: HashSet::new(),
        spill_locals: HashMap::new(),
        label_depth: HashMap::new(),
        labels: HashSet::new(),
        handler_vars: HashMap::new(),
    };
    lifter.seed_parameters(&sig, is_static);
    lifter.scan_labels(code)?;
    lifter.seed_handler_vars(code);
    lifter.simulate()?;

    let mut stmts = std::mem::take(&mut lifter.stmts);
    stmts = lifter.wrap_exceptions(stmts, code)?;
    pair_monitors(&mut stmts, lifter.arena);
    strip_unused_labels(&mut stmts);
    let mut stmts = fold_patterns(stmts, lifter.arena);
    strip_unused_labels(&mut stmts);
    if sig.return_type == TypeSignature::Void {
        if let Some(Stmt::Return { value: None, .. }) = stmts.last() {
            stmts.pop();
        }
    }
    Ok(LiftedBody {
        stmts,
        locals: lifter.locals,
    })
}

impl<'a> JvmLifter<'a> {
    fn new_local(&mut self, name: String, ty: Option<TypeSignature>, declared: bool) -> LocalId {
        let id = LocalId(self.locals.len() as u32);
        self.locals.push(LocalInfo { name, ty, declared });
        id
    }

    fn seed_parameters(&mut self, sig: &MethodSignature, is_static: bool) {
        let mut slot = 0u16;
        let mut position = 0u32;
        if !is_static {
            let id = self.new_local("this".to_string(), None, true);
            self.slot_local.insert(slot, id);
            slot += 1;
            position = 1;
        }
        for ty in &sig.args {
            let id = self.new_local(format!("p{position}"), Some(ty.clone()), true);
            self.slot_local.insert(slot, id);
            slot += if ty.is_wide() { 2 } else { 1 };
            position += 1;
        }
    }

    fn seed_handler_vars(&mut self, code: &CodeAttribute) {
        let mut pcs: Vec<u32> = code.exceptions.iter().map(|e| u32::from(e.handler_pc)).collect();
        pcs.sort_unstable();
        pcs.dedup();
        for (i, pc) in pcs.into_iter().enumerate() {
            let id = self.new_local(format!("ex{i}"), None, true);
            self.handler_vars.insert(pc, id);
            self.labels.insert(pc);
        }
    }

    fn u8_at(&self, pc: usize) -> Result<u8, LiftError> {
        self.code
            .get(pc)
            .copied()
            .ok_or(LiftError::TruncatedCode { offset: pc })
    }

    fn u16_at(&self, pc: usize) -> Result<u16, LiftError> {
        Ok((u16::from(self.u8_at(pc)?) << 8) | u16::from(self.u8_at(pc + 1)?))
    }

    fn i16_at(&self, pc: usize) -> Result<i16, LiftError> {
        Ok(self.u16_at(pc)? as i16)
    }

    fn i32_at(&self, pc: usize) -> Result<i32, LiftError> {
        Ok(((self.u16_at(pc)? as i32) << 16) | i32::from(self.u16_at(pc + 2)?))
    }

    /// Width and branch targets of the instruction at `pc`.
    fn step(&self, pc: usize) -> Result<(usize, Vec<u32>), LiftError> {
        let op = self.u8_at(pc)?;
        let rel16 = |l: &Self| -> Result<u32, LiftError> {
            Ok((pc as i64 + i64::from(l.i16_at(pc + 1)?)) as u32)
        };
        Ok(match op {
            0x00..=0x0f | 0x1a..=0x35 | 0x3b..=0x83 | 0x85..=0x98 | 0xac..=0xb1 | 0xbe | 0xbf
            | 0xc2 | 0xc3 => (1, vec![]),
            0x10 | 0x12 | 0xbc => (2, vec![]),
            0x15..=0x19 | 0x36..=0x3a | 0xa9 => (2, vec![]),
            0x11 | 0x13 | 0x14 | 0xb2..=0xb8 | 0xbb | 0xbd | 0xc0 | 0xc1 => (3, vec![]),
            0x84 => (3, vec![]),
            0x99..=0xa8 | 0xc6 | 0xc7 => (3, vec![rel16(self)?]),
            0xb9 | 0xba => (5, vec![]),
            0xc5 => (4, vec![]),
            0xc8 | 0xc9 => (
                5,
                vec![(pc as i64 + i64::from(self.i32_at(pc + 1)?)) as u32],
            ),
            0xc4 => {
                // wide: doubles the index width of the modified op
                let inner = self.u8_at(pc + 1)?;
                if inner == 0x84 {
                    (6, vec![])
                } else {
                    (4, vec![])
                }
            }
            0xaa => {
                let pad = (4 - ((pc + 1) % 4)) % 4;
                let base = pc + 1 + pad;
                let default = (pc as i64 + i64::from(self.i32_at(base)?)) as u32;
                let low = self.i32_at(base + 4)?;
                let high = self.i32_at(base + 8)?;
                let n = (i64::from(high) - i64::from(low) + 1).max(0) as usize;
                let mut targets = vec![default];
                for i in 0..n {
                    targets.push((pc as i64 + i64::from(self.i32_at(base + 12 + i * 4)?)) as u32);
                }
                (1 + pad + 12 + n * 4, targets)
            }
            0xab => {
                let pad = (4 - ((pc + 1) % 4)) % 4;
                let base = pc + 1 + pad;
                let default = (pc as i64 + i64::from(self.i32_at(base)?)) as u32;
                let npairs = self.i32_at(base + 4)?.max(0) as usize;
                let mut targets = vec![default];
                for i in 0..npairs {
                    targets.push((pc as i64 + i64::from(self.i32_at(base + 8 + i * 8 + 4)?)) as u32);
                }
                (1 + pad + 8 + npairs * 8, targets)
            }
            other => {
                return Err(LiftError::UnknownOpcode {
                    opcode: u16::from(other),
                    offset: pc,
                })
            }
        })
    }

    fn scan_labels(&mut self, code: &CodeAttribute) -> Result<(), LiftError> {
        let mut pc = 0usize;
        while pc < self.code.len() {
            let (len, targets) = self.step(pc)?;
            self.labels.extend(targets);
            pc += len;
        }
        for e in &code.exceptions {
            self.labels.insert(u32::from(e.start_pc));
        }
        Ok(())
    }

    fn slot(&mut self, slot: u16) -> LocalId {
        if let Some(&id) = self.slot_local.get(&slot) {
            return id;
        }
        let id = self.new_local(format!("v{slot}"), None, false);
        self.slot_local.insert(slot, id);
        id
    }

    fn push(&mut self, expr: Expr, pc: usize) -> ExprId {
        let id = self.arena.alloc(expr, pc as u32);
        self.stack.push(id);
        id
    }

    fn pop(&mut self, pc: usize) -> Result<ExprId, LiftError> {
        self.stack.pop().ok_or(LiftError::Cfg {
            offset: pc,
            reason: "operand stack underflow".to_string(),
        })
    }

    fn is_wide_value(&self, id: ExprId) -> bool {
        matches!(
            infer_type(self.arena, &self.locals, id),
            Some(TypeSignature::Long) | Some(TypeSignature::Double)
        )
    }

    fn local_expr(&mut self, id: LocalId, pc: usize) -> ExprId {
        self.arena.alloc(Expr::Local(id), pc as u32)
    }

    /// Stores through to a slot local, declaring on first write.
    fn store_slot(&mut self, slot: u16, value: ExprId, pc: usize) {
        let lid = self.slot(slot);
        let declare = if !self.locals[lid.0 as usize].declared {
            self.locals[lid.0 as usize].declared = true;
            let ty = self.locals[lid.0 as usize]
                .ty
                .clone()
                .or_else(|| infer_type(self.arena, &self.locals, value))
                .unwrap_or(TypeSignature::Object(ObjectIdentifier::from_jni_type(
                    "Ljava/lang/Object;",
                )));
            self.locals[lid.0 as usize].ty = Some(ty.clone());
            Some(ty)
        } else {
            None
        };
        self.stmts.push(Stmt::Assign {
            target: LValue::Local(lid),
            value,
            declare,
            offset: pc as u32,
        });
    }

    /// Spills the operand stack to `stack{n}` locals before a jump and
    /// records the depth at the target.
    fn spill_for_jump(&mut self, targets: &[u32], pc: usize) {
        if self.stack.is_empty() {
            return;
        }
        let depth = self.stack.len();
        for t in targets {
            self.label_depth.insert(*t, depth);
        }
        let entries: Vec<ExprId> = self.stack.drain(..).collect();
        for (i, value) in entries.into_iter().enumerate() {
            let lid = self.spill_local(i, value);
            self.stmts.push(Stmt::Assign {
                target: LValue::Local(lid),
                value,
                declare: None,
                offset: pc as u32,
            });
            let reload = self.local_expr(lid, pc);
            self.stack.push(reload);
        }
    }

    fn spill_local(&mut self, depth: usize, sample: ExprId) -> LocalId {
        if let Some(&id) = self.spill_locals.get(&depth) {
            return id;
        }
        let ty = infer_type(self.arena, &self.locals, sample);
        let id = self.new_local(format!("stack{depth}"), ty, true);
        self.spill_locals.insert(depth, id);
        id
    }

    fn member(&self, index: u16, pc: usize) -> Result<(ObjectIdentifier, String, String), LiftError> {
        let (class, name, desc) = self.class.member_ref(index).map_err(|e| LiftError::Cfg {
            offset: pc,
            reason: e.to_string(),
        })?;
        Ok((
            ObjectIdentifier::from_jni_type(&format!("L{class};")),
            name,
            desc,
        ))
    }

    fn class_at(&self, index: u16, pc: usize) -> Result<ObjectIdentifier, LiftError> {
        let name = self.class.class_name(index).map_err(|e| LiftError::Cfg {
            offset: pc,
            reason: e.to_string(),
        })?;
        // Array classes appear verbatim in the pool ("[I", "[Ljava/lang/String;").
        if name.starts_with('[') {
            Ok(ObjectIdentifier::from_jni_type(name))
        } else {
            Ok(ObjectIdentifier::from_jni_type(&format!("L{name};")))
        }
    }

    fn simulate(&mut self) -> Result<(), LiftError> {
        let mut pc = 0usize;
        while pc < self.code.len() {
            if self.labels.contains(&(pc as u32)) {
                // Falling into a label: reconcile the stack through the
                // spill locals, exactly like the jumping paths do.
                let depth_in = self.label_depth.get(&(pc as u32)).copied().unwrap_or(0);
                if !self.stack.is_empty() {
                    let targets = [pc as u32];
                    self.spill_for_jump(&targets, pc);
                }
                self.stmts.push(Stmt::Label(pc as u32));
                if let Some(&var) = self.handler_vars.get(&(pc as u32)) {
                    self.stack.clear();
                    let e = self.local_expr(var, pc);
                    self.stack.push(e);
                } else if self.stack.is_empty() && depth_in > 0 {
                    for i in 0..depth_in {
                        if let Some(&lid) = self.spill_locals.get(&i) {
                            let e = self.local_expr(lid, pc);
                            self.stack.push(e);
                        }
                    }
                }
            }

            let (len, _) = self.step(pc)?;
            self.exec(pc)?;
            pc += len;
        }
        Ok(())
    }

    fn exec(&mut self, pc: usize) -> Result<(), LiftError> {
        let op = self.u8_at(pc)?;
        match op {
            0x00 => {} // nop
            0x01 => {
                self.push(Expr::Null, pc);
            }
            0x02..=0x08 => {
                self.push(Expr::IntLit(i32::from(op) - 3), pc);
            }
            0x09 | 0x0a => {
                self.push(Expr::LongLit(i64::from(op) - 9), pc);
            }
            0x0b..=0x0d => {
                self.push(Expr::FloatLit((i32::from(op) - 0x0b) as f32), pc);
            }
            0x0e | 0x0f => {
                self.push(Expr::DoubleLit((i32::from(op) - 0x0e) as f64), pc);
            }
            0x10 => {
                let v = self.u8_at(pc + 1)? as i8;
                self.push(Expr::IntLit(i32::from(v)), pc);
            }
            0x11 => {
                let v = self.i16_at(pc + 1)?;
                self.push(Expr::IntLit(i32::from(v)), pc);
            }
            0x12 | 0x13 | 0x14 => {
                let index = if op == 0x12 {
                    u16::from(self.u8_at(pc + 1)?)
                } else {
                    self.u16_at(pc + 1)?
                };
                self.load_constant(index, pc)?;
            }

            0x15..=0x19 => {
                let slot = u16::from(self.u8_at(pc + 1)?);
                let lid = self.slot(slot);
                let e = self.local_expr(lid, pc);
                self.stack.push(e);
            }
            0x1a..=0x2d => {
                let slot = u16::from((op - 0x1a) % 4);
                let lid = self.slot(slot);
                let e = self.local_expr(lid, pc);
                self.stack.push(e);
            }

            0x2e..=0x35 => {
                let index = self.pop(pc)?;
                let array = self.pop(pc)?;
                self.push(Expr::ArrayGet { array, index }, pc);
            }

            0x36..=0x3a => {
                let slot = u16::from(self.u8_at(pc + 1)?);
                let value = self.pop(pc)?;
                self.store_slot(slot, value, pc);
            }
            0x3b..=0x4e => {
                let slot = u16::from((op - 0x3b) % 4);
                let value = self.pop(pc)?;
                self.store_slot(slot, value, pc);
            }

            0x4f..=0x56 => {
                let value = self.pop(pc)?;
                let index = self.pop(pc)?;
                let array = self.pop(pc)?;
                self.stmts.push(Stmt::Assign {
                    target: LValue::Array { array, index },
                    value,
                    declare: None,
                    offset: pc as u32,
                });
            }

            0x57 => {
                // pop: a discarded call or constructor is still a statement
                let top = self.pop(pc)?;
                if matches!(
                    self.arena[top],
                    Expr::Invoke { .. } | Expr::NewInstance { .. }
                ) {
                    self.stmts.push(Stmt::Expr {
                        expr: top,
                        offset: pc as u32,
                    });
                }
            }
            0x58 => {
                let top = self.pop(pc)?;
                if matches!(
                    self.arena[top],
                    Expr::Invoke { .. } | Expr::NewInstance { .. }
                ) {
                    self.stmts.push(Stmt::Expr {
                        expr: top,
                        offset: pc as u32,
                    });
                } else if !self.is_wide_value(top) {
                    let _ = self.pop(pc)?;
                }
            }
            0x59 => {
                let top = *self.stack.last().ok_or(LiftError::Cfg {
                    offset: pc,
                    reason: "dup on empty stack".to_string(),
                })?;
                self.stack.push(top);
            }
            0x5a => {
                // dup_x1: ..., v2, v1 -> ..., v1, v2, v1
                let a = self.pop(pc)?;
                let b = self.pop(pc)?;
                self.stack.push(a);
                self.stack.push(b);
                self.stack.push(a);
            }
            0x5b => {
                // dup_x2 form 1: ..., v3, v2, v1 -> ..., v1, v3, v2, v1
                let a = self.pop(pc)?;
                let b = self.pop(pc)?;
                let c = self.pop(pc)?;
                self.stack.push(a);
                self.stack.push(c);
                self.stack.push(b);
                self.stack.push(a);
            }
            0x5c => {
                let a = self.pop(pc)?;
                if self.is_wide_value(a) {
                    self.stack.push(a);
                    self.stack.push(a);
                } else {
                    let b = self.pop(pc)?;
                    self.stack.push(b);
                    self.stack.push(a);
                    self.stack.push(b);
                    self.stack.push(a);
                }
            }
            0x5d | 0x5e => {
                return Err(LiftError::UnknownOpcode {
                    opcode: u16::from(op),
                    offset: pc,
                });
            }
            0x5f => {
                let a = self.pop(pc)?;
                let b = self.pop(pc)?;
                self.stack.push(a);
                self.stack.push(b);
            }

            0x60..=0x73 => {
                let (arith, kind) = jvm_binop(op - 0x60);
                let rhs = self.pop(pc)?;
                let lhs = self.pop(pc)?;
                self.push(
                    Expr::Binary {
                        op: arith,
                        kind,
                        lhs,
                        rhs,
                    },
                    pc,
                );
            }
            0x74..=0x77 => {
                let operand = self.pop(pc)?;
                let op = match op {
                    0x74 => UnaryOp::NegInt,
                    0x75 => UnaryOp::NegLong,
                    0x76 => UnaryOp::NegFloat,
                    _ => UnaryOp::NegDouble,
                };
                self.push(Expr::Unary { op, operand }, pc);
            }
            0x78..=0x83 => {
                let (arith, kind) = jvm_shift_logic(op - 0x78);
                let rhs = self.pop(pc)?;
                let lhs = self.pop(pc)?;
                self.push(
                    Expr::Binary {
                        op: arith,
                        kind,
                        lhs,
                        rhs,
                    },
                    pc,
                );
            }
            0x84 => {
                let slot = u16::from(self.u8_at(pc + 1)?);
                let delta = i32::from(self.u8_at(pc + 2)? as i8);
                let lid = self.slot(slot);
                let lhs = self.local_expr(lid, pc);
                let rhs = self.arena.alloc(Expr::IntLit(delta), pc as u32);
                let value = self.arena.alloc(
                    Expr::Binary {
                        op: Arith::Add,
                        kind: NumKind::Int,
                        lhs,
                        rhs,
                    },
                    pc as u32,
                );
                self.stmts.push(Stmt::Assign {
                    target: LValue::Local(lid),
                    value,
                    declare: None,
                    offset: pc as u32,
                });
            }

            0x85..=0x93 => {
                let operand = self.pop(pc)?;
                self.push(
                    Expr::Unary {
                        op: jvm_conversion(op - 0x85),
                        operand,
                    },
                    pc,
                );
            }

            0x94..=0x98 => {
                let kind = match op {
                    0x94 => CmpKind::CmpLong,
                    0x95 => CmpKind::CmplFloat,
                    0x96 => CmpKind::CmpgFloat,
                    0x97 => CmpKind::CmplDouble,
                    _ => CmpKind::CmpgDouble,
                };
                let rhs = self.pop(pc)?;
                let lhs = self.pop(pc)?;
                self.push(Expr::Cmp { kind, lhs, rhs }, pc);
            }

            0x99..=0x9e => {
                let target = (pc as i64 + i64::from(self.i16_at(pc + 1)?)) as u32;
                let lhs = self.pop(pc)?;
                let reference = matches!(
                    infer_type(self.arena, &self.locals, lhs),
                    Some(TypeSignature::Object(_)) | Some(TypeSignature::Array(_))
                );
                let rhs = if reference {
                    self.arena.alloc(Expr::Null, pc as u32)
                } else {
                    self.arena.alloc(Expr::IntLit(0), pc as u32)
                };
                self.cond_goto(jvm_test(op - 0x99), lhs, rhs, target, pc);
            }
            0x9f..=0xa4 => {
                let target = (pc as i64 + i64::from(self.i16_at(pc + 1)?)) as u32;
                let rhs = self.pop(pc)?;
                let lhs = self.pop(pc)?;
                self.cond_goto(jvm_test(op - 0x9f), lhs, rhs, target, pc);
            }
            0xa5 | 0xa6 => {
                let target = (pc as i64 + i64::from(self.i16_at(pc + 1)?)) as u32;
                let rhs = self.pop(pc)?;
                let lhs = self.pop(pc)?;
                let test = if op == 0xa5 { TestKind::Eq } else { TestKind::Ne };
                self.cond_goto(test, lhs, rhs, target, pc);
            }
            0xc6 | 0xc7 => {
                let target = (pc as i64 + i64::from(self.i16_at(pc + 1)?)) as u32;
                let lhs = self.pop(pc)?;
                let rhs = self.arena.alloc(Expr::Null, pc as u32);
                let test = if op == 0xc6 { TestKind::Eq } else { TestKind::Ne };
                self.cond_goto(test, lhs, rhs, target, pc);
            }

            0xa7 | 0xc8 => {
                let target = if op == 0xa7 {
                    (pc as i64 + i64::from(self.i16_at(pc + 1)?)) as u32
                } else {
                    (pc as i64 + i64::from(self.i32_at(pc + 1)?)) as u32
                };
                self.spill_for_jump(&[target], pc);
                self.stack.clear();
                self.stmts.push(Stmt::Goto {
                    label: target,
                    offset: pc as u32,
                });
            }
            0xa8 | 0xa9 | 0xc9 => {
                return Err(LiftError::UnknownOpcode {
                    opcode: u16::from(op),
                    offset: pc,
                });
            }

            0xaa | 0xab => {
                let value = self.pop(pc)?;
                let arms = self.switch_arms(pc, op == 0xab)?;
                self.stmts.push(Stmt::Switch {
                    value,
                    arms,
                    offset: pc as u32,
                });
                self.stack.clear();
            }

            0xac..=0xb0 => {
                let value = self.pop(pc)?;
                self.stmts.push(Stmt::Return {
                    value: Some(value),
                    offset: pc as u32,
                });
                self.stack.clear();
            }
            0xb1 => {
                self.stmts.push(Stmt::Return {
                    value: None,
                    offset: pc as u32,
                });
                self.stack.clear();
            }

            0xb2 => {
                let (class, name, desc) = self.member(self.u16_at(pc + 1)?, pc)?;
                self.push(
                    Expr::FieldGet {
                        object: None,
                        class,
                        name,
                        ty: TypeSignature::from_jni(&desc),
                    },
                    pc,
                );
            }
            0xb3 => {
                let (class, name, _) = self.member(self.u16_at(pc + 1)?, pc)?;
                let value = self.pop(pc)?;
                self.stmts.push(Stmt::Assign {
                    target: LValue::Field {
                        object: None,
                        class,
                        name,
                    },
                    value,
                    declare: None,
                    offset: pc as u32,
                });
            }
            0xb4 => {
                let (class, name, desc) = self.member(self.u16_at(pc + 1)?, pc)?;
                let object = self.pop(pc)?;
                self.push(
                    Expr::FieldGet {
                        object: Some(object),
                        class,
                        name,
                        ty: TypeSignature::from_jni(&desc),
                    },
                    pc,
                );
            }
            0xb5 => {
                let (class, name, _) = self.member(self.u16_at(pc + 1)?, pc)?;
                let value = self.pop(pc)?;
                let object = self.pop(pc)?;
                self.stmts.push(Stmt::Assign {
                    target: LValue::Field {
                        object: Some(object),
                        class,
                        name,
                    },
                    value,
                    declare: None,
                    offset: pc as u32,
                });
            }

            0xb6..=0xb9 => {
                let index = self.u16_at(pc + 1)?;
                let (class, name, desc) = self.member(index, pc)?;
                let sig = MethodSignature::from_jni(&desc);
                let mut args = Vec::with_capacity(sig.args.len());
                for _ in 0..sig.args.len() {
                    args.push(self.pop(pc)?);
                }
                args.reverse();
                let kind = match op {
                    0xb6 => InvokeKind::Virtual,
                    0xb7 => InvokeKind::Direct,
                    0xb8 => InvokeKind::Static,
                    _ => InvokeKind::Interface,
                };
                let receiver = if kind == InvokeKind::Static {
                    None
                } else {
                    Some(self.pop(pc)?)
                };

                // new + invokespecial <init> fusion.
                if kind == InvokeKind::Direct && name == "<init>" {
                    if let Some(recv) = receiver {
                        if self.pending_new.remove(&recv.0) {
                            self.arena[recv] = Expr::NewInstance { class, args };
                            return Ok(());
                        }
                    }
                }

                let returns_value = sig.return_type != TypeSignature::Void;
                let id = self.arena.alloc(
                    Expr::Invoke {
                        kind,
                        class,
                        name,
                        sig,
                        receiver,
                        args,
                    },
                    pc as u32,
                );
                if returns_value {
                    self.stack.push(id);
                } else {
                    self.stmts.push(Stmt::Expr {
                        expr: id,
                        offset: pc as u32,
                    });
                }
            }
            0xba => {
                // invokedynamic: opaque value
                let index = self.u16_at(pc + 1)?;
                self.push(Expr::OpaqueRef(format!("indy@{index}")), pc);
            }

            0xbb => {
                let class = self.class_at(self.u16_at(pc + 1)?, pc)?;
                let id = self.push(Expr::NewInstance { class, args: vec![] }, pc);
                self.pending_new.insert(id.0);
            }
            0xbc => {
                let elem = match self.u8_at(pc + 1)? {
                    4 => TypeSignature::Bool,
                    5 => TypeSignature::Char,
                    6 => TypeSignature::Float,
                    7 => TypeSignature::Double,
                    8 => TypeSignature::Byte,
                    9 => TypeSignature::Short,
                    10 => TypeSignature::Int,
                    _ => TypeSignature::Long,
                };
                let size = self.pop(pc)?;
                self.push(Expr::NewArray { elem, size }, pc);
            }
            0xbd => {
                let class = self.class_at(self.u16_at(pc + 1)?, pc)?;
                let size = self.pop(pc)?;
                self.push(
                    Expr::NewArray {
                        elem: TypeSignature::Object(class),
                        size,
                    },
                    pc,
                );
            }
            0xbe => {
                let array = self.pop(pc)?;
                self.push(Expr::ArrayLength { array }, pc);
            }
            0xbf => {
                let value = self.pop(pc)?;
                self.stmts.push(Stmt::Throw {
                    value,
                    offset: pc as u32,
                });
                self.stack.clear();
            }
            0xc0 => {
                let class = self.class_at(self.u16_at(pc + 1)?, pc)?;
                let operand = self.pop(pc)?;
                self.push(
                    Expr::Cast {
                        ty: TypeSignature::Object(class),
                        operand,
                    },
                    pc,
                );
            }
            0xc1 => {
                let class = self.class_at(self.u16_at(pc + 1)?, pc)?;
                let operand = self.pop(pc)?;
                self.push(
                    Expr::InstanceOf {
                        operand,
                        ty: TypeSignature::Object(class),
                    },
                    pc,
                );
            }
            0xc2 => {
                let monitor = self.pop(pc)?;
                self.stmts.push(Stmt::MonitorEnter {
                    monitor,
                    offset: pc as u32,
                });
            }
            0xc3 => {
                let monitor = self.pop(pc)?;
                self.stmts.push(Stmt::MonitorExit {
                    monitor,
                    offset: pc as u32,
                });
            }
            0xc4 => {
                let inner = self.u8_at(pc + 1)?;
                let slot = self.u16_at(pc + 2)?;
                match inner {
                    0x15..=0x19 => {
                        let lid = self.slot(slot);
                        let e = self.local_expr(lid, pc);
                        self.stack.push(e);
                    }
                    0x36..=0x3a => {
                        let value = self.pop(pc)?;
                        self.store_slot(slot, value, pc);
                    }
                    0x84 => {
                        let delta = i32::from(self.i16_at(pc + 4)?);
                        let lid = self.slot(slot);
                        let lhs = self.local_expr(lid, pc);
                        let rhs = self.arena.alloc(Expr::IntLit(delta), pc as u32);
                        let value = self.arena.alloc(
                            Expr::Binary {
                                op: Arith::Add,
                                kind: NumKind::Int,
                                lhs,
                                rhs,
                            },
                            pc as u32,
                        );
                        self.stmts.push(Stmt::Assign {
                            target: LValue::Local(lid),
                            value,
                            declare: None,
                            offset: pc as u32,
                        });
                    }
                    other => {
                        return Err(LiftError::UnknownOpcode {
                            opcode: u16::from(other),
                            offset: pc,
                        })
                    }
                }
            }
            0xc5 => {
                // multianewarray: keep the first dimension
                let class = self.class_at(self.u16_at(pc + 1)?, pc)?;
                let dims = self.u8_at(pc + 3)?;
                let mut sizes = Vec::new();
                for _ in 0..dims {
                    sizes.push(self.pop(pc)?);
                }
                let size = sizes.pop().ok_or(LiftError::Cfg {
                    offset: pc,
                    reason: "multianewarray without dimensions".to_string(),
                })?;
                let elem = TypeSignature::from_jni(&class.as_jni_type());
                self.push(Expr::NewArray { elem, size }, pc);
            }

            other => {
                return Err(LiftError::UnknownOpcode {
                    opcode: u16::from(other),
                    offset: pc,
                })
            }
        }
        Ok(())
    }

    fn cond_goto(&mut self, test: TestKind, lhs: ExprId, rhs: ExprId, target: u32, pc: usize) {
        self.spill_for_jump(&[target], pc);
        let cond = self.arena.alloc(Expr::Compare { test, lhs, rhs }, pc as u32);
        self.stmts.push(Stmt::CondGoto {
            cond,
            label: target,
            offset: pc as u32,
        });
    }

    fn switch_arms(&self, pc: usize, lookup: bool) -> Result<Vec<SwitchArm>, LiftError> {
        let pad = (4 - ((pc + 1) % 4)) % 4;
        let base = pc + 1 + pad;
        let default = (pc as i64 + i64::from(self.i32_at(base)?)) as u32;
        let mut arms = Vec::new();
        if lookup {
            let npairs = self.i32_at(base + 4)?.max(0) as usize;
            for i in 0..npairs {
                let key = self.i32_at(base + 8 + i * 8)?;
                let target = (pc as i64 + i64::from(self.i32_at(base + 8 + i * 8 + 4)?)) as u32;
                arms.push(SwitchArm {
                    key: Some(key),
                    label: target,
                });
            }
        } else {
            let low = self.i32_at(base + 4)?;
            let high = self.i32_at(base + 8)?;
            let n = (i64::from(high) - i64::from(low) + 1).max(0) as usize;
            for i in 0..n {
                let target = (pc as i64 + i64::from(self.i32_at(base + 12 + i * 4)?)) as u32;
                arms.push(SwitchArm {
                    key: Some(low.wrapping_add(i as i32)),
                    label: target,
                });
            }
        }
        arms.push(SwitchArm {
            key: None,
            label: default,
        });
        Ok(arms)
    }

    fn load_constant(&mut self, index: u16, pc: usize) -> Result<(), LiftError> {
        let expr = match self.class.pool.get(index as usize) {
            Some(Constant::Integer(v)) => Expr::IntLit(*v),
            Some(Constant::Float(v)) => Expr::FloatLit(*v),
            Some(Constant::Long(v)) => Expr::LongLit(*v),
            Some(Constant::Double(v)) => Expr::DoubleLit(*v),
            Some(Constant::String(utf8_ix)) => {
                let s = self.class.utf8(*utf8_ix).map_err(|e| LiftError::Cfg {
                    offset: pc,
                    reason: e.to_string(),
                })?;
                Expr::StringLit(s.to_string())
            }
            Some(Constant::Class(name_ix)) => {
                let name = self.class.utf8(*name_ix).map_err(|e| LiftError::Cfg {
                    offset: pc,
                    reason: e.to_string(),
                })?;
                Expr::ClassLit(TypeSignature::Object(ObjectIdentifier::from_jni_type(
                    &format!("L{name};"),
                )))
            }
            _ => Expr::OpaqueRef(format!("cp@{index}")),
        };
        self.push(expr, pc);
        Ok(())
    }

    fn wrap_exceptions(
        &mut self,
        stmts: Vec<Stmt>,
        code: &CodeAttribute,
    ) -> Result<Vec<Stmt>, LiftError> {
        if code.exceptions.is_empty() {
            return Ok(stmts);
        }
        let mut handler_starts: Vec<u32> =
            code.exceptions.iter().map(|e| u32::from(e.handler_pc)).collect();
        handler_starts.sort_unstable();
        handler_starts.dedup();

        let mut out = stmts;
        let mut entries = code.exceptions.clone();
        entries.sort_by_key(|e| e.end_pc.saturating_sub(e.start_pc));
        for e in entries {
            let exception = if e.catch_type == 0 {
                None
            } else {
                Some(self.class_at(e.catch_type, usize::from(e.handler_pc))?)
            };
            let body = extract_handler_span(&mut out, u32::from(e.handler_pc), &handler_starts);
            let var = self.handler_vars[&u32::from(e.handler_pc)];
            let arms = vec![CatchArm {
                exception,
                var,
                body,
            }];
            wrap_try_range(&mut out, u32::from(e.start_pc), u32::from(e.end_pc), arms);
        }
        Ok(out)
    }
}

fn jvm_binop(index: u8) -> (Arith, NumKind) {
    let kind = match index % 4 {
        0 => NumKind::Int,
        1 => NumKind::Long,
        2 => NumKind::Float,
        _ => NumKind::Double,
    };
    let op = match index / 4 {
        0 => Arith::Add,
        1 => Arith::Sub,
        2 => Arith::Mul,
        3 => Arith::Div,
        _ => Arith::Rem,
    };
    (op, kind)
}

fn jvm_shift_logic(index: u8) -> (Arith, NumKind) {
    let kind = if index % 2 == 0 {
        NumKind::Int
    } else {
        NumKind::Long
    };
    let op = match index / 2 {
        0 => Arith::Shl,
        1 => Arith::Shr,
        2 => Arith::Ushr,
        3 => Arith::And,
        4 => Arith::Or,
        _ => Arith::Xor,
    };
    (op, kind)
}

fn jvm_conversion(index: u8) -> UnaryOp {
    match index {
        0 => UnaryOp::IntToLong,
        1 => UnaryOp::IntToFloat,
        2 => UnaryOp::IntToDouble,
        3 => UnaryOp::LongToInt,
        4 => UnaryOp::LongToFloat,
        5 => UnaryOp::LongToDouble,
        6 => UnaryOp::FloatToInt,
        7 => UnaryOp::FloatToLong,
        8 => UnaryOp::FloatToDouble,
        9 => UnaryOp::DoubleToInt,
        10 => UnaryOp::DoubleToLong,
        11 => UnaryOp::DoubleToFloat,
        12 => UnaryOp::IntToByte,
        13 => UnaryOp::IntToChar,
        _ => UnaryOp::IntToShort,
    }
}

fn jvm_test(index: u8) -> TestKind {
    match index {
        0 => TestKind::Eq,
        1 => TestKind::Ne,
        2 => TestKind::Lt,
        3 => TestKind::Ge,
        4 => TestKind::Gt,
        _ => TestKind::Le,
    }
}

#[cfg(test)]
mod tests {
    use crate::jvm::class_file::ClassFile;
    use crate::jvm::source::decompile_class_file;
    use crate::testutil::class_file_with_code;

    fn decompile(code: &[u8], max_stack: u16, max_locals: u16) -> String {
        let bytes = class_file_with_code("p/S", "run", "()V", 0x9, max_stack, max_locals, code);
        let class = ClassFile::parse(&bytes).unwrap();
        decompile_class_file(&class).unwrap()
    }

    #[test]
    fn dup_x1_stack_shape() {
        // iconst_1; iconst_2; dup_x1; istore_0..2; return
        // ..., 1, 2 -> ..., 2, 1, 2
        let src = decompile(
            &[0x04, 0x05, 0x5a, 0x3b, 0x3c, 0x3d, 0xb1],
            4,
            3,
        );
        assert!(src.contains("int v0 = 2;"), "got:\n{src}");
        assert!(src.contains("int v1 = 1;"), "got:\n{src}");
        assert!(src.contains("int v2 = 2;"), "got:\n{src}");
    }

    #[test]
    fn dup_x2_reinserts_below_third_value() {
        // iconst_1; iconst_2; iconst_3; dup_x2; istore_0..3; return
        // ..., 1, 2, 3 -> ..., 3, 1, 2, 3
        let src = decompile(
            &[0x04, 0x05, 0x06, 0x5b, 0x3b, 0x3c, 0x3d, 0x3e, 0xb1],
            5,
            4,
        );
        assert!(src.contains("int v0 = 3;"), "got:\n{src}");
        assert!(src.contains("int v1 = 2;"), "got:\n{src}");
        assert!(src.contains("int v2 = 1;"), "got:\n{src}");
        assert!(src.contains("int v3 = 3;"), "got:\n{src}");
    }

    #[test]
    fn dup_duplicates_top() {
        // iconst_1; dup; istore_0; istore_1; return
        let src = decompile(&[0x04, 0x59, 0x3b, 0x3c, 0xb1], 2, 2);
        assert!(src.contains("int v0 = 1;"), "got:\n{src}");
        assert!(src.contains("int v1 = 1;"), "got:\n{src}");
    }
}
