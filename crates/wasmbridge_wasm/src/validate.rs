//! Function body type checking.
//!
//! Operand/control stack algorithm: every instruction pops its operand types
//! and pushes its results; `None` on the operand stack stands for a value of
//! unknown type produced in unreachable code.

use crate::instr::{BlockType, FunctionBody, Instr};
use crate::load::{LoadConfig, LoadError, WasmFeature};
use crate::types::GlobalType;
use wasmbridge_core::{FuncType, ValType};

/// Index spaces a function body may refer to
pub(crate) struct ModuleContext<'a> {
    pub types: &'a [FuncType],
    pub func_types: &'a [u32],
    pub global_types: &'a [GlobalType],
    pub has_memory: bool,
    pub has_table: bool,
    pub config: &'a LoadConfig,
}

type Operand = Option<ValType>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Func,
    Block,
    Loop,
    If,
    Else,
}

#[derive(Debug)]
struct Ctrl {
    kind: FrameKind,
    params: Vec<ValType>,
    results: Vec<ValType>,
    height: usize,
    unreachable: bool,
}

impl Ctrl {
    fn label_types(&self) -> &[ValType] {
        if self.kind == FrameKind::Loop {
            &self.params
        } else {
            &self.results
        }
    }
}

struct Validator<'a> {
    ctx: &'a ModuleContext<'a>,
    func_index: u32,
    locals: Vec<ValType>,
    operands: Vec<Operand>,
    ctrls: Vec<Ctrl>,
    offset: usize,
}

impl Validator<'_> {
    fn error(&self, reason: impl Into<String>) -> LoadError {
        LoadError::Validation {
            func_index: Some(self.func_index),
            offset: self.offset,
            reason: reason.into(),
        }
    }

    fn push(&mut self, ty: Operand) {
        self.operands.push(ty);
    }

    fn push_all(&mut self, types: &[ValType]) {
        self.operands.extend(types.iter().copied().map(Some));
    }

    fn pop(&mut self) -> Result<Operand, LoadError> {
        let Some(frame) = self.ctrls.last() else {
            return Err(self.error("type mismatch: operand stack underflow"));
        };
        if self.operands.len() == frame.height {
            if frame.unreachable {
                return Ok(None);
            }
            return Err(self.error("type mismatch: operand stack underflow"));
        }
        Ok(self.operands.pop().flatten())
    }

    fn pop_expect(&mut self, expected: ValType) -> Result<Operand, LoadError> {
        let actual = self.pop()?;
        match actual {
            Some(ty) if ty != expected => Err(self.error(format!(
                "type mismatch: expected {}, found {}",
                expected, ty
            ))),
            _ => Ok(Some(expected)),
        }
    }

    fn pop_all(&mut self, types: &[ValType]) -> Result<(), LoadError> {
        for ty in types.iter().rev() {
            self.pop_expect(*ty)?;
        }
        Ok(())
    }

    fn push_ctrl(&mut self, kind: FrameKind, params: Vec<ValType>, results: Vec<ValType>) {
        let height = self.operands.len();
        self.push_all(&params);
        self.ctrls.push(Ctrl {
            kind,
            params,
            results,
            height,
            unreachable: false,
        });
    }

    fn pop_ctrl(&mut self) -> Result<Ctrl, LoadError> {
        let results = match self.ctrls.last() {
            Some(frame) => frame.results.clone(),
            None => return Err(self.error("unexpected end")),
        };
        self.pop_all(&results)?;
        let frame = self
            .ctrls
            .pop()
            .ok_or_else(|| self.error("unexpected end"))?;
        if self.operands.len() != frame.height {
            return Err(self.error("type mismatch: values remaining on stack at end of block"));
        }
        Ok(frame)
    }

    fn set_unreachable(&mut self) {
        if let Some(frame) = self.ctrls.last_mut() {
            self.operands.truncate(frame.height);
            frame.unreachable = true;
        }
    }

    fn label(&self, depth: u32) -> Result<&Ctrl, LoadError> {
        let len = self.ctrls.len();
        (depth as usize)
            .checked_add(1)
            .filter(|d| *d <= len)
            .map(|d| &self.ctrls[len - d])
            .ok_or_else(|| self.error(format!("unknown label {}", depth)))
    }

    fn label_types(&self, depth: u32) -> Result<Vec<ValType>, LoadError> {
        self.label(depth).map(|c| c.label_types().to_vec())
    }

    fn block_signature(&self, ty: BlockType) -> Result<(Vec<ValType>, Vec<ValType>), LoadError> {
        match ty {
            BlockType::Empty => Ok((Vec::new(), Vec::new())),
            BlockType::Value(t) => Ok((Vec::new(), vec![t])),
            BlockType::Func(idx) => {
                let sig = self
                    .ctx
                    .types
                    .get(idx as usize)
                    .ok_or_else(|| self.error(format!("unknown type {}", idx)))?;
                if !sig.params.is_empty() || sig.results.len() > 1 {
                    self.require(WasmFeature::MultiValue)?;
                }
                Ok((sig.params.clone(), sig.results.clone()))
            }
        }
    }

    fn require(&self, feature: WasmFeature) -> Result<(), LoadError> {
        if self.ctx.config.is_feature_allowed(&feature) {
            Ok(())
        } else {
            Err(LoadError::Unsupported {
                offset: self.offset,
                feature: feature.to_string(),
            })
        }
    }

    fn local(&self, idx: u32) -> Result<ValType, LoadError> {
        self.locals
            .get(idx as usize)
            .copied()
            .ok_or_else(|| self.error(format!("unknown local {}", idx)))
    }

    fn global(&self, idx: u32) -> Result<GlobalType, LoadError> {
        self.ctx
            .global_types
            .get(idx as usize)
            .copied()
            .ok_or_else(|| self.error(format!("unknown global {}", idx)))
    }

    fn callee(&self, idx: u32) -> Result<FuncType, LoadError> {
        self.ctx
            .func_types
            .get(idx as usize)
            .and_then(|ty| self.ctx.types.get(*ty as usize))
            .cloned()
            .ok_or_else(|| self.error(format!("unknown function {}", idx)))
    }

    fn check_memory(&self) -> Result<(), LoadError> {
        if self.ctx.has_memory {
            Ok(())
        } else {
            Err(self.error("unknown memory 0"))
        }
    }

    fn check_align(&self, align: u32, width: u32) -> Result<(), LoadError> {
        if align > width.trailing_zeros() {
            Err(self.error("alignment must not be larger than natural"))
        } else {
            Ok(())
        }
    }

    fn step(&mut self, instr: &Instr) -> Result<(), LoadError> {
        match instr {
            Instr::Unreachable => self.set_unreachable(),
            Instr::Nop => {}
            Instr::Block { ty, .. } | Instr::Loop { ty } | Instr::If { ty, .. } => {
                let (params, results) = self.block_signature(*ty)?;
                let kind = match instr {
                    Instr::Block { .. } => FrameKind::Block,
                    Instr::Loop { .. } => FrameKind::Loop,
                    _ => {
                        self.pop_expect(ValType::I32)?;
                        FrameKind::If
                    }
                };
                self.pop_all(&params)?;
                self.push_ctrl(kind, params, results);
            }
            Instr::Else { .. } => {
                let frame = self.pop_ctrl()?;
                if frame.kind != FrameKind::If {
                    return Err(self.error("else without matching if"));
                }
                self.push_ctrl(FrameKind::Else, frame.params, frame.results);
            }
            Instr::End => {
                let frame = self.pop_ctrl()?;
                if frame.kind == FrameKind::If && frame.params != frame.results {
                    return Err(self.error("type mismatch: if without else must leave its parameters"));
                }
                if frame.kind != FrameKind::Func {
                    self.push_all(&frame.results);
                }
            }
            Instr::Br(depth) => {
                let types = self.label_types(*depth)?;
                self.pop_all(&types)?;
                self.set_unreachable();
            }
            Instr::BrIf(depth) => {
                self.pop_expect(ValType::I32)?;
                let types = self.label_types(*depth)?;
                self.pop_all(&types)?;
                self.push_all(&types);
            }
            Instr::BrTable { targets, default } => {
                self.pop_expect(ValType::I32)?;
                let default_types = self.label_types(*default)?;
                let arity = default_types.len();
                for target in targets.iter() {
                    let types = self.label_types(*target)?;
                    if types.len() != arity {
                        return Err(self.error("type mismatch: br_table targets have inconsistent arity"));
                    }
                    let mut popped = Vec::with_capacity(arity);
                    for ty in types.iter().rev() {
                        popped.push(self.pop_expect(*ty)?);
                    }
                    for ty in popped.into_iter().rev() {
                        self.push(ty);
                    }
                }
                self.pop_all(&default_types)?;
                self.set_unreachable();
            }
            Instr::Return => {
                let results = self.ctrls.first().map(|f| f.results.clone()).unwrap_or_default();
                self.pop_all(&results)?;
                self.set_unreachable();
            }
            Instr::Call(idx) => {
                let sig = self.callee(*idx)?;
                self.pop_all(&sig.params)?;
                self.push_all(&sig.results);
            }
            Instr::CallIndirect(type_index) => {
                if !self.ctx.has_table {
                    return Err(self.error("unknown table 0"));
                }
                let sig = self
                    .ctx
                    .types
                    .get(*type_index as usize)
                    .cloned()
                    .ok_or_else(|| self.error(format!("unknown type {}", type_index)))?;
                self.pop_expect(ValType::I32)?;
                self.pop_all(&sig.params)?;
                self.push_all(&sig.results);
            }
            Instr::Drop => {
                self.pop()?;
            }
            Instr::Select(annotated) => {
                self.pop_expect(ValType::I32)?;
                match annotated {
                    Some(ty) => {
                        self.pop_expect(*ty)?;
                        self.pop_expect(*ty)?;
                        self.push(Some(*ty));
                    }
                    None => {
                        let first = self.pop()?;
                        let second = self.pop()?;
                        let merged = match (first, second) {
                            (Some(a), Some(b)) if a != b => {
                                return Err(self.error(format!(
                                    "type mismatch: select operands {} and {}",
                                    b, a
                                )));
                            }
                            (Some(a), _) | (None, Some(a)) => Some(a),
                            (None, None) => None,
                        };
                        self.push(merged);
                    }
                }
            }
            Instr::LocalGet(idx) => {
                let ty = self.local(*idx)?;
                self.push(Some(ty));
            }
            Instr::LocalSet(idx) => {
                let ty = self.local(*idx)?;
                self.pop_expect(ty)?;
            }
            Instr::LocalTee(idx) => {
                let ty = self.local(*idx)?;
                self.pop_expect(ty)?;
                self.push(Some(ty));
            }
            Instr::GlobalGet(idx) => {
                let global = self.global(*idx)?;
                self.push(Some(global.ty));
            }
            Instr::GlobalSet(idx) => {
                let global = self.global(*idx)?;
                if !global.mutable {
                    return Err(self.error(format!("global {} is immutable", idx)));
                }
                self.pop_expect(global.ty)?;
            }
            Instr::Load(op, memarg) => {
                self.check_memory()?;
                self.check_align(memarg.align, op.width())?;
                self.pop_expect(ValType::I32)?;
                self.push(Some(op.result()));
            }
            Instr::Store(op, memarg) => {
                self.check_memory()?;
                self.check_align(memarg.align, op.width())?;
                self.pop_expect(op.operand())?;
                self.pop_expect(ValType::I32)?;
            }
            Instr::MemorySize => {
                self.check_memory()?;
                self.push(Some(ValType::I32));
            }
            Instr::MemoryGrow => {
                self.check_memory()?;
                self.pop_expect(ValType::I32)?;
                self.push(Some(ValType::I32));
            }
            Instr::I32Const(_) => self.push(Some(ValType::I32)),
            Instr::I64Const(_) => self.push(Some(ValType::I64)),
            Instr::F32Const(_) => self.push(Some(ValType::F32)),
            Instr::F64Const(_) => self.push(Some(ValType::F64)),
            Instr::Num(op) => {
                let sig = op.signature();
                for _ in 0..sig.arity {
                    self.pop_expect(sig.operand)?;
                }
                self.push(Some(sig.result));
            }
        }
        Ok(())
    }
}

/// Type-check one function body against its signature
///
/// # Errors
///
/// Returns `LoadError::Validation` naming the function and the byte offset
/// of the offending instruction
pub(crate) fn validate_function(
    ctx: &ModuleContext<'_>,
    func_index: u32,
    ty: &FuncType,
    body: &FunctionBody,
) -> Result<(), LoadError> {
    let mut locals = ty.params.clone();
    locals.extend_from_slice(&body.locals);

    let mut v = Validator {
        ctx,
        func_index,
        locals,
        operands: Vec::new(),
        ctrls: Vec::new(),
        offset: body.offsets.first().map_or(0, |o| *o as usize),
    };
    v.ctrls.push(Ctrl {
        kind: FrameKind::Func,
        params: Vec::new(),
        results: ty.results.clone(),
        height: 0,
        unreachable: false,
    });

    for (instr, offset) in body.code.iter().zip(&body.offsets) {
        v.offset = *offset as usize;
        v.step(instr)?;
    }
    if !v.ctrls.is_empty() {
        return Err(v.error("unexpected end of function body"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::load::{LoadError, load};

    fn check(src: &str) -> Result<(), LoadError> {
        load(&wat::parse_str(src).unwrap()).map(|_| ())
    }

    fn reason(src: &str) -> String {
        match check(src).unwrap_err() {
            LoadError::Validation { reason, .. } => reason,
            other => panic!("expected validation error, got {other}"),
        }
    }

    #[test]
    fn test_valid_arithmetic() {
        check(
            r#"(module (func (param i32 i64) (result i64)
                local.get 0 i64.extend_i32_u local.get 1 i64.mul))"#,
        )
        .unwrap();
    }

    #[test]
    fn test_binary_operand_mismatch() {
        let r = reason("(module (func (result i32) i32.const 1 i64.const 2 i32.add))");
        assert!(r.contains("type mismatch"));
    }

    #[test]
    fn test_stack_underflow() {
        let r = reason("(module (func (result i32) i32.const 1 i32.add))");
        assert!(r.contains("underflow"));
    }

    #[test]
    fn test_leftover_values() {
        let r = reason("(module (func i32.const 1))");
        assert!(r.contains("remaining"));
    }

    #[test]
    fn test_unreachable_is_polymorphic() {
        check("(module (func (result i32) unreachable i32.add))").unwrap();
        check("(module (func (result f64) (block (br 0)) f64.const 1 return i32.add drop))").unwrap();
    }

    #[test]
    fn test_unknown_local_and_global() {
        assert!(reason("(module (func local.get 0 drop))").contains("unknown local"));
        assert!(reason("(module (func global.get 0 drop))").contains("unknown global"));
    }

    #[test]
    fn test_immutable_global_set() {
        let r = reason("(module (global i32 (i32.const 0)) (func i32.const 1 global.set 0))");
        assert!(r.contains("immutable"));
    }

    #[test]
    fn test_memory_required() {
        let r = reason("(module (func (result i32) i32.const 0 i32.load))");
        assert!(r.contains("unknown memory"));
    }

    #[test]
    fn test_alignment_checked() {
        let r = reason("(module (memory 1) (func (result i32) i32.const 0 i32.load align=8))");
        assert!(r.contains("alignment"));
    }

    #[test]
    fn test_branch_depth_checked() {
        assert!(reason("(module (func br 1))").contains("unknown label"));
    }

    #[test]
    fn test_block_results() {
        check(
            r#"(module (func (param i32) (result i32)
                (block (result i32) (i32.const 7) (br_if 0 (local.get 0)) drop (i32.const 9))))"#,
        )
        .unwrap();
        let r = reason("(module (func (result i32) (block (result i32) (i64.const 1))))");
        assert!(r.contains("type mismatch"));
    }

    #[test]
    fn test_if_without_else_needs_matching_types() {
        let r = reason(
            "(module (func (param i32) (result i32) (if (result i32) (local.get 0) (then (i32.const 1)))))",
        );
        assert!(r.contains("if without else"));
    }

    #[test]
    fn test_br_table_arity() {
        check(
            r#"(module (func (param i32) (result i32)
                (block (result i32)
                  (block (result i32) (i32.const 1) (local.get 0) (br_table 0 1 0)))))"#,
        )
        .unwrap();
        let r = reason(
            r#"(module (func (param i32) (result i32)
                (block (result i32)
                  (block (i32.const 1) (local.get 0) (br_table 0 1)) (i32.const 0))))"#,
        );
        assert!(r.contains("br_table"));
    }

    #[test]
    fn test_call_signature() {
        let r = reason(
            r#"(module (func $f (param i64)) (func i32.const 1 call $f))"#,
        );
        assert!(r.contains("expected i64"));
    }

    #[test]
    fn test_call_indirect_needs_table() {
        let r = reason("(module (type $t (func)) (func i32.const 0 call_indirect (type $t)))");
        assert!(r.contains("unknown table"));
    }

    #[test]
    fn test_select_operands() {
        check("(module (func (result i64) i64.const 1 i64.const 2 i32.const 0 select))").unwrap();
        let r = reason("(module (func (result i64) i64.const 1 f64.const 2 i32.const 0 select drop i64.const 0))");
        assert!(r.contains("select"));
    }

    #[test]
    fn test_error_names_function_and_offset() {
        let bytes = wat::parse_str(
            "(module (func) (func (result i32) i64.const 0))",
        )
        .unwrap();
        match load(&bytes).unwrap_err() {
            LoadError::Validation {
                func_index, offset, ..
            } => {
                assert_eq!(func_index, Some(1));
                assert!(offset > 8 && offset < bytes.len());
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
