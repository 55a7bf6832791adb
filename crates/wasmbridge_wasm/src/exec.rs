//! The interpreter loop.
//!
//! One `Executor` exists per invocation. It owns the operand stack, the
//! locals of every active frame, the label stack and the call stack, and
//! borrows the instance state it may mutate. Nothing here recurses: calls
//! push a `Frame` and the loop switches to the callee's body.

use crate::fuel::FuelMeter;
use crate::host::{HostContext, HostFunction};
use crate::instr::{BlockType, FunctionBody, Instr, LoadOp, StoreOp};
use crate::load::Module;
use crate::memory::LinearMemory;
use crate::numeric;
use crate::trap::{Trap, TrapKind};
use tokio_util::sync::CancellationToken;
use wasmbridge_core::Value;

/// Stack limits applied to one invocation
#[derive(Debug, Clone, Copy)]
pub(crate) struct StackLimits {
    pub max_call_depth: usize,
    pub max_operand_stack: usize,
}

#[derive(Debug, Clone, Copy)]
struct Label {
    /// Instruction to continue at when branched to
    cont: usize,
    /// Values carried by a branch
    arity: usize,
    /// Operand stack height below the block's parameters
    height: usize,
    is_loop: bool,
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    func: u32,
    /// Where the caller resumes once this frame's callee returns
    return_pc: usize,
    locals_base: usize,
    label_base: usize,
    stack_base: usize,
    arity: usize,
}

enum Flow {
    Next,
    Jump(usize),
    Call(u32),
    Return,
}

/// Mutable instance state lent to one invocation
pub(crate) struct Executor<'a> {
    module: &'a Module,
    memory: Option<&'a mut LinearMemory>,
    table: &'a [Option<u32>],
    globals: &'a mut [Value],
    host_funcs: &'a [HostFunction],
    limits: StackLimits,
    fuel: Option<FuelMeter>,
    cancel: Option<&'a CancellationToken>,
    stack: Vec<Value>,
    locals: Vec<Value>,
    labels: Vec<Label>,
    frames: Vec<Frame>,
}

impl<'a> Executor<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        module: &'a Module,
        memory: Option<&'a mut LinearMemory>,
        table: &'a [Option<u32>],
        globals: &'a mut [Value],
        host_funcs: &'a [HostFunction],
        limits: StackLimits,
        fuel: Option<FuelMeter>,
        cancel: Option<&'a CancellationToken>,
    ) -> Self {
        Self {
            module,
            memory,
            table,
            globals,
            host_funcs,
            limits,
            fuel,
            cancel,
            stack: Vec::new(),
            locals: Vec::new(),
            labels: Vec::new(),
            frames: Vec::new(),
        }
    }

    /// Fuel left after the invocation, if metered
    pub(crate) fn fuel(&self) -> Option<&FuelMeter> {
        self.fuel.as_ref()
    }

    /// Run a function to completion
    ///
    /// `args` must already match the function's parameter types.
    pub(crate) fn execute(&mut self, func: u32, args: &[Value]) -> Result<Vec<Value>, Trap> {
        let module = self.module;
        let arity = module
            .func_type(func)
            .map(|ty| ty.results.len())
            .ok_or_else(|| Trap::new(TrapKind::OperandMismatch))?;

        if func < module.num_imported_funcs {
            self.check_cancelled().map_err(Trap::new)?;
            return self.call_host(func, args).map_err(|kind| Trap {
                kind,
                func_index: Some(func),
                offset: None,
            });
        }

        self.stack.extend_from_slice(args);
        let body = self.push_frame(func).map_err(Trap::new)?;
        self.run(func, body)?;

        let start = self
            .stack
            .len()
            .checked_sub(arity)
            .ok_or_else(|| Trap::new(TrapKind::OperandMismatch))?;
        Ok(self.stack.split_off(start))
    }

    fn run(&mut self, mut func: u32, mut body: &'a FunctionBody) -> Result<(), Trap> {
        let module = self.module;
        let mut pc = 0usize;
        loop {
            let offset = body.offsets.get(pc).copied().unwrap_or_default();
            let trap = move |kind: TrapKind| Trap::at(kind, func, offset);

            if let Some(fuel) = self.fuel.as_mut() {
                fuel.tick().map_err(|e| trap(e.into()))?;
            }
            let instr = body
                .code
                .get(pc)
                .ok_or_else(|| trap(TrapKind::OperandMismatch))?;

            match self.step(instr, pc).map_err(trap)? {
                Flow::Next => pc += 1,
                Flow::Jump(target) => pc = target,
                Flow::Call(callee) => {
                    if let Some(frame) = self.frames.last_mut() {
                        frame.return_pc = pc + 1;
                    }
                    body = self.push_frame(callee).map_err(trap)?;
                    func = callee;
                    pc = 0;
                }
                Flow::Return => {
                    self.pop_frame().map_err(trap)?;
                    let Some(caller) = self.frames.last() else {
                        return Ok(());
                    };
                    func = caller.func;
                    pc = caller.return_pc;
                    body = module
                        .body(func)
                        .ok_or_else(|| Trap::new(TrapKind::OperandMismatch))?;
                }
            }
        }
    }

    fn check_cancelled(&self) -> Result<(), TrapKind> {
        match self.cancel {
            Some(token) if token.is_cancelled() => Err(TrapKind::Cancelled),
            _ => Ok(()),
        }
    }

    fn push_frame(&mut self, func: u32) -> Result<&'a FunctionBody, TrapKind> {
        if self.frames.len() >= self.limits.max_call_depth
            || self.stack.len() + self.locals.len() >= self.limits.max_operand_stack
        {
            return Err(TrapKind::CallStackExhausted);
        }
        self.check_cancelled()?;

        let module = self.module;
        let ty = module.func_type(func).ok_or(TrapKind::OperandMismatch)?;
        let body = module.body(func).ok_or(TrapKind::OperandMismatch)?;
        let args_start = self
            .stack
            .len()
            .checked_sub(ty.params.len())
            .ok_or(TrapKind::OperandMismatch)?;

        let locals_base = self.locals.len();
        self.locals.extend(self.stack.drain(args_start..));
        self.locals
            .extend(body.locals.iter().map(|ty| Value::default_for(*ty)));
        self.frames.push(Frame {
            func,
            return_pc: 0,
            locals_base,
            label_base: self.labels.len(),
            stack_base: self.stack.len(),
            arity: ty.results.len(),
        });
        Ok(body)
    }

    fn pop_frame(&mut self) -> Result<(), TrapKind> {
        let frame = self.frames.pop().ok_or(TrapKind::OperandMismatch)?;
        let results_start = self
            .stack
            .len()
            .checked_sub(frame.arity)
            .filter(|start| *start >= frame.stack_base)
            .ok_or(TrapKind::OperandMismatch)?;
        self.stack.drain(frame.stack_base..results_start);
        self.labels.truncate(frame.label_base);
        self.locals.truncate(frame.locals_base);
        Ok(())
    }

    fn frame(&self) -> Result<&Frame, TrapKind> {
        self.frames.last().ok_or(TrapKind::OperandMismatch)
    }

    fn call_host(&mut self, func: u32, args: &[Value]) -> Result<Vec<Value>, TrapKind> {
        let host_funcs = self.host_funcs;
        let host = host_funcs
            .get(func as usize)
            .ok_or(TrapKind::OperandMismatch)?;
        let mut ctx = HostContext::new(self.memory.as_deref_mut());
        host.call(&mut ctx, args)
    }

    fn pop(&mut self) -> Result<Value, TrapKind> {
        self.stack.pop().ok_or(TrapKind::OperandMismatch)
    }

    fn pop_i32(&mut self) -> Result<i32, TrapKind> {
        match self.pop()? {
            Value::I32(v) => Ok(v),
            _ => Err(TrapKind::OperandMismatch),
        }
    }

    fn memory(&mut self) -> Result<&mut LinearMemory, TrapKind> {
        self.memory.as_deref_mut().ok_or(TrapKind::OperandMismatch)
    }

    fn block_arity(&self, ty: BlockType) -> Result<(usize, usize), TrapKind> {
        match ty {
            BlockType::Empty => Ok((0, 0)),
            BlockType::Value(_) => Ok((0, 1)),
            BlockType::Func(idx) => self
                .module
                .signature(idx)
                .map(|sig| (sig.params.len(), sig.results.len()))
                .ok_or(TrapKind::OperandMismatch),
        }
    }

    fn enter_block(&mut self, ty: BlockType, cont: usize, is_loop: bool) -> Result<(), TrapKind> {
        let (params, results) = self.block_arity(ty)?;
        let height = self
            .stack
            .len()
            .checked_sub(params)
            .ok_or(TrapKind::OperandMismatch)?;
        self.labels.push(Label {
            cont,
            arity: if is_loop { params } else { results },
            height,
            is_loop,
        });
        Ok(())
    }

    fn branch(&mut self, depth: u32) -> Result<Flow, TrapKind> {
        let label_base = self.frame()?.label_base;
        let depth = depth as usize;
        if depth >= self.labels.len() - label_base {
            return Ok(Flow::Return);
        }
        let idx = self.labels.len() - 1 - depth;
        let label = self.labels[idx];
        let keep = self
            .stack
            .len()
            .checked_sub(label.arity)
            .filter(|keep| *keep >= label.height)
            .ok_or(TrapKind::OperandMismatch)?;
        self.stack.drain(label.height..keep);
        if label.is_loop {
            self.check_cancelled()?;
            self.labels.truncate(idx + 1);
        } else {
            self.labels.truncate(idx);
        }
        Ok(Flow::Jump(label.cont))
    }

    fn call(&mut self, func: u32) -> Result<Flow, TrapKind> {
        if func >= self.module.num_imported_funcs {
            return Ok(Flow::Call(func));
        }
        self.check_cancelled()?;
        let params = self
            .module
            .func_type(func)
            .map(|ty| ty.params.len())
            .ok_or(TrapKind::OperandMismatch)?;
        let start = self
            .stack
            .len()
            .checked_sub(params)
            .ok_or(TrapKind::OperandMismatch)?;
        let args = self.stack.split_off(start);
        let results = self.call_host(func, &args)?;
        self.stack.extend(results);
        Ok(Flow::Next)
    }

    fn call_indirect(&mut self, type_index: u32) -> Result<Flow, TrapKind> {
        let slot = self.pop_i32()? as u32;
        let func = match self.table.get(slot as usize) {
            None => return Err(TrapKind::UndefinedElement),
            Some(None) => return Err(TrapKind::UninitializedElement),
            Some(Some(func)) => *func,
        };
        let expected = self.module.signature(type_index);
        let actual = self.module.func_type(func);
        if expected.is_none() || expected != actual {
            return Err(TrapKind::IndirectCallTypeMismatch);
        }
        self.call(func)
    }

    fn load(&mut self, op: LoadOp, addr: u32, offset: u32) -> Result<Value, TrapKind> {
        let mem = self.memory()?;
        Ok(match op {
            LoadOp::I32Load => Value::I32(i32::from_le_bytes(mem.load(addr, offset)?)),
            LoadOp::I64Load => Value::I64(i64::from_le_bytes(mem.load(addr, offset)?)),
            LoadOp::F32Load => Value::F32(f32::from_le_bytes(mem.load(addr, offset)?)),
            LoadOp::F64Load => Value::F64(f64::from_le_bytes(mem.load(addr, offset)?)),
            LoadOp::I32Load8S => Value::I32(i32::from(i8::from_le_bytes(mem.load(addr, offset)?))),
            LoadOp::I32Load8U => Value::I32(i32::from(u8::from_le_bytes(mem.load(addr, offset)?))),
            LoadOp::I32Load16S => {
                Value::I32(i32::from(i16::from_le_bytes(mem.load(addr, offset)?)))
            }
            LoadOp::I32Load16U => {
                Value::I32(i32::from(u16::from_le_bytes(mem.load(addr, offset)?)))
            }
            LoadOp::I64Load8S => Value::I64(i64::from(i8::from_le_bytes(mem.load(addr, offset)?))),
            LoadOp::I64Load8U => Value::I64(i64::from(u8::from_le_bytes(mem.load(addr, offset)?))),
            LoadOp::I64Load16S => {
                Value::I64(i64::from(i16::from_le_bytes(mem.load(addr, offset)?)))
            }
            LoadOp::I64Load16U => {
                Value::I64(i64::from(u16::from_le_bytes(mem.load(addr, offset)?)))
            }
            LoadOp::I64Load32S => {
                Value::I64(i64::from(i32::from_le_bytes(mem.load(addr, offset)?)))
            }
            LoadOp::I64Load32U => {
                Value::I64(i64::from(u32::from_le_bytes(mem.load(addr, offset)?)))
            }
        })
    }

    fn store(&mut self, op: StoreOp, addr: u32, offset: u32, value: Value) -> Result<(), TrapKind> {
        let mem = self.memory()?;
        match (op, value) {
            (StoreOp::I32Store, Value::I32(v)) => mem.store(addr, offset, &v.to_le_bytes()),
            (StoreOp::I64Store, Value::I64(v)) => mem.store(addr, offset, &v.to_le_bytes()),
            (StoreOp::F32Store, Value::F32(v)) => mem.store(addr, offset, &v.to_le_bytes()),
            (StoreOp::F64Store, Value::F64(v)) => mem.store(addr, offset, &v.to_le_bytes()),
            (StoreOp::I32Store8, Value::I32(v)) => mem.store(addr, offset, &[v as u8]),
            (StoreOp::I32Store16, Value::I32(v)) => {
                mem.store(addr, offset, &(v as u16).to_le_bytes())
            }
            (StoreOp::I64Store8, Value::I64(v)) => mem.store(addr, offset, &[v as u8]),
            (StoreOp::I64Store16, Value::I64(v)) => {
                mem.store(addr, offset, &(v as u16).to_le_bytes())
            }
            (StoreOp::I64Store32, Value::I64(v)) => {
                mem.store(addr, offset, &(v as u32).to_le_bytes())
            }
            _ => Err(TrapKind::OperandMismatch),
        }
    }

    fn step(&mut self, instr: &Instr, pc: usize) -> Result<Flow, TrapKind> {
        match instr {
            Instr::Unreachable => return Err(TrapKind::Unreachable),
            Instr::Nop => {}
            Instr::Block { ty, end } => self.enter_block(*ty, *end as usize + 1, false)?,
            Instr::Loop { ty } => {
                self.check_cancelled()?;
                self.enter_block(*ty, pc + 1, true)?;
            }
            Instr::If { ty, else_at, end } => {
                let cond = self.pop_i32()?;
                if cond != 0 {
                    self.enter_block(*ty, *end as usize + 1, false)?;
                } else if let Some(else_at) = else_at {
                    self.enter_block(*ty, *end as usize + 1, false)?;
                    return Ok(Flow::Jump(*else_at as usize + 1));
                } else {
                    return Ok(Flow::Jump(*end as usize + 1));
                }
            }
            // End of the `then` arm: skip to the `End`, which pops the label
            Instr::Else { end } => return Ok(Flow::Jump(*end as usize)),
            Instr::End => {
                if self.labels.len() > self.frame()?.label_base {
                    self.labels.pop();
                } else {
                    return Ok(Flow::Return);
                }
            }
            Instr::Br(depth) => return self.branch(*depth),
            Instr::BrIf(depth) => {
                if self.pop_i32()? != 0 {
                    return self.branch(*depth);
                }
            }
            Instr::BrTable { targets, default } => {
                let idx = self.pop_i32()? as u32 as usize;
                let depth = targets.get(idx).copied().unwrap_or(*default);
                return self.branch(depth);
            }
            Instr::Return => return Ok(Flow::Return),
            Instr::Call(func) => return self.call(*func),
            Instr::CallIndirect(type_index) => return self.call_indirect(*type_index),
            Instr::Drop => {
                self.pop()?;
            }
            Instr::Select(_) => {
                let cond = self.pop_i32()?;
                let second = self.pop()?;
                let first = self.pop()?;
                self.stack.push(if cond != 0 { first } else { second });
            }
            Instr::LocalGet(idx) => {
                let at = self.frame()?.locals_base + *idx as usize;
                let value = *self.locals.get(at).ok_or(TrapKind::OperandMismatch)?;
                self.stack.push(value);
            }
            Instr::LocalSet(idx) | Instr::LocalTee(idx) => {
                let at = self.frame()?.locals_base + *idx as usize;
                let value = if matches!(instr, Instr::LocalTee(_)) {
                    *self.stack.last().ok_or(TrapKind::OperandMismatch)?
                } else {
                    self.pop()?
                };
                *self.locals.get_mut(at).ok_or(TrapKind::OperandMismatch)? = value;
            }
            Instr::GlobalGet(idx) => {
                let value = *self
                    .globals
                    .get(*idx as usize)
                    .ok_or(TrapKind::OperandMismatch)?;
                self.stack.push(value);
            }
            Instr::GlobalSet(idx) => {
                let value = self.pop()?;
                *self
                    .globals
                    .get_mut(*idx as usize)
                    .ok_or(TrapKind::OperandMismatch)? = value;
            }
            Instr::Load(op, memarg) => {
                let addr = self.pop_i32()? as u32;
                let value = self.load(*op, addr, memarg.offset)?;
                self.stack.push(value);
            }
            Instr::Store(op, memarg) => {
                let value = self.pop()?;
                let addr = self.pop_i32()? as u32;
                self.store(*op, addr, memarg.offset, value)?;
            }
            Instr::MemorySize => {
                let pages = self.memory()?.size_pages();
                self.stack.push(Value::I32(pages as i32));
            }
            Instr::MemoryGrow => {
                let delta = self.pop_i32()? as u32;
                let old = self.memory()?.grow(delta);
                self.stack.push(Value::I32(old.map_or(-1, |p| p as i32)));
            }
            Instr::I32Const(v) => self.stack.push(Value::I32(*v)),
            Instr::I64Const(v) => self.stack.push(Value::I64(*v)),
            Instr::F32Const(v) => self.stack.push(Value::F32(*v)),
            Instr::F64Const(v) => self.stack.push(Value::F64(*v)),
            Instr::Num(op) => {
                let result = if op.signature().arity == 1 {
                    let v = self.pop()?;
                    numeric::unary(*op, v)?
                } else {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    numeric::binary(*op, a, b)?
                };
                self.stack.push(result);
            }
        }
        Ok(Flow::Next)
    }
}
