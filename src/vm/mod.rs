//! Interpreter for generated methods.
use log::trace;
use thiserror::Error;

use crate::delegate::Signature;
use crate::il::method::Op;
use crate::il::value::{Value, ValueType};
use crate::il::{MethodRef, OpCode};
use crate::refstore::Handle;

#[cfg(test)]
pub mod test_util;

#[derive(Debug, Error)]
pub enum VmError {
    #[error("operand stack underflow")]
    StackUnderflow,
    #[error("operand stack limit of {0} values exceeded")]
    StackOverflow(usize),
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: ValueType,
        found: ValueType,
    },
    #[error("integer {value} out of range for {target}")]
    IntOutOfRange { value: i64, target: &'static str },
    #[error("{callee} expects {expected} arguments, got {found}")]
    ArityMismatch {
        callee: String,
        expected: usize,
        found: usize,
    },
    #[error("division by zero")]
    DivideByZero,
    #[error("invalid reference handle {0}")]
    InvalidHandle(Handle),
    #[error("call depth limit of {0} exceeded")]
    CallDepthExceeded(usize),
    #[error("control fell off the end of {0}")]
    FellOffEnd(String),
    #[error("{method} returned with {depth} values on the stack")]
    UnbalancedReturn { method: String, depth: usize },
}

pub struct Options {
    pub max_call_depth: usize,
    pub max_stack: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            max_call_depth: 256,
            max_stack: 1024,
        }
    }
}

pub struct Interpreter {
    options: Options,
    depth: usize,
}

struct Frame {
    args: Vec<Value>,
    locals: Vec<Value>,
    stack: Vec<Value>,
    max_stack: usize,
}

impl Frame {
    fn push(&mut self, value: Value) -> Result<(), VmError> {
        if self.stack.len() == self.max_stack {
            return Err(VmError::StackOverflow(self.max_stack));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, VmError> {
        self.stack.pop().ok_or(VmError::StackUnderflow)
    }

    fn pop_args(&mut self, count: usize) -> Result<Vec<Value>, VmError> {
        if self.stack.len() < count {
            return Err(VmError::StackUnderflow);
        }
        Ok(self.stack.split_off(self.stack.len() - count))
    }

    fn pop_condition(&mut self) -> Result<bool, VmError> {
        match self.pop()? {
            Value::Bool(b) => Ok(b),
            Value::Int(n) => Ok(n != 0),
            other => Err(other.mismatch(ValueType::Bool)),
        }
    }
}

impl Interpreter {
    pub fn new(options: Options) -> Self {
        Interpreter { options, depth: 0 }
    }

    pub fn invoke(&mut self, method: &MethodRef, args: Vec<Value>) -> Result<Value, VmError> {
        if self.depth == self.options.max_call_depth {
            return Err(VmError::CallDepthExceeded(self.options.max_call_depth));
        }
        method.signature().check_args(method.name(), &args)?;
        self.depth += 1;
        let result = self.run(method, args);
        self.depth -= 1;
        result
    }

    fn run(&mut self, method: &MethodRef, args: Vec<Value>) -> Result<Value, VmError> {
        let mut frame = Frame {
            args,
            locals: method.locals().iter().map(|ty| ty.default_value()).collect(),
            stack: vec![],
            max_stack: self.options.max_stack,
        };
        let code = method.code();
        let mut pc = 0;
        loop {
            let op = code
                .get(pc)
                .ok_or_else(|| VmError::FellOffEnd(method.name().into()))?;
            trace!("{}[{}]: {:?}", method.name(), pc, op);
            pc += 1;
            match op {
                Op::Ldc(value) => frame.push(value.clone())?,
                Op::Ldarg(i) => {
                    let value = frame.args[usize::from(*i)].clone();
                    frame.push(value)?;
                }
                Op::Starg(i) => {
                    let value = frame.pop()?;
                    frame.args[usize::from(*i)] = value;
                }
                Op::Ldloc(i) => {
                    let value = frame.locals[usize::from(*i)].clone();
                    frame.push(value)?;
                }
                Op::Stloc(i) => {
                    let value = frame.pop()?;
                    frame.locals[usize::from(*i)] = value;
                }
                Op::Br(target) => pc = *target,
                Op::Brtrue(target) => {
                    if frame.pop_condition()? {
                        pc = *target;
                    }
                }
                Op::Brfalse(target) => {
                    if !frame.pop_condition()? {
                        pc = *target;
                    }
                }
                Op::CallNative(native) => {
                    let args = frame.pop_args(native.params.len())?;
                    native.signature().check_args(native.name, &args)?;
                    let result = native.call(args)?;
                    push_result(&mut frame, native.ret, result)?;
                }
                Op::CallMethod(callee) => {
                    let args = frame.pop_args(callee.signature().arity())?;
                    let result = self.invoke(callee, args)?;
                    push_result(&mut frame, callee.signature().ret, result)?;
                }
                Op::CallDelegate(signature) => {
                    let result = call_delegate(&mut frame, signature)?;
                    push_result(&mut frame, signature.ret, result)?;
                }
                Op::Simple(OpCode::Ret) => return self.ret(method, frame),
                Op::Simple(opcode) => simple(&mut frame, *opcode)?,
            }
        }
    }

    fn ret(&self, method: &MethodRef, mut frame: Frame) -> Result<Value, VmError> {
        let ret = method.signature().ret;
        let expected = if ret == ValueType::Void { 0 } else { 1 };
        if frame.stack.len() != expected {
            return Err(VmError::UnbalancedReturn {
                method: method.name().into(),
                depth: frame.stack.len(),
            });
        }
        let value = frame.stack.pop().unwrap_or(Value::Void);
        if !ret.accepts(value.value_type()) {
            return Err(value.mismatch(ret));
        }
        Ok(value)
    }
}

impl MethodRef {
    /// Run this method on a fresh interpreter with default options.
    pub fn invoke(&self, args: Vec<Value>) -> Result<Value, VmError> {
        Interpreter::new(Options::default()).invoke(self, args)
    }
}

fn push_result(frame: &mut Frame, ret: ValueType, result: Value) -> Result<(), VmError> {
    if ret == ValueType::Void {
        Ok(())
    } else {
        frame.push(result)
    }
}

// The delegate sits below its arguments.
fn call_delegate(frame: &mut Frame, signature: &Signature) -> Result<Value, VmError> {
    let args = frame.pop_args(signature.arity())?;
    let delegate = match frame.pop()? {
        Value::Delegate(delegate) => delegate,
        other => return Err(other.mismatch(ValueType::Delegate)),
    };
    let actual = delegate.signature();
    if actual.arity() != signature.arity() {
        return Err(VmError::ArityMismatch {
            callee: delegate.name().into(),
            expected: actual.arity(),
            found: signature.arity(),
        });
    }
    delegate.invoke(args)
}

fn simple(frame: &mut Frame, opcode: OpCode) -> Result<(), VmError> {
    use crate::il::OpCode::*;

    match opcode {
        Nop => {}
        Dup => {
            let value = frame.pop()?;
            frame.push(value.clone())?;
            frame.push(value)?;
        }
        Pop => {
            frame.pop()?;
        }
        Add | Sub | Mul | Div | Rem => {
            let b = frame.pop()?;
            let a = frame.pop()?;
            let result = match (a, b) {
                (Value::Int(a), Value::Int(b)) => Value::Int(int_arith(opcode, a, b)?),
                (Value::Float(a), Value::Float(b)) => Value::Float(float_arith(opcode, a, b)),
                (Value::Int(_), other) => return Err(other.mismatch(ValueType::Int)),
                (Value::Float(_), other) => return Err(other.mismatch(ValueType::Float)),
                (other, _) => return Err(other.mismatch(ValueType::Int)),
            };
            frame.push(result)?;
        }
        Neg => {
            let result = match frame.pop()? {
                Value::Int(n) => Value::Int(n.wrapping_neg()),
                Value::Float(x) => Value::Float(-x),
                other => return Err(other.mismatch(ValueType::Int)),
            };
            frame.push(result)?;
        }
        Not => {
            let result = match frame.pop()? {
                Value::Bool(b) => Value::Bool(!b),
                Value::Int(n) => Value::Int(!n),
                other => return Err(other.mismatch(ValueType::Bool)),
            };
            frame.push(result)?;
        }
        Ceq => {
            let b = frame.pop()?;
            let a = frame.pop()?;
            frame.push(Value::Bool(a == b))?;
        }
        Clt | Cgt => {
            let b = frame.pop()?;
            let a = frame.pop()?;
            let ordering = match (a, b) {
                (Value::Int(a), Value::Int(b)) => a.partial_cmp(&b),
                (Value::Float(a), Value::Float(b)) => a.partial_cmp(&b),
                (Value::Int(_), other) => return Err(other.mismatch(ValueType::Int)),
                (Value::Float(_), other) => return Err(other.mismatch(ValueType::Float)),
                (other, _) => return Err(other.mismatch(ValueType::Int)),
            };
            let wanted = if opcode == Clt {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Greater
            };
            frame.push(Value::Bool(ordering == Some(wanted)))?;
        }
        _ => unreachable!("`{}` is not a simple opcode", opcode),
    }
    Ok(())
}

fn int_arith(opcode: OpCode, a: i64, b: i64) -> Result<i64, VmError> {
    let result = match opcode {
        OpCode::Add => a.wrapping_add(b),
        OpCode::Sub => a.wrapping_sub(b),
        OpCode::Mul => a.wrapping_mul(b),
        OpCode::Div | OpCode::Rem if b == 0 => return Err(VmError::DivideByZero),
        OpCode::Div => a.wrapping_div(b),
        _ => a.wrapping_rem(b),
    };
    Ok(result)
}

fn float_arith(opcode: OpCode, a: f64, b: f64) -> f64 {
    match opcode {
        OpCode::Add => a + b,
        OpCode::Sub => a - b,
        OpCode::Mul => a * b,
        OpCode::Div => a / b,
        _ => a % b,
    }
}
