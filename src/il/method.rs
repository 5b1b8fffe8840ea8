use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use log::debug;

use crate::delegate::Signature;
use crate::il::value::{Value, ValueType};
use crate::il::{BodyError, Instr, Label, MethodBody, NativeFn, OpCode, Operand};

/// A resolved instruction, branch targets being indices into the code
#[derive(Clone, Debug)]
pub(crate) enum Op {
    Simple(OpCode),
    Ldc(Value),
    Ldarg(u16),
    Starg(u16),
    Ldloc(u16),
    Stloc(u16),
    Br(usize),
    Brtrue(usize),
    Brfalse(usize),
    CallNative(NativeFn),
    CallMethod(MethodRef),
    CallDelegate(Signature),
}

/// An immutable, executable method
pub struct Method {
    name: String,
    signature: Signature,
    locals: Vec<ValueType>,
    code: Vec<Op>,
}

impl Method {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn locals(&self) -> &[ValueType] {
        &self.locals
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub(crate) fn code(&self) -> &[Op] {
        &self.code
    }

    /// Rebuild an editable body, creating one label per distinct branch
    /// target.
    pub fn to_body(&self) -> MethodBody {
        let mut body = MethodBody::new(self.name.clone(), self.signature.clone());
        body.locals = self.locals.clone();
        let targets: BTreeSet<usize> = self
            .code
            .iter()
            .filter_map(|op| match op {
                Op::Br(target) | Op::Brtrue(target) | Op::Brfalse(target) => Some(*target),
                _ => None,
            })
            .collect();
        let labels: BTreeMap<usize, Label> = targets
            .into_iter()
            .map(|target| (target, body.define_label()))
            .collect();
        for op in &self.code {
            let instr = match op {
                Op::Simple(opcode) => Instr::simple(*opcode),
                Op::Ldc(value) => Instr::new(OpCode::Ldc, value.clone()),
                Op::Ldarg(i) => Instr::new(OpCode::Ldarg, *i),
                Op::Starg(i) => Instr::new(OpCode::Starg, *i),
                Op::Ldloc(i) => Instr::new(OpCode::Ldloc, *i),
                Op::Stloc(i) => Instr::new(OpCode::Stloc, *i),
                Op::Br(target) => Instr::new(OpCode::Br, &labels[target]),
                Op::Brtrue(target) => Instr::new(OpCode::Brtrue, &labels[target]),
                Op::Brfalse(target) => Instr::new(OpCode::Brfalse, &labels[target]),
                Op::CallNative(native) => Instr::new(OpCode::Call, *native),
                Op::CallMethod(method) => Instr::new(OpCode::Call, method.clone()),
                Op::CallDelegate(signature) => Instr::new(OpCode::Callvirt, signature.clone()),
            };
            body.push(instr);
        }
        for (target, label) in &labels {
            label.set_target(body.get(*target).cloned());
        }
        body
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_body())
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Method({} {})", self.name, self.signature)
    }
}

pub(crate) fn write_header(
    f: &mut fmt::Formatter,
    name: &str,
    signature: &Signature,
    locals: &[ValueType],
) -> fmt::Result {
    write!(f, ".method {}", name)?;
    let params: Vec<_> = signature.params.iter().map(|p| p.name()).collect();
    writeln!(f, "({}) -> {}", params.join(", "), signature.ret)?;
    if !locals.is_empty() {
        let locals: Vec<_> = locals.iter().map(|l| l.name()).collect();
        writeln!(f, ".locals {}", locals.join(" "))?;
    }
    Ok(())
}

/// Shared reference to a generated method
#[derive(Clone)]
pub struct MethodRef(Arc<Method>);

impl MethodRef {
    pub fn ptr_eq(&self, other: &MethodRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Deref for MethodRef {
    type Target = Method;

    fn deref(&self) -> &Method {
        &self.0
    }
}

impl fmt::Debug for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl fmt::Display for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl MethodBody {
    /// Validate the stream and freeze it into an executable method.
    pub fn generate(&self) -> Result<MethodRef, BodyError> {
        if self.signature.arity() > usize::from(u16::MAX) {
            return Err(BodyError::TooManyParams {
                name: self.name.clone(),
                count: self.signature.arity(),
            });
        }
        let mut code = Vec::with_capacity(self.len());
        for instr in self.instrs() {
            self.check(instr)?;
            let op = match (instr.opcode(), instr.operand()) {
                (OpCode::Ldc, Operand::Const(value)) => Op::Ldc(value.clone()),
                (OpCode::Ldarg, Operand::Index(i)) => Op::Ldarg(*i),
                (OpCode::Starg, Operand::Index(i)) => Op::Starg(*i),
                (OpCode::Ldloc, Operand::Index(i)) => Op::Ldloc(*i),
                (OpCode::Stloc, Operand::Index(i)) => Op::Stloc(*i),
                (OpCode::Br, Operand::Label(label)) => Op::Br(self.label_index(label)?),
                (OpCode::Brtrue, Operand::Label(label)) => Op::Brtrue(self.label_index(label)?),
                (OpCode::Brfalse, Operand::Label(label)) => Op::Brfalse(self.label_index(label)?),
                (OpCode::Call, Operand::Native(native)) => Op::CallNative(*native),
                (OpCode::Call, Operand::Method(method)) => Op::CallMethod(method.clone()),
                (OpCode::Callvirt, Operand::Delegate(signature)) => {
                    Op::CallDelegate(signature.clone())
                }
                (opcode, _) => Op::Simple(opcode),
            };
            code.push(op);
        }
        debug!("generated {} ({} instructions)", self.name, code.len());
        Ok(MethodRef(Arc::new(Method {
            name: self.name.clone(),
            signature: self.signature.clone(),
            locals: self.locals.clone(),
            code,
        })))
    }
}
