//! Instruction model: opcodes, operands, labels and editable method bodies.
use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use thiserror::Error;

use crate::delegate::Signature;
use crate::il::value::{Value, ValueType};
use crate::vm::VmError;

pub(crate) mod method;
pub mod reader;
pub mod value;

pub use self::method::{Method, MethodRef};

macro_rules! opcodes {
    ($($variant:ident $name:literal $kind:ident,)*) => {
        #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
        pub enum OpCode {
            $($variant,)*
        }

        impl OpCode {
            pub fn name(self) -> &'static str {
                match self {
                    $(OpCode::$variant => $name,)*
                }
            }

            pub fn from_name(name: &str) -> Option<OpCode> {
                match name {
                    $($name => Some(OpCode::$variant),)*
                    _ => None,
                }
            }

            pub fn operand_kind(self) -> OperandKind {
                match self {
                    $(OpCode::$variant => OperandKind::$kind,)*
                }
            }
        }
    };
}

opcodes! {
    Nop "nop" None,
    Ldc "ldc" Const,
    Ldarg "ldarg" Arg,
    Starg "starg" Arg,
    Ldloc "ldloc" Local,
    Stloc "stloc" Local,
    Dup "dup" None,
    Pop "pop" None,
    Add "add" None,
    Sub "sub" None,
    Mul "mul" None,
    Div "div" None,
    Rem "rem" None,
    Neg "neg" None,
    Not "not" None,
    Ceq "ceq" None,
    Clt "clt" None,
    Cgt "cgt" None,
    Br "br" Label,
    Brtrue "brtrue" Label,
    Brfalse "brfalse" Label,
    Call "call" Call,
    Callvirt "callvirt" Delegate,
    Ret "ret" None,
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The kind of operand an opcode takes
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OperandKind {
    None,
    Const,
    Arg,
    Local,
    Label,
    /// A native function or a method
    Call,
    /// The signature of the delegate being invoked
    Delegate,
}

/// Host data a native function is bound to when it is emitted
pub type NativeState = &'static (dyn Any + Send + Sync);

/// A host function callable from generated code
#[derive(Copy, Clone)]
pub struct NativeFn {
    pub name: &'static str,
    pub owner: &'static str,
    pub params: &'static [ValueType],
    pub ret: ValueType,
    pub state: NativeState,
    pub func: fn(NativeState, Vec<Value>) -> Result<Value, VmError>,
}

impl NativeFn {
    pub fn call(&self, args: Vec<Value>) -> Result<Value, VmError> {
        (self.func)(self.state, args)
    }

    pub fn signature(&self) -> Signature {
        Signature::new(self.params.to_vec(), self.ret)
    }

    pub fn full_name(&self) -> String {
        format!("{}::{}", self.owner, self.name)
    }
}

impl fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "NativeFn({})", self.full_name())
    }
}

#[derive(Clone, Debug)]
pub enum Operand {
    None,
    Const(Value),
    Index(u16),
    Label(Label),
    Native(NativeFn),
    Method(MethodRef),
    Delegate(Signature),
}

impl Operand {
    pub fn kind(&self) -> OperandKind {
        match self {
            Operand::None => OperandKind::None,
            Operand::Const(_) => OperandKind::Const,
            Operand::Index(_) => OperandKind::Arg,
            Operand::Label(_) => OperandKind::Label,
            Operand::Native(_) | Operand::Method(_) => OperandKind::Call,
            Operand::Delegate(_) => OperandKind::Delegate,
        }
    }

    fn fits(&self, kind: OperandKind) -> bool {
        match (self, kind) {
            (Operand::Index(_), OperandKind::Arg | OperandKind::Local) => true,
            _ => self.kind() == kind,
        }
    }
}

impl From<Value> for Operand {
    fn from(value: Value) -> Self {
        Operand::Const(value)
    }
}

impl From<u16> for Operand {
    fn from(index: u16) -> Self {
        Operand::Index(index)
    }
}

impl From<Label> for Operand {
    fn from(label: Label) -> Self {
        Operand::Label(label)
    }
}

impl From<&Label> for Operand {
    fn from(label: &Label) -> Self {
        Operand::Label(label.clone())
    }
}

impl From<NativeFn> for Operand {
    fn from(native: NativeFn) -> Self {
        Operand::Native(native)
    }
}

impl From<MethodRef> for Operand {
    fn from(method: MethodRef) -> Self {
        Operand::Method(method)
    }
}

impl From<Signature> for Operand {
    fn from(signature: Signature) -> Self {
        Operand::Delegate(signature)
    }
}

impl From<()> for Operand {
    fn from(_: ()) -> Self {
        Operand::None
    }
}

struct InstrData {
    opcode: OpCode,
    operand: Operand,
}

/// An instruction node. Instructions compare by identity, so the same node
/// can be located in a stream regardless of edits around it.
#[derive(Clone)]
pub struct Instr(Rc<InstrData>);

impl Instr {
    pub fn new(opcode: OpCode, operand: impl Into<Operand>) -> Self {
        Instr(Rc::new(InstrData {
            opcode,
            operand: operand.into(),
        }))
    }

    pub fn simple(opcode: OpCode) -> Self {
        Self::new(opcode, Operand::None)
    }

    pub fn opcode(&self) -> OpCode {
        self.0.opcode
    }

    pub fn operand(&self) -> &Operand {
        &self.0.operand
    }

    pub fn ptr_eq(&self, other: &Instr) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn is(&self, opcode: OpCode) -> bool {
        self.opcode() == opcode
    }

    pub fn match_ldc_int(&self, value: i64) -> bool {
        matches!(
            (self.opcode(), self.operand()),
            (OpCode::Ldc, Operand::Const(Value::Int(n))) if *n == value
        )
    }

    pub fn match_ldarg(&self, index: u16) -> bool {
        matches!(
            (self.opcode(), self.operand()),
            (OpCode::Ldarg, Operand::Index(i)) if *i == index
        )
    }

    pub fn match_ldloc(&self, index: u16) -> bool {
        matches!(
            (self.opcode(), self.operand()),
            (OpCode::Ldloc, Operand::Index(i)) if *i == index
        )
    }

    pub fn match_stloc(&self, index: u16) -> bool {
        matches!(
            (self.opcode(), self.operand()),
            (OpCode::Stloc, Operand::Index(i)) if *i == index
        )
    }

    /// Matches a `call` of a method or native function named `name`.
    pub fn match_call(&self, name: &str) -> bool {
        match (self.opcode(), self.operand()) {
            (OpCode::Call, Operand::Method(method)) => method.name() == name,
            (OpCode::Call, Operand::Native(native)) => native.name == name,
            _ => false,
        }
    }

    pub fn match_branch_to(&self, label: &Label) -> bool {
        match self.operand() {
            Operand::Label(target) => target.ptr_eq(label),
            _ => false,
        }
    }
}

impl PartialEq for Instr {
    fn eq(&self, other: &Instr) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Instr {}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.opcode())?;
        match self.operand() {
            Operand::None => Ok(()),
            Operand::Const(value) => write!(f, " {}", value),
            Operand::Index(i) => write!(f, " {}", i),
            Operand::Label(label) => write!(f, " {}", label),
            Operand::Native(native) => write!(f, " {}", native.full_name()),
            Operand::Method(method) => write!(f, " {}", method.name()),
            Operand::Delegate(signature) => write!(f, " {}", signature),
        }
    }
}

impl fmt::Debug for Instr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Instr({})", self)
    }
}

struct LabelData {
    id: usize,
    target: RefCell<Option<Instr>>,
}

/// A jump target. A label without a target instruction points at the end of
/// the stream.
#[derive(Clone)]
pub struct Label(Rc<LabelData>);

impl Label {
    pub fn id(&self) -> usize {
        self.0.id
    }

    pub fn target(&self) -> Option<Instr> {
        self.0.target.borrow().clone()
    }

    pub fn set_target(&self, target: Option<Instr>) {
        *self.0.target.borrow_mut() = target;
    }

    pub fn targets(&self, instr: Option<&Instr>) -> bool {
        match (&*self.0.target.borrow(), instr) {
            (Some(target), Some(instr)) => target.ptr_eq(instr),
            (None, None) => true,
            _ => false,
        }
    }

    pub fn ptr_eq(&self, other: &Label) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "L{}", self.id())
    }
}

impl fmt::Debug for Label {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Label({})", self)
    }
}

#[derive(Debug, Error)]
pub enum BodyError {
    #[error("{name}: `{opcode}` does not take a {found:?} operand")]
    OperandMismatch {
        name: String,
        opcode: OpCode,
        found: OperandKind,
    },
    #[error("{name}: argument {index} out of range ({count} parameters)")]
    ArgOutOfRange { name: String, index: u16, count: usize },
    #[error("{name}: local {index} out of range ({count} locals)")]
    LocalOutOfRange { name: String, index: u16, count: usize },
    #[error("{name}: label {label} is not defined in this body")]
    ForeignLabel { name: String, label: String },
    #[error("{name}: label {label} targets an instruction outside the stream")]
    DanglingLabel { name: String, label: String },
    #[error("{name}: too many parameters ({count})")]
    TooManyParams { name: String, count: usize },
}

/// An editable instruction stream together with the method's signature
pub struct MethodBody {
    pub name: String,
    pub signature: Signature,
    pub locals: Vec<ValueType>,
    instrs: Vec<Instr>,
    labels: Vec<Label>,
}

impl MethodBody {
    pub fn new(name: impl Into<String>, signature: Signature) -> Self {
        MethodBody {
            name: name.into(),
            signature,
            locals: vec![],
            instrs: vec![],
            labels: vec![],
        }
    }

    pub fn instrs(&self) -> &[Instr] {
        &self.instrs
    }

    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Instr> {
        self.instrs.get(index)
    }

    pub fn index_of(&self, instr: &Instr) -> Option<usize> {
        self.instrs.iter().position(|i| i.ptr_eq(instr))
    }

    /// Position of `instr` in stream order, `None` standing for the end of
    /// the stream. Instructions not in the stream also sort at the end.
    pub fn position(&self, instr: Option<&Instr>) -> usize {
        instr
            .and_then(|instr| self.index_of(instr))
            .unwrap_or(self.instrs.len())
    }

    pub fn insert(&mut self, index: usize, instr: Instr) {
        self.instrs.insert(index, instr);
    }

    pub fn push(&mut self, instr: Instr) {
        self.instrs.push(instr);
    }

    pub fn emit(&mut self, opcode: OpCode, operand: impl Into<Operand>) -> &mut Self {
        self.push(Instr::new(opcode, operand));
        self
    }

    pub fn remove(&mut self, index: usize) -> Instr {
        self.instrs.remove(index)
    }

    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    pub fn define_label(&mut self) -> Label {
        let label = Label(Rc::new(LabelData {
            id: self.labels.len(),
            target: RefCell::new(None),
        }));
        self.labels.push(label.clone());
        label
    }

    pub fn incoming_labels(&self, instr: Option<&Instr>) -> Vec<Label> {
        self.labels
            .iter()
            .filter(|label| label.targets(instr))
            .cloned()
            .collect()
    }

    fn check(&self, instr: &Instr) -> Result<(), BodyError> {
        let opcode = instr.opcode();
        let operand = instr.operand();
        if !operand.fits(opcode.operand_kind()) {
            return Err(BodyError::OperandMismatch {
                name: self.name.clone(),
                opcode,
                found: operand.kind(),
            });
        }
        match (opcode.operand_kind(), operand) {
            (OperandKind::Arg, Operand::Index(index)) => {
                if usize::from(*index) >= self.signature.arity() {
                    return Err(BodyError::ArgOutOfRange {
                        name: self.name.clone(),
                        index: *index,
                        count: self.signature.arity(),
                    });
                }
            }
            (OperandKind::Local, Operand::Index(index)) => {
                if usize::from(*index) >= self.locals.len() {
                    return Err(BodyError::LocalOutOfRange {
                        name: self.name.clone(),
                        index: *index,
                        count: self.locals.len(),
                    });
                }
            }
            (_, Operand::Label(label)) => {
                if !self.labels.iter().any(|l| l.ptr_eq(label)) {
                    return Err(BodyError::ForeignLabel {
                        name: self.name.clone(),
                        label: label.to_string(),
                    });
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn label_index(&self, label: &Label) -> Result<usize, BodyError> {
        match label.target() {
            None => Ok(self.instrs.len()),
            Some(target) => self.index_of(&target).ok_or_else(|| BodyError::DanglingLabel {
                name: self.name.clone(),
                label: label.to_string(),
            }),
        }
    }
}

impl fmt::Display for MethodBody {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        method::write_header(f, &self.name, &self.signature, &self.locals)?;
        for instr in &self.instrs {
            for label in self.incoming_labels(Some(instr)) {
                writeln!(f, "{}:", label)?;
            }
            writeln!(f, "    {}", instr)?;
        }
        for label in self.incoming_labels(None) {
            writeln!(f, "{}:", label)?;
        }
        Ok(())
    }
}
