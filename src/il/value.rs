use std::any::Any;
use std::fmt;
use std::sync::Arc;

use num_traits::NumCast;

use crate::delegate::DelegateRef;
use crate::il::MethodRef;
use crate::vm::VmError;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ValueType {
    Void,
    Int,
    Float,
    Bool,
    Str,
    Object,
    Delegate,
    Method,
    /// Accepts a value of any type
    Any,
}

impl ValueType {
    pub fn name(self) -> &'static str {
        use self::ValueType::*;
        match self {
            Void => "void",
            Int => "int",
            Float => "float",
            Bool => "bool",
            Str => "str",
            Object => "object",
            Delegate => "delegate",
            Method => "method",
            Any => "any",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        use self::ValueType::*;
        let ty = match name {
            "void" => Void,
            "int" => Int,
            "float" => Float,
            "bool" => Bool,
            "str" => Str,
            "object" => Object,
            "delegate" => Delegate,
            "method" => Method,
            "any" => Any,
            _ => return None,
        };
        Some(ty)
    }

    /// Whether a value of type `other` may be used where `self` is expected.
    pub fn accepts(self, other: ValueType) -> bool {
        self == ValueType::Any || self == other
    }

    /// The value a local of this type starts out with.
    pub fn default_value(self) -> Value {
        match self {
            ValueType::Int => Value::Int(0),
            ValueType::Float => Value::Float(0.0),
            ValueType::Bool => Value::Bool(false),
            ValueType::Str => Value::Str(Arc::from("")),
            _ => Value::Void,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A value on the operand stack, in an argument or local slot, or stored in
/// a reference table.
#[derive(Clone)]
pub enum Value {
    Void,
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(Arc<str>),
    Object(Arc<dyn Any + Send + Sync>),
    Delegate(DelegateRef),
    Method(MethodRef),
}

impl Value {
    pub fn object<T: Any + Send + Sync>(value: T) -> Self {
        Value::Object(Arc::new(value))
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Void => ValueType::Void,
            Value::Int(_) => ValueType::Int,
            Value::Float(_) => ValueType::Float,
            Value::Bool(_) => ValueType::Bool,
            Value::Str(_) => ValueType::Str,
            Value::Object(_) => ValueType::Object,
            Value::Delegate(_) => ValueType::Delegate,
            Value::Method(_) => ValueType::Method,
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Value::Object(object) => object.downcast_ref(),
            _ => None,
        }
    }

    pub(crate) fn mismatch(&self, expected: ValueType) -> VmError {
        VmError::TypeMismatch {
            expected,
            found: self.value_type(),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        use self::Value::*;
        match (self, other) {
            (Void, Void) => true,
            (Int(a), Int(b)) => a == b,
            (Float(a), Float(b)) => a == b,
            (Bool(a), Bool(b)) => a == b,
            (Str(a), Str(b)) => a == b,
            (Object(a), Object(b)) => Arc::ptr_eq(a, b),
            (Delegate(a), Delegate(b)) => a.ptr_eq(b),
            (Method(a), Method(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Void => f.write_str("void"),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(x) => write!(f, "{:?}", x),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Object(_) => f.write_str("<object>"),
            Value::Delegate(d) => write!(f, "<delegate {}>", d.name()),
            Value::Method(m) => write!(f, "<method {}>", m.name()),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Value({})", self)
    }
}

/// Host types that can be pushed onto the operand stack
pub trait IntoValue {
    const TYPE: ValueType;
    fn into_value(self) -> Value;
}

/// Host types that can be taken off the operand stack
pub trait FromValue: Sized {
    const TYPE: ValueType;
    fn from_value(value: Value) -> Result<Self, VmError>;
}

macro_rules! int_value {
    ($($ty:ty),*) => {
        $(
            impl IntoValue for $ty {
                const TYPE: ValueType = ValueType::Int;
                fn into_value(self) -> Value {
                    Value::Int(<i64 as From<$ty>>::from(self))
                }
            }

            impl FromValue for $ty {
                const TYPE: ValueType = ValueType::Int;
                fn from_value(value: Value) -> Result<Self, VmError> {
                    match value {
                        Value::Int(n) => <$ty as NumCast>::from(n).ok_or(VmError::IntOutOfRange {
                            value: n,
                            target: stringify!($ty),
                        }),
                        other => Err(other.mismatch(ValueType::Int)),
                    }
                }
            }
        )*
    };
}

int_value!(i8, i16, i32, i64, u8, u16, u32);

impl IntoValue for f64 {
    const TYPE: ValueType = ValueType::Float;
    fn into_value(self) -> Value {
        Value::Float(self)
    }
}

impl FromValue for f64 {
    const TYPE: ValueType = ValueType::Float;
    fn from_value(value: Value) -> Result<Self, VmError> {
        match value {
            Value::Float(x) => Ok(x),
            other => Err(other.mismatch(ValueType::Float)),
        }
    }
}

impl IntoValue for bool {
    const TYPE: ValueType = ValueType::Bool;
    fn into_value(self) -> Value {
        Value::Bool(self)
    }
}

impl FromValue for bool {
    const TYPE: ValueType = ValueType::Bool;
    fn from_value(value: Value) -> Result<Self, VmError> {
        match value {
            Value::Bool(b) => Ok(b),
            other => Err(other.mismatch(ValueType::Bool)),
        }
    }
}

impl IntoValue for String {
    const TYPE: ValueType = ValueType::Str;
    fn into_value(self) -> Value {
        Value::Str(Arc::from(self))
    }
}

impl IntoValue for &str {
    const TYPE: ValueType = ValueType::Str;
    fn into_value(self) -> Value {
        Value::Str(Arc::from(self))
    }
}

impl FromValue for String {
    const TYPE: ValueType = ValueType::Str;
    fn from_value(value: Value) -> Result<Self, VmError> {
        match value {
            Value::Str(s) => Ok(s.to_string()),
            other => Err(other.mismatch(ValueType::Str)),
        }
    }
}

impl IntoValue for () {
    const TYPE: ValueType = ValueType::Void;
    fn into_value(self) -> Value {
        Value::Void
    }
}

impl FromValue for () {
    const TYPE: ValueType = ValueType::Void;
    fn from_value(value: Value) -> Result<Self, VmError> {
        match value {
            Value::Void => Ok(()),
            other => Err(other.mismatch(ValueType::Void)),
        }
    }
}

impl IntoValue for DelegateRef {
    const TYPE: ValueType = ValueType::Delegate;
    fn into_value(self) -> Value {
        Value::Delegate(self)
    }
}

impl FromValue for DelegateRef {
    const TYPE: ValueType = ValueType::Delegate;
    fn from_value(value: Value) -> Result<Self, VmError> {
        match value {
            Value::Delegate(d) => Ok(d),
            other => Err(other.mismatch(ValueType::Delegate)),
        }
    }
}

impl IntoValue for MethodRef {
    const TYPE: ValueType = ValueType::Method;
    fn into_value(self) -> Value {
        Value::Method(self)
    }
}

impl FromValue for MethodRef {
    const TYPE: ValueType = ValueType::Method;
    fn from_value(value: Value) -> Result<Self, VmError> {
        match value {
            Value::Method(m) => Ok(m),
            other => Err(other.mismatch(ValueType::Method)),
        }
    }
}

impl IntoValue for Value {
    const TYPE: ValueType = ValueType::Any;
    fn into_value(self) -> Value {
        self
    }
}

impl FromValue for Value {
    const TYPE: ValueType = ValueType::Any;
    fn from_value(value: Value) -> Result<Self, VmError> {
        Ok(value)
    }
}
