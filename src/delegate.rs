//! Typed host callbacks that can be invoked from generated code.
use std::any::type_name;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::il::value::{FromValue, IntoValue, Value, ValueType};
use crate::vm::VmError;

/// Parameter and return types of a callable
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Signature {
    pub params: Vec<ValueType>,
    pub ret: ValueType,
}

impl Signature {
    pub fn new(params: Vec<ValueType>, ret: ValueType) -> Self {
        Signature { params, ret }
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }

    pub fn returns_value(&self) -> bool {
        self.ret != ValueType::Void
    }

    /// Check `args` against the parameter list.
    pub fn check_args(&self, callee: &str, args: &[Value]) -> Result<(), VmError> {
        if args.len() != self.params.len() {
            return Err(VmError::ArityMismatch {
                callee: callee.into(),
                expected: self.params.len(),
                found: args.len(),
            });
        }
        for (param, arg) in self.params.iter().zip(args) {
            if !param.accepts(arg.value_type()) {
                return Err(arg.mismatch(*param));
            }
        }
        Ok(())
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("(")?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", param)?;
        }
        write!(f, ") -> {}", self.ret)
    }
}

/// A host callable with a fixed signature
pub trait Callable: Send + Sync {
    fn name(&self) -> &str;
    fn signature(&self) -> Signature;
    fn invoke(&self, args: Vec<Value>) -> Result<Value, VmError>;
}

/// Shared reference to a host callable, as stored on the operand stack and in
/// reference tables.
#[derive(Clone)]
pub struct DelegateRef(Arc<dyn Callable>);

impl DelegateRef {
    pub fn new<F, Args>(f: F) -> Self
    where
        F: IntoDelegate<Args>,
    {
        f.into_delegate()
    }

    pub fn from_callable<C: Callable + 'static>(callable: C) -> Self {
        DelegateRef(Arc::new(callable))
    }

    pub fn name(&self) -> &str {
        self.0.name()
    }

    pub fn signature(&self) -> Signature {
        self.0.signature()
    }

    pub fn invoke(&self, args: Vec<Value>) -> Result<Value, VmError> {
        self.0.invoke(args)
    }

    pub fn ptr_eq(&self, other: &DelegateRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Address of the shared callable, stable for the lifetime of the
    /// reference.
    pub fn address(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl fmt::Debug for DelegateRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DelegateRef({} {})", self.name(), self.signature())
    }
}

/// Conversion of host closures into delegates, `Args` being the tuple of
/// parameter types.
pub trait IntoDelegate<Args> {
    fn into_delegate(self) -> DelegateRef;
}

struct FnDelegate<F, Args> {
    f: F,
    name: &'static str,
    _args: PhantomData<fn(Args)>,
}

macro_rules! delegate_arity {
    ($($arg:ident $var:ident),*) => {
        impl<F, R, $($arg),*> Callable for FnDelegate<F, ($($arg,)*)>
        where
            F: Fn($($arg),*) -> R + Send + Sync + 'static,
            R: IntoValue,
            $($arg: FromValue,)*
        {
            fn name(&self) -> &str {
                self.name
            }

            fn signature(&self) -> Signature {
                Signature::new(vec![$($arg::TYPE),*], R::TYPE)
            }

            #[allow(unused_mut, unused_variables)]
            fn invoke(&self, args: Vec<Value>) -> Result<Value, VmError> {
                self.signature().check_args(self.name, &args)?;
                let mut args = args.into_iter();
                $(let $var = $arg::from_value(args.next().ok_or(VmError::StackUnderflow)?)?;)*
                Ok((self.f)($($var),*).into_value())
            }
        }

        impl<F, R, $($arg),*> IntoDelegate<($($arg,)*)> for F
        where
            F: Fn($($arg),*) -> R + Send + Sync + 'static,
            R: IntoValue + 'static,
            $($arg: FromValue + 'static,)*
        {
            fn into_delegate(self) -> DelegateRef {
                DelegateRef(Arc::new(FnDelegate::<F, ($($arg,)*)> {
                    f: self,
                    name: type_name::<F>(),
                    _args: PhantomData,
                }))
            }
        }
    };
}

delegate_arity!();
delegate_arity!(A a);
delegate_arity!(A a, B b);
delegate_arity!(A a, B b, C c);
delegate_arity!(A a, B b, C c, D d);
delegate_arity!(A a, B b, C c, D d, E e);
delegate_arity!(A a, B b, C c, D d, E e, G g);
