//! Editable view of a method body.
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::fmt;
use std::rc::Rc;

use log::debug;

use crate::cursor::Cursor;
use crate::il::{BodyError, Instr, Label, MethodBody, MethodRef};
use crate::refstore::{Handle, Reference, ReferenceStore};

type Hook = Box<dyn FnOnce()>;

struct Inner {
    body: RefCell<MethodBody>,
    disposed: Cell<bool>,
    hooks: RefCell<Vec<Hook>>,
}

impl Inner {
    fn dispose(&self) {
        if self.disposed.replace(true) {
            return;
        }
        let hooks = self.hooks.take();
        debug!(
            "disposing context for {} ({} hooks)",
            self.body.borrow().name,
            hooks.len()
        );
        for hook in hooks {
            hook();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// An editable method body plus the cleanup to run when editing is over.
///
/// Cursors created from a context share it. Disposing the context runs its
/// dispose hooks, which release every reference bound through it; cursors
/// must not be used afterwards. Dropping the last handle to the context
/// disposes it as well.
#[derive(Clone)]
pub struct Context(Rc<Inner>);

impl Context {
    pub fn new(body: MethodBody) -> Self {
        Context(Rc::new(Inner {
            body: RefCell::new(body),
            disposed: Cell::new(false),
            hooks: RefCell::new(vec![]),
        }))
    }

    /// Start editing a copy of an existing method.
    pub fn from_method(method: &MethodRef) -> Self {
        Self::new(method.to_body())
    }

    /// A cursor positioned at the start of the stream
    pub fn cursor(&self) -> Cursor {
        let first = self.body().get(0).cloned();
        Cursor::new(self.clone(), first)
    }

    /// Panics if the context has been disposed.
    pub fn body(&self) -> Ref<MethodBody> {
        self.check_live();
        self.0.body.borrow()
    }

    pub(crate) fn body_mut(&self) -> RefMut<MethodBody> {
        self.check_live();
        self.0.body.borrow_mut()
    }

    pub fn define_label(&self) -> Label {
        self.body_mut().define_label()
    }

    pub fn incoming_labels(&self, instr: Option<&Instr>) -> Vec<Label> {
        self.body().incoming_labels(instr)
    }

    /// Register `hook` to run when the context is disposed. Hooks run once,
    /// in registration order.
    pub fn on_dispose(&self, hook: impl FnOnce() + 'static) {
        self.check_live();
        self.0.hooks.borrow_mut().push(Box::new(hook));
    }

    /// Store `value` in the global table for `T`. The handle is released
    /// when the context is disposed.
    pub fn add_reference<T: Reference>(&self, value: T) -> Handle {
        let handle = ReferenceStore::<T>::global().store(value);
        self.on_dispose(move || ReferenceStore::<T>::global().release(handle));
        handle
    }

    /// Freeze the current stream. The context stays usable, and references
    /// bound so far stay alive until it is disposed.
    pub fn generate(&self) -> Result<MethodRef, BodyError> {
        self.body().generate()
    }

    pub fn is_disposed(&self) -> bool {
        self.0.disposed.get()
    }

    /// Run the dispose hooks now, even if cursors on this context are still
    /// around.
    pub fn dispose(self) {
        self.0.dispose();
    }

    pub(crate) fn ptr_eq(&self, other: &Context) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    fn check_live(&self) {
        if self.is_disposed() {
            panic!("use of disposed context");
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Context({}, disposed: {})",
            self.0.body.borrow().name,
            self.is_disposed()
        )
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::Context;
    use crate::delegate::Signature;
    use crate::il::value::{Value, ValueType};
    use crate::il::{MethodBody, OpCode};
    use crate::refstore::ReferenceStore;

    fn context() -> Context {
        let mut body = MethodBody::new("f", Signature::new(vec![], ValueType::Int));
        body.emit(OpCode::Ldc, Value::Int(1)).emit(OpCode::Ret, ());
        Context::new(body)
    }

    #[test]
    fn hooks_run_once_in_order() {
        let log = Rc::new(RefCell::new(vec![]));
        let ctx = context();
        for i in 0..3 {
            let log = log.clone();
            ctx.on_dispose(move || log.borrow_mut().push(i));
        }
        let other = ctx.clone();
        ctx.dispose();
        assert!(other.is_disposed());
        assert_eq!(*log.borrow(), vec![0, 1, 2]);
        drop(other);
        assert_eq!(*log.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn drop_disposes() {
        let ran = Rc::new(RefCell::new(false));
        {
            let ctx = context();
            let ran = ran.clone();
            ctx.on_dispose(move || *ran.borrow_mut() = true);
        }
        assert!(*ran.borrow());
    }

    #[test]
    fn references_live_until_dispose() {
        #[derive(Clone, Debug, PartialEq)]
        struct Payload(&'static str);
        impl crate::il::value::IntoValue for Payload {
            const TYPE: ValueType = ValueType::Object;
            fn into_value(self) -> Value {
                Value::object(self)
            }
        }

        let ctx = context();
        let handle = ctx.add_reference(Payload("data"));
        let method = ctx.generate().unwrap();
        assert_eq!(method.invoke(vec![]).unwrap(), Value::Int(1));
        assert_eq!(
            ReferenceStore::<Payload>::global().try_fetch(handle),
            Some(Payload("data"))
        );
        ctx.dispose();
        assert_eq!(ReferenceStore::<Payload>::global().try_fetch(handle), None);
    }

    #[test]
    #[should_panic(expected = "disposed context")]
    fn cursor_after_dispose_panics() {
        let ctx = context();
        let mut cursor = ctx.cursor();
        ctx.dispose();
        cursor.emit(OpCode::Nop, ());
    }
}
